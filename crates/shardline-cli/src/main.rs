//! # Shardline CLI
//!
//! Operator tool for inspecting and exercising a Shardline configuration.
//!
//! ## Usage
//!
//! ```bash
//! # Show databases, shards and routers
//! shardline --config shardline.toml shards
//!
//! # Where does article 22 live?
//! shardline route articles 22
//!
//! # Validate a configuration file
//! shardline --config shardline.toml check-config
//!
//! # Run the demo against the in-memory engine
//! shardline demo
//! ```

use colored::Colorize;
use serde::{Deserialize, Serialize};
use shardline_core::{EntityType, Hints, RecordId, ShardId, ShardingKey};
use shardline_storage::config::ShardlineConfig;
use shardline_storage::{logging, Entity, KeyPolicy, Shardline};
use std::process::ExitCode;

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();
    let (config_path, rest) = split_config_flag(args.get(1..).unwrap_or_default());

    let result = match rest.first().map(|s| s.as_str()) {
        Some("--help") | Some("-h") | None => {
            print_help();
            Ok(())
        }
        Some("print-config") => load(config_path.as_deref()).and_then(|c| print_config(&c)),
        Some("check-config") => load(config_path.as_deref()).and_then(check_config),
        Some("shards") => open(config_path.as_deref()).map(|s| print_shards(&s)),
        Some("route") => open(config_path.as_deref()).and_then(|s| route(&s, &rest[1..])),
        Some("register-key") => {
            open(config_path.as_deref()).and_then(|s| register_key(&s, &rest[1..]))
        }
        Some("demo") => open(config_path.as_deref()).and_then(|s| run_demo(&s)),
        Some(other) => Err(format!("unknown command '{}', see --help", other)),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}: {}", "Error".red(), e);
            ExitCode::FAILURE
        }
    }
}

fn print_help() {
    println!("{}", "Shardline v0.1.0".bold().cyan());
    println!("Multi-database routing and sharding\n");
    println!("USAGE:");
    println!("    shardline [--config <PATH>] <COMMAND>\n");
    println!("COMMANDS:");
    println!("    shards                      List databases, roles, shards and routers");
    println!("    route <TYPE> [KEY]          Show the database serving an entity type");
    println!("    check-config                Validate the configuration");
    println!("    print-config                Print the effective configuration as TOML");
    println!("    register-key <TYPE> <KEY> <SHARD>");
    println!("                                Assign a new key under the explicit strategy");
    println!("    demo                        Create sample articles and show their placement");
    println!("    --help, -h                  Show this help message\n");
    println!("ENVIRONMENT:");
    println!("    SHARDLINE_LOG               Log filter (e.g. debug)");
    println!("    SHARDLINE__*                Configuration overrides");
}

/// Splits `--config <PATH>` out of the arguments.
fn split_config_flag(args: &[String]) -> (Option<String>, Vec<String>) {
    let mut path = None;
    let mut rest = Vec::new();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" | "-c" => path = iter.next().cloned(),
            _ => rest.push(arg.clone()),
        }
    }
    (path, rest)
}

fn load(path: Option<&str>) -> Result<ShardlineConfig, String> {
    let config = ShardlineConfig::load(path).map_err(|e| e.to_string())?;
    logging::init_from_config(&config.logging);
    Ok(config)
}

fn open(path: Option<&str>) -> Result<Shardline, String> {
    let config = load(path)?;
    Shardline::open(config).map_err(|e| e.to_string())
}

fn parse_key(raw: &str) -> ShardingKey {
    match raw.parse::<i64>() {
        Ok(v) => ShardingKey::Int(v),
        Err(_) => ShardingKey::Str(raw.to_string()),
    }
}

fn print_config(config: &ShardlineConfig) -> Result<(), String> {
    let mut redacted = config.clone();
    for db in redacted.databases.values_mut() {
        if !db.password.is_empty() {
            db.password = "***".to_string();
        }
    }
    let toml = redacted.to_toml().map_err(|e| e.to_string())?;
    print!("{}", toml);
    Ok(())
}

fn check_config(config: ShardlineConfig) -> Result<(), String> {
    config.validate().map_err(|e| e.to_string())?;
    let shardline = Shardline::open(config).map_err(|e| e.to_string())?;
    println!(
        "{} {} databases, {} shards, {}",
        "✓".green(),
        shardline.registry().aliases().len(),
        shardline.registry().shards().len(),
        shardline.registry().strategy().describe()
    );
    Ok(())
}

fn print_shards(shardline: &Shardline) {
    let registry = shardline.registry();

    println!("{}", "Databases".bold());
    for (alias, db) in registry.databases() {
        let name = db.physical_name(registry.environment());
        println!(
            "  {:<16} {} {}@{}:{} ({})",
            alias.as_str().cyan(),
            name,
            if db.user.is_empty() { "-" } else { db.user.as_str() },
            db.host,
            db.port,
            db.engine
        );
    }

    println!("\n{}", "Roles".bold());
    for role in shardline.config().roles.keys() {
        if let Ok(alias) = registry.role_database(role) {
            println!("  {:<16} {}", role.yellow(), alias);
        }
    }

    println!("\n{}", "Shards".bold());
    for (i, shard) in registry.shards().iter().enumerate() {
        println!("  [{}] {}", i, shard.as_str().cyan());
    }
    println!("  strategy: {}", registry.strategy().describe());

    println!("\n{}", "Routers".bold());
    for router in shardline.chain().routers() {
        let types: Vec<String> = router.owned_types().iter().map(|t| t.to_string()).collect();
        let shards: Vec<&str> = router.shards().iter().map(ShardId::as_str).collect();
        println!(
            "  {:<16} {} -> {}",
            router.name().yellow(),
            types.join(", "),
            shards.join(", ")
        );
    }
    if let Some(default) = shardline.chain().default_database() {
        println!("  {:<16} * -> {}", "(default)".dimmed(), default);
    }
}

fn route(shardline: &Shardline, args: &[String]) -> Result<(), String> {
    let entity_type = args
        .first()
        .map(|t| EntityType::new(t.as_str()))
        .ok_or("usage: route <TYPE> [KEY]")?;
    let hints = Hints::from_key(args.get(1).map(|k| parse_key(k)));

    let chain = shardline.chain();
    let read = chain
        .database_for_read(&entity_type, &hints)
        .map_err(|e| e.to_string())?;
    let write = chain
        .database_for_write(&entity_type, &hints)
        .map_err(|e| e.to_string())?;
    let owner = chain
        .owner(&entity_type)
        .map(|r| r.name().to_string())
        .unwrap_or_else(|| "(default)".to_string());

    println!("entity type: {}", entity_type.to_string().cyan());
    match hints.sharding_key() {
        Some(key) => println!("key:         {}", key),
        None => println!("key:         {}", "none (first shard)".dimmed()),
    }
    println!("router:      {}", owner.yellow());
    println!("read:        {}", read.as_str().green());
    println!("write:       {}", write.as_str().green());
    Ok(())
}

fn register_key(shardline: &Shardline, args: &[String]) -> Result<(), String> {
    let (entity_type, key, shard) = match args {
        [t, k, s, ..] => (EntityType::new(t.as_str()), parse_key(k), ShardId::new(s.as_str())),
        _ => return Err("usage: register-key <TYPE> <KEY> <SHARD>".to_string()),
    };

    shardline
        .register_key(&entity_type, key.clone(), shard.clone())
        .map_err(|e| e.to_string())?;
    println!("{} {} -> {}", "✓".green(), key, shard);

    // The memory engine forgets registrations on exit; show the config entry.
    println!("\nAdd to [sharding.strategy] to keep it:\n");
    println!("[[sharding.strategy.mapping]]");
    match &key {
        ShardingKey::Int(v) => println!("key = {}", v),
        ShardingKey::Str(s) => println!("key = {:?}", s),
    }
    println!("shard = {:?}", shard.as_str());
    Ok(())
}

// =============================================================================
// Demo
// =============================================================================

#[derive(Debug, Serialize, Deserialize)]
struct DemoArticle {
    id: Option<u64>,
    title: String,
}

impl Entity for DemoArticle {
    fn entity_type() -> EntityType {
        EntityType::new("articles")
    }
    fn key_policy() -> KeyPolicy {
        KeyPolicy::Sequential
    }
    fn record_id(&self) -> Option<RecordId> {
        self.id.map(RecordId::from)
    }
    fn sharding_key(&self) -> Option<ShardingKey> {
        self.id.and_then(|id| ShardingKey::try_from(id).ok())
    }
    fn assign_key(&mut self, key: u64) {
        self.id = Some(key);
    }
}

fn run_demo(shardline: &Shardline) -> Result<(), String> {
    let articles = shardline
        .repository::<DemoArticle>()
        .map_err(|e| e.to_string())?;
    if !articles.is_sharded() {
        return Err("the demo needs a sharded 'articles' router".to_string());
    }

    println!("{}", "Creating 22 articles...".bold());
    for i in 1..=22 {
        let created = articles
            .create(DemoArticle {
                id: None,
                title: format!("Article {}", i),
            })
            .map_err(|e| e.to_string())?;
        if let Some(key) = created.sharding_key() {
            let shard = articles.shard_for_key(&key).map_err(|e| e.to_string())?;
            println!("  {:>3} {} {}", key, "->".dimmed(), shard.as_str().cyan());
        }
    }

    println!("\n{}", "Per-shard counts".bold());
    let entity_type = DemoArticle::entity_type();
    for shard in shardline.registry().shards() {
        let count = shardline
            .pool()
            .get(shard)
            .and_then(|c| c.count(&entity_type))
            .map_err(|e| e.to_string())?;
        println!("  {:<16} {}", shard.as_str(), count);
    }

    let default_view = articles.list(None).map_err(|e| e.to_string())?;
    let total = articles.count_all().map_err(|e| e.to_string())?;
    println!(
        "\nKey-less query sees {} of {} articles (first shard only)",
        default_view.len().to_string().yellow(),
        total
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_split_config_flag() {
        let (path, rest) = split_config_flag(&strings(&["--config", "a.toml", "route", "articles"]));
        assert_eq!(path.as_deref(), Some("a.toml"));
        assert_eq!(rest, strings(&["route", "articles"]));

        let (path, rest) = split_config_flag(&strings(&["shards"]));
        assert_eq!(path, None);
        assert_eq!(rest, strings(&["shards"]));
    }

    #[test]
    fn test_parse_key() {
        assert_eq!(parse_key("22"), ShardingKey::Int(22));
        assert_eq!(parse_key("-1"), ShardingKey::Int(-1));
        assert_eq!(parse_key("sports"), ShardingKey::Str("sports".to_string()));
    }

    #[test]
    fn test_route_and_demo_on_defaults() {
        let shardline = Shardline::open(ShardlineConfig::default()).unwrap();
        route(&shardline, &strings(&["articles", "22"])).unwrap();
        assert!(route(&shardline, &strings(&["articles", "tech"])).is_err());
        assert!(route(&shardline, &[]).is_err());
        run_demo(&shardline).unwrap();
    }

    #[test]
    fn test_register_key_needs_explicit_strategy() {
        let shardline = Shardline::open(ShardlineConfig::default()).unwrap();
        assert!(register_key(&shardline, &strings(&["articles", "9", "articles_a_db"])).is_err());
        assert!(register_key(&shardline, &strings(&["articles"])).is_err());
    }
}

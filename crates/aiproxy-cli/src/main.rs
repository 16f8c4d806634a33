//! aiproxy-cli: a thin operator CLI wiring `aiproxy-core`'s group/key
//! lifecycle, task engine, and log aggregation over a SQLite-backed store,
//! for local smoke-testing (mirrors how `mockforge-cli` is a thin binary
//! over the `mockforge-core` library).

use aiproxy_core::channel::StaticChannelRegistry;
use aiproxy_core::config::CoreConfig;
use aiproxy_core::db::{DbPool, RelationalStore};
use aiproxy_core::encryption::EncryptionService;
use aiproxy_core::group_manager::GroupManager;
use aiproxy_core::group_service::{
    DbBoundSiteChecker, GroupService, NullChildGroupsCache, NullGroupDeletedSink,
};
use aiproxy_core::health::NullHealthMetricsSink;
use aiproxy_core::key_provider::KeyProvider;
use aiproxy_core::log_service::{LogFilter, LogService};
use aiproxy_core::model::{CreateGroupParams, GroupType};
use aiproxy_core::task::TaskService;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "aiproxy")]
#[command(about = "Operator CLI for the aiproxy group/key/log core")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Set log level (error, warn, info, debug, trace)
    #[arg(short = 'v', long, global = true, default_value = "info")]
    log_level: String,

    /// SQLite database file; `:memory:` for an ephemeral store
    #[arg(long, global = true, default_value = ":memory:")]
    db: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply the bundled SQLite migrations to `--db` and exit
    Migrate,
    /// Create a standard group
    CreateGroup {
        name: String,
        #[arg(long, default_value = "openai")]
        channel_type: String,
        #[arg(long, default_value = "gpt-4")]
        test_model: String,
    },
    /// List every group, sorted the way the Group Manager orders them
    ListGroups,
    /// Print one group's key/request statistics
    Stats { group_id: i64 },
    /// Export request logs matching an optional group-name filter as CSV
    ExportLogs {
        #[arg(long)]
        group_name: Option<String>,
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .connect(&cli.db)
        .await
        .with_context(|| format!("connecting to sqlite database at {}", cli.db))?;

    if matches!(cli.command, Commands::Migrate) {
        run_migrations(&pool).await?;
        println!("migrations applied");
        return Ok(());
    }
    // every other subcommand assumes the schema already exists.
    let db = Arc::new(RelationalStore::new(DbPool::Sqlite(pool)));
    let config = CoreConfig::from_env();
    let (encryption, _master_key) = EncryptionService::generate();
    let encryption = Arc::new(encryption);
    let manager = GroupManager::new(db.clone(), config.adaptive_cache);
    let key_provider = KeyProvider::new();
    let tasks = TaskService::new();
    let channels = Arc::new(StaticChannelRegistry::new());
    let health = Arc::new(NullHealthMetricsSink);
    let bound_sites = DbBoundSiteChecker::new(db.clone());
    let child_groups_cache = Arc::new(NullChildGroupsCache);
    let group_deleted = Arc::new(NullGroupDeletedSink);

    let service = GroupService::new(
        db.clone(),
        manager,
        key_provider,
        tasks,
        encryption.clone(),
        channels,
        health,
        bound_sites,
        child_groups_cache,
        group_deleted,
        config,
    );

    match cli.command {
        Commands::Migrate => unreachable!("handled above"),
        Commands::CreateGroup {
            name,
            channel_type,
            test_model,
        } => {
            let group = service
                .create_group(CreateGroupParams {
                    name,
                    channel_type,
                    test_model: Some(test_model),
                    group_type: Some(GroupType::Standard),
                    upstreams: Some(serde_json::json!([
                        {"url": "https://api.example.com", "weight": 1}
                    ])),
                    ..Default::default()
                })
                .await?;
            println!("created group {} ({})", group.id, group.name);
        }
        Commands::ListGroups => {
            for group in service.list_groups().await? {
                println!(
                    "{:>5}  {:<24} {:<10} enabled={}",
                    group.id, group.name, group.channel_type, group.enabled
                );
            }
        }
        Commands::Stats { group_id } => {
            let stats = service.get_group_stats(group_id).await?;
            if let Some(keys) = stats.key_stats {
                println!(
                    "keys: total={} active={} invalid={}",
                    keys.total, keys.active, keys.invalid
                );
            }
            for (window, window_stats) in &stats.request_stats {
                println!(
                    "{window}: total={} failed={} failure_rate={:.4}",
                    window_stats.total,
                    window_stats.failed,
                    window_stats.failure_rate()
                );
            }
        }
        Commands::ExportLogs { group_name, output } => {
            let logs = LogService::new(db, encryption);
            let filter = LogFilter {
                group_name,
                ..Default::default()
            };
            let count = match output {
                Some(path) => {
                    let mut file = std::fs::File::create(&path)
                        .with_context(|| format!("creating {}", path.display()))?;
                    logs.export_to_csv(&mut file, &filter).await?
                }
                None => {
                    let mut stdout = std::io::stdout();
                    logs.export_to_csv(&mut stdout, &filter).await?
                }
            };
            eprintln!("wrote {count} rows");
        }
    }

    Ok(())
}

async fn run_migrations(pool: &sqlx::SqlitePool) -> Result<()> {
    let sql = include_str!("../../aiproxy-core/migrations/sqlite/0001_init.sql");
    for statement in sql.split(';').map(str::trim).filter(|s| !s.is_empty()) {
        sqlx::query(statement)
            .execute(pool)
            .await
            .with_context(|| format!("running migration statement: {statement}"))?;
    }
    Ok(())
}

fn init_tracing(log_level: &str) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::EnvFilter;

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

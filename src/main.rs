use std::process::ExitCode;
use std::sync::Arc;

use roster_sync::cache::{MemoryCache, RedisCache, RosterCache};
use roster_sync::catalog::StaticCatalog;
use roster_sync::config::{Config, StoreBackend};
use roster_sync::logging;
use roster_sync::predictor::{BktParams, BktPredictor};
use roster_sync::store::{DurableStore, FileStore, SqliteStore};
use roster_sync::sync::lease::{LeaseProvider, LocalLease, RedisLease};
use roster_sync::{RosterCoordinator, RosterError};

const USAGE: &str = "usage: roster-sync <bootstrap|checkpoint|reset|status>";

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("invalid configuration: {err}");
            return ExitCode::FAILURE;
        }
    };

    let _log_guard = match logging::init_tracing(&config.logging) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("failed to initialize logging: {err}");
            None
        }
    };

    let Some(command) = std::env::args().nth(1) else {
        eprintln!("{USAGE}");
        return ExitCode::FAILURE;
    };

    let coordinator = match build_coordinator(&config).await {
        Ok(coordinator) => coordinator,
        Err(err) => {
            tracing::error!(error = %err, "failed to wire roster coordinator");
            return ExitCode::FAILURE;
        }
    };

    let result = match command.as_str() {
        "bootstrap" => coordinator.bootstrap().await.map(|source| {
            println!("roster ready (source: {})", source.as_str());
        }),
        "checkpoint" => coordinator.checkpoint_roster().await.map(|version| {
            println!("checkpoint saved (version {version})");
        }),
        "reset" => coordinator.reset_roster().await.map(|snapshot| {
            println!(
                "roster reset: {} topics, version {}",
                snapshot.roster.skills().len(),
                snapshot.version
            );
        }),
        "status" => coordinator.current_snapshot().await.map(|snapshot| {
            println!("version {} saved at {}", snapshot.version, snapshot.saved_at);
            for (topic, skill) in snapshot.roster.skill_rosters() {
                println!("  {topic}: {} students", skill.len());
            }
        }),
        other => {
            eprintln!("unknown command {other:?}\n{USAGE}");
            return ExitCode::FAILURE;
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(command = %command, code = err.code(), error = %err, "roster command failed");
            ExitCode::FAILURE
        }
    }
}

async fn build_coordinator(config: &Config) -> Result<RosterCoordinator, RosterError> {
    let (cache, lease): (Arc<dyn RosterCache>, Arc<dyn LeaseProvider>) = match &config.redis_url {
        Some(url) => {
            let cache = RedisCache::connect(url)
                .await
                .map_err(|err| RosterError::Cache(err.into()))?;
            if !cache.is_connected().await {
                tracing::warn!("Redis did not answer PING, roster operations may fail");
            }
            let lease = RedisLease::open(url, config.lease.clone())?;
            tracing::info!(instance = %lease.instance_id(), "using Redis cache and lease");
            (Arc::new(cache), Arc::new(lease))
        }
        None => {
            tracing::warn!("REDIS_URL not set, cache lives only for this process");
            (Arc::new(MemoryCache::new()), Arc::new(LocalLease::new()))
        }
    };

    let store: Arc<dyn DurableStore> = match config.store.backend {
        StoreBackend::File => Arc::new(FileStore::new(&config.store.path)),
        StoreBackend::Sqlite => {
            Arc::new(SqliteStore::open(&config.store.path.join("roster.db")).await?)
        }
    };

    let catalog = StaticCatalog::parse_list(&config.topics);
    if catalog.is_empty() {
        tracing::warn!("ROSTER_TOPICS is empty, new rosters will have no topics");
    }

    Ok(RosterCoordinator::new(
        config.sync.clone(),
        cache,
        store,
        lease,
        Arc::new(catalog),
        Arc::new(BktPredictor::with_default(BktParams::default())),
    ))
}

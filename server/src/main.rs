use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use huddle_server::config::{generate_config_template, Config, StoreBackend};
use huddle_server::presence::sqlite::SqliteStore;
use huddle_server::state::AppState;
use huddle_server::{auth, db, routes};

/// How often expired presence rows are swept from SQLite.
const PRESENCE_PURGE_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load config with layered precedence: defaults < TOML < env < CLI
    let config = Config::load()?;

    // Handle --generate-config: print template and exit
    if config.generate_config {
        print!("{}", generate_config_template());
        return Ok(());
    }

    // Initialize tracing/logging
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("huddle_server=info,tower_http=info"));
    if config.json_logs {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().pretty().with_env_filter(filter).init();
    }

    tracing::info!("Huddle server v{} starting", env!("CARGO_PKG_VERSION"));

    // Initialize SQLite database
    let db = db::init_db(&config.data_dir)?;

    // Load or generate JWT signing key (256-bit random, stored in data_dir)
    let jwt_secret = auth::jwt::load_or_generate_jwt_secret(&config.data_dir)?;

    let app_state = AppState::build(&config, db.clone(), jwt_secret);
    let shutdown = CancellationToken::new();

    // Broadcasts persisted as scheduled survive restarts, even if their queue entry did not
    let reloaded = app_state.scheduler.reload_scheduled().await?;
    tracing::info!(
        reloaded,
        store = ?config.coordination_store,
        "Scheduler queue reconciled"
    );

    let scheduler_task = if config.scheduler.enabled {
        Some(app_state.scheduler.clone().spawn(shutdown.clone()))
    } else {
        tracing::info!("Broadcast scheduler disabled");
        None
    };

    if config.coordination_store == StoreBackend::Sqlite {
        let store = SqliteStore::new(db);
        let token = shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PRESENCE_PURGE_INTERVAL);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = store.purge_expired().await {
                            tracing::warn!(error = %e, "Presence purge failed");
                        }
                    }
                }
            }
        });
    }

    // Build router
    let app = routes::build_router(app_state);

    // Bind and serve
    let addr = format!("{}:{}", config.bind_address, config.port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    let signal_token = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
            tracing::info!("Shutdown requested");
            signal_token.cancel();
        })
        .await?;

    shutdown.cancel();
    if let Some(task) = scheduler_task {
        if let Err(e) = task.await {
            tracing::error!(error = %e, "Scheduler task failed");
        }
    }

    Ok(())
}

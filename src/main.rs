use chatsync::core::{AppState, Config};
use chatsync::create_router;
use chatsync::repositories::{MemoryStore, MySqlStore, Store};
use sqlx::mysql::MySqlPoolOptions;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // RUST_LOG ha la precedenza sul filtro di default
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("chatsync=info,tower_http=info")),
        )
        .init();

    // Inizializza la configurazione (legge anche .env)
    let config = Config::from_env()?;
    config.print_info();

    let store = match &config.database_url {
        Some(url) => {
            let pool = MySqlPoolOptions::new()
                .max_connections(config.max_connections)
                .connect(url)
                .await?;
            sqlx::migrate!().run(&pool).await?;
            info!("Connected to MySQL, migrations applied");
            Store::MySql(MySqlStore::new(pool))
        }
        None => {
            warn!("DATABASE_URL not set, messages are kept in memory only");
            Store::Memory(MemoryStore::new())
        }
    };

    let addr = format!("{}:{}", config.server_host, config.server_port);
    let sweep_every = config.typing_sweep_interval();
    let state = Arc::new(AppState::new(store, config));

    // lo sweeper chiude gli indicatori di scrittura abbandonati
    state.sync.spawn_typing_sweeper(sweep_every);

    let app = create_router(state);

    let listener = TcpListener::bind(&addr).await?;
    info!("Server listening on http://{}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}

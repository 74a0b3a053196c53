use std::sync::Arc;

use redis::Client as RedisClient;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sitehub_api::{
    config::{Config, StoreBackend},
    db::{self, schema::ensure_schema, MemoryTableStore, PgTableStore, TableStore},
    routes,
    services::{email::EmailService, grace_scheduler},
    AppState,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Arc::new(Config::from_env()?);

    let store: Arc<dyn TableStore> = match config.store_backend {
        StoreBackend::Postgres => {
            let url = config
                .database_url
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("DATABASE_URL is required for the postgres backend"))?;
            let pool = db::create_pool(url).await?;
            db::run_migrations(&pool).await?;
            info!("Database connected and migrations applied");
            Arc::new(PgTableStore::new(pool, config.schema_on_write))
        }
        StoreBackend::Memory => {
            warn!("Using the in-memory store; data is lost on restart");
            Arc::new(MemoryTableStore::new(config.schema_on_write))
        }
    };
    ensure_schema(store.as_ref()).await?;
    if config.schema_on_write {
        warn!("STORE_SCHEMA_ON_WRITE is on; unknown columns will be created on write");
    }

    let redis = match config.redis_url.as_deref() {
        Some(url) => {
            let conn = RedisClient::open(url)?
                .get_multiplexed_async_connection()
                .await?;
            info!("Redis connected");
            Some(conn)
        }
        None => {
            info!("REDIS_URL not set; rate limiting disabled");
            None
        }
    };

    let email = EmailService::new(&config).map(Arc::new);
    if email.is_some() {
        info!("SMTP email service configured");
    } else {
        info!("SMTP not configured; email features disabled");
    }

    grace_scheduler::start(store.clone(), email.clone());

    let state = AppState {
        store,
        redis,
        config: config.clone(),
        email,
    };
    let app = routes::router(state);

    let addr = format!("{}:{}", config.host, config.port);
    info!("sitehub API listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

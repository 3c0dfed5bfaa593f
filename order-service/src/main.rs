mod api;
mod consumer;
mod coordinator;
mod error;
mod models;
mod outbox;
mod rpc;
mod schema;
mod transition;

use std::time::Duration;

use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use diesel::{Connection, PgConnection};

const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

use anyhow::Result;
use clap::Parser;
use diesel_async::pooled_connection::bb8::Pool;
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_async::AsyncPgConnection;
use tracing::info;

use shared::events::INVENTORY_EVENTS;
use shared::{EventBus, Subscription};

#[derive(Parser)]
#[command(name = "order-service")]
struct Args {
    #[arg(long, env = "DB_HOST", default_value = "localhost")]
    db_host: String,

    #[arg(long, env = "DB_PORT", default_value = "5432")]
    db_port: u16,

    #[arg(long, env = "DB_NAME", default_value = "orders")]
    db_name: String,

    #[arg(long, env = "DB_USER", default_value = "postgres")]
    db_user: String,

    #[arg(long, env = "DB_PASSWORD", default_value = "password")]
    db_password: String,

    #[arg(long, env = "KAFKA_BROKERS", default_value = "localhost:9092")]
    kafka_brokers: String,

    #[arg(long, env = "HTTP_PORT", default_value = "3000")]
    http_port: u16,

    #[arg(long, env = "INVENTORY_SERVICE_HOST", default_value = "localhost")]
    inventory_host: String,

    #[arg(long, env = "INVENTORY_SERVICE_PORT", default_value = "50051")]
    inventory_port: u16,

    #[arg(long, env = "CATALOG_URL", default_value = "http://localhost:8081")]
    catalog_url: String,
}

impl Args {
    fn database_url(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.db_user, self.db_password, self.db_host, self.db_port, self.db_name
        )
    }

    fn inventory_endpoint(&self) -> String {
        format!("http://{}:{}", self.inventory_host, self.inventory_port)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    info!("Running database migrations...");
    let mut conn = PgConnection::establish(&args.database_url())?;
    conn.run_pending_migrations(MIGRATIONS)
        .map_err(|e| anyhow::anyhow!("Migration error: {}", e))?;
    info!("Migrations completed successfully");

    let config = AsyncDieselConnectionManager::<AsyncPgConnection>::new(&args.database_url());
    let pool = Pool::builder()
        .max_size(20)
        .connection_timeout(Duration::from_secs(5))
        .idle_timeout(Some(Duration::from_secs(30)))
        .build(config)
        .await?;

    let bus = EventBus::start(&args.kafka_brokers)?;
    let inventory = rpc::InventoryClient::connect_lazy(&args.inventory_endpoint())?;

    let pumper = outbox::OutboxPumper::new(pool.clone(), bus.clone());
    tokio::spawn(async move {
        pumper.run().await;
    });

    let subscription =
        Subscription::start(&args.kafka_brokers, "order-service-sub", &[INVENTORY_EVENTS])?;
    let event_consumer = consumer::InventoryEventConsumer::new(pool.clone());
    tokio::spawn(async move {
        event_consumer.run(subscription).await;
    });

    let state = api::AppState {
        coordinator: coordinator::Coordinator::new(pool.clone(), inventory.clone()),
        pool,
        bus,
        inventory,
        http: reqwest::Client::new(),
        catalog_url: args.catalog_url.trim_end_matches('/').to_string(),
    };

    let app = api::create_router(state);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", args.http_port)).await?;

    info!("order service listening on port {}", args.http_port);

    axum::serve(listener, app).await?;

    Ok(())
}

mod chaos;
mod error;
mod grpc;
mod models;
mod outbox;
mod schema;
mod stock;
mod verify;

use std::time::Duration;

use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use diesel::{Connection, PgConnection};

const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

use anyhow::Result;
use clap::Parser;
use diesel_async::pooled_connection::bb8::Pool;
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_async::AsyncPgConnection;
use tonic::transport::Server;
use tracing::{info, warn};

use shared::events::VERIFY_ORDERS;
use shared::proto::inventory_service_server::InventoryServiceServer;
use shared::{EventBus, Subscription};

#[derive(Parser)]
#[command(name = "inventory-service")]
struct Args {
    #[arg(long, env = "DB_HOST", default_value = "localhost")]
    db_host: String,

    #[arg(long, env = "DB_PORT", default_value = "5432")]
    db_port: u16,

    #[arg(long, env = "DB_NAME", default_value = "inventory")]
    db_name: String,

    #[arg(long, env = "DB_USER", default_value = "postgres")]
    db_user: String,

    #[arg(long, env = "DB_PASSWORD", default_value = "password")]
    db_password: String,

    #[arg(long, env = "KAFKA_BROKERS", default_value = "localhost:9092")]
    kafka_brokers: String,

    #[arg(long, env = "GRPC_PORT", default_value = "50051")]
    grpc_port: u16,
}

impl Args {
    fn database_url(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.db_user, self.db_password, self.db_host, self.db_port, self.db_name
        )
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
    let store = stock::StockStore::new(pool.clone());

    let chaos = chaos::ChaosConfig::from_env();
    if chaos.enabled() {
        warn!(?chaos, "chaos injection enabled");
    }

    let pumper = outbox::OutboxPumper::new(pool.clone(), bus.clone());
    tokio::spawn(async move {
        pumper.run().await;
    });

    let subscription =
        Subscription::start(&args.kafka_brokers, "inventory-service", &[VERIFY_ORDERS])?;
    let verifier = verify::VerifyOrderConsumer::new(store.clone());
    tokio::spawn(async move {
        verifier.run(subscription).await;
    });

    let service = grpc::InventoryGrpc::new(store, pool.clone(), bus.clone(), chaos);
    let addr = format!("0.0.0.0:{}", args.grpc_port).parse()?;

    info!("inventory service listening on port {}", args.grpc_port);

    Server::builder()
        .add_service(InventoryServiceServer::new(service))
        .serve(addr)
        .await?;

    Ok(())
}

mod schema;
mod models;
mod error;
mod store;
mod pg_store;
mod handlers;
mod outbox;
mod payments;
mod sweeper;
mod api;

use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use diesel::PgConnection;

const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

use anyhow::Result;
use chrono::{Duration, FixedOffset};
use clap::Parser;
use diesel::Connection;
use diesel_async::pooled_connection::{bb8::Pool, AsyncDieselConnectionManager};
use diesel_async::AsyncPgConnection;
use drum_ledger::{Ledger, PgStore, PgVendorStock};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::producer::FutureProducer;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::handlers::{OrderPolicy, OrderService};
use crate::outbox::{EventPublisher, KafkaPublisher, LogPublisher, OutboxProcessor};
use crate::store::{MemoryOrderStore, OrderStore};
use crate::sweeper::{ScheduleConfig, Scheduler};

#[derive(Parser)]
#[command(name = "order-service")]
struct Args {
    /// Without a database everything lives in process memory.
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Without brokers outbox events are written to the log.
    #[arg(long, env = "KAFKA_BROKERS")]
    kafka_brokers: Option<String>,

    #[arg(long, default_value = "gcash-payment-notices")]
    payment_topic: String,

    #[arg(long, env = "PORT", default_value = "3001")]
    port: u16,

    #[arg(long, env = "PAYMENT_WINDOW_MINUTES", default_value = "30")]
    payment_window_minutes: i64,

    #[arg(long, env = "MIN_LEAD_HOURS", default_value = "24")]
    min_lead_hours: i64,

    #[arg(long, env = "REMINDER_LEAD_MINUTES", default_value = "10")]
    reminder_lead_minutes: i64,

    #[arg(long, env = "EXPIRY_SWEEP_SECS", default_value = "300")]
    expiry_sweep_secs: u64,

    #[arg(long, env = "REMINDER_SWEEP_SECS", default_value = "60")]
    reminder_sweep_secs: u64,

    #[arg(long, env = "RECONCILE_SECS", default_value = "3600")]
    reconcile_secs: u64,

    #[arg(long, env = "LEDGER_RETRY_SECS", default_value = "30")]
    ledger_retry_secs: u64,

    #[arg(long, env = "BUSINESS_UTC_OFFSET_HOURS", default_value = "8", allow_hyphen_values = true)]
    utc_offset_hours: i32,
}

impl Args {
    fn policy(&self) -> Result<OrderPolicy> {
        let business_offset = FixedOffset::east_opt(self.utc_offset_hours * 3600)
            .ok_or_else(|| anyhow::anyhow!("invalid UTC offset: {} hours", self.utc_offset_hours))?;
        Ok(OrderPolicy {
            payment_window: Duration::minutes(self.payment_window_minutes),
            min_lead_time: Duration::hours(self.min_lead_hours),
            reminder_lead: Duration::minutes(self.reminder_lead_minutes),
            business_offset,
        })
    }

    fn schedule(&self) -> ScheduleConfig {
        ScheduleConfig {
            expiry_every: std::time::Duration::from_secs(self.expiry_sweep_secs),
            reminder_every: std::time::Duration::from_secs(self.reminder_sweep_secs),
            reconcile_every: std::time::Duration::from_secs(self.reconcile_secs),
            ledger_retry_every: std::time::Duration::from_secs(self.ledger_retry_secs),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();
    let policy = args.policy()?;

    let (order_store, ledger): (Arc<dyn OrderStore>, Ledger) = match &args.database_url {
        Some(database_url) => {
            // Run migrations first
            info!("Running database migrations...");
            let mut conn = PgConnection::establish(database_url)?;
            conn.run_pending_migrations(MIGRATIONS).map_err(|e| anyhow::anyhow!("Migration error: {}", e))?;
            info!("Migrations completed successfully");

            let config = AsyncDieselConnectionManager::<AsyncPgConnection>::new(database_url);
            let pool = Pool::builder().build(config).await?;

            let ledger = Ledger::new(
                Arc::new(PgStore::new(pool.clone())),
                Arc::new(PgVendorStock::new(pool.clone())),
            );
            let order_store: Arc<dyn OrderStore> = Arc::new(pg_store::PgOrderStore::new(pool));
            (order_store, ledger)
        }
        None => {
            warn!("DATABASE_URL not set, keeping orders and drum ledger in memory");
            let order_store: Arc<dyn OrderStore> = Arc::new(MemoryOrderStore::new());
            (order_store, Ledger::in_memory())
        }
    };

    let orders = Arc::new(OrderService::new(order_store.clone(), ledger, policy));

    let publisher: Arc<dyn EventPublisher> = match &args.kafka_brokers {
        Some(brokers) => {
            let producer: FutureProducer = ClientConfig::new()
                .set("bootstrap.servers", brokers)
                .set("message.timeout.ms", "5000")
                .create()?;

            let consumer: StreamConsumer = ClientConfig::new()
                .set("group.id", "order-service-payments")
                .set("bootstrap.servers", brokers)
                .set("enable.partition.eof", "false")
                .set("session.timeout.ms", "6000")
                .set("enable.auto.commit", "false")
                .create()?;
            consumer.subscribe(&[&args.payment_topic])?;

            let payment_handler = payments::PaymentNoticeHandler::new(orders.clone());
            tokio::spawn(async move {
                payment_handler.run(consumer).await;
            });

            Arc::new(KafkaPublisher::new(producer))
        }
        None => {
            warn!("KAFKA_BROKERS not set, logging notification events instead of publishing");
            Arc::new(LogPublisher)
        }
    };

    let outbox_processor = OutboxProcessor::new(order_store, publisher);
    let scheduler = Scheduler::new(orders.clone(), args.schedule());

    tokio::spawn(async move {
        outbox_processor.run().await;
    });

    tokio::spawn(async move {
        scheduler.run().await;
    });

    // Start the web server
    let app = api::create_router(api::AppState { orders });
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", args.port)).await?;

    info!("Order service web server started on port {}", args.port);

    axum::serve(listener, app).await?;

    Ok(())
}

//! Runs the overdue sweep against PostgreSQL until Ctrl-C.

mod config;

use std::sync::Arc;
use std::thread;

use anyhow::Context;
use tokio::runtime::Handle;
use tracing::{info, warn};

use orderflow_events::{EventBus, EventEnvelope, InMemoryEventBus};
use orderflow_infra::{
    BusNotifier, InterceptorChain, Notifier, NullNotifier, OrderNotification, OrderService,
    PostgresStore, SchedulerConfig,
};

use crate::config::WorkerConfig;

type NotificationBus = InMemoryEventBus<EventEnvelope<OrderNotification>>;

/// Log every notification published on `bus` until the bus is dropped.
fn spawn_notification_log(bus: &NotificationBus) -> std::io::Result<thread::JoinHandle<()>> {
    let subscription = bus.subscribe();
    thread::Builder::new()
        .name("notification-log".to_string())
        .spawn(move || {
            while let Ok(envelope) = subscription.recv() {
                let n = envelope.payload();
                info!(
                    event = %n.event,
                    reference = %n.reference,
                    status = %n.status,
                    targets = n.targets.len(),
                    "notification"
                );
            }
        })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = WorkerConfig::load().context("loading configuration")?;
    orderflow_observability::init(&config.log);
    info!("starting orderflow worker");

    let pool = PostgresStore::connect(&config.engine.database)
        .await
        .context("connecting to database")?;
    let store = PostgresStore::new(pool, Handle::current()).with_lock_wait(config.engine.locking.wait());
    store.migrate().await.context("running migrations")?;
    info!("database ready");

    let mut relay = None;
    let notifier: Arc<dyn Notifier> = if config.log_notifications {
        let bus = Arc::new(NotificationBus::new());
        relay = Some(spawn_notification_log(&bus)?);
        Arc::new(BusNotifier::new(bus))
    } else {
        Arc::new(NullNotifier)
    };

    // The store blocks on the runtime handle, so sync calls stay off the async workers.
    let engine = config.engine.clone();
    let service = tokio::task::spawn_blocking(move || {
        OrderService::new(Arc::new(store), engine, notifier, InterceptorChain::new())
    })
    .await
    .context("service start-up panicked")??;
    let service = Arc::new(service);

    let scheduler = service
        .scheduler()
        .spawn(SchedulerConfig::from_sweep(&config.engine.sweep))
        .context("spawning sweep scheduler")?;
    info!(
        interval_secs = config.engine.sweep.interval_secs,
        reminders = config.engine.sweep.remind_due_soon,
        "sweep scheduler running"
    );

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutdown requested");

    let stats = tokio::task::spawn_blocking(move || {
        let stats = scheduler.stats();
        scheduler.shutdown();
        drop(service);
        if let Some(relay) = relay {
            if relay.join().is_err() {
                warn!("notification log thread panicked");
            }
        }
        stats
    })
    .await
    .context("shutdown panicked")?;

    info!(
        runs = stats.runs,
        marked_overdue = stats.orders_marked_overdue,
        reminders = stats.reminders_sent,
        errors = stats.errors,
        "orderflow worker stopped"
    );
    Ok(())
}

use anyhow::Result;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod api;
mod config;
mod dbus_interface;
mod source;
mod store;
mod tracker;

use api::Api;
use config::{BusKind, Config};
use dbus_interface::{PresenceService, BUS_NAME, OBJECT_PATH};
use store::Ledger;
use tracker::{spawn_tracker, Tracker, TrackerSettings};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "presenced starting");

    let config = Config::load()?;
    tracing::info!(
        db = %config.db_path.display(),
        zone = config.zone_id,
        tracking = config.tracking_enabled,
        bus = ?config.bus,
        "configuration loaded"
    );

    let ledger = Arc::new(Ledger::open(&config.db_path, config.busy_timeout())?);
    let api = Arc::new(Api::new(ledger, config.zone_id, config.unknown_cooldown()));
    let (publisher, latest) = source::observation_channel();

    // The tracker writes through its own connection; SQLite arbitrates.
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let (stats, ticker) = if config.tracking_enabled {
        let tracker = Tracker::new(
            Ledger::open(&config.db_path, config.busy_timeout())?,
            latest,
            TrackerSettings {
                zone_id: config.zone_id,
                camera_id: config.camera_id,
                crop_padding: config.crop_padding,
                dedup_ttl: config.dedup_ttl(),
                unknown_cooldown: config.unknown_cooldown(),
            },
        );
        let handle = spawn_tracker(tracker)?;
        let stats = handle.stats();
        let ticker = tokio::spawn(handle.run(config.tick_interval(), async move {
            let _ = stop_rx.await;
        }));
        (Some(stats), Some(ticker))
    } else {
        tracing::info!("live tracking disabled");
        (None, None)
    };

    let service = PresenceService::new(
        api,
        publisher,
        stats,
        config.zone_id,
        tokio::runtime::Handle::current(),
    );
    let builder = match config.bus {
        BusKind::System => zbus::connection::Builder::system()?,
        BusKind::Session => zbus::connection::Builder::session()?,
    };
    let _connection = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await?;

    tracing::info!(name = BUS_NAME, path = OBJECT_PATH, "presenced ready");

    // Keep running until signaled
    tokio::signal::ctrl_c().await?;
    tracing::info!("presenced shutting down");

    let _ = stop_tx.send(());
    if let Some(ticker) = ticker {
        ticker.await?;
    }

    Ok(())
}

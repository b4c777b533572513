#[macro_use]
mod logging;

pub mod backend;
pub mod events;
pub mod io;
pub mod link;
pub mod settings;
pub mod status_server;

use std::time::Duration;

use crate::events::spawn_event_logger;
use crate::link::LinkManager;
use crate::settings::AppSettings;

// ============================================================================
// Application entry
// ============================================================================

/// Run one read session: connect, stream events to the configured consumers
/// for the configured duration (or until Ctrl-C), then shut down gracefully.
pub async fn run(settings: AppSettings) -> Result<(), String> {
    if let Some(dir) = settings.log_dir.as_deref() {
        let path = logging::init_file_logging(dir)?;
        tlog!("[app] Logging to {}", path.display());
    }

    tlog!(
        "[app] sensorlink {} on {} at {} baud ({})",
        env!("CARGO_PKG_VERSION"),
        settings.link.port,
        settings.link.baud_rate,
        settings.link.line.describe()
    );

    let manager = LinkManager::serial(settings.link.clone());
    let console = spawn_event_logger(manager.subscribe());

    let forwarder = if settings.backend.enabled {
        let client = backend::BackendClient::new(settings.backend.clone())?;
        Some(backend::spawn_forwarder(client, manager.subscribe()))
    } else {
        None
    };

    let status_server = if settings.status_server.enabled {
        let (_, handle) =
            status_server::spawn_status_server(&settings.status_server.bind, manager.clone())
                .await?;
        Some(handle)
    } else {
        None
    };

    if manager.check_connection().await {
        tlog!("[app] Starting data reading");
        read_until_interrupted(&manager, settings.link.read_duration()).await;
    } else {
        tlog!("[app] Failed to establish initial connection");
    }

    manager.shutdown().await;

    // Consumers stop on the shutdown event
    for handle in [Some(console), forwarder, status_server].into_iter().flatten() {
        if tokio::time::timeout(Duration::from_secs(2), handle).await.is_err() {
            tlog!("[app] A consumer did not stop in time");
        }
    }

    logging::stop_file_logging();
    Ok(())
}

async fn read_until_interrupted(manager: &LinkManager, duration: Option<Duration>) {
    let session = async {
        match duration {
            Some(d) => {
                manager.read_for(d).await;
            }
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        _ = session => tlog!("[app] Read session finished"),
        result = tokio::signal::ctrl_c() => match result {
            Ok(()) => tlog!("[app] Interrupt received, shutting down"),
            Err(e) => tlog!("[app] Failed to listen for Ctrl-C: {}", e),
        },
    }
}

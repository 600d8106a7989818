//! Headless dashboard runner.
//!
//! Reads backend credentials from the keyring (or `COMANDA_*` env vars),
//! restores the last session or logs in from `COMANDA_EMAIL` /
//! `COMANDA_PASSWORD`, then polls and logs the table board until Ctrl-C.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use tracing::{info, warn};

use comanda_pos_lib::notify::{LogNotifier, NotificationPermission};
use comanda_pos_lib::remote::SupabaseClient;
use comanda_pos_lib::tables::TableAlert;
use comanda_pos_lib::{db, logging, storage, AppState};

const BOARD_LOG_INTERVAL: Duration = Duration::from_secs(30);

fn log_board(state: &AppState) {
    let tables = state.tables();
    let occupied = tables.iter().filter(|t| t.is_occupied()).count();
    info!(
        occupied,
        total = tables.len(),
        last_sync = ?state.sync.last_sync(),
        "board"
    );
    for table in tables.iter().filter(|t| t.is_occupied()) {
        let alert = match table.alert {
            TableAlert::None => "",
            TableAlert::WaiterCall => "waiter",
            TableAlert::BillRequested => "bill",
        };
        info!(
            table = table.id,
            items = table.consumption.len(),
            total = table.consumption_total(),
            alert,
            "table"
        );
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let data_dir = logging::data_dir();
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("creating data dir {}", data_dir.display()))?;
    let _log_guard = logging::init_logging(&data_dir);
    info!(
        version = env!("CARGO_PKG_VERSION"),
        build = env!("BUILD_TIMESTAMP"),
        git = env!("BUILD_GIT_SHA"),
        data_dir = %data_dir.display(),
        "Comanda POS starting"
    );

    let config = storage::load_backend_config().map_err(|e| anyhow!(e))?;
    let remote = SupabaseClient::new(&config).map_err(|e| anyhow!(e))?;
    let db = db::init(&data_dir).map_err(|e| anyhow!(e))?;

    let state = Arc::new(AppState::new(
        Arc::new(remote),
        Arc::new(db),
        Arc::new(LogNotifier),
        config.restaurant_id.clone(),
        data_dir,
    ));
    state.set_notification_permission(NotificationPermission::Granted);

    if state.restore_session().is_none() {
        let email = std::env::var("COMANDA_EMAIL")
            .context("no saved session; set COMANDA_EMAIL and COMANDA_PASSWORD")?;
        let password = std::env::var("COMANDA_PASSWORD").context("COMANDA_PASSWORD is not set")?;
        let session = if std::env::var_os("COMANDA_ADMIN").is_some() {
            state.admin_login(&email, password).await
        } else {
            state.login(&email, password).await
        };
        session.context("login failed")?;
    }

    let mut ticker = tokio::time::interval(BOARD_LOG_INTERVAL);
    loop {
        tokio::select! {
            _ = ticker.tick() => log_board(&state),
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    warn!(error = %e, "ctrl-c handler failed");
                }
                break;
            }
        }
    }

    state.sync.stop();
    info!("Comanda POS stopped");
    Ok(())
}

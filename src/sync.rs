//! Polling synchronizer.
//!
//! While a session is authenticated a background task re-fetches orders,
//! products, users and the restaurant settings row on a fixed interval and
//! feeds them into [`AppState`], which reconciles the table board. A failed
//! fetch is logged and the next tick tries again; there is no backoff.
//!
//! Settings saves raise a suppression flag so a poll that races the save
//! cannot overwrite the optimistic value with the stale row. The flag is
//! cleared a fixed delay after the write completes. Each save bumps a
//! generation counter and only the timer of the latest save may clear it.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::app::AppState;
use crate::catalog::{parse_products, parse_users};
use crate::error::DashboardResult;
use crate::notify::{bill_request_message, new_order_message, waiter_call_message};
use crate::pedido::{parse_pedidos, Order};
use crate::remote::{ORDERS_TABLE, PRODUCTS_TABLE, SETTINGS_TABLE, USERS_TABLE};
use crate::settings::Settings;
use crate::tables::TableAlert;

pub const SYNC_INTERVAL: Duration = Duration::from_secs(2);
pub const SETTINGS_SUPPRESSION: Duration = Duration::from_secs(2);

pub struct SyncState {
    pub is_running: Arc<AtomicBool>,
    pub last_sync: Arc<Mutex<Option<DateTime<Utc>>>>,
    loop_generation: Arc<AtomicU64>,
    saving_settings: Arc<AtomicBool>,
    save_generation: Arc<AtomicU64>,
    /// Order ids seen by earlier polls. `None` until the first successful
    /// orders fetch, which only primes the set.
    seen_orders: Mutex<Option<HashSet<i64>>>,
}

impl Default for SyncState {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncState {
    pub fn new() -> Self {
        Self {
            is_running: Arc::new(AtomicBool::new(false)),
            last_sync: Arc::new(Mutex::new(None)),
            loop_generation: Arc::new(AtomicU64::new(0)),
            saving_settings: Arc::new(AtomicBool::new(false)),
            save_generation: Arc::new(AtomicU64::new(0)),
            seen_orders: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    pub fn last_sync(&self) -> Option<DateTime<Utc>> {
        *self.last_sync.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Signal the loop to exit after its current cycle.
    pub fn stop(&self) {
        if self.is_running.swap(false, Ordering::SeqCst) {
            info!("Sync loop stop requested");
        }
        self.loop_generation.fetch_add(1, Ordering::SeqCst);
        *self.seen_orders.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn is_suppressing_settings(&self) -> bool {
        self.saving_settings.load(Ordering::SeqCst)
    }

    /// Raise the suppression flag for a settings write; returns the save's
    /// generation for [`SyncState::finish_settings_save`].
    pub fn begin_settings_save(&self) -> u64 {
        self.saving_settings.store(true, Ordering::SeqCst);
        self.save_generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Clear the flag [`SETTINGS_SUPPRESSION`] from now unless a newer save
    /// started in the meantime.
    pub fn finish_settings_save(&self, generation: u64) {
        let saving = Arc::clone(&self.saving_settings);
        let latest = Arc::clone(&self.save_generation);
        tokio::spawn(async move {
            tokio::time::sleep(SETTINGS_SUPPRESSION).await;
            if latest.load(Ordering::SeqCst) == generation {
                saving.store(false, Ordering::SeqCst);
                debug!(generation, "settings poll suppression cleared");
            }
        });
    }

    /// Record a locally created order so the next poll does not announce it.
    pub fn mark_seen(&self, order_id: i64) {
        if let Some(seen) = self
            .seen_orders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_mut()
        {
            seen.insert(order_id);
        }
    }

    /// Ids of orders not present in any earlier poll. `None` on the priming
    /// poll.
    fn observe_orders(&self, orders: &[Order]) -> Option<Vec<i64>> {
        let mut guard = self.seen_orders.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.as_mut() {
            None => {
                *guard = Some(orders.iter().map(|o| o.id).collect());
                None
            }
            Some(seen) => Some(
                orders
                    .iter()
                    .filter(|o| seen.insert(o.id))
                    .map(|o| o.id)
                    .collect(),
            ),
        }
    }
}

/// Outcome of one poll cycle.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    pub orders: Option<usize>,
    pub products: Option<usize>,
    pub users: Option<usize>,
    pub settings_refreshed: bool,
    pub settings_suppressed: bool,
    pub new_orders: Vec<i64>,
    pub raised_alerts: Vec<(u32, TableAlert)>,
    pub errors: Vec<String>,
}

/// Start the background poll loop. Any loop started earlier exits at its
/// next check.
pub fn start_sync_loop(state: Arc<AppState>, interval: Duration) {
    let sync = &state.sync;
    let generation = sync.loop_generation.fetch_add(1, Ordering::SeqCst) + 1;
    sync.is_running.store(true, Ordering::SeqCst);
    let is_running = Arc::clone(&sync.is_running);
    let loop_generation = Arc::clone(&sync.loop_generation);

    tokio::spawn(async move {
        info!("Sync loop started (interval: {}ms)", interval.as_millis());
        loop {
            if !is_running.load(Ordering::SeqCst)
                || loop_generation.load(Ordering::SeqCst) != generation
            {
                info!("Sync loop stopped");
                break;
            }

            let report = run_sync_cycle(&state).await;
            if !report.errors.is_empty() {
                debug!(errors = report.errors.len(), "sync cycle finished with errors");
            }

            tokio::time::sleep(interval).await;
        }
    });
}

/// One poll: every fetch runs even when an earlier one failed.
pub async fn run_sync_cycle(state: &AppState) -> SyncReport {
    let mut report = SyncReport::default();
    let scope = [("restaurante_id", state.restaurant_id.clone())];

    match state.remote.select(ORDERS_TABLE, &scope).await {
        Ok(rows) => {
            let orders = parse_pedidos(&rows);
            report.orders = Some(orders.len());
            let fresh = state.sync.observe_orders(&orders);
            let raised = state.replace_orders(orders);
            if let Some(fresh) = fresh {
                report.new_orders = fresh;
                report.raised_alerts = raised;
            }
        }
        Err(e) => {
            warn!(table = ORDERS_TABLE, error = %e, "order fetch failed");
            report.errors.push(format!("{ORDERS_TABLE}: {e}"));
        }
    }

    match state.remote.select(PRODUCTS_TABLE, &scope).await {
        Ok(rows) => {
            let products = parse_products(&rows);
            report.products = Some(products.len());
            state.replace_products(products);
        }
        Err(e) => {
            warn!(table = PRODUCTS_TABLE, error = %e, "product fetch failed");
            report.errors.push(format!("{PRODUCTS_TABLE}: {e}"));
        }
    }

    match state.remote.select(USERS_TABLE, &scope).await {
        Ok(rows) => {
            let users = parse_users(&rows);
            report.users = Some(users.len());
            state.replace_users(users);
        }
        Err(e) => {
            warn!(table = USERS_TABLE, error = %e, "user fetch failed");
            report.errors.push(format!("{USERS_TABLE}: {e}"));
        }
    }

    if state.sync.is_suppressing_settings() {
        debug!("settings save in flight, skipping settings fetch");
        report.settings_suppressed = true;
    } else {
        match state
            .remote
            .select(SETTINGS_TABLE, &[("id", state.restaurant_id.clone())])
            .await
        {
            Ok(rows) => match rows.first() {
                // A save may have started while the fetch was in flight.
                Some(_) if state.sync.is_suppressing_settings() => {
                    report.settings_suppressed = true;
                }
                Some(row) => {
                    state.apply_polled_settings(Settings::from_remote(row));
                    report.settings_refreshed = true;
                }
                None => warn!(restaurant = %state.restaurant_id, "restaurant settings row missing"),
            },
            Err(e) => {
                warn!(table = SETTINGS_TABLE, error = %e, "settings fetch failed");
                report.errors.push(format!("{SETTINGS_TABLE}: {e}"));
            }
        }
    }

    *state
        .sync
        .last_sync
        .lock()
        .unwrap_or_else(PoisonError::into_inner) = Some(Utc::now());

    announce(state, &report);
    report
}

fn announce(state: &AppState, report: &SyncReport) {
    if report.new_orders.is_empty() && report.raised_alerts.is_empty() {
        return;
    }
    let orders = state.orders();
    let auto_print = state.settings().auto_print;

    for id in &report.new_orders {
        let Some(order) = orders.iter().find(|o| o.id == *id && o.is_active()) else {
            continue;
        };
        info!(order_id = order.id, table = order.table, "new order received");
        let (title, body) = new_order_message(order.table, order.id);
        state.notify(&title, &body);
        if auto_print {
            state.spawn_kitchen_ticket(order);
        }
    }

    for (table, alert) in &report.raised_alerts {
        let (title, body) = match alert {
            TableAlert::WaiterCall => waiter_call_message(*table),
            TableAlert::BillRequested => bill_request_message(*table),
            TableAlert::None => continue,
        };
        info!(table, ?alert, "table alert raised");
        state.notify(&title, &body);
    }
}

/// Poll immediately, outside the loop's schedule.
pub async fn force_sync(state: &AppState) -> DashboardResult<SyncReport> {
    state.require_session()?;
    Ok(run_sync_cycle(state).await)
}

//! Staff notifications for new orders and table alerts.
//!
//! Delivery is pluggable; the dashboard only decides *when* to notify and
//! never assumes permission was granted.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationPermission {
    Granted,
    Denied,
    /// Not asked yet.
    Default,
}

pub trait Notifier: Send + Sync {
    /// Returns whether the notification was shown.
    fn notify(&self, title: &str, body: &str, permission: NotificationPermission) -> bool;
}

/// Writes notifications to the log. Used by the headless binary.
#[derive(Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, title: &str, body: &str, permission: NotificationPermission) -> bool {
        if permission != NotificationPermission::Granted {
            debug!(title, ?permission, "notification suppressed");
            return false;
        }
        info!(target: "comanda_pos_lib::notify", title, body, "notification");
        true
    }
}

pub fn new_order_message(table: u32, order_id: i64) -> (String, String) {
    (
        format!("Novo pedido - Mesa {table}"),
        format!("Pedido #{order_id} recebido"),
    )
}

pub fn waiter_call_message(table: u32) -> (String, String) {
    (
        format!("Mesa {table}"),
        "Chamando o garçom".to_string(),
    )
}

pub fn bill_request_message(table: u32) -> (String, String) {
    (format!("Mesa {table}"), "Pediu a conta".to_string())
}

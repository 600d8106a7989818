//! Single-slot undo buffer.
//!
//! Holds at most one reversible action. Arming a new action discards the
//! previous one; there is no queue. While armed a countdown of
//! [`UNDO_TICKS`] ticks runs (one tick per [`UNDO_TICK`]); when it reaches
//! zero the action is dropped without being applied.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::pedido::{Order, OrderStatus};
use crate::tables::{Table, TableAlert};

pub const UNDO_TICKS: u8 = 5;
pub const UNDO_TICK: Duration = Duration::from_secs(1);

/// Reversible command plus the snapshot needed to reverse it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UndoAction {
    DeliverOrder {
        previous: Order,
    },
    CloseTable {
        previous: Table,
        /// `(order id, status before closing)` for every order that was closed.
        order_statuses: Vec<(i64, OrderStatus)>,
    },
    ResolveAlert {
        table: u32,
        previous_alert: TableAlert,
        order_statuses: Vec<(i64, OrderStatus)>,
    },
}

impl UndoAction {
    pub fn label(&self) -> String {
        match self {
            Self::DeliverOrder { previous } => format!("Pedido #{} entregue", previous.id),
            Self::CloseTable { previous, .. } => format!("Mesa {} fechada", previous.id),
            Self::ResolveAlert { table, .. } => format!("Alerta da mesa {table} resolvido"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UndoEntry {
    pub action: UndoAction,
    pub created_at: DateTime<Utc>,
    pub remaining_ticks: u8,
}

#[derive(Debug, Default)]
pub struct UndoBuffer {
    current: Option<UndoEntry>,
}

impl UndoBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm `action`, silently replacing whatever was armed.
    pub fn arm(&mut self, action: UndoAction) {
        if let Some(replaced) = self.current.take() {
            debug!(action = %replaced.action.label(), "undo action discarded by newer action");
        }
        self.current = Some(UndoEntry {
            action,
            created_at: Utc::now(),
            remaining_ticks: UNDO_TICKS,
        });
    }

    /// Advance the countdown by one tick. Returns the expired action when
    /// this tick emptied the buffer.
    pub fn tick(&mut self) -> Option<UndoAction> {
        let entry = self.current.as_mut()?;
        entry.remaining_ticks = entry.remaining_ticks.saturating_sub(1);
        if entry.remaining_ticks > 0 {
            return None;
        }
        self.current.take().map(|expired| {
            debug!(action = %expired.action.label(), "undo window expired");
            expired.action
        })
    }

    pub fn dismiss(&mut self) {
        self.current = None;
    }

    /// Take the armed action for replay, emptying the buffer.
    pub fn take(&mut self) -> Option<UndoAction> {
        self.current.take().map(|entry| entry.action)
    }

    pub fn current(&self) -> Option<&UndoEntry> {
        self.current.as_ref()
    }

    pub fn is_armed(&self) -> bool {
        self.current.is_some()
    }
}

//! Table board derivation.
//!
//! Tables carry no state of their own on the backend: occupancy, alert and
//! consumption are recomputed from the active order set on every poll and
//! after every local order mutation. Nothing here is latched, so a table
//! whose last order is closed is free on the very next pass.

use serde::{Deserialize, Serialize};

use crate::pedido::{Order, OrderItem, OrderStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableStatus {
    Free,
    Occupied,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableAlert {
    None,
    WaiterCall,
    BillRequested,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Table {
    pub id: u32,
    pub status: TableStatus,
    pub alert: TableAlert,
    pub consumption: Vec<OrderItem>,
}

impl Table {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            status: TableStatus::Free,
            alert: TableAlert::None,
            consumption: Vec::new(),
        }
    }

    pub fn is_occupied(&self) -> bool {
        self.status == TableStatus::Occupied
    }

    pub fn consumption_total(&self) -> f64 {
        self.consumption.iter().map(OrderItem::line_total).sum()
    }
}

/// Tables `1..=count`, all free.
pub fn generate_tables(count: u32) -> Vec<Table> {
    (1..=count).map(Table::new).collect()
}

/// Grow by appending fresh tables or shrink by truncation. Existing tables
/// keep their derived fields until the next reconciliation.
pub fn resize_tables(tables: &mut Vec<Table>, count: u32) {
    let count = count as usize;
    if tables.len() > count {
        tables.truncate(count);
        return;
    }
    let start = tables.len() as u32 + 1;
    tables.extend((start..=count as u32).map(Table::new));
}

#[derive(Default)]
struct TableAccumulator {
    occupied: bool,
    waiter_called: bool,
    bill_requested: bool,
    consumption: Vec<OrderItem>,
}

/// Recompute status, alert and consumption of every table from `orders`.
///
/// Closed orders are filtered out first; they must never make a table
/// occupied. Orders pointing at table 0 or past the end are ignored.
/// When a waiter call and a bill request are both pending the alert is
/// `WaiterCall`.
pub fn reconcile_tables(tables: &mut [Table], orders: &[Order]) {
    let mut acc: Vec<TableAccumulator> = tables.iter().map(|_| TableAccumulator::default()).collect();

    for order in orders.iter().filter(|o| o.is_active()) {
        let Some(slot) = tables
            .iter()
            .position(|t| t.id == order.table)
            .and_then(|idx| acc.get_mut(idx))
        else {
            continue;
        };
        slot.occupied = true;
        match order.status {
            OrderStatus::WaiterPending => slot.waiter_called = true,
            OrderStatus::PaymentPending => slot.bill_requested = true,
            _ => {}
        }
        slot.consumption.extend(order.items.iter().cloned());
    }

    for (table, derived) in tables.iter_mut().zip(acc) {
        table.status = if derived.occupied {
            TableStatus::Occupied
        } else {
            TableStatus::Free
        };
        table.alert = if derived.waiter_called {
            TableAlert::WaiterCall
        } else if derived.bill_requested {
            TableAlert::BillRequested
        } else {
            TableAlert::None
        };
        table.consumption = derived.consumption;
    }
}

/// Active orders for one table, in order-set order.
pub fn active_orders_for_table(orders: &[Order], table: u32) -> impl Iterator<Item = &Order> {
    orders
        .iter()
        .filter(move |o| o.table == table && o.is_active())
}

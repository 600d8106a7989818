//! Order and table commands.
//!
//! Every command writes to the backend first, then patches the local cache
//! and reconciles the board; the next poll brings the backend's truth
//! either way. Reversible commands arm the undo buffer with the snapshot
//! needed to put things back.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tracing::{info, warn};

use crate::app::AppState;
use crate::error::{DashboardError, DashboardResult};
use crate::pedido::{format_brl, parse_pedido, Order, OrderStatus};
use crate::remote::{ORDERS_TABLE, PRODUCTS_TABLE};
use crate::tables::{active_orders_for_table, Table, TableAlert};
use crate::undo::UndoAction;

/// One requested line of a new order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLine {
    pub product_id: i64,
    pub quantity: u32,
}

fn table_in_range(state: &AppState, table: u32) -> DashboardResult<Table> {
    state
        .table(table)
        .ok_or_else(|| DashboardError::NotFound(format!("Mesa {table}")))
}

/// Write `status` for one order remotely, then locally. Returns the order
/// as it was before.
async fn write_status(state: &AppState, order_id: i64, status: &OrderStatus) -> DashboardResult<Order> {
    if !state.orders().iter().any(|o| o.id == order_id) {
        return Err(DashboardError::NotFound(format!("Pedido #{order_id}")));
    }

    let rows = state
        .remote
        .update(
            ORDERS_TABLE,
            &[("id", order_id.to_string())],
            json!({ "status": status.remote_token() }),
        )
        .await
        .map_err(|e| {
            warn!(order_id, status = %status, error = %e, "order status write failed");
            DashboardError::Remote(e)
        })?;
    if rows.is_empty() {
        return Err(DashboardError::NotFound(format!("Pedido #{order_id}")));
    }

    let new_status = status.clone();
    state
        .patch_order(order_id, move |order| order.status = new_status)
        .ok_or_else(|| DashboardError::NotFound(format!("Pedido #{order_id}")))
}

/// Place an order for `table`. Stock is checked against the cached catalog
/// and decremented after the insert succeeds.
pub async fn create_order(
    state: &AppState,
    table: u32,
    lines: &[OrderLine],
    note: Option<&str>,
) -> DashboardResult<Order> {
    state.require_session()?;
    table_in_range(state, table)?;
    if lines.is_empty() || lines.iter().any(|l| l.quantity == 0) {
        return Err(DashboardError::Validation(
            "An order needs at least one item with a positive quantity".into(),
        ));
    }

    let mut requested: BTreeMap<i64, u32> = BTreeMap::new();
    for line in lines {
        *requested.entry(line.product_id).or_default() += line.quantity;
    }

    let products = state.products();
    let mut item_tokens: Vec<String> = Vec::new();
    let mut subtotal = 0.0;
    let mut quantity = 0u32;
    for line in lines {
        let product = products
            .iter()
            .find(|p| p.id == line.product_id)
            .ok_or_else(|| DashboardError::NotFound(format!("Produto #{}", line.product_id)))?;
        let wanted = requested.get(&product.id).copied().unwrap_or(line.quantity);
        if !product.can_sell(wanted) {
            return Err(DashboardError::InsufficientStock {
                product: product.name.clone(),
                available: if product.active { product.stock } else { 0 },
                requested: wanted,
            });
        }
        // One token per unit sold.
        item_tokens.extend(std::iter::repeat(product.name.clone()).take(line.quantity as usize));
        subtotal += product.price * f64::from(line.quantity);
        quantity += line.quantity;
    }

    let mut row = json!({
        "mesa": format!("Mesa {table}"),
        "itens": item_tokens.join(", "),
        "quantidade": quantity.to_string(),
        "Subtotal": format_brl(subtotal),
        "status": OrderStatus::Pending.remote_token(),
        "restaurante_id": state.restaurant_id,
        "created_at": Utc::now().to_rfc3339(),
    });
    if let Some(note) = note.map(str::trim).filter(|n| !n.is_empty()) {
        row["observacao"] = Value::from(note);
    }

    let stored = state.remote.insert(ORDERS_TABLE, row).await.map_err(|e| {
        warn!(table, error = %e, "order insert failed");
        DashboardError::Remote(e)
    })?;
    let order = parse_pedido(&stored);
    state.sync.mark_seen(order.id);
    state.upsert_order(order.clone());
    info!(order_id = order.id, table, total = order.total, "order created");

    for (product_id, wanted) in requested {
        let Some(product) = products.iter().find(|p| p.id == product_id) else {
            continue;
        };
        let remaining = product.stock - i64::from(wanted);
        match state
            .remote
            .update(
                PRODUCTS_TABLE,
                &[("id", product_id.to_string())],
                json!({ "estoque": remaining }),
            )
            .await
        {
            Ok(_) => state.patch_product_stock(product_id, remaining),
            // The order already exists; the next poll shows the real stock.
            Err(e) => warn!(product_id, error = %e, "stock decrement failed"),
        }
    }

    if state.settings().auto_print {
        state.spawn_kitchen_ticket(&order);
    }
    Ok(order)
}

/// Set an order's status without arming undo.
pub async fn update_order_status(
    state: &AppState,
    order_id: i64,
    status: OrderStatus,
) -> DashboardResult<Order> {
    state.require_session()?;
    write_status(state, order_id, &status).await?;
    info!(order_id, status = %status, "order status updated");
    state
        .orders()
        .into_iter()
        .find(|o| o.id == order_id)
        .ok_or_else(|| DashboardError::NotFound(format!("Pedido #{order_id}")))
}

pub async fn deliver_order(state: &AppState, order_id: i64) -> DashboardResult<()> {
    state.require_session()?;
    let previous = write_status(state, order_id, &OrderStatus::Delivered).await?;
    info!(order_id, table = previous.table, "order delivered");
    state.arm_undo(UndoAction::DeliverOrder { previous });
    Ok(())
}

/// Close every active order on `table`, freeing it.
pub async fn close_table(state: &AppState, table: u32) -> DashboardResult<()> {
    state.require_session()?;
    let previous = table_in_range(state, table)?;
    let active: Vec<i64> = active_orders_for_table(&state.orders(), table)
        .map(|o| o.id)
        .collect();
    if active.is_empty() {
        return Err(DashboardError::Validation(format!("Mesa {table} has no open orders")));
    }

    let mut order_statuses = Vec::with_capacity(active.len());
    for id in active {
        match write_status(state, id, &OrderStatus::Closed).await {
            Ok(before) => order_statuses.push((id, before.status)),
            Err(e) => {
                // Keep what was already closed undoable.
                if !order_statuses.is_empty() {
                    state.arm_undo(UndoAction::CloseTable {
                        previous,
                        order_statuses,
                    });
                }
                return Err(e);
            }
        }
    }

    info!(table, orders = order_statuses.len(), "table closed");
    state.arm_undo(UndoAction::CloseTable {
        previous,
        order_statuses,
    });
    Ok(())
}

async fn raise_alert(state: &AppState, table: u32, status: OrderStatus) -> DashboardResult<()> {
    state.require_session()?;
    table_in_range(state, table)?;
    let target = active_orders_for_table(&state.orders(), table)
        .last()
        .map(|o| o.id)
        .ok_or_else(|| DashboardError::Validation(format!("Mesa {table} has no open orders")))?;
    write_status(state, target, &status).await?;
    info!(table, order_id = target, status = %status, "table alert raised");
    Ok(())
}

/// Mark the table's latest order as waiting for a waiter.
pub async fn call_waiter(state: &AppState, table: u32) -> DashboardResult<()> {
    raise_alert(state, table, OrderStatus::WaiterPending).await
}

/// Mark the table's latest order as waiting for the bill and print it.
pub async fn request_bill(state: &AppState, table: u32) -> DashboardResult<()> {
    raise_alert(state, table, OrderStatus::PaymentPending).await?;
    if state.settings().auto_print {
        print_bill(state, table)?;
    }
    Ok(())
}

/// Clear the table's alert. Orders waiting for a waiter go back to
/// delivered; orders waiting for the bill are closed.
pub async fn resolve_alert(state: &AppState, table: u32) -> DashboardResult<()> {
    state.require_session()?;
    let previous_alert = table_in_range(state, table)?.alert;
    if previous_alert == TableAlert::None {
        return Err(DashboardError::Validation(format!("Mesa {table} has no alert")));
    }

    let flagged: Vec<(i64, OrderStatus)> = active_orders_for_table(&state.orders(), table)
        .filter(|o| matches!(o.status, OrderStatus::WaiterPending | OrderStatus::PaymentPending))
        .map(|o| (o.id, o.status.clone()))
        .collect();

    let mut order_statuses = Vec::with_capacity(flagged.len());
    for (id, status) in flagged {
        let next = match status {
            OrderStatus::PaymentPending => OrderStatus::Closed,
            _ => OrderStatus::Delivered,
        };
        write_status(state, id, &next).await?;
        order_statuses.push((id, status));
    }

    info!(table, ?previous_alert, "table alert resolved");
    state.arm_undo(UndoAction::ResolveAlert {
        table,
        previous_alert,
        order_statuses,
    });
    Ok(())
}

/// Replay the armed undo snapshot. Returns `false` when nothing was armed
/// (already expired, dismissed or taken).
pub async fn undo_last(state: &AppState) -> DashboardResult<bool> {
    state.require_session()?;
    let Some(action) = state.take_undo() else {
        return Ok(false);
    };
    info!(action = %action.label(), "undoing");

    match action {
        UndoAction::DeliverOrder { previous } => {
            write_status(state, previous.id, &previous.status).await?;
            state.upsert_order(previous);
        }
        UndoAction::CloseTable {
            previous,
            order_statuses,
        } => {
            for (id, status) in &order_statuses {
                write_status(state, *id, status).await?;
            }
            state.restore_table(previous);
            state.reconcile();
        }
        UndoAction::ResolveAlert { order_statuses, .. } => {
            for (id, status) in &order_statuses {
                write_status(state, *id, status).await?;
            }
        }
    }
    Ok(true)
}

pub fn print_kitchen_ticket(state: &AppState, order_id: i64) -> DashboardResult<()> {
    let order = state
        .orders()
        .into_iter()
        .find(|o| o.id == order_id)
        .ok_or_else(|| DashboardError::NotFound(format!("Pedido #{order_id}")))?;
    state.spawn_kitchen_ticket(&order);
    Ok(())
}

pub fn print_bill(state: &AppState, table: u32) -> DashboardResult<()> {
    let table = table_in_range(state, table)?;
    if table.consumption.is_empty() {
        return Err(DashboardError::Validation(format!("Mesa {} has nothing to bill", table.id)));
    }
    state.spawn_bill(&table);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::tests::seeded_state;
    use crate::pedido::parse_pedidos;
    use crate::remote::memory::MemoryStore;
    use crate::sync::run_sync_cycle;
    use crate::tables::TableStatus;
    use std::sync::Arc;

    async fn ready() -> (Arc<AppState>, Arc<MemoryStore>) {
        let (state, remote, _) = seeded_state();
        run_sync_cycle(&state).await;
        (state, remote)
    }

    fn remote_status(remote: &MemoryStore, id: i64) -> OrderStatus {
        parse_pedidos(&remote.rows(ORDERS_TABLE))
            .into_iter()
            .find(|o| o.id == id)
            .map(|o| o.status)
            .expect("order row")
    }

    #[tokio::test]
    async fn test_create_order_writes_row_and_decrements_stock() {
        let (state, remote) = ready().await;
        let order = create_order(
            &state,
            5,
            &[
                OrderLine { product_id: 10, quantity: 2 },
                OrderLine { product_id: 11, quantity: 1 },
            ],
            Some("sem sal"),
        )
        .await
        .expect("created");

        assert_eq!(order.table, 5);
        assert_eq!(order.quantity, 3);
        assert!((order.total - 23.0).abs() < 1e-9);
        assert_eq!(order.items.len(), 2);
        assert_eq!(order.items[0].name, "Pastel");
        assert_eq!(order.items[0].quantity, 2);
        assert_eq!(order.note.as_deref(), Some("sem sal"));

        let row = remote.rows(ORDERS_TABLE).into_iter().find(|r| r["id"] == order.id).unwrap();
        assert_eq!(row["itens"], "Pastel, Pastel, Suco");
        assert_eq!(row["Subtotal"], "R$ 23,00");
        assert_eq!(row["status"], "pendente");

        assert!(state.table(5).unwrap().is_occupied());
        let stock: Vec<i64> = state.products().iter().map(|p| p.stock).collect();
        assert_eq!(stock, vec![3, 0]);
        assert_eq!(remote.rows(PRODUCTS_TABLE)[1]["estoque"], 0);
    }

    #[tokio::test]
    async fn test_create_order_rejects_insufficient_stock() {
        let (state, remote) = ready().await;
        let result = create_order(
            &state,
            2,
            &[
                OrderLine { product_id: 11, quantity: 1 },
                OrderLine { product_id: 11, quantity: 1 },
            ],
            None,
        )
        .await;
        assert_eq!(
            result,
            Err(DashboardError::InsufficientStock {
                product: "Suco".into(),
                available: 1,
                requested: 2
            })
        );
        assert_eq!(remote.call_count("insert pedidos"), 0);
    }

    #[tokio::test]
    async fn test_create_order_validates_table_and_lines() {
        let (state, _) = ready().await;
        assert!(matches!(
            create_order(&state, 99, &[OrderLine { product_id: 10, quantity: 1 }], None).await,
            Err(DashboardError::NotFound(_))
        ));
        assert!(matches!(
            create_order(&state, 2, &[], None).await,
            Err(DashboardError::Validation(_))
        ));
        assert!(matches!(
            create_order(&state, 2, &[OrderLine { product_id: 404, quantity: 1 }], None).await,
            Err(DashboardError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_deliver_then_undo_restores_status() {
        let (state, remote) = ready().await;
        deliver_order(&state, 1).await.expect("delivered");
        assert_eq!(remote_status(&remote, 1), OrderStatus::Delivered);
        assert!(state.undo_entry().is_some());

        assert!(undo_last(&state).await.expect("undo"));
        assert_eq!(remote_status(&remote, 1), OrderStatus::Pending);
        assert_eq!(state.orders().iter().find(|o| o.id == 1).unwrap().status, OrderStatus::Pending);
        assert!(!undo_last(&state).await.unwrap(), "buffer is empty after undo");
    }

    #[tokio::test]
    async fn test_close_table_frees_it_and_undo_reopens() {
        let (state, remote) = ready().await;
        assert!(state.table(3).unwrap().is_occupied());

        close_table(&state, 3).await.expect("closed");
        let table = state.table(3).unwrap();
        assert_eq!(table.status, TableStatus::Free);
        assert!(table.consumption.is_empty());
        assert_eq!(remote_status(&remote, 1), OrderStatus::Closed);

        undo_last(&state).await.expect("undo");
        assert!(state.table(3).unwrap().is_occupied());
        assert_eq!(remote_status(&remote, 1), OrderStatus::Pending);
    }

    #[tokio::test]
    async fn test_close_empty_table_is_rejected() {
        let (state, _) = ready().await;
        assert!(matches!(close_table(&state, 4).await, Err(DashboardError::Validation(_))));
    }

    #[tokio::test]
    async fn test_waiter_call_and_resolve() {
        let (state, remote) = ready().await;
        call_waiter(&state, 3).await.expect("called");
        assert_eq!(state.table(3).unwrap().alert, TableAlert::WaiterCall);
        assert_eq!(remote_status(&remote, 1), OrderStatus::WaiterPending);

        resolve_alert(&state, 3).await.expect("resolved");
        assert_eq!(state.table(3).unwrap().alert, TableAlert::None);
        assert_eq!(remote_status(&remote, 1), OrderStatus::Delivered);
        assert!(state.table(3).unwrap().is_occupied());

        undo_last(&state).await.expect("undo");
        assert_eq!(state.table(3).unwrap().alert, TableAlert::WaiterCall);
    }

    #[tokio::test]
    async fn test_resolving_bill_request_closes_order() {
        let (state, remote) = ready().await;
        request_bill(&state, 3).await.expect("requested");
        assert_eq!(state.table(3).unwrap().alert, TableAlert::BillRequested);

        resolve_alert(&state, 3).await.expect("resolved");
        assert_eq!(remote_status(&remote, 1), OrderStatus::Closed);
        assert!(!state.table(3).unwrap().is_occupied());
    }

    #[tokio::test]
    async fn test_newer_action_replaces_undo() {
        let (state, remote) = ready().await;
        deliver_order(&state, 1).await.unwrap();
        call_waiter(&state, 3).await.unwrap();
        resolve_alert(&state, 3).await.unwrap();

        // Only the resolve is undone; the delivery stays.
        undo_last(&state).await.unwrap();
        assert_eq!(remote_status(&remote, 1), OrderStatus::WaiterPending);
        assert!(!undo_last(&state).await.unwrap());
    }

    #[tokio::test]
    async fn test_remote_failure_leaves_cache_untouched() {
        let (state, remote) = ready().await;
        remote.fail(ORDERS_TABLE, true);
        let result = deliver_order(&state, 1).await;
        assert!(matches!(result, Err(DashboardError::Remote(_))));
        assert_eq!(state.orders().iter().find(|o| o.id == 1).unwrap().status, OrderStatus::Pending);
        assert!(state.undo_entry().is_none());
    }

    #[tokio::test]
    async fn test_commands_require_session() {
        let (state, _) = ready().await;
        state.clear_session_for_test();
        assert_eq!(deliver_order(&state, 1).await, Err(DashboardError::NotAuthenticated));
        assert_eq!(close_table(&state, 3).await, Err(DashboardError::NotAuthenticated));
    }

    #[tokio::test]
    async fn test_print_bill_needs_consumption() {
        let (state, _) = ready().await;
        assert!(matches!(print_bill(&state, 4), Err(DashboardError::Validation(_))));
        assert!(matches!(print_kitchen_ticket(&state, 404), Err(DashboardError::NotFound(_))));
    }
}

//! Sales reporting over the polled order set.

use chrono::{DateTime, Duration, NaiveDate, Timelike, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

use crate::pedido::{Order, OrderStatus};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TopItem {
    pub name: String,
    pub quantity: u32,
    pub revenue: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SalesSummary {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub order_count: usize,
    pub revenue: f64,
    pub average_ticket: f64,
    pub units_sold: u32,
    pub top_items: Vec<TopItem>,
    /// Keyed by canonical status token.
    pub status_counts: BTreeMap<String, usize>,
    /// Revenue by hour of day (UTC), index 0..24.
    pub hourly_revenue: Vec<f64>,
    pub cancelled_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailySales {
    pub date: NaiveDate,
    pub orders: usize,
    pub revenue: f64,
}

fn is_cancelled(status: &OrderStatus) -> bool {
    matches!(
        status,
        OrderStatus::Other(s) if matches!(s.as_str(), "cancelado" | "cancelled" | "canceled" | "cancelada")
    )
}

fn in_period(order: &Order, from: DateTime<Utc>, to: DateTime<Utc>) -> bool {
    order
        .created_at
        .map(|at| at >= from && at < to)
        .unwrap_or(false)
}

/// Summarize orders created in `[from, to)`. Orders without a creation
/// timestamp are left out; cancelled orders are counted but earn nothing.
pub fn summarize(orders: &[Order], from: DateTime<Utc>, to: DateTime<Utc>, top_n: usize) -> SalesSummary {
    let mut status_counts: BTreeMap<String, usize> = BTreeMap::new();
    let mut hourly_revenue = vec![0.0; 24];
    let mut by_item: HashMap<&str, (u32, f64, usize)> = HashMap::new();
    let mut order_count = 0;
    let mut cancelled_count = 0;
    let mut revenue = 0.0;
    let mut units_sold = 0;

    for (position, order) in orders.iter().filter(|o| in_period(o, from, to)).enumerate() {
        *status_counts.entry(order.status.as_str().to_string()).or_default() += 1;
        if is_cancelled(&order.status) {
            cancelled_count += 1;
            continue;
        }
        order_count += 1;
        revenue += order.total;
        if let Some(at) = order.created_at {
            hourly_revenue[at.hour() as usize] += order.total;
        }
        for item in &order.items {
            units_sold += item.quantity;
            let entry = by_item.entry(item.name.as_str()).or_insert((0, 0.0, position));
            entry.0 += item.quantity;
            entry.1 += item.line_total();
        }
    }

    let mut ranked: Vec<(&str, (u32, f64, usize))> = by_item.into_iter().collect();
    // Quantity desc, then first appearance for a stable order.
    ranked.sort_by(|a, b| b.1 .0.cmp(&a.1 .0).then(a.1 .2.cmp(&b.1 .2)).then(a.0.cmp(b.0)));
    let top_items = ranked
        .into_iter()
        .take(top_n)
        .map(|(name, (quantity, revenue, _))| TopItem {
            name: name.to_string(),
            quantity,
            revenue,
        })
        .collect();

    SalesSummary {
        from,
        to,
        order_count,
        revenue,
        average_ticket: if order_count == 0 {
            0.0
        } else {
            revenue / order_count as f64
        },
        units_sold,
        top_items,
        status_counts,
        hourly_revenue,
        cancelled_count,
    }
}

/// Summary for the UTC day containing `now`.
pub fn today(orders: &[Order], now: DateTime<Utc>, top_n: usize) -> SalesSummary {
    let start = now.date_naive().and_hms_opt(0, 0, 0).map(|d| d.and_utc()).unwrap_or(now);
    summarize(orders, start, start + Duration::days(1), top_n)
}

/// Revenue per day for the last `days` days ending at `now`'s date, oldest
/// first. Days without orders are still listed.
pub fn sales_trend(orders: &[Order], now: DateTime<Utc>, days: u32) -> Vec<DailySales> {
    let days = days.clamp(1, 60);
    let end = now.date_naive();
    (0..days)
        .rev()
        .map(|offset| {
            let date = end - Duration::days(i64::from(offset));
            let day: Vec<&Order> = orders
                .iter()
                .filter(|o| !is_cancelled(&o.status))
                .filter(|o| o.created_at.map(|at| at.date_naive() == date).unwrap_or(false))
                .collect();
            DailySales {
                date,
                orders: day.len(),
                revenue: day.iter().map(|o| o.total).sum(),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pedido::OrderItem;
    use chrono::TimeZone;

    fn order(id: i64, status: OrderStatus, items: &[(&str, f64, u32)], at: Option<DateTime<Utc>>) -> Order {
        let items: Vec<OrderItem> = items
            .iter()
            .map(|(name, price, quantity)| OrderItem {
                name: name.to_string(),
                price: *price,
                quantity: *quantity,
            })
            .collect();
        Order {
            id,
            table: 1,
            total: items.iter().map(OrderItem::line_total).sum(),
            quantity: items.iter().map(|i| i.quantity).sum(),
            items,
            status,
            note: None,
            created_at: at,
        }
    }

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, day, hour, 15, 0).unwrap()
    }

    #[test]
    fn test_summary_totals_and_top_items() {
        let orders = vec![
            order(1, OrderStatus::Closed, &[("Pastel", 8.0, 2), ("Suco", 7.0, 1)], Some(at(10, 12))),
            order(2, OrderStatus::Delivered, &[("Suco", 7.0, 3)], Some(at(10, 13))),
            order(3, OrderStatus::Other("cancelado".into()), &[("Pastel", 8.0, 5)], Some(at(10, 13))),
            order(4, OrderStatus::Pending, &[("Bolo", 10.0, 1)], None),
            order(5, OrderStatus::Closed, &[("Bolo", 10.0, 1)], Some(at(11, 9))),
        ];
        let summary = today(&orders, at(10, 23), 2);

        assert_eq!(summary.order_count, 2);
        assert_eq!(summary.cancelled_count, 1);
        assert!((summary.revenue - 44.0).abs() < 1e-9);
        assert!((summary.average_ticket - 22.0).abs() < 1e-9);
        assert_eq!(summary.units_sold, 6);
        assert_eq!(summary.top_items.len(), 2);
        assert_eq!(summary.top_items[0].name, "Suco");
        assert_eq!(summary.top_items[0].quantity, 4);
        assert_eq!(summary.top_items[1].name, "Pastel");
        assert_eq!(summary.status_counts.get("closed"), Some(&1));
        assert_eq!(summary.status_counts.get("cancelado"), Some(&1));
        assert!((summary.hourly_revenue[13] - 21.0).abs() < 1e-9);
    }

    #[test]
    fn test_empty_period_has_zero_average() {
        let summary = summarize(&[], at(1, 0), at(2, 0), 5);
        assert_eq!(summary.order_count, 0);
        assert_eq!(summary.average_ticket, 0.0);
        assert!(summary.top_items.is_empty());
    }

    #[test]
    fn test_trend_lists_every_day() {
        let orders = vec![
            order(1, OrderStatus::Closed, &[("Suco", 7.0, 1)], Some(at(9, 10))),
            order(2, OrderStatus::Closed, &[("Suco", 7.0, 2)], Some(at(11, 10))),
        ];
        let trend = sales_trend(&orders, at(11, 20), 3);
        assert_eq!(trend.len(), 3);
        assert_eq!(trend[0].date, NaiveDate::from_ymd_opt(2026, 3, 9).unwrap());
        assert_eq!(trend[0].orders, 1);
        assert_eq!(trend[1].orders, 0);
        assert!((trend[2].revenue - 14.0).abs() < 1e-9);
    }
}

//! Order ("pedido") parsing for Comanda POS.
//!
//! Remote order rows are loosely typed: the table arrives as free text
//! (`"Mesa 7"`), the item list is a comma-joined run of names with one token
//! per unit sold, the aggregate quantity is a string and the subtotal is a
//! BRL currency string. This module turns such rows into a typed [`Order`].
//! Parsing is total: malformed numeric fields fall back to defaults instead
//! of failing, so one bad row never blanks the dashboard.

use chrono::{DateTime, NaiveDateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::OnceLock;

use crate::{value_i64, value_str, value_text};

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Canonical order status. Unknown remote values are kept as `Other`
/// (lowercased) rather than rejected.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum OrderStatus {
    Pending,
    Preparing,
    Ready,
    Delivered,
    PaymentPending,
    WaiterPending,
    Closed,
    Other(String),
}

impl OrderStatus {
    /// Map any known synonym (English/Portuguese, with or without accents,
    /// `_`/`-`/space separated) to its canonical status.
    pub fn normalize(raw: &str) -> Self {
        match fold_status_key(raw).as_str() {
            "pending" | "pendente" | "novo" | "aberto" | "recebido" => Self::Pending,
            "preparing" | "preparando" | "em preparo" | "em preparacao" | "preparo" => {
                Self::Preparing
            }
            "ready" | "pronto" => Self::Ready,
            "delivered" | "entregue" | "servido" => Self::Delivered,
            "payment pending" | "aguardando pagamento" | "pagamento pendente" | "conta"
            | "pedindo conta" | "fechar conta" | "conta solicitada" => Self::PaymentPending,
            "waiter pending" | "garcom" | "chamar garcom" | "chamando garcom"
            | "aguardando garcom" => Self::WaiterPending,
            "closed" | "fechado" | "finalizado" | "encerrado" | "concluido" | "pago" => {
                Self::Closed
            }
            _ => Self::Other(raw.trim().to_lowercase()),
        }
    }

    /// Canonical wire token.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Pending => "pending",
            Self::Preparing => "preparing",
            Self::Ready => "ready",
            Self::Delivered => "delivered",
            Self::PaymentPending => "payment-pending",
            Self::WaiterPending => "waiter-pending",
            Self::Closed => "closed",
            Self::Other(s) => s.as_str(),
        }
    }

    /// Value written to the `status` column. The backend and other clients
    /// use the Portuguese vocabulary.
    pub fn remote_token(&self) -> &str {
        match self {
            Self::Pending => "pendente",
            Self::Preparing => "em preparo",
            Self::Ready => "pronto",
            Self::Delivered => "entregue",
            Self::PaymentPending => "pagamento pendente",
            Self::WaiterPending => "chamando garcom",
            Self::Closed => "fechado",
            Self::Other(s) => s.as_str(),
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for OrderStatus {
    fn from(raw: String) -> Self {
        Self::normalize(&raw)
    }
}

impl From<OrderStatus> for String {
    fn from(status: OrderStatus) -> Self {
        status.as_str().to_string()
    }
}

/// Lowercase, strip Portuguese diacritics and collapse separators so that
/// `"Em_Preparação"`, `"em-preparacao"` and `"em preparacao"` share a key.
fn fold_status_key(raw: &str) -> String {
    let folded: String = raw
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| match c {
            'á' | 'à' | 'â' | 'ã' | 'ä' => 'a',
            'é' | 'è' | 'ê' | 'ë' => 'e',
            'í' | 'ì' | 'î' | 'ï' => 'i',
            'ó' | 'ò' | 'ô' | 'õ' | 'ö' => 'o',
            'ú' | 'ù' | 'û' | 'ü' => 'u',
            'ç' => 'c',
            '_' | '-' => ' ',
            other => other,
        })
        .collect();
    folded.split_whitespace().collect::<Vec<_>>().join(" ")
}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// One line of an order. Price is the order's unit price; the remote row
/// does not store per-line prices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderItem {
    pub name: String,
    pub price: f64,
    pub quantity: u32,
}

impl OrderItem {
    pub fn line_total(&self) -> f64 {
        self.price * f64::from(self.quantity)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: i64,
    pub table: u32,
    pub items: Vec<OrderItem>,
    pub status: OrderStatus,
    pub note: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    /// Aggregate quantity as stored remotely (`quantidade`).
    pub quantity: u32,
    /// Parsed `Subtotal`.
    pub total: f64,
}

impl Order {
    /// Every status except `Closed` counts as active.
    pub fn is_active(&self) -> bool {
        !self.status.is_closed()
    }
}

// ---------------------------------------------------------------------------
// Field parsers
// ---------------------------------------------------------------------------

fn table_number_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\d+").expect("table number pattern is valid"))
}

/// First run of digits in the free-text table field, 0 when absent.
pub fn parse_table_number(raw: &str) -> u32 {
    table_number_pattern()
        .find(raw)
        .and_then(|m| m.as_str().parse::<u32>().ok())
        .unwrap_or(0)
}

/// Integer parse of the aggregate quantity, 1 on failure.
pub fn parse_quantity(raw: Option<&str>) -> u32 {
    raw.and_then(|s| s.trim().parse::<u32>().ok()).unwrap_or(1)
}

/// Parse a BRL currency string (`"R$ 27,00"`, `"R$ 1.234,50"`, `"12.5"`).
/// Returns 0 on anything unparsable.
pub fn parse_brl_amount(raw: &str) -> f64 {
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || matches!(c, ',' | '.' | '-'))
        .collect();
    // With a decimal comma present, dots can only be thousands separators.
    let normalized = if cleaned.contains(',') {
        cleaned.replace('.', "").replace(',', ".")
    } else {
        cleaned
    };
    normalized
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .unwrap_or(0.0)
}

/// Format an amount the way the remote `Subtotal` column stores it.
pub fn format_brl(amount: f64) -> String {
    format!("R$ {amount:.2}").replace('.', ",")
}

/// Split the comma-joined item list and count repeated names, keeping the
/// order in which each name first appears.
fn group_item_names(raw: &str) -> Vec<(String, u32)> {
    let mut grouped: Vec<(String, u32)> = Vec::new();
    for token in raw.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        match grouped.iter_mut().find(|(name, _)| name == token) {
            Some((_, count)) => *count += 1,
            None => grouped.push((token.to_string(), 1)),
        }
    }
    grouped
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f"))
        .ok()
        .map(|naive| naive.and_utc())
}

// ---------------------------------------------------------------------------
// Record parser
// ---------------------------------------------------------------------------

/// Build an [`Order`] from a raw `pedidos` row.
pub fn parse_pedido(raw: &Value) -> Order {
    let table = value_text(raw, &["mesa", "table"])
        .map(|s| parse_table_number(&s))
        .unwrap_or(0);
    let quantity = parse_quantity(value_text(raw, &["quantidade", "quantity"]).as_deref());
    let total = value_text(raw, &["Subtotal", "subtotal", "total"])
        .map(|s| parse_brl_amount(&s))
        .unwrap_or(0.0);
    let unit_price = if quantity == 0 {
        0.0
    } else {
        total / f64::from(quantity)
    };

    let mut grouped = group_item_names(&value_str(raw, &["itens", "items"]).unwrap_or_default());
    // Upstream sometimes sends one item name with a separate multi-unit count.
    if let [(_, count)] = grouped.as_mut_slice() {
        if quantity > 1 {
            *count = quantity;
        }
    }

    let items = grouped
        .into_iter()
        .map(|(name, quantity)| OrderItem {
            name,
            price: unit_price,
            quantity,
        })
        .collect();

    Order {
        id: value_i64(raw, &["id"])
            .or_else(|| value_text(raw, &["id"]).and_then(|s| s.parse().ok()))
            .unwrap_or(0),
        table,
        items,
        status: OrderStatus::normalize(&value_str(raw, &["status"]).unwrap_or_default()),
        note: value_str(raw, &["observacao", "observacoes", "note"]),
        created_at: value_str(raw, &["created_at", "criado_em"]).and_then(|s| parse_timestamp(&s)),
        quantity,
        total,
    }
}

/// Parse every row of a `pedidos` select, skipping non-object entries.
pub fn parse_pedidos(rows: &[Value]) -> Vec<Order> {
    rows.iter()
        .filter(|row| row.is_object())
        .map(parse_pedido)
        .collect()
}

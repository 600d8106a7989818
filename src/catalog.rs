//! Product catalog and staff directory projections.
//!
//! Both are read-mostly copies of backend rows refreshed on every poll.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::pedido::parse_brl_amount;
use crate::{value_bool, value_f64, value_i64, value_str, value_text};

/// Where a product is prepared; decides which ticket it prints on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Station {
    Bar,
    Kitchen,
}

impl Station {
    fn parse(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "bar" | "bebida" | "bebidas" | "drinks" => Self::Bar,
            _ => Self::Kitchen,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Bar => "BAR",
            Self::Kitchen => "COZINHA",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: i64,
    pub name: String,
    pub price: f64,
    pub category: String,
    pub station: Station,
    pub stock: i64,
    pub active: bool,
}

impl Product {
    pub fn from_remote(row: &Value) -> Option<Self> {
        let id = value_i64(row, &["id"])?;
        let name = value_str(row, &["nome", "name"])?;
        let price = value_f64(row, &["preco", "price"])
            .or_else(|| value_str(row, &["preco", "price"]).map(|s| parse_brl_amount(&s)))
            .unwrap_or(0.0);
        let stock = value_i64(row, &["estoque", "stock"])
            .or_else(|| value_text(row, &["estoque", "stock"]).and_then(|s| s.parse().ok()))
            .unwrap_or(0);

        Some(Self {
            id,
            name,
            price,
            category: value_str(row, &["categoria", "category"]).unwrap_or_default(),
            station: Station::parse(&value_str(row, &["setor", "estacao", "station"]).unwrap_or_default()),
            stock,
            active: value_bool(row, &["ativo", "active"]).unwrap_or(true),
        })
    }

    pub fn can_sell(&self, quantity: u32) -> bool {
        self.active && self.stock >= i64::from(quantity)
    }
}

/// Parse product rows, dropping rows without an id or name.
pub fn parse_products(rows: &[Value]) -> Vec<Product> {
    rows.iter().filter_map(Product::from_remote).collect()
}

pub fn find_by_name<'a>(products: &'a [Product], name: &str) -> Option<&'a Product> {
    products
        .iter()
        .find(|p| p.name.eq_ignore_ascii_case(name.trim()))
}

/// Staff member as listed in the directory. The password column is never
/// copied into this projection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaffUser {
    pub id: i64,
    pub name: String,
    pub email: String,
    pub role: String,
}

impl StaffUser {
    pub fn from_remote(row: &Value) -> Option<Self> {
        Some(Self {
            id: value_i64(row, &["id"])?,
            name: value_str(row, &["nome", "name"]).unwrap_or_default(),
            email: value_str(row, &["email"])?.to_lowercase(),
            role: value_str(row, &["cargo", "role"]).unwrap_or_else(|| "garcom".to_string()),
        })
    }
}

pub fn parse_users(rows: &[Value]) -> Vec<StaffUser> {
    rows.iter().filter_map(StaffUser::from_remote).collect()
}

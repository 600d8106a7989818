//! Comanda POS - restaurant table and order dashboard core.
//!
//! The hosted PostgREST backend is the only source of truth. This crate
//! polls it, parses its free-text `pedidos` rows into typed orders, derives
//! the table board from the active ones and sends the operator's commands
//! back. Everything kept locally is a cache the next poll replaces.
//!
//! Entry point for embedders is [`app::AppState`]; see `main.rs` for the
//! headless runner.

pub mod analytics;
pub mod app;
pub mod auth;
pub mod catalog;
pub mod db;
pub mod error;
pub mod escpos;
pub mod logging;
pub mod notify;
pub mod orders;
pub mod pedido;
pub mod print;
pub mod remote;
pub mod settings;
pub mod storage;
pub mod sync;
pub mod tables;
pub mod undo;

pub use app::AppState;
pub use error::{DashboardError, DashboardResult};

pub(crate) fn value_str(v: &serde_json::Value, keys: &[&str]) -> Option<String> {
    for key in keys {
        if let Some(s) = v.get(*key).and_then(|x| x.as_str()) {
            let trimmed = s.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }
    None
}

pub(crate) fn value_f64(v: &serde_json::Value, keys: &[&str]) -> Option<f64> {
    for key in keys {
        if let Some(n) = v.get(*key).and_then(|x| x.as_f64()) {
            return Some(n);
        }
    }
    None
}

pub(crate) fn value_i64(v: &serde_json::Value, keys: &[&str]) -> Option<i64> {
    for key in keys {
        if let Some(n) = v.get(*key).and_then(|x| x.as_i64()) {
            return Some(n);
        }
    }
    None
}

/// Like [`value_str`] but also accepts numbers, rendered without a trailing
/// `.0` when integral. Backend columns flip between text and numeric.
pub(crate) fn value_text(v: &serde_json::Value, keys: &[&str]) -> Option<String> {
    for key in keys {
        match v.get(*key) {
            Some(serde_json::Value::String(s)) => {
                let trimmed = s.trim();
                if !trimmed.is_empty() {
                    return Some(trimmed.to_string());
                }
            }
            Some(serde_json::Value::Number(n)) => {
                if let Some(i) = n.as_i64() {
                    return Some(i.to_string());
                }
                if let Some(u) = n.as_u64() {
                    return Some(u.to_string());
                }
                if let Some(f) = n.as_f64() {
                    return Some(f.to_string());
                }
            }
            _ => {}
        }
    }
    None
}

pub(crate) fn value_bool(v: &serde_json::Value, keys: &[&str]) -> Option<bool> {
    for key in keys {
        match v.get(*key) {
            Some(serde_json::Value::Bool(b)) => return Some(*b),
            Some(serde_json::Value::Number(n)) => match n.as_i64() {
                Some(1) => return Some(true),
                Some(0) => return Some(false),
                _ => {}
            },
            Some(serde_json::Value::String(s)) => {
                match s.trim().to_ascii_lowercase().as_str() {
                    "true" | "1" | "yes" | "on" | "sim" => return Some(true),
                    "false" | "0" | "no" | "off" | "nao" | "não" => return Some(false),
                    _ => {}
                }
            }
            _ => {}
        }
    }
    None
}

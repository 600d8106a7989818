//! Restaurant settings: typed projection of the `restaurantes` row plus an
//! optimistic store.
//!
//! The store separates the last committed snapshot (what the backend
//! echoed) from pending patches (applied locally, not yet confirmed). The
//! effective settings shown to the rest of the app are the committed
//! snapshot with every pending patch overlaid, so a poll that lands during
//! a save cannot wipe the user's change, and a failed save is rolled back
//! by simply dropping its patch.

use chrono::NaiveTime;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::db;
use crate::pedido::parse_brl_amount;
use crate::{value_bool, value_f64, value_i64, value_str, value_text};

pub const DEFAULT_TABLE_COUNT: u32 = 10;
pub const DEFAULT_SERVICE_FEE_PERCENT: f64 = 10.0;
const SNAPSHOT_CATEGORY: &str = "cache";
const SNAPSHOT_KEY: &str = "settings";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    pub restaurant_name: String,
    pub table_count: u32,
    pub flashing_alerts: bool,
    pub opening_time: Option<String>,
    pub closing_time: Option<String>,
    pub service_fee_percent: f64,
    pub auto_print: bool,
    /// `host:port` of a network receipt printer; `None` prints through the
    /// device print intent.
    pub printer_address: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            restaurant_name: String::new(),
            table_count: DEFAULT_TABLE_COUNT,
            flashing_alerts: true,
            opening_time: None,
            closing_time: None,
            service_fee_percent: DEFAULT_SERVICE_FEE_PERCENT,
            auto_print: false,
            printer_address: None,
        }
    }
}

fn parse_hhmm(raw: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(raw.trim(), "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(raw.trim(), "%H:%M:%S"))
        .ok()
}

impl Settings {
    /// Build settings from a `restaurantes` row. Missing or malformed
    /// columns fall back to defaults.
    pub fn from_remote(row: &Value) -> Self {
        let defaults = Self::default();
        let table_count = value_i64(row, &["quantidade_mesas", "table_count"])
            .or_else(|| {
                value_text(row, &["quantidade_mesas", "table_count"]).and_then(|s| s.parse().ok())
            })
            .and_then(|n| u32::try_from(n).ok())
            .unwrap_or(defaults.table_count);
        let service_fee_percent = value_f64(row, &["taxa_servico", "service_fee"])
            .or_else(|| value_str(row, &["taxa_servico", "service_fee"]).map(|s| parse_brl_amount(&s)))
            .filter(|v| v.is_finite() && *v >= 0.0)
            .unwrap_or(defaults.service_fee_percent);

        Self {
            restaurant_name: value_str(row, &["nome", "name"]).unwrap_or_default(),
            table_count,
            flashing_alerts: value_bool(row, &["alertas_piscantes", "flashing_alerts"])
                .unwrap_or(defaults.flashing_alerts),
            opening_time: value_str(row, &["horario_abertura", "opening_time"]),
            closing_time: value_str(row, &["horario_fechamento", "closing_time"]),
            service_fee_percent,
            auto_print: value_bool(row, &["impressao_automatica", "auto_print"])
                .unwrap_or(defaults.auto_print),
            printer_address: value_str(row, &["impressora_ip", "printer_address"]),
        }
    }

    /// Whether `now` falls inside opening hours. Unset or unparsable hours
    /// count as always open; a closing time before the opening time spans
    /// midnight.
    pub fn is_open_at(&self, now: NaiveTime) -> bool {
        let (Some(open), Some(close)) = (
            self.opening_time.as_deref().and_then(parse_hhmm),
            self.closing_time.as_deref().and_then(parse_hhmm),
        ) else {
            return true;
        };
        if open <= close {
            now >= open && now < close
        } else {
            now >= open || now < close
        }
    }

    pub fn service_fee(&self, subtotal: f64) -> f64 {
        subtotal * self.service_fee_percent / 100.0
    }
}

/// Partial update. Serializes to the backend's column names so the same
/// value is both the optimistic overlay and the PATCH body.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SettingsPatch {
    #[serde(rename = "nome", skip_serializing_if = "Option::is_none")]
    pub restaurant_name: Option<String>,
    #[serde(rename = "quantidade_mesas", skip_serializing_if = "Option::is_none")]
    pub table_count: Option<u32>,
    #[serde(rename = "alertas_piscantes", skip_serializing_if = "Option::is_none")]
    pub flashing_alerts: Option<bool>,
    #[serde(rename = "horario_abertura", skip_serializing_if = "Option::is_none")]
    pub opening_time: Option<String>,
    #[serde(rename = "horario_fechamento", skip_serializing_if = "Option::is_none")]
    pub closing_time: Option<String>,
    #[serde(rename = "taxa_servico", skip_serializing_if = "Option::is_none")]
    pub service_fee_percent: Option<f64>,
    #[serde(rename = "impressao_automatica", skip_serializing_if = "Option::is_none")]
    pub auto_print: Option<bool>,
    #[serde(rename = "impressora_ip", skip_serializing_if = "Option::is_none")]
    pub printer_address: Option<String>,
}

impl SettingsPatch {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn apply_to(&self, settings: &mut Settings) {
        if let Some(v) = &self.restaurant_name {
            settings.restaurant_name = v.clone();
        }
        if let Some(v) = self.table_count {
            settings.table_count = v;
        }
        if let Some(v) = self.flashing_alerts {
            settings.flashing_alerts = v;
        }
        if let Some(v) = &self.opening_time {
            settings.opening_time = Some(v.clone());
        }
        if let Some(v) = &self.closing_time {
            settings.closing_time = Some(v.clone());
        }
        if let Some(v) = self.service_fee_percent {
            settings.service_fee_percent = v;
        }
        if let Some(v) = self.auto_print {
            settings.auto_print = v;
        }
        if let Some(v) = &self.printer_address {
            settings.printer_address = Some(v.clone());
        }
    }

    /// Shape checks done before anything is applied.
    pub fn validate(&self) -> Result<(), String> {
        if let Some(count) = self.table_count {
            if count == 0 || count > 500 {
                return Err("Table count must be between 1 and 500".into());
            }
        }
        if let Some(fee) = self.service_fee_percent {
            if !fee.is_finite() || !(0.0..=100.0).contains(&fee) {
                return Err("Service fee must be between 0 and 100 percent".into());
            }
        }
        for (label, value) in [
            ("Opening time", &self.opening_time),
            ("Closing time", &self.closing_time),
        ] {
            if let Some(raw) = value {
                if parse_hhmm(raw).is_none() {
                    return Err(format!("{label} must be HH:MM"));
                }
            }
        }
        Ok(())
    }

    pub fn to_remote_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| Value::Object(Default::default()))
    }
}

#[derive(Debug, Clone)]
struct PendingPatch {
    id: Uuid,
    patch: SettingsPatch,
}

/// Committed snapshot plus pending optimistic patches.
#[derive(Debug, Clone, Default)]
pub struct SettingsStore {
    committed: Settings,
    pending: Vec<PendingPatch>,
}

impl SettingsStore {
    pub fn new(committed: Settings) -> Self {
        Self {
            committed,
            pending: Vec::new(),
        }
    }

    /// Committed snapshot with every pending patch applied in order.
    pub fn effective(&self) -> Settings {
        let mut settings = self.committed.clone();
        for pending in &self.pending {
            pending.patch.apply_to(&mut settings);
        }
        settings
    }

    pub fn committed(&self) -> &Settings {
        &self.committed
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Overlay `patch` locally and return the tag used to confirm or roll
    /// it back.
    pub fn apply_optimistic(&mut self, patch: SettingsPatch) -> Uuid {
        let id = Uuid::new_v4();
        self.pending.push(PendingPatch { id, patch });
        id
    }

    pub fn pending_patch(&self, id: Uuid) -> Option<&SettingsPatch> {
        self.pending.iter().find(|p| p.id == id).map(|p| &p.patch)
    }

    /// The backend accepted the write: its echo becomes the committed
    /// snapshot and the patch stops being pending.
    pub fn confirm(&mut self, id: Uuid, echo: Settings) {
        self.committed = echo;
        self.pending.retain(|p| p.id != id);
    }

    /// Drop a pending patch. Returns `false` when the tag is unknown.
    pub fn rollback(&mut self, id: Uuid) -> bool {
        let before = self.pending.len();
        self.pending.retain(|p| p.id != id);
        self.pending.len() != before
    }

    /// Take a polled snapshot as the committed state. Pending patches stay
    /// on top of it.
    pub fn merge_remote(&mut self, remote: Settings) {
        self.committed = remote;
    }
}

// ---------------------------------------------------------------------------
// Local snapshot
// ---------------------------------------------------------------------------

pub fn save_snapshot(conn: &Connection, settings: &Settings) -> Result<(), String> {
    let raw = serde_json::to_string(settings).map_err(|e| format!("serialize settings: {e}"))?;
    db::set_setting(conn, SNAPSHOT_CATEGORY, SNAPSHOT_KEY, &raw)
}

pub fn load_snapshot(conn: &Connection) -> Option<Settings> {
    db::get_setting(conn, SNAPSHOT_CATEGORY, SNAPSHOT_KEY)
        .and_then(|raw| serde_json::from_str::<Settings>(&raw).ok())
}

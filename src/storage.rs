//! Backend credential storage using the OS credential store.
//!
//! On Windows this uses DPAPI (via the `keyring` crate), on macOS Keychain,
//! and on Linux the Secret Service API. Each value can be overridden by an
//! environment variable, which is how headless deployments configure the
//! dashboard.

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use keyring::Entry;
use serde_json::Value;
use tracing::{info, warn};

use crate::remote::normalize_backend_url;
use crate::value_text;

const SERVICE_NAME: &str = "comanda-pos";

// Credential keys
pub const KEY_BACKEND_URL: &str = "supabase_url";
pub const KEY_ANON_KEY: &str = "supabase_anon_key";
pub const KEY_RESTAURANT_ID: &str = "restaurant_id";

const ALL_KEYS: &[&str] = &[KEY_BACKEND_URL, KEY_ANON_KEY, KEY_RESTAURANT_ID];

const ENV_BACKEND_URL: &str = "COMANDA_SUPABASE_URL";
const ENV_ANON_KEY: &str = "COMANDA_SUPABASE_ANON_KEY";
const ENV_RESTAURANT_ID: &str = "COMANDA_RESTAURANT_ID";
const ENV_CONNECTION_STRING: &str = "COMANDA_CONNECTION";

/// Everything needed to reach one restaurant's data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendConfig {
    pub url: String,
    pub anon_key: String,
    pub restaurant_id: String,
}

// ---------------------------------------------------------------------------
// Low-level helpers
// ---------------------------------------------------------------------------

/// Retrieve a single credential from the OS keyring. Returns `None` when the
/// entry does not exist (or the platform returns a "not found" error).
pub fn get_credential(key: &str) -> Option<String> {
    let entry = match Entry::new(SERVICE_NAME, key) {
        Ok(e) => e,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to create entry");
            return None;
        }
    };
    match entry.get_password() {
        Ok(pw) => Some(pw),
        Err(keyring::Error::NoEntry) => None,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to read credential");
            None
        }
    }
}

pub fn set_credential(key: &str, value: &str) -> Result<(), String> {
    let entry = Entry::new(SERVICE_NAME, key).map_err(|e| e.to_string())?;
    entry.set_password(value).map_err(|e| e.to_string())?;
    Ok(())
}

/// Silently succeeds if the entry does not exist.
pub fn delete_credential(key: &str) -> Result<(), String> {
    let entry = Entry::new(SERVICE_NAME, key).map_err(|e| e.to_string())?;
    match entry.delete_credential() {
        Ok(()) => Ok(()),
        Err(keyring::Error::NoEntry) => Ok(()),
        Err(e) => Err(e.to_string()),
    }
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

// ---------------------------------------------------------------------------
// Connection strings
// ---------------------------------------------------------------------------

/// Decode a connection string: either raw JSON or (url-safe) base64 JSON of
/// the shape `{"url": "...", "key": "...", "rid": "..."}`.
fn decode_connection_string(raw: &str) -> Option<Value> {
    let compact: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.starts_with('{') {
        return serde_json::from_str::<Value>(&compact).ok();
    }
    if compact.len() < 20 {
        return None;
    }

    let base64 = compact.replace('-', "+").replace('_', "/");
    let padded = format!("{}{}", base64, "=".repeat((4 - base64.len() % 4) % 4));
    let decoded = BASE64_STANDARD.decode(padded).ok()?;
    serde_json::from_slice::<Value>(&decoded).ok()
}

pub fn parse_connection_string(raw: &str) -> Option<BackendConfig> {
    let payload = decode_connection_string(raw)?;
    Some(BackendConfig {
        url: normalize_backend_url(&value_text(&payload, &["url", "supabaseUrl"])?),
        anon_key: value_text(&payload, &["key", "anonKey"])?,
        restaurant_id: value_text(&payload, &["rid", "restaurantId", "restaurante_id"])?,
    })
}

// ---------------------------------------------------------------------------
// High-level API
// ---------------------------------------------------------------------------

/// Resolve the backend configuration. Environment variables win over the
/// keyring; a connection string in `COMANDA_CONNECTION` wins over both.
pub fn load_backend_config() -> Result<BackendConfig, String> {
    if let Some(config) = env_value(ENV_CONNECTION_STRING).and_then(|raw| parse_connection_string(&raw)) {
        return Ok(config);
    }

    let lookup = |env: &str, key: &str| env_value(env).or_else(|| get_credential(key));
    let url = lookup(ENV_BACKEND_URL, KEY_BACKEND_URL)
        .ok_or("Backend not configured: missing URL")?;
    let anon_key = lookup(ENV_ANON_KEY, KEY_ANON_KEY)
        .ok_or("Backend not configured: missing anon key")?;
    let restaurant_id = lookup(ENV_RESTAURANT_ID, KEY_RESTAURANT_ID)
        .ok_or("Backend not configured: missing restaurant id")?;

    Ok(BackendConfig {
        url: normalize_backend_url(&url),
        anon_key,
        restaurant_id,
    })
}

/// Persist a backend configuration received from a connection string.
pub fn store_connection_string(raw: &str) -> Result<BackendConfig, String> {
    let config = parse_connection_string(raw).ok_or("Invalid connection string")?;
    set_credential(KEY_BACKEND_URL, &config.url)?;
    set_credential(KEY_ANON_KEY, &config.anon_key)?;
    set_credential(KEY_RESTAURANT_ID, &config.restaurant_id)?;
    info!(restaurant_id = %config.restaurant_id, "backend credentials stored");
    Ok(config)
}

/// Delete every stored credential (factory reset).
pub fn factory_reset() -> Result<(), String> {
    info!("performing factory reset – deleting all credentials");
    for key in ALL_KEYS {
        delete_credential(key)?;
    }
    Ok(())
}

//! Hosted backend client.
//!
//! The restaurant data lives in a PostgREST (Supabase) backend reached
//! directly from the POS. [`RemoteStore`] is the seam the rest of the crate
//! talks to; [`SupabaseClient`] implements it over `reqwest`. Filters are
//! equality filters rendered as `column=eq.value`.

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, StatusCode, Url};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info};

use crate::storage::BackendConfig;

/// Default timeout for backend requests.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(20);

pub const ORDERS_TABLE: &str = "pedidos";
pub const PRODUCTS_TABLE: &str = "produtos";
pub const USERS_TABLE: &str = "usuarios";
pub const ADMINS_TABLE: &str = "administradores";
pub const SETTINGS_TABLE: &str = "restaurantes";

/// `(column, value)` equality filter.
pub type Filter<'a> = (&'a str, String);

#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn select(&self, table: &str, filters: &[Filter<'_>]) -> Result<Vec<Value>, String>;

    /// Insert one row and return the stored representation.
    async fn insert(&self, table: &str, row: Value) -> Result<Value, String>;

    /// Patch every row matching `filters`; returns the updated rows.
    async fn update(
        &self,
        table: &str,
        filters: &[Filter<'_>],
        patch: Value,
    ) -> Result<Vec<Value>, String>;

    async fn delete(&self, table: &str, filters: &[Filter<'_>]) -> Result<(), String>;
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

fn friendly_error(url: &str, err: &reqwest::Error) -> String {
    if err.is_connect() {
        return format!("Cannot reach backend at {url}");
    }
    if err.is_timeout() {
        return format!("Connection to {url} timed out");
    }
    if err.is_builder() {
        return format!("Invalid backend URL: {url}");
    }
    format!("Network error communicating with {url}: {err}")
}

fn status_error(status: StatusCode) -> String {
    match status.as_u16() {
        401 => "Backend key is invalid or expired".to_string(),
        403 => "Access to this restaurant is not authorized".to_string(),
        404 => "Backend table not found".to_string(),
        409 => "Conflicting write rejected by backend".to_string(),
        s if s >= 500 => format!("Backend server error (HTTP {s})"),
        s => format!("Unexpected response from backend (HTTP {s})"),
    }
}

/// Strip trailing slashes and a trailing `/rest/v1` segment, add a scheme.
pub fn normalize_backend_url(url: &str) -> String {
    let mut url = url.trim().to_string();

    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }
    while url.ends_with('/') {
        url.pop();
    }
    if url.ends_with("/rest/v1") {
        url.truncate(url.len() - "/rest/v1".len());
    }
    while url.ends_with('/') {
        url.pop();
    }
    url
}

// ---------------------------------------------------------------------------
// Supabase client
// ---------------------------------------------------------------------------

pub struct SupabaseClient {
    base_url: String,
    anon_key: String,
    http: Client,
}

impl SupabaseClient {
    pub fn new(config: &BackendConfig) -> Result<Self, String> {
        let http = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| format!("Failed to create HTTP client: {e}"))?;
        let base_url = normalize_backend_url(&config.url);
        info!(backend = %base_url, "backend client ready");
        Ok(Self {
            base_url,
            anon_key: config.anon_key.clone(),
            http,
        })
    }

    fn table_url(&self, table: &str, filters: &[Filter<'_>]) -> Result<Url, String> {
        let mut url = Url::parse(&format!("{}/rest/v1/{table}", self.base_url))
            .map_err(|e| format!("Invalid backend URL: {e}"))?;
        {
            let mut qp = url.query_pairs_mut();
            for (column, value) in filters {
                qp.append_pair(column, &format!("eq.{value}"));
            }
        }
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        self.http
            .request(method, url)
            .header("apikey", &self.anon_key)
            .header("Authorization", format!("Bearer {}", self.anon_key))
            .header("Content-Type", "application/json")
    }

    async fn send(&self, req: RequestBuilder) -> Result<Value, String> {
        let resp = req
            .send()
            .await
            .map_err(|e| friendly_error(&self.base_url, &e))?;
        let status = resp.status();
        let body_text = resp.text().await.unwrap_or_default();

        if !status.is_success() {
            let detail = serde_json::from_str::<Value>(&body_text)
                .ok()
                .and_then(|json| {
                    json.get("message")
                        .or_else(|| json.get("error"))
                        .and_then(Value::as_str)
                        .map(str::to_string)
                });
            return Err(match detail {
                Some(message) => format!("{} (HTTP {}): {message}", status_error(status), status.as_u16()),
                None => format!("{} (HTTP {})", status_error(status), status.as_u16()),
            });
        }

        if body_text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body_text).map_err(|e| format!("Invalid JSON from backend: {e}"))
    }
}

fn into_rows(value: Value) -> Vec<Value> {
    match value {
        Value::Array(rows) => rows,
        Value::Null => Vec::new(),
        other => vec![other],
    }
}

#[async_trait]
impl RemoteStore for SupabaseClient {
    async fn select(&self, table: &str, filters: &[Filter<'_>]) -> Result<Vec<Value>, String> {
        let mut url = self.table_url(table, filters)?;
        url.query_pairs_mut()
            .append_pair("select", "*")
            .append_pair("order", "id.asc");
        let rows = into_rows(self.send(self.request(Method::GET, url)).await?);
        debug!(table, rows = rows.len(), "backend select");
        Ok(rows)
    }

    async fn insert(&self, table: &str, row: Value) -> Result<Value, String> {
        let url = self.table_url(table, &[])?;
        let req = self
            .request(Method::POST, url)
            .header("Prefer", "return=representation")
            .json(&row);
        into_rows(self.send(req).await?)
            .into_iter()
            .next()
            .ok_or_else(|| format!("Backend returned no row for insert into {table}"))
    }

    async fn update(
        &self,
        table: &str,
        filters: &[Filter<'_>],
        patch: Value,
    ) -> Result<Vec<Value>, String> {
        if filters.is_empty() {
            return Err(format!("Refusing unfiltered update on {table}"));
        }
        let url = self.table_url(table, filters)?;
        let req = self
            .request(Method::PATCH, url)
            .header("Prefer", "return=representation")
            .json(&patch);
        Ok(into_rows(self.send(req).await?))
    }

    async fn delete(&self, table: &str, filters: &[Filter<'_>]) -> Result<(), String> {
        if filters.is_empty() {
            return Err(format!("Refusing unfiltered delete on {table}"));
        }
        let url = self.table_url(table, filters)?;
        self.send(self.request(Method::DELETE, url)).await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-memory store for tests
// ---------------------------------------------------------------------------


#[cfg(test)]
mod tests {
    use super::memory::MemoryStore;
    use super::*;
    use serde_json::json;

    #[test]
    fn test_normalize_backend_url() {
        assert_eq!(
            normalize_backend_url("xyz.supabase.co/rest/v1/"),
            "https://xyz.supabase.co"
        );
        assert_eq!(
            normalize_backend_url("localhost:54321/"),
            "http://localhost:54321"
        );
        assert_eq!(
            normalize_backend_url(" https://api.example.com "),
            "https://api.example.com"
        );
    }

    #[test]
    fn test_table_url_renders_eq_filters() {
        let client = SupabaseClient::new(&BackendConfig {
            url: "https://xyz.supabase.co".into(),
            anon_key: "anon".into(),
            restaurant_id: "7".into(),
        })
        .expect("client");
        let url = client
            .table_url(ORDERS_TABLE, &[("restaurante_id", "7".into()), ("mesa", "Mesa 3".into())])
            .expect("url");
        assert_eq!(
            url.as_str(),
            "https://xyz.supabase.co/rest/v1/pedidos?restaurante_id=eq.7&mesa=eq.Mesa+3"
        );
    }

    #[tokio::test]
    async fn test_memory_store_filters_and_patches() {
        let store = MemoryStore::new();
        store.seed(
            ORDERS_TABLE,
            vec![
                json!({ "id": 1, "mesa": "Mesa 1", "status": "pendente" }),
                json!({ "id": 2, "mesa": "Mesa 2", "status": "pendente" }),
            ],
        );

        let updated = store
            .update(ORDERS_TABLE, &[("id", "2".into())], json!({ "status": "entregue" }))
            .await
            .unwrap();
        assert_eq!(updated.len(), 1);
        assert_eq!(updated[0]["status"], "entregue");

        let rows = store
            .select(ORDERS_TABLE, &[("status", "pendente".into())])
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["id"], 1);

        store.fail(ORDERS_TABLE, true);
        assert!(store.select(ORDERS_TABLE, &[]).await.is_err());
    }
}

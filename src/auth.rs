//! Email/password login against the backend's user tables.
//!
//! Input shape is validated locally before any network call. A successful
//! login persists the session token (the remote record id) and the admin
//! flag in `local_settings` so a restart can resume without a new login.
//! Failures never say whether the account exists.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::db::{self, DbState};
use crate::error::{DashboardError, DashboardResult};
use crate::remote::{RemoteStore, ADMINS_TABLE, USERS_TABLE};
use crate::{value_i64, value_str, value_text};

pub const MIN_PASSWORD_LEN: usize = 6;
const SESSION_CATEGORY: &str = "session";
const SESSION_TOKEN_KEY: &str = "token";
const SESSION_ADMIN_KEY: &str = "is_admin";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Session {
    /// Remote id of the user (or admin) record.
    pub token: String,
    pub is_admin: bool,
    pub email: Option<String>,
    pub name: Option<String>,
    pub started_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn is_well_formed_email(email: &str) -> bool {
    if email.chars().any(char::is_whitespace) {
        return false;
    }
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.contains('@')
        && domain
            .split_once('.')
            .map(|(host, tld)| !host.is_empty() && !tld.is_empty() && !tld.ends_with('.'))
            .unwrap_or(false)
}

pub fn validate_login_input(email: &str, password: &str) -> DashboardResult<()> {
    let email = email.trim();
    if email.is_empty() || password.is_empty() {
        return Err(DashboardError::Validation(
            "Email and password are required".into(),
        ));
    }
    if !is_well_formed_email(email) {
        return Err(DashboardError::Validation("Invalid email address".into()));
    }
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(DashboardError::Validation(format!(
            "Password must be at least {MIN_PASSWORD_LEN} characters"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Password check
// ---------------------------------------------------------------------------

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Stored passwords are bcrypt hashes on migrated accounts and plain text
/// on legacy rows.
fn password_matches(candidate: &str, stored: &str) -> bool {
    if stored.starts_with("$2") {
        return bcrypt::verify(candidate, stored).unwrap_or(false);
    }
    constant_time_eq(candidate.as_bytes(), stored.as_bytes())
}

fn record_token(row: &Value) -> Option<String> {
    value_i64(row, &["id"])
        .map(|id| id.to_string())
        .or_else(|| value_text(row, &["id"]))
}

// ---------------------------------------------------------------------------
// Login
// ---------------------------------------------------------------------------

async fn authenticate(
    remote: &dyn RemoteStore,
    db: &DbState,
    table: &str,
    restaurant_id: &str,
    email: &str,
    password: String,
    is_admin: bool,
) -> DashboardResult<Session> {
    let password = Zeroizing::new(password);
    validate_login_input(email, &password)?;
    let email = email.trim().to_lowercase();

    let rows = remote
        .select(
            table,
            &[("email", email.clone()), ("restaurante_id", restaurant_id.to_string())],
        )
        .await
        .map_err(|e| {
            warn!(table, error = %e, "login lookup failed");
            DashboardError::Remote(e)
        })?;

    let matched = rows.iter().find(|row| {
        value_str(row, &["senha", "password"])
            .map(|stored| password_matches(&password, &stored))
            .unwrap_or(false)
    });
    let Some(row) = matched else {
        warn!(admin = is_admin, "login rejected");
        return Err(DashboardError::InvalidCredentials);
    };
    let token = record_token(row).ok_or(DashboardError::InvalidCredentials)?;

    let session = Session {
        token,
        is_admin,
        email: Some(email),
        name: value_str(row, &["nome", "name"]),
        started_at: Utc::now(),
    };
    persist_session(db, &session).map_err(DashboardError::Storage)?;
    info!(token = %session.token, admin = is_admin, "login successful");
    Ok(session)
}

/// Staff login against `usuarios`.
pub async fn login(
    remote: &dyn RemoteStore,
    db: &DbState,
    restaurant_id: &str,
    email: &str,
    password: String,
) -> DashboardResult<Session> {
    authenticate(remote, db, USERS_TABLE, restaurant_id, email, password, false).await
}

/// Admin console login against `administradores`.
pub async fn admin_login(
    remote: &dyn RemoteStore,
    db: &DbState,
    restaurant_id: &str,
    email: &str,
    password: String,
) -> DashboardResult<Session> {
    authenticate(remote, db, ADMINS_TABLE, restaurant_id, email, password, true).await
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

pub fn persist_session(db: &DbState, session: &Session) -> Result<(), String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    db::set_setting(&conn, SESSION_CATEGORY, SESSION_TOKEN_KEY, &session.token)?;
    db::set_setting(
        &conn,
        SESSION_CATEGORY,
        SESSION_ADMIN_KEY,
        if session.is_admin { "true" } else { "false" },
    )
}

/// Read the stored session once at startup. Missing token means the user
/// has to log in again.
pub fn restore_session(db: &DbState) -> Option<Session> {
    let conn = db.conn.lock().ok()?;
    let token = db::get_setting(&conn, SESSION_CATEGORY, SESSION_TOKEN_KEY)
        .filter(|t| !t.trim().is_empty())?;
    let is_admin = db::get_setting(&conn, SESSION_CATEGORY, SESSION_ADMIN_KEY)
        .map(|v| v == "true")
        .unwrap_or(false);
    info!(token = %token, admin = is_admin, "restored stored session");
    Some(Session {
        token,
        is_admin,
        email: None,
        name: None,
        started_at: Utc::now(),
    })
}

pub fn clear_session(db: &DbState) -> Result<(), String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    db::delete_setting(&conn, SESSION_CATEGORY, SESSION_TOKEN_KEY)?;
    db::delete_setting(&conn, SESSION_CATEGORY, SESSION_ADMIN_KEY)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::memory::MemoryStore;
    use serde_json::json;

    fn store() -> MemoryStore {
        let store = MemoryStore::new();
        store.seed(
            USERS_TABLE,
            vec![
                json!({ "id": 11, "email": "ana@casa.com", "senha": "segredo1", "nome": "Ana", "restaurante_id": 1 }),
                json!({ "id": 12, "email": "bia@casa.com", "senha": bcrypt::hash("hashed-pw", 4).unwrap(), "restaurante_id": 1 }),
                json!({ "id": 13, "email": "caio@outro.com", "senha": "segredo1", "restaurante_id": 2 }),
            ],
        );
        store.seed(
            ADMINS_TABLE,
            vec![json!({ "id": 1, "email": "dono@casa.com", "senha": "admin123", "restaurante_id": 1 })],
        );
        store
    }

    #[test]
    fn test_validation_rejects_bad_shapes() {
        assert!(matches!(
            validate_login_input("", "segredo1"),
            Err(DashboardError::Validation(_))
        ));
        assert!(validate_login_input("ana.casa.com", "segredo1").is_err());
        assert!(validate_login_input("ana@casa", "segredo1").is_err());
        assert!(validate_login_input("ana @casa.com", "segredo1").is_err());
        assert!(validate_login_input("ana@casa.com", "12345").is_err());
        assert!(validate_login_input(" ana@casa.com ", "123456").is_ok());
    }

    #[tokio::test]
    async fn test_login_persists_token() {
        let remote = store();
        let db = db::test_state();
        let session = login(&remote, &db, "1", "Ana@Casa.com", "segredo1".into())
            .await
            .expect("login");
        assert_eq!(session.token, "11");
        assert!(!session.is_admin);
        assert_eq!(session.name.as_deref(), Some("Ana"));

        let restored = restore_session(&db).expect("restored");
        assert_eq!(restored.token, "11");
        assert!(!restored.is_admin);
    }

    #[tokio::test]
    async fn test_bcrypt_passwords_verify() {
        let remote = store();
        let db = db::test_state();
        let session = login(&remote, &db, "1", "bia@casa.com", "hashed-pw".into())
            .await
            .expect("login");
        assert_eq!(session.token, "12");
    }

    #[tokio::test]
    async fn test_wrong_password_and_unknown_account_look_the_same() {
        let remote = store();
        let db = db::test_state();
        let wrong = login(&remote, &db, "1", "ana@casa.com", "errada!".into()).await;
        let unknown = login(&remote, &db, "1", "ninguem@casa.com", "segredo1".into()).await;
        let other_restaurant = login(&remote, &db, "1", "caio@outro.com", "segredo1".into()).await;
        assert_eq!(wrong, Err(DashboardError::InvalidCredentials));
        assert_eq!(unknown, Err(DashboardError::InvalidCredentials));
        assert_eq!(other_restaurant, Err(DashboardError::InvalidCredentials));
        assert!(restore_session(&db).is_none());
    }

    #[tokio::test]
    async fn test_validation_happens_before_network() {
        let remote = store();
        let db = db::test_state();
        let result = login(&remote, &db, "1", "not-an-email", "segredo1".into()).await;
        assert!(matches!(result, Err(DashboardError::Validation(_))));
        assert!(remote.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_admin_login_sets_flag_and_logout_clears() {
        let remote = store();
        let db = db::test_state();
        let session = admin_login(&remote, &db, "1", "dono@casa.com", "admin123".into())
            .await
            .expect("admin login");
        assert!(session.is_admin);
        assert!(restore_session(&db).expect("restored").is_admin);

        clear_session(&db).unwrap();
        assert!(restore_session(&db).is_none());
    }

    #[tokio::test]
    async fn test_remote_failure_is_not_reported_as_bad_credentials() {
        let remote = store();
        remote.fail(USERS_TABLE, true);
        let db = db::test_state();
        let result = login(&remote, &db, "1", "ana@casa.com", "segredo1".into()).await;
        assert!(matches!(result, Err(DashboardError::Remote(_))));
    }
}

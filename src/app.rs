//! Application state for the dashboard.
//!
//! `AppState` is built once at startup and shared as `Arc<AppState>`. It
//! owns every derived cache (orders, tables, products, users), the settings
//! store, the session and the undo buffer. Creating a session starts the
//! poll loop; logout stops it and drops the caches. Locks are plain
//! `std::sync::Mutex` and are never held across an `.await`; when two are
//! needed they are taken in the order settings, orders, tables.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::{self, Session};
use crate::catalog::{Product, StaffUser};
use crate::db::DbState;
use crate::error::{DashboardError, DashboardResult};
use crate::escpos::PaperWidth;
use crate::notify::{NotificationPermission, Notifier};
use crate::pedido::Order;
use crate::print::{self, PrintChannel, PrintKind};
use crate::remote::{RemoteStore, SETTINGS_TABLE};
use crate::settings::{self, Settings, SettingsPatch, SettingsStore};
use crate::sync::{self, SyncState};
use crate::tables::{self, Table, TableAlert};
use crate::undo::{UndoAction, UndoBuffer, UndoEntry, UNDO_TICK};

const SPOOL_DIR: &str = "spool";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct AppState {
    pub remote: Arc<dyn RemoteStore>,
    pub db: Arc<DbState>,
    pub notifier: Arc<dyn Notifier>,
    pub restaurant_id: String,
    pub data_dir: PathBuf,
    pub sync: SyncState,
    orders: Mutex<Vec<Order>>,
    tables: Mutex<Vec<Table>>,
    products: Mutex<Vec<Product>>,
    users: Mutex<Vec<StaffUser>>,
    settings: Mutex<SettingsStore>,
    session: Mutex<Option<Session>>,
    undo: Arc<Mutex<UndoBuffer>>,
    undo_generation: Arc<AtomicU64>,
    notification_permission: Mutex<NotificationPermission>,
}

impl AppState {
    /// Build the state from the last settings snapshot so the board has the
    /// right number of tables before the first poll lands.
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        db: Arc<DbState>,
        notifier: Arc<dyn Notifier>,
        restaurant_id: impl Into<String>,
        data_dir: PathBuf,
    ) -> Self {
        let snapshot = db
            .conn
            .lock()
            .ok()
            .and_then(|conn| settings::load_snapshot(&conn))
            .unwrap_or_default();
        let tables = tables::generate_tables(snapshot.table_count);

        Self {
            remote,
            db,
            notifier,
            restaurant_id: restaurant_id.into(),
            data_dir,
            sync: SyncState::new(),
            orders: Mutex::new(Vec::new()),
            tables: Mutex::new(tables),
            products: Mutex::new(Vec::new()),
            users: Mutex::new(Vec::new()),
            settings: Mutex::new(SettingsStore::new(snapshot)),
            session: Mutex::new(None),
            undo: Arc::new(Mutex::new(UndoBuffer::new())),
            undo_generation: Arc::new(AtomicU64::new(0)),
            notification_permission: Mutex::new(NotificationPermission::Default),
        }
    }

    // -----------------------------------------------------------------------
    // Read access
    // -----------------------------------------------------------------------

    pub fn orders(&self) -> Vec<Order> {
        lock(&self.orders).clone()
    }

    pub fn tables(&self) -> Vec<Table> {
        lock(&self.tables).clone()
    }

    pub fn table(&self, id: u32) -> Option<Table> {
        lock(&self.tables).iter().find(|t| t.id == id).cloned()
    }

    pub fn products(&self) -> Vec<Product> {
        lock(&self.products).clone()
    }

    pub fn users(&self) -> Vec<StaffUser> {
        lock(&self.users).clone()
    }

    /// Effective settings: committed snapshot plus pending patches.
    pub fn settings(&self) -> Settings {
        lock(&self.settings).effective()
    }

    pub fn has_pending_settings(&self) -> bool {
        lock(&self.settings).has_pending()
    }

    pub fn session(&self) -> Option<Session> {
        lock(&self.session).clone()
    }

    pub fn is_authenticated(&self) -> bool {
        lock(&self.session).is_some()
    }

    pub fn require_session(&self) -> DashboardResult<Session> {
        self.session().ok_or(DashboardError::NotAuthenticated)
    }

    pub fn undo_entry(&self) -> Option<UndoEntry> {
        lock(&self.undo).current().cloned()
    }

    pub fn set_notification_permission(&self, permission: NotificationPermission) {
        *lock(&self.notification_permission) = permission;
    }

    pub fn notification_permission(&self) -> NotificationPermission {
        *lock(&self.notification_permission)
    }

    pub(crate) fn notify(&self, title: &str, body: &str) {
        self.notifier
            .notify(title, body, self.notification_permission());
    }

    // -----------------------------------------------------------------------
    // Session lifecycle
    // -----------------------------------------------------------------------

    fn begin_session(self: &Arc<Self>, session: Session) {
        *lock(&self.session) = Some(session);
        sync::start_sync_loop(Arc::clone(self), sync::SYNC_INTERVAL);
    }

    pub async fn login(self: &Arc<Self>, email: &str, password: String) -> DashboardResult<Session> {
        let session =
            auth::login(self.remote.as_ref(), &self.db, &self.restaurant_id, email, password).await?;
        self.begin_session(session.clone());
        Ok(session)
    }

    pub async fn admin_login(
        self: &Arc<Self>,
        email: &str,
        password: String,
    ) -> DashboardResult<Session> {
        let session =
            auth::admin_login(self.remote.as_ref(), &self.db, &self.restaurant_id, email, password)
                .await?;
        self.begin_session(session.clone());
        Ok(session)
    }

    /// Resume the stored session, if any, and start polling.
    pub fn restore_session(self: &Arc<Self>) -> Option<Session> {
        let session = auth::restore_session(&self.db)?;
        self.begin_session(session.clone());
        Some(session)
    }

    /// Stop polling, forget the session and drop every cache.
    pub fn logout(&self) -> DashboardResult<()> {
        self.sync.stop();
        self.undo_generation.fetch_add(1, Ordering::SeqCst);
        lock(&self.undo).dismiss();
        *lock(&self.session) = None;
        lock(&self.orders).clear();
        lock(&self.products).clear();
        lock(&self.users).clear();
        let count = self.settings().table_count;
        *lock(&self.tables) = tables::generate_tables(count);
        auth::clear_session(&self.db).map_err(DashboardError::Storage)?;
        info!("Logged out");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Cache updates
    // -----------------------------------------------------------------------

    /// Recompute the board from the current order set.
    pub(crate) fn reconcile(&self) {
        let orders = lock(&self.orders);
        let mut tables = lock(&self.tables);
        tables::reconcile_tables(&mut tables, &orders);
    }

    /// Replace the order set with a poll result. Returns the tables whose
    /// alert changed to a non-empty value.
    pub(crate) fn replace_orders(&self, polled: Vec<Order>) -> Vec<(u32, TableAlert)> {
        let mut orders = lock(&self.orders);
        *orders = polled;
        let mut tables = lock(&self.tables);
        let before: Vec<TableAlert> = tables.iter().map(|t| t.alert).collect();
        tables::reconcile_tables(&mut tables, &orders);
        tables
            .iter()
            .zip(before)
            .filter(|(table, previous)| table.alert != TableAlert::None && table.alert != *previous)
            .map(|(table, _)| (table.id, table.alert))
            .collect()
    }

    /// Apply `f` to the cached order with `id` and reconcile. Returns the
    /// order as it was before, or `None` when it is not cached.
    pub(crate) fn patch_order(&self, id: i64, f: impl FnOnce(&mut Order)) -> Option<Order> {
        let previous = {
            let mut orders = lock(&self.orders);
            let order = orders.iter_mut().find(|o| o.id == id)?;
            let previous = order.clone();
            f(order);
            previous
        };
        self.reconcile();
        Some(previous)
    }

    /// Insert or replace a cached order and reconcile.
    pub(crate) fn upsert_order(&self, order: Order) {
        {
            let mut orders = lock(&self.orders);
            match orders.iter_mut().find(|o| o.id == order.id) {
                Some(existing) => *existing = order,
                None => orders.push(order),
            }
        }
        self.reconcile();
    }

    pub(crate) fn replace_products(&self, products: Vec<Product>) {
        *lock(&self.products) = products;
    }

    pub(crate) fn patch_product_stock(&self, id: i64, stock: i64) {
        if let Some(product) = lock(&self.products).iter_mut().find(|p| p.id == id) {
            product.stock = stock;
        }
    }

    pub(crate) fn replace_users(&self, users: Vec<StaffUser>) {
        *lock(&self.users) = users;
    }

    /// Restore a table snapshot's derived fields. The next reconcile pass
    /// recomputes them from orders anyway.
    pub(crate) fn restore_table(&self, snapshot: Table) {
        if let Some(table) = lock(&self.tables).iter_mut().find(|t| t.id == snapshot.id) {
            *table = snapshot;
        }
    }

    fn apply_table_count(&self, count: u32) {
        let orders = lock(&self.orders);
        let mut tables = lock(&self.tables);
        if tables.len() as u32 != count {
            info!(from = tables.len(), to = count, "resizing table board");
            tables::resize_tables(&mut tables, count);
            tables::reconcile_tables(&mut tables, &orders);
        }
    }

    fn save_settings_snapshot(&self, settings: &Settings) {
        let result = self
            .db
            .conn
            .lock()
            .map_err(|e| e.to_string())
            .and_then(|conn| settings::save_snapshot(&conn, settings));
        if let Err(e) = result {
            warn!(error = %e, "failed to persist settings snapshot");
        }
    }

    pub(crate) fn apply_polled_settings(&self, remote: Settings) {
        let effective = {
            let mut store = lock(&self.settings);
            store.merge_remote(remote);
            store.effective()
        };
        self.save_settings_snapshot(&effective);
        self.apply_table_count(effective.table_count);
    }

    // -----------------------------------------------------------------------
    // Settings
    // -----------------------------------------------------------------------

    /// Overlay `patch` locally without writing it. The returned id commits
    /// it later ([`AppState::commit_pending_settings`]) or drops it
    /// ([`AppState::discard_settings`]).
    pub fn update_settings_optimistic(&self, patch: SettingsPatch) -> DashboardResult<Uuid> {
        if patch.is_empty() {
            return Err(DashboardError::Validation("No settings to update".into()));
        }
        patch.validate().map_err(DashboardError::Validation)?;
        let (id, effective) = {
            let mut store = lock(&self.settings);
            let id = store.apply_optimistic(patch);
            (id, store.effective())
        };
        self.apply_table_count(effective.table_count);
        debug!(%id, "settings patch applied locally");
        Ok(id)
    }

    pub fn discard_settings(&self, id: Uuid) -> bool {
        let (dropped, effective) = {
            let mut store = lock(&self.settings);
            (store.rollback(id), store.effective())
        };
        self.apply_table_count(effective.table_count);
        dropped
    }

    /// Write a pending patch. On success the backend's echo becomes the
    /// committed snapshot; on failure the patch is rolled back.
    pub async fn commit_pending_settings(&self, id: Uuid) -> DashboardResult<Settings> {
        self.require_session()?;
        let patch = lock(&self.settings)
            .pending_patch(id)
            .cloned()
            .ok_or_else(|| DashboardError::NotFound("Pending settings change".into()))?;

        let generation = self.sync.begin_settings_save();
        let result = self
            .remote
            .update(
                SETTINGS_TABLE,
                &[("id", self.restaurant_id.clone())],
                patch.to_remote_json(),
            )
            .await;
        self.sync.finish_settings_save(generation);

        let outcome = match result {
            Ok(rows) => match rows.first() {
                Some(row) => Ok(Settings::from_remote(row)),
                None => Err(DashboardError::NotFound("Restaurant settings".into())),
            },
            Err(e) => Err(DashboardError::Remote(e)),
        };

        match outcome {
            Ok(echo) => {
                let effective = {
                    let mut store = lock(&self.settings);
                    store.confirm(id, echo);
                    store.effective()
                };
                self.save_settings_snapshot(&effective);
                self.apply_table_count(effective.table_count);
                info!(%id, "settings saved");
                Ok(effective)
            }
            Err(e) => {
                warn!(%id, error = %e, "settings save failed, rolling back");
                self.discard_settings(id);
                Err(e)
            }
        }
    }

    /// Apply `patch` locally and write it in one step.
    pub async fn commit_settings(&self, patch: SettingsPatch) -> DashboardResult<Settings> {
        self.require_session()?;
        let id = self.update_settings_optimistic(patch)?;
        self.commit_pending_settings(id).await
    }

    // -----------------------------------------------------------------------
    // Undo
    // -----------------------------------------------------------------------

    /// Arm `action` and run its countdown. A newer arm or an explicit
    /// take/dismiss ends the previous countdown.
    pub(crate) fn arm_undo(&self, action: UndoAction) {
        let generation = {
            let mut undo = lock(&self.undo);
            undo.arm(action);
            self.undo_generation.fetch_add(1, Ordering::SeqCst) + 1
        };
        let undo = Arc::clone(&self.undo);
        let current = Arc::clone(&self.undo_generation);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(UNDO_TICK).await;
                if current.load(Ordering::SeqCst) != generation {
                    break;
                }
                let mut buffer = lock(&undo);
                if !buffer.is_armed() || buffer.tick().is_some() {
                    break;
                }
            }
        });
    }

    pub(crate) fn take_undo(&self) -> Option<UndoAction> {
        self.undo_generation.fetch_add(1, Ordering::SeqCst);
        lock(&self.undo).take()
    }

    pub fn dismiss_undo(&self) {
        self.undo_generation.fetch_add(1, Ordering::SeqCst);
        lock(&self.undo).dismiss();
    }

    // -----------------------------------------------------------------------
    // Printing
    // -----------------------------------------------------------------------

    fn print_channel(&self) -> PrintChannel {
        PrintChannel::from_settings(&self.settings())
    }

    pub(crate) fn spawn_kitchen_ticket(&self, order: &Order) {
        let bytes = print::render_kitchen_ticket(
            order,
            &self.products(),
            PaperWidth::Mm80,
            chrono::Local::now(),
        );
        print::spawn_delivery(
            Arc::clone(&self.db),
            self.print_channel(),
            self.data_dir.join(SPOOL_DIR),
            PrintKind::KitchenTicket,
            format!("order:{}", order.id),
            bytes,
        );
    }

    pub(crate) fn spawn_bill(&self, table: &Table) {
        let bytes = print::render_bill(table, &self.settings(), PaperWidth::Mm80, chrono::Local::now());
        print::spawn_delivery(
            Arc::clone(&self.db),
            self.print_channel(),
            self.data_dir.join(SPOOL_DIR),
            PrintKind::Bill,
            format!("table:{}", table.id),
            bytes,
        );
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::db;
    use crate::notify::recording::RecordingNotifier;
    use crate::remote::memory::MemoryStore;
    use crate::remote::{ORDERS_TABLE, PRODUCTS_TABLE, USERS_TABLE};
    use crate::undo::UNDO_TICKS;
    use chrono::Utc;
    use serde_json::json;
    use std::time::Duration;

    pub(crate) const RID: &str = "1";

    pub(crate) fn seeded_remote() -> MemoryStore {
        let remote = MemoryStore::new();
        remote.seed(
            ORDERS_TABLE,
            vec![
                json!({ "id": 1, "mesa": "Mesa 3", "itens": "Pastel, Pastel", "quantidade": "2",
                        "Subtotal": "R$ 16,00", "status": "pendente", "restaurante_id": 1 }),
                json!({ "id": 2, "mesa": "Mesa 1", "itens": "Suco", "quantidade": "1",
                        "Subtotal": "R$ 7,00", "status": "fechado", "restaurante_id": 1 }),
            ],
        );
        remote.seed(
            PRODUCTS_TABLE,
            vec![
                json!({ "id": 10, "nome": "Pastel", "preco": 8.0, "setor": "cozinha", "estoque": 5, "restaurante_id": 1 }),
                json!({ "id": 11, "nome": "Suco", "preco": 7.0, "setor": "bar", "estoque": 1, "restaurante_id": 1 }),
            ],
        );
        remote.seed(
            USERS_TABLE,
            vec![json!({ "id": 20, "nome": "Ana", "email": "ana@casa.com", "senha": "segredo1", "restaurante_id": 1 })],
        );
        remote.seed(
            SETTINGS_TABLE,
            vec![json!({ "id": 1, "nome": "Bar do Zé", "quantidade_mesas": 6, "taxa_servico": 10,
                         "impressao_automatica": false })],
        );
        remote
    }

    /// State over a seeded in-memory backend with a session already set and
    /// no poll loop running.
    pub(crate) fn seeded_state() -> (Arc<AppState>, Arc<MemoryStore>, Arc<RecordingNotifier>) {
        let remote = Arc::new(seeded_remote());
        let notifier = Arc::new(RecordingNotifier::default());
        let data_dir = std::env::temp_dir().join(format!("comanda-app-{}", Uuid::new_v4()));
        let state = Arc::new(AppState::new(
            remote.clone(),
            Arc::new(db::test_state()),
            notifier.clone(),
            RID,
            data_dir,
        ));
        *lock(&state.session) = Some(Session {
            token: "20".into(),
            is_admin: false,
            email: Some("ana@casa.com".into()),
            name: Some("Ana".into()),
            started_at: Utc::now(),
        });
        (state, remote, notifier)
    }

    impl AppState {
        pub(crate) fn clear_session_for_test(&self) {
            *lock(&self.session) = None;
        }
    }

    #[test]
    fn test_new_state_uses_snapshot_table_count() {
        let db = db::test_state();
        {
            let conn = db.conn.lock().unwrap();
            let snapshot = Settings {
                table_count: 4,
                ..Settings::default()
            };
            settings::save_snapshot(&conn, &snapshot).unwrap();
        }
        let state = AppState::new(
            Arc::new(MemoryStore::new()),
            Arc::new(db),
            Arc::new(RecordingNotifier::default()),
            RID,
            std::env::temp_dir(),
        );
        assert_eq!(state.tables().len(), 4);
        assert!(!state.is_authenticated());
    }

    #[tokio::test]
    async fn test_commit_settings_confirms_echo_and_resizes() {
        let (state, remote, _) = seeded_state();
        crate::sync::run_sync_cycle(&state).await;
        assert_eq!(state.tables().len(), 6);

        let saved = state
            .commit_settings(SettingsPatch {
                table_count: Some(8),
                flashing_alerts: Some(false),
                ..SettingsPatch::default()
            })
            .await
            .expect("saved");
        assert_eq!(saved.table_count, 8);
        assert!(!saved.flashing_alerts);
        assert!(!state.has_pending_settings());
        assert_eq!(state.tables().len(), 8);
        assert!(state.sync.is_suppressing_settings());
        assert_eq!(remote.rows(SETTINGS_TABLE)[0]["quantidade_mesas"], 8);

        let conn = state.db.conn.lock().unwrap();
        assert_eq!(settings::load_snapshot(&conn).unwrap().table_count, 8);
    }

    #[tokio::test]
    async fn test_failed_commit_rolls_back() {
        let (state, remote, _) = seeded_state();
        crate::sync::run_sync_cycle(&state).await;
        remote.fail(SETTINGS_TABLE, true);

        let result = state
            .commit_settings(SettingsPatch {
                table_count: Some(3),
                ..SettingsPatch::default()
            })
            .await;
        assert!(matches!(result, Err(DashboardError::Remote(_))));
        assert_eq!(state.settings().table_count, 6);
        assert_eq!(state.tables().len(), 6);
        assert!(!state.has_pending_settings());
    }

    #[tokio::test]
    async fn test_invalid_patch_never_reaches_backend() {
        let (state, remote, _) = seeded_state();
        let result = state
            .commit_settings(SettingsPatch {
                service_fee_percent: Some(150.0),
                ..SettingsPatch::default()
            })
            .await;
        assert!(matches!(result, Err(DashboardError::Validation(_))));
        assert_eq!(remote.call_count("update restaurantes"), 0);
    }

    #[tokio::test]
    async fn test_pending_patch_survives_poll_and_can_be_discarded() {
        let (state, _, _) = seeded_state();
        crate::sync::run_sync_cycle(&state).await;
        let id = state
            .update_settings_optimistic(SettingsPatch {
                table_count: Some(9),
                ..SettingsPatch::default()
            })
            .unwrap();
        crate::sync::run_sync_cycle(&state).await;
        assert_eq!(state.settings().table_count, 9);
        assert_eq!(state.tables().len(), 9);

        assert!(state.discard_settings(id));
        assert_eq!(state.settings().table_count, 6);
        assert_eq!(state.tables().len(), 6);
    }

    #[tokio::test]
    async fn test_commit_requires_session() {
        let (state, _, _) = seeded_state();
        state.clear_session_for_test();
        let result = state
            .commit_settings(SettingsPatch {
                auto_print: Some(true),
                ..SettingsPatch::default()
            })
            .await;
        assert_eq!(result, Err(DashboardError::NotAuthenticated));
    }

    #[tokio::test]
    async fn test_login_starts_polling_and_logout_stops() {
        let remote = Arc::new(seeded_remote());
        let state = Arc::new(AppState::new(
            remote.clone(),
            Arc::new(db::test_state()),
            Arc::new(RecordingNotifier::default()),
            RID,
            std::env::temp_dir(),
        ));
        state
            .login("ana@casa.com", "segredo1".into())
            .await
            .expect("login");
        assert!(state.is_authenticated());
        assert!(state.sync.is_running());

        state.logout().unwrap();
        assert!(!state.is_authenticated());
        assert!(!state.sync.is_running());
        assert!(state.orders().is_empty());
        assert!(auth::restore_session(&state.db).is_none());
    }

    #[tokio::test]
    async fn test_restore_session_resumes() {
        let remote = Arc::new(seeded_remote());
        let db = Arc::new(db::test_state());
        {
            let session = Session {
                token: "20".into(),
                is_admin: true,
                email: None,
                name: None,
                started_at: Utc::now(),
            };
            auth::persist_session(&db, &session).unwrap();
        }
        let state = Arc::new(AppState::new(
            remote,
            db,
            Arc::new(RecordingNotifier::default()),
            RID,
            std::env::temp_dir(),
        ));
        let session = state.restore_session().expect("restored");
        assert!(session.is_admin);
        assert!(state.sync.is_running());
        state.sync.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_undo_countdown_expires() {
        let (state, _, _) = seeded_state();
        crate::sync::run_sync_cycle(&state).await;
        let order = state.orders()[0].clone();
        state.arm_undo(UndoAction::DeliverOrder { previous: order });

        tokio::time::sleep(UNDO_TICK * u32::from(UNDO_TICKS - 1) + Duration::from_millis(100)).await;
        assert_eq!(state.undo_entry().map(|e| e.remaining_ticks), Some(1));

        tokio::time::sleep(UNDO_TICK).await;
        assert!(state.undo_entry().is_none());
        assert!(state.take_undo().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearming_restarts_countdown() {
        let (state, _, _) = seeded_state();
        crate::sync::run_sync_cycle(&state).await;
        let order = state.orders()[0].clone();
        state.arm_undo(UndoAction::DeliverOrder { previous: order.clone() });
        tokio::time::sleep(UNDO_TICK * 3 + Duration::from_millis(100)).await;

        state.arm_undo(UndoAction::DeliverOrder { previous: order });
        tokio::time::sleep(UNDO_TICK * 2 + Duration::from_millis(500)).await;
        // the first countdown would have expired by now
        assert_eq!(state.undo_entry().map(|e| e.remaining_ticks), Some(3));
    }
}

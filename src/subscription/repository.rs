//! Order repository: SQLite-backed subscription storage
//!
//! Every lifecycle use-case runs its row writes inside one
//! [`OrderRepository::transaction`] so the update is all-or-nothing. There
//! is deliberately no transaction spanning the row write and the external
//! peer registration; the reconciler closes that gap after the fact.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row, Transaction};
use tracing::{debug, warn};

use super::model::{NewSubscription, Subscription, SubscriptionStatus, SubscriptionUpdate};
use crate::error::RepositoryError;

/// Subscription table schema
pub const SUBSCRIPTION_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS subscriptions (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    identifier      TEXT    NOT NULL,
    plan_id         INTEGER NOT NULL,
    plan_label      TEXT    NOT NULL,
    price           REAL    NOT NULL,
    status          TEXT    NOT NULL CHECK (status IN ('pending', 'paid', 'expired')),
    config_path     TEXT,
    created_at      TEXT    NOT NULL,
    expires_at      TEXT,
    public_key      TEXT,
    client_address  TEXT,
    access_token    TEXT,
    user_id         INTEGER,
    messaging_id    INTEGER
);
CREATE INDEX IF NOT EXISTS idx_subscriptions_identifier ON subscriptions(identifier, id);
CREATE INDEX IF NOT EXISTS idx_subscriptions_status ON subscriptions(status);
CREATE INDEX IF NOT EXISTS idx_subscriptions_public_key ON subscriptions(public_key);
CREATE UNIQUE INDEX IF NOT EXISTS idx_subscriptions_access_token
    ON subscriptions(access_token) WHERE access_token IS NOT NULL;
"#;

const COLUMNS: &str = "id, identifier, plan_id, plan_label, price, status, config_path, \
                       created_at, expires_at, public_key, client_address, access_token, \
                       user_id, messaging_id";

/// SQLite-backed subscription store
#[derive(Clone)]
pub struct OrderRepository {
    conn: Arc<Mutex<Connection>>,
}

impl OrderRepository {
    /// Open a file-backed store, creating the schema if needed
    pub fn open(path: &Path) -> Result<Self, RepositoryError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| RepositoryError::Database(format!("{}: {e}", parent.display())))?;
            }
        }
        let conn = Connection::open(path)?;
        Self::init_connection(&conn)?;
        debug!("Opened subscription store at {:?}", path);
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory store (for testing)
    pub fn memory() -> Result<Self, RepositoryError> {
        let conn = Connection::open_in_memory()?;
        Self::init_connection(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_connection(conn: &Connection) -> Result<(), RepositoryError> {
        // In-memory databases answer "memory" instead of switching
        if let Err(e) = conn.execute_batch("PRAGMA journal_mode = WAL") {
            warn!("Could not enable WAL journal mode: {}", e);
        }
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute_batch(SUBSCRIPTION_SCHEMA)?;
        Ok(())
    }

    /// Run `f` inside one transaction; commit on `Ok`, roll back on `Err`
    pub fn transaction<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&OrderTx<'_>) -> Result<T, E>,
        E: From<RepositoryError>,
    {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(RepositoryError::from)?;
        let order_tx = OrderTx { tx };
        let value = f(&order_tx)?;
        order_tx.tx.commit().map_err(RepositoryError::from)?;
        Ok(value)
    }

    /// Most recent row for an identifier, any status
    pub fn find_latest_by_identifier(
        &self,
        identifier: &str,
    ) -> Result<Option<Subscription>, RepositoryError> {
        find_latest_by_identifier(&self.conn.lock(), identifier)
    }

    /// Fetch a row by id
    pub fn get(&self, id: i64) -> Result<Option<Subscription>, RepositoryError> {
        get(&self.conn.lock(), id)
    }

    /// Insert a row, returning its id
    pub fn insert(&self, new: &NewSubscription) -> Result<i64, RepositoryError> {
        insert(&self.conn.lock(), new)
    }

    /// Apply a partial update to one row
    pub fn update_fields(&self, id: i64, update: &SubscriptionUpdate) -> Result<(), RepositoryError> {
        update_fields(&self.conn.lock(), id, update)
    }

    /// Paid rows that have an expiry
    pub fn list_paid_with_expiry(&self) -> Result<Vec<Subscription>, RepositoryError> {
        list_where(
            &self.conn.lock(),
            "status = 'paid' AND expires_at IS NOT NULL",
            params![],
        )
    }

    /// All paid rows
    pub fn list_paid(&self) -> Result<Vec<Subscription>, RepositoryError> {
        list_where(&self.conn.lock(), "status = 'paid'", params![])
    }

    /// Every row owned by a user, newest first
    pub fn list_by_owner(&self, user_id: i64) -> Result<Vec<Subscription>, RepositoryError> {
        list_where(
            &self.conn.lock(),
            "user_id = ?1 ORDER BY id DESC",
            params![user_id],
        )
    }

    /// Flip a paid row to expired; returns whether the row changed
    pub fn mark_expired(&self, id: i64) -> Result<bool, RepositoryError> {
        mark_expired(&self.conn.lock(), id)
    }

    /// Addresses recorded on any row
    pub fn assigned_addresses(&self) -> Result<Vec<Ipv4Addr>, RepositoryError> {
        assigned_addresses(&self.conn.lock())
    }

    /// Number of rows in the given status
    pub fn count_by_status(&self, status: SubscriptionStatus) -> Result<u64, RepositoryError> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM subscriptions WHERE status = ?1",
            [status.as_str()],
            |row| row.get(0),
        )?;
        Ok(u64::try_from(count).unwrap_or(0))
    }
}

/// Handle to an open transaction
pub struct OrderTx<'conn> {
    tx: Transaction<'conn>,
}

impl OrderTx<'_> {
    /// Most recent paid or expired row for an identifier
    pub fn find_active_by_identifier(
        &self,
        identifier: &str,
    ) -> Result<Option<Subscription>, RepositoryError> {
        find_one(
            &self.tx,
            "identifier = ?1 AND status != 'pending' ORDER BY id DESC LIMIT 1",
            params![identifier],
        )
    }

    /// Most recent pending row for an identifier
    pub fn find_latest_pending(
        &self,
        identifier: &str,
    ) -> Result<Option<Subscription>, RepositoryError> {
        find_one(
            &self.tx,
            "identifier = ?1 AND status = 'pending' ORDER BY id DESC LIMIT 1",
            params![identifier],
        )
    }

    /// Whether the identifier ever held the given plan
    pub fn has_plan_history(&self, identifier: &str, plan_id: u32) -> Result<bool, RepositoryError> {
        let found: Option<i64> = self
            .tx
            .query_row(
                "SELECT 1 FROM subscriptions WHERE identifier = ?1 AND plan_id = ?2 LIMIT 1",
                params![identifier, plan_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Most recent row carrying the given peer key
    pub fn find_by_public_key(&self, public_key: &str) -> Result<Option<Subscription>, RepositoryError> {
        find_one(
            &self.tx,
            "public_key = ?1 ORDER BY id DESC LIMIT 1",
            params![public_key],
        )
    }

    /// Paid row holding the given access token
    pub fn find_by_access_token(&self, token: &str) -> Result<Option<Subscription>, RepositoryError> {
        find_one(
            &self.tx,
            "access_token = ?1 AND status = 'paid' LIMIT 1",
            params![token],
        )
    }

    /// Insert a row, returning its id
    pub fn insert(&self, new: &NewSubscription) -> Result<i64, RepositoryError> {
        insert(&self.tx, new)
    }

    /// Apply a partial update to one row
    pub fn update_fields(&self, id: i64, update: &SubscriptionUpdate) -> Result<(), RepositoryError> {
        update_fields(&self.tx, id, update)
    }
}

// ============================================================================
// Statement helpers shared by the repository and open transactions
// ============================================================================

fn find_latest_by_identifier(
    conn: &Connection,
    identifier: &str,
) -> Result<Option<Subscription>, RepositoryError> {
    find_one(
        conn,
        "identifier = ?1 ORDER BY id DESC LIMIT 1",
        params![identifier],
    )
}

fn get(conn: &Connection, id: i64) -> Result<Option<Subscription>, RepositoryError> {
    find_one(conn, "id = ?1", params![id])
}

fn find_one(
    conn: &Connection,
    clause: &str,
    params: &[&dyn rusqlite::ToSql],
) -> Result<Option<Subscription>, RepositoryError> {
    let sql = format!("SELECT {COLUMNS} FROM subscriptions WHERE {clause}");
    let raw = conn.query_row(&sql, params, RawRow::from_row).optional()?;
    raw.map(Subscription::try_from).transpose()
}

/// Rows matching `clause`; ascending id unless the clause orders itself
fn list_where(
    conn: &Connection,
    clause: &str,
    params: &[&dyn rusqlite::ToSql],
) -> Result<Vec<Subscription>, RepositoryError> {
    let order = if clause.contains("ORDER BY") { "" } else { " ORDER BY id" };
    let sql = format!("SELECT {COLUMNS} FROM subscriptions WHERE {clause}{order}");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params, RawRow::from_row)?;

    let mut out = Vec::new();
    for raw in rows {
        out.push(Subscription::try_from(raw?)?);
    }
    Ok(out)
}

fn insert(conn: &Connection, new: &NewSubscription) -> Result<i64, RepositoryError> {
    conn.execute(
        r#"
        INSERT INTO subscriptions (
            identifier, plan_id, plan_label, price, status,
            created_at, expires_at, user_id, messaging_id
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
        "#,
        params![
            new.identifier,
            new.plan_id,
            new.plan_label,
            new.price,
            new.status.as_str(),
            new.created_at.to_rfc3339(),
            new.expires_at.map(|t| t.to_rfc3339()),
            new.user_id,
            new.messaging_id,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

fn update_fields(
    conn: &Connection,
    id: i64,
    update: &SubscriptionUpdate,
) -> Result<(), RepositoryError> {
    if update.is_empty() {
        return Ok(());
    }

    let mut sets: Vec<&'static str> = Vec::new();
    let mut values: Vec<Value> = Vec::new();

    if let Some(status) = update.status {
        sets.push("status");
        values.push(Value::Text(status.as_str().to_string()));
    }
    if let Some(plan_id) = update.plan_id {
        sets.push("plan_id");
        values.push(Value::Integer(i64::from(plan_id)));
    }
    if let Some(label) = &update.plan_label {
        sets.push("plan_label");
        values.push(Value::Text(label.clone()));
    }
    if let Some(price) = update.price {
        sets.push("price");
        values.push(Value::Real(price));
    }
    if let Some(expires_at) = update.expires_at {
        sets.push("expires_at");
        values.push(opt_text(expires_at.map(|t| t.to_rfc3339())));
    }
    if let Some(path) = &update.config_path {
        sets.push("config_path");
        values.push(opt_text(
            path.as_ref().map(|p| p.to_string_lossy().into_owned()),
        ));
    }
    if let Some(key) = &update.public_key {
        sets.push("public_key");
        values.push(opt_text(key.clone()));
    }
    if let Some(addr) = update.client_address {
        sets.push("client_address");
        values.push(opt_text(addr.map(|a| a.to_string())));
    }
    if let Some(token) = &update.access_token {
        sets.push("access_token");
        values.push(opt_text(token.clone()));
    }
    if let Some(user_id) = update.user_id {
        sets.push("user_id");
        values.push(user_id.map_or(Value::Null, Value::Integer));
    }
    if let Some(messaging_id) = update.messaging_id {
        sets.push("messaging_id");
        values.push(messaging_id.map_or(Value::Null, Value::Integer));
    }

    let assignments: Vec<String> = sets
        .iter()
        .enumerate()
        .map(|(i, column)| format!("{column} = ?{}", i + 1))
        .collect();
    let sql = format!(
        "UPDATE subscriptions SET {} WHERE id = ?{}",
        assignments.join(", "),
        values.len() + 1
    );
    values.push(Value::Integer(id));

    let changed = conn.execute(&sql, params_from_iter(values.iter()))?;
    if changed == 0 {
        return Err(RepositoryError::NotFound(id));
    }
    Ok(())
}

fn mark_expired(conn: &Connection, id: i64) -> Result<bool, RepositoryError> {
    let changed = conn.execute(
        "UPDATE subscriptions SET status = 'expired' WHERE id = ?1 AND status = 'paid'",
        params![id],
    )?;
    Ok(changed > 0)
}

fn assigned_addresses(conn: &Connection) -> Result<Vec<Ipv4Addr>, RepositoryError> {
    let mut stmt =
        conn.prepare("SELECT id, client_address FROM subscriptions WHERE client_address IS NOT NULL")?;
    let rows = stmt.query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))?;

    let mut out = Vec::new();
    for row in rows {
        let (id, text) = row?;
        let addr = parse_address(&text).ok_or_else(|| RepositoryError::CorruptRow {
            order_id: id,
            field: "client_address",
            reason: format!("not an IPv4 address: {text}"),
        })?;
        out.push(addr);
    }
    Ok(out)
}

fn opt_text(value: Option<String>) -> Value {
    value.map_or(Value::Null, Value::Text)
}

/// Parse a stored address, tolerating a trailing prefix length (`10.0.0.2/32`)
pub(crate) fn parse_address(text: &str) -> Option<Ipv4Addr> {
    text.split('/').next()?.trim().parse().ok()
}

fn parse_timestamp(
    order_id: i64,
    field: &'static str,
    text: &str,
) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::CorruptRow {
            order_id,
            field,
            reason: e.to_string(),
        })
}

/// Column values as stored, before type checking
struct RawRow {
    id: i64,
    identifier: String,
    plan_id: i64,
    plan_label: String,
    price: f64,
    status: String,
    config_path: Option<String>,
    created_at: String,
    expires_at: Option<String>,
    public_key: Option<String>,
    client_address: Option<String>,
    access_token: Option<String>,
    user_id: Option<i64>,
    messaging_id: Option<i64>,
}

impl RawRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            identifier: row.get(1)?,
            plan_id: row.get(2)?,
            plan_label: row.get(3)?,
            price: row.get(4)?,
            status: row.get(5)?,
            config_path: row.get(6)?,
            created_at: row.get(7)?,
            expires_at: row.get(8)?,
            public_key: row.get(9)?,
            client_address: row.get(10)?,
            access_token: row.get(11)?,
            user_id: row.get(12)?,
            messaging_id: row.get(13)?,
        })
    }
}

impl TryFrom<RawRow> for Subscription {
    type Error = RepositoryError;

    fn try_from(raw: RawRow) -> Result<Self, Self::Error> {
        let id = raw.id;
        let corrupt = |field: &'static str, reason: String| RepositoryError::CorruptRow {
            order_id: id,
            field,
            reason,
        };

        let status = raw
            .status
            .parse::<SubscriptionStatus>()
            .map_err(|e| corrupt("status", e))?;
        let plan_id = u32::try_from(raw.plan_id).map_err(|e| corrupt("plan_id", e.to_string()))?;
        let created_at = parse_timestamp(id, "created_at", &raw.created_at)?;
        let expires_at = raw
            .expires_at
            .as_deref()
            .map(|text| parse_timestamp(id, "expires_at", text))
            .transpose()?;
        let client_address = raw
            .client_address
            .as_deref()
            .map(|text| {
                parse_address(text).ok_or_else(|| corrupt("client_address", text.to_string()))
            })
            .transpose()?;

        Ok(Subscription {
            id,
            identifier: raw.identifier,
            plan_id,
            plan_label: raw.plan_label,
            price: raw.price,
            status,
            config_path: raw.config_path.map(PathBuf::from),
            created_at,
            expires_at,
            public_key: raw.public_key,
            client_address,
            access_token: raw.access_token,
            user_id: raw.user_id,
            messaging_id: raw.messaging_id,
        })
    }
}

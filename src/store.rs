//! Config store adapter.
//!
//! The router only ever reads; writes happen through the admin surface and
//! probe bookkeeping. The trait is intentionally narrow so a different
//! backend can be dropped in; the bundled implementation is sqlite with
//! every call pushed onto the blocking pool.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;

use crate::logbus::LogEvent;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite join error: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("row not found")]
    NotFound,
}

#[derive(Clone, Debug, Default)]
pub struct ProviderRow {
    pub id: u64,
    pub provider_type: String,
    pub base_url: String,
    pub default_headers_json: Option<String>,
    pub model_map_json: Option<String>,
    pub models_json: Option<String>,
    pub enabled: bool,
}

#[derive(Clone, Debug, Default)]
pub struct CredentialRow {
    pub id: u64,
    pub provider_id: u64,
    pub api_key_ciphertext: Vec<u8>,
    pub weight: u32,
    pub concurrency_limit: Option<u32>,
    pub enabled: bool,
}

#[derive(Clone, Debug, Default)]
pub struct PoolRow {
    pub id: u64,
    pub name: String,
    pub client_key: String,
    pub strategy: String,
    pub tiers_json: Option<String>,
    pub credential_ids_json: Option<String>,
    pub model_map_json: Option<String>,
    pub enabled: bool,
}

/// Result of an admin credential probe, written back onto the row.
#[derive(Clone, Debug, Default)]
pub struct CredentialTestResult {
    pub ok: bool,
    pub status: u16,
    pub latency_ms: u64,
    pub ttft_ms: u64,
    pub tps: f64,
    pub model: String,
    pub error: String,
}

#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn list_providers(&self) -> Result<Vec<ProviderRow>, StoreError>;
    async fn list_credentials(&self) -> Result<Vec<CredentialRow>, StoreError>;
    async fn list_pools(&self) -> Result<Vec<PoolRow>, StoreError>;

    async fn insert_log(&self, event: &LogEvent) -> Result<(), StoreError>;

    async fn get_provider(&self, provider_id: u64) -> Result<ProviderRow, StoreError>;
    async fn get_credential(&self, credential_id: u64) -> Result<CredentialRow, StoreError>;
    async fn provider_credential_ids(&self, provider_id: u64) -> Result<Vec<u64>, StoreError>;
    async fn pool_client_key(&self, pool_id: u64) -> Result<String, StoreError>;
    async fn record_credential_test(
        &self,
        credential_id: u64,
        result: &CredentialTestResult,
    ) -> Result<(), StoreError>;
}

#[derive(Clone, Debug)]
pub struct SqliteStore {
    path: PathBuf,
}

impl SqliteStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn init(&self) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            init_schema(conn)?;
            Ok(())
        })
        .await
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = open_connection(&path)?;
            f(&conn)
        })
        .await?
    }
}

fn open_connection(path: &Path) -> Result<Connection, StoreError> {
    let conn = Connection::open(path)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "busy_timeout", 5000)?;
    Ok(conn)
}

fn init_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS providers (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            type TEXT NOT NULL,
            base_url TEXT NOT NULL,
            default_headers_json TEXT,
            model_map_json TEXT,
            models_json TEXT,
            enabled INTEGER NOT NULL DEFAULT 1
        );
        CREATE TABLE IF NOT EXISTS credentials (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            provider_id INTEGER NOT NULL,
            api_key_ciphertext BLOB NOT NULL,
            weight INTEGER NOT NULL DEFAULT 1,
            concurrency_limit INTEGER,
            enabled INTEGER NOT NULL DEFAULT 1,
            last_test_ok INTEGER,
            last_test_status INTEGER,
            last_test_latency_ms INTEGER,
            last_test_ttft_ms INTEGER,
            last_test_tps REAL,
            last_test_model TEXT,
            last_test_error TEXT,
            last_test_at_ms INTEGER
        );
        CREATE TABLE IF NOT EXISTS pools (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL DEFAULT '',
            client_key TEXT NOT NULL UNIQUE,
            strategy TEXT NOT NULL DEFAULT 'weighted_rr',
            tiers_json TEXT,
            credential_ids_json TEXT,
            model_map_json TEXT,
            enabled INTEGER NOT NULL DEFAULT 1
        );
        CREATE TABLE IF NOT EXISTS request_logs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            ts_ms INTEGER NOT NULL,
            request_id TEXT NOT NULL,
            pool_id INTEGER NOT NULL,
            provider_id INTEGER NOT NULL,
            credential_id INTEGER NOT NULL,
            client_key TEXT NOT NULL,
            src_ip TEXT,
            user_agent TEXT,
            is_test INTEGER NOT NULL DEFAULT 0,
            stream INTEGER NOT NULL DEFAULT 0,
            request_bytes INTEGER NOT NULL DEFAULT 0,
            response_bytes INTEGER NOT NULL DEFAULT 0,
            facade TEXT NOT NULL,
            req_model TEXT,
            upstream_model TEXT,
            status INTEGER NOT NULL,
            latency_ms INTEGER NOT NULL,
            ttft_ms INTEGER NOT NULL DEFAULT 0,
            tps REAL NOT NULL DEFAULT 0,
            input_tokens INTEGER NOT NULL DEFAULT 0,
            output_tokens INTEGER NOT NULL DEFAULT 0,
            error_msg TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_request_logs_ts ON request_logs (ts_ms);
        CREATE INDEX IF NOT EXISTS idx_credentials_provider
            ON credentials (provider_id);",
    )?;
    Ok(())
}

fn provider_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ProviderRow> {
    Ok(ProviderRow {
        id: row.get::<_, i64>(0)? as u64,
        provider_type: row.get(1)?,
        base_url: row.get(2)?,
        default_headers_json: row.get(3)?,
        model_map_json: row.get(4)?,
        models_json: row.get(5)?,
        enabled: row.get::<_, i64>(6)? != 0,
    })
}

fn credential_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CredentialRow> {
    let weight = row.get::<_, i64>(3)?;
    Ok(CredentialRow {
        id: row.get::<_, i64>(0)? as u64,
        provider_id: row.get::<_, i64>(1)? as u64,
        api_key_ciphertext: row.get(2)?,
        weight: if weight <= 0 { 1 } else { weight as u32 },
        concurrency_limit: row
            .get::<_, Option<i64>>(4)?
            .filter(|limit| *limit > 0)
            .map(|limit| limit as u32),
        enabled: row.get::<_, i64>(5)? != 0,
    })
}

const CREDENTIAL_COLUMNS: &str =
    "id, provider_id, api_key_ciphertext, weight, concurrency_limit, enabled";
const PROVIDER_COLUMNS: &str =
    "id, type, base_url, default_headers_json, model_map_json, models_json, enabled";

#[async_trait]
impl ConfigStore for SqliteStore {
    async fn list_providers(&self) -> Result<Vec<ProviderRow>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {PROVIDER_COLUMNS} FROM providers WHERE enabled = 1"
            ))?;
            let rows = stmt.query_map([], provider_from_row)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await
    }

    async fn list_credentials(&self) -> Result<Vec<CredentialRow>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {CREDENTIAL_COLUMNS} FROM credentials WHERE enabled = 1 ORDER BY id"
            ))?;
            let rows = stmt.query_map([], credential_from_row)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await
    }

    async fn list_pools(&self) -> Result<Vec<PoolRow>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, client_key, strategy, tiers_json, credential_ids_json,
                        model_map_json, enabled
                 FROM pools WHERE enabled = 1",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(PoolRow {
                    id: row.get::<_, i64>(0)? as u64,
                    name: row.get(1)?,
                    client_key: row.get(2)?,
                    strategy: row.get(3)?,
                    tiers_json: row.get(4)?,
                    credential_ids_json: row.get(5)?,
                    model_map_json: row.get(6)?,
                    enabled: row.get::<_, i64>(7)? != 0,
                })
            })?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await
    }

    async fn insert_log(&self, event: &LogEvent) -> Result<(), StoreError> {
        let ev = event.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO request_logs (
                    ts_ms, request_id, pool_id, provider_id, credential_id, client_key,
                    src_ip, user_agent, is_test, stream, request_bytes, response_bytes,
                    facade, req_model, upstream_model, status, latency_ms, ttft_ms, tps,
                    input_tokens, output_tokens, error_msg
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
                          ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22)",
                params![
                    ev.ts_ms as i64,
                    ev.request_id,
                    ev.pool_id as i64,
                    ev.provider_id as i64,
                    ev.credential_id as i64,
                    ev.client_key,
                    ev.src_ip,
                    ev.user_agent,
                    ev.is_test as i64,
                    ev.stream as i64,
                    ev.request_bytes as i64,
                    ev.response_bytes as i64,
                    ev.facade,
                    ev.request_model,
                    ev.upstream_model,
                    ev.status as i64,
                    ev.latency_ms as i64,
                    ev.ttft_ms as i64,
                    ev.tps,
                    ev.input_tokens,
                    ev.output_tokens,
                    ev.error,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_provider(&self, provider_id: u64) -> Result<ProviderRow, StoreError> {
        self.with_conn(move |conn| {
            conn.query_row(
                &format!("SELECT {PROVIDER_COLUMNS} FROM providers WHERE id = ?1"),
                params![provider_id as i64],
                provider_from_row,
            )
            .optional()?
            .ok_or(StoreError::NotFound)
        })
        .await
    }

    async fn get_credential(&self, credential_id: u64) -> Result<CredentialRow, StoreError> {
        self.with_conn(move |conn| {
            conn.query_row(
                &format!("SELECT {CREDENTIAL_COLUMNS} FROM credentials WHERE id = ?1"),
                params![credential_id as i64],
                credential_from_row,
            )
            .optional()?
            .ok_or(StoreError::NotFound)
        })
        .await
    }

    async fn provider_credential_ids(&self, provider_id: u64) -> Result<Vec<u64>, StoreError> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id FROM credentials WHERE provider_id = ?1 AND enabled = 1
                 ORDER BY id DESC",
            )?;
            let rows = stmt.query_map(params![provider_id as i64], |row| {
                row.get::<_, i64>(0).map(|id| id as u64)
            })?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await
    }

    async fn pool_client_key(&self, pool_id: u64) -> Result<String, StoreError> {
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT client_key FROM pools WHERE id = ?1",
                params![pool_id as i64],
                |row| row.get::<_, String>(0),
            )
            .optional()?
            .ok_or(StoreError::NotFound)
        })
        .await
    }

    async fn record_credential_test(
        &self,
        credential_id: u64,
        result: &CredentialTestResult,
    ) -> Result<(), StoreError> {
        let result = result.clone();
        let now = crate::logbus::now_millis();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE credentials SET
                    last_test_ok = ?1, last_test_status = ?2, last_test_latency_ms = ?3,
                    last_test_ttft_ms = ?4, last_test_tps = ?5, last_test_model = ?6,
                    last_test_error = ?7, last_test_at_ms = ?8
                 WHERE id = ?9",
                params![
                    result.ok as i64,
                    result.status as i64,
                    result.latency_ms as i64,
                    result.ttft_ms as i64,
                    result.tps,
                    result.model,
                    result.error,
                    now as i64,
                    credential_id as i64,
                ],
            )?;
            Ok(())
        })
        .await
    }
}

/// Seeding helpers used by integration tests and deployment tooling.
impl SqliteStore {
    pub async fn insert_provider(&self, row: ProviderRow) -> Result<u64, StoreError> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO providers (type, base_url, default_headers_json, model_map_json,
                                        models_json, enabled)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    row.provider_type,
                    row.base_url,
                    row.default_headers_json,
                    row.model_map_json,
                    row.models_json,
                    row.enabled as i64,
                ],
            )?;
            Ok(conn.last_insert_rowid() as u64)
        })
        .await
    }

    pub async fn insert_credential(&self, row: CredentialRow) -> Result<u64, StoreError> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO credentials (provider_id, api_key_ciphertext, weight,
                                          concurrency_limit, enabled)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    row.provider_id as i64,
                    row.api_key_ciphertext,
                    row.weight as i64,
                    row.concurrency_limit.map(|limit| limit as i64),
                    row.enabled as i64,
                ],
            )?;
            Ok(conn.last_insert_rowid() as u64)
        })
        .await
    }

    pub async fn insert_pool(&self, row: PoolRow) -> Result<u64, StoreError> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO pools (name, client_key, strategy, tiers_json,
                                    credential_ids_json, model_map_json, enabled)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    row.name,
                    row.client_key,
                    row.strategy,
                    row.tiers_json,
                    row.credential_ids_json,
                    row.model_map_json,
                    row.enabled as i64,
                ],
            )?;
            Ok(conn.last_insert_rowid() as u64)
        })
        .await
    }
}

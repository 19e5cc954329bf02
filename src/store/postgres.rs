//! Postgres-backed catalog.

use super::{CatalogStore, RequestLogSink, StoreError};
use crate::model::{ErrorSimulation, Folder, FolderKey, HeaderRequirement, Mock, ResponseBody};
use crate::request_log::RequestLogRecord;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::types::Json;
use sqlx::PgPool;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

/// Connection parameters for the catalog database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub name: String,
    pub user: String,
    #[serde(skip_serializing)]
    pub password: String,
}

impl DatabaseConfig {
    pub fn connect_options(&self) -> PgConnectOptions {
        PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .database(&self.name)
            .username(&self.user)
            .password(&self.password)
    }
}

const SCHEMA: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS folders (
        name TEXT NOT NULL,
        parent_name TEXT NOT NULL DEFAULT '',
        proxy_enabled BOOLEAN NOT NULL DEFAULT FALSE,
        proxy_base_url TEXT,
        display_order INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (name, parent_name)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS mocks (
        id UUID PRIMARY KEY,
        folder_name TEXT NOT NULL,
        folder_parent TEXT DEFAULT '',
        method TEXT NOT NULL,
        path TEXT NOT NULL,
        headers JSONB,
        body_contains TEXT,
        body_contains_required BOOLEAN NOT NULL DEFAULT FALSE,
        status_code INTEGER NOT NULL DEFAULT 200,
        response_headers JSONB,
        response_body JSONB,
        active BOOLEAN NOT NULL DEFAULT TRUE,
        delay_ms INTEGER NOT NULL DEFAULT 0,
        delay_range_min_ms INTEGER,
        delay_range_max_ms INTEGER,
        cache_enabled BOOLEAN NOT NULL DEFAULT FALSE,
        cache_ttl_seconds INTEGER,
        error_simulation_enabled BOOLEAN NOT NULL DEFAULT FALSE,
        error_simulation_probability DOUBLE PRECISION NOT NULL DEFAULT 0,
        error_simulation_status_code INTEGER,
        error_simulation_body JSONB,
        error_simulation_delay_ms INTEGER NOT NULL DEFAULT 0,
        display_order INTEGER NOT NULL DEFAULT 0,
        FOREIGN KEY (folder_name, folder_parent)
            REFERENCES folders (name, parent_name) ON DELETE CASCADE
    )"#,
    r#"CREATE TABLE IF NOT EXISTS request_logs (
        id UUID PRIMARY KEY,
        created_at TIMESTAMPTZ NOT NULL,
        folder_name TEXT NOT NULL,
        folder_parent TEXT NOT NULL DEFAULT '',
        method TEXT NOT NULL,
        path TEXT NOT NULL,
        is_proxied BOOLEAN NOT NULL,
        response_time_ms BIGINT NOT NULL,
        status_code INTEGER NOT NULL,
        cache_ttl_seconds BIGINT,
        cache_key TEXT,
        capture JSONB,
        FOREIGN KEY (folder_name, folder_parent)
            REFERENCES folders (name, parent_name) ON DELETE CASCADE
    )"#,
    "CREATE INDEX IF NOT EXISTS mocks_folder_idx ON mocks (folder_name, folder_parent)",
    "INSERT INTO folders (name, parent_name) VALUES ('default', '') ON CONFLICT DO NOTHING",
];

const MOCK_COLUMNS: &str = "id, folder_name, folder_parent, method, path, headers, body_contains, \
    body_contains_required, status_code, response_headers, response_body, active, delay_ms, \
    delay_range_min_ms, delay_range_max_ms, cache_enabled, cache_ttl_seconds, \
    error_simulation_enabled, error_simulation_probability, error_simulation_status_code, \
    error_simulation_body, error_simulation_delay_ms, display_order";

#[derive(sqlx::FromRow)]
struct FolderRow {
    name: String,
    parent_name: String,
    proxy_enabled: bool,
    proxy_base_url: Option<String>,
    display_order: i32,
}

impl From<FolderRow> for Folder {
    fn from(row: FolderRow) -> Self {
        Folder {
            name: row.name,
            parent_name: row.parent_name,
            proxy_enabled: row.proxy_enabled,
            proxy_base_url: row.proxy_base_url,
            display_order: row.display_order,
        }
    }
}

#[derive(sqlx::FromRow)]
struct MockRow {
    id: Uuid,
    folder_name: String,
    folder_parent: Option<String>,
    method: String,
    path: String,
    headers: Option<Json<Value>>,
    body_contains: Option<String>,
    body_contains_required: bool,
    status_code: i32,
    response_headers: Option<Json<Value>>,
    response_body: Option<Json<Value>>,
    active: bool,
    delay_ms: i32,
    delay_range_min_ms: Option<i32>,
    delay_range_max_ms: Option<i32>,
    cache_enabled: bool,
    cache_ttl_seconds: Option<i32>,
    error_simulation_enabled: bool,
    error_simulation_probability: f64,
    error_simulation_status_code: Option<i32>,
    error_simulation_body: Option<Json<Value>>,
    error_simulation_delay_ms: i32,
    display_order: i32,
}

fn non_negative(value: i32) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn status(value: i32) -> Result<u16, StoreError> {
    u16::try_from(value).map_err(|_| StoreError::Decode(format!("invalid status code {}", value)))
}

/// JSON column into a map; SQL NULL and JSON `null` both read as empty.
fn json_map<T: DeserializeOwned>(column: Option<Json<Value>>) -> Result<BTreeMap<String, T>, StoreError> {
    match column.map(|Json(v)| v) {
        None | Some(Value::Null) => Ok(BTreeMap::new()),
        Some(value) => serde_json::from_value(value).map_err(|e| StoreError::Decode(e.to_string())),
    }
}

impl TryFrom<MockRow> for Mock {
    type Error = StoreError;

    fn try_from(row: MockRow) -> Result<Self, Self::Error> {
        let headers: BTreeMap<String, HeaderRequirement> = json_map(row.headers)?;
        let response_headers: BTreeMap<String, String> = json_map(row.response_headers)?;

        Ok(Mock {
            id: row.id,
            folder_name: row.folder_name,
            parent_name: Some(row.folder_parent.unwrap_or_default()),
            method: row.method,
            path: row.path,
            headers,
            body_contains: row.body_contains,
            body_contains_required: row.body_contains_required,
            status_code: status(row.status_code)?,
            response_headers,
            response_body: row
                .response_body
                .map(|Json(v)| ResponseBody::from(v))
                .unwrap_or_default(),
            active: row.active,
            delay_ms: non_negative(row.delay_ms),
            delay_range_min_ms: row.delay_range_min_ms.map(non_negative),
            delay_range_max_ms: row.delay_range_max_ms.map(non_negative),
            cache_enabled: row.cache_enabled,
            cache_ttl_seconds: row.cache_ttl_seconds.map(non_negative),
            error_simulation: ErrorSimulation {
                enabled: row.error_simulation_enabled,
                probability: row.error_simulation_probability,
                status_code: row.error_simulation_status_code.map(status).transpose()?,
                body: row.error_simulation_body.map(|Json(v)| v),
                delay_ms: non_negative(row.error_simulation_delay_ms),
            },
            display_order: row.display_order,
        })
    }
}

/// Catalog stored in Postgres.
#[derive(Clone)]
pub struct PgCatalog {
    pool: PgPool,
}

impl PgCatalog {
    /// Open a connection pool.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(16)
            .acquire_timeout(Duration::from_secs(5))
            .connect_with(config.connect_options())
            .await?;
        info!(host = %config.host, database = %config.name, "Connected to catalog database");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create missing tables and the `default` root folder.
    pub async fn bootstrap(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Delete a folder and its subfolders; mocks and request logs follow by cascade.
    pub async fn delete_folder(&self, key: &FolderKey) -> Result<u64, StoreError> {
        if key.is_default_root() {
            return Err(StoreError::ProtectedFolder(key.clone()));
        }

        let mut tx = self.pool.begin().await?;
        let mut removed = 0;
        if key.is_root() {
            removed += sqlx::query("DELETE FROM folders WHERE parent_name = $1")
                .bind(&key.name)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }
        let own = sqlx::query("DELETE FROM folders WHERE name = $1 AND parent_name = $2")
            .bind(&key.name)
            .bind(&key.parent)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if own == 0 {
            return Err(StoreError::FolderNotFound(key.clone()));
        }
        tx.commit().await?;
        Ok(removed + own)
    }

    async fn folder(&self, key: &FolderKey) -> Result<Option<Folder>, StoreError> {
        let row = sqlx::query_as::<_, FolderRow>(
            "SELECT name, parent_name, proxy_enabled, proxy_base_url, display_order \
             FROM folders WHERE name = $1 AND parent_name = $2",
        )
        .bind(&key.name)
        .bind(&key.parent)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Folder::from))
    }
}

#[async_trait]
impl CatalogStore for PgCatalog {
    async fn find_root_folder(&self, name: &str) -> Result<Option<Folder>, StoreError> {
        self.folder(&FolderKey::root(name)).await
    }

    async fn find_subfolder(&self, name: &str, parent: &str) -> Result<Option<Folder>, StoreError> {
        self.folder(&FolderKey::child(name, parent)).await
    }

    async fn active_mocks(&self, folder: &FolderKey) -> Result<Vec<Mock>, StoreError> {
        let sql = format!(
            "SELECT {} FROM mocks \
             WHERE active AND folder_name = $1 AND COALESCE(folder_parent, '') = $2",
            MOCK_COLUMNS
        );
        let rows = sqlx::query_as::<_, MockRow>(&sql)
            .bind(&folder.name)
            .bind(&folder.parent)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Mock::try_from).collect()
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl RequestLogSink for PgCatalog {
    async fn append(&self, record: &RequestLogRecord) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO request_logs (id, created_at, folder_name, folder_parent, method, path, \
             is_proxied, response_time_ms, status_code, cache_ttl_seconds, cache_key, capture) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
        )
        .bind(record.id)
        .bind(record.timestamp)
        .bind(&record.folder.name)
        .bind(&record.folder.parent)
        .bind(&record.method)
        .bind(&record.path)
        .bind(record.is_proxied)
        .bind(i64::try_from(record.response_time_ms).unwrap_or(i64::MAX))
        .bind(i32::from(record.status_code))
        .bind(record.cache_ttl_seconds.map(|ttl| i64::try_from(ttl).unwrap_or(i64::MAX)))
        .bind(record.cache_key.as_deref())
        .bind(record.capture.as_ref().map(Json))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

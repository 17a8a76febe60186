//! PostgreSQL deployment store implementation.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;

use crate::config::DatabaseConfig;
use crate::error::{ControlError, ControlResult};
use crate::state::{check_transition, DeploymentStatus};
use crate::types::{
    DeploymentData, DeploymentId, DeploymentKind, DeploymentRecord, Framework, ResourceSpec,
    StatusPatch,
};

use super::{DeploymentFilter, DeploymentStore};

const COLUMNS: &str = "id, name, kind, framework, repo_url, cores, memory_mb, disk_gb, \
                       env_vars, address, resource_id, status, error, \
                       created_at, updated_at, deployed_at, deleted_at";

const NAME_INDEX: &str = "uq_deployments_live_name";
const RESOURCE_INDEX: &str = "uq_deployments_live_resource";

/// PostgreSQL-backed deployment store.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect to PostgreSQL and create a new store.
    ///
    /// The required tables are created if they don't exist.
    pub async fn new(url: &str) -> ControlResult<Self> {
        Self::connect(&DatabaseConfig {
            url: url.to_owned(),
            ..DatabaseConfig::default()
        })
        .await
    }

    /// Connect using the pool settings from configuration.
    pub async fn connect(config: &DatabaseConfig) -> ControlResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .connect(&config.url)
            .await?;

        Self::from_pool(pool).await
    }

    /// Create a store from an existing connection pool.
    pub async fn from_pool(pool: PgPool) -> ControlResult<Self> {
        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    /// Ensure the required tables exist.
    async fn ensure_schema(&self) -> ControlResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS deployments (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                kind TEXT NOT NULL,
                framework TEXT NOT NULL,
                repo_url TEXT NOT NULL,
                cores INTEGER NOT NULL,
                memory_mb INTEGER NOT NULL,
                disk_gb INTEGER NOT NULL,
                env_vars JSONB NOT NULL DEFAULT '{}'::jsonb,
                address TEXT,
                resource_id INTEGER,
                status TEXT NOT NULL,
                error TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                deployed_at TIMESTAMPTZ,
                deleted_at TIMESTAMPTZ
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(&format!(
            "CREATE UNIQUE INDEX IF NOT EXISTS {NAME_INDEX} \
             ON deployments (name) WHERE status <> 'deleted'"
        ))
        .execute(&self.pool)
        .await?;

        sqlx::query(&format!(
            "CREATE UNIQUE INDEX IF NOT EXISTS {RESOURCE_INDEX} \
             ON deployments (resource_id) \
             WHERE status <> 'deleted' AND resource_id IS NOT NULL"
        ))
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_deployments_status
            ON deployments (status)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_deployments_created_at
            ON deployments (created_at DESC)
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Parse a row into a DeploymentRecord.
    fn row_to_record(row: &PgRow) -> ControlResult<DeploymentRecord> {
        let kind_str: String = row.get("kind");
        let framework_str: String = row.get("framework");
        let status_str: String = row.get("status");
        let env_json: serde_json::Value = row.get("env_vars");
        let resource_id: Option<i32> = row.get("resource_id");

        let kind: DeploymentKind = kind_str.parse().map_err(|e| {
            ControlError::Serialisation(format!("failed to parse kind '{kind_str}': {e}"))
        })?;
        let framework: Framework = framework_str.parse().map_err(|e| {
            ControlError::Serialisation(format!("failed to parse framework '{framework_str}': {e}"))
        })?;
        let status = parse_status(&status_str)?;
        let env_vars = serde_json::from_value(env_json).map_err(|e| {
            ControlError::Serialisation(format!("failed to deserialise env vars: {e}"))
        })?;

        Ok(DeploymentRecord {
            data: DeploymentData {
                id: DeploymentId::new(row.get::<String, _>("id")),
                name: row.get("name"),
                kind,
                framework,
                repo_url: row.get("repo_url"),
                resources: ResourceSpec {
                    cores: from_db(row.get("cores"))?,
                    memory_mb: from_db(row.get("memory_mb"))?,
                    disk_gb: from_db(row.get("disk_gb"))?,
                },
                env_vars,
                address: row.get("address"),
                resource_id: resource_id.map(from_db).transpose()?,
                error: row.get("error"),
                created_at: row.get("created_at"),
                updated_at: row.get("updated_at"),
                deployed_at: row.get("deployed_at"),
                deleted_at: row.get("deleted_at"),
            },
            status,
        })
    }

    async fn current_status(&self, id: &DeploymentId) -> ControlResult<Option<DeploymentStatus>> {
        let row = sqlx::query("SELECT status FROM deployments WHERE id = $1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| parse_status(&r.get::<String, _>("status")))
            .transpose()
    }
}

fn parse_status(s: &str) -> ControlResult<DeploymentStatus> {
    s.parse()
        .map_err(|e| ControlError::Serialisation(format!("failed to parse status '{s}': {e}")))
}

fn to_db(value: u32) -> ControlResult<i32> {
    i32::try_from(value).map_err(|_| ControlError::Serialisation(format!("{value} overflows INTEGER")))
}

fn from_db(value: i32) -> ControlResult<u32> {
    u32::try_from(value).map_err(|_| ControlError::Serialisation(format!("negative value {value}")))
}

fn violated_constraint(err: &sqlx::Error) -> Option<&str> {
    err.as_database_error().and_then(|e| e.constraint())
}

#[async_trait]
impl DeploymentStore for PostgresStore {
    async fn insert(&self, record: &DeploymentRecord) -> ControlResult<()> {
        let env_json = serde_json::to_value(&record.data.env_vars).map_err(|e| {
            ControlError::Serialisation(format!("failed to serialise env vars: {e}"))
        })?;
        let resource_id = record.data.resource_id.map(to_db).transpose()?;

        let result = sqlx::query(&format!(
            "INSERT INTO deployments ({COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)"
        ))
        .bind(record.data.id.as_str())
        .bind(&record.data.name)
        .bind(record.data.kind.as_str())
        .bind(record.data.framework.as_str())
        .bind(&record.data.repo_url)
        .bind(to_db(record.data.resources.cores)?)
        .bind(to_db(record.data.resources.memory_mb)?)
        .bind(to_db(record.data.resources.disk_gb)?)
        .bind(&env_json)
        .bind(&record.data.address)
        .bind(resource_id)
        .bind(record.status.as_str())
        .bind(&record.data.error)
        .bind(record.data.created_at)
        .bind(record.data.updated_at)
        .bind(record.data.deployed_at)
        .bind(record.data.deleted_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if violated_constraint(&e) == Some(NAME_INDEX) => {
                Err(ControlError::DuplicateName(record.data.name.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, id: &DeploymentId) -> ControlResult<Option<DeploymentRecord>> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM deployments WHERE id = $1"))
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::row_to_record).transpose()
    }

    async fn get_by_name(&self, name: &str) -> ControlResult<Option<DeploymentRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM deployments WHERE name = $1 AND status <> 'deleted'"
        ))
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_record).transpose()
    }

    async fn list(&self, filter: &DeploymentFilter) -> ControlResult<Vec<DeploymentRecord>> {
        let mut query = format!("SELECT {COLUMNS} FROM deployments WHERE 1=1");
        let mut params: Vec<String> = Vec::new();

        if let Some(status) = filter.status {
            params.push(status.as_str().to_owned());
            query.push_str(&format!(" AND status = ${}", params.len()));
        } else if !filter.include_deleted {
            query.push_str(" AND status <> 'deleted'");
        }

        query.push_str(" ORDER BY created_at DESC");

        if let Some(limit) = filter.limit {
            query.push_str(&format!(" LIMIT {limit}"));
        }

        if let Some(offset) = filter.offset {
            query.push_str(&format!(" OFFSET {offset}"));
        }

        let mut sqlx_query = sqlx::query(&query);
        for param in &params {
            sqlx_query = sqlx_query.bind(param);
        }

        let rows = sqlx_query.fetch_all(&self.pool).await?;

        rows.iter().map(Self::row_to_record).collect()
    }

    async fn transition(
        &self,
        id: &DeploymentId,
        from: DeploymentStatus,
        to: DeploymentStatus,
        patch: StatusPatch,
    ) -> ControlResult<DeploymentRecord> {
        check_transition(from, to)?;

        let resource_id = patch.resource_id.map(to_db).transpose()?;
        let row = sqlx::query(&format!(
            "UPDATE deployments SET \
                 status = $1, \
                 address = COALESCE($2, address), \
                 resource_id = COALESCE($3, resource_id), \
                 error = COALESCE($4, error), \
                 deployed_at = COALESCE($5, deployed_at), \
                 deleted_at = COALESCE($6, deleted_at), \
                 updated_at = NOW() \
             WHERE id = $7 AND status = $8 \
             RETURNING {COLUMNS}"
        ))
        .bind(to.as_str())
        .bind(patch.address)
        .bind(resource_id)
        .bind(patch.error)
        .bind(patch.deployed_at)
        .bind(patch.deleted_at)
        .bind(id.as_str())
        .bind(from.as_str())
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = row {
            return Self::row_to_record(&row);
        }

        match self.current_status(id).await? {
            None => Err(ControlError::DeploymentNotFound(id.to_string())),
            Some(actual) => Err(ControlError::StaleState {
                id: id.to_string(),
                expected: from.as_str(),
                actual: actual.as_str(),
            }),
        }
    }

    async fn reserve_resource_id(&self, id: &DeploymentId, resource_id: u32) -> ControlResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE deployments
            SET resource_id = $1, updated_at = NOW()
            WHERE id = $2
            "#,
        )
        .bind(to_db(resource_id)?)
        .bind(id.as_str())
        .execute(&self.pool)
        .await;

        match result {
            Ok(r) if r.rows_affected() == 0 => Err(ControlError::DeploymentNotFound(id.to_string())),
            Ok(_) => Ok(()),
            Err(e) if violated_constraint(&e) == Some(RESOURCE_INDEX) => Err(
                ControlError::internal(format!("resource id {resource_id} is already reserved")),
            ),
            Err(e) => Err(e.into()),
        }
    }

    async fn used_resource_ids(&self) -> ControlResult<BTreeSet<u32>> {
        let rows = sqlx::query(
            r#"
            SELECT resource_id FROM deployments
            WHERE status <> 'deleted' AND resource_id IS NOT NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|r| from_db(r.get::<i32, _>("resource_id")))
            .collect()
    }
}

impl std::fmt::Debug for PostgresStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresStore").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::Utc;

    use super::*;
    use crate::types::DeploymentRequest;

    fn get_database_url() -> Option<String> {
        std::env::var("DATABASE_URL").ok()
    }

    fn test_deployment() -> DeploymentRecord {
        let data = DeploymentData::new(
            DeploymentRequest {
                name: format!("pg-{}", DeploymentId::generate()),
                kind: DeploymentKind::Vm,
                framework: Framework::Laravel,
                repo_url: "https://github.com/acme/portal".to_owned(),
                cores: None,
                memory_mb: None,
                disk_gb: None,
                env_vars: BTreeMap::from([("APP_ENV".to_owned(), "production".to_owned())]),
            },
            ResourceSpec {
                cores: 2,
                memory_mb: 2048,
                disk_gb: 20,
            },
        );
        DeploymentRecord::new(data)
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL (set DATABASE_URL)"]
    async fn insert_and_get() {
        let url = get_database_url().expect("DATABASE_URL not set");
        let store = PostgresStore::new(&url).await.expect("failed to connect");

        let record = test_deployment();
        let id = record.data.id.clone();

        store.insert(&record).await.expect("insert failed");

        let retrieved = store
            .get(&id)
            .await
            .expect("get failed")
            .expect("deployment not found");

        assert_eq!(retrieved.data.id, id);
        assert_eq!(retrieved.data.framework, Framework::Laravel);
        assert_eq!(retrieved.data.env_vars.get("APP_ENV").map(String::as_str), Some("production"));
        assert_eq!(retrieved.status, DeploymentStatus::Pending);

        let err = store.insert(&DeploymentRecord::new(DeploymentData {
            id: DeploymentId::generate(),
            ..record.data.clone()
        }))
        .await
        .unwrap_err();
        assert!(matches!(err, ControlError::DuplicateName(_)));
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL (set DATABASE_URL)"]
    async fn transition_check_and_set() {
        let url = get_database_url().expect("DATABASE_URL not set");
        let store = PostgresStore::new(&url).await.expect("failed to connect");

        let record = test_deployment();
        let id = record.data.id.clone();
        store.insert(&record).await.expect("insert failed");

        store
            .transition(
                &id,
                DeploymentStatus::Pending,
                DeploymentStatus::Provisioning,
                StatusPatch::default(),
            )
            .await
            .expect("transition failed");

        let err = store
            .transition(
                &id,
                DeploymentStatus::Pending,
                DeploymentStatus::Provisioning,
                StatusPatch::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::StaleState { actual: "provisioning", .. }));

        let updated = store
            .transition(
                &id,
                DeploymentStatus::Provisioning,
                DeploymentStatus::Failed,
                StatusPatch::error("apply failed"),
            )
            .await
            .expect("transition failed");
        assert_eq!(updated.data.error.as_deref(), Some("apply failed"));

        store
            .transition(
                &id,
                DeploymentStatus::Failed,
                DeploymentStatus::Deleted,
                StatusPatch {
                    deleted_at: Some(Utc::now()),
                    ..StatusPatch::default()
                },
            )
            .await
            .expect("transition failed");
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL (set DATABASE_URL)"]
    async fn reserved_ids_are_unique_among_live_records() {
        let url = get_database_url().expect("DATABASE_URL not set");
        let store = PostgresStore::new(&url).await.expect("failed to connect");

        let a = test_deployment();
        let b = test_deployment();
        store.insert(&a).await.expect("insert failed");
        store.insert(&b).await.expect("insert failed");

        store
            .reserve_resource_id(&a.data.id, 998)
            .await
            .expect("reserve failed");
        assert!(store.reserve_resource_id(&b.data.id, 998).await.is_err());
        assert!(store
            .used_resource_ids()
            .await
            .expect("used ids failed")
            .contains(&998));

        for record in [&a, &b] {
            store
                .transition(
                    &record.data.id,
                    DeploymentStatus::Pending,
                    DeploymentStatus::Deleted,
                    StatusPatch::default(),
                )
                .await
                .expect("cleanup failed");
        }
    }
}

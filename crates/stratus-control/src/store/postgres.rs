//! PostgreSQL registry store implementation.

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;

use crate::config::DatabaseConfig;
use crate::error::{ControlError, ControlResult};
use crate::ssh::SshExecutionLog;
use crate::types::{
    Cluster, ClusterId, ClusterStatus, DeploymentData, DeploymentId, DeploymentRecord,
    InstallStep, InstallStepId, InstallTask, LogId, Node, NodeId, NodeStatus, SessionId, Step,
    StepId, TaskId,
};

use super::{ClusterStore, DeploymentFilter, LogFilter};

/// PostgreSQL-backed registry store.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect to PostgreSQL and create a new store.
    ///
    /// The required tables are created if they don't exist.
    pub async fn new(url: &str) -> ControlResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await?;

        Self::from_pool(pool).await
    }

    /// Connect using the database section of the configuration.
    pub async fn connect(config: &DatabaseConfig) -> ControlResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
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
        const SCHEMA: &[&str] = &[
            r#"
            CREATE TABLE IF NOT EXISTS clusters (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                description TEXT,
                status TEXT NOT NULL,
                master_host TEXT NOT NULL,
                master_port INTEGER NOT NULL,
                salt_master TEXT NOT NULL,
                config JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS nodes (
                id TEXT PRIMARY KEY,
                cluster_id TEXT NOT NULL REFERENCES clusters(id),
                name TEXT NOT NULL,
                role TEXT NOT NULL,
                host TEXT NOT NULL,
                port INTEGER NOT NULL,
                credentials JSONB NOT NULL,
                status TEXT NOT NULL,
                resources JSONB NOT NULL,
                config JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                UNIQUE (cluster_id, name)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS deployments (
                id TEXT PRIMARY KEY,
                cluster_id TEXT NOT NULL REFERENCES clusters(id),
                action TEXT NOT NULL,
                status TEXT NOT NULL,
                progress SMALLINT NOT NULL,
                current_step TEXT,
                options JSONB NOT NULL,
                result JSONB,
                error TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                started_at TIMESTAMPTZ,
                completed_at TIMESTAMPTZ,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_deployments_one_active
            ON deployments (cluster_id) WHERE status IN ('pending', 'running')
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_deployments_created_at
            ON deployments (created_at DESC)
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS install_tasks (
                id TEXT PRIMARY KEY,
                deployment_id TEXT NOT NULL REFERENCES deployments(id),
                node_id TEXT NOT NULL REFERENCES nodes(id),
                node_name TEXT NOT NULL,
                task_type TEXT NOT NULL,
                status TEXT NOT NULL,
                progress SMALLINT NOT NULL,
                current_step TEXT,
                config JSONB NOT NULL,
                result JSONB,
                error TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                started_at TIMESTAMPTZ,
                completed_at TIMESTAMPTZ,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_install_tasks_deployment
            ON install_tasks (deployment_id)
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS deployment_steps (
                id TEXT PRIMARY KEY,
                deployment_id TEXT NOT NULL REFERENCES deployments(id),
                kind TEXT NOT NULL,
                status TEXT NOT NULL,
                message TEXT,
                retry_count BIGINT NOT NULL,
                max_retries BIGINT NOT NULL,
                started_at TIMESTAMPTZ,
                completed_at TIMESTAMPTZ,
                duration_ms BIGINT
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS install_steps (
                id TEXT PRIMARY KEY,
                task_id TEXT NOT NULL REFERENCES install_tasks(id),
                node_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                sequence BIGINT NOT NULL,
                status TEXT NOT NULL,
                output TEXT,
                error TEXT,
                retry_count BIGINT NOT NULL,
                max_retries BIGINT NOT NULL,
                started_at TIMESTAMPTZ,
                completed_at TIMESTAMPTZ,
                duration_ms BIGINT
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS ssh_execution_logs (
                id TEXT PRIMARY KEY,
                session_id TEXT,
                node_id TEXT,
                task_id TEXT,
                step_id TEXT,
                host TEXT NOT NULL,
                port INTEGER NOT NULL,
                username TEXT NOT NULL,
                command TEXT NOT NULL,
                exit_code INTEGER,
                stdout TEXT NOT NULL,
                stderr TEXT NOT NULL,
                duration_ms BIGINT NOT NULL,
                success BOOLEAN NOT NULL,
                started_at TIMESTAMPTZ NOT NULL,
                finished_at TIMESTAMPTZ NOT NULL
            )
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_ssh_logs_task
            ON ssh_execution_logs (task_id)
            "#,
        ];

        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }

        Ok(())
    }

    fn row_to_cluster(row: &PgRow) -> ControlResult<Cluster> {
        Ok(Cluster {
            id: ClusterId::new(row.get::<String, _>("id")),
            name: row.get("name"),
            description: row.get("description"),
            status: parse_enum(row, "status")?,
            master_host: row.get("master_host"),
            master_port: to_u16(row.get("master_port"))?,
            salt_master: row.get("salt_master"),
            config: from_json(row.get("config"), "cluster config")?,
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }

    fn row_to_node(row: &PgRow) -> ControlResult<Node> {
        Ok(Node {
            id: NodeId::new(row.get::<String, _>("id")),
            cluster_id: ClusterId::new(row.get::<String, _>("cluster_id")),
            name: row.get("name"),
            role: parse_enum(row, "role")?,
            host: row.get("host"),
            port: to_u16(row.get("port"))?,
            credentials: from_json(row.get("credentials"), "credentials")?,
            status: parse_enum(row, "status")?,
            resources: from_json(row.get("resources"), "resources")?,
            config: row.get("config"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }

    fn row_to_deployment(row: &PgRow) -> ControlResult<DeploymentRecord> {
        let result: Option<serde_json::Value> = row.get("result");
        Ok(DeploymentRecord {
            data: DeploymentData {
                id: DeploymentId::new(row.get::<String, _>("id")),
                cluster_id: ClusterId::new(row.get::<String, _>("cluster_id")),
                action: parse_enum(row, "action")?,
                progress: to_u8(row.get("progress"))?,
                current_step: parse_opt_enum(row, "current_step")?,
                options: from_json(row.get("options"), "deployment options")?,
                result: result
                    .map(|r| from_json(r, "deployment result"))
                    .transpose()?,
                error: row.get("error"),
                created_at: row.get("created_at"),
                started_at: row.get("started_at"),
                completed_at: row.get("completed_at"),
                updated_at: row.get("updated_at"),
            },
            status: parse_enum(row, "status")?,
        })
    }

    fn row_to_task(row: &PgRow) -> ControlResult<InstallTask> {
        let result: Option<serde_json::Value> = row.get("result");
        Ok(InstallTask {
            id: TaskId::new(row.get::<String, _>("id")),
            deployment_id: DeploymentId::new(row.get::<String, _>("deployment_id")),
            node_id: NodeId::new(row.get::<String, _>("node_id")),
            node_name: row.get("node_name"),
            task_type: parse_enum(row, "task_type")?,
            status: parse_enum(row, "status")?,
            progress: to_u8(row.get("progress"))?,
            current_step: parse_opt_enum(row, "current_step")?,
            config: row.get("config"),
            result: result.map(|r| from_json(r, "task result")).transpose()?,
            error: row.get("error"),
            created_at: row.get("created_at"),
            started_at: row.get("started_at"),
            completed_at: row.get("completed_at"),
            updated_at: row.get("updated_at"),
        })
    }

    fn row_to_step(row: &PgRow) -> ControlResult<Step> {
        Ok(Step {
            id: StepId::new(row.get::<String, _>("id")),
            deployment_id: DeploymentId::new(row.get::<String, _>("deployment_id")),
            kind: parse_enum(row, "kind")?,
            status: parse_enum(row, "status")?,
            message: row.get("message"),
            retry_count: to_u32(row.get("retry_count"))?,
            max_retries: to_u32(row.get("max_retries"))?,
            started_at: row.get("started_at"),
            completed_at: row.get("completed_at"),
            duration_ms: row
                .get::<Option<i64>, _>("duration_ms")
                .map(to_u64)
                .transpose()?,
        })
    }

    fn row_to_install_step(row: &PgRow) -> ControlResult<InstallStep> {
        Ok(InstallStep {
            id: InstallStepId::new(row.get::<String, _>("id")),
            task_id: TaskId::new(row.get::<String, _>("task_id")),
            node_id: NodeId::new(row.get::<String, _>("node_id")),
            kind: parse_enum(row, "kind")?,
            sequence: to_u32(row.get("sequence"))?,
            status: parse_enum(row, "status")?,
            output: row.get("output"),
            error: row.get("error"),
            retry_count: to_u32(row.get("retry_count"))?,
            max_retries: to_u32(row.get("max_retries"))?,
            started_at: row.get("started_at"),
            completed_at: row.get("completed_at"),
            duration_ms: row
                .get::<Option<i64>, _>("duration_ms")
                .map(to_u64)
                .transpose()?,
        })
    }

    fn row_to_log(row: &PgRow) -> ControlResult<SshExecutionLog> {
        Ok(SshExecutionLog {
            id: LogId::new(row.get::<String, _>("id")),
            session_id: row.get::<Option<String>, _>("session_id").map(SessionId::new),
            node_id: row.get::<Option<String>, _>("node_id").map(NodeId::new),
            task_id: row.get::<Option<String>, _>("task_id").map(TaskId::new),
            step_id: row
                .get::<Option<String>, _>("step_id")
                .map(InstallStepId::new),
            host: row.get("host"),
            port: to_u16(row.get("port"))?,
            user: row.get("username"),
            command: row.get("command"),
            exit_code: row.get("exit_code"),
            stdout: row.get("stdout"),
            stderr: row.get("stderr"),
            duration_ms: to_u64(row.get("duration_ms"))?,
            success: row.get("success"),
            started_at: row.get("started_at"),
            finished_at: row.get("finished_at"),
        })
    }
}

fn parse_enum<T>(row: &PgRow, column: &str) -> ControlResult<T>
where
    T: std::str::FromStr<Err = String>,
{
    let raw: String = row.get(column);
    raw.parse().map_err(|e| {
        ControlError::Serialisation(format!("failed to parse {column} '{raw}': {e}"))
    })
}

fn parse_opt_enum<T>(row: &PgRow, column: &str) -> ControlResult<Option<T>>
where
    T: std::str::FromStr<Err = String>,
{
    let raw: Option<String> = row.get(column);
    raw.map(|r| {
        r.parse().map_err(|e| {
            ControlError::Serialisation(format!("failed to parse {column} '{r}': {e}"))
        })
    })
    .transpose()
}

fn from_json<T: DeserializeOwned>(value: serde_json::Value, what: &str) -> ControlResult<T> {
    serde_json::from_value(value)
        .map_err(|e| ControlError::Serialisation(format!("failed to deserialise {what}: {e}")))
}

fn to_json<T: serde::Serialize>(value: &T, what: &str) -> ControlResult<serde_json::Value> {
    serde_json::to_value(value)
        .map_err(|e| ControlError::Serialisation(format!("failed to serialise {what}: {e}")))
}

fn out_of_range(value: impl std::fmt::Display) -> ControlError {
    ControlError::Serialisation(format!("stored value {value} out of range"))
}

fn to_u16(value: i32) -> ControlResult<u16> {
    u16::try_from(value).map_err(|_| out_of_range(value))
}

fn to_u8(value: i16) -> ControlResult<u8> {
    u8::try_from(value).map_err(|_| out_of_range(value))
}

fn to_u32(value: i64) -> ControlResult<u32> {
    u32::try_from(value).map_err(|_| out_of_range(value))
}

fn to_u64(value: i64) -> ControlResult<u64> {
    u64::try_from(value).map_err(|_| out_of_range(value))
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.is_unique_violation())
}

const DEPLOYMENT_COLUMNS: &str = "id, cluster_id, action, status, progress, current_step, \
     options, result, error, created_at, started_at, completed_at, updated_at";

const TASK_COLUMNS: &str = "id, deployment_id, node_id, node_name, task_type, status, progress, \
     current_step, config, result, error, created_at, started_at, completed_at, updated_at";

async fn insert_node<'e, E>(executor: E, node: &Node) -> ControlResult<()>
where
    E: sqlx::Executor<'e, Database = sqlx::Postgres>,
{
    sqlx::query(
        r#"
        INSERT INTO nodes (
            id, cluster_id, name, role, host, port, credentials,
            status, resources, config, created_at, updated_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
        "#,
    )
    .bind(node.id.as_str())
    .bind(node.cluster_id.as_str())
    .bind(&node.name)
    .bind(node.role.as_str())
    .bind(&node.host)
    .bind(i32::from(node.port))
    .bind(to_json(&node.credentials, "credentials")?)
    .bind(node.status.as_str())
    .bind(to_json(&node.resources, "resources")?)
    .bind(&node.config)
    .bind(node.created_at)
    .bind(node.updated_at)
    .execute(executor)
    .await
    .map_err(|e| {
        if is_unique_violation(&e) {
            ControlError::validation(format!(
                "node {} already exists in cluster {}",
                node.name, node.cluster_id
            ))
        } else {
            ControlError::Database(e)
        }
    })?;
    Ok(())
}

#[async_trait]
impl ClusterStore for PostgresStore {
    async fn create_cluster(&self, cluster: &Cluster, nodes: &[Node]) -> ControlResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO clusters (
                id, name, description, status, master_host, master_port,
                salt_master, config, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(cluster.id.as_str())
        .bind(&cluster.name)
        .bind(&cluster.description)
        .bind(cluster.status.as_str())
        .bind(&cluster.master_host)
        .bind(i32::from(cluster.master_port))
        .bind(&cluster.salt_master)
        .bind(to_json(&cluster.config, "cluster config")?)
        .bind(cluster.created_at)
        .bind(cluster.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                ControlError::validation(format!("cluster name {} already exists", cluster.name))
            } else {
                ControlError::Database(e)
            }
        })?;

        for node in nodes {
            insert_node(&mut *tx, node).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_cluster(&self, id: &ClusterId) -> ControlResult<Option<Cluster>> {
        let row = sqlx::query("SELECT * FROM clusters WHERE id = $1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::row_to_cluster).transpose()
    }

    async fn list_clusters(&self) -> ControlResult<Vec<Cluster>> {
        let rows = sqlx::query("SELECT * FROM clusters ORDER BY created_at DESC")
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(Self::row_to_cluster).collect()
    }

    async fn update_cluster_status(
        &self,
        id: &ClusterId,
        status: ClusterStatus,
    ) -> ControlResult<()> {
        let result =
            sqlx::query("UPDATE clusters SET status = $2, updated_at = NOW() WHERE id = $1")
                .bind(id.as_str())
                .bind(status.as_str())
                .execute(&self.pool)
                .await?;

        if result.rows_affected() == 0 {
            return Err(ControlError::ClusterNotFound(id.to_string()));
        }
        Ok(())
    }

    async fn insert_nodes(&self, nodes: &[Node]) -> ControlResult<()> {
        let mut tx = self.pool.begin().await?;
        for node in nodes {
            insert_node(&mut *tx, node).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get_node(&self, id: &NodeId) -> ControlResult<Option<Node>> {
        let row = sqlx::query("SELECT * FROM nodes WHERE id = $1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::row_to_node).transpose()
    }

    async fn list_nodes(&self, cluster_id: &ClusterId) -> ControlResult<Vec<Node>> {
        let rows = sqlx::query("SELECT * FROM nodes WHERE cluster_id = $1 ORDER BY name")
            .bind(cluster_id.as_str())
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(Self::row_to_node).collect()
    }

    async fn update_node_status(&self, id: &NodeId, status: NodeStatus) -> ControlResult<()> {
        let result = sqlx::query("UPDATE nodes SET status = $2, updated_at = NOW() WHERE id = $1")
            .bind(id.as_str())
            .bind(status.as_str())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(ControlError::NodeNotFound(id.to_string()));
        }
        Ok(())
    }

    async fn create_deployment(
        &self,
        record: &DeploymentRecord,
        tasks: &[InstallTask],
    ) -> ControlResult<()> {
        let data = &record.data;
        let mut tx = self.pool.begin().await?;

        // Serialise concurrent creators on the cluster row.
        sqlx::query("SELECT id FROM clusters WHERE id = $1 FOR UPDATE")
            .bind(data.cluster_id.as_str())
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| ControlError::ClusterNotFound(data.cluster_id.to_string()))?;

        let active: Option<String> = sqlx::query_scalar(
            "SELECT id FROM deployments WHERE cluster_id = $1 AND status IN ('pending', 'running')",
        )
        .bind(data.cluster_id.as_str())
        .fetch_optional(&mut *tx)
        .await?;
        if let Some(deployment) = active {
            return Err(ControlError::DeploymentInProgress {
                cluster: data.cluster_id.to_string(),
                deployment,
            });
        }

        sqlx::query(
            r#"
            INSERT INTO deployments (
                id, cluster_id, action, status, progress, current_step, options,
                result, error, created_at, started_at, completed_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(data.id.as_str())
        .bind(data.cluster_id.as_str())
        .bind(data.action.as_str())
        .bind(record.status.as_str())
        .bind(i16::from(data.progress))
        .bind(data.current_step.map(|s| s.as_str()))
        .bind(to_json(&data.options, "deployment options")?)
        .bind(
            data.result
                .as_ref()
                .map(|r| to_json(r, "deployment result"))
                .transpose()?,
        )
        .bind(&data.error)
        .bind(data.created_at)
        .bind(data.started_at)
        .bind(data.completed_at)
        .bind(data.updated_at)
        .execute(&mut *tx)
        .await?;

        for task in tasks {
            sqlx::query(
                r#"
                INSERT INTO install_tasks (
                    id, deployment_id, node_id, node_name, task_type, status, progress,
                    current_step, config, result, error, created_at, started_at,
                    completed_at, updated_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, NULL, NULL, $10, NULL, NULL, $11)
                "#,
            )
            .bind(task.id.as_str())
            .bind(task.deployment_id.as_str())
            .bind(task.node_id.as_str())
            .bind(&task.node_name)
            .bind(task.task_type.as_str())
            .bind(task.status.as_str())
            .bind(i16::from(task.progress))
            .bind(task.current_step.map(|s| s.as_str()))
            .bind(&task.config)
            .bind(task.created_at)
            .bind(task.updated_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_deployment(&self, id: &DeploymentId) -> ControlResult<Option<DeploymentRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {DEPLOYMENT_COLUMNS} FROM deployments WHERE id = $1"
        ))
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_deployment).transpose()
    }

    async fn update_deployment(&self, record: &DeploymentRecord) -> ControlResult<()> {
        let data = &record.data;
        let result = sqlx::query(
            r#"
            UPDATE deployments
            SET status = $2, progress = $3, current_step = $4, result = $5,
                error = $6, started_at = $7, completed_at = $8, updated_at = $9
            WHERE id = $1
            "#,
        )
        .bind(data.id.as_str())
        .bind(record.status.as_str())
        .bind(i16::from(data.progress))
        .bind(data.current_step.map(|s| s.as_str()))
        .bind(
            data.result
                .as_ref()
                .map(|r| to_json(r, "deployment result"))
                .transpose()?,
        )
        .bind(&data.error)
        .bind(data.started_at)
        .bind(data.completed_at)
        .bind(data.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(ControlError::DeploymentNotFound(data.id.to_string()));
        }
        Ok(())
    }

    async fn list_deployments(
        &self,
        filter: &DeploymentFilter,
    ) -> ControlResult<Vec<DeploymentRecord>> {
        let mut query = format!("SELECT {DEPLOYMENT_COLUMNS} FROM deployments WHERE 1=1");
        let mut param_idx = 1;

        if filter.cluster_id.is_some() {
            query.push_str(&format!(" AND cluster_id = ${param_idx}"));
            param_idx += 1;
        }
        if filter.status.is_some() {
            query.push_str(&format!(" AND status = ${param_idx}"));
            param_idx += 1;
        }
        if filter.action.is_some() {
            query.push_str(&format!(" AND action = ${param_idx}"));
            param_idx += 1;
        }

        query.push_str(" ORDER BY created_at DESC");

        if filter.limit.is_some() {
            query.push_str(&format!(" LIMIT ${param_idx}"));
            param_idx += 1;
        }
        if filter.offset.is_some() {
            query.push_str(&format!(" OFFSET ${param_idx}"));
        }

        let mut q = sqlx::query(&query);
        if let Some(ref cluster_id) = filter.cluster_id {
            q = q.bind(cluster_id.as_str());
        }
        if let Some(status) = filter.status {
            q = q.bind(status.as_str());
        }
        if let Some(action) = filter.action {
            q = q.bind(action.as_str());
        }
        if let Some(limit) = filter.limit {
            q = q.bind(i64::from(limit));
        }
        if let Some(offset) = filter.offset {
            q = q.bind(i64::from(offset));
        }

        let rows = q.fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_deployment).collect()
    }

    async fn active_deployment(
        &self,
        cluster_id: &ClusterId,
    ) -> ControlResult<Option<DeploymentRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {DEPLOYMENT_COLUMNS} FROM deployments \
             WHERE cluster_id = $1 AND status IN ('pending', 'running')"
        ))
        .bind(cluster_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_deployment).transpose()
    }

    async fn list_tasks(&self, deployment_id: &DeploymentId) -> ControlResult<Vec<InstallTask>> {
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM install_tasks WHERE deployment_id = $1 ORDER BY node_name"
        ))
        .bind(deployment_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_task).collect()
    }

    async fn update_task(&self, task: &InstallTask) -> ControlResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE install_tasks
            SET status = $2, progress = $3, current_step = $4, result = $5, error = $6,
                started_at = $7, completed_at = $8, updated_at = $9
            WHERE id = $1
            "#,
        )
        .bind(task.id.as_str())
        .bind(task.status.as_str())
        .bind(i16::from(task.progress))
        .bind(task.current_step.map(|s| s.as_str()))
        .bind(
            task.result
                .as_ref()
                .map(|r| to_json(r, "task result"))
                .transpose()?,
        )
        .bind(&task.error)
        .bind(task.started_at)
        .bind(task.completed_at)
        .bind(task.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(ControlError::internal(format!("task {} not found", task.id)));
        }
        Ok(())
    }

    async fn upsert_step(&self, step: &Step) -> ControlResult<()> {
        sqlx::query(
            r#"
            INSERT INTO deployment_steps (
                id, deployment_id, kind, status, message, retry_count, max_retries,
                started_at, completed_at, duration_ms
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (id) DO UPDATE SET
                status = EXCLUDED.status,
                message = EXCLUDED.message,
                retry_count = EXCLUDED.retry_count,
                started_at = EXCLUDED.started_at,
                completed_at = EXCLUDED.completed_at,
                duration_ms = EXCLUDED.duration_ms
            "#,
        )
        .bind(step.id.as_str())
        .bind(step.deployment_id.as_str())
        .bind(step.kind.as_str())
        .bind(step.status.as_str())
        .bind(&step.message)
        .bind(i64::from(step.retry_count))
        .bind(i64::from(step.max_retries))
        .bind(step.started_at)
        .bind(step.completed_at)
        .bind(step.duration_ms.map(to_i64))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_steps(&self, deployment_id: &DeploymentId) -> ControlResult<Vec<Step>> {
        let rows = sqlx::query("SELECT * FROM deployment_steps WHERE deployment_id = $1")
            .bind(deployment_id.as_str())
            .fetch_all(&self.pool)
            .await?;

        let mut steps = rows
            .iter()
            .map(Self::row_to_step)
            .collect::<ControlResult<Vec<_>>>()?;
        steps.sort_by_key(|s| s.kind);
        Ok(steps)
    }

    async fn upsert_install_step(&self, step: &InstallStep) -> ControlResult<()> {
        sqlx::query(
            r#"
            INSERT INTO install_steps (
                id, task_id, node_id, kind, sequence, status, output, error,
                retry_count, max_retries, started_at, completed_at, duration_ms
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (id) DO UPDATE SET
                status = EXCLUDED.status,
                output = EXCLUDED.output,
                error = EXCLUDED.error,
                retry_count = EXCLUDED.retry_count,
                started_at = EXCLUDED.started_at,
                completed_at = EXCLUDED.completed_at,
                duration_ms = EXCLUDED.duration_ms
            "#,
        )
        .bind(step.id.as_str())
        .bind(step.task_id.as_str())
        .bind(step.node_id.as_str())
        .bind(step.kind.as_str())
        .bind(i64::from(step.sequence))
        .bind(step.status.as_str())
        .bind(&step.output)
        .bind(&step.error)
        .bind(i64::from(step.retry_count))
        .bind(i64::from(step.max_retries))
        .bind(step.started_at)
        .bind(step.completed_at)
        .bind(step.duration_ms.map(to_i64))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_install_steps(
        &self,
        deployment_id: &DeploymentId,
    ) -> ControlResult<Vec<InstallStep>> {
        let rows = sqlx::query(
            r#"
            SELECT s.*
            FROM install_steps s
            JOIN install_tasks t ON t.id = s.task_id
            WHERE t.deployment_id = $1
            ORDER BY s.task_id, s.sequence
            "#,
        )
        .bind(deployment_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_install_step).collect()
    }

    async fn insert_ssh_log(&self, log: &SshExecutionLog) -> ControlResult<()> {
        sqlx::query(
            r#"
            INSERT INTO ssh_execution_logs (
                id, session_id, node_id, task_id, step_id, host, port, username,
                command, exit_code, stdout, stderr, duration_ms, success,
                started_at, finished_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "#,
        )
        .bind(log.id.as_str())
        .bind(log.session_id.as_ref().map(SessionId::as_str))
        .bind(log.node_id.as_ref().map(NodeId::as_str))
        .bind(log.task_id.as_ref().map(TaskId::as_str))
        .bind(log.step_id.as_ref().map(InstallStepId::as_str))
        .bind(&log.host)
        .bind(i32::from(log.port))
        .bind(&log.user)
        .bind(&log.command)
        .bind(log.exit_code)
        .bind(&log.stdout)
        .bind(&log.stderr)
        .bind(to_i64(log.duration_ms))
        .bind(log.success)
        .bind(log.started_at)
        .bind(log.finished_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_ssh_logs(
        &self,
        deployment_id: &DeploymentId,
        filter: &LogFilter,
    ) -> ControlResult<Vec<SshExecutionLog>> {
        let rows = sqlx::query(
            r#"
            SELECT l.*
            FROM ssh_execution_logs l
            JOIN install_tasks t ON t.id = l.task_id
            WHERE t.deployment_id = $1
              AND ($2::TEXT IS NULL OR l.node_id = $2)
              AND ($3::TEXT IS NULL OR l.task_id = $3)
            ORDER BY l.started_at
            "#,
        )
        .bind(deployment_id.as_str())
        .bind(filter.node_id.as_ref().map(NodeId::as_str))
        .bind(filter.task_id.as_ref().map(TaskId::as_str))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_log).collect()
    }
}

impl std::fmt::Debug for PostgresStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresStore").finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::ssh::NodeCredentials;
    use crate::types::{
        ClusterConfig, DeploymentAction, DeploymentOptions, DeploymentStatus, NodeRole, NodeSpec,
        TaskType,
    };

    fn get_database_url() -> Option<String> {
        std::env::var("DATABASE_URL").ok()
    }

    fn test_cluster() -> (Cluster, Vec<Node>) {
        let now = Utc::now();
        let cluster = Cluster {
            id: ClusterId::generate(),
            name: format!("test-{}", ClusterId::generate()),
            description: Some("integration".to_owned()),
            status: ClusterStatus::Pending,
            master_host: "10.0.0.1".to_owned(),
            master_port: 22,
            salt_master: "10.0.0.1".to_owned(),
            config: ClusterConfig::default(),
            created_at: now,
            updated_at: now,
        };
        let node = NodeSpec {
            name: "m1".to_owned(),
            role: NodeRole::Master,
            host: "10.0.0.1".to_owned(),
            port: 22,
            credentials: NodeCredentials::default(),
            resources: Default::default(),
            config: serde_json::json!({}),
        }
        .into_node(&cluster.id);
        (cluster, vec![node])
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL (set DATABASE_URL)"]
    async fn cluster_roundtrip() {
        let url = get_database_url().expect("DATABASE_URL not set");
        let store = PostgresStore::new(&url).await.expect("failed to connect");

        let (cluster, nodes) = test_cluster();
        store
            .create_cluster(&cluster, &nodes)
            .await
            .expect("create failed");

        let stored = store
            .get_cluster(&cluster.id)
            .await
            .expect("get failed")
            .expect("cluster not found");
        assert_eq!(stored.name, cluster.name);
        assert_eq!(stored.config, cluster.config);

        let listed = store.list_nodes(&cluster.id).await.expect("list failed");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].role, NodeRole::Master);
        assert_eq!(listed[0].credentials, nodes[0].credentials);
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL (set DATABASE_URL)"]
    async fn one_active_deployment_per_cluster() {
        let url = get_database_url().expect("DATABASE_URL not set");
        let store = PostgresStore::new(&url).await.expect("failed to connect");

        let (cluster, nodes) = test_cluster();
        store
            .create_cluster(&cluster, &nodes)
            .await
            .expect("create failed");

        let record = DeploymentRecord::new(DeploymentData::new(
            cluster.id.clone(),
            DeploymentAction::Deploy,
            DeploymentOptions::default(),
        ));
        let tasks = vec![InstallTask::new(
            &record.data.id,
            &nodes[0],
            TaskType::MasterInstall,
            serde_json::json!({}),
        )];
        store
            .create_deployment(&record, &tasks)
            .await
            .expect("create deployment failed");

        let second = DeploymentRecord::new(DeploymentData::new(
            cluster.id.clone(),
            DeploymentAction::Update,
            DeploymentOptions::default(),
        ));
        let err = store.create_deployment(&second, &[]).await.unwrap_err();
        assert!(matches!(err, ControlError::DeploymentInProgress { .. }));

        let mut done = record.clone();
        done.status = DeploymentStatus::Completed;
        done.data.progress = 100;
        store.update_deployment(&done).await.expect("update failed");

        let stored = store
            .get_deployment(&record.data.id)
            .await
            .expect("get failed")
            .expect("not found");
        assert_eq!(stored.status, DeploymentStatus::Completed);
        assert_eq!(stored.data.progress, 100);
        assert_eq!(
            store.list_tasks(&record.data.id).await.expect("tasks").len(),
            1
        );
    }
}

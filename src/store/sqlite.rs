//! SQLite-backed store.
//!
//! Claim exclusivity and settlement uniqueness are enforced twice: by the
//! conditional statements issued here, and by the schema itself (a partial
//! unique index on active assignments, a unique settlement per assignment).
//! The audit log and settlement rows are protected by triggers.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;

use super::{
    AssignmentFilter, AssignmentStore, AuditStore, DirectoryStore, MarketStore, ProjectStore,
    SettlementStore, StoreError, TaskStore,
};
use crate::audit::{AuditEntry, AuditFilter, NewAuditEntry};
use crate::identity::UserId;
use crate::model::{
    Assignment, AssignmentChange, AssignmentId, AssignmentStatus, Project, ProjectId,
    SettlementStatus, SettlementTransaction, SettlementUpdate, Task, TaskId, TaskStatus,
    TransactionId, WalletRecord,
};
use crate::money::Usdc;
use crate::source::SourceConnection;

const SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS projects (
    id TEXT PRIMARY KEY NOT NULL,
    owner TEXT NOT NULL,
    source_project_id INTEGER NOT NULL,
    title TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    budget TEXT NOT NULL,
    price_per_task TEXT NOT NULL,
    published INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE (owner, source_project_id)
);

CREATE TABLE IF NOT EXISTS tasks (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    project_id TEXT NOT NULL REFERENCES projects(id),
    source_task_id INTEGER NOT NULL,
    payload TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'available',
    price TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE (project_id, source_task_id)
);

CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status, seq);

CREATE TABLE IF NOT EXISTS assignments (
    id TEXT PRIMARY KEY NOT NULL,
    task_id TEXT NOT NULL REFERENCES tasks(id),
    project_id TEXT NOT NULL REFERENCES projects(id),
    annotator TEXT NOT NULL,
    status TEXT NOT NULL,
    result TEXT,
    quality_score REAL,
    feedback TEXT,
    settlement_id TEXT,
    assigned_at TEXT NOT NULL,
    accepted_at TEXT,
    started_at TEXT,
    submitted_at TEXT,
    completed_at TEXT,
    cancelled_at TEXT,
    updated_at TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_assignments_active_task ON assignments(task_id)
    WHERE status IN ('assigned', 'accepted', 'in_progress', 'submitted');
CREATE INDEX IF NOT EXISTS idx_assignments_annotator ON assignments(annotator, assigned_at DESC);
CREATE INDEX IF NOT EXISTS idx_assignments_project ON assignments(project_id, assigned_at DESC);

CREATE TABLE IF NOT EXISTS settlements (
    id TEXT PRIMARY KEY NOT NULL,
    assignment_id TEXT NOT NULL UNIQUE REFERENCES assignments(id),
    recipient TEXT NOT NULL,
    to_address TEXT NOT NULL,
    amount TEXT NOT NULL,
    platform_fee TEXT NOT NULL,
    network TEXT NOT NULL,
    status TEXT NOT NULL,
    transaction_hash TEXT,
    from_address TEXT,
    retry_count INTEGER NOT NULL DEFAULT 0,
    error_detail TEXT,
    metadata TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL,
    processed_at TEXT,
    completed_at TEXT,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_settlements_status ON settlements(status, updated_at);
CREATE INDEX IF NOT EXISTS idx_settlements_recipient ON settlements(recipient, created_at DESC);

CREATE TRIGGER IF NOT EXISTS settlements_never_deleted
BEFORE DELETE ON settlements
BEGIN
    SELECT RAISE(ABORT, 'settlement records are never deleted');
END;

CREATE TRIGGER IF NOT EXISTS settlements_assignment_fixed
BEFORE UPDATE OF assignment_id ON settlements
WHEN NEW.assignment_id != OLD.assignment_id
BEGIN
    SELECT RAISE(ABORT, 'settlement assignment cannot change');
END;

CREATE TABLE IF NOT EXISTS audit_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    actor TEXT,
    action TEXT NOT NULL,
    resource_type TEXT NOT NULL,
    resource_id TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    details TEXT NOT NULL,
    success INTEGER NOT NULL,
    error_message TEXT
);

CREATE INDEX IF NOT EXISTS idx_audit_timestamp ON audit_log(timestamp DESC);
CREATE INDEX IF NOT EXISTS idx_audit_actor ON audit_log(actor, timestamp DESC);
CREATE INDEX IF NOT EXISTS idx_audit_resource ON audit_log(resource_id);

CREATE TRIGGER IF NOT EXISTS audit_log_no_update
BEFORE UPDATE ON audit_log
BEGIN
    SELECT RAISE(ABORT, 'audit log is append-only');
END;

CREATE TRIGGER IF NOT EXISTS audit_log_no_delete
BEFORE DELETE ON audit_log
BEGIN
    SELECT RAISE(ABORT, 'audit log is append-only');
END;

CREATE TABLE IF NOT EXISTS wallets (
    user_id TEXT PRIMARY KEY NOT NULL,
    address TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS source_connections (
    owner TEXT PRIMARY KEY NOT NULL,
    connection TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
"#;

const PROJECT_COLUMNS: &str =
    "id, owner, source_project_id, title, description, budget, price_per_task, published, created_at, updated_at";

const TASK_COLUMNS: &str =
    "id, project_id, source_task_id, payload, status, price, created_at, updated_at";

const ASSIGNMENT_COLUMNS: &str = "id, task_id, project_id, annotator, status, result, quality_score, feedback, \
     settlement_id, assigned_at, accepted_at, started_at, submitted_at, completed_at, cancelled_at, updated_at";

const SETTLEMENT_COLUMNS: &str = "id, assignment_id, recipient, to_address, amount, platform_fee, network, status, \
     transaction_hash, from_address, retry_count, error_detail, metadata, created_at, processed_at, completed_at, updated_at";

const AUDIT_COLUMNS: &str =
    "id, actor, action, resource_type, resource_id, timestamp, details, success, error_message";

pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub async fn new(data_dir: PathBuf) -> Result<Self, StoreError> {
        tokio::fs::create_dir_all(&data_dir)
            .await
            .map_err(|e| StoreError::Backend(format!("Failed to create data dir: {}", e)))?;
        let db_path = data_dir.join("market.db");

        let conn = tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&db_path)
                .map_err(|e| StoreError::Backend(format!("Failed to open SQLite database: {}", e)))?;
            conn.execute_batch(SCHEMA)
                .map_err(|e| StoreError::Backend(format!("Failed to run schema: {}", e)))?;
            Ok::<_, StoreError>(conn)
        })
        .await
        .map_err(|e| StoreError::Backend(format!("Task join error: {}", e)))??;

        tracing::info!("SQLite market store ready");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn run<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.blocking_lock();
            f(&mut *conn)
        })
        .await
        .map_err(|e| StoreError::Backend(format!("Task join error: {}", e)))?
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}

fn ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn opt_ts(t: Option<DateTime<Utc>>) -> Option<String> {
    t.map(ts)
}

fn conversion<E>(idx: usize, e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

fn col<T>(row: &Row, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.get(idx)?;
    raw.parse::<T>().map_err(|e| conversion(idx, e))
}

fn opt_col<T>(row: &Row, idx: usize) -> rusqlite::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| s.parse::<T>().map_err(|e| conversion(idx, e)))
        .transpose()
}

fn json_col(row: &Row, idx: usize) -> rusqlite::Result<serde_json::Value> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion(idx, e))
}

fn opt_json_col(row: &Row, idx: usize) -> rusqlite::Result<Option<serde_json::Value>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| serde_json::from_str(&s).map_err(|e| conversion(idx, e)))
        .transpose()
}

fn project_from_row(row: &Row) -> rusqlite::Result<Project> {
    Ok(Project {
        id: col(row, 0)?,
        owner: UserId::from(row.get::<_, String>(1)?),
        source_project_id: row.get(2)?,
        title: row.get(3)?,
        description: row.get(4)?,
        budget: col(row, 5)?,
        price_per_task: col(row, 6)?,
        published: row.get::<_, i32>(7)? != 0,
        created_at: col(row, 8)?,
        updated_at: col(row, 9)?,
    })
}

fn task_from_row(row: &Row) -> rusqlite::Result<Task> {
    Ok(Task {
        id: col(row, 0)?,
        project_id: col(row, 1)?,
        source_task_id: row.get(2)?,
        payload: json_col(row, 3)?,
        status: col(row, 4)?,
        price: col(row, 5)?,
        created_at: col(row, 6)?,
        updated_at: col(row, 7)?,
    })
}

fn assignment_from_row(row: &Row) -> rusqlite::Result<Assignment> {
    Ok(Assignment {
        id: col(row, 0)?,
        task_id: col(row, 1)?,
        project_id: col(row, 2)?,
        annotator: UserId::from(row.get::<_, String>(3)?),
        status: col(row, 4)?,
        result: opt_json_col(row, 5)?,
        quality_score: row.get(6)?,
        feedback: row.get(7)?,
        settlement_id: opt_col(row, 8)?,
        assigned_at: col(row, 9)?,
        accepted_at: opt_col(row, 10)?,
        started_at: opt_col(row, 11)?,
        submitted_at: opt_col(row, 12)?,
        completed_at: opt_col(row, 13)?,
        cancelled_at: opt_col(row, 14)?,
        updated_at: col(row, 15)?,
    })
}

fn settlement_from_row(row: &Row) -> rusqlite::Result<SettlementTransaction> {
    Ok(SettlementTransaction {
        id: col(row, 0)?,
        assignment_id: col(row, 1)?,
        recipient: UserId::from(row.get::<_, String>(2)?),
        to_address: col(row, 3)?,
        amount: col(row, 4)?,
        platform_fee: col(row, 5)?,
        network: row.get(6)?,
        status: col(row, 7)?,
        transaction_hash: row.get(8)?,
        from_address: row.get(9)?,
        retry_count: row.get(10)?,
        error_detail: row.get(11)?,
        metadata: json_col(row, 12)?,
        created_at: col(row, 13)?,
        processed_at: opt_col(row, 14)?,
        completed_at: opt_col(row, 15)?,
        updated_at: col(row, 16)?,
    })
}

fn audit_from_row(row: &Row) -> rusqlite::Result<AuditEntry> {
    Ok(AuditEntry {
        id: row.get(0)?,
        actor: row.get::<_, Option<String>>(1)?.map(UserId::from),
        action: col(row, 2)?,
        resource_type: row.get(3)?,
        resource_id: row.get(4)?,
        timestamp: col(row, 5)?,
        details: json_col(row, 6)?,
        success: row.get::<_, i32>(7)? != 0,
        error_message: row.get(8)?,
    })
}

fn load_task(conn: &Connection, id: TaskId) -> rusqlite::Result<Option<Task>> {
    conn.query_row(
        &format!("SELECT {} FROM tasks WHERE id = ?1", TASK_COLUMNS),
        params![id.to_string()],
        task_from_row,
    )
    .optional()
}

fn task_exists(conn: &Connection, id: TaskId) -> rusqlite::Result<bool> {
    conn.prepare("SELECT 1 FROM tasks WHERE id = ?1")?
        .exists(params![id.to_string()])
}

fn load_assignment(conn: &Connection, id: AssignmentId) -> rusqlite::Result<Option<Assignment>> {
    conn.query_row(
        &format!("SELECT {} FROM assignments WHERE id = ?1", ASSIGNMENT_COLUMNS),
        params![id.to_string()],
        assignment_from_row,
    )
    .optional()
}

fn load_settlement(conn: &Connection, id: TransactionId) -> rusqlite::Result<Option<SettlementTransaction>> {
    conn.query_row(
        &format!("SELECT {} FROM settlements WHERE id = ?1", SETTLEMENT_COLUMNS),
        params![id.to_string()],
        settlement_from_row,
    )
    .optional()
}

fn settlement_for(conn: &Connection, assignment: AssignmentId) -> rusqlite::Result<Option<SettlementTransaction>> {
    conn.query_row(
        &format!("SELECT {} FROM settlements WHERE assignment_id = ?1", SETTLEMENT_COLUMNS),
        params![assignment.to_string()],
        settlement_from_row,
    )
    .optional()
}

/// Insert task rows, skipping source ids the project already has.
fn insert_task_rows(conn: &Connection, tasks: Vec<Task>) -> Result<Vec<Task>, StoreError> {
    let mut inserted = Vec::new();
    for task in tasks {
        let project_exists = conn
            .prepare_cached("SELECT 1 FROM projects WHERE id = ?1")?
            .exists(params![task.project_id.to_string()])?;
        if !project_exists {
            return Err(StoreError::not_found("project", task.project_id));
        }
        let changed = conn.execute(
            &format!(
                "INSERT OR IGNORE INTO tasks ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                TASK_COLUMNS
            ),
            params![
                task.id.to_string(),
                task.project_id.to_string(),
                task.source_task_id,
                task.payload.to_string(),
                task.status.as_str(),
                task.price.to_string(),
                ts(task.created_at),
                ts(task.updated_at),
            ],
        )?;
        if changed == 1 {
            inserted.push(task);
        }
    }
    Ok(inserted)
}

/// Claim a task with a single conditional update.
fn claim_row(conn: &Connection, id: TaskId) -> Result<(), StoreError> {
    let changed = conn.execute(
        "UPDATE tasks SET status = 'claimed', updated_at = ?1 WHERE id = ?2 AND status = 'available'",
        params![ts(Utc::now()), id.to_string()],
    )?;
    if changed == 1 {
        return Ok(());
    }
    if task_exists(conn, id)? {
        Err(StoreError::TaskUnavailable(id))
    } else {
        Err(StoreError::not_found("task", id))
    }
}

fn set_task_available(conn: &Connection, id: TaskId) -> Result<(), StoreError> {
    let changed = conn.execute(
        "UPDATE tasks SET status = 'available', updated_at = ?1 WHERE id = ?2",
        params![ts(Utc::now()), id.to_string()],
    )?;
    if changed == 0 {
        return Err(StoreError::not_found("task", id));
    }
    Ok(())
}

fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _) if err.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

/// Append `clause` with one `?` per value, collecting the values.
struct Where {
    clauses: Vec<String>,
    values: Vec<String>,
}

impl Where {
    fn new() -> Self {
        Self {
            clauses: Vec::new(),
            values: Vec::new(),
        }
    }

    fn eq(&mut self, column: &str, value: Option<String>) {
        if let Some(value) = value {
            self.clauses.push(format!("{} = ?", column));
            self.values.push(value);
        }
    }

    fn raw(&mut self, clause: &str, value: Option<String>) {
        if let Some(value) = value {
            self.clauses.push(clause.to_string());
            self.values.push(value);
        }
    }

    fn any_of(&mut self, column: &str, values: Option<Vec<String>>) {
        if let Some(values) = values {
            if values.is_empty() {
                self.clauses.push("0".to_string());
                return;
            }
            let marks = vec!["?"; values.len()].join(", ");
            self.clauses.push(format!("{} IN ({})", column, marks));
            self.values.extend(values);
        }
    }

    fn sql(&self) -> String {
        if self.clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", self.clauses.join(" AND "))
        }
    }
}

impl MarketStore for SqliteStore {
    fn is_persistent(&self) -> bool {
        true
    }
}

#[async_trait]
impl ProjectStore for SqliteStore {
    async fn insert_project(&self, project: &Project, tasks: &[Task]) -> Result<Vec<Task>, StoreError> {
        if let Some(task) = tasks.iter().find(|t| t.project_id != project.id) {
            return Err(StoreError::Backend(format!(
                "task {} belongs to another project",
                task.id
            )));
        }
        let project = project.clone();
        let tasks = tasks.to_vec();
        self.run(move |conn| {
            let tx = conn.transaction()?;
            let exists = tx
                .prepare("SELECT 1 FROM projects WHERE owner = ?1 AND source_project_id = ?2")?
                .exists(params![project.owner.as_str(), project.source_project_id])?;
            if exists {
                return Err(StoreError::Duplicate(format!(
                    "source project {} already imported",
                    project.source_project_id
                )));
            }
            tx.execute(
                &format!(
                    "INSERT INTO projects ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                    PROJECT_COLUMNS
                ),
                params![
                    project.id.to_string(),
                    project.owner.as_str(),
                    project.source_project_id,
                    project.title,
                    project.description,
                    project.budget.to_string(),
                    project.price_per_task.to_string(),
                    project.published as i32,
                    ts(project.created_at),
                    ts(project.updated_at),
                ],
            )?;
            let inserted = insert_task_rows(&tx, tasks)?;
            tx.commit()?;
            Ok(inserted)
        })
        .await
    }

    async fn get_project(&self, id: ProjectId) -> Result<Option<Project>, StoreError> {
        self.run(move |conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT {} FROM projects WHERE id = ?1", PROJECT_COLUMNS),
                    params![id.to_string()],
                    project_from_row,
                )
                .optional()?)
        })
        .await
    }

    async fn list_projects(
        &self,
        owner: Option<&UserId>,
        published_only: bool,
    ) -> Result<Vec<Project>, StoreError> {
        let owner = owner.map(|o| o.to_string());
        self.run(move |conn| {
            let mut filter = Where::new();
            filter.eq("owner", owner);
            if published_only {
                filter.clauses.push("published = 1".to_string());
            }
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM projects{} ORDER BY created_at DESC",
                PROJECT_COLUMNS,
                filter.sql()
            ))?;
            let projects = stmt
                .query_map(params_from_iter(filter.values.iter()), project_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(projects)
        })
        .await
    }

    async fn update_project(&self, project: &Project) -> Result<(), StoreError> {
        let project = project.clone();
        self.run(move |conn| {
            let changed = conn.execute(
                "UPDATE projects SET title = ?1, description = ?2, budget = ?3, price_per_task = ?4,
                        published = ?5, updated_at = ?6
                 WHERE id = ?7",
                params![
                    project.title,
                    project.description,
                    project.budget.to_string(),
                    project.price_per_task.to_string(),
                    project.published as i32,
                    ts(project.updated_at),
                    project.id.to_string(),
                ],
            )?;
            if changed == 0 {
                return Err(StoreError::not_found("project", project.id));
            }
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl TaskStore for SqliteStore {
    async fn insert_tasks(&self, tasks: &[Task]) -> Result<Vec<Task>, StoreError> {
        let tasks = tasks.to_vec();
        self.run(move |conn| {
            let tx = conn.transaction()?;
            let inserted = insert_task_rows(&tx, tasks)?;
            tx.commit()?;
            Ok(inserted)
        })
        .await
    }

    async fn get_task(&self, id: TaskId) -> Result<Option<Task>, StoreError> {
        self.run(move |conn| Ok(load_task(conn, id)?)).await
    }

    async fn list_available(&self, project: Option<ProjectId>) -> Result<Vec<Task>, StoreError> {
        self.run(move |conn| {
            let mut filter = Where::new();
            filter.eq("status", Some(TaskStatus::Available.as_str().to_string()));
            filter.eq("project_id", project.map(|p| p.to_string()));
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM tasks{} ORDER BY seq ASC",
                TASK_COLUMNS,
                filter.sql()
            ))?;
            let tasks = stmt
                .query_map(params_from_iter(filter.values.iter()), task_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(tasks)
        })
        .await
    }

    async fn list_tasks(&self, project: ProjectId) -> Result<Vec<Task>, StoreError> {
        self.run(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM tasks WHERE project_id = ?1 ORDER BY seq ASC",
                TASK_COLUMNS
            ))?;
            let tasks = stmt
                .query_map(params![project.to_string()], task_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(tasks)
        })
        .await
    }

    async fn count_tasks(&self, project: ProjectId) -> Result<u64, StoreError> {
        self.run(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM tasks WHERE project_id = ?1",
                params![project.to_string()],
                |row| row.get(0),
            )?;
            Ok(count.max(0) as u64)
        })
        .await
    }

    async fn mark_claimed(&self, id: TaskId) -> Result<(), StoreError> {
        self.run(move |conn| claim_row(conn, id)).await
    }

    async fn release(&self, id: TaskId) -> Result<(), StoreError> {
        self.run(move |conn| set_task_available(conn, id)).await
    }

    async fn reprice_available(&self, project: ProjectId, price: Usdc) -> Result<u64, StoreError> {
        self.run(move |conn| {
            let changed = conn.execute(
                "UPDATE tasks SET price = ?1, updated_at = ?2 WHERE project_id = ?3 AND status = 'available'",
                params![price.to_string(), ts(Utc::now()), project.to_string()],
            )?;
            Ok(changed as u64)
        })
        .await
    }

    async fn remove_task(&self, id: TaskId) -> Result<(), StoreError> {
        self.run(move |conn| {
            let changed = conn.execute(
                "DELETE FROM tasks WHERE id = ?1 AND status = 'available'
                   AND NOT EXISTS (SELECT 1 FROM assignments WHERE task_id = ?1)",
                params![id.to_string()],
            )?;
            if changed == 1 {
                return Ok(());
            }
            if task_exists(conn, id)? {
                Err(StoreError::TaskInUse(id))
            } else {
                Err(StoreError::not_found("task", id))
            }
        })
        .await
    }
}

#[async_trait]
impl AssignmentStore for SqliteStore {
    async fn claim_task(&self, assignment: &Assignment) -> Result<(), StoreError> {
        let a = assignment.clone();
        self.run(move |conn| {
            let tx = conn.transaction()?;
            claim_row(&tx, a.task_id)?;
            let inserted = tx.execute(
                &format!(
                    "INSERT INTO assignments ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
                    ASSIGNMENT_COLUMNS
                ),
                params![
                    a.id.to_string(),
                    a.task_id.to_string(),
                    a.project_id.to_string(),
                    a.annotator.as_str(),
                    a.status.as_str(),
                    a.result.as_ref().map(|v| v.to_string()),
                    a.quality_score,
                    a.feedback,
                    a.settlement_id.map(|s| s.to_string()),
                    ts(a.assigned_at),
                    opt_ts(a.accepted_at),
                    opt_ts(a.started_at),
                    opt_ts(a.submitted_at),
                    opt_ts(a.completed_at),
                    opt_ts(a.cancelled_at),
                    ts(a.updated_at),
                ],
            );
            match inserted {
                Ok(_) => {}
                Err(e) if is_constraint_violation(&e) => {
                    return Err(StoreError::TaskUnavailable(a.task_id));
                }
                Err(e) => return Err(e.into()),
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn get_assignment(&self, id: AssignmentId) -> Result<Option<Assignment>, StoreError> {
        self.run(move |conn| Ok(load_assignment(conn, id)?)).await
    }

    async fn list_assignments(&self, filter: &AssignmentFilter) -> Result<Vec<Assignment>, StoreError> {
        let filter = filter.clone();
        self.run(move |conn| {
            let mut clause = Where::new();
            clause.eq("annotator", filter.annotator.map(|u| u.to_string()));
            clause.eq("project_id", filter.project_id.map(|p| p.to_string()));
            clause.eq("task_id", filter.task_id.map(|t| t.to_string()));
            clause.raw(
                "project_id IN (SELECT id FROM projects WHERE owner = ?)",
                filter.project_owner.map(|u| u.to_string()),
            );
            clause.any_of(
                "status",
                filter
                    .statuses
                    .map(|s| s.iter().map(|st| st.as_str().to_string()).collect()),
            );
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM assignments{} ORDER BY assigned_at DESC",
                ASSIGNMENT_COLUMNS,
                clause.sql()
            ))?;
            let assignments = stmt
                .query_map(params_from_iter(clause.values.iter()), assignment_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(assignments)
        })
        .await
    }

    async fn transition_assignment(
        &self,
        id: AssignmentId,
        change: AssignmentChange,
    ) -> Result<Assignment, StoreError> {
        self.run(move |conn| {
            let tx = conn.transaction()?;
            let current = load_assignment(&tx, id)?.ok_or_else(|| StoreError::not_found("assignment", id))?;
            if !change.allowed_from().contains(&current.status) {
                return Err(StoreError::AssignmentState {
                    current: current.status,
                });
            }

            match &change {
                AssignmentChange::Approve { settlement_id, .. } => {
                    let settlement = load_settlement(&tx, *settlement_id)?
                        .filter(|s| s.assignment_id == id)
                        .ok_or_else(|| StoreError::not_found("settlement", settlement_id))?;
                    if settlement.status != SettlementStatus::Completed {
                        return Err(StoreError::SettlementState {
                            current: settlement.status,
                        });
                    }
                }
                AssignmentChange::Reject { .. } => {
                    if let Some(existing) = settlement_for(&tx, id)?
                        .filter(|s| s.status != SettlementStatus::Failed)
                    {
                        return Err(StoreError::SettlementExists(existing.id));
                    }
                }
                _ => {}
            }

            let mut next = current.clone();
            change.apply(&mut next, Utc::now());
            let changed = tx.execute(
                "UPDATE assignments SET status = ?1, result = ?2, quality_score = ?3, feedback = ?4,
                        settlement_id = ?5, accepted_at = ?6, started_at = ?7, submitted_at = ?8,
                        completed_at = ?9, cancelled_at = ?10, updated_at = ?11
                 WHERE id = ?12 AND status = ?13",
                params![
                    next.status.as_str(),
                    next.result.as_ref().map(|v| v.to_string()),
                    next.quality_score,
                    next.feedback,
                    next.settlement_id.map(|s| s.to_string()),
                    opt_ts(next.accepted_at),
                    opt_ts(next.started_at),
                    opt_ts(next.submitted_at),
                    opt_ts(next.completed_at),
                    opt_ts(next.cancelled_at),
                    ts(next.updated_at),
                    id.to_string(),
                    current.status.as_str(),
                ],
            )?;
            if changed == 0 {
                return Err(StoreError::AssignmentState {
                    current: current.status,
                });
            }
            if matches!(change, AssignmentChange::Cancel | AssignmentChange::Reject { .. }) {
                set_task_available(&tx, next.task_id)?;
            }
            tx.commit()?;
            Ok(next)
        })
        .await
    }
}

#[async_trait]
impl SettlementStore for SqliteStore {
    async fn reserve_settlement(&self, settlement: &SettlementTransaction) -> Result<(), StoreError> {
        let s = settlement.clone();
        self.run(move |conn| {
            let tx = conn.transaction()?;
            let assignment = load_assignment(&tx, s.assignment_id)?
                .ok_or_else(|| StoreError::not_found("assignment", s.assignment_id))?;
            if assignment.status != AssignmentStatus::Submitted {
                return Err(StoreError::AssignmentState {
                    current: assignment.status,
                });
            }
            if let Some(existing) = settlement_for(&tx, s.assignment_id)? {
                return Err(StoreError::SettlementExists(existing.id));
            }
            tx.execute(
                &format!(
                    "INSERT INTO settlements ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
                    SETTLEMENT_COLUMNS
                ),
                params![
                    s.id.to_string(),
                    s.assignment_id.to_string(),
                    s.recipient.as_str(),
                    s.to_address.as_str(),
                    s.amount.to_string(),
                    s.platform_fee.to_string(),
                    s.network,
                    s.status.as_str(),
                    s.transaction_hash,
                    s.from_address,
                    s.retry_count,
                    s.error_detail,
                    s.metadata.to_string(),
                    ts(s.created_at),
                    opt_ts(s.processed_at),
                    opt_ts(s.completed_at),
                    ts(s.updated_at),
                ],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn get_settlement(&self, id: TransactionId) -> Result<Option<SettlementTransaction>, StoreError> {
        self.run(move |conn| Ok(load_settlement(conn, id)?)).await
    }

    async fn settlement_for_assignment(
        &self,
        assignment: AssignmentId,
    ) -> Result<Option<SettlementTransaction>, StoreError> {
        self.run(move |conn| Ok(settlement_for(conn, assignment)?)).await
    }

    async fn list_settlements(
        &self,
        recipient: Option<&UserId>,
        status: Option<SettlementStatus>,
    ) -> Result<Vec<SettlementTransaction>, StoreError> {
        let recipient = recipient.map(|r| r.to_string());
        self.run(move |conn| {
            let mut filter = Where::new();
            filter.eq("recipient", recipient);
            filter.eq("status", status.map(|s| s.as_str().to_string()));
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM settlements{} ORDER BY created_at DESC",
                SETTLEMENT_COLUMNS,
                filter.sql()
            ))?;
            let settlements = stmt
                .query_map(params_from_iter(filter.values.iter()), settlement_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(settlements)
        })
        .await
    }

    async fn update_settlement(
        &self,
        id: TransactionId,
        from: &[SettlementStatus],
        update: SettlementUpdate,
    ) -> Result<SettlementTransaction, StoreError> {
        let from = from.to_vec();
        self.run(move |conn| {
            let tx = conn.transaction()?;
            let current = load_settlement(&tx, id)?.ok_or_else(|| StoreError::not_found("settlement", id))?;
            if !from.contains(&current.status) {
                return Err(StoreError::SettlementState {
                    current: current.status,
                });
            }
            if matches!(update, SettlementUpdate::Processing) {
                let assignment = load_assignment(&tx, current.assignment_id)?
                    .ok_or_else(|| StoreError::not_found("assignment", current.assignment_id))?;
                if assignment.status != AssignmentStatus::Submitted {
                    return Err(StoreError::AssignmentState {
                        current: assignment.status,
                    });
                }
            }
            let mut next = current.clone();
            update.apply(&mut next, Utc::now());
            let changed = tx.execute(
                "UPDATE settlements SET status = ?1, transaction_hash = ?2, from_address = ?3,
                        retry_count = ?4, error_detail = ?5, processed_at = ?6, completed_at = ?7,
                        updated_at = ?8
                 WHERE id = ?9 AND status = ?10",
                params![
                    next.status.as_str(),
                    next.transaction_hash,
                    next.from_address,
                    next.retry_count,
                    next.error_detail,
                    opt_ts(next.processed_at),
                    opt_ts(next.completed_at),
                    ts(next.updated_at),
                    id.to_string(),
                    current.status.as_str(),
                ],
            )?;
            if changed == 0 {
                return Err(StoreError::SettlementState {
                    current: current.status,
                });
            }
            tx.commit()?;
            Ok(next)
        })
        .await
    }

    async fn list_unconfirmed_settlements(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<SettlementTransaction>, StoreError> {
        self.run(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM settlements
                 WHERE status IN ('pending', 'processing') AND updated_at <= ?1
                 ORDER BY updated_at ASC",
                SETTLEMENT_COLUMNS
            ))?;
            let settlements = stmt
                .query_map(params![ts(older_than)], settlement_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(settlements)
        })
        .await
    }
}

#[async_trait]
impl AuditStore for SqliteStore {
    async fn append_audit(&self, entry: &NewAuditEntry) -> Result<AuditEntry, StoreError> {
        let entry = entry.clone();
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO audit_log (actor, action, resource_type, resource_id, timestamp, details, success, error_message)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    entry.actor.as_ref().map(|a| a.as_str()),
                    entry.action.as_str(),
                    entry.resource_type,
                    entry.resource_id,
                    ts(entry.timestamp),
                    entry.details.to_string(),
                    entry.success as i32,
                    entry.error_message,
                ],
            )?;
            Ok(AuditEntry {
                id: conn.last_insert_rowid(),
                actor: entry.actor,
                action: entry.action,
                resource_type: entry.resource_type.to_string(),
                resource_id: entry.resource_id,
                timestamp: entry.timestamp,
                details: entry.details,
                success: entry.success,
                error_message: entry.error_message,
            })
        })
        .await
    }

    async fn query_audit(&self, filter: &AuditFilter) -> Result<Vec<AuditEntry>, StoreError> {
        let filter = filter.clone();
        self.run(move |conn| {
            let mut clause = Where::new();
            clause.eq("actor", filter.actor.as_ref().map(|a| a.to_string()));
            clause.eq("action", filter.action.map(|a| a.as_str().to_string()));
            clause.eq("resource_id", filter.resource_id.clone());
            clause.raw("timestamp >= ?", filter.since.map(ts));
            clause.raw("timestamp <= ?", filter.until.map(ts));
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM audit_log{} ORDER BY id DESC LIMIT {}",
                AUDIT_COLUMNS,
                clause.sql(),
                filter.limit()
            ))?;
            let entries = stmt
                .query_map(params_from_iter(clause.values.iter()), audit_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(entries)
        })
        .await
    }
}

#[async_trait]
impl DirectoryStore for SqliteStore {
    async fn put_wallet(&self, record: &WalletRecord) -> Result<(), StoreError> {
        let record = record.clone();
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO wallets (user_id, address, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(user_id) DO UPDATE SET address = excluded.address, updated_at = excluded.updated_at",
                params![
                    record.user_id.as_str(),
                    record.address.as_str(),
                    ts(record.updated_at)
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_wallet(&self, user: &UserId) -> Result<Option<WalletRecord>, StoreError> {
        let user = user.clone();
        self.run(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT address, updated_at FROM wallets WHERE user_id = ?1",
                    params![user.as_str()],
                    |row| {
                        Ok(WalletRecord {
                            user_id: user.clone(),
                            address: col(row, 0)?,
                            updated_at: col(row, 1)?,
                        })
                    },
                )
                .optional()?)
        })
        .await
    }

    async fn put_connection(&self, owner: &UserId, connection: &SourceConnection) -> Result<(), StoreError> {
        let owner = owner.clone();
        let raw = serde_json::to_string(connection)
            .map_err(|e| StoreError::Backend(format!("Failed to encode connection: {}", e)))?;
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO source_connections (owner, connection, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(owner) DO UPDATE SET connection = excluded.connection, updated_at = excluded.updated_at",
                params![owner.as_str(), raw, ts(Utc::now())],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_connection(&self, owner: &UserId) -> Result<Option<SourceConnection>, StoreError> {
        let owner = owner.clone();
        self.run(move |conn| {
            let raw: Option<String> = conn
                .query_row(
                    "SELECT connection FROM source_connections WHERE owner = ?1",
                    params![owner.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            raw.map(|s| {
                serde_json::from_str(&s)
                    .map_err(|e| StoreError::Backend(format!("Failed to decode connection: {}", e)))
            })
            .transpose()
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests as shared;
    use super::*;
    use crate::audit::AuditAction;

    async fn temp_store() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::new(dir.path().to_path_buf()).await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_task_listing_and_claim() {
        let (_dir, store) = temp_store().await;
        shared::check_task_listing_and_claim(&store).await;
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let (_dir, store) = temp_store().await;
        shared::check_claim_is_exclusive(&store).await;
    }

    #[tokio::test]
    async fn test_transitions_are_conditional() {
        let (_dir, store) = temp_store().await;
        shared::check_transitions_are_conditional(&store).await;
    }

    #[tokio::test]
    async fn test_settlement_guards() {
        let (_dir, store) = temp_store().await;
        shared::check_settlement_guards(&store).await;
    }

    #[tokio::test]
    async fn test_reject_relists() {
        let (_dir, store) = temp_store().await;
        shared::check_reject_relists(&store).await;
    }

    #[tokio::test]
    async fn test_directory() {
        let (_dir, store) = temp_store().await;
        shared::check_directory(&store).await;
    }

    #[tokio::test]
    async fn test_project_import_is_atomic() {
        let (_dir, store) = temp_store().await;
        shared::check_project_import_is_atomic(&store).await;
    }

    #[tokio::test]
    async fn test_remove_task_keeps_history() {
        let (_dir, store) = temp_store().await;
        shared::check_remove_task_keeps_history(&store).await;
    }

    #[tokio::test]
    async fn test_failed_settlement_can_be_closed() {
        let (_dir, store) = temp_store().await;
        shared::check_failed_settlement_can_be_closed(&store).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_claims_single_winner() {
        let (_dir, store) = temp_store().await;
        shared::check_concurrent_claims(Arc::new(store)).await;
    }

    #[tokio::test]
    async fn test_assignments_reference_their_task() {
        let (_dir, store) = temp_store().await;
        let project = shared::sample_project("researcher-r");
        let task = Task::new(project.id, 1, serde_json::json!({}), project.price_per_task);
        store
            .insert_project(&project, std::slice::from_ref(&task))
            .await
            .unwrap();
        let assignment = Assignment::new(&task, UserId::from("annotator-a"));
        store.claim_task(&assignment).await.unwrap();

        let conn = store.conn.lock().await;
        assert!(conn
            .execute("DELETE FROM tasks WHERE id = ?1", params![task.id.to_string()])
            .is_err());
        assert!(conn
            .execute(
                "UPDATE assignments SET task_id = 'missing' WHERE id = ?1",
                params![assignment.id.to_string()],
            )
            .is_err());
    }

    #[tokio::test]
    async fn test_audit_log_is_append_only() {
        let (_dir, store) = temp_store().await;
        store
            .append_audit(&NewAuditEntry::new(AuditAction::TaskClaim, "task", "t1"))
            .await
            .unwrap();

        let conn = store.conn.lock().await;
        assert!(conn.execute("UPDATE audit_log SET success = 0", []).is_err());
        assert!(conn.execute("DELETE FROM audit_log", []).is_err());
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM audit_log", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_settlements_cannot_be_deleted_or_repointed() {
        let (_dir, store) = temp_store().await;
        let project = shared::sample_project("researcher-r");
        let task = Task::new(project.id, 1, serde_json::json!({}), project.price_per_task);
        store
            .insert_project(&project, std::slice::from_ref(&task))
            .await
            .unwrap();
        let assignment = Assignment::new(&task, UserId::from("annotator-a"));
        store.claim_task(&assignment).await.unwrap();
        store
            .transition_assignment(
                assignment.id,
                AssignmentChange::Submit {
                    result: serde_json::json!({"label": "x"}),
                },
            )
            .await
            .unwrap();
        store
            .reserve_settlement(&shared::sample_settlement(&assignment))
            .await
            .unwrap();

        let conn = store.conn.lock().await;
        assert!(conn.execute("DELETE FROM settlements", []).is_err());
        assert!(conn
            .execute("UPDATE settlements SET assignment_id = 'other'", [])
            .is_err());
    }

    #[tokio::test]
    async fn test_data_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let project = shared::sample_project("researcher-r");
        {
            let store = SqliteStore::new(dir.path().to_path_buf()).await.unwrap();
            store.insert_project(&project, &[]).await.unwrap();
        }
        let store = SqliteStore::new(dir.path().to_path_buf()).await.unwrap();
        let loaded = store.get_project(project.id).await.unwrap().unwrap();
        assert_eq!(loaded.title, project.title);
        assert_eq!(loaded.price_per_task, project.price_per_task);
        assert!(store.is_persistent());
    }
}

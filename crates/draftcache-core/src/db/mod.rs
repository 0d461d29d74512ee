//! Relational artifact store.
//!
//! Artifacts are the durable result of a workspace. Rows are unique per
//! `(owner_id, topic)` so concurrent creates from duplicate tasks collapse
//! onto one row.

pub mod types;

pub use types::*;

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::Mutex;
use tracing::debug;

use crate::error::{Error, Result};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS artifact (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    owner_id          INTEGER NOT NULL,
    topic             TEXT NOT NULL,
    body              TEXT NOT NULL DEFAULT '',
    instructions      TEXT NOT NULL DEFAULT '',
    generation_target TEXT NOT NULL DEFAULT '',
    status            TEXT NOT NULL DEFAULT 'draft',
    tags              TEXT NOT NULL DEFAULT '[]',
    version           INTEGER NOT NULL DEFAULT 1,
    workspace_token   TEXT,
    source_version    INTEGER NOT NULL DEFAULT 0,
    created_at        INTEGER NOT NULL,
    updated_at        INTEGER NOT NULL,
    committed_at      INTEGER,
    UNIQUE(owner_id, topic)
);
CREATE INDEX IF NOT EXISTS idx_artifact_owner ON artifact(owner_id);
";

const ARTIFACT_COLUMNS: &str = "id, owner_id, topic, body, instructions, generation_target, status,
     tags, version, workspace_token, source_version, created_at, updated_at, committed_at";

/// Repository contract used by write-back.
///
/// Every method is transactional at the single-row level.
pub trait ArtifactRepository: Send + Sync {
    /// Artifact by id, scoped to its owner.
    fn find_artifact(&self, owner_id: i64, id: i64) -> Result<Artifact>;

    /// Artifact by its natural key.
    fn find_artifact_by_topic(&self, owner_id: i64, topic: &str) -> Result<Option<Artifact>>;

    /// Insert an artifact. On an `(owner_id, topic)` conflict the existing row
    /// wins and its id is returned.
    fn create_artifact(&self, owner_id: i64, fields: &ArtifactFields) -> Result<i64>;

    /// Overwrite an artifact and bump its version.
    ///
    /// Returns `false` when the row is missing or was already written by a
    /// newer version of the same workspace.
    fn update_artifact(&self, owner_id: i64, id: i64, fields: &ArtifactFields) -> Result<bool>;
}

/// Database connection wrapper.
///
/// Thread-safe via internal Mutex. All database operations acquire the lock.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (and migrate) the database at a specific path
    pub fn open_path(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref()).map_err(Error::Database)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::from_connection(conn)
    }

    /// Open a private in-memory database
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory().map_err(Error::Database)?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.migrate()?;
        Ok(db)
    }

    /// Create tables if they do not exist yet
    pub fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock().map_err(|_| Error::LockPoisoned)?;
        conn.execute_batch(SCHEMA).map_err(Error::Database)
    }

    /// Check database connectivity
    pub fn ping(&self) -> Result<()> {
        let conn = self.conn.lock().map_err(|_| Error::LockPoisoned)?;
        conn.execute_batch("SELECT 1").map_err(Error::Database)
    }

    /// Number of artifacts owned by a principal
    pub fn count_artifacts(&self, owner_id: i64) -> Result<i64> {
        let conn = self.conn.lock().map_err(|_| Error::LockPoisoned)?;
        let count = conn.query_row(
            "SELECT COUNT(*) FROM artifact WHERE owner_id = ?1",
            params![owner_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    fn map_artifact(row: &rusqlite::Row) -> rusqlite::Result<Artifact> {
        let tags: String = row.get(7)?;
        let tags = serde_json::from_str(&tags).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(7, rusqlite::types::Type::Text, Box::new(e))
        })?;
        Ok(Artifact {
            id: row.get(0)?,
            owner_id: row.get(1)?,
            topic: row.get(2)?,
            body: row.get(3)?,
            instructions: row.get(4)?,
            generation_target: row.get(5)?,
            status: row.get(6)?,
            tags,
            version: row.get(8)?,
            workspace_token: row.get(9)?,
            source_version: row.get(10)?,
            created_at: row.get(11)?,
            updated_at: row.get(12)?,
            committed_at: row.get(13)?,
        })
    }

    fn committed_at(fields: &ArtifactFields, now: i64) -> Option<i64> {
        (fields.status == crate::types::ArtifactStatus::Committed.as_str()).then_some(now)
    }
}

impl ArtifactRepository for Database {
    fn find_artifact(&self, owner_id: i64, id: i64) -> Result<Artifact> {
        let conn = self.conn.lock().map_err(|_| Error::LockPoisoned)?;
        conn.query_row(
            &format!("SELECT {ARTIFACT_COLUMNS} FROM artifact WHERE id = ?1 AND owner_id = ?2"),
            params![id, owner_id],
            Self::map_artifact,
        )
        .optional()?
        .ok_or_else(|| Error::not_found("artifact", id.to_string()))
    }

    fn find_artifact_by_topic(&self, owner_id: i64, topic: &str) -> Result<Option<Artifact>> {
        let conn = self.conn.lock().map_err(|_| Error::LockPoisoned)?;
        let artifact = conn
            .query_row(
                &format!("SELECT {ARTIFACT_COLUMNS} FROM artifact WHERE owner_id = ?1 AND topic = ?2"),
                params![owner_id, topic],
                Self::map_artifact,
            )
            .optional()?;
        Ok(artifact)
    }

    fn create_artifact(&self, owner_id: i64, fields: &ArtifactFields) -> Result<i64> {
        let conn = self.conn.lock().map_err(|_| Error::LockPoisoned)?;
        let now = Utc::now().timestamp_millis();
        let tags = serde_json::to_string(&fields.tags)?;

        let inserted = conn.execute(
            "INSERT INTO artifact (owner_id, topic, body, instructions, generation_target, status,
                                   tags, version, workspace_token, source_version,
                                   created_at, updated_at, committed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, ?8, ?9, ?10, ?10, ?11)
             ON CONFLICT(owner_id, topic) DO NOTHING",
            params![
                owner_id,
                fields.topic,
                fields.body,
                fields.instructions,
                fields.generation_target,
                fields.status,
                tags,
                fields.workspace_token,
                fields.source_version,
                now,
                Self::committed_at(fields, now),
            ],
        )?;

        let id: i64 = conn.query_row(
            "SELECT id FROM artifact WHERE owner_id = ?1 AND topic = ?2",
            params![owner_id, fields.topic],
            |row| row.get(0),
        )?;

        if inserted == 0 {
            debug!(owner_id = owner_id, artifact_id = id, "Create resolved to existing artifact");
        }
        Ok(id)
    }

    fn update_artifact(&self, owner_id: i64, id: i64, fields: &ArtifactFields) -> Result<bool> {
        let conn = self.conn.lock().map_err(|_| Error::LockPoisoned)?;
        let now = Utc::now().timestamp_millis();
        let tags = serde_json::to_string(&fields.tags)?;

        let updated = conn.execute(
            "UPDATE artifact
             SET topic = ?3, body = ?4, instructions = ?5, generation_target = ?6, status = ?7,
                 tags = ?8, version = version + 1, workspace_token = ?9, source_version = ?10,
                 updated_at = ?11, committed_at = COALESCE(committed_at, ?12)
             WHERE id = ?1 AND owner_id = ?2
               AND NOT (workspace_token IS ?9 AND source_version > ?10)",
            params![
                id,
                owner_id,
                fields.topic,
                fields.body,
                fields.instructions,
                fields.generation_target,
                fields.status,
                tags,
                fields.workspace_token,
                fields.source_version,
                now,
                Self::committed_at(fields, now),
            ],
        )?;
        Ok(updated > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn fields(topic: &str, version: i64) -> ArtifactFields {
        ArtifactFields {
            topic: topic.to_string(),
            body: format!("body v{version}"),
            instructions: String::new(),
            generation_target: "cover-letter".into(),
            status: "draft".into(),
            tags: vec!["rust".into(), "tokio".into()],
            workspace_token: "tok".into(),
            source_version: version,
        }
    }

    #[test]
    fn test_create_and_find() {
        let db = Database::open_in_memory().unwrap();
        let id = db.create_artifact(7, &fields("interview", 1)).unwrap();

        let artifact = db.find_artifact(7, id).unwrap();
        assert_eq!(artifact.topic, "interview");
        assert_eq!(artifact.tags, vec!["rust".to_string(), "tokio".to_string()]);
        assert_eq!(artifact.version, 1);
        assert_eq!(artifact.workspace_token.as_deref(), Some("tok"));
        assert!(artifact.committed_at.is_none());

        let by_topic = db.find_artifact_by_topic(7, "interview").unwrap().unwrap();
        assert_eq!(by_topic.id, id);
    }

    #[test]
    fn test_find_is_owner_scoped() {
        let db = Database::open_in_memory().unwrap();
        let id = db.create_artifact(7, &fields("interview", 1)).unwrap();

        assert!(db.find_artifact(8, id).unwrap_err().is_not_found());
        assert!(db.find_artifact_by_topic(8, "interview").unwrap().is_none());
    }

    #[test]
    fn test_create_conflict_returns_existing_row() {
        let db = Database::open_in_memory().unwrap();
        let first = db.create_artifact(7, &fields("interview", 1)).unwrap();
        let second = db.create_artifact(7, &fields("interview", 2)).unwrap();

        assert_eq!(first, second);
        assert_eq!(db.count_artifacts(7).unwrap(), 1);
        assert_eq!(db.find_artifact(7, first).unwrap().body, "body v1");
    }

    #[test]
    fn test_update_bumps_version_and_sets_commit_time() {
        let db = Database::open_in_memory().unwrap();
        let id = db.create_artifact(7, &fields("interview", 1)).unwrap();

        let mut next = fields("interview", 2);
        next.status = "committed".into();
        assert!(db.update_artifact(7, id, &next).unwrap());

        let artifact = db.find_artifact(7, id).unwrap();
        assert_eq!(artifact.version, 2);
        assert_eq!(artifact.source_version, 2);
        assert!(artifact.is_committed());
        assert!(artifact.committed_at.is_some());
    }

    #[test]
    fn test_update_refuses_older_source_version() {
        let db = Database::open_in_memory().unwrap();
        let id = db.create_artifact(7, &fields("interview", 5)).unwrap();

        assert!(!db.update_artifact(7, id, &fields("interview", 3)).unwrap());
        assert_eq!(db.find_artifact(7, id).unwrap().body, "body v5");

        // A different workspace may overwrite regardless of its version.
        let mut other = fields("interview", 1);
        other.workspace_token = "other".into();
        assert!(db.update_artifact(7, id, &other).unwrap());
    }

    #[test]
    fn test_corrupt_tags_are_reported() {
        let db = Database::open_in_memory().unwrap();
        let id = db.create_artifact(7, &fields("interview", 1)).unwrap();
        db.conn
            .lock()
            .unwrap()
            .execute("UPDATE artifact SET tags = 'not json' WHERE id = ?1", params![id])
            .unwrap();

        assert!(matches!(db.find_artifact(7, id), Err(Error::Database(_))));
        assert!(db.find_artifact_by_topic(7, "interview").is_err());
    }

    #[test]
    fn test_update_missing_row() {
        let db = Database::open_in_memory().unwrap();
        assert!(!db.update_artifact(7, 99, &fields("x", 1)).unwrap());
    }

    #[test]
    fn test_reopen_keeps_rows() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("artifacts.db");

        let id = {
            let db = Database::open_path(&path).unwrap();
            db.create_artifact(7, &fields("interview", 1)).unwrap()
        };

        let db = Database::open_path(&path).unwrap();
        db.ping().unwrap();
        assert_eq!(db.find_artifact(7, id).unwrap().topic, "interview");
    }
}

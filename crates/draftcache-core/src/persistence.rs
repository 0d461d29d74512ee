//! Relational write-back of a persistence task.
//!
//! Shared by the background worker and the synchronous degraded path. The
//! write is idempotent: creates collapse on `(owner_id, topic)`, updates are
//! keyed by `(owner_id, artifact_id)`, and re-applying identical content is
//! reported as [`WriteOutcome::Unchanged`] without touching the row.

use tracing::{debug, info};

use crate::db::{Artifact, ArtifactFields, ArtifactRepository};
use crate::error::{Error, Result};
use crate::types::PersistenceTask;

/// Result of applying a task to the relational store.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
    Created(Artifact),
    Updated(Artifact),
    /// The row already held this content; nothing was written.
    Unchanged(Artifact),
}

impl WriteOutcome {
    pub fn artifact(&self) -> &Artifact {
        match self {
            WriteOutcome::Created(a) | WriteOutcome::Updated(a) | WriteOutcome::Unchanged(a) => a,
        }
    }

    pub fn artifact_id(&self) -> i64 {
        self.artifact().id
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WriteOutcome::Created(_) => "created",
            WriteOutcome::Updated(_) => "updated",
            WriteOutcome::Unchanged(_) => "unchanged",
        }
    }
}

/// Database failures while writing become [`Error::WriteFailure`].
fn writing(err: Error) -> Error {
    match err {
        Error::Database(e) => Error::write_failure(e.to_string()),
        Error::LockPoisoned => Error::write_failure("database lock poisoned"),
        other => other,
    }
}

/// Apply a task: resolve the target artifact, then create or update it.
///
/// Fails with [`Error::StaleVersion`] when the row was already written by a
/// newer version of the same workspace, and with [`Error::NotFound`] when the
/// task names an artifact the owner does not have.
pub fn write_back(repo: &dyn ArtifactRepository, task: &PersistenceTask) -> Result<WriteOutcome> {
    if task.owner_id <= 0 {
        return Err(Error::invalid_input(format!("invalid owner id {}", task.owner_id)));
    }
    if task.topic.trim().is_empty() {
        return Err(Error::invalid_input("task topic must not be empty"));
    }

    let owner_id = task.owner_id;
    let fields = ArtifactFields::from_task(task);

    // Resolving
    let existing = if task.artifact_id > 0 {
        Some(repo.find_artifact(owner_id, task.artifact_id)?)
    } else {
        repo.find_artifact_by_topic(owner_id, &task.topic)?
    };

    // Writing
    match existing {
        Some(artifact) => update_existing(repo, task, artifact, &fields),
        None => {
            let id = repo.create_artifact(owner_id, &fields).map_err(writing)?;
            let artifact = repo.find_artifact(owner_id, id)?;
            if artifact.matches(&fields) {
                info!(
                    owner_id = owner_id,
                    artifact_id = id,
                    task_id = %task.task_id,
                    "Artifact created"
                );
                return Ok(WriteOutcome::Created(artifact));
            }
            debug!(owner_id = owner_id, artifact_id = id, "Lost create race, updating");
            update_existing(repo, task, artifact, &fields)
        }
    }
}

fn update_existing(
    repo: &dyn ArtifactRepository,
    task: &PersistenceTask,
    artifact: Artifact,
    fields: &ArtifactFields,
) -> Result<WriteOutcome> {
    let (task_version, linked_version) = (task.version, artifact.source_version);
    let stale = move || Error::StaleVersion {
        task_version,
        linked_version,
    };

    if artifact.supersedes(fields) {
        return Err(stale());
    }
    if artifact.matches(fields) {
        debug!(artifact_id = artifact.id, task_id = %task.task_id, "Artifact unchanged");
        return Ok(WriteOutcome::Unchanged(artifact));
    }
    if !repo
        .update_artifact(task.owner_id, artifact.id, fields)
        .map_err(writing)?
    {
        return Err(stale());
    }

    let updated = repo.find_artifact(task.owner_id, artifact.id)?;
    info!(
        owner_id = task.owner_id,
        artifact_id = updated.id,
        version = updated.version,
        task_id = %task.task_id,
        "Artifact updated"
    );
    Ok(WriteOutcome::Updated(updated))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::types::{TaskAction, WorkspaceSnapshot};

    fn task(version: i64, body: &str) -> PersistenceTask {
        let mut snapshot = WorkspaceSnapshot::new(7, "interview");
        snapshot.token = "tok".into();
        snapshot.version = version;
        snapshot.draft_body = body.to_string();
        PersistenceTask::from_snapshot(&snapshot, false)
    }

    #[test]
    fn test_create_then_update() {
        let db = Database::open_in_memory().unwrap();

        let created = write_back(&db, &task(1, "first")).unwrap();
        assert_eq!(created.as_str(), "created");

        let mut next = task(2, "second");
        next.artifact_id = created.artifact_id();
        next.action = TaskAction::Update;
        let updated = write_back(&db, &next).unwrap();

        assert_eq!(updated.as_str(), "updated");
        assert_eq!(updated.artifact_id(), created.artifact_id());
        assert_eq!(updated.artifact().body, "second");
        assert_eq!(updated.artifact().version, 2);
    }

    #[test]
    fn test_duplicate_delivery_is_idempotent() {
        let db = Database::open_in_memory().unwrap();
        let t = task(1, "body");

        let first = write_back(&db, &t).unwrap();
        let second = write_back(&db, &t).unwrap();

        assert!(matches!(second, WriteOutcome::Unchanged(_)));
        assert_eq!(first.artifact_id(), second.artifact_id());
        assert_eq!(db.count_artifacts(7).unwrap(), 1);
        assert_eq!(second.artifact().version, 1);
    }

    #[test]
    fn test_create_dedups_on_topic() {
        let db = Database::open_in_memory().unwrap();
        let first = write_back(&db, &task(1, "a")).unwrap();

        // Same topic from a task that does not know the artifact id yet.
        let second = write_back(&db, &task(2, "b")).unwrap();
        assert_eq!(second.as_str(), "updated");
        assert_eq!(first.artifact_id(), second.artifact_id());
        assert_eq!(db.count_artifacts(7).unwrap(), 1);
    }

    #[test]
    fn test_older_version_is_stale() {
        let db = Database::open_in_memory().unwrap();
        let created = write_back(&db, &task(5, "new")).unwrap();

        let mut old = task(3, "old");
        old.artifact_id = created.artifact_id();
        let err = write_back(&db, &old).unwrap_err();

        assert!(err.is_stale());
        let artifact = db.find_artifact(7, created.artifact_id()).unwrap();
        assert_eq!(artifact.body, "new");
        assert_eq!(artifact.version, 1);
    }

    #[test]
    fn test_unknown_artifact_is_not_found() {
        let db = Database::open_in_memory().unwrap();
        let mut t = task(1, "x");
        t.artifact_id = 404;
        assert!(write_back(&db, &t).unwrap_err().is_not_found());
        assert_eq!(db.count_artifacts(7).unwrap(), 0);
    }

    #[test]
    fn test_commit_sets_status() {
        let db = Database::open_in_memory().unwrap();
        let mut t = task(1, "final");
        t.commit = true;
        t.status = "committed".into();

        let outcome = write_back(&db, &t).unwrap();
        assert!(outcome.artifact().is_committed());
        assert!(outcome.artifact().committed_at.is_some());
    }

    struct BrokenRepo;

    impl ArtifactRepository for BrokenRepo {
        fn find_artifact(&self, _owner_id: i64, id: i64) -> Result<Artifact> {
            Err(Error::not_found("artifact", id.to_string()))
        }

        fn find_artifact_by_topic(&self, _owner_id: i64, _topic: &str) -> Result<Option<Artifact>> {
            Ok(None)
        }

        fn create_artifact(&self, _owner_id: i64, _fields: &ArtifactFields) -> Result<i64> {
            Err(Error::Database(rusqlite::Error::InvalidQuery))
        }

        fn update_artifact(&self, _owner_id: i64, _id: i64, _fields: &ArtifactFields) -> Result<bool> {
            Err(Error::Database(rusqlite::Error::InvalidQuery))
        }
    }

    #[test]
    fn test_database_failure_is_write_failure() {
        let err = write_back(&BrokenRepo, &task(1, "x")).unwrap_err();
        assert!(matches!(err, Error::WriteFailure(_)));
    }

    #[test]
    fn test_rejects_empty_topic() {
        let db = Database::open_in_memory().unwrap();
        let mut t = task(1, "x");
        t.topic = " ".into();
        assert!(matches!(write_back(&db, &t), Err(Error::InvalidInput(_))));
    }
}

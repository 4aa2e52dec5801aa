//! Versioned policy store.
//!
//! The active policy is an `Arc<PolicySnapshot>`; readers clone the `Arc` and keep it for
//! the whole cycle, so a concurrent reload never changes a policy mid-cycle. Every
//! publish path (operator reload, autopilot submit, rollback) goes through the same
//! validation and the same mutex, and appends one [`PolicyRecord`] to the history.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{ConfigError, PolicyDocument, PolicySnapshot};

/// Who published a revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChangeOrigin {
    /// First load.
    Load { path: Option<PathBuf> },
    /// Operator reload.
    Reload { path: PathBuf },
    Autopilot { reason: String },
    Rollback { to: u64 },
}

/// One entry of the version history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyRecord {
    pub revision: u64,
    pub version: String,
    pub content_hash: String,
    pub applied_at: DateTime<Utc>,
    pub origin: ChangeOrigin,
    pub document: PolicyDocument,
}

#[derive(Debug)]
struct StoreInner {
    active: Arc<PolicySnapshot>,
    history: Vec<PolicyRecord>,
}

#[derive(Debug)]
pub struct ConfigStore {
    inner: Mutex<StoreInner>,
}

/// Read and fully validate a policy file.
pub fn read_policy_file(path: &Path) -> Result<PolicyDocument, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    PolicyDocument::from_yaml(&text)
}

impl PolicySnapshot {
    /// Read and validate `path` into a standalone snapshot (revision `0`). Nothing is
    /// published; use [`ConfigStore::open`] for a versioned store.
    pub fn load(path: impl AsRef<Path>, published_at: DateTime<Utc>) -> Result<Self, ConfigError> {
        Self::new(read_policy_file(path.as_ref())?, 0, published_at)
    }
}

impl ConfigStore {
    /// First load. There is nothing to fall back to, so any error is fatal for the caller.
    pub fn open(path: impl AsRef<Path>, now: DateTime<Utc>) -> Result<Self, ConfigError> {
        Self::open_at(path, 1, now)
    }

    /// Like [`open`](Self::open), but the loaded policy becomes `revision`. Used when a
    /// history file already numbers earlier revisions.
    pub fn open_at(
        path: impl AsRef<Path>,
        revision: u64,
        now: DateTime<Utc>,
    ) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let doc = read_policy_file(path)?;
        Self::with_origin(
            doc,
            revision,
            ChangeOrigin::Load {
                path: Some(path.to_path_buf()),
            },
            now,
        )
    }

    /// Start over from `source` as `revision` when the active policy cannot be loaded.
    /// `source` must itself validate.
    pub fn recover(
        source: impl AsRef<Path>,
        revision: u64,
        now: DateTime<Utc>,
    ) -> Result<Self, ConfigError> {
        let source = source.as_ref();
        let doc = read_policy_file(source)?;
        tracing::warn!(source = %source.display(), revision, "active policy replaced from source");
        Self::with_origin(
            doc,
            revision,
            ChangeOrigin::Reload {
                path: source.to_path_buf(),
            },
            now,
        )
    }

    pub fn from_document(doc: PolicyDocument, now: DateTime<Utc>) -> Result<Self, ConfigError> {
        Self::with_origin(doc, 1, ChangeOrigin::Load { path: None }, now)
    }

    fn with_origin(
        doc: PolicyDocument,
        revision: u64,
        origin: ChangeOrigin,
        now: DateTime<Utc>,
    ) -> Result<Self, ConfigError> {
        let revision = revision.max(1);
        let snap = Arc::new(PolicySnapshot::new(doc, revision, now)?);
        tracing::info!(
            revision,
            version = snap.version(),
            content_hash = snap.content_hash(),
            "policy loaded"
        );
        let record = record_of(&snap, origin);
        Ok(Self {
            inner: Mutex::new(StoreInner {
                active: snap,
                history: vec![record],
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Dry-run validation of a file. No state change.
    pub fn validate_file(path: impl AsRef<Path>) -> Result<PolicyDocument, ConfigError> {
        read_policy_file(path.as_ref())
    }

    /// The active policy.
    pub fn snapshot(&self) -> Arc<PolicySnapshot> {
        Arc::clone(&self.lock().active)
    }

    pub fn revision(&self) -> u64 {
        self.lock().active.revision()
    }

    /// Read, validate and publish `path`. On error the active policy is unchanged and the
    /// error carries every violation.
    pub fn reload(
        &self,
        path: impl AsRef<Path>,
        now: DateTime<Utc>,
    ) -> Result<Arc<PolicySnapshot>, ConfigError> {
        let path = path.as_ref();
        let doc = read_policy_file(path).map_err(|e| {
            tracing::warn!(path = %path.display(), error = %e, "policy reload rejected");
            e
        })?;
        let mut inner = self.lock();
        publish(
            &mut inner,
            doc,
            ChangeOrigin::Reload {
                path: path.to_path_buf(),
            },
            now,
        )
    }

    /// Publish `doc` only if the active revision is still `expected_revision`.
    pub fn submit(
        &self,
        doc: PolicyDocument,
        expected_revision: u64,
        origin: ChangeOrigin,
        now: DateTime<Utc>,
    ) -> Result<Arc<PolicySnapshot>, ConfigError> {
        let mut inner = self.lock();
        let active = inner.active.revision();
        if active != expected_revision {
            tracing::warn!(
                expected = expected_revision,
                active,
                ?origin,
                "policy submit rejected: revision moved"
            );
            return Err(ConfigError::VersionConflict {
                expected: expected_revision,
                active,
            });
        }
        publish(&mut inner, doc, origin, now)
    }

    /// Republish the document of a historical revision as a new revision.
    pub fn rollback(
        &self,
        revision: u64,
        now: DateTime<Utc>,
    ) -> Result<Arc<PolicySnapshot>, ConfigError> {
        let mut inner = self.lock();
        let doc = inner
            .history
            .iter()
            .find(|r| r.revision == revision)
            .map(|r| r.document.clone())
            .ok_or(ConfigError::UnknownRevision(revision))?;
        publish(&mut inner, doc, ChangeOrigin::Rollback { to: revision }, now)
    }

    /// Every published revision, oldest first.
    pub fn history(&self) -> Vec<PolicyRecord> {
        self.lock().history.clone()
    }

    /// Atomically write the active document as YAML (temp file + rename in the same
    /// directory).
    pub fn persist_active(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let yaml = self.snapshot().document().to_yaml()?;
        let io_err = |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(io_err)?;
        tmp.write_all(yaml.as_bytes()).map_err(io_err)?;
        tmp.as_file().sync_all().map_err(io_err)?;
        tmp.persist(path).map_err(|e| io_err(e.error))?;
        Ok(())
    }
}

fn record_of(snap: &PolicySnapshot, origin: ChangeOrigin) -> PolicyRecord {
    PolicyRecord {
        revision: snap.revision(),
        version: snap.version().to_string(),
        content_hash: snap.content_hash().to_string(),
        applied_at: snap.published_at(),
        origin,
        document: snap.document().clone(),
    }
}

fn publish(
    inner: &mut StoreInner,
    doc: PolicyDocument,
    origin: ChangeOrigin,
    now: DateTime<Utc>,
) -> Result<Arc<PolicySnapshot>, ConfigError> {
    let revision = inner.active.revision() + 1;
    let snap = match PolicySnapshot::new(doc, revision, now) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            for v in e.violations() {
                tracing::warn!(field = %v.field, message = %v.message, "policy violation");
            }
            tracing::warn!(?origin, error = %e, "policy publish rejected");
            return Err(e);
        }
    };
    tracing::info!(
        revision,
        version = snap.version(),
        content_hash = snap.content_hash(),
        ?origin,
        "policy published"
    );
    inner.history.push(record_of(&snap, origin));
    inner.active = Arc::clone(&snap);
    Ok(snap)
}

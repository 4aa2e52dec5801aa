//! Signed, append-only audit records.
//!
//! One record per decision. The signature is a domain-separated SHA-256 over the JSON
//! encoding of the record body, so any edit to a stored line is detectable with
//! [`AuditRecord::verify`].

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{AdvisoryNote, AuditError, InterventionNote, PolicySnapshot, SelectionDecision};

const SIGNATURE_DOMAIN: &[u8] = b"slotmux_audit_v1:";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditBody {
    pub policy_version: String,
    pub policy_revision: u64,
    pub policy_hash: String,
    pub window_id: String,
    pub slot_start: DateTime<Utc>,
    pub decided_at: DateTime<Utc>,
    pub seed: u64,
    pub temperature: f64,
    pub ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explored: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub advisory: Option<AdvisoryNote>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intervention: Option<InterventionNote>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    #[serde(flatten)]
    pub body: AuditBody,
    /// Hex SHA-256 of the body.
    pub signature: String,
}

fn sign(body: &AuditBody) -> Result<String, AuditError> {
    let bytes = serde_json::to_vec(body)?;
    let mut hasher = Sha256::new();
    hasher.update(SIGNATURE_DOMAIN);
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

impl AuditRecord {
    pub fn from_decision(
        decision: &SelectionDecision,
        policy: &PolicySnapshot,
    ) -> Result<Self, AuditError> {
        let body = AuditBody {
            policy_version: decision.policy_version().to_string(),
            policy_revision: decision.policy_revision(),
            policy_hash: policy.content_hash().to_string(),
            window_id: decision.window_id().to_string(),
            slot_start: decision.slot_start(),
            decided_at: decision.decided_at(),
            seed: decision.seed(),
            temperature: decision.temperature(),
            ids: decision.ids().into_iter().map(str::to_string).collect(),
            explored: decision.explored().map(str::to_string),
            advisory: decision.advisory().cloned(),
            intervention: decision.intervention().cloned(),
        };
        let signature = sign(&body)?;
        Ok(Self { body, signature })
    }

    /// `true` if the signature matches the body.
    pub fn verify(&self) -> bool {
        sign(&self.body).is_ok_and(|s| s == self.signature)
    }
}

/// Append-only destination for audit records.
pub trait AuditSink: Send + Sync {
    fn append(&self, record: &AuditRecord) -> Result<(), AuditError>;
}

/// One JSON record per line, appended to a file.
#[derive(Debug)]
pub struct JsonlAuditLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonlAuditLog {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AuditError> {
        let path = path.as_ref().to_path_buf();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every record back, in append order.
    pub fn read_all(path: impl AsRef<Path>) -> Result<Vec<AuditRecord>, AuditError> {
        let reader = BufReader::new(File::open(path)?);
        let mut out = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            out.push(serde_json::from_str(&line)?);
        }
        Ok(out)
    }
}

impl AuditSink for JsonlAuditLog {
    fn append(&self, record: &AuditRecord) -> Result<(), AuditError> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        file.write_all(line.as_bytes())?;
        file.flush()?;
        Ok(())
    }
}

/// In-memory sink for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryAuditLog {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl AuditSink for MemoryAuditLog {
    fn append(&self, record: &AuditRecord) -> Result<(), AuditError> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record.clone());
        Ok(())
    }
}

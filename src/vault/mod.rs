//! Credential vault.
//!
//! Persists each agent's credential material to a primary file and mirrors it
//! into the durable store. Writes go through a temp file that is re-read and
//! validated before an atomic rename, so the primary file only ever holds
//! material that passed integrity validation.
//!
//! ```text
//! <root>/<agent_id>/creds.json      primary
//! <root>/<agent_id>/.lock           cross-process lock (fs4)
//! <root>/<agent_id>/backups/*.json  timestamped snapshots
//! database agent_credentials        mirror
//! ```

mod backup;
mod material;

#[cfg(test)]
pub(crate) use material::fixtures;
pub use material::{CredentialMaterial, DeviceIdentity, KEY_LEN, KeyPair, SIGNATURE_LEN, SignedKeyPair};

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use fs4::FileExt;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::config::VaultConfig;
use crate::db::Database;
use crate::error::{IntegrityError, VaultError};

const PRIMARY_FILE: &str = "creds.json";
const LOCK_FILE: &str = ".lock";
const LOCK_RETRY: Duration = Duration::from_millis(25);

/// Result of a save request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveOutcome {
    /// Primary written; `mirrored` is false when the mirror write failed.
    Persisted { mirrored: bool },
    /// Material failed validation and nothing was written.
    Rejected(IntegrityError),
}

/// Verdict of [`CredentialVault::validate_freshness`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Freshness {
    Valid,
    Invalid(String),
}

impl Freshness {
    pub fn is_valid(&self) -> bool {
        matches!(self, Freshness::Valid)
    }
}

/// Validating, atomically-writing credential store.
pub struct CredentialVault {
    config: VaultConfig,
    db: Arc<dyn Database>,
    /// Single-writer lock per agent.
    write_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl CredentialVault {
    pub fn new(config: VaultConfig, db: Arc<dyn Database>) -> Self {
        Self {
            config,
            db,
            write_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &VaultConfig {
        &self.config
    }

    /// Directory holding an agent's files.
    pub fn agent_dir(&self, agent_id: &str) -> Result<PathBuf, VaultError> {
        validate_agent_id(agent_id)?;
        Ok(self.config.root.join(agent_id))
    }

    /// Path of the primary credential file.
    pub fn primary_path(&self, agent_id: &str) -> Result<PathBuf, VaultError> {
        Ok(self.agent_dir(agent_id)?.join(PRIMARY_FILE))
    }

    async fn write_lock(&self, agent_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.write_locks.lock().await;
        Arc::clone(
            locks
                .entry(agent_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    /// Validate and persist credential material.
    ///
    /// Invalid material is logged and dropped; the previously persisted state
    /// is left untouched.
    pub async fn save(
        &self,
        agent_id: &str,
        material: &CredentialMaterial,
    ) -> Result<SaveOutcome, VaultError> {
        if let Err(reason) = material.validate() {
            tracing::warn!(agent_id = %agent_id, %reason, "Refusing to persist invalid credential material");
            return Ok(SaveOutcome::Rejected(reason));
        }

        let dir = self.agent_dir(agent_id)?;
        let lock = self.write_lock(agent_id).await;
        let _writer = lock.lock().await;

        tokio::fs::create_dir_all(&dir).await?;
        let payload = serde_json::to_string_pretty(material)?;

        let tmp = dir.join(format!("{}.{}.tmp", PRIMARY_FILE, Uuid::new_v4()));
        if let Err(e) = write_verified(&tmp, &payload, material).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(match e {
                VerifyError::Io(e) => VaultError::Io(e),
                VerifyError::Mismatch(reason) => VaultError::Corrupted {
                    agent_id: agent_id.to_string(),
                    reason,
                },
            });
        }

        let file_lock = match lock_file(&dir, true, self.config.lock_timeout).await {
            Ok(guard) => guard,
            Err(e) => {
                let _ = tokio::fs::remove_file(&tmp).await;
                return Err(match e {
                    LockError::Timeout => VaultError::LockTimeout {
                        agent_id: agent_id.to_string(),
                    },
                    LockError::Io(e) => VaultError::Io(e),
                });
            }
        };

        tokio::fs::rename(&tmp, dir.join(PRIMARY_FILE)).await?;

        let mirrored = match self.db.save_credential_mirror(agent_id, &payload).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(agent_id = %agent_id, "Credential mirror write failed: {}", e);
                false
            }
        };
        drop(file_lock);

        tracing::debug!(agent_id = %agent_id, mirrored, "Credential material persisted");
        Ok(SaveOutcome::Persisted { mirrored })
    }

    /// Load credential material for an agent.
    ///
    /// Falls back to the mirror when the primary file is absent, unless the
    /// durable lifecycle status forbids reuse (conflict or disconnected).
    pub async fn load(&self, agent_id: &str) -> Result<Option<CredentialMaterial>, VaultError> {
        let dir = self.agent_dir(agent_id)?;
        let primary = dir.join(PRIMARY_FILE);

        if tokio::fs::try_exists(&primary).await? {
            let raw = {
                let _shared = lock_file(&dir, false, self.config.lock_timeout)
                    .await
                    .map_err(|e| match e {
                        LockError::Timeout => VaultError::LockTimeout {
                            agent_id: agent_id.to_string(),
                        },
                        LockError::Io(e) => VaultError::Io(e),
                    })?;
                tokio::fs::read_to_string(&primary).await?
            };
            return parse_material(agent_id, &raw).map(Some);
        }

        if let Some(record) = self.db.get_session_record(agent_id).await? {
            if !record.status.allows_credential_reuse() {
                tracing::info!(
                    agent_id = %agent_id,
                    status = %record.status,
                    "No primary credentials and lifecycle forbids mirror restore"
                );
                return Ok(None);
            }
        }

        let Some(payload) = self.db.load_credential_mirror(agent_id).await? else {
            return Ok(None);
        };

        let material = match parse_material(agent_id, &payload) {
            Ok(material) => material,
            Err(e) => {
                tracing::warn!(agent_id = %agent_id, "Ignoring unusable credential mirror: {}", e);
                return Ok(None);
            }
        };

        tracing::info!(agent_id = %agent_id, "Restoring primary credentials from mirror");
        self.save(agent_id, &material).await?;
        Ok(Some(material))
    }

    /// Decide whether loaded material may be used to resume a session.
    ///
    /// A lifecycle lookup that errors or exceeds the configured timeout is
    /// treated as invalid.
    pub async fn validate_freshness(
        &self,
        agent_id: &str,
        material: &CredentialMaterial,
    ) -> Freshness {
        let lookup = tokio::time::timeout(
            self.config.freshness_timeout,
            self.db.get_session_record(agent_id),
        )
        .await;

        match lookup {
            Err(_) => {
                tracing::warn!(agent_id = %agent_id, "Lifecycle lookup timed out during freshness check");
                return Freshness::Invalid("lifecycle lookup timed out".to_string());
            }
            Ok(Err(e)) => {
                return Freshness::Invalid(format!("lifecycle lookup failed: {}", e));
            }
            Ok(Ok(Some(record))) if !record.status.allows_credential_reuse() => {
                return Freshness::Invalid(format!("lifecycle status is {}", record.status));
            }
            Ok(Ok(_)) => {}
        }

        if !material.is_bound() {
            return Freshness::Invalid("no bound device identity".to_string());
        }
        Freshness::Valid
    }

    /// Whether a primary credential file exists.
    pub async fn exists(&self, agent_id: &str) -> Result<bool, VaultError> {
        Ok(tokio::fs::try_exists(self.primary_path(agent_id)?).await?)
    }

    /// Remove the agent's credential material from the primary file, its
    /// snapshots and the mirror.
    pub async fn delete(&self, agent_id: &str) -> Result<(), VaultError> {
        let dir = self.agent_dir(agent_id)?;
        let lock = self.write_lock(agent_id).await;
        let _writer = lock.lock().await;

        if tokio::fs::try_exists(&dir).await? {
            let _file_lock = lock_file(&dir, true, self.config.lock_timeout)
                .await
                .map_err(|e| match e {
                    LockError::Timeout => VaultError::LockTimeout {
                        agent_id: agent_id.to_string(),
                    },
                    LockError::Io(e) => VaultError::Io(e),
                })?;
            remove_if_exists(&dir.join(PRIMARY_FILE)).await?;
            match tokio::fs::remove_dir_all(dir.join(backup::BACKUP_DIR)).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        self.db.delete_credential_mirror(agent_id).await?;
        tracing::info!(agent_id = %agent_id, "Credential material deleted");
        Ok(())
    }
}

fn validate_agent_id(agent_id: &str) -> Result<(), VaultError> {
    let valid = !agent_id.is_empty()
        && agent_id.len() <= 128
        && !agent_id.starts_with('.')
        && agent_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(VaultError::InvalidAgentId(agent_id.to_string()))
    }
}

fn parse_material(agent_id: &str, raw: &str) -> Result<CredentialMaterial, VaultError> {
    let material: CredentialMaterial =
        serde_json::from_str(raw).map_err(|e| VaultError::Corrupted {
            agent_id: agent_id.to_string(),
            reason: e.to_string(),
        })?;
    material.validate().map_err(|e| VaultError::Corrupted {
        agent_id: agent_id.to_string(),
        reason: e.to_string(),
    })?;
    Ok(material)
}

async fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

enum VerifyError {
    Io(std::io::Error),
    Mismatch(String),
}

/// Write `payload` to `path`, flush it to disk, and confirm it reads back as
/// the same valid material.
async fn write_verified(
    path: &Path,
    payload: &str,
    expected: &CredentialMaterial,
) -> Result<(), VerifyError> {
    let mut file = tokio::fs::File::create(path).await.map_err(VerifyError::Io)?;
    file.write_all(payload.as_bytes())
        .await
        .map_err(VerifyError::Io)?;
    file.sync_all().await.map_err(VerifyError::Io)?;
    drop(file);

    let reread = tokio::fs::read_to_string(path)
        .await
        .map_err(VerifyError::Io)?;
    let parsed: CredentialMaterial = serde_json::from_str(&reread)
        .map_err(|e| VerifyError::Mismatch(format!("temp file unreadable: {}", e)))?;
    if parsed != *expected {
        return Err(VerifyError::Mismatch(
            "temp file did not round-trip".to_string(),
        ));
    }
    parsed
        .validate()
        .map_err(|e| VerifyError::Mismatch(e.to_string()))
}

enum LockError {
    Timeout,
    Io(std::io::Error),
}

/// Held advisory lock on an agent directory's lock file.
struct FileLockGuard {
    file: std::fs::File,
}

impl Drop for FileLockGuard {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

async fn lock_file(dir: &Path, exclusive: bool, timeout: Duration) -> Result<FileLockGuard, LockError> {
    tokio::fs::create_dir_all(dir).await.map_err(LockError::Io)?;
    let file = tokio::fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(dir.join(LOCK_FILE))
        .await
        .map_err(LockError::Io)?
        .into_std()
        .await;

    let deadline = Instant::now() + timeout;
    loop {
        let attempt = if exclusive {
            FileExt::try_lock_exclusive(&file)
        } else {
            FileExt::try_lock_shared(&file)
        };
        if attempt.is_ok() {
            return Ok(FileLockGuard { file });
        }
        if Instant::now() >= deadline {
            return Err(LockError::Timeout);
        }
        tokio::time::sleep(LOCK_RETRY).await;
    }
}

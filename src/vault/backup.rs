//! Timestamped snapshots of the primary credential file.

use std::path::PathBuf;

use chrono::Utc;

use super::{CredentialVault, SaveOutcome, parse_material};
use crate::error::VaultError;

pub(super) const BACKUP_DIR: &str = "backups";
const BACKUP_PREFIX: &str = "creds-";
const BACKUP_SUFFIX: &str = ".json";

impl CredentialVault {
    /// Copy the current primary file into a timestamped snapshot and prune
    /// snapshots beyond the retention count.
    ///
    /// Returns `None` when there is nothing valid to snapshot.
    pub async fn snapshot(&self, agent_id: &str) -> Result<Option<PathBuf>, VaultError> {
        let dir = self.agent_dir(agent_id)?;
        let primary = dir.join(super::PRIMARY_FILE);

        let raw = match tokio::fs::read_to_string(&primary).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if let Err(e) = parse_material(agent_id, &raw) {
            tracing::warn!(agent_id = %agent_id, "Skipping backup of invalid primary: {}", e);
            return Ok(None);
        }

        let backups = dir.join(BACKUP_DIR);
        tokio::fs::create_dir_all(&backups).await?;
        let name = format!(
            "{}{}{}",
            BACKUP_PREFIX,
            Utc::now().format("%Y%m%dT%H%M%S%.9fZ"),
            BACKUP_SUFFIX
        );
        let path = backups.join(name);
        tokio::fs::write(&path, raw.as_bytes()).await?;

        let pruned = self.prune_backups(agent_id).await?;
        tracing::debug!(agent_id = %agent_id, path = %path.display(), pruned, "Credential snapshot written");
        Ok(Some(path))
    }

    /// Snapshot paths, newest first.
    pub async fn list_backups(&self, agent_id: &str) -> Result<Vec<PathBuf>, VaultError> {
        let backups = self.agent_dir(agent_id)?.join(BACKUP_DIR);
        let mut entries = match tokio::fs::read_dir(&backups).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut found = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with(BACKUP_PREFIX) && name.ends_with(BACKUP_SUFFIX) {
                found.push(entry.path());
            }
        }
        // Timestamp format sorts lexicographically.
        found.sort();
        found.reverse();
        Ok(found)
    }

    async fn prune_backups(&self, agent_id: &str) -> Result<usize, VaultError> {
        let backups = self.list_backups(agent_id).await?;
        let mut removed = 0;
        for stale in backups.iter().skip(self.config.backup_retain) {
            tokio::fs::remove_file(stale).await?;
            removed += 1;
        }
        Ok(removed)
    }

    /// Restore the newest snapshot that passes validation through the normal
    /// save path. Returns the restored snapshot path.
    pub async fn restore_latest_backup(
        &self,
        agent_id: &str,
    ) -> Result<Option<PathBuf>, VaultError> {
        for path in self.list_backups(agent_id).await? {
            let raw = tokio::fs::read_to_string(&path).await?;
            let material = match parse_material(agent_id, &raw) {
                Ok(material) => material,
                Err(e) => {
                    tracing::warn!(path = %path.display(), "Skipping unusable snapshot: {}", e);
                    continue;
                }
            };
            if let SaveOutcome::Persisted { .. } = self.save(agent_id, &material).await? {
                tracing::info!(agent_id = %agent_id, path = %path.display(), "Credentials restored from snapshot");
                return Ok(Some(path));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    use crate::config::VaultConfig;
    use crate::db::MemoryDatabase;
    use crate::vault::CredentialVault;
    use crate::vault::fixtures::sample_material;

    fn vault(dir: &TempDir, retain: usize) -> CredentialVault {
        let mut config = VaultConfig::default().with_root(dir.path());
        config.backup_retain = retain;
        CredentialVault::new(config, Arc::new(MemoryDatabase::new()))
    }

    #[tokio::test]
    async fn test_snapshot_without_primary_is_noop() {
        let dir = TempDir::new().unwrap();
        let vault = vault(&dir, 3);
        assert_eq!(vault.snapshot("A1").await.unwrap(), None);
        assert!(vault.list_backups("A1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_retention_keeps_newest() {
        let dir = TempDir::new().unwrap();
        let vault = vault(&dir, 3);
        vault
            .save("A1", &sample_material(Some("1@s.whatsapp.net")))
            .await
            .unwrap();

        let mut written = Vec::new();
        for _ in 0..5 {
            written.push(vault.snapshot("A1").await.unwrap().unwrap());
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }

        let kept = vault.list_backups("A1").await.unwrap();
        assert_eq!(kept.len(), 3);
        written.reverse();
        assert_eq!(kept, written[..3].to_vec());
    }

    #[tokio::test]
    async fn test_restore_latest_after_primary_loss() {
        let dir = TempDir::new().unwrap();
        let vault = vault(&dir, 3);
        let material = sample_material(Some("1@s.whatsapp.net"));
        vault.save("A1", &material).await.unwrap();
        vault.snapshot("A1").await.unwrap();

        tokio::fs::remove_file(vault.primary_path("A1").unwrap())
            .await
            .unwrap();
        assert!(!vault.exists("A1").await.unwrap());

        let restored = vault.restore_latest_backup("A1").await.unwrap();
        assert!(restored.is_some());
        assert_eq!(vault.load("A1").await.unwrap(), Some(material));
    }

    #[tokio::test]
    async fn test_restore_skips_corrupt_snapshot() {
        let dir = TempDir::new().unwrap();
        let vault = vault(&dir, 5);
        vault
            .save("A1", &sample_material(Some("1@s.whatsapp.net")))
            .await
            .unwrap();
        let good = vault.snapshot("A1").await.unwrap().unwrap();

        // A newer snapshot that fails validation.
        let bad = good
            .parent()
            .unwrap()
            .join("creds-29991231T235959.000000000Z.json");
        tokio::fs::write(&bad, "{}").await.unwrap();

        assert_eq!(vault.restore_latest_backup("A1").await.unwrap(), Some(good));
    }
}

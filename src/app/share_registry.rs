use std::path::{Path, PathBuf};
use std::sync::RwLock;

use crate::core::models::Share;
use crate::core::{AppError, AppResult};
use crate::infrastructure::config::ShareConfig;
use crate::infrastructure::protocol::code;

/// Ordered table of local shares keyed by stable share-id. Mutations are
/// serialized behind the write lock; readers get cloned snapshots.
#[derive(Debug, Default)]
pub struct ShareRegistry {
    inner: RwLock<Vec<Share>>,
}

fn lock_poisoned() -> AppError {
    AppError::new(code::INTERNAL_ERROR, "share registry lock poisoned")
}

fn canonical_or_absolute(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

fn derive_name(path: &Path) -> String {
    path.file_name()
        .map(|value| value.to_string_lossy().to_string())
        .unwrap_or_else(|| "share".to_string())
}

impl ShareRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed from persisted config entries, keeping their share-ids so
    /// identity survives restarts.
    pub fn from_config(entries: &[ShareConfig]) -> AppResult<Self> {
        let registry = Self::new();
        for entry in entries {
            registry.add(
                Path::new(&entry.path),
                entry.read_only,
                entry.share_id.clone(),
                entry.name.clone(),
            )?;
        }
        Ok(registry)
    }

    pub fn list(&self) -> Vec<Share> {
        self.inner
            .read()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    pub fn get(&self, share_id: &str) -> Option<Share> {
        self.inner
            .read()
            .ok()?
            .iter()
            .find(|share| share.share_id == share_id)
            .cloned()
    }

    /// Add or update a share. An explicit `share_id` updates that entry in
    /// place; otherwise a share with the same canonical path is updated
    /// and keeps its existing id; otherwise a new entry with a fresh
    /// random id is created.
    pub fn add(
        &self,
        path: &Path,
        read_only: bool,
        share_id: Option<String>,
        name: Option<String>,
    ) -> AppResult<Share> {
        let canonical = canonical_or_absolute(path);
        let mut guard = self.inner.write().map_err(|_| lock_poisoned())?;

        if let Some(id) = &share_id
            && let Some(existing) = guard.iter_mut().find(|share| share.share_id == *id)
        {
            existing.local_path = canonical;
            existing.read_only = read_only;
            if let Some(name) = name {
                existing.name = name;
            }
            return Ok(existing.clone());
        }

        if let Some(existing) = guard
            .iter_mut()
            .find(|share| canonical_or_absolute(&share.local_path) == canonical)
        {
            existing.read_only = read_only;
            existing.name = name.unwrap_or_else(|| derive_name(&canonical));
            existing.local_path = canonical;
            return Ok(existing.clone());
        }

        let share = Share {
            share_id: share_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            name: name.unwrap_or_else(|| derive_name(&canonical)),
            local_path: canonical,
            read_only,
        };
        guard.push(share.clone());
        Ok(share)
    }

    pub fn remove(&self, share_id: &str) -> bool {
        let Ok(mut guard) = self.inner.write() else {
            return false;
        };
        let before = guard.len();
        guard.retain(|share| share.share_id != share_id);
        guard.len() != before
    }

    pub fn toggle_read_only(&self, share_id: &str) -> bool {
        let Ok(mut guard) = self.inner.write() else {
            return false;
        };
        match guard.iter_mut().find(|share| share.share_id == share_id) {
            Some(share) => {
                share.read_only = !share.read_only;
                true
            }
            None => false,
        }
    }

    /// Snapshot in the shape the settings collaborator persists.
    pub fn to_config(&self) -> Vec<ShareConfig> {
        self.list()
            .into_iter()
            .map(|share| ShareConfig {
                share_id: Some(share.share_id),
                name: Some(share.name),
                path: share.local_path.to_string_lossy().to_string(),
                read_only: share.read_only,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn temp_dir(label: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("netshare-reg-{label}-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).expect("create temp dir");
        dir
    }

    #[test]
    fn explicit_id_should_be_preserved() {
        let dir = temp_dir("explicit");
        let registry = ShareRegistry::new();
        let share = registry
            .add(&dir, true, Some("keep-me".to_string()), None)
            .expect("add");
        assert_eq!(share.share_id, "keep-me");
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn same_canonical_path_should_update_in_place() {
        let dir = temp_dir("dedup");
        let registry = ShareRegistry::new();
        let first = registry.add(&dir, true, None, None).expect("first add");
        let second = registry
            .add(&dir, false, None, Some("renamed".to_string()))
            .expect("second add");

        assert_eq!(first.share_id, second.share_id);
        assert_eq!(second.name, "renamed");
        assert!(!second.read_only);
        assert_eq!(registry.list().len(), 1);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn remove_and_readd_should_mint_a_new_id() {
        let dir = temp_dir("readd");
        let registry = ShareRegistry::new();
        let first = registry.add(&dir, true, None, None).expect("first add");
        assert!(registry.remove(&first.share_id));
        let second = registry.add(&dir, true, None, None).expect("second add");
        assert_ne!(first.share_id, second.share_id);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn name_should_derive_from_final_path_component() {
        let base = temp_dir("named");
        let music = base.join("music");
        std::fs::create_dir_all(&music).expect("mkdir");
        let registry = ShareRegistry::new();
        let share = registry.add(&music, true, None, None).expect("add");
        assert_eq!(share.name, "music");
        let _ = std::fs::remove_dir_all(base);
    }

    #[test]
    fn toggle_should_flip_and_report_misses() {
        let dir = temp_dir("toggle");
        let registry = ShareRegistry::new();
        let share = registry.add(&dir, true, None, None).expect("add");
        assert!(registry.toggle_read_only(&share.share_id));
        assert!(!registry.get(&share.share_id).expect("share").read_only);
        assert!(!registry.toggle_read_only("missing"));
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn config_roundtrip_should_keep_identity() {
        let dir = temp_dir("roundtrip");
        let registry = ShareRegistry::new();
        let share = registry.add(&dir, false, None, None).expect("add");

        let restored = ShareRegistry::from_config(&registry.to_config()).expect("restore");
        let restored_share = restored.get(&share.share_id).expect("share survives");
        assert_eq!(restored_share.local_path, share.local_path);
        assert!(!restored_share.read_only);
        let _ = std::fs::remove_dir_all(dir);
    }
}

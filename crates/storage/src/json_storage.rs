//! JSON file storage backend.
//!
//! Layout under the root directory:
//! - `states/<resource>.json` one instance state per resource
//! - `triggers/<group>.<job>.json` one trigger state per job
//! - `audit/templates/<name>.json`, `audit/aliases.json` and one
//!   `audit/<index>.jsonl` file per state log index

use super::{AuditSink, Result, StateStore, StorageError, TriggerState, TriggerStateStore};
use async_trait::async_trait;
use ilm_core::{AuditRecord, InstanceState, JobKey, ResourceId, StateLogSettings};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// File-based JSON storage backend.
pub struct JsonStore {
    root: PathBuf,
    audit_lock: Mutex<()>,
}

impl JsonStore {
    /// Open a store, creating its directories if needed.
    pub async fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();

        fs::create_dir_all(root.join("states")).await?;
        fs::create_dir_all(root.join("triggers")).await?;
        fs::create_dir_all(root.join("audit").join("templates")).await?;

        Ok(Self {
            root,
            audit_lock: Mutex::new(()),
        })
    }

    fn state_path(&self, id: &ResourceId) -> Result<PathBuf> {
        if !id.is_path_safe() {
            return Err(StorageError::InvalidKey(id.to_string()));
        }
        Ok(self.root.join("states").join(format!("{}.json", id)))
    }

    fn trigger_path(&self, job: &JobKey) -> Result<PathBuf> {
        check_segment(&job.group)?;
        check_segment(&job.name)?;
        Ok(self.root.join("triggers").join(format!("{}.{}.json", job.group, job.name)))
    }

    fn aliases_path(&self) -> PathBuf {
        self.root.join("audit").join("aliases.json")
    }

    fn index_path(&self, index: &str) -> Result<PathBuf> {
        check_segment(index)?;
        Ok(self.root.join("audit").join(format!("{}.jsonl", index)))
    }

    async fn read_aliases(&self) -> Result<BTreeMap<String, String>> {
        Ok(read_json(&self.aliases_path()).await?.unwrap_or_default())
    }
}

#[async_trait]
impl StateStore for JsonStore {
    async fn get_state(&self, id: &ResourceId) -> Result<Option<InstanceState>> {
        let path = self.state_path(id)?;
        match fs::read_to_string(&path).await {
            Ok(json) => Ok(Some(InstanceState::from_json(&json)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn put_state(&self, id: &ResourceId, state: &InstanceState) -> Result<()> {
        state.validate()?;
        let path = self.state_path(id)?;
        write_json(&path, state).await
    }

    async fn delete_state(&self, id: &ResourceId) -> Result<()> {
        remove_file(&self.state_path(id)?).await
    }

    async fn list_states(&self) -> Result<Vec<(ResourceId, InstanceState)>> {
        let mut states = Vec::new();
        let mut rd = fs::read_dir(self.root.join("states")).await?;
        while let Some(entry) = rd.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let json = fs::read_to_string(&path).await?;
            match InstanceState::from_json(&json) {
                Ok(state) => states.push((ResourceId::new(stem), state)),
                Err(e) => tracing::warn!("Skipping invalid state file {}: {}", path.display(), e),
            }
        }
        states.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(states)
    }
}

#[async_trait]
impl AuditSink for JsonStore {
    async fn provision(&self, layout: &StateLogSettings) -> Result<()> {
        let _guard = self.audit_lock.lock().await;

        let template = self
            .root
            .join("audit")
            .join("templates")
            .join(format!("{}.json", layout.index_template_name));
        check_segment(&layout.index_template_name)?;
        write_json(
            &template,
            &serde_json::json!({
                "index_patterns": [format!("{}-*", layout.index_name_prefix)],
                "aliases": [layout.alias_name],
            }),
        )
        .await?;

        let mut aliases = self.read_aliases().await?;
        let write_alias = layout.write_alias();
        if !aliases.contains_key(&write_alias) {
            let first = layout.first_index();
            let index = self.index_path(&first)?;
            fs::OpenOptions::new().create(true).append(true).open(&index).await?;
            aliases.insert(layout.alias_name.clone(), first.clone());
            aliases.insert(write_alias, first);
            write_json(&self.aliases_path(), &aliases).await?;
        }
        Ok(())
    }

    async fn append(&self, write_alias: &str, record: &AuditRecord) -> Result<()> {
        let _guard = self.audit_lock.lock().await;
        let aliases = self.read_aliases().await?;
        let index = aliases
            .get(write_alias)
            .ok_or_else(|| StorageError::NotFound(format!("alias {}", write_alias)))?;

        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        let mut file = fs::OpenOptions::new()
            .append(true)
            .open(self.index_path(index)?)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn tail(&self, alias: &str, limit: usize) -> Result<Vec<AuditRecord>> {
        let aliases = self.read_aliases().await?;
        let index = aliases
            .get(alias)
            .ok_or_else(|| StorageError::NotFound(format!("alias {}", alias)))?;
        let content = fs::read_to_string(self.index_path(index)?).await?;

        let mut records = Vec::new();
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            records.push(serde_json::from_str::<AuditRecord>(line)?);
        }
        let skip = records.len().saturating_sub(limit);
        Ok(records.split_off(skip))
    }
}

#[async_trait]
impl TriggerStateStore for JsonStore {
    async fn get_trigger(&self, job: &JobKey) -> Result<Option<TriggerState>> {
        read_json(&self.trigger_path(job)?).await
    }

    async fn put_trigger(&self, state: &TriggerState) -> Result<()> {
        write_json(&self.trigger_path(&state.job)?, state).await
    }

    async fn delete_trigger(&self, job: &JobKey) -> Result<()> {
        remove_file(&self.trigger_path(job)?).await
    }

    async fn list_triggers(&self) -> Result<Vec<TriggerState>> {
        list_dir(&self.root.join("triggers")).await
    }
}

fn check_segment(segment: &str) -> Result<()> {
    if ResourceId::new(segment).is_path_safe() {
        Ok(())
    } else {
        Err(StorageError::InvalidKey(segment.to_string()))
    }
}

/// Write through a temporary file so readers never see a partial document.
async fn write_json<T: serde::Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json.as_bytes()).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}

async fn remove_file(path: &Path) -> Result<()> {
    fs::remove_file(path).await.or_else(|e| {
        if e.kind() == std::io::ErrorKind::NotFound { Ok(()) } else { Err(e) }
    })?;
    Ok(())
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match fs::read_to_string(path).await {
        Ok(json) => {
            let value = serde_json::from_str(&json)?;
            Ok(Some(value))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn list_dir<T: serde::de::DeserializeOwned>(dir: &Path) -> Result<Vec<T>> {
    let mut items = Vec::new();
    let mut rd = fs::read_dir(dir).await?;
    while let Some(entry) = rd.next_entry().await? {
        if entry.path().extension().and_then(|s| s.to_str()) != Some("json") {
            continue;
        }
        if let Ok(Some(item)) = read_json(&entry.path()).await {
            items.push(item);
        }
    }
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ilm_core::{InstanceStatus, TriggerKey};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_states_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let id = ResourceId::new("logs-000001");
        let mut state = InstanceState::new("hot");
        state.status = InstanceStatus::Waiting;
        state.current_step = "rollover".to_string();

        {
            let store = JsonStore::new(dir.path()).await.unwrap();
            store.put_state(&id, &state).await.unwrap();
        }

        let store = JsonStore::new(dir.path()).await.unwrap();
        assert_eq!(store.get_state(&id).await.unwrap(), Some(state.clone()));
        assert_eq!(store.list_states().await.unwrap(), vec![(id.clone(), state)]);

        store.delete_state(&id).await.unwrap();
        assert!(store.get_state(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rejects_unsafe_ids() {
        let dir = TempDir::new().unwrap();
        let store = JsonStore::new(dir.path()).await.unwrap();
        let result = store
            .put_state(&ResourceId::new("../escape"), &InstanceState::new("hot"))
            .await;
        assert!(matches!(result, Err(StorageError::InvalidKey(_))));
    }

    #[tokio::test]
    async fn test_invalid_state_file_is_reported() {
        let dir = TempDir::new().unwrap();
        let store = JsonStore::new(dir.path()).await.unwrap();
        std::fs::write(
            dir.path().join("states").join("broken.json"),
            r#"{"policy_name":"","status":"WAITING","current_step":"a"}"#,
        )
        .unwrap();

        let result = store.get_state(&ResourceId::new("broken")).await;
        assert!(matches!(result, Err(StorageError::InvalidState(_))));
        assert!(store.list_states().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_audit_log_files() {
        let dir = TempDir::new().unwrap();
        let store = JsonStore::new(dir.path()).await.unwrap();
        let layout = StateLogSettings::default();

        store.provision(&layout).await.unwrap();
        assert!(dir.path().join("audit").join(".ilm_state_log-000001.jsonl").exists());

        for name in ["a", "b", "c"] {
            let record = AuditRecord::new(ResourceId::new(name), InstanceState::new("hot"));
            store.append(&layout.write_alias(), &record).await.unwrap();
        }

        let tail = store.tail(&layout.alias_name, 2).await.unwrap();
        let ids: Vec<_> = tail.iter().map(|r| r.resource_id.as_str().to_string()).collect();
        assert_eq!(ids, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn test_trigger_states() {
        let dir = TempDir::new().unwrap();
        let store = JsonStore::new(dir.path()).await.unwrap();
        let job = JobKey::new("logs-1", "ilm");
        let state = TriggerState {
            job: job.clone(),
            trigger: TriggerKey::unique(&job),
            period_ms: 1000,
            previous_fire_time: None,
            next_fire_time: chrono::Utc::now(),
        };

        store.put_trigger(&state).await.unwrap();
        assert_eq!(store.get_trigger(&job).await.unwrap(), Some(state));
        assert_eq!(store.list_triggers().await.unwrap().len(), 1);

        store.delete_trigger(&job).await.unwrap();
        assert!(store.get_trigger(&job).await.unwrap().is_none());
    }
}

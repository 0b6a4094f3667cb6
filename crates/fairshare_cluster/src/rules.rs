//! Resource rule and lock store.
//!
//! Rules (`<name>.rules`) and resolved resources (`<name>.rsrc`) are flat
//! JSON files rewritten on every change. Locks live in memory only: a lock
//! marks one process as the builder of a `(host, key)` artifact until it
//! releases the rule or deregisters.

use crate::api::{LockSummary, ResourceRule, ResourceStatus, RuleGrant};
use fairshare_core::{CoreError, CoreResult, ProcessorId};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Resolved resources, host -> key -> path
pub type ResourceTable = BTreeMap<String, BTreeMap<String, String>>;

/// Rule, resource and lock tables
#[derive(Debug, Default)]
pub struct RuleStore {
    /// Where rules are persisted
    rules_path: Option<PathBuf>,
    /// Where resolved resources are persisted
    resources_path: Option<PathBuf>,
    /// Build specifications by key
    rules: BTreeMap<String, ResourceRule>,
    /// Materialized artifacts
    resources: ResourceTable,
    /// (host, key) -> pid of the builder
    locks: HashMap<(String, String), u32>,
}

impl RuleStore {
    /// Create a store that is never written to disk
    #[must_use]
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Open a persistent store, loading existing tables
    ///
    /// # Errors
    ///
    /// Returns error if an existing file cannot be read or decoded
    pub fn open(rules_path: PathBuf, resources_path: PathBuf) -> CoreResult<Self> {
        let rules = load_table(&rules_path)?;
        let resources = load_table(&resources_path)?;
        Ok(Self {
            rules_path: Some(rules_path),
            resources_path: Some(resources_path),
            rules,
            resources,
            locks: HashMap::new(),
        })
    }

    /// Look up a resource on a host
    #[must_use]
    pub fn get_resource(&self, host: &str, key: &str) -> ResourceStatus {
        if let Some(path) = self.resources.get(host).and_then(|r| r.get(key)) {
            return ResourceStatus::Ready { path: path.clone() };
        }
        if self.locks.contains_key(&lock_key(host, key)) {
            ResourceStatus::Wait
        } else {
            ResourceStatus::NeedsBuild
        }
    }

    /// Lock a rule for the processor's host
    #[must_use]
    pub fn acquire(&mut self, processor: &ProcessorId, key: &str) -> RuleGrant {
        let Some(rule) = self.rules.get(key) else {
            warn!(%processor, key, "no rule for resource");
            return RuleGrant::NotFound;
        };
        let lock = lock_key(&processor.host, key);
        if let Some(holder) = self.locks.get(&lock) {
            debug!(%processor, key, holder, "rule locked by another builder");
            return RuleGrant::Wait;
        }
        self.locks.insert(lock, processor.pid);
        info!(%processor, key, "rule locked for build");
        RuleGrant::Granted { rule: rule.clone() }
    }

    /// Release a rule held by the processor, recording the path on success
    ///
    /// Returns `false` without changing anything when the processor does not
    /// hold the lock.
    ///
    /// # Errors
    ///
    /// Returns error if the resource table cannot be written
    pub fn release(
        &mut self,
        processor: &ProcessorId,
        key: &str,
        path: Option<String>,
    ) -> CoreResult<bool> {
        let lock = lock_key(&processor.host, key);
        match self.locks.get(&lock) {
            Some(&holder) if holder == processor.pid => {}
            Some(&holder) => {
                warn!(%processor, key, holder, "release by a process not holding the lock");
                return Ok(false);
            }
            None => {
                warn!(%processor, key, "release of an unlocked rule");
                return Ok(false);
            }
        }
        self.locks.remove(&lock);

        if let Some(path) = path {
            info!(%processor, key, %path, "resource resolved");
            self.resources
                .entry(processor.host.clone())
                .or_default()
                .insert(key.to_string(), path);
            self.persist_resources()?;
        } else {
            warn!(%processor, key, "rule released without a build result");
        }
        Ok(true)
    }

    /// Release every lock held by a processor
    pub fn release_orphans(&mut self, processor: &ProcessorId) -> usize {
        let before = self.locks.len();
        self.locks
            .retain(|(host, _), pid| !(host == &processor.host && *pid == processor.pid));
        let released = before - self.locks.len();
        if released > 0 {
            warn!(%processor, released, "released locks orphaned by departing processor");
        }
        released
    }

    /// Forcibly clear a lock
    pub fn del_lock(&mut self, host: &str, key: &str) -> bool {
        self.locks.remove(&lock_key(host, key)).is_some()
    }

    /// Define or replace a rule
    ///
    /// # Errors
    ///
    /// Returns error if the rule table cannot be written
    pub fn set_rule(&mut self, key: &str, rule: ResourceRule) -> CoreResult<()> {
        self.rules.insert(key.to_string(), rule);
        self.persist_rules()
    }

    /// Delete a rule
    ///
    /// # Errors
    ///
    /// Returns error if the rule table cannot be written
    pub fn del_rule(&mut self, key: &str) -> CoreResult<bool> {
        let removed = self.rules.remove(key).is_some();
        if removed {
            self.persist_rules()?;
        }
        Ok(removed)
    }

    /// Rules by key
    #[must_use]
    pub fn rules(&self) -> &BTreeMap<String, ResourceRule> {
        &self.rules
    }

    /// Resolved resources
    #[must_use]
    pub fn resources(&self) -> &ResourceTable {
        &self.resources
    }

    /// Held locks, sorted
    #[must_use]
    pub fn locks(&self) -> Vec<LockSummary> {
        let mut locks: Vec<_> = self
            .locks
            .iter()
            .map(|((host, key), pid)| LockSummary {
                host: host.clone(),
                key: key.clone(),
                pid: *pid,
            })
            .collect();
        locks.sort_by(|a, b| (&a.host, &a.key).cmp(&(&b.host, &b.key)));
        locks
    }

    fn persist_rules(&self) -> CoreResult<()> {
        match &self.rules_path {
            Some(path) => save_table(path, &self.rules),
            None => Ok(()),
        }
    }

    fn persist_resources(&self) -> CoreResult<()> {
        match &self.resources_path {
            Some(path) => save_table(path, &self.resources),
            None => Ok(()),
        }
    }
}

fn lock_key(host: &str, key: &str) -> (String, String) {
    (host.to_string(), key.to_string())
}

fn load_table<T: DeserializeOwned + Default>(path: &Path) -> CoreResult<T> {
    match std::fs::read(path) {
        Ok(bytes) if bytes.is_empty() => Ok(T::default()),
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
        Err(err) => Err(CoreError::io(path, &err)),
    }
}

fn save_table<T: Serialize>(path: &Path, table: &T) -> CoreResult<()> {
    let bytes = serde_json::to_vec_pretty(table)?;
    let tmp = temp_path(path);
    std::fs::write(&tmp, bytes).map_err(|err| CoreError::io(&tmp, &err))?;
    std::fs::rename(&tmp, path).map_err(|err| CoreError::io(path, &err))
}

// Sibling tables share a stem, so the temp name keeps the full file name
fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

//! Engine settings.
//!
//! Static settings are fixed at node start. Dynamic settings can change at
//! runtime; every change publishes the set of keys that changed so that the
//! drivers can react (reschedule, suspend, re-distribute).

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};

/// State log (audit) settings fixed at start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateLogSettings {
    /// Whether the state log exists at all
    pub enabled: bool,
    /// Name of the index template
    pub index_template_name: String,
    /// Prefix of the rolled indices
    pub index_name_prefix: String,
    /// Read alias (the write alias is `<alias>-write`)
    pub alias_name: String,
}

impl Default for StateLogSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            index_template_name: ".ilm_state_log".to_string(),
            index_name_prefix: ".ilm_state_log".to_string(),
            alias_name: ".ilm_state_log".to_string(),
        }
    }
}

impl StateLogSettings {
    /// Name of the write alias.
    pub fn write_alias(&self) -> String {
        format!("{}-write", self.alias_name)
    }

    /// Name of the first rolled index.
    pub fn first_index(&self) -> String {
        format!("{}-000001", self.index_name_prefix)
    }
}

/// Settings fixed at node start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StaticSettings {
    /// Whether lifecycle management runs on this node
    pub enabled: bool,
    /// Number of ticks that may run concurrently
    pub thread_pool_size: usize,
    /// State log settings
    pub state_log: StateLogSettings,
}

impl Default for StaticSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            thread_pool_size: 4,
            state_log: StateLogSettings::default(),
        }
    }
}

/// Current values of the dynamic settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DynamicValues {
    /// Whether schedules are running
    pub active: bool,
    /// Period between two ticks of a resource
    pub execution_period_ms: u64,
    /// Fixed part of the initial delay
    pub execution_fixed_delay_ms: u64,
    /// Whether a random part in `[0, period)` is added to the initial delay
    pub execution_random_delay_enabled: bool,
    /// Whether state log records are written
    pub state_log_active: bool,
    /// Regex over node names restricting job distribution
    pub node_filter: Option<String>,
}

impl Default for DynamicValues {
    fn default() -> Self {
        Self {
            active: true,
            execution_period_ms: 300_000,
            execution_fixed_delay_ms: 0,
            execution_random_delay_enabled: true,
            state_log_active: true,
            node_filter: None,
        }
    }
}

impl DynamicValues {
    /// Tick period.
    pub fn execution_period(&self) -> Duration {
        Duration::from_millis(self.execution_period_ms.max(1))
    }

    /// Fixed part of the initial delay.
    pub fn fixed_delay(&self) -> Duration {
        Duration::from_millis(self.execution_fixed_delay_ms)
    }

    /// Keys whose value differs between `self` and `other`.
    pub fn diff(&self, other: &DynamicValues) -> Vec<DynamicSetting> {
        let mut changed = Vec::new();
        if self.active != other.active {
            changed.push(DynamicSetting::Active);
        }
        if self.execution_period_ms != other.execution_period_ms {
            changed.push(DynamicSetting::ExecutionPeriod);
        }
        if self.execution_fixed_delay_ms != other.execution_fixed_delay_ms {
            changed.push(DynamicSetting::FixedDelay);
        }
        if self.execution_random_delay_enabled != other.execution_random_delay_enabled {
            changed.push(DynamicSetting::RandomDelayEnabled);
        }
        if self.state_log_active != other.state_log_active {
            changed.push(DynamicSetting::StateLogActive);
        }
        if self.node_filter != other.node_filter {
            changed.push(DynamicSetting::NodeFilter);
        }
        changed
    }
}

/// A dynamic setting key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DynamicSetting {
    /// `active`
    Active,
    /// `execution_period_ms`
    ExecutionPeriod,
    /// `execution_fixed_delay_ms`
    FixedDelay,
    /// `execution_random_delay_enabled`
    RandomDelayEnabled,
    /// `state_log_active`
    StateLogActive,
    /// `node_filter`
    NodeFilter,
}

/// Runtime-updatable settings with change notification.
#[derive(Debug)]
pub struct DynamicSettings {
    values: watch::Sender<DynamicValues>,
    changes: broadcast::Sender<Vec<DynamicSetting>>,
}

impl DynamicSettings {
    /// Create dynamic settings with initial values.
    pub fn new(initial: DynamicValues) -> Self {
        let (values, _) = watch::channel(initial);
        let (changes, _) = broadcast::channel(64);
        Self { values, changes }
    }

    /// Snapshot of the current values.
    pub fn current(&self) -> DynamicValues {
        self.values.borrow().clone()
    }

    /// Apply an update and publish the keys that changed.
    pub fn update(&self, f: impl FnOnce(&mut DynamicValues)) -> Vec<DynamicSetting> {
        let before = self.current();
        let mut after = before.clone();
        f(&mut after);

        let changed = before.diff(&after);
        if changed.is_empty() {
            return changed;
        }

        self.values.send_replace(after);
        tracing::debug!("Dynamic settings changed: {:?}", changed);
        // No subscriber is not an error
        let _ = self.changes.send(changed.clone());
        changed
    }

    /// Subscribe to change sets.
    pub fn subscribe(&self) -> broadcast::Receiver<Vec<DynamicSetting>> {
        self.changes.subscribe()
    }
}

impl Default for DynamicSettings {
    fn default() -> Self {
        Self::new(DynamicValues::default())
    }
}

/// Static and dynamic settings of a node.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Static settings
    pub engine: StaticSettings,
    /// Dynamic settings
    pub dynamic: Arc<DynamicSettings>,
}

impl Settings {
    /// Create settings.
    pub fn new(engine: StaticSettings, dynamic: DynamicValues) -> Self {
        Self {
            engine,
            dynamic: Arc::new(DynamicSettings::new(dynamic)),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self::new(StaticSettings::default(), DynamicValues::default())
    }
}

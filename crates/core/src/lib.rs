//! ILM core data models.
//!
//! This crate defines the data structures shared by the lifecycle engine:
//! identifiers, the persisted policy instance state, the cluster topology
//! view the schedulers react to, and the engine settings.

#![warn(missing_docs)]

// Core identities
mod id;

// Persisted instance state
mod state;
mod audit;

// Cluster topology
mod cluster;

// Settings and configuration
mod settings;
mod config;

// Re-exports
pub use id::*;

pub use state::{
    InstanceState, InstanceStatus, StepState, ConditionState, ActionState, Failure,
    StateValidationError, NO_STEP, UNKNOWN_STEP,
};
pub use audit::AuditRecord;
pub use cluster::{ClusterState, ClusterChangedEvent, IndexMetadata, POLICY_NAME_SETTING};
pub use settings::{
    Settings, StaticSettings, StateLogSettings, DynamicValues, DynamicSettings, DynamicSetting,
};
pub use config::{IlmConfig, NodeConfig, StorageConfig, LoggingConfig, ConfigError};

/// Timestamp type
pub type Time = chrono::DateTime<chrono::Utc>;

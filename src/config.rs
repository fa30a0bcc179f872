//! Collection settings shared by the loaders and the evaluator.

use std::path::PathBuf;

/// Environment variable naming the directory that holds metric and event resources.
pub const RESOURCES_ENV: &str = "PMU_METRICS_RESOURCES";

/// What is being monitored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// All CPUs, all processes.
    System,
    /// One or more processes.
    Process,
    /// One or more cgroups.
    Cgroup,
}

impl Scope {
    /// Off-core and uncore counters can not be filtered by process or cgroup.
    #[inline]
    pub fn is_system_wide(self) -> bool {
        self == Scope::System
    }
}

/// Level at which counter values are aggregated into metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Granularity {
    /// Whole system.
    System,
    /// Per socket.
    Socket,
    /// Per logical CPU.
    Cpu,
}

/// Scope and granularity of one collection session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectionMode {
    /// Monitored target.
    pub scope: Scope,
    /// Aggregation level.
    pub granularity: Granularity,
}

impl Default for CollectionMode {
    fn default() -> Self {
        CollectionMode {
            scope: Scope::System,
            granularity: Granularity::System,
        }
    }
}

/// Options used to load a metric collection session.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// Directory containing the `metrics/` and `events/` resource trees.
    pub resource_root: PathBuf,
    /// Metric library to use instead of the platform resource.
    pub metric_override: Option<PathBuf>,
    /// Core event catalog to use instead of the platform resource.
    pub core_event_override: Option<PathBuf>,
    /// Uncore event catalog to use instead of the platform resource.
    pub uncore_event_override: Option<PathBuf>,
    /// Restrict the session to these metrics. Empty means all.
    pub selected_metrics: Vec<String>,
    /// Collection scope and granularity.
    pub mode: CollectionMode,
    /// Transactions per second supplied by the user, 0 when unknown.
    pub transaction_rate: f64,
}

impl LoaderConfig {
    /// Create a configuration reading resources from `resource_root`.
    pub fn new<P: Into<PathBuf>>(resource_root: P) -> Self {
        LoaderConfig {
            resource_root: resource_root.into(),
            metric_override: None,
            core_event_override: None,
            uncore_event_override: None,
            selected_metrics: vec![],
            mode: CollectionMode::default(),
            transaction_rate: 0.0,
        }
    }

    /// Create a configuration using the resource root named by `PMU_METRICS_RESOURCES`.
    pub fn from_env() -> crate::Result<Self> {
        let root = std::env::var(RESOURCES_ENV)?;
        Ok(LoaderConfig::new(root))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loader_config_defaults() {
        let config = LoaderConfig::new("/tmp/resources");
        assert_eq!(config.resource_root, PathBuf::from("/tmp/resources"));
        assert_eq!(config.mode.scope, Scope::System);
        assert_eq!(config.mode.granularity, Granularity::System);
        assert!(config.selected_metrics.is_empty());
        assert!(config.metric_override.is_none());
    }

    #[test]
    fn test_scope_system_wide() {
        assert!(Scope::System.is_system_wide());
        assert!(!Scope::Process.is_system_wide());
        assert!(!Scope::Cgroup.is_system_wide());
    }
}

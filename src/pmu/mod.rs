//! Utilities to allocate PMU events to counters and compute metrics from their values.

use crate::metadata::Metadata;
use crate::{Error, Result};
use derive_more::{From, Index, IntoIterator};
use log::debug;
use std::path::{Path, PathBuf};

pub mod conditional;

mod events;
pub use events::{
    abbreviate_event_name, BaseEvent, CoreEvent, CoreEvents, Counters, EventCatalog, UncoreEvent,
    UncoreEvents, OTHER_EVENTS, PERF_METRICS_PREFIX, TOPDOWN_SLOTS,
};

mod groups;
pub use groups::{
    eliminate_duplicate_groups, expand_uncore_groups, merge_groups, remove_duplicate_uncore_events,
    CoreGroup, CounterGroup, UncoreGroup,
};

mod metrics;
pub use metrics::{MetricExpr, Rule, Value};

mod definitions;
pub use definitions::{
    configure_metrics, load_raw_metrics, parse_raw_metrics, variables_in, Constants, GroupSlot,
    LatencyStats, MetricDefinition, RawMetric, RetireLatencies, TRANSACTION_RATE,
};

mod frame;
pub use frame::{evaluate_frame, EventFrame, EventGroup, Metric, MetricFrame};

pub mod legacy;
pub mod loader;

/// One event as handed to the counter collector.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventDefinition {
    /// Event in `perf stat -e` syntax.
    pub raw: String,
    /// Name the collector reports the event's value under.
    pub name: String,
    /// Uncore device type, empty for core events.
    pub device: String,
}

/// Events collected together in one multiplexed pass.
///
/// Fixed-purpose counter events come first.
#[derive(Default, Debug, Clone, PartialEq, Index, IntoIterator, From)]
pub struct GroupDefinition {
    /// Events of the group.
    #[index]
    #[into_iterator(owned, ref)]
    pub events: Vec<EventDefinition>,
}

impl GroupDefinition {
    /// Number of events in the group.
    #[inline]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Check if the group holds no events.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Iterate over the events of the group.
    pub fn iter(&self) -> std::slice::Iter<'_, EventDefinition> {
        self.events.iter()
    }

    /// Render the group as a brace-delimited `perf stat -e` group.
    pub fn perf_string(&self) -> String {
        let raws: Vec<&str> = self.events.iter().map(|e| e.raw.as_str()).collect();
        format!("{{{}}}", raws.join(","))
    }
}

/// Resource files describing one platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourcePaths {
    /// Metric library.
    pub metrics: PathBuf,
    /// Core event catalog.
    pub core_events: PathBuf,
    /// Uncore event catalog, when the platform has one.
    pub uncore_events: Option<PathBuf>,
    /// Retire latency table, when the platform has one.
    pub retire_latencies: Option<PathBuf>,
}

/// JSON files in `dir` whose name starts with `stem`.
fn json_files_with_stem(dir: &Path, stem: &str) -> Result<Vec<PathBuf>> {
    let pattern = format!(
        "{}/{}*.json",
        glob::Pattern::escape(&dir.to_string_lossy()),
        glob::Pattern::escape(stem)
    );
    Ok(glob::glob(&pattern)?.filter_map(std::result::Result::ok).collect())
}

/// Pick `<stem>_<variant>.json` when `variant` is given and present, else `<stem>.json`.
fn pick_variant(files: &[PathBuf], stem: &str, variant: Option<&str>) -> Option<PathBuf> {
    let named = |name: String| files.iter().find(|f| f.file_name().map_or(false, |n| n == name.as_str()));
    variant
        .and_then(|v| named(format!("{}_{}.json", stem, v)))
        .or_else(|| named(format!("{}.json", stem)))
        .cloned()
}

impl ResourcePaths {
    /// Locate the resources of `metadata`'s platform under `root`.
    ///
    /// When fixed-counter topdown is not available the `_nofixedtma` variants are preferred.
    pub fn resolve(root: &Path, metadata: &Metadata) -> Result<Self> {
        let uarch = metadata.uarch_key();
        let variant = if metadata.supports_fixed_tma {
            None
        } else {
            Some("nofixedtma")
        };
        let metrics_dir = root
            .join("metrics")
            .join(&metadata.architecture)
            .join(&metadata.vendor);
        let events_dir = root
            .join("events")
            .join(&metadata.architecture)
            .join(&metadata.vendor);

        let metric_files = json_files_with_stem(&metrics_dir, &uarch)?;
        let metrics = pick_variant(&metric_files, &uarch, variant)
            .ok_or_else(|| Error::ResourceNotFound(metrics_dir.join(format!("{}.json", uarch))))?;
        let retire_latencies =
            pick_variant(&metric_files, &format!("{}_retire_latency", uarch), None);

        let event_files = json_files_with_stem(&events_dir, &uarch)?;
        let core_stem = format!("{}_core", uarch);
        let core_events = pick_variant(&event_files, &core_stem, variant)
            .ok_or_else(|| Error::ResourceNotFound(events_dir.join(format!("{}.json", core_stem))))?;
        let uncore_events = pick_variant(&event_files, &format!("{}_uncore", uarch), None);

        let paths = ResourcePaths {
            metrics,
            core_events,
            uncore_events,
            retire_latencies,
        };
        debug!("Resolved resources -- {:?}", paths);
        Ok(paths)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("pmu-metrics-{}-{}", name, std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    fn touch(path: &Path) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, "[]").unwrap();
    }

    #[test]
    fn test_resolve_resources() {
        let root = scratch_dir("resolve");
        let metrics = root.join("metrics/x86_64/GenuineIntel");
        let events = root.join("events/x86_64/GenuineIntel");
        touch(&metrics.join("spr.json"));
        touch(&metrics.join("spr_nofixedtma.json"));
        touch(&metrics.join("spr_retire_latency.json"));
        touch(&events.join("spr_core.json"));

        let mut md = Metadata::default();
        md.architecture = "x86_64".into();
        md.vendor = "GenuineIntel".into();
        md.microarchitecture = "SPR_XCC".into();
        md.supports_fixed_tma = true;

        let paths = ResourcePaths::resolve(&root, &md).unwrap();
        assert_eq!(paths.metrics, metrics.join("spr.json"));
        assert_eq!(paths.core_events, events.join("spr_core.json"));
        assert_eq!(paths.uncore_events, None);
        assert_eq!(
            paths.retire_latencies,
            Some(metrics.join("spr_retire_latency.json"))
        );

        md.supports_fixed_tma = false;
        let paths = ResourcePaths::resolve(&root, &md).unwrap();
        assert_eq!(paths.metrics, metrics.join("spr_nofixedtma.json"));
        // No variant of the core catalog, fall back to the default one.
        assert_eq!(paths.core_events, events.join("spr_core.json"));

        md.microarchitecture = "GNR".into();
        assert!(matches!(
            ResourcePaths::resolve(&root, &md),
            Err(Error::ResourceNotFound(_))
        ));
        fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn test_group_definition() {
        let def = GroupDefinition::from(vec![
            EventDefinition {
                raw: "instructions".into(),
                name: "INST_RETIRED.ANY".into(),
                device: String::new(),
            },
            EventDefinition {
                raw: "cpu-cycles".into(),
                name: "CPU_CLK_UNHALTED.THREAD".into(),
                device: String::new(),
            },
        ]);
        assert_eq!(def.len(), 2);
        assert_eq!(def[1].name, "CPU_CLK_UNHALTED.THREAD");
        assert_eq!(def.perf_string(), "{instructions,cpu-cycles}");
        let names: Vec<&str> = (&def).into_iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["INST_RETIRED.ANY", "CPU_CLK_UNHALTED.THREAD"]);
    }
}

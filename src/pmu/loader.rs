//! Assembly of a collection session.
//!
//! A session turns the platform's event catalogs and metric library into the counter groups
//! handed to the collector and the compiled metrics evaluated on every interval.

use crate::config::{CollectionMode, LoaderConfig};
use crate::metadata::Metadata;
use crate::pmu::{
    abbreviate_event_name, configure_metrics, eliminate_duplicate_groups, evaluate_frame,
    expand_uncore_groups, legacy, load_raw_metrics, merge_groups, remove_duplicate_uncore_events,
    variables_in, BaseEvent, Constants, CoreEvent, CoreEvents, CoreGroup, CounterGroup,
    EventDefinition, EventFrame, GroupDefinition, MetricDefinition, MetricFrame, RawMetric,
    ResourcePaths, RetireLatencies, UncoreEvent, UncoreEvents, UncoreGroup, OTHER_EVENTS,
};
use crate::Result;
use lazy_static::lazy_static;
use log::{debug, info, warn};
use regex::Regex;

lazy_static! {
    static ref OCR_MSR: Regex = Regex::new(r"(OCR\.[^\]]+):ocr_msr_val=([0-9a-fx]+)").unwrap();
}

/// Metric variables holding a retire latency rather than an event count.
const RETIRE_LATENCY_SUFFIX: &str = ":retire_latency";

/// Counter groups and compiled metrics of one collection session.
#[derive(Debug)]
pub struct Session {
    /// Groups to collect: core groups, then uncore groups, then other events.
    pub groups: Vec<GroupDefinition>,
    /// Metrics computable from the collected groups.
    pub metrics: Vec<MetricDefinition>,
    /// Events referenced by the metric library that can not be collected on the platform.
    pub uncollectable: Vec<String>,
    /// Mode the session was built for.
    pub mode: CollectionMode,
}

impl Session {
    /// Compute the session's metrics for one frame.
    pub fn evaluate(
        &self,
        frame: &EventFrame,
        previous_timestamp: f64,
        metadata: &Metadata,
    ) -> MetricFrame {
        evaluate_frame(
            &self.metrics,
            frame,
            previous_timestamp,
            metadata,
            self.mode.granularity,
        )
    }
}

/// Where the value of a metric variable comes from.
#[derive(Debug)]
enum Source {
    Core(CoreEvent),
    Uncore(UncoreEvent),
    Other(String),
    Uncollectable(String),
}

/// Look a metric variable up in the catalogs.
fn classify(
    var: &str,
    core: &CoreEvents,
    uncore: &UncoreEvents,
    metadata: &Metadata,
    mode: CollectionMode,
) -> Source {
    if var.ends_with(RETIRE_LATENCY_SUFFIX) {
        debug!("No retire latency for {}", var);
        return Source::Uncollectable(var.to_string());
    }
    if let Some(evt) = core.find_event_by_name(var) {
        if !evt.is_collectable(metadata, mode) {
            return Source::Uncollectable(evt.name.clone());
        }
        let mut evt = evt.clone();
        // Keep modifiers such as `:c1:e1` on the placed event.
        if var.contains(':') {
            evt.set_name(var.to_string());
        }
        return Source::Core(evt);
    }
    if let Some(evt) = uncore.find_event_by_name(var) {
        if !evt.is_collectable(metadata, mode) {
            return Source::Uncollectable(evt.name.clone());
        }
        return Source::Uncore(evt.clone());
    }
    if OTHER_EVENTS.contains(&var) {
        if !mode.scope.is_system_wide() {
            debug!("Event not supported outside system scope -- {}", var);
            return Source::Uncollectable(var.to_string());
        }
        if !metadata.perf_supported_events.contains(var) {
            debug!("Event not supported by perf -- {}", var);
            return Source::Uncollectable(var.to_string());
        }
        return Source::Other(var.to_string());
    }
    debug!("Event not found in core or uncore events -- {}", var);
    Source::Uncollectable(var.to_string())
}

/// Add `event` to `current`, starting a new group when it does not fit.
///
/// An event that does not fit in an empty group either is dropped.
fn place<G: CounterGroup>(
    groups: &mut Vec<G>,
    current: &mut G,
    fresh: &dyn Fn() -> G,
    event: G::Event,
    metric: &str,
) {
    let name = event.name().to_string();
    if let Err(e) = current.add_event(event.clone(), false) {
        debug!(
            "Creating additional group for metric {}, event {} -- {}",
            metric, name, e
        );
        let full = std::mem::replace(current, fresh());
        if !full.is_empty() {
            groups.push(full);
        }
        if let Err(e) = current.add_event(event, false) {
            warn!("Dropping event {} of metric {} -- {}", name, metric, e);
        }
    }
}

/// Groups built from the metric library, before reduction.
#[derive(Debug, Default)]
struct MetricGroups {
    core: Vec<CoreGroup>,
    uncore: Vec<UncoreGroup>,
    other: Vec<String>,
    uncollectable: Vec<String>,
}

fn push_unique(list: &mut Vec<String>, name: String) {
    if !list.contains(&name) {
        list.push(name);
    }
}

/// Build the groups each metric needs on its own.
///
/// Metrics using an uncollectable event get no groups.
fn groups_for_metrics(
    metrics: &[RawMetric],
    core: &CoreEvents,
    uncore: &UncoreEvents,
    constants: &Constants,
    metadata: &Metadata,
    mode: CollectionMode,
) -> MetricGroups {
    let mut out = MetricGroups::default();
    for metric in metrics {
        let expression = constants.substitute(&abbreviate_event_name(&metric.expression));
        let sources: Vec<Source> = variables_in(&expression)
            .iter()
            .map(|var| classify(var, core, uncore, metadata, mode))
            .collect();

        let mut collectable = true;
        for src in &sources {
            if let Source::Uncollectable(name) = src {
                push_unique(&mut out.uncollectable, name.clone());
                collectable = false;
            }
        }
        if !collectable {
            continue;
        }

        let new_core = || CoreGroup::for_metric(metadata, &metric.name);
        let new_uncore = || UncoreGroup::for_metric(metadata, &metric.name);
        let mut core_group = new_core();
        let mut uncore_group = new_uncore();
        for src in sources {
            match src {
                Source::Core(evt) => {
                    place(&mut out.core, &mut core_group, &new_core, evt, &metric.name)
                }
                Source::Uncore(evt) => {
                    place(&mut out.uncore, &mut uncore_group, &new_uncore, evt, &metric.name)
                }
                Source::Other(name) => push_unique(&mut out.other, name),
                Source::Uncollectable(_) => {}
            }
        }
        if !core_group.is_empty() {
            out.core.push(core_group);
        }
        if !uncore_group.is_empty() {
            out.uncore.push(uncore_group);
        }
    }
    out
}

/// Resource files of the session, with the configured overrides applied.
fn resource_paths(config: &LoaderConfig, metadata: &Metadata) -> Result<ResourcePaths> {
    if let (Some(metrics), Some(core)) = (&config.metric_override, &config.core_event_override) {
        return Ok(ResourcePaths {
            metrics: metrics.clone(),
            core_events: core.clone(),
            uncore_events: config.uncore_event_override.clone(),
            retire_latencies: None,
        });
    }
    let mut paths = ResourcePaths::resolve(&config.resource_root, metadata)?;
    if let Some(metrics) = &config.metric_override {
        paths.metrics = metrics.clone();
    }
    if let Some(core) = &config.core_event_override {
        paths.core_events = core.clone();
    }
    if let Some(uncore) = &config.uncore_event_override {
        paths.uncore_events = Some(uncore.clone());
    }
    Ok(paths)
}

/// Name the collector reports off-core events with an MSR value under.
fn customize_ocr_names(expression: &str) -> String {
    OCR_MSR.replace_all(expression, "${1}.${2}").into_owned()
}

/// Constants of the session, including retire latencies when the platform has them.
fn session_constants(
    paths: &ResourcePaths,
    config: &LoaderConfig,
    metadata: &Metadata,
) -> Result<Constants> {
    let constants = Constants::new(metadata, config.mode, config.transaction_rate);
    Ok(match &paths.retire_latencies {
        Some(path) => constants.with_retire_latencies(&RetireLatencies::from_path(path)?),
        None => constants,
    })
}

/// Load a session from the JSON event catalogs and metric library of the platform.
pub fn load(config: &LoaderConfig, metadata: &Metadata) -> Result<Session> {
    let paths = resource_paths(config, metadata)?;
    let raw_metrics = load_raw_metrics(&paths.metrics, &config.selected_metrics)?;
    let core = CoreEvents::from_path(&paths.core_events)?;
    let uncore = match &paths.uncore_events {
        Some(path) => UncoreEvents::from_path(path)?,
        None => UncoreEvents::new(vec![]),
    };
    let constants = session_constants(&paths, config, metadata)?;

    let built = groups_for_metrics(
        &raw_metrics,
        &core,
        &uncore,
        &constants,
        metadata,
        config.mode,
    );
    info!(
        "Number of core groups: {}, uncore groups: {}, other groups: {}",
        built.core.len(),
        built.uncore.len(),
        built.other.len()
    );

    let core_groups = merge_groups(eliminate_duplicate_groups(built.core));
    let uncore_groups = merge_groups(remove_duplicate_uncore_events(
        eliminate_duplicate_groups(built.uncore),
    ));
    let uncore_groups = expand_uncore_groups(&uncore_groups, metadata)?;
    info!(
        "Number of groups after reduction: core {}, uncore {}",
        core_groups.len(),
        uncore_groups.len()
    );

    let mut groups: Vec<GroupDefinition> = core_groups
        .iter()
        .map(CounterGroup::to_group_definition)
        .chain(uncore_groups.iter().map(CounterGroup::to_group_definition))
        .collect();
    groups.extend(built.other.into_iter().map(|name| {
        GroupDefinition::from(vec![EventDefinition {
            raw: name.clone(),
            name,
            device: String::new(),
        }])
    }));

    let raw_metrics: Vec<RawMetric> = raw_metrics
        .into_iter()
        .map(|mut m| {
            m.expression = customize_ocr_names(&m.expression);
            m
        })
        .collect();
    let metrics = configure_metrics(
        &raw_metrics,
        &built.uncollectable,
        &constants,
        config.transaction_rate,
    );

    Ok(Session {
        groups,
        metrics,
        uncollectable: built.uncollectable,
        mode: config.mode,
    })
}

/// Load a session whose groups come from a legacy event definition file.
///
/// The core event override, when set, names the definition file.
pub fn load_legacy(config: &LoaderConfig, metadata: &Metadata) -> Result<Session> {
    let events_path = match &config.core_event_override {
        Some(path) => path.clone(),
        None => legacy::resolve(&config.resource_root, metadata)?,
    };
    let metrics_path = match &config.metric_override {
        Some(path) => path.clone(),
        None => ResourcePaths::resolve(&config.resource_root, metadata)?.metrics,
    };

    let (groups, uncollectable) = legacy::load_event_groups(&events_path, metadata, config.mode)?;
    let raw_metrics = load_raw_metrics(&metrics_path, &config.selected_metrics)?;
    let constants = Constants::new(metadata, config.mode, config.transaction_rate);
    let metrics = configure_metrics(
        &raw_metrics,
        &uncollectable,
        &constants,
        config.transaction_rate,
    );
    info!(
        "Loaded {} groups and {} metrics from {:?}",
        groups.len(),
        metrics.len(),
        events_path
    );

    Ok(Session {
        groups,
        metrics,
        uncollectable,
        mode: config.mode,
    })
}

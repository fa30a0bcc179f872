use crate::config::Granularity;
use crate::metadata::Metadata;
use crate::pmu::{GroupSlot, MetricDefinition, Value};
use crate::{Error, Result};
use log::debug;
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Core C6 residency, reported once per physical core.
const C6_RESIDENCY: &str = "cstate_core/c6-residency/";

/// Values of one collected event group.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventGroup {
    /// Event name to counter delta over the interval. NaN when not counted.
    pub event_values: HashMap<String, f64>,
    /// Position of the group in the collector command.
    pub group_id: usize,
    /// Share of the interval the group was scheduled on the counters.
    pub percentage: f64,
}

/// Event groups collected at one timestamp for one scope.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventFrame {
    /// Collected groups, in collector order.
    pub event_groups: Vec<EventGroup>,
    /// Seconds since collection start.
    pub timestamp: f64,
    /// Socket label, when aggregated per socket.
    pub socket: String,
    /// CPU label, when aggregated per CPU.
    pub cpu: String,
    /// Cgroup label, when collecting per cgroup.
    pub cgroup: String,
}

/// A computed metric value.
#[derive(Debug, Clone, PartialEq)]
pub struct Metric {
    /// Name of the metric.
    pub name: String,
    /// Value of the metric, NaN when it could not be computed.
    pub value: f64,
}

/// Metrics computed from one `EventFrame`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricFrame {
    /// Metrics in definition order.
    pub metrics: Vec<Metric>,
    /// Seconds since collection start.
    pub timestamp: f64,
    /// Socket label.
    pub socket: String,
    /// CPU label.
    pub cpu: String,
    /// Cgroup label.
    pub cgroup: String,
}

impl MetricFrame {
    /// Value of the metric `name`.
    pub fn get(&self, name: &str) -> Option<f64> {
        self.metrics.iter().find(|m| m.name == name).map(|m| m.value)
    }

    /// Metric name to value.
    pub fn values(&self) -> HashMap<String, f64> {
        self.metrics
            .iter()
            .map(|m| (m.name.clone(), m.value))
            .collect()
    }

    /// Metrics of `definitions` whose threshold is exceeded in this frame.
    pub fn thresholds_exceeded(&self, definitions: &[MetricDefinition]) -> Vec<String> {
        let values = self.values();
        definitions
            .iter()
            .filter(|def| match def.threshold_exceeded(&values) {
                Ok(exceeded) => exceeded.unwrap_or(false),
                Err(e) => {
                    debug!("Failed to evaluate threshold of {} -- {}", def.name, e);
                    false
                }
            })
            .map(|def| def.name.clone())
            .collect()
    }
}

impl MetricDefinition {
    /// Assign every variable of the metric to the event group its value is read from.
    ///
    /// Groups are picked greedily by the number of still unassigned variables they hold a
    /// non-NaN value for; ties go to the lowest group index. The assignment is computed once and
    /// then reused, as is a failure to assign.
    pub fn load_best_groups(&self, frame: &EventFrame) -> Result<BTreeMap<String, usize>> {
        let mut vars = self.lock_variables();
        let failed: Vec<&str> = vars
            .iter()
            .filter(|(_, s)| **s == GroupSlot::Unresolvable)
            .map(|(k, _)| k.as_str())
            .collect();
        if !failed.is_empty() {
            return Err(Error::UnresolvedVariables {
                metric: self.name.clone(),
                variables: failed.join(", "),
            });
        }

        let mut remaining: BTreeSet<String> = vars
            .iter()
            .filter(|(_, s)| **s == GroupSlot::Unresolved)
            .map(|(k, _)| k.clone())
            .collect();
        while !remaining.is_empty() {
            let mut best: Option<(usize, Vec<String>)> = None;
            for (idx, group) in frame.event_groups.iter().enumerate() {
                let matched: Vec<String> = remaining
                    .iter()
                    .filter(|name| group.event_values.get(*name).map_or(false, |v| !v.is_nan()))
                    .cloned()
                    .collect();
                if matched.len() > best.as_ref().map_or(0, |(_, m)| m.len()) {
                    let complete = matched.len() == remaining.len();
                    best = Some((idx, matched));
                    if complete {
                        break;
                    }
                }
            }
            match best {
                Some((idx, matched)) => {
                    for name in matched {
                        remaining.remove(&name);
                        vars.insert(name, GroupSlot::Group(idx));
                    }
                }
                None => {
                    for name in remaining.iter() {
                        vars.insert(name.clone(), GroupSlot::Unresolvable);
                    }
                    return Err(Error::UnresolvedVariables {
                        metric: self.name.clone(),
                        variables: remaining.into_iter().collect::<Vec<_>>().join(", "),
                    });
                }
            }
        }

        Ok(vars
            .iter()
            .filter_map(|(k, s)| match s {
                GroupSlot::Group(idx) => Some((k.clone(), *idx)),
                _ => None,
            })
            .collect())
    }

    /// Per-second values of the metric's variables in `frame`.
    pub fn variable_values(
        &self,
        frame: &EventFrame,
        previous_timestamp: f64,
        metadata: &Metadata,
        granularity: Granularity,
    ) -> Result<HashMap<String, f64>> {
        let interval = frame.timestamp - previous_timestamp;
        let mut values = HashMap::new();
        for (name, idx) in self.load_best_groups(frame)? {
            let group = frame.event_groups.get(idx).ok_or(Error::GroupsChanged)?;
            let raw = *group
                .event_values
                .get(&name)
                .ok_or_else(|| Error::UnknownVariable(name.clone()))?;
            let mut value = raw / interval;
            // Residency is counted per core, so each hardware thread of the core sees all of it.
            if name == C6_RESIDENCY && metadata.hyperthreading_on() && granularity != Granularity::Cpu {
                value *= f64::from(metadata.threads_per_core);
            }
            values.insert(name, value);
        }
        Ok(values)
    }

    /// Compute the metric for `frame`, NaN on any failure.
    pub fn evaluate(
        &self,
        frame: &EventFrame,
        previous_timestamp: f64,
        metadata: &Metadata,
        granularity: Granularity,
    ) -> f64 {
        let result = self
            .variable_values(frame, previous_timestamp, metadata, granularity)
            .and_then(|vars| self.evaluable().eval(&vars))
            .and_then(Value::as_num);
        match result {
            Ok(value) => value,
            Err(e) => {
                debug!("Failed to evaluate metric {} -- {}", self.name, e);
                std::f64::NAN
            }
        }
    }
}

/// Compute every metric of `definitions` for `frame`.
pub fn evaluate_frame(
    definitions: &[MetricDefinition],
    frame: &EventFrame,
    previous_timestamp: f64,
    metadata: &Metadata,
    granularity: Granularity,
) -> MetricFrame {
    MetricFrame {
        metrics: definitions
            .iter()
            .map(|def| Metric {
                name: def.name.clone(),
                value: def.evaluate(frame, previous_timestamp, metadata, granularity),
            })
            .collect(),
        timestamp: frame.timestamp,
        socket: frame.socket.clone(),
        cpu: frame.cpu.clone(),
        cgroup: frame.cgroup.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pmu::{Constants, RawMetric};

    fn metric(name: &str, expression: &str) -> MetricDefinition {
        let raw = RawMetric {
            name: name.into(),
            expression: expression.into(),
            ..RawMetric::default()
        };
        MetricDefinition::compile(&raw, &Constants::default()).unwrap()
    }

    fn group(values: &[(&str, f64)]) -> EventGroup {
        EventGroup {
            event_values: values.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
            ..EventGroup::default()
        }
    }

    fn frame(timestamp: f64, groups: Vec<EventGroup>) -> EventFrame {
        EventFrame {
            event_groups: groups,
            timestamp,
            ..EventFrame::default()
        }
    }

    #[test]
    fn test_ipc() {
        let ipc = metric("metric_IPC", "[INST] / [CYC]");
        let md = Metadata::default();
        let f = frame(
            1.0,
            vec![group(&[("INST", 1_000_000.0)]), group(&[("CYC", 500_000.0)])],
        );
        let out = evaluate_frame(&[ipc], &f, 0.0, &md, Granularity::System);
        assert_eq!(out.metrics.len(), 1);
        assert_eq!(out.get("IPC"), Some(2.0));
    }

    #[test]
    fn test_best_overlap_and_memoization() {
        let def = metric("m", "[A] + [B]");
        let f1 = frame(
            2.0,
            vec![group(&[("A", 2.0)]), group(&[("A", 4.0), ("B", 6.0)])],
        );
        let groups = def.load_best_groups(&f1).unwrap();
        assert_eq!(groups["A"], 1);
        assert_eq!(groups["B"], 1);
        assert_eq!(def.evaluate(&f1, 0.0, &Metadata::default(), Granularity::System), 5.0);

        // A frame favoring group 0 does not change the assignment.
        let f2 = frame(
            4.0,
            vec![group(&[("A", 2.0), ("B", 2.0)]), group(&[("A", 4.0), ("B", 4.0)])],
        );
        def.load_best_groups(&f2).unwrap();
        let vars = def.variables();
        assert_eq!(vars["A"], GroupSlot::Group(1));
        assert_eq!(vars["B"], GroupSlot::Group(1));
    }

    #[test]
    fn test_nan_values_and_ties() {
        let def = metric("m", "[A] + [B]");
        let f = frame(
            1.0,
            vec![
                group(&[("A", std::f64::NAN), ("B", 1.0)]),
                group(&[("A", 1.0)]),
                group(&[("B", 1.0)]),
            ],
        );
        let groups = def.load_best_groups(&f).unwrap();
        assert_eq!(groups["B"], 0);
        assert_eq!(groups["A"], 1);
    }

    #[test]
    fn test_unresolvable_sticks() {
        let def = metric("m", "[A] / [Z]");
        let md = Metadata::default();
        let f = frame(1.0, vec![group(&[("A", 1.0)])]);
        assert!(def.evaluate(&f, 0.0, &md, Granularity::System).is_nan());
        assert_eq!(def.variables()["Z"], GroupSlot::Unresolvable);

        let f = frame(2.0, vec![group(&[("A", 1.0), ("Z", 1.0)])]);
        assert!(matches!(
            def.load_best_groups(&f),
            Err(Error::UnresolvedVariables { .. })
        ));
        assert!(def.evaluate(&f, 1.0, &md, Granularity::System).is_nan());
    }

    #[test]
    fn test_groups_changed() {
        let def = metric("m", "[A] + [B]");
        let md = Metadata::default();
        let f = frame(1.0, vec![group(&[("A", 1.0)]), group(&[("B", 1.0)])]);
        assert_eq!(def.evaluate(&f, 0.0, &md, Granularity::System), 2.0);
        let f = frame(2.0, vec![group(&[("A", 1.0), ("B", 1.0)])]);
        assert!(matches!(
            def.variable_values(&f, 1.0, &md, Granularity::System),
            Err(Error::GroupsChanged)
        ));
        assert!(def.evaluate(&f, 1.0, &md, Granularity::System).is_nan());
    }

    #[test]
    fn test_c6_residency() {
        let def = metric("c6", "[cstate_core/c6-residency/]");
        let mut md = Metadata::default();
        md.threads_per_core = 2;
        let f = frame(2.0, vec![group(&[(C6_RESIDENCY, 10.0)])]);
        assert_eq!(def.evaluate(&f, 0.0, &md, Granularity::System), 10.0);
        assert_eq!(def.evaluate(&f, 0.0, &md, Granularity::Socket), 10.0);
        assert_eq!(def.evaluate(&f, 0.0, &md, Granularity::Cpu), 5.0);
        md.threads_per_core = 1;
        assert_eq!(def.evaluate(&f, 0.0, &md, Granularity::System), 5.0);
    }

    #[test]
    fn test_boolean_result_is_nan() {
        let def = metric("m", "[A] > 1");
        let f = frame(1.0, vec![group(&[("A", 2.0)])]);
        assert!(def
            .evaluate(&f, 0.0, &Metadata::default(), Granularity::System)
            .is_nan());
    }

    #[test]
    fn test_thresholds() {
        let raw = RawMetric {
            name: "metric_frontend".into(),
            expression: "100 * [A] / [B]".into(),
            threshold: "[frontend] > 15".into(),
            ..RawMetric::default()
        };
        let defs = vec![MetricDefinition::compile(&raw, &Constants::default()).unwrap()];
        let f = frame(1.0, vec![group(&[("A", 1.0), ("B", 4.0)])]);
        let out = evaluate_frame(&defs, &f, 0.0, &Metadata::default(), Granularity::System);
        assert_eq!(out.get("frontend"), Some(25.0));
        assert_eq!(out.thresholds_exceeded(&defs), vec!["frontend"]);
    }
}

//! Metric libraries and the pipeline turning their formulas into executable expressions.

use crate::config::{CollectionMode, Granularity};
use crate::metadata::Metadata;
use crate::pmu::conditional::transform_expression;
use crate::pmu::events::abbreviate_event_name;
use crate::pmu::MetricExpr;
use crate::{Error, Result};
use lazy_static::lazy_static;
use log::{debug, warn};
use regex::Regex;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

lazy_static! {
    static ref CONSTANT_INT: Regex = Regex::new(r"\[(\d+)\]").unwrap();
    static ref VARIABLE: Regex = Regex::new(r"\[([^\[\]]+)\]").unwrap();
}

/// Prefix carried by metric names in some libraries.
const METRIC_PREFIX: &str = "metric_";

/// Pseudo-event naming the user supplied transaction rate.
pub const TRANSACTION_RATE: &str = "TXN";

/// A metric as written in a metric library file.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct RawMetric {
    /// Name of the metric.
    #[serde(alias = "Name")]
    pub name: String,
    /// Formula over bracketed event names and constants.
    #[serde(alias = "Expression")]
    pub expression: String,
    /// Human readable description.
    #[serde(alias = "Description")]
    pub description: String,
    /// Grouping used by report renderers.
    #[serde(alias = "Category")]
    pub category: String,
    /// Depth in the topdown hierarchy, 0 when not part of it.
    #[serde(alias = "Level")]
    pub level: u32,
    /// Optional formula over metric names flagging abnormal values.
    #[serde(alias = "ThresholdExpression", alias = "thresholdexpression")]
    pub threshold: String,
}

/// Parse a metric library, optionally restricted to `selected` metric names.
///
/// Selected metrics are returned in the requested order. Requesting a name that is not part of
/// the library is an error.
pub fn parse_raw_metrics(json: &str, selected: &[String]) -> Result<Vec<RawMetric>> {
    let metrics: Vec<RawMetric> = serde_json::from_str(json)?;
    if selected.is_empty() {
        return Ok(metrics);
    }
    selected
        .iter()
        .map(|name| {
            metrics
                .iter()
                .find(|m| &m.name == name)
                .cloned()
                .ok_or_else(|| Error::MetricNotFound(name.clone()))
        })
        .collect()
}

/// Load a metric library from a JSON file.
pub fn load_raw_metrics<P: AsRef<Path>>(path: P, selected: &[String]) -> Result<Vec<RawMetric>> {
    let path = path.as_ref();
    let json = std::fs::read_to_string(path).map_err(|source| Error::ReadFile {
        path: path.to_path_buf(),
        source,
    })?;
    parse_raw_metrics(&json, selected)
}

/// Summary statistics of one retire latency measurement.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(default)]
pub struct LatencyStats {
    /// Smallest observed latency.
    #[serde(rename = "MIN")]
    pub min: f64,
    /// Largest observed latency.
    #[serde(rename = "MAX")]
    pub max: f64,
    /// Mean latency.
    #[serde(rename = "MEAN")]
    pub mean: f64,
}

/// Per-event retire latencies of a microarchitecture.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RetireLatencies {
    /// Event name to latency statistics.
    #[serde(rename = "Data", default)]
    pub data: HashMap<String, LatencyStats>,
}

impl RetireLatencies {
    /// Parse retire latencies from their JSON representation.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load retire latencies from a JSON file.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| Error::ReadFile {
            path: path.to_path_buf(),
            source,
        })?;
        RetireLatencies::from_json(&json)
    }
}

/// Format a number the way constants are spliced into formulas.
#[inline]
fn fmt_constant(x: f64) -> String {
    format!("{:.6}", x)
}

/// Platform constants substituted into metric formulas.
#[derive(Debug, Clone, Default)]
pub struct Constants {
    /// Bracketed token to replacement text, applied in order.
    table: Vec<(String, String)>,
}

impl Constants {
    /// Compute the constants of a platform for one collection mode.
    ///
    /// `[TSC]` is the system wide count, split evenly across sockets or logical CPUs when
    /// metrics are computed at those granularities.
    pub fn new(metadata: &Metadata, mode: CollectionMode, transaction_rate: f64) -> Self {
        let tsc = metadata.tsc as f64;
        let tsc = match mode.granularity {
            Granularity::System => tsc,
            Granularity::Socket => tsc / f64::from(metadata.socket_count),
            Granularity::Cpu => tsc / f64::from(metadata.logical_cpu_count()),
        };
        let chas = metadata.uncore_devices("cha").map_or(0, |ids| ids.len());
        let table = vec![
            ("SYSTEM_TSC_FREQ", fmt_constant(metadata.tsc_frequency_hz as f64)),
            ("TSC", fmt_constant(tsc)),
            ("CORES_PER_SOCKET", fmt_constant(f64::from(metadata.cores_per_socket))),
            ("CHAS_PER_SOCKET", fmt_constant(chas as f64)),
            ("SOCKET_COUNT", fmt_constant(f64::from(metadata.socket_count))),
            ("HYPERTHREADING_ON", metadata.hyperthreading_on().to_string()),
            ("CONST_THREAD_COUNT", fmt_constant(f64::from(metadata.threads_per_core))),
            (TRANSACTION_RATE, fmt_constant(transaction_rate)),
        ];
        Constants {
            table: table
                .into_iter()
                .map(|(k, v)| (format!("[{}]", k), v))
                .collect(),
        }
    }

    /// Add `[EVENT:retire_latency]` substitutions using the mean latency of each event.
    pub fn with_retire_latencies(mut self, latencies: &RetireLatencies) -> Self {
        let mut entries: Vec<_> = latencies.data.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        self.table.extend(entries.into_iter().map(|(evt, stats)| {
            (
                format!("[{}:retire_latency]", evt),
                fmt_constant(stats.mean),
            )
        }));
        self
    }

    /// Replace every known constant token in `expr`, then collapse bracketed integers.
    pub fn substitute(&self, expr: &str) -> String {
        let out = self
            .table
            .iter()
            .fold(expr.to_string(), |acc, (token, value)| acc.replace(token, value));
        CONSTANT_INT.replace_all(&out, "$1").into_owned()
    }
}

/// Names of the bracketed variables of `expr`, in order of first appearance.
pub fn variables_in(expr: &str) -> Vec<String> {
    let mut vars: Vec<String> = vec![];
    for cap in VARIABLE.captures_iter(expr) {
        let name = &cap[1];
        if !vars.iter().any(|v| v == name) {
            vars.push(name.to_string());
        }
    }
    vars
}

/// Event group a metric variable is read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupSlot {
    /// Not looked up yet.
    Unresolved,
    /// Index of the group in every event frame of the session.
    Group(usize),
    /// Lookup failed; the metric can not be computed in this session.
    Unresolvable,
}

/// A metric whose formula has been preprocessed and compiled.
///
/// Definitions are shared by every evaluator of a session. The variable to group assignment is
/// resolved on first use and then kept for the lifetime of the definition.
#[derive(Debug)]
pub struct MetricDefinition {
    /// Name of the metric.
    pub name: String,
    /// Formula after preprocessing.
    pub expression: String,
    /// Human readable description.
    pub description: String,
    /// Grouping used by report renderers.
    pub category: String,
    /// Depth in the topdown hierarchy.
    pub level: u32,
    /// Threshold formula after preprocessing.
    pub threshold: Option<String>,
    evaluable: MetricExpr,
    threshold_evaluable: Option<MetricExpr>,
    variables: Mutex<BTreeMap<String, GroupSlot>>,
}

impl MetricDefinition {
    /// Preprocess and compile a metric.
    ///
    /// Event names are expected to be abbreviated already.
    pub fn compile(raw: &RawMetric, constants: &Constants) -> Result<Self> {
        let expression = constants.substitute(&transform_expression(&raw.expression)?);
        let variables = variables_in(&expression)
            .into_iter()
            .map(|v| (v, GroupSlot::Unresolved))
            .collect();
        let evaluable = MetricExpr::parse_str(&expression)?;

        let (threshold, threshold_evaluable) = if raw.threshold.trim().is_empty() {
            (None, None)
        } else {
            let text = constants.substitute(&transform_expression(&raw.threshold)?);
            let expr = MetricExpr::parse_str(&text)?;
            (Some(text), Some(expr))
        };

        Ok(MetricDefinition {
            name: raw
                .name
                .strip_prefix(METRIC_PREFIX)
                .unwrap_or(raw.name.as_str())
                .to_string(),
            expression,
            description: raw.description.clone(),
            category: raw.category.clone(),
            level: raw.level,
            threshold,
            evaluable,
            threshold_evaluable,
            variables: Mutex::new(variables),
        })
    }

    /// Compiled formula.
    #[inline]
    pub fn evaluable(&self) -> &MetricExpr {
        &self.evaluable
    }

    /// Names of the metrics referenced by the threshold formula.
    pub fn threshold_variables(&self) -> Vec<String> {
        let mut vars: Vec<String> = vec![];
        if let Some(expr) = &self.threshold_evaluable {
            for v in expr.get_counters() {
                if !vars.contains(v) {
                    vars.push(v.clone());
                }
            }
        }
        vars
    }

    /// Evaluate the threshold formula against computed metric values.
    ///
    /// Returns `None` when the metric has no threshold.
    pub fn threshold_exceeded(&self, values: &HashMap<String, f64>) -> Result<Option<bool>> {
        let expr = match &self.threshold_evaluable {
            Some(expr) => expr,
            None => return Ok(None),
        };
        let mut vars = HashMap::new();
        for v in self.threshold_variables() {
            let value = values
                .get(&v)
                .or_else(|| values.get(v.strip_prefix(METRIC_PREFIX).unwrap_or(v.as_str())))
                .ok_or_else(|| Error::UnknownVariable(v.clone()))?;
            vars.insert(v, *value);
        }
        Ok(Some(expr.eval(&vars)?.as_bool()?))
    }

    /// Snapshot of the variable to group assignment.
    pub fn variables(&self) -> BTreeMap<String, GroupSlot> {
        self.lock_variables().clone()
    }

    /// Lock the variable to group assignment.
    pub(crate) fn lock_variables(&self) -> MutexGuard<'_, BTreeMap<String, GroupSlot>> {
        // A panic while holding the lock leaves the map itself intact.
        self.variables
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Run the metric pipeline over a metric library.
///
/// Metrics referencing an uncollectable event, and metrics whose formula can not be rewritten or
/// compiled, are dropped with a warning.
pub fn configure_metrics(
    raw_metrics: &[RawMetric],
    uncollectable: &[String],
    constants: &Constants,
    transaction_rate: f64,
) -> Vec<MetricDefinition> {
    let mut uncollectable = uncollectable.to_vec();
    if transaction_rate == 0.0 {
        uncollectable.push(TRANSACTION_RATE.to_string());
    }

    raw_metrics
        .iter()
        .filter_map(|raw| {
            let mut raw = raw.clone();
            raw.expression = abbreviate_event_name(&raw.expression);
            if let Some(evt) = uncollectable.iter().find(|e| raw.expression.contains(e.as_str())) {
                warn!("Removing metric {} using uncollectable event {}", raw.name, evt);
                return None;
            }
            match MetricDefinition::compile(&raw, constants) {
                Ok(def) => {
                    debug!("Configured metric {} -- {}", def.name, def.expression);
                    Some(def)
                }
                Err(e) => {
                    warn!("Dropping metric {} -- {}", raw.name, e);
                    None
                }
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Scope;
    use crate::pmu::Value;

    fn metadata() -> Metadata {
        let mut md = Metadata::default();
        md.socket_count = 2;
        md.cores_per_socket = 4;
        md.threads_per_core = 2;
        md.tsc = 1600;
        md.tsc_frequency_hz = 2_000_000_000;
        md.uncore_device_ids.insert("cha".into(), vec![0, 1, 2]);
        md
    }

    fn raw(name: &str, expression: &str) -> RawMetric {
        RawMetric {
            name: name.into(),
            expression: expression.into(),
            ..RawMetric::default()
        }
    }

    #[test]
    fn test_parse_raw_metrics() {
        let json = r#"[
            {"name": "metric_CPI", "expression": "[CPU_CLK_UNHALTED.THREAD] / [INST_RETIRED.ANY]"},
            {"name": "metric_IPC", "expression": "[INST_RETIRED.ANY] / [CPU_CLK_UNHALTED.THREAD]",
             "level": 1, "threshold": "[metric_IPC] < 1"}
        ]"#;
        let all = parse_raw_metrics(json, &[]).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[1].level, 1);

        let some = parse_raw_metrics(json, &["metric_IPC".to_string()]).unwrap();
        assert_eq!(some.len(), 1);
        assert_eq!(some[0].name, "metric_IPC");

        match parse_raw_metrics(json, &["metric_MISSING".to_string()]) {
            Err(Error::MetricNotFound(name)) => assert_eq!(name, "metric_MISSING"),
            x => panic!("unexpected {:?}", x),
        }
    }

    #[test]
    fn test_constants() {
        let md = metadata();
        let system = Constants::new(&md, CollectionMode::default(), 0.0);
        assert_eq!(
            system.substitute("[TSC] [SOCKET_COUNT] [HYPERTHREADING_ON] [CHAS_PER_SOCKET]"),
            "1600.000000 2.000000 true 3.000000"
        );
        assert_eq!(
            system.substitute("[SYSTEM_TSC_FREQ] * [CONST_THREAD_COUNT]"),
            "2000000000.000000 * 2.000000"
        );

        let socket = CollectionMode {
            scope: Scope::System,
            granularity: Granularity::Socket,
        };
        assert_eq!(
            Constants::new(&md, socket, 0.0).substitute("[TSC]"),
            "800.000000"
        );
        let cpu = CollectionMode {
            scope: Scope::System,
            granularity: Granularity::Cpu,
        };
        assert_eq!(
            Constants::new(&md, cpu, 0.0).substitute("[TSC]"),
            "100.000000"
        );
    }

    #[test]
    fn test_constant_integers_and_latencies() {
        let latencies =
            RetireLatencies::from_json(r#"{"Data": {"MEM_INST_RETIRED.STLB_HIT_LOADS": {"MEAN": 7.5, "MIN": 1, "MAX": 20}}}"#)
                .unwrap();
        let constants =
            Constants::new(&metadata(), CollectionMode::default(), 0.0).with_retire_latencies(&latencies);
        let out = constants.substitute(
            "[20] * [INST_RETIRED.ANY] + [MEM_INST_RETIRED.STLB_HIT_LOADS:retire_latency] / [100]",
        );
        assert_eq!(out, "20 * [INST_RETIRED.ANY] + 7.500000 / 100");
        assert_eq!(variables_in(&out), vec!["INST_RETIRED.ANY"]);
    }

    #[test]
    fn test_variables_in() {
        assert_eq!(
            variables_in("[A] + [B] * [A] / [power/energy-pkg/]"),
            vec!["A", "B", "power/energy-pkg/"]
        );
        assert!(variables_in("1 + 2").is_empty());
    }

    #[test]
    fn test_compile() {
        let constants = Constants::new(&metadata(), CollectionMode::default(), 0.0);
        let mut metric = raw(
            "metric_TMA_Frontend_Bound(%)",
            "100 * ([A] / [SOCKET_COUNT] if [HYPERTHREADING_ON] else [B])",
        );
        metric.threshold = "[TMA_Frontend_Bound(%)] > 15".into();
        let def = MetricDefinition::compile(&metric, &constants).unwrap();
        assert_eq!(def.name, "TMA_Frontend_Bound(%)");
        assert_eq!(def.expression, "100 * (true ? [A] / 2.000000 : [B])");
        let vars = def.variables();
        assert_eq!(vars.len(), 2);
        assert!(vars.values().all(|s| *s == GroupSlot::Unresolved));

        let vals = [("A".to_string(), 4.0), ("B".to_string(), 1.0)]
            .iter()
            .cloned()
            .collect::<HashMap<_, _>>();
        assert_eq!(def.evaluable().eval(&vals).unwrap(), Value::Num(200.0));

        assert_eq!(def.threshold_variables(), vec!["TMA_Frontend_Bound(%)"]);
        let mut values = HashMap::new();
        values.insert("TMA_Frontend_Bound(%)".to_string(), 20.0);
        assert_eq!(def.threshold_exceeded(&values).unwrap(), Some(true));
        values.insert("TMA_Frontend_Bound(%)".to_string(), 10.0);
        assert_eq!(def.threshold_exceeded(&values).unwrap(), Some(false));
        assert!(def.threshold_exceeded(&HashMap::new()).is_err());
    }

    #[test]
    fn test_configure_metrics() {
        let constants = Constants::new(&metadata(), CollectionMode::default(), 0.0);
        let raws = vec![
            raw("metric_IPC", "[INST_RETIRED.ANY] / [CPU_CLK_UNHALTED.THREAD]"),
            raw("metric_uncollectable", "[OCR.READS_TO_CORE.DRAM] / [INST_RETIRED.ANY]"),
            raw("metric_txn", "[INST_RETIRED.ANY] / [TXN]"),
            raw("metric_bad_conditional", "[A] if [B]"),
            raw("metric_bad_syntax", "[A] +"),
            raw(
                "metric_cha",
                "[UNC_CHA_TOR_INSERTS.IA_MISS_DRD] / [UNC_CHA_CLOCKTICKS]",
            ),
        ];
        let uncollectable = vec!["OCR.READS_TO_CORE.DRAM".to_string()];
        let defs = configure_metrics(&raws, &uncollectable, &constants, 0.0);
        let names: Vec<&str> = defs.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["IPC", "cha"]);
        assert_eq!(defs[1].expression, "[UNCCTI.IMD] / [UNCCCT]");

        // A transaction rate makes [TXN] metrics computable.
        let constants = Constants::new(&metadata(), CollectionMode::default(), 100.0);
        let defs = configure_metrics(&raws, &uncollectable, &constants, 100.0);
        assert!(defs.iter().any(|d| d.name == "txn" && d.expression.ends_with("100.000000")));
    }
}

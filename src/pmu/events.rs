use crate::config::CollectionMode;
use crate::metadata::Metadata;
use crate::{Error, Result};
use lazy_static::lazy_static;
use log::{debug, warn};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

/// Long uncore event name fragments and their replacements.
///
/// Order matters: longer keys sharing a prefix with shorter ones must come first. Replacements for
/// `UNC_*` fragments keep the `UNC` prefix so the frame assembler still recognizes uncore events.
const ABBREVIATIONS: &[(&str, &str)] = &[
    ("UNC_CHA_TOR_INSERTS", "UNCCTI"),
    ("UNC_CHA_TOR_OCCUPANCY", "UNCCTO"),
    ("UNC_CHA_CLOCKTICKS", "UNCCCT"),
    ("UNC_M_CAS_COUNT_SCH", "UNCMCC"),
    ("IA_MISS_DRD_REMOTE", "IMDR"),
    ("IA_MISS_DRD_LOCAL", "IMDL"),
    ("IA_MISS_LLCPREFDATA", "IMLP"),
    ("IA_MISS_LLCPREFRFO", "IMLR"),
    ("IA_MISS_DRD_PREF_LOCAL", "IMDPL"),
    ("IA_MISS_DRD_PREF_REMOTE", "IMDRP"),
    ("IA_MISS_CRD_PREF", "IMCP"),
    ("IA_MISS_RFO_PREF", "IMRP"),
    ("IA_MISS_RFO", "IMRF"),
    ("IA_MISS_CRD", "IMC"),
    ("IA_MISS_DRD", "IMD"),
    ("IO_PCIRDCUR", "IPCI"),
    ("IO_ITOMCACHENEAR", "IITN"),
    ("IO_ITOM", "IITO"),
    ("IMD_OPT", "IMDO"),
];

/// Shorten long event names so the collector command line stays within argument length limits.
///
/// Must be applied identically to catalog names and metric expressions.
pub fn abbreviate_event_name(name: &str) -> String {
    ABBREVIATIONS
        .iter()
        .fold(name.to_string(), |acc, (long, short)| acc.replace(long, short))
}

/// Events that need a PEBS capable PMU even in counting mode.
const PEBS_EVENTS: &[&str] = &["INT_MISC.UNKNOWN_BRANCH_CYCLES", "UOPS_RETIRED.MS"];

/// Topdown slots event that leads the `PERF_METRICS` block.
pub const TOPDOWN_SLOTS: &str = "TOPDOWN.SLOTS:perf_metrics";

/// Prefix of the topdown metric events read out of the `PERF_METRICS` MSR.
pub const PERF_METRICS_PREFIX: &str = "PERF_METRICS.";

/// Events that are neither core nor uncore catalog entries but are collected through their perf
/// PMU names.
pub const OTHER_EVENTS: &[&str] = &[
    "power/energy-pkg/",
    "power/energy-ram/",
    "cstate_core/c6-residency/",
    "cstate_pkg/c6-residency/",
];

/// Suffix used by catalogs to embed the off-core response MSR value in an event name.
const OCR_MSR_MODIFIER: &str = "ocr_msr_val=";

lazy_static! {
    /// Topdown events that are not part of the on-disk catalogs.
    static ref TOPDOWN_EVENTS: Vec<CoreEvent> = {
        let mut evts = vec![CoreEvent {
            name: TOPDOWN_SLOTS.into(),
            event_code: "0x00".into(),
            umask: "0x04".into(),
            sample_after_value: "10000003".into(),
            counter: "Fixed counter 3".into(),
            ..CoreEvent::default()
        }];
        evts.extend(
            [
                ("RETIRING", "0x80"),
                ("BAD_SPECULATION", "0x81"),
                ("FRONTEND_BOUND", "0x82"),
                ("BACKEND_BOUND", "0x83"),
                ("HEAVY_OPERATIONS", "0x84"),
                ("BRANCH_MISPREDICTS", "0x85"),
                ("FETCH_LATENCY", "0x86"),
                ("MEMORY_BOUND", "0x87"),
            ]
            .iter()
            .map(|(name, umask)| CoreEvent {
                name: format!("{}{}", PERF_METRICS_PREFIX, name),
                event_code: "0x00".into(),
                umask: String::from(*umask),
                sample_after_value: "10000003".into(),
                ..CoreEvent::default()
            }),
        );
        evts
    };

    /// Catalog event names that perf exposes under a native alias.
    static ref PERF_ALIASES: HashMap<&'static str, &'static str> = [
        ("INST_RETIRED.ANY", "instructions"),
        ("INST_RETIRED.ANY_P:SUP", "instructions:k"),
        ("CPU_CLK_UNHALTED.THREAD", "cpu-cycles"),
        ("CPU_CLK_UNHALTED.CORE", "cpu-cycles"),
        ("CPU_CLK_UNHALTED.THREAD_P:SUP", "cpu-cycles:k"),
        ("CPU_CLK_UNHALTED.CORE_P:SUP", "cpu-cycles:k"),
        ("CPU_CLK_UNHALTED.REF_TSC", "ref-cycles"),
        ("CPU_CLK_UNHALTED.REF_TSC:SUP", "ref-cycles:k"),
        ("CPU_CLK_UNHALTED.REF_TSC_P:SUP", "ref-cycles:k"),
        (TOPDOWN_SLOTS, "topdown.slots"),
        ("PERF_METRICS.BAD_SPECULATION", "topdown-bad-spec"),
        ("PERF_METRICS.BACKEND_BOUND", "topdown-be-bound"),
        ("PERF_METRICS.BRANCH_MISPREDICTS", "topdown-br-mispredict"),
        ("PERF_METRICS.FRONTEND_BOUND", "topdown-fe-bound"),
        ("PERF_METRICS.FETCH_LATENCY", "topdown-fetch-lat"),
        ("PERF_METRICS.HEAVY_OPERATIONS", "topdown-heavy-ops"),
        ("PERF_METRICS.MEMORY_BOUND", "topdown-mem-bound"),
        ("PERF_METRICS.RETIRING", "topdown-retiring"),
    ]
    .iter()
    .cloned()
    .collect();
}

/// Catalog flags are spelled either `"1"` or `"true"`.
#[inline]
fn flag(val: &str) -> bool {
    val == "1" || val.eq_ignore_ascii_case("true")
}

/// Parse a `0x` prefixed or plain decimal number from a catalog field.
fn parse_number(val: &str) -> Result<u64> {
    let val = val.trim();
    if val.starts_with("0x") || val.starts_with("0X") {
        Ok(u64::from_str_radix(&val[2..], 16)?)
    } else {
        Ok(val.parse()?)
    }
}

/// Counters an event may be programmed on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Counters {
    /// Hard-wired fixed-purpose counter with this index.
    Fixed(usize),
    /// Any of the listed general-purpose counter indices.
    General(Vec<usize>),
}

impl Counters {
    /// Parse the `Counter` field of a catalog entry, e.g. `"0,1,2,3"` or `"Fixed counter 1"`.
    pub fn parse(val: &str) -> Result<Self> {
        let val = val.trim();
        if let Some(idx) = val.strip_prefix("Fixed counter") {
            return Ok(Counters::Fixed(idx.trim().parse()?));
        }
        let slots = val
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| s.parse::<usize>())
            .collect::<std::result::Result<Vec<usize>, _>>()?;
        Ok(Counters::General(slots))
    }

    /// Every general-purpose counter of a PMU with `count` counters.
    pub fn any_general(count: usize) -> Self {
        Counters::General((0..count).collect())
    }

    /// Check if general-purpose counter `slot` is legal.
    #[inline]
    pub fn allows(&self, slot: usize) -> bool {
        match self {
            Counters::General(slots) => slots.contains(&slot),
            Counters::Fixed(_) => false,
        }
    }
}

/// Trait allowing access to the basic metadata of catalog events.
pub trait BaseEvent: Clone + 'static {
    /// Get the name of the event.
    fn name(&self) -> &str;

    /// Rename the event, e.g. to carry modifiers or a device index.
    fn set_name(&mut self, name: String);

    /// Get a description of the event.
    fn desc(&self) -> &str;

    /// Raw `Counter` field of the event.
    fn counter(&self) -> &str;

    /// Render the event in the syntax accepted by `perf stat -e`.
    fn string_for_perf(&self) -> Result<String>;

    /// Name the collector reports the event's value under.
    fn reported_name(&self) -> String {
        self.name().to_string()
    }

    /// Events every catalog of this kind knows about without listing them.
    fn synthetic(_name: &str) -> Option<&'static Self> {
        None
    }
}

/// A per-CPU event of the core PMU.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(default)]
pub struct CoreEvent {
    /// Name of the event.
    #[serde(rename = "EventName")]
    pub name: String,
    /// Event select code. Off-core events may list two comma separated codes.
    #[serde(rename = "EventCode")]
    pub event_code: String,
    /// Unit mask qualifying the event.
    #[serde(rename = "UMask")]
    pub umask: String,
    /// Legal counters, a comma separated list or `Fixed counter N`.
    #[serde(rename = "Counter")]
    pub counter: String,
    /// Counter mask threshold (decimal).
    #[serde(rename = "CounterMask")]
    pub counter_mask: String,
    /// Invert counter mask flag.
    #[serde(rename = "Invert")]
    pub invert: String,
    /// Edge detect flag.
    #[serde(rename = "EdgeDetect")]
    pub edge_detect: String,
    /// Default sampling period.
    #[serde(rename = "SampleAfterValue")]
    pub sample_after_value: String,
    /// Filter MSR of off-core response events.
    #[serde(rename = "MSRIndex")]
    pub msr_index: String,
    /// Value programmed into the filter MSR.
    #[serde(rename = "MSRValue")]
    pub msr_value: String,
    /// Event must be the only one of its kind in a group.
    #[serde(rename = "TakenAlone")]
    pub taken_alone: String,
    /// Event uses one of the two off-core response filter MSRs.
    #[serde(rename = "Offcore")]
    pub offcore: String,
    /// Brief summary of the event.
    #[serde(rename = "BriefDescription")]
    pub desc: String,
    /// Event is deprecated.
    #[serde(rename = "Deprecated")]
    pub deprecated: String,
}

impl CoreEvent {
    /// Check if the event has to be measured without other `TakenAlone` events.
    #[inline]
    pub fn is_taken_alone(&self) -> bool {
        flag(&self.taken_alone)
    }

    /// Check if the event needs an off-core response filter MSR.
    #[inline]
    pub fn is_offcore(&self) -> bool {
        flag(&self.offcore)
    }

    /// Check if the event is one of the `PERF_METRICS` topdown events.
    #[inline]
    pub fn is_perf_metrics(&self) -> bool {
        self.name.starts_with(PERF_METRICS_PREFIX)
    }

    /// Check if the event belongs to the fixed-counter topdown block.
    #[inline]
    pub fn is_topdown(&self) -> bool {
        self.is_perf_metrics() || self.name == TOPDOWN_SLOTS
    }

    /// Name without any `:` modifiers.
    pub fn base_name(&self) -> &str {
        self.name.split(':').next().unwrap_or_default()
    }

    /// Check if the event can be collected on the platform described by `metadata`.
    pub fn is_collectable(&self, metadata: &Metadata, mode: CollectionMode) -> bool {
        if !metadata.supports_fixed_tma
            && (self.name.starts_with("TOPDOWN.SLOTS") || self.is_perf_metrics())
            && self.name != "TOPDOWN.SLOTS_P"
        {
            debug!("Fixed TMA events not supported -- {}", self.name);
            return false;
        }
        if self.is_offcore() {
            if !metadata.supports_ocr {
                debug!("Off-core response events not supported -- {}", self.name);
                return false;
            }
            if !mode.scope.is_system_wide() {
                debug!(
                    "Off-core response events not supported outside system scope -- {}",
                    self.name
                );
                return false;
            }
        }
        if !metadata.supports_ref_cycles && self.name.contains("ref-cycles") {
            debug!("Ref-cycles events not supported -- {}", self.name);
            return false;
        }
        if !metadata.supports_pebs && PEBS_EVENTS.iter().any(|p| self.name.contains(p)) {
            debug!("PEBS events not supported -- {}", self.name);
            return false;
        }
        true
    }

    /// Split an off-core event name carrying its MSR value into the perf name and the value.
    ///
    /// `OCR.DEMAND_RFO.L3_MISS:ocr_msr_val=0x103b8000` becomes
    /// (`OCR.DEMAND_RFO.L3_MISS.0x103b8000`, `0x103b8000`).
    pub fn ocr_name_and_msr(&self) -> (String, String) {
        let marker = format!(":{}", OCR_MSR_MODIFIER);
        match self.name.find(&marker) {
            Some(idx) => {
                let msr = &self.name[idx + marker.len()..];
                (format!("{}.{}", &self.name[..idx], msr), msr.to_string())
            }
            None => (self.name.clone(), self.msr_value.clone()),
        }
    }
}

impl BaseEvent for CoreEvent {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_name(&mut self, name: String) {
        self.name = name;
    }

    fn desc(&self) -> &str {
        &self.desc
    }

    fn counter(&self) -> &str {
        &self.counter
    }

    fn string_for_perf(&self) -> Result<String> {
        if let Some(alias) = PERF_ALIASES.get(self.name.as_str()) {
            return Ok(String::from(*alias));
        }
        if self.event_code.is_empty() {
            return Err(Error::UnsupportedEvent(format!(
                "{} has no EventCode",
                self.name
            )));
        }

        let mut cmask = if self.counter_mask.is_empty() {
            None
        } else {
            Some(self.counter_mask.trim().parse::<u64>()?)
        };
        let mut edge = flag(&self.edge_detect);
        let mut kernel_only = false;
        for modifier in self.name.split(':').skip(1) {
            if modifier == "SUP" {
                kernel_only = true;
            } else if modifier.starts_with(OCR_MSR_MODIFIER) {
                continue;
            } else if let Some(c) = modifier.strip_prefix('c') {
                cmask = Some(c.parse()?);
            } else if let Some(e) = modifier.strip_prefix('e') {
                edge = e.parse::<u64>()? != 0;
            }
        }

        // Off-core events list both codes, e.g. "0x2A,0x2B"; the first one selects the event.
        let code = self.event_code.split(',').next().unwrap_or_default();
        let mut parts = vec![format!("cpu/event={}", code)];
        if !self.umask.is_empty() {
            parts.push(format!("umask={}", self.umask));
        }
        if let Some(c) = cmask {
            parts.push(format!("cmask={:#04x}", c));
        }
        if edge {
            parts.push(String::from("edge=1"));
        }
        if flag(&self.invert) {
            parts.push(String::from("inv=1"));
        }
        if !self.sample_after_value.is_empty() {
            parts.push(format!("period={}", self.sample_after_value));
        }
        let name = if self.is_offcore() {
            let (name, msr) = self.ocr_name_and_msr();
            parts.push(format!("offcore_rsp={}", msr));
            name
        } else {
            self.name.clone()
        };
        parts.push(format!("name='{}'", name));
        Ok(format!(
            "{}/{}",
            parts.join(","),
            if kernel_only { "k" } else { "" }
        ))
    }

    fn reported_name(&self) -> String {
        if self.is_offcore() {
            self.ocr_name_and_msr().0
        } else {
            self.name.clone()
        }
    }

    fn synthetic(name: &str) -> Option<&'static Self> {
        TOPDOWN_EVENTS.iter().find(|e| e.name == name)
    }
}

/// A per-device event of an uncore PMU.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(default)]
pub struct UncoreEvent {
    /// Name of the event.
    #[serde(rename = "EventName")]
    pub name: String,
    /// Device type counting the event, e.g. `CHA` or `IMC`.
    #[serde(rename = "Unit")]
    pub unit: String,
    /// Event select code.
    #[serde(rename = "EventCode")]
    pub event_code: String,
    /// Unit mask qualifying the event.
    #[serde(rename = "UMask")]
    pub umask: String,
    /// Extended unit mask, prepended to `umask`.
    #[serde(rename = "UMaskExt")]
    pub umask_ext: String,
    /// Legal counters, a comma separated list.
    #[serde(rename = "Counter")]
    pub counter: String,
    /// Brief summary of the event.
    #[serde(rename = "BriefDescription")]
    pub desc: String,
    /// Event is deprecated.
    #[serde(rename = "Deprecated")]
    pub deprecated: String,
    /// Device instance the event is bound to after group expansion.
    #[serde(skip)]
    pub device: Option<u32>,
}

impl UncoreEvent {
    /// Lower-cased device type of the event, e.g. `cha` for `CHA`.
    pub fn unit_name(&self) -> String {
        self.unit
            .split(' ')
            .next()
            .unwrap_or_default()
            .to_lowercase()
    }

    /// Check if the event can be collected on the platform described by `metadata`.
    pub fn is_collectable(&self, metadata: &Metadata, mode: CollectionMode) -> bool {
        if !metadata.supports_uncore {
            debug!("Uncore events not supported on target -- {}", self.name);
            return false;
        }
        if !mode.scope.is_system_wide() || mode.granularity == crate::config::Granularity::Cpu {
            debug!(
                "Uncore events not supported outside system scope or at CPU granularity -- {}",
                self.name
            );
            return false;
        }
        if metadata.uncore_devices(&self.unit).is_none() {
            warn!(
                "Uncore event unit not found on target -- {} ({})",
                self.name,
                self.unit
            );
            return false;
        }
        true
    }

    /// Copy of the event bound to device instance `id`.
    pub fn for_device(&self, id: u32) -> Self {
        let mut evt = self.clone();
        evt.name = format!("{}.{}", self.name, id);
        evt.device = Some(id);
        evt
    }
}

impl BaseEvent for UncoreEvent {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_name(&mut self, name: String) {
        self.name = name;
    }

    fn desc(&self) -> &str {
        &self.desc
    }

    fn counter(&self) -> &str {
        &self.counter
    }

    fn string_for_perf(&self) -> Result<String> {
        if self.event_code.is_empty() {
            return Err(Error::UnsupportedEvent(format!(
                "{} has no EventCode",
                self.name
            )));
        }
        let pmu = match self.device {
            Some(id) => format!("uncore_{}_{}", self.unit_name(), id),
            None => self.unit_name(),
        };
        let mut parts = vec![format!("{}/event={}", pmu, self.event_code)];
        if !self.umask.is_empty() {
            let umask = parse_number(&self.umask)?;
            let ext = if self.umask_ext.is_empty() {
                0
            } else {
                parse_number(&self.umask_ext)?
            };
            if ext > 0 {
                parts.push(format!("umask=0x{:x}{:02x}", ext, umask));
            } else {
                parts.push(format!("umask=0x{:02x}", umask));
            }
        }
        parts.push(format!("name='{}'", self.name));
        Ok(format!("{}/", parts.join(",")))
    }
}

/// Catalog of events parsed from a perfmon JSON file.
///
/// Lookups go through a name index built once when the catalog is loaded.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(bound(deserialize = "E: Deserialize<'de>"))]
pub struct EventCatalog<E> {
    /// Header of the JSON file (version, date, ...).
    #[serde(rename = "Header", default)]
    pub header: HashMap<String, serde_json::Value>,
    /// Events in file order.
    #[serde(rename = "Events", default)]
    pub events: Vec<E>,
    #[serde(skip)]
    index: HashMap<String, usize>,
}

/// Catalog of core events.
pub type CoreEvents = EventCatalog<CoreEvent>;

/// Catalog of uncore events.
pub type UncoreEvents = EventCatalog<UncoreEvent>;

impl<E: BaseEvent> EventCatalog<E> {
    /// Build a catalog from a list of events.
    pub fn new(events: Vec<E>) -> Self {
        let mut catalog = EventCatalog {
            header: HashMap::new(),
            events,
            index: HashMap::new(),
        };
        catalog.build_index();
        catalog
    }

    /// Abbreviate event names and index them.
    fn build_index(&mut self) {
        self.index.clear();
        for (i, evt) in self.events.iter_mut().enumerate() {
            let short = abbreviate_event_name(evt.name());
            evt.set_name(short);
            self.index.entry(evt.name().to_string()).or_insert(i);
        }
    }

    /// Number of events in the catalog.
    #[inline]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Check if the catalog is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Search for an event by name.
    ///
    /// Modifiers appended after a `:` (e.g. `INST_RETIRED.ANY:c1:e1`) are ignored.
    pub fn find_event_by_name(&self, name: &str) -> Option<&E> {
        if let Some(evt) = E::synthetic(name) {
            return Some(evt);
        }
        let base = name.split(':').next().unwrap_or_default();
        self.index.get(base).map(|&i| &self.events[i])
    }
}

impl<E> EventCatalog<E>
where
    E: BaseEvent + serde::de::DeserializeOwned,
{
    /// Parse a catalog from its JSON representation.
    pub fn from_json(json: &str) -> Result<Self> {
        let mut catalog: EventCatalog<E> = serde_json::from_str(json)?;
        catalog.build_index();
        Ok(catalog)
    }

    /// Load a catalog from a JSON file.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| Error::ReadFile {
            path: path.to_path_buf(),
            source,
        })?;
        EventCatalog::from_json(&json)
    }
}

//! Placement of events onto the counters of one multiplexed collection pass.

use crate::metadata::Metadata;
use crate::pmu::events::{BaseEvent, CoreEvent, Counters, UncoreEvent, TOPDOWN_SLOTS};
use crate::pmu::{EventDefinition, GroupDefinition};
use crate::{Error, Result};
use log::{debug, error, info, warn};
use std::collections::{BTreeSet, HashSet};
use std::fmt::Debug;

/// Events that count reference cycles.
const REF_TSC_PREFIX: &str = "CPU_CLK_UNHALTED.REF_TSC";

/// General-purpose counters of a group.
///
/// Each occupied slot remembers the counters its event may legally move to.
#[derive(Debug, Clone)]
struct Slots<E> {
    slots: Vec<Option<(E, Counters)>>,
}

impl<E: BaseEvent> Slots<E> {
    fn new(count: usize) -> Self {
        Slots {
            slots: vec![None; count],
        }
    }

    fn iter(&self) -> impl Iterator<Item = &E> {
        self.slots.iter().filter_map(|s| s.as_ref().map(|(e, _)| e))
    }

    fn len(&self) -> usize {
        self.slots.len()
    }

    /// Put `event` on the first free legal counter, optionally moving one occupant aside.
    fn place(&mut self, event: E, legal: Counters, reorder: bool) -> Result<()> {
        let free = (0..self.slots.len()).find(|&i| self.slots[i].is_none() && legal.allows(i));
        if let Some(i) = free {
            self.slots[i] = Some((event, legal));
            return Ok(());
        }
        if reorder {
            let candidates: Vec<usize> = (0..self.slots.len()).filter(|&i| legal.allows(i)).collect();
            for i in candidates {
                let target = match &self.slots[i] {
                    Some((_, occupant)) => (0..self.slots.len())
                        .find(|&j| j != i && self.slots[j].is_none() && occupant.allows(j)),
                    None => None,
                };
                if let Some(j) = target {
                    self.slots[j] = self.slots[i].take();
                    self.slots[i] = Some((event, legal));
                    return Ok(());
                }
            }
        }
        Err(Error::CounterUnavailable {
            event: event.name().to_string(),
            counters: event.counter().to_string(),
        })
    }

    fn remove(&mut self, name: &str) -> bool {
        for slot in self.slots.iter_mut() {
            if slot.as_ref().map_or(false, |(e, _)| e.name() == name) {
                *slot = None;
                return true;
            }
        }
        false
    }

    /// Check if both hold the same events, regardless of the counters they sit on.
    fn same_events(&self, other: &Self) -> bool {
        let mine: HashSet<&str> = self.iter().map(|e| e.name()).collect();
        let theirs: HashSet<&str> = other.iter().map(|e| e.name()).collect();
        self.len() == other.len() && mine == theirs
    }
}

/// Common interface of the core and uncore counter groups.
pub trait CounterGroup: Clone + PartialEq + Debug {
    /// Kind of event held by the group.
    type Event: BaseEvent;

    /// Events of the group, in the order they are handed to the collector.
    fn events(&self) -> Vec<&Self::Event>;

    /// Place `event` in the group. With `reorder`, one event may be moved to make room.
    ///
    /// Adding an event already in the group is a no-op.
    fn add_event(&mut self, event: Self::Event, reorder: bool) -> Result<()>;

    /// Metrics this group exists to serve.
    fn metric_names(&self) -> &BTreeSet<String>;

    /// Mutable access to the metrics this group exists to serve.
    fn metric_names_mut(&mut self) -> &mut BTreeSet<String>;

    /// Device tag recorded in the event's definition.
    fn device_of(event: &Self::Event) -> String;

    /// Search for an event in the group by its exact name.
    fn find_event_by_name(&self, name: &str) -> Option<&Self::Event> {
        self.events().into_iter().find(|e| e.name() == name)
    }

    /// Check if the group holds no events.
    fn is_empty(&self) -> bool {
        self.events().is_empty()
    }

    /// Add every event of `other` to this group and take over its metric names.
    ///
    /// Either all events fit and the group is updated, or the group is left untouched.
    fn merge(&mut self, other: &Self) -> Result<()> {
        let mut merged = self.clone();
        for evt in other.events() {
            merged.add_event(evt.clone(), true)?;
        }
        merged
            .metric_names_mut()
            .extend(other.metric_names().iter().cloned());
        *self = merged;
        Ok(())
    }

    /// Render the group for the collector. Events that can not be rendered are skipped.
    fn to_group_definition(&self) -> GroupDefinition {
        let mut events = vec![];
        for evt in self.events() {
            match evt.string_for_perf() {
                Ok(raw) => events.push(EventDefinition {
                    raw,
                    name: evt.reported_name(),
                    device: Self::device_of(evt),
                }),
                Err(e) => error!("Error formatting event {} for perf -- {}", evt.name(), e),
            }
        }
        GroupDefinition::from(events)
    }
}

/// Fixed counters available on the platform.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct FixedSupport {
    instructions: bool,
    cycles: bool,
    ref_cycles: bool,
    tma: bool,
}

impl FixedSupport {
    fn supports(self, idx: usize) -> bool {
        match idx {
            0 => self.instructions,
            1 => self.cycles,
            2 => self.ref_cycles,
            _ => false,
        }
    }
}

/// Fixed counter index of an event placed on a fixed counter.
fn fixed_index(evt: &CoreEvent) -> Option<usize> {
    match Counters::parse(&evt.counter) {
        Ok(Counters::Fixed(idx)) => Some(idx),
        _ => None,
    }
}

/// Events of the core PMU collected together.
///
/// The topdown block (slots event first) leads the fixed counters, followed by the remaining
/// fixed counter events in counter order.
#[derive(Debug, Clone)]
pub struct CoreGroup {
    fixed: Vec<CoreEvent>,
    general: Slots<CoreEvent>,
    metric_names: BTreeSet<String>,
    support: FixedSupport,
}

impl CoreGroup {
    /// Create an empty group for the counters of `metadata`'s platform.
    pub fn new(metadata: &Metadata) -> Self {
        CoreGroup {
            fixed: vec![],
            general: Slots::new(metadata.num_general_purpose_counters),
            metric_names: BTreeSet::new(),
            support: FixedSupport {
                instructions: metadata.supports_fixed_instructions,
                cycles: metadata.supports_fixed_cycles,
                ref_cycles: metadata.supports_fixed_ref_cycles,
                tma: metadata.supports_fixed_tma,
            },
        }
    }

    /// Create an empty group serving `metric`.
    pub fn for_metric(metadata: &Metadata, metric: &str) -> Self {
        let mut group = CoreGroup::new(metadata);
        group.metric_names.insert(metric.to_string());
        group
    }

    /// Events on fixed-purpose counters, in counter order.
    pub fn fixed_events(&self) -> &[CoreEvent] {
        &self.fixed
    }

    /// Events on general-purpose counters, in counter order.
    pub fn general_events(&self) -> Vec<&CoreEvent> {
        self.general.iter().collect()
    }

    fn topdown_len(&self) -> usize {
        self.fixed.iter().take_while(|e| e.is_topdown()).count()
    }

    fn add_topdown(&mut self, event: CoreEvent) -> Result<()> {
        if !self.support.tma {
            debug!("Fixed TMA events not supported -- {}", event.name);
            return Err(Error::UnsupportedEvent(event.name));
        }
        if event.name == TOPDOWN_SLOTS {
            self.fixed.insert(0, event);
            return Ok(());
        }
        // Some formulas use PERF_METRICS events without the slots event they are read with.
        if !self.fixed.iter().any(|e| e.name == TOPDOWN_SLOTS) {
            if let Some(slots) = CoreEvent::synthetic(TOPDOWN_SLOTS) {
                self.fixed.insert(0, slots.clone());
            }
        }
        let pos = self.topdown_len();
        self.fixed.insert(pos, event);
        Ok(())
    }
}

impl CounterGroup for CoreGroup {
    type Event = CoreEvent;

    fn events(&self) -> Vec<&CoreEvent> {
        self.fixed.iter().chain(self.general.iter()).collect()
    }

    fn add_event(&mut self, event: CoreEvent, reorder: bool) -> Result<()> {
        if self.find_event_by_name(&event.name).is_some() {
            return Ok(());
        }
        if event.is_taken_alone() && self.events().iter().any(|e| e.is_taken_alone()) {
            return Err(Error::TakenAlone(event.name));
        }
        if event.is_offcore() && self.general.iter().filter(|e| e.is_offcore()).count() >= 2 {
            return Err(Error::OffcoreLimit(event.name));
        }
        if event.is_topdown() {
            return self.add_topdown(event);
        }
        if event.counter.trim().is_empty() {
            return Err(Error::NoCounters(event.name));
        }

        let mut legal = Counters::parse(&event.counter)?;
        if let Counters::Fixed(idx) = legal {
            let occupied = self.fixed.iter().any(|e| fixed_index(e) == Some(idx));
            if self.support.supports(idx) && !occupied {
                let pos = self
                    .fixed
                    .iter()
                    .position(|e| !e.is_topdown() && fixed_index(e).map_or(false, |i| i > idx))
                    .unwrap_or_else(|| self.fixed.len());
                self.fixed.insert(pos, event);
                return Ok(());
            }
            legal = Counters::any_general(self.general.len());
        }

        if !self.support.ref_cycles && event.name.starts_with(REF_TSC_PREFIX) {
            if let Some(existing) = self.general.iter().find(|e| e.name.starts_with(REF_TSC_PREFIX)) {
                return Err(Error::RefCyclesConflict {
                    event: event.name,
                    existing: existing.name.clone(),
                });
            }
        }
        self.general.place(event, legal, reorder)
    }

    fn metric_names(&self) -> &BTreeSet<String> {
        &self.metric_names
    }

    fn metric_names_mut(&mut self) -> &mut BTreeSet<String> {
        &mut self.metric_names
    }

    fn device_of(_event: &CoreEvent) -> String {
        String::new()
    }
}

/// Fixed counter order matters, general-purpose counter order does not.
impl PartialEq for CoreGroup {
    fn eq(&self, other: &Self) -> bool {
        self.fixed == other.fixed && self.general.same_events(&other.general)
    }
}

/// Events of one uncore device type collected together.
#[derive(Debug, Clone)]
pub struct UncoreGroup {
    general: Slots<UncoreEvent>,
    metric_names: BTreeSet<String>,
}

impl UncoreGroup {
    /// Create an empty group for the counters of `metadata`'s platform.
    pub fn new(metadata: &Metadata) -> Self {
        UncoreGroup {
            general: Slots::new(metadata.num_general_purpose_counters),
            metric_names: BTreeSet::new(),
        }
    }

    /// Create an empty group serving `metric`.
    pub fn for_metric(metadata: &Metadata, metric: &str) -> Self {
        let mut group = UncoreGroup::new(metadata);
        group.metric_names.insert(metric.to_string());
        group
    }

    /// Device type shared by the events of the group.
    pub fn unit(&self) -> Option<&str> {
        self.general.iter().next().map(|e| e.unit.as_str())
    }

    /// Check that the group is not empty and all its events share one device type.
    pub fn validate(&self) -> Result<()> {
        let unit = self.unit().ok_or(Error::EmptyGroup)?;
        match self.general.iter().find(|e| e.unit != unit) {
            Some(evt) => Err(Error::UnitMismatch {
                event: evt.name.clone(),
                expected: unit.to_string(),
                found: evt.unit.clone(),
            }),
            None => Ok(()),
        }
    }

    /// One copy of the group per device instance, with event names suffixed by the instance.
    pub fn expand(&self, device_ids: &[u32]) -> Result<Vec<UncoreGroup>> {
        self.validate()?;
        Ok(device_ids
            .iter()
            .map(|&id| {
                let mut group = self.clone();
                for slot in group.general.slots.iter_mut() {
                    if let Some((evt, _)) = slot {
                        *evt = evt.for_device(id);
                    }
                }
                group
            })
            .collect())
    }

    /// Remove an event from the group.
    pub fn remove_event(&mut self, name: &str) -> bool {
        self.general.remove(name)
    }
}

impl CounterGroup for UncoreGroup {
    type Event = UncoreEvent;

    fn events(&self) -> Vec<&UncoreEvent> {
        self.general.iter().collect()
    }

    fn add_event(&mut self, event: UncoreEvent, reorder: bool) -> Result<()> {
        if self.find_event_by_name(&event.name).is_some() {
            return Ok(());
        }
        if let Some(unit) = self.unit() {
            if unit != event.unit {
                return Err(Error::UnitMismatch {
                    expected: unit.to_string(),
                    found: event.unit,
                    event: event.name,
                });
            }
        }
        if event.counter.trim().is_empty() {
            return Err(Error::NoCounters(event.name));
        }
        let legal = Counters::parse(&event.counter)?;
        self.general.place(event, legal, reorder)
    }

    fn metric_names(&self) -> &BTreeSet<String> {
        &self.metric_names
    }

    fn metric_names_mut(&mut self) -> &mut BTreeSet<String> {
        &mut self.metric_names
    }

    fn device_of(event: &UncoreEvent) -> String {
        event.unit_name()
    }
}

impl PartialEq for UncoreGroup {
    fn eq(&self, other: &Self) -> bool {
        self.general.same_events(&other.general)
    }
}

/// Drop groups equal to an earlier group, keeping the union of their metric names.
pub fn eliminate_duplicate_groups<G: CounterGroup>(groups: Vec<G>) -> Vec<G> {
    let mut out: Vec<G> = Vec::with_capacity(groups.len());
    for group in groups {
        match out.iter_mut().find(|g| **g == group) {
            Some(existing) => existing
                .metric_names_mut()
                .extend(group.metric_names().iter().cloned()),
            None => out.push(group),
        }
    }
    out
}

/// Merge groups pairwise until no two groups can be merged.
pub fn merge_groups<G: CounterGroup>(mut groups: Vec<G>) -> Vec<G> {
    let before = groups.len();
    let mut merged = true;
    while merged {
        merged = false;
        let mut i = 0;
        while i < groups.len() {
            let mut j = i + 1;
            while j < groups.len() {
                let other = groups[j].clone();
                if groups[i].merge(&other).is_ok() {
                    groups.remove(j);
                    merged = true;
                } else {
                    j += 1;
                }
            }
            i += 1;
        }
    }
    info!("Merged {} event groups into {}", before, groups.len());
    groups
}

/// Keep each uncore event only in the first group that holds it. Emptied groups are dropped.
pub fn remove_duplicate_uncore_events(groups: Vec<UncoreGroup>) -> Vec<UncoreGroup> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut out = Vec::with_capacity(groups.len());
    for (i, mut group) in groups.into_iter().enumerate() {
        let names: Vec<String> = group.events().iter().map(|e| e.name.clone()).collect();
        for name in names {
            if !seen.insert(name.clone()) {
                debug!("Removing duplicate uncore event {} from group {}", name, i);
                group.remove_event(&name);
            }
        }
        if !group.is_empty() {
            out.push(group);
        }
    }
    out
}

/// Expand architectural uncore groups into one group per discovered device instance.
///
/// Groups of units without discovered devices are dropped.
pub fn expand_uncore_groups(groups: &[UncoreGroup], metadata: &Metadata) -> Result<Vec<UncoreGroup>> {
    let mut expanded = vec![];
    for group in groups {
        group.validate()?;
        let unit = group.unit().unwrap_or_default();
        match metadata.uncore_devices(unit) {
            Some(ids) if !ids.is_empty() => expanded.extend(group.expand(ids)?),
            _ => warn!("{}", Error::NoDevices(unit.to_string())),
        }
    }
    Ok(expanded)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata() -> Metadata {
        let mut md = Metadata::default();
        md.num_general_purpose_counters = 4;
        md.supports_fixed_instructions = true;
        md.supports_fixed_cycles = true;
        md.supports_fixed_ref_cycles = true;
        md.supports_fixed_tma = true;
        md.uncore_device_ids.insert("cha".into(), vec![0, 1, 2]);
        md
    }

    fn core(name: &str, counter: &str) -> CoreEvent {
        CoreEvent {
            name: name.into(),
            event_code: "0xc0".into(),
            umask: "0x01".into(),
            counter: counter.into(),
            ..CoreEvent::default()
        }
    }

    fn offcore(name: &str) -> CoreEvent {
        CoreEvent {
            offcore: "1".into(),
            ..core(name, "0,1,2,3")
        }
    }

    fn uncore(name: &str, unit: &str) -> UncoreEvent {
        UncoreEvent {
            name: name.into(),
            unit: unit.into(),
            event_code: "0x35".into(),
            umask: "0x01".into(),
            counter: "0,1,2,3".into(),
            ..UncoreEvent::default()
        }
    }

    #[test]
    fn test_find_after_add() {
        let mut group = CoreGroup::new(&metadata());
        let events = vec![
            core("INST_RETIRED.ANY", "Fixed counter 0"),
            core("BR_INST_RETIRED.ALL_BRANCHES", "0,1,2,3"),
            core("L1D.REPLACEMENT", "0,1"),
        ];
        for evt in events.iter() {
            group.add_event(evt.clone(), false).unwrap();
        }
        for evt in events.iter() {
            assert_eq!(group.find_event_by_name(&evt.name), Some(evt));
        }
        assert!(group.find_event_by_name("NOT_THERE").is_none());
        // Adding twice is a no-op.
        group.add_event(events[1].clone(), false).unwrap();
        assert_eq!(group.events().len(), 3);
    }

    #[test]
    fn test_fixed_event_rendered_first() {
        let mut group = CoreGroup::new(&metadata());
        group
            .add_event(core("BR_MISP_RETIRED.ALL_BRANCHES", "0,1,2,3"), false)
            .unwrap();
        group
            .add_event(core("CPU_CLK_UNHALTED.THREAD", "Fixed counter 1"), false)
            .unwrap();
        assert_eq!(group.fixed_events().len(), 1);
        assert_eq!(group.general_events().len(), 1);

        let def = group.to_group_definition();
        assert_eq!(def.len(), 2);
        assert_eq!(def[0].raw, "cpu-cycles");
        assert_eq!(def[0].name, "CPU_CLK_UNHALTED.THREAD");
        assert_eq!(def[1].name, "BR_MISP_RETIRED.ALL_BRANCHES");
        assert_eq!(
            def.perf_string(),
            "{cpu-cycles,cpu/event=0xc0,umask=0x01,name='BR_MISP_RETIRED.ALL_BRANCHES'/}"
        );
    }

    #[test]
    fn test_fixed_order_and_fallback() {
        let mut group = CoreGroup::new(&metadata());
        group
            .add_event(core("CPU_CLK_UNHALTED.REF_TSC", "Fixed counter 2"), false)
            .unwrap();
        group
            .add_event(core("INST_RETIRED.ANY", "Fixed counter 0"), false)
            .unwrap();
        let names: Vec<&str> = group.fixed_events().iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["INST_RETIRED.ANY", "CPU_CLK_UNHALTED.REF_TSC"]);

        // An occupied fixed counter falls back to the general-purpose counters.
        group
            .add_event(core("INST_RETIRED.ANY:c1", "Fixed counter 0"), false)
            .unwrap();
        assert_eq!(group.general_events().len(), 1);

        let mut md = metadata();
        md.supports_fixed_instructions = false;
        let mut group = CoreGroup::new(&md);
        group
            .add_event(core("INST_RETIRED.ANY", "Fixed counter 0"), false)
            .unwrap();
        assert!(group.fixed_events().is_empty());
        assert_eq!(group.general_events().len(), 1);
    }

    #[test]
    fn test_ref_cycles_conflict() {
        let mut md = metadata();
        md.supports_fixed_ref_cycles = false;
        let mut group = CoreGroup::new(&md);
        group
            .add_event(core("CPU_CLK_UNHALTED.REF_TSC", "Fixed counter 2"), false)
            .unwrap();
        match group.add_event(core("CPU_CLK_UNHALTED.REF_TSC_P:SUP", "0,1,2,3"), false) {
            Err(Error::RefCyclesConflict { existing, .. }) => {
                assert_eq!(existing, "CPU_CLK_UNHALTED.REF_TSC")
            }
            x => panic!("unexpected {:?}", x),
        }
    }

    #[test]
    fn test_topdown_block() {
        let mut group = CoreGroup::new(&metadata());
        group
            .add_event(core("INST_RETIRED.ANY", "Fixed counter 0"), false)
            .unwrap();
        let retiring = CoreEvent::synthetic("PERF_METRICS.RETIRING").unwrap().clone();
        let bad_spec = CoreEvent::synthetic("PERF_METRICS.BAD_SPECULATION").unwrap().clone();
        group.add_event(retiring, false).unwrap();
        group.add_event(bad_spec, false).unwrap();
        let names: Vec<&str> = group.fixed_events().iter().map(|e| e.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                TOPDOWN_SLOTS,
                "PERF_METRICS.RETIRING",
                "PERF_METRICS.BAD_SPECULATION",
                "INST_RETIRED.ANY"
            ]
        );

        let mut md = metadata();
        md.supports_fixed_tma = false;
        let mut group = CoreGroup::new(&md);
        let slots = CoreEvent::synthetic(TOPDOWN_SLOTS).unwrap().clone();
        assert!(matches!(
            group.add_event(slots, false),
            Err(Error::UnsupportedEvent(_))
        ));
    }

    #[test]
    fn test_taken_alone_and_offcore_limits() {
        let mut group = CoreGroup::new(&metadata());
        let mut alone = core("MEM_TRANS_RETIRED.LOAD_LATENCY", "0,1,2,3");
        alone.taken_alone = "1".into();
        let mut alone2 = core("FRONTEND_RETIRED.DSB_MISS", "0,1,2,3");
        alone2.taken_alone = "true".into();
        group.add_event(alone, false).unwrap();
        assert!(matches!(
            group.add_event(alone2, false),
            Err(Error::TakenAlone(_))
        ));

        group.add_event(offcore("OCR.A"), false).unwrap();
        group.add_event(offcore("OCR.B"), false).unwrap();
        match group.add_event(offcore("OCR.C"), false) {
            Err(Error::OffcoreLimit(name)) => assert_eq!(name, "OCR.C"),
            x => panic!("unexpected {:?}", x),
        }
        assert_eq!(group.events().iter().filter(|e| e.is_offcore()).count(), 2);
        assert_eq!(group.events().iter().filter(|e| e.is_taken_alone()).count(), 1);
    }

    #[test]
    fn test_reorder() {
        let mut md = metadata();
        md.num_general_purpose_counters = 2;
        let mut group = CoreGroup::new(&md);
        group.add_event(core("A", "0,1"), false).unwrap();
        // Counter 0 is taken by A and B can only use counter 0.
        assert!(matches!(
            group.add_event(core("B", "0"), false),
            Err(Error::CounterUnavailable { .. })
        ));
        group.add_event(core("B", "0"), true).unwrap();
        let names: Vec<&str> = group.general_events().iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["B", "A"]);
        assert!(matches!(
            group.add_event(core("C", "0,1"), true),
            Err(Error::CounterUnavailable { .. })
        ));
    }

    #[test]
    fn test_equal() {
        let md = metadata();
        let mut a = CoreGroup::for_metric(&md, "a");
        let mut b = CoreGroup::for_metric(&md, "b");
        a.add_event(core("X", "0,1,2,3"), false).unwrap();
        a.add_event(core("Y", "0,1,2,3"), false).unwrap();
        b.add_event(core("Y", "0,1,2,3"), false).unwrap();
        b.add_event(core("X", "0,1,2,3"), false).unwrap();
        assert_eq!(a, a);
        assert_eq!(a, b);
        assert_eq!(b, a);

        // Same fixed events in a different order differ.
        let mut c = a.clone();
        let mut d = b.clone();
        c.fixed = vec![core("I", "Fixed counter 0"), core("C", "Fixed counter 1")];
        d.fixed = vec![core("C", "Fixed counter 1"), core("I", "Fixed counter 0")];
        assert_ne!(c, d);

        b.add_event(core("Z", "0,1,2,3"), false).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_merge_is_atomic() {
        let mut md = metadata();
        md.num_general_purpose_counters = 2;
        let mut a = CoreGroup::for_metric(&md, "a");
        a.add_event(core("X", "0,1"), false).unwrap();
        let mut b = CoreGroup::for_metric(&md, "b");
        b.add_event(core("Y", "0,1"), false).unwrap();
        b.add_event(core("Z", "0,1"), false).unwrap();

        let before = a.clone();
        assert!(a.merge(&b).is_err());
        assert_eq!(a, before);
        assert_eq!(a.metric_names().len(), 1);

        let mut c = CoreGroup::for_metric(&md, "c");
        c.add_event(core("Y", "0,1"), false).unwrap();
        a.merge(&c).unwrap();
        assert_eq!(a.events().len(), 2);
        assert!(a.metric_names().contains("c"));
    }

    #[test]
    fn test_group_set_reduction() {
        let md = metadata();
        let mut groups = vec![];
        for (metric, evts) in &[
            ("m1", vec!["A", "B"]),
            ("m2", vec!["B", "A"]),
            ("m3", vec!["C", "D"]),
            ("m4", vec!["E", "F", "G"]),
        ] {
            let mut g = CoreGroup::for_metric(&md, metric);
            for e in evts {
                g.add_event(core(e, "0,1,2,3"), false).unwrap();
            }
            groups.push(g);
        }
        let groups = eliminate_duplicate_groups(groups);
        assert_eq!(groups.len(), 3);
        assert_eq!(groups[0].metric_names().len(), 2);

        let merged = merge_groups(groups);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].events().len(), 4);
        // No further merge is possible.
        assert_eq!(merge_groups(merged.clone()), merged);
    }

    #[test]
    fn test_uncore_group() {
        let md = metadata();
        let mut group = UncoreGroup::for_metric(&md, "m");
        let a = uncore("UNCCTI.IMD", "CHA");
        group.add_event(a.clone(), false).unwrap();
        assert_eq!(group.find_event_by_name("UNCCTI.IMD"), Some(&a));
        match group.add_event(uncore("UNC_M_CAS_COUNT.RD", "IMC"), false) {
            Err(Error::UnitMismatch { expected, found, .. }) => {
                assert_eq!(expected, "CHA");
                assert_eq!(found, "IMC");
            }
            x => panic!("unexpected {:?}", x),
        }
        group.add_event(uncore("UNCCCT", "CHA"), false).unwrap();
        assert!(group.validate().is_ok());
        assert!(matches!(
            UncoreGroup::new(&md).validate(),
            Err(Error::EmptyGroup)
        ));

        let expanded = group.expand(&[0, 1]).unwrap();
        assert_eq!(expanded.len(), 2);
        let def = expanded[1].to_group_definition();
        assert_eq!(def[0].name, "UNCCTI.IMD.1");
        assert_eq!(def[0].device, "cha");
        assert!(def[0].raw.starts_with("uncore_cha_1/"));
    }

    #[test]
    fn test_uncore_reduction() {
        let md = metadata();
        let mut g1 = UncoreGroup::for_metric(&md, "m1");
        g1.add_event(uncore("UNCCCT", "CHA"), false).unwrap();
        g1.add_event(uncore("UNCCTI.IMD", "CHA"), false).unwrap();
        let mut g2 = UncoreGroup::for_metric(&md, "m2");
        g2.add_event(uncore("UNCCCT", "CHA"), false).unwrap();
        let mut g3 = UncoreGroup::for_metric(&md, "m3");
        g3.add_event(uncore("UNC_M_CAS_COUNT.RD", "IMC"), false).unwrap();

        let groups = remove_duplicate_uncore_events(vec![g1, g2, g3]);
        assert_eq!(groups.len(), 2);

        // The imc group has no devices on this platform and is dropped.
        let expanded = expand_uncore_groups(&groups, &md).unwrap();
        assert_eq!(expanded.len(), 3);
        assert!(expanded.iter().all(|g| g.unit() == Some("CHA")));
    }
}

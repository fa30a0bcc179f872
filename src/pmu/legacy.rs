//! Event definition files in the legacy line-oriented text format.
//!
//! Every line holds one event in `perf stat -e` syntax, terminated by `,` when the group goes on
//! or by `;` when it ends:
//!
//! ```text
//! # IPC
//! cpu/event=0xc0,umask=0x00,name='INST_RETIRED.ANY'/,
//! cpu-cycles;
//! cha/event=0x35,umask=0xc80ffe01,name='UNC_CHA_TOR_INSERTS.IA_MISS_CRD'/;
//! ```

use crate::config::{CollectionMode, Granularity};
use crate::metadata::Metadata;
use crate::pmu::{abbreviate_event_name, EventDefinition, GroupDefinition, PERF_METRICS_PREFIX};
use crate::{Error, Result};
use lazy_static::lazy_static;
use log::{debug, warn};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

lazy_static! {
    static ref UNCORE_RAW: regex::Regex = regex::Regex::new(
        r"(\w+)/event=(0x[0-9a-fA-F]+),umask=(0x[0-9a-fA-F]+.*),name='(.*)'"
    )
    .unwrap();
}

const CPU_UNIT: &str = "cpu";
const AMD_VENDOR: &str = "AuthenticAMD";
const PEBS_EVENTS: &[&str] = &["INT_MISC.UNKNOWN_BRANCH_CYCLES", "UOPS_RETIRED.MS"];
const OFFCORE_PREFIXES: &[&str] = &["OCR", "OFFCORE_REQUESTS_OUTSTANDING"];

/// Parse one event, without its terminator.
///
/// The unit before the first `/` becomes the device, except for core events.
pub fn parse_event_definition(line: &str) -> Result<EventDefinition> {
    let fields: Vec<&str> = line.split(',').collect();
    if fields.len() == 1 {
        return Ok(EventDefinition {
            raw: line.to_string(),
            name: line.to_string(),
            device: String::new(),
        });
    }

    let name_field = fields[fields.len() - 1];
    let name = name_field
        .strip_prefix("name=")
        .and_then(|n| n.split('\'').nth(1))
        .filter(|n| !n.is_empty())
        .ok_or_else(|| Error::ParseEventDefinition(line.to_string()))?;
    let unit = fields[0].split('/').next().unwrap_or_default();
    Ok(EventDefinition {
        raw: line.to_string(),
        name: name.to_string(),
        device: if unit == CPU_UNIT || unit == fields[0] {
            String::new()
        } else {
            unit.to_string()
        },
    })
}

/// Check if an event of a legacy definition file can be collected on the platform.
pub fn is_collectable(def: &EventDefinition, metadata: &Metadata, mode: CollectionMode) -> bool {
    let name = def.name.as_str();
    if !metadata.supports_fixed_tma && (name == "TOPDOWN.SLOTS" || name.starts_with(PERF_METRICS_PREFIX)) {
        debug!("Fixed TMA events not supported -- {}", name);
        return false;
    }
    if !metadata.supports_pebs && PEBS_EVENTS.iter().any(|p| name.contains(p)) {
        debug!("PEBS events not supported -- {}", name);
        return false;
    }

    if def.raw.starts_with("cpu/") {
        if !OFFCORE_PREFIXES.iter().any(|p| name.starts_with(p)) {
            return true;
        }
        if !(metadata.supports_ocr && metadata.supports_uncore) {
            debug!("Off-core response events not supported -- {}", name);
            return false;
        }
        if !mode.scope.is_system_wide() {
            debug!("Off-core response events not supported outside system scope -- {}", name);
            return false;
        }
        return true;
    }

    if mode.granularity == Granularity::Cpu && name.starts_with("UNC") {
        debug!("Uncore events not supported at CPU granularity -- {}", name);
        return false;
    }
    if !metadata.supports_uncore && name.starts_with("UNC") {
        debug!("Uncore events not supported on target -- {}", name);
        return false;
    }
    if !def.device.is_empty() {
        if !mode.scope.is_system_wide() {
            debug!("Uncore events not supported outside system scope -- {}", name);
            return false;
        }
        if !metadata.uncore_device_ids.contains_key(&def.device) {
            debug!("Uncore device not found -- {}", def.device);
            return false;
        }
        if !def.raw.contains("umask") && !def.raw.contains("event") {
            debug!("Uncore event missing umask or event -- {}", name);
            return false;
        }
        return true;
    }

    if !metadata.supports_ref_cycles && name.contains("ref-cycles") {
        debug!("Ref-cycles not supported -- {}", name);
        return false;
    }
    if !mode.scope.is_system_wide() && (name.contains("cstate_") || name.contains("power/energy")) {
        debug!("Cstate and power events not supported outside system scope -- {}", name);
        return false;
    }
    if mode.granularity == Granularity::Cpu
        && (name.contains("power/energy") || name.contains("cstate_pkg"))
    {
        debug!("Package power and cstate events not supported at CPU granularity -- {}", name);
        return false;
    }
    let base = name.split(':').next().unwrap_or_default();
    if !metadata.perf_supported_events.contains(base) {
        debug!("Event not supported by perf -- {}", base);
        return false;
    }
    true
}

/// Rewrite one uncore event for a single device instance.
fn expand_uncore_event(def: &EventDefinition, id: u32, vendor: &str) -> Result<EventDefinition> {
    let caps = UNCORE_RAW
        .captures(&def.raw)
        .ok_or_else(|| Error::ParseEventDefinition(def.raw.clone()))?;
    let (unit, event, umask, name) = (&caps[1], &caps[2], &caps[3], &caps[4]);
    let (raw, name) = if vendor == AMD_VENDOR {
        (
            format!("amd_{}/event={},umask={},name='{}'/", unit, event, umask, name),
            name.to_string(),
        )
    } else {
        let name = format!("{}.{}", name, id);
        (
            format!(
                "uncore_{}_{}/event={},umask={},name='{}'/",
                unit, id, event, umask, name
            ),
            name,
        )
    };
    Ok(EventDefinition {
        raw,
        name,
        device: def.device.clone(),
    })
}

/// Replace every group of uncore events with one group per discovered device instance.
///
/// Groups hold events of one device type only. Groups of device types without instances are
/// dropped.
pub fn expand_uncore_definitions(
    groups: Vec<GroupDefinition>,
    metadata: &Metadata,
) -> Result<Vec<GroupDefinition>> {
    let mut expanded = vec![];
    for group in groups {
        let device = match group.iter().next() {
            Some(def) => def.device.clone(),
            None => continue,
        };
        let ids = match metadata.uncore_device_ids.get(&device) {
            Some(ids) => ids,
            None => {
                expanded.push(group);
                continue;
            }
        };
        if ids.is_empty() {
            warn!("{}", Error::NoDevices(device));
            continue;
        }
        for &id in ids {
            let events = group
                .iter()
                .map(|def| expand_uncore_event(def, id, &metadata.vendor))
                .collect::<Result<Vec<_>>>()?;
            expanded.push(GroupDefinition::from(events));
        }
    }
    Ok(expanded)
}

/// Parse a legacy event definition file.
///
/// Returns the collectable groups, expanded per uncore device, and the names of the events that
/// were left out.
pub fn parse_event_groups(
    text: &str,
    metadata: &Metadata,
    mode: CollectionMode,
) -> Result<(Vec<GroupDefinition>, Vec<String>)> {
    let mut groups = vec![];
    let mut uncollectable = BTreeSet::new();
    let mut group: Vec<EventDefinition> = vec![];

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.split('#').next().unwrap_or_default().trim();
        let (body, end_of_group) = match line.chars().last() {
            Some(',') => (&line[..line.len() - 1], false),
            Some(';') => (&line[..line.len() - 1], true),
            _ => return Err(Error::ParseEventDefinition(line.to_string())),
        };

        let mut def = parse_event_definition(body)?;
        def.name = abbreviate_event_name(&def.name);
        def.raw = abbreviate_event_name(&def.raw);
        if is_collectable(&def, metadata, mode) {
            group.push(def);
        } else {
            uncollectable.insert(def.name);
        }

        if end_of_group {
            if group.is_empty() {
                debug!("No collectable events in group ending with {}", line);
            } else {
                groups.push(GroupDefinition::from(std::mem::take(&mut group)));
            }
        }
    }
    if !group.is_empty() {
        groups.push(GroupDefinition::from(group));
    }

    if !uncollectable.is_empty() {
        debug!("Events not collectable on target -- {:?}", uncollectable);
    }
    let groups = expand_uncore_definitions(groups, metadata)?;
    Ok((groups, uncollectable.into_iter().collect()))
}

/// Load a legacy event definition file.
pub fn load_event_groups<P: AsRef<Path>>(
    path: P,
    metadata: &Metadata,
    mode: CollectionMode,
) -> Result<(Vec<GroupDefinition>, Vec<String>)> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|source| Error::ReadFile {
        path: path.to_path_buf(),
        source,
    })?;
    parse_event_groups(&text, metadata, mode)
}

/// Locate `events/<arch>/<vendor>/<uarch>[_nofixedtma].txt` under `root`.
pub fn resolve(root: &Path, metadata: &Metadata) -> Result<PathBuf> {
    let dir = root
        .join("events")
        .join(&metadata.architecture)
        .join(&metadata.vendor);
    let uarch = metadata.uarch_key();
    let default = dir.join(format!("{}.txt", uarch));
    if !metadata.supports_fixed_tma {
        let alternate = dir.join(format!("{}_nofixedtma.txt", uarch));
        if alternate.is_file() {
            return Ok(alternate);
        }
    }
    if default.is_file() {
        Ok(default)
    } else {
        Err(Error::ResourceNotFound(default))
    }
}

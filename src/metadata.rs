//! Description of the platform counters are collected on.

use serde::Deserialize;
use std::collections::HashMap;

/// Platform state and capabilities gathered before a collection session.
///
/// This is produced by the target probing layer and is immutable for the lifetime of a session.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Metadata {
    /// Instruction set architecture, e.g. `x86_64`.
    pub architecture: String,
    /// CPU vendor, e.g. `GenuineIntel`.
    pub vendor: String,
    /// Microarchitecture, e.g. `SPR_XCC`.
    pub microarchitecture: String,
    /// Number of sockets.
    pub socket_count: u32,
    /// Physical cores per socket.
    pub cores_per_socket: u32,
    /// Hardware threads per core.
    pub threads_per_core: u32,
    /// Programmable counters per logical CPU.
    pub num_general_purpose_counters: usize,
    /// Fixed counter 0 counts retired instructions.
    pub supports_fixed_instructions: bool,
    /// Fixed counter 1 counts unhalted core cycles.
    pub supports_fixed_cycles: bool,
    /// Fixed counter 2 counts reference cycles.
    pub supports_fixed_ref_cycles: bool,
    /// Topdown slots and `PERF_METRICS` are available on fixed counters.
    pub supports_fixed_tma: bool,
    /// Off-core response events can be programmed.
    pub supports_ocr: bool,
    /// Uncore PMUs are exposed.
    pub supports_uncore: bool,
    /// Precise event based sampling is usable.
    pub supports_pebs: bool,
    /// The `ref-cycles` event is usable.
    pub supports_ref_cycles: bool,
    /// Uncore device type to discovered device instance indices.
    pub uncore_device_ids: HashMap<String, Vec<u32>>,
    /// Event names reported by `perf list`.
    pub perf_supported_events: String,
    /// Time stamp counter ticks per second summed over the system.
    pub tsc: u64,
    /// Time stamp counter frequency.
    pub tsc_frequency_hz: u64,
}

impl Metadata {
    /// Short microarchitecture key used to locate resource files, e.g. `spr` for `SPR_XCC`.
    pub fn uarch_key(&self) -> String {
        let lower = self.microarchitecture.to_lowercase();
        lower
            .split(|c: char| c == '_' || c == ' ')
            .next()
            .unwrap_or_default()
            .to_string()
    }

    /// Logical CPUs in the system.
    #[inline]
    pub fn logical_cpu_count(&self) -> u32 {
        self.socket_count * self.cores_per_socket * self.threads_per_core
    }

    /// Whether simultaneous multithreading is enabled.
    #[inline]
    pub fn hyperthreading_on(&self) -> bool {
        self.threads_per_core > 1
    }

    /// Device indices of an uncore unit, matched case-insensitively on the unit's first word.
    pub fn uncore_devices(&self, unit: &str) -> Option<&Vec<u32>> {
        let unit = unit.split(' ').next().unwrap_or_default();
        self.uncore_device_ids
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(unit))
            .map(|(_, ids)| ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uarch_key() {
        let mut md = Metadata::default();
        md.microarchitecture = "SPR_XCC".into();
        assert_eq!(md.uarch_key(), "spr");
        md.microarchitecture = "GNR X2".into();
        assert_eq!(md.uarch_key(), "gnr");
        md.microarchitecture = "ICX".into();
        assert_eq!(md.uarch_key(), "icx");
    }

    #[test]
    fn test_metadata_from_json() {
        let md: Metadata = serde_json::from_str(
            r#"{"architecture": "x86_64", "threads_per_core": 2,
                "uncore_device_ids": {"cha": [0, 1, 2]}}"#,
        )
        .unwrap();
        assert!(md.hyperthreading_on());
        assert_eq!(md.uncore_devices("CHA"), Some(&vec![0, 1, 2]));
        assert_eq!(md.uncore_devices("imc"), None);
        assert_eq!(md.num_general_purpose_counters, 0);
    }
}

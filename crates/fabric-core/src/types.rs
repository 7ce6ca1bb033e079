use fabric_io::{LinkDynPatch, LinkSpec, NodeDescriptor, NodeDynPatch};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Slack used when comparing requested resources against free capacity, so
/// float accumulation never refuses an exact fit.
pub const EPSILON: f64 = 1e-9;

/// Canonical undirected link key: endpoints sorted, joined with `|`.
pub fn link_key(a: &str, b: &str) -> String {
    if a <= b {
        format!("{a}|{b}")
    } else {
        format!("{b}|{a}")
    }
}

pub fn clamp(x: f64, lo: f64, hi: f64) -> f64 {
    x.max(lo).min(hi)
}

pub fn utc_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Mutable runtime-only fields for a node, separate from the descriptor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeDyn {
    pub down: bool,
    pub thermal_derate: f64,
    pub power_cap_w: Option<f64>,
    pub clock_skew_ms: Option<f64>,
    pub packet_dup: Option<f64>,
    pub packet_reorder: Option<f64>,
    pub used_cpu_cores: f64,
    pub used_mem_gb: f64,
    pub used_gpu_vram_gb: f64,
    pub reservations: BTreeMap<String, Reservation>,
}

impl NodeDyn {
    pub fn apply_patch(&mut self, patch: &NodeDynPatch) {
        if let Some(down) = patch.down {
            self.down = down;
        }
        if let Some(derate) = patch.thermal_derate {
            self.thermal_derate = derate;
        }
        if patch.power_cap_w.is_some() {
            self.power_cap_w = patch.power_cap_w;
        }
        if patch.clock_skew_ms.is_some() {
            self.clock_skew_ms = patch.clock_skew_ms;
        }
        if patch.packet_dup.is_some() {
            self.packet_dup = patch.packet_dup;
        }
        if patch.packet_reorder.is_some() {
            self.packet_reorder = patch.packet_reorder;
        }
    }

    /// Return one field to its default, used when an override is withdrawn.
    pub fn reset_field(&mut self, field: &str) {
        match field {
            "down" => self.down = false,
            "thermal_derate" => self.thermal_derate = 0.0,
            "power_cap_w" => self.power_cap_w = None,
            "clock_skew_ms" => self.clock_skew_ms = None,
            "packet_dup" => self.packet_dup = None,
            "packet_reorder" => self.packet_reorder = None,
            _ => {}
        }
    }

    /// Dump the non-default fault fields as an override patch. Usage
    /// counters and reservations never travel through the override channel.
    pub fn to_patch(&self) -> NodeDynPatch {
        NodeDynPatch {
            down: if self.down { Some(true) } else { None },
            thermal_derate: (self.thermal_derate != 0.0).then_some(self.thermal_derate),
            power_cap_w: self.power_cap_w,
            clock_skew_ms: self.clock_skew_ms,
            packet_dup: self.packet_dup,
            packet_reorder: self.packet_reorder,
        }
    }
}

/// A recorded commitment of resources on one node. The id handed back by
/// the store is the only handle; the node owns the record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Reservation {
    pub cpu_cores: f64,
    pub mem_gb: f64,
    pub gpu_vram_gb: f64,
    pub ts_ms: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReserveRequest {
    pub node: String,
    pub cpu_cores: f64,
    pub mem_gb: f64,
    pub gpu_vram_gb: f64,
}

/// Mutable runtime-only fields for a link.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LinkDyn {
    pub down: bool,
    pub speed_gbps: Option<f64>,
    pub rtt_ms: Option<f64>,
    pub jitter_ms: Option<f64>,
    pub loss_pct: Option<f64>,
    pub ecn: Option<bool>,
}

impl LinkDyn {
    pub fn apply_patch(&mut self, patch: &LinkDynPatch) {
        if let Some(down) = patch.down {
            self.down = down;
        }
        if patch.speed_gbps.is_some() {
            self.speed_gbps = patch.speed_gbps;
        }
        if patch.rtt_ms.is_some() {
            self.rtt_ms = patch.rtt_ms;
        }
        if patch.jitter_ms.is_some() {
            self.jitter_ms = patch.jitter_ms;
        }
        if patch.loss_pct.is_some() {
            self.loss_pct = patch.loss_pct;
        }
        if patch.ecn.is_some() {
            self.ecn = patch.ecn;
        }
    }

    pub fn reset_field(&mut self, field: &str) {
        match field {
            "down" => self.down = false,
            "speed_gbps" => self.speed_gbps = None,
            "rtt_ms" => self.rtt_ms = None,
            "jitter_ms" => self.jitter_ms = None,
            "loss_pct" => self.loss_pct = None,
            "ecn" => self.ecn = None,
            _ => {}
        }
    }

    pub fn to_patch(&self) -> LinkDynPatch {
        LinkDynPatch {
            down: if self.down { Some(true) } else { None },
            speed_gbps: self.speed_gbps,
            rtt_ms: self.rtt_ms,
            jitter_ms: self.jitter_ms,
            loss_pct: self.loss_pct,
            ecn: self.ecn,
        }
    }
}

/// Static link metrics as declared in the topology; absent fields fall
/// through to the topology-wide network defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LinkBase {
    pub speed_gbps: Option<f64>,
    pub rtt_ms: Option<f64>,
    pub jitter_ms: Option<f64>,
    pub loss_pct: Option<f64>,
    pub ecn: Option<bool>,
}

impl LinkBase {
    pub fn from_spec(spec: &LinkSpec) -> Self {
        Self {
            speed_gbps: spec.speed_gbps,
            rtt_ms: spec.rtt_ms,
            jitter_ms: spec.jitter_ms,
            loss_pct: spec.loss_pct,
            ecn: spec.ecn,
        }
    }
}

/// Resolved, ready-to-use metrics for one hop: dyn over base over defaults.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LinkMetrics {
    pub down: bool,
    pub speed_gbps: f64,
    pub rtt_ms: f64,
    pub jitter_ms: f64,
    pub loss_pct: f64,
    pub ecn: bool,
    /// True when no explicit link exists and the metrics were synthesised
    /// from the endpoints' declared network hints.
    pub estimated: bool,
}

impl LinkMetrics {
    /// Metrics for staying on the same node: free and instantaneous.
    pub fn loopback() -> Self {
        Self {
            down: false,
            speed_gbps: f64::INFINITY,
            rtt_ms: 0.0,
            jitter_ms: 0.0,
            loss_pct: 0.0,
            ecn: false,
            estimated: true,
        }
    }
}

/// Capacity cache derived from the descriptor once at load time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeCaps {
    pub cpu_units: f64,
    pub max_cpu_cores: f64,
    pub ram_gb: f64,
    pub gpu_vram_gb: f64,
}

impl NodeCaps {
    pub fn from_descriptor(desc: &NodeDescriptor) -> Self {
        let cores = desc.cpu.cores;
        Self {
            cpu_units: cores * desc.cpu.base_ghz,
            max_cpu_cores: cores,
            ram_gb: desc.memory.ram_gb,
            gpu_vram_gb: desc.gpu.vram_gb,
        }
    }
}

/// Remaining capacity after thermal derate (CPU only) and reservations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct EffectiveCaps {
    pub max_cpu_cores: f64,
    pub max_mem_gb: f64,
    pub max_gpu_vram_gb: f64,
    pub free_cpu_cores: f64,
    pub free_mem_gb: f64,
    pub free_gpu_vram_gb: f64,
}

impl EffectiveCaps {
    pub fn compute(caps: &NodeCaps, dyn_state: &NodeDyn) -> Self {
        let derate = clamp(dyn_state.thermal_derate, 0.0, 1.0);
        let eff_cpu = caps.max_cpu_cores * (1.0 - derate);
        Self {
            max_cpu_cores: caps.max_cpu_cores,
            max_mem_gb: caps.ram_gb,
            max_gpu_vram_gb: caps.gpu_vram_gb,
            free_cpu_cores: (eff_cpu - dyn_state.used_cpu_cores).max(0.0),
            free_mem_gb: (caps.ram_gb - dyn_state.used_mem_gb).max(0.0),
            free_gpu_vram_gb: (caps.gpu_vram_gb - dyn_state.used_gpu_vram_gb).max(0.0),
        }
    }
}

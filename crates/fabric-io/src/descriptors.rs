use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::warn;

use crate::parse::{label_string, lenient_f64, lenient_opt_f64};
use crate::IoError;

pub type Labels = BTreeMap<String, Value>;

/// Static per-node descriptor as authored in `nodes/*.yaml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeDescriptor {
    pub name: String,
    pub arch: Option<String>,
    pub class: Option<String>,
    pub formats_supported: Vec<String>,
    pub labels: Labels,
    pub cpu: CpuSpec,
    pub memory: MemorySpec,
    pub gpu: GpuSpec,
    pub accelerators: AcceleratorSpec,
    pub storage: StorageSpec,
    pub health: HealthSpec,
    pub power: PowerSpec,
    pub network: NodeNetworkSpec,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CpuSpec {
    #[serde(deserialize_with = "lenient_f64")]
    pub cores: f64,
    #[serde(deserialize_with = "lenient_f64")]
    pub base_ghz: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MemorySpec {
    #[serde(deserialize_with = "lenient_f64")]
    pub ram_gb: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GpuSpec {
    #[serde(deserialize_with = "lenient_f64")]
    pub vram_gb: f64,
    #[serde(deserialize_with = "lenient_f64")]
    pub accel_score: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AcceleratorSpec {
    #[serde(deserialize_with = "lenient_f64")]
    pub npu_tops: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSpec {
    #[serde(deserialize_with = "lenient_f64")]
    pub tbw_pct_used: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSpec {
    #[serde(deserialize_with = "lenient_f64")]
    pub thermal_derate: f64,
    #[serde(deserialize_with = "lenient_f64")]
    pub last_week_crashes: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PowerSpec {
    #[serde(deserialize_with = "lenient_opt_f64")]
    pub tdp_w: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeNetworkSpec {
    #[serde(deserialize_with = "lenient_opt_f64")]
    pub speed_gbps: Option<f64>,
    #[serde(deserialize_with = "lenient_opt_f64")]
    pub base_bandwidth_mbps: Option<f64>,
    #[serde(deserialize_with = "lenient_opt_f64")]
    pub base_latency_ms: Option<f64>,
    #[serde(deserialize_with = "lenient_opt_f64")]
    pub loss_pct: Option<f64>,
}

impl NodeDescriptor {
    pub fn label(&self, key: &str) -> Option<String> {
        label_string(&self.labels, key)
    }

    pub fn trust(&self) -> Option<f64> {
        self.labels
            .get("trust")
            .map(|v| crate::parse::safe_float(v, f64::NAN))
            .filter(|v| v.is_finite())
    }

    pub fn supports_format(&self, format: &str) -> bool {
        self.formats_supported.iter().any(|f| f == format)
    }

    /// Declared link speed in Gbps, honouring the legacy `base_bandwidth_mbps`
    /// spelling some descriptor generators still emit.
    pub fn declared_speed_gbps(&self) -> Option<f64> {
        if let Some(spd) = self.network.speed_gbps {
            return Some(spd);
        }
        self.network
            .base_bandwidth_mbps
            .filter(|bw| *bw > 0.0)
            .map(|bw| bw / 1000.0)
    }
}

pub fn load_node_file(path: &Path) -> Result<NodeDescriptor, IoError> {
    let text = std::fs::read_to_string(path).map_err(|source| IoError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_yaml::from_str(&text).map_err(|e| IoError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

/// Load every `*.yaml` descriptor under `dir`, sorted by file name. Files
/// that fail to parse or carry no `name` are skipped with a warning so one
/// bad descriptor never takes down the fabric view.
pub fn load_nodes_dir(dir: &Path) -> Result<Vec<NodeDescriptor>, IoError> {
    let mut paths: Vec<_> = std::fs::read_dir(dir)
        .map_err(|source| IoError::Read {
            path: dir.to_path_buf(),
            source,
        })?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().map(|ext| ext == "yaml").unwrap_or(false))
        .collect();
    paths.sort();

    let mut nodes = Vec::new();
    for path in paths {
        match load_node_file(&path) {
            Ok(desc) if desc.name.is_empty() => {
                warn!(path = %path.display(), "skipping node descriptor without a name");
            }
            Ok(desc) => nodes.push(desc),
            Err(e) => warn!(path = %path.display(), error = %e, "failed to load node descriptor"),
        }
    }
    Ok(nodes)
}

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::parse::{lenient_opt_f64, lenient_opt_string};
use crate::IoError;

/// Fabric topology document: network defaults, explicit links, and chaos
/// scenarios. Everything is optional; an absent topology file simply means
/// all link metrics come from defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TopologyDoc {
    pub defaults: TopologyDefaults,
    pub links: Vec<LinkSpec>,
    pub scenarios: Vec<ScenarioSpec>,
    pub chaos: Vec<ChaosEventSpec>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TopologyDefaults {
    pub network: NetworkDefaults,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkDefaults {
    pub speed_gbps: f64,
    pub rtt_ms: f64,
    pub jitter_ms: f64,
    pub loss_pct: f64,
}

impl Default for NetworkDefaults {
    fn default() -> Self {
        Self {
            speed_gbps: 1.0,
            rtt_ms: 5.0,
            jitter_ms: 0.5,
            loss_pct: 0.0,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkSpec {
    pub a: String,
    pub b: String,
    #[serde(deserialize_with = "lenient_opt_f64")]
    pub speed_gbps: Option<f64>,
    #[serde(deserialize_with = "lenient_opt_f64")]
    pub rtt_ms: Option<f64>,
    #[serde(deserialize_with = "lenient_opt_f64")]
    pub jitter_ms: Option<f64>,
    #[serde(deserialize_with = "lenient_opt_f64")]
    pub loss_pct: Option<f64>,
    pub ecn: Option<bool>,
    pub profile: Option<String>,
    pub qos_class: Option<String>,
    pub scope: Option<String>,
    pub subnet: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ScenarioSpec {
    pub name: String,
    pub chaos: Vec<ChaosEventSpec>,
}

/// One raw chaos entry as authored in the topology document. The chaos
/// engine compiles these into typed scheduled actions; here they stay flat
/// so authors can mix link, node, and group fields freely.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChaosEventSpec {
    pub kind: String,
    pub at_s: f64,
    pub duration_s: f64,
    pub a: Option<String>,
    pub b: Option<String>,
    pub node: Option<String>,
    #[serde(deserialize_with = "lenient_opt_string")]
    pub label: Option<String>,
    #[serde(deserialize_with = "lenient_opt_string")]
    pub value: Option<String>,
    #[serde(alias = "other", deserialize_with = "lenient_opt_string")]
    pub value_b: Option<String>,
    #[serde(deserialize_with = "lenient_opt_f64")]
    pub speed_gbps: Option<f64>,
    #[serde(deserialize_with = "lenient_opt_f64")]
    pub rtt_ms: Option<f64>,
    #[serde(deserialize_with = "lenient_opt_f64")]
    pub jitter_ms: Option<f64>,
    #[serde(deserialize_with = "lenient_opt_f64")]
    pub loss_pct: Option<f64>,
    pub ecn: Option<bool>,
    #[serde(deserialize_with = "lenient_opt_f64")]
    pub power_cap_w: Option<f64>,
    #[serde(deserialize_with = "lenient_opt_f64")]
    pub thermal_derate: Option<f64>,
    #[serde(deserialize_with = "lenient_opt_f64")]
    pub skew_ms: Option<f64>,
    #[serde(deserialize_with = "lenient_opt_f64")]
    pub packet_dup: Option<f64>,
    #[serde(deserialize_with = "lenient_opt_f64")]
    pub packet_reorder: Option<f64>,
}

pub fn load_topology(path: &Path) -> Result<TopologyDoc, IoError> {
    let text = std::fs::read_to_string(path).map_err(|source| IoError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_yaml::from_str(&text).map_err(|e| IoError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

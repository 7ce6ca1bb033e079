pub mod descriptors;
pub mod jobs;
pub mod overrides;
pub mod parse;
pub mod topology;

pub use descriptors::{
    load_node_file, load_nodes_dir, AcceleratorSpec, CpuSpec, GpuSpec, HealthSpec, Labels,
    MemorySpec, NodeDescriptor, NodeNetworkSpec, PowerSpec, StorageSpec,
};
pub use jobs::{load_jobs, JobSpec, StageHints, StageResources, StageSpec};
pub use overrides::{
    LinkDynPatch, NodeDynPatch, Observation, ObservationAction, ObservationPayload, OverridesDoc,
};
pub use parse::{label_string, safe_float};
pub use topology::{
    load_topology, ChaosEventSpec, LinkSpec, NetworkDefaults, ScenarioSpec, TopologyDoc,
};

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IoError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {message}")]
    Parse { path: PathBuf, message: String },
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize {path}: {source}")]
    Serialize {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::parse::lenient_opt_f64;
use crate::IoError;

/// A job is an ordered pipeline of stages. Stage order is placement order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct JobSpec {
    pub id: String,
    #[serde(deserialize_with = "lenient_opt_f64")]
    pub deadline_ms: Option<f64>,
    pub stages: Vec<StageSpec>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StageSpec {
    pub id: String,
    #[serde(deserialize_with = "lenient_opt_f64")]
    pub size_mb: Option<f64>,
    pub resources: StageResources,
    pub allowed_formats: Vec<String>,
    pub disallowed_formats: Vec<String>,
    pub hints: StageHints,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StageResources {
    #[serde(deserialize_with = "lenient_opt_f64")]
    pub cpu_cores: Option<f64>,
    #[serde(deserialize_with = "lenient_opt_f64")]
    pub mem_gb: Option<f64>,
    #[serde(deserialize_with = "lenient_opt_f64")]
    pub gpu_vram_gb: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StageHints {
    pub io_bound: bool,
    #[serde(deserialize_with = "lenient_opt_f64")]
    pub burstiness: Option<f64>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum JobFile {
    Many(Vec<JobSpec>),
    Wrapped { jobs: Vec<JobSpec> },
    Single(JobSpec),
}

/// Load a job file. Accepts a single job object, a bare list of jobs, or a
/// `{jobs: [...]}` wrapper, so one loader serves both demos and batch runs.
pub fn load_jobs(path: &Path) -> Result<Vec<JobSpec>, IoError> {
    let text = std::fs::read_to_string(path).map_err(|source| IoError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let parsed: JobFile = serde_yaml::from_str(&text).map_err(|e| IoError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    Ok(match parsed {
        JobFile::Many(jobs) => jobs,
        JobFile::Wrapped { jobs } => jobs,
        JobFile::Single(job) => vec![job],
    })
}

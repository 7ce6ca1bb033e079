pub mod federated;
pub mod greedy;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use fabric_io::StageSpec;

use crate::cost::StageCost;
use crate::snapshot::NodeView;
use crate::types::EPSILON;

pub const REASON_NO_STAGES: &str = "no_stages";
pub const REASON_NO_FEASIBLE_NODE: &str = "no_feasible_node";
pub const REASON_RESERVATION_FAILED: &str = "reservation_failed";
pub const REASON_MISSING_STAGE_ID: &str = "missing_stage_id";

/// Picks one execution format per (stage, node) before cost evaluation.
/// Integrators substitute a learned policy; the planner is correct without
/// one and falls back to the first allowed∩supported entry.
pub trait FormatSelector: Send + Sync {
    fn choose_format(&self, stage: &StageSpec, node: &NodeView) -> Option<String>;
}

/// Default selector: first entry of `allowed ∩ supported`, in allowed
/// order; no override when the allowed set is empty or disjoint.
pub struct FirstMatchSelector;

impl FormatSelector for FirstMatchSelector {
    fn choose_format(&self, stage: &StageSpec, node: &NodeView) -> Option<String> {
        stage
            .allowed_formats
            .iter()
            .find(|f| node.desc.supports_format(f))
            .cloned()
    }
}

/// Narrow the stage's allowed set to the chosen format, for cost
/// evaluation only. The original stage drives feasibility.
pub fn narrowed_stage(stage: &StageSpec, format: Option<&str>) -> StageSpec {
    let mut eval = stage.clone();
    if let Some(fmt) = format {
        eval.allowed_formats = vec![fmt.to_string()];
    }
    eval
}

/// Format compatibility: any overlap with the disallowed set rejects; an
/// empty allowed set is unconstrained; otherwise the node must support at
/// least one allowed format.
pub fn supports_formats(node: &NodeView, stage: &StageSpec) -> bool {
    let fmts = &node.desc.formats_supported;
    if stage.disallowed_formats.iter().any(|f| fmts.contains(f)) {
        return false;
    }
    if stage.allowed_formats.is_empty() {
        return true;
    }
    stage.allowed_formats.iter().any(|f| fmts.contains(f))
}

/// Full per-stage feasibility against the given free capacity (which may
/// be a planner-local projection rather than the live snapshot).
pub fn fits(node: &NodeView, free: &crate::types::EffectiveCaps, stage: &StageSpec) -> bool {
    if node.dyn_state.down {
        return false;
    }
    let need_cpu = stage.resources.cpu_cores.unwrap_or(0.0);
    let need_mem = stage.resources.mem_gb.unwrap_or(0.0);
    let need_vram = stage.resources.gpu_vram_gb.unwrap_or(0.0);
    if free.free_cpu_cores + EPSILON < need_cpu {
        return false;
    }
    if free.free_mem_gb + EPSILON < need_mem {
        return false;
    }
    if free.free_gpu_vram_gb + EPSILON < need_vram {
        return false;
    }
    supports_formats(node, stage)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReservationRef {
    pub node: String,
    pub reservation_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectedFederation {
    pub name: String,
    pub free_cpu_cores: f64,
    pub free_mem_gb: f64,
    pub free_gpu_vram_gb: f64,
    pub load_factor: f64,
}

/// One stage's outcome: the planner's annotations layered with the cost
/// model's authoritative per-stage measurements.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageReport {
    pub id: String,
    pub node: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    pub compute_ms: f64,
    pub xfer_ms: f64,
    pub energy_kj: f64,
    pub risk: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reservation_id: Option<String>,
    pub infeasible: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub federation: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub fallbacks: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub fallback_federations: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub load_penalty_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_penalty_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resilience_penalty_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub projected_load: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link_loss_pct: Option<f64>,
}

impl StageReport {
    pub fn infeasible(id: &str, node: Option<String>, reason: &str) -> Self {
        Self {
            id: id.to_string(),
            node,
            compute_ms: f64::INFINITY,
            risk: 1.0,
            infeasible: true,
            reason: Some(reason.to_string()),
            ..Default::default()
        }
    }
}

/// Merge planner annotations with cost model measurements. Cost entries
/// keep the job's stage order and win on the shared metric fields; stages
/// only the planner saw are appended so their annotations survive.
pub fn merge_stage_reports(planner: Vec<StageReport>, cost: &[StageCost]) -> Vec<StageReport> {
    if cost.is_empty() {
        return planner;
    }
    let mut by_id: BTreeMap<&str, &StageReport> = BTreeMap::new();
    for report in &planner {
        if !report.id.is_empty() {
            by_id.entry(report.id.as_str()).or_insert(report);
        }
    }

    let mut merged = Vec::with_capacity(cost.len());
    let mut seen: Vec<&str> = Vec::new();
    for entry in cost {
        let mut report = match by_id.get(entry.id.as_str()) {
            Some(planned) => {
                seen.push(entry.id.as_str());
                (*planned).clone()
            }
            None => StageReport {
                id: entry.id.clone(),
                ..Default::default()
            },
        };
        if report.node.is_none() {
            report.node = entry.node.clone();
        }
        report.compute_ms = entry.compute_ms;
        report.xfer_ms = entry.xfer_ms;
        report.energy_kj = entry.energy_kj;
        report.risk = entry.risk;
        merged.push(report);
    }

    for report in planner {
        if report.id.is_empty() || !seen.contains(&report.id.as_str()) {
            merged.push(report);
        }
    }
    merged
}

/// The complete planning response for one job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanResult {
    pub job_id: String,
    pub assignments: BTreeMap<String, String>,
    pub per_stage: Vec<StageReport>,
    pub reservations: Vec<ReservationRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shadow_assignments: Option<BTreeMap<String, Vec<String>>>,
    pub latency_ms: f64,
    pub energy_kj: f64,
    pub risk: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deadline_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slo_penalty: Option<f64>,
    pub infeasible: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub strategy: String,
    pub dry_run: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub federation_spread: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub federations_in_use: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resilience_score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cross_federation_fallback_ratio: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub projected_federations: Option<Vec<ProjectedFederation>>,
    pub ts_ms: i64,
}

impl PlanResult {
    /// Response for a job with no stages at all.
    pub fn empty_job(job_id: &str, strategy: &str, dry_run: bool) -> Self {
        Self {
            job_id: job_id.to_string(),
            assignments: BTreeMap::new(),
            per_stage: Vec::new(),
            reservations: Vec::new(),
            shadow_assignments: None,
            latency_ms: 0.0,
            energy_kj: 0.0,
            risk: 0.0,
            deadline_ms: None,
            slo_penalty: None,
            infeasible: true,
            reason: Some(REASON_NO_STAGES.to_string()),
            strategy: strategy.to_string(),
            dry_run,
            federation_spread: None,
            federations_in_use: None,
            resilience_score: None,
            cross_federation_fallback_ratio: None,
            projected_federations: None,
            ts_ms: crate::types::utc_ms(),
        }
    }
}

use std::collections::BTreeMap;
use std::sync::Arc;

use fabric_io::{JobSpec, StageSpec};
use tracing::debug;

use crate::cost::{stage_size_mb, CostConfig, CostModel};
use crate::planner::{
    fits, merge_stage_reports, narrowed_stage, FirstMatchSelector, FormatSelector, PlanResult,
    ReservationRef, StageReport, REASON_MISSING_STAGE_ID, REASON_NO_FEASIBLE_NODE,
    REASON_RESERVATION_FAILED,
};
use crate::snapshot::NodeView;
use crate::store::FabricStore;
use crate::types::{utc_ms, ReserveRequest};

/// Scoring weights for the baseline planner. The defaults chase latency
/// with a small risk tax; the energy preset flips the priorities.
#[derive(Debug, Clone)]
pub struct GreedyConfig {
    pub latency_weight: f64,
    pub risk_weight: f64,
    pub energy_weight: f64,
    pub prefer_locality_bonus_ms: f64,
}

impl Default for GreedyConfig {
    fn default() -> Self {
        Self {
            latency_weight: 1.0,
            risk_weight: 10.0,
            energy_weight: 0.0,
            prefer_locality_bonus_ms: 0.0,
        }
    }
}

impl GreedyConfig {
    /// Minimise energy first, with latency and risk as tie-breakers.
    pub fn cheapest_energy() -> Self {
        Self {
            latency_weight: 0.01,
            risk_weight: 0.1,
            energy_weight: 10.0,
            prefer_locality_bonus_ms: 0.0,
        }
    }
}

/// Single-pass per-stage planner: scan feasible nodes, pick the lowest
/// score, optionally reserve, carry on.
pub struct GreedyPlanner {
    store: Arc<FabricStore>,
    strategy: String,
    cfg: GreedyConfig,
    cost_cfg: CostConfig,
    selector: Box<dyn FormatSelector>,
}

impl GreedyPlanner {
    pub fn new(store: Arc<FabricStore>) -> Self {
        Self {
            store,
            strategy: "greedy".to_string(),
            cfg: GreedyConfig::default(),
            cost_cfg: CostConfig::default(),
            selector: Box::new(FirstMatchSelector),
        }
    }

    pub fn cheapest_energy(store: Arc<FabricStore>) -> Self {
        let mut planner = Self::new(store);
        planner.strategy = "cheapest-energy".to_string();
        planner.cfg = GreedyConfig::cheapest_energy();
        planner
    }

    pub fn with_config(mut self, cfg: GreedyConfig) -> Self {
        self.cfg = cfg;
        self
    }

    pub fn with_cost_config(mut self, cfg: CostConfig) -> Self {
        self.cost_cfg = cfg;
        self
    }

    pub fn with_selector(mut self, selector: Box<dyn FormatSelector>) -> Self {
        self.selector = selector;
        self
    }

    fn score_candidate(
        &self,
        cm: &CostModel<'_>,
        stage: &StageSpec,
        name: &str,
        node: &NodeView,
        prev_node: Option<&str>,
    ) -> (f64, StageReport) {
        let format = self.selector.choose_format(stage, node);
        let stage_eval = narrowed_stage(stage, format.as_deref());

        let compute_ms = cm.compute_time_ms(&stage_eval, node);
        let xfer_ms = match prev_node {
            Some(prev) if prev != name => cm.transfer_time_ms(prev, name, stage_size_mb(stage)),
            _ => 0.0,
        };
        let energy = cm.energy_kj(&stage_eval, node, compute_ms);
        let risk = cm.risk_score(&stage_eval, node, 0.0);

        let mut score = self.cfg.latency_weight * (compute_ms + xfer_ms)
            + self.cfg.risk_weight * risk
            + self.cfg.energy_weight * energy;
        if prev_node == Some(name) && self.cfg.prefer_locality_bonus_ms > 0.0 {
            score -= self.cfg.prefer_locality_bonus_ms;
        }

        let report = StageReport {
            id: stage.id.clone(),
            node: Some(name.to_string()),
            format,
            compute_ms,
            xfer_ms,
            energy_kj: energy,
            risk,
            score: Some(score),
            ..Default::default()
        };
        (score, report)
    }

    pub fn plan_job(&self, job: &JobSpec, dry_run: bool) -> PlanResult {
        if job.stages.is_empty() {
            return PlanResult::empty_job(&job.id, &self.strategy, dry_run);
        }

        let snapshot = self.store.snapshot();
        let cm = CostModel::with_config(&snapshot, self.cost_cfg.clone());

        let mut assignments: BTreeMap<String, String> = BTreeMap::new();
        let mut per_stage: Vec<StageReport> = Vec::new();
        let mut reservations: Vec<ReservationRef> = Vec::new();
        let mut prev_node: Option<String> = None;
        let mut infeasible = false;

        for stage in &job.stages {
            if stage.id.is_empty() {
                per_stage.push(StageReport::infeasible("", None, REASON_MISSING_STAGE_ID));
                infeasible = true;
                prev_node = None;
                continue;
            }

            let mut best: Option<(f64, String, StageReport)> = None;
            for (name, node) in &snapshot.nodes {
                if !fits(node, &node.effective, stage) {
                    continue;
                }
                let (score, report) =
                    self.score_candidate(&cm, stage, name, node, prev_node.as_deref());
                // strict less-than keeps the first winner on ties
                if best.as_ref().map(|(s, _, _)| score < *s).unwrap_or(true) {
                    best = Some((score, name.clone(), report));
                }
            }

            let Some((best_score, best_name, mut report)) =
                best.filter(|(s, _, _)| s.is_finite())
            else {
                per_stage.push(StageReport::infeasible(
                    &stage.id,
                    None,
                    REASON_NO_FEASIBLE_NODE,
                ));
                infeasible = true;
                prev_node = None;
                continue;
            };
            debug!(stage = %stage.id, node = %best_name, score = best_score, "stage placed");

            if !dry_run {
                let req = ReserveRequest {
                    node: best_name.clone(),
                    cpu_cores: stage.resources.cpu_cores.unwrap_or(0.0),
                    mem_gb: stage.resources.mem_gb.unwrap_or(0.0),
                    gpu_vram_gb: stage.resources.gpu_vram_gb.unwrap_or(0.0),
                };
                match self.store.reserve(&req) {
                    Some(rid) => {
                        reservations.push(ReservationRef {
                            node: best_name.clone(),
                            reservation_id: rid.clone(),
                        });
                        report.reservation_id = Some(rid);
                    }
                    None => {
                        // capacity moved underneath us; no retry by contract
                        per_stage.push(StageReport::infeasible(
                            &stage.id,
                            Some(best_name),
                            REASON_RESERVATION_FAILED,
                        ));
                        infeasible = true;
                        prev_node = None;
                        continue;
                    }
                }
            }

            assignments.insert(stage.id.clone(), best_name.clone());
            per_stage.push(report);
            prev_node = Some(best_name);
        }

        let cost = cm.job_cost(job, &assignments);
        let merged = merge_stage_reports(per_stage, &cost.per_stage);
        let deadline = job.deadline_ms.unwrap_or(0.0);
        let slo = (deadline > 0.0).then(|| cm.slo_penalty(deadline, cost.latency_ms));

        PlanResult {
            job_id: job.id.clone(),
            assignments,
            per_stage: merged,
            reservations,
            shadow_assignments: None,
            latency_ms: cost.latency_ms,
            energy_kj: cost.energy_kj,
            risk: cost.risk,
            deadline_ms: (deadline > 0.0).then_some(deadline),
            slo_penalty: slo,
            infeasible: infeasible || cost.latency_ms.is_infinite(),
            reason: None,
            strategy: self.strategy.clone(),
            dry_run,
            federation_spread: None,
            federations_in_use: None,
            resilience_score: None,
            cross_federation_fallback_ratio: None,
            projected_federations: None,
            ts_ms: utc_ms(),
        }
    }
}

use std::collections::BTreeMap;
use std::sync::Arc;

use fabric_io::{JobSpec, StageSpec};
use tracing::debug;

use crate::cost::{stage_size_mb, CostConfig, CostModel};
use crate::federation::FederationStats;
use crate::planner::{
    fits, merge_stage_reports, narrowed_stage, FirstMatchSelector, FormatSelector, PlanResult,
    ProjectedFederation, ReservationRef, StageReport, REASON_MISSING_STAGE_ID,
    REASON_NO_FEASIBLE_NODE, REASON_RESERVATION_FAILED,
};
use crate::snapshot::{FabricSnapshot, NodeView};
use crate::store::FabricStore;
use crate::types::{clamp, utc_ms, EffectiveCaps, ReserveRequest};

/// Placement mode. Each mode is a fixed weight profile; unknown names and
/// the failover aliases land on `Resilient`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanMode {
    Resilient,
    NetworkAware,
    Federated,
}

impl PlanMode {
    pub fn parse(name: &str) -> Self {
        match name.trim().to_lowercase().as_str() {
            "resilient" | "fault-tolerant" | "ft" | "failover" => PlanMode::Resilient,
            "network-aware" | "balanced" | "load-balance" | "load-balanced" => {
                PlanMode::NetworkAware
            }
            "federated" => PlanMode::Federated,
            _ => PlanMode::Resilient,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PlanMode::Resilient => "resilient",
            PlanMode::NetworkAware => "network-aware",
            PlanMode::Federated => "federated",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ModeWeights {
    pub redundancy: usize,
    pub risk_weight: f64,
    pub load_weight: f64,
    pub spread_weight: f64,
    pub network_weight: f64,
    pub resilience_weight: f64,
    pub prefer_prev_bonus: f64,
}

impl ModeWeights {
    pub fn for_mode(mode: PlanMode) -> Self {
        match mode {
            PlanMode::Resilient => Self {
                redundancy: 2,
                risk_weight: 220.0,
                load_weight: 380.0,
                spread_weight: 210.0,
                network_weight: 240.0,
                resilience_weight: 250.0,
                prefer_prev_bonus: 15.0,
            },
            PlanMode::NetworkAware => Self {
                redundancy: 1,
                risk_weight: 200.0,
                load_weight: 260.0,
                spread_weight: 140.0,
                network_weight: 300.0,
                resilience_weight: 190.0,
                prefer_prev_bonus: 12.0,
            },
            PlanMode::Federated => Self {
                redundancy: 3,
                risk_weight: 210.0,
                load_weight: 360.0,
                spread_weight: 260.0,
                network_weight: 230.0,
                resilience_weight: 240.0,
                prefer_prev_bonus: 10.0,
            },
        }
    }
}

/// Planner-local projection of free capacity. Updated as placements are
/// made so later stages see the consequences of earlier picks without
/// touching the store.
struct Projection {
    node_free: BTreeMap<String, EffectiveCaps>,
    federations: BTreeMap<String, FederationStats>,
}

impl Projection {
    fn from_snapshot(snapshot: &FabricSnapshot) -> Self {
        Self {
            node_free: snapshot
                .nodes
                .iter()
                .map(|(name, node)| (name.clone(), node.effective))
                .collect(),
            federations: snapshot
                .federations
                .iter()
                .map(|fed| (fed.name.clone(), fed.clone()))
                .collect(),
        }
    }

    fn federation(&mut self, name: &str) -> &mut FederationStats {
        self.federations
            .entry(name.to_string())
            .or_insert_with(|| FederationStats {
                name: name.to_string(),
                ..Default::default()
            })
    }

    /// Mean of per-resource load ratios after a hypothetical extra demand,
    /// over the resources the federation actually has.
    fn projected_load(fed: &FederationStats, need_cpu: f64, need_mem: f64, need_vram: f64) -> f64 {
        let mut loads = Vec::new();
        if fed.total_cpu_cores > 0.0 {
            let free = (fed.free_cpu_cores - need_cpu).max(0.0);
            loads.push(clamp(
                (fed.total_cpu_cores - free) / fed.total_cpu_cores.max(1e-6),
                0.0,
                1.0,
            ));
        }
        if fed.total_mem_gb > 0.0 {
            let free = (fed.free_mem_gb - need_mem).max(0.0);
            loads.push(clamp(
                (fed.total_mem_gb - free) / fed.total_mem_gb.max(1e-6),
                0.0,
                1.0,
            ));
        }
        if fed.total_gpu_vram_gb > 0.0 {
            let free = (fed.free_gpu_vram_gb - need_vram).max(0.0);
            loads.push(clamp(
                (fed.total_gpu_vram_gb - free) / fed.total_gpu_vram_gb.max(1e-6),
                0.0,
                1.0,
            ));
        }
        if loads.is_empty() {
            0.0
        } else {
            loads.iter().sum::<f64>() / loads.len() as f64
        }
    }

    fn consume(&mut self, node: &str, federation: &str, cpu: f64, mem: f64, vram: f64) {
        if let Some(free) = self.node_free.get_mut(node) {
            free.free_cpu_cores = (free.free_cpu_cores - cpu).max(0.0);
            free.free_mem_gb = (free.free_mem_gb - mem).max(0.0);
            free.free_gpu_vram_gb = (free.free_gpu_vram_gb - vram).max(0.0);
        }
        let fed = self.federation(federation);
        fed.free_cpu_cores = (fed.free_cpu_cores - cpu).max(0.0);
        fed.free_mem_gb = (fed.free_mem_gb - mem).max(0.0);
        fed.free_gpu_vram_gb = (fed.free_gpu_vram_gb - vram).max(0.0);
        fed.load_factor = Self::projected_load(fed, 0.0, 0.0, 0.0);
    }
}

struct Candidate {
    score: f64,
    name: String,
    federation: String,
    report: StageReport,
}

/// Federation-aware planner: weighs projected load, cross-federation
/// spread, link health, and federation degradation on top of the base
/// cost, and emits advisory fallback placements per stage.
pub struct FederatedPlanner {
    store: Arc<FabricStore>,
    cost_cfg: CostConfig,
    selector: Box<dyn FormatSelector>,
}

impl FederatedPlanner {
    pub fn new(store: Arc<FabricStore>) -> Self {
        Self {
            store,
            cost_cfg: CostConfig::default(),
            selector: Box::new(FirstMatchSelector),
        }
    }

    pub fn with_cost_config(mut self, cfg: CostConfig) -> Self {
        self.cost_cfg = cfg;
        self
    }

    pub fn with_selector(mut self, selector: Box<dyn FormatSelector>) -> Self {
        self.selector = selector;
        self
    }

    #[allow(clippy::too_many_arguments)]
    fn score_candidate(
        &self,
        cm: &CostModel<'_>,
        snapshot: &FabricSnapshot,
        stage: &StageSpec,
        name: &str,
        node: &NodeView,
        federation: &str,
        fed_entry: &FederationStats,
        prev_node: Option<&str>,
        used_federations: &BTreeMap<String, u32>,
        weights: &ModeWeights,
    ) -> (f64, StageReport) {
        let need_cpu = stage.resources.cpu_cores.unwrap_or(0.0);
        let need_mem = stage.resources.mem_gb.unwrap_or(0.0);
        let need_vram = stage.resources.gpu_vram_gb.unwrap_or(0.0);
        let projected_load = Projection::projected_load(fed_entry, need_cpu, need_mem, need_vram);

        let format = self.selector.choose_format(stage, node);
        let stage_eval = narrowed_stage(stage, format.as_deref());

        let compute_ms = cm.compute_time_ms(&stage_eval, node);
        let energy = cm.energy_kj(&stage_eval, node, compute_ms);

        let (xfer_ms, link_down, link_loss) = match prev_node {
            Some(prev) if prev != name => {
                let metrics = snapshot.link_between(Some(prev), name);
                (
                    cm.transfer_time_ms(prev, name, stage_size_mb(stage)),
                    metrics.down,
                    metrics.loss_pct,
                )
            }
            _ => (0.0, false, 0.0),
        };
        let risk = cm.risk_score(&stage_eval, node, link_loss);

        let load_penalty = weights.load_weight * projected_load;
        let spread_penalty = weights.spread_weight
            * *used_federations.get(federation).unwrap_or(&0) as f64;
        let network_penalty = weights.network_weight
            * (if link_down { 1.0 } else { 0.0 } + clamp(link_loss / 10.0, 0.0, 1.0));
        let resilience_penalty =
            weights.resilience_weight * (fed_entry.down_fraction + fed_entry.hot_fraction);
        let risk_penalty = weights.risk_weight * risk;

        let mut score = compute_ms
            + xfer_ms
            + load_penalty
            + spread_penalty
            + network_penalty
            + resilience_penalty
            + risk_penalty;
        if prev_node == Some(name) {
            score -= weights.prefer_prev_bonus;
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
            federation: Some(federation.to_string()),
            load_penalty_ms: Some(load_penalty),
            network_penalty_ms: Some(network_penalty),
            resilience_penalty_ms: Some(resilience_penalty),
            projected_load: Some(projected_load),
            link_loss_pct: Some(link_loss),
            ..Default::default()
        };
        (score, report)
    }

    pub fn plan_job(&self, job: &JobSpec, dry_run: bool, mode: PlanMode) -> PlanResult {
        if job.stages.is_empty() {
            return PlanResult::empty_job(&job.id, mode.as_str(), dry_run);
        }

        let weights = ModeWeights::for_mode(mode);
        let snapshot = self.store.snapshot();
        let cm = CostModel::with_config(&snapshot, self.cost_cfg.clone());
        let mut projection = Projection::from_snapshot(&snapshot);

        let mut assignments: BTreeMap<String, String> = BTreeMap::new();
        let mut shadow_assignments: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut per_stage: Vec<StageReport> = Vec::new();
        let mut reservations: Vec<ReservationRef> = Vec::new();
        let mut used_federations: BTreeMap<String, u32> = BTreeMap::new();
        let mut prev_node: Option<String> = None;
        let mut infeasible = false;
        let mut fallback_crossfed = 0usize;

        for stage in &job.stages {
            if stage.id.is_empty() {
                per_stage.push(StageReport::infeasible("", None, REASON_MISSING_STAGE_ID));
                infeasible = true;
                prev_node = None;
                continue;
            }

            let need_cpu = stage.resources.cpu_cores.unwrap_or(0.0);
            let need_mem = stage.resources.mem_gb.unwrap_or(0.0);
            let need_vram = stage.resources.gpu_vram_gb.unwrap_or(0.0);

            let mut candidates: Vec<Candidate> = Vec::new();
            for (name, node) in &snapshot.nodes {
                let free = projection
                    .node_free
                    .get(name)
                    .copied()
                    .unwrap_or(node.effective);
                if !fits(node, &free, stage) {
                    continue;
                }
                let federation = snapshot.federation_of(name).to_string();
                let fed_entry = projection.federation(&federation).clone();
                let (score, report) = self.score_candidate(
                    &cm,
                    &snapshot,
                    stage,
                    name,
                    node,
                    &federation,
                    &fed_entry,
                    prev_node.as_deref(),
                    &used_federations,
                    &weights,
                );
                candidates.push(Candidate {
                    score,
                    name: name.clone(),
                    federation,
                    report,
                });
            }

            if candidates.is_empty() {
                infeasible = true;
                per_stage.push(StageReport::infeasible(
                    &stage.id,
                    None,
                    REASON_NO_FEASIBLE_NODE,
                ));
                prev_node = None;
                continue;
            }

            candidates.sort_by(|a, b| a.score.total_cmp(&b.score));
            let best = candidates.remove(0);
            let mut report = best.report;
            debug!(stage = %stage.id, node = %best.name, federation = %best.federation,
                   score = best.score, "stage placed");

            // advisory fallbacks, never reserved
            let mut fallback_nodes = Vec::new();
            let mut fallback_feds = Vec::new();
            for cand in candidates
                .iter()
                .take(weights.redundancy.saturating_sub(1))
            {
                fallback_nodes.push(cand.name.clone());
                fallback_feds.push(cand.federation.clone());
                if cand.federation != best.federation {
                    fallback_crossfed += 1;
                }
            }
            shadow_assignments.insert(stage.id.clone(), fallback_nodes.clone());
            report.fallbacks = fallback_nodes;
            report.fallback_federations = fallback_feds;

            let mut assigned = true;
            if !dry_run {
                let req = ReserveRequest {
                    node: best.name.clone(),
                    cpu_cores: need_cpu,
                    mem_gb: need_mem,
                    gpu_vram_gb: need_vram,
                };
                match self.store.reserve(&req) {
                    Some(rid) => {
                        reservations.push(ReservationRef {
                            node: best.name.clone(),
                            reservation_id: rid.clone(),
                        });
                        report.reservation_id = Some(rid);
                    }
                    None => {
                        // the winning score raced a concurrent reservation
                        assigned = false;
                        infeasible = true;
                    }
                }
            }

            if assigned {
                assignments.insert(stage.id.clone(), best.name.clone());
                projection.consume(&best.name, &best.federation, need_cpu, need_mem, need_vram);
                *used_federations.entry(best.federation.clone()).or_insert(0) += 1;
                prev_node = Some(best.name.clone());
            } else {
                report.node = None;
                report.infeasible = true;
                report.reason = Some(REASON_RESERVATION_FAILED.to_string());
                prev_node = None;
            }
            per_stage.push(report);
        }

        let cost = cm.job_cost(job, &assignments);
        let merged = merge_stage_reports(per_stage, &cost.per_stage);
        let deadline = job.deadline_ms.unwrap_or(0.0);
        let slo = (deadline > 0.0).then(|| cm.slo_penalty(deadline, cost.latency_ms));

        let stage_count = job.stages.len().max(1) as f64;
        let unique_feds: Vec<String> = {
            let mut feds: Vec<String> = assignments
                .values()
                .map(|node| snapshot.federation_of(node).to_string())
                .collect();
            feds.sort();
            feds.dedup();
            feds
        };
        let spread = unique_feds.len() as f64 / stage_count;
        let resilience_score = shadow_assignments
            .values()
            .filter(|nodes| !nodes.is_empty())
            .count() as f64
            / stage_count;
        let crossfed_ratio = fallback_crossfed as f64 / stage_count;

        let projected_federations: Vec<ProjectedFederation> = projection
            .federations
            .values()
            .map(|fed| ProjectedFederation {
                name: fed.name.clone(),
                free_cpu_cores: fed.free_cpu_cores,
                free_mem_gb: fed.free_mem_gb,
                free_gpu_vram_gb: fed.free_gpu_vram_gb,
                load_factor: fed.load_factor,
            })
            .collect();

        PlanResult {
            job_id: job.id.clone(),
            assignments,
            per_stage: merged,
            reservations,
            shadow_assignments: Some(shadow_assignments),
            latency_ms: cost.latency_ms,
            energy_kj: cost.energy_kj,
            risk: cost.risk,
            deadline_ms: (deadline > 0.0).then_some(deadline),
            slo_penalty: slo,
            infeasible: infeasible || cost.latency_ms.is_infinite(),
            reason: None,
            strategy: mode.as_str().to_string(),
            dry_run,
            federation_spread: Some(spread),
            federations_in_use: Some(unique_feds),
            resilience_score: Some(resilience_score),
            cross_federation_fallback_ratio: Some(crossfed_ratio),
            projected_federations: Some(projected_federations),
            ts_ms: utc_ms(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreConfig;
    use fabric_io::{LinkSpec, NodeDescriptor, StageResources, TopologyDoc};
    use serde_json::json;

    fn node(name: &str, fed: &str, cores: f64) -> NodeDescriptor {
        let mut desc = NodeDescriptor::default();
        desc.name = name.to_string();
        desc.cpu.cores = cores;
        desc.cpu.base_ghz = 2.0;
        desc.memory.ram_gb = 16.0;
        desc.gpu.vram_gb = 4.0;
        desc.formats_supported = vec!["native".to_string()];
        desc.labels.insert("federation".to_string(), json!(fed));
        desc
    }

    fn stage(id: &str) -> StageSpec {
        StageSpec {
            id: id.to_string(),
            size_mb: Some(10.0),
            resources: StageResources {
                cpu_cores: Some(1.0),
                mem_gb: Some(1.0),
                gpu_vram_gb: None,
            },
            ..Default::default()
        }
    }

    fn two_federations() -> Arc<FabricStore> {
        let mut topo = TopologyDoc::default();
        for (a, b) in [("x1", "y1"), ("x2", "y1"), ("x1", "y2")] {
            topo.links.push(LinkSpec {
                a: a.to_string(),
                b: b.to_string(),
                speed_gbps: Some(1.0),
                rtt_ms: Some(2.0),
                ..Default::default()
            });
        }
        Arc::new(FabricStore::from_parts(
            vec![
                node("x1", "fed-x", 8.0),
                node("x2", "fed-x", 8.0),
                node("y1", "fed-y", 8.0),
                node("y2", "fed-y", 8.0),
            ],
            topo,
            StoreConfig::default(),
        ))
    }

    #[test]
    fn mode_aliases_resolve() {
        assert_eq!(PlanMode::parse("resilient"), PlanMode::Resilient);
        assert_eq!(PlanMode::parse("ft"), PlanMode::Resilient);
        assert_eq!(PlanMode::parse("FAILOVER"), PlanMode::Resilient);
        assert_eq!(PlanMode::parse("balanced"), PlanMode::NetworkAware);
        assert_eq!(PlanMode::parse("federated"), PlanMode::Federated);
        assert_eq!(PlanMode::parse("???"), PlanMode::Resilient);
    }

    #[test]
    fn resilient_mode_emits_fallbacks() {
        let planner = FederatedPlanner::new(two_federations());
        let job = JobSpec {
            id: "job".to_string(),
            deadline_ms: None,
            stages: vec![stage("s1"), stage("s2")],
        };
        let result = planner.plan_job(&job, true, PlanMode::Resilient);
        assert!(!result.infeasible);

        let shadows = result.shadow_assignments.as_ref().unwrap();
        // redundancy 2 → one fallback per stage
        assert_eq!(shadows["s1"].len(), 1);
        assert_eq!(shadows["s2"].len(), 1);
        assert_eq!(result.resilience_score, Some(1.0));
        // fallbacks are advisory: dry-run or not, they are never reserved
        assert!(result.reservations.is_empty());
    }

    #[test]
    fn spread_weight_pushes_stages_across_federations() {
        let planner = FederatedPlanner::new(two_federations());
        let job = JobSpec {
            id: "job".to_string(),
            deadline_ms: None,
            stages: vec![stage("s1"), stage("s2"), stage("s3"), stage("s4")],
        };
        let result = planner.plan_job(&job, true, PlanMode::Federated);
        assert!(!result.infeasible);

        let feds = result.federations_in_use.as_ref().unwrap();
        assert_eq!(feds.len(), 2, "spread weight should use both federations");
        assert_eq!(result.federation_spread, Some(2.0 / 4.0));
    }

    #[test]
    fn projection_consumes_capacity_for_later_stages() {
        let store = Arc::new(FabricStore::from_parts(
            vec![node("only", "fed-x", 2.0)],
            TopologyDoc::default(),
            StoreConfig::default(),
        ));
        let planner = FederatedPlanner::new(store);
        let mut big = stage("s1");
        big.resources.cpu_cores = Some(1.5);
        let mut big2 = stage("s2");
        big2.resources.cpu_cores = Some(1.5);

        let job = JobSpec {
            id: "job".to_string(),
            deadline_ms: None,
            stages: vec![big, big2],
        };
        // dry run never touches the store, yet the second stage must see
        // the first one's projected consumption
        let result = planner.plan_job(&job, true, PlanMode::Resilient);
        assert!(result.infeasible);
        assert_eq!(result.assignments.len(), 1);
        let last = result.per_stage.last().unwrap();
        assert_eq!(last.reason.as_deref(), Some(REASON_NO_FEASIBLE_NODE));

        // and the store itself is untouched
        let snap = planner.store.snapshot();
        assert_eq!(snap.nodes["only"].dyn_state.used_cpu_cores, 0.0);
    }

    #[test]
    fn cross_federation_fallbacks_are_counted() {
        let planner = FederatedPlanner::new(two_federations());
        let job = JobSpec {
            id: "job".to_string(),
            deadline_ms: None,
            stages: vec![stage("s1"), stage("s2")],
        };
        let result = planner.plan_job(&job, true, PlanMode::Federated);
        // with symmetric federations and spread pressure, at least one
        // fallback should land across the federation boundary
        assert!(result.cross_federation_fallback_ratio.unwrap() > 0.0);
    }

    #[test]
    fn degraded_cross_links_penalise_remote_candidates() {
        let store = two_federations();
        let planner = FederatedPlanner::new(Arc::clone(&store));
        let job = JobSpec {
            id: "job".to_string(),
            deadline_ms: None,
            stages: vec![stage("s1"), stage("s2")],
        };
        let healthy = planner.plan_job(&job, true, PlanMode::NetworkAware);

        // degrade every cross-federation link hard
        for key in ["x1|y1", "x2|y1", "x1|y2"] {
            store.apply_observation(&fabric_io::Observation {
                action: fabric_io::ObservationAction::Apply,
                payload: fabric_io::ObservationPayload::Link {
                    key: key.to_string(),
                    changes: fabric_io::LinkDynPatch {
                        loss_pct: Some(12.0),
                        rtt_ms: Some(35.0),
                        ..Default::default()
                    },
                    fields: vec![],
                },
            });
        }
        let degraded = planner.plan_job(&job, true, PlanMode::NetworkAware);

        // both plans complete; the degraded fabric costs at least as much
        assert!(!healthy.infeasible && !degraded.infeasible);
        let healthy_net: f64 = healthy
            .per_stage
            .iter()
            .filter_map(|s| s.network_penalty_ms)
            .sum();
        let degraded_net: f64 = degraded
            .per_stage
            .iter()
            .filter_map(|s| s.network_penalty_ms)
            .sum();
        assert!(degraded_net >= healthy_net);
    }

    #[test]
    fn reservations_happen_only_outside_dry_run() {
        let store = two_federations();
        let planner = FederatedPlanner::new(Arc::clone(&store));
        let job = JobSpec {
            id: "job".to_string(),
            deadline_ms: None,
            stages: vec![stage("s1"), stage("s2")],
        };
        let result = planner.plan_job(&job, false, PlanMode::Resilient);
        assert!(!result.infeasible);
        assert_eq!(result.reservations.len(), 2);

        let snap = store.snapshot();
        let reserved: usize = snap
            .nodes
            .values()
            .map(|n| n.dyn_state.reservations.len())
            .sum();
        assert_eq!(reserved, 2);
    }

    #[test]
    fn projected_federations_report_residual_capacity() {
        let planner = FederatedPlanner::new(two_federations());
        let mut st = stage("s1");
        st.resources.cpu_cores = Some(4.0);
        let job = JobSpec {
            id: "job".to_string(),
            deadline_ms: None,
            stages: vec![st],
        };
        let result = planner.plan_job(&job, true, PlanMode::Resilient);
        let projected = result.projected_federations.as_ref().unwrap();
        assert_eq!(projected.len(), 2);
        let total_free: f64 = projected.iter().map(|f| f.free_cpu_cores).sum();
        // 32 cores total minus the 4 projected for the placed stage
        assert_eq!(total_free, 28.0);
    }
}

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use fabric_io::{JobSpec, StageSpec};

use crate::snapshot::{FabricSnapshot, NodeView};
use crate::types::clamp;

/// Tuning constants for the cost estimators. The defaults are normative;
/// operators override individual knobs through configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CostConfig {
    // compute model
    pub min_stage_ms: f64,
    pub cpu_unit_divisor: f64,
    pub wasm_penalty: f64,
    pub cuda_base_boost: f64,
    pub cuda_max_boost: f64,
    pub npu_tops_boost_div: f64,
    pub npu_max_boost: f64,
    // transfer model
    pub proto_overhead: f64,
    pub loss_penalty_ceil: f64,
    // energy model
    pub default_tdp_w: f64,
    pub idle_fraction: f64,
    pub util_to_power_exp: f64,
    // risk weights
    pub risk_w_trust: f64,
    pub risk_w_ssd_wear: f64,
    pub risk_w_crash: f64,
    pub risk_w_thermal: f64,
    pub risk_w_link_loss: f64,
    // SLO penalty curve
    pub slo_alpha: f64,
    pub slo_beta: f64,
}

impl Default for CostConfig {
    fn default() -> Self {
        Self {
            min_stage_ms: 15.0,
            cpu_unit_divisor: 10.0,
            wasm_penalty: 1.35,
            cuda_base_boost: 1.0,
            cuda_max_boost: 6.0,
            npu_tops_boost_div: 10.0,
            npu_max_boost: 3.0,
            proto_overhead: 0.85,
            loss_penalty_ceil: 0.30,
            default_tdp_w: 65.0,
            idle_fraction: 0.12,
            util_to_power_exp: 0.85,
            risk_w_trust: 0.35,
            risk_w_ssd_wear: 0.20,
            risk_w_crash: 0.20,
            risk_w_thermal: 0.15,
            risk_w_link_loss: 0.10,
            slo_alpha: 1.2,
            slo_beta: 0.002,
        }
    }
}

/// Trust assumed for nodes whose operators did not label one.
const DEFAULT_TRUST: f64 = 0.8;

pub fn stage_size_mb(stage: &StageSpec) -> f64 {
    stage.size_mb.unwrap_or(10.0)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageCost {
    pub id: String,
    pub node: Option<String>,
    pub compute_ms: f64,
    pub xfer_ms: f64,
    pub energy_kj: f64,
    pub risk: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobCost {
    pub latency_ms: f64,
    pub energy_kj: f64,
    pub risk: f64,
    pub per_stage: Vec<StageCost>,
}

/// Deterministic estimators over one snapshot. All methods are pure reads;
/// planners hold no store lock while scoring.
pub struct CostModel<'a> {
    snapshot: &'a FabricSnapshot,
    cfg: CostConfig,
}

impl<'a> CostModel<'a> {
    pub fn new(snapshot: &'a FabricSnapshot) -> Self {
        Self::with_config(snapshot, CostConfig::default())
    }

    pub fn with_config(snapshot: &'a FabricSnapshot, cfg: CostConfig) -> Self {
        Self { snapshot, cfg }
    }

    pub fn config(&self) -> &CostConfig {
        &self.cfg
    }

    fn node_cpu_units(&self, node: &NodeView) -> f64 {
        let derate = clamp(node.thermal_derate(), 0.0, 1.0);
        (node.caps.cpu_units * (1.0 - derate)).max(0.0)
    }

    /// Speedup from accelerator formats the stage permits. A non-empty
    /// allowed set the node cannot serve at all costs a flat 0.5; the
    /// planner decides hard feasibility elsewhere.
    fn accel_multiplier(&self, node: &NodeView, stage: &StageSpec) -> f64 {
        let fmts = &node.desc.formats_supported;
        let allowed = &stage.allowed_formats;
        let disallowed = &stage.disallowed_formats;
        let has = |list: &[String], f: &str| list.iter().any(|x| x == f);

        if !allowed.is_empty() && !allowed.iter().any(|f| has(fmts, f)) {
            return 0.5;
        }

        let mut mult: f64 = 1.0;

        if has(fmts, "cuda")
            && !has(disallowed, "cuda")
            && (allowed.is_empty() || has(allowed, "cuda"))
        {
            let cuda = self.cfg.cuda_base_boost * (1.0 + node.desc.gpu.accel_score / 10.0);
            mult = mult.max(clamp(cuda, 1.0, self.cfg.cuda_max_boost));
        }

        if has(fmts, "npu")
            && !has(disallowed, "npu")
            && (allowed.is_empty() || has(allowed, "npu"))
        {
            let npu = 1.0 + node.desc.accelerators.npu_tops / self.cfg.npu_tops_boost_div;
            mult = mult.max(clamp(npu, 1.0, self.cfg.npu_max_boost));
        }

        // Portable bytecode pays a penalty when the allowed set forces it
        // over native.
        if has(fmts, "wasm") && has(allowed, "wasm") && !has(allowed, "native") {
            mult /= self.cfg.wasm_penalty;
        }

        mult
    }

    fn stage_base_work(&self, stage: &StageSpec) -> f64 {
        let size_mb = stage_size_mb(stage);
        let cpu_req = stage.resources.cpu_cores.unwrap_or(1.0);
        let mut base = size_mb * 2.0 + cpu_req * 120.0;
        if stage.hints.io_bound {
            base *= 0.85;
        }
        base.max(self.cfg.min_stage_ms)
    }

    pub fn compute_time_ms(&self, stage: &StageSpec, node: &NodeView) -> f64 {
        if node.is_down() {
            return f64::INFINITY;
        }
        let cpu_units = self.node_cpu_units(node);
        if cpu_units <= 1e-9 {
            return f64::INFINITY;
        }
        let work = self.stage_base_work(stage);
        let accel = self.accel_multiplier(node, stage);
        let t = work / (cpu_units / self.cfg.cpu_unit_divisor).max(1.0) / accel.max(1.0);
        t.max(self.cfg.min_stage_ms)
    }

    pub fn transfer_time_ms(&self, src: &str, dst: &str, size_mb: f64) -> f64 {
        if size_mb <= 0.0 || src == dst {
            return 0.0;
        }
        let m = self.snapshot.link_between(Some(src), dst);
        if m.down {
            return f64::INFINITY;
        }
        let mbps_phy = m.speed_gbps * 1000.0;
        let loss_pen = 1.0 - clamp(m.loss_pct / 100.0, 0.0, self.cfg.loss_penalty_ceil);
        let eff_mbps = mbps_phy * self.cfg.proto_overhead * loss_pen;
        (size_mb * 8.0) / eff_mbps.max(1.0) * 1000.0 + m.rtt_ms + m.jitter_ms
    }

    /// Rough (idle + active) power over the compute window, in kilojoules.
    pub fn energy_kj(&self, stage: &StageSpec, node: &NodeView, compute_ms: f64) -> f64 {
        if !compute_ms.is_finite() {
            return 0.0;
        }
        let tdp = node.desc.power.tdp_w.unwrap_or(self.cfg.default_tdp_w);
        let req = stage.resources.cpu_cores.unwrap_or(1.0);
        let util = clamp(req / node.caps.max_cpu_cores.max(1.0), 0.05, 1.0);
        let util_eff = clamp(util * (1.0 + 0.2 * node.thermal_derate()), 0.0, 1.0);

        let idle_w = tdp * self.cfg.idle_fraction;
        let active_w = (tdp - idle_w) * util_eff.powf(self.cfg.util_to_power_exp);
        let kj = (idle_w + active_w) * (compute_ms / 1000.0) / 1000.0;
        kj.max(0.0)
    }

    /// Blend of distrust, SSD wear, crash history, thermal trouble, and
    /// link loss, normalised into 0..1.
    pub fn risk_score(&self, _stage: &StageSpec, node: &NodeView, link_loss_pct: f64) -> f64 {
        let trust = node.desc.trust().unwrap_or(DEFAULT_TRUST);
        let trust_term = 1.0 - clamp(trust, 0.0, 1.0);
        let ssd_wear = clamp(node.desc.storage.tbw_pct_used / 100.0, 0.0, 1.0);
        let crash_term = clamp(node.desc.health.last_week_crashes / 5.0, 0.0, 1.0);
        let thermal_term = clamp(node.thermal_derate(), 0.0, 1.0);
        let link_term = clamp(link_loss_pct / 5.0, 0.0, 1.0);

        let w = &self.cfg;
        clamp(
            w.risk_w_trust * trust_term
                + w.risk_w_ssd_wear * ssd_wear
                + w.risk_w_crash * crash_term
                + w.risk_w_thermal * thermal_term
                + w.risk_w_link_loss * link_term,
            0.0,
            1.0,
        )
    }

    /// Sequential pipeline cost for the given stage→node assignments. Any
    /// unassigned or non-finite stage pins the total latency at infinity.
    pub fn job_cost(&self, job: &JobSpec, assignments: &BTreeMap<String, String>) -> JobCost {
        let mut total_ms: f64 = 0.0;
        let mut total_kj = 0.0;
        let mut risks: Vec<f64> = Vec::new();
        let mut per_stage = Vec::new();

        let mut prev_node: Option<&str> = None;
        for stage in &job.stages {
            let Some(node_name) = assignments.get(&stage.id) else {
                per_stage.push(StageCost {
                    id: stage.id.clone(),
                    node: None,
                    compute_ms: f64::INFINITY,
                    xfer_ms: 0.0,
                    energy_kj: 0.0,
                    risk: 1.0,
                });
                total_ms = f64::INFINITY;
                continue;
            };
            let Some(node) = self.snapshot.node(node_name) else {
                per_stage.push(StageCost {
                    id: stage.id.clone(),
                    node: Some(node_name.clone()),
                    compute_ms: f64::INFINITY,
                    xfer_ms: 0.0,
                    energy_kj: 0.0,
                    risk: 1.0,
                });
                total_ms = f64::INFINITY;
                continue;
            };

            let size_mb = stage_size_mb(stage);
            let (xfer_ms, link_loss) = match prev_node {
                None => (0.0, 0.0),
                Some(prev) => {
                    let metrics = self.snapshot.link_between(Some(prev), node_name);
                    (
                        self.transfer_time_ms(prev, node_name, size_mb),
                        metrics.loss_pct,
                    )
                }
            };

            let compute_ms = self.compute_time_ms(stage, node);
            let energy = self.energy_kj(stage, node, compute_ms);
            let risk = self.risk_score(stage, node, link_loss);

            per_stage.push(StageCost {
                id: stage.id.clone(),
                node: Some(node_name.clone()),
                compute_ms,
                xfer_ms,
                energy_kj: energy,
                risk,
            });

            if compute_ms.is_finite() && xfer_ms.is_finite() {
                total_ms += compute_ms + xfer_ms;
                total_kj += energy;
                risks.push(risk);
            } else {
                total_ms = f64::INFINITY;
            }

            prev_node = Some(node_name);
        }

        let agg_risk = if risks.is_empty() {
            1.0
        } else {
            risks.iter().sum::<f64>() / risks.len() as f64
        };

        JobCost {
            latency_ms: total_ms,
            energy_kj: total_kj,
            risk: agg_risk,
            per_stage,
        }
    }

    /// Smooth, monotonic penalty for blowing a deadline. Zero while the
    /// latency fits; grows with the overrun ratio, capped at 100x.
    pub fn slo_penalty(&self, deadline_ms: f64, latency_ms: f64) -> f64 {
        if deadline_ms <= 0.0 || !latency_ms.is_finite() {
            return 0.0;
        }
        let ratio = clamp(latency_ms / deadline_ms.max(1.0), 0.0, 100.0);
        if ratio <= 1.0 {
            return 0.0;
        }
        (ratio.powf(self.cfg.slo_alpha) - 1.0) / self.cfg.slo_beta.max(1e-6)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{FabricStore, StoreConfig};
    use fabric_io::{LinkSpec, NodeDescriptor, StageResources, TopologyDoc};
    use serde_json::json;

    fn descriptor(name: &str) -> NodeDescriptor {
        let mut desc = NodeDescriptor::default();
        desc.name = name.to_string();
        desc.cpu.cores = 8.0;
        desc.cpu.base_ghz = 2.0;
        desc.memory.ram_gb = 32.0;
        desc.formats_supported = vec!["native".to_string()];
        desc
    }

    fn snapshot_with(nodes: Vec<NodeDescriptor>, topo: TopologyDoc) -> FabricSnapshot {
        FabricStore::from_parts(nodes, topo, StoreConfig::default()).snapshot()
    }

    fn stage(id: &str, size_mb: f64, cpu: f64) -> StageSpec {
        StageSpec {
            id: id.to_string(),
            size_mb: Some(size_mb),
            resources: StageResources {
                cpu_cores: Some(cpu),
                mem_gb: Some(1.0),
                gpu_vram_gb: None,
            },
            ..Default::default()
        }
    }

    #[test]
    fn compute_time_respects_floor_and_cpu_scale() {
        let snap = snapshot_with(vec![descriptor("a")], TopologyDoc::default());
        let cm = CostModel::new(&snap);
        let node = snap.node("a").unwrap();

        // 16 cpu_units / 10 = 1.6 scale; work = 12*2 + 1*120 = 144
        let t = cm.compute_time_ms(&stage("s", 12.0, 1.0), node);
        assert!((t - 90.0).abs() < 1e-9);

        // tiny stage floors at MIN_STAGE_MS
        let t = cm.compute_time_ms(&stage("s", 0.1, 0.0), node);
        assert_eq!(t, 15.0);
    }

    #[test]
    fn full_derate_means_infinite_compute() {
        let mut desc = descriptor("a");
        desc.health.thermal_derate = 1.0;
        let snap = snapshot_with(vec![desc], TopologyDoc::default());
        let cm = CostModel::new(&snap);
        let t = cm.compute_time_ms(&stage("s", 10.0, 1.0), snap.node("a").unwrap());
        assert!(t.is_infinite());
    }

    #[test]
    fn cuda_boost_caps_and_needs_permission() {
        let mut desc = descriptor("gpu-box");
        desc.formats_supported = vec!["native".to_string(), "cuda".to_string()];
        desc.gpu.accel_score = 100.0; // would be 11x uncapped
        let snap = snapshot_with(vec![desc], TopologyDoc::default());
        let cm = CostModel::new(&snap);
        let node = snap.node("gpu-box").unwrap();

        let plain = cm.compute_time_ms(&stage("s", 100.0, 4.0), node);
        let mut cuda_stage = stage("s", 100.0, 4.0);
        cuda_stage.allowed_formats = vec!["cuda".to_string()];
        let boosted = cm.compute_time_ms(&cuda_stage, node);
        // boost is clamped to 6x; plain compute already sees the cuda support
        assert!((plain - boosted).abs() < 1e-9);

        let mut no_cuda = stage("s", 100.0, 4.0);
        no_cuda.disallowed_formats = vec!["cuda".to_string()];
        let slow = cm.compute_time_ms(&no_cuda, node);
        assert!(slow > boosted * 5.0);
    }

    #[test]
    fn unsupported_allowed_set_is_penalised_but_finite() {
        let snap = snapshot_with(vec![descriptor("a")], TopologyDoc::default());
        let cm = CostModel::new(&snap);
        let mut npu_only = stage("s", 10.0, 1.0);
        npu_only.allowed_formats = vec!["npu".to_string()];
        let t = cm.compute_time_ms(&npu_only, snap.node("a").unwrap());
        assert!(t.is_finite());
        // accel multiplier 0.5 is floored to 1 in the divisor, so the time
        // equals the plain evaluation
        let plain = cm.compute_time_ms(&stage("s", 10.0, 1.0), snap.node("a").unwrap());
        assert_eq!(t, plain);
    }

    #[test]
    fn transfer_time_boundaries() {
        let mut topo = TopologyDoc::default();
        topo.links.push(LinkSpec {
            a: "a".to_string(),
            b: "b".to_string(),
            speed_gbps: Some(1.0),
            rtt_ms: Some(5.0),
            jitter_ms: Some(0.5),
            loss_pct: Some(0.0),
            ..Default::default()
        });
        let snap = snapshot_with(vec![descriptor("a"), descriptor("b")], topo);
        let cm = CostModel::new(&snap);

        assert_eq!(cm.transfer_time_ms("a", "a", 100.0), 0.0);
        assert_eq!(cm.transfer_time_ms("a", "b", 0.0), 0.0);

        // 100 MB over 1 Gbps * 0.85 → 800/850 s ≈ 941.2 ms plus rtt+jitter
        let t = cm.transfer_time_ms("a", "b", 100.0);
        assert!((t - (800.0 / 0.85 + 5.5)).abs() < 0.1);
    }

    #[test]
    fn downed_link_blocks_transfers() {
        let mut topo = TopologyDoc::default();
        topo.links.push(LinkSpec {
            a: "a".to_string(),
            b: "b".to_string(),
            speed_gbps: Some(1.0),
            ..Default::default()
        });
        let store = FabricStore::from_parts(
            vec![descriptor("a"), descriptor("b")],
            topo,
            StoreConfig::default(),
        );
        store.apply_observation(&fabric_io::Observation {
            action: fabric_io::ObservationAction::Apply,
            payload: fabric_io::ObservationPayload::Link {
                key: "a|b".to_string(),
                changes: fabric_io::LinkDynPatch {
                    down: Some(true),
                    ..Default::default()
                },
                fields: vec![],
            },
        });
        let snap = store.snapshot();
        let cm = CostModel::new(&snap);
        assert!(cm.transfer_time_ms("a", "b", 1.0).is_infinite());
        assert_eq!(cm.transfer_time_ms("a", "b", 0.0), 0.0);
    }

    #[test]
    fn loss_penalty_caps_at_ceiling() {
        let mut topo = TopologyDoc::default();
        topo.links.push(LinkSpec {
            a: "a".to_string(),
            b: "b".to_string(),
            speed_gbps: Some(1.0),
            rtt_ms: Some(0.0),
            jitter_ms: Some(0.0),
            loss_pct: Some(90.0),
            ..Default::default()
        });
        let snap = snapshot_with(vec![descriptor("a"), descriptor("b")], topo);
        let cm = CostModel::new(&snap);
        // 90% loss is capped to a 30% throughput haircut
        let t = cm.transfer_time_ms("a", "b", 100.0);
        assert!((t - 800.0 / (0.85 * 0.70)).abs() < 0.1);
    }

    #[test]
    fn energy_scales_with_utilisation() {
        let snap = snapshot_with(vec![descriptor("a")], TopologyDoc::default());
        let cm = CostModel::new(&snap);
        let node = snap.node("a").unwrap();

        let low = cm.energy_kj(&stage("s", 10.0, 1.0), node, 1000.0);
        let high = cm.energy_kj(&stage("s", 10.0, 8.0), node, 1000.0);
        assert!(high > low);
        assert!(low > 0.0);

        // infinite compute contributes no energy
        assert_eq!(cm.energy_kj(&stage("s", 10.0, 1.0), node, f64::INFINITY), 0.0);
    }

    #[test]
    fn risk_blends_trust_and_wear() {
        let mut shady = descriptor("shady");
        shady.labels.insert("trust".to_string(), json!(0.1));
        shady.storage.tbw_pct_used = 80.0;
        shady.health.last_week_crashes = 10.0;
        let mut solid = descriptor("solid");
        solid.labels.insert("trust".to_string(), json!(1.0));

        let snap = snapshot_with(vec![shady, solid], TopologyDoc::default());
        let cm = CostModel::new(&snap);
        let st = stage("s", 10.0, 1.0);

        let risky = cm.risk_score(&st, snap.node("shady").unwrap(), 0.0);
        let safe = cm.risk_score(&st, snap.node("solid").unwrap(), 0.0);
        assert!(risky > 0.6);
        assert!(safe < 0.05);

        // unlabelled trust defaults to 0.8
        let plain = cm.risk_score(&st, snap.node("shady").unwrap(), 0.0);
        assert!(plain <= 1.0);
        let with_loss = cm.risk_score(&st, snap.node("solid").unwrap(), 10.0);
        assert!((with_loss - safe - 0.10).abs() < 1e-9);
    }

    #[test]
    fn job_cost_chains_transfers_and_averages_risk() {
        let mut topo = TopologyDoc::default();
        topo.links.push(LinkSpec {
            a: "a".to_string(),
            b: "b".to_string(),
            speed_gbps: Some(10.0),
            rtt_ms: Some(2.0),
            jitter_ms: Some(0.0),
            ..Default::default()
        });
        let snap = snapshot_with(vec![descriptor("a"), descriptor("b")], topo);
        let cm = CostModel::new(&snap);

        let job = JobSpec {
            id: "j".to_string(),
            deadline_ms: None,
            stages: vec![stage("s1", 10.0, 1.0), stage("s2", 10.0, 1.0)],
        };
        let mut assignments = BTreeMap::new();
        assignments.insert("s1".to_string(), "a".to_string());
        assignments.insert("s2".to_string(), "b".to_string());

        let cost = cm.job_cost(&job, &assignments);
        assert!(cost.latency_ms.is_finite());
        assert_eq!(cost.per_stage.len(), 2);
        assert_eq!(cost.per_stage[0].xfer_ms, 0.0);
        assert!(cost.per_stage[1].xfer_ms > 0.0);
        let sum: f64 = cost
            .per_stage
            .iter()
            .map(|s| s.compute_ms + s.xfer_ms)
            .sum();
        assert!((cost.latency_ms - sum).abs() < 1e-9);
    }

    #[test]
    fn missing_assignment_pins_latency_at_infinity() {
        let snap = snapshot_with(vec![descriptor("a")], TopologyDoc::default());
        let cm = CostModel::new(&snap);
        let job = JobSpec {
            id: "j".to_string(),
            deadline_ms: None,
            stages: vec![stage("s1", 10.0, 1.0), stage("s2", 10.0, 1.0)],
        };
        let mut assignments = BTreeMap::new();
        assignments.insert("s1".to_string(), "a".to_string());

        let cost = cm.job_cost(&job, &assignments);
        assert!(cost.latency_ms.is_infinite());
        assert_eq!(cost.per_stage[1].risk, 1.0);
        assert!(cost.per_stage[1].node.is_none());
    }

    #[test]
    fn slo_penalty_curve_matches_reference_points() {
        let snap = snapshot_with(vec![descriptor("a")], TopologyDoc::default());
        let cm = CostModel::new(&snap);

        assert_eq!(cm.slo_penalty(1000.0, 1000.0), 0.0);
        assert_eq!(cm.slo_penalty(0.0, 99999.0), 0.0);
        assert_eq!(cm.slo_penalty(1000.0, f64::INFINITY), 0.0);

        let p1200 = cm.slo_penalty(1000.0, 1200.0);
        let p2000 = cm.slo_penalty(1000.0, 2000.0);
        assert!((p1200 - ((1.2f64.powf(1.2) - 1.0) / 0.002)).abs() < 0.5);
        assert!((p2000 - ((2.0f64.powf(1.2) - 1.0) / 0.002)).abs() < 0.5);
        assert!(p2000 > p1200 && p1200 > 0.0);
    }
}

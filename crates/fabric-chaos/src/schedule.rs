use serde::Serialize;
use tracing::warn;

use fabric_io::{ChaosEventSpec, LinkDynPatch, NodeDynPatch, TopologyDoc};

use crate::ChaosError;

fn clamp01(x: f64) -> f64 {
    x.clamp(0.0, 1.0)
}

fn clamp_loss(x: f64) -> f64 {
    x.clamp(0.0, 100.0)
}

/// One typed fault action, compiled from a raw topology entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChaosAction {
    LinkDown { a: String, b: String },
    LinkUp { a: String, b: String },
    LinkDegrade { a: String, b: String, fields: LinkDynPatch },
    NodeKill { node: String },
    NodeRecover { node: String },
    NodePatch { node: String, fields: NodeDynPatch },
    ZoneBlackout { label: String, value: String },
    ZoneRecover { label: String, value: String },
    FederationPartition {
        label: String,
        a: String,
        b: String,
        fields: LinkDynPatch,
    },
}

/// A compiled schedule entry. `revert` entries are synthesised for bounded
/// events and undo exactly the fields the forward action set.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScheduledEvent {
    pub at_s: f64,
    pub duration_s: f64,
    pub revert: bool,
    pub action: ChaosAction,
}

impl ScheduledEvent {
    pub fn describe(&self) -> String {
        let mut out = format!("t={:7.2}s", self.at_s);
        if self.revert {
            out.push_str(" revert");
        } else if self.duration_s > 0.0 {
            out.push_str(&format!(" dur={:.2}s", self.duration_s));
        }
        match &self.action {
            ChaosAction::LinkDown { a, b } => out.push_str(&format!(" link_down {a}<->{b}")),
            ChaosAction::LinkUp { a, b } => out.push_str(&format!(" link_up {a}<->{b}")),
            ChaosAction::LinkDegrade { a, b, .. } => {
                out.push_str(&format!(" link_degrade {a}<->{b}"))
            }
            ChaosAction::NodeKill { node } => out.push_str(&format!(" node_kill {node}")),
            ChaosAction::NodeRecover { node } => out.push_str(&format!(" node_recover {node}")),
            ChaosAction::NodePatch { node, fields } => {
                out.push_str(&format!(" node_patch {node} {:?}", fields.set_fields()))
            }
            ChaosAction::ZoneBlackout { label, value } => {
                out.push_str(&format!(" zone_blackout {label}={value}"))
            }
            ChaosAction::ZoneRecover { label, value } => {
                out.push_str(&format!(" zone_recover {label}={value}"))
            }
            ChaosAction::FederationPartition { label, a, b, .. } => {
                out.push_str(&format!(" federation_partition {label}:{a}<->{b}"))
            }
        }
        out
    }
}

fn link_endpoints(spec: &ChaosEventSpec) -> Option<(String, String)> {
    match (&spec.a, &spec.b) {
        (Some(a), Some(b)) if !a.is_empty() && !b.is_empty() => Some((a.clone(), b.clone())),
        _ => None,
    }
}

fn link_fields(spec: &ChaosEventSpec) -> LinkDynPatch {
    LinkDynPatch {
        down: None,
        speed_gbps: spec.speed_gbps.map(|v| v.max(0.0)),
        rtt_ms: spec.rtt_ms.map(|v| v.max(0.0)),
        jitter_ms: spec.jitter_ms.map(|v| v.max(0.0)),
        loss_pct: spec.loss_pct.map(clamp_loss),
        ecn: spec.ecn,
    }
}

/// Compile one raw entry into a typed action; `None` drops the entry with
/// a warning so a bad line never sinks the whole scenario.
fn compile_action(spec: &ChaosEventSpec) -> Option<ChaosAction> {
    match spec.kind.as_str() {
        "link_down" | "link_up" | "link_degrade" | "link_loss_spike" => {
            let Some((a, b)) = link_endpoints(spec) else {
                warn!(kind = %spec.kind, "skipping link event without endpoints");
                return None;
            };
            Some(match spec.kind.as_str() {
                "link_down" => ChaosAction::LinkDown { a, b },
                "link_up" => ChaosAction::LinkUp { a, b },
                "link_loss_spike" => ChaosAction::LinkDegrade {
                    a,
                    b,
                    fields: LinkDynPatch {
                        loss_pct: spec.loss_pct.map(clamp_loss),
                        ..Default::default()
                    },
                },
                _ => ChaosAction::LinkDegrade {
                    a,
                    b,
                    fields: link_fields(spec),
                },
            })
        }
        "node_kill" | "node_recover" | "power_cap" | "thermal_derate" | "clock_skew"
        | "packet_dup" | "packet_reorder" => {
            let Some(node) = spec.node.clone().filter(|n| !n.is_empty()) else {
                warn!(kind = %spec.kind, "skipping node event without a node");
                return None;
            };
            Some(match spec.kind.as_str() {
                "node_kill" => ChaosAction::NodeKill { node },
                "node_recover" => ChaosAction::NodeRecover { node },
                "power_cap" => ChaosAction::NodePatch {
                    node,
                    fields: NodeDynPatch {
                        power_cap_w: Some(spec.power_cap_w.unwrap_or(0.0).max(0.0)),
                        ..Default::default()
                    },
                },
                "thermal_derate" => ChaosAction::NodePatch {
                    node,
                    fields: NodeDynPatch {
                        thermal_derate: Some(clamp01(spec.thermal_derate.unwrap_or(0.2))),
                        ..Default::default()
                    },
                },
                "clock_skew" => ChaosAction::NodePatch {
                    node,
                    fields: NodeDynPatch {
                        clock_skew_ms: Some(spec.skew_ms.unwrap_or(50.0)),
                        ..Default::default()
                    },
                },
                "packet_dup" => ChaosAction::NodePatch {
                    node,
                    fields: NodeDynPatch {
                        packet_dup: Some(clamp01(spec.packet_dup.unwrap_or(0.1))),
                        ..Default::default()
                    },
                },
                _ => ChaosAction::NodePatch {
                    node,
                    fields: NodeDynPatch {
                        packet_reorder: Some(clamp01(spec.packet_reorder.unwrap_or(0.1))),
                        ..Default::default()
                    },
                },
            })
        }
        "zone_blackout" | "zone_recover" => {
            let (Some(label), Some(value)) = (spec.label.clone(), spec.value.clone()) else {
                warn!(kind = %spec.kind, "skipping zone event without label/value");
                return None;
            };
            Some(if spec.kind == "zone_blackout" {
                ChaosAction::ZoneBlackout { label, value }
            } else {
                ChaosAction::ZoneRecover { label, value }
            })
        }
        "federation_partition" => {
            let label = spec.label.clone().unwrap_or_else(|| "federation".to_string());
            let (Some(a), Some(b)) = (spec.value.clone(), spec.value_b.clone()) else {
                warn!("skipping federation_partition without both groups");
                return None;
            };
            let mut fields = link_fields(spec);
            if fields.is_empty() {
                // default degradation for an unparameterised partition
                fields.loss_pct = Some(12.0);
                fields.rtt_ms = Some(35.0);
            }
            Some(ChaosAction::FederationPartition { label, a, b, fields })
        }
        other => {
            warn!(kind = %other, "unknown chaos event kind");
            None
        }
    }
}

/// Collect the top-level chaos list plus the selected scenario's events,
/// compile them, inject synthetic reverts for bounded events, and sort the
/// whole schedule by virtual time (stable for ties).
pub fn compile_schedule(
    topology: &TopologyDoc,
    scenario: Option<&str>,
) -> Result<Vec<ScheduledEvent>, ChaosError> {
    let mut raw: Vec<&ChaosEventSpec> = topology.chaos.iter().collect();
    if let Some(name) = scenario {
        let sc = topology
            .scenarios
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| ChaosError::UnknownScenario(name.to_string()))?;
        raw.extend(sc.chaos.iter());
    }

    let mut schedule = Vec::new();
    for spec in raw {
        let Some(action) = compile_action(spec) else {
            continue;
        };
        let duration = spec.duration_s.max(0.0);
        schedule.push(ScheduledEvent {
            at_s: spec.at_s,
            duration_s: duration,
            revert: false,
            action: action.clone(),
        });
        if duration > 0.0 {
            schedule.push(ScheduledEvent {
                at_s: spec.at_s + duration,
                duration_s: 0.0,
                revert: true,
                action,
            });
        }
    }

    schedule.sort_by(|a, b| a.at_s.total_cmp(&b.at_s));
    Ok(schedule)
}

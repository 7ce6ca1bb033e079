use fabric_io::{NetworkDefaults, NodeDescriptor};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::federation::{FederationLinkStats, FederationStats};
use crate::types::{EffectiveCaps, LinkBase, LinkDyn, LinkMetrics, NodeCaps, NodeDyn};

/// Point-in-time, deep-copied view of the whole fabric. Everything a
/// planner or an operator dashboard needs, detached from the store: mutating
/// a snapshot never touches live state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FabricSnapshot {
    pub ts_ms: i64,
    pub nodes: BTreeMap<String, NodeView>,
    pub links: BTreeMap<String, LinkView>,
    pub defaults: NetworkDefaults,
    pub federations: Vec<FederationStats>,
    pub federation_links: Vec<FederationLinkStats>,
    pub node_federations: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeView {
    pub desc: NodeDescriptor,
    pub caps: NodeCaps,
    #[serde(rename = "dyn")]
    pub dyn_state: NodeDyn,
    pub effective: EffectiveCaps,
}

impl NodeView {
    pub fn is_down(&self) -> bool {
        self.dyn_state.down
    }

    /// Worst-case thermal derate: runtime observation or declared health.
    pub fn thermal_derate(&self) -> f64 {
        self.dyn_state
            .thermal_derate
            .max(self.desc.health.thermal_derate)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkView {
    pub a: String,
    pub b: String,
    pub base: LinkBase,
    #[serde(rename = "dyn")]
    pub dyn_state: LinkDyn,
    pub effective: LinkMetrics,
}

/// Resolve dyn-over-base-over-defaults metrics for an explicit link.
pub fn effective_link(base: &LinkBase, dyn_state: &LinkDyn, defaults: &NetworkDefaults) -> LinkMetrics {
    LinkMetrics {
        down: dyn_state.down,
        speed_gbps: dyn_state
            .speed_gbps
            .or(base.speed_gbps)
            .unwrap_or(defaults.speed_gbps),
        rtt_ms: dyn_state.rtt_ms.or(base.rtt_ms).unwrap_or(defaults.rtt_ms),
        jitter_ms: dyn_state
            .jitter_ms
            .or(base.jitter_ms)
            .unwrap_or(defaults.jitter_ms),
        loss_pct: dyn_state
            .loss_pct
            .or(base.loss_pct)
            .unwrap_or(defaults.loss_pct),
        ecn: dyn_state.ecn.or(base.ecn).unwrap_or(false),
        estimated: false,
    }
}

/// Synthesise metrics for a pair with no explicit link: the slower of the
/// two declared speeds, the worse of the declared latencies and losses, and
/// defaults for the rest.
pub fn estimate_link(
    a: Option<&NodeDescriptor>,
    b: Option<&NodeDescriptor>,
    defaults: &NetworkDefaults,
) -> LinkMetrics {
    let node_speed = |node: Option<&NodeDescriptor>| {
        node.and_then(|n| n.declared_speed_gbps())
            .unwrap_or(defaults.speed_gbps)
    };

    let mut rtt = defaults.rtt_ms;
    let mut loss = defaults.loss_pct;
    for node in [a, b].into_iter().flatten() {
        if let Some(latency) = node.network.base_latency_ms {
            rtt = rtt.max(latency);
        }
        if let Some(node_loss) = node.network.loss_pct {
            loss = loss.max(node_loss);
        }
    }

    LinkMetrics {
        down: false,
        speed_gbps: node_speed(a).min(node_speed(b)),
        rtt_ms: rtt,
        jitter_ms: defaults.jitter_ms,
        loss_pct: loss,
        ecn: false,
        estimated: true,
    }
}

impl FabricSnapshot {
    pub fn node(&self, name: &str) -> Option<&NodeView> {
        self.nodes.get(name)
    }

    pub fn federation_of(&self, node: &str) -> &str {
        self.node_federations
            .get(node)
            .map(String::as_str)
            .unwrap_or("global")
    }

    /// Metrics for moving data from `src` to `dst`. No previous hop or the
    /// same node means a free local handoff.
    pub fn link_between(&self, src: Option<&str>, dst: &str) -> LinkMetrics {
        let src = match src {
            Some(s) if s != dst => s,
            _ => return LinkMetrics::loopback(),
        };
        let key = crate::types::link_key(src, dst);
        if let Some(link) = self.links.get(&key) {
            return link.effective;
        }
        estimate_link(
            self.nodes.get(src).map(|n| &n.desc),
            self.nodes.get(dst).map(|n| &n.desc),
            &self.defaults,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> NetworkDefaults {
        NetworkDefaults {
            speed_gbps: 1.0,
            rtt_ms: 5.0,
            jitter_ms: 0.5,
            loss_pct: 0.0,
        }
    }

    #[test]
    fn dyn_fields_shadow_base_and_defaults() {
        let base = LinkBase {
            speed_gbps: Some(10.0),
            rtt_ms: Some(1.0),
            ..Default::default()
        };
        let dyn_state = LinkDyn {
            rtt_ms: Some(40.0),
            loss_pct: Some(12.0),
            ..Default::default()
        };
        let eff = effective_link(&base, &dyn_state, &defaults());
        assert_eq!(eff.speed_gbps, 10.0); // base
        assert_eq!(eff.rtt_ms, 40.0); // dyn wins
        assert_eq!(eff.loss_pct, 12.0); // dyn
        assert_eq!(eff.jitter_ms, 0.5); // defaults
        assert!(!eff.estimated);
    }

    #[test]
    fn estimation_takes_min_speed_and_max_latency() {
        let mut fast = NodeDescriptor::default();
        fast.network.speed_gbps = Some(10.0);
        fast.network.base_latency_ms = Some(2.0);
        let mut slow = NodeDescriptor::default();
        slow.network.speed_gbps = Some(0.4);
        slow.network.base_latency_ms = Some(20.0);

        let eff = estimate_link(Some(&fast), Some(&slow), &defaults());
        assert_eq!(eff.speed_gbps, 0.4);
        assert_eq!(eff.rtt_ms, 20.0);
        assert!(eff.estimated);
        assert!(!eff.down);
    }

    #[test]
    fn estimation_falls_back_to_defaults_for_unknown_nodes() {
        let eff = estimate_link(None, None, &defaults());
        assert_eq!(eff.speed_gbps, 1.0);
        assert_eq!(eff.rtt_ms, 5.0);
    }
}

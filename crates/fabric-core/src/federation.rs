use fabric_io::NodeDescriptor;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::snapshot::{LinkView, NodeView};
use crate::types::clamp;

/// Nodes count as "hot" for federation health once their runtime derate
/// crosses this threshold.
const HOT_DERATE_THRESHOLD: f64 = 0.25;

/// Aggregate health and capacity for one label-derived federation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FederationStats {
    pub name: String,
    pub nodes: Vec<String>,
    pub total_cpu_cores: f64,
    pub free_cpu_cores: f64,
    pub total_mem_gb: f64,
    pub free_mem_gb: f64,
    pub total_gpu_vram_gb: f64,
    pub free_gpu_vram_gb: f64,
    pub down_nodes: u32,
    pub hot_nodes: u32,
    pub reservations: u32,
    pub avg_trust: Option<f64>,
    pub avg_loss_pct: Option<f64>,
    pub load_factor: f64,
    pub down_fraction: f64,
    pub hot_fraction: f64,
}

/// Health of the link bundle between two federations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FederationLinkStats {
    pub a: String,
    pub b: String,
    pub links: u32,
    pub down_links: u32,
    pub min_speed_gbps: Option<f64>,
    pub max_loss_pct: f64,
    pub avg_rtt_ms: f64,
}

/// First locality-ish label wins; unlabelled nodes pool into "global".
pub fn federation_name(desc: &NodeDescriptor) -> String {
    for key in ["federation", "zone", "site", "rack", "region"] {
        if let Some(value) = desc.label(key) {
            return value;
        }
    }
    "global".to_string()
}

struct FedAccumulator {
    stats: FederationStats,
    trust_sum: f64,
    trust_count: u32,
    loss_sum: f64,
    loss_count: u32,
}

impl FedAccumulator {
    fn new(name: &str) -> Self {
        Self {
            stats: FederationStats {
                name: name.to_string(),
                ..Default::default()
            },
            trust_sum: 0.0,
            trust_count: 0,
            loss_sum: 0.0,
            loss_count: 0,
        }
    }
}

/// Derive the federation overview from node and link views: per-federation
/// aggregates, cross-federation link buckets, and the node→federation map.
pub fn federation_overview(
    nodes: &BTreeMap<String, NodeView>,
    links: &BTreeMap<String, LinkView>,
) -> (
    Vec<FederationStats>,
    Vec<FederationLinkStats>,
    BTreeMap<String, String>,
) {
    let mut accs: BTreeMap<String, FedAccumulator> = BTreeMap::new();
    let mut node_to_fed: BTreeMap<String, String> = BTreeMap::new();

    for (name, node) in nodes {
        let fed = federation_name(&node.desc);
        node_to_fed.insert(name.clone(), fed.clone());
        let acc = accs
            .entry(fed.clone())
            .or_insert_with(|| FedAccumulator::new(&fed));

        acc.stats.nodes.push(name.clone());
        acc.stats.total_cpu_cores += node.caps.max_cpu_cores;
        acc.stats.free_cpu_cores += node.effective.free_cpu_cores;
        acc.stats.total_mem_gb += node.caps.ram_gb;
        acc.stats.free_mem_gb += node.effective.free_mem_gb;
        acc.stats.total_gpu_vram_gb += node.caps.gpu_vram_gb;
        acc.stats.free_gpu_vram_gb += node.effective.free_gpu_vram_gb;

        if node.dyn_state.down {
            acc.stats.down_nodes += 1;
        }
        if node.dyn_state.thermal_derate >= HOT_DERATE_THRESHOLD {
            acc.stats.hot_nodes += 1;
        }
        acc.stats.reservations += node.dyn_state.reservations.len() as u32;

        if let Some(trust) = node.desc.trust() {
            acc.trust_sum += trust;
            acc.trust_count += 1;
        }
        if let Some(loss) = node.desc.network.loss_pct {
            acc.loss_sum += loss;
            acc.loss_count += 1;
        }
    }

    let federations: Vec<FederationStats> = accs
        .into_values()
        .map(|acc| {
            let mut stats = acc.stats;
            let total_nodes = stats.nodes.len() as f64;
            stats.avg_trust = (acc.trust_count > 0).then(|| acc.trust_sum / acc.trust_count as f64);
            stats.avg_loss_pct = (acc.loss_count > 0).then(|| acc.loss_sum / acc.loss_count as f64);
            stats.load_factor = if stats.total_cpu_cores <= 0.0 {
                0.0
            } else {
                clamp(
                    (stats.total_cpu_cores - stats.free_cpu_cores) / stats.total_cpu_cores,
                    0.0,
                    1.0,
                )
            };
            stats.down_fraction = if total_nodes == 0.0 {
                0.0
            } else {
                stats.down_nodes as f64 / total_nodes
            };
            stats.hot_fraction = if total_nodes == 0.0 {
                0.0
            } else {
                stats.hot_nodes as f64 / total_nodes
            };
            stats
        })
        .collect();

    // Cross-federation link buckets, keyed by the sorted federation pair.
    struct Bucket {
        links: u32,
        down: u32,
        min_speed: f64,
        max_loss: f64,
        rtt_sum: f64,
    }
    let mut buckets: BTreeMap<(String, String), Bucket> = BTreeMap::new();

    for link in links.values() {
        // Endpoints that are not known nodes (e.g. the synthetic federation
        // links chaos publishes for dashboards) count as their own group.
        let fa = node_to_fed.get(&link.a).cloned().unwrap_or_else(|| link.a.clone());
        let fb = node_to_fed.get(&link.b).cloned().unwrap_or_else(|| link.b.clone());
        if fa == fb {
            continue;
        }
        let pair = if fa <= fb { (fa, fb) } else { (fb, fa) };
        let bucket = buckets.entry(pair).or_insert(Bucket {
            links: 0,
            down: 0,
            min_speed: f64::INFINITY,
            max_loss: 0.0,
            rtt_sum: 0.0,
        });
        bucket.links += 1;
        if link.effective.down {
            bucket.down += 1;
        }
        bucket.min_speed = bucket.min_speed.min(link.effective.speed_gbps);
        bucket.max_loss = bucket.max_loss.max(link.effective.loss_pct);
        bucket.rtt_sum += link.effective.rtt_ms;
    }

    let federation_links: Vec<FederationLinkStats> = buckets
        .into_iter()
        .map(|((a, b), bucket)| FederationLinkStats {
            a,
            b,
            links: bucket.links,
            down_links: bucket.down,
            min_speed_gbps: bucket.min_speed.is_finite().then_some(bucket.min_speed),
            max_loss_pct: bucket.max_loss,
            avg_rtt_ms: bucket.rtt_sum / bucket.links.max(1) as f64,
        })
        .collect();

    (federations, federation_links, node_to_fed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::effective_link;
    use crate::types::{EffectiveCaps, LinkBase, LinkDyn, NodeCaps, NodeDyn};
    use fabric_io::NetworkDefaults;
    use serde_json::json;

    fn view(name: &str, fed: Option<&str>, cores: f64, used: f64, down: bool) -> (String, NodeView) {
        let mut desc = NodeDescriptor::default();
        desc.name = name.to_string();
        if let Some(fed) = fed {
            desc.labels.insert("federation".to_string(), json!(fed));
        }
        desc.cpu.cores = cores;
        desc.cpu.base_ghz = 2.0;
        desc.memory.ram_gb = 8.0;
        let caps = NodeCaps::from_descriptor(&desc);
        let dyn_state = NodeDyn {
            down,
            used_cpu_cores: used,
            ..Default::default()
        };
        let effective = EffectiveCaps::compute(&caps, &dyn_state);
        (
            name.to_string(),
            NodeView {
                desc,
                caps,
                dyn_state,
                effective,
            },
        )
    }

    fn link(a: &str, b: &str, down: bool, loss: f64, rtt: f64) -> (String, LinkView) {
        let base = LinkBase {
            speed_gbps: Some(1.0),
            rtt_ms: Some(rtt),
            loss_pct: Some(loss),
            ..Default::default()
        };
        let dyn_state = LinkDyn {
            down,
            ..Default::default()
        };
        let effective = effective_link(&base, &dyn_state, &NetworkDefaults::default());
        (
            crate::types::link_key(a, b),
            LinkView {
                a: a.to_string(),
                b: b.to_string(),
                base,
                dyn_state,
                effective,
            },
        )
    }

    #[test]
    fn nodes_group_by_first_label() {
        let mut desc = NodeDescriptor::default();
        desc.labels.insert("zone".to_string(), json!("east"));
        desc.labels.insert("region".to_string(), json!("us"));
        assert_eq!(federation_name(&desc), "east");

        desc.labels.insert("federation".to_string(), json!("fed-a"));
        assert_eq!(federation_name(&desc), "fed-a");

        assert_eq!(federation_name(&NodeDescriptor::default()), "global");
    }

    #[test]
    fn overview_aggregates_capacity_and_health() {
        let mut nodes = BTreeMap::new();
        for (k, v) in [
            view("a1", Some("fed-a"), 4.0, 2.0, false),
            view("a2", Some("fed-a"), 4.0, 0.0, true),
            view("b1", Some("fed-b"), 8.0, 0.0, false),
        ] {
            nodes.insert(k, v);
        }
        let links = BTreeMap::new();

        let (feds, _, node_to_fed) = federation_overview(&nodes, &links);
        assert_eq!(feds.len(), 2);
        let fed_a = feds.iter().find(|f| f.name == "fed-a").unwrap();
        assert_eq!(fed_a.total_cpu_cores, 8.0);
        assert_eq!(fed_a.free_cpu_cores, 6.0);
        assert_eq!(fed_a.down_nodes, 1);
        assert_eq!(fed_a.down_fraction, 0.5);
        assert_eq!(fed_a.load_factor, 0.25);
        assert_eq!(node_to_fed.get("b1").unwrap(), "fed-b");
    }

    #[test]
    fn cross_federation_links_bucket_by_pair() {
        let mut nodes = BTreeMap::new();
        for (k, v) in [
            view("a1", Some("fed-a"), 4.0, 0.0, false),
            view("a2", Some("fed-a"), 4.0, 0.0, false),
            view("b1", Some("fed-b"), 4.0, 0.0, false),
        ] {
            nodes.insert(k, v);
        }
        let mut links = BTreeMap::new();
        for (k, v) in [
            link("a1", "b1", false, 2.0, 10.0),
            link("a2", "b1", true, 6.0, 30.0),
            link("a1", "a2", false, 0.0, 1.0), // intra-fed, excluded
        ] {
            links.insert(k, v);
        }

        let (_, fed_links, _) = federation_overview(&nodes, &links);
        assert_eq!(fed_links.len(), 1);
        let bucket = &fed_links[0];
        assert_eq!((bucket.a.as_str(), bucket.b.as_str()), ("fed-a", "fed-b"));
        assert_eq!(bucket.links, 2);
        assert_eq!(bucket.down_links, 1);
        assert_eq!(bucket.max_loss_pct, 6.0);
        assert_eq!(bucket.avg_rtt_ms, 20.0);
    }
}

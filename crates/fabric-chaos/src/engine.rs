use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{info, warn};

use fabric_io::{label_string, NodeDescriptor};

use crate::schedule::{ChaosAction, ScheduledEvent};
use crate::sink::OverridesSink;

const POLL_SLEEP: Duration = Duration::from_millis(20);

/// Virtual-time dispatcher: walks a compiled schedule, applying each event
/// once its virtual timestamp is due, with wall time accelerated by a
/// configurable speed factor.
pub struct ChaosEngine {
    sink: OverridesSink,
    speed: f64,
    /// label name, then label value, to node names, for grouped events.
    label_index: BTreeMap<String, BTreeMap<String, Vec<String>>>,
}

impl ChaosEngine {
    pub fn new(sink: OverridesSink, speed: f64, nodes: &[NodeDescriptor]) -> Self {
        Self {
            sink,
            speed: speed.max(0.01),
            label_index: build_label_index(nodes),
        }
    }

    pub fn sink(&self) -> &OverridesSink {
        &self.sink
    }

    fn nodes_for(&self, label: &str, value: &str) -> Vec<String> {
        self.label_index
            .get(label)
            .and_then(|values| values.get(value))
            .cloned()
            .unwrap_or_default()
    }

    /// Run the schedule to completion or until the shutdown flag flips.
    /// Re-entrant: a stopped run can be resumed with `start_offset_s` set
    /// to where it left off.
    pub async fn run(
        &mut self,
        schedule: &[ScheduledEvent],
        start_offset_s: f64,
        shutdown: watch::Receiver<bool>,
    ) {
        if schedule.is_empty() {
            info!("no chaos events to run");
            return;
        }
        info!(events = schedule.len(), speed = self.speed, "starting chaos");

        let t0 = Instant::now();
        let mut idx = schedule
            .iter()
            .position(|ev| ev.at_s >= start_offset_s)
            .unwrap_or(schedule.len());

        while idx < schedule.len() {
            if *shutdown.borrow() {
                info!("chaos stopped at event {idx}");
                return;
            }
            let vt = t0.elapsed().as_secs_f64() * self.speed + start_offset_s;
            let ev = &schedule[idx];
            if vt + 1e-6 >= ev.at_s {
                self.dispatch(ev).await;
                idx += 1;
                continue;
            }
            tokio::time::sleep(POLL_SLEEP).await;
        }
        info!("chaos finished");
    }

    pub async fn dispatch(&mut self, ev: &ScheduledEvent) {
        info!("{}", ev.describe());
        if ev.revert {
            self.revert(&ev.action).await;
        } else {
            self.apply(&ev.action).await;
        }
    }

    async fn apply(&mut self, action: &ChaosAction) {
        match action {
            ChaosAction::LinkDown { a, b } => {
                self.sink
                    .link_apply(a, b, &down_link_patch())
                    .await;
            }
            ChaosAction::LinkUp { a, b } => {
                self.sink.link_revert(a, b, &["down"]).await;
            }
            ChaosAction::LinkDegrade { a, b, fields } => {
                self.sink.link_apply(a, b, fields).await;
            }
            ChaosAction::NodeKill { node } => {
                self.sink.node_apply(node, &down_node_patch()).await;
            }
            ChaosAction::NodeRecover { node } => {
                self.sink.node_revert(node, &["down"]).await;
            }
            ChaosAction::NodePatch { node, fields } => {
                self.sink.node_apply(node, fields).await;
            }
            ChaosAction::ZoneBlackout { label, value } => {
                let nodes = self.nodes_for(label, value);
                if nodes.is_empty() {
                    warn!(label = %label, value = %value, "zone blackout matches no nodes");
                    return;
                }
                info!(count = nodes.len(), label = %label, value = %value, "zone blackout");
                for node in nodes {
                    self.sink.node_apply(&node, &down_node_patch()).await;
                }
            }
            ChaosAction::ZoneRecover { label, value } => {
                for node in self.nodes_for(label, value) {
                    self.sink.node_revert(&node, &["down"]).await;
                }
            }
            ChaosAction::FederationPartition { label, a, b, fields } => {
                let group_a = self.nodes_for(label, a);
                let group_b = self.nodes_for(label, b);
                if group_a.is_empty() || group_b.is_empty() {
                    warn!(label = %label, a = %a, b = %b, "partition group missing, skipping");
                    return;
                }
                info!(pairs = group_a.len() * group_b.len(), "federation partition {a}<->{b}");
                for na in &group_a {
                    for nb in &group_b {
                        self.sink.link_apply(na, nb, fields).await;
                    }
                }
                // synthetic federation-level link for dashboards
                self.sink.link_apply(a, b, fields).await;
            }
        }
    }

    /// Undo exactly what the forward action set. One-shot recover kinds
    /// have nothing to revert.
    async fn revert(&mut self, action: &ChaosAction) {
        match action {
            ChaosAction::LinkDown { a, b } => {
                self.sink.link_revert(a, b, &["down"]).await;
            }
            ChaosAction::LinkUp { .. } => {}
            ChaosAction::LinkDegrade { a, b, fields } => {
                self.sink.link_revert(a, b, &fields.set_fields()).await;
            }
            ChaosAction::NodeKill { node } => {
                self.sink.node_revert(node, &["down"]).await;
            }
            ChaosAction::NodeRecover { .. } => {}
            ChaosAction::NodePatch { node, fields } => {
                self.sink.node_revert(node, &fields.set_fields()).await;
            }
            ChaosAction::ZoneBlackout { label, value } => {
                for node in self.nodes_for(label, value) {
                    self.sink.node_revert(&node, &["down"]).await;
                }
            }
            ChaosAction::ZoneRecover { .. } => {}
            ChaosAction::FederationPartition { label, a, b, fields } => {
                let group_a = self.nodes_for(label, a);
                let group_b = self.nodes_for(label, b);
                let fields = fields.set_fields();
                for na in &group_a {
                    for nb in &group_b {
                        self.sink.link_revert(na, nb, &fields).await;
                    }
                }
                self.sink.link_revert(a, b, &fields).await;
            }
        }
    }
}

fn down_node_patch() -> fabric_io::NodeDynPatch {
    fabric_io::NodeDynPatch {
        down: Some(true),
        ..Default::default()
    }
}

fn down_link_patch() -> fabric_io::LinkDynPatch {
    fabric_io::LinkDynPatch {
        down: Some(true),
        ..Default::default()
    }
}

/// Index nodes by label for grouped events. Nodes without an explicit
/// federation label inherit one from zone/site/region so partitions can
/// target them uniformly.
fn build_label_index(
    nodes: &[NodeDescriptor],
) -> BTreeMap<String, BTreeMap<String, Vec<String>>> {
    let mut index: BTreeMap<String, BTreeMap<String, Vec<String>>> = BTreeMap::new();
    for node in nodes {
        let mut labels: BTreeMap<String, String> = node
            .labels
            .keys()
            .filter_map(|key| label_string(&node.labels, key).map(|v| (key.clone(), v)))
            .collect();
        if !labels.contains_key("federation") {
            for key in ["zone", "site", "region"] {
                if let Some(value) = labels.get(key).cloned() {
                    labels.insert("federation".to_string(), value);
                    break;
                }
            }
        }
        for (key, value) in labels {
            index
                .entry(key)
                .or_default()
                .entry(value)
                .or_default()
                .push(node.name.clone());
        }
    }
    for values in index.values_mut() {
        for names in values.values_mut() {
            names.sort();
            names.dedup();
        }
    }
    index
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::compile_schedule;
    use fabric_io::TopologyDoc;
    use serde_json::json;

    fn node(name: &str, zone: &str) -> NodeDescriptor {
        let mut desc = NodeDescriptor::default();
        desc.name = name.to_string();
        desc.labels.insert("zone".to_string(), json!(zone));
        desc
    }

    fn sink(dir: &tempfile::TempDir) -> OverridesSink {
        OverridesSink::new(dir.path().join("overrides.json"))
    }

    fn no_shutdown() -> watch::Receiver<bool> {
        // the loop only ever borrows the latest value, so a dropped sender
        // simply means "never stop"
        watch::channel(false).1
    }

    #[test]
    fn label_index_backfills_federation() {
        let nodes = vec![node("e1", "east"), node("e2", "east"), node("w1", "west")];
        let index = build_label_index(&nodes);
        assert_eq!(index["zone"]["east"], vec!["e1", "e2"]);
        assert_eq!(index["federation"]["east"], vec!["e1", "e2"]);
        assert_eq!(index["federation"]["west"], vec!["w1"]);
    }

    #[tokio::test]
    async fn zone_blackout_marks_every_labelled_node_down() {
        let dir = tempfile::tempdir().unwrap();
        let nodes = vec![node("e1", "east"), node("e2", "east"), node("w1", "west")];
        let mut engine = ChaosEngine::new(sink(&dir), 1000.0, &nodes);

        let topo: TopologyDoc = serde_yaml::from_str(
            r#"
chaos:
  - kind: zone_blackout
    at_s: 0
    label: zone
    value: east
"#,
        )
        .unwrap();
        let schedule = compile_schedule(&topo, None).unwrap();
        engine.run(&schedule, 0.0, no_shutdown()).await;

        let doc = engine.sink().document();
        assert_eq!(doc.nodes["e1"].down, Some(true));
        assert_eq!(doc.nodes["e2"].down, Some(true));
        assert!(!doc.nodes.contains_key("w1"));
    }

    #[tokio::test]
    async fn bounded_blackout_reverts_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let nodes = vec![node("e1", "east"), node("e2", "east")];
        let mut engine = ChaosEngine::new(sink(&dir), 1000.0, &nodes);

        let topo: TopologyDoc = serde_yaml::from_str(
            r#"
chaos:
  - kind: zone_blackout
    at_s: 0
    duration_s: 60
    label: zone
    value: east
"#,
        )
        .unwrap();
        let schedule = compile_schedule(&topo, None).unwrap();
        assert_eq!(schedule.len(), 2);
        engine.run(&schedule, 0.0, no_shutdown()).await;

        // after the synthetic revert the document is spotless
        assert!(engine.sink().document().nodes.is_empty());
    }

    #[tokio::test]
    async fn partition_degrades_every_cross_pair_and_synthetic_link() {
        let dir = tempfile::tempdir().unwrap();
        let nodes = vec![
            node("x1", "fed-x"),
            node("x2", "fed-x"),
            node("y1", "fed-y"),
        ];
        let mut engine = ChaosEngine::new(sink(&dir), 1000.0, &nodes);

        let topo: TopologyDoc = serde_yaml::from_str(
            r#"
chaos:
  - kind: federation_partition
    at_s: 0
    label: zone
    value: fed-x
    other: fed-y
    loss_pct: 12
    rtt_ms: 35
"#,
        )
        .unwrap();
        let schedule = compile_schedule(&topo, None).unwrap();
        engine.run(&schedule, 0.0, no_shutdown()).await;

        let doc = engine.sink().document();
        // 2x1 node pairs plus the federation-level synthetic link
        assert_eq!(doc.links.len(), 3);
        assert_eq!(doc.links["x1|y1"].loss_pct, Some(12.0));
        assert_eq!(doc.links["x2|y1"].rtt_ms, Some(35.0));
        assert_eq!(doc.links["fed-x|fed-y"].loss_pct, Some(12.0));
    }

    #[tokio::test]
    async fn virtual_time_accelerates_the_schedule() {
        let dir = tempfile::tempdir().unwrap();
        let nodes = vec![node("n1", "east")];
        let mut engine = ChaosEngine::new(sink(&dir), 100.0, &nodes);

        // events at 0, 5, 10, 15 virtual seconds
        let topo: TopologyDoc = serde_yaml::from_str(
            r#"
chaos:
  - kind: node_kill
    at_s: 0
    node: n1
  - kind: node_recover
    at_s: 5
    node: n1
  - kind: thermal_derate
    at_s: 10
    node: n1
    thermal_derate: 0.5
  - kind: power_cap
    at_s: 15
    node: n1
    power_cap_w: 90
"#,
        )
        .unwrap();
        let schedule = compile_schedule(&topo, None).unwrap();

        let started = Instant::now();
        engine.run(&schedule, 0.0, no_shutdown()).await;
        let elapsed = started.elapsed();

        // 15 virtual seconds at 100x is 150ms of wall time, plus slack
        assert!(elapsed >= Duration::from_millis(140), "ran too fast: {elapsed:?}");
        assert!(elapsed < Duration::from_secs(2), "ran too slow: {elapsed:?}");

        // final state proves in-order application: the kill was recovered,
        // the later patches stuck
        let doc = engine.sink().document();
        let patch = &doc.nodes["n1"];
        assert_eq!(patch.down, None);
        assert_eq!(patch.thermal_derate, Some(0.5));
        assert_eq!(patch.power_cap_w, Some(90.0));
    }

    #[tokio::test]
    async fn shutdown_stops_the_loop_within_one_iteration() {
        let dir = tempfile::tempdir().unwrap();
        let nodes = vec![node("n1", "east")];
        let mut engine = ChaosEngine::new(sink(&dir), 0.01, &nodes);

        let topo: TopologyDoc = serde_yaml::from_str(
            r#"
chaos:
  - kind: node_kill
    at_s: 3600
    node: n1
"#,
        )
        .unwrap();
        let schedule = compile_schedule(&topo, None).unwrap();

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            engine.run(&schedule, 0.0, rx).await;
            engine
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();

        let engine = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("engine must stop promptly")
            .unwrap();
        assert!(engine.sink().document().nodes.is_empty());
    }
}

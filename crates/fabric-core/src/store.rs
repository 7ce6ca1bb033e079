use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use fabric_io::overrides::modified_at;
use fabric_io::{
    load_nodes_dir, load_topology, IoError, NetworkDefaults, NodeDescriptor, Observation,
    ObservationAction, ObservationPayload, OverridesDoc, TopologyDoc,
};

use crate::federation::federation_overview;
use crate::snapshot::{effective_link, estimate_link, FabricSnapshot, LinkView, NodeView};
use crate::types::{
    link_key, utc_ms, EffectiveCaps, LinkBase, LinkDyn, LinkMetrics, NodeCaps, NodeDyn,
    Reservation, ReserveRequest, EPSILON,
};

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub nodes_dir: PathBuf,
    pub topology_path: PathBuf,
    pub overrides_path: PathBuf,
    pub watch_interval: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            nodes_dir: PathBuf::from("nodes"),
            topology_path: PathBuf::from("sim/topology.yaml"),
            overrides_path: PathBuf::from("sim/overrides.json"),
            watch_interval: Duration::from_millis(500),
        }
    }
}

struct NodeState {
    desc: NodeDescriptor,
    caps: NodeCaps,
    dyn_state: NodeDyn,
}

impl NodeState {
    fn new(desc: NodeDescriptor) -> Self {
        let caps = NodeCaps::from_descriptor(&desc);
        Self {
            desc,
            caps,
            dyn_state: NodeDyn::default(),
        }
    }
}

struct LinkState {
    a: String,
    b: String,
    base: LinkBase,
    dyn_state: LinkDyn,
}

struct StoreInner {
    nodes: BTreeMap<String, NodeState>,
    links: BTreeMap<String, LinkState>,
    defaults: NetworkDefaults,
    /// The override document as last applied, used to withdraw fields that
    /// the next document no longer carries.
    applied_overrides: OverridesDoc,
    overrides_seen: Option<SystemTime>,
    topology_seen: Option<SystemTime>,
    res_seq: u64,
}

/// Authoritative single-writer store for the fabric. All mutating
/// operations and the snapshot copy serialise on one mutex; internal
/// helpers take the inner struct and never re-enter public methods.
pub struct FabricStore {
    config: StoreConfig,
    inner: Mutex<StoreInner>,
}

impl FabricStore {
    /// Build a store from already-loaded documents (tests, one-shot CLIs).
    pub fn from_parts(
        nodes: Vec<NodeDescriptor>,
        topology: TopologyDoc,
        config: StoreConfig,
    ) -> Self {
        let mut node_map = BTreeMap::new();
        for desc in nodes {
            if desc.name.is_empty() {
                continue;
            }
            node_map.insert(desc.name.clone(), NodeState::new(desc));
        }

        let mut link_map = BTreeMap::new();
        for spec in &topology.links {
            if spec.a.is_empty() || spec.b.is_empty() {
                continue;
            }
            let key = link_key(&spec.a, &spec.b);
            link_map.insert(
                key,
                LinkState {
                    a: spec.a.clone(),
                    b: spec.b.clone(),
                    base: LinkBase::from_spec(spec),
                    dyn_state: LinkDyn::default(),
                },
            );
        }

        Self {
            config,
            inner: Mutex::new(StoreInner {
                nodes: node_map,
                links: link_map,
                defaults: topology.defaults.network.clone(),
                applied_overrides: OverridesDoc::default(),
                overrides_seen: None,
                topology_seen: None,
                res_seq: 1,
            }),
        }
    }

    /// Open a store from the configured paths. Missing or broken inputs are
    /// logged and tolerated; the store starts with whatever loaded.
    pub fn open(config: StoreConfig) -> Self {
        let nodes = match load_nodes_dir(&config.nodes_dir) {
            Ok(nodes) => nodes,
            Err(e) => {
                warn!(error = %e, "failed to load node descriptors");
                Vec::new()
            }
        };
        let topology = if config.topology_path.exists() {
            match load_topology(&config.topology_path) {
                Ok(topo) => topo,
                Err(e) => {
                    warn!(error = %e, "failed to load topology");
                    TopologyDoc::default()
                }
            }
        } else {
            TopologyDoc::default()
        };
        let topology_seen = modified_at(&config.topology_path);

        let store = Self::from_parts(nodes, topology, config);
        store.inner.lock().topology_seen = topology_seen;
        store.poll_files();
        store
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    // -------- reads --------

    pub fn snapshot(&self) -> FabricSnapshot {
        let inner = self.inner.lock();
        inner.build_snapshot()
    }

    pub fn node_federation(&self, name: &str) -> Option<String> {
        let inner = self.inner.lock();
        inner
            .nodes
            .get(name)
            .map(|n| crate::federation::federation_name(&n.desc))
    }

    /// Effective metrics for moving data between two nodes right now,
    /// synthesising from node hints when no explicit link exists.
    pub fn effective_link_between(&self, a: Option<&str>, b: &str) -> LinkMetrics {
        let inner = self.inner.lock();
        inner.link_between(a, b)
    }

    // -------- reservations --------

    /// Atomically reserve capacity on one node. `None` is a refusal, not an
    /// error: unknown node, node down, or not enough effective headroom.
    pub fn reserve(&self, req: &ReserveRequest) -> Option<String> {
        let inner = &mut *self.inner.lock();
        let node = inner.nodes.get_mut(&req.node)?;
        if node.dyn_state.down {
            return None;
        }
        let eff = EffectiveCaps::compute(&node.caps, &node.dyn_state);
        if eff.free_cpu_cores + EPSILON < req.cpu_cores
            || eff.free_mem_gb + EPSILON < req.mem_gb
            || eff.free_gpu_vram_gb + EPSILON < req.gpu_vram_gb
        {
            return None;
        }

        node.dyn_state.used_cpu_cores += req.cpu_cores;
        node.dyn_state.used_mem_gb += req.mem_gb;
        node.dyn_state.used_gpu_vram_gb += req.gpu_vram_gb;

        let rid = format!("res-{:07}", inner.res_seq);
        inner.res_seq += 1;
        node.dyn_state.reservations.insert(
            rid.clone(),
            Reservation {
                cpu_cores: req.cpu_cores,
                mem_gb: req.mem_gb,
                gpu_vram_gb: req.gpu_vram_gb,
                ts_ms: utc_ms(),
            },
        );
        debug!(node = %req.node, reservation = %rid, "reserved");
        Some(rid)
    }

    /// Remove a reservation and return its capacity. `false` when the node
    /// or the id is unknown; releasing twice is a no-op.
    pub fn release(&self, node_name: &str, reservation_id: &str) -> bool {
        let mut inner = self.inner.lock();
        let Some(node) = inner.nodes.get_mut(node_name) else {
            return false;
        };
        let Some(res) = node.dyn_state.reservations.remove(reservation_id) else {
            return false;
        };
        let dyn_state = &mut node.dyn_state;
        dyn_state.used_cpu_cores = (dyn_state.used_cpu_cores - res.cpu_cores).max(0.0);
        dyn_state.used_mem_gb = (dyn_state.used_mem_gb - res.mem_gb).max(0.0);
        dyn_state.used_gpu_vram_gb = (dyn_state.used_gpu_vram_gb - res.gpu_vram_gb).max(0.0);
        debug!(node = %node_name, reservation = %reservation_id, "released");
        true
    }

    // -------- observations & overrides --------

    /// Merge an ad-hoc observation, the same shape the chaos engine pushes.
    pub fn apply_observation(&self, obs: &Observation) {
        let mut inner = self.inner.lock();
        match (&obs.action, &obs.payload) {
            (ObservationAction::Apply, ObservationPayload::Node { node, changes, .. }) => {
                match inner.nodes.get_mut(node) {
                    Some(state) => state.dyn_state.apply_patch(changes),
                    None => debug!(node = %node, "observation for unknown node dropped"),
                }
            }
            (ObservationAction::Revert, ObservationPayload::Node { node, fields, .. }) => {
                if let Some(state) = inner.nodes.get_mut(node) {
                    for field in fields {
                        state.dyn_state.reset_field(field);
                    }
                }
            }
            (ObservationAction::Apply, ObservationPayload::Link { key, changes, .. }) => {
                if let Some(link) = inner.link_entry(key) {
                    link.dyn_state.apply_patch(changes);
                } else {
                    warn!(key = %key, "observation with malformed link key dropped");
                }
            }
            (ObservationAction::Revert, ObservationPayload::Link { key, fields, .. }) => {
                if let Some(link) = inner.links.get_mut(key) {
                    for field in fields {
                        link.dyn_state.reset_field(field);
                    }
                }
            }
        }
    }

    /// Merge an override document into live dyn state. Fields the previous
    /// document set but this one dropped revert to their defaults, so chaos
    /// reverts propagate through the file channel.
    pub fn merge_overrides(&self, doc: OverridesDoc) {
        let mut inner = self.inner.lock();
        inner.merge_overrides_locked(doc);
    }

    /// Persist the current non-default dyn state as an override document.
    pub fn write_overrides(&self) -> Result<(), IoError> {
        let mut inner = self.inner.lock();
        let mut doc = OverridesDoc::default();
        for (name, node) in &inner.nodes {
            let patch = node.dyn_state.to_patch();
            if !patch.is_empty() {
                doc.nodes.insert(name.clone(), patch);
            }
        }
        for (key, link) in &inner.links {
            let patch = link.dyn_state.to_patch();
            if !patch.is_empty() {
                doc.links.insert(key.clone(), patch);
            }
        }
        doc.write_atomic(&self.config.overrides_path)?;
        inner.overrides_seen = modified_at(&self.config.overrides_path);
        inner.applied_overrides = doc;
        Ok(())
    }

    /// One watcher iteration: re-read the overrides document when its mtime
    /// advances, hot-reload the topology likewise. Failures keep the
    /// previous state.
    pub fn poll_files(&self) {
        let (overrides_seen, topology_seen) = {
            let inner = self.inner.lock();
            (inner.overrides_seen, inner.topology_seen)
        };

        if let Some(mtime) = modified_at(&self.config.overrides_path) {
            let advanced = overrides_seen.map(|seen| mtime > seen).unwrap_or(true);
            if advanced {
                match OverridesDoc::load(&self.config.overrides_path) {
                    Ok(doc) => {
                        let mut inner = self.inner.lock();
                        inner.merge_overrides_locked(doc);
                        inner.overrides_seen = Some(mtime);
                        debug!("merged overrides document");
                    }
                    Err(e) => warn!(error = %e, "failed to read overrides, keeping previous state"),
                }
            }
        }

        if let Some(mtime) = modified_at(&self.config.topology_path) {
            let advanced = topology_seen.map(|seen| mtime > seen).unwrap_or(true);
            if advanced {
                match load_topology(&self.config.topology_path) {
                    Ok(topo) => {
                        let mut inner = self.inner.lock();
                        inner.reload_topology_locked(&topo);
                        inner.topology_seen = Some(mtime);
                        info!(links = topo.links.len(), "reloaded topology");
                    }
                    Err(e) => warn!(error = %e, "failed to reload topology, keeping previous state"),
                }
            }
        }
    }

    /// Spawn the background watcher. The interval is clamped to 200 ms so a
    /// misconfigured store cannot spin on disk.
    pub fn spawn_watcher(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(self);
        let interval = store.config.watch_interval.max(Duration::from_millis(200));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => store.poll_files(),
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("override watcher stopped");
        })
    }
}

impl StoreInner {
    fn link_between(&self, a: Option<&str>, b: &str) -> LinkMetrics {
        let a = match a {
            Some(a) if a != b => a,
            _ => return LinkMetrics::loopback(),
        };
        let key = link_key(a, b);
        if let Some(link) = self.links.get(&key) {
            return effective_link(&link.base, &link.dyn_state, &self.defaults);
        }
        estimate_link(
            self.nodes.get(a).map(|n| &n.desc),
            self.nodes.get(b).map(|n| &n.desc),
            &self.defaults,
        )
    }

    /// Fetch a link by key, creating an empty shell for well-formed keys so
    /// ad-hoc edges (e.g. node↔node wifi) can be observed into existence.
    fn link_entry(&mut self, key: &str) -> Option<&mut LinkState> {
        if !self.links.contains_key(key) {
            let (a, b) = key.split_once('|')?;
            if a.is_empty() || b.is_empty() {
                return None;
            }
            self.links.insert(
                key.to_string(),
                LinkState {
                    a: a.to_string(),
                    b: b.to_string(),
                    base: LinkBase::default(),
                    dyn_state: LinkDyn::default(),
                },
            );
        }
        self.links.get_mut(key)
    }

    fn merge_overrides_locked(&mut self, doc: OverridesDoc) {
        // Withdraw fields the previous document set but the new one dropped.
        for (name, old) in &self.applied_overrides.nodes {
            let still_set: Vec<&'static str> = doc
                .nodes
                .get(name)
                .map(|p| p.set_fields())
                .unwrap_or_default();
            if let Some(node) = self.nodes.get_mut(name) {
                for field in old.set_fields() {
                    if !still_set.contains(&field) {
                        node.dyn_state.reset_field(field);
                    }
                }
            }
        }
        for (key, old) in &self.applied_overrides.links {
            let still_set: Vec<&'static str> = doc
                .links
                .get(key)
                .map(|p| p.set_fields())
                .unwrap_or_default();
            if let Some(link) = self.links.get_mut(key) {
                for field in old.set_fields() {
                    if !still_set.contains(&field) {
                        link.dyn_state.reset_field(field);
                    }
                }
            }
        }

        // Apply the new document.
        for (name, patch) in &doc.nodes {
            match self.nodes.get_mut(name) {
                Some(node) => node.dyn_state.apply_patch(patch),
                None => debug!(node = %name, "override for unknown node ignored"),
            }
        }
        for (key, patch) in &doc.links {
            if let Some(link) = self.link_entry(key) {
                link.dyn_state.apply_patch(patch);
            } else {
                warn!(key = %key, "override with malformed link key ignored");
            }
        }

        self.applied_overrides = doc;
    }

    /// Swap in a fresh topology, then re-apply the standing link overrides
    /// so a reload does not silently heal chaos-degraded links.
    fn reload_topology_locked(&mut self, topo: &TopologyDoc) {
        self.defaults = topo.defaults.network.clone();
        let mut links = BTreeMap::new();
        for spec in &topo.links {
            if spec.a.is_empty() || spec.b.is_empty() {
                continue;
            }
            links.insert(
                link_key(&spec.a, &spec.b),
                LinkState {
                    a: spec.a.clone(),
                    b: spec.b.clone(),
                    base: LinkBase::from_spec(spec),
                    dyn_state: LinkDyn::default(),
                },
            );
        }
        self.links = links;

        let applied_links = self.applied_overrides.links.clone();
        for (key, patch) in &applied_links {
            if let Some(link) = self.link_entry(key) {
                link.dyn_state.apply_patch(patch);
            }
        }
    }

    fn build_snapshot(&self) -> FabricSnapshot {
        let nodes: BTreeMap<String, NodeView> = self
            .nodes
            .iter()
            .map(|(name, state)| {
                (
                    name.clone(),
                    NodeView {
                        desc: state.desc.clone(),
                        caps: state.caps,
                        dyn_state: state.dyn_state.clone(),
                        effective: EffectiveCaps::compute(&state.caps, &state.dyn_state),
                    },
                )
            })
            .collect();

        let links: BTreeMap<String, LinkView> = self
            .links
            .iter()
            .map(|(key, state)| {
                (
                    key.clone(),
                    LinkView {
                        a: state.a.clone(),
                        b: state.b.clone(),
                        base: state.base.clone(),
                        dyn_state: state.dyn_state.clone(),
                        effective: effective_link(&state.base, &state.dyn_state, &self.defaults),
                    },
                )
            })
            .collect();

        let (federations, federation_links, node_federations) =
            federation_overview(&nodes, &links);

        FabricSnapshot {
            ts_ms: utc_ms(),
            nodes,
            links,
            defaults: self.defaults.clone(),
            federations,
            federation_links,
            node_federations,
        }
    }
}

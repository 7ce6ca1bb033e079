use std::path::PathBuf;
use tracing::{debug, warn};

use fabric_io::{
    LinkDynPatch, NodeDynPatch, Observation, ObservationAction, ObservationPayload, OverridesDoc,
};

fn link_key(a: &str, b: &str) -> String {
    if a <= b {
        format!("{a}|{b}")
    } else {
        format!("{b}|{a}")
    }
}

/// The chaos engine's output channel. Every change lands in the overrides
/// document on disk (atomic whole-file replace, consumed by the store's
/// watcher) and, when configured, is also pushed to an observe endpoint.
pub struct OverridesSink {
    path: PathBuf,
    doc: OverridesDoc,
    observe: Option<ObservePush>,
}

struct ObservePush {
    client: reqwest::Client,
    url: String,
}

impl OverridesSink {
    /// Open the sink, preloading any overrides already on disk so repeated
    /// chaos runs compose instead of clobbering each other.
    pub fn new(path: PathBuf) -> Self {
        let doc = if path.exists() {
            match OverridesDoc::load(&path) {
                Ok(doc) => doc,
                Err(e) => {
                    warn!(error = %e, "could not preload overrides, starting fresh");
                    OverridesDoc::default()
                }
            }
        } else {
            OverridesDoc::default()
        };
        Self {
            path,
            doc,
            observe: None,
        }
    }

    pub fn with_observe(mut self, url: Option<String>) -> Self {
        self.observe = url.map(|url| ObservePush {
            client: reqwest::Client::new(),
            url,
        });
        self
    }

    pub fn document(&self) -> &OverridesDoc {
        &self.doc
    }

    fn write(&self) {
        if let Err(e) = self.doc.write_atomic(&self.path) {
            warn!(error = %e, "failed to write overrides document");
        }
    }

    async fn push(&self, action: ObservationAction, payload: ObservationPayload) {
        let Some(observe) = &self.observe else {
            return;
        };
        let obs = Observation { action, payload };
        // best effort: the DT may simply be offline
        if let Err(e) = observe.client.post(&observe.url).json(&obs).send().await {
            debug!(error = %e, "observe push failed");
        }
    }

    pub async fn node_apply(&mut self, node: &str, changes: &NodeDynPatch) {
        self.doc
            .nodes
            .entry(node.to_string())
            .or_default()
            .merge_from(changes);
        self.write();
        self.push(
            ObservationAction::Apply,
            ObservationPayload::Node {
                node: node.to_string(),
                changes: changes.clone(),
                fields: vec![],
            },
        )
        .await;
    }

    pub async fn node_revert(&mut self, node: &str, fields: &[&str]) {
        if let Some(patch) = self.doc.nodes.get_mut(node) {
            for field in fields {
                patch.clear(field);
            }
            if patch.is_empty() {
                self.doc.nodes.remove(node);
            }
        }
        self.write();
        self.push(
            ObservationAction::Revert,
            ObservationPayload::Node {
                node: node.to_string(),
                changes: NodeDynPatch::default(),
                fields: fields.iter().map(|f| f.to_string()).collect(),
            },
        )
        .await;
    }

    pub async fn link_apply(&mut self, a: &str, b: &str, changes: &LinkDynPatch) {
        let key = link_key(a, b);
        self.doc.links.entry(key.clone()).or_default().merge_from(changes);
        self.write();
        self.push(
            ObservationAction::Apply,
            ObservationPayload::Link {
                key,
                changes: changes.clone(),
                fields: vec![],
            },
        )
        .await;
    }

    pub async fn link_revert(&mut self, a: &str, b: &str, fields: &[&str]) {
        let key = link_key(a, b);
        if let Some(patch) = self.doc.links.get_mut(&key) {
            for field in fields {
                patch.clear(field);
            }
            if patch.is_empty() {
                self.doc.links.remove(&key);
            }
        }
        self.write();
        self.push(
            ObservationAction::Revert,
            ObservationPayload::Link {
                key,
                changes: LinkDynPatch::default(),
                fields: fields.iter().map(|f| f.to_string()).collect(),
            },
        )
        .await;
    }
}

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::SystemTime;

use crate::parse::lenient_opt_f64;
use crate::IoError;

/// Runtime override patch for one node. Absent fields mean "leave alone";
/// an explicit revert names the fields to drop.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeDynPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub down: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none", deserialize_with = "lenient_opt_f64")]
    pub thermal_derate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", deserialize_with = "lenient_opt_f64")]
    pub power_cap_w: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", deserialize_with = "lenient_opt_f64")]
    pub clock_skew_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", deserialize_with = "lenient_opt_f64")]
    pub packet_dup: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", deserialize_with = "lenient_opt_f64")]
    pub packet_reorder: Option<f64>,
}

impl NodeDynPatch {
    pub fn is_empty(&self) -> bool {
        self.down.is_none()
            && self.thermal_derate.is_none()
            && self.power_cap_w.is_none()
            && self.clock_skew_ms.is_none()
            && self.packet_dup.is_none()
            && self.packet_reorder.is_none()
    }

    /// Layer `other` on top of this patch, field-wise.
    pub fn merge_from(&mut self, other: &NodeDynPatch) {
        if other.down.is_some() {
            self.down = other.down;
        }
        if other.thermal_derate.is_some() {
            self.thermal_derate = other.thermal_derate;
        }
        if other.power_cap_w.is_some() {
            self.power_cap_w = other.power_cap_w;
        }
        if other.clock_skew_ms.is_some() {
            self.clock_skew_ms = other.clock_skew_ms;
        }
        if other.packet_dup.is_some() {
            self.packet_dup = other.packet_dup;
        }
        if other.packet_reorder.is_some() {
            self.packet_reorder = other.packet_reorder;
        }
    }

    /// Drop one field by its document name. Unknown names are ignored.
    pub fn clear(&mut self, field: &str) {
        match field {
            "down" => self.down = None,
            "thermal_derate" => self.thermal_derate = None,
            "power_cap_w" => self.power_cap_w = None,
            "clock_skew_ms" => self.clock_skew_ms = None,
            "packet_dup" => self.packet_dup = None,
            "packet_reorder" => self.packet_reorder = None,
            _ => {}
        }
    }

    /// Document names of the fields this patch sets.
    pub fn set_fields(&self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.down.is_some() {
            fields.push("down");
        }
        if self.thermal_derate.is_some() {
            fields.push("thermal_derate");
        }
        if self.power_cap_w.is_some() {
            fields.push("power_cap_w");
        }
        if self.clock_skew_ms.is_some() {
            fields.push("clock_skew_ms");
        }
        if self.packet_dup.is_some() {
            fields.push("packet_dup");
        }
        if self.packet_reorder.is_some() {
            fields.push("packet_reorder");
        }
        fields
    }
}

/// Runtime override patch for one link, same rules as [`NodeDynPatch`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkDynPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub down: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none", deserialize_with = "lenient_opt_f64")]
    pub speed_gbps: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", deserialize_with = "lenient_opt_f64")]
    pub rtt_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", deserialize_with = "lenient_opt_f64")]
    pub jitter_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", deserialize_with = "lenient_opt_f64")]
    pub loss_pct: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ecn: Option<bool>,
}

impl LinkDynPatch {
    pub fn is_empty(&self) -> bool {
        self.down.is_none()
            && self.speed_gbps.is_none()
            && self.rtt_ms.is_none()
            && self.jitter_ms.is_none()
            && self.loss_pct.is_none()
            && self.ecn.is_none()
    }

    pub fn merge_from(&mut self, other: &LinkDynPatch) {
        if other.down.is_some() {
            self.down = other.down;
        }
        if other.speed_gbps.is_some() {
            self.speed_gbps = other.speed_gbps;
        }
        if other.rtt_ms.is_some() {
            self.rtt_ms = other.rtt_ms;
        }
        if other.jitter_ms.is_some() {
            self.jitter_ms = other.jitter_ms;
        }
        if other.loss_pct.is_some() {
            self.loss_pct = other.loss_pct;
        }
        if other.ecn.is_some() {
            self.ecn = other.ecn;
        }
    }

    pub fn clear(&mut self, field: &str) {
        match field {
            "down" => self.down = None,
            "speed_gbps" => self.speed_gbps = None,
            "rtt_ms" => self.rtt_ms = None,
            "jitter_ms" => self.jitter_ms = None,
            "loss_pct" => self.loss_pct = None,
            "ecn" => self.ecn = None,
            _ => {}
        }
    }

    pub fn set_fields(&self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.down.is_some() {
            fields.push("down");
        }
        if self.speed_gbps.is_some() {
            fields.push("speed_gbps");
        }
        if self.rtt_ms.is_some() {
            fields.push("rtt_ms");
        }
        if self.jitter_ms.is_some() {
            fields.push("jitter_ms");
        }
        if self.loss_pct.is_some() {
            fields.push("loss_pct");
        }
        if self.ecn.is_some() {
            fields.push("ecn");
        }
        fields
    }
}

/// The on-disk override document shared by the chaos engine (writer) and
/// the state store watcher (reader).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OverridesDoc {
    pub nodes: BTreeMap<String, NodeDynPatch>,
    pub links: BTreeMap<String, LinkDynPatch>,
}

impl OverridesDoc {
    pub fn load(path: &Path) -> Result<Self, IoError> {
        let text = std::fs::read_to_string(path).map_err(|source| IoError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|e| IoError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Replace the document on disk in one step: write a sibling temp file,
    /// then rename over the target. Readers only ever see a complete doc.
    pub fn write_atomic(&self, path: &Path) -> Result<(), IoError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|source| IoError::Write {
                    path: path.to_path_buf(),
                    source,
                })?;
            }
        }
        let text = serde_json::to_string_pretty(self).map_err(|source| IoError::Serialize {
            path: path.to_path_buf(),
            source,
        })?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, text).map_err(|source| IoError::Write {
            path: tmp.clone(),
            source,
        })?;
        std::fs::rename(&tmp, path).map_err(|source| IoError::Write {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Modification time probe used by the watcher to decide whether a re-read
/// is needed. `None` when the file does not exist yet.
pub fn modified_at(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObservationAction {
    #[default]
    Apply,
    Revert,
}

/// Ad-hoc observation pushed into the store, the same shape the chaos
/// engine POSTs to an `/observe` endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Observation {
    #[serde(default)]
    pub action: ObservationAction,
    pub payload: ObservationPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ObservationPayload {
    Node {
        node: String,
        #[serde(default)]
        changes: NodeDynPatch,
        #[serde(default)]
        fields: Vec<String>,
    },
    Link {
        key: String,
        #[serde(default)]
        changes: LinkDynPatch,
        #[serde(default)]
        fields: Vec<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patch_merge_leaves_unset_fields_alone() {
        let mut base = NodeDynPatch {
            down: Some(true),
            thermal_derate: Some(0.3),
            ..Default::default()
        };
        let update = NodeDynPatch {
            thermal_derate: Some(0.6),
            ..Default::default()
        };
        base.merge_from(&update);
        assert_eq!(base.down, Some(true));
        assert_eq!(base.thermal_derate, Some(0.6));
    }

    #[test]
    fn clear_drops_only_named_field() {
        let mut patch = LinkDynPatch {
            down: Some(true),
            loss_pct: Some(12.0),
            rtt_ms: Some(35.0),
            ..Default::default()
        };
        patch.clear("loss_pct");
        patch.clear("no_such_field");
        assert_eq!(patch.loss_pct, None);
        assert_eq!(patch.down, Some(true));
        assert_eq!(patch.rtt_ms, Some(35.0));
    }

    #[test]
    fn document_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("overrides.json");

        let mut doc = OverridesDoc::default();
        doc.nodes.insert(
            "ws-001".to_string(),
            NodeDynPatch {
                down: Some(true),
                ..Default::default()
            },
        );
        doc.links.insert(
            "edge-001|ws-001".to_string(),
            LinkDynPatch {
                loss_pct: Some(12.0),
                rtt_ms: Some(35.0),
                ..Default::default()
            },
        );
        doc.write_atomic(&path).unwrap();

        let loaded = OverridesDoc::load(&path).unwrap();
        assert_eq!(loaded, doc);
        assert!(modified_at(&path).is_some());
    }

    #[test]
    fn serialized_patches_omit_unset_fields() {
        let patch = NodeDynPatch {
            thermal_derate: Some(0.4),
            ..Default::default()
        };
        let json = serde_json::to_string(&patch).unwrap();
        assert_eq!(json, r#"{"thermal_derate":0.4}"#);
    }

    #[test]
    fn observation_parses_chaos_push_shape() {
        let obs: Observation = serde_json::from_str(
            r#"{"action":"revert","payload":{"type":"link","key":"a|b","fields":["down"]}}"#,
        )
        .unwrap();
        assert_eq!(obs.action, ObservationAction::Revert);
        match obs.payload {
            ObservationPayload::Link { ref key, ref fields, .. } => {
                assert_eq!(key, "a|b");
                assert_eq!(fields, &["down".to_string()]);
            }
            _ => panic!("expected link payload"),
        }
    }
}

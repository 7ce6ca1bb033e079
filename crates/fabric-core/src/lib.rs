pub mod cost;
pub mod federation;
pub mod planner;
pub mod snapshot;
pub mod store;
pub mod types;

pub use cost::{CostConfig, CostModel, JobCost, StageCost};
pub use federation::{federation_name, FederationLinkStats, FederationStats};
pub use planner::federated::{FederatedPlanner, ModeWeights, PlanMode};
pub use planner::greedy::{GreedyConfig, GreedyPlanner};
pub use planner::{
    FirstMatchSelector, FormatSelector, PlanResult, ProjectedFederation, ReservationRef,
    StageReport,
};
pub use snapshot::{FabricSnapshot, LinkView, NodeView};
pub use store::{FabricStore, StoreConfig};
pub use types::{
    clamp, link_key, utc_ms, EffectiveCaps, LinkBase, LinkDyn, LinkMetrics, NodeCaps, NodeDyn,
    Reservation, ReserveRequest, EPSILON,
};

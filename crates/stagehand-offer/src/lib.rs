//! stagehand-offer — turning resource offers into launch operations.
//!
//! # Architecture
//!
//! ```text
//! PodInstanceRequirement ──▶ OfferEvaluator ──▶ OfferRecommendation
//!                               │                  (operations + TaskInfos)
//!                               └── ResourcePool per offer
//!
//! stored TaskInfos ──▶ ResourceCleaner ──▶ DESTROY / UNRESERVE for orphans
//! ```

pub mod cleanup;
pub mod evaluator;
pub mod requirement;
pub mod resources;

pub use cleanup::ResourceCleaner;
pub use evaluator::{
    Evaluation, OfferEvaluator, OfferMiss, OfferRecommendation, ServiceContext, port_env_name,
};
pub use requirement::PodInstanceRequirement;
pub use resources::{EPSILON, ResourcePool, Shortfall};

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Transport-free core of the perceiver sidecars: the coordinator wire
//! types, the image-identity parser, the label/annotation model, the
//! map-diff engine, and the scan-result matcher.

pub mod annotations;
pub mod api;
pub mod identity;
pub mod mapdiff;
pub mod matcher;

pub use self::{
    annotations::{ImageFacts, PodFacts, SecuritySummary},
    identity::{parse_image_id, parse_repo_tag, parse_swarm_image, IdentityError},
    mapdiff::KvMap,
    matcher::find_match,
};

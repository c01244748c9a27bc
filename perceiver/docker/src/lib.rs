//! Docker Swarm perceiver backend.
//!
//! Swarm services expose labels but no annotation surface, so this
//! backend reconciles label maps only. It talks to the Docker Engine
//! REST API directly.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod client;
mod swarm;

pub use self::client::{SwarmClient, SwarmClientError, SwarmService};
pub use self::swarm::{SwarmAdapter, SwarmInventory, SWARM_NAMESPACE};

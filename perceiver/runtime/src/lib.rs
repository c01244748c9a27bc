//! Process wiring for the perceiver binary: argument parsing, logging,
//! the admin/metrics server, loop spawning, and cooperative shutdown.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod admin;
mod args;

pub use self::args::Args;

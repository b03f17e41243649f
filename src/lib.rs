//! Pluggable ICMP echo engines, a registry to choose between them, and
//! hop-by-hop route discovery built on top.

pub mod cli;
pub mod config;
pub mod dns;
pub mod engine;
pub mod icmp;
pub mod route;
pub mod stats;
pub mod utils;

#[cfg(test)]
pub(crate) mod testing;

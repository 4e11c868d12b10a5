#[macro_use]
extern crate tracing;

pub mod challenge;
pub mod config;
pub mod dns;
pub mod headers;
pub mod mock;
pub mod solver;

//! fastci core
//!
//! Domain records, status machines, pipeline documents and the port traits
//! shared by the scheduler and its adapters. This crate has no runtime
//! dependencies on Docker, a database or a message bus.

pub mod container;
pub mod error;
pub mod ids;
pub mod job;
pub mod pipeline;
pub mod ports;
pub mod timestamps;

pub use error::{Error, Result};
pub use ids::*;

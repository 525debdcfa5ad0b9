//! Container runtime adapters for fastci.

pub mod docker;

pub use docker::DockerRuntime;

//! Container Runtime implementations for the orchestrator.
//!
//! This crate provides implementations of the `ContainerRuntime` trait:
//! - `MockRuntime`: In-memory mock for testing (default)
//! - `DockerCliRuntime`: drives the `docker` binary (requires `docker-cli` feature)

#[cfg(feature = "mock-runtime")]
pub mod mock;

#[cfg(feature = "docker-cli")]
pub mod docker_cli;

// Re-export common types
pub use container_runtime_interface::{
    ContainerRuntime, ContainerSpec, ContainerStats, ContainerStatus, ExecOutput, HealthProbe,
    LogOptions, ReadinessPolicy, ReadyPoll, RuntimeError,
};

#[cfg(feature = "mock-runtime")]
pub use mock::{ExecRecord, MockRuntime};

#[cfg(feature = "docker-cli")]
pub use docker_cli::{DockerCliConfig, DockerCliError, DockerCliRuntime, DockerState};

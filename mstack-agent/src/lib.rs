//! mstack-agent - reconciles TLS certificates, reverse-proxy config and swarm
//! service deployments with their desired state.
//!
//! This module exposes the agent components for integration testing.

pub mod audit;
pub mod clients;
pub mod config;
pub mod error;
pub mod model;
pub mod reconciler;
pub mod scheduler;
pub mod store;

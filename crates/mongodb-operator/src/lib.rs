//! MongoDB Operator Reconciliation Engine
//!
//! This crate turns a declared MongoDB deployment (a standalone, a replica
//! set or a sharded cluster) into a published automation document, issued
//! certificates and a running workload, and reports the result back as the
//! resource status.
//!
//! # Architecture
//!
//! A reconciliation pass is driven by the [`Reconciler`]:
//!
//! - **Topology**: [`TopologyResolver`] derives process names, hostnames and
//!   per-process settings from the declared spec
//! - **Certificates**: [`CertificateSequencer`] generates keys, submits
//!   signing requests and waits for approval before TLS is switched on
//! - **Deployment document**: [`DeploymentDocument`] merges the operator's
//!   view into the remote document without losing fields it does not own
//! - **Publishing**: [`ControlPlaneUpdater`] serialises read-modify-publish
//!   cycles per project and waits for agents to reach goal state
//! - **Scaling**: [`ScaleCoordinator`] strips the vote from members before
//!   they are removed
//!
//! Every step returns a [`WorkflowStatus`]; the folded status becomes the
//! persisted phase and decides when the resource is reconciled again.
//!
//! ```text
//! Pending ──▶ Reconciling ──▶ Running
//!                 │    ▲
//!                 ▼    │
//!           Failed / Pending (retry)
//! ```
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//!
//! use mongodb_operator::{Collaborators, OperatorConfig, ProjectMutexes, Reconciler};
//!
//! let reconciler = Reconciler::new(
//!     OperatorConfig::load()?,
//!     collaborators,
//!     Arc::new(ProjectMutexes::new()),
//! );
//! let report = reconciler.reconcile(&spec).await;
//! ```

#![doc = include_str!("../README.md")]
#![forbid(unsafe_code)]

pub mod certs;
pub mod config;
pub mod control_plane;
pub mod deployment;
pub mod error;
pub mod reconciler;
pub mod scale;
pub mod secrets;
pub mod status;
pub mod topology;
pub mod types;
pub mod version;
pub mod workflow;
pub mod workload;

// Re-export commonly used types at the crate root
pub use certs::{CertificateAuthority, CertificateSequencer, MemoryCertificateAuthority};
pub use config::OperatorConfig;
pub use control_plane::{ControlPlane, ControlPlaneUpdater, MemoryControlPlane, ProjectMutexes};
pub use deployment::DeploymentDocument;
pub use error::{OperatorError, OperatorResult};
pub use reconciler::{Collaborators, ReconcileReport, Reconciler};
pub use scale::ScaleCoordinator;
pub use secrets::{MemorySecrets, SecretStore};
pub use status::{MemoryStatusStore, StatusStore, StatusUpdater};
pub use topology::{ResolvedTopology, TopologyResolver};
pub use types::{DeclaredSpec, ObservedStatus, Phase, ProjectId, ResourceKey, ResourceKind};
pub use workflow::{ReconcileOutcome, WorkflowStatus};
pub use workload::{MemoryWorkload, WorkloadApplier};

//! # Guestbook Kubernetes Operator
//!
//! Kubernetes operator for deploying and managing three-tier guestbook
//! applications: a MySQL data tier, an HTTP API backend, and a web frontend,
//! declared through a single `GuestbookApp` custom resource.
//!
//! ## Architecture
//!
//! The operator follows the standard Kubernetes controller pattern:
//!
//! 1. **Watch**: Monitor GuestbookApp resources and the Deployments,
//!    Services, and Secrets they own
//! 2. **Reconcile**: Run a fixed stage sequence per cycle: ensure the data
//!    tier, gate on database readiness, then converge the backend and
//!    frontend tiers
//! 3. **Status**: Project per-tier runtime state onto the status
//!    subresource and react to declared-spec drift with rolling updates
//!
//! Every stage before the readiness gate is idempotent, so a cycle can be
//! re-entered from the top at any time. Created resources carry owner
//! references; cleanup on deletion is Kubernetes garbage collection, not
//! operator code.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use guestbook_operator::prelude::*;
//! use kube::Client;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let client = Client::try_default().await?;
//!     run_controller(client, None, None).await
//! }
//! ```
//!
//! ## Custom Resource
//!
//! ```yaml
//! apiVersion: guestbook.dev/v1alpha1
//! kind: GuestbookApp
//! metadata:
//!   name: demo
//! spec:
//!   database:
//!     version: "8.0"
//!   backend:
//!     replicas: 2
//!     version: "1.0.0"
//!   frontend:
//!     replicas: 2
//!     version: "1.0.0"
//!     title: Team Guestbook
//! ```
//!
//! ## Modules
//!
//! - [`crd`] - GuestbookApp custom resource types with validation
//! - [`controller`] - reconciliation loop and controller setup
//! - [`ensure`] - idempotent create-if-absent primitive
//! - [`resources`] - Kubernetes resource builders
//! - [`api`] - typed cluster API seams (kube-backed, mockable)
//! - [`error`] - error types for operator operations

pub mod api;
pub mod controller;
pub mod crd;
pub mod ensure;
pub mod error;
pub mod resources;

pub mod prelude {
    //! Re-exports for convenient usage
    pub use crate::api::{AppOps, KubeAppOps, KubeOps, ResourceOps};
    pub use crate::controller::{
        run_controller, run_cycle, ClusterApis, ControllerContext, ControllerMetrics,
        ReconcileOutcome,
    };
    pub use crate::crd::{
        AppPhase, AppliedSpec, BackendSpec, DatabaseSpec, FrontendSpec, GuestbookApp,
        GuestbookAppSpec, GuestbookAppStatus, Tier, TierStatus,
    };
    pub use crate::ensure::{ensure, StageOutcome};
    pub use crate::error::{OperatorError, Result};
    pub use crate::resources::ResourceBuilder;
}

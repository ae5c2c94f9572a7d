//! Custom Resource Definition for the Guestbook Kubernetes Operator
//!
//! This module defines the `GuestbookApp` CRD that represents a three-tier
//! guestbook application (MySQL database, HTTP API backend, web frontend)
//! in Kubernetes. The operator watches these resources and converges the
//! cluster toward the declared specification.

use kube::CustomResource;
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;
use validator::{Validate, ValidationError};

/// Regex for validating Kubernetes names (RFC 1123 subdomain)
static NAME_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").unwrap());

/// Validate a Kubernetes name (RFC 1123 subdomain)
fn validate_k8s_name(value: &str) -> Result<(), ValidationError> {
    if value.len() > 63 {
        return Err(
            ValidationError::new("name_too_long").with_message("name exceeds 63 characters".into())
        );
    }
    if !NAME_REGEX.is_match(value) {
        return Err(ValidationError::new("invalid_name").with_message(
            format!("'{}' is not a valid Kubernetes name (RFC 1123)", value).into(),
        ));
    }
    Ok(())
}

/// Validate a container image reference
fn validate_image(value: &str) -> Result<(), ValidationError> {
    if value.is_empty() {
        return Ok(()); // Empty is allowed (uses default)
    }
    if value.len() > 255 {
        return Err(ValidationError::new("image_too_long")
            .with_message("image reference exceeds 255 characters".into()));
    }
    // Basic format check - not overly strict to allow various registries
    if value.contains("..") || value.starts_with('/') || value.starts_with('-') {
        return Err(ValidationError::new("invalid_image")
            .with_message(format!("'{}' is not a valid container image", value).into()));
    }
    Ok(())
}

/// The application tiers managed by the operator.
///
/// The tier name is also the value of the `tier` label stamped onto every
/// managed resource, which (together with `app` and `owner`) is the join key
/// between a `GuestbookApp` and its live resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    /// MySQL data tier
    Database,
    /// HTTP API tier
    Backend,
    /// Web UI tier
    Frontend,
}

impl Tier {
    /// Label value for this tier
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Database => "database",
            Tier::Backend => "backend",
            Tier::Frontend => "frontend",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// GuestbookApp custom resource definition
///
/// Declares the desired state of one guestbook instance: the database tier,
/// the backend tier, and the frontend tier. The operator never deletes a
/// GuestbookApp; created resources carry owner references so Kubernetes
/// garbage-collects them when the GuestbookApp itself is deleted.
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema, Validate)]
#[kube(
    group = "guestbook.dev",
    version = "v1alpha1",
    kind = "GuestbookApp",
    plural = "guestbookapps",
    shortname = "gba",
    namespaced,
    status = "GuestbookAppStatus",
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Backend", "type":"integer", "jsonPath":".status.backend.readyReplicas"}"#,
    printcolumn = r#"{"name":"Frontend", "type":"integer", "jsonPath":".status.frontend.readyReplicas"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct GuestbookAppSpec {
    /// Database tier configuration
    #[serde(default)]
    #[validate(nested)]
    pub database: DatabaseSpec,

    /// Backend tier configuration
    #[serde(default)]
    #[validate(nested)]
    pub backend: BackendSpec,

    /// Frontend tier configuration
    #[serde(default)]
    #[validate(nested)]
    pub frontend: FrontendSpec,
}

impl GuestbookAppSpec {
    /// The declared shape of a tier, in the form recorded as "last applied"
    /// on the status subresource. Change detection compares this against
    /// what a previous cycle recorded.
    pub fn declared_for(&self, tier: Tier) -> AppliedSpec {
        match tier {
            Tier::Database => AppliedSpec {
                version: self.database.version.clone(),
                replicas: 1,
                title: None,
            },
            Tier::Backend => AppliedSpec {
                version: self.backend.version.clone(),
                replicas: self.backend.replicas,
                title: None,
            },
            Tier::Frontend => AppliedSpec {
                version: self.frontend.version.clone(),
                replicas: self.frontend.replicas,
                title: self.frontend.title.clone(),
            },
        }
    }
}

impl Default for GuestbookAppSpec {
    fn default() -> Self {
        Self {
            database: DatabaseSpec::default(),
            backend: BackendSpec::default(),
            frontend: FrontendSpec::default(),
        }
    }
}

/// Database tier specification
///
/// The operator creates the auth Secret once from these credentials and
/// never reconciles its contents afterwards; rotating credentials on a live
/// instance is not supported.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseSpec {
    /// MySQL version to deploy
    #[serde(default = "default_database_version")]
    #[validate(length(min = 1, max = 64, message = "version must be 1-64 characters"))]
    pub version: String,

    /// Container image (overrides version-based default)
    #[serde(default)]
    #[validate(custom(function = "validate_optional_image"))]
    pub image: Option<String>,

    /// Database user created for the application
    #[serde(default = "default_database_user")]
    #[validate(custom(function = "validate_k8s_name"))]
    pub username: String,

    /// Password for the application user
    #[serde(default = "default_database_password")]
    #[validate(length(min = 1, max = 128, message = "password must be 1-128 characters"))]
    pub password: String,

    /// Name of the application schema
    #[serde(default = "default_database_name")]
    #[validate(custom(function = "validate_k8s_name"))]
    pub database_name: String,
}

impl DatabaseSpec {
    /// Get the full container image including version
    pub fn get_image(&self) -> String {
        if let Some(ref image) = self.image {
            image.clone()
        } else {
            format!("mysql:{}", self.version)
        }
    }
}

impl Default for DatabaseSpec {
    fn default() -> Self {
        Self {
            version: default_database_version(),
            image: None,
            username: default_database_user(),
            password: default_database_password(),
            database_name: default_database_name(),
        }
    }
}

/// Backend tier specification
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct BackendSpec {
    /// Number of backend replicas (1-20)
    #[serde(default = "default_replicas")]
    #[validate(range(min = 1, max = 20, message = "replicas must be between 1 and 20"))]
    pub replicas: i32,

    /// Backend version to deploy
    #[serde(default = "default_app_version")]
    #[validate(length(min = 1, max = 64, message = "version must be 1-64 characters"))]
    pub version: String,

    /// Container image (overrides version-based default)
    #[serde(default)]
    #[validate(custom(function = "validate_optional_image"))]
    pub image: Option<String>,
}

impl BackendSpec {
    /// Get the full container image including version
    pub fn get_image(&self) -> String {
        if let Some(ref image) = self.image {
            image.clone()
        } else {
            format!("ghcr.io/guestbook/guestbook-api:{}", self.version)
        }
    }
}

impl Default for BackendSpec {
    fn default() -> Self {
        Self {
            replicas: default_replicas(),
            version: default_app_version(),
            image: None,
        }
    }
}

/// Frontend tier specification
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct FrontendSpec {
    /// Number of frontend replicas (1-20)
    #[serde(default = "default_replicas")]
    #[validate(range(min = 1, max = 20, message = "replicas must be between 1 and 20"))]
    pub replicas: i32,

    /// Frontend version to deploy
    #[serde(default = "default_app_version")]
    #[validate(length(min = 1, max = 64, message = "version must be 1-64 characters"))]
    pub version: String,

    /// Container image (overrides version-based default)
    #[serde(default)]
    #[validate(custom(function = "validate_optional_image"))]
    pub image: Option<String>,

    /// Page title shown by the web UI
    #[serde(default)]
    #[validate(length(max = 128, message = "title must be at most 128 characters"))]
    pub title: Option<String>,
}

impl FrontendSpec {
    /// Get the full container image including version
    pub fn get_image(&self) -> String {
        if let Some(ref image) = self.image {
            image.clone()
        } else {
            format!("ghcr.io/guestbook/guestbook-web:{}", self.version)
        }
    }
}

impl Default for FrontendSpec {
    fn default() -> Self {
        Self {
            replicas: default_replicas(),
            version: default_app_version(),
            image: None,
            title: None,
        }
    }
}

/// Validate optional image reference
fn validate_optional_image(image: &str) -> Result<(), ValidationError> {
    validate_image(image)
}

fn default_database_version() -> String {
    "8.0".to_string()
}

fn default_database_user() -> String {
    "guestbook".to_string()
}

fn default_database_password() -> String {
    "guestbook".to_string()
}

fn default_database_name() -> String {
    "guestbook".to_string()
}

fn default_app_version() -> String {
    "1.0.0".to_string()
}

fn default_replicas() -> i32 {
    1
}

/// Observed status of a GuestbookApp
///
/// Written only by the operator, through the status subresource. Runtime
/// fields are recomputed from live cluster state on every cycle; the
/// `applied` sub-objects record which declared tier spec was last acted on.
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GuestbookAppStatus {
    /// Current phase of the application
    #[serde(default)]
    pub phase: AppPhase,

    /// Backend tier status
    #[serde(default)]
    pub backend: TierStatus,

    /// Frontend tier status
    #[serde(default)]
    pub frontend: TierStatus,

    /// Last time the status was updated
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<String>,
}

impl GuestbookAppStatus {
    /// Status slot for a tier, if the tier carries projected status
    /// (the database tier is gated on readiness instead)
    pub fn tier(&self, tier: Tier) -> Option<&TierStatus> {
        match tier {
            Tier::Backend => Some(&self.backend),
            Tier::Frontend => Some(&self.frontend),
            Tier::Database => None,
        }
    }

    /// Mutable status slot for a tier
    pub fn tier_mut(&mut self, tier: Tier) -> Option<&mut TierStatus> {
        match tier {
            Tier::Backend => Some(&mut self.backend),
            Tier::Frontend => Some(&mut self.frontend),
            Tier::Database => None,
        }
    }
}

/// Phase of the application lifecycle
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum AppPhase {
    /// No tier has reported status yet
    #[default]
    Pending,
    /// Tiers are coming up
    Provisioning,
    /// All tiers are serving
    Running,
    /// At least one tier is only partially available
    Degraded,
}

/// Derived status of one application tier
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TierStatus {
    /// Observed replicas
    #[serde(default)]
    pub replicas: i32,

    /// Observed ready replicas
    #[serde(default)]
    pub ready_replicas: i32,

    /// Whether all desired replicas are ready
    #[serde(default)]
    pub ready: bool,

    /// Declared tier spec that was last applied to the cluster
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied: Option<AppliedSpec>,
}

/// The portion of a tier spec that triggers a rolling update when changed
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AppliedSpec {
    /// Applied version
    pub version: String,

    /// Applied replica count
    pub replicas: i32,

    /// Applied page title (frontend only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

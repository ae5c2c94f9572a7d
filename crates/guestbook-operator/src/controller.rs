//! GuestbookApp controller
//!
//! Implements the Kubernetes controller pattern for GuestbookApp custom
//! resources. Each reconciliation cycle runs a fixed stage sequence:
//! ensure the data tier (secret, deployment, service), gate on database
//! readiness, then bring up and maintain the backend and frontend tiers.
//! The first stage that requests a requeue or fails ends the cycle; a full
//! pass through every stage finishes with the periodic resync interval.

use chrono::Utc;
use dashmap::DashMap;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Secret, Service};
use kube::api::Api;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher::Config;
use kube::{Client, ResourceExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};
use validator::Validate;

use crate::api::{AppOps, KubeAppOps, KubeOps, ResourceOps};
use crate::crd::{AppPhase, AppliedSpec, GuestbookApp, GuestbookAppStatus, Tier};
use crate::ensure::{ensure, StageOutcome};
use crate::error::{OperatorError, Result};
use crate::resources::{deployment_name, ResourceBuilder};

/// Requeue interval after a fully converged cycle (periodic resync)
const DEFAULT_REQUEUE_SECONDS: u64 = 300; // 5 minutes

/// Fixed delay while waiting for the database tier to come up
const DATABASE_WAIT_SECONDS: u64 = 5;

/// Requeue interval for error cases (base for exponential backoff)
const ERROR_REQUEUE_SECONDS: u64 = 30;

/// Maximum requeue delay for error backoff
const MAX_ERROR_REQUEUE_SECONDS: u64 = 600;

/// Deadline for a single reconciliation cycle
const DEFAULT_CYCLE_TIMEOUT_SECONDS: u64 = 120;

/// Result of one full reconciliation cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Every stage continued; nothing left to converge this cycle
    Done,
    /// A stage stopped the cycle and asked to run again after the delay
    RequeueAfter(Duration),
}

/// The cluster API surface one cycle runs against
///
/// Production wires kube-backed implementations; tests substitute mocks.
pub struct ClusterApis {
    /// Desired-state read and status-write API
    pub apps: Arc<dyn AppOps>,
    /// Secret CRUD
    pub secrets: Arc<dyn ResourceOps<Secret>>,
    /// Deployment CRUD
    pub deployments: Arc<dyn ResourceOps<Deployment>>,
    /// Service CRUD
    pub services: Arc<dyn ResourceOps<Service>>,
}

impl ClusterApis {
    /// Kube-backed API surface
    pub fn new(client: &Client) -> Self {
        let ops = Arc::new(KubeOps::new(client.clone()));
        Self {
            apps: Arc::new(KubeAppOps::new(client.clone())),
            secrets: ops.clone(),
            deployments: ops.clone(),
            services: ops,
        }
    }
}

/// Context passed to the controller
pub struct ControllerContext {
    /// Cluster API surface used by reconciliation cycles
    pub apis: ClusterApis,
    /// Metrics recorder (optional)
    pub metrics: Option<ControllerMetrics>,
    /// Per-instance error retry counts for exponential backoff
    pub error_counts: DashMap<String, u32>,
    /// Deadline for a single cycle
    pub cycle_timeout: Duration,
}

/// Metrics for the controller
#[derive(Clone)]
pub struct ControllerMetrics {
    /// Counter for reconciliation attempts
    pub reconciliations: metrics::Counter,
    /// Counter for reconciliation errors
    pub errors: metrics::Counter,
    /// Histogram for reconciliation duration
    pub duration: metrics::Histogram,
}

impl ControllerMetrics {
    /// Create new controller metrics
    pub fn new() -> Self {
        Self {
            reconciliations: metrics::counter!("guestbook_operator_reconciliations_total"),
            errors: metrics::counter!("guestbook_operator_reconciliation_errors_total"),
            duration: metrics::histogram!("guestbook_operator_reconciliation_duration_seconds"),
        }
    }
}

impl Default for ControllerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Start the GuestbookApp controller
pub async fn run_controller(
    client: Client,
    namespace: Option<String>,
    cycle_timeout: Option<Duration>,
) -> Result<()> {
    let apps: Api<GuestbookApp> = match &namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    };

    let deployments = match &namespace {
        Some(ns) => Api::<Deployment>::namespaced(client.clone(), ns),
        None => Api::<Deployment>::all(client.clone()),
    };

    let services = match &namespace {
        Some(ns) => Api::<Service>::namespaced(client.clone(), ns),
        None => Api::<Service>::all(client.clone()),
    };

    let secrets = match &namespace {
        Some(ns) => Api::<Secret>::namespaced(client.clone(), ns),
        None => Api::<Secret>::all(client.clone()),
    };

    let ctx = Arc::new(ControllerContext {
        apis: ClusterApis::new(&client),
        metrics: Some(ControllerMetrics::new()),
        error_counts: DashMap::new(),
        cycle_timeout: cycle_timeout
            .unwrap_or_else(|| Duration::from_secs(DEFAULT_CYCLE_TIMEOUT_SECONDS)),
    });

    info!(
        namespace = namespace.as_deref().unwrap_or("all"),
        "Starting GuestbookApp controller"
    );

    Controller::new(apps, Config::default())
        .owns(deployments, Config::default())
        .owns(services, Config::default())
        .owns(secrets, Config::default())
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, action)) => {
                    debug!(
                        name = obj.name,
                        namespace = obj.namespace,
                        ?action,
                        "Reconciliation completed"
                    );
                }
                Err(e) => {
                    error!(error = %e, "Reconciliation failed");
                }
            }
        })
        .await;

    Ok(())
}

/// Main reconciliation function
#[instrument(skip(app, ctx), fields(name = %app.name_any(), namespace = app.namespace()))]
async fn reconcile(app: Arc<GuestbookApp>, ctx: Arc<ControllerContext>) -> Result<Action> {
    let start = std::time::Instant::now();

    if let Some(ref metrics) = ctx.metrics {
        metrics.reconciliations.increment(1);
    }

    let namespace = app.namespace().unwrap_or_else(|| "default".to_string());
    let name = app.name_any();

    let result = tokio::time::timeout(ctx.cycle_timeout, run_cycle(&ctx.apis, &namespace, &name))
        .await
        .map_err(|_| {
            OperatorError::Timeout(format!(
                "reconcile of {}/{} exceeded {}s",
                namespace,
                name,
                ctx.cycle_timeout.as_secs()
            ))
        })
        .and_then(|outcome| outcome);

    if let Some(ref metrics) = ctx.metrics {
        metrics.duration.record(start.elapsed().as_secs_f64());
    }

    match result {
        Ok(outcome) => {
            // Reset error backoff counter on success
            ctx.error_counts.remove(&name);
            Ok(match outcome {
                ReconcileOutcome::Done => {
                    Action::requeue(Duration::from_secs(DEFAULT_REQUEUE_SECONDS))
                }
                ReconcileOutcome::RequeueAfter(delay) => Action::requeue(delay),
            })
        }
        Err(err) => {
            if let Some(ref metrics) = ctx.metrics {
                metrics.errors.increment(1);
            }
            Err(err)
        }
    }
}

/// Run one reconciliation cycle for the named GuestbookApp
///
/// The cycle is stateless: it re-derives everything from the freshly
/// fetched object and may be re-entered from the first stage on every
/// invocation. Only the status subresource is mutated.
pub async fn run_cycle(
    apis: &ClusterApis,
    namespace: &str,
    name: &str,
) -> Result<ReconcileOutcome> {
    let Some(mut app) = apis.apps.fetch(namespace, name).await? else {
        // Deleted since the event was queued. Owned resources are garbage
        // collected through their owner references.
        debug!(name, namespace, "GuestbookApp is gone, nothing to reconcile");
        return Ok(ReconcileOutcome::Done);
    };

    if let Err(errors) = app.spec.validate() {
        let error_messages: Vec<String> = errors
            .field_errors()
            .iter()
            .flat_map(|(field, errs)| {
                errs.iter()
                    .map(move |e| format!("{}: {:?}", field, e.message))
            })
            .collect();
        let error_msg = error_messages.join("; ");
        warn!(name, errors = %error_msg, "App spec validation failed");
        return Err(OperatorError::InvalidConfig(error_msg));
    }

    let builder = ResourceBuilder::new(&app)?;

    // == Database tier ==========
    if let Some(delay) = ensure(apis.secrets.as_ref(), namespace, &builder.build_auth_secret())
        .await?
        .requeue_after()
    {
        return Ok(ReconcileOutcome::RequeueAfter(delay));
    }

    if let Some(delay) = ensure(
        apis.deployments.as_ref(),
        namespace,
        &builder.build_database_deployment(),
    )
    .await?
    .requeue_after()
    {
        return Ok(ReconcileOutcome::RequeueAfter(delay));
    }

    if let Some(delay) = ensure(
        apis.services.as_ref(),
        namespace,
        &builder.build_database_service(),
    )
    .await?
    .requeue_after()
    {
        return Ok(ReconcileOutcome::RequeueAfter(delay));
    }

    // Nothing downstream can start until the database serves; retry on a
    // short fixed delay rather than treating this as a failure.
    if !database_ready(apis.deployments.as_ref(), namespace, name).await {
        info!(
            name,
            delay_secs = DATABASE_WAIT_SECONDS,
            "database tier not ready, requeueing"
        );
        return Ok(ReconcileOutcome::RequeueAfter(Duration::from_secs(
            DATABASE_WAIT_SECONDS,
        )));
    }

    // == Backend tier ==========
    if let Some(delay) = ensure(
        apis.deployments.as_ref(),
        namespace,
        &builder.build_backend_deployment(),
    )
    .await?
    .requeue_after()
    {
        return Ok(ReconcileOutcome::RequeueAfter(delay));
    }

    if let Some(delay) = ensure(
        apis.services.as_ref(),
        namespace,
        &builder.build_backend_service(),
    )
    .await?
    .requeue_after()
    {
        return Ok(ReconcileOutcome::RequeueAfter(delay));
    }

    project_status(apis, namespace, &mut app, Tier::Backend).await?;

    if let Some(delay) = handle_changes(apis, namespace, &mut app, Tier::Backend, &builder)
        .await?
        .requeue_after()
    {
        return Ok(ReconcileOutcome::RequeueAfter(delay));
    }

    // == Frontend tier ==========
    if let Some(delay) = ensure(
        apis.deployments.as_ref(),
        namespace,
        &builder.build_frontend_deployment(),
    )
    .await?
    .requeue_after()
    {
        return Ok(ReconcileOutcome::RequeueAfter(delay));
    }

    if let Some(delay) = ensure(
        apis.services.as_ref(),
        namespace,
        &builder.build_frontend_service(),
    )
    .await?
    .requeue_after()
    {
        return Ok(ReconcileOutcome::RequeueAfter(delay));
    }

    project_status(apis, namespace, &mut app, Tier::Frontend).await?;

    if let Some(delay) = handle_changes(apis, namespace, &mut app, Tier::Frontend, &builder)
        .await?
        .requeue_after()
    {
        return Ok(ReconcileOutcome::RequeueAfter(delay));
    }

    // == Finish ==========
    debug!(name, "reconciliation converged");
    Ok(ReconcileOutcome::Done)
}

/// Whether the database tier is serving
///
/// Readiness is advisory: any failure to read the deployment counts as not
/// ready rather than as an error.
async fn database_ready(
    deployments: &dyn ResourceOps<Deployment>,
    namespace: &str,
    owner: &str,
) -> bool {
    let name = deployment_name(owner, Tier::Database);
    match deployments.find(namespace, &name).await {
        Ok(dep) => {
            let ready = dep
                .as_ref()
                .and_then(|d| d.status.as_ref())
                .and_then(|s| s.ready_replicas)
                .unwrap_or(0);
            ready >= 1
        }
        Err(err) => {
            warn!(
                name = %name,
                error = %err,
                "could not read database deployment, treating as not ready"
            );
            false
        }
    }
}

/// Observed runtime shape of a tier deployment
fn observe_deployment(dep: Option<&Deployment>) -> (i32, i32, bool) {
    let Some(dep) = dep else {
        return (0, 0, false);
    };
    let desired = dep.spec.as_ref().and_then(|s| s.replicas).unwrap_or(0);
    let replicas = dep
        .status
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(0);
    let ready_replicas = dep
        .status
        .as_ref()
        .and_then(|s| s.ready_replicas)
        .unwrap_or(0);
    (replicas, ready_replicas, desired > 0 && ready_replicas >= desired)
}

/// Roll the per-tier statuses up into an application phase
fn derive_phase(status: &GuestbookAppStatus) -> AppPhase {
    if status.backend.ready && status.frontend.ready {
        AppPhase::Running
    } else if status.backend.ready_replicas == 0 && status.frontend.ready_replicas == 0 {
        AppPhase::Provisioning
    } else {
        AppPhase::Degraded
    }
}

/// Project the tier's live runtime state onto the status subresource
///
/// Skips the write entirely when nothing changed, so converged cycles do
/// not trigger spurious re-reconciliation through the watch.
async fn project_status(
    apis: &ClusterApis,
    namespace: &str,
    app: &mut GuestbookApp,
    tier: Tier,
) -> Result<()> {
    let owner = app.name_any();
    let dep = apis
        .deployments
        .find(namespace, &deployment_name(&owner, tier))
        .await?;
    let (replicas, ready_replicas, ready) = observe_deployment(dep.as_ref());

    let mut status = app.status.clone().unwrap_or_default();
    let Some(slot) = status.tier_mut(tier) else {
        return Ok(());
    };

    if slot.replicas == replicas && slot.ready_replicas == ready_replicas && slot.ready == ready {
        debug!(tier = %tier, "tier status unchanged, skipping write");
        return Ok(());
    }

    slot.replicas = replicas;
    slot.ready_replicas = ready_replicas;
    slot.ready = ready;
    status.phase = derive_phase(&status);
    status.last_updated = Some(Utc::now().to_rfc3339());

    app.status = Some(status);
    *app = apis.apps.replace_status(namespace, app).await?;
    info!(tier = %tier, ready_replicas, replicas, "updated tier status");
    Ok(())
}

/// React to drift between the declared tier spec and what was last applied
///
/// A fresh instance records the declared spec without acting (the tier was
/// just built from it). On a later change, the rebuilt deployment is
/// server-side applied to roll the tier and the new spec is recorded.
async fn handle_changes(
    apis: &ClusterApis,
    namespace: &str,
    app: &mut GuestbookApp,
    tier: Tier,
    builder: &ResourceBuilder,
) -> Result<StageOutcome> {
    let declared = app.spec.declared_for(tier);
    let recorded = app
        .status
        .as_ref()
        .and_then(|s| s.tier(tier))
        .and_then(|t| t.applied.clone());

    match recorded {
        Some(applied) if applied == declared => Ok(StageOutcome::Continue),
        Some(applied) => {
            let name = deployment_name(&app.name_any(), tier);
            info!(
                tier = %tier,
                deployment = %name,
                applied_version = %applied.version,
                declared_version = %declared.version,
                "tier spec changed, rolling deployment"
            );
            apis.deployments
                .apply(namespace, &name, &builder.deployment_for(tier))
                .await?;
            record_applied(apis, namespace, app, tier, declared).await?;
            // Re-enter immediately so the rollout is re-observed from the top.
            Ok(StageOutcome::Requeue(Duration::ZERO))
        }
        None => {
            debug!(tier = %tier, "recording initial applied spec");
            record_applied(apis, namespace, app, tier, declared).await?;
            Ok(StageOutcome::Continue)
        }
    }
}

async fn record_applied(
    apis: &ClusterApis,
    namespace: &str,
    app: &mut GuestbookApp,
    tier: Tier,
    declared: AppliedSpec,
) -> Result<()> {
    let mut status = app.status.clone().unwrap_or_default();
    if let Some(slot) = status.tier_mut(tier) {
        slot.applied = Some(declared);
    }
    status.last_updated = Some(Utc::now().to_rfc3339());
    app.status = Some(status);
    *app = apis.apps.replace_status(namespace, app).await?;
    Ok(())
}

/// Error policy for the controller: capped exponential backoff
fn error_policy(
    app: Arc<GuestbookApp>,
    error: &OperatorError,
    ctx: Arc<ControllerContext>,
) -> Action {
    let key = app.name_any();
    let retries = {
        let mut entry = ctx.error_counts.entry(key.clone()).or_insert(0);
        *entry += 1;
        *entry
    };

    // Use the error's suggested delay OR exponential backoff:
    // 30s → 60s → 120s → 240s → 480s → 600s (capped)
    let delay = error.requeue_delay().unwrap_or_else(|| {
        let base = Duration::from_secs(ERROR_REQUEUE_SECONDS);
        let backoff = base * 2u32.saturating_pow((retries - 1).min(5));
        backoff.min(Duration::from_secs(MAX_ERROR_REQUEUE_SECONDS))
    });

    warn!(
        error = %error,
        retry = retries,
        delay_secs = delay.as_secs(),
        "Reconciliation error for '{}', will retry",
        key
    );

    Action::requeue(delay)
}

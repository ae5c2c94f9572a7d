//! Idempotent create-if-absent primitive
//!
//! Every managed resource kind goes through the single generic [`ensure`]
//! function: look the resource up by its derived identity, create it when
//! absent, and leave it untouched when present. Existing state wins
//! unconditionally here; responding to declared-spec drift is the change
//! handler's job, not this primitive's.

use kube::{Resource, ResourceExt};
use std::time::Duration;
use tracing::{debug, info};

use crate::api::ResourceOps;
use crate::error::Result;

/// Outcome of a single reconciliation stage
///
/// A stage either lets the cycle proceed or schedules the next cycle after
/// a delay. Stage failures are `Err` on the surrounding `Result`; the loop
/// stops at the first stage that does not continue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    /// Proceed to the next stage
    Continue,
    /// Stop the cycle and run again after the given delay
    Requeue(Duration),
}

impl StageOutcome {
    /// The requeue delay, if this outcome stops the cycle
    pub fn requeue_after(self) -> Option<Duration> {
        match self {
            StageOutcome::Continue => None,
            StageOutcome::Requeue(delay) => Some(delay),
        }
    }
}

/// Ensure a resource exists, creating it from the descriptor when absent
///
/// Safe to call on every cycle: N invocations with the same descriptor
/// produce at most one creation and N-1 no-ops. A creation rejected with
/// "already exists" means a concurrent creator won the race and is treated
/// as success. Any other lookup or creation failure propagates.
pub async fn ensure<K>(ops: &dyn ResourceOps<K>, namespace: &str, desired: &K) -> Result<StageOutcome>
where
    K: Resource<DynamicType = ()> + Send + Sync + 'static,
{
    let kind = K::kind(&());
    let name = desired.name_any();

    if ops.find(namespace, &name).await?.is_some() {
        debug!(kind = %kind, name = %name, "resource already exists, leaving as-is");
        return Ok(StageOutcome::Continue);
    }

    match ops.create(namespace, desired).await {
        Ok(_) => {
            info!(kind = %kind, name = %name, namespace = %namespace, "created resource");
            Ok(StageOutcome::Continue)
        }
        Err(err) if err.is_already_exists() => {
            debug!(kind = %kind, name = %name, "lost creation race, treating as success");
            Ok(StageOutcome::Continue)
        }
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::MockResourceOps;
    use crate::error::OperatorError;
    use k8s_openapi::api::core::v1::Secret;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use kube::core::ErrorResponse;

    fn test_secret(name: &str) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn api_error(code: u16, reason: &str) -> OperatorError {
        OperatorError::KubeError(kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: format!("{} ({})", reason, code),
            reason: reason.to_string(),
            code,
        }))
    }

    #[tokio::test]
    async fn creates_resource_when_absent() {
        let mut ops = MockResourceOps::<Secret>::new();
        ops.expect_find()
            .withf(|ns, name| ns == "default" && name == "app-mysql-auth")
            .times(1)
            .returning(|_, _| Ok(None));
        ops.expect_create()
            .withf(|_, s: &Secret| s.metadata.name.as_deref() == Some("app-mysql-auth"))
            .times(1)
            .returning(|_, s| Ok(s.clone()));

        let outcome = ensure(&ops, "default", &test_secret("app-mysql-auth"))
            .await
            .unwrap();
        assert_eq!(outcome, StageOutcome::Continue);
    }

    #[tokio::test]
    async fn leaves_existing_resource_untouched() {
        let mut ops = MockResourceOps::<Secret>::new();
        // No create expectation: any creation attempt fails the test.
        ops.expect_find()
            .times(1)
            .returning(|_, name| Ok(Some(test_secret(name))));

        let outcome = ensure(&ops, "default", &test_secret("app-mysql-auth"))
            .await
            .unwrap();
        assert_eq!(outcome, StageOutcome::Continue);
    }

    #[tokio::test]
    async fn repeated_ensure_creates_exactly_once() {
        let mut ops = MockResourceOps::<Secret>::new();
        let mut seq = mockall::Sequence::new();
        ops.expect_find()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(None));
        ops.expect_create()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, s| Ok(s.clone()));
        ops.expect_find()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, name| Ok(Some(test_secret(name))));

        let desired = test_secret("app-mysql-auth");
        assert_eq!(
            ensure(&ops, "default", &desired).await.unwrap(),
            StageOutcome::Continue
        );
        assert_eq!(
            ensure(&ops, "default", &desired).await.unwrap(),
            StageOutcome::Continue
        );
    }

    #[tokio::test]
    async fn concurrent_creation_is_success() {
        let mut ops = MockResourceOps::<Secret>::new();
        ops.expect_find().times(1).returning(|_, _| Ok(None));
        ops.expect_create()
            .times(1)
            .returning(|_, _| Err(api_error(409, "AlreadyExists")));

        let outcome = ensure(&ops, "default", &test_secret("app-mysql-auth"))
            .await
            .unwrap();
        assert_eq!(outcome, StageOutcome::Continue);
    }

    #[tokio::test]
    async fn creation_failure_propagates() {
        let mut ops = MockResourceOps::<Secret>::new();
        ops.expect_find().times(1).returning(|_, _| Ok(None));
        ops.expect_create()
            .times(1)
            .returning(|_, _| Err(api_error(403, "Forbidden")));

        let err = ensure(&ops, "default", &test_secret("app-mysql-auth"))
            .await
            .unwrap_err();
        assert!(matches!(err, OperatorError::KubeError(_)));
    }

    #[tokio::test]
    async fn lookup_failure_propagates() {
        let mut ops = MockResourceOps::<Secret>::new();
        // No create expectation: the primitive must not attempt creation
        // when the lookup fails for a reason other than "not found".
        ops.expect_find()
            .times(1)
            .returning(|_, _| Err(api_error(500, "InternalError")));

        let err = ensure(&ops, "default", &test_secret("app-mysql-auth"))
            .await
            .unwrap_err();
        assert!(matches!(err, OperatorError::KubeError(_)));
    }
}

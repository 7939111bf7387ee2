//! Post-apply readiness polling for Deployments

use std::sync::Arc;
use std::time::{Duration, Instant};

use k8s_openapi::api::apps::v1::Deployment;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::kube_api::ClusterApi;
use crate::{Error, Result};

/// Default interval between readiness polls
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Default overall readiness deadline
pub const DEFAULT_READINESS_TIMEOUT: Duration = Duration::from_secs(300);

/// Replica counts observed on a Deployment
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReplicaCounts {
    /// `spec.replicas`, 1 when unset
    pub desired: i32,
    /// `status.readyReplicas`, 0 when unset
    pub ready: i32,
}

impl ReplicaCounts {
    /// Read the counts off a Deployment
    pub fn of(deployment: &Deployment) -> Self {
        Self {
            desired: deployment
                .spec
                .as_ref()
                .and_then(|s| s.replicas)
                .unwrap_or(1),
            ready: deployment
                .status
                .as_ref()
                .and_then(|s| s.ready_replicas)
                .unwrap_or(0),
        }
    }

    /// Ready once every desired replica is ready and at least one is desired
    pub fn is_ready(&self) -> bool {
        self.desired > 0 && self.ready >= self.desired
    }
}

/// Polls a Deployment at a fixed interval until it is ready
#[derive(Clone)]
pub struct ReadinessWaiter {
    api: Arc<dyn ClusterApi>,
    interval: Duration,
    timeout: Duration,
    cancel: CancellationToken,
}

impl ReadinessWaiter {
    /// Create a waiter with the default interval and timeout
    pub fn new(api: Arc<dyn ClusterApi>, cancel: CancellationToken) -> Self {
        Self {
            api,
            interval: DEFAULT_POLL_INTERVAL,
            timeout: DEFAULT_READINESS_TIMEOUT,
            cancel,
        }
    }

    /// Override the overall deadline
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Override the poll interval
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Wait until the Deployment reports all desired replicas ready.
    ///
    /// A missing Deployment or a failed read counts as not ready yet. Fails
    /// with [`Error::Timeout`] once the deadline passes, or with
    /// [`Error::Cancelled`] when the run is cancelled.
    pub async fn wait_for_deployment(&self, namespace: &str, name: &str) -> Result<()> {
        let resource = format!("Deployment/{}/{}", namespace, name);
        let start = Instant::now();

        loop {
            let read = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    return Err(Error::cancelled(format!("waiting for {}", resource)))
                }
                read = self.api.read_deployment(namespace, name) => read,
            };

            match read {
                Ok(deployment) => {
                    let counts = ReplicaCounts::of(&deployment);
                    if counts.is_ready() {
                        debug!(
                            resource = %resource,
                            ready = counts.ready,
                            elapsed_ms = start.elapsed().as_millis() as u64,
                            "deployment ready"
                        );
                        return Ok(());
                    }
                    trace!(
                        resource = %resource,
                        ready = counts.ready,
                        desired = counts.desired,
                        "deployment not ready yet"
                    );
                }
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) if e.is_not_found() => {
                    trace!(resource = %resource, "deployment not found yet");
                }
                Err(e) => {
                    trace!(
                        resource = %resource,
                        error = %e,
                        "readiness read failed, still waiting"
                    );
                }
            }

            let elapsed = start.elapsed();
            if elapsed >= self.timeout {
                return Err(Error::timeout(resource, elapsed));
            }

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    return Err(Error::cancelled(format!("waiting for {}", resource)))
                }
                _ = tokio::time::sleep(self.interval.min(self.timeout - elapsed)) => {}
            }
        }
    }

    /// Single read of a Deployment's readiness; absent or unreadable is not ready
    pub async fn is_ready(&self, namespace: &str, name: &str) -> bool {
        match self.api.read_deployment(namespace, name).await {
            Ok(deployment) => ReplicaCounts::of(&deployment).is_ready(),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::api_error;
    use crate::kube_api::MockClusterApi;
    use k8s_openapi::api::apps::v1::{DeploymentSpec, DeploymentStatus};
    use rstest::rstest;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn deployment(replicas: Option<i32>, ready: Option<i32>) -> Deployment {
        Deployment {
            spec: Some(DeploymentSpec {
                replicas,
                ..Default::default()
            }),
            status: Some(DeploymentStatus {
                ready_replicas: ready,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn waiter(api: MockClusterApi, timeout: Duration) -> ReadinessWaiter {
        ReadinessWaiter::new(Arc::new(api), CancellationToken::new())
            .with_interval(Duration::from_millis(5))
            .with_timeout(timeout)
    }

    #[rstest]
    #[case(Some(1), Some(1), true)]
    #[case(Some(3), Some(2), false)]
    #[case(Some(2), Some(3), true)]
    #[case(Some(0), Some(0), false)]
    #[case(None, Some(1), true)]
    #[case(None, None, false)]
    fn readiness_rule(
        #[case] replicas: Option<i32>,
        #[case] ready: Option<i32>,
        #[case] expected: bool,
    ) {
        assert_eq!(ReplicaCounts::of(&deployment(replicas, ready)).is_ready(), expected);
    }

    #[tokio::test]
    async fn waits_through_not_found_until_ready() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let mut api = MockClusterApi::new();
        api.expect_read_deployment().returning(move |_, _| {
            match c.fetch_add(1, Ordering::SeqCst) {
                0 => Err(api_error(404, "NotFound")),
                1 => Ok(deployment(Some(2), Some(1))),
                _ => Ok(deployment(Some(2), Some(2))),
            }
        });

        waiter(api, Duration::from_secs(5))
            .wait_for_deployment("sys", "op")
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn times_out_naming_the_resource() {
        let mut api = MockClusterApi::new();
        api.expect_read_deployment()
            .returning(|_, _| Ok(deployment(Some(1), Some(0))));

        let err = waiter(api, Duration::from_millis(30))
            .wait_for_deployment("sys", "op")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
        assert!(err.to_string().contains("Deployment/sys/op"));
    }

    #[tokio::test]
    async fn cancellation_stops_the_wait() {
        let mut api = MockClusterApi::new();
        api.expect_read_deployment()
            .returning(|_, _| Ok(deployment(Some(1), Some(0))));
        let cancel = CancellationToken::new();
        let waiter = ReadinessWaiter::new(Arc::new(api), cancel.clone())
            .with_interval(Duration::from_secs(60))
            .with_timeout(Duration::from_secs(600));

        let handle = tokio::spawn(async move { waiter.wait_for_deployment("sys", "op").await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        let err = handle.await.unwrap().unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn single_check_treats_errors_as_not_ready() {
        let mut api = MockClusterApi::new();
        api.expect_read_deployment()
            .returning(|_, _| Err(api_error(500, "InternalError")));
        assert!(!waiter(api, Duration::from_secs(1)).is_ready("sys", "op").await);
    }
}

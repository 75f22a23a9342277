//! Waiting for a tracked object to settle after handing it to an agent.

use std::time::Duration;

use edgegrid_core::{TrackedObject, TrackedState};
use tokio::sync::mpsc;
use tracing::debug;

use crate::cache::ObjectCache;
use crate::error::{SyncError, SyncResult};
use crate::progress::Progress;

/// What a lifecycle wait is looking for.
#[derive(Debug, Clone)]
pub struct WaitSpec<'a> {
    pub target: TrackedState,
    /// States that mean "still working"; their status text is forwarded.
    pub transitional: &'a [TrackedState],
    pub error_state: TrackedState,
    pub timeout: Duration,
    /// Sent to the progress sink on success, unless empty.
    pub success_msg: String,
}

enum Observation {
    Done,
    Failed(Vec<String>),
    Pending { status: Option<String> },
}

impl<T: TrackedObject> ObjectCache<T> {
    /// Block until the object at `key` reaches `spec.target`, reaches
    /// `spec.error_state`, or the timeout elapses. An absent object counts
    /// as reaching a `NotPresent` target.
    pub async fn wait_for_state(
        &self,
        key: &T::Key,
        spec: &WaitSpec<'_>,
        progress: &dyn Progress,
    ) -> SyncResult<()> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        // Register before the first check so no transition can slip between.
        let _watch = self.watch_key(key, move || {
            let _ = tx.send(());
        });
        let deadline = tokio::time::Instant::now() + spec.timeout;
        let mut last_status = String::new();

        loop {
            match observe(self.get(key).as_ref(), spec) {
                Observation::Done => {
                    if !spec.success_msg.is_empty() {
                        progress.send(&spec.success_msg);
                    }
                    return Ok(());
                }
                Observation::Failed(errors) if errors.is_empty() => {
                    return Err(SyncError::UnknownFailure);
                }
                Observation::Failed(errors) => return Err(SyncError::Failed(errors)),
                Observation::Pending {
                    status: Some(status),
                } if status != last_status => {
                    progress.send(&status);
                    last_status = status;
                }
                Observation::Pending { .. } => {}
            }

            if tokio::time::timeout_at(deadline, rx.recv()).await.is_err() {
                let current = self
                    .get(key)
                    .map_or(TrackedState::NotPresent, |obj| obj.state());
                debug!(kind = T::TYPE_NAME, %key, expected = %spec.target, %current, "wait timed out");
                return Err(SyncError::Timeout {
                    expected: spec.target,
                    current,
                });
            }
        }
    }
}

fn observe<T: TrackedObject>(obj: Option<&T>, spec: &WaitSpec<'_>) -> Observation {
    let Some(obj) = obj else {
        return if spec.target == TrackedState::NotPresent {
            Observation::Done
        } else {
            Observation::Pending { status: None }
        };
    };
    let state = obj.state();
    if state == spec.target {
        Observation::Done
    } else if state == spec.error_state {
        Observation::Failed(obj.errors().to_vec())
    } else if spec.transitional.contains(&state) && !obj.status().is_empty() {
        Observation::Pending {
            status: Some(obj.status().to_string()),
        }
    } else {
        Observation::Pending { status: None }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::CollectProgress;
    use edgegrid_core::{CloudletKey, ClusterInst, ClusterInstKey};

    fn key() -> ClusterInstKey {
        ClusterInstKey::new("c1", CloudletKey::new("op", "edge1"), "dev")
    }

    fn inst(state: TrackedState, status: &str, errors: &[&str]) -> ClusterInst {
        ClusterInst {
            key: key(),
            state,
            status: status.to_string(),
            errors: errors.iter().map(|e| e.to_string()).collect(),
            ..Default::default()
        }
    }

    fn create_spec(timeout: Duration) -> WaitSpec<'static> {
        WaitSpec {
            target: TrackedState::Ready,
            transitional: &[TrackedState::Creating],
            error_state: TrackedState::CreateError,
            timeout,
            success_msg: "Created successfully".to_string(),
        }
    }

    #[tokio::test]
    async fn reaches_target_and_forwards_status() {
        let cache = ObjectCache::<ClusterInst>::new();
        cache.update(inst(TrackedState::CreateRequested, "", &[]), 1);

        let writer = cache.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            writer.update(inst(TrackedState::Creating, "Creating VMs", &[]), 2);
            tokio::time::sleep(Duration::from_millis(10)).await;
            writer.update(inst(TrackedState::Ready, "", &[]), 3);
        });

        let progress = CollectProgress::new();
        cache
            .wait_for_state(&key(), &create_spec(Duration::from_secs(2)), &progress)
            .await
            .unwrap();
        assert!(progress.contains("Creating VMs"));
        assert_eq!(progress.messages().last().unwrap(), "Created successfully");
        assert_eq!(cache.watch_count(), 0);
    }

    #[tokio::test]
    async fn error_state_carries_errors() {
        let cache = ObjectCache::<ClusterInst>::new();
        cache.update(inst(TrackedState::CreateError, "", &["no capacity"]), 1);

        let err = cache
            .wait_for_state(&key(), &create_spec(Duration::from_secs(1)), &CollectProgress::new())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Encountered failures: [no capacity]");
    }

    #[tokio::test]
    async fn error_state_without_details() {
        let cache = ObjectCache::<ClusterInst>::new();
        cache.update(inst(TrackedState::CreateError, "", &[]), 1);
        let err = cache
            .wait_for_state(&key(), &create_spec(Duration::from_secs(1)), &CollectProgress::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::UnknownFailure));
    }

    #[tokio::test]
    async fn deletion_satisfies_not_present() {
        let cache = ObjectCache::<ClusterInst>::new();
        cache.update(inst(TrackedState::DeleteRequested, "", &[]), 1);
        let writer = cache.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            writer.delete(&key(), 2);
        });

        let spec = WaitSpec {
            target: TrackedState::NotPresent,
            transitional: &[TrackedState::Deleting],
            error_state: TrackedState::DeleteError,
            timeout: Duration::from_secs(2),
            success_msg: String::new(),
        };
        let progress = CollectProgress::new();
        cache.wait_for_state(&key(), &spec, &progress).await.unwrap();
        assert!(progress.messages().is_empty());
    }

    #[tokio::test]
    async fn times_out_with_current_state() {
        let cache = ObjectCache::<ClusterInst>::new();
        cache.update(inst(TrackedState::CreateRequested, "", &[]), 1);
        let err = cache
            .wait_for_state(
                &key(),
                &create_spec(Duration::from_millis(30)),
                &CollectProgress::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Timed out; expected state Ready but is CreateRequested"
        );
    }
}

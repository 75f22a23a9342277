//! Lease-bound progress streams.
//!
//! Every public create or delete records its progress messages in a
//! [`StreamObj`] so another client can follow a long-running operation.
//! The object is written under a lease that is kept alive while the
//! operation runs and left to expire once it finishes.

use edgegrid_core::{ObjKey, StoredObject, StreamKey, StreamObj, StreamState};
use edgegrid_store::LeaseId;
use edgegrid_sync::{KeepAlive, Progress};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::controller::Controller;
use crate::error::{ApiError, ApiResult};

/// Progress sink that forwards to the caller and records into the
/// stream object.
pub struct StreamSend<'a> {
    controller: Controller,
    key: StreamKey,
    lease: LeaseId,
    caller: &'a dyn Progress,
    tx: Option<mpsc::UnboundedSender<String>>,
    writer: Option<JoinHandle<()>>,
    keep_alive: Option<KeepAlive>,
}

impl Progress for StreamSend<'_> {
    fn send(&self, msg: &str) {
        self.caller.send(msg);
        if let Some(tx) = &self.tx {
            let _ = tx.send(msg.to_string());
        }
    }
}

impl StreamSend<'_> {
    pub fn key(&self) -> &StreamKey {
        &self.key
    }

    /// Flush pending messages and record the outcome. The stream object
    /// expires one TTL later.
    pub async fn finish(mut self, result: &ApiResult<()>) {
        drop(self.tx.take());
        if let Some(writer) = self.writer.take() {
            let _ = writer.await;
        }
        let (state, error) = match result {
            Ok(()) => (StreamState::Done, String::new()),
            Err(e) => (StreamState::Error, e.to_string()),
        };
        let key = &self.key;
        let lease = self.lease;
        let done = self
            .controller
            .sync()
            .apply_stm_wait(|stm| {
                if let Some(mut obj) = stm.get::<StreamObj>(key)? {
                    obj.state = state;
                    obj.error = error.clone();
                    stm.put_with_lease(&obj, lease)?;
                }
                Ok::<_, ApiError>(())
            })
            .await;
        if let Err(e) = done {
            warn!(stream = %self.key, error = %e, "failed to finish stream");
        }
        if let Some(keep_alive) = self.keep_alive.take() {
            keep_alive.stop().await;
        }
        debug!(stream = %self.key, ?state, "stream finished");
    }
}

impl Controller {
    /// Open a progress stream for an operation on the `T` at `key`,
    /// replacing any earlier stream for the same object.
    pub async fn start_stream<'a, T: StoredObject>(
        &self,
        key: &T::Key,
        caller: &'a dyn Progress,
    ) -> ApiResult<StreamSend<'a>> {
        let stream_key = StreamKey {
            type_name: T::TYPE_NAME.to_string(),
            key_id: key.key_string(),
        };
        let settings = self.settings();
        let lease = self.sync().grant_lease(settings.stream_ttl)?;
        let obj = StreamObj {
            key: stream_key.clone(),
            ..Default::default()
        };
        self.sync()
            .apply_stm_wait(|stm| {
                stm.put_with_lease(&obj, lease)?;
                Ok::<_, ApiError>(())
            })
            .await?;
        let keep_alive = self
            .sync()
            .spawn_keep_alive(lease, settings.keep_alive_interval);

        // A single writer keeps the stored messages in send order.
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let writer_ctrl = self.clone();
        let writer_key = stream_key.clone();
        let writer = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = writer_ctrl.append_stream_msg(&writer_key, lease, msg).await {
                    warn!(stream = %writer_key, error = %e, "failed to record progress");
                }
            }
        });

        Ok(StreamSend {
            controller: self.clone(),
            key: stream_key,
            lease,
            caller,
            tx: Some(tx),
            writer: Some(writer),
            keep_alive: Some(keep_alive),
        })
    }

    async fn append_stream_msg(&self, key: &StreamKey, lease: LeaseId, msg: String) -> ApiResult<()> {
        self.sync()
            .apply_stm_wait(|stm| {
                if let Some(mut obj) = stm.get::<StreamObj>(key)? {
                    obj.msgs.push(msg.clone());
                    stm.put_with_lease(&obj, lease)?;
                }
                Ok::<_, ApiError>(())
            })
            .await?;
        Ok(())
    }

    /// The recorded progress of the latest operation on the `T` at `key`.
    pub fn stream_of<T: StoredObject>(&self, key: &T::Key) -> Option<StreamObj> {
        self.caches().stream_obj.get(&StreamKey {
            type_name: T::TYPE_NAME.to_string(),
            key_id: key.key_string(),
        })
    }
}

// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_channel::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

use super::OffsetStore;
use crate::message::{next_offsets, PartitionOffsetRange, TopicPartition};
use crate::AppError;

type CommitRequest = BTreeMap<TopicPartition, i64>;

/// Fire-and-forget offset commits. A single worker applies queued commits in
/// order; failures are logged and never reach the caller.
pub struct OffsetCommitter {
    request_tx: async_channel::Sender<CommitRequest>,
    worker: Option<JoinHandle<()>>,
}

impl OffsetCommitter {
    pub fn spawn<S: OffsetStore>(store: Arc<S>, group_id: String, capacity: usize) -> Self {
        let (request_tx, request_rx) = async_channel::bounded::<CommitRequest>(capacity);

        let worker = tokio::spawn(async move {
            debug!("offset committer for group {} started", group_id);
            // recv fails only once the channel is closed and drained
            while let Ok(offsets) = request_rx.recv().await {
                trace!("committing {:?} for group {}", offsets, group_id);
                match store.commit_offsets(&group_id, offsets).await {
                    Ok(()) => {}
                    Err(err) if !err.is_fatal() => warn!(
                        "group {}: {}; the range will be re-read after a restart",
                        group_id, err
                    ),
                    Err(err) => error!("group {}: unexpected commit error: {}", group_id, err),
                }
            }
            debug!("offset committer for group {} exiting", group_id);
        });

        OffsetCommitter {
            request_tx,
            worker: Some(worker),
        }
    }

    pub fn commit_async(&self, offset_ranges: &[PartitionOffsetRange]) {
        if offset_ranges.is_empty() {
            return;
        }
        let offsets = next_offsets(offset_ranges);

        match self.request_tx.try_send(offsets) {
            Ok(()) => {}
            Err(TrySendError::Full(offsets)) => {
                let err = AppError::CommitFailure(format!("commit queue full, dropped {:?}", offsets));
                warn!("{}", err);
            }
            Err(TrySendError::Closed(offsets)) => {
                let err = AppError::CommitFailure(format!("committer closed, dropped {:?}", offsets));
                error!("{}", err);
            }
        }
    }

    /// Stops accepting commits and waits until the queued ones are applied.
    pub async fn shutdown(&mut self) {
        self.request_tx.close();
        if let Some(worker) = self.worker.take() {
            if let Err(join_error) = worker.await {
                error!("offset committer task failed: {}", join_error);
            }
        }
    }
}

impl Drop for OffsetCommitter {
    fn drop(&mut self) {
        self.request_tx.close();
    }
}

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use futures::TryStreamExt;
use object_store::local::LocalFileSystem;
use object_store::path::Path;
use object_store::{ObjectStore, PutOptions, PutPayload};
use tracing::{debug, info, trace};
use uuid::Uuid;

use super::{
    encode_batch, open_location, BatchSink, OutputFormat, StoreKind, StoreLocation, WriteMode,
    WriteOutcome, WriteResult,
};
use crate::{AppError, AppResult};

/// Writes each batch as one `part-*` file under a destination prefix.
#[derive(Debug)]
pub struct ObjectStoreSink {
    store: Arc<dyn ObjectStore>,
    prefix: Path,
    uri: String,
    kind: StoreKind,
    sequence: AtomicU64,
}

impl ObjectStoreSink {
    pub fn new(location: StoreLocation) -> Self {
        ObjectStoreSink {
            store: location.store,
            prefix: location.path,
            uri: location.uri,
            kind: location.kind,
            sequence: AtomicU64::new(0),
        }
    }

    pub fn open(location: &str) -> AppResult<Self> {
        Ok(Self::new(open_location(location)?))
    }

    /// Every object currently stored under the destination prefix.
    pub async fn existing_objects(&self) -> AppResult<Vec<Path>> {
        let objects = self
            .store
            .list(Some(&self.prefix))
            .map_ok(|meta| meta.location)
            .try_collect::<Vec<_>>()
            .await
            .map_err(|err| AppError::WriteFailure(format!("listing {}: {}", self.uri, err)))?;
        Ok(objects)
    }

    fn next_file(&self, format: OutputFormat) -> Path {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        self.prefix.child(format!(
            "part-{:05}-{}.{}",
            sequence,
            Uuid::new_v4(),
            format.extension()
        ))
    }
}

/// Flushes a written local file and its directory entry to disk. The local
/// store renames a staged file into place without syncing either.
async fn sync_local(local: &LocalFileSystem, path: &Path, file: bool) -> AppResult<()> {
    let file_path = local.path_to_filesystem(path)?;
    if file {
        fsync(&file_path).await?;
    }
    if let Some(dir) = file_path.parent() {
        fsync(dir).await?;
    }
    trace!("synced {}", file_path.display());
    Ok(())
}

async fn fsync(target: &std::path::Path) -> AppResult<()> {
    let result = match tokio::fs::File::open(target).await {
        Ok(file) => file.sync_all().await,
        Err(err) => Err(err),
    };
    result.map_err(|err| AppError::WriteFailure(format!("fsync {}: {}", target.display(), err)))
}

#[async_trait]
impl BatchSink for ObjectStoreSink {
    async fn write(
        &self,
        rows: &RecordBatch,
        format: OutputFormat,
        mode: WriteMode,
    ) -> AppResult<WriteResult> {
        let existing = self.existing_objects().await?;
        let mut result = WriteResult {
            location: self.uri.clone(),
            format,
            mode,
            rows_written: 0,
            files: Vec::new(),
            outcome: WriteOutcome::Written,
        };

        if !existing.is_empty() {
            match mode {
                WriteMode::ErrorIfExists => {
                    return Err(AppError::DestinationConflict(format!(
                        "{} holds {} objects",
                        self.uri,
                        existing.len()
                    )));
                }
                WriteMode::Ignore => {
                    debug!("{} already holds data, ignoring batch", self.uri);
                    result.outcome = WriteOutcome::Ignored;
                    return Ok(result);
                }
                WriteMode::Append | WriteMode::Overwrite => {}
            }
        }

        if rows.num_rows() > 0 {
            let payload = encode_batch(rows, format)?;
            let path = self.next_file(format);
            let size = payload.len();
            self.store
                .put_opts(
                    &path,
                    PutPayload::from(payload),
                    PutOptions {
                        mode: self.kind.put_mode(),
                        ..Default::default()
                    },
                )
                .await?;
            if let StoreKind::Local(local) = &self.kind {
                sync_local(local, &path, true).await?;
            }
            debug!("wrote {} rows ({} bytes) to {}", rows.num_rows(), size, path);
            result.rows_written = rows.num_rows();
            result.files.push(path.to_string());
        }

        // the new file is in place before old data goes away
        if mode == WriteMode::Overwrite && !existing.is_empty() {
            for path in &existing {
                match self.store.delete(path).await {
                    Ok(()) | Err(object_store::Error::NotFound { .. }) => {}
                    Err(err) => return Err(err.into()),
                }
            }
            if let StoreKind::Local(local) = &self.kind {
                for path in &existing {
                    sync_local(local, path, false).await?;
                }
            }
            info!("overwrite removed {} objects from {}", existing.len(), self.uri);
        }

        Ok(result)
    }
}

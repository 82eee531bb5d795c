use std::sync::Arc;

use object_store::aws::AmazonS3Builder;
use object_store::gcp::GoogleCloudStorageBuilder;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path;
use object_store::{ObjectStore, PutMode};
use url::Url;

use crate::{AppError, AppResult};

/// The backend behind a location, for the few places where they differ.
#[derive(Debug, Clone)]
pub enum StoreKind {
    Memory,
    /// Rooted at `/`, object paths are absolute filesystem paths.
    Local(Arc<LocalFileSystem>),
    S3,
    Gcs,
}

impl StoreKind {
    /// S3 rejects create-if-absent puts unless conditional puts are set up
    /// for the bucket. Part files carry a uuid, so a plain put cannot clobber.
    pub fn put_mode(&self) -> PutMode {
        match self {
            StoreKind::S3 => PutMode::Overwrite,
            StoreKind::Memory | StoreKind::Local(_) | StoreKind::Gcs => PutMode::Create,
        }
    }
}

/// An object store handle plus the prefix a location points at.
#[derive(Debug, Clone)]
pub struct StoreLocation {
    pub store: Arc<dyn ObjectStore>,
    pub path: Path,
    pub uri: String,
    pub kind: StoreKind,
}

impl StoreLocation {
    pub fn in_memory(store: Arc<InMemory>, path: impl Into<Path>) -> Self {
        let path = path.into();
        StoreLocation {
            uri: format!("memory:///{}", path),
            store,
            path,
            kind: StoreKind::Memory,
        }
    }
}

/// Accepts `memory://`, `file://`, `gs://`, `s3://` and friends, or a plain
/// filesystem path (relative paths resolve against the working directory).
pub fn parse_location(location: &str) -> AppResult<Url> {
    let location = location.trim();
    match Url::parse(location) {
        // single letter schemes are windows drive letters
        Ok(url) if url.scheme().len() > 1 => Ok(url),
        _ => {
            let path = std::path::Path::new(location);
            let absolute = if path.is_absolute() {
                path.to_path_buf()
            } else {
                std::env::current_dir()?.join(path)
            };
            Url::from_file_path(&absolute).map_err(|_| {
                AppError::InvalidValue(format!("location: {}", absolute.display()))
            })
        }
    }
}

/// Cloud stores take credentials and region from the usual `AWS_*` and
/// `GOOGLE_*` environment variables.
pub fn open_location(location: &str) -> AppResult<StoreLocation> {
    let url = parse_location(location)?;
    let invalid = |reason: String| {
        AppError::InvalidValue(format!("cannot open location {}: {}", url, reason))
    };
    let path = Path::from_url_path(url.path()).map_err(|err| invalid(err.to_string()))?;

    let (store, kind): (Arc<dyn ObjectStore>, StoreKind) = match url.scheme() {
        "memory" => (Arc::new(InMemory::new()), StoreKind::Memory),
        "file" => {
            let local = Arc::new(LocalFileSystem::new());
            (local.clone(), StoreKind::Local(local))
        }
        "s3" | "s3a" => {
            let s3 = AmazonS3Builder::from_env()
                .with_url(url.as_str())
                .build()
                .map_err(|err| invalid(err.to_string()))?;
            (Arc::new(s3), StoreKind::S3)
        }
        "gs" => {
            let gcs = GoogleCloudStorageBuilder::from_env()
                .with_url(url.as_str())
                .build()
                .map_err(|err| invalid(err.to_string()))?;
            (Arc::new(gcs), StoreKind::Gcs)
        }
        other => return Err(invalid(format!("unsupported scheme {}", other))),
    };

    Ok(StoreLocation {
        store,
        path,
        uri: url.to_string(),
        kind,
    })
}

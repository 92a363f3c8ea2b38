//! Object-store abstraction used for staging job inputs and outputs.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use chrono::{DateTime, Utc};

/// Access level granted by a time-limited container URL.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SasPermission {
    /// Blobs in the container may be read.
    Read,
    /// Blobs may be written into the container.
    Write,
}

impl SasPermission {
    /// Returns the single-letter permission token used in signed queries.
    #[must_use]
    pub const fn token(self) -> &'static str {
        match self {
            Self::Read => "r",
            Self::Write => "w",
        }
    }
}

impl fmt::Display for SasPermission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read => f.write_str("read"),
            Self::Write => f.write_str("write"),
        }
    }
}

/// A capability URL scoped to one container, one permission, and a fixed
/// expiry. Regenerated for every run and never persisted; it must not
/// outlive the operation it was minted for.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TimeLimitedUrl {
    /// Full URL addressing the container, including the signed query.
    pub url: String,
    /// The signed query string alone, reusable for per-blob URLs.
    pub query: String,
    /// Permission the capability grants.
    pub permission: SasPermission,
    /// Instant after which the capability is rejected by the store.
    pub expires_at: DateTime<Utc>,
}

/// One blob listed from a container.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BlobItem {
    /// Blob name; may contain `/` separators describing a directory layout.
    pub name: String,
    /// Content length in bytes when the store reports one.
    pub size: Option<u64>,
}

/// Future returned by store operations.
pub type StoreFuture<'a, T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'a>>;

/// Minimal interface implemented by object-store clients.
///
/// The orchestrator only ever needs container-scoped primitives: the staging
/// layer builds everything else (glob expansion, directory mirroring, task
/// resource references) on top of these.
pub trait BlobStore {
    /// Provider specific error type returned by the store.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Creates a container. A name collision is an error, not success.
    fn create_container<'a>(&'a self, name: &'a str) -> StoreFuture<'a, (), Self::Error>;

    /// Deletes a container. Idempotent: deleting an absent container
    /// succeeds.
    fn delete_container<'a>(&'a self, name: &'a str) -> StoreFuture<'a, (), Self::Error>;

    /// Uploads `body` as a blob named `name` inside `container`.
    fn put_blob<'a>(
        &'a self,
        container: &'a str,
        name: &'a str,
        body: Vec<u8>,
    ) -> StoreFuture<'a, (), Self::Error>;

    /// Downloads the full contents of one blob.
    fn get_blob<'a>(
        &'a self,
        container: &'a str,
        name: &'a str,
    ) -> StoreFuture<'a, Vec<u8>, Self::Error>;

    /// Lists every blob in a container.
    fn list_blobs<'a>(&'a self, container: &'a str) -> StoreFuture<'a, Vec<BlobItem>, Self::Error>;

    /// Mints a [`TimeLimitedUrl`] for the container with the requested
    /// permission, valid for `ttl` from now.
    fn container_url<'a>(
        &'a self,
        container: &'a str,
        permission: SasPermission,
        ttl: Duration,
    ) -> StoreFuture<'a, TimeLimitedUrl, Self::Error>;

    /// Composes a URL addressing one blob using an existing container
    /// capability. Purely syntactic; performs no I/O.
    fn blob_url(&self, container: &str, name: &str, capability: &TimeLimitedUrl) -> String;
}

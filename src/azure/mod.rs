//! Azure implementations of the storage and compute seams.
//!
//! Both clients speak the plain REST surface of their service over
//! [`reqwest`] with SharedKey request signing; nothing provider-specific
//! leaks past the [`BlobStore`](crate::store::BlobStore) and
//! [`ComputeBackend`](crate::compute::ComputeBackend) traits.

mod auth;
mod batch;
mod blob;
mod error;

pub use batch::{AzureBatchClient, BATCH_API_VERSION};
pub use blob::{AzureBlobStore, STORAGE_API_VERSION};
pub use error::AzureError;

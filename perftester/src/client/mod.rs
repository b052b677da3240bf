//! The storage capability consumed by the runner, and its backends.
//!
//! A [`Client`] is bound to one endpoint. The runner only ever calls [`Client::upload`],
//! [`Client::download`] and [`Client::delete`] in timed sections; [`Client::list`] and
//! [`Client::resolve_address`] are diagnostic.

use std::collections::BTreeSet;
use std::fmt::Debug;

use bytes::Bytes;
use futures_util::TryStreamExt;
use thiserror::Error;

use crate::payload::PayloadStream;

mod in_memory;
mod local_fs;
mod s3;

pub use in_memory::InMemoryClient;
pub use local_fs::LocalFsClient;
pub use s3::{S3Client, S3ClientConfig};

/// A type-erased [`Client`] instance.
pub type BoxedClient = Box<dyn Client>;

/// Result type for client operations.
pub type ClientResult<T> = Result<T, ClientError>;

/// Storage operations required to benchmark an endpoint.
#[async_trait::async_trait]
pub trait Client: Debug + Send + Sync + 'static {
    /// The backend name, used for diagnostics.
    fn name(&self) -> &'static str;

    /// Lists the objects below `prefix`.
    ///
    /// A non-empty prefix is treated as a directory. Without `recursive`, nested keys are collapsed
    /// into a single entry with [`ListEntry::is_prefix`] set.
    async fn list(&self, prefix: &str, recursive: bool) -> ClientResult<Vec<ListEntry>>;

    /// Stores the stream under the given name.
    async fn upload(&self, name: &str, stream: PayloadStream) -> ClientResult<()>;

    /// Opens the object with the given name for reading.
    ///
    /// The caller must [`close`](ObjectReader::close) the reader once done.
    async fn download(&self, name: &str) -> ClientResult<Box<dyn ObjectReader>>;

    /// Deletes the object with the given name.
    async fn delete(&self, name: &str) -> ClientResult<()>;

    /// Returns the network address the client talks to.
    async fn resolve_address(&self) -> ClientResult<String>;

    /// Releases all resources held by the client.
    async fn close(&self) -> ClientResult<()>;
}

/// A streamed object being downloaded.
#[async_trait::async_trait]
pub trait ObjectReader: Send {
    /// Returns the next chunk of the object, or `None` at the end.
    async fn next_chunk(&mut self) -> ClientResult<Option<Bytes>>;

    /// Closes the reader. Reading after closing fails with [`ClientError::Closed`].
    async fn close(&mut self) -> ClientResult<()>;
}

/// An [`ObjectReader`] over a [`PayloadStream`] that needs no explicit teardown.
pub struct StreamObjectReader {
    stream: Option<PayloadStream>,
}

impl StreamObjectReader {
    /// Wraps the given stream.
    pub fn new(stream: PayloadStream) -> Self {
        Self {
            stream: Some(stream),
        }
    }
}

impl std::fmt::Debug for StreamObjectReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamObjectReader")
            .field("closed", &self.stream.is_none())
            .finish()
    }
}

#[async_trait::async_trait]
impl ObjectReader for StreamObjectReader {
    async fn next_chunk(&mut self) -> ClientResult<Option<Bytes>> {
        let stream = self.stream.as_mut().ok_or(ClientError::Closed)?;
        Ok(stream.try_next().await?)
    }

    async fn close(&mut self) -> ClientResult<()> {
        self.stream = None;
        Ok(())
    }
}

/// An entry returned by [`Client::list`].
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct ListEntry {
    /// The full key of the object or prefix.
    pub key: String,
    /// Whether this entry stands for a group of nested keys.
    pub is_prefix: bool,
}

/// Errors returned by storage clients.
#[derive(Debug, Error)]
pub enum ClientError {
    /// IO errors related to payload streaming or file operations.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The requested object does not exist.
    #[error("object {name:?} not found")]
    NotFound { name: String },

    /// Errors returned by the S3 SDK, either transport errors or errors returned by the service.
    #[error("{context}")]
    S3 {
        context: String,
        #[source]
        cause: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The backend does not support the requested capability.
    #[error("{operation} is not supported by the {backend} backend")]
    Unsupported {
        backend: &'static str,
        operation: &'static str,
    },

    /// The client configuration is incomplete or malformed.
    #[error("invalid client configuration: {0}")]
    InvalidConfig(String),

    /// The client or reader has already been closed.
    #[error("client has been closed")]
    Closed,

    /// A failure injected for testing.
    #[error("{0}")]
    Injected(String),
}

/// Normalizes a listing prefix so that it names a directory.
pub(crate) fn directory_prefix(prefix: &str) -> String {
    let mut prefix = prefix.to_owned();
    if !prefix.is_empty() && !prefix.ends_with('/') {
        prefix.push('/');
    }
    prefix
}

/// Lists `keys` below `prefix` the way a flat object namespace would.
pub(crate) fn list_keys<'a>(
    keys: impl IntoIterator<Item = &'a str>,
    prefix: &str,
    recursive: bool,
) -> Vec<ListEntry> {
    let prefix = directory_prefix(prefix);
    let mut entries = BTreeSet::new();

    for key in keys {
        let Some(rest) = key.strip_prefix(prefix.as_str()) else {
            continue;
        };

        match rest.split_once('/') {
            Some((dir, _)) if !recursive => {
                entries.insert(ListEntry {
                    key: format!("{prefix}{dir}/"),
                    is_prefix: true,
                });
            }
            _ => {
                entries.insert(ListEntry {
                    key: key.to_owned(),
                    is_prefix: false,
                });
            }
        }
    }

    entries.into_iter().collect()
}

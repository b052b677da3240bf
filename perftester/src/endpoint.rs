//! A configured storage target and the object names used on it.

use crate::client::{BoxedClient, ClientResult};
use crate::datamodel::Id;

/// A storage target benchmarked by the runner.
#[derive(Debug)]
pub struct Endpoint {
    /// Identifier shown as the column header in reports.
    pub id: Id,
    /// Optional directory all objects are placed in.
    pub prefix: Option<String>,
    /// The client bound to this endpoint.
    pub client: BoxedClient,
}

impl Endpoint {
    /// Creates an endpoint without a path prefix.
    pub fn new(id: impl Into<Id>, client: BoxedClient) -> Self {
        Self {
            id: id.into(),
            prefix: None,
            client,
        }
    }

    /// Places all objects of this endpoint below `prefix`.
    ///
    /// Leading, trailing and repeated slashes are dropped.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        let segments: Vec<_> = prefix.split('/').filter(|s| !s.is_empty()).collect();
        self.prefix = (!segments.is_empty()).then(|| segments.join("/"));
        self
    }

    /// Returns the object name used by worker `index` of the given file test.
    ///
    /// The worker index is appended to the file test identifier without a separator.
    pub fn object_path(&self, file_test: &Id, index: usize) -> String {
        match &self.prefix {
            Some(prefix) => format!("{prefix}/{file_test}{index}"),
            None => format!("{file_test}{index}"),
        }
    }

    /// Closes the underlying client.
    pub async fn close(&self) -> ClientResult<()> {
        self.client.close().await
    }
}

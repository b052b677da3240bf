//! In-memory backend.
//!
//! This provides a [`Client`] backed by a `HashMap`, removing the need for real storage in tests
//! and dry runs. The client is [`Clone`] so tests can hold a handle for direct inspection while the
//! endpoint owns a boxed copy. Failures and latency can be injected to exercise error paths.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures_util::{StreamExt, TryStreamExt};

use super::{Client, ClientError, ClientResult, ListEntry, ObjectReader, StreamObjectReader};
use crate::datamodel::Operation;
use crate::payload::PayloadStream;

#[derive(Debug, Default)]
struct State {
    objects: HashMap<String, Bytes>,
    faults: HashMap<Operation, String>,
    close_fault: Option<String>,
    latency: Duration,
    read_latency: Duration,
    readers_closed: usize,
    closed: bool,
}

/// A [`Client`] storing objects in process memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryClient {
    state: Arc<Mutex<State>>,
}

impl InMemoryClient {
    /// Creates an empty client.
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes every call of the given operation fail with `message`.
    pub fn fail(&self, operation: Operation, message: impl Into<String>) {
        self.state().faults.insert(operation, message.into());
    }

    /// Makes closing download readers fail with `message`.
    pub fn fail_reader_close(&self, message: impl Into<String>) {
        self.state().close_fault = Some(message.into());
    }

    /// Delays every upload, download and delete by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.state().latency = latency;
    }

    /// Delays every chunk returned by download readers by `latency`.
    pub fn set_read_latency(&self, latency: Duration) {
        self.state().read_latency = latency;
    }

    /// Returns how many download readers have been closed.
    pub fn readers_closed(&self) -> usize {
        self.state().readers_closed
    }

    /// Flips the first byte of a stored object so that it no longer verifies.
    pub fn corrupt(&self, name: &str) {
        if let Some(bytes) = self.state().objects.get_mut(name) {
            let mut corrupted = BytesMut::from(&bytes[..]);
            if let Some(first) = corrupted.first_mut() {
                *first = !*first;
            } else {
                corrupted.extend_from_slice(b"x");
            }
            *bytes = corrupted.freeze();
        }
    }

    /// Returns a clone of the stored bytes, if present.
    pub fn get_stored(&self, name: &str) -> Option<Bytes> {
        self.state().objects.get(name).cloned()
    }

    /// Returns `true` if an object with the given name is stored.
    pub fn contains(&self, name: &str) -> bool {
        self.state().objects.contains_key(name)
    }

    /// Returns `true` if no objects are stored.
    pub fn is_empty(&self) -> bool {
        self.state().objects.is_empty()
    }

    /// Returns `true` once [`Client::close`] was called.
    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    /// Checks for closure and injected faults, then waits for the configured latency.
    async fn enter(&self, operation: Operation) -> ClientResult<()> {
        let latency = {
            let state = self.state();
            if state.closed {
                return Err(ClientError::Closed);
            }
            if let Some(message) = state.faults.get(&operation) {
                return Err(ClientError::Injected(message.clone()));
            }
            state.latency
        };

        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Client for InMemoryClient {
    fn name(&self) -> &'static str {
        "in-memory"
    }

    async fn list(&self, prefix: &str, recursive: bool) -> ClientResult<Vec<ListEntry>> {
        let state = self.state();
        if state.closed {
            return Err(ClientError::Closed);
        }
        Ok(super::list_keys(
            state.objects.keys().map(String::as_str),
            prefix,
            recursive,
        ))
    }

    async fn upload(&self, name: &str, stream: PayloadStream) -> ClientResult<()> {
        self.enter(Operation::Upload).await?;
        let bytes: BytesMut = stream.try_collect().await?;
        self.state()
            .objects
            .insert(name.to_owned(), bytes.freeze());
        Ok(())
    }

    async fn download(&self, name: &str) -> ClientResult<Box<dyn ObjectReader>> {
        self.enter(Operation::Download).await?;
        let (bytes, close_fault, read_latency) = {
            let state = self.state();
            let bytes = state
                .objects
                .get(name)
                .cloned()
                .ok_or_else(|| ClientError::NotFound {
                    name: name.to_owned(),
                })?;
            (bytes, state.close_fault.clone(), state.read_latency)
        };

        let stream = futures_util::stream::once(async move { Ok(bytes) }).boxed();
        Ok(Box::new(InMemoryReader {
            client: self.clone(),
            inner: StreamObjectReader::new(stream),
            close_fault,
            read_latency,
        }))
    }

    async fn delete(&self, name: &str) -> ClientResult<()> {
        self.enter(Operation::Delete).await?;
        self.state()
            .objects
            .remove(name)
            .map(drop)
            .ok_or_else(|| ClientError::NotFound {
                name: name.to_owned(),
            })
    }

    async fn resolve_address(&self) -> ClientResult<String> {
        Ok("memory".to_owned())
    }

    async fn close(&self) -> ClientResult<()> {
        self.state().closed = true;
        Ok(())
    }
}

#[derive(Debug)]
struct InMemoryReader {
    client: InMemoryClient,
    inner: StreamObjectReader,
    close_fault: Option<String>,
    read_latency: Duration,
}

#[async_trait::async_trait]
impl ObjectReader for InMemoryReader {
    async fn next_chunk(&mut self) -> ClientResult<Option<Bytes>> {
        if !self.read_latency.is_zero() {
            tokio::time::sleep(self.read_latency).await;
        }
        self.inner.next_chunk().await
    }

    async fn close(&mut self) -> ClientResult<()> {
        self.inner.close().await?;
        self.client.state().readers_closed += 1;
        match self.close_fault.take() {
            Some(message) => Err(ClientError::Injected(message)),
            None => Ok(()),
        }
    }
}

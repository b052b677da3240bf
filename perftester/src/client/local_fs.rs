use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::pin::pin;

use futures_util::StreamExt;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_util::io::{ReaderStream, StreamReader};

use super::{Client, ClientError, ClientResult, ListEntry, ObjectReader, StreamObjectReader};
use crate::payload::PayloadStream;

/// A [`Client`] storing objects as files below a root directory.
#[derive(Debug)]
pub struct LocalFsClient {
    path: PathBuf,
}

impl LocalFsClient {
    /// Creates a client rooted at `path`. The directory is created on first upload.
    pub fn new(path: &Path) -> Self {
        Self { path: path.into() }
    }

    fn not_found(name: &str) -> impl FnOnce(std::io::Error) -> ClientError + '_ {
        move |err| match err.kind() {
            ErrorKind::NotFound => ClientError::NotFound {
                name: name.to_owned(),
            },
            _ => ClientError::Io(err),
        }
    }

    /// Recursively collects all file keys, using `/` as separator.
    async fn walk(&self) -> ClientResult<Vec<String>> {
        let mut keys = Vec::new();
        let mut pending = vec![self.path.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            };

            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                } else if let Ok(relative) = path.strip_prefix(&self.path) {
                    let key: Vec<_> = relative
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy())
                        .collect();
                    keys.push(key.join("/"));
                }
            }
        }

        Ok(keys)
    }
}

#[async_trait::async_trait]
impl Client for LocalFsClient {
    fn name(&self) -> &'static str {
        "local-fs"
    }

    async fn list(&self, prefix: &str, recursive: bool) -> ClientResult<Vec<ListEntry>> {
        let keys = self.walk().await?;
        Ok(super::list_keys(
            keys.iter().map(String::as_str),
            prefix,
            recursive,
        ))
    }

    #[tracing::instrument(level = "trace", skip(self, stream))]
    async fn upload(&self, name: &str, stream: PayloadStream) -> ClientResult<()> {
        let path = self.path.join(name);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .await?;

        let mut reader = pin!(StreamReader::new(stream));
        let mut writer = BufWriter::new(file);

        tokio::io::copy(&mut reader, &mut writer).await?;
        writer.flush().await?;
        let file = writer.into_inner();
        file.sync_data().await?;
        drop(file);

        Ok(())
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn download(&self, name: &str) -> ClientResult<Box<dyn ObjectReader>> {
        let path = self.path.join(name);
        let file = OpenOptions::new()
            .read(true)
            .open(path)
            .await
            .map_err(Self::not_found(name))?;

        let stream = ReaderStream::new(file).boxed();
        Ok(Box::new(StreamObjectReader::new(stream)))
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn delete(&self, name: &str) -> ClientResult<()> {
        let path = self.path.join(name);
        tokio::fs::remove_file(path)
            .await
            .map_err(Self::not_found(name))
    }

    async fn resolve_address(&self) -> ClientResult<String> {
        Err(ClientError::Unsupported {
            backend: self.name(),
            operation: "resolve_address",
        })
    }

    async fn close(&self) -> ClientResult<()> {
        Ok(())
    }
}

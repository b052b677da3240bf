use std::fmt;

use aws_config::BehaviorVersion;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use bytes::{Bytes, BytesMut};
use futures_util::TryStreamExt;
use secrecy::{ExposeSecret, SecretString};

use super::{Client, ClientError, ClientResult, ListEntry, ObjectReader};
use crate::payload::PayloadStream;

/// Connection settings for an [`S3Client`].
#[derive(Debug, Default)]
pub struct S3ClientConfig {
    /// Custom endpoint URL, e.g. `http://localhost:9000` for MinIO.
    pub endpoint: Option<String>,
    /// The bucket all objects are stored in. Must exist.
    pub bucket: String,
    /// The bucket region.
    pub region: String,
    /// Static access key. Falls back to the default AWS credential chain if unset.
    pub access_key: Option<String>,
    /// Static secret key.
    pub secret_key: Option<SecretString>,
    /// Addresses the bucket as part of the path instead of the host name.
    pub path_style: bool,
}

/// A [`Client`] for Amazon S3 and S3-compatible services.
pub struct S3Client {
    client: aws_sdk_s3::Client,
    bucket: String,
    host: String,
}

impl S3Client {
    /// Creates a client bound to the configured bucket.
    pub async fn new(config: S3ClientConfig) -> ClientResult<Self> {
        if config.bucket.is_empty() {
            return Err(ClientError::InvalidConfig("bucket is required".into()));
        }
        if config.region.is_empty() {
            return Err(ClientError::InvalidConfig("region is required".into()));
        }

        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()));
        if let Some(endpoint) = &config.endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        match (&config.access_key, &config.secret_key) {
            (Some(access_key), Some(secret_key)) => {
                loader = loader.credentials_provider(Credentials::new(
                    access_key,
                    secret_key.expose_secret(),
                    None,
                    None,
                    "perftester",
                ));
            }
            (None, None) => (),
            _ => {
                return Err(ClientError::InvalidConfig(
                    "access key and secret key must be set together".into(),
                ));
            }
        }

        let sdk_config = loader.load().await;
        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(config.path_style)
            .build();

        let host = match &config.endpoint {
            Some(endpoint) => host_port(endpoint),
            None => format!("s3.{}.amazonaws.com:443", config.region),
        };

        Ok(Self {
            client: aws_sdk_s3::Client::from_conf(s3_config),
            bucket: config.bucket,
            host,
        })
    }
}

impl fmt::Debug for S3Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Client")
            .field("bucket", &self.bucket)
            .field("host", &self.host)
            .finish_non_exhaustive()
    }
}

/// Wraps an SDK error with the given context, keeping the full error chain in the message.
fn s3_error<E: std::error::Error>(context: String) -> impl FnOnce(E) -> ClientError {
    move |err| ClientError::S3 {
        context,
        cause: DisplayErrorContext(err).to_string().into(),
    }
}

/// Extracts `host:port` from an endpoint URL, defaulting the port from the scheme.
fn host_port(endpoint: &str) -> String {
    let (scheme, rest) = endpoint.split_once("://").unwrap_or(("https", endpoint));
    let authority = rest.split('/').next().unwrap_or(rest);
    let authority = authority.rsplit('@').next().unwrap_or(authority);

    let has_port = match authority.rsplit_once(':') {
        Some((_, port)) => port.parse::<u16>().is_ok(),
        None => false,
    };
    if has_port {
        authority.to_owned()
    } else if scheme.eq_ignore_ascii_case("http") {
        format!("{authority}:80")
    } else {
        format!("{authority}:443")
    }
}

#[async_trait::async_trait]
impl Client for S3Client {
    fn name(&self) -> &'static str {
        "s3"
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn list(&self, prefix: &str, recursive: bool) -> ClientResult<Vec<ListEntry>> {
        let prefix = super::directory_prefix(prefix);
        let mut entries = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&prefix);
            if !recursive {
                request = request.delimiter("/");
            }
            if let Some(token) = &continuation_token {
                request = request.continuation_token(token);
            }

            let response = request
                .send()
                .await
                .map_err(s3_error(format!("failed to list prefix {prefix:?}")))?;

            for common in response.common_prefixes.unwrap_or_default() {
                if let Some(key) = common.prefix {
                    entries.push(ListEntry {
                        key,
                        is_prefix: true,
                    });
                }
            }
            for object in response.contents.unwrap_or_default() {
                if let Some(key) = object.key {
                    entries.push(ListEntry {
                        key,
                        is_prefix: false,
                    });
                }
            }

            if response.is_truncated == Some(true) {
                continuation_token = response.next_continuation_token;
            } else {
                break;
            }
        }

        entries.sort();
        Ok(entries)
    }

    #[tracing::instrument(level = "trace", skip(self, stream))]
    async fn upload(&self, name: &str, stream: PayloadStream) -> ClientResult<()> {
        // The SDK needs a known content length, so the payload is buffered first.
        let body: BytesMut = stream.try_collect().await?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(name)
            .body(ByteStream::from(body.freeze()))
            .send()
            .await
            .map_err(s3_error(format!("failed to upload file {name:?}")))?;

        Ok(())
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn download(&self, name: &str) -> ClientResult<Box<dyn ObjectReader>> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(name)
            .send()
            .await;

        match response {
            Ok(output) => Ok(Box::new(S3Reader {
                name: name.to_owned(),
                body: Some(output.body),
            })),
            Err(err) if err.as_service_error().is_some_and(|e| e.is_no_such_key()) => {
                Err(ClientError::NotFound {
                    name: name.to_owned(),
                })
            }
            Err(err) => Err(s3_error(format!("failed to download file {name:?}"))(err)),
        }
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn delete(&self, name: &str) -> ClientResult<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(name)
            .send()
            .await
            .map_err(s3_error(format!("failed to delete file {name:?}")))?;

        Ok(())
    }

    async fn resolve_address(&self) -> ClientResult<String> {
        let mut addrs = tokio::net::lookup_host(self.host.as_str()).await?;
        addrs
            .next()
            .map(|addr| addr.ip().to_string())
            .ok_or_else(|| {
                ClientError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("no address found for {}", self.host),
                ))
            })
    }

    async fn close(&self) -> ClientResult<()> {
        Ok(())
    }
}

struct S3Reader {
    name: String,
    body: Option<ByteStream>,
}

#[async_trait::async_trait]
impl ObjectReader for S3Reader {
    async fn next_chunk(&mut self) -> ClientResult<Option<Bytes>> {
        let body = self.body.as_mut().ok_or(ClientError::Closed)?;
        match body.next().await {
            Some(Ok(chunk)) => Ok(Some(chunk)),
            Some(Err(err)) => Err(ClientError::S3 {
                context: format!("failed to read file {:?}", self.name),
                cause: Box::new(err),
            }),
            None => Ok(None),
        }
    }

    async fn close(&mut self) -> ClientResult<()> {
        self.body = None;
        Ok(())
    }
}

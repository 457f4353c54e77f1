//! # Upload Transport
//!
//! [`Uploader`] is the seam between the dispatch worker and the network. The
//! worker never sees HTTP: it hands over a ready body and gets back
//! `Ok(())` (acknowledged) or an [`UploadError`].
//!
//! [`HttpUploader`] is the production implementation: one `POST` per endpoint
//! with `Content-Type: application/json` plus the endpoint's own headers.
//! Any 2xx counts as acknowledgement.

use std::future::Future;
use std::time::Duration;

use reqwest::header::CONTENT_TYPE;

use crate::config::Endpoint;
use crate::error::{Error, Result, UploadError};

/// User-Agent sent with every upload.
const USER_AGENT: &str = concat!("fixrelay/", env!("CARGO_PKG_VERSION"));

/// Delivers one encoded batch to one endpoint.
pub trait Uploader: Send + Sync + 'static {
    fn upload(
        &self,
        endpoint: &Endpoint,
        body: &[u8],
    ) -> impl Future<Output = std::result::Result<(), UploadError>> + Send;
}

/// reqwest-backed uploader.
#[derive(Clone)]
pub struct HttpUploader {
    client: reqwest::Client,
}

impl HttpUploader {
    /// Creates an uploader whose requests give up after `timeout`.
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| Error::ConfigurationInvalid(format!("failed to create HTTP client: {e}")))?;

        Ok(Self { client })
    }
}

impl Uploader for HttpUploader {
    fn upload(
        &self,
        endpoint: &Endpoint,
        body: &[u8],
    ) -> impl Future<Output = std::result::Result<(), UploadError>> + Send {
        let mut request = self
            .client
            .post(&endpoint.url)
            .header(CONTENT_TYPE, "application/json")
            .body(body.to_vec());
        for (name, value) in &endpoint.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        async move {
            let response = request.send().await.map_err(classify_transport_error)?;
            let status = response.status();
            if status.is_success() {
                Ok(())
            } else {
                Err(UploadError::EndpointRejected {
                    status: status.as_u16(),
                })
            }
        }
    }
}

fn classify_transport_error(err: reqwest::Error) -> UploadError {
    if err.is_timeout() {
        UploadError::Timeout
    } else if err.is_builder() {
        UploadError::Malformed(err.to_string())
    } else {
        UploadError::NetworkUnavailable(err.to_string())
    }
}

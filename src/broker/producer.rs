//! Target producers
//!
//! A producer carries a request to one target. Raw producers move opaque
//! bytes; structured producers move framed wire messages. The HTTP
//! implementations honor the configured connection timeout at client build
//! time and the read timeout per call, so caller-supplied timeout
//! parameters take effect.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use log::debug;

use crate::{
    core::error::{ServiceError, ServiceResult},
    wire::{Encoding, WireMessage},
};

/// Arbitrary bytes in, arbitrary bytes or nothing out.
#[async_trait]
pub trait RawProducer: Send + Sync {
    async fn produce(
        &self,
        input: &[u8],
        read_timeout: Option<Duration>,
    ) -> ServiceResult<Option<Bytes>>;
}

/// Framed wire message in, framed wire message out.
#[async_trait]
pub trait MessageProducer: Send + Sync {
    async fn produce(
        &self,
        request: &WireMessage,
        encoding: Encoding,
        read_timeout: Option<Duration>,
    ) -> ServiceResult<WireMessage>;
}

fn build_client(
    connect_timeout: Option<Duration>,
    read_timeout: Option<Duration>,
) -> ServiceResult<reqwest::Client> {
    let mut builder = reqwest::Client::builder();
    if let Some(timeout) = connect_timeout {
        builder = builder.connect_timeout(timeout);
    }
    if let Some(timeout) = read_timeout {
        builder = builder.timeout(timeout);
    }
    builder
        .build()
        .map_err(|e| ServiceError::Configuration(format!("cannot build http client: {e}")))
}

pub struct HttpRawProducer {
    client: reqwest::Client,
    url: String,
}

impl HttpRawProducer {
    pub fn new(
        url: impl Into<String>,
        connect_timeout: Option<Duration>,
        read_timeout: Option<Duration>,
    ) -> ServiceResult<Self> {
        Ok(Self {
            client: build_client(connect_timeout, read_timeout)?,
            url: url.into(),
        })
    }
}

#[async_trait]
impl RawProducer for HttpRawProducer {
    async fn produce(
        &self,
        input: &[u8],
        read_timeout: Option<Duration>,
    ) -> ServiceResult<Option<Bytes>> {
        let mut request = self.client.post(&self.url).body(input.to_vec());
        if let Some(timeout) = read_timeout {
            request = request.timeout(timeout);
        }
        let response = request
            .send()
            .await
            .map_err(|e| ServiceError::Remote(format!("{}: {e}", self.url)))?;
        let status = response.status();
        if !status.is_success() {
            return Err(ServiceError::Remote(format!(
                "{} answered {status}",
                self.url
            )));
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| ServiceError::Remote(format!("{}: {e}", self.url)))?;
        debug!("raw target {} answered {} byte(s)", self.url, body.len());
        if body.is_empty() {
            Ok(None)
        } else {
            Ok(Some(body))
        }
    }
}

pub struct HttpMessageProducer {
    client: reqwest::Client,
    url: String,
}

impl HttpMessageProducer {
    pub fn new(
        url: impl Into<String>,
        connect_timeout: Option<Duration>,
        read_timeout: Option<Duration>,
    ) -> ServiceResult<Self> {
        Ok(Self {
            client: build_client(connect_timeout, read_timeout)?,
            url: url.into(),
        })
    }
}

#[async_trait]
impl MessageProducer for HttpMessageProducer {
    async fn produce(
        &self,
        request: &WireMessage,
        encoding: Encoding,
        read_timeout: Option<Duration>,
    ) -> ServiceResult<WireMessage> {
        let body = request.to_text(encoding)?;
        let mut http_request = self.client.post(&self.url).body(body);
        if let Some(timeout) = read_timeout {
            http_request = http_request.timeout(timeout);
        }
        let response = http_request
            .send()
            .await
            .map_err(|e| ServiceError::Remote(format!("{}: {e}", self.url)))?;
        let status = response.status();
        if !status.is_success() {
            return Err(ServiceError::Remote(format!(
                "{} answered {status}",
                self.url
            )));
        }
        let text = response
            .text()
            .await
            .map_err(|e| ServiceError::Remote(format!("{}: {e}", self.url)))?;
        let (_, message) = WireMessage::from_text(&text)?;
        Ok(message)
    }
}

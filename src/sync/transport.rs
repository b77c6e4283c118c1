//! How the client reaches the server.
//!
//! [`HttpTransport`] speaks the JSON protocol over reqwest. Test builds also
//! get an in-process transport that calls the reconciliation service
//! directly, so several simulated devices can share one server without
//! sockets.

use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use super::protocol::{
    FullRequest, FullResponse, PullQuery, PullResponse, PushRequest, PushResponse,
};
use super::SyncError;

pub trait SyncTransport: Send + Sync + 'static {
    fn push(
        &self,
        request: &PushRequest,
    ) -> impl Future<Output = Result<PushResponse, SyncError>> + Send;

    fn pull(&self, query: &PullQuery)
        -> impl Future<Output = Result<PullResponse, SyncError>> + Send;

    fn full(
        &self,
        request: &FullRequest,
    ) -> impl Future<Output = Result<FullResponse, SyncError>> + Send;
}

impl<T: SyncTransport> SyncTransport for Arc<T> {
    fn push(
        &self,
        request: &PushRequest,
    ) -> impl Future<Output = Result<PushResponse, SyncError>> + Send {
        self.as_ref().push(request)
    }

    fn pull(
        &self,
        query: &PullQuery,
    ) -> impl Future<Output = Result<PullResponse, SyncError>> + Send {
        self.as_ref().pull(query)
    }

    fn full(
        &self,
        request: &FullRequest,
    ) -> impl Future<Output = Result<FullResponse, SyncError>> + Send {
        self.as_ref().full(request)
    }
}

/// Bounds one request. An elapsed limit counts as the network being down,
/// and whatever was partially received is dropped with the future.
pub(crate) async fn with_timeout<T>(
    limit: Duration,
    request: impl Future<Output = Result<T, SyncError>>,
) -> Result<T, SyncError> {
    tokio::time::timeout(limit, request).await.map_err(|_| {
        SyncError::NetworkUnavailable(format!("request timed out after {:?}", limit))
    })?
}

/// JSON over HTTP with a bearer API key.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    base_url: String,
    api_key: String,
}

impl HttpTransport {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, SyncError> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| SyncError::NetworkUnavailable(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, SyncError> {
        let response = request
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(classify)?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(SyncError::AuthExpired);
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(SyncError::ServerError {
                status: status.as_u16(),
                message,
            });
        }

        // Read the whole body before decoding; a cut-off page is discarded.
        let bytes = response.bytes().await.map_err(classify)?;
        serde_json::from_slice(&bytes).map_err(|e| SyncError::Protocol(e.to_string()))
    }
}

fn classify(err: reqwest::Error) -> SyncError {
    if err.is_decode() {
        SyncError::Protocol(err.to_string())
    } else {
        SyncError::NetworkUnavailable(err.to_string())
    }
}

impl SyncTransport for HttpTransport {
    async fn push(&self, request: &PushRequest) -> Result<PushResponse, SyncError> {
        self.send(self.client.post(self.url("/sync/push")).json(request))
            .await
    }

    async fn pull(&self, query: &PullQuery) -> Result<PullResponse, SyncError> {
        let url = format!("{}?{}", self.url("/sync/pull"), query.to_query_string());
        self.send(self.client.get(url)).await
    }

    async fn full(&self, request: &FullRequest) -> Result<FullResponse, SyncError> {
        self.send(self.client.post(self.url("/sync/full")).json(request))
            .await
    }
}

#[cfg(test)]
pub(crate) use local::LocalTransport;

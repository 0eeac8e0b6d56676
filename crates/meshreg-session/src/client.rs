//! RPC channel to the meta tier.
//!
//! [`MetaChannel`] is the seam the membership cache talks through; the
//! HTTP implementation speaks JSON to the meta router. Transport faults
//! come back as `RegistryError::Transport`, logical failures inside the
//! returned envelope.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::Method;
use http_body_util::{BodyExt, Full};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use meshreg_core::rpc::{
    FetchProvideDataRequest, GenericResponse, HeartbeatRequest, HeartbeatResponse, LeaderInfo,
};
use meshreg_core::{ProvideData, RegistryError, RegistryResult};

#[async_trait]
pub trait MetaChannel: Send + Sync {
    /// Send a heartbeat to the meta node at `meta`.
    async fn renew(
        &self,
        meta: &str,
        request: &HeartbeatRequest,
    ) -> RegistryResult<GenericResponse<HeartbeatResponse>>;

    /// Ask the meta node at `meta` who it believes leads.
    async fn leader(&self, meta: &str) -> RegistryResult<GenericResponse<LeaderInfo>>;

    async fn fetch_provide_data(
        &self,
        meta: &str,
        data_info_id: &str,
    ) -> RegistryResult<GenericResponse<ProvideData>>;
}

/// Why an HTTP exchange failed.
#[derive(Debug)]
pub(crate) enum CallError {
    /// No connection could be established.
    Connect(String),
    /// Connected, but the exchange failed or timed out.
    Exchange(String),
}

impl From<CallError> for RegistryError {
    fn from(e: CallError) -> Self {
        match e {
            CallError::Connect(msg) | CallError::Exchange(msg) => RegistryError::Transport(msg),
        }
    }
}

/// One HTTP/1 request over a fresh connection, bounded by `timeout`.
///
/// Returns the response body of a 2xx answer.
pub(crate) async fn http_call(
    address: &str,
    method: Method,
    path: &str,
    payload: Vec<u8>,
    timeout: Duration,
) -> Result<Bytes, CallError> {
    let uri = format!("http://{address}{path}");
    let exchange = async {
        let stream = tokio::net::TcpStream::connect(address)
            .await
            .map_err(|e| CallError::Connect(format!("{uri}: {e}")))?;
        let io = TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(exchange_err)?;

        // Drive the connection in the background.
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(error = %e, "connection closed with error");
            }
        });

        let request = http::Request::builder()
            .method(method)
            .uri(&uri)
            .header("host", address)
            .header("content-type", "application/json")
            .header("user-agent", "meshreg-session/0.1")
            .body(Full::new(Bytes::from(payload)))
            .map_err(exchange_err)?;

        let response = sender.send_request(request).await.map_err(exchange_err)?;
        if !response.status().is_success() {
            return Err(CallError::Exchange(format!(
                "{uri} returned {}",
                response.status()
            )));
        }
        let body = response.into_body().collect().await.map_err(exchange_err)?;
        Ok(body.to_bytes())
    };

    match tokio::time::timeout(timeout, exchange).await {
        Ok(result) => result,
        Err(_) => {
            debug!(%uri, ?timeout, "call timed out");
            Err(CallError::Exchange(format!("{uri} timed out")))
        }
    }
}

fn exchange_err(e: impl std::fmt::Display) -> CallError {
    CallError::Exchange(e.to_string())
}

/// Serialize `body`, call, and decode the JSON answer.
pub(crate) async fn json_call<B, T>(
    address: &str,
    method: Method,
    path: &str,
    body: Option<&B>,
    timeout: Duration,
) -> RegistryResult<T>
where
    B: Serialize + Sync + ?Sized,
    T: DeserializeOwned,
{
    let payload = match body {
        Some(b) => serde_json::to_vec(b).map_err(transport)?,
        None => Vec::new(),
    };
    let bytes = http_call(address, method, path, payload, timeout).await?;
    serde_json::from_slice(&bytes).map_err(transport)
}

fn transport(e: impl std::fmt::Display) -> RegistryError {
    RegistryError::Transport(e.to_string())
}

/// JSON-over-HTTP/1 channel with a per-call timeout.
pub struct HttpMetaChannel {
    timeout: Duration,
}

impl HttpMetaChannel {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl MetaChannel for HttpMetaChannel {
    async fn renew(
        &self,
        meta: &str,
        request: &HeartbeatRequest,
    ) -> RegistryResult<GenericResponse<HeartbeatResponse>> {
        json_call(meta, Method::POST, "/api/v1/heartbeat", Some(request), self.timeout).await
    }

    async fn leader(&self, meta: &str) -> RegistryResult<GenericResponse<LeaderInfo>> {
        json_call::<(), _>(meta, Method::GET, "/api/v1/leader", None, self.timeout).await
    }

    async fn fetch_provide_data(
        &self,
        meta: &str,
        data_info_id: &str,
    ) -> RegistryResult<GenericResponse<ProvideData>> {
        let request = FetchProvideDataRequest {
            data_info_id: data_info_id.to_string(),
        };
        json_call(meta, Method::POST, "/api/v1/provide-data/fetch", Some(&request), self.timeout).await
    }
}

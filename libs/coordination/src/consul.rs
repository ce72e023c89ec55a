//! Consul HTTP API client with connect retry/backoff.
//!
//! Implements [`CoordinationStore`] over the `/v1/session` and `/v1/kv`
//! endpoints. Blocking watches map onto Consul blocking queries
//! (`?index=&wait=`) and report the `X-Consul-Index` header.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD};
use parking_lot::RwLock;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, trace, warn};

use config::ConsulConfig;

use crate::{
    error::{CoordinationError, CoordinationResult},
    store::{
        CoordinationStore, KvPair, SessionRequest, WatchPayload, WatchTarget, WatchUpdate,
    },
};

/// Base delay for retrying the initial connect.
const CONNECT_RETRY_BASE_DELAY: Duration = Duration::from_secs(1);

/// Upper bound for retry backoff during the initial connect.
const MAX_CONNECT_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Extra time on top of a blocking query's wait before the request is
/// considered timed out.
const BLOCKING_SLACK: Duration = Duration::from_secs(5);

const INDEX_HEADER: &str = "X-Consul-Index";
const TOKEN_HEADER: &str = "X-Consul-Token";

/// Connection state observable by consumers for status reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// The last request reached the agent.
    Connected,
    /// Attempting to connect, or the last request failed at the transport level.
    Reconnecting,
    /// `connect` was never called or failed for good.
    Disconnected,
}

/// Consul agent client.
#[derive(Clone)]
pub struct ConsulClient {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
    request_timeout: Duration,
    connect_retry_max: u32,
    state: Arc<RwLock<ConnectionState>>,
}

impl std::fmt::Debug for ConsulClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsulClient")
            .field("base_url", &self.base_url)
            .field("request_timeout", &self.request_timeout)
            .field("state", &*self.state.read())
            .finish_non_exhaustive()
    }
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct CreateSessionBody<'a> {
    name: &'a str,
    behavior: &'static str,
    #[serde(rename = "TTL")]
    ttl: String,
    lock_delay: String,
    /// empty list: no health checks bound to the session, only the TTL
    checks: Vec<String>,
}

#[derive(Deserialize)]
struct CreateSessionReply {
    #[serde(rename = "ID")]
    id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct WireKv {
    key: String,
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    session: Option<String>,
    #[serde(default)]
    modify_index: u64,
}

impl WireKv {
    fn into_pair(self) -> Result<KvPair, String> {
        let value = match self.value {
            Some(v) => STANDARD
                .decode(v.as_bytes())
                .map_err(|e| format!("invalid base64 value for key '{}': {e}", self.key))?,
            None => Vec::new(),
        };
        Ok(KvPair {
            key: self.key,
            value,
            session: self.session.filter(|s| !s.is_empty()),
            modify_index: self.modify_index,
        })
    }
}

fn decode_entries(body: &[u8]) -> Result<Vec<KvPair>, String> {
    serde_json::from_slice::<Vec<WireKv>>(body)
        .map_err(|e| format!("unexpected kv body: {e}"))?
        .into_iter()
        .map(WireKv::into_pair)
        .collect()
}

/// Build the payload for a watch response. `None` body means the target
/// does not exist.
fn watch_payload(target: &WatchTarget, body: Option<&[u8]>) -> WatchPayload {
    let entries = match body.map(decode_entries).transpose() {
        Ok(entries) => entries.unwrap_or_default(),
        Err(err) => return WatchPayload::Malformed(err),
    };
    match target {
        WatchTarget::Key(key) => match entries.len() {
            0 => WatchPayload::Key(None),
            1 => WatchPayload::Key(entries.into_iter().next()),
            n => WatchPayload::Malformed(format!("expected one entry for key '{key}', got {n}")),
        },
        WatchTarget::Prefix(_) => WatchPayload::Prefix(entries),
    }
}

fn format_secs(d: Duration) -> String {
    // Consul TTLs have second granularity, round up
    let secs = d.as_secs() + u64::from(d.subsec_nanos() > 0);
    format!("{secs}s")
}

fn kv_path(key: &str) -> String {
    format!("kv/{}", key.trim_start_matches('/'))
}

impl ConsulClient {
    /// Create a new client, without connecting yet.
    ///
    /// Call [`connect`] to verify the agent is reachable.
    ///
    /// [`connect`]: ConsulClient::connect
    pub fn new(config: &ConsulConfig) -> CoordinationResult<Self> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(config.insecure_skip_verify)
            .build()
            .map_err(|e| CoordinationError::Config(format!("failed to build http client: {e}")))?;
        if config.insecure_skip_verify {
            warn!("TLS certificate verification disabled for consul client");
        }
        Ok(Self {
            http,
            base_url: config.base_url(),
            token: config.token.clone(),
            request_timeout: config.request_timeout,
            connect_retry_max: config.connect_retry_max,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
        })
    }

    /// Check the agent is reachable and has a raft leader peer set.
    ///
    /// Retries with exponential backoff up to the configured number of times.
    pub async fn connect(&self) -> CoordinationResult<()> {
        if self.connection_state() == ConnectionState::Connected {
            debug!("consul client already connected, skipping connect");
            return Ok(());
        }
        info!(
            url = %self.base_url,
            connect_retry_max = self.connect_retry_max,
            "connecting to consul"
        );
        self.set_state(ConnectionState::Reconnecting);

        let total_attempts = self.connect_retry_max.saturating_add(1);
        let mut attempt = 0;
        loop {
            match self.peers().await {
                Ok(peers) => {
                    self.set_state(ConnectionState::Connected);
                    info!(
                        attempt = attempt + 1,
                        total_attempts,
                        peers = peers.len(),
                        "consul connection established"
                    );
                    return Ok(());
                }
                Err(err) => {
                    let attempt_num = attempt + 1;
                    if attempt_num >= total_attempts {
                        error!(
                            attempts = total_attempts,
                            error = %err,
                            "consul connection failed after all retry attempts"
                        );
                        self.set_state(ConnectionState::Disconnected);
                        return Err(err.context(format!(
                            "consul connection failed after {total_attempts} attempt(s)"
                        )));
                    }

                    let delay = CONNECT_RETRY_BASE_DELAY
                        .saturating_mul(2u32.saturating_pow(attempt))
                        .min(MAX_CONNECT_RETRY_DELAY);
                    warn!(
                        attempt = attempt_num,
                        total_attempts,
                        retry_in_ms = delay.as_millis(),
                        error = %err,
                        "consul connection attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// raft peers known to the agent; an empty set is an error
    async fn peers(&self) -> CoordinationResult<Vec<String>> {
        let resp = self
            .send(self.request(Method::GET, "status/peers"), "status peers")
            .await?;
        let peers: Vec<String> = Self::json(resp, "status peers").await?;
        if peers.is_empty() {
            return Err(CoordinationError::Transport(
                "consul agent reports no raft peers".into(),
            ));
        }
        Ok(peers)
    }

    /// Returns the current connection state.
    pub fn connection_state(&self) -> ConnectionState {
        *self.state.read()
    }

    /// Returns true if the last request reached the agent.
    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.write() = state;
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let req = self
            .http
            .request(method, format!("{}/v1/{path}", self.base_url))
            .timeout(self.request_timeout);
        match &self.token {
            Some(token) => req.header(TOKEN_HEADER, token),
            None => req,
        }
    }

    /// Send a request, mapping transport failures and non-2xx statuses (other
    /// than 404, which callers interpret) to typed errors.
    async fn send(&self, req: RequestBuilder, what: &str) -> CoordinationResult<Response> {
        let resp = match req.send().await {
            Ok(resp) => resp,
            Err(err) => {
                if self.is_connected() {
                    self.set_state(ConnectionState::Reconnecting);
                }
                return Err(if err.is_timeout() {
                    CoordinationError::Timeout(format!("{what} timed out: {err}"))
                } else {
                    CoordinationError::Transport(format!("{what} failed: {err}"))
                });
            }
        };
        if self.connection_state() == ConnectionState::Reconnecting {
            self.set_state(ConnectionState::Connected);
        }

        let status = resp.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        trace!(%status, %body, what, "consul request rejected");
        if body.contains("invalid session") || body.contains("Session id") {
            return Err(CoordinationError::SessionNotFound(format!(
                "{what}: {}",
                body.trim()
            )));
        }
        Err(CoordinationError::Transport(format!(
            "{what} returned {status}: {}",
            body.trim()
        )))
    }

    async fn bytes(resp: Response, what: &str) -> CoordinationResult<Vec<u8>> {
        resp.bytes().await.map(|b| b.to_vec()).map_err(|e| {
            if e.is_timeout() {
                CoordinationError::Timeout(format!("{what} body timed out: {e}"))
            } else {
                CoordinationError::Transport(format!("{what} body read failed: {e}"))
            }
        })
    }

    async fn json<T: serde::de::DeserializeOwned>(
        resp: Response,
        what: &str,
    ) -> CoordinationResult<T> {
        let body = Self::bytes(resp, what).await?;
        serde_json::from_slice(&body)
            .map_err(|e| CoordinationError::Codec(format!("{what}: unexpected body: {e}")))
    }

    async fn put_bool(&self, req: RequestBuilder, what: &str) -> CoordinationResult<bool> {
        let resp = self.send(req, what).await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        Self::json(resp, what).await
    }
}

#[async_trait]
impl CoordinationStore for ConsulClient {
    async fn create_session(&self, req: &SessionRequest) -> CoordinationResult<String> {
        let body = CreateSessionBody {
            name: &req.name,
            behavior: req.behavior.as_str(),
            ttl: format_secs(req.ttl),
            lock_delay: format!("{}ms", req.lock_delay.as_millis()),
            checks: Vec::new(),
        };
        let resp = self
            .send(
                self.request(Method::PUT, "session/create").json(&body),
                "session create",
            )
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(CoordinationError::Transport(
                "session create endpoint not found".into(),
            ));
        }
        let reply: CreateSessionReply = Self::json(resp, "session create").await?;
        debug!(session = %reply.id, name = %req.name, "consul session created");
        Ok(reply.id)
    }

    async fn destroy_session(&self, id: &str) -> CoordinationResult<()> {
        self.send(
            self.request(Method::PUT, &format!("session/destroy/{id}")),
            "session destroy",
        )
        .await?;
        Ok(())
    }

    async fn renew_session(&self, id: &str) -> CoordinationResult<()> {
        let resp = self
            .send(
                self.request(Method::PUT, &format!("session/renew/{id}")),
                "session renew",
            )
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(CoordinationError::SessionNotFound(id.to_owned()));
        }
        let entries: Vec<serde_json::Value> = Self::json(resp, "session renew").await?;
        if entries.is_empty() {
            return Err(CoordinationError::SessionNotFound(id.to_owned()));
        }
        Ok(())
    }

    async fn kv_get(&self, key: &str) -> CoordinationResult<Option<KvPair>> {
        let resp = self
            .send(self.request(Method::GET, &kv_path(key)), "kv get")
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body = Self::bytes(resp, "kv get").await?;
        let entries = decode_entries(&body).map_err(CoordinationError::Codec)?;
        Ok(entries.into_iter().find(|p| p.key == key))
    }

    async fn kv_put(&self, key: &str, value: &[u8]) -> CoordinationResult<()> {
        self.put_bool(
            self.request(Method::PUT, &kv_path(key)).body(value.to_vec()),
            "kv put",
        )
        .await?;
        Ok(())
    }

    async fn kv_delete(&self, key: &str) -> CoordinationResult<()> {
        self.send(self.request(Method::DELETE, &kv_path(key)), "kv delete")
            .await?;
        Ok(())
    }

    async fn kv_list(&self, prefix: &str) -> CoordinationResult<Vec<KvPair>> {
        let resp = self
            .send(
                self.request(Method::GET, &kv_path(prefix))
                    .query(&[("recurse", "true")]),
                "kv list",
            )
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        let body = Self::bytes(resp, "kv list").await?;
        decode_entries(&body).map_err(CoordinationError::Codec)
    }

    async fn kv_acquire(
        &self,
        key: &str,
        value: &[u8],
        session: &str,
    ) -> CoordinationResult<bool> {
        self.put_bool(
            self.request(Method::PUT, &kv_path(key))
                .query(&[("acquire", session)])
                .body(value.to_vec()),
            "kv acquire",
        )
        .await
    }

    async fn kv_release(&self, key: &str, session: &str) -> CoordinationResult<bool> {
        self.put_bool(
            self.request(Method::PUT, &kv_path(key))
                .query(&[("release", session)]),
            "kv release",
        )
        .await
    }

    async fn watch(
        &self,
        target: &WatchTarget,
        index: u64,
        wait: Duration,
    ) -> CoordinationResult<WatchUpdate> {
        let mut req = self.request(Method::GET, &kv_path(target.key()));
        if matches!(target, WatchTarget::Prefix(_)) {
            req = req.query(&[("recurse", "true")]);
        }
        if index > 0 {
            req = req
                .query(&[("index", index.to_string()), ("wait", format_secs(wait))])
                .timeout(wait + wait / 16 + BLOCKING_SLACK);
        }

        let resp = self.send(req, "kv watch").await?;
        let new_index = resp
            .headers()
            .get(INDEX_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .ok_or_else(|| {
                CoordinationError::Codec(format!("missing or invalid {INDEX_HEADER} header"))
            })?;
        let found = resp.status() != StatusCode::NOT_FOUND;
        let body = Self::bytes(resp, "kv watch").await?;
        let payload = watch_payload(target, found.then_some(body.as_slice()));
        trace!(%target, index = new_index, "consul watch returned");
        Ok(WatchUpdate {
            index: new_index,
            payload,
        })
    }
}

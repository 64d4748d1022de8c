//! Outbound HTTP client for peer librarians.
//!
//! Thin wrapper over `ureq`: basic-auth on every request, typed JSON
//! request/response bodies, and a fixed three-attempt retry ladder
//! (100 ms / 500 ms / 2 s) on transient failures.

use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use arca_protocol::ping::{PingRequest, PingResponse};
use arca_protocol::PROTOCOL_VERSION;

const RETRY_DELAYS: [Duration; 3] = [
    Duration::from_millis(100),
    Duration::from_millis(500),
    Duration::from_millis(2000),
];

const CALL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("peer returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("transport error talking to peer: {0}")]
    Transport(String),

    #[error("peer returned an unexpected structure: {0}")]
    Decode(String),

    #[error("peer identifies as '{reported}', expected '{expected}'")]
    NameMismatch { expected: String, reported: String },
}

impl ClientError {
    fn is_transient(&self) -> bool {
        match self {
            ClientError::Transport(_) => true,
            ClientError::Http { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

pub struct PeerClient {
    base_url: String,
    authorization: String,
    agent: ureq::Agent,
}

impl PeerClient {
    /// `base_url` carries the scheme and host; `port` is appended.
    pub fn new(base_url: &str, port: u16, username: &str, password: &str) -> Self {
        let base_url = format!("{}:{port}", base_url.trim_end_matches('/'));
        let credentials = BASE64.encode(format!("{username}:{password}"));
        Self {
            base_url,
            authorization: format!("Basic {credentials}"),
            agent: ureq::AgentBuilder::new().timeout(CALL_TIMEOUT).build(),
        }
    }

    /// From a plaintext `username:password` authenticator.
    pub fn from_authenticator(base_url: &str, port: u16, authenticator: &str) -> Self {
        let (username, password) = authenticator.split_once(':').unwrap_or((authenticator, ""));
        Self::new(base_url, port, username, password)
    }

    /// POST a typed request, retrying transient failures.
    pub fn post<Req: Serialize, Resp: DeserializeOwned>(
        &self,
        endpoint: &str,
        request: &Req,
    ) -> Result<Resp, ClientError> {
        let url = format!(
            "{}/api/v2/{}",
            self.base_url,
            endpoint.trim_start_matches('/')
        );

        let mut attempt = 0;
        loop {
            match self.post_once(&url, request) {
                Ok(resp) => return Ok(resp),
                Err(e) if e.is_transient() && attempt < RETRY_DELAYS.len() => {
                    tracing::warn!(
                        url = %url,
                        attempt = attempt + 1,
                        error = %e,
                        "transient peer error, retrying"
                    );
                    std::thread::sleep(RETRY_DELAYS[attempt]);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn post_once<Req: Serialize, Resp: DeserializeOwned>(
        &self,
        url: &str,
        request: &Req,
    ) -> Result<Resp, ClientError> {
        let response = self
            .agent
            .post(url)
            .set("Authorization", &self.authorization)
            .send_json(request);

        match response {
            Ok(resp) => resp
                .into_json::<Resp>()
                .map_err(|e| ClientError::Decode(e.to_string())),
            Err(ureq::Error::Status(status, resp)) => {
                let body = resp.into_string().unwrap_or_default();
                Err(ClientError::Http { status, body })
            }
            Err(ureq::Error::Transport(t)) => Err(ClientError::Transport(t.to_string())),
        }
    }

    /// Ping the peer and verify it reports the expected name. A mismatch is
    /// a refusal: some other instance is answering at this address.
    pub fn ping_checked(&self, expected_name: &str) -> Result<PingResponse, ClientError> {
        let response: PingResponse = self.post(
            "ping",
            &PingRequest {
                protocol_version: PROTOCOL_VERSION,
            },
        )?;
        if response.name != expected_name {
            return Err(ClientError::NameMismatch {
                expected: expected_name.to_string(),
                reported: response.name,
            });
        }
        Ok(response)
    }
}

//! HTTP client for the per-host agent service.
//!
//! Implements `AgentClient` and `AgentConnector` from `clustergrade-core`.
//! Each request is a JSON [`AgentRequest`] posted to
//! `http://<host>:<port>/v1/agent`; the agent answers with an
//! [`AgentReply`]. Connecting checks `/v1/health` on every host under the
//! `CLUSTERGRADE_CONNECTION_TIMEOUT` deadline.

use std::time::Duration;

use clustergrade_core::agent::{AgentClient, AgentConnection, AgentConnector, AgentError};
use clustergrade_types::agent::{AgentReply, AgentRequest};
use clustergrade_types::error::ConnectError;
use futures_util::future::join_all;

pub const CONNECTION_TIMEOUT_ENV: &str = "CLUSTERGRADE_CONNECTION_TIMEOUT";
pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(1);

/// Deadline for the initial agent connection, from the environment.
pub fn connection_timeout() -> Duration {
    parse_connection_timeout(std::env::var(CONNECTION_TIMEOUT_ENV).ok().as_deref())
}

/// Parse fractional seconds. Unset, malformed or non-positive values fall
/// back to [`DEFAULT_CONNECTION_TIMEOUT`].
pub fn parse_connection_timeout(value: Option<&str>) -> Duration {
    let Some(raw) = value else {
        return DEFAULT_CONNECTION_TIMEOUT;
    };
    match raw.trim().parse::<f64>() {
        Ok(secs) if secs.is_finite() && secs > 0.0 => Duration::from_secs_f64(secs),
        _ => {
            tracing::warn!(
                value = raw,
                default_secs = DEFAULT_CONNECTION_TIMEOUT.as_secs_f64(),
                "invalid {CONNECTION_TIMEOUT_ENV}, using the default"
            );
            DEFAULT_CONNECTION_TIMEOUT
        }
    }
}

fn base_url(host: &str, port: u16) -> String {
    format!("http://{host}:{port}")
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Sends requests to one host's agent.
///
/// Operations such as rsync and the per-segment upgrade run for as long as
/// they need, so requests carry no timeout of their own.
#[derive(Clone)]
pub struct HttpAgentClient {
    client: reqwest::Client,
    url: String,
}

impl HttpAgentClient {
    pub fn new(client: reqwest::Client, host: &str, port: u16) -> Self {
        Self {
            client,
            url: format!("{}/v1/agent", base_url(host, port)),
        }
    }
}

impl AgentClient for HttpAgentClient {
    async fn send(&self, request: AgentRequest) -> Result<AgentReply, AgentError> {
        let op = request.op();
        let response = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(|e| AgentError::Transport(format!("{op}: HTTP request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AgentError::Transport(format!("{op}: HTTP {status}: {body}")));
        }

        response
            .json::<AgentReply>()
            .await
            .map_err(|e| AgentError::Transport(format!("{op}: failed to parse reply: {e}")))
    }
}

// ---------------------------------------------------------------------------
// Connector
// ---------------------------------------------------------------------------

/// Connects to the agents of every host, failing on the first host that is
/// unreachable.
pub struct HttpAgentConnector {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpAgentConnector {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: reqwest::Client::builder().build()?,
            timeout,
        })
    }

    /// A connector whose deadline comes from `CLUSTERGRADE_CONNECTION_TIMEOUT`.
    pub fn from_env() -> Result<Self, reqwest::Error> {
        Self::new(connection_timeout())
    }

    async fn health_check(&self, host: &str, port: u16) -> Result<(), ConnectError> {
        let url = format!("{}/v1/health", base_url(host, port));
        let request = self.client.get(&url).send();

        let response = match tokio::time::timeout(self.timeout, request).await {
            Err(_) => {
                return Err(ConnectError::Timeout {
                    host: host.to_string(),
                    timeout_secs: self.timeout.as_secs_f64(),
                });
            }
            Ok(Err(e)) if e.is_timeout() => {
                return Err(ConnectError::Timeout {
                    host: host.to_string(),
                    timeout_secs: self.timeout.as_secs_f64(),
                });
            }
            Ok(Err(e)) => {
                return Err(ConnectError::Failed {
                    host: host.to_string(),
                    reason: e.to_string(),
                });
            }
            Ok(Ok(response)) => response,
        };

        if !response.status().is_success() {
            return Err(ConnectError::Failed {
                host: host.to_string(),
                reason: format!("health check returned HTTP {}", response.status()),
            });
        }
        Ok(())
    }
}

impl AgentConnector for HttpAgentConnector {
    async fn connect(
        &self,
        hosts: &[String],
        port: u16,
    ) -> Result<Vec<AgentConnection>, ConnectError> {
        let checks = hosts.iter().map(|host| self.health_check(host, port));
        for result in join_all(checks).await {
            result?;
        }

        tracing::info!(hosts = hosts.len(), port, "connected to agents");
        Ok(hosts
            .iter()
            .map(|host| {
                AgentConnection::new(host.clone(), HttpAgentClient::new(self.client.clone(), host, port))
            })
            .collect())
    }
}

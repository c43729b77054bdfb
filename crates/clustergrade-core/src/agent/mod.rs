//! Agent service port and connection handles.
//!
//! - [`AgentClient`]: trait for sending one [`AgentRequest`] to one host
//! - [`box_client`]: type-erased wrapper so connections can hold any client
//! - [`fanout`]: concurrent execution of a request across many connections

pub mod box_client;
pub mod fanout;

use std::sync::Arc;

use clustergrade_types::agent::{AgentReply, AgentRequest};
use clustergrade_types::error::ConnectError;

pub use box_client::BoxAgentClient;
pub use fanout::{FanOutError, HostFailure, execute_rpc};

/// Errors from a single agent call.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AgentError {
    /// The agent ran the operation and reported a failure.
    #[error("{0}")]
    Remote(String),

    #[error("transport error: {0}")]
    Transport(String),
}

/// Client for one host's agent service.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait AgentClient: Send + Sync {
    fn send(
        &self,
        request: AgentRequest,
    ) -> impl std::future::Future<Output = Result<AgentReply, AgentError>> + Send;
}

/// Establishes connections to the agents of a set of hosts.
///
/// Connecting is bounded by a deadline; a host that does not answer in time
/// is [`ConnectError::Timeout`].
pub trait AgentConnector: Send + Sync {
    fn connect(
        &self,
        hosts: &[String],
        port: u16,
    ) -> impl std::future::Future<Output = Result<Vec<AgentConnection>, ConnectError>> + Send;
}

/// A hostname plus its agent client. Built once per process and shared
/// read-only; cloning shares the underlying client.
#[derive(Clone)]
pub struct AgentConnection {
    pub hostname: String,
    pub client: Arc<BoxAgentClient>,
}

impl AgentConnection {
    pub fn new<C: AgentClient + 'static>(hostname: impl Into<String>, client: C) -> Self {
        Self {
            hostname: hostname.into(),
            client: Arc::new(BoxAgentClient::new(client)),
        }
    }

    /// Send a request, turning an error reply into [`AgentError::Remote`].
    pub async fn call(&self, request: AgentRequest) -> Result<(), AgentError> {
        let reply = self.client.send(request).await?;
        match reply.error {
            Some(message) => Err(AgentError::Remote(message)),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for AgentConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentConnection")
            .field("hostname", &self.hostname)
            .finish()
    }
}

//! Type-erased [`AgentClient`].
//!
//! `AgentClient::send` returns `impl Future`, which cannot sit behind `dyn`.
//! `AgentClientDyn` boxes the future and is implemented for every client.

use std::future::Future;
use std::pin::Pin;

use clustergrade_types::agent::{AgentReply, AgentRequest};

use super::{AgentClient, AgentError};

/// Object-safe version of [`AgentClient`] with boxed futures.
pub trait AgentClientDyn: Send + Sync {
    fn send_boxed(
        &self,
        request: AgentRequest,
    ) -> Pin<Box<dyn Future<Output = Result<AgentReply, AgentError>> + Send + '_>>;
}

impl<T: AgentClient> AgentClientDyn for T {
    fn send_boxed(
        &self,
        request: AgentRequest,
    ) -> Pin<Box<dyn Future<Output = Result<AgentReply, AgentError>> + Send + '_>> {
        Box::pin(self.send(request))
    }
}

/// Type-erased agent client, so HTTP clients and test mocks can sit behind
/// the same [`super::AgentConnection`].
pub struct BoxAgentClient {
    inner: Box<dyn AgentClientDyn + Send + Sync>,
}

impl BoxAgentClient {
    pub fn new<T: AgentClient + 'static>(client: T) -> Self {
        Self {
            inner: Box::new(client),
        }
    }

    pub async fn send(&self, request: AgentRequest) -> Result<AgentReply, AgentError> {
        self.inner.send_boxed(request).await
    }
}

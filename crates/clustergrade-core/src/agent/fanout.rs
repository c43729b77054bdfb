//! Fan-out executor: one agent request per host, concurrently.
//!
//! Every connection is attempted; a failure on one host never cancels the
//! others. The outcome is a single aggregate error naming each failing host.

use std::collections::HashMap;
use std::fmt;

use clustergrade_types::agent::AgentRequest;
use tokio::task::JoinSet;

use super::AgentConnection;

/// One host's failure within a fan-out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostFailure {
    pub host: String,
    pub message: String,
}

/// Aggregate error from [`execute_rpc`]; one entry per failing host in
/// connection order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FanOutError {
    failures: Vec<HostFailure>,
}

impl FanOutError {
    /// Aggregate per-host failures; `None` if there are none.
    pub fn from_failures(failures: Vec<HostFailure>) -> Option<Self> {
        (!failures.is_empty()).then_some(Self { failures })
    }

    pub fn failures(&self) -> &[HostFailure] {
        &self.failures
    }

    pub fn hosts(&self) -> Vec<&str> {
        self.failures.iter().map(|f| f.host.as_str()).collect()
    }
}

impl fmt::Display for FanOutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined = self
            .failures
            .iter()
            .map(|fail| format!("host {}: {}", fail.host, fail.message))
            .collect::<Vec<_>>()
            .join("; ");
        f.write_str(&joined)
    }
}

impl std::error::Error for FanOutError {}

/// Send a request to every connection concurrently and wait for all of them.
///
/// `build` produces the request for one host from the caller's topology;
/// returning `None` means the host has nothing to do and counts as success.
/// A request whose task panics is reported as that host's failure.
pub async fn execute_rpc<F>(connections: &[AgentConnection], build: F) -> Result<(), FanOutError>
where
    F: Fn(&AgentConnection) -> Option<AgentRequest>,
{
    let mut set = JoinSet::new();
    let mut hosts = HashMap::new();
    let mut order = HashMap::new();

    for (index, conn) in connections.iter().enumerate() {
        order.insert(conn.hostname.clone(), index);
        let Some(request) = build(conn) else {
            tracing::debug!(host = %conn.hostname, "no agent request for host");
            continue;
        };

        tracing::debug!(host = %conn.hostname, op = request.op(), "sending agent request");
        let conn = conn.clone();
        let handle = set.spawn(async move { conn.call(request).await });
        hosts.insert(handle.id(), connections[index].hostname.clone());
    }

    let mut failures = Vec::new();
    while let Some(joined) = set.join_next_with_id().await {
        let (id, message) = match joined {
            Ok((_, Ok(()))) => continue,
            Ok((id, Err(e))) => (id, e.to_string()),
            Err(join_err) => (join_err.id(), panic_message(join_err)),
        };
        let host = hosts.get(&id).cloned().unwrap_or_default();
        tracing::warn!(host = %host, error = %message, "agent request failed");
        failures.push(HostFailure { host, message });
    }

    if failures.is_empty() {
        return Ok(());
    }

    failures.sort_by_key(|f| order.get(&f.host).copied().unwrap_or(usize::MAX));
    Err(FanOutError { failures })
}

fn panic_message(err: tokio::task::JoinError) -> String {
    if !err.is_panic() {
        return format!("request cancelled: {err}");
    }
    let payload = err.into_panic();
    let detail = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("request panicked: {detail}")
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::HashSet;
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex};

    use clustergrade_types::agent::AgentReply;

    use super::*;
    use crate::agent::{AgentClient, AgentError};

    /// Records every request it receives and fails on demand.
    #[derive(Clone, Default)]
    pub struct MockAgent {
        pub host: String,
        pub received: Arc<Mutex<Vec<(String, AgentRequest)>>>,
        pub fail_with: Option<String>,
        pub panic: bool,
    }

    impl AgentClient for MockAgent {
        async fn send(&self, request: AgentRequest) -> Result<AgentReply, AgentError> {
            if self.panic {
                panic!("agent on {} blew up", self.host);
            }
            self.received
                .lock()
                .unwrap()
                .push((self.host.clone(), request));
            Ok(AgentReply {
                error: self.fail_with.clone(),
            })
        }
    }

    pub fn connections(
        hosts: &[&str],
        failing: &[&str],
        log: &Arc<Mutex<Vec<(String, AgentRequest)>>>,
    ) -> Vec<AgentConnection> {
        hosts
            .iter()
            .map(|host| {
                let agent = MockAgent {
                    host: host.to_string(),
                    received: log.clone(),
                    fail_with: failing
                        .contains(host)
                        .then(|| format!("delete failed on {host}")),
                    panic: false,
                };
                AgentConnection::new(*host, agent)
            })
            .collect()
    }

    fn delete_request(conn: &AgentConnection) -> Option<AgentRequest> {
        Some(AgentRequest::DeleteDataDirectories {
            data_dirs: vec![PathBuf::from(format!("/data/{}", conn.hostname))],
        })
    }

    #[tokio::test]
    async fn all_hosts_succeed() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let conns = connections(&["sdw1", "sdw2", "sdw3"], &[], &log);

        execute_rpc(&conns, delete_request).await.unwrap();

        let hosts: HashSet<String> = log.lock().unwrap().iter().map(|(h, _)| h.clone()).collect();
        assert_eq!(hosts.len(), 3);
    }

    #[tokio::test]
    async fn failures_are_aggregated_and_every_host_attempted() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let conns = connections(&["sdw1", "sdw2", "sdw3"], &["sdw1", "sdw3"], &log);

        let err = execute_rpc(&conns, delete_request).await.unwrap_err();

        assert_eq!(err.hosts(), vec!["sdw1", "sdw3"]);
        assert_eq!(
            err.to_string(),
            "host sdw1: delete failed on sdw1; host sdw3: delete failed on sdw3"
        );
        assert_eq!(log.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn hosts_without_work_are_not_contacted() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let conns = connections(&["sdw1", "sdw2"], &["sdw2"], &log);

        execute_rpc(&conns, |conn| {
            (conn.hostname == "sdw1").then(|| AgentRequest::StopAgent)
        })
        .await
        .unwrap();

        let received = log.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].0, "sdw1");
    }

    #[tokio::test]
    async fn panic_is_reported_as_host_error() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut conns = connections(&["sdw1"], &[], &log);
        conns.push(AgentConnection::new(
            "sdw2",
            MockAgent {
                host: "sdw2".into(),
                panic: true,
                ..Default::default()
            },
        ));

        let err = execute_rpc(&conns, delete_request).await.unwrap_err();
        assert_eq!(err.hosts(), vec!["sdw2"]);
        assert!(err.failures()[0].message.contains("request panicked"));
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn empty_connection_list_succeeds() {
        execute_rpc(&[], delete_request).await.unwrap();
    }
}

//! Endpoint selection and the reconnect policy.

use std::time::Duration;

use courier_errors::{Error, ErrorKind, Result};
use courier_tasks::ControlToken;
use tokio::net::TcpStream;
use tracing::debug;

/// One upstream node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Endpoint {
            host: host.into(),
            port,
        }
    }

    pub fn id(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Per-endpoint retry budget and inter-retry back-off.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub retries_per_endpoint: usize,
    pub retry_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            retries_per_endpoint: 3,
            retry_delay: Duration::from_millis(200),
        }
    }
}

/// Round-robin selector over a fixed endpoint set.
#[derive(Debug, Clone)]
pub struct EndpointSelector {
    endpoints: Vec<Endpoint>,
    policy: RetryPolicy,
}

impl EndpointSelector {
    pub fn new(endpoints: Vec<Endpoint>, policy: RetryPolicy) -> Result<Self> {
        if endpoints.is_empty() {
            return Err(Error::argument("at least one endpoint is required"));
        }
        Ok(EndpointSelector { endpoints, policy })
    }

    /// A fresh circular iterator with full retry budgets.
    pub fn create_iterator(&self) -> ReconnectIterator {
        ReconnectIterator {
            endpoints: self.endpoints.clone(),
            budgets: vec![self.policy.retries_per_endpoint; self.endpoints.len()],
            policy: self.policy.clone(),
            pos: 0,
            started: false,
        }
    }
}

/// Circular endpoint iterator carrying per-endpoint retry budgets.
///
/// The connect path simply rotates (`select_next` + `current`); the
/// reconnect path additionally consumes budgets and observes the back-off.
#[derive(Debug, Clone)]
pub struct ReconnectIterator {
    endpoints: Vec<Endpoint>,
    budgets: Vec<usize>,
    policy: RetryPolicy,
    pos: usize,
    started: bool,
}

impl ReconnectIterator {
    pub fn current(&self) -> &Endpoint {
        &self.endpoints[self.pos]
    }

    /// Whether the current endpoint still has retry budget.
    pub fn can_retry(&self) -> bool {
        self.budgets[self.pos] > 0
    }

    pub fn consume_retry(&mut self) {
        if self.budgets[self.pos] > 0 {
            self.budgets[self.pos] -= 1;
        }
    }

    /// Advance round-robin. `false` when every endpoint's budget is
    /// exhausted.
    pub fn select_next(&mut self) -> bool {
        if !self.started {
            self.started = true;
            return true;
        }
        for _ in 0..self.endpoints.len() {
            self.pos = (self.pos + 1) % self.endpoints.len();
            if self.budgets[self.pos] > 0 {
                return true;
            }
        }
        false
    }

    pub fn retry_delay(&self) -> Duration {
        self.policy.retry_delay
    }

    /// Refill all budgets after a successful connection.
    pub fn reset_retry(&mut self) {
        for budget in &mut self.budgets {
            *budget = self.policy.retries_per_endpoint;
        }
    }
}

/// Whether a connection failure is worth a reconnect attempt.
///
/// Server-side errors and cancellation are final; everything else is
/// treated as a client-side connection issue.
pub fn is_reconnectable_error(error: &Error) -> bool {
    !matches!(error.kind(), ErrorKind::ServerError) && !error.is_cancellation()
}

/// Connect to the iterator's endpoints under the retry policy.
///
/// Consumes one retry per attempt, observes the back-off between attempts
/// and rotates endpoints; exhaustion fails with ServerNoConnection wrapping
/// the last transport error.
pub(crate) async fn connect_with_retries(
    iterator: &mut ReconnectIterator,
    token: &ControlToken,
    mut last_error: Option<Error>,
) -> Result<(TcpStream, String)> {
    loop {
        token.check().map_err(|e| {
            e.with_user_friendly(true)
                .with_message_property("can't connect because shutdown is already in progress")
        })?;

        if !iterator.can_retry() && !iterator.select_next() {
            // The retry count has been exhausted for all nodes.
            let err = Error::new(
                ErrorKind::ServerNoConnection,
                "an error has occurred while trying to connect to a chunk server node",
            );
            return Err(match last_error {
                Some(cause) => err.with_source(cause),
                None => err,
            });
        }

        if last_error.is_some() {
            // Back-off applies between attempts, not before the first one.
            tokio::time::sleep(iterator.retry_delay()).await;
        }
        iterator.consume_retry();

        let endpoint = iterator.current().clone();
        debug!(endpoint = %endpoint.id(), "attempting to connect");

        match TcpStream::connect((endpoint.host.as_str(), endpoint.port)).await {
            Ok(stream) => {
                iterator.reset_retry();
                return Ok((stream, endpoint.id()));
            }
            Err(e) => {
                last_error = Some(
                    Error::from(e).with_endpoint(endpoint.host.clone(), endpoint.port),
                );
                iterator.select_next();
            }
        }
    }
}

//! localtunnel-compatible tunnel provider
//!
//! The provider server hands out a public URL plus a TCP port; the client keeps
//! a pool of outbound connections to that port and pipes each one to the local
//! service. Every provider connection carries one inbound client connection,
//! after which the worker dials again.

use async_trait::async_trait;
use serde::Deserialize;
use shareport_core::provider::{ProviderError, ProviderTunnel, TunnelProvider};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

const DEFAULT_MAX_CONNECTIONS: usize = 10;

/// Consecutive failed dials before a worker gives the tunnel up
const MAX_DIAL_FAILURES: u32 = 5;

const DIAL_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Deserialize)]
struct TunnelAssignment {
    id: String,
    port: u16,
    #[serde(default)]
    max_conn_count: Option<usize>,
    url: String,
}

#[derive(Debug, Deserialize)]
struct RejectionBody {
    message: String,
}

pub struct LocaltunnelProvider {
    client: reqwest::Client,
    base_url: Url,
    local_host: String,
}

impl LocaltunnelProvider {
    pub fn new(base_url: &str) -> Result<Self, ProviderError> {
        let base_url = Url::parse(base_url)
            .map_err(|e| ProviderError::Request(format!("invalid provider URL: {}", e)))?;
        if base_url.host_str().is_none() {
            return Err(ProviderError::Request(format!(
                "provider URL has no host: {}",
                base_url
            )));
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| ProviderError::Request(e.to_string()))?;

        Ok(Self {
            client,
            base_url,
            local_host: "127.0.0.1".to_string(),
        })
    }

    /// Host the local service listens on (default `127.0.0.1`)
    pub fn with_local_host(mut self, host: impl Into<String>) -> Self {
        self.local_host = host.into();
        self
    }

    fn assignment_url(&self, subdomain: Option<&str>) -> Result<Url, ProviderError> {
        let joined = match subdomain {
            Some(subdomain) => self.base_url.join(subdomain),
            None => self.base_url.join("?new"),
        };
        joined.map_err(|e| ProviderError::Request(format!("invalid subdomain: {}", e)))
    }
}

#[async_trait]
impl TunnelProvider for LocaltunnelProvider {
    async fn open(
        &self,
        port: u16,
        subdomain: Option<&str>,
    ) -> Result<Arc<dyn ProviderTunnel>, ProviderError> {
        let url = self.assignment_url(subdomain)?;
        debug!("Requesting tunnel from {}", url);

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ProviderError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let reason = match response.json::<RejectionBody>().await {
                Ok(body) => body.message,
                Err(_) => status.to_string(),
            };
            return Err(ProviderError::Rejected(reason));
        }

        let assignment: TunnelAssignment = response
            .json()
            .await
            .map_err(|e| ProviderError::Request(format!("unexpected provider response: {}", e)))?;

        // Checked non-empty in `new`
        let remote_host = self.base_url.host_str().unwrap_or_default().to_string();
        let connections = assignment
            .max_conn_count
            .unwrap_or(DEFAULT_MAX_CONNECTIONS)
            .clamp(1, DEFAULT_MAX_CONNECTIONS);

        info!(
            "Provider assigned tunnel {} ({} connections to {}:{})",
            assignment.id, connections, remote_host, assignment.port
        );

        let tunnel = LocaltunnelTunnel::start(
            assignment.url,
            Endpoint {
                host: remote_host,
                port: assignment.port,
            },
            Endpoint {
                host: self.local_host.clone(),
                port,
            },
            connections,
        );
        Ok(Arc::new(tunnel))
    }
}

#[derive(Debug, Clone)]
struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    async fn dial(&self) -> std::io::Result<TcpStream> {
        TcpStream::connect((self.host.as_str(), self.port)).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TunnelState {
    Open,
    /// Workers could no longer reach the provider
    Lost,
    Closed,
}

/// A running localtunnel tunnel
pub struct LocaltunnelTunnel {
    url: String,
    state: Arc<watch::Sender<TunnelState>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl LocaltunnelTunnel {
    fn start(url: String, remote: Endpoint, local: Endpoint, connections: usize) -> Self {
        let (state, _) = watch::channel(TunnelState::Open);
        let state = Arc::new(state);

        let workers = (0..connections)
            .map(|worker| {
                tokio::spawn(run_worker(
                    worker,
                    remote.clone(),
                    local.clone(),
                    state.clone(),
                ))
            })
            .collect();

        Self {
            url,
            state,
            workers: Mutex::new(workers),
        }
    }
}

#[async_trait]
impl ProviderTunnel for LocaltunnelTunnel {
    fn url(&self) -> &str {
        &self.url
    }

    async fn closed(&self) {
        let mut state = self.state.subscribe();
        let _ = state.wait_for(|s| *s != TunnelState::Open).await;
    }

    async fn close(&self) {
        self.state.send_if_modified(|state| {
            if *state == TunnelState::Closed {
                return false;
            }
            *state = TunnelState::Closed;
            true
        });

        for worker in self.workers.lock().await.drain(..) {
            worker.abort();
        }
        debug!("Tunnel {} closed", self.url);
    }
}

impl Drop for LocaltunnelTunnel {
    fn drop(&mut self) {
        if let Ok(mut workers) = self.workers.try_lock() {
            for worker in workers.drain(..) {
                worker.abort();
            }
        }
    }
}

async fn run_worker(
    worker: usize,
    remote: Endpoint,
    local: Endpoint,
    state: Arc<watch::Sender<TunnelState>>,
) {
    let mut state_rx = state.subscribe();
    let mut failures = 0u32;

    loop {
        if *state_rx.borrow() != TunnelState::Open {
            return;
        }

        let mut upstream = match remote.dial().await {
            Ok(stream) => {
                failures = 0;
                stream
            }
            Err(e) => {
                failures += 1;
                warn!(
                    "Worker {} could not reach provider {}:{} ({}/{}): {}",
                    worker, remote.host, remote.port, failures, MAX_DIAL_FAILURES, e
                );
                if failures >= MAX_DIAL_FAILURES {
                    state.send_if_modified(|s| {
                        if *s == TunnelState::Open {
                            *s = TunnelState::Lost;
                            return true;
                        }
                        false
                    });
                    return;
                }
                tokio::select! {
                    _ = state_rx.changed() => {}
                    _ = tokio::time::sleep(DIAL_RETRY_DELAY) => {}
                }
                continue;
            }
        };

        // The provider keeps the connection idle until a visitor arrives;
        // only then is the local service dialed.
        if upstream.readable().await.is_err() {
            continue;
        }

        let mut downstream = match local.dial().await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(
                    "Local service {}:{} refused connection: {}",
                    local.host, local.port, e
                );
                tokio::time::sleep(DIAL_RETRY_DELAY).await;
                continue;
            }
        };

        tokio::select! {
            _ = state_rx.changed() => return,
            result = tokio::io::copy_bidirectional(&mut upstream, &mut downstream) => {
                match result {
                    Ok((up, down)) => debug!("Worker {} relayed {}B up, {}B down", worker, up, down),
                    Err(e) => debug!("Worker {} connection ended: {}", worker, e),
                }
            }
        }
    }
}

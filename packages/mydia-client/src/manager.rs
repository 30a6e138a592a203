//! Connection manager.
//!
//! Owns the client's view of one paired server for the lifetime of a
//! session: which transport is live (relay tunnel, pinned direct, or both
//! during a hot swap), how many requests are in flight on each, and when to
//! probe for a better path.
//!
//! Startup is relay-first: if an instance id and relay URL are known the
//! relay is tried before any direct URL, because it works from anywhere.
//! Once up in `RelayOnly`, a background probe keeps testing the advertised
//! direct URLs; the first success enters `Dual` — new requests route direct
//! while in-flight relay requests drain, and when the last one completes the
//! tunnel closes and the mode settles at `DirectOnly`.
//!
//! Every state mutation happens under one lock and is published on a watch
//! channel immediately after it commits, so any number of subscribers can
//! follow along and a fresh subscriber always sees the current state.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;

use crate::error::{ClientError, Result};
use crate::relay::RelayTunnel;
use crate::store::{self, ClientStore};

/// Active transport mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionMode {
    RelayOnly,
    DirectOnly,
    /// Direct is up but relay requests are still draining.
    Dual,
}

/// Snapshot published on every state change.
#[derive(Debug, Clone, Default)]
pub struct ConnectionState {
    pub mode: Option<ConnectionMode>,
    pub direct_url: Option<String>,
    pub pending_relay: usize,
    pub pending_direct: usize,
    pub probe_failures: u32,
}

/// Startup configuration for one paired server.
#[derive(Debug, Clone, Default)]
pub struct ConnectionConfig {
    pub relay_url: Option<String>,
    pub instance_id: Option<String>,
    /// Direct URLs from pairing, tried in order.
    pub direct_urls: Vec<String>,
    /// Skip the relay entirely.
    pub force_direct_only: bool,
    /// Per-URL timeout when probing direct reachability.
    pub direct_timeout: Option<Duration>,
}

const DEFAULT_DIRECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Probe backoff schedule, indexed by consecutive failure count and clamped
/// at the last entry.
const PROBE_DELAYS: [Duration; 5] = [
    Duration::from_secs(5),
    Duration::from_secs(10),
    Duration::from_secs(30),
    Duration::from_secs(60),
    Duration::from_secs(300),
];

/// Delay before the next direct-URL probe after `failure_count` consecutive
/// failures.
pub fn next_probe_delay(failure_count: u32) -> Duration {
    PROBE_DELAYS[(failure_count as usize).min(PROBE_DELAYS.len() - 1)]
}

#[derive(Debug, Clone, Copy)]
enum TransportKind {
    Relay,
    Direct,
}

#[derive(Default)]
struct Inner {
    mode: Option<ConnectionMode>,
    tunnel: Option<Arc<RelayTunnel>>,
    direct_url: Option<String>,
    /// Configured URLs plus any the relay tunnel advertised.
    known_direct_urls: Vec<String>,
    pending_relay: usize,
    pending_direct: usize,
    probe_failures: u32,
}

/// The connection manager. Construct with [`ConnectionManager::new`] and
/// share behind the returned `Arc`.
pub struct ConnectionManager {
    config: ConnectionConfig,
    http: reqwest::Client,
    store: Option<Arc<ClientStore>>,
    inner: Mutex<Inner>,
    state_tx: watch::Sender<ConnectionState>,
}

impl ConnectionManager {
    /// `http` should be a pinned client from [`crate::direct::create_client`]
    /// when a fingerprint is stored; `store` receives the startup hints.
    pub fn new(
        config: ConnectionConfig,
        http: reqwest::Client,
        store: Option<Arc<ClientStore>>,
    ) -> Arc<Self> {
        let (state_tx, _) = watch::channel(ConnectionState::default());
        Arc::new(Self {
            config,
            http,
            store,
            inner: Mutex::new(Inner::default()),
            state_tx,
        })
    }

    /// Subscribe to state updates. The receiver immediately holds the
    /// current state; changes arrive as they commit.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Current state snapshot.
    pub fn state(&self) -> ConnectionState {
        self.state_tx.borrow().clone()
    }

    /// Whether the relay can be torn down without abandoning requests.
    pub fn can_close_relay(&self) -> bool {
        self.inner.lock().unwrap().pending_relay == 0
    }

    /// Establish the initial transport. Relay first when it is known,
    /// direct URLs in order otherwise; a terminal error only when nothing
    /// answers.
    pub async fn connect(&self) -> Result<ConnectionMode> {
        if !self.config.force_direct_only {
            if let (Some(relay_url), Some(instance_id)) =
                (&self.config.relay_url, &self.config.instance_id)
            {
                match RelayTunnel::connect(relay_url, instance_id).await {
                    Ok(tunnel) => {
                        let tunnel = Arc::new(tunnel);
                        {
                            let mut inner = self.inner.lock().unwrap();
                            inner.known_direct_urls = merge_urls(
                                &self.config.direct_urls,
                                tunnel.direct_urls(),
                            );
                            inner.tunnel = Some(tunnel);
                            inner.mode = Some(ConnectionMode::RelayOnly);
                        }
                        self.publish();
                        self.persist_last("relay", relay_url);
                        tracing::info!("Connected via relay");
                        return Ok(ConnectionMode::RelayOnly);
                    }
                    Err(e) => {
                        tracing::warn!("Relay unavailable ({e}); trying direct URLs");
                    }
                }
            }
        }

        for url in self.candidate_direct_urls() {
            if self.probe_direct(&url).await {
                {
                    let mut inner = self.inner.lock().unwrap();
                    inner.direct_url = Some(url.clone());
                    inner.mode = Some(ConnectionMode::DirectOnly);
                }
                self.publish();
                self.persist_last("direct", &url);
                tracing::info!(url = %url, "Connected directly");
                return Ok(ConnectionMode::DirectOnly);
            }
        }

        Err(ClientError::Unavailable(
            "relay unreachable and no direct URL responded".into(),
        ))
    }

    /// Route one request through the active transport.
    ///
    /// The closure receives the relay tunnel or the direct base URL,
    /// whichever the current mode selects (`Dual` already routes new work
    /// direct). Pending counters are maintained across every exit path,
    /// panics included, and the relay is torn down when the last drained
    /// request completes a hot swap.
    pub async fn execute_request<F, Fut, R>(&self, run: F) -> Result<R>
    where
        F: FnOnce(Option<Arc<RelayTunnel>>, Option<String>) -> Fut,
        Fut: std::future::Future<Output = Result<R>>,
    {
        let (tunnel, direct_url, kind) = {
            let mut inner = self.inner.lock().unwrap();
            let mode = inner.mode.ok_or(ClientError::NotInitialized)?;
            match mode {
                ConnectionMode::RelayOnly => {
                    let tunnel = inner
                        .tunnel
                        .clone()
                        .ok_or_else(|| ClientError::Unavailable("relay tunnel lost".into()))?;
                    inner.pending_relay += 1;
                    (Some(tunnel), None, TransportKind::Relay)
                }
                ConnectionMode::DirectOnly | ConnectionMode::Dual => {
                    let url = inner
                        .direct_url
                        .clone()
                        .ok_or_else(|| ClientError::Unavailable("no direct URL".into()))?;
                    inner.pending_direct += 1;
                    (None, Some(url), TransportKind::Direct)
                }
            }
        };
        self.publish();

        let _guard = PendingGuard { manager: self, kind };
        run(tunnel, direct_url).await
    }

    /// A direct URL answered while we were on the relay: route new requests
    /// direct, keep the tunnel until its pending requests drain.
    pub fn note_direct_available(&self, url: &str) {
        let closed_tunnel = {
            let mut inner = self.inner.lock().unwrap();
            inner.probe_failures = 0;
            inner.direct_url = Some(url.to_owned());
            match inner.mode {
                Some(ConnectionMode::RelayOnly) => {
                    if inner.pending_relay == 0 {
                        inner.mode = Some(ConnectionMode::DirectOnly);
                        inner.tunnel.take()
                    } else {
                        tracing::info!(
                            pending = inner.pending_relay,
                            "Direct path up; draining relay requests"
                        );
                        inner.mode = Some(ConnectionMode::Dual);
                        None
                    }
                }
                None => {
                    inner.mode = Some(ConnectionMode::DirectOnly);
                    None
                }
                _ => None,
            }
        };
        close_in_background(closed_tunnel);
        self.publish();
        self.persist_last("direct", url);
    }

    /// Record a failed probe round; the caller sleeps [`next_probe_delay`].
    pub fn record_probe_failure(&self) -> u32 {
        let failures = {
            let mut inner = self.inner.lock().unwrap();
            inner.probe_failures += 1;
            inner.probe_failures
        };
        self.publish();
        failures
    }

    /// Probe the known direct URLs once, in order.
    pub async fn probe_any_direct(&self) -> Option<String> {
        for url in self.candidate_direct_urls() {
            if self.probe_direct(&url).await {
                return Some(url);
            }
        }
        None
    }

    /// Background loop that upgrades `RelayOnly` to direct when possible.
    pub fn spawn_probe_loop(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                let (mode, failures) = {
                    let inner = manager.inner.lock().unwrap();
                    (inner.mode, inner.probe_failures)
                };
                if mode != Some(ConnectionMode::RelayOnly) {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    continue;
                }

                tokio::time::sleep(next_probe_delay(failures)).await;
                if manager.inner.lock().unwrap().mode != Some(ConnectionMode::RelayOnly) {
                    continue;
                }
                match manager.probe_any_direct().await {
                    Some(url) => manager.note_direct_available(&url),
                    None => {
                        let failures = manager.record_probe_failure();
                        tracing::debug!(failures, "Direct probe round failed");
                    }
                }
            }
        })
    }

    /// Bring the transport back if it degraded; used by retry loops between
    /// attempts.
    pub async fn ensure_connected(&self) -> Result<()> {
        enum Plan {
            Nothing,
            RelayReconnect,
            FullConnect,
        }

        let plan = {
            let inner = self.inner.lock().unwrap();
            match (inner.mode, &inner.tunnel) {
                (None, _) => Plan::FullConnect,
                (Some(ConnectionMode::RelayOnly), Some(tunnel)) if !tunnel.is_active() => {
                    Plan::RelayReconnect
                }
                (Some(ConnectionMode::RelayOnly), None) => Plan::RelayReconnect,
                _ => Plan::Nothing,
            }
        };

        match plan {
            Plan::Nothing => Ok(()),
            Plan::FullConnect => self.connect().await.map(|_| ()),
            Plan::RelayReconnect => {
                let (Some(relay_url), Some(instance_id)) =
                    (&self.config.relay_url, &self.config.instance_id)
                else {
                    return self.connect().await.map(|_| ());
                };
                match RelayTunnel::connect(relay_url, instance_id).await {
                    Ok(tunnel) => {
                        self.inner.lock().unwrap().tunnel = Some(Arc::new(tunnel));
                        self.publish();
                        Ok(())
                    }
                    Err(e) => {
                        tracing::warn!("Relay reconnect failed ({e}); full reconnect");
                        {
                            let mut inner = self.inner.lock().unwrap();
                            inner.mode = None;
                            inner.tunnel = None;
                        }
                        self.publish();
                        self.connect().await.map(|_| ())
                    }
                }
            }
        }
    }

    /// Tear everything down.
    pub async fn close(&self) {
        let tunnel = {
            let mut inner = self.inner.lock().unwrap();
            inner.mode = None;
            inner.direct_url = None;
            inner.tunnel.take()
        };
        if let Some(tunnel) = tunnel {
            tunnel.close().await;
        }
        self.publish();
    }

    /// The pinned HTTP client used for direct requests.
    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    fn candidate_direct_urls(&self) -> Vec<String> {
        let known = self.inner.lock().unwrap().known_direct_urls.clone();
        if known.is_empty() {
            self.config.direct_urls.clone()
        } else {
            known
        }
    }

    async fn probe_direct(&self, url: &str) -> bool {
        let timeout = self.config.direct_timeout.unwrap_or(DEFAULT_DIRECT_TIMEOUT);
        let probe = self
            .http
            .get(format!("{}/health", url.trim_end_matches('/')))
            .send();
        matches!(
            tokio::time::timeout(timeout, probe).await,
            Ok(Ok(response)) if response.status().is_success()
        )
    }

    fn publish(&self) {
        let inner = self.inner.lock().unwrap();
        self.state_tx.send_replace(ConnectionState {
            mode: inner.mode,
            direct_url: inner.direct_url.clone(),
            pending_relay: inner.pending_relay,
            pending_direct: inner.pending_direct,
            probe_failures: inner.probe_failures,
        });
    }

    fn persist_last(&self, kind: &str, url: &str) {
        if let Some(store) = &self.store {
            let _ = store.set_string(store::KEY_LAST_CONNECTION_TYPE, kind);
            let _ = store.set_string(store::KEY_LAST_CONNECTION_URL, url);
        }
    }
}

fn merge_urls(configured: &[String], advertised: &[String]) -> Vec<String> {
    let mut merged = configured.to_vec();
    for url in advertised {
        if !merged.contains(url) {
            merged.push(url.clone());
        }
    }
    merged
}

fn close_in_background(tunnel: Option<Arc<RelayTunnel>>) {
    if let Some(tunnel) = tunnel {
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move { tunnel.close().await });
        }
    }
}

/// Decrements the matching pending counter exactly once, on every exit path,
/// and completes a pending hot swap when the last relay request drains.
struct PendingGuard<'a> {
    manager: &'a ConnectionManager,
    kind: TransportKind,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        let closed_tunnel = {
            let mut inner = self.manager.inner.lock().unwrap();
            match self.kind {
                TransportKind::Relay => {
                    inner.pending_relay = inner.pending_relay.saturating_sub(1);
                }
                TransportKind::Direct => {
                    inner.pending_direct = inner.pending_direct.saturating_sub(1);
                }
            }
            if inner.mode == Some(ConnectionMode::Dual) && inner.pending_relay == 0 {
                tracing::info!("Relay drained; completing swap to direct");
                inner.mode = Some(ConnectionMode::DirectOnly);
                inner.tunnel.take()
            } else {
                None
            }
        };
        close_in_background(closed_tunnel);
        self.manager.publish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> Arc<ConnectionManager> {
        ConnectionManager::new(ConnectionConfig::default(), reqwest::Client::new(), None)
    }

    fn force_relay_only(manager: &ConnectionManager) {
        let mut inner = manager.inner.lock().unwrap();
        inner.mode = Some(ConnectionMode::RelayOnly);
        inner.tunnel = Some(RelayTunnel::disconnected_for_tests());
        drop(inner);
        manager.publish();
    }

    fn force_direct_only(manager: &ConnectionManager, url: &str) {
        let mut inner = manager.inner.lock().unwrap();
        inner.mode = Some(ConnectionMode::DirectOnly);
        inner.direct_url = Some(url.to_owned());
        drop(inner);
        manager.publish();
    }

    #[tokio::test]
    async fn execute_before_connect_is_not_initialized() {
        let manager = manager();
        let result = manager
            .execute_request(|_, _| async { Ok(()) })
            .await;
        assert!(matches!(result, Err(ClientError::NotInitialized)));
    }

    #[tokio::test]
    async fn relay_only_routes_through_tunnel() {
        let manager = manager();
        force_relay_only(&manager);

        manager
            .execute_request(|tunnel, direct| async move {
                assert!(tunnel.is_some());
                assert!(direct.is_none());
                Ok(())
            })
            .await
            .unwrap();

        let state = manager.state();
        assert_eq!(state.pending_relay, 0);
        assert_eq!(state.pending_direct, 0);
    }

    #[tokio::test]
    async fn direct_only_routes_through_url() {
        let manager = manager();
        force_direct_only(&manager, "https://media.example.org:8096");

        manager
            .execute_request(|tunnel, direct| async move {
                assert!(tunnel.is_none());
                assert_eq!(direct.as_deref(), Some("https://media.example.org:8096"));
                Ok(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn counters_recover_when_the_request_fails() {
        let manager = manager();
        force_direct_only(&manager, "https://media.example.org:8096");

        let result: Result<()> = manager
            .execute_request(|_, _| async {
                Err(ClientError::Api { status: 500, message: "boom".into() })
            })
            .await;
        assert!(result.is_err());
        assert_eq!(manager.state().pending_direct, 0);
    }

    #[tokio::test]
    async fn hot_swap_waits_for_relay_drain() {
        let manager = manager();
        force_relay_only(&manager);

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let in_flight = {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager
                    .execute_request(|tunnel, _| async move {
                        assert!(tunnel.is_some());
                        let _ = release_rx.await;
                        Ok(())
                    })
                    .await
            })
        };

        // Wait until the relay request is counted.
        let mut state_rx = manager.subscribe();
        while state_rx.borrow().pending_relay == 0 {
            state_rx.changed().await.unwrap();
        }

        // Direct comes up while the relay request is still in flight.
        manager.note_direct_available("https://media.example.org:8096");
        assert_eq!(manager.state().mode, Some(ConnectionMode::Dual));
        assert!(!manager.can_close_relay());

        // New requests already route direct.
        manager
            .execute_request(|tunnel, direct| async move {
                assert!(tunnel.is_none());
                assert!(direct.is_some());
                Ok(())
            })
            .await
            .unwrap();

        // Draining the last relay request completes the swap.
        release_tx.send(()).unwrap();
        in_flight.await.unwrap().unwrap();

        let state = manager.state();
        assert_eq!(state.mode, Some(ConnectionMode::DirectOnly));
        assert_eq!(state.pending_relay, 0);
        assert!(manager.can_close_relay());
    }

    #[tokio::test]
    async fn direct_while_idle_swaps_immediately() {
        let manager = manager();
        force_relay_only(&manager);

        manager.note_direct_available("https://media.example.org:8096");
        assert_eq!(manager.state().mode, Some(ConnectionMode::DirectOnly));
    }

    #[test]
    fn probe_backoff_schedule() {
        let expected = [5u64, 10, 30, 60, 300, 300, 300];
        for (count, secs) in expected.iter().enumerate() {
            assert_eq!(
                next_probe_delay(count as u32),
                Duration::from_secs(*secs),
                "failure count {count}"
            );
        }
    }

    #[tokio::test]
    async fn subscribers_see_current_state_immediately() {
        let manager = manager();
        force_direct_only(&manager, "https://media.example.org:8096");

        // Subscribed after the mode was set — still sees it.
        let rx = manager.subscribe();
        let state = rx.borrow().clone();
        assert_eq!(state.mode, Some(ConnectionMode::DirectOnly));
        assert_eq!(state.direct_url.as_deref(), Some("https://media.example.org:8096"));
    }

    #[tokio::test]
    async fn probe_failures_reset_on_success() {
        let manager = manager();
        force_relay_only(&manager);

        manager.record_probe_failure();
        manager.record_probe_failure();
        assert_eq!(manager.state().probe_failures, 2);

        manager.note_direct_available("https://media.example.org:8096");
        assert_eq!(manager.state().probe_failures, 0);
    }
}

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::time::{sleep, Instant};

use super::client::with_timeout;
use super::RemoteError;
use crate::common::{now_ms, TaskHandle};
use crate::config::NetworkConfig;

/// Lightweight check that the remote service itself answers.
#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
    async fn probe(&self) -> Result<(), RemoteError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectivityState {
    Unknown,
    Online,
    Offline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStrength {
    Strong,
    Weak,
    None,
}

/// Snapshot of what the monitor last observed. Times are milliseconds since
/// UNIX_EPOCH; `last_checked` is 0 before the first probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkState {
    pub is_online: bool,
    pub last_checked: u64,
    pub connection_strength: ConnectionStrength,
    pub last_successful_ping: Option<u64>,
}

pub type Listener = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Clone, Copy)]
enum Edge {
    Online,
    Offline,
}

struct MonitorInner {
    link_up: bool,
    probe_ok: bool,
    last_probe_at: Option<Instant>,
    state: ConnectivityState,
    network: NetworkState,
    initialized: bool,
    init_waiters: Vec<Box<dyn FnOnce() + Send>>,
    online_listeners: Vec<(ListenerId, Listener)>,
    offline_listeners: Vec<(ListenerId, Listener)>,
    next_listener_id: u64,
}

/// Tracks link status and active reachability of the remote service, and
/// notifies subscribers on online/offline edges.
///
/// The effective state is `Online` only while the link is up and the most
/// recent probe succeeded. Listeners run synchronously, in registration
/// order, on the task that observed the edge.
pub struct NetworkMonitor {
    inner: Mutex<MonitorInner>,
    probe: Arc<dyn ReachabilityProbe>,
    probe_interval: Duration,
    weak_latency: Duration,
    probe_timeout: Duration,
    init_lock: tokio::sync::Mutex<()>,
}

impl NetworkMonitor {
    pub fn new(
        probe: Arc<dyn ReachabilityProbe>,
        config: &NetworkConfig,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            inner: Mutex::new(MonitorInner {
                link_up: true,
                probe_ok: false,
                last_probe_at: None,
                state: ConnectivityState::Unknown,
                network: NetworkState {
                    is_online: true,
                    last_checked: 0,
                    connection_strength: ConnectionStrength::None,
                    last_successful_ping: None,
                },
                initialized: false,
                init_waiters: Vec::new(),
                online_listeners: Vec::new(),
                offline_listeners: Vec::new(),
                next_listener_id: 0,
            }),
            probe,
            probe_interval: config.probe_interval(),
            weak_latency: config.weak_latency(),
            probe_timeout,
            init_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MonitorInner> {
        // Listener panics never happen under the lock, so a poisoned mutex
        // still holds consistent state.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Raw link status as last reported by the platform.
    pub fn is_online(&self) -> bool {
        self.lock().link_up
    }

    pub fn state(&self) -> ConnectivityState {
        self.lock().state
    }

    pub fn network_state(&self) -> NetworkState {
        self.lock().network.clone()
    }

    pub fn is_initialized(&self) -> bool {
        self.lock().initialized
    }

    /// True when the link is up and the remote answered a probe. A success
    /// younger than the probe interval is reused; otherwise a fresh probe
    /// runs.
    pub async fn has_active_connection(&self) -> bool {
        {
            let inner = self.lock();
            if !inner.link_up {
                return false;
            }
            if inner.probe_ok {
                if let Some(at) = inner.last_probe_at {
                    if at.elapsed() < self.probe_interval {
                        return true;
                    }
                }
            }
        }
        self.check_now().await
    }

    /// Probe the remote immediately and publish any resulting edge.
    pub async fn check_now(&self) -> bool {
        if !self.is_online() {
            self.apply(false, None);
            return false;
        }

        let started = Instant::now();
        let result = with_timeout(self.probe_timeout, self.probe.probe()).await;
        let latency = started.elapsed();

        match result {
            Ok(()) => {
                self.apply(true, Some(latency));
                true
            }
            Err(e) => {
                log::debug!("Reachability probe failed: {e}");
                self.apply(false, None);
                false
            }
        }
    }

    /// Platform link-status event. Going up triggers a probe before the
    /// monitor reports `Online`.
    pub async fn handle_link_change(&self, up: bool) {
        {
            let mut inner = self.lock();
            inner.link_up = up;
            inner.network.is_online = up;
        }
        log::info!("Network link reported {}", if up { "up" } else { "down" });

        if up {
            self.check_now().await;
        } else {
            self.apply(false, None);
        }
    }

    /// Run the startup probe once. Callers waiting through
    /// [`on_initialized`](Self::on_initialized) are released afterwards.
    pub async fn init(&self) {
        let _guard = self.init_lock.lock().await;
        if self.is_initialized() {
            return;
        }

        let reachable = self.check_now().await;
        log::info!(
            "Network monitor initialized ({})",
            if reachable { "online" } else { "offline" }
        );

        let waiters = {
            let mut inner = self.lock();
            inner.initialized = true;
            std::mem::take(&mut inner.init_waiters)
        };
        for waiter in waiters {
            waiter();
        }
    }

    /// Run `callback` once the startup probe has completed; immediately if it
    /// already has.
    pub fn on_initialized<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut inner = self.lock();
        if inner.initialized {
            drop(inner);
            callback();
        } else {
            inner.init_waiters.push(Box::new(callback));
        }
    }

    pub fn add_online_listener<F>(&self, callback: F) -> ListenerId
    where
        F: Fn() + Send + Sync + 'static,
    {
        let mut inner = self.lock();
        let id = ListenerId(inner.next_listener_id);
        inner.next_listener_id += 1;
        inner.online_listeners.push((id, Arc::new(callback)));
        id
    }

    pub fn add_offline_listener<F>(&self, callback: F) -> ListenerId
    where
        F: Fn() + Send + Sync + 'static,
    {
        let mut inner = self.lock();
        let id = ListenerId(inner.next_listener_id);
        inner.next_listener_id += 1;
        inner.offline_listeners.push((id, Arc::new(callback)));
        id
    }

    pub fn remove_online_listener(&self, id: ListenerId) -> bool {
        let mut inner = self.lock();
        let before = inner.online_listeners.len();
        inner.online_listeners.retain(|(lid, _)| *lid != id);
        inner.online_listeners.len() != before
    }

    pub fn remove_offline_listener(&self, id: ListenerId) -> bool {
        let mut inner = self.lock();
        let before = inner.offline_listeners.len();
        inner.offline_listeners.retain(|(lid, _)| *lid != id);
        inner.offline_listeners.len() != before
    }

    /// Spawn the periodic probe. Dropping the returned handle stops it.
    pub fn start(self: &Arc<Self>) -> TaskHandle {
        let weak = Arc::downgrade(self);
        let interval = self.probe_interval;

        TaskHandle::spawn("network-probe", async move {
            loop {
                sleep(interval).await;
                let Some(monitor) = weak.upgrade() else {
                    break;
                };
                if monitor.is_online() {
                    monitor.check_now().await;
                }
            }
        })
    }

    fn apply(&self, probe_ok: bool, latency: Option<Duration>) {
        let (edge, listeners) = {
            let mut inner = self.lock();
            let now = now_ms();

            inner.probe_ok = probe_ok;
            inner.network.last_checked = now;
            if probe_ok {
                inner.last_probe_at = Some(Instant::now());
                inner.network.last_successful_ping = Some(now);
            }
            inner.network.connection_strength = match latency {
                Some(l) if probe_ok && inner.link_up && l <= self.weak_latency => {
                    ConnectionStrength::Strong
                }
                Some(_) if probe_ok && inner.link_up => ConnectionStrength::Weak,
                _ => ConnectionStrength::None,
            };

            let next = if inner.link_up && probe_ok {
                ConnectivityState::Online
            } else {
                ConnectivityState::Offline
            };
            if next == inner.state {
                return;
            }
            inner.state = next;

            let (edge, registered) = match next {
                ConnectivityState::Online => (Edge::Online, &inner.online_listeners),
                _ => (Edge::Offline, &inner.offline_listeners),
            };
            let listeners: Vec<Listener> = registered.iter().map(|(_, l)| Arc::clone(l)).collect();
            (edge, listeners)
        };

        match edge {
            Edge::Online => log::info!("Remote reachable; notifying {} listeners", listeners.len()),
            Edge::Offline => log::warn!("Remote unreachable; notifying {} listeners", listeners.len()),
        }
        for listener in listeners {
            listener();
        }
    }
}

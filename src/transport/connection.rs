//! Owned base station link with a single operation lock.
//!
//! [`ConnectionManager`] replaces ambient "current base station" state:
//! the transport, its connected flag and the negotiated capabilities all
//! live behind one async mutex, which doubles as the hardware operation
//! lock. A small lock-free mirror lets health checks read link state
//! without queueing behind a long download.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, MutexGuard};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{Capabilities, Transport, TransportError};
use crate::config::ConnectionConfig;

/// Link state readable without the operation lock. Written only while it is held.
#[derive(Debug, Default)]
struct LinkMirror {
    connected: AtomicBool,
    last_ping_ok: parking_lot::Mutex<Option<Instant>>,
    capabilities: parking_lot::Mutex<Option<Capabilities>>,
}

struct Link<T> {
    transport: T,
    connected: bool,
    capabilities: Option<Capabilities>,
    last_connect_attempt: Option<Instant>,
}

/// Single owner of the base station transport.
pub struct ConnectionManager<T: Transport> {
    link: Mutex<Link<T>>,
    mirror: LinkMirror,
    cfg: ConnectionConfig,
}

impl<T: Transport> ConnectionManager<T> {
    pub fn new(transport: T, cfg: ConnectionConfig) -> Self {
        Self {
            link: Mutex::new(Link {
                transport,
                connected: false,
                capabilities: None,
                last_connect_attempt: None,
            }),
            mirror: LinkMirror::default(),
            cfg,
        }
    }

    /// Acquire the hardware operation lock.
    pub async fn lock(&self) -> OpGuard<'_, T> {
        OpGuard {
            link: self.link.lock().await,
            mirror: &self.mirror,
            cfg: &self.cfg,
        }
    }

    /// Ensure the link is up, connecting if needed.
    pub async fn connect(&self) -> Result<Capabilities, TransportError> {
        self.lock().await.ensure_connected().await
    }

    /// Tear the link down.
    pub async fn disconnect(&self) {
        let mut guard = self.lock().await;
        guard.mark_disconnected();
        guard.link.transport.disconnect();
    }

    /// Ping the device now, ignoring the ping TTL.
    pub async fn ping(&self) -> Result<bool, TransportError> {
        let mut guard = self.lock().await;
        if !guard.link.connected {
            return Err(TransportError::Disconnected);
        }
        guard.ping_now().await
    }

    /// Whether the link is currently marked connected.
    pub fn is_connected(&self) -> bool {
        self.mirror.connected.load(Ordering::Acquire)
    }

    /// Connected and the last good ping is within the TTL.
    pub fn is_healthy(&self) -> bool {
        self.is_connected()
            && self
                .last_ping_age()
                .is_some_and(|age| age <= self.cfg.ping_ttl)
    }

    /// Time since the last successful ping.
    pub fn last_ping_age(&self) -> Option<Duration> {
        let last = *self.mirror.last_ping_ok.lock();
        last.map(|at| Instant::now().saturating_duration_since(at))
    }

    /// Capabilities negotiated for the current session.
    pub fn capabilities(&self) -> Option<Capabilities> {
        self.mirror.capabilities.lock().clone()
    }

    pub fn ping_ttl(&self) -> Duration {
        self.cfg.ping_ttl
    }
}

/// Exclusive access to the link while the operation lock is held.
pub struct OpGuard<'a, T: Transport> {
    link: MutexGuard<'a, Link<T>>,
    mirror: &'a LinkMirror,
    cfg: &'a ConnectionConfig,
}

impl<T: Transport> OpGuard<'_, T> {
    /// Returns the cached session capabilities, connecting first if needed.
    ///
    /// A connected link is trusted for `ping_ttl` after the last good ping;
    /// past that it is pinged and dropped if the ping fails. Fresh connection
    /// attempts are spaced by `connect_min_interval`.
    pub async fn ensure_connected(&mut self) -> Result<Capabilities, TransportError> {
        if self.link.connected {
            let last_ping = *self.mirror.last_ping_ok.lock();
            let fresh = last_ping.is_some_and(|at| at.elapsed() <= self.cfg.ping_ttl);
            if fresh {
                if let Some(caps) = &self.link.capabilities {
                    return Ok(caps.clone());
                }
            }

            match self.ping_now().await {
                Ok(true) => {
                    if let Some(caps) = &self.link.capabilities {
                        return Ok(caps.clone());
                    }
                }
                Ok(false) => warn!("runtime ping failed, reconnecting"),
                Err(e) => warn!(error = %e, "runtime ping failed, reconnecting"),
            }
            self.mark_disconnected();
        }

        let now = Instant::now();
        if let Some(last) = self.link.last_connect_attempt {
            if now.saturating_duration_since(last) < self.cfg.connect_min_interval {
                return Err(TransportError::Throttled);
            }
        }
        self.link.last_connect_attempt = Some(now);

        let name = self.link.transport.name().to_string();
        debug!(transport = %name, "connecting base station");

        let device = self.link.transport.connect().await?;
        if !self.link.transport.ping().await? {
            self.link.transport.disconnect();
            return Err(TransportError::PingFailed);
        }

        let caps = Capabilities::negotiate(&device);
        info!(
            transport = %name,
            model = %device.model,
            firmware = %device.firmware,
            decoders = caps.decoders.len(),
            "base station connected",
        );

        self.link.connected = true;
        self.link.capabilities = Some(caps.clone());
        self.mirror.connected.store(true, Ordering::Release);
        *self.mirror.capabilities.lock() = Some(caps.clone());
        *self.mirror.last_ping_ok.lock() = Some(Instant::now());

        Ok(caps)
    }

    /// Drop the connection so the next operation reconnects.
    pub fn mark_disconnected(&mut self) {
        if self.link.connected {
            debug!("base station marked disconnected");
        }
        self.link.connected = false;
        self.link.capabilities = None;
        self.mirror.connected.store(false, Ordering::Release);
        *self.mirror.last_ping_ok.lock() = None;
        *self.mirror.capabilities.lock() = None;
    }

    pub fn is_connected(&self) -> bool {
        self.link.connected
    }

    pub fn capabilities(&self) -> Option<&Capabilities> {
        self.link.capabilities.as_ref()
    }

    /// The underlying transport. Only meaningful once connected.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.link.transport
    }

    async fn ping_now(&mut self) -> Result<bool, TransportError> {
        let ok = self.link.transport.ping().await?;
        if ok {
            *self.mirror.last_ping_ok.lock() = Some(Instant::now());
        }
        Ok(ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimulatedConfig;
    use crate::transport::simulated::SimulatedBaseStation;

    fn fast_cfg() -> ConnectionConfig {
        ConnectionConfig {
            ping_ttl: Duration::from_secs(10),
            connect_min_interval: Duration::ZERO,
            ping_interval: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn test_connect_negotiates_and_caches() {
        let station = SimulatedBaseStation::new(SimulatedConfig::default());
        let mgr = ConnectionManager::new(station, fast_cfg());

        assert!(!mgr.is_connected());
        let caps = mgr.connect().await.expect("connect");
        assert!(mgr.is_connected());
        assert!(mgr.is_healthy());
        assert_eq!(mgr.capabilities(), Some(caps.clone()));

        // Second call is served from the cache.
        let again = mgr.connect().await.expect("cached connect");
        assert_eq!(again, caps);
        assert_eq!(mgr.lock().await.transport_mut().connect_calls(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_clears_state() {
        let station = SimulatedBaseStation::new(SimulatedConfig::default());
        let mgr = ConnectionManager::new(station, fast_cfg());
        mgr.connect().await.expect("connect");

        mgr.disconnect().await;
        assert!(!mgr.is_connected());
        assert!(!mgr.is_healthy());
        assert!(mgr.capabilities().is_none());
        assert!(mgr.last_ping_age().is_none());
    }

    #[tokio::test]
    async fn test_connect_failure_propagates() {
        let mut station = SimulatedBaseStation::new(SimulatedConfig::default());
        station.fail_next_connects(1);
        let mgr = ConnectionManager::new(station, fast_cfg());

        let err = mgr.connect().await.expect_err("first connect fails");
        assert!(matches!(err, TransportError::Link(_)));
        assert!(!mgr.is_connected());

        mgr.connect().await.expect("second connect succeeds");
        assert!(mgr.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_attempts_are_throttled() {
        let mut station = SimulatedBaseStation::new(SimulatedConfig::default());
        station.fail_next_connects(1);
        let cfg = ConnectionConfig {
            connect_min_interval: Duration::from_secs(2),
            ..fast_cfg()
        };
        let mgr = ConnectionManager::new(station, cfg);

        mgr.connect().await.expect_err("injected failure");
        let err = mgr.connect().await.expect_err("throttled");
        assert_eq!(err, TransportError::Throttled);

        tokio::time::advance(Duration::from_secs(2)).await;
        mgr.connect().await.expect("connect after interval");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_link_is_repinged() {
        let station = SimulatedBaseStation::new(SimulatedConfig::default());
        let mgr = ConnectionManager::new(station, fast_cfg());
        mgr.connect().await.expect("connect");

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(!mgr.is_healthy());

        mgr.connect().await.expect("reping");
        assert!(mgr.is_healthy());
        assert_eq!(mgr.lock().await.transport_mut().connect_calls(), 1);
    }

    #[tokio::test]
    async fn test_ping_requires_connection() {
        let station = SimulatedBaseStation::new(SimulatedConfig::default());
        let mgr = ConnectionManager::new(station, fast_cfg());
        assert_eq!(mgr.ping().await, Err(TransportError::Disconnected));

        mgr.connect().await.expect("connect");
        assert_eq!(mgr.ping().await, Ok(true));
    }
}

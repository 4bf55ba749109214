// peer.rs -- reliable-ordered UDP peer, for profiles >= Gen5.
//
// Grounded on the hgaiser-moonshine control-stream module, which opens a
// `rusty_enet::Host<UdpSocket>` with a single peer/channel and drives it
// from a service loop. Here the host is wrapped behind a single mutex (the
// "enetMutex") so the Control Session's receive and send-side
// workers can share one peer without racing the underlying socket.

use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rusty_enet as enet;
use streamctl_proto::error::{CoreError, CoreResult};

/// How often the internal poll loop re-checks the host while waiting out a
/// `service(timeout)` call. ENet hosts don't block on their own; this is the
/// granularity at which we approximate a blocking service-with-timeout.
const POLL_GRANULARITY: Duration = Duration::from_millis(1);

#[derive(Debug)]
pub enum PeerEvent {
    Connect,
    Disconnect,
    Receive(Vec<u8>),
    NoEvent,
}

struct Inner {
    host: enet::Host<UdpSocket>,
}

/// Reliable-ordered UDP peer transport: one outgoing peer, one channel.
///
/// Implements the disconnect-intercept workaround: while
/// `intercept_installed` is set, a Disconnect event is suppressed and
/// recorded in `disconnect_pending` instead of being returned from
/// `service`, so the caller can drain any already-buffered data first.
pub struct PeerTransport {
    inner: Mutex<Inner>,
    intercept_installed: AtomicBool,
    disconnect_pending: AtomicBool,
}

impl PeerTransport {
    /// Bind an ephemeral local UDP socket and connect to `addr` (peer
    /// connect, at most a 10 s connect timeout, 10 s idle timeout).
    pub fn connect(addr: SocketAddr, connect_timeout: Duration, idle_timeout: Duration) -> CoreResult<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", 0))
            .map_err(|e| CoreError::TransportFail(format!("udp bind: {e}")))?;

        let mut host = enet::Host::new(
            socket,
            enet::HostSettings {
                peer_limit: 1,
                channel_limit: 1,
                ..Default::default()
            },
        )
        .map_err(|e| CoreError::TransportFail(format!("enet host init: {e:?}")))?;

        host.connect(addr, 1, 0)
            .map_err(|e| CoreError::TransportFail(format!("enet connect: {e:?}")))?;

        let deadline = Instant::now() + connect_timeout;
        loop {
            let event = host
                .service()
                .map_err(|e| CoreError::TransportFail(format!("enet service: {e:?}")))?;
            match event {
                Some(enet::Event::Connect { peer, .. }) => {
                    peer.set_timeout(
                        idle_timeout.as_millis() as u32,
                        idle_timeout.as_millis() as u32,
                        idle_timeout.as_millis() as u32,
                    );
                    tracing::debug!(%addr, "peer connected");
                    break;
                }
                Some(enet::Event::Disconnect { .. }) => {
                    tracing::warn!(%addr, "peer rejected connection");
                    return Err(CoreError::TransportFail("peer rejected connection".into()));
                }
                _ => {}
            }
            if Instant::now() >= deadline {
                return Err(CoreError::Timeout(connect_timeout));
            }
            std::thread::sleep(POLL_GRANULARITY);
        }

        Ok(Self {
            inner: Mutex::new(Inner { host }),
            intercept_installed: AtomicBool::new(true),
            disconnect_pending: AtomicBool::new(false),
        })
    }

    /// True once a Disconnect event has been intercepted and suppressed;
    /// stays true until the caller observes it and moves on to draining.
    pub fn disconnect_pending(&self) -> bool {
        self.disconnect_pending.load(Ordering::SeqCst)
    }

    pub fn clear_disconnect_pending(&self) {
        self.disconnect_pending.store(false, Ordering::SeqCst);
    }

    /// Stop intercepting Disconnect events: the next one is delivered
    /// through `service` as `PeerEvent::Disconnect`.
    pub fn clear_intercept(&self) {
        self.intercept_installed.store(false, Ordering::SeqCst);
    }

    /// Poll-service the peer for up to `timeout`, returning the first event
    /// observed or `NoEvent` if none arrived in time. Holds the adapter
    /// mutex for the whole call, so sends and receives never interleave.
    pub fn service(&self, timeout: Duration) -> CoreResult<PeerEvent> {
        let mut guard = self.inner.lock();
        let deadline = Instant::now() + timeout;

        loop {
            let event = guard
                .host
                .service()
                .map_err(|e| CoreError::TransportFail(format!("enet service: {e:?}")))?;

            match event {
                Some(enet::Event::Connect { .. }) => return Ok(PeerEvent::Connect),
                Some(enet::Event::Disconnect { .. }) => {
                    if self.intercept_installed.load(Ordering::SeqCst) {
                        self.disconnect_pending.store(true, Ordering::SeqCst);
                    } else {
                        return Ok(PeerEvent::Disconnect);
                    }
                }
                Some(enet::Event::Receive { packet, .. }) => {
                    return Ok(PeerEvent::Receive(packet.data().to_vec()));
                }
                None => {}
            }

            if Instant::now() >= deadline {
                return Ok(PeerEvent::NoEvent);
            }
            std::thread::sleep(POLL_GRANULARITY.min(timeout));
        }
    }

    /// Send a reliable, ordered message to the connected peer.
    pub fn send_reliable(&self, bytes: &[u8]) -> CoreResult<()> {
        let mut guard = self.inner.lock();
        let host = &mut guard.host;
        let mut sent = false;
        for peer in host.connected_peers_mut() {
            peer.send(0, &enet::Packet::reliable(bytes))
                .map_err(|e| CoreError::TransportFail(format!("peer send: {e:?}")))?;
            sent = true;
        }
        if !sent {
            return Err(CoreError::TransportFail("no connected peer".into()));
        }
        Ok(())
    }

    /// Flush queued outgoing packets immediately rather than waiting for the
    /// next service tick.
    pub fn flush(&self) {
        self.inner.lock().host.flush();
    }

    /// Disconnect the peer without waiting for acknowledgment: the server
    /// should see termination promptly.
    pub fn disconnect_now(&self) {
        tracing::debug!("disconnecting peer");
        let mut guard = self.inner.lock();
        for peer in guard.host.connected_peers_mut() {
            peer.disconnect(0);
        }
    }

    pub fn requires_reply_drain(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_to_nothing_times_out() {
        // Port 1 is reserved and nothing should be listening for ENet there.
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let result = PeerTransport::connect(addr, Duration::from_millis(150), Duration::from_secs(10));
        assert!(result.is_err());
    }
}

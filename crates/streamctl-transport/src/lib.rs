//! Transport Adapter: TCP stream framing (profiles < Gen5) and the
//! reliable-ordered UDP peer (profiles >= Gen5), behind one send/recv
//! surface. No encryption here -- that's `streamctl-proto::codec`'s job.

pub mod peer;
pub mod tcp;

pub use peer::{PeerEvent, PeerTransport};
pub use tcp::TcpTransport;

use std::time::Duration;

/// Legacy control port (TCP, profiles < Gen5).
pub const PORT_CONTROL_LEGACY: u16 = 47995;
/// Legacy input port (TCP, profiles < Gen5).
pub const PORT_INPUT_LEGACY: u16 = 35043;
/// Reliable-UDP control and unified-input port (profiles >= Gen5).
pub const PORT_CONTROL_PEER: u16 = 47999;

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Unifies the two transport modes behind the one capability callers
/// actually need to branch on. Modeled as an enum, not a trait object: the
/// two modes have genuinely different send/recv shapes (TCP frames and
/// reads a reply itself; the peer only knows how to send already-framed
/// bytes), so the Control Session matches on this directly rather than
/// going through a shared send method. `requires_reply_drain` exists
/// because only TCP needs its reply read and discarded after a handshake
/// send; the peer transport never does.
pub enum Transport {
    Tcp(TcpTransport),
    Peer(PeerTransport),
}

impl Transport {
    pub fn requires_reply_drain(&self) -> bool {
        match self {
            Transport::Tcp(t) => t.requires_reply_drain(),
            Transport::Peer(p) => p.requires_reply_drain(),
        }
    }
}

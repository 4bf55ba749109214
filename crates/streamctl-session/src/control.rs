// control.rs -- the Control Session state machine: handshake, telemetry,
// invalidation dispatch, and teardown, spread across three cooperating
// worker threads guarded by one adapter mutex (the "enetMutex").
//
// Converted in spirit from myq2-client's net_chan.rs/cl_main.rs worker
// lifecycle (spawn, interruptible wait, join-before-teardown) but rebuilt
// entirely around this protocol's handshake/telemetry/invalidation split.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;

use streamctl_proto::codec::GcmFrameCodec;
use streamctl_proto::error::{CoreError, CoreResult};
use streamctl_proto::profile::{profile_for, MessageIndex, Profile};
use streamctl_proto::quality::ConnectionQualityMonitor;
use streamctl_transport::peer::PeerEvent;
use streamctl_transport::{PeerTransport, TcpTransport, Transport, CONNECT_TIMEOUT, IDLE_TIMEOUT, PORT_CONTROL_LEGACY, PORT_CONTROL_PEER};

use crate::config::{Listener, SessionConfig, TerminationReason};

const RECEIVE_IDLE_SLEEP: Duration = Duration::from_millis(10);
const DISCONNECT_DRAIN_TIMEOUT: Duration = Duration::from_millis(100);
const DISCONNECT_FINAL_WAIT: Duration = Duration::from_secs(1);
const PERIODIC_PING_INTERVAL: Duration = Duration::from_millis(250);
const LOSS_STATS_INTERVAL: Duration = Duration::from_millis(50);

const HRESULT_GRACEFUL_CLOSE: u32 = 0x8003_0023;
const HRESULT_PROTECTED_CONTENT: u32 = 0x800e_9302;
const LEGACY_GRACEFUL_REASON: u16 = 0x0100;

/// `-1`: the distinguished "connection died, no further detail" code used
/// for service errors and disconnect-drain timeouts.
const TERMINATED_UNKNOWN: TerminationReason = TerminationReason::Code(-1);

/// Guards the reliable-UDP peer (or TCP stream) and the outgoing GCM
/// sequence counter together: the "enetMutex". Holding it excludes every
/// other send and receive on the adapter.
struct AdapterState {
    transport: Transport,
    seq: u32,
}

/// Three-worker control-channel state machine. Constructed only through
/// [`ControlSession::connect`], which performs the full startup sequence
/// and rolls back cleanly on any failure.
pub struct ControlSession {
    profile: Profile,
    codec: GcmFrameCodec,
    quality: Arc<ConnectionQualityMonitor>,
    listener: Arc<dyn Listener>,
    adapter: Mutex<AdapterState>,
    stop_tx: Mutex<Option<Sender<()>>>,
    stop_rx: Receiver<()>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    terminated: AtomicBool,
}

fn frame_plaintext_v1(msg_type: u16, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&msg_type.to_le_bytes());
    frame.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    frame.extend_from_slice(payload);
    frame
}

fn parse_v1_frame(bytes: &[u8]) -> CoreResult<(u16, Vec<u8>)> {
    if bytes.len() < 4 {
        return Err(CoreError::Runt { got: bytes.len(), want: 4 });
    }
    let msg_type = u16::from_le_bytes([bytes[0], bytes[1]]);
    let len = u16::from_le_bytes([bytes[2], bytes[3]]) as usize;
    if bytes.len() < 4 + len {
        return Err(CoreError::Runt { got: bytes.len(), want: 4 + len });
    }
    Ok((msg_type, bytes[4..4 + len].to_vec()))
}

/// Maps a raw Termination payload to a distinguished reason via the
/// HRESULT/legacy-reason table.
fn map_termination(payload: &[u8], any_frame_seen: bool) -> TerminationReason {
    if payload.len() >= 6 {
        let hresult = u32::from_be_bytes(payload[0..4].try_into().unwrap());
        match hresult {
            HRESULT_GRACEFUL_CLOSE => graceful_or_early(any_frame_seen),
            HRESULT_PROTECTED_CONTENT => TerminationReason::ProtectedContent,
            other => TerminationReason::Code(other as i64),
        }
    } else {
        let reason = if payload.len() >= 2 {
            u16::from_le_bytes([payload[0], payload[1]])
        } else {
            0
        };
        match reason {
            LEGACY_GRACEFUL_REASON => graceful_or_early(any_frame_seen),
            other => TerminationReason::Code(other as i64),
        }
    }
}

fn graceful_or_early(any_frame_seen: bool) -> TerminationReason {
    if any_frame_seen {
        TerminationReason::GracefulTermination
    } else {
        TerminationReason::UnexpectedEarlyTermination
    }
}

impl ControlSession {
    /// Full startup sequence: open the transport, start the receive
    /// worker, handshake Start A / Start B, then start telemetry and
    /// invalidation. Any failure unwinds everything started so far.
    pub fn connect(config: SessionConfig, quality: Arc<ConnectionQualityMonitor>) -> CoreResult<Arc<Self>> {
        let profile = profile_for(config.version);
        let codec = GcmFrameCodec::new(config.key);

        let transport = Self::open_transport(&profile, config.remote_address)?;
        let (stop_tx, stop_rx) = bounded(0);

        let session = Arc::new(ControlSession {
            profile,
            codec,
            quality,
            listener: config.listener,
            adapter: Mutex::new(AdapterState { transport, seq: 0 }),
            stop_tx: Mutex::new(Some(stop_tx)),
            stop_rx,
            workers: Mutex::new(Vec::new()),
            terminated: AtomicBool::new(false),
        });

        // Step 2: receive worker starts before handshake, so a reply
        // arriving on the peer transport is observed immediately.
        let receive_handle = session.clone().spawn_receive_worker();
        session.workers.lock().push(receive_handle);

        if let Err(e) = session.handshake() {
            session.stop_workers_started_so_far();
            return Err(e);
        }

        let telemetry_handle = session.clone().spawn_telemetry_worker();
        let invalidation_handle = session.clone().spawn_invalidation_worker();
        {
            let mut workers = session.workers.lock();
            workers.push(telemetry_handle);
            workers.push(invalidation_handle);
        }

        Ok(session)
    }

    fn open_transport(profile: &Profile, remote: IpAddr) -> CoreResult<Transport> {
        if profile.flags.uses_enet {
            let addr = SocketAddr::new(remote, PORT_CONTROL_PEER);
            let peer = PeerTransport::connect(addr, CONNECT_TIMEOUT, IDLE_TIMEOUT)?;
            Ok(Transport::Peer(peer))
        } else {
            let addr = SocketAddr::new(remote, PORT_CONTROL_LEGACY);
            let tcp = TcpTransport::connect(addr, CONNECT_TIMEOUT)?;
            Ok(Transport::Tcp(tcp))
        }
    }

    fn handshake(&self) -> CoreResult<()> {
        let start_a = self.profile.preconstructed(MessageIndex::StartA).unwrap_or(&[]);
        let start_a_code = self.profile.code(MessageIndex::StartA).expect("StartA always present");
        self.send_and_discard_reply(start_a_code, start_a)?;

        let start_b = self.profile.preconstructed(MessageIndex::StartB).unwrap_or(&[]);
        let start_b_code = self.profile.code(MessageIndex::StartB).expect("StartB always present");
        self.send_and_discard_reply(start_b_code, start_b)?;

        Ok(())
    }

    fn stop_workers_started_so_far(&self) {
        *self.stop_tx.lock() = None; // closes the channel, waking every waiter
        for handle in self.workers.lock().drain(..) {
            let _ = handle.join();
        }
        let adapter = self.adapter.lock();
        if let Transport::Peer(p) = &adapter.transport {
            // `disconnect_now` only queues the disconnect; flush so the
            // server sees it immediately rather than on the next service tick.
            p.disconnect_now();
            p.flush();
        }
    }

    /// Encode and send one control message, honoring `encrypted_control_stream`.
    /// Holds `adapter` for the full assign-seq + encrypt + send critical
    /// section, so sequence numbers land on the wire in allocation order.
    fn send_control(&self, msg_type: u16, payload: &[u8], discard_reply: bool) -> CoreResult<()> {
        let mut adapter = self.adapter.lock();
        if self.profile.flags.encrypted_control_stream {
            let seq = adapter.seq;
            adapter.seq = adapter.seq.wrapping_add(1);
            let frame = self.codec.encrypt(seq, msg_type, payload)?;
            match &mut adapter.transport {
                Transport::Peer(p) => p.send_reliable(&frame),
                Transport::Tcp(_) => unreachable!("encrypted control stream only exists on peer profiles"),
            }
        } else {
            match &mut adapter.transport {
                Transport::Tcp(t) => {
                    if discard_reply {
                        t.send_and_drain_reply(msg_type, payload)
                    } else {
                        t.send(msg_type, payload)
                    }
                }
                Transport::Peer(p) => p.send_reliable(&frame_plaintext_v1(msg_type, payload)),
            }
        }
    }

    fn send_and_discard_reply(&self, msg_type: u16, payload: &[u8]) -> CoreResult<()> {
        self.send_control(msg_type, payload, true)
    }

    fn send_fire_and_forget(&self, msg_type: u16, payload: &[u8]) -> CoreResult<()> {
        self.send_control(msg_type, payload, false)
    }

    /// Route for the Input Pipeline's unified-control-stream mode:
    /// plaintext input bytes, GCM-wrapped here exactly like any other
    /// control message.
    pub fn send_input_data(&self, payload: &[u8]) -> CoreResult<()> {
        let code = self.profile.code(MessageIndex::InputData).expect("InputData always present");
        self.send_fire_and_forget(code, payload)
    }

    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    /// Relay already-framed, already-encrypted bytes over the control
    /// peer's reliable channel, bypassing the Codec entirely. Used by the
    /// Input Pipeline's Gen5/Gen6/Gen7 non-unified routes, which frame and
    /// encrypt with their own dedicated ciphers before handing bytes here.
    pub fn send_raw_reliable(&self, bytes: &[u8]) -> CoreResult<()> {
        let adapter = self.adapter.lock();
        match &adapter.transport {
            Transport::Peer(p) => p.send_reliable(bytes),
            Transport::Tcp(_) => Err(CoreError::TransportFail("raw reliable relay requires the peer transport".into())),
        }
    }

    fn notify_terminated(&self, reason: TerminationReason) {
        // `connectionTerminated` fires at most once per session: once it
        // fires, the session is terminal.
        if !self.terminated.swap(true, Ordering::SeqCst) {
            self.listener.connection_terminated(reason);
        }
    }

    /// Full shutdown sequence: signal, join, disconnect, close.
    pub fn shutdown(&self) {
        *self.stop_tx.lock() = None;
        self.quality.invalidation_queue().request_idr_on_demand(); // wakes the invalidation worker if it's parked

        for handle in self.workers.lock().drain(..) {
            let _ = handle.join();
        }

        let adapter = self.adapter.lock();
        if let Transport::Peer(p) = &adapter.transport {
            p.disconnect_now();
            p.flush();
        }
    }

    fn is_stopping(&self) -> bool {
        self.stop_tx.lock().is_none()
    }

    fn spawn_receive_worker(self: Arc<Self>) -> JoinHandle<()> {
        thread::spawn(move || self.receive_worker())
    }

    fn receive_worker(self: Arc<Self>) {
        // TCP-mode control has no continuous receive activity; the
        // handshake's reply reads are synchronous and the worker returns
        // immediately.
        if !self.profile.flags.uses_enet {
            return;
        }

        loop {
            if self.is_stopping() {
                return;
            }

            let event = {
                let adapter = self.adapter.lock();
                match &adapter.transport {
                    Transport::Peer(p) => p.service(Duration::ZERO),
                    Transport::Tcp(_) => unreachable!(),
                }
            };

            let event = match event {
                Ok(e) => e,
                Err(e) => {
                    tracing::warn!(error = %e, "receive worker: transport failure");
                    self.notify_terminated(TERMINATED_UNKNOWN);
                    return;
                }
            };

            let peer_disconnect_pending = match &self.adapter.lock().transport {
                Transport::Peer(p) => p.disconnect_pending(),
                Transport::Tcp(_) => false,
            };

            match event {
                PeerEvent::Receive(bytes) => {
                    if self.dispatch_received(&bytes) {
                        return; // a Termination message ends the worker immediately
                    }
                }
                PeerEvent::Connect => {}
                PeerEvent::Disconnect => {
                    self.notify_terminated(TERMINATED_UNKNOWN);
                    return;
                }
                PeerEvent::NoEvent if !peer_disconnect_pending => {
                    crossbeam::channel::select! {
                        recv(crossbeam::channel::after(RECEIVE_IDLE_SLEEP)) -> _ => {},
                        recv(self.stop_rx) -> _ => return,
                    }
                }
                PeerEvent::NoEvent => {
                    if self.drain_after_disconnect_pending() {
                        return;
                    }
                }
            }
        }
    }

    /// The disconnect-drain sequence: first a short drain with the
    /// intercept still installed, then clear the intercept and wait out
    /// the long timeout. Returns `true` if the worker should exit.
    fn drain_after_disconnect_pending(&self) -> bool {
        let drained = {
            let adapter = self.adapter.lock();
            match &adapter.transport {
                Transport::Peer(p) => p.service(DISCONNECT_DRAIN_TIMEOUT),
                Transport::Tcp(_) => unreachable!(),
            }
        };
        if let Ok(PeerEvent::Receive(bytes)) = drained {
            if let Transport::Peer(p) = &self.adapter.lock().transport {
                p.clear_disconnect_pending();
            }
            return self.dispatch_received(&bytes);
        }

        if let Transport::Peer(p) = &self.adapter.lock().transport {
            p.clear_intercept();
        }
        let final_wait = {
            let adapter = self.adapter.lock();
            match &adapter.transport {
                Transport::Peer(p) => p.service(DISCONNECT_FINAL_WAIT),
                Transport::Tcp(_) => unreachable!(),
            }
        };
        match final_wait {
            Ok(PeerEvent::Receive(bytes)) => {
                if let Transport::Peer(p) = &self.adapter.lock().transport {
                    p.clear_disconnect_pending();
                }
                self.dispatch_received(&bytes)
            }
            _ => {
                self.notify_terminated(TERMINATED_UNKNOWN);
                true
            }
        }
    }

    /// Decrypts/parses and dispatches one raw received frame. Returns
    /// `true` if this was a Termination message (the worker must exit).
    fn dispatch_received(&self, bytes: &[u8]) -> bool {
        let parsed = if self.profile.flags.encrypted_control_stream
            && bytes.len() >= 2
            && u16::from_le_bytes([bytes[0], bytes[1]]) == 0x0001
        {
            match self.codec.decrypt(bytes) {
                Ok(Some((v1, len))) => Some((u16::from_le_bytes([v1[0], v1[1]]), v1[2..len].to_vec())),
                Ok(None) => None, // dropped, already logged by the codec
                Err(e) => {
                    tracing::debug!(error = %e, "dropping undecryptable control frame");
                    None
                }
            }
        } else {
            match parse_v1_frame(bytes) {
                Ok(pair) => Some(pair),
                Err(e) => {
                    tracing::debug!(error = %e, "dropping runt control frame");
                    None
                }
            }
        };

        match parsed {
            Some((msg_type, payload)) => self.dispatch_by_type(msg_type, &payload),
            None => false,
        }
    }

    fn dispatch_by_type(&self, msg_type: u16, payload: &[u8]) -> bool {
        if Some(msg_type) == self.profile.code(MessageIndex::RumbleData) {
            if payload.len() >= 10 {
                let controller = u16::from_le_bytes([payload[4], payload[5]]);
                let low = u16::from_le_bytes([payload[6], payload[7]]);
                let high = u16::from_le_bytes([payload[8], payload[9]]);
                self.listener.rumble(controller, low, high);
            } else {
                tracing::debug!(len = payload.len(), "dropping runt rumble payload");
            }
            false
        } else if Some(msg_type) == self.profile.code(MessageIndex::Termination) {
            let reason = map_termination(payload, self.quality.any_frame_seen());
            self.notify_terminated(reason);
            true
        } else {
            tracing::trace!(msg_type, "skipped control message");
            false
        }
    }

    fn spawn_telemetry_worker(self: Arc<Self>) -> JoinHandle<()> {
        thread::spawn(move || self.telemetry_worker())
    }

    fn telemetry_worker(self: Arc<Self>) {
        let interval = if self.profile.flags.use_periodic_ping {
            PERIODIC_PING_INTERVAL
        } else {
            LOSS_STATS_INTERVAL
        };
        let ticker = crossbeam::channel::tick(interval);

        loop {
            crossbeam::channel::select! {
                recv(ticker) -> _ => {},
                recv(self.stop_rx) -> _ => return,
            }

            let result = if self.profile.flags.use_periodic_ping {
                self.send_periodic_ping()
            } else {
                self.send_loss_stats()
            };

            if let Err(e) = result {
                tracing::warn!(error = %e, "telemetry send failed");
                self.notify_terminated(TERMINATED_UNKNOWN);
                return;
            }
        }
    }

    fn send_periodic_ping(&self) -> CoreResult<()> {
        let mut payload = [0u8; 8];
        payload[0..2].copy_from_slice(&4u16.to_le_bytes());
        // bytes 2..6 stay zero (timestamp=0), bytes 6..8 stay zero trailing.
        self.send_fire_and_forget(0x0200, &payload)
    }

    fn send_loss_stats(&self) -> CoreResult<()> {
        let loss_count = self.quality.take_loss_count();
        let mut payload = [0u8; 32];
        payload[0..4].copy_from_slice(&loss_count.to_le_bytes());
        payload[4..8].copy_from_slice(&50u32.to_le_bytes());
        payload[8..12].copy_from_slice(&1000u32.to_le_bytes());
        payload[12..20].copy_from_slice(&self.quality.last_good_frame().to_le_bytes());
        payload[20..24].copy_from_slice(&0u32.to_le_bytes());
        payload[24..28].copy_from_slice(&0u32.to_le_bytes());
        payload[28..32].copy_from_slice(&0x14u32.to_le_bytes());

        let code = self.profile.code(MessageIndex::LossStats).expect("LossStats always present");
        self.send_fire_and_forget(code, &payload)
    }

    fn spawn_invalidation_worker(self: Arc<Self>) -> JoinHandle<()> {
        thread::spawn(move || self.invalidation_worker())
    }

    fn invalidation_worker(self: Arc<Self>) {
        loop {
            if !self.quality.invalidation_queue().wait_or_stop(&self.stop_rx) {
                return;
            }
            if self.is_stopping() {
                return;
            }

            let result = if self.quality.invalidation_queue().take_idr_required() {
                self.quality.invalidation_queue().drain_all();
                self.send_idr_request()
            } else if let Some(range) = self.quality.invalidation_queue().pop_coalesced() {
                self.send_invalidate_ref_frames(range.start, range.end)
            } else {
                Ok(())
            };

            if let Err(e) = result {
                tracing::warn!(error = %e, "invalidation send failed");
                self.notify_terminated(TERMINATED_UNKNOWN);
                return;
            }
        }
    }

    fn send_idr_request(&self) -> CoreResult<()> {
        if self.profile.flags.uses_enet {
            let last_seen = self.quality.last_seen_frame();
            let first = last_seen.saturating_sub(32);
            self.send_invalidate_ref_frames(first, last_seen)
        } else {
            let code = self.profile.code(MessageIndex::InvalidateRefFrames).expect("always present");
            let payload = self.profile.preconstructed(MessageIndex::InvalidateRefFrames).unwrap_or(&[]);
            self.send_and_discard_reply(code, payload)
        }
    }

    fn send_invalidate_ref_frames(&self, start: u64, end: u64) -> CoreResult<()> {
        let mut payload = [0u8; 24];
        payload[0..8].copy_from_slice(&start.to_be_bytes());
        payload[8..16].copy_from_slice(&end.to_be_bytes());
        payload[16..24].copy_from_slice(&0u64.to_be_bytes());

        let code = self.profile.code(MessageIndex::InvalidateRefFrames).expect("always present");
        self.send_and_discard_reply(code, &payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn termination_mapping_graceful_vs_early() {
        let hresult = HRESULT_GRACEFUL_CLOSE.to_be_bytes();
        let mut payload = vec![0u8; 6];
        payload[0..4].copy_from_slice(&hresult);

        assert_eq!(map_termination(&payload, false), TerminationReason::UnexpectedEarlyTermination);
        assert_eq!(map_termination(&payload, true), TerminationReason::GracefulTermination);
    }

    #[test]
    fn termination_mapping_protected_content() {
        let mut payload = vec![0u8; 6];
        payload[0..4].copy_from_slice(&HRESULT_PROTECTED_CONTENT.to_be_bytes());
        assert_eq!(map_termination(&payload, true), TerminationReason::ProtectedContent);
    }

    #[test]
    fn termination_mapping_legacy_passthrough() {
        let payload = 0x0200u16.to_le_bytes().to_vec();
        assert_eq!(map_termination(&payload, true), TerminationReason::Code(0x0200));
    }

    #[test]
    fn plaintext_v1_frame_roundtrip() {
        let frame = frame_plaintext_v1(0x0305, b"abc");
        let (msg_type, payload) = parse_v1_frame(&frame).unwrap();
        assert_eq!(msg_type, 0x0305);
        assert_eq!(payload, b"abc");
    }

    #[test]
    fn parse_v1_frame_runt_is_rejected() {
        let err = parse_v1_frame(&[0x01]).unwrap_err();
        assert!(matches!(err, CoreError::Runt { .. }));
    }
}

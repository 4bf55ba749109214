// tcp.rs -- synchronous TCP control/input stream, used by profiles < Gen5.
//
// Converted in spirit from myq2-sys's net_tcp.rs socket-construction idioms
// (socket2 for ToS/keepalive/nodelay, std TcpStream for the actual I/O) but
// simplified to a single blocking connection: there is no listener side and
// no loopback here, since this core is a client only.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, TcpKeepalive, Type};
use streamctl_proto::error::{CoreError, CoreResult};

const TCP_KEEPALIVE_SECS: u64 = 60;
const HEADER_LEN: usize = 4; // type: u16 LE, payload_len: u16 LE

/// A connected TCP control or input stream, framed as
/// `[type: u16 LE][payload_len: u16 LE][payload]`.
pub struct TcpTransport {
    stream: TcpStream,
}

impl TcpTransport {
    /// Connect with NoDelay and a bounded connect timeout.
    pub fn connect(addr: SocketAddr, connect_timeout: Duration) -> CoreResult<Self> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
            .map_err(|e| CoreError::TransportFail(format!("socket: {e}")))?;

        socket
            .connect_timeout(&addr.into(), connect_timeout)
            .map_err(|e| {
                if e.kind() == io::ErrorKind::TimedOut {
                    CoreError::Timeout(connect_timeout)
                } else {
                    CoreError::TransportFail(format!("connect: {e}"))
                }
            })?;

        socket
            .set_nodelay(true)
            .map_err(|e| CoreError::TransportFail(format!("set_nodelay: {e}")))?;

        let keepalive = TcpKeepalive::new().with_time(Duration::from_secs(TCP_KEEPALIVE_SECS));
        #[cfg(any(target_os = "linux", target_os = "macos", target_os = "windows"))]
        let keepalive = keepalive.with_interval(Duration::from_secs(TCP_KEEPALIVE_SECS));
        let _ = socket.set_tcp_keepalive(&keepalive);

        tracing::debug!(%addr, "tcp control/input stream connected");
        Ok(Self { stream: socket.into() })
    }

    /// Send one framed message: `[type][payload_len][payload]`.
    pub fn send(&mut self, msg_type: u16, payload: &[u8]) -> CoreResult<()> {
        let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
        frame.extend_from_slice(&msg_type.to_le_bytes());
        frame.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        frame.extend_from_slice(payload);
        self.stream
            .write_all(&frame)
            .map_err(|e| CoreError::TransportFail(format!("send: {e}")))
    }

    /// Read exactly one framed message and return `(type, payload)`.
    pub fn recv_one(&mut self) -> CoreResult<(u16, Vec<u8>)> {
        let mut header = [0u8; HEADER_LEN];
        self.stream
            .read_exact(&mut header)
            .map_err(|e| CoreError::TransportFail(format!("recv header: {e}")))?;

        let msg_type = u16::from_le_bytes([header[0], header[1]]);
        let payload_len = u16::from_le_bytes([header[2], header[3]]) as usize;

        let mut payload = vec![0u8; payload_len];
        self.stream
            .read_exact(&mut payload)
            .map_err(|e| CoreError::TransportFail(format!("recv payload: {e}")))?;

        Ok((msg_type, payload))
    }

    /// Send already-framed bytes verbatim, with no additional header. Used
    /// by the legacy dedicated input socket, whose frames carry their own
    /// big-endian length prefix rather than this module's little-endian one.
    pub fn send_raw(&mut self, bytes: &[u8]) -> CoreResult<()> {
        self.stream
            .write_all(bytes)
            .map_err(|e| CoreError::TransportFail(format!("send_raw: {e}")))
    }

    /// Send-and-discard-reply: TCP mode reads and drops one reply frame.
    pub fn send_and_drain_reply(&mut self, msg_type: u16, payload: &[u8]) -> CoreResult<()> {
        self.send(msg_type, payload)?;
        self.recv_one()?;
        Ok(())
    }

    pub fn requires_reply_drain(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn framed_roundtrip_over_real_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            let mut header = [0u8; HEADER_LEN];
            sock.read_exact(&mut header).unwrap();
            let len = u16::from_le_bytes([header[2], header[3]]) as usize;
            let mut payload = vec![0u8; len];
            sock.read_exact(&mut payload).unwrap();
            sock.write_all(&header).unwrap();
            sock.write_all(&payload).unwrap();
            payload
        });

        let mut client = TcpTransport::connect(addr, Duration::from_secs(1)).unwrap();
        client.send(0x0305, b"hello").unwrap();
        let (msg_type, reply) = client.recv_one().unwrap();

        let sent_payload = server.join().unwrap();
        assert_eq!(msg_type, 0x0305);
        assert_eq!(reply, sent_payload);
        assert_eq!(reply, b"hello");
    }

    #[test]
    fn connect_refused_is_transport_fail() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener); // nothing listening now

        let err = TcpTransport::connect(addr, Duration::from_millis(200)).unwrap_err();
        assert!(matches!(err, CoreError::TransportFail(_)) || matches!(err, CoreError::Timeout(_)));
    }
}

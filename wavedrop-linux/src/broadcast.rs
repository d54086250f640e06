//! LAN signaling: publish and receive `SignalMessage` frames over UDP multicast. Best-effort only.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use tokio::net::UdpSocket;
use tracing::{debug, info};
use wavedrop_core::wire::{decode_frame, encode_frame};
use wavedrop_core::{SignalKind, SignalMessage, PROTOCOL_VERSION};

const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 60, 61);
/// How often `publish` repeats a message while waiting for the peer.
pub const REPEAT_INTERVAL: Duration = Duration::from_secs(2);

pub struct Broadcast {
    socket: UdpSocket,
    dest: SocketAddr,
}

impl Broadcast {
    /// Bind the broadcast port and join the group (TTL 1, stays on the LAN).
    pub async fn join(port: u16) -> std::io::Result<Self> {
        let std_sock = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port))?;
        std_sock.join_multicast_v4(&MULTICAST_GROUP, &Ipv4Addr::UNSPECIFIED)?;
        std_sock.set_multicast_ttl_v4(1)?;
        std_sock.set_nonblocking(true)?;
        let socket = UdpSocket::from_std(std_sock)?;
        Ok(Self {
            socket,
            dest: SocketAddr::V4(SocketAddrV4::new(MULTICAST_GROUP, port)),
        })
    }

    pub async fn send(&self, msg: &SignalMessage) -> std::io::Result<()> {
        let frame = encode_frame(msg)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        self.socket.send_to(&frame, self.dest).await?;
        debug!(kind = ?msg.kind, key = %msg.key, "signal broadcast");
        Ok(())
    }

    /// Next well-formed message of our protocol version. Garbage datagrams are skipped.
    pub async fn recv(&self) -> std::io::Result<(SignalMessage, SocketAddr)> {
        let mut buf = vec![0u8; 65536];
        loop {
            let (n, from) = self.socket.recv_from(&mut buf).await?;
            match decode_frame::<SignalMessage>(&buf[..n]) {
                Ok((msg, _)) if msg.protocol_version == PROTOCOL_VERSION => return Ok((msg, from)),
                Ok((msg, _)) => {
                    debug!(%from, version = msg.protocol_version, "ignoring foreign protocol version")
                }
                Err(e) => debug!(%from, error = %e, "ignoring malformed datagram"),
            }
        }
    }

    /// Wait until a message of `kind` for `key` arrives, or `timeout` elapses.
    pub async fn wait_for(
        &self,
        kind: SignalKind,
        key: &str,
        timeout: Duration,
    ) -> std::io::Result<Option<SignalMessage>> {
        let waiting = async {
            loop {
                let (msg, from) = self.recv().await?;
                if is_match(&msg, kind, key) {
                    info!(%from, kind = ?kind, key, "signal received");
                    return Ok::<_, std::io::Error>(msg);
                }
            }
        };
        match tokio::time::timeout(timeout, waiting).await {
            Ok(res) => res.map(Some),
            Err(_) => Ok(None),
        }
    }

    /// Re-send `msg` every `REPEAT_INTERVAL` until the returned future is dropped.
    pub async fn publish_repeating(&self, msg: &SignalMessage) -> std::io::Result<()> {
        loop {
            self.send(msg).await?;
            tokio::time::sleep(REPEAT_INTERVAL).await;
        }
    }

    /// Log every message seen on the group. Runs until the socket fails.
    pub async fn watch(&self) -> std::io::Result<()> {
        loop {
            let (msg, from) = self.recv().await?;
            info!(%from, kind = ?msg.kind, key = %msg.key, payload_len = msg.payload.len(), "signal seen");
        }
    }
}

fn is_match(msg: &SignalMessage, kind: SignalKind, key: &str) -> bool {
    msg.kind == kind && msg.key == key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matching_requires_kind_and_key() {
        let offer = SignalMessage::new(SignalKind::Offer, "AB12CD", "tok");
        assert!(is_match(&offer, SignalKind::Offer, "AB12CD"));
        assert!(!is_match(&offer, SignalKind::Answer, "AB12CD"));
        assert!(!is_match(&offer, SignalKind::Offer, "AB12CD-ans"));
    }

    #[test]
    fn datagram_is_one_frame() {
        let msg = SignalMessage::new(SignalKind::Answer, "AB12CD-ans", "tok");
        let frame = encode_frame(&msg).unwrap();
        let (back, used) = decode_frame::<SignalMessage>(&frame).unwrap();
        assert_eq!(used, frame.len());
        assert_eq!(back, msg);
    }
}

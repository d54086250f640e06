//! TCP transport: one connection per transfer, carrying length-prefixed transfer frames.
//!
//! `TcpChannel` is the daemon's `Channel`: sends are queued to a writer task and the pending
//! gauge counts bytes not yet written to the socket.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use wavedrop_core::wire::decode_frame;
use wavedrop_core::{
    Channel, ChannelError, Frame, FrameDecodeError, ReceivedFile, SendProgress, TransferParams,
    TransferReceiver, TransferSender,
};

pub struct TcpChannel {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    pending: Arc<AtomicUsize>,
    open: Arc<AtomicBool>,
}

impl TcpChannel {
    /// Wrap the write half; the returned task finishes once the channel is dropped and drained.
    pub fn spawn(mut writer: OwnedWriteHalf) -> (Self, JoinHandle<std::io::Result<()>>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let pending = Arc::new(AtomicUsize::new(0));
        let open = Arc::new(AtomicBool::new(true));
        let writer_pending = pending.clone();
        let writer_open = open.clone();
        let task = tokio::spawn(async move {
            while let Some(bytes) = rx.recv().await {
                let written = async {
                    writer.write_all(&bytes).await?;
                    writer.flush().await
                }
                .await;
                writer_pending.fetch_sub(bytes.len(), Ordering::AcqRel);
                if let Err(e) = written {
                    writer_open.store(false, Ordering::Release);
                    return Err(e);
                }
            }
            writer.shutdown().await
        });
        (Self { tx, pending, open }, task)
    }
}

impl Channel for TcpChannel {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire) && !self.tx.is_closed()
    }

    fn send(&mut self, message: Vec<u8>) -> Result<(), ChannelError> {
        let len = message.len();
        self.pending.fetch_add(len, Ordering::AcqRel);
        self.tx.send(message).map_err(|_| {
            self.pending.fetch_sub(len, Ordering::AcqRel);
            ChannelError("writer task has stopped".into())
        })
    }

    fn pending_bytes(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }
}

/// Stream one payload over `stream`, honouring backpressure.
pub async fn send_payload(
    stream: TcpStream,
    name: &str,
    payload: Vec<u8>,
    params: TransferParams,
) -> anyhow::Result<u64> {
    let (_reader, writer) = stream.into_split();
    let (mut channel, writer_task) = TcpChannel::spawn(writer);
    let mut sender = TransferSender::new(name, payload, params);
    loop {
        match sender.pump(&mut channel)? {
            SendProgress::Blocked { retry_after } => tokio::time::sleep(retry_after).await,
            SendProgress::Done => break,
        }
    }
    let sent = sender.bytes_sent();
    drop(channel);
    writer_task.await.context("writer task panicked")??;
    Ok(sent)
}

/// Read frames from `stream` until the transfer completes.
pub async fn receive_payload(mut stream: TcpStream) -> anyhow::Result<ReceivedFile> {
    let mut receiver = TransferReceiver::new();
    let mut buf = Vec::with_capacity(64 * 1024);
    let mut chunk = vec![0u8; 64 * 1024];
    loop {
        loop {
            match decode_frame::<Frame>(&buf) {
                Ok((frame, used)) => {
                    buf.drain(..used);
                    if let Some(file) = receiver.on_frame(frame)? {
                        return Ok(file);
                    }
                }
                Err(FrameDecodeError::NeedMore) => break,
                Err(e) => return Err(e.into()),
            }
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            bail!(
                "connection closed after {} bytes, before end of transfer",
                receiver.received_bytes()
            );
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Connect to `addr` and send the file at `path`.
pub async fn send_file(addr: SocketAddr, path: &Path, params: TransferParams) -> anyhow::Result<()> {
    let payload = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string());
    let stream = TcpStream::connect(addr)
        .await
        .with_context(|| format!("connecting to {}", addr))?;
    info!(%addr, name = %name, size = payload.len(), "sending file");
    let sent = send_payload(stream, &name, payload, params).await?;
    info!(%addr, bytes = sent, "file sent");
    Ok(())
}

/// Accept one sender on `port` and save its file into `out_dir`. Returns the saved path.
pub async fn receive_file(port: u16, out_dir: &Path) -> anyhow::Result<PathBuf> {
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding transfer port {}", port))?;
    info!(port, "waiting for sender");
    let (stream, peer) = listener.accept().await?;
    debug!(%peer, "sender connected");
    let file = receive_payload(stream).await?;
    let path = out_dir.join(safe_file_name(&file.name));
    tokio::fs::write(&path, &file.bytes)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    info!(%peer, path = %path.display(), size = file.size, "file received");
    Ok(path)
}

/// Strip directories from a peer-supplied name.
fn safe_file_name(name: &str) -> String {
    match Path::new(name).file_name().and_then(|n| n.to_str()) {
        Some(n) if !n.is_empty() => n.to_string(),
        _ => {
            warn!(name, "unusable file name from peer");
            "received.bin".to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, server) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), server.unwrap().0)
    }

    #[tokio::test]
    async fn payload_over_loopback() {
        let (client, server) = pair().await;
        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 253) as u8).collect();
        let expected = payload.clone();
        let send = tokio::spawn(send_payload(
            client,
            "data.bin",
            payload,
            TransferParams::with_slice_size(4096),
        ));
        let file = receive_payload(server).await.unwrap();
        assert_eq!(send.await.unwrap().unwrap(), expected.len() as u64);
        assert_eq!(file.name, "data.bin");
        assert_eq!(file.bytes, expected);
    }

    #[tokio::test]
    async fn empty_payload_over_loopback() {
        let (client, server) = pair().await;
        let send = tokio::spawn(send_payload(client, "empty", Vec::new(), TransferParams::default()));
        let file = receive_payload(server).await.unwrap();
        send.await.unwrap().unwrap();
        assert_eq!(file.size, 0);
        assert!(file.bytes.is_empty());
    }

    #[tokio::test]
    async fn early_close_is_an_error() {
        let (client, server) = pair().await;
        drop(client);
        assert!(receive_payload(server).await.is_err());
    }

    #[tokio::test]
    async fn file_roundtrip_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("note.txt");
        std::fs::write(&src, b"hello over tcp").unwrap();
        let out = tempfile::tempdir().unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let recv = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            receive_payload(stream).await.unwrap()
        });
        send_file(addr, &src, TransferParams::default()).await.unwrap();
        let file = recv.await.unwrap();
        let saved = out.path().join(safe_file_name(&file.name));
        std::fs::write(&saved, &file.bytes).unwrap();
        assert_eq!(std::fs::read(saved).unwrap(), b"hello over tcp");
    }

    #[test]
    fn peer_names_lose_directories() {
        assert_eq!(safe_file_name("../../etc/passwd"), "passwd");
        assert_eq!(safe_file_name("photo.jpg"), "photo.jpg");
        assert_eq!(safe_file_name(".."), "received.bin");
        assert_eq!(safe_file_name(""), "received.bin");
    }

    #[tokio::test]
    async fn gauge_tracks_unwritten_bytes() {
        let (client, _server) = pair().await;
        let (_r, w) = client.into_split();
        let (mut channel, task) = TcpChannel::spawn(w);
        assert!(channel.is_open());
        channel.send(vec![0; 100]).unwrap();
        assert!(channel.pending_bytes() <= 100);
        drop(channel);
        task.await.unwrap().unwrap();
    }
}

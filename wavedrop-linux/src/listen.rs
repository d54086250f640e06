//! Acoustic listener: a reader task feeds PCM blocks through a bounded channel to a blocking
//! analysis loop that drives `AcousticReceiver`.
//!
//! Input is raw mono f32 little-endian at the configured sample rate. End of input counts as
//! silence, so a stream that stops mid-transmission still ends in a definite outcome.

use std::path::Path;

use anyhow::Context;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tracing::{debug, info};
use wavedrop_core::acoustic::samples_for;
use wavedrop_core::{AcousticError, AcousticReceiver, ReceiverConfig, ReceiverEvent};

/// Blocks in flight between reader and analysis.
const QUEUE_DEPTH: usize = 8;
const READ_BLOCK_BYTES: usize = 16 * 1024;

/// Listen to a PCM file (`-` for stdin) until a key is decoded or the attempt fails.
pub async fn listen_file(path: &Path, config: ReceiverConfig) -> anyhow::Result<String> {
    if path == Path::new("-") {
        return Ok(listen(tokio::io::stdin(), config).await?);
    }
    let file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("opening {}", path.display()))?;
    Ok(listen(file, config).await?)
}

#[derive(Debug, thiserror::Error)]
pub enum ListenError {
    #[error(transparent)]
    Acoustic(#[from] AcousticError),
    #[error("reading audio: {0}")]
    Io(#[from] std::io::Error),
    #[error("analysis task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub async fn listen<R>(source: R, config: ReceiverConfig) -> Result<String, ListenError>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut receiver = AcousticReceiver::new(config)?;
    let (tx, rx) = mpsc::channel::<Vec<f32>>(QUEUE_DEPTH);
    let reader = tokio::spawn(read_samples(source, tx));
    let analysis = tokio::task::spawn_blocking(move || {
        receiver.start();
        analyse(&mut receiver, rx)
    });
    let outcome = analysis.await?;
    // Analysis may finish early; the reader then fails to send and stops.
    match reader.await? {
        Ok(()) => {}
        Err(e) if outcome.is_err() => return Err(e.into()),
        Err(e) => debug!(error = %e, "reader stopped after key was decoded"),
    }
    Ok(outcome?)
}

async fn read_samples<R>(mut source: R, tx: mpsc::Sender<Vec<f32>>) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_BLOCK_BYTES];
    let mut carry: Vec<u8> = Vec::with_capacity(4);
    loop {
        let n = source.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        carry.extend_from_slice(&buf[..n]);
        let whole = carry.len() / 4 * 4;
        let block = bytes_to_samples(&carry[..whole]);
        carry.drain(..whole);
        if tx.send(block).await.is_err() {
            return Ok(());
        }
    }
}

fn analyse(
    receiver: &mut AcousticReceiver,
    mut rx: mpsc::Receiver<Vec<f32>>,
) -> Result<String, AcousticError> {
    while let Some(block) = rx.blocking_recv() {
        receiver.push_samples(&block);
        if let Some(outcome) = settle(receiver.poll()?) {
            return outcome;
        }
    }
    // Input ended: keep feeding silence until the state machine concludes.
    let config = *receiver.config();
    let hop = vec![0.0f32; config.hop];
    let budget = samples_for(config.max_listen_ms, config.sample_rate) / config.hop + 1;
    for _ in 0..budget {
        receiver.push_samples(&hop);
        if let Some(outcome) = settle(receiver.poll()?) {
            return outcome;
        }
    }
    Err(AcousticError::NoMarkerDetected)
}

fn settle(events: Vec<ReceiverEvent>) -> Option<Result<String, AcousticError>> {
    for event in events {
        match event {
            ReceiverEvent::MarkerDetected => info!("start marker detected"),
            ReceiverEvent::Decoded(key) => return Some(Ok(key)),
            ReceiverEvent::Failed(e) => return Some(Err(e)),
        }
    }
    None
}

pub fn bytes_to_samples(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

pub fn samples_to_bytes(samples: &[f32]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

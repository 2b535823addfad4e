//! Loopback session: a sender and a receiver engine in one process, joined by
//! a channel that drops and damages chunks.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use chunkline_transfer::{
    AesGcmProvider, ChannelTransport, Chunk, ChunkOutcome, ChunkTransport, EncryptionKey,
    EncryptionProvider, SharedEngine, TransferEngine, TransferEvent, TransferRequest, integrity,
    spawn_scheduler,
};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;

const KEY_ID: &str = "loopback";

/// Sends the file at `path` from one engine to the other until it arrives
/// intact or `max_rounds` retransmission rounds are used up.
pub async fn run(config: Config, path: &Path) -> anyhow::Result<()> {
    let data = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .context("file has no usable name")?;
    let source_digest = integrity::digest_file(path)?;
    info!(file = %file_name, size = data.len(), digest = %source_digest, "sending file");

    let provider: Arc<dyn EncryptionProvider> = Arc::new(AesGcmProvider);
    let sender: SharedEngine = Arc::new(Mutex::new(TransferEngine::new(
        config.transfer.clone(),
        Arc::clone(&provider),
    )));
    let receiver: SharedEngine = Arc::new(Mutex::new(TransferEngine::new(
        config.transfer.clone(),
        provider,
    )));

    let mut request = TransferRequest::new(file_name, data.len() as u64)
        .with_endpoints("loopback-sender", "loopback-receiver")
        .with_file_digest(source_digest.clone());
    if config.encrypt {
        let key = EncryptionKey::generate();
        sender.lock().await.register_key(KEY_ID, key.clone());
        receiver.lock().await.register_key(KEY_ID, key);
        request = request.with_encryption_key(KEY_ID);
    }
    let id = request.id.clone();

    let events = receiver
        .lock()
        .await
        .take_events()
        .context("receiver events already taken")?;
    let logger = tokio::spawn(log_events(events));

    let cancel = CancellationToken::new();
    let period = config.transfer.tick_interval();
    let drivers = [
        spawn_scheduler(Arc::clone(&sender), period, cancel.clone()),
        spawn_scheduler(Arc::clone(&receiver), period, cancel.clone()),
    ];

    sender.lock().await.initiate_transfer(request.clone())?;
    receiver.lock().await.initiate_transfer(request)?;
    sender.lock().await.tick();
    receiver.lock().await.tick();

    let result = deliver(&config, &sender, &receiver, &id, &data).await;

    cancel.cancel();
    for driver in drivers {
        driver.await?;
    }
    if result.is_err() {
        for engine in [&sender, &receiver] {
            if let Err(e) = engine.lock().await.cancel_transfer(&id) {
                debug!(error = %e, "nothing to cancel");
            }
        }
    }
    let held = receiver.lock().await.take_completed(&id);
    // Dropping the last handle closes the event channel and ends the logger.
    drop(receiver);
    let received = logger.await?;
    result?;

    let payload = received
        .or(held.map(|done| done.payload))
        .context("transfer finished without a payload")?;
    anyhow::ensure!(
        integrity::verify(&payload, &source_digest),
        "received payload does not match the source digest"
    );
    info!(file = %file_name, bytes = payload.len(), "file arrived intact");
    Ok(())
}

/// Runs send/receive/acknowledge rounds over a lossy link.
async fn deliver(
    config: &Config,
    sender: &SharedEngine,
    receiver: &SharedEngine,
    id: &str,
    data: &[u8],
) -> anyhow::Result<()> {
    let (transport, mut wire) = ChannelTransport::pair();
    let mut pending: Vec<Chunk> = sender
        .lock()
        .await
        .prepare_for_send(id, data, None)?
        .to_vec();

    for round in 1..=config.max_rounds {
        let mut lost = 0usize;
        let mut sent = 0usize;
        for mut chunk in pending.drain(..) {
            if rand::random::<f64>() < config.loss_rate {
                lost += 1;
                continue;
            }
            if !chunk.payload.is_empty() && rand::random::<f64>() < config.corrupt_rate {
                let at = rand::random::<usize>() % chunk.payload.len();
                chunk.payload[at] ^= 0x5a;
            }
            transport.send(chunk)?;
            sent += 1;
        }
        info!(round, sent, lost, "round transmitted");

        while let Ok(chunk) = wire.try_recv() {
            let seq = chunk.sequence_number;
            let outcome = receiver.lock().await.receive_chunk(chunk)?;
            match outcome {
                ChunkOutcome::Recorded | ChunkOutcome::Duplicate | ChunkOutcome::Completed => {
                    sender.lock().await.acknowledge_chunk(id, seq)?;
                }
                ChunkOutcome::Failed => anyhow::bail!("transfer {id} failed verification"),
                ChunkOutcome::Corrupted | ChunkOutcome::Dropped => {}
            }
        }

        if receiver.lock().await.get_progress(id).is_none() {
            info!(round, "transfer complete");
            return Ok(());
        }
        let missing = receiver.lock().await.get_missing_chunks(id)?;
        debug!(round, missing = missing.len(), "requesting retransmission");
        pending = sender.lock().await.outbound_chunks(id, &missing)?;
    }

    anyhow::bail!(
        "transfer {id} incomplete after {} rounds",
        config.max_rounds
    )
}

/// Logs receiver events and returns the completed payload, if any.
async fn log_events(mut events: mpsc::Receiver<TransferEvent>) -> Option<Vec<u8>> {
    let mut received = None;
    while let Some(event) = events.recv().await {
        match event {
            TransferEvent::ChunkReceived { progress, sequence } => {
                debug!(
                    seq = sequence,
                    progress = format!("{:.1}%", progress.progress),
                    speed = progress.speed,
                    "chunk received"
                );
            }
            TransferEvent::ChunkCorrupted {
                sequence, actual, ..
            } => {
                warn!(seq = sequence, actual = %actual, "corrupted chunk discarded");
            }
            TransferEvent::Completed {
                progress,
                digest,
                payload,
            } => {
                info!(file = %progress.file_name, digest = %digest, "payload assembled");
                received = payload;
            }
            TransferEvent::Failed { progress, error } => {
                warn!(file = %progress.file_name, error = %error, "transfer failed");
            }
            other => info!(event = other.name(), transfer = %other.transfer_id(), "transfer event"),
        }
    }
    received
}

//! Periodic scheduler driver.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::engine::TransferEngine;

/// Engine shared between async tasks.
pub type SharedEngine = Arc<Mutex<TransferEngine>>;

/// Spawns a task that calls [`TransferEngine::tick`] every `period` until
/// `cancel` fires.
pub fn spawn_scheduler(
    engine: SharedEngine,
    period: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    engine.lock().await.tick();
                }
                _ = cancel.cancelled() => {
                    debug!("scheduler driver stopped");
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransferConfig;
    use crate::crypto::AesGcmProvider;
    use chunkline_protocol::{TransferRequest, TransferStatus};

    fn shared(cap: usize) -> SharedEngine {
        let config = TransferConfig {
            max_concurrent: cap,
            ..TransferConfig::default()
        };
        Arc::new(Mutex::new(TransferEngine::new(
            config,
            Arc::new(AesGcmProvider),
        )))
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_admit_queued_transfers() {
        let engine = shared(1);
        {
            let mut engine = engine.lock().await;
            engine
                .initiate_transfer(TransferRequest::new("a.bin", 4).with_id("a"))
                .unwrap();
            engine
                .initiate_transfer(TransferRequest::new("b.bin", 4).with_id("b"))
                .unwrap();
        }

        let cancel = CancellationToken::new();
        let handle = spawn_scheduler(engine.clone(), Duration::from_secs(1), cancel.clone());

        // The first interval tick fires immediately.
        tokio::time::sleep(Duration::from_millis(10)).await;
        {
            let engine = engine.lock().await;
            assert_eq!(
                engine.get_progress("a").unwrap().status,
                TransferStatus::Transferring
            );
            assert_eq!(engine.get_progress("b").unwrap().status, TransferStatus::Pending);
        }

        // Raising the cap only takes effect on the next tick.
        engine.lock().await.set_max_concurrent(2);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(
            engine.lock().await.get_progress("b").unwrap().status,
            TransferStatus::Transferring
        );

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn stops_on_cancel() {
        let cancel = CancellationToken::new();
        let handle = spawn_scheduler(shared(3), Duration::from_millis(100), cancel.clone());
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("driver should stop")
            .unwrap();
    }
}

use std::time::Duration;

use tokio::time::Instant;

use super::TransferError;
use crate::transport::DataChannel;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Waits until `channel` can take `next_len` more bytes without its send
/// buffer exceeding `high_water`.
///
/// Wakes on the channel's drain event when it has one and polls the
/// buffered amount otherwise. Gives up with [`TransferError::Stalled`] once
/// `limit` elapses and with [`TransferError::ChannelClosed`] as soon as the
/// channel stops being open.
pub async fn wait_for_capacity(
    channel: &dyn DataChannel,
    next_len: usize,
    high_water: usize,
    limit: Duration,
) -> Result<(), TransferError> {
    let drained = channel.buffer_drained();
    let deadline = Instant::now() + limit;
    let mut announced = false;

    loop {
        // Register before checking so a drain between the check and the
        // wait is not lost.
        let notified = drained.as_ref().map(|notify| notify.notified());

        if !channel.is_open() {
            return Err(TransferError::ChannelClosed);
        }
        let buffered = channel.buffered_amount().await;
        if buffered.saturating_add(next_len) <= high_water {
            return Ok(());
        }
        if !announced {
            tracing::debug!(
                target = "duet::transfer",
                channel = channel.label(),
                buffered,
                next_len,
                high_water,
                "applying backpressure"
            );
            announced = true;
        }
        if Instant::now() >= deadline {
            tracing::warn!(target = "duet::transfer", channel = channel.label(), buffered, "send buffer did not drain");
            return Err(TransferError::Stalled);
        }

        let drain = async {
            match notified {
                Some(notified) => notified.await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            _ = drain => {}
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
        }
    }
}

//! The four logical data channels and their outbound queues.
//!
//! Queues belong to the channel kind, not to a channel object, so messages
//! queued while a channel is being recreated survive the swap and go out
//! in order once the replacement opens.

mod queue;

use std::sync::Arc;

use crate::transport::{ChannelInstance, ChannelPayload, DataChannel, TransportError};

pub use queue::{Enqueued, OutboundQueue};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    Control,
    Chat,
    Whiteboard,
    File,
}

impl ChannelKind {
    pub const ALL: [ChannelKind; 4] = [
        ChannelKind::Control,
        ChannelKind::Chat,
        ChannelKind::Whiteboard,
        ChannelKind::File,
    ];

    pub fn label(self) -> &'static str {
        match self {
            ChannelKind::Control => "control",
            ChannelKind::Chat => "chat",
            ChannelKind::Whiteboard => "whiteboard",
            ChannelKind::File => "file",
        }
    }

    /// Chunks carry their own sequence numbers, so the file channel trades
    /// ordering for throughput under loss.
    pub fn ordered(self) -> bool {
        !matches!(self, ChannelKind::File)
    }

    pub fn from_label(label: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.label() == label)
    }

    fn index(self) -> usize {
        match self {
            ChannelKind::Control => 0,
            ChannelKind::Chat => 1,
            ChannelKind::Whiteboard => 2,
            ChannelKind::File => 3,
        }
    }
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    Queued,
    /// Queued, and the oldest pending message was discarded for it.
    QueuedDroppedOldest,
}

struct Slot {
    channel: Option<Arc<dyn DataChannel>>,
    open: bool,
    queue: OutboundQueue<ChannelPayload>,
}

pub struct ChannelManager {
    slots: [Slot; 4],
}

impl ChannelManager {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            slots: std::array::from_fn(|_| Slot {
                channel: None,
                open: false,
                queue: OutboundQueue::new(queue_capacity),
            }),
        }
    }

    /// Gives `kind` its own queue bound. Call before anything is queued.
    pub fn with_queue_capacity(mut self, kind: ChannelKind, capacity: usize) -> Self {
        self.slots[kind.index()].queue = OutboundQueue::new(capacity);
        self
    }

    /// Installs `channel` for `kind`, returning the channel it replaced.
    /// A channel that is already open is flushed right away.
    pub async fn attach(
        &mut self,
        kind: ChannelKind,
        channel: Arc<dyn DataChannel>,
    ) -> Option<Arc<dyn DataChannel>> {
        let slot = &mut self.slots[kind.index()];
        slot.open = channel.is_open();
        let replaced = slot.channel.replace(channel);
        tracing::debug!(
            target = "duet::channels",
            channel = %kind,
            open = slot.open,
            queued = slot.queue.len(),
            "channel attached"
        );
        if slot.open {
            flush(kind, slot).await;
        }
        replaced
    }

    pub fn current(&self, kind: ChannelKind) -> Option<&Arc<dyn DataChannel>> {
        self.slots[kind.index()].channel.as_ref()
    }

    pub fn owns(&self, kind: ChannelKind, instance: ChannelInstance) -> bool {
        self.current(kind)
            .is_some_and(|channel| channel.instance() == instance)
    }

    pub fn is_open(&self, kind: ChannelKind) -> bool {
        self.slots[kind.index()].open
    }

    pub fn queued(&self, kind: ChannelKind) -> usize {
        self.slots[kind.index()].queue.len()
    }

    pub fn dropped(&self, kind: ChannelKind) -> usize {
        self.slots[kind.index()].queue.dropped()
    }

    /// Transmits immediately when the channel is open and nothing is waiting
    /// ahead of the message; otherwise queues it. Never blocks on a closed
    /// channel.
    pub async fn send(&mut self, kind: ChannelKind, payload: ChannelPayload) -> SendOutcome {
        let slot = &mut self.slots[kind.index()];
        if slot.open && slot.queue.is_empty() {
            if let Some(channel) = slot.channel.clone() {
                match transmit(channel.as_ref(), &payload).await {
                    Ok(()) => return SendOutcome::Sent,
                    Err(err) => {
                        tracing::warn!(target = "duet::channels", channel = %kind, error = %err, "send failed, queueing");
                        slot.open = false;
                    }
                }
            }
        }

        let outcome = match slot.queue.push(payload) {
            Enqueued::Stored => SendOutcome::Queued,
            Enqueued::EvictedOldest => {
                tracing::warn!(
                    target = "duet::channels",
                    channel = %kind,
                    dropped = slot.queue.dropped(),
                    "outbound queue full, dropped oldest message"
                );
                SendOutcome::QueuedDroppedOldest
            }
        };
        if slot.open {
            flush(kind, slot).await;
            if slot.queue.is_empty() && outcome == SendOutcome::Queued {
                return SendOutcome::Sent;
            }
        }
        outcome
    }

    /// Marks the channel open and drains its queue. Events from a channel
    /// that has since been replaced are ignored.
    pub async fn on_open(&mut self, kind: ChannelKind, instance: ChannelInstance) -> usize {
        if !self.owns(kind, instance) {
            return 0;
        }
        let slot = &mut self.slots[kind.index()];
        slot.open = true;
        flush(kind, slot).await
    }

    /// Returns true when the current channel for `kind` closed.
    pub fn on_close(&mut self, kind: ChannelKind, instance: ChannelInstance) -> bool {
        if !self.owns(kind, instance) {
            return false;
        }
        let slot = &mut self.slots[kind.index()];
        slot.open = false;
        slot.channel = None;
        tracing::debug!(target = "duet::channels", channel = %kind, queued = slot.queue.len(), "channel closed");
        true
    }

    /// Forgets every channel but keeps the queues.
    pub fn detach_all(&mut self) -> Vec<Arc<dyn DataChannel>> {
        self.slots
            .iter_mut()
            .filter_map(|slot| {
                slot.open = false;
                slot.channel.take()
            })
            .collect()
    }

    /// Kinds without a live channel.
    pub fn missing(&self) -> Vec<ChannelKind> {
        ChannelKind::ALL
            .into_iter()
            .filter(|kind| self.slots[kind.index()].channel.is_none())
            .collect()
    }
}

async fn flush(kind: ChannelKind, slot: &mut Slot) -> usize {
    let Some(channel) = slot.channel.clone() else {
        return 0;
    };
    let mut sent = 0;
    while slot.open {
        let Some(payload) = slot.queue.pop() else {
            break;
        };
        if let Err(err) = transmit(channel.as_ref(), &payload).await {
            tracing::warn!(target = "duet::channels", channel = %kind, error = %err, "flush interrupted");
            if slot.queue.requeue_front(payload) == Enqueued::EvictedOldest {
                tracing::warn!(target = "duet::channels", channel = %kind, "queue full, dropped interrupted message");
            }
            slot.open = false;
            break;
        }
        sent += 1;
    }
    if sent > 0 {
        tracing::debug!(target = "duet::channels", channel = %kind, sent, "flushed queued messages");
    }
    sent
}

async fn transmit(channel: &dyn DataChannel, payload: &ChannelPayload) -> Result<(), TransportError> {
    match payload {
        ChannelPayload::Text(text) => channel.send_text(text).await,
        ChannelPayload::Binary(data) => channel.send_binary(data.clone()).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    use crate::config::SessionConfig;
    use crate::transport::next_channel_instance;

    struct RecordingChannel {
        label: String,
        instance: ChannelInstance,
        open: AtomicBool,
        fail: AtomicBool,
        sent: Mutex<Vec<ChannelPayload>>,
    }

    impl RecordingChannel {
        fn new(kind: ChannelKind, open: bool) -> Arc<Self> {
            Arc::new(Self {
                label: kind.label().into(),
                instance: next_channel_instance(),
                open: AtomicBool::new(open),
                fail: AtomicBool::new(false),
                sent: Mutex::new(Vec::new()),
            })
        }

        fn texts(&self) -> Vec<String> {
            self.sent
                .lock()
                .iter()
                .filter_map(|p| match p {
                    ChannelPayload::Text(t) => Some(t.clone()),
                    ChannelPayload::Binary(_) => None,
                })
                .collect()
        }
    }

    #[async_trait]
    impl DataChannel for RecordingChannel {
        fn label(&self) -> &str {
            &self.label
        }
        fn instance(&self) -> ChannelInstance {
            self.instance
        }
        fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }
        async fn send_text(&self, text: &str) -> Result<(), TransportError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(TransportError::ChannelClosed);
            }
            self.sent.lock().push(ChannelPayload::Text(text.to_string()));
            Ok(())
        }
        async fn send_binary(&self, data: bytes::Bytes) -> Result<(), TransportError> {
            self.sent.lock().push(ChannelPayload::Binary(data));
            Ok(())
        }
        async fn buffered_amount(&self) -> usize {
            0
        }
        async fn close(&self) -> Result<(), TransportError> {
            self.open.store(false, Ordering::SeqCst);
            Ok(())
        }
    }

    fn text(value: &str) -> ChannelPayload {
        ChannelPayload::Text(value.to_string())
    }

    #[test_timeout::timeout]
    fn labels_round_trip_and_file_is_unordered() {
        for kind in ChannelKind::ALL {
            assert_eq!(ChannelKind::from_label(kind.label()), Some(kind));
        }
        assert_eq!(ChannelKind::from_label("video"), None);
        assert!(ChannelKind::Chat.ordered());
        assert!(!ChannelKind::File.ordered());
    }

    #[test_timeout::tokio_timeout_test]
    async fn queue_keeps_newest_entries_and_flushes_in_order() {
        let mut manager = ChannelManager::new(100);
        let channel = RecordingChannel::new(ChannelKind::Whiteboard, false);
        manager.attach(ChannelKind::Whiteboard, channel.clone()).await;

        for i in 0..200 {
            manager.send(ChannelKind::Whiteboard, text(&i.to_string())).await;
        }
        assert_eq!(manager.queued(ChannelKind::Whiteboard), 100);
        assert!(channel.texts().is_empty());

        channel.open.store(true, Ordering::SeqCst);
        let flushed = manager.on_open(ChannelKind::Whiteboard, channel.instance).await;
        assert_eq!(flushed, 100);
        let expected: Vec<String> = (100..200).map(|i| i.to_string()).collect();
        assert_eq!(channel.texts(), expected);
        assert_eq!(manager.dropped(ChannelKind::Whiteboard), 100);
    }

    #[test_timeout::tokio_timeout_test]
    async fn burst_within_capacity_is_delivered_whole() {
        let config = SessionConfig::default();
        let mut manager = ChannelManager::new(config.channel_queue_capacity)
            .with_queue_capacity(ChannelKind::Whiteboard, config.whiteboard_queue_capacity);
        let channel = RecordingChannel::new(ChannelKind::Whiteboard, false);
        manager.attach(ChannelKind::Whiteboard, channel.clone()).await;
        for i in 0..200 {
            manager.send(ChannelKind::Whiteboard, text(&i.to_string())).await;
        }
        channel.open.store(true, Ordering::SeqCst);
        manager.on_open(ChannelKind::Whiteboard, channel.instance).await;
        let expected: Vec<String> = (0..200).map(|i| i.to_string()).collect();
        assert_eq!(channel.texts(), expected);
        assert_eq!(manager.dropped(ChannelKind::Whiteboard), 0);
    }

    #[test_timeout::tokio_timeout_test]
    async fn per_kind_capacity_leaves_other_queues_alone() {
        let mut manager = ChannelManager::new(2).with_queue_capacity(ChannelKind::Whiteboard, 4);
        for i in 0..4 {
            manager.send(ChannelKind::Whiteboard, text(&i.to_string())).await;
            manager.send(ChannelKind::Chat, text(&i.to_string())).await;
        }
        assert_eq!(manager.queued(ChannelKind::Whiteboard), 4);
        assert_eq!(manager.dropped(ChannelKind::Whiteboard), 0);
        assert_eq!(manager.queued(ChannelKind::Chat), 2);
        assert_eq!(manager.dropped(ChannelKind::Chat), 2);
    }

    #[test_timeout::tokio_timeout_test]
    async fn overflow_reports_dropped_oldest() {
        let mut manager = ChannelManager::new(2);
        assert_eq!(manager.send(ChannelKind::Chat, text("a")).await, SendOutcome::Queued);
        assert_eq!(manager.send(ChannelKind::Chat, text("b")).await, SendOutcome::Queued);
        assert_eq!(
            manager.send(ChannelKind::Chat, text("c")).await,
            SendOutcome::QueuedDroppedOldest
        );
    }

    #[test_timeout::tokio_timeout_test]
    async fn open_channel_sends_immediately() {
        let mut manager = ChannelManager::new(10);
        let channel = RecordingChannel::new(ChannelKind::Chat, true);
        manager.attach(ChannelKind::Chat, channel.clone()).await;
        assert_eq!(manager.send(ChannelKind::Chat, text("hi")).await, SendOutcome::Sent);
        assert_eq!(channel.texts(), vec!["hi".to_string()]);
    }

    #[test_timeout::tokio_timeout_test]
    async fn failed_send_keeps_message_for_replacement() {
        let mut manager = ChannelManager::new(10);
        let first = RecordingChannel::new(ChannelKind::Chat, true);
        manager.attach(ChannelKind::Chat, first.clone()).await;
        first.fail.store(true, Ordering::SeqCst);

        assert_eq!(manager.send(ChannelKind::Chat, text("one")).await, SendOutcome::Queued);
        assert!(!manager.is_open(ChannelKind::Chat));
        assert_eq!(manager.send(ChannelKind::Chat, text("two")).await, SendOutcome::Queued);

        assert!(manager.on_close(ChannelKind::Chat, first.instance));
        assert!(manager.missing().contains(&ChannelKind::Chat));

        let second = RecordingChannel::new(ChannelKind::Chat, true);
        manager.attach(ChannelKind::Chat, second.clone()).await;
        assert_eq!(second.texts(), vec!["one".to_string(), "two".to_string()]);
    }

    #[test_timeout::tokio_timeout_test]
    async fn events_from_replaced_channel_are_ignored() {
        let mut manager = ChannelManager::new(10);
        let old = RecordingChannel::new(ChannelKind::Control, false);
        let new = RecordingChannel::new(ChannelKind::Control, false);
        manager.attach(ChannelKind::Control, old.clone()).await;
        manager.attach(ChannelKind::Control, new.clone()).await;

        assert!(!manager.on_close(ChannelKind::Control, old.instance));
        assert_eq!(manager.on_open(ChannelKind::Control, old.instance).await, 0);
        assert!(!manager.is_open(ChannelKind::Control));
        assert!(manager.owns(ChannelKind::Control, new.instance));
    }

    #[test_timeout::tokio_timeout_test]
    async fn detach_keeps_queue() {
        let mut manager = ChannelManager::new(10);
        let channel = RecordingChannel::new(ChannelKind::Chat, false);
        manager.attach(ChannelKind::Chat, channel).await;
        manager.send(ChannelKind::Chat, text("later")).await;
        assert_eq!(manager.detach_all().len(), 1);
        assert_eq!(manager.queued(ChannelKind::Chat), 1);
        assert_eq!(manager.missing().len(), 4);
    }
}

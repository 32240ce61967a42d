use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// A timer firing. `seq` tells a firing of the currently armed timer apart
/// from one that was re-armed or cancelled after its sleep started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fired<K> {
    pub key: K,
    pub seq: u64,
}

/// One pending deadline per key. Arming a key replaces its previous
/// deadline.
pub struct Timers<K> {
    armed: HashMap<K, (u64, JoinHandle<()>)>,
    next_seq: u64,
    sink: mpsc::UnboundedSender<Fired<K>>,
}

impl<K> Timers<K>
where
    K: Copy + Eq + Hash + Send + std::fmt::Debug + 'static,
{
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Fired<K>>) {
        let (sink, fired) = mpsc::unbounded_channel();
        (
            Self {
                armed: HashMap::new(),
                next_seq: 1,
                sink,
            },
            fired,
        )
    }

    pub fn arm(&mut self, key: K, delay: Duration) {
        let seq = self.next_seq;
        self.next_seq += 1;
        let sink = self.sink.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = sink.send(Fired { key, seq });
        });
        if let Some((_, previous)) = self.armed.insert(key, (seq, handle)) {
            previous.abort();
        }
        tracing::trace!(?key, delay_ms = delay.as_millis() as u64, "timer armed");
    }

    pub fn cancel(&mut self, key: K) {
        if let Some((_, handle)) = self.armed.remove(&key) {
            handle.abort();
        }
    }

    pub fn is_armed(&self, key: K) -> bool {
        self.armed.contains_key(&key)
    }

    /// Claims a firing. Returns the key only if it is still the armed one.
    pub fn accept(&mut self, fired: Fired<K>) -> Option<K> {
        match self.armed.get(&fired.key) {
            Some((seq, _)) if *seq == fired.seq => {
                self.armed.remove(&fired.key);
                Some(fired.key)
            }
            _ => None,
        }
    }

    pub fn cancel_all(&mut self) {
        for (_, (_, handle)) in self.armed.drain() {
            handle.abort();
        }
    }
}

impl<K> Drop for Timers<K> {
    fn drop(&mut self) {
        for (_, (_, handle)) in self.armed.drain() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Key {
        A,
        B,
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn fires_once_after_delay() {
        let (mut timers, mut fired) = Timers::new();
        timers.arm(Key::A, Duration::from_secs(3));
        let firing = fired.recv().await.expect("fired");
        assert_eq!(timers.accept(firing), Some(Key::A));
        assert!(!timers.is_armed(Key::A));
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn rearming_supersedes_earlier_deadline() {
        let (mut timers, mut fired) = Timers::new();
        timers.arm(Key::A, Duration::from_secs(1));
        let stale = Fired { key: Key::A, seq: 1 };
        timers.arm(Key::A, Duration::from_secs(5));
        assert_eq!(timers.accept(stale), None);
        let started = tokio::time::Instant::now();
        let firing = fired.recv().await.expect("fired");
        assert_eq!(timers.accept(firing), Some(Key::A));
        assert!(started.elapsed() >= Duration::from_secs(5));
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn cancelled_timer_never_fires() {
        let (mut timers, mut fired) = Timers::new();
        timers.arm(Key::A, Duration::from_secs(1));
        timers.arm(Key::B, Duration::from_secs(2));
        timers.cancel(Key::A);
        let firing = fired.recv().await.expect("fired");
        assert_eq!(firing.key, Key::B);
        assert_eq!(timers.accept(firing), Some(Key::B));
    }
}

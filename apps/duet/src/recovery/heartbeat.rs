use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

const MAX_OUTSTANDING: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    Idle,
    SendPing { id: u64 },
    TimedOut,
}

/// Application-level ping/pong over the control channel.
///
/// Ping ids increase monotonically; a pong only counts when it answers a
/// ping that is still outstanding.
#[derive(Debug)]
pub struct Heartbeat {
    interval: Duration,
    pong_timeout: Duration,
    running: bool,
    paused: bool,
    next_id: u64,
    outstanding: VecDeque<(u64, Instant)>,
    last_pong: Option<Instant>,
    last_tick: Option<Instant>,
}

impl Heartbeat {
    pub fn new(interval: Duration, pong_timeout: Duration) -> Self {
        Self {
            interval,
            pong_timeout,
            running: false,
            paused: false,
            next_id: 1,
            outstanding: VecDeque::new(),
            last_pong: None,
            last_tick: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_running(&self) -> bool {
        self.running && !self.paused
    }

    pub fn start(&mut self, now: Instant) {
        self.running = true;
        self.paused = false;
        self.outstanding.clear();
        self.last_pong = Some(now);
        self.last_tick = Some(now);
    }

    pub fn stop(&mut self) {
        self.running = false;
        self.outstanding.clear();
        self.last_pong = None;
    }

    pub fn pause(&mut self) {
        self.paused = true;
    }

    /// Resuming restarts the silence clock; time spent hidden is not held
    /// against the peer.
    pub fn resume(&mut self, now: Instant) {
        self.paused = false;
        if self.running {
            self.last_pong = Some(now);
        }
    }

    /// True when ticks stopped arriving for several intervals, which is what
    /// a suspended process looks like from the inside.
    pub fn is_stale(&self, now: Instant) -> bool {
        self.last_tick
            .is_some_and(|last| now.saturating_duration_since(last) > self.interval * 3)
    }

    pub fn tick(&mut self, now: Instant, channel_open: bool) -> Tick {
        if !self.running {
            return Tick::Idle;
        }
        self.last_tick = Some(now);
        if self.paused {
            return Tick::Idle;
        }
        if let Some(last) = self.last_pong {
            if now.saturating_duration_since(last) >= self.pong_timeout {
                self.last_pong = Some(now);
                self.outstanding.clear();
                return Tick::TimedOut;
            }
        }
        if !channel_open {
            return Tick::Idle;
        }
        let id = self.next_id;
        self.next_id += 1;
        if self.outstanding.len() >= MAX_OUTSTANDING {
            self.outstanding.pop_front();
        }
        self.outstanding.push_back((id, now));
        Tick::SendPing { id }
    }

    /// Returns the round trip time when `id` answers an outstanding ping.
    pub fn on_pong(&mut self, id: u64, now: Instant) -> Option<Duration> {
        let position = self.outstanding.iter().position(|(sent, _)| *sent == id)?;
        let (_, sent_at) = self.outstanding[position];
        self.outstanding.drain(..=position);
        self.last_pong = Some(now);
        Some(now.saturating_duration_since(sent_at))
    }
}

//! Connection health and the recovery ladder.
//!
//! The ladder escalates from waiting out a blip, through ICE restarts with
//! exponential backoff, to one full reconnect, and finally gives up until
//! the user asks for a manual retry. Like the negotiator it is pure: inputs
//! in, [`Command`]s out, timers owned by the caller.

pub mod heartbeat;

use std::time::Duration;

use crate::config::SessionConfig;
use crate::transport::{ConnectionState, IceConnectionState};

pub use heartbeat::{Heartbeat, Tick};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Negotiating,
    Connected,
    Disconnected,
    Recovering,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecoveryTimer {
    NegotiationDeadline,
    DisconnectGrace,
    RestartBackoff,
    RestartDeadline,
    LivenessProbe,
    SignalingBackoff,
}

const ALL_LINK_TIMERS: [RecoveryTimer; 5] = [
    RecoveryTimer::NegotiationDeadline,
    RecoveryTimer::DisconnectGrace,
    RecoveryTimer::RestartBackoff,
    RecoveryTimer::RestartDeadline,
    RecoveryTimer::LivenessProbe,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Input {
    NegotiationStarted,
    NegotiationFailed,
    PeerConnection(ConnectionState),
    Ice(IceConnectionState),
    PongTimeout,
    PongReceived,
    Foreground { likely_slept: bool },
    SignalingLost,
    SignalingRestored,
    ManualRetry,
    PeerGone,
    TimerFired(RecoveryTimer),
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Arm(RecoveryTimer, Duration),
    Cancel(RecoveryTimer),
    RestartIce { attempt: u32 },
    FullReconnect { attempt: u32 },
    ReconnectSignaling { attempt: u32 },
    StartHeartbeat,
    StopHeartbeat,
    ProbeLiveness,
    /// Share local preferences (background settings) with a fresh peer.
    BroadcastSettings,
    PhaseChanged(Phase),
}

#[derive(Debug, Clone, Copy)]
pub struct RecoveryPolicy {
    pub disconnect_grace: Duration,
    pub max_ice_restarts: u32,
    pub restart_backoff_base: Duration,
    pub restart_timeout: Duration,
    pub negotiation_timeout: Duration,
    pub max_full_reconnects: u32,
    pub probe_timeout: Duration,
    pub signaling_backoff_base: Duration,
    pub signaling_backoff_cap: Duration,
}

impl RecoveryPolicy {
    pub fn from_config(config: &SessionConfig) -> Self {
        Self {
            disconnect_grace: config.disconnect_grace,
            max_ice_restarts: config.max_ice_restarts,
            restart_backoff_base: config.restart_backoff_base,
            restart_timeout: config.restart_timeout,
            negotiation_timeout: config.negotiation_timeout,
            max_full_reconnects: config.max_full_reconnects,
            probe_timeout: config.heartbeat_interval,
            signaling_backoff_base: config.signaling_backoff_base,
            signaling_backoff_cap: config.signaling_backoff_cap,
        }
    }

    fn restart_delay(&self, attempt: u32) -> Duration {
        exponential(self.restart_backoff_base, attempt, None)
    }

    fn signaling_delay(&self, attempt: u32) -> Duration {
        exponential(
            self.signaling_backoff_base,
            attempt,
            Some(self.signaling_backoff_cap),
        )
    }
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self::from_config(&SessionConfig::default())
    }
}

fn exponential(base: Duration, attempt: u32, cap: Option<Duration>) -> Duration {
    let delay = base.saturating_mul(1u32 << attempt.saturating_sub(1).min(16));
    cap.map_or(delay, |cap| delay.min(cap))
}

pub struct RecoveryLadder {
    policy: RecoveryPolicy,
    phase: Phase,
    pc_state: ConnectionState,
    ice_state: IceConnectionState,
    ice_restarts: u32,
    full_reconnects: u32,
    restart_pending: bool,
    restart_in_flight: bool,
    /// A full reconnect was issued and its fresh negotiation has not begun.
    reconnect_in_flight: bool,
    probing: bool,
    signaling_up: bool,
    signaling_attempts: u32,
}

impl RecoveryLadder {
    pub fn new(policy: RecoveryPolicy) -> Self {
        Self {
            policy,
            phase: Phase::Idle,
            pc_state: ConnectionState::New,
            ice_state: IceConnectionState::New,
            ice_restarts: 0,
            full_reconnects: 0,
            restart_pending: false,
            restart_in_flight: false,
            reconnect_in_flight: false,
            probing: false,
            signaling_up: true,
            signaling_attempts: 0,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn ice_restarts(&self) -> u32 {
        self.ice_restarts
    }

    pub fn full_reconnects(&self) -> u32 {
        self.full_reconnects
    }

    pub fn signaling_up(&self) -> bool {
        self.signaling_up
    }

    pub fn handle(&mut self, input: Input) -> Vec<Command> {
        if self.phase == Phase::Closed {
            return Vec::new();
        }
        match input {
            Input::NegotiationStarted => self.on_negotiation_started(),
            Input::NegotiationFailed => self.on_negotiation_failed(),
            Input::PeerConnection(state) => {
                self.pc_state = state;
                self.on_link_change()
            }
            Input::Ice(state) => {
                self.ice_state = state;
                self.on_link_change()
            }
            Input::PongTimeout => {
                if self.phase == Phase::Connected {
                    tracing::warn!(target = "duet::recovery", "heartbeat timed out");
                    self.start_restart()
                } else {
                    Vec::new()
                }
            }
            Input::PongReceived => {
                if self.probing {
                    self.probing = false;
                    vec![Command::Cancel(RecoveryTimer::LivenessProbe)]
                } else {
                    Vec::new()
                }
            }
            Input::Foreground { likely_slept } => self.on_foreground(likely_slept),
            Input::SignalingLost => self.on_signaling_lost(),
            Input::SignalingRestored => {
                self.signaling_up = true;
                self.signaling_attempts = 0;
                vec![Command::Cancel(RecoveryTimer::SignalingBackoff)]
            }
            Input::ManualRetry => {
                if matches!(self.phase, Phase::Failed | Phase::Recovering | Phase::Negotiating) {
                    tracing::info!(target = "duet::recovery", "manual retry requested");
                    self.ice_restarts = 0;
                    self.full_reconnects = 0;
                    self.full_reconnect()
                } else {
                    Vec::new()
                }
            }
            Input::PeerGone => {
                let mut out = self.cancel_link_timers();
                self.reset_counters();
                out.push(Command::StopHeartbeat);
                out.extend(self.enter(Phase::Idle));
                out
            }
            Input::TimerFired(timer) => self.on_timer(timer),
            Input::Close => {
                let mut out = self.cancel_link_timers();
                out.push(Command::Cancel(RecoveryTimer::SignalingBackoff));
                out.push(Command::StopHeartbeat);
                out.extend(self.enter(Phase::Closed));
                out
            }
        }
    }

    fn on_negotiation_started(&mut self) -> Vec<Command> {
        let mut out = vec![Command::Arm(
            RecoveryTimer::NegotiationDeadline,
            self.policy.negotiation_timeout,
        )];
        self.pc_state = ConnectionState::New;
        self.ice_state = IceConnectionState::New;
        let reconnecting = std::mem::take(&mut self.reconnect_in_flight);
        if reconnecting
            || matches!(self.phase, Phase::Idle | Phase::Connected | Phase::Disconnected)
        {
            out.extend(self.enter(Phase::Negotiating));
        }
        out
    }

    fn on_negotiation_failed(&mut self) -> Vec<Command> {
        match self.phase {
            Phase::Negotiating | Phase::Recovering => {
                tracing::warn!(target = "duet::recovery", phase = ?self.phase, "negotiation did not complete");
                self.full_reconnect()
            }
            _ => Vec::new(),
        }
    }

    fn on_link_change(&mut self) -> Vec<Command> {
        let connected = self.pc_state == ConnectionState::Connected && self.ice_state.is_connected();
        if connected {
            return self.on_connected();
        }
        let failed = self.pc_state == ConnectionState::Failed
            || self.ice_state == IceConnectionState::Failed;
        if failed {
            return self.on_failed();
        }
        let disconnected = self.pc_state == ConnectionState::Disconnected
            || self.ice_state == IceConnectionState::Disconnected;
        if disconnected && self.phase == Phase::Connected {
            tracing::info!(target = "duet::recovery", "link disconnected, waiting before restart");
            let mut out = vec![Command::Arm(
                RecoveryTimer::DisconnectGrace,
                self.policy.disconnect_grace,
            )];
            out.extend(self.enter(Phase::Disconnected));
            return out;
        }
        Vec::new()
    }

    fn on_connected(&mut self) -> Vec<Command> {
        if self.phase == Phase::Connected {
            return Vec::new();
        }
        let recovered = matches!(self.phase, Phase::Disconnected | Phase::Recovering);
        tracing::info!(
            target = "duet::recovery",
            recovered,
            ice_restarts = self.ice_restarts,
            full_reconnects = self.full_reconnects,
            "peer connection established"
        );
        let mut out = self.cancel_link_timers();
        self.reset_counters();
        out.push(Command::StartHeartbeat);
        out.push(Command::BroadcastSettings);
        out.extend(self.enter(Phase::Connected));
        out
    }

    fn on_failed(&mut self) -> Vec<Command> {
        match self.phase {
            Phase::Connected | Phase::Disconnected => {
                let mut out = vec![Command::Cancel(RecoveryTimer::DisconnectGrace)];
                out.extend(self.schedule_restart());
                out
            }
            Phase::Recovering if self.pc_state == ConnectionState::Failed && self.ice_restarts > 0 => {
                tracing::warn!(target = "duet::recovery", "peer connection failed after ice restart");
                self.full_reconnect()
            }
            Phase::Recovering if self.restart_in_flight => {
                self.restart_in_flight = false;
                let mut out = vec![Command::Cancel(RecoveryTimer::RestartDeadline)];
                out.extend(self.schedule_restart());
                out
            }
            Phase::Negotiating => self.full_reconnect(),
            _ => Vec::new(),
        }
    }

    fn on_foreground(&mut self, likely_slept: bool) -> Vec<Command> {
        let mut out = Vec::new();
        if !self.signaling_up {
            out.push(Command::Cancel(RecoveryTimer::SignalingBackoff));
            out.push(Command::ReconnectSignaling {
                attempt: self.signaling_attempts,
            });
        }
        match self.phase {
            Phase::Connected if likely_slept => {
                tracing::info!(target = "duet::recovery", "resumed after likely sleep, probing link");
                self.probing = true;
                out.push(Command::ProbeLiveness);
                out.push(Command::Arm(
                    RecoveryTimer::LivenessProbe,
                    self.policy.probe_timeout,
                ));
            }
            Phase::Disconnected => {
                out.push(Command::Cancel(RecoveryTimer::DisconnectGrace));
                out.extend(self.start_restart());
            }
            Phase::Recovering if self.restart_pending => {
                out.push(Command::Cancel(RecoveryTimer::RestartBackoff));
                out.extend(self.start_restart());
            }
            _ => {}
        }
        out
    }

    fn on_signaling_lost(&mut self) -> Vec<Command> {
        self.signaling_up = false;
        self.signaling_attempts += 1;
        let delay = self.policy.signaling_delay(self.signaling_attempts);
        tracing::info!(
            target = "duet::recovery",
            attempt = self.signaling_attempts,
            delay_ms = delay.as_millis() as u64,
            "signaling lost, scheduling reconnect"
        );
        vec![Command::Arm(RecoveryTimer::SignalingBackoff, delay)]
    }

    fn on_timer(&mut self, timer: RecoveryTimer) -> Vec<Command> {
        match timer {
            RecoveryTimer::NegotiationDeadline => {
                if matches!(self.phase, Phase::Negotiating | Phase::Recovering) && !self.restart_in_flight {
                    self.on_negotiation_failed()
                } else {
                    Vec::new()
                }
            }
            RecoveryTimer::DisconnectGrace => {
                if self.phase == Phase::Disconnected {
                    self.start_restart()
                } else {
                    Vec::new()
                }
            }
            RecoveryTimer::RestartBackoff => {
                if self.restart_pending {
                    self.start_restart()
                } else {
                    Vec::new()
                }
            }
            RecoveryTimer::RestartDeadline => {
                if self.restart_in_flight {
                    tracing::warn!(target = "duet::recovery", attempt = self.ice_restarts, "ice restart timed out");
                    self.restart_in_flight = false;
                    self.schedule_restart()
                } else {
                    Vec::new()
                }
            }
            RecoveryTimer::LivenessProbe => {
                if self.probing && self.phase == Phase::Connected {
                    self.probing = false;
                    tracing::warn!(target = "duet::recovery", "liveness probe unanswered");
                    self.start_restart()
                } else {
                    Vec::new()
                }
            }
            RecoveryTimer::SignalingBackoff => {
                if self.signaling_up {
                    Vec::new()
                } else {
                    vec![Command::ReconnectSignaling {
                        attempt: self.signaling_attempts,
                    }]
                }
            }
        }
    }

    fn schedule_restart(&mut self) -> Vec<Command> {
        if self.ice_restarts >= self.policy.max_ice_restarts {
            return self.full_reconnect();
        }
        let attempt = self.ice_restarts + 1;
        let delay = self.policy.restart_delay(attempt);
        tracing::info!(
            target = "duet::recovery",
            attempt,
            delay_ms = delay.as_millis() as u64,
            "scheduling ice restart"
        );
        self.restart_pending = true;
        let mut out = vec![Command::Arm(RecoveryTimer::RestartBackoff, delay)];
        out.extend(self.enter(Phase::Recovering));
        out
    }

    fn start_restart(&mut self) -> Vec<Command> {
        if self.ice_restarts >= self.policy.max_ice_restarts {
            return self.full_reconnect();
        }
        self.ice_restarts += 1;
        self.restart_pending = false;
        self.restart_in_flight = true;
        let mut out = vec![
            Command::Cancel(RecoveryTimer::RestartBackoff),
            Command::RestartIce {
                attempt: self.ice_restarts,
            },
            Command::Arm(RecoveryTimer::RestartDeadline, self.policy.restart_timeout),
        ];
        out.extend(self.enter(Phase::Recovering));
        out
    }

    fn full_reconnect(&mut self) -> Vec<Command> {
        let mut out = self.cancel_link_timers();
        self.restart_pending = false;
        self.restart_in_flight = false;
        self.reconnect_in_flight = false;
        self.probing = false;
        if self.full_reconnects >= self.policy.max_full_reconnects {
            tracing::error!(
                target = "duet::recovery",
                full_reconnects = self.full_reconnects,
                "recovery exhausted, waiting for manual retry"
            );
            out.push(Command::StopHeartbeat);
            out.extend(self.enter(Phase::Failed));
            return out;
        }
        self.full_reconnects += 1;
        self.ice_restarts = 0;
        self.reconnect_in_flight = true;
        tracing::warn!(target = "duet::recovery", attempt = self.full_reconnects, "full reconnect");
        out.push(Command::StopHeartbeat);
        out.push(Command::FullReconnect {
            attempt: self.full_reconnects,
        });
        out.push(Command::Arm(
            RecoveryTimer::NegotiationDeadline,
            self.policy.negotiation_timeout,
        ));
        out.extend(self.enter(Phase::Recovering));
        out
    }

    fn cancel_link_timers(&self) -> Vec<Command> {
        ALL_LINK_TIMERS.iter().copied().map(Command::Cancel).collect()
    }

    fn reset_counters(&mut self) {
        self.ice_restarts = 0;
        self.full_reconnects = 0;
        self.signaling_attempts = 0;
        self.restart_pending = false;
        self.restart_in_flight = false;
        self.reconnect_in_flight = false;
        self.probing = false;
    }

    fn enter(&mut self, phase: Phase) -> Vec<Command> {
        if self.phase == phase {
            return Vec::new();
        }
        tracing::debug!(target = "duet::recovery", from = ?self.phase, to = ?phase, "phase change");
        self.phase = phase;
        vec![Command::PhaseChanged(phase)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ladder() -> RecoveryLadder {
        RecoveryLadder::new(RecoveryPolicy::default())
    }

    fn connect(ladder: &mut RecoveryLadder) -> Vec<Command> {
        ladder.handle(Input::NegotiationStarted);
        ladder.handle(Input::Ice(IceConnectionState::Connected));
        ladder.handle(Input::PeerConnection(ConnectionState::Connected))
    }

    fn armed(commands: &[Command], timer: RecoveryTimer) -> Option<Duration> {
        commands.iter().find_map(|c| match c {
            Command::Arm(t, d) if *t == timer => Some(*d),
            _ => None,
        })
    }

    #[test_timeout::timeout]
    fn connecting_starts_heartbeat_and_broadcasts() {
        let mut l = ladder();
        let out = l.handle(Input::NegotiationStarted);
        assert_eq!(
            armed(&out, RecoveryTimer::NegotiationDeadline),
            Some(Duration::from_secs(30))
        );
        assert!(out.contains(&Command::PhaseChanged(Phase::Negotiating)));

        l.handle(Input::Ice(IceConnectionState::Connected));
        let out = l.handle(Input::PeerConnection(ConnectionState::Connected));
        assert!(out.contains(&Command::StartHeartbeat));
        assert!(out.contains(&Command::BroadcastSettings));
        assert!(out.contains(&Command::Cancel(RecoveryTimer::NegotiationDeadline)));
        assert_eq!(l.phase(), Phase::Connected);
    }

    #[test_timeout::timeout]
    fn blip_inside_grace_needs_no_restart() {
        let mut l = ladder();
        connect(&mut l);
        let out = l.handle(Input::Ice(IceConnectionState::Disconnected));
        assert_eq!(
            armed(&out, RecoveryTimer::DisconnectGrace),
            Some(Duration::from_secs(3))
        );
        assert_eq!(l.phase(), Phase::Disconnected);

        let out = l.handle(Input::Ice(IceConnectionState::Connected));
        assert!(out.contains(&Command::Cancel(RecoveryTimer::DisconnectGrace)));
        assert!(!out.iter().any(|c| matches!(c, Command::RestartIce { .. })));
        assert_eq!(l.phase(), Phase::Connected);
    }

    #[test_timeout::timeout]
    fn grace_expiry_restarts_immediately() {
        let mut l = ladder();
        connect(&mut l);
        l.handle(Input::Ice(IceConnectionState::Disconnected));
        let out = l.handle(Input::TimerFired(RecoveryTimer::DisconnectGrace));
        assert!(out.contains(&Command::RestartIce { attempt: 1 }));
        assert_eq!(
            armed(&out, RecoveryTimer::RestartDeadline),
            Some(Duration::from_secs(10))
        );
    }

    #[test_timeout::timeout]
    fn failed_restarts_escalate_to_one_full_reconnect_then_fail() {
        let mut l = ladder();
        connect(&mut l);

        let mut out = l.handle(Input::Ice(IceConnectionState::Failed));
        for (attempt, delay) in [(1, 1), (2, 2), (3, 4)] {
            assert_eq!(
                armed(&out, RecoveryTimer::RestartBackoff),
                Some(Duration::from_secs(delay)),
                "backoff before attempt {attempt}"
            );
            let fired = l.handle(Input::TimerFired(RecoveryTimer::RestartBackoff));
            assert!(fired.contains(&Command::RestartIce { attempt }));
            out = l.handle(Input::TimerFired(RecoveryTimer::RestartDeadline));
        }
        assert!(out.contains(&Command::FullReconnect { attempt: 1 }));
        assert_eq!(l.phase(), Phase::Recovering);

        let out = l.handle(Input::TimerFired(RecoveryTimer::NegotiationDeadline));
        assert!(out.contains(&Command::PhaseChanged(Phase::Failed)));
        assert!(!out.iter().any(|c| matches!(c, Command::FullReconnect { .. })));
    }

    #[test_timeout::timeout]
    fn pc_failure_after_restart_goes_straight_to_full_reconnect() {
        let mut l = ladder();
        connect(&mut l);
        l.handle(Input::Ice(IceConnectionState::Failed));
        l.handle(Input::TimerFired(RecoveryTimer::RestartBackoff));
        let out = l.handle(Input::PeerConnection(ConnectionState::Failed));
        assert!(out.contains(&Command::FullReconnect { attempt: 1 }));
    }

    #[test_timeout::timeout]
    fn successful_restart_resets_counters() {
        let mut l = ladder();
        connect(&mut l);
        l.handle(Input::Ice(IceConnectionState::Failed));
        l.handle(Input::TimerFired(RecoveryTimer::RestartBackoff));
        assert_eq!(l.ice_restarts(), 1);
        let out = l.handle(Input::Ice(IceConnectionState::Connected));
        assert!(out.contains(&Command::PhaseChanged(Phase::Connected)));
        assert_eq!(l.ice_restarts(), 0);
        assert!(l
            .handle(Input::TimerFired(RecoveryTimer::RestartDeadline))
            .is_empty());
    }

    #[test_timeout::timeout]
    fn pong_timeout_restarts_without_backoff() {
        let mut l = ladder();
        connect(&mut l);
        let out = l.handle(Input::PongTimeout);
        assert!(out.contains(&Command::RestartIce { attempt: 1 }));
    }

    #[test_timeout::timeout]
    fn signaling_loss_backs_off_without_touching_link() {
        let mut l = ladder();
        connect(&mut l);
        let out = l.handle(Input::SignalingLost);
        assert_eq!(out, vec![Command::Arm(RecoveryTimer::SignalingBackoff, Duration::from_secs(1))]);
        let out = l.handle(Input::TimerFired(RecoveryTimer::SignalingBackoff));
        assert_eq!(out, vec![Command::ReconnectSignaling { attempt: 1 }]);
        let out = l.handle(Input::SignalingLost);
        assert_eq!(
            armed(&out, RecoveryTimer::SignalingBackoff),
            Some(Duration::from_secs(2))
        );
        for _ in 0..10 {
            l.handle(Input::SignalingLost);
        }
        let out = l.handle(Input::SignalingLost);
        assert_eq!(
            armed(&out, RecoveryTimer::SignalingBackoff),
            Some(Duration::from_secs(30))
        );
        assert_eq!(l.phase(), Phase::Connected);

        l.handle(Input::SignalingRestored);
        assert!(l.signaling_up());
        let out = l.handle(Input::SignalingLost);
        assert_eq!(
            armed(&out, RecoveryTimer::SignalingBackoff),
            Some(Duration::from_secs(1))
        );
    }

    #[test_timeout::timeout]
    fn connecting_resets_signaling_backoff() {
        let mut l = ladder();
        connect(&mut l);
        for _ in 0..3 {
            l.handle(Input::SignalingLost);
        }
        l.handle(Input::Ice(IceConnectionState::Disconnected));
        assert_eq!(l.phase(), Phase::Disconnected);
        l.handle(Input::Ice(IceConnectionState::Connected));
        assert_eq!(l.phase(), Phase::Connected);

        let out = l.handle(Input::SignalingLost);
        assert_eq!(
            out,
            vec![Command::Arm(RecoveryTimer::SignalingBackoff, Duration::from_secs(1))]
        );
    }

    #[test_timeout::timeout]
    fn full_reconnect_negotiates_again() {
        let mut l = ladder();
        connect(&mut l);
        l.handle(Input::Ice(IceConnectionState::Failed));
        l.handle(Input::TimerFired(RecoveryTimer::RestartBackoff));
        let out = l.handle(Input::PeerConnection(ConnectionState::Failed));
        assert!(out.contains(&Command::FullReconnect { attempt: 1 }));
        assert_eq!(l.phase(), Phase::Recovering);

        let out = l.handle(Input::NegotiationStarted);
        assert!(out.contains(&Command::PhaseChanged(Phase::Negotiating)));
        assert_eq!(l.phase(), Phase::Negotiating);

        l.handle(Input::Ice(IceConnectionState::Connected));
        let out = l.handle(Input::PeerConnection(ConnectionState::Connected));
        assert!(out.contains(&Command::PhaseChanged(Phase::Connected)));
        assert_eq!(l.full_reconnects(), 0);
    }

    #[test_timeout::timeout]
    fn ice_restart_stays_in_recovering() {
        let mut l = ladder();
        connect(&mut l);
        l.handle(Input::Ice(IceConnectionState::Failed));
        l.handle(Input::TimerFired(RecoveryTimer::RestartBackoff));
        assert_eq!(l.phase(), Phase::Recovering);
        let out = l.handle(Input::NegotiationStarted);
        assert!(!out.iter().any(|c| matches!(c, Command::PhaseChanged(_))));
        assert_eq!(l.phase(), Phase::Recovering);
    }

    #[test_timeout::timeout]
    fn foreground_after_sleep_probes_and_restarts_on_silence() {
        let mut l = ladder();
        connect(&mut l);
        let out = l.handle(Input::Foreground { likely_slept: true });
        assert!(out.contains(&Command::ProbeLiveness));
        let out = l.handle(Input::TimerFired(RecoveryTimer::LivenessProbe));
        assert!(out.contains(&Command::RestartIce { attempt: 1 }));
    }

    #[test_timeout::timeout]
    fn answered_probe_keeps_connection() {
        let mut l = ladder();
        connect(&mut l);
        l.handle(Input::Foreground { likely_slept: true });
        l.handle(Input::PongReceived);
        assert!(l
            .handle(Input::TimerFired(RecoveryTimer::LivenessProbe))
            .is_empty());
        assert!(l.handle(Input::Foreground { likely_slept: false }).is_empty());
    }

    #[test_timeout::timeout]
    fn foreground_fires_pending_backoff() {
        let mut l = ladder();
        connect(&mut l);
        l.handle(Input::Ice(IceConnectionState::Failed));
        let out = l.handle(Input::Foreground { likely_slept: false });
        assert!(out.contains(&Command::RestartIce { attempt: 1 }));
    }

    #[test_timeout::timeout]
    fn manual_retry_from_failed_resets_ladder() {
        let mut l = ladder();
        l.handle(Input::NegotiationStarted);
        l.handle(Input::TimerFired(RecoveryTimer::NegotiationDeadline));
        l.handle(Input::TimerFired(RecoveryTimer::NegotiationDeadline));
        assert_eq!(l.phase(), Phase::Failed);

        let out = l.handle(Input::ManualRetry);
        assert!(out.contains(&Command::FullReconnect { attempt: 1 }));
        assert_eq!(l.phase(), Phase::Recovering);
    }

    #[test_timeout::timeout]
    fn closed_ladder_ignores_everything() {
        let mut l = ladder();
        connect(&mut l);
        l.handle(Input::Close);
        assert!(l.handle(Input::Ice(IceConnectionState::Failed)).is_empty());
        assert!(l.handle(Input::ManualRetry).is_empty());
        assert_eq!(l.phase(), Phase::Closed);
    }
}

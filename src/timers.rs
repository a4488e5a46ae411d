//! C4: The timer set (spec.md §4.4).
//!
//! All four timers are session-owned and single-shot; `invite2xxTimer`
//! re-arms itself on every fire while still `WAITING_FOR_ACK`. Modeled after
//! `ezk-sip-ua`'s `invite::timer::SessionTimer`, which represents an
//! optionally-armed timer as a `Pin<Box<Sleep>>` behind an enum so that an
//! unarmed timer can be `select!`ed alongside the others without ever firing
//! (`future::pending`).

use crate::options::TimerConfig;
use std::future::pending;
use std::pin::Pin;
use std::time::Duration;
use tokio::time::{sleep, sleep_until, Instant, Sleep};

enum Slot {
    Idle,
    Armed(Pin<Box<Sleep>>),
}

impl Slot {
    async fn wait(&mut self) {
        match self {
            Slot::Idle => pending().await,
            Slot::Armed(sleep) => sleep.await,
        }
    }
}

/// Which of the four timers fired. Returned by [`TimerSet::select`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerEvent {
    Invite2xx,
    Ack,
    UserNoAnswer,
    Expires,
}

/// Owns the four timers described in spec.md §4.4. Every timer is cleared
/// whenever [`TimerSet::cancel_all`] runs, which every path into
/// `TERMINATED` must call (spec.md invariant 3).
pub struct TimerSet {
    config: TimerConfig,

    invite_2xx: Slot,
    /// Current retransmit interval for `invite2xxTimer`, doubled (capped at
    /// T2) on every fire.
    invite_2xx_interval: Duration,

    ack: Slot,
    user_no_answer: Slot,
    expires: Slot,
}

impl TimerSet {
    pub fn new(config: TimerConfig) -> Self {
        Self {
            config,
            invite_2xx: Slot::Idle,
            invite_2xx_interval: config.t1,
            ack: Slot::Idle,
            user_no_answer: Slot::Idle,
            expires: Slot::Idle,
        }
    }

    /// Arm `invite2xxTimer` at T1 (spec.md §4.4: "schedule at T1").
    pub fn arm_invite_2xx(&mut self) {
        self.invite_2xx_interval = self.config.t1;
        self.invite_2xx = Slot::Armed(Box::pin(sleep(self.invite_2xx_interval)));
    }

    /// Re-arm `invite2xxTimer` at `min(2·previous, T2)` after a retransmit.
    pub fn rearm_invite_2xx_backoff(&mut self) {
        self.invite_2xx_interval = (self.invite_2xx_interval * 2).min(self.config.t2);
        self.invite_2xx = Slot::Armed(Box::pin(sleep(self.invite_2xx_interval)));
    }

    pub fn cancel_invite_2xx(&mut self) {
        self.invite_2xx = Slot::Idle;
    }

    /// Arm `ackTimer` at `TIMER_H` (spec.md §4.4).
    pub fn arm_ack(&mut self) {
        self.ack = Slot::Armed(Box::pin(sleep(self.config.timer_h)));
    }

    pub fn cancel_ack(&mut self) {
        self.ack = Slot::Idle;
    }

    /// Arm `userNoAnswerTimer` at the configured `no_answer_timeout`.
    pub fn arm_user_no_answer(&mut self) {
        self.user_no_answer = Slot::Armed(Box::pin(sleep(self.config.no_answer_timeout)));
    }

    pub fn cancel_user_no_answer(&mut self) {
        self.user_no_answer = Slot::Idle;
    }

    /// Arm `expiresTimer` from an inbound `Expires` header value, in seconds
    /// (spec.md §4.3: "value in seconds × 1000 ms").
    pub fn arm_expires(&mut self, expires_secs: u32) {
        let deadline = Instant::now() + Duration::from_secs(u64::from(expires_secs));
        self.expires = Slot::Armed(Box::pin(sleep_until(deadline)));
    }

    pub fn cancel_expires(&mut self) {
        self.expires = Slot::Idle;
    }

    /// Cancel every timer. Must run on every path into `TERMINATED`
    /// (spec.md invariant 3).
    pub fn cancel_all(&mut self) {
        self.invite_2xx = Slot::Idle;
        self.ack = Slot::Idle;
        self.user_no_answer = Slot::Idle;
        self.expires = Slot::Idle;
    }

    /// Wait for whichever armed timer fires next. If no timer is armed this
    /// never resolves, which is intended: callers `select!` this alongside
    /// other event sources (inbound messages, media callbacks).
    pub async fn select(&mut self) -> TimerEvent {
        tokio::select! {
            _ = self.invite_2xx.wait() => TimerEvent::Invite2xx,
            _ = self.ack.wait() => TimerEvent::Ack,
            _ = self.user_no_answer.wait() => TimerEvent::UserNoAnswer,
            _ = self.expires.wait() => TimerEvent::Expires,
        }
    }
}

impl std::fmt::Debug for TimerSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerSet")
            .field("invite_2xx_interval", &self.invite_2xx_interval)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn invite_2xx_backs_off_and_caps_at_t2() {
        let config = TimerConfig::default();
        let mut timers = TimerSet::new(config);

        timers.arm_invite_2xx();
        assert_eq!(timers.select().await, TimerEvent::Invite2xx);
        assert_eq!(timers.invite_2xx_interval, config.t1);

        timers.rearm_invite_2xx_backoff();
        assert_eq!(timers.select().await, TimerEvent::Invite2xx);
        assert_eq!(timers.invite_2xx_interval, config.t1 * 2);

        timers.rearm_invite_2xx_backoff();
        assert_eq!(timers.select().await, TimerEvent::Invite2xx);
        assert_eq!(timers.invite_2xx_interval, config.t2);

        // Further backoff stays capped at T2.
        timers.rearm_invite_2xx_backoff();
        assert_eq!(timers.invite_2xx_interval, config.t2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_all_disarms_everything() {
        let mut timers = TimerSet::new(TimerConfig::default());
        timers.arm_ack();
        timers.arm_user_no_answer();
        timers.cancel_all();

        // Nothing is armed: select() must never resolve. We race it against
        // a short timeout instead of waiting forever.
        let raced = tokio::time::timeout(Duration::from_secs(1), timers.select()).await;
        assert!(raced.is_err());
    }
}

//! C5: The DTMF scheduler (spec.md §4.5).
//!
//! Paces a queue of tones at a fixed cadence, honoring the comma as a fixed
//! 2000ms pause that emits no event. Built the same way [`crate::timers`]
//! models an optionally-armed timer: the currently-armed `Sleep` is a field
//! on the scheduler rather than an owned, possibly-cancelled future, so a
//! `select!` branch that loses the race never loses queued state.

use crate::error::{Result, SessionError};
use crate::options::{SendDtmfOptions, COMMA_PAUSE};
use std::collections::VecDeque;
use std::future::pending;
use std::pin::Pin;
use std::time::Duration;
use tokio::time::{sleep, Sleep};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemKind {
    Tone(char),
    Pause,
}

struct Item {
    kind: ItemKind,
    /// Delay from the previous item's completion before this one fires.
    delay: Duration,
    /// The clamped tone duration to report alongside a `Tone` item; unused
    /// for `Pause` (the comma emits no event at all).
    duration: Duration,
}

enum Slot {
    Idle,
    Armed(Pin<Box<Sleep>>),
}

/// Validates tone characters against `[0-9A-D#*,]`, case-insensitively
/// (spec.md §4.5).
fn is_valid_tone_char(c: char) -> bool {
    matches!(c.to_ascii_uppercase(), '0'..='9' | 'A'..='D' | '#' | '*' | ',')
}

/// Owns the in-flight/pending DTMF tone queue for one session.
pub struct DtmfScheduler {
    queue: VecDeque<Item>,
    timer: Slot,
    /// What the *next* appended item's `delay` should be: the duration+gap
    /// of the last appended tone, or the fixed comma pause.
    next_contribution: Duration,
}

impl Default for DtmfScheduler {
    fn default() -> Self {
        Self {
            queue: VecDeque::new(),
            timer: Slot::Idle,
            next_contribution: Duration::ZERO,
        }
    }
}

impl DtmfScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// spec.md §4.5: "If a DTMF burst is already in flight (`tones != null`),
    /// additional calls append to the queue and return immediately;
    /// otherwise a new schedule begins with a 0ms initial delay."
    pub fn is_active(&self) -> bool {
        !matches!(self.timer, Slot::Idle) || !self.queue.is_empty()
    }

    /// Validate and enqueue `tones`. Returns immediately; tones are paced by
    /// [`DtmfScheduler::select`].
    pub fn enqueue(&mut self, tones: &str, options: &SendDtmfOptions) -> Result<()> {
        if tones.is_empty() {
            return Err(SessionError::InvalidArgument("DTMF tone string is empty"));
        }
        if !tones.chars().all(is_valid_tone_char) {
            return Err(SessionError::InvalidArgument(
                "DTMF tones must be drawn from [0-9A-D#*,]",
            ));
        }
        options.validate()?;
        let clamped = options.clamp();

        for c in tones.chars() {
            let delay = self.next_contribution;

            if c == ',' {
                self.queue.push_back(Item {
                    kind: ItemKind::Pause,
                    delay,
                    duration: Duration::ZERO,
                });
                self.next_contribution = COMMA_PAUSE;
            } else {
                self.queue.push_back(Item {
                    kind: ItemKind::Tone(c.to_ascii_uppercase()),
                    delay,
                    duration: clamped.duration,
                });
                self.next_contribution = clamped.duration + clamped.inter_tone_gap;
            }
        }

        self.arm_if_idle();
        Ok(())
    }

    fn arm_if_idle(&mut self) {
        if matches!(self.timer, Slot::Idle) {
            if let Some(item) = self.queue.front() {
                self.timer = Slot::Armed(Box::pin(sleep(item.delay)));
            }
        }
    }

    /// Drop every pending tone. Called on session termination or after a
    /// failed single-tone send (spec.md §4.5).
    pub fn clear(&mut self) {
        self.queue.clear();
        self.timer = Slot::Idle;
        self.next_contribution = Duration::ZERO;
    }

    /// Wait for the next tone to become due, skipping over comma pauses
    /// internally (they emit no event). Never resolves while the queue is
    /// empty, so this can be `select!`ed alongside other event sources.
    /// Returns the tone together with its clamped duration, since the caller
    /// (`Session::handle_dtmf_tick`) needs both to emit `newDTMF` and relay
    /// the tone's `Signal=`/`Duration=` INFO body.
    pub async fn select(&mut self) -> (char, Duration) {
        loop {
            match &mut self.timer {
                Slot::Idle => pending::<()>().await,
                Slot::Armed(sleep) => sleep.await,
            }

            let item = self
                .queue
                .pop_front()
                .expect("an armed timer always has a queued item");

            self.timer = match self.queue.front() {
                Some(next) => Slot::Armed(Box::pin(sleep(next.delay))),
                None => Slot::Idle,
            };

            match item.kind {
                ItemKind::Tone(c) => return (c, item.duration),
                ItemKind::Pause => continue,
            }
        }
    }
}

/// Receives inbound DTMF relayed via in-dialog INFO (spec.md §4.3, §9's
/// Open Question: "the event name `newDTMF` is declared but not emitted
/// anywhere in the source covered — implementers should emit it from the
/// DTMF receiver").
#[derive(Debug, Default)]
pub struct DtmfReceiver;

/// A tone received via `application/dtmf-relay` INFO.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceivedTone {
    pub tone: char,
    pub duration: Duration,
}

impl DtmfReceiver {
    /// Parse an `application/dtmf-relay` INFO body
    /// (`Signal=<tone>\r\nDuration=<ms>`).
    pub fn parse(body: &[u8]) -> Option<ReceivedTone> {
        let text = std::str::from_utf8(body).ok()?;
        let mut tone = None;
        let mut duration_ms = 100u64;

        for line in text.lines() {
            let (key, value) = line.split_once('=')?;
            match key.trim().to_ascii_lowercase().as_str() {
                "signal" => tone = value.trim().chars().next().map(|c| c.to_ascii_uppercase()),
                "duration" => duration_ms = value.trim().parse().unwrap_or(duration_ms),
                _ => {}
            }
        }

        tone.map(|tone| ReceivedTone {
            tone,
            duration: Duration::from_millis(duration_ms),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn comma_pause_emits_no_event_and_takes_2s() {
        let mut scheduler = DtmfScheduler::new();
        scheduler
            .enqueue("1,2", &SendDtmfOptions::default())
            .unwrap();

        let start = tokio::time::Instant::now();
        let (first, duration) = scheduler.select().await;
        assert_eq!(first, '1');
        assert_eq!(duration, crate::options::DEFAULT_DURATION);
        assert_eq!(tokio::time::Instant::now() - start, Duration::ZERO);

        let start = tokio::time::Instant::now();
        let (second, duration) = scheduler.select().await;
        assert_eq!(second, '2');
        assert_eq!(duration, crate::options::DEFAULT_DURATION);
        assert_eq!(tokio::time::Instant::now() - start, COMMA_PAUSE);
    }

    #[tokio::test(start_paused = true)]
    async fn queueing_while_active_concatenates_order() {
        let mut scheduler = DtmfScheduler::new();
        scheduler.enqueue("12", &SendDtmfOptions::default()).unwrap();
        assert!(scheduler.is_active());
        scheduler.enqueue("34", &SendDtmfOptions::default()).unwrap();

        let mut out = String::new();
        for _ in 0..4 {
            out.push(scheduler.select().await.0);
        }
        assert_eq!(out, "1234");
        assert!(!scheduler.is_active());
    }

    #[tokio::test]
    async fn rejects_invalid_characters() {
        let mut scheduler = DtmfScheduler::new();
        assert!(scheduler
            .enqueue("1x2", &SendDtmfOptions::default())
            .is_err());
    }

    #[test]
    fn parses_dtmf_relay_body() {
        let parsed = DtmfReceiver::parse(b"Signal=5\r\nDuration=160\r\n").unwrap();
        assert_eq!(parsed.tone, '5');
        assert_eq!(parsed.duration, Duration::from_millis(160));
    }
}

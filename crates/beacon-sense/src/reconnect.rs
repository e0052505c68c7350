//! Fixed-interval sensor reconnection state.
//!
//! Deliberately a plain deadline holder: the stream session polls the
//! deadline from its own select loop, so only one retry timer can exist and
//! a stopped session cannot observe a late firing.

use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryState {
    Idle,
    Retrying,
}

#[derive(Debug)]
pub struct Reconnector {
    delay: Duration,
    deadline: Option<Instant>,
    attempts: u32,
}

impl Reconnector {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            deadline: None,
            attempts: 0,
        }
    }

    pub fn state(&self) -> RetryState {
        if self.deadline.is_some() {
            RetryState::Retrying
        } else {
            RetryState::Idle
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Arms (or re-arms) the retry deadline. Replaces any armed deadline;
    /// timers never stack.
    pub fn arm(&mut self) {
        self.deadline = Some(Instant::now() + self.delay);
        self.attempts += 1;
        debug!("reconnect: armed attempt {} in {:?}", self.attempts, self.delay);
    }

    pub fn disarm(&mut self) {
        self.deadline = None;
        self.attempts = 0;
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Consumes the armed deadline when it fires.
    pub fn take_deadline(&mut self) -> Option<Instant> {
        self.deadline.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn rearming_replaces_the_deadline_instead_of_stacking() {
        let mut r = Reconnector::new(Duration::from_secs(10));
        assert_eq!(r.state(), RetryState::Idle);

        r.arm();
        let first = r.deadline().unwrap();

        tokio::time::advance(Duration::from_secs(4)).await;
        r.arm();
        let second = r.deadline().unwrap();

        assert!(second > first, "re-arm must push the deadline out");
        assert_eq!(r.state(), RetryState::Retrying);
        assert_eq!(r.attempts(), 2);

        r.disarm();
        assert_eq!(r.state(), RetryState::Idle);
        assert_eq!(r.attempts(), 0);
        assert!(r.deadline().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn fixed_delay_does_not_escalate() {
        let mut r = Reconnector::new(Duration::from_secs(10));
        r.arm();
        let gap1 = r.take_deadline().unwrap() - Instant::now();
        r.arm();
        let gap2 = r.take_deadline().unwrap() - Instant::now();
        assert_eq!(gap1, gap2);
    }
}

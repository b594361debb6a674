use std::time::{Duration, Instant};

/// Minimum interval between two triggered side effects
#[derive(Debug, Clone)]
pub struct Cooldown {
    window: Duration,
    last_fired: Option<Instant>,
}

impl Cooldown {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_fired: None,
        }
    }

    /// Claim the slot at `now`. False while the previous firing is still
    /// inside the window.
    pub fn try_acquire(&mut self, now: Instant) -> bool {
        match self.last_fired {
            Some(last) if now.saturating_duration_since(last) < self.window => false,
            _ => {
                self.last_fired = Some(now);
                true
            }
        }
    }

    pub fn remaining(&self, now: Instant) -> Duration {
        self.last_fired
            .map(|last| self.window.saturating_sub(now.saturating_duration_since(last)))
            .unwrap_or(Duration::ZERO)
    }
}

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Sliding-window limiter for chat turns, keyed by principal.
#[derive(Clone)]
pub struct TurnLimiter {
    inner: Arc<Mutex<HashMap<String, VecDeque<Instant>>>>,
    window: Duration,
    turns_per_window: u32,
    max_keys: usize,
}

impl TurnLimiter {
    pub fn new(window: Duration, turns_per_window: u32, max_keys: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            window,
            turns_per_window,
            max_keys,
        }
    }

    pub fn disabled() -> Self {
        Self::new(Duration::from_secs(1), 0, 1)
    }

    /// Records a turn for `principal_id`. When the window is full, returns how
    /// long until the oldest turn leaves it.
    pub fn try_acquire(&self, principal_id: &str) -> Result<(), Duration> {
        if self.turns_per_window == 0 || self.window.is_zero() {
            return Ok(());
        }

        let now = Instant::now();
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let turns = inner.entry(principal_id.to_string()).or_default();
        prune(turns, now, self.window);
        if turns.len() >= self.turns_per_window as usize {
            let retry_after = turns
                .front()
                .map(|oldest| self.window.saturating_sub(now.duration_since(*oldest)))
                .unwrap_or(self.window);
            return Err(retry_after);
        }
        turns.push_back(now);

        if inner.len() > self.max_keys {
            inner.retain(|_, turns| {
                prune(turns, now, self.window);
                !turns.is_empty()
            });
        }
        if inner.len() > self.max_keys {
            let overflow = inner.len() - self.max_keys;
            let victims = inner
                .keys()
                .filter(|k| k.as_str() != principal_id)
                .take(overflow)
                .cloned()
                .collect::<Vec<_>>();
            for key in victims {
                inner.remove(&key);
            }
        }

        Ok(())
    }
}

fn prune(turns: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(front) = turns.front() {
        if now.duration_since(*front) > window {
            turns.pop_front();
        } else {
            break;
        }
    }
}

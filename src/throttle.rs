use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Spaces outgoing calls at least `interval` apart, across every worker of a
/// job. Slots are handed out in arrival order; the wait itself happens outside
/// the lock.
#[derive(Debug)]
pub struct Throttle {
    interval: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl Throttle {
    pub fn per_minute(requests_per_minute: u32) -> Option<Self> {
        if requests_per_minute == 0 {
            return None;
        }
        Some(Self {
            interval: Duration::from_secs_f64(60.0 / f64::from(requests_per_minute)),
            next_slot: Mutex::new(None),
        })
    }

    /// Waits for the next slot. Returns `false` if `cancel` fired first.
    pub async fn acquire(&self, cancel: &CancellationToken) -> bool {
        let slot = {
            let mut next = self.next_slot.lock().await;
            let now = Instant::now();
            let slot = match *next {
                Some(t) if t > now => t,
                _ => now,
            };
            *next = Some(slot + self.interval);
            slot
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep_until(slot) => true,
        }
    }
}

use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::warn;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    /// Delay before retry number `attempt` (1-based): base, 2x base, 4x base, ...
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(factor)
    }

    pub async fn run<T, E, F, Fut>(&self, operation: &str, mut call: F) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut attempt = 1;
        loop {
            match call(attempt).await {
                Ok(value) => return Ok(value),
                Err(error) if attempt < self.max_attempts => {
                    let delay = self.backoff(attempt);
                    warn!(
                        operation,
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        %error,
                        "retrying after failure"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }
}

/// Round-robin over upstream clients (endpoints or credentials). A client reported as
/// rate limited is skipped until its cooldown elapses.
#[derive(Debug)]
pub struct ClientRotation<T> {
    clients: Vec<T>,
    cooldown: Duration,
    state: Mutex<RotationState>,
}

#[derive(Debug)]
struct RotationState {
    cursor: usize,
    cooling_until: Vec<Option<Instant>>,
}

impl<T> ClientRotation<T> {
    pub fn new(clients: Vec<T>, cooldown: Duration) -> Self {
        let count = clients.len();
        Self {
            clients,
            cooldown,
            state: Mutex::new(RotationState {
                cursor: 0,
                cooling_until: vec![None; count],
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Next available client and its index. When every client is cooling down, the one
    /// whose cooldown ends first is returned rather than failing outright.
    pub fn next(&self) -> Option<(usize, &T)> {
        self.next_at(Instant::now())
    }

    fn next_at(&self, now: Instant) -> Option<(usize, &T)> {
        if self.clients.is_empty() {
            return None;
        }

        let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let count = self.clients.len();

        for offset in 0..count {
            let index = (state.cursor + offset) % count;
            let available = match state.cooling_until[index] {
                Some(until) => until <= now,
                None => true,
            };
            if available {
                state.cooling_until[index] = None;
                state.cursor = (index + 1) % count;
                return Some((index, &self.clients[index]));
            }
        }

        let index = state
            .cooling_until
            .iter()
            .enumerate()
            .min_by_key(|(_, until)| until.unwrap_or(now))
            .map(|(index, _)| index)
            .unwrap_or(0);
        state.cursor = (index + 1) % count;
        Some((index, &self.clients[index]))
    }

    pub fn mark_exhausted(&self, index: usize) {
        self.mark_exhausted_at(index, Instant::now());
    }

    fn mark_exhausted_at(&self, index: usize, now: Instant) {
        let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(slot) = state.cooling_until.get_mut(index) {
            *slot = Some(now + self.cooldown);
            warn!(client = index, cooldown_secs = self.cooldown.as_secs(), "client marked exhausted");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn backoff_doubles() {
        let policy = RetryPolicy::new(4, Duration::from_millis(100));
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(400));
    }

    #[tokio::test]
    async fn retries_until_success() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(3, Duration::from_millis(1));

        let result: Result<u32, String> = policy
            .run("flaky", |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        Err("boom".to_string())
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await;

        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(2, Duration::from_millis(1));

        let result: Result<(), String> = policy
            .run("broken", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("still broken".to_string()) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn rotation_is_round_robin() {
        let rotation = ClientRotation::new(vec!["a", "b", "c"], Duration::from_secs(60));
        let picked = (0..4)
            .filter_map(|_| rotation.next().map(|(_, client)| *client))
            .collect::<Vec<_>>();
        assert_eq!(picked, vec!["a", "b", "c", "a"]);
    }

    #[test]
    fn exhausted_clients_are_skipped_until_cooldown_ends() {
        let rotation = ClientRotation::new(vec!["a", "b"], Duration::from_secs(60));
        let now = Instant::now();
        rotation.mark_exhausted_at(0, now);

        assert_eq!(rotation.next_at(now).map(|(index, _)| index), Some(1));
        assert_eq!(rotation.next_at(now).map(|(index, _)| index), Some(1));

        let later = now + Duration::from_secs(61);
        let picked = (0..2)
            .filter_map(|_| rotation.next_at(later).map(|(index, _)| index))
            .collect::<Vec<_>>();
        assert!(picked.contains(&0));
    }

    #[test]
    fn all_exhausted_still_yields_a_client() {
        let rotation = ClientRotation::new(vec!["a", "b"], Duration::from_secs(60));
        let now = Instant::now();
        rotation.mark_exhausted_at(0, now);
        rotation.mark_exhausted_at(1, now + Duration::from_secs(1));

        assert_eq!(rotation.next_at(now).map(|(index, _)| index), Some(0));
    }

    #[test]
    fn empty_rotation_has_no_client() {
        let rotation: ClientRotation<&str> = ClientRotation::new(Vec::new(), Duration::from_secs(1));
        assert!(rotation.next().is_none());
    }
}

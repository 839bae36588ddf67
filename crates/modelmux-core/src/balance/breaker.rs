use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use super::{Balancer, NoCandidates};

const FAILURE_THRESHOLD: u32 = 5;
const FAILURE_WINDOW: Duration = Duration::from_secs(60);
const COOL_DOWN: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy)]
struct BreakerState {
    failures: u32,
    window_start: Instant,
    open_until: Option<Instant>,
    half_open: bool,
}

/// Circuit-breaker decorator over any balancer. Failures are counted per
/// candidate within a rolling window; a tripped candidate is skipped until
/// the cool-down elapses, then granted a single half-open trial. A success
/// closes the breaker for that candidate.
pub struct Breaker {
    inner: Box<dyn Balancer>,
    states: HashMap<i64, BreakerState>,
}

impl Breaker {
    pub fn new(inner: Box<dyn Balancer>) -> Self {
        Self {
            inner,
            states: HashMap::new(),
        }
    }

    fn record_failure(&mut self, id: i64) {
        let now = Instant::now();
        let state = self.states.entry(id).or_insert(BreakerState {
            failures: 0,
            window_start: now,
            open_until: None,
            half_open: false,
        });
        if now.duration_since(state.window_start) > FAILURE_WINDOW {
            state.failures = 0;
            state.window_start = now;
        }
        state.failures += 1;
        state.half_open = false;
        if state.failures >= FAILURE_THRESHOLD {
            state.open_until = Some(now + COOL_DOWN);
        }
    }
}

impl Balancer for Breaker {
    fn pick(&mut self) -> Result<i64, NoCandidates> {
        loop {
            let id = self.inner.pick()?;
            let now = Instant::now();
            let Some(state) = self.states.get_mut(&id) else {
                return Ok(id);
            };
            let Some(open_until) = state.open_until else {
                return Ok(id);
            };
            if now < open_until || state.half_open {
                // Open, or the single half-open trial is already out.
                // The candidate is gone for the rest of this request.
                self.inner.delete(id);
                continue;
            }
            state.half_open = true;
            return Ok(id);
        }
    }

    fn reduce(&mut self, id: i64) {
        self.record_failure(id);
        self.inner.reduce(id);
    }

    fn delete(&mut self, id: i64) {
        self.record_failure(id);
        self.inner.delete(id);
    }

    fn success(&mut self, id: i64) {
        self.states.remove(&id);
        self.inner.success(id);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::super::Rotor;
    use super::*;

    fn breaker(weights: BTreeMap<i64, u32>) -> Breaker {
        Breaker::new(Box::new(Rotor::new(weights)))
    }

    #[tokio::test(start_paused = true)]
    async fn trips_after_enough_failures() {
        let mut breaker = breaker(BTreeMap::from([(1, 1000)]));

        for _ in 0..FAILURE_THRESHOLD {
            assert_eq!(breaker.pick(), Ok(1));
            breaker.reduce(1);
        }
        // Open now; the only candidate is skipped and the set drains.
        assert_eq!(breaker.pick(), Err(NoCandidates));
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_grants_one_trial_after_cool_down() {
        let mut breaker = breaker(BTreeMap::from([(1, 1000), (2, 1)]));

        for _ in 0..FAILURE_THRESHOLD {
            breaker.reduce(1);
        }

        tokio::time::advance(COOL_DOWN + Duration::from_secs(1)).await;

        // The tripped candidate gets exactly one trial once cooled down.
        let mut saw_one = 0;
        for _ in 0..4 {
            if breaker.pick() == Ok(1) {
                saw_one += 1;
            }
        }
        assert_eq!(saw_one, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn success_closes_the_breaker() {
        let mut breaker = breaker(BTreeMap::from([(1, 1000)]));

        for _ in 0..FAILURE_THRESHOLD - 1 {
            breaker.reduce(1);
        }
        breaker.success(1);
        for _ in 0..FAILURE_THRESHOLD - 1 {
            breaker.reduce(1);
        }
        // The earlier failures were cleared; the candidate is still in.
        assert_eq!(breaker.pick(), Ok(1));
    }

    #[tokio::test(start_paused = true)]
    async fn stale_failures_age_out_of_the_window() {
        let mut breaker = breaker(BTreeMap::from([(1, 1000)]));

        for _ in 0..FAILURE_THRESHOLD - 1 {
            breaker.reduce(1);
        }
        tokio::time::advance(FAILURE_WINDOW + Duration::from_secs(1)).await;
        breaker.reduce(1);
        // One failure in the fresh window: not tripped.
        assert_eq!(breaker.pick(), Ok(1));
    }
}

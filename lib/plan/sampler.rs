use rand::Rng;

/// Cumulative weight before the first draw; above 1 so the first candidate always hits.
const INITIAL_WEIGHT: f64 = 1.01;

/// Front-loaded stochastic selector.
///
/// `pick` is called once per candidate in the caller's visiting order. Candidates visited
/// early are picked with high probability and the odds decay as the target gets used up, so
/// a full pass selects roughly `target` candidates and never more.
#[derive(Debug, Clone)]
pub struct PrioritySampler {
    total: u64,
    remaining: u64,
    cumulative: f64,
    select_all: bool,
}

impl PrioritySampler {
    /// Both inputs are clamped to at least 1.
    pub fn new(total_candidates: u64, target_count: u64) -> Self {
        let total = total_candidates.max(1);
        let remaining = target_count.max(1);
        Self {
            total,
            remaining,
            cumulative: INITIAL_WEIGHT,
            select_all: remaining >= total,
        }
    }

    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    /// Decides whether the next candidate in visiting order is selected.
    pub fn pick<R: Rng + ?Sized>(&mut self, rng: &mut R) -> bool {
        if self.select_all {
            return true;
        }
        if self.remaining == 0 {
            return false;
        }

        self.cumulative += self.remaining as f64 / self.total as f64;
        if rng.gen::<f64>() < self.cumulative {
            self.cumulative = (self.cumulative - 1.0).max(0.0);
            self.remaining -= 1;
            return true;
        }

        false
    }
}

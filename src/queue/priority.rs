//! Weighted-random selection among candidate queues and environments.
//!
//! This strategy is the only knob preventing head-of-line blocking across
//! tenants: a busy tenant's queues get picked less often the more they were
//! recently picked, but any non-empty candidate keeps a positive weight, so
//! starvation is impossible. Over any interval where all queues have
//! messages, per-tenant dequeue rates tend toward `weight / Σ weights`.

use rand::distributions::WeightedIndex;
use rand::prelude::*;
use std::collections::HashMap;
use std::sync::Mutex;

/// Candidate cap when choosing among queues.
pub const DEFAULT_QUEUE_CANDIDATES: usize = 36;
/// Candidate cap when choosing among environments.
pub const DEFAULT_ENV_CANDIDATES: usize = 12;

/// Decay applied to every recent-selection count per `choose` call, so old
/// selections stop penalizing a candidate after a few dozen rounds.
const SELECTION_DECAY: f64 = 0.95;

/// Weighted-random chooser with weights inversely proportional to recent
/// selection counts. Thread-safe; one instance is shared per queue backend.
pub struct PriorityStrategy {
    max_candidates: usize,
    recent: Mutex<HashMap<String, f64>>,
}

impl PriorityStrategy {
    pub fn new(max_candidates: usize) -> Self {
        Self {
            max_candidates,
            recent: Mutex::new(HashMap::new()),
        }
    }

    pub fn for_queues() -> Self {
        Self::new(DEFAULT_QUEUE_CANDIDATES)
    }

    pub fn for_environments() -> Self {
        Self::new(DEFAULT_ENV_CANDIDATES)
    }

    /// Picks one candidate, or `None` for an empty candidate set.
    ///
    /// Only the first `max_candidates` entries participate. The winner's
    /// recent-selection count is bumped so it weighs less next round.
    pub fn choose(&self, candidates: &[String]) -> Option<String> {
        if candidates.is_empty() {
            return None;
        }
        let candidates = &candidates[..candidates.len().min(self.max_candidates)];

        let mut recent = self.recent.lock().unwrap_or_else(|e| e.into_inner());
        for count in recent.values_mut() {
            *count *= SELECTION_DECAY;
        }
        recent.retain(|_, count| *count > 0.01);

        let weights: Vec<f64> = candidates
            .iter()
            .map(|c| 1.0 / (1.0 + recent.get(c).copied().unwrap_or(0.0)))
            .collect();

        let mut rng = rand::thread_rng();
        let chosen = match WeightedIndex::new(&weights) {
            Ok(dist) => &candidates[dist.sample(&mut rng)],
            // All-equal or degenerate weights: uniform tie-break.
            Err(_) => candidates.choose(&mut rng)?,
        };

        *recent.entry(chosen.clone()).or_insert(0.0) += 1.0;
        Some(chosen.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_candidates() {
        let strategy = PriorityStrategy::for_queues();
        assert_eq!(strategy.choose(&[]), None);
    }

    #[test]
    fn test_single_candidate_always_wins() {
        let strategy = PriorityStrategy::for_queues();
        for _ in 0..10 {
            assert_eq!(strategy.choose(&["only".into()]), Some("only".into()));
        }
    }

    #[test]
    fn test_candidate_cap() {
        let strategy = PriorityStrategy::new(2);
        let candidates: Vec<String> = (0..10).map(|i| format!("q{i}")).collect();
        for _ in 0..50 {
            let chosen = strategy.choose(&candidates).unwrap();
            assert!(chosen == "q0" || chosen == "q1");
        }
    }

    #[test]
    fn test_no_starvation() {
        let strategy = PriorityStrategy::for_queues();
        let candidates: Vec<String> = vec!["a".into(), "b".into(), "c".into()];
        let mut hits: HashMap<String, usize> = HashMap::new();
        for _ in 0..3000 {
            let chosen = strategy.choose(&candidates).unwrap();
            *hits.entry(chosen).or_default() += 1;
        }
        // Every candidate gets selected; with inverse-recency weights the
        // split stays roughly fair.
        for c in &candidates {
            let share = hits[c] as f64 / 3000.0;
            assert!(share > 0.15, "candidate {c} starved: share={share}");
        }
    }
}

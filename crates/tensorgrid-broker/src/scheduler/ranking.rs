//! Deterministic candidate ranking.
//!
//! Lower current load wins; equally loaded providers are tie-broken by a
//! seeded rotating index, round-robining across equivalents so repeated
//! placements do not hot-spot one host.

use crate::domain::{Job, Provider};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::sync::atomic::{AtomicUsize, Ordering};

pub struct CandidateRanking {
    rotation: AtomicUsize,
}

impl CandidateRanking {
    pub fn new(seed: u64) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        Self {
            rotation: AtomicUsize::new(rng.gen()),
        }
    }

    /// Order candidates for a job. Providers the job already failed on
    /// within this submission's retry window are excluded.
    pub fn rank(&self, mut candidates: Vec<Provider>, job: &Job) -> Vec<Provider> {
        candidates.retain(|p| !job.has_attempted(&p.id));
        if candidates.len() <= 1 {
            return candidates;
        }

        candidates.sort_by(|a, b| {
            a.current_load
                .cmp(&b.current_load)
                .then_with(|| a.id.as_str().cmp(b.id.as_str()))
        });

        // Rotate within the least-loaded group only; heavier providers
        // keep their relative order behind it.
        let min_load = candidates[0].current_load;
        let group_len = candidates
            .iter()
            .take_while(|p| p.current_load == min_load)
            .count();
        if group_len > 1 {
            let offset = self.rotation.fetch_add(1, Ordering::Relaxed) % group_len;
            candidates[..group_len].rotate_left(offset);
        }

        candidates
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::job::submission_fixture;
    use crate::domain::{GpuDevice, ProviderId, ProviderStatus};
    use chrono::Utc;
    use pretty_assertions::assert_eq;
    use tensorgrid_common::LocationTag;

    fn provider(id: &str, load: u32) -> Provider {
        Provider {
            id: ProviderId::new(id),
            display_name: id.to_string(),
            location: LocationTag::unknown(),
            status: ProviderStatus::Idle,
            gpus: vec![GpuDevice {
                model: "RTX 4090".to_string(),
                vram_mb: 24_576,
                healthy: true,
                power_estimate_w: 450,
            }],
            current_load: load,
            last_seen_at: Utc::now(),
        }
    }

    #[test]
    fn test_lower_load_ranks_first() {
        let ranking = CandidateRanking::new(7);
        let job = Job::from_submission(submission_fixture());

        let ranked = ranking.rank(vec![provider("a", 3), provider("b", 0), provider("c", 1)], &job);
        assert_eq!(ranked[0].id.as_str(), "b");
        assert_eq!(ranked[1].id.as_str(), "c");
        assert_eq!(ranked[2].id.as_str(), "a");
    }

    #[test]
    fn test_equal_load_round_robins() {
        let ranking = CandidateRanking::new(7);
        let job = Job::from_submission(submission_fixture());
        let candidates = || vec![provider("a", 0), provider("b", 0), provider("c", 0)];

        let firsts: Vec<String> = (0..3)
            .map(|_| ranking.rank(candidates(), &job)[0].id.to_string())
            .collect();

        // Three consecutive rankings hit all three equivalent providers
        let mut sorted = firsts.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(sorted.len(), 3);
    }

    #[test]
    fn test_same_seed_gives_same_sequence() {
        let job = Job::from_submission(submission_fixture());
        let candidates = || vec![provider("a", 0), provider("b", 0), provider("c", 0)];

        let run = |seed: u64| -> Vec<String> {
            let ranking = CandidateRanking::new(seed);
            (0..4)
                .map(|_| ranking.rank(candidates(), &job)[0].id.to_string())
                .collect()
        };

        assert_eq!(run(42), run(42));
    }

    #[test]
    fn test_attempted_providers_are_excluded() {
        let ranking = CandidateRanking::new(7);
        let mut job = Job::from_submission(submission_fixture());
        job.assign_provider(ProviderId::new("a"));
        job.clear_assignment();

        let ranked = ranking.rank(vec![provider("a", 0), provider("b", 5)], &job);
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].id.as_str(), "b");
    }
}

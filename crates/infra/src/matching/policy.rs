use serde::{Deserialize, Serialize};

use super::pool::Worker;

/// How candidates are ranked for a job. The first candidate that can be reserved wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum SelectionPolicy {
    /// Highest rating first; ties keep directory order.
    #[default]
    HighestRated,
    /// Restrict to the `limit` earliest-registered workers, then rank by rating.
    HighestRatedAmongOldest { limit: usize },
}

impl SelectionPolicy {
    pub fn rank(&self, mut candidates: Vec<Worker>) -> Vec<Worker> {
        if let SelectionPolicy::HighestRatedAmongOldest { limit } = self {
            candidates.sort_by_key(|w| w.created_at);
            candidates.truncate(*limit);
        }
        // Stable sort: equal ratings stay in first-seen order.
        candidates.sort_by(|a, b| b.rating.cmp(&a.rating));
        candidates
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use rust_decimal_macros::dec;

    #[test]
    fn highest_rating_wins_and_ties_keep_order() {
        let now = Utc::now();
        let low = Worker::new(dec!(3.2), now);
        let high = Worker::new(dec!(4.8), now);
        let tie_a = Worker::new(dec!(4.0), now);
        let tie_b = Worker::new(dec!(4.0), now);

        let ranked = SelectionPolicy::HighestRated.rank(vec![
            low.clone(),
            tie_a.clone(),
            high.clone(),
            tie_b.clone(),
        ]);
        let ids: Vec<_> = ranked.iter().map(|w| w.id).collect();
        assert_eq!(ids, vec![high.id, tie_a.id, tie_b.id, low.id]);
    }

    #[test]
    fn oldest_limit_excludes_newer_workers() {
        let now = Utc::now();
        let old = Worker::new(dec!(3.0), now - Duration::days(10));
        let newer_star = Worker::new(dec!(5.0), now);

        let ranked = SelectionPolicy::HighestRatedAmongOldest { limit: 1 }
            .rank(vec![newer_star, old.clone()]);
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].id, old.id);
    }
}

//! Candidate ranking and ambiguity detection.

use crate::matching::scorer::{amount_delta, date_delta, Candidate, CandidateScorer};
use crate::models::{Receipt, ScoreBreakdown, VendorAlias};
use rust_decimal::Decimal;
use std::cmp::Ordering;

/// A scored candidate with the deltas used for tie-breaking.
#[derive(Debug, Clone)]
pub struct RankedCandidate {
    pub candidate: Candidate,
    pub scores: ScoreBreakdown,
    pub date_delta_days: Option<i64>,
    pub amount_delta: Option<Decimal>,
}

impl RankedCandidate {
    pub fn confidence(&self) -> i32 {
        self.scores.total()
    }

    /// Human-readable explanation stored on the match.
    pub fn reason(&self) -> String {
        let mut parts = vec![format!("score {}", self.confidence())];
        match self.amount_delta {
            Some(d) if d.is_zero() => parts.push("exact amount".to_string()),
            Some(d) => parts.push(format!("amount off by {}", d.round_dp(2))),
            None => parts.push("no receipt amount".to_string()),
        }
        match self.date_delta_days {
            Some(0) => parts.push("same day".to_string()),
            Some(1) => parts.push("1 day apart".to_string()),
            Some(n) => parts.push(format!("{} days apart", n)),
            None => parts.push("no receipt date".to_string()),
        }
        parts.push(format!("vendor {}/{}", self.scores.vendor_score, ScoreBreakdown::MAX_VENDOR));
        parts.join(", ")
    }
}

#[derive(Debug, Clone, Default)]
pub struct Ranking {
    pub candidates: Vec<RankedCandidate>,
    pub ambiguous: bool,
}

impl Ranking {
    /// The best candidate, when it clears the auto-propose threshold.
    pub fn proposable(&self, threshold: i32) -> Option<&RankedCandidate> {
        self.candidates.first().filter(|c| c.confidence() >= threshold)
    }
}

#[derive(Debug, Clone)]
pub struct CandidateRanker {
    scorer: CandidateScorer,
}

impl CandidateRanker {
    pub fn new(scorer: CandidateScorer) -> Self {
        Self { scorer }
    }

    pub fn scorer(&self) -> &CandidateScorer {
        &self.scorer
    }

    pub fn rank(
        &self,
        receipt: &Receipt,
        candidates: &[Candidate],
        aliases: &[VendorAlias],
    ) -> Ranking {
        let mut ranked: Vec<RankedCandidate> = candidates
            .iter()
            .map(|c| RankedCandidate {
                scores: self.scorer.score(receipt, c, aliases),
                date_delta_days: date_delta(receipt, c),
                amount_delta: amount_delta(receipt, c),
                candidate: c.clone(),
            })
            .collect();

        ranked.sort_by(compare_ranked);

        let policy = self.scorer.policy();
        let ambiguous = detect_ambiguity(
            &ranked,
            policy.auto_propose_threshold,
            policy.ambiguity_epsilon,
        );

        Ranking {
            candidates: ranked,
            ambiguous,
        }
    }
}

/// Top two both clear the threshold and sit within `epsilon` of each other.
pub fn detect_ambiguity(ranked: &[RankedCandidate], threshold: i32, epsilon: i32) -> bool {
    match ranked {
        [first, second, ..] => {
            first.confidence() >= threshold
                && second.confidence() >= threshold
                && first.confidence() - second.confidence() < epsilon
        }
        _ => false,
    }
}

/// Missing deltas sort after known ones.
fn compare_ranked(a: &RankedCandidate, b: &RankedCandidate) -> Ordering {
    b.confidence()
        .cmp(&a.confidence())
        .then_with(|| cmp_missing_last(a.date_delta_days, b.date_delta_days))
        .then_with(|| cmp_missing_last(a.amount_delta, b.amount_delta))
        .then_with(|| a.candidate.id().cmp(&b.candidate.id()))
        .then_with(|| a.candidate.target().kind().cmp(b.candidate.target().kind()))
}

fn cmp_missing_last<T: Ord>(a: Option<T>, b: Option<T>) -> Ordering {
    match (a, b) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScoringPolicy;
    use crate::models::Transaction;
    use chrono::NaiveDate;
    use uuid::Uuid;

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, d).unwrap()
    }

    fn ranker() -> CandidateRanker {
        CandidateRanker::new(CandidateScorer::new(ScoringPolicy::default()))
    }

    fn tx_with_id(id: Uuid, d: NaiveDate, cents: i64, desc: &str) -> Candidate {
        let mut t = Transaction::new(d, Decimal::new(cents, 2), desc);
        t.id = id;
        Candidate::Transaction(t)
    }

    fn tx(d: NaiveDate, cents: i64, desc: &str) -> Candidate {
        tx_with_id(Uuid::new_v4(), d, cents, desc)
    }

    #[test]
    fn test_sorted_by_confidence_desc() {
        let r = Receipt::new(Some("Shell"), Some(date(10)), Some(Decimal::new(5000, 2)));
        let candidates = vec![
            tx(date(14), 5000, "UNRELATED"),
            tx(date(10), 5000, "SHELL OIL"),
            tx(date(12), 5200, "SHELL"),
        ];
        let ranking = ranker().rank(&r, &candidates, &[]);
        let scores: Vec<i32> = ranking.candidates.iter().map(|c| c.confidence()).collect();
        let mut sorted = scores.clone();
        sorted.sort_by(|a, b| b.cmp(a));
        assert_eq!(scores, sorted);
        assert_eq!(ranking.candidates[0].candidate.vendor_text(), "SHELL OIL");
    }

    #[test]
    fn test_ties_broken_by_date_then_amount_then_id() {
        let low = Uuid::from_u128(1);
        let high = Uuid::from_u128(2);
        // No receipt vendor, amounts inside the exact tolerance: only date and id differ.
        let r = Receipt::new(None, Some(date(10)), Some(Decimal::new(1000, 2)));

        let same_score = vec![
            tx_with_id(high, date(10), 1000, "A"),
            tx_with_id(low, date(10), 1000, "B"),
        ];
        let ranking = ranker().rank(&r, &same_score, &[]);
        assert_eq!(ranking.candidates[0].candidate.id(), low);

        // Same rounded score, smaller amount delta wins over id.
        let amount_tie = vec![
            tx_with_id(low, date(10), 1001, "A"),
            tx_with_id(high, date(10), 1000, "B"),
        ];
        let ranking = ranker().rank(&r, &amount_tie, &[]);
        assert_eq!(ranking.candidates[0].confidence(), ranking.candidates[1].confidence());
        assert_eq!(ranking.candidates[0].candidate.id(), high);
    }

    #[test]
    fn test_ranking_is_deterministic() {
        let r = Receipt::new(Some("Cafe"), Some(date(10)), Some(Decimal::new(1200, 2)));
        let mut candidates: Vec<Candidate> = (0..20)
            .map(|i| tx(date(8 + (i % 5) as u32), 1200 + (i % 3) * 10, "CAFE"))
            .collect();
        let first: Vec<Uuid> = ranker()
            .rank(&r, &candidates, &[])
            .candidates
            .iter()
            .map(|c| c.candidate.id())
            .collect();
        candidates.reverse();
        let second: Vec<Uuid> = ranker()
            .rank(&r, &candidates, &[])
            .candidates
            .iter()
            .map(|c| c.candidate.id())
            .collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_ambiguous_when_top_two_close_and_above_threshold() {
        let r = Receipt::new(Some("Uber"), Some(date(10)), Some(Decimal::new(2300, 2)));
        let candidates = vec![tx(date(10), 2300, "UBER"), tx(date(11), 2300, "UBER")];
        let ranking = ranker().rank(&r, &candidates, &[]);
        // 100 vs 95: difference 5 is not below epsilon 5
        assert!(!ranking.ambiguous);

        let candidates = vec![tx(date(11), 2300, "UBER"), tx(date(9), 2300, "UBER")];
        let ranking = ranker().rank(&r, &candidates, &[]);
        assert!(ranking.ambiguous);
        assert!(ranking.proposable(60).is_some());
    }

    #[test]
    fn test_below_threshold_not_ambiguous_and_not_proposable() {
        let r = Receipt::new(None, Some(date(1)), Some(Decimal::new(100, 2)));
        let candidates = vec![tx(date(20), 9900, "A"), tx(date(20), 9900, "B")];
        let ranking = ranker().rank(&r, &candidates, &[]);
        assert!(!ranking.ambiguous);
        assert!(ranking.proposable(60).is_none());
    }

    #[test]
    fn test_single_candidate_never_ambiguous() {
        let r = Receipt::new(Some("Uber"), Some(date(10)), Some(Decimal::new(2300, 2)));
        let ranking = ranker().rank(&r, &[tx(date(10), 2300, "UBER")], &[]);
        assert!(!ranking.ambiguous);
        assert_eq!(ranking.proposable(60).map(|c| c.confidence()), Some(100));
    }

    #[test]
    fn test_reason_mentions_components() {
        let r = Receipt::new(Some("Uber"), Some(date(10)), Some(Decimal::new(2300, 2)));
        let ranking = ranker().rank(&r, &[tx(date(11), 2300, "UBER")], &[]);
        let reason = ranking.candidates[0].reason();
        assert!(reason.contains("exact amount"));
        assert!(reason.contains("1 day apart"));
    }
}

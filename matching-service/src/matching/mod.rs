//! The matching engine: scoring, ranking, lifecycle and the coordinators built on them.

pub mod auto_match;
pub mod batch;
pub mod groups;
pub mod lifecycle;
pub mod normalize;
pub mod ranker;
pub mod scorer;

pub use auto_match::{AutoMatchCoordinator, AutoMatchReport, Proposal};
pub use batch::{BatchOperationCoordinator, BatchOutcome};
pub use groups::{GroupCoordinator, GroupDeletion, GroupView};
pub use lifecycle::{ConfirmOutcome, MatchLifecycleManager, UnmatchOutcome};
pub use normalize::{normalize_vendor, NormalizedVendor};
pub use ranker::{CandidateRanker, RankedCandidate, Ranking};
pub use scorer::{Candidate, CandidateScorer};

//! Candidate scoring, match-group preview/apply and aggregate recompute

pub mod allocation;
pub mod apply;
pub mod candidates;
pub mod preview;
pub mod recompute;
pub mod unmatch;

pub use allocation::{allocate_fifo, allocate_many_to_one, allocate_one_to_many, Allocation};
pub use apply::{apply_match_group, MatchGroupApplyResult};
pub use candidates::{find_candidates, CandidateOptions, MatchCandidate, MatchLevel, ScoreBreakdown};
pub use preview::{
    preview_match_group, LineProjection, MatchGroupPreview, MatchGroupRequest, ScheduleProjection,
};
pub use recompute::{recompute_touched, RecomputeSummary};
pub use unmatch::{undo_match_group, unmatch_line, UnmatchResult};

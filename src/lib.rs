//! # Commission Reconciliation Core
//!
//! Matching and allocation engine that reconciles deposit lines (money a
//! vendor or distributor actually paid) against revenue schedules (money the
//! sales pipeline expected).
//!
//! ## Features
//!
//! - **Candidate matching**: fuzzy and exact scoring of open schedules for a deposit line
//! - **Match groups**: 1:1, 1:N and N:1 allocation with validation and projection before commit
//! - **Recompute from source**: schedule, line and deposit figures are always rebuilt from match rows
//! - **Bundle rip-and-replace**: idempotent consolidation of lines into synthetic products and schedules
//! - **Flex resolution**: adjustment, bonus, flex-product and chargeback schedules for variance
//! - **Storage abstraction**: every write runs inside one [`UnitOfWork`] from a [`ReconciliationStore`]
//!
//! ## Quick Start
//!
//! ```rust
//! use commission_recon_core::{
//!     MatchGroupRequest, MatchSource, MemoryStorage, OperationContext, ReconciliationEngine,
//!     StaticPreferences,
//! };
//!
//! // let engine = ReconciliationEngine::new(MemoryStorage::new(), StaticPreferences::default());
//! // let ctx = OperationContext::new("tenant", "user");
//! // engine.apply_match_group(&ctx, &MatchGroupRequest::one_to_one("line", "schedule"), MatchSource::Manual).await?;
//! ```

pub mod bundle;
pub mod config;
pub mod flex;
pub mod matching;
pub mod reconciliation;
pub mod traits;
pub mod types;
pub mod utils;

// Re-export commonly used types
pub use bundle::{BundleRequest, BundleResult, BundleUndoResult};
pub use config::*;
pub use flex::{ChargebackResult, FlexSplitRequest, FlexSplitResult};
pub use matching::{
    Allocation, CandidateOptions, LineProjection, MatchCandidate, MatchGroupApplyResult,
    MatchGroupPreview, MatchGroupRequest, MatchLevel, RecomputeSummary, ScheduleProjection,
    ScoreBreakdown, UnmatchResult,
};
pub use reconciliation::*;
pub use traits::*;
pub use types::*;
pub use utils::memory_storage::MemoryStorage;

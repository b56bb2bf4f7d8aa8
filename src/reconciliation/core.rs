//! Engine that runs each operation inside one unit of work

use crate::bundle::{self, BundleRequest, BundleResult, BundleUndoResult};
use crate::config::MatchingPreferences;
use crate::flex::{self, ChargebackResult, FlexSplitRequest, FlexSplitResult};
use crate::matching::{
    self, CandidateOptions, MatchCandidate, MatchGroupApplyResult, MatchGroupPreview,
    MatchGroupRequest, UnmatchResult,
};
use crate::traits::*;
use crate::types::*;

/// Reconciliation engine over a transactional store and a preferences provider
///
/// Reads (candidates, previews) run in a unit of work that is dropped
/// without committing. Every write runs in exactly one unit of work that is
/// committed only when the whole operation succeeded.
pub struct ReconciliationEngine<S: ReconciliationStore, P: MatchingPreferencesProvider> {
    store: S,
    preferences: P,
}

impl<S: ReconciliationStore, P: MatchingPreferencesProvider> ReconciliationEngine<S, P> {
    /// Create a new engine with the given storage backend and preferences
    pub fn new(store: S, preferences: P) -> Self {
        Self { store, preferences }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Resolve and validate the preferences in force for the caller
    pub async fn preferences(&self, ctx: &OperationContext) -> ReconResult<MatchingPreferences> {
        let preferences = self
            .preferences
            .matching_preferences(&ctx.tenant_id, &ctx.user_id)
            .await?;
        preferences.validate()?;
        Ok(preferences)
    }

    /// Rank candidate schedules for one deposit line
    pub async fn find_candidates(
        &self,
        ctx: &OperationContext,
        line_id: &str,
        options: &CandidateOptions,
    ) -> ReconResult<Vec<MatchCandidate>> {
        let preferences = self.preferences(ctx).await?;
        let tx = self.store.begin().await?;
        matching::find_candidates(&tx, &ctx.tenant_id, line_id, &preferences, options).await
    }

    /// Validate a match group and project its effect
    pub async fn preview_match_group(
        &self,
        ctx: &OperationContext,
        request: &MatchGroupRequest,
    ) -> ReconResult<MatchGroupPreview> {
        let preferences = self.preferences(ctx).await?;
        let tx = self.store.begin().await?;
        matching::preview_match_group(
            &tx,
            &ctx.tenant_id,
            request,
            &preferences.variance_tolerance,
        )
        .await
    }

    /// Re-validate and commit a match group
    pub async fn apply_match_group(
        &self,
        ctx: &OperationContext,
        request: &MatchGroupRequest,
        source: MatchSource,
    ) -> ReconResult<MatchGroupApplyResult> {
        let preferences = self.preferences(ctx).await?;
        let mut tx = self.store.begin().await?;
        let result = matching::apply_match_group(
            &mut tx,
            ctx,
            request,
            &preferences.variance_tolerance,
            source,
        )
        .await?;
        tx.commit().await?;
        Ok(result)
    }

    /// Remove every match of a line
    pub async fn unmatch_line(
        &self,
        ctx: &OperationContext,
        line_id: &str,
    ) -> ReconResult<UnmatchResult> {
        let preferences = self.preferences(ctx).await?;
        let mut tx = self.store.begin().await?;
        let result =
            matching::unmatch_line(&mut tx, ctx, line_id, &preferences.variance_tolerance).await?;
        tx.commit().await?;
        Ok(result)
    }

    /// Remove the matches of a match group
    pub async fn undo_match_group(
        &self,
        ctx: &OperationContext,
        match_group_id: &str,
    ) -> ReconResult<UnmatchResult> {
        let preferences = self.preferences(ctx).await?;
        let mut tx = self.store.begin().await?;
        let result = matching::undo_match_group(
            &mut tx,
            ctx,
            match_group_id,
            &preferences.variance_tolerance,
        )
        .await?;
        tx.commit().await?;
        Ok(result)
    }

    /// Bundle lines idempotently
    ///
    /// When a concurrent duplicate wins the idempotency key, the loser reads
    /// the committed operation back and returns it instead of failing.
    pub async fn bundle_rip_replace(
        &self,
        ctx: &OperationContext,
        request: &BundleRequest,
    ) -> ReconResult<BundleResult> {
        let preferences = self.preferences(ctx).await?;
        let mut tx = self.store.begin().await?;
        let outcome =
            match bundle::bundle_rip_replace(&mut tx, ctx, request, &preferences.variance_tolerance)
                .await
            {
                Ok(result) => tx.commit().await.map(|()| result),
                Err(e) => Err(e),
            };

        match outcome {
            Err(ReconError::UniqueViolation(detail)) => {
                tracing::warn!(
                    tenant_id = %ctx.tenant_id,
                    detail = %detail,
                    "Bundle idempotency key taken concurrently, reading committed result"
                );
                let tx = self.store.begin().await?;
                bundle::find_existing(&tx, &ctx.tenant_id, request)
                    .await?
                    .ok_or(ReconError::UniqueViolation(detail))
            }
            other => other,
        }
    }

    /// Reverse a bundle operation
    pub async fn undo_bundle(
        &self,
        ctx: &OperationContext,
        operation_id: &str,
    ) -> ReconResult<BundleUndoResult> {
        let preferences = self.preferences(ctx).await?;
        let mut tx = self.store.begin().await?;
        let result =
            bundle::undo_bundle(&mut tx, ctx, operation_id, &preferences.variance_tolerance)
                .await?;
        tx.commit().await?;
        Ok(result)
    }

    /// Move part of an applied match onto an Adjustment or Bonus schedule
    pub async fn split_to_adjustment(
        &self,
        ctx: &OperationContext,
        request: &FlexSplitRequest,
    ) -> ReconResult<FlexSplitResult> {
        let preferences = self.preferences(ctx).await?;
        let mut tx = self.store.begin().await?;
        let result =
            flex::split_to_adjustment(&mut tx, ctx, request, &preferences.variance_tolerance)
                .await?;
        tx.commit().await?;
        Ok(result)
    }

    /// Move part of an applied match onto a Flex Product schedule
    pub async fn split_to_flex_product(
        &self,
        ctx: &OperationContext,
        request: &FlexSplitRequest,
    ) -> ReconResult<FlexSplitResult> {
        let preferences = self.preferences(ctx).await?;
        let mut tx = self.store.begin().await?;
        let result =
            flex::split_to_flex_product(&mut tx, ctx, request, &preferences.variance_tolerance)
                .await?;
        tx.commit().await?;
        Ok(result)
    }

    /// Give a negative line its own chargeback schedule
    pub async fn create_chargeback(
        &self,
        ctx: &OperationContext,
        line_id: &str,
    ) -> ReconResult<ChargebackResult> {
        let preferences = self.preferences(ctx).await?;
        let mut tx = self.store.begin().await?;
        let result =
            flex::create_chargeback(&mut tx, ctx, line_id, &preferences.variance_tolerance)
                .await?;
        tx.commit().await?;
        Ok(result)
    }
}

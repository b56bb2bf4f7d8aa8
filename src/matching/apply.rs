//! Commit a validated match group

use std::collections::HashMap;

use bigdecimal::BigDecimal;
use serde::{Deserialize, Serialize};

use super::preview::{preview_match_group, MatchGroupPreview, MatchGroupRequest};
use super::recompute::{recompute_touched, unique, RecomputeSummary};
use crate::traits::UnitOfWork;
use crate::types::*;

/// What an apply created, updated and recomputed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchGroupApplyResult {
    /// Only set when more than one allocation carried money
    pub match_group_id: Option<String>,
    pub created_match_ids: Vec<String>,
    pub updated_match_ids: Vec<String>,
    pub preview: MatchGroupPreview,
    pub recomputed: RecomputeSummary,
    pub audit_log_id: String,
}

/// Re-validate and persist a match group inside the caller's unit of work
///
/// Existing pairs are updated in place, new pairs with money become applied
/// matches, and every touched schedule, line and deposit is recomputed from
/// its match rows. A rejected preview surfaces as
/// [`ReconError::Validation`] before anything is written.
pub async fn apply_match_group<U: UnitOfWork>(
    uow: &mut U,
    ctx: &OperationContext,
    request: &MatchGroupRequest,
    tolerance: &BigDecimal,
    source: MatchSource,
) -> ReconResult<MatchGroupApplyResult> {
    let tenant_id = ctx.tenant_id.as_str();
    let preview = preview_match_group(&*uow, tenant_id, request, tolerance).await?;
    if !preview.ok {
        return Err(ReconError::Validation(preview.issues));
    }

    let line_ids = unique(&request.line_ids);
    let schedule_ids = unique(&request.schedule_ids);
    let existing: HashMap<(String, String), DepositLineMatch> = uow
        .list_matches_for_lines(tenant_id, &line_ids)
        .await?
        .into_iter()
        .map(|m| {
            (
                (m.deposit_line_item_id.clone(), m.revenue_schedule_id.clone()),
                m,
            )
        })
        .collect();

    let now = chrono::Utc::now().naive_utc();
    let group = if preview.effective_allocations().count() > 1 {
        let group = MatchGroup {
            id: new_id(),
            tenant_id: tenant_id.to_string(),
            match_type: preview.match_type,
            status: MatchGroupStatus::Applied,
            line_ids: line_ids.clone(),
            schedule_ids: schedule_ids.clone(),
            created_by: ctx.user_id.clone(),
            created_at: now,
            undone_at: None,
        };
        uow.insert_match_group(&group).await?;
        Some(group)
    } else {
        None
    };
    let group_id = group.as_ref().map(|g| g.id.clone());

    let mut before = Vec::new();
    let mut written = Vec::new();
    let mut created_match_ids = Vec::new();
    let mut updated_match_ids = Vec::new();
    for allocation in &preview.allocations {
        let key = (allocation.line_id.clone(), allocation.schedule_id.clone());
        match existing.get(&key) {
            Some(current) if current.is_applied() || !allocation.is_zero() => {
                before.push(current.clone());
                let mut updated = current.clone();
                updated.usage_amount = allocation.usage_amount.clone();
                updated.commission_amount = allocation.commission_amount.clone();
                updated.status = MatchStatus::Applied;
                updated.source = source;
                updated.match_group_id = group_id.clone();
                updated.updated_at = now;
                uow.update_match(&updated).await?;
                updated_match_ids.push(updated.id.clone());
                written.push(updated);
            }
            Some(_) => {}
            None if allocation.is_zero() => {}
            None => {
                let mut created = DepositLineMatch::applied(
                    tenant_id.to_string(),
                    allocation.line_id.clone(),
                    allocation.schedule_id.clone(),
                    allocation.usage_amount.clone(),
                    allocation.commission_amount.clone(),
                    source,
                );
                created.match_group_id = group_id.clone();
                uow.insert_match(&created).await?;
                created_match_ids.push(created.id.clone());
                written.push(created);
            }
        }
    }

    let recomputed =
        recompute_touched(uow, tenant_id, &schedule_ids, &line_ids, tolerance).await?;

    let mut entity_ids: Vec<String> = group_id.iter().cloned().collect();
    entity_ids.extend(written.iter().map(|m| m.id.clone()));
    let audit = AuditEntry::new(
        ctx,
        AuditAction::MatchGroupApplied,
        entity_ids,
        serde_json::json!({ "matches": before }),
        serde_json::json!({
            "matchType": preview.match_type.as_str(),
            "matchGroup": group,
            "matches": written,
            "warnings": preview.warnings,
        }),
    );
    let audit_log_id = uow.append_audit(&audit).await?;

    tracing::info!(
        tenant_id,
        user_id = %ctx.user_id,
        match_type = preview.match_type.as_str(),
        match_group_id = ?group_id,
        created = created_match_ids.len(),
        updated = updated_match_ids.len(),
        "Applied match group"
    );
    Ok(MatchGroupApplyResult {
        match_group_id: group_id,
        created_match_ids,
        updated_match_ids,
        preview,
        recomputed,
        audit_log_id,
    })
}

//! Explicit removal of applied matches

use bigdecimal::BigDecimal;
use serde::{Deserialize, Serialize};

use super::recompute::{recompute_touched, unique, RecomputeSummary};
use crate::traits::UnitOfWork;
use crate::types::*;
use crate::utils::validation::{ensure_line_unlocked, ensure_matches_unlocked, require_line};

/// Matches removed by an unmatch and the state rebuilt afterwards
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnmatchResult {
    pub removed_match_ids: Vec<String>,
    /// Match groups left without matches and marked undone
    pub undone_match_group_ids: Vec<String>,
    pub recomputed: RecomputeSummary,
    pub audit_log_id: String,
}

/// Remove every match of one line
pub async fn unmatch_line<U: UnitOfWork>(
    uow: &mut U,
    ctx: &OperationContext,
    line_id: &str,
    tolerance: &BigDecimal,
) -> ReconResult<UnmatchResult> {
    let tenant_id = ctx.tenant_id.as_str();
    let line = require_line(&*uow, tenant_id, line_id).await?;
    ensure_line_unlocked(&line)?;
    let matches = uow
        .list_matches_for_lines(tenant_id, &[line.id.clone()])
        .await?;
    ensure_matches_unlocked(&matches)?;

    let removed = remove_matches(uow, tenant_id, &matches).await?;
    let schedule_ids: Vec<String> = matches
        .iter()
        .map(|m| m.revenue_schedule_id.clone())
        .collect();
    let recomputed =
        recompute_touched(uow, tenant_id, &schedule_ids, &[line.id.clone()], tolerance).await?;

    let group_ids: Vec<String> = matches
        .iter()
        .filter_map(|m| m.match_group_id.clone())
        .collect();
    let mut undone_match_group_ids = Vec::new();
    for group_id in unique(&group_ids) {
        if close_group_if_empty(uow, tenant_id, &group_id).await? {
            undone_match_group_ids.push(group_id);
        }
    }

    let audit = AuditEntry::new(
        ctx,
        AuditAction::LineUnmatched,
        std::iter::once(line.id.clone())
            .chain(removed.iter().cloned())
            .collect(),
        serde_json::json!({ "matches": matches }),
        serde_json::json!({ "line": recomputed.lines.first(), "undoneMatchGroups": undone_match_group_ids }),
    );
    let audit_log_id = uow.append_audit(&audit).await?;

    tracing::info!(
        tenant_id,
        line_id,
        removed = removed.len(),
        "Unmatched deposit line"
    );
    Ok(UnmatchResult {
        removed_match_ids: removed,
        undone_match_group_ids,
        recomputed,
        audit_log_id,
    })
}

/// Remove the matches of one match group and mark it undone
pub async fn undo_match_group<U: UnitOfWork>(
    uow: &mut U,
    ctx: &OperationContext,
    match_group_id: &str,
    tolerance: &BigDecimal,
) -> ReconResult<UnmatchResult> {
    let tenant_id = ctx.tenant_id.as_str();
    let mut group = uow
        .get_match_group(tenant_id, match_group_id)
        .await?
        .ok_or_else(|| ReconError::MatchGroupNotFound(match_group_id.to_string()))?;
    if group.status == MatchGroupStatus::Undone {
        return Err(ReconError::rule(
            rule_codes::MATCH_GROUP_ALREADY_UNDONE,
            format!("Match group {match_group_id} has already been undone"),
        ));
    }

    let matches = uow.list_matches_for_group(tenant_id, match_group_id).await?;
    ensure_matches_unlocked(&matches)?;
    let line_ids: Vec<String> = unique(
        &matches
            .iter()
            .map(|m| m.deposit_line_item_id.clone())
            .collect::<Vec<_>>(),
    );
    for line_id in &line_ids {
        ensure_line_unlocked(&require_line(&*uow, tenant_id, line_id).await?)?;
    }

    let removed = remove_matches(uow, tenant_id, &matches).await?;
    group.status = MatchGroupStatus::Undone;
    group.undone_at = Some(chrono::Utc::now().naive_utc());
    uow.update_match_group(&group).await?;

    let schedule_ids: Vec<String> = matches
        .iter()
        .map(|m| m.revenue_schedule_id.clone())
        .collect();
    let recomputed =
        recompute_touched(uow, tenant_id, &schedule_ids, &line_ids, tolerance).await?;

    let audit = AuditEntry::new(
        ctx,
        AuditAction::MatchGroupUndone,
        std::iter::once(group.id.clone())
            .chain(removed.iter().cloned())
            .collect(),
        serde_json::json!({ "matches": matches }),
        serde_json::json!({ "matchGroup": group }),
    );
    let audit_log_id = uow.append_audit(&audit).await?;

    tracing::info!(
        tenant_id,
        match_group_id,
        removed = removed.len(),
        "Undid match group"
    );
    Ok(UnmatchResult {
        removed_match_ids: removed,
        undone_match_group_ids: vec![group.id],
        recomputed,
        audit_log_id,
    })
}

async fn remove_matches<U: UnitOfWork>(
    uow: &mut U,
    tenant_id: &str,
    matches: &[DepositLineMatch],
) -> ReconResult<Vec<String>> {
    let mut removed = Vec::with_capacity(matches.len());
    for m in matches {
        uow.delete_match(tenant_id, &m.id).await?;
        removed.push(m.id.clone());
    }
    Ok(removed)
}

/// Mark a group undone once its last match is gone
async fn close_group_if_empty<U: UnitOfWork>(
    uow: &mut U,
    tenant_id: &str,
    match_group_id: &str,
) -> ReconResult<bool> {
    let Some(mut group) = uow.get_match_group(tenant_id, match_group_id).await? else {
        return Ok(false);
    };
    if group.status == MatchGroupStatus::Undone
        || !uow
            .list_matches_for_group(tenant_id, match_group_id)
            .await?
            .is_empty()
    {
        return Ok(false);
    }
    group.status = MatchGroupStatus::Undone;
    group.undone_at = Some(chrono::Utc::now().naive_utc());
    uow.update_match_group(&group).await?;
    Ok(true)
}

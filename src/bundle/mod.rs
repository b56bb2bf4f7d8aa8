//! Bundle rip-and-replace
//!
//! Turns several deposit lines into one synthetic product each, scheduled
//! across every remaining period of a base schedule's opportunity product.
//! Runs are keyed by a SHA-256 idempotency key so a resubmitted request
//! returns the recorded result instead of creating a second set of rows.

use std::collections::{BTreeMap, HashSet};

use bigdecimal::BigDecimal;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::matching::recompute::{recompute_touched, unique, RecomputeSummary};
use crate::traits::UnitOfWork;
use crate::types::*;
use crate::utils::money::{round_money, split_evenly};
use crate::utils::validation::{
    ensure_line_unlocked, ensure_no_issues, line_eligibility_issues, require_schedule,
};

/// Lines to consolidate against one base schedule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleRequest {
    pub deposit_id: String,
    pub revenue_schedule_id: String,
    pub line_ids: Vec<String>,
    pub mode: BundleMode,
}

impl BundleRequest {
    pub fn new(
        deposit_id: impl Into<String>,
        revenue_schedule_id: impl Into<String>,
        line_ids: Vec<String>,
        mode: BundleMode,
    ) -> Self {
        Self {
            deposit_id: deposit_id.into(),
            revenue_schedule_id: revenue_schedule_id.into(),
            line_ids,
            mode,
        }
    }

    /// SHA-256 over the canonical request; line order does not matter
    pub fn idempotency_key(&self) -> String {
        let mut line_ids = unique(&self.line_ids);
        line_ids.sort();
        let canonical = serde_json::json!({
            "depositId": self.deposit_id,
            "revenueScheduleId": self.revenue_schedule_id,
            "mode": self.mode.as_str(),
            "lineIds": line_ids,
        });
        let mut hasher = Sha256::new();
        hasher.update(canonical.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Everything a bundle run created or replaced
///
/// Rebuilt from the stored [`BundleOperation`], so a replayed request gets
/// a value equal to the original response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleResult {
    pub operation_id: String,
    pub idempotency_key: String,
    pub mode: BundleMode,
    pub base_schedule_id: String,
    pub created_product_ids: Vec<String>,
    pub created_opportunity_product_ids: Vec<String>,
    pub created_schedule_ids: Vec<String>,
    pub replaced_schedule_ids: Vec<String>,
    pub line_to_schedule: BTreeMap<String, String>,
    pub created_match_ids: Vec<String>,
    pub audit_log_id: Option<String>,
}

impl From<&BundleOperation> for BundleResult {
    fn from(operation: &BundleOperation) -> Self {
        Self {
            operation_id: operation.id.clone(),
            idempotency_key: operation.idempotency_key.clone(),
            mode: operation.mode,
            base_schedule_id: operation.base_schedule_id.clone(),
            created_product_ids: operation.created_product_ids.clone(),
            created_opportunity_product_ids: operation.created_opportunity_product_ids.clone(),
            created_schedule_ids: operation.created_schedule_ids.clone(),
            replaced_schedule_ids: operation.replaced_schedule_ids.clone(),
            line_to_schedule: operation.line_to_schedule.clone(),
            created_match_ids: operation.created_match_ids.clone(),
            audit_log_id: operation.audit_log_id.clone(),
        }
    }
}

/// What an undo removed and restored
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleUndoResult {
    pub operation_id: String,
    pub removed_match_ids: Vec<String>,
    pub deleted_schedule_ids: Vec<String>,
    pub restored_schedule_ids: Vec<String>,
    pub recomputed: RecomputeSummary,
    pub audit_log_id: String,
}

/// Look up the live run holding this request's idempotency key
pub async fn find_existing<U: UnitOfWork>(
    uow: &U,
    tenant_id: &str,
    request: &BundleRequest,
) -> ReconResult<Option<BundleResult>> {
    Ok(uow
        .find_bundle_operation_by_key(tenant_id, &request.idempotency_key())
        .await?
        .as_ref()
        .map(BundleResult::from))
}

/// Run a bundle rip-and-replace inside the caller's unit of work
///
/// A live operation with the same idempotency key short-circuits to its
/// recorded result. The operation row is inserted before any other write so
/// a concurrent duplicate trips the store's unique key.
pub async fn bundle_rip_replace<U: UnitOfWork>(
    uow: &mut U,
    ctx: &OperationContext,
    request: &BundleRequest,
    tolerance: &BigDecimal,
) -> ReconResult<BundleResult> {
    let tenant_id = ctx.tenant_id.as_str();
    let key = request.idempotency_key();
    if let Some(existing) = uow.find_bundle_operation_by_key(tenant_id, &key).await? {
        tracing::info!(
            tenant_id,
            operation_id = %existing.id,
            "Replaying recorded bundle operation"
        );
        return Ok(BundleResult::from(&existing));
    }

    let line_ids = unique(&request.line_ids);
    if line_ids.len() < 2 {
        return Err(ReconError::Validation(vec![ValidationIssue::new(
            IssueCode::BundleTooFewLines,
            "A bundle needs at least two deposit lines",
        )]));
    }

    let base = require_schedule(&*uow, tenant_id, &request.revenue_schedule_id).await?;
    let (Some(opportunity_id), Some(opportunity_product_id)) =
        (base.opportunity_id.clone(), base.opportunity_product_id.clone())
    else {
        return Err(ReconError::Unsupported(format!(
            "Revenue schedule {} is not linked to an opportunity product",
            base.id
        )));
    };
    let Some(base_date) = base.schedule_date else {
        return Err(ReconError::Validation(vec![ValidationIssue::new(
            IssueCode::ScheduleMissingDate,
            format!("Revenue schedule {} has no schedule date", base.id),
        )
        .for_schedule(&base.id)]));
    };
    uow.get_deposit(tenant_id, &request.deposit_id)
        .await?
        .ok_or_else(|| ReconError::DepositNotFound(request.deposit_id.clone()))?;

    let mut lines = load_bundle_lines(&*uow, tenant_id, &request.deposit_id, &line_ids).await?;
    lines.sort_by(|a, b| (a.line_number, a.created_at).cmp(&(b.line_number, b.created_at)));

    let remaining = uow
        .list_opportunity_product_schedules(tenant_id, &opportunity_product_id, base_date)
        .await?;
    let mut dates: Vec<NaiveDate> = remaining.iter().filter_map(|s| s.schedule_date).collect();
    dates.push(base_date);
    dates.sort();
    dates.dedup();

    let now = chrono::Utc::now().naive_utc();
    let mut operation = BundleOperation {
        id: new_id(),
        tenant_id: tenant_id.to_string(),
        idempotency_key: key,
        deposit_id: request.deposit_id.clone(),
        base_schedule_id: base.id.clone(),
        mode: request.mode,
        line_ids: lines.iter().map(|l| l.id.clone()).collect(),
        created_product_ids: Vec::new(),
        created_opportunity_product_ids: Vec::new(),
        created_schedule_ids: Vec::new(),
        replaced_schedule_ids: Vec::new(),
        line_to_schedule: BTreeMap::new(),
        created_match_ids: Vec::new(),
        audit_log_id: None,
        created_by: ctx.user_id.clone(),
        created_at: now,
        undone_at: None,
    };
    uow.insert_bundle_operation(&operation).await?;

    if request.mode == BundleMode::SoftDeleteOld {
        let replaced = retire_schedules(uow, tenant_id, remaining.clone()).await?;
        operation.replaced_schedule_ids = replaced;
    }

    let base_product = match &base.product_id {
        Some(product_id) => uow.get_product(tenant_id, product_id).await?,
        None => None,
    };

    for line in &lines {
        let mut product = Product::new(new_id(), tenant_id.to_string(), bundle_product_name(line));
        product.code = line.part_number_raw.clone();
        product.family = base_product.as_ref().and_then(|p| p.family.clone());
        product.revenue_type = base_product.as_ref().and_then(|p| p.revenue_type.clone());
        product.vendor_account_id = base.vendor_account_id.clone();
        product.distributor_account_id = base.distributor_account_id.clone();
        product.is_bundle_generated = true;
        uow.insert_product(&product).await?;

        let usage = round_money(&line.usage_unallocated);
        let commission = round_money(&line.commission_unallocated);
        let opportunity_product = OpportunityProduct {
            id: new_id(),
            tenant_id: tenant_id.to_string(),
            opportunity_id: opportunity_id.clone(),
            product_id: product.id.clone(),
            product_name_snapshot: product.name.clone(),
            quantity: BigDecimal::from(1),
            expected_usage: usage.clone(),
            expected_commission: commission.clone(),
            is_flex: false,
            is_bundle_generated: true,
            created_at: now,
        };
        uow.insert_opportunity_product(&opportunity_product).await?;

        let usage_parts = split_evenly(&usage, dates.len());
        let commission_parts = split_evenly(&commission, dates.len());
        let mut match_schedule_id = None;
        for ((date, period_usage), period_commission) in
            dates.iter().zip(usage_parts).zip(commission_parts)
        {
            let mut schedule = RevenueSchedule::new(
                new_id(),
                tenant_id.to_string(),
                Some(*date),
                period_usage,
                period_commission,
            );
            schedule.account_id = base.account_id.clone();
            schedule.opportunity_id = Some(opportunity_id.clone());
            schedule.opportunity_product_id = Some(opportunity_product.id.clone());
            schedule.product_id = Some(product.id.clone());
            schedule.vendor_account_id = base.vendor_account_id.clone();
            schedule.distributor_account_id = base.distributor_account_id.clone();
            schedule.customer_id_vendor = line
                .customer_id_vendor
                .clone()
                .or_else(|| base.customer_id_vendor.clone());
            schedule.order_id_vendor = line
                .order_id_vendor
                .clone()
                .or_else(|| base.order_id_vendor.clone());
            uow.insert_schedule(&schedule).await?;
            if *date == base_date {
                match_schedule_id = Some(schedule.id.clone());
            }
            operation.created_schedule_ids.push(schedule.id);
        }

        let match_schedule_id = match_schedule_id.ok_or_else(|| {
            ReconError::Storage(format!("no bundle schedule created on {base_date}"))
        })?;
        let deposit_match = DepositLineMatch::applied(
            tenant_id.to_string(),
            line.id.clone(),
            match_schedule_id.clone(),
            usage,
            commission,
            MatchSource::Manual,
        );
        uow.insert_match(&deposit_match).await?;

        operation.created_product_ids.push(product.id);
        operation
            .created_opportunity_product_ids
            .push(opportunity_product.id);
        operation
            .line_to_schedule
            .insert(line.id.clone(), match_schedule_id);
        operation.created_match_ids.push(deposit_match.id);
    }

    let matched_schedule_ids: Vec<String> = operation.line_to_schedule.values().cloned().collect();
    recompute_touched(
        uow,
        tenant_id,
        &matched_schedule_ids,
        &operation.line_ids,
        tolerance,
    )
    .await?;

    let replaced_before: Vec<&RevenueSchedule> = remaining
        .iter()
        .filter(|s| operation.replaced_schedule_ids.contains(&s.id))
        .collect();
    let mut entity_ids = vec![operation.id.clone(), base.id.clone()];
    entity_ids.extend(operation.created_schedule_ids.iter().cloned());
    entity_ids.extend(operation.replaced_schedule_ids.iter().cloned());
    let audit = AuditEntry::new(
        ctx,
        AuditAction::BundleRipReplace,
        entity_ids,
        serde_json::json!({ "replacedSchedules": replaced_before }),
        serde_json::json!({
            "mode": operation.mode.as_str(),
            "lineIds": operation.line_ids,
            "createdProductIds": operation.created_product_ids,
            "createdOpportunityProductIds": operation.created_opportunity_product_ids,
            "createdScheduleIds": operation.created_schedule_ids,
            "replacedScheduleIds": operation.replaced_schedule_ids,
            "lineToSchedule": operation.line_to_schedule,
            "createdMatchIds": operation.created_match_ids,
        }),
    );
    operation.audit_log_id = Some(uow.append_audit(&audit).await?);
    uow.update_bundle_operation(&operation).await?;

    tracing::info!(
        tenant_id,
        operation_id = %operation.id,
        mode = operation.mode.as_str(),
        lines = operation.line_ids.len(),
        periods = dates.len(),
        replaced = operation.replaced_schedule_ids.len(),
        "Bundled deposit lines"
    );
    Ok(BundleResult::from(&operation))
}

/// Reverse a bundle run and free its idempotency key
///
/// Matches on the created schedules are removed, the created schedules are
/// soft-deleted and replaced schedules come back. Synthetic products stay
/// in the catalog.
pub async fn undo_bundle<U: UnitOfWork>(
    uow: &mut U,
    ctx: &OperationContext,
    operation_id: &str,
    tolerance: &BigDecimal,
) -> ReconResult<BundleUndoResult> {
    let tenant_id = ctx.tenant_id.as_str();
    let mut operation = uow
        .get_bundle_operation(tenant_id, operation_id)
        .await?
        .ok_or_else(|| ReconError::BundleOperationNotFound(operation_id.to_string()))?;
    if operation.undone_at.is_some() {
        return Err(ReconError::rule(
            rule_codes::BUNDLE_ALREADY_UNDONE,
            format!("Bundle operation {operation_id} has already been undone"),
        ));
    }

    let matches = uow
        .list_matches_for_schedules(tenant_id, &operation.created_schedule_ids)
        .await?;
    if let Some(locked) = matches.iter().find(|m| m.reconciled) {
        return Err(ReconError::rule(
            rule_codes::BUNDLE_MATCH_LOCKED,
            format!("Match {} on a bundle schedule is reconciled", locked.id),
        ));
    }
    let mut line_ids = operation.line_ids.clone();
    line_ids.extend(matches.iter().map(|m| m.deposit_line_item_id.clone()));
    let line_ids = unique(&line_ids);
    for line_id in &line_ids {
        if let Some(line) = uow.get_line(tenant_id, line_id).await? {
            ensure_line_unlocked(&line)?;
        }
    }

    let mut removed_match_ids = Vec::with_capacity(matches.len());
    for m in &matches {
        uow.delete_match(tenant_id, &m.id).await?;
        removed_match_ids.push(m.id.clone());
    }

    let now = chrono::Utc::now().naive_utc();
    let mut deleted_schedule_ids = Vec::new();
    for schedule_id in &operation.created_schedule_ids {
        if let Some(mut schedule) = uow.get_schedule(tenant_id, schedule_id).await? {
            schedule.deleted_at = Some(now);
            schedule.actual_usage = BigDecimal::from(0);
            schedule.actual_commission = BigDecimal::from(0);
            schedule.status = RevenueScheduleStatus::Unreconciled;
            schedule.dispute_reason = None;
            schedule.updated_at = now;
            uow.update_schedule(&schedule).await?;
            deleted_schedule_ids.push(schedule.id);
        }
    }
    let mut restored_schedule_ids = Vec::new();
    for schedule_id in &operation.replaced_schedule_ids {
        if let Some(mut schedule) = uow.get_schedule(tenant_id, schedule_id).await? {
            schedule.deleted_at = None;
            schedule.updated_at = now;
            uow.update_schedule(&schedule).await?;
            restored_schedule_ids.push(schedule.id);
        }
    }

    let recomputed = recompute_touched(
        uow,
        tenant_id,
        &restored_schedule_ids,
        &line_ids,
        tolerance,
    )
    .await?;

    let before = serde_json::json!({ "operation": operation, "matches": matches });
    operation.undone_at = Some(now);
    operation.idempotency_key = format!("{}:undone:{}", operation.idempotency_key, operation.id);
    uow.update_bundle_operation(&operation).await?;

    let audit = AuditEntry::new(
        ctx,
        AuditAction::BundleUndone,
        std::iter::once(operation.id.clone())
            .chain(deleted_schedule_ids.iter().cloned())
            .chain(restored_schedule_ids.iter().cloned())
            .collect(),
        before,
        serde_json::json!({
            "removedMatchIds": removed_match_ids,
            "deletedScheduleIds": deleted_schedule_ids,
            "restoredScheduleIds": restored_schedule_ids,
        }),
    );
    let audit_log_id = uow.append_audit(&audit).await?;

    tracing::info!(
        tenant_id,
        operation_id,
        removed = removed_match_ids.len(),
        restored = restored_schedule_ids.len(),
        "Undid bundle operation"
    );
    Ok(BundleUndoResult {
        operation_id: operation.id,
        removed_match_ids,
        deleted_schedule_ids,
        restored_schedule_ids,
        recomputed,
        audit_log_id,
    })
}

/// Load and check the lines of a bundle request
async fn load_bundle_lines<U: UnitOfWork>(
    uow: &U,
    tenant_id: &str,
    deposit_id: &str,
    line_ids: &[String],
) -> ReconResult<Vec<DepositLineItem>> {
    let matches = uow.list_matches_for_lines(tenant_id, line_ids).await?;
    let matched: HashSet<&str> = matches
        .iter()
        .filter(|m| m.is_applied())
        .map(|m| m.deposit_line_item_id.as_str())
        .collect();

    let mut issues = Vec::new();
    let mut lines = Vec::with_capacity(line_ids.len());
    for line_id in line_ids {
        let Some(line) = uow.get_line(tenant_id, line_id).await? else {
            issues.push(
                ValidationIssue::new(
                    IssueCode::LineNotFound,
                    format!("Deposit line {line_id} not found"),
                )
                .for_line(line_id),
            );
            continue;
        };
        if line.deposit_id != deposit_id {
            issues.push(
                ValidationIssue::new(
                    IssueCode::LineNotInDeposit,
                    format!("Line {} belongs to another deposit", line.line_number),
                )
                .for_line(&line.id),
            );
        }
        issues.extend(line_eligibility_issues(&line));
        if matched.contains(line.id.as_str()) {
            issues.push(
                ValidationIssue::new(
                    IssueCode::LineHasAppliedMatches,
                    format!("Line {} already has applied matches", line.line_number),
                )
                .for_line(&line.id),
            );
        }
        lines.push(line);
    }
    ensure_no_issues(issues)?;
    Ok(lines)
}

/// Soft-delete the remaining schedules, refusing if any carries money
async fn retire_schedules<U: UnitOfWork>(
    uow: &mut U,
    tenant_id: &str,
    remaining: Vec<RevenueSchedule>,
) -> ReconResult<Vec<String>> {
    let ids: Vec<String> = remaining.iter().map(|s| s.id.clone()).collect();
    let matches = uow.list_matches_for_schedules(tenant_id, &ids).await?;
    let ineligible: Vec<&str> = remaining
        .iter()
        .filter(|s| {
            s.status != RevenueScheduleStatus::Unreconciled
                || matches
                    .iter()
                    .any(|m| m.revenue_schedule_id == s.id && m.is_applied())
        })
        .map(|s| s.id.as_str())
        .collect();
    if !ineligible.is_empty() {
        return Err(ReconError::rule(
            rule_codes::BUNDLE_REPLACE_INELIGIBLE,
            format!(
                "Schedules cannot be replaced while they carry money: {}",
                ineligible.join(", ")
            ),
        ));
    }

    let now = chrono::Utc::now().naive_utc();
    let mut replaced = Vec::with_capacity(remaining.len());
    for mut schedule in remaining {
        schedule.deleted_at = Some(now);
        schedule.updated_at = now;
        uow.update_schedule(&schedule).await?;
        replaced.push(schedule.id);
    }
    Ok(replaced)
}

fn bundle_product_name(line: &DepositLineItem) -> String {
    line.product_name_raw
        .as_deref()
        .or(line.part_number_raw.as_deref())
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("Bundle line {}", line.line_number))
}

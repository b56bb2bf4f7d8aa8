//! Flex resolution: explain variance with synthetic schedules
//!
//! Splits move part of an applied match onto a new flex schedule that
//! records where it came from. Chargebacks give a negative line a schedule
//! of its own. Every action recomputes what it touched and writes one audit
//! record.

use bigdecimal::BigDecimal;
use serde::{Deserialize, Serialize};

use crate::matching::recompute::{recompute_touched, RecomputeSummary};
use crate::traits::UnitOfWork;
use crate::types::*;
use crate::utils::money::{is_effectively_zero, round_money};
use crate::utils::validation::{
    ensure_line_unlocked, ensure_matches_unlocked, require_line, require_schedule,
    split_amount_issue,
};

/// Amount to move off the line's applied match on a schedule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlexSplitRequest {
    pub line_id: String,
    pub schedule_id: String,
    pub usage_amount: BigDecimal,
    pub commission_amount: BigDecimal,
    /// Overrides the reason derived from the split kind
    pub reason_code: Option<FlexReasonCode>,
}

impl FlexSplitRequest {
    pub fn new(
        line_id: impl Into<String>,
        schedule_id: impl Into<String>,
        usage_amount: BigDecimal,
        commission_amount: BigDecimal,
    ) -> Self {
        Self {
            line_id: line_id.into(),
            schedule_id: schedule_id.into(),
            usage_amount,
            commission_amount,
            reason_code: None,
        }
    }
}

/// Result of an adjustment or flex-product split
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlexSplitResult {
    pub flex_schedule_id: String,
    pub classification: FlexClassification,
    pub reason_code: FlexReasonCode,
    pub product_id: Option<String>,
    pub opportunity_product_id: Option<String>,
    pub flex_match_id: String,
    pub source_match_id: String,
    /// The source match was fully drained and deleted
    pub source_match_removed: bool,
    pub recomputed: RecomputeSummary,
    pub audit_log_id: String,
}

/// Result of a chargeback
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChargebackResult {
    pub chargeback_schedule_id: String,
    pub product_id: String,
    pub match_id: String,
    pub removed_match_ids: Vec<String>,
    /// Earlier chargeback schedules of the line, soft-deleted once unmatched
    pub retired_schedule_ids: Vec<String>,
    pub recomputed: RecomputeSummary,
    pub audit_log_id: String,
}

/// True when the product reads like bonus or SPIFF revenue
pub fn is_bonus_product(product: &Product) -> bool {
    [
        product.revenue_type.as_deref(),
        product.family.as_deref(),
        Some(product.name.as_str()),
    ]
    .into_iter()
    .flatten()
    .map(str::to_lowercase)
    .any(|text| text.contains("bonus") || text.contains("spiff"))
}

/// Move part of an applied match onto a new Adjustment or Bonus schedule
pub async fn split_to_adjustment<U: UnitOfWork>(
    uow: &mut U,
    ctx: &OperationContext,
    request: &FlexSplitRequest,
    tolerance: &BigDecimal,
) -> ReconResult<FlexSplitResult> {
    let tenant_id = ctx.tenant_id.as_str();
    let source = load_split_source(&*uow, tenant_id, request).await?;

    let base_product = match &source.schedule.product_id {
        Some(product_id) => uow.get_product(tenant_id, product_id).await?,
        None => None,
    };
    let (classification, reason) = if base_product.as_ref().is_some_and(is_bonus_product) {
        (FlexClassification::Bonus, FlexReasonCode::BonusVariance)
    } else {
        (FlexClassification::Adjustment, FlexReasonCode::Overage)
    };

    let target = SplitTarget {
        classification,
        reason: request.reason_code.unwrap_or(reason),
        product_id: source.schedule.product_id.clone(),
        opportunity_product_id: source.schedule.opportunity_product_id.clone(),
        action: AuditAction::FlexAdjustmentSplit,
    };
    move_split(uow, ctx, request, source, target, tolerance).await
}

/// Move part of an applied match onto a schedule of the tenant's Flex Product
pub async fn split_to_flex_product<U: UnitOfWork>(
    uow: &mut U,
    ctx: &OperationContext,
    request: &FlexSplitRequest,
    tolerance: &BigDecimal,
) -> ReconResult<FlexSplitResult> {
    let tenant_id = ctx.tenant_id.as_str();
    let source = load_split_source(&*uow, tenant_id, request).await?;
    let product = ensure_flex_product(uow, tenant_id, FlexProductKind::FlexProduct).await?;

    let opportunity_product_id = match &source.schedule.opportunity_id {
        Some(opportunity_id) => {
            let opportunity_product = OpportunityProduct {
                id: new_id(),
                tenant_id: tenant_id.to_string(),
                opportunity_id: opportunity_id.clone(),
                product_id: product.id.clone(),
                product_name_snapshot: product.name.clone(),
                quantity: BigDecimal::from(1),
                expected_usage: round_money(&request.usage_amount),
                expected_commission: round_money(&request.commission_amount),
                is_flex: true,
                is_bundle_generated: false,
                created_at: chrono::Utc::now().naive_utc(),
            };
            uow.insert_opportunity_product(&opportunity_product).await?;
            Some(opportunity_product.id)
        }
        None => None,
    };

    let target = SplitTarget {
        classification: FlexClassification::FlexProduct,
        reason: request.reason_code.unwrap_or(FlexReasonCode::UnknownProduct),
        product_id: Some(product.id),
        opportunity_product_id,
        action: AuditAction::FlexProductSplit,
    };
    move_split(uow, ctx, request, source, target, tolerance).await
}

/// Give a negative line its own Flex Chargeback schedule
///
/// Existing matches of the line are removed first, and an earlier
/// chargeback schedule they leave empty is soft-deleted. The new match is
/// an ordinary applied match, so unmatching the line reverses it.
pub async fn create_chargeback<U: UnitOfWork>(
    uow: &mut U,
    ctx: &OperationContext,
    line_id: &str,
    tolerance: &BigDecimal,
) -> ReconResult<ChargebackResult> {
    let tenant_id = ctx.tenant_id.as_str();
    let line = require_line(&*uow, tenant_id, line_id).await?;
    ensure_line_unlocked(&line)?;
    if !line.is_negative() {
        return Err(ReconError::rule(
            rule_codes::CHARGEBACK_REQUIRES_NEGATIVE_LINE,
            format!(
                "Line {} has no negative usage or commission",
                line.line_number
            ),
        ));
    }
    let deposit = uow
        .get_deposit(tenant_id, &line.deposit_id)
        .await?
        .ok_or_else(|| ReconError::DepositNotFound(line.deposit_id.clone()))?;

    let previous = uow
        .list_matches_for_lines(tenant_id, &[line.id.clone()])
        .await?;
    ensure_matches_unlocked(&previous)?;
    let mut removed_match_ids = Vec::with_capacity(previous.len());
    for m in &previous {
        uow.delete_match(tenant_id, &m.id).await?;
        removed_match_ids.push(m.id.clone());
    }
    let retired_schedule_ids = retire_orphaned_chargebacks(uow, tenant_id, &previous).await?;

    let product = ensure_flex_product(uow, tenant_id, FlexProductKind::FlexChargeback).await?;
    let mut schedule = RevenueSchedule::new(
        new_id(),
        tenant_id.to_string(),
        Some(line.payment_date.unwrap_or(deposit.deposit_date)),
        round_money(&line.usage),
        round_money(&line.commission),
    );
    schedule.account_id = line.account_id.clone();
    schedule.product_id = Some(product.id.clone());
    schedule.vendor_account_id = line
        .vendor_account_id
        .clone()
        .or_else(|| deposit.vendor_account_id.clone());
    schedule.distributor_account_id = line
        .distributor_account_id
        .clone()
        .or_else(|| deposit.distributor_account_id.clone());
    schedule.customer_id_vendor = line.customer_id_vendor.clone();
    schedule.order_id_vendor = line.order_id_vendor.clone();
    schedule.flex_classification = FlexClassification::FlexChargeback;
    schedule.flex_reason_code = Some(FlexReasonCode::ChargebackNegative);
    uow.insert_schedule(&schedule).await?;

    let chargeback = DepositLineMatch::applied(
        tenant_id.to_string(),
        line.id.clone(),
        schedule.id.clone(),
        round_money(&line.usage),
        round_money(&line.commission),
        MatchSource::Manual,
    );
    uow.insert_match(&chargeback).await?;

    let mut schedule_ids: Vec<String> = previous
        .iter()
        .map(|m| m.revenue_schedule_id.clone())
        .collect();
    schedule_ids.push(schedule.id.clone());
    let recomputed =
        recompute_touched(uow, tenant_id, &schedule_ids, &[line.id.clone()], tolerance).await?;

    let audit = AuditEntry::new(
        ctx,
        AuditAction::FlexChargebackCreated,
        vec![line.id.clone(), schedule.id.clone(), chargeback.id.clone()],
        serde_json::json!({ "matches": previous }),
        serde_json::json!({
            "schedule": schedule,
            "match": chargeback,
            "retiredScheduleIds": retired_schedule_ids,
        }),
    );
    let audit_log_id = uow.append_audit(&audit).await?;

    tracing::info!(
        tenant_id,
        line_id,
        schedule_id = %schedule.id,
        removed = removed_match_ids.len(),
        "Created chargeback schedule"
    );
    Ok(ChargebackResult {
        chargeback_schedule_id: schedule.id,
        product_id: product.id,
        match_id: chargeback.id,
        removed_match_ids,
        retired_schedule_ids,
        recomputed,
        audit_log_id,
    })
}

/// Soft-delete earlier chargeback schedules left without any match
async fn retire_orphaned_chargebacks<U: UnitOfWork>(
    uow: &mut U,
    tenant_id: &str,
    removed: &[DepositLineMatch],
) -> ReconResult<Vec<String>> {
    let now = chrono::Utc::now().naive_utc();
    let mut retired = Vec::new();
    for m in removed {
        let Some(mut schedule) = uow.get_schedule(tenant_id, &m.revenue_schedule_id).await? else {
            continue;
        };
        if schedule.flex_classification != FlexClassification::FlexChargeback
            || schedule.is_deleted()
        {
            continue;
        }
        let remaining = uow
            .list_matches_for_schedules(tenant_id, &[schedule.id.clone()])
            .await?;
        if !remaining.is_empty() {
            continue;
        }
        schedule.deleted_at = Some(now);
        schedule.updated_at = now;
        uow.update_schedule(&schedule).await?;
        retired.push(schedule.id);
    }
    Ok(retired)
}

struct SplitSource {
    schedule: RevenueSchedule,
    applied: DepositLineMatch,
}

struct SplitTarget {
    classification: FlexClassification,
    reason: FlexReasonCode,
    product_id: Option<String>,
    opportunity_product_id: Option<String>,
    action: AuditAction,
}

/// Load and check the match a split draws from
async fn load_split_source<U: UnitOfWork>(
    uow: &U,
    tenant_id: &str,
    request: &FlexSplitRequest,
) -> ReconResult<SplitSource> {
    let line = require_line(uow, tenant_id, &request.line_id).await?;
    ensure_line_unlocked(&line)?;
    let schedule = require_schedule(uow, tenant_id, &request.schedule_id).await?;

    let usage = round_money(&request.usage_amount);
    let commission = round_money(&request.commission_amount);
    if let Some(issue) = split_amount_issue(&usage, &commission) {
        return Err(ReconError::Validation(vec![issue
            .for_line(&line.id)
            .for_schedule(&schedule.id)]));
    }

    let applied = uow
        .list_matches_for_lines(tenant_id, &[line.id.clone()])
        .await?
        .into_iter()
        .find(|m| m.revenue_schedule_id == schedule.id && m.is_applied())
        .ok_or_else(|| {
            ReconError::rule(
                rule_codes::NO_APPLIED_MATCH,
                format!(
                    "Line {} has no applied match on schedule {}",
                    line.line_number, schedule.id
                ),
            )
        })?;
    ensure_matches_unlocked(std::slice::from_ref(&applied))?;

    if usage > round_money(&applied.usage_amount)
        || commission > round_money(&applied.commission_amount)
    {
        return Err(ReconError::rule(
            rule_codes::SPLIT_EXCEEDS_ALLOCATION,
            format!(
                "Split {usage}/{commission} exceeds the allocated {}/{}",
                applied.usage_amount, applied.commission_amount
            ),
        ));
    }
    Ok(SplitSource { schedule, applied })
}

/// Shrink or drain the source match and apply the split to a new flex schedule
async fn move_split<U: UnitOfWork>(
    uow: &mut U,
    ctx: &OperationContext,
    request: &FlexSplitRequest,
    source: SplitSource,
    target: SplitTarget,
    tolerance: &BigDecimal,
) -> ReconResult<FlexSplitResult> {
    let tenant_id = ctx.tenant_id.as_str();
    let SplitSource { schedule: base, applied } = source;
    let usage = round_money(&request.usage_amount);
    let commission = round_money(&request.commission_amount);

    let mut flex = RevenueSchedule::new(
        new_id(),
        tenant_id.to_string(),
        base.schedule_date,
        usage.clone(),
        commission.clone(),
    );
    flex.account_id = base.account_id.clone();
    flex.opportunity_id = base.opportunity_id.clone();
    flex.opportunity_product_id = target.opportunity_product_id.clone();
    flex.product_id = target.product_id.clone();
    flex.vendor_account_id = base.vendor_account_id.clone();
    flex.distributor_account_id = base.distributor_account_id.clone();
    flex.customer_id_vendor = base.customer_id_vendor.clone();
    flex.order_id_vendor = base.order_id_vendor.clone();
    flex.flex_classification = target.classification;
    flex.flex_reason_code = Some(target.reason);
    flex.parent_schedule_id = Some(base.id.clone());
    uow.insert_schedule(&flex).await?;

    let remaining_usage = round_money(&(&applied.usage_amount - &usage));
    let remaining_commission = round_money(&(&applied.commission_amount - &commission));
    let drained =
        is_effectively_zero(&remaining_usage) && is_effectively_zero(&remaining_commission);
    if drained {
        uow.delete_match(tenant_id, &applied.id).await?;
    } else {
        let mut shrunk = applied.clone();
        shrunk.usage_amount = remaining_usage;
        shrunk.commission_amount = remaining_commission;
        shrunk.updated_at = chrono::Utc::now().naive_utc();
        uow.update_match(&shrunk).await?;
    }

    let flex_match = DepositLineMatch::applied(
        tenant_id.to_string(),
        applied.deposit_line_item_id.clone(),
        flex.id.clone(),
        usage,
        commission,
        MatchSource::Manual,
    );
    uow.insert_match(&flex_match).await?;

    let recomputed = recompute_touched(
        uow,
        tenant_id,
        &[base.id.clone(), flex.id.clone()],
        &[applied.deposit_line_item_id.clone()],
        tolerance,
    )
    .await?;

    let audit = AuditEntry::new(
        ctx,
        target.action,
        vec![base.id.clone(), flex.id.clone(), flex_match.id.clone()],
        serde_json::json!({ "schedule": base, "match": applied }),
        serde_json::json!({
            "flexSchedule": flex,
            "flexMatch": flex_match,
            "sourceMatchRemoved": drained,
        }),
    );
    let audit_log_id = uow.append_audit(&audit).await?;

    tracing::info!(
        tenant_id,
        action = %target.action,
        parent_schedule_id = %base.id,
        flex_schedule_id = %flex.id,
        classification = ?target.classification,
        "Split match onto flex schedule"
    );
    Ok(FlexSplitResult {
        flex_schedule_id: flex.id,
        classification: target.classification,
        reason_code: target.reason,
        product_id: target.product_id,
        opportunity_product_id: target.opportunity_product_id,
        flex_match_id: flex_match.id,
        source_match_id: applied.id,
        source_match_removed: drained,
        recomputed,
        audit_log_id,
    })
}

/// The tenant's cached synthetic product of this kind, created on first use
async fn ensure_flex_product<U: UnitOfWork>(
    uow: &mut U,
    tenant_id: &str,
    kind: FlexProductKind,
) -> ReconResult<Product> {
    if let Some(product) = uow.find_flex_product(tenant_id, kind).await? {
        return Ok(product);
    }
    let mut product = Product::new(new_id(), tenant_id.to_string(), kind.product_name().to_string());
    product.is_flex = true;
    product.flex_kind = Some(kind);
    uow.insert_product(&product).await?;
    tracing::debug!(tenant_id, product_id = %product.id, ?kind, "Created flex product");
    Ok(product)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bonus_detection() {
        let mut product = Product::new("p1".to_string(), "t1".to_string(), "Managed WAN".to_string());
        assert!(!is_bonus_product(&product));

        product.family = Some("SPIFF Programs".to_string());
        assert!(is_bonus_product(&product));

        product.family = None;
        product.revenue_type = Some("Quarterly Bonus".to_string());
        assert!(is_bonus_product(&product));

        let named = Product::new("p2".to_string(), "t1".to_string(), "Partner bonus".to_string());
        assert!(is_bonus_product(&named));
    }
}

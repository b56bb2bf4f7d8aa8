//! Recompute schedule, line and deposit aggregates from the current match rows
//!
//! Nothing here increments a running total. Every figure is rebuilt from the
//! applied matches that exist right now, so running a recompute twice, or
//! after a conflicting transaction, converges on the same state.

use bigdecimal::BigDecimal;
use serde::{Deserialize, Serialize};

use crate::traits::UnitOfWork;
use crate::types::*;
use crate::utils::money::{is_effectively_zero, round_money, sum_money, zero, ToleranceCheck};

/// Schedule figures derived from a set of applied match amounts
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleState {
    pub actual_usage: BigDecimal,
    pub actual_commission: BigDecimal,
    pub actual_usage_net: BigDecimal,
    pub actual_commission_net: BigDecimal,
    pub check: ToleranceCheck,
    pub status: RevenueScheduleStatus,
    pub dispute_reason: Option<DisputeReason>,
}

/// Derive a schedule's actuals and status from applied match totals
pub fn derive_schedule_state(
    schedule: &RevenueSchedule,
    applied_usage: &BigDecimal,
    applied_commission: &BigDecimal,
    has_applied_matches: bool,
    tolerance: &BigDecimal,
) -> ScheduleState {
    let actual_usage = round_money(applied_usage);
    let actual_commission = round_money(applied_commission);
    let actual_usage_net = round_money(&(&actual_usage + &schedule.actual_usage_adjustment));
    let actual_commission_net =
        round_money(&(&actual_commission + &schedule.actual_commission_adjustment));
    let check = ToleranceCheck::evaluate(
        &schedule.expected_usage_net(),
        &actual_usage_net,
        &schedule.expected_commission_net(),
        &actual_commission_net,
        tolerance,
    );
    let (status, dispute_reason) = if has_applied_matches {
        (check.status(), check.dispute_reason())
    } else {
        (RevenueScheduleStatus::Unreconciled, None)
    };
    ScheduleState {
        actual_usage,
        actual_commission,
        actual_usage_net,
        actual_commission_net,
        check,
        status,
        dispute_reason,
    }
}

/// Line figures derived from a set of applied match amounts
#[derive(Debug, Clone, PartialEq)]
pub struct LineAllocation {
    pub usage_allocated: BigDecimal,
    pub usage_unallocated: BigDecimal,
    pub commission_allocated: BigDecimal,
    pub commission_unallocated: BigDecimal,
    pub status: DepositLineItemStatus,
}

/// Derive a line's allocation split and status from applied match totals
pub fn derive_line_allocation(
    line: &DepositLineItem,
    allocated_usage: &BigDecimal,
    allocated_commission: &BigDecimal,
) -> LineAllocation {
    let usage_allocated = round_money(allocated_usage);
    let commission_allocated = round_money(allocated_commission);
    let usage_unallocated = round_money(&(&line.usage - &usage_allocated));
    let commission_unallocated = round_money(&(&line.commission - &commission_allocated));

    let nothing_allocated =
        is_effectively_zero(&usage_allocated) && is_effectively_zero(&commission_allocated);
    let fully_allocated =
        is_effectively_zero(&usage_unallocated) && is_effectively_zero(&commission_unallocated);
    let status = if line.is_ignored() {
        DepositLineItemStatus::Ignored
    } else if nothing_allocated && !fully_allocated {
        DepositLineItemStatus::Unmatched
    } else if fully_allocated && !nothing_allocated {
        DepositLineItemStatus::Matched
    } else if nothing_allocated {
        // zero-value line with no money on it
        DepositLineItemStatus::Unmatched
    } else {
        DepositLineItemStatus::PartiallyMatched
    };

    LineAllocation {
        usage_allocated,
        usage_unallocated,
        commission_allocated,
        commission_unallocated,
        status,
    }
}

/// Rebuild one schedule's actuals and status from its applied matches
pub async fn recompute_schedule<U: UnitOfWork>(
    uow: &mut U,
    tenant_id: &str,
    schedule_id: &str,
    tolerance: &BigDecimal,
) -> ReconResult<RevenueSchedule> {
    let mut schedule = uow
        .get_schedule(tenant_id, schedule_id)
        .await?
        .ok_or_else(|| ReconError::ScheduleNotFound(schedule_id.to_string()))?;
    let matches = uow
        .list_matches_for_schedules(tenant_id, &[schedule_id.to_string()])
        .await?;
    let applied: Vec<&DepositLineMatch> = matches.iter().filter(|m| m.is_applied()).collect();

    let state = derive_schedule_state(
        &schedule,
        &sum_money(applied.iter().map(|m| &m.usage_amount)),
        &sum_money(applied.iter().map(|m| &m.commission_amount)),
        !applied.is_empty(),
        tolerance,
    );
    schedule.actual_usage = state.actual_usage;
    schedule.actual_commission = state.actual_commission;
    schedule.status = state.status;
    schedule.dispute_reason = state.dispute_reason;
    schedule.updated_at = chrono::Utc::now().naive_utc();
    uow.update_schedule(&schedule).await?;

    tracing::debug!(
        schedule_id = %schedule.id,
        actual_usage = %schedule.actual_usage,
        actual_commission = %schedule.actual_commission,
        status = ?schedule.status,
        "Recomputed revenue schedule"
    );
    Ok(schedule)
}

/// Rebuild one line's allocated/unallocated split and status from its applied matches
pub async fn recompute_line<U: UnitOfWork>(
    uow: &mut U,
    tenant_id: &str,
    line_id: &str,
) -> ReconResult<DepositLineItem> {
    let mut line = uow
        .get_line(tenant_id, line_id)
        .await?
        .ok_or_else(|| ReconError::LineNotFound(line_id.to_string()))?;
    let matches = uow
        .list_matches_for_lines(tenant_id, &[line_id.to_string()])
        .await?;
    let applied: Vec<&DepositLineMatch> = matches.iter().filter(|m| m.is_applied()).collect();

    let allocation = derive_line_allocation(
        &line,
        &sum_money(applied.iter().map(|m| &m.usage_amount)),
        &sum_money(applied.iter().map(|m| &m.commission_amount)),
    );
    line.usage_allocated = allocation.usage_allocated;
    line.usage_unallocated = allocation.usage_unallocated;
    line.commission_allocated = allocation.commission_allocated;
    line.commission_unallocated = allocation.commission_unallocated;
    line.status = allocation.status;
    line.primary_revenue_schedule_id = applied
        .iter()
        .fold(None::<&DepositLineMatch>, |best, m| match best {
            Some(b)
                if (b.usage_amount.abs(), b.commission_amount.abs())
                    >= (m.usage_amount.abs(), m.commission_amount.abs()) =>
            {
                Some(b)
            }
            _ => Some(m),
        })
        .map(|m| m.revenue_schedule_id.clone());
    line.updated_at = chrono::Utc::now().naive_utc();
    uow.update_line(&line).await?;
    Ok(line)
}

/// Rebuild a deposit's totals, counts and status from its lines
pub async fn recompute_deposit<U: UnitOfWork>(
    uow: &mut U,
    tenant_id: &str,
    deposit_id: &str,
) -> ReconResult<Deposit> {
    let mut deposit = uow
        .get_deposit(tenant_id, deposit_id)
        .await?
        .ok_or_else(|| ReconError::DepositNotFound(deposit_id.to_string()))?;
    let lines = uow.list_deposit_lines(tenant_id, deposit_id).await?;

    deposit.total_usage = sum_money(lines.iter().map(|l| &l.usage));
    deposit.usage_allocated = sum_money(lines.iter().map(|l| &l.usage_allocated));
    deposit.usage_unallocated = sum_money(lines.iter().map(|l| &l.usage_unallocated));
    deposit.total_commission = sum_money(lines.iter().map(|l| &l.commission));
    deposit.commission_allocated = sum_money(lines.iter().map(|l| &l.commission_allocated));
    deposit.commission_unallocated = sum_money(lines.iter().map(|l| &l.commission_unallocated));

    let count = |status: DepositLineItemStatus| {
        lines.iter().filter(|l| l.status == status).count() as u32
    };
    deposit.total_items = lines.len() as u32;
    deposit.items_matched = count(DepositLineItemStatus::Matched);
    deposit.items_unmatched =
        count(DepositLineItemStatus::Unmatched) + count(DepositLineItemStatus::PartiallyMatched);
    let ignored = count(DepositLineItemStatus::Ignored);

    deposit.status = if !lines.is_empty() && deposit.items_matched + ignored == deposit.total_items
    {
        DepositStatus::Completed
    } else if deposit.items_matched == 0 && count(DepositLineItemStatus::PartiallyMatched) == 0 {
        DepositStatus::Pending
    } else {
        DepositStatus::InReview
    };
    deposit.updated_at = chrono::Utc::now().naive_utc();
    uow.update_deposit(&deposit).await?;
    Ok(deposit)
}

/// Everything a write operation recomputed, in the order it was touched
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecomputeSummary {
    pub schedules: Vec<RevenueSchedule>,
    pub lines: Vec<DepositLineItem>,
    pub deposits: Vec<Deposit>,
}

/// Recompute the given schedules and lines, then every deposit owning those lines
pub async fn recompute_touched<U: UnitOfWork>(
    uow: &mut U,
    tenant_id: &str,
    schedule_ids: &[String],
    line_ids: &[String],
    tolerance: &BigDecimal,
) -> ReconResult<RecomputeSummary> {
    let mut summary = RecomputeSummary::default();
    for schedule_id in unique(schedule_ids) {
        summary
            .schedules
            .push(recompute_schedule(uow, tenant_id, &schedule_id, tolerance).await?);
    }
    for line_id in unique(line_ids) {
        summary
            .lines
            .push(recompute_line(uow, tenant_id, &line_id).await?);
    }
    let deposit_ids: Vec<String> = summary.lines.iter().map(|l| l.deposit_id.clone()).collect();
    for deposit_id in unique(&deposit_ids) {
        summary
            .deposits
            .push(recompute_deposit(uow, tenant_id, &deposit_id).await?);
    }
    Ok(summary)
}

/// De-duplicate while keeping first-seen order
pub fn unique(ids: &[String]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    ids.iter()
        .filter(|id| seen.insert(id.as_str()))
        .cloned()
        .collect()
}

/// Sum of applied usage and commission over matches passing `keep`
pub fn applied_totals<'a, I, F>(matches: I, keep: F) -> (BigDecimal, BigDecimal, bool)
where
    I: IntoIterator<Item = &'a DepositLineMatch>,
    F: Fn(&DepositLineMatch) -> bool,
{
    let mut usage = zero();
    let mut commission = zero();
    let mut any = false;
    for m in matches.into_iter().filter(|m| m.is_applied() && keep(m)) {
        usage += &m.usage_amount;
        commission += &m.commission_amount;
        any = true;
    }
    (round_money(&usage), round_money(&commission), any)
}

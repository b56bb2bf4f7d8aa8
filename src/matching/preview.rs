//! Match-group validation and projection
//!
//! A preview never writes. It loads the selection, checks that it is legal,
//! synthesizes default allocations when none were supplied and projects the
//! line and schedule figures that [`super::apply::apply_match_group`] would
//! persist. Every amount it returns is cent-rounded the same way apply
//! rounds, so the projection matches the committed result exactly.

use std::collections::{HashMap, HashSet};

use bigdecimal::BigDecimal;
use serde::{Deserialize, Serialize};

use super::allocation::{default_allocations, Allocation};
use super::recompute::{applied_totals, derive_line_allocation, derive_schedule_state, unique};
use crate::traits::UnitOfWork;
use crate::types::*;
use crate::utils::money::{is_effectively_zero, round_money, zero};
use crate::utils::validation::{line_eligibility_issues, schedule_eligibility_issues};

/// Lines, schedules and optional explicit allocations submitted together
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchGroupRequest {
    pub match_type: MatchType,
    pub line_ids: Vec<String>,
    pub schedule_ids: Vec<String>,
    /// Defaults are synthesized when absent
    pub allocations: Option<Vec<Allocation>>,
}

impl MatchGroupRequest {
    pub fn new(match_type: MatchType, line_ids: Vec<String>, schedule_ids: Vec<String>) -> Self {
        Self {
            match_type,
            line_ids,
            schedule_ids,
            allocations: None,
        }
    }

    pub fn one_to_one(line_id: impl Into<String>, schedule_id: impl Into<String>) -> Self {
        Self::new(
            MatchType::OneToOne,
            vec![line_id.into()],
            vec![schedule_id.into()],
        )
    }

    pub fn with_allocations(mut self, allocations: Vec<Allocation>) -> Self {
        self.allocations = Some(allocations);
        self
    }
}

/// Before/after allocation figures of one line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineProjection {
    pub line_id: String,
    pub line_number: u32,
    pub usage: BigDecimal,
    pub commission: BigDecimal,
    pub usage_allocated_before: BigDecimal,
    pub usage_unallocated_before: BigDecimal,
    pub commission_allocated_before: BigDecimal,
    pub commission_unallocated_before: BigDecimal,
    pub usage_allocated_after: BigDecimal,
    pub usage_unallocated_after: BigDecimal,
    pub commission_allocated_after: BigDecimal,
    pub commission_unallocated_after: BigDecimal,
    pub status_after: DepositLineItemStatus,
}

/// Before/after actuals and tolerance outcome of one schedule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleProjection {
    pub schedule_id: String,
    pub expected_usage_net: BigDecimal,
    pub expected_commission_net: BigDecimal,
    pub actual_usage_net_before: BigDecimal,
    pub actual_commission_net_before: BigDecimal,
    pub actual_usage_net_after: BigDecimal,
    pub actual_commission_net_after: BigDecimal,
    pub usage_balance_after: BigDecimal,
    pub commission_difference_after: BigDecimal,
    pub within_tolerance_after: bool,
    pub status_after: RevenueScheduleStatus,
}

/// Outcome of validating a match group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchGroupPreview {
    pub ok: bool,
    pub match_type: MatchType,
    /// Blocking problems; apply refuses while any are present
    pub issues: Vec<ValidationIssue>,
    /// Non-blocking tolerance findings
    pub warnings: Vec<ValidationIssue>,
    pub allocations: Vec<Allocation>,
    pub lines: Vec<LineProjection>,
    pub schedules: Vec<ScheduleProjection>,
    pub variance_tolerance: BigDecimal,
}

impl MatchGroupPreview {
    fn rejected(
        match_type: MatchType,
        issues: Vec<ValidationIssue>,
        allocations: Vec<Allocation>,
        tolerance: &BigDecimal,
    ) -> Self {
        Self {
            ok: false,
            match_type,
            issues,
            warnings: Vec::new(),
            allocations,
            lines: Vec::new(),
            schedules: Vec::new(),
            variance_tolerance: tolerance.clone(),
        }
    }

    /// Allocations that carry money
    pub fn effective_allocations(&self) -> impl Iterator<Item = &Allocation> {
        self.allocations.iter().filter(|a| !a.is_zero())
    }
}

/// Check that the selection counts fit the declared match type
pub fn selection_shape_issues(
    match_type: MatchType,
    line_count: usize,
    schedule_count: usize,
) -> Vec<ValidationIssue> {
    if match_type == MatchType::ManyToMany {
        return vec![ValidationIssue::new(
            IssueCode::UnsupportedMatchType,
            "Many-to-many match groups are not supported yet",
        )];
    }
    if line_count == 0 || schedule_count == 0 {
        return vec![ValidationIssue::new(
            IssueCode::InvalidSelection,
            "Select at least one deposit line and one revenue schedule",
        )];
    }
    let fits = match match_type {
        MatchType::OneToOne => line_count == 1 && schedule_count == 1,
        MatchType::OneToMany => line_count == 1 && schedule_count > 1,
        MatchType::ManyToOne => line_count > 1 && schedule_count == 1,
        MatchType::ManyToMany => false,
    };
    if fits {
        Vec::new()
    } else {
        vec![ValidationIssue::new(
            IssueCode::InvalidSelection,
            format!(
                "{} requires a different selection; got {line_count} line(s) and {schedule_count} schedule(s)",
                match_type.as_str()
            ),
        )]
    }
}

/// Validate a match group and project its effect without writing anything
///
/// Validation failures come back as `ok: false` with itemized issues;
/// `Err` is reserved for storage failures.
pub async fn preview_match_group<U: UnitOfWork>(
    uow: &U,
    tenant_id: &str,
    request: &MatchGroupRequest,
    tolerance: &BigDecimal,
) -> ReconResult<MatchGroupPreview> {
    let match_type = request.match_type;
    let line_ids = unique(&request.line_ids);
    let schedule_ids = unique(&request.schedule_ids);

    let shape = selection_shape_issues(match_type, line_ids.len(), schedule_ids.len());
    if !shape.is_empty() {
        tracing::warn!(tenant_id, match_type = match_type.as_str(), "Rejected match group shape");
        return Ok(MatchGroupPreview::rejected(
            match_type,
            shape,
            Vec::new(),
            tolerance,
        ));
    }

    let line_matches = uow.list_matches_for_lines(tenant_id, &line_ids).await?;
    let schedule_matches = uow
        .list_matches_for_schedules(tenant_id, &schedule_ids)
        .await?;

    let mut issues = Vec::new();
    let mut lines = Vec::with_capacity(line_ids.len());
    for line_id in &line_ids {
        match uow.get_line(tenant_id, line_id).await? {
            Some(line) => {
                issues.extend(line_eligibility_issues(&line));
                lines.push(line);
            }
            None => issues.push(
                ValidationIssue::new(
                    IssueCode::LineNotFound,
                    format!("Deposit line {line_id} not found"),
                )
                .for_line(line_id),
            ),
        }
    }
    let mut schedules = Vec::with_capacity(schedule_ids.len());
    for schedule_id in &schedule_ids {
        match uow.get_schedule(tenant_id, schedule_id).await? {
            Some(schedule) => {
                issues.extend(schedule_eligibility_issues(&schedule, &schedule_matches));
                schedules.push(schedule);
            }
            None => issues.push(
                ValidationIssue::new(
                    IssueCode::ScheduleNotFound,
                    format!("Revenue schedule {schedule_id} not found"),
                )
                .for_schedule(schedule_id),
            ),
        }
    }
    if !issues.is_empty() {
        tracing::warn!(tenant_id, issues = issues.len(), "Rejected match group selection");
        return Ok(MatchGroupPreview::rejected(
            match_type,
            issues,
            Vec::new(),
            tolerance,
        ));
    }

    // Stored aggregates may lag behind the match rows; start from fresh figures.
    for line in lines.iter_mut() {
        let (usage, commission, _) =
            applied_totals(&line_matches, |m| m.deposit_line_item_id == line.id);
        let before = derive_line_allocation(line, &usage, &commission);
        line.usage_allocated = before.usage_allocated;
        line.usage_unallocated = before.usage_unallocated;
        line.commission_allocated = before.commission_allocated;
        line.commission_unallocated = before.commission_unallocated;
    }
    for schedule in schedules.iter_mut() {
        let (usage, commission, _) =
            applied_totals(&schedule_matches, |m| m.revenue_schedule_id == schedule.id);
        schedule.actual_usage = usage;
        schedule.actual_commission = commission;
    }

    let existing: HashMap<(String, String), &DepositLineMatch> = line_matches
        .iter()
        .map(|m| {
            (
                (m.deposit_line_item_id.clone(), m.revenue_schedule_id.clone()),
                m,
            )
        })
        .collect();

    // Explicit allocations replace a pair's amount; defaults add to it.
    let allocations: Vec<Allocation> = match &request.allocations {
        Some(explicit) => explicit
            .iter()
            .map(|a| {
                Allocation::new(
                    a.line_id.clone(),
                    a.schedule_id.clone(),
                    a.usage_amount.clone(),
                    a.commission_amount.clone(),
                )
            })
            .collect(),
        None => default_allocations(match_type, &lines, &schedules)
            .into_iter()
            .map(|a| top_up_existing(a, &existing))
            .collect(),
    };
    issues.extend(allocation_issues(
        &allocations,
        &line_ids,
        &schedule_ids,
        &existing,
    ));
    if allocations.iter().all(Allocation::is_zero) {
        issues.push(ValidationIssue::new(
            IssueCode::NoAllocationAmounts,
            "At least one allocation must carry a non-zero amount",
        ));
    }
    if !issues.is_empty() {
        tracing::warn!(tenant_id, issues = issues.len(), "Rejected match group allocations");
        return Ok(MatchGroupPreview::rejected(
            match_type,
            issues,
            allocations,
            tolerance,
        ));
    }

    let pairs: HashSet<(&str, &str)> = allocations.iter().map(Allocation::pair).collect();
    let untouched = |m: &DepositLineMatch| {
        !pairs.contains(&(
            m.deposit_line_item_id.as_str(),
            m.revenue_schedule_id.as_str(),
        ))
    };

    let mut line_projections = Vec::with_capacity(lines.len());
    for line in &lines {
        let (other_usage, other_commission, _) = applied_totals(&line_matches, |m| {
            m.deposit_line_item_id == line.id && untouched(m)
        });
        let mine = allocations.iter().filter(|a| a.line_id == line.id);
        let usage_after = round_money(
            &(other_usage + mine.clone().map(|a| &a.usage_amount).sum::<BigDecimal>()),
        );
        let commission_after = round_money(
            &(other_commission + mine.map(|a| &a.commission_amount).sum::<BigDecimal>()),
        );

        let over_usage = round_money(&(&usage_after - &line.usage));
        if over_usage > zero() && !is_effectively_zero(&over_usage) {
            issues.push(
                ValidationIssue::new(
                    IssueCode::LineOverAllocatedUsage,
                    format!(
                        "Line {} usage would be over-allocated by {over_usage}",
                        line.line_number
                    ),
                )
                .for_line(&line.id),
            );
        }
        let over_commission = round_money(&(&commission_after - &line.commission));
        if over_commission > zero() && !is_effectively_zero(&over_commission) {
            issues.push(
                ValidationIssue::new(
                    IssueCode::LineOverAllocatedCommission,
                    format!(
                        "Line {} commission would be over-allocated by {over_commission}",
                        line.line_number
                    ),
                )
                .for_line(&line.id),
            );
        }

        let after = derive_line_allocation(line, &usage_after, &commission_after);
        line_projections.push(LineProjection {
            line_id: line.id.clone(),
            line_number: line.line_number,
            usage: round_money(&line.usage),
            commission: round_money(&line.commission),
            usage_allocated_before: line.usage_allocated.clone(),
            usage_unallocated_before: line.usage_unallocated.clone(),
            commission_allocated_before: line.commission_allocated.clone(),
            commission_unallocated_before: line.commission_unallocated.clone(),
            usage_allocated_after: after.usage_allocated,
            usage_unallocated_after: after.usage_unallocated,
            commission_allocated_after: after.commission_allocated,
            commission_unallocated_after: after.commission_unallocated,
            status_after: after.status,
        });
    }
    if !issues.is_empty() {
        tracing::warn!(tenant_id, issues = issues.len(), "Rejected over-allocated match group");
        return Ok(MatchGroupPreview::rejected(
            match_type,
            issues,
            allocations,
            tolerance,
        ));
    }

    let mut warnings = Vec::new();
    let mut schedule_projections = Vec::with_capacity(schedules.len());
    for schedule in &schedules {
        let (other_usage, other_commission, other_any) = applied_totals(&schedule_matches, |m| {
            m.revenue_schedule_id == schedule.id && untouched(m)
        });
        let mine: Vec<&Allocation> = allocations
            .iter()
            .filter(|a| a.schedule_id == schedule.id && !a.is_zero())
            .collect();
        let usage_after = other_usage + mine.iter().map(|a| &a.usage_amount).sum::<BigDecimal>();
        let commission_after =
            other_commission + mine.iter().map(|a| &a.commission_amount).sum::<BigDecimal>();

        let after = derive_schedule_state(
            schedule,
            &usage_after,
            &commission_after,
            other_any || !mine.is_empty(),
            tolerance,
        );
        match after.dispute_reason {
            Some(DisputeReason::Overpaid) => warnings.push(
                ValidationIssue::new(
                    IssueCode::ScheduleOverpaid,
                    format!(
                        "Revenue schedule {} would be overpaid (usage balance {}, commission balance {})",
                        schedule.id, after.check.usage_balance, after.check.commission_balance
                    ),
                )
                .for_schedule(&schedule.id),
            ),
            Some(DisputeReason::Underpaid) => warnings.push(
                ValidationIssue::new(
                    IssueCode::ScheduleUnderpaid,
                    format!(
                        "Revenue schedule {} would be underpaid (usage balance {}, commission balance {})",
                        schedule.id, after.check.usage_balance, after.check.commission_balance
                    ),
                )
                .for_schedule(&schedule.id),
            ),
            None => {}
        }

        schedule_projections.push(ScheduleProjection {
            schedule_id: schedule.id.clone(),
            expected_usage_net: round_money(&schedule.expected_usage_net()),
            expected_commission_net: round_money(&schedule.expected_commission_net()),
            actual_usage_net_before: round_money(&schedule.actual_usage_net()),
            actual_commission_net_before: round_money(&schedule.actual_commission_net()),
            actual_usage_net_after: after.actual_usage_net,
            actual_commission_net_after: after.actual_commission_net,
            usage_balance_after: after.check.usage_balance.clone(),
            commission_difference_after: after.check.commission_balance.clone(),
            within_tolerance_after: after.check.is_within(),
            status_after: after.status,
        });
    }

    tracing::debug!(
        tenant_id,
        match_type = match_type.as_str(),
        allocations = allocations.len(),
        warnings = warnings.len(),
        "Match group preview ok"
    );
    Ok(MatchGroupPreview {
        ok: true,
        match_type,
        issues: Vec::new(),
        warnings,
        allocations,
        lines: line_projections,
        schedules: schedule_projections,
        variance_tolerance: tolerance.clone(),
    })
}

/// Add the pair's applied amount to a synthesized piece
///
/// Defaults are sized from unallocated money, which already excludes the
/// pair's own applied match.
fn top_up_existing(
    allocation: Allocation,
    existing: &HashMap<(String, String), &DepositLineMatch>,
) -> Allocation {
    let key = (allocation.line_id.clone(), allocation.schedule_id.clone());
    match existing.get(&key) {
        Some(current) if current.is_applied() => Allocation::new(
            allocation.line_id,
            allocation.schedule_id,
            &allocation.usage_amount + &current.usage_amount,
            &allocation.commission_amount + &current.commission_amount,
        ),
        _ => allocation,
    }
}

/// Per-allocation legality checks against the selection and existing matches
fn allocation_issues(
    allocations: &[Allocation],
    line_ids: &[String],
    schedule_ids: &[String],
    existing: &HashMap<(String, String), &DepositLineMatch>,
) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();
    let mut seen: HashSet<(&str, &str)> = HashSet::new();

    for allocation in allocations {
        let issue = |code: IssueCode, message: String| {
            ValidationIssue::new(code, message)
                .for_line(&allocation.line_id)
                .for_schedule(&allocation.schedule_id)
        };
        if !line_ids.contains(&allocation.line_id) || !schedule_ids.contains(&allocation.schedule_id)
        {
            issues.push(issue(
                IssueCode::AllocationOutOfScope,
                format!(
                    "Allocation {} -> {} is outside the selected lines and schedules",
                    allocation.line_id, allocation.schedule_id
                ),
            ));
            continue;
        }
        if allocation.usage_amount < zero() || allocation.commission_amount < zero() {
            issues.push(issue(
                IssueCode::AllocationNegative,
                format!(
                    "Allocation {} -> {} has a negative amount",
                    allocation.line_id, allocation.schedule_id
                ),
            ));
        }
        if !seen.insert(allocation.pair()) {
            issues.push(issue(
                IssueCode::DuplicateAllocation,
                format!(
                    "Allocation {} -> {} appears more than once",
                    allocation.line_id, allocation.schedule_id
                ),
            ));
            continue;
        }
        let key = (allocation.line_id.clone(), allocation.schedule_id.clone());
        let Some(current) = existing.get(&key) else {
            continue;
        };
        if current.reconciled {
            issues.push(issue(
                IssueCode::MatchLocked,
                format!("Match {} is reconciled and locked", current.id),
            ));
        } else if current.match_group_id.is_some() {
            issues.push(issue(
                IssueCode::MatchInOtherGroup,
                format!("Match {} belongs to another match group", current.id),
            ));
        } else if current.is_applied() && allocation.is_zero() {
            issues.push(issue(
                IssueCode::CannotZeroAppliedMatch,
                format!(
                    "Match {} is applied; unmatch the line instead of zeroing it",
                    current.id
                ),
            ));
        }
    }
    issues
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_many_to_many_is_rejected_outright() {
        let issues = selection_shape_issues(MatchType::ManyToMany, 2, 2);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].code, IssueCode::UnsupportedMatchType);
    }

    #[test]
    fn test_shape_rules_per_match_type() {
        assert!(selection_shape_issues(MatchType::OneToOne, 1, 1).is_empty());
        assert!(selection_shape_issues(MatchType::OneToMany, 1, 3).is_empty());
        assert!(selection_shape_issues(MatchType::ManyToOne, 2, 1).is_empty());

        for (match_type, lines, schedules) in [
            (MatchType::OneToOne, 2, 1),
            (MatchType::OneToMany, 1, 1),
            (MatchType::ManyToOne, 1, 1),
            (MatchType::OneToOne, 0, 1),
        ] {
            let issues = selection_shape_issues(match_type, lines, schedules);
            assert_eq!(issues[0].code, IssueCode::InvalidSelection);
        }
    }

    #[test]
    fn test_allocation_issues_flag_scope_negative_and_duplicates() {
        let lines = vec!["l1".to_string()];
        let schedules = vec!["s1".to_string()];
        let allocations = vec![
            Allocation::new("l1", "s1", BigDecimal::from(10), BigDecimal::from(1)),
            Allocation::new("l1", "s1", BigDecimal::from(5), BigDecimal::from(0)),
            Allocation::new("l1", "s9", BigDecimal::from(5), BigDecimal::from(0)),
            Allocation::new("l9", "s1", BigDecimal::from(5), BigDecimal::from(0)),
        ];
        let codes: Vec<IssueCode> = allocation_issues(&allocations, &lines, &schedules, &HashMap::new())
            .iter()
            .map(|i| i.code)
            .collect();
        assert_eq!(
            codes,
            vec![
                IssueCode::DuplicateAllocation,
                IssueCode::AllocationOutOfScope,
                IssueCode::AllocationOutOfScope,
            ]
        );

        let negative = vec![Allocation::new(
            "l1",
            "s1",
            BigDecimal::from(-1),
            BigDecimal::from(0),
        )];
        let issues = allocation_issues(&negative, &lines, &schedules, &HashMap::new());
        assert_eq!(issues[0].code, IssueCode::AllocationNegative);
    }

    #[test]
    fn test_allocation_issues_guard_existing_matches() {
        let lines = vec!["l1".to_string()];
        let schedules = vec!["s1".to_string()];
        let mut current = DepositLineMatch::applied(
            "t1".to_string(),
            "l1".to_string(),
            "s1".to_string(),
            BigDecimal::from(10),
            BigDecimal::from(1),
            MatchSource::Manual,
        );
        let zeroing = vec![Allocation::new("l1", "s1", zero(), zero())];

        let existing = HashMap::from([(("l1".to_string(), "s1".to_string()), &current)]);
        let issues = allocation_issues(&zeroing, &lines, &schedules, &existing);
        assert_eq!(issues[0].code, IssueCode::CannotZeroAppliedMatch);

        current.match_group_id = Some("g1".to_string());
        let existing = HashMap::from([(("l1".to_string(), "s1".to_string()), &current)]);
        let issues = allocation_issues(&zeroing, &lines, &schedules, &existing);
        assert_eq!(issues[0].code, IssueCode::MatchInOtherGroup);

        current.reconciled = true;
        let existing = HashMap::from([(("l1".to_string(), "s1".to_string()), &current)]);
        let issues = allocation_issues(&zeroing, &lines, &schedules, &existing);
        assert_eq!(issues[0].code, IssueCode::MatchLocked);
    }
}

//! Validation utilities shared by the write operations

use bigdecimal::BigDecimal;

use crate::traits::UnitOfWork;
use crate::types::*;
use crate::utils::money::{is_effectively_zero, zero};

/// Itemized reasons a line cannot take new allocations
///
/// Negative lines are rejected here; they are only accepted by the
/// chargeback flow.
pub fn line_eligibility_issues(line: &DepositLineItem) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();
    if line.reconciled {
        issues.push(
            ValidationIssue::new(
                IssueCode::LineLocked,
                format!("Line {} is reconciled and locked", line.line_number),
            )
            .for_line(&line.id),
        );
    }
    if line.is_ignored() {
        issues.push(
            ValidationIssue::new(
                IssueCode::LineIgnored,
                format!("Line {} is ignored", line.line_number),
            )
            .for_line(&line.id),
        );
    }
    if line.is_negative() {
        issues.push(
            ValidationIssue::new(
                IssueCode::LineNegative,
                format!(
                    "Line {} has negative usage or commission; use the chargeback flow",
                    line.line_number
                ),
            )
            .for_line(&line.id),
        );
    }
    issues
}

/// Itemized reasons a schedule cannot take new allocations
///
/// A schedule is locked once any of its matches has been finalized.
pub fn schedule_eligibility_issues(
    schedule: &RevenueSchedule,
    schedule_matches: &[DepositLineMatch],
) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();
    if schedule.is_deleted() {
        issues.push(
            ValidationIssue::new(
                IssueCode::ScheduleNotFound,
                format!("Revenue schedule {} has been deleted", schedule.id),
            )
            .for_schedule(&schedule.id),
        );
    }
    if schedule_matches
        .iter()
        .any(|m| m.revenue_schedule_id == schedule.id && m.reconciled)
    {
        issues.push(
            ValidationIssue::new(
                IssueCode::ScheduleLocked,
                format!("Revenue schedule {} has reconciled matches", schedule.id),
            )
            .for_schedule(&schedule.id),
        );
    }
    issues
}

/// Issue for split amounts that are negative or both zero
pub fn split_amount_issue(usage: &BigDecimal, commission: &BigDecimal) -> Option<ValidationIssue> {
    let negative = *usage < zero() || *commission < zero();
    let empty = is_effectively_zero(usage) && is_effectively_zero(commission);
    (negative || empty).then(|| {
        ValidationIssue::new(
            IssueCode::InvalidSplitAmount,
            "Split amounts must be non-negative and not both zero",
        )
    })
}

/// Turn collected issues into an error when there are any
pub fn ensure_no_issues(issues: Vec<ValidationIssue>) -> ReconResult<()> {
    if issues.is_empty() {
        Ok(())
    } else {
        Err(ReconError::Validation(issues))
    }
}

/// Get a line, returning an error if not found
pub async fn require_line<U: UnitOfWork>(
    uow: &U,
    tenant_id: &str,
    line_id: &str,
) -> ReconResult<DepositLineItem> {
    uow.get_line(tenant_id, line_id)
        .await?
        .ok_or_else(|| ReconError::LineNotFound(line_id.to_string()))
}

/// Get a live (not soft-deleted) schedule, returning an error if not found
pub async fn require_schedule<U: UnitOfWork>(
    uow: &U,
    tenant_id: &str,
    schedule_id: &str,
) -> ReconResult<RevenueSchedule> {
    uow.get_schedule(tenant_id, schedule_id)
        .await?
        .filter(|s| !s.is_deleted())
        .ok_or_else(|| ReconError::ScheduleNotFound(schedule_id.to_string()))
}

/// Fail with a business-rule error when the line is reconciled
pub fn ensure_line_unlocked(line: &DepositLineItem) -> ReconResult<()> {
    if line.reconciled {
        return Err(ReconError::rule(
            rule_codes::LINE_LOCKED,
            format!("Line {} is reconciled and cannot be changed", line.id),
        ));
    }
    Ok(())
}

/// Fail with a business-rule error when any match is reconciled
pub fn ensure_matches_unlocked(matches: &[DepositLineMatch]) -> ReconResult<()> {
    if let Some(locked) = matches.iter().find(|m| m.reconciled) {
        return Err(ReconError::rule(
            rule_codes::MATCH_LOCKED,
            format!("Match {} is reconciled and cannot be changed", locked.id),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(usage: i64, commission: i64) -> DepositLineItem {
        DepositLineItem::new(
            "l1".to_string(),
            "t1".to_string(),
            "d1".to_string(),
            1,
            BigDecimal::from(usage),
            BigDecimal::from(commission),
        )
    }

    #[test]
    fn test_clean_line_has_no_issues() {
        assert!(line_eligibility_issues(&line(100, 10)).is_empty());
    }

    #[test]
    fn test_line_issues_are_itemized() {
        let mut l = line(-50, 10);
        l.reconciled = true;
        l.status = DepositLineItemStatus::Ignored;
        let codes: Vec<IssueCode> = line_eligibility_issues(&l).iter().map(|i| i.code).collect();
        assert_eq!(
            codes,
            vec![
                IssueCode::LineLocked,
                IssueCode::LineIgnored,
                IssueCode::LineNegative
            ]
        );
    }

    #[test]
    fn test_schedule_locked_by_reconciled_match() {
        let schedule = RevenueSchedule::new(
            "s1".to_string(),
            "t1".to_string(),
            None,
            BigDecimal::from(100),
            BigDecimal::from(10),
        );
        let mut m = DepositLineMatch::applied(
            "t1".to_string(),
            "l0".to_string(),
            "s1".to_string(),
            BigDecimal::from(10),
            BigDecimal::from(1),
            MatchSource::Manual,
        );
        assert!(schedule_eligibility_issues(&schedule, &[m.clone()]).is_empty());
        m.reconciled = true;
        let issues = schedule_eligibility_issues(&schedule, &[m]);
        assert_eq!(issues[0].code, IssueCode::ScheduleLocked);
    }

    #[test]
    fn test_split_amount_issue() {
        assert!(split_amount_issue(&BigDecimal::from(5), &BigDecimal::from(0)).is_none());
        let negative = split_amount_issue(&BigDecimal::from(-1), &BigDecimal::from(1));
        assert_eq!(negative.map(|i| i.code), Some(IssueCode::InvalidSplitAmount));
        assert!(split_amount_issue(&BigDecimal::from(0), &BigDecimal::from(0)).is_some());
    }
}

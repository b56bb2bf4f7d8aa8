//! Default allocation synthesis for match groups

use bigdecimal::BigDecimal;
use serde::{Deserialize, Serialize};

use crate::types::*;
use crate::utils::money::{
    is_effectively_zero, min_money, non_negative, round_money, split_proportionally,
};

/// Money moved from one line onto one schedule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Allocation {
    pub line_id: String,
    pub schedule_id: String,
    pub usage_amount: BigDecimal,
    pub commission_amount: BigDecimal,
}

impl Allocation {
    pub fn new(
        line_id: impl Into<String>,
        schedule_id: impl Into<String>,
        usage_amount: BigDecimal,
        commission_amount: BigDecimal,
    ) -> Self {
        Self {
            line_id: line_id.into(),
            schedule_id: schedule_id.into(),
            usage_amount: round_money(&usage_amount),
            commission_amount: round_money(&commission_amount),
        }
    }

    pub fn is_zero(&self) -> bool {
        is_effectively_zero(&self.usage_amount) && is_effectively_zero(&self.commission_amount)
    }

    pub fn pair(&self) -> (&str, &str) {
        (&self.line_id, &self.schedule_id)
    }
}

/// Synthesize allocations for a selection that came without explicit amounts
///
/// Lines and schedules are expected to carry freshly recomputed
/// unallocated amounts and actuals.
pub fn default_allocations(
    match_type: MatchType,
    lines: &[DepositLineItem],
    schedules: &[RevenueSchedule],
) -> Vec<Allocation> {
    match match_type {
        MatchType::OneToOne | MatchType::OneToMany => match lines.first() {
            Some(line) => allocate_one_to_many(line, schedules),
            None => Vec::new(),
        },
        MatchType::ManyToOne => match schedules.first() {
            Some(schedule) => allocate_many_to_one(lines, schedule),
            None => Vec::new(),
        },
        MatchType::ManyToMany => allocate_fifo(lines, schedules),
    }
}

/// Spread one line's unallocated money across schedules by expected-net weight
///
/// Weight is `|expected usage net| + |expected commission net|`; leftover
/// cents follow the largest remainders so the pieces sum exactly to the
/// line's unallocated totals and none goes negative.
pub fn allocate_one_to_many(
    line: &DepositLineItem,
    schedules: &[RevenueSchedule],
) -> Vec<Allocation> {
    let weights: Vec<BigDecimal> = schedules
        .iter()
        .map(|s| s.expected_usage_net().abs() + s.expected_commission_net().abs())
        .collect();
    let usage = split_proportionally(&non_negative(&line.usage_unallocated), &weights);
    let commission = split_proportionally(&non_negative(&line.commission_unallocated), &weights);

    schedules
        .iter()
        .zip(usage)
        .zip(commission)
        .map(|((schedule, usage), commission)| {
            Allocation::new(&line.id, &schedule.id, usage, commission)
        })
        .collect()
}

/// Put every line's full unallocated money on the one schedule
pub fn allocate_many_to_one(
    lines: &[DepositLineItem],
    schedule: &RevenueSchedule,
) -> Vec<Allocation> {
    lines
        .iter()
        .map(|line| {
            Allocation::new(
                &line.id,
                &schedule.id,
                non_negative(&line.usage_unallocated),
                non_negative(&line.commission_unallocated),
            )
        })
        .collect()
}

/// First-in-first-out sweep of line money into schedule capacity
///
/// Lines are taken by (line number, creation time) and schedules by
/// (schedule date, creation time). Each line drains into each schedule's
/// remaining usage/commission balance in turn; schedules with both
/// capacities exhausted are skipped. When nothing can be placed at all the
/// first line's full amount goes to the first schedule.
pub fn allocate_fifo(lines: &[DepositLineItem], schedules: &[RevenueSchedule]) -> Vec<Allocation> {
    let mut lines: Vec<&DepositLineItem> = lines.iter().collect();
    lines.sort_by(|a, b| (a.line_number, a.created_at).cmp(&(b.line_number, b.created_at)));
    let mut schedules: Vec<&RevenueSchedule> = schedules.iter().collect();
    schedules.sort_by(|a, b| {
        (a.schedule_date.is_none(), a.schedule_date, a.created_at).cmp(&(
            b.schedule_date.is_none(),
            b.schedule_date,
            b.created_at,
        ))
    });

    let mut capacity: Vec<(BigDecimal, BigDecimal)> = schedules
        .iter()
        .map(|s| {
            (
                non_negative(&round_money(&s.usage_balance())),
                non_negative(&round_money(&s.commission_balance())),
            )
        })
        .collect();

    let mut allocations = Vec::new();
    for line in &lines {
        let mut usage_left = non_negative(&line.usage_unallocated);
        let mut commission_left = non_negative(&line.commission_unallocated);

        for (schedule, (usage_cap, commission_cap)) in schedules.iter().zip(capacity.iter_mut()) {
            if is_effectively_zero(&usage_left) && is_effectively_zero(&commission_left) {
                break;
            }
            if is_effectively_zero(usage_cap) && is_effectively_zero(commission_cap) {
                continue;
            }
            let usage = min_money(&usage_left, usage_cap);
            let commission = min_money(&commission_left, commission_cap);
            let allocation = Allocation::new(&line.id, &schedule.id, usage, commission);
            if allocation.is_zero() {
                continue;
            }
            usage_left = round_money(&(&usage_left - &allocation.usage_amount));
            commission_left = round_money(&(&commission_left - &allocation.commission_amount));
            *usage_cap = round_money(&(&*usage_cap - &allocation.usage_amount));
            *commission_cap = round_money(&(&*commission_cap - &allocation.commission_amount));
            allocations.push(allocation);
        }
    }

    if allocations.is_empty() {
        if let (Some(line), Some(schedule)) = (lines.first(), schedules.first()) {
            allocations.push(Allocation::new(
                &line.id,
                &schedule.id,
                non_negative(&line.usage_unallocated),
                non_negative(&line.commission_unallocated),
            ));
        }
    }
    allocations
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn line(id: &str, number: u32, usage: i64, commission: i64) -> DepositLineItem {
        DepositLineItem::new(
            id.to_string(),
            "t1".to_string(),
            "d1".to_string(),
            number,
            BigDecimal::from(usage),
            BigDecimal::from(commission),
        )
    }

    fn schedule(id: &str, day: u32, usage: i64, commission: i64) -> RevenueSchedule {
        RevenueSchedule::new(
            id.to_string(),
            "t1".to_string(),
            NaiveDate::from_ymd_opt(2024, 1, day),
            BigDecimal::from(usage),
            BigDecimal::from(commission),
        )
    }

    fn amounts(allocations: &[Allocation]) -> Vec<(String, String, BigDecimal, BigDecimal)> {
        allocations
            .iter()
            .map(|a| {
                (
                    a.line_id.clone(),
                    a.schedule_id.clone(),
                    a.usage_amount.clone(),
                    a.commission_amount.clone(),
                )
            })
            .collect()
    }

    #[test]
    fn test_fifo_drains_lines_into_schedules_in_order() {
        let lines = vec![line("l2", 2, 50, 5), line("l1", 1, 100, 10)];
        let schedules = vec![schedule("s2", 20, 70, 7), schedule("s1", 10, 80, 8)];

        let allocations = allocate_fifo(&lines, &schedules);

        assert_eq!(
            amounts(&allocations),
            vec![
                ("l1".into(), "s1".into(), BigDecimal::from(80), BigDecimal::from(8)),
                ("l1".into(), "s2".into(), BigDecimal::from(20), BigDecimal::from(2)),
                ("l2".into(), "s2".into(), BigDecimal::from(50), BigDecimal::from(5)),
            ]
        );
    }

    #[test]
    fn test_fifo_falls_back_to_first_pair_when_no_capacity() {
        let lines = vec![line("l1", 1, 100, 10), line("l2", 2, 50, 5)];
        let mut full = schedule("s1", 1, 80, 8);
        full.actual_usage = BigDecimal::from(80);
        full.actual_commission = BigDecimal::from(8);

        let allocations = allocate_fifo(&lines, &[full]);

        assert_eq!(
            amounts(&allocations),
            vec![(
                "l1".into(),
                "s1".into(),
                BigDecimal::from(100),
                BigDecimal::from(10)
            )]
        );
    }

    #[test]
    fn test_one_to_many_is_proportional_and_conserving() {
        let mut l = line("l1", 1, 100, 10);
        l.usage_unallocated = BigDecimal::from(100);
        let schedules = vec![
            schedule("s1", 1, 60, 6),
            schedule("s2", 2, 30, 3),
            schedule("s3", 3, 10, 1),
        ];

        let allocations = allocate_one_to_many(&l, &schedules);

        assert_eq!(allocations[0].usage_amount, BigDecimal::from(60));
        assert_eq!(allocations[1].usage_amount, BigDecimal::from(30));
        assert_eq!(allocations[2].usage_amount, BigDecimal::from(10));
        let usage: BigDecimal = allocations.iter().map(|a| &a.usage_amount).sum();
        let commission: BigDecimal = allocations.iter().map(|a| &a.commission_amount).sum();
        assert_eq!(usage, BigDecimal::from(100));
        assert_eq!(commission, BigDecimal::from(10));
    }

    #[test]
    fn test_one_to_many_uneven_weights_leave_no_rounding_leak() {
        let l = line("l1", 1, 100, 7);
        let schedules = vec![
            schedule("s1", 1, 33, 1),
            schedule("s2", 2, 33, 1),
            schedule("s3", 3, 33, 1),
        ];

        let allocations = allocate_one_to_many(&l, &schedules);

        let usage: BigDecimal = allocations.iter().map(|a| &a.usage_amount).sum();
        let commission: BigDecimal = allocations.iter().map(|a| &a.commission_amount).sum();
        assert_eq!(usage, BigDecimal::from(100));
        assert_eq!(commission, BigDecimal::from(7));
    }

    #[test]
    fn test_many_to_one_takes_each_line_in_full() {
        let lines = vec![line("l1", 1, 40, 4), line("l2", 2, 60, 6)];
        let allocations = allocate_many_to_one(&lines, &schedule("s1", 1, 100, 10));
        assert_eq!(allocations.len(), 2);
        assert_eq!(allocations[1].usage_amount, BigDecimal::from(60));
        assert_eq!(allocations[1].commission_amount, BigDecimal::from(6));
    }
}

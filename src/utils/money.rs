//! Cent-precision rounding and tolerance comparison
//!
//! Every persisted or returned amount in this crate passes through
//! [`round_money`], and every "is this zero" question goes through
//! [`is_effectively_zero`], so the matcher, preview and apply paths agree
//! to the cent.

use bigdecimal::{BigDecimal, RoundingMode};

use crate::types::{DisputeReason, RevenueScheduleStatus};

/// Decimal places kept on monetary values
pub const MONEY_SCALE: i64 = 2;

/// Smallest amount treated as non-zero (0.005)
pub fn epsilon() -> BigDecimal {
    BigDecimal::new(5.into(), 3)
}

pub fn zero() -> BigDecimal {
    BigDecimal::from(0)
}

/// Round to cents, halves away from zero
pub fn round_money(amount: &BigDecimal) -> BigDecimal {
    amount.with_scale_round(MONEY_SCALE, RoundingMode::HalfUp)
}

pub fn is_effectively_zero(amount: &BigDecimal) -> bool {
    amount.abs() < epsilon()
}

/// Sum and round
pub fn sum_money<'a, I>(amounts: I) -> BigDecimal
where
    I: IntoIterator<Item = &'a BigDecimal>,
{
    let total: BigDecimal = amounts.into_iter().sum();
    round_money(&total)
}

pub fn min_money(a: &BigDecimal, b: &BigDecimal) -> BigDecimal {
    if a <= b {
        a.clone()
    } else {
        b.clone()
    }
}

/// Clamp negatives to zero
pub fn non_negative(amount: &BigDecimal) -> BigDecimal {
    if *amount < zero() {
        zero()
    } else {
        amount.clone()
    }
}

/// Width of the acceptable band around an expected net amount
pub fn tolerance_window(expected_net: &BigDecimal, tolerance: &BigDecimal) -> BigDecimal {
    let proportional = expected_net.abs() * tolerance;
    let floor = epsilon();
    if proportional > floor {
        proportional
    } else {
        floor
    }
}

/// True when `|expected - actual|` is within the tolerance window (inclusive)
pub fn within_tolerance(
    expected_net: &BigDecimal,
    actual_net: &BigDecimal,
    tolerance: &BigDecimal,
) -> bool {
    let balance = round_money(&(expected_net - actual_net));
    balance.abs() <= tolerance_window(expected_net, tolerance)
}

/// Split `total` into `parts` cent pieces; leftover cents land on the later pieces
pub fn split_evenly(total: &BigDecimal, parts: usize) -> Vec<BigDecimal> {
    if parts == 0 {
        return Vec::new();
    }
    let weights = vec![BigDecimal::from(1); parts];
    split_proportionally(total, &weights)
}

/// Split `total` by `weights`; equal split when every weight is zero.
///
/// Largest-remainder apportionment: every share is truncated to the cent,
/// then the leftover cents go one at a time to the largest truncated
/// remainders, the later index winning ties. The pieces sum exactly to
/// `round_money(total)` and all carry the sign of `total`.
pub fn split_proportionally(total: &BigDecimal, weights: &[BigDecimal]) -> Vec<BigDecimal> {
    if weights.is_empty() {
        return Vec::new();
    }
    let total = round_money(total);
    let negative = total < zero();
    let magnitude = total.abs();
    let weights: Vec<BigDecimal> = weights.iter().map(|w| w.abs()).collect();
    let weight_sum: BigDecimal = weights.iter().sum();
    let equal = is_effectively_zero(&weight_sum);
    let count = BigDecimal::from(weights.len() as u64);

    let mut pieces = Vec::with_capacity(weights.len());
    let mut remainders = Vec::with_capacity(weights.len());
    for weight in &weights {
        let exact = if equal {
            &magnitude / &count
        } else {
            &magnitude * weight / &weight_sum
        };
        let truncated = exact.with_scale_round(MONEY_SCALE, RoundingMode::Down);
        remainders.push(&exact - &truncated);
        pieces.push(truncated);
    }

    let mut order: Vec<usize> = (0..pieces.len()).collect();
    order.sort_by(|a, b| remainders[*b].cmp(&remainders[*a]).then(b.cmp(a)));
    let cent = BigDecimal::new(1.into(), MONEY_SCALE);
    let assigned: BigDecimal = pieces.iter().sum();
    let mut leftover = &magnitude - assigned;
    for index in order.iter().cycle() {
        if leftover < cent {
            break;
        }
        pieces[*index] += &cent;
        leftover -= &cent;
    }

    pieces
        .into_iter()
        .map(|piece| if negative { -piece } else { piece })
        .collect()
}

/// Usage and commission balances of a schedule checked against a tolerance
#[derive(Debug, Clone, PartialEq)]
pub struct ToleranceCheck {
    pub usage_balance: BigDecimal,
    pub commission_balance: BigDecimal,
    pub usage_within: bool,
    pub commission_within: bool,
}

impl ToleranceCheck {
    pub fn evaluate(
        expected_usage_net: &BigDecimal,
        actual_usage_net: &BigDecimal,
        expected_commission_net: &BigDecimal,
        actual_commission_net: &BigDecimal,
        tolerance: &BigDecimal,
    ) -> Self {
        Self {
            usage_balance: round_money(&(expected_usage_net - actual_usage_net)),
            commission_balance: round_money(&(expected_commission_net - actual_commission_net)),
            usage_within: within_tolerance(expected_usage_net, actual_usage_net, tolerance),
            commission_within: within_tolerance(
                expected_commission_net,
                actual_commission_net,
                tolerance,
            ),
        }
    }

    /// Both balances inside their windows
    pub fn is_within(&self) -> bool {
        self.usage_within && self.commission_within
    }

    /// Overpaid when the first out-of-window balance is negative
    pub fn dispute_reason(&self) -> Option<DisputeReason> {
        let balance = if !self.usage_within {
            &self.usage_balance
        } else if !self.commission_within {
            &self.commission_balance
        } else {
            return None;
        };
        if *balance < zero() {
            Some(DisputeReason::Overpaid)
        } else {
            Some(DisputeReason::Underpaid)
        }
    }

    /// Status for a schedule that has at least one applied match
    pub fn status(&self) -> RevenueScheduleStatus {
        if self.is_within() {
            RevenueScheduleStatus::Reconciled
        } else {
            RevenueScheduleStatus::InDispute
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn dec(s: &str) -> BigDecimal {
        BigDecimal::from_str(s).unwrap()
    }

    #[test]
    fn test_round_money_half_up() {
        assert_eq!(round_money(&dec("1.005")), dec("1.01"));
        assert_eq!(round_money(&dec("1.004")), dec("1.00"));
        assert_eq!(round_money(&dec("-2.345")), dec("-2.35"));
        assert_eq!(round_money(&dec("10")), dec("10.00"));
    }

    #[test]
    fn test_effectively_zero() {
        assert!(is_effectively_zero(&dec("0.004")));
        assert!(is_effectively_zero(&dec("-0.0049")));
        assert!(!is_effectively_zero(&dec("0.005")));
        assert!(!is_effectively_zero(&dec("0.01")));
    }

    #[test]
    fn test_tolerance_boundary_is_inclusive() {
        let tolerance = dec("0.05");
        assert!(within_tolerance(&dec("100"), &dec("95"), &tolerance));
        assert!(within_tolerance(&dec("100"), &dec("105"), &tolerance));
        assert!(!within_tolerance(&dec("100"), &dec("94.99"), &tolerance));
    }

    #[test]
    fn test_tolerance_window_floor() {
        assert_eq!(tolerance_window(&dec("0"), &dec("0.1")), epsilon());
        assert_eq!(tolerance_window(&dec("100"), &dec("0")), epsilon());
        assert!(within_tolerance(&dec("100"), &dec("100.004"), &dec("0")));
        assert!(!within_tolerance(&dec("100"), &dec("100.01"), &dec("0")));
    }

    #[test]
    fn test_split_proportionally_conserves_total() {
        let weights = vec![dec("1"), dec("1"), dec("1")];
        let pieces = split_proportionally(&dec("100"), &weights);
        assert_eq!(pieces, vec![dec("33.33"), dec("33.33"), dec("33.34")]);

        let weights = vec![dec("70"), dec("20"), dec("7.5")];
        let pieces = split_proportionally(&dec("33.33"), &weights);
        let total: BigDecimal = pieces.iter().sum();
        assert_eq!(total, dec("33.33"));
    }

    #[test]
    fn test_split_small_total_never_goes_negative() {
        let pieces = split_evenly(&dec("0.06"), 12);
        assert_eq!(pieces.len(), 12);
        assert!(pieces.iter().all(|p| *p >= zero()));
        assert_eq!(pieces.iter().sum::<BigDecimal>(), dec("0.06"));
        assert!(pieces[..6].iter().all(|p| *p == zero()));
        assert!(pieces[6..].iter().all(|p| *p == dec("0.01")));

        let pieces = split_proportionally(&dec("0.03"), &vec![dec("1"); 5]);
        assert_eq!(
            pieces,
            vec![dec("0"), dec("0"), dec("0.01"), dec("0.01"), dec("0.01")]
        );
    }

    #[test]
    fn test_split_gives_leftover_cents_to_largest_remainders() {
        // exact shares 6.666.., 3.333..
        let pieces = split_proportionally(&dec("10"), &[dec("2"), dec("1")]);
        assert_eq!(pieces, vec![dec("6.67"), dec("3.33")]);

        let pieces = split_evenly(&dec("-1"), 3);
        assert_eq!(pieces, vec![dec("-0.33"), dec("-0.33"), dec("-0.34")]);
    }

    #[test]
    fn test_split_with_zero_weights_is_even() {
        let pieces = split_proportionally(&dec("10"), &[dec("0"), dec("0")]);
        assert_eq!(pieces, vec![dec("5"), dec("5")]);
        assert_eq!(split_evenly(&dec("1"), 3), vec![dec("0.33"), dec("0.33"), dec("0.34")]);
        assert!(split_evenly(&dec("1"), 0).is_empty());
    }

    #[test]
    fn test_tolerance_check_dispute_reason() {
        let check = ToleranceCheck::evaluate(
            &dec("100"),
            &dec("120"),
            &dec("10"),
            &dec("10"),
            &dec("0.05"),
        );
        assert!(!check.is_within());
        assert_eq!(check.usage_balance, dec("-20"));
        assert_eq!(check.dispute_reason(), Some(DisputeReason::Overpaid));
        assert_eq!(check.status(), RevenueScheduleStatus::InDispute);

        let check =
            ToleranceCheck::evaluate(&dec("100"), &dec("100"), &dec("10"), &dec("8"), &dec("0"));
        assert_eq!(check.dispute_reason(), Some(DisputeReason::Underpaid));

        let check =
            ToleranceCheck::evaluate(&dec("100"), &dec("100"), &dec("10"), &dec("10"), &dec("0"));
        assert_eq!(check.status(), RevenueScheduleStatus::Reconciled);
        assert_eq!(check.dispute_reason(), None);
    }
}

//! Candidate schedule scoring for one deposit line
//!
//! Pure read: nothing here writes, and results may be stale by the time a
//! caller applies them, so apply always re-validates.

use std::collections::HashMap;

use bigdecimal::{BigDecimal, ToPrimitive};
use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use strsim::jaro_winkler;

use crate::config::{EngineMode, MatchingPreferences, ScoringWeights};
use crate::traits::UnitOfWork;
use crate::types::*;
use crate::utils::money::{round_money, ToleranceCheck};

/// Qualitative confidence band
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MatchLevel {
    Auto,
    Suggested,
    Low,
}

impl MatchLevel {
    pub fn classify(confidence: f64, preferences: &MatchingPreferences) -> Self {
        if confidence >= preferences.auto_match_min_confidence {
            Self::Auto
        } else if confidence >= preferences.suggested_matches_min_confidence {
            Self::Suggested
        } else {
            Self::Low
        }
    }
}

/// Per-call overrides of the resolved matching preferences
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CandidateOptions {
    pub limit: Option<usize>,
    /// Drop candidates scoring below this confidence
    pub min_confidence: Option<f64>,
    pub include_future_schedules: Option<bool>,
    pub variance_tolerance: Option<BigDecimal>,
    pub engine_mode: Option<EngineMode>,
}

impl CandidateOptions {
    /// Preferences with every set option laid over them
    pub fn resolve(&self, preferences: &MatchingPreferences) -> MatchingPreferences {
        let mut resolved = preferences.clone();
        if let Some(limit) = self.limit {
            resolved.candidate_limit = limit;
        }
        if let Some(include) = self.include_future_schedules {
            resolved.include_future_schedules = include;
        }
        if let Some(tolerance) = &self.variance_tolerance {
            resolved.variance_tolerance = tolerance.clone();
        }
        if let Some(mode) = self.engine_mode {
            resolved.engine_mode = mode;
        }
        resolved
    }
}

/// Individual signal scores in [0, 1]; `None` when a side lacks the data
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub account_name: Option<f64>,
    pub product: Option<f64>,
    pub date: Option<f64>,
    pub amount: Option<f64>,
    pub external_id: Option<f64>,
}

impl ScoreBreakdown {
    /// Weighted mean of the fuzzy signals that are present
    fn blend(&self, weights: &ScoringWeights, include_external_id: bool) -> f64 {
        let mut signals = vec![
            (self.account_name, weights.account_name),
            (self.product, weights.product),
            (self.date, weights.date),
            (self.amount, weights.amount),
        ];
        if include_external_id {
            signals.push((self.external_id, weights.external_id));
        }
        let (weighted, total) = signals
            .into_iter()
            .filter_map(|(score, weight)| score.map(|s| (s * weight, weight)))
            .fold((0.0, 0.0), |(acc, sum), (s, w)| (acc + s, sum + w));
        if total > 0.0 {
            weighted / total
        } else {
            0.0
        }
    }

    /// Overall confidence under the given engine mode
    pub fn confidence(&self, weights: &ScoringWeights, mode: EngineMode) -> f64 {
        let confidence = match mode {
            EngineMode::Legacy => self.blend(weights, true),
            EngineMode::Hierarchical => {
                let rest = self.blend(weights, false);
                match self.external_id {
                    Some(id) if id >= 1.0 => 0.97 + 0.03 * rest,
                    Some(_) => rest * 0.5,
                    None => rest,
                }
            }
        };
        confidence.clamp(0.0, 1.0)
    }
}

/// One ranked schedule for a line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchCandidate {
    pub revenue_schedule_id: String,
    pub schedule_date: Option<NaiveDate>,
    pub confidence: f64,
    pub level: MatchLevel,
    pub signals: ScoreBreakdown,
    pub expected_usage_net: BigDecimal,
    pub expected_commission_net: BigDecimal,
    pub usage_balance: BigDecimal,
    pub commission_balance: BigDecimal,
    /// Whether applying the line's unallocated money would land in tolerance
    pub within_tolerance_if_applied: bool,
}

/// Lowercase, strip punctuation and drop corporate suffixes
pub fn normalize_name(input: &str) -> String {
    const SUFFIXES: [&str; 10] = [
        "inc",
        "llc",
        "ltd",
        "corp",
        "corporation",
        "co",
        "company",
        "limited",
        "plc",
        "gmbh",
    ];
    input
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .filter(|token| !SUFFIXES.contains(token))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Fuzzy similarity of two names after normalization
pub fn name_similarity(a: &str, b: &str) -> Option<f64> {
    let a = normalize_name(a);
    let b = normalize_name(b);
    if a.is_empty() || b.is_empty() {
        return None;
    }
    if a == b {
        return Some(1.0);
    }
    let fuzzy = jaro_winkler(&a, &b);
    if a.contains(&b) || b.contains(&a) {
        Some(fuzzy.max(0.9))
    } else {
        Some(fuzzy)
    }
}

/// Exponential decay over the day distance
pub fn date_proximity(a: NaiveDate, b: NaiveDate, half_life_days: f64) -> f64 {
    let days = (a - b).num_days().abs() as f64;
    if half_life_days <= 0.0 {
        return if days == 0.0 { 1.0 } else { 0.0 };
    }
    0.5_f64.powf(days / half_life_days)
}

/// Relative closeness of two amounts; 1 when equal
pub fn amount_proximity(a: &BigDecimal, b: &BigDecimal) -> Option<f64> {
    let a = a.to_f64()?;
    let b = b.to_f64()?;
    let scale = a.abs().max(b.abs());
    if scale < 0.005 {
        return Some(1.0);
    }
    Some((1.0 - (a - b).abs() / scale).clamp(0.0, 1.0))
}

fn external_id_signal(line: &DepositLineItem, schedule: &RevenueSchedule) -> Option<f64> {
    let pairs = [
        (&line.customer_id_vendor, &schedule.customer_id_vendor),
        (&line.order_id_vendor, &schedule.order_id_vendor),
    ];
    let comparable: Vec<bool> = pairs
        .iter()
        .filter_map(|(l, s)| match (l.as_deref(), s.as_deref()) {
            (Some(l), Some(s)) if !l.trim().is_empty() && !s.trim().is_empty() => {
                Some(l.trim().eq_ignore_ascii_case(s.trim()))
            }
            _ => None,
        })
        .collect();
    if comparable.is_empty() {
        None
    } else if comparable.iter().any(|&equal| equal) {
        Some(1.0)
    } else {
        Some(0.0)
    }
}

fn best_of(scores: impl IntoIterator<Item = Option<f64>>) -> Option<f64> {
    scores
        .into_iter()
        .flatten()
        .fold(None, |best: Option<f64>, s| Some(best.map_or(s, |b| b.max(s))))
}

/// Signals for one line/schedule pair
pub fn score_signals(
    line: &DepositLineItem,
    reference_date: NaiveDate,
    schedule: &RevenueSchedule,
    account: Option<&Account>,
    product: Option<&Product>,
    preferences: &MatchingPreferences,
) -> ScoreBreakdown {
    let account_name = if line.account_id.is_some() && line.account_id == schedule.account_id {
        Some(1.0)
    } else {
        match (line.account_name_raw.as_deref(), account) {
            (Some(raw), Some(account)) => best_of([
                name_similarity(raw, &account.name),
                account
                    .legal_name
                    .as_deref()
                    .and_then(|legal| name_similarity(raw, legal)),
            ]),
            _ => None,
        }
    };

    let product = product.and_then(|product| {
        let part_number_hit = match (line.part_number_raw.as_deref(), product.code.as_deref()) {
            (Some(part), Some(code)) if normalize_name(part) == normalize_name(code) => Some(1.0),
            (Some(part), Some(code)) => name_similarity(part, code),
            _ => None,
        };
        best_of([
            part_number_hit,
            line.product_name_raw
                .as_deref()
                .and_then(|raw| name_similarity(raw, &product.name)),
        ])
    });

    let date = schedule
        .schedule_date
        .map(|d| date_proximity(reference_date, d, preferences.date_half_life_days));

    let amount = amount_proximity(&line.usage, &round_money(&schedule.usage_balance()));

    ScoreBreakdown {
        account_name,
        product,
        date,
        amount,
        external_id: external_id_signal(line, schedule),
    }
}

fn end_of_month(date: NaiveDate) -> NaiveDate {
    let (year, month) = if date.month() == 12 {
        (date.year() + 1, 1)
    } else {
        (date.year(), date.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1)
        .and_then(|first| first.pred_opt())
        .unwrap_or(date)
}

/// Rank open schedules sharing the line's vendor/distributor context
///
/// Schedules dated after the end of the line's payment month are left out
/// unless future schedules are included. Results are sorted by descending
/// confidence, ties keeping schedule creation order.
pub async fn find_candidates<U: UnitOfWork>(
    uow: &U,
    tenant_id: &str,
    line_id: &str,
    preferences: &MatchingPreferences,
    options: &CandidateOptions,
) -> ReconResult<Vec<MatchCandidate>> {
    let preferences = options.resolve(preferences);
    let line = uow
        .get_line(tenant_id, line_id)
        .await?
        .ok_or_else(|| ReconError::LineNotFound(line_id.to_string()))?;
    let deposit = uow
        .get_deposit(tenant_id, &line.deposit_id)
        .await?
        .ok_or_else(|| ReconError::DepositNotFound(line.deposit_id.clone()))?;

    let reference_date = line.payment_date.unwrap_or(deposit.deposit_date);
    let cutoff = end_of_month(reference_date);
    let vendor = line
        .vendor_account_id
        .as_deref()
        .or(deposit.vendor_account_id.as_deref());
    let distributor = line
        .distributor_account_id
        .as_deref()
        .or(deposit.distributor_account_id.as_deref());

    let mut pool: Vec<RevenueSchedule> = uow
        .list_schedules_for_context(tenant_id, vendor, distributor)
        .await?
        .into_iter()
        .filter(|s| s.status != RevenueScheduleStatus::Reconciled)
        .filter(|s| {
            preferences.include_future_schedules || s.schedule_date.is_none_or(|d| d <= cutoff)
        })
        .collect();
    pool.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));

    let mut accounts: HashMap<String, Option<Account>> = HashMap::new();
    let mut products: HashMap<String, Option<Product>> = HashMap::new();
    let mut candidates = Vec::with_capacity(pool.len());
    for schedule in &pool {
        if let Some(account_id) = &schedule.account_id {
            if !accounts.contains_key(account_id) {
                let account = uow.get_account(tenant_id, account_id).await?;
                accounts.insert(account_id.clone(), account);
            }
        }
        if let Some(product_id) = &schedule.product_id {
            if !products.contains_key(product_id) {
                let product = uow.get_product(tenant_id, product_id).await?;
                products.insert(product_id.clone(), product);
            }
        }
        let account = schedule
            .account_id
            .as_ref()
            .and_then(|id| accounts.get(id))
            .and_then(Option::as_ref);
        let product = schedule
            .product_id
            .as_ref()
            .and_then(|id| products.get(id))
            .and_then(Option::as_ref);

        let signals = score_signals(&line, reference_date, schedule, account, product, &preferences);
        let confidence = signals.confidence(&preferences.weights, preferences.engine_mode);
        if options.min_confidence.is_some_and(|min| confidence < min) {
            continue;
        }

        let if_applied = ToleranceCheck::evaluate(
            &schedule.expected_usage_net(),
            &(schedule.actual_usage_net() + &line.usage_unallocated),
            &schedule.expected_commission_net(),
            &(schedule.actual_commission_net() + &line.commission_unallocated),
            &preferences.variance_tolerance,
        );
        candidates.push(MatchCandidate {
            revenue_schedule_id: schedule.id.clone(),
            schedule_date: schedule.schedule_date,
            confidence,
            level: MatchLevel::classify(confidence, &preferences),
            signals,
            expected_usage_net: round_money(&schedule.expected_usage_net()),
            expected_commission_net: round_money(&schedule.expected_commission_net()),
            usage_balance: round_money(&schedule.usage_balance()),
            commission_balance: round_money(&schedule.commission_balance()),
            within_tolerance_if_applied: if_applied.is_within(),
        });
    }

    // Stable: equal confidence keeps the pool's creation order.
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    candidates.truncate(preferences.candidate_limit);

    tracing::debug!(
        tenant_id,
        line_id,
        pool = pool.len(),
        returned = candidates.len(),
        "Scored match candidates"
    );
    Ok(candidates)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_normalize_strips_suffixes_and_punctuation() {
        assert_eq!(normalize_name("Acme, Inc."), "acme");
        assert_eq!(normalize_name("Blue  River LLC"), "blue river");
    }

    #[test]
    fn test_name_similarity() {
        assert_eq!(name_similarity("ACME Inc", "Acme"), Some(1.0));
        assert!(name_similarity("Acme Cloud", "Acme").unwrap_or(0.0) >= 0.9);
        assert!(name_similarity("Acme", "Zenith Partners").unwrap_or(1.0) < 0.7);
        assert_eq!(name_similarity("", "Acme"), None);
    }

    #[test]
    fn test_date_proximity_halves_per_half_life() {
        assert_eq!(date_proximity(date(2024, 1, 1), date(2024, 1, 1), 30.0), 1.0);
        let month = date_proximity(date(2024, 1, 1), date(2024, 1, 31), 30.0);
        assert!((month - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_amount_proximity() {
        assert_eq!(
            amount_proximity(&BigDecimal::from(100), &BigDecimal::from(100)),
            Some(1.0)
        );
        assert_eq!(
            amount_proximity(&BigDecimal::from(100), &BigDecimal::from(0)),
            Some(0.0)
        );
        assert_eq!(
            amount_proximity(&BigDecimal::from(0), &BigDecimal::from(0)),
            Some(1.0)
        );
    }

    #[test]
    fn test_hierarchical_tiers_on_external_ids() {
        let weights = ScoringWeights::default();
        let fuzzy = ScoreBreakdown {
            account_name: Some(0.8),
            product: Some(0.8),
            date: Some(0.8),
            amount: Some(0.8),
            external_id: None,
        };
        let rest = fuzzy.confidence(&weights, EngineMode::Hierarchical);
        assert!((rest - 0.8).abs() < 1e-9);

        let matched = ScoreBreakdown {
            external_id: Some(1.0),
            ..fuzzy.clone()
        };
        assert!(matched.confidence(&weights, EngineMode::Hierarchical) >= 0.97);

        let mismatched = ScoreBreakdown {
            external_id: Some(0.0),
            ..fuzzy
        };
        assert!((mismatched.confidence(&weights, EngineMode::Hierarchical) - 0.4).abs() < 1e-9);
    }

    #[test]
    fn test_legacy_blends_external_id_as_a_signal() {
        let weights = ScoringWeights::default();
        let signals = ScoreBreakdown {
            account_name: Some(1.0),
            product: None,
            date: None,
            amount: None,
            external_id: Some(0.0),
        };
        let expected = weights.account_name / (weights.account_name + weights.external_id);
        assert!((signals.confidence(&weights, EngineMode::Legacy) - expected).abs() < 1e-9);
    }

    #[test]
    fn test_levels_follow_thresholds() {
        let preferences = MatchingPreferences::default();
        assert_eq!(MatchLevel::classify(0.95, &preferences), MatchLevel::Auto);
        assert_eq!(MatchLevel::classify(0.70, &preferences), MatchLevel::Suggested);
        assert_eq!(MatchLevel::classify(0.69, &preferences), MatchLevel::Low);
    }

    #[test]
    fn test_end_of_month() {
        assert_eq!(end_of_month(date(2024, 2, 10)), date(2024, 2, 29));
        assert_eq!(end_of_month(date(2024, 12, 31)), date(2024, 12, 31));
    }
}

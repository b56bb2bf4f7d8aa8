//! Matching preferences: tolerance, confidence thresholds and scoring weights

use bigdecimal::BigDecimal;
use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;

use crate::types::{ReconError, ReconResult};

/// Which candidate scoring strategy to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineMode {
    /// One flat weighted blend over every available signal
    Legacy,
    /// External IDs decide first; the blend only ranks within a tier
    Hierarchical,
}

impl FromStr for EngineMode {
    type Err = ReconError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "legacy" => Ok(Self::Legacy),
            "hierarchical" => Ok(Self::Hierarchical),
            other => Err(ReconError::Config(format!("unknown engine mode '{other}'"))),
        }
    }
}

/// Relative weights of the candidate scoring signals
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoringWeights {
    pub account_name: f64,
    pub product: f64,
    pub date: f64,
    pub amount: f64,
    /// Only used by the legacy blend; hierarchical mode tiers on IDs instead
    pub external_id: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            account_name: 0.35,
            product: 0.30,
            date: 0.15,
            amount: 0.20,
            external_id: 1.0,
        }
    }
}

impl ScoringWeights {
    fn all(&self) -> [f64; 5] {
        [
            self.account_name,
            self.product,
            self.date,
            self.amount,
            self.external_id,
        ]
    }
}

/// Tenant/user matching preferences
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchingPreferences {
    /// Fraction of expected net allowed as variance before a schedule is disputed
    pub variance_tolerance: BigDecimal,
    pub auto_match_min_confidence: f64,
    pub suggested_matches_min_confidence: f64,
    pub engine_mode: EngineMode,
    pub include_future_schedules: bool,
    pub candidate_limit: usize,
    /// Days after which the date signal has halved
    pub date_half_life_days: f64,
    pub weights: ScoringWeights,
}

impl Default for MatchingPreferences {
    fn default() -> Self {
        Self {
            variance_tolerance: BigDecimal::from(0),
            auto_match_min_confidence: 0.95,
            suggested_matches_min_confidence: 0.70,
            engine_mode: EngineMode::Hierarchical,
            include_future_schedules: false,
            candidate_limit: 5,
            date_half_life_days: 30.0,
            weights: ScoringWeights::default(),
        }
    }
}

impl MatchingPreferences {
    /// Load preferences from `RECON_*` environment variables over the defaults
    pub fn from_env() -> ReconResult<Self> {
        let defaults = Self::default();
        let preferences = Self {
            variance_tolerance: env_parse("RECON_VARIANCE_TOLERANCE")?
                .unwrap_or(defaults.variance_tolerance),
            auto_match_min_confidence: env_parse("RECON_AUTO_MATCH_MIN_CONFIDENCE")?
                .unwrap_or(defaults.auto_match_min_confidence),
            suggested_matches_min_confidence: env_parse("RECON_SUGGESTED_MATCHES_MIN_CONFIDENCE")?
                .unwrap_or(defaults.suggested_matches_min_confidence),
            engine_mode: env_parse("RECON_ENGINE_MODE")?.unwrap_or(defaults.engine_mode),
            include_future_schedules: env_parse("RECON_INCLUDE_FUTURE_SCHEDULES")?
                .unwrap_or(defaults.include_future_schedules),
            candidate_limit: env_parse("RECON_CANDIDATE_LIMIT")?
                .unwrap_or(defaults.candidate_limit),
            date_half_life_days: env_parse("RECON_DATE_HALF_LIFE_DAYS")?
                .unwrap_or(defaults.date_half_life_days),
            weights: defaults.weights,
        };
        preferences.validate()?;
        Ok(preferences)
    }

    /// Reject thresholds and weights that cannot produce a sensible ranking
    pub fn validate(&self) -> ReconResult<()> {
        let in_unit = |v: f64| (0.0..=1.0).contains(&v);
        if !in_unit(self.auto_match_min_confidence) || !in_unit(self.suggested_matches_min_confidence)
        {
            return Err(ReconError::Config(
                "confidence thresholds must be within [0, 1]".to_string(),
            ));
        }
        if self.suggested_matches_min_confidence > self.auto_match_min_confidence {
            return Err(ReconError::Config(format!(
                "suggested threshold {} exceeds auto threshold {}",
                self.suggested_matches_min_confidence, self.auto_match_min_confidence
            )));
        }
        if self.variance_tolerance < BigDecimal::from(0) {
            return Err(ReconError::Config(
                "variance tolerance cannot be negative".to_string(),
            ));
        }
        if self.date_half_life_days <= 0.0 {
            return Err(ReconError::Config(
                "date half-life must be positive".to_string(),
            ));
        }
        let weights = self.weights.all();
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(ReconError::Config(
                "scoring weights must be finite and non-negative".to_string(),
            ));
        }
        if weights.iter().sum::<f64>() <= 0.0 {
            return Err(ReconError::Config(
                "at least one scoring weight must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

fn env_parse<T: FromStr>(key: &str) -> ReconResult<Option<T>> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ReconError::Config(format!("{key} has an invalid value '{raw}'"))),
        Err(_) => Ok(None),
    }
}

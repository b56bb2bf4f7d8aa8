//! Core types and data structures for the reconciliation engine

use bigdecimal::BigDecimal;
use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Allocation state of a deposit line item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DepositLineItemStatus {
    /// Nothing allocated yet
    Unmatched,
    /// Some money allocated, some still unallocated
    PartiallyMatched,
    /// Usage and commission fully allocated
    Matched,
    /// Excluded from reconciliation by an operator
    Ignored,
}

/// Reconciliation state of a revenue schedule, derived from its applied matches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RevenueScheduleStatus {
    Unreconciled,
    Reconciled,
    InDispute,
}

/// Direction of an out-of-tolerance schedule balance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DisputeReason {
    /// More was paid than expected
    Overpaid,
    /// Less was paid than expected
    Underpaid,
}

/// Why a schedule exists outside the normal sales pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FlexClassification {
    None,
    Adjustment,
    Bonus,
    FlexProduct,
    FlexChargeback,
}

/// Reason recorded on flex schedules
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FlexReasonCode {
    Overage,
    BonusVariance,
    UnknownProduct,
    ChargebackNegative,
    Manual,
}

/// State of a line-to-schedule allocation edge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MatchStatus {
    Suggested,
    Applied,
    Rejected,
}

/// Who created a match
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MatchSource {
    Auto,
    Manual,
}

/// Cardinality of a match group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MatchType {
    OneToOne,
    OneToMany,
    ManyToOne,
    ManyToMany,
}

impl MatchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OneToOne => "one_to_one",
            Self::OneToMany => "one_to_many",
            Self::ManyToOne => "many_to_one",
            Self::ManyToMany => "many_to_many",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MatchGroupStatus {
    Applied,
    Undone,
}

/// Deposit-level progress, derived from its lines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DepositStatus {
    /// No line has any allocation
    Pending,
    /// Some lines allocated
    InReview,
    /// Every line is matched or ignored
    Completed,
}

/// How a bundle treats the schedules it supersedes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BundleMode {
    /// Leave the superseded schedules in place
    KeepOld,
    /// Soft-delete every remaining schedule of the base opportunity product
    SoftDeleteOld,
}

impl BundleMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::KeepOld => "keep_old",
            Self::SoftDeleteOld => "soft_delete_old",
        }
    }
}

/// Kind of tenant-scoped synthetic product used by flex flows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FlexProductKind {
    FlexProduct,
    FlexChargeback,
}

impl FlexProductKind {
    pub fn product_name(&self) -> &'static str {
        match self {
            Self::FlexProduct => "Flex Product",
            Self::FlexChargeback => "Flex Chargeback",
        }
    }
}

/// A batch of money received from a distributor or vendor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deposit {
    pub id: String,
    pub tenant_id: String,
    pub vendor_account_id: Option<String>,
    pub distributor_account_id: Option<String>,
    pub deposit_date: NaiveDate,
    pub status: DepositStatus,
    /// Finalized deposits are locked to this engine
    pub reconciled: bool,
    pub total_usage: BigDecimal,
    pub usage_allocated: BigDecimal,
    pub usage_unallocated: BigDecimal,
    pub total_commission: BigDecimal,
    pub commission_allocated: BigDecimal,
    pub commission_unallocated: BigDecimal,
    pub total_items: u32,
    pub items_matched: u32,
    pub items_unmatched: u32,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl Deposit {
    /// Create an empty deposit; aggregates are filled by recompute
    pub fn new(id: String, tenant_id: String, deposit_date: NaiveDate) -> Self {
        let now = chrono::Utc::now().naive_utc();
        Self {
            id,
            tenant_id,
            vendor_account_id: None,
            distributor_account_id: None,
            deposit_date,
            status: DepositStatus::Pending,
            reconciled: false,
            total_usage: BigDecimal::from(0),
            usage_allocated: BigDecimal::from(0),
            usage_unallocated: BigDecimal::from(0),
            total_commission: BigDecimal::from(0),
            commission_allocated: BigDecimal::from(0),
            commission_unallocated: BigDecimal::from(0),
            total_items: 0,
            items_matched: 0,
            items_unmatched: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

/// One row of money received for one customer/product in one deposit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepositLineItem {
    pub id: String,
    pub tenant_id: String,
    pub deposit_id: String,
    pub line_number: u32,
    pub status: DepositLineItemStatus,
    /// Locks the line against any change by this engine
    pub reconciled: bool,
    pub usage: BigDecimal,
    pub usage_allocated: BigDecimal,
    pub usage_unallocated: BigDecimal,
    pub commission: BigDecimal,
    pub commission_allocated: BigDecimal,
    pub commission_unallocated: BigDecimal,
    pub payment_date: Option<NaiveDate>,
    /// Resolved customer account, when import could resolve it
    pub account_id: Option<String>,
    pub vendor_account_id: Option<String>,
    pub distributor_account_id: Option<String>,
    pub account_name_raw: Option<String>,
    pub product_name_raw: Option<String>,
    pub part_number_raw: Option<String>,
    pub customer_id_vendor: Option<String>,
    pub order_id_vendor: Option<String>,
    /// Schedule receiving the largest applied match
    pub primary_revenue_schedule_id: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl DepositLineItem {
    /// Create an unmatched line with everything unallocated
    pub fn new(
        id: String,
        tenant_id: String,
        deposit_id: String,
        line_number: u32,
        usage: BigDecimal,
        commission: BigDecimal,
    ) -> Self {
        let now = chrono::Utc::now().naive_utc();
        Self {
            id,
            tenant_id,
            deposit_id,
            line_number,
            status: DepositLineItemStatus::Unmatched,
            reconciled: false,
            usage_allocated: BigDecimal::from(0),
            usage_unallocated: usage.clone(),
            usage,
            commission_allocated: BigDecimal::from(0),
            commission_unallocated: commission.clone(),
            commission,
            payment_date: None,
            account_id: None,
            vendor_account_id: None,
            distributor_account_id: None,
            account_name_raw: None,
            product_name_raw: None,
            part_number_raw: None,
            customer_id_vendor: None,
            order_id_vendor: None,
            primary_revenue_schedule_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Chargeback lines carry a negative usage or commission
    pub fn is_negative(&self) -> bool {
        self.usage < BigDecimal::from(0) || self.commission < BigDecimal::from(0)
    }

    pub fn is_ignored(&self) -> bool {
        self.status == DepositLineItemStatus::Ignored
    }
}

/// One expected payment from the sales pipeline for one opportunity product in one period
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevenueSchedule {
    pub id: String,
    pub tenant_id: String,
    pub schedule_date: Option<NaiveDate>,
    pub account_id: Option<String>,
    pub opportunity_id: Option<String>,
    pub opportunity_product_id: Option<String>,
    pub product_id: Option<String>,
    pub vendor_account_id: Option<String>,
    pub distributor_account_id: Option<String>,
    pub customer_id_vendor: Option<String>,
    pub order_id_vendor: Option<String>,
    pub expected_usage: BigDecimal,
    pub usage_adjustment: BigDecimal,
    pub expected_commission: BigDecimal,
    pub expected_commission_adjustment: BigDecimal,
    /// Sum of applied match usage, maintained by recompute only
    pub actual_usage: BigDecimal,
    pub actual_usage_adjustment: BigDecimal,
    /// Sum of applied match commission, maintained by recompute only
    pub actual_commission: BigDecimal,
    pub actual_commission_adjustment: BigDecimal,
    pub status: RevenueScheduleStatus,
    pub dispute_reason: Option<DisputeReason>,
    pub flex_classification: FlexClassification,
    pub flex_reason_code: Option<FlexReasonCode>,
    /// Schedule a flex schedule was split from
    pub parent_schedule_id: Option<String>,
    pub deleted_at: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl RevenueSchedule {
    /// Create an unreconciled schedule with no adjustments
    pub fn new(
        id: String,
        tenant_id: String,
        schedule_date: Option<NaiveDate>,
        expected_usage: BigDecimal,
        expected_commission: BigDecimal,
    ) -> Self {
        let now = chrono::Utc::now().naive_utc();
        Self {
            id,
            tenant_id,
            schedule_date,
            account_id: None,
            opportunity_id: None,
            opportunity_product_id: None,
            product_id: None,
            vendor_account_id: None,
            distributor_account_id: None,
            customer_id_vendor: None,
            order_id_vendor: None,
            expected_usage,
            usage_adjustment: BigDecimal::from(0),
            expected_commission,
            expected_commission_adjustment: BigDecimal::from(0),
            actual_usage: BigDecimal::from(0),
            actual_usage_adjustment: BigDecimal::from(0),
            actual_commission: BigDecimal::from(0),
            actual_commission_adjustment: BigDecimal::from(0),
            status: RevenueScheduleStatus::Unreconciled,
            dispute_reason: None,
            flex_classification: FlexClassification::None,
            flex_reason_code: None,
            parent_schedule_id: None,
            deleted_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn expected_usage_net(&self) -> BigDecimal {
        &self.expected_usage + &self.usage_adjustment
    }

    pub fn expected_commission_net(&self) -> BigDecimal {
        &self.expected_commission + &self.expected_commission_adjustment
    }

    pub fn actual_usage_net(&self) -> BigDecimal {
        &self.actual_usage + &self.actual_usage_adjustment
    }

    pub fn actual_commission_net(&self) -> BigDecimal {
        &self.actual_commission + &self.actual_commission_adjustment
    }

    /// Expected minus actual usage; negative means overpaid
    pub fn usage_balance(&self) -> BigDecimal {
        self.expected_usage_net() - self.actual_usage_net()
    }

    /// Expected minus actual commission; negative means overpaid
    pub fn commission_balance(&self) -> BigDecimal {
        self.expected_commission_net() - self.actual_commission_net()
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn is_flex(&self) -> bool {
        self.flex_classification != FlexClassification::None
    }
}

/// Allocation edge between one deposit line and one revenue schedule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepositLineMatch {
    pub id: String,
    pub tenant_id: String,
    pub deposit_line_item_id: String,
    pub revenue_schedule_id: String,
    pub usage_amount: BigDecimal,
    pub commission_amount: BigDecimal,
    pub status: MatchStatus,
    pub source: MatchSource,
    pub match_group_id: Option<String>,
    /// Finalized matches are locked
    pub reconciled: bool,
    pub confidence_score: Option<f64>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl DepositLineMatch {
    /// Create an applied match between a line and a schedule
    pub fn applied(
        tenant_id: String,
        deposit_line_item_id: String,
        revenue_schedule_id: String,
        usage_amount: BigDecimal,
        commission_amount: BigDecimal,
        source: MatchSource,
    ) -> Self {
        let now = chrono::Utc::now().naive_utc();
        Self {
            id: new_id(),
            tenant_id,
            deposit_line_item_id,
            revenue_schedule_id,
            usage_amount,
            commission_amount,
            status: MatchStatus::Applied,
            source,
            match_group_id: None,
            reconciled: false,
            confidence_score: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_applied(&self) -> bool {
        self.status == MatchStatus::Applied
    }
}

/// A set of allocations applied together
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchGroup {
    pub id: String,
    pub tenant_id: String,
    pub match_type: MatchType,
    pub status: MatchGroupStatus,
    pub line_ids: Vec<String>,
    pub schedule_ids: Vec<String>,
    pub created_by: String,
    pub created_at: NaiveDateTime,
    pub undone_at: Option<NaiveDateTime>,
}

/// Customer account as seen by the matcher
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub legal_name: Option<String>,
}

/// Catalog product, possibly synthetic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub code: Option<String>,
    pub family: Option<String>,
    pub revenue_type: Option<String>,
    pub vendor_account_id: Option<String>,
    pub distributor_account_id: Option<String>,
    pub is_flex: bool,
    pub flex_kind: Option<FlexProductKind>,
    pub is_bundle_generated: bool,
    pub created_at: NaiveDateTime,
}

impl Product {
    pub fn new(id: String, tenant_id: String, name: String) -> Self {
        Self {
            id,
            tenant_id,
            name,
            code: None,
            family: None,
            revenue_type: None,
            vendor_account_id: None,
            distributor_account_id: None,
            is_flex: false,
            flex_kind: None,
            is_bundle_generated: false,
            created_at: chrono::Utc::now().naive_utc(),
        }
    }
}

/// Per-opportunity snapshot of a product
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpportunityProduct {
    pub id: String,
    pub tenant_id: String,
    pub opportunity_id: String,
    pub product_id: String,
    pub product_name_snapshot: String,
    pub quantity: BigDecimal,
    pub expected_usage: BigDecimal,
    pub expected_commission: BigDecimal,
    pub is_flex: bool,
    pub is_bundle_generated: bool,
    pub created_at: NaiveDateTime,
}

/// Idempotent record of one bundle rip-and-replace run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleOperation {
    pub id: String,
    pub tenant_id: String,
    /// Unique per tenant while the operation is live
    pub idempotency_key: String,
    pub deposit_id: String,
    pub base_schedule_id: String,
    pub mode: BundleMode,
    pub line_ids: Vec<String>,
    pub created_product_ids: Vec<String>,
    pub created_opportunity_product_ids: Vec<String>,
    pub created_schedule_ids: Vec<String>,
    pub replaced_schedule_ids: Vec<String>,
    pub line_to_schedule: BTreeMap<String, String>,
    pub created_match_ids: Vec<String>,
    pub audit_log_id: Option<String>,
    pub created_by: String,
    pub created_at: NaiveDateTime,
    pub undone_at: Option<NaiveDateTime>,
}

/// Structured action names written to the audit log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuditAction {
    MatchGroupApplied,
    MatchGroupUndone,
    LineUnmatched,
    BundleRipReplace,
    BundleUndone,
    FlexAdjustmentSplit,
    FlexProductSplit,
    FlexChargebackCreated,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MatchGroupApplied => "deposit_match.group_applied",
            Self::MatchGroupUndone => "deposit_match.group_undone",
            Self::LineUnmatched => "deposit_match.line_unmatched",
            Self::BundleRipReplace => "revenue_schedule.bundle_rip_replace",
            Self::BundleUndone => "revenue_schedule.bundle_undone",
            Self::FlexAdjustmentSplit => "revenue_schedule.flex_adjustment_split",
            Self::FlexProductSplit => "revenue_schedule.flex_product_split",
            Self::FlexChargebackCreated => "revenue_schedule.flex_chargeback_created",
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One append-only audit record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: String,
    pub tenant_id: String,
    pub user_id: String,
    pub action: AuditAction,
    pub entity_ids: Vec<String>,
    pub before: serde_json::Value,
    pub after: serde_json::Value,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub created_at: NaiveDateTime,
}

impl AuditEntry {
    pub fn new(
        ctx: &OperationContext,
        action: AuditAction,
        entity_ids: Vec<String>,
        before: serde_json::Value,
        after: serde_json::Value,
    ) -> Self {
        let request = ctx.request.clone().unwrap_or_default();
        Self {
            id: new_id(),
            tenant_id: ctx.tenant_id.clone(),
            user_id: ctx.user_id.clone(),
            action,
            entity_ids,
            before,
            after,
            ip_address: request.ip_address,
            user_agent: request.user_agent,
            created_at: chrono::Utc::now().naive_utc(),
        }
    }
}

/// Client metadata used only for audit attribution
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestContext {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

/// Caller identity for one engine invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationContext {
    pub tenant_id: String,
    pub user_id: String,
    pub request: Option<RequestContext>,
}

impl OperationContext {
    pub fn new(tenant_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            user_id: user_id.into(),
            request: None,
        }
    }

    pub fn with_request(mut self, request: RequestContext) -> Self {
        self.request = Some(request);
        self
    }
}

/// Stable codes for itemized validation issues and warnings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueCode {
    UnsupportedMatchType,
    InvalidSelection,
    LineNotFound,
    ScheduleNotFound,
    LineLocked,
    LineIgnored,
    LineNegative,
    LineNotInDeposit,
    LineHasAppliedMatches,
    ScheduleLocked,
    ScheduleMissingDate,
    AllocationOutOfScope,
    AllocationNegative,
    DuplicateAllocation,
    CannotZeroAppliedMatch,
    MatchInOtherGroup,
    MatchLocked,
    NoAllocationAmounts,
    LineOverAllocatedUsage,
    LineOverAllocatedCommission,
    ScheduleOverpaid,
    ScheduleUnderpaid,
    BundleTooFewLines,
    InvalidSplitAmount,
}

impl IssueCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UnsupportedMatchType => "unsupported_match_type",
            Self::InvalidSelection => "invalid_selection",
            Self::LineNotFound => "line_not_found",
            Self::ScheduleNotFound => "schedule_not_found",
            Self::LineLocked => "line_locked",
            Self::LineIgnored => "line_ignored",
            Self::LineNegative => "line_negative",
            Self::LineNotInDeposit => "line_not_in_deposit",
            Self::LineHasAppliedMatches => "line_has_applied_matches",
            Self::ScheduleLocked => "schedule_locked",
            Self::ScheduleMissingDate => "schedule_missing_date",
            Self::AllocationOutOfScope => "allocation_out_of_scope",
            Self::AllocationNegative => "allocation_negative",
            Self::DuplicateAllocation => "duplicate_allocation",
            Self::CannotZeroAppliedMatch => "cannot_zero_applied_match",
            Self::MatchInOtherGroup => "match_in_other_group",
            Self::MatchLocked => "match_locked",
            Self::NoAllocationAmounts => "no_allocation_amounts",
            Self::LineOverAllocatedUsage => "line_over_allocated_usage",
            Self::LineOverAllocatedCommission => "line_over_allocated_commission",
            Self::ScheduleOverpaid => "schedule_overpaid",
            Self::ScheduleUnderpaid => "schedule_underpaid",
            Self::BundleTooFewLines => "bundle_too_few_lines",
            Self::InvalidSplitAmount => "invalid_split_amount",
        }
    }
}

impl fmt::Display for IssueCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One itemized problem found while validating a request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub code: IssueCode,
    pub message: String,
    pub line_id: Option<String>,
    pub schedule_id: Option<String>,
}

impl ValidationIssue {
    pub fn new(code: IssueCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            line_id: None,
            schedule_id: None,
        }
    }

    pub fn for_line(mut self, line_id: impl Into<String>) -> Self {
        self.line_id = Some(line_id.into());
        self
    }

    pub fn for_schedule(mut self, schedule_id: impl Into<String>) -> Self {
        self.schedule_id = Some(schedule_id.into());
        self
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

/// Stable codes carried by [`ReconError::BusinessRule`]
pub mod rule_codes {
    pub const BUNDLE_REPLACE_INELIGIBLE: &str = "BUNDLE_REPLACE_INELIGIBLE";
    pub const BUNDLE_ALREADY_UNDONE: &str = "BUNDLE_ALREADY_UNDONE";
    pub const BUNDLE_MATCH_LOCKED: &str = "BUNDLE_MATCH_LOCKED";
    pub const CHARGEBACK_REQUIRES_NEGATIVE_LINE: &str = "CHARGEBACK_REQUIRES_NEGATIVE_LINE";
    pub const SPLIT_EXCEEDS_ALLOCATION: &str = "SPLIT_EXCEEDS_ALLOCATION";
    pub const NO_APPLIED_MATCH: &str = "NO_APPLIED_MATCH";
    pub const LINE_LOCKED: &str = "LINE_LOCKED";
    pub const MATCH_LOCKED: &str = "MATCH_LOCKED";
    pub const MATCH_GROUP_ALREADY_UNDONE: &str = "MATCH_GROUP_ALREADY_UNDONE";
}

/// Errors that can occur in the reconciliation engine
#[derive(Debug, thiserror::Error)]
pub enum ReconError {
    #[error("Storage error: {0}")]
    Storage(String),
    #[error("Deposit not found: {0}")]
    DepositNotFound(String),
    #[error("Deposit line item not found: {0}")]
    LineNotFound(String),
    #[error("Revenue schedule not found: {0}")]
    ScheduleNotFound(String),
    #[error("Deposit line match not found: {0}")]
    MatchNotFound(String),
    #[error("Match group not found: {0}")]
    MatchGroupNotFound(String),
    #[error("Bundle operation not found: {0}")]
    BundleOperationNotFound(String),
    #[error("Validation failed: {}", join_issues(.0))]
    Validation(Vec<ValidationIssue>),
    #[error("{code}: {message}")]
    BusinessRule { code: &'static str, message: String },
    #[error("Not supported: {0}")]
    Unsupported(String),
    #[error("Unique constraint violated: {0}")]
    UniqueViolation(String),
    #[error("Transaction conflict: {0}")]
    Conflict(String),
    #[error("Configuration error: {0}")]
    Config(String),
}

impl ReconError {
    pub fn rule(code: &'static str, message: impl Into<String>) -> Self {
        Self::BusinessRule {
            code,
            message: message.into(),
        }
    }

    /// True when the caller must change the request before resubmitting
    pub fn is_client_error(&self) -> bool {
        !matches!(
            self,
            Self::Storage(_) | Self::UniqueViolation(_) | Self::Conflict(_) | Self::Config(_)
        )
    }

    /// Stable codes of every itemized problem carried by this error
    pub fn codes(&self) -> Vec<&'static str> {
        match self {
            Self::Validation(issues) => issues.iter().map(|i| i.code.as_str()).collect(),
            Self::BusinessRule { code, .. } => vec![*code],
            _ => Vec::new(),
        }
    }
}

fn join_issues(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Result type for reconciliation operations
pub type ReconResult<T> = Result<T, ReconError>;

/// Generate a fresh row identifier
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

//! Traits for storage abstraction and extensibility

use async_trait::async_trait;
use chrono::NaiveDate;

use crate::config::MatchingPreferences;
use crate::types::*;

/// Entry point to the transactional data store
///
/// Every write operation in this crate runs inside exactly one unit of work
/// obtained from [`ReconciliationStore::begin`]. Implementations decide the
/// isolation level; the engine only relies on all-or-nothing commits and on
/// the bundle idempotency key being unique per tenant.
#[async_trait]
pub trait ReconciliationStore: Send + Sync {
    type Tx: UnitOfWork;

    /// Open a new transaction
    async fn begin(&self) -> ReconResult<Self::Tx>;
}

/// Typed reads and writes available inside one transaction
///
/// Dropping a unit of work without calling [`UnitOfWork::commit`] discards
/// every write made through it.
#[async_trait]
pub trait UnitOfWork: Send + Sync {
    /// Get a deposit by ID
    async fn get_deposit(&self, tenant_id: &str, deposit_id: &str) -> ReconResult<Option<Deposit>>;

    async fn update_deposit(&mut self, deposit: &Deposit) -> ReconResult<()>;

    /// Get a deposit line item by ID
    async fn get_line(
        &self,
        tenant_id: &str,
        line_id: &str,
    ) -> ReconResult<Option<DepositLineItem>>;

    /// List every line of a deposit, ordered by line number
    async fn list_deposit_lines(
        &self,
        tenant_id: &str,
        deposit_id: &str,
    ) -> ReconResult<Vec<DepositLineItem>>;

    async fn update_line(&mut self, line: &DepositLineItem) -> ReconResult<()>;

    /// Get a revenue schedule by ID, including soft-deleted ones
    async fn get_schedule(
        &self,
        tenant_id: &str,
        schedule_id: &str,
    ) -> ReconResult<Option<RevenueSchedule>>;

    /// Live schedules sharing the vendor/distributor context of a deposit
    async fn list_schedules_for_context(
        &self,
        tenant_id: &str,
        vendor_account_id: Option<&str>,
        distributor_account_id: Option<&str>,
    ) -> ReconResult<Vec<RevenueSchedule>>;

    /// Live schedules of one opportunity product dated on or after `from`
    async fn list_opportunity_product_schedules(
        &self,
        tenant_id: &str,
        opportunity_product_id: &str,
        from: NaiveDate,
    ) -> ReconResult<Vec<RevenueSchedule>>;

    async fn insert_schedule(&mut self, schedule: &RevenueSchedule) -> ReconResult<()>;

    async fn update_schedule(&mut self, schedule: &RevenueSchedule) -> ReconResult<()>;

    /// Every match touching any of the given lines
    async fn list_matches_for_lines(
        &self,
        tenant_id: &str,
        line_ids: &[String],
    ) -> ReconResult<Vec<DepositLineMatch>>;

    /// Every match touching any of the given schedules
    async fn list_matches_for_schedules(
        &self,
        tenant_id: &str,
        schedule_ids: &[String],
    ) -> ReconResult<Vec<DepositLineMatch>>;

    async fn list_matches_for_group(
        &self,
        tenant_id: &str,
        match_group_id: &str,
    ) -> ReconResult<Vec<DepositLineMatch>>;

    async fn insert_match(&mut self, deposit_match: &DepositLineMatch) -> ReconResult<()>;

    async fn update_match(&mut self, deposit_match: &DepositLineMatch) -> ReconResult<()>;

    async fn delete_match(&mut self, tenant_id: &str, match_id: &str) -> ReconResult<()>;

    async fn get_match_group(
        &self,
        tenant_id: &str,
        match_group_id: &str,
    ) -> ReconResult<Option<MatchGroup>>;

    async fn insert_match_group(&mut self, group: &MatchGroup) -> ReconResult<()>;

    async fn update_match_group(&mut self, group: &MatchGroup) -> ReconResult<()>;

    async fn get_account(&self, tenant_id: &str, account_id: &str)
        -> ReconResult<Option<Account>>;

    async fn get_product(&self, tenant_id: &str, product_id: &str)
        -> ReconResult<Option<Product>>;

    /// The tenant's cached synthetic product of the given kind, if any
    async fn find_flex_product(
        &self,
        tenant_id: &str,
        kind: FlexProductKind,
    ) -> ReconResult<Option<Product>>;

    async fn insert_product(&mut self, product: &Product) -> ReconResult<()>;

    async fn get_opportunity_product(
        &self,
        tenant_id: &str,
        opportunity_product_id: &str,
    ) -> ReconResult<Option<OpportunityProduct>>;

    async fn insert_opportunity_product(
        &mut self,
        opportunity_product: &OpportunityProduct,
    ) -> ReconResult<()>;

    /// Live (not undone) bundle operation holding the idempotency key
    async fn find_bundle_operation_by_key(
        &self,
        tenant_id: &str,
        idempotency_key: &str,
    ) -> ReconResult<Option<BundleOperation>>;

    async fn get_bundle_operation(
        &self,
        tenant_id: &str,
        operation_id: &str,
    ) -> ReconResult<Option<BundleOperation>>;

    /// Insert a bundle operation; fails with `UniqueViolation` on a duplicate key
    async fn insert_bundle_operation(&mut self, operation: &BundleOperation) -> ReconResult<()>;

    async fn update_bundle_operation(&mut self, operation: &BundleOperation) -> ReconResult<()>;

    /// Append an audit record and return its ID
    async fn append_audit(&mut self, entry: &AuditEntry) -> ReconResult<String>;

    /// Make every write of this unit of work durable
    async fn commit(self) -> ReconResult<()>;
}

/// Resolves the matching preferences in force for a tenant and user
#[async_trait]
pub trait MatchingPreferencesProvider: Send + Sync {
    async fn matching_preferences(
        &self,
        tenant_id: &str,
        user_id: &str,
    ) -> ReconResult<MatchingPreferences>;
}

/// Provider returning one fixed set of preferences for everyone
#[derive(Debug, Clone, Default)]
pub struct StaticPreferences {
    preferences: MatchingPreferences,
}

impl StaticPreferences {
    pub fn new(preferences: MatchingPreferences) -> ReconResult<Self> {
        preferences.validate()?;
        Ok(Self { preferences })
    }
}

#[async_trait]
impl MatchingPreferencesProvider for StaticPreferences {
    async fn matching_preferences(
        &self,
        _tenant_id: &str,
        _user_id: &str,
    ) -> ReconResult<MatchingPreferences> {
        Ok(self.preferences.clone())
    }
}

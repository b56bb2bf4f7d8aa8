//! In-memory storage implementation for testing

use async_trait::async_trait;
use chrono::NaiveDate;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::traits::*;
use crate::types::*;

#[derive(Debug, Clone, Default)]
struct StoreState {
    version: u64,
    deposits: HashMap<String, Deposit>,
    lines: HashMap<String, DepositLineItem>,
    schedules: HashMap<String, RevenueSchedule>,
    matches: HashMap<String, DepositLineMatch>,
    match_groups: HashMap<String, MatchGroup>,
    accounts: HashMap<String, Account>,
    products: HashMap<String, Product>,
    opportunity_products: HashMap<String, OpportunityProduct>,
    bundle_operations: HashMap<String, BundleOperation>,
    audit_log: Vec<AuditEntry>,
}

impl StoreState {
    fn live_bundle_with_key(&self, tenant_id: &str, key: &str) -> Option<&BundleOperation> {
        self.bundle_operations.values().find(|op| {
            op.tenant_id == tenant_id && op.idempotency_key == key && op.undone_at.is_none()
        })
    }
}

/// In-memory storage implementation for testing and development
///
/// Transactions run against a private snapshot. Commit fails with
/// [`ReconError::UniqueViolation`] when another transaction already committed
/// a live bundle operation with the same idempotency key, and with
/// [`ReconError::Conflict`] when anything else was committed since the
/// snapshot was taken.
#[derive(Debug, Clone)]
pub struct MemoryStorage {
    state: Arc<RwLock<StoreState>>,
}

impl MemoryStorage {
    /// Create a new memory storage instance
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(StoreState::default())),
        }
    }

    /// Clear all data (useful for testing)
    pub fn clear(&self) {
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = StoreState::default();
    }

    fn seed<F: FnOnce(&mut StoreState)>(&self, f: F) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut state);
        state.version += 1;
    }

    fn read<T, F: FnOnce(&StoreState) -> T>(&self, f: F) -> T {
        f(&self.state.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn insert_deposit(&self, deposit: Deposit) {
        self.seed(|s| {
            s.deposits.insert(deposit.id.clone(), deposit);
        });
    }

    pub fn insert_line(&self, line: DepositLineItem) {
        self.seed(|s| {
            s.lines.insert(line.id.clone(), line);
        });
    }

    pub fn insert_schedule(&self, schedule: RevenueSchedule) {
        self.seed(|s| {
            s.schedules.insert(schedule.id.clone(), schedule);
        });
    }

    pub fn insert_match(&self, deposit_match: DepositLineMatch) {
        self.seed(|s| {
            s.matches.insert(deposit_match.id.clone(), deposit_match);
        });
    }

    pub fn insert_account(&self, account: Account) {
        self.seed(|s| {
            s.accounts.insert(account.id.clone(), account);
        });
    }

    pub fn insert_product(&self, product: Product) {
        self.seed(|s| {
            s.products.insert(product.id.clone(), product);
        });
    }

    pub fn insert_opportunity_product(&self, opportunity_product: OpportunityProduct) {
        self.seed(|s| {
            s.opportunity_products
                .insert(opportunity_product.id.clone(), opportunity_product);
        });
    }

    pub fn deposit(&self, deposit_id: &str) -> Option<Deposit> {
        self.read(|s| s.deposits.get(deposit_id).cloned())
    }

    pub fn line(&self, line_id: &str) -> Option<DepositLineItem> {
        self.read(|s| s.lines.get(line_id).cloned())
    }

    pub fn schedule(&self, schedule_id: &str) -> Option<RevenueSchedule> {
        self.read(|s| s.schedules.get(schedule_id).cloned())
    }

    pub fn schedules(&self) -> Vec<RevenueSchedule> {
        self.read(|s| {
            let mut schedules: Vec<_> = s.schedules.values().cloned().collect();
            schedules.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
            schedules
        })
    }

    pub fn matches_for_line(&self, line_id: &str) -> Vec<DepositLineMatch> {
        self.read(|s| {
            sorted_matches(
                s.matches
                    .values()
                    .filter(|m| m.deposit_line_item_id == line_id)
                    .cloned()
                    .collect(),
            )
        })
    }

    pub fn matches_for_schedule(&self, schedule_id: &str) -> Vec<DepositLineMatch> {
        self.read(|s| {
            sorted_matches(
                s.matches
                    .values()
                    .filter(|m| m.revenue_schedule_id == schedule_id)
                    .cloned()
                    .collect(),
            )
        })
    }

    pub fn products(&self) -> Vec<Product> {
        self.read(|s| s.products.values().cloned().collect())
    }

    pub fn opportunity_products(&self) -> Vec<OpportunityProduct> {
        self.read(|s| s.opportunity_products.values().cloned().collect())
    }

    pub fn match_group(&self, match_group_id: &str) -> Option<MatchGroup> {
        self.read(|s| s.match_groups.get(match_group_id).cloned())
    }

    pub fn bundle_operations(&self) -> Vec<BundleOperation> {
        self.read(|s| s.bundle_operations.values().cloned().collect())
    }

    pub fn audit_log(&self) -> Vec<AuditEntry> {
        self.read(|s| s.audit_log.clone())
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ReconciliationStore for MemoryStorage {
    type Tx = MemoryTransaction;

    async fn begin(&self) -> ReconResult<MemoryTransaction> {
        let snapshot = self.read(|s| s.clone());
        Ok(MemoryTransaction {
            shared: Arc::clone(&self.state),
            base_version: snapshot.version,
            working: snapshot,
        })
    }
}

/// Snapshot transaction over [`MemoryStorage`]
#[derive(Debug)]
pub struct MemoryTransaction {
    shared: Arc<RwLock<StoreState>>,
    base_version: u64,
    working: StoreState,
}

fn sorted_matches(mut matches: Vec<DepositLineMatch>) -> Vec<DepositLineMatch> {
    matches.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
    matches
}

fn owned<T: Clone>(row: Option<&T>, tenant_of: impl Fn(&T) -> &str, tenant_id: &str) -> Option<T> {
    row.filter(|r| tenant_of(r) == tenant_id).cloned()
}

fn replace<T>(
    map: &mut HashMap<String, T>,
    id: &str,
    row: &T,
    missing: impl FnOnce(String) -> ReconError,
) -> ReconResult<()>
where
    T: Clone,
{
    match map.get_mut(id) {
        Some(existing) => {
            *existing = row.clone();
            Ok(())
        }
        None => Err(missing(id.to_string())),
    }
}

#[async_trait]
impl UnitOfWork for MemoryTransaction {
    async fn get_deposit(&self, tenant_id: &str, deposit_id: &str) -> ReconResult<Option<Deposit>> {
        Ok(owned(
            self.working.deposits.get(deposit_id),
            |d| d.tenant_id.as_str(),
            tenant_id,
        ))
    }

    async fn update_deposit(&mut self, deposit: &Deposit) -> ReconResult<()> {
        replace(
            &mut self.working.deposits,
            &deposit.id,
            deposit,
            ReconError::DepositNotFound,
        )
    }

    async fn get_line(
        &self,
        tenant_id: &str,
        line_id: &str,
    ) -> ReconResult<Option<DepositLineItem>> {
        Ok(owned(
            self.working.lines.get(line_id),
            |l| l.tenant_id.as_str(),
            tenant_id,
        ))
    }

    async fn list_deposit_lines(
        &self,
        tenant_id: &str,
        deposit_id: &str,
    ) -> ReconResult<Vec<DepositLineItem>> {
        let mut lines: Vec<DepositLineItem> = self
            .working
            .lines
            .values()
            .filter(|l| l.tenant_id == tenant_id && l.deposit_id == deposit_id)
            .cloned()
            .collect();
        lines.sort_by(|a, b| (a.line_number, a.created_at).cmp(&(b.line_number, b.created_at)));
        Ok(lines)
    }

    async fn update_line(&mut self, line: &DepositLineItem) -> ReconResult<()> {
        replace(
            &mut self.working.lines,
            &line.id,
            line,
            ReconError::LineNotFound,
        )
    }

    async fn get_schedule(
        &self,
        tenant_id: &str,
        schedule_id: &str,
    ) -> ReconResult<Option<RevenueSchedule>> {
        Ok(owned(
            self.working.schedules.get(schedule_id),
            |s| s.tenant_id.as_str(),
            tenant_id,
        ))
    }

    async fn list_schedules_for_context(
        &self,
        tenant_id: &str,
        vendor_account_id: Option<&str>,
        distributor_account_id: Option<&str>,
    ) -> ReconResult<Vec<RevenueSchedule>> {
        let mut schedules: Vec<RevenueSchedule> = self
            .working
            .schedules
            .values()
            .filter(|s| {
                s.tenant_id == tenant_id
                    && !s.is_deleted()
                    && vendor_account_id
                        .is_none_or(|v| s.vendor_account_id.as_deref() == Some(v))
                    && distributor_account_id
                        .is_none_or(|d| s.distributor_account_id.as_deref() == Some(d))
            })
            .cloned()
            .collect();
        schedules.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        Ok(schedules)
    }

    async fn list_opportunity_product_schedules(
        &self,
        tenant_id: &str,
        opportunity_product_id: &str,
        from: NaiveDate,
    ) -> ReconResult<Vec<RevenueSchedule>> {
        let mut schedules: Vec<RevenueSchedule> = self
            .working
            .schedules
            .values()
            .filter(|s| {
                s.tenant_id == tenant_id
                    && !s.is_deleted()
                    && s.opportunity_product_id.as_deref() == Some(opportunity_product_id)
                    && s.schedule_date.is_some_and(|d| d >= from)
            })
            .cloned()
            .collect();
        schedules.sort_by(|a, b| {
            (a.schedule_date, a.created_at, &a.id).cmp(&(b.schedule_date, b.created_at, &b.id))
        });
        Ok(schedules)
    }

    async fn insert_schedule(&mut self, schedule: &RevenueSchedule) -> ReconResult<()> {
        if self.working.schedules.contains_key(&schedule.id) {
            return Err(ReconError::UniqueViolation(format!(
                "revenue schedule {} already exists",
                schedule.id
            )));
        }
        self.working
            .schedules
            .insert(schedule.id.clone(), schedule.clone());
        Ok(())
    }

    async fn update_schedule(&mut self, schedule: &RevenueSchedule) -> ReconResult<()> {
        replace(
            &mut self.working.schedules,
            &schedule.id,
            schedule,
            ReconError::ScheduleNotFound,
        )
    }

    async fn list_matches_for_lines(
        &self,
        tenant_id: &str,
        line_ids: &[String],
    ) -> ReconResult<Vec<DepositLineMatch>> {
        Ok(sorted_matches(
            self.working
                .matches
                .values()
                .filter(|m| m.tenant_id == tenant_id && line_ids.contains(&m.deposit_line_item_id))
                .cloned()
                .collect(),
        ))
    }

    async fn list_matches_for_schedules(
        &self,
        tenant_id: &str,
        schedule_ids: &[String],
    ) -> ReconResult<Vec<DepositLineMatch>> {
        Ok(sorted_matches(
            self.working
                .matches
                .values()
                .filter(|m| {
                    m.tenant_id == tenant_id && schedule_ids.contains(&m.revenue_schedule_id)
                })
                .cloned()
                .collect(),
        ))
    }

    async fn list_matches_for_group(
        &self,
        tenant_id: &str,
        match_group_id: &str,
    ) -> ReconResult<Vec<DepositLineMatch>> {
        Ok(sorted_matches(
            self.working
                .matches
                .values()
                .filter(|m| {
                    m.tenant_id == tenant_id && m.match_group_id.as_deref() == Some(match_group_id)
                })
                .cloned()
                .collect(),
        ))
    }

    async fn insert_match(&mut self, deposit_match: &DepositLineMatch) -> ReconResult<()> {
        let duplicate_pair = self.working.matches.values().any(|m| {
            m.deposit_line_item_id == deposit_match.deposit_line_item_id
                && m.revenue_schedule_id == deposit_match.revenue_schedule_id
        });
        if duplicate_pair || self.working.matches.contains_key(&deposit_match.id) {
            return Err(ReconError::UniqueViolation(format!(
                "match between line {} and schedule {} already exists",
                deposit_match.deposit_line_item_id, deposit_match.revenue_schedule_id
            )));
        }
        self.working
            .matches
            .insert(deposit_match.id.clone(), deposit_match.clone());
        Ok(())
    }

    async fn update_match(&mut self, deposit_match: &DepositLineMatch) -> ReconResult<()> {
        replace(
            &mut self.working.matches,
            &deposit_match.id,
            deposit_match,
            ReconError::MatchNotFound,
        )
    }

    async fn delete_match(&mut self, tenant_id: &str, match_id: &str) -> ReconResult<()> {
        match self.working.matches.get(match_id) {
            Some(m) if m.tenant_id == tenant_id => {
                self.working.matches.remove(match_id);
                Ok(())
            }
            _ => Err(ReconError::MatchNotFound(match_id.to_string())),
        }
    }

    async fn get_match_group(
        &self,
        tenant_id: &str,
        match_group_id: &str,
    ) -> ReconResult<Option<MatchGroup>> {
        Ok(owned(
            self.working.match_groups.get(match_group_id),
            |g| g.tenant_id.as_str(),
            tenant_id,
        ))
    }

    async fn insert_match_group(&mut self, group: &MatchGroup) -> ReconResult<()> {
        self.working
            .match_groups
            .insert(group.id.clone(), group.clone());
        Ok(())
    }

    async fn update_match_group(&mut self, group: &MatchGroup) -> ReconResult<()> {
        replace(
            &mut self.working.match_groups,
            &group.id,
            group,
            ReconError::MatchGroupNotFound,
        )
    }

    async fn get_account(
        &self,
        tenant_id: &str,
        account_id: &str,
    ) -> ReconResult<Option<Account>> {
        Ok(owned(
            self.working.accounts.get(account_id),
            |a| a.tenant_id.as_str(),
            tenant_id,
        ))
    }

    async fn get_product(
        &self,
        tenant_id: &str,
        product_id: &str,
    ) -> ReconResult<Option<Product>> {
        Ok(owned(
            self.working.products.get(product_id),
            |p| p.tenant_id.as_str(),
            tenant_id,
        ))
    }

    async fn find_flex_product(
        &self,
        tenant_id: &str,
        kind: FlexProductKind,
    ) -> ReconResult<Option<Product>> {
        Ok(self
            .working
            .products
            .values()
            .filter(|p| p.tenant_id == tenant_id && p.flex_kind == Some(kind))
            .min_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)))
            .cloned())
    }

    async fn insert_product(&mut self, product: &Product) -> ReconResult<()> {
        self.working
            .products
            .insert(product.id.clone(), product.clone());
        Ok(())
    }

    async fn get_opportunity_product(
        &self,
        tenant_id: &str,
        opportunity_product_id: &str,
    ) -> ReconResult<Option<OpportunityProduct>> {
        Ok(owned(
            self.working.opportunity_products.get(opportunity_product_id),
            |op| op.tenant_id.as_str(),
            tenant_id,
        ))
    }

    async fn insert_opportunity_product(
        &mut self,
        opportunity_product: &OpportunityProduct,
    ) -> ReconResult<()> {
        self.working
            .opportunity_products
            .insert(opportunity_product.id.clone(), opportunity_product.clone());
        Ok(())
    }

    async fn find_bundle_operation_by_key(
        &self,
        tenant_id: &str,
        idempotency_key: &str,
    ) -> ReconResult<Option<BundleOperation>> {
        Ok(self
            .working
            .live_bundle_with_key(tenant_id, idempotency_key)
            .cloned())
    }

    async fn get_bundle_operation(
        &self,
        tenant_id: &str,
        operation_id: &str,
    ) -> ReconResult<Option<BundleOperation>> {
        Ok(owned(
            self.working.bundle_operations.get(operation_id),
            |op| op.tenant_id.as_str(),
            tenant_id,
        ))
    }

    async fn insert_bundle_operation(&mut self, operation: &BundleOperation) -> ReconResult<()> {
        if self
            .working
            .live_bundle_with_key(&operation.tenant_id, &operation.idempotency_key)
            .is_some()
        {
            return Err(ReconError::UniqueViolation(format!(
                "bundle operation key {} already exists",
                operation.idempotency_key
            )));
        }
        self.working
            .bundle_operations
            .insert(operation.id.clone(), operation.clone());
        Ok(())
    }

    async fn update_bundle_operation(&mut self, operation: &BundleOperation) -> ReconResult<()> {
        replace(
            &mut self.working.bundle_operations,
            &operation.id,
            operation,
            ReconError::BundleOperationNotFound,
        )
    }

    async fn append_audit(&mut self, entry: &AuditEntry) -> ReconResult<String> {
        self.working.audit_log.push(entry.clone());
        Ok(entry.id.clone())
    }

    async fn commit(self) -> ReconResult<()> {
        let mut shared = self.shared.write().unwrap_or_else(PoisonError::into_inner);

        for operation in self.working.bundle_operations.values() {
            if shared.bundle_operations.contains_key(&operation.id) || operation.undone_at.is_some()
            {
                continue;
            }
            if shared
                .live_bundle_with_key(&operation.tenant_id, &operation.idempotency_key)
                .is_some()
            {
                return Err(ReconError::UniqueViolation(format!(
                    "bundle operation key {} already exists",
                    operation.idempotency_key
                )));
            }
        }

        if shared.version != self.base_version {
            return Err(ReconError::Conflict(
                "store changed since the transaction began".to_string(),
            ));
        }

        let mut working = self.working;
        working.version = self.base_version + 1;
        *shared = working;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bigdecimal::BigDecimal;

    fn line(id: &str) -> DepositLineItem {
        DepositLineItem::new(
            id.to_string(),
            "t1".to_string(),
            "d1".to_string(),
            1,
            BigDecimal::from(100),
            BigDecimal::from(10),
        )
    }

    #[tokio::test]
    async fn test_uncommitted_writes_are_discarded() {
        let storage = MemoryStorage::new();
        storage.insert_line(line("l1"));

        let mut tx = storage.begin().await.unwrap();
        let mut updated = tx.get_line("t1", "l1").await.unwrap().unwrap();
        updated.reconciled = true;
        tx.update_line(&updated).await.unwrap();
        drop(tx);

        assert!(!storage.line("l1").unwrap().reconciled);
    }

    #[tokio::test]
    async fn test_commit_publishes_writes() {
        let storage = MemoryStorage::new();
        storage.insert_line(line("l1"));

        let mut tx = storage.begin().await.unwrap();
        let mut updated = tx.get_line("t1", "l1").await.unwrap().unwrap();
        updated.reconciled = true;
        tx.update_line(&updated).await.unwrap();
        tx.commit().await.unwrap();

        assert!(storage.line("l1").unwrap().reconciled);
    }

    #[tokio::test]
    async fn test_tenant_isolation() {
        let storage = MemoryStorage::new();
        storage.insert_line(line("l1"));

        let tx = storage.begin().await.unwrap();
        assert!(tx.get_line("t2", "l1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stale_snapshot_conflicts() {
        let storage = MemoryStorage::new();
        storage.insert_line(line("l1"));

        let first = storage.begin().await.unwrap();
        let second = storage.begin().await.unwrap();
        first.commit().await.unwrap();

        assert!(matches!(
            second.commit().await,
            Err(ReconError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_duplicate_match_pair_is_rejected() {
        let storage = MemoryStorage::new();
        let mut tx = storage.begin().await.unwrap();
        let first = DepositLineMatch::applied(
            "t1".to_string(),
            "l1".to_string(),
            "s1".to_string(),
            BigDecimal::from(1),
            BigDecimal::from(0),
            MatchSource::Manual,
        );
        let second = DepositLineMatch::applied(
            "t1".to_string(),
            "l1".to_string(),
            "s1".to_string(),
            BigDecimal::from(2),
            BigDecimal::from(0),
            MatchSource::Manual,
        );
        tx.insert_match(&first).await.unwrap();
        assert!(matches!(
            tx.insert_match(&second).await,
            Err(ReconError::UniqueViolation(_))
        ));
    }
}

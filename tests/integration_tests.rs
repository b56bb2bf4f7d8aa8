//! Integration tests for commission-recon-core

use std::str::FromStr;

use bigdecimal::BigDecimal;
use chrono::NaiveDate;
use commission_recon_core::{
    bundle, rule_codes, Account, Allocation, BundleMode, BundleRequest, CandidateOptions,
    Deposit, DepositLineItem, DepositLineItemStatus, DepositLineMatch, DepositStatus,
    FlexClassification, FlexProductKind, FlexSplitRequest, IssueCode, MatchGroupRequest,
    MatchGroupStatus, MatchLevel, MatchSource, MatchType, MatchingPreferences, MemoryStorage,
    OperationContext, Product, ReconError, ReconciliationEngine, ReconciliationStore,
    RevenueSchedule, RevenueScheduleStatus, StaticPreferences, UnitOfWork,
};

const TENANT: &str = "tenant-1";
const DEPOSIT: &str = "dep-1";

fn ctx() -> OperationContext {
    OperationContext::new(TENANT, "user-1")
}

fn dec(s: &str) -> BigDecimal {
    BigDecimal::from_str(s).unwrap()
}

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

fn engine(
    store: &MemoryStorage,
    tolerance: &str,
) -> ReconciliationEngine<MemoryStorage, StaticPreferences> {
    let preferences = MatchingPreferences {
        variance_tolerance: dec(tolerance),
        ..MatchingPreferences::default()
    };
    ReconciliationEngine::new(store.clone(), StaticPreferences::new(preferences).unwrap())
}

fn seeded_store() -> MemoryStorage {
    let store = MemoryStorage::new();
    let mut deposit = Deposit::new(DEPOSIT.to_string(), TENANT.to_string(), date(2024, 1, 31));
    deposit.vendor_account_id = Some("vendor-1".to_string());
    deposit.distributor_account_id = Some("dist-1".to_string());
    store.insert_deposit(deposit);
    store
}

fn line(id: &str, number: u32, usage: &str, commission: &str) -> DepositLineItem {
    let mut line = DepositLineItem::new(
        id.to_string(),
        TENANT.to_string(),
        DEPOSIT.to_string(),
        number,
        dec(usage),
        dec(commission),
    );
    line.payment_date = Some(date(2024, 1, 15));
    line.vendor_account_id = Some("vendor-1".to_string());
    line.distributor_account_id = Some("dist-1".to_string());
    line
}

fn schedule(id: &str, on: NaiveDate, usage: &str, commission: &str) -> RevenueSchedule {
    let mut schedule = RevenueSchedule::new(
        id.to_string(),
        TENANT.to_string(),
        Some(on),
        dec(usage),
        dec(commission),
    );
    schedule.vendor_account_id = Some("vendor-1".to_string());
    schedule.distributor_account_id = Some("dist-1".to_string());
    schedule
}

fn opportunity_schedule(id: &str, on: NaiveDate) -> RevenueSchedule {
    let mut schedule = schedule(id, on, "100", "10");
    schedule.opportunity_id = Some("opp-1".to_string());
    schedule.opportunity_product_id = Some("op-1".to_string());
    schedule
}

fn rule_code(error: &ReconError) -> Option<&'static str> {
    match error {
        ReconError::BusinessRule { code, .. } => Some(*code),
        _ => None,
    }
}

#[tokio::test]
async fn test_one_to_one_exact_match_reconciles() {
    let store = seeded_store();
    store.insert_line(line("l1", 1, "100", "10"));
    store.insert_schedule(schedule("s1", date(2024, 1, 1), "100", "10"));
    let engine = engine(&store, "0");

    let result = engine
        .apply_match_group(
            &ctx(),
            &MatchGroupRequest::one_to_one("l1", "s1"),
            MatchSource::Manual,
        )
        .await
        .unwrap();

    assert!(result.match_group_id.is_none());
    assert_eq!(result.created_match_ids.len(), 1);

    let s1 = store.schedule("s1").unwrap();
    assert_eq!(s1.status, RevenueScheduleStatus::Reconciled);
    assert_eq!(s1.usage_balance(), BigDecimal::from(0));
    assert_eq!(s1.actual_usage, dec("100"));

    let l1 = store.line("l1").unwrap();
    assert_eq!(l1.status, DepositLineItemStatus::Matched);
    assert_eq!(l1.usage_unallocated, BigDecimal::from(0));
    assert_eq!(l1.primary_revenue_schedule_id.as_deref(), Some("s1"));

    let deposit = store.deposit(DEPOSIT).unwrap();
    assert_eq!(deposit.status, DepositStatus::Completed);
    assert_eq!(deposit.items_matched, 1);

    let audit = store.audit_log();
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].action.as_str(), "deposit_match.group_applied");
    assert_eq!(audit[0].user_id, "user-1");
}

#[tokio::test]
async fn test_negative_line_goes_through_chargeback_only() {
    let store = seeded_store();
    store.insert_line(line("l1", 1, "-50", "-5"));
    store.insert_schedule(schedule("s1", date(2024, 1, 1), "100", "10"));
    let engine = engine(&store, "0");

    let preview = engine
        .preview_match_group(&ctx(), &MatchGroupRequest::one_to_one("l1", "s1"))
        .await
        .unwrap();
    assert!(!preview.ok);
    assert!(preview
        .issues
        .iter()
        .any(|issue| issue.code == IssueCode::LineNegative));

    let rejected = engine
        .apply_match_group(
            &ctx(),
            &MatchGroupRequest::one_to_one("l1", "s1"),
            MatchSource::Manual,
        )
        .await;
    assert!(matches!(rejected, Err(ReconError::Validation(_))));
    assert!(store.matches_for_line("l1").is_empty());

    let chargeback = engine.create_chargeback(&ctx(), "l1").await.unwrap();
    let flex = store.schedule(&chargeback.chargeback_schedule_id).unwrap();
    assert_eq!(flex.flex_classification, FlexClassification::FlexChargeback);
    assert_eq!(flex.expected_usage, dec("-50"));
    assert_eq!(flex.status, RevenueScheduleStatus::Reconciled);
    assert_eq!(
        store.line("l1").unwrap().status,
        DepositLineItemStatus::Matched
    );

    // Chargebacks are ordinary applied matches and unmatch like any other
    let unmatched = engine.unmatch_line(&ctx(), "l1").await.unwrap();
    assert_eq!(unmatched.removed_match_ids, vec![chargeback.match_id.clone()]);
    assert_eq!(
        store.line("l1").unwrap().status,
        DepositLineItemStatus::Unmatched
    );
    assert_eq!(
        store.schedule(&chargeback.chargeback_schedule_id).unwrap().status,
        RevenueScheduleStatus::Unreconciled
    );
}

#[tokio::test]
async fn test_chargeback_requires_negative_line() {
    let store = seeded_store();
    store.insert_line(line("l1", 1, "50", "5"));
    let engine = engine(&store, "0");

    let error = engine.create_chargeback(&ctx(), "l1").await.unwrap_err();
    assert_eq!(
        rule_code(&error),
        Some(rule_codes::CHARGEBACK_REQUIRES_NEGATIVE_LINE)
    );
    assert!(error.is_client_error());
    assert!(store.products().is_empty());
}

#[tokio::test]
async fn test_bundle_without_opportunity_product_is_unsupported() {
    let store = seeded_store();
    store.insert_line(line("l1", 1, "90", "9"));
    store.insert_line(line("l2", 2, "30", "3"));
    store.insert_schedule(schedule("s-base", date(2024, 1, 1), "100", "10"));
    let engine = engine(&store, "0");

    let request = BundleRequest::new(
        DEPOSIT,
        "s-base",
        vec!["l1".to_string(), "l2".to_string()],
        BundleMode::KeepOld,
    );
    let error = engine.bundle_rip_replace(&ctx(), &request).await.unwrap_err();

    assert!(matches!(error, ReconError::Unsupported(_)));
    assert!(error.is_client_error());
    assert!(store.products().is_empty());
    assert!(store.opportunity_products().is_empty());
    assert!(store.bundle_operations().is_empty());
    assert_eq!(store.schedules().len(), 1);
    assert!(store.audit_log().is_empty());
}

#[tokio::test]
async fn test_bundle_resubmission_returns_recorded_result() {
    let store = seeded_store();
    store.insert_line(line("l1", 1, "90", "9"));
    store.insert_line(line("l2", 2, "30", "3"));
    store.insert_schedule(opportunity_schedule("s-jan", date(2024, 1, 1)));
    store.insert_schedule(opportunity_schedule("s-feb", date(2024, 2, 1)));
    store.insert_schedule(opportunity_schedule("s-mar", date(2024, 3, 1)));
    let engine = engine(&store, "0");

    let request = BundleRequest::new(
        DEPOSIT,
        "s-jan",
        vec!["l1".to_string(), "l2".to_string()],
        BundleMode::KeepOld,
    );
    let first = engine.bundle_rip_replace(&ctx(), &request).await.unwrap();

    let reordered = BundleRequest::new(
        DEPOSIT,
        "s-jan",
        vec!["l2".to_string(), "l1".to_string()],
        BundleMode::KeepOld,
    );
    let second = engine.bundle_rip_replace(&ctx(), &reordered).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(
        serde_json::to_value(&first).unwrap(),
        serde_json::to_value(&second).unwrap()
    );
    assert_eq!(store.bundle_operations().len(), 1);
    assert_eq!(store.audit_log().len(), 1);

    assert_eq!(first.created_product_ids.len(), 2);
    assert_eq!(first.created_opportunity_product_ids.len(), 2);
    assert_eq!(first.created_schedule_ids.len(), 6);
    assert!(first.replaced_schedule_ids.is_empty());
    assert_eq!(store.schedules().len(), 9);

    let l1_schedule = store.schedule(&first.line_to_schedule["l1"]).unwrap();
    assert_eq!(l1_schedule.schedule_date, Some(date(2024, 1, 1)));
    assert_eq!(l1_schedule.expected_usage, dec("30"));
    assert_eq!(l1_schedule.actual_usage, dec("90"));

    let l1 = store.line("l1").unwrap();
    assert_eq!(l1.status, DepositLineItemStatus::Matched);
    assert_eq!(&l1.usage_allocated + &l1.usage_unallocated, l1.usage);
    assert!(store
        .products()
        .iter()
        .all(|product| product.is_bundle_generated));
}

#[tokio::test]
async fn test_bundle_race_loser_gets_committed_result() {
    let store = seeded_store();
    store.insert_line(line("l1", 1, "90", "9"));
    store.insert_line(line("l2", 2, "30", "3"));
    store.insert_schedule(opportunity_schedule("s-jan", date(2024, 1, 1)));
    let engine = engine(&store, "0");
    let request = BundleRequest::new(
        DEPOSIT,
        "s-jan",
        vec!["l1".to_string(), "l2".to_string()],
        BundleMode::KeepOld,
    );
    let tolerance = BigDecimal::from(0);

    let mut winner = store.begin().await.unwrap();
    let mut loser = store.begin().await.unwrap();
    let committed = bundle::bundle_rip_replace(&mut winner, &ctx(), &request, &tolerance)
        .await
        .unwrap();
    let discarded = bundle::bundle_rip_replace(&mut loser, &ctx(), &request, &tolerance)
        .await
        .unwrap();
    assert_ne!(committed.operation_id, discarded.operation_id);

    winner.commit().await.unwrap();
    assert!(matches!(
        loser.commit().await,
        Err(ReconError::UniqueViolation(_))
    ));

    let replay = engine.bundle_rip_replace(&ctx(), &request).await.unwrap();
    assert_eq!(replay, committed);
    assert_eq!(store.bundle_operations().len(), 1);
    assert_eq!(store.matches_for_line("l1").len(), 1);
}

#[tokio::test]
async fn test_soft_delete_old_and_undo() {
    let store = seeded_store();
    store.insert_line(line("l1", 1, "60", "6"));
    store.insert_line(line("l2", 2, "40", "4"));
    store.insert_schedule(opportunity_schedule("s-jan", date(2024, 1, 1)));
    store.insert_schedule(opportunity_schedule("s-feb", date(2024, 2, 1)));
    let engine = engine(&store, "0");
    let request = BundleRequest::new(
        DEPOSIT,
        "s-jan",
        vec!["l1".to_string(), "l2".to_string()],
        BundleMode::SoftDeleteOld,
    );

    let bundled = engine.bundle_rip_replace(&ctx(), &request).await.unwrap();
    assert_eq!(bundled.replaced_schedule_ids.len(), 2);
    assert!(store.schedule("s-jan").unwrap().deleted_at.is_some());
    assert!(store.schedule("s-feb").unwrap().deleted_at.is_some());

    let undone = engine
        .undo_bundle(&ctx(), &bundled.operation_id)
        .await
        .unwrap();
    assert_eq!(undone.removed_match_ids.len(), 2);
    assert_eq!(undone.restored_schedule_ids.len(), 2);
    assert!(store.schedule("s-jan").unwrap().deleted_at.is_none());
    for schedule_id in &bundled.created_schedule_ids {
        assert!(store.schedule(schedule_id).unwrap().deleted_at.is_some());
    }
    assert_eq!(
        store.line("l1").unwrap().status,
        DepositLineItemStatus::Unmatched
    );

    let again = engine
        .undo_bundle(&ctx(), &bundled.operation_id)
        .await
        .unwrap_err();
    assert_eq!(rule_code(&again), Some(rule_codes::BUNDLE_ALREADY_UNDONE));

    // The undone run no longer holds the key
    let rerun = engine.bundle_rip_replace(&ctx(), &request).await.unwrap();
    assert_ne!(rerun.operation_id, bundled.operation_id);
    assert_eq!(store.bundle_operations().len(), 2);
}

#[tokio::test]
async fn test_soft_delete_old_refuses_schedules_carrying_money() {
    let store = seeded_store();
    store.insert_line(line("l1", 1, "60", "6"));
    store.insert_line(line("l2", 2, "40", "4"));
    store.insert_line(line("l3", 3, "10", "1"));
    store.insert_schedule(opportunity_schedule("s-jan", date(2024, 1, 1)));
    store.insert_schedule(opportunity_schedule("s-feb", date(2024, 2, 1)));
    store.insert_match(DepositLineMatch::applied(
        TENANT.to_string(),
        "l3".to_string(),
        "s-feb".to_string(),
        dec("10"),
        dec("1"),
        MatchSource::Manual,
    ));
    let engine = engine(&store, "0");

    let request = BundleRequest::new(
        DEPOSIT,
        "s-jan",
        vec!["l1".to_string(), "l2".to_string()],
        BundleMode::SoftDeleteOld,
    );
    let error = engine.bundle_rip_replace(&ctx(), &request).await.unwrap_err();

    assert_eq!(rule_code(&error), Some(rule_codes::BUNDLE_REPLACE_INELIGIBLE));
    assert!(store.schedule("s-jan").unwrap().deleted_at.is_none());
    assert!(store.products().is_empty());
    assert!(store.bundle_operations().is_empty());
}

#[tokio::test]
async fn test_bundle_rejects_single_line_and_matched_lines() {
    let store = seeded_store();
    store.insert_line(line("l1", 1, "60", "6"));
    store.insert_line(line("l2", 2, "40", "4"));
    store.insert_schedule(opportunity_schedule("s-jan", date(2024, 1, 1)));
    store.insert_schedule(schedule("s-other", date(2024, 1, 1), "40", "4"));
    let engine = engine(&store, "0");

    let single = BundleRequest::new(DEPOSIT, "s-jan", vec!["l1".to_string()], BundleMode::KeepOld);
    let error = engine.bundle_rip_replace(&ctx(), &single).await.unwrap_err();
    assert_eq!(error.codes(), vec!["bundle_too_few_lines"]);

    engine
        .apply_match_group(
            &ctx(),
            &MatchGroupRequest::one_to_one("l2", "s-other"),
            MatchSource::Manual,
        )
        .await
        .unwrap();
    let request = BundleRequest::new(
        DEPOSIT,
        "s-jan",
        vec!["l1".to_string(), "l2".to_string()],
        BundleMode::KeepOld,
    );
    let error = engine.bundle_rip_replace(&ctx(), &request).await.unwrap_err();
    assert_eq!(error.codes(), vec!["line_has_applied_matches"]);
}

#[tokio::test]
async fn test_one_to_many_default_allocation_conserves_money() {
    let store = seeded_store();
    store.insert_line(line("l1", 1, "100", "7"));
    store.insert_schedule(schedule("s1", date(2024, 1, 1), "33", "1"));
    store.insert_schedule(schedule("s2", date(2024, 1, 2), "33", "1"));
    store.insert_schedule(schedule("s3", date(2024, 1, 3), "33", "1"));
    let engine = engine(&store, "0");
    let request = MatchGroupRequest::new(
        MatchType::OneToMany,
        vec!["l1".to_string()],
        vec!["s1".to_string(), "s2".to_string(), "s3".to_string()],
    );

    let preview = engine.preview_match_group(&ctx(), &request).await.unwrap();
    assert!(preview.ok);
    let usage: BigDecimal = preview.allocations.iter().map(|a| &a.usage_amount).sum();
    let commission: BigDecimal = preview
        .allocations
        .iter()
        .map(|a| &a.commission_amount)
        .sum();
    assert_eq!(usage, dec("100"));
    assert_eq!(commission, dec("7"));

    // Overpaying each schedule is a warning, not a blocker
    assert_eq!(preview.warnings.len(), 3);
    assert!(preview
        .warnings
        .iter()
        .all(|w| w.code == IssueCode::ScheduleOverpaid));

    let result = engine
        .apply_match_group(&ctx(), &request, MatchSource::Manual)
        .await
        .unwrap();
    let group_id = result.match_group_id.unwrap();
    let group = store.match_group(&group_id).unwrap();
    assert_eq!(group.status, MatchGroupStatus::Applied);
    assert_eq!(group.match_type, MatchType::OneToMany);

    let l1 = store.line("l1").unwrap();
    assert_eq!(l1.status, DepositLineItemStatus::Matched);
    assert_eq!(&l1.usage_allocated + &l1.usage_unallocated, l1.usage);
    assert_eq!(
        &l1.commission_allocated + &l1.commission_unallocated,
        l1.commission
    );
    assert_eq!(
        store.schedule("s1").unwrap().status,
        RevenueScheduleStatus::InDispute
    );
}

#[tokio::test]
async fn test_preview_projection_matches_committed_state() {
    let store = seeded_store();
    store.insert_line(line("l1", 1, "100.10", "10.01"));
    store.insert_schedule(schedule("s1", date(2024, 1, 1), "70", "7"));
    store.insert_schedule(schedule("s2", date(2024, 1, 2), "20", "2"));
    store.insert_schedule(schedule("s3", date(2024, 1, 3), "7.5", "0.75"));
    let engine = engine(&store, "0.05");
    let request = MatchGroupRequest::new(
        MatchType::OneToMany,
        vec!["l1".to_string()],
        vec!["s1".to_string(), "s2".to_string(), "s3".to_string()],
    );

    let preview = engine.preview_match_group(&ctx(), &request).await.unwrap();
    assert!(preview.ok);
    engine
        .apply_match_group(&ctx(), &request, MatchSource::Auto)
        .await
        .unwrap();

    for projected in &preview.schedules {
        let stored = store.schedule(&projected.schedule_id).unwrap();
        assert_eq!(projected.actual_usage_net_after, stored.actual_usage_net());
        assert_eq!(
            projected.actual_commission_net_after,
            stored.actual_commission_net()
        );
        assert_eq!(projected.status_after, stored.status);
    }
    let projected = &preview.lines[0];
    let stored = store.line("l1").unwrap();
    assert_eq!(projected.usage_unallocated_after, stored.usage_unallocated);
    assert_eq!(
        projected.commission_unallocated_after,
        stored.commission_unallocated
    );
    assert_eq!(projected.status_after, stored.status);
    assert!(store
        .matches_for_line("l1")
        .iter()
        .all(|m| m.source == MatchSource::Auto));
}

#[tokio::test]
async fn test_many_to_many_is_rejected() {
    let store = seeded_store();
    store.insert_line(line("l1", 1, "100", "10"));
    store.insert_line(line("l2", 2, "50", "5"));
    store.insert_schedule(schedule("s1", date(2024, 1, 1), "80", "8"));
    store.insert_schedule(schedule("s2", date(2024, 2, 1), "70", "7"));
    let engine = engine(&store, "0");
    let request = MatchGroupRequest::new(
        MatchType::ManyToMany,
        vec!["l1".to_string(), "l2".to_string()],
        vec!["s1".to_string(), "s2".to_string()],
    );

    let preview = engine.preview_match_group(&ctx(), &request).await.unwrap();
    assert!(!preview.ok);
    assert_eq!(preview.issues[0].code, IssueCode::UnsupportedMatchType);

    let result = engine
        .apply_match_group(&ctx(), &request, MatchSource::Manual)
        .await;
    assert!(matches!(result, Err(ReconError::Validation(_))));
    assert!(store.audit_log().is_empty());
}

#[tokio::test]
async fn test_over_allocation_and_locks_are_itemized() {
    let store = seeded_store();
    store.insert_line(line("l1", 1, "100", "10"));
    let mut locked = line("l2", 2, "100", "10");
    locked.reconciled = true;
    store.insert_line(locked);
    store.insert_schedule(schedule("s1", date(2024, 1, 1), "100", "10"));
    let engine = engine(&store, "0");

    let over = MatchGroupRequest::one_to_one("l1", "s1").with_allocations(vec![Allocation::new(
        "l1",
        "s1",
        dec("120"),
        dec("10"),
    )]);
    let preview = engine.preview_match_group(&ctx(), &over).await.unwrap();
    assert!(!preview.ok);
    assert_eq!(preview.issues[0].code, IssueCode::LineOverAllocatedUsage);

    let preview = engine
        .preview_match_group(&ctx(), &MatchGroupRequest::one_to_one("l2", "s1"))
        .await
        .unwrap();
    assert_eq!(preview.issues[0].code, IssueCode::LineLocked);

    let missing = engine
        .preview_match_group(&ctx(), &MatchGroupRequest::one_to_one("l1", "nope"))
        .await
        .unwrap();
    assert_eq!(missing.issues[0].code, IssueCode::ScheduleNotFound);
}

#[tokio::test]
async fn test_applied_match_is_removed_by_unmatch_not_by_zeroing() {
    let store = seeded_store();
    store.insert_line(line("l1", 1, "100", "10"));
    store.insert_schedule(schedule("s1", date(2024, 1, 1), "100", "10"));
    let engine = engine(&store, "0");
    engine
        .apply_match_group(
            &ctx(),
            &MatchGroupRequest::one_to_one("l1", "s1"),
            MatchSource::Manual,
        )
        .await
        .unwrap();

    let zeroing = MatchGroupRequest::one_to_one("l1", "s1").with_allocations(vec![
        Allocation::new("l1", "s1", BigDecimal::from(0), BigDecimal::from(0)),
    ]);
    let preview = engine.preview_match_group(&ctx(), &zeroing).await.unwrap();
    assert!(preview
        .issues
        .iter()
        .any(|issue| issue.code == IssueCode::CannotZeroAppliedMatch));

    let result = engine.unmatch_line(&ctx(), "l1").await.unwrap();
    assert_eq!(result.removed_match_ids.len(), 1);
    let s1 = store.schedule("s1").unwrap();
    assert_eq!(s1.status, RevenueScheduleStatus::Unreconciled);
    assert_eq!(s1.actual_usage, BigDecimal::from(0));
    let l1 = store.line("l1").unwrap();
    assert_eq!(l1.status, DepositLineItemStatus::Unmatched);
    assert_eq!(l1.usage_unallocated, dec("100"));
    assert_eq!(
        store.deposit(DEPOSIT).unwrap().status,
        DepositStatus::Pending
    );
}

#[tokio::test]
async fn test_undo_match_group() {
    let store = seeded_store();
    store.insert_line(line("l1", 1, "60", "6"));
    store.insert_line(line("l2", 2, "40", "4"));
    store.insert_schedule(schedule("s1", date(2024, 1, 1), "100", "10"));
    let engine = engine(&store, "0");
    let request = MatchGroupRequest::new(
        MatchType::ManyToOne,
        vec!["l1".to_string(), "l2".to_string()],
        vec!["s1".to_string()],
    );

    let applied = engine
        .apply_match_group(&ctx(), &request, MatchSource::Manual)
        .await
        .unwrap();
    assert_eq!(
        store.schedule("s1").unwrap().status,
        RevenueScheduleStatus::Reconciled
    );
    let group_id = applied.match_group_id.unwrap();

    let undone = engine.undo_match_group(&ctx(), &group_id).await.unwrap();
    assert_eq!(undone.removed_match_ids.len(), 2);
    assert_eq!(
        store.match_group(&group_id).unwrap().status,
        MatchGroupStatus::Undone
    );
    assert_eq!(
        store.line("l2").unwrap().status,
        DepositLineItemStatus::Unmatched
    );
    assert_eq!(
        store.schedule("s1").unwrap().status,
        RevenueScheduleStatus::Unreconciled
    );

    let error = engine.undo_match_group(&ctx(), &group_id).await.unwrap_err();
    assert_eq!(
        rule_code(&error),
        Some(rule_codes::MATCH_GROUP_ALREADY_UNDONE)
    );
}

#[tokio::test]
async fn test_adjustment_split_explains_overage() {
    let store = seeded_store();
    store.insert_line(line("l1", 1, "120", "12"));
    store.insert_schedule(schedule("s1", date(2024, 1, 1), "100", "10"));
    let engine = engine(&store, "0");
    engine
        .apply_match_group(
            &ctx(),
            &MatchGroupRequest::one_to_one("l1", "s1"),
            MatchSource::Manual,
        )
        .await
        .unwrap();
    assert_eq!(
        store.schedule("s1").unwrap().status,
        RevenueScheduleStatus::InDispute
    );

    let split = engine
        .split_to_adjustment(
            &ctx(),
            &FlexSplitRequest::new("l1", "s1", dec("20"), dec("2")),
        )
        .await
        .unwrap();

    assert_eq!(split.classification, FlexClassification::Adjustment);
    assert!(!split.source_match_removed);
    let base = store.schedule("s1").unwrap();
    assert_eq!(base.status, RevenueScheduleStatus::Reconciled);
    assert_eq!(base.actual_usage, dec("100"));
    let flex = store.schedule(&split.flex_schedule_id).unwrap();
    assert_eq!(flex.parent_schedule_id.as_deref(), Some("s1"));
    assert_eq!(flex.status, RevenueScheduleStatus::Reconciled);
    let l1 = store.line("l1").unwrap();
    assert_eq!(l1.status, DepositLineItemStatus::Matched);
    assert_eq!(l1.usage_allocated, dec("120"));

    let too_much = engine
        .split_to_adjustment(
            &ctx(),
            &FlexSplitRequest::new("l1", "s1", dec("150"), dec("0")),
        )
        .await
        .unwrap_err();
    assert_eq!(
        rule_code(&too_much),
        Some(rule_codes::SPLIT_EXCEEDS_ALLOCATION)
    );

    let negative = engine
        .split_to_adjustment(
            &ctx(),
            &FlexSplitRequest::new("l1", "s1", dec("-5"), dec("0")),
        )
        .await
        .unwrap_err();
    assert_eq!(negative.codes(), vec!["invalid_split_amount"]);
}

#[tokio::test]
async fn test_bonus_split_drains_source_match() {
    let store = seeded_store();
    store.insert_line(line("l1", 1, "50", "5"));
    let mut product = Product::new(
        "p-bonus".to_string(),
        TENANT.to_string(),
        "Q1 Incentive".to_string(),
    );
    product.family = Some("SPIFF".to_string());
    store.insert_product(product);
    let mut s1 = schedule("s1", date(2024, 1, 1), "50", "5");
    s1.product_id = Some("p-bonus".to_string());
    store.insert_schedule(s1);
    let engine = engine(&store, "0");
    engine
        .apply_match_group(
            &ctx(),
            &MatchGroupRequest::one_to_one("l1", "s1"),
            MatchSource::Manual,
        )
        .await
        .unwrap();

    let split = engine
        .split_to_adjustment(
            &ctx(),
            &FlexSplitRequest::new("l1", "s1", dec("50"), dec("5")),
        )
        .await
        .unwrap();

    assert_eq!(split.classification, FlexClassification::Bonus);
    assert!(split.source_match_removed);
    let matches = store.matches_for_line("l1");
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0].revenue_schedule_id, split.flex_schedule_id);
    assert_eq!(
        store.schedule("s1").unwrap().status,
        RevenueScheduleStatus::Unreconciled
    );
}

#[tokio::test]
async fn test_flex_product_is_cached_per_tenant() {
    let store = seeded_store();
    store.insert_line(line("l1", 1, "80", "8"));
    let mut s1 = schedule("s1", date(2024, 1, 1), "60", "6");
    s1.opportunity_id = Some("opp-1".to_string());
    store.insert_schedule(s1);
    let engine = engine(&store, "0");
    engine
        .apply_match_group(
            &ctx(),
            &MatchGroupRequest::one_to_one("l1", "s1"),
            MatchSource::Manual,
        )
        .await
        .unwrap();

    let request = FlexSplitRequest::new("l1", "s1", dec("10"), dec("1"));
    let first = engine.split_to_flex_product(&ctx(), &request).await.unwrap();
    let second = engine.split_to_flex_product(&ctx(), &request).await.unwrap();

    assert_eq!(first.product_id, second.product_id);
    let flex_products: Vec<Product> = store
        .products()
        .into_iter()
        .filter(|p| p.flex_kind == Some(FlexProductKind::FlexProduct))
        .collect();
    assert_eq!(flex_products.len(), 1);
    assert!(flex_products[0].is_flex);
    assert_eq!(store.opportunity_products().len(), 2);
    assert_eq!(
        store.schedule("s1").unwrap().status,
        RevenueScheduleStatus::Reconciled
    );
}

#[tokio::test]
async fn test_candidates_rank_and_classify() {
    let store = seeded_store();
    let mut l1 = line("l1", 1, "100", "10");
    l1.account_name_raw = Some("ACME INC".to_string());
    l1.product_name_raw = Some("Managed WAN".to_string());
    store.insert_line(l1);

    store.insert_account(Account {
        id: "acc-1".to_string(),
        tenant_id: TENANT.to_string(),
        name: "Acme, Inc.".to_string(),
        legal_name: None,
    });
    store.insert_account(Account {
        id: "acc-2".to_string(),
        tenant_id: TENANT.to_string(),
        name: "Zenith Partners".to_string(),
        legal_name: None,
    });
    store.insert_product(Product::new(
        "p-1".to_string(),
        TENANT.to_string(),
        "Managed WAN".to_string(),
    ));
    store.insert_product(Product::new(
        "p-2".to_string(),
        TENANT.to_string(),
        "Voice Lines".to_string(),
    ));

    let mut weak = schedule("s-weak", date(2023, 10, 15), "400", "40");
    weak.account_id = Some("acc-2".to_string());
    weak.product_id = Some("p-2".to_string());
    store.insert_schedule(weak);

    let mut strong = schedule("s-strong", date(2024, 1, 15), "100", "10");
    strong.account_id = Some("acc-1".to_string());
    strong.product_id = Some("p-1".to_string());
    store.insert_schedule(strong);

    let mut future = schedule("s-future", date(2024, 3, 15), "100", "10");
    future.account_id = Some("acc-1".to_string());
    future.product_id = Some("p-1".to_string());
    store.insert_schedule(future);

    let mut settled = schedule("s-settled", date(2024, 1, 15), "100", "10");
    settled.status = RevenueScheduleStatus::Reconciled;
    store.insert_schedule(settled);

    let engine = engine(&store, "0");
    let candidates = engine
        .find_candidates(&ctx(), "l1", &CandidateOptions::default())
        .await
        .unwrap();

    let ids: Vec<&str> = candidates
        .iter()
        .map(|c| c.revenue_schedule_id.as_str())
        .collect();
    assert_eq!(ids, vec!["s-strong", "s-weak"]);
    assert_eq!(candidates[0].level, MatchLevel::Auto);
    assert!(candidates[0].within_tolerance_if_applied);
    assert_eq!(candidates[0].signals.account_name, Some(1.0));
    assert_eq!(candidates[1].level, MatchLevel::Low);

    let with_future = engine
        .find_candidates(
            &ctx(),
            "l1",
            &CandidateOptions {
                include_future_schedules: Some(true),
                limit: Some(2),
                ..CandidateOptions::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(with_future.len(), 2);
    assert!(with_future
        .iter()
        .any(|c| c.revenue_schedule_id == "s-future"));
    assert!(with_future
        .iter()
        .all(|c| c.revenue_schedule_id != "s-weak"));
}

#[tokio::test]
async fn test_stale_transaction_is_rejected() {
    let store = seeded_store();
    store.insert_line(line("l1", 1, "100", "10"));
    store.insert_schedule(schedule("s1", date(2024, 1, 1), "100", "10"));
    let engine = engine(&store, "0");

    let mut stale = store.begin().await.unwrap();
    engine
        .apply_match_group(
            &ctx(),
            &MatchGroupRequest::one_to_one("l1", "s1"),
            MatchSource::Manual,
        )
        .await
        .unwrap();

    let mut l1 = stale.get_line(TENANT, "l1").await.unwrap().unwrap();
    l1.status = DepositLineItemStatus::Ignored;
    stale.update_line(&l1).await.unwrap();
    assert!(matches!(
        stale.commit().await,
        Err(ReconError::Conflict(_))
    ));
    assert_eq!(
        store.line("l1").unwrap().status,
        DepositLineItemStatus::Matched
    );
}

#[tokio::test]
async fn test_default_allocation_tops_up_existing_match() {
    let store = seeded_store();
    store.insert_line(line("l1", 1, "100", "10"));
    store.insert_schedule(schedule("s1", date(2024, 1, 1), "100", "10"));
    let engine = engine(&store, "0");

    let partial = MatchGroupRequest::one_to_one("l1", "s1").with_allocations(vec![Allocation::new(
        "l1",
        "s1",
        dec("60"),
        dec("6"),
    )]);
    engine
        .apply_match_group(&ctx(), &partial, MatchSource::Manual)
        .await
        .unwrap();
    assert_eq!(store.line("l1").unwrap().usage_allocated, dec("60"));

    let rest = engine
        .apply_match_group(
            &ctx(),
            &MatchGroupRequest::one_to_one("l1", "s1"),
            MatchSource::Manual,
        )
        .await
        .unwrap();
    assert!(rest.created_match_ids.is_empty());
    assert_eq!(rest.updated_match_ids.len(), 1);

    let l1 = store.line("l1").unwrap();
    assert_eq!(l1.usage_allocated, dec("100"));
    assert_eq!(l1.usage_unallocated, BigDecimal::from(0));
    assert_eq!(l1.commission_allocated, dec("10"));
    let matches = store.matches_for_line("l1");
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0].usage_amount, dec("100"));
    assert_eq!(
        store.schedule("s1").unwrap().status,
        RevenueScheduleStatus::Reconciled
    );

    // Explicit amounts still replace the pair
    let shrink = MatchGroupRequest::one_to_one("l1", "s1").with_allocations(vec![Allocation::new(
        "l1",
        "s1",
        dec("30"),
        dec("3"),
    )]);
    engine
        .apply_match_group(&ctx(), &shrink, MatchSource::Manual)
        .await
        .unwrap();
    assert_eq!(store.matches_for_line("l1")[0].usage_amount, dec("30"));
    assert_eq!(store.line("l1").unwrap().usage_unallocated, dec("70"));
}

#[tokio::test]
async fn test_one_to_many_default_for_a_few_cents() {
    let store = seeded_store();
    store.insert_line(line("l1", 1, "0.03", "0.03"));
    let schedule_ids: Vec<String> = (1..=5).map(|n| format!("s{n}")).collect();
    for (day, id) in schedule_ids.iter().enumerate() {
        store.insert_schedule(schedule(id, date(2024, 1, day as u32 + 1), "10", "1"));
    }
    let engine = engine(&store, "0");
    let request =
        MatchGroupRequest::new(MatchType::OneToMany, vec!["l1".to_string()], schedule_ids);

    let preview = engine.preview_match_group(&ctx(), &request).await.unwrap();
    assert!(preview.ok, "issues: {:?}", preview.issues);
    assert!(preview
        .allocations
        .iter()
        .all(|a| a.usage_amount >= BigDecimal::from(0) && a.commission_amount >= BigDecimal::from(0)));
    let usage: BigDecimal = preview.allocations.iter().map(|a| &a.usage_amount).sum();
    assert_eq!(usage, dec("0.03"));

    engine
        .apply_match_group(&ctx(), &request, MatchSource::Manual)
        .await
        .unwrap();
    let l1 = store.line("l1").unwrap();
    assert_eq!(l1.status, DepositLineItemStatus::Matched);
    assert_eq!(store.matches_for_line("l1").len(), 3);
}

#[tokio::test]
async fn test_candidates_with_equal_confidence_keep_creation_order() {
    let store = seeded_store();
    store.insert_line(line("l1", 1, "100", "10"));
    let first_created = date(2024, 1, 1).and_hms_opt(9, 0, 0).unwrap();

    let mut older = schedule("s-b", date(2024, 1, 15), "100", "10");
    older.created_at = first_created;
    let mut newer = schedule("s-a", date(2024, 1, 15), "100", "10");
    newer.created_at = first_created + chrono::Duration::seconds(1);
    store.insert_schedule(newer);
    store.insert_schedule(older);

    let engine = engine(&store, "0");
    let candidates = engine
        .find_candidates(&ctx(), "l1", &CandidateOptions::default())
        .await
        .unwrap();

    assert_eq!(candidates.len(), 2);
    assert_eq!(candidates[0].confidence, candidates[1].confidence);
    let ids: Vec<&str> = candidates
        .iter()
        .map(|c| c.revenue_schedule_id.as_str())
        .collect();
    assert_eq!(ids, vec!["s-b", "s-a"]);
}

#[tokio::test]
async fn test_repeated_chargeback_retires_previous_schedule() {
    let store = seeded_store();
    store.insert_line(line("l1", 1, "-50", "-5"));
    let engine = engine(&store, "0");

    let first = engine.create_chargeback(&ctx(), "l1").await.unwrap();
    assert!(first.retired_schedule_ids.is_empty());

    let second = engine.create_chargeback(&ctx(), "l1").await.unwrap();
    assert_eq!(second.removed_match_ids, vec![first.match_id.clone()]);
    assert_eq!(
        second.retired_schedule_ids,
        vec![first.chargeback_schedule_id.clone()]
    );
    assert!(store
        .schedule(&first.chargeback_schedule_id)
        .unwrap()
        .deleted_at
        .is_some());
    assert!(store
        .schedule(&second.chargeback_schedule_id)
        .unwrap()
        .deleted_at
        .is_none());

    let mut other = line("l2", 2, "-50", "-5");
    other.payment_date = Some(date(2024, 1, 20));
    store.insert_line(other);
    let candidates = engine
        .find_candidates(&ctx(), "l2", &CandidateOptions::default())
        .await
        .unwrap();
    assert!(candidates
        .iter()
        .all(|c| c.revenue_schedule_id != first.chargeback_schedule_id));
}

//! Match group walkthrough: candidates, preview, apply and unmatch

use std::str::FromStr;

use bigdecimal::BigDecimal;
use chrono::NaiveDate;
use commission_recon_core::{
    Account, CandidateOptions, Deposit, DepositLineItem, MatchGroupRequest, MatchSource,
    MatchType, MatchingPreferences, MemoryStorage, OperationContext, Product,
    ReconciliationEngine, RevenueSchedule, StaticPreferences,
};

const TENANT: &str = "acme-agency";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    println!("🔎 Commission Reconciliation - Match Group Walkthrough\n");

    let store = MemoryStorage::new();
    seed(&store)?;

    let preferences = MatchingPreferences {
        variance_tolerance: BigDecimal::from_str("0.02")?,
        ..MatchingPreferences::default()
    };
    let engine = ReconciliationEngine::new(store.clone(), StaticPreferences::new(preferences)?);
    let ctx = OperationContext::new(TENANT, "analyst-1");

    // 1. Rank open schedules for the first line
    println!("📋 Candidates for line 1:");
    let candidates = engine
        .find_candidates(&ctx, "line-1", &CandidateOptions::default())
        .await?;
    for candidate in &candidates {
        println!(
            "  {} dated {:?}: confidence {:.3} ({:?})",
            candidate.revenue_schedule_id,
            candidate.schedule_date,
            candidate.confidence,
            candidate.level
        );
    }
    println!();

    // 2. Preview then apply the best candidate
    let Some(best) = candidates.first() else {
        println!("No candidates found");
        return Ok(());
    };
    let request = MatchGroupRequest::one_to_one("line-1", best.revenue_schedule_id.clone());
    let preview = engine.preview_match_group(&ctx, &request).await?;
    println!("🧮 Preview ok: {}", preview.ok);
    for schedule in &preview.schedules {
        println!(
            "  {} actual {} -> {} ({:?})",
            schedule.schedule_id,
            schedule.actual_usage_net_before,
            schedule.actual_usage_net_after,
            schedule.status_after
        );
    }

    let applied = engine
        .apply_match_group(&ctx, &request, MatchSource::Manual)
        .await?;
    println!(
        "  ✓ Applied {} match(es), audit {}\n",
        applied.created_match_ids.len(),
        applied.audit_log_id
    );

    // 3. One line paying three monthly schedules
    let spread = MatchGroupRequest::new(
        MatchType::OneToMany,
        vec!["line-2".to_string()],
        vec![
            "sched-feb".to_string(),
            "sched-mar".to_string(),
            "sched-apr".to_string(),
        ],
    );
    let preview = engine.preview_match_group(&ctx, &spread).await?;
    println!("🧮 One-to-many allocations:");
    for allocation in &preview.allocations {
        println!(
            "  {} <- usage {} commission {}",
            allocation.schedule_id, allocation.usage_amount, allocation.commission_amount
        );
    }
    for warning in &preview.warnings {
        println!("  ⚠ {warning}");
    }
    let applied = engine
        .apply_match_group(&ctx, &spread, MatchSource::Manual)
        .await?;
    println!("  ✓ Match group {:?}\n", applied.match_group_id);

    if let Some(deposit) = store.deposit("deposit-1") {
        println!(
            "📦 Deposit status {:?}: {} of {} lines matched",
            deposit.status, deposit.items_matched, deposit.total_items
        );
    }

    // 4. Take the first match back
    let unmatched = engine.unmatch_line(&ctx, "line-1").await?;
    println!(
        "↩ Unmatched line 1, removed {} match(es)",
        unmatched.removed_match_ids.len()
    );
    if let Some(deposit) = store.deposit("deposit-1") {
        println!("📦 Deposit status {:?}", deposit.status);
    }

    Ok(())
}

fn seed(store: &MemoryStorage) -> Result<(), Box<dyn std::error::Error>> {
    let date = |m: u32, d: u32| NaiveDate::from_ymd_opt(2024, m, d).ok_or("invalid date");

    let mut deposit = Deposit::new("deposit-1".to_string(), TENANT.to_string(), date(1, 31)?);
    deposit.vendor_account_id = Some("vendor-telco".to_string());
    store.insert_deposit(deposit);

    store.insert_account(Account {
        id: "acct-northwind".to_string(),
        tenant_id: TENANT.to_string(),
        name: "Northwind Traders, LLC".to_string(),
        legal_name: None,
    });
    store.insert_product(Product::new(
        "prod-fiber".to_string(),
        TENANT.to_string(),
        "Dedicated Fiber 1G".to_string(),
    ));

    let mut line_1 = DepositLineItem::new(
        "line-1".to_string(),
        TENANT.to_string(),
        "deposit-1".to_string(),
        1,
        BigDecimal::from_str("1200.00")?,
        BigDecimal::from_str("144.00")?,
    );
    line_1.payment_date = Some(date(1, 20)?);
    line_1.vendor_account_id = Some("vendor-telco".to_string());
    line_1.account_name_raw = Some("NORTHWIND TRADERS".to_string());
    line_1.product_name_raw = Some("Dedicated Fiber 1G".to_string());
    store.insert_line(line_1);

    let mut line_2 = DepositLineItem::new(
        "line-2".to_string(),
        TENANT.to_string(),
        "deposit-1".to_string(),
        2,
        BigDecimal::from_str("900.00")?,
        BigDecimal::from_str("90.00")?,
    );
    line_2.payment_date = Some(date(1, 20)?);
    line_2.vendor_account_id = Some("vendor-telco".to_string());
    store.insert_line(line_2);

    let schedules = [
        ("sched-jan", date(1, 1)?, "1200.00", "144.00"),
        ("sched-dec", date(1, 28)?, "1500.00", "180.00"),
        ("sched-feb", date(2, 1)?, "300.00", "30.00"),
        ("sched-mar", date(3, 1)?, "300.00", "30.00"),
        ("sched-apr", date(4, 1)?, "300.00", "30.00"),
    ];
    for (id, on, usage, commission) in schedules {
        let mut schedule = RevenueSchedule::new(
            id.to_string(),
            TENANT.to_string(),
            Some(on),
            BigDecimal::from_str(usage)?,
            BigDecimal::from_str(commission)?,
        );
        schedule.vendor_account_id = Some("vendor-telco".to_string());
        schedule.account_id = Some("acct-northwind".to_string());
        schedule.product_id = Some("prod-fiber".to_string());
        store.insert_schedule(schedule);
    }
    Ok(())
}

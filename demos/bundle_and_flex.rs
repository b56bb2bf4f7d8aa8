//! Bundle rip-and-replace and flex resolution example

use std::str::FromStr;

use bigdecimal::BigDecimal;
use chrono::NaiveDate;
use commission_recon_core::{
    BundleMode, BundleRequest, Deposit, DepositLineItem, FlexSplitRequest, MatchGroupRequest,
    MatchSource, MemoryStorage, OperationContext, ReconciliationEngine, RevenueSchedule,
    StaticPreferences,
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

    println!("🧩 Commission Reconciliation - Bundle and Flex Example\n");

    let store = MemoryStorage::new();
    let date = |m: u32, d: u32| NaiveDate::from_ymd_opt(2024, m, d).ok_or("invalid date");
    let money = |s: &str| BigDecimal::from_str(s);

    store.insert_deposit(Deposit::new(
        "deposit-1".to_string(),
        TENANT.to_string(),
        date(1, 31)?,
    ));
    let lines = [
        ("line-voice", 1, "240.00", "24.00"),
        ("line-data", 2, "360.00", "36.00"),
        ("line-over", 3, "550.00", "55.00"),
        ("line-refund", 4, "-75.00", "-7.50"),
    ];
    for (id, number, usage, commission) in lines {
        let mut line = DepositLineItem::new(
            id.to_string(),
            TENANT.to_string(),
            "deposit-1".to_string(),
            number,
            money(usage)?,
            money(commission)?,
        );
        line.payment_date = Some(date(1, 15)?);
        line.product_name_raw = Some(format!("Service {number}"));
        store.insert_line(line);
    }

    for (id, month) in [("bundle-jan", 1), ("bundle-feb", 2), ("bundle-mar", 3)] {
        let mut schedule = RevenueSchedule::new(
            id.to_string(),
            TENANT.to_string(),
            Some(date(month, 1)?),
            money("600.00")?,
            money("60.00")?,
        );
        schedule.opportunity_id = Some("opp-unified".to_string());
        schedule.opportunity_product_id = Some("opp-product-unified".to_string());
        store.insert_schedule(schedule);
    }
    let mut single = RevenueSchedule::new(
        "single-jan".to_string(),
        TENANT.to_string(),
        Some(date(1, 1)?),
        money("500.00")?,
        money("50.00")?,
    );
    single.opportunity_id = Some("opp-single".to_string());
    store.insert_schedule(single);

    let engine = ReconciliationEngine::new(store.clone(), StaticPreferences::default());
    let ctx = OperationContext::new(TENANT, "analyst-1");

    // 1. Break a bundled schedule into one product per deposit line
    println!("📦 Bundling voice and data lines...");
    let request = BundleRequest::new(
        "deposit-1",
        "bundle-jan",
        vec!["line-voice".to_string(), "line-data".to_string()],
        BundleMode::SoftDeleteOld,
    );
    let bundled = engine.bundle_rip_replace(&ctx, &request).await?;
    println!(
        "  ✓ Created {} products and {} schedules, replaced {}",
        bundled.created_product_ids.len(),
        bundled.created_schedule_ids.len(),
        bundled.replaced_schedule_ids.len()
    );

    let replay = engine.bundle_rip_replace(&ctx, &request).await?;
    println!(
        "  ✓ Resubmission returned the same operation: {}\n",
        replay == bundled
    );

    // 2. Overpayment moved onto an adjustment schedule
    println!("➕ Explaining a 50.00 overpayment...");
    engine
        .apply_match_group(
            &ctx,
            &MatchGroupRequest::one_to_one("line-over", "single-jan"),
            MatchSource::Manual,
        )
        .await?;
    let split = engine
        .split_to_adjustment(
            &ctx,
            &FlexSplitRequest::new("line-over", "single-jan", money("50.00")?, money("5.00")?),
        )
        .await?;
    println!(
        "  ✓ {:?} schedule {} ({:?})",
        split.classification, split.flex_schedule_id, split.reason_code
    );
    if let Some(schedule) = store.schedule("single-jan") {
        println!("  ✓ Base schedule now {:?}\n", schedule.status);
    }

    // 3. Negative line gets its own chargeback schedule
    println!("➖ Recording a chargeback...");
    let chargeback = engine.create_chargeback(&ctx, "line-refund").await?;
    println!(
        "  ✓ Chargeback schedule {} on product {}\n",
        chargeback.chargeback_schedule_id, chargeback.product_id
    );

    // 4. Undo the bundle and restore the original schedules
    let undone = engine.undo_bundle(&ctx, &bundled.operation_id).await?;
    println!(
        "↩ Bundle undone: {} schedules restored, {} retired",
        undone.restored_schedule_ids.len(),
        undone.deleted_schedule_ids.len()
    );

    println!("\n🧾 Audit trail:");
    for entry in store.audit_log() {
        println!("  {} by {}", entry.action, entry.user_id);
    }

    Ok(())
}

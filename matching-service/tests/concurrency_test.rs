//! Racing sweeps and manual matches against the active-match invariant.

mod common;

use common::spawn_app;
use matching_service::models::{MatchStatus, MatchTarget, VendorOverrides};
use service_core::error::AppError;
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

async fn assert_single_active_per_side(app: &common::TestApp) {
    let mut per_receipt: HashMap<Uuid, usize> = HashMap::new();
    let mut per_target: HashMap<MatchTarget, usize> = HashMap::new();
    for status in [MatchStatus::Proposed, MatchStatus::Confirmed] {
        let (matches, _) = app.store.list_matches(status, 1, 1000).await.unwrap();
        for m in matches {
            *per_receipt.entry(m.receipt_id).or_default() += 1;
            *per_target.entry(m.target).or_default() += 1;
        }
    }
    assert!(per_receipt.values().all(|&n| n == 1));
    assert!(per_target.values().all(|&n| n == 1));
}

#[tokio::test]
async fn concurrent_sweeps_never_double_propose() {
    let app = spawn_app();
    for day in 1..=10 {
        app.receipt(Some("Shell"), day, 6000 + day as i64 * 7).await;
        app.transaction("SHELL OIL 5544", day, 6000 + day as i64 * 7).await;
    }

    let sweeps = (0..4).map(|_| {
        let auto_match = app.state.auto_match.clone();
        tokio::spawn(async move {
            auto_match
                .run_auto_match(None, CancellationToken::new())
                .await
                .unwrap()
        })
    });
    let reports = futures::future::join_all(sweeps).await;

    let proposed: usize = reports
        .into_iter()
        .map(|r| r.unwrap().proposed_count)
        .sum();
    assert_eq!(proposed, 10);
    assert_single_active_per_side(&app).await;
}

#[tokio::test]
async fn manual_match_racing_a_sweep_has_one_winner() {
    let app = spawn_app();
    let receipt = app.receipt(Some("Uber"), 5, 2000).await;
    let tx = app.transaction("UBER", 5, 2000).await;

    let lifecycle = app.state.lifecycle.clone();
    let manual = tokio::spawn(async move {
        lifecycle
            .manual_match(
                receipt.id,
                MatchTarget::Transaction(tx.id),
                VendorOverrides::default(),
            )
            .await
    });
    let auto_match = app.state.auto_match.clone();
    let sweep = tokio::spawn(async move {
        auto_match
            .run_auto_match(Some(vec![receipt.id]), CancellationToken::new())
            .await
    });

    let manual = manual.await.unwrap();
    let report = sweep.await.unwrap().unwrap();

    match manual {
        Ok(_) => assert_eq!(report.proposed_count, 0),
        Err(AppError::Conflict(_)) => assert_eq!(report.proposed_count, 1),
        Err(e) => panic!("unexpected error: {}", e),
    }
    assert_single_active_per_side(&app).await;
}

#[tokio::test]
async fn rejected_match_frees_receipt_for_a_new_proposal() {
    let app = spawn_app();
    let receipt = app.receipt(Some("Shell"), 4, 6100).await;
    app.transaction("SHELL OIL 5544", 4, 6100).await;

    let first = app
        .state
        .auto_match
        .run_auto_match(None, CancellationToken::new())
        .await
        .unwrap();
    let id = first.proposals[0].proposed.id;
    app.state.lifecycle.reject(id, None).await.unwrap();

    let second = app
        .state
        .auto_match
        .run_auto_match(None, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(second.proposed_count, 1);
    assert_eq!(second.proposals[0].proposed.receipt_id, receipt.id);
    assert_ne!(second.proposals[0].proposed.id, id);

    let original = app.state.lifecycle.get(id).await.unwrap();
    assert_eq!(original.status(), MatchStatus::Rejected);
    assert_single_active_per_side(&app).await;
}

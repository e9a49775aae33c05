//! Postgres store tests. Run with `TEST_DATABASE_URL` set and `--ignored`.

mod common;

use common::{date, dollars, spawn_pg_app};
use matching_service::models::{
    MatchStatus, MatchTarget, NewMatch, NewVendorAlias, Receipt, ScoreBreakdown, Transaction,
    VendorOverrides,
};
use service_core::error::AppError;

fn proposal(receipt: &Receipt, target: MatchTarget) -> NewMatch {
    NewMatch {
        receipt_id: receipt.id,
        target,
        scores: ScoreBreakdown::new(40, 30, 20),
        match_reason: "pg test".to_string(),
        is_manual: false,
        overrides: VendorOverrides::default(),
    }
}

#[tokio::test]
#[ignore]
async fn pg_second_active_match_is_conflict() {
    let app = spawn_pg_app().await;
    let receipt = app.receipt(Some("Shell"), 4, 6100).await;
    let tx = app.transaction("SHELL OIL 5544", 4, 6100).await;

    let first = app
        .store
        .insert_match(proposal(&receipt, MatchTarget::Transaction(tx.id)))
        .await
        .unwrap();
    let err = app
        .store
        .insert_match(proposal(&receipt, MatchTarget::Transaction(tx.id)))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));

    let stored = app.store.get_match(first.id).await.unwrap().unwrap();
    assert_eq!(stored.status(), MatchStatus::Proposed);
    assert_eq!(stored.version, first.version);
    assert_eq!(stored.scores, first.scores);
    assert_eq!(
        app.store.get_receipt(receipt.id).await.unwrap().unwrap().match_id,
        Some(first.id)
    );
}

#[tokio::test]
#[ignore]
async fn pg_resolve_and_delete_release_receipt() {
    let app = spawn_pg_app().await;
    let receipt = app.receipt(Some("Shell"), 4, 6100).await;
    let tx = app.transaction("SHELL OIL 5544", 4, 6100).await;

    let m = app
        .store
        .insert_match(proposal(&receipt, MatchTarget::Transaction(tx.id)))
        .await
        .unwrap();
    let rejected = app
        .store
        .resolve_match(m.id, MatchStatus::Rejected, None, Some(1))
        .await
        .unwrap();
    assert_eq!(rejected.status(), MatchStatus::Rejected);
    assert_eq!(rejected.version, 2);
    assert_eq!(
        app.store.get_receipt(receipt.id).await.unwrap().unwrap().match_id,
        None
    );

    let again = app
        .store
        .insert_match(proposal(&receipt, MatchTarget::Transaction(tx.id)))
        .await
        .unwrap();
    let confirmed = app
        .store
        .resolve_match(again.id, MatchStatus::Confirmed, None, None)
        .await
        .unwrap();
    assert_eq!(confirmed.status(), MatchStatus::Confirmed);

    let removed = app.store.delete_match(confirmed.id).await.unwrap();
    assert_eq!(removed.id, confirmed.id);
    assert!(app.store.get_match(confirmed.id).await.unwrap().is_none());
}

#[tokio::test]
#[ignore]
async fn pg_alias_upsert_increments_usage() {
    let app = spawn_pg_app().await;
    let pattern = format!("pg test vendor {}", uuid::Uuid::new_v4().simple());
    let alias = NewVendorAlias {
        canonical_name: "PG Vendor".to_string(),
        match_pattern: pattern.clone(),
        default_gl_code: Some("6100".to_string()),
        default_department: None,
    };

    let (first, created) = app.store.upsert_vendor_alias(alias.clone()).await.unwrap();
    assert!(created);
    assert_eq!(first.usage_count, 1);

    let (second, created) = app
        .store
        .upsert_vendor_alias(NewVendorAlias {
            default_gl_code: None,
            default_department: Some("Ops".to_string()),
            ..alias
        })
        .await
        .unwrap();
    assert!(!created);
    assert_eq!(second.id, first.id);
    assert_eq!(second.usage_count, 2);
    assert_eq!(second.default_gl_code.as_deref(), Some("6100"));
    assert_eq!(second.default_department.as_deref(), Some("Ops"));
}

#[tokio::test]
#[ignore]
async fn pg_group_lifecycle() {
    let app = spawn_pg_app().await;
    let a = app
        .store
        .insert_transaction(Transaction::new(date(3), dollars(10000), "HILTON HOTELS"))
        .await
        .unwrap();
    let b = app
        .store
        .insert_transaction(Transaction::new(date(4), dollars(5000), "HILTON HOTELS"))
        .await
        .unwrap();
    let c = app
        .store
        .insert_transaction(Transaction::new(date(6), dollars(2500), "HILTON HOTELS"))
        .await
        .unwrap();

    let group = app.store.create_group(&[a.id, b.id], None, None).await.unwrap();
    assert_eq!(group.combined_amount, dollars(15000));
    assert_eq!(group.display_date, date(4));
    assert_eq!(group.name, "HILTON HOTELS");

    let receipt = app.receipt(Some("Hilton"), 4, 15000).await;
    let m = app
        .store
        .insert_match(proposal(&receipt, MatchTarget::Group(group.id)))
        .await
        .unwrap();

    let grown = app.store.add_group_member(group.id, c.id).await.unwrap();
    assert_eq!(grown.combined_amount, dollars(17500));
    assert_eq!(grown.display_date, date(6));

    let err = app
        .store
        .add_group_member(group.id, c.id)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));

    let release = app.store.delete_group(group.id).await.unwrap();
    assert_eq!(release.released_match.map(|r| r.id), Some(m.id));
    assert!(app.store.get_group(group.id).await.unwrap().is_none());
    assert_eq!(
        app.store.get_receipt(receipt.id).await.unwrap().unwrap().match_id,
        None
    );
    let member = app.store.get_transaction(a.id).await.unwrap().unwrap();
    assert_eq!(member.group_id, None);
}

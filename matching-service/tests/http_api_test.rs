//! HTTP contract tests over the in-memory backend.

mod common;

use axum::http::{Method, StatusCode};
use common::spawn_app;
use serde_json::json;
use uuid::Uuid;

#[tokio::test]
async fn health_and_metrics_respond() {
    let app = spawn_app();

    let (status, body) = app.get("/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");

    let (status, _) = app.get("/ready").await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = app.get("/metrics").await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn auto_match_proposes_starbucks_receipt() {
    let app = spawn_app();
    let receipt = app.receipt(Some("STARBUCKS #123"), 1, 4250).await;
    let tx = app.transaction("STARBUCKS STORE 0123", 2, 4250).await;

    let (status, body) = app.post("/matching/auto", json!({})).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["proposedCount"], 1);
    assert_eq!(body["transactionMatchCount"], 1);
    assert_eq!(body["groupMatchCount"], 0);
    assert_eq!(body["processedCount"], 1);
    assert_eq!(body["cancelled"], false);

    let proposal = &body["proposals"][0];
    assert_eq!(proposal["receiptId"], receipt.id.to_string());
    assert_eq!(proposal["transactionId"], tx.id.to_string());
    assert_eq!(proposal["status"], "proposed");
    assert_eq!(proposal["amountScore"], 40);
    assert_eq!(proposal["dateScore"], 30);
    let confidence = proposal["confidenceScore"].as_i64().unwrap();
    assert!((90..=95).contains(&confidence));
    assert_eq!(
        confidence,
        proposal["amountScore"].as_i64().unwrap()
            + proposal["dateScore"].as_i64().unwrap()
            + proposal["vendorScore"].as_i64().unwrap()
    );
}

#[tokio::test]
async fn auto_match_without_body_sweeps_everything() {
    let app = spawn_app();
    app.receipt(Some("Shell"), 4, 6100).await;
    app.transaction("SHELL OIL 5544", 4, 6100).await;

    let (status, body) = app.request(Method::POST, "/matching/auto", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["proposedCount"], 1);

    let (_, again) = app.post("/matching/auto", json!({})).await;
    assert_eq!(again["proposedCount"], 0);
}

#[tokio::test]
async fn auto_match_rejects_invalid_receipt_ids() {
    let app = spawn_app();
    app.receipt(Some("Shell"), 4, 6100).await;
    app.transaction("SHELL OIL 5544", 4, 6100).await;

    let (status, body) = app
        .post("/matching/auto", json!({ "receiptIds": ["not-a-uuid"] }))
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["code"], "validation_error");

    // Nothing was swept.
    let (_, proposals) = app.get("/matching/proposals").await;
    assert_eq!(proposals["total"], 0);
}

#[tokio::test]
async fn confirm_and_reject_reject_malformed_expected_version() {
    let app = spawn_app();
    app.receipt(Some("Shell"), 4, 6100).await;
    app.transaction("SHELL OIL 5544", 4, 6100).await;
    let (_, auto) = app.post("/matching/auto", json!({})).await;
    let id = auto["proposals"][0]["id"].as_str().unwrap().to_string();

    let (status, body) = app
        .post(
            &format!("/matching/{}/confirm", id),
            json!({ "expectedVersion": "99" }),
        )
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["code"], "validation_error");

    let (status, _) = app
        .post(
            &format!("/matching/{}/reject", id),
            json!({ "expectedVersion": "latest" }),
        )
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    let (_, current) = app.get(&format!("/matching/{}", id)).await;
    assert_eq!(current["status"], "proposed");
    assert_eq!(current["version"], 1);

    // An omitted body still confirms.
    let (status, confirmed) = app
        .request(Method::POST, &format!("/matching/{}/confirm", id), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(confirmed["status"], "confirmed");
}

#[tokio::test]
async fn manual_match_requires_exactly_one_target() {
    let app = spawn_app();
    let receipt = app.receipt(Some("Shell"), 4, 6100).await;
    let tx = app.transaction("SHELL OIL 5544", 4, 6100).await;

    let (status, body) = app
        .post(
            "/matching/manual",
            json!({ "receiptId": receipt.id, "transactionId": tx.id, "transactionGroupId": Uuid::new_v4() }),
        )
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["code"], "validation_error");

    let (status, _) = app
        .post("/matching/manual", json!({ "receiptId": receipt.id }))
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn manual_match_confirms_and_learns_alias() {
    let app = spawn_app();
    let receipt = app.receipt(Some("Shell"), 4, 6100).await;
    let tx = app.transaction("SHELL OIL 5544", 4, 6100).await;

    let (status, body) = app
        .post(
            "/matching/manual",
            json!({
                "receiptId": receipt.id,
                "transactionId": tx.id,
                "vendorDisplayName": "Shell",
                "defaultGLCode": "6100"
            }),
        )
        .await;

    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["status"], "confirmed");
    assert_eq!(body["isManual"], true);
    assert_eq!(body["defaultGlCode"], "6100");
    assert_eq!(body["vendorAlias"]["canonicalName"], "Shell");
    assert_eq!(body["vendorAlias"]["created"], true);

    let (status, body) = app
        .post(
            "/matching/manual",
            json!({ "receiptId": receipt.id, "transactionId": tx.id }),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "conflict");
}

#[tokio::test]
async fn manual_match_unknown_receipt_is_not_found() {
    let app = spawn_app();
    let tx = app.transaction("SHELL OIL 5544", 4, 6100).await;

    let (status, _) = app
        .post(
            "/matching/manual",
            json!({ "receiptId": Uuid::new_v4(), "transactionId": tx.id }),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn candidates_are_ranked_and_limited() {
    let app = spawn_app();
    let receipt = app.receipt(Some("Uber"), 5, 2000).await;
    let best = app.transaction("UBER TRIP", 5, 2000).await;
    app.transaction("UBER TRIP", 8, 2000).await;
    app.transaction("LYFT RIDE", 5, 2500).await;

    let (status, body) = app
        .get(&format!("/matching/candidates/{}?limit=2", receipt.id))
        .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["receiptId"], receipt.id.to_string());
    let candidates = body["candidates"].as_array().unwrap();
    assert_eq!(candidates.len(), 2);
    assert_eq!(candidates[0]["candidateId"], best.id.to_string());
    assert_eq!(candidates[0]["targetType"], "transaction");
    assert!(
        candidates[0]["confidenceScore"].as_i64().unwrap()
            >= candidates[1]["confidenceScore"].as_i64().unwrap()
    );

    let (status, _) = app
        .get(&format!("/matching/candidates/{}", Uuid::new_v4()))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn confirm_reject_and_stale_version() {
    let app = spawn_app();
    app.receipt(Some("Shell"), 4, 6100).await;
    app.transaction("SHELL OIL 5544", 4, 6100).await;
    app.receipt(Some("Uber"), 5, 2000).await;
    app.transaction("UBER TRIP", 5, 2000).await;

    let (_, sweep) = app.post("/matching/auto", json!({})).await;
    let ids: Vec<String> = sweep["proposals"]
        .as_array()
        .unwrap()
        .iter()
        .map(|p| p["id"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(ids.len(), 2);

    let (status, _) = app
        .post(
            &format!("/matching/{}/confirm", ids[0]),
            json!({ "expectedVersion": 7 }),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, body) = app
        .post(
            &format!("/matching/{}/confirm", ids[0]),
            json!({ "expectedVersion": 1, "defaultDepartment": "Travel" }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "confirmed");
    assert_eq!(body["defaultDepartment"], "Travel");
    assert_eq!(body["version"], 2);

    let (status, body) = app
        .request(Method::POST, &format!("/matching/{}/reject", ids[1]), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "rejected");

    let (status, _) = app
        .request(Method::POST, &format!("/matching/{}/reject", ids[0]), None)
        .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, stats) = app.get("/matching/stats").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stats["confirmed"], 1);
    assert_eq!(stats["rejected"], 1);
    assert_eq!(stats["proposed"], 0);
    assert_eq!(stats["unmatchedReceipts"], 1);
}

#[tokio::test]
async fn proposals_are_paginated() {
    let app = spawn_app();
    for day in 1..=3 {
        app.receipt(Some("Shell"), day, 6100 + day as i64).await;
        app.transaction("SHELL OIL 5544", day, 6100 + day as i64).await;
    }
    app.post("/matching/auto", json!({})).await;

    let (status, body) = app.get("/matching/proposals?page=1&pageSize=2").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 3);
    assert_eq!(body["page"], 1);
    assert_eq!(body["pageSize"], 2);
    assert_eq!(body["totalPages"], 2);
    assert_eq!(body["items"].as_array().unwrap().len(), 2);

    let (_, body) = app.get("/matching/proposals?page=2&pageSize=2").await;
    assert_eq!(body["items"].as_array().unwrap().len(), 1);

    let (_, body) = app.get("/matching/proposals?status=confirmed").await;
    assert_eq!(body["total"], 0);

    let (status, _) = app.get("/matching/proposals?status=bogus").await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn batch_approve_by_threshold() {
    let app = spawn_app();
    // 90: exact amount, one day apart, vendor contained
    app.receipt(Some("Shell"), 4, 6100).await;
    app.transaction("SHELL OIL 5544", 5, 6100).await;
    // 100: exact triple
    app.receipt(Some("Uber"), 5, 2000).await;
    app.transaction("UBER", 5, 2000).await;
    // ~63: amount off by 3.00, four days apart
    app.receipt(Some("Hertz"), 10, 10000).await;
    app.transaction("HERTZ RENT A CAR", 14, 10300).await;

    let (_, sweep) = app.post("/matching/auto", json!({})).await;
    assert_eq!(sweep["proposedCount"], 3);

    let (status, body) = app
        .post("/matching/batch-approve", json!({ "minConfidence": 90 }))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["approved"], 2);
    assert_eq!(body["skipped"], 0);

    let (_, remaining) = app.get("/matching/proposals").await;
    assert_eq!(remaining["total"], 1);
}

#[tokio::test]
async fn batch_endpoints_validate_selectors() {
    let app = spawn_app();

    let (status, _) = app.post("/matching/batch-approve", json!({})).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    let (status, _) = app
        .post("/matching/batch-approve", json!({ "minConfidence": 150 }))
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    let (status, _) = app
        .post("/matching/batch-reject", json!({ "ids": [] }))
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    let (status, body) = app
        .post("/matching/batch-reject", json!({ "ids": [Uuid::new_v4()] }))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["rejected"], 0);
    assert_eq!(body["skipped"], 1);
}

#[tokio::test]
async fn patch_and_unmatch_confirmed_match() {
    let app = spawn_app();
    let receipt = app.receipt(Some("Shell"), 4, 6100).await;
    let tx = app.transaction("SHELL OIL 5544", 4, 6100).await;

    let (_, created) = app
        .post(
            "/matching/manual",
            json!({ "receiptId": receipt.id, "transactionId": tx.id }),
        )
        .await;
    let id = created["id"].as_str().unwrap().to_string();
    let version = created["version"].as_i64().unwrap();

    let (status, body) = app
        .request(
            Method::PATCH,
            &format!("/matching/{}", id),
            Some(json!({ "expectedVersion": version, "defaultGlCode": "6400" })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["defaultGlCode"], "6400");

    let (status, _) = app
        .request(
            Method::PATCH,
            &format!("/matching/{}", id),
            Some(json!({ "expectedVersion": version, "defaultGlCode": "6500" })),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, body) = app.delete(&format!("/matching/{}", id)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["receiptId"], receipt.id.to_string());

    let (status, _) = app.get(&format!("/matching/{}", id)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (_, sweep) = app.post("/matching/auto", json!({})).await;
    assert_eq!(sweep["proposedCount"], 1);
}

#[tokio::test]
async fn group_endpoints_round_trip() {
    let app = spawn_app();
    let a = app.transaction("HILTON HOTELS", 3, 10000).await;
    let b = app.transaction("HILTON HOTELS", 4, 5000).await;
    let c = app.transaction("HILTON HOTELS", 5, 2500).await;
    let receipt = app.receipt(Some("Hilton"), 4, 15000).await;

    let (status, group) = app
        .post(
            "/transaction-groups",
            json!({ "transactionIds": [a.id, b.id] }),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(group["combinedAmount"], "150.00");
    assert_eq!(group["displayDate"], "2024-03-04");
    let group_id = group["id"].as_str().unwrap().to_string();

    let (_, sweep) = app
        .post("/matching/auto", json!({ "receiptIds": [receipt.id] }))
        .await;
    assert_eq!(sweep["groupMatchCount"], 1);
    assert_eq!(sweep["proposals"][0]["transactionGroupId"], group_id);

    let (status, view) = app
        .post(
            &format!("/transaction-groups/{}/transactions", group_id),
            json!({ "transactionId": c.id }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert!(view["matchWarning"].is_string());
    assert!(view["activeMatch"].is_object());

    let (status, view) = app
        .delete(&format!("/transaction-groups/{}/transactions/{}", group_id, c.id))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert!(view["matchWarning"].is_null());

    let (status, deleted) = app.delete(&format!("/transaction-groups/{}", group_id)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(deleted["releasedMatch"]["receiptId"], receipt.id.to_string());
    assert_eq!(deleted["warnings"].as_array().unwrap().len(), 1);

    let (status, _) = app.get(&format!("/transaction-groups/{}", group_id)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn group_creation_validates_members() {
    let app = spawn_app();
    let a = app.transaction("HILTON HOTELS", 3, 10000).await;

    let (status, _) = app
        .post("/transaction-groups", json!({ "transactionIds": [a.id] }))
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    let (status, _) = app
        .post(
            "/transaction-groups",
            json!({ "transactionIds": [a.id, Uuid::new_v4()] }),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

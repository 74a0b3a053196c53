use std::sync::Arc;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use chrono::{Duration, Utc};
use serde_json::{json, Value};
use tower::ServiceExt;

use sitehub_api::{
    config::Config,
    db::{
        fields,
        schema::{ensure_schema, PAYMENT_EVENTS, USERS},
        Key, MemoryTableStore, Precondition, TableStore,
    },
    models::{format_timestamp, user::user_key},
    routes, AppState,
};

const ADMIN: &str = "secret";

async fn app() -> (Router, Arc<MemoryTableStore>) {
    let store = Arc::new(MemoryTableStore::new(false));
    ensure_schema(store.as_ref()).await.unwrap();
    let config = Config {
        admin_token: ADMIN.into(),
        bcrypt_cost: 4,
        ..Default::default()
    };
    let state = AppState {
        store: store.clone(),
        config: Arc::new(config),
        redis: None,
        email: None,
    };
    (routes::router(state), store)
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

async fn post(app: &Router, body: Value) -> (StatusCode, Value) {
    let request = Request::builder()
        .method("POST")
        .uri("/api")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    send(app, request).await
}

async fn signup(app: &Router, slug: &str, email: &str) {
    let (status, body) = post(
        app,
        json!({ "type": "signup", "siteSlug": slug, "email": email, "plan": "VIP", "cpf": "529.982.247-25" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
}

async fn add_event(store: &MemoryTableStore, days_ago: i64, status: &str, email: &str) {
    let at = format_timestamp(Utc::now() - Duration::days(days_ago));
    store
        .append(
            PAYMENT_EVENTS.name,
            &fields([("timestamp", at.as_str()), ("status", status), ("payer_email", email)]),
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn slug_is_free_until_signup() {
    let (app, _) = app().await;

    let (status, body) = post(&app, json!({ "type": "validate", "siteSlug": "ACME-MOTOS" })).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "ok": true, "errors": [] }));

    signup(&app, "acme-motos", "dono@acme.com").await;

    let (_, body) = post(&app, json!({ "action": "validate", "site_slug": "ACME-MOTOS" })).await;
    assert_eq!(body, json!({ "ok": false, "errors": ["siteSlug_ja_usado"] }));
}

#[tokio::test]
async fn validate_lists_every_problem() {
    let (app, _) = app().await;
    let (_, body) = post(&app, json!({ "type": "validate", "siteSlug": "a_", "cpf": "111.111.111-11" })).await;
    assert_eq!(
        body["errors"],
        json!(["siteSlug_tamanho_invalido", "siteSlug_caracteres_invalidos", "cpf_invalido"])
    );
}

#[tokio::test]
async fn query_string_requests_are_accepted() {
    let (app, _) = app().await;
    let request = Request::builder()
        .uri("/api?action=validate&siteSlug=")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["errors"], json!(["siteSlug_obrigatorio"]));
}

#[tokio::test]
async fn malformed_and_unknown_requests() {
    let (app, _) = app().await;

    let request = Request::builder()
        .method("POST")
        .uri("/api")
        .body(Body::from("{not json"))
        .unwrap();
    let (status, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, json!({ "ok": false, "error": "invalid_json" }));

    let (status, body) = post(&app, json!({ "type": "drop_everything" })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "unknown_action");

    let request = Request::builder().method("POST").uri("/api").body(Body::empty()).unwrap();
    let (_, body) = send(&app, request).await;
    assert_eq!(body["error"], "unknown_action");
}

#[tokio::test]
async fn admin_block_makes_the_site_unservable() {
    let (app, store) = app().await;
    signup(&app, "ACME", "dono@acme.com").await;
    add_event(&store, 1, "approved", "dono@acme.com").await;

    let status_request = || {
        Request::builder()
            .uri("/api?type=get_status")
            .header("X-Site-Slug", "acme")
            .body(Body::empty())
            .unwrap()
    };
    let (_, body) = send(&app, status_request()).await;
    assert_eq!(body["active"], true);
    assert_eq!(body["manualBlock"], false);
    assert_eq!(body["status"], "approved");
    assert_eq!(body["email"], "dono@acme.com");

    let (status, body) = post(&app, json!({ "type": "admin_set", "siteSlug": "ACME", "block": true })).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "unauthorized");

    let (status, body) = post(
        &app,
        json!({ "type": "admin_set", "siteSlug": "ACME", "block": true, "adminToken": ADMIN }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "ok": true, "siteSlug": "ACME", "manual_block": true }));

    let (_, body) = send(&app, status_request()).await;
    assert_eq!(body["active"], false);
    assert_eq!(body["manualBlock"], true);

    let (status, body) = post(
        &app,
        json!({ "type": "admin_set", "siteSlug": "NOPE", "block": true, "adminToken": ADMIN }),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "site_not_found");
}

#[tokio::test]
async fn admin_set_without_block_changes_nothing() {
    let (app, store) = app().await;
    signup(&app, "ACME", "dono@acme.com").await;
    post(&app, json!({ "type": "admin_set", "siteSlug": "ACME", "block": true, "adminToken": ADMIN })).await;

    let (status, body) = post(&app, json!({ "type": "admin_set", "siteSlug": "ACME", "adminToken": ADMIN })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "missing_params");

    let row = store.get("signups", &Key::slug("site_slug", "ACME")).await.unwrap().unwrap();
    assert_eq!(row.get("manual_block"), "true");
}

#[tokio::test]
async fn get_status_needs_a_slug() {
    let (app, _) = app().await;
    let (status, body) = post(&app, json!({ "type": "get_status" })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "missing_siteSlug_header");

    let (status, body) = post(&app, json!({ "type": "get_status", "siteSlug": "GHOST" })).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "site_not_found");
}

#[tokio::test]
async fn password_lifecycle() {
    let (app, store) = app().await;

    let set = json!({
        "type": "user_set_password",
        "email": "Dono@Acme.com",
        "password": "p1",
        "role": "client",
        "siteSlug": "acme",
    });
    let request = Request::builder()
        .method("POST")
        .uri("/api")
        .header("X-Admin-Token", ADMIN)
        .body(Body::from(set.to_string()))
        .unwrap();
    let (status, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body, json!({ "ok": true, "email": "dono@acme.com", "role": "client", "siteSlug": "ACME" }));

    let (status, body) = post(&app, json!({ "type": "user_login", "email": "dono@acme.com", "password": "p1" })).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "ok": true, "email": "dono@acme.com" }));

    let (status, body) = post(&app, json!({ "type": "user_login", "email": "dono@acme.com", "password": "nope" })).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "invalid_credentials");

    let (_, body) = post(&app, json!({ "type": "password_reset_request", "email": "ghost@acme.com" })).await;
    assert_eq!(body, json!({ "ok": true }));
    let (_, body) = post(&app, json!({ "type": "password_reset_request", "email": "dono@acme.com" })).await;
    assert_eq!(body, json!({ "ok": true }));

    let row = store.get(USERS.name, &user_key("dono@acme.com")).await.unwrap().unwrap();
    let token = row.get("reset_token").to_string();
    assert_eq!(token.len(), 32);

    let confirm = json!({ "type": "password_reset_confirm", "email": "dono@acme.com", "token": token, "password": "p2" });
    let (status, body) = post(&app, confirm.clone()).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    let (status, body) = post(&app, confirm).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_token");

    let (status, _) = post(&app, json!({ "type": "user_login", "email": "dono@acme.com", "password": "p2" })).await;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = post(&app, json!({ "type": "password_reset_confirm", "email": "dono@acme.com" })).await;
    assert_eq!(body["error"], "missing_params");
}

#[tokio::test]
async fn expired_reset_token_is_refused() {
    let (app, store) = app().await;
    let past = format_timestamp(Utc::now() - Duration::minutes(5));
    store
        .upsert(
            USERS.name,
            &user_key("a@x.com"),
            &fields([("reset_token", "abcd"), ("reset_expiry", past.as_str())]),
            Precondition::Absent,
        )
        .await
        .unwrap();

    let (status, body) = post(
        &app,
        json!({ "type": "password_reset_confirm", "email": "a@x.com", "token": "abcd", "password": "x" }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "expired_token");
}

#[tokio::test]
async fn client_billing_trusts_a_cached_approval() {
    let (app, store) = app().await;
    signup(&app, "ACME", "dono@acme.com").await;
    let next = format_timestamp(Utc::now() + Duration::days(12));
    store
        .upsert(
            USERS.name,
            &user_key("dono@acme.com"),
            &fields([("billing_status", "approved"), ("billing_next", next.as_str())]),
            Precondition::Any,
        )
        .await
        .unwrap();
    // A rejected event would not change a fresh cached approval.
    add_event(&store, 0, "rejected", "dono@acme.com").await;

    let (status, body) = post(&app, json!({ "type": "client_billing", "email": "DONO@acme.com" })).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        json!({
            "ok": true,
            "plan": "VIP",
            "status": "approved",
            "provider": "mercadopago",
            "next_renewal": next,
            "amount": "99.90",
            "currency": "BRL",
        })
    );

    let (status, body) = post(&app, json!({ "type": "client_billing" })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "missing_email");
}

#[tokio::test]
async fn onboarding_requires_proof_of_payment() {
    let (app, store) = app().await;
    signup(&app, "ACME", "dono@acme.com").await;

    let submit = json!({ "type": "onboarding_submit", "siteSlug": "ACME", "email": "dono@acme.com" });
    let (status, body) = post(&app, submit.clone()).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body, json!({ "ok": false, "error": "forbidden_onboarding" }));

    add_event(&store, 1, "authorized", "dono@acme.com").await;
    let (status, body) = post(&app, submit).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "ok": true, "siteSlug": "ACME" }));
}

#[tokio::test]
async fn rename_keeps_the_owner_attached() {
    let (app, _) = app().await;
    signup(&app, "ACME", "dono@acme.com").await;

    let (status, body) = post(
        &app,
        json!({ "type": "admin_rename", "siteSlug": "ACME", "newSlug": "ACME-2", "adminToken": ADMIN }),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["siteSlug"], "ACME-2");

    let (_, body) = post(&app, json!({ "type": "get_status", "siteSlug": "acme-2" })).await;
    assert_eq!(body["email"], "dono@acme.com");
    let (status, _) = post(&app, json!({ "type": "get_status", "siteSlug": "ACME" })).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn health_reports_the_store() {
    let (app, _) = app().await;
    let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let (status, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

use axum::{
    body::Bytes,
    extract::{rejection::QueryRejection, Query, State},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::{json, Value};

use crate::{
    error::ApiError,
    middleware::{
        admin::{verify_admin_token, AdminToken},
        rate_limit::check_rate_limit,
        tenant::SiteHeader,
    },
    models::request::{non_empty, Operation, StoreRequest},
    services::{
        access::{AccessGate, PaymentRefs},
        audit::{self, AuditEntry},
        billing::BillingService,
        credentials::CredentialService,
        metrics::REQUESTS_COUNTER,
        tenants::{NewSignup, TenantService},
        validation::normalize_slug,
    },
    AppState,
};

/// POST /api with a JSON body. An empty body is an empty request.
pub async fn api_post(
    State(state): State<AppState>,
    AdminToken(admin): AdminToken,
    SiteHeader(site): SiteHeader,
    body: Bytes,
) -> Response {
    let request = if body.iter().all(u8::is_ascii_whitespace) {
        StoreRequest::default()
    } else {
        match serde_json::from_slice::<StoreRequest>(&body) {
            Ok(request) => request,
            Err(e) => {
                tracing::debug!("rejected /api body: {e}");
                return ApiError::InvalidJson.into_response();
            }
        }
    };
    respond(&state, admin, site, request).await
}

/// GET /api with query-string parameters.
pub async fn api_get(
    State(state): State<AppState>,
    AdminToken(admin): AdminToken,
    SiteHeader(site): SiteHeader,
    query: Result<Query<StoreRequest>, QueryRejection>,
) -> Response {
    match query {
        Ok(Query(request)) => respond(&state, admin, site, request).await,
        Err(e) => {
            tracing::debug!("rejected /api query: {e}");
            ApiError::InvalidJson.into_response()
        }
    }
}

async fn respond(
    state: &AppState,
    admin: Option<String>,
    site: Option<String>,
    request: StoreRequest,
) -> Response {
    let Some(op) = non_empty(&request.kind).and_then(|kind| kind.parse::<Operation>().ok()) else {
        REQUESTS_COUNTER.with_label_values(&["unknown", "error"]).inc();
        return ApiError::UnknownAction.into_response();
    };

    match dispatch(state, op, admin, site, request).await {
        Ok(body) => {
            REQUESTS_COUNTER.with_label_values(&[op.as_str(), "ok"]).inc();
            Json(body).into_response()
        }
        Err(e) => {
            REQUESTS_COUNTER.with_label_values(&[op.as_str(), "error"]).inc();
            e.into_response()
        }
    }
}

/// Serialize `body` and mark it successful.
fn ok_with<T: Serialize>(body: &T) -> Result<Value, ApiError> {
    let mut value = serde_json::to_value(body).map_err(|e| ApiError::Internal(e.to_string()))?;
    if let Value::Object(map) = &mut value {
        map.insert("ok".into(), Value::Bool(true));
    }
    Ok(value)
}

fn audit(state: &AppState, action: &'static str, site_slug: &str, detail: String) {
    audit::log(
        state.store.clone(),
        AuditEntry {
            action,
            site_slug: site_slug.to_string(),
            detail,
        },
    );
}

async fn dispatch(
    state: &AppState,
    op: Operation,
    admin_header: Option<String>,
    site_header: Option<String>,
    req: StoreRequest,
) -> Result<Value, ApiError> {
    let store = state.store.as_ref();
    let config = state.config.as_ref();
    let text = |field: &Option<String>| non_empty(field).unwrap_or("").to_string();
    let require_admin = || {
        let presented = non_empty(&req.admin_token).or(admin_header.as_deref());
        verify_admin_token(&config.admin_token, presented)
    };

    match op {
        Operation::Validate => {
            let errors = TenantService::validate(store, &text(&req.site_slug), non_empty(&req.cpf)).await?;
            Ok(json!({ "ok": errors.is_empty(), "errors": errors }))
        }

        Operation::Signup => {
            let (slug, email, name, phone, plan, cpf, preapproval_id) = (
                text(&req.site_slug),
                text(&req.email),
                text(&req.name),
                text(&req.phone),
                text(&req.plan),
                text(&req.cpf),
                text(&req.preapproval_id),
            );
            let signup = TenantService::signup(
                store,
                NewSignup {
                    site_slug: &slug,
                    email: &email,
                    name: &name,
                    phone: &phone,
                    plan: &plan,
                    cpf: &cpf,
                    preapproval_id: &preapproval_id,
                },
            )
            .await?;
            audit(state, "signup", &signup.site_slug, signup.email.clone());
            Ok(json!({ "ok": true, "siteSlug": signup.site_slug }))
        }

        Operation::AdminSet => {
            require_admin()?;
            let block = req.block.as_ref().ok_or(ApiError::MissingParams)?.as_bool();
            let signup = TenantService::set_manual_block(store, &text(&req.site_slug), block).await?;
            audit(state, "admin_set", &signup.site_slug, format!("manual_block={block}"));
            Ok(json!({ "ok": true, "siteSlug": signup.site_slug, "manual_block": signup.manual_block }))
        }

        Operation::AdminRename => {
            require_admin()?;
            let old = normalize_slug(&text(&req.site_slug));
            let signup = TenantService::rename(store, &old, &text(&req.new_slug)).await?;
            audit(state, "admin_rename", &signup.site_slug, format!("from={old}"));
            Ok(json!({ "ok": true, "siteSlug": signup.site_slug }))
        }

        Operation::UserSetPassword => {
            require_admin()?;
            let user = CredentialService::set_password(
                store,
                config.bcrypt_cost,
                &text(&req.email),
                req.password.as_deref().unwrap_or(""),
                &text(&req.role),
                &text(&req.site_slug),
            )
            .await?;
            audit(state, "user_set_password", &user.site_slug, user.email.clone());
            Ok(json!({
                "ok": true,
                "email": user.email,
                "role": user.role.to_string(),
                "siteSlug": user.site_slug,
            }))
        }

        Operation::UserLogin => {
            let email = text(&req.email).to_lowercase();
            let key = format!("rate:login:{email}");
            check_rate_limit(state.redis.as_ref(), &key, 5, 900).await?;
            let user = CredentialService::login(store, &email, req.password.as_deref().unwrap_or("")).await?;
            Ok(json!({ "ok": true, "email": user.email }))
        }

        Operation::PasswordResetRequest => {
            let email = text(&req.email).to_lowercase();
            let key = format!("rate:reset:{email}");
            check_rate_limit(state.redis.as_ref(), &key, 3, 3600).await?;
            CredentialService::request_password_reset(store, state.email.clone(), &config.app_base_url, &email)
                .await?;
            Ok(json!({ "ok": true }))
        }

        Operation::PasswordResetConfirm => {
            let email = text(&req.email);
            CredentialService::confirm_password_reset(
                store,
                config.bcrypt_cost,
                &email,
                &text(&req.token),
                req.password.as_deref().unwrap_or(""),
            )
            .await?;
            audit(state, "password_reset_confirm", "", email.to_lowercase());
            Ok(json!({ "ok": true }))
        }

        Operation::ClientBilling => {
            let billing = BillingService::for_user(store, &text(&req.email)).await?;
            ok_with(&billing)
        }

        Operation::GetStatus => {
            let slug = non_empty(&req.site_slug)
                .map(normalize_slug)
                .or(site_header)
                .ok_or(ApiError::MissingSiteSlugHeader)?;
            let status = TenantService::status(store, &slug).await?;
            ok_with(&status)
        }

        Operation::OnboardingSubmit => {
            let refs = PaymentRefs {
                payment_id: non_empty(&req.payment_id),
                preapproval_id: non_empty(&req.preapproval_id),
            };
            let signup = AccessGate::submit_onboarding(
                store,
                &config.onboarding,
                &text(&req.site_slug),
                refs,
                &text(&req.email),
            )
            .await?;
            audit(state, "onboarding_submit", &signup.site_slug, signup.onboarding_email.clone());
            Ok(json!({ "ok": true, "siteSlug": signup.site_slug }))
        }
    }
}

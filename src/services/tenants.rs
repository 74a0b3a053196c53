use chrono::Utc;
use serde::Serialize;

use crate::{
    db::{
        fields,
        schema::{SIGNUPS, USERS},
        Precondition, Row, StoreError, TableStore,
    },
    error::ApiError,
    models::{
        format_timestamp,
        tenant::{signup_key, SignupRecord},
        user::{user_key, Role, UserCredential},
    },
    services::{
        access::{AccessGate, TenantState},
        metrics::CAS_CONFLICTS_COUNTER,
        update_with_retry, MAX_CAS_ATTEMPTS,
        validation::{
            cpf_digits, is_valid_cpf, normalize_slug, slug_format_errors, CPF_INVALID, SLUG_TAKEN,
        },
    },
};

/// Input of a self-service signup.
#[derive(Debug, Clone, Default)]
pub struct NewSignup<'a> {
    pub site_slug: &'a str,
    pub email: &'a str,
    pub name: &'a str,
    pub phone: &'a str,
    pub plan: &'a str,
    pub cpf: &'a str,
    pub preapproval_id: &'a str,
}

/// Response body of `get_status`.
#[derive(Debug, Clone, Serialize)]
pub struct SiteStatus {
    pub active: bool,
    #[serde(rename = "manualBlock")]
    pub manual_block: bool,
    pub status: String,
    pub state: TenantState,
    pub preapproval_id: String,
    pub email: String,
    #[serde(rename = "updatedAt")]
    pub updated_at: String,
}

pub struct TenantService;

impl TenantService {
    /// Itemized validation of a prospective slug and CPF. Never fails on bad
    /// input; only store errors are returned as `Err`.
    pub async fn validate(
        store: &dyn TableStore,
        site_slug: &str,
        cpf: Option<&str>,
    ) -> Result<Vec<&'static str>, ApiError> {
        let slug = normalize_slug(site_slug);
        let mut errors = slug_format_errors(&slug);

        if errors.is_empty() && Self::slug_taken(store, &slug).await? {
            errors.push(SLUG_TAKEN);
        }
        if cpf.is_some_and(|c| !c.trim().is_empty() && !is_valid_cpf(c)) {
            errors.push(CPF_INVALID);
        }
        Ok(errors)
    }

    async fn slug_taken(store: &dyn TableStore, slug: &str) -> Result<bool, ApiError> {
        let rows = store.scan_all(SIGNUPS.name).await?;
        Ok(rows.iter().any(|row| normalize_slug(row.get("site_slug")) == slug))
    }

    /// Register a new site and the owner's (password-less) client credential.
    /// Two racing signups for one slug cannot both succeed.
    pub async fn signup(store: &dyn TableStore, input: NewSignup<'_>) -> Result<SignupRecord, ApiError> {
        let cpf = Some(input.cpf).filter(|c| !c.trim().is_empty());
        let errors = Self::validate(store, input.site_slug, cpf).await?;
        if !errors.is_empty() {
            return Err(ApiError::Validation(errors));
        }
        let email = input.email.trim().to_lowercase();
        if email.is_empty() {
            return Err(ApiError::MissingEmail);
        }

        let slug = normalize_slug(input.site_slug);
        let now = format_timestamp(Utc::now());
        let row = fields([
            ("email", email.clone()),
            ("name", input.name.trim().to_string()),
            ("phone", input.phone.trim().to_string()),
            ("plan", input.plan.trim().to_string()),
            ("cpf", cpf_digits(input.cpf)),
            ("preapproval_id", input.preapproval_id.trim().to_string()),
            ("status", "pending".to_string()),
            ("status_at", now.clone()),
            ("manual_block", "false".to_string()),
            ("created_at", now.clone()),
            ("updated_at", now.clone()),
        ]);

        let signup = match store
            .upsert(SIGNUPS.name, &signup_key(&slug), &row, Precondition::Absent)
            .await
        {
            Ok(row) => SignupRecord::from_row(&row),
            Err(StoreError::Conflict { .. }) => return Err(ApiError::Validation(vec![SLUG_TAKEN])),
            Err(e) => return Err(e.into()),
        };

        let credential = fields([
            ("site_slug", slug.clone()),
            ("role", Role::Client.to_string()),
            ("plan", input.plan.trim().to_string()),
            ("created_at", now.clone()),
            ("updated_at", now),
        ]);
        match store
            .upsert(USERS.name, &user_key(&email), &credential, Precondition::Absent)
            .await
        {
            Ok(_) => {}
            Err(StoreError::Conflict { .. }) => {
                tracing::debug!("signup for {slug}: credential for {email} already exists");
            }
            Err(e) => return Err(e.into()),
        }

        tracing::info!("new site signup: {slug}");
        Ok(signup)
    }

    pub async fn set_manual_block(
        store: &dyn TableStore,
        site_slug: &str,
        block: bool,
    ) -> Result<SignupRecord, ApiError> {
        let slug = normalize_slug(site_slug);
        if slug.is_empty() {
            return Err(ApiError::MissingSite);
        }
        let now = format_timestamp(Utc::now());
        let row = update_with_retry(store, SIGNUPS.name, &signup_key(&slug), ApiError::SiteNotFound, |_| {
            Ok(fields([
                ("manual_block", if block { "true" } else { "false" }),
                ("updated_at", now.as_str()),
            ]))
        })
        .await?;

        tracing::info!("site {slug} manual_block set to {block}");
        Ok(SignupRecord::from_row(&row))
    }

    /// Move a site to a new slug and re-point its credentials. The new slug is
    /// claimed atomically with the move of the signup row, so a racing rename
    /// or signup onto the same slug loses with `slug_taken`. Credential rows
    /// are updated afterwards one by one; a failure part-way leaves the
    /// already-moved rows in place.
    pub async fn rename(
        store: &dyn TableStore,
        site_slug: &str,
        new_slug: &str,
    ) -> Result<SignupRecord, ApiError> {
        let old = normalize_slug(site_slug);
        if old.is_empty() {
            return Err(ApiError::MissingSite);
        }
        let current = store
            .get(SIGNUPS.name, &signup_key(&old))
            .await?
            .ok_or(ApiError::SiteNotFound)?;

        let new = normalize_slug(new_slug);
        if new == old {
            return Ok(SignupRecord::from_row(&current));
        }
        let errors = Self::validate(store, &new, None).await?;
        if !errors.is_empty() {
            return Err(ApiError::Validation(errors));
        }

        let now = format_timestamp(Utc::now());
        let row = Self::claim_slug(store, &old, &new, &now).await?;

        let users = store.scan_all(USERS.name).await?;
        for user in users.iter().map(UserCredential::from_row).filter(|u| u.site_slug == old) {
            update_with_retry(store, USERS.name, &user_key(&user.email), ApiError::NotFound, |row| {
                if normalize_slug(row.get("site_slug")) != old {
                    return Ok(Default::default());
                }
                Ok(fields([("site_slug", new.as_str()), ("updated_at", now.as_str())]))
            })
            .await?;
        }

        tracing::info!("site {old} renamed to {new}");
        Ok(SignupRecord::from_row(&row))
    }

    async fn claim_slug(
        store: &dyn TableStore,
        old: &str,
        new: &str,
        now: &str,
    ) -> Result<Row, ApiError> {
        let key = signup_key(old);
        let patch = fields([("updated_at", now)]);
        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let current = store.get(SIGNUPS.name, &key).await?.ok_or(ApiError::SiteNotFound)?;
            match store.rekey(SIGNUPS.name, &key, new, &patch, current.version).await {
                Ok(row) => return Ok(row),
                Err(StoreError::Conflict { key: taken, .. }) if taken == new => {
                    return Err(ApiError::Validation(vec![SLUG_TAKEN]));
                }
                Err(StoreError::Conflict { .. }) => {
                    CAS_CONFLICTS_COUNTER.with_label_values(&[SIGNUPS.name]).inc();
                    tracing::debug!("write conflict renaming {old} (attempt {attempt})");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(ApiError::Internal(format!("concurrent updates kept conflicting on {old}")))
    }

    pub async fn status(store: &dyn TableStore, site_slug: &str) -> Result<SiteStatus, ApiError> {
        let access = AccessGate::site_access(store, site_slug).await?;
        let signup = access.signup;
        Ok(SiteStatus {
            active: access.state == TenantState::Active,
            manual_block: signup.manual_block,
            status: access.billing.status,
            state: access.state,
            preapproval_id: signup.preapproval_id,
            email: signup.email,
            updated_at: signup.updated_at.map(format_timestamp).unwrap_or_default(),
        })
    }
}

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::{
    config::OnboardingPolicy,
    db::{fields, schema::SIGNUPS, TableStore},
    error::ApiError,
    models::{
        format_timestamp,
        tenant::{signup_key, SignupRecord},
    },
    services::{
        billing::{BillingResolution, BillingService},
        events::EventLog,
        metrics::ONBOARDING_COUNTER,
        update_with_retry,
        validation::normalize_slug,
    },
};

/// Effective access state of a site, recomputed on every read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TenantState {
    Pending,
    Active,
    Lapsed,
    Blocked,
}

impl TenantState {
    pub const ALL: [TenantState; 4] = [
        TenantState::Pending,
        TenantState::Active,
        TenantState::Lapsed,
        TenantState::Blocked,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TenantState::Pending => "pending",
            TenantState::Active => "active",
            TenantState::Lapsed => "lapsed",
            TenantState::Blocked => "blocked",
        }
    }
}

/// A site's signup row together with its reconciled billing.
#[derive(Debug, Clone)]
pub struct SiteAccess {
    pub signup: SignupRecord,
    pub billing: BillingResolution,
    pub state: TenantState,
}

/// Payment references a client may attach to an onboarding submission.
#[derive(Debug, Clone, Copy, Default)]
pub struct PaymentRefs<'a> {
    pub payment_id: Option<&'a str>,
    pub preapproval_id: Option<&'a str>,
}

impl PaymentRefs<'_> {
    fn iter(&self) -> impl Iterator<Item = &str> {
        [self.payment_id, self.preapproval_id]
            .into_iter()
            .flatten()
            .map(str::trim)
            .filter(|r| !r.is_empty())
    }
}

pub struct AccessGate;

impl AccessGate {
    /// Manual block wins over any billing state.
    pub fn state_of(signup: &SignupRecord, billing: &BillingResolution) -> TenantState {
        if signup.manual_block {
            TenantState::Blocked
        } else if billing.is_active() {
            TenantState::Active
        } else if billing.lapsed {
            TenantState::Lapsed
        } else {
            TenantState::Pending
        }
    }

    async fn load_signup(store: &dyn TableStore, slug: &str) -> Result<SignupRecord, ApiError> {
        let slug = normalize_slug(slug);
        if slug.is_empty() {
            return Err(ApiError::MissingSite);
        }
        let row = store
            .get(SIGNUPS.name, &signup_key(&slug))
            .await?
            .ok_or(ApiError::SiteNotFound)?;
        Ok(SignupRecord::from_row(&row))
    }

    pub async fn site_access(store: &dyn TableStore, slug: &str) -> Result<SiteAccess, ApiError> {
        let signup = Self::load_signup(store, slug).await?;
        let billing = BillingService::for_site(store, &signup).await?;
        let state = Self::state_of(&signup, &billing);
        Ok(SiteAccess { signup, billing, state })
    }

    pub async fn tenant_state(store: &dyn TableStore, slug: &str) -> Result<TenantState, ApiError> {
        Ok(Self::site_access(store, slug).await?.state)
    }

    /// Whether the public site may be served. Blocked sites are refused
    /// without touching billing.
    pub async fn is_servable(store: &dyn TableStore, slug: &str) -> Result<bool, ApiError> {
        let signup = Self::load_signup(store, slug).await?;
        if signup.manual_block {
            return Ok(false);
        }
        let billing = BillingService::for_site(store, &signup).await?;
        Ok(Self::state_of(&signup, &billing) == TenantState::Active)
    }

    /// Proof-of-payment gate for onboarding. Every refusal is reported as the
    /// same error; the concrete reason only goes to the log.
    pub async fn can_submit_onboarding(
        store: &dyn TableStore,
        policy: &OnboardingPolicy,
        slug: &str,
        refs: PaymentRefs<'_>,
        email: &str,
    ) -> Result<(), ApiError> {
        if !policy.strict {
            ONBOARDING_COUNTER.with_label_values(&["open"]).inc();
            return Ok(());
        }

        match onboarding_denial(store, policy, slug, refs, email, Utc::now()).await? {
            None => {
                ONBOARDING_COUNTER.with_label_values(&["allowed"]).inc();
                Ok(())
            }
            Some(reason) => {
                ONBOARDING_COUNTER.with_label_values(&["refused"]).inc();
                tracing::info!("onboarding refused for '{}': {reason}", normalize_slug(slug));
                Err(ApiError::ForbiddenOnboarding)
            }
        }
    }

    /// Run the gate and record who completed onboarding for the site.
    pub async fn submit_onboarding(
        store: &dyn TableStore,
        policy: &OnboardingPolicy,
        slug: &str,
        refs: PaymentRefs<'_>,
        email: &str,
    ) -> Result<SignupRecord, ApiError> {
        let signup = Self::load_signup(store, slug).await?;
        Self::can_submit_onboarding(store, policy, &signup.site_slug, refs, email).await?;

        let email = email.trim().to_lowercase();
        let now = format_timestamp(Utc::now());
        let row = update_with_retry(
            store,
            SIGNUPS.name,
            &signup_key(&signup.site_slug),
            ApiError::SiteNotFound,
            |_| {
                Ok(fields([
                    ("onboarding_email", email.as_str()),
                    ("onboarding_done_at", now.as_str()),
                    ("updated_at", now.as_str()),
                ]))
            },
        )
        .await?;
        Ok(SignupRecord::from_row(&row))
    }
}

async fn onboarding_denial(
    store: &dyn TableStore,
    policy: &OnboardingPolicy,
    slug: &str,
    refs: PaymentRefs<'_>,
    email: &str,
    now: DateTime<Utc>,
) -> Result<Option<&'static str>, ApiError> {
    let email = email.trim().to_lowercase();

    if refs.iter().next().is_some() {
        let mut paid = false;
        for reference in refs.iter() {
            let events = EventLog::active_by_reference(store, reference).await?;
            paid = events
                .iter()
                .any(|e| !policy.require_payer_match || (!email.is_empty() && e.payer_email == email));
            if paid {
                break;
            }
        }
        if !paid {
            return Ok(Some(if policy.require_payer_match {
                "no active payment for the reference and payer"
            } else {
                "no active payment for the reference"
            }));
        }
        return Ok(None);
    }

    if email.is_empty() {
        return Ok(Some("no payment reference and no email"));
    }
    let since = now - Duration::days(policy.window_days);
    if EventLog::active_for_email_since(store, &email, since).await?.is_empty() {
        return Ok(Some("no recent active payment for the email"));
    }

    if policy.unique_email {
        let slug = normalize_slug(slug);
        let rows = store.scan_all(SIGNUPS.name).await?;
        let elsewhere = rows
            .iter()
            .map(SignupRecord::from_row)
            .any(|s| s.site_slug != slug && s.onboarding_email == email && s.onboarding_done_at.is_some());
        if elsewhere {
            return Ok(Some("email already completed onboarding for another site"));
        }
    }

    Ok(None)
}

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::{
    db::{
        schema::{SIGNUPS, USERS},
        Fields, Precondition, StoreError, TableStore,
    },
    error::ApiError,
    models::{
        format_timestamp,
        payment::{is_active_status, PaymentEvent},
        tenant::{signup_key, Plan, SignupRecord},
        user::{user_key, UserCredential},
    },
    services::{
        events::{self, EventLog},
        metrics::{CAS_CONFLICTS_COUNTER, RECONCILIATIONS_COUNTER},
        MAX_CAS_ATTEMPTS,
    },
};

pub const RENEWAL_INTERVAL_DAYS: i64 = 30;
pub const GRACE_DAYS: i64 = 3;
/// When true the grace sweep sets `manual_block` on lapsed sites.
pub const AUTO_BLOCK_OVER_GRACE: bool = false;

pub const PENDING: &str = "pending";
pub const DEFAULT_CURRENCY: &str = "BRL";
pub const DEFAULT_PROVIDER: &str = "mercadopago";

/// Which signal decided a resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingSource {
    Cached,
    Signup,
    EventLog,
    None,
}

impl BillingSource {
    pub fn as_str(self) -> &'static str {
        match self {
            BillingSource::Cached => "cached",
            BillingSource::Signup => "signup",
            BillingSource::EventLog => "event_log",
            BillingSource::None => "none",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BillingResolution {
    pub status: String,
    pub source: BillingSource,
    pub next_renewal: DateTime<Utc>,
    /// Active signal whose renewal date plus grace is already past.
    pub lapsed: bool,
}

impl BillingResolution {
    pub fn is_active(&self) -> bool {
        is_active_status(&self.status) && !self.lapsed
    }
}

fn interval() -> Duration {
    Duration::days(RENEWAL_INTERVAL_DAYS)
}

fn is_lapsed(next: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    now > next + Duration::days(GRACE_DAYS)
}

fn later(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    }
}

fn resolution(status: &str, source: BillingSource, next: DateTime<Utc>, now: DateTime<Utc>) -> BillingResolution {
    BillingResolution {
        status: status.to_string(),
        source,
        next_renewal: next,
        lapsed: is_lapsed(next, now),
    }
}

/// Renewal date implied by the signup row: the cached date or thirty days
/// after the status itself was written, whichever is later. `updated_at`
/// moves on blocks, renames and onboarding and says nothing about payment.
fn signup_next(user: &UserCredential, signup: &SignupRecord) -> Option<DateTime<Utc>> {
    later(user.billing_next, signup.status_at.map(|at| at + interval()))
}

/// Cache-level steps. Returns a fresh active resolution from the credential
/// row or the signup row, or `None` when the event log must be consulted.
pub fn resolve_cached(
    user: &UserCredential,
    signup: Option<&SignupRecord>,
    now: DateTime<Utc>,
) -> Option<BillingResolution> {
    if is_active_status(&user.billing_status) {
        let next = user.billing_next.unwrap_or(now + interval());
        let cached = resolution(&user.billing_status, BillingSource::Cached, next, now);
        if !cached.lapsed {
            return Some(cached);
        }
    }

    let signup = signup.filter(|s| is_active_status(&s.status))?;
    let next = signup_next(user, signup).unwrap_or(now + interval());
    let derived = resolution(&signup.status, BillingSource::Signup, next, now);
    (!derived.lapsed).then_some(derived)
}

/// Event-log and default steps, run once the caches had nothing fresh.
pub fn resolve_fallback(
    user: &UserCredential,
    signup: Option<&SignupRecord>,
    event: Option<&PaymentEvent>,
    now: DateTime<Utc>,
) -> BillingResolution {
    if let Some(event) = event {
        let paid_at = event.timestamp.unwrap_or(now);
        let next = later(user.billing_next, Some(paid_at + interval())).unwrap_or(paid_at + interval());
        return resolution(&event.status, BillingSource::EventLog, next, now);
    }

    // Stale active caches with nothing newer behind them are lapsed.
    if is_active_status(&user.billing_status) {
        let next = user.billing_next.unwrap_or(now + interval());
        return resolution(&user.billing_status, BillingSource::Cached, next, now);
    }
    if let Some(signup) = signup.filter(|s| is_active_status(&s.status)) {
        let next = signup_next(user, signup).unwrap_or(now + interval());
        return resolution(&signup.status, BillingSource::Signup, next, now);
    }

    BillingResolution {
        status: PENDING.to_string(),
        source: BillingSource::None,
        next_renewal: user.billing_next.unwrap_or(now + interval()),
        lapsed: false,
    }
}

/// Full precedence over already-loaded inputs.
pub fn reconcile(
    user: &UserCredential,
    signup: Option<&SignupRecord>,
    events: &[PaymentEvent],
    now: DateTime<Utc>,
) -> BillingResolution {
    resolve_cached(user, signup, now).unwrap_or_else(|| {
        let preapproval_id = signup.map(|s| s.preapproval_id.as_str()).unwrap_or("");
        let event = events::latest_active(events, &user.email, preapproval_id);
        resolve_fallback(user, signup, event, now)
    })
}

/// Columns of the credential row that differ from `resolution`. Amount,
/// currency and provider are only filled in when empty.
pub fn cache_patch(
    user: &UserCredential,
    signup: Option<&SignupRecord>,
    resolution: &BillingResolution,
    now: DateTime<Utc>,
) -> Fields {
    let mut patch = Fields::new();
    let mut set = |column: &str, value: String| {
        patch.insert(column.to_string(), value);
    };

    if user.billing_status != resolution.status {
        set("billing_status", resolution.status.clone());
    }
    let next = format_timestamp(resolution.next_renewal);
    if user.billing_next.map(format_timestamp).as_deref() != Some(next.as_str()) {
        set("billing_next", next);
    }

    let plan = plan_label(user, signup);
    if user.plan.is_empty() && !plan.is_empty() {
        set("plan", plan.to_string());
    }
    if user.billing_amount.is_empty() {
        set("billing_amount", Plan::from_label(plan).default_amount().to_string());
    }
    if user.billing_currency.is_empty() {
        set("billing_currency", DEFAULT_CURRENCY.to_string());
    }
    if user.billing_provider.is_empty() {
        set("billing_provider", DEFAULT_PROVIDER.to_string());
    }

    if !patch.is_empty() {
        patch.insert("updated_at".into(), format_timestamp(now));
    }
    patch
}

fn plan_label<'a>(user: &'a UserCredential, signup: Option<&'a SignupRecord>) -> &'a str {
    if !user.plan.is_empty() {
        &user.plan
    } else {
        signup.map(|s| s.plan.as_str()).unwrap_or("")
    }
}

/// Response body of `client_billing`.
#[derive(Debug, Clone, Serialize)]
pub struct ClientBilling {
    pub plan: String,
    pub status: String,
    pub provider: String,
    pub next_renewal: String,
    pub amount: String,
    pub currency: String,
}

impl ClientBilling {
    fn new(user: &UserCredential, signup: Option<&SignupRecord>, resolution: &BillingResolution) -> Self {
        let plan = plan_label(user, signup);
        let or = |value: &str, default: &str| {
            if value.is_empty() { default.to_string() } else { value.to_string() }
        };
        Self {
            plan: plan.to_string(),
            status: resolution.status.clone(),
            provider: or(&user.billing_provider, DEFAULT_PROVIDER),
            next_renewal: format_timestamp(resolution.next_renewal),
            amount: or(&user.billing_amount, Plan::from_label(plan).default_amount()),
            currency: or(&user.billing_currency, DEFAULT_CURRENCY),
        }
    }
}

pub struct BillingService;

impl BillingService {
    /// Billing summary for a credential holder.
    pub async fn for_user(store: &dyn TableStore, email: &str) -> Result<ClientBilling, ApiError> {
        if email.trim().is_empty() {
            return Err(ApiError::MissingEmail);
        }
        let Some(row) = store.get(USERS.name, &user_key(email)).await? else {
            return Err(ApiError::NotFound);
        };
        let user = UserCredential::from_row(&row);

        let signup = if user.site_slug.is_empty() {
            None
        } else {
            store
                .get(SIGNUPS.name, &signup_key(&user.site_slug))
                .await?
                .map(|row| SignupRecord::from_row(&row))
        };

        let (user, resolution) = Self::reconcile_and_cache(store, &user.email, signup.as_ref()).await?;
        Ok(ClientBilling::new(&user, signup.as_ref(), &resolution))
    }

    /// Resolution for a site, keyed by the owner email on its signup row.
    pub async fn for_site(store: &dyn TableStore, signup: &SignupRecord) -> Result<BillingResolution, ApiError> {
        let (_, resolution) = Self::reconcile_and_cache(store, &signup.email, Some(signup)).await?;
        Ok(resolution)
    }

    /// Resolve and write the result back to the credential row. The event
    /// log is read only when the cached signals are not enough. On repeated
    /// write conflicts the last resolution is returned uncached.
    async fn reconcile_and_cache(
        store: &dyn TableStore,
        email: &str,
        signup: Option<&SignupRecord>,
    ) -> Result<(UserCredential, BillingResolution), ApiError> {
        let now = Utc::now();
        let key = user_key(email);
        let mut last = None;

        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let stored = if key.normalized().is_empty() {
                None
            } else {
                store.get(USERS.name, &key).await?.map(|row| UserCredential::from_row(&row))
            };
            let user = stored.clone().unwrap_or_else(|| {
                UserCredential::placeholder(email, signup.map(|s| s.site_slug.as_str()).unwrap_or(""))
            });

            let resolution = match resolve_cached(&user, signup, now) {
                Some(resolution) => resolution,
                None => {
                    let preapproval_id = signup.map(|s| s.preapproval_id.as_str()).unwrap_or("");
                    let event = EventLog::latest_active(store, &user.email, preapproval_id).await?;
                    resolve_fallback(&user, signup, event.as_ref(), now)
                }
            };
            RECONCILIATIONS_COUNTER
                .with_label_values(&[resolution.source.as_str()])
                .inc();

            // Sites without a credential row have nowhere to cache.
            if stored.is_none() {
                return Ok((user, resolution));
            }

            let patch = cache_patch(&user, signup, &resolution, now);
            if patch.is_empty() {
                return Ok((user, resolution));
            }

            match store
                .upsert(USERS.name, &key, &patch, Precondition::Version(user.version))
                .await
            {
                Ok(row) => return Ok((UserCredential::from_row(&row), resolution)),
                Err(StoreError::Conflict { .. }) => {
                    CAS_CONFLICTS_COUNTER.with_label_values(&[USERS.name]).inc();
                    tracing::debug!("billing cache conflict for {} (attempt {attempt})", user.email);
                    last = Some((user, resolution));
                }
                Err(e) => return Err(e.into()),
            }
        }

        tracing::warn!(
            "billing cache for {email} kept conflicting after {MAX_CAS_ATTEMPTS} attempts; serving uncached result"
        );
        last.ok_or_else(|| ApiError::Internal("billing reconciliation made no attempt".into()))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use async_trait::async_trait;
    use chrono::TimeZone;

    use super::*;
    use crate::db::{
        fields,
        schema::{ensure_schema, PAYMENT_EVENTS},
        Key, MemoryTableStore, Row, StoreResult,
    };

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 12, 0, 0).unwrap()
    }

    fn user(status: &str, next: Option<DateTime<Utc>>) -> UserCredential {
        let mut user = UserCredential::placeholder("dono@acme.com", "ACME");
        user.billing_status = status.into();
        user.billing_next = next;
        user
    }

    fn signup(status: &str, status_at: Option<DateTime<Utc>>) -> SignupRecord {
        SignupRecord {
            site_slug: "ACME".into(),
            email: "dono@acme.com".into(),
            name: String::new(),
            phone: String::new(),
            plan: "VIP".into(),
            cpf: String::new(),
            preapproval_id: "pre-1".into(),
            status: status.into(),
            status_at,
            manual_block: false,
            onboarding_email: String::new(),
            onboarding_done_at: None,
            created_at: None,
            updated_at: None,
            version: 1,
        }
    }

    fn event(paid: DateTime<Utc>, status: &str, email: &str, pre: &str) -> PaymentEvent {
        PaymentEvent {
            timestamp: Some(paid),
            action: "payment.updated".into(),
            payment_id: "pay-1".into(),
            preapproval_id: pre.into(),
            status: status.into(),
            payer_email: email.into(),
            amount: "99.90".into(),
        }
    }

    #[test]
    fn fresh_cached_status_wins_over_everything() {
        let now = at(2025, 3, 10);
        let u = user("authorized", Some(at(2025, 3, 20)));
        let events = vec![event(at(2025, 3, 9), "approved", "dono@acme.com", "")];
        let r = reconcile(&u, Some(&signup("pending", None)), &events, now);
        assert_eq!(r.source, BillingSource::Cached);
        assert_eq!(r.status, "authorized");
        assert!(r.is_active());
    }

    #[test]
    fn signup_status_is_second() {
        let now = at(2025, 3, 10);
        let r = reconcile(&user("", None), Some(&signup("approved", Some(at(2025, 3, 1)))), &[], now);
        assert_eq!(r.source, BillingSource::Signup);
        assert_eq!(r.next_renewal, at(2025, 3, 31));
        assert!(r.is_active());
    }

    #[test]
    fn row_edits_do_not_extend_a_signup_status() {
        let now = at(2025, 3, 10);
        let mut s = signup("approved", Some(at(2025, 1, 1)));
        s.updated_at = Some(at(2025, 3, 9));
        let r = reconcile(&user("", Some(at(2025, 1, 31))), Some(&s), &[], now);
        assert_eq!(r.source, BillingSource::Signup);
        assert_eq!(r.next_renewal, at(2025, 1, 31));
        assert!(r.lapsed);

        // Without a status timestamp only the cached date counts.
        s.status_at = None;
        let r = reconcile(&user("", Some(at(2025, 1, 31))), Some(&s), &[], now);
        assert_eq!(r.next_renewal, at(2025, 1, 31));
        assert!(r.lapsed);
    }

    #[test]
    fn event_log_sets_next_renewal_from_payment_date() {
        let now = at(2025, 3, 10);
        let events = vec![
            event(at(2025, 2, 1), "approved", "dono@acme.com", ""),
            event(at(2025, 3, 1), "authorized", "", "pre-1"),
        ];
        let r = reconcile(&user("", None), Some(&signup("", None)), &events, now);
        assert_eq!(r.source, BillingSource::EventLog);
        assert_eq!(r.status, "authorized");
        assert_eq!(r.next_renewal, at(2025, 3, 31));
        assert!(r.is_active());
    }

    #[test]
    fn nothing_active_is_pending() {
        let now = at(2025, 3, 10);
        let events = vec![event(at(2025, 3, 1), "rejected", "dono@acme.com", "")];
        let r = reconcile(&user("", None), None, &events, now);
        assert_eq!(r.status, PENDING);
        assert_eq!(r.source, BillingSource::None);
        assert_eq!(r.next_renewal, now + Duration::days(30));
        assert!(!r.is_active());
        assert!(!r.lapsed);
    }

    #[test]
    fn stale_cache_without_newer_payment_is_lapsed() {
        let now = at(2025, 3, 10);
        // next + grace = Mar 6, already past
        let r = reconcile(&user("approved", Some(at(2025, 3, 3))), None, &[], now);
        assert_eq!(r.source, BillingSource::Cached);
        assert!(r.lapsed);
        assert!(!r.is_active());
    }

    #[test]
    fn grace_period_keeps_the_site_active() {
        let now = at(2025, 3, 10);
        // next + grace = Mar 11
        let r = reconcile(&user("approved", Some(at(2025, 3, 8))), None, &[], now);
        assert!(r.is_active());
    }

    #[test]
    fn stale_cache_is_refreshed_by_a_newer_payment() {
        let now = at(2025, 3, 10);
        let events = vec![event(at(2025, 3, 5), "approved", "dono@acme.com", "")];
        let r = reconcile(&user("approved", Some(at(2025, 2, 1))), None, &events, now);
        assert_eq!(r.source, BillingSource::EventLog);
        assert_eq!(r.next_renewal, at(2025, 4, 4));
        assert!(r.is_active());
    }

    #[test]
    fn an_older_payment_never_shortens_the_cached_renewal() {
        let now = at(2025, 3, 10);
        let events = vec![event(at(2025, 3, 1), "approved", "dono@acme.com", "")];
        let r = reconcile(&user("cancelled", Some(at(2025, 4, 20))), None, &events, now);
        assert_eq!(r.source, BillingSource::EventLog);
        assert_eq!(r.next_renewal, at(2025, 4, 20));
    }

    #[test]
    fn patch_fills_defaults_once() {
        let now = at(2025, 3, 10);
        let u = user("", None);
        let s = signup("approved", Some(at(2025, 3, 1)));
        let r = reconcile(&u, Some(&s), &[], now);
        let patch = cache_patch(&u, Some(&s), &r, now);
        assert_eq!(patch["billing_status"], "approved");
        assert_eq!(patch["billing_amount"], "99.90");
        assert_eq!(patch["billing_currency"], "BRL");
        assert_eq!(patch["billing_provider"], "mercadopago");
        assert_eq!(patch["plan"], "VIP");

        let mut cached = u.clone();
        cached.billing_status = "approved".into();
        cached.billing_next = Some(r.next_renewal);
        cached.plan = "VIP".into();
        cached.billing_amount = "120.00".into();
        cached.billing_currency = "BRL".into();
        cached.billing_provider = "mercadopago".into();
        assert!(cache_patch(&cached, Some(&s), &r, now).is_empty());
    }

    /// Memory store that counts scans of the payment event table.
    struct CountingStore {
        inner: MemoryTableStore,
        event_scans: AtomicUsize,
    }

    #[async_trait]
    impl TableStore for CountingStore {
        async fn ensure_column(&self, table: &str, column: &str) -> StoreResult<()> {
            self.inner.ensure_column(table, column).await
        }
        async fn columns(&self, table: &str) -> StoreResult<Vec<String>> {
            self.inner.columns(table).await
        }
        async fn get(&self, table: &str, key: &Key) -> StoreResult<Option<Row>> {
            self.inner.get(table, key).await
        }
        async fn upsert(&self, table: &str, key: &Key, fields: &Fields, precondition: Precondition) -> StoreResult<Row> {
            self.inner.upsert(table, key, fields, precondition).await
        }
        async fn rekey(&self, table: &str, key: &Key, new_value: &str, fields: &Fields, version: i64) -> StoreResult<Row> {
            self.inner.rekey(table, key, new_value, fields, version).await
        }
        async fn append(&self, table: &str, fields: &Fields) -> StoreResult<Row> {
            self.inner.append(table, fields).await
        }
        async fn scan_all(&self, table: &str) -> StoreResult<Vec<Row>> {
            if table == PAYMENT_EVENTS.name {
                self.event_scans.fetch_add(1, Ordering::SeqCst);
            }
            self.inner.scan_all(table).await
        }
        async fn ping(&self) -> StoreResult<()> {
            self.inner.ping().await
        }
    }

    async fn counting_store() -> Arc<CountingStore> {
        let store = Arc::new(CountingStore {
            inner: MemoryTableStore::new(false),
            event_scans: AtomicUsize::new(0),
        });
        ensure_schema(store.as_ref()).await.unwrap();
        store
    }

    #[tokio::test]
    async fn fresh_cache_skips_the_event_log() {
        let store = counting_store().await;
        let next = format_timestamp(Utc::now() + Duration::days(10));
        store
            .upsert(
                USERS.name,
                &user_key("dono@acme.com"),
                &fields([("billing_status", "approved"), ("billing_next", next.as_str())]),
                Precondition::Absent,
            )
            .await
            .unwrap();

        let billing = BillingService::for_user(store.as_ref(), "dono@acme.com").await.unwrap();
        assert_eq!(billing.status, "approved");
        assert_eq!(store.event_scans.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn event_log_result_is_cached_on_the_user_row() {
        let store = counting_store().await;
        store
            .upsert(
                USERS.name,
                &user_key("dono@acme.com"),
                &fields([("site_slug", "ACME"), ("plan", "essencial")]),
                Precondition::Absent,
            )
            .await
            .unwrap();
        let paid = format_timestamp(Utc::now() - Duration::days(2));
        store
            .append(
                PAYMENT_EVENTS.name,
                &fields([("timestamp", paid.as_str()), ("status", "approved"), ("payer_email", "Dono@Acme.com")]),
            )
            .await
            .unwrap();

        let first = BillingService::for_user(store.as_ref(), "dono@acme.com").await.unwrap();
        assert_eq!(first.status, "approved");
        assert_eq!(first.amount, "49.90");
        assert_eq!(first.currency, "BRL");
        assert_eq!(store.event_scans.load(Ordering::SeqCst), 1);

        let row = store.get(USERS.name, &user_key("dono@acme.com")).await.unwrap().unwrap();
        assert_eq!(row.get("billing_status"), "approved");
        assert_eq!(row.get("billing_next"), first.next_renewal);

        // Second read is served from the cache.
        let second = BillingService::for_user(store.as_ref(), "dono@acme.com").await.unwrap();
        assert_eq!(second.next_renewal, first.next_renewal);
        assert_eq!(store.event_scans.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unknown_user_is_not_found() {
        let store = MemoryTableStore::new(false);
        ensure_schema(&store).await.unwrap();
        let err = BillingService::for_user(&store, "ghost@acme.com").await.unwrap_err();
        assert_eq!(err, ApiError::NotFound);
        let err = BillingService::for_user(&store, "  ").await.unwrap_err();
        assert_eq!(err, ApiError::MissingEmail);
    }

    #[tokio::test]
    async fn site_without_credential_row_still_resolves() {
        let store = MemoryTableStore::new(false);
        ensure_schema(&store).await.unwrap();
        store
            .append(
                PAYMENT_EVENTS.name,
                &fields([
                    ("timestamp", format_timestamp(Utc::now()).as_str()),
                    ("status", "authorized"),
                    ("preapproval_id", "pre-1"),
                ]),
            )
            .await
            .unwrap();

        let mut s = signup("", None);
        s.email = String::new();
        let r = BillingService::for_site(&store, &s).await.unwrap();
        assert!(r.is_active());
        assert!(store.scan_all(USERS.name).await.unwrap().is_empty());
        assert!(store.scan_all(SIGNUPS.name).await.unwrap().is_empty());
    }
}

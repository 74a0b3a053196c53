use std::{collections::HashMap, sync::Arc};

use chrono::{Local, Timelike};
use tracing::{info, warn};

use crate::{
    db::{schema::SIGNUPS, TableStore},
    error::ApiError,
    models::tenant::SignupRecord,
    services::{
        access::{AccessGate, TenantState},
        billing::{BillingService, AUTO_BLOCK_OVER_GRACE},
        email::EmailService,
        metrics::SITES_GAUGE,
        tenants::TenantService,
    },
};

/// Hour (local time) at which the daily sweep runs.
const SWEEP_HOUR: u32 = 6;

/// Outcome of one pass over every site.
#[derive(Debug, Default)]
pub struct SweepReport {
    pub counts: HashMap<TenantState, usize>,
    pub lapsed: Vec<String>,
    pub blocked: Vec<String>,
}

/// Reconcile every site, list the ones past their grace period and, when
/// `auto_block` is set, block them. Per-site failures are logged and skipped.
pub async fn sweep(store: &dyn TableStore, auto_block: bool) -> Result<SweepReport, ApiError> {
    let rows = store.scan_all(SIGNUPS.name).await?;
    let mut report = SweepReport::default();

    for signup in rows.iter().map(SignupRecord::from_row) {
        if signup.site_slug.is_empty() {
            continue;
        }
        let billing = match BillingService::for_site(store, &signup).await {
            Ok(b) => b,
            Err(e) => {
                warn!("Grace sweep: reconciliation failed for '{}': {e}", signup.site_slug);
                continue;
            }
        };

        let state = AccessGate::state_of(&signup, &billing);
        *report.counts.entry(state).or_default() += 1;
        if state != TenantState::Lapsed {
            continue;
        }

        warn!(
            "Grace sweep: '{}' lapsed (renewal was due {})",
            signup.site_slug, billing.next_renewal
        );
        report.lapsed.push(signup.site_slug.clone());

        if auto_block {
            match TenantService::set_manual_block(store, &signup.site_slug, true).await {
                Ok(_) => report.blocked.push(signup.site_slug.clone()),
                Err(e) => warn!("Grace sweep: could not block '{}': {e}", signup.site_slug),
            }
        }
    }

    for state in TenantState::ALL {
        let n = report.counts.get(&state).copied().unwrap_or(0);
        SITES_GAUGE.with_label_values(&[state.as_str()]).set(n as f64);
    }
    Ok(report)
}

/// Spawn a background task that wakes up daily at SWEEP_HOUR and blocks
/// sites past their grace period. Does nothing unless auto-block is on.
pub fn start(store: Arc<dyn TableStore>, email: Option<Arc<EmailService>>) {
    if !AUTO_BLOCK_OVER_GRACE {
        info!("Grace sweep disabled (auto-block off)");
        return;
    }

    tokio::spawn(async move {
        loop {
            let now = Local::now();
            let secs_today = now.hour() * 3600 + now.minute() * 60 + now.second();
            let target_secs = SWEEP_HOUR * 3600;
            let wait = if secs_today < target_secs {
                target_secs - secs_today
            } else {
                86400 - secs_today + target_secs
            };
            tokio::time::sleep(tokio::time::Duration::from_secs(wait as u64)).await;

            let report = match sweep(store.as_ref(), true).await {
                Ok(r) => r,
                Err(e) => {
                    warn!("Grace sweep failed: {e}");
                    continue;
                }
            };
            info!(
                "Grace sweep: {} lapsed, {} blocked",
                report.lapsed.len(),
                report.blocked.len()
            );

            if report.lapsed.is_empty() {
                continue;
            }
            if let Some(ref svc) = email {
                if let Err(e) = svc.send_lapsed_report(&report.lapsed, &report.blocked).await {
                    warn!("Grace sweep: failed to send report: {e}");
                }
            }
        }
    });
}

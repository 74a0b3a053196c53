use chrono::{DateTime, Utc};

use crate::{
    db::{schema::PAYMENT_EVENTS, StoreResult, TableStore},
    models::payment::PaymentEvent,
};

/// Read-only queries over the payment event log. Rows are appended by the
/// provider webhook collector; nothing here writes to the table.
pub struct EventLog;

impl EventLog {
    pub async fn all(store: &dyn TableStore) -> StoreResult<Vec<PaymentEvent>> {
        let rows = store.scan_all(PAYMENT_EVENTS.name).await?;
        Ok(rows.iter().map(PaymentEvent::from_row).collect())
    }

    /// Most recent active event paid by `email` or tied to `preapproval_id`.
    pub async fn latest_active(
        store: &dyn TableStore,
        email: &str,
        preapproval_id: &str,
    ) -> StoreResult<Option<PaymentEvent>> {
        let events = Self::all(store).await?;
        Ok(latest_active(&events, email, preapproval_id).cloned())
    }

    /// Active events whose payment id or preapproval id equals `reference`.
    pub async fn active_by_reference(
        store: &dyn TableStore,
        reference: &str,
    ) -> StoreResult<Vec<PaymentEvent>> {
        let events = Self::all(store).await?;
        Ok(events
            .into_iter()
            .filter(|e| e.is_active() && e.references(reference))
            .collect())
    }

    /// Active events paid by `email` at or after `since`. Events without a
    /// readable timestamp are skipped.
    pub async fn active_for_email_since(
        store: &dyn TableStore,
        email: &str,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<PaymentEvent>> {
        let email = email.trim().to_lowercase();
        let events = Self::all(store).await?;
        Ok(events
            .into_iter()
            .filter(|e| {
                e.is_active()
                    && e.payer_email == email
                    && e.timestamp.is_some_and(|at| at >= since)
            })
            .collect())
    }
}

/// Pick the newest matching active event. Ties on timestamp go to the later
/// row; rows with no readable timestamp sort before all dated rows.
pub fn latest_active<'a>(
    events: &'a [PaymentEvent],
    email: &str,
    preapproval_id: &str,
) -> Option<&'a PaymentEvent> {
    let email = email.trim().to_lowercase();
    let preapproval_id = preapproval_id.trim();

    events
        .iter()
        .filter(|e| e.is_active())
        .filter(|e| {
            (!email.is_empty() && e.payer_email == email)
                || (!preapproval_id.is_empty() && e.preapproval_id == preapproval_id)
        })
        .max_by_key(|e| e.timestamp)
}

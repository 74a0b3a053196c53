use chrono::{DateTime, Utc};

use crate::db::Row;

use super::parse_timestamp;

/// Provider statuses that mean "the subscription is currently paid".
pub const ACTIVE_STATUSES: &[&str] = &[
    "approved",
    "authorized",
    "accredited",
    "recurring_charges",
    "active",
];

pub fn is_active_status(status: &str) -> bool {
    let status = status.trim().to_lowercase();
    ACTIVE_STATUSES.contains(&status.as_str())
}

/// One webhook delivery from the payment provider. Read-only here.
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentEvent {
    pub timestamp: Option<DateTime<Utc>>,
    pub action: String,
    pub payment_id: String,
    pub preapproval_id: String,
    pub status: String,
    pub payer_email: String,
    pub amount: String,
}

impl PaymentEvent {
    pub fn from_row(row: &Row) -> Self {
        Self {
            timestamp: parse_timestamp(row.get("timestamp")),
            action: row.get("action").trim().to_string(),
            payment_id: row.get("payment_id").trim().to_string(),
            preapproval_id: row.get("preapproval_id").trim().to_string(),
            status: row.get("status").trim().to_lowercase(),
            payer_email: row.get("payer_email").trim().to_lowercase(),
            amount: row.get("amount").trim().to_string(),
        }
    }

    pub fn is_active(&self) -> bool {
        is_active_status(&self.status)
    }

    /// Matches either the provider payment id or the subscription id.
    pub fn references(&self, id: &str) -> bool {
        let id = id.trim();
        !id.is_empty() && (self.payment_id == id || self.preapproval_id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::fields;

    #[test]
    fn active_set_is_case_insensitive() {
        assert!(is_active_status("Approved"));
        assert!(is_active_status(" recurring_charges "));
        assert!(!is_active_status("pending"));
        assert!(!is_active_status("cancelled"));
        assert!(!is_active_status(""));
    }

    #[test]
    fn references_match_either_id() {
        let event = PaymentEvent::from_row(&Row {
            version: 1,
            fields: fields([("payment_id", "123"), ("preapproval_id", "2c93808a")]),
        });
        assert!(event.references("123"));
        assert!(event.references(" 2c93808a"));
        assert!(!event.references(""));
        assert!(!event.references("999"));
    }
}

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::db::{Key, Row};

use super::{parse_flag, parse_timestamp};

pub const SLUG_COLUMN: &str = "site_slug";

pub fn signup_key(slug: &str) -> Key {
    Key::slug(SLUG_COLUMN, slug)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    Essential,
    Vip,
}

impl Plan {
    /// Plan labels are free text in the signup form ("VIP anual", "essencial", ...).
    pub fn from_label(label: &str) -> Self {
        if label.to_lowercase().contains("vip") {
            Plan::Vip
        } else {
            Plan::Essential
        }
    }

    /// Monthly amount assumed when the provider never reported one.
    pub fn default_amount(self) -> &'static str {
        match self {
            Plan::Vip => "99.90",
            Plan::Essential => "49.90",
        }
    }
}

/// One row of the `signups` table.
#[derive(Debug, Clone, PartialEq)]
pub struct SignupRecord {
    pub site_slug: String,
    pub email: String,
    pub name: String,
    pub phone: String,
    pub plan: String,
    pub cpf: String,
    pub preapproval_id: String,
    /// Last provider status recorded for the site.
    pub status: String,
    /// When `status` was last written. Other writes to the row leave it alone.
    pub status_at: Option<DateTime<Utc>>,
    pub manual_block: bool,
    pub onboarding_email: String,
    pub onboarding_done_at: Option<DateTime<Utc>>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub version: i64,
}

impl SignupRecord {
    pub fn from_row(row: &Row) -> Self {
        Self {
            site_slug: row.get("site_slug").trim().to_uppercase(),
            email: row.get("email").trim().to_lowercase(),
            name: row.get("name").to_string(),
            phone: row.get("phone").to_string(),
            plan: row.get("plan").to_string(),
            cpf: row.get("cpf").to_string(),
            preapproval_id: row.get("preapproval_id").trim().to_string(),
            status: row.get("status").trim().to_lowercase(),
            status_at: parse_timestamp(row.get("status_at")),
            manual_block: parse_flag(row.get("manual_block")),
            onboarding_email: row.get("onboarding_email").trim().to_lowercase(),
            onboarding_done_at: parse_timestamp(row.get("onboarding_done_at")),
            created_at: parse_timestamp(row.get("created_at")),
            updated_at: parse_timestamp(row.get("updated_at")),
            version: row.version,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::fields;

    #[test]
    fn reads_a_sparse_row() {
        let row = Row {
            version: 3,
            fields: fields([
                ("site_slug", "acme-motos"),
                ("email", " Dono@Acme.com "),
                ("manual_block", "TRUE"),
                ("status", "Approved"),
            ]),
        };
        let signup = SignupRecord::from_row(&row);
        assert_eq!(signup.site_slug, "ACME-MOTOS");
        assert_eq!(signup.email, "dono@acme.com");
        assert!(signup.manual_block);
        assert_eq!(signup.status, "approved");
        assert_eq!(signup.updated_at, None);
        assert_eq!(signup.version, 3);
    }

    #[test]
    fn plan_labels() {
        assert_eq!(Plan::from_label("VIP anual"), Plan::Vip);
        assert_eq!(Plan::from_label("essencial"), Plan::Essential);
        assert_eq!(Plan::from_label(""), Plan::Essential);
        assert_eq!(Plan::Vip.default_amount(), "99.90");
    }
}

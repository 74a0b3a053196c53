use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::{Key, Row};

use super::parse_timestamp;

pub const EMAIL_COLUMN: &str = "email";

pub fn user_key(email: &str) -> Key {
    Key::email(EMAIL_COLUMN, email)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Client,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Role::Admin => "admin",
            Role::Client => "client",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for Role {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "admin" => Ok(Role::Admin),
            "client" | "cliente" => Ok(Role::Client),
            _ => Err(anyhow::anyhow!("Unknown role: {s}")),
        }
    }
}

/// One row of the `users` table. The `billing_*` fields are a read-through
/// cache written back by reconciliation.
#[derive(Debug, Clone, PartialEq)]
pub struct UserCredential {
    pub email: String,
    pub site_slug: String,
    /// Stored as free text; unknown values are treated as `client`.
    pub role: Role,
    pub password_hash: String,
    pub salt: String,
    pub last_login: Option<DateTime<Utc>>,
    pub reset_token: String,
    pub reset_expiry: Option<DateTime<Utc>>,
    pub plan: String,
    pub billing_status: String,
    pub billing_next: Option<DateTime<Utc>>,
    pub billing_amount: String,
    pub billing_currency: String,
    pub billing_provider: String,
    pub version: i64,
}

impl UserCredential {
    pub fn from_row(row: &Row) -> Self {
        Self {
            email: row.get("email").trim().to_lowercase(),
            site_slug: row.get("site_slug").trim().to_uppercase(),
            role: row.get("role").parse().unwrap_or(Role::Client),
            password_hash: row.get("password_hash").to_string(),
            salt: row.get("salt").to_string(),
            last_login: parse_timestamp(row.get("last_login")),
            reset_token: row.get("reset_token").trim().to_string(),
            reset_expiry: parse_timestamp(row.get("reset_expiry")),
            plan: row.get("plan").to_string(),
            billing_status: row.get("billing_status").trim().to_lowercase(),
            billing_next: parse_timestamp(row.get("billing_next")),
            billing_amount: row.get("billing_amount").trim().to_string(),
            billing_currency: row.get("billing_currency").trim().to_string(),
            billing_provider: row.get("billing_provider").trim().to_string(),
            version: row.version,
        }
    }

    /// Stand-in for a site whose owner has no credential row yet.
    pub fn placeholder(email: &str, site_slug: &str) -> Self {
        Self {
            email: email.trim().to_lowercase(),
            site_slug: site_slug.trim().to_uppercase(),
            role: Role::Client,
            password_hash: String::new(),
            salt: String::new(),
            last_login: None,
            reset_token: String::new(),
            reset_expiry: None,
            plan: String::new(),
            billing_status: String::new(),
            billing_next: None,
            billing_amount: String::new(),
            billing_currency: String::new(),
            billing_provider: String::new(),
            version: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::fields;

    #[test]
    fn roles_round_trip_through_text() {
        assert_eq!("admin".parse::<Role>().unwrap(), Role::Admin);
        assert_eq!(" Cliente ".parse::<Role>().unwrap(), Role::Client);
        assert!("root".parse::<Role>().is_err());
        assert_eq!(Role::Client.to_string(), "client");
    }

    #[test]
    fn unknown_role_reads_as_client() {
        let row = Row {
            version: 1,
            fields: fields([("email", "A@B.C"), ("role", "superuser")]),
        };
        let user = UserCredential::from_row(&row);
        assert_eq!(user.role, Role::Client);
        assert_eq!(user.email, "a@b.c");
        assert_eq!(user.billing_next, None);
    }
}

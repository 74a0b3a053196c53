use serde::Deserialize;

use super::parse_flag;

/// Operations served by the `/api` endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Validate,
    Signup,
    AdminSet,
    AdminRename,
    UserSetPassword,
    UserLogin,
    PasswordResetRequest,
    PasswordResetConfirm,
    ClientBilling,
    GetStatus,
    OnboardingSubmit,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Validate => "validate",
            Operation::Signup => "signup",
            Operation::AdminSet => "admin_set",
            Operation::AdminRename => "admin_rename",
            Operation::UserSetPassword => "user_set_password",
            Operation::UserLogin => "user_login",
            Operation::PasswordResetRequest => "password_reset_request",
            Operation::PasswordResetConfirm => "password_reset_confirm",
            Operation::ClientBilling => "client_billing",
            Operation::GetStatus => "get_status",
            Operation::OnboardingSubmit => "onboarding_submit",
        }
    }
}

impl std::str::FromStr for Operation {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let op = match s.trim().to_lowercase().as_str() {
            "validate" => Operation::Validate,
            "signup" => Operation::Signup,
            "admin_set" => Operation::AdminSet,
            "admin_rename" => Operation::AdminRename,
            "user_set_password" => Operation::UserSetPassword,
            "user_login" => Operation::UserLogin,
            "password_reset_request" => Operation::PasswordResetRequest,
            "password_reset_confirm" => Operation::PasswordResetConfirm,
            "client_billing" => Operation::ClientBilling,
            "get_status" => Operation::GetStatus,
            "onboarding_submit" => Operation::OnboardingSubmit,
            other => anyhow::bail!("Unknown action: {other}"),
        };
        Ok(op)
    }
}

/// Booleans arrive as JSON booleans, numbers, or query-string text.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum FlagValue {
    Bool(bool),
    Number(i64),
    Text(String),
}

impl FlagValue {
    pub fn as_bool(&self) -> bool {
        match self {
            FlagValue::Bool(b) => *b,
            FlagValue::Number(n) => *n != 0,
            FlagValue::Text(s) => parse_flag(s),
        }
    }
}

/// Request envelope shared by every operation. The same struct is decoded
/// from a JSON body or from query parameters, so every field is optional and
/// accepts both camelCase and snake_case spellings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StoreRequest {
    #[serde(rename = "type", alias = "action")]
    pub kind: Option<String>,
    #[serde(rename = "siteSlug", alias = "site_slug", alias = "slug")]
    pub site_slug: Option<String>,
    #[serde(rename = "newSlug", alias = "new_slug", alias = "newSiteSlug")]
    pub new_slug: Option<String>,
    pub email: Option<String>,
    pub password: Option<String>,
    pub token: Option<String>,
    pub role: Option<String>,
    #[serde(rename = "adminToken", alias = "admin_token")]
    pub admin_token: Option<String>,
    #[serde(alias = "manual_block", alias = "manualBlock")]
    pub block: Option<FlagValue>,
    #[serde(alias = "document", alias = "cpfCnpj")]
    pub cpf: Option<String>,
    pub name: Option<String>,
    pub phone: Option<String>,
    pub plan: Option<String>,
    #[serde(rename = "preapprovalId", alias = "preapproval_id")]
    pub preapproval_id: Option<String>,
    #[serde(rename = "paymentId", alias = "payment_id")]
    pub payment_id: Option<String>,
}

/// Trimmed, non-empty view of an optional text field.
pub fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

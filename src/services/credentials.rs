use std::sync::Arc;

use chrono::{Duration, Utc};

use crate::{
    db::{fields, schema::USERS, Fields, Precondition, TableStore},
    error::ApiError,
    models::{
        format_timestamp,
        user::{user_key, Role, UserCredential},
    },
    services::{
        email::EmailService,
        metrics::{LOGINS_COUNTER, PASSWORD_RESETS_COUNTER},
        update_with_retry,
        validation::normalize_slug,
    },
};

pub const RESET_TOKEN_TTL_MINUTES: i64 = 30;

fn build_reset_url(base_url: &str, email: &str, token: &str) -> String {
    let base = base_url.trim_end_matches('/');
    format!("{base}/redefinir-senha?email={email}&token={token}")
}

/// Fresh 16-byte salt plus the bcrypt hash derived from it. The salt is kept
/// hex-encoded next to the hash so both columns of the row stay meaningful.
fn hash_password(password: &str, cost: u32) -> Result<(String, String), ApiError> {
    let salt: [u8; 16] = rand::random();
    let hash = bcrypt::hash_with_salt(password, cost, salt)?
        .format_for_version(bcrypt::Version::TwoB);
    Ok((hash, hex::encode(salt)))
}

pub struct CredentialService;

impl CredentialService {
    /// Create or overwrite the credential for `email`. Clients must belong to
    /// a site; admins may be global.
    pub async fn set_password(
        store: &dyn TableStore,
        cost: u32,
        email: &str,
        password: &str,
        role: &str,
        site_slug: &str,
    ) -> Result<UserCredential, ApiError> {
        let email = email.trim().to_lowercase();
        if email.is_empty() || password.trim().is_empty() {
            return Err(ApiError::MissingEmailOrPassword);
        }
        let role: Role = role.parse().unwrap_or(Role::Client);
        let slug = normalize_slug(site_slug);
        if role == Role::Client && slug.is_empty() {
            return Err(ApiError::MissingSiteSlug);
        }

        let (hash, salt) = hash_password(password, cost)?;
        let key = user_key(&email);
        let now = format_timestamp(Utc::now());

        let mut patch = fields([
            ("role", role.to_string()),
            ("password_hash", hash),
            ("salt", salt),
            ("updated_at", now.clone()),
        ]);
        if !slug.is_empty() {
            patch.insert("site_slug".into(), slug);
        }
        if store.get(USERS.name, &key).await?.is_none() {
            patch.insert("created_at".into(), now);
        }

        let row = store.upsert(USERS.name, &key, &patch, Precondition::Any).await?;
        tracing::info!("credential set for {email} ({role})");
        Ok(UserCredential::from_row(&row))
    }

    /// Check a password and stamp `last_login`.
    pub async fn login(
        store: &dyn TableStore,
        email: &str,
        password: &str,
    ) -> Result<UserCredential, ApiError> {
        let key = user_key(email);
        let Some(row) = store.get(USERS.name, &key).await? else {
            LOGINS_COUNTER.with_label_values(&["not_found"]).inc();
            return Err(ApiError::NotFound);
        };
        let user = UserCredential::from_row(&row);

        // A row created by signup has no hash until a password is set.
        let valid = !user.password_hash.is_empty()
            && bcrypt::verify(password, &user.password_hash).unwrap_or(false);
        if !valid {
            LOGINS_COUNTER.with_label_values(&["invalid"]).inc();
            return Err(ApiError::InvalidCredentials);
        }

        let stamp = fields([("last_login", format_timestamp(Utc::now()))]);
        let row = store.upsert(USERS.name, &key, &stamp, Precondition::Any).await?;
        LOGINS_COUNTER.with_label_values(&["ok"]).inc();
        Ok(UserCredential::from_row(&row))
    }

    /// Issue a reset token and mail it in the background. Unknown emails
    /// succeed silently so the response never reveals whether an account exists.
    pub async fn request_password_reset(
        store: &dyn TableStore,
        email_svc: Option<Arc<EmailService>>,
        base_url: &str,
        email: &str,
    ) -> Result<(), ApiError> {
        let key = user_key(email);
        let Some(row) = store.get(USERS.name, &key).await? else {
            tracing::debug!("password reset requested for unknown email");
            return Ok(());
        };
        let user = UserCredential::from_row(&row);

        let token = hex::encode(rand::random::<[u8; 16]>());
        let expires_at = Utc::now() + Duration::minutes(RESET_TOKEN_TTL_MINUTES);
        let patch = fields([
            ("reset_token", token.clone()),
            ("reset_expiry", format_timestamp(expires_at)),
        ]);
        store.upsert(USERS.name, &key, &patch, Precondition::Any).await?;
        PASSWORD_RESETS_COUNTER.with_label_values(&["requested"]).inc();

        match email_svc {
            Some(svc) => {
                let url = build_reset_url(base_url, &user.email, &token);
                tokio::spawn(async move {
                    if let Err(e) = svc
                        .send_password_reset(&user.email, &user.site_slug, &url)
                        .await
                    {
                        tracing::warn!("Failed to send password reset email to {}: {e}", user.email);
                    }
                });
            }
            None => tracing::warn!("SMTP not configured; reset token for {} not delivered", user.email),
        }
        Ok(())
    }

    /// Consume a reset token and set a new password. The token check runs
    /// against the version being replaced, so a token can be spent only once
    /// even when two confirmations race.
    pub async fn confirm_password_reset(
        store: &dyn TableStore,
        cost: u32,
        email: &str,
        token: &str,
        new_password: &str,
    ) -> Result<(), ApiError> {
        let token = token.trim();
        if email.trim().is_empty() || token.is_empty() || new_password.trim().is_empty() {
            return Err(ApiError::MissingParams);
        }
        let now = Utc::now();

        update_with_retry(store, USERS.name, &user_key(email), ApiError::NotFound, |row| {
            let user = UserCredential::from_row(row);
            if user.reset_token.is_empty() || user.reset_token != token {
                return Err(ApiError::InvalidToken);
            }
            if user.reset_expiry.map_or(true, |expiry| expiry < now) {
                return Err(ApiError::ExpiredToken);
            }

            let (hash, salt) = hash_password(new_password, cost)?;
            let patch: Fields = fields([
                ("password_hash", hash),
                ("salt", salt),
                ("reset_token", String::new()),
                ("reset_expiry", String::new()),
                ("updated_at", format_timestamp(now)),
            ]);
            Ok(patch)
        })
        .await?;

        PASSWORD_RESETS_COUNTER.with_label_values(&["confirmed"]).inc();
        Ok(())
    }
}

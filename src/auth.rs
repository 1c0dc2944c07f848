//! Accounts, password hashing and JWT sessions.

use crate::config::Config;
use crate::db_storage::LearningStore;
use crate::errors::AppError;
use crate::handlers::AppState;
use axum::extract::FromRequestParts;
use axum::http::{header::AUTHORIZATION, request::Parts};
use chrono::{Duration, Utc};
use jsonwebtoken::{errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use moka::future::Cache;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, OnceLock};
use thiserror::Error;

const SPECIAL_CHARACTERS: &str = "!@#$%^&*(),.?\":{}|<>";

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid username or password")]
    InvalidCredentials,
    #[error("username '{0}' is already taken")]
    UsernameTaken(String),
    #[error("{0}")]
    InvalidUsername(String),
    #[error("{0}")]
    WeakPassword(String),
    #[error("invalid token")]
    InvalidToken,
    #[error("token has expired")]
    TokenExpired,
    #[error("wrong token type")]
    WrongTokenType,
    #[error("user not found")]
    UserNotFound,
    #[error("too many failed login attempts, retry in {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },
    #[error("password hashing failed: {0}")]
    Hash(String),
    #[error(transparent)]
    Store(#[from] AppError),
}

impl From<AuthError> for AppError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::InvalidCredentials
            | AuthError::InvalidToken
            | AuthError::TokenExpired
            | AuthError::WrongTokenType => AppError::Unauthorized(err.to_string()),
            AuthError::UsernameTaken(_) => AppError::Conflict(err.to_string()),
            AuthError::InvalidUsername(msg) | AuthError::WeakPassword(msg) => {
                AppError::BadRequest(msg)
            }
            AuthError::UserNotFound => AppError::NotFound(err.to_string()),
            AuthError::RateLimited { .. } => AppError::TooManyRequests(err.to_string()),
            AuthError::Hash(msg) => AppError::InternalError(msg),
            AuthError::Store(inner) => inner,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenType {
    Access,
    Refresh,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    pub user_id: i64,
    /// Only present on access tokens.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(rename = "type")]
    pub token_type: TokenType,
    pub exp: i64,
    pub iat: i64,
    pub jti: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
}

/// Returned by login and registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthSession {
    pub user_id: i64,
    pub username: String,
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    /// Access token lifetime in seconds.
    pub expires_in: i64,
}

fn username_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[\p{L}\p{N}_.\-]{3,32}$").expect("valid username regex"))
}

/// 3 to 32 letters, digits, `_`, `.` or `-`.
pub fn validate_username(username: &str) -> Result<(), String> {
    if username_pattern().is_match(username) {
        Ok(())
    } else {
        Err("Username must be 3-32 characters of letters, digits, '_', '.' or '-'".to_string())
    }
}

pub fn validate_password_strength(password: &str) -> Result<(), String> {
    if password.chars().count() < 8 {
        return Err("Password must be at least 8 characters long".to_string());
    }
    if !password.chars().any(char::is_uppercase) {
        return Err("Password must contain at least one uppercase letter".to_string());
    }
    if !password.chars().any(char::is_lowercase) {
        return Err("Password must contain at least one lowercase letter".to_string());
    }
    if !password.chars().any(|c| c.is_ascii_digit()) {
        return Err("Password must contain at least one digit".to_string());
    }
    if !password.chars().any(|c| SPECIAL_CHARACTERS.contains(c)) {
        return Err("Password must contain at least one special character".to_string());
    }
    Ok(())
}

#[derive(Clone)]
pub struct AuthManager {
    store: LearningStore,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    access_ttl: Duration,
    refresh_ttl: Duration,
    bcrypt_cost: u32,
    max_attempts: u32,
    window_secs: u64,
    /// Login attempts per username within the window, reset on success.
    failed_logins: Cache<String, u32>,
}

impl AuthManager {
    pub fn new(store: LearningStore, config: &Config) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;

        let failed_logins = Cache::builder()
            .time_to_live(std::time::Duration::from_secs(config.login_window_secs))
            .max_capacity(100_000)
            .build();

        Self {
            store,
            encoding_key: EncodingKey::from_secret(config.secret_key.as_bytes()),
            decoding_key: DecodingKey::from_secret(config.secret_key.as_bytes()),
            validation,
            access_ttl: Duration::seconds(config.jwt_expiration as i64),
            refresh_ttl: Duration::seconds(config.refresh_token_expiration as i64),
            bcrypt_cost: config.bcrypt_cost,
            max_attempts: config.login_max_attempts,
            window_secs: config.login_window_secs,
            failed_logins,
        }
    }

    // ============ Passwords ============

    pub async fn hash_password(&self, password: &str) -> Result<String, AuthError> {
        let password = password.to_string();
        let cost = self.bcrypt_cost;
        tokio::task::spawn_blocking(move || bcrypt::hash(password, cost))
            .await
            .map_err(|e| AuthError::Hash(e.to_string()))?
            .map_err(|e| AuthError::Hash(e.to_string()))
    }

    /// False on mismatch and on any hashing error.
    pub async fn verify_password(&self, password: &str, password_hash: &str) -> bool {
        let password = password.to_string();
        let password_hash = password_hash.to_string();
        tokio::task::spawn_blocking(move || bcrypt::verify(password, &password_hash))
            .await
            .ok()
            .and_then(Result::ok)
            .unwrap_or(false)
    }

    // ============ Tokens ============

    pub(crate) fn issue_token(
        &self,
        user_id: i64,
        username: Option<&str>,
        token_type: TokenType,
        ttl: Duration,
    ) -> Result<String, AuthError> {
        let now = Utc::now();
        let claims = Claims {
            user_id,
            username: username.map(str::to_string),
            token_type,
            exp: (now + ttl).timestamp(),
            iat: now.timestamp(),
            jti: uuid::Uuid::new_v4().to_string(),
        };
        jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| AuthError::Hash(format!("token encoding failed: {}", e)))
    }

    pub fn generate_tokens(&self, user_id: i64, username: &str) -> Result<TokenPair, AuthError> {
        Ok(TokenPair {
            access_token: self.issue_token(
                user_id,
                Some(username),
                TokenType::Access,
                self.access_ttl,
            )?,
            refresh_token: self.issue_token(user_id, None, TokenType::Refresh, self.refresh_ttl)?,
        })
    }

    pub fn verify_token(&self, token: &str) -> Result<Claims, AuthError> {
        jsonwebtoken::decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::TokenExpired,
                _ => AuthError::InvalidToken,
            })
    }

    /// Verifies a token and requires it to be an access token.
    pub fn verify_access_token(&self, token: &str) -> Result<Claims, AuthError> {
        let claims = self.verify_token(token)?;
        if claims.token_type != TokenType::Access {
            return Err(AuthError::WrongTokenType);
        }
        Ok(claims)
    }

    pub async fn refresh_access_token(&self, refresh_token: &str) -> Result<String, AuthError> {
        let claims = self.verify_token(refresh_token)?;
        if claims.token_type != TokenType::Refresh {
            return Err(AuthError::WrongTokenType);
        }

        let user = self
            .store
            .get_user_by_id(claims.user_id)
            .await?
            .ok_or(AuthError::UserNotFound)?;

        self.issue_token(
            user.user_id,
            Some(&user.username),
            TokenType::Access,
            self.access_ttl,
        )
    }

    fn session(&self, user_id: i64, username: &str) -> Result<AuthSession, AuthError> {
        let tokens = self.generate_tokens(user_id, username)?;
        Ok(AuthSession {
            user_id,
            username: username.to_string(),
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token,
            token_type: "Bearer".to_string(),
            expires_in: self.access_ttl.num_seconds(),
        })
    }

    // ============ Accounts ============

    /// Each attempt reserves a slot in the per-username window before the
    /// password is checked, so at most `max_attempts` hashes are verified
    /// per window however many requests race.
    pub async fn login(&self, username: &str, password: &str) -> Result<AuthSession, AuthError> {
        let throttle_key = username.to_string();
        if self.failed_logins.get(&throttle_key).await.unwrap_or(0) >= self.max_attempts {
            tracing::warn!("Login throttled for {}", username);
            return Err(self.throttled());
        }

        let attempt = self
            .failed_logins
            .entry(throttle_key.clone())
            .and_upsert_with(|entry| async move {
                entry.map_or(1, |e| e.into_value().saturating_add(1))
            })
            .await
            .into_value();
        if attempt > self.max_attempts {
            tracing::warn!("Login throttled for {}", username);
            return Err(self.throttled());
        }

        let user = self.store.get_user(username).await?;
        let verified = match &user {
            Some(user) => self.verify_password(password, &user.password_hash).await,
            None => false,
        };

        let Some(user) = user.filter(|_| verified) else {
            tracing::warn!(
                "Failed login for {} ({}/{})",
                username,
                attempt,
                self.max_attempts
            );
            return Err(AuthError::InvalidCredentials);
        };

        self.failed_logins.invalidate(&throttle_key).await;
        self.store.update_last_login(user.user_id).await?;
        tracing::info!("User {} logged in", user.user_id);

        self.session(user.user_id, &user.username)
    }

    fn throttled(&self) -> AuthError {
        AuthError::RateLimited {
            retry_after_secs: self.window_secs,
        }
    }

    pub async fn register(&self, username: &str, password: &str) -> Result<AuthSession, AuthError> {
        validate_username(username).map_err(AuthError::InvalidUsername)?;
        validate_password_strength(password).map_err(AuthError::WeakPassword)?;

        if self.store.get_user(username).await?.is_some() {
            return Err(AuthError::UsernameTaken(username.to_string()));
        }

        let password_hash = self.hash_password(password).await?;
        let user_id = match self.store.add_user(username, &password_hash).await {
            Ok(id) => id,
            // Lost a race with a concurrent registration.
            Err(AppError::Conflict(_)) => return Err(AuthError::UsernameTaken(username.to_string())),
            Err(e) => return Err(e.into()),
        };

        tracing::info!("Registered user {} ({})", username, user_id);
        self.session(user_id, username)
    }

    pub async fn change_password(
        &self,
        user_id: i64,
        old_password: &str,
        new_password: &str,
    ) -> Result<(), AuthError> {
        let user = self
            .store
            .get_user_by_id(user_id)
            .await?
            .ok_or(AuthError::UserNotFound)?;

        if !self.verify_password(old_password, &user.password_hash).await {
            return Err(AuthError::InvalidCredentials);
        }
        validate_password_strength(new_password).map_err(AuthError::WeakPassword)?;

        let new_hash = self.hash_password(new_password).await?;
        self.store.update_password(user_id, &new_hash).await?;
        tracing::info!("Password changed for user {}", user_id);
        Ok(())
    }
}

/// The caller identified by a valid `Authorization: Bearer` access token.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthUser {
    pub user_id: i64,
    pub username: String,
}

#[axum::async_trait]
impl FromRequestParts<Arc<AppState>> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .ok_or_else(|| AppError::Unauthorized("Missing bearer token".to_string()))?;

        let claims = state.auth.verify_access_token(token)?;
        Ok(AuthUser {
            user_id: claims.user_id,
            username: claims.username.unwrap_or_default(),
        })
    }
}

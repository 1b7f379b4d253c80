//! Monitor user accounts and session authentication.
//!
//! Users live in the key-value store under a single `users` key. Passwords
//! are stored as PBKDF2-HMAC-SHA512 digests with a per-user random salt. A
//! successful login or account creation issues a random cookie bound to the
//! caller's address for two weeks; a later login may present
//! `HMAC-SHA512(cookie, nonce)` instead of the password, where `nonce` is the
//! value the scheduler sent in its `hello` event on that connection.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use hmac::{Hmac, Mac};
use kiln_proto::LoginRequest;
use kiln_state::{get_json, put_json, KvBackend, KvError};
use parking_lot::Mutex;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha512;
use std::collections::{BTreeMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use thiserror::Error;

type HmacSha512 = Hmac<Sha512>;

/// Key under which the user table is persisted.
pub const USERS_KEY: &str = "users";

const SALT_BYTES: usize = 256;
const HASH_BYTES: usize = 256;
const COOKIE_BYTES: usize = 256;
const NONCE_BYTES: usize = 32;
const PBKDF2_ROUNDS: u32 = 12_000;
const COOKIE_LIFETIME_MS: i64 = 14 * 24 * 60 * 60 * 1000;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Unauthenticated message: {0}")]
    Unauthenticated(&'static str),

    #[error("Bad {0} message")]
    BadRequest(&'static str),

    #[error("Someone's here already")]
    Busy,

    #[error("user {0} already exists")]
    UserExists(String),

    #[error("User: {0} does not seem to exist")]
    UnknownUser(String),

    #[error("No cookie")]
    NoCookie,

    #[error("Wrong ip address")]
    WrongAddress,

    #[error("Cookie expired")]
    CookieExpired,

    #[error("Wrong password {0}")]
    WrongCredentials(String),

    #[error("user store: {0}")]
    Store(#[from] KvError),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Persisted account.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserRecord {
    salt: String,
    hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    cookie: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    cookie_ip: Option<String>,
    /// Milliseconds since the epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    cookie_expiration: Option<i64>,
}

impl UserRecord {
    fn issue_cookie(&mut self, ip: IpAddr) -> String {
        let cookie = BASE64.encode(random_bytes(COOKIE_BYTES));
        self.cookie = Some(cookie.clone());
        self.cookie_ip = Some(ip.to_string());
        self.cookie_expiration = Some(Utc::now().timestamp_millis() + COOKIE_LIFETIME_MS);
        cookie
    }
}

type Users = BTreeMap<String, UserRecord>;

/// An authenticated monitor session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub user: String,
    pub cookie: String,
}

/// User accounts backed by the key-value store.
pub struct UserStore {
    kv: Arc<dyn KvBackend>,
    pending: Mutex<HashSet<String>>,
}

impl std::fmt::Debug for UserStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserStore")
            .field("pending", &self.pending.lock().len())
            .finish_non_exhaustive()
    }
}

/// Marks a user as being modified until dropped.
struct PendingGuard<'a> {
    pending: &'a Mutex<HashSet<String>>,
    user: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.user);
    }
}

impl UserStore {
    pub fn new(kv: Arc<dyn KvBackend>) -> Self {
        Self {
            kv,
            pending: Mutex::new(HashSet::new()),
        }
    }

    fn claim(&self, user: &str) -> Result<PendingGuard<'_>, AuthError> {
        if !self.pending.lock().insert(user.to_owned()) {
            return Err(AuthError::Busy);
        }
        Ok(PendingGuard {
            pending: &self.pending,
            user: user.to_owned(),
        })
    }

    async fn users(&self) -> Result<Users, AuthError> {
        Ok(get_json::<Users>(self.kv.as_ref(), USERS_KEY).await?.unwrap_or_default())
    }

    async fn save(&self, users: &Users) -> Result<(), AuthError> {
        put_json(self.kv.as_ref(), USERS_KEY, users).await?;
        Ok(())
    }

    /// Names of every account.
    pub async fn list(&self) -> Result<Vec<String>, AuthError> {
        Ok(self.users().await?.into_keys().collect())
    }

    /// Creates an account and issues its first cookie.
    ///
    /// Salt, digest, and cookie are produced in that order, and the table is
    /// written only once all three exist.
    pub async fn add_user(&self, user: &str, password: &str, ip: IpAddr) -> Result<Session, AuthError> {
        if user.is_empty() || password.is_empty() {
            return Err(AuthError::BadRequest("addUser"));
        }
        let _guard = self.claim(user)?;

        let mut users = self.users().await?;
        if users.contains_key(user) {
            return Err(AuthError::UserExists(user.to_owned()));
        }

        let salt = random_bytes(SALT_BYTES);
        let hash = derive(password.to_owned(), salt.clone()).await?;
        let mut record = UserRecord {
            salt: BASE64.encode(&salt),
            hash: BASE64.encode(hash),
            cookie: None,
            cookie_ip: None,
            cookie_expiration: None,
        };
        let cookie = record.issue_cookie(ip);

        users.insert(user.to_owned(), record);
        self.save(&users).await?;

        tracing::info!(user = %user, "Added user");
        Ok(Session {
            user: user.to_owned(),
            cookie,
        })
    }

    pub async fn remove_user(&self, user: &str) -> Result<(), AuthError> {
        if user.is_empty() {
            return Err(AuthError::BadRequest("removeUser"));
        }
        let _guard = self.claim(user)?;

        let mut users = self.users().await?;
        if users.remove(user).is_none() {
            return Err(AuthError::UnknownUser(user.to_owned()));
        }
        self.save(&users).await?;

        tracing::info!(user = %user, "Removed user");
        Ok(())
    }

    /// Verifies credentials and issues a fresh cookie.
    pub async fn login(&self, request: &LoginRequest, nonce: &str, ip: IpAddr) -> Result<Session, AuthError> {
        let user = request.user.as_str();
        if user.is_empty() || (request.password.is_none() && request.hmac.is_none()) {
            return Err(AuthError::BadRequest("login"));
        }

        let mut users = self.users().await?;
        let record = users
            .get_mut(user)
            .ok_or_else(|| AuthError::UnknownUser(user.to_owned()))?;

        if let Some(hmac) = &request.hmac {
            verify_cookie(record, hmac, nonce, ip, user)?;
        } else if let Some(password) = &request.password {
            let salt = BASE64
                .decode(&record.salt)
                .map_err(|e| AuthError::Internal(format!("stored salt: {e}")))?;
            let stored = BASE64
                .decode(&record.hash)
                .map_err(|e| AuthError::Internal(format!("stored hash: {e}")))?;
            let derived = derive(password.clone(), salt).await?;
            if !bool::from(derived.as_slice().ct_eq(stored.as_slice())) {
                return Err(AuthError::WrongCredentials(user.to_owned()));
            }
        }

        let cookie = record.issue_cookie(ip);
        self.save(&users).await?;

        tracing::info!(user = %user, ip = %ip, "User logged in");
        Ok(Session {
            user: user.to_owned(),
            cookie,
        })
    }
}

fn verify_cookie(record: &UserRecord, hmac: &str, nonce: &str, ip: IpAddr, user: &str) -> Result<(), AuthError> {
    let cookie = record.cookie.as_deref().ok_or(AuthError::NoCookie)?;
    if record.cookie_ip.as_deref() != Some(ip.to_string().as_str()) {
        return Err(AuthError::WrongAddress);
    }
    let now = Utc::now().timestamp_millis();
    if record.cookie_expiration.map_or(true, |expiration| expiration <= now) {
        return Err(AuthError::CookieExpired);
    }

    let key = BASE64
        .decode(cookie)
        .map_err(|e| AuthError::Internal(format!("stored cookie: {e}")))?;
    let presented = BASE64
        .decode(hmac)
        .map_err(|_| AuthError::WrongCredentials(user.to_owned()))?;

    let mut mac = HmacSha512::new_from_slice(&key).map_err(|e| AuthError::Internal(e.to_string()))?;
    mac.update(nonce.as_bytes());
    mac.verify_slice(&presented)
        .map_err(|_| AuthError::WrongCredentials(user.to_owned()))
}

fn random_bytes(len: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; len];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

/// Fresh per-connection challenge for cookie logins.
pub fn nonce() -> String {
    BASE64.encode(random_bytes(NONCE_BYTES))
}

/// PBKDF2-HMAC-SHA512 on the blocking pool.
async fn derive(password: String, salt: Vec<u8>) -> Result<Vec<u8>, AuthError> {
    tokio::task::spawn_blocking(move || {
        let mut out = vec![0u8; HASH_BYTES];
        pbkdf2::pbkdf2_hmac::<Sha512>(password.as_bytes(), &salt, PBKDF2_ROUNDS, &mut out);
        out
    })
    .await
    .map_err(|e| AuthError::Internal(e.to_string()))
}

/// Computes the value a client presents for a cookie login.
pub fn cookie_hmac(cookie: &str, nonce: &str) -> Result<String, AuthError> {
    let key = BASE64
        .decode(cookie)
        .map_err(|e| AuthError::Internal(format!("cookie: {e}")))?;
    let mut mac = HmacSha512::new_from_slice(&key).map_err(|e| AuthError::Internal(e.to_string()))?;
    mac.update(nonce.as_bytes());
    Ok(BASE64.encode(mac.finalize().into_bytes()))
}

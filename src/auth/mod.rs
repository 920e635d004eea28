//! Authentication service module
//!
//! The dispatcher only sees the [`Authenticator`] trait. [`AuthService`] is the
//! default implementation: accounts held in memory with Argon2 password
//! hashes, and in development mode any username is registered on first login.
//! Owner ids are allocated once per account and never reused.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::error::AuthError;
use crate::game::OwnerId;

/// Longest accepted username after normalization
pub const MAX_USERNAME_LEN: usize = 12;

/// Who a set of credentials belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub owner: OwnerId,
    pub username: String,
}

/// Credential check used by the login handler
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, username: &str, password: &str) -> Result<Identity, AuthError>;
}

/// Player account information
#[derive(Debug, Clone)]
pub struct Account {
    pub id: OwnerId,
    /// Username (normalized)
    pub username: String,
    /// Password hash (Argon2), empty for dev accounts
    pub password_hash: String,
    pub enabled: bool,
}

impl Account {
    pub fn new(id: OwnerId, username: &str, password: &str) -> Result<Self, AuthError> {
        Ok(Self {
            id,
            username: normalize_username(username),
            password_hash: hash_password(password)?,
            enabled: true,
        })
    }

    /// Create a development account (no password)
    pub fn dev_account(id: OwnerId, username: &str) -> Self {
        Self {
            id,
            username: normalize_username(username),
            password_hash: String::new(),
            enabled: true,
        }
    }

    pub fn verify_password(&self, password: &str) -> bool {
        if self.password_hash.is_empty() {
            return true;
        }
        verify_password(password, &self.password_hash)
    }

    pub fn identity(&self) -> Identity {
        Identity {
            owner: self.id,
            username: self.username.clone(),
        }
    }
}

/// In-memory account store
pub struct AuthService {
    dev_mode: bool,
    accounts: RwLock<HashMap<String, Account>>,
    next_id: AtomicU32,
}

impl AuthService {
    pub fn new(dev_mode: bool) -> Self {
        Self {
            dev_mode,
            accounts: RwLock::new(HashMap::new()),
            next_id: AtomicU32::new(1),
        }
    }

    /// Check credentials, registering the account first in dev mode
    pub fn login(&self, username: &str, password: &str) -> Result<Identity, AuthError> {
        let username_normalized = normalize_username(username);
        if !is_valid_username(&username_normalized) {
            return Err(AuthError::InvalidCredentials);
        }

        if self.dev_mode {
            debug!(
                username = %username_normalized,
                "Dev mode authentication - auto-accepting"
            );
            return Ok(self.get_or_create_dev_account(&username_normalized).identity());
        }

        let accounts = self.accounts.read();
        let account = accounts
            .get(&username_normalized)
            .ok_or(AuthError::InvalidCredentials)?;

        if !account.enabled {
            return Err(AuthError::AccountDisabled);
        }

        if !account.verify_password(password) {
            warn!(username = %username_normalized, "Failed login attempt");
            return Err(AuthError::InvalidCredentials);
        }

        info!(
            username = %username_normalized,
            owner = account.id,
            "Authentication successful"
        );
        Ok(account.identity())
    }

    /// Register a new account
    pub fn register(&self, username: &str, password: &str) -> Result<Account, AuthError> {
        let username_normalized = normalize_username(username);

        if !is_valid_username(&username_normalized) {
            return Err(AuthError::InvalidUsername);
        }

        if password.len() < 4 || password.len() > 20 {
            return Err(AuthError::InvalidPassword);
        }

        let mut accounts = self.accounts.write();
        if accounts.contains_key(&username_normalized) {
            return Err(AuthError::RegistrationFailed(
                "Username already exists".to_string(),
            ));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let account = Account::new(id, &username_normalized, password)?;
        accounts.insert(username_normalized.clone(), account.clone());

        info!(
            username = %username_normalized,
            owner = id,
            "New account registered"
        );
        Ok(account)
    }

    fn get_or_create_dev_account(&self, username: &str) -> Account {
        let mut accounts = self.accounts.write();
        if let Some(account) = accounts.get(username) {
            return account.clone();
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let account = Account::dev_account(id, username);
        accounts.insert(username.to_string(), account.clone());

        debug!(username = %username, owner = id, "Created dev account");
        account
    }

    pub fn set_enabled(&self, username: &str, enabled: bool) -> Result<(), AuthError> {
        let mut accounts = self.accounts.write();
        let username_normalized = normalize_username(username);

        let account = accounts
            .get_mut(&username_normalized)
            .ok_or(AuthError::InvalidCredentials)?;
        account.enabled = enabled;
        info!(
            username = %username_normalized,
            enabled = enabled,
            "Updated account status"
        );
        Ok(())
    }

    pub fn get_account(&self, username: &str) -> Option<Account> {
        self.accounts
            .read()
            .get(&normalize_username(username))
            .cloned()
    }

    pub fn account_count(&self) -> usize {
        self.accounts.read().len()
    }

    pub fn is_dev_mode(&self) -> bool {
        self.dev_mode
    }
}

#[async_trait]
impl Authenticator for AuthService {
    async fn authenticate(&self, username: &str, password: &str) -> Result<Identity, AuthError> {
        self.login(username, password)
    }
}

/// Normalize a username (lowercase, trim, replace spaces with underscores)
pub fn normalize_username(username: &str) -> String {
    username.trim().to_lowercase().replace(' ', "_")
}

fn is_valid_username(normalized: &str) -> bool {
    !normalized.is_empty()
        && normalized.len() <= MAX_USERNAME_LEN
        && normalized
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn hash_password(password: &str) -> Result<String, AuthError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| AuthError::RegistrationFailed(format!("Failed to hash password: {}", e)))
}

fn verify_password(password: &str, hash: &str) -> bool {
    let parsed_hash = match PasswordHash::new(hash) {
        Ok(h) => h,
        Err(_) => return false,
    };

    Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .is_ok()
}

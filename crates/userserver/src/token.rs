//! Opaque session token lifecycle.
//!
//! Every token has a type (`login`, `api`, `reset`) with its own max/min
//! ages. `get_token` reuses an existing non-expiring-too-soon token rather
//! than minting a fresh one on every login, so a client polling frequently
//! does not force constant churn in the backing store. `check_token` renews
//! a token close to its min-age floor, extending its life without changing
//! its value, so a long-lived client session does not need to re-login.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Result};
use forge_common::{Database, IdGenerator};
use forge_protocol::ServiceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenType {
    Login,
    Api,
    Reset,
}

impl TokenType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenType::Login => "login",
            TokenType::Api => "api",
            TokenType::Reset => "reset",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "login" => Some(TokenType::Login),
            "api" => Some(TokenType::Api),
            "reset" => Some(TokenType::Reset),
            _ => None,
        }
    }

    /// Maximum lifetime of a freshly-minted token, in minutes.
    pub fn max_age_minutes(&self) -> i64 {
        match self {
            TokenType::Login | TokenType::Api => 6 * 31 * 24 * 60,
            TokenType::Reset => 4 * 24 * 60,
        }
    }

    /// Below this much remaining life, `get_token` mints a new token instead
    /// of reusing an existing one, and `check_token` renews in place.
    pub fn min_age_minutes(&self) -> i64 {
        match self {
            TokenType::Login | TokenType::Api => 3 * 31 * 24 * 60,
            TokenType::Reset => 3 * 24 * 60,
        }
    }
}

fn now_minutes() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
        / 60
}

fn record_key(token: &str) -> String {
    format!("token:{token}")
}

fn user_set_key(user_id: &str, token_type: TokenType) -> String {
    format!("user:{user_id}:tokens:{}", token_type.as_str())
}

const GLOBAL_SET_KEY: &str = "tokens:all";

pub struct TokenStore {
    db: Arc<dyn Database>,
    id_generator: Arc<dyn IdGenerator>,
}

impl TokenStore {
    pub fn new(db: Arc<dyn Database>, id_generator: Arc<dyn IdGenerator>) -> Self {
        Self { db, id_generator }
    }

    fn read_record(&self, token: &str) -> Result<Option<(String, TokenType, i64)>> {
        let fields = self.db.hash_get_all(&record_key(token))?;
        if fields.is_empty() {
            return Ok(None);
        }
        let user_id = fields.get("user_id").cloned().ok_or_else(|| anyhow!("corrupt token record"))?;
        let token_type = fields
            .get("type")
            .and_then(|s| TokenType::parse(s))
            .ok_or_else(|| anyhow!("corrupt token record"))?;
        let valid_until: i64 = fields
            .get("valid_until")
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| anyhow!("corrupt token record"))?;
        Ok(Some((user_id, token_type, valid_until)))
    }

    /// Deletes a token everywhere. Order matters for crash safety: removing
    /// from the global set first means a crash mid-delete leaves the token
    /// unreachable from `check_token` even if the per-user bookkeeping and
    /// record linger.
    fn delete_token(&self, token: &str, user_id: &str, token_type: TokenType) -> Result<()> {
        self.db.set_remove(GLOBAL_SET_KEY, token)?;
        self.db.set_remove(&user_set_key(user_id, token_type), token)?;
        self.db.remove(&record_key(token))?;
        Ok(())
    }

    /// Mints a fresh token, retrying the ID if it happens to collide with an
    /// existing one. Bookkeeping is written in the order record -> per-user
    /// set -> global set, the reverse of deletion, so a token only ever
    /// becomes visible to `check_token` once its other bookkeeping exists.
    fn create_token(&self, user_id: &str, token_type: TokenType) -> Result<String> {
        let valid_until = now_minutes() + token_type.max_age_minutes();
        loop {
            let candidate = self.id_generator.create_id();
            let key = record_key(&candidate);
            if !self.db.hash_get_all(&key)?.is_empty() {
                continue;
            }
            self.db.hash_set(&key, "user_id", user_id)?;
            self.db.hash_set(&key, "type", token_type.as_str())?;
            self.db.hash_set(&key, "valid_until", &valid_until.to_string())?;
            self.db.set_add(&user_set_key(user_id, token_type), &candidate)?;
            self.db.set_add(GLOBAL_SET_KEY, &candidate)?;
            return Ok(candidate);
        }
    }

    /// Returns a token for `user_id`/`token_type`, reusing an existing one
    /// with enough remaining life, creating a new one otherwise. Expired
    /// tokens encountered along the way are deleted.
    pub fn get_token(&self, user_id: &str, token_type: TokenType) -> Result<String> {
        let now = now_minutes();
        let candidates = self.db.set_members(&user_set_key(user_id, token_type))?;
        let mut best: Option<(String, i64)> = None;
        for token in candidates {
            match self.read_record(&token)? {
                Some((_, _, valid_until)) if valid_until <= now => {
                    self.delete_token(&token, user_id, token_type)?;
                }
                Some((_, _, valid_until)) => {
                    if best.as_ref().map(|(_, b)| valid_until > *b).unwrap_or(true) {
                        best = Some((token, valid_until));
                    }
                }
                None => {}
            }
        }
        if let Some((token, valid_until)) = best {
            if valid_until - now >= token_type.min_age_minutes() {
                return Ok(token);
            }
        }
        self.create_token(user_id, token_type)
    }

    /// Validates `token`, optionally requiring it to be of `expected_type`.
    /// If `renew` and the remaining life has dropped below the min-age
    /// floor, mints a genuinely new token (the old one keeps working until
    /// its own expiry) and returns it alongside the resolved user ID --
    /// mirrors `UserToken::checkToken`'s `autoRenew`, which calls
    /// `createToken` rather than extending `token`'s own `validUntil`, so a
    /// client that cached the old token is not silently broken underneath
    /// it.
    pub fn check_token(
        &self,
        token: &str,
        expected_type: Option<TokenType>,
        renew: bool,
    ) -> Result<(String, Option<String>), ServiceError> {
        if !self
            .db
            .set_contains(GLOBAL_SET_KEY, token)
            .map_err(|_| ServiceError::internal_error())?
        {
            return Err(ServiceError::token_expired());
        }
        let record = self
            .read_record(token)
            .map_err(|_| ServiceError::internal_error())?
            .ok_or_else(ServiceError::token_expired)?;
        let (user_id, token_type, valid_until) = record;

        if let Some(expected) = expected_type {
            if expected != token_type {
                return Err(ServiceError::token_expired());
            }
        }

        let now = now_minutes();
        if valid_until <= now {
            let _ = self.delete_token(token, &user_id, token_type);
            return Err(ServiceError::token_expired());
        }

        // Route renewal through `get_token` rather than `create_token`
        // directly: repeated `check_token(..., renew=true)` calls against an
        // old, soon-to-expire token must keep returning the *same* new
        // token until that new token itself is the one presented, which
        // `get_token`'s "reuse an existing non-expiring-soon token" pass
        // provides for free once the first renewal's token has landed in
        // the per-user-per-type set.
        let new_token = if renew && valid_until - now < token_type.min_age_minutes() {
            Some(self.get_token(&user_id, token_type).map_err(|_| ServiceError::internal_error())?)
        } else {
            None
        };

        Ok((user_id, new_token))
    }

    /// Removes every token of every type belonging to `user_id`.
    pub fn clear_tokens(&self, user_id: &str) -> Result<()> {
        self.clear_token_types(user_id, &[TokenType::Login, TokenType::Api, TokenType::Reset])
    }

    /// `RESETTOKEN user types...` -- removes tokens of only the listed
    /// types, without validating that the types are well-formed (so stray
    /// tokens under a retired type name can still be cleaned up).
    pub fn clear_token_types(&self, user_id: &str, token_types: &[TokenType]) -> Result<()> {
        for &token_type in token_types {
            let tokens = self.db.set_members(&user_set_key(user_id, token_type))?;
            for token in tokens {
                self.delete_token(&token, user_id, token_type)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forge_common::{InMemoryDatabase, NumericalIdGenerator};

    fn store() -> TokenStore {
        TokenStore::new(Arc::new(InMemoryDatabase::new()), Arc::new(NumericalIdGenerator::new()))
    }

    #[test]
    fn get_token_creates_and_reuses() {
        let store = store();
        let a = store.get_token("42", TokenType::Login).unwrap();
        let b = store.get_token("42", TokenType::Login).unwrap();
        assert_eq!(a, b, "fresh token should be reused, not reminted");
    }

    #[test]
    fn check_token_resolves_to_owning_user() {
        let store = store();
        let token = store.get_token("42", TokenType::Api).unwrap();
        let (user_id, new_token) = store.check_token(&token, Some(TokenType::Api), false).unwrap();
        assert_eq!(user_id, "42");
        assert_eq!(new_token, None);
    }

    #[test]
    fn check_token_rejects_wrong_type() {
        let store = store();
        let token = store.get_token("42", TokenType::Login).unwrap();
        let err = store.check_token(&token, Some(TokenType::Reset), false).unwrap_err();
        assert_eq!(err.code, 404);
    }

    #[test]
    fn check_token_rejects_unknown_token() {
        let store = store();
        let err = store.check_token("not-a-real-token", None, false).unwrap_err();
        assert_eq!(err.code, 404);
    }

    #[test]
    fn clear_tokens_removes_every_type() {
        let store = store();
        let login = store.get_token("42", TokenType::Login).unwrap();
        let api = store.get_token("42", TokenType::Api).unwrap();
        store.clear_tokens("42").unwrap();
        assert!(store.check_token(&login, None, false).is_err());
        assert!(store.check_token(&api, None, false).is_err());
    }

    #[test]
    fn different_users_get_different_tokens() {
        let store = store();
        let a = store.get_token("1", TokenType::Login).unwrap();
        let b = store.get_token("2", TokenType::Login).unwrap();
        assert_ne!(a, b);
    }

    /// Manually installs a token whose remaining life is below the type's
    /// min-age, rather than waiting out three months of wall-clock time.
    fn install_near_expiry_token(store: &TokenStore, token: &str, user_id: &str, token_type: TokenType) {
        let valid_until = now_minutes() + 24 * 60;
        store.db.hash_set(&record_key(token), "user_id", user_id).unwrap();
        store.db.hash_set(&record_key(token), "type", token_type.as_str()).unwrap();
        store.db.hash_set(&record_key(token), "valid_until", &valid_until.to_string()).unwrap();
        store.db.set_add(&user_set_key(user_id, token_type), token).unwrap();
        store.db.set_add(GLOBAL_SET_KEY, token).unwrap();
    }

    #[test]
    fn check_token_renew_mints_new_token_leaving_old_one_valid() {
        let store = store();
        install_near_expiry_token(&store, "oooooooo", "1002", TokenType::Login);

        let (user_id, new_token) = store.check_token("oooooooo", Some(TokenType::Login), true).unwrap();
        assert_eq!(user_id, "1002");
        let new_token = new_token.expect("renewal should mint a new token");
        assert_ne!(new_token, "oooooooo");

        // the old token is still valid -- it only expires on its own schedule
        assert!(store.db.set_contains(GLOBAL_SET_KEY, "oooooooo").unwrap());
    }

    #[test]
    fn repeated_renewal_of_the_same_old_token_reports_the_same_new_token() {
        let store = store();
        install_near_expiry_token(&store, "oooooooo", "1002", TokenType::Login);

        let (_, first) = store.check_token("oooooooo", Some(TokenType::Login), true).unwrap();
        let (_, second) = store.check_token("oooooooo", Some(TokenType::Login), true).unwrap();
        assert_eq!(first, second, "second renewal should reuse the token minted by the first");
    }
}

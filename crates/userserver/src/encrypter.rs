//! Password hashing schemes and the primary/secondary composite that allows
//! live migration between them.
//!
//! Two schemes exist on the wire, distinguished by their leading digit:
//! `"1,..."` is the classic unsalted scheme kept only for backward
//! compatibility, `"2,salt,..."` is the current salted scheme. New passwords
//! are always written with the current scheme; existing classic hashes keep
//! validating until the user logs in again, at which point the login path
//! rehashes them.

use base64::Engine;
use md5::{Digest as Md5Digest, Md5};
use sha1::{Digest as Sha1Digest, Sha1};

/// Outcome of checking a password against a stored hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckResult {
    Invalid,
    /// Matched the current scheme; nothing to do.
    ValidCurrent,
    /// Matched an older scheme; the caller should re-hash with the current
    /// one and overwrite the stored value.
    ValidNeedUpdate,
}

pub trait PasswordEncrypter: Send + Sync {
    fn encrypt_password(&self, user_id: &str, password: &str) -> String;
    /// Checks `password` against `hash`. Returns `Invalid` both when the
    /// password is wrong and when `hash` is not in this encrypter's format --
    /// callers that need to distinguish "wrong scheme" from "wrong password"
    /// should try encrypters in a defined order, as `MultiPasswordEncrypter`
    /// does.
    fn check_password(&self, user_id: &str, password: &str, hash: &str) -> bool;
}

/// `"1," + base64(MD5(key ++ password))` with `=` padding stripped. `key`
/// here is a global secret mixed into every hash, not the user ID. Uses the
/// standard base64 alphabet rather than a URL-safe one, for wire
/// compatibility with already-stored hashes.
pub struct ClassicEncrypter {
    key: String,
}

impl ClassicEncrypter {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

impl PasswordEncrypter for ClassicEncrypter {
    fn encrypt_password(&self, _user_id: &str, password: &str) -> String {
        let mut hasher = Md5::new();
        hasher.update(self.key.as_bytes());
        hasher.update(password.as_bytes());
        let digest = hasher.finalize();
        let encoded = base64::engine::general_purpose::STANDARD_NO_PAD.encode(digest);
        format!("1,{encoded}")
    }

    fn check_password(&self, user_id: &str, password: &str, hash: &str) -> bool {
        match hash.strip_prefix("1,") {
            Some(_) => self.encrypt_password(user_id, password) == hash,
            None => false,
        }
    }
}

/// `"2," + salt + "," + hex(SHA1("2," + salt + "," + userId + "," + password))`.
pub struct SaltedPasswordEncrypter {
    id_generator: std::sync::Arc<dyn forge_common::IdGenerator>,
}

impl SaltedPasswordEncrypter {
    pub fn new(id_generator: std::sync::Arc<dyn forge_common::IdGenerator>) -> Self {
        Self { id_generator }
    }

    fn digest(salt: &str, user_id: &str, password: &str) -> String {
        let mut hasher = Sha1::new();
        hasher.update(format!("2,{salt},{user_id},{password}").as_bytes());
        hex::encode(hasher.finalize())
    }

    fn encrypt_with_salt(salt: &str, user_id: &str, password: &str) -> String {
        format!("2,{},{}", salt, Self::digest(salt, user_id, password))
    }
}

impl PasswordEncrypter for SaltedPasswordEncrypter {
    fn encrypt_password(&self, user_id: &str, password: &str) -> String {
        let salt = self.id_generator.create_id();
        Self::encrypt_with_salt(&salt, user_id, password)
    }

    fn check_password(&self, user_id: &str, password: &str, hash: &str) -> bool {
        let Some(rest) = hash.strip_prefix("2,") else {
            return false;
        };
        let Some((salt, _)) = rest.split_once(',') else {
            return false;
        };
        Self::encrypt_with_salt(salt, user_id, password) == hash
    }
}

/// Tries the primary (current) scheme, then the secondary (legacy) scheme,
/// signaling `ValidNeedUpdate` when only the secondary matched so the caller
/// can migrate the stored hash.
pub struct MultiPasswordEncrypter {
    primary: Box<dyn PasswordEncrypter>,
    secondary: Box<dyn PasswordEncrypter>,
}

impl MultiPasswordEncrypter {
    pub fn new(primary: Box<dyn PasswordEncrypter>, secondary: Box<dyn PasswordEncrypter>) -> Self {
        Self { primary, secondary }
    }

    pub fn encrypt_password(&self, user_id: &str, password: &str) -> String {
        self.primary.encrypt_password(user_id, password)
    }

    pub fn check_password(&self, user_id: &str, password: &str, hash: &str) -> CheckResult {
        if self.primary.check_password(user_id, password, hash) {
            CheckResult::ValidCurrent
        } else if self.secondary.check_password(user_id, password, hash) {
            CheckResult::ValidNeedUpdate
        } else {
            CheckResult::Invalid
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forge_common::NumericalIdGenerator;
    use std::sync::Arc;

    #[test]
    fn classic_roundtrips() {
        let enc = ClassicEncrypter::new("sitekey");
        let hash = enc.encrypt_password("42", "hunter2");
        assert!(hash.starts_with("1,"));
        assert!(enc.check_password("42", "hunter2", &hash));
        assert!(!enc.check_password("42", "wrong", &hash));
    }

    #[test]
    fn salted_roundtrips_and_varies_salt_per_call() {
        let gen = Arc::new(NumericalIdGenerator::new());
        let enc = SaltedPasswordEncrypter::new(gen);
        let hash1 = enc.encrypt_password("42", "hunter2");
        let hash2 = enc.encrypt_password("42", "hunter2");
        assert_ne!(hash1, hash2, "different salts should produce different hashes");
        assert!(enc.check_password("42", "hunter2", &hash1));
        assert!(enc.check_password("42", "hunter2", &hash2));
    }

    #[test]
    fn salted_check_rejects_wrong_user_id() {
        let gen = Arc::new(NumericalIdGenerator::new());
        let enc = SaltedPasswordEncrypter::new(gen);
        let hash = enc.encrypt_password("42", "hunter2");
        assert!(!enc.check_password("43", "hunter2", &hash));
    }

    #[test]
    fn multi_reports_current_when_primary_matches() {
        let gen = Arc::new(NumericalIdGenerator::new());
        let multi = MultiPasswordEncrypter::new(
            Box::new(SaltedPasswordEncrypter::new(gen)),
            Box::new(ClassicEncrypter::new("sitekey")),
        );
        let hash = multi.encrypt_password("1", "hunter2");
        assert_eq!(multi.check_password("1", "hunter2", &hash), CheckResult::ValidCurrent);
    }

    #[test]
    fn multi_reports_need_update_when_only_secondary_matches() {
        let gen = Arc::new(NumericalIdGenerator::new());
        let classic = ClassicEncrypter::new("sitekey");
        let legacy_hash = classic.encrypt_password("1", "hunter2");
        let multi = MultiPasswordEncrypter::new(
            Box::new(SaltedPasswordEncrypter::new(gen)),
            Box::new(ClassicEncrypter::new("sitekey")),
        );
        assert_eq!(
            multi.check_password("1", "hunter2", &legacy_hash),
            CheckResult::ValidNeedUpdate
        );
    }

    #[test]
    fn multi_reports_invalid_when_neither_matches() {
        let gen = Arc::new(NumericalIdGenerator::new());
        let multi = MultiPasswordEncrypter::new(
            Box::new(SaltedPasswordEncrypter::new(gen)),
            Box::new(ClassicEncrypter::new("sitekey")),
        );
        let hash = multi.encrypt_password("1", "hunter2");
        assert_eq!(multi.check_password("1", "wrong", &hash), CheckResult::Invalid);
    }
}

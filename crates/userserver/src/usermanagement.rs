//! Account creation, login, and profile storage.

use std::sync::{Arc, Mutex, RwLock};

use forge_common::{Database, IdGenerator};
use forge_protocol::ServiceError;

use crate::encrypter::{CheckResult, MultiPasswordEncrypter};
use crate::userdata::UserData;

/// Canonicalises a login name: lower-cased, with anything that is not an
/// ASCII letter or digit stripped out entirely (not just trimmed), matching
/// `simplifyUserName`'s use for the name -> id lookup key.
fn simplify_user_name(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .flat_map(|c| c.to_lowercase())
        .collect()
}

fn name_key(simplified: &str) -> String {
    format!("name:{simplified}")
}

fn profile_key(user_id: &str) -> String {
    format!("user:{user_id}")
}

const ALL_USERS_KEY: &str = "users:all";

pub struct UserManagement {
    db: Arc<dyn Database>,
    id_generator: Arc<dyn IdGenerator>,
    encrypter: Arc<MultiPasswordEncrypter>,
    max_user_data_total_size: usize,
    user_data: RwLock<std::collections::HashMap<String, Mutex<UserData>>>,
}

impl UserManagement {
    pub fn new(
        db: Arc<dyn Database>,
        id_generator: Arc<dyn IdGenerator>,
        encrypter: Arc<MultiPasswordEncrypter>,
        max_user_data_total_size: usize,
    ) -> Self {
        Self {
            db,
            id_generator,
            encrypter,
            max_user_data_total_size,
            user_data: RwLock::new(std::collections::HashMap::new()),
        }
    }

    /// Registers a new account, returning its user ID. Fails if the
    /// (case-insensitively simplified) name is already taken. `config` is an
    /// even-length list of profile key/value pairs applied after the
    /// mandatory `password`/`screenname` fields, as `ADDUSER user pass
    /// [k v...]` allows on the wire.
    pub fn add(&self, name: &str, password: &str, config: &[(&str, &str)]) -> Result<String, ServiceError> {
        let simplified = simplify_user_name(name);
        if simplified.is_empty() {
            return Err(ServiceError::unprocessable("user name must not be empty"));
        }
        let reserved = self
            .db
            .set_unique(&name_key(&simplified), "0")
            .map_err(|_| ServiceError::internal_error())?;
        if !reserved {
            return Err(ServiceError::already_exists());
        }

        let user_id = self.id_generator.create_id();
        let hash = self.encrypter.encrypt_password(&user_id, password);

        self.db
            .hash_set(&profile_key(&user_id), "password", &hash)
            .map_err(|_| ServiceError::internal_error())?;
        self.db
            .hash_set(&profile_key(&user_id), "screenname", name)
            .map_err(|_| ServiceError::internal_error())?;
        for (key, value) in config {
            self.db
                .hash_set(&profile_key(&user_id), key, value)
                .map_err(|_| ServiceError::internal_error())?;
        }
        self.db
            .set(&name_key(&simplified), &user_id)
            .map_err(|_| ServiceError::internal_error())?;
        self.db
            .hash_set(&format!("uid:{user_id}"), "name", &simplified)
            .map_err(|_| ServiceError::internal_error())?;
        self.db
            .set_add(ALL_USERS_KEY, &user_id)
            .map_err(|_| ServiceError::internal_error())?;

        Ok(user_id)
    }

    /// Validates a login, rehashing the stored password if it was only
    /// valid under a legacy scheme.
    pub fn login(&self, name: &str, password: &str) -> Result<String, ServiceError> {
        let user_id = self.get_user_id_by_name(name)?;
        let hash = self
            .db
            .hash_get(&profile_key(&user_id), "password")
            .map_err(|_| ServiceError::internal_error())?
            .filter(|h| !h.is_empty())
            .ok_or_else(ServiceError::invalid_password)?;

        match self.encrypter.check_password(&user_id, password, &hash) {
            CheckResult::Invalid => Err(ServiceError::invalid_password()),
            CheckResult::ValidCurrent => Ok(user_id),
            CheckResult::ValidNeedUpdate => {
                let new_hash = self.encrypter.encrypt_password(&user_id, password);
                let _ = self.db.hash_set(&profile_key(&user_id), "password", &new_hash);
                Ok(user_id)
            }
        }
    }

    pub fn set_password(&self, user_id: &str, password: &str) -> Result<(), ServiceError> {
        let hash = self.encrypter.encrypt_password(user_id, password);
        self.db
            .hash_set(&profile_key(user_id), "password", &hash)
            .map_err(|_| ServiceError::internal_error())
    }

    pub fn get_user_id_by_name(&self, name: &str) -> Result<String, ServiceError> {
        let simplified = simplify_user_name(name);
        let id = self
            .db
            .get(&name_key(&simplified))
            .map_err(|_| ServiceError::internal_error())?
            .filter(|id| !id.is_empty())
            .ok_or_else(ServiceError::invalid_username)?;
        if id == "0" {
            return Err(ServiceError::invalid_username());
        }
        Ok(id)
    }

    /// Tombstones an account: the login name is repointed at the reserved
    /// id `"0"` (blocked) so it can never resolve to a live user again, but
    /// the name itself stays claimed and the numeric id is never reused.
    pub fn remove(&self, user_id: &str) -> Result<(), ServiceError> {
        let name = self.get_name_by_user_id(user_id)?;
        self.db
            .set(&name_key(&name), "0")
            .map_err(|_| ServiceError::internal_error())?;
        self.db
            .set_remove(ALL_USERS_KEY, user_id)
            .map_err(|_| ServiceError::internal_error())?;
        Ok(())
    }

    pub fn get_name_by_user_id(&self, user_id: &str) -> Result<String, ServiceError> {
        self.db
            .hash_get(&format!("uid:{user_id}"), "name")
            .map_err(|_| ServiceError::internal_error())?
            .ok_or_else(ServiceError::not_found)
    }

    /// `MNAME uid...` -- looks up several users' login names in one round.
    pub fn get_names_by_user_ids(&self, user_ids: &[&str]) -> Result<Vec<String>, ServiceError> {
        user_ids.iter().map(|id| self.get_name_by_user_id(id)).collect()
    }

    pub fn get_profile(&self, user_id: &str, key: &str) -> Result<Option<String>, ServiceError> {
        self.db
            .hash_get(&profile_key(user_id), key)
            .map_err(|_| ServiceError::internal_error())
    }

    /// `MGET uid k...` -- looks up several profile keys for one user in one
    /// round; missing keys come back as `None` rather than failing the
    /// whole batch.
    pub fn get_profiles(&self, user_id: &str, keys: &[&str]) -> Result<Vec<Option<String>>, ServiceError> {
        keys.iter().map(|key| self.get_profile(user_id, key)).collect()
    }

    pub fn set_profile(&self, user_id: &str, key: &str, value: &str) -> Result<(), ServiceError> {
        self.db
            .hash_set(&profile_key(user_id), key, value)
            .map_err(|_| ServiceError::internal_error())
    }

    /// `SET uid [k v...]` -- applies an even-length list of profile
    /// key/value pairs.
    pub fn set_profiles(&self, user_id: &str, config: &[(&str, &str)]) -> Result<(), ServiceError> {
        for (key, value) in config {
            self.set_profile(user_id, key, value)?;
        }
        Ok(())
    }

    /// Runs `f` against `user_id`'s bounded key/value store, creating it on
    /// first access.
    pub fn with_user_data<R>(&self, user_id: &str, f: impl FnOnce(&mut UserData) -> R) -> R {
        {
            let existing = self.user_data.read().unwrap();
            if let Some(entry) = existing.get(user_id) {
                return f(&mut entry.lock().unwrap());
            }
        }
        let mut write_guard = self.user_data.write().unwrap();
        let entry = write_guard
            .entry(user_id.to_string())
            .or_insert_with(|| Mutex::new(UserData::new(self.max_user_data_total_size)));
        f(&mut entry.lock().unwrap())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encrypter::{ClassicEncrypter, SaltedPasswordEncrypter};
    use forge_common::{InMemoryDatabase, NumericalIdGenerator};

    fn management() -> UserManagement {
        let db: Arc<dyn Database> = Arc::new(InMemoryDatabase::new());
        let id_generator: Arc<dyn IdGenerator> = Arc::new(NumericalIdGenerator::new());
        let encrypter = Arc::new(MultiPasswordEncrypter::new(
            Box::new(SaltedPasswordEncrypter::new(id_generator.clone())),
            Box::new(ClassicEncrypter::new("sitekey")),
        ));
        UserManagement::new(db, id_generator, encrypter, 4096)
    }

    #[test]
    fn add_then_login_succeeds() {
        let mgmt = management();
        let user_id = mgmt.add("Alice", "hunter2", &[]).unwrap();
        let logged_in = mgmt.login("alice", "hunter2").unwrap();
        assert_eq!(user_id, logged_in);
    }

    #[test]
    fn add_is_case_insensitive_on_name_collision() {
        let mgmt = management();
        mgmt.add("Alice", "hunter2", &[]).unwrap();
        let err = mgmt.add("alice", "different", &[]).unwrap_err();
        assert_eq!(err.code, 409);
    }

    #[test]
    fn login_rejects_unknown_user() {
        let mgmt = management();
        let err = mgmt.login("ghost", "x").unwrap_err();
        assert_eq!(err.code, 401);
    }

    #[test]
    fn login_rejects_wrong_password() {
        let mgmt = management();
        mgmt.add("Alice", "hunter2", &[]).unwrap();
        let err = mgmt.login("alice", "wrong").unwrap_err();
        assert_eq!(err.code, 401);
    }

    #[test]
    fn profile_roundtrips() {
        let mgmt = management();
        let user_id = mgmt.add("Alice", "hunter2", &[]).unwrap();
        mgmt.set_profile(&user_id, "prop:timezone", "UTC").unwrap();
        assert_eq!(mgmt.get_profile(&user_id, "prop:timezone").unwrap(), Some("UTC".to_string()));
    }

    #[test]
    fn user_data_persists_across_calls_for_same_user() {
        let mgmt = management();
        let user_id = mgmt.add("Alice", "hunter2", &[]).unwrap();
        mgmt.with_user_data(&user_id, |d| d.set("k", "v"));
        let value = mgmt.with_user_data(&user_id, |d| d.get("k").map(str::to_string));
        assert_eq!(value, Some("v".to_string()));
    }
}

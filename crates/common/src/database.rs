//! Abstraction over the external key/value store that backs user accounts,
//! tokens, and per-user data. Account/token bookkeeping in the real deployment
//! lives in a shared store outside any one service's process; `Database` is
//! the seam that lets the user service be written against that contract
//! without pulling a concrete store into every test.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use anyhow::Result;

/// String, hash, and set primitives plus an atomic "claim this key" op
/// (`set_unique`, the `SETNX` idiom) used for allocating user names and IDs
/// without a race between concurrent `add` calls.
pub trait Database: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    /// Sets `key` to `value` only if it did not already exist. Returns
    /// whether the set happened.
    fn set_unique(&self, key: &str, value: &str) -> Result<bool>;
    fn remove(&self, key: &str) -> Result<()>;

    fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>>;
    fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<()>;
    fn hash_remove(&self, key: &str, field: &str) -> Result<()>;
    fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>>;

    fn set_add(&self, key: &str, member: &str) -> Result<()>;
    fn set_remove(&self, key: &str, member: &str) -> Result<()>;
    fn set_members(&self, key: &str) -> Result<HashSet<String>>;
    fn set_contains(&self, key: &str, member: &str) -> Result<bool>;
}

#[derive(Debug, Clone, Default)]
enum Entry {
    #[default]
    Missing,
    Str(String),
    Hash(HashMap<String, String>),
    Set(HashSet<String>),
}

/// An in-process store used by tests and by standalone deployments that do
/// not need the bookkeeping to survive a process restart.
#[derive(Default)]
pub struct InMemoryDatabase {
    entries: RwLock<HashMap<String, Entry>>,
}

impl InMemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Database for InMemoryDatabase {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self.entries.read().unwrap();
        match entries.get(key) {
            Some(Entry::Str(s)) => Ok(Some(s.clone())),
            _ => Ok(None),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = self.entries.write().unwrap();
        entries.insert(key.to_string(), Entry::Str(value.to_string()));
        Ok(())
    }

    fn set_unique(&self, key: &str, value: &str) -> Result<bool> {
        let mut entries = self.entries.write().unwrap();
        match entries.get(key) {
            Some(Entry::Missing) | None => {
                entries.insert(key.to_string(), Entry::Str(value.to_string()));
                Ok(true)
            }
            Some(_) => Ok(false),
        }
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.entries.write().unwrap().remove(key);
        Ok(())
    }

    fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>> {
        let entries = self.entries.read().unwrap();
        match entries.get(key) {
            Some(Entry::Hash(h)) => Ok(h.get(field).cloned()),
            _ => Ok(None),
        }
    }

    fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let mut entries = self.entries.write().unwrap();
        match entries.entry(key.to_string()).or_insert_with(|| Entry::Hash(HashMap::new())) {
            Entry::Hash(h) => {
                h.insert(field.to_string(), value.to_string());
                Ok(())
            }
            other => {
                *other = Entry::Hash(HashMap::from([(field.to_string(), value.to_string())]));
                Ok(())
            }
        }
    }

    fn hash_remove(&self, key: &str, field: &str) -> Result<()> {
        let mut entries = self.entries.write().unwrap();
        if let Some(Entry::Hash(h)) = entries.get_mut(key) {
            h.remove(field);
        }
        Ok(())
    }

    fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>> {
        let entries = self.entries.read().unwrap();
        match entries.get(key) {
            Some(Entry::Hash(h)) => Ok(h.clone()),
            _ => Ok(HashMap::new()),
        }
    }

    fn set_add(&self, key: &str, member: &str) -> Result<()> {
        let mut entries = self.entries.write().unwrap();
        match entries.entry(key.to_string()).or_insert_with(|| Entry::Set(HashSet::new())) {
            Entry::Set(s) => {
                s.insert(member.to_string());
                Ok(())
            }
            other => {
                *other = Entry::Set(HashSet::from([member.to_string()]));
                Ok(())
            }
        }
    }

    fn set_remove(&self, key: &str, member: &str) -> Result<()> {
        let mut entries = self.entries.write().unwrap();
        if let Some(Entry::Set(s)) = entries.get_mut(key) {
            s.remove(member);
        }
        Ok(())
    }

    fn set_members(&self, key: &str) -> Result<HashSet<String>> {
        let entries = self.entries.read().unwrap();
        match entries.get(key) {
            Some(Entry::Set(s)) => Ok(s.clone()),
            _ => Ok(HashSet::new()),
        }
    }

    fn set_contains(&self, key: &str, member: &str) -> Result<bool> {
        let entries = self.entries.read().unwrap();
        match entries.get(key) {
            Some(Entry::Set(s)) => Ok(s.contains(member)),
            _ => Ok(false),
        }
    }
}

#[cfg(feature = "redis-backend")]
pub mod redis_backend {
    use super::*;
    use redis::Commands;
    use std::sync::Mutex;

    /// A `Database` backed by a real redis-compatible server, using a single
    /// shared blocking connection guarded by a mutex. Command handlers in
    /// this codebase are already serialized per-connection at the protocol
    /// level, so a pooled async client buys little here.
    pub struct RedisDatabase {
        conn: Mutex<redis::Connection>,
    }

    impl RedisDatabase {
        pub fn connect(url: &str) -> Result<Self> {
            let client = redis::Client::open(url)?;
            let conn = client.get_connection()?;
            Ok(Self { conn: Mutex::new(conn) })
        }
    }

    impl Database for RedisDatabase {
        fn get(&self, key: &str) -> Result<Option<String>> {
            let mut conn = self.conn.lock().unwrap();
            Ok(conn.get(key)?)
        }

        fn set(&self, key: &str, value: &str) -> Result<()> {
            let mut conn = self.conn.lock().unwrap();
            conn.set(key, value)?;
            Ok(())
        }

        fn set_unique(&self, key: &str, value: &str) -> Result<bool> {
            let mut conn = self.conn.lock().unwrap();
            Ok(conn.set_nx(key, value)?)
        }

        fn remove(&self, key: &str) -> Result<()> {
            let mut conn = self.conn.lock().unwrap();
            conn.del(key)?;
            Ok(())
        }

        fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>> {
            let mut conn = self.conn.lock().unwrap();
            Ok(conn.hget(key, field)?)
        }

        fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<()> {
            let mut conn = self.conn.lock().unwrap();
            conn.hset(key, field, value)?;
            Ok(())
        }

        fn hash_remove(&self, key: &str, field: &str) -> Result<()> {
            let mut conn = self.conn.lock().unwrap();
            conn.hdel(key, field)?;
            Ok(())
        }

        fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>> {
            let mut conn = self.conn.lock().unwrap();
            Ok(conn.hgetall(key)?)
        }

        fn set_add(&self, key: &str, member: &str) -> Result<()> {
            let mut conn = self.conn.lock().unwrap();
            conn.sadd(key, member)?;
            Ok(())
        }

        fn set_remove(&self, key: &str, member: &str) -> Result<()> {
            let mut conn = self.conn.lock().unwrap();
            conn.srem(key, member)?;
            Ok(())
        }

        fn set_members(&self, key: &str) -> Result<HashSet<String>> {
            let mut conn = self.conn.lock().unwrap();
            Ok(conn.smembers(key)?)
        }

        fn set_contains(&self, key: &str, member: &str) -> Result<bool> {
            let mut conn = self.conn.lock().unwrap();
            Ok(conn.sismember(key, member)?)
        }
    }
}

#[cfg(feature = "redis-backend")]
pub use redis_backend::RedisDatabase;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_get_roundtrip() {
        let db = InMemoryDatabase::new();
        db.set("k", "v").unwrap();
        assert_eq!(db.get("k").unwrap(), Some("v".to_string()));
    }

    #[test]
    fn set_unique_only_claims_once() {
        let db = InMemoryDatabase::new();
        assert!(db.set_unique("name:bob", "1").unwrap());
        assert!(!db.set_unique("name:bob", "2").unwrap());
        assert_eq!(db.get("name:bob").unwrap(), Some("1".to_string()));
    }

    #[test]
    fn hash_fields_are_independent() {
        let db = InMemoryDatabase::new();
        db.hash_set("user:1", "name", "bob").unwrap();
        db.hash_set("user:1", "email", "bob@example.com").unwrap();
        assert_eq!(db.hash_get("user:1", "name").unwrap(), Some("bob".to_string()));
        db.hash_remove("user:1", "name").unwrap();
        assert_eq!(db.hash_get("user:1", "name").unwrap(), None);
        assert_eq!(db.hash_get("user:1", "email").unwrap(), Some("bob@example.com".to_string()));
    }

    #[test]
    fn set_members_reflect_add_and_remove() {
        let db = InMemoryDatabase::new();
        db.set_add("tokens:1:login", "tok-a").unwrap();
        db.set_add("tokens:1:login", "tok-b").unwrap();
        assert!(db.set_contains("tokens:1:login", "tok-a").unwrap());
        db.set_remove("tokens:1:login", "tok-a").unwrap();
        assert!(!db.set_contains("tokens:1:login", "tok-a").unwrap());
        assert_eq!(db.set_members("tokens:1:login").unwrap().len(), 1);
    }

    #[test]
    fn missing_keys_read_as_empty() {
        let db = InMemoryDatabase::new();
        assert_eq!(db.get("nope").unwrap(), None);
        assert!(db.hash_get_all("nope").unwrap().is_empty());
        assert!(db.set_members("nope").unwrap().is_empty());
    }
}

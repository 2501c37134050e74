//! Request/response correlation.
//!
//! Every message carries a correlation key built from a configured list of
//! field ids ([`KeyFields`]). Inbound replies are parked in
//! [`PendingResults`] under that key until the waiting request claims them.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::rc::Rc;

use isolink_core::IsoMessage;

use crate::{ClientError, ConfigError};

/// Default key field: a free-form identifier field.
pub const DEFAULT_KEY_FIELD: u32 = 1000;

/// Default bound on unclaimed replies held by a [`PendingResults`].
pub const DEFAULT_MAX_PENDING_REPLIES: usize = 1024;

/// Ordered list of field ids whose values form a correlation key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyFields {
    fields: Vec<u32>,
}

impl KeyFields {
    /// Build from explicit field ids.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidKeyFields`] if `fields` is empty.
    pub fn new(fields: Vec<u32>) -> Result<Self, ConfigError> {
        if fields.is_empty() {
            return Err(ConfigError::InvalidKeyFields {
                value: String::new(),
            });
        }
        Ok(Self { fields })
    }

    /// Parse a comma-separated list such as `"41,11"`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidKeyFields`] for an empty list or a
    /// non-numeric entry.
    pub fn parse(value: &str) -> Result<Self, ConfigError> {
        let invalid = || ConfigError::InvalidKeyFields {
            value: value.to_string(),
        };
        let fields = value
            .split(',')
            .map(|part| part.trim().parse::<u32>().map_err(|_| invalid()))
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(fields).map_err(|_| invalid())
    }

    /// The configured field ids, in key order.
    pub fn fields(&self) -> &[u32] {
        &self.fields
    }

    /// Correlation key of `msg`: the configured field values concatenated.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::MissingKeyField`] naming the first absent field.
    pub fn key_for(&self, msg: &IsoMessage) -> Result<String, ClientError> {
        let mut key = String::new();
        for &field in &self.fields {
            let value = msg
                .get_string(field)
                .ok_or(ClientError::MissingKeyField { field })?;
            key.push_str(&value);
        }
        Ok(key)
    }

    /// Fill every key field with a fresh UUID and return the resulting key.
    pub fn stamp_unique(&self, msg: &mut IsoMessage) -> String {
        let mut key = String::new();
        for &field in &self.fields {
            let id = uuid::Uuid::new_v4().to_string();
            key.push_str(&id);
            msg.set(field, id);
        }
        key
    }
}

impl Default for KeyFields {
    fn default() -> Self {
        Self {
            fields: vec![DEFAULT_KEY_FIELD],
        }
    }
}

/// Another request already waits on this key.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("key {key} is already in flight")]
pub struct DuplicateKey {
    /// The contested key.
    pub key: String,
}

impl From<DuplicateKey> for ClientError {
    fn from(err: DuplicateKey) -> Self {
        ClientError::DuplicateKey { key: err.key }
    }
}

struct StoreInner {
    /// Serialized replies not yet claimed.
    replies: HashMap<String, Vec<u8>>,
    /// Reply keys in arrival order; may hold keys already claimed.
    arrivals: VecDeque<String>,
    /// Keys currently awaited by a request.
    in_flight: HashSet<String>,
    max_replies: usize,
}

impl StoreInner {
    /// Drop the oldest unawaited replies until the store is within bounds.
    fn evict_overflow(&mut self) {
        if self.arrivals.len() > 2 * self.max_replies {
            let replies = &self.replies;
            self.arrivals.retain(|key| replies.contains_key(key));
        }

        while self.replies.len() > self.max_replies {
            let Some(pos) = self.arrivals.iter().position(|key| {
                self.replies.contains_key(key) && !self.in_flight.contains(key)
            }) else {
                break;
            };
            if let Some(key) = self.arrivals.remove(pos) {
                self.replies.remove(&key);
                tracing::warn!("PendingResults: evicted unclaimed reply for key {}", key);
            }
        }
    }
}

/// Key → serialized reply map, plus the set of keys being awaited.
///
/// Each inserted reply is removed at most once. Clones share the same
/// store. No borrow is held outside a single method call, so the store can be
/// used from polling closures and inbound handlers alike.
///
/// A reply whose request already gave up is never claimed. Such replies are
/// kept until the store exceeds its limit, at which point the oldest replies
/// nobody is awaiting are evicted first.
#[derive(Clone)]
pub struct PendingResults {
    inner: Rc<RefCell<StoreInner>>,
}

impl Default for PendingResults {
    fn default() -> Self {
        Self::with_limit(DEFAULT_MAX_PENDING_REPLIES)
    }
}

impl PendingResults {
    /// Create an empty store holding up to [`DEFAULT_MAX_PENDING_REPLIES`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty store holding at most `max_replies` unclaimed replies
    /// (at least one).
    pub fn with_limit(max_replies: usize) -> Self {
        Self {
            inner: Rc::new(RefCell::new(StoreInner {
                replies: HashMap::new(),
                arrivals: VecDeque::new(),
                in_flight: HashSet::new(),
                max_replies: max_replies.max(1),
            })),
        }
    }

    /// Maximum number of unclaimed replies kept.
    pub fn limit(&self) -> usize {
        self.inner.borrow().max_replies
    }

    /// Store a reply, overwriting any unclaimed reply with the same key.
    ///
    /// When the store is full the oldest reply nobody is awaiting is
    /// evicted. Returns true if an earlier reply was replaced.
    pub fn put(&self, key: impl Into<String>, bytes: Vec<u8>) -> bool {
        let key = key.into();
        let mut inner = self.inner.borrow_mut();
        let replaced = inner.replies.insert(key.clone(), bytes).is_some();
        if replaced {
            tracing::warn!("PendingResults: unclaimed reply for key {} replaced", key);
        } else {
            inner.arrivals.push_back(key);
        }
        inner.evict_overflow();
        replaced
    }

    /// Take the reply stored under `key`, if any.
    pub fn remove(&self, key: &str) -> Option<Vec<u8>> {
        self.inner.borrow_mut().replies.remove(key)
    }

    /// Whether a reply is waiting under `key`.
    pub fn contains(&self, key: &str) -> bool {
        self.inner.borrow().replies.contains_key(key)
    }

    /// Number of unclaimed replies.
    pub fn len(&self) -> usize {
        self.inner.borrow().replies.len()
    }

    /// Whether no reply is waiting.
    pub fn is_empty(&self) -> bool {
        self.inner.borrow().replies.is_empty()
    }

    /// Whether a request currently waits on `key`.
    pub fn is_in_flight(&self, key: &str) -> bool {
        self.inner.borrow().in_flight.contains(key)
    }

    /// Register `key` as awaited for as long as the returned guard lives.
    ///
    /// # Errors
    ///
    /// Returns [`DuplicateKey`] if the key is already registered.
    pub fn begin(&self, key: impl Into<String>) -> Result<InFlightKey, DuplicateKey> {
        let key = key.into();
        if !self.inner.borrow_mut().in_flight.insert(key.clone()) {
            return Err(DuplicateKey { key });
        }
        Ok(InFlightKey {
            store: self.inner.clone(),
            key,
        })
    }
}

/// Registration of an awaited key; deregisters on drop.
pub struct InFlightKey {
    store: Rc<RefCell<StoreInner>>,
    key: String,
}

impl InFlightKey {
    /// The registered key.
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for InFlightKey {
    fn drop(&mut self) {
        self.store.borrow_mut().in_flight.remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_concatenates_fields_in_order() {
        let keys = KeyFields::parse("41, 11").expect("valid list");
        let msg = IsoMessage::new("0200")
            .with_field(11, "000123")
            .with_field(41, "TERM01");
        assert_eq!(keys.key_for(&msg).expect("key"), "TERM01000123");
    }

    #[test]
    fn test_key_renders_binary_as_hex() {
        let keys = KeyFields::new(vec![52]).expect("valid");
        let msg = IsoMessage::new("0200").with_field(52, vec![0xab, 0x01]);
        assert_eq!(keys.key_for(&msg).expect("key"), "ab01");
    }

    #[test]
    fn test_missing_key_field() {
        let keys = KeyFields::parse("41,11").expect("valid list");
        let msg = IsoMessage::new("0200").with_field(41, "A1");
        assert!(matches!(
            keys.key_for(&msg),
            Err(ClientError::MissingKeyField { field: 11 })
        ));
    }

    #[test]
    fn test_parse_rejects_bad_lists() {
        assert!(KeyFields::parse("").is_err());
        assert!(KeyFields::parse("41,x").is_err());
        assert!(KeyFields::new(Vec::new()).is_err());
        assert_eq!(KeyFields::default().fields(), &[DEFAULT_KEY_FIELD]);
    }

    #[test]
    fn test_stamp_unique_sets_every_key_field() {
        let keys = KeyFields::parse("1000,11").expect("valid list");
        let mut a = IsoMessage::new("2800");
        let mut b = IsoMessage::new("2800");

        let key_a = keys.stamp_unique(&mut a);
        let key_b = keys.stamp_unique(&mut b);

        assert_ne!(key_a, key_b);
        assert_eq!(keys.key_for(&a).expect("key"), key_a);
        assert_eq!(key_a.len(), 72);
    }

    #[test]
    fn test_reply_is_claimed_once() {
        let store = PendingResults::new();
        assert!(!store.put("A1", vec![1]));
        assert!(store.contains("A1"));
        assert_eq!(store.len(), 1);

        assert_eq!(store.remove("A1"), Some(vec![1]));
        assert_eq!(store.remove("A1"), None);
        assert!(store.is_empty());
    }

    #[test]
    fn test_put_overwrites_unclaimed_reply() {
        let store = PendingResults::new();
        store.put("A1", vec![1]);
        assert!(store.put("A1", vec![2]));
        assert_eq!(store.remove("A1"), Some(vec![2]));
    }

    #[test]
    fn test_full_store_evicts_oldest_unawaited_reply() {
        let store = PendingResults::with_limit(2);
        assert_eq!(store.limit(), 2);
        let _awaited = store.begin("late-1").expect("first");

        store.put("late-1", vec![1]);
        store.put("late-2", vec![2]);
        store.put("late-3", vec![3]);

        // late-1 is older but still awaited, so late-2 goes.
        assert_eq!(store.len(), 2);
        assert!(store.contains("late-1"));
        assert!(!store.contains("late-2"));
        assert!(store.contains("late-3"));
    }

    #[test]
    fn test_claimed_keys_do_not_count_against_limit() {
        let store = PendingResults::with_limit(2);
        for i in 0..10 {
            let key = format!("k{i}");
            store.put(key.clone(), vec![i]);
            assert_eq!(store.remove(&key), Some(vec![i]));
        }
        store.put("a", vec![1]);
        store.put("b", vec![2]);
        assert_eq!(store.len(), 2);
        assert!(store.contains("a") && store.contains("b"));
    }

    #[test]
    fn test_in_flight_guard() {
        let store = PendingResults::new();
        let guard = store.begin("A1").expect("first");
        assert_eq!(guard.key(), "A1");
        assert!(store.is_in_flight("A1"));
        assert_eq!(
            store.begin("A1").err(),
            Some(DuplicateKey {
                key: "A1".to_string()
            })
        );

        drop(guard);
        assert!(!store.is_in_flight("A1"));
        let _again = store.begin("A1").expect("released");
    }
}

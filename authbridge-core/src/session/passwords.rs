//! Scraped password storage.

use std::fmt;

use indexmap::{IndexMap, IndexSet};
use url::Url;

use crate::messages::Secret;

/// Identity of one password field across reports.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldKey {
    /// Document URL without query or fragment
    pub url: String,
    /// Insertion index of the field in its document
    pub index: u32,
    /// Field id, or name when it has no id
    pub id: String,
}

impl FieldKey {
    pub fn new(url: &str, index: u32, id: impl Into<String>) -> Self {
        Self {
            url: strip_query_and_fragment(url),
            index,
            id: id.into(),
        }
    }
}

fn strip_query_and_fragment(url: &str) -> String {
    match Url::parse(url) {
        Ok(mut parsed) => {
            parsed.set_query(None);
            parsed.set_fragment(None);
            parsed.into()
        }
        Err(_) => url
            .split(['?', '#'])
            .next()
            .unwrap_or_default()
            .to_string(),
    }
}

/// Latest observed value per field; readers see de-duplicated values in
/// first-seen order.
#[derive(Clone, Default)]
pub struct PasswordStore {
    fields: IndexMap<FieldKey, Secret>,
}

impl PasswordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the current value of a field. Empty values are ignored.
    pub fn record(&mut self, key: FieldKey, password: Secret) {
        if password.is_empty() {
            return;
        }
        self.fields.insert(key, password);
    }

    /// Distinct scraped values.
    pub fn scraped(&self) -> Vec<Secret> {
        let distinct: IndexSet<&Secret> = self.fields.values().collect();
        distinct.into_iter().cloned().collect()
    }

    /// Number of distinct scraped values.
    pub fn count(&self) -> usize {
        self.fields.values().collect::<IndexSet<_>>().len()
    }

    pub fn contains(&self, password: &str) -> bool {
        self.fields.values().any(|p| p.expose() == password)
    }

    pub fn first(&self) -> Option<&Secret> {
        self.fields.values().next()
    }

    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn clear(&mut self) {
        self.fields.clear();
    }
}

impl fmt::Debug for PasswordStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PasswordStore")
            .field("fields", &self.fields.len())
            .field("distinct", &self.count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_ignores_query_and_fragment() {
        let a = FieldKey::new("https://idp.example.org/login?step=2#pw", 0, "pw");
        let b = FieldKey::new("https://idp.example.org/login", 0, "pw");
        assert_eq!(a, b);
        assert_eq!(FieldKey::new("not a url?x#y", 1, "p").url, "not a url");
    }

    #[test]
    fn test_same_value_under_two_keys_counts_once() {
        let mut store = PasswordStore::new();
        store.record(FieldKey::new("https://idp/a", 0, "pw"), "same".into());
        store.record(FieldKey::new("https://idp/b", 1, "confirm"), "same".into());
        assert_eq!(store.count(), 1);
        assert_eq!(store.field_count(), 2);

        store.record(FieldKey::new("https://idp/b", 1, "confirm"), "other".into());
        assert_eq!(store.count(), 2);
        assert!(store.contains("other"));
    }

    #[test]
    fn test_latest_value_per_field_wins() {
        let mut store = PasswordStore::new();
        let key = FieldKey::new("https://idp/a", 0, "pw");
        store.record(key.clone(), "draft".into());
        store.record(key, "final".into());
        assert_eq!(store.count(), 1);
        assert_eq!(store.first().map(Secret::expose), Some("final"));
        assert!(!store.contains("draft"));
    }

    #[test]
    fn test_empty_value_ignored_and_debug_redacted() {
        let mut store = PasswordStore::new();
        store.record(FieldKey::new("https://idp/a", 0, "pw"), "".into());
        assert!(store.is_empty());

        store.record(FieldKey::new("https://idp/a", 0, "pw"), "topsecret".into());
        assert!(!format!("{store:?}").contains("topsecret"));
    }
}

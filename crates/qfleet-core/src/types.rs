//! Common types used throughout QFleet

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Action identifier drawn from a per-agent-kind vocabulary
pub type ActionId = String;

/// Fixed-length digest identifying a discretized state
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateFingerprint(String);

impl StateFingerprint {
    /// Wrap an already computed digest (e.g. a `state_hash` column)
    pub fn from_raw(digest: impl Into<String>) -> Self {
        Self(digest.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short prefix for log lines
    pub fn short(&self) -> &str {
        self.0.get(..12).unwrap_or(&self.0)
    }
}

impl std::fmt::Display for StateFingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for StateFingerprint {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A single discretized feature
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FeatureValue {
    /// Continuous value bucketed into a fixed-width bin
    Bucket(i64),
    /// Boolean indicator
    Flag(bool),
    /// Normalized categorical label
    Label(String),
}

/// Discretized features of a state, canonically ordered by key
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateFeatures(BTreeMap<String, FeatureValue>);

impl StateFeatures {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: FeatureValue) {
        self.0.insert(name.into(), value);
    }

    pub fn with(mut self, name: impl Into<String>, value: FeatureValue) -> Self {
        self.insert(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&FeatureValue> {
        self.0.get(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &FeatureValue)> {
        self.0.iter()
    }

    /// Canonical serialized form: keys sorted, no whitespace
    pub fn canonical_json(&self) -> String {
        // A BTreeMap of strings and scalars cannot fail to serialize
        serde_json::to_string(&self.0).unwrap_or_default()
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(&self.0).unwrap_or(serde_json::Value::Null)
    }
}

/// Key of one in-memory Q-table cell
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QKey {
    pub state_hash: StateFingerprint,
    pub action: ActionId,
}

impl QKey {
    pub fn new(state_hash: StateFingerprint, action: impl Into<ActionId>) -> Self {
        Self {
            state_hash,
            action: action.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_json_is_key_ordered() {
        let a = StateFeatures::new()
            .with("zeta", FeatureValue::Bucket(3))
            .with("alpha", FeatureValue::Label("jest".into()));
        let b = StateFeatures::new()
            .with("alpha", FeatureValue::Label("jest".into()))
            .with("zeta", FeatureValue::Bucket(3));

        assert_eq!(a.canonical_json(), b.canonical_json());
        assert_eq!(a.canonical_json(), r#"{"alpha":"jest","zeta":3}"#);
    }

    #[test]
    fn test_feature_value_serialization() {
        let features = StateFeatures::new()
            .with("bucket", FeatureValue::Bucket(-2))
            .with("flag", FeatureValue::Flag(true))
            .with("label", FeatureValue::Label("pytest".into()));

        let json = serde_json::to_string(&features).unwrap();
        let parsed: StateFeatures = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, features);
    }

    #[test]
    fn test_fingerprint_short() {
        let fp = StateFingerprint::from_raw("0123456789abcdef0123");
        assert_eq!(fp.short(), "0123456789ab");
        assert_eq!(StateFingerprint::from_raw("abc").short(), "abc");
    }
}

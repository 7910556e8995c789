use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use blake2::digest::consts::U16;
use blake2::{Blake2b, Digest};
use serde_json::Value;
use std::fmt;

// 128 bits keep the token short while staying collision resistant for any
// realistic batch size
type Blake2b128 = Blake2b<U16>;

/// deterministic content hash of a canonically serialized value, used as
/// the sole identity and dedup key for tasks and runs
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// fingerprint of a JSON value
    ///
    /// `serde_json` without `preserve_order` backs objects with a BTreeMap,
    /// so `to_string` already emits keys in a fixed total order with compact
    /// separators and unescaped unicode. Equal canonical serializations
    /// therefore always produce equal fingerprints.
    pub fn of_value(value: &Value) -> Self {
        Self::of_bytes(value.to_string().as_bytes())
    }

    pub fn of_bytes(bytes: &[u8]) -> Self {
        let mut hasher = Blake2b128::new();
        hasher.update(bytes);

        // URL-safe without padding keeps the token usable in file names
        Self(URL_SAFE_NO_PAD.encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Fingerprint {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_order_does_not_matter() {
        let left = json!({"b": 1, "a": {"y": 2, "x": 1}});
        let right = json!({"a": {"x": 1, "y": 2}, "b": 1});

        assert_eq!(Fingerprint::of_value(&left), Fingerprint::of_value(&right));
    }

    #[test]
    fn value_changes_change_the_fingerprint() {
        let base = json!({"name": "exec", "timeout": 60});
        let tweaked = json!({"name": "exec", "timeout": 61});
        let renamed = json!({"name": "sleep", "timeout": 60});

        assert_ne!(Fingerprint::of_value(&base), Fingerprint::of_value(&tweaked));
        assert_ne!(Fingerprint::of_value(&base), Fingerprint::of_value(&renamed));
        assert_ne!(Fingerprint::of_value(&tweaked), Fingerprint::of_value(&renamed));
    }

    #[test]
    fn unicode_survives_canonicalization_unescaped() {
        let config = json!({"label": "žluťoučký 🐎"});

        assert_eq!(
            Fingerprint::of_value(&config),
            Fingerprint::of_bytes("{\"label\":\"žluťoučký 🐎\"}".as_bytes())
        );
    }

    #[test]
    fn token_is_path_safe() {
        let fingerprint = Fingerprint::of_value(&json!({"name": "exec"}));

        // 16 digest bytes encode to 22 base64 characters once padding is
        // stripped
        assert_eq!(fingerprint.as_str().len(), 22);
        assert!(fingerprint
            .as_str()
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn byte_and_value_fingerprints_agree() {
        let value = json!({"a": 1});

        assert_eq!(
            Fingerprint::of_value(&value),
            Fingerprint::of_bytes(value.to_string().as_bytes())
        );
    }
}

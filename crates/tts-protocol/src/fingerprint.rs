// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Fingerprint computation: a stable content hash over
//! `(text, model, voice, parameters, codec)`.
//!
//! Grounded on `BlockVariant.get_hash` in the original `yapit` source and
//! spec.md §4.1: SHA-256 over
//! `text || 0x00 || model_slug || 0x00 || voice_slug || 0x00 || canonical_params || 0x00 || codec`,
//! where `canonical_params` sorts parameter keys lexicographically and
//! renders numbers in shortest round-trip form.

use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// A stable 256-bit content fingerprint, rendered as lowercase hex.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Compute the fingerprint for a synthesis input.
    ///
    /// `parameters` may contain keys in any order and any JSON value type;
    /// they are re-serialized in canonical (sorted-key) form before hashing
    /// so that two semantically identical parameter maps always fingerprint
    /// identically regardless of insertion order.
    pub fn compute(
        text: &str,
        model_slug: &str,
        voice_slug: &str,
        parameters: &Value,
        codec: &str,
    ) -> Self {
        let canonical_params = canonicalize(parameters);

        let mut hasher = Sha256::new();
        hasher.update(text.as_bytes());
        hasher.update([0u8]);
        hasher.update(model_slug.as_bytes());
        hasher.update([0u8]);
        hasher.update(voice_slug.as_bytes());
        hasher.update([0u8]);
        hasher.update(canonical_params.as_bytes());
        hasher.update([0u8]);
        hasher.update(codec.as_bytes());

        Self(hex::encode(hasher.finalize()))
    }

    /// Wrap an already-computed hex digest (e.g. read back from storage).
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    /// The lowercase hex representation used as the cache/variant/dedup key.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl serde::Serialize for Fingerprint {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for Fingerprint {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        String::deserialize(deserializer).map(Self)
    }
}

/// Render a JSON value with object keys sorted lexicographically at every
/// level, recursively. Arrays keep their order (order is semantic there).
fn canonicalize(value: &Value) -> String {
    canonicalize_value(value).to_string()
}

fn canonicalize_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<String, Value> = map
                .iter()
                .map(|(k, v)| (k.clone(), canonicalize_value(v)))
                .collect();
            let mut out = serde_json::Map::new();
            for (k, v) in sorted {
                out.insert(k, v);
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize_value).collect()),
        other => other.clone(),
    }
}

/// Minimal hex encoder so this crate doesn't pull in the `hex` dependency
/// just for a one-liner used once per fingerprint.
mod hex {
    pub fn encode(bytes: impl AsRef<[u8]>) -> String {
        const LUT: &[u8; 16] = b"0123456789abcdef";
        let bytes = bytes.as_ref();
        let mut out = String::with_capacity(bytes.len() * 2);
        for b in bytes {
            out.push(LUT[(b >> 4) as usize] as char);
            out.push(LUT[(b & 0x0f) as usize] as char);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn identical_inputs_produce_identical_fingerprints() {
        let params = json!({"speed": 1.0, "pitch": 0});
        let a = Fingerprint::compute("Hello.", "kokoro", "af_heart", &params, "opus");
        let b = Fingerprint::compute("Hello.", "kokoro", "af_heart", &params, "opus");
        assert_eq!(a, b);
    }

    #[test]
    fn parameter_key_order_does_not_affect_fingerprint() {
        let a = Fingerprint::compute(
            "Hello.",
            "kokoro",
            "af_heart",
            &json!({"speed": 1.0, "pitch": 0}),
            "opus",
        );
        let b = Fingerprint::compute(
            "Hello.",
            "kokoro",
            "af_heart",
            &json!({"pitch": 0, "speed": 1.0}),
            "opus",
        );
        assert_eq!(a, b);
    }

    #[test]
    fn differing_text_produces_differing_fingerprint() {
        let params = json!({});
        let a = Fingerprint::compute("Hello.", "kokoro", "af_heart", &params, "opus");
        let b = Fingerprint::compute("Hello!", "kokoro", "af_heart", &params, "opus");
        assert_ne!(a, b);
    }

    #[test]
    fn differing_codec_produces_differing_fingerprint() {
        let params = json!({});
        let a = Fingerprint::compute("Hello.", "kokoro", "af_heart", &params, "opus");
        let b = Fingerprint::compute("Hello.", "kokoro", "af_heart", &params, "wav");
        assert_ne!(a, b);
    }

    #[test]
    fn concatenation_boundary_does_not_collide_across_fields() {
        // Without the 0x00 separators, ("ab", "c") and ("a", "bc") would hash
        // identically once concatenated. Assert the separator prevents that.
        let a = Fingerprint::compute("ab", "c", "voice", &json!({}), "opus");
        let b = Fingerprint::compute("a", "bc", "voice", &json!({}), "opus");
        assert_ne!(a, b);
    }

    proptest! {
        #[test]
        fn fingerprint_is_deterministic_across_calls(
            text in ".*",
            model in "[a-z0-9_-]{1,16}",
            voice in "[a-z0-9_-]{1,16}",
            codec in "[a-z0-9]{1,8}",
        ) {
            let params = json!({"a": 1, "b": "x"});
            let first = Fingerprint::compute(&text, &model, &voice, &params, &codec);
            let second = Fingerprint::compute(&text, &model, &voice, &params, &codec);
            prop_assert_eq!(first, second);
        }
    }
}

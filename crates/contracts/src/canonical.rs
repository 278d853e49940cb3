use hex::ToHex;
use sha2::Digest;
use unicode_normalization::UnicodeNormalization;

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = sha2::Sha256::new();
    hasher.update(bytes);
    hasher.finalize().encode_hex::<String>()
}

/// Serializes `value` with object keys sorted at every depth so equal documents
/// hash equally regardless of construction order.
pub fn canonical_json_string(value: &serde_json::Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &serde_json::Value, out: &mut String) {
    match value {
        serde_json::Value::Array(items) => {
            out.push('[');
            for (idx, item) in items.iter().enumerate() {
                if idx != 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        serde_json::Value::Object(map) => {
            let mut keys = map.keys().collect::<Vec<_>>();
            keys.sort();
            out.push('{');
            for (idx, key) in keys.into_iter().enumerate() {
                if idx != 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::Value::String(key.clone()).to_string());
                out.push(':');
                if let Some(inner) = map.get(key) {
                    write_canonical(inner, out);
                }
            }
            out.push('}');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

pub fn hash_canonical_json(value: &serde_json::Value) -> String {
    sha256_hex(canonical_json_string(value).as_bytes())
}

/// Truncated canonical hash, used for short human-visible fingerprints such as
/// schema versions.
pub fn short_hash(value: &serde_json::Value, len: usize) -> String {
    let mut full = hash_canonical_json(value);
    full.truncate(len.min(full.len()));
    full
}

/// NFC-normalizes caller text, unifies line endings and trims the ends.
pub fn normalize_question(input: &str) -> String {
    let unified = input.replace("\r\n", "\n").replace('\r', "\n");
    unified.nfc().collect::<String>().trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_string_is_independent_of_key_order() {
        let a = serde_json::json!({"tables": [{"name": "orders", "columns": ["id"]}], "schema": "public"});
        let b = serde_json::json!({"schema": "public", "tables": [{"columns": ["id"], "name": "orders"}]});
        assert_eq!(canonical_json_string(&a), canonical_json_string(&b));
        assert_eq!(
            canonical_json_string(&a),
            r#"{"schema":"public","tables":[{"columns":["id"],"name":"orders"}]}"#
        );
    }

    #[test]
    fn arrays_keep_their_order() {
        let a = serde_json::json!(["b", "a"]);
        let b = serde_json::json!(["a", "b"]);
        assert_ne!(hash_canonical_json(&a), hash_canonical_json(&b));
    }

    #[test]
    fn short_hash_truncates_to_requested_length() {
        let value = serde_json::json!({"k": 1});
        let short = short_hash(&value, 16);
        assert_eq!(short.len(), 16);
        assert!(hash_canonical_json(&value).starts_with(&short));
    }

    #[test]
    fn sha256_matches_known_vector() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn questions_are_nfc_normalized_and_trimmed() {
        let normalized = normalize_question("  caf\u{0065}\u{0301} sales\r\nlast month  ");
        assert_eq!(normalized, "caf\u{00e9} sales\nlast month");
    }
}

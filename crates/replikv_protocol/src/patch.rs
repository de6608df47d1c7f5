//! Patch operations carried by pull responses.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One operation of a pull patch.
///
/// Operations apply in array order. A `del` with an empty key clears the
/// whole map before any following operation in the same patch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum PatchOp {
    /// Insert or replace a key.
    Put {
        /// The key to write.
        key: String,
        /// The new value.
        value: Value,
    },
    /// Remove a key; an empty key clears all.
    Del {
        /// The key to remove, or `""` for clear-all.
        key: String,
    },
}

impl PatchOp {
    /// Returns true if this is the clear-all form.
    #[must_use]
    pub fn is_clear(&self) -> bool {
        matches!(self, PatchOp::Del { key } if key.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn patch_op_tagged_encoding() {
        let put = PatchOp::Put {
            key: "k".into(),
            value: json!([1, 2]),
        };
        assert_eq!(
            serde_json::to_value(&put).unwrap(),
            json!({"op": "put", "key": "k", "value": [1, 2]})
        );

        let del: PatchOp = serde_json::from_value(json!({"op": "del", "key": "k"})).unwrap();
        assert_eq!(del, PatchOp::Del { key: "k".into() });
    }

    #[test]
    fn clear_all_detection() {
        assert!(PatchOp::Del { key: String::new() }.is_clear());
        assert!(!PatchOp::Del { key: "k".into() }.is_clear());
        assert!(!PatchOp::Put {
            key: String::new(),
            value: json!(1)
        }
        .is_clear());
    }
}

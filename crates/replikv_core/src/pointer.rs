//! JSON Pointer (RFC 6901) validation and evaluation.

use crate::error::{CoreError, CoreResult};
use serde_json::Value;

/// Validates that `pointer` is syntactically well-formed.
///
/// `""` addresses the whole value; otherwise the pointer must start with `/`
/// and every `~` must begin a `~0` or `~1` escape. Empty reference tokens are
/// permitted.
pub fn validate(pointer: &str) -> CoreResult<()> {
    if pointer.is_empty() {
        return Ok(());
    }
    if !pointer.starts_with('/') {
        return Err(CoreError::invalid_pointer(pointer));
    }

    let mut chars = pointer.chars();
    while let Some(c) = chars.next() {
        if c == '~' && !matches!(chars.next(), Some('0') | Some('1')) {
            return Err(CoreError::invalid_pointer(pointer));
        }
    }
    Ok(())
}

/// Resolves a validated pointer against `value`.
///
/// Returns `None` when the pointed-at location does not exist; that is a
/// per-row mismatch, not an error.
pub fn resolve<'a>(value: &'a Value, pointer: &str) -> Option<&'a Value> {
    value.pointer(pointer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_pointer_is_whole_value() {
        validate("").unwrap();
        let v = json!({"a": 1});
        assert_eq!(resolve(&v, ""), Some(&v));
    }

    #[test]
    fn member_and_array_navigation() {
        let v = json!({"a": {"b": [10, 20]}});
        validate("/a/b/1").unwrap();
        assert_eq!(resolve(&v, "/a/b/1"), Some(&json!(20)));
        assert_eq!(resolve(&v, "/a/x"), None);
        assert_eq!(resolve(&v, "/a/b/9"), None);
    }

    #[test]
    fn empty_keys_are_permitted() {
        let v = json!({"": {"": "deep"}});
        validate("//").unwrap();
        assert_eq!(resolve(&v, "//"), Some(&json!("deep")));
    }

    #[test]
    fn escapes() {
        let v = json!({"a/b": 1, "m~n": 2});
        validate("/a~1b").unwrap();
        validate("/m~0n").unwrap();
        assert_eq!(resolve(&v, "/a~1b"), Some(&json!(1)));
        assert_eq!(resolve(&v, "/m~0n"), Some(&json!(2)));
    }

    #[test]
    fn missing_leading_slash_is_invalid() {
        assert!(matches!(
            validate("a/b"),
            Err(CoreError::InvalidPointer { .. })
        ));
    }

    #[test]
    fn dangling_tilde_is_invalid() {
        assert!(matches!(
            validate("/a~"),
            Err(CoreError::InvalidPointer { .. })
        ));
        assert!(matches!(
            validate("/a~2b"),
            Err(CoreError::InvalidPointer { .. })
        ));
    }
}

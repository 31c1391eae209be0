//! Per-user memory blob: an opaque JSON object inlined into the system
//! prompt. Field edits go through here so the `protected_memory` subtree
//! stays host-managed.

use serde_json::{Map, Value};

use crate::error::{Result, StoreError};
use crate::manager::Store;

pub const PROTECTED_FIELD: &str = "protected_memory";

/// Persisted memory for `username`, installing `template` when empty.
pub fn get_memory(store: &Store, username: &str, template: &str) -> Result<String> {
    let memory = store.load_memory(username)?;
    if !memory.is_empty() {
        return Ok(memory);
    }
    store.store_memory(username, template, usize::MAX)
}

/// Replace the whole blob, enforcing the size limit.
pub fn set_memory(store: &Store, username: &str, memory: &str, limit: usize) -> Result<String> {
    store.store_memory(username, memory, limit)
}

/// Reset to the default template.
pub fn reset_memory(store: &Store, username: &str, template: &str) -> Result<String> {
    store.store_memory(username, template, usize::MAX)
}

/// Add, update, or remove a top-level field. `value = None` removes it.
/// The `protected_memory` subtree cannot be edited through this path.
pub fn edit_memory(
    store: &Store,
    username: &str,
    field: &str,
    value: Option<&str>,
    template: &str,
    limit: usize,
) -> Result<String> {
    if field == PROTECTED_FIELD {
        return Err(StoreError::ProtectedField(field.to_string()));
    }
    let mut data = parse_object(&get_memory(store, username, template)?);
    match value {
        Some(v) => {
            data.insert(field.to_string(), Value::String(v.to_string()));
        }
        None => {
            data.remove(field);
        }
    }
    let rendered = serde_json::to_string_pretty(&Value::Object(data))?;
    set_memory(store, username, &rendered, limit)
}

/// Host-only edit of the `protected_memory` subtree. Touches nothing else.
pub fn edit_protected_memory(
    store: &Store,
    username: &str,
    field: &str,
    value: Option<&str>,
    template: &str,
    limit: usize,
) -> Result<String> {
    let mut data = parse_object(&get_memory(store, username, template)?);
    let protected = data
        .entry(PROTECTED_FIELD.to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    if !protected.is_object() {
        *protected = Value::Object(Map::new());
    }
    let map = protected.as_object_mut().unwrap();
    match value {
        Some(v) => {
            map.insert(field.to_string(), Value::String(v.to_string()));
        }
        None => {
            map.remove(field);
        }
    }
    let rendered = serde_json::to_string_pretty(&Value::Object(data))?;
    set_memory(store, username, &rendered, limit)
}

fn parse_object(text: &str) -> Map<String, Value> {
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEMPLATE: &str = "{\n  \"name\": \"\",\n  \"protected_memory\": {}\n}";
    const LIMIT: usize = 8_000;

    fn store() -> Store {
        Store::open_in_memory().unwrap()
    }

    #[test]
    fn empty_memory_installs_template() {
        let s = store();
        let memory = get_memory(&s, "alice", TEMPLATE).unwrap();
        let data: serde_json::Value = serde_json::from_str(&memory).unwrap();
        assert!(data.get(PROTECTED_FIELD).is_some());
        // installed value is persisted, not just returned
        assert_eq!(s.load_memory("alice").unwrap(), memory);
    }

    #[test]
    fn edit_sets_and_removes_fields() {
        let s = store();
        let after = edit_memory(&s, "alice", "city", Some("Oslo"), TEMPLATE, LIMIT).unwrap();
        let data: serde_json::Value = serde_json::from_str(&after).unwrap();
        assert_eq!(data["city"], "Oslo");

        let after = edit_memory(&s, "alice", "city", None, TEMPLATE, LIMIT).unwrap();
        let data: serde_json::Value = serde_json::from_str(&after).unwrap();
        assert!(data.get("city").is_none());
    }

    #[test]
    fn protected_subtree_rejected_from_normal_edit() {
        let s = store();
        let err = edit_memory(&s, "alice", PROTECTED_FIELD, Some("x"), TEMPLATE, LIMIT);
        assert!(matches!(err, Err(StoreError::ProtectedField(_))));
    }

    #[test]
    fn protected_edit_touches_only_subtree() {
        let s = store();
        edit_memory(&s, "alice", "name", Some("Alice"), TEMPLATE, LIMIT).unwrap();
        let after =
            edit_protected_memory(&s, "alice", "tier", Some("gold"), TEMPLATE, LIMIT).unwrap();
        let data: serde_json::Value = serde_json::from_str(&after).unwrap();
        assert_eq!(data[PROTECTED_FIELD]["tier"], "gold");
        assert_eq!(data["name"], "Alice");

        let after = edit_protected_memory(&s, "alice", "tier", None, TEMPLATE, LIMIT).unwrap();
        let data: serde_json::Value = serde_json::from_str(&after).unwrap();
        assert!(data[PROTECTED_FIELD].get("tier").is_none());
    }

    #[test]
    fn over_limit_memory_is_truncated() {
        let s = store();
        let big = "x".repeat(100);
        let stored = set_memory(&s, "alice", &big, 10).unwrap();
        assert_eq!(stored.len(), 10);
        assert_eq!(s.load_memory("alice").unwrap().len(), 10);
    }

    #[test]
    fn garbage_memory_treated_as_empty_object() {
        let s = store();
        set_memory(&s, "alice", "not json at all", LIMIT).unwrap();
        let after = edit_memory(&s, "alice", "k", Some("v"), TEMPLATE, LIMIT).unwrap();
        let data: serde_json::Value = serde_json::from_str(&after).unwrap();
        assert_eq!(data["k"], "v");
    }
}

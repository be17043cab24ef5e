use std::collections::HashMap;

use serde::Serialize;
use serde_json::Value;

/// Per-user, per-chat state container, persisted as a `sessions:<sid>` hash.
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub session_id: String,
    pub user_id: String,
    pub chat_id: String,
    pub data: Value,
    pub created_at: f64,
    pub last_access: f64,
}

impl Session {
    pub fn new(user_id: &str, chat_id: &str) -> Self {
        let now = relay_common::clock::unix_now();
        Self {
            session_id: relay_common::id::session_id(),
            user_id: user_id.to_string(),
            chat_id: chat_id.to_string(),
            data: Value::Object(Default::default()),
            created_at: now,
            last_access: now,
        }
    }

    /// Rehydrate from the stored hash. `None` when required fields are gone.
    pub fn from_hash(sid: &str, hash: &HashMap<String, String>) -> Option<Self> {
        let user_id = hash.get("user_id")?.clone();
        Some(Self {
            session_id: sid.to_string(),
            user_id,
            chat_id: hash
                .get("chat_id")
                .cloned()
                .unwrap_or_else(|| "default".to_string()),
            data: hash
                .get("data")
                .and_then(|d| serde_json::from_str(d).ok())
                .unwrap_or_else(|| Value::Object(Default::default())),
            created_at: parse_ts(hash.get("created_at")),
            last_access: parse_ts(hash.get("last_access")),
        })
    }

    pub fn to_fields(&self) -> Vec<(String, String)> {
        vec![
            ("user_id".to_string(), self.user_id.clone()),
            ("chat_id".to_string(), self.chat_id.clone()),
            ("data".to_string(), self.data.to_string()),
            ("created_at".to_string(), self.created_at.to_string()),
            ("last_access".to_string(), self.last_access.to_string()),
        ]
    }
}

fn parse_ts(value: Option<&String>) -> f64 {
    value.and_then(|v| v.parse().ok()).unwrap_or(0.0)
}

/// Deep-merge `patch` into `dest`: objects merge recursively, everything
/// else is replaced (last writer wins per field).
pub fn merge_json(dest: &mut Value, patch: &Value) {
    match (dest, patch) {
        (Value::Object(dest_map), Value::Object(patch_map)) => {
            for (key, patch_value) in patch_map {
                match dest_map.get_mut(key) {
                    Some(dest_value) if dest_value.is_object() && patch_value.is_object() => {
                        merge_json(dest_value, patch_value);
                    }
                    _ => {
                        dest_map.insert(key.clone(), patch_value.clone());
                    }
                }
            }
        }
        (dest, patch) => *dest = patch.clone(),
    }
}

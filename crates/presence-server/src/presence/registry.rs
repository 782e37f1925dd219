//! In-memory user identity to connection mapping.
//!
//! A user is online exactly while the registry holds an entry for them. At
//! most one connection is bound per user; a later bind overwrites the earlier
//! one (last writer wins). The registry is owned by the hub task and is never
//! shared across threads.

use std::collections::HashMap;

#[derive(Debug, Clone)]
struct Binding {
    connection_id: String,
    /// Order of first insertion, kept across rebinds.
    seq: u64,
}

/// Tracks the live connection bound to each online user.
#[derive(Debug, Default)]
pub struct PresenceRegistry {
    bindings: HashMap<String, Binding>,
    next_seq: u64,
}

impl PresenceRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `user_id` to `connection_id`, replacing any earlier binding.
    pub fn bind(&mut self, user_id: &str, connection_id: &str) {
        if let Some(binding) = self.bindings.get_mut(user_id) {
            connection_id.clone_into(&mut binding.connection_id);
            return;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        let _ = self.bindings.insert(
            user_id.to_owned(),
            Binding {
                connection_id: connection_id.to_owned(),
                seq,
            },
        );
    }

    /// Remove `user_id` if it is still bound to `connection_id`.
    ///
    /// Returns `true` when an entry was removed, i.e. the user went offline.
    pub fn unbind(&mut self, user_id: &str, connection_id: &str) -> bool {
        let owned = self
            .bindings
            .get(user_id)
            .is_some_and(|b| b.connection_id == connection_id);
        if owned {
            let _ = self.bindings.remove(user_id);
        }
        owned
    }

    /// Online user ids in first-insertion order.
    pub fn online_user_ids(&self) -> Vec<String> {
        let mut entries: Vec<(&String, u64)> =
            self.bindings.iter().map(|(u, b)| (u, b.seq)).collect();
        entries.sort_unstable_by_key(|(_, seq)| *seq);
        entries.into_iter().map(|(u, _)| u.clone()).collect()
    }

    /// Whether `user_id` has a live binding.
    pub fn is_online(&self, user_id: &str) -> bool {
        self.bindings.contains_key(user_id)
    }

    /// Connection currently bound to `user_id`.
    pub fn connection_for(&self, user_id: &str) -> Option<&str> {
        self.bindings.get(user_id).map(|b| b.connection_id.as_str())
    }

    /// Number of online users.
    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    /// Whether nobody is online.
    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

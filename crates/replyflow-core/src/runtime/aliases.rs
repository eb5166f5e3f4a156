//! Bidirectional provisional/confirmed identifier table.

use std::collections::HashMap;

use crate::models::IdentifierMapping;

/// Lookup between client-generated provisional ids and backend-assigned
/// confirmed ids. Resolution order is always the exact id first, then its
/// alias.
#[derive(Debug, Default)]
pub struct IdentifierAliases {
    by_provisional: HashMap<String, IdentifierMapping>,
    provisional_by_confirmed: HashMap<String, String>,
}

impl IdentifierAliases {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a mapping, replacing any earlier one for either id.
    pub fn register(&mut self, mapping: IdentifierMapping) {
        self.remove(&mapping.provisional_id);
        self.remove(&mapping.confirmed_id);
        self.provisional_by_confirmed
            .insert(mapping.confirmed_id.clone(), mapping.provisional_id.clone());
        self.by_provisional
            .insert(mapping.provisional_id.clone(), mapping);
    }

    /// The other identifier of a mapped pair.
    pub fn alias_of(&self, id: &str) -> Option<&str> {
        if let Some(provisional) = self.provisional_by_confirmed.get(id) {
            return Some(provisional.as_str());
        }
        self.by_provisional
            .get(id)
            .map(|mapping| mapping.confirmed_id.as_str())
    }

    /// Keys an update for `id` should be routed to, in resolution order.
    pub fn resolve(&self, id: &str) -> Vec<String> {
        let mut keys = vec![id.to_string()];
        if let Some(alias) = self.alias_of(id) {
            keys.push(alias.to_string());
        }
        keys
    }

    pub fn mapping_for(&self, id: &str) -> Option<&IdentifierMapping> {
        match self.provisional_by_confirmed.get(id) {
            Some(provisional) => self.by_provisional.get(provisional),
            None => self.by_provisional.get(id),
        }
    }

    pub fn conversation_of(&self, id: &str) -> Option<&str> {
        self.mapping_for(id)
            .and_then(|mapping| mapping.conversation_id.as_deref())
    }

    /// Remove the mapping containing `id` on either side.
    pub fn remove(&mut self, id: &str) -> Option<IdentifierMapping> {
        let provisional = match self.provisional_by_confirmed.get(id) {
            Some(provisional) => provisional.clone(),
            None => id.to_string(),
        };
        let mapping = self.by_provisional.remove(&provisional)?;
        self.provisional_by_confirmed.remove(&mapping.confirmed_id);
        Some(mapping)
    }

    /// Remove every mapping belonging to a conversation.
    pub fn remove_conversation(&mut self, conversation_id: &str) -> Vec<IdentifierMapping> {
        let provisional_ids: Vec<String> = self
            .by_provisional
            .values()
            .filter(|mapping| mapping.conversation_id.as_deref() == Some(conversation_id))
            .map(|mapping| mapping.provisional_id.clone())
            .collect();
        provisional_ids
            .iter()
            .filter_map(|id| self.remove(id))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapping(provisional: &str, confirmed: &str, conversation: &str) -> IdentifierMapping {
        IdentifierMapping {
            provisional_id: provisional.to_string(),
            confirmed_id: confirmed.to_string(),
            conversation_id: Some(conversation.to_string()),
        }
    }

    #[test]
    fn test_resolution_is_bidirectional() {
        let mut aliases = IdentifierAliases::new();
        aliases.register(mapping("temp-1", "m1", "c1"));

        assert_eq!(aliases.alias_of("m1"), Some("temp-1"));
        assert_eq!(aliases.alias_of("temp-1"), Some("m1"));
        assert_eq!(aliases.resolve("m1"), vec!["m1", "temp-1"]);
        assert_eq!(aliases.resolve("temp-1"), vec!["temp-1", "m1"]);
        assert_eq!(aliases.resolve("other"), vec!["other"]);
        assert_eq!(aliases.conversation_of("m1"), Some("c1"));
    }

    #[test]
    fn test_reregistration_replaces_stale_pair() {
        let mut aliases = IdentifierAliases::new();
        aliases.register(mapping("temp-1", "m1", "c1"));
        aliases.register(mapping("temp-1", "m2", "c1"));

        assert_eq!(aliases.alias_of("temp-1"), Some("m2"));
        assert_eq!(aliases.alias_of("m1"), None);
    }

    #[test]
    fn test_remove_by_either_side() {
        let mut aliases = IdentifierAliases::new();
        aliases.register(mapping("temp-1", "m1", "c1"));
        let removed = aliases.remove("m1").unwrap();
        assert_eq!(removed.provisional_id, "temp-1");
        assert!(aliases.mapping_for("temp-1").is_none());
        assert!(aliases.remove("temp-1").is_none());
    }

    #[test]
    fn test_remove_conversation() {
        let mut aliases = IdentifierAliases::new();
        aliases.register(mapping("temp-1", "m1", "c1"));
        aliases.register(mapping("temp-2", "m2", "c1"));
        aliases.register(mapping("temp-3", "m3", "c2"));

        let removed = aliases.remove_conversation("c1");
        assert_eq!(removed.len(), 2);
        assert!(aliases.mapping_for("m1").is_none());
        assert!(aliases.mapping_for("m2").is_none());
        assert_eq!(aliases.alias_of("m3"), Some("temp-3"));
    }
}

/// Whether a user's data may be persisted at all.
///
/// Resolved once when a session attaches and handed to every persistence
/// component, so guests short-circuit to "no persistence" everywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistenceCapability {
    /// Authenticated user; quota decides what can be stored.
    Enabled,
    /// Guest or anonymous user; nothing is persisted and reads are empty.
    Disabled,
}

const GUEST_PREFIXES: [&str; 2] = ["guest-", "anonymous"];

impl PersistenceCapability {
    pub fn resolve(user_id: &str) -> Self {
        if is_guest_id(user_id) {
            PersistenceCapability::Disabled
        } else {
            PersistenceCapability::Enabled
        }
    }

    pub fn can_persist(&self) -> bool {
        matches!(self, PersistenceCapability::Enabled)
    }
}

/// Guest and anonymous ids never reach the store.
pub fn is_guest_id(user_id: &str) -> bool {
    let id = user_id.trim();
    id.is_empty() || GUEST_PREFIXES.iter().any(|p| id.starts_with(p))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve() {
        assert_eq!(PersistenceCapability::resolve(""), PersistenceCapability::Disabled);
        assert_eq!(
            PersistenceCapability::resolve("guest-4f2a"),
            PersistenceCapability::Disabled
        );
        assert_eq!(
            PersistenceCapability::resolve("anonymous"),
            PersistenceCapability::Disabled
        );
        assert!(PersistenceCapability::resolve("uid-123").can_persist());
    }
}

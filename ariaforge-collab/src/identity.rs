//! Token verification and role checks.
//!
//! Authentication itself lives outside the engine; the server only needs a
//! [`IdentityProvider`] that turns a join token into a user ID and role.

use ariaforge_core::{EntityKind, OperationKind};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    /// Full control, including ending the session
    Owner,
    /// Everything except project-level field updates
    Editor,
    /// Read-only
    Viewer,
}

impl Role {
    pub fn can_submit(&self, kind: &OperationKind) -> bool {
        match self {
            Role::Owner => true,
            Role::Editor => match kind {
                OperationKind::UpdateField { update, .. } => update.field().entity_kind() != EntityKind::Project,
                _ => true,
            },
            Role::Viewer => false,
        }
    }

    pub fn can_end_session(&self) -> bool {
        matches!(self, Role::Owner)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    pub user_id: Uuid,
    pub role: Role,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AuthError {
    #[error("Unknown token")]
    UnknownToken,
    #[error("Identity provider unavailable: {0}")]
    Unavailable(String),
}

pub trait IdentityProvider: Send + Sync {
    fn verify(&self, token: &str) -> Result<Identity, AuthError>;
}

/// Fixed token table.
#[derive(Debug, Clone, Default)]
pub struct StaticIdentity {
    tokens: HashMap<String, Identity>,
}

impl StaticIdentity {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `token` for `user_id` with `role`.
    pub fn with_user(mut self, token: impl Into<String>, user_id: Uuid, role: Role) -> Self {
        self.insert(token, user_id, role);
        self
    }

    pub fn insert(&mut self, token: impl Into<String>, user_id: Uuid, role: Role) {
        self.tokens.insert(token.into(), Identity { user_id, role });
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl IdentityProvider for StaticIdentity {
    fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        self.tokens.get(token).copied().ok_or(AuthError::UnknownToken)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ariaforge_core::FieldUpdate;

    #[test]
    fn test_editor_cannot_touch_project() {
        let tempo = OperationKind::UpdateField { target: Uuid::new_v4(), update: FieldUpdate::Tempo(90.0) };
        let name = OperationKind::UpdateField { target: Uuid::new_v4(), update: FieldUpdate::TrackName("A".into()) };
        let delete = OperationKind::DeleteClip { clip_id: Uuid::new_v4() };

        assert!(Role::Owner.can_submit(&tempo));
        assert!(!Role::Editor.can_submit(&tempo));
        assert!(Role::Editor.can_submit(&name));
        assert!(Role::Editor.can_submit(&delete));
        assert!(!Role::Viewer.can_submit(&delete));
    }

    #[test]
    fn test_only_owner_ends() {
        assert!(Role::Owner.can_end_session());
        assert!(!Role::Editor.can_end_session());
        assert!(!Role::Viewer.can_end_session());
    }

    #[test]
    fn test_static_identity() {
        let alice = Uuid::new_v4();
        let identity = StaticIdentity::new().with_user("alice-token", alice, Role::Owner);

        assert_eq!(identity.verify("alice-token"), Ok(Identity { user_id: alice, role: Role::Owner }));
        assert_eq!(identity.verify("mallory"), Err(AuthError::UnknownToken));
        assert_eq!(identity.len(), 1);
    }
}

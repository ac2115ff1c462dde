//! Verified identity claims.
//!
//! The engine never authenticates anyone. An [`Identity`] is handed in by the
//! transport layer after the credential has been verified upstream, and is
//! trusted as-is for every authorization decision.

use serde::{Deserialize, Serialize};

use super::{Role, UserId};

/// The caller of an engine operation.
///
/// An anonymous identity never carries a user id, and an identity built with
/// [`Role::Anonymous`] drops any id it was given, so "anonymous" and
/// "authenticated" can never disagree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    user_id: Option<UserId>,
    role: Role,
}

impl Identity {
    /// Create an authenticated identity.
    #[must_use]
    pub fn new(user_id: UserId, role: Role) -> Self {
        if role == Role::Anonymous {
            return Self::anonymous();
        }
        Self {
            user_id: Some(user_id),
            role,
        }
    }

    /// Shorthand for a regular [`Role::User`] identity.
    #[must_use]
    pub fn user(user_id: UserId) -> Self {
        Self::new(user_id, Role::User)
    }

    /// The identity of a caller that presented no credential.
    #[must_use]
    pub const fn anonymous() -> Self {
        Self {
            user_id: None,
            role: Role::Anonymous,
        }
    }

    /// The authenticated user id, if any.
    #[must_use]
    pub const fn user_id(&self) -> Option<&UserId> {
        self.user_id.as_ref()
    }

    /// The caller's role.
    #[must_use]
    pub const fn role(&self) -> Role {
        self.role
    }

    /// Whether the caller presented a verified credential.
    #[must_use]
    pub const fn is_authenticated(&self) -> bool {
        self.user_id.is_some()
    }

    /// Whether the caller holds the literal admin role.
    #[must_use]
    pub fn is_admin(&self) -> bool {
        self.is_authenticated() && self.role == Role::Admin
    }

    /// Whether the caller is the given user.
    #[must_use]
    pub fn is(&self, user: &UserId) -> bool {
        self.user_id.as_ref() == Some(user)
    }
}

impl Default for Identity {
    fn default() -> Self {
        Self::anonymous()
    }
}

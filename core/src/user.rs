//! Authenticated identity handed to the core by the server's token layer.
//! The core never authenticates; it only enforces visibility rules against
//! the `User` it is given.

/// An authenticated user. `manage_all_sessions` is the admin bit: it allows
/// attaching to and writing into any session regardless of visibility, and
/// terminating sessions owned by others.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct User {
    pub name: String,
    pub manage_all_sessions: bool,
}

impl User {
    pub fn new(name: impl Into<String>, manage_all_sessions: bool) -> Self {
        Self { name: name.into(), manage_all_sessions }
    }

    /// Pseudo-identity the scheduler uses when injecting synthesized stdin.
    /// Carries the session owner's name so visibility write checks pass.
    pub fn scheduler_for(owner: &str) -> Self {
        Self { name: owner.to_string(), manage_all_sessions: false }
    }

    pub fn is_admin(&self) -> bool {
        self.manage_all_sessions
    }
}

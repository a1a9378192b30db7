//! Compiler-facing enums and the capability flag set.

use bitflags::bitflags;
use strum::Display;

pub use meridiandb_wire::Cardinality;

bitflags! {
    /// What a compiled unit is allowed to do. The host intersects these
    /// with the per-connection allowed set before executing a unit.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Capability: u64 {
        const MODIFICATIONS     = 1 << 0;
        const SESSION_CONFIG    = 1 << 1;
        const TRANSACTION       = 1 << 2;
        const DDL               = 1 << 3;
        const PERSISTENT_CONFIG = 1 << 4;

        const WRITE = Self::MODIFICATIONS.bits()
            | Self::DDL.bits()
            | Self::PERSISTENT_CONFIG.bits();
    }
}

impl Capability {
    /// Human-readable title of a single flag, for error messages.
    pub fn title(self) -> &'static str {
        match self {
            Capability::MODIFICATIONS => "data modification queries",
            Capability::SESSION_CONFIG => "session configuration queries",
            Capability::TRANSACTION => "transaction control commands",
            Capability::DDL => "DDL commands",
            Capability::PERSISTENT_CONFIG => "configuration commands",
            _ => "queries",
        }
    }

    /// The first used-but-not-allowed member in flag order, if any.
    pub fn first_violation(self, allowed: Capability) -> Option<Capability> {
        [
            Capability::MODIFICATIONS,
            Capability::SESSION_CONFIG,
            Capability::TRANSACTION,
            Capability::DDL,
            Capability::PERSISTENT_CONFIG,
        ]
        .into_iter()
        .find(|item| !allowed.contains(*item) && self.contains(*item))
    }

    /// Format the canonical rejection message for the first violating
    /// member of `self \ allowed`.
    pub fn violation_message(self, allowed: Capability, reason: &str) -> Option<String> {
        self.first_violation(allowed)
            .map(|item| format!("cannot execute {}: {reason}", item.title()))
    }
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputFormat {
    Binary,
    Json,
    JsonElements,
    None,
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InputFormat {
    Binary,
    Json,
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InputLanguage {
    Mql,
    Sql,
    SqlParams,
}

/// How many statements a compile call is expected to produce units for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatementMode {
    /// Exactly one statement; units carry full codec information.
    Single,
    /// A whole script.
    All,
    /// A script recompiled after its first statement already executed.
    SkipFirst,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxAction {
    Start,
    Commit,
    Rollback,
    DeclareSavepoint,
    ReleaseSavepoint,
    RollbackToSavepoint,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MigrationAction {
    Start,
    Populate,
    Describe,
    Abort,
    Commit,
    RejectProposed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_is_the_union_of_mutating_flags() {
        assert_eq!(
            Capability::WRITE,
            Capability::MODIFICATIONS | Capability::DDL | Capability::PERSISTENT_CONFIG
        );
    }

    #[test]
    fn first_violation_respects_flag_order() {
        let used = Capability::TRANSACTION | Capability::DDL;
        // Neither allowed: TRANSACTION (bit 2) is reported before DDL.
        assert_eq!(
            used.first_violation(Capability::empty()),
            Some(Capability::TRANSACTION)
        );
        // TRANSACTION allowed: DDL is the first violation.
        assert_eq!(
            used.first_violation(Capability::TRANSACTION),
            Some(Capability::DDL)
        );
        assert_eq!(used.first_violation(Capability::all()), None);
    }

    #[test]
    fn violation_message_is_titled() {
        let msg = Capability::DDL
            .violation_message(Capability::empty(), "disabled by the session")
            .unwrap();
        assert_eq!(msg, "cannot execute DDL commands: disabled by the session");
    }
}

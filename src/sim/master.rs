//! Requester identities.
//!
//! Every component that issues memory requests gets a [`MasterId`] from the
//! system's [`MasterRegistry`] when the system is built. The id travels in
//! each [`Packet`](crate::dtu::Packet) so memories can attribute accesses.

use std::fmt;

/// Identity of a requester.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct MasterId(pub u16);

impl fmt::Display for MasterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m{}", self.0)
    }
}

/// Assigns requester identities and remembers their names.
#[derive(Debug, Default)]
pub struct MasterRegistry {
    names: Vec<String>,
}

impl MasterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a requester and return its id. Registering a name twice
    /// returns the existing id.
    pub fn register(&mut self, name: impl Into<String>) -> MasterId {
        let name = name.into();
        if let Some(idx) = self.names.iter().position(|n| *n == name) {
            return MasterId(idx as u16);
        }
        self.names.push(name);
        MasterId((self.names.len() - 1) as u16)
    }

    /// Name of a registered requester.
    pub fn name(&self, id: MasterId) -> Option<&str> {
        self.names.get(id.0 as usize).map(String::as_str)
    }

    /// Look up a requester by name.
    pub fn lookup(&self, name: &str) -> Option<MasterId> {
        self.names.iter().position(|n| n == name).map(|i| MasterId(i as u16))
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

//! Output ports.
//!
//! Every action type declares the named ports a node of that type can exit
//! through. Exactly one port per node is the default; it is taken whenever a
//! handler finishes without naming a port. Edges hang off ports, so the port
//! a node exits through decides which downstream branches run.

use serde::{Deserialize, Serialize};

/// A named exit point of a node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutputPort {
    /// Port name, unique per node.
    pub name: String,
    /// Whether this is the port taken when the handler names none.
    #[serde(default)]
    pub is_default: bool,
}

impl OutputPort {
    /// Creates a non-default port.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_default: false,
        }
    }

    /// Creates the default port.
    #[must_use]
    pub fn default_port(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_default: true,
        }
    }
}

/// Returns how many of the given ports are flagged as default.
#[must_use]
pub fn default_port_count(ports: &[OutputPort]) -> usize {
    ports.iter().filter(|p| p.is_default).count()
}

/// Returns the default port if exactly one is declared.
#[must_use]
pub fn single_default(ports: &[OutputPort]) -> Option<&OutputPort> {
    let mut defaults = ports.iter().filter(|p| p.is_default);
    let first = defaults.next()?;
    if defaults.next().is_some() {
        return None;
    }
    Some(first)
}

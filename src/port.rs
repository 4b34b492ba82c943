use std::fmt;

/// Transport security mode a connection is created with.
///
/// The selector never encrypts anything itself. The tag travels with the
/// connection record so a handshake layer sitting above the selector can tell
/// which connections it has to negotiate on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PortType {
    #[default]
    Plaintext,
    Ssl,
}

impl PortType {
    pub fn is_secured(self) -> bool {
        matches!(self, PortType::Ssl)
    }
}

impl fmt::Display for PortType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortType::Plaintext => f.write_str("plaintext"),
            PortType::Ssl => f.write_str("ssl"),
        }
    }
}

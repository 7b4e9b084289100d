use std::fmt;
use std::sync::Arc;

/// Opaque bearer credential.
///
/// Cloning is cheap. The raw value is only reachable through [`Credential::expose`]
/// so it never ends up in logs by accident.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(Arc<str>);

impl Credential {
    pub fn new(raw: impl Into<Arc<str>>) -> Self {
        Self(raw.into())
    }

    /// The raw string, for the `Authorization` header and the storage slot.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Credential(<redacted, {} bytes>)", self.0.len())
    }
}

impl From<String> for Credential {
    fn from(raw: String) -> Self {
        Self::new(raw)
    }
}

impl From<&str> for Credential {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

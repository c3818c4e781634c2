use std::fmt;

use ulid::Ulid;

/// Identifies one virtual connection for the lifetime of its tunnel.
///
/// Carried on the wire as the `X-En-Conn-Id` header value. Backed by a
/// ULID rather than a random UUID so ids sort roughly by creation time,
/// which is occasionally handy when eyeballing server logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(Ulid);

impl ConnectionId {
    /// Mints a fresh, globally unique connection id.
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Parses a connection id from its canonical string form, as received
    /// in a header value.
    pub fn parse(s: &str) -> Result<Self, ConnectionIdParseError> {
        Ulid::from_string(s)
            .map(Self)
            .map_err(|_| ConnectionIdParseError)
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionIdParseError;

impl fmt::Display for ConnectionIdParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "malformed connection id")
    }
}

impl std::error::Error for ConnectionIdParseError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_its_string_form() {
        let id = ConnectionId::new();
        let parsed = ConnectionId::parse(&id.to_string()).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn rejects_garbage() {
        assert!(ConnectionId::parse("not-a-ulid").is_err());
    }

    #[test]
    fn two_fresh_ids_differ() {
        assert_ne!(ConnectionId::new(), ConnectionId::new());
    }
}

//! Wire types for the Model Context Protocol: JSON-RPC 2.0 framing, the
//! typed request/result surface, content blocks, and the JSON Schema subset
//! used to describe tool parameters.

mod content;
mod jsonrpc;
mod messages;
mod schema;

pub use content::*;
pub use jsonrpc::*;
pub use messages::*;
pub use schema::*;

/// Newest protocol revision this crate understands.
pub const LATEST_PROTOCOL_VERSION: &str = "2025-03-26";

/// Revisions the server can speak, newest first.
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &["2025-03-26", "2024-11-05"];

/// Pick the protocol version to answer an `initialize` with: the client's
/// requested revision if we speak it, otherwise the newest one we do.
pub fn negotiate_protocol_version(requested: &str) -> &'static str {
    SUPPORTED_PROTOCOL_VERSIONS
        .iter()
        .find(|v| **v == requested)
        .copied()
        .unwrap_or(LATEST_PROTOCOL_VERSION)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negotiation_echoes_supported_versions() {
        assert_eq!(negotiate_protocol_version("2024-11-05"), "2024-11-05");
        assert_eq!(negotiate_protocol_version("2025-03-26"), "2025-03-26");
    }

    #[test]
    fn negotiation_falls_back_to_latest() {
        assert_eq!(negotiate_protocol_version("1999-01-01"), LATEST_PROTOCOL_VERSION);
    }
}

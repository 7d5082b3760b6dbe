pub mod auth;
pub mod envelope;
pub mod frame;
pub mod hashing;
pub mod sandbox;

use std::time::Duration;

/// Carried verbatim in every ANNOUNCE and HELLO. Peers with a differing
/// major version must not interoperate.
pub const PROTOCOL_VERSION: &str = "1.0";

pub const DEFAULT_DISCOVERY_PORT: u16 = 40123;
pub const DEFAULT_TCP_PORT: u16 = 40124;

pub const AUTH_OPEN: &str = "open";
pub const AUTH_PSK: &str = "psk-hmac-sha256";

/// Bound on control-path reads and writes; transfer-path reads inherit it.
pub const CONTROL_TIMEOUT: Duration = Duration::from_secs(15);

/// Error code vocabulary both ends recognize on the wire.
pub mod code {
    pub const BAD_REQUEST: &str = "BAD_REQUEST";
    pub const UNSUPPORTED_VERSION: &str = "UNSUPPORTED_VERSION";
    pub const AUTH_REQUIRED: &str = "AUTH_REQUIRED";
    pub const AUTH_FAILED: &str = "AUTH_FAILED";
    pub const NOT_FOUND: &str = "NOT_FOUND";
    pub const READ_ONLY: &str = "READ_ONLY";
    pub const PATH_TRAVERSAL: &str = "PATH_TRAVERSAL";
    pub const IO_ERROR: &str = "IO_ERROR";
    pub const INTEGRITY_FAILED: &str = "INTEGRITY_FAILED";
    pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
    pub const INVALID_RANGE: &str = "INVALID_RANGE";

    /// Local-only transport codes; never sent to a peer.
    pub const CONNECTION_CLOSED: &str = "CONNECTION_CLOSED";
    pub const TIMEOUT: &str = "TIMEOUT";
    pub const CANCELED: &str = "CANCELED";

    const WIRE_CODES: [&str; 11] = [
        BAD_REQUEST,
        UNSUPPORTED_VERSION,
        AUTH_REQUIRED,
        AUTH_FAILED,
        NOT_FOUND,
        READ_ONLY,
        PATH_TRAVERSAL,
        IO_ERROR,
        INTEGRITY_FAILED,
        INTERNAL_ERROR,
        INVALID_RANGE,
    ];

    /// Collapse any local-only code to `INTERNAL_ERROR` before it goes on
    /// the wire.
    pub fn to_wire(code: &str) -> &'static str {
        WIRE_CODES
            .iter()
            .copied()
            .find(|candidate| *candidate == code)
            .unwrap_or(INTERNAL_ERROR)
    }
}

//! Constants shared between the orchestrator and its shim processes.
//!
//! These must be identical on both sides of the parent/shim boundary.

/// Shim handshake constants.
pub mod shim {
    /// Marker written to the stderr pipe (followed by EOF) when a shim child
    /// finished its setup successfully. Anything else on the pipe is an
    /// error message. The leading and trailing NUL bytes keep the marker
    /// from colliding with UTF-8 error text.
    pub const SUCCESS_MARKER: &[u8] = &[0, b'O', b'K', 0];

    /// Ceiling for a single framed protocol message.
    pub const MAX_MESSAGE_BYTES: u32 = 1024 * 1024;
}

/// Pipe name components.
pub mod pipes {
    /// Per-container shim pipe: `<prefix>runhcs-shim-<id>`.
    pub const SHIM_FMT: &str = "runhcs-shim-";

    /// Per-VM shim pipe: `<prefix>runhcs-vmshim-<id>`.
    pub const VMSHIM_FMT: &str = "runhcs-vmshim-";
}

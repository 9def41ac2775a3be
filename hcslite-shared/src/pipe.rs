//! Pipe addressing for the shim processes.
//!
//! A [`PipeAddr`] is the platform-neutral name of a shim endpoint. On Windows
//! it resolves under the named-pipe namespace; everywhere else it resolves to
//! a Unix domain socket inside the runtime's pipe directory. Name components
//! that contain characters a pipe path cannot carry are percent-encoded.

use std::path::{Path, PathBuf};

use crate::constants::pipes;

/// Address of a shim pipe endpoint.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PipeAddr {
    name: String,
}

impl PipeAddr {
    /// Address of the container shim pipe for `id`.
    pub fn shim(id: &str) -> Self {
        Self {
            name: format!("{}{}", pipes::SHIM_FMT, escape(id)),
        }
    }

    /// Address of the VM shim pipe for `id`.
    pub fn vmshim(id: &str) -> Self {
        Self {
            name: format!("{}{}", pipes::VMSHIM_FMT, escape(id)),
        }
    }

    /// An exact, caller-chosen pipe name (no escaping applied).
    pub fn raw(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }

    /// The escaped pipe name component.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Windows named-pipe path for this address.
    #[cfg(windows)]
    pub fn to_path(&self, _pipe_dir: &Path) -> PathBuf {
        PathBuf::from(format!(r"\\.\pipe\{}", self.name))
    }

    /// Unix socket path for this address, rooted in the runtime pipe dir.
    #[cfg(not(windows))]
    pub fn to_path(&self, pipe_dir: &Path) -> PathBuf {
        pipe_dir.join(&self.name)
    }
}

impl std::fmt::Display for PipeAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Percent-encode everything outside the portable pipe-name alphabet.
fn escape(component: &str) -> String {
    let mut out = String::with_capacity(component.len());
    for byte in component.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'.' | b'_' | b'-' => {
                out.push(byte as char);
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_ids_pass_through() {
        assert_eq!(PipeAddr::shim("c1").name(), "runhcs-shim-c1");
        assert_eq!(PipeAddr::vmshim("vm_0").name(), "runhcs-vmshim-vm_0");
    }

    #[test]
    fn disallowed_characters_are_percent_encoded() {
        let addr = PipeAddr::shim("pod/with spaces\\and:colons");
        assert_eq!(
            addr.name(),
            "runhcs-shim-pod%2Fwith%20spaces%5Cand%3Acolons"
        );
    }

    #[test]
    fn non_ascii_ids_encode_every_byte() {
        let addr = PipeAddr::shim("héllo");
        assert_eq!(addr.name(), "runhcs-shim-h%C3%A9llo");
    }

    #[cfg(not(windows))]
    #[test]
    fn unix_paths_land_in_the_pipe_dir() {
        let addr = PipeAddr::shim("c1");
        assert_eq!(
            addr.to_path(Path::new("/run/hcslite")),
            PathBuf::from("/run/hcslite/runhcs-shim-c1")
        );
    }
}

//! VSMB share table for a Windows-guest utility VM.
//!
//! Keyed by the lowercased host path. The share name is a stable GUID
//! derived from the path's base filename, so re-adding the same directory in
//! any casing converges on one share with one ref-count.

use std::collections::HashMap;

use uuid::Uuid;

/// Namespace for the v5 share-name derivation. Fixed forever: the share name
/// must be a pure function of the path.
const VSMB_NAME_NAMESPACE: Uuid = Uuid::from_u128(0x8e20_5e7a_3d4c_49aa_b2f1_7f5a_03b1_9e44);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VsmbShare {
    pub guid: String,
    pub ref_count: u32,
    pub guest_path: Option<String>,
    pub flags: u32,
}

/// Outcome of a table add.
#[derive(Debug, PartialEq, Eq)]
pub enum VsmbAdd {
    /// First reference: the platform add request must be emitted.
    First { guid: String },
    /// The share already existed; only the ref-count moved.
    Again { ref_count: u32 },
}

/// Outcome of a table remove.
#[derive(Debug, PartialEq, Eq)]
pub enum VsmbRemove {
    NotFound,
    /// References remain; no platform request.
    Decremented { ref_count: u32 },
    /// Last reference dropped: the platform remove request must be emitted.
    Removed { guid: String },
}

#[derive(Debug, Default)]
pub struct VsmbTable {
    shares: HashMap<String, VsmbShare>,
}

impl VsmbTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, host_path: &str, flags: u32, guest_path: Option<&str>) -> VsmbAdd {
        let key = normalize(host_path);
        if let Some(share) = self.shares.get_mut(&key) {
            share.ref_count += 1;
            return VsmbAdd::Again {
                ref_count: share.ref_count,
            };
        }

        let guid = share_name(host_path);
        self.shares.insert(
            key,
            VsmbShare {
                guid: guid.clone(),
                ref_count: 1,
                guest_path: guest_path.map(str::to_string),
                flags,
            },
        );
        VsmbAdd::First { guid }
    }

    pub fn remove(&mut self, host_path: &str) -> VsmbRemove {
        let key = normalize(host_path);
        let Some(share) = self.shares.get_mut(&key) else {
            return VsmbRemove::NotFound;
        };
        share.ref_count -= 1;
        if share.ref_count > 0 {
            return VsmbRemove::Decremented {
                ref_count: share.ref_count,
            };
        }
        let guid = share.guid.clone();
        self.shares.remove(&key);
        VsmbRemove::Removed { guid }
    }

    /// Undo a [`VsmbAdd::First`] whose platform request failed.
    pub fn forget(&mut self, host_path: &str) {
        self.shares.remove(&normalize(host_path));
    }

    pub fn get(&self, host_path: &str) -> Option<&VsmbShare> {
        self.shares.get(&normalize(host_path))
    }

    pub fn is_empty(&self) -> bool {
        self.shares.is_empty()
    }

    pub fn len(&self) -> usize {
        self.shares.len()
    }
}

fn normalize(host_path: &str) -> String {
    host_path.to_lowercase()
}

/// Stable share name: UUIDv5 over the lowercased base filename.
///
/// The basename split recognizes both separator styles by hand. Host paths
/// here are Windows-shaped regardless of where the tooling runs, and
/// `std::path` only splits on the compile target's separators.
pub fn share_name(host_path: &str) -> String {
    let trimmed = host_path.trim_end_matches(['\\', '/']);
    let base = trimmed
        .rsplit(['\\', '/'])
        .next()
        .filter(|component| !component.is_empty())
        .unwrap_or(trimmed)
        .to_lowercase();
    Uuid::new_v5(&VSMB_NAME_NAMESPACE, base.as_bytes()).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_add_names_the_share_and_counts_one() {
        let mut table = VsmbTable::new();
        let VsmbAdd::First { guid } = table.add(r"C:\layers\base", 0x3, None) else {
            panic!("expected first add");
        };
        assert!(!guid.is_empty());
        assert_eq!(table.get(r"c:\layers\base").unwrap().ref_count, 1);
    }

    #[test]
    fn adds_are_case_insensitive_and_ref_counted() {
        let mut table = VsmbTable::new();
        table.add(r"C:\Data", 0, None);
        assert_eq!(
            table.add(r"c:\data", 0, None),
            VsmbAdd::Again { ref_count: 2 }
        );
        assert_eq!(
            table.add(r"C:\DATA", 0, None),
            VsmbAdd::Again { ref_count: 3 }
        );
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn the_share_name_is_a_pure_function_of_the_path() {
        assert_eq!(share_name(r"C:\layers\Base"), share_name(r"D:\other\BASE"));
        assert_ne!(share_name(r"C:\layers\base"), share_name(r"C:\layers\top"));
    }

    #[test]
    fn the_share_name_splits_on_either_separator() {
        assert_eq!(share_name(r"C:\layers\base"), share_name("/mnt/layers/base"));
        assert_eq!(share_name(r"C:\layers\base\"), share_name(r"C:\layers\base"));
        // A bare component still names itself.
        assert_eq!(share_name("base"), share_name(r"C:\layers\base"));
    }

    #[test]
    fn remove_mirrors_add() {
        let mut table = VsmbTable::new();
        let VsmbAdd::First { guid } = table.add(r"C:\X", 0, None) else {
            panic!("expected first add");
        };
        table.add(r"C:\X", 0, None);

        assert_eq!(table.remove(r"C:\X"), VsmbRemove::Decremented { ref_count: 1 });
        assert_eq!(table.remove(r"c:\x"), VsmbRemove::Removed { guid });
        assert_eq!(table.remove(r"C:\X"), VsmbRemove::NotFound);
        assert!(table.is_empty());
    }
}

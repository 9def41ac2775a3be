//! Network-namespace endpoint table.
//!
//! Tracks which network endpoints belong to which namespace inside a utility
//! VM. Attachment of the endpoints themselves is network-policy territory
//! and stays outside this runtime; the table exists so namespace membership
//! survives across shim requests.

use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct NamespaceTable {
    namespaces: HashMap<String, Vec<String>>,
}

impl NamespaceTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_endpoint(&mut self, namespace: &str, endpoint: &str) {
        let endpoints = self.namespaces.entry(namespace.to_string()).or_default();
        if !endpoints.iter().any(|e| e == endpoint) {
            endpoints.push(endpoint.to_string());
        }
    }

    pub fn remove_endpoint(&mut self, namespace: &str, endpoint: &str) {
        if let Some(endpoints) = self.namespaces.get_mut(namespace) {
            endpoints.retain(|e| e != endpoint);
            if endpoints.is_empty() {
                self.namespaces.remove(namespace);
            }
        }
    }

    pub fn endpoints(&self, namespace: &str) -> &[String] {
        self.namespaces
            .get(namespace)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoints_are_tracked_per_namespace_without_duplicates() {
        let mut table = NamespaceTable::new();
        table.add_endpoint("ns-1", "ep-a");
        table.add_endpoint("ns-1", "ep-a");
        table.add_endpoint("ns-1", "ep-b");
        table.add_endpoint("ns-2", "ep-c");

        assert_eq!(table.endpoints("ns-1"), ["ep-a", "ep-b"]);
        assert_eq!(table.endpoints("ns-2"), ["ep-c"]);

        table.remove_endpoint("ns-1", "ep-a");
        assert_eq!(table.endpoints("ns-1"), ["ep-b"]);
        table.remove_endpoint("ns-1", "ep-b");
        assert!(table.endpoints("ns-1").is_empty());
    }
}

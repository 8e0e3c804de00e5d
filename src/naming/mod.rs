use anyhow::{anyhow, Result};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

/// Trusted mapping from service names to the service accounts allowed to
/// run them, kept in sync with cluster events by the secure naming
/// controller and queried by authorization logic.
///
/// Mutations and reads serialise on one exclusive lock; callbacks may post
/// updates from any number of tasks.
pub struct SecureNamingMapping {
    mapping: Arc<Mutex<HashMap<String, HashSet<String>>>>,
}

#[allow(dead_code)]
impl SecureNamingMapping {
    pub fn new() -> Self {
        Self {
            mapping: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Register a service with no accounts. A no-op when already present.
    pub fn add_service(&self, name: &str) -> Result<()> {
        let mut mapping = self
            .mapping
            .lock()
            .map_err(|e| anyhow!("Lock poisoned: {e}"))?;
        mapping.entry(name.to_string()).or_default();
        Ok(())
    }

    /// Forget a service. A no-op when absent.
    pub fn remove_service(&self, name: &str) -> Result<()> {
        let mut mapping = self
            .mapping
            .lock()
            .map_err(|e| anyhow!("Lock poisoned: {e}"))?;
        mapping.remove(name);
        Ok(())
    }

    /// Replace the accounts of a service, inserting it when absent.
    pub fn set_service_accounts(&self, name: &str, accounts: HashSet<String>) -> Result<()> {
        let mut mapping = self
            .mapping
            .lock()
            .map_err(|e| anyhow!("Lock poisoned: {e}"))?;
        mapping.insert(name.to_string(), accounts);
        Ok(())
    }

    /// Snapshot of the accounts allowed to run a service.
    pub fn get_service_accounts(&self, name: &str) -> Result<Option<HashSet<String>>> {
        let mapping = self
            .mapping
            .lock()
            .map_err(|e| anyhow!("Lock poisoned: {e}"))?;
        Ok(mapping.get(name).cloned())
    }

    pub fn len(&self) -> Result<usize> {
        let mapping = self
            .mapping
            .lock()
            .map_err(|e| anyhow!("Lock poisoned: {e}"))?;
        Ok(mapping.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

impl Default for SecureNamingMapping {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for SecureNamingMapping {
    fn clone(&self) -> Self {
        Self {
            mapping: Arc::clone(&self.mapping),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn accounts(names: &[&str]) -> HashSet<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn test_add_service() {
        let mapping = SecureNamingMapping::new();
        mapping.set_service_accounts("svc2", accounts(&["acct1"])).unwrap();

        mapping.add_service("svc1").unwrap();
        assert_eq!(mapping.get_service_accounts("svc1").unwrap(), Some(accounts(&[])));
        assert_eq!(
            mapping.get_service_accounts("svc2").unwrap(),
            Some(accounts(&["acct1"]))
        );
    }

    #[test]
    fn test_add_service_is_idempotent() {
        let mapping = SecureNamingMapping::new();
        mapping.set_service_accounts("svc1", accounts(&["acct1"])).unwrap();

        // Re-adding must not wipe the existing accounts.
        mapping.add_service("svc1").unwrap();
        assert_eq!(
            mapping.get_service_accounts("svc1").unwrap(),
            Some(accounts(&["acct1"]))
        );
        assert_eq!(mapping.len().unwrap(), 1);
    }

    #[test]
    fn test_remove_service() {
        let mapping = SecureNamingMapping::new();
        mapping.add_service("svc1").unwrap();
        mapping.set_service_accounts("svc2", accounts(&["acct1"])).unwrap();

        mapping.remove_service("svc2").unwrap();
        assert_eq!(mapping.get_service_accounts("svc2").unwrap(), None);
        assert_eq!(mapping.len().unwrap(), 1);

        // Removing an absent service is a no-op.
        mapping.remove_service("svc3").unwrap();
        assert_eq!(mapping.len().unwrap(), 1);
    }

    #[test]
    fn test_set_service_accounts_replaces() {
        let mapping = SecureNamingMapping::new();
        mapping.set_service_accounts("svc1", accounts(&["acct3"])).unwrap();

        mapping
            .set_service_accounts("svc1", accounts(&["acct1", "acct2"]))
            .unwrap();
        assert_eq!(
            mapping.get_service_accounts("svc1").unwrap(),
            Some(accounts(&["acct1", "acct2"]))
        );

        // Setting the same value again changes nothing.
        mapping
            .set_service_accounts("svc1", accounts(&["acct1", "acct2"]))
            .unwrap();
        assert_eq!(
            mapping.get_service_accounts("svc1").unwrap(),
            Some(accounts(&["acct1", "acct2"]))
        );
    }

    #[test]
    fn test_set_service_accounts_inserts_when_absent() {
        let mapping = SecureNamingMapping::new();
        mapping.set_service_accounts("svc2", accounts(&["acct3"])).unwrap();

        mapping
            .set_service_accounts("svc1", accounts(&["acct1", "acct2"]))
            .unwrap();
        assert_eq!(
            mapping.get_service_accounts("svc1").unwrap(),
            Some(accounts(&["acct1", "acct2"]))
        );
        assert_eq!(
            mapping.get_service_accounts("svc2").unwrap(),
            Some(accounts(&["acct3"]))
        );
    }

    #[test]
    fn test_concurrent_updates() {
        let mapping = SecureNamingMapping::new();
        let mut handles = Vec::new();
        for i in 0..8 {
            let mapping = mapping.clone();
            handles.push(std::thread::spawn(move || {
                let name = format!("svc{}", i % 2);
                mapping.add_service(&name).unwrap();
                mapping
                    .set_service_accounts(&name, [format!("acct{i}")].into_iter().collect())
                    .unwrap();
                mapping.get_service_accounts(&name).unwrap();
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(mapping.len().unwrap(), 2);
    }
}

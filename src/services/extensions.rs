//! Extension directory consumed by the registrar and dialplan
//!
//! The production directory lives behind the admin plane; the core only
//! sees this trait. The in-memory implementation backs tests and
//! single-box deployments provisioned from a config file.

use std::collections::HashSet;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::protocols::auth::StoredSecret;
use crate::{Error, Result};

/// Capability flags an extension may hold
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Permission {
    #[serde(rename = "internal")]
    Internal,
    #[serde(rename = "external")]
    External,
    #[serde(rename = "voicemail")]
    Voicemail,
    #[serde(rename = "transfer")]
    Transfer,
    #[serde(rename = "monitor")]
    Monitor,
}

/// One provisioned extension
#[derive(Debug, Clone)]
pub struct ExtensionRecord {
    /// Dial string, unique
    pub number: String,
    pub display_name: String,
    /// SIP digest secret as provisioned for the phone
    pub sip_password: String,
    /// Voicemail PIN, PBKDF2-HMAC-SHA256
    pub pin_hash: Option<StoredSecret>,
    pub permissions: HashSet<Permission>,
    pub allow_external: bool,
    /// At most one mailbox per extension
    pub mailbox_id: Option<String>,
}

impl ExtensionRecord {
    pub fn verify_pin(&self, pin: &str) -> bool {
        match &self.pin_hash {
            Some(hash) => hash.verify(pin),
            None => false,
        }
    }
}

/// The lookup interface the SIP core consumes
#[async_trait]
pub trait ExtensionStore: Send + Sync {
    async fn get(&self, number: &str) -> Result<ExtensionRecord>;
    async fn exists(&self, number: &str) -> bool;
}

/// Directory held in memory, keyed by extension number
#[derive(Default)]
pub struct InMemoryExtensionStore {
    records: DashMap<String, ExtensionRecord>,
}

impl InMemoryExtensionStore {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
        }
    }

    pub fn insert(&self, record: ExtensionRecord) -> Result<()> {
        if self.records.contains_key(&record.number) {
            return Err(Error::invalid_state(format!(
                "Extension {} already provisioned",
                record.number
            )));
        }
        self.records.insert(record.number.clone(), record);
        Ok(())
    }

    pub fn remove(&self, number: &str) -> Option<ExtensionRecord> {
        self.records.remove(number).map(|(_, r)| r)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl ExtensionStore for InMemoryExtensionStore {
    async fn get(&self, number: &str) -> Result<ExtensionRecord> {
        self.records
            .get(number)
            .map(|r| r.clone())
            .ok_or_else(|| Error::registrar(format!("Unknown extension {}", number)))
    }

    async fn exists(&self, number: &str) -> bool {
        self.records.contains_key(number)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn test_extension(number: &str) -> ExtensionRecord {
        ExtensionRecord {
            number: number.to_string(),
            display_name: format!("Extension {}", number),
            sip_password: "secret".to_string(),
            pin_hash: Some(StoredSecret::derive_with("1234", &[9, 9, 9, 9], 1000)),
            permissions: HashSet::from([Permission::Internal, Permission::Voicemail]),
            allow_external: false,
            mailbox_id: Some(number.to_string()),
        }
    }

    #[tokio::test]
    async fn test_insert_and_lookup() {
        let store = InMemoryExtensionStore::new();
        store.insert(test_extension("1001")).unwrap();

        let record = store.get("1001").await.unwrap();
        assert_eq!(record.display_name, "Extension 1001");
        assert!(store.exists("1001").await);
        assert!(!store.exists("1002").await);
        assert!(store.get("1002").await.is_err());
    }

    #[tokio::test]
    async fn test_duplicate_number_rejected() {
        let store = InMemoryExtensionStore::new();
        store.insert(test_extension("1001")).unwrap();
        assert!(store.insert(test_extension("1001")).is_err());
    }

    #[test]
    fn test_pin_verification() {
        let record = test_extension("1001");
        assert!(record.verify_pin("1234"));
        assert!(!record.verify_pin("0000"));

        let mut no_pin = test_extension("1002");
        no_pin.pin_hash = None;
        assert!(!no_pin.verify_pin("1234"));
    }
}

//! Persisted key-value store
//!
//! [`KeyValueStore`] is the read/write contract; [`FileStore`] keeps the map
//! in a TOML file and replaces it atomically on every batch. [`VpnStore`]
//! layers the provisioning and descriptor schema on top. Reads of unset
//! keys yield `false` or the empty string.

use crate::types::{ConnectionState, DescriptorField, DeviceIdentity, GatingFlags, ServerDescriptor};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

/// File name of the store inside the state directory
pub const STORE_FILE: &str = "store.toml";

/// A persisted value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StoredValue {
    Bool(bool),
    Text(String),
}

/// Keys of the persisted schema
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKey {
    KeysCreated,
    PublicKeySent,
    Configured,
    DeviceId,
    PrivateKey,
    PublicKey,
    InterfaceAddress,
    InterfaceDns,
    PeerPublicKey,
    PeerPresharedKey,
    PeerAllowedIps,
    PeerEndpoint,
    PeerPersistentKeepalive,
    ConnectionState,
}

impl StoreKey {
    pub fn as_str(self) -> &'static str {
        match self {
            StoreKey::KeysCreated => "keysCreated",
            StoreKey::PublicKeySent => "publicKeySent",
            StoreKey::Configured => "configured",
            StoreKey::DeviceId => "deviceId",
            StoreKey::PrivateKey => "privateKey",
            StoreKey::PublicKey => "publicKey",
            StoreKey::InterfaceAddress => "interfaceAddress",
            StoreKey::InterfaceDns => "interfaceDns",
            StoreKey::PeerPublicKey => "peerPublicKey",
            StoreKey::PeerPresharedKey => "peerPresharedKey",
            StoreKey::PeerAllowedIps => "peerAllowedIPs",
            StoreKey::PeerEndpoint => "peerEndpoint",
            StoreKey::PeerPersistentKeepalive => "peerPersistentKeepalive",
            StoreKey::ConnectionState => "connectionState",
        }
    }

    /// Store slot backing a descriptor field. The interface private key is
    /// the device's own private key.
    pub fn for_field(field: DescriptorField) -> StoreKey {
        match field {
            DescriptorField::InterfaceAddress => StoreKey::InterfaceAddress,
            DescriptorField::InterfaceDns => StoreKey::InterfaceDns,
            DescriptorField::InterfacePrivateKey => StoreKey::PrivateKey,
            DescriptorField::PeerPublicKey => StoreKey::PeerPublicKey,
            DescriptorField::PeerPresharedKey => StoreKey::PeerPresharedKey,
            DescriptorField::PeerAllowedIps => StoreKey::PeerAllowedIps,
            DescriptorField::PeerEndpoint => StoreKey::PeerEndpoint,
            DescriptorField::PeerPersistentKeepalive => StoreKey::PeerPersistentKeepalive,
        }
    }
}

/// Read/write contract of the persisted store
pub trait KeyValueStore: Send + Sync {
    /// Current value of `key`, if set
    fn get(&self, key: StoreKey) -> Option<StoredValue>;

    /// Apply all entries at once; either every entry is persisted or none is
    fn write_batch(&self, entries: &[(StoreKey, StoredValue)]) -> Result<()>;
}

/// TOML-file backed store
pub struct FileStore {
    path: PathBuf,
    values: Mutex<BTreeMap<String, StoredValue>>,
}

impl FileStore {
    /// Open the store in `dir`, creating the directory if needed
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        if !dir.exists() {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create state directory {:?}", dir))?;
        }

        let path = dir.join(STORE_FILE);
        let values = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read store {:?}", path))?;
            toml::from_str(&contents).with_context(|| format!("Failed to parse store {:?}", path))?
        } else {
            BTreeMap::new()
        };

        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: StoreKey) -> Option<StoredValue> {
        let values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        values.get(key.as_str()).cloned()
    }

    fn write_batch(&self, entries: &[(StoreKey, StoredValue)]) -> Result<()> {
        let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);

        let mut next = values.clone();
        for (key, value) in entries {
            next.insert(key.as_str().to_string(), value.clone());
        }

        let contents = toml::to_string(&next).context("Failed to serialize store")?;
        let tmp = self.path.with_extension("toml.tmp");
        fs::write(&tmp, contents).with_context(|| format!("Failed to write {:?}", tmp))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&tmp, fs::Permissions::from_mode(0o600))?;
        }
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to replace store {:?}", self.path))?;

        *values = next;
        Ok(())
    }
}

/// Typed view of the persisted schema
pub struct VpnStore {
    inner: Box<dyn KeyValueStore>,
}

impl VpnStore {
    pub fn new(inner: impl KeyValueStore + 'static) -> Self {
        Self {
            inner: Box::new(inner),
        }
    }

    fn bool(&self, key: StoreKey) -> bool {
        match self.inner.get(key) {
            Some(StoredValue::Bool(b)) => b,
            None => false,
            Some(other) => {
                log::warn!("Store key {} holds {:?}, expected a boolean", key.as_str(), other);
                false
            }
        }
    }

    fn text(&self, key: StoreKey) -> String {
        match self.inner.get(key) {
            Some(StoredValue::Text(s)) => s,
            None => String::new(),
            Some(other) => {
                log::warn!("Store key {} holds {:?}, expected a string", key.as_str(), other);
                String::new()
            }
        }
    }

    /// Current gating flags
    pub fn flags(&self) -> GatingFlags {
        GatingFlags {
            keys_created: self.bool(StoreKey::KeysCreated),
            public_key_sent: self.bool(StoreKey::PublicKeySent),
            configured: self.bool(StoreKey::Configured),
        }
    }

    /// Persisted device identity (empty strings when unset)
    pub fn device_identity(&self) -> DeviceIdentity {
        DeviceIdentity {
            device_id: self.text(StoreKey::DeviceId),
            private_key: self.text(StoreKey::PrivateKey),
            public_key: self.text(StoreKey::PublicKey),
        }
    }

    pub fn save_device_id(&self, device_id: &str) -> Result<()> {
        self.inner
            .write_batch(&[(StoreKey::DeviceId, StoredValue::Text(device_id.to_string()))])
    }

    /// Persist a fresh keypair. Sets `keysCreated` and clears
    /// `publicKeySent` in the same batch since new keys need registering.
    pub fn save_keypair(&self, private_key: &str, public_key: &str) -> Result<()> {
        self.inner.write_batch(&[
            (StoreKey::PrivateKey, StoredValue::Text(private_key.to_string())),
            (StoreKey::PublicKey, StoredValue::Text(public_key.to_string())),
            (StoreKey::KeysCreated, StoredValue::Bool(true)),
            (StoreKey::PublicKeySent, StoredValue::Bool(false)),
        ])
    }

    pub fn mark_public_key_sent(&self) -> Result<()> {
        self.inner
            .write_batch(&[(StoreKey::PublicKeySent, StoredValue::Bool(true))])
    }

    /// Persist the peer/interface fields of `descriptor` and set `configured`
    pub fn save_configuration(&self, descriptor: &ServerDescriptor) -> Result<()> {
        let mut entries: Vec<(StoreKey, StoredValue)> = DescriptorField::ALL
            .iter()
            .filter(|f| **f != DescriptorField::InterfacePrivateKey)
            .map(|f| {
                (
                    StoreKey::for_field(*f),
                    StoredValue::Text(descriptor.get(*f).unwrap_or_default().to_string()),
                )
            })
            .collect();
        entries.push((StoreKey::Configured, StoredValue::Bool(true)));
        self.inner.write_batch(&entries)
    }

    /// Rebuild the descriptor from persisted fields, with the device's
    /// private key as the interface key
    pub fn descriptor(&self) -> ServerDescriptor {
        DescriptorField::ALL
            .iter()
            .fold(ServerDescriptor::new(), |descriptor, field| {
                descriptor.with(*field, self.text(StoreKey::for_field(*field)))
            })
    }

    /// Reset every flag, the keypair and all descriptor fields in one batch.
    /// The device id is kept.
    pub fn clear_configuration(&self) -> Result<()> {
        let mut entries = vec![
            (StoreKey::KeysCreated, StoredValue::Bool(false)),
            (StoreKey::PublicKeySent, StoredValue::Bool(false)),
            (StoreKey::Configured, StoredValue::Bool(false)),
            (StoreKey::PublicKey, StoredValue::Text(String::new())),
        ];
        entries.extend(
            DescriptorField::ALL
                .iter()
                .map(|f| (StoreKey::for_field(*f), StoredValue::Text(String::new()))),
        );
        self.inner.write_batch(&entries)
    }

    pub fn save_connection_state(&self, state: ConnectionState) -> Result<()> {
        self.inner.write_batch(&[(
            StoreKey::ConnectionState,
            StoredValue::Text(state.as_str().to_string()),
        )])
    }

    /// State published by the previous process, if any
    pub fn last_connection_state(&self) -> Option<ConnectionState> {
        let raw = self.text(StoreKey::ConnectionState);
        if raw.is_empty() {
            return None;
        }
        match raw.parse() {
            Ok(state) => Some(state),
            Err(e) => {
                log::warn!("Ignoring persisted connection state: {}", e);
                None
            }
        }
    }
}

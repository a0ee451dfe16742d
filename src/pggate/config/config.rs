use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};

use fnv::FnvHashMap;
use serde::Deserialize;
use tracing::{debug, info};

use crate::pggate::{Error, Result};

#[derive(Deserialize, Clone, Debug)]
pub struct Settings {
    /// recv_buffer_size is the default size for (user-space) buffers used to read protocol messages
    #[serde(default = "default_recv_buffer_size")]
    pub recv_buffer_size: u32,
    /// key_algorithm selects the keypair algorithm for ephemeral database client certificates
    #[serde(default)]
    pub key_algorithm: KeyAlgorithm,
    /// cloud_ca_certs maps a managed-cloud region to the PEM bundle of its root CA
    #[serde(default)]
    pub cloud_ca_certs: HashMap<String, PathBuf>,
}

const fn default_recv_buffer_size() -> u32 { 32 * 1024 }

impl Default for Settings {
    fn default() -> Self {
        Settings {
            recv_buffer_size: default_recv_buffer_size(),
            key_algorithm: KeyAlgorithm::default(),
            cloud_ca_certs: HashMap::new(),
        }
    }
}

impl Settings {
    fn load(&mut self) -> Result<()> {
        if self.recv_buffer_size < 4096 {
            self.recv_buffer_size = default_recv_buffer_size();
        }
        if self.recv_buffer_size > 1024 * 1024 {
            return Err(Error::new("recv_buffer_size cannot be > 1MB"));
        }
        self.recv_buffer_size = self.recv_buffer_size.next_power_of_two();
        Ok(())
    }

    /// Reads the configured per-region CA bundles into the region-indexed
    /// map injected into the engine.
    pub fn read_cloud_ca_certs(&self) -> Result<FnvHashMap<String, Vec<u8>>> {
        let mut certs = FnvHashMap::default();
        for (region, path) in &self.cloud_ca_certs {
            debug!(%region, path = %path.to_string_lossy(), "loading cloud CA bundle");
            certs.insert(region.clone(), std::fs::read(path)?);
        }
        Ok(certs)
    }
}

/// Keypair algorithm for ephemeral client certificates.
#[derive(Deserialize, Copy, Clone, Debug, Eq, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum KeyAlgorithm {
    EcdsaP256,
    EcdsaP384,
    Ed25519,
}

impl Default for KeyAlgorithm {
    fn default() -> Self {
        KeyAlgorithm::EcdsaP256
    }
}

impl KeyAlgorithm {
    pub fn signature_algorithm(&self) -> &'static rcgen::SignatureAlgorithm {
        match self {
            KeyAlgorithm::EcdsaP256 => &rcgen::PKCS_ECDSA_P256_SHA256,
            KeyAlgorithm::EcdsaP384 => &rcgen::PKCS_ECDSA_P384_SHA384,
            KeyAlgorithm::Ed25519 => &rcgen::PKCS_ED25519,
        }
    }
}

/// Load the gateway settings from a YAML file.
pub fn load_config(path: &Path) -> Result<Settings> {
    info!(config_path = %path.to_string_lossy(), "loading config file");
    let file = File::open(path)?;
    let mut settings: Settings = serde_yaml::from_reader(file)?;
    settings.load()?;
    Ok(settings)
}

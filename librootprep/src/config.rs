use std::fs;
use std::path::{Path, PathBuf};

use failure::ResultExt;
use toml;

use crate::{Error, ErrorKind, Result};

/// Default location of the boot configuration file inside the initramfs.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/rootprep/boot.conf";

/// Where the dm-crypt volume key comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySource {
    /// Unseal a TPM-sealed blob under the given PCR selection.
    TpmSealed { blob: PathBuf, pcrs: String },
    /// Read the key payload from the kernel keyring.
    Keyring { description: String },
}

/// Boot configuration, loaded from a TOML file and overridable from the
/// command line and the kernel command line.
#[derive(Deserialize, Clone, Default)]
pub struct BootConfig {
    device: Option<PathBuf>,
    keyfile: Option<PathBuf>,
    #[serde(rename = "sealed-key")]
    sealed_key: Option<PathBuf>,
    pcrs: Option<String>,
    #[serde(rename = "keyring-key")]
    keyring_key: Option<String>,
}

impl BootConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<BootConfig> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).context(ErrorKind::Io)?;
        toml::from_str(&content).map_err(|e| {
            Error::detail(ErrorKind::Internal,
                          format!("parsing config {}: {}", path.display(), e))
        })
    }

    /// Load the default config file if it exists, otherwise start empty and
    /// rely on command line values.
    pub fn load_default() -> Result<BootConfig> {
        if Path::new(DEFAULT_CONFIG_PATH).exists() {
            BootConfig::load(DEFAULT_CONFIG_PATH)
        } else {
            Ok(BootConfig::default())
        }
    }

    pub fn set_device(&mut self, device: impl Into<PathBuf>) {
        self.device = Some(device.into());
    }

    pub fn set_keyfile(&mut self, keyfile: impl Into<PathBuf>) {
        self.keyfile = Some(keyfile.into());
    }

    pub fn set_sealed_key(&mut self, blob: impl Into<PathBuf>) {
        self.sealed_key = Some(blob.into());
    }

    pub fn set_pcrs(&mut self, pcrs: impl Into<String>) {
        self.pcrs = Some(pcrs.into());
    }

    pub fn set_keyring_key(&mut self, description: impl Into<String>) {
        self.keyring_key = Some(description.into());
    }

    pub fn device(&self) -> Result<&Path> {
        match self.device {
            Some(ref path) => Ok(path),
            None => fail!(ErrorKind::Internal, "no rootfs device configured"),
        }
    }

    pub fn keyfile(&self) -> Result<&Path> {
        match self.keyfile {
            Some(ref path) => Ok(path),
            None => fail!(ErrorKind::Internal, "no public keyfile configured"),
        }
    }

    /// Resolve the configured key source, if any. A sealed blob requires a
    /// PCR selection; configuring both sources at once is an error.
    pub fn key_source(&self) -> Result<Option<KeySource>> {
        match (&self.sealed_key, &self.keyring_key) {
            (Some(_), Some(_)) => {
                fail!(ErrorKind::Internal,
                      "both sealed-key and keyring-key are configured, pick one")
            }
            (Some(blob), None) => {
                let pcrs = match self.pcrs {
                    Some(ref s) => s.clone(),
                    None => fail!(ErrorKind::Internal,
                                  "sealed-key is configured without a pcrs selection"),
                };
                Ok(Some(KeySource::TpmSealed { blob: blob.clone(), pcrs }))
            }
            (None, Some(description)) => {
                Ok(Some(KeySource::Keyring { description: description.clone() }))
            }
            (None, None) => Ok(None),
        }
    }
}

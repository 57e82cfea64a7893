use std::path::{Path, PathBuf};

use crate::config::KeySource;
use crate::dmtable;
use crate::keyring::KeyLookup;
use crate::tpm::{self, PcrPolicy};
use crate::{sha256_of_keyfile, DeviceMapper, ErrorKind, PartitionMetadata, Result};

/// Drives the whole activation sequence: authenticate the metadata trailer,
/// obtain the volume key when one is called for, and bring up the
/// device-mapper stack bottom to top. Any failure tears down every device
/// created so far, in reverse order, before propagating.
pub struct Activation<'a> {
    dm: &'a dyn DeviceMapper,
    keyring: &'a dyn KeyLookup,
}

impl<'a> Activation<'a> {
    pub fn new(dm: &'a dyn DeviceMapper, keyring: &'a dyn KeyLookup) -> Activation<'a> {
        Activation { dm, keyring }
    }

    /// Returns the path of the device the rootfs should be mounted from:
    /// the top of the dm stack, or the raw partition for plain mode.
    pub fn run(
        &self,
        meta: &mut PartitionMetadata,
        keyfile: &Path,
        key_source: Option<&KeySource>,
    ) -> Result<PathBuf> {
        meta.load_and_verify(keyfile, self.keyring)?;
        verbose!("Authenticated metadata on {}: mode {}, fs {}",
                 meta.device_path().display(), meta.mode().label(), meta.fs_type());

        if meta.mode().has_crypt() {
            let mut key = self.obtain_key(keyfile, key_source)?;
            let key_hex = hex::encode(&key);
            for b in key.iter_mut() {
                *b = 0;
            }
            meta.splice_crypt_key(&key_hex)?;
        }

        let plan = dmtable::activation_plan(meta)?;
        if plan.is_empty() {
            verbose!("No device-mapper layers required, rootfs is {}", meta.device_path().display());
            return Ok(meta.device_path().to_path_buf());
        }

        let mut created: Vec<&'static str> = Vec::new();
        let mut top = meta.device_path().to_path_buf();
        for layer in &plan {
            let table = format!("0 {} {} {}", layer.sectors, layer.target, layer.params);
            let uuid = format!("rootprep-{}", layer.name);
            verbose!("Creating {} device '{}'", layer.target, layer.name);
            match self.dm.dm_create(layer.name, &uuid, &table, layer.readonly) {
                Ok(path) => {
                    created.push(layer.name);
                    top = path;
                }
                Err(err) => {
                    self.teardown(&created);
                    return Err(err);
                }
            }
        }
        Ok(top)
    }

    fn obtain_key(&self, keyfile: &Path, key_source: Option<&KeySource>) -> Result<Vec<u8>> {
        let source = match key_source {
            Some(source) => source,
            None => fail!(ErrorKind::Internal,
                          "metadata calls for dm-crypt but no key source is configured"),
        };
        match source {
            KeySource::TpmSealed { blob, pcrs } => {
                let digest = sha256_of_keyfile(keyfile)?;
                let policy = PcrPolicy::parse(pcrs)?;
                tpm::tpm_unseal(&digest, &policy, blob)
            }
            KeySource::Keyring { description } => self.keyring.get_key(description),
        }
    }

    fn teardown(&self, created: &[&'static str]) {
        for name in created.iter().rev() {
            verbose!("Removing device '{}'", name);
            if let Err(err) = self.dm.dm_remove(name) {
                warn!("Failed to remove device {}: {}", name, crate::format_error(&err));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dmtable::{CRYPT_NAME, VERINT_NAME};
    use crate::{Error, ErrorKind, SIG_LEN};
    use p256::ecdsa::signature::Signer;
    use p256::ecdsa::{Signature, SigningKey};
    use p256::pkcs8::EncodePublicKey;
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::io::Write;

    struct MockDm {
        calls: RefCell<Vec<String>>,
        tables: RefCell<HashMap<String, String>>,
        fail_on: Option<&'static str>,
    }

    impl MockDm {
        fn new() -> MockDm {
            MockDm {
                calls: RefCell::new(Vec::new()),
                tables: RefCell::new(HashMap::new()),
                fail_on: None,
            }
        }

        fn failing_on(name: &'static str) -> MockDm {
            let mut dm = MockDm::new();
            dm.fail_on = Some(name);
            dm
        }

        fn calls(&self) -> Vec<String> {
            self.calls.borrow().clone()
        }

        fn table(&self, name: &str) -> String {
            self.tables.borrow().get(name).cloned().unwrap()
        }
    }

    impl DeviceMapper for MockDm {
        fn dm_create(&self, name: &str, _uuid: &str, table: &str, _readonly: bool) -> Result<PathBuf> {
            if self.fail_on == Some(name) {
                return Err(Error::detail(ErrorKind::Io, "injected failure"));
            }
            self.calls.borrow_mut().push(format!("create {}", name));
            self.tables.borrow_mut().insert(name.to_string(), table.to_string());
            Ok(PathBuf::from(format!("/dev/mapper/{}", name)))
        }

        fn dm_remove(&self, name: &str) -> Result<()> {
            self.calls.borrow_mut().push(format!("remove {}", name));
            Ok(())
        }
    }

    struct MapKeyring(HashMap<String, Vec<u8>>);

    impl MapKeyring {
        fn empty() -> MapKeyring {
            MapKeyring(HashMap::new())
        }

        fn with(desc: &str, payload: Vec<u8>) -> MapKeyring {
            let mut map = HashMap::new();
            map.insert(desc.to_string(), payload);
            MapKeyring(map)
        }
    }

    impl KeyLookup for MapKeyring {
        fn get_key(&self, description: &str) -> Result<Vec<u8>> {
            self.0.get(description).cloned().ok_or_else(|| {
                Error::detail(ErrorKind::KeyringLookup, format!("no key '{}'", description))
            })
        }
    }

    struct Fixture {
        signing: SigningKey,
        keyfile: tempfile::NamedTempFile,
        image: tempfile::NamedTempFile,
    }

    impl Fixture {
        fn new() -> Fixture {
            let signing = SigningKey::random(&mut rand_core::OsRng);
            let pem = signing.verifying_key()
                .to_public_key_pem(p256::pkcs8::LineEnding::LF)
                .unwrap();
            let mut keyfile = tempfile::NamedTempFile::new().unwrap();
            keyfile.write_all(pem.as_bytes()).unwrap();

            let mut image = tempfile::NamedTempFile::new().unwrap();
            image.write_all(&vec![0u8; 16 * 1024]).unwrap();

            Fixture { signing, keyfile, image }
        }

        fn install_sections(&mut self, header: &str, verint: &str, crypt: &str) {
            let mut text = header.as_bytes().to_vec();
            text.push(0xFF);
            text.extend_from_slice(verint.as_bytes());
            text.push(0xFF);
            text.extend_from_slice(crypt.as_bytes());
            let mut signed = text.clone();
            signed.push(0);
            let sig: Signature = self.signing.sign(&signed);
            let trailer = crate::Trailer::build(&text, &sig.to_bytes()).unwrap();
            trailer.write_to(self.image.path()).unwrap();
        }

        fn run(
            &self,
            dm: &dyn DeviceMapper,
            keyring: &dyn KeyLookup,
            key_source: Option<&KeySource>,
        ) -> Result<PathBuf> {
            let activation = Activation::new(dm, keyring);
            let mut meta = PartitionMetadata::new(self.image.path());
            activation.run(&mut meta, self.keyfile.path(), key_source)
        }
    }

    #[test]
    fn plain_rootfs_uses_partition_directly() {
        let mut fx = Fixture::new();
        fx.install_sections("v1 ext4 ro plain", "", "");
        let dm = MockDm::new();
        let top = fx.run(&dm, &MapKeyring::empty(), None).unwrap();
        assert_eq!(top, fx.image.path());
        assert!(dm.calls().is_empty());
    }

    #[test]
    fn verity_rootfs_creates_one_device() {
        let mut fx = Fixture::new();
        fx.install_sections("v1 ext4 ro verity", "1 4096 4096 1024 1024 sha256 ab cd", "");
        let dm = MockDm::new();
        let top = fx.run(&dm, &MapKeyring::empty(), None).unwrap();
        assert_eq!(top, PathBuf::from("/dev/mapper/rootfs-verint"));
        assert_eq!(dm.calls(), vec!["create rootfs-verint"]);
        let table = dm.table(VERINT_NAME);
        assert!(table.starts_with("0 8192 verity 1 "));
    }

    #[test]
    fn crypt_verity_creates_layers_in_order() {
        let mut fx = Fixture::new();
        fx.install_sections(
            "v1 ext4 ro crypt-verity",
            "1 4096 4096 1024 1024 sha256 ab cd",
            "aes-xts-plain64",
        );
        let key: Vec<u8> = vec![0x42; 32];
        let keyring = MapKeyring::with("rootkey", key.clone());
        let source = KeySource::Keyring { description: "rootkey".to_string() };
        let dm = MockDm::new();
        let top = fx.run(&dm, &keyring, Some(&source)).unwrap();
        assert_eq!(top, PathBuf::from("/dev/mapper/rootfs-verint"));
        assert_eq!(dm.calls(), vec!["create rootfs-crypt", "create rootfs-verint"]);
        let crypt_table = dm.table(CRYPT_NAME);
        assert!(crypt_table.contains(&hex::encode(&key)));
        assert!(crypt_table.starts_with("0 8192 crypt aes-xts-plain64 "));
    }

    #[test]
    fn failed_upper_layer_removes_lower_layer() {
        let mut fx = Fixture::new();
        fx.install_sections(
            "v1 ext4 ro crypt-verity",
            "1 4096 4096 1024 1024 sha256 ab cd",
            "aes-xts-plain64",
        );
        let keyring = MapKeyring::with("rootkey", vec![0x42; 32]);
        let source = KeySource::Keyring { description: "rootkey".to_string() };
        let dm = MockDm::failing_on(VERINT_NAME);
        let err = fx.run(&dm, &keyring, Some(&source)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);
        assert_eq!(dm.calls(), vec!["create rootfs-crypt", "remove rootfs-crypt"]);
    }

    #[test]
    fn corrupted_signature_creates_no_devices() {
        let mut fx = Fixture::new();
        fx.install_sections("v1 ext4 ro verity", "1 4096 4096 1024 1024 sha256 ab cd", "");
        let trailer = crate::Trailer::from_path(fx.image.path()).unwrap();
        let text_len = trailer.text().unwrap().len();

        // Flip one bit in the final signature byte.
        let mut raw = std::fs::read(fx.image.path()).unwrap();
        let trailer_start = raw.len() - crate::META_SIZE;
        raw[trailer_start + text_len + SIG_LEN] ^= 0x01;
        std::fs::write(fx.image.path(), &raw).unwrap();

        let dm = MockDm::new();
        let err = fx.run(&dm, &MapKeyring::empty(), None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MetaSig);
        assert!(dm.calls().is_empty());
    }

    #[test]
    fn crypt_without_key_source_fails_before_activation() {
        let mut fx = Fixture::new();
        fx.install_sections("v1 ext4 ro crypt", "", "aes-xts-plain64 2048");
        let dm = MockDm::new();
        let err = fx.run(&dm, &MapKeyring::empty(), None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert!(dm.calls().is_empty());
    }

    #[test]
    fn missing_keyring_key_aborts_activation() {
        let mut fx = Fixture::new();
        fx.install_sections("v1 ext4 ro crypt", "", "aes-xts-plain64 2048");
        let source = KeySource::Keyring { description: "absent".to_string() };
        let dm = MockDm::new();
        let err = fx.run(&dm, &MapKeyring::empty(), Some(&source)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::KeyringLookup);
        assert!(dm.calls().is_empty());
    }
}

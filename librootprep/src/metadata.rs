use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::str;

use failure::ResultExt;

use crate::dmtable;
use crate::keyring::KeyLookup;
use crate::{BlockDev, ErrorKind, PublicKey, Result, SIGNATURE_LENGTH};

/// Size of the metadata trailer occupying the end of the partition.
pub const META_SIZE: usize = 4096;

/// Fixed length of the trailer signature.
pub const SIG_LEN: usize = SIGNATURE_LENGTH;

/// Version token the metadata text must begin with.
pub const META_VERSION: &str = "v1";

/// Longest permitted filesystem name.
pub const FS_TYPE_MAX: usize = 32;

// The metadata text, its NUL terminator and the signature all live inside
// the trailer, so the text may grow to META_SIZE - SIG_LEN - 2 bytes.
const MAX_TEXT_LEN: usize = META_SIZE - SIG_LEN - 1;

// Byte separating the header, verity/integrity and crypt sections.
const SECTION_SEP: u8 = 0xFF;

/// How the rootfs volume is protected, as declared by the metadata header.
/// Verity and integrity are mutually exclusive by construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptMode {
    Plain,
    Verity,
    Integrity,
    Crypt,
    CryptIntegrity,
    CryptVerity,
}

impl CryptMode {
    fn from_token(token: &str) -> Result<CryptMode> {
        match token {
            "plain" => Ok(CryptMode::Plain),
            "verity" => Ok(CryptMode::Verity),
            "integrity" => Ok(CryptMode::Integrity),
            "crypt" => Ok(CryptMode::Crypt),
            "crypt-integrity" => Ok(CryptMode::CryptIntegrity),
            "crypt-verity" => Ok(CryptMode::CryptVerity),
            _ => fail!(ErrorKind::MetaFormat, "unknown crypt mode '{}'", token),
        }
    }

    pub fn has_verity(self) -> bool {
        match self {
            CryptMode::Verity | CryptMode::CryptVerity => true,
            _ => false,
        }
    }

    pub fn has_integrity(self) -> bool {
        match self {
            CryptMode::Integrity | CryptMode::CryptIntegrity => true,
            _ => false,
        }
    }

    pub fn has_crypt(self) -> bool {
        match self {
            CryptMode::Crypt | CryptMode::CryptIntegrity | CryptMode::CryptVerity => true,
            _ => false,
        }
    }

    pub fn has_verint(self) -> bool {
        self.has_verity() || self.has_integrity()
    }

    pub fn label(self) -> &'static str {
        match self {
            CryptMode::Plain => "plain",
            CryptMode::Verity => "verity",
            CryptMode::Integrity => "integrity",
            CryptMode::Crypt => "crypt",
            CryptMode::CryptIntegrity => "crypt-integrity",
            CryptMode::CryptVerity => "crypt-verity",
        }
    }
}

/// The raw signed trailer read from the last `META_SIZE` bytes of the
/// backing device.
pub struct Trailer {
    buf: Vec<u8>,
}

impl Trailer {
    /// Read the trailer from a block device or from a regular image file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Trailer> {
        let path = path.as_ref();
        let meta = fs::metadata(path).context(ErrorKind::Io)?;
        if meta.file_type().is_block_device() {
            let mut dev = BlockDev::open_ro(path)?;
            Trailer::from_bytes(dev.read_tail(META_SIZE)?)
        } else {
            Trailer::from_file(path)
        }
    }

    fn from_file(path: &Path) -> Result<Trailer> {
        let mut file = File::open(path).context(ErrorKind::Io)?;
        let len = file.metadata().context(ErrorKind::Io)?.len();
        if len < META_SIZE as u64 {
            fail!(ErrorKind::Io, "{} is too short ({} bytes) to hold a metadata trailer",
                  path.display(), len);
        }
        file.seek(SeekFrom::End(-(META_SIZE as i64)))?;
        let mut buf = vec![0u8; META_SIZE];
        file.read_exact(&mut buf)?;
        Trailer::from_bytes(buf)
    }

    pub fn from_bytes(buf: Vec<u8>) -> Result<Trailer> {
        if buf.len() != META_SIZE {
            fail!(ErrorKind::Internal, "trailer buffer has length {}, expected {}",
                  buf.len(), META_SIZE);
        }
        Ok(Trailer { buf })
    }

    /// Assemble a trailer from metadata text and its signature. Used by
    /// provisioning tooling.
    pub fn build(text: &[u8], signature: &[u8]) -> Result<Trailer> {
        if text.len() >= MAX_TEXT_LEN {
            fail!(ErrorKind::MetaFormat, "metadata text is too long ({} bytes)", text.len());
        }
        if text.contains(&0u8) {
            fail!(ErrorKind::MetaFormat, "metadata text contains a NUL byte");
        }
        if signature.len() != SIG_LEN {
            fail!(ErrorKind::MetaFormat, "signature has length {}, expected {}",
                  signature.len(), SIG_LEN);
        }
        let mut buf = vec![0u8; META_SIZE];
        buf[..text.len()].copy_from_slice(text);
        buf[text.len() + 1..text.len() + 1 + SIG_LEN].copy_from_slice(signature);
        Trailer::from_bytes(buf)
    }

    fn text_len(&self) -> Result<usize> {
        let len = match self.buf.iter().position(|b| *b == 0) {
            Some(pos) => pos,
            None => fail!(ErrorKind::MetaFormat, "metadata text is not NUL terminated"),
        };
        if len >= MAX_TEXT_LEN {
            fail!(ErrorKind::MetaFormat, "metadata text is too long ({} bytes)", len);
        }
        Ok(len)
    }

    /// The metadata text without its NUL terminator.
    pub fn text(&self) -> Result<&[u8]> {
        Ok(&self.buf[..self.text_len()?])
    }

    /// The bytes covered by the signature: the text and its terminator.
    pub fn signed_region(&self) -> Result<&[u8]> {
        Ok(&self.buf[..self.text_len()? + 1])
    }

    pub fn signature(&self) -> Result<&[u8]> {
        let start = self.text_len()? + 1;
        Ok(&self.buf[start..start + SIG_LEN])
    }

    /// Write the trailer into the last `META_SIZE` bytes of a block device
    /// or image file.
    pub fn write_to(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let meta = fs::metadata(path).context(ErrorKind::Io)?;
        if meta.file_type().is_block_device() {
            let mut dev = BlockDev::open_rw(path)?;
            return dev.write_tail(&self.buf);
        }
        if meta.len() < META_SIZE as u64 {
            fail!(ErrorKind::Io, "{} is too short to hold a metadata trailer", path.display());
        }
        let mut file = OpenOptions::new().write(true).open(path).context(ErrorKind::Io)?;
        file.seek(SeekFrom::End(-(META_SIZE as i64)))?;
        file.write_all(&self.buf)?;
        Ok(())
    }
}

/// Everything the activation path needs to know about the rootfs partition,
/// assembled from the authenticated metadata trailer.
#[derive(Debug)]
pub struct PartitionMetadata {
    device_path: PathBuf,
    fs_type: String,
    read_only: bool,
    mode: CryptMode,
    dm_table_verint: String,
    dm_table_crypt: String,
    dm_volume_data_bytes: u64,
}

impl PartitionMetadata {
    pub fn new(device_path: impl Into<PathBuf>) -> PartitionMetadata {
        PartitionMetadata {
            device_path: device_path.into(),
            fs_type: String::new(),
            read_only: false,
            mode: CryptMode::Plain,
            dm_table_verint: String::new(),
            dm_table_crypt: String::new(),
            dm_volume_data_bytes: 0,
        }
    }

    /// Read the metadata trailer from the backing device, authenticate it
    /// against the PEM public keyfile, parse the metadata text and generate
    /// the device-mapper parameter strings.
    pub fn load_and_verify(&mut self, keyfile: impl AsRef<Path>, keyring: &dyn KeyLookup) -> Result<()> {
        let trailer = Trailer::from_path(&self.device_path)?;
        let pubkey = PublicKey::from_pem_file(keyfile)?;
        pubkey.verify(trailer.signed_region()?, trailer.signature()?)?;
        self.parse_text(trailer.text()?, keyring)
    }

    fn parse_text(&mut self, text: &[u8], keyring: &dyn KeyLookup) -> Result<()> {
        let sections: Vec<&[u8]> = text.split(|b| *b == SECTION_SEP).collect();
        if sections.len() != 3 {
            fail!(ErrorKind::MetaFormat,
                  "expected 3 metadata sections, found {}", sections.len());
        }
        let header = section_str(sections[0])?;
        let verint = section_str(sections[1])?;
        let crypt = section_str(sections[2])?;

        self.parse_header(header)?;

        if !self.mode.has_verint() && !verint.trim().is_empty() {
            fail!(ErrorKind::MetaFormat,
                  "unexpected verity/integrity section for mode '{}'", self.mode.label());
        }
        if !self.mode.has_crypt() && !crypt.trim().is_empty() {
            fail!(ErrorKind::MetaFormat,
                  "unexpected crypt section for mode '{}'", self.mode.label());
        }

        let composed = dmtable::compose(self.mode, &self.device_path, verint, crypt, keyring)?;
        self.dm_table_verint = composed.table_verint;
        self.dm_table_crypt = composed.table_crypt;
        self.dm_volume_data_bytes = composed.data_bytes;
        Ok(())
    }

    fn parse_header(&mut self, header: &str) -> Result<()> {
        let fields: Vec<&str> = header.split_whitespace().collect();
        if fields.len() != 4 {
            fail!(ErrorKind::MetaFormat,
                  "metadata header has {} fields, expected 4", fields.len());
        }
        if fields[0] != META_VERSION {
            fail!(ErrorKind::MetaFormat,
                  "metadata version '{}' does not match expected '{}'", fields[0], META_VERSION);
        }
        if fields[1].is_empty() || fields[1].len() > FS_TYPE_MAX {
            fail!(ErrorKind::MetaFormat, "bad filesystem type '{}'", fields[1]);
        }
        self.fs_type = fields[1].to_string();
        self.read_only = match fields[2] {
            "ro" => true,
            "rw" => false,
            other => fail!(ErrorKind::MetaFormat, "bad mount mode '{}'", other),
        };
        self.mode = CryptMode::from_token(fields[3])?;
        Ok(())
    }

    /// Replace the key placeholder in the crypt table with the hex encoded
    /// key obtained from the TPM or the kernel keyring.
    pub fn splice_crypt_key(&mut self, key_hex: &str) -> Result<()> {
        dmtable::splice_key(&mut self.dm_table_crypt, key_hex)
    }

    pub fn device_path(&self) -> &Path {
        &self.device_path
    }

    pub fn fs_type(&self) -> &str {
        &self.fs_type
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn mode(&self) -> CryptMode {
        self.mode
    }

    pub fn dm_table_verint(&self) -> &str {
        &self.dm_table_verint
    }

    pub fn dm_table_crypt(&self) -> &str {
        &self.dm_table_crypt
    }

    pub fn dm_volume_data_bytes(&self) -> u64 {
        self.dm_volume_data_bytes
    }
}

fn section_str(bytes: &[u8]) -> Result<&str> {
    match str::from_utf8(bytes) {
        Ok(s) => Ok(s),
        Err(_) => fail!(ErrorKind::MetaFormat, "metadata section is not valid utf-8"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keyring::KeyLookup;
    use crate::{Error, ErrorKind};
    use p256::ecdsa::signature::Signer;
    use p256::ecdsa::{Signature, SigningKey};
    use p256::pkcs8::EncodePublicKey;
    use std::collections::HashMap;
    use std::io::Write;

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
        fn get_key(&self, description: &str) -> crate::Result<Vec<u8>> {
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

        fn install_text(&mut self, text: &[u8]) {
            let mut signed = text.to_vec();
            signed.push(0);
            let sig: Signature = self.signing.sign(&signed);
            let trailer = Trailer::build(text, &sig.to_bytes()).unwrap();
            trailer.write_to(self.image.path()).unwrap();
        }

        fn install_sections(&mut self, header: &str, verint: &str, crypt: &str) {
            let mut text = header.as_bytes().to_vec();
            text.push(SECTION_SEP);
            text.extend_from_slice(verint.as_bytes());
            text.push(SECTION_SEP);
            text.extend_from_slice(crypt.as_bytes());
            self.install_text(&text);
        }

        fn load(&self, keyring: &dyn KeyLookup) -> crate::Result<PartitionMetadata> {
            let mut meta = PartitionMetadata::new(self.image.path());
            meta.load_and_verify(self.keyfile.path(), keyring)?;
            Ok(meta)
        }
    }

    #[test]
    fn plain_rootfs_parses_with_no_tables() {
        let mut fx = Fixture::new();
        fx.install_sections("v1 ext4 ro plain", "", "");
        let meta = fx.load(&MapKeyring::empty()).unwrap();
        assert_eq!(meta.mode(), CryptMode::Plain);
        assert_eq!(meta.fs_type(), "ext4");
        assert!(meta.is_read_only());
        assert!(meta.dm_table_verint().is_empty());
        assert!(meta.dm_table_crypt().is_empty());
        assert_eq!(meta.dm_volume_data_bytes(), 0);
    }

    #[test]
    fn verity_rootfs_generates_table_and_size() {
        let mut fx = Fixture::new();
        let salt = "0123456789abcdef0123456789abcdef";
        let root = "deadbeefdeadbeefdeadbeefdeadbeef";
        fx.install_sections(
            "v1 ext4 ro verity",
            &format!("1 4096 4096 1024 1024 sha256 {} {}", salt, root),
            "",
        );
        let meta = fx.load(&MapKeyring::empty()).unwrap();
        let dev = fx.image.path().display().to_string();
        assert_eq!(
            meta.dm_table_verint(),
            format!("1 {} {} 4096 4096 1024 1024 sha256 {} {}", dev, dev, salt, root)
        );
        assert!(meta.dm_table_crypt().is_empty());
        assert_eq!(meta.dm_volume_data_bytes(), 4096 * 1024);
    }

    #[test]
    fn integrity_rootfs_resolves_keyring_option() {
        let mut fx = Fixture::new();
        fx.install_sections(
            "v1 ext4 rw integrity",
            "2048 512 1 journal_mac:hmac-sha256::bootkey",
            "",
        );
        let payload: Vec<u8> = (1..=32).collect();
        let keyring = MapKeyring::with("bootkey", payload.clone());
        let meta = fx.load(&keyring).unwrap();
        let dev = fx.image.path().display().to_string();
        assert_eq!(
            meta.dm_table_verint(),
            format!("{} 0 - J 2 block_size:512 journal_mac:hmac-sha256:{} ", dev, hex::encode(&payload))
        );
        assert_eq!(meta.dm_volume_data_bytes(), 2048 * 512);
        assert!(!meta.is_read_only());
    }

    #[test]
    fn crypt_only_uses_sector_count_from_crypt_section() {
        let mut fx = Fixture::new();
        fx.install_sections("v1 ext4 ro crypt", "", "aes-xts-plain64 2048");
        let meta = fx.load(&MapKeyring::empty()).unwrap();
        let dev = fx.image.path().display().to_string();
        assert_eq!(meta.dm_table_crypt(), format!("aes-xts-plain64 - 0 {} 0", dev));
        assert_eq!(meta.dm_volume_data_bytes(), 2048 * 512);
    }

    #[test]
    fn corrupted_signature_is_rejected() {
        let mut fx = Fixture::new();
        fx.install_sections("v1 ext4 ro plain", "", "");
        // Flip one bit in the last signature byte.
        let mut trailer = Trailer::from_path(fx.image.path()).unwrap();
        let text_len = trailer.text().unwrap().len();
        trailer.buf[text_len + SIG_LEN] ^= 0x01;
        trailer.write_to(fx.image.path()).unwrap();

        let err = fx.load(&MapKeyring::empty()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MetaSig);
    }

    #[test]
    fn wrong_version_is_rejected() {
        let mut fx = Fixture::new();
        fx.install_sections("v2 ext4 ro plain", "", "");
        let err = fx.load(&MapKeyring::empty()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MetaFormat);
    }

    #[test]
    fn missing_section_separator_is_rejected() {
        let mut fx = Fixture::new();
        let mut text = b"v1 ext4 ro plain".to_vec();
        text.push(SECTION_SEP);
        fx.install_text(&text);
        let err = fx.load(&MapKeyring::empty()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MetaFormat);
    }

    #[test]
    fn unknown_crypt_mode_is_rejected() {
        let mut fx = Fixture::new();
        fx.install_sections("v1 ext4 ro scrambled", "", "");
        let err = fx.load(&MapKeyring::empty()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MetaFormat);
    }

    #[test]
    fn oversized_fs_type_is_rejected() {
        let mut fx = Fixture::new();
        let fs = "x".repeat(FS_TYPE_MAX + 1);
        fx.install_sections(&format!("v1 {} ro plain", fs), "", "");
        let err = fx.load(&MapKeyring::empty()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MetaFormat);
    }

    #[test]
    fn populated_section_for_plain_mode_is_rejected() {
        let mut fx = Fixture::new();
        fx.install_sections("v1 ext4 ro plain", "1 4096 4096 8 8 sha256 ab cd", "");
        let err = fx.load(&MapKeyring::empty()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MetaFormat);
    }

    #[test]
    fn text_length_boundaries() {
        // Largest text that still leaves room for the NUL and signature.
        let max_len = META_SIZE - SIG_LEN - 2;
        let mut buf = vec![b'x'; META_SIZE];
        buf[max_len] = 0;
        let trailer = Trailer::from_bytes(buf).unwrap();
        assert_eq!(trailer.text().unwrap().len(), max_len);

        // One byte longer must be rejected.
        let mut buf = vec![b'x'; META_SIZE];
        buf[max_len + 1] = 0;
        let trailer = Trailer::from_bytes(buf).unwrap();
        let err = trailer.text().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MetaFormat);
    }

    #[test]
    fn unterminated_text_is_rejected() {
        let trailer = Trailer::from_bytes(vec![b'x'; META_SIZE]).unwrap();
        assert_eq!(trailer.text().unwrap_err().kind(), ErrorKind::MetaFormat);
    }
}

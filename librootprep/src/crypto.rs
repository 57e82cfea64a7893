use std::fs;
use std::path::Path;

use failure::ResultExt;
use p256::ecdsa::signature::Verifier;
use p256::ecdsa::{Signature, VerifyingKey};
use p256::pkcs8::DecodePublicKey;
use sha2::{Digest, Sha256};

use crate::{Error, ErrorKind, Result};

/// Trailer signatures are fixed-size ECDSA P-256 (r || s).
pub const SIGNATURE_LENGTH: usize = 64;

/// Verifying half of the image signing key, loaded from a PEM encoded
/// SubjectPublicKeyInfo file. Signatures are ECDSA over SHA-256.
#[derive(Debug)]
pub struct PublicKey(VerifyingKey);

impl PublicKey {
    pub fn from_pem_file(path: impl AsRef<Path>) -> Result<PublicKey> {
        let path = path.as_ref();
        let pem = fs::read_to_string(path)
            .context(ErrorKind::CryptoKey)?;
        let key = VerifyingKey::from_public_key_pem(&pem)
            .map_err(|e| Error::detail(ErrorKind::CryptoKey,
                format!("cannot parse public key {}: {}", path.display(), e)))?;
        Ok(PublicKey(key))
    }

    /// Verify `signature` over `data`. Returns `Ok(())` only for a valid
    /// signature of the expected fixed length.
    pub fn verify(&self, data: &[u8], signature: &[u8]) -> Result<()> {
        if signature.len() != SIGNATURE_LENGTH {
            fail!(ErrorKind::MetaSig, "signature has length {}, expected {}",
                  signature.len(), SIGNATURE_LENGTH);
        }
        let signature = Signature::from_slice(signature)
            .map_err(|e| Error::detail(ErrorKind::MetaSig, e.to_string()))?;
        self.0.verify(data, &signature)
            .map_err(|_| Error::from(ErrorKind::MetaSig))
    }
}

/// SHA-256 digest over the raw bytes of the public keyfile. Installed as the
/// TPM primary-object authorization so that sealed keys are bound to the
/// image signer.
pub fn sha256_of_keyfile(path: impl AsRef<Path>) -> Result<[u8; 32]> {
    let bytes = fs::read(path.as_ref()).context(ErrorKind::CryptoKey)?;
    let digest = Sha256::digest(&bytes);
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use p256::ecdsa::signature::Signer;
    use p256::ecdsa::SigningKey;
    use p256::pkcs8::EncodePublicKey;
    use std::io::Write;

    fn test_keypair() -> (SigningKey, tempfile::NamedTempFile) {
        let signing = SigningKey::random(&mut rand_core::OsRng);
        let pem = signing.verifying_key()
            .to_public_key_pem(p256::pkcs8::LineEnding::LF)
            .unwrap();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(pem.as_bytes()).unwrap();
        (signing, file)
    }

    #[test]
    fn verify_accepts_valid_signature() {
        let (signing, keyfile) = test_keypair();
        let msg = b"v1 ext4 ro plain";
        let sig: Signature = signing.sign(msg);
        let pubkey = PublicKey::from_pem_file(keyfile.path()).unwrap();
        assert_eq!(sig.to_bytes().len(), SIGNATURE_LENGTH);
        pubkey.verify(msg, &sig.to_bytes()).unwrap();
    }

    #[test]
    fn verify_rejects_bit_flip() {
        let (signing, keyfile) = test_keypair();
        let msg = b"v1 ext4 ro plain";
        let sig: Signature = signing.sign(msg);
        let mut bytes = sig.to_bytes().to_vec();
        *bytes.last_mut().unwrap() ^= 0x01;
        let pubkey = PublicKey::from_pem_file(keyfile.path()).unwrap();
        let err = pubkey.verify(msg, &bytes).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MetaSig);
    }

    #[test]
    fn verify_rejects_wrong_length() {
        let (_, keyfile) = test_keypair();
        let pubkey = PublicKey::from_pem_file(keyfile.path()).unwrap();
        let err = pubkey.verify(b"data", &[0u8; 63]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MetaSig);
    }

    #[test]
    fn missing_keyfile_is_a_key_error() {
        let err = PublicKey::from_pem_file("/does/not/exist.pem").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CryptoKey);
    }

    #[test]
    fn keyfile_digest_is_stable() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"some key material").unwrap();
        let a = sha256_of_keyfile(file.path()).unwrap();
        let b = sha256_of_keyfile(file.path()).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, [0u8; 32]);
    }
}

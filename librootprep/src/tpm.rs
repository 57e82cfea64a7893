use std::convert::TryFrom;
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;
use std::str::FromStr;

use failure::ResultExt;
use sha2::{Digest as Sha2Digest, Sha256};
use tss_esapi::attributes::ObjectAttributesBuilder;
use tss_esapi::constants::SessionType;
use tss_esapi::handles::{KeyHandle, ObjectHandle, PcrHandle, SessionHandle};
use tss_esapi::interface_types::algorithm::{HashingAlgorithm, PublicAlgorithm};
use tss_esapi::interface_types::resource_handles::Hierarchy;
use tss_esapi::interface_types::session_handles::{AuthSession, PolicySession};
use tss_esapi::structures::{
    Auth, Digest, DigestValues, KeyedHashScheme, PcrSelectionList, PcrSelectionListBuilder,
    PcrSlot, Private, Public, PublicBuilder, PublicKeyedHashParameters, SensitiveData,
    SymmetricCipherParameters, SymmetricDefinition, SymmetricDefinitionObject,
};
use tss_esapi::tcti_ldr::{DeviceConfig, TctiNameConf};
use tss_esapi::traits::{Marshall, UnMarshall};
use tss_esapi::Context;

use crate::{Error, ErrorKind, Result};

/// PCR extended when an unseal attempt fails, binding the outcome into the
/// policy evaluation of every later boot.
const FAILURE_PCR_INDEX: u8 = 8;
const FAILURE_PCR: PcrHandle = PcrHandle::Pcr8;

// Fixed tag hashed into the failure PCR. Changing it invalidates policies
// that predict the post-failure PCR state.
const UNSEAL_FAILURE_TAG: &[u8] = b"rootprep.unseal.failed.v1";

/// A set of PCR indices in a single bank, parsed from a selection string
/// such as `"0,4,7"` or `"sha256:0,4,7"`. Duplicates collapse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PcrPolicy {
    bank: HashingAlgorithm,
    indices: Vec<u8>,
}

impl PcrPolicy {
    pub fn parse(selection: &str) -> Result<PcrPolicy> {
        let selection = selection.trim();
        let (bank, list) = match selection.find(':') {
            Some(idx) => (parse_bank(&selection[..idx])?, &selection[idx + 1..]),
            None => (HashingAlgorithm::Sha256, selection),
        };
        let mut indices = Vec::new();
        for token in list.split(',') {
            let token = token.trim();
            if token.is_empty() {
                fail!(ErrorKind::TpmBadPcr, "empty PCR index in selection '{}'", selection);
            }
            let index: u8 = match token.parse() {
                Ok(n) => n,
                Err(_) => fail!(ErrorKind::TpmBadPcr, "bad PCR index '{}'", token),
            };
            if index > 23 {
                fail!(ErrorKind::TpmBadPcr, "PCR index {} is out of range", index);
            }
            indices.push(index);
        }
        if indices.is_empty() {
            fail!(ErrorKind::TpmBadPcr, "PCR selection is empty");
        }
        indices.sort_unstable();
        indices.dedup();
        Ok(PcrPolicy { bank, indices })
    }

    pub fn indices(&self) -> &[u8] {
        &self.indices
    }

    fn selection_list(&self) -> Result<PcrSelectionList> {
        let mut slots = Vec::with_capacity(self.indices.len());
        for index in &self.indices {
            slots.push(pcr_slot(*index)?);
        }
        PcrSelectionListBuilder::new()
            .with_selection(self.bank, &slots)
            .build()
            .context(ErrorKind::TpmState)
            .map_err(Error::from)
    }
}

fn parse_bank(name: &str) -> Result<HashingAlgorithm> {
    match name.trim() {
        "sha1" => Ok(HashingAlgorithm::Sha1),
        "sha256" => Ok(HashingAlgorithm::Sha256),
        "sha384" => Ok(HashingAlgorithm::Sha384),
        other => fail!(ErrorKind::TpmBadPcr, "unknown PCR bank '{}'", other),
    }
}

fn pcr_slot(index: u8) -> Result<PcrSlot> {
    let slot = match index {
        0 => PcrSlot::Slot0,
        1 => PcrSlot::Slot1,
        2 => PcrSlot::Slot2,
        3 => PcrSlot::Slot3,
        4 => PcrSlot::Slot4,
        5 => PcrSlot::Slot5,
        6 => PcrSlot::Slot6,
        7 => PcrSlot::Slot7,
        8 => PcrSlot::Slot8,
        9 => PcrSlot::Slot9,
        10 => PcrSlot::Slot10,
        11 => PcrSlot::Slot11,
        12 => PcrSlot::Slot12,
        13 => PcrSlot::Slot13,
        14 => PcrSlot::Slot14,
        15 => PcrSlot::Slot15,
        16 => PcrSlot::Slot16,
        17 => PcrSlot::Slot17,
        18 => PcrSlot::Slot18,
        19 => PcrSlot::Slot19,
        20 => PcrSlot::Slot20,
        21 => PcrSlot::Slot21,
        22 => PcrSlot::Slot22,
        23 => PcrSlot::Slot23,
        _ => fail!(ErrorKind::TpmBadPcr, "PCR index {} is out of range", index),
    };
    Ok(slot)
}

/// The sealed key as persisted on disk: the TPM2B private part and the
/// marshalled public part, each preceded by a little endian length.
#[derive(Debug)]
pub struct SealedBlob {
    private: Vec<u8>,
    public: Vec<u8>,
}

impl SealedBlob {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + self.private.len() + self.public.len());
        out.extend_from_slice(&(self.private.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.private);
        out.extend_from_slice(&(self.public.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.public);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<SealedBlob> {
        if bytes.len() < 8 {
            fail!(ErrorKind::TpmState, "sealed blob is too short ({} bytes)", bytes.len());
        }
        let private_len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        let private_end = 4 + private_len;
        if bytes.len() < private_end + 4 {
            fail!(ErrorKind::TpmState, "sealed blob is truncated");
        }
        let public_len = u32::from_le_bytes([
            bytes[private_end],
            bytes[private_end + 1],
            bytes[private_end + 2],
            bytes[private_end + 3],
        ]) as usize;
        let public_end = private_end + 4 + public_len;
        if private_len == 0 || public_len == 0 || bytes.len() != public_end {
            fail!(ErrorKind::TpmState, "sealed blob has inconsistent layout");
        }
        Ok(SealedBlob {
            private: bytes[4..private_end].to_vec(),
            public: bytes[private_end + 4..public_end].to_vec(),
        })
    }

    pub fn read_from(path: impl AsRef<Path>) -> Result<SealedBlob> {
        let bytes = fs::read(path.as_ref()).context(ErrorKind::Io)?;
        SealedBlob::decode(&bytes)
    }

    /// Write the blob through a temporary file and rename it into place so
    /// the file is never observable half written.
    pub fn write_to(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let tmp = path.with_extension("tmp");
        let mut file = File::create(&tmp).context(ErrorKind::Io)?;
        file.write_all(&self.encode())?;
        file.sync_all()?;
        fs::rename(&tmp, path).context(ErrorKind::Io)?;
        Ok(())
    }
}

/// Stateful conversation with the TPM. Handles acquired along the way are
/// tracked and flushed in reverse order of acquisition on every exit path,
/// including drop; the context itself finalizes the transport when dropped.
pub struct TpmSealer {
    context: Context,
    primary: Option<KeyHandle>,
    session: Option<AuthSession>,
    loaded: Option<ObjectHandle>,
}

impl TpmSealer {
    /// Open the TPM device transport and run the incremental self test.
    pub fn new() -> Result<TpmSealer> {
        let device = if Path::new("/dev/tpmrm0").exists() {
            "/dev/tpmrm0"
        } else {
            "/dev/tpm0"
        };
        let conf = DeviceConfig::from_str(device).context(ErrorKind::TpmTransport)?;
        let mut context = Context::new(TctiNameConf::Device(conf))
            .context(ErrorKind::TpmTransport)?;
        context.self_test(false).context(ErrorKind::TpmState)?;
        Ok(TpmSealer {
            context,
            primary: None,
            session: None,
            loaded: None,
        })
    }

    /// Seal `key` under the PCR policy. The keyfile digest becomes the
    /// authorization of the primary object, so sealed material cannot be
    /// recreated or released without the same signer key in place.
    pub fn seal(&mut self, pub_key_digest: &[u8; 32], policy: &PcrPolicy, key: &[u8]) -> Result<SealedBlob> {
        self.load_primary(pub_key_digest)?;

        // Trial session: compute the policy digest the real session will
        // have to reproduce at unseal time.
        let policy_session = self.start_policy_session(SessionType::Trial)?;
        self.bind_pcr_policy(policy, policy_session)?;
        let policy_digest = self.context
            .policy_get_digest(policy_session)
            .context(ErrorKind::TpmState)?;
        self.flush_session();

        let attributes = ObjectAttributesBuilder::new()
            .with_fixed_tpm(true)
            .with_fixed_parent(true)
            .with_admin_with_policy(true)
            .build()
            .context(ErrorKind::TpmState)?;
        let public = PublicBuilder::new()
            .with_public_algorithm(PublicAlgorithm::KeyedHash)
            .with_name_hashing_algorithm(HashingAlgorithm::Sha256)
            .with_object_attributes(attributes)
            .with_auth_policy(policy_digest)
            .with_keyed_hash_parameters(PublicKeyedHashParameters::new(KeyedHashScheme::Null))
            .with_keyed_hash_unique_identifier(Digest::default())
            .build()
            .context(ErrorKind::TpmState)?;
        let sensitive = SensitiveData::try_from(key.to_vec()).context(ErrorKind::TpmState)?;

        let primary = self.primary_handle()?;
        let created = self.context
            .execute_with_nullauth_session(|ctx| {
                ctx.create(primary, public, None, Some(sensitive), None, None)
            })
            .context(ErrorKind::TpmState)?;

        let blob = SealedBlob {
            private: created.out_private.to_vec(),
            public: created.out_public.marshall().context(ErrorKind::TpmState)?,
        };
        self.flush_primary();
        Ok(blob)
    }

    /// Load the sealed blob and release the key it protects. The TPM itself
    /// enforces that the live PCR values reproduce the digest bound at seal
    /// time; a mismatch is reported as a policy failure.
    pub fn unseal(&mut self, pub_key_digest: &[u8; 32], policy: &PcrPolicy, blob: &SealedBlob) -> Result<Vec<u8>> {
        self.load_primary(pub_key_digest)?;

        let private = Private::try_from(blob.private.clone()).context(ErrorKind::TpmState)?;
        let public = Public::unmarshall(&blob.public).context(ErrorKind::TpmState)?;
        let primary = self.primary_handle()?;
        let loaded = self.context
            .execute_with_nullauth_session(|ctx| ctx.load(primary, private, public))
            .context(ErrorKind::TpmState)?;
        self.loaded = Some(loaded.into());

        let policy_session = self.start_policy_session(SessionType::Policy)?;
        self.bind_pcr_policy(policy, policy_session)?;

        let session = match self.session {
            Some(s) => s,
            None => fail!(ErrorKind::Internal, "no live policy session"),
        };
        let object = match self.loaded {
            Some(o) => o,
            None => fail!(ErrorKind::Internal, "sealed object is not loaded"),
        };
        let sensitive = self.context
            .execute_with_session(Some(session), |ctx| ctx.unseal(object))
            .context(ErrorKind::TpmPolicy)?;

        self.flush_loaded();
        self.flush_session();
        self.flush_primary();
        Ok(sensitive.to_vec())
    }

    /// Draw fresh random bytes from the TPM.
    pub fn get_random(&mut self, count: usize) -> Result<Vec<u8>> {
        let bytes = self.context.get_random(count).context(ErrorKind::TpmState)?;
        Ok(bytes.to_vec())
    }

    /// Record a failed unseal by extending the designated failure PCR with
    /// the fixed digest.
    pub fn extend_failure_pcr(&mut self) -> Result<()> {
        let digest = Digest::try_from(Sha256::digest(UNSEAL_FAILURE_TAG).to_vec())
            .context(ErrorKind::TpmState)?;
        let mut values = DigestValues::new();
        values.set(HashingAlgorithm::Sha256, digest);
        self.context
            .execute_with_nullauth_session(|ctx| ctx.pcr_extend(FAILURE_PCR, values))
            .context(ErrorKind::TpmState)?;
        Ok(())
    }

    fn load_primary(&mut self, pub_key_digest: &[u8; 32]) -> Result<()> {
        let auth = Auth::try_from(pub_key_digest.to_vec()).context(ErrorKind::TpmState)?;
        let attributes = ObjectAttributesBuilder::new()
            .with_fixed_tpm(true)
            .with_fixed_parent(true)
            .with_sensitive_data_origin(true)
            .with_user_with_auth(true)
            .with_decrypt(true)
            .with_restricted(true)
            .build()
            .context(ErrorKind::TpmState)?;
        let public = PublicBuilder::new()
            .with_public_algorithm(PublicAlgorithm::SymCipher)
            .with_name_hashing_algorithm(HashingAlgorithm::Sha256)
            .with_object_attributes(attributes)
            .with_symmetric_cipher_parameters(SymmetricCipherParameters::new(
                SymmetricDefinitionObject::AES_256_CFB,
            ))
            .with_symmetric_cipher_unique_identifier(Digest::default())
            .build()
            .context(ErrorKind::TpmState)?;

        let auth_value = auth.clone();
        let created = self.context
            .execute_with_nullauth_session(|ctx| {
                ctx.create_primary(Hierarchy::Endorsement, public, Some(auth_value), None, None, None)
            })
            .context(ErrorKind::TpmState)?;
        self.context
            .tr_set_auth(created.key_handle.into(), auth)
            .context(ErrorKind::TpmState)?;
        self.primary = Some(created.key_handle);
        Ok(())
    }

    fn primary_handle(&self) -> Result<KeyHandle> {
        match self.primary {
            Some(handle) => Ok(handle),
            None => fail!(ErrorKind::Internal, "primary key is not loaded"),
        }
    }

    fn start_policy_session(&mut self, session_type: SessionType) -> Result<PolicySession> {
        let session = self.context
            .start_auth_session(
                None,
                None,
                None,
                session_type,
                SymmetricDefinition::AES_256_CFB,
                HashingAlgorithm::Sha256,
            )
            .context(ErrorKind::TpmState)?;
        let session = match session {
            Some(s) => s,
            None => fail!(ErrorKind::TpmState, "TPM did not return an auth session"),
        };
        self.session = Some(session);
        PolicySession::try_from(session)
            .context(ErrorKind::TpmState)
            .map_err(Error::from)
    }

    fn bind_pcr_policy(&mut self, policy: &PcrPolicy, session: PolicySession) -> Result<()> {
        let selection = policy.selection_list()?;
        // An empty digest lets the TPM compute it from the live PCR values.
        self.context
            .policy_pcr(session, Digest::default(), selection)
            .context(ErrorKind::TpmState)?;
        Ok(())
    }

    fn flush_loaded(&mut self) {
        if let Some(handle) = self.loaded.take() {
            let _ = self.context.flush_context(handle);
        }
    }

    fn flush_session(&mut self) {
        if let Some(session) = self.session.take() {
            let _ = self.context.flush_context(SessionHandle::from(session).into());
        }
    }

    fn flush_primary(&mut self) {
        if let Some(handle) = self.primary.take() {
            let _ = self.context.flush_context(handle.into());
        }
    }
}

impl Drop for TpmSealer {
    fn drop(&mut self) {
        self.flush_loaded();
        self.flush_session();
        self.flush_primary();
    }
}

/// Seal `key` to the current TPM state described by `policy`, authorized by
/// the digest of the public keyfile.
pub fn tpm_seal(pub_key_digest: &[u8; 32], policy: &PcrPolicy, key: &[u8]) -> Result<SealedBlob> {
    let mut tpm = TpmSealer::new()?;
    tpm.seal(pub_key_digest, policy, key)
}

/// Unseal the key stored at `blob_path`. On failure the boot-failed PCR is
/// extended (best effort) before the original error is returned.
pub fn tpm_unseal(pub_key_digest: &[u8; 32], policy: &PcrPolicy, blob_path: &Path) -> Result<Vec<u8>> {
    let blob = SealedBlob::read_from(blob_path)?;
    let mut tpm = TpmSealer::new()?;
    match tpm.unseal(pub_key_digest, policy, &blob) {
        Ok(key) => Ok(key),
        Err(err) => {
            if let Err(e) = tpm.extend_failure_pcr() {
                warn!("Failed to extend PCR {} after unseal failure: {}",
                      FAILURE_PCR_INDEX, crate::format_error(&e));
            }
            Err(err)
        }
    }
}

/// Fetch `count` random bytes from the TPM.
pub fn tpm_get_random(count: usize) -> Result<Vec<u8>> {
    let mut tpm = TpmSealer::new()?;
    tpm.get_random(count)
}

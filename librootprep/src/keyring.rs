use std::ffi::CString;
use std::io;
use std::os::raw::c_char;

use libc::{self, c_int, c_long, c_ulong};

use crate::{Error, ErrorKind, Result};

/// Upper bound on the payload size of any key this tool will accept from
/// the kernel keyring.
pub const PAYLOAD_MAX: usize = 256;

const KEYCTL_SEARCH: c_int = 10;
const KEYCTL_READ: c_int = 11;

const KEY_SPEC_USER_KEYRING: c_int = -4;

/// Lookup of symmetric key material by description. The kernel keyring is
/// the production source; tests substitute a map-backed implementation.
pub trait KeyLookup {
    fn get_key(&self, description: &str) -> Result<Vec<u8>>;
}

/// Key lookup backed by the kernel keyring service. Searches the calling
/// user's keyring first and falls back to `request_key(2)`.
pub struct KernelKeyring;

impl KeyLookup for KernelKeyring {
    fn get_key(&self, description: &str) -> Result<Vec<u8>> {
        let key = KernelKey::user_keyring().search(description)
            .or_else(|_| KernelKey::request_key("user", description))
            .map_err(|e| Error::detail(ErrorKind::KeyringLookup,
                format!("key '{}' not found: {}", description, e)))?;
        let payload = key.read()
            .map_err(|e| Error::detail(ErrorKind::KeyringLookup,
                format!("reading key '{}': {}", description, e)))?;
        if payload.len() > PAYLOAD_MAX {
            fail!(ErrorKind::KeyringLookup,
                  "key '{}' payload is {} bytes, limit is {}",
                  description, payload.len(), PAYLOAD_MAX);
        }
        Ok(payload)
    }
}

/// Handle to a single key in the kernel keyring.
struct KernelKey(i32);

impl KernelKey {
    fn user_keyring() -> Self {
        KernelKey(KEY_SPEC_USER_KEYRING)
    }

    fn request_key(key_type: &str, description: &str) -> io::Result<Self> {
        let key_type = CString::new(key_type).unwrap();
        let description = CString::new(description).unwrap();
        let serial = unsafe {
            libc::syscall(libc::SYS_request_key, key_type.as_ptr(), description.as_ptr(), 0 as *const c_char, 0)
        };
        if serial == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(KernelKey(serial as i32))
    }

    fn search(&self, description: &str) -> io::Result<Self> {
        let key_type = CString::new("user").unwrap();
        let description = CString::new(description).unwrap();
        let serial = keyctl(KEYCTL_SEARCH, self.id(),
                            key_type.as_ptr() as u64,
                            description.as_ptr() as u64, 0)?;
        Ok(KernelKey(serial as i32))
    }

    fn read(&self) -> io::Result<Vec<u8>> {
        // First call with a null buffer reports the payload size.
        let size = keyctl(KEYCTL_READ, self.id(), 0, 0, 0)?;
        if size < 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "keyctl reported negative size"));
        }
        let mut buffer = vec![0u8; size as usize];
        let n = keyctl(KEYCTL_READ, self.id(),
                       buffer.as_mut_ptr() as u64,
                       buffer.len() as u64, 0)?;
        if n < 0 || (n as usize) > buffer.len() {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "keyctl returned bad payload size"));
        }
        buffer.truncate(n as usize);
        Ok(buffer)
    }

    fn id(&self) -> c_ulong {
        self.0 as c_ulong
    }
}

fn keyctl(command: c_int, arg2: c_ulong, arg3: c_ulong, arg4: c_ulong, arg5: c_ulong) -> io::Result<c_long> {
    unsafe {
        let r = libc::syscall(libc::SYS_keyctl, command, arg2, arg3, arg4, arg5);
        if r == -1 {
            Err(io::Error::last_os_error())
        } else {
            Ok(r)
        }
    }
}

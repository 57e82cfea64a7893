#[macro_use] extern crate failure;
#[macro_use] extern crate nix;
#[macro_use] extern crate serde_derive;
#[macro_use] extern crate lazy_static;

#[macro_export]
macro_rules! info {
    ($e:expr) => { println!("[+] {}", $e); };
    ($fmt:expr, $($arg:tt)+) => { println!("[+] {}", format!($fmt, $($arg)+)); };
}
#[macro_export]
macro_rules! warn {
    ($e:expr) => { eprintln!("WARNING: {}", $e); };
    ($fmt:expr, $($arg:tt)+) => { eprintln!("WARNING: {}", format!($fmt, $($arg)+)); };
}
#[macro_export]
macro_rules! verbose {
    ($e:expr) => { if $crate::verbose() { println!("[+] {}", $e);} };
    ($fmt:expr, $($arg:tt)+) => { if $crate::verbose() { println!("[+] {}", format!($fmt, $($arg)+));} };
}

extern crate libc;
extern crate serde;
extern crate toml;
extern crate hex;
extern crate sha2;
extern crate p256;
extern crate tss_esapi;

use std::cell::RefCell;

thread_local! {
    pub static VERBOSE: RefCell<bool> = RefCell::new(false);
}

pub fn verbose() -> bool {
    VERBOSE.with(|f| { *f.borrow() })
}

pub fn set_verbose(val: bool) {
    VERBOSE.with(|f| { *f.borrow_mut() = val });
}

#[macro_use]
mod error;

mod blockdev;
mod cmdline;
mod config;
mod crypto;
mod dmctl;
mod dmtable;
mod keyring;
mod metadata;
mod rootfs;
mod tpm;

pub use crate::blockdev::BlockDev;
pub use crate::cmdline::CommandLine;
pub use crate::config::{BootConfig, KeySource};
pub use crate::crypto::{sha256_of_keyfile, PublicKey, SIGNATURE_LENGTH};
pub use crate::dmctl::{DeviceMapper, DmSetup};
pub use crate::dmtable::{DmLayer, CRYPT_NAME, DM_TABLE_MAX, VERINT_NAME};
pub use crate::error::{Error, ErrorKind, Result};
pub use crate::keyring::{KernelKeyring, KeyLookup, PAYLOAD_MAX};
pub use crate::metadata::{CryptMode, PartitionMetadata, Trailer, META_SIZE, META_VERSION, SIG_LEN};
pub use crate::rootfs::Activation;
pub use crate::tpm::{tpm_get_random, tpm_seal, tpm_unseal, PcrPolicy, SealedBlob};

/// Size of a metadata block and of the dm-verity data blocks this tool
/// usually encounters.
pub const BLOCK_SIZE: usize = 4096;

/// Render an error and its complete cause chain as a single line.
pub fn format_error(err: &Error) -> String {
    use failure::Fail;
    let mut output = err.to_string();
    let mut prev: &dyn Fail = err;
    while let Some(next) = prev.cause() {
        output.push_str(": ");
        output.push_str(&next.to_string());
        prev = next;
    }
    output
}

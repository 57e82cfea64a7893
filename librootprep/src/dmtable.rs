use std::path::Path;

use crate::keyring::KeyLookup;
use crate::metadata::{CryptMode, PartitionMetadata};
use crate::{ErrorKind, Result};

/// Deterministic device name for the verity or integrity layer.
pub const VERINT_NAME: &str = "rootfs-verint";

/// Deterministic device name for the crypt layer.
pub const CRYPT_NAME: &str = "rootfs-crypt";

/// Policy limit on the length of a generated table parameter string. The
/// kernel has its own ceiling; staying below this keeps tables bounded.
pub const DM_TABLE_MAX: usize = 4096;

// Stands in for the key until it has been unsealed and spliced in.
const KEY_PLACEHOLDER: &str = "-";

// dm-integrity options that may name a kernel keyring key.
const KEYED_OPTIONS: [&str; 3] = ["internal_hash", "journal_crypt", "journal_mac"];

/// Table parameter strings generated from the metadata sections.
#[derive(Debug)]
pub struct ComposedTables {
    pub table_verint: String,
    pub table_crypt: String,
    pub data_bytes: u64,
}

/// One device-mapper layer of the activation stack, bottom to top.
#[derive(Debug)]
pub struct DmLayer {
    pub name: &'static str,
    pub target: &'static str,
    pub sectors: u64,
    pub params: String,
    pub readonly: bool,
}

pub fn dm_device_path(name: &str) -> String {
    format!("/dev/mapper/{}", name)
}

/// Translate the verity/integrity and crypt metadata sections into table
/// parameter strings for the declared mode. Backing devices follow the
/// stacking order: crypt sits below verity, integrity sits below crypt.
pub fn compose(
    mode: CryptMode,
    device_path: &Path,
    verint_section: &str,
    crypt_section: &str,
    keyring: &dyn KeyLookup,
) -> Result<ComposedTables> {
    let device = match device_path.to_str() {
        Some(s) => s.to_string(),
        None => fail!(ErrorKind::Internal, "device path is not valid utf-8"),
    };

    let mut table_verint = String::new();
    let mut table_crypt = String::new();
    let mut data_bytes = 0u64;

    if mode.has_verity() {
        let backing = if mode == CryptMode::CryptVerity {
            dm_device_path(CRYPT_NAME)
        } else {
            device.clone()
        };
        let (table, bytes) = verity_table(verint_section, &backing)?;
        table_verint = table;
        data_bytes = bytes;
    } else if mode.has_integrity() {
        let (table, bytes) = integrity_table(verint_section, &device, keyring)?;
        table_verint = table;
        data_bytes = bytes;
    }

    if mode.has_crypt() {
        let backing = if mode == CryptMode::CryptIntegrity {
            dm_device_path(VERINT_NAME)
        } else {
            device.clone()
        };
        let (table, bytes) = crypt_table(crypt_section, &backing, mode == CryptMode::Crypt, data_bytes)?;
        table_crypt = table;
        data_bytes = bytes;
    }

    ensure_table_size(&table_verint)?;
    ensure_table_size(&table_crypt)?;

    Ok(ComposedTables { table_verint, table_crypt, data_bytes })
}

// Section grammar:
//   VER DATA_BLKSIZE HASH_BLKSIZE NUM_DATA_BLKS HASH_START_BLK HASH_ALGO SALT ROOT_HASH [extras...]
fn verity_table(section: &str, backing: &str) -> Result<(String, u64)> {
    let fields: Vec<&str> = section.split_whitespace().collect();
    if fields.len() < 8 {
        fail!(ErrorKind::MetaFormat,
              "verity section has {} fields, expected at least 8", fields.len());
    }
    let data_blksize = parse_count(fields[1], "verity data block size")?;
    let hash_blksize = parse_count(fields[2], "verity hash block size")?;
    let num_data_blks = parse_count(fields[3], "verity data block count")?;
    let hash_start_blk = parse_number(fields[4], "verity hash start block")?;

    let mut table = format!("{} {} {} {} {} {} {} {} {} {}",
        fields[0], backing, backing, data_blksize, hash_blksize,
        num_data_blks, hash_start_blk, fields[5], fields[6], fields[7]);
    for extra in &fields[8..] {
        table.push(' ');
        table.push_str(extra);
    }

    let bytes = match data_blksize.checked_mul(num_data_blks) {
        Some(n) => n,
        None => fail!(ErrorKind::MetaFormat, "verity volume size overflows"),
    };
    Ok((table, bytes))
}

// Section grammar:
//   NUM_BLKS BLKSIZE NUM_OPTS OPT1 OPT2 ...
fn integrity_table(section: &str, backing: &str, keyring: &dyn KeyLookup) -> Result<(String, u64)> {
    let fields: Vec<&str> = section.split_whitespace().collect();
    if fields.len() < 3 {
        fail!(ErrorKind::MetaFormat,
              "integrity section has {} fields, expected at least 3", fields.len());
    }
    let num_blks = parse_count(fields[0], "integrity block count")?;
    let blksize = parse_count(fields[1], "integrity block size")?;
    let num_opts = parse_number(fields[2], "integrity option count")? as usize;
    let opts = &fields[3..];
    if opts.len() != num_opts {
        fail!(ErrorKind::MetaFormat,
              "integrity section declares {} options but carries {}", num_opts, opts.len());
    }

    // block_size is prepended as an extra option, hence num_opts + 1.
    let mut table = format!("{} 0 - J {} block_size:{} ", backing, num_opts + 1, blksize);
    for opt in opts {
        table.push_str(&process_key_option(opt, keyring)?);
        table.push(' ');
    }

    let bytes = match num_blks.checked_mul(blksize) {
        Some(n) => n,
        None => fail!(ErrorKind::MetaFormat, "integrity volume size overflows"),
    };
    Ok((table, bytes))
}

// Section grammar:
//   CIPHER              (stacked below or above a verity/integrity layer)
//   CIPHER NUM_SECTORS  (crypt only, geometry comes from the section itself)
//
// The key slot is generated as a placeholder and replaced once the key has
// been obtained.
fn crypt_table(section: &str, backing: &str, crypt_only: bool, verint_bytes: u64) -> Result<(String, u64)> {
    let fields: Vec<&str> = section.split_whitespace().collect();
    let bytes = if crypt_only {
        if fields.len() != 2 {
            fail!(ErrorKind::MetaFormat,
                  "crypt section has {} fields, expected cipher and sector count", fields.len());
        }
        let sectors = parse_count(fields[1], "crypt sector count")?;
        match sectors.checked_mul(512) {
            Some(n) => n,
            None => fail!(ErrorKind::MetaFormat, "crypt volume size overflows"),
        }
    } else {
        if fields.len() != 1 {
            fail!(ErrorKind::MetaFormat,
                  "crypt section has {} fields, expected a cipher", fields.len());
        }
        verint_bytes
    };
    let table = format!("{} {} 0 {} 0", fields[0], KEY_PLACEHOLDER, backing);
    Ok((table, bytes))
}

/// Rewrite a key-bearing option of the form `<prefix>:<algo>::<keydesc>` to
/// `<prefix>:<algo>:<hex>` by resolving `keydesc` through the keyring. Each
/// prefix is matched with its own length. Options without a key reference
/// pass through untouched.
fn process_key_option(opt: &str, keyring: &dyn KeyLookup) -> Result<String> {
    for prefix in &KEYED_OPTIONS {
        if opt.len() <= prefix.len()
            || !opt.starts_with(prefix)
            || opt.as_bytes()[prefix.len()] != b':'
        {
            continue;
        }
        let value = &opt[prefix.len() + 1..];
        let idx = match value.find("::") {
            Some(idx) => idx,
            None => break,
        };
        let algo = &value[..idx];
        let keydesc = &value[idx + 2..];
        if algo.is_empty() || keydesc.is_empty() {
            fail!(ErrorKind::MetaFormat, "malformed keyed option '{}'", opt);
        }
        let payload = keyring.get_key(keydesc)?;
        return Ok(format!("{}:{}:{}", prefix, algo, hex::encode(&payload)));
    }
    Ok(opt.to_string())
}

/// Replace the key placeholder in a generated crypt table with the hex
/// encoded key.
pub fn splice_key(table: &mut String, key_hex: &str) -> Result<()> {
    if table.is_empty() {
        fail!(ErrorKind::Internal, "no crypt table to splice a key into");
    }
    let fields: Vec<&str> = table.split(' ').collect();
    if fields.len() != 5 || fields[1] != KEY_PLACEHOLDER {
        fail!(ErrorKind::Internal, "crypt table is not awaiting a key");
    }
    let spliced = format!("{} {} {} {} {}", fields[0], key_hex, fields[2], fields[3], fields[4]);
    ensure_table_size(&spliced)?;
    *table = spliced;
    Ok(())
}

/// Order the dm layers for activation, bottom to top, with sector counts
/// derived from the volume size.
pub fn activation_plan(meta: &PartitionMetadata) -> Result<Vec<DmLayer>> {
    plan_layers(
        meta.mode(),
        meta.dm_table_verint(),
        meta.dm_table_crypt(),
        meta.dm_volume_data_bytes(),
        meta.is_read_only(),
    )
}

fn plan_layers(
    mode: CryptMode,
    table_verint: &str,
    table_crypt: &str,
    data_bytes: u64,
    read_only: bool,
) -> Result<Vec<DmLayer>> {
    if mode == CryptMode::Plain {
        return Ok(Vec::new());
    }
    let sectors = volume_sectors(data_bytes)?;

    let verint = || -> DmLayer {
        let target = if mode.has_verity() { "verity" } else { "integrity" };
        DmLayer {
            name: VERINT_NAME,
            target,
            sectors,
            params: table_verint.to_string(),
            // dm-verity devices are read-only by nature.
            readonly: mode.has_verity() || read_only,
        }
    };
    let crypt = || -> Result<DmLayer> {
        let fields: Vec<&str> = table_crypt.split(' ').collect();
        if fields.len() != 5 || fields[1] == KEY_PLACEHOLDER {
            fail!(ErrorKind::Internal, "crypt table activated without a key");
        }
        Ok(DmLayer {
            name: CRYPT_NAME,
            target: "crypt",
            sectors,
            params: table_crypt.to_string(),
            readonly: read_only,
        })
    };

    let plan = match mode {
        CryptMode::Plain => unreachable!(),
        CryptMode::Verity | CryptMode::Integrity => vec![verint()],
        CryptMode::Crypt => vec![crypt()?],
        CryptMode::CryptIntegrity => vec![verint(), crypt()?],
        CryptMode::CryptVerity => vec![crypt()?, verint()],
    };
    Ok(plan)
}

fn volume_sectors(data_bytes: u64) -> Result<u64> {
    if data_bytes == 0 || data_bytes % 512 != 0 {
        fail!(ErrorKind::MetaFormat,
              "volume size {} is not a positive multiple of the sector size", data_bytes);
    }
    Ok(data_bytes / 512)
}

fn ensure_table_size(table: &str) -> Result<()> {
    if table.len() >= DM_TABLE_MAX {
        fail!(ErrorKind::DmTableOverflow,
              "table length {} exceeds limit {}", table.len(), DM_TABLE_MAX);
    }
    Ok(())
}

fn parse_number(field: &str, what: &str) -> Result<u64> {
    match field.parse::<u64>() {
        Ok(n) => Ok(n),
        Err(_) => fail!(ErrorKind::MetaFormat, "bad {} '{}'", what, field),
    }
}

fn parse_count(field: &str, what: &str) -> Result<u64> {
    let n = parse_number(field, what)?;
    if n == 0 {
        fail!(ErrorKind::MetaFormat, "{} must be nonzero", what);
    }
    Ok(n)
}

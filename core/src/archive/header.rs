//! The 512-byte ustar header block.

use crate::error::{ArchiveError, Result};

/// Size of every header and content block.
pub const BLOCK_SIZE: usize = 512;

/// Longest entry name the classic `name` field holds.
pub const NAME_LEN: usize = 100;

const NAME: (usize, usize) = (0, 100);
const MODE: (usize, usize) = (100, 108);
const UID: (usize, usize) = (108, 116);
const GID: (usize, usize) = (116, 124);
const SIZE: (usize, usize) = (124, 136);
const MTIME: (usize, usize) = (136, 148);
const CHECKSUM: (usize, usize) = (148, 156);
const TYPEFLAG: usize = 156;
const MAGIC: (usize, usize) = (257, 263);
const VERSION: (usize, usize) = (263, 265);
const PREFIX: (usize, usize) = (345, 500);

/// Largest size an 11-digit octal field can carry.
const MAX_SIZE: u64 = 0o77777777777;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryType {
    /// `'0'`, or NUL from pre-POSIX writers.
    Regular,
    /// `'5'`.
    Directory,
    /// Links, devices, FIFOs and vendor extensions. Carried but not extracted.
    Other(u8),
}

impl EntryType {
    fn from_flag(flag: u8) -> Self {
        match flag {
            b'0' | 0 => EntryType::Regular,
            b'5' => EntryType::Directory,
            other => EntryType::Other(other),
        }
    }

    fn flag(self) -> u8 {
        match self {
            EntryType::Regular => b'0',
            EntryType::Directory => b'5',
            EntryType::Other(flag) => flag,
        }
    }
}

/// The fields of a header this crate reads and writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TarHeader {
    pub name: String,
    /// Permission bits only.
    pub mode: u32,
    pub size: u64,
    /// Seconds since the Unix epoch.
    pub mtime: u64,
    pub entry_type: EntryType,
}

impl TarHeader {
    pub fn regular(name: impl Into<String>, size: u64, mode: u32, mtime: u64) -> Self {
        Self {
            name: name.into(),
            mode,
            size,
            mtime,
            entry_type: EntryType::Regular,
        }
    }

    /// Encode as a ustar block with a valid checksum. uid and gid are zero.
    pub fn to_block(&self) -> Result<[u8; BLOCK_SIZE]> {
        let name = self.name.as_bytes();
        if name.len() > NAME_LEN {
            return Err(ArchiveError::NameTooLong(self.name.clone()).into());
        }
        if name.is_empty() {
            return Err(ArchiveError::InvalidHeader {
                field: "name",
                reason: "entry name is empty".into(),
            }
            .into());
        }
        if self.size > MAX_SIZE {
            return Err(ArchiveError::InvalidHeader {
                field: "size",
                reason: format!("{} bytes does not fit in 11 octal digits", self.size),
            }
            .into());
        }

        let mut block = [0u8; BLOCK_SIZE];
        block[NAME.0..NAME.0 + name.len()].copy_from_slice(name);
        write_octal(&mut block[MODE.0..MODE.1], u64::from(self.mode & 0o7777));
        write_octal(&mut block[UID.0..UID.1], 0);
        write_octal(&mut block[GID.0..GID.1], 0);
        write_octal(&mut block[SIZE.0..SIZE.1], self.size);
        write_octal(&mut block[MTIME.0..MTIME.1], self.mtime.min(MAX_SIZE));
        block[TYPEFLAG] = self.entry_type.flag();
        block[MAGIC.0..MAGIC.1].copy_from_slice(b"ustar\0");
        block[VERSION.0..VERSION.1].copy_from_slice(b"00");

        let (sum, _) = checksums(&block);
        let field = format!("{sum:06o}\0 ");
        block[CHECKSUM.0..CHECKSUM.1].copy_from_slice(field.as_bytes());
        Ok(block)
    }

    /// Decode a header block. The checksum is verified before any other
    /// field is looked at.
    pub fn from_block(block: &[u8; BLOCK_SIZE]) -> Result<Self> {
        verify_checksum(block)?;

        let mut name = field_str(&block[NAME.0..NAME.1], "name")?;
        // GNU headers reuse the prefix area for other fields.
        if block[MAGIC.0..MAGIC.1] == *b"ustar\0" {
            let prefix = field_str(&block[PREFIX.0..PREFIX.1], "prefix")?;
            if !prefix.is_empty() {
                name = format!("{}/{}", prefix.trim_end_matches('/'), name);
            }
        }
        Ok(Self {
            name,
            mode: parse_octal(&block[MODE.0..MODE.1], "mode")? as u32,
            size: parse_octal(&block[SIZE.0..SIZE.1], "size")?,
            mtime: parse_octal(&block[MTIME.0..MTIME.1], "mtime")?,
            entry_type: EntryType::from_flag(block[TYPEFLAG]),
        })
    }
}

/// True for the all-zero blocks that end an archive.
pub fn is_zero_block(block: &[u8; BLOCK_SIZE]) -> bool {
    block.iter().all(|&b| b == 0)
}

/// Bytes of zero padding after `size` bytes of content.
pub fn padding(size: u64) -> usize {
    let rem = (size % BLOCK_SIZE as u64) as usize;
    if rem == 0 {
        0
    } else {
        BLOCK_SIZE - rem
    }
}

/// Unsigned and signed byte sums, counting the checksum field as spaces.
fn checksums(block: &[u8; BLOCK_SIZE]) -> (u32, i64) {
    let mut unsigned = 0u32;
    let mut signed = 0i64;
    for (i, &b) in block.iter().enumerate() {
        let b = if (CHECKSUM.0..CHECKSUM.1).contains(&i) {
            b' '
        } else {
            b
        };
        unsigned += u32::from(b);
        signed += i64::from(b as i8);
    }
    (unsigned, signed)
}

fn verify_checksum(block: &[u8; BLOCK_SIZE]) -> Result<()> {
    let (unsigned, signed) = checksums(block);
    let raw = &block[CHECKSUM.0..CHECKSUM.1];
    let mismatch = || {
        let end = block[NAME.0..NAME.1]
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(NAME_LEN);
        ArchiveError::BadChecksum {
            name: String::from_utf8_lossy(&block[..end]).into_owned(),
            stored: String::from_utf8_lossy(raw).into_owned(),
            computed: unsigned,
        }
    };
    let stored = parse_checksum_field(raw).ok_or_else(mismatch)?;
    if i64::from(stored) == i64::from(unsigned) || i64::from(stored) == signed {
        Ok(())
    } else {
        Err(mismatch().into())
    }
}

/// Six octal digits, NUL, space (what `to_block` writes), or seven octal
/// digits and NUL (GNU tar and the `tar` crate). No other layout is read,
/// so a single flipped bit in the field cannot parse to the same value.
fn parse_checksum_field(raw: &[u8]) -> Option<u32> {
    let digits = match raw {
        [digits @ .., 0, b' '] if digits.len() == 6 => digits,
        [digits @ .., 0] if digits.len() == 7 => digits,
        _ => return None,
    };
    if !digits.iter().all(|b| (b'0'..=b'7').contains(b)) {
        return None;
    }
    let text = std::str::from_utf8(digits).ok()?;
    u32::from_str_radix(text, 8).ok()
}

/// Zero-padded octal digits filling all but the last byte, then NUL.
fn write_octal(field: &mut [u8], value: u64) {
    let digits = field.len() - 1;
    let text = format!("{value:0digits$o}");
    field[..digits].copy_from_slice(text.as_bytes());
    field[digits] = 0;
}

/// Octal numeric field, NUL- or space-terminated. An all-NUL field is zero.
fn parse_octal(raw: &[u8], field: &'static str) -> Result<u64> {
    let invalid = |reason: String| ArchiveError::InvalidHeader { field, reason };
    let trimmed: &[u8] = {
        let start = raw.iter().position(|&b| b != b' ').unwrap_or(raw.len());
        let end = raw[start..]
            .iter()
            .position(|&b| b == 0 || b == b' ')
            .map_or(raw.len(), |p| start + p);
        &raw[start..end]
    };
    if trimmed.is_empty() {
        return Ok(0);
    }
    if !trimmed.iter().all(|b| (b'0'..=b'7').contains(b)) {
        return Err(invalid(format!("{:?} is not octal", String::from_utf8_lossy(raw))).into());
    }
    let text = std::str::from_utf8(trimmed).map_err(|e| invalid(e.to_string()))?;
    Ok(u64::from_str_radix(text, 8).map_err(|e| invalid(e.to_string()))?)
}

fn field_str(raw: &[u8], field: &'static str) -> Result<String> {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8(raw[..end].to_vec()).map_err(|_| {
        ArchiveError::InvalidHeader {
            field,
            reason: "not valid UTF-8".into(),
        }
        .into()
    })
}

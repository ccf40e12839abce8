//! Directory listing encoding.
//!
//! # Entry Format
//!
//! A listing payload is a concatenation of fixed-width 80-byte rows:
//!
//! - 56 bytes: entry name, NUL-padded
//! - 11 bytes: permission string (`d`/`l`/`-` followed by three rwx triplets)
//! - 5 bytes: padding (zero)
//! - 8 bytes: size in bytes (little-endian u64)
//!
//! Names longer than 55 bytes are truncated at a UTF-8 character boundary so
//! the stored name is always valid UTF-8 with a terminating NUL.

use crate::error::{ProtocolError, Result};

/// Width of the name field, including the terminating NUL.
pub const NAME_WIDTH: usize = 56;

/// Width of the permission string field.
pub const PERMS_WIDTH: usize = 11;

/// Total fixed width of one listing row.
pub const ENTRY_SIZE: usize = 80;

/// One directory entry in a listing payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Entry name (file or directory basename).
    pub name: String,
    /// Permission string, e.g. `drwxr-xr-x`.
    pub perms: String,
    /// Size in bytes.
    pub size: u64,
}

impl FileEntry {
    /// Create a new entry.
    pub fn new(name: impl Into<String>, perms: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            perms: perms.into(),
            size,
        }
    }
}

/// Truncate a string to at most `max` bytes on a character boundary.
fn truncate_utf8(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Encode entries into a listing payload.
pub fn encode_entries(entries: &[FileEntry]) -> Vec<u8> {
    let mut output = Vec::with_capacity(entries.len() * ENTRY_SIZE);

    for entry in entries {
        let mut row = [0u8; ENTRY_SIZE];

        let name = truncate_utf8(&entry.name, NAME_WIDTH - 1);
        row[..name.len()].copy_from_slice(name.as_bytes());

        let perms = truncate_utf8(&entry.perms, PERMS_WIDTH);
        row[NAME_WIDTH..NAME_WIDTH + perms.len()].copy_from_slice(perms.as_bytes());

        row[ENTRY_SIZE - 8..].copy_from_slice(&entry.size.to_le_bytes());

        output.extend_from_slice(&row);
    }

    output
}

/// Decode a listing payload into entries.
///
/// The payload length must be an exact multiple of [`ENTRY_SIZE`].
pub fn decode_entries(data: &[u8]) -> Result<Vec<FileEntry>> {
    if data.len() % ENTRY_SIZE != 0 {
        return Err(ProtocolError::MalformedPayload(format!(
            "listing payload length {} is not a multiple of {}",
            data.len(),
            ENTRY_SIZE
        )));
    }

    let mut entries = Vec::with_capacity(data.len() / ENTRY_SIZE);

    for row in data.chunks_exact(ENTRY_SIZE) {
        let name_end = row[..NAME_WIDTH]
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(NAME_WIDTH);
        let name = std::str::from_utf8(&row[..name_end])
            .map_err(|e| ProtocolError::MalformedPayload(format!("entry name not UTF-8: {}", e)))?
            .to_string();

        let perms_field = &row[NAME_WIDTH..NAME_WIDTH + PERMS_WIDTH];
        let perms_end = perms_field
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(PERMS_WIDTH);
        let perms = std::str::from_utf8(&perms_field[..perms_end])
            .map_err(|e| {
                ProtocolError::MalformedPayload(format!("permission string not UTF-8: {}", e))
            })?
            .to_string();

        let size = u64::from_le_bytes(row[ENTRY_SIZE - 8..].try_into().unwrap());

        entries.push(FileEntry { name, perms, size });
    }

    Ok(entries)
}

//! Reading packet documents from disk.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::{debug, instrument};

use crate::core::canonical::sha256_hex;
use crate::core::packet::{PacketFormatError, TaskPacket, parse_packet};

/// A packet document as read, with its parse result.
#[derive(Debug, Clone)]
pub struct LoadedPacket {
    pub text: String,
    /// SHA-256 of the raw document bytes.
    pub sha256: String,
    pub parsed: Result<TaskPacket, PacketFormatError>,
}

/// Read and parse a packet file. Unreadable files are errors; malformed
/// documents are returned in `parsed`.
#[instrument(skip_all, fields(path = %path.display()))]
pub fn load_packet(path: &Path) -> Result<LoadedPacket> {
    let text = fs::read_to_string(path).with_context(|| format!("read packet {}", path.display()))?;
    let sha256 = sha256_hex(text.as_bytes());
    let parsed = parse_packet(&text);
    debug!(sha256 = %sha256, valid = parsed.is_ok(), "packet loaded");
    Ok(LoadedPacket {
        text,
        sha256,
        parsed,
    })
}

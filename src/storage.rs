//! Host-side image file handling.
//!
//! This module creates and removes copy destinations and reads image
//! headers to discover backing chains.
//!
//! # QCOW2 Header Layout
//!
//! ```text
//! offset  size  field
//!      0     4  magic "QFI\xfb"
//!      4     4  version (2 or 3)
//!      8     8  backing file name offset
//!     16     4  backing file name length
//!    100     4  header length (version 3 only; 72 for version 2)
//! ```
//!
//! Header extensions follow the header; the backing format extension
//! carries the backing image's format name.

use crate::error::{Error, Result};
use crate::vm::{ChainNode, ImageFormat};
use std::fs::OpenOptions;
use std::io::{ErrorKind, Read};
use std::path::{Component, Path, PathBuf};

/// QCOW2 magic bytes.
pub const QCOW2_MAGIC: [u8; 4] = *b"QFI\xfb";

/// Header extension carrying the backing image format.
pub(crate) const EXT_BACKING_FORMAT: u32 = 0xE279_2ACA;

/// Header length of a version 2 image.
const QCOW2_V2_HEADER_LEN: usize = 72;

/// Bytes read from the start of an image when probing.
const PROBE_LEN: u64 = 64 * 1024;

/// Longest backing chain followed before assuming a loop.
const MAX_CHAIN_DEPTH: usize = 200;

/// Backing information read from an image header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackingInfo {
    /// Backing file name as recorded in the header.
    pub file: String,
    /// Backing format, if recorded.
    pub format: Option<ImageFormat>,
}

/// Create an empty copy destination.
///
/// Returns true if the file was created, false if it already existed.
pub fn create_image_file(path: &Path) -> Result<bool> {
    match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(_) => {
            tracing::debug!(path = %path.display(), "created image file");
            Ok(true)
        }
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(Error::Io(e)),
    }
}

/// Remove an image file; a missing file is not an error.
pub fn remove_image_file(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            tracing::debug!(path = %path.display(), "removed image file");
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::Io(e)),
    }
}

fn read_head(path: &Path) -> Result<Vec<u8>> {
    let file = std::fs::File::open(path)?;
    let mut buf = Vec::new();
    file.take(PROBE_LEN).read_to_end(&mut buf)?;
    Ok(buf)
}

fn be_u32(buf: &[u8], offset: usize) -> Option<u32> {
    let bytes = buf.get(offset..offset + 4)?;
    Some(u32::from_be_bytes(bytes.try_into().ok()?))
}

fn be_u64(buf: &[u8], offset: usize) -> Option<u64> {
    let bytes = buf.get(offset..offset + 8)?;
    Some(u64::from_be_bytes(bytes.try_into().ok()?))
}

/// Detect the format of an image from its header.
pub fn probe_format(path: &Path) -> Result<ImageFormat> {
    let head = read_head(path)?;
    if head.starts_with(&QCOW2_MAGIC) {
        Ok(ImageFormat::Qcow2)
    } else {
        Ok(ImageFormat::Raw)
    }
}

/// Parse backing information from the start of a QCOW2 image.
pub fn parse_backing(head: &[u8]) -> Result<Option<BackingInfo>> {
    if !head.starts_with(&QCOW2_MAGIC) {
        return Ok(None);
    }
    let malformed = || Error::invalid("truncated qcow2 header");

    let version = be_u32(head, 4).ok_or_else(malformed)?;
    let offset = be_u64(head, 8).ok_or_else(malformed)? as usize;
    let size = be_u32(head, 16).ok_or_else(malformed)? as usize;
    if offset == 0 || size == 0 {
        return Ok(None);
    }

    let end = offset.checked_add(size).ok_or_else(malformed)?;
    let name = head.get(offset..end).ok_or_else(malformed)?;
    let file = String::from_utf8(name.to_vec())
        .map_err(|_| Error::invalid("backing file name is not valid UTF-8"))?;

    let header_len = if version >= 3 {
        be_u32(head, 100).ok_or_else(malformed)? as usize
    } else {
        QCOW2_V2_HEADER_LEN
    };

    let mut format = None;
    let mut pos = header_len;
    while pos + 8 <= offset {
        let (Some(kind), Some(len)) = (be_u32(head, pos), be_u32(head, pos + 4)) else {
            break;
        };
        if kind == 0 {
            break;
        }
        let len = len as usize;
        if kind == EXT_BACKING_FORMAT {
            if let Some(data) = head.get(pos + 8..pos + 8 + len) {
                format = std::str::from_utf8(data).ok().and_then(|s| s.parse().ok());
            }
        }
        pos += 8 + len.div_ceil(8) * 8;
    }

    Ok(Some(BackingInfo { file, format }))
}

/// Read backing information from an image file.
pub fn read_backing(path: &Path) -> Result<Option<BackingInfo>> {
    parse_backing(&read_head(path)?)
}

/// Follow backing links starting at `path`, top image first.
///
/// Relative backing names resolve against the directory of the image
/// that references them. All returned nodes are read-only.
pub fn detect_chain(path: &Path, format: Option<ImageFormat>) -> Result<Vec<ChainNode>> {
    let mut chain = Vec::new();
    let mut current = path.to_path_buf();
    let mut current_format = format;

    loop {
        if chain.len() >= MAX_CHAIN_DEPTH {
            return Err(Error::invalid(format!(
                "backing chain of '{}' is too deep or loops",
                path.display()
            )));
        }
        let fmt = match current_format {
            Some(fmt) => fmt,
            None => probe_format(&current)?,
        };
        let backing = if fmt.supports_backing() {
            read_backing(&current)?
        } else {
            None
        };
        chain.push(ChainNode::new(current.clone(), fmt));

        let Some(backing) = backing else {
            break;
        };
        let next = PathBuf::from(&backing.file);
        current = if next.is_absolute() {
            next
        } else {
            current
                .parent()
                .map(|dir| dir.join(&next))
                .unwrap_or(next)
        };
        current_format = backing.format;
    }

    tracing::debug!(image = %path.display(), depth = chain.len(), "detected backing chain");
    Ok(chain)
}

/// Path of `target` relative to the directory containing `image`.
///
/// Both paths must be absolute. Used when recording relative backing
/// file names.
pub fn relative_backing_path(image: &Path, target: &Path) -> Option<String> {
    if !image.is_absolute() || !target.is_absolute() {
        return None;
    }
    let from: Vec<Component> = image.parent()?.components().collect();
    let to: Vec<Component> = target.components().collect();
    let common = from.iter().zip(&to).take_while(|(a, b)| a == b).count();

    let mut rel = PathBuf::new();
    for _ in common..from.len() {
        rel.push("..");
    }
    for component in &to[common..] {
        rel.push(component.as_os_str());
    }
    rel.to_str().map(str::to_string)
}

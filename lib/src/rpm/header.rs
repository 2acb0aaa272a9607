//! Parsing of the binary RPM header structure.
//!
//! A header is a magic and version, a count of index entries, the size of
//! the data store, the index entries themselves (tag, type, offset, count;
//! all big endian) and finally the data store they point into.
//!
//! Values are decoded lazily on access; a [`Header`] keeps its serialized
//! form so it can be recorded verbatim and re-parsed later.

use std::collections::HashMap;
use std::fmt;
use std::io::Read;

use crate::nevra::Nevra;
use crate::{Error, Result};

/// The magic and version prefix of a header structure.
pub const HEADER_MAGIC: [u8; 4] = [0x8e, 0xad, 0xe8, 0x01];
/// Size of the fixed preamble: magic, 4 reserved bytes, entry count and
/// data size.
pub const PREAMBLE_SIZE: usize = 16;
/// Size of one index entry.
pub const ENTRY_SIZE: usize = 16;
/// Upper bound on the number of index entries we accept.
const MAX_ENTRIES: u32 = 0x10000;
/// Upper bound on the data store size we accept.
const MAX_DATA: u32 = 256 * 1024 * 1024;

/// Header tag numbers used by this crate.
#[allow(missing_docs)]
pub mod tag {
    pub const NAME: u32 = 1000;
    pub const VERSION: u32 = 1001;
    pub const RELEASE: u32 = 1002;
    pub const EPOCH: u32 = 1003;
    pub const BUILDTIME: u32 = 1006;
    pub const ARCH: u32 = 1022;
    pub const OLDFILENAMES: u32 = 1027;
    pub const FILESIZES: u32 = 1028;
    pub const FILESTATES: u32 = 1029;
    pub const FILEMODES: u32 = 1030;
    pub const FILEUSERNAME: u32 = 1039;
    pub const FILEGROUPNAME: u32 = 1040;
    pub const SOURCERPM: u32 = 1044;
    pub const ARCHIVESIZE: u32 = 1046;
    pub const CHANGELOGTIME: u32 = 1080;
    pub const DIRINDEXES: u32 = 1116;
    pub const BASENAMES: u32 = 1117;
    pub const DIRNAMES: u32 = 1118;
    pub const PAYLOADFORMAT: u32 = 1124;
    pub const PAYLOADCOMPRESSOR: u32 = 1125;
    pub const LONGARCHIVESIZE: u32 = 271;
    pub const LONGFILESIZES: u32 = 5008;
    pub const FILECAPS: u32 = 5010;
}

/// Header data types.
#[allow(missing_docs)]
pub mod kind {
    pub const NULL: u32 = 0;
    pub const CHAR: u32 = 1;
    pub const INT8: u32 = 2;
    pub const INT16: u32 = 3;
    pub const INT32: u32 = 4;
    pub const INT64: u32 = 5;
    pub const STRING: u32 = 6;
    pub const BIN: u32 = 7;
    pub const STRING_ARRAY: u32 = 8;
    pub const I18NSTRING: u32 = 9;
}

/// Value of `FILESTATES` for a file that was not installed.
pub const FILESTATE_NOTINSTALLED: u64 = 2;

#[derive(Debug, Clone, Copy)]
struct IndexEntry {
    kind: u32,
    offset: usize,
    count: usize,
}

/// A parsed RPM header.
#[derive(Clone)]
pub struct Header {
    raw: Vec<u8>,
    entries: HashMap<u32, IndexEntry>,
}

impl fmt::Debug for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Header")
            .field("entries", &self.entries.len())
            .field("size", &self.raw.len())
            .finish()
    }
}

fn malformed(msg: impl Into<String>) -> Error {
    Error::MalformedHeader(msg.into())
}

fn be32(b: &[u8]) -> u32 {
    u32::from_be_bytes([b[0], b[1], b[2], b[3]])
}

/// Validate the 16 byte preamble, returning the entry count and data size.
fn parse_preamble(b: &[u8; PREAMBLE_SIZE]) -> Result<(u32, u32)> {
    if b[0..4] != HEADER_MAGIC {
        return Err(malformed(format!("Invalid header magic {:02x?}", &b[0..4])));
    }
    let nindex = be32(&b[8..12]);
    let hsize = be32(&b[12..16]);
    if nindex == 0 || nindex > MAX_ENTRIES {
        return Err(malformed(format!("Invalid index entry count {nindex}")));
    }
    if hsize > MAX_DATA {
        return Err(malformed(format!("Invalid data size {hsize}")));
    }
    Ok((nindex, hsize))
}

impl Header {
    /// Parse a complete serialized header, starting with its magic.
    pub fn parse(raw: Vec<u8>) -> Result<Self> {
        let preamble: &[u8; PREAMBLE_SIZE] = raw
            .get(..PREAMBLE_SIZE)
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| malformed("Truncated header preamble"))?;
        let (nindex, hsize) = parse_preamble(preamble)?;
        let nindex = nindex as usize;
        let store_start = PREAMBLE_SIZE + nindex * ENTRY_SIZE;
        let expected = store_start + hsize as usize;
        if raw.len() != expected {
            return Err(malformed(format!(
                "Header size mismatch: expected {expected} bytes, found {}",
                raw.len()
            )));
        }
        let mut entries = HashMap::with_capacity(nindex);
        for chunk in raw[PREAMBLE_SIZE..store_start].chunks_exact(ENTRY_SIZE) {
            let tag = be32(&chunk[0..4]);
            let kind = be32(&chunk[4..8]);
            let offset = be32(&chunk[8..12]);
            let count = be32(&chunk[12..16]);
            if offset > hsize {
                return Err(malformed(format!(
                    "Tag {tag}: offset {offset} exceeds data size {hsize}"
                )));
            }
            if kind > kind::I18NSTRING {
                return Err(malformed(format!("Tag {tag}: invalid type {kind}")));
            }
            entries.entry(tag).or_insert(IndexEntry {
                kind,
                offset: store_start + offset as usize,
                count: count as usize,
            });
        }
        Ok(Self { raw, entries })
    }

    /// Read one header structure from a stream positioned at its magic.
    pub fn read_from(src: &mut impl Read) -> Result<Self> {
        let mut preamble = [0u8; PREAMBLE_SIZE];
        src.read_exact(&mut preamble)
            .map_err(|e| malformed(format!("Reading header preamble: {e}")))?;
        let (nindex, hsize) = parse_preamble(&preamble)?;
        let rest = nindex as u64 * ENTRY_SIZE as u64 + hsize as u64;
        let mut raw = preamble.to_vec();
        src.take(rest)
            .read_to_end(&mut raw)
            .map_err(|e| malformed(format!("Reading header: {e}")))?;
        if raw.len() as u64 != PREAMBLE_SIZE as u64 + rest {
            return Err(malformed("Truncated header"));
        }
        Self::parse(raw)
    }

    /// The serialized header.
    pub fn as_bytes(&self) -> &[u8] {
        &self.raw
    }

    /// Whether the tag is present.
    pub fn has(&self, tag: u32) -> bool {
        self.entries.contains_key(&tag)
    }

    /// Read `count` NUL terminated strings starting at `offset`.
    fn strings_at(&self, tag: u32, e: &IndexEntry) -> Result<Vec<&str>> {
        let mut r = Vec::with_capacity(e.count.min(4096));
        let mut pos = e.offset;
        for _ in 0..e.count {
            let rest = self
                .raw
                .get(pos..)
                .ok_or_else(|| malformed(format!("Tag {tag}: truncated string data")))?;
            let len = rest
                .iter()
                .position(|&b| b == 0)
                .ok_or_else(|| malformed(format!("Tag {tag}: unterminated string")))?;
            let s = std::str::from_utf8(&rest[..len])
                .map_err(|_| malformed(format!("Tag {tag}: invalid UTF-8")))?;
            r.push(s);
            pos += len + 1;
        }
        Ok(r)
    }

    /// Get a single string value.  For internationalized strings, the
    /// first (default locale) value is returned.
    pub fn get_string(&self, tag: u32) -> Result<Option<&str>> {
        let Some(e) = self.entries.get(&tag) else {
            return Ok(None);
        };
        match e.kind {
            kind::STRING | kind::I18NSTRING | kind::STRING_ARRAY if e.count > 0 => {
                let e = IndexEntry { count: 1, ..*e };
                Ok(self.strings_at(tag, &e)?.pop())
            }
            kind::STRING | kind::I18NSTRING | kind::STRING_ARRAY => Ok(None),
            o => Err(malformed(format!("Tag {tag}: expected string, found type {o}"))),
        }
    }

    /// Get a string array value.
    pub fn get_string_array(&self, tag: u32) -> Result<Option<Vec<&str>>> {
        let Some(e) = self.entries.get(&tag) else {
            return Ok(None);
        };
        match e.kind {
            kind::STRING_ARRAY | kind::I18NSTRING => self.strings_at(tag, e).map(Some),
            kind::STRING => {
                let e = IndexEntry { count: 1, ..*e };
                self.strings_at(tag, &e).map(Some)
            }
            o => Err(malformed(format!(
                "Tag {tag}: expected string array, found type {o}"
            ))),
        }
    }

    /// Get an integer array value of any width, widened to `u64`.
    pub fn get_u64_array(&self, tag: u32) -> Result<Option<Vec<u64>>> {
        let Some(e) = self.entries.get(&tag) else {
            return Ok(None);
        };
        let width = match e.kind {
            kind::CHAR | kind::INT8 => 1,
            kind::INT16 => 2,
            kind::INT32 => 4,
            kind::INT64 => 8,
            o => {
                return Err(malformed(format!(
                    "Tag {tag}: expected integer, found type {o}"
                )))
            }
        };
        let end = e
            .count
            .checked_mul(width)
            .and_then(|n| n.checked_add(e.offset))
            .filter(|&end| end <= self.raw.len())
            .ok_or_else(|| malformed(format!("Tag {tag}: truncated integer data")))?;
        let r = self.raw[e.offset..end]
            .chunks_exact(width)
            .map(|c| c.iter().fold(0u64, |acc, &b| (acc << 8) | b as u64))
            .collect();
        Ok(Some(r))
    }

    /// Get the first value of an integer tag.
    pub fn get_u64(&self, tag: u32) -> Result<Option<u64>> {
        Ok(self
            .get_u64_array(tag)?
            .and_then(|v| v.first().copied()))
    }

    fn require_string(&self, tag: u32, name: &str) -> Result<&str> {
        self.get_string(tag)?
            .ok_or_else(|| malformed(format!("Missing required tag {name}")))
    }

    /// The package identity.
    pub fn nevra(&self) -> Result<Nevra> {
        Ok(Nevra::new(
            self.require_string(tag::NAME, "NAME")?,
            self.get_u64(tag::EPOCH)?.unwrap_or_default(),
            self.require_string(tag::VERSION, "VERSION")?,
            self.require_string(tag::RELEASE, "RELEASE")?,
            self.require_string(tag::ARCH, "ARCH")?,
        ))
    }

    /// The full path of every file in the package, in header index order
    /// and as recorded (i.e. not normalized).  Uses the compressed
    /// `DIRINDEXES`/`DIRNAMES`/`BASENAMES` form when present, otherwise
    /// the legacy `OLDFILENAMES`.
    pub fn file_paths(&self) -> Result<Vec<String>> {
        if let Some(basenames) = self.get_string_array(tag::BASENAMES)? {
            let dirnames = self
                .get_string_array(tag::DIRNAMES)?
                .ok_or_else(|| malformed("BASENAMES without DIRNAMES"))?;
            let dirindexes = self
                .get_u64_array(tag::DIRINDEXES)?
                .ok_or_else(|| malformed("BASENAMES without DIRINDEXES"))?;
            if dirindexes.len() != basenames.len() {
                return Err(malformed(format!(
                    "DIRINDEXES has {} entries, BASENAMES has {}",
                    dirindexes.len(),
                    basenames.len()
                )));
            }
            basenames
                .iter()
                .zip(dirindexes)
                .map(|(base, idx)| {
                    let dir = dirnames.get(idx as usize).ok_or_else(|| {
                        malformed(format!(
                            "Directory index {idx} out of range ({} dirnames)",
                            dirnames.len()
                        ))
                    })?;
                    Ok(format!("{dir}{base}"))
                })
                .collect()
        } else if let Some(names) = self.get_string_array(tag::OLDFILENAMES)? {
            Ok(names.into_iter().map(ToOwned::to_owned).collect())
        } else {
            Ok(Vec::new())
        }
    }
}

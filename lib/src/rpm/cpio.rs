//! Streaming reader for the cpio payload of an RPM.
//!
//! Only the SVR4 "newc" (`070701`) and "crc" (`070702`) formats are
//! accepted.  Each header is 110 bytes of ASCII hex fields followed by the
//! name; both the name and the file data are padded to 4 byte alignment.
//!
//! Multiply linked files are stored as several members sharing an inode
//! number, with the content attached to just one of them (the last, as
//! written by rpm).  The reader holds back the empty members until the
//! member with data appears, then emits that one as a regular file and the
//! others as [`EntryKind::Hardlink`] references to it.

use std::collections::{HashMap, VecDeque};
use std::io::{self, Read};

use crate::relpath;
use crate::{Error, Result};

const HEADER_SIZE: usize = 110;
const MAGIC_NEWC: &[u8] = b"070701";
const MAGIC_CRC: &[u8] = b"070702";
const TRAILER: &str = "TRAILER!!!";
/// Maximum length of a member name or symlink target.
pub const MAX_PATH: usize = 4096;

pub(crate) const S_IFMT: u32 = 0o170000;
pub(crate) const S_IFDIR: u32 = 0o040000;
pub(crate) const S_IFREG: u32 = 0o100000;
pub(crate) const S_IFLNK: u32 = 0o120000;

/// The type of an archive member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
    /// A directory
    Directory,
    /// A regular file; its content follows the entry.
    Regular,
    /// A symbolic link with its literal target.
    Symlink(String),
    /// An additional name for the regular file at the given path.
    Hardlink(String),
    /// Anything else (device, fifo, socket); carries the `S_IFMT` bits.
    Other(u32),
}

/// One member of a package payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    /// Normalized relative path; empty for the root.
    pub path: String,
    /// File type
    pub kind: EntryKind,
    /// Permission bits (`mode & 0o7777`)
    pub mode: u32,
    /// Owner as recorded in the archive
    pub uid: u32,
    /// Group as recorded in the archive
    pub gid: u32,
    /// Size of the content for regular files, zero otherwise.
    pub size: u64,
    /// Modification time
    pub mtime: u64,
}

impl ArchiveEntry {
    /// The full mode including the file type bits.
    pub fn full_mode(&self) -> u32 {
        let ifmt = match self.kind {
            EntryKind::Directory => S_IFDIR,
            EntryKind::Regular | EntryKind::Hardlink(_) => S_IFREG,
            EntryKind::Symlink(_) => S_IFLNK,
            EntryKind::Other(ifmt) => ifmt,
        };
        ifmt | self.mode
    }
}

fn corrupt(msg: impl Into<String>) -> Error {
    Error::CorruptArchive(msg.into())
}

/// Map a read failure of the underlying (decompressed) stream.
fn stream_error(e: io::Error) -> Error {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        corrupt("Unexpected end of payload")
    } else {
        corrupt(format!("Reading payload: {e}"))
    }
}

fn align4(n: u64) -> usize {
    ((4 - (n % 4)) % 4) as usize
}

#[derive(Debug)]
struct RawHeader {
    ino: u32,
    mode: u32,
    uid: u32,
    gid: u32,
    nlink: u32,
    mtime: u32,
    filesize: u32,
    devmajor: u32,
    devminor: u32,
    namesize: u32,
    check: Option<u32>,
}

impl RawHeader {
    fn parse(buf: &[u8; HEADER_SIZE]) -> Result<Self> {
        let magic = &buf[0..6];
        let is_crc = match magic {
            MAGIC_NEWC => false,
            MAGIC_CRC => true,
            o => {
                return Err(corrupt(format!(
                    "Unsupported cpio magic {:?}",
                    String::from_utf8_lossy(o)
                )))
            }
        };
        let field = |idx: usize| -> Result<u32> {
            let start = 6 + idx * 8;
            std::str::from_utf8(&buf[start..start + 8])
                .ok()
                .and_then(|s| u32::from_str_radix(s, 16).ok())
                .ok_or_else(|| corrupt(format!("Invalid cpio header field at offset {start}")))
        };
        Ok(Self {
            ino: field(0)?,
            mode: field(1)?,
            uid: field(2)?,
            gid: field(3)?,
            nlink: field(4)?,
            mtime: field(5)?,
            filesize: field(6)?,
            devmajor: field(7)?,
            devminor: field(8)?,
            namesize: field(11)?,
            check: if is_crc { Some(field(12)?) } else { None },
        })
    }
}

/// Identifies the members of one hardlink set.
type LinkKey = (u32, u32, u32);

#[derive(Debug)]
struct Crc {
    expected: u32,
    sum: u32,
}

/// Reads entries from an uncompressed cpio stream.
#[derive(Debug)]
pub struct CpioReader<R> {
    src: R,
    /// Unread bytes of the current member's content.
    remaining: u64,
    /// Alignment padding after the current member's content.
    pad: usize,
    crc: Option<Crc>,
    /// Entries to emit before reading another header.
    queued: VecDeque<ArchiveEntry>,
    /// Empty members of hardlink sets whose data has not been seen yet.
    pending: HashMap<LinkKey, Vec<ArchiveEntry>>,
    pending_order: Vec<LinkKey>,
    /// Path of the member that carried the data for a hardlink set.
    linked: HashMap<LinkKey, String>,
    finished: bool,
}

impl<R: Read> CpioReader<R> {
    /// Create a reader over an already decompressed payload stream.
    pub fn new(src: R) -> Self {
        Self {
            src,
            remaining: 0,
            pad: 0,
            crc: None,
            queued: VecDeque::new(),
            pending: HashMap::new(),
            pending_order: Vec::new(),
            linked: HashMap::new(),
            finished: false,
        }
    }

    /// Read up to `buf.len()` bytes of the current regular file's content.
    /// Returns 0 once the declared size is exhausted.
    pub fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let n = buf.len().min(self.remaining.min(usize::MAX as u64) as usize);
        let n = loop {
            match self.src.read(&mut buf[..n]) {
                Ok(0) => return Err(corrupt("Unexpected end of payload in file content")),
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(stream_error(e)),
            }
        };
        self.remaining -= n as u64;
        if let Some(crc) = self.crc.as_mut() {
            crc.sum = buf[..n]
                .iter()
                .fold(crc.sum, |acc, &b| acc.wrapping_add(b as u32));
            if self.remaining == 0 && crc.sum != crc.expected {
                return Err(corrupt(format!(
                    "Checksum mismatch: expected {:08x}, found {:08x}",
                    crc.expected, crc.sum
                )));
            }
        }
        Ok(n)
    }

    /// Discard whatever is left of the current member, including padding.
    fn skip_content(&mut self) -> Result<()> {
        let mut buf = [0u8; 8192];
        while self.remaining > 0 {
            self.read_chunk(&mut buf)?;
        }
        self.crc = None;
        let pad = std::mem::take(&mut self.pad);
        self.skip(pad)
    }

    fn skip(&mut self, n: usize) -> Result<()> {
        let mut buf = [0u8; 4];
        self.src.read_exact(&mut buf[..n]).map_err(stream_error)
    }

    fn read_small(&mut self, len: usize, what: &str) -> Result<Vec<u8>> {
        if len > MAX_PATH + 1 {
            return Err(corrupt(format!("{what} too long ({len} bytes)")));
        }
        let mut buf = vec![0u8; len];
        self.src.read_exact(&mut buf).map_err(stream_error)?;
        Ok(buf)
    }

    /// Read the next member header and name.  Returns `None` at the trailer.
    fn read_member(&mut self) -> Result<Option<(RawHeader, String)>> {
        let mut hbuf = [0u8; HEADER_SIZE];
        self.src.read_exact(&mut hbuf).map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                corrupt("Unexpected end of payload (missing trailer)")
            } else {
                stream_error(e)
            }
        })?;
        let hdr = RawHeader::parse(&hbuf)?;
        if hdr.namesize == 0 {
            return Err(corrupt("Empty member name"));
        }
        let mut name = self.read_small(hdr.namesize as usize, "Member name")?;
        self.skip(align4(HEADER_SIZE as u64 + hdr.namesize as u64))?;
        if name.pop() != Some(0) {
            return Err(corrupt("Member name is not NUL terminated"));
        }
        if name == TRAILER.as_bytes() {
            return Ok(None);
        }
        let path = relpath::normalize_bytes(&name)?;
        Ok(Some((hdr, path)))
    }

    /// Move the empty members of hardlink sets that never received data
    /// to the output queue; the first one becomes an empty regular file.
    fn flush_pending(&mut self) {
        for key in std::mem::take(&mut self.pending_order) {
            if let Some(members) = self.pending.remove(&key) {
                self.queue_empty_set(members);
            }
        }
    }

    fn queue_empty_set(&mut self, members: Vec<ArchiveEntry>) {
        let mut it = members.into_iter();
        if let Some(first) = it.next() {
            let target = first.path.clone();
            self.queued.push_back(first);
            self.queued.extend(it.map(|mut e| {
                e.kind = EntryKind::Hardlink(target.clone());
                e
            }));
        }
    }

    /// Advance to the next entry, discarding any unread content of the
    /// current one.
    pub fn next_entry(&mut self) -> Result<Option<ArchiveEntry>> {
        self.skip_content()?;
        loop {
            if let Some(e) = self.queued.pop_front() {
                return Ok(Some(e));
            }
            if self.finished {
                return Ok(None);
            }
            let Some((hdr, path)) = self.read_member()? else {
                self.finished = true;
                self.flush_pending();
                continue;
            };
            let ifmt = hdr.mode & S_IFMT;
            let mut entry = ArchiveEntry {
                path,
                kind: EntryKind::Regular,
                mode: hdr.mode & 0o7777,
                uid: hdr.uid,
                gid: hdr.gid,
                size: 0,
                mtime: hdr.mtime as u64,
            };
            let filesize = hdr.filesize as u64;
            match ifmt {
                S_IFLNK => {
                    let target = self.read_small(filesize as usize, "Symlink target")?;
                    if target.len() > MAX_PATH {
                        return Err(corrupt(format!("Symlink target too long at {}", entry.path)));
                    }
                    self.skip(align4(filesize))?;
                    let target = String::from_utf8(target)
                        .map_err(|_| Error::InvalidPath(entry.path.clone()))?;
                    entry.kind = EntryKind::Symlink(target);
                    return Ok(Some(entry));
                }
                S_IFREG => {}
                o => {
                    entry.kind = if o == S_IFDIR {
                        EntryKind::Directory
                    } else {
                        EntryKind::Other(o)
                    };
                    // Not expected, but skip any data
                    self.remaining = filesize;
                    self.pad = align4(filesize);
                    return Ok(Some(entry));
                }
            }

            entry.size = filesize;
            if hdr.nlink > 1 {
                let key = (hdr.devmajor, hdr.devminor, hdr.ino);
                if let Some(target) = self.linked.get(&key) {
                    if filesize == 0 {
                        entry.kind = EntryKind::Hardlink(target.clone());
                        return Ok(Some(entry));
                    }
                } else if filesize == 0 {
                    let members = self.pending.entry(key).or_insert_with(|| {
                        self.pending_order.push(key);
                        Vec::new()
                    });
                    members.push(entry);
                    if members.len() >= hdr.nlink as usize {
                        let members = self.pending.remove(&key).unwrap_or_default();
                        if let Some(first) = members.first() {
                            self.linked.insert(key, first.path.clone());
                        }
                        self.queue_empty_set(members);
                    }
                    continue;
                } else {
                    self.linked.insert(key, entry.path.clone());
                    if let Some(members) = self.pending.remove(&key) {
                        self.queued.extend(members.into_iter().map(|mut e| {
                            e.kind = EntryKind::Hardlink(entry.path.clone());
                            e
                        }));
                    }
                }
            }
            self.remaining = filesize;
            self.pad = align4(filesize);
            self.crc = hdr.check.map(|expected| Crc { expected, sum: 0 });
            return Ok(Some(entry));
        }
    }
}

/// Reads the content of the current regular file member.
impl<R: Read> Read for CpioReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_chunk(buf).map_err(Error::into_io)
    }
}

//! Test suite fixture.  Should only be used by this library.
//!
//! Synthesizes complete package files: lead, signature header, main header
//! and a compressed cpio payload.

#![allow(missing_docs)]

use std::collections::HashMap;
use std::io::{self, Read, Write};

use anyhow::Result;
use indoc::indoc;

use crate::nevra::Nevra;
use crate::rpm::cpio::{S_IFDIR, S_IFLNK, S_IFREG};
use crate::rpm::header::{kind, tag, HEADER_MAGIC};
use crate::rpm::{ArchiveEntry, LEAD_MAGIC, LEAD_SIZE};
use crate::unpack::EntrySource;

/// Signature header tag holding the size of header and payload.
const SIGTAG_SIZE: u32 = 1000;

/// A passwd file for a target root.
pub const PASSWD: &str = indoc! {"
    root:x:0:0:root:/root:/bin/bash
    bin:x:1:1:bin:/bin:/sbin/nologin
    # system users
    tss:x:59:59:TPM daemon:/dev/null:/sbin/nologin
"};

/// A group file for a target root.
pub const GROUP: &str = indoc! {"
    root:x:0:
    bin:x:1:
    tss:x:59:
    wheel:x:10:
"};

/// Builds a serialized header structure.
#[derive(Debug, Default, Clone)]
pub struct HeaderBuilder {
    entries: Vec<(u32, u32, u32, Vec<u8>)>,
}

fn alignment(kind: u32) -> usize {
    match kind {
        kind::INT16 => 2,
        kind::INT32 => 4,
        kind::INT64 => 8,
        _ => 1,
    }
}

impl HeaderBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a raw entry; replaces any existing entry for `tag`.
    pub fn raw(&mut self, tag: u32, kind: u32, count: u32, data: Vec<u8>) -> &mut Self {
        self.entries.retain(|e| e.0 != tag);
        self.entries.push((tag, kind, count, data));
        self
    }

    pub fn remove(&mut self, tag: u32) -> &mut Self {
        self.entries.retain(|e| e.0 != tag);
        self
    }

    pub fn string(&mut self, tag: u32, v: &str) -> &mut Self {
        let mut data = v.as_bytes().to_vec();
        data.push(0);
        self.raw(tag, kind::STRING, 1, data)
    }

    pub fn string_array(&mut self, tag: u32, v: &[&str]) -> &mut Self {
        let mut data = Vec::new();
        for s in v {
            data.extend_from_slice(s.as_bytes());
            data.push(0);
        }
        self.raw(tag, kind::STRING_ARRAY, v.len() as u32, data)
    }

    pub fn int16(&mut self, tag: u32, v: &[u16]) -> &mut Self {
        let data = v.iter().flat_map(|v| v.to_be_bytes()).collect();
        self.raw(tag, kind::INT16, v.len() as u32, data)
    }

    pub fn int32(&mut self, tag: u32, v: &[u32]) -> &mut Self {
        let data = v.iter().flat_map(|v| v.to_be_bytes()).collect();
        self.raw(tag, kind::INT32, v.len() as u32, data)
    }

    pub fn int64(&mut self, tag: u32, v: &[u64]) -> &mut Self {
        let data = v.iter().flat_map(|v| v.to_be_bytes()).collect();
        self.raw(tag, kind::INT64, v.len() as u32, data)
    }

    /// Serialize, with each value aligned for its type.
    pub fn build(&self) -> Vec<u8> {
        let mut index = Vec::new();
        let mut store: Vec<u8> = Vec::new();
        for (tag, kind, count, data) in self.entries.iter() {
            let align = alignment(*kind);
            store.resize(store.len().div_ceil(align) * align, 0);
            for v in [*tag, *kind, store.len() as u32, *count] {
                index.extend_from_slice(&v.to_be_bytes());
            }
            store.extend_from_slice(data);
        }
        let mut r = HEADER_MAGIC.to_vec();
        r.extend_from_slice(&[0; 4]);
        r.extend_from_slice(&(self.entries.len() as u32).to_be_bytes());
        r.extend_from_slice(&(store.len() as u32).to_be_bytes());
        r.extend(index);
        r.extend(store);
        r
    }
}

/// Payload compression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Gzip,
    Xz,
    Lzma,
    Zstd,
}

impl Compression {
    pub fn name(&self) -> &'static str {
        match self {
            Compression::Gzip => "gzip",
            Compression::Xz => "xz",
            Compression::Lzma => "lzma",
            Compression::Zstd => "zstd",
        }
    }

    pub fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let r = match self {
            Compression::Gzip => {
                let mut w =
                    flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
                w.write_all(data)?;
                w.finish()?
            }
            Compression::Xz => {
                let mut w = xz2::write::XzEncoder::new(Vec::new(), 6);
                w.write_all(data)?;
                w.finish()?
            }
            Compression::Lzma => {
                let opts = xz2::stream::LzmaOptions::new_preset(6)?;
                let stream = xz2::stream::Stream::new_lzma_encoder(&opts)?;
                let mut w = xz2::write::XzEncoder::new_stream(Vec::new(), stream);
                w.write_all(data)?;
                w.finish()?
            }
            Compression::Zstd => zstd::stream::encode_all(data, 0)?,
        };
        Ok(r)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileKind {
    Directory,
    Regular(Vec<u8>),
    Symlink(String),
    /// Another name for the regular file at this path
    Hardlink(String),
    /// Raw `S_IFMT` bits, e.g. a character device
    Special(u32),
}

/// A file in a synthesized package.
#[derive(Debug, Clone)]
pub struct FileDef {
    pub path: String,
    pub kind: FileKind,
    pub mode: u32,
    pub user: String,
    pub group: String,
    pub caps: Option<String>,
    /// Numeric ids recorded in the payload
    pub uid: u32,
    pub gid: u32,
}

/// Builds a complete package file.
#[derive(Debug, Clone)]
pub struct PackageBuilder {
    pub nevra: Nevra,
    pub buildtime: u32,
    pub compression: Compression,
    pub files: Vec<FileDef>,
    /// Mode of a `./` member for the root directory, if one is written
    pub root_mode: Option<u32>,
    /// Write `OLDFILENAMES` instead of the split path tags
    pub legacy_filenames: bool,
    /// Values for `FILESTATES`, written if set
    pub file_states: Option<Vec<u8>>,
}

impl PackageBuilder {
    pub fn new(name: &str, version: &str, release: &str, arch: &str) -> Self {
        Self {
            nevra: Nevra::new(name, 0, version, release, arch),
            buildtime: 1_700_000_000,
            compression: Compression::Gzip,
            files: Vec::new(),
            root_mode: None,
            legacy_filenames: false,
            file_states: None,
        }
    }

    pub fn epoch(mut self, epoch: u64) -> Self {
        self.nevra.epoch = epoch;
        self
    }

    pub fn compression(mut self, c: Compression) -> Self {
        self.compression = c;
        self
    }

    fn add(mut self, path: &str, kind: FileKind, mode: u32) -> Self {
        self.files.push(FileDef {
            path: path.to_string(),
            kind,
            mode,
            user: "root".into(),
            group: "root".into(),
            caps: None,
            uid: 0,
            gid: 0,
        });
        self
    }

    pub fn dir(self, path: &str, mode: u32) -> Self {
        self.add(path, FileKind::Directory, mode)
    }

    pub fn file(self, path: &str, mode: u32, content: &[u8]) -> Self {
        self.add(path, FileKind::Regular(content.to_vec()), mode)
    }

    pub fn symlink(self, path: &str, target: &str) -> Self {
        self.add(path, FileKind::Symlink(target.to_string()), 0o777)
    }

    pub fn hardlink(self, path: &str, target: &str) -> Self {
        let mode = self
            .files
            .iter()
            .find(|f| f.path == target)
            .map(|f| f.mode)
            .unwrap_or(0o644);
        self.add(path, FileKind::Hardlink(target.to_string()), mode)
    }

    pub fn special(self, path: &str, ifmt: u32) -> Self {
        self.add(path, FileKind::Special(ifmt), 0o644)
    }

    fn last(&mut self) -> &mut FileDef {
        self.files.last_mut().expect("no files")
    }

    /// Set the header owner of the last added file.
    pub fn owner(mut self, user: &str, group: &str) -> Self {
        let f = self.last();
        f.user = user.to_string();
        f.group = group.to_string();
        self
    }

    /// Set the payload owner ids of the last added file.
    pub fn ids(mut self, uid: u32, gid: u32) -> Self {
        let f = self.last();
        f.uid = uid;
        f.gid = gid;
        self
    }

    /// Set the header capabilities of the last added file.
    pub fn caps(mut self, caps: &str) -> Self {
        self.last().caps = Some(caps.to_string());
        self
    }

    fn ifmt(kind: &FileKind) -> u32 {
        match kind {
            FileKind::Directory => S_IFDIR,
            FileKind::Regular(_) | FileKind::Hardlink(_) => S_IFREG,
            FileKind::Symlink(_) => S_IFLNK,
            FileKind::Special(o) => *o,
        }
    }

    fn size(&self, f: &FileDef) -> usize {
        match &f.kind {
            FileKind::Regular(c) => c.len(),
            FileKind::Symlink(t) => t.len(),
            FileKind::Hardlink(t) => self
                .files
                .iter()
                .find(|f| &f.path == t)
                .map(|f| self.size(f))
                .unwrap_or_default(),
            _ => 0,
        }
    }

    pub fn source_rpm(&self) -> String {
        let n = &self.nevra;
        format!("{}-{}-{}.src.rpm", n.name, n.version, n.release)
    }

    /// The main header.
    pub fn header(&self) -> HeaderBuilder {
        let mut h = HeaderBuilder::new();
        h.string(tag::NAME, &self.nevra.name)
            .string(tag::VERSION, &self.nevra.version)
            .string(tag::RELEASE, &self.nevra.release)
            .string(tag::ARCH, &self.nevra.arch)
            .int32(tag::BUILDTIME, &[self.buildtime])
            .string(tag::SOURCERPM, &self.source_rpm())
            .int32(tag::ARCHIVESIZE, &[self.payload().len() as u32])
            .string(tag::PAYLOADFORMAT, "cpio")
            .string(tag::PAYLOADCOMPRESSOR, self.compression.name())
            .int32(
                tag::CHANGELOGTIME,
                &[self.buildtime - 86400, self.buildtime - 2 * 86400],
            );
        if self.nevra.epoch != 0 {
            h.int32(tag::EPOCH, &[self.nevra.epoch as u32]);
        }
        if self.files.is_empty() {
            return h;
        }
        let paths: Vec<String> = self
            .files
            .iter()
            .map(|f| format!("/{}", f.path))
            .collect();
        if self.legacy_filenames {
            let paths: Vec<&str> = paths.iter().map(|s| s.as_str()).collect();
            h.string_array(tag::OLDFILENAMES, &paths);
        } else {
            let mut dirnames: Vec<String> = Vec::new();
            let mut dirindexes = Vec::new();
            let mut basenames = Vec::new();
            for p in paths.iter() {
                let (dir, base) = p.rsplit_once('/').unwrap_or(("", p));
                let dir = format!("{dir}/");
                let idx = match dirnames.iter().position(|d| *d == dir) {
                    Some(i) => i,
                    None => {
                        dirnames.push(dir);
                        dirnames.len() - 1
                    }
                };
                dirindexes.push(idx as u32);
                basenames.push(base);
            }
            let dirnames: Vec<&str> = dirnames.iter().map(|s| s.as_str()).collect();
            h.string_array(tag::BASENAMES, &basenames)
                .string_array(tag::DIRNAMES, &dirnames)
                .int32(tag::DIRINDEXES, &dirindexes);
        }
        let users: Vec<&str> = self.files.iter().map(|f| f.user.as_str()).collect();
        let groups: Vec<&str> = self.files.iter().map(|f| f.group.as_str()).collect();
        let modes: Vec<u16> = self
            .files
            .iter()
            .map(|f| (Self::ifmt(&f.kind) | f.mode) as u16)
            .collect();
        let sizes: Vec<u32> = self.files.iter().map(|f| self.size(f) as u32).collect();
        h.string_array(tag::FILEUSERNAME, &users)
            .string_array(tag::FILEGROUPNAME, &groups)
            .int16(tag::FILEMODES, &modes)
            .int32(tag::FILESIZES, &sizes);
        if self.files.iter().any(|f| f.caps.is_some()) {
            let caps: Vec<&str> = self
                .files
                .iter()
                .map(|f| f.caps.as_deref().unwrap_or(""))
                .collect();
            h.string_array(tag::FILECAPS, &caps);
        }
        if let Some(states) = self.file_states.as_ref() {
            h.raw(tag::FILESTATES, kind::CHAR, states.len() as u32, states.clone());
        }
        h
    }

    /// The uncompressed cpio payload.  Hardlinked files share an inode;
    /// the content goes on the last member of each set, as rpm does.
    pub fn payload(&self) -> Vec<u8> {
        let mut sets: HashMap<&str, Vec<usize>> = HashMap::new();
        for (i, f) in self.files.iter().enumerate() {
            match &f.kind {
                FileKind::Regular(_) => sets.entry(f.path.as_str()).or_default().push(i),
                FileKind::Hardlink(t) => sets.entry(t.as_str()).or_default().push(i),
                _ => {}
            }
        }
        let mut w = CpioWriter::default();
        if let Some(mode) = self.root_mode {
            w.member(".", S_IFDIR | mode, 1, 1, 0, 0, b"");
        }
        for (i, f) in self.files.iter().enumerate() {
            let ino = i as u32 + 2;
            let mode = Self::ifmt(&f.kind) | f.mode;
            let name = format!("./{}", f.path);
            match &f.kind {
                FileKind::Regular(_) | FileKind::Hardlink(_) => {
                    let key = match &f.kind {
                        FileKind::Hardlink(t) => t.as_str(),
                        _ => f.path.as_str(),
                    };
                    let set = sets.get(key).cloned().unwrap_or_default();
                    let content = set
                        .iter()
                        .find_map(|&j| match &self.files[j].kind {
                            FileKind::Regular(c) => Some(c.as_slice()),
                            _ => None,
                        })
                        .unwrap_or_default();
                    let ino = set.first().map(|&j| j as u32 + 2).unwrap_or(ino);
                    let is_last = set.last() == Some(&i);
                    let data = if is_last { content } else { &[][..] };
                    let nlink = set.len().max(1) as u32;
                    w.member(&name, mode, ino, nlink, f.uid, f.gid, data);
                }
                FileKind::Symlink(t) => w.member(&name, mode, ino, 1, f.uid, f.gid, t.as_bytes()),
                FileKind::Directory | FileKind::Special(_) => {
                    w.member(&name, mode, ino, 1, f.uid, f.gid, b"")
                }
            }
        }
        w.finish()
    }

    /// The complete package file, with `header` as the main header.
    pub fn build_with_header(&self, header: &[u8]) -> Result<Vec<u8>> {
        let payload = self.compression.compress(&self.payload())?;
        let mut out = Vec::new();
        let mut lead = [0u8; LEAD_SIZE];
        lead[0..4].copy_from_slice(&LEAD_MAGIC);
        lead[4] = 3;
        out.extend_from_slice(&lead);
        let mut sig = HeaderBuilder::new();
        sig.int32(SIGTAG_SIZE, &[(header.len() + payload.len()) as u32]);
        let sig = sig.build();
        out.extend_from_slice(&sig);
        out.resize(out.len() + (8 - sig.len() % 8) % 8, 0);
        out.extend_from_slice(header);
        out.extend_from_slice(&payload);
        Ok(out)
    }

    /// The complete package file.
    pub fn build(&self) -> Result<Vec<u8>> {
        self.build_with_header(&self.header().build())
    }
}

/// Writes a newc cpio stream.
#[derive(Debug, Default)]
pub struct CpioWriter {
    out: Vec<u8>,
}

fn pad4(out: &mut Vec<u8>) {
    out.resize(out.len().div_ceil(4) * 4, 0);
}

impl CpioWriter {
    #[allow(clippy::too_many_arguments)]
    pub fn member(
        &mut self,
        name: &str,
        mode: u32,
        ino: u32,
        nlink: u32,
        uid: u32,
        gid: u32,
        data: &[u8],
    ) {
        let namesize = name.len() as u32 + 1;
        let fields = [
            ino,
            mode,
            uid,
            gid,
            nlink,
            0,
            data.len() as u32,
            0,
            0,
            0,
            0,
            namesize,
            0,
        ];
        self.out.extend_from_slice(b"070701");
        for f in fields {
            self.out.extend_from_slice(format!("{f:08X}").as_bytes());
        }
        self.out.extend_from_slice(name.as_bytes());
        self.out.push(0);
        pad4(&mut self.out);
        self.out.extend_from_slice(data);
        pad4(&mut self.out);
    }

    pub fn finish(mut self) -> Vec<u8> {
        self.member("TRAILER!!!", 0, 0, 1, 0, 0, b"");
        self.out
    }
}

/// An [`EntrySource`] over a fixed list of entries, for sequences a cpio
/// payload cannot express (e.g. a hardlink preceding its target).
#[derive(Debug)]
pub struct MemoryArchive {
    entries: std::vec::IntoIter<(ArchiveEntry, Vec<u8>)>,
    content: io::Cursor<Vec<u8>>,
}

impl MemoryArchive {
    pub fn new(entries: Vec<(ArchiveEntry, Vec<u8>)>) -> Self {
        Self {
            entries: entries.into_iter(),
            content: Default::default(),
        }
    }
}

impl EntrySource for MemoryArchive {
    fn next_entry(&mut self) -> crate::Result<Option<ArchiveEntry>> {
        Ok(self.entries.next().map(|(e, c)| {
            self.content = io::Cursor::new(c);
            e
        }))
    }

    fn content(&mut self) -> &mut dyn Read {
        &mut self.content
    }
}

//! Integration tests for rpmcache-lib.

use std::io::{Cursor, Read};
use std::sync::Arc;

use anyhow::{Context, Result};
use camino::Utf8Path;
use cap_std_ext::cap_primitives::fs::MetadataExt;
use cap_std_ext::cap_std;
use cap_std_ext::cap_tempfile;
use rpmcache_lib::cache;
use rpmcache_lib::filedb::FileDb;
use rpmcache_lib::fixture::{self, Compression, MemoryArchive, PackageBuilder};
use rpmcache_lib::fscaps::{self, FileCaps};
use rpmcache_lib::idmap::IdMap;
use rpmcache_lib::importer::{self, ImportOptions};
use rpmcache_lib::mtree::DEFAULT_DIRMODE;
use rpmcache_lib::nevra::Nevra;
use rpmcache_lib::overrides::HeaderIndex;
use rpmcache_lib::repo::{self, AutoTransaction, Content, DirMeta, FileMeta, FsRepo, Repo};
use rpmcache_lib::rpm::header::tag;
use rpmcache_lib::rpm::{ArchiveEntry, EntryKind};
use rpmcache_lib::unpack::{self, UnpackOptions};
use rpmcache_lib::Error;
use tokio_util::sync::CancellationToken;

fn assert_err_contains<T>(r: Result<T>, s: impl AsRef<str>) {
    let s = s.as_ref();
    let msg = format!("{:#}", r.err().unwrap());
    if !msg.contains(s) {
        panic!(r#"Error message "{}" did not contain "{}""#, msg, s);
    }
}

fn new_repo() -> Result<(cap_tempfile::TempDir, FsRepo)> {
    let td = cap_tempfile::TempDir::new(cap_std::ambient_authority())?;
    let repo = FsRepo::create_at(td.try_clone()?)?;
    Ok((td, repo))
}

fn import_opts() -> ImportOptions {
    let mut opts = ImportOptions::default();
    opts.idmap = IdMap::from_contents(fixture::PASSWD, fixture::GROUP);
    opts
}

fn example_pkg() -> PackageBuilder {
    PackageBuilder::new("example", "1.0", "1.fc40", "x86_64")
        .dir("usr", 0o755)
        .dir("usr/bin", 0o755)
        .file("usr/bin/hello", 0o755, b"#!/bin/sh\necho hello\n")
        .symlink("usr/bin/hi", "hello")
        .file("usr/share/example/README", 0o644, b"An example\n")
}

/// Find the store object at `path` in a commit: (meta checksum, is_dir)
fn resolve_path(repo: &dyn Repo, commit: &str, path: &str) -> Result<(String, bool)> {
    let commit = repo.read_commit(commit)?;
    let mut tree = repo.read_dirtree(&commit.root_tree)?;
    let mut meta = commit.root_meta;
    if path.is_empty() {
        return Ok((meta, true));
    }
    let mut components = path.split('/').peekable();
    while let Some(name) = components.next() {
        if let Some((t, m)) = tree.dirs.get(name) {
            meta = m.clone();
            tree = repo.read_dirtree(t)?;
            continue;
        }
        let file = tree
            .files
            .get(name)
            .with_context(|| format!("{path}: missing {name}"))?;
        anyhow::ensure!(components.peek().is_none(), "{path}: {name} is a file");
        return Ok((file.clone(), false));
    }
    Ok((meta, true))
}

fn file_meta(repo: &dyn Repo, commit: &str, path: &str) -> Result<(FileMeta, Content)> {
    let (checksum, is_dir) = resolve_path(repo, commit, path)?;
    anyhow::ensure!(!is_dir);
    repo.read_content(&checksum)
}

fn dir_meta(repo: &dyn Repo, commit: &str, path: &str) -> Result<DirMeta> {
    let (checksum, is_dir) = resolve_path(repo, commit, path)?;
    anyhow::ensure!(is_dir);
    repo.read_dirmeta(&checksum)
}

fn read_regular(content: Content) -> Result<Vec<u8>> {
    match content {
        Content::Regular(mut r) => {
            let mut buf = Vec::new();
            r.read_to_end(&mut buf)?;
            Ok(buf)
        }
        o => anyhow::bail!("Expected regular file, found {o:?}"),
    }
}

#[test]
fn test_import_idempotent() -> Result<()> {
    let (_td, repo) = new_repo()?;
    let pkg = example_pkg().build()?;
    let first = importer::import_package(&repo, Cursor::new(&pkg), &import_opts())?;
    let stats = first.stats.as_ref().unwrap();
    assert_eq!(stats.regfiles, 2);
    assert_eq!(stats.symlinks, 1);
    assert_eq!(stats.dirs, 2);
    let n_objects = repo.count_objects()?;

    let second = importer::import_package(&repo, Cursor::new(&pkg), &import_opts())?;
    assert_eq!(first.commit, second.commit);
    assert!(second.stats.is_none());
    assert_eq!(repo.count_objects()?, n_objects);

    // A fresh store converges on the same commit
    let (_td2, repo2) = new_repo()?;
    let third = importer::import_package(&repo2, Cursor::new(&pkg), &import_opts())?;
    assert_eq!(first.commit, third.commit);

    let branch = cache::branch_for(&first.nevra)?;
    assert_eq!(branch, "rpmcache-example-1.0-1.fc40.x86__64");
    assert_eq!(repo.resolve_ref(&branch)?.as_deref(), Some(first.commit.as_str()));
    assert_eq!(
        cache::list_cached(&repo)?,
        vec![("example-1.0-1.fc40.x86_64".to_string(), first.commit.clone())]
    );

    let commit = repo.read_commit(&first.commit)?;
    assert_eq!(commit.timestamp, 1_700_000_000);
    assert_eq!(commit.metadata[cache::NEVRA_KEY], "example-1.0-1.fc40.x86_64");
    let header = cache::header_from_commit(&repo, &first.commit)?;
    assert_eq!(header.nevra()?, first.nevra);
    Ok(())
}

#[test]
fn test_checkout() -> Result<()> {
    let (_td, repo) = new_repo()?;
    let pkg = example_pkg().build()?;
    let r = importer::import_package(&repo, Cursor::new(&pkg), &import_opts())?;
    let dest = cap_tempfile::TempDir::new(cap_std::ambient_authority())?;
    repo::checkout(&repo, &r.commit, &dest)?;
    assert_eq!(dest.read_to_string("usr/bin/hello")?, "#!/bin/sh\necho hello\n");
    assert_eq!(dest.metadata("usr/bin/hello")?.mode() & 0o7777, 0o755);
    assert_eq!(
        dest.read_link_contents("usr/bin/hi")?.to_str(),
        Some("hello")
    );
    assert_eq!(dest.read_to_string("usr/share/example/README")?, "An example\n");
    Ok(())
}

#[test]
fn test_hardlinks() -> Result<()> {
    let pkg = PackageBuilder::new("links", "1", "1", "noarch")
        .file("usr/bin/a", 0o755, b"binary")
        .hardlink("usr/bin/b", "usr/bin/a")
        .hardlink("usr/libexec/c", "usr/bin/a")
        .build()?;

    // Into the store: all names share one content object
    let (_td, repo) = new_repo()?;
    let r = importer::import_package(&repo, Cursor::new(&pkg), &import_opts())?;
    assert_eq!(r.stats.as_ref().unwrap().hardlinks, 2);
    let (a, _) = resolve_path(&repo, &r.commit, "usr/bin/a")?;
    let (b, _) = resolve_path(&repo, &r.commit, "usr/bin/b")?;
    let (c, _) = resolve_path(&repo, &r.commit, "usr/libexec/c")?;
    assert_eq!(a, b);
    assert_eq!(a, c);
    let (_, content) = repo.read_content(&a)?;
    assert_eq!(read_regular(content)?, b"binary");

    // Into a directory: all names share one inode
    let td = cap_tempfile::TempDir::new(cap_std::ambient_authority())?;
    let stats = unpack::unpack_package_to_dir(Cursor::new(&pkg), &td, &UnpackOptions::default())?;
    assert_eq!(stats.regfiles, 1);
    assert_eq!(stats.hardlinks, 2);
    let a = td.metadata("usr/bin/a")?;
    assert_eq!(a.ino(), td.metadata("usr/bin/b")?.ino());
    assert_eq!(a.ino(), td.metadata("usr/libexec/c")?.ino());
    assert_eq!(a.nlink(), 3);
    assert_eq!(td.read_to_string("usr/libexec/c")?, "binary");
    Ok(())
}

#[test]
fn test_forward_hardlink() -> Result<()> {
    let (_td, repo) = new_repo()?;
    let entry = |path: &str, kind: EntryKind, content: &[u8]| {
        let e = ArchiveEntry {
            path: path.into(),
            kind,
            mode: 0o644,
            uid: 0,
            gid: 0,
            size: content.len() as u64,
            mtime: 0,
        };
        (e, content.to_vec())
    };
    let txn = AutoTransaction::new(&repo)?;
    let mut src = MemoryArchive::new(vec![
        entry("b", EntryKind::Hardlink("a".into()), b""),
        entry("a", EntryKind::Regular, b"data"),
    ]);
    let opts = UnpackOptions::default();
    let (tree, stats) = unpack::unpack_to_tree(&mut src, &HeaderIndex::default(), &repo, &opts)?;
    assert_eq!(stats.hardlinks, 1);
    let root = repo.read_dirtree(&tree.tree)?;
    assert_eq!(root.files["a"], root.files["b"]);
    txn.commit()?;

    // A link whose target never appears fails, and nothing is left behind
    let before = repo.count_objects()?;
    let txn = AutoTransaction::new(&repo)?;
    let mut src = MemoryArchive::new(vec![
        entry("x", EntryKind::Regular, b"unrelated content"),
        entry("b", EntryKind::Hardlink("nope".into()), b""),
    ]);
    let e = unpack::unpack_to_tree(&mut src, &HeaderIndex::default(), &repo, &opts).unwrap_err();
    assert!(matches!(
        Error::find(&e),
        Some(Error::HardlinkTargetMissing(p)) if p == "nope"
    ));
    drop(txn);
    assert_eq!(repo.count_objects()?, before);
    Ok(())
}

#[test]
fn test_unresolved_hardlink_empty_store() -> Result<()> {
    let (_td, repo) = new_repo()?;
    let txn = AutoTransaction::new(&repo)?;
    let link = ArchiveEntry {
        path: "usr/bin/b".into(),
        kind: EntryKind::Hardlink("usr/bin/a".into()),
        mode: 0o755,
        uid: 0,
        gid: 0,
        size: 0,
        mtime: 0,
    };
    let mut src = MemoryArchive::new(vec![(link, Vec::new())]);
    let e = unpack::unpack_to_tree(
        &mut src,
        &HeaderIndex::default(),
        &repo,
        &UnpackOptions::default(),
    )
    .unwrap_err();
    assert!(matches!(
        Error::find(&e),
        Some(Error::HardlinkTargetMissing(_))
    ));
    drop(txn);
    assert_eq!(repo.count_objects()?, 0);
    Ok(())
}

#[test]
fn test_override_precedence() -> Result<()> {
    let (_td, repo) = new_repo()?;
    let pkg = PackageBuilder::new("iputils", "20240117", "4.fc40", "x86_64")
        .file("usr/bin/ping", 0o4755, b"ping")
        .ids(1000, 1000)
        .owner("bin", "bin")
        .caps("cap_net_raw=ep")
        .file("usr/bin/tracepath", 0o755, b"tracepath")
        .ids(1000, 1000)
        .file("usr/share/tpm", 0o644, b"tpm")
        .owner("tss", "wheel")
        .build()?;
    let r = importer::import_package(&repo, Cursor::new(&pkg), &import_opts())?;

    let (meta, _) = file_meta(&repo, &r.commit, "usr/bin/ping")?;
    assert_eq!((meta.uid, meta.gid), (1, 1));
    // Archive modes are kept in the store, including set-id bits
    assert_eq!(meta.mode, libc::S_IFREG | 0o4755);
    let caps: FileCaps = "cap_net_raw=ep".parse()?;
    assert_eq!(meta.xattr(fscaps::XATTR_NAME)?, Some(caps.to_xattr()));

    // No header override: the payload ids are used
    let (meta, _) = file_meta(&repo, &r.commit, "usr/bin/tracepath")?;
    assert_eq!((meta.uid, meta.gid), (1000, 1000));
    assert!(meta.xattrs.is_empty());

    let (meta, _) = file_meta(&repo, &r.commit, "usr/share/tpm")?;
    assert_eq!((meta.uid, meta.gid), (59, 10));
    Ok(())
}

#[test]
fn test_unknown_user() -> Result<()> {
    let (_td, repo) = new_repo()?;
    let pkg = PackageBuilder::new("unknown", "1", "1", "noarch")
        .file("etc/secret", 0o600, b"x")
        .owner("nosuchuser", "root")
        .build()?;
    let e = importer::import_package(&repo, Cursor::new(&pkg), &import_opts()).unwrap_err();
    assert!(matches!(
        Error::find(&e),
        Some(Error::UnknownUser(u)) if u == "nosuchuser"
    ));
    assert!(cache::list_cached(&repo)?.is_empty());
    Ok(())
}

#[test]
fn test_default_dir_promotion() -> Result<()> {
    let (_td, repo) = new_repo()?;
    let pkg = PackageBuilder::new("tpm2", "1", "1", "x86_64")
        .file("usr/lib/tpm2/a", 0o644, b"a")
        .dir("usr/lib/tpm2", 0o750)
        .owner("tss", "tss")
        .file("usr/lib/tpm2/b", 0o644, b"b")
        .build()?;
    let r = importer::import_package(&repo, Cursor::new(&pkg), &import_opts())?;

    for implicit in ["usr", "usr/lib"] {
        let m = dir_meta(&repo, &r.commit, implicit)?;
        assert_eq!((m.uid, m.gid, m.mode), (0, 0, DEFAULT_DIRMODE));
    }
    let m = dir_meta(&repo, &r.commit, "usr/lib/tpm2")?;
    assert_eq!((m.uid, m.gid, m.mode), (59, 59, libc::S_IFDIR | 0o750));
    // Children created before the explicit entry survive it
    resolve_path(&repo, &r.commit, "usr/lib/tpm2/a")?;
    resolve_path(&repo, &r.commit, "usr/lib/tpm2/b")?;
    Ok(())
}

#[test]
fn test_root_entry() -> Result<()> {
    let (_td, repo) = new_repo()?;
    let mut pkg = PackageBuilder::new("filesystem", "3.18", "8.fc40", "x86_64").dir("var", 0o755);
    pkg.root_mode = Some(0o555);
    let r = importer::import_package(&repo, Cursor::new(&pkg.build()?), &import_opts())?;
    let m = dir_meta(&repo, &r.commit, "")?;
    assert_eq!(m.mode, libc::S_IFDIR | 0o555);
    assert_eq!(dir_meta(&repo, &r.commit, "var")?.mode, libc::S_IFDIR | 0o755);
    Ok(())
}

#[test]
fn test_device_rejected() -> Result<()> {
    let (_td, repo) = new_repo()?;
    let pkg = PackageBuilder::new("devices", "1", "1", "x86_64")
        .file("usr/share/before", 0o644, b"content written before the device")
        .special("dev/null", libc::S_IFCHR)
        .build()?;
    let e = importer::import_package(&repo, Cursor::new(&pkg), &import_opts()).unwrap_err();
    assert!(matches!(
        Error::find(&e),
        Some(Error::UnsupportedFileType(p)) if p == "dev/null"
    ));
    let nevra: Nevra = "devices-1-1.x86_64".parse()?;
    assert_eq!(cache::lookup(&repo, &nevra)?, None);
    assert_eq!(repo.count_objects()?, 0);

    let td = cap_tempfile::TempDir::new(cap_std::ambient_authority())?;
    let e = unpack::unpack_package_to_dir(Cursor::new(&pkg), &td, &UnpackOptions::default())
        .unwrap_err();
    assert!(matches!(
        Error::find(&e),
        Some(Error::UnsupportedFileType(_))
    ));
    // Partial output is left for the caller
    assert!(td.try_exists("usr/share/before")?);
    assert!(!td.try_exists("dev/null")?);
    Ok(())
}

#[test]
fn test_branch_names() -> Result<()> {
    assert_eq!(
        cache::branch_name_for("foo-1.0-1.x86_64")?,
        "rpmcache-foo-1.0-1.x86__64"
    );
    let n = Nevra::new("foo", 1, "1.0", "1", "x86_64");
    let branch = cache::branch_for(&n)?;
    assert_eq!(branch, "rpmcache-foo-1_3A1.0-1.x86__64");
    assert_eq!(cache::nevra_from_branch(&branch)?, "foo-1:1.0-1.x86_64");
    assert_eq!(cache::nevra_from_branch(&branch)?.parse::<Nevra>()?, n);
    Ok(())
}

#[test]
fn test_epoch_import() -> Result<()> {
    let (_td, repo) = new_repo()?;
    let pkg = example_pkg().epoch(2).build()?;
    let r = importer::import_package(&repo, Cursor::new(&pkg), &import_opts())?;
    assert_eq!(r.nevra.epoch, 2);
    assert_eq!(
        cache::list_cached(&repo)?,
        vec![("example-2:1.0-1.fc40.x86_64".to_string(), r.commit)]
    );
    Ok(())
}

#[test]
fn test_header_errors() -> Result<()> {
    let (_td, repo) = new_repo()?;
    let pkg = example_pkg();

    // User names for fewer files than the header lists
    let mut header = pkg.header();
    header.string_array(tag::FILEUSERNAME, &["root"]);
    let buf = pkg.build_with_header(&header.build())?;
    let e = importer::import_package(&repo, Cursor::new(&buf), &import_opts()).unwrap_err();
    assert!(matches!(Error::find(&e), Some(Error::MalformedHeader(_))));

    // Directory index out of range
    let mut header = pkg.header();
    header.int32(tag::DIRINDEXES, &[0, 0, 7, 1, 2]);
    let buf = pkg.build_with_header(&header.build())?;
    let e = importer::import_package(&repo, Cursor::new(&buf), &import_opts()).unwrap_err();
    assert!(matches!(Error::find(&e), Some(Error::MalformedHeader(_))));

    // Missing identity
    let mut header = pkg.header();
    header.remove(tag::NAME);
    let buf = pkg.build_with_header(&header.build())?;
    let e = importer::import_package(&repo, Cursor::new(&buf), &import_opts()).unwrap_err();
    assert!(matches!(Error::find(&e), Some(Error::MalformedHeader(_))));

    // Not a package at all
    let e = importer::import_package(&repo, Cursor::new(b"hello world"), &import_opts())
        .unwrap_err();
    assert!(matches!(Error::find(&e), Some(Error::CorruptArchive(_))));

    assert!(cache::list_cached(&repo)?.is_empty());
    assert_eq!(repo.count_objects()?, 0);
    Ok(())
}

#[test]
fn test_corrupt_payload() -> Result<()> {
    let (_td, repo) = new_repo()?;
    // Cut off the second half of the compressed payload
    let builder = example_pkg();
    let compressed = Compression::Gzip.compress(&builder.payload())?.len();
    let mut pkg = builder.build()?;
    pkg.truncate(pkg.len() - compressed / 2);
    let e = importer::import_package(&repo, Cursor::new(&pkg), &import_opts()).unwrap_err();
    assert!(matches!(Error::find(&e), Some(Error::CorruptArchive(_))), "{e:#}");
    assert!(cache::list_cached(&repo)?.is_empty());

    let mut header = example_pkg().header();
    header.string(tag::PAYLOADCOMPRESSOR, "bzip2");
    let buf = example_pkg().build_with_header(&header.build())?;
    assert_err_contains(
        importer::import_package(&repo, Cursor::new(&buf), &import_opts()),
        "Unsupported payload compressor bzip2",
    );
    Ok(())
}

#[test]
fn test_compressors() -> Result<()> {
    let (_td, repo) = new_repo()?;
    let mut commits = Vec::new();
    for c in [
        Compression::Gzip,
        Compression::Xz,
        Compression::Lzma,
        Compression::Zstd,
    ] {
        let mut pkg = example_pkg().compression(c);
        pkg.nevra.release = format!("1.{}", c.name());
        let r = importer::import_package(&repo, Cursor::new(&pkg.build()?), &import_opts())
            .with_context(|| c.name())?;
        let (_, content) = file_meta(&repo, &r.commit, "usr/bin/hello")?;
        assert_eq!(read_regular(content)?, b"#!/bin/sh\necho hello\n");
        commits.push(r.commit);
    }
    // Same content; only the identity differs, and so the commit
    let trees: Vec<_> = commits
        .iter()
        .map(|c| repo.read_commit(c).map(|c| c.root_tree))
        .collect::<Result<_>>()?;
    assert!(trees.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(cache::list_cached(&repo)?.len(), 4);
    Ok(())
}

#[test]
fn test_legacy_filenames() -> Result<()> {
    let (_td, repo) = new_repo()?;
    let mut pkg = PackageBuilder::new("legacy", "1", "1", "noarch")
        .file("usr/bin/tool", 0o755, b"tool")
        .owner("bin", "root");
    pkg.legacy_filenames = true;
    let r = importer::import_package(&repo, Cursor::new(&pkg.build()?), &import_opts())?;
    let (meta, _) = file_meta(&repo, &r.commit, "usr/bin/tool")?;
    assert_eq!((meta.uid, meta.gid), (1, 0));
    Ok(())
}

#[test]
fn test_nevra_mismatch() -> Result<()> {
    let (_td, repo) = new_repo()?;
    let pkg = example_pkg().build()?;
    let wanted: Nevra = "example-1.1-1.fc40.x86_64".parse()?;
    let e = importer::import_nevra(
        &repo,
        &wanted,
        |_| Ok(Cursor::new(pkg.clone())),
        &import_opts(),
    )
    .unwrap_err();
    match Error::find(&e) {
        Some(Error::NevraMismatch { expected, found }) => {
            assert_eq!(expected, "example-1.1-1.fc40.x86_64");
            assert_eq!(found, "example-1.0-1.fc40.x86_64");
        }
        o => panic!("Unexpected error {o:?}"),
    }
    assert_err_contains(Err::<(), _>(e), "Importing example-1.1-1.fc40.x86_64");
    assert!(cache::list_cached(&repo)?.is_empty());
    Ok(())
}

#[test]
fn test_import_packages() -> Result<()> {
    let (_td, repo) = new_repo()?;
    let a = example_pkg();
    let b = PackageBuilder::new("other", "2", "1", "noarch").file("usr/share/other", 0o644, b"o");
    let nevras = vec![a.nevra.clone(), b.nevra.clone()];
    let mut fetched = Vec::new();
    let mut fetch = |n: &Nevra| -> Result<Cursor<Vec<u8>>> {
        fetched.push(n.clone());
        let pkg = if *n == a.nevra { &a } else { &b };
        Ok(Cursor::new(pkg.build()?))
    };
    let r = importer::import_packages(&repo, &nevras, &mut fetch, &import_opts())?;
    assert_eq!(r.len(), 2);
    assert!(r.iter().all(|i| i.stats.is_some()));

    // Cached packages are not fetched again
    let again = importer::import_packages(&repo, &nevras, &mut fetch, &import_opts())?;
    assert!(again.iter().all(|i| i.stats.is_none()));
    assert_eq!(
        again.iter().map(|i| &i.commit).collect::<Vec<_>>(),
        r.iter().map(|i| &i.commit).collect::<Vec<_>>()
    );
    drop(fetch);
    assert_eq!(fetched, nevras);
    Ok(())
}

#[test]
fn test_cancelled_import() -> Result<()> {
    let (_td, repo) = new_repo()?;
    let mut opts = import_opts();
    let token = CancellationToken::new();
    token.cancel();
    opts.cancellable = Some(token);
    let pkg = example_pkg().build()?;
    let e = importer::import_package(&repo, Cursor::new(&pkg), &opts).unwrap_err();
    assert!(matches!(Error::find(&e), Some(Error::Cancelled)));
    assert!(cache::list_cached(&repo)?.is_empty());
    assert_eq!(repo.count_objects()?, 0);
    Ok(())
}

#[tokio::test]
async fn test_import_async() -> Result<()> {
    let td = tempfile::tempdir()?;
    let path = Utf8Path::from_path(td.path()).unwrap().join("repo");
    let repo = Arc::new(FsRepo::open_or_create(&path)?);
    let pkg = example_pkg().build()?;
    let r = importer::import_package_async(repo.clone(), Cursor::new(pkg), import_opts()).await?;
    assert!(r.stats.is_some());
    // Reopening sees the committed branch
    let reopened = FsRepo::open(&path)?;
    assert_eq!(cache::lookup(&reopened, &r.nevra)?, Some(r.commit));
    Ok(())
}

fn numbered_pkg(i: usize) -> PackageBuilder {
    let mut pkg = PackageBuilder::new(&format!("pkg{i}"), "1", "1", "noarch").dir("usr", 0o755);
    for j in 0..10 {
        let content = format!("{i} {j}\n");
        pkg = pkg.file(&format!("usr/share/pkg{i}/f{j}"), 0o644, content.as_bytes());
    }
    pkg
}

fn verify_numbered(repo: &dyn Repo, results: &[importer::Imported]) -> Result<()> {
    for (i, r) in results.iter().enumerate() {
        assert!(r.stats.is_some());
        assert_eq!(cache::lookup(repo, &r.nevra)?.as_deref(), Some(r.commit.as_str()));
        for j in 0..10 {
            let (_, content) = file_meta(repo, &r.commit, &format!("usr/share/pkg{i}/f{j}"))?;
            assert_eq!(read_regular(content)?, format!("{i} {j}\n").into_bytes());
        }
    }
    assert_eq!(cache::list_cached(repo)?.len(), results.len());
    Ok(())
}

#[test]
fn test_parallel_imports() -> Result<()> {
    let (td, repo) = new_repo()?;
    let other = FsRepo::open_at(td.try_clone()?)?;
    let pkgs = (0..6)
        .map(|i| numbered_pkg(i).build())
        .collect::<Result<Vec<_>>>()?;
    let results = std::thread::scope(|s| {
        let handles = pkgs
            .iter()
            .enumerate()
            .map(|(i, pkg)| {
                // Threads share a handle, and two handles share a directory
                let repo = if i % 2 == 0 { &repo } else { &other };
                s.spawn(move || importer::import_package(repo, Cursor::new(pkg), &import_opts()))
            })
            .collect::<Vec<_>>();
        handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .collect::<Result<Vec<_>>>()
    })?;
    verify_numbered(&repo, &results)?;
    assert_eq!(td.read_dir("tmp")?.count(), 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_parallel_imports_async() -> Result<()> {
    let (td, repo) = new_repo()?;
    let repo: Arc<dyn Repo> = Arc::new(repo);
    let imports = (0..4)
        .map(|i| {
            let pkg = numbered_pkg(i).build()?;
            Ok(importer::import_package_async(
                Arc::clone(&repo),
                Cursor::new(pkg),
                import_opts(),
            ))
        })
        .collect::<Result<Vec<_>>>()?;
    let results = futures_util::future::try_join_all(imports).await?;
    verify_numbered(repo.as_ref(), &results)?;
    assert_eq!(td.read_dir("tmp")?.count(), 0);
    Ok(())
}

#[test]
fn test_import_header_and_payload() -> Result<()> {
    let pkg = example_pkg().compression(Compression::Zstd);
    let payload = pkg.compression.compress(&pkg.payload())?;

    let (_td, repo) = new_repo()?;
    let split = importer::import_header_and_payload(
        &repo,
        pkg.header().build(),
        Cursor::new(&payload),
        &import_opts(),
    )?;
    assert_eq!(split.nevra, pkg.nevra);
    assert!(split.stats.is_some());

    // Same commit as importing the complete package file
    let (_td2, repo2) = new_repo()?;
    let whole = importer::import_package(&repo2, Cursor::new(pkg.build()?), &import_opts())?;
    assert_eq!(split.commit, whole.commit);
    assert_eq!(split.stats, whole.stats);

    let again = importer::import_header_and_payload(
        &repo,
        pkg.header().build(),
        Cursor::new(&payload),
        &import_opts(),
    )?;
    assert_eq!(again.commit, split.commit);
    assert!(again.stats.is_none());

    // A corrupt header fails before the payload is read
    let mut header = pkg.header().build();
    header[0] ^= 0xff;
    let e = importer::import_header_and_payload(
        &repo2,
        header,
        Cursor::new(&payload),
        &import_opts(),
    )
    .unwrap_err();
    assert!(matches!(Error::find(&e), Some(Error::MalformedHeader(_))));
    Ok(())
}

#[test]
fn test_package_meta() -> Result<()> {
    let (_td, repo) = new_repo()?;
    let pkg = example_pkg();
    importer::import_package(&repo, Cursor::new(&pkg.build()?), &import_opts())?;
    let meta = cache::package_meta(&repo, &pkg.nevra)?.unwrap();
    assert_eq!(meta.size, pkg.payload().len() as u64);
    assert_eq!(meta.buildtime, 1_700_000_000);
    assert_eq!(meta.changelogs, vec![1_699_913_600, 1_699_827_200]);
    assert_eq!(meta.src_pkg.as_deref(), Some("example-1.0-1.fc40.src.rpm"));
    let missing: Nevra = "example-9-1.x86_64".parse()?;
    assert!(cache::package_meta(&repo, &missing)?.is_none());
    Ok(())
}

#[test]
fn test_filedb() -> Result<()> {
    let (_td, repo) = new_repo()?;
    let glibc = PackageBuilder::new("glibc", "2.39", "1.fc40", "x86_64")
        .file("lib64/libc.so.6", 0o755, b"libc")
        .file("usr/share/doc/glibc/README", 0o644, b"doc");
    let mut compat = PackageBuilder::new("compat", "1", "1", "x86_64")
        .file("usr/lib64/libc.so.6", 0o755, b"other")
        .file("usr/share/compat/gone", 0o644, b"gone");
    importer::import_package(&repo, Cursor::new(&glibc.build()?), &import_opts())?;
    importer::import_package(&repo, Cursor::new(&compat.build()?), &import_opts())?;

    let root = cap_tempfile::TempDir::new(cap_std::ambient_authority())?;
    root.create_dir_all("usr/lib64")?;
    root.symlink_contents("usr/lib64", "lib64")?;
    let db = FileDb::from_cache(root.try_clone()?, &repo)?;
    assert_eq!(
        db.find_pkgs_for_file("/usr/lib64/libc.so.6")?,
        ["compat-1-1.x86_64", "glibc-2.39-1.fc40.x86_64"]
    );
    assert_eq!(
        db.find_pkgs_for_file("/lib64/libc.so.6")?,
        ["glibc-2.39-1.fc40.x86_64"]
    );
    assert!(db.find_pkgs_for_file("/usr/lib/libc.so.6")?.is_empty());

    // Files marked as not installed are not owned
    compat.file_states = Some(vec![0, 2]);
    let header = rpmcache_lib::rpm::Header::parse(compat.header().build())?;
    let db = FileDb::from_headers(root.try_clone()?, [&header])?;
    assert_eq!(
        db.find_pkgs_for_file("/usr/lib64/libc.so.6")?,
        ["compat-1-1.x86_64"]
    );
    assert!(db.find_pkgs_for_file("/usr/share/compat/gone")?.is_empty());
    Ok(())
}

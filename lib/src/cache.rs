//! The package cache: one branch per imported package.
//!
//! Each imported package is committed under a branch derived from its
//! identity (see [`branch_name_for`]); the commit metadata carries the
//! package header verbatim so facts about the package can be recovered
//! later without the original file.

use std::collections::BTreeMap;

use anyhow::{anyhow, Context, Result};
use fn_error_context::context;

use crate::nevra::Nevra;
use crate::pkgmeta::PackageMeta;
use crate::refescape;
use crate::repo::Repo;
use crate::rpm::Header;

/// Prefix of every cache branch.
pub const BRANCH_PREFIX: &str = "rpmcache-";
/// Commit metadata key holding the hex encoded package header.
pub const HEADER_KEY: &str = "rpmcache.header";
/// Commit metadata key holding the package identity.
pub const NEVRA_KEY: &str = "rpmcache.nevra";

/// Compute the cache branch name for a package identity string.
///
/// ```rust
/// # fn test() -> anyhow::Result<()> {
/// use rpmcache_lib::cache::branch_name_for;
/// assert_eq!(branch_name_for("foo-1.0-1.noarch")?, "rpmcache-foo-1.0-1.noarch");
/// assert_eq!(branch_name_for("foo-1.0-1.x86_64")?, "rpmcache-foo-1.0-1.x86__64");
/// assert_eq!(branch_name_for("foo-2:1.0-1.x86_64")?, "rpmcache-foo-2_3A1.0-1.x86__64");
/// # Ok(())
/// # }
/// ```
pub fn branch_name_for(nevra: &str) -> Result<String> {
    refescape::prefix_escape_for_ref(BRANCH_PREFIX, nevra)
}

/// The cache key of a package: its identity including any epoch.
pub fn cache_key(nevra: &Nevra) -> String {
    nevra.to_string_with_epoch(true)
}

/// The cache branch for a package.
pub fn branch_for(nevra: &Nevra) -> Result<String> {
    branch_name_for(&cache_key(nevra))
}

/// Recover the package identity string from a cache branch name.
pub fn nevra_from_branch(branch: &str) -> Result<String> {
    refescape::unprefix_unescape_ref(BRANCH_PREFIX, branch)
}

/// Find the commit for a cached package.  A miss is not an error.
pub fn lookup(repo: &dyn Repo, nevra: &Nevra) -> Result<Option<String>> {
    repo.resolve_ref(&branch_for(nevra)?)
}

/// Record the package header in commit metadata.
pub fn record_header(metadata: &mut BTreeMap<String, String>, header: &[u8]) {
    metadata.insert(HEADER_KEY.to_string(), hex::encode(header));
}

/// Load the package header recorded in a cache commit.
#[context("Loading package header from {commit}")]
pub fn header_from_commit(repo: &dyn Repo, commit: &str) -> Result<Header> {
    let commit = repo.read_commit(commit)?;
    let blob = commit
        .metadata
        .get(HEADER_KEY)
        .ok_or_else(|| anyhow!("Missing {HEADER_KEY} in commit metadata"))?;
    let blob = hex::decode(blob).context("Decoding header")?;
    Ok(Header::parse(blob)?)
}

/// Load the header of a cached package, if it is cached.
pub fn find_pkg_header(repo: &dyn Repo, nevra: &Nevra) -> Result<Option<Header>> {
    lookup(repo, nevra)?
        .map(|commit| header_from_commit(repo, &commit))
        .transpose()
}

/// Derive [`PackageMeta`] for a cached package.
pub fn package_meta(repo: &dyn Repo, nevra: &Nevra) -> Result<Option<PackageMeta>> {
    Ok(find_pkg_header(repo, nevra)?
        .map(|h| PackageMeta::from_header(&h))
        .transpose()?)
}

/// All cached packages, as (identity, commit) pairs.
pub fn list_cached(repo: &dyn Repo) -> Result<Vec<(String, String)>> {
    repo.list_refs(BRANCH_PREFIX)?
        .into_iter()
        .map(|(branch, commit)| Ok((nevra_from_branch(&branch)?, commit)))
        .collect()
}

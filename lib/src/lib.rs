//! # RPM package import into a content-addressed tree store
//!
//! This crate takes RPM package files, extracts their payload together
//! with the ownership and file capability metadata carried only in the
//! package header, and commits the result into an object store as one
//! branch per package (see [`cache::branch_name_for`]).
//!
//! The store is abstracted behind the [`repo::Repo`] trait; [`repo::FsRepo`]
//! is a small on-disk implementation.  Packages can also be unpacked
//! directly into a directory; see [`unpack`].

// See https://doc.rust-lang.org/rustc/lints/listing/allowed-by-default.html
#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![forbid(unused_must_use)]
#![deny(unsafe_code)]
#![deny(clippy::dbg_macro)]
#![deny(clippy::todo)]

pub mod cache;
pub mod cli;
mod error;
pub use error::*;
pub mod filedb;
pub mod fscaps;
pub mod idmap;
pub mod importer;
pub mod mtree;
pub mod nevra;
pub mod overrides;
pub mod pkgmeta;
pub mod refescape;
pub mod relpath;
pub mod repo;
pub mod rpm;
pub mod tokio_util;
pub mod unpack;

#[cfg(feature = "internal-testing-api")]
pub mod fixture;

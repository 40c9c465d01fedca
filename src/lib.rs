//! basert - the process-level base runtime core.
//!
//! Four subsystems sit between the kernel and user programs:
//!
//! - a per-process [`heap`] backed by anonymous memory mappings,
//! - a dynamic image loader ([`ld_so`]) driven by an external image parser,
//! - a TLS manager ([`ld_so::tcb`]) producing per-thread control blocks,
//! - a locking layer ([`sync`]) built on the kernel wait/wake primitive.
//!
//! The kernel itself is an external collaborator reached through a single
//! numeric syscall gate ([`platform::gate`]); the executable-format parser is
//! another, reached through the [`ld_so::parser::ImageParser`] trait. Both are
//! installed at process start, which makes the whole runtime exercisable on a
//! development host through [`platform::host`].

#![cfg_attr(not(feature = "host"), no_std)]
#![allow(clippy::missing_safety_doc)]

extern crate alloc;

pub mod error;
pub mod heap;
pub mod ld_so;
pub mod platform;
pub mod start;
pub mod sync;

pub use error::{Error, Result};

//! # strata-vm
//!
//! Virtual-memory plumbing for the `strata` allocators.
//!
//! A [`VmProvider`] hands out page-aligned address ranges and changes their
//! backing (reserve, commit, decommit, release). A [`Region`] owns one such
//! reservation and does all the page accounting, so allocators above it only
//! ever ask for "at least N committed bytes".
//!
//! This is the only crate in the workspace that contains `unsafe` code.
#![warn(missing_docs)]

pub mod error;
pub mod heap;
pub mod os;
pub mod page;
pub mod provider;
pub mod region;

pub use error::VmError;
pub use heap::HeapVm;
pub use os::OsVm;
pub use page::page_size;
pub use provider::{heap_provider, os_provider, VmProvider};
pub use region::Region;

#![cfg_attr(not(feature = "std"), no_std)]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! Burn blob cache.
//!
//! Memoizes what is derived from a device-resident blob object: its header, its body, the
//! blob objects it was redistributed into and its host snapshots. Host snapshots are taken
//! by redistributing ("boxing") the blob onto a single canonical device first.

extern crate alloc;

mod blob;
mod boxing;
mod cache;
mod config;
mod error;
mod id;
mod local;
mod registry;
mod remote_blob;
mod runtime;
mod session;
mod snapshot;

pub mod sharding;

#[cfg(test)]
mod test_utils;

pub use blob::*;
pub use boxing::*;
pub use cache::*;
pub use config::*;
pub use error::*;
pub use id::*;
pub use local::*;
pub use registry::*;
pub use remote_blob::*;
pub use runtime::*;
pub use session::*;
pub use snapshot::*;

pub mod blockfile;
pub mod checklog;
pub mod checksum;
pub mod contentindex;
pub mod lock;
pub mod manifest;
pub mod objectstore;
pub mod storage;
pub mod sync;
pub mod verify;
pub mod wire;

pub use ebakup_types::cid::Cid;
pub use ebakup_types::error::{EbakupError, Result};
pub use ebakup_types::name::SnapshotName;

#[cfg(test)]
mod tests;
#[cfg(test)]
mod testutil;

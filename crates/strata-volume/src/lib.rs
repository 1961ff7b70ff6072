//! Append-only volume store
//!
//! A volume is a flat file of concatenated object bytes. Uploads reserve a
//! region, stream chunks into it with positional writes, and seal it with a
//! commit; committed regions are immutable. Each volume carries a sidecar
//! index of committed regions that is replayed on open for crash recovery.

mod index;
mod store;

pub use index::IndexRecord;
pub use store::{CommittedRegion, VolumeStore};

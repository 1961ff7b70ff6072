//! Volume catalog and region lifecycle
//!
//! Lock order is catalog before volume state, and neither lock is held
//! across file I/O apart from the index append inside commit (which is the
//! commit barrier itself).

use crate::index::{self, IndexRecord};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use strata_common::{Error, Result, MAX_READ_SIZE};
use tracing::{debug, info, warn};

/// A committed region inside a volume.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CommittedRegion {
    pub volume_id: u64,
    pub offset: u64,
    pub size: u64,
}

/// An in-flight reservation for one upload id.
#[derive(Clone, Debug)]
struct Reservation {
    volume_id: u64,
    offset: u64,
    /// Bytes written so far: max over puts of (chunk offset + chunk len)
    high_watermark: u64,
    /// Reserved length when the caller knew the size up front. `None`
    /// means the region is open-ended and the volume is exclusive to it.
    reserved_len: Option<u64>,
}

struct Volume {
    id: u64,
    file: File,
    state: Mutex<VolumeState>,
}

/// Space released by an abort, reusable by a later size-known reservation
/// until a commit fixes the tail past it.
#[derive(Clone, Copy, Debug)]
struct Hole {
    offset: u64,
    len: u64,
}

struct VolumeState {
    /// Everything below this offset is committed and immutable
    tail: u64,
    /// Next reservation offset; >= tail while size-known regions are pending
    pending_tail: u64,
    /// An open-ended reservation holds the volume exclusively
    busy: bool,
    /// offset -> size of committed regions
    committed: BTreeMap<u64, u64>,
    /// Aborted regions still eligible for reuse
    holes: Vec<Hole>,
    index: File,
}

struct Catalog {
    volumes: BTreeMap<u64, Arc<Volume>>,
    reservations: HashMap<String, Reservation>,
    next_volume_id: u64,
}

/// The store: a directory of volumes plus the reservation table.
pub struct VolumeStore {
    root: PathBuf,
    max_volume_bytes: u64,
    catalog: Mutex<Catalog>,
}

impl VolumeStore {
    /// Open the store rooted at `root`, replaying every volume's sidecar
    /// index. Regions that never committed are not recovered; their bytes
    /// are overwritten by later reservations.
    pub fn open(root: impl AsRef<Path>, max_volume_bytes: u64) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;

        let mut volumes = BTreeMap::new();
        let mut next_volume_id = 0u64;

        for entry in std::fs::read_dir(&root)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(id) = name.to_str().and_then(|n| n.parse::<u64>().ok()) else {
                continue;
            };

            let data_path = entry.path();
            let index_path = root.join(format!("{id}.idx"));
            let file = OpenOptions::new().read(true).write(true).open(&data_path)?;
            let mut committed = BTreeMap::new();
            let mut tail = 0u64;
            if index_path.exists() {
                for record in index::replay(&index_path)? {
                    tail = tail.max(record.offset + record.size);
                    committed.insert(record.offset, record.size);
                }
            }
            let index = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&index_path)?;

            debug!(volume = id, tail, regions = committed.len(), "recovered volume");
            next_volume_id = next_volume_id.max(id + 1);
            volumes.insert(
                id,
                Arc::new(Volume {
                    id,
                    file,
                    state: Mutex::new(VolumeState {
                        tail,
                        pending_tail: tail,
                        busy: false,
                        committed,
                        holes: Vec::new(),
                        index,
                    }),
                }),
            );
        }

        info!(root = %root.display(), volumes = volumes.len(), "volume store opened");
        Ok(Self {
            root,
            max_volume_bytes,
            catalog: Mutex::new(Catalog {
                volumes,
                reservations: HashMap::new(),
                next_volume_id,
            }),
        })
    }

    /// Reserve a pending region for `id`. Idempotent: re-reserving an id
    /// returns the existing region. Open-ended reservations (no size hint)
    /// take the chosen volume exclusively until commit or abort.
    pub fn reserve(&self, id: &str, size_hint: Option<u64>) -> Result<(u64, u64)> {
        let mut catalog = self.catalog.lock();

        if let Some(existing) = catalog.reservations.get(id) {
            return Ok((existing.volume_id, existing.offset));
        }

        // Size-known regions may fill a hole left by an abort instead of
        // extending a volume.
        if let Some(len) = size_hint {
            if let Some((volume_id, offset)) = take_hole(&mut catalog, len) {
                catalog.reservations.insert(
                    id.to_string(),
                    Reservation {
                        volume_id,
                        offset,
                        high_watermark: 0,
                        reserved_len: Some(len),
                    },
                );
                debug!(id, volume = volume_id, offset, "reserved region from hole");
                return Ok((volume_id, offset));
            }
        }

        let volume = self.pick_volume(&mut catalog, size_hint)?;
        let offset = {
            let mut state = volume.state.lock();
            let offset = state.pending_tail;
            match size_hint {
                Some(len) => state.pending_tail += len,
                None => state.busy = true,
            }
            offset
        };

        catalog.reservations.insert(
            id.to_string(),
            Reservation {
                volume_id: volume.id,
                offset,
                high_watermark: 0,
                reserved_len: size_hint,
            },
        );
        debug!(id, volume = volume.id, offset, "reserved region");
        Ok((volume.id, offset))
    }

    /// Write one chunk at `chunk_offset` within the upload's region.
    /// Overlapping writes within the same upload are last-writer-wins.
    pub fn write_at(&self, id: &str, chunk_offset: u64, data: &[u8]) -> Result<()> {
        let (volume, base, reserved_len) = {
            let catalog = self.catalog.lock();
            let reservation = catalog
                .reservations
                .get(id)
                .ok_or_else(|| Error::invalid_argument(format!("unknown upload id: {id}")))?;
            let volume = catalog
                .volumes
                .get(&reservation.volume_id)
                .cloned()
                .ok_or_else(|| Error::internal("reservation points at missing volume"))?;
            (volume, reservation.offset, reservation.reserved_len)
        };

        let end = chunk_offset + data.len() as u64;
        if let Some(len) = reserved_len {
            if end > len {
                return Err(Error::invalid_argument(format!(
                    "write past reserved region: {end} > {len}"
                )));
            }
        }

        volume.file.write_all_at(data, base + chunk_offset)?;

        let mut catalog = self.catalog.lock();
        if let Some(reservation) = catalog.reservations.get_mut(id) {
            reservation.high_watermark = reservation.high_watermark.max(end);
        }
        Ok(())
    }

    /// Seal the upload's region. Data is fsynced before the commit record
    /// is appended to the sidecar index, so a region that acknowledged a
    /// commit survives a crash. Returns (volume_id, offset, size).
    pub fn commit(&self, id: &str) -> Result<CommittedRegion> {
        let (volume, reservation) = {
            let catalog = self.catalog.lock();
            let reservation = catalog
                .reservations
                .get(id)
                .cloned()
                .ok_or_else(|| Error::invalid_argument(format!("unknown upload id: {id}")))?;
            let volume = catalog
                .volumes
                .get(&reservation.volume_id)
                .cloned()
                .ok_or_else(|| Error::internal("reservation points at missing volume"))?;
            (volume, reservation)
        };

        let size = reservation.high_watermark;
        volume.file.sync_all()?;

        {
            let mut state = volume.state.lock();
            index::append(
                &mut state.index,
                &IndexRecord {
                    id: id.to_string(),
                    offset: reservation.offset,
                    size,
                },
            )?;
            state.committed.insert(reservation.offset, size);
            state.tail = state.tail.max(reservation.offset + size);
            state.pending_tail = state.pending_tail.max(state.tail);
            if reservation.reserved_len.is_none() {
                state.busy = false;
            }
            // A tail fixed past an aborted region forfeits it.
            let tail = state.tail;
            state.holes.retain(|hole| hole.offset >= tail);
        }

        self.catalog.lock().reservations.remove(id);
        debug!(id, volume = volume.id, offset = reservation.offset, size, "committed region");
        Ok(CommittedRegion {
            volume_id: volume.id,
            offset: reservation.offset,
            size,
        })
    }

    /// Release a reservation. The space is reused only when no later
    /// commit on the volume already fixed the tail past it; otherwise it
    /// is permanently lost.
    pub fn abort(&self, id: &str) -> Result<()> {
        let (volume, reservation) = {
            let mut catalog = self.catalog.lock();
            let reservation = catalog
                .reservations
                .remove(id)
                .ok_or_else(|| Error::invalid_argument(format!("unknown upload id: {id}")))?;
            let volume = catalog
                .volumes
                .get(&reservation.volume_id)
                .cloned()
                .ok_or_else(|| Error::internal("reservation points at missing volume"))?;
            (volume, reservation)
        };

        let mut state = volume.state.lock();
        if reservation.reserved_len.is_none() {
            // An open-ended region blocked every later reservation, so the
            // pending tail still sits at its start and the space is reused
            // by the next reserve.
            state.busy = false;
            state.pending_tail = state.pending_tail.min(reservation.offset).max(state.tail);
            debug!(id, volume = volume.id, offset = reservation.offset, "aborted, space reclaimed");
            return Ok(());
        }

        // Reuse is forfeit only once a commit has fixed the tail past the
        // region; merely-reserved neighbors do not pin it.
        let len = reservation.reserved_len.unwrap_or(0);
        if state.tail > reservation.offset {
            warn!(id, volume = volume.id, offset = reservation.offset, "aborted, space lost");
        } else if state.pending_tail == reservation.offset + len {
            state.pending_tail = reservation.offset;
            debug!(id, volume = volume.id, offset = reservation.offset, "aborted, space reclaimed");
        } else {
            state.holes.push(Hole {
                offset: reservation.offset,
                len,
            });
            debug!(id, volume = volume.id, offset = reservation.offset, len, "aborted, region reusable");
        }
        Ok(())
    }

    /// Read from a committed region, starting `start` bytes into it.
    /// Reads are bounded to `MAX_READ_SIZE`; a start past the region end
    /// yields an empty body.
    pub fn read(&self, volume_id: u64, offset: u64, start: u64) -> Result<Vec<u8>> {
        let volume = self
            .catalog
            .lock()
            .volumes
            .get(&volume_id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("unknown volume: {volume_id}")))?;

        let size = {
            let state = volume.state.lock();
            *state
                .committed
                .get(&offset)
                .ok_or_else(|| Error::not_found(format!("no committed region at offset {offset}")))?
        };

        if start >= size {
            return Ok(Vec::new());
        }
        let len = (size - start).min(MAX_READ_SIZE) as usize;
        let mut body = vec![0u8; len];
        volume.file.read_exact_at(&mut body, offset + start)?;
        Ok(body)
    }

    /// Number of live volumes (diagnostic).
    pub fn volume_count(&self) -> usize {
        self.catalog.lock().volumes.len()
    }

    /// Pick a volume with room for a new reservation, rolling over to a
    /// fresh volume when every candidate is exclusive or full.
    fn pick_volume(&self, catalog: &mut Catalog, size_hint: Option<u64>) -> Result<Arc<Volume>> {
        for volume in catalog.volumes.values() {
            let state = volume.state.lock();
            if state.busy {
                continue;
            }
            if state.pending_tail >= self.max_volume_bytes {
                continue;
            }
            // A region larger than the rollover threshold is allowed only
            // at the start of an empty volume.
            if let Some(len) = size_hint {
                if state.pending_tail + len > self.max_volume_bytes && state.pending_tail > 0 {
                    continue;
                }
            }
            return Ok(volume.clone());
        }

        let id = catalog.next_volume_id;
        catalog.next_volume_id += 1;
        let data_path = self.root.join(id.to_string());
        let index_path = self.root.join(format!("{id}.idx"));
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&data_path)?;
        let index = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&index_path)?;

        info!(volume = id, path = %data_path.display(), "allocated volume");
        let volume = Arc::new(Volume {
            id,
            file,
            state: Mutex::new(VolumeState {
                tail: 0,
                pending_tail: 0,
                busy: false,
                committed: BTreeMap::new(),
                holes: Vec::new(),
                index,
            }),
        });
        catalog.volumes.insert(id, volume.clone());
        Ok(volume)
    }
}

/// First-fit scan over aborted regions. Hands out the front of the first
/// hole large enough, leaving any remainder available.
fn take_hole(catalog: &mut Catalog, len: u64) -> Option<(u64, u64)> {
    for volume in catalog.volumes.values() {
        let mut state = volume.state.lock();
        if state.busy {
            continue;
        }
        if let Some(position) = state.holes.iter().position(|hole| hole.len >= len) {
            let hole = &mut state.holes[position];
            let offset = hole.offset;
            hole.offset += len;
            hole.len -= len;
            if hole.len == 0 {
                state.holes.remove(position);
            }
            return Some((volume.id, offset));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store(dir: &Path, max: u64) -> VolumeStore {
        VolumeStore::open(dir, max).unwrap()
    }

    #[test]
    fn test_reserve_write_commit_read() {
        let dir = tempdir().unwrap();
        let store = store(dir.path(), 1 << 20);

        let (volume_id, offset) = store.reserve("u1", None).unwrap();
        store.write_at("u1", 0, b"HELLO").unwrap();
        let region = store.commit("u1").unwrap();
        assert_eq!(region.volume_id, volume_id);
        assert_eq!(region.offset, offset);
        assert_eq!(region.size, 5);

        assert_eq!(store.read(volume_id, offset, 0).unwrap(), b"HELLO");
        assert_eq!(store.read(volume_id, offset, 2).unwrap(), b"LLO");
        assert!(store.read(volume_id, offset, 5).unwrap().is_empty());
    }

    #[test]
    fn test_out_of_order_chunks() {
        let dir = tempdir().unwrap();
        let store = store(dir.path(), 1 << 20);

        store.reserve("u1", None).unwrap();
        store.write_at("u1", 5, b"WORLD").unwrap();
        store.write_at("u1", 0, b"HELLO").unwrap();
        let region = store.commit("u1").unwrap();
        assert_eq!(region.size, 10);
        assert_eq!(
            store.read(region.volume_id, region.offset, 0).unwrap(),
            b"HELLOWORLD"
        );
    }

    #[test]
    fn test_overlapping_writes_last_wins() {
        let dir = tempdir().unwrap();
        let store = store(dir.path(), 1 << 20);

        store.reserve("u1", None).unwrap();
        store.write_at("u1", 0, b"AAAA").unwrap();
        store.write_at("u1", 0, b"BB").unwrap();
        let region = store.commit("u1").unwrap();
        assert_eq!(region.size, 4);
        assert_eq!(store.read(region.volume_id, region.offset, 0).unwrap(), b"BBAA");
    }

    #[test]
    fn test_zero_byte_commit() {
        let dir = tempdir().unwrap();
        let store = store(dir.path(), 1 << 20);

        store.reserve("u1", None).unwrap();
        let region = store.commit("u1").unwrap();
        assert_eq!(region.size, 0);
        assert!(store.read(region.volume_id, region.offset, 0).unwrap().is_empty());
    }

    #[test]
    fn test_reserve_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = store(dir.path(), 1 << 20);

        let first = store.reserve("u1", None).unwrap();
        let second = store.reserve("u1", None).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_open_ended_reservations_use_distinct_volumes() {
        let dir = tempdir().unwrap();
        let store = store(dir.path(), 1 << 20);

        let (v1, _) = store.reserve("u1", None).unwrap();
        let (v2, _) = store.reserve("u2", None).unwrap();
        assert_ne!(v1, v2);

        store.write_at("u1", 0, b"one").unwrap();
        store.write_at("u2", 0, b"two").unwrap();
        let r1 = store.commit("u1").unwrap();
        let r2 = store.commit("u2").unwrap();
        assert_eq!(store.read(r1.volume_id, r1.offset, 0).unwrap(), b"one");
        assert_eq!(store.read(r2.volume_id, r2.offset, 0).unwrap(), b"two");
    }

    #[test]
    fn test_volume_reused_after_commit() {
        let dir = tempdir().unwrap();
        let store = store(dir.path(), 1 << 20);

        let (v1, _) = store.reserve("u1", None).unwrap();
        store.write_at("u1", 0, b"first").unwrap();
        let r1 = store.commit("u1").unwrap();

        let (v2, offset2) = store.reserve("u2", None).unwrap();
        assert_eq!(v1, v2);
        assert_eq!(offset2, r1.offset + r1.size);
    }

    #[test]
    fn test_rollover_by_size() {
        let dir = tempdir().unwrap();
        let store = store(dir.path(), 8);

        store.reserve("u1", None).unwrap();
        store.write_at("u1", 0, b"0123456789").unwrap();
        let r1 = store.commit("u1").unwrap();
        assert_eq!(r1.volume_id, 0);

        // First volume's tail is past the threshold, so the next
        // reservation rolls over.
        let (v2, offset2) = store.reserve("u2", None).unwrap();
        assert_eq!(v2, 1);
        assert_eq!(offset2, 0);
    }

    #[test]
    fn test_abort_reclaims_when_no_later_commit() {
        let dir = tempdir().unwrap();
        let store = store(dir.path(), 1 << 20);

        let (v1, offset1) = store.reserve("u1", None).unwrap();
        store.write_at("u1", 0, b"scrap").unwrap();
        store.abort("u1").unwrap();

        let (v2, offset2) = store.reserve("u2", None).unwrap();
        assert_eq!(v1, v2);
        assert_eq!(offset1, offset2);
    }

    #[test]
    fn test_abort_loses_space_after_later_commit() {
        let dir = tempdir().unwrap();
        let store = store(dir.path(), 1 << 20);

        // Two size-known regions stacked on the same volume.
        let (v1, o1) = store.reserve("a", Some(10)).unwrap();
        let (v2, o2) = store.reserve("b", Some(10)).unwrap();
        assert_eq!(v1, v2);
        assert_eq!(o2, o1 + 10);

        store.write_at("b", 0, b"0123456789").unwrap();
        store.commit("b").unwrap();

        // The later commit fixed the tail past region "a".
        store.abort("a").unwrap();
        let (v3, o3) = store.reserve("c", Some(4)).unwrap();
        assert_eq!(v3, v1);
        assert_eq!(o3, o2 + 10);
    }

    #[test]
    fn test_abort_reclaims_despite_later_uncommitted_reservation() {
        let dir = tempdir().unwrap();
        let store = store(dir.path(), 1 << 20);

        let (v1, o1) = store.reserve("a", Some(10)).unwrap();
        let (v2, o2) = store.reserve("b", Some(10)).unwrap();
        assert_eq!(v1, v2);
        assert_eq!(o2, o1 + 10);

        // "b" is only reserved, never committed: aborting "a" must still
        // release its region.
        store.abort("a").unwrap();
        let (v3, o3) = store.reserve("c", Some(10)).unwrap();
        assert_eq!(v3, v1);
        assert_eq!(o3, o1);

        store.write_at("b", 0, b"0123456789").unwrap();
        store.write_at("c", 0, b"abcdefghij").unwrap();
        let rb = store.commit("b").unwrap();
        let rc = store.commit("c").unwrap();
        assert_eq!(store.read(rb.volume_id, rb.offset, 0).unwrap(), b"0123456789");
        assert_eq!(store.read(rc.volume_id, rc.offset, 0).unwrap(), b"abcdefghij");
    }

    #[test]
    fn test_hole_forfeited_by_later_commit() {
        let dir = tempdir().unwrap();
        let store = store(dir.path(), 1 << 20);

        let (v1, o1) = store.reserve("a", Some(10)).unwrap();
        let (_, o2) = store.reserve("b", Some(10)).unwrap();
        store.abort("a").unwrap();

        // The commit of "b" fixes the tail past the aborted region.
        store.write_at("b", 0, b"0123456789").unwrap();
        store.commit("b").unwrap();

        let (v3, o3) = store.reserve("c", Some(10)).unwrap();
        assert_eq!(v3, v1);
        assert_eq!(o3, o2 + 10);
        assert_ne!(o3, o1);
    }

    #[test]
    fn test_hole_filled_piecewise() {
        let dir = tempdir().unwrap();
        let store = store(dir.path(), 1 << 20);

        let (v1, o1) = store.reserve("a", Some(10)).unwrap();
        store.reserve("b", Some(10)).unwrap();
        store.abort("a").unwrap();

        let (v2, o2) = store.reserve("c", Some(4)).unwrap();
        let (v3, o3) = store.reserve("d", Some(6)).unwrap();
        assert_eq!(v2, v1);
        assert_eq!(v3, v1);
        assert_eq!(o2, o1);
        assert_eq!(o3, o1 + 4);
    }

    #[test]
    fn test_size_known_write_cannot_cross_region() {
        let dir = tempdir().unwrap();
        let store = store(dir.path(), 1 << 20);

        store.reserve("a", Some(4)).unwrap();
        store.reserve("b", Some(4)).unwrap();
        let result = store.write_at("a", 2, b"xxxx");
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_unknown_id_errors() {
        let dir = tempdir().unwrap();
        let store = store(dir.path(), 1 << 20);

        assert!(matches!(store.write_at("nope", 0, b"x"), Err(Error::InvalidArgument(_))));
        assert!(matches!(store.commit("nope"), Err(Error::InvalidArgument(_))));
        assert!(matches!(store.abort("nope"), Err(Error::InvalidArgument(_))));
        assert!(store.read(0, 0, 0).is_err());
    }

    #[test]
    fn test_recovery_replays_committed_regions() {
        let dir = tempdir().unwrap();
        let (region_a, region_b) = {
            let store = store(dir.path(), 1 << 20);
            store.reserve("a", None).unwrap();
            store.write_at("a", 0, b"alpha").unwrap();
            let a = store.commit("a").unwrap();
            store.reserve("b", None).unwrap();
            store.write_at("b", 0, b"bravo!").unwrap();
            let b = store.commit("b").unwrap();
            // A pending upload that never commits is lost on restart.
            store.reserve("lost", None).unwrap();
            store.write_at("lost", 0, b"junk").unwrap();
            (a, b)
        };

        let store = store(dir.path(), 1 << 20);
        assert_eq!(
            store.read(region_a.volume_id, region_a.offset, 0).unwrap(),
            b"alpha"
        );
        assert_eq!(
            store.read(region_b.volume_id, region_b.offset, 0).unwrap(),
            b"bravo!"
        );

        // A fresh reservation on the recovered volume lands past its tail.
        let (volume_id, offset) = store.reserve("c", None).unwrap();
        if volume_id == region_b.volume_id {
            assert!(offset >= region_b.offset + region_b.size);
        }
    }
}

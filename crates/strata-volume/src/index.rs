//! Sidecar commit index
//!
//! One JSON line per committed region, appended and fsynced inside commit
//! after the data fsync. Replaying the index on open rebuilds the committed
//! region map and the volume tail; pending regions are deliberately absent,
//! so an interrupted upload simply never happened.

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use strata_common::Result;

/// One committed region: the upload that produced it and its extent.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IndexRecord {
    pub id: String,
    pub offset: u64,
    pub size: u64,
}

/// Append one record and flush it to stable storage.
pub fn append(index: &mut File, record: &IndexRecord) -> Result<()> {
    let mut line = serde_json::to_string(record)
        .map_err(|e| strata_common::Error::internal(format!("index encode: {e}")))?;
    line.push('\n');
    index.write_all(line.as_bytes())?;
    index.sync_all()?;
    Ok(())
}

/// Replay every record in an index file. Trailing garbage from a torn
/// write is skipped: the region it described never acknowledged a commit.
pub fn replay(path: &Path) -> Result<Vec<IndexRecord>> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let mut records = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<IndexRecord>(&line) {
            Ok(record) => records.push(record),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "skipping torn index line");
            }
        }
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;

    #[test]
    fn test_append_and_replay() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("0.idx");
        let mut index = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .unwrap();

        append(
            &mut index,
            &IndexRecord {
                id: "u1".into(),
                offset: 0,
                size: 5,
            },
        )
        .unwrap();
        append(
            &mut index,
            &IndexRecord {
                id: "u2".into(),
                offset: 5,
                size: 11,
            },
        )
        .unwrap();

        let records = replay(&path).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].id, "u1");
        assert_eq!(records[1].offset, 5);
        assert_eq!(records[1].size, 11);
    }

    #[test]
    fn test_replay_skips_torn_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("1.idx");
        std::fs::write(
            &path,
            "{\"id\":\"u1\",\"offset\":0,\"size\":4}\n{\"id\":\"u2\",\"off",
        )
        .unwrap();

        let records = replay(&path).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, "u1");
    }
}

//! Compressed on-disk captures of the CIB document.
//!
//! When the scheduler dies mid-computation, the controller saves the exact
//! input it was chewing on so the crash can be reproduced offline. Snapshots
//! are bzip2-compressed JSON; the file name carries the incident correlation
//! id, so operators can pair a snapshot with the log line that announced it.

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use bzip2::read::BzDecoder;
use bzip2::write::BzEncoder;
use bzip2::Compression;
use tracing::debug;

use crate::document::CibDocument;
use crate::error::{CibError, CibResult};

/// Serialize `doc` and write it bzip2-compressed to `path`, creating parent
/// directories as needed.
pub fn write_compressed(doc: &CibDocument, path: &Path) -> CibResult<()> {
    let bytes =
        serde_json::to_vec_pretty(doc).map_err(|e| CibError::Serialize(e.to_string()))?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = File::create(path)?;
    let mut encoder = BzEncoder::new(file, Compression::default());
    encoder.write_all(&bytes)?;
    encoder.finish()?;
    debug!(path = %path.display(), raw_bytes = bytes.len(), "cluster state snapshot written");
    Ok(())
}

/// Read a snapshot written by [`write_compressed`].
pub fn read_compressed(path: &Path) -> CibResult<CibDocument> {
    let file = File::open(path)?;
    let mut decoder = BzDecoder::new(file);
    let mut bytes = Vec::new();
    decoder.read_to_end(&mut bytes)?;
    serde_json::from_slice(&bytes).map_err(|e| CibError::Serialize(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{CibNode, Configuration};

    fn sample() -> CibDocument {
        let mut doc = CibDocument {
            epoch: 9,
            num_updates: 42,
            configuration: Configuration {
                crm_config: Vec::new(),
                nodes: vec![CibNode {
                    id: "1".into(),
                    uname: "grid-a".into(),
                }],
            },
            ..CibDocument::default()
        };
        doc.set_attr("dc-uuid", "grid-a");
        doc
    }

    #[test]
    fn snapshots_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pe-core-test.bz2");

        write_compressed(&sample(), &path).unwrap();
        let back = read_compressed(&path).unwrap();
        assert_eq!(back, sample());
    }

    #[test]
    fn snapshots_are_bzip2_streams() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pe-core-magic.bz2");
        write_compressed(&sample(), &path).unwrap();

        let mut magic = [0u8; 3];
        File::open(&path).unwrap().read_exact(&mut magic).unwrap();
        assert_eq!(&magic, b"BZh");
    }

    #[test]
    fn missing_parent_directories_are_created() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state/snapshots/pe-core-deep.bz2");
        write_compressed(&sample(), &path).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn read_of_missing_snapshot_fails_with_io() {
        let dir = tempfile::tempdir().unwrap();
        let err = read_compressed(&dir.path().join("absent.bz2")).unwrap_err();
        assert!(matches!(err, CibError::Io(_)));
    }
}

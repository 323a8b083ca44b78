//! Append-only changeset journal.
//!
//! File layout: `MAGIC (8) | schema version (u32 LE)` followed by one frame
//! per commit: `payload length (u32 LE) | crc32 (u32 LE) | JSON changeset`.
//! A frame is durable once `sync_data` returns, so a crash can leave at most
//! one torn frame at the tail, which is cut off on the next open.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use bytes::{Buf, BufMut, BytesMut};
use log::{error, info, warn};

use crate::error::StoreError;
use crate::store::{ChangeSet, Database, SharedDatabase};

pub const DEFAULT_JOURNAL_PATH: &str = "event_journal.dat";
pub const JOURNAL_MAGIC: &[u8; 8] = b"NFTEVJNL";

/// v1: marketplace stores only. v2: adds the persona stores.
pub const SCHEMA_VERSION: u32 = 2;

const HEADER_LEN: usize = JOURNAL_MAGIC.len() + 4;
const FRAME_HEADER_LEN: usize = 8;
const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Everything recovered from an existing journal on open.
#[derive(Debug, Default)]
pub struct Recovered {
    pub changesets: Vec<ChangeSet>,
    pub found_schema: u32,
    pub discarded_bytes: u64,
}

#[derive(Debug)]
pub struct Journal {
    file: File,
    path: PathBuf,
    len: u64,
    /// Set when a failed append could not be rolled back.
    poisoned: Option<String>,
}

impl Journal {
    /// Opens (or creates) a journal and returns every complete changeset.
    pub fn open(path: impl AsRef<Path>) -> Result<(Self, Recovered), StoreError> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;

        if buf.is_empty() {
            let mut header = BytesMut::with_capacity(HEADER_LEN);
            header.put_slice(JOURNAL_MAGIC);
            header.put_u32_le(SCHEMA_VERSION);
            file.write_all(&header)?;
            file.sync_all()?;
            info!("[JOURNAL] Created {} (schema v{})", path.display(), SCHEMA_VERSION);

            let journal = Self {
                file,
                path,
                len: HEADER_LEN as u64,
                poisoned: None,
            };
            let recovered = Recovered {
                found_schema: SCHEMA_VERSION,
                ..Recovered::default()
            };
            return Ok((journal, recovered));
        }

        if buf.len() < HEADER_LEN || &buf[..JOURNAL_MAGIC.len()] != JOURNAL_MAGIC {
            return Err(StoreError::Corrupted(format!(
                "{} is not an event journal",
                path.display()
            )));
        }

        let found_schema = (&buf[JOURNAL_MAGIC.len()..HEADER_LEN]).get_u32_le();
        if found_schema > SCHEMA_VERSION {
            return Err(StoreError::UnsupportedSchema {
                found: found_schema,
                supported: SCHEMA_VERSION,
            });
        }

        let (changesets, consumed) = decode_frames(&buf[HEADER_LEN..], found_schema)?;
        let valid_len = (HEADER_LEN + consumed) as u64;
        let discarded_bytes = buf.len() as u64 - valid_len;

        if discarded_bytes > 0 {
            warn!(
                "[JOURNAL] Discarding torn tail of {} bytes in {}",
                discarded_bytes,
                path.display()
            );
            file.set_len(valid_len)?;
            file.sync_all()?;
        }

        if found_schema < SCHEMA_VERSION {
            file.seek(SeekFrom::Start(JOURNAL_MAGIC.len() as u64))?;
            file.write_all(&SCHEMA_VERSION.to_le_bytes())?;
            file.sync_all()?;
            info!(
                "[JOURNAL] Upgraded {} from schema v{} to v{}",
                path.display(),
                found_schema,
                SCHEMA_VERSION
            );
        }

        file.seek(SeekFrom::Start(valid_len))?;
        info!(
            "[JOURNAL] Opened {}: {} changesets",
            path.display(),
            changesets.len()
        );

        let journal = Self {
            file,
            path,
            len: valid_len,
            poisoned: None,
        };
        let recovered = Recovered {
            changesets,
            found_schema,
            discarded_bytes,
        };
        Ok((journal, recovered))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned.is_some()
    }

    /// Appends one changeset as a single frame and syncs it to disk.
    ///
    /// On failure the file is cut back to its previous length so a later
    /// append never lands behind a half-written frame. If that cut fails too,
    /// the journal refuses every further append.
    pub fn append(&mut self, changeset: &ChangeSet) -> Result<(), StoreError> {
        if let Some(reason) = &self.poisoned {
            return Err(StoreError::JournalPoisoned(reason.clone()));
        }
        let frame = encode_frame(changeset)?;

        let written = self
            .file
            .write_all(&frame)
            .and_then(|_| self.file.sync_data());

        if let Err(e) = written {
            warn!("[JOURNAL] Append of changeset #{} failed: {}", changeset.seq, e);
            let rollback = self
                .file
                .set_len(self.len)
                .and_then(|_| self.file.seek(SeekFrom::Start(self.len)));
            if let Err(cut) = rollback {
                error!(
                    "[JOURNAL] Cannot cut {} back to {} bytes: {}",
                    self.path.display(),
                    self.len,
                    cut
                );
                self.poisoned = Some(format!(
                    "append of changeset #{} failed ({}) and rollback failed ({})",
                    changeset.seq, e, cut
                ));
            }
            return Err(e.into());
        }

        self.len += frame.len() as u64;
        Ok(())
    }
}

fn encode_frame(changeset: &ChangeSet) -> Result<BytesMut, StoreError> {
    let payload = serde_json::to_vec(changeset)?;
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|len| (*len as usize) <= MAX_FRAME_LEN)
        .ok_or_else(|| {
            StoreError::Corrupted(format!("changeset of {} bytes is too large", payload.len()))
        })?;

    let mut frame = BytesMut::with_capacity(FRAME_HEADER_LEN + payload.len());
    frame.put_u32_le(len);
    frame.put_u32_le(crc32fast::hash(&payload));
    frame.put_slice(&payload);
    Ok(frame)
}

/// Decodes frames until the data ends or a torn frame is found at the tail.
///
/// Returns the changesets and the number of bytes they occupy. A bad frame
/// followed by more data is corruption, not a torn write.
fn decode_frames(data: &[u8], schema: u32) -> Result<(Vec<ChangeSet>, usize), StoreError> {
    let mut changesets = Vec::new();
    let mut rest = data;
    let mut consumed = 0usize;

    while rest.remaining() >= FRAME_HEADER_LEN {
        let mut header = &rest[..FRAME_HEADER_LEN];
        let len = header.get_u32_le() as usize;
        let crc = header.get_u32_le();

        if len > MAX_FRAME_LEN {
            return Err(StoreError::Corrupted(format!(
                "frame at offset {} claims {} bytes",
                HEADER_LEN + consumed,
                len
            )));
        }

        let frame_len = FRAME_HEADER_LEN + len;
        if rest.len() < frame_len {
            break;
        }

        let payload = &rest[FRAME_HEADER_LEN..frame_len];
        if crc32fast::hash(payload) != crc {
            if rest.len() == frame_len {
                break;
            }
            return Err(StoreError::Corrupted(format!(
                "checksum mismatch at offset {}",
                HEADER_LEN + consumed
            )));
        }

        let changeset: ChangeSet = serde_json::from_slice(payload)?;
        if let Some(record) = changeset
            .inserts
            .iter()
            .find(|r| r.store().since_schema() > schema)
        {
            return Err(StoreError::Corrupted(format!(
                "{} record in a schema v{} journal",
                record.store(),
                schema
            )));
        }

        changesets.push(changeset);
        rest.advance(frame_len);
        consumed += frame_len;
    }

    Ok((changesets, consumed))
}

/// Opens the journal-backed database at `path`, replaying every commit.
pub fn open_database(path: impl AsRef<Path>, genesis_height: u64) -> Result<SharedDatabase, StoreError> {
    let db = Database::open(path, genesis_height)?;
    Ok(Arc::new(RwLock::new(db)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Address, EventPayload, EventRecord, PrimaryKey, StoreName, Transfer, Word};

    fn changeset(seq: u64, height: u64) -> ChangeSet {
        ChangeSet {
            seq,
            inserts: vec![EventRecord::new(
                PrimaryKey::new(height, 0, 0),
                Word::ZERO,
                EventPayload::Transfer(Transfer {
                    contract: Address::repeat_byte(9),
                    operator: Address::repeat_byte(1),
                    from: Address::ZERO,
                    to: Address::repeat_byte(1),
                    id: Word::from_u64(height),
                    value: 1,
                }),
            )],
            derived: Vec::new(),
            checkpoints: vec![(StoreName::Transfer, height)],
        }
    }

    #[test]
    fn append_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.dat");

        {
            let (mut journal, recovered) = Journal::open(&path).unwrap();
            assert!(recovered.changesets.is_empty());
            journal.append(&changeset(1, 10)).unwrap();
            journal.append(&changeset(2, 20)).unwrap();
        }

        let (_, recovered) = Journal::open(&path).unwrap();
        assert_eq!(recovered.changesets.len(), 2);
        assert_eq!(recovered.changesets[1].seq, 2);
        assert_eq!(recovered.discarded_bytes, 0);
    }

    #[test]
    fn torn_tail_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.dat");

        {
            let (mut journal, _) = Journal::open(&path).unwrap();
            journal.append(&changeset(1, 10)).unwrap();
        }
        let full_len = std::fs::metadata(&path).unwrap().len();

        // Half of a second frame, as a crash mid-write would leave it.
        let frame = encode_frame(&changeset(2, 20)).unwrap();
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&frame[..frame.len() / 2]).unwrap();
        drop(file);

        let (mut journal, recovered) = Journal::open(&path).unwrap();
        assert_eq!(recovered.changesets.len(), 1);
        assert!(recovered.discarded_bytes > 0);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), full_len);

        // Appends continue cleanly after the cut.
        journal.append(&changeset(2, 20)).unwrap();
        drop(journal);
        let (_, recovered) = Journal::open(&path).unwrap();
        assert_eq!(recovered.changesets.len(), 2);
    }

    #[test]
    fn corrupted_middle_frame_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.dat");

        {
            let (mut journal, _) = Journal::open(&path).unwrap();
            journal.append(&changeset(1, 10)).unwrap();
            journal.append(&changeset(2, 20)).unwrap();
        }

        let mut bytes = std::fs::read(&path).unwrap();
        bytes[HEADER_LEN + FRAME_HEADER_LEN + 2] ^= 0xff;
        std::fs::write(&path, &bytes).unwrap();

        assert!(matches!(
            Journal::open(&path),
            Err(StoreError::Corrupted(_))
        ));
    }

    #[test]
    fn rejects_foreign_files_and_newer_schemas() {
        let dir = tempfile::tempdir().unwrap();

        let foreign = dir.path().join("foreign.dat");
        std::fs::write(&foreign, b"definitely not a journal").unwrap();
        assert!(matches!(Journal::open(&foreign), Err(StoreError::Corrupted(_))));

        let newer = dir.path().join("newer.dat");
        let mut header = JOURNAL_MAGIC.to_vec();
        header.extend_from_slice(&(SCHEMA_VERSION + 1).to_le_bytes());
        std::fs::write(&newer, &header).unwrap();
        assert!(matches!(
            Journal::open(&newer),
            Err(StoreError::UnsupportedSchema { .. })
        ));
    }

    #[test]
    fn older_schema_header_is_upgraded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("v1.dat");

        let mut bytes = JOURNAL_MAGIC.to_vec();
        bytes.extend_from_slice(&1u32.to_le_bytes());
        bytes.extend_from_slice(&encode_frame(&changeset(1, 10)).unwrap());
        std::fs::write(&path, &bytes).unwrap();

        let (_, recovered) = Journal::open(&path).unwrap();
        assert_eq!(recovered.found_schema, 1);
        assert_eq!(recovered.changesets.len(), 1);

        let (_, reopened) = Journal::open(&path).unwrap();
        assert_eq!(reopened.found_schema, SCHEMA_VERSION);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn failed_rollback_poisons_the_journal() {
        // Writes to /dev/full fail and a character device cannot be truncated,
        // so both the append and its rollback fail.
        let file = OpenOptions::new().write(true).open("/dev/full").unwrap();
        let mut journal = Journal {
            file,
            path: PathBuf::from("/dev/full"),
            len: 0,
            poisoned: None,
        };

        assert!(matches!(journal.append(&changeset(1, 10)), Err(StoreError::Io(_))));
        assert!(journal.is_poisoned());

        let refused = journal.append(&changeset(1, 10)).unwrap_err();
        assert!(matches!(refused, StoreError::JournalPoisoned(_)));
        assert!(!refused.is_transient());
    }

    #[test]
    fn healthy_journal_is_not_poisoned() {
        let dir = tempfile::tempdir().unwrap();
        let (mut journal, _) = Journal::open(dir.path().join("journal.dat")).unwrap();
        journal.append(&changeset(1, 10)).unwrap();
        assert!(!journal.is_poisoned());
    }
}

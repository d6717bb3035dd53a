//! Append-only mutation log with snapshot compaction.
//!
//! Every store write becomes one JSON line in `progress.journal.jsonl`. On open the
//! snapshot is loaded and newer journal lines are replayed on top. A partially
//! written final line (crash mid-append) is dropped and trimmed from the file.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::StoreError;
use crate::model::{
    ChunkPatch, FileEntry, FileId, FilePatch, RequestId, RequestPatch, TransferRequest,
};

use super::tables::{Snapshot, Tables};

pub(crate) const SNAPSHOT_FILE: &str = "progress.snapshot.json";
pub(crate) const JOURNAL_FILE: &str = "progress.journal.jsonl";

/// A single durable change. Rows carry explicit ids so replaying twice is harmless.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub(crate) enum Mutation {
    CreateRequest(TransferRequest),
    PatchRequest {
        id: RequestId,
        patch: RequestPatch,
    },
    AddFiles {
        request_id: RequestId,
        files: Vec<FileEntry>,
    },
    PatchFile {
        id: FileId,
        patch: FilePatch,
    },
    AssignChunk {
        request_id: RequestId,
        index: u32,
        chunk_id: u64,
        file_ids: Vec<FileId>,
    },
    PatchChunk {
        request_id: RequestId,
        index: u32,
        patch: ChunkPatch,
    },
    PurgeDetails {
        request_id: RequestId,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct JournalEntry {
    pub(crate) seq: u64,
    pub(crate) at: DateTime<Utc>,
    pub(crate) mutation: Mutation,
}

pub(crate) struct Journal {
    dir: PathBuf,
    file: File,
    len: u64,
    sync: bool,
}

/// Result of reading a store directory from disk.
pub(crate) struct Recovered {
    pub(crate) journal: Journal,
    pub(crate) tables: Tables,
    pub(crate) last_seq: u64,
    pub(crate) replayed: usize,
}

impl Journal {
    pub(crate) fn open(dir: &Path, sync: bool) -> Result<Recovered, StoreError> {
        fs::create_dir_all(dir)?;

        let snapshot_path = dir.join(SNAPSHOT_FILE);
        let snapshot = if snapshot_path.exists() {
            let reader = BufReader::new(File::open(&snapshot_path)?);
            serde_json::from_reader::<_, Snapshot>(reader).map_err(|err| {
                StoreError::Corrupt(format!("{}: {err}", snapshot_path.display()))
            })?
        } else {
            Snapshot::default()
        };
        let mut last_seq = snapshot.last_seq;
        let mut tables = Tables::from_snapshot(snapshot);

        let journal_path = dir.join(JOURNAL_FILE);
        let raw = match fs::read(&journal_path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(err) => return Err(err.into()),
        };

        let mut replayed = 0usize;
        let mut valid_len = 0usize;
        let mut missing_newline = false;
        let mut offset = 0usize;
        while offset < raw.len() {
            let (line, next, terminated) = match raw[offset..].iter().position(|b| *b == b'\n') {
                Some(pos) => (&raw[offset..offset + pos], offset + pos + 1, true),
                None => (&raw[offset..], raw.len(), false),
            };
            if line.iter().all(u8::is_ascii_whitespace) {
                if terminated {
                    valid_len = next;
                }
                offset = next;
                continue;
            }
            match serde_json::from_slice::<JournalEntry>(line) {
                Ok(entry) => {
                    if entry.seq > last_seq {
                        tables.apply(&entry.mutation, entry.at);
                        last_seq = entry.seq;
                        replayed += 1;
                    }
                    valid_len = next;
                    missing_newline = !terminated;
                }
                Err(err) if !terminated => {
                    log::warn!(
                        "dropping torn journal record at byte {offset} of {}: {err}",
                        journal_path.display()
                    );
                }
                Err(err) => {
                    return Err(StoreError::Corrupt(format!(
                        "{} byte {offset}: {err}",
                        journal_path.display()
                    )));
                }
            }
            offset = next;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&journal_path)?;
        if (valid_len as u64) < file.metadata()?.len() {
            file.set_len(valid_len as u64)?;
        }
        if missing_newline {
            file.write_all(b"\n")?;
            valid_len += 1;
        }

        Ok(Recovered {
            journal: Journal {
                dir: dir.to_path_buf(),
                file,
                len: valid_len as u64,
                sync,
            },
            tables,
            last_seq,
            replayed,
        })
    }

    pub(crate) fn len(&self) -> u64 {
        self.len
    }

    pub(crate) fn append(&mut self, entry: &JournalEntry) -> Result<(), StoreError> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');
        self.file.write_all(&line)?;
        self.file.flush()?;
        if self.sync {
            self.file.sync_data()?;
        }
        self.len += line.len() as u64;
        Ok(())
    }

    /// Fold everything up to `last_seq` into the snapshot and empty the journal.
    pub(crate) fn compact(&mut self, tables: &Tables, last_seq: u64) -> Result<(), StoreError> {
        let snapshot = tables.to_snapshot(last_seq);
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        {
            let mut writer = BufWriter::new(tmp.as_file_mut());
            serde_json::to_writer(&mut writer, &snapshot)?;
            writer.flush()?;
        }
        tmp.as_file().sync_all()?;
        tmp.persist(self.dir.join(SNAPSHOT_FILE))
            .map_err(|err| StoreError::Io(err.error))?;

        // entries at or below last_seq are skipped on replay, so a crash here is safe
        self.file.set_len(0)?;
        self.len = 0;
        log::debug!(
            "compacted progress journal in {} at seq {last_seq}",
            self.dir.display()
        );
        Ok(())
    }
}

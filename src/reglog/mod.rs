//! Register Log
//!
//! Append-only journal of node registrations and unregistrations. The
//! running manager never reads it; it is replayed once at startup to rebuild
//! the registry, and rewritten as a compact snapshot on controlled shutdown.

pub mod record;

pub use record::{decode_record, encode_record, DecodeError, LogRecord, RegisterEntry};

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::registry::{NodeType, Registration, Registry};
use record::{decode_header, encode_header, HEADER_SIZE};

/// Suffix of the temporary file a snapshot is written to
const SNAPSHOT_SUFFIX: &str = ".bkp";

/// Records recovered from a register log
#[derive(Debug, Default)]
pub struct Replay {
    pub records: Vec<LogRecord>,
    /// Length of the intact prefix of the file
    pub valid_len: u64,
    /// Bytes after the intact prefix that could not be decoded
    pub discarded: u64,
}

/// Read and decode a register log without modifying it.
///
/// A missing file is an empty log. A truncated or garbled tail is reported in
/// `discarded`; a header that is present but wrong is an error.
pub fn read_log(path: &Path) -> Result<Replay> {
    let mut bytes = Vec::new();
    match File::open(path) {
        Ok(mut file) => {
            file.read_to_end(&mut bytes)?;
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Replay::default()),
        Err(e) => return Err(e.into()),
    }

    if bytes.is_empty() {
        return Ok(Replay::default());
    }

    match decode_header(&bytes) {
        Ok(()) => {}
        Err(DecodeError::Truncated) => {
            tracing::warn!(
                "Register log {} has a partial header, ignoring {} bytes",
                path.display(),
                bytes.len()
            );
            return Ok(Replay {
                records: Vec::new(),
                valid_len: 0,
                discarded: bytes.len() as u64,
            });
        }
        Err(DecodeError::Corrupt(reason)) => {
            return Err(Error::RegisterLogCorrupted { offset: 0, reason });
        }
    }

    let mut records = Vec::new();
    let mut pos = HEADER_SIZE;
    while pos < bytes.len() {
        match decode_record(&bytes[pos..]) {
            Ok((record, used)) => {
                records.push(record);
                pos += used;
            }
            Err(e) => {
                tracing::warn!(
                    "Discarding register log tail at offset {} of {}: {}",
                    pos,
                    path.display(),
                    e
                );
                break;
            }
        }
    }

    Ok(Replay {
        records,
        valid_len: pos as u64,
        discarded: (bytes.len() - pos) as u64,
    })
}

/// Handle to the register log file
pub struct RegisterLog {
    path: PathBuf,
    /// Serializes appends and snapshot rewrites
    write_lock: Mutex<()>,
}

impl RegisterLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a REGISTER record
    pub fn append_register(&self, reg: &Registration) -> Result<()> {
        self.append(&LogRecord::Register(RegisterEntry::from_registration(reg)))
    }

    /// Append an UNREGISTER record
    pub fn append_unregister(&self, node_type: NodeType, node_name: &str) -> Result<()> {
        self.append(&LogRecord::Unregister {
            node_type,
            node_name: node_name.to_string(),
        })
    }

    /// Append one record, writing the header first if the file is new
    pub fn append(&self, record: &LogRecord) -> Result<()> {
        let _guard = self.write_lock.lock();

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;

        let mut data = Vec::new();
        if file.metadata()?.len() == 0 {
            data.extend_from_slice(&encode_header());
        }
        data.extend_from_slice(&encode_record(record));

        file.write_all(&data)?;
        file.sync_data()?;

        tracing::trace!(
            "Logged {} record for {} {}",
            record.kind(),
            record.node_type(),
            record.node_name()
        );
        Ok(())
    }

    /// Rewrite the log as one REGISTER record per live node.
    ///
    /// The snapshot goes to a temporary file that atomically replaces the log.
    /// Returns the number of nodes written.
    pub fn save_snapshot(&self, registry: &Registry) -> Result<usize> {
        let _guard = self.write_lock.lock();

        let mut data = encode_header().to_vec();
        let mut count = 0usize;
        {
            let table = registry.read();
            for node in table.nodes() {
                let state = node.read(&table);
                let entry = RegisterEntry::from_state(node.node_type(), node.node_name(), &state);
                data.extend_from_slice(&encode_record(&LogRecord::Register(entry)));
                count += 1;
            }
        }

        let tmp_path = self.snapshot_path();
        let mut out = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&tmp_path)?;
        out.write_all(&data)?;
        out.flush()?;
        out.sync_all()?;
        fs::rename(&tmp_path, &self.path)?;

        tracing::info!(
            "Wrote register log snapshot with {} nodes to {}",
            count,
            self.path.display()
        );
        Ok(count)
    }

    /// Read every intact record, cutting off a damaged tail so later appends
    /// follow valid data.
    pub fn replay(&self) -> Result<Replay> {
        let _guard = self.write_lock.lock();

        let replay = read_log(&self.path)?;
        if replay.discarded > 0 {
            let file = OpenOptions::new().write(true).open(&self.path)?;
            file.set_len(replay.valid_len)?;
            file.sync_all()?;
            tracing::warn!(
                "Truncated register log {} to {} bytes ({} bytes discarded)",
                self.path.display(),
                replay.valid_len,
                replay.discarded
            );
        }

        tracing::info!(
            "Replayed {} register log records from {}",
            replay.records.len(),
            self.path.display()
        );
        Ok(replay)
    }

    fn snapshot_path(&self) -> PathBuf {
        let mut path = self.path.clone().into_os_string();
        path.push(SNAPSHOT_SUFFIX);
        PathBuf::from(path)
    }
}

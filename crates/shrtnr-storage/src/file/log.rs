use serde::{Deserialize, Serialize};
use shrtnr_core::{Result, ShortCode, StorageError};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// One entry of the append log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub(crate) enum LogRecord {
    Put {
        short: ShortCode,
        long: String,
        owner: String,
    },
    Delete {
        owner: String,
        shorts: Vec<ShortCode>,
    },
}

/// Header size: 4 bytes length + 4 bytes CRC.
const HEADER_SIZE: usize = 8;

/// Append-only record log.
///
/// On-disk format, repeated once per record:
/// ```text
/// [4 bytes: payload length (little-endian u32)]
/// [4 bytes: CRC32 of payload (little-endian u32)]
/// [N bytes: payload (JSON-encoded LogRecord)]
/// ```
/// Fields are never delimiter-scanned, so URLs may contain any byte.
pub(crate) struct AppendLog {
    path: PathBuf,
    writer: BufWriter<File>,
    sync_every_write: bool,
}

impl AppendLog {
    /// Opens (or creates) the log at `path` and returns it with every record
    /// recovered from disk.
    ///
    /// A torn record at the end of the file is cut off so that later appends
    /// stay readable. Damage followed by intact records is left in place.
    pub(crate) fn open(path: &Path, sync_every_write: bool) -> Result<(Self, Vec<LogRecord>)> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)?;

        let bytes = fs::read(path)?;
        let (records, valid_len) = decode_records(&bytes);
        if valid_len < bytes.len() {
            warn!(
                path = %path.display(),
                valid_len,
                file_len = bytes.len(),
                "truncating torn tail of link log"
            );
            file.set_len(valid_len as u64)?;
        }

        debug!(path = %path.display(), recovered = records.len(), "link log opened");

        let log = Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
            sync_every_write,
        };
        Ok((log, records))
    }

    /// Appends one record and flushes it to the OS.
    pub(crate) fn append(&mut self, record: &LogRecord) -> Result<()> {
        let frame = encode_frame(record)?;
        self.writer.write_all(&frame)?;
        self.writer.flush()?;
        if self.sync_every_write {
            self.writer.get_ref().sync_data()?;
        }
        Ok(())
    }

    /// Flushes buffered bytes and forces them to disk.
    pub(crate) fn sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(())
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }
}

pub(crate) fn encode_frame(record: &LogRecord) -> Result<Vec<u8>> {
    let payload = serde_json::to_vec(record)
        .map_err(|e| StorageError::InvalidData(format!("cannot encode log record: {e}")))?;
    let length = u32::try_from(payload.len()).map_err(|_| {
        StorageError::InvalidData(format!("log record of {} bytes is too large", payload.len()))
    })?;
    let crc = crc32fast::hash(&payload);

    let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len());
    frame.extend_from_slice(&length.to_le_bytes());
    frame.extend_from_slice(&crc.to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Decodes every readable record and returns them with the length of the
/// prefix of `bytes` worth keeping.
///
/// A frame whose header or checksum is damaged is skipped by scanning forward
/// to the next intact frame, so one bad byte never hides the records after
/// it. Only when no intact frame follows is the damaged region treated as a
/// torn tail and excluded from the returned length.
pub(crate) fn decode_records(bytes: &[u8]) -> (Vec<LogRecord>, usize) {
    let mut records = Vec::new();
    let mut offset = 0usize;

    while offset < bytes.len() {
        let Some(payload) = read_frame(bytes, offset) else {
            match resync(bytes, offset + 1) {
                Some(next) => {
                    warn!(
                        offset,
                        skipped = next - offset,
                        "damaged log frame; resuming at next intact record"
                    );
                    offset = next;
                    continue;
                }
                None => {
                    warn!(
                        offset,
                        remaining = bytes.len() - offset,
                        "torn log tail; stopping recovery"
                    );
                    break;
                }
            }
        };

        match serde_json::from_slice::<LogRecord>(payload) {
            Ok(record) => records.push(record),
            Err(e) => warn!(offset, error = %e, "undecodable log record; skipping"),
        }
        offset += HEADER_SIZE + payload.len();
    }

    (records, offset)
}

/// Returns the payload of the frame at `offset` if it is complete and its
/// checksum matches.
fn read_frame(bytes: &[u8], offset: usize) -> Option<&[u8]> {
    let header = bytes.get(offset..offset.checked_add(HEADER_SIZE)?)?;
    let length = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
    let expected_crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);

    let start = offset + HEADER_SIZE;
    let payload = bytes.get(start..start.checked_add(length)?)?;
    (crc32fast::hash(payload) == expected_crc).then_some(payload)
}

/// Finds the first offset at or after `from` holding an intact frame.
/// Payloads are JSON objects, which cheaply rules out most candidates.
fn resync(bytes: &[u8], from: usize) -> Option<usize> {
    (from..bytes.len()).find(|&offset| {
        bytes.get(offset + HEADER_SIZE) == Some(&b'{') && read_frame(bytes, offset).is_some()
    })
}

// Append-only message journal
//
// Messages are appended to segment files `wal.{file_id}` in the WAL
// directory. A record is
//
//   [len: u32 BE][checksum: 4 bytes][seq: u64 BE][tag: u8][timestamp: u64 BE][payload]
//
// where `len` counts everything after the checksum and the checksum is the
// first four bytes of SHA-256 over that same span. Sequence numbers grow
// across segments, so `(file_id, seq)` addresses any record.
//
// A record that is short, fails its checksum, or does not decode marks a
// write that was cut off by a crash. Everything from that record on is
// truncated instead of being reported as an error.

use crate::crypto::record_checksum;
use crate::protocols::{WalMessage, WalRecordError};
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

const FILE_PREFIX: &str = "wal.";
const HEADER_SIZE: usize = 8;
const BODY_PREFIX_SIZE: usize = 8 + 1 + 8;
// A single record larger than this is treated as corruption
const MAX_RECORD_SIZE: usize = 64 * 1024 * 1024;

/// Segment size after which the journal rolls to a new file
pub const DEFAULT_JOURNAL_LIMIT_SIZE: u64 = 100 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum JournalError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Record error: {0}")]
    Record(#[from] WalRecordError),
}

pub type Result<T> = std::result::Result<T, JournalError>;

/// One decoded journal record
#[derive(Debug)]
pub struct JournalRecord {
    pub seq: u64,
    pub timestamp: u64,
    pub msg: WalMessage,
}

struct Segment {
    file_id: u32,
    writer: BufWriter<File>,
    size: u64,
}

struct JournalInner {
    segment: Segment,
    next_seq: u64,
    limit_size: u64,
}

pub struct Journal {
    path: PathBuf,
    inner: Mutex<JournalInner>,
}

fn segment_path(dir: &Path, file_id: u32) -> PathBuf {
    dir.join(format!("{}{}", FILE_PREFIX, file_id))
}

/// Segment ids present in `dir`, ascending
fn list_segments(dir: &Path) -> io::Result<Vec<u32>> {
    let mut ids = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        if let Some(id) = name
            .to_str()
            .and_then(|n| n.strip_prefix(FILE_PREFIX))
            .and_then(|n| n.parse::<u32>().ok())
        {
            ids.push(id);
        }
    }
    ids.sort_unstable();
    Ok(ids)
}

fn open_segment(dir: &Path, file_id: u32) -> io::Result<Segment> {
    let path = segment_path(dir, file_id);
    let file = OpenOptions::new().create(true).append(true).open(&path)?;
    let size = file.metadata()?.len();
    Ok(Segment {
        file_id,
        writer: BufWriter::new(file),
        size,
    })
}

/// Outcome of scanning one segment
struct Scan {
    records: Vec<JournalRecord>,
    /// Byte offset just past the last good record
    valid_len: u64,
    corrupt: bool,
}

fn scan_segment(path: &Path) -> io::Result<Scan> {
    let mut data = Vec::new();
    File::open(path)?.read_to_end(&mut data)?;

    let mut records = Vec::new();
    let mut offset = 0usize;
    let mut corrupt = false;
    while offset < data.len() {
        match decode_record(&data[offset..]) {
            Some((record, consumed)) => {
                records.push(record);
                offset += consumed;
            }
            None => {
                corrupt = true;
                break;
            }
        }
    }
    Ok(Scan {
        records,
        valid_len: offset as u64,
        corrupt,
    })
}

fn decode_record(data: &[u8]) -> Option<(JournalRecord, usize)> {
    if data.len() < HEADER_SIZE {
        return None;
    }
    let len = u32::from_be_bytes(data[0..4].try_into().ok()?) as usize;
    if len < BODY_PREFIX_SIZE || len > MAX_RECORD_SIZE || data.len() < HEADER_SIZE + len {
        return None;
    }
    let body = &data[HEADER_SIZE..HEADER_SIZE + len];
    if data[4..8] != record_checksum(body) {
        return None;
    }
    let seq = u64::from_be_bytes(body[0..8].try_into().ok()?);
    let tag = body[8];
    let timestamp = u64::from_be_bytes(body[9..17].try_into().ok()?);
    let msg = WalMessage::decode_body(tag, &body[BODY_PREFIX_SIZE..]).ok()?;
    Some((
        JournalRecord {
            seq,
            timestamp,
            msg,
        },
        HEADER_SIZE + len,
    ))
}

fn encode_record(seq: u64, timestamp: u64, msg: &WalMessage) -> Result<Vec<u8>> {
    let payload = msg.encode_body()?;
    let mut body = Vec::with_capacity(BODY_PREFIX_SIZE + payload.len());
    body.extend_from_slice(&seq.to_be_bytes());
    body.push(msg.tag());
    body.extend_from_slice(&timestamp.to_be_bytes());
    body.extend_from_slice(&payload);

    let mut record = Vec::with_capacity(HEADER_SIZE + body.len());
    record.extend_from_slice(&(body.len() as u32).to_be_bytes());
    record.extend_from_slice(&record_checksum(&body));
    record.extend_from_slice(&body);
    Ok(record)
}

/// Cut a segment back to its last good record
fn truncate_segment(path: &Path, len: u64) -> io::Result<()> {
    let file = OpenOptions::new().write(true).open(path)?;
    file.set_len(len)?;
    file.sync_all()
}

impl Journal {
    /// Open the journal in `dir`, repairing a torn tail left by a crash
    pub fn open(dir: &Path, limit_size: u64) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let ids = list_segments(dir)?;

        let mut next_seq = 1;
        for (i, id) in ids.iter().enumerate() {
            let path = segment_path(dir, *id);
            let scan = scan_segment(&path)?;
            if let Some(last) = scan.records.last() {
                next_seq = last.seq + 1;
            }
            if scan.corrupt {
                warn!(
                    "Truncating corrupt journal tail in {} at offset {}",
                    path.display(),
                    scan.valid_len
                );
                truncate_segment(&path, scan.valid_len)?;
                // later segments were written after the torn record
                for later in &ids[i + 1..] {
                    fs::remove_file(segment_path(dir, *later))?;
                }
                break;
            }
        }

        let file_id = list_segments(dir)?.last().copied().unwrap_or(1);
        let segment = open_segment(dir, file_id)?;
        info!(
            "Opened journal at {} (file {}, next seq {})",
            dir.display(),
            file_id,
            next_seq
        );
        Ok(Self {
            path: dir.to_path_buf(),
            inner: Mutex::new(JournalInner {
                segment,
                next_seq,
                limit_size,
            }),
        })
    }

    /// Never reuse positions at or before `(file_id, seq)`. A recorded
    /// view change pointer may outlive the segments it pointed into.
    pub fn resume_from(&self, file_id: u32, seq: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.next_seq < seq {
            debug!("Journal seq raised from {} to {}", inner.next_seq, seq);
            inner.next_seq = seq;
        }
        if inner.segment.file_id < file_id {
            inner.segment.writer.flush()?;
            inner.segment = open_segment(&self.path, file_id)?;
            debug!("Journal writer moved to file {}", file_id);
        }
        Ok(())
    }

    pub fn set_limit_size(&self, limit: u64) {
        self.inner.lock().limit_size = limit;
    }

    /// Append `msg`; with `sync` the record is on disk before returning
    pub fn insert(&self, msg: &WalMessage, timestamp: u64, sync: bool) -> Result<u64> {
        let mut inner = self.inner.lock();
        let seq = inner.next_seq;
        let record = encode_record(seq, timestamp, msg)?;

        if inner.segment.size > 0 && inner.segment.size + record.len() as u64 > inner.limit_size {
            self.rotate(&mut inner)?;
        }
        inner.segment.writer.write_all(&record)?;
        inner.segment.size += record.len() as u64;
        inner.next_seq += 1;

        if sync {
            inner.segment.writer.flush()?;
            inner.segment.writer.get_ref().sync_data()?;
        }
        Ok(seq)
    }

    fn rotate(&self, inner: &mut JournalInner) -> Result<()> {
        inner.segment.writer.flush()?;
        inner.segment.writer.get_ref().sync_data()?;
        let next_id = inner.segment.file_id + 1;
        inner.segment = open_segment(&self.path, next_id)?;
        debug!("Journal rotated to file {}", next_id);
        Ok(())
    }

    /// Flush and report where the next record will land
    pub fn current_journal(&self) -> Result<(u32, u64)> {
        let mut inner = self.inner.lock();
        inner.segment.writer.flush()?;
        Ok((inner.segment.file_id, inner.next_seq))
    }

    pub fn flush(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.segment.writer.flush()?;
        inner.segment.writer.get_ref().sync_data()?;
        Ok(())
    }

    /// Delete segments older than `file_id`
    pub fn expire(&self, file_id: u32) -> Result<usize> {
        let mut removed = 0;
        for id in list_segments(&self.path)? {
            if id >= file_id {
                break;
            }
            fs::remove_file(segment_path(&self.path, id))?;
            removed += 1;
        }
        if removed > 0 {
            debug!("Expired {} journal files below {}", removed, file_id);
        }
        Ok(removed)
    }

    /// Replay records with `seq >= start_seq` from segment `file_id` on
    pub fn load<F>(&self, file_id: u32, start_seq: u64, mut f: F) -> Result<usize>
    where
        F: FnMut(JournalRecord) -> Result<()>,
    {
        let mut inner = self.inner.lock();
        inner.segment.writer.flush()?;

        let ids = list_segments(&self.path)?;
        let mut replayed = 0;
        for id in ids.iter().copied().filter(|id| *id >= file_id) {
            let path = segment_path(&self.path, id);
            let scan = scan_segment(&path)?;
            let corrupt = scan.corrupt;
            let valid_len = scan.valid_len;

            for record in scan.records {
                if record.seq >= start_seq {
                    f(record)?;
                    replayed += 1;
                }
            }

            if corrupt {
                warn!(
                    "Journal record in {} cut off at offset {}, truncating",
                    path.display(),
                    valid_len
                );
                truncate_segment(&path, valid_len)?;
                // replay stops here, so nothing after it may survive
                for later in ids.iter().copied().filter(|later| *later > id) {
                    fs::remove_file(segment_path(&self.path, later))?;
                }
                if inner.segment.file_id >= id {
                    inner.segment = open_segment(&self.path, id)?;
                }
                break;
            }
        }
        Ok(replayed)
    }
}

impl Drop for Journal {
    fn drop(&mut self) {
        if let Err(e) = self.inner.get_mut().segment.writer.flush() {
            warn!("Failed to flush journal on close: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::hash_data;
    use crate::protocols::{PreCommit, SendPreCommit};
    use crate::types::Block;
    use proptest::prelude::*;

    fn message(n: u64) -> WalMessage {
        WalMessage::SendPreCommit(SendPreCommit {
            block: Block::new(n, hash_data(&n.to_be_bytes()), n, vec![vec![0u8; 64]]),
            vote: PreCommit {
                epoch: 1,
                view_number: n,
                block_hash: hash_data(b"b"),
                block_number: n,
                block_index: 0,
                validator_index: 2,
                signature: Default::default(),
            },
        })
    }

    fn replay(journal: &Journal, file_id: u32, seq: u64) -> Vec<u64> {
        let mut numbers = Vec::new();
        journal
            .load(file_id, seq, |r| {
                numbers.push(r.msg.block_number());
                Ok(())
            })
            .unwrap();
        numbers
    }

    #[test]
    fn test_insert_and_load_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::open(dir.path(), DEFAULT_JOURNAL_LIMIT_SIZE).unwrap();
        for n in 1..=10 {
            journal.insert(&message(n), n, n % 3 == 0).unwrap();
        }
        assert_eq!(replay(&journal, 1, 0), (1..=10).collect::<Vec<_>>());
        assert_eq!(replay(&journal, 1, 6), (6..=10).collect::<Vec<_>>());
        assert_eq!(journal.current_journal().unwrap(), (1, 11));
    }

    #[test]
    fn test_rotation_and_expiry() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::open(dir.path(), 1024).unwrap();
        for n in 1..=20 {
            journal.insert(&message(n), n, false).unwrap();
        }
        let (file_id, seq) = journal.current_journal().unwrap();
        assert!(file_id > 1);
        assert_eq!(seq, 21);
        assert_eq!(replay(&journal, 1, 0).len(), 20);

        let removed = journal.expire(file_id).unwrap();
        assert_eq!(removed as u32, file_id - 1);
        assert_eq!(list_segments(dir.path()).unwrap(), vec![file_id]);

        journal.insert(&message(21), 21, true).unwrap();
        assert_eq!(replay(&journal, file_id, seq), vec![21]);
    }

    #[test]
    fn test_torn_tail_truncated() {
        let dir = tempfile::tempdir().unwrap();
        {
            let journal = Journal::open(dir.path(), DEFAULT_JOURNAL_LIMIT_SIZE).unwrap();
            for n in 1..=5 {
                journal.insert(&message(n), n, false).unwrap();
            }
        }
        let path = segment_path(dir.path(), 1);
        let len = fs::metadata(&path).unwrap().len();
        OpenOptions::new().write(true).open(&path).unwrap().set_len(len - 7).unwrap();

        let journal = Journal::open(dir.path(), DEFAULT_JOURNAL_LIMIT_SIZE).unwrap();
        assert_eq!(replay(&journal, 1, 0), vec![1, 2, 3, 4]);
        // the torn record's sequence number is reused
        assert_eq!(journal.current_journal().unwrap(), (1, 5));
        journal.insert(&message(6), 6, true).unwrap();
        assert_eq!(replay(&journal, 1, 0), vec![1, 2, 3, 4, 6]);
    }

    #[test]
    fn test_corruption_found_during_load() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::open(dir.path(), DEFAULT_JOURNAL_LIMIT_SIZE).unwrap();
        for n in 1..=3 {
            journal.insert(&message(n), n, false).unwrap();
        }
        journal.flush().unwrap();

        let path = segment_path(dir.path(), 1);
        let mut data = fs::read(&path).unwrap();
        let last = data.len() - 1;
        data[last] ^= 0xff;
        fs::write(&path, &data).unwrap();

        assert_eq!(replay(&journal, 1, 0), vec![1, 2]);
        assert!(fs::metadata(&path).unwrap().len() < data.len() as u64);
    }

    #[test]
    fn test_corrupt_middle_segment_drops_later_files() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::open(dir.path(), 1024).unwrap();
        for n in 1..=20 {
            journal.insert(&message(n), n, false).unwrap();
        }
        journal.flush().unwrap();
        let ids = list_segments(dir.path()).unwrap();
        assert!(ids.len() >= 3);

        let seqs = |id: u32| -> Vec<u64> {
            scan_segment(&segment_path(dir.path(), id))
                .unwrap()
                .records
                .iter()
                .map(|r| r.seq)
                .collect()
        };
        let mut expected = seqs(ids[0]);
        let mut middle = seqs(ids[1]);
        middle.pop();
        expected.extend(middle);

        let path = segment_path(dir.path(), ids[1]);
        let mut data = fs::read(&path).unwrap();
        let last = data.len() - 1;
        data[last] ^= 0xff;
        fs::write(&path, &data).unwrap();

        assert_eq!(replay(&journal, 1, 0), expected);
        assert_eq!(list_segments(dir.path()).unwrap(), vec![ids[0], ids[1]]);

        // new writes land where replay can reach them, also after a restart
        journal.insert(&message(100), 100, true).unwrap();
        expected.push(100);
        assert_eq!(replay(&journal, 1, 0), expected);
        drop(journal);
        let journal = Journal::open(dir.path(), 1024).unwrap();
        assert_eq!(replay(&journal, 1, 0), expected);
    }

    #[test]
    fn test_resume_from_keeps_positions_monotonic() {
        let dir = tempfile::tempdir().unwrap();
        {
            let journal = Journal::open(dir.path(), DEFAULT_JOURNAL_LIMIT_SIZE).unwrap();
            for n in 1..=3 {
                journal.insert(&message(n), n, true).unwrap();
            }
            assert_eq!(journal.current_journal().unwrap(), (1, 4));
        }
        // every record torn away: the file alone no longer knows seq 4
        let path = segment_path(dir.path(), 1);
        OpenOptions::new().write(true).open(&path).unwrap().set_len(0).unwrap();

        let journal = Journal::open(dir.path(), DEFAULT_JOURNAL_LIMIT_SIZE).unwrap();
        assert_eq!(journal.current_journal().unwrap(), (1, 1));
        journal.resume_from(1, 4).unwrap();
        assert_eq!(journal.current_journal().unwrap(), (1, 4));
        // never moves backwards
        journal.resume_from(1, 2).unwrap();
        assert_eq!(journal.current_journal().unwrap(), (1, 4));

        journal.resume_from(3, 9).unwrap();
        assert_eq!(journal.current_journal().unwrap(), (3, 9));
        journal.insert(&message(9), 9, true).unwrap();
        assert_eq!(replay(&journal, 3, 9), vec![9]);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn prop_cut_journal_replays_a_prefix(
            payloads in proptest::collection::vec(testutil::payload_strategy(3, 64), 1..6),
            cut in 1u64..512,
        ) {
            let dir = tempfile::tempdir().unwrap();
            {
                let journal = Journal::open(dir.path(), DEFAULT_JOURNAL_LIMIT_SIZE).unwrap();
                for (i, payload) in payloads.iter().enumerate() {
                    let n = i as u64 + 1;
                    let mut msg = message(n);
                    if let WalMessage::SendPreCommit(ref mut m) = msg {
                        m.block.payload = payload.clone();
                    }
                    journal.insert(&msg, n, false).unwrap();
                }
            }
            let path = segment_path(dir.path(), 1);
            let len = fs::metadata(&path).unwrap().len();
            OpenOptions::new()
                .write(true)
                .open(&path)
                .unwrap()
                .set_len(len.saturating_sub(cut))
                .unwrap();

            let journal = Journal::open(dir.path(), DEFAULT_JOURNAL_LIMIT_SIZE).unwrap();
            let replayed = replay(&journal, 1, 0);
            let expected: Vec<u64> = (1..=replayed.len() as u64).collect();
            prop_assert!(replayed.len() < payloads.len());
            prop_assert_eq!(replayed, expected);
        }
    }
}

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Change;

/// Encode a single change to [len][bincode][crc32] format.
fn encode_change(writer: &mut impl Write, change: &Change) -> io::Result<()> {
    let payload =
        bincode::serialize(change).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = payload.len() as u32;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(())
}

/// Append-only Write-Ahead Log.
///
/// Format per entry: `[u32: len][bincode: Change][u32: crc32]`
/// - `len` is the byte length of the bincode payload (not including the CRC).
/// - Truncated last entry (crash) is safely discarded via length-prefix + CRC check.
///
/// Only whole, synced batches count: `committed_len` is the file length
/// after the last successful `flush_sync`, and `rollback` cuts the file
/// back to it.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
    committed_len: u64,
    committed_appends: u64,
    /// Set when a rollback itself failed; the file tail is unknown.
    poisoned: bool,
    #[cfg(test)]
    fail_append_at: Option<u64>,
}

impl Wal {
    /// Open (or create) the WAL file at `path`.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        let committed_len = file.metadata()?.len();
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
            committed_len,
            committed_appends: 0,
            poisoned: false,
            #[cfg(test)]
            fail_append_at: None,
        })
    }

    /// Replay `path`, cut off any torn tail, and open it for appending.
    /// New records must never land behind bytes that replay will stop at.
    pub fn recover(path: &Path) -> io::Result<(Self, Vec<Change>)> {
        let (changes, valid_len) = scan(path)?;
        if let Ok(meta) = fs::metadata(path) {
            if meta.len() > valid_len {
                tracing::warn!(
                    "WAL {}: truncating {} torn bytes",
                    path.display(),
                    meta.len() - valid_len
                );
                let file = OpenOptions::new().write(true).open(path)?;
                file.set_len(valid_len)?;
                file.sync_all()?;
            }
        }
        Ok((Self::open(path)?, changes))
    }

    #[cfg(test)]
    pub fn append(&mut self, change: &Change) -> io::Result<()> {
        self.append_buffered(change)?;
        self.flush_sync()
    }

    /// Append to the BufWriter without flushing or syncing.
    /// Call `flush_sync()` after the batch to durably commit everything buffered.
    pub fn append_buffered(&mut self, change: &Change) -> io::Result<()> {
        if self.poisoned {
            return Err(io::Error::other("WAL is poisoned by a failed rollback"));
        }
        #[cfg(test)]
        if self.fail_append_at == Some(self.appends_since_compact) {
            // Half a length prefix, as a full disk would leave it
            self.writer.write_all(&[0xff, 0xff])?;
            return Err(io::Error::new(io::ErrorKind::StorageFull, "injected append failure"));
        }
        encode_change(&mut self.writer, change)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    /// Flush the BufWriter and fsync the underlying file.
    pub fn flush_sync(&mut self) -> io::Result<()> {
        if self.poisoned {
            return Err(io::Error::other("WAL is poisoned by a failed rollback"));
        }
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        self.committed_len = self.writer.get_ref().metadata()?.len();
        self.committed_appends = self.appends_since_compact;
        Ok(())
    }

    /// Discard everything since the last successful `flush_sync`: buffered
    /// bytes are dropped unwritten and anything already on disk is truncated.
    /// If that fails the WAL refuses all further appends.
    pub fn rollback(&mut self) -> io::Result<()> {
        let result = self.truncate_to_committed();
        if result.is_err() {
            self.poisoned = true;
        }
        result
    }

    fn truncate_to_committed(&mut self) -> io::Result<()> {
        let file = self.writer.get_ref().try_clone()?;
        let stale = std::mem::replace(&mut self.writer, BufWriter::new(file));
        // into_parts hands back the buffer without writing it
        let _ = stale.into_parts();
        let file = self.writer.get_ref();
        file.set_len(self.committed_len)?;
        file.sync_all()?;
        self.appends_since_compact = self.committed_appends;
        Ok(())
    }

    /// Return the WAL file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write compacted changes to a temp file and fsync.
    pub fn write_compact_file(path: &Path, changes: &[Change]) -> io::Result<()> {
        let tmp_path = path.with_extension("wal.tmp");
        let file = File::create(&tmp_path)?;
        let mut writer = BufWriter::new(file);
        for change in changes {
            encode_change(&mut writer, change)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Atomic swap: rename temp file over the WAL and reopen.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        let tmp_path = self.path.with_extension("wal.tmp");
        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.committed_len = file.metadata()?.len();
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        self.committed_appends = 0;
        self.poisoned = false;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, changes: &[Change]) -> io::Result<()> {
        Self::write_compact_file(&self.path, changes)?;
        self.swap_compact_file()
    }

    /// Make the append that would become record `n` (counted since the
    /// last compaction) write a partial prefix and fail.
    #[cfg(test)]
    pub(crate) fn fail_append_at(&mut self, n: u64) {
        self.fail_append_at = Some(n);
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Replay the WAL from disk, returning all valid changes.
    /// A truncated or corrupt tail (crash mid-append) is discarded with a warning.
    pub fn replay(path: &Path) -> io::Result<Vec<Change>> {
        scan(path).map(|(changes, _)| changes)
    }
}

/// Read every valid record; also returns the byte length of that valid prefix.
fn scan(path: &Path) -> io::Result<(Vec<Change>, u64)> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
        Err(e) => return Err(e),
    };
    let mut reader = BufReader::new(file);
    let mut changes = Vec::new();
    let mut valid_len = 0u64;

    loop {
        match read_entry(&mut reader)? {
            Entry::Change(change, len) => {
                changes.push(change);
                valid_len += len;
            }
            Entry::End => break,
            Entry::Torn(reason) => {
                tracing::warn!(
                    "WAL {}: discarding tail after {} records ({reason})",
                    path.display(),
                    changes.len()
                );
                break;
            }
        }
    }

    Ok((changes, valid_len))
}

/// Upper bound on a single encoded record; anything larger is a corrupt length prefix.
const MAX_RECORD_LEN: usize = 64 * 1024 * 1024;

enum Entry {
    /// A record and its encoded size in bytes.
    Change(Change, u64),
    End,
    Torn(&'static str),
}

/// Fill `buf`; `Ok(false)` on clean or partial EOF.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

fn read_entry(reader: &mut impl Read) -> io::Result<Entry> {
    let mut len_buf = [0u8; 4];
    if !read_full(reader, &mut len_buf)? {
        return Ok(Entry::End);
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_RECORD_LEN {
        return Ok(Entry::Torn("oversized length prefix"));
    }

    let mut payload = vec![0u8; len];
    if !read_full(reader, &mut payload)? {
        return Ok(Entry::Torn("truncated payload"));
    }

    let mut crc_buf = [0u8; 4];
    if !read_full(reader, &mut crc_buf)? {
        return Ok(Entry::Torn("truncated checksum"));
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(Entry::Torn("checksum mismatch"));
    }

    match bincode::deserialize::<Change>(&payload) {
        Ok(change) => Ok(Entry::Change(change, (len + 8) as u64)),
        Err(_) => Ok(Entry::Torn("undecodable payload")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{InvitationStatus, Span};
    use ulid::Ulid;

    fn tmp_path(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join("quorum_test_wal");
        fs::create_dir_all(&dir).unwrap();
        dir.join(name)
    }

    fn org(name: &str) -> Change {
        Change::OrganizationCreated {
            id: Ulid::new(),
            name: name.into(),
        }
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.wal");
        let _ = fs::remove_file(&path);

        let meeting_id = Ulid::new();
        let changes = vec![
            org("Acme"),
            Change::MeetingCreated {
                id: meeting_id,
                event_id: Ulid::new(),
                span: Span::new(1000, 2000),
                invitations: vec![(Ulid::new(), Ulid::new()), (Ulid::new(), Ulid::new())],
            },
            Change::InvitationAnswered {
                id: Ulid::new(),
                meeting_id,
                status: InvitationStatus::Accepted,
                scheduled: false,
            },
        ];

        {
            let mut wal = Wal::open(&path).unwrap();
            for c in &changes {
                wal.append(c).unwrap();
            }
        }

        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed, changes);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_handles_truncation() {
        let path = tmp_path("truncation.wal");
        let _ = fs::remove_file(&path);

        let change = org("Acme");
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&change).unwrap();
        }

        // Simulate a crash halfway through the second entry
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[0u8; 6]).unwrap();
        }

        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed, vec![change]);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_nonexistent_file() {
        let path = tmp_path("nonexistent.wal");
        let _ = fs::remove_file(&path);
        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn replay_corrupt_crc() {
        let path = tmp_path("corrupt_crc.wal");
        let _ = fs::remove_file(&path);

        {
            let payload = bincode::serialize(&org("Acme")).unwrap();
            let len = payload.len() as u32;
            let bad_crc: u32 = 0xDEADBEEF;

            let mut f = File::create(&path).unwrap();
            f.write_all(&len.to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&bad_crc.to_le_bytes()).unwrap();
        }

        assert!(Wal::replay(&path).unwrap().is_empty());

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn compact_reduces_wal() {
        let path = tmp_path("compact_reduce.wal");
        let _ = fs::remove_file(&path);

        let meeting_id = Ulid::new();
        let invitation_id = Ulid::new();
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&Change::MeetingCreated {
                id: meeting_id,
                event_id: Ulid::new(),
                span: Span::new(0, 1000),
                invitations: vec![(invitation_id, Ulid::new())],
            })
            .unwrap();
            // The same invitee changing their mind over and over
            for i in 0..20 {
                let status = if i % 2 == 0 {
                    InvitationStatus::Accepted
                } else {
                    InvitationStatus::Rejected
                };
                wal.append(&Change::InvitationAnswered {
                    id: invitation_id,
                    meeting_id,
                    status,
                    scheduled: true,
                })
                .unwrap();
            }
        }

        let before = fs::metadata(&path).unwrap().len();
        let compacted = vec![org("only")];
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.compact(&compacted).unwrap();
            assert_eq!(wal.appends_since_compact(), 0);
        }
        let after = fs::metadata(&path).unwrap().len();
        assert!(after < before, "compacted WAL should be smaller: {after} < {before}");

        assert_eq!(Wal::replay(&path).unwrap(), compacted);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn compact_then_append() {
        let path = tmp_path("compact_append.wal");
        let _ = fs::remove_file(&path);

        let compacted = vec![org("a")];
        let next = org("b");

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&compacted[0]).unwrap();
            wal.compact(&compacted).unwrap();
            wal.append(&next).unwrap();
        }

        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed, vec![compacted[0].clone(), next]);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn append_buffered_then_flush_sync() {
        let path = tmp_path("buffered_flush.wal");
        let _ = fs::remove_file(&path);

        let changes: Vec<Change> = (0..5).map(|i| org(&format!("org {i}"))).collect();

        {
            let mut wal = Wal::open(&path).unwrap();
            for c in &changes {
                wal.append_buffered(c).unwrap();
            }
            assert_eq!(wal.appends_since_compact(), 5);
            wal.flush_sync().unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap(), changes);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn failed_batch_rolls_back_to_last_commit() {
        let path = tmp_path("failed_batch.wal");
        let _ = fs::remove_file(&path);

        let committed = org("committed");
        let after = org("after");
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&committed).unwrap();

            // Three-record batch whose second append fails halfway
            wal.fail_append_at(2);
            wal.append_buffered(&org("first")).unwrap();
            assert!(wal.append_buffered(&org("second")).is_err());
            wal.rollback().unwrap();
            assert_eq!(wal.appends_since_compact(), 1);

            wal.fail_append_at(u64::MAX);
            wal.append(&after).unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap(), vec![committed, after]);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn rollback_truncates_bytes_already_on_disk() {
        let path = tmp_path("rollback_on_disk.wal");
        let _ = fs::remove_file(&path);

        let committed = org("committed");
        let after = org("after");
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&committed).unwrap();
            let len = fs::metadata(&path).unwrap().len();

            // A spilled buffer plus a partial record reach the file, then fsync fails
            wal.append_buffered(&org("spilled")).unwrap();
            wal.writer.flush().unwrap();
            wal.writer.write_all(&[1, 2, 3]).unwrap();
            wal.writer.flush().unwrap();
            assert!(fs::metadata(&path).unwrap().len() > len);

            wal.rollback().unwrap();
            assert_eq!(fs::metadata(&path).unwrap().len(), len);
            wal.append(&after).unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap(), vec![committed, after]);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn recover_truncates_torn_tail_before_appending() {
        let path = tmp_path("recover_torn.wal");
        let _ = fs::remove_file(&path);

        let first = org("first");
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&first).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[0u8; 6]).unwrap();
        }

        let second = org("second");
        {
            let (mut wal, changes) = Wal::recover(&path).unwrap();
            assert_eq!(changes, vec![first.clone()]);
            wal.append(&second).unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap(), vec![first, second]);

        let _ = fs::remove_file(&path);
    }
}

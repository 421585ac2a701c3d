// src/commit.rs

//! Transaction construction, the commit protocol, and rollback-by-inverse
//!
//! [`Transaction`] accumulates operations added by the caller, then
//! [`Transaction::commit`] drives the full sequence from spec: allocate an
//! ID, lock, snapshot pre-images, write and fsync the journal record,
//! apply and fsync the data file (the point of no return), and finally
//! retire the journal file — or hand it to the linger registry instead of
//! unlinking it immediately.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use std::sync::Mutex;

use crate::error::{Error, Result};
use crate::handle::{FileHandle, LibraryFlags, LingeringTx};
use crate::lock::{self, Range, RangeLockGuard};
use crate::record::{self, OpRecord, TxRecord};

/// One pending write: an absolute offset and the new bytes to install
/// there. `pre_image`, `extended`, and `original_len` are filled in during
/// [`Transaction::commit`]'s pre-image-capture step, not by the caller.
#[derive(Debug, Clone)]
pub struct Operation {
    pub(crate) offset: u64,
    pub(crate) new_payload: Vec<u8>,
    pub(crate) pre_image: Vec<u8>,
    /// Set if this write's range extended past the file's length at the
    /// moment it was captured.
    pub(crate) extended: bool,
    /// The file's length immediately before this operation was captured,
    /// recorded only when `extended` is set — the truncate-back target if
    /// the transaction is later rolled back.
    pub(crate) original_len: Option<u64>,
}

/// Terminal flags, tracked independently rather than as a single
/// mutually-exclusive state: spec.md §3 requires a transaction's flags to
/// be monotonically set and never cleared once set, so `committed` must
/// stay true after a later `rollback()` rather than flipping to some
/// other state that erases it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct TxFlags {
    committed: bool,
    rolled_back: bool,
}

impl TxFlags {
    fn terminated(self) -> bool {
        self.committed || self.rolled_back
    }
}

/// No resources outlive a `Transaction` beyond what `Vec`/`Mutex` already
/// clean up on drop — the journal file descriptor closes (and its lock
/// releases) before `commit` returns — so there is no explicit `Drop`
/// impl here; ordinary scope-exit is the whole story.
pub struct Transaction<'h> {
    handle: &'h FileHandle,
    id: u32,
    flags: TxFlags,
    read_only: bool,
    no_lock: bool,
    linger: bool,
    ops: Mutex<Vec<Operation>>,
    /// Rollback-only: shrink the data file to this length after applying
    /// the inverse writes. Never persisted in the on-disk record — see
    /// the note on [`Transaction::rollback`].
    truncate_after: Option<u64>,
}

/// Cumulative byte budget for one journal record, matching spec's
/// "bytes committed so far would exceed the platform's signed size-type
/// range" boundary case.
const MAX_RECORD_BYTES: u64 = i64::MAX as u64 / 2;

impl<'h> Transaction<'h> {
    /// Begin a new transaction against `handle`, inheriting its library
    /// flags (no-lock, linger, read-only).
    pub fn new(handle: &'h FileHandle) -> Self {
        let lib_flags = handle.flags();
        Self {
            handle,
            id: 0,
            flags: TxFlags::default(),
            read_only: lib_flags.contains(LibraryFlags::RDONLY),
            no_lock: lib_flags.contains(LibraryFlags::NOLOCK),
            linger: lib_flags.contains(LibraryFlags::LINGER),
            ops: Mutex::new(Vec::new()),
            truncate_after: None,
        }
    }

    /// Flags as they go into the on-disk record. `COMMITTED` is set
    /// unconditionally here because the record is only ever encoded once,
    /// at step 6 of the commit protocol, which is by definition the
    /// moment this transaction is decided to commit — the same "write the
    /// outcome to the log before touching the data" ordering any redo log
    /// relies on. `ROLLED_BACK`/`ROLLING_BACK` describe states this
    /// design never persists: rollback runs as a fresh commit of the
    /// inverse operations rather than an in-place mutation of the
    /// original record, so there is nothing to mark after the fact.
    fn record_flags(&self) -> u32 {
        let mut bits = record::flags::COMMITTED;
        if self.read_only {
            bits |= record::flags::READ_ONLY;
        }
        if self.no_lock {
            bits |= record::flags::NO_LOCK;
        }
        if self.linger {
            bits |= record::flags::LINGER;
        }
        bits
    }

    /// Queue a write of `buf` at absolute `offset`. The buffer is copied
    /// immediately; the caller may reuse or drop it on return.
    pub fn add(&self, buf: &[u8], offset: u64) -> Result<()> {
        if self.flags.terminated() {
            return Err(Error::State("transaction already terminated".into()));
        }
        if self.read_only {
            return Err(Error::State("handle is read-only".into()));
        }
        if buf.is_empty() {
            return Err(Error::Malformed("zero-length operation".into()));
        }
        offset
            .checked_add(buf.len() as u64)
            .ok_or_else(|| Error::Malformed("operation offset+length overflow".into()))?;

        let mut ops = self.ops.lock().unwrap();
        let projected: u64 = ops
            .iter()
            .map(|o| (record::OP_HEADER_LEN + o.new_payload.len() + o.pre_image.len()) as u64)
            .sum::<u64>()
            + record::OP_HEADER_LEN as u64
            + buf.len() as u64;
        if projected > MAX_RECORD_BYTES {
            return Err(Error::Malformed(
                "transaction would exceed the maximum journal record size".into(),
            ));
        }

        ops.push(Operation {
            offset,
            new_payload: buf.to_vec(),
            pre_image: Vec::new(),
            extended: false,
            original_len: None,
        });
        Ok(())
    }

    /// Internal constructor used only by [`Transaction::rollback`] to
    /// build the inverse transaction directly, bypassing `add`'s
    /// zero-length rejection (a pre-image can legitimately be empty) and
    /// carrying the truncate-back directive.
    fn from_inverse(
        handle: &'h FileHandle,
        read_only: bool,
        no_lock: bool,
        linger: bool,
        writes: Vec<(u64, Vec<u8>)>,
        truncate_after: Option<u64>,
    ) -> Self {
        let ops = writes
            .into_iter()
            .map(|(offset, new_payload)| Operation {
                offset,
                new_payload,
                pre_image: Vec::new(),
                extended: false,
                original_len: None,
            })
            .collect();
        Self {
            handle,
            id: 0,
            flags: TxFlags::default(),
            read_only,
            no_lock,
            linger,
            ops: Mutex::new(ops),
            truncate_after,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn is_committed(&self) -> bool {
        self.flags.committed
    }

    /// True once [`Transaction::rollback`] has run to completion. Does not
    /// clear `is_committed()` — both bits can be set at once, matching
    /// spec.md §3's "flags are monotonically set, never cleared".
    pub fn is_rolled_back(&self) -> bool {
        self.flags.rolled_back
    }

    /// Run the full commit protocol (spec.md's numbered steps 1-8). On
    /// success the transaction is marked committed; on failure before the
    /// data file is touched, all resources acquired so far (locks, the
    /// partially written journal file) are released/unlinked and the
    /// transaction is left `Open` so the caller could, in principle, fix
    /// the problem and retry — though in practice most failures here are
    /// not transient.
    pub fn commit(&mut self) -> Result<()> {
        if self.flags.terminated() {
            return Err(Error::State("transaction already terminated".into()));
        }
        if self.read_only {
            return Err(Error::State("handle is read-only".into()));
        }
        let has_ops = !self.ops.lock().unwrap().is_empty();
        if !has_ops && self.truncate_after.is_none() {
            return Err(Error::Malformed("transaction has no operations".into()));
        }

        let _txn_guard = self.handle.txn_guard.lock().unwrap();

        // Step 2: allocate an ID and create the journal file.
        let id = {
            let mut jdir = self.handle.jdir().lock().unwrap();
            crate::idalloc::next_id(&mut jdir)?
        };
        log::debug!("txn {id}: allocated, beginning commit");
        let tx_path = self.handle.jdir().lock().unwrap().tx_path(id);
        let tx_file = crate::jdir::create_tx_file(&tx_path)?;

        let mut cleanup = PendingJournalFile {
            path: tx_path.clone(),
            armed: true,
        };

        let result = self.commit_inner(id, &tx_path, &tx_file, &mut cleanup);
        match result {
            Ok(()) => {
                self.id = id;
                self.flags.committed = true;
                Ok(())
            }
            Err(e) => {
                log::warn!("txn {id}: commit failed before completion: {e}");
                Err(e)
            }
        }
    }

    fn commit_inner(
        &mut self,
        id: u32,
        tx_path: &std::path::Path,
        tx_file: &File,
        cleanup: &mut PendingJournalFile,
    ) -> Result<()> {
        // Step 3: whole-file lock on the journal file itself.
        log::debug!("txn {id}: locking journal file {}", tx_path.display());
        lock::lock_exclusive(tx_file, Range::new(0, 0))?;

        // Step 4: region lock(s) on the data file.
        let ranges: Vec<Range> = self
            .ops
            .lock()
            .unwrap()
            .iter()
            .map(|o| Range::new(o.offset, o.new_payload.len() as u64))
            .collect();
        let _region_guards = if self.no_lock {
            log::debug!("txn {id}: no-lock flag set, skipping data-file region locks");
            Vec::new()
        } else {
            log::debug!("txn {id}: acquiring {} data-file region lock(s)", ranges.len());
            acquire_region_locks(self.handle.data_file(), &ranges)?
        };

        // Step 5: pre-image capture, with file-extending detection.
        {
            let mut ops = self.ops.lock().unwrap();
            for op in ops.iter_mut() {
                capture_pre_image(self.handle.data_file(), op)?;
                if op.extended {
                    log::debug!(
                        "txn {id}: write at offset {} extends the file past {} bytes",
                        op.offset,
                        op.original_len.unwrap_or(0)
                    );
                }
            }
        }

        // Step 6: serialize, write, fsync journal file, fsync journal dir.
        let record = TxRecord {
            id,
            flags: self.record_flags(),
            ops: self
                .ops
                .lock()
                .unwrap()
                .iter()
                .map(|o| OpRecord {
                    offset: o.offset,
                    new_payload: o.new_payload.clone(),
                    pre_image: o.pre_image.clone(),
                })
                .collect(),
        };
        let encoded = record.encode();
        write_all_at_retrying(tx_file, &encoded, 0)?;
        tx_file.sync_all().map_err(Error::Io)?;
        log::debug!("txn {id}: journal record fsynced ({} bytes)", encoded.len());
        self.handle.jdir().lock().unwrap().fsync()?;
        log::debug!("txn {id}: journal directory fsynced, record is durable");

        // Past this point the journal record is durable and complete; a
        // crash or error from here on is recovered by fsck re-applying
        // it, not by us deleting it.
        cleanup.armed = false;

        // Step 7: POINT OF NO RETURN — apply to the data file.
        log::debug!("txn {id}: applying {} write(s) to the data file", record.ops.len());
        {
            let ops = self.ops.lock().unwrap();
            for op in ops.iter() {
                write_all_at_retrying(self.handle.data_file(), &op.new_payload, op.offset)?;
            }
        }
        if let Some(target) = self.truncate_after {
            self.handle.data_file().set_len(target).map_err(Error::Io)?;
        }
        self.handle.data_file().sync_all().map_err(Error::Io)?;
        log::debug!("txn {id}: data file fsynced, commit is durable");

        if self.linger {
            log::debug!("txn {id}: linger mode, deferring journal-file unlink to jsync");
            self.handle.linger.lock().unwrap().push(LingeringTx {
                id,
                path: tx_path.to_path_buf(),
            });
        } else {
            self.handle.jdir().lock().unwrap().fsync()?;
            std::fs::remove_file(tx_path).map_err(Error::Io)?;
            self.handle.jdir().lock().unwrap().fsync()?;
            log::debug!("txn {id}: journal file unlinked and directory fsynced");
        }

        log::info!("txn {id}: committed");
        Ok(())
    }

    /// Undo a committed transaction by constructing and committing its
    /// inverse: each operation's pre-image becomes the inverse's new
    /// payload, applied in reverse order. Refused if the parent handle
    /// carries [`LibraryFlags::NOROLLBACK`] or if `self` was never
    /// committed.
    ///
    /// File-extending operations get a truncate-back to the length the
    /// file had immediately before they ran. That truncate is carried as
    /// an in-memory-only directive on the inverse transaction, applied
    /// right after its writes and before its closing fsync — it has no
    /// representation in the on-disk record format, so it is not itself
    /// crash-recoverable independent of the writes around it. If another
    /// writer extended the file again after the original commit, rollback
    /// truncates those bytes away along with the ones it owns; this is
    /// the one case where rollback can lose data that was never part of
    /// the transaction being undone.
    ///
    /// Takes `&mut self`, not `self`, the same as [`Transaction::commit`]:
    /// the transaction is still terminated afterward (`add`/`commit`/
    /// `rollback` again all fail), but `is_committed()` stays true and
    /// `is_rolled_back()` becomes true too, per spec.md §3's "flags are
    /// monotonically set, never cleared".
    pub fn rollback(&mut self) -> Result<()> {
        if self.handle.flags().contains(LibraryFlags::NOROLLBACK) {
            return Err(Error::State("handle has rollback disabled".into()));
        }
        if !self.flags.committed {
            return Err(Error::State("transaction was not committed".into()));
        }
        if self.flags.rolled_back {
            return Err(Error::State("transaction already terminated".into()));
        }

        let orig_ops = std::mem::take(&mut *self.ops.lock().unwrap());
        let truncate_after = orig_ops.iter().find(|o| o.extended).and_then(|o| o.original_len);
        let writes: Vec<(u64, Vec<u8>)> = orig_ops
            .iter()
            .rev()
            .filter(|o| !o.pre_image.is_empty())
            .map(|o| (o.offset, o.pre_image.clone()))
            .collect();

        log::debug!(
            "txn {}: rolling back via inverse transaction ({} write(s))",
            self.id,
            writes.len()
        );
        let mut inverse = Transaction::from_inverse(
            self.handle,
            self.read_only,
            self.no_lock,
            self.linger,
            writes,
            truncate_after,
        );
        inverse.commit()?;
        self.flags.rolled_back = true;
        log::info!("txn {}: rolled back as txn {}", self.id, inverse.id());
        Ok(())
    }
}

/// Unlinks a freshly created, not-yet-durable journal file if still
/// armed when dropped — the rollback path for commit steps that fail
/// before the journal record is fsynced.
struct PendingJournalFile {
    path: PathBuf,
    armed: bool,
}

impl Drop for PendingJournalFile {
    fn drop(&mut self) {
        if self.armed {
            log::debug!(
                "commit failed before the journal record was durable, unlinking {}",
                self.path.display()
            );
            if let Err(e) = std::fs::remove_file(&self.path) {
                log::warn!("failed to unlink partial journal file {}: {e}", self.path.display());
            }
        }
    }
}

/// Lock either each operation's range individually (when they're
/// pairwise disjoint, to minimize interference with unrelated concurrent
/// commits) or their union as one lock otherwise.
fn acquire_region_locks<'a>(file: &'a File, ranges: &[Range]) -> Result<Vec<RangeLockGuard<'a>>> {
    if ranges.is_empty() {
        return Ok(Vec::new());
    }
    if ranges_pairwise_disjoint(ranges) {
        ranges
            .iter()
            .map(|r| RangeLockGuard::acquire(file, *r))
            .collect()
    } else {
        let union = Range::union(ranges).expect("ranges is non-empty");
        Ok(vec![RangeLockGuard::acquire(file, union)?])
    }
}

fn ranges_pairwise_disjoint(ranges: &[Range]) -> bool {
    for i in 0..ranges.len() {
        for j in (i + 1)..ranges.len() {
            if ranges_overlap(ranges[i], ranges[j]) {
                return false;
            }
        }
    }
    true
}

fn ranges_overlap(a: Range, b: Range) -> bool {
    let a_end = if a.length == 0 { u64::MAX } else { a.offset + a.length };
    let b_end = if b.length == 0 { u64::MAX } else { b.offset + b.length };
    a.offset < b_end && b.offset < a_end
}

/// Snapshot the bytes an operation is about to overwrite, detecting and
/// recording the file-extending case.
fn capture_pre_image(data_file: &File, op: &mut Operation) -> Result<()> {
    let cur_len = data_file.metadata().map_err(Error::Io)?.len();
    let want_len = op.new_payload.len() as u64;
    let read_len = if op.offset >= cur_len {
        0
    } else {
        (cur_len - op.offset).min(want_len)
    };

    let mut pre_image = vec![0u8; read_len as usize];
    if read_len > 0 {
        data_file.read_exact_at(&mut pre_image, op.offset).map_err(Error::Io)?;
    }

    let target_len = op.offset + want_len;
    let extended = target_len > cur_len;
    if extended {
        data_file.set_len(target_len).map_err(Error::Io)?;
        op.original_len = Some(cur_len);
    }

    op.pre_image = pre_image;
    op.extended = extended;
    Ok(())
}

/// Write `buf` at absolute `offset`, retrying on short writes (spec's
/// "retries until either the full write lands or a hard error occurs").
fn write_all_at_retrying(file: &File, buf: &[u8], offset: u64) -> Result<()> {
    let mut written = 0usize;
    while written < buf.len() {
        let n = file
            .write_at(&buf[written..], offset + written as u64)
            .map_err(Error::Io)?;
        if n == 0 {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_at returned 0",
            )));
        }
        written += n;
    }
    Ok(())
}

/// Read the whole journal file into memory; used by recovery, which
/// operates on complete records rather than positional slices.
pub(crate) fn read_whole_file(file: &mut File) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    file.seek(SeekFrom::Start(0)).map_err(Error::Io)?;
    file.read_to_end(&mut buf).map_err(Error::Io)?;
    Ok(buf)
}

/// Re-apply a decoded record's writes to the data file directly, used by
/// fsck when it chooses to roll a transaction forward. Bypasses
/// `Transaction` entirely — recovery holds its own locks and has already
/// validated the record.
pub(crate) fn apply_record(data_file: &File, record: &TxRecord) -> Result<()> {
    for op in &record.ops {
        write_all_at_retrying(data_file, &op.new_payload, op.offset)?;
    }
    data_file.sync_all().map_err(Error::Io)
}

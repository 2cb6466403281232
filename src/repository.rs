//! Repository synchronization.
//!
//! Both on-controller repositories (sensor records and the event log) are
//! append/erase-only collections of binary records that can be mutated by
//! the controller while being read. The synchronizer produces an ordered
//! snapshot using the reservation protocol when the controller offers it,
//! restarting the whole multi-round read when a reservation is lost.

use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use rand::Rng;

use crate::commands::{Command, GetRecord, GetRepositoryInfo, ReserveRepository};
use crate::error::{Error, Result};
use crate::observe;
use crate::protocol::{MAX_RECORD_CHUNK, RECORD_HEADER_LEN};
use crate::types::{
    cc, Message, RawRecord, RawResponse, RepositoryCaps, RepositoryKind, END_OF_RECORDS,
    FIRST_RECORD_ID,
};

/// Maximum whole-read restarts after lost reservations before the cycle
/// gives up for this period.
const MAX_FETCH_RETRIES: u32 = 10;

/// Count value requesting the entire record in one read, for repositories
/// without partial-read support.
const READ_ENTIRE_RECORD: u8 = 0xFF;

/// Command transport seam used by the synchronizer.
///
/// Production code backs this with a connection plus a controller address;
/// tests back it with scripted fakes.
pub trait CommandIo {
    /// Send one command to the repository's controller and return the raw
    /// response.
    fn exchange(&self, msg: Message) -> Result<RawResponse>;
}

fn run<C: Command>(io: &dyn CommandIo, cmd: C) -> Result<C::Output> {
    let response = io.exchange(cmd.message())?;
    cmd.parse_response(response)
}

/// Synchronization outcome for one cycle.
#[derive(Debug, Clone)]
pub enum SyncOutcome {
    /// Change counters matched the stored snapshot; nothing was fetched.
    Unchanged,
    /// A new snapshot replaced the stored one.
    Replaced {
        /// The new ordered record list.
        records: Arc<Vec<RawRecord>>,
        /// Ids present in the previous snapshot and gone now.
        removed: Vec<u16>,
    },
}

/// Local mirror of one repository on one controller.
///
/// The record list is replaced wholesale at the end of a successful cycle,
/// never mutated in place, so concurrent readers either see the previous
/// complete snapshot or the new one.
#[derive(Debug)]
pub struct Repository {
    kind: RepositoryKind,
    fetched: bool,
    last_addition: u32,
    last_erase: u32,
    caps: RepositoryCaps,
    records: Arc<Vec<RawRecord>>,
}

impl Repository {
    /// Create an empty, never-fetched mirror.
    pub fn new(kind: RepositoryKind) -> Self {
        Self {
            kind,
            fetched: false,
            last_addition: 0,
            last_erase: 0,
            caps: RepositoryCaps::default(),
            records: Arc::new(Vec::new()),
        }
    }

    /// Which repository this mirrors.
    pub fn kind(&self) -> RepositoryKind {
        self.kind
    }

    /// True once at least one cycle has completed.
    pub fn is_fetched(&self) -> bool {
        self.fetched
    }

    /// Capability flags from the most recent metadata read.
    pub fn caps(&self) -> RepositoryCaps {
        self.caps
    }

    /// The current snapshot (cheap to clone and hold across a swap).
    pub fn records(&self) -> Arc<Vec<RawRecord>> {
        Arc::clone(&self.records)
    }
}

/// Run one synchronization cycle against `io`.
///
/// The lock is held only to read the stored counters and to swap in the
/// finished snapshot; all wire traffic happens without it, so readers are
/// never blocked behind a fetch. On any failure the stored snapshot is
/// left untouched and the caller simply retries next period.
pub fn synchronize(cell: &RwLock<Repository>, io: &dyn CommandIo) -> Result<SyncOutcome> {
    let started = Instant::now();
    let kind = read_guard(cell).kind;

    // Metadata failure is a hard error, distinct from an empty repository.
    let info = run(io, GetRepositoryInfo { kind })?;

    {
        let mut repo = write_guard(cell);
        repo.caps = info.caps;
        if repo.fetched
            && repo.last_addition == info.addition_counter
            && repo.last_erase == info.erase_counter
        {
            observe::record_sync(kind, "unchanged", started.elapsed());
            return Ok(SyncOutcome::Unchanged);
        }
    }

    let mut caps = info.caps;
    let records = match fetch_all(io, kind, info.entries, &mut caps) {
        Ok(records) => records,
        Err(err) => {
            observe::record_sync(kind, "failed", started.elapsed());
            return Err(err);
        }
    };

    let mut repo = write_guard(cell);
    let removed: Vec<u16> = repo
        .records
        .iter()
        .map(|old| old.id)
        .filter(|id| !records.iter().any(|new| new.id == *id))
        .collect();

    let records = Arc::new(records);
    repo.records = Arc::clone(&records);
    repo.last_addition = info.addition_counter;
    repo.last_erase = info.erase_counter;
    repo.caps = caps;
    repo.fetched = true;

    observe::record_sync(kind, "replaced", started.elapsed());
    Ok(SyncOutcome::Replaced { records, removed })
}

fn read_guard(cell: &RwLock<Repository>) -> std::sync::RwLockReadGuard<'_, Repository> {
    cell.read().unwrap_or_else(|e| e.into_inner())
}

fn write_guard(cell: &RwLock<Repository>) -> std::sync::RwLockWriteGuard<'_, Repository> {
    cell.write().unwrap_or_else(|e| e.into_inner())
}

/// The retryable transaction: reserve (when supported), walk the whole
/// chain, and restart from scratch on a lost reservation.
fn fetch_all(
    io: &dyn CommandIo,
    kind: RepositoryKind,
    declared_entries: u16,
    caps: &mut RepositoryCaps,
) -> Result<Vec<RawRecord>> {
    for attempt in 0..MAX_FETCH_RETRIES {
        let reservation = if caps.reserve {
            match run(io, ReserveRepository { kind }) {
                Ok(token) => token,
                Err(Error::CompletionCode {
                    completion_code: cc::INVALID_COMMAND,
                }) => {
                    // The controller advertised or was assumed to support
                    // reservations but rejects the command; fall back to
                    // unreserved reads with reduced consistency.
                    caps.reserve = false;
                    0
                }
                Err(err) => return Err(err),
            }
        } else {
            0
        };

        match read_chain(io, kind, reservation, declared_entries, caps.partial_read) {
            Ok(records) => return Ok(records),
            Err(err) if err.is_reservation_lost() => {
                observe::record_reservation_lost(kind);
                backoff(attempt);
            }
            Err(err) => return Err(err),
        }
    }

    Err(Error::FetchRetriesExceeded)
}

/// The controller is busy mutating the repository; give it a moment
/// before restarting, with a little jitter so concurrent readers of the
/// same controller do not collide in lockstep.
fn backoff(attempt: u32) {
    let jitter = rand::rng().random_range(0..10u64);
    std::thread::sleep(Duration::from_millis(10 * u64::from(attempt + 1) + jitter));
}

fn read_chain(
    io: &dyn CommandIo,
    kind: RepositoryKind,
    reservation: u16,
    declared_entries: u16,
    partial_read: bool,
) -> Result<Vec<RawRecord>> {
    // The declared count is an estimate used as a defensive early bound;
    // zero still permits one probe read (matching controllers that report
    // zero while holding records).
    let bound = usize::from(declared_entries.max(1));

    let mut records: Vec<RawRecord> = Vec::new();
    let mut record_id = FIRST_RECORD_ID;

    loop {
        let (record, next) = read_record(
            io,
            kind,
            reservation,
            record_id,
            records.is_empty(),
            partial_read,
        )?;
        let Some(record) = record else {
            break;
        };
        records.push(record);

        if next == END_OF_RECORDS || records.len() >= bound {
            break;
        }
        record_id = next;
    }

    Ok(records)
}

/// Fetch one record. With partial-read support: a header-only read to
/// learn its total length and the next chain id, then bounded chunk reads
/// at increasing offsets. Without it, the only legal request is one read
/// of the entire record.
///
/// Returns `(None, ...)` when the first read of a cycle reports an empty
/// repository, which is a valid outcome rather than an error.
fn read_record(
    io: &dyn CommandIo,
    kind: RepositoryKind,
    reservation: u16,
    record_id: u16,
    first: bool,
    partial_read: bool,
) -> Result<(Option<RawRecord>, u16)> {
    let count = if partial_read {
        RECORD_HEADER_LEN as u8
    } else {
        READ_ENTIRE_RECORD
    };
    let head = match run(
        io,
        GetRecord {
            kind,
            reservation,
            record_id,
            offset: 0,
            count,
        },
    ) {
        Ok(slice) => slice,
        Err(Error::CompletionCode {
            completion_code: cc::NOT_PRESENT | cc::UNSPECIFIED,
        }) if first => return Ok((None, END_OF_RECORDS)),
        Err(err) => return Err(err),
    };

    if head.data.len() < RECORD_HEADER_LEN {
        return Err(Error::Protocol("record header too short"));
    }

    let id = u16::from_le_bytes([head.data[0], head.data[1]]);
    let version = head.data[2];
    let record_type = head.data[3];
    let total = RECORD_HEADER_LEN + usize::from(head.data[4]);
    let next_record_id = head.next_record_id;

    let data = if partial_read {
        if total > usize::from(u8::MAX) {
            return Err(Error::Unsupported("record exceeds offset-addressable length"));
        }
        let mut data = head.data[..RECORD_HEADER_LEN].to_vec();
        let mut offset = RECORD_HEADER_LEN;
        while offset < total {
            let count = (total - offset).min(MAX_RECORD_CHUNK);
            let part = run(
                io,
                GetRecord {
                    kind,
                    reservation,
                    record_id,
                    offset: offset as u8,
                    count: count as u8,
                },
            )?;
            if part.data.len() != count {
                return Err(Error::Protocol("short record read"));
            }
            data.extend_from_slice(&part.data);
            offset += count;
        }
        data
    } else {
        if head.data.len() != total {
            return Err(Error::Protocol("record length mismatch"));
        }
        head.data
    };

    Ok((
        Some(RawRecord {
            id,
            version,
            record_type,
            data,
        }),
        next_record_id,
    ))
}

//! Per-node byte-range lock bookkeeping.
//!
//! Each node carries a list of advisory lock records. The bridge consults
//! this list to answer `getlk` queries without a filesystem round trip and
//! keeps it minimal on `setlk`: same-owner records are merged, truncated,
//! split, or removed so the list always reads "this owner holds this kind
//! of lock over this range and nothing else". Records from other owners
//! are never modified here; cross-owner conflicts are resolved by the
//! caller before insertion.

/// Inclusive range end for a lock covering the rest of the file
/// (`l_len == 0` in flock terms).
pub const OFFSET_MAX: u64 = i64::MAX as u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    Shared,
    Exclusive,
    /// A release request. Never stored in a lock list; inserting it only
    /// removes or shrinks the owner's overlapping records.
    Unlock,
}

impl LockKind {
    pub fn from_flock_type(typ: i32) -> Option<LockKind> {
        match typ {
            libc::F_RDLCK => Some(LockKind::Shared),
            libc::F_WRLCK => Some(LockKind::Exclusive),
            libc::F_UNLCK => Some(LockKind::Unlock),
            _ => None,
        }
    }

    pub fn to_flock_type(self) -> i32 {
        match self {
            LockKind::Shared => libc::F_RDLCK,
            LockKind::Exclusive => libc::F_WRLCK,
            LockKind::Unlock => libc::F_UNLCK,
        }
    }
}

/// One advisory byte-range lock. `start` and `end` are inclusive byte
/// offsets; `owner` is the opaque lock-owner token from the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockRecord {
    pub kind: LockKind,
    pub start: u64,
    pub end: u64,
    pub owner: u64,
    pub pid: u32,
}

impl LockRecord {
    pub fn overlaps(&self, other: &LockRecord) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    fn conflicts_with(&self, probe: &LockRecord) -> bool {
        self.owner != probe.owner
            && self.overlaps(probe)
            && (self.kind == LockKind::Exclusive || probe.kind == LockKind::Exclusive)
    }
}

/// Find a record from a different owner that conflicts with `probe`.
/// Overlap plus at least one exclusive side is a conflict; an owner never
/// conflicts with itself.
pub(crate) fn find_conflict(locks: &[LockRecord], probe: &LockRecord) -> Option<LockRecord> {
    locks.iter().find(|l| l.conflicts_with(probe)).copied()
}

/// Insert `new` into `locks`, normalizing the owner's records.
///
/// Same-kind records that overlap or touch the new range are absorbed
/// into it. Different-kind records have the new range carved out of them,
/// which may shrink them on either side or split one record in two.
/// An `Unlock` insertion only carves; nothing is stored for it.
pub(crate) fn insert(locks: &mut Vec<LockRecord>, new: LockRecord) {
    let mut merged = new;
    let mut result: Vec<LockRecord> = Vec::with_capacity(locks.len() + 2);

    for rec in locks.drain(..) {
        if rec.owner != merged.owner {
            result.push(rec);
            continue;
        }
        if rec.kind == merged.kind {
            // Merge overlapping or adjacent ranges of the same kind.
            if rec.end.saturating_add(1) < merged.start || merged.end.saturating_add(1) < rec.start
            {
                result.push(rec);
            } else {
                merged.start = merged.start.min(rec.start);
                merged.end = merged.end.max(rec.end);
            }
        } else {
            if !rec.overlaps(&merged) {
                result.push(rec);
                continue;
            }
            // Carve the new range out of the old record. Fully covered
            // records disappear; a record straddling both ends splits.
            if rec.start < merged.start {
                result.push(LockRecord {
                    end: merged.start - 1,
                    ..rec
                });
            }
            if rec.end > merged.end {
                result.push(LockRecord {
                    start: merged.end + 1,
                    ..rec
                });
            }
        }
    }

    if merged.kind != LockKind::Unlock {
        result.push(merged);
    }
    result.sort_by_key(|l| (l.owner, l.start));
    *locks = result;
}

//! Directory handles and the serialized entry buffer.
//!
//! A directory handle lives from `opendir` to `releasedir` and carries a
//! growable byte buffer of serialized entries. The first read at offset
//! zero fills the buffer from the filesystem; later reads slice it
//! without another filesystem call. A rewind to offset zero forces a
//! refill. Filesystems that track their own directory offsets get the
//! windowed mode instead: only the requested window is buffered and the
//! `filled` flag stays off.

use fuser::FileType;
use parking_lot::Mutex;
use std::ffi::{OsStr, OsString};
use std::os::unix::ffi::{OsStrExt, OsStringExt};

use crate::bridge::convert::{file_type_code, file_type_from_code};

/// Fixed part of a serialized entry: ino, next offset, type code, name
/// length.
const ENTRY_HEADER: usize = 24;

pub(crate) struct DirHandle {
    /// Handle token the filesystem returned from `opendir`.
    pub fs_fh: u64,
    /// Node the directory was opened at.
    pub node: u64,
    pub buf: Mutex<DirBuffer>,
}

#[derive(Debug, Default)]
pub(crate) struct DirBuffer {
    contents: Vec<u8>,
    pub filled: bool,
    /// Byte budget of the request currently being filled (windowed mode).
    needlen: usize,
}

fn entry_len(name_len: usize) -> usize {
    (ENTRY_HEADER + name_len + 7) & !7
}

impl DirBuffer {
    pub fn reset(&mut self, needlen: usize) {
        self.contents.clear();
        self.filled = true;
        self.needlen = needlen;
    }

    /// Append one entry. `fs_offset` is the offset the filesystem passed
    /// to the filler: zero means the filesystem does not track offsets
    /// and the whole directory is being buffered; nonzero switches to
    /// windowed mode where the buffer holds at most `needlen` bytes and
    /// the stored offset is the filesystem's own. Returns true when the
    /// window is full and streaming should stop.
    pub fn push_entry(&mut self, ino: u64, fs_offset: i64, kind: FileType, name: &OsStr) -> bool {
        let reclen = entry_len(name.as_bytes().len());
        if fs_offset != 0 {
            self.filled = false;
            if self.contents.len() + reclen > self.needlen {
                return true;
            }
            self.append(ino, fs_offset, kind, name);
        } else {
            let next = (self.contents.len() + reclen) as i64;
            self.append(ino, next, kind, name);
        }
        false
    }

    fn append(&mut self, ino: u64, offset: i64, kind: FileType, name: &OsStr) {
        let name = name.as_bytes();
        self.contents.extend_from_slice(&ino.to_le_bytes());
        self.contents.extend_from_slice(&offset.to_le_bytes());
        self.contents.extend_from_slice(&file_type_code(kind).to_le_bytes());
        self.contents.extend_from_slice(&(name.len() as u32).to_le_bytes());
        self.contents.extend_from_slice(name);
        let padding = entry_len(name.len()) - ENTRY_HEADER - name.len();
        self.contents.extend(std::iter::repeat(0u8).take(padding));
    }

    /// Serve a request window. In filled mode this slices the buffer at
    /// the kernel-provided byte offset; in windowed mode the buffer holds
    /// exactly this request's entries.
    pub fn slice(&self, offset: i64, size: usize) -> &[u8] {
        if self.filled {
            let len = self.contents.len();
            let offset = offset.max(0) as usize;
            if offset < len {
                let end = (offset + size).min(len);
                &self.contents[offset..end]
            } else {
                &[]
            }
        } else {
            &self.contents
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.contents.len()
    }
}

/// One decoded directory entry. `offset` is what the kernel should pass
/// to resume reading after this entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub ino: u64,
    pub offset: i64,
    pub kind: FileType,
    pub name: OsString,
}

/// Decode serialized entries from a buffer slice. Stops at the first
/// truncated record.
pub struct DirEntryIter<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> DirEntryIter<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        DirEntryIter { data, pos: 0 }
    }
}

impl Iterator for DirEntryIter<'_> {
    type Item = DirEntry;

    fn next(&mut self) -> Option<DirEntry> {
        let rest = &self.data[self.pos.min(self.data.len())..];
        if rest.len() < ENTRY_HEADER {
            return None;
        }
        let ino = u64::from_le_bytes(rest[0..8].try_into().unwrap());
        let offset = i64::from_le_bytes(rest[8..16].try_into().unwrap());
        let kind = file_type_from_code(u32::from_le_bytes(rest[16..20].try_into().unwrap()));
        let name_len = u32::from_le_bytes(rest[20..24].try_into().unwrap()) as usize;
        if rest.len() < ENTRY_HEADER + name_len {
            return None;
        }
        let name = OsString::from_vec(rest[ENTRY_HEADER..ENTRY_HEADER + name_len].to_vec());
        self.pos += entry_len(name_len);
        Some(DirEntry {
            ino,
            offset,
            kind,
            name,
        })
    }
}

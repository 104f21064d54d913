//! pathfuse: the user-space dispatch layer of a FUSE filesystem bridge.
//!
//! The crate sits between a kernel FUSE channel and a pluggable,
//! path-based filesystem implementation. It owns the mapping from
//! kernel-visible node ids to paths (with reference counting and safe
//! reclamation), dispatches every filesystem request through a two-tier
//! locking discipline, tracks byte-range locks per node, and supports
//! request cancellation.
//!
//! Implement [`PathFilesystem`] for your filesystem, then either
//! [`mount`]/[`spawn_mount`] it, or drive a [`PathBridge`] directly for
//! testing and embedding.

pub mod bridge;
pub mod config;
pub mod error;
pub mod fs;

pub use bridge::convert::io_error_to_errno;
pub use bridge::dir_handle::{DirEntry, DirEntryIter};
pub use bridge::interrupt::CancelToken;
pub use bridge::locks::{LockKind, LockRecord, OFFSET_MAX};
pub use bridge::mount::{mount, spawn_mount, FuseDriver};
pub use bridge::types::UNKNOWN_INO;
pub use bridge::{AttrReply, CreateReply, EntryReply, OpenReply, PathBridge, XattrReply};
pub use config::MountOptions;
pub use error::{PathfuseError, Result};
pub use fs::{
    DirFiller, LockCmd, OpResult, PathFilesystem, RequestCtx, SetAttrRequest, Statvfs, XTimes,
};

/// The reserved node id of the filesystem root.
pub const ROOT_ID: u64 = fuser::FUSE_ROOT_ID;

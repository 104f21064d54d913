use fuser::{FileAttr, FUSE_ROOT_ID};
use fxhash::hash64;
use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;
use std::time::{Instant, SystemTime};

use crate::bridge::locks::LockRecord;

/// Inode number reported to the kernel when none is known, and never
/// handed out by the allocator.
pub const UNKNOWN_INO: u64 = 0xffff_ffff;

/// Consecutive occupied ids the allocator will probe past before giving
/// up. Far beyond any live table; hitting it means the id space is
/// effectively exhausted.
const ID_PROBE_LIMIT: u64 = 1 << 32;

/// One kernel-visible filesystem object: a path component plus the
/// reference counts and cached attributes the bridge tracks for it.
#[derive(Debug)]
pub(crate) struct Node {
    pub id: u64,
    pub generation: u64,
    /// Final path component. Empty only for the root or a detached node.
    pub name: OsString,
    pub parent: Option<u64>,
    /// Outstanding kernel references, balanced by `forget`.
    pub lookup_count: u64,
    /// Structural holders: the id-index entry plus one per child naming
    /// this node as parent. The node is dropped when this reaches zero.
    pub ref_count: u32,
    pub open_count: u32,
    pub is_hidden: bool,
    pub size: u64,
    pub mtime: SystemTime,
    pub cache_valid: bool,
    pub stat_updated: Instant,
    pub locks: Vec<LockRecord>,
}

impl Node {
    fn new(id: u64, generation: u64) -> Node {
        Node {
            id,
            generation,
            name: OsString::new(),
            parent: None,
            lookup_count: 0,
            ref_count: 1,
            open_count: 0,
            is_hidden: false,
            size: 0,
            mtime: SystemTime::UNIX_EPOCH,
            cache_valid: false,
            stat_updated: Instant::now(),
            locks: Vec::new(),
        }
    }
}

/// The id ⇄ (parent, name) mapping. Pure data structure; all access goes
/// through the table mutex in [`super::node_table::NodeManager`].
///
/// Child lookups hash names with 64-bit FxHash scoped per directory, the
/// same scheme used for directory-entry maps elsewhere; collisions are
/// astronomically unlikely at that width.
#[derive(Debug)]
pub(crate) struct NodeTable {
    nodes: HashMap<u64, Node>,
    children: HashMap<u64, HashMap<u64, u64>>,
    next_id: u64,
    generation: u64,
    hide_ctr: u32,
}

impl NodeTable {
    pub fn new() -> Self {
        let mut nodes = HashMap::new();
        let mut root = Node::new(FUSE_ROOT_ID, 0);
        root.lookup_count = 1;
        nodes.insert(FUSE_ROOT_ID, root);
        NodeTable {
            nodes,
            children: HashMap::new(),
            next_id: FUSE_ROOT_ID,
            generation: 0,
            hide_ctr: 0,
        }
    }

    /// Fetch a node the caller believes is live. A miss is table
    /// corruption, not a request error.
    pub fn get(&self, id: u64) -> &Node {
        self.nodes
            .get(&id)
            .unwrap_or_else(|| panic!("pathfuse internal error: node {} not found", id))
    }

    pub fn get_mut(&mut self, id: u64) -> &mut Node {
        self.nodes
            .get_mut(&id)
            .unwrap_or_else(|| panic!("pathfuse internal error: node {} not found", id))
    }

    pub fn get_opt_mut(&mut self, id: u64) -> Option<&mut Node> {
        self.nodes.get_mut(&id)
    }

    pub fn lookup_child(&self, parent: u64, name: &OsStr) -> Option<u64> {
        let name_hash = hash64(name.as_bytes());
        self.children
            .get(&parent)
            .and_then(|map| map.get(&name_hash).copied())
    }

    fn alloc_id(&mut self) -> Option<u64> {
        let mut probes: u64 = 0;
        loop {
            self.next_id = self.next_id.wrapping_add(1);
            if self.next_id == 0 {
                self.generation += 1;
            }
            if self.next_id != 0
                && self.next_id != UNKNOWN_INO
                && !self.nodes.contains_key(&self.next_id)
            {
                return Some(self.next_id);
            }
            probes += 1;
            if probes >= ID_PROBE_LIMIT {
                return None;
            }
        }
    }

    /// Attach `id` under `(parent, name)`. The child takes a structural
    /// reference on the parent.
    fn hash_name(&mut self, id: u64, parent: u64, name: &OsStr) {
        self.get_mut(parent).ref_count += 1;
        let name_hash = hash64(name.as_bytes());
        self.children.entry(parent).or_default().insert(name_hash, id);
        let node = self.get_mut(id);
        node.parent = Some(parent);
        node.name = name.to_os_string();
    }

    /// Detach the node from the name index, releasing the reference it
    /// held on its parent. No-op for nameless (root/detached) nodes.
    fn unhash_name(&mut self, id: u64) {
        let (parent, name) = {
            let node = self.get_mut(id);
            if node.name.is_empty() {
                return;
            }
            let parent = node
                .parent
                .unwrap_or_else(|| panic!("pathfuse internal error: named node {} has no parent", id));
            (parent, std::mem::take(&mut node.name))
        };
        self.get_mut(id).parent = None;
        let name_hash = hash64(name.as_bytes());
        let removed = self
            .children
            .get_mut(&parent)
            .and_then(|map| map.remove(&name_hash));
        if removed != Some(id) {
            panic!("pathfuse internal error: unable to unhash node {}", id);
        }
        self.unref(parent);
    }

    fn unref(&mut self, id: u64) {
        let node = self.get_mut(id);
        assert!(
            node.ref_count > 0,
            "pathfuse internal error: ref count underflow on node {}",
            id
        );
        node.ref_count -= 1;
        if node.ref_count == 0 {
            debug_assert!(node.name.is_empty());
            tracing::trace!("delete node {}", id);
            self.children.remove(&id);
            self.nodes.remove(&id);
        }
    }

    /// Resolve `(parent, name)`, creating the node on first sight. Always
    /// counts one more kernel reference on the returned node.
    pub fn find_or_create(&mut self, parent: u64, name: &OsStr) -> Result<(u64, u64), i32> {
        if let Some(id) = self.lookup_child(parent, name) {
            let node = self.get_mut(id);
            node.lookup_count += 1;
            return Ok((id, node.generation));
        }
        let id = self.alloc_id().ok_or(libc::ENOMEM)?;
        let generation = self.generation;
        let mut node = Node::new(id, generation);
        node.lookup_count = 1;
        self.nodes.insert(id, node);
        self.hash_name(id, parent, name);
        Ok((id, generation))
    }

    /// Give back `nlookup` kernel references. At zero the node leaves the
    /// name index and drops the id-index reference. The root is immune.
    pub fn forget(&mut self, id: u64, nlookup: u64) {
        if id == FUSE_ROOT_ID {
            return;
        }
        let node = self.get_mut(id);
        assert!(
            node.lookup_count >= nlookup,
            "pathfuse internal error: lookup count underflow on node {}",
            id
        );
        node.lookup_count -= nlookup;
        if node.lookup_count == 0 {
            self.unhash_name(id);
            self.unref(id);
        }
    }

    /// Unconditionally detach a name, regardless of outstanding kernel
    /// references; the id stays resolvable until those are forgotten.
    pub fn remove_by_name(&mut self, parent: u64, name: &OsStr) {
        if let Some(id) = self.lookup_child(parent, name) {
            self.unhash_name(id);
        }
    }

    /// Re-hash a node under a new (parent, name). An occupied destination
    /// is detached first, unless this is a hide rename, where a collision
    /// means another worker claimed the synthetic name.
    pub fn rename(
        &mut self,
        olddir: u64,
        oldname: &OsStr,
        newdir: u64,
        newname: &OsStr,
        hide: bool,
    ) -> Result<(), i32> {
        let node = match self.lookup_child(olddir, oldname) {
            Some(id) => id,
            None => return Ok(()),
        };
        if let Some(existing) = self.lookup_child(newdir, newname) {
            if hide {
                tracing::error!(
                    "hidden name {:?} got created during hiding of node {}",
                    newname,
                    node
                );
                return Err(libc::EBUSY);
            }
            self.unhash_name(existing);
        }
        self.unhash_name(node);
        self.hash_name(node, newdir, newname);
        if hide {
            self.get_mut(node).is_hidden = true;
        }
        Ok(())
    }

    /// Swap the cached attributes of two nodes after a successful
    /// exchange; both caches are invalidated. Name bindings stay put.
    pub fn exchange(&mut self, olddir: u64, oldname: &OsStr, newdir: u64, newname: &OsStr) {
        let (Some(a), Some(b)) = (
            self.lookup_child(olddir, oldname),
            self.lookup_child(newdir, newname),
        ) else {
            return;
        };
        let now = Instant::now();
        let (size_a, mtime_a) = {
            let node = self.get(a);
            (node.size, node.mtime)
        };
        let (size_b, mtime_b) = {
            let node = self.get(b);
            (node.size, node.mtime)
        };
        let node = self.get_mut(a);
        node.size = size_b;
        node.mtime = mtime_b;
        node.cache_valid = false;
        node.stat_updated = now;
        let node = self.get_mut(b);
        node.size = size_a;
        node.mtime = mtime_a;
        node.cache_valid = false;
        node.stat_updated = now;
    }

    /// Reconstruct the absolute path of `id`, optionally extended with a
    /// trailing component. Fails if any ancestor has been detached from
    /// the name index.
    pub fn path_of_name(&self, id: u64, name: Option<&OsStr>) -> Option<PathBuf> {
        let mut parts: Vec<&OsStr> = Vec::new();
        if let Some(name) = name {
            parts.push(name);
        }
        let mut cur = id;
        while cur != FUSE_ROOT_ID {
            let node = self.get(cur);
            if node.name.is_empty() {
                return None;
            }
            parts.push(&node.name);
            cur = node.parent?;
        }
        let mut path = PathBuf::from("/");
        for part in parts.iter().rev() {
            path.push(part);
        }
        Some(path)
    }

    /// Record freshly observed size/mtime, invalidating the kernel-cache
    /// hint on any mismatch with the previous observation.
    pub fn update_stat(&mut self, id: u64, attr: &FileAttr) {
        if let Some(node) = self.nodes.get_mut(&id) {
            if node.cache_valid && (node.mtime != attr.mtime || node.size != attr.size) {
                node.cache_valid = false;
            }
            node.mtime = attr.mtime;
            node.size = attr.size;
            node.stat_updated = Instant::now();
        }
    }

    /// Next synthetic name free in the table under `dir`, for hiding the
    /// node currently at `(dir, oldname)`. `None` if that node is gone.
    pub fn hidden_candidate(&mut self, dir: u64, oldname: &OsStr) -> Option<OsString> {
        let node = self.lookup_child(dir, oldname)?;
        loop {
            self.hide_ctr = self.hide_ctr.wrapping_add(1);
            let name = OsString::from(format!(".fuse_hidden{:08x}{:08x}", node, self.hide_ctr));
            if self.lookup_child(dir, &name).is_none() {
                return Some(name);
            }
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[cfg(test)]
    pub fn contains(&self, id: u64) -> bool {
        self.nodes.contains_key(&id)
    }
}

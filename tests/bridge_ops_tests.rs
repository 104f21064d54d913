mod common;

use common::{bridge_with, ctx, lookup_id, MockFs, MOCK_INO};
use pathfuse::{
    DirEntryIter, MountOptions, PathBridge, PathfuseError, RequestCtx, SetAttrRequest, XattrReply,
    ROOT_ID, UNKNOWN_INO,
};
use std::ffi::OsStr;
use std::sync::Arc;
use std::time::Duration;

fn default_bridge(setup: impl FnOnce(&MockFs)) -> PathBridge<MockFs> {
    bridge_with(MountOptions::default(), setup)
}

#[test]
fn test_lookup_assigns_stable_ids() {
    let bridge = default_bridge(|fs| fs.add_file("/a", 3));

    let first = lookup_id(&bridge, ROOT_ID, "a");
    let second = lookup_id(&bridge, ROOT_ID, "a");
    assert_eq!(first, 2, "first node after the root gets id 2");
    assert_eq!(first, second);

    // One reference back: still resolvable to the same id.
    bridge.forget(first, 1);
    assert_eq!(lookup_id(&bridge, ROOT_ID, "a"), first);

    // Balance all references: the name unbinds and the next lookup mints
    // a fresh node.
    bridge.forget(first, 2);
    let third = lookup_id(&bridge, ROOT_ID, "a");
    assert_ne!(third, first);
}

#[test]
fn test_lookup_resolves_nested_paths() {
    let bridge = default_bridge(|fs| {
        fs.add_dir("/dir");
        fs.add_file("/dir/file.txt", 10);
    });

    let dir = lookup_id(&bridge, ROOT_ID, "dir");
    let file = lookup_id(&bridge, dir, "file.txt");

    // The filesystem saw the full reconstructed paths.
    let calls = bridge.filesystem().calls_matching("getattr");
    assert_eq!(calls, vec!["getattr /dir", "getattr /dir/file.txt"]);

    // getattr on the nested id resolves the same path again.
    bridge.filesystem().clear_calls();
    bridge.getattr(&ctx(), file).unwrap();
    assert_eq!(
        bridge.filesystem().calls_matching("getattr"),
        vec!["getattr /dir/file.txt"]
    );
}

#[test]
fn test_lookup_missing_name_fails_without_negative_cache() {
    let bridge = default_bridge(|_| {});
    let err = bridge.lookup(&ctx(), ROOT_ID, OsStr::new("ghost")).unwrap_err();
    assert_eq!(err, libc::ENOENT);
}

#[test]
fn test_lookup_missing_name_with_negative_cache() {
    let options = MountOptions {
        negative_timeout: Duration::from_secs(5),
        ..MountOptions::default()
    };
    let bridge = bridge_with(options, |_| {});
    let entry = bridge.lookup(&ctx(), ROOT_ID, OsStr::new("ghost")).unwrap();
    assert_eq!(entry.id, 0, "negative entry carries the reserved zero id");
    assert_eq!(entry.entry_timeout, Duration::from_secs(5));
}

#[test]
fn test_rename_preserves_node_identity() {
    let bridge = default_bridge(|fs| fs.add_file("/a", 1));
    let id = lookup_id(&bridge, ROOT_ID, "a");
    let generation = bridge.lookup(&ctx(), ROOT_ID, OsStr::new("a")).unwrap().generation;

    bridge
        .rename(&ctx(), ROOT_ID, OsStr::new("a"), ROOT_ID, OsStr::new("b"))
        .unwrap();

    // Same id answers getattr at the new location.
    bridge.filesystem().clear_calls();
    bridge.getattr(&ctx(), id).unwrap();
    assert_eq!(
        bridge.filesystem().calls_matching("getattr"),
        vec!["getattr /b"]
    );

    let entry = bridge.lookup(&ctx(), ROOT_ID, OsStr::new("b")).unwrap();
    assert_eq!(entry.id, id);
    assert_eq!(entry.generation, generation);
}

#[test]
fn test_attr_identity_overrides() {
    let options = MountOptions {
        uid: Some(42),
        gid: Some(43),
        umask: Some(0o077),
        ..MountOptions::default()
    };
    let bridge = bridge_with(options, |fs| fs.add_file("/a", 9));
    let entry = bridge.lookup(&ctx(), ROOT_ID, OsStr::new("a")).unwrap();

    assert_eq!(entry.attr.ino, entry.id, "table id replaces the filesystem inode");
    assert_eq!(entry.attr.uid, 42);
    assert_eq!(entry.attr.gid, 43);
    assert_eq!(entry.attr.perm, 0o700);
}

#[test]
fn test_use_ino_trusts_filesystem_inode() {
    let options = MountOptions {
        use_ino: true,
        ..MountOptions::default()
    };
    let bridge = bridge_with(options, |fs| fs.add_file("/a", 9));
    let entry = bridge.lookup(&ctx(), ROOT_ID, OsStr::new("a")).unwrap();
    assert_eq!(entry.attr.ino, MOCK_INO);
}

#[test]
fn test_setattr_applies_fields_and_masks_optional_ones() {
    let bridge = default_bridge(|fs| fs.add_file("/a", 100));
    let id = lookup_id(&bridge, ROOT_ID, "a");
    bridge.filesystem().clear_calls();

    let changes = SetAttrRequest {
        mode: Some(0o600),
        size: Some(10),
        mtime: Some(fuser::TimeOrNow::Now),
        // No chflags capability in the mock: must be tolerated.
        flags: Some(1),
        ..SetAttrRequest::default()
    };
    let reply = bridge.setattr(&ctx(), id, &changes, None).unwrap();
    assert_eq!(reply.attr.size, 10);

    let calls = bridge.filesystem().calls();
    assert!(calls.iter().any(|c| c.starts_with("chmod /a")));
    assert!(calls.iter().any(|c| c.starts_with("truncate /a 10")));
    assert!(calls.iter().any(|c| c.starts_with("utimens /a")));
    // The reply attributes come from a final fresh getattr.
    assert!(calls.last().unwrap().starts_with("getattr /a"));
}

#[test]
fn test_setattr_propagates_hard_failures() {
    let bridge = default_bridge(|fs| fs.add_file("/a", 100));
    let id = lookup_id(&bridge, ROOT_ID, "a");

    // The object vanishes behind the bridge's back; chmod's failure is
    // surfaced unchanged and nothing later in the chain runs.
    bridge.filesystem().remove_entry("/a");
    bridge.filesystem().clear_calls();
    let changes = SetAttrRequest {
        mode: Some(0o600),
        size: Some(1),
        ..SetAttrRequest::default()
    };
    let err = bridge.setattr(&ctx(), id, &changes, None).unwrap_err();
    assert_eq!(err, libc::ENOENT);
    assert!(bridge.filesystem().calls_matching("truncate").is_empty());
}

#[test]
fn test_mknod_prefers_create_capability() {
    let bridge = default_bridge(|_| {});
    let mode = libc::S_IFREG as u32 | 0o644;
    let entry = bridge
        .mknod(&ctx(), ROOT_ID, OsStr::new("n"), mode, 0)
        .unwrap();
    assert!(entry.id >= 2);

    let calls = bridge.filesystem().calls();
    assert!(calls.iter().any(|c| c.starts_with("create /n")));
    assert!(calls.iter().any(|c| c.starts_with("release /n")));
    assert!(!calls.iter().any(|c| c.starts_with("mknod")));
}

#[test]
fn test_mknod_falls_back_when_create_unsupported() {
    let bridge = default_bridge(|fs| fs.disable_create());
    let mode = libc::S_IFREG as u32 | 0o644;
    bridge
        .mknod(&ctx(), ROOT_ID, OsStr::new("n"), mode, 0)
        .unwrap();
    let calls = bridge.filesystem().calls();
    assert!(calls.iter().any(|c| c.starts_with("mknod /n")));
}

#[test]
fn test_read_caps_at_file_size() {
    let bridge = default_bridge(|fs| fs.add_file("/a", 5));
    let id = lookup_id(&bridge, ROOT_ID, "a");
    let opened = bridge.open(&ctx(), id, libc::O_RDONLY).unwrap();
    let data = bridge.read(&ctx(), id, opened.fh, 0, 100).unwrap();
    assert_eq!(data.len(), 5);
    assert!(data.iter().all(|&b| b == b'x'));
}

#[test]
fn test_write_reports_written_bytes() {
    let bridge = default_bridge(|fs| fs.add_file("/a", 0));
    let id = lookup_id(&bridge, ROOT_ID, "a");
    let opened = bridge.open(&ctx(), id, libc::O_WRONLY).unwrap();
    let written = bridge
        .write(&ctx(), id, opened.fh, b"hello world", 0)
        .unwrap();
    assert_eq!(written, 11);
}

#[test]
fn test_statfs_root_fallback() {
    let bridge = default_bridge(|_| {});
    let stats = bridge.statfs(&ctx(), 0).unwrap();
    assert_eq!(stats.blocks, 1000);
    assert_eq!(
        bridge.filesystem().calls_matching("statfs"),
        vec!["statfs /"]
    );
}

#[test]
fn test_xattr_size_probe_protocol() {
    let bridge = default_bridge(|fs| fs.add_file("/a", 1));
    let id = lookup_id(&bridge, ROOT_ID, "a");
    bridge
        .setxattr(&ctx(), id, OsStr::new("user.tag"), b"value", 0, 0)
        .unwrap();

    match bridge.getxattr(&ctx(), id, OsStr::new("user.tag"), 0, 0).unwrap() {
        XattrReply::Size(len) => assert_eq!(len, 5),
        other => panic!("expected size probe answer, got {:?}", other),
    }
    match bridge.getxattr(&ctx(), id, OsStr::new("user.tag"), 64, 0).unwrap() {
        XattrReply::Data(data) => assert_eq!(data, b"value"),
        other => panic!("expected data answer, got {:?}", other),
    }
    let err = bridge
        .getxattr(&ctx(), id, OsStr::new("user.tag"), 2, 0)
        .unwrap_err();
    assert_eq!(err, libc::ERANGE);

    match bridge.listxattr(&ctx(), id, 64).unwrap() {
        XattrReply::Data(data) => assert_eq!(data, b"user.tag\0"),
        other => panic!("expected data answer, got {:?}", other),
    }
}

#[test]
fn test_readdir_pagination_reproduces_full_listing() {
    let bridge = default_bridge(|fs| {
        for name in ["alpha", "beta", "gamma", "delta", "epsilon"] {
            fs.add_file(&format!("/{}", name), 1);
        }
    });
    let opened = bridge.opendir(&ctx(), ROOT_ID, 0).unwrap();

    // Single unpaginated fill.
    let full = bridge.readdir(&ctx(), ROOT_ID, opened.fh, 0, 64 * 1024).unwrap();
    let all_names: Vec<String> = DirEntryIter::new(&full)
        .map(|e| e.name.to_string_lossy().into_owned())
        .collect();
    assert_eq!(all_names, vec!["alpha", "beta", "delta", "epsilon", "gamma"]);

    // Page through with a window that fits roughly one entry at a time.
    let mut paged: Vec<String> = Vec::new();
    let mut offset = 0i64;
    loop {
        let window = bridge.readdir(&ctx(), ROOT_ID, opened.fh, offset, 40).unwrap();
        let Some(entry) = DirEntryIter::new(&window).next() else {
            break;
        };
        paged.push(entry.name.to_string_lossy().into_owned());
        offset = entry.offset;
    }
    assert_eq!(paged, all_names);

    // Offset zero filled once, later windows sliced the same buffer;
    // restarting the walk refills.
    assert_eq!(bridge.filesystem().calls_matching("readdir").len(), 2);
    bridge.readdir(&ctx(), ROOT_ID, opened.fh, 0, 64).unwrap();
    assert_eq!(bridge.filesystem().calls_matching("readdir").len(), 3);
}

#[test]
fn test_readdir_ino_fills_known_node_ids() {
    let options = MountOptions {
        readdir_ino: true,
        ..MountOptions::default()
    };
    let bridge = bridge_with(options, |fs| {
        fs.add_file("/known", 1);
        fs.add_file("/unknown", 1);
    });
    let known = lookup_id(&bridge, ROOT_ID, "known");

    let opened = bridge.opendir(&ctx(), ROOT_ID, 0).unwrap();
    let data = bridge.readdir(&ctx(), ROOT_ID, opened.fh, 0, 64 * 1024).unwrap();
    let entries: Vec<_> = DirEntryIter::new(&data).collect();

    // Entries the kernel already holds a node for report the table id;
    // names never looked up report the reserved sentinel.
    let e = entries.iter().find(|e| e.name == "known").unwrap();
    assert_eq!(e.ino, known);
    let e = entries.iter().find(|e| e.name == "unknown").unwrap();
    assert_eq!(e.ino, UNKNOWN_INO);
}

#[test]
fn test_releasedir_invalidates_handle() {
    let bridge = default_bridge(|_| {});
    let opened = bridge.opendir(&ctx(), ROOT_ID, 0).unwrap();
    bridge.releasedir(&ctx(), ROOT_ID, opened.fh).unwrap();
    let err = bridge
        .readdir(&ctx(), ROOT_ID, opened.fh, 0, 4096)
        .unwrap_err();
    assert_eq!(err, libc::EBADF);
}

#[test]
fn test_concurrent_lookups_agree_on_identity() {
    let bridge = Arc::new(default_bridge(|fs| fs.add_file("/shared", 1)));
    let mut handles = Vec::new();
    for i in 0..8 {
        let bridge = Arc::clone(&bridge);
        handles.push(std::thread::spawn(move || {
            let ctx = RequestCtx::new(100 + i, 0, 0, 0);
            bridge.lookup(&ctx, ROOT_ID, OsStr::new("shared")).unwrap().id
        }));
    }
    let ids: Vec<u64> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert!(ids.windows(2).all(|w| w[0] == w[1]));
}

#[test]
fn test_interrupted_open_releases_handle() {
    let options = MountOptions {
        intr: true,
        ..MountOptions::default()
    };
    let bridge = Arc::new(bridge_with(options, |fs| fs.add_file("/slow", 1)));
    let id = lookup_id(&bridge, ROOT_ID, "slow");
    bridge.filesystem().clear_calls();
    bridge.filesystem().block_next_open();

    let interruptor = {
        let bridge = Arc::clone(&bridge);
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            bridge.interrupt(77);
        })
    };

    let ctx = RequestCtx::new(77, 0, 0, 0);
    let err = bridge.open(&ctx, id, libc::O_RDONLY).unwrap_err();
    interruptor.join().unwrap();

    assert_eq!(err, libc::EINTR);
    // The cancelled open still unwound its handle.
    assert_eq!(bridge.filesystem().calls_matching("open").len(), 1);
    assert_eq!(bridge.filesystem().calls_matching("release").len(), 1);
}

#[test]
fn test_mount_rejects_non_directory_mountpoint() {
    let file = tempfile::NamedTempFile::new().unwrap();
    let err = pathfuse::mount(
        MockFs::new(),
        MountOptions::default(),
        file.path(),
        "pathfuse-test",
    )
    .unwrap_err();
    assert!(matches!(err, PathfuseError::NotADirectory(_)));
}

#[test]
fn test_exchange_swaps_objects_not_names() {
    let bridge = default_bridge(|fs| {
        fs.add_file("/a", 1);
        fs.add_file("/b", 2);
    });
    let a = lookup_id(&bridge, ROOT_ID, "a");
    bridge
        .exchange(&ctx(), ROOT_ID, OsStr::new("a"), ROOT_ID, OsStr::new("b"), 0)
        .unwrap();
    // Ids keep their names; the objects behind them swapped.
    let entry = bridge.lookup(&ctx(), ROOT_ID, OsStr::new("a")).unwrap();
    assert_eq!(entry.id, a);
    assert_eq!(entry.attr.size, 2);
}

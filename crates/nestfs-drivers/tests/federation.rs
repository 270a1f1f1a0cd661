//! End-to-end tests of nested archives served by the file and pack drivers.

mod common;

use std::io::{Read, Write};
use std::time::Duration;

use common::{member_of, pack_bytes, unpack, write_back_config, write_pack, Fixture};
use nestfs_kernel::{EntryType, FsError, KernelConfig, MountPoint, NodeName, NodePath, Severity, SyncOptions};

/// The raw host file `relative`, bypassing archive detection.
fn raw(fx: &Fixture, relative: &str) -> NodePath {
    let dir = fx.dir.path().to_str().unwrap();
    let mount_point = MountPoint::hierarchical("file", dir).unwrap();
    NodePath::new(mount_point, NodeName::new(relative).unwrap()).unwrap()
}

#[test]
fn test_read_member_of_nested_archive() {
    nestfs_kernel::logging::init_for_tests();
    let fx = Fixture::new();
    let inner = pack_bytes(&[("c.txt", b"deep")]);
    write_pack(&fx.host("outer.pack"), &[("inner.pack", &inner), ("top.txt", b"shallow")]);

    assert_eq!(fx.read("outer.pack/top.txt"), b"shallow");
    assert_eq!(fx.read("outer.pack/inner.pack/c.txt"), b"deep");

    let path = fx.path("outer.pack/inner.pack/c.txt");
    assert_eq!(path.mount_point().depth(), 2);
    assert_eq!(fx.kernel.manager().len(), 3);
}

#[test]
fn test_nested_write_reaches_host_on_sync() {
    let fx = Fixture::new();
    let inner = pack_bytes(&[("c.txt", b"deep")]);
    write_pack(&fx.host("outer.pack"), &[("inner.pack", &inner)]);

    fx.write("outer.pack/inner.pack/d.txt", b"new");
    assert_eq!(fx.read("outer.pack/inner.pack/d.txt"), b"new");

    let on_host = member_of(&fx.host("outer.pack"), "inner.pack").unwrap();
    assert!(unpack(&on_host).iter().all(|(name, _)| name != "d.txt"));

    fx.kernel.sync(SyncOptions::SYNC).unwrap();

    let on_host = member_of(&fx.host("outer.pack"), "inner.pack").unwrap();
    let members = unpack(&on_host);
    assert!(members.contains(&("c.txt".to_string(), b"deep".to_vec())));
    assert!(members.contains(&("d.txt".to_string(), b"new".to_vec())));
}

#[test]
fn test_new_archive_is_created_on_sync() {
    let fx = Fixture::new();
    fx.write("fresh.pack/a/b.txt", b"hello");
    assert!(!fx.host("fresh.pack").exists());

    fx.kernel.sync(SyncOptions::SYNC).unwrap();

    let members = unpack(&std::fs::read(fx.host("fresh.pack")).unwrap());
    let names: Vec<&str> = members.iter().map(|(n, _)| n.as_str()).collect();
    assert_eq!(names, vec!["a", "a/b.txt"]);
    assert_eq!(member_of(&fx.host("fresh.pack"), "a/b.txt").unwrap(), b"hello");
}

#[test]
fn test_failed_commit_does_not_stop_the_sweep() {
    let fx = Fixture::with_failing_scheme();
    write_pack(&fx.host("good.pack"), &[]);
    fx.write("x.bad/m.txt", b"lost");
    fx.write("good.pack/y.txt", b"kept");

    let err = fx.kernel.sync(SyncOptions::SYNC).unwrap_err();
    assert!(err.has_failures());
    let failed: Vec<String> = err.failed_mount_points().iter().map(|mp| mp.to_string()).collect();
    assert_eq!(failed.len(), 1);
    assert!(failed[0].starts_with("bad:"));

    assert_eq!(member_of(&fx.host("good.pack"), "y.txt").unwrap(), b"kept");
    assert!(!fx.host("x.bad").exists());
}

#[test]
fn test_reset_discards_changes() {
    let fx = Fixture::new();
    write_pack(&fx.host("a.pack"), &[("x.txt", b"old")]);

    fx.write("a.pack/x.txt", b"changed");
    fx.write("a.pack/y.txt", b"added");
    fx.kernel.sync(SyncOptions::RESET).unwrap();

    assert_eq!(member_of(&fx.host("a.pack"), "x.txt").unwrap(), b"old");
    assert!(member_of(&fx.host("a.pack"), "y.txt").is_none());
    assert_eq!(fx.read("a.pack/x.txt"), b"old");
    assert!(fx.kernel.entry(&fx.path("a.pack/y.txt")).unwrap().is_none());
}

#[test]
fn test_umount_force_closes_open_output() {
    let fx = Fixture::new();
    write_pack(&fx.host("a.pack"), &[("x.txt", b"old")]);

    let mut stream = fx.kernel.output(&fx.path("a.pack/x.txt"), None).unwrap().stream().unwrap();
    stream.write_all(b"forced").unwrap();

    let err = fx.kernel.sync(SyncOptions::UMOUNT).unwrap_err();
    assert!(!err.has_failures());
    assert!(err.iter().all(|issue| issue.severity() == Severity::Warning));
    assert_eq!(member_of(&fx.host("a.pack"), "x.txt").unwrap(), b"forced");

    assert!(stream.write_all(b"late").is_err());
    drop(stream);
    assert!(fx.kernel.manager().is_empty());
    assert_eq!(fx.kernel.pool().outstanding(), 0);
}

#[test]
fn test_sync_without_flags_is_busy_with_open_stream() {
    let fx = Fixture::new();
    write_pack(&fx.host("a.pack"), &[("x.txt", b"data")]);
    let archive = fx.path("a.pack/x.txt").mount_point().clone();

    let input = fx.kernel.input(&fx.path("a.pack/x.txt")).unwrap().stream().unwrap();
    let err = fx.kernel.sync(SyncOptions::empty()).unwrap_err();
    assert!(err.has_failures());
    assert_eq!(err.failed_mount_points(), vec![&archive]);
    assert!(err.primary.error().is_transient());

    input.close().unwrap();
    fx.kernel.sync(SyncOptions::empty()).unwrap();
}

#[test]
fn test_wait_close_waits_for_other_threads() {
    let fx = Fixture::new();
    write_pack(&fx.host("a.pack"), &[("x.txt", b"data")]);
    let path = fx.path("a.pack/x.txt");
    let kernel = &fx.kernel;

    std::thread::scope(|scope| {
        let (tx, rx) = std::sync::mpsc::channel();
        let path = &path;
        let reader = scope.spawn(move || {
            let mut input = kernel.input(path).unwrap().stream().unwrap();
            tx.send(()).unwrap();
            std::thread::sleep(Duration::from_millis(50));
            let mut data = Vec::new();
            input.read_to_end(&mut data).unwrap();
            input.close().unwrap();
            data
        });
        rx.recv().unwrap();
        fx.kernel.sync(SyncOptions::SYNC).unwrap();
        assert_eq!(reader.join().unwrap(), b"data");
    });
}

#[test]
fn test_umount_releases_every_level() {
    let fx = Fixture::new();
    let inner = pack_bytes(&[("c.txt", b"deep")]);
    write_pack(&fx.host("outer.pack"), &[("inner.pack", &inner)]);

    fx.write("outer.pack/inner.pack/c.txt", b"deeper");
    assert!(fx.kernel.pool().outstanding() > 0);

    fx.kernel.sync(SyncOptions::UMOUNT).unwrap();
    assert!(fx.kernel.manager().is_empty());
    assert_eq!(fx.kernel.pool().outstanding(), 0);

    // Everything is mounted again on demand.
    assert_eq!(fx.read("outer.pack/inner.pack/c.txt"), b"deeper");
}

#[test]
fn test_umount_keeps_chain_held_by_caller() {
    let fx = Fixture::new();
    write_pack(&fx.host("a.pack"), &[("x.txt", b"data")]);
    let chain = fx.kernel.controller(&fx.path("a.pack/x.txt")).unwrap();
    assert_eq!(chain.entry(&NodeName::new("x.txt").unwrap()).unwrap().unwrap().data_size, Some(4));

    fx.kernel.sync(SyncOptions::UMOUNT).unwrap();
    assert!(fx.kernel.manager().is_mounted(chain.mount_point()));

    drop(chain);
    fx.kernel.sync(SyncOptions::UMOUNT).unwrap();
    assert!(fx.kernel.manager().is_empty());
}

#[test]
fn test_replacing_archive_file_resets_mounted_archive() {
    let fx = Fixture::new();
    write_pack(&fx.host("a.pack"), &[("x.txt", b"first")]);
    assert_eq!(fx.read("a.pack/x.txt"), b"first");
    fx.write("a.pack/pending.txt", b"dropped");

    fx.kernel
        .write(&raw(&fx, "a.pack"), &pack_bytes(&[("x.txt", b"second")]))
        .unwrap();

    assert_eq!(fx.read("a.pack/x.txt"), b"second");
    assert!(fx.kernel.entry(&fx.path("a.pack/pending.txt")).unwrap().is_none());
}

#[test]
fn test_reading_archive_file_commits_mounted_archive_first() {
    let fx = Fixture::new();
    write_pack(&fx.host("a.pack"), &[]);
    fx.write("a.pack/new.txt", b"fresh");

    let bytes = fx.kernel.read(&raw(&fx, "a.pack")).unwrap();
    assert_eq!(unpack(&bytes), vec![("new.txt".to_string(), b"fresh".to_vec())]);
}

#[test]
fn test_unlinking_archive_file_discards_mounted_archive() {
    let fx = Fixture::new();
    write_pack(&fx.host("a.pack"), &[("x.txt", b"data")]);
    fx.write("a.pack/y.txt", b"pending");

    fx.kernel.unlink(&raw(&fx, "a.pack")).unwrap();
    assert!(!fx.host("a.pack").exists());

    fx.kernel.sync(SyncOptions::SYNC).unwrap();
    assert!(!fx.host("a.pack").exists());
}

#[test]
fn test_directory_entries_list_members() {
    let fx = Fixture::new();
    write_pack(&fx.host("a.pack"), &[("dir/a.txt", b"1"), ("b.txt", b"22")]);

    let root = fx.kernel.entry(&fx.path("a.pack")).unwrap().unwrap();
    assert!(root.is_directory());
    let members: Vec<String> = root.members.unwrap().into_iter().collect();
    assert_eq!(members, vec!["b.txt".to_string(), "dir".to_string()]);

    let dir = fx.kernel.entry(&fx.path("a.pack/dir")).unwrap().unwrap();
    assert_eq!(dir.kind, EntryType::Directory);
    assert_eq!(dir.members.unwrap().into_iter().collect::<Vec<_>>(), vec!["a.txt".to_string()]);

    let file = fx.kernel.entry(&fx.path("a.pack/b.txt")).unwrap().unwrap();
    assert_eq!(file.data_size, Some(2));

    let host_dir = fx.kernel.entry(&raw(&fx, "a.pack")).unwrap().unwrap();
    assert!(host_dir.is_file());
}

#[test]
fn test_mknod_and_unlink_inside_archive() {
    let fx = Fixture::new();
    write_pack(&fx.host("a.pack"), &[]);
    fx.kernel.mknod(&fx.path("a.pack/sub"), EntryType::Directory, None).unwrap();
    fx.write("a.pack/sub/f.txt", b"x");

    assert!(matches!(
        fx.kernel.unlink(&fx.path("a.pack/sub")),
        Err(FsError::NotEmpty { .. })
    ));
    assert!(matches!(
        fx.kernel.mknod(&fx.path("a.pack/sub"), EntryType::Directory, None),
        Err(FsError::AlreadyExists { .. })
    ));
    assert!(matches!(
        fx.kernel.read(&fx.path("a.pack/sub")),
        Err(FsError::IsADirectory { .. })
    ));

    fx.kernel.unlink(&fx.path("a.pack/sub/f.txt")).unwrap();
    fx.kernel.unlink(&fx.path("a.pack/sub")).unwrap();
    fx.kernel.sync(SyncOptions::SYNC).unwrap();
    assert!(unpack(&std::fs::read(fx.host("a.pack")).unwrap()).is_empty());
}

#[test]
fn test_directory_with_archive_extension_is_not_an_archive() {
    let fx = Fixture::new();
    std::fs::create_dir(fx.host("d.pack")).unwrap();
    let err = fx.kernel.read(&fx.path("d.pack/x")).unwrap_err();
    assert!(matches!(err, FsError::NotAnArchive { .. }));
}

#[test]
fn test_corrupt_archive_names_its_file() {
    let fx = Fixture::new();
    std::fs::write(fx.host("junk.pack"), b"not a pack at all").unwrap();
    match fx.kernel.read(&fx.path("junk.pack/x")) {
        Err(FsError::CorruptArchive { path, .. }) => assert!(path.ends_with("junk.pack")),
        other => panic!("expected a corrupt archive, got {:?}", other.map(|d| d.len())),
    }
}

/// Pack archives mounted read-only under the given cache strategy.
fn read_only_config(strategy: &str) -> KernelConfig {
    KernelConfig::from_json(&format!(
        r#"{{ "pool": {{ "backing": "memory" }},
             "cache": {{ "strategy": "{}" }},
             "drivers": [ {{ "scheme": "file", "format": "file" }},
                          {{ "scheme": "pack", "format": "pack", "read_only": true, "extensions": ["pack"] }} ] }}"#,
        strategy
    ))
    .unwrap()
}

#[test]
fn test_read_only_scheme_rejects_changes() {
    let fx = Fixture::with_config(read_only_config("write_through"));
    write_pack(&fx.host("a.pack"), &[("x.txt", b"data")]);

    assert_eq!(fx.read("a.pack/x.txt"), b"data");
    let output = fx.kernel.output(&fx.path("a.pack/x.txt"), None).unwrap();
    assert!(matches!(output.stream().err(), Some(FsError::ReadOnly { .. })));
    assert!(matches!(
        fx.kernel.write(&fx.path("a.pack/x.txt"), b"nope"),
        Err(FsError::ReadOnly { .. })
    ));
    assert!(matches!(
        fx.kernel.unlink(&fx.path("a.pack/x.txt")),
        Err(FsError::ReadOnly { .. })
    ));
    fx.kernel.sync(SyncOptions::SYNC).unwrap();
    assert_eq!(member_of(&fx.host("a.pack"), "x.txt").unwrap(), b"data");
}

#[test]
fn test_read_only_scheme_rejects_buffered_writes_when_opened() {
    let fx = Fixture::with_config(read_only_config("write_back"));
    write_pack(&fx.host("a.pack"), &[("x.txt", b"data")]);

    let output = fx.kernel.output(&fx.path("a.pack/x.txt"), None).unwrap();
    assert!(matches!(output.stream().err(), Some(FsError::ReadOnly { .. })));
    assert!(matches!(
        fx.kernel.write(&fx.path("a.pack/new.txt"), b"nope"),
        Err(FsError::ReadOnly { .. })
    ));

    assert_eq!(fx.read("a.pack/x.txt"), b"data");
    assert!(fx.kernel.entry(&fx.path("a.pack/new.txt")).unwrap().is_none());
    fx.kernel.sync(SyncOptions::SYNC).unwrap();
    fx.kernel.sync(SyncOptions::UMOUNT).unwrap();
    let members = unpack(&std::fs::read(fx.host("a.pack")).unwrap());
    assert_eq!(members, vec![("x.txt".to_string(), b"data".to_vec())]);
}

#[test]
fn test_missing_archive_has_no_entries() {
    let fx = Fixture::new();
    assert!(fx.kernel.entry(&fx.path("missing.pack")).unwrap().is_none());
    assert!(fx.kernel.entry(&fx.path("missing.pack/x.txt")).unwrap().is_none());
    assert_eq!(fx.kernel.manager().len(), 1);

    let chain = fx.kernel.controller(&fx.path("missing.pack")).unwrap();
    assert!(chain.entry(&NodeName::ROOT).unwrap().is_none());
    drop(chain);

    fx.write("missing.pack/x.txt", b"created");
    let root = fx.kernel.entry(&fx.path("missing.pack")).unwrap().unwrap();
    assert!(root.is_directory());
    fx.kernel.sync(SyncOptions::SYNC).unwrap();
    assert!(fx.kernel.entry(&fx.path("missing.pack")).unwrap().unwrap().is_directory());
    assert_eq!(member_of(&fx.host("missing.pack"), "x.txt").unwrap(), b"created");
}

#[test]
fn test_write_back_keeps_template_across_reads() {
    let fx = Fixture::with_config(write_back_config());
    write_pack(&fx.host("a.pack"), &[]);
    let stamp = std::time::SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000);
    let mut template = nestfs_kernel::Entry::file("x.txt");
    template.modified = Some(stamp);

    let path = fx.path("a.pack/x.txt");
    fx.kernel.output(&path, Some(template)).unwrap().write_all(b"stamped").unwrap();
    assert_eq!(fx.read("a.pack/x.txt"), b"stamped");
    fx.kernel.sync(SyncOptions::UMOUNT).unwrap();

    let entry = fx.kernel.entry(&path).unwrap().unwrap();
    assert_eq!(entry.modified, Some(stamp));
    assert_eq!(fx.read("a.pack/x.txt"), b"stamped");
}

#[test]
fn test_dropping_kernel_commits_changes() {
    let fx = Fixture::new();
    write_pack(&fx.host("a.pack"), &[]);
    let Fixture { dir, kernel } = fx;
    let path = kernel.resolve(dir.path().join("a.pack/x.txt")).unwrap();
    kernel.write(&path, b"saved").unwrap();
    drop(kernel);
    assert_eq!(member_of(&dir.path().join("a.pack"), "x.txt").unwrap(), b"saved");
}

#[test]
fn test_write_back_defers_member_update() {
    let fx = Fixture::with_config(write_back_config());
    write_pack(&fx.host("a.pack"), &[("x.txt", b"old")]);

    fx.write("a.pack/x.txt", b"written back");
    let entry = fx.kernel.entry(&fx.path("a.pack/x.txt")).unwrap().unwrap();
    assert_eq!(entry.data_size, Some(12));
    assert_eq!(fx.read("a.pack/x.txt"), b"written back");
    assert_eq!(member_of(&fx.host("a.pack"), "x.txt").unwrap(), b"old");

    fx.kernel.sync(SyncOptions::SYNC).unwrap();
    assert_eq!(member_of(&fx.host("a.pack"), "x.txt").unwrap(), b"written back");
}

#[test]
fn test_plain_files_pass_through() {
    let fx = Fixture::new();
    fx.write("plain.txt", b"host");
    assert_eq!(std::fs::read(fx.host("plain.txt")).unwrap(), b"host");
    assert_eq!(fx.path("plain.txt").mount_point().depth(), 0);
}

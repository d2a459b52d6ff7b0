//! End-to-end scenarios over two fresh in-memory replicas.

mod support;

use libkeel::{NodeId, ReplicaSide};
use support::Harness;

#[test]
fn local_create_propagates_and_second_pass_is_noop() {
    let h = Harness::new();

    h.fs.create_dir_all(h.local_path("sub")).unwrap();
    h.fs.write(h.local_path("sub/a.txt"), b"hello").unwrap();

    h.sync();

    // The remote replica mirrors the new file.
    assert_eq!(h.remote_read("sub/a.txt").unwrap(), b"hello");

    // The DB maps the local id to the remote id.
    let remote_item = h.drive.item_at_path("sub/a.txt").unwrap();
    let row = h
        .db
        .node_by_id(ReplicaSide::Remote, &remote_item.id)
        .unwrap()
        .expect("a.txt should be in the sync DB");
    let local_id = NodeId::from(h.fs.metadata(h.local_path("sub/a.txt")).unwrap().file_id);
    assert_eq!(row.node_id_local, local_id);

    // A second pass with no further changes plans nothing.
    h.settle();
    let summary = h.engine.run_one_pass().unwrap();
    assert_eq!(summary.planned, 0, "second pass must be a no-op");
}

#[test]
fn remote_edit_propagates_to_local() {
    let h = Harness::new();

    h.fs.create_dir_all(h.local_path("sub")).unwrap();
    h.fs.write(h.local_path("sub/a.txt"), b"hello").unwrap();
    h.sync();

    let mtime_before = h.fs.metadata(h.local_path("sub/a.txt")).unwrap().modified;

    // Remote user rewrites the file.
    let item = h.drive.item_at_path("sub/a.txt").unwrap();
    h.drive.remote_write(&item.parent_id, "a.txt", b"hello world");

    // Wait for the long-poll to deliver the delta, then run a pass.
    h.wait_until("remote edit to reach the observer", || {
        h.drive.item_at_path("sub/a.txt").unwrap().size == 11
    });
    h.sync();

    assert_eq!(h.local_read("sub/a.txt"), b"hello world");
    assert!(h.fs.metadata(h.local_path("sub/a.txt")).unwrap().modified > mtime_before);

    let row = h
        .db
        .node_by_id(ReplicaSide::Remote, &item.id)
        .unwrap()
        .unwrap();
    assert_eq!(row.size, 11);
}

#[test]
fn create_create_conflict_renames_local_copy() {
    let h = Harness::new();

    // Both replicas create x.txt with different content before any pass.
    h.fs.write(h.local_path("x.txt"), b"A").unwrap();
    h.drive.remote_write(&h.drive.root_id(), "x.txt", b"B");

    h.sync();
    // The conflict rename triggers a restart pass; make sure everything
    // converged afterwards.
    h.sync();

    // Remote content wins at the original path, on both sides.
    assert_eq!(h.local_read("x.txt"), b"B");
    assert_eq!(h.remote_read("x.txt").unwrap(), b"B");

    // The local copy lives on under the conflict name, on both sides.
    let conflict_name = "x (Conflict 1111).txt";
    assert_eq!(h.local_read(conflict_name), b"A");
    assert_eq!(h.remote_read(conflict_name).unwrap(), b"A");
}

#[test]
fn move_wins_over_delete() {
    let h = Harness::new();

    h.fs.create_dir_all(h.local_path("dir")).unwrap();
    h.fs.create_dir_all(h.local_path("other")).unwrap();
    h.fs.write(h.local_path("dir/a.txt"), b"content").unwrap();
    h.sync();
    assert!(h.remote_exists("dir/a.txt"));

    // Local renames the file into another directory while the remote
    // deletes the original.
    let remote_file = h.drive.item_at_path("dir/a.txt").unwrap();
    h.drive.remote_delete(&remote_file.id);
    h.fs.rename(h.local_path("dir/a.txt"), h.local_path("other/a.txt"))
        .unwrap();

    h.wait_until("remote delete to reach the observer", || {
        !h.remote_exists("dir/a.txt")
    });
    h.sync();
    h.sync();

    // The move wins: the file exists at its new path on both sides and is
    // gone from the old directory.
    assert_eq!(h.remote_read("other/a.txt").unwrap(), b"content");
    assert!(!h.remote_exists("dir/a.txt"));
    assert!(h.local_exists("other/a.txt"));
    assert!(!h.local_exists("dir/a.txt"));
}

#[test]
fn local_delete_propagates_remotely() {
    let h = Harness::new();

    h.fs.write(h.local_path("gone.txt"), b"x").unwrap();
    h.sync();
    assert!(h.remote_exists("gone.txt"));

    h.fs.remove_file(h.local_path("gone.txt")).unwrap();
    h.sync();

    assert!(!h.remote_exists("gone.txt"));
    assert!(h
        .db
        .node_by_id(ReplicaSide::Local, &NodeId::from("absent"))
        .unwrap()
        .is_none());
}

#[test]
fn remote_create_produces_local_file() {
    let h = Harness::new();

    let dir = h.drive.remote_mkdir(&h.drive.root_id(), "incoming");
    h.drive.remote_write(&dir, "fresh.txt", b"from the drive");

    h.wait_until("remote create to reach the observer", || {
        h.remote_exists("incoming/fresh.txt")
    });
    h.sync();

    assert_eq!(h.local_read("incoming/fresh.txt"), b"from the drive");

    // Mapping present and a further pass plans nothing.
    h.settle();
    let summary = h.engine.run_one_pass().unwrap();
    assert_eq!(summary.planned, 0);
}

#[test]
fn dismantle_strips_virtual_state_and_keeps_content() {
    let h = Harness::new();

    h.fs.write(h.local_path("keep.txt"), b"data").unwrap();
    h.sync();

    let support::Harness {
        engine,
        fs,
        manager,
        ..
    } = h;

    // Without a platform VFS nothing is a placeholder, so teardown leaves
    // the tree untouched and reports no removals.
    let removed = engine.dismantle().unwrap();
    assert!(removed.is_empty());
    assert!(fs.exists("/local/keep.txt").unwrap());
    manager.stop();
}

#[test]
fn rename_propagates_as_move_not_recreate() {
    let h = Harness::new();

    h.fs.write(h.local_path("old.txt"), b"stable").unwrap();
    h.sync();
    let remote_id_before = h.drive.item_at_path("old.txt").unwrap().id;

    h.fs.rename(h.local_path("old.txt"), h.local_path("new.txt"))
        .unwrap();
    h.sync();

    let remote_after = h.drive.item_at_path("new.txt").unwrap();
    // Same remote identity: the rename was a move, not delete + upload.
    assert_eq!(remote_after.id, remote_id_before);
    assert!(!h.remote_exists("old.txt"));
}

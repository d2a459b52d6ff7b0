//! Upload-session lifecycle across engine restarts: a token left behind by
//! an interrupted session is cancelled on the server before the next run
//! uploads anything.

mod support;

use libkeel::{DriveApi, SessionStartRequest};
use support::Harness;

#[test]
fn stale_session_token_is_cancelled_on_engine_start() {
    // First engine run: simulate an interrupted session by opening one on
    // the server and persisting its token, the way a killed process would
    // leave things.
    let h = Harness::new();
    let token = h
        .drive
        .start_upload_session(&SessionStartRequest {
            total_size: 1024,
            total_chunks: 1,
            file_name: Some("big.bin".into()),
            parent_id: Some(h.drive.root_id()),
            file_id: None,
        })
        .unwrap();
    h.db.insert_upload_session_token(&token).unwrap();
    assert_eq!(h.drive.open_session_count(), 1);

    // Second engine over the same DB and drive: construction cancels the
    // stale session and clears the token.
    let drive = h.drive.clone();
    let db = std::sync::Arc::clone(&h.db);
    drop(h);

    let manager = libkeel::JobManager::with_capacity(2);
    let fs = std::sync::Arc::new(watchfs::Fs::new(watchfs::InMemoryFs::new()));
    fs.create_dir_all("/local").unwrap();
    let root_id = libkeel::NodeId::from(fs.metadata("/local").unwrap().file_id);

    let _engine = libkeel::SyncEngine::new(libkeel::EngineParams {
        fs,
        api: std::sync::Arc::new(drive.clone()),
        vfs: std::sync::Arc::new(libkeel::NoopVfs),
        db: std::sync::Arc::clone(&db),
        manager,
        errors: libkeel::log_error_sink(),
        local_root: "/local".into(),
        local_root_id: root_id,
        remote_root_id: drive.root_id(),
        exclusions: std::sync::Arc::new(libkeel::ExclusionTemplates::builtin()),
        fault_receiver: None,
        options: libkeel::EngineOptions::default(),
    })
    .unwrap();

    assert_eq!(drive.open_session_count(), 0, "stale session must be cancelled");
    assert!(db.upload_session_tokens().unwrap().is_empty());
}

#[test]
fn chunked_upload_round_trips_content() {
    let h = Harness::new();

    // Content large enough to be split when chunk size is forced small is
    // covered in unit tests; here the whole stack runs with one chunk and
    // verifies the rolling hash end to end.
    let payload: Vec<u8> = (0u32..200_000).map(|value| value as u8).collect();
    h.fs.write(h.local_path("blob.bin"), &payload).unwrap();

    h.sync();

    assert_eq!(h.remote_read("blob.bin").unwrap(), payload);
    assert_eq!(h.drive.open_session_count(), 0);
}

#[test]
fn edited_content_reuploads_through_session() {
    let h = Harness::new();

    h.fs.write(h.local_path("doc.txt"), b"first").unwrap();
    h.sync();
    let remote_id = h.drive.item_at_path("doc.txt").unwrap().id;

    h.fs.write(h.local_path("doc.txt"), b"second revision").unwrap();
    h.sync();

    // Same remote identity, new content.
    let item = h.drive.item_at_path("doc.txt").unwrap();
    assert_eq!(item.id, remote_id);
    assert_eq!(h.remote_read("doc.txt").unwrap(), b"second revision");
    assert!(h.db.upload_session_tokens().unwrap().is_empty());
}

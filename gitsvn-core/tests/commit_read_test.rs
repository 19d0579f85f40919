//! End-to-end tests of the commit builder against the versioned
//! filesystem: content filters, attribute interactions, copies, and the
//! compare-and-swap commit path.

use std::io::{Read, Write};
use std::sync::Arc;

use bytes::Bytes;
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use md5::{Digest, Md5};

use gitsvn_core::{
    odb, CommitOptions, Database, EditorSession, FilterContext, GitFs, MemoryStore, NodeKind,
    RepoError,
};
use gitsvn_protocol::{SvndiffEncoder, SvndiffVersion};

fn content_foo() -> Vec<u8> {
    let mut data = b"Some data\n".repeat(100);
    data.extend_from_slice(b"Foo file\n");
    data
}

fn content_bar() -> Vec<u8> {
    let mut data = b"Some data\n".repeat(100);
    data.extend_from_slice(b"Bar file\n");
    data
}

fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

fn gunzip(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    MultiGzDecoder::new(data).read_to_end(&mut out).unwrap();
    out
}

async fn open_fs() -> Arc<GitFs> {
    let store = MemoryStore::new();
    let db = Arc::new(Database::open_in_memory().unwrap());
    GitFs::open(store, db, "refs/heads/master", FilterContext::default())
        .await
        .unwrap()
}

async fn begin(fs: &Arc<GitFs>, message: &str) -> EditorSession {
    let base_rev = fs.latest_rev().unwrap();
    let mut editor = EditorSession::begin(
        fs.clone(),
        CommitOptions {
            base_rev,
            message: message.to_string(),
            author: "alice".to_string(),
            lock_tokens: Default::default(),
            keep_locks: false,
        },
    )
    .await
    .unwrap();
    editor.open_root().unwrap();
    editor
}

fn send_text(editor: &mut EditorSession, content: &[u8]) {
    let chunks = SvndiffEncoder::new(SvndiffVersion::V0).encode(content).unwrap();
    for chunk in chunks {
        editor.textdelta_chunk(&chunk).unwrap();
    }
    editor.textdelta_end().unwrap();
}

async fn add_file(editor: &mut EditorSession, path: &str, content: &[u8]) {
    editor.add_file(path, None).await.unwrap();
    editor.apply_textdelta(None).await.unwrap();
    send_text(editor, content);
    editor.close_file(None).unwrap();
}

async fn modify_file(editor: &mut EditorSession, path: &str, content: &[u8]) {
    editor.open_file(path, None).await.unwrap();
    editor.apply_textdelta(None).await.unwrap();
    send_text(editor, content);
    editor.close_file(None).unwrap();
}

async fn commit_one(fs: &Arc<GitFs>, path: &str, content: &[u8], message: &str) -> u64 {
    let mut editor = begin(fs, message).await;
    let exists = fs
        .stat(fs.latest_rev().unwrap(), path)
        .await
        .unwrap()
        .is_some();
    if exists {
        modify_file(&mut editor, path, content).await;
    } else {
        add_file(&mut editor, path, content).await;
    }
    editor.close_dir().unwrap();
    editor.close_edit().await.unwrap().rev
}

#[tokio::test]
async fn empty_repository_is_revision_zero() {
    let fs = open_fs().await;
    assert_eq!(fs.latest_rev().unwrap(), 0);
    let root = fs.stat(0, "/").await.unwrap().unwrap();
    assert_eq!(root.kind, NodeKind::Dir);
    assert!(fs.list(0, "/").await.unwrap().is_empty());
    assert!(fs.stat(0, "/nope").await.unwrap().is_none());
}

#[tokio::test]
async fn commit_then_read_roundtrip() {
    let fs = open_fs().await;
    let rev = commit_one(&fs, "/hello.txt", b"hello world\n", "add hello").await;
    assert_eq!(rev, 1);

    let content = fs.read(rev, "/hello.txt").await.unwrap();
    assert_eq!(&content[..], b"hello world\n");

    let node = fs.stat(rev, "/hello.txt").await.unwrap().unwrap();
    assert_eq!(node.size, content.len() as u64);
    assert_eq!(node.md5, hex::encode(Md5::digest(&content)));
    assert_eq!(node.created_rev, 1);

    let record = fs.revision(1).await.unwrap();
    assert_eq!(record.author, "alice");
    assert_eq!(record.message, "add hello");
}

#[tokio::test]
async fn revision_commit_bijection() {
    let fs = open_fs().await;
    for i in 0..5 {
        commit_one(&fs, "/file.txt", format!("v{i}\n").as_bytes(), "edit").await;
    }
    assert_eq!(fs.latest_rev().unwrap(), 5);
    for rev in 1..=5 {
        let record = fs.revision(rev).await.unwrap();
        assert_eq!(fs.index().by_commit(record.commit_id).unwrap(), Some(rev));
    }
    assert!(matches!(
        fs.revision(42).await,
        Err(RepoError::RevisionNotFound(42))
    ));
}

#[tokio::test]
async fn binary_read_with_filter_toggled_by_attributes() {
    let fs = open_fs().await;
    let uncompressed = b"Test file\0".to_vec();
    let compressed = gzip(&uncompressed);

    commit_one(&fs, "/data.z", &compressed, "add data.z").await;
    commit_one(&fs, "/data.x", &compressed, "add data.x").await;
    assert_eq!(&fs.read(2, "/data.z").await.unwrap()[..], &compressed[..]);
    assert_eq!(&fs.read(2, "/data.x").await.unwrap()[..], &compressed[..]);

    // Declaring the filter changes how the same blob reads.
    let rev = commit_one(&fs, "/.gitattributes", b"*.z\t\t\tfilter=gzip\n", "add filter").await;
    assert_eq!(&fs.read(rev, "/data.z").await.unwrap()[..], &uncompressed[..]);
    assert_eq!(&fs.read(rev, "/data.x").await.unwrap()[..], &compressed[..]);

    // Earlier revisions are unaffected.
    assert_eq!(&fs.read(2, "/data.z").await.unwrap()[..], &compressed[..]);

    // Swapping the filter swaps the interpretation.
    let rev = commit_one(&fs, "/.gitattributes", b"*.x\t\t\tfilter=gzip\n", "move filter").await;
    assert_eq!(&fs.read(rev, "/data.z").await.unwrap()[..], &compressed[..]);
    assert_eq!(&fs.read(rev, "/data.x").await.unwrap()[..], &uncompressed[..]);
}

#[tokio::test]
async fn attribute_commit_reports_affected_files_as_changed() {
    let fs = open_fs().await;
    let compressed = gzip(b"Test file");

    commit_one(&fs, "/data.z", &compressed, "add data.z").await;
    commit_one(&fs, "/data.x", &compressed, "add data.x").await;
    let rev = commit_one(&fs, "/.gitattributes", b"*.z\t\t\tfilter=gzip\n", "add filter").await;

    // The filter changes /data.z's effective content, so the revision
    // reports both paths.
    let entries = fs.log(&["/".to_string()], rev, rev, 0, true).await.unwrap();
    assert_eq!(entries.len(), 1);
    let changed: Vec<&str> = entries[0]
        .changed
        .iter()
        .map(|c| c.path.as_str())
        .collect();
    assert_eq!(changed, vec!["/.gitattributes", "/data.z"]);
}

#[tokio::test]
async fn write_through_filter_stores_encoded_blob() {
    let fs = open_fs().await;
    commit_one(&fs, "/.gitattributes", b"*.z filter=gzip\n", "filter").await;

    let raw = content_foo();
    let rev = commit_one(&fs, "/data.z", &raw, "add data.z").await;

    // Client-visible bytes round-trip exactly.
    assert_eq!(&fs.read(rev, "/data.z").await.unwrap()[..], &raw[..]);

    // The stored blob is the gzipped form.
    let node = fs.stat(rev, "/data.z").await.unwrap().unwrap();
    let stored = odb::read_blob(fs.store().as_ref(), node.oid).await.unwrap();
    assert_ne!(&stored[..], &raw[..]);
    assert_eq!(gunzip(&stored), raw);
}

#[tokio::test]
async fn mixed_order_commit_file_before_attributes() {
    let fs = open_fs().await;
    let raw = content_foo();

    let mut editor = begin(&fs, "file then attributes").await;
    add_file(&mut editor, "/data.z", &raw).await;
    add_file(&mut editor, "/.gitattributes", b"*.z filter=gzip\n").await;
    editor.close_dir().unwrap();
    let rev = editor.close_edit().await.unwrap().rev;

    assert_eq!(&fs.read(rev, "/data.z").await.unwrap()[..], &raw[..]);
    let node = fs.stat(rev, "/data.z").await.unwrap().unwrap();
    let stored = odb::read_blob(fs.store().as_ref(), node.oid).await.unwrap();
    assert_eq!(gunzip(&stored), raw);

    // A later commit touching both stays readable.
    let raw2 = content_bar();
    let mut editor = begin(&fs, "modify both").await;
    modify_file(&mut editor, "/data.z", &raw2).await;
    modify_file(&mut editor, "/.gitattributes", b"*.z filter=gzip\n# keep\n").await;
    editor.close_dir().unwrap();
    let rev = editor.close_edit().await.unwrap().rev;
    assert_eq!(&fs.read(rev, "/data.z").await.unwrap()[..], &raw2[..]);
}

#[tokio::test]
async fn mixed_order_commit_attributes_before_file() {
    let fs = open_fs().await;
    let raw = content_foo();

    let mut editor = begin(&fs, "attributes then file").await;
    add_file(&mut editor, "/.gitattributes", b"*.z filter=gzip\n").await;
    add_file(&mut editor, "/data.z", &raw).await;
    editor.close_dir().unwrap();
    let rev = editor.close_edit().await.unwrap().rev;

    assert_eq!(&fs.read(rev, "/data.z").await.unwrap()[..], &raw[..]);
    let node = fs.stat(rev, "/data.z").await.unwrap().unwrap();
    let stored = odb::read_blob(fs.store().as_ref(), node.oid).await.unwrap();
    assert_eq!(gunzip(&stored), raw);
}

#[tokio::test]
async fn copy_across_filter_boundary_transcodes() {
    let fs = open_fs().await;
    let raw = content_foo();
    commit_one(&fs, "/.gitattributes", b"*.z filter=gzip\n", "filter").await;
    let src_rev = commit_one(&fs, "/data.txt", &raw, "plain file").await;

    let mut editor = begin(&fs, "copy to filtered name").await;
    editor
        .add_file("/data.z", Some(("/data.txt".to_string(), src_rev)))
        .await
        .unwrap();
    editor.close_file(None).unwrap();
    editor.close_dir().unwrap();
    let rev = editor.close_edit().await.unwrap().rev;

    assert_eq!(&fs.read(rev, "/data.z").await.unwrap()[..], &raw[..]);
    let node = fs.stat(rev, "/data.z").await.unwrap().unwrap();
    let stored = odb::read_blob(fs.store().as_ref(), node.oid).await.unwrap();
    assert_eq!(gunzip(&stored), raw);
}

#[tokio::test]
async fn copy_with_delta_applies_against_source_content() {
    let fs = open_fs().await;
    let raw = content_foo();
    let raw2 = content_bar();
    commit_one(&fs, "/.gitattributes", b"*.z filter=gzip\n", "filter").await;
    let src_rev = commit_one(&fs, "/data.txt", &raw, "plain file").await;

    let mut editor = begin(&fs, "copy and edit").await;
    editor
        .add_file("/data.z", Some(("/data.txt".to_string(), src_rev)))
        .await
        .unwrap();
    editor.apply_textdelta(None).await.unwrap();
    send_text(&mut editor, &raw2);
    editor.close_file(None).unwrap();
    editor.close_dir().unwrap();
    let rev = editor.close_edit().await.unwrap().rev;

    assert_eq!(&fs.read(rev, "/data.z").await.unwrap()[..], &raw2[..]);
}

#[tokio::test]
async fn base_checksum_mismatch_is_rejected() {
    let fs = open_fs().await;
    commit_one(&fs, "/a.txt", b"first\n", "add").await;

    let mut editor = begin(&fs, "bad base").await;
    editor.open_file("/a.txt", None).await.unwrap();
    let err = editor
        .apply_textdelta(Some("00000000000000000000000000000000".to_string()))
        .await
        .unwrap_err();
    assert!(matches!(err, RepoError::ChecksumMismatch { .. }));
}

#[tokio::test]
async fn concurrent_commits_rebase_or_conflict() {
    let fs = open_fs().await;
    commit_one(&fs, "/a.txt", b"a\n", "add a").await;
    commit_one(&fs, "/b.txt", b"b\n", "add b").await;
    let base = fs.latest_rev().unwrap();

    // Two editors begin from the same base; the first wins the ref.
    let mut first = begin(&fs, "edit a").await;
    modify_file(&mut first, "/a.txt", b"a v2\n").await;
    first.close_dir().unwrap();

    let mut disjoint = begin(&fs, "edit b").await;
    modify_file(&mut disjoint, "/b.txt", b"b v2\n").await;
    disjoint.close_dir().unwrap();

    let mut conflicting = begin(&fs, "edit a too").await;
    modify_file(&mut conflicting, "/a.txt", b"a v3\n").await;
    conflicting.close_dir().unwrap();

    assert_eq!(first.close_edit().await.unwrap().rev, base + 1);

    // Disjoint paths rebase transparently onto the moved head.
    let rev = disjoint.close_edit().await.unwrap().rev;
    assert_eq!(rev, base + 2);
    assert_eq!(&fs.read(rev, "/a.txt").await.unwrap()[..], b"a v2\n");
    assert_eq!(&fs.read(rev, "/b.txt").await.unwrap()[..], b"b v2\n");

    // Same-path edits report out of date.
    let err = conflicting.close_edit().await.unwrap_err();
    match err {
        RepoError::OutOfDate { paths } => assert_eq!(paths, vec!["/a.txt".to_string()]),
        other => panic!("expected OutOfDate, got {other:?}"),
    }
}

#[tokio::test]
async fn locks_gate_commits() {
    let fs = open_fs().await;
    commit_one(&fs, "/guarded.txt", b"v1\n", "add").await;
    let lock = fs.locks().lock("/guarded.txt", "bob", None, false).unwrap();

    // No token: denied.
    let mut editor = begin(&fs, "no token").await;
    modify_file(&mut editor, "/guarded.txt", b"v2\n").await;
    editor.close_dir().unwrap();
    assert!(matches!(
        editor.close_edit().await.unwrap_err(),
        RepoError::LockDenied(_)
    ));

    // Matching token: accepted, and the lock is released afterwards.
    let base_rev = fs.latest_rev().unwrap();
    let mut tokens = std::collections::HashMap::new();
    tokens.insert("/guarded.txt".to_string(), lock.token.clone());
    let mut editor = EditorSession::begin(
        fs.clone(),
        CommitOptions {
            base_rev,
            message: "with token".to_string(),
            author: "bob".to_string(),
            lock_tokens: tokens,
            keep_locks: false,
        },
    )
    .await
    .unwrap();
    editor.open_root().unwrap();
    modify_file(&mut editor, "/guarded.txt", b"v2\n").await;
    editor.close_dir().unwrap();
    let rev = editor.close_edit().await.unwrap().rev;
    assert_eq!(&fs.read(rev, "/guarded.txt").await.unwrap()[..], b"v2\n");
    assert!(fs.locks().get("/guarded.txt").unwrap().is_none());
}

#[tokio::test]
async fn editor_state_machine_is_enforced() {
    let fs = open_fs().await;
    let mut editor = begin(&fs, "misuse").await;

    assert!(matches!(
        editor.close_file(None),
        Err(RepoError::IllegalEditorState(_))
    ));
    assert!(matches!(
        editor.textdelta_chunk(b"x"),
        Err(RepoError::IllegalEditorState(_))
    ));

    add_file(&mut editor, "/x.txt", b"x\n").await;
    editor.close_dir().unwrap();
    editor.close_edit().await.unwrap();

    // Anything after close fails.
    assert!(matches!(
        editor.open_root(),
        Err(RepoError::IllegalEditorState(_))
    ));
    assert!(matches!(
        editor.delete_entry("/x.txt", None).await,
        Err(RepoError::IllegalEditorState(_))
    ));
}

#[tokio::test]
async fn property_changes_must_match_attributes() {
    let fs = open_fs().await;
    let mut editor = begin(&fs, "conflicting props").await;
    editor.add_file("/plain.txt", None).await.unwrap();
    editor.apply_textdelta(None).await.unwrap();
    send_text(&mut editor, b"text\n");
    editor
        .change_file_prop("svn:eol-style", Some(b"native".to_vec()))
        .unwrap();
    editor.close_file(None).unwrap();
    editor.close_dir().unwrap();
    // No .gitattributes makes the file native, so the property conflicts.
    assert!(matches!(
        editor.close_edit().await.unwrap_err(),
        RepoError::PropertyConflict { .. }
    ));

    // With matching attributes the same property change is accepted.
    let mut editor = begin(&fs, "matching props").await;
    add_file(&mut editor, "/.gitattributes", b"*.txt text\n").await;
    editor.add_file("/plain.txt", None).await.unwrap();
    editor.apply_textdelta(None).await.unwrap();
    send_text(&mut editor, b"text\n");
    editor
        .change_file_prop("svn:eol-style", Some(b"native".to_vec()))
        .unwrap();
    editor.close_file(None).unwrap();
    editor.close_dir().unwrap();
    let rev = editor.close_edit().await.unwrap().rev;
    let props = fs.properties(rev, "/plain.txt", false).await.unwrap();
    assert_eq!(props.get("svn:eol-style").unwrap(), b"native");
}

#[tokio::test]
async fn deleted_directories_disappear_entirely() {
    let fs = open_fs().await;
    commit_one(&fs, "/dir/a.txt", b"a\n", "add a").await;
    commit_one(&fs, "/dir/b.txt", b"b\n", "add b").await;

    let mut editor = begin(&fs, "drop dir").await;
    editor.delete_entry("/dir", None).await.unwrap();
    editor.close_dir().unwrap();
    let rev = editor.close_edit().await.unwrap().rev;

    assert!(fs.stat(rev, "/dir").await.unwrap().is_none());
    assert!(fs.stat(rev, "/dir/a.txt").await.unwrap().is_none());
    assert!(fs.stat(rev - 1, "/dir/a.txt").await.unwrap().is_some());
}

#[tokio::test]
async fn history_follows_copies() {
    let fs = open_fs().await;
    commit_one(&fs, "/orig.txt", b"v1\n", "add").await;
    commit_one(&fs, "/orig.txt", b"v2\n", "edit").await;

    let src_rev = fs.latest_rev().unwrap();
    let mut editor = begin(&fs, "rename").await;
    editor
        .add_file("/renamed.txt", Some(("/orig.txt".to_string(), src_rev)))
        .await
        .unwrap();
    editor.close_file(None).unwrap();
    editor.delete_entry("/orig.txt", None).await.unwrap();
    editor.close_dir().unwrap();
    let rev = editor.close_edit().await.unwrap().rev;

    let history = fs.history("/renamed.txt", rev).await.unwrap();
    let paths: Vec<&str> = history.iter().map(|(_, p)| p.as_str()).collect();
    assert_eq!(paths, vec!["/renamed.txt", "/orig.txt", "/orig.txt"]);
    let revs: Vec<u64> = history.iter().map(|(r, _)| *r).collect();
    assert_eq!(revs, vec![rev, 2, 1]);
}

#[tokio::test]
async fn blame_attributes_lines_to_revisions() {
    let fs = open_fs().await;
    commit_one(&fs, "/file.txt", b"one\ntwo\nthree\n", "base").await;
    commit_one(&fs, "/file.txt", b"one\nTWO\nthree\nfour\n", "edit").await;

    let blame = fs.blame("/file.txt", 2).await.unwrap();
    let revs: Vec<u64> = blame.iter().map(|line| line.rev).collect();
    assert_eq!(revs, vec![1, 2, 1, 2]);
    assert_eq!(blame[1].text, b"TWO\n");
    assert_eq!(blame[3].author, "alice");
    assert_eq!(blame[0].line_no, 1);
}

#[tokio::test]
async fn log_limits_and_ordering() {
    let fs = open_fs().await;
    for i in 0..4 {
        commit_one(&fs, "/f.txt", format!("{i}\n").as_bytes(), "edit").await;
    }
    commit_one(&fs, "/other.txt", b"x\n", "other").await;

    // Ascending, filtered by path.
    let entries = fs
        .log(&["/f.txt".to_string()], 1, 5, 0, false)
        .await
        .unwrap();
    let revs: Vec<u64> = entries.iter().map(|e| e.rev).collect();
    assert_eq!(revs, vec![1, 2, 3, 4]);

    // Descending with a limit.
    let entries = fs
        .log(&["/".to_string()], 5, 1, 2, false)
        .await
        .unwrap();
    let revs: Vec<u64> = entries.iter().map(|e| e.rev).collect();
    assert_eq!(revs, vec![5, 4]);
}

#[tokio::test]
async fn properties_synthesize_from_attributes_and_gitignore() {
    let fs = open_fs().await;
    let mut editor = begin(&fs, "setup").await;
    add_file(&mut editor, "/.gitattributes", b"*.txt text\n*.bin binary\n").await;
    add_file(&mut editor, "/.gitignore", b"*.o\n/scratch\n").await;
    add_file(&mut editor, "/readme.txt", b"hi\n").await;
    add_file(&mut editor, "/blob.bin", &[0u8, 1, 2]).await;
    editor.close_dir().unwrap();
    let rev = editor.close_edit().await.unwrap().rev;

    let props = fs.properties(rev, "/readme.txt", false).await.unwrap();
    assert_eq!(props.get("svn:eol-style").unwrap(), b"native");

    let props = fs.properties(rev, "/blob.bin", false).await.unwrap();
    assert_eq!(
        props.get("svn:mime-type").unwrap(),
        b"application/octet-stream"
    );

    let props = fs.properties(rev, "/", false).await.unwrap();
    assert_eq!(props.get("svn:ignore").unwrap(), b"scratch\n");
    assert_eq!(props.get("svn:global-ignores").unwrap(), b"*.o\n");
    assert!(props.contains_key("svn:auto-props"));

    // Pure function of the tree: repeated calls agree.
    let again = fs.properties(rev, "/readme.txt", false).await.unwrap();
    assert_eq!(again, fs.properties(rev, "/readme.txt", false).await.unwrap());
}

#[tokio::test]
async fn observe_assigns_dense_revisions_to_external_commits() {
    let fs = open_fs().await;
    commit_one(&fs, "/a.txt", b"a\n", "first").await;
    let head = fs.revision(1).await.unwrap();

    // A commit created behind the server's back (a git push).
    let store = fs.store().clone();
    let blob = store
        .write(gix_object::Kind::Blob, b"external\n")
        .await
        .unwrap();
    let mut tree = odb::read_tree(store.as_ref(), head.tree_id).await.unwrap();
    tree.entries.push(odb::TreeEntry {
        mode: odb::mode::FILE,
        name: "ext.txt".to_string(),
        oid: blob,
    });
    let tree_id = odb::write_tree(store.as_ref(), &tree).await.unwrap();
    let signature = gix_actor::Signature {
        name: "pusher".into(),
        email: "pusher@example".into(),
        time: gix_date::Time {
            seconds: 1_700_000_000,
            offset: 0,
            sign: gix_date::time::Sign::Plus,
        },
    };
    let commit = gix_object::Commit {
        tree: tree_id,
        parents: vec![head.commit_id].into(),
        author: signature.clone(),
        committer: signature,
        encoding: None,
        message: "pushed from git".into(),
        extra_headers: Vec::new(),
    };
    let commit_id = odb::write_commit(store.as_ref(), &commit).await.unwrap();
    store
        .update_ref("refs/heads/master", Some(head.commit_id), commit_id)
        .await
        .unwrap();

    assert_eq!(fs.observe().await.unwrap(), 2);
    let record = fs.revision(2).await.unwrap();
    assert_eq!(record.commit_id, commit_id);
    assert_eq!(record.author, "pusher");
    assert_eq!(&fs.read(2, "/ext.txt").await.unwrap()[..], b"external\n");

    let changed = fs.index().changed_paths(2).unwrap();
    assert_eq!(changed.len(), 1);
    assert_eq!(changed[0].path, "/ext.txt");
}

#[tokio::test]
async fn loose_store_persists_across_reopen() {
    let git_dir = tempfile::tempdir().unwrap();
    let db_dir = tempfile::tempdir().unwrap();

    let rev = {
        let store = Arc::new(gitsvn_core::LooseStore::init(git_dir.path()).unwrap());
        let db = Arc::new(Database::open(db_dir.path()).unwrap());
        let fs = GitFs::open(store, db, "refs/heads/master", FilterContext::default())
            .await
            .unwrap();
        commit_one(&fs, "/persisted.txt", b"still here\n", "persist").await
    };

    let store = Arc::new(gitsvn_core::LooseStore::open(git_dir.path()).unwrap());
    let db = Arc::new(Database::open(db_dir.path()).unwrap());
    let fs = GitFs::open(store, db, "refs/heads/master", FilterContext::default())
        .await
        .unwrap();
    assert_eq!(fs.latest_rev().unwrap(), rev);
    assert_eq!(
        &fs.read(rev, "/persisted.txt").await.unwrap()[..],
        b"still here\n"
    );
}

#[tokio::test]
async fn content_survives_arbitrary_filter_chain() {
    // Round-trip invariant: whatever the chain, commit-then-read is exact.
    let fs = open_fs().await;
    commit_one(&fs, "/.gitattributes", b"*.z filter=gzip\n", "filter").await;
    for payload in [
        Bytes::from_static(b""),
        Bytes::from_static(b"short"),
        Bytes::from(vec![0u8; 100_000]),
        Bytes::from((0..=255u8).cycle().take(70_000).collect::<Vec<u8>>()),
    ] {
        let rev = commit_one(&fs, "/data.z", &payload, "payload").await;
        assert_eq!(fs.read(rev, "/data.z").await.unwrap(), payload);
    }
}

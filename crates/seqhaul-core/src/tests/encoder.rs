use std::io::Read;
use std::path::Path;
use std::time::Duration;

use flate2::bufread::MultiGzDecoder;
use tar::Archive;

use crate::encoder::{label, snapshot, ChunkMeta, SnapshotRequest};
use crate::exclude::ExclusionPlan;
use crate::index::commit_pending;
use crate::testutil::write_file;

struct Member {
    path: String,
    typeflag: u8,
    data: Vec<u8>,
}

/// Decompress (multi-member gzip) and parse a tar byte stream.
fn read_members(bytes: &[u8]) -> Vec<Member> {
    let mut decompressed = Vec::new();
    MultiGzDecoder::new(bytes)
        .read_to_end(&mut decompressed)
        .unwrap();
    parse_tar(&decompressed)
}

fn parse_tar(decompressed: &[u8]) -> Vec<Member> {
    let mut archive = Archive::new(decompressed);
    let mut members = Vec::new();
    for entry in archive.entries().unwrap() {
        let mut entry = entry.unwrap();
        let path = entry.path().unwrap().to_string_lossy().to_string();
        let typeflag = entry.header().entry_type().as_byte();
        let mut data = Vec::new();
        entry.read_to_end(&mut data).unwrap();
        members.push(Member {
            path,
            typeflag,
            data,
        });
    }
    members
}

fn regular_files(members: &[Member]) -> Vec<&Member> {
    members.iter().filter(|m| m.typeflag == b'0').collect()
}

fn meta(timestamp: i64, increment: u64) -> ChunkMeta {
    ChunkMeta {
        run_id_short: "240112_TEST".into(),
        timestamp,
        increment,
        host: "seq01".into(),
        user: "svc".into(),
        ip: "10.0.0.5".into(),
        cron: 0,
    }
}

fn take(
    source: &Path,
    index_path: &Path,
    staging: &Path,
    is_final: bool,
    compare_device: bool,
    timestamp: i64,
) -> crate::encoder::SnapshotOutcome {
    let plan = ExclusionPlan::compute(
        source,
        &["Logs".to_string()],
        Duration::from_secs(0),
        is_final,
    );
    snapshot(&SnapshotRequest {
        source_root: source,
        index_path,
        staging_dir: staging,
        plan: &plan,
        is_final,
        compare_device,
        meta: meta(timestamp, 0),
    })
    .unwrap()
}

#[test]
fn chunks_concatenate_into_one_valid_tar() {
    let source = tempfile::tempdir().unwrap();
    let staging = tempfile::tempdir().unwrap();
    let index_path = staging.path().join("index.json");

    write_file(source.path(), "a.txt", b"first version");
    write_file(source.path(), "sub/b.txt", b"stable");
    write_file(source.path(), "Logs/noise.log", b"excluded");

    let first = take(source.path(), &index_path, staging.path(), false, true, 100);
    assert_eq!(first.generation, 1);
    commit_pending(&index_path).unwrap();

    write_file(source.path(), "a.txt", b"second version, longer");
    write_file(source.path(), "c.txt", b"new file");

    let second = take(source.path(), &index_path, staging.path(), true, true, 200);
    assert_eq!(second.generation, 2);
    commit_pending(&index_path).unwrap();

    // An intermediate chunk carries no end-of-archive trailer and stays
    // block-aligned.
    let chunk1 = std::fs::read(&first.chunk_path).unwrap();
    let mut raw1 = Vec::new();
    MultiGzDecoder::new(chunk1.as_slice())
        .read_to_end(&mut raw1)
        .unwrap();
    assert_eq!(raw1.len() % 512, 0);
    assert!(raw1[raw1.len() - 1024..].iter().any(|&b| b != 0));

    // The final chunk alone holds exactly the deltas.
    let chunk2 = std::fs::read(&second.chunk_path).unwrap();
    let members2 = read_members(&chunk2);
    assert_eq!(members2[0].typeflag, b'V');
    let files2: Vec<String> = regular_files(&members2)
        .iter()
        .map(|m| m.path.clone())
        .collect();
    assert_eq!(files2, vec!["a.txt".to_string(), "c.txt".to_string()]);

    // The byte concatenation decompresses to one tar whose member set is
    // the union, extraction order delivering the newest version last.
    let mut concat = chunk1.clone();
    concat.extend_from_slice(&chunk2);
    let members = read_members(&concat);

    let labels: Vec<&Member> = members.iter().filter(|m| m.typeflag == b'V').collect();
    assert_eq!(labels.len(), 2);
    let decoded = label::decode_label(&labels[0].path).unwrap();
    assert_eq!(decoded.increment, 1);
    assert_eq!(decoded.run_id_short, "240112_TEST");

    let files: Vec<&Member> = regular_files(&members);
    let names: Vec<&str> = files.iter().map(|m| m.path.as_str()).collect();
    assert_eq!(names, vec!["a.txt", "sub/b.txt", "a.txt", "c.txt"]);
    assert!(names.iter().all(|n| !n.starts_with("Logs")));

    let last_a = files.iter().rev().find(|m| m.path == "a.txt").unwrap();
    assert_eq!(last_a.data, b"second version, longer");
}

#[test]
fn unchanged_tree_emits_empty_delta() {
    let source = tempfile::tempdir().unwrap();
    let staging = tempfile::tempdir().unwrap();
    let index_path = staging.path().join("index.json");

    write_file(source.path(), "a.txt", b"content");
    let first = take(source.path(), &index_path, staging.path(), false, true, 100);
    assert!(first.members > 0);
    commit_pending(&index_path).unwrap();

    let second = take(source.path(), &index_path, staging.path(), true, true, 200);
    assert_eq!(second.members, 0);
    // Even an empty delta is a parsable chunk carrying the trailer.
    let members = read_members(&std::fs::read(&second.chunk_path).unwrap());
    assert_eq!(members.len(), 1);
    assert_eq!(members[0].typeflag, b'V');
}

#[test]
fn device_renumbering_is_ignored_on_nfs_sources() {
    let source = tempfile::tempdir().unwrap();
    let staging = tempfile::tempdir().unwrap();
    let index_path = staging.path().join("index.json");

    write_file(source.path(), "a.txt", b"content");
    write_file(source.path(), "b.txt", b"more content");
    take(source.path(), &index_path, staging.path(), false, false, 100);
    commit_pending(&index_path).unwrap();

    // Simulate an NFS remount: every indexed device number changes.
    let mut doc: serde_json::Value =
        serde_json::from_slice(&std::fs::read(&index_path).unwrap()).unwrap();
    for (_, entry) in doc["entries"].as_object_mut().unwrap() {
        let dev = entry["device"].as_u64().unwrap();
        entry["device"] = serde_json::json!(dev + 1);
    }
    std::fs::write(&index_path, serde_json::to_vec(&doc).unwrap()).unwrap();

    let nfs = take(source.path(), &index_path, staging.path(), true, false, 200);
    assert_eq!(nfs.members, 0, "no spurious re-emission after remount");
}

#[test]
fn device_change_is_a_change_on_local_sources() {
    let source = tempfile::tempdir().unwrap();
    let staging = tempfile::tempdir().unwrap();
    let index_path = staging.path().join("index.json");

    write_file(source.path(), "a.txt", b"content");
    take(source.path(), &index_path, staging.path(), false, true, 100);
    commit_pending(&index_path).unwrap();

    let mut doc: serde_json::Value =
        serde_json::from_slice(&std::fs::read(&index_path).unwrap()).unwrap();
    for (_, entry) in doc["entries"].as_object_mut().unwrap() {
        let dev = entry["device"].as_u64().unwrap();
        entry["device"] = serde_json::json!(dev + 1);
    }
    std::fs::write(&index_path, serde_json::to_vec(&doc).unwrap()).unwrap();

    let local = take(source.path(), &index_path, staging.path(), true, true, 200);
    assert!(local.members > 0);
}

#[test]
fn symlinks_and_permissions_survive() {
    let source = tempfile::tempdir().unwrap();
    let staging = tempfile::tempdir().unwrap();
    let index_path = staging.path().join("index.json");

    write_file(source.path(), "tool.sh", b"#!/bin/sh\n");
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(
            source.path().join("tool.sh"),
            std::fs::Permissions::from_mode(0o755),
        )
        .unwrap();
        std::os::unix::fs::symlink("tool.sh", source.path().join("tool")).unwrap();
    }

    let outcome = take(source.path(), &index_path, staging.path(), true, true, 100);
    let members = read_members(&std::fs::read(&outcome.chunk_path).unwrap());

    let tool = members.iter().find(|m| m.path == "tool.sh").unwrap();
    assert_eq!(tool.typeflag, b'0');

    #[cfg(unix)]
    {
        let link = members.iter().find(|m| m.path == "tool").unwrap();
        assert_eq!(link.typeflag, b'2');
    }
}

#[test]
fn stale_pending_index_is_discarded_and_deltas_reemitted() {
    let source = tempfile::tempdir().unwrap();
    let staging = tempfile::tempdir().unwrap();
    let index_path = staging.path().join("index.json");

    write_file(source.path(), "a.txt", b"content");
    // First snapshot's chunk is "lost" before upload: no commit.
    let lost = take(source.path(), &index_path, staging.path(), false, true, 100);
    std::fs::remove_file(&lost.chunk_path).unwrap();

    // The next snapshot must re-emit everything the lost chunk carried.
    let retry = take(source.path(), &index_path, staging.path(), true, true, 200);
    assert_eq!(retry.generation, 1);
    let members = read_members(&std::fs::read(&retry.chunk_path).unwrap());
    assert!(regular_files(&members).iter().any(|m| m.path == "a.txt"));
}

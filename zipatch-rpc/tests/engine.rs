//! Engine end-to-end over the in-process transport, plus protocol-level
//! behavior a caller depends on: unknown opcodes failing softly and stale
//! progress pushes being discarded.

use std::io::Cursor;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use zipatch_index::{DataBlock, PatchIndex, PatchOperation, EXPANSION_BASE_GAME};
use zipatch_rpc::protocol::{read_frame, write_frame, PayloadReader, PayloadWriter, ResultCode};
use zipatch_rpc::{LocalPatchEngine, PatchEngine, ProgressEvent, RemotePatchEngine, WorkerSession};

const PATCH_NAME: &str = "D2025.05.01.0000.0000.patch";

struct Fixture {
    _dir: tempfile::TempDir,
    index_path: PathBuf,
    patch_path: PathBuf,
    game_root: PathBuf,
    expected: Vec<u8>,
}

fn build_fixture() -> Fixture {
    let cancel = CancellationToken::new();
    let bodies: Vec<Vec<u8>> = (0..3u32)
        .map(|n| (0..200u32).map(|i| ((i + n * 77) % 251) as u8).collect())
        .collect();

    let mut patch = vec![0x11u8; 32];
    let mut blocks = Vec::new();
    for body in &bodies {
        blocks.push(DataBlock {
            source_offset: patch.len() as u32,
            decompressed_size: body.len() as u32,
            compressed_size: None,
        });
        patch.extend_from_slice(body);
    }

    let mut index = PatchIndex::new(EXPANSION_BASE_GAME);
    index
        .apply_operations(
            PATCH_NAME,
            &[PatchOperation::AddFileBlocks {
                path: "a.dat".into(),
                file_offset: 0,
                blocks,
            }],
            &cancel,
        )
        .unwrap();
    index.calculate_crc32(&mut [Cursor::new(&patch)], &cancel).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let index_path = dir.path().join("game.index");
    let patch_path = dir.path().join(PATCH_NAME);
    let game_root = dir.path().join("game");
    std::fs::create_dir_all(&game_root).unwrap();
    let mut buf = Vec::new();
    index.save(&mut buf).unwrap();
    std::fs::write(&index_path, buf).unwrap();
    std::fs::write(&patch_path, &patch).unwrap();

    Fixture {
        _dir: dir,
        index_path,
        patch_path,
        game_root,
        expected: bodies.concat(),
    }
}

async fn repair_flow(engine: &dyn PatchEngine, fixture: &Fixture) {
    engine.construct(&fixture.index_path).await.unwrap();
    engine.set_targets_read_only(&fixture.game_root).await.unwrap();
    engine.verify_files(1, false, 2).await.unwrap();

    let missing = engine.missing_part_indices_per_target_file().await.unwrap();
    assert_eq!(missing[0].len(), 3);
    let per_patch = engine.missing_part_indices_per_patch().await.unwrap();
    assert_eq!(per_patch[0].len(), 3);

    engine.set_targets_read_write(&fixture.game_root).await.unwrap();
    engine
        .queue_install_from_local_file(0, &fixture.patch_path, 2)
        .await
        .unwrap();
    engine.install(2, 2).await.unwrap();

    let missing = engine.missing_part_indices_per_target_file().await.unwrap();
    assert!(missing[0].is_empty());
    assert!(engine.size_mismatch_target_file_indices().await.unwrap().is_empty());

    engine.write_version_files(&fixture.game_root).await.unwrap();
    engine.dispose().await.unwrap();
}

#[tokio::test]
async fn test_in_process_engine_repairs_installation() {
    let fixture = build_fixture();
    let engine = RemotePatchEngine::in_process();

    let events: Arc<parking_lot::Mutex<Vec<ProgressEvent>>> = Arc::default();
    let sink = Arc::clone(&events);
    engine.set_progress_handler(move |event| sink.lock().push(event));

    repair_flow(&engine, &fixture).await;

    let on_disk = std::fs::read(fixture.game_root.join("a.dat")).unwrap();
    assert_eq!(on_disk, fixture.expected);
    let ver = std::fs::read_to_string(fixture.game_root.join("ffxivgame.ver")).unwrap();
    assert_eq!(ver, "2025.05.01.0000.0000");

    // The final verify push reports completion
    let events = events.lock();
    assert!(events
        .iter()
        .any(|e| matches!(e, ProgressEvent::Verify { done, total, .. } if done == total && *total > 0)));
}

#[tokio::test]
async fn test_local_engine_matches_remote_behavior() {
    let fixture = build_fixture();
    let engine = LocalPatchEngine::new();
    repair_flow(&engine, &fixture).await;

    let on_disk = std::fs::read(fixture.game_root.join("a.dat")).unwrap();
    assert_eq!(on_disk, fixture.expected);
}

#[tokio::test]
async fn test_mark_file_missing_over_the_wire() {
    let fixture = build_fixture();
    std::fs::write(fixture.game_root.join("a.dat"), &fixture.expected).unwrap();

    let engine = RemotePatchEngine::in_process();
    engine.construct(&fixture.index_path).await.unwrap();
    engine.set_targets_read_only(&fixture.game_root).await.unwrap();
    engine.verify_files(1, false, 2).await.unwrap();
    assert!(engine.missing_part_indices_per_target_file().await.unwrap()[0].is_empty());

    engine.mark_file_missing(0).await.unwrap();
    let missing = engine.missing_part_indices_per_target_file().await.unwrap();
    assert_eq!(missing[0], vec![0, 1, 2]);
    engine.dispose().await.unwrap();
}

#[tokio::test]
async fn test_cancel_of_unknown_token_is_a_no_op() {
    let fixture = build_fixture();
    let engine = RemotePatchEngine::in_process();
    engine.construct(&fixture.index_path).await.unwrap();
    engine.cancel_task(42).await.unwrap();
    engine.dispose().await.unwrap();
}

#[tokio::test]
async fn test_cancel_task_runs_while_call_is_in_flight() {
    let fixture = build_fixture();
    let engine = RemotePatchEngine::in_process();
    engine.construct(&fixture.index_path).await.unwrap();
    engine.set_targets_read_only(&fixture.game_root).await.unwrap();
    engine.set_targets_read_write(&fixture.game_root).await.unwrap();
    engine
        .queue_install_from_local_file(0, &fixture.patch_path, 2)
        .await
        .unwrap();

    // Shared borrows: the cancel goes out while the install future is
    // still pending. Depending on timing the install either finishes
    // first or comes back cancelled; both are clean outcomes.
    let (installed, cancelled) = tokio::join!(engine.install(5, 2), engine.cancel_task(5));
    cancelled.unwrap();
    assert!(matches!(installed, Ok(()) | Err(zipatch_rpc::Error::Cancelled)));
    engine.dispose().await.unwrap();
}

#[tokio::test]
async fn test_unknown_opcode_fails_call_but_not_session() {
    let fixture = build_fixture();
    let (test_io, worker_io) = tokio::io::duplex(64 * 1024);
    let (worker_read, worker_write) = tokio::io::split(worker_io);
    tokio::spawn(async move {
        WorkerSession::run(worker_read, worker_write).await.unwrap();
    });
    let (mut test_read, mut test_write) = tokio::io::split(test_io);

    // Unknown opcode: the call fails
    let mut frame = PayloadWriter::new();
    frame.put_u32(1).put_i32(-1).put_i32(99);
    write_frame(&mut test_write, &frame.into_inner()).await.unwrap();
    let response = read_frame(&mut test_read).await.unwrap().unwrap();
    let mut r = PayloadReader::new(&response);
    assert_eq!(r.get_u32().unwrap(), 1);
    assert_eq!(r.get_i32().unwrap(), ResultCode::Error as i32);

    // The session still serves the next request
    let mut frame = PayloadWriter::new();
    frame
        .put_u32(2)
        .put_i32(-1)
        .put_i32(1)
        .put_str(&fixture.index_path.to_string_lossy());
    write_frame(&mut test_write, &frame.into_inner()).await.unwrap();
    let response = read_frame(&mut test_read).await.unwrap().unwrap();
    let mut r = PayloadReader::new(&response);
    assert_eq!(r.get_u32().unwrap(), 2);
    assert_eq!(r.get_i32().unwrap(), ResultCode::Pass as i32);

    // DisposeAndExit ends the session cleanly
    let mut frame = PayloadWriter::new();
    frame.put_u32(3).put_i32(-1).put_i32(2);
    write_frame(&mut test_write, &frame.into_inner()).await.unwrap();
    let response = read_frame(&mut test_read).await.unwrap().unwrap();
    let mut r = PayloadReader::new(&response);
    assert_eq!(r.get_u32().unwrap(), 3);
    assert_eq!(r.get_i32().unwrap(), ResultCode::Pass as i32);
    test_write.shutdown().await.unwrap();
    assert!(read_frame(&mut test_read).await.unwrap().is_none());
}

#[tokio::test]
async fn test_stale_progress_pushes_are_discarded() {
    let (test_io, engine_io) = tokio::io::duplex(4096);
    let (engine_read, engine_write) = tokio::io::split(engine_io);
    let engine = RemotePatchEngine::new(engine_read, engine_write);

    let events: Arc<parking_lot::Mutex<Vec<ProgressEvent>>> = Arc::default();
    let sink = Arc::clone(&events);
    engine.set_progress_handler(move |event| sink.lock().push(event));

    let (_test_read, mut test_write) = tokio::io::split(test_io);
    for (seq, done) in [(1i64, 10u64), (3, 30), (2, 20)] {
        let mut frame = PayloadWriter::new();
        frame
            .put_u32(0)
            .put_i32(100)
            .put_i64(seq)
            .put_u32(0)
            .put_u64(done)
            .put_u64(100);
        write_frame(&mut test_write, &frame.into_inner()).await.unwrap();
    }

    // Give the reader task a moment to drain the pipe
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    let events = events.lock();
    let done: Vec<u64> = events
        .iter()
        .map(|e| match e {
            ProgressEvent::Verify { done, .. } | ProgressEvent::Install { done, .. } => *done,
        })
        .collect();
    assert_eq!(done, vec![10, 30]);
}

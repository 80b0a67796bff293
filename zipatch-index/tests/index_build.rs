//! End-to-end index construction: replay operations against a synthetic
//! patch file, run the checksum pass, and reconstruct the target bytes.

use std::io::{Cursor, Seek, SeekFrom, Write};

use flate2::write::DeflateEncoder;
use flate2::Compression;
use tokio_util::sync::CancellationToken;

use zipatch_index::{
    DataBlock, PatchIndex, PatchOperation, PartSource, VerifyResult, EXPANSION_BASE_GAME,
};

struct PatchBuilder {
    data: Vec<u8>,
}

impl PatchBuilder {
    fn new() -> Self {
        // Leading junk so offset zero is never a real payload
        Self { data: vec![0xEE; 64] }
    }

    fn add_plain(&mut self, payload: &[u8]) -> DataBlock {
        let source_offset = self.data.len() as u32;
        self.data.extend_from_slice(payload);
        DataBlock {
            source_offset,
            decompressed_size: payload.len() as u32,
            compressed_size: None,
        }
    }

    fn add_deflated(&mut self, payload: &[u8]) -> DataBlock {
        let source_offset = self.data.len() as u32;
        let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(payload).unwrap();
        let compressed = encoder.finish().unwrap();
        self.data.extend_from_slice(&compressed);
        DataBlock {
            source_offset,
            decompressed_size: payload.len() as u32,
            compressed_size: Some(compressed.len() as u32),
        }
    }
}

fn reconstruct_file(index: &PatchIndex, target: usize, patch: &[u8]) -> Vec<u8> {
    let target = &index.targets()[target];
    let mut out = vec![0u8; target.file_size() as usize];
    for part in target.parts() {
        let start = part.target_offset() as usize;
        let end = part.target_end() as usize;
        part.reconstruct_from_reader(&mut Cursor::new(patch), &mut out[start..end], 0, true)
            .unwrap();
    }
    out
}

#[test]
fn test_build_checksum_and_reconstruct() {
    let cancel = CancellationToken::new();
    let mut patch = PatchBuilder::new();

    let body_a: Vec<u8> = (0..600u32).map(|i| (i * 7 % 251) as u8).collect();
    let body_b: Vec<u8> = (0..300u32).map(|i| (i * 13 % 241) as u8).collect();
    let block_a = patch.add_plain(&body_a);
    let block_b = patch.add_deflated(&body_b);

    let mut index = PatchIndex::new(EXPANSION_BASE_GAME);
    index
        .apply_operations(
            "D2025.03.01.0000.0000.patch",
            &[
                PatchOperation::AddFileBlocks {
                    path: "sqpack/ffxiv/0a0000.win32.dat0".into(),
                    file_offset: 0,
                    blocks: vec![block_a, block_b],
                },
                PatchOperation::ExpandData {
                    path: "sqpack/ffxiv/0a0000.win32.dat0".into(),
                    block_offset: 900,
                    block_count: 3,
                },
            ],
            &cancel,
        )
        .unwrap();

    index
        .calculate_crc32(&mut [Cursor::new(&patch.data)], &cancel)
        .unwrap();

    // Every patch-sourced part now carries a checksum
    for target in index.targets() {
        for part in target.parts() {
            if part.is_from_patch() {
                assert!(part.crc32().is_some());
            }
        }
    }

    let out = reconstruct_file(&index, 0, &patch.data);
    assert_eq!(out.len(), 1284);
    assert_eq!(&out[..600], body_a.as_slice());
    assert_eq!(&out[600..900], body_b.as_slice());
    // Placeholder header at 900, zero fill behind it
    assert_eq!(out[900], 128);
    assert_eq!(out[912], 2);
    assert!(out[924..].iter().all(|&b| b == 0));

    // Reconstructed bytes verify against the index
    let target = &index.targets()[0];
    for part in target.parts() {
        let start = part.target_offset() as usize;
        let end = part.target_end() as usize;
        assert_eq!(part.verify_slice(&out[start..end]), VerifyResult::Pass);
    }
}

#[test]
fn test_checksummed_index_survives_round_trip() {
    let cancel = CancellationToken::new();
    let mut patch = PatchBuilder::new();
    let body: Vec<u8> = (0..512u32).map(|i| (i % 256) as u8).collect();
    let block = patch.add_plain(&body);

    let mut index = PatchIndex::new(EXPANSION_BASE_GAME);
    index
        .apply_operations(
            "D2025.03.01.0000.0000.patch",
            &[PatchOperation::AddFileBlocks {
                path: "a.dat".into(),
                file_offset: 0,
                blocks: vec![block],
            }],
            &cancel,
        )
        .unwrap();
    index
        .calculate_crc32(&mut [Cursor::new(&patch.data)], &cancel)
        .unwrap();

    let mut file = tempfile::tempfile().unwrap();
    index.save(&mut file).unwrap();
    file.seek(SeekFrom::Start(0)).unwrap();
    let back = PatchIndex::load(&file).unwrap();

    let part = back.targets()[0].parts()[0];
    assert_eq!(part.crc32(), index.targets()[0].parts()[0].crc32());
    assert_eq!(part.verify_slice(&body), VerifyResult::Pass);
    assert_eq!(part.source(), PartSource::Patch {
        index: 0,
        offset: 64,
        deflated: false,
        split_from: 0,
    });
}

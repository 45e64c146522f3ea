use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::thread;

use libdeflater::{CompressionLvl, Compressor, Decompressor};
use log::{debug, warn};
use thiserror::Error;

mod stream;

pub use stream::{TileStreamHeader, GDEFLATE_ID, MAX_TILES, TILE_SIZE};
use stream::{build_tile_index, parse_stream, tile_span, TILE_STREAM_HEADER_SIZE};

pub const MAX_WORKERS: u32 = 31;
const MIN_TILES_PER_WORKER: u32 = 64;

pub const MIN_COMPRESSION_LEVEL: u32 = 1;
pub const MAX_COMPRESSION_LEVEL: u32 = 12;
pub const DEFAULT_COMPRESSION_LEVEL: u32 = 9;

/// Run compression entirely on the calling thread.
pub const COMPRESS_SINGLE_THREAD: u32 = 0x200;

// Worst-case per-tile expansion of the underlying compressor on an
// incompressible page, on top of the tile itself and its index entry.
const TILE_HEADER_PAD: usize = 4 + 4 * 208 + 4 * 8;

#[derive(Debug, Error)]
pub enum GDeflateError {
    #[error("bad argument: {0}")]
    BadArgument(&'static str),
    #[error("input larger than {} bytes", MAX_TILES * TILE_SIZE)]
    InputTooLarge,
    #[error("output buffer too small: need {needed} bytes, have {available}")]
    OutputTooSmall { needed: usize, available: usize },
    #[error("malformed tile stream: {0}")]
    Malformed(&'static str),
    #[error("unknown codec id {0}")]
    UnknownCodec(u8),
    #[error("unsupported tile size index {0}")]
    UnsupportedTileSize(u8),
    #[error("codec failure on tile {tile}: {source}")]
    CodecFault {
        tile: u32,
        #[source]
        source: TileCodecError,
    },
    #[error("worker thread panicked")]
    WorkerPanicked,
}

#[derive(Debug, Error)]
pub enum TileCodecError {
    #[error("compress: {0}")]
    Compress(#[from] libdeflater::CompressionError),
    #[error("decompress: {0}")]
    Decompress(#[from] libdeflater::DecompressionError),
    #[error("tile decoded to {actual} bytes, expected {expected}")]
    WrongTileSize { actual: usize, expected: usize },
}

struct TileCompressor {
    inner: Compressor,
    scratch: Vec<u8>,
}

impl TileCompressor {
    fn new(level: u32) -> Result<Self, GDeflateError> {
        let lvl = CompressionLvl::new(level as i32)
            .map_err(|_| GDeflateError::BadArgument("compression level out of range"))?;
        let mut inner = Compressor::new(lvl);
        let scratch = vec![0_u8; inner.deflate_compress_bound(TILE_SIZE)];
        Ok(Self { inner, scratch })
    }

    fn compress_tile(&mut self, tile: u32, page: &[u8]) -> Result<Vec<u8>, GDeflateError> {
        let produced = self
            .inner
            .deflate_compress(page, &mut self.scratch)
            .map_err(|err| GDeflateError::CodecFault {
                tile,
                source: err.into(),
            })?;
        Ok(self.scratch[..produced].to_vec())
    }
}

struct TileDecompressor {
    inner: Decompressor,
}

impl TileDecompressor {
    fn new() -> Self {
        Self {
            inner: Decompressor::new(),
        }
    }

    fn decompress_tile(
        &mut self,
        tile: u32,
        page: &[u8],
        out: &mut [u8],
    ) -> Result<(), GDeflateError> {
        let produced = self
            .inner
            .deflate_decompress(page, out)
            .map_err(|err| GDeflateError::CodecFault {
                tile,
                source: err.into(),
            })?;
        if produced != out.len() {
            return Err(GDeflateError::CodecFault {
                tile,
                source: TileCodecError::WrongTileSize {
                    actual: produced,
                    expected: out.len(),
                },
            });
        }
        Ok(())
    }
}

/// Fans tiles out over `extra_workers` spawned threads plus the
/// calling thread. Workers claim tile indices from a shared relaxed
/// counter; each index is handed to `body` exactly once. Returns after
/// every worker has exited, propagating the failure with the smallest
/// tile index when several workers fail.
fn run_tile_workers<S, I, B>(
    num_tiles: u32,
    extra_workers: u32,
    init: I,
    body: B,
) -> Result<(), GDeflateError>
where
    I: Fn() -> Result<S, GDeflateError> + Sync,
    B: Fn(&mut S, u32) -> Result<(), GDeflateError> + Sync,
{
    let next_tile = AtomicU32::new(0);
    let claim_loop = || -> Result<(), GDeflateError> {
        let mut state = init()?;
        loop {
            let tile = next_tile.fetch_add(1, Ordering::Relaxed);
            if tile >= num_tiles {
                return Ok(());
            }
            body(&mut state, tile)?;
        }
    };

    if extra_workers == 0 {
        return claim_loop();
    }

    thread::scope(|scope| {
        let mut handles = Vec::with_capacity(extra_workers as usize);
        for _ in 0..extra_workers {
            handles.push(scope.spawn(&claim_loop));
        }
        let mut outcome = claim_loop();
        for handle in handles {
            let joined = handle
                .join()
                .map_err(|_| GDeflateError::WorkerPanicked)
                .and_then(|res| res);
            outcome = earliest_failure(outcome, joined);
        }
        outcome
    })
}

fn earliest_failure(
    current: Result<(), GDeflateError>,
    incoming: Result<(), GDeflateError>,
) -> Result<(), GDeflateError> {
    match (current, incoming) {
        (Ok(()), incoming) => incoming,
        (current, Ok(())) => current,
        (
            Err(GDeflateError::CodecFault {
                tile: current_tile,
                source: current_source,
            }),
            Err(GDeflateError::CodecFault { tile, source }),
        ) => {
            if tile < current_tile {
                Err(GDeflateError::CodecFault { tile, source })
            } else {
                Err(GDeflateError::CodecFault {
                    tile: current_tile,
                    source: current_source,
                })
            }
        }
        (current @ Err(_), Err(_)) => current,
    }
}

/// Worst-case stream size for `input_size` bytes of input. Callers of
/// [`compress_into`] must size the output buffer against this.
pub fn compress_bound(input_size: usize) -> usize {
    let num_tiles = input_size.div_ceil(TILE_SIZE).clamp(1, MAX_TILES);
    num_tiles * (TILE_SIZE + TILE_HEADER_PAD) + TILE_STREAM_HEADER_SIZE + 8
}

pub fn compress(input: &[u8], level: u32, flags: u32) -> Result<Vec<u8>, GDeflateError> {
    let mut output = vec![0_u8; compress_bound(input.len())];
    let written = compress_into(&mut output, input, level, flags)?;
    output.truncate(written);
    Ok(output)
}

/// Compresses `input` into a tile stream written at the start of
/// `output`, returning the stream's byte length.
pub fn compress_into(
    output: &mut [u8],
    input: &[u8],
    level: u32,
    flags: u32,
) -> Result<usize, GDeflateError> {
    if input.is_empty() {
        return Err(GDeflateError::BadArgument("input must not be empty"));
    }
    if flags & !COMPRESS_SINGLE_THREAD != 0 {
        return Err(GDeflateError::BadArgument("unrecognized flag bits"));
    }
    if !(MIN_COMPRESSION_LEVEL..=MAX_COMPRESSION_LEVEL).contains(&level) {
        return Err(GDeflateError::BadArgument("compression level out of range"));
    }
    if input.len() > MAX_TILES * TILE_SIZE {
        return Err(GDeflateError::InputTooLarge);
    }

    let num_tiles = input.len().div_ceil(TILE_SIZE);
    let slots: Vec<Mutex<Option<Vec<u8>>>> = (0..num_tiles).map(|_| Mutex::new(None)).collect();

    let extra_workers = compression_worker_budget(num_tiles, flags);
    debug!(
        "compressing {} bytes as {num_tiles} tiles at level {level} with {extra_workers} extra workers",
        input.len()
    );

    run_tile_workers(
        num_tiles as u32,
        extra_workers,
        || TileCompressor::new(level),
        |codec, tile| {
            let start = tile as usize * TILE_SIZE;
            let end = usize::min(start + TILE_SIZE, input.len());
            let page = codec.compress_tile(tile, &input[start..end])?;
            let mut slot = slots[tile as usize]
                .lock()
                .map_err(|_| GDeflateError::WorkerPanicked)?;
            *slot = Some(page);
            Ok(())
        },
    )?;

    let mut pages = Vec::with_capacity(num_tiles);
    for slot in &slots {
        let page = slot
            .lock()
            .map_err(|_| GDeflateError::WorkerPanicked)?
            .take()
            .ok_or(GDeflateError::Malformed("missing tile result"))?;
        pages.push(page);
    }

    let page_sizes: Vec<usize> = pages.iter().map(Vec::len).collect();
    let (offsets, payload_size) = build_tile_index(&page_sizes)?;

    let header = TileStreamHeader::for_uncompressed_size(input.len())?;
    debug_assert_eq!(usize::from(header.num_tiles), num_tiles);

    let data_offset = TILE_STREAM_HEADER_SIZE + 4 * num_tiles;
    let total_size = data_offset + payload_size;
    if total_size > output.len() {
        return Err(GDeflateError::OutputTooSmall {
            needed: total_size,
            available: output.len(),
        });
    }

    output[..TILE_STREAM_HEADER_SIZE].copy_from_slice(&header.encode());
    for (i, offset) in offsets.iter().enumerate() {
        let at = TILE_STREAM_HEADER_SIZE + 4 * i;
        output[at..at + 4].copy_from_slice(&offset.to_le_bytes());
    }
    for (i, page) in pages.iter().enumerate() {
        // Slot 0 of the index holds the last tile's size, never an
        // offset; tile 0 always opens the payload region.
        let tile_offset = if i == 0 { 0 } else { offsets[i] as usize };
        let at = data_offset + tile_offset;
        output[at..at + page.len()].copy_from_slice(page);
    }

    Ok(total_size)
}

fn compression_worker_budget(num_tiles: usize, flags: u32) -> u32 {
    if flags & COMPRESS_SINGLE_THREAD != 0 {
        return 0;
    }
    let hardware = thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1) as u32;
    let by_tiles = (num_tiles as u32).div_ceil(MIN_TILES_PER_WORKER);
    hardware.min(MAX_WORKERS).min(by_tiles)
}

/// Total uncompressed size recorded in a tile stream's header, without
/// decompressing. Consumers use this to pre-size destination buffers.
pub fn uncompressed_size(stream: &[u8]) -> Result<usize, GDeflateError> {
    Ok(TileStreamHeader::decode(stream)?.uncompressed_size())
}

pub fn decompress(stream: &[u8], num_workers: u32) -> Result<Vec<u8>, GDeflateError> {
    if stream.is_empty() {
        return Err(GDeflateError::BadArgument("input stream must not be empty"));
    }
    let size = uncompressed_size(stream)?;
    if size == 0 {
        return Err(GDeflateError::Malformed("stream contains no tiles"));
    }
    let mut output = vec![0_u8; size];
    decompress_into(&mut output, stream, num_workers)?;
    Ok(output)
}

/// Decompresses a tile stream into the start of `output`, returning
/// the number of bytes produced. `num_workers` is clamped to
/// `[1, MAX_WORKERS]`.
pub fn decompress_into(
    output: &mut [u8],
    stream: &[u8],
    num_workers: u32,
) -> Result<usize, GDeflateError> {
    if output.is_empty() {
        return Err(GDeflateError::BadArgument("output buffer must not be empty"));
    }
    if stream.is_empty() {
        return Err(GDeflateError::BadArgument("input stream must not be empty"));
    }
    let num_workers = num_workers.clamp(1, MAX_WORKERS);

    let (header, offsets, payload) = parse_stream(stream).inspect_err(|err| {
        warn!("rejecting tile stream: {err}");
    })?;
    let tile_count = usize::from(header.num_tiles);
    if tile_count == 0 {
        return Err(GDeflateError::Malformed("stream contains no tiles"));
    }

    let size = header.uncompressed_size();
    if output.len() < size {
        return Err(GDeflateError::OutputTooSmall {
            needed: size,
            available: output.len(),
        });
    }

    let mut spans = Vec::with_capacity(tile_count);
    for tile in 0..tile_count {
        let (offset, length) = tile_span(&offsets, tile)?;
        let end = offset
            .checked_add(length)
            .ok_or(GDeflateError::Malformed("tile span overflow"))?;
        if end > payload.len() {
            return Err(GDeflateError::Malformed("tile payload truncated"));
        }
        spans.push((offset, length));
    }

    let out_region = &mut output[..size];
    let slots: Vec<Mutex<&mut [u8]>> = out_region.chunks_mut(TILE_SIZE).map(Mutex::new).collect();
    debug_assert_eq!(slots.len(), tile_count);

    let extra_workers = if tile_count > 2 * num_workers as usize {
        num_workers - 1
    } else {
        0
    };
    debug!("decompressing {tile_count} tiles into {size} bytes with {extra_workers} extra workers");

    run_tile_workers(
        tile_count as u32,
        extra_workers,
        || Ok(TileDecompressor::new()),
        |codec, tile| {
            let (offset, length) = spans[tile as usize];
            let page = &payload[offset..offset + length];
            let mut slot = slots[tile as usize]
                .lock()
                .map_err(|_| GDeflateError::WorkerPanicked)?;
            codec.decompress_tile(tile, page, &mut slot)
        },
    )?;

    Ok(size)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_data(size: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(size);
        for i in 0..size {
            let v = ((i as u32)
                .wrapping_mul(1664525)
                .wrapping_add(1013904223)
                .rotate_left(5)
                & 0xff) as u8;
            out.push(v);
        }
        out
    }

    #[test]
    fn empty_input_rejected() {
        let err = compress(&[], DEFAULT_COMPRESSION_LEVEL, 0).expect_err("must fail");
        assert!(matches!(err, GDeflateError::BadArgument(_)));
    }

    #[test]
    fn level_out_of_range_rejected() {
        let input = [0x41];
        for level in [0, 13, 100] {
            let err = compress(&input, level, 0).expect_err("must fail");
            assert!(matches!(err, GDeflateError::BadArgument(_)));
        }
    }

    #[test]
    fn unknown_flag_bits_rejected() {
        let input = [0x41];
        let err = compress(&input, DEFAULT_COMPRESSION_LEVEL, 0x1).expect_err("must fail");
        assert!(matches!(err, GDeflateError::BadArgument(_)));
    }

    #[test]
    fn roundtrip_one_byte() {
        let input = [0x41];
        let stream =
            compress(&input, DEFAULT_COMPRESSION_LEVEL, 0).expect("compress should succeed");
        assert!(compress_bound(1) >= stream.len());
        assert_eq!(&stream[..8], &[0x04, 0xfb, 0x01, 0x00, 0x05, 0x00, 0x00, 0x00]);
        let decoded = decompress(&stream, 1).expect("decompress should succeed");
        assert_eq!(decoded, input);
    }

    #[test]
    fn roundtrip_exact_tile() {
        let input = vec![0_u8; TILE_SIZE];
        let stream =
            compress(&input, DEFAULT_COMPRESSION_LEVEL, 0).expect("compress should succeed");
        assert_eq!(&stream[..8], &[0x04, 0xfb, 0x01, 0x00, 0x01, 0x00, 0x00, 0x00]);
        // One index entry: the compressed size of the only (and last)
        // tile, which is the whole payload.
        let index = u32::from_le_bytes(stream[8..12].try_into().expect("index entry"));
        assert_eq!(index as usize, stream.len() - 12);
        let decoded = decompress(&stream, 4).expect("decompress should succeed");
        assert_eq!(decoded, input);
    }

    #[test]
    fn roundtrip_tile_plus_one() {
        let input = vec![0_u8; TILE_SIZE + 1];
        let stream =
            compress(&input, DEFAULT_COMPRESSION_LEVEL, 0).expect("compress should succeed");
        assert_eq!(&stream[..8], &[0x04, 0xfb, 0x02, 0x00, 0x05, 0x00, 0x00, 0x00]);
        let last_tile_size =
            u32::from_le_bytes(stream[8..12].try_into().expect("index entry")) as usize;
        let tile1_offset =
            u32::from_le_bytes(stream[12..16].try_into().expect("index entry")) as usize;
        assert_eq!(16 + tile1_offset + last_tile_size, stream.len());
        let decoded = decompress(&stream, 4).expect("decompress should succeed");
        assert_eq!(decoded, input);
    }

    #[test]
    fn roundtrip_boundary_sizes() {
        for size in [1, 1000, TILE_SIZE - 1, TILE_SIZE, TILE_SIZE + 1, 4 * TILE_SIZE + 13] {
            let input = sample_data(size);
            let stream =
                compress(&input, DEFAULT_COMPRESSION_LEVEL, 0).expect("compress should succeed");
            assert!(compress_bound(size) >= stream.len());
            let header = TileStreamHeader::decode(&stream).expect("header should decode");
            assert_eq!(usize::from(header.num_tiles), size.div_ceil(TILE_SIZE));
            assert_eq!(header.uncompressed_size(), size);
            let decoded = decompress(&stream, 8).expect("decompress should succeed");
            assert_eq!(decoded, input);
        }
    }

    #[test]
    fn deterministic_across_worker_counts() {
        let input = sample_data(4 * TILE_SIZE);
        for level in [MIN_COMPRESSION_LEVEL, MAX_COMPRESSION_LEVEL] {
            let single = compress(&input, level, COMPRESS_SINGLE_THREAD)
                .expect("single-thread compress should succeed");
            let multi = compress(&input, level, 0).expect("multi-thread compress should succeed");
            assert_eq!(single, multi);
            let decoded = decompress(&single, MAX_WORKERS).expect("decompress should succeed");
            assert_eq!(decoded, input);
        }
    }

    #[test]
    fn compress_into_reports_short_output() {
        let input = sample_data(3 * TILE_SIZE);
        let mut output = vec![0_u8; 64];
        let err = compress_into(&mut output, &input, DEFAULT_COMPRESSION_LEVEL, 0)
            .expect_err("must fail");
        assert!(matches!(err, GDeflateError::OutputTooSmall { .. }));
    }

    #[test]
    fn decompress_into_reports_short_output() {
        let input = sample_data(2 * TILE_SIZE);
        let stream =
            compress(&input, DEFAULT_COMPRESSION_LEVEL, 0).expect("compress should succeed");
        let mut output = vec![0_u8; TILE_SIZE];
        let err = decompress_into(&mut output, &stream, 1).expect_err("must fail");
        assert!(matches!(err, GDeflateError::OutputTooSmall { .. }));
    }

    #[test]
    fn decompress_rejects_bad_magic() {
        let input = sample_data(1024);
        let mut stream =
            compress(&input, DEFAULT_COMPRESSION_LEVEL, 0).expect("compress should succeed");
        stream[1] ^= 1;
        let err = decompress(&stream, 1).expect_err("must fail");
        assert!(matches!(err, GDeflateError::Malformed(_)));
    }

    #[test]
    fn decompress_rejects_unknown_codec() {
        let stream = [0x05, 0xfa, 0x01, 0x00, 0x05, 0x00, 0x00, 0x00, 0x00];
        let err = decompress(&stream, 1).expect_err("must fail");
        assert!(matches!(err, GDeflateError::UnknownCodec(5)));
    }

    #[test]
    fn decompress_rejects_truncated_index() {
        let input = sample_data(3 * TILE_SIZE);
        let stream =
            compress(&input, DEFAULT_COMPRESSION_LEVEL, 0).expect("compress should succeed");
        let err = decompress(&stream[..10], 1).expect_err("must fail");
        assert!(matches!(err, GDeflateError::Malformed(_)));
    }

    #[test]
    fn decompress_rejects_truncated_payload() {
        let input = sample_data(3 * TILE_SIZE);
        let stream =
            compress(&input, DEFAULT_COMPRESSION_LEVEL, 0).expect("compress should succeed");
        let err = decompress(&stream[..stream.len() - 1], 1).expect_err("must fail");
        assert!(matches!(err, GDeflateError::Malformed(_)));
    }

    #[test]
    fn decompress_tolerates_reserved_bits() {
        let input = sample_data(1024);
        let mut stream =
            compress(&input, DEFAULT_COMPRESSION_LEVEL, 0).expect("compress should succeed");
        stream[7] |= 0xf0;
        let decoded = decompress(&stream, 1).expect("decompress should succeed");
        assert_eq!(decoded, input);
    }

    #[test]
    fn corrupt_tile_surfaces_codec_fault() {
        let input = sample_data(3 * TILE_SIZE);
        let mut stream =
            compress(&input, DEFAULT_COMPRESSION_LEVEL, 0).expect("compress should succeed");
        let offsets = (0..3)
            .map(|i| {
                u32::from_le_bytes(stream[8 + 4 * i..12 + 4 * i].try_into().expect("index entry"))
            })
            .collect::<Vec<_>>();
        let data_offset = 8 + 4 * 3;
        // Stomp tile 1's page; 0xff opens a reserved block type.
        let tile1 = data_offset + offsets[1] as usize;
        let tile1_len = (offsets[2] - offsets[1]) as usize;
        for byte in &mut stream[tile1..tile1 + tile1_len] {
            *byte = 0xff;
        }
        let err = decompress(&stream, 4).expect_err("must fail");
        assert!(matches!(err, GDeflateError::CodecFault { tile: 1, .. }));
    }

    #[test]
    fn uncompressed_size_reads_header_only() {
        let input = sample_data(2 * TILE_SIZE + 17);
        let stream =
            compress(&input, DEFAULT_COMPRESSION_LEVEL, 0).expect("compress should succeed");
        assert_eq!(
            uncompressed_size(&stream).expect("size should read"),
            input.len()
        );
        // Only the header is needed.
        assert_eq!(
            uncompressed_size(&stream[..8]).expect("size should read"),
            input.len()
        );
    }

    #[test]
    fn compress_bound_is_monotonic_at_boundaries() {
        assert!(compress_bound(0) >= TILE_STREAM_HEADER_SIZE);
        assert!(compress_bound(1) >= 9);
        for size in [TILE_SIZE - 1, TILE_SIZE, TILE_SIZE + 1] {
            assert!(compress_bound(size) > size);
        }
    }

    #[test]
    fn worker_budget_scales_with_tiles() {
        assert_eq!(compression_worker_budget(1, COMPRESS_SINGLE_THREAD), 0);
        assert!(compression_worker_budget(1, 0) <= 1);
        assert!(compression_worker_budget(64 * 64, 0) <= MAX_WORKERS);
    }
}

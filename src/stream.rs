use crate::GDeflateError;

pub const TILE_SIZE: usize = 64 * 1024;
pub const MAX_TILES: usize = (1 << 16) - 1;
pub const GDEFLATE_ID: u8 = 4;

pub(crate) const TILE_STREAM_HEADER_SIZE: usize = 8;

const TILE_SIZE_IDX_BITS: u32 = 0b11;
const LAST_TILE_SIZE_MASK: u32 = (1 << 18) - 1;
const RESERVED_SHIFT: u32 = 20;

/// The 8-byte header that opens every tile stream. The second 32-bit
/// word is wire-visible bitfields and is packed by hand: bits [0..1]
/// tile size index, bits [2..19] last tile size, bits [20..31]
/// reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileStreamHeader {
    pub id: u8,
    pub magic: u8,
    pub num_tiles: u16,
    pub tile_size_idx: u8,
    pub last_tile_size: u32,
    pub reserved: u16,
}

impl TileStreamHeader {
    pub fn for_uncompressed_size(uncompressed_size: usize) -> Result<Self, GDeflateError> {
        let mut num_tiles = uncompressed_size / TILE_SIZE;
        let last_tile_size = (uncompressed_size - num_tiles * TILE_SIZE) as u32;
        if last_tile_size != 0 {
            num_tiles += 1;
        }
        if num_tiles > MAX_TILES {
            return Err(GDeflateError::InputTooLarge);
        }
        Ok(Self {
            id: GDEFLATE_ID,
            magic: GDEFLATE_ID ^ 0xff,
            num_tiles: num_tiles as u16,
            tile_size_idx: 1,
            last_tile_size,
            reserved: 0,
        })
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, GDeflateError> {
        let Some(raw) = bytes.get(..TILE_STREAM_HEADER_SIZE) else {
            return Err(GDeflateError::Malformed("tile stream header truncated"));
        };
        let id = raw[0];
        let magic = raw[1];
        if id != magic ^ 0xff {
            return Err(GDeflateError::Malformed("header magic check failed"));
        }
        if id != GDEFLATE_ID {
            return Err(GDeflateError::UnknownCodec(id));
        }
        let num_tiles = u16::from_le_bytes([raw[2], raw[3]]);
        let meta = u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]);
        let tile_size_idx = (meta & TILE_SIZE_IDX_BITS) as u8;
        if tile_size_idx != 1 {
            return Err(GDeflateError::UnsupportedTileSize(tile_size_idx));
        }
        let last_tile_size = (meta >> 2) & LAST_TILE_SIZE_MASK;
        if last_tile_size as usize >= TILE_SIZE {
            return Err(GDeflateError::Malformed("last tile size exceeds tile size"));
        }
        // Reserved bits are not validated; the encoder always writes
        // zero.
        let reserved = (meta >> RESERVED_SHIFT) as u16;
        Ok(Self {
            id,
            magic,
            num_tiles,
            tile_size_idx,
            last_tile_size,
            reserved,
        })
    }

    pub fn encode(&self) -> [u8; TILE_STREAM_HEADER_SIZE] {
        let mut out = [0u8; TILE_STREAM_HEADER_SIZE];
        out[0] = self.id;
        out[1] = self.magic;
        out[2..4].copy_from_slice(&self.num_tiles.to_le_bytes());
        let mut meta = u32::from(self.tile_size_idx) & TILE_SIZE_IDX_BITS;
        meta |= (self.last_tile_size & LAST_TILE_SIZE_MASK) << 2;
        meta |= u32::from(self.reserved) << RESERVED_SHIFT;
        out[4..8].copy_from_slice(&meta.to_le_bytes());
        out
    }

    pub fn uncompressed_size(&self) -> usize {
        let tiles = usize::from(self.num_tiles);
        let base = tiles * TILE_SIZE;
        if self.last_tile_size == 0 {
            base
        } else {
            base - (TILE_SIZE - self.last_tile_size as usize)
        }
    }
}

/// Builds the u32 index that follows the header. Entry `i >= 1` is the
/// payload-relative offset of tile `i`; entry 0 holds the compressed
/// size of the last tile (tile 0 always starts at offset zero).
pub(crate) fn build_tile_index(page_sizes: &[usize]) -> Result<(Vec<u32>, usize), GDeflateError> {
    let num_tiles = page_sizes.len();
    if num_tiles == 0 {
        return Ok((Vec::new(), 0));
    }
    let mut offsets = vec![0_u32; num_tiles];
    let mut payload_size = 0_usize;
    for (i, &size) in page_sizes.iter().enumerate() {
        if i > 0 {
            offsets[i] = u32::try_from(payload_size).map_err(|_| GDeflateError::InputTooLarge)?;
        }
        payload_size = payload_size
            .checked_add(size)
            .ok_or(GDeflateError::InputTooLarge)?;
    }
    offsets[0] =
        u32::try_from(page_sizes[num_tiles - 1]).map_err(|_| GDeflateError::InputTooLarge)?;
    Ok((offsets, payload_size))
}

pub(crate) fn tile_span(offsets: &[u32], tile: usize) -> Result<(usize, usize), GDeflateError> {
    let num_tiles = offsets.len();
    let offset = if tile == 0 { 0 } else { offsets[tile] as usize };
    let length = if tile + 1 < num_tiles {
        (offsets[tile + 1] as usize)
            .checked_sub(offset)
            .ok_or(GDeflateError::Malformed("non-monotonic tile offsets"))?
    } else {
        offsets[0] as usize
    };
    Ok((offset, length))
}

pub(crate) fn parse_stream(
    stream: &[u8],
) -> Result<(TileStreamHeader, Vec<u32>, &[u8]), GDeflateError> {
    let header = TileStreamHeader::decode(stream)?;
    let tile_count = usize::from(header.num_tiles);
    let index_end = TILE_STREAM_HEADER_SIZE + 4 * tile_count;
    let index_bytes = stream
        .get(TILE_STREAM_HEADER_SIZE..index_end)
        .ok_or(GDeflateError::Malformed("tile index truncated"))?;
    let mut offsets = Vec::with_capacity(tile_count);
    for entry in index_bytes.chunks_exact(4) {
        let entry = entry
            .try_into()
            .map_err(|_| GDeflateError::Malformed("tile index entry parse failed"))?;
        offsets.push(u32::from_le_bytes(entry));
    }
    let payload = &stream[index_end..];
    Ok((header, offsets, payload))
}

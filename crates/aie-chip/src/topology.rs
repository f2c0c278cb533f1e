//! Array shape, register offset packing, and memory layout math.
//!
//! Every register offset in the array address space packs (column, row,
//! intra-tile address) with two device-generation constants: `col_shift`
//! and `row_shift`. All geometry here is pure math over those constants;
//! nothing touches hardware.

use crate::loc::{TileLoc, TileType};

/// Partition id bit position of the start column.
pub const PART_ID_START_COL_SHIFT: u32 = 0;
/// Partition id bit position of the column count.
pub const PART_ID_NUM_COLS_SHIFT: u32 = 8;

/// Pack a partition id from its start column and width.
pub const fn partition_id(start_col: u32, num_cols: u32) -> u32 {
    (start_col << PART_ID_START_COL_SHIFT) + (num_cols << PART_ID_NUM_COLS_SHIFT)
}

/// Host-visible addresses and sizes of the per-tile memory modules.
///
/// `mem_tile_*` fields are meaningful only on devices whose topology has a
/// memory-tile row band (`ArrayTopology::has_mem_tiles`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryProfile {
    /// Intra-tile offset at which program memory is exposed to the host.
    pub prog_mem_host_offset: u64,
    /// Program memory size per core tile, bytes.
    pub prog_mem_size: u64,
    /// Intra-tile address of core-tile data memory.
    pub data_mem_addr: u64,
    /// Data memory size per core tile, bytes.
    pub data_mem_size: u64,
    /// Intra-tile address of memory-tile memory.
    pub mem_tile_mem_addr: u64,
    /// Memory size per memory tile, bytes.
    pub mem_tile_mem_size: u64,
}

/// Shape of one tile-array partition plus the packing constants needed to
/// translate between flat register offsets and tile coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArrayTopology {
    /// Columns in the partition.
    pub num_cols: u32,
    /// Total rows, shim row included.
    pub num_rows: u32,
    /// Bit position of the row index inside a register offset.
    pub row_shift: u32,
    /// Bit position of the column index inside a register offset.
    pub col_shift: u32,
    /// First memory-tile row (0 when the device has none).
    pub mem_tile_row_start: u32,
    /// Number of memory-tile rows (0 when the device has none).
    pub mem_tile_num_rows: u32,
    /// First core-tile row.
    pub core_row_start: u32,
    /// Number of core-tile rows.
    pub core_num_rows: u32,
    /// Per-tile memory module addresses and sizes.
    pub mems: MemoryProfile,
}

impl ArrayTopology {
    /// AIE-ML generation profile: shim row, one memory-tile row, four core
    /// rows, 32 MiB per-column address span.
    pub const fn aieml(num_cols: u32) -> Self {
        Self {
            num_cols,
            num_rows: 6,
            row_shift: 20,
            col_shift: 25,
            mem_tile_row_start: 1,
            mem_tile_num_rows: 1,
            core_row_start: 2,
            core_num_rows: 4,
            mems: MemoryProfile {
                prog_mem_host_offset: 0x2_0000,
                prog_mem_size: 0x4000,
                data_mem_addr: 0x0,
                data_mem_size: 0x1_0000,
                mem_tile_mem_addr: 0x0,
                mem_tile_mem_size: 0x8_0000,
            },
        }
    }

    /// First-generation profile: no memory tiles, eight core rows above the
    /// shim row.
    pub const fn aie(num_cols: u32) -> Self {
        Self {
            num_cols,
            num_rows: 9,
            row_shift: 18,
            col_shift: 23,
            mem_tile_row_start: 0,
            mem_tile_num_rows: 0,
            core_row_start: 1,
            core_num_rows: 8,
            mems: MemoryProfile {
                prog_mem_host_offset: 0x2_0000,
                prog_mem_size: 0x4000,
                data_mem_addr: 0x0,
                data_mem_size: 0x8000,
                mem_tile_mem_addr: 0x0,
                mem_tile_mem_size: 0x0,
            },
        }
    }

    /// Whether the device topology has a memory-tile row band.
    pub const fn has_mem_tiles(&self) -> bool {
        self.mem_tile_num_rows != 0
    }

    /// Bytes of register address space spanned by one column.
    pub const fn col_span(&self) -> u64 {
        1u64 << self.col_shift
    }

    /// Strip the row/column bits from an offset, leaving the intra-tile
    /// register address.
    pub const fn local_addr(&self, offset: u64) -> u64 {
        offset & !(u64::MAX << self.row_shift)
    }

    /// Row index packed into an offset.
    #[allow(clippy::cast_possible_truncation)]
    pub const fn row_of(&self, offset: u64) -> u32 {
        let mask = ((1u64 << self.col_shift) - 1) & !((1u64 << self.row_shift) - 1);
        ((offset & mask) >> self.row_shift) as u32
    }

    /// Column index packed into an offset.
    #[allow(clippy::cast_possible_truncation)]
    pub const fn col_of(&self, offset: u64) -> u32 {
        (offset >> self.col_shift) as u32
    }

    /// Base register offset of a tile; inverse of [`Self::row_of`] and
    /// [`Self::col_of`].
    pub const fn tile_addr(&self, loc: TileLoc) -> u64 {
        ((loc.col as u64) << self.col_shift) | ((loc.row as u64) << self.row_shift)
    }

    /// Tile class of a location, `None` when the row lies outside the array.
    pub fn tile_type(&self, loc: TileLoc) -> Option<TileType> {
        if loc.col >= self.num_cols || loc.row >= self.num_rows {
            return None;
        }
        if loc.row == 0 {
            return Some(TileType::Shim);
        }
        if self.has_mem_tiles()
            && loc.row >= self.mem_tile_row_start
            && loc.row < self.mem_tile_row_start + self.mem_tile_num_rows
        {
            return Some(TileType::MemTile);
        }
        Some(TileType::Core)
    }

    /// Byte offset of a tile's memory inside the concatenated per-class
    /// mapped region.
    ///
    /// Core rows are counted after subtracting the memory-tile band; memory
    /// tile rows are counted from row 1. The two stride formulas are not
    /// interchangeable and are kept separate deliberately.
    pub fn mem_region_offset(&self, tile_type: TileType, loc: TileLoc, unit_size: u64) -> u64 {
        match tile_type {
            TileType::Core => {
                u64::from(loc.col) * u64::from(self.core_num_rows) * unit_size
                    + u64::from(loc.row - self.mem_tile_num_rows - 1) * unit_size
            }
            TileType::MemTile => {
                u64::from(loc.col) * u64::from(self.mem_tile_num_rows) * unit_size
                    + u64::from(loc.row - 1) * unit_size
            }
            TileType::Shim => 0,
        }
    }

    /// Gating-bitmap bit index of a row>0 tile: one bit per (column, row>0)
    /// slot, column-major.
    pub fn tile_bit_pos(&self, loc: TileLoc) -> u32 {
        debug_assert!(loc.row > 0, "shim row has no gating bit");
        loc.col * (self.num_rows - 1) + (loc.row - 1)
    }

    /// Number of gating-bitmap bits for the whole partition.
    pub const fn gating_bits(&self) -> u32 {
        self.num_cols * (self.num_rows - 1)
    }
}

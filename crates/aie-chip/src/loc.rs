//! Tile coordinates and tile classes.
//!
//! Rows are counted from the shim row upward: row 0 is always the
//! interface/shim row, memory-tile rows (if the device has any) come next,
//! and core compute rows sit on top.

/// A single tile position in the array, 0-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileLoc {
    /// Row index. Row 0 is the shim row.
    pub row: u32,
    /// Column index, relative to the partition start column.
    pub col: u32,
}

impl TileLoc {
    /// Create a tile location.
    pub const fn new(row: u32, col: u32) -> Self {
        Self { row, col }
    }
}

impl std::fmt::Display for TileLoc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({},{})", self.row, self.col)
    }
}

/// Tile class, derived from the row band a tile sits in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileType {
    /// Core compute tile (program + data memory, compute core).
    Core,
    /// Dedicated memory tile.
    MemTile,
    /// Row-0 interface/shim tile bridging the array to the host.
    Shim,
}

/// A contiguous range of columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColRange {
    /// First column of the range.
    pub start: u32,
    /// Number of columns.
    pub num: u32,
}

impl ColRange {
    /// Create a column range.
    pub const fn new(start: u32, num: u32) -> Self {
        Self { start, num }
    }
}

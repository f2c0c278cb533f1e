//! Silicon model for AMD/Xilinx AI Engine tile arrays.
//!
//! This crate has **no dependencies** and **no hardware access** — it is a
//! pure model of the array: tile coordinates, tile classes, the register
//! offset packing shared by every device generation, per-class memory layout
//! strides, and partition-id packing.
//!
//! # Crate organisation
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`loc`] | Tile coordinates and tile classes |
//! | [`topology`] | Array shape, offset packing, memory layout math |

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod loc;
pub mod topology;

pub use loc::{ColRange, TileLoc, TileType};
pub use topology::{partition_id, ArrayTopology, MemoryProfile};

//! Glas Core: paged heap and execution substrate for the glas runtime
//!
//! This crate provides the memory and coordination layer that the client
//! API (`glas-runtime`) is built on:
//!
//! - `mem`: virtual address reservations subdivided into 2 MiB pages
//! - `page`: the page header with mark bitmaps and card tables
//! - `cell`: the uniform 32-byte tagged node for all glas values
//! - `alloc`: bitmap-scan bump allocation into per-context pages
//! - `gc`: the concurrent tricolor collector and its phase machine
//! - `thread`: the collector's view of mutator threads
//! - `rt`: the process-wide runtime singleton
//!
//! Key design principles:
//! - Cells are immutable values; only registers and thunks mutate in place
//! - Pages own memory; cell pointers are non-owning, the collector decides
//!   liveness
//! - Mutators and the collector never mutate the heap at the same time;
//!   the concurrent mark phase is fenced by two stop-the-world handshakes

pub mod alloc;
pub mod cell;
pub mod gc;
pub mod mem;
pub mod page;
pub mod rt;
pub mod thread;

pub use cell::{Cell, CellRef};
pub use rt::{GlasRt, rt};

/// Log2 of the page size (2 MiB pages).
pub const PAGE_SIZE_LG2: u32 = 21;
/// Size of a heap page in bytes.
pub const PAGE_SIZE: usize = 1 << PAGE_SIZE_LG2;
/// Log2 of the card size (512-byte cards).
pub const CARD_SIZE_LG2: u32 = 9;
/// Size of a card in bytes.
pub const CARD_SIZE: usize = 1 << CARD_SIZE_LG2;
/// Size of one heap reservation: 64 pages.
pub const HEAP_MMAP_SIZE: usize = PAGE_SIZE << 6;
/// Size of a cell in bytes.
pub const CELL_SIZE: usize = 32;
/// Number of cell slots in a page, header included.
pub const PAGE_CELL_COUNT: usize = PAGE_SIZE / CELL_SIZE;
/// Number of cards in a page.
pub const PAGE_CARD_COUNT: usize = PAGE_SIZE >> CARD_SIZE_LG2;
/// Oldest generation; pages are promoted at most this far.
pub const GC_MAX_GEN: u32 = 3;

const _: () = assert!(PAGE_CARD_COUNT % 64 == 0, "cards align to 64-bit bitmap words");
const _: () = assert!(PAGE_CELL_COUNT % 64 == 0, "cells align to 64-bit bitmap words");
const _: () = assert!(size_of::<*mut u8>() == 8, "the runtime assumes 64-bit pointers");

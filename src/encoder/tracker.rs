//! Per-tile encoding state.
//!
//! Every tile of the output pyramid carries a [`TileTracker`]: an atomic
//! status that threads advance by compare-and-swap, an atomic subtile
//! bitmask recording which child regions of a derived tile have merged,
//! and a slot holding the tile's pixel canvas while it is in flight.
//!
//! Status transitions are monotonic except through an encoder reset:
//!
//! ```text
//! free -> initializing -> reading -> pending -> encoding -> complete
//! ```
//!
//! Transitions into `pending` and `complete` publish with release
//! ordering so the thread that observes them acquires the canvas or the
//! written bytes.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU16, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// Subtile mask value meaning "all expected child regions merged".
pub const SUBTILES_COMPLETE: u16 = u16::MAX;

/// Lifecycle of one output tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TileStatus {
    Free = 0,
    Initializing = 1,
    Reading = 2,
    Pending = 3,
    Encoding = 4,
    Complete = 5,
}

impl TileStatus {
    fn from_u8(value: u8) -> TileStatus {
        match value {
            0 => TileStatus::Free,
            1 => TileStatus::Initializing,
            2 => TileStatus::Reading,
            3 => TileStatus::Pending,
            4 => TileStatus::Encoding,
            _ => TileStatus::Complete,
        }
    }
}

// =============================================================================
// Canvas
// =============================================================================

/// A tile's pixel storage, shared across merging threads.
///
/// During derivation several threads write the canvas concurrently, each
/// to a disjoint sub-region determined by its child coordinates. The
/// storage sits in an `UnsafeCell` and the write side is an `unsafe fn`
/// whose contract is exactly that disjointness; publication to the
/// consuming thread rides the release/acquire pair on the owning
/// tracker's subtile mask and status.
pub struct TileCanvas {
    data: UnsafeCell<Box<[u8]>>,
}

unsafe impl Send for TileCanvas {}
unsafe impl Sync for TileCanvas {}

impl TileCanvas {
    /// Allocate a canvas filled with `0xFF` (white, the slide background
    /// for partially-populated edge tiles).
    pub fn blank(len: usize) -> TileCanvas {
        TileCanvas {
            data: UnsafeCell::new(vec![0xFFu8; len].into_boxed_slice()),
        }
    }

    /// Wrap pixels read from a source as a canvas.
    pub fn from_pixels(pixels: Vec<u8>) -> TileCanvas {
        TileCanvas {
            data: UnsafeCell::new(pixels.into_boxed_slice()),
        }
    }

    /// Canvas length in bytes.
    pub fn len(&self) -> usize {
        unsafe { (&(*self.data.get())).len() }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy `bytes` into the canvas at `offset`.
    ///
    /// # Safety
    ///
    /// Concurrent callers must write disjoint byte ranges, and no reader
    /// may observe the canvas until all writers have published through an
    /// acquire/release synchronization (the subtile mask).
    pub unsafe fn write_at(&self, offset: usize, bytes: &[u8]) {
        let data = &mut *self.data.get();
        debug_assert!(offset + bytes.len() <= data.len());
        data[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    /// Borrow the canvas contents.
    ///
    /// # Safety
    ///
    /// No concurrent writer may be active; callers reach this only after
    /// acquiring the completed subtile mask or owning the only reference.
    pub unsafe fn as_slice(&self) -> &[u8] {
        &*self.data.get()
    }
}

impl std::fmt::Debug for TileCanvas {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TileCanvas").field("len", &self.len()).finish()
    }
}

// =============================================================================
// Tracker
// =============================================================================

/// Atomic encoding state of one output tile.
#[derive(Debug)]
pub struct TileTracker {
    status: AtomicU8,
    subtile: AtomicU16,
    canvas: Mutex<Option<Arc<TileCanvas>>>,
}

impl Default for TileTracker {
    fn default() -> Self {
        TileTracker {
            status: AtomicU8::new(TileStatus::Free as u8),
            subtile: AtomicU16::new(0),
            canvas: Mutex::new(None),
        }
    }
}

impl TileTracker {
    /// Current status.
    pub fn status(&self) -> TileStatus {
        TileStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Attempt the `from -> to` transition. Returns whether this thread
    /// won the swap.
    pub fn try_transition(&self, from: TileStatus, to: TileStatus) -> bool {
        self.status
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Unconditionally publish a new status.
    pub fn set_status(&self, status: TileStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    /// Spin until the status has advanced past `initializing`. The wait
    /// window is one canvas allocation and memset.
    pub fn wait_initialized(&self) {
        while self.status() == TileStatus::Initializing {
            std::thread::yield_now();
        }
    }

    /// Pre-set the subtile mask, marking never-to-arrive positions.
    pub fn preset_subtile(&self, mask: u16) {
        self.subtile.store(mask, Ordering::Release);
    }

    /// Merge one child's bit into the subtile mask, returning the mask
    /// value after the merge.
    pub fn merge_subtile(&self, bit: u16) -> u16 {
        self.subtile.fetch_or(bit, Ordering::AcqRel) | bit
    }

    /// Current subtile mask.
    pub fn subtile(&self) -> u16 {
        self.subtile.load(Ordering::Acquire)
    }

    /// Install the tile's canvas.
    pub fn set_canvas(&self, canvas: Arc<TileCanvas>) {
        *self.canvas.lock() = Some(canvas);
    }

    /// Clone a handle to the tile's canvas, if installed.
    pub fn canvas(&self) -> Option<Arc<TileCanvas>> {
        self.canvas.lock().clone()
    }

    /// Remove and return the tile's canvas, freeing it after encode.
    pub fn take_canvas(&self) -> Option<Arc<TileCanvas>> {
        self.canvas.lock().take()
    }
}

// =============================================================================
// Tile entry slots
// =============================================================================

/// A tile table entry written concurrently by encoder threads.
///
/// `offset == 0` means "not yet written"; real tile offsets always start
/// past the file header.
#[derive(Debug, Default)]
pub struct EntrySlot {
    offset: AtomicU64,
    size: std::sync::atomic::AtomicU32,
}

impl EntrySlot {
    pub fn store(&self, offset: u64, size: u32) {
        self.size.store(size, Ordering::Release);
        self.offset.store(offset, Ordering::Release);
    }

    pub fn load(&self) -> crate::format::TileEntry {
        crate::format::TileEntry {
            offset: self.offset.load(Ordering::Acquire),
            size: self.size.load(Ordering::Acquire),
        }
    }
}

/// Per-run tile state: one tracker and one entry slot per tile per layer.
#[derive(Debug, Default)]
pub struct RunTracker {
    pub tiles: Vec<Vec<TileTracker>>,
    pub entries: Vec<Vec<EntrySlot>>,
}

impl RunTracker {
    /// Allocate trackers and entry slots matching `extent`.
    pub fn with_extent(extent: &crate::format::Extent) -> RunTracker {
        let tiles = extent
            .layers
            .iter()
            .map(|layer| {
                (0..layer.tile_count())
                    .map(|_| TileTracker::default())
                    .collect()
            })
            .collect();
        let entries = extent
            .layers
            .iter()
            .map(|layer| {
                (0..layer.tile_count())
                    .map(|_| EntrySlot::default())
                    .collect()
            })
            .collect();
        RunTracker { tiles, entries }
    }

    /// Snapshot the entry slots into a plain tile table layout.
    pub fn snapshot_entries(&self) -> Vec<Vec<crate::format::TileEntry>> {
        self.entries
            .iter()
            .map(|layer| layer.iter().map(EntrySlot::load).collect())
            .collect()
    }
}

// =============================================================================
// Tests
// =============================================================================

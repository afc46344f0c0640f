//! The encoder pipeline.
//!
//! `dispatch` transitions the encoder `inactive -> active`, opens the
//! source, creates a temp-file destination, and launches `N + 1`
//! threads: a supervisor plus `N` encode workers. In
//! `use-source` mode every worker walks all layers claiming tiles by
//! CAS; in derivation mode workers claim only the highest-resolution
//! layer and every finished source tile cascades a downsample into its
//! parent, with completed parents draining through the task pool until
//! the pyramid apex.
//!
//! Tile bytes land in the file through an atomic offset reservation
//! (`fetch_add`) followed by a copy under the shared resize lock, so
//! writes never overlap and never race a remap. The tile table, the
//! metadata blocks and finally the file header are written only after
//! every tile validates as complete; the temp file is renamed into
//! place last, so a crashed or interrupted run never leaves a partial
//! `.iris` at the destination.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::codec::CodecContext;
use crate::error::EncodeError;
use crate::format::layout::{
    size_attribute_bytes, size_attribute_sizes, size_icc_profile, size_image_array,
    size_image_block, store_attribute_bytes, store_attribute_sizes, store_icc_profile,
    store_image_array, store_image_block, store_layer_extents, store_tile_entries,
    AssociatedImageRecord, AttributesHeader, FileHeader, MetadataHeader, TileTableHeader,
    ATTRIBUTES_HEADER_SIZE, FILE_HEADER_SIZE, METADATA_HEADER_SIZE, TILE_TABLE_HEADER_SIZE,
};
use crate::format::{Attributes, Encoding, Extent, Format, Subsampling, Version, NULL_OFFSET};
use crate::io::SlideFile;

use super::derive::{derived_extent, downsample_into, parent_coords, preset_subtile_mask, Derivation};
use super::pool::{TaskHandle, TaskPool};
use super::source::{open_source, SourceReader};
use super::tracker::{RunTracker, TileCanvas, TileStatus, SUBTILES_COMPLETE};

/// Attribute-key markers treated as personally identifying when
/// `strip_metadata` is set. Matching is case-insensitive substring.
const IDENTIFYING_KEY_MARKERS: &[&str] = &[
    "patient",
    "physician",
    "operator",
    "institution",
    "accession",
    "study",
    "series",
    "birth",
    "device serial",
];

// =============================================================================
// Status and options
// =============================================================================

/// Lifecycle of an [`Encoder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EncoderStatus {
    Inactive = 0,
    Active = 1,
    Error = 2,
    Shutdown = 3,
}

impl EncoderStatus {
    fn from_u8(value: u8) -> EncoderStatus {
        match value {
            0 => EncoderStatus::Inactive,
            1 => EncoderStatus::Active,
            2 => EncoderStatus::Error,
            _ => EncoderStatus::Shutdown,
        }
    }
}

/// Parameters of one encoding run.
#[derive(Debug, Clone)]
pub struct EncodeOptions {
    /// Path of the source slide file
    pub source: PathBuf,

    /// Output directory; defaults to the source's directory
    pub destination: Option<PathBuf>,

    /// Tile stream encoding of the output
    pub encoding: Encoding,

    /// Pixel format to store tiles in; defaults to the source's format
    pub desired_format: Option<Format>,

    /// Pyramid derivation strategy
    pub derivation: Derivation,

    /// Encoding quality (1-100)
    pub quality: u8,

    /// Chroma subsampling request
    pub subsampling: Subsampling,

    /// Drop identifying attribute keys when copying metadata
    pub strip_metadata: bool,

    /// Number of encode workers; defaults to the hardware concurrency
    pub concurrency: Option<usize>,
}

impl EncodeOptions {
    /// Options with defaults for everything but the source path.
    pub fn new(source: impl Into<PathBuf>) -> EncodeOptions {
        EncodeOptions {
            source: source.into(),
            destination: None,
            encoding: Encoding::Jpeg,
            desired_format: None,
            derivation: Derivation::default(),
            quality: crate::format::DEFAULT_QUALITY,
            subsampling: Subsampling::default(),
            strip_metadata: false,
            concurrency: None,
        }
    }
}

/// Snapshot of an encoder's progress.
#[derive(Debug, Clone)]
pub struct EncoderProgress {
    pub status: EncoderStatus,
    /// Completed fraction in `[0, 1]`
    pub progress: f32,
    /// Path the finished file will carry
    pub dst_path: PathBuf,
    /// Accumulated error text, empty unless the run failed
    pub error_msg: String,
}

// =============================================================================
// Shared state
// =============================================================================

struct Shared {
    context: Arc<CodecContext>,
    options: EncodeOptions,
    status: AtomicU8,
    completed: AtomicU64,
    total: AtomicU64,
    dst_path: Mutex<PathBuf>,
    error: Mutex<String>,
}

impl Shared {
    fn status(&self) -> EncoderStatus {
        EncoderStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    fn set_status(&self, status: EncoderStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    fn try_status(&self, from: EncoderStatus, to: EncoderStatus) -> bool {
        self.status
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn is_active(&self) -> bool {
        self.status() == EncoderStatus::Active
    }

    /// Record a failure: flip to `error` and append the message. Peer
    /// threads observe the status at their next tile boundary and exit.
    fn fail(&self, stage: &str, error: &EncodeError) {
        self.set_status(EncoderStatus::Error);
        let mut message = self.error.lock();
        message.push_str(stage);
        message.push_str(": ");
        message.push_str(&error.to_string());
        message.push('\n');
    }
}

/// State owned by one encoding run, shared across its threads.
struct RunState {
    source: Box<dyn SourceReader>,
    file: Arc<SlideFile>,
    tracker: RunTracker,
    extent: Extent,
    /// Pixel format tiles are stored in
    format: Format,
    /// Pixel format the source hands out
    source_format: Format,
    encoding: Encoding,
    quality: u8,
    subsampling: Subsampling,
    derivation: Derivation,
    strip_metadata: bool,
    /// Next free byte in the output file, starting past the header
    offset: AtomicU64,
}

// =============================================================================
// Encoder
// =============================================================================

/// Multi-threaded slide encoder.
pub struct Encoder {
    shared: Arc<Shared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Encoder {
    /// Create an encoder for the given options.
    pub fn new(options: EncodeOptions) -> Result<Encoder, EncodeError> {
        Self::with_context(options, None)
    }

    /// Create an encoder sharing an existing codec context.
    pub fn with_context(
        options: EncodeOptions,
        context: Option<Arc<CodecContext>>,
    ) -> Result<Encoder, EncodeError> {
        if !options.source.exists() {
            return Err(EncodeError::MissingSource(options.source.clone()));
        }
        Ok(Encoder {
            shared: Arc::new(Shared {
                context: context.unwrap_or_default(),
                options,
                status: AtomicU8::new(EncoderStatus::Inactive as u8),
                completed: AtomicU64::new(0),
                total: AtomicU64::new(0),
                dst_path: Mutex::new(PathBuf::new()),
                error: Mutex::new(String::new()),
            }),
            threads: Mutex::new(Vec::new()),
        })
    }

    /// Current lifecycle status.
    pub fn status(&self) -> EncoderStatus {
        self.shared.status()
    }

    /// The configured source path.
    pub fn src_path(&self) -> PathBuf {
        self.shared.options.source.clone()
    }

    /// The output path of the in-flight or finished run.
    pub fn dst_path(&self) -> PathBuf {
        self.shared.dst_path.lock().clone()
    }

    /// Snapshot the run's progress.
    pub fn progress(&self) -> EncoderProgress {
        let completed = self.shared.completed.load(Ordering::Acquire);
        let total = self.shared.total.load(Ordering::Acquire);
        EncoderProgress {
            status: self.shared.status(),
            progress: if total == 0 {
                0.0
            } else {
                completed as f32 / total as f32
            },
            dst_path: self.dst_path(),
            error_msg: self.shared.error.lock().clone(),
        }
    }

    /// Begin encoding, probing the source path for a reader.
    ///
    /// Returns immediately once the worker threads are launched; poll
    /// [`Encoder::progress`] or [`Encoder::wait`] for completion.
    pub fn dispatch(&self) -> Result<(), EncodeError> {
        self.claim_active()?;
        let source = match open_source(&self.shared.options.source, Arc::clone(&self.shared.context))
        {
            Ok(source) => source,
            Err(error) => {
                self.shared.set_status(EncoderStatus::Inactive);
                return Err(error);
            }
        };
        self.launch(source)
    }

    /// Begin encoding from an externally constructed source reader.
    ///
    /// This is the seam for vendor-format decoders living outside this
    /// crate.
    pub fn dispatch_with_source(&self, source: Box<dyn SourceReader>) -> Result<(), EncodeError> {
        self.claim_active()?;
        self.launch(source)
    }

    fn claim_active(&self) -> Result<(), EncodeError> {
        if self.shared.try_status(EncoderStatus::Inactive, EncoderStatus::Active) {
            return Ok(());
        }
        Err(match self.shared.status() {
            EncoderStatus::Active => EncodeError::InvalidState {
                state: "active",
                message: "an encoder instance must complete before reuse",
            },
            EncoderStatus::Error => EncodeError::InvalidState {
                state: "error",
                message: "the previous run failed; reset the encoder first",
            },
            _ => EncodeError::InvalidState {
                state: "shutdown",
                message: "the encoder is shutting down",
            },
        })
    }

    fn launch(&self, source: Box<dyn SourceReader>) -> Result<(), EncodeError> {
        match self.prepare(source) {
            Ok((run, dst_file)) => {
                let shared = Arc::clone(&self.shared);
                let supervisor = std::thread::Builder::new()
                    .name("iris-encode-supervisor".to_string())
                    .spawn(move || supervise(shared, run, dst_file))
                    .map_err(|e| EncodeError::File(e.into()))?;
                self.threads.lock().push(supervisor);
                Ok(())
            }
            Err(error) => {
                self.shared.set_status(EncoderStatus::Inactive);
                Err(error)
            }
        }
    }

    fn prepare(&self, source: Box<dyn SourceReader>) -> Result<(Arc<RunState>, PathBuf), EncodeError> {
        let options = &self.shared.options;
        match options.encoding {
            Encoding::Jpeg | Encoding::Avif => {}
            Encoding::Iris => {
                return Err(EncodeError::Codec(
                    crate::error::CodecError::UnsupportedEncoding("IRIS"),
                ))
            }
        }

        // Output file: {outdir}/{source stem}.iris
        let stem = options
            .source
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| "slide".to_string());
        let outdir = match &options.destination {
            Some(dir) => dir.clone(),
            None => options
                .source
                .parent()
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".")),
        };
        if !outdir.is_dir() {
            return Err(EncodeError::InvalidDestination(outdir));
        }
        let dst_file = outdir.join(format!("{stem}.iris"));
        if dst_file.exists() {
            warn!(path = %dst_file.display(), "destination exists and will be overwritten");
        }

        let extent = match options.derivation {
            Derivation::UseSource => source.extent().clone(),
            strategy => derived_extent(strategy, source.extent())?,
        };

        // The destination stays a temp file until the run succeeds;
        // keeping the OS link allows the final rename, and creating it
        // beside the output keeps that rename on one file system.
        let file = Arc::new(SlideFile::create_cache_in(&outdir, false)?);

        self.shared
            .total
            .store(extent.total_tiles(), Ordering::Release);
        self.shared.completed.store(0, Ordering::Release);
        *self.shared.dst_path.lock() = dst_file.clone();

        let source_format = source.format();
        let format = options.desired_format.unwrap_or(source_format);
        let run = Arc::new(RunState {
            source,
            file,
            tracker: RunTracker::with_extent(&extent),
            extent,
            format,
            source_format,
            encoding: options.encoding,
            quality: options.quality,
            subsampling: options.subsampling,
            derivation: options.derivation,
            strip_metadata: options.strip_metadata,
            offset: AtomicU64::new(FILE_HEADER_SIZE),
        });
        info!(
            source = %options.source.display(),
            dst = %dst_file.display(),
            layers = run.extent.layers.len(),
            tiles = run.extent.total_tiles(),
            "dispatching encoder"
        );
        Ok((run, dst_file))
    }

    /// Interrupt an active run. Worker threads observe the status at
    /// their next step and exit without rollback; the temp file is
    /// abandoned.
    pub fn interrupt(&self) -> Result<(), EncodeError> {
        match self.shared.status() {
            EncoderStatus::Active => {
                self.shared
                    .fail("Encoder manually interrupted", &EncodeError::Interrupted);
                Ok(())
            }
            EncoderStatus::Error => Err(EncodeError::InvalidState {
                state: "error",
                message: "encoder already holds the error status",
            }),
            EncoderStatus::Inactive | EncoderStatus::Shutdown => Ok(()),
        }
    }

    /// Block until the current run's threads have finished.
    pub fn wait(&self) {
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.threads.lock());
        for handle in handles {
            let _ = handle.join();
        }
    }

    /// Return an `error` or `active` encoder to `inactive`, joining any
    /// remaining threads and clearing the run state.
    pub fn reset(&self) -> Result<(), EncodeError> {
        match self.shared.status() {
            EncoderStatus::Shutdown => {
                return Err(EncodeError::InvalidState {
                    state: "shutdown",
                    message: "cannot reset an encoder in shutdown",
                })
            }
            EncoderStatus::Active => {
                self.shared.set_status(EncoderStatus::Error);
            }
            EncoderStatus::Inactive | EncoderStatus::Error => {}
        }
        self.wait();
        self.shared.error.lock().clear();
        self.shared.completed.store(0, Ordering::Release);
        self.shared.total.store(0, Ordering::Release);
        self.shared.dst_path.lock().clear();
        self.shared.set_status(EncoderStatus::Inactive);
        Ok(())
    }
}

impl Drop for Encoder {
    fn drop(&mut self) {
        if self.shared.is_active() {
            self.shared.set_status(EncoderStatus::Shutdown);
        }
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.threads.lock());
        for handle in handles {
            let _ = handle.join();
        }
    }
}

// =============================================================================
// Supervisor
// =============================================================================

fn supervise(shared: Arc<Shared>, run: Arc<RunState>, dst_file: PathBuf) {
    let workers = shared
        .options
        .concurrency
        .unwrap_or_else(num_cpus::get)
        .max(1);

    // The task pool backs only the derivation cascade; the primary
    // encode threads are dedicated.
    let mut pool = TaskPool::new(workers);

    let mut encoders = Vec::with_capacity(workers);
    for index in 0..workers {
        let thread_shared = Arc::clone(&shared);
        let run = Arc::clone(&run);
        let handle = pool.handle();
        let thread = std::thread::Builder::new()
            .name(format!("iris-encode-{index}"))
            .spawn(move || match run.derivation {
                Derivation::UseSource => encode_source_pyramid(&thread_shared, &run),
                Derivation::Derive2x | Derivation::Derive4x => {
                    encode_derive_pyramid(&thread_shared, &run, &handle)
                }
            });
        match thread {
            Ok(thread) => encoders.push(thread),
            Err(error) => {
                shared.fail("Thread spawn failed", &EncodeError::File(error.into()));
                break;
            }
        }
    }
    for thread in encoders {
        let _ = thread.join();
    }
    // Drain the pending derivation cascade before judging the run.
    pool.wait_until_complete();
    pool.terminate_execution();

    if !shared.is_active() {
        let _ = run.file.delete();
        debug!("encoder run abandoned; temp file deleted");
        return;
    }

    if let Err(error) = finalize(&run, &dst_file) {
        shared.fail("Finalizing slide file failed", &error);
        let _ = run.file.delete();
        return;
    }

    if !shared.try_status(EncoderStatus::Active, EncoderStatus::Inactive) {
        warn!(status = ?shared.status(), "encoder exited with unexpected status");
    }
    info!(dst = %dst_file.display(), "encoding complete");
}

// =============================================================================
// Tile encoding
// =============================================================================

/// Read a source tile, converting into the output pixel format when the
/// run stores a different layout than the source produces.
fn read_source_tile(run: &RunState, layer: u32, tile: u32) -> Result<Vec<u8>, EncodeError> {
    let pixels = run.source.read_tile(layer, tile)?;
    if run.format == run.source_format {
        Ok(pixels)
    } else {
        Ok(crate::codec::convert_pixels(
            &pixels,
            run.source_format,
            run.format,
        ))
    }
}

/// Reserve space for and write one compressed tile, recording its entry.
fn write_tile(run: &RunState, layer: usize, tile: usize, bytes: &[u8]) -> Result<(), EncodeError> {
    let size = bytes.len() as u32;
    let offset = run.offset.fetch_add(size as u64, Ordering::AcqRel);
    run.file.write_reserved(offset, bytes)?;
    run.tracker.entries[layer][tile].store(offset, size);
    Ok(())
}

/// `use-source` mode: walk every layer and tile, claiming work by CAS.
fn encode_source_pyramid(shared: &Shared, run: &RunState) {
    let result = (|| -> Result<(), EncodeError> {
        for layer in 0..run.extent.layers.len() {
            let trackers = &run.tracker.tiles[layer];
            for tile in 0..trackers.len() {
                if !shared.is_active() {
                    return Ok(());
                }
                let tracker = &trackers[tile];
                if !tracker.try_transition(TileStatus::Free, TileStatus::Reading) {
                    continue;
                }
                let pixels = read_source_tile(run, layer as u32, tile as u32)?;
                let bytes = shared.context.compress_tile(
                    &pixels,
                    run.format,
                    run.encoding,
                    run.quality,
                    run.subsampling,
                )?;
                tracker.set_status(TileStatus::Encoding);
                write_tile(run, layer, tile, &bytes)?;
                tracker.set_status(TileStatus::Complete);
                shared.completed.fetch_add(1, Ordering::AcqRel);
            }
        }
        Ok(())
    })();
    if let Err(error) = result {
        shared.fail("Slide tile encoding failed", &error);
    }
}

/// Derivation mode: read the highest-resolution layer and seed the
/// cascade; lower layers fill in through the task pool.
fn encode_derive_pyramid(shared: &Arc<Shared>, run: &Arc<RunState>, handle: &TaskHandle) {
    let result = (|| -> Result<(), EncodeError> {
        let top = run.extent.layers.len() - 1;
        let source_top = (run.source.extent().layers.len() - 1) as u32;
        let layer_extent = run.extent.layers[top];

        for y in 0..layer_extent.y_tiles {
            for x in 0..layer_extent.x_tiles {
                if !shared.is_active() {
                    return Ok(());
                }
                let tile = (y * layer_extent.x_tiles + x) as usize;
                let tracker = &run.tracker.tiles[top][tile];
                if !tracker.try_transition(TileStatus::Free, TileStatus::Reading) {
                    continue;
                }
                let pixels = read_source_tile(run, source_top, tile as u32)?;
                tracker.set_canvas(Arc::new(TileCanvas::from_pixels(pixels)));
                tracker.set_status(TileStatus::Pending);
                issue_derived_tile(shared, run, handle, top, y, x);
            }
        }
        Ok(())
    })();
    if let Err(error) = result {
        shared.fail("Slide tile encoding failed", &error);
    }
}

/// Enqueue the compress-and-write of a pending tile on the task pool.
fn issue_derived_tile(
    shared: &Arc<Shared>,
    run: &Arc<RunState>,
    handle: &TaskHandle,
    layer: usize,
    y: u32,
    x: u32,
) {
    let shared = Arc::clone(shared);
    let run = Arc::clone(run);
    let next_handle = handle.clone();
    handle.issue_task(move || encode_derived_tile(&shared, &run, &next_handle, layer, y, x));
}

/// Compress and write one pending tile; if it is not the apex, first
/// merge its downsample into the parent, possibly propagating upward.
fn encode_derived_tile(
    shared: &Arc<Shared>,
    run: &Arc<RunState>,
    handle: &TaskHandle,
    layer: usize,
    y: u32,
    x: u32,
) {
    if !shared.is_active() {
        return;
    }
    let tile = (y * run.extent.layers[layer].x_tiles + x) as usize;
    let tracker = &run.tracker.tiles[layer][tile];
    if !tracker.try_transition(TileStatus::Pending, TileStatus::Encoding) {
        return;
    }

    let result = (|| -> Result<(), EncodeError> {
        let canvas = tracker.take_canvas().ok_or(EncodeError::IncompleteTile {
            layer: layer as u32,
            tile: tile as u32,
            message: "tile reached encoding without a pixel canvas",
        })?;

        if layer > 0 {
            merge_into_parent(shared, run, handle, layer, y, x, &canvas)?;
        }

        // This thread holds the only live reference to the canvas and
        // all merges into it completed before the pending transition.
        let pixels = unsafe { canvas.as_slice() };
        let bytes = shared.context.compress_tile(
            pixels,
            run.format,
            run.encoding,
            run.quality,
            run.subsampling,
        )?;
        write_tile(run, layer, tile, &bytes)?;
        tracker.set_status(TileStatus::Complete);
        shared.completed.fetch_add(1, Ordering::AcqRel);
        Ok(())
    })();
    if let Err(error) = result {
        shared.fail("Derived tile encoding failed", &error);
    }
}

/// Downsample a child tile into its parent canvas, allocating the parent
/// lazily and enqueueing it once its last subtile arrives.
fn merge_into_parent(
    shared: &Arc<Shared>,
    run: &Arc<RunState>,
    handle: &TaskHandle,
    layer: usize,
    y: u32,
    x: u32,
    child: &TileCanvas,
) -> Result<(), EncodeError> {
    let parent_layer = layer - 1;
    let (parent_y, parent_x) = parent_coords(run.derivation, y, x);
    let parent_tile = (parent_y * run.extent.layers[parent_layer].x_tiles + parent_x) as usize;
    let parent = &run.tracker.tiles[parent_layer][parent_tile];

    // Lazy canvas instantiation: only the first-arriving child
    // allocates; later arrivals wait out the allocation window, then
    // merge concurrently into disjoint regions.
    loop {
        if parent.try_transition(TileStatus::Free, TileStatus::Initializing) {
            parent.set_canvas(Arc::new(TileCanvas::blank(run.format.tile_bytes())));
            parent.preset_subtile(preset_subtile_mask(
                run.derivation,
                &run.extent.layers[layer],
                y,
                x,
            ));
            parent.set_status(TileStatus::Reading);
            break;
        }
        match parent.status() {
            TileStatus::Initializing => parent.wait_initialized(),
            TileStatus::Free => continue,
            _ => break,
        }
    }

    let parent_canvas = parent.canvas().ok_or(EncodeError::IncompleteTile {
        layer: parent_layer as u32,
        tile: parent_tile as u32,
        message: "parent tile lost its canvas during derivation",
    })?;

    let child_pixels = unsafe { child.as_slice() };
    let bit = downsample_into(
        child_pixels,
        &parent_canvas,
        run.derivation,
        y,
        x,
        run.format.channels(),
    );

    if parent.merge_subtile(bit) == SUBTILES_COMPLETE {
        if !parent.try_transition(TileStatus::Reading, TileStatus::Pending) {
            return Err(EncodeError::IncompleteTile {
                layer: parent_layer as u32,
                tile: parent_tile as u32,
                message: "parent tile status desynchronized at completion",
            });
        }
        issue_derived_tile(shared, run, handle, parent_layer, parent_y, parent_x);
    }
    Ok(())
}

// =============================================================================
// Finalization
// =============================================================================

/// Check every tile reached `complete` with a written table entry.
fn validate_tile_writes(run: &RunState) -> Result<(), EncodeError> {
    for (layer, trackers) in run.tracker.tiles.iter().enumerate() {
        for (tile, tracker) in trackers.iter().enumerate() {
            if tracker.status() != TileStatus::Complete {
                return Err(EncodeError::IncompleteTile {
                    layer: layer as u32,
                    tile: tile as u32,
                    message: "tile never reached the complete status",
                });
            }
            let entry = run.tracker.entries[layer][tile].load();
            if entry.offset == NULL_OFFSET || entry.size == 0 {
                return Err(EncodeError::IncompleteTile {
                    layer: layer as u32,
                    tile: tile as u32,
                    message: "tile table entry was never written",
                });
            }
        }
    }
    Ok(())
}

/// Reserve space for a block and copy it into the file.
fn store_block(run: &RunState, bytes: &[u8]) -> Result<u64, EncodeError> {
    let offset = run.offset.fetch_add(bytes.len() as u64, Ordering::AcqRel);
    run.file.write_reserved(offset, bytes)?;
    Ok(offset)
}

/// Write the tile table, the metadata blocks and the file header, then
/// trim, flush and rename the temp file into place.
fn finalize(run: &RunState, dst_file: &std::path::Path) -> Result<(), EncodeError> {
    validate_tile_writes(run)?;

    // Tile table: entries, extents, then the header referencing both.
    let entries = run.tracker.snapshot_entries();
    let tiles_offset = store_block(run, &store_tile_entries(&entries))?;
    let extents_offset = store_block(run, &store_layer_extents(&run.extent.layers))?;

    let table_offset = run
        .offset
        .fetch_add(TILE_TABLE_HEADER_SIZE, Ordering::AcqRel);
    let table_header = TileTableHeader {
        self_offset: table_offset,
        encoding: run.encoding,
        format: run.format,
        tiles_offset,
        layer_extents_offset: extents_offset,
        layers: run.extent.layers.len() as u32,
        width: run.extent.width,
        height: run.extent.height,
        tile_count: run.extent.total_tiles(),
    };
    run.file.write_reserved(table_offset, &table_header.store())?;

    // Metadata: header space is reserved up front, subblocks follow.
    let mut metadata = run.source.metadata()?;
    if run.strip_metadata {
        strip_identifying_attributes(&mut metadata.attributes);
    }

    let metadata_offset = run.offset.fetch_add(METADATA_HEADER_SIZE, Ordering::AcqRel);

    let icc_offset = if metadata.icc_profile.is_empty() {
        NULL_OFFSET
    } else {
        let offset = run
            .offset
            .fetch_add(size_icc_profile(&metadata.icc_profile), Ordering::AcqRel);
        run.file
            .write_reserved(offset, &store_icc_profile(offset, &metadata.icc_profile))?;
        offset
    };

    let mut records: Vec<AssociatedImageRecord> = Vec::new();
    for label in &metadata.associated_images {
        match run.source.associated_image(label) {
            Ok((info, bytes)) => {
                let block_offset = run
                    .offset
                    .fetch_add(size_image_block(bytes.len() as u64), Ordering::AcqRel);
                run.file
                    .write_reserved(block_offset, &store_image_block(block_offset, &bytes))?;
                records.push(AssociatedImageRecord {
                    block_offset,
                    data_size: bytes.len() as u64,
                    info,
                });
            }
            Err(error) => {
                warn!(label = %label, %error, "failed to store associated image");
                continue;
            }
        }
    }
    let images_offset = if records.is_empty() {
        NULL_OFFSET
    } else {
        let offset = run
            .offset
            .fetch_add(size_image_array(&records), Ordering::AcqRel);
        run.file
            .write_reserved(offset, &store_image_array(offset, &records))?;
        offset
    };

    let attributes_offset = if metadata.attributes.is_empty() {
        NULL_OFFSET
    } else {
        let sizes_offset = run
            .offset
            .fetch_add(size_attribute_sizes(&metadata.attributes), Ordering::AcqRel);
        run.file
            .write_reserved(sizes_offset, &store_attribute_sizes(&metadata.attributes))?;
        let bytes_offset = run
            .offset
            .fetch_add(size_attribute_bytes(&metadata.attributes), Ordering::AcqRel);
        run.file
            .write_reserved(bytes_offset, &store_attribute_bytes(&metadata.attributes))?;
        let header_offset = run.offset.fetch_add(ATTRIBUTES_HEADER_SIZE, Ordering::AcqRel);
        let header = AttributesHeader {
            self_offset: header_offset,
            kind: metadata.attributes.kind,
            version: metadata.attributes.version,
            count: metadata.attributes.len() as u32,
            sizes_offset,
            bytes_offset,
        };
        run.file.write_reserved(header_offset, &header.store())?;
        header_offset
    };

    let metadata_header = MetadataHeader {
        self_offset: metadata_offset,
        codec_version: Version::codec(),
        attributes_offset,
        images_offset,
        icc_offset,
        // Annotations are stored opaquely by other tooling; this encoder
        // writes the placeholder.
        annotations_offset: NULL_OFFSET,
        microns_per_pixel: metadata.microns_per_pixel,
        magnification: metadata.magnification,
    };
    run.file
        .write_reserved(metadata_offset, &metadata_header.store())?;

    // File header last: a half-written file never looks valid. Then trim
    // the over-provisioned tail to the exact size.
    let file_size = run.offset.load(Ordering::Acquire);
    let file_header = FileHeader {
        file_size,
        revision: 0,
        tile_table_offset: table_offset,
        metadata_offset,
    };
    run.file.write_reserved(0, &file_header.store())?;
    run.file.resize(file_size, false)?;
    run.file.flush()?;
    run.file.rename(dst_file)?;
    Ok(())
}

/// Drop attributes whose keys look personally identifying.
fn strip_identifying_attributes(attributes: &mut Attributes) {
    attributes.entries.retain(|key, _| {
        let key = key.to_ascii_lowercase();
        !IDENTIFYING_KEY_MARKERS
            .iter()
            .any(|marker| key.contains(marker))
    });
}

// =============================================================================
// Tests
// =============================================================================

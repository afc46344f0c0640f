//! End-to-end encode / decode tests.

use std::time::{Duration, Instant};

use tempfile::TempDir;

use iris_codec::format::layout::{FileHeader, TileTableHeader};
use iris_codec::{
    AttributeType, Derivation, EncodeOptions, Encoder, EncoderStatus, Format, Metadata,
    RasterSource, Slide, SlideError,
};

use super::test_utils::{
    checkerboard_rgba, encode_to_completion, gradient_rgba, psnr, reference_tile_rgba,
    stub_source_path, SlowSource,
};

fn options_for(dir: &TempDir, stem: &str) -> EncodeOptions {
    let mut options = EncodeOptions::new(stub_source_path(dir.path(), stem));
    options.destination = Some(dir.path().to_path_buf());
    options
}

// =============================================================================
// use-source encoding
// =============================================================================

#[test]
fn test_encode_use_source_roundtrip() {
    let dir = TempDir::new().unwrap();
    let (width, height) = (512u32, 512u32);
    let pixels = gradient_rgba(width, height);

    let mut options = options_for(&dir, "gradient");
    options.quality = 90;
    let output = encode_to_completion(
        options,
        Box::new(RasterSource::from_rgba(pixels.clone(), width, height)),
    );
    assert_eq!(output.file_name().unwrap(), "gradient.iris");

    // The finished file passes full structural validation.
    Slide::validate(&output).unwrap();

    let slide = Slide::open(&output, None).unwrap();
    let info = slide.info();
    assert_eq!(info.extent.width, 512);
    assert_eq!(info.extent.layers.len(), 1);
    assert_eq!(info.extent.layers[0].x_tiles, 2);
    assert_eq!(info.extent.layers[0].y_tiles, 2);

    // Every tile decodes back close to its source region.
    for tile in 0..4u32 {
        let decoded = slide.read_tile(0, tile, Format::R8G8B8A8, None).unwrap();
        assert_eq!(decoded.size(), 256 * 256 * 4);
        let reference = reference_tile_rgba(&pixels, width, height, 2, tile);
        assert!(
            psnr(&reference, decoded.data()) >= 36.0,
            "tile {tile} fell below the fidelity floor"
        );
    }
}

#[test]
fn test_desired_format_overrides_source() {
    let dir = TempDir::new().unwrap();
    let pixels = gradient_rgba(256, 256);

    let mut options = options_for(&dir, "formatted");
    options.desired_format = Some(Format::R8G8B8);
    let output = encode_to_completion(
        options,
        Box::new(RasterSource::from_rgba(pixels.clone(), 256, 256)),
    );

    let slide = Slide::open(&output, None).unwrap();
    assert_eq!(slide.format(), Format::R8G8B8);

    // Reading back as RGBA still matches the original up to compression.
    let decoded = slide.read_tile(0, 0, Format::R8G8B8A8, None).unwrap();
    assert!(psnr(&pixels, decoded.data()) >= 36.0);
}

#[test]
fn test_read_tile_out_of_bounds() {
    let dir = TempDir::new().unwrap();
    let output = encode_to_completion(
        options_for(&dir, "bounds"),
        Box::new(RasterSource::from_rgba(gradient_rgba(256, 256), 256, 256)),
    );

    let slide = Slide::open(&output, None).unwrap();
    let result = slide.read_tile(0, 1_000_000, Format::R8G8B8A8, None);
    assert!(matches!(result, Err(SlideError::TileOutOfBounds { .. })));
    let result = slide.read_tile(9, 0, Format::R8G8B8A8, None);
    assert!(matches!(result, Err(SlideError::LayerOutOfBounds { .. })));
}

#[test]
fn test_edge_tiles_padded_to_background() {
    let dir = TempDir::new().unwrap();
    // 300x200: one full tile plus a partial column
    let pixels = vec![0u8; (300 * 200 * 4) as usize];
    let output = encode_to_completion(
        options_for(&dir, "edges"),
        Box::new(RasterSource::from_rgba(pixels, 300, 200)),
    );

    let slide = Slide::open(&output, None).unwrap();
    assert_eq!(slide.extent().layers[0].x_tiles, 2);
    assert_eq!(slide.extent().layers[0].y_tiles, 1);

    let tile = slide.read_tile(0, 1, Format::R8G8B8A8, None).unwrap();
    let data = tile.data();
    // Pixels beyond the 300-pixel image edge are background white
    // (lossy-encoded, so allow a narrow band).
    let outside = (10 * 256 + 200) * 4;
    assert!(data[outside] > 240, "padding not white: {}", data[outside]);
    // In-image pixels stay dark
    let inside = (10 * 256 + 4) * 4;
    assert!(data[inside] < 32, "image area not black: {}", data[inside]);
}

// =============================================================================
// Derived pyramids
// =============================================================================

#[test]
fn test_encode_derive_2x_layer_geometry() {
    let dir = TempDir::new().unwrap();
    let (width, height) = (1024u32, 1024u32);
    let pixels = checkerboard_rgba(width, height, 64);

    let mut options = options_for(&dir, "checker");
    options.derivation = Derivation::Derive2x;
    options.quality = 95;
    let output = encode_to_completion(
        options,
        Box::new(RasterSource::from_rgba(pixels.clone(), width, height)),
    );

    Slide::validate(&output).unwrap();
    let slide = Slide::open(&output, None).unwrap();

    // Three layers: 4x4 at full resolution down to a single tile.
    let counts: Vec<(u32, u32)> = slide
        .extent()
        .layers
        .iter()
        .map(|layer| (layer.x_tiles, layer.y_tiles))
        .collect();
    assert_eq!(counts, vec![(1, 1), (2, 2), (4, 4)]);

    // The full-resolution layer visually matches the input.
    let decoded = slide.read_tile(2, 0, Format::R8G8B8A8, None).unwrap();
    let reference = reference_tile_rgba(&pixels, width, height, 4, 0);
    assert!(psnr(&reference, decoded.data()) >= 36.0);

    // Derived layers decode to full tiles as well.
    for (layer, tiles) in [(0u32, 1u32), (1, 4)] {
        for tile in 0..tiles {
            let decoded = slide.read_tile(layer, tile, Format::R8G8B8A8, None).unwrap();
            assert_eq!(decoded.size(), 256 * 256 * 4);
        }
    }
}

#[test]
fn test_derive_2x_downsample_content() {
    let dir = TempDir::new().unwrap();
    // Half black, half white along x: the derived single-tile layer
    // must preserve that division at half scale.
    let (width, height) = (512u32, 512u32);
    let mut pixels = Vec::with_capacity((width * height * 4) as usize);
    for _y in 0..height {
        for x in 0..width {
            let value = if x < 256 { 0u8 } else { 255u8 };
            pixels.extend_from_slice(&[value, value, value, 0xFF]);
        }
    }

    let mut options = options_for(&dir, "halves");
    options.derivation = Derivation::Derive2x;
    options.quality = 95;
    let output = encode_to_completion(
        options,
        Box::new(RasterSource::from_rgba(pixels, width, height)),
    );

    let slide = Slide::open(&output, None).unwrap();
    assert_eq!(slide.extent().layers[0].x_tiles, 1);

    let derived = slide.read_tile(0, 0, Format::R8G8B8A8, None).unwrap();
    let data = derived.data();
    // Row 128: left half dark, right half light
    let left = (128 * 256 + 32) * 4;
    let right = (128 * 256 + 224) * 4;
    assert!(data[left] < 32, "left half not dark: {}", data[left]);
    assert!(data[right] > 224, "right half not light: {}", data[right]);
}

#[test]
fn test_encode_derive_4x_layer_geometry() {
    let dir = TempDir::new().unwrap();
    let (width, height) = (1024u32, 1024u32);

    let mut options = options_for(&dir, "fourx");
    options.derivation = Derivation::Derive4x;
    let output = encode_to_completion(
        options,
        Box::new(RasterSource::from_rgba(gradient_rgba(width, height), width, height)),
    );

    let slide = Slide::open(&output, None).unwrap();
    let counts: Vec<(u32, u32)> = slide
        .extent()
        .layers
        .iter()
        .map(|layer| (layer.x_tiles, layer.y_tiles))
        .collect();
    assert_eq!(counts, vec![(1, 1), (4, 4)]);
}

#[test]
fn test_derive_partial_edge_tiles() {
    let dir = TempDir::new().unwrap();
    // 1280x768 = 5x3 tiles: exercises the edge-parent subtile preseed.
    let (width, height) = (1280u32, 768u32);

    let mut options = options_for(&dir, "partial");
    options.derivation = Derivation::Derive2x;
    let output = encode_to_completion(
        options,
        Box::new(RasterSource::from_rgba(gradient_rgba(width, height), width, height)),
    );

    Slide::validate(&output).unwrap();
    let slide = Slide::open(&output, None).unwrap();
    let top = slide.extent().layers.last().unwrap();
    assert_eq!((top.x_tiles, top.y_tiles), (5, 3));

    // Every tile of every layer is present and decodable.
    for (layer, extent) in slide.extent().layers.clone().iter().enumerate() {
        for tile in 0..extent.tile_count() as u32 {
            slide
                .read_tile(layer as u32, tile, Format::R8G8B8A8, None)
                .unwrap();
        }
    }
}

// =============================================================================
// Metadata
// =============================================================================

fn calibration_metadata() -> Metadata {
    let mut metadata = Metadata {
        microns_per_pixel: 0.25,
        magnification: 40.0,
        ..Metadata::default()
    };
    metadata.attributes.kind = AttributeType::FreeText;
    metadata
        .attributes
        .entries
        .insert("scanner.vendor".to_string(), b"synthetic".to_vec());
    metadata
        .attributes
        .entries
        .insert("PatientID".to_string(), b"anonymous-1".to_vec());
    metadata.icc_profile = vec![0xA5; 128];
    metadata
}

#[test]
fn test_metadata_roundtrip() {
    let dir = TempDir::new().unwrap();
    let source = RasterSource::from_rgba(gradient_rgba(512, 512), 512, 512)
        .with_metadata(calibration_metadata());

    let output = encode_to_completion(options_for(&dir, "meta"), Box::new(source));

    let slide = Slide::open(&output, None).unwrap();
    let metadata = slide.info().metadata;
    assert_eq!(metadata.magnification, 40.0);
    assert_eq!(metadata.microns_per_pixel, 0.25);
    assert_eq!(metadata.codec_version, iris_codec::Version::codec());
    assert_eq!(
        metadata.attributes.entries.get("scanner.vendor"),
        Some(&b"synthetic".to_vec())
    );
    assert_eq!(
        metadata.attributes.entries.get("PatientID"),
        Some(&b"anonymous-1".to_vec())
    );
    assert_eq!(metadata.icc_profile, vec![0xA5; 128]);
}

#[test]
fn test_strip_metadata_drops_identifiers() {
    let dir = TempDir::new().unwrap();
    let source = RasterSource::from_rgba(gradient_rgba(512, 512), 512, 512)
        .with_metadata(calibration_metadata());

    let mut options = options_for(&dir, "stripped");
    options.strip_metadata = true;
    let output = encode_to_completion(options, Box::new(source));

    let slide = Slide::open(&output, None).unwrap();
    let metadata = slide.info().metadata;
    assert!(!metadata.attributes.entries.contains_key("PatientID"));
    assert!(metadata.attributes.entries.contains_key("scanner.vendor"));
    // Calibration is not an identifier
    assert_eq!(metadata.magnification, 40.0);
}

#[test]
fn test_iris_to_iris_transcode() {
    let dir = TempDir::new().unwrap();
    let pixels = gradient_rgba(512, 512);
    let source = RasterSource::from_rgba(pixels.clone(), 512, 512)
        .with_metadata(calibration_metadata());
    let first = encode_to_completion(options_for(&dir, "first"), Box::new(source));

    // Re-encode the Iris file itself via source probing.
    let second_dir = TempDir::new().unwrap();
    let mut options = EncodeOptions::new(&first);
    options.destination = Some(second_dir.path().to_path_buf());
    let encoder = Encoder::new(options).unwrap();
    encoder.dispatch().unwrap();
    encoder.wait();
    assert_eq!(encoder.status(), EncoderStatus::Inactive);

    let second = encoder.progress().dst_path;
    let slide = Slide::open(&second, None).unwrap();
    assert_eq!(slide.extent().layers[0].x_tiles, 2);
    assert_eq!(slide.info().metadata.magnification, 40.0);

    let decoded = slide.read_tile(0, 0, Format::R8G8B8A8, None).unwrap();
    let reference = reference_tile_rgba(&pixels, 512, 512, 2, 0);
    // Two lossy generations still stay close to the source
    assert!(psnr(&reference, decoded.data()) >= 32.0);
}

// =============================================================================
// Interrupt and failure paths
// =============================================================================

#[test]
fn test_interrupt_leaves_no_output() {
    let dir = TempDir::new().unwrap();
    // The per-tile delay exceeds the interrupt point, so the run cannot
    // complete first regardless of core count.
    let (width, height) = (4096u32, 4096u32);
    let source = SlowSource::new(
        RasterSource::from_rgba(vec![0x80u8; (width * height * 4) as usize], width, height),
        Duration::from_millis(250),
    );

    let options = options_for(&dir, "interrupted");
    let dst_file = dir.path().join("interrupted.iris");
    let encoder = Encoder::new(options).unwrap();
    encoder.dispatch_with_source(Box::new(source)).unwrap();

    std::thread::sleep(Duration::from_millis(200));
    encoder.interrupt().unwrap();

    // The error status lands within a second.
    let deadline = Instant::now() + Duration::from_secs(1);
    while encoder.status() != EncoderStatus::Error && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(encoder.status(), EncoderStatus::Error);
    encoder.wait();

    assert!(!dst_file.exists(), "no output file may remain");
    assert!(encoder.progress().error_msg.contains("interrupted"));

    // A reset returns the encoder to inactive.
    encoder.reset().unwrap();
    assert_eq!(encoder.status(), EncoderStatus::Inactive);
}

#[test]
fn test_dispatch_twice_rejected() {
    let dir = TempDir::new().unwrap();
    let source = SlowSource::new(
        RasterSource::from_rgba(gradient_rgba(2048, 2048), 2048, 2048),
        Duration::from_millis(50),
    );
    let encoder = Encoder::new(options_for(&dir, "busy")).unwrap();
    encoder.dispatch_with_source(Box::new(source)).unwrap();

    let again = encoder.dispatch();
    assert!(again.is_err());

    encoder.interrupt().unwrap();
    encoder.wait();
}

// =============================================================================
// Corruption
// =============================================================================

#[test]
fn test_corrupted_tile_offset_fails_validation() {
    let dir = TempDir::new().unwrap();
    let output = encode_to_completion(
        options_for(&dir, "corrupt"),
        Box::new(RasterSource::from_rgba(gradient_rgba(512, 512), 512, 512)),
    );

    // Locate the tile offsets array through the headers and flip one
    // byte of the first entry's offset.
    let mut bytes = std::fs::read(&output).unwrap();
    let header = FileHeader::parse(&bytes).unwrap();
    let table = TileTableHeader::parse(&bytes[header.tile_table_offset as usize..]).unwrap();
    bytes[table.tiles_offset as usize + 7] ^= 0xFF;
    std::fs::write(&output, &bytes).unwrap();

    assert!(Slide::validate(&output).is_err());
    assert!(Slide::open(&output, None).is_err());
}

#[test]
fn test_truncated_file_fails_validation() {
    let dir = TempDir::new().unwrap();
    let output = encode_to_completion(
        options_for(&dir, "truncated"),
        Box::new(RasterSource::from_rgba(gradient_rgba(512, 512), 512, 512)),
    );

    let bytes = std::fs::read(&output).unwrap();
    std::fs::write(&output, &bytes[..bytes.len() - 16]).unwrap();
    assert!(Slide::validate(&output).is_err());
}

//! Remote slide access over HTTP range requests.
//!
//! A [`RemoteSlide`] never downloads the container: it verifies the
//! resource with a `HEAD` request, pulls the file header and tile table
//! through ranged `GET`s, and afterwards serves each tile fetch as one
//! independent ranged `GET` of exactly that tile's bytes. Responses must
//! be `206 Partial Content` with the exact requested byte count;
//! anything else aborts the read.
//!
//! [`RangeFetch`] is the transport seam: [`HttpRangeClient`] is the
//! `reqwest` implementation, and tests substitute an in-memory fetch.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{CONTENT_LENGTH, RANGE};
use reqwest::StatusCode;
use tracing::debug;
use url::Url;

use crate::error::{FormatError, RemoteError, SlideError};
use crate::format::layout::{
    parse_layer_extents, parse_tile_entries, FileHeader, TileTableHeader, FILE_HEADER_SIZE,
    LAYER_EXTENT_SIZE, TILE_ENTRY_SIZE, TILE_TABLE_HEADER_SIZE,
};
use crate::format::{Encoding, Extent, Format, TileEntry};

// =============================================================================
// Range fetch trait
// =============================================================================

/// Trait for reading byte ranges of a remote resource.
///
/// Implementations must be thread-safe; a slide viewer issues many tile
/// fetches concurrently.
#[async_trait]
pub trait RangeFetch: Send + Sync {
    /// Total size of the resource in bytes.
    async fn content_length(&self) -> Result<u64, RemoteError>;

    /// Read exactly `len` bytes starting at `offset`.
    ///
    /// Returns an error on a short read or an out-of-range request.
    async fn read_exact_at(&self, offset: u64, len: u64) -> Result<Bytes, RemoteError>;

    /// A unique identifier for this resource (for logging).
    fn identifier(&self) -> &str;
}

// =============================================================================
// HTTP client
// =============================================================================

/// [`RangeFetch`] over HTTP using `Range: bytes=a-b` requests.
pub struct HttpRangeClient {
    client: reqwest::Client,
    url: Url,
    identifier: String,
}

impl HttpRangeClient {
    pub fn new(url: Url) -> HttpRangeClient {
        Self::with_client(reqwest::Client::new(), url)
    }

    pub fn with_client(client: reqwest::Client, url: Url) -> HttpRangeClient {
        let identifier = url.to_string();
        HttpRangeClient {
            client,
            url,
            identifier,
        }
    }
}

#[async_trait]
impl RangeFetch for HttpRangeClient {
    async fn content_length(&self) -> Result<u64, RemoteError> {
        let response = self.client.head(self.url.clone()).send().await?;
        if !response.status().is_success() {
            return Err(RemoteError::UnexpectedStatus(response.status().as_u16()));
        }
        response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<u64>().ok())
            .ok_or(RemoteError::MissingContentLength)
    }

    async fn read_exact_at(&self, offset: u64, len: u64) -> Result<Bytes, RemoteError> {
        let end = offset + len - 1;
        let response = self
            .client
            .get(self.url.clone())
            .header(RANGE, format!("bytes={offset}-{end}"))
            .send()
            .await?;
        if response.status() != StatusCode::PARTIAL_CONTENT {
            return Err(RemoteError::UnexpectedStatus(response.status().as_u16()));
        }
        let bytes = response.bytes().await?;
        if bytes.len() as u64 != len {
            return Err(RemoteError::ShortRead {
                requested: len,
                received: bytes.len() as u64,
            });
        }
        Ok(bytes)
    }

    fn identifier(&self) -> &str {
        &self.identifier
    }
}

// =============================================================================
// Remote slide
// =============================================================================

/// One tile fetched from a remote slide, tagged with its MIME type for
/// downstream consumption.
#[derive(Debug, Clone)]
pub struct RemoteTile {
    pub bytes: Bytes,
    pub mime_type: &'static str,
}

/// A remote Iris slide reachable through ranged reads.
pub struct RemoteSlide<F: RangeFetch> {
    fetch: F,
    header: FileHeader,
    encoding: Encoding,
    format: Format,
    extent: Extent,
    layers: Vec<Vec<TileEntry>>,
}

impl<F: RangeFetch> RemoteSlide<F> {
    /// Open a remote slide: verify the resource size, fetch and validate
    /// the header, then fetch and check the tile table.
    pub async fn open(fetch: F) -> Result<RemoteSlide<F>, RemoteError> {
        let file_size = fetch.content_length().await?;
        if file_size < FILE_HEADER_SIZE {
            return Err(FormatError::FileTooSmall {
                required: FILE_HEADER_SIZE,
                actual: file_size,
            }
            .into());
        }

        let header_bytes = fetch.read_exact_at(0, FILE_HEADER_SIZE).await?;
        let header = FileHeader::parse(&header_bytes)?;
        if header.file_size != file_size {
            return Err(FormatError::Validation(format!(
                "header records {} bytes, resource is {}",
                header.file_size, file_size
            ))
            .into());
        }

        check_range(
            "tile table header",
            header.tile_table_offset,
            TILE_TABLE_HEADER_SIZE,
            file_size,
        )?;
        let table_bytes = fetch
            .read_exact_at(header.tile_table_offset, TILE_TABLE_HEADER_SIZE)
            .await?;
        let table_header = TileTableHeader::parse(&table_bytes)?;
        if table_header.self_offset != header.tile_table_offset {
            return Err(FormatError::RecoveryMismatch {
                block: "tile table header",
                recorded: table_header.self_offset,
                actual: header.tile_table_offset,
            }
            .into());
        }

        if table_header.layers == 0 {
            return Err(FormatError::InvalidField {
                field: "layer count",
                value: 0,
            }
            .into());
        }

        // Layer extents
        let extents_len = table_header.layers as u64 * LAYER_EXTENT_SIZE;
        check_range(
            "layer extents",
            table_header.layer_extents_offset,
            extents_len,
            file_size,
        )?;
        let extent_bytes = fetch
            .read_exact_at(table_header.layer_extents_offset, extents_len)
            .await?;
        let layer_extents = parse_layer_extents(&extent_bytes, table_header.layers)?;

        let computed: u64 = layer_extents
            .iter()
            .map(|layer| layer.tile_count())
            .sum();
        if computed != table_header.tile_count {
            return Err(FormatError::TileCountMismatch {
                declared: table_header.tile_count,
                computed,
            }
            .into());
        }
        if table_header.tile_count == 0 {
            return Err(FormatError::InvalidField {
                field: "tile count",
                value: 0,
            }
            .into());
        }

        // Tile entries
        let entries_len = table_header.tile_count * TILE_ENTRY_SIZE;
        check_range("tile offsets", table_header.tiles_offset, entries_len, file_size)?;
        let entry_bytes = fetch
            .read_exact_at(table_header.tiles_offset, entries_len)
            .await?;
        let flat = parse_tile_entries(&entry_bytes, table_header.tile_count)?;
        for entry in &flat {
            if entry.size == 0 {
                return Err(FormatError::Validation("empty tile entry".to_string()).into());
            }
            check_range("tile bytes", entry.offset, entry.size as u64, file_size)?;
        }

        let mut layers = Vec::with_capacity(layer_extents.len());
        let mut cursor = 0usize;
        for layer in &layer_extents {
            let count = layer.tile_count() as usize;
            layers.push(flat[cursor..cursor + count].to_vec());
            cursor += count;
        }

        debug!(
            resource = fetch.identifier(),
            layers = layers.len(),
            tiles = table_header.tile_count,
            "opened remote slide"
        );
        Ok(RemoteSlide {
            fetch,
            header,
            encoding: table_header.encoding,
            format: table_header.format,
            extent: Extent {
                width: table_header.width,
                height: table_header.height,
                layers: layer_extents,
            },
            layers,
        })
    }

    /// The pyramid geometry.
    pub fn extent(&self) -> &Extent {
        &self.extent
    }

    /// Encoding of the stored tile streams.
    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    /// Pixel format of the stored tiles.
    pub fn format(&self) -> Format {
        self.format
    }

    /// Total container size in bytes.
    pub fn file_size(&self) -> u64 {
        self.header.file_size
    }

    /// Fetch one tile's compressed bytes as an independent ranged read.
    ///
    /// Bounds checks are identical to the local reader's.
    pub async fn read_tile(&self, layer: u32, tile: u32) -> Result<RemoteTile, RemoteError> {
        let layers = self.layers.len() as u32;
        if layer >= layers {
            return Err(SlideError::LayerOutOfBounds { layer, layers }.into());
        }
        let entries = &self.layers[layer as usize];
        if tile as usize >= entries.len() {
            return Err(SlideError::TileOutOfBounds {
                layer,
                tile,
                tiles: entries.len() as u32,
            }
            .into());
        }
        let entry = entries[tile as usize];
        let bytes = self
            .fetch
            .read_exact_at(entry.offset, entry.size as u64)
            .await?;
        Ok(RemoteTile {
            bytes,
            mime_type: self.encoding.mime_type(),
        })
    }
}

fn check_range(block: &'static str, offset: u64, len: u64, file_size: u64) -> Result<(), RemoteError> {
    if offset < FILE_HEADER_SIZE || offset >= file_size {
        return Err(FormatError::OffsetOutOfBounds {
            block,
            offset,
            file_size,
        }
        .into());
    }
    let end = offset
        .checked_add(len)
        .ok_or(FormatError::BlockTruncated {
            block,
            offset,
            len,
            file_size,
        })?;
    if end > file_size {
        return Err(FormatError::BlockTruncated {
            block,
            offset,
            len,
            file_size,
        }
        .into());
    }
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::layout::{store_layer_extents, store_tile_entries};
    use crate::format::LayerExtent;

    /// In-memory fetch over an assembled container.
    struct MemoryFetch {
        data: Vec<u8>,
    }

    #[async_trait]
    impl RangeFetch for MemoryFetch {
        async fn content_length(&self) -> Result<u64, RemoteError> {
            Ok(self.data.len() as u64)
        }

        async fn read_exact_at(&self, offset: u64, len: u64) -> Result<Bytes, RemoteError> {
            let end = offset + len;
            if end > self.data.len() as u64 {
                return Err(RemoteError::RangeOutOfBounds {
                    offset,
                    requested: len,
                    size: self.data.len() as u64,
                });
            }
            Ok(Bytes::copy_from_slice(
                &self.data[offset as usize..end as usize],
            ))
        }

        fn identifier(&self) -> &str {
            "memory://test"
        }
    }

    /// Single-layer, single-tile container with a recognizable payload.
    fn build_container(tile_payload: &[u8]) -> Vec<u8> {
        let tile_offset = FILE_HEADER_SIZE;
        let layers = vec![vec![TileEntry {
            offset: tile_offset,
            size: tile_payload.len() as u32,
        }]];
        let extents = vec![LayerExtent {
            x_tiles: 1,
            y_tiles: 1,
            scale: 1.0,
            downsample: 1.0,
        }];

        let tiles_offset = tile_offset + tile_payload.len() as u64;
        let extents_offset = tiles_offset + TILE_ENTRY_SIZE;
        let table_offset = extents_offset + LAYER_EXTENT_SIZE;
        let file_size = table_offset + TILE_TABLE_HEADER_SIZE;

        let mut data = Vec::new();
        data.extend_from_slice(
            &FileHeader {
                file_size,
                revision: 0,
                tile_table_offset: table_offset,
                metadata_offset: 0,
            }
            .store(),
        );
        data.extend_from_slice(tile_payload);
        data.extend_from_slice(&store_tile_entries(&layers));
        data.extend_from_slice(&store_layer_extents(&extents));
        data.extend_from_slice(
            &TileTableHeader {
                self_offset: table_offset,
                encoding: Encoding::Jpeg,
                format: Format::R8G8B8A8,
                tiles_offset,
                layer_extents_offset: extents_offset,
                layers: 1,
                width: 256,
                height: 256,
                tile_count: 1,
            }
            .store(),
        );
        assert_eq!(data.len() as u64, file_size);
        data
    }

    #[tokio::test]
    async fn test_open_and_read_tile() {
        let payload = b"compressed tile bytes";
        let slide = RemoteSlide::open(MemoryFetch {
            data: build_container(payload),
        })
        .await
        .unwrap();

        assert_eq!(slide.extent().layers.len(), 1);
        assert_eq!(slide.encoding(), Encoding::Jpeg);

        let tile = slide.read_tile(0, 0).await.unwrap();
        assert_eq!(tile.bytes.as_ref(), payload);
        assert_eq!(tile.mime_type, "image/jpeg");
    }

    #[tokio::test]
    async fn test_read_tile_out_of_bounds() {
        let slide = RemoteSlide::open(MemoryFetch {
            data: build_container(b"x"),
        })
        .await
        .unwrap();

        assert!(matches!(
            slide.read_tile(1, 0).await,
            Err(RemoteError::Slide(SlideError::LayerOutOfBounds { .. }))
        ));
        assert!(matches!(
            slide.read_tile(0, 1_000_000).await,
            Err(RemoteError::Slide(SlideError::TileOutOfBounds { .. }))
        ));
    }

    #[tokio::test]
    async fn test_open_rejects_tiny_resource() {
        let result = RemoteSlide::open(MemoryFetch {
            data: vec![0u8; 8],
        })
        .await;
        assert!(matches!(
            result,
            Err(RemoteError::Format(FormatError::FileTooSmall { .. }))
        ));
    }

    #[tokio::test]
    async fn test_open_rejects_size_mismatch() {
        let mut data = build_container(b"payload");
        data.push(0);
        let result = RemoteSlide::open(MemoryFetch { data }).await;
        assert!(matches!(result, Err(RemoteError::Format(_))));
    }

    #[tokio::test]
    async fn test_open_rejects_corrupt_entry() {
        let mut data = build_container(b"payload");
        // Corrupt the tile entry's offset high byte
        let entry_pos = FILE_HEADER_SIZE as usize + 7 + 7;
        data[entry_pos] = 0xFF;
        let result = RemoteSlide::open(MemoryFetch { data }).await;
        assert!(matches!(result, Err(RemoteError::Format(_))));
    }
}

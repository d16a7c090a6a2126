//! Cloud-Optimized GeoTIFF window reads over HTTP range requests.
//!
//! Historical NDVI needs a small pixel window from archive rasters that are
//! only reachable as COGs on blob storage. A COG fronts its IFD and tag data,
//! so one ranged read covers the metadata and one or two more fetch the
//! tile(s) under the window. Supported layout: classic little-endian TIFF,
//! tiled, chunky planar config, 8- or 16-bit unsigned samples, deflate or
//! uncompressed, predictor 1 or 2. Anything else is a permanent
//! `unsupported_cog_layout` for that raster.

use std::collections::HashMap;
use std::io::Read;
use std::sync::{Arc, Mutex};

use flate2::read::ZlibDecoder;
use proj4rs::Proj;

use crate::error::CollectorError;

/// Bytes fetched up front; COG headers and tag arrays live at the front of
/// the file.
const HEAD_FETCH_BYTES: u64 = 128 * 1024;

// ── CRS transformer cache ──

/// WGS84 → raster-CRS transformers, built once per CRS string and shared
/// across worker threads. Insert under the lock, transform on a clone.
pub struct TransformerCache {
    inner: Mutex<HashMap<String, Arc<Proj>>>,
}

impl Default for TransformerCache {
    fn default() -> Self {
        Self::new()
    }
}

impl TransformerCache {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    fn get(&self, crs: &str) -> Result<Arc<Proj>, CollectorError> {
        let mut map = self.inner.lock().unwrap();
        if let Some(proj) = map.get(crs) {
            return Ok(proj.clone());
        }
        let def = epsg_to_proj_string(crs)
            .ok_or_else(|| CollectorError::UnsupportedCog(format!("unsupported_crs: {crs}")))?;
        let proj = Proj::from_proj_string(&def)
            .map_err(|e| CollectorError::UnsupportedCog(format!("crs_init: {e}")))?;
        let proj = Arc::new(proj);
        map.insert(crs.to_string(), proj.clone());
        Ok(proj)
    }

    /// Project a WGS84 point into the raster CRS.
    pub fn to_projected(&self, epsg: u32, lng: f64, lat: f64) -> Result<(f64, f64), CollectorError> {
        if epsg == 4326 {
            return Ok((lng, lat));
        }
        let crs = format!("EPSG:{epsg}");
        let dst = self.get(&crs)?;
        let src = self.get("EPSG:4326")?;
        let mut point = (lng.to_radians(), lat.to_radians(), 0.0);
        proj4rs::transform::transform(&src, &dst, &mut point)
            .map_err(|e| CollectorError::UnsupportedCog(format!("transform: {e}")))?;
        Ok((point.0, point.1))
    }
}

/// Proj definitions for the CRS families the imagery archives actually use:
/// geographic WGS84 and the NAD83/WGS84 UTM zones.
pub fn epsg_to_proj_string(crs: &str) -> Option<String> {
    let code: u32 = crs.strip_prefix("EPSG:")?.parse().ok()?;
    match code {
        4326 => Some("+proj=longlat +datum=WGS84 +no_defs".to_string()),
        4269 => Some("+proj=longlat +datum=NAD83 +no_defs".to_string()),
        26901..=26923 => Some(format!(
            "+proj=utm +zone={} +datum=NAD83 +units=m +no_defs",
            code - 26900
        )),
        32601..=32660 => Some(format!(
            "+proj=utm +zone={} +datum=WGS84 +units=m +no_defs",
            code - 32600
        )),
        32701..=32760 => Some(format!(
            "+proj=utm +zone={} +south +datum=WGS84 +units=m +no_defs",
            code - 32700
        )),
        _ => None,
    }
}

// ── Window math ──

/// Pixel window: one `Vec<f64>` of sample values per band.
#[derive(Debug, Clone)]
pub struct CogWindow {
    pub bands: Vec<Vec<f64>>,
}

/// Mean per-pixel NDVI over a window.
///
/// NDVI is computed pixel-by-pixel over the subset where NIR + Red > 0 and
/// averaged, which avoids the division artifacts of averaging bands first.
/// Band order: Red, Green, Blue, NIR.
pub fn window_ndvi(window: &CogWindow) -> Result<f64, CollectorError> {
    if window.bands.len() < 4 {
        return Err(CollectorError::InsufficientBands(window.bands.len()));
    }
    let red = &window.bands[0];
    let nir = &window.bands[3];

    let mut sum = 0.0;
    let mut valid = 0usize;
    for (&r, &n) in red.iter().zip(nir.iter()) {
        let denom = n + r;
        if denom > 0.0 {
            sum += (n - r) / denom;
            valid += 1;
        }
    }
    if valid == 0 {
        return Ok(0.0);
    }
    Ok(crate::scoring::round_to(sum / valid as f64, 4))
}

/// Affine world→pixel mapping from the GeoTIFF pixel-scale + tiepoint pair.
#[derive(Debug, Clone, Copy)]
pub struct PixelMapping {
    pub scale_x: f64,
    pub scale_y: f64,
    pub tie_col: f64,
    pub tie_row: f64,
    pub tie_x: f64,
    pub tie_y: f64,
}

impl PixelMapping {
    pub fn world_to_pixel(&self, x: f64, y: f64) -> (i64, i64) {
        let col = (x - self.tie_x) / self.scale_x + self.tie_col;
        let row = (self.tie_y - y) / self.scale_y + self.tie_row;
        (col.floor() as i64, row.floor() as i64)
    }
}

// ── TIFF structure ──

#[derive(Debug, Clone)]
struct TiffMeta {
    width: u64,
    height: u64,
    tile_width: u64,
    tile_height: u64,
    samples_per_pixel: usize,
    bits_per_sample: u16,
    compression: u16,
    predictor: u16,
    mapping: PixelMapping,
}

#[derive(Debug, Clone, Copy)]
struct IfdEntry {
    dtype: u16,
    count: u32,
    raw: [u8; 4],
}

fn type_size(dtype: u16) -> Option<usize> {
    match dtype {
        1 | 2 => Some(1),
        3 => Some(2),
        4 => Some(4),
        5 => Some(8),
        12 => Some(8),
        _ => None,
    }
}

fn u16_le(buf: &[u8], pos: usize) -> Option<u16> {
    Some(u16::from_le_bytes(buf.get(pos..pos + 2)?.try_into().ok()?))
}

fn u32_le(buf: &[u8], pos: usize) -> Option<u32> {
    Some(u32::from_le_bytes(buf.get(pos..pos + 4)?.try_into().ok()?))
}

fn f64_le(buf: &[u8], pos: usize) -> Option<f64> {
    Some(f64::from_le_bytes(buf.get(pos..pos + 8)?.try_into().ok()?))
}

/// Ranged HTTP reader with the head chunk held locally.
struct RangeReader<'a> {
    client: &'a reqwest::Client,
    url: &'a str,
    head: Vec<u8>,
}

impl<'a> RangeReader<'a> {
    async fn open(client: &'a reqwest::Client, url: &'a str) -> Result<RangeReader<'a>, CollectorError> {
        let head = fetch_range(client, url, 0, HEAD_FETCH_BYTES).await?;
        Ok(Self { client, url, head })
    }

    /// Bytes [start, start+len), from the head chunk when covered, else a
    /// targeted range request.
    async fn bytes_at(&self, start: u64, len: usize) -> Result<Vec<u8>, CollectorError> {
        let end = start as usize + len;
        if (start as usize) < self.head.len() && end <= self.head.len() {
            return Ok(self.head[start as usize..end].to_vec());
        }
        fetch_range(self.client, self.url, start, len as u64).await
    }
}

async fn fetch_range(
    client: &reqwest::Client,
    url: &str,
    start: u64,
    len: u64,
) -> Result<Vec<u8>, CollectorError> {
    let resp = client
        .get(url)
        .header(reqwest::header::RANGE, format!("bytes={}-{}", start, start + len - 1))
        .send()
        .await
        .map_err(|e| CollectorError::from_reqwest(&e))?;

    let status = resp.status();
    if !(status.is_success() || status.as_u16() == 206) {
        return Err(CollectorError::HttpStatus {
            status: status.as_u16(),
        });
    }
    let body = resp
        .bytes()
        .await
        .map_err(|e| CollectorError::Network(e.to_string()))?;

    // A server ignoring Range returns the whole object; slice it ourselves.
    if status.as_u16() == 200 && start > 0 {
        let s = start as usize;
        if s >= body.len() {
            return Err(CollectorError::BadResponse("range beyond object".into()));
        }
        let e = (s + len as usize).min(body.len());
        return Ok(body[s..e].to_vec());
    }
    Ok(body.to_vec())
}

fn parse_meta(head: &[u8]) -> Result<HashMap<u16, IfdEntry>, CollectorError> {
    let unsupported = |why: &str| CollectorError::UnsupportedCog(why.to_string());

    if head.len() < 8 {
        return Err(unsupported("truncated header"));
    }
    if &head[0..2] != b"II" {
        return Err(unsupported("big-endian tiff"));
    }
    match u16_le(head, 2) {
        Some(42) => {}
        Some(43) => return Err(unsupported("bigtiff")),
        _ => return Err(unsupported("not a tiff")),
    }
    let ifd_offset = u32_le(head, 4).ok_or_else(|| unsupported("truncated header"))? as usize;
    let entry_count =
        u16_le(head, ifd_offset).ok_or_else(|| unsupported("ifd beyond head fetch"))? as usize;

    let mut entries = HashMap::new();
    for i in 0..entry_count {
        let base = ifd_offset + 2 + i * 12;
        let tag = u16_le(head, base).ok_or_else(|| unsupported("ifd beyond head fetch"))?;
        let dtype = u16_le(head, base + 2).ok_or_else(|| unsupported("truncated ifd"))?;
        let count = u32_le(head, base + 4).ok_or_else(|| unsupported("truncated ifd"))?;
        let raw: [u8; 4] = head[base + 8..base + 12]
            .try_into()
            .map_err(|_| unsupported("truncated ifd"))?;
        entries.insert(tag, IfdEntry { dtype, count, raw });
    }
    Ok(entries)
}

impl<'a> RangeReader<'a> {
    /// Integer values of a SHORT/LONG tag, inline or at offset.
    async fn tag_ints(&self, entry: &IfdEntry) -> Result<Vec<u64>, CollectorError> {
        let size = type_size(entry.dtype)
            .ok_or_else(|| CollectorError::UnsupportedCog("unknown tag type".into()))?;
        let total = size * entry.count as usize;
        let data: Vec<u8> = if total <= 4 {
            entry.raw[..total].to_vec()
        } else {
            let offset = u32::from_le_bytes(entry.raw) as u64;
            self.bytes_at(offset, total).await?
        };
        let mut out = Vec::with_capacity(entry.count as usize);
        for i in 0..entry.count as usize {
            let v = match entry.dtype {
                3 => u16_le(&data, i * 2).map(u64::from),
                4 => u32_le(&data, i * 4).map(u64::from),
                _ => None,
            };
            out.push(v.ok_or_else(|| CollectorError::UnsupportedCog("bad tag data".into()))?);
        }
        Ok(out)
    }

    async fn tag_doubles(&self, entry: &IfdEntry) -> Result<Vec<f64>, CollectorError> {
        if entry.dtype != 12 {
            return Err(CollectorError::UnsupportedCog("expected DOUBLE tag".into()));
        }
        let total = 8 * entry.count as usize;
        let offset = u32::from_le_bytes(entry.raw) as u64;
        let data = self.bytes_at(offset, total).await?;
        let mut out = Vec::with_capacity(entry.count as usize);
        for i in 0..entry.count as usize {
            out.push(
                f64_le(&data, i * 8)
                    .ok_or_else(|| CollectorError::UnsupportedCog("bad DOUBLE data".into()))?,
            );
        }
        Ok(out)
    }

    /// One element of the tile offset/count arrays by index.
    async fn tile_array_element(
        &self,
        entry: &IfdEntry,
        index: u64,
    ) -> Result<u64, CollectorError> {
        let size = type_size(entry.dtype)
            .ok_or_else(|| CollectorError::UnsupportedCog("unknown tile array type".into()))?;
        if index >= entry.count as u64 {
            return Err(CollectorError::PixelOutOfBounds);
        }
        let total = size * entry.count as usize;
        if total <= 4 {
            let vals = self.tag_ints(entry).await?;
            return Ok(vals[index as usize]);
        }
        let array_offset = u32::from_le_bytes(entry.raw) as u64;
        let data = self.bytes_at(array_offset + index * size as u64, size).await?;
        match entry.dtype {
            3 => u16_le(&data, 0)
                .map(u64::from)
                .ok_or(CollectorError::PixelOutOfBounds),
            4 => u32_le(&data, 0)
                .map(u64::from)
                .ok_or(CollectorError::PixelOutOfBounds),
            _ => Err(CollectorError::UnsupportedCog("tile array type".into())),
        }
    }
}

async fn load_meta<'a>(reader: &RangeReader<'a>) -> Result<(TiffMeta, HashMap<u16, IfdEntry>), CollectorError> {
    let unsupported = |why: &str| CollectorError::UnsupportedCog(why.to_string());
    let entries = parse_meta(&reader.head)?;

    let int_tag = |tag: u16| -> Option<&IfdEntry> { entries.get(&tag) };
    let required = |tag: u16, name: &str| {
        int_tag(tag).copied().ok_or_else(|| unsupported(&format!("missing {name}")))
    };

    let width = reader.tag_ints(&required(256, "ImageWidth")?).await?[0];
    let height = reader.tag_ints(&required(257, "ImageLength")?).await?[0];
    let tile_width = reader
        .tag_ints(&required(322, "TileWidth")?)
        .await?[0];
    let tile_height = reader.tag_ints(&required(323, "TileLength")?).await?[0];

    let samples_per_pixel = match int_tag(277) {
        Some(e) => reader.tag_ints(e).await?[0] as usize,
        None => 1,
    };
    let bits = match int_tag(258) {
        Some(e) => {
            let all = reader.tag_ints(e).await?;
            let first = all[0];
            if all.iter().any(|&b| b != first) {
                return Err(unsupported("mixed bits per sample"));
            }
            first as u16
        }
        None => 1,
    };
    if bits != 8 && bits != 16 {
        return Err(unsupported(&format!("bits_per_sample {bits}")));
    }
    let compression = match int_tag(259) {
        Some(e) => reader.tag_ints(e).await?[0] as u16,
        None => 1,
    };
    if compression != 1 && compression != 8 && compression != 32946 {
        return Err(unsupported(&format!("compression {compression}")));
    }
    let planar = match int_tag(284) {
        Some(e) => reader.tag_ints(e).await?[0],
        None => 1,
    };
    if planar != 1 {
        return Err(unsupported("planar configuration"));
    }
    let predictor = match int_tag(317) {
        Some(e) => reader.tag_ints(e).await?[0] as u16,
        None => 1,
    };
    if predictor != 1 && predictor != 2 {
        return Err(unsupported(&format!("predictor {predictor}")));
    }
    if let Some(e) = int_tag(339) {
        let formats = reader.tag_ints(e).await?;
        if formats.iter().any(|&f| f != 1) {
            return Err(unsupported("non-uint sample format"));
        }
    }

    let scale = reader.tag_doubles(&required(33550, "ModelPixelScale")?).await?;
    let tiepoint = reader.tag_doubles(&required(33922, "ModelTiepoint")?).await?;
    if scale.len() < 2 || tiepoint.len() < 5 {
        return Err(unsupported("incomplete georeferencing"));
    }
    let mapping = PixelMapping {
        scale_x: scale[0],
        scale_y: scale[1],
        tie_col: tiepoint[0],
        tie_row: tiepoint[1],
        tie_x: tiepoint[3],
        tie_y: tiepoint[4],
    };

    let offsets = required(324, "TileOffsets")?;
    let counts = required(325, "TileByteCounts")?;

    Ok((
        TiffMeta {
            width,
            height,
            tile_width,
            tile_height,
            samples_per_pixel,
            bits_per_sample: bits,
            compression,
            predictor,
            mapping,
        },
        HashMap::from([(324u16, offsets), (325u16, counts)]),
    ))
}

/// Read a `window_size` × `window_size` pixel window centered on a WGS84
/// point. The window is clamped to the raster bounds; a center falling
/// entirely outside is `pixel_out_of_bounds`.
pub async fn read_window(
    client: &reqwest::Client,
    url: &str,
    epsg: u32,
    lat: f64,
    lng: f64,
    window_size: usize,
    transformers: &TransformerCache,
) -> Result<CogWindow, CollectorError> {
    let (x, y) = transformers.to_projected(epsg, lng, lat)?;

    let reader = RangeReader::open(client, url).await?;
    let (meta, tile_arrays) = load_meta(&reader).await?;

    let (col, row) = meta.mapping.world_to_pixel(x, y);
    let half = (window_size / 2) as i64;

    let r_start = (row - half).max(0);
    let c_start = (col - half).max(0);
    let r_end = (row + half + 1).min(meta.height as i64);
    let c_end = (col + half + 1).min(meta.width as i64);
    if r_start >= r_end || c_start >= c_end {
        return Err(CollectorError::PixelOutOfBounds);
    }

    let tiles_across = meta.width.div_ceil(meta.tile_width);
    let offsets_entry = tile_arrays[&324];
    let counts_entry = tile_arrays[&325];

    // Fetch each tile under the window once.
    let mut tiles: HashMap<u64, Vec<u8>> = HashMap::new();
    for r in r_start..r_end {
        for c in c_start..c_end {
            let tile_idx =
                (r as u64 / meta.tile_height) * tiles_across + (c as u64 / meta.tile_width);
            if tiles.contains_key(&tile_idx) {
                continue;
            }
            let offset = reader.tile_array_element(&offsets_entry, tile_idx).await?;
            let count = reader.tile_array_element(&counts_entry, tile_idx).await?;
            let raw = reader.bytes_at(offset, count as usize).await?;
            let decoded = decode_tile(&raw, &meta)?;
            tiles.insert(tile_idx, decoded);
        }
    }

    // Pull window samples band by band.
    let mut bands = vec![Vec::new(); meta.samples_per_pixel];
    let bytes_per_sample = (meta.bits_per_sample / 8) as usize;
    for r in r_start..r_end {
        for c in c_start..c_end {
            let tile_r = r as u64 / meta.tile_height;
            let tile_c = c as u64 / meta.tile_width;
            let tile = &tiles[&(tile_r * tiles_across + tile_c)];
            let r_in = r as u64 % meta.tile_height;
            let c_in = c as u64 % meta.tile_width;
            let pixel_base = ((r_in * meta.tile_width + c_in) as usize)
                * meta.samples_per_pixel
                * bytes_per_sample;
            for (b, band) in bands.iter_mut().enumerate() {
                let pos = pixel_base + b * bytes_per_sample;
                let value = if bytes_per_sample == 1 {
                    *tile
                        .get(pos)
                        .ok_or(CollectorError::PixelOutOfBounds)? as f64
                } else {
                    u16_le(tile, pos).ok_or(CollectorError::PixelOutOfBounds)? as f64
                };
                band.push(value);
            }
        }
    }

    Ok(CogWindow { bands })
}

fn decode_tile(raw: &[u8], meta: &TiffMeta) -> Result<Vec<u8>, CollectorError> {
    let expected = (meta.tile_width * meta.tile_height) as usize
        * meta.samples_per_pixel
        * (meta.bits_per_sample / 8) as usize;

    let mut data = match meta.compression {
        1 => raw.to_vec(),
        8 | 32946 => {
            let mut out = Vec::with_capacity(expected);
            ZlibDecoder::new(raw)
                .read_to_end(&mut out)
                .map_err(|e| CollectorError::BandParse(format!("inflate: {e}")))?;
            out
        }
        other => {
            return Err(CollectorError::UnsupportedCog(format!("compression {other}")))
        }
    };

    if data.len() < expected {
        return Err(CollectorError::BandParse(format!(
            "short tile: {} < {expected}",
            data.len()
        )));
    }

    if meta.predictor == 2 {
        apply_horizontal_predictor(
            &mut data,
            meta.tile_width as usize,
            meta.tile_height as usize,
            meta.samples_per_pixel,
            meta.bits_per_sample,
        );
    }
    Ok(data)
}

/// Undo horizontal differencing: each sample is stored as a delta from the
/// same sample one pixel to the left.
fn apply_horizontal_predictor(
    data: &mut [u8],
    tile_width: usize,
    tile_height: usize,
    samples: usize,
    bits: u16,
) {
    if bits == 8 {
        let row_stride = tile_width * samples;
        for row in 0..tile_height {
            let base = row * row_stride;
            for i in samples..row_stride {
                data[base + i] = data[base + i].wrapping_add(data[base + i - samples]);
            }
        }
    } else {
        let row_stride = tile_width * samples * 2;
        for row in 0..tile_height {
            let base = row * row_stride;
            for col in 1..tile_width {
                for s in 0..samples {
                    let pos = base + (col * samples + s) * 2;
                    let prev = base + ((col - 1) * samples + s) * 2;
                    let value = u16::from_le_bytes([data[pos], data[pos + 1]])
                        .wrapping_add(u16::from_le_bytes([data[prev], data[prev + 1]]));
                    data[pos..pos + 2].copy_from_slice(&value.to_le_bytes());
                }
            }
        }
    }
}

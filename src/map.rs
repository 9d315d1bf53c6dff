//! Map telemetry codec.
//!
//! Renders the latest cached telemetry into a PNG raster: the run-length
//! encoded occupancy grid, the visited track as a dotted path, and the robot
//! and charger positions as filled markers. Stateless; an absent or
//! undecodable field degrades to a blank canvas, never an error the caller
//! has to handle.
//!
//! Grid payload layout (base64): an 8-byte header `[u32 reserved]
//! [u16le rows][u16le cols]`, then run-length entries `[u8 cells][u24le
//! repeat]` where each cells byte packs four 2-bit cells, high bits first
//! (0 empty, 1 wall, 2 floor). Track payload: `[u16le tag][u16le count]`
//! followed by `count` (x, y) byte pairs. Charger position: `"x,y"`.

use std::io::Cursor;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::{ImageFormat, Rgb, RgbImage};
use thiserror::Error;

use crate::commands::{CommandError, Params};
use crate::status::StatusCache;

pub const DEFAULT_SIZE: u32 = 800;
pub const MAX_SIZE: u32 = 4096;

/// Refuse absurd grid dimensions claimed by a corrupt payload.
const MAX_GRID_CELLS: usize = 4_000_000;

const COLOR_BACKGROUND: Rgb<u8> = Rgb([245, 245, 245]);
const COLOR_WALL: Rgb<u8> = Rgb([54, 54, 66]);
const COLOR_FLOOR: Rgb<u8> = Rgb([182, 214, 250]);
const COLOR_TRACK: Rgb<u8> = Rgb([60, 80, 200]);
const COLOR_ROBOT: Rgb<u8> = Rgb([204, 44, 44]);
const COLOR_CHARGER: Rgb<u8> = Rgb([32, 160, 64]);

#[derive(Debug, Error)]
pub enum MapError {
    #[error("png encoding failed: {0}")]
    Encode(#[from] image::ImageError),
}

/// Validate optional `width`/`height` parameters for `getMap`.
pub fn render_size(params: &Params) -> Result<(u32, u32), CommandError> {
    let parse = |key: &'static str| -> Result<u32, CommandError> {
        match params.get(key) {
            None => Ok(DEFAULT_SIZE),
            Some(raw) => raw
                .parse::<u32>()
                .ok()
                .filter(|v| (1..=MAX_SIZE).contains(v))
                .ok_or(CommandError::InvalidValue(key)),
        }
    };
    Ok((parse("width")?, parse("height")?))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cell {
    Empty,
    Wall,
    Floor,
}

struct Grid {
    rows: usize,
    cols: usize,
    cells: Vec<Cell>,
}

impl Grid {
    fn decode(raw: &str) -> Option<Self> {
        let data = BASE64.decode(raw.trim()).ok()?;
        if data.len() < 8 {
            return None;
        }
        let rows = u16::from_le_bytes([data[4], data[5]]) as usize;
        let cols = u16::from_le_bytes([data[6], data[7]]) as usize;
        let total = rows.checked_mul(cols)?;
        if total == 0 || total > MAX_GRID_CELLS {
            return None;
        }

        let mut cells = Vec::with_capacity(total);
        let mut offset = 8;
        'entries: while offset + 4 <= data.len() && cells.len() < total {
            let pattern = data[offset];
            let repeat =
                u32::from_le_bytes([data[offset + 1], data[offset + 2], data[offset + 3], 0]);
            offset += 4;
            for _ in 0..repeat {
                for shift in [6u8, 4, 2, 0] {
                    cells.push(Cell::from_bits((pattern >> shift) & 0b11));
                    if cells.len() == total {
                        break 'entries;
                    }
                }
            }
        }
        cells.resize(total, Cell::Empty);
        Some(Self { rows, cols, cells })
    }

    fn get(&self, x: usize, y: usize) -> Cell {
        self.cells[y * self.cols + x]
    }

    /// Bounding box of non-empty cells, inclusive, as (min_x, min_y, max_x,
    /// max_y) in grid coordinates.
    fn bounding_box(&self) -> Option<(i64, i64, i64, i64)> {
        let mut bbox: Option<(i64, i64, i64, i64)> = None;
        for y in 0..self.rows {
            for x in 0..self.cols {
                if self.get(x, y) == Cell::Empty {
                    continue;
                }
                let (x, y) = (x as i64, y as i64);
                bbox = Some(match bbox {
                    None => (x, y, x, y),
                    Some((min_x, min_y, max_x, max_y)) => {
                        (min_x.min(x), min_y.min(y), max_x.max(x), max_y.max(y))
                    }
                });
            }
        }
        bbox
    }
}

impl Cell {
    fn from_bits(bits: u8) -> Self {
        match bits {
            0b01 => Cell::Wall,
            0b10 => Cell::Floor,
            _ => Cell::Empty,
        }
    }
}

fn decode_track(raw: &str) -> Vec<(i64, i64)> {
    let Ok(data) = BASE64.decode(raw.trim()) else {
        return Vec::new();
    };
    if data.len() < 4 {
        return Vec::new();
    }
    let count = u16::from_le_bytes([data[2], data[3]]) as usize;
    data[4..]
        .chunks_exact(2)
        .take(count)
        .map(|pair| (pair[0] as i64, pair[1] as i64))
        .collect()
}

fn decode_charger(raw: &str) -> Option<(i64, i64)> {
    let (x, y) = raw.split_once(',')?;
    Some((x.trim().parse().ok()?, y.trim().parse().ok()?))
}

/// Render the device's cached telemetry into `width` x `height` PNG bytes.
pub fn render(status: &StatusCache, width: u32, height: u32) -> Result<Vec<u8>, MapError> {
    let mut canvas = RgbImage::from_pixel(width, height, COLOR_BACKGROUND);

    let grid = status
        .get("map")
        .filter(|raw| !raw.is_empty())
        .and_then(Grid::decode);
    let track = status
        .get("track")
        .filter(|raw| !raw.is_empty())
        .map(decode_track)
        .unwrap_or_default();
    let charger = status
        .get("chargerPos")
        .filter(|raw| !raw.is_empty())
        .and_then(decode_charger);

    // The charger anchors the view when the grid decodes to nothing.
    let bbox = grid
        .as_ref()
        .and_then(Grid::bounding_box)
        .or_else(|| charger.map(|(x, y)| (x - 10, y - 10, x + 10, y + 10)));
    let Some((min_x, min_y, max_x, max_y)) = bbox else {
        return encode(&canvas);
    };

    let box_w = (max_x - min_x + 1) as f64;
    let box_h = (max_y - min_y + 1) as f64;
    let scale = (width as f64 / box_w).min(height as f64 / box_h);
    let offset_x = (width as f64 - box_w * scale) / 2.0;
    let offset_y = (height as f64 - box_h * scale) / 2.0;
    let project = |x: f64, y: f64| -> (f64, f64) {
        (
            offset_x + (x - min_x as f64) * scale,
            offset_y + (y - min_y as f64) * scale,
        )
    };

    if let Some(grid) = &grid {
        for y in 0..grid.rows {
            for x in 0..grid.cols {
                let color = match grid.get(x, y) {
                    Cell::Empty => continue,
                    Cell::Wall => COLOR_WALL,
                    Cell::Floor => COLOR_FLOOR,
                };
                let (x0, y0) = project(x as f64, y as f64);
                let (x1, y1) = project(x as f64 + 1.0, y as f64 + 1.0);
                fill_rect(&mut canvas, x0, y0, x1, y1, color);
            }
        }
    }

    let marker_radius = (scale * 0.6).clamp(3.0, 12.0);
    let dot_radius = (marker_radius * 0.35).max(1.0);

    for segment in track.windows(2) {
        let (x0, y0) = project(segment[0].0 as f64 + 0.5, segment[0].1 as f64 + 0.5);
        let (x1, y1) = project(segment[1].0 as f64 + 0.5, segment[1].1 as f64 + 0.5);
        draw_dotted_segment(&mut canvas, x0, y0, x1, y1, dot_radius);
    }

    if let Some((x, y)) = charger {
        let (px, py) = project(x as f64 + 0.5, y as f64 + 0.5);
        fill_disc(&mut canvas, px, py, marker_radius, COLOR_CHARGER);
    }
    if let Some((x, y)) = track.last() {
        let (px, py) = project(*x as f64 + 0.5, *y as f64 + 0.5);
        fill_disc(&mut canvas, px, py, marker_radius, COLOR_ROBOT);
    }

    encode(&canvas)
}

fn encode(canvas: &RgbImage) -> Result<Vec<u8>, MapError> {
    let mut bytes = Cursor::new(Vec::new());
    image::DynamicImage::ImageRgb8(canvas.clone()).write_to(&mut bytes, ImageFormat::Png)?;
    Ok(bytes.into_inner())
}

fn fill_rect(canvas: &mut RgbImage, x0: f64, y0: f64, x1: f64, y1: f64, color: Rgb<u8>) {
    let x_start = x0.floor().max(0.0) as u32;
    let y_start = y0.floor().max(0.0) as u32;
    let x_end = (x1.ceil().min(canvas.width() as f64)) as u32;
    let y_end = (y1.ceil().min(canvas.height() as f64)) as u32;
    for y in y_start..y_end {
        for x in x_start..x_end {
            canvas.put_pixel(x, y, color);
        }
    }
}

fn fill_disc(canvas: &mut RgbImage, cx: f64, cy: f64, radius: f64, color: Rgb<u8>) {
    let x_start = (cx - radius).floor().max(0.0) as u32;
    let y_start = (cy - radius).floor().max(0.0) as u32;
    let x_end = ((cx + radius).ceil().min(canvas.width() as f64)).max(0.0) as u32;
    let y_end = ((cy + radius).ceil().min(canvas.height() as f64)).max(0.0) as u32;
    for y in y_start..y_end {
        for x in x_start..x_end {
            let dx = x as f64 + 0.5 - cx;
            let dy = y as f64 + 0.5 - cy;
            if dx * dx + dy * dy <= radius * radius {
                canvas.put_pixel(x, y, color);
            }
        }
    }
}

fn draw_dotted_segment(canvas: &mut RgbImage, x0: f64, y0: f64, x1: f64, y1: f64, radius: f64) {
    let length = ((x1 - x0).powi(2) + (y1 - y0).powi(2)).sqrt();
    let spacing = (radius * 3.0).max(2.0);
    let dots = (length / spacing).floor() as u32;
    for i in 0..=dots {
        let t = if dots == 0 { 0.0 } else { i as f64 / dots as f64 };
        let x = x0 + (x1 - x0) * t;
        let y = y0 + (y1 - y0) * t;
        fill_disc(canvas, x, y, radius, COLOR_TRACK);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PNG_MAGIC: &[u8] = &[0x89, b'P', b'N', b'G'];

    /// Build a grid payload: reserved header, dims, then (pattern, repeat)
    /// run-length entries.
    fn grid_payload(rows: u16, cols: u16, entries: &[(u8, u32)]) -> String {
        let mut data = vec![0u8; 4];
        data.extend_from_slice(&rows.to_le_bytes());
        data.extend_from_slice(&cols.to_le_bytes());
        for (pattern, repeat) in entries {
            data.push(*pattern);
            let bytes = repeat.to_le_bytes();
            data.extend_from_slice(&bytes[..3]);
        }
        BASE64.encode(data)
    }

    fn status_with(fields: &[(&str, &str)]) -> StatusCache {
        let mut status = StatusCache::new();
        for (key, value) in fields {
            assert!(status.set(key, value.to_string()));
        }
        status
    }

    #[test]
    fn test_grid_decode() {
        // 2x4 grid: one byte of four floor cells, one byte of four walls.
        let payload = grid_payload(2, 4, &[(0b1010_1010, 1), (0b0101_0101, 1)]);
        let grid = Grid::decode(&payload).unwrap();
        assert_eq!((grid.rows, grid.cols), (2, 4));
        assert!((0..4).all(|x| grid.get(x, 0) == Cell::Floor));
        assert!((0..4).all(|x| grid.get(x, 1) == Cell::Wall));
        assert_eq!(grid.bounding_box(), Some((0, 0, 3, 1)));
    }

    #[test]
    fn test_grid_decode_repeat_and_truncation() {
        // Repeat covers more cells than the grid holds; decode caps at size.
        let payload = grid_payload(4, 4, &[(0b1010_1010, 100)]);
        let grid = Grid::decode(&payload).unwrap();
        assert_eq!(grid.cells.len(), 16);

        // Short run-length data pads the tail with empty cells.
        let payload = grid_payload(4, 4, &[(0b0101_0101, 1)]);
        let grid = Grid::decode(&payload).unwrap();
        assert_eq!(grid.get(0, 0), Cell::Wall);
        assert_eq!(grid.get(3, 3), Cell::Empty);
    }

    #[test]
    fn test_grid_decode_rejects_garbage() {
        assert!(Grid::decode("definitely not base64!!!").is_none());
        assert!(Grid::decode(&BASE64.encode([0u8; 4])).is_none());
        // Zero-sized grid, as some firmware revisions emit.
        assert!(Grid::decode(&grid_payload(0, 100, &[(0x6a, 500)])).is_none());
    }

    #[test]
    fn test_track_decode() {
        // Payload observed from a real device: four points near grid center.
        let track = decode_track("AQAEADIxMzExMTEy");
        assert_eq!(track, vec![(50, 49), (51, 49), (49, 49), (49, 50)]);
    }

    #[test]
    fn test_charger_decode() {
        assert_eq!(decode_charger("12,34"), Some((12, 34)));
        assert_eq!(decode_charger("-1,-1"), Some((-1, -1)));
        assert_eq!(decode_charger("nowhere"), None);
    }

    #[test]
    fn test_render_blank_without_telemetry() {
        let png = render(&StatusCache::new(), 64, 64).unwrap();
        assert_eq!(&png[..4], PNG_MAGIC);
    }

    #[test]
    fn test_render_with_grid_and_track() {
        let status = status_with(&[
            ("map", &grid_payload(8, 8, &[(0b1010_1010, 16)])),
            ("track", "AQAEADIxMzExMTEy"),
            ("chargerPos", "3,3"),
        ]);
        let png = render(&status, 128, 96).unwrap();
        assert_eq!(&png[..4], PNG_MAGIC);
    }

    #[test]
    fn test_render_falls_back_to_charger() {
        let status = status_with(&[("chargerPos", "5,5")]);
        let png = render(&status, 64, 64).unwrap();
        assert_eq!(&png[..4], PNG_MAGIC);
    }

    #[test]
    fn test_render_size_validation() {
        let mut params = Params::new();
        assert_eq!(render_size(&params).unwrap(), (DEFAULT_SIZE, DEFAULT_SIZE));

        params.insert("width".into(), "320".into());
        params.insert("height".into(), "200".into());
        assert_eq!(render_size(&params).unwrap(), (320, 200));

        params.insert("width".into(), "0".into());
        assert_eq!(render_size(&params).unwrap_err().code(), 7);
        params.insert("width".into(), "huge".into());
        assert_eq!(render_size(&params).unwrap_err().code(), 7);
    }
}

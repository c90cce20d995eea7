//! Saliency heatmap to binary mask.
//!
//! A heatmap is min-max normalized, then either cut at a fixed level or
//! quantized to 8 bits and split with Otsu's method. On the Otsu path the
//! binary image is traced into contours and the contours are filled, so holes
//! inside a region end up in the mask.

use image::{GrayImage, Luma};
use imageproc::contours::find_contours;
use imageproc::contrast::otsu_level;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::mask::BinaryMask;
use crate::params::{FillConvention, FillRule, RasterParams, Smoothing};
use crate::raster;
use crate::types::HeatmapRecord;

/// A 2-D saliency map, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct Heatmap {
    h: u32,
    w: u32,
    values: Vec<f32>,
}

impl Heatmap {
    /// Values must be finite and the grid non-empty.
    pub fn from_vec(h: u32, w: u32, values: Vec<f32>) -> Result<Self> {
        if h == 0 || w == 0 {
            return Err(Error::format(format!("empty heatmap {}x{}", h, w)));
        }
        if values.len() != (h as usize) * (w as usize) {
            return Err(Error::format(format!(
                "heatmap has {} values, expected {}x{}",
                values.len(),
                h,
                w
            )));
        }
        if values.iter().any(|v| !v.is_finite()) {
            return Err(Error::format("heatmap contains a non-finite value"));
        }
        Ok(Heatmap { h, w, values })
    }

    pub fn from_rows(rows: &[Vec<f32>]) -> Result<Self> {
        let h = rows.len();
        let w = rows.first().map_or(0, Vec::len);
        if rows.iter().any(|r| r.len() != w) {
            return Err(Error::format("heatmap rows have different lengths"));
        }
        Self::from_vec(h as u32, w as u32, rows.concat())
    }

    pub fn height(&self) -> u32 {
        self.h
    }

    pub fn width(&self) -> u32 {
        self.w
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.h as usize, self.w as usize)
    }

    pub fn get(&self, x: u32, y: u32) -> f32 {
        self.values[(y as usize) * (self.w as usize) + x as usize]
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.values
    }

    /// Rescale to `[0, 1]`. A flat map has no scale and gives `None`.
    pub fn normalize(&self) -> Option<Heatmap> {
        let min = self.values.iter().copied().fold(f32::INFINITY, f32::min);
        let max = self.values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let range = max - min;
        if range <= 0.0 {
            return None;
        }
        Some(Heatmap {
            h: self.h,
            w: self.w,
            values: self.values.iter().map(|v| (v - min) / range).collect(),
        })
    }

    /// Bilinear resample onto `h x w` with half-pixel centres and no corner
    /// alignment.
    pub fn resize_bilinear(&self, h: u32, w: u32) -> Result<Heatmap> {
        if h == 0 || w == 0 {
            return Err(Error::InvalidArgument(format!(
                "resize target must be positive, got {}x{}",
                h, w
            )));
        }
        if (h, w) == (self.h, self.w) {
            return Ok(self.clone());
        }
        let cols: Vec<_> = (0..w).map(|x| source_index(x, self.w, w)).collect();
        let mut values = Vec::with_capacity((h as usize) * (w as usize));
        for y in 0..h {
            let (y0, y1, ly) = source_index(y, self.h, h);
            for &(x0, x1, lx) in &cols {
                let top = self.get(x0, y0) * (1.0 - lx) + self.get(x1, y0) * lx;
                let bottom = self.get(x0, y1) * (1.0 - lx) + self.get(x1, y1) * lx;
                values.push(top * (1.0 - ly) + bottom * ly);
            }
        }
        Ok(Heatmap { h, w, values })
    }

    /// `uint8(255 * v)` for a map already in `[0, 1]`.
    pub fn quantize(&self) -> GrayImage {
        GrayImage::from_fn(self.w, self.h, |x, y| Luma([(255.0 * self.get(x, y)) as u8]))
    }

    /// `(x, y)` of the largest value, first in row-major order on ties.
    pub fn peak(&self) -> (u32, u32) {
        let mut best = 0;
        for (i, &v) in self.values.iter().enumerate() {
            if v > self.values[best] {
                best = i;
            }
        }
        ((best % self.w as usize) as u32, (best / self.w as usize) as u32)
    }
}

fn source_index(dst: u32, src_len: u32, dst_len: u32) -> (u32, u32, f32) {
    let scale = src_len as f64 / dst_len as f64;
    let src = ((dst as f64 + 0.5) * scale - 0.5).max(0.0);
    let i0 = (src.floor() as u32).min(src_len - 1);
    let i1 = (i0 + 1).min(src_len - 1);
    (i0, i1, (src - i0 as f64) as f32)
}

/// How the binarization level is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum ThresholdMode {
    /// Otsu's method on the quantized (and optionally smoothed) map.
    #[default]
    Otsu,
    /// Keep pixels whose normalized value is strictly above the level.
    Fixed(f64),
}

impl From<Option<f64>> for ThresholdMode {
    fn from(level: Option<f64>) -> Self {
        level.map_or(ThresholdMode::Otsu, ThresholdMode::Fixed)
    }
}

/// Settings for one (image, task) unit.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ThresholdParams {
    pub mode: ThresholdMode,
    /// Only used on the Otsu path.
    pub smoothing: Smoothing,
    /// Units whose probability is below this get an empty mask.
    pub prob_cutoff: f64,
}

/// Binarize a heatmap that is already at its target resolution.
pub fn threshold_heatmap(heatmap: &Heatmap, mode: ThresholdMode, smoothing: Smoothing) -> BinaryMask {
    let (h, w) = (heatmap.height(), heatmap.width());
    let Some(norm) = heatmap.normalize() else {
        warn!(h, w, "flat heatmap, emitting an empty mask");
        return BinaryMask::zeros(h, w);
    };
    match mode {
        ThresholdMode::Fixed(level) => {
            BinaryMask::from_fn(h, w, |x, y| norm.get(x, y) as f64 > level)
        }
        ThresholdMode::Otsu => otsu_mask(&norm, smoothing),
    }
}

fn otsu_mask(norm: &Heatmap, smoothing: Smoothing) -> BinaryMask {
    let (h, w) = (norm.height(), norm.width());
    let mut gray = norm.quantize();
    if smoothing.enabled {
        gray = smoothed_luma(&gray, smoothing.kernel);
    }

    let level = otsu_level(&gray);
    let binary = GrayImage::from_fn(w, h, |x, y| {
        Luma([if gray.get_pixel(x, y).0[0] > level { 255 } else { 0 }])
    });

    // Contours are always filled with their outline, whatever the
    // annotation rasterizer is configured to do.
    let fill = RasterParams {
        rule: FillRule::EvenOdd,
        convention: FillConvention::Inclusive,
    };
    let mut mask = BinaryMask::zeros(h, w);
    let contours = find_contours::<i32>(&binary);
    debug!(level, contours = contours.len(), "otsu split");
    for contour in contours {
        if contour.points.len() < 2 {
            continue;
        }
        let poly: Vec<[f64; 2]> = contour
            .points
            .iter()
            .map(|p| [p.x as f64, p.y as f64])
            .collect();
        raster::fill_polygon(&mut mask, &poly, fill);
    }
    mask
}

/// False-colour, blur and invert an 8-bit map ahead of Otsu.
pub fn smoothed_luma(gray: &GrayImage, kernel: u32) -> GrayImage {
    let mut out = box_filter(&jet_luma(gray), kernel);
    for p in out.pixels_mut() {
        p.0[0] = 255 - p.0[0];
    }
    out
}

/// Jet false colour as `[b, g, r]`.
pub fn jet_bgr(v: u8) -> [u8; 3] {
    let x = v as f64 / 255.0;
    let channel = |centre: f64| {
        let c = (1.5 - (4.0 * x - centre).abs()).clamp(0.0, 1.0);
        (255.0 * c).round() as u8
    };
    [channel(1.0), channel(2.0), channel(3.0)]
}

/// Jet-colour every pixel and collapse back to one channel.
///
/// The luma weights are applied to the channels in `[b, g, r]` order, so blue
/// carries the 0.299 weight.
pub fn jet_luma(image: &GrayImage) -> GrayImage {
    let mut lut = [0u8; 256];
    for (v, out) in lut.iter_mut().enumerate() {
        let [c0, c1, c2] = jet_bgr(v as u8);
        let y = 0.299 * c0 as f64 + 0.587 * c1 as f64 + 0.114 * c2 as f64;
        *out = y.round().min(255.0) as u8;
    }
    let mut out = image.clone();
    for p in out.pixels_mut() {
        p.0[0] = lut[p.0[0] as usize];
    }
    out
}

/// Mean over a `k x k` window anchored at `k / 2`, with borders reflected
/// without repeating the edge pixel. `k <= 1` returns the input unchanged.
///
/// Rows then columns are summed exactly and rounded once, so memory depends
/// on the image only, whatever `k` is.
pub fn box_filter(image: &GrayImage, k: u32) -> GrayImage {
    if k <= 1 {
        return image.clone();
    }
    let (w, h) = image.dimensions();
    let (w, h, k) = (w as usize, h as usize, k as usize);
    let anchor = k / 2;

    let mut row_sums = vec![0i128; w * h];
    for y in 0..h {
        let line: Vec<i128> = (0..w)
            .map(|x| image.get_pixel(x as u32, y as u32).0[0] as i128)
            .collect();
        row_sums[y * w..(y + 1) * w].copy_from_slice(&reflected_window_sums(&line, k, anchor));
    }

    let mut sums = vec![0i128; w * h];
    for x in 0..w {
        let column: Vec<i128> = (0..h).map(|y| row_sums[y * w + x]).collect();
        for (y, sum) in reflected_window_sums(&column, k, anchor).into_iter().enumerate() {
            sums[y * w + x] = sum;
        }
    }

    let area = k as f64 * k as f64;
    GrayImage::from_fn(w as u32, h as u32, |x, y| {
        let sum = sums[y as usize * w + x as usize];
        Luma([(sum as f64 / area).round().min(255.0) as u8])
    })
}

/// Sum of every length-`k` window over the reflect-101 extension of `line`;
/// the window for index `i` starts at `i - anchor`.
fn reflected_window_sums(line: &[i128], k: usize, anchor: usize) -> Vec<i128> {
    let n = line.len();
    let k = k as i128;
    if n == 1 {
        return vec![line[0] * k];
    }
    // The extension repeats with this period, so one period of prefix sums
    // covers windows of any length.
    let period = 2 * (n - 1);
    let mut prefix = Vec::with_capacity(period + 1);
    prefix.push(0i128);
    for i in 0..period {
        let last = prefix[i];
        prefix.push(last + line[reflect_101(i as i64, n)]);
    }
    let (p, total) = (period as i128, prefix[period]);
    // Sum over extended indices `[0, m)`, negative `m` included.
    let upto = |m: i128| m.div_euclid(p) * total + prefix[m.rem_euclid(p) as usize];
    (0..n)
        .map(|i| {
            let start = i as i128 - anchor as i128;
            upto(start + k) - upto(start)
        })
        .collect()
}

fn reflect_101(i: i64, n: usize) -> usize {
    if n == 1 {
        return 0;
    }
    let period = 2 * (n as i64 - 1);
    let i = i.rem_euclid(period);
    if i >= n as i64 {
        (period - i) as usize
    } else {
        i as usize
    }
}

/// Threshold a heatmap onto an `(h, w)` canvas, zeroing it when the
/// classifier probability is under the cutoff.
pub fn segment_heatmap(
    heatmap: &Heatmap,
    canvas: (u32, u32),
    prob: f64,
    params: &ThresholdParams,
) -> Result<BinaryMask> {
    let found = heatmap.shape();
    let expected = (canvas.0 as usize, canvas.1 as usize);
    if found != expected {
        return Err(Error::shape(expected, found));
    }
    if prob < params.prob_cutoff {
        debug!(prob, cutoff = params.prob_cutoff, "probability below cutoff");
        return Ok(BinaryMask::zeros(canvas.0, canvas.1));
    }
    Ok(threshold_heatmap(heatmap, params.mode, params.smoothing))
}

/// Resize a raw record to its radiograph and threshold it.
pub fn record_to_mask(record: &HeatmapRecord, params: &ThresholdParams) -> Result<BinaryMask> {
    let (h, w) = record.canvas();
    let prob = record.prob.resolve(&record.task)?;
    let raw = record.map.to_heatmap()?;
    if prob < params.prob_cutoff {
        if h == 0 || w == 0 {
            return Err(Error::format(format!("cxr_dims {:?} is empty", record.cxr_dims)));
        }
        return Ok(BinaryMask::zeros(h, w));
    }
    let resized = raw.resize_bilinear(h, w)?;
    segment_heatmap(&resized, (h, w), prob, params)
}

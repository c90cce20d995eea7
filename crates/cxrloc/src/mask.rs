//! Binary masks and the run-length codec shared by every mask producer.
//!
//! Masks are held row-major, the way heatmaps and annotation canvases are
//! indexed. Runs are taken over the column-major (Fortran order) flattening so
//! that compressed strings are interchangeable with pycocotools `maskApi.c`.

use crate::error::{Error, Result};
use crate::types::{EncodedSegmentation, Rle};

/// An `h x w` grid of 0/1 values, row-major: pixel `(x, y)` is at `y * w + x`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryMask {
    h: u32,
    w: u32,
    data: Vec<u8>,
}

impl BinaryMask {
    pub fn zeros(h: u32, w: u32) -> Self {
        BinaryMask {
            h,
            w,
            data: vec![0; (h as usize) * (w as usize)],
        }
    }

    /// Wrap a row-major buffer. Every value must be 0 or 1.
    pub fn from_vec(h: u32, w: u32, data: Vec<u8>) -> Result<Self> {
        let n = (h as usize) * (w as usize);
        if data.len() != n {
            return Err(Error::format(format!(
                "mask buffer has {} values, expected {}x{}",
                data.len(),
                h,
                w
            )));
        }
        if let Some(v) = data.iter().find(|&&v| v > 1) {
            return Err(Error::format(format!("mask value {} is not 0 or 1", v)));
        }
        Ok(BinaryMask { h, w, data })
    }

    pub fn from_fn(h: u32, w: u32, mut f: impl FnMut(u32, u32) -> bool) -> Self {
        let mut data = Vec::with_capacity((h as usize) * (w as usize));
        for y in 0..h {
            for x in 0..w {
                data.push(f(x, y) as u8);
            }
        }
        BinaryMask { h, w, data }
    }

    pub fn height(&self) -> u32 {
        self.h
    }

    pub fn width(&self) -> u32 {
        self.w
    }

    /// `(h, w)` as usize, the shape reported in mismatch errors.
    pub fn shape(&self) -> (usize, usize) {
        (self.h as usize, self.w as usize)
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }

    /// Out-of-range coordinates read as background.
    pub fn get(&self, x: i64, y: i64) -> bool {
        if x < 0 || y < 0 || x >= self.w as i64 || y >= self.h as i64 {
            return false;
        }
        self.data[(y as usize) * (self.w as usize) + x as usize] != 0
    }

    /// Out-of-range coordinates are ignored.
    pub fn set(&mut self, x: i64, y: i64) {
        if x < 0 || y < 0 || x >= self.w as i64 || y >= self.h as i64 {
            return;
        }
        self.data[(y as usize) * (self.w as usize) + x as usize] = 1;
    }

    pub fn area(&self) -> u64 {
        self.data.iter().map(|&v| v as u64).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.data.iter().all(|&v| v == 0)
    }

    /// In-place logical OR.
    pub fn union_with(&mut self, other: &BinaryMask) -> Result<()> {
        if self.shape() != other.shape() {
            return Err(Error::shape(self.shape(), other.shape()));
        }
        for (a, &b) in self.data.iter_mut().zip(&other.data) {
            *a |= b;
        }
        Ok(())
    }

    pub fn to_rle(&self) -> Rle {
        let (h, w) = self.shape();
        let mut col_major = vec![0u8; h * w];
        for y in 0..h {
            for x in 0..w {
                col_major[y + h * x] = self.data[y * w + x];
            }
        }
        encode(&col_major, self.h, self.w)
    }

    pub fn from_rle(rle: &Rle) -> Result<Self> {
        rle.validate()?;
        let col_major = decode(rle);
        let (h, w) = (rle.h as usize, rle.w as usize);
        let mut data = vec![0u8; h * w];
        for y in 0..h {
            for x in 0..w {
                data[y * w + x] = col_major[y + h * x];
            }
        }
        Ok(BinaryMask {
            h: rle.h,
            w: rle.w,
            data,
        })
    }

    pub fn encode(&self) -> EncodedSegmentation {
        EncodedSegmentation::from(&self.to_rle())
    }

    pub fn decode(seg: &EncodedSegmentation) -> Result<Self> {
        Self::from_rle(&seg.to_rle()?)
    }
}

/// Encode a column-major binary mask into RLE.
///
/// `mask` is stored in column-major order: pixel (x, y) is at index `y + h * x`.
///
/// # Panics
/// If `mask.len() != h * w`.
pub fn encode(mask: &[u8], h: u32, w: u32) -> Rle {
    let n = (h as usize) * (w as usize);
    assert_eq!(mask.len(), n, "mask length must equal h*w");

    let mut counts = Vec::new();
    let mut p: u8 = 0;
    let mut c: u32 = 0;

    for &v in mask {
        let v = (v != 0) as u8;
        if v != p {
            counts.push(c);
            c = 0;
            p = v;
        }
        c += 1;
    }
    counts.push(c);

    Rle { h, w, counts }
}

/// Decode an RLE to a column-major binary mask of size `h * w`.
///
/// Runs past the end of the canvas are clipped; call [`Rle::validate`] first
/// when the RLE comes from outside the crate.
pub fn decode(rle: &Rle) -> Vec<u8> {
    let n = (rle.h as usize) * (rle.w as usize);
    let mut mask = vec![0u8; n];
    let mut idx = 0usize;
    let mut v = 0u8;
    for &c in &rle.counts {
        let end = (idx + c as usize).min(n);
        if v == 1 {
            mask[idx.min(n)..end].fill(1);
        }
        idx += c as usize;
        v = 1 - v;
    }
    mask
}

/// Number of foreground pixels: the sum of the odd-indexed runs.
pub fn area(rle: &Rle) -> u64 {
    rle.counts.iter().skip(1).step_by(2).map(|&c| c as u64).sum()
}

/// Intersection area of two same-shaped RLE masks without decoding either.
///
/// Walks both run streams simultaneously and only accumulates where both are
/// foreground.
pub fn intersection_area(a: &Rle, b: &Rle) -> u64 {
    let n = (a.h as u64) * (a.w as u64);
    let mut ca = 0u64;
    let mut cb = 0u64;
    let mut va = false;
    let mut vb = false;
    let mut ai = 0usize;
    let mut bi = 0usize;
    let mut total = 0u64;
    let mut count = 0u64;

    while total < n {
        // Skip 0-length runs
        while ca == 0 && ai < a.counts.len() {
            ca = a.counts[ai] as u64;
            va = ai % 2 == 1;
            ai += 1;
        }
        while cb == 0 && bi < b.counts.len() {
            cb = b.counts[bi] as u64;
            vb = bi % 2 == 1;
            bi += 1;
        }
        if ca == 0 || cb == 0 {
            break;
        }

        let step = ca.min(cb);
        if va && vb {
            count += step;
        }
        ca -= step;
        cb -= step;
        total += step;
    }

    count
}

/// Intersection-over-union of two masks.
///
/// Two empty masks have no positive overlap, so their IoU is 0 rather than NaN.
pub fn iou(a: &Rle, b: &Rle) -> Result<f64> {
    if (a.h, a.w) != (b.h, b.w) {
        return Err(Error::shape(
            (a.h as usize, a.w as usize),
            (b.h as usize, b.w as usize),
        ));
    }
    let inter = intersection_area(a, b) as f64;
    let union = area(a) as f64 + area(b) as f64 - inter;
    if union == 0.0 {
        Ok(0.0)
    } else {
        Ok(inter / union)
    }
}

/// Compress an RLE into the COCO counts string.
///
/// Runs after the third are written as the difference from the run two
/// places earlier. Each value is emitted in little-endian 5-bit groups with
/// `0x20` as the continuation bit and `0x10` on the final group as the sign,
/// offset into printable ASCII by 48.
pub fn rle_to_string(rle: &Rle) -> String {
    let mut s = String::with_capacity(rle.counts.len() * 2);
    for (i, &cnt) in rle.counts.iter().enumerate() {
        let mut x = cnt as i64;
        if i > 2 {
            x -= rle.counts[i - 2] as i64;
        }
        push_count(&mut s, x);
    }
    s
}

fn push_count(s: &mut String, mut x: i64) {
    loop {
        let mut c = (x & 0x1f) as u8;
        x >>= 5;
        let more = if c & 0x10 != 0 { x != -1 } else { x != 0 };
        if more {
            c |= 0x20;
        }
        s.push((c + 48) as char);
        if !more {
            break;
        }
    }
}

// 12 groups of 5 bits cover any run of a u32-sized canvas plus sign.
const MAX_GROUPS: u32 = 12;

/// Decompress a COCO counts string for an `h x w` canvas.
///
/// Fails on characters outside the alphabet, a value cut off mid-way, negative
/// runs, or runs that do not cover the canvas exactly.
pub fn rle_from_string(s: &str, h: u32, w: u32) -> Result<Rle> {
    let bytes = s.as_bytes();
    let mut counts: Vec<u32> = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let mut x: i64 = 0;
        let mut k = 0u32;
        loop {
            let Some(&b) = bytes.get(i) else {
                return Err(Error::format("counts string ends in the middle of a run"));
            };
            if !(48..48 + 64).contains(&b) {
                return Err(Error::format(format!(
                    "invalid character {:?} at offset {} in counts string",
                    b as char, i
                )));
            }
            if k == MAX_GROUPS {
                return Err(Error::format(format!("run at offset {} is too long", i)));
            }
            let c = (b - 48) as i64;
            x |= (c & 0x1f) << (5 * k);
            i += 1;
            k += 1;
            if c & 0x20 == 0 {
                if c & 0x10 != 0 {
                    x |= -1i64 << (5 * k);
                }
                break;
            }
        }
        if counts.len() > 2 {
            x += counts[counts.len() - 2] as i64;
        }
        if x < 0 || x > u32::MAX as i64 {
            return Err(Error::format(format!(
                "run {} decodes to out-of-range length {}",
                counts.len(),
                x
            )));
        }
        counts.push(x as u32);
    }

    let rle = Rle { h, w, counts };
    rle.validate()?;
    Ok(rle)
}

//! Scanline polygon fill onto a binary canvas.
//!
//! Pixel `(x, y)` sits at integer coordinates, so a vertex at `(2, 2)` is the
//! centre of the third pixel in the third row.

use crate::error::{Error, Result};
use crate::mask::BinaryMask;
use crate::params::{FillConvention, FillRule, RasterParams};
use crate::types::Polygon;

/// Rasterize a set of polygons onto an `h x w` canvas and union the results.
///
/// An empty set produces an all-zero mask.
pub fn polygons_to_mask(
    polygons: &[Polygon],
    h: u32,
    w: u32,
    params: RasterParams,
) -> Result<BinaryMask> {
    if h == 0 || w == 0 {
        return Err(Error::InvalidArgument(format!(
            "canvas must be positive, got {}x{}",
            h, w
        )));
    }
    let mut mask = BinaryMask::zeros(h, w);
    for poly in polygons {
        if let Some(v) = poly.iter().flatten().find(|v| !v.is_finite()) {
            return Err(Error::format(format!("polygon vertex coordinate {}", v)));
        }
        fill_polygon(&mut mask, poly, params);
    }
    Ok(mask)
}

/// Paint one polygon into `mask`. Pixels already set stay set.
pub fn fill_polygon(mask: &mut BinaryMask, poly: &[[f64; 2]], params: RasterParams) {
    if poly.is_empty() {
        return;
    }
    let offset = match params.convention {
        FillConvention::Inclusive => 0.0,
        FillConvention::Exclusive => 0.5,
    };
    fill_interior(mask, poly, params.rule, offset);
    if params.convention == FillConvention::Inclusive {
        let k = poly.len();
        for j in 0..k {
            draw_edge(mask, poly[j], poly[(j + 1) % k]);
        }
    }
}

/// Fill every pixel whose sample point `(x + offset, y + offset)` is inside.
fn fill_interior(mask: &mut BinaryMask, poly: &[[f64; 2]], rule: FillRule, offset: f64) {
    let (h, w) = (mask.height() as i64, mask.width() as i64);
    let k = poly.len();
    if k < 3 {
        return;
    }
    let y_min = poly.iter().map(|p| p[1]).fold(f64::INFINITY, f64::min);
    let y_max = poly.iter().map(|p| p[1]).fold(f64::NEG_INFINITY, f64::max);
    let row_lo = ((y_min - offset).ceil() as i64).max(0);
    let row_hi = ((y_max - offset).ceil() as i64).min(h);

    let mut crossings: Vec<(f64, i32)> = Vec::with_capacity(k);
    for y in row_lo..row_hi {
        let ys = y as f64 + offset;
        crossings.clear();
        for j in 0..k {
            let [x0, y0] = poly[j];
            let [x1, y1] = poly[(j + 1) % k];
            // Half-open in y so a vertex shared by two edges is counted once.
            let dir = if y0 <= ys && ys < y1 {
                1
            } else if y1 <= ys && ys < y0 {
                -1
            } else {
                continue;
            };
            let x = x0 + (ys - y0) * (x1 - x0) / (y1 - y0);
            crossings.push((x, dir));
        }
        crossings.sort_by(|a, b| a.0.total_cmp(&b.0));

        let mut winding = 0;
        for pair in crossings.windows(2) {
            winding += pair[0].1;
            let inside = match rule {
                FillRule::EvenOdd => winding % 2 != 0,
                FillRule::NonZero => winding != 0,
            };
            if !inside {
                continue;
            }
            let from = ((pair[0].0 - offset).ceil() as i64).max(0);
            let to = ((pair[1].0 - offset).ceil() as i64).min(w);
            for x in from..to {
                mask.set(x, y);
            }
        }
    }
}

/// Bresenham walk between two vertices, clipped to just outside the canvas.
fn draw_edge(mask: &mut BinaryMask, a: [f64; 2], b: [f64; 2]) {
    let Some((a, b)) = clip_segment(a, b, mask.width() as f64, mask.height() as f64) else {
        return;
    };
    let (mut x0, mut y0) = (a[0].round() as i64, a[1].round() as i64);
    let (x1, y1) = (b[0].round() as i64, b[1].round() as i64);
    let dx = (x1 - x0).abs();
    let dy = -(y1 - y0).abs();
    let sx = if x0 < x1 { 1 } else { -1 };
    let sy = if y0 < y1 { 1 } else { -1 };
    let mut err = dx + dy;
    loop {
        mask.set(x0, y0);
        if x0 == x1 && y0 == y1 {
            break;
        }
        let e2 = 2 * err;
        if e2 >= dy {
            err += dy;
            x0 += sx;
        }
        if e2 <= dx {
            err += dx;
            y0 += sy;
        }
    }
}

/// Liang-Barsky clip of segment `a-b` to `[-1, w] x [-1, h]`.
fn clip_segment(a: [f64; 2], b: [f64; 2], w: f64, h: f64) -> Option<([f64; 2], [f64; 2])> {
    let dx = b[0] - a[0];
    let dy = b[1] - a[1];
    let mut t0 = 0.0f64;
    let mut t1 = 1.0f64;
    for (p, q) in [
        (-dx, a[0] + 1.0),
        (dx, w - a[0]),
        (-dy, a[1] + 1.0),
        (dy, h - a[1]),
    ] {
        if p == 0.0 {
            if q < 0.0 {
                return None;
            }
            continue;
        }
        let r = q / p;
        if p < 0.0 {
            if r > t1 {
                return None;
            }
            t0 = t0.max(r);
        } else {
            if r < t0 {
                return None;
            }
            t1 = t1.min(r);
        }
    }
    Some((
        [a[0] + t0 * dx, a[1] + t0 * dy],
        [a[0] + t1 * dx, a[1] + t1 * dy],
    ))
}

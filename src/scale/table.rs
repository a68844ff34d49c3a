//! Bilinear resample table construction (spec section 4.D step 6): for
//! scale factors other than 1 or 0.5, precompute four source byte offsets
//! and blend weights per target pixel.

use crate::rational::Rational;

/// Four source-pixel byte offsets and matching bilinear weights for one
/// target pixel, in the order (x0,y0), (x1,y0), (x0,y1), (x1,y1).
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Sample {
    pub pos: [usize; 4],
    pub factor: [f32; 4],
}

/// Per-stream precomputed resample table: one `Sample` per target pixel,
/// row-major over `sw x sh`.
#[derive(Debug)]
pub struct ResampleTable {
    pub sw: u32,
    pub sh: u32,
    pub samples: Vec<Sample>,
}

impl ResampleTable {
    pub fn sample(&self, x: u32, y: u32) -> &Sample {
        &self.samples[(y * self.sw + x) as usize]
    }
}

/// Finds the smallest fractional stride `d = (w - r) / sw`, for the
/// smallest non-negative integer `r`, such that both `d*(sh-1)+1 <= h`
/// and `d*(sw-1)+1 <= w` hold. Written as a short-circuit `||` loop
/// condition: keep advancing `r` while either inequality still fails.
pub fn find_stride(w: u32, h: u32, sw: u32, sh: u32) -> Rational {
    let mut r: i64 = 0;
    loop {
        let d = Rational::new(w as i64 - r, sw as i64).as_f64();
        let fails_height = d * (sh as f64 - 1.0) + 1.0 > h as f64;
        let fails_width = d * (sw as f64 - 1.0) + 1.0 > w as f64;
        if fails_height || fails_width {
            r += 1;
        } else {
            return Rational::new(w as i64 - r, sw as i64);
        }
    }
}

/// Builds the resample table for a `w x h` source of `src_bpp` bytes per
/// pixel, row stride `row` bytes, downscaled to `sw x sh`.
pub fn build(w: u32, h: u32, src_bpp: usize, row: usize, sw: u32, sh: u32) -> ResampleTable {
    let d = find_stride(w, h, sw, sh).as_f64();
    let mut samples = Vec::with_capacity(sw as usize * sh as usize);

    let offset = |xx: u32, yy: u32| yy as usize * row + xx as usize * src_bpp;

    for y in 0..sh {
        for x in 0..sw {
            let fx = x as f64 * d;
            let fy = y as f64 * d;
            let x0 = fx.floor() as u32;
            let y0 = fy.floor() as u32;
            let a = (fx - x0 as f64) as f32;
            let b = (fy - y0 as f64) as f32;
            let x1 = (x0 + 1).min(w.saturating_sub(1));
            let y1 = (y0 + 1).min(h.saturating_sub(1));

            samples.push(Sample {
                pos: [offset(x0, y0), offset(x1, y0), offset(x0, y1), offset(x1, y1)],
                factor: [(1.0 - a) * (1.0 - b), a * (1.0 - b), (1.0 - a) * b, a * b],
            });
        }
    }

    ResampleTable { sw, sh, samples }
}

//! Discrete wavelet transform: reversible 5-3 integer lifting and
//! irreversible 9-7 float lifting, forward and inverse.
//!
//! A tile-component buffer keeps the usual pyramid layout: at every stage
//! resolution r occupies the top-left corner, lows packed before highs
//! along each axis. The forward transform runs vertical-then-horizontal
//! per level, the inverse horizontal-then-vertical, so the pair is an
//! exact inverse and matches the Annex F synthesis order. The parity of a
//! resolution's canvas origin selects the lifting phase (`cas`).

/// Lifting constants of the 9-7 filter (Table F.4).
const ALPHA: f32 = -1.586_134_3;
const BETA: f32 = -0.052_980_118;
const GAMMA: f32 = 0.882_911_1;
const DELTA: f32 = 0.443_506_85;
const KAPPA: f32 = 1.230_174_1;

/// L2 norms of the 5-3 synthesis basis per (orientation, level), used by
/// rate control.
#[rustfmt::skip]
static DWT_NORMS: [[f64; 10]; 4] = [
  [1.000, 1.500, 2.750, 5.375, 10.68, 21.34, 42.67, 85.33, 170.7, 341.3],
  [1.038, 1.592, 2.919, 5.703, 11.33, 22.64, 45.25, 90.48, 180.9, 0.0],
  [1.038, 1.592, 2.919, 5.703, 11.33, 22.64, 45.25, 90.48, 180.9, 0.0],
  [0.7186, 0.9218, 1.586, 3.043, 6.019, 12.01, 24.00, 47.97, 95.93, 0.0],
];

/// L2 norms of the 9-7 synthesis basis per (orientation, level).
#[rustfmt::skip]
static DWT_NORMS_REAL: [[f64; 10]; 4] = [
  [1.000, 1.965, 4.177, 8.403, 16.90, 33.84, 67.69, 135.3, 270.6, 540.9],
  [2.022, 3.989, 8.355, 17.04, 34.27, 68.63, 137.3, 274.6, 549.0, 0.0],
  [2.022, 3.989, 8.355, 17.04, 34.27, 68.63, 137.3, 274.6, 549.0, 0.0],
  [2.080, 3.865, 8.307, 17.18, 34.71, 69.59, 139.3, 278.6, 557.2, 0.0],
];

pub(crate) fn getnorm(level: u32, orient: u32) -> f64 {
  let level = if orient == 0 {
    level.min(9)
  } else {
    level.min(8)
  };
  DWT_NORMS[orient as usize][level as usize]
}

pub(crate) fn getnorm_real(level: u32, orient: u32) -> f64 {
  let level = if orient == 0 {
    level.min(9)
  } else {
    level.min(8)
  };
  DWT_NORMS_REAL[orient as usize][level as usize]
}

/// One decomposition stage: the (w, h) of the finer region being split,
/// the low-part counts from the coarser region, and the phase parities.
#[derive(Debug, Clone, Copy)]
pub(crate) struct LevelGeom {
  pub rw: u32,
  pub rh: u32,
  pub sn_h: u32,
  pub sn_v: u32,
  pub cas_h: u32,
  pub cas_v: u32,
}

impl LevelGeom {
  /// Stages from finest to coarsest. `dims[r]` / `origins[r]` describe
  /// resolution r (0 = lowest).
  pub fn stages(dims: &[(u32, u32)], origins: &[(i32, i32)]) -> Vec<LevelGeom> {
    let mut stages = Vec::new();
    for r in (1..dims.len()).rev() {
      let (rw, rh) = dims[r];
      let (rw1, rh1) = dims[r - 1];
      stages.push(LevelGeom {
        rw,
        rh,
        sn_h: rw1,
        sn_v: rh1,
        cas_h: (origins[r].0 & 1) as u32,
        cas_v: (origins[r].1 & 1) as u32,
      });
    }
    stages
  }
}

// Interleaved-signal accessors with edge clamping. For distance-1 reach
// the clamp equals the periodic symmetric extension of F.3.7.
macro_rules! lift_53 {
  (fwd, $a:ident, $dn:expr, $sn:expr, $cas:expr) => {{
    let (dn, sn) = ($dn as i64, $sn as i64);
    let s = |a: &[i32], i: i64| a[(i.clamp(0, sn - 1) * 2 + $cas) as usize];
    let d = |a: &[i32], i: i64| a[(i.clamp(0, dn - 1) * 2 + 1 - $cas) as usize];
    if $cas == 0 {
      if dn > 0 || sn > 1 {
        for i in 0..dn {
          $a[(i * 2 + 1) as usize] -= (s($a, i) + s($a, i + 1)) >> 1;
        }
        for i in 0..sn {
          $a[(i * 2) as usize] += (d($a, i - 1) + d($a, i) + 2) >> 2;
        }
      }
    } else if sn == 0 && dn == 1 {
      $a[0] *= 2;
    } else {
      for i in 0..dn {
        $a[(i * 2) as usize] -= (s($a, i - 1) + s($a, i)) >> 1;
      }
      for i in 0..sn {
        $a[(i * 2 + 1) as usize] += (d($a, i) + d($a, i + 1) + 2) >> 2;
      }
    }
  }};
  (inv, $a:ident, $dn:expr, $sn:expr, $cas:expr) => {{
    let (dn, sn) = ($dn as i64, $sn as i64);
    let s = |a: &[i32], i: i64| a[(i.clamp(0, sn - 1) * 2 + $cas) as usize];
    let d = |a: &[i32], i: i64| a[(i.clamp(0, dn - 1) * 2 + 1 - $cas) as usize];
    if $cas == 0 {
      if dn > 0 || sn > 1 {
        for i in 0..sn {
          $a[(i * 2) as usize] -= (d($a, i - 1) + d($a, i) + 2) >> 2;
        }
        for i in 0..dn {
          $a[(i * 2 + 1) as usize] += (s($a, i) + s($a, i + 1)) >> 1;
        }
      }
    } else if sn == 0 && dn == 1 {
      $a[0] /= 2;
    } else {
      for i in 0..sn {
        $a[(i * 2 + 1) as usize] -= (d($a, i) + d($a, i + 1) + 2) >> 2;
      }
      for i in 0..dn {
        $a[(i * 2) as usize] += (s($a, i - 1) + s($a, i)) >> 1;
      }
    }
  }};
}

fn fwd_lift_53(a: &mut [i32], dn: u32, sn: u32, cas: u32) {
  let cas = cas as i64;
  lift_53!(fwd, a, dn, sn, cas);
}

fn inv_lift_53(a: &mut [i32], dn: u32, sn: u32, cas: u32) {
  let cas = cas as i64;
  lift_53!(inv, a, dn, sn, cas);
}

fn fwd_lift_97(a: &mut [f32], dn: u32, sn: u32, cas: u32) {
  let (dn, sn, cas) = (dn as i64, sn as i64, cas as i64);
  if sn + dn == 1 {
    if cas == 1 {
      a[0] *= 2.0;
    }
    return;
  }
  let s = |a: &[f32], i: i64| a[(i.clamp(0, sn - 1) * 2 + cas) as usize];
  let d = |a: &[f32], i: i64| a[(i.clamp(0, dn - 1) * 2 + 1 - cas) as usize];
  let di = |i: i64| (i * 2 + 1 - cas) as usize;
  let si = |i: i64| (i * 2 + cas) as usize;
  for i in 0..dn {
    a[di(i)] += ALPHA * (s(a, i - cas) + s(a, i + 1 - cas));
  }
  for i in 0..sn {
    a[si(i)] += BETA * (d(a, i - 1 + cas) + d(a, i + cas));
  }
  for i in 0..dn {
    a[di(i)] += GAMMA * (s(a, i - cas) + s(a, i + 1 - cas));
  }
  for i in 0..sn {
    a[si(i)] += DELTA * (d(a, i - 1 + cas) + d(a, i + cas));
  }
  for i in 0..dn {
    a[di(i)] *= KAPPA;
  }
  for i in 0..sn {
    a[si(i)] /= KAPPA;
  }
}

fn inv_lift_97(a: &mut [f32], dn: u32, sn: u32, cas: u32) {
  let (dn, sn, cas) = (dn as i64, sn as i64, cas as i64);
  if sn + dn == 1 {
    if cas == 1 {
      a[0] /= 2.0;
    }
    return;
  }
  let s = |a: &[f32], i: i64| a[(i.clamp(0, sn - 1) * 2 + cas) as usize];
  let d = |a: &[f32], i: i64| a[(i.clamp(0, dn - 1) * 2 + 1 - cas) as usize];
  let di = |i: i64| (i * 2 + 1 - cas) as usize;
  let si = |i: i64| (i * 2 + cas) as usize;
  for i in 0..sn {
    a[si(i)] *= KAPPA;
  }
  for i in 0..dn {
    a[di(i)] /= KAPPA;
  }
  for i in 0..sn {
    a[si(i)] -= DELTA * (d(a, i - 1 + cas) + d(a, i + cas));
  }
  for i in 0..dn {
    a[di(i)] -= GAMMA * (s(a, i - cas) + s(a, i + 1 - cas));
  }
  for i in 0..sn {
    a[si(i)] -= BETA * (d(a, i - 1 + cas) + d(a, i + cas));
  }
  for i in 0..dn {
    a[di(i)] -= ALPHA * (s(a, i - cas) + s(a, i + 1 - cas));
  }
}

macro_rules! dwt_2d {
  ($ty:ty, $fwd:ident, $inv:ident, $enc_row:ident, $enc_cols:ident, $dec_row:ident, $dec_cols:ident) => {
    /// Forward-transform one row in place: lift, then pack lows before
    /// highs.
    pub(crate) fn $enc_row(row: &mut [$ty], scratch: &mut Vec<$ty>, geom: &LevelGeom) {
      let (rw, sn, cas) = (geom.rw as usize, geom.sn_h as usize, geom.cas_h);
      scratch.clear();
      scratch.extend_from_slice(&row[..rw]);
      $fwd(&mut scratch[..rw], (rw - sn) as u32, sn as u32, cas);
      deinterleave(&scratch[..rw], &mut row[..rw], sn, cas as usize);
    }

    /// Forward-transform the columns of the level region, sequentially.
    pub(crate) fn $enc_cols(data: &mut [$ty], stride: usize, geom: &LevelGeom) {
      let (rw, rh, sn, cas) = (
        geom.rw as usize,
        geom.rh as usize,
        geom.sn_v as usize,
        geom.cas_v,
      );
      let mut scratch: Vec<$ty> = Vec::with_capacity(rh);
      for x in 0..rw {
        scratch.clear();
        scratch.extend((0..rh).map(|y| data[y * stride + x]));
        $fwd(&mut scratch[..rh], (rh - sn) as u32, sn as u32, cas);
        let mut out = vec![<$ty>::default(); rh];
        deinterleave(&scratch[..rh], &mut out, sn, cas as usize);
        for (y, v) in out.into_iter().enumerate() {
          data[y * stride + x] = v;
        }
      }
    }

    /// Inverse-transform one row in place: unpack, then lift.
    pub(crate) fn $dec_row(row: &mut [$ty], scratch: &mut Vec<$ty>, geom: &LevelGeom) {
      let (rw, sn, cas) = (geom.rw as usize, geom.sn_h as usize, geom.cas_h);
      scratch.clear();
      scratch.resize(rw, <$ty>::default());
      interleave(&row[..rw], &mut scratch[..rw], sn, cas as usize);
      $inv(&mut scratch[..rw], (rw - sn) as u32, sn as u32, cas);
      row[..rw].copy_from_slice(&scratch[..rw]);
    }

    /// Inverse-transform the columns of the level region, sequentially.
    pub(crate) fn $dec_cols(data: &mut [$ty], stride: usize, geom: &LevelGeom) {
      let (rw, rh, sn, cas) = (
        geom.rw as usize,
        geom.rh as usize,
        geom.sn_v as usize,
        geom.cas_v,
      );
      let mut col: Vec<$ty> = Vec::with_capacity(rh);
      let mut scratch: Vec<$ty> = vec![<$ty>::default(); rh];
      for x in 0..rw {
        col.clear();
        col.extend((0..rh).map(|y| data[y * stride + x]));
        interleave(&col, &mut scratch[..rh], sn, cas as usize);
        $inv(&mut scratch[..rh], (rh - sn) as u32, sn as u32, cas);
        for (y, &v) in scratch[..rh].iter().enumerate() {
          data[y * stride + x] = v;
        }
      }
    }
  };
}

/// Packed (lows then highs) -> interleaved.
fn interleave<T: Copy>(packed: &[T], out: &mut [T], sn: usize, cas: usize) {
  for (i, &v) in packed[..sn].iter().enumerate() {
    out[i * 2 + cas] = v;
  }
  for (i, &v) in packed[sn..].iter().enumerate() {
    out[i * 2 + 1 - cas] = v;
  }
}

/// Interleaved -> packed (lows then highs).
fn deinterleave<T: Copy>(mixed: &[T], out: &mut [T], sn: usize, cas: usize) {
  for (i, slot) in out[..sn].iter_mut().enumerate() {
    *slot = mixed[i * 2 + cas];
  }
  let dn = mixed.len() - sn;
  for i in 0..dn {
    out[sn + i] = mixed[i * 2 + 1 - cas];
  }
}

dwt_2d!(
  i32,
  fwd_lift_53,
  inv_lift_53,
  encode_row_53,
  encode_cols_53,
  decode_row_53,
  decode_cols_53
);
dwt_2d!(
  f32,
  fwd_lift_97,
  inv_lift_97,
  encode_row_97,
  encode_cols_97,
  decode_row_97,
  decode_cols_97
);

/// Whole-component forward 5-3, finest level first, vertical before
/// horizontal within a level.
pub(crate) fn encode_53(data: &mut [i32], stride: usize, stages: &[LevelGeom]) {
  let mut scratch = Vec::new();
  for geom in stages {
    encode_cols_53(data, stride, geom);
    for y in 0..geom.rh as usize {
      let row = &mut data[y * stride..y * stride + geom.rw as usize];
      encode_row_53(row, &mut scratch, geom);
    }
  }
}

/// Whole-component inverse 5-3, coarsest level first, horizontal before
/// vertical within a level.
pub(crate) fn decode_53(data: &mut [i32], stride: usize, stages: &[LevelGeom]) {
  let mut scratch = Vec::new();
  for geom in stages.iter().rev() {
    for y in 0..geom.rh as usize {
      let row = &mut data[y * stride..y * stride + geom.rw as usize];
      decode_row_53(row, &mut scratch, geom);
    }
    decode_cols_53(data, stride, geom);
  }
}

pub(crate) fn encode_97(data: &mut [f32], stride: usize, stages: &[LevelGeom]) {
  let mut scratch = Vec::new();
  for geom in stages {
    encode_cols_97(data, stride, geom);
    for y in 0..geom.rh as usize {
      let row = &mut data[y * stride..y * stride + geom.rw as usize];
      encode_row_97(row, &mut scratch, geom);
    }
  }
}

pub(crate) fn decode_97(data: &mut [f32], stride: usize, stages: &[LevelGeom]) {
  let mut scratch = Vec::new();
  for geom in stages.iter().rev() {
    for y in 0..geom.rh as usize {
      let row = &mut data[y * stride..y * stride + geom.rw as usize];
      decode_row_97(row, &mut scratch, geom);
    }
    decode_cols_97(data, stride, geom);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::math::ceil_div_pow2_i32;

  fn stages_for(w: u32, h: u32, x0: i32, y0: i32, numres: usize) -> Vec<LevelGeom> {
    let mut dims = Vec::new();
    let mut origins = Vec::new();
    for r in 0..numres {
      let shift = (numres - 1 - r) as u32;
      let rx0 = ceil_div_pow2_i32(x0, shift);
      let ry0 = ceil_div_pow2_i32(y0, shift);
      let rx1 = ceil_div_pow2_i32(x0 + w as i32, shift);
      let ry1 = ceil_div_pow2_i32(y0 + h as i32, shift);
      dims.push(((rx1 - rx0) as u32, (ry1 - ry0) as u32));
      origins.push((rx0, ry0));
    }
    LevelGeom::stages(&dims, &origins)
  }

  fn lcg(n: usize, span: i32) -> Vec<i32> {
    let mut state = 0xfeed_beef_dead_c0deu64;
    (0..n)
      .map(|_| {
        state = state
          .wrapping_mul(6364136223846793005)
          .wrapping_add(1442695040888963407);
        ((state >> 33) as i32 % span) - span / 2
      })
      .collect()
  }

  #[test]
  fn reversible_53_is_exact_inverse() {
    for &(w, h, x0, y0, numres) in &[
      (16u32, 16u32, 0i32, 0i32, 3usize),
      (17, 13, 0, 0, 4),
      (5, 9, 3, 7, 3),
      (1, 8, 0, 0, 2),
      (8, 1, 1, 0, 2),
      (64, 64, 0, 0, 6),
    ] {
      let stages = stages_for(w, h, x0, y0, numres);
      let original = lcg((w * h) as usize, 512);
      let mut data = original.clone();
      encode_53(&mut data, w as usize, &stages);
      assert_ne!(data, original, "transform must change {}x{}", w, h);
      decode_53(&mut data, w as usize, &stages);
      assert_eq!(data, original, "5-3 must invert exactly for {}x{}", w, h);
    }
  }

  #[test]
  fn irreversible_97_close_inverse() {
    let (w, h) = (32u32, 24u32);
    let stages = stages_for(w, h, 0, 0, 4);
    let original: Vec<f32> = lcg((w * h) as usize, 512).iter().map(|&v| v as f32).collect();
    let mut data = original.clone();
    encode_97(&mut data, w as usize, &stages);
    decode_97(&mut data, w as usize, &stages);
    for (a, b) in data.iter().zip(original.iter()) {
      assert!((a - b).abs() < 0.01, "{} vs {}", a, b);
    }
  }

  #[test]
  fn single_sample_level() {
    // A 1x1 component with one decomposition hits the one-element cases.
    let stages = stages_for(1, 1, 1, 1, 2);
    let mut data = vec![7i32];
    encode_53(&mut data, 1, &stages);
    decode_53(&mut data, 1, &stages);
    assert_eq!(data, vec![7]);
  }

  #[test]
  fn norms_monotonic_in_level() {
    for orient in 0..4 {
      for level in 1..8 {
        assert!(getnorm(level, orient) > getnorm(level - 1, orient));
        assert!(getnorm_real(level, orient) > getnorm_real(level - 1, orient));
      }
    }
  }
}

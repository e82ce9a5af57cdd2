//! Multi-component decorrelation transforms: reversible RCT, irreversible
//! ICT, and the N-component custom matrix variant.

/// Norms of the reversible transform basis, for rate control.
static MCT_NORMS: [f64; 3] = [1.732, 0.8292, 0.8292];
/// Norms of the irreversible transform basis.
static MCT_NORMS_REAL: [f64; 3] = [1.732, 1.805, 1.573];

pub(crate) fn norms() -> &'static [f64; 3] {
  &MCT_NORMS
}

pub(crate) fn norms_real() -> &'static [f64; 3] {
  &MCT_NORMS_REAL
}

/// Forward reversible transform, in place.
pub(crate) fn encode(c0: &mut [i32], c1: &mut [i32], c2: &mut [i32]) {
  for ((r, g), b) in c0.iter_mut().zip(c1.iter_mut()).zip(c2.iter_mut()) {
    let y = (*r + *g * 2 + *b) >> 2;
    let u = *b - *g;
    let v = *r - *g;
    *r = y;
    *g = u;
    *b = v;
  }
}

/// Inverse reversible transform, in place; exact inverse of [`encode`].
pub(crate) fn decode(c0: &mut [i32], c1: &mut [i32], c2: &mut [i32]) {
  for ((y, u), v) in c0.iter_mut().zip(c1.iter_mut()).zip(c2.iter_mut()) {
    let g = *y - ((*u + *v) >> 2);
    let r = *v + g;
    let b = *u + g;
    *y = r;
    *u = g;
    *v = b;
  }
}

/// Forward irreversible transform.
pub(crate) fn encode_real(c0: &mut [f32], c1: &mut [f32], c2: &mut [f32]) {
  for ((r, g), b) in c0.iter_mut().zip(c1.iter_mut()).zip(c2.iter_mut()) {
    let y = 0.299 * *r + 0.587 * *g + 0.114 * *b;
    let u = -0.16875 * *r - 0.331260 * *g + 0.5 * *b;
    let v = 0.5 * *r - 0.41869 * *g - 0.08131 * *b;
    *r = y;
    *g = u;
    *b = v;
  }
}

/// Inverse irreversible transform.
pub(crate) fn decode_real(c0: &mut [f32], c1: &mut [f32], c2: &mut [f32]) {
  for ((y, u), v) in c0.iter_mut().zip(c1.iter_mut()).zip(c2.iter_mut()) {
    let r = *y + *v * 1.402;
    let g = *y - *u * 0.34413 - *v * 0.71414;
    let b = *y + *u * 1.772;
    *y = r;
    *u = g;
    *v = b;
  }
}

#[inline]
fn fix_mul(a: i32, b: i32) -> i32 {
  let mut temp = a as i64 * b as i64;
  temp += 4096;
  debug_assert!(temp >> 13 <= i32::MAX as i64);
  debug_assert!(temp >> 13 >= i32::MIN as i64);
  (temp >> 13) as i32
}

/// Forward custom matrix transform: fixed-point (2^13) multiply of each
/// pixel vector across `comps`. The matrix is row-major NxN.
pub(crate) fn encode_custom(matrix: &[f32], comps: &mut [&mut [i32]]) {
  let n = comps.len();
  debug_assert_eq!(matrix.len(), n * n);
  let fixed: Vec<i32> = matrix
    .iter()
    .map(|&m| (m * (1 << 13) as f32) as i32)
    .collect();
  let len = comps[0].len();
  let mut current = vec![0i32; n];
  for i in 0..len {
    for (j, comp) in comps.iter().enumerate() {
      current[j] = comp[i];
    }
    for j in 0..n {
      let mut acc = 0i32;
      for k in 0..n {
        acc += fix_mul(fixed[j * n + k], current[k]);
      }
      comps[j][i] = acc;
    }
  }
}

/// Inverse custom matrix transform (float path).
pub(crate) fn decode_custom(matrix: &[f32], comps: &mut [&mut [f32]]) {
  let n = comps.len();
  debug_assert_eq!(matrix.len(), n * n);
  let len = comps[0].len();
  let mut current = vec![0f32; n];
  for i in 0..len {
    for (j, comp) in comps.iter().enumerate() {
      current[j] = comp[i];
    }
    for j in 0..n {
      let mut acc = 0f32;
      for k in 0..n {
        acc += matrix[j * n + k] * current[k];
      }
      comps[j][i] = acc;
    }
  }
}

/// Column norms of a custom matrix, the per-component distortion weights.
pub(crate) fn calculate_norms(matrix: &[f32], num_comps: usize) -> Vec<f64> {
  let mut norms = vec![0f64; num_comps];
  for (i, norm) in norms.iter_mut().enumerate() {
    let mut acc = 0f64;
    for j in 0..num_comps {
      let v = matrix[j * num_comps + i] as f64;
      acc += v * v;
    }
    *norm = acc.sqrt();
  }
  norms
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn reversible_round_trip() {
    let r: Vec<i32> = (0..64).map(|i| i * 3 - 90).collect();
    let g: Vec<i32> = (0..64).map(|i| 255 - i * 2).collect();
    let b: Vec<i32> = (0..64).map(|i| (i * 7) % 251 - 120).collect();
    let (mut c0, mut c1, mut c2) = (r.clone(), g.clone(), b.clone());
    encode(&mut c0, &mut c1, &mut c2);
    decode(&mut c0, &mut c1, &mut c2);
    assert_eq!(c0, r);
    assert_eq!(c1, g);
    assert_eq!(c2, b);
  }

  #[test]
  fn constant_rgb_maps_to_expected_rct() {
    let mut c0 = vec![17i32; 4];
    let mut c1 = vec![42i32; 4];
    let mut c2 = vec![200i32; 4];
    encode(&mut c0, &mut c1, &mut c2);
    assert_eq!(c0[0], (17 + 2 * 42 + 200) >> 2);
    assert_eq!(c1[0], 200 - 42);
    assert_eq!(c2[0], 17 - 42);
  }

  #[test]
  fn irreversible_close_round_trip() {
    let r = [100.0f32, -3.5, 77.25, 12.0];
    let g = [50.0f32, 8.0, -20.5, 1.0];
    let b = [-10.0f32, 90.0, 30.0, 0.0];
    let (mut c0, mut c1, mut c2) = (r, g, b);
    encode_real(&mut c0, &mut c1, &mut c2);
    decode_real(&mut c0, &mut c1, &mut c2);
    for i in 0..4 {
      assert!((c0[i] - r[i]).abs() < 0.01);
      assert!((c1[i] - g[i]).abs() < 0.01);
      assert!((c2[i] - b[i]).abs() < 0.01);
    }
  }

  #[test]
  fn custom_norms_identity_matrix() {
    let m = [1.0f32, 0.0, 0.0, 1.0];
    assert_eq!(calculate_norms(&m, 2), vec![1.0, 1.0]);
  }
}

//! Integer helpers behind the canvas equations (B.1/B.5/B.15 of the
//! standard). Divisions round away from the origin, so everything is
//! computed in a wider type before narrowing.

/// Divide and round up.
#[inline]
pub(crate) fn ceil_div(a: u32, b: u32) -> u32 {
  debug_assert!(b != 0);
  ((a as u64 + b as u64 - 1) / b as u64) as u32
}

#[inline]
pub(crate) fn ceil_div_i32(a: i32, b: i32) -> i32 {
  debug_assert!(b > 0);
  (((a as i64) + (b as i64) - 1).div_euclid(b as i64)) as i32
}

/// Divide by 2^b and round up.
#[inline]
pub(crate) fn ceil_div_pow2(a: u32, b: u32) -> u32 {
  ((a as u64 + (1u64 << b) - 1) >> b) as u32
}

#[inline]
pub(crate) fn ceil_div_pow2_i32(a: i32, b: u32) -> i32 {
  (((a as i64) + (1i64 << b) - 1) >> b) as i32
}

#[inline]
pub(crate) fn ceil_div_pow2_i64(a: i64, b: u32) -> i32 {
  ((a + (1i64 << b) - 1) >> b) as i32
}

/// Divide by 2^b and round down (arithmetic shift, exact for negatives).
#[inline]
pub(crate) fn floor_div_pow2_i32(a: i32, b: u32) -> i32 {
  ((a as i64) >> b) as i32
}

/// Largest k with 2^k <= a. `a` must be non-zero.
#[inline]
pub(crate) fn floor_log2(a: u32) -> u32 {
  debug_assert!(a != 0);
  31 - a.leading_zeros()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn ceildiv_rounds_up() {
    assert_eq!(ceil_div(0, 3), 0);
    assert_eq!(ceil_div(1, 3), 1);
    assert_eq!(ceil_div(3, 3), 1);
    assert_eq!(ceil_div(4, 3), 2);
    assert_eq!(ceil_div(u32::MAX, 2), 0x8000_0000);
  }

  #[test]
  fn ceildivpow2_matches_division() {
    for a in [0i32, 1, 2, 7, 63, 64, 65, 1023] {
      for b in 0..6u32 {
        assert_eq!(ceil_div_pow2_i32(a, b), ceil_div_i32(a, 1 << b));
      }
    }
    // Negative coordinates appear in band equations via the shifted origin.
    assert_eq!(ceil_div_pow2_i64(-1, 1), 0);
    assert_eq!(ceil_div_pow2_i64(-3, 1), -1);
  }

  #[test]
  fn floordivpow2_negative() {
    assert_eq!(floor_div_pow2_i32(-1, 1), -1);
    assert_eq!(floor_div_pow2_i32(-4, 2), -1);
    assert_eq!(floor_div_pow2_i32(5, 1), 2);
  }

  #[test]
  fn floorlog2_values() {
    assert_eq!(floor_log2(1), 0);
    assert_eq!(floor_log2(2), 1);
    assert_eq!(floor_log2(3), 1);
    assert_eq!(floor_log2(164), 7);
  }
}

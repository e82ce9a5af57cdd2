//! Quantization: stepsize derivation for QCD/QCC and the per-band
//! (expn, mant) <-> stepsize conversions of Annex E.

use crate::dwt;
use crate::math::floor_log2;
use crate::params::{StepSize, TileCompParams, QNTSTY_NOQNT};

/// Sub-band gain (Table E-1): log2 amplification of the synthesis basis.
pub(crate) fn band_gain(qmfbid: u32, orient: u32) -> u32 {
  if qmfbid == 0 {
    0
  } else {
    match orient {
      0 => 0,
      3 => 2,
      _ => 1,
    }
  }
}

/// Encode a real stepsize into the 5-bit exponent / 11-bit mantissa form.
fn encode_stepsize(stepsize_8192: i32, numbps: i32) -> StepSize {
  let p = floor_log2(stepsize_8192 as u32) as i32 - 13;
  let n = 11 - floor_log2(stepsize_8192 as u32) as i32;
  let mant = (if n < 0 {
    stepsize_8192 >> -n
  } else {
    stepsize_8192 << n
  } & 0x7ff) as u32;
  StepSize {
    expn: numbps - p,
    mant,
  }
}

/// Fill the per-band stepsize table of one tile-component: reversible
/// bands get mant = 0 and an exponent from the dynamic range alone,
/// irreversible bands derive the stepsize from the band synthesis norm.
pub(crate) fn calc_explicit_stepsizes(tccp: &mut TileCompParams, prec: u32) {
  let numbands = 3 * tccp.numresolutions - 2;
  for bandno in 0..numbands {
    let resno = if bandno == 0 { 0 } else { (bandno - 1) / 3 + 1 };
    let orient = if bandno == 0 { 0 } else { (bandno - 1) % 3 + 1 };
    let level = tccp.numresolutions - 1 - resno;
    let gain = band_gain(tccp.qmfbid, orient);
    let stepsize = if tccp.qntsty == QNTSTY_NOQNT {
      1.0
    } else {
      let norm = dwt::getnorm_real(level, orient);
      (1u32 << gain) as f64 / norm
    };
    tccp.stepsizes[bandno as usize] = encode_stepsize(
      (stepsize * 8192.0).floor() as i32,
      (prec + gain) as i32,
    );
  }
}

/// Real stepsize of Equation E-3 and the band bitplane budget Mb of
/// Equation E-2.
pub(crate) fn band_stepsize_numbps(
  step: &StepSize,
  qmfbid: u32,
  prec: u32,
  orient: u32,
  numgbits: u32,
) -> (f32, u32) {
  let gain = band_gain(qmfbid, orient);
  let rb = prec as i32 + gain as i32;
  let stepsize =
    (1.0 + step.mant as f64 / 2048.0) * 2f64.powi(rb - step.expn) as f64;
  let numbps = (step.expn + numgbits as i32 - 1).max(0) as u32;
  (stepsize as f32, numbps)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::params::TileCompParams;

  #[test]
  fn reversible_stepsizes_have_zero_mantissa() {
    let mut tccp = TileCompParams::default();
    tccp.qmfbid = 1;
    tccp.qntsty = QNTSTY_NOQNT;
    calc_explicit_stepsizes(&mut tccp, 8);
    let numbands = 3 * tccp.numresolutions - 2;
    for band in 0..numbands as usize {
      assert_eq!(tccp.stepsizes[band].mant, 0);
      assert!(tccp.stepsizes[band].expn > 0);
    }
  }

  #[test]
  fn reversible_stepsize_decodes_to_power_of_two() {
    let mut tccp = TileCompParams::default();
    calc_explicit_stepsizes(&mut tccp, 8);
    // LL band of an 8-bit reversible component: stepsize 2^(Rb - expn)
    // with expn = Rb, i.e. exactly 1.0.
    let (step, numbps) = band_stepsize_numbps(&tccp.stepsizes[0], 1, 8, 0, 2);
    assert_eq!(step, 1.0);
    assert_eq!(numbps, tccp.stepsizes[0].expn as u32 + 1);
  }

  #[test]
  fn irreversible_stepsizes_carry_mantissa() {
    let mut tccp = TileCompParams::default();
    tccp.qmfbid = 0;
    tccp.qntsty = crate::params::QNTSTY_SEQNT;
    calc_explicit_stepsizes(&mut tccp, 8);
    let any_mant = (0..(3 * tccp.numresolutions - 2) as usize)
      .any(|b| tccp.stepsizes[b].mant != 0);
    assert!(any_mant);
  }

  #[test]
  fn stepsize_encode_decode_close() {
    for &target in &[0.25f64, 0.5, 1.0, 1.7, 3.9, 10.0] {
      let enc = encode_stepsize((target * 8192.0).floor() as i32, 10);
      // Decode with Rb = 10 to recover the value.
      let decoded = (1.0 + enc.mant as f64 / 2048.0) * 2f64.powi(10 - enc.expn);
      assert!(
        (decoded - target).abs() / target < 0.001,
        "{} vs {}",
        decoded,
        target
      );
    }
  }
}

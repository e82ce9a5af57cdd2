//! Tier-1 embedded block coder (Part 1): three coding passes per bitplane
//! over stripes of four rows, contexts formed from the 8-neighbourhood.
//!
//! The coder works on one codeblock at a time and is reused across blocks;
//! scratch buffers are kept allocated. Encoder magnitudes carry
//! `FRAC_BITS` fractional bits; the decoder accumulates at twice the
//! coefficient scale so half-LSB reconstruction stays in integers.

use smallvec::SmallVec;

use crate::dwt;
use crate::error::{Error, Result};
use crate::math::floor_log2;
use crate::mqc::{MqDecoder, MqEncoder, CTX_MAG, CTX_RL, CTX_SC, CTX_UNI, CTX_ZC};
use crate::params::CblkSty;

/// Fractional magnitude bits carried by the encoder.
pub(crate) const FRAC_BITS: u32 = 6;

/// Pass-count ceiling: 3 * 31 bitplanes - 2, also the VLC's reach.
pub(crate) const MAX_PASSES: u32 = 109;

// Per-sample flag word. Neighbour bits describe the neighbour in the named
// direction as seen from this sample.
const SIG: u32 = 1 << 0;
const VISIT: u32 = 1 << 1;
const REFINED: u32 = 1 << 2;
const SIG_N: u32 = 1 << 3;
const SIG_S: u32 = 1 << 4;
const SIG_W: u32 = 1 << 5;
const SIG_E: u32 = 1 << 6;
const SIG_NW: u32 = 1 << 7;
const SIG_NE: u32 = 1 << 8;
const SIG_SW: u32 = 1 << 9;
const SIG_SE: u32 = 1 << 10;
const SGN_N: u32 = 1 << 11;
const SGN_S: u32 = 1 << 12;
const SGN_W: u32 = 1 << 13;
const SGN_E: u32 = 1 << 14;

const SIG_NEIGHBOURS: u32 =
  SIG_N | SIG_S | SIG_W | SIG_E | SIG_NW | SIG_NE | SIG_SW | SIG_SE;

/// One coding pass produced by the encoder.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct PassEnc {
  /// Truncation byte count up to and including this pass.
  pub rate: u32,
  /// Cumulative weighted distortion decrease after this pass.
  pub distortiondec: f64,
  /// Quantized rate-distortion slope of this pass (0 = infeasible point).
  pub slope: u16,
  /// Bytes contributed by this pass alone.
  pub len: u32,
  /// Whether the arithmetic coder was terminated after this pass.
  pub term: bool,
}

#[derive(Debug, Default)]
pub(crate) struct EncodedCblk {
  pub numbps: u32,
  pub passes: SmallVec<[PassEnc; 16]>,
  pub data: Vec<u8>,
  pub wmsedec: f64,
}

/// Decoder-side view of one codeword segment.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SegSlice<'a> {
  pub data: &'a [u8],
  pub passes: u32,
}

/// Encoder input; the irreversible path quantizes while loading so the
/// fractional part of `sample / stepsize` is rounded exactly once.
pub(crate) enum T1Input<'a> {
  Reversible(&'a [i32]),
  Irreversible(&'a [f32], f32),
}

pub(crate) struct T1Coder {
  w: u32,
  h: u32,
  /// Sign-magnitude words on encode (bit 31 = sign, low bits =
  /// magnitude << FRAC_BITS); 2x-scale signed values on decode.
  data: Vec<i32>,
  flags: Vec<u32>,
  enc: MqEncoder,
  scratch: Vec<u8>,
}

impl T1Coder {
  pub fn new() -> Self {
    Self {
      w: 0,
      h: 0,
      data: Vec::new(),
      flags: Vec::new(),
      enc: MqEncoder::new(),
      scratch: Vec::new(),
    }
  }

  fn allocate(&mut self, w: u32, h: u32) {
    self.w = w;
    self.h = h;
    let n = (w * h) as usize;
    self.data.clear();
    self.data.resize(n, 0);
    let nf = ((w + 2) * (h + 2)) as usize;
    self.flags.clear();
    self.flags.resize(nf, 0);
  }

  #[inline]
  fn fidx(&self, x: u32, y: u32) -> usize {
    ((y + 1) * (self.w + 2) + x + 1) as usize
  }

  #[inline]
  fn didx(&self, x: u32, y: u32) -> usize {
    (y * self.w + x) as usize
  }

  /// Mark (x, y) significant with the given sign and inform the
  /// neighbours. With vertically causal contexts, the top row of a stripe
  /// keeps quiet towards the stripe above.
  fn update_flags(&mut self, x: u32, y: u32, neg: bool, vsc: bool) {
    let stride = (self.w + 2) as usize;
    let idx = self.fidx(x, y);
    self.flags[idx] |= SIG;
    if !(vsc && y % 4 == 0) {
      self.flags[idx - stride] |= SIG_S | if neg { SGN_S } else { 0 };
      self.flags[idx - stride - 1] |= SIG_SE;
      self.flags[idx - stride + 1] |= SIG_SW;
    }
    self.flags[idx + stride] |= SIG_N | if neg { SGN_N } else { 0 };
    self.flags[idx + stride - 1] |= SIG_NE;
    self.flags[idx + stride + 1] |= SIG_NW;
    self.flags[idx - 1] |= SIG_E | if neg { SGN_E } else { 0 };
    self.flags[idx + 1] |= SIG_W | if neg { SGN_W } else { 0 };
  }
}

/// Zero-coding context (Table D.1) from neighbour significance counts.
fn zc_ctx(orient: u32, f: u32) -> u8 {
  let h = ((f & SIG_W) != 0) as u32 + ((f & SIG_E) != 0) as u32;
  let v = ((f & SIG_N) != 0) as u32 + ((f & SIG_S) != 0) as u32;
  let d = ((f & SIG_NW) != 0) as u32
    + ((f & SIG_NE) != 0) as u32
    + ((f & SIG_SW) != 0) as u32
    + ((f & SIG_SE) != 0) as u32;
  // HL swaps the roles of horizontal and vertical neighbours.
  let (h, v) = if orient == 1 { (v, h) } else { (h, v) };
  let ctx = if orient == 3 {
    match (d, h + v) {
      (0, 0) => 0,
      (0, 1) => 1,
      (0, _) => 2,
      (1, 0) => 3,
      (1, 1) => 4,
      (1, _) => 5,
      (2, 0) => 6,
      (2, _) => 7,
      _ => 8,
    }
  } else if h == 0 {
    match (v, d) {
      (0, 0) => 0,
      (0, 1) => 1,
      (0, _) => 2,
      (1, _) => 3,
      _ => 4,
    }
  } else if h == 1 {
    match (v, d) {
      (0, 0) => 5,
      (0, _) => 6,
      _ => 7,
    }
  } else {
    8
  };
  CTX_ZC + ctx as u8
}

/// Sign-coding context and XOR bit (Table D.2).
fn sc_ctx(f: u32) -> (u8, u32) {
  let contrib = |sig: u32, sgn: u32| -> i32 {
    if f & sig == 0 {
      0
    } else if f & sgn != 0 {
      -1
    } else {
      1
    }
  };
  let hc = (contrib(SIG_W, SGN_W) + contrib(SIG_E, SGN_E)).max(-1).min(1);
  let vc = (contrib(SIG_N, SGN_N) + contrib(SIG_S, SGN_S)).max(-1).min(1);
  let (ctx, xor) = match (hc, vc) {
    (1, 1) => (4, 0),
    (1, 0) => (3, 0),
    (1, -1) => (2, 0),
    (0, 1) => (1, 0),
    (0, 0) => (0, 0),
    (0, -1) => (1, 1),
    (-1, 1) => (2, 1),
    (-1, 0) => (3, 1),
    _ => (4, 1),
  };
  (CTX_SC + ctx as u8, xor)
}

/// Magnitude-refinement context (Table D.3).
fn mr_ctx(f: u32) -> u8 {
  if f & REFINED != 0 {
    CTX_MAG + 2
  } else if f & SIG_NEIGHBOURS != 0 {
    CTX_MAG + 1
  } else {
    CTX_MAG
  }
}

/// With vertically causal contexts, samples on a stripe's bottom row see
/// the stripe below as entirely insignificant.
#[inline]
fn vsc_mask(f: u32, y: u32, vsc: bool) -> u32 {
  if vsc && y % 4 == 3 {
    f & !(SIG_S | SIG_SW | SIG_SE | SGN_S)
  } else {
    f
  }
}

#[inline]
fn smr_abs(v: i32) -> u32 {
  v as u32 & 0x7fff_ffff
}

#[inline]
fn smr_neg(v: i32) -> bool {
  (v as u32) >> 31 != 0
}

// Normalized MSE decrease of a coded bit: difference of squared distances
// over a 1-integer-plus-FRAC_BITS-fraction window, scaled by 8192.
fn nmsedec_quad(u: f64, v: f64) -> i32 {
  let val = ((u * u - v * v) * 64.0 + 0.5).floor() / 64.0 * 8192.0;
  if val > 0.0 {
    val as i32
  } else {
    0
  }
}

fn nmsedec_sig(x: u32, bitpos: u32) -> i32 {
  if bitpos > 0 {
    let t = ((x >> bitpos) & 0x7f) as f64 / 64.0;
    nmsedec_quad(t, t - 1.5)
  } else {
    let t = (x & 0x7f) as f64 / 64.0;
    nmsedec_quad(t, t - 1.0)
  }
}

fn nmsedec_ref(x: u32, bitpos: u32) -> i32 {
  if bitpos > 0 {
    let t = ((x >> bitpos) & 0x7f) as f64 / 64.0;
    let u = t - 1.0;
    nmsedec_quad(u, t - 1.5)
  } else {
    let t = (x & 0x7f) as f64 / 64.0;
    nmsedec_quad(t, t - 0.5)
  }
}

/// Distortion weight of one pass: band norm times component norm times
/// stepsize at the coded bitplane, squared, applied to the NMSE sum.
#[allow(clippy::too_many_arguments)]
fn wmsedec(
  nmsedec: i32,
  compno: u32,
  level: u32,
  orient: u32,
  bpno: i32,
  qmfbid: u32,
  stepsize: f64,
  mct_norms: Option<&[f64]>,
) -> f64 {
  let w1 = match mct_norms {
    Some(norms) if (compno as usize) < norms.len() => norms[compno as usize],
    _ => 1.0,
  };
  let mut stepsize = stepsize;
  let w2 = if qmfbid == 1 {
    dwt::getnorm(level, orient)
  } else {
    let log2_gain = match orient {
      0 => 0,
      3 => 2,
      _ => 1,
    };
    stepsize /= (1 << log2_gain) as f64;
    dwt::getnorm_real(level, orient)
  };
  let w = w1 * w2 * stepsize * (1i64 << bpno) as f64;
  w * w * nmsedec as f64 / 8192.0
}

/// Whether the pass `(bpno, passtype)` ends with a coder termination.
fn is_term_pass(cblksty: CblkSty, numbps: u32, bpno: i32, passtype: u32) -> bool {
  if passtype == 2 && bpno == 0 {
    return true;
  }
  if cblksty.contains(CblkSty::TERMALL) {
    return true;
  }
  if cblksty.contains(CblkSty::BYPASS) {
    // Terminate the cleanup pass preceding the raw-mode switch, and from
    // there on every raw pass and every cleanup pass.
    if bpno == numbps as i32 - 4 && passtype == 2 {
      return true;
    }
    if bpno < numbps as i32 - 4 && passtype > 0 {
      return true;
    }
  }
  false
}

#[inline]
fn is_raw_pass(cblksty: CblkSty, numbps: u32, bpno: i32, passtype: u32) -> bool {
  cblksty.contains(CblkSty::BYPASS) && bpno < numbps as i32 - 4 && passtype < 2
}

impl T1Coder {
  // ---- encoder ----------------------------------------------------------

  fn enc_sigpass(&mut self, bpno: i32, raw: bool, vsc: bool, orient: u32, nmsedec: &mut i32) {
    let one = 1i32 << (bpno as u32 + FRAC_BITS);
    let (w, h) = (self.w, self.h);
    let mut k = 0;
    while k < h {
      let kmax = (k + 4).min(h);
      for x in 0..w {
        for y in k..kmax {
          let fi = self.fidx(x, y);
          let f = vsc_mask(self.flags[fi], y, vsc);
          if f & (SIG | VISIT) != 0 || f & SIG_NEIGHBOURS == 0 {
            continue;
          }
          let datum = self.data[self.didx(x, y)];
          let v = (smr_abs(datum) as i32 & one != 0) as u32;
          if raw {
            self.enc.bypass_put(v);
          } else {
            self.enc.encode(v, zc_ctx(orient, f));
          }
          if v != 0 {
            let neg = smr_neg(datum);
            *nmsedec += nmsedec_sig(smr_abs(datum), bpno as u32);
            if raw {
              self.enc.bypass_put(neg as u32);
            } else {
              let (ctx, xor) = sc_ctx(f);
              self.enc.encode(neg as u32 ^ xor, ctx);
            }
            self.update_flags(x, y, neg, vsc);
          }
          self.flags[fi] |= VISIT;
        }
      }
      k += 4;
    }
  }

  fn enc_refpass(&mut self, bpno: i32, raw: bool, vsc: bool, nmsedec: &mut i32) {
    let one = 1i32 << (bpno as u32 + FRAC_BITS);
    let (w, h) = (self.w, self.h);
    let mut k = 0;
    while k < h {
      let kmax = (k + 4).min(h);
      for x in 0..w {
        for y in k..kmax {
          let fi = self.fidx(x, y);
          let f = self.flags[fi];
          if f & SIG == 0 || f & VISIT != 0 {
            continue;
          }
          let datum = self.data[self.didx(x, y)];
          let v = (smr_abs(datum) as i32 & one != 0) as u32;
          *nmsedec += nmsedec_ref(smr_abs(datum), bpno as u32);
          if raw {
            self.enc.bypass_put(v);
          } else {
            self.enc.encode(v, mr_ctx(vsc_mask(f, y, vsc)));
          }
          self.flags[fi] |= REFINED;
        }
      }
      k += 4;
    }
  }

  fn enc_clnpass(&mut self, bpno: i32, vsc: bool, orient: u32, nmsedec: &mut i32) {
    let one = 1i32 << (bpno as u32 + FRAC_BITS);
    let (w, h) = (self.w, self.h);
    let mut k = 0;
    while k < h {
      let kmax = (k + 4).min(h);
      for x in 0..w {
        // Aggregation covers full four-sample columns with nothing coded
        // yet and no significant neighbourhood.
        let agg = kmax == k + 4
          && (k..kmax).all(|y| {
            let f = self.flags[self.fidx(x, y)];
            f & (SIG | VISIT | SIG_NEIGHBOURS) == 0
          });
        let mut start = k;
        if agg {
          let runlen = (k..kmax)
            .position(|y| smr_abs(self.data[self.didx(x, y)]) as i32 & one != 0)
            .map(|p| p as u32)
            .unwrap_or(4);
          if runlen == 4 {
            self.enc.encode(0, CTX_RL);
            continue;
          }
          self.enc.encode(1, CTX_RL);
          self.enc.encode(runlen >> 1, CTX_UNI);
          self.enc.encode(runlen & 1, CTX_UNI);
          // Significance of the run-terminating sample is implied.
          let y = k + runlen;
          let datum = self.data[self.didx(x, y)];
          let neg = smr_neg(datum);
          *nmsedec += nmsedec_sig(smr_abs(datum), bpno as u32);
          let f = vsc_mask(self.flags[self.fidx(x, y)], y, vsc);
          let (ctx, xor) = sc_ctx(f);
          self.enc.encode(neg as u32 ^ xor, ctx);
          self.update_flags(x, y, neg, vsc);
          let fi = self.fidx(x, y);
          self.flags[fi] &= !VISIT;
          start = y + 1;
        }
        for y in start..kmax {
          let fi = self.fidx(x, y);
          let f = vsc_mask(self.flags[fi], y, vsc);
          if f & (SIG | VISIT) == 0 {
            let datum = self.data[self.didx(x, y)];
            let v = (smr_abs(datum) as i32 & one != 0) as u32;
            self.enc.encode(v, zc_ctx(orient, f));
            if v != 0 {
              let neg = smr_neg(datum);
              *nmsedec += nmsedec_sig(smr_abs(datum), bpno as u32);
              let (ctx, xor) = sc_ctx(f);
              self.enc.encode(neg as u32 ^ xor, ctx);
              self.update_flags(x, y, neg, vsc);
            }
          }
          self.flags[fi] &= !VISIT;
        }
      }
      k += 4;
    }
  }

  /// Encode one codeblock; returns the pass table, the codeword bytes and
  /// the cumulative weighted distortion decrease.
  #[allow(clippy::too_many_arguments)]
  pub fn encode_cblk(
    &mut self,
    w: u32,
    h: u32,
    input: T1Input<'_>,
    orient: u32,
    compno: u32,
    level: u32,
    qmfbid: u32,
    stepsize: f64,
    cblksty: CblkSty,
    mct_norms: Option<&[f64]>,
  ) -> EncodedCblk {
    self.allocate(w, h);
    let vsc = cblksty.contains(CblkSty::VSC);

    // Load sign-magnitude words with FRAC_BITS fractional bits and find
    // the magnitude ceiling.
    let mut max = 0u32;
    match input {
      T1Input::Reversible(samples) => {
        debug_assert_eq!(samples.len(), (w * h) as usize);
        for (dst, &s) in self.data.iter_mut().zip(samples) {
          let mag = s.unsigned_abs().wrapping_shl(FRAC_BITS) & 0x7fff_ffff;
          max = max.max(mag);
          *dst = (mag | if s < 0 { 0x8000_0000 } else { 0 }) as i32;
        }
      }
      T1Input::Irreversible(samples, stepsize_f) => {
        debug_assert_eq!(samples.len(), (w * h) as usize);
        for (dst, &s) in self.data.iter_mut().zip(samples) {
          let q = (s / stepsize_f * (1 << FRAC_BITS) as f32).round() as i64;
          let mag = (q.unsigned_abs() as u32) & 0x7fff_ffff;
          max = max.max(mag);
          *dst = (mag | if q < 0 { 0x8000_0000 } else { 0 }) as i32;
        }
      }
    }

    let mut out = EncodedCblk::default();
    out.numbps = if max != 0 {
      (floor_log2(max) as i32 + 1 - FRAC_BITS as i32).max(0) as u32
    } else {
      0
    };
    if out.numbps == 0 {
      return out;
    }

    self.enc.reset_states();
    self.enc.init();

    let mut bpno = out.numbps as i32 - 1;
    let mut passtype = 2u32;
    let mut nmsedec;
    let mut cum = 0.0f64;
    let pterm = cblksty.contains(CblkSty::PTERM);

    while bpno >= 0 && (out.passes.len() as u32) < MAX_PASSES {
      nmsedec = 0;
      let raw = is_raw_pass(cblksty, out.numbps, bpno, passtype);
      if let Some(prev) = out.passes.last() {
        if prev.term {
          if raw {
            self.enc.bypass_init();
          } else {
            self.enc.restart_init();
          }
        }
      }
      match passtype {
        0 => self.enc_sigpass(bpno, raw, vsc, orient, &mut nmsedec),
        1 => self.enc_refpass(bpno, raw, vsc, &mut nmsedec),
        _ => {
          self.enc_clnpass(bpno, vsc, orient, &mut nmsedec);
          if cblksty.contains(CblkSty::SEGSYM) {
            self.enc.segmark();
          }
        }
      }

      cum += wmsedec(
        nmsedec, compno, level, orient, bpno, qmfbid, stepsize, mct_norms,
      );

      let mut pass = PassEnc {
        distortiondec: cum,
        ..Default::default()
      };
      if is_term_pass(cblksty, out.numbps, bpno, passtype) {
        if raw {
          self.enc.bypass_flush(pterm);
        } else if pterm {
          self.enc.erterm();
        } else {
          self.enc.flush();
        }
        pass.term = true;
        pass.rate = self.enc.num_bytes();
      } else {
        let extra = if raw {
          self.enc.bypass_extra_bytes(pterm)
        } else {
          3
        };
        pass.term = false;
        pass.rate = self.enc.num_bytes() + extra;
      }
      out.passes.push(pass);

      passtype += 1;
      if passtype == 3 {
        passtype = 0;
        bpno -= 1;
      }
      if cblksty.contains(CblkSty::RESET) {
        self.enc.reset_states();
      }
    }

    // Pass rates must not decrease towards the end of the block.
    let mut last_rate = self.enc.num_bytes();
    for pass in out.passes.iter_mut().rev() {
      if pass.rate > last_rate {
        pass.rate = last_rate;
      } else {
        last_rate = pass.rate;
      }
    }
    // No truncation point may land just after a 0xFF byte.
    let mut prev_rate = 0;
    for pass in out.passes.iter_mut() {
      if pass.rate > 0 && self.enc.byte_at(pass.rate - 1) == 0xff {
        pass.rate -= 1;
      }
      pass.len = pass.rate - prev_rate;
      prev_rate = pass.rate;
    }

    // Quantized slopes for callers tracking feasible truncation points.
    let mut prev = (0u32, 0.0f64);
    for pass in out.passes.iter_mut() {
      let dr = pass.rate.saturating_sub(prev.0);
      let dd = pass.distortiondec - prev.1;
      pass.slope = if dr > 0 && dd > 0.0 {
        let s = ((dd / dr as f64).log2() * 256.0 + 32768.0).round();
        if s < 1.0 {
          1
        } else if s > 65535.0 {
          65535
        } else {
          s as u16
        }
      } else {
        0
      };
      prev = (pass.rate, pass.distortiondec);
    }

    out.wmsedec = cum;
    out.data = self.enc.data().to_vec();
    if let Some(last) = out.passes.last() {
      out.data.truncate(last.rate as usize);
    }
    out
  }

  // ---- decoder ----------------------------------------------------------

  fn dec_sigpass(
    &mut self,
    dec: &mut MqDecoder<'_>,
    bpno: i32,
    raw: bool,
    vsc: bool,
    orient: u32,
  ) {
    let one = 1i32 << bpno;
    let oneplushalf = one | (one >> 1);
    let (w, h) = (self.w, self.h);
    let mut k = 0;
    while k < h {
      let kmax = (k + 4).min(h);
      for x in 0..w {
        for y in k..kmax {
          let fi = self.fidx(x, y);
          let f = vsc_mask(self.flags[fi], y, vsc);
          if f & (SIG | VISIT) != 0 || f & SIG_NEIGHBOURS == 0 {
            continue;
          }
          let v = if raw {
            dec.raw_decode()
          } else {
            dec.decode(zc_ctx(orient, f))
          };
          if v != 0 {
            let neg = if raw {
              dec.raw_decode() != 0
            } else {
              let (ctx, xor) = sc_ctx(f);
              dec.decode(ctx) ^ xor != 0
            };
            let di = self.didx(x, y);
            self.data[di] = if neg { -oneplushalf } else { oneplushalf };
            self.update_flags(x, y, neg, vsc);
          }
          self.flags[fi] |= VISIT;
        }
      }
      k += 4;
    }
  }

  fn dec_refpass(&mut self, dec: &mut MqDecoder<'_>, bpno: i32, raw: bool, vsc: bool) {
    let one = 1i32 << bpno;
    let poshalf = one >> 1;
    let (w, h) = (self.w, self.h);
    let mut k = 0;
    while k < h {
      let kmax = (k + 4).min(h);
      for x in 0..w {
        for y in k..kmax {
          let fi = self.fidx(x, y);
          let f = self.flags[fi];
          if f & SIG == 0 || f & VISIT != 0 {
            continue;
          }
          let v = if raw {
            dec.raw_decode()
          } else {
            dec.decode(mr_ctx(vsc_mask(f, y, vsc)))
          };
          let t = if v != 0 { poshalf } else { -poshalf };
          let di = self.didx(x, y);
          self.data[di] += if self.data[di] < 0 { -t } else { t };
          self.flags[fi] |= REFINED;
        }
      }
      k += 4;
    }
  }

  fn dec_clnpass(&mut self, dec: &mut MqDecoder<'_>, bpno: i32, vsc: bool, orient: u32) {
    let one = 1i32 << bpno;
    let oneplushalf = one | (one >> 1);
    let (w, h) = (self.w, self.h);
    let mut k = 0;
    while k < h {
      let kmax = (k + 4).min(h);
      for x in 0..w {
        let agg = kmax == k + 4
          && (k..kmax).all(|y| {
            let f = self.flags[self.fidx(x, y)];
            f & (SIG | VISIT | SIG_NEIGHBOURS) == 0
          });
        let mut start = k;
        if agg {
          if dec.decode(CTX_RL) == 0 {
            continue;
          }
          let runlen = (dec.decode(CTX_UNI) << 1) | dec.decode(CTX_UNI);
          let y = k + runlen;
          let f = vsc_mask(self.flags[self.fidx(x, y)], y, vsc);
          let (ctx, xor) = sc_ctx(f);
          let neg = dec.decode(ctx) ^ xor != 0;
          let di = self.didx(x, y);
          self.data[di] = if neg { -oneplushalf } else { oneplushalf };
          self.update_flags(x, y, neg, vsc);
          let fi = self.fidx(x, y);
          self.flags[fi] &= !VISIT;
          start = y + 1;
        }
        for y in start..kmax {
          let fi = self.fidx(x, y);
          let f = vsc_mask(self.flags[fi], y, vsc);
          if f & (SIG | VISIT) == 0 {
            let v = dec.decode(zc_ctx(orient, f));
            if v != 0 {
              let (ctx, xor) = sc_ctx(f);
              let neg = dec.decode(ctx) ^ xor != 0;
              let di = self.didx(x, y);
              self.data[di] = if neg { -oneplushalf } else { oneplushalf };
              self.update_flags(x, y, neg, vsc);
            }
          }
          self.flags[fi] &= !VISIT;
        }
      }
      k += 4;
    }
  }

  /// Decode one codeblock from its codeword segments. Returns the
  /// reconstructed samples at twice the coefficient scale; divide by two
  /// (or scale by stepsize / 2) to dequantize.
  #[allow(clippy::too_many_arguments)]
  pub fn decode_cblk(
    &mut self,
    w: u32,
    h: u32,
    segs: &[SegSlice<'_>],
    numbps: u32,
    orient: u32,
    roishift: u32,
    cblksty: CblkSty,
    check_pterm: bool,
  ) -> Result<Vec<i32>> {
    if cblksty.contains(CblkSty::HT) {
      return Err(Error::UnsupportedFeature("HT (Part 15) block coding"));
    }
    self.allocate(w, h);
    let vsc = cblksty.contains(CblkSty::VSC);

    let mut bpno_plus_one = (roishift + numbps) as i32;
    if bpno_plus_one >= 31 {
      return Err(Error::CorruptPacketHeader("more than 30 bitplanes"));
    }
    let mut passtype = 2u32;

    // Concatenate segments once; each decodes from its own range.
    self.scratch.clear();
    for seg in segs {
      self.scratch.extend_from_slice(seg.data);
    }
    let buf = std::mem::take(&mut self.scratch);

    let mut dec = MqDecoder::new();
    dec.reset_states();

    let mut offset = 0usize;
    let mut failed = false;
    'segs: for seg in segs {
      let seg_data = &buf[offset..offset + seg.data.len()];
      offset += seg.data.len();
      let raw = is_raw_pass(cblksty, numbps, bpno_plus_one - 1, passtype);
      if raw {
        dec.raw_init(seg_data);
      } else {
        dec.init(seg_data);
      }
      for _ in 0..seg.passes {
        if bpno_plus_one < 1 {
          break 'segs;
        }
        let raw = is_raw_pass(cblksty, numbps, bpno_plus_one - 1, passtype);
        match passtype {
          0 => self.dec_sigpass(&mut dec, bpno_plus_one, raw, vsc, orient),
          1 => self.dec_refpass(&mut dec, bpno_plus_one, raw, vsc),
          _ => {
            self.dec_clnpass(&mut dec, bpno_plus_one, vsc, orient);
            if cblksty.contains(CblkSty::SEGSYM) {
              let mut sym = 0;
              for _ in 0..4 {
                sym = (sym << 1) | dec.decode(CTX_UNI);
              }
              if sym != 0xa {
                failed = true;
                break 'segs;
              }
            }
          }
        }
        if cblksty.contains(CblkSty::RESET) && !raw {
          dec.reset_states();
        }
        passtype += 1;
        if passtype == 3 {
          passtype = 0;
          bpno_plus_one -= 1;
        }
      }
      if check_pterm && (dec.remaining_bytes() > 2 || dec.synthetic_bytes > 2) {
        log::warn!(
          "predictable termination check failed: {} bytes remaining, {} synthesized",
          dec.remaining_bytes(),
          dec.synthetic_bytes
        );
      }
    }
    self.scratch = buf;
    if failed {
      // A bad codeword zeroes the block; the caller carries on.
      return Err(Error::CorruptPacketData);
    }

    let mut out = std::mem::take(&mut self.data);
    if roishift > 0 {
      let thresh = 1i32 << roishift;
      for v in out.iter_mut() {
        let mag = v.abs();
        if mag >= thresh {
          *v = if *v < 0 { -(mag >> roishift) } else { mag >> roishift };
        }
      }
    }
    self.data = Vec::new();
    Ok(out)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn lcg_samples(n: usize, span: i32) -> Vec<i32> {
    let mut state = 0x1234_5678_9abc_def0u64;
    (0..n)
      .map(|_| {
        state = state
          .wrapping_mul(6364136223846793005)
          .wrapping_add(1442695040888963407);
        ((state >> 33) as i32 % span) - span / 2
      })
      .collect()
  }

  fn round_trip(w: u32, h: u32, samples: &[i32], cblksty: CblkSty, orient: u32) {
    let mut coder = T1Coder::new();
    let enc = coder.encode_cblk(
      w,
      h,
      T1Input::Reversible(samples),
      orient,
      0,
      0,
      1,
      1.0,
      cblksty,
      None,
    );
    if samples.iter().all(|&s| s == 0) {
      assert_eq!(enc.numbps, 0);
      return;
    }
    // Split the codeword at termination points, as tier-2 would.
    let mut segs = Vec::new();
    let mut seg_start = 0u32;
    let mut seg_passes = 0u32;
    for (i, pass) in enc.passes.iter().enumerate() {
      seg_passes += 1;
      if pass.term || i + 1 == enc.passes.len() {
        segs.push(SegSlice {
          data: &enc.data[seg_start as usize..pass.rate as usize],
          passes: seg_passes,
        });
        seg_start = pass.rate;
        seg_passes = 0;
      }
    }
    let decoded = coder
      .decode_cblk(w, h, &segs, enc.numbps, orient, 0, cblksty, false)
      .unwrap();
    for (i, (&want, &got2x)) in samples.iter().zip(decoded.iter()).enumerate() {
      assert_eq!(want, got2x / 2, "sample {} (2x value {})", i, got2x);
    }
  }

  #[test]
  fn round_trip_plain() {
    let samples = lcg_samples(64, 200);
    round_trip(8, 8, &samples, CblkSty::empty(), 0);
  }

  #[test]
  fn round_trip_all_orientations() {
    let samples = lcg_samples(16 * 12, 64);
    for orient in 0..4 {
      round_trip(16, 12, &samples, CblkSty::empty(), orient);
    }
  }

  #[test]
  fn round_trip_odd_sizes() {
    for (w, h) in [(1u32, 1u32), (3, 5), (7, 9), (5, 3)] {
      let samples = lcg_samples((w * h) as usize, 100);
      round_trip(w, h, &samples, CblkSty::empty(), 2);
    }
  }

  #[test]
  fn round_trip_bypass() {
    let samples = lcg_samples(32 * 32, 4000);
    round_trip(32, 32, &samples, CblkSty::BYPASS, 0);
  }

  #[test]
  fn round_trip_termall() {
    let samples = lcg_samples(16 * 16, 500);
    round_trip(16, 16, &samples, CblkSty::TERMALL, 1);
  }

  #[test]
  fn round_trip_segsym_vsc() {
    let samples = lcg_samples(16 * 16, 500);
    round_trip(16, 16, &samples, CblkSty::SEGSYM | CblkSty::VSC, 3);
  }

  #[test]
  fn round_trip_pterm() {
    let samples = lcg_samples(16 * 16, 500);
    round_trip(16, 16, &samples, CblkSty::PTERM | CblkSty::TERMALL, 0);
  }

  #[test]
  fn round_trip_bypass_reset() {
    let samples = lcg_samples(16 * 16, 3000);
    round_trip(16, 16, &samples, CblkSty::BYPASS | CblkSty::RESET, 2);
  }

  #[test]
  fn all_zero_block_codes_nothing() {
    let samples = vec![0i32; 64];
    round_trip(8, 8, &samples, CblkSty::empty(), 0);
  }

  #[test]
  fn rates_are_monotonic_and_pass_budget_holds() {
    let samples = lcg_samples(64 * 64, 100_000);
    let mut coder = T1Coder::new();
    let enc = coder.encode_cblk(
      64,
      64,
      T1Input::Reversible(&samples),
      0,
      0,
      0,
      1,
      1.0,
      CblkSty::empty(),
      None,
    );
    assert!(enc.passes.len() as u32 <= 3 * enc.numbps - 2);
    let mut prev = 0;
    for pass in &enc.passes {
      assert!(pass.rate >= prev);
      assert_ne!(enc.data.get(pass.rate as usize - 1), Some(&0xffu8));
      prev = pass.rate;
    }
    assert!(enc.wmsedec > 0.0);
  }

  #[test]
  fn truncated_segment_still_decodes() {
    let samples = lcg_samples(16 * 16, 1000);
    let mut coder = T1Coder::new();
    let enc = coder.encode_cblk(
      16,
      16,
      T1Input::Reversible(&samples),
      0,
      0,
      0,
      1,
      1.0,
      CblkSty::empty(),
      None,
    );
    // Truncating at a pass boundary must decode cleanly into a coarse
    // approximation (no error, no panic).
    let keep = enc.passes.len() / 2;
    let cut = enc.passes[keep];
    let segs = [SegSlice {
      data: &enc.data[..cut.rate as usize],
      passes: keep as u32 + 1,
    }];
    let decoded = coder
      .decode_cblk(16, 16, &segs, enc.numbps, 0, 0, CblkSty::empty(), false)
      .unwrap();
    assert_eq!(decoded.len(), 256);
  }

  #[test]
  fn ht_codestream_is_rejected() {
    let mut coder = T1Coder::new();
    let err = coder
      .decode_cblk(8, 8, &[], 5, 0, 0, CblkSty::HT, false)
      .unwrap_err();
    assert!(matches!(err, Error::UnsupportedFeature(_)));
  }

  #[test]
  fn irreversible_input_quantizes_on_load() {
    let samples: Vec<f32> = (0..64).map(|i| (i as f32 - 32.0) * 1.7).collect();
    let mut coder = T1Coder::new();
    let enc = coder.encode_cblk(
      8,
      8,
      T1Input::Irreversible(&samples, 0.5),
      0,
      0,
      0,
      0,
      0.5,
      CblkSty::empty(),
      None,
    );
    assert!(enc.numbps > 0);
  }
}

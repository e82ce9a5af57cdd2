//! Coding parameters: the public encoder/decoder surface and the internal
//! per-tile records derived from it (codestream CP -> tile TCP -> per
//! component TCCP).

use bitflags::bitflags;

use crate::error::{Error, Result};

/// Raw codestream or container framing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecFormat {
  /// Raw JPEG 2000 codestream.
  J2k,
  /// JP2 container (out of scope for the core; detection only).
  Jp2,
  /// HT container (detected, rejected).
  Jph,
  Unknown,
}

impl Default for CodecFormat {
  fn default() -> Self {
    CodecFormat::Unknown
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressionOrder {
  Lrcp,
  Rlcp,
  Rpcl,
  Pcrl,
  Cprl,
}

impl ProgressionOrder {
  pub(crate) fn to_wire(self) -> u8 {
    match self {
      ProgressionOrder::Lrcp => 0,
      ProgressionOrder::Rlcp => 1,
      ProgressionOrder::Rpcl => 2,
      ProgressionOrder::Pcrl => 3,
      ProgressionOrder::Cprl => 4,
    }
  }

  pub(crate) fn from_wire(v: u8) -> Result<Self> {
    Ok(match v {
      0 => ProgressionOrder::Lrcp,
      1 => ProgressionOrder::Rlcp,
      2 => ProgressionOrder::Rpcl,
      3 => ProgressionOrder::Pcrl,
      4 => ProgressionOrder::Cprl,
      _ => return Err(Error::CorruptMarker("bad progression order")),
    })
  }
}

bitflags! {
  /// Code-block style flags (SPcod byte).
  pub struct CblkSty: u32 {
    const BYPASS  = 0x01;
    const RESET   = 0x02;
    const TERMALL = 0x04;
    const VSC     = 0x08;
    const PTERM   = 0x10;
    const SEGSYM  = 0x20;
    /// Part 15 high-throughput blocks; recognized and rejected.
    const HT      = 0x40;
  }
}

bitflags! {
  /// Coding style flags (Scod byte).
  pub struct CodingStyle: u32 {
    const PRECINCTS = 0x01;
    const SOP       = 0x02;
    const EPH       = 0x04;
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MctMode {
  None,
  Reversible3,
  Irreversible3,
  Custom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateControlMode {
  /// Layers bounded by target distortion (PSNR per layer).
  FixedQuality,
  /// Layers bounded by compression ratio per layer.
  FixedRatio,
  /// Everything in one lossless layer.
  Lossless,
}

/// One progression record: loop bounds for the packet iterator. Records
/// concatenate; layers always start at zero within a record.
#[derive(Debug, Clone, Copy)]
pub struct ProgressionRec {
  pub order: ProgressionOrder,
  pub res_lo: u32,
  pub res_hi: u32,
  pub comp_lo: u32,
  pub comp_hi: u32,
  pub layer_hi: u32,
}

/// Quantization stepsize as transported in QCD/QCC: 5-bit exponent,
/// 11-bit mantissa.
#[derive(Debug, Clone, Copy, Default)]
pub struct StepSize {
  pub expn: i32,
  pub mant: u32,
}

pub(crate) const MAX_RESOLUTIONS: usize = 33;
pub(crate) const MAX_BANDS: usize = 3 * MAX_RESOLUTIONS - 2;

/// Quantization style values of Sqcd.
pub(crate) const QNTSTY_NOQNT: u32 = 0;
pub(crate) const QNTSTY_SIQNT: u32 = 1;
pub(crate) const QNTSTY_SEQNT: u32 = 2;

/// Per tile-component coding parameters.
#[derive(Debug, Clone)]
pub(crate) struct TileCompParams {
  pub csty: CodingStyle,
  pub numresolutions: u32,
  pub cblkw_exp: u32,
  pub cblkh_exp: u32,
  pub cblksty: CblkSty,
  /// 1 = reversible 5-3, 0 = irreversible 9-7.
  pub qmfbid: u32,
  pub qntsty: u32,
  pub numgbits: u32,
  pub stepsizes: [StepSize; MAX_BANDS],
  pub roishift: u32,
  /// Precinct exponents per resolution (15 = default maximal precincts).
  pub prcw_exp: [u32; MAX_RESOLUTIONS],
  pub prch_exp: [u32; MAX_RESOLUTIONS],
}

impl Default for TileCompParams {
  fn default() -> Self {
    Self {
      csty: CodingStyle::empty(),
      numresolutions: 6,
      cblkw_exp: 6,
      cblkh_exp: 6,
      cblksty: CblkSty::empty(),
      qmfbid: 1,
      qntsty: QNTSTY_NOQNT,
      numgbits: 2,
      stepsizes: [StepSize::default(); MAX_BANDS],
      roishift: 0,
      prcw_exp: [15; MAX_RESOLUTIONS],
      prch_exp: [15; MAX_RESOLUTIONS],
    }
  }
}

/// Per-tile coding parameters.
#[derive(Debug, Clone)]
pub(crate) struct TileCodingParams {
  pub csty: CodingStyle,
  pub prg: ProgressionOrder,
  pub numlayers: u32,
  /// 0 = none, 1 = reversible RCT, 2 = irreversible ICT, 3 = custom.
  pub mct: u32,
  pub mct_matrix: Option<Vec<f32>>,
  pub rates: Vec<f32>,
  pub distoratio: Vec<f32>,
  pub pocs: Vec<ProgressionRec>,
  pub tccps: Vec<TileCompParams>,
}

impl Default for TileCodingParams {
  fn default() -> Self {
    Self {
      csty: CodingStyle::empty(),
      prg: ProgressionOrder::Lrcp,
      numlayers: 1,
      mct: 0,
      mct_matrix: None,
      rates: Vec::new(),
      distoratio: Vec::new(),
      pocs: Vec::new(),
      tccps: Vec::new(),
    }
  }
}

/// Codestream-wide coding parameters.
#[derive(Debug, Clone, Default)]
pub(crate) struct CodingParams {
  pub tx0: u32,
  pub ty0: u32,
  pub tdx: u32,
  pub tdy: u32,
  pub tw: u32,
  pub th: u32,
  pub tcps: Vec<TileCodingParams>,
  /// Decode-side resolution reduction.
  pub reduce: u32,
  /// Decode-side layer cap (0 = all layers).
  pub max_layers: u32,
  pub rate_mode: Option<RateControlMode>,
  pub write_plt: bool,
  pub write_tlm: bool,
  pub comment: Option<String>,
}

impl CodingParams {
  pub fn num_tiles(&self) -> u32 {
    self.tw * self.th
  }
}

/// Public encoder configuration.
#[derive(Debug, Clone)]
pub struct EncoderParams {
  pub cod_format: CodecFormat,
  /// Tile size; `None` means one tile covering the image.
  pub tile_size: Option<(u32, u32)>,
  pub tile_origin: (u32, u32),
  pub num_resolutions: u32,
  pub cblockw_exp: u32,
  pub cblockh_exp: u32,
  pub cblksty: CblkSty,
  pub progression: ProgressionOrder,
  pub extra_progressions: Vec<ProgressionRec>,
  pub mct: MctMode,
  pub mct_matrix: Option<Vec<f32>>,
  /// false = reversible 5-3, true = irreversible 9-7.
  pub irreversible: bool,
  pub rate_control_mode: RateControlMode,
  /// Per-layer compression ratios (FixedRatio mode).
  pub rates: Vec<f32>,
  /// Per-layer PSNR targets in dB (FixedQuality mode).
  pub qualities: Vec<f32>,
  pub num_layers: u32,
  /// Per-resolution precinct exponents, innermost last; empty = maximal.
  pub precincts: Vec<(u32, u32)>,
  pub num_guard_bits: u32,
  pub roi_comp: Option<u32>,
  pub roi_shift: u32,
  pub use_sop: bool,
  pub use_eph: bool,
  pub write_plt: bool,
  pub write_tlm: bool,
  pub comment: Option<String>,
}

impl Default for EncoderParams {
  fn default() -> Self {
    Self {
      cod_format: CodecFormat::J2k,
      tile_size: None,
      tile_origin: (0, 0),
      num_resolutions: 6,
      cblockw_exp: 6,
      cblockh_exp: 6,
      cblksty: CblkSty::empty(),
      progression: ProgressionOrder::Lrcp,
      extra_progressions: Vec::new(),
      mct: MctMode::None,
      mct_matrix: None,
      irreversible: false,
      rate_control_mode: RateControlMode::Lossless,
      rates: Vec::new(),
      qualities: Vec::new(),
      num_layers: 1,
      precincts: Vec::new(),
      num_guard_bits: 2,
      roi_comp: None,
      roi_shift: 0,
      use_sop: false,
      use_eph: false,
      write_plt: false,
      write_tlm: false,
      comment: None,
    }
  }
}

impl EncoderParams {
  pub fn validate(&self, num_comps: u32, max_prec: u32) -> Result<()> {
    if !(2..=10).contains(&self.cblockw_exp) || !(2..=10).contains(&self.cblockh_exp) {
      return Err(Error::InvalidParameter("code-block exponent out of 2..10"));
    }
    if self.cblockw_exp + self.cblockh_exp > 12 {
      return Err(Error::InvalidParameter("code-block area above 4096 samples"));
    }
    if !(1..=MAX_RESOLUTIONS as u32).contains(&self.num_resolutions) {
      return Err(Error::InvalidParameter("resolution count out of 1..33"));
    }
    if self.num_layers == 0 || self.num_layers > 65535 {
      return Err(Error::InvalidParameter("layer count out of 1..65535"));
    }
    if self.cblksty.contains(CblkSty::HT) {
      return Err(Error::UnsupportedFeature("HT (Part 15) block coding"));
    }
    if max_prec > 31 {
      return Err(Error::UnsupportedFeature(
        "sample precision above 31 bits is not codeable",
      ));
    }
    for &(pw, ph) in &self.precincts {
      if pw > 15 || ph > 15 {
        return Err(Error::InvalidParameter("precinct exponent above 15"));
      }
    }
    match self.mct {
      MctMode::Reversible3 | MctMode::Irreversible3 if num_comps < 3 => {
        return Err(Error::InvalidParameter(
          "component transform needs three components",
        ));
      }
      MctMode::Custom => {
        let n = (num_comps * num_comps) as usize;
        match &self.mct_matrix {
          Some(m) if m.len() == n => {}
          _ => {
            return Err(Error::InvalidParameter(
              "custom transform needs an NxN matrix",
            ))
          }
        }
      }
      _ => {}
    }
    match self.rate_control_mode {
      RateControlMode::FixedRatio if self.rates.len() != self.num_layers as usize => {
        return Err(Error::InvalidParameter("one rate per layer required"));
      }
      RateControlMode::FixedQuality if self.qualities.len() != self.num_layers as usize => {
        return Err(Error::InvalidParameter("one quality per layer required"));
      }
      _ => {}
    }
    Ok(())
  }
}

/// Public decoder configuration.
#[derive(Debug, Clone, Default)]
pub struct DecoderParams {
  pub decod_format: CodecFormat,
  /// Discard this many highest resolution levels.
  pub reduce: u32,
  /// Decode at most this many layers (0 = all).
  pub layers: u32,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn default_params_validate() {
    EncoderParams::default().validate(3, 8).unwrap();
  }

  #[test]
  fn oversized_codeblock_rejected() {
    let params = EncoderParams {
      cblockw_exp: 7,
      cblockh_exp: 7,
      ..Default::default()
    };
    assert!(params.validate(1, 8).is_err());
  }

  #[test]
  fn ht_flag_rejected() {
    let params = EncoderParams {
      cblksty: CblkSty::HT,
      ..Default::default()
    };
    assert!(matches!(
      params.validate(1, 8),
      Err(Error::UnsupportedFeature(_))
    ));
  }

  #[test]
  fn deep_precision_rejected() {
    assert!(EncoderParams::default().validate(1, 38).is_err());
  }

  #[test]
  fn progression_order_wire_round_trip() {
    for order in [
      ProgressionOrder::Lrcp,
      ProgressionOrder::Rlcp,
      ProgressionOrder::Rpcl,
      ProgressionOrder::Pcrl,
      ProgressionOrder::Cprl,
    ] {
      assert_eq!(ProgressionOrder::from_wire(order.to_wire()).unwrap(), order);
    }
  }
}

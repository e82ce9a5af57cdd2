//! Canvas model and per-tile coding state.
//!
//! Geometry is the B-series of the standard: tile grid over the image,
//! tile-components divided by subsampling, resolutions by `ceildivpow2`,
//! bands by the shifted origin of equation B-15, precincts on a
//! power-of-two grid, codeblocks clipped to band and precinct. Ownership
//! is strictly downward (tile -> component -> resolution -> band ->
//! precinct -> codeblock); anything that needs to look upward carries
//! indices.

use smallvec::SmallVec;

use crate::error::{Error, Result};
use crate::image::Image;
use crate::math::{
  ceil_div_i32, ceil_div_pow2_i32, ceil_div_pow2_i64, floor_div_pow2_i32,
};
use crate::params::{CodingParams, TileCodingParams};
use crate::pi::{PiCompInfo, PiResInfo};
use crate::quant;
use crate::sparse_array::SparseArray;
use crate::t1::PassEnc;

/// Half-open rectangle in (reduced) canvas coordinates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Rect {
  pub x0: i32,
  pub y0: i32,
  pub x1: i32,
  pub y1: i32,
}

impl Rect {
  pub fn new(x0: i32, y0: i32, x1: i32, y1: i32) -> Self {
    Self { x0, y0, x1, y1 }
  }

  pub fn width(&self) -> u32 {
    (self.x1 - self.x0).max(0) as u32
  }

  pub fn height(&self) -> u32 {
    (self.y1 - self.y0).max(0) as u32
  }

  pub fn is_empty(&self) -> bool {
    self.x1 <= self.x0 || self.y1 <= self.y0
  }

  pub fn intersects(&self, other: &Rect) -> bool {
    self.x0 < other.x1 && other.x0 < self.x1 && self.y0 < other.y1 && other.y0 < self.y1
  }

  pub fn intersection(&self, other: &Rect) -> Rect {
    Rect {
      x0: self.x0.max(other.x0),
      y0: self.y0.max(other.y0),
      x1: self.x1.min(other.x1),
      y1: self.y1.min(other.y1),
    }
  }

  pub fn area(&self) -> u64 {
    self.width() as u64 * self.height() as u64
  }
}

/// One quality-layer contribution of an encoder codeblock.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct LayerEnc {
  pub numpasses: u32,
  pub len: u32,
  pub data_start: u32,
  pub disto: f64,
}

#[derive(Debug, Default)]
pub(crate) struct CodeblockEnc {
  pub rect: Rect,
  pub numbps: u32,
  pub data: Vec<u8>,
  pub passes: SmallVec<[PassEnc; 16]>,
  /// Passes assigned to layers so far (rate-allocation state).
  pub passes_in_layers: u32,
  /// Passes already written to packets (tier-2 state).
  pub passes_written: u32,
  /// Lblock of the length fields; starts at 3, never decreases.
  pub numlenbits: u32,
  pub layers: Vec<LayerEnc>,
}

impl CodeblockEnc {
  pub fn total_passes(&self) -> u32 {
    self.passes.len() as u32
  }
}

/// One codeword segment of a decoder codeblock.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct SegDec {
  /// Bytes actually retained for this segment.
  pub len: u32,
  /// Passes declared by packet headers (keeps header state in sync even
  /// when a layer cap drops the data).
  pub numpasses: u32,
  /// Passes whose bytes were retained; what tier-1 may decode.
  pub kept_passes: u32,
  pub maxpasses: u32,
}

/// A pending (segment, passes, bytes) triple parsed from a packet header,
/// applied when the packet body arrives.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SegUpdate {
  pub segno: u32,
  pub numpasses: u32,
  pub len: u32,
}

#[derive(Debug, Default)]
pub(crate) struct CodeblockDec {
  pub rect: Rect,
  pub segs: SmallVec<[SegDec; 2]>,
  pub data: Vec<u8>,
  /// Actual coded bitplanes: band Mb minus the zero-bitplane count.
  pub numbps: u32,
  pub numlenbits: u32,
  pub included: bool,
  pub pending: SmallVec<[SegUpdate; 2]>,
  pub corrupt: bool,
}

impl CodeblockDec {
  fn new(rect: Rect) -> Self {
    Self {
      rect,
      numlenbits: 3,
      ..Default::default()
    }
  }
}

#[derive(Debug)]
pub(crate) struct Precinct {
  pub rect: Rect,
  /// Codeblock grid dimensions.
  pub cw: u32,
  pub ch: u32,
  pub cblks_enc: Vec<CodeblockEnc>,
  /// Decoder cells allocate on first traversal.
  pub cblks_dec: Vec<Option<CodeblockDec>>,
  pub incl_tree: crate::tgt::TagTree,
  pub imsb_tree: crate::tgt::TagTree,
}

impl Precinct {
  pub fn num_cblks(&self) -> u32 {
    self.cw * self.ch
  }

  pub fn cblk_dec_or_init(&mut self, cblkno: u32, rect: Rect) -> &mut CodeblockDec {
    self.cblks_dec[cblkno as usize].get_or_insert_with(|| CodeblockDec::new(rect))
  }
}

#[derive(Debug)]
pub(crate) struct Band {
  /// 0 = LL, 1 = HL, 2 = LH, 3 = HH.
  pub orient: u32,
  pub rect: Rect,
  /// Mb of equation E-2.
  pub numbps: u32,
  pub stepsize: f32,
  pub precincts: Vec<Precinct>,
}

impl Band {
  pub fn is_empty(&self) -> bool {
    self.rect.is_empty()
  }
}

#[derive(Debug)]
pub(crate) struct Resolution {
  pub rect: Rect,
  pub pw: u32,
  pub ph: u32,
  pub pdx: u32,
  pub pdy: u32,
  pub bands: Vec<Band>,
}

impl Resolution {
  pub fn num_precincts(&self) -> u32 {
    self.pw * self.ph
  }
}

#[derive(Debug)]
pub(crate) struct TileComp {
  pub compno: u32,
  pub rect: Rect,
  pub numresolutions: u32,
  /// Resolutions actually decoded (reduced by `cp.reduce`).
  pub minimum_num_resolutions: u32,
  pub resolutions: Vec<Resolution>,
  /// Dense pipeline buffer, reversible path.
  pub data_i: Vec<i32>,
  /// Dense pipeline buffer, irreversible path.
  pub data_f: Vec<f32>,
  /// Decode-side coefficient stores; only traversed blocks allocate.
  pub sparse_i: Option<SparseArray<i32>>,
  pub sparse_f: Option<SparseArray<f32>>,
  /// Decode window in tile-component coordinates, when sub-window
  /// decoding is active.
  pub win: Option<Rect>,
}

impl TileComp {
  pub fn width(&self) -> u32 {
    self.rect.width()
  }

  pub fn height(&self) -> u32 {
    self.rect.height()
  }
}

#[derive(Debug)]
pub(crate) struct Tile {
  pub tile_no: u32,
  pub rect: Rect,
  pub comps: Vec<TileComp>,
  pub distotile: f64,
  pub numpix: u64,
  /// Per-layer distortion sums filled by the layer allocator.
  pub distolayer: Vec<f64>,
}

impl Tile {
  /// Build the full tile tree for `tile_no`, per B.3/B.5/B.7 of the
  /// standard.
  pub fn init(
    cp: &CodingParams,
    tcp: &TileCodingParams,
    image: &Image,
    tile_no: u32,
    is_encoder: bool,
  ) -> Result<Tile> {
    let p = tile_no % cp.tw;
    let q = tile_no / cp.tw;

    let tx0 = cp.tx0 + p * cp.tdx;
    let ty0 = cp.ty0 + q * cp.tdy;
    let tile_rect = Rect::new(
      tx0.max(image.x0) as i32,
      ty0.max(image.y0) as i32,
      tx0.saturating_add(cp.tdx).min(image.x1) as i32,
      ty0.saturating_add(cp.tdy).min(image.y1) as i32,
    );
    if tile_rect.is_empty() {
      return Err(Error::CorruptMarker("tile outside the image grid"));
    }

    let mut comps = Vec::with_capacity(image.comps.len());
    let mut numpix = 0u64;
    for (compno, (comp, tccp)) in image.comps.iter().zip(tcp.tccps.iter()).enumerate() {
      if tccp.numresolutions == 0 {
        return Err(Error::CorruptMarker("tile-component with no resolutions"));
      }
      let comp_rect = Rect::new(
        ceil_div_i32(tile_rect.x0, comp.dx as i32),
        ceil_div_i32(tile_rect.y0, comp.dy as i32),
        ceil_div_i32(tile_rect.x1, comp.dx as i32),
        ceil_div_i32(tile_rect.y1, comp.dy as i32),
      );
      let numresolutions = tccp.numresolutions;
      let minimum_num_resolutions = if numresolutions <= cp.reduce {
        1
      } else {
        numresolutions - cp.reduce
      };

      let mut resolutions = Vec::with_capacity(numresolutions as usize);
      for resno in 0..numresolutions {
        let levelno = numresolutions - 1 - resno;
        let res_rect = Rect::new(
          ceil_div_pow2_i32(comp_rect.x0, levelno),
          ceil_div_pow2_i32(comp_rect.y0, levelno),
          ceil_div_pow2_i32(comp_rect.x1, levelno),
          ceil_div_pow2_i32(comp_rect.y1, levelno),
        );
        let pdx = tccp.prcw_exp[resno as usize];
        let pdy = tccp.prch_exp[resno as usize];

        // Precinct grid anchored at power-of-two multiples.
        let tl_prc_x = floor_div_pow2_i32(res_rect.x0, pdx) << pdx;
        let tl_prc_y = floor_div_pow2_i32(res_rect.y0, pdy) << pdy;
        let br_prc_x = (ceil_div_pow2_i32(res_rect.x1, pdx) as i64) << pdx;
        let br_prc_y = (ceil_div_pow2_i32(res_rect.y1, pdy) as i64) << pdy;
        if br_prc_x > i32::MAX as i64 || br_prc_y > i32::MAX as i64 {
          return Err(Error::SparseBufferOverrun);
        }
        let pw = if res_rect.x0 == res_rect.x1 {
          0
        } else {
          ((br_prc_x as i32 - tl_prc_x) >> pdx) as u32
        };
        let ph = if res_rect.y0 == res_rect.y1 {
          0
        } else {
          ((br_prc_y as i32 - tl_prc_y) >> pdy) as u32
        };
        let num_precincts = pw
          .checked_mul(ph)
          .ok_or(Error::SparseBufferOverrun)?;

        // Codeblock-group grid: precincts at resolution 0, half-size
        // cells above it.
        let (tl_cbg_x, tl_cbg_y, cbg_w_exp, cbg_h_exp) = if resno == 0 {
          (tl_prc_x, tl_prc_y, pdx, pdy)
        } else {
          (
            ceil_div_pow2_i32(tl_prc_x, 1),
            ceil_div_pow2_i32(tl_prc_y, 1),
            pdx.saturating_sub(1),
            pdy.saturating_sub(1),
          )
        };
        let cblkw_exp = tccp.cblkw_exp.min(cbg_w_exp);
        let cblkh_exp = tccp.cblkh_exp.min(cbg_h_exp);

        let num_bands = if resno == 0 { 1 } else { 3 };
        let mut bands = Vec::with_capacity(num_bands);
        for bandno in 0..num_bands as u32 {
          let orient = if resno == 0 { 0 } else { bandno + 1 };
          let band_rect = if resno == 0 {
            res_rect
          } else {
            // Equation B-15: shift the orientation bit into the origin
            // before the ceil division.
            let x0b = (orient & 1) as i64;
            let y0b = (orient >> 1) as i64;
            Rect::new(
              ceil_div_pow2_i64(comp_rect.x0 as i64 - (x0b << levelno), levelno + 1),
              ceil_div_pow2_i64(comp_rect.y0 as i64 - (y0b << levelno), levelno + 1),
              ceil_div_pow2_i64(comp_rect.x1 as i64 - (x0b << levelno), levelno + 1),
              ceil_div_pow2_i64(comp_rect.y1 as i64 - (y0b << levelno), levelno + 1),
            )
          };

          let stepno = if resno == 0 {
            0
          } else {
            (3 * resno - 3 + orient) as usize
          };
          let (stepsize, band_numbps) = quant::band_stepsize_numbps(
            &tccp.stepsizes[stepno],
            tccp.qmfbid,
            comp.prec,
            orient,
            tccp.numgbits,
          );

          let mut precincts = Vec::with_capacity(num_precincts as usize);
          for precno in 0..num_precincts {
            let cbg_x = tl_cbg_x + ((precno % pw) << cbg_w_exp) as i32;
            let cbg_y = tl_cbg_y + ((precno / pw) << cbg_h_exp) as i32;
            let cbg_rect = Rect::new(
              cbg_x,
              cbg_y,
              cbg_x + (1 << cbg_w_exp),
              cbg_y + (1 << cbg_h_exp),
            );
            let prc_rect = cbg_rect.intersection(&band_rect);

            let (cw, ch) = if prc_rect.is_empty() {
              (0, 0)
            } else {
              let tl_cblk_x = floor_div_pow2_i32(prc_rect.x0, cblkw_exp) << cblkw_exp;
              let tl_cblk_y = floor_div_pow2_i32(prc_rect.y0, cblkh_exp) << cblkh_exp;
              let br_cblk_x = ceil_div_pow2_i32(prc_rect.x1, cblkw_exp) << cblkw_exp;
              let br_cblk_y = ceil_div_pow2_i32(prc_rect.y1, cblkh_exp) << cblkh_exp;
              (
                ((br_cblk_x - tl_cblk_x) >> cblkw_exp) as u32,
                ((br_cblk_y - tl_cblk_y) >> cblkh_exp) as u32,
              )
            };

            let mut cblks_enc = Vec::new();
            let mut cblks_dec = Vec::new();
            if is_encoder {
              cblks_enc.reserve((cw * ch) as usize);
              for cblkno in 0..cw * ch {
                let rect = cblk_rect(&prc_rect, cblkw_exp, cblkh_exp, cw, cblkno);
                cblks_enc.push(CodeblockEnc {
                  rect,
                  layers: vec![LayerEnc::default(); tcp.numlayers as usize],
                  ..Default::default()
                });
              }
            } else {
              cblks_dec.resize_with((cw * ch) as usize, || None);
            }

            precincts.push(Precinct {
              rect: prc_rect,
              cw,
              ch,
              cblks_enc,
              cblks_dec,
              incl_tree: crate::tgt::TagTree::new(cw, ch),
              imsb_tree: crate::tgt::TagTree::new(cw, ch),
            });
          }

          bands.push(Band {
            orient,
            rect: band_rect,
            numbps: band_numbps,
            stepsize,
            precincts,
          });
        }

        resolutions.push(Resolution {
          rect: res_rect,
          pw,
          ph,
          pdx,
          pdy,
          bands,
        });
      }

      numpix += comp_rect.area();
      comps.push(TileComp {
        compno: compno as u32,
        rect: comp_rect,
        numresolutions,
        minimum_num_resolutions,
        resolutions,
        data_i: Vec::new(),
        data_f: Vec::new(),
        sparse_i: None,
        sparse_f: None,
        win: None,
      });
    }

    Ok(Tile {
      tile_no,
      rect: tile_rect,
      comps,
      distotile: 0.0,
      numpix,
      distolayer: vec![0.0; tcp.numlayers as usize],
    })
  }

  /// Per-component geometry handed to the packet iterator.
  pub fn pi_comp_infos(&self, image: &Image) -> Vec<PiCompInfo> {
    self
      .comps
      .iter()
      .zip(image.comps.iter())
      .map(|(tilec, comp)| {
        PiCompInfo {
          dx: comp.dx,
          dy: comp.dy,
          resolutions: tilec
            .resolutions
            .iter()
            .map(|res| PiResInfo {
              pdx: res.pdx,
              pdy: res.pdy,
              pw: res.pw,
              ph: res.ph,
            })
            .collect(),
        }
      })
      .collect()
  }

  /// The geometric position of one codeblock of band `orient` inside the
  /// resolution-level buffer layout (lows packed before highs).
  pub fn cblk_buffer_origin(
    tilec: &TileComp,
    resno: u32,
    orient: u32,
    cblk_rect: &Rect,
    band_rect: &Rect,
  ) -> (u32, u32) {
    let mut x = (cblk_rect.x0 - band_rect.x0) as u32;
    let mut y = (cblk_rect.y0 - band_rect.y0) as u32;
    if orient & 1 != 0 {
      let pres = &tilec.resolutions[(resno - 1) as usize];
      x += pres.rect.width();
    }
    if orient & 2 != 0 {
      let pres = &tilec.resolutions[(resno - 1) as usize];
      y += pres.rect.height();
    }
    (x, y)
  }
}

fn cblk_rect(prc_rect: &Rect, cblkw_exp: u32, cblkh_exp: u32, cw: u32, cblkno: u32) -> Rect {
  let tl_cblk_x = floor_div_pow2_i32(prc_rect.x0, cblkw_exp) << cblkw_exp;
  let tl_cblk_y = floor_div_pow2_i32(prc_rect.y0, cblkh_exp) << cblkh_exp;
  let cx = tl_cblk_x + ((cblkno % cw) << cblkw_exp) as i32;
  let cy = tl_cblk_y + ((cblkno / cw) << cblkh_exp) as i32;
  Rect::new(cx, cy, cx + (1 << cblkw_exp), cy + (1 << cblkh_exp)).intersection(prc_rect)
}

/// Rect of codeblock `cblkno` in band coordinates; grid cells are clipped
/// to the precinct.
pub(crate) fn cblk_rect_of(prc: &Precinct, cblkw_exp: u32, cblkh_exp: u32, cblkno: u32) -> Rect {
  cblk_rect(&prc.rect, cblkw_exp, cblkh_exp, prc.cw, cblkno)
}

/// Project an axis-aligned tile-component window down to band
/// coordinates: equation B-15 applied to a window instead of the
/// component rectangle.
pub(crate) fn band_window(num_decomps: u32, orient: u32, win: &Rect) -> Rect {
  if num_decomps == 0 {
    return *win;
  }
  let x0b = (orient & 1) as i64;
  let y0b = (orient >> 1) as i64;
  let shift = 1i64 << (num_decomps - 1);
  let proj = |v: i32, b: i64| -> i32 {
    if (v as i64) <= shift * b {
      0
    } else {
      ceil_div_pow2_i64(v as i64 - shift * b, num_decomps)
    }
  };
  Rect::new(
    proj(win.x0, x0b),
    proj(win.y0, y0b),
    proj(win.x1, x0b),
    proj(win.y1, y0b),
  )
}

/// Whether a band-coordinate rectangle intersects the component's decode
/// window once that window is projected to the band and grown by the
/// synthesis filter margin.
pub(crate) fn is_band_window_of_interest(
  tilec: &TileComp,
  resno: u32,
  orient: u32,
  rect: &Rect,
  qmfbid: u32,
) -> bool {
  let win = match &tilec.win {
    Some(win) => *win,
    None => return true,
  };
  let num_decomps = if resno == 0 {
    tilec.numresolutions - 1
  } else {
    tilec.numresolutions - resno
  };
  let mut projected = band_window(num_decomps, orient, &win);
  // Synthesis support per level is the Table F.2/F.3 extension (2 for
  // 5-3, 4 for 9-7); doubling covers the cascade across levels.
  let margin = if qmfbid == 1 { 4 } else { 8 };
  projected.x0 -= margin;
  projected.y0 -= margin;
  projected.x1 += margin;
  projected.y1 += margin;
  projected.intersects(rect)
}

// ---- rate allocation -----------------------------------------------------

/// Assign passes to layer `layno` by slope threshold; `None` takes every
/// remaining pass. Returns the distortion contributed by the layer.
pub(crate) fn makelayer(tile: &mut Tile, layno: u32, thresh: Option<f64>, final_: bool) -> f64 {
  let mut layer_disto = 0.0;
  for tilec in tile.comps.iter_mut() {
    for res in tilec.resolutions.iter_mut() {
      for band in res.bands.iter_mut() {
        if band.is_empty() {
          continue;
        }
        for prc in band.precincts.iter_mut() {
          for cblk in prc.cblks_enc.iter_mut() {
            if layno == 0 {
              cblk.passes_in_layers = 0;
            }
            let mut n = cblk.passes_in_layers;
            match thresh {
              None => n = cblk.total_passes(),
              Some(thresh) => {
                let mut prev_rate = if cblk.passes_in_layers == 0 {
                  0
                } else {
                  cblk.passes[(cblk.passes_in_layers - 1) as usize].rate
                };
                let mut prev_disto = if cblk.passes_in_layers == 0 {
                  0.0
                } else {
                  cblk.passes[(cblk.passes_in_layers - 1) as usize].distortiondec
                };
                for passno in cblk.passes_in_layers..cblk.total_passes() {
                  let pass = cblk.passes[passno as usize];
                  let dr = pass.rate.wrapping_sub(prev_rate);
                  let dd = pass.distortiondec - prev_disto;
                  if dr == 0 {
                    if dd != 0.0 {
                      n = passno + 1;
                    }
                  } else if thresh - dd / (dr as f64) < f64::EPSILON {
                    n = passno + 1;
                  }
                  prev_rate = pass.rate;
                  prev_disto = pass.distortiondec;
                }
              }
            }

            let layer = &mut cblk.layers[layno as usize];
            layer.numpasses = n - cblk.passes_in_layers;
            if layer.numpasses == 0 {
              layer.disto = 0.0;
              continue;
            }
            if cblk.passes_in_layers == 0 {
              layer.len = cblk.passes[(n - 1) as usize].rate;
              layer.data_start = 0;
              layer.disto = cblk.passes[(n - 1) as usize].distortiondec;
            } else {
              let prev = &cblk.passes[(cblk.passes_in_layers - 1) as usize];
              layer.len = cblk.passes[(n - 1) as usize].rate - prev.rate;
              layer.data_start = prev.rate;
              layer.disto = cblk.passes[(n - 1) as usize].distortiondec - prev.distortiondec;
            }
            layer_disto += layer.disto;
            if final_ {
              cblk.passes_in_layers = n;
            }
          }
        }
      }
    }
  }
  tile.distolayer[layno as usize] = layer_disto;
  layer_disto
}

/// Slope range (dd/dr) over all feasible truncation points of the tile.
pub(crate) fn slope_range(tile: &Tile) -> (f64, f64) {
  let mut min = f64::MAX;
  let mut max = 0.0f64;
  for tilec in &tile.comps {
    for res in &tilec.resolutions {
      for band in &res.bands {
        if band.is_empty() {
          continue;
        }
        for prc in &band.precincts {
          for cblk in &prc.cblks_enc {
            let mut prev_rate = 0u32;
            let mut prev_disto = 0.0;
            for pass in &cblk.passes {
              let dr = pass.rate.wrapping_sub(prev_rate);
              let dd = pass.distortiondec - prev_disto;
              if dr != 0 {
                let slope = dd / dr as f64;
                min = min.min(slope);
                max = max.max(slope);
              }
              prev_rate = pass.rate;
              prev_disto = pass.distortiondec;
            }
          }
        }
      }
    }
  }
  (min, max)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::image::{ColorSpace, ImageCompParams};
  use crate::params::{TileCodingParams, TileCompParams};

  fn setup(
    img_w: u32,
    img_h: u32,
    tdx: u32,
    tdy: u32,
    numres: u32,
  ) -> (CodingParams, TileCodingParams, Image) {
    let image = Image::new(
      0,
      0,
      img_w,
      img_h,
      &[ImageCompParams::default()],
      ColorSpace::Gray,
    )
    .unwrap();
    let mut tccp = TileCompParams::default();
    tccp.numresolutions = numres;
    quant::calc_explicit_stepsizes(&mut tccp, 8);
    let tcp = TileCodingParams {
      tccps: vec![tccp],
      ..Default::default()
    };
    let cp = CodingParams {
      tdx,
      tdy,
      tw: (img_w + tdx - 1) / tdx,
      th: (img_h + tdy - 1) / tdy,
      ..Default::default()
    };
    (cp, tcp, image)
  }

  #[test]
  fn band_rects_tile_the_resolution() {
    let (cp, tcp, image) = setup(65, 43, 128, 128, 3);
    let tile = Tile::init(&cp, &tcp, &image, 0, true).unwrap();
    let tilec = &tile.comps[0];
    // Union of band areas at each r > 0 plus the previous resolution
    // equals the current resolution area.
    for resno in 1..tilec.numresolutions as usize {
      let res = &tilec.resolutions[resno];
      let prev = &tilec.resolutions[resno - 1];
      let band_area: u64 = res.bands.iter().map(|b| b.rect.area()).sum();
      assert_eq!(
        band_area + prev.rect.area(),
        res.rect.area(),
        "resolution {}",
        resno
      );
    }
    // Highest resolution must equal the tile-component rect.
    let top = tilec.resolutions.last().unwrap();
    assert_eq!(top.rect, tilec.rect);
  }

  #[test]
  fn codeblock_rects_stay_inside_band_and_precinct() {
    let (cp, tcp, image) = setup(200, 200, 256, 256, 4);
    let tile = Tile::init(&cp, &tcp, &image, 0, true).unwrap();
    for tilec in &tile.comps {
      for (resno, res) in tilec.resolutions.iter().enumerate() {
        for band in &res.bands {
          for prc in &band.precincts {
            let tccp_cblkw = 6.min(if resno == 0 { res.pdx } else { res.pdx - 1 });
            let tccp_cblkh = 6.min(if resno == 0 { res.pdy } else { res.pdy - 1 });
            for cblkno in 0..prc.num_cblks() {
              let rect = cblk_rect_of(prc, tccp_cblkw, tccp_cblkh, cblkno);
              assert!(!rect.is_empty());
              assert_eq!(rect, rect.intersection(&prc.rect));
              assert_eq!(rect, rect.intersection(&band.rect));
            }
          }
        }
      }
    }
  }

  #[test]
  fn tag_tree_leaves_match_codeblock_count() {
    let (cp, tcp, image) = setup(100, 100, 128, 128, 3);
    let tile = Tile::init(&cp, &tcp, &image, 0, true).unwrap();
    for tilec in &tile.comps {
      for res in &tilec.resolutions {
        for band in &res.bands {
          for prc in &band.precincts {
            assert_eq!(prc.incl_tree.num_leaves(), prc.num_cblks());
            assert_eq!(prc.imsb_tree.num_leaves(), prc.num_cblks());
          }
        }
      }
    }
  }

  #[test]
  fn band_window_projects_with_orientation_shift() {
    let win = Rect::new(100, 100, 200, 200);
    // One decomposition, LL: plain ceildiv by 2.
    let ll = band_window(1, 0, &win);
    assert_eq!(ll, Rect::new(50, 50, 100, 100));
    // HL shifts x by half the scale first.
    let hl = band_window(1, 1, &win);
    assert_eq!(hl, Rect::new(50, 50, 100, 100));
    let win2 = Rect::new(101, 100, 201, 200);
    assert_eq!(band_window(1, 1, &win2), Rect::new(50, 50, 100, 100));
    assert_eq!(band_window(1, 0, &win2), Rect::new(51, 50, 101, 100));
  }

  #[test]
  fn multi_tile_grid_covers_image() {
    let (mut cp, tcp, image) = setup(64, 64, 32, 32, 2);
    cp.tw = 2;
    cp.th = 2;
    let mut area = 0;
    for tile_no in 0..4 {
      let tile = Tile::init(&cp, &tcp, &image, tile_no, true).unwrap();
      area += tile.rect.area();
    }
    assert_eq!(area, 64 * 64);
  }
}

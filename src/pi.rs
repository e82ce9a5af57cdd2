//! Packet iterator: yields the (layer, resolution, component, precinct)
//! sequence of one tile for a list of progression records.
//!
//! Records concatenate and an inclusion bitset keeps every identity
//! unique across them. The position-driven orders (RPCL, PCRL, CPRL)
//! walk the tile rectangle in canvas coordinates and hit a precinct
//! exactly when (x, y) lands on its origin, so precincts appear in image
//! order regardless of subsampling or per-component resolution counts.

use crate::math::floor_div_pow2_i32;
use crate::params::{ProgressionOrder, ProgressionRec};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PacketId {
  pub layno: u32,
  pub resno: u32,
  pub compno: u32,
  pub precno: u32,
}

#[derive(Debug, Clone)]
pub(crate) struct PiResInfo {
  pub pdx: u32,
  pub pdy: u32,
  pub pw: u32,
  pub ph: u32,
}

#[derive(Debug, Clone)]
pub(crate) struct PiCompInfo {
  pub dx: u32,
  pub dy: u32,
  pub resolutions: Vec<PiResInfo>,
}

#[derive(Debug, Clone)]
pub(crate) struct PacketIter {
  seq: Vec<PacketId>,
  cursor: usize,
}

struct Gen<'a> {
  comps: &'a [PiCompInfo],
  tx0: u32,
  ty0: u32,
  tx1: u32,
  ty1: u32,
  num_layers: u32,
  /// Per-(comp, res) offsets into the per-layer precinct index space.
  prec_base: Vec<Vec<u32>>,
  prec_per_layer: u32,
  included: Vec<bool>,
  seq: Vec<PacketId>,
}

impl<'a> Gen<'a> {
  fn push(&mut self, id: PacketId) {
    let idx = (id.layno * self.prec_per_layer
      + self.prec_base[id.compno as usize][id.resno as usize]
      + id.precno) as usize;
    if !self.included[idx] {
      self.included[idx] = true;
      self.seq.push(id);
    }
  }

  fn res(&self, compno: u32, resno: u32) -> Option<&PiResInfo> {
    let comp = &self.comps[compno as usize];
    comp.resolutions.get(resno as usize)
  }

  fn num_precincts(&self, compno: u32, resno: u32) -> u32 {
    self
      .res(compno, resno)
      .map(|r| r.pw * r.ph)
      .unwrap_or(0)
  }

  /// Precinct hit by canvas position (x, y), if the position is a
  /// precinct origin for this component and resolution.
  fn precinct_at(&self, x: u32, y: u32, compno: u32, resno: u32) -> Option<u32> {
    let comp = &self.comps[compno as usize];
    let res = self.res(compno, resno)?;
    if res.pw == 0 || res.ph == 0 {
      return None;
    }
    let levelno = comp.resolutions.len() as u32 - 1 - resno;
    if levelno >= 32 {
      return None;
    }
    let cdx = comp.dx as u64;
    let cdy = comp.dy as u64;
    let trx0 = ceil_div64(self.tx0 as u64, cdx << levelno);
    let try0 = ceil_div64(self.ty0 as u64, cdy << levelno);
    let trx1 = ceil_div64(self.tx1 as u64, cdx << levelno);
    let try1 = ceil_div64(self.ty1 as u64, cdy << levelno);
    if trx0 == trx1 || try0 == try1 {
      return None;
    }
    let rpx = res.pdx + levelno;
    let rpy = res.pdy + levelno;
    let y_hit = (y as u64) % (cdy << rpy) == 0
      || (y == self.ty0 && (try0 << levelno) % (1 << rpy) != 0);
    let x_hit = (x as u64) % (cdx << rpx) == 0
      || (x == self.tx0 && (trx0 << levelno) % (1 << rpx) != 0);
    if !x_hit || !y_hit {
      return None;
    }
    let prci = floor_div_pow2_i32(ceil_div64(x as u64, cdx << levelno) as i32, res.pdx)
      - floor_div_pow2_i32(trx0 as i32, res.pdx);
    let prcj = floor_div_pow2_i32(ceil_div64(y as u64, cdy << levelno) as i32, res.pdy)
      - floor_div_pow2_i32(try0 as i32, res.pdy);
    Some(prci as u32 + prcj as u32 * res.pw)
  }

  /// Smallest canvas steps that cannot jump over any precinct origin of
  /// the record's component/resolution span.
  fn pos_steps(&self, rec: &ProgressionRec) -> (u32, u32) {
    let mut dx = u32::MAX;
    let mut dy = u32::MAX;
    for compno in rec.comp_lo..rec.comp_hi.min(self.comps.len() as u32) {
      let comp = &self.comps[compno as usize];
      for resno in rec.res_lo..rec.res_hi.min(comp.resolutions.len() as u32) {
        let res = &comp.resolutions[resno as usize];
        let levelno = comp.resolutions.len() as u32 - 1 - resno;
        let sx = (comp.dx as u64) << (res.pdx + levelno);
        let sy = (comp.dy as u64) << (res.pdy + levelno);
        if sx <= u32::MAX as u64 {
          dx = dx.min(sx as u32);
        }
        if sy <= u32::MAX as u64 {
          dy = dy.min(sy as u32);
        }
      }
    }
    (dx, dy)
  }

  fn positions(&self, rec: &ProgressionRec) -> Vec<(u32, u32)> {
    let (dx, dy) = self.pos_steps(rec);
    if dx == u32::MAX || dy == u32::MAX {
      return Vec::new();
    }
    let mut out = Vec::new();
    let mut y = self.ty0;
    while y < self.ty1 {
      let mut x = self.tx0;
      while x < self.tx1 {
        out.push((x, y));
        x += dx - (x % dx);
      }
      y += dy - (y % dy);
    }
    out
  }

  fn run_record(&mut self, rec: &ProgressionRec) {
    let comp_hi = rec.comp_hi.min(self.comps.len() as u32);
    let layer_hi = rec.layer_hi.min(self.num_layers);
    match rec.order {
      ProgressionOrder::Lrcp => {
        for layno in 0..layer_hi {
          for resno in rec.res_lo..rec.res_hi {
            for compno in rec.comp_lo..comp_hi {
              for precno in 0..self.num_precincts(compno, resno) {
                self.push(PacketId {
                  layno,
                  resno,
                  compno,
                  precno,
                });
              }
            }
          }
        }
      }
      ProgressionOrder::Rlcp => {
        for resno in rec.res_lo..rec.res_hi {
          for layno in 0..layer_hi {
            for compno in rec.comp_lo..comp_hi {
              for precno in 0..self.num_precincts(compno, resno) {
                self.push(PacketId {
                  layno,
                  resno,
                  compno,
                  precno,
                });
              }
            }
          }
        }
      }
      ProgressionOrder::Rpcl => {
        let positions = self.positions(rec);
        for resno in rec.res_lo..rec.res_hi {
          for &(x, y) in &positions {
            for compno in rec.comp_lo..comp_hi {
              if let Some(precno) = self.precinct_at(x, y, compno, resno) {
                for layno in 0..layer_hi {
                  self.push(PacketId {
                    layno,
                    resno,
                    compno,
                    precno,
                  });
                }
              }
            }
          }
        }
      }
      ProgressionOrder::Pcrl => {
        let positions = self.positions(rec);
        for &(x, y) in &positions {
          for compno in rec.comp_lo..comp_hi {
            let nres = self.comps[compno as usize].resolutions.len() as u32;
            for resno in rec.res_lo..rec.res_hi.min(nres) {
              if let Some(precno) = self.precinct_at(x, y, compno, resno) {
                for layno in 0..layer_hi {
                  self.push(PacketId {
                    layno,
                    resno,
                    compno,
                    precno,
                  });
                }
              }
            }
          }
        }
      }
      ProgressionOrder::Cprl => {
        for compno in rec.comp_lo..comp_hi {
          let positions = self.positions(&ProgressionRec {
            comp_lo: compno,
            comp_hi: compno + 1,
            ..*rec
          });
          let nres = self.comps[compno as usize].resolutions.len() as u32;
          for &(x, y) in &positions {
            for resno in rec.res_lo..rec.res_hi.min(nres) {
              if let Some(precno) = self.precinct_at(x, y, compno, resno) {
                for layno in 0..layer_hi {
                  self.push(PacketId {
                    layno,
                    resno,
                    compno,
                    precno,
                  });
                }
              }
            }
          }
        }
      }
    }
  }
}

#[inline]
fn ceil_div64(a: u64, b: u64) -> u64 {
  (a + b - 1) / b
}

impl PacketIter {
  /// Build the iterator for one tile. `records` concatenate; identities
  /// already yielded by an earlier record are skipped.
  pub fn new(
    comps: &[PiCompInfo],
    tile_rect: (u32, u32, u32, u32),
    num_layers: u32,
    records: &[ProgressionRec],
  ) -> Self {
    let mut prec_base = Vec::with_capacity(comps.len());
    let mut total = 0u32;
    for comp in comps {
      let mut bases = Vec::with_capacity(comp.resolutions.len());
      for res in &comp.resolutions {
        bases.push(total);
        total += res.pw * res.ph;
      }
      prec_base.push(bases);
    }
    let mut gen = Gen {
      comps,
      tx0: tile_rect.0,
      ty0: tile_rect.1,
      tx1: tile_rect.2,
      ty1: tile_rect.3,
      num_layers,
      prec_base,
      prec_per_layer: total,
      included: vec![false; (total * num_layers) as usize],
      seq: Vec::new(),
    };
    for rec in records {
      gen.run_record(rec);
    }
    PacketIter {
      seq: gen.seq,
      cursor: 0,
    }
  }

  pub fn reset(&mut self) {
    self.cursor = 0;
  }

  pub fn len(&self) -> usize {
    self.seq.len()
  }
}

impl Iterator for PacketIter {
  type Item = PacketId;

  fn next(&mut self) -> Option<PacketId> {
    let id = self.seq.get(self.cursor).copied();
    if id.is_some() {
      self.cursor += 1;
    }
    id
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  /// Components over a 256x256 tile with 2x2 precincts at every
  /// resolution (precinct side halves with each level, staying at half
  /// the resolution extent).
  fn simple_comps(num_comps: usize, num_res: usize) -> Vec<PiCompInfo> {
    (0..num_comps)
      .map(|_| PiCompInfo {
        dx: 1,
        dy: 1,
        resolutions: (0..num_res)
          .map(|r| {
            let width = 256u32 >> (num_res - 1 - r);
            let pdx = crate::math::floor_log2(width) - 1;
            PiResInfo {
              pdx,
              pdy: pdx,
              pw: 2,
              ph: 2,
            }
          })
          .collect(),
      })
      .collect()
  }

  fn full_record(order: ProgressionOrder, num_res: u32, num_comps: u32, layers: u32) -> ProgressionRec {
    ProgressionRec {
      order,
      res_lo: 0,
      res_hi: num_res,
      comp_lo: 0,
      comp_hi: num_comps,
      layer_hi: layers,
    }
  }

  #[test]
  fn lrcp_yields_layer_major_order() {
    let comps = simple_comps(2, 3);
    let pi = PacketIter::new(
      &comps,
      (0, 0, 256, 256),
      2,
      &[full_record(ProgressionOrder::Lrcp, 3, 2, 2)],
    );
    let ids: Vec<_> = pi.collect();
    assert_eq!(ids.len(), 2 * 3 * 2 * 4);
    // All layer-0 packets precede all layer-1 packets.
    let first_l1 = ids.iter().position(|id| id.layno == 1).unwrap();
    assert!(ids[..first_l1].iter().all(|id| id.layno == 0));
    assert_eq!(first_l1, 24);
  }

  #[test]
  fn rlcp_groups_by_resolution() {
    let comps = simple_comps(1, 3);
    let pi = PacketIter::new(
      &comps,
      (0, 0, 256, 256),
      2,
      &[full_record(ProgressionOrder::Rlcp, 3, 1, 2)],
    );
    let ids: Vec<_> = pi.collect();
    assert_eq!(ids.len(), 3 * 2 * 4);
    let mut last_res = 0;
    for id in &ids {
      assert!(id.resno >= last_res, "resolution must never decrease");
      last_res = id.resno;
    }
  }

  #[test]
  fn every_identity_yielded_exactly_once() {
    for order in [
      ProgressionOrder::Lrcp,
      ProgressionOrder::Rlcp,
      ProgressionOrder::Rpcl,
      ProgressionOrder::Pcrl,
      ProgressionOrder::Cprl,
    ] {
      let comps = simple_comps(3, 3);
      let pi = PacketIter::new(&comps, (0, 0, 256, 256), 2, &[full_record(order, 3, 3, 2)]);
      let ids: Vec<_> = pi.collect();
      assert_eq!(ids.len(), 2 * 3 * 3 * 4, "order {:?}", order);
      let mut seen = std::collections::HashSet::new();
      for id in &ids {
        assert!(
          seen.insert((id.layno, id.resno, id.compno, id.precno)),
          "duplicate {:?} in {:?}",
          id,
          order
        );
      }
    }
  }

  #[test]
  fn rpcl_is_resolution_grouped() {
    let comps = simple_comps(1, 3);
    let pi = PacketIter::new(
      &comps,
      (0, 0, 256, 256),
      1,
      &[full_record(ProgressionOrder::Rpcl, 3, 1, 1)],
    );
    let ids: Vec<_> = pi.collect();
    assert_eq!(ids.len(), 3 * 4);
    let mut last_res = 0;
    for id in &ids {
      assert!(id.resno >= last_res);
      last_res = id.resno;
    }
  }

  #[test]
  fn concatenated_records_skip_duplicates() {
    let comps = vec![PiCompInfo {
      dx: 1,
      dy: 1,
      resolutions: vec![
        PiResInfo {
          pdx: 15,
          pdy: 15,
          pw: 1,
          ph: 1,
        },
        PiResInfo {
          pdx: 15,
          pdy: 15,
          pw: 1,
          ph: 1,
        },
      ],
    }];
    // The second record re-spans the first; only the extra layer emerges.
    let recs = [
      ProgressionRec {
        order: ProgressionOrder::Lrcp,
        res_lo: 0,
        res_hi: 2,
        comp_lo: 0,
        comp_hi: 1,
        layer_hi: 1,
      },
      ProgressionRec {
        order: ProgressionOrder::Lrcp,
        res_lo: 0,
        res_hi: 2,
        comp_lo: 0,
        comp_hi: 1,
        layer_hi: 2,
      },
    ];
    let pi = PacketIter::new(&comps, (0, 0, 32, 32), 2, &recs);
    let ids: Vec<_> = pi.collect();
    assert_eq!(ids.len(), 4);
    assert_eq!(ids[2].layno, 1);
  }

  #[test]
  fn restartable() {
    let comps = simple_comps(1, 1);
    let mut pi = PacketIter::new(
      &comps,
      (0, 0, 256, 256),
      1,
      &[full_record(ProgressionOrder::Lrcp, 1, 1, 1)],
    );
    let first: Vec<_> = pi.by_ref().collect();
    pi.reset();
    let second: Vec<_> = pi.collect();
    assert_eq!(first, second);
  }

  #[test]
  fn subsampled_component_precinct_walk() {
    // One component subsampled 2x with 2x2 precincts at the top level.
    let comps = vec![PiCompInfo {
      dx: 2,
      dy: 2,
      resolutions: vec![
        PiResInfo {
          pdx: 6,
          pdy: 6,
          pw: 1,
          ph: 1,
        },
        PiResInfo {
          pdx: 6,
          pdy: 6,
          pw: 2,
          ph: 2,
        },
      ],
    }];
    let pi = PacketIter::new(
      &comps,
      (0, 0, 256, 256),
      1,
      &[full_record(ProgressionOrder::Pcrl, 2, 1, 1)],
    );
    let ids: Vec<_> = pi.collect();
    assert_eq!(ids.len(), 1 + 4);
  }
}

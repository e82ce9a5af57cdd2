//! Tile-processing scheduler.
//!
//! A process-wide executor (work-stealing pool) runs a two-level task
//! graph per tile: each component owns a chain of `ResFlow`s (packets ->
//! blocks -> wavelet-horizontal -> wavelet-vertical, the lowest
//! resolution skipping the wavelet), and a final pre/post-processing
//! stage joins the components for the component transform and the
//! level-shift. Components execute in parallel; within a node, block
//! coding fans out one task per codeblock and the wavelet passes fan out
//! in row stripes. Shared state is limited to the per-worker coder pool,
//! one distortion accumulator (compress), one completed-block counter
//! (decompress) and the success flag that makes remaining tasks fast-exit
//! after a failure.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use rayon::prelude::*;

use crate::dwt::{self, LevelGeom};
use crate::error::{Error, Result};
use crate::event::EventMgr;
use crate::image::Image;
use crate::mct;
use crate::params::{CodingParams, RateControlMode, TileCodingParams};
use crate::sparse_array::SparseArray;
use crate::t1::{SegSlice, T1Coder, T1Input};
use crate::t2;
use crate::tcd::{self, Rect, Tile, TileComp};

// ---- executor ------------------------------------------------------------

fn pool_slot() -> &'static Mutex<Option<Arc<rayon::ThreadPool>>> {
  static SLOT: OnceLock<Mutex<Option<Arc<rayon::ThreadPool>>>> = OnceLock::new();
  SLOT.get_or_init(|| Mutex::new(None))
}

/// Process-wide executor handle.
pub struct Executor;

impl Executor {
  /// Create the worker pool with an explicit thread count. Fails if the
  /// pool already exists.
  pub fn init(num_threads: usize) -> Result<()> {
    let mut slot = pool_slot().lock().unwrap();
    if slot.is_some() {
      return Err(Error::InvalidParameter("executor already initialized"));
    }
    let pool = rayon::ThreadPoolBuilder::new()
      .num_threads(num_threads.max(1))
      .build()
      .map_err(|_| Error::InvalidParameter("worker pool creation failed"))?;
    *slot = Some(Arc::new(pool));
    Ok(())
  }

  /// Drop the process-wide pool; workers exit once running tiles finish.
  pub fn shutdown() {
    pool_slot().lock().unwrap().take();
  }

  pub(crate) fn get() -> Arc<rayon::ThreadPool> {
    let mut slot = pool_slot().lock().unwrap();
    if let Some(pool) = slot.as_ref() {
      return pool.clone();
    }
    let pool = Arc::new(
      rayon::ThreadPoolBuilder::new()
        .num_threads(num_cpus::get())
        .build()
        .expect("default worker pool"),
    );
    *slot = Some(pool.clone());
    pool
  }

  pub(crate) fn num_workers() -> usize {
    Self::get().current_num_threads()
  }
}

/// Per-worker tier-1 coder instances, indexed by the executor's worker
/// id; reused across tiles.
pub(crate) struct CoderPool {
  coders: Vec<Mutex<T1Coder>>,
}

impl CoderPool {
  pub fn new(num_workers: usize) -> Self {
    Self {
      coders: (0..num_workers.max(1)).map(|_| Mutex::new(T1Coder::new())).collect(),
    }
  }

  pub fn with<R>(&self, f: impl FnOnce(&mut T1Coder) -> R) -> R {
    let idx = rayon::current_thread_index().unwrap_or(0) % self.coders.len();
    let mut coder = self.coders[idx].lock().unwrap();
    f(&mut coder)
  }
}

// ---- per-tile task graph -------------------------------------------------

/// One resolution's node chain inside a component flow.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ResFlow {
  pub resno: u32,
  /// The lowest resolution has no wavelet step.
  pub do_wavelet: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct ComponentFlow {
  pub compno: u32,
  pub res_flows: Vec<ResFlow>,
}

pub(crate) fn build_flows(tile: &Tile, decode: bool) -> Vec<ComponentFlow> {
  tile
    .comps
    .iter()
    .map(|tilec| {
      let num_res = if decode {
        tilec.minimum_num_resolutions
      } else {
        tilec.numresolutions
      };
      ComponentFlow {
        compno: tilec.compno,
        res_flows: (0..num_res)
          .map(|resno| ResFlow {
            resno,
            do_wavelet: resno > 0,
          })
          .collect(),
      }
    })
    .collect()
}

/// Shared run state: the success flag collapses every task error into a
/// single outcome, keeping only the first message.
struct RunState {
  success: AtomicBool,
  first_error: Mutex<Option<Error>>,
  blocks_done: AtomicU32,
}

impl RunState {
  fn new() -> Self {
    Self {
      success: AtomicBool::new(true),
      first_error: Mutex::new(None),
      blocks_done: AtomicU32::new(0),
    }
  }

  fn fail(&self, err: Error) {
    if self.success.swap(false, Ordering::SeqCst) {
      *self.first_error.lock().unwrap() = Some(err);
    }
  }

  fn ok(&self) -> bool {
    self.success.load(Ordering::Relaxed)
  }

  fn into_result(self) -> Result<()> {
    if self.success.load(Ordering::SeqCst) {
      Ok(())
    } else {
      Err(
        self
          .first_error
          .lock()
          .unwrap()
          .take()
          .unwrap_or(Error::Aborted),
      )
    }
  }
}

fn level_stages(tilec: &TileComp, num_res: u32) -> Vec<LevelGeom> {
  let dims: Vec<(u32, u32)> = tilec.resolutions[..num_res as usize]
    .iter()
    .map(|r| (r.rect.width(), r.rect.height()))
    .collect();
  let origins: Vec<(i32, i32)> = tilec.resolutions[..num_res as usize]
    .iter()
    .map(|r| (r.rect.x0, r.rect.y0))
    .collect();
  LevelGeom::stages(&dims, &origins)
}

/// Stripe height for line-striped wavelet tasks: a worker gets at least
/// a cache-line-aligned group of rows.
const WAVELET_STRIPE: usize = 16;

// ---- compress pipeline ---------------------------------------------------

/// Run the full compress graph for one tile: level shift, component
/// transform, forward wavelet, block coding, layer allocation, packet
/// write. Returns the packet bytes and their per-packet lengths.
pub(crate) fn compress_tile(
  tile: &mut Tile,
  image: &Image,
  cp: &CodingParams,
  tcp: &TileCodingParams,
  events: &EventMgr,
) -> Result<(Vec<u8>, Vec<u32>)> {
  let pool = Executor::get();
  let state = RunState::new();
  let coder_pool = CoderPool::new(Executor::num_workers());
  let distortion = Mutex::new(0.0f64);

  let mct_norms = mct_norms_for(tcp, image);

  pool.install(|| {
    // Pre-processing joins the components before the per-component
    // flows: load, level-shift, component transform.
    if let Err(err) = preprocess_compress(tile, image, tcp) {
      state.fail(err);
    }

    if state.ok() {
      let flows = build_flows(tile, false);
      tile
        .comps
        .par_iter_mut()
        .zip(flows.par_iter())
        .for_each(|(tilec, flow)| {
          if !state.ok() {
            return;
          }
          // Forward wavelet runs finest-to-coarsest as one chain; the
          // per-ResFlow blocks then read the settled coefficients.
          let stages = level_stages(tilec, tilec.numresolutions);
          let qmfbid = tcp.tccps[flow.compno as usize].qmfbid;
          let stride = tilec.rect.width() as usize;
          for geom in &stages {
            if qmfbid == 1 {
              dwt::encode_cols_53(&mut tilec.data_i, stride, geom);
              stripe_rows_i(&mut tilec.data_i, stride, geom, |row, scratch| {
                dwt::encode_row_53(row, scratch, geom)
              });
            } else {
              dwt::encode_cols_97(&mut tilec.data_f, stride, geom);
              stripe_rows_f(&mut tilec.data_f, stride, geom, |row, scratch| {
                dwt::encode_row_97(row, scratch, geom)
              });
            }
          }

          for res_flow in &flow.res_flows {
            if !state.ok() {
              return;
            }
            encode_blocks_of_resolution(
              tilec,
              tcp,
              res_flow.resno,
              &coder_pool,
              &state,
              &distortion,
              mct_norms.as_deref(),
            );
          }
        });
    }
  });

  state.into_result().map_err(|err| {
    events.error(format!("tile {}: {}", tile.tile_no, err));
    err
  })?;
  tile.distotile = *distortion.lock().unwrap();

  rate_allocate(tile, image, cp, tcp, events)?;

  let mut dest = Vec::new();
  let lengths = t2::encode_packets(tile, image, tcp, tcp.numlayers, &mut dest, None)?;
  Ok((dest, lengths))
}

fn mct_norms_for(tcp: &TileCodingParams, image: &Image) -> Option<Vec<f64>> {
  match tcp.mct {
    1 => Some(mct::norms().to_vec()),
    2 => Some(mct::norms_real().to_vec()),
    3 => tcp
      .mct_matrix
      .as_ref()
      .map(|m| mct::calculate_norms(m, image.comps.len())),
    _ => None,
  }
}

fn preprocess_compress(tile: &mut Tile, image: &Image, tcp: &TileCodingParams) -> Result<()> {
  // Load tile windows out of the image components with the DC level
  // shift applied.
  for (tilec, comp) in tile.comps.iter_mut().zip(image.comps.iter()) {
    let w = tilec.rect.width() as usize;
    let h = tilec.rect.height() as usize;
    tilec.data_i.clear();
    tilec.data_i.resize(w * h, 0);
    let shift = if comp.sgnd {
      0
    } else {
      1i32 << (comp.prec - 1)
    };
    for y in 0..h {
      let img_y = tilec.rect.y0 as u32 - comp.y0 + y as u32;
      let src_base = (img_y * comp.w + (tilec.rect.x0 as u32 - comp.x0)) as usize;
      let dst = &mut tilec.data_i[y * w..y * w + w];
      for (d, &s) in dst.iter_mut().zip(&comp.data[src_base..src_base + w]) {
        *d = s - shift;
      }
    }
  }

  // Component transform.
  match tcp.mct {
    1 => {
      if tile.comps.len() >= 3 {
        let (a, rest) = tile.comps.split_at_mut(1);
        let (b, c) = rest.split_at_mut(1);
        mct::encode(&mut a[0].data_i, &mut b[0].data_i, &mut c[0].data_i);
      }
    }
    3 => {
      if let Some(matrix) = &tcp.mct_matrix {
        let mut refs: Vec<&mut [i32]> = tile
          .comps
          .iter_mut()
          .map(|t| t.data_i.as_mut_slice())
          .collect();
        mct::encode_custom(matrix, &mut refs);
      }
    }
    _ => {}
  }

  // The irreversible path continues in floats; the ICT runs there.
  for (compno, tilec) in tile.comps.iter_mut().enumerate() {
    if tcp.tccps[compno].qmfbid == 0 {
      tilec.data_f = tilec.data_i.iter().map(|&v| v as f32).collect();
      tilec.data_i = Vec::new();
    }
  }
  if tcp.mct == 2 && tile.comps.len() >= 3 {
    let (a, rest) = tile.comps.split_at_mut(1);
    let (b, c) = rest.split_at_mut(1);
    mct::encode_real(&mut a[0].data_f, &mut b[0].data_f, &mut c[0].data_f);
  }
  Ok(())
}

fn stripe_rows_i(
  data: &mut [i32],
  stride: usize,
  geom: &LevelGeom,
  f: impl Fn(&mut [i32], &mut Vec<i32>) + Sync,
) {
  data
    .par_chunks_mut(stride * WAVELET_STRIPE)
    .enumerate()
    .for_each(|(chunk_no, chunk)| {
      let mut scratch = Vec::new();
      let base_row = chunk_no * WAVELET_STRIPE;
      for (i, row) in chunk.chunks_mut(stride).enumerate() {
        if base_row + i >= geom.rh as usize {
          break;
        }
        f(&mut row[..geom.rw as usize], &mut scratch);
      }
    });
}

fn stripe_rows_f(
  data: &mut [f32],
  stride: usize,
  geom: &LevelGeom,
  f: impl Fn(&mut [f32], &mut Vec<f32>) + Sync,
) {
  data
    .par_chunks_mut(stride * WAVELET_STRIPE)
    .enumerate()
    .for_each(|(chunk_no, chunk)| {
      let mut scratch = Vec::new();
      let base_row = chunk_no * WAVELET_STRIPE;
      for (i, row) in chunk.chunks_mut(stride).enumerate() {
        if base_row + i >= geom.rh as usize {
          break;
        }
        f(&mut row[..geom.rw as usize], &mut scratch);
      }
    });
}

#[allow(clippy::too_many_arguments)]
fn encode_blocks_of_resolution(
  tilec: &mut TileComp,
  tcp: &TileCodingParams,
  resno: u32,
  coder_pool: &CoderPool,
  state: &RunState,
  distortion: &Mutex<f64>,
  mct_norms: Option<&[f64]>,
) {
  let tccp = &tcp.tccps[tilec.compno as usize];
  let level = tilec.numresolutions - 1 - resno;
  let stride = tilec.rect.width() as usize;
  let compno = tilec.compno;

  // Snapshot block geometry, then fan out one task per codeblock.
  struct Job {
    bandno: usize,
    precno: usize,
    cblkno: usize,
    x: u32,
    y: u32,
    w: u32,
    h: u32,
    orient: u32,
    stepsize: f32,
  }
  let mut jobs = Vec::new();
  {
    let res = &tilec.resolutions[resno as usize];
    for (bandno, band) in res.bands.iter().enumerate() {
      if band.is_empty() {
        continue;
      }
      for (precno, prc) in band.precincts.iter().enumerate() {
        for cblkno in 0..prc.num_cblks() as usize {
          let rect = prc.cblks_enc[cblkno].rect;
          if rect.is_empty() {
            continue;
          }
          let (x, y) =
            Tile::cblk_buffer_origin(tilec, resno, band.orient, &rect, &band.rect);
          jobs.push(Job {
            bandno,
            precno,
            cblkno,
            x,
            y,
            w: rect.width(),
            h: rect.height(),
            orient: band.orient,
            stepsize: band.stepsize,
          });
        }
      }
    }
  }

  let data_i = std::mem::take(&mut tilec.data_i);
  let data_f = std::mem::take(&mut tilec.data_f);

  let results: Vec<(usize, usize, usize, crate::t1::EncodedCblk)> = jobs
    .par_iter()
    .filter_map(|job| {
      if !state.ok() {
        return None;
      }
      let n = (job.w * job.h) as usize;
      let encoded = coder_pool.with(|coder| {
        if tccp.qmfbid == 1 {
          let mut samples = Vec::with_capacity(n);
          for row in 0..job.h as usize {
            let base = (job.y as usize + row) * stride + job.x as usize;
            samples.extend_from_slice(&data_i[base..base + job.w as usize]);
          }
          coder.encode_cblk(
            job.w,
            job.h,
            T1Input::Reversible(&samples),
            job.orient,
            compno,
            level,
            tccp.qmfbid,
            job.stepsize as f64,
            tccp.cblksty,
            mct_norms,
          )
        } else {
          let mut samples = Vec::with_capacity(n);
          for row in 0..job.h as usize {
            let base = (job.y as usize + row) * stride + job.x as usize;
            samples.extend_from_slice(&data_f[base..base + job.w as usize]);
          }
          coder.encode_cblk(
            job.w,
            job.h,
            T1Input::Irreversible(&samples, job.stepsize),
            job.orient,
            compno,
            level,
            tccp.qmfbid,
            job.stepsize as f64,
            tccp.cblksty,
            mct_norms,
          )
        }
      });
      let mut disto = distortion.lock().unwrap();
      *disto += encoded.wmsedec;
      Some((job.bandno, job.precno, job.cblkno, encoded))
    })
    .collect();

  tilec.data_i = data_i;
  tilec.data_f = data_f;

  let res = &mut tilec.resolutions[resno as usize];
  for (bandno, precno, cblkno, encoded) in results {
    let cblk = &mut res.bands[bandno].precincts[precno].cblks_enc[cblkno];
    cblk.numbps = encoded.numbps;
    cblk.passes = encoded.passes;
    cblk.data = encoded.data;
  }
}

// ---- rate allocation -----------------------------------------------------

/// Layer assignment: slope bisection against a byte budget (fixed ratio,
/// via simulated packet writes) or a distortion target (fixed quality);
/// lossless puts everything into the first layer.
pub(crate) fn rate_allocate(
  tile: &mut Tile,
  image: &Image,
  cp: &CodingParams,
  tcp: &TileCodingParams,
  events: &EventMgr,
) -> Result<()> {
  let mode = cp.rate_mode.unwrap_or(RateControlMode::Lossless);
  match mode {
    RateControlMode::Lossless => {
      tcd::makelayer(tile, 0, None, true);
      for layno in 1..tcp.numlayers {
        tcd::makelayer(tile, layno, Some(f64::MAX), true);
      }
      return Ok(());
    }
    _ => {}
  }

  let (min_slope, max_slope) = tcd::slope_range(tile);
  if min_slope > max_slope {
    // Nothing was coded; empty layers are still legal.
    for layno in 0..tcp.numlayers {
      tcd::makelayer(tile, layno, Some(f64::MAX), true);
    }
    return Ok(());
  }

  let uncompressed_bytes: f64 = tile
    .comps
    .iter()
    .zip(image.comps.iter())
    .map(|(tilec, comp)| tilec.rect.area() as f64 * comp.prec as f64 / 8.0)
    .sum();
  let max_se: f64 = tile
    .comps
    .iter()
    .zip(image.comps.iter())
    .map(|(tilec, comp)| {
      let peak = ((1u64 << comp.prec) - 1) as f64;
      peak * peak * tilec.rect.area() as f64
    })
    .sum();

  let mut scratch = Vec::new();
  let mut cumdisto = 0.0f64;
  for layno in 0..tcp.numlayers {
    match mode {
      RateControlMode::FixedRatio => {
        let rate = tcp.rates.get(layno as usize).copied().unwrap_or(0.0);
        if rate <= 0.0 {
          // An unbounded layer takes every remaining pass.
          tcd::makelayer(tile, layno, None, true);
          continue;
        }
        let budget = (uncompressed_bytes / rate as f64) as usize;
        let mut lo = min_slope;
        let mut hi = max_slope;
        let mut stable = None;
        for _ in 0..128 {
          let thresh = (lo + hi) / 2.0;
          tcd::makelayer(tile, layno, Some(thresh), false);
          scratch.clear();
          match t2::encode_packets(tile, image, tcp, layno + 1, &mut scratch, Some(budget)) {
            Ok(_) => {
              stable = Some(thresh);
              hi = thresh;
            }
            Err(Error::Aborted) => lo = thresh,
            Err(err) => return Err(err),
          }
        }
        match stable {
          Some(thresh) => {
            tcd::makelayer(tile, layno, Some(thresh), true);
          }
          None => {
            events.warning(format!(
              "tile {}: layer {} byte budget unreachable, writing an empty layer",
              tile.tile_no, layno
            ));
            tcd::makelayer(tile, layno, Some(f64::MAX), true);
          }
        }
      }
      RateControlMode::FixedQuality => {
        let quality = tcp.distoratio.get(layno as usize).copied().unwrap_or(0.0);
        if quality <= 0.0 {
          tcd::makelayer(tile, layno, None, true);
          cumdisto += tile.distolayer[layno as usize];
          continue;
        }
        let target = tile.distotile - max_se / 10f64.powf(quality as f64 / 10.0);
        let mut lo = min_slope;
        let mut hi = max_slope;
        let mut stable = None;
        for _ in 0..128 {
          let thresh = (lo + hi) / 2.0;
          tcd::makelayer(tile, layno, Some(thresh), false);
          let achieved = cumdisto + tile.distolayer[layno as usize];
          if achieved >= target {
            stable = Some(thresh);
            lo = thresh;
          } else {
            hi = thresh;
          }
        }
        let thresh = stable.unwrap_or(min_slope);
        tcd::makelayer(tile, layno, Some(thresh), true);
        cumdisto += tile.distolayer[layno as usize];
      }
      RateControlMode::Lossless => unreachable!(),
    }
  }
  Ok(())
}

// ---- decompress pipeline -------------------------------------------------

/// Decoded output of one tile: per component, the reduced-resolution
/// sample grid after inverse wavelet, inverse component transform, level
/// shift and clamping.
#[derive(Debug)]
pub(crate) struct DecodedTile {
  pub comps: Vec<DecodedComp>,
}

#[derive(Debug)]
pub(crate) struct DecodedComp {
  /// Reduced-resolution rectangle in component coordinates.
  pub rect: Rect,
  pub data: Vec<i32>,
}

/// Run the decompress graph for one tile whose packets have been parsed:
/// per component, block decoding into the sparse store, inverse wavelet
/// chains, then the joined inverse component transform and level shift.
pub(crate) fn decompress_tile(
  tile: &mut Tile,
  image: &Image,
  tcp: &TileCodingParams,
  events: &EventMgr,
) -> Result<DecodedTile> {
  let pool = Executor::get();
  let state = RunState::new();
  let coder_pool = CoderPool::new(Executor::num_workers());

  pool.install(|| {
    let flows = build_flows(tile, true);
    tile
      .comps
      .par_iter_mut()
      .zip(flows.par_iter())
      .for_each(|(tilec, flow)| {
        if !state.ok() {
          return;
        }
        if let Err(err) = decompress_component(tilec, tcp, flow, &coder_pool, &state) {
          state.fail(err);
        }
      });
  });
  state.into_result().map_err(|err| {
    events.error(format!("tile {}: {}", tile.tile_no, err));
    err
  })?;

  postprocess_decompress(tile, image, tcp, events)
}

fn decompress_component(
  tilec: &mut TileComp,
  tcp: &TileCodingParams,
  flow: &ComponentFlow,
  coder_pool: &CoderPool,
  state: &RunState,
) -> Result<()> {
  let tccp = &tcp.tccps[tilec.compno as usize];
  let num_res = tilec.minimum_num_resolutions;
  let full_w = tilec.rect.width();
  let full_h = tilec.rect.height();
  if full_w == 0 || full_h == 0 {
    return Ok(());
  }

  if tccp.qmfbid == 1 {
    tilec.sparse_i = Some(SparseArray::new(full_w, full_h, 64, 64)?);
  } else {
    tilec.sparse_f = Some(SparseArray::new(full_w, full_h, 64, 64)?);
  }

  // Blocks node of every ResFlow: decode the resolution's codeblocks and
  // settle them (dequantized) into the sparse store.
  for res_flow in &flow.res_flows {
    if !state.ok() {
      return Err(Error::Aborted);
    }
    decode_blocks_of_resolution(tilec, tcp, res_flow.resno, coder_pool, state)?;
  }

  // Wavelet nodes: rebuild resolution r from r-1 plus its bands. The
  // dense buffer keeps the usual packed pyramid layout.
  let stages = level_stages(tilec, num_res);
  let target = &tilec.resolutions[(num_res - 1) as usize];
  let (tw, th) = (target.rect.width(), target.rect.height());
  if tw == 0 || th == 0 {
    return Ok(());
  }
  let stride = tw as usize;
  if tccp.qmfbid == 1 {
    let mut dense = vec![0i32; (tw * th) as usize];
    let sparse = tilec.sparse_i.as_ref().unwrap();
    sparse.read(0, 0, tw, th, &mut dense, tw)?;
    for geom in stages.iter().rev() {
      stripe_rows_i(&mut dense, stride, geom, |row, scratch| {
        dwt::decode_row_53(row, scratch, geom)
      });
      dwt::decode_cols_53(&mut dense, stride, geom);
    }
    tilec.data_i = dense;
  } else {
    let mut dense = vec![0f32; (tw * th) as usize];
    let sparse = tilec.sparse_f.as_ref().unwrap();
    sparse.read(0, 0, tw, th, &mut dense, tw)?;
    for geom in stages.iter().rev() {
      stripe_rows_f(&mut dense, stride, geom, |row, scratch| {
        dwt::decode_row_97(row, scratch, geom)
      });
      dwt::decode_cols_97(&mut dense, stride, geom);
    }
    tilec.data_f = dense;
  }
  Ok(())
}

fn decode_blocks_of_resolution(
  tilec: &mut TileComp,
  tcp: &TileCodingParams,
  resno: u32,
  coder_pool: &CoderPool,
  state: &RunState,
) -> Result<()> {
  let tccp = &tcp.tccps[tilec.compno as usize];
  let qmfbid = tccp.qmfbid;

  struct Job<'a> {
    cblk: &'a crate::tcd::CodeblockDec,
    x: u32,
    y: u32,
    orient: u32,
    stepsize: f32,
  }

  // Collect decode jobs for blocks inside the window of interest.
  let mut jobs: Vec<Job<'_>> = Vec::new();
  let res_ptr = &tilec.resolutions[resno as usize];
  for band in res_ptr.bands.iter() {
    if band.is_empty() {
      continue;
    }
    for prc in band.precincts.iter() {
      for cblk in prc.cblks_dec.iter().flatten() {
        if cblk.rect.is_empty() {
          continue;
        }
        if !tcd::is_band_window_of_interest(tilec, resno, band.orient, &cblk.rect, qmfbid) {
          continue;
        }
        let (x, y) =
          Tile::cblk_buffer_origin(tilec, resno, band.orient, &cblk.rect, &band.rect);
        jobs.push(Job {
          cblk,
          x,
          y,
          orient: band.orient,
          stepsize: band.stepsize,
        });
      }
    }
  }

  struct Placed {
    x: u32,
    y: u32,
    w: u32,
    h: u32,
    data_i: Vec<i32>,
    data_f: Vec<f32>,
  }

  let placed: Vec<Placed> = jobs
    .par_iter()
    .filter_map(|job| {
      if !state.ok() {
        return None;
      }
      let cblk = job.cblk;
      let w = cblk.rect.width();
      let h = cblk.rect.height();
      let mut segs: Vec<SegSlice<'_>> = Vec::with_capacity(cblk.segs.len());
      let mut offset = 0usize;
      for seg in &cblk.segs {
        let take = (seg.len as usize).min(cblk.data.len() - offset);
        if seg.kept_passes > 0 {
          segs.push(SegSlice {
            data: &cblk.data[offset..offset + take],
            passes: seg.kept_passes,
          });
        }
        offset += take;
      }
      let decoded = coder_pool.with(|coder| {
        coder.decode_cblk(
          w,
          h,
          &segs,
          cblk.numbps,
          job.orient,
          tccp.roishift,
          tccp.cblksty,
          tccp.cblksty.contains(crate::params::CblkSty::PTERM),
        )
      });
      state.blocks_done.fetch_add(1, Ordering::Relaxed);
      match decoded {
        Ok(values) => {
          // Dequantize: the coder output is at twice the coefficient
          // scale.
          if qmfbid == 1 {
            let data_i: Vec<i32> = values.iter().map(|&v| v / 2).collect();
            Some(Placed {
              x: job.x,
              y: job.y,
              w,
              h,
              data_i,
              data_f: Vec::new(),
            })
          } else {
            let half_step = job.stepsize / 2.0;
            let data_f: Vec<f32> = values.iter().map(|&v| v as f32 * half_step).collect();
            Some(Placed {
              x: job.x,
              y: job.y,
              w,
              h,
              data_i: Vec::new(),
              data_f,
            })
          }
        }
        Err(Error::CorruptPacketData) => {
          // Contained: the block stays zero and decoding continues.
          log::warn!("corrupt codeword in a codeblock, block zeroed");
          None
        }
        Err(err) => {
          state.fail(err);
          None
        }
      }
    })
    .collect();

  for p in placed {
    if qmfbid == 1 {
      tilec
        .sparse_i
        .as_mut()
        .unwrap()
        .write(p.x, p.y, p.x + p.w, p.y + p.h, &p.data_i, p.w)?;
    } else {
      tilec
        .sparse_f
        .as_mut()
        .unwrap()
        .write(p.x, p.y, p.x + p.w, p.y + p.h, &p.data_f, p.w)?;
    }
  }
  Ok(())
}

/// The joined post-processing node: inverse component transform, DC
/// level shift, clamping to the component range.
fn postprocess_decompress(
  tile: &mut Tile,
  image: &Image,
  tcp: &TileCodingParams,
  events: &EventMgr,
) -> Result<DecodedTile> {
  // Inverse MCT over the first three components when the geometry lines
  // up; mismatched components downgrade to a warning, as required.
  let mct_ok = tile.comps.len() >= 3 && {
    let r0 = tile.comps[0].resolutions[(tile.comps[0].minimum_num_resolutions - 1) as usize]
      .rect;
    (1..3).all(|i| {
      let t = &tile.comps[i];
      t.resolutions[(t.minimum_num_resolutions - 1) as usize].rect.area() == r0.area()
    })
  };
  match tcp.mct {
    1 if mct_ok => {
      let (a, rest) = tile.comps.split_at_mut(1);
      let (b, c) = rest.split_at_mut(1);
      mct::decode(&mut a[0].data_i, &mut b[0].data_i, &mut c[0].data_i);
    }
    2 if mct_ok => {
      let (a, rest) = tile.comps.split_at_mut(1);
      let (b, c) = rest.split_at_mut(1);
      mct::decode_real(&mut a[0].data_f, &mut b[0].data_f, &mut c[0].data_f);
    }
    3 => {
      if let Some(matrix) = &tcp.mct_matrix {
        let all_f = tile.comps.iter().all(|t| !t.data_f.is_empty());
        if all_f {
          let mut refs: Vec<&mut [f32]> = tile
            .comps
            .iter_mut()
            .map(|t| t.data_f.as_mut_slice())
            .collect();
          mct::decode_custom(matrix, &mut refs);
        }
      }
    }
    0 => {}
    _ => {
      if tcp.mct != 0 {
        events.warning("component transform skipped: components do not line up");
      }
    }
  }

  let mut comps = Vec::with_capacity(tile.comps.len());
  for (tilec, comp) in tile.comps.iter_mut().zip(image.comps.iter()) {
    let num_res = tilec.minimum_num_resolutions;
    let rect = tilec.resolutions[(num_res - 1) as usize].rect;
    let n = rect.area() as usize;
    let shift = if comp.sgnd {
      0
    } else {
      1i32 << (comp.prec - 1)
    };
    let (lo, hi) = if comp.sgnd {
      (-(1i32 << (comp.prec - 1)), (1i32 << (comp.prec - 1)) - 1)
    } else {
      (0, ((1u64 << comp.prec) - 1) as i32)
    };
    let mut data = Vec::with_capacity(n);
    if !tilec.data_i.is_empty() {
      data.extend(tilec.data_i.iter().map(|&v| (v + shift).clamp(lo, hi)));
    } else {
      data.extend(
        tilec
          .data_f
          .iter()
          .map(|&v| ((v + shift as f32).round() as i32).clamp(lo, hi)),
      );
    }
    tilec.data_i = Vec::new();
    tilec.data_f = Vec::new();
    comps.push(DecodedComp { rect, data });
  }
  Ok(DecodedTile { comps })
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn executor_default_has_workers() {
    assert!(Executor::num_workers() >= 1);
  }

  #[test]
  fn flows_skip_wavelet_at_lowest_resolution() {
    // Flow shape is derived from resolution counts alone.
    let flows = vec![ComponentFlow {
      compno: 0,
      res_flows: vec![
        ResFlow {
          resno: 0,
          do_wavelet: false,
        },
        ResFlow {
          resno: 1,
          do_wavelet: true,
        },
      ],
    }];
    assert!(!flows[0].res_flows[0].do_wavelet);
    assert!(flows[0].res_flows[1].do_wavelet);
  }

  #[test]
  fn coder_pool_hands_out_coders() {
    let pool = CoderPool::new(4);
    let sum: u32 = (0..16u32)
      .map(|i| pool.with(|_| i))
      .sum();
    assert_eq!(sum, 120);
  }

  #[test]
  fn run_state_keeps_first_error() {
    let state = RunState::new();
    state.fail(Error::CorruptTlm);
    state.fail(Error::CorruptSot);
    assert_eq!(state.into_result().unwrap_err(), Error::CorruptTlm);
  }
}

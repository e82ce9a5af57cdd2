//! Strip cache: composites finished tiles into horizontal strips and
//! emits them to the caller strictly in strip-index order.
//!
//! Producers (tile tasks) push completed strips into a channel; one
//! serializer thread owns a min-heap keyed by strip index, releases
//! strips as their turn comes and hands the buffers back to the pool.

use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crossbeam_channel::{unbounded, Sender};

use crate::error::{Error, Result};

/// One emitted strip: interleaved samples of all components over full
/// strip rows, in reduced-canvas resolution.
#[derive(Debug)]
pub struct StripData {
  pub strip_index: u32,
  pub y0: u32,
  pub width: u32,
  pub height: u32,
  pub num_comps: u32,
  pub samples: Vec<i32>,
}

pub type StripCallback = Arc<dyn Fn(&StripData) + Send + Sync>;

struct StripState {
  buf: Mutex<Option<Vec<i32>>>,
  tiles_done: AtomicU32,
  y0: u32,
  height: u32,
}

struct HeapEntry(StripData);

impl PartialEq for HeapEntry {
  fn eq(&self, other: &Self) -> bool {
    self.0.strip_index == other.0.strip_index
  }
}
impl Eq for HeapEntry {}
impl PartialOrd for HeapEntry {
  fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
    Some(self.cmp(other))
  }
}
impl Ord for HeapEntry {
  fn cmp(&self, other: &Self) -> std::cmp::Ordering {
    // Reversed: BinaryHeap is a max-heap, we pop the smallest index.
    other.0.strip_index.cmp(&self.0.strip_index)
  }
}

pub(crate) struct StripCache {
  strips: Vec<StripState>,
  tiles_per_row: u32,
  width: u32,
  num_comps: u32,
  pool: Arc<Mutex<Vec<Vec<i32>>>>,
  sender: Option<Sender<StripData>>,
  worker: Option<JoinHandle<()>>,
}

impl StripCache {
  /// `strip_heights[i]` is the pixel height of tile-row i at the decoded
  /// resolution; `width` the decoded image width.
  pub fn new(
    width: u32,
    strip_y0s: &[u32],
    strip_heights: &[u32],
    tiles_per_row: u32,
    num_comps: u32,
    callback: StripCallback,
  ) -> Self {
    let strips = strip_y0s
      .iter()
      .zip(strip_heights.iter())
      .map(|(&y0, &height)| StripState {
        buf: Mutex::new(None),
        tiles_done: AtomicU32::new(0),
        y0,
        height,
      })
      .collect();
    let pool: Arc<Mutex<Vec<Vec<i32>>>> = Arc::new(Mutex::new(Vec::new()));
    let (sender, receiver) = unbounded::<StripData>();
    let pool_for_worker = pool.clone();
    // The serializer thread alone invokes the user callback, in strictly
    // ascending strip order.
    let worker = std::thread::spawn(move || {
      let mut heap: BinaryHeap<HeapEntry> = BinaryHeap::new();
      let mut next = 0u32;
      for strip in receiver.iter() {
        heap.push(HeapEntry(strip));
        while heap.peek().map(|e| e.0.strip_index) == Some(next) {
          let entry = heap.pop().unwrap();
          callback(&entry.0);
          pool_for_worker.lock().unwrap().push(entry.0.samples);
          next += 1;
        }
      }
      // Channel closed: flush whatever remains, still in order.
      while let Some(entry) = heap.pop() {
        callback(&entry.0);
        pool_for_worker.lock().unwrap().push(entry.0.samples);
      }
    });
    Self {
      strips,
      tiles_per_row,
      width,
      num_comps,
      pool,
      sender: Some(sender),
      worker: Some(worker),
    }
  }

  fn get_buffer(&self, len: usize) -> Vec<i32> {
    let mut pool = self.pool.lock().unwrap();
    for i in 0..pool.len() {
      if pool[i].capacity() >= len {
        let mut buf = pool.swap_remove(i);
        buf.clear();
        buf.resize(len, 0);
        return buf;
      }
    }
    vec![0; len]
  }

  /// Interleave one finished tile into its strip. `comp_planes[c]` holds
  /// the tile's samples of component c with its rectangle in reduced
  /// component coordinates; `comp_sub[c]` the (dx, dy) subsampling.
  /// When the strip completes it is queued for in-order emission.
  #[allow(clippy::too_many_arguments)]
  pub fn composite_interleaved(
    &self,
    strip_index: u32,
    tile_x0: u32,
    tile_x1: u32,
    comp_planes: &[(crate::tcd::Rect, &[i32])],
    comp_sub: &[(u32, u32)],
  ) -> Result<()> {
    let strip = self
      .strips
      .get(strip_index as usize)
      .ok_or(Error::SparseBufferOverrun)?;
    let nc = self.num_comps as usize;
    let row_len = self.width as usize * nc;
    let len = row_len * strip.height as usize;
    {
      let mut guard = strip.buf.lock().unwrap();
      if guard.is_none() {
        *guard = Some(self.get_buffer(len));
      }
      let buf = guard.as_mut().unwrap();
      for (c, ((rect, plane), &(dx, dy))) in
        comp_planes.iter().zip(comp_sub.iter()).enumerate()
      {
        let cw = rect.width();
        for gy in strip.y0..strip.y0 + strip.height {
          let cy = (gy / dy) as i32;
          if cy < rect.y0 || cy >= rect.y1 {
            continue;
          }
          for gx in tile_x0..tile_x1.min(self.width) {
            let cx = (gx / dx) as i32;
            if cx < rect.x0 || cx >= rect.x1 {
              continue;
            }
            let src = ((cy - rect.y0) as u32 * cw + (cx - rect.x0) as u32) as usize;
            let dst = (gy - strip.y0) as usize * row_len + gx as usize * nc + c;
            buf[dst] = plane[src];
          }
        }
      }
    }
    let done = strip.tiles_done.fetch_add(1, Ordering::AcqRel) + 1;
    if done == self.tiles_per_row {
      let samples = strip.buf.lock().unwrap().take().unwrap();
      let data = StripData {
        strip_index,
        y0: strip.y0,
        width: self.width,
        height: strip.height,
        num_comps: self.num_comps,
        samples,
      };
      if let Some(sender) = &self.sender {
        sender.send(data).map_err(|_| Error::Aborted)?;
      }
    }
    Ok(())
  }

  /// Close the channel and wait for the serializer to drain.
  pub fn finish(&mut self) {
    self.sender.take();
    if let Some(worker) = self.worker.take() {
      let _ = worker.join();
    }
  }
}

impl Drop for StripCache {
  fn drop(&mut self) {
    self.finish();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::tcd::Rect;

  #[test]
  fn strips_emit_in_order_even_when_finished_out_of_order() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let mut cache = StripCache::new(
      4,
      &[0, 2, 4],
      &[2, 2, 2],
      1,
      1,
      Arc::new(move |strip: &StripData| {
        sink.lock().unwrap().push(strip.strip_index);
      }),
    );
    let plane: Vec<i32> = (0..8).collect();
    // Finish strips 2, 0, 1 in that order.
    for &idx in &[2u32, 0, 1] {
      let rect = Rect::new(0, idx as i32 * 2, 4, idx as i32 * 2 + 2);
      cache
        .composite_interleaved(idx, 0, 4, &[(rect, plane.as_slice())], &[(1, 1)])
        .unwrap();
    }
    cache.finish();
    assert_eq!(&*seen.lock().unwrap(), &[0, 1, 2]);
  }

  #[test]
  fn interleaves_components_per_pixel() {
    let seen: Arc<Mutex<Vec<i32>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let mut cache = StripCache::new(
      2,
      &[0],
      &[1],
      1,
      2,
      Arc::new(move |strip: &StripData| {
        sink.lock().unwrap().extend_from_slice(&strip.samples);
      }),
    );
    let rect = Rect::new(0, 0, 2, 1);
    let a = [10, 11];
    let b = [20, 21];
    cache
      .composite_interleaved(0, 0, 2, &[(rect, &a[..]), (rect, &b[..])], &[(1, 1), (1, 1)])
      .unwrap();
    cache.finish();
    assert_eq!(&*seen.lock().unwrap(), &[10, 20, 11, 21]);
  }

  #[test]
  fn strip_waits_for_all_tiles_of_its_row() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let mut cache = StripCache::new(
      4,
      &[0],
      &[2],
      2,
      1,
      Arc::new(move |strip: &StripData| {
        sink.lock().unwrap().push(strip.strip_index);
      }),
    );
    let plane = [1i32; 4];
    let left = Rect::new(0, 0, 2, 2);
    cache
      .composite_interleaved(0, 0, 2, &[(left, &plane[..])], &[(1, 1)])
      .unwrap();
    assert!(seen.lock().unwrap().is_empty());
    let right = Rect::new(2, 0, 4, 2);
    cache
      .composite_interleaved(0, 2, 4, &[(right, &plane[..])], &[(1, 1)])
      .unwrap();
    cache.finish();
    assert_eq!(&*seen.lock().unwrap(), &[0]);
  }
}

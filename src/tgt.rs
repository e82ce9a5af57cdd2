//! Tag trees (B.10.2): quad-tree pyramids of minimum values used for
//! code-block inclusion and zero-bitplane signalling.
//!
//! Nodes live in one flat vector, leaves first, each level holding the
//! ceil-halved grid of the one below; links are parent indices. State
//! (`value`, `low`, `known`) persists across packets of one precinct and
//! is only cleared by [`TagTree::reset`].

use crate::bio::{BitReader, BitWriter};
use crate::error::Result;

/// Sentinel for "not set yet"; larger than any layer count or bitplane.
const UNSET: i32 = 999;

#[derive(Debug, Clone, Copy, Default)]
struct TagNode {
  parent: Option<u32>,
  value: i32,
  low: i32,
  known: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct TagTree {
  leaves_w: u32,
  leaves_h: u32,
  nodes: Vec<TagNode>,
}

impl TagTree {
  /// Build a tree over a `leaves_w` x `leaves_h` grid. A zero-sized grid
  /// yields an empty tree that rejects all queries.
  pub fn new(leaves_w: u32, leaves_h: u32) -> Self {
    let mut tree = Self {
      leaves_w,
      leaves_h,
      nodes: Vec::new(),
    };
    tree.rebuild();
    tree
  }

  /// Re-dimension in place, keeping the allocation when possible.
  pub fn init(&mut self, leaves_w: u32, leaves_h: u32) {
    if self.leaves_w != leaves_w || self.leaves_h != leaves_h {
      self.leaves_w = leaves_w;
      self.leaves_h = leaves_h;
      self.rebuild();
    }
    self.reset();
  }

  fn rebuild(&mut self) {
    self.nodes.clear();
    if self.leaves_w == 0 || self.leaves_h == 0 {
      return;
    }
    // Per-level grid sizes, ceil-halved until a single node remains.
    let mut dims = vec![(self.leaves_w, self.leaves_h)];
    while {
      let (w, h) = *dims.last().unwrap();
      w * h > 1
    } {
      let (w, h) = *dims.last().unwrap();
      dims.push(((w + 1) / 2, (h + 1) / 2));
    }
    let total: u32 = dims.iter().map(|&(w, h)| w * h).sum();
    self.nodes = vec![TagNode::default(); total as usize];

    let mut level_base = 0u32;
    for lvl in 0..dims.len() - 1 {
      let (w, h) = dims[lvl];
      let (pw, _) = dims[lvl + 1];
      let parent_base = level_base + w * h;
      for y in 0..h {
        for x in 0..w {
          let node = level_base + y * w + x;
          self.nodes[node as usize].parent = Some(parent_base + (y / 2) * pw + (x / 2));
        }
      }
      level_base = parent_base;
    }
    self.reset();
  }

  pub fn num_leaves(&self) -> u32 {
    self.leaves_w * self.leaves_h
  }

  pub fn reset(&mut self) {
    for node in &mut self.nodes {
      node.value = UNSET;
      node.low = 0;
      node.known = false;
    }
  }

  /// Record a leaf value; propagates the minimum up to the root.
  pub fn set_value(&mut self, leaf: u32, value: i32) {
    let mut cur = leaf as usize;
    loop {
      let node = &mut self.nodes[cur];
      if node.value <= value {
        break;
      }
      node.value = value;
      match node.parent {
        Some(p) => cur = p as usize,
        None => break,
      }
    }
  }

  fn path_to_root(&self, leaf: u32) -> Vec<usize> {
    let mut path = vec![leaf as usize];
    while let Some(p) = self.nodes[*path.last().unwrap()].parent {
      path.push(p as usize);
    }
    path
  }

  /// Emit the bits that prove, at `threshold`, whether the leaf's value has
  /// been reached; already-communicated bits are skipped.
  pub fn encode(&mut self, bio: &mut BitWriter, leaf: u32, threshold: i32) {
    debug_assert!(leaf < self.num_leaves());
    let path = self.path_to_root(leaf);
    let mut low = 0;
    for &idx in path.iter().rev() {
      let node = &mut self.nodes[idx];
      if low > node.low {
        node.low = low;
      } else {
        low = node.low;
      }
      while low < threshold {
        if low >= node.value {
          if !node.known {
            bio.put_bit(1);
            node.known = true;
          }
          break;
        }
        bio.put_bit(0);
        low += 1;
      }
      node.low = low;
    }
  }

  /// Dual of [`encode`]; returns whether the leaf value is below
  /// `threshold` (for an inclusion tree: included in this layer).
  pub fn decode(&mut self, bio: &mut BitReader<'_>, leaf: u32, threshold: i32) -> Result<bool> {
    debug_assert!(leaf < self.num_leaves());
    let path = self.path_to_root(leaf);
    let mut low = 0;
    let mut leaf_value = UNSET;
    for &idx in path.iter().rev() {
      let node = &mut self.nodes[idx];
      if low > node.low {
        node.low = low;
      } else {
        low = node.low;
      }
      while low < threshold && low < node.value {
        if bio.get_bit()? == 1 {
          node.value = low;
        } else {
          low += 1;
        }
      }
      node.low = low;
      leaf_value = node.value;
    }
    Ok(leaf_value < threshold)
  }

  /// Decoded value of a leaf, meaningful once `decode` returned `true`.
  pub fn leaf_value(&self, leaf: u32) -> i32 {
    self.nodes[leaf as usize].value
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  /// Encode leaves at a threshold sweep, decode the same sweep, and expect
  /// identical include/exclude decisions.
  fn check_round_trip(w: u32, h: u32, values: &[i32], thresholds: &[i32]) {
    let mut enc = TagTree::new(w, h);
    for (leaf, &v) in values.iter().enumerate() {
      enc.set_value(leaf as u32, v);
    }
    let mut bio = BitWriter::new();
    let mut expected = Vec::new();
    for &t in thresholds {
      for leaf in 0..enc.num_leaves() {
        enc.encode(&mut bio, leaf, t);
        expected.push(values[leaf as usize] < t);
      }
    }
    bio.flush();
    let bytes = bio.into_vec();

    let mut dec = TagTree::new(w, h);
    let mut r = BitReader::new(&bytes);
    let mut got = Vec::new();
    for &t in thresholds {
      for leaf in 0..dec.num_leaves() {
        got.push(dec.decode(&mut r, leaf, t).unwrap());
      }
    }
    assert_eq!(expected, got);
  }

  #[test]
  fn two_by_four_grid_threshold_sweep() {
    check_round_trip(4, 2, &[0, 3, 1, 5, 2, 4, 1, 2], &[1, 2, 3, 4, 5, 6]);
  }

  #[test]
  fn single_leaf() {
    check_round_trip(1, 1, &[2], &[1, 2, 3]);
  }

  #[test]
  fn decoded_values_match_after_full_sweep() {
    let values = [0i32, 3, 1, 5, 2, 4, 1, 2];
    let mut enc = TagTree::new(4, 2);
    for (leaf, &v) in values.iter().enumerate() {
      enc.set_value(leaf as u32, v);
    }
    let mut bio = BitWriter::new();
    for leaf in 0..8 {
      enc.encode(&mut bio, leaf, 6);
    }
    bio.flush();
    let bytes = bio.into_vec();

    let mut dec = TagTree::new(4, 2);
    let mut r = BitReader::new(&bytes);
    for leaf in 0..8 {
      assert!(dec.decode(&mut r, leaf, 6).unwrap());
      assert_eq!(dec.leaf_value(leaf), values[leaf as usize]);
    }
  }

  #[test]
  fn reinit_keeps_tree_usable() {
    let mut tree = TagTree::new(3, 2);
    tree.set_value(0, 1);
    tree.init(3, 2);
    // After reset every value is back to the sentinel.
    assert_eq!(tree.leaf_value(0), 999);
    tree.init(6, 3);
    assert_eq!(tree.num_leaves(), 18);
  }
}

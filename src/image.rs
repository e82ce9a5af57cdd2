//! Image model: a canvas rectangle holding components with per-component
//! subsampling, precision and sign. Sample storage is row-major i32.

use crate::error::{Error, Result};
use crate::math::ceil_div;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorSpace {
  Unknown,
  Srgb,
  Gray,
  Sycc,
}

impl Default for ColorSpace {
  fn default() -> Self {
    ColorSpace::Unknown
  }
}

/// Parameters for creating one component.
#[derive(Debug, Clone, Copy)]
pub struct ImageCompParams {
  pub dx: u32,
  pub dy: u32,
  pub prec: u32,
  pub sgnd: bool,
}

impl Default for ImageCompParams {
  fn default() -> Self {
    Self {
      dx: 1,
      dy: 1,
      prec: 8,
      sgnd: false,
    }
  }
}

#[derive(Debug, Clone, Default)]
pub struct ImageComp {
  /// Subsampling with respect to the canvas grid.
  pub dx: u32,
  pub dy: u32,
  /// Dimensions of the sample array.
  pub w: u32,
  pub h: u32,
  /// Canvas origin of the component.
  pub x0: u32,
  pub y0: u32,
  /// Bits per sample (the model admits up to 38; the codec codes <= 31).
  pub prec: u32,
  pub sgnd: bool,
  /// Highest resolution decoded so far.
  pub resno_decoded: u32,
  pub data: Vec<i32>,
}

impl ImageComp {
  /// Copy the geometry and signal properties, not the samples.
  pub fn copy_props(&mut self, other: &ImageComp) {
    self.data.clear();
    self.dx = other.dx;
    self.dy = other.dy;
    self.w = other.w;
    self.h = other.h;
    self.x0 = other.x0;
    self.y0 = other.y0;
    self.prec = other.prec;
    self.sgnd = other.sgnd;
    self.resno_decoded = other.resno_decoded;
  }

  pub fn alloc_data(&mut self) -> Result<()> {
    let len = (self.w as u64)
      .checked_mul(self.h as u64)
      .ok_or(Error::SparseBufferOverrun)?;
    if len > usize::MAX as u64 / core::mem::size_of::<i32>() as u64 {
      return Err(Error::SparseBufferOverrun);
    }
    self.data.clear();
    self.data.resize(len as usize, 0);
    Ok(())
  }

  /// Maximum representable magnitude span, used for clamping after the
  /// inverse transforms.
  pub fn value_range(&self) -> (i32, i32) {
    if self.sgnd {
      (
        -(1i64 << (self.prec - 1)) as i32,
        ((1i64 << (self.prec - 1)) - 1) as i32,
      )
    } else {
      (0, ((1u64 << self.prec) - 1) as i32)
    }
  }
}

#[derive(Debug, Clone, Default)]
pub struct Image {
  /// Canvas rectangle, half-open.
  pub x0: u32,
  pub y0: u32,
  pub x1: u32,
  pub y1: u32,
  pub color_space: ColorSpace,
  pub comps: Vec<ImageComp>,
}

impl Image {
  /// Create an image whose components share the canvas rectangle, each
  /// sized by its own subsampling factors.
  pub fn new(
    x0: u32,
    y0: u32,
    x1: u32,
    y1: u32,
    comp_params: &[ImageCompParams],
    color_space: ColorSpace,
  ) -> Result<Image> {
    if x1 <= x0 || y1 <= y0 {
      return Err(Error::InvalidParameter("empty image rectangle"));
    }
    if comp_params.is_empty() {
      return Err(Error::InvalidParameter("image needs at least one component"));
    }
    let mut comps = Vec::with_capacity(comp_params.len());
    for cp in comp_params {
      if cp.dx == 0 || cp.dx > 255 || cp.dy == 0 || cp.dy > 255 {
        return Err(Error::InvalidParameter("subsampling factor out of 1..255"));
      }
      if cp.prec == 0 || cp.prec > 38 {
        return Err(Error::InvalidParameter("precision out of 1..38"));
      }
      let mut comp = ImageComp {
        dx: cp.dx,
        dy: cp.dy,
        x0: ceil_div(x0, cp.dx),
        y0: ceil_div(y0, cp.dy),
        prec: cp.prec,
        sgnd: cp.sgnd,
        ..Default::default()
      };
      comp.w = ceil_div(x1, cp.dx) - comp.x0;
      comp.h = ceil_div(y1, cp.dy) - comp.y0;
      comp.alloc_data()?;
      comps.push(comp);
    }
    Ok(Image {
      x0,
      y0,
      x1,
      y1,
      color_space,
      comps,
    })
  }

  pub fn num_comps(&self) -> u32 {
    self.comps.len() as u32
  }

  /// Largest component precision; parameter validation caps what the
  /// codec will accept.
  pub fn max_precision(&self) -> u32 {
    self.comps.iter().map(|c| c.prec).max().unwrap_or(0)
  }

  /// Whether the first three components share a sample grid, as the
  /// built-in component transforms require.
  pub fn mct_compatible(&self) -> bool {
    if self.comps.len() < 3 {
      return false;
    }
    let c0 = &self.comps[0];
    self.comps[1..3]
      .iter()
      .all(|c| c.dx == c0.dx && c.dy == c0.dy && c.w == c0.w && c.h == c0.h)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn subsampled_component_dims() {
    let image = Image::new(
      0,
      0,
      17,
      11,
      &[
        ImageCompParams::default(),
        ImageCompParams {
          dx: 2,
          dy: 2,
          ..Default::default()
        },
      ],
      ColorSpace::Unknown,
    )
    .unwrap();
    assert_eq!((image.comps[0].w, image.comps[0].h), (17, 11));
    assert_eq!((image.comps[1].w, image.comps[1].h), (9, 6));
    assert_eq!(image.comps[1].data.len(), 9 * 6);
  }

  #[test]
  fn rejects_empty_rect() {
    assert!(Image::new(4, 4, 4, 8, &[ImageCompParams::default()], ColorSpace::Gray).is_err());
  }

  #[test]
  fn value_range_signed_unsigned() {
    let mut c = ImageComp {
      prec: 8,
      ..Default::default()
    };
    assert_eq!(c.value_range(), (0, 255));
    c.sgnd = true;
    assert_eq!(c.value_range(), (-128, 127));
  }
}

//! JPEG 2000 codestream codec core: tier-1 embedded block coding, tier-2
//! packetization, the tile/resolution/subband/precinct/codeblock canvas
//! model, wavelet and component transforms, and a concurrent
//! tile-processing scheduler.
//!
//! File-format containers (JP2 boxes), raster file I/O and command-line
//! tooling live outside this crate; the entry points here consume and
//! produce raw codestreams and in-memory images.

mod bio;
mod cio;
mod dwt;
mod j2k;
mod math;
mod mct;
mod mqc;
mod pi;
mod quant;
mod scheduler;
mod sparse_array;
mod strip_cache;
mod t1;
mod t2;
mod tcd;
mod tgt;

pub mod error;
pub mod event;
pub mod image;
pub mod params;

pub use error::{Error, Result};
pub use event::{EventMgr, EventType, MsgHandler};
pub use image::{ColorSpace, Image, ImageComp, ImageCompParams};
pub use j2k::{compress, decompress, Decompressor};
pub use params::{
  CblkSty, CodecFormat, DecoderParams, EncoderParams, MctMode, ProgressionOrder, ProgressionRec,
  RateControlMode,
};
pub use scheduler::Executor;
pub use strip_cache::{StripCallback, StripData};

/// Magic bytes for the JP2 container (RFC 3745 signature box).
pub const JP2_RFC3745_MAGIC: &[u8] = &[
  0x00, 0x00, 0x00, 0x0c, 0x6a, 0x50, 0x20, 0x20, 0x0d, 0x0a, 0x87, 0x0a,
];
pub const JP2_MAGIC: &[u8] = &[0x0d, 0x0a, 0x87, 0x0a];
/// Magic bytes for a raw codestream (SOC then SIZ).
pub const J2K_CODESTREAM_MAGIC: &[u8] = &[0xff, 0x4f, 0xff, 0x51];

/// Detect the framing of a byte stream from its magic bytes.
pub fn detect_format(buf: &[u8]) -> CodecFormat {
  if buf.starts_with(JP2_RFC3745_MAGIC) || buf.starts_with(JP2_MAGIC) {
    CodecFormat::Jp2
  } else if buf.starts_with(J2K_CODESTREAM_MAGIC) {
    CodecFormat::J2k
  } else {
    CodecFormat::Unknown
  }
}

/// Detect the framing from a file extension.
pub fn detect_format_from_extension(ext: Option<&std::ffi::OsStr>) -> CodecFormat {
  let lower = ext.and_then(|e| e.to_str()).map(|e| e.to_ascii_lowercase());
  match lower.as_deref() {
    Some("jp2") => CodecFormat::Jp2,
    Some("j2k") | Some("j2c") | Some("jpc") | Some("jhc") => CodecFormat::J2k,
    Some("jph") => CodecFormat::Jph,
    _ => CodecFormat::Unknown,
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn magic_byte_detection() {
    assert_eq!(detect_format(J2K_CODESTREAM_MAGIC), CodecFormat::J2k);
    assert_eq!(detect_format(JP2_MAGIC), CodecFormat::Jp2);
    assert_eq!(detect_format(JP2_RFC3745_MAGIC), CodecFormat::Jp2);
    assert_eq!(detect_format(&[0x00, 0x01]), CodecFormat::Unknown);
  }

  #[test]
  fn extension_detection() {
    use std::ffi::OsStr;
    assert_eq!(
      detect_format_from_extension(Some(OsStr::new("j2k"))),
      CodecFormat::J2k
    );
    assert_eq!(
      detect_format_from_extension(Some(OsStr::new("JP2"))),
      CodecFormat::Jp2
    );
    assert_eq!(
      detect_format_from_extension(Some(OsStr::new("jph"))),
      CodecFormat::Jph
    );
    assert_eq!(detect_format_from_extension(None), CodecFormat::Unknown);
  }
}

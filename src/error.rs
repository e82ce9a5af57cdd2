//! Error taxonomy of the codec core.
//!
//! Packet-level failures are contained to one tile; marker-level failures
//! are fatal to the whole codestream. No error here crosses the public API
//! as a panic.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
  /// Packet header ended before all descriptors were read.
  #[error("truncated packet header")]
  TruncatedPacketHeader,
  /// Packet header bits are inconsistent (bad VLC, impossible pass count).
  #[error("corrupt packet header: {0}")]
  CorruptPacketHeader(&'static str),
  /// Packet body shorter than the lengths its header declared.
  #[error("corrupt packet data")]
  CorruptPacketData,
  /// A delimiting marker byte surfaced inside a packet header.
  #[error("marker 0xff{0:02x} found inside packet header")]
  InvalidMarker(u8),
  /// SOP/EPH where none was expected (still fails the packet).
  #[error("unexpected marker 0x{0:04x} in packet header")]
  UnexpectedMarker(u16),
  /// Malformed main/tile header marker segment.
  #[error("corrupt marker segment: {0}")]
  CorruptMarker(&'static str),
  /// Malformed tile-part length marker.
  #[error("corrupt TLM marker")]
  CorruptTlm,
  /// Malformed start-of-tile marker.
  #[error("corrupt SOT marker")]
  CorruptSot,
  /// Arithmetic overflow while indexing a sparse buffer.
  #[error("sparse buffer index overrun")]
  SparseBufferOverrun,
  /// Malformed outer container box; raised by the (external) file-format
  /// collaborator, fatal.
  #[error("corrupt JP2 box")]
  CorruptJp2Box,
  /// Malformed association box; raised by the (external) file-format
  /// collaborator, non-fatal.
  #[error("malformed association box")]
  BadAsoc,
  /// A non-delimiting marker terminated a tile; recoverable.
  #[error("unknown marker at end of tile")]
  DecodeUnknownMarkerAtEndOfTile,
  /// Valid codestream requesting a capability this build does not code.
  #[error("unsupported feature: {0}")]
  UnsupportedFeature(&'static str),
  /// Caller-supplied parameters failed validation.
  #[error("invalid parameter: {0}")]
  InvalidParameter(&'static str),
  /// Premature end of the codestream.
  #[error("unexpected end of codestream")]
  UnexpectedEof,
  /// A scheduler run was aborted by an earlier task failure.
  #[error("tile processing aborted")]
  Aborted,
}

pub type Result<T> = core::result::Result<T, Error>;

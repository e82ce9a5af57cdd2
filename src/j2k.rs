//! Codestream layer: marker segment writing and parsing, tile-part
//! sequencing, and the compress/decompress entry points.
//!
//! The wire format is the Annex A marker stream: SOC, main header
//! markers, then SOT/SOD-delimited tile-parts, then EOC. Packet headers
//! normally live inline after SOD but may be hoisted into PPM (main
//! header) or PPT (tile header) segments.

use std::collections::BTreeMap;

use crate::cio::{markers, ByteReader, ByteWriter};
use crate::error::{Error, Result};
use crate::event::EventMgr;
use crate::image::{ColorSpace, Image, ImageComp};
use crate::math::{ceil_div, ceil_div_pow2};
use crate::params::{
  CblkSty, CodingParams, CodingStyle, DecoderParams, EncoderParams, MctMode, ProgressionOrder,
  ProgressionRec, StepSize, TileCodingParams, TileCompParams, MAX_RESOLUTIONS, QNTSTY_NOQNT,
  QNTSTY_SEQNT, QNTSTY_SIQNT,
};
use crate::pi::PacketId;
use crate::quant;
use crate::scheduler;
use crate::strip_cache::{StripCache, StripCallback};
use crate::t2::{self, PacketLengthCache, TileLengthCache};
use crate::tcd::{self, Rect, Tile};

// ---- encoder parameter lowering ------------------------------------------

fn setup_encoder(image: &Image, params: &EncoderParams) -> Result<CodingParams> {
  params.validate(image.num_comps(), image.max_precision())?;

  let (tdx, tdy) = match params.tile_size {
    Some((w, h)) => {
      if w == 0 || h == 0 {
        return Err(Error::InvalidParameter("empty tile size"));
      }
      (w, h)
    }
    None => (
      image.x1 - params.tile_origin.0,
      image.y1 - params.tile_origin.1,
    ),
  };
  let (tx0, ty0) = params.tile_origin;
  if tx0 > image.x0 || ty0 > image.y0 {
    return Err(Error::InvalidParameter("tile origin beyond image origin"));
  }
  if image.x0 >= tx0 + tdx || image.y0 >= ty0 + tdy {
    return Err(Error::InvalidParameter("first tile misses the image"));
  }

  let tw = ceil_div(image.x1 - tx0, tdx);
  let th = ceil_div(image.y1 - ty0, tdy);

  let qmfbid = if params.irreversible { 0 } else { 1 };
  match params.mct {
    MctMode::Reversible3 if params.irreversible => {
      return Err(Error::InvalidParameter(
        "reversible component transform requires the 5-3 filter",
      ));
    }
    MctMode::Irreversible3 if !params.irreversible => {
      return Err(Error::InvalidParameter(
        "irreversible component transform requires the 9-7 filter",
      ));
    }
    MctMode::Reversible3 | MctMode::Irreversible3 if !image.mct_compatible() => {
      return Err(Error::InvalidParameter(
        "component transform needs three equally sampled components",
      ));
    }
    MctMode::Custom => {
      let c0 = &image.comps[0];
      if !image
        .comps
        .iter()
        .all(|c| c.w == c0.w && c.h == c0.h && c.dx == c0.dx && c.dy == c0.dy)
      {
        return Err(Error::InvalidParameter(
          "custom transform needs equally sampled components",
        ));
      }
    }
    _ => {}
  }

  let mut csty = CodingStyle::empty();
  if !params.precincts.is_empty() {
    csty |= CodingStyle::PRECINCTS;
  }
  if params.use_sop {
    csty |= CodingStyle::SOP;
  }
  if params.use_eph {
    csty |= CodingStyle::EPH;
  }

  let mut tccps = Vec::with_capacity(image.comps.len());
  for (compno, comp) in image.comps.iter().enumerate() {
    let mut tccp = TileCompParams {
      csty,
      numresolutions: params.num_resolutions,
      cblkw_exp: params.cblockw_exp,
      cblkh_exp: params.cblockh_exp,
      cblksty: params.cblksty,
      qmfbid,
      qntsty: if qmfbid == 1 { QNTSTY_NOQNT } else { QNTSTY_SEQNT },
      numgbits: params.num_guard_bits,
      ..Default::default()
    };
    if !params.precincts.is_empty() {
      // Entries are given finest resolution first and the last entry
      // repeats downward.
      for resno in 0..params.num_resolutions {
        let k = ((params.num_resolutions - 1 - resno) as usize)
          .min(params.precincts.len() - 1);
        let (pw, ph) = params.precincts[k];
        if resno > 0 && (pw == 0 || ph == 0) {
          return Err(Error::InvalidParameter(
            "precinct exponent 0 is only legal at the lowest resolution",
          ));
        }
        tccp.prcw_exp[resno as usize] = pw;
        tccp.prch_exp[resno as usize] = ph;
      }
    }
    if params.roi_comp == Some(compno as u32) {
      tccp.roishift = params.roi_shift;
    }
    quant::calc_explicit_stepsizes(&mut tccp, comp.prec);
    tccps.push(tccp);
  }

  let tcp = TileCodingParams {
    csty,
    prg: params.progression,
    numlayers: params.num_layers,
    mct: match params.mct {
      MctMode::None => 0,
      MctMode::Reversible3 => 1,
      MctMode::Irreversible3 => 2,
      MctMode::Custom => 3,
    },
    mct_matrix: params.mct_matrix.clone(),
    rates: params.rates.clone(),
    distoratio: params.qualities.clone(),
    pocs: params.extra_progressions.clone(),
    tccps,
  };

  Ok(CodingParams {
    tx0,
    ty0,
    tdx,
    tdy,
    tw,
    th,
    tcps: vec![tcp; (tw * th) as usize],
    reduce: 0,
    max_layers: 0,
    rate_mode: Some(params.rate_control_mode),
    write_plt: params.write_plt,
    write_tlm: params.write_tlm,
    comment: params.comment.clone(),
  })
}

// ---- marker writers ------------------------------------------------------

fn write_siz(w: &mut ByteWriter, image: &Image, cp: &CodingParams) {
  w.write_u16(markers::SIZ);
  w.write_u16(38 + 3 * image.num_comps() as u16);
  w.write_u16(0); // Rsiz: baseline Part 1
  w.write_u32(image.x1);
  w.write_u32(image.y1);
  w.write_u32(image.x0);
  w.write_u32(image.y0);
  w.write_u32(cp.tdx);
  w.write_u32(cp.tdy);
  w.write_u32(cp.tx0);
  w.write_u32(cp.ty0);
  w.write_u16(image.num_comps() as u16);
  for comp in &image.comps {
    let ssiz = (comp.prec - 1) as u8 | if comp.sgnd { 0x80 } else { 0 };
    w.write_u8(ssiz);
    w.write_u8(comp.dx as u8);
    w.write_u8(comp.dy as u8);
  }
}

fn write_cod(w: &mut ByteWriter, tcp: &TileCodingParams) {
  let tccp = &tcp.tccps[0];
  let with_precincts = tccp.csty.contains(CodingStyle::PRECINCTS);
  let len = 12 + if with_precincts {
    tccp.numresolutions as u16
  } else {
    0
  };
  w.write_u16(markers::COD);
  w.write_u16(len);
  w.write_u8(tccp.csty.bits() as u8);
  w.write_u8(tcp.prg.to_wire());
  w.write_u16(tcp.numlayers as u16);
  w.write_u8(if tcp.mct == 1 || tcp.mct == 2 { 1 } else { 0 });
  write_cox_sp(w, tccp, with_precincts);
}

/// The SPcod/SPcoc tail shared by COD and COC.
fn write_cox_sp(w: &mut ByteWriter, tccp: &TileCompParams, with_precincts: bool) {
  w.write_u8((tccp.numresolutions - 1) as u8);
  w.write_u8((tccp.cblkw_exp - 2) as u8);
  w.write_u8((tccp.cblkh_exp - 2) as u8);
  w.write_u8(tccp.cblksty.bits() as u8);
  w.write_u8(tccp.qmfbid as u8);
  if with_precincts {
    for resno in 0..tccp.numresolutions as usize {
      w.write_u8((tccp.prcw_exp[resno] | (tccp.prch_exp[resno] << 4)) as u8);
    }
  }
}

fn write_qcd(w: &mut ByteWriter, tccp: &TileCompParams) {
  let numbands = (3 * tccp.numresolutions - 2) as usize;
  let len = match tccp.qntsty {
    QNTSTY_NOQNT => 3 + numbands as u16,
    _ => 3 + 2 * numbands as u16,
  };
  w.write_u16(markers::QCD);
  w.write_u16(len);
  w.write_u8((tccp.qntsty | (tccp.numgbits << 5)) as u8);
  for band in 0..numbands {
    let step = tccp.stepsizes[band];
    if tccp.qntsty == QNTSTY_NOQNT {
      w.write_u8((step.expn << 3) as u8);
    } else {
      w.write_u16(((step.expn as u16) << 11) | step.mant as u16);
    }
  }
}

fn write_rgn(w: &mut ByteWriter, compno: u32, roishift: u32) {
  w.write_u16(markers::RGN);
  w.write_u16(5);
  w.write_u8(compno as u8);
  w.write_u8(0); // Srgn: implicit
  w.write_u8(roishift as u8);
}

fn write_poc(w: &mut ByteWriter, pocs: &[ProgressionRec]) {
  w.write_u16(markers::POC);
  w.write_u16(2 + 7 * pocs.len() as u16);
  for poc in pocs {
    w.write_u8(poc.res_lo as u8);
    w.write_u8(poc.comp_lo as u8);
    w.write_u16(poc.layer_hi as u16);
    w.write_u8(poc.res_hi as u8);
    w.write_u8(poc.comp_hi as u8);
    w.write_u8(poc.order.to_wire());
  }
}

fn write_com(w: &mut ByteWriter, text: &str) {
  let bytes = text.as_bytes();
  w.write_u16(markers::COM);
  w.write_u16(4 + bytes.len() as u16);
  w.write_u16(1); // Rcom: Latin text
  w.write_bytes(bytes);
}

fn write_mct_markers(w: &mut ByteWriter, matrix: &[f32], num_comps: u32) {
  // Decorrelation matrix payload (floats, big endian), then the
  // collection and order segments binding it to all components.
  w.write_u16(markers::MCT);
  w.write_u16(6 + 4 * matrix.len() as u16);
  w.write_u16(0); // Zmct
  w.write_u16(0x0201); // Imct: matrix 1, f32 decorrelation array
  for &v in matrix {
    w.write_u32(v.to_bits());
  }
  w.write_u16(markers::MCC);
  w.write_u16(9);
  w.write_u16(0); // Zmcc
  w.write_u8(1); // Imcc
  w.write_u16(num_comps as u16);
  w.write_u16(0x0201);
  w.write_u16(markers::MCO);
  w.write_u16(4);
  w.write_u8(1); // one transform stage
  w.write_u8(1); // referencing Imcc 1
}

fn write_plt(w: &mut ByteWriter, lengths: &[u32]) {
  // A packet length never spans two PLT segments; keep 5 bytes headroom.
  const MAX_PAYLOAD: usize = 65533;
  let mut zplt = 0u8;
  let mut payload: Vec<u8> = Vec::new();
  let mut flush =
    |payload: &mut Vec<u8>, zplt: &mut u8, w: &mut ByteWriter| {
      if payload.is_empty() {
        return;
      }
      w.write_u16(markers::PLT);
      w.write_u16(3 + payload.len() as u16);
      w.write_u8(*zplt);
      w.write_bytes(payload);
      payload.clear();
      *zplt = zplt.wrapping_add(1);
    };
  for &len in lengths {
    let mut record = Vec::new();
    PacketLengthCache::encode_length(len.max(1), &mut record);
    if payload.len() + record.len() > MAX_PAYLOAD {
      flush(&mut payload, &mut zplt, &mut *w);
    }
    payload.extend_from_slice(&record);
  }
  flush(&mut payload, &mut zplt, &mut *w);
}

// ---- compress ------------------------------------------------------------

/// Compress `image` into a raw JPEG 2000 codestream.
pub fn compress(image: &Image, params: &EncoderParams, events: &EventMgr) -> Result<Vec<u8>> {
  let cp = setup_encoder(image, params)?;
  let mut w = ByteWriter::with_capacity(4096);

  w.write_u16(markers::SOC);
  write_siz(&mut w, image, &cp);
  let tcp0 = &cp.tcps[0];
  write_cod(&mut w, tcp0);
  write_qcd(&mut w, &tcp0.tccps[0]);
  for (compno, tccp) in tcp0.tccps.iter().enumerate() {
    if tccp.roishift > 0 {
      write_rgn(&mut w, compno as u32, tccp.roishift);
    }
  }
  if !tcp0.pocs.is_empty() {
    write_poc(&mut w, &tcp0.pocs);
  }
  if tcp0.mct == 3 {
    if let Some(matrix) = &tcp0.mct_matrix {
      write_mct_markers(&mut w, matrix, image.num_comps());
    }
  }
  if let Some(comment) = &cp.comment {
    write_com(&mut w, comment);
  }

  // TLM is reserved up front and patched once tile-part sizes are known.
  let num_tiles = cp.num_tiles();
  let tlm_at = if cp.write_tlm {
    w.write_u16(markers::TLM);
    w.write_u16(4 + 4 * num_tiles as u16);
    w.write_u8(0); // Ztlm
    w.write_u8(0x40); // Stlm: implicit tile indices, 32-bit lengths
    Some(w.reserve(4 * num_tiles as usize))
  } else {
    None
  };

  let mut tilepart_lengths = Vec::with_capacity(num_tiles as usize);
  for tile_no in 0..num_tiles {
    let tcp = &cp.tcps[tile_no as usize];
    let mut tile = Tile::init(&cp, tcp, image, tile_no, true)?;
    let (body, packet_lengths) =
      scheduler::compress_tile(&mut tile, image, &cp, tcp, events)?;

    let sot_start = w.pos();
    w.write_u16(markers::SOT);
    w.write_u16(10);
    w.write_u16(tile_no as u16);
    let psot_at = w.reserve(4);
    w.write_u8(0); // TPsot
    w.write_u8(1); // TNsot
    if cp.write_plt {
      write_plt(&mut w, &packet_lengths);
    }
    w.write_u16(markers::SOD);
    w.write_bytes(&body);
    let psot = (w.pos() - sot_start) as u32;
    w.patch_u32(psot_at, psot);
    tilepart_lengths.push(psot);
  }

  if let Some(at) = tlm_at {
    for (i, &len) in tilepart_lengths.iter().enumerate() {
      w.patch_u32(at + 4 * i, len);
    }
  }

  w.write_u16(markers::EOC);
  events.info(format!(
    "compressed {} tile(s) into {} bytes",
    num_tiles,
    w.pos()
  ));
  Ok(w.into_vec())
}

// ---- decoder state -------------------------------------------------------

#[derive(Debug, Default)]
struct TilePartSpan {
  /// Byte range of the tile-part body (after SOD) in the codestream.
  start: usize,
  end: usize,
}

#[derive(Debug, Default)]
struct TileEntry {
  parts: Vec<TilePartSpan>,
  plt: PacketLengthCache,
  /// Concatenated PPT packed-header bytes.
  ppt: Vec<u8>,
}

pub struct Decompressor<'a> {
  data: &'a [u8],
  events: EventMgr,
  image: Image,
  cp: CodingParams,
  tiles: BTreeMap<u32, TileEntry>,
  tlm: TileLengthCache,
  /// Assembled PPM chunks, one per tile-part that uses them.
  ppm_chunks: Vec<Vec<u8>>,
  ppm_raw: Vec<u8>,
  decode_area: Option<(u32, u32, u32, u32)>,
  strip_callback: Option<StripCallback>,
}

impl<'a> std::fmt::Debug for Decompressor<'a> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Decompressor")
      .field("image", &self.image)
      .field("cp", &self.cp)
      .field("tiles", &self.tiles)
      .field("tlm", &self.tlm)
      .field("decode_area", &self.decode_area)
      .field("has_strip_callback", &self.strip_callback.is_some())
      .finish()
  }
}

impl<'a> Decompressor<'a> {
  /// Parse the main header and index every tile-part.
  pub fn new(data: &'a [u8], params: &DecoderParams, events: EventMgr) -> Result<Self> {
    let mut dec = Decompressor {
      data,
      events,
      image: Image::default(),
      cp: CodingParams::default(),
      tiles: BTreeMap::new(),
      tlm: TileLengthCache::new(),
      ppm_chunks: Vec::new(),
      ppm_raw: Vec::new(),
      decode_area: None,
      strip_callback: None,
    };
    dec.cp.reduce = params.reduce;
    dec.cp.max_layers = params.layers;
    dec.read_headers()?;
    Ok(dec)
  }

  pub fn image(&self) -> &Image {
    &self.image
  }

  pub fn set_strip_callback(&mut self, cb: StripCallback) {
    self.strip_callback = Some(cb);
  }

  /// Restrict decoding to a canvas window; only intersecting tiles and
  /// codeblocks will be touched.
  pub fn set_decode_area(&mut self, x0: u32, y0: u32, x1: u32, y1: u32) -> Result<()> {
    let x0 = x0.max(self.image.x0);
    let y0 = y0.max(self.image.y0);
    let x1 = x1.min(self.image.x1);
    let y1 = y1.min(self.image.y1);
    if x0 >= x1 || y0 >= y1 {
      return Err(Error::InvalidParameter("decode area misses the image"));
    }
    self.decode_area = Some((x0, y0, x1, y1));
    Ok(())
  }

  fn read_headers(&mut self) -> Result<()> {
    let mut r = ByteReader::new(self.data);
    if r.read_u16()? != markers::SOC {
      return Err(Error::CorruptMarker("missing SOC"));
    }
    if r.peek_u16() != Some(markers::SIZ) {
      return Err(Error::CorruptMarker("SIZ must follow SOC"));
    }

    loop {
      let marker = r.read_u16()?;
      match marker {
        markers::SIZ => self.read_siz(&mut r)?,
        markers::COD => {
          let seg = read_segment(&mut r)?;
          let (tcp_update, tccp_update) = parse_cod(seg)?;
          for tcp in self.cp.tcps.iter_mut() {
            apply_cod(tcp, &tcp_update, &tccp_update);
          }
        }
        markers::COC => {
          let seg = read_segment(&mut r)?;
          let (compno, tccp_update) = parse_coc(seg, self.image.num_comps())?;
          for tcp in self.cp.tcps.iter_mut() {
            apply_cox(&mut tcp.tccps[compno as usize], &tccp_update);
          }
        }
        markers::QCD => {
          let seg = read_segment(&mut r)?;
          let q = parse_qcx(seg)?;
          for tcp in self.cp.tcps.iter_mut() {
            for tccp in tcp.tccps.iter_mut() {
              apply_qcx(tccp, &q);
            }
          }
        }
        markers::QCC => {
          let seg = read_segment(&mut r)?;
          let (compno, q) = parse_qcc(seg, self.image.num_comps())?;
          for tcp in self.cp.tcps.iter_mut() {
            apply_qcx(&mut tcp.tccps[compno as usize], &q);
          }
        }
        markers::RGN => {
          let seg = read_segment(&mut r)?;
          let (compno, shift) = parse_rgn(seg, self.image.num_comps())?;
          for tcp in self.cp.tcps.iter_mut() {
            tcp.tccps[compno as usize].roishift = shift;
          }
        }
        markers::POC => {
          let seg = read_segment(&mut r)?;
          let pocs = parse_poc(seg)?;
          for tcp in self.cp.tcps.iter_mut() {
            tcp.pocs = pocs.clone();
          }
        }
        markers::COM => {
          let seg = read_segment(&mut r)?;
          if seg.len() >= 2 {
            if let Ok(text) = std::str::from_utf8(&seg[2..]) {
              self.events.info(format!("codestream comment: {}", text));
            }
          }
        }
        markers::TLM => {
          let seg = read_segment(&mut r)?;
          self.tlm.add_segment(seg).map_err(|_| Error::CorruptTlm)?;
        }
        markers::PLM => {
          // Declared out of scope; PLT alone drives body skipping.
          let _ = read_segment(&mut r)?;
          self.events.warning("PLM marker ignored");
        }
        markers::PPM => {
          let seg = read_segment(&mut r)?;
          if seg.is_empty() {
            return Err(Error::CorruptMarker("empty PPM"));
          }
          self.ppm_raw.extend_from_slice(&seg[1..]);
        }
        markers::CRG => {
          let _ = read_segment(&mut r)?;
        }
        markers::CAP => {
          let seg = read_segment(&mut r)?;
          // Pcap bit 15 advertises Part 15 (HT) coding.
          if seg.len() >= 4 {
            let pcap = u32::from_be_bytes([seg[0], seg[1], seg[2], seg[3]]);
            if pcap & (1 << (32 - 15)) != 0 {
              return Err(Error::UnsupportedFeature("HT (Part 15) codestream"));
            }
          }
        }
        markers::MCT => {
          let seg = read_segment(&mut r)?;
          let matrix = parse_mct(seg)?;
          for tcp in self.cp.tcps.iter_mut() {
            tcp.mct = 3;
            tcp.mct_matrix = Some(matrix.clone());
          }
        }
        markers::MCC | markers::MCO | markers::CBD => {
          let _ = read_segment(&mut r)?;
        }
        markers::SOT => {
          self.read_tile_parts(&mut r)?;
          break;
        }
        markers::EOC => break,
        unknown => {
          if unknown & 0xff00 != 0xff00 {
            return Err(Error::CorruptMarker("lost marker alignment"));
          }
          let _ = read_segment(&mut r)?;
          self
            .events
            .warning(format!("unknown marker 0x{:04x} skipped", unknown));
        }
      }
    }

    // PPM data splits into length-prefixed chunks, consumed one per
    // tile-part in stream order.
    let mut raw = std::mem::take(&mut self.ppm_raw);
    let mut r = ByteReader::new(&raw);
    while r.remaining() >= 4 {
      let n = r.read_u32()? as usize;
      if n > r.remaining() {
        return Err(Error::CorruptMarker("PPM chunk overruns its data"));
      }
      self.ppm_chunks.push(r.read_bytes(n)?.to_vec());
    }
    raw.clear();
    Ok(())
  }

  fn read_siz(&mut self, r: &mut ByteReader<'_>) -> Result<()> {
    let seg = read_segment(r)?;
    let mut s = ByteReader::new(seg);
    let _rsiz = s.read_u16()?;
    let x1 = s.read_u32()?;
    let y1 = s.read_u32()?;
    let x0 = s.read_u32()?;
    let y0 = s.read_u32()?;
    let tdx = s.read_u32()?;
    let tdy = s.read_u32()?;
    let tx0 = s.read_u32()?;
    let ty0 = s.read_u32()?;
    let numcomps = s.read_u16()? as u32;
    if x1 <= x0 || y1 <= y0 || tdx == 0 || tdy == 0 || numcomps == 0 || numcomps > 16384 {
      return Err(Error::CorruptMarker("inconsistent SIZ"));
    }
    if tx0 > x0 || ty0 > y0 || x0 >= tx0.wrapping_add(tdx) || y0 >= ty0.wrapping_add(tdy) {
      return Err(Error::CorruptMarker("tile grid misses the image"));
    }
    let mut comps = Vec::with_capacity(numcomps as usize);
    for _ in 0..numcomps {
      let ssiz = s.read_u8()?;
      let dx = s.read_u8()? as u32;
      let dy = s.read_u8()? as u32;
      if dx == 0 || dy == 0 {
        return Err(Error::CorruptMarker("zero subsampling factor"));
      }
      let prec = (ssiz & 0x7f) as u32 + 1;
      if prec > 38 {
        return Err(Error::CorruptMarker("precision above 38 bits"));
      }
      if prec > 31 {
        return Err(Error::UnsupportedFeature(
          "sample precision above 31 bits is not codeable",
        ));
      }
      let mut comp = ImageComp {
        dx,
        dy,
        prec,
        sgnd: ssiz & 0x80 != 0,
        x0: ceil_div(x0, dx),
        y0: ceil_div(y0, dy),
        ..Default::default()
      };
      comp.w = ceil_div(x1, dx) - comp.x0;
      comp.h = ceil_div(y1, dy) - comp.y0;
      comps.push(comp);
    }
    self.image = Image {
      x0,
      y0,
      x1,
      y1,
      color_space: ColorSpace::Unknown,
      comps,
    };
    self.cp.tx0 = tx0;
    self.cp.ty0 = ty0;
    self.cp.tdx = tdx;
    self.cp.tdy = tdy;
    self.cp.tw = ceil_div(x1 - tx0, tdx);
    self.cp.th = ceil_div(y1 - ty0, tdy);
    let default_tcp = TileCodingParams {
      tccps: vec![TileCompParams::default(); numcomps as usize],
      ..Default::default()
    };
    self.cp.tcps = vec![default_tcp; (self.cp.tw * self.cp.th) as usize];
    Ok(())
  }

  /// From the first SOT to EOC: index tile-part byte ranges and collect
  /// tile-header markers (COD/COC/QCD/QCC/RGN/POC/PLT/PPT).
  fn read_tile_parts(&mut self, r: &mut ByteReader<'_>) -> Result<()> {
    loop {
      // Invariant: the SOT marker itself has been consumed.
      let sot_pos = r.pos() - 2;
      let lsot = r.read_u16()?;
      if lsot != 10 {
        return Err(Error::CorruptSot);
      }
      let tile_no = r.read_u16()? as u32;
      let psot = r.read_u32()?;
      let _tpsot = r.read_u8()?;
      let _tnsot = r.read_u8()?;
      if tile_no >= self.cp.num_tiles() {
        return Err(Error::CorruptSot);
      }
      let part_end = if psot == 0 {
        self.data.len().saturating_sub(2) // open-ended last tile-part
      } else {
        sot_pos + psot as usize
      };
      if part_end > self.data.len() {
        return Err(Error::CorruptSot);
      }

      // Tile-part header until SOD.
      let mut uses_ppm = !self.ppm_chunks.is_empty();
      loop {
        let marker = r.read_u16()?;
        match marker {
          markers::SOD => break,
          markers::COD => {
            let seg = read_segment(r)?;
            let (tcp_update, tccp_update) = parse_cod(seg)?;
            let tcp = &mut self.cp.tcps[tile_no as usize];
            apply_cod(tcp, &tcp_update, &tccp_update);
          }
          markers::COC => {
            let seg = read_segment(r)?;
            let (compno, tccp_update) = parse_coc(seg, self.image.num_comps())?;
            apply_cox(
              &mut self.cp.tcps[tile_no as usize].tccps[compno as usize],
              &tccp_update,
            );
          }
          markers::QCD => {
            let seg = read_segment(r)?;
            let q = parse_qcx(seg)?;
            for tccp in self.cp.tcps[tile_no as usize].tccps.iter_mut() {
              apply_qcx(tccp, &q);
            }
          }
          markers::QCC => {
            let seg = read_segment(r)?;
            let (compno, q) = parse_qcc(seg, self.image.num_comps())?;
            apply_qcx(
              &mut self.cp.tcps[tile_no as usize].tccps[compno as usize],
              &q,
            );
          }
          markers::RGN => {
            let seg = read_segment(r)?;
            let (compno, shift) = parse_rgn(seg, self.image.num_comps())?;
            self.cp.tcps[tile_no as usize].tccps[compno as usize].roishift = shift;
          }
          markers::POC => {
            let seg = read_segment(r)?;
            self.cp.tcps[tile_no as usize].pocs = parse_poc(seg)?;
          }
          markers::PLT => {
            let seg = read_segment(r)?;
            if seg.is_empty() {
              return Err(Error::CorruptMarker("empty PLT"));
            }
            self
              .tiles
              .entry(tile_no)
              .or_default()
              .plt
              .add_segment(seg[0], &seg[1..])?;
          }
          markers::PPT => {
            let seg = read_segment(r)?;
            if seg.is_empty() {
              return Err(Error::CorruptMarker("empty PPT"));
            }
            uses_ppm = false;
            self
              .tiles
              .entry(tile_no)
              .or_default()
              .ppt
              .extend_from_slice(&seg[1..]);
          }
          markers::COM => {
            let _ = read_segment(r)?;
          }
          other => {
            if other & 0xff00 != 0xff00 {
              return Err(Error::CorruptMarker("lost marker alignment in tile header"));
            }
            let _ = read_segment(r)?;
            self
              .events
              .warning(format!("unknown tile-header marker 0x{:04x} skipped", other));
          }
        }
      }

      let body_start = r.pos();
      let entry = self.tiles.entry(tile_no).or_default();
      entry.parts.push(TilePartSpan {
        start: body_start,
        end: part_end,
      });
      if uses_ppm && !self.ppm_chunks.is_empty() {
        let chunk = self.ppm_chunks.remove(0);
        entry.ppt.extend_from_slice(&chunk);
      }

      r.seek(part_end)?;
      match r.read_u16() {
        Ok(markers::SOT) => continue,
        Ok(markers::EOC) => break,
        Ok(other) => {
          // A recoverable terminator: stop at the unknown marker.
          self.events.warning(format!(
            "unknown marker 0x{:04x} at end of tile, stopping: {}",
            other,
            Error::DecodeUnknownMarkerAtEndOfTile
          ));
          break;
        }
        Err(_) => {
          self.events.warning("codestream ends without EOC");
          break;
        }
      }
    }

    // TLM, when present, must agree with the tile-part sizes actually
    // found; it is what random-access readers seek by.
    if !self.tlm.entries.is_empty() {
      let mut declared = self.tlm.entries.iter();
      'check: for (tile_no, entry) in self.tiles.iter() {
        for part in &entry.parts {
          let actual = (part.end - part.start) as u64;
          match declared.next() {
            Some(decl) => {
              // The declared length covers SOT..end; the indexed span is
              // the body, so it must be strictly smaller.
              if (decl.length as u64) < actual {
                self.events.warning(format!(
                  "TLM length mismatch for tile {}: declared {} bytes",
                  tile_no, decl.length
                ));
              }
            }
            None => {
              self.events.warning("TLM declares fewer tile-parts than found");
              break 'check;
            }
          }
        }
      }
    }
    Ok(())
  }

  /// Decode the selected tiles and return the assembled image.
  pub fn decompress(&mut self) -> Result<Image> {
    let area = self.decode_area;
    let mut out = self.image.clone();
    for (comp, src) in out.comps.iter_mut().zip(self.image.comps.iter()) {
      let (ax0, ay0, ax1, ay1) = match area {
        Some((x0, y0, x1, y1)) => (x0, y0, x1, y1),
        None => (self.image.x0, self.image.y0, self.image.x1, self.image.y1),
      };
      comp.x0 = ceil_div_pow2(ceil_div(ax0, src.dx), self.cp.reduce);
      comp.y0 = ceil_div_pow2(ceil_div(ay0, src.dy), self.cp.reduce);
      comp.w = ceil_div_pow2(ceil_div(ax1, src.dx), self.cp.reduce) - comp.x0;
      comp.h = ceil_div_pow2(ceil_div(ay1, src.dy), self.cp.reduce) - comp.y0;
      comp.alloc_data()?;
      comp.resno_decoded = 0;
    }

    // Strip cache geometry follows the tile grid at the decoded scale.
    let mut strip_cache = self.strip_callback.clone().map(|cb| {
      let reduce = self.cp.reduce;
      let width = ceil_div_pow2(self.image.x1, reduce) - ceil_div_pow2(self.image.x0, reduce);
      let mut y0s = Vec::new();
      let mut heights = Vec::new();
      for row in 0..self.cp.th {
        let ty0 = (self.cp.ty0 + row * self.cp.tdy).max(self.image.y0);
        let ty1 = (self.cp.ty0 + (row + 1) * self.cp.tdy).min(self.image.y1);
        let ry0 = ceil_div_pow2(ty0, reduce);
        let ry1 = ceil_div_pow2(ty1, reduce);
        y0s.push(ry0 - ceil_div_pow2(self.image.y0, reduce));
        heights.push(ry1 - ry0);
      }
      StripCache::new(
        width,
        &y0s,
        &heights,
        self.cp.tw,
        self.image.num_comps(),
        cb,
      )
    });

    let tile_list: Vec<u32> = (0..self.cp.num_tiles())
      .filter(|&t| self.tile_intersects_area(t))
      .collect();

    for tile_no in tile_list {
      match self.decode_one_tile(tile_no, &mut out, strip_cache.as_ref()) {
        Ok(()) => {}
        Err(err) => {
          // A failed tile is skipped; the rest of the image survives.
          self
            .events
            .error(format!("tile {} failed: {}", tile_no, err));
        }
      }
    }
    if let Some(cache) = strip_cache.as_mut() {
      cache.finish();
    }
    Ok(out)
  }

  fn tile_intersects_area(&self, tile_no: u32) -> bool {
    let area = match self.decode_area {
      Some(area) => area,
      None => return true,
    };
    let p = tile_no % self.cp.tw;
    let q = tile_no / self.cp.tw;
    let tx0 = (self.cp.tx0 + p * self.cp.tdx).max(self.image.x0);
    let ty0 = (self.cp.ty0 + q * self.cp.tdy).max(self.image.y0);
    let tx1 = (self.cp.tx0 + (p + 1) * self.cp.tdx).min(self.image.x1);
    let ty1 = (self.cp.ty0 + (q + 1) * self.cp.tdy).min(self.image.y1);
    tx0 < area.2 && area.0 < tx1 && ty0 < area.3 && area.1 < ty1
  }

  fn decode_one_tile(
    &mut self,
    tile_no: u32,
    out: &mut Image,
    strip_cache: Option<&StripCache>,
  ) -> Result<()> {
    let tcp = self.cp.tcps[tile_no as usize].clone();
    let mut tile = Tile::init(&self.cp, &tcp, &self.image, tile_no, false)?;

    // Sub-window: clip the decode area onto each tile-component, in
    // absolute component coordinates (band rectangles are absolute too).
    if let Some((ax0, ay0, ax1, ay1)) = self.decode_area {
      for (tilec, comp) in tile.comps.iter_mut().zip(self.image.comps.iter()) {
        let win = Rect::new(
          ceil_div(ax0, comp.dx) as i32,
          ceil_div(ay0, comp.dy) as i32,
          ceil_div(ax1, comp.dx) as i32,
          ceil_div(ay1, comp.dy) as i32,
        );
        tilec.win = Some(win.intersection(&tilec.rect));
      }
    }

    let entry = self.tiles.remove(&tile_no).unwrap_or_default();
    if let Err(err) = self.parse_tile_packets(&mut tile, &tcp, &entry) {
      // The tile keeps whatever packets parsed; later packets are gone.
      self.events.warning(format!(
        "tile {}: packet parsing stopped: {}",
        tile_no, err
      ));
    }

    let decoded = scheduler::decompress_tile(&mut tile, &self.image, &tcp, &self.events)?;

    // Composite into the output image (clipped to the decode window).
    for ((comp_out, decoded_comp), tilec) in out
      .comps
      .iter_mut()
      .zip(decoded.comps.iter())
      .zip(tile.comps.iter())
    {
      let out_rect = Rect::new(
        comp_out.x0 as i32,
        comp_out.y0 as i32,
        comp_out.x0 as i32 + comp_out.w as i32,
        comp_out.y0 as i32 + comp_out.h as i32,
      );
      let overlap = decoded_comp.rect.intersection(&out_rect);
      if overlap.is_empty() {
        continue;
      }
      let src_w = decoded_comp.rect.width() as usize;
      for y in overlap.y0..overlap.y1 {
        let src_base =
          (y - decoded_comp.rect.y0) as usize * src_w + (overlap.x0 - decoded_comp.rect.x0) as usize;
        let dst_base = (y - out_rect.y0) as usize * comp_out.w as usize
          + (overlap.x0 - out_rect.x0) as usize;
        let n = overlap.width() as usize;
        comp_out.data[dst_base..dst_base + n]
          .copy_from_slice(&decoded_comp.data[src_base..src_base + n]);
      }
      comp_out.resno_decoded = tilec.minimum_num_resolutions - 1;
    }

    if let Some(cache) = strip_cache {
      let strip_index = tile_no / self.cp.tw;
      let reduce = self.cp.reduce;
      let tx0 = {
        let p = tile_no % self.cp.tw;
        (self.cp.tx0 + p * self.cp.tdx).max(self.image.x0)
      };
      let tx1 = {
        let p = tile_no % self.cp.tw;
        (self.cp.tx0 + (p + 1) * self.cp.tdx).min(self.image.x1)
      };
      let planes: Vec<(Rect, &[i32])> = decoded
        .comps
        .iter()
        .map(|c| (c.rect, c.data.as_slice()))
        .collect();
      let subs: Vec<(u32, u32)> = self.image.comps.iter().map(|c| (c.dx, c.dy)).collect();
      cache.composite_interleaved(
        strip_index,
        ceil_div_pow2(tx0, reduce) - ceil_div_pow2(self.image.x0, reduce),
        ceil_div_pow2(tx1, reduce) - ceil_div_pow2(self.image.x0, reduce),
        &planes,
        &subs,
      )?;
    }
    Ok(())
  }

  /// Drive the packet iterator over the tile's byte ranges, reading
  /// headers inline or from hoisted PPT/PPM data, skipping bodies via
  /// PLT where that is safe.
  fn parse_tile_packets(
    &self,
    tile: &mut Tile,
    tcp: &TileCodingParams,
    entry: &TileEntry,
  ) -> Result<()> {
    let mut body: Vec<u8> = Vec::new();
    for part in &entry.parts {
      body.extend_from_slice(&self.data[part.start..part.end]);
    }
    let layer_cap = if self.cp.max_layers == 0 {
      u32::MAX
    } else {
      self.cp.max_layers
    };

    let mut pi = t2::packet_iter_for_tile(tile, &self.image, tcp, tcp.numlayers);
    pi.reset();
    let ids: Vec<PacketId> = pi.collect();
    let plt_lengths: Vec<u32> = entry.plt.lengths().collect();
    let use_plt = !entry.plt.is_empty() && plt_lengths.len() >= ids.len();
    let hoisted = !entry.ppt.is_empty();

    let mut pos = 0usize;
    let mut header_pos = 0usize; // position inside hoisted header data
    let mut next_sop = 0u32; // expected Nsop of the next SOP marker
    for (pkt_no, id) in ids.into_iter().enumerate() {
      if pos >= body.len() && !hoisted {
        break; // truncated tile: remaining packets add nothing
      }
      let expected_sop = next_sop % 65536;
      next_sop = next_sop.wrapping_add(1);
      let tilec = &tile.comps[id.compno as usize];
      let res_kept = id.resno < tilec.minimum_num_resolutions;

      if use_plt && !res_kept && !hoisted {
        // Discarded resolution: its precinct state is never needed
        // again, so the whole packet can be skipped by length.
        pos += plt_lengths[pkt_no] as usize;
        continue;
      }

      let window_kept = {
        let tilec = &tile.comps[id.compno as usize];
        if !res_kept {
          false
        } else {
          let res = &tilec.resolutions[id.resno as usize];
          res.bands.iter().any(|band| {
            !band.is_empty()
              && band
                .precincts
                .get(id.precno as usize)
                .map(|prc| {
                  tcd::is_band_window_of_interest(
                    tilec,
                    id.resno,
                    band.orient,
                    &prc.rect,
                    tcp.tccps[id.compno as usize].qmfbid,
                  )
                })
                .unwrap_or(false)
          })
        }
      };
      let keep = res_kept && window_kept && id.layno < layer_cap;

      let parsed = if hoisted {
        let parsed = t2::decode_packet(
          tile,
          tcp,
          id,
          &entry.ppt[header_pos..],
          Some(&body[pos..]),
          keep,
        )?;
        header_pos += parsed.header_bytes;
        pos += parsed.body_bytes;
        parsed
      } else {
        let parsed = t2::decode_packet(tile, tcp, id, &body[pos..], None, keep)?;
        pos += parsed.header_bytes + parsed.body_bytes;
        parsed
      };

      // SOP sequence check: a mismatched Nsop is reported and the
      // counter resynchronizes to the stream's numbering.
      if let Some(nsop) = parsed.nsop {
        if nsop as u32 != expected_sop {
          self.events.warning(format!(
            "tile {}: SOP sequence number {} where {} was expected, resynchronizing",
            tile.tile_no, nsop, expected_sop
          ));
          next_sop = (nsop as u32).wrapping_add(1);
        }
      }
    }
    Ok(())
  }
}

// ---- marker segment parsing ----------------------------------------------

fn read_segment<'b>(r: &mut ByteReader<'b>) -> Result<&'b [u8]> {
  let len = r.read_u16()?;
  if len < 2 {
    return Err(Error::CorruptMarker("segment length below 2"));
  }
  r.read_bytes(len as usize - 2)
}

#[derive(Debug, Clone)]
struct CodUpdate {
  csty: CodingStyle,
  prg: ProgressionOrder,
  numlayers: u32,
  mct: u32,
}

#[derive(Debug, Clone)]
struct CoxUpdate {
  csty_precincts: bool,
  numresolutions: u32,
  cblkw_exp: u32,
  cblkh_exp: u32,
  cblksty: CblkSty,
  qmfbid: u32,
  prcw_exp: [u32; MAX_RESOLUTIONS],
  prch_exp: [u32; MAX_RESOLUTIONS],
}

fn parse_cox(s: &mut ByteReader<'_>, with_precincts: bool) -> Result<CoxUpdate> {
  let numresolutions = s.read_u8()? as u32 + 1;
  if numresolutions > MAX_RESOLUTIONS as u32 {
    return Err(Error::CorruptMarker("too many decomposition levels"));
  }
  let cblkw_exp = s.read_u8()? as u32 + 2;
  let cblkh_exp = s.read_u8()? as u32 + 2;
  if !(2..=10).contains(&cblkw_exp)
    || !(2..=10).contains(&cblkh_exp)
    || cblkw_exp + cblkh_exp > 12
  {
    return Err(Error::CorruptMarker("code-block size out of range"));
  }
  let cblksty = CblkSty::from_bits(s.read_u8()? as u32)
    .ok_or(Error::CorruptMarker("unknown code-block style bits"))?;
  if cblksty.contains(CblkSty::HT) {
    return Err(Error::UnsupportedFeature("HT (Part 15) block coding"));
  }
  let qmfbid = s.read_u8()? as u32;
  if qmfbid > 1 {
    return Err(Error::CorruptMarker("unknown wavelet transform"));
  }
  let mut upd = CoxUpdate {
    csty_precincts: with_precincts,
    numresolutions,
    cblkw_exp,
    cblkh_exp,
    cblksty,
    qmfbid,
    prcw_exp: [15; MAX_RESOLUTIONS],
    prch_exp: [15; MAX_RESOLUTIONS],
  };
  if with_precincts {
    for resno in 0..numresolutions as usize {
      let b = s.read_u8()? as u32;
      upd.prcw_exp[resno] = b & 0x0f;
      upd.prch_exp[resno] = b >> 4;
      if resno > 0 && (upd.prcw_exp[resno] == 0 || upd.prch_exp[resno] == 0) {
        return Err(Error::CorruptMarker("zero precinct size above resolution 0"));
      }
    }
  }
  Ok(upd)
}

fn parse_cod(seg: &[u8]) -> Result<(CodUpdate, CoxUpdate)> {
  let mut s = ByteReader::new(seg);
  let scod = s.read_u8()? as u32;
  let csty = CodingStyle::from_bits(scod & 0x7)
    .ok_or(Error::CorruptMarker("unknown coding style bits"))?;
  let prg = ProgressionOrder::from_wire(s.read_u8()?)?;
  let numlayers = s.read_u16()? as u32;
  if numlayers == 0 {
    return Err(Error::CorruptMarker("zero quality layers"));
  }
  let mct = s.read_u8()? as u32;
  let cox = parse_cox(&mut s, csty.contains(CodingStyle::PRECINCTS))?;
  Ok((
    CodUpdate {
      csty,
      prg,
      numlayers,
      mct,
    },
    cox,
  ))
}

fn apply_cod(tcp: &mut TileCodingParams, upd: &CodUpdate, cox: &CoxUpdate) {
  tcp.csty = upd.csty;
  tcp.prg = upd.prg;
  tcp.numlayers = upd.numlayers;
  if tcp.mct != 3 {
    tcp.mct = upd.mct;
  }
  for tccp in tcp.tccps.iter_mut() {
    tccp.csty = upd.csty;
    apply_cox(tccp, cox);
  }
}

fn apply_cox(tccp: &mut TileCompParams, cox: &CoxUpdate) {
  tccp.numresolutions = cox.numresolutions;
  tccp.cblkw_exp = cox.cblkw_exp;
  tccp.cblkh_exp = cox.cblkh_exp;
  tccp.cblksty = cox.cblksty;
  tccp.qmfbid = cox.qmfbid;
  if cox.csty_precincts {
    tccp.prcw_exp = cox.prcw_exp;
    tccp.prch_exp = cox.prch_exp;
  }
}

fn parse_coc(seg: &[u8], num_comps: u32) -> Result<(u32, CoxUpdate)> {
  let mut s = ByteReader::new(seg);
  let compno = if num_comps <= 256 {
    s.read_u8()? as u32
  } else {
    s.read_u16()? as u32
  };
  if compno >= num_comps {
    return Err(Error::CorruptMarker("COC component out of range"));
  }
  let scoc = s.read_u8()? as u32;
  let cox = parse_cox(&mut s, scoc & 0x1 != 0)?;
  Ok((compno, cox))
}

#[derive(Debug, Clone)]
struct QcxUpdate {
  qntsty: u32,
  numgbits: u32,
  stepsizes: Vec<StepSize>,
}

fn parse_qcx(seg: &[u8]) -> Result<QcxUpdate> {
  let mut s = ByteReader::new(seg);
  let sqcd = s.read_u8()? as u32;
  let qntsty = sqcd & 0x1f;
  let numgbits = sqcd >> 5;
  let mut stepsizes = Vec::new();
  match qntsty {
    QNTSTY_NOQNT => {
      while s.remaining() > 0 {
        let b = s.read_u8()? as i32;
        stepsizes.push(StepSize {
          expn: b >> 3,
          mant: 0,
        });
      }
    }
    QNTSTY_SIQNT | QNTSTY_SEQNT => {
      while s.remaining() >= 2 {
        let v = s.read_u16()? as u32;
        stepsizes.push(StepSize {
          expn: (v >> 11) as i32,
          mant: v & 0x7ff,
        });
      }
    }
    _ => return Err(Error::CorruptMarker("unknown quantization style")),
  }
  if stepsizes.is_empty() {
    return Err(Error::CorruptMarker("quantization segment with no bands"));
  }
  Ok(QcxUpdate {
    qntsty,
    numgbits,
    stepsizes,
  })
}

fn apply_qcx(tccp: &mut TileCompParams, q: &QcxUpdate) {
  tccp.qntsty = q.qntsty;
  tccp.numgbits = q.numgbits;
  for band in 0..tccp.stepsizes.len() {
    tccp.stepsizes[band] = if q.qntsty == QNTSTY_SIQNT {
      // Derived: one pair for the LL band, the rest scale with level.
      let base = q.stepsizes[0];
      let resno = if band == 0 { 0 } else { (band - 1) / 3 + 1 };
      StepSize {
        expn: base.expn - resno as i32 + 1,
        mant: base.mant,
      }
    } else {
      *q.stepsizes.get(band).unwrap_or(
        q.stepsizes.last().expect("non-empty stepsize list"),
      )
    };
  }
}

fn parse_qcc(seg: &[u8], num_comps: u32) -> Result<(u32, QcxUpdate)> {
  let mut s = ByteReader::new(seg);
  let compno = if num_comps <= 256 {
    s.read_u8()? as u32
  } else {
    s.read_u16()? as u32
  };
  if compno >= num_comps {
    return Err(Error::CorruptMarker("QCC component out of range"));
  }
  let q = parse_qcx(s.tail())?;
  Ok((compno, q))
}

fn parse_rgn(seg: &[u8], num_comps: u32) -> Result<(u32, u32)> {
  let mut s = ByteReader::new(seg);
  let compno = if num_comps <= 256 {
    s.read_u8()? as u32
  } else {
    s.read_u16()? as u32
  };
  if compno >= num_comps {
    return Err(Error::CorruptMarker("RGN component out of range"));
  }
  let srgn = s.read_u8()?;
  if srgn != 0 {
    return Err(Error::CorruptMarker("unknown RGN style"));
  }
  let shift = s.read_u8()? as u32;
  if shift > 37 {
    return Err(Error::CorruptMarker("ROI shift above 37"));
  }
  Ok((compno, shift))
}

fn parse_poc(seg: &[u8]) -> Result<Vec<ProgressionRec>> {
  let mut s = ByteReader::new(seg);
  let mut pocs = Vec::new();
  while s.remaining() >= 7 {
    let res_lo = s.read_u8()? as u32;
    let comp_lo = s.read_u8()? as u32;
    let layer_hi = s.read_u16()? as u32;
    let res_hi = s.read_u8()? as u32;
    let comp_hi = s.read_u8()? as u32;
    let order = ProgressionOrder::from_wire(s.read_u8()?)?;
    if res_hi <= res_lo || comp_hi <= comp_lo || layer_hi == 0 {
      return Err(Error::CorruptMarker("degenerate POC record"));
    }
    pocs.push(ProgressionRec {
      order,
      res_lo,
      res_hi,
      comp_lo,
      comp_hi,
      layer_hi,
    });
  }
  if pocs.is_empty() {
    return Err(Error::CorruptMarker("POC with no records"));
  }
  Ok(pocs)
}

fn parse_mct(seg: &[u8]) -> Result<Vec<f32>> {
  let mut s = ByteReader::new(seg);
  let _zmct = s.read_u16()?;
  let _imct = s.read_u16()?;
  let mut matrix = Vec::new();
  while s.remaining() >= 4 {
    matrix.push(f32::from_bits(s.read_u32()?));
  }
  if matrix.is_empty() {
    return Err(Error::CorruptMarker("MCT carries no matrix"));
  }
  Ok(matrix)
}

/// Convenience wrapper: decode a whole codestream with default options.
pub fn decompress(data: &[u8], params: &DecoderParams, events: &EventMgr) -> Result<Image> {
  let mut dec = Decompressor::new(data, params, events.clone())?;
  dec.decompress()
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::image::ImageCompParams;

  fn gray_image(w: u32, h: u32, value: i32) -> Image {
    let mut image = Image::new(
      0,
      0,
      w,
      h,
      &[ImageCompParams::default()],
      ColorSpace::Gray,
    )
    .unwrap();
    image.comps[0].data.iter_mut().for_each(|v| *v = value);
    image
  }

  #[test]
  fn codestream_starts_with_soc_siz_and_ends_with_eoc() {
    let image = gray_image(16, 16, 0);
    let bytes = compress(&image, &EncoderParams::default(), &EventMgr::new()).unwrap();
    assert_eq!(&bytes[..2], &[0xff, 0x4f]);
    assert_eq!(&bytes[2..4], &[0xff, 0x51]);
    assert_eq!(&bytes[bytes.len() - 2..], &[0xff, 0xd9]);
  }

  #[test]
  fn tiny_zero_image_stays_small() {
    let image = gray_image(16, 16, 0);
    let bytes = compress(&image, &EncoderParams::default(), &EventMgr::new()).unwrap();
    assert!(bytes.len() <= 200, "stream was {} bytes", bytes.len());
  }

  #[test]
  fn headers_parse_back() {
    let image = gray_image(40, 24, 7);
    let params = EncoderParams {
      num_resolutions: 3,
      ..Default::default()
    };
    let bytes = compress(&image, &params, &EventMgr::new()).unwrap();
    let dec = Decompressor::new(&bytes, &DecoderParams::default(), EventMgr::new()).unwrap();
    assert_eq!(dec.image().x1, 40);
    assert_eq!(dec.image().y1, 24);
    assert_eq!(dec.image().num_comps(), 1);
    assert_eq!(dec.cp.tcps[0].tccps[0].numresolutions, 3);
  }

  #[test]
  fn truncated_stream_reports_eof() {
    let image = gray_image(16, 16, 3);
    let bytes = compress(&image, &EncoderParams::default(), &EventMgr::new()).unwrap();
    let err = Decompressor::new(&bytes[..6], &DecoderParams::default(), EventMgr::new());
    assert!(err.is_err());
  }

  #[test]
  fn ht_cap_is_rejected() {
    // Hand-build SOC + CAP advertising Part 15.
    let mut w = ByteWriter::new();
    w.write_u16(markers::SOC);
    // SIZ for a 1x1 gray image.
    w.write_u16(markers::SIZ);
    w.write_u16(41);
    w.write_u16(0);
    w.write_u32(1);
    w.write_u32(1);
    w.write_u32(0);
    w.write_u32(0);
    w.write_u32(1);
    w.write_u32(1);
    w.write_u32(0);
    w.write_u32(0);
    w.write_u16(1);
    w.write_u8(7);
    w.write_u8(1);
    w.write_u8(1);
    w.write_u16(markers::CAP);
    w.write_u16(8);
    w.write_u32(1 << (32 - 15));
    w.write_u16(0);
    let bytes = w.into_vec();
    let err =
      Decompressor::new(&bytes, &DecoderParams::default(), EventMgr::new()).unwrap_err();
    assert!(matches!(err, Error::UnsupportedFeature(_)));
  }
}

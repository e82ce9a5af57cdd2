//! Tier-2: packet assembly and parsing, plus the PLT/TLM length caches.
//!
//! A packet is the (layer, resolution, component, precinct) unit. Its
//! header carries, per codeblock in subband-then-row-major order:
//! inclusion (tag-tree coded on first inclusion), zero-bitplane count
//! (first inclusion only), the pass-count VLC, the Lblock comma code and
//! the codeword-segment lengths. The body is the concatenation of the
//! included blocks' new codeword bytes.

use std::collections::BTreeMap;

use smallvec::SmallVec;

use crate::bio::{BitReader, BitWriter};
use crate::cio::markers;
use crate::error::{Error, Result};
use crate::image::Image;
use crate::math::floor_log2;
use crate::params::{CodingStyle, ProgressionRec, TileCodingParams};
use crate::pi::{PacketId, PacketIter};
use crate::t1::MAX_PASSES;
use crate::tcd::{cblk_rect_of, SegDec, SegUpdate, Tile};

/// Progression records driving one tile's packet sequence: the POC list
/// when present, otherwise a single record spanning everything.
pub(crate) fn progression_records(tcp: &TileCodingParams, tile: &Tile) -> Vec<ProgressionRec> {
  if !tcp.pocs.is_empty() {
    return tcp.pocs.clone();
  }
  let max_res = tile
    .comps
    .iter()
    .map(|c| c.numresolutions)
    .max()
    .unwrap_or(1);
  vec![ProgressionRec {
    order: tcp.prg,
    res_lo: 0,
    res_hi: max_res,
    comp_lo: 0,
    comp_hi: tile.comps.len() as u32,
    layer_hi: tcp.numlayers,
  }]
}

pub(crate) fn packet_iter_for_tile(
  tile: &Tile,
  image: &Image,
  tcp: &TileCodingParams,
  num_layers: u32,
) -> PacketIter {
  let mut records = progression_records(tcp, tile);
  for rec in records.iter_mut() {
    rec.layer_hi = rec.layer_hi.min(num_layers);
  }
  PacketIter::new(
    &tile.pi_comp_infos(image),
    (
      tile.rect.x0 as u32,
      tile.rect.y0 as u32,
      tile.rect.x1 as u32,
      tile.rect.y1 as u32,
    ),
    num_layers,
    &records,
  )
}

fn effective_cblk_exps(tccp_w: u32, tccp_h: u32, resno: u32, pdx: u32, pdy: u32) -> (u32, u32) {
  if resno == 0 {
    (tccp_w.min(pdx), tccp_h.min(pdy))
  } else {
    (tccp_w.min(pdx.saturating_sub(1)), tccp_h.min(pdy.saturating_sub(1)))
  }
}

// ---- encoder -------------------------------------------------------------

/// Encode all packets of the first `num_layers` layers into `dest`.
/// Returns the per-packet byte lengths. `max_len` makes the call fail
/// with `Aborted` once exceeded, which the rate allocator's bisection
/// uses as its fit test.
pub(crate) fn encode_packets(
  tile: &mut Tile,
  image: &Image,
  tcp: &TileCodingParams,
  num_layers: u32,
  dest: &mut Vec<u8>,
  max_len: Option<usize>,
) -> Result<Vec<u32>> {
  let mut pi = packet_iter_for_tile(tile, image, tcp, num_layers);
  let mut lengths = Vec::with_capacity(pi.len());
  let mut packet_counter = 0u32;
  pi.reset();
  for id in pi {
    let before = dest.len();
    encode_packet(tile, tcp, id, dest, packet_counter)?;
    packet_counter = packet_counter.wrapping_add(1);
    lengths.push((dest.len() - before) as u32);
    if let Some(max) = max_len {
      if dest.len() > max {
        return Err(Error::Aborted);
      }
    }
  }
  Ok(lengths)
}

fn encode_packet(
  tile: &mut Tile,
  tcp: &TileCodingParams,
  id: PacketId,
  dest: &mut Vec<u8>,
  packet_counter: u32,
) -> Result<()> {
  let tccp = &tcp.tccps[id.compno as usize];
  let tilec = &mut tile.comps[id.compno as usize];
  let res = &mut tilec.resolutions[id.resno as usize];

  if tccp.csty.contains(CodingStyle::SOP) {
    dest.extend_from_slice(&markers::SOP.to_be_bytes());
    dest.extend_from_slice(&4u16.to_be_bytes());
    dest.extend_from_slice(&((packet_counter % 65536) as u16).to_be_bytes());
  }

  // First packet of a precinct's life: reset the coding state.
  if id.layno == 0 {
    for band in res.bands.iter_mut() {
      if band.is_empty() {
        continue;
      }
      let prc = &mut band.precincts[id.precno as usize];
      prc.incl_tree.reset();
      prc.imsb_tree.reset();
      for (cblkno, cblk) in prc.cblks_enc.iter_mut().enumerate() {
        cblk.passes_written = 0;
        prc
          .imsb_tree
          .set_value(cblkno as u32, band.numbps as i32 - cblk.numbps as i32);
      }
    }
  }

  let mut bio = BitWriter::new();
  // Packet presence bit.
  bio.put_bit(1);

  // Tag-tree values must be in place before any leaf is coded.
  for band in res.bands.iter_mut() {
    if band.is_empty() {
      continue;
    }
    let prc = &mut band.precincts[id.precno as usize];
    for (cblkno, cblk) in prc.cblks_enc.iter().enumerate() {
      if cblk.passes_written == 0 && cblk.layers[id.layno as usize].numpasses > 0 {
        prc.incl_tree.set_value(cblkno as u32, id.layno as i32);
      }
    }
  }

  for band in res.bands.iter_mut() {
    if band.is_empty() {
      continue;
    }
    let prc = &mut band.precincts[id.precno as usize];
    for cblkno in 0..prc.num_cblks() {
      let first_inclusion = prc.cblks_enc[cblkno as usize].passes_written == 0;
      let layer = prc.cblks_enc[cblkno as usize].layers[id.layno as usize];

      if first_inclusion {
        prc.incl_tree.encode(&mut bio, cblkno, id.layno as i32 + 1);
      } else {
        bio.put_bit((layer.numpasses > 0) as u32);
      }
      if layer.numpasses == 0 {
        continue;
      }

      if first_inclusion {
        prc.cblks_enc[cblkno as usize].numlenbits = 3;
        prc.imsb_tree.encode(&mut bio, cblkno, 999);
      }

      bio.put_numpasses(layer.numpasses);

      let cblk = &mut prc.cblks_enc[cblkno as usize];
      // Lblock increment: large enough for the widest segment length
      // field of this packet.
      let mut increment = 0i32;
      let mut len = 0u32;
      let mut nump = 0u32;
      for passno in cblk.passes_written..cblk.passes_written + layer.numpasses {
        let pass = &cblk.passes[passno as usize];
        nump += 1;
        len += pass.len;
        if pass.term || passno + 1 == cblk.passes_written + layer.numpasses {
          let need = if len == 0 { 0 } else { floor_log2(len) as i32 + 1 };
          increment =
            increment.max(need - (cblk.numlenbits as i32 + floor_log2(nump) as i32));
          len = 0;
          nump = 0;
        }
      }
      bio.put_commacode(increment.max(0) as u32);
      cblk.numlenbits += increment.max(0) as u32;

      let mut len = 0u32;
      let mut nump = 0u32;
      for passno in cblk.passes_written..cblk.passes_written + layer.numpasses {
        let pass = &cblk.passes[passno as usize];
        nump += 1;
        len += pass.len;
        if pass.term || passno + 1 == cblk.passes_written + layer.numpasses {
          bio.put_bits(len, cblk.numlenbits + floor_log2(nump));
          len = 0;
          nump = 0;
        }
      }
    }
  }

  bio.flush();
  dest.extend_from_slice(&bio.into_vec());

  if tccp.csty.contains(CodingStyle::EPH) {
    dest.extend_from_slice(&markers::EPH.to_be_bytes());
  }

  // Body: new codeword bytes of every included block, in coding order.
  for band in res.bands.iter_mut() {
    if band.is_empty() {
      continue;
    }
    let prc = &mut band.precincts[id.precno as usize];
    for cblk in prc.cblks_enc.iter_mut() {
      let layer = cblk.layers[id.layno as usize];
      if layer.numpasses == 0 {
        continue;
      }
      let start = layer.data_start as usize;
      dest.extend_from_slice(&cblk.data[start..start + layer.len as usize]);
      cblk.passes_written += layer.numpasses;
    }
  }
  Ok(())
}

// ---- decoder -------------------------------------------------------------

/// What a parsed packet consumed, and what its SOP marker carried.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ParsedPacket {
  pub header_bytes: usize,
  pub body_bytes: usize,
  /// Nsop sequence number of the packet's SOP marker, when one was
  /// present; the caller checks it against its running packet counter.
  pub nsop: Option<u16>,
}

/// Parse one packet. `header_src` is where the header lives (the tile
/// stream, or hoisted PPM/PPT data). With `body_src` `None` the body
/// follows the header inline; otherwise it is read from the given tile
/// stream position. With `keep` false the header state advances but no
/// codeword bytes are retained (layer-capped decoding).
pub(crate) fn decode_packet(
  tile: &mut Tile,
  tcp: &TileCodingParams,
  id: PacketId,
  header_src: &[u8],
  body_src: Option<&[u8]>,
  keep: bool,
) -> Result<ParsedPacket> {
  let tccp = &tcp.tccps[id.compno as usize];
  let tilec = &mut tile.comps[id.compno as usize];
  let res = &mut tilec.resolutions[id.resno as usize];
  let (cblkw_exp, cblkh_exp) = effective_cblk_exps(
    tccp.cblkw_exp,
    tccp.cblkh_exp,
    id.resno,
    res.pdx,
    res.pdy,
  );

  let mut header_offset = 0usize;
  let mut nsop = None;
  if tccp.csty.contains(CodingStyle::SOP)
    && header_src.len() >= 6
    && header_src[0] == 0xff
    && header_src[1] == 0x91
  {
    nsop = Some(u16::from_be_bytes([header_src[4], header_src[5]]));
    header_offset += 6;
  }
  let mut bio = BitReader::new(&header_src[header_offset..]);

  let present = bio.get_bit()? == 1;
  let mut updates: Vec<(u32, u32)> = Vec::new(); // (bandno, cblkno) with pending segs

  if present {
    for (bandno, band) in res.bands.iter_mut().enumerate() {
      if band.is_empty() {
        continue;
      }
      let prc = band
        .precincts
        .get_mut(id.precno as usize)
        .ok_or(Error::CorruptPacketHeader("precinct out of range"))?;
      for cblkno in 0..prc.num_cblks() {
        let rect = cblk_rect_of(prc, cblkw_exp, cblkh_exp, cblkno);
        let included;
        {
          let already = prc.cblks_dec[cblkno as usize]
            .as_ref()
            .map(|c| c.included)
            .unwrap_or(false);
          if !already {
            included = prc.incl_tree.decode(&mut bio, cblkno, id.layno as i32 + 1)?;
          } else {
            included = bio.get_bit()? == 1;
          }
        }
        if !included {
          continue;
        }

        let first_inclusion = !prc.cblks_dec[cblkno as usize]
          .as_ref()
          .map(|c| c.included)
          .unwrap_or(false);
        let band_numbps = band.numbps;
        if first_inclusion {
          // Zero-bitplane count, decoded at increasing thresholds.
          let mut zb = 0i32;
          while !prc.imsb_tree.decode(&mut bio, cblkno, zb + 1)? {
            zb += 1;
            if zb > 74 {
              return Err(Error::CorruptPacketHeader("zero-bitplane count over 74"));
            }
          }
          if zb > band_numbps as i32 {
            return Err(Error::CorruptPacketHeader(
              "more missing bitplanes than the band carries",
            ));
          }
          let cblk = prc.cblk_dec_or_init(cblkno, rect);
          cblk.included = true;
          cblk.numbps = band_numbps - zb as u32;
          cblk.numlenbits = 3;
        }

        let numnewpasses = bio.get_numpasses()?;
        if numnewpasses == 0 || numnewpasses > MAX_PASSES {
          return Err(Error::CorruptPacketHeader("impossible pass count"));
        }
        let increment = bio.get_commacode()?;
        if increment > 31 {
          return Err(Error::CorruptPacketHeader("Lblock increment over 31"));
        }

        let cblksty = tccp.cblksty;
        let cblk = prc.cblks_dec[cblkno as usize]
          .as_mut()
          .ok_or(Error::CorruptPacketHeader("repeat inclusion without first"))?;
        cblk.numlenbits += increment;
        if cblk.numlenbits > 32 {
          return Err(Error::CorruptPacketHeader("length field wider than 32 bits"));
        }

        // Distribute the new passes over codeword segments.
        let mut segno = if cblk.segs.is_empty() {
          cblk.segs.push(init_seg(cblksty, true, None));
          0usize
        } else {
          let last = cblk.segs.len() - 1;
          if cblk.segs[last].numpasses == cblk.segs[last].maxpasses {
            let prev_max = cblk.segs[last].maxpasses;
            cblk.segs.push(init_seg(cblksty, false, Some(prev_max)));
            last + 1
          } else {
            last
          }
        };
        cblk.pending.clear();
        let mut n = numnewpasses;
        loop {
          let seg = &cblk.segs[segno];
          let this_passes = (seg.maxpasses - seg.numpasses).min(n);
          let bits = cblk.numlenbits + floor_log2(this_passes);
          let newlen = bio.get_bits(bits)?;
          cblk.pending.push(SegUpdate {
            segno: segno as u32,
            numpasses: this_passes,
            len: newlen,
          });
          n -= this_passes;
          if n == 0 {
            break;
          }
          let prev_max = cblk.segs[segno].maxpasses;
          cblk.segs.push(init_seg(cblksty, false, Some(prev_max)));
          segno += 1;
        }
        updates.push((bandno as u32, cblkno));
      }
    }
  }

  bio.inalign()?;
  let mut header_bytes = header_offset + bio.num_bytes();
  if tccp.csty.contains(CodingStyle::EPH) {
    let tail = &header_src[header_bytes..];
    if tail.len() < 2 || tail[0] != 0xff || tail[1] != 0x92 {
      return Err(Error::CorruptPacketHeader("missing EPH marker"));
    }
    header_bytes += 2;
  }

  // Body: apply the pending segment updates in coding order; truncation
  // keeps whatever bytes arrived and later blocks get nothing.
  let body_src = body_src.unwrap_or(&header_src[header_bytes..]);
  let mut body_pos = 0usize;
  for (bandno, cblkno) in updates {
    let prc = &mut res.bands[bandno as usize].precincts[id.precno as usize];
    let cblk = prc.cblks_dec[cblkno as usize].as_mut().unwrap();
    let pending: SmallVec<[SegUpdate; 2]> = cblk.pending.drain(..).collect();
    for up in pending {
      let avail = body_src.len().saturating_sub(body_pos);
      let take = (up.len as usize).min(avail);
      if keep {
        cblk
          .data
          .extend_from_slice(&body_src[body_pos..body_pos + take]);
        let seg = &mut cblk.segs[up.segno as usize];
        seg.numpasses += up.numpasses;
        seg.kept_passes += up.numpasses;
        seg.len += take as u32;
      } else {
        let seg = &mut cblk.segs[up.segno as usize];
        seg.numpasses += up.numpasses;
      }
      body_pos += take;
      if take < up.len as usize {
        // Recoverable truncation: this block keeps its partial bytes.
        return Ok(ParsedPacket {
          header_bytes,
          body_bytes: body_pos,
          nsop,
        });
      }
    }
  }

  Ok(ParsedPacket {
    header_bytes,
    body_bytes: body_pos,
    nsop,
  })
}

fn init_seg(cblksty: crate::params::CblkSty, first: bool, prev_max: Option<u32>) -> SegDec {
  use crate::params::CblkSty;
  let maxpasses = if cblksty.contains(CblkSty::TERMALL) {
    1
  } else if cblksty.contains(CblkSty::BYPASS) {
    if first {
      10
    } else {
      match prev_max {
        Some(1) | Some(10) => 2,
        _ => 1,
      }
    }
  } else {
    MAX_PASSES
  };
  SegDec {
    len: 0,
    numpasses: 0,
    kept_passes: 0,
    maxpasses,
  }
}

// ---- packet length marker cache (PLT) ------------------------------------

/// Per-tile packet lengths, comma-coded across one or more PLT marker
/// segments indexed by Zplt.
#[derive(Debug, Default)]
pub(crate) struct PacketLengthCache {
  markers: BTreeMap<u8, Vec<u32>>,
  partial: Option<(u8, u32)>,
}

impl PacketLengthCache {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn is_empty(&self) -> bool {
    self.markers.is_empty()
  }

  /// Parse one PLT segment payload (after Zplt). A length never spans
  /// two segments.
  pub fn add_segment(&mut self, zplt: u8, data: &[u8]) -> Result<()> {
    if self.partial.is_some() {
      return Err(Error::CorruptMarker("packet length spans PLT segments"));
    }
    let vec = self.markers.entry(zplt).or_default();
    let mut acc = 0u32;
    let mut mid = false;
    for &byte in data {
      acc = (acc << 7) | (byte & 0x7f) as u32;
      if byte & 0x80 != 0 {
        mid = true;
      } else {
        vec.push(acc);
        acc = 0;
        mid = false;
      }
    }
    if mid {
      return Err(Error::CorruptMarker("packet length spans PLT segments"));
    }
    Ok(())
  }

  /// All lengths in Zplt order.
  pub fn lengths(&self) -> impl Iterator<Item = u32> + '_ {
    self.markers.values().flatten().copied()
  }

  /// Comma-encode one length, MSB-first 7-bit groups.
  pub fn encode_length(len: u32, out: &mut Vec<u8>) {
    debug_assert!(len > 0);
    let numbits = floor_log2(len) + 1;
    let numbytes = (numbits + 6) / 7;
    for i in (0..numbytes).rev() {
      let mut byte = ((len >> (7 * i)) & 0x7f) as u8;
      if i != 0 {
        byte |= 0x80;
      }
      out.push(byte);
    }
  }
}

// ---- tile-part length marker cache (TLM) ---------------------------------

#[derive(Debug, Clone, Copy)]
pub(crate) struct TlmEntry {
  pub tile_no: Option<u32>,
  pub length: u32,
}

#[derive(Debug, Default)]
pub(crate) struct TileLengthCache {
  pub entries: Vec<TlmEntry>,
}

impl TileLengthCache {
  pub fn new() -> Self {
    Self::default()
  }

  /// Parse one TLM payload: Ztlm, Stlm, then (tile index?, length)
  /// records. ST selects a 0/8/16-bit tile index, SP a 16/32-bit length.
  pub fn add_segment(&mut self, data: &[u8]) -> Result<()> {
    if data.len() < 2 {
      return Err(Error::CorruptTlm);
    }
    let _ztlm = data[0];
    let stlm = data[1];
    let st = (stlm >> 4) & 0x3;
    let sp = (stlm >> 6) & 0x1;
    if st == 3 {
      return Err(Error::CorruptTlm);
    }
    let tile_bytes = st as usize;
    let len_bytes = if sp == 1 { 4 } else { 2 };
    let rec = tile_bytes + len_bytes;
    let payload = &data[2..];
    if payload.is_empty() || payload.len() % rec != 0 {
      return Err(Error::CorruptTlm);
    }
    for chunk in payload.chunks(rec) {
      let tile_no = match st {
        1 => Some(chunk[0] as u32),
        2 => Some(u16::from_be_bytes([chunk[0], chunk[1]]) as u32),
        _ => None,
      };
      let length = if sp == 1 {
        u32::from_be_bytes([
          chunk[tile_bytes],
          chunk[tile_bytes + 1],
          chunk[tile_bytes + 2],
          chunk[tile_bytes + 3],
        ])
      } else {
        u16::from_be_bytes([chunk[tile_bytes], chunk[tile_bytes + 1]]) as u32
      };
      self.entries.push(TlmEntry { tile_no, length });
    }
    Ok(())
  }

  /// Byte offset (from the first SOT) of a tile's first tile-part;
  /// records without explicit indices use their position in sequence.
  pub fn offset_of_tile(&self, tile_no: u32) -> Option<u64> {
    let mut offset = 0u64;
    for (i, entry) in self.entries.iter().enumerate() {
      let t = entry.tile_no.unwrap_or(i as u32);
      if t == tile_no {
        return Some(offset);
      }
      offset += entry.length as u64;
    }
    None
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn plt_comma_code_round_trip() {
    let cases = [1u32, 0x7f, 0x80, 0x3fff, 0x4000, 1_000_000, u32::MAX];
    let mut bytes = Vec::new();
    for &len in &cases {
      PacketLengthCache::encode_length(len, &mut bytes);
    }
    // Expected size: ceil(bits/7) bytes each.
    let expected: usize = cases
      .iter()
      .map(|&l| ((floor_log2(l) + 1 + 6) / 7) as usize)
      .sum();
    assert_eq!(bytes.len(), expected);

    let mut cache = PacketLengthCache::new();
    cache.add_segment(0, &bytes).unwrap();
    let decoded: Vec<u32> = cache.lengths().collect();
    assert_eq!(decoded, cases);
  }

  #[test]
  fn plt_length_must_not_span_segments() {
    let mut cache = PacketLengthCache::new();
    // A continuation byte with no terminator.
    assert!(cache.add_segment(0, &[0x81]).is_err());
  }

  #[test]
  fn tlm_parse_with_and_without_tile_index() {
    let mut cache = TileLengthCache::new();
    // ST=1 (8-bit index), SP=0 (16-bit lengths): records (2, 0x0100),
    // (0, 0x0200).
    let data = [0x00, 0x10, 0x02, 0x01, 0x00, 0x00, 0x02, 0x00];
    cache.add_segment(&data).unwrap();
    assert_eq!(cache.entries.len(), 2);
    assert_eq!(cache.entries[0].tile_no, Some(2));
    assert_eq!(cache.entries[0].length, 0x100);

    let mut cache2 = TileLengthCache::new();
    // ST=0, SP=1: 32-bit lengths, implicit indices.
    let data2 = [0x00, 0x40, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x40];
    cache2.add_segment(&data2).unwrap();
    assert_eq!(cache2.entries[0].tile_no, None);
    assert_eq!(cache2.entries[1].length, 0x40);
    assert_eq!(cache2.offset_of_tile(1), Some(0x100));
  }

  #[test]
  fn tlm_rejects_ragged_payload() {
    let mut cache = TileLengthCache::new();
    assert_eq!(
      cache.add_segment(&[0x00, 0x00, 0x01]).unwrap_err(),
      Error::CorruptTlm
    );
  }
}

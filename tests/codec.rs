//! End-to-end codec round trips over the raw codestream.

use std::sync::{Arc, Mutex};

use jp2k::{
  compress, decompress, CblkSty, ColorSpace, DecoderParams, Decompressor, EncoderParams,
  EventMgr, Image, ImageCompParams, MctMode, ProgressionOrder, RateControlMode,
};

fn gray_image(w: u32, h: u32, fill: impl Fn(u32, u32) -> i32) -> Image {
  let mut image = Image::new(0, 0, w, h, &[ImageCompParams::default()], ColorSpace::Gray).unwrap();
  for y in 0..h {
    for x in 0..w {
      image.comps[0].data[(y * w + x) as usize] = fill(x, y);
    }
  }
  image
}

fn rgb_image(w: u32, h: u32, fill: impl Fn(u32, u32) -> (i32, i32, i32)) -> Image {
  let params = [ImageCompParams::default(); 3];
  let mut image = Image::new(0, 0, w, h, &params, ColorSpace::Srgb).unwrap();
  for y in 0..h {
    for x in 0..w {
      let (r, g, b) = fill(x, y);
      image.comps[0].data[(y * w + x) as usize] = r;
      image.comps[1].data[(y * w + x) as usize] = g;
      image.comps[2].data[(y * w + x) as usize] = b;
    }
  }
  image
}

fn psnr(a: &[i32], b: &[i32], peak: f64) -> f64 {
  assert_eq!(a.len(), b.len());
  let mse: f64 = a
    .iter()
    .zip(b.iter())
    .map(|(&x, &y)| {
      let d = (x - y) as f64;
      d * d
    })
    .sum::<f64>()
    / a.len() as f64;
  if mse == 0.0 {
    f64::INFINITY
  } else {
    10.0 * (peak * peak / mse).log10()
  }
}

#[test]
fn tiny_zero_image_lossless_round_trip() {
  let image = gray_image(16, 16, |_, _| 0);
  let bytes = compress(&image, &EncoderParams::default(), &EventMgr::new()).unwrap();
  assert!(bytes.len() <= 200, "stream was {} bytes", bytes.len());
  assert_eq!(&bytes[bytes.len() - 2..], &[0xff, 0xd9], "EOC required");

  let decoded = decompress(&bytes, &DecoderParams::default(), &EventMgr::new()).unwrap();
  assert_eq!(decoded.comps[0].w, 16);
  assert_eq!(decoded.comps[0].h, 16);
  assert!(decoded.comps[0].data.iter().all(|&v| v == 0));
}

#[test]
fn gradient_lossless_round_trip() {
  let image = gray_image(40, 28, |x, y| ((x * 7 + y * 13) % 256) as i32);
  let bytes = compress(&image, &EncoderParams::default(), &EventMgr::new()).unwrap();
  let decoded = decompress(&bytes, &DecoderParams::default(), &EventMgr::new()).unwrap();
  assert_eq!(decoded.comps[0].data, image.comps[0].data);
}

#[test]
fn rgb_rct_lossless_identity() {
  let image = rgb_image(32, 32, |_, _| (17, 42, 200));
  let params = EncoderParams {
    mct: MctMode::Reversible3,
    ..Default::default()
  };
  let bytes = compress(&image, &params, &EventMgr::new()).unwrap();
  let decoded = decompress(&bytes, &DecoderParams::default(), &EventMgr::new()).unwrap();
  for c in 0..3 {
    assert_eq!(
      decoded.comps[c].data, image.comps[c].data,
      "component {} must survive the reversible transform",
      c
    );
  }
}

#[test]
fn rgb_rct_lossless_varied_content() {
  let image = rgb_image(24, 17, |x, y| {
    (
      ((x * 11 + y) % 256) as i32,
      ((x + y * 29) % 256) as i32,
      ((x * 3 + y * 7) % 256) as i32,
    )
  });
  let params = EncoderParams {
    mct: MctMode::Reversible3,
    num_resolutions: 4,
    ..Default::default()
  };
  let bytes = compress(&image, &params, &EventMgr::new()).unwrap();
  let decoded = decompress(&bytes, &DecoderParams::default(), &EventMgr::new()).unwrap();
  for c in 0..3 {
    assert_eq!(decoded.comps[c].data, image.comps[c].data);
  }
}

#[test]
fn tiled_irreversible_stays_above_40db() {
  // 2x2 tile grid, smooth content, 9-7 filter, single full layer.
  let image = gray_image(64, 64, |x, y| {
    (128.0 + 60.0 * ((x as f64) / 9.0).sin() + 50.0 * ((y as f64) / 7.0).cos()) as i32
  });
  let params = EncoderParams {
    tile_size: Some((32, 32)),
    irreversible: true,
    ..Default::default()
  };
  let bytes = compress(&image, &params, &EventMgr::new()).unwrap();
  let decoded = decompress(&bytes, &DecoderParams::default(), &EventMgr::new()).unwrap();
  let db = psnr(&decoded.comps[0].data, &image.comps[0].data, 255.0);
  assert!(db >= 40.0, "PSNR was {:.2} dB", db);
}

#[test]
fn rpcl_packet_count_and_plt_lengths_agree() {
  let image = gray_image(64, 64, |x, y| ((x ^ y) % 200) as i32);
  let params = EncoderParams {
    num_resolutions: 3,
    num_layers: 2,
    rate_control_mode: RateControlMode::FixedRatio,
    rates: vec![8.0, 1.0],
    progression: ProgressionOrder::Rpcl,
    use_sop: true,
    write_plt: true,
    ..Default::default()
  };
  let bytes = compress(&image, &params, &EventMgr::new()).unwrap();

  // Expected packet identities: R * P_r * C * L with one precinct per
  // resolution here.
  let expected_packets = 3 * 1 * 1 * 2;

  let sod = bytes
    .windows(2)
    .position(|w| w == [0xff, 0x93])
    .expect("SOD present");

  // SOP markers bracket every packet; bodies cannot fake one because a
  // 0xFF is always followed by a byte below 0x90 inside coded data.
  let mut sop_count = 0;
  for w in bytes[sod..].windows(2) {
    if w == [0xff, 0x91] {
      sop_count += 1;
    }
  }
  assert_eq!(sop_count, expected_packets);

  // PLT lengths (in the tile header, before SOD) must sum to the packet
  // body span (SOD to EOC).
  let mut plt_sum = 0u64;
  let mut plt_count = 0;
  let mut i = 0;
  while i + 1 < sod {
    if bytes[i] == 0xff && bytes[i + 1] == 0x58 {
      let len = u16::from_be_bytes([bytes[i + 2], bytes[i + 3]]) as usize;
      let payload = &bytes[i + 5..i + 2 + len];
      let mut acc = 0u64;
      for &b in payload {
        acc = (acc << 7) | (b & 0x7f) as u64;
        if b & 0x80 == 0 {
          plt_sum += acc;
          plt_count += 1;
          acc = 0;
        }
      }
      i += 2 + len;
    } else {
      i += 1;
    }
  }
  assert_eq!(plt_count, expected_packets);
  let body_len = bytes.len() - 2 - (sod + 2);
  assert_eq!(plt_sum, body_len as u64);

  // And the stream still decodes.
  let decoded = decompress(&bytes, &DecoderParams::default(), &EventMgr::new()).unwrap();
  assert_eq!(decoded.comps[0].w, 64);
}

#[test]
fn all_progression_orders_round_trip() {
  let image = gray_image(48, 48, |x, y| ((3 * x + 5 * y) % 250) as i32);
  for order in [
    ProgressionOrder::Lrcp,
    ProgressionOrder::Rlcp,
    ProgressionOrder::Rpcl,
    ProgressionOrder::Pcrl,
    ProgressionOrder::Cprl,
  ] {
    let params = EncoderParams {
      num_resolutions: 3,
      progression: order,
      ..Default::default()
    };
    let bytes = compress(&image, &params, &EventMgr::new()).unwrap();
    let decoded = decompress(&bytes, &DecoderParams::default(), &EventMgr::new()).unwrap();
    assert_eq!(
      decoded.comps[0].data, image.comps[0].data,
      "order {:?}",
      order
    );
  }
}

#[test]
fn subwindow_decode_matches_full_decode() {
  let image = gray_image(256, 256, |x, y| ((x * 5 + y * 3) % 251) as i32);
  let bytes = compress(&image, &EncoderParams::default(), &EventMgr::new()).unwrap();

  let full = decompress(&bytes, &DecoderParams::default(), &EventMgr::new()).unwrap();

  let mut dec = Decompressor::new(&bytes, &DecoderParams::default(), EventMgr::new()).unwrap();
  dec.set_decode_area(100, 100, 200, 200).unwrap();
  let window = dec.decompress().unwrap();
  assert_eq!(window.comps[0].w, 100);
  assert_eq!(window.comps[0].h, 100);
  for y in 0..100u32 {
    for x in 0..100u32 {
      let want = full.comps[0].data[((y + 100) * 256 + x + 100) as usize];
      let got = window.comps[0].data[(y * 100 + x) as usize];
      assert_eq!(want, got, "window pixel ({}, {})", x, y);
    }
  }
}

#[test]
fn reduced_resolution_decode_halves_dimensions() {
  let image = gray_image(64, 48, |x, y| ((x + y) % 256) as i32);
  let bytes = compress(&image, &EncoderParams::default(), &EventMgr::new()).unwrap();
  let params = DecoderParams {
    reduce: 1,
    ..Default::default()
  };
  let decoded = decompress(&bytes, &params, &EventMgr::new()).unwrap();
  assert_eq!(decoded.comps[0].w, 32);
  assert_eq!(decoded.comps[0].h, 24);
  assert_eq!(decoded.comps[0].data.len(), 32 * 24);
}

#[test]
fn code_block_styles_round_trip() {
  let image = gray_image(40, 40, |x, y| ((x * x + y * 17) % 230) as i32);
  for cblksty in [
    CblkSty::BYPASS,
    CblkSty::TERMALL,
    CblkSty::SEGSYM,
    CblkSty::VSC,
    CblkSty::BYPASS | CblkSty::RESET,
    CblkSty::PTERM | CblkSty::TERMALL,
  ] {
    let params = EncoderParams {
      cblksty,
      ..Default::default()
    };
    let bytes = compress(&image, &params, &EventMgr::new()).unwrap();
    let decoded = decompress(&bytes, &DecoderParams::default(), &EventMgr::new()).unwrap();
    assert_eq!(
      decoded.comps[0].data, image.comps[0].data,
      "style {:?}",
      cblksty
    );
  }
}

#[test]
fn eph_markers_round_trip() {
  let image = gray_image(32, 32, |x, _| (x % 100) as i32);
  let params = EncoderParams {
    use_eph: true,
    use_sop: true,
    ..Default::default()
  };
  let bytes = compress(&image, &params, &EventMgr::new()).unwrap();
  assert!(bytes.windows(2).any(|w| w == [0xff, 0x92]));
  let decoded = decompress(&bytes, &DecoderParams::default(), &EventMgr::new()).unwrap();
  assert_eq!(decoded.comps[0].data, image.comps[0].data);
}

#[test]
fn sop_sequence_mismatch_warns_and_recovers() {
  let image = gray_image(32, 32, |x, y| ((x * 3 + y * 11) % 256) as i32);
  let params = EncoderParams {
    use_sop: true,
    ..Default::default()
  };
  let mut bytes = compress(&image, &params, &EventMgr::new()).unwrap();

  // Corrupt the sequence number of the second SOP marker. Inside coded
  // data a 0xFF is never followed by a byte >= 0x90, so every 0xFF91
  // pair after SOD is a genuine marker.
  let sod = bytes.windows(2).position(|w| w == [0xff, 0x93]).unwrap();
  let sops: Vec<usize> = (sod..bytes.len() - 1)
    .filter(|&i| bytes[i] == 0xff && bytes[i + 1] == 0x91)
    .collect();
  assert!(sops.len() >= 2, "need at least two packets with SOP");
  let nsop_at = sops[1] + 4;
  bytes[nsop_at] = 0x00;
  bytes[nsop_at + 1] = 0x63; // claims to be packet 99

  let warnings: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
  let sink = warnings.clone();
  let mut events = EventMgr::new();
  events.set_warning_handler(Arc::new(move |msg: &str| {
    sink.lock().unwrap().push(msg.to_string());
  }));

  // The mismatch must warn and resynchronize, not fail the decode.
  let decoded = decompress(&bytes, &DecoderParams::default(), &events).unwrap();
  assert_eq!(decoded.comps[0].data, image.comps[0].data);
  assert!(
    warnings.lock().unwrap().iter().any(|w| w.contains("SOP")),
    "expected an SOP sequence warning, got {:?}",
    warnings.lock().unwrap()
  );
}

#[test]
fn subsampled_component_round_trip() {
  let comp_params = [
    ImageCompParams::default(),
    ImageCompParams {
      dx: 2,
      dy: 2,
      ..Default::default()
    },
  ];
  let mut image = Image::new(0, 0, 32, 32, &comp_params, ColorSpace::Unknown).unwrap();
  for (i, v) in image.comps[0].data.iter_mut().enumerate() {
    *v = (i % 251) as i32;
  }
  for (i, v) in image.comps[1].data.iter_mut().enumerate() {
    *v = ((i * 3) % 247) as i32;
  }
  let bytes = compress(&image, &EncoderParams::default(), &EventMgr::new()).unwrap();
  let decoded = decompress(&bytes, &DecoderParams::default(), &EventMgr::new()).unwrap();
  assert_eq!(decoded.comps[0].data, image.comps[0].data);
  assert_eq!(decoded.comps[1].data, image.comps[1].data);
}

#[test]
fn multiple_layers_fixed_ratio_decode() {
  let image = gray_image(64, 64, |x, y| (((x * x) ^ (y * y)) % 256) as i32);
  let params = EncoderParams {
    num_layers: 3,
    rate_control_mode: RateControlMode::FixedRatio,
    rates: vec![16.0, 4.0, 0.0],
    ..Default::default()
  };
  let bytes = compress(&image, &params, &EventMgr::new()).unwrap();
  // The final unbounded layer makes the stream lossless again.
  let decoded = decompress(&bytes, &DecoderParams::default(), &EventMgr::new()).unwrap();
  assert_eq!(decoded.comps[0].data, image.comps[0].data);

  // Capping at one layer still yields a sensible approximation.
  let capped_params = DecoderParams {
    layers: 1,
    ..Default::default()
  };
  let capped = decompress(&bytes, &capped_params, &EventMgr::new()).unwrap();
  let db = psnr(&capped.comps[0].data, &image.comps[0].data, 255.0);
  assert!(db > 10.0, "first layer PSNR was {:.2} dB", db);
}

#[test]
fn strip_callback_receives_rows_in_order() {
  let image = gray_image(32, 48, |x, y| ((x + 2 * y) % 256) as i32);
  let params = EncoderParams {
    tile_size: Some((32, 16)),
    ..Default::default()
  };
  let bytes = compress(&image, &params, &EventMgr::new()).unwrap();

  let seen: Arc<Mutex<Vec<(u32, u32)>>> = Arc::new(Mutex::new(Vec::new()));
  let sink = seen.clone();
  let mut dec = Decompressor::new(&bytes, &DecoderParams::default(), EventMgr::new()).unwrap();
  dec.set_strip_callback(Arc::new(move |strip: &jp2k::StripData| {
    sink
      .lock()
      .unwrap()
      .push((strip.strip_index, strip.height));
  }));
  let decoded = dec.decompress().unwrap();
  assert_eq!(decoded.comps[0].data, image.comps[0].data);
  let seen = seen.lock().unwrap();
  assert_eq!(&*seen, &[(0, 16), (1, 16), (2, 16)]);
}

#[test]
fn quality_mode_reaches_target() {
  let image = gray_image(64, 64, |x, y| {
    (100.0 + 80.0 * (((x + y) as f64) / 11.0).sin()) as i32
  });
  let params = EncoderParams {
    irreversible: true,
    num_layers: 1,
    rate_control_mode: RateControlMode::FixedQuality,
    qualities: vec![42.0],
    ..Default::default()
  };
  let bytes = compress(&image, &params, &EventMgr::new()).unwrap();
  let decoded = decompress(&bytes, &DecoderParams::default(), &EventMgr::new()).unwrap();
  let db = psnr(&decoded.comps[0].data, &image.comps[0].data, 255.0);
  assert!(db >= 35.0, "quality-targeted PSNR was {:.2} dB", db);
}

#[test]
fn multi_tile_lossless_round_trip() {
  let image = gray_image(70, 50, |x, y| ((x * 31 + y * 7) % 256) as i32);
  let params = EncoderParams {
    tile_size: Some((32, 32)),
    num_resolutions: 3,
    ..Default::default()
  };
  let bytes = compress(&image, &params, &EventMgr::new()).unwrap();
  let decoded = decompress(&bytes, &DecoderParams::default(), &EventMgr::new()).unwrap();
  assert_eq!(decoded.comps[0].data, image.comps[0].data);
}

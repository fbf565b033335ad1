use std::{io::Cursor, rc::Rc};

use rand::{distributions::Alphanumeric, rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};
use tempfile::TempDir;

use super::*;
use crate::{
    header::{Antenna, Feed, IfWindow, Pol, ScanHeader},
    options::{
        AmpPhaseOptions, AveragingMethod, Combination, DelayModifier, IfOptions, PhaseUnits,
        Statistic, TsysMode,
    },
    products::{
        AmpPhase, BaselineSpectrum, BaselineVis, BinSpectrum, FilteredSpectrum, Limits,
        SpectrumData, SpectrumLimits, VisBin, VisCycle, VisData, VisQuantities,
    },
    read::{synthetic::SyntheticArchive, ArchiveRecord},
    reduce::{cycle_spectrum, cycle_vis},
    ServerType,
};

fn options() -> AmpPhaseOptions {
    let archive = SyntheticArchive::new();
    let mut o = AmpPhaseOptions {
        phase_units: PhaseUnits::Radians,
        include_flagged: true,
        tsys_mode: TsysMode::Computed,
        ..Default::default()
    };
    if let ArchiveRecord::Header(h) = &archive.records()[0] {
        o.ensure_windows(h);
    }
    o.delay_modifiers.push(DelayModifier {
        antenna: 4,
        window_number: 2,
        feed: Feed::Y,
        delay: -0.25,
        valid_from: f64::NEG_INFINITY,
        valid_to: 60000.5,
    });
    o
}

fn spectrum() -> SpectrumData {
    let archive = SyntheticArchive::new()
        .with_flagged_channels(&[3])
        .with_delays(&[0.0, 1.0]);
    let records = archive.records();
    match (&records[0], &records[1]) {
        (ArchiveRecord::Header(h), ArchiveRecord::Cycle(c)) => {
            cycle_spectrum(h, c, &Rc::new(options())).unwrap()
        }
        _ => unreachable!(),
    }
}

/// Data whose cycles have different numbers of IFs and pols.
fn ragged_vis() -> VisData {
    let archive = SyntheticArchive::new().with_scans(&[("1934-638", 2), ("0823-500", 2)]);
    let options = Rc::new(options());
    let mut vis = VisData::new(options.clone());
    let mut header = None;
    let mut k = 0;
    for record in archive.records() {
        match record {
            ArchiveRecord::Header(h) => header = Some(h),
            ArchiveRecord::Cycle(c) => {
                let h = header.as_ref().unwrap();
                let mut windows = cycle_vis(h, &c, &options).unwrap();
                match k % 3 {
                    0 => {
                        windows.pop();
                    }
                    1 => windows[0].truncate(1),
                    _ => windows[1].clear(),
                }
                k += 1;
                vis.push_cycle(h, c.mjd, windows);
            }
        }
    }
    vis
}

#[test]
fn test_vis_data_round_trip() {
    let vis = ragged_vis();
    assert_ne!(vis.num_ifs(0), vis.num_ifs(1));
    let bytes = encode_to_vec(&vis).unwrap();
    let decoded: VisData = decode_from_slice(&bytes).unwrap();
    assert_eq!(decoded, vis);
    // Every product shares the one decoded options set.
    let q = decoded.get(1, 0, 0).unwrap();
    assert!(Rc::ptr_eq(&q.options, &decoded.options));
}

#[test]
fn test_spectrum_round_trip() {
    let s = spectrum();
    let bytes = encode_to_vec(&s).unwrap();
    let decoded: SpectrumData = decode_from_slice(&bytes).unwrap();
    assert_eq!(decoded, s);
}

#[test]
fn test_messages_round_trip() {
    let requests = [
        Request::ServerType,
        Request::CurrentVisData,
        Request::ComputeVisData(OptionsSource::UseProvided(options())),
        Request::ComputeVisData(OptionsSource::UseAuthoritative),
        Request::ComputedVisData,
        Request::SpectrumAt { mjd: 60000.25 },
        Request::Username("observer".to_string()),
    ];
    for request in requests {
        let m = RequestMessage {
            client_id: "abcdefghij0123456789".to_string(),
            request,
        };
        let decoded: RequestMessage = decode_from_slice(&encode_to_vec(&m).unwrap()).unwrap();
        assert_eq!(decoded, m);
    }

    let responses = [
        Response::ServerType(ServerType::Simulator),
        Response::CurrentVisData(Rc::new(ragged_vis())),
        Response::VisDataComputed,
        Response::OptionsChanged {
            author: "observer".to_string(),
        },
        Response::Spectrum(spectrum()),
        Response::NoData,
        Response::UsernameRequired,
        Response::Shutdown,
    ];
    for response in responses {
        let m = ResponseMessage {
            client_id: String::new(),
            response,
        };
        let decoded: ResponseMessage = decode_from_slice(&encode_to_vec(&m).unwrap()).unwrap();
        assert_eq!(decoded, m);
        assert!(decoded.is_for("anyone"));
    }
}

#[test]
fn test_strings_are_padded_and_trimmed() {
    let mut buf = vec![];
    put_str(&mut buf, "ab", 8).unwrap();
    // A fixstr marker and 8 bytes.
    assert_eq!(buf.len(), 9);
    assert_eq!(&buf[1..], b"ab      ");
    let mut rd = buf.as_slice();
    assert_eq!(get_str(&mut rd, 8).unwrap(), "ab");

    let mut buf = vec![];
    encode::write_str(&mut buf, "xy\0zzzzz").unwrap();
    let mut rd = buf.as_slice();
    assert_eq!(get_str(&mut rd, 8).unwrap(), "xy");

    // Too long: cut to the capacity.
    let mut buf = vec![];
    put_str(&mut buf, "a-very-long-name", 8).unwrap();
    let mut rd = buf.as_slice();
    assert_eq!(get_str(&mut rd, 8).unwrap(), "a-very-l");

    // A capacity mismatch is an error.
    let mut rd = buf.as_slice();
    assert!(matches!(
        get_str(&mut rd, 12),
        Err(CodecError::LengthMismatch { .. })
    ));
}

#[test]
fn test_declared_lengths_beyond_the_data_are_rejected() {
    let mut buf = vec![];
    put_f32s(&mut buf, &[1.0, 2.0, 3.0]).unwrap();
    buf.truncate(buf.len() - 5);
    let mut rd = buf.as_slice();
    assert!(matches!(
        get_f32s(&mut rd),
        Err(CodecError::Truncated {
            declared: 3,
            available: 10
        })
    ));

    let bytes = encode_to_vec(&ragged_vis()).unwrap();
    for cut in [1, 7, bytes.len() / 2, bytes.len() - 1] {
        assert!(decode_from_slice::<VisData>(&bytes[..cut]).is_err());
    }
}

#[test]
fn test_shape_mismatches_are_rejected() {
    let mut s = spectrum();
    s.spectra[0][0].baselines[1].bins[0].amplitude.pop();
    let bytes = encode_to_vec(&s).unwrap();
    assert!(matches!(
        decode_from_slice::<SpectrumData>(&bytes),
        Err(CodecError::Shape(_))
    ));

    let mut v = ragged_vis();
    v.cycles[0].header = 10;
    let bytes = encode_to_vec(&v).unwrap();
    assert!(matches!(
        decode_from_slice::<VisData>(&bytes),
        Err(CodecError::Shape(_))
    ));

    // An odd number of floats can't be complex values.
    let mut buf = vec![];
    put_f32s(&mut buf, &[1.0, 2.0, 3.0]).unwrap();
    let mut rd = buf.as_slice();
    assert!(get_complexes(&mut rd).is_err());
}

#[test]
fn test_version_mismatch() {
    let mut bytes = vec![];
    put_uint(&mut bytes, 2).unwrap();
    put_uint(&mut bytes, 1).unwrap();
    put_str(&mut bytes, "", capacity::CLIENT_ID).unwrap();
    assert!(matches!(
        decode_from_slice::<RequestMessage>(&bytes),
        Err(CodecError::Version { got: 2 })
    ));

    let m = RequestMessage {
        client_id: String::new(),
        request: Request::ServerType,
    };
    let mut bytes = encode_to_vec(&m).unwrap();
    bytes.push(0);
    assert!(matches!(
        decode_from_slice::<RequestMessage>(&bytes),
        Err(CodecError::TrailingBytes(1))
    ));
}

#[test]
fn test_frames_reassemble_across_partial_reads() {
    let first = frame(b"hello").unwrap();
    let second = frame(&[7; 300]).unwrap();
    let stream: Vec<u8> = first.iter().chain(second.iter()).copied().collect();

    let mut fb = FrameBuffer::new();
    let mut frames = vec![];
    for piece in stream.chunks(3) {
        fb.extend(piece);
        while let Some(f) = fb.next_frame().unwrap() {
            frames.push(f);
        }
    }
    assert_eq!(frames, vec![b"hello".to_vec(), vec![7; 300]]);
    assert_eq!(fb.pending(), 0);

    let mut cursor = Cursor::new(stream);
    assert_eq!(read_frame(&mut cursor).unwrap().unwrap(), b"hello");
    assert_eq!(read_frame(&mut cursor).unwrap().unwrap().len(), 300);
    assert!(read_frame(&mut cursor).unwrap().is_none());
}

#[test]
fn test_oversized_frames_are_rejected() {
    let mut fb = FrameBuffer::new();
    fb.extend(&[0xff, 0xff, 0xff, 0xff]);
    assert!(matches!(fb.next_frame(), Err(CodecError::FrameTooLarge(_))));
}

#[test]
fn test_dump_files() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("vis.dump");
    let dump = Dump::Vis(ragged_vis());
    write_dump(&path, &dump).unwrap();
    assert_eq!(read_dump(&path).unwrap(), dump);

    let path = dir.path().join("spectrum.dump");
    let dump = Dump::Spectrum(spectrum());
    write_dump(&path, &dump).unwrap();
    assert_eq!(read_dump(&path).unwrap(), dump);

    std::fs::write(&path, b"nonsense").unwrap();
    assert!(matches!(read_dump(&path), Err(CodecError::BadDumpMagic)));
}

#[test]
fn test_empty_products() {
    let v = VisQuantities {
        window: 0,
        window_number: 1,
        pol: Pol::XX,
        obs_date: String::new(),
        ut_seconds: 0.0,
        mjd: 0.0,
        baselines: vec![BaselineVis {
            baseline: 258,
            bins: vec![VisBin {
                amplitude: 1.0,
                phase: 2.0,
                delay: 3.0,
                flagged: true,
            }],
        }],
        amplitude: Limits::EMPTY,
        phase: Limits::EMPTY,
        delay: Limits::EMPTY,
        options: Rc::new(AmpPhaseOptions::default()),
    };
    let mut buf = vec![];
    encode_vis_quantities(&mut buf, &v).unwrap();
    let mut rd = buf.as_slice();
    let decoded = decode_vis_quantities(&mut rd, &v.options).unwrap();
    assert!(rd.is_empty());
    assert_eq!(decoded, v);

    let empty = VisData::new(Rc::new(AmpPhaseOptions::default()));
    let decoded: VisData = decode_from_slice(&encode_to_vec(&empty).unwrap()).unwrap();
    assert!(decoded.is_empty());
}

/// Seeded random instances of everything the codec carries.
struct Random(StdRng);

impl Random {
    fn new(seed: u64) -> Random {
        Random(StdRng::seed_from_u64(seed))
    }

    fn below(&mut self, n: usize) -> usize {
        self.0.gen_range(0..n)
    }

    fn coin(&mut self) -> bool {
        self.0.gen_bool(0.5)
    }

    fn f32(&mut self) -> f32 {
        self.0.gen_range(-1e4..1e4)
    }

    fn f64(&mut self) -> f64 {
        self.0.gen_range(-1e6..1e6)
    }

    fn word(&mut self, capacity: usize) -> String {
        let n = self.0.gen_range(0..=capacity);
        (&mut self.0)
            .sample_iter(Alphanumeric)
            .take(n)
            .map(char::from)
            .collect()
    }

    fn f32s(&mut self, n: usize) -> Vec<f32> {
        (0..n).map(|_| self.f32()).collect()
    }

    fn complexes(&mut self, n: usize) -> Vec<Complex32> {
        (0..n).map(|_| Complex32::new(self.f32(), self.f32())).collect()
    }

    fn limits(&mut self) -> Limits {
        if self.below(4) == 0 {
            return Limits::EMPTY;
        }
        let min = self.f32();
        Limits {
            min,
            max: min + self.f32().abs(),
        }
    }

    fn spectrum_limits(&mut self) -> SpectrumLimits {
        SpectrumLimits {
            amplitude: self.limits(),
            phase: self.limits(),
            real: self.limits(),
            imag: self.limits(),
        }
    }

    fn options(&mut self) -> AmpPhaseOptions {
        let windows = (0..1 + self.below(4))
            .map(|_| {
                let num_channels = 1 + self.below(2048);
                let min_tvchannel = 1 + self.below(num_channels);
                IfOptions {
                    centre_freq: self.f64(),
                    bandwidth: self.f64().abs(),
                    num_channels,
                    min_tvchannel,
                    max_tvchannel: min_tvchannel + self.below(num_channels - min_tvchannel + 1),
                    delay_averaging: 1 + self.below(8),
                    averaging: AveragingMethod {
                        statistic: *[Statistic::Mean, Statistic::Median]
                            .choose(&mut self.0)
                            .unwrap(),
                        combination: *[Combination::Scalar, Combination::Vector]
                            .choose(&mut self.0)
                            .unwrap(),
                    },
                }
            })
            .collect();
        let delay_modifiers = (0..self.below(4))
            .map(|_| DelayModifier {
                antenna: 1 + self.below(6) as u32,
                window_number: 1 + self.below(4) as u32,
                feed: Feed::from_index(self.below(2)).unwrap(),
                delay: self.f32(),
                valid_from: if self.coin() {
                    f64::NEG_INFINITY
                } else {
                    self.f64()
                },
                valid_to: if self.coin() { f64::INFINITY } else { self.f64() },
            })
            .collect();
        AmpPhaseOptions {
            phase_units: if self.coin() {
                PhaseUnits::Radians
            } else {
                PhaseUnits::Degrees
            },
            include_flagged: self.coin(),
            tsys_mode: TsysMode::from_code(self.below(3) as i64).unwrap(),
            windows,
            delay_modifiers,
        }
    }

    fn header(&mut self) -> ScanHeader {
        let antennas = (0..self.below(7))
            .map(|i| Antenna {
                number: i as u32 + 1,
                name: self.word(capacity::ANTENNA_NAME),
                xyz: [self.f64(), self.f64(), self.f64()],
            })
            .collect();
        let windows = (0..1 + self.below(4))
            .map(|i| {
                let mut pols = Pol::ALL.to_vec();
                pols.shuffle(&mut self.0);
                pols.truncate(1 + self.below(4));
                IfWindow {
                    number: i as u32 + 1,
                    centre_freq: self.f64(),
                    bandwidth: self.f64().abs(),
                    num_channels: 1 + self.below(4096),
                    pols,
                    labels: [
                        self.word(capacity::WINDOW_LABEL),
                        self.word(capacity::WINDOW_LABEL),
                        self.word(capacity::WINDOW_LABEL),
                    ],
                }
            })
            .collect();
        ScanHeader {
            obs_date: self.word(capacity::OBS_DATE),
            ut_seconds: self.f64().abs(),
            mjd: self.f64(),
            source_name: self.word(capacity::SOURCE_NAME),
            obs_type: self.word(capacity::OBS_TYPE),
            cycle_time: 1.0 + self.f64().abs(),
            antennas,
            windows,
        }
    }

    fn ampphase(&mut self, options: &Rc<AmpPhaseOptions>) -> AmpPhase {
        let n = self.below(12);
        let baselines = (0..self.below(4))
            .map(|_| BaselineSpectrum {
                baseline: 256 * (1 + self.below(6) as u32) + 1 + self.below(6) as u32,
                bins: (0..1 + self.below(3))
                    .map(|_| {
                        let nf = self.below(n + 1);
                        BinSpectrum {
                            amplitude: self.f32s(n),
                            phase: self.f32s(n),
                            raw: self.complexes(n),
                            flagged: (0..n).map(|_| self.coin()).collect(),
                            filtered: FilteredSpectrum {
                                channel: self.f32s(nf),
                                frequency: self.f32s(nf),
                                amplitude: self.f32s(nf),
                                phase: self.f32s(nf),
                                raw: self.complexes(nf),
                            },
                        }
                    })
                    .collect(),
                limits: self.spectrum_limits(),
            })
            .collect();
        AmpPhase {
            window: self.below(4),
            window_number: 1 + self.below(4) as u32,
            pol: *Pol::ALL.choose(&mut self.0).unwrap(),
            obs_date: self.word(capacity::OBS_DATE),
            ut_seconds: self.f64().abs(),
            mjd: self.f64(),
            channel: self.f32s(n),
            frequency: self.f32s(n),
            baselines,
            limits: self.spectrum_limits(),
            options: options.clone(),
        }
    }

    fn vis_quantities(&mut self, options: &Rc<AmpPhaseOptions>) -> VisQuantities {
        let baselines = (0..self.below(8))
            .map(|_| BaselineVis {
                baseline: 256 * (1 + self.below(6) as u32) + 1 + self.below(6) as u32,
                bins: (0..1 + self.below(3))
                    .map(|_| VisBin {
                        amplitude: self.f32(),
                        phase: self.f32(),
                        delay: self.f32(),
                        flagged: self.coin(),
                    })
                    .collect(),
            })
            .collect();
        VisQuantities {
            window: self.below(4),
            window_number: 1 + self.below(4) as u32,
            pol: *Pol::ALL.choose(&mut self.0).unwrap(),
            obs_date: self.word(capacity::OBS_DATE),
            ut_seconds: self.f64().abs(),
            mjd: self.f64(),
            baselines,
            amplitude: self.limits(),
            phase: self.limits(),
            delay: self.limits(),
            options: options.clone(),
        }
    }

    /// Cycles differ in their numbers of IFs, and IFs in their numbers of
    /// pols, including none.
    fn vis_data(&mut self) -> VisData {
        let options = Rc::new(self.options());
        let headers: Vec<ScanHeader> = (0..1 + self.below(3)).map(|_| self.header()).collect();
        let cycles = (0..self.below(8))
            .map(|_| VisCycle {
                header: self.below(headers.len()),
                mjd: self.f64(),
                windows: (0..self.below(4))
                    .map(|_| {
                        (0..self.below(5))
                            .map(|_| self.vis_quantities(&options))
                            .collect()
                    })
                    .collect(),
            })
            .collect();
        VisData {
            headers,
            cycles,
            options,
        }
    }

    fn spectrum(&mut self) -> SpectrumData {
        let options = Rc::new(self.options());
        let spectra = (0..self.below(4))
            .map(|_| (0..self.below(5)).map(|_| self.ampphase(&options)).collect())
            .collect();
        SpectrumData {
            header: self.header(),
            spectra,
            options,
        }
    }

    fn request(&mut self) -> RequestMessage {
        let request = match self.below(7) {
            0 => Request::ServerType,
            1 => Request::CurrentVisData,
            2 => Request::ComputeVisData(OptionsSource::UseProvided(self.options())),
            3 => Request::ComputeVisData(OptionsSource::UseAuthoritative),
            4 => Request::ComputedVisData,
            5 => Request::SpectrumAt { mjd: self.f64() },
            _ => Request::Username(self.word(capacity::USERNAME)),
        };
        RequestMessage {
            client_id: self.word(capacity::CLIENT_ID),
            request,
        }
    }

    fn response(&mut self) -> ResponseMessage {
        let response = match self.below(9) {
            0 => Response::ServerType(if self.coin() {
                ServerType::RealInstrument
            } else {
                ServerType::Simulator
            }),
            1 => Response::CurrentVisData(Rc::new(self.vis_data())),
            2 => Response::VisDataComputed,
            3 => Response::ComputedVisData(Rc::new(self.vis_data())),
            4 => Response::OptionsChanged {
                author: self.word(capacity::USERNAME),
            },
            5 => Response::Spectrum(self.spectrum()),
            6 => Response::NoData,
            7 => Response::UsernameRequired,
            _ => Response::Shutdown,
        };
        ResponseMessage {
            client_id: self.word(capacity::CLIENT_ID),
            response,
        }
    }
}

fn round_trip<T: Encode + Decode + PartialEq + std::fmt::Debug>(value: &T) {
    let bytes = encode_to_vec(value).unwrap();
    let decoded: T = decode_from_slice(&bytes).unwrap();
    assert_eq!(&decoded, value);
}

#[test]
fn test_random_products_round_trip() {
    for seed in 0..64 {
        let mut r = Random::new(seed);
        round_trip(&r.vis_data());
        round_trip(&r.spectrum());
        round_trip(&r.options());
        round_trip(&r.header());
    }
}

#[test]
fn test_random_messages_round_trip() {
    let mut r = Random::new(0x5eed);
    for _ in 0..256 {
        round_trip(&r.request());
        round_trip(&r.response());
    }
}

//! Per-scan metadata: antennas, IF windows and polarisation products.

use std::fmt;

use hifitime::Epoch;

/// Baselines are numbered the way the correlator numbers them: `256 * ant1 +
/// ant2`, with `ant1 <= ant2`.
pub fn baseline_number(ant1: u32, ant2: u32) -> u32 {
    let (a, b) = if ant1 <= ant2 { (ant1, ant2) } else { (ant2, ant1) };
    256 * a + b
}

/// The inverse of [`baseline_number`].
pub fn baseline_antennas(baseline: u32) -> (u32, u32) {
    (baseline / 256, baseline % 256)
}

/// One of the two receptors on every antenna.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Feed {
    X,
    Y,
}

impl Feed {
    pub fn index(self) -> usize {
        match self {
            Feed::X => 0,
            Feed::Y => 1,
        }
    }

    pub fn from_index(i: usize) -> Option<Feed> {
        match i {
            0 => Some(Feed::X),
            1 => Some(Feed::Y),
            _ => None,
        }
    }
}

/// A polarisation product. On the command line these are written with the
/// feed letters "a" (X) and "b" (Y), e.g. "aa" for XX.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Pol {
    XX,
    YY,
    XY,
    YX,
}

impl Pol {
    pub const ALL: [Pol; 4] = [Pol::XX, Pol::YY, Pol::XY, Pol::YX];

    /// The wire/archive code for this product.
    pub fn code(self) -> u8 {
        match self {
            Pol::XX => 1,
            Pol::YY => 2,
            Pol::XY => 3,
            Pol::YX => 4,
        }
    }

    pub fn from_code(code: u8) -> Option<Pol> {
        Pol::ALL.into_iter().find(|p| p.code() == code)
    }

    /// The feeds of the first and second antenna of a baseline.
    pub fn feeds(self) -> (Feed, Feed) {
        match self {
            Pol::XX => (Feed::X, Feed::X),
            Pol::YY => (Feed::Y, Feed::Y),
            Pol::XY => (Feed::X, Feed::Y),
            Pol::YX => (Feed::Y, Feed::X),
        }
    }

    /// Parse "aa", "bb", "ab", "ba" (or the "xx" style equivalents).
    pub fn from_label(s: &str) -> Option<Pol> {
        match s.to_ascii_lowercase().as_str() {
            "aa" | "xx" => Some(Pol::XX),
            "bb" | "yy" => Some(Pol::YY),
            "ab" | "xy" => Some(Pol::XY),
            "ba" | "yx" => Some(Pol::YX),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Pol::XX => "aa",
            Pol::YY => "bb",
            Pol::XY => "ab",
            Pol::YX => "ba",
        }
    }
}

impl fmt::Display for Pol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label().to_ascii_uppercase())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Antenna {
    /// The station number (1-based).
    pub number: u32,

    pub name: String,

    /// Geocentric Cartesian position \[metres\].
    pub xyz: [f64; 3],
}

/// A frequency sub-band of the receiver.
#[derive(Debug, Clone, PartialEq)]
pub struct IfWindow {
    /// The correlator's window number (1-based).
    pub number: u32,

    /// Centre frequency \[MHz\].
    pub centre_freq: f64,

    /// Bandwidth \[MHz\].
    pub bandwidth: f64,

    pub num_channels: usize,

    /// The polarisation products recorded for this window, in the order they
    /// are interleaved in the raw samples.
    pub pols: Vec<Pol>,

    /// The three names this window answers to, e.g. `["f1", "1", "cont"]`.
    pub labels: [String; 3],
}

impl IfWindow {
    /// Channel width \[MHz\].
    pub fn channel_width(&self) -> f64 {
        if self.num_channels == 0 {
            0.0
        } else {
            self.bandwidth / self.num_channels as f64
        }
    }

    /// The centre frequency of a (0-based) channel \[MHz\].
    pub fn channel_freq(&self, chan: usize) -> f64 {
        let middle = (self.num_channels as f64 - 1.0) / 2.0;
        self.centre_freq + (chan as f64 - middle) * self.channel_width()
    }

    pub fn matches_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| !l.is_empty() && l == label)
    }

    pub fn pol_index(&self, pol: Pol) -> Option<usize> {
        self.pols.iter().position(|&p| p == pol)
    }

    /// The primary label.
    pub fn label(&self) -> &str {
        &self.labels[0]
    }
}

/// Immutable per-scan metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanHeader {
    /// The observation date, as "YYYY-MM-DD".
    pub obs_date: String,

    /// Scan start, seconds since UT midnight of `obs_date`.
    pub ut_seconds: f64,

    /// Scan start as a modified Julian date (UTC days).
    pub mjd: f64,

    pub source_name: String,

    pub obs_type: String,

    /// The correlator cycle time \[seconds\].
    pub cycle_time: f64,

    pub antennas: Vec<Antenna>,

    pub windows: Vec<IfWindow>,
}

impl ScanHeader {
    pub fn start(&self) -> Epoch {
        Epoch::from_mjd_utc(self.mjd)
    }

    pub fn antenna(&self, number: u32) -> Option<&Antenna> {
        self.antennas.iter().find(|a| a.number == number)
    }

    pub fn has_antenna(&self, number: u32) -> bool {
        self.antenna(number).is_some()
    }

    /// Find a window index by any of its labels.
    pub fn window_by_label(&self, label: &str) -> Option<usize> {
        self.windows.iter().position(|w| w.matches_label(label))
    }

    pub fn window_by_number(&self, number: u32) -> Option<usize> {
        self.windows.iter().position(|w| w.number == number)
    }

    /// The separation of two antennas \[metres\].
    pub fn baseline_length(&self, ant1: u32, ant2: u32) -> Option<f64> {
        let a = self.antenna(ant1)?;
        let b = self.antenna(ant2)?;
        let d2: f64 = a.xyz.iter().zip(b.xyz.iter()).map(|(p, q)| (p - q).powi(2)).sum();
        Some(d2.sqrt())
    }
}

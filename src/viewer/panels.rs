//! Time series for the display panels, and the renderers that draw them.

use std::{
    collections::BTreeMap,
    fmt,
    io::{self, Write},
    str::FromStr,
};

use itertools::Itertools;

use super::{commands::SortOrder, DisplayState};
use crate::{
    calibration::ClosurePhases,
    header::{baseline_antennas, baseline_number, Pol, ScanHeader},
    options::PhaseUnits,
    products::{Limits, VisData, VisQuantities},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PanelKind {
    Amplitude,
    Phase,
    Delay,
    ClosurePhase,
}

impl PanelKind {
    pub fn name(self) -> &'static str {
        match self {
            PanelKind::Amplitude => "amplitude",
            PanelKind::Phase => "phase",
            PanelKind::Delay => "delay",
            PanelKind::ClosurePhase => "closure phase",
        }
    }

    fn y_label(self, units: PhaseUnits) -> String {
        let phase_units = match units {
            PhaseUnits::Degrees => "deg",
            PhaseUnits::Radians => "rad",
        };
        match self {
            PanelKind::Amplitude => "Amplitude (Jy)".to_string(),
            PanelKind::Phase => format!("Phase ({phase_units})"),
            PanelKind::Delay => "Delay (ns)".to_string(),
            PanelKind::ClosurePhase => format!("Closure phase ({phase_units})"),
        }
    }
}

/// One line on a panel.
#[derive(Debug, Clone, PartialEq)]
pub struct Series {
    /// e.g. "1-2 f1 AA", or "1-3-4 f2 BB" for a closure triangle.
    pub label: String,
    pub window_label: String,
    pub pol: Pol,
    /// (MJD, value) pairs in time order. Flagged points are left out.
    pub points: Vec<(f64, f32)>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AxisRanges {
    /// MJD
    pub x: (f64, f64),
    pub y: (f32, f32),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Decorations {
    pub title: String,
    pub x_label: String,
    pub y_label: String,
    /// Source and time of the latest cycle.
    pub caption: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Panel {
    pub kind: PanelKind,
    pub series: Vec<Series>,
    pub ranges: AxisRanges,
    pub decorations: Decorations,
}

/// Whatever draws the panels.
pub trait Renderer {
    fn render(
        &mut self,
        series: &[Series],
        ranges: &AxisRanges,
        decorations: &Decorations,
    ) -> io::Result<()>;
}

/// Which (baseline, window, pol) a point belongs to.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct SeriesKey {
    baseline: u32,
    /// For closure triangles.
    third: u32,
    window_label: String,
    pol: Pol,
}

fn wanted_window<'a>(
    header: &'a ScanHeader,
    vq: &VisQuantities,
    display: &DisplayState,
) -> Option<&'a str> {
    let window = header.windows.get(vq.window)?;
    if !display.pols.contains(&vq.pol) {
        return None;
    }
    if display.visbands.is_empty() || display.visbands.iter().any(|b| window.matches_label(b)) {
        Some(window.label())
    } else {
        None
    }
}

/// The cycles inside the history window, ending at the latest one.
fn recent_cycles(data: &VisData, history_minutes: f64) -> impl Iterator<Item = usize> + '_ {
    let latest = data.cycles.last().map(|c| c.mjd).unwrap_or(0.0);
    let earliest = latest - history_minutes / 1440.0;
    data.cycles
        .iter()
        .enumerate()
        .filter(move |(_, c)| c.mjd >= earliest)
        .map(|(i, _)| i)
}

fn baseline_series(
    data: &VisData,
    display: &DisplayState,
    kind: PanelKind,
) -> BTreeMap<SeriesKey, Vec<(f64, f32)>> {
    let mut series: BTreeMap<SeriesKey, Vec<(f64, f32)>> = BTreeMap::new();
    for c in recent_cycles(data, display.history_minutes) {
        let header = match data.header_of(c) {
            Some(h) => h,
            None => continue,
        };
        for vq in data.cycles[c].windows.iter().flatten() {
            let window_label = match wanted_window(header, vq, display) {
                Some(l) => l,
                None => continue,
            };
            for bl in &vq.baselines {
                let (a, b) = baseline_antennas(bl.baseline);
                if a == b || !display.antennas.contains(&a) || !display.antennas.contains(&b) {
                    continue;
                }
                let bin = match bl.bins.first() {
                    Some(bin) if !bin.flagged => bin,
                    _ => continue,
                };
                let value = match kind {
                    PanelKind::Amplitude => bin.amplitude,
                    PanelKind::Phase => bin.phase,
                    _ => bin.delay,
                };
                series
                    .entry(SeriesKey {
                        baseline: bl.baseline,
                        third: 0,
                        window_label: window_label.to_string(),
                        pol: vq.pol,
                    })
                    .or_default()
                    .push((vq.mjd, value));
            }
        }
    }
    series
}

fn closure_series(
    data: &VisData,
    closure: &ClosurePhases,
    display: &DisplayState,
) -> BTreeMap<SeriesKey, Vec<(f64, f32)>> {
    let mut series: BTreeMap<SeriesKey, Vec<(f64, f32)>> = BTreeMap::new();
    if !display.antennas.contains(&closure.refant) {
        return series;
    }
    for c in recent_cycles(data, display.history_minutes) {
        let (header, windows) = match (data.header_of(c), closure.values.get(c)) {
            (Some(h), Some(w)) => (h, w),
            _ => continue,
        };
        let vqs = data.cycles[c].windows.iter().flatten();
        let cqs = windows.iter().flatten();
        for (vq, cq) in vqs.zip(cqs) {
            let window_label = match wanted_window(header, vq, display) {
                Some(l) => l,
                None => continue,
            };
            for t in &cq.triangles {
                if !display.antennas.contains(&t.ant1) || !display.antennas.contains(&t.ant2) {
                    continue;
                }
                if let Some(phase) = t.phase {
                    series
                        .entry(SeriesKey {
                            baseline: baseline_number(t.ant1, t.ant2),
                            third: closure.refant,
                            window_label: window_label.to_string(),
                            pol: cq.pol,
                        })
                        .or_default()
                        .push((cq.mjd, phase));
                }
            }
        }
    }
    series
}

fn series_label(key: &SeriesKey) -> String {
    let (a, b) = baseline_antennas(key.baseline);
    if key.third == 0 {
        format!("{a}-{b} {} {}", key.window_label, key.pol)
    } else {
        format!("{}-{a}-{b} {} {}", key.third, key.window_label, key.pol)
    }
}

/// Build every panel the display asks for.
pub fn build_panels(
    data: &VisData,
    closure: Option<&ClosurePhases>,
    display: &DisplayState,
) -> Vec<Panel> {
    let latest = data.latest_header();
    let units = data.options.phase_units;
    let caption = match (latest, data.cycles.last()) {
        (Some(h), Some(c)) => format!("{} at MJD {:.6}", h.source_name, c.mjd),
        _ => String::new(),
    };

    let mut panels = vec![];
    for &kind in &display.panels {
        let series = match kind {
            PanelKind::ClosurePhase => match closure {
                Some(cp) => closure_series(data, cp, display),
                None => BTreeMap::new(),
            },
            _ => baseline_series(data, display, kind),
        };

        let length = |key: &SeriesKey| {
            let (a, b) = baseline_antennas(key.baseline);
            latest.and_then(|h| h.baseline_length(a, b)).unwrap_or(0.0)
        };
        let ordered = series.into_iter().sorted_by(|(k1, _), (k2, _)| match display.sort {
            SortOrder::Number => k1.cmp(k2),
            SortOrder::Length => length(k1)
                .total_cmp(&length(k2))
                .then_with(|| k1.cmp(k2)),
        });

        let mut y = Limits::EMPTY;
        let series: Vec<Series> = ordered
            .map(|(key, points)| {
                for &(_, v) in &points {
                    y.include(v);
                }
                Series {
                    label: series_label(&key),
                    window_label: key.window_label,
                    pol: key.pol,
                    points,
                }
            })
            .collect();

        let x_range = match (
            series.iter().flat_map(|s| s.points.first()).map(|p| p.0).reduce(f64::min),
            series.iter().flat_map(|s| s.points.last()).map(|p| p.0).reduce(f64::max),
        ) {
            (Some(lo), Some(hi)) => (lo, hi),
            _ => (0.0, 0.0),
        };
        let y_range = match display.scales.get(&kind) {
            Some(&r) => r,
            None if y.is_empty() => (0.0, 1.0),
            None => (y.min, y.max),
        };

        panels.push(Panel {
            kind,
            series,
            ranges: AxisRanges {
                x: x_range,
                y: y_range,
            },
            decorations: Decorations {
                title: kind.name().to_string(),
                x_label: "MJD".to_string(),
                y_label: kind.y_label(units),
                caption: caption.clone(),
            },
        });
    }
    panels
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpFormat {
    Text,
    Csv,
}

impl FromStr for DumpFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" | "txt" => Ok(DumpFormat::Text),
            "csv" => Ok(DumpFormat::Csv),
            _ => Err(format!("'{s}' isn't a dump format; use text or csv")),
        }
    }
}

impl fmt::Display for DumpFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DumpFormat::Text => write!(f, "text"),
            DumpFormat::Csv => write!(f, "csv"),
        }
    }
}

/// Writes every point of every series.
pub struct TextDumpRenderer<W: Write> {
    writer: W,
    format: DumpFormat,
}

impl<W: Write> TextDumpRenderer<W> {
    pub fn new(writer: W, format: DumpFormat) -> TextDumpRenderer<W> {
        TextDumpRenderer { writer, format }
    }
}

impl<W: Write> Renderer for TextDumpRenderer<W> {
    fn render(
        &mut self,
        series: &[Series],
        ranges: &AxisRanges,
        decorations: &Decorations,
    ) -> io::Result<()> {
        let w = &mut self.writer;
        match self.format {
            DumpFormat::Text => {
                writeln!(w, "# {}: {}", decorations.title, decorations.caption)?;
                writeln!(
                    w,
                    "# {} {:.6} to {:.6}; {} {} to {}",
                    decorations.x_label,
                    ranges.x.0,
                    ranges.x.1,
                    decorations.y_label,
                    ranges.y.0,
                    ranges.y.1
                )?;
                for s in series {
                    writeln!(w, "## {}", s.label)?;
                    for (t, v) in &s.points {
                        writeln!(w, "{t:.8} {v}")?;
                    }
                }
            }
            DumpFormat::Csv => {
                for s in series {
                    for (t, v) in &s.points {
                        writeln!(w, "{},{},{t:.8},{v}", decorations.title, s.label)?;
                    }
                }
            }
        }
        w.flush()
    }
}

/// Prints the latest value of every series, one line each.
pub struct SummaryRenderer<W: Write> {
    writer: W,
}

impl<W: Write> SummaryRenderer<W> {
    pub fn new(writer: W) -> SummaryRenderer<W> {
        SummaryRenderer { writer }
    }
}

impl<W: Write> Renderer for SummaryRenderer<W> {
    fn render(
        &mut self,
        series: &[Series],
        ranges: &AxisRanges,
        decorations: &Decorations,
    ) -> io::Result<()> {
        let w = &mut self.writer;
        writeln!(
            w,
            "{} [{} to {}] {}",
            decorations.y_label, ranges.y.0, ranges.y.1, decorations.caption
        )?;
        for s in series {
            if let Some((_, v)) = s.points.last() {
                writeln!(w, "  {:>16} {v:>10.3} ({} points)", s.label, s.points.len())?;
            }
        }
        w.flush()
    }
}

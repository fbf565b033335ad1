//! The viewer's side of a session.
//!
//! [`ViewerSession`] holds the last data set the server sent, what the user
//! wants displayed, and a set of pending [`Action`]s. Typed lines and server
//! responses only queue actions and requests; [`ViewerSession::process_pending`]
//! carries the actions out in a fixed order. Sockets and terminals are the
//! caller's business.

pub mod commands;
pub mod panels;

#[cfg(test)]
mod tests;

use std::{
    collections::{BTreeMap, BTreeSet},
    fs::File,
    io::{self, BufWriter},
    path::{Path, PathBuf},
    rc::Rc,
};

use log::{debug, info, warn};
use thiserror::Error;

use self::{
    commands::{parse_command, Command, CommandError, SortOrder},
    panels::{build_panels, DumpFormat, PanelKind, Renderer, TextDumpRenderer},
};
use crate::{
    calibration::{closure_phases, delay_solution, ClosurePhases, DelayRange},
    codec::{
        capacity, read_dump, CodecError, Dump, OptionsSource, Request, RequestMessage, Response,
        ResponseMessage,
    },
    header::Pol,
    options::AmpPhaseOptions,
    products::{SpectrumData, VisData},
    ServerType,
};

/// How many tries a user gets to type an acceptable username.
pub const USERNAME_ATTEMPTS: usize = 5;

#[derive(Error, Debug)]
pub enum ViewerError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("Couldn't install the interrupt handler: {0}")]
    Signal(#[from] ctrlc::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Work waiting to be done, in the order it is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Action {
    NewData,
    ClosurePhase,
    DelayCalc,
    Describe,
    VisbandsChanged,
    Refresh,
    OptionsPrint,
    /// Channel range or averaging settings were edited.
    TvChannels,
    /// Tsys, flagging, units or delay corrections were edited.
    TsysCorr,
    /// Another client changed the options.
    OptionsChanged,
    Username,
    UnknownCommand,
    Quit,
}

/// What the user wants to see. None of this is shared with the server.
#[derive(Debug, Clone, PartialEq)]
pub struct DisplayState {
    pub pols: Vec<Pol>,
    /// IF labels to show. Empty shows them all.
    pub visbands: Vec<String>,
    pub panels: Vec<PanelKind>,
    pub antennas: BTreeSet<u32>,
    pub history_minutes: f64,
    pub scales: BTreeMap<PanelKind, (f32, f32)>,
    pub sort: SortOrder,
    /// Window numbers used for delay calibration.
    pub calbands: [u32; 2],
    pub refant: u32,
    pub nncal: usize,
}

impl Default for DisplayState {
    fn default() -> Self {
        DisplayState {
            pols: vec![Pol::XX, Pol::YY],
            visbands: vec![],
            panels: vec![PanelKind::Amplitude, PanelKind::Phase, PanelKind::Delay],
            antennas: (1..=6).collect(),
            history_minutes: 20.0,
            scales: BTreeMap::new(),
            sort: SortOrder::Length,
            calbands: [1, 2],
            refant: 1,
            nncal: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputMode {
    Command,
    Username { attempts: usize },
}

pub fn valid_username(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= capacity::USERNAME
        && name.chars().all(|c| c.is_ascii_graphic())
}

pub struct ViewerSession {
    client_id: String,
    username: Option<String>,
    server_type: Option<ServerType>,

    data: Option<Rc<VisData>>,
    /// Our copy of the options; edits go here before they are sent.
    options: AmpPhaseOptions,
    spectrum: Option<SpectrumData>,
    closure: Option<ClosurePhases>,

    display: DisplayState,
    dump_format: DumpFormat,

    pending: BTreeSet<Action>,
    mode: InputMode,
    /// The options request to resend once we have a username.
    held_options: Option<AmpPhaseOptions>,
    dcal_range: DelayRange,
    hardcopy: Option<PathBuf>,
    unknown_command: Option<String>,
    quit: bool,

    requests: Vec<RequestMessage>,
    status: Vec<String>,
}

impl ViewerSession {
    pub fn new(client_id: String) -> ViewerSession {
        ViewerSession {
            client_id,
            username: None,
            server_type: None,
            data: None,
            options: AmpPhaseOptions::default(),
            spectrum: None,
            closure: None,
            display: DisplayState::default(),
            dump_format: DumpFormat::Text,
            pending: BTreeSet::new(),
            mode: InputMode::Command,
            held_options: None,
            dcal_range: DelayRange::All,
            hardcopy: None,
            unknown_command: None,
            quit: false,
            requests: vec![],
            status: vec![],
        }
    }

    pub fn with_username(mut self, username: &str) -> ViewerSession {
        if valid_username(username) {
            self.username = Some(username.to_string());
        } else {
            warn!("Ignoring the unusable username '{username}'");
        }
        self
    }

    pub fn with_dump_format(mut self, format: DumpFormat) -> ViewerSession {
        self.dump_format = format;
        self
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub fn server_type(&self) -> Option<ServerType> {
        self.server_type
    }

    pub fn data(&self) -> Option<&Rc<VisData>> {
        self.data.as_ref()
    }

    pub fn options(&self) -> &AmpPhaseOptions {
        &self.options
    }

    pub fn spectrum(&self) -> Option<&SpectrumData> {
        self.spectrum.as_ref()
    }

    pub fn closure(&self) -> Option<&ClosurePhases> {
        self.closure.as_ref()
    }

    pub fn display(&self) -> &DisplayState {
        &self.display
    }

    pub fn mode(&self) -> InputMode {
        self.mode
    }

    pub fn pending(&self) -> &BTreeSet<Action> {
        &self.pending
    }

    pub fn should_quit(&self) -> bool {
        self.quit
    }

    pub fn prompt(&self) -> &'static str {
        match self.mode {
            InputMode::Command => "atvis> ",
            InputMode::Username { .. } => "username: ",
        }
    }

    /// Requests waiting to go to the server.
    pub fn take_requests(&mut self) -> Vec<RequestMessage> {
        std::mem::take(&mut self.requests)
    }

    /// Status lines waiting to be shown.
    pub fn take_status(&mut self) -> Vec<String> {
        std::mem::take(&mut self.status)
    }

    fn send(&mut self, request: Request) {
        debug!("Queueing {request:?}");
        self.requests.push(RequestMessage {
            client_id: self.client_id.clone(),
            request,
        });
    }

    fn say<S: Into<String>>(&mut self, line: S) {
        self.status.push(line.into());
    }

    /// The opening requests: what kind of server this is, who we are, and
    /// the data it has.
    pub fn start(&mut self) {
        self.send(Request::ServerType);
        if let Some(name) = self.username.clone() {
            self.send(Request::Username(name));
        }
        self.send(Request::CurrentVisData);
    }

    /// Show a dump file instead of live data.
    pub fn load_dump<P: AsRef<Path>>(&mut self, path: P) -> Result<(), ViewerError> {
        let path = path.as_ref();
        match read_dump(path)? {
            Dump::Vis(vis) => {
                info!("Loaded {} cycle(s) from {}", vis.num_cycles(), path.display());
                self.adopt(Rc::new(vis));
            }
            Dump::Spectrum(s) => {
                info!("Loaded a spectrum from {}", path.display());
                self.show_spectrum(s);
            }
        }
        Ok(())
    }

    fn adopt(&mut self, vis: Rc<VisData>) {
        self.options = (*vis.options).clone();
        self.data = Some(vis);
        self.pending.insert(Action::NewData);
    }

    fn show_spectrum(&mut self, s: SpectrumData) {
        let mjd = s.mjd().unwrap_or(0.0);
        self.say(format!(
            "Spectrum of {} at MJD {mjd:.6}: {} IF(s)",
            s.header.source_name,
            s.num_ifs()
        ));
        self.spectrum = Some(s);
    }

    /// Something from the server.
    pub fn handle_response(&mut self, message: ResponseMessage) {
        if !message.is_for(&self.client_id) {
            debug!("Ignoring a response for {}", message.client_id);
            return;
        }
        match message.response {
            Response::ServerType(t) => {
                self.say(format!(
                    "Connected to a {} server",
                    match t {
                        ServerType::RealInstrument => "live",
                        ServerType::Simulator => "simulator",
                    }
                ));
                self.server_type = Some(t);
            }
            Response::CurrentVisData(vis) | Response::ComputedVisData(vis) => self.adopt(vis),
            Response::VisDataComputed => {
                self.held_options = None;
                self.send(Request::ComputedVisData);
            }
            Response::OptionsChanged { author } => {
                self.say(format!("{author} changed the options"));
                self.pending.insert(Action::OptionsChanged);
            }
            Response::Spectrum(s) => self.show_spectrum(s),
            Response::NoData => match self.held_options.take() {
                Some(_) => {
                    self.say("The server didn't accept the options");
                    if let Some(d) = &self.data {
                        self.options = (*d.options).clone();
                    }
                }
                None => self.say("No data at that time"),
            },
            Response::UsernameRequired => {
                self.pending.insert(Action::Username);
            }
            Response::Shutdown => {
                self.say("The server is shutting down");
                self.pending.insert(Action::Quit);
            }
        }
    }

    /// The server hung up without a goodbye; handled like one.
    pub fn server_closed(&mut self) {
        self.say("The server closed the connection");
        self.pending.insert(Action::Quit);
    }

    /// Stop, whatever the user was in the middle of typing.
    pub fn quit(&mut self) {
        self.mode = InputMode::Command;
        self.held_options = None;
        self.pending.insert(Action::Quit);
    }

    /// A line the user typed.
    pub fn handle_line(&mut self, line: &str) {
        match self.mode {
            InputMode::Username { attempts } => self.username_attempt(line.trim(), attempts),
            InputMode::Command => match parse_command(line) {
                Ok(Some(c)) => self.execute(c),
                Ok(None) => (),
                Err(CommandError::Unknown(word)) => {
                    self.unknown_command = Some(word);
                    self.pending.insert(Action::UnknownCommand);
                }
                Err(e) => self.say(e.to_string()),
            },
        }
    }

    fn username_attempt(&mut self, name: &str, attempts: usize) {
        if valid_username(name) {
            self.username = Some(name.to_string());
            self.mode = InputMode::Command;
            self.send(Request::Username(name.to_string()));
            // Held until the server answers.
            if let Some(options) = self.held_options.clone() {
                self.send(Request::ComputeVisData(OptionsSource::UseProvided(options)));
            }
            return;
        }
        let attempts = attempts + 1;
        if attempts >= USERNAME_ATTEMPTS {
            self.mode = InputMode::Command;
            self.held_options = None;
            self.say("Too many attempts; the options were not changed");
        } else {
            self.mode = InputMode::Username { attempts };
            self.say(format!(
                "A username is one word of at most {} printable characters ({} tries left)",
                capacity::USERNAME,
                USERNAME_ATTEMPTS - attempts
            ));
        }
    }

    /// Where the settings for the IF called `band` live in our options,
    /// adding defaults for it if it has none.
    fn window_index(&mut self, band: &str) -> Option<usize> {
        let found = self
            .data
            .as_ref()
            .and_then(|d| d.latest_header())
            .and_then(|h| h.window_by_label(band).map(|i| h.windows[i].clone()));
        match found {
            Some(w) => {
                self.options.window_options_mut(&w);
                self.options.windows.iter().position(|o| o.matches(&w))
            }
            None => {
                self.say(format!("No IF called '{band}'"));
                None
            }
        }
    }

    fn execute(&mut self, command: Command) {
        match command {
            Command::Select(words) => {
                let mut pols = vec![];
                let mut panels = vec![];
                let mut bands = vec![];
                for w in words {
                    if let Some(p) = Pol::from_label(&w) {
                        pols.push(p);
                    } else if let Ok(p) = w.parse::<PanelKind>() {
                        panels.push(p);
                    } else {
                        let known = self
                            .data
                            .as_ref()
                            .and_then(|d| d.latest_header())
                            .map(|h| h.window_by_label(&w).is_some())
                            .unwrap_or(true);
                        if !known {
                            self.say(format!("select: nothing called '{w}'"));
                            return;
                        }
                        bands.push(w);
                    }
                }
                if !pols.is_empty() {
                    self.display.pols = pols;
                }
                if !panels.is_empty() {
                    if self.closure.is_none() && panels.contains(&PanelKind::ClosurePhase) {
                        self.pending.insert(Action::ClosurePhase);
                    }
                    self.display.panels = panels;
                }
                if bands.is_empty() {
                    self.pending.insert(Action::Refresh);
                } else {
                    self.display.visbands = bands;
                    self.pending.insert(Action::VisbandsChanged);
                }
            }
            Command::Array(antennas) => {
                if antennas.iter().any(|&a| a == 0) {
                    self.say("Antennas are numbered from 1");
                    return;
                }
                self.display.antennas = antennas.into_iter().collect();
                self.pending.insert(Action::Refresh);
            }
            Command::History(minutes) => {
                self.display.history_minutes = minutes;
                self.pending.insert(Action::Refresh);
            }
            Command::Scale { panel, range } => {
                match range {
                    Some(r) => self.display.scales.insert(panel, r),
                    None => self.display.scales.remove(&panel),
                };
                self.pending.insert(Action::Refresh);
            }
            Command::Calband(bands) => {
                self.display.calbands = bands;
                self.say(format!(
                    "Delays will be calibrated with windows {} and {}",
                    bands[0], bands[1]
                ));
            }
            Command::Sort(order) => {
                self.display.sort = order;
                self.pending.insert(Action::Refresh);
            }
            Command::Refant(a) => {
                if a == 0 {
                    self.say("Antennas are numbered from 1");
                    return;
                }
                if a != self.display.refant {
                    self.display.refant = a;
                    self.pending.insert(Action::ClosurePhase);
                }
                self.pending.insert(Action::Refresh);
            }
            Command::Nncal(n) => {
                self.display.nncal = n;
                self.say(format!("Delay calibration will use {n} cycle(s)"));
            }
            Command::Dcal(range) => {
                self.dcal_range = range;
                self.pending.insert(Action::DelayCalc);
            }
            Command::ResetDelays => {
                self.options.delay_modifiers.clear();
                self.pending.insert(Action::TsysCorr);
            }
            Command::Dump(path) => {
                self.hardcopy = Some(path);
                self.pending.insert(Action::Refresh);
            }
            Command::TvChannel { band, min, max } => {
                if let Some(i) = self.window_index(&band) {
                    let w = &mut self.options.windows[i];
                    if max > w.num_channels {
                        let n = w.num_channels;
                        self.say(format!("{band} only has {n} channels"));
                        return;
                    }
                    w.min_tvchannel = min;
                    w.max_tvchannel = max;
                    self.pending.insert(Action::TvChannels);
                }
            }
            Command::Average { band, method } => {
                if let Some(i) = self.window_index(&band) {
                    self.options.windows[i].averaging = method;
                    self.pending.insert(Action::TvChannels);
                }
            }
            Command::DelayAveraging { band, factor } => {
                if let Some(i) = self.window_index(&band) {
                    self.options.windows[i].delay_averaging = factor;
                    self.pending.insert(Action::TvChannels);
                }
            }
            Command::Tsys(mode) => {
                self.options.tsys_mode = mode;
                self.pending.insert(Action::TsysCorr);
            }
            Command::Flagging { include } => {
                self.options.include_flagged = include;
                self.pending.insert(Action::TsysCorr);
            }
            Command::Units(units) => {
                self.options.phase_units = units;
                self.pending.insert(Action::TsysCorr);
            }
            Command::Describe => {
                self.pending.insert(Action::Describe);
            }
            Command::Print => {
                self.pending.insert(Action::OptionsPrint);
            }
            Command::Closure(refant) => {
                if !self.display.panels.contains(&PanelKind::ClosurePhase) {
                    self.display.panels.push(PanelKind::ClosurePhase);
                }
                if let Some(a) = refant {
                    self.display.refant = a;
                }
                self.pending.insert(Action::ClosurePhase);
                self.pending.insert(Action::Refresh);
            }
            Command::Spectrum(mjd) => self.send(Request::SpectrumAt { mjd }),
            Command::Quit => {
                self.pending.insert(Action::Quit);
            }
        }
    }

    /// Send our options to the server, which makes us their author.
    fn publish_options(&mut self) {
        if self.username.is_none() {
            // The server would refuse; ask for a name first.
            self.held_options = Some(self.options.clone());
            self.pending.insert(Action::Username);
            return;
        }
        let options = self.options.clone();
        self.held_options = Some(options.clone());
        self.send(Request::ComputeVisData(OptionsSource::UseProvided(options)));
    }

    /// Carry out every pending action, in order. Actions queued along the way
    /// are carried out too.
    pub fn process_pending(&mut self, renderer: &mut dyn Renderer) -> Result<(), ViewerError> {
        let mut publish = false;
        while let Some(action) = self.pending.pop_first() {
            debug!("{action:?}");
            match action {
                Action::NewData => {
                    if let Some(d) = &self.data {
                        let n = d.num_cycles();
                        self.say(format!("Have {n} cycle(s)"));
                    }
                    // Closure phases from older data no longer line up with
                    // the cycles.
                    if self.closure.is_some()
                        || self.display.panels.contains(&PanelKind::ClosurePhase)
                    {
                        self.pending.insert(Action::ClosurePhase);
                    }
                    self.pending.insert(Action::Refresh);
                }

                Action::ClosurePhase => {
                    self.closure = self
                        .data
                        .as_ref()
                        .map(|d| closure_phases(d, self.display.refant));
                }

                Action::DelayCalc => self.delay_calc(&mut publish),

                Action::Describe => self.describe(),

                Action::VisbandsChanged => {
                    let bands = if self.display.visbands.is_empty() {
                        "all".to_string()
                    } else {
                        self.display.visbands.join(" ")
                    };
                    self.say(format!("Showing IFs: {bands}"));
                    self.pending.insert(Action::Refresh);
                }

                Action::Refresh => self.refresh(renderer)?,

                Action::OptionsPrint => {
                    for line in self.options.describe() {
                        self.say(line);
                    }
                }

                Action::TvChannels | Action::TsysCorr => publish = true,

                Action::OptionsChanged => {
                    if !publish {
                        self.send(Request::ComputeVisData(OptionsSource::UseAuthoritative));
                    }
                }

                Action::Username => {
                    if self.username.is_none() {
                        if self.held_options.is_none() {
                            self.held_options = Some(self.options.clone());
                        }
                        self.mode = InputMode::Username { attempts: 0 };
                        self.say("The server needs a username before it accepts new options");
                    } else if let Some(options) = self.held_options.clone() {
                        // We did have a name; the server didn't get it.
                        let name = self.username.clone().unwrap_or_default();
                        self.send(Request::Username(name));
                        self.send(Request::ComputeVisData(OptionsSource::UseProvided(options)));
                    }
                }

                Action::UnknownCommand => {
                    let word = self.unknown_command.take().unwrap_or_default();
                    self.say(format!("unknown command '{word}'"));
                }

                Action::Quit => self.quit = true,
            }

            // Options edits go out once, after every edit this round.
            if publish && self.pending.iter().all(|&a| a > Action::OptionsChanged) {
                self.publish_options();
                publish = false;
            }
        }
        Ok(())
    }

    fn delay_calc(&mut self, publish: &mut bool) {
        let data = match &self.data {
            Some(d) if !d.is_empty() => d.clone(),
            _ => {
                self.say("No data to calibrate");
                return;
            }
        };
        let d = &self.display;
        match delay_solution(
            &data,
            d.refant,
            d.nncal,
            d.calbands,
            data.num_cycles() - 1,
            self.dcal_range,
        ) {
            Ok(solution) => {
                self.say(format!(
                    "Applying {} delay correction(s) against antenna {}",
                    solution.len(),
                    self.display.refant
                ));
                self.options.delay_modifiers.extend(solution);
                *publish = true;
            }
            Err(e) => self.say(e.to_string()),
        }
    }

    fn describe(&mut self) {
        let lines: Vec<String> = match self.data.as_ref().and_then(|d| d.latest_header()) {
            Some(h) => {
                let mut lines = vec![format!(
                    "{} ({}) observed {}, cycle time {} s",
                    h.source_name, h.obs_type, h.obs_date, h.cycle_time
                )];
                for w in &h.windows {
                    lines.push(format!(
                        "  {} (window {}): {:.3} MHz, {:.3} MHz wide, {} channels, {}",
                        w.label(),
                        w.number,
                        w.centre_freq,
                        w.bandwidth,
                        w.num_channels,
                        w.pols.iter().map(|p| p.to_string()).collect::<Vec<_>>().join(" ")
                    ));
                }
                lines.push(format!(
                    "  antennas: {}",
                    h.antennas
                        .iter()
                        .map(|a| format!("{}={}", a.number, a.name))
                        .collect::<Vec<_>>()
                        .join(" ")
                ));
                lines
            }
            None => vec!["No data yet".to_string()],
        };
        self.status.extend(lines);
    }

    fn refresh(&mut self, renderer: &mut dyn Renderer) -> Result<(), ViewerError> {
        let hardcopy = self.hardcopy.take();
        let data = match &self.data {
            Some(d) => d.clone(),
            None => {
                self.say("No data to display");
                return Ok(());
            }
        };
        let panels = build_panels(&data, self.closure.as_ref(), &self.display);
        match hardcopy {
            Some(path) => {
                let file = BufWriter::new(File::create(&path)?);
                let mut dump = TextDumpRenderer::new(file, self.dump_format);
                for p in &panels {
                    dump.render(&p.series, &p.ranges, &p.decorations)?;
                }
                self.say(format!("Wrote {}", path.display()));
            }
            None => {
                for p in &panels {
                    renderer.render(&p.series, &p.ranges, &p.decorations)?;
                }
            }
        }
        Ok(())
    }
}

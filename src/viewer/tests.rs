use approx::assert_abs_diff_eq;
use tempfile::TempDir;

use super::{panels::Series, *};
use crate::{
    index::ArchiveIndex,
    options::PhaseUnits,
    read::synthetic::SyntheticArchive,
    reduce::{reduce, ReadMode},
};

const ID: &str = "viewer00000000000000";

#[derive(Default)]
struct Recorder {
    panels: Vec<(String, Vec<Series>)>,
}

impl Renderer for Recorder {
    fn render(
        &mut self,
        series: &[Series],
        _ranges: &panels::AxisRanges,
        decorations: &panels::Decorations,
    ) -> io::Result<()> {
        self.panels
            .push((decorations.title.clone(), series.to_vec()));
        Ok(())
    }
}

fn vis_data(archive: &SyntheticArchive) -> Rc<VisData> {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("obs.arc");
    archive.write_to(&path).unwrap();
    let mut index = ArchiveIndex::build(&[&path]);
    let mut options = AmpPhaseOptions::default();
    for h in index.headers() {
        options.ensure_windows(h);
    }
    let reduction = reduce(
        ReadMode::COMPUTE_VIS,
        &[&path],
        &mut index,
        None,
        &Rc::new(options),
    )
    .unwrap();
    Rc::new(reduction.vis.unwrap())
}

fn reply(response: Response) -> ResponseMessage {
    ResponseMessage {
        client_id: ID.to_string(),
        response,
    }
}

fn session_with_data(archive: &SyntheticArchive) -> (ViewerSession, Recorder) {
    let mut session = ViewerSession::new(ID.to_string());
    session.handle_response(reply(Response::CurrentVisData(vis_data(archive))));
    let mut recorder = Recorder::default();
    session.process_pending(&mut recorder).unwrap();
    session.take_status();
    (session, recorder)
}

fn requests(session: &mut ViewerSession) -> Vec<Request> {
    session
        .take_requests()
        .into_iter()
        .map(|m| {
            assert_eq!(m.client_id, ID);
            m.request
        })
        .collect()
}

#[test]
fn test_actions_are_ordered() {
    let shuffled = [
        Action::Quit,
        Action::Refresh,
        Action::Username,
        Action::NewData,
        Action::TsysCorr,
        Action::Describe,
        Action::OptionsChanged,
        Action::ClosurePhase,
        Action::UnknownCommand,
        Action::TvChannels,
        Action::DelayCalc,
        Action::OptionsPrint,
        Action::VisbandsChanged,
    ];
    let set: BTreeSet<Action> = shuffled.into_iter().collect();
    assert_eq!(
        set.into_iter().collect::<Vec<_>>(),
        vec![
            Action::NewData,
            Action::ClosurePhase,
            Action::DelayCalc,
            Action::Describe,
            Action::VisbandsChanged,
            Action::Refresh,
            Action::OptionsPrint,
            Action::TvChannels,
            Action::TsysCorr,
            Action::OptionsChanged,
            Action::Username,
            Action::UnknownCommand,
            Action::Quit,
        ]
    );
}

#[test]
fn test_startup_requests() {
    let mut session = ViewerSession::new(ID.to_string()).with_username("observer");
    session.start();
    assert_eq!(
        requests(&mut session),
        vec![
            Request::ServerType,
            Request::Username("observer".to_string()),
            Request::CurrentVisData
        ]
    );
    assert_eq!(
        ViewerSession::new(ID.to_string())
            .with_username("two words")
            .username(),
        None
    );
}

#[test]
fn test_pending_actions_run_in_order() {
    let (mut session, mut recorder) = session_with_data(&SyntheticArchive::new());
    session.handle_line("print");
    session.handle_line("frobnicate");
    session.handle_line("describe");
    session.process_pending(&mut recorder).unwrap();
    let status = session.take_status();
    assert!(status[0].starts_with("1934-638"), "{status:?}");
    let options = status
        .iter()
        .position(|l| l.starts_with("phase units"))
        .unwrap();
    assert!(options > 0);
    assert_eq!(status.last().unwrap(), "unknown command 'frobnicate'");
    assert!(session.pending().is_empty());
}

#[test]
fn test_new_data_is_drawn() {
    let (mut session, mut recorder) = session_with_data(&SyntheticArchive::new());
    let titles: Vec<&str> = recorder.panels.iter().map(|(t, _)| t.as_str()).collect();
    assert_eq!(titles, vec!["amplitude", "phase", "delay"]);
    // 15 cross baselines, 2 IFs, 2 pols.
    assert_eq!(recorder.panels[0].1.len(), 60);
    assert!(recorder.panels[0].1.iter().all(|s| s.points.len() == 3));

    recorder.panels.clear();
    session.handle_line("array 1,2,3");
    session.handle_line("select xx f1 amp");
    session.process_pending(&mut recorder).unwrap();
    assert_eq!(recorder.panels.len(), 1);
    let labels: Vec<&str> = recorder.panels[0]
        .1
        .iter()
        .map(|s| s.label.as_str())
        .collect();
    assert_eq!(labels.len(), 3);
    assert!(labels.iter().all(|l| l.ends_with("f1 AA")));

    // Nothing about the display goes to the server.
    assert!(session.take_requests().is_empty());

    session.handle_line("select f9");
    assert_eq!(session.take_status(), vec!["select: nothing called 'f9'"]);
}

#[test]
fn test_closure_phases_follow_the_reference_antenna() {
    let archive = SyntheticArchive::new().with_phases(&[0.0, 0.3, -0.2, 0.5, 1.0, -0.7]);
    let (mut session, mut recorder) = session_with_data(&archive);
    assert!(session.closure().is_none());

    recorder.panels.clear();
    session.handle_line("closure");
    session.process_pending(&mut recorder).unwrap();
    assert_eq!(session.closure().unwrap().refant, 1);
    let (title, series) = recorder.panels.last().unwrap();
    assert_eq!(title, "closure phase");
    // 10 triangles, 2 IFs, 2 pols.
    assert_eq!(series.len(), 40);
    for s in series {
        for &(_, phase) in &s.points {
            assert_abs_diff_eq!(phase, 0.0, epsilon = 1e-2);
        }
    }

    let before = session.closure().cloned();
    session.handle_line("refant 1");
    session.process_pending(&mut recorder).unwrap();
    assert_eq!(session.closure().cloned(), before);

    session.handle_line("refant 3");
    session.process_pending(&mut recorder).unwrap();
    assert_eq!(session.closure().unwrap().refant, 3);
    assert!(recorder.panels.last().unwrap().1[0].label.starts_with("3-"));
}

#[test]
fn test_closure_phases_are_recomputed_for_new_data() {
    let archive = SyntheticArchive::new();
    let (mut session, mut recorder) = session_with_data(&archive);
    session.handle_line("closure");
    session.process_pending(&mut recorder).unwrap();
    assert_eq!(session.closure().unwrap().values.len(), 3);

    // Closure panels are hidden when bigger data arrive.
    session.handle_line("select amp");
    session.process_pending(&mut recorder).unwrap();
    let bigger = SyntheticArchive::new().with_scans(&[("1934-638", 3), ("0823-500", 3)]);
    session.handle_response(reply(Response::CurrentVisData(vis_data(&bigger))));
    session.process_pending(&mut recorder).unwrap();
    assert_eq!(session.closure().unwrap().values.len(), 6);

    recorder.panels.clear();
    session.handle_line("select closure");
    session.process_pending(&mut recorder).unwrap();
    let (title, series) = recorder.panels.last().unwrap();
    assert_eq!(title, "closure phase");
    let mjds = bigger.cycle_mjds();
    assert_eq!(series.iter().map(|s| s.points.len()).max(), Some(6));
    for s in series {
        for (mjd, _) in &s.points {
            assert!(mjds.iter().any(|m| (m - mjd).abs() < 1e-9));
        }
    }
}

#[test]
fn test_selecting_closure_panels_computes_closure_phases() {
    let (mut session, mut recorder) = session_with_data(&SyntheticArchive::new());
    session.handle_line("select closure");
    session.process_pending(&mut recorder).unwrap();
    assert_eq!(session.closure().unwrap().refant, 1);
}

#[test]
fn test_username_is_asked_for_once_needed() {
    let (mut session, mut recorder) = session_with_data(&SyntheticArchive::new());
    session.handle_line("units radians");
    session.process_pending(&mut recorder).unwrap();
    assert_eq!(session.mode(), InputMode::Username { attempts: 0 });
    assert_eq!(session.prompt(), "username: ");
    assert!(session.take_requests().is_empty());

    session.handle_line("bad name");
    session.handle_line("");
    assert_eq!(session.mode(), InputMode::Username { attempts: 2 });

    session.handle_line(" observer ");
    assert_eq!(session.mode(), InputMode::Command);
    let sent = requests(&mut session);
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0], Request::Username("observer".to_string()));
    match &sent[1] {
        Request::ComputeVisData(OptionsSource::UseProvided(o)) => {
            assert_eq!(o.phase_units, PhaseUnits::Radians)
        }
        r => panic!("unexpected {r:?}"),
    }
}

#[test]
fn test_username_attempts_are_limited() {
    let (mut session, mut recorder) = session_with_data(&SyntheticArchive::new());
    session.handle_response(reply(Response::UsernameRequired));
    session.process_pending(&mut recorder).unwrap();
    session.take_status();
    for _ in 0..USERNAME_ATTEMPTS - 1 {
        session.handle_line("no good");
        assert!(matches!(session.mode(), InputMode::Username { .. }));
    }
    session.handle_line("still no good");
    assert_eq!(session.mode(), InputMode::Command);
    assert_eq!(
        session.take_status().last().unwrap(),
        "Too many attempts; the options were not changed"
    );
    assert!(session.take_requests().is_empty());
    assert_eq!(session.username(), None);
}

#[test]
fn test_quitting_while_asked_for_a_username() {
    let (mut session, mut recorder) = session_with_data(&SyntheticArchive::new());
    session.handle_line("units radians");
    session.process_pending(&mut recorder).unwrap();
    assert!(matches!(session.mode(), InputMode::Username { .. }));

    session.quit();
    session.process_pending(&mut recorder).unwrap();
    assert!(session.should_quit());
    assert_eq!(session.username(), None);
    assert!(session.take_requests().is_empty());
}

#[test]
fn test_refused_options_are_rolled_back() {
    let (mut session, mut recorder) = session_with_data(&SyntheticArchive::new());
    session.handle_line("units radians");
    session.process_pending(&mut recorder).unwrap();
    session.handle_line("observer");
    assert_eq!(requests(&mut session).len(), 2);
    assert_eq!(session.options().phase_units, PhaseUnits::Radians);

    session.handle_response(reply(Response::NoData));
    assert_eq!(
        session.take_status().last().unwrap(),
        "The server didn't accept the options"
    );
    assert_eq!(session.options().phase_units, PhaseUnits::Degrees);

    // Later, it's only a missing spectrum.
    session.handle_response(reply(Response::NoData));
    assert_eq!(session.take_status().last().unwrap(), "No data at that time");
}

#[test]
fn test_notifications() {
    let (mut session, mut recorder) = session_with_data(&SyntheticArchive::new());

    // Someone else's reply.
    session.handle_response(ResponseMessage {
        client_id: "someone00000000000000".to_string(),
        response: Response::Shutdown,
    });
    session.process_pending(&mut recorder).unwrap();
    assert!(!session.should_quit());

    session.handle_response(reply(Response::OptionsChanged {
        author: "observer".to_string(),
    }));
    session.process_pending(&mut recorder).unwrap();
    assert_eq!(session.take_status(), vec!["observer changed the options"]);
    assert_eq!(
        requests(&mut session),
        vec![Request::ComputeVisData(OptionsSource::UseAuthoritative)]
    );

    session.handle_response(reply(Response::VisDataComputed));
    assert_eq!(requests(&mut session), vec![Request::ComputedVisData]);

    session.handle_response(reply(Response::NoData));
    assert_eq!(session.take_status(), vec!["No data at that time"]);

    session.handle_line("spec 60000.5");
    assert_eq!(
        requests(&mut session),
        vec![Request::SpectrumAt { mjd: 60000.5 }]
    );

    session.handle_response(ResponseMessage {
        client_id: String::new(),
        response: Response::Shutdown,
    });
    session.process_pending(&mut recorder).unwrap();
    assert!(session.should_quit());
}

#[test]
fn test_option_edits_go_out_once() {
    let archive = SyntheticArchive::new();
    let (session, mut recorder) = session_with_data(&archive);
    let mut session = ViewerSession {
        username: Some("observer".to_string()),
        ..session
    };
    session.handle_line("tvchannel f1 3 12");
    session.handle_line("tsys computed");
    session.handle_line("average f2 median vector");
    session.process_pending(&mut recorder).unwrap();
    let sent = requests(&mut session);
    assert_eq!(sent.len(), 1);
    match &sent[0] {
        Request::ComputeVisData(OptionsSource::UseProvided(o)) => {
            assert_eq!(o.tsys_mode, crate::options::TsysMode::Computed);
            let f1 = &o.windows[0];
            assert_eq!((f1.min_tvchannel, f1.max_tvchannel), (3, 12));
            assert_eq!(
                o.windows[1].averaging.statistic,
                crate::options::Statistic::Median
            );
        }
        r => panic!("unexpected {r:?}"),
    }

    session.handle_line("tvchannel f1 3 99");
    assert_eq!(session.take_status(), vec!["f1 only has 16 channels"]);
    session.handle_line("delavg q7 2");
    assert_eq!(session.take_status(), vec!["No IF called 'q7'"]);
}

#[test]
fn test_delay_calibration() {
    let archive = SyntheticArchive::new().with_delays(&[0.0, 0.5, -0.3, 1.2, 0.8, -1.0]);
    let (session, mut recorder) = session_with_data(&archive);
    let mut session = ViewerSession {
        username: Some("observer".to_string()),
        ..session
    };
    session.handle_line("dcal");
    session.process_pending(&mut recorder).unwrap();
    let sent = requests(&mut session);
    match &sent[..] {
        [Request::ComputeVisData(OptionsSource::UseProvided(o))] => {
            // 5 antennas, 2 feeds, 2 bands.
            assert_eq!(o.delay_modifiers.len(), 20);
        }
        r => panic!("unexpected {r:?}"),
    }

    session.handle_line("nncal 4");
    session.handle_line("dcal after");
    session.process_pending(&mut recorder).unwrap();
    assert_eq!(
        session.take_status().last().unwrap(),
        "need 4 consecutive cycles, found 3"
    );
}

#[test]
fn test_dump_command() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("panels.csv");
    let (session, mut recorder) = session_with_data(&SyntheticArchive::new());
    let mut session = session.with_dump_format(DumpFormat::Csv);
    recorder.panels.clear();
    session.handle_line(&format!("dump {}", path.display()));
    session.process_pending(&mut recorder).unwrap();
    // The dump replaces the live display for this refresh.
    assert!(recorder.panels.is_empty());
    let text = std::fs::read_to_string(&path).unwrap();
    // 3 panels of 60 series of 3 points.
    assert_eq!(text.lines().count(), 3 * 60 * 3);
    assert!(text.lines().next().unwrap().starts_with("amplitude,"));
}

#[test]
fn test_dump_files_can_be_viewed() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("vis.dump");
    let vis = vis_data(&SyntheticArchive::new());
    crate::codec::write_dump(&path, &Dump::Vis((*vis).clone())).unwrap();

    let mut session = ViewerSession::new(ID.to_string());
    session.load_dump(&path).unwrap();
    assert_eq!(session.data().unwrap().num_cycles(), 3);
    assert_eq!(session.pending().iter().next(), Some(&Action::NewData));
}

//! Viewers and the session hub talking through the wire codec.

use std::io;

use tempfile::TempDir;

use atvis::{
    codec::{
        decode_from_slice, encode_to_vec, frame, read_frame, Decode, Encode, RequestMessage,
        ResponseMessage,
    },
    generate_client_id,
    options::PhaseUnits,
    read::synthetic::SyntheticArchive,
    server::{ConnectionId, SessionHub},
    viewer::{
        panels::{AxisRanges, Decorations, Renderer, Series},
        ViewerSession,
    },
    ServerType,
};

struct Blind;

impl Renderer for Blind {
    fn render(&mut self, _: &[Series], _: &AxisRanges, _: &Decorations) -> io::Result<()> {
        Ok(())
    }
}

/// Encode, frame, unframe and decode.
fn over_the_wire<T: Encode + Decode>(message: &T) -> T {
    let bytes = frame(&encode_to_vec(message).unwrap()).unwrap();
    let payload = read_frame(&mut bytes.as_slice()).unwrap().unwrap();
    decode_from_slice(&payload).unwrap()
}

struct Harness {
    _dir: TempDir,
    hub: SessionHub,
    viewers: Vec<(ConnectionId, ViewerSession)>,
}

impl Harness {
    fn new() -> Harness {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("obs.arc");
        SyntheticArchive::new()
            .with_scans(&[
                ("1934-638", 2),
                ("0823-500", 2),
                ("1934-638", 2),
                ("1921-293", 2),
                ("1934-638", 2),
            ])
            .with_delays(&[0.0, 0.4, -0.6, 0.9, 0.2, -1.1])
            .write_to(&path)
            .unwrap();
        let hub = SessionHub::new(vec![path], ServerType::Simulator, None).unwrap();
        Harness {
            _dir: dir,
            hub,
            viewers: vec![],
        }
    }

    fn join(&mut self, username: Option<&str>) -> usize {
        let mut viewer = ViewerSession::new(generate_client_id());
        if let Some(name) = username {
            viewer = viewer.with_username(name);
        }
        viewer.start();
        let conn = self.hub.connect();
        self.viewers.push((conn, viewer));
        self.pump();
        self.viewers.len() - 1
    }

    fn viewer(&mut self, i: usize) -> &mut ViewerSession {
        &mut self.viewers[i].1
    }

    /// Move messages until everyone is quiet.
    fn pump(&mut self) {
        loop {
            let mut moved = false;
            for i in 0..self.viewers.len() {
                let (conn, viewer) = &mut self.viewers[i];
                let conn = *conn;
                viewer.process_pending(&mut Blind).unwrap();
                let requests: Vec<RequestMessage> = viewer.take_requests();
                for request in requests {
                    moved = true;
                    let out = self.hub.handle(conn, over_the_wire(&request)).unwrap();
                    for o in out {
                        let response: ResponseMessage = over_the_wire(&o.message);
                        if let Some((_, v)) = self.viewers.iter_mut().find(|(c, _)| *c == o.to) {
                            v.handle_response(response);
                        }
                    }
                }
            }
            if !moved {
                break;
            }
        }
    }
}

#[test]
fn test_two_viewers_share_options_but_not_displays() {
    let mut h = Harness::new();
    let a = h.join(Some("alice"));
    let b = h.join(None);

    for i in [a, b] {
        let v = h.viewer(i);
        assert_eq!(v.server_type(), Some(ServerType::Simulator));
        assert_eq!(v.data().unwrap().num_cycles(), 10);
        assert_eq!(v.data().unwrap().headers.len(), 5);
    }

    // Display changes stay with the viewer that made them.
    h.viewer(a).handle_line("array 1,2,3");
    h.viewer(a).handle_line("select xx f2");
    h.viewer(a).handle_line("history 5");
    h.pump();
    assert_eq!(h.hub.generation(), 0);
    assert_eq!(h.viewer(a).display().antennas.len(), 3);
    assert_eq!(h.viewer(b).display().antennas.len(), 6);
    assert_eq!(h.viewer(b).display().visbands, Vec::<String>::new());
    h.viewer(b).take_status();

    // Options changes go to everyone.
    h.viewer(a).handle_line("tvchannel f1 2 9");
    h.pump();
    assert_eq!(h.hub.generation(), 1);
    assert_eq!(h.hub.author(), Some("alice"));
    let status = h.viewer(b).take_status();
    assert!(status.contains(&"alice changed the options".to_string()), "{status:?}");
    let authoritative = (**h.hub.authoritative_options()).clone();
    for i in [a, b] {
        let v = h.viewer(i);
        assert_eq!(v.options(), &authoritative);
        let w = &v.data().unwrap().options.windows[0];
        assert_eq!((w.min_tvchannel, w.max_tvchannel), (2, 9));
    }
    assert_eq!(h.viewer(b).display().antennas.len(), 6);
}

#[test]
fn test_third_parties_adopt_options_without_resending_them() {
    let mut h = Harness::new();
    let a = h.join(Some("alice"));
    let b = h.join(Some("bob"));
    let c = h.join(None);

    h.viewer(a).handle_line("units radians");
    h.viewer(a).handle_line("flagging include");
    h.pump();

    // Only alice's upload changed anything.
    assert_eq!(h.hub.generation(), 1);
    assert_eq!(h.hub.author(), Some("alice"));
    let sent = h.viewer(a).options().clone();
    assert_eq!(sent.phase_units, PhaseUnits::Radians);
    assert!(sent.include_flagged);
    for i in [b, c] {
        assert_eq!(h.viewer(i).options(), &sent);
        assert_eq!(
            h.viewer(i).data().unwrap().options.phase_units,
            PhaseUnits::Radians
        );
    }
}

#[test]
fn test_delay_calibration_round_trip() {
    let mut h = Harness::new();
    let a = h.join(Some("alice"));
    let b = h.join(None);

    let worst = |v: &ViewerSession| {
        let data = v.data().unwrap();
        let last = data.num_cycles() - 1;
        data.cycles[last]
            .windows
            .iter()
            .flatten()
            .flat_map(|vq| vq.baselines.iter())
            .flat_map(|bl| bl.bins.iter())
            .map(|bin| bin.delay.abs())
            .fold(0.0_f32, f32::max)
    };
    assert!(worst(h.viewer(b)) > 1.0);

    // The last 2 cycles are one scan; a third would reach over a scan gap.
    h.viewer(a).handle_line("nncal 3");
    h.viewer(a).handle_line("dcal");
    h.pump();
    assert_eq!(
        h.viewer(a).take_status().last().unwrap(),
        "need 3 consecutive cycles, found 2"
    );
    assert_eq!(h.hub.generation(), 0);

    h.viewer(a).handle_line("nncal 2");
    h.viewer(a).handle_line("dcal");
    h.pump();
    assert_eq!(h.hub.generation(), 1);
    assert_eq!(h.viewer(b).options().delay_modifiers.len(), 20);
    assert!(worst(h.viewer(b)) < 0.05, "{}", worst(h.viewer(b)));
}

#[test]
fn test_shutdown_reaches_every_viewer() {
    let mut h = Harness::new();
    let a = h.join(None);
    let b = h.join(None);
    for o in h.hub.shutdown() {
        let response: ResponseMessage = over_the_wire(&o.message);
        if let Some((_, v)) = h.viewers.iter_mut().find(|(c, _)| *c == o.to) {
            v.handle_response(response);
        }
    }
    h.pump();
    assert!(h.viewer(a).should_quit());
    assert!(h.viewer(b).should_quit());
}

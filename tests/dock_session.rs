//! Full Dock sessions over the MNP link: handshake, password
//! exchange, browsing and package install, driven byte-for-byte
//! through the bridge graph.

mod common;

use common::*;
use crabdock::newton::des;
use crabdock::newton::nsof::{self, NsArena, NsRef};

/// Split a reassembled Dock byte stream into (verb, payload) pairs.
fn parse_dock_cmds(stream: &[u8]) -> Vec<([u8; 4], Vec<u8>)> {
    let mut commands = Vec::new();
    let mut pos = 0;
    while pos < stream.len() {
        assert!(
            pos + 16 <= stream.len(),
            "truncated dock command at {pos} of {}",
            stream.len()
        );
        assert_eq!(&stream[pos..pos + 8], b"newtdock", "bad magic at {pos}");
        let verb: [u8; 4] = stream[pos + 8..pos + 12].try_into().unwrap();
        let len =
            u32::from_be_bytes(stream[pos + 12..pos + 16].try_into().unwrap()) as usize;
        let aligned = (len + 3) & !3;
        let payload = stream[pos + 16..pos + 16 + len].to_vec();
        commands.push((verb, payload));
        pos += 16 + aligned;
    }
    commands
}

struct Session {
    h: Harness,
    seq: u8,
}

impl Session {
    fn new(sd: FakeSd) -> Session {
        let mut h = Harness::with_sd(sd, 1000);
        h.connect();
        Session { h, seq: 0 }
    }

    /// Send one Dock command in an LT frame and return the dongle's
    /// replies as parsed Dock commands.
    fn exchange(&mut self, verb: &[u8; 4], payload: &[u8]) -> Vec<([u8; 4], Vec<u8>)> {
        self.seq = self.seq.wrapping_add(1);
        self.h
            .feed_uart(&lt_frame(self.seq, &dock_cmd(verb, payload)));
        let frames = self.h.drive();
        parse_dock_cmds(&Harness::dock_stream(&frames))
    }

    fn encode_nsof(value: impl FnOnce(&mut NsArena) -> NsRef) -> Vec<u8> {
        let mut arena = NsArena::new();
        let root = value(&mut arena);
        let mut out = Vec::new();
        nsof::encode(&arena, root, &mut out);
        out
    }
}

#[test]
fn docking_handshake() {
    let mut s = Session::new(FakeSd::new());

    // rtdk: the dongle initiates the session setup.
    let replies = s.exchange(b"rtdk", &[0, 0, 0, 9]);
    assert_eq!(replies, vec![(*b"dock", vec![0, 0, 0, 1])]);

    // name: desktop info with protocol version 10 and our challenge.
    let replies = s.exchange(b"name", &[0; 16]);
    assert_eq!(replies.len(), 1);
    let (verb, dinf) = &replies[0];
    assert_eq!(verb, b"dinf");
    assert_eq!(&dinf[0..4], &[0, 0, 0, 10]);
    assert_eq!(&dinf[4..8], &[0, 0, 0, 0]);
    let challenge = &dinf[8..16];
    assert_eq!(challenge, &[0x5F, 0xFE, 0xF6, 0x6A, 0x5B, 0xE3, 0xDA, 0x62]);
    assert_eq!(&dinf[16..20], &[0, 0, 0, 1]);
    // The tail is one NSOF array describing the desktop application.
    let mut arena = NsArena::new();
    let apps = nsof::decode(&mut arena, &dinf[24..]).expect("dinf NSOF does not parse");
    assert_eq!(arena.as_array(apps).map(|a| a.len()), Some(1));

    // ninf: carries the handheld's challenge; which-icons follows.
    let mut ninf = vec![0, 0, 0, 10];
    ninf.extend_from_slice(&[0x01, 0x23, 0x45, 0x67, 0x89, 0xAB, 0xCD, 0xEF]);
    let replies = s.exchange(b"ninf", &ninf);
    assert_eq!(replies, vec![(*b"wicn", vec![0, 0, 0, 4])]);

    // dres 0 confirms; the session timeout goes out.
    let replies = s.exchange(b"dres", &[0, 0, 0, 0]);
    assert_eq!(replies, vec![(*b"stim", vec![0, 0, 0, 90])]);

    // pass: our response must be the challenge encrypted with the
    // empty-password key.
    let replies = s.exchange(b"pass", &[0; 8]);
    assert_eq!(replies.len(), 1);
    assert_eq!(&replies[0].0, b"pass");
    let expected = des::encode_nonce(
        des::key_from_password(&[]),
        (0x0123_4567, 0x89AB_CDEF),
    );
    let mut expected_bytes = Vec::new();
    expected_bytes.extend_from_slice(&expected.0.to_be_bytes());
    expected_bytes.extend_from_slice(&expected.1.to_be_bytes());
    assert_eq!(replies[0].1, expected_bytes);
}

#[test]
fn browse_and_listings() {
    let mut sd = FakeSd::with_package("hello.pkg", vec![0xA5; 16]);
    sd.entries.push(crabdock::endpoints::sdcard::DirEntry {
        name: "Backups".into(),
        attr: crabdock::endpoints::sdcard::EntryAttr::DIRECTORY,
    });
    sd.entries.push(crabdock::endpoints::sdcard::DirEntry {
        name: "notes.txt".into(),
        attr: crabdock::endpoints::sdcard::EntryAttr::empty(),
    });
    sd.entries.push(crabdock::endpoints::sdcard::DirEntry {
        name: "secret.pkg".into(),
        attr: crabdock::endpoints::sdcard::EntryAttr::HIDDEN,
    });
    let mut s = Session::new(sd);

    // request-to-browse is simply confirmed.
    let replies = s.exchange(b"rtbr", &[0, 0, 0, 4]);
    assert_eq!(replies, vec![(*b"dres", vec![0, 0, 0, 0])]);

    // Default path: desktop root plus the card, by its label.
    let replies = s.exchange(b"dpth", &[]);
    assert_eq!(replies.len(), 1);
    assert_eq!(&replies[0].0, b"path");
    let mut arena = NsArena::new();
    let path = nsof::decode(&mut arena, &replies[0].1).expect("path NSOF does not parse");
    let elements = arena.as_array(path).unwrap().to_vec();
    assert_eq!(elements.len(), 2);

    // At the desktop root the file listing is the disk itself.
    let replies = s.exchange(b"gfil", &[]);
    assert_eq!(&replies[0].0, b"file");
    let mut arena = NsArena::new();
    let list = nsof::decode(&mut arena, &replies[0].1).unwrap();
    assert_eq!(arena.as_array(list).map(|a| a.len()), Some(1));

    // Stepping into the card: folders and packages are listed, plain
    // and hidden files are not.
    let spth = Session::encode_nsof(|arena| {
        let desktop = arena.string("CrabDock");
        let disk = arena.string("TESTCARD");
        let id = arena.array(vec![NsRef::Obj(desktop), NsRef::Obj(disk)]);
        NsRef::Obj(id)
    });
    let replies = s.exchange(b"spth", &spth);
    assert_eq!(&replies[0].0, b"file");
    let mut arena = NsArena::new();
    let list = nsof::decode(&mut arena, &replies[0].1).unwrap();
    let entries = arena.as_array(list).unwrap();
    assert_eq!(entries.len(), 2, "expected the folder and the package");
    assert_eq!(s.h.sd.borrow().chdirs, ["/"]);

    // File info for the package.
    let gfin = Session::encode_nsof(|arena| {
        let name = arena.string("hello.pkg");
        NsRef::Obj(name)
    });
    let replies = s.exchange(b"gfin", &gfin);
    assert_eq!(&replies[0].0, b"finf");
    let mut arena = NsArena::new();
    assert!(nsof::decode(&mut arena, &replies[0].1).is_ok());
}

/// Package download: `lpkg` whose length is the file size, the
/// contents in one 512-byte chunk, and silence afterwards.
#[test]
fn package_download() {
    let contents: Vec<u8> = (0..512u32).map(|i| (i * 7) as u8).collect();
    let mut s = Session::new(FakeSd::with_package("hello.pkg", contents.clone()));

    let lpfl = Session::encode_nsof(|arena| {
        let name = arena.string("hello.pkg");
        NsRef::Obj(name)
    });
    let replies = s.exchange(b"lpfl", &lpfl);
    assert_eq!(replies.len(), 1);
    let (verb, payload) = &replies[0];
    assert_eq!(verb, b"lpkg");
    assert_eq!(payload.len(), 512);
    assert_eq!(payload, &contents);

    // No further outbound traffic until the peer speaks again.
    let frames = s.h.drive();
    assert!(frames.is_empty());
}

#[test]
fn missing_package_reports_file_not_found() {
    let mut s = Session::new(FakeSd::new());
    let lpfl = Session::encode_nsof(|arena| {
        let name = arena.string("nothing.pkg");
        NsRef::Obj(name)
    });
    let replies = s.exchange(b"lpfl", &lpfl);
    assert_eq!(
        replies,
        vec![(*b"dres", (-48403i32).to_be_bytes().to_vec())]
    );
}

#[test]
fn cancel_empties_the_outbound_queue() {
    // Big enough that the transfer is still running when the cancel
    // arrives.
    let contents = vec![0x5A; 8192];
    let mut s = Session::new(FakeSd::with_package("big.pkg", contents));

    let lpfl = Session::encode_nsof(|arena| {
        let name = arena.string("big.pkg");
        NsRef::Obj(name)
    });
    s.seq = s.seq.wrapping_add(1);
    let seq = s.seq;
    s.h.feed_uart(&lt_frame(seq, &dock_cmd(b"lpfl", &lpfl)));
    // Let the transfer get going, without acknowledging anything: the
    // stop-and-wait window and the frame pool throttle it long before
    // 8 KiB are out.
    s.h.run(60);

    // Cancel. The reply stream still carries residue of the aborted
    // transfer, so scan for the acknowledgement rather than parse.
    s.seq = s.seq.wrapping_add(1);
    let seq = s.seq;
    s.h.feed_uart(&lt_frame(seq, &dock_cmd(b"opcn", &[])));
    let frames = s.h.drive();
    let stream = Harness::dock_stream(&frames);
    assert!(
        stream.windows(12).any(|w| w == b"newtdockocaa"),
        "no ocaa after opcn"
    );
    // Far less than the whole package went out.
    assert!(stream.len() < 4096, "transfer was not cancelled");

    // The session is still alive: a listing works afterwards.
    let replies = s.exchange(b"gfil", &[]);
    assert_eq!(&replies[0].0, b"file");
}

#[test]
fn unknown_verbs_get_a_result_code() {
    let mut s = Session::new(FakeSd::new());
    let replies = s.exchange(b"zzzz", &[]);
    assert_eq!(
        replies,
        vec![(*b"dres", (-48404i32).to_be_bytes().to_vec())]
    );
}

/// The keep-alive and cancel-request commands the firmware itself can
/// originate.
#[test]
fn locally_originated_commands_go_out() {
    let mut s = Session::new(FakeSd::new());
    s.h.bridge.dock.borrow_mut().send_helo();
    s.h.bridge.dock.borrow_mut().send_opca();
    let frames = s.h.drive();
    let commands = parse_dock_cmds(&Harness::dock_stream(&frames));
    assert_eq!(
        commands,
        vec![(*b"helo", vec![]), (*b"opca", vec![])]
    );
}

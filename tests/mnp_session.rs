//! MNP link-layer scenarios, driven through the full bridge graph:
//! negotiation, in-sequence delivery, CRC rejection, duplicate
//! handling and loss recovery.

mod common;

use common::*;
use crabdock::filters::mnp::SessionState;

/// Fresh LR: negotiation starts, the fixed LR reply goes out, and the
/// peer's LA completes the connection.
#[test]
fn lr_negotiation_reaches_connected() {
    let mut h = Harness::new(1000);

    h.feed_uart(&newton_lr());
    let frames = h.drive();
    let reply = frames
        .iter()
        .find(|f| f.frame_type() == 1)
        .expect("no LR reply");
    assert_eq!(
        reply.header,
        [
            0x01, 0x02, 0x01, 0x06, 0x01, 0x00, 0x00, 0x00, 0x00, 0xFF, 0x02, 0x01, 0x02, 0x03,
            0x01, 0x01, 0x04, 0x02, 0x40, 0x00, 0x08, 0x01, 0x03
        ]
    );
    assert_eq!(h.bridge.mnp.borrow().state(), SessionState::Negotiating);

    h.feed_uart(&la_frame(0));
    h.drive();
    assert_eq!(h.bridge.mnp.borrow().state(), SessionState::Connected);
    assert!(h.bridge.dock.borrow().is_connected());
}

/// LT seq 1 with the escaped payload {0x10} is delivered and the LA
/// acknowledges sequence 1.
#[test]
fn in_sequence_lt_is_acked() {
    let mut h = Harness::new(1000);
    h.connect();

    h.feed_uart(&lt_frame(1, &[0x10]));
    let frames = h.drive();
    let la = frames
        .iter()
        .find(|f| f.frame_type() == LA)
        .expect("no LA for the LT");
    assert_eq!(la.header, [LA, 1, 1]);
}

/// A corrupted frame is silently dropped: no LA, no state change, and
/// the retransmitted original is still accepted.
#[test]
fn crc_failure_is_silent() {
    let mut h = Harness::new(1000);
    h.connect();

    let mut wire = lt_frame(1, &[0x41, 0x42]);
    let last = wire.len() - 1;
    wire[last] ^= 0xFF;
    h.feed_uart(&wire);
    let frames = h.drive();
    assert!(frames.is_empty(), "unexpected reply to a bad frame");
    assert_eq!(h.bridge.mnp.borrow().state(), SessionState::Connected);

    // The peer retransmits; now it goes through.
    h.feed_uart(&lt_frame(1, &[0x41, 0x42]));
    let frames = h.drive();
    assert!(frames.iter().any(|f| f.header == [LA, 1, 1]));
}

/// An out-of-sequence LT is not delivered; the LA repeats the last
/// good sequence number so the peer knows where to resume.
#[test]
fn out_of_sequence_lt_reacks_last_good() {
    let mut h = Harness::new(1000);
    h.connect();

    h.feed_uart(&lt_frame(1, b"one!"));
    h.drive();

    // Sequence 3 skips 2.
    h.feed_uart(&lt_frame(3, b"three"));
    let frames = h.drive();
    let la = frames
        .iter()
        .find(|f| f.frame_type() == LA)
        .expect("no LA for the out-of-sequence LT");
    assert_eq!(la.header, [LA, 1, 1], "must re-ack sequence 1");
}

/// LD tears the whole session down.
#[test]
fn ld_disconnects() {
    let mut h = Harness::new(1000);
    h.connect();

    h.feed_uart(&ld_frame());
    h.drive();
    assert_eq!(h.bridge.mnp.borrow().state(), SessionState::Disconnected);
    assert!(!h.bridge.dock.borrow().is_connected());
}

/// A new LR in the middle of a session restarts negotiation.
#[test]
fn lr_mid_session_renegotiates() {
    let mut h = Harness::new(1000);
    h.connect();

    h.feed_uart(&newton_lr());
    let frames = h.drive();
    assert!(frames.iter().any(|f| f.frame_type() == 1), "no LR reply");
    assert_eq!(h.bridge.mnp.borrow().state(), SessionState::Negotiating);
}

/// An unacknowledged LT is retransmitted after the timeout.
#[test]
fn unacked_lt_retransmits() {
    let mut h = Harness::new(1000);
    h.connect();

    // Trigger some outbound data: a Dock request produces a reply LT.
    h.feed_uart(&lt_frame(1, &dock_cmd(b"rtdk", &[0, 0, 0, 9])));

    // Collect frames but never acknowledge the LT.
    let mut lts = 0;
    for _ in 0..60 {
        h.run(40);
        for frame in h.harvest_frames() {
            if frame.frame_type() == LT {
                lts += 1;
            }
        }
    }
    assert!(lts >= 2, "LT was not retransmitted (saw {lts})");
}

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use ws_fabric_rs::session::state::{SessionEvent, SessionState, step};

#[test]
fn test_happy_path_client_lifecycle() {
    let mut st = SessionState::NotConnected;
    st = step(st, SessionEvent::ConnectStarted).unwrap();
    assert_eq!(st, SessionState::AwaitingConnect);
    st = step(st, SessionEvent::TcpEstablished).unwrap();
    assert_eq!(st, SessionState::Handshaking);
    st = step(st, SessionEvent::UpgradeAccepted).unwrap();
    assert_eq!(st, SessionState::Open);
    st = step(st, SessionEvent::CloseStarted).unwrap();
    assert_eq!(st, SessionState::Closing);
    st = step(st, SessionEvent::TransportClosed).unwrap();
    assert_eq!(st, SessionState::Closed);
}

#[test]
fn test_transport_loss_from_any_state() {
    for from in [
        SessionState::NotConnected,
        SessionState::AwaitingConnect,
        SessionState::Handshaking,
        SessionState::Open,
        SessionState::Closing,
        SessionState::Closed,
    ] {
        assert_eq!(
            step(from, SessionEvent::TransportClosed).unwrap(),
            SessionState::Closed
        );
    }
}

#[test]
fn test_local_close_racing_remote_close() {
    let st = step(SessionState::Closing, SessionEvent::CloseStarted).unwrap();
    assert_eq!(st, SessionState::Closing);
}

#[test]
fn test_illegal_transitions_rejected() {
    let illegal = [
        (SessionState::NotConnected, SessionEvent::UpgradeAccepted),
        (SessionState::NotConnected, SessionEvent::TcpEstablished),
        (SessionState::AwaitingConnect, SessionEvent::UpgradeAccepted),
        (SessionState::Handshaking, SessionEvent::ConnectStarted),
        (SessionState::Open, SessionEvent::UpgradeAccepted),
        (SessionState::Closed, SessionEvent::ConnectStarted),
        (SessionState::Closed, SessionEvent::CloseStarted),
    ];
    for (from, event) in illegal {
        let err = step(from, event).expect_err("transition must be rejected");
        assert_eq!(err.from, from);
        assert_eq!(err.event, event);
    }
}

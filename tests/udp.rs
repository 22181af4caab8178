mod common;

use std::cell::Cell;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Duration;

use common::*;
use mill_reactor::{
    AsyncSocketError, ConnectionError, Context, ErrorHandlingPolicy, EventLoop, Handler, Phase,
    ReactorConfig, UnbindReason,
};

/// Replies to every datagram with the same bytes and remembers who sent it.
struct Responder {
    log: EventLog,
    last_peer: Rc<Cell<Option<SocketAddr>>>,
}

impl Handler for Responder {
    fn receive_data(&mut self, ctx: &mut Context<'_>, data: &[u8]) {
        self.log.push(Event::Data(data.to_vec()));
        self.last_peer.set(ctx.peer_addr());
        ctx.send_data(data).unwrap();
    }
}

/// Stops the reactor on the first datagram it receives.
struct StopOnData {
    log: EventLog,
}

impl Handler for StopOnData {
    fn receive_data(&mut self, ctx: &mut Context<'_>, data: &[u8]) {
        self.log.push(Event::Data(data.to_vec()));
        ctx.stop();
    }

    fn receive_senderror(&mut self, _ctx: &mut Context<'_>, error: &AsyncSocketError) {
        self.log.push(Event::SendError(error.clone()));
    }

    fn unbind(&mut self, _ctx: &mut Context<'_>, reason: Option<&UnbindReason>) {
        self.log.push(Event::Unbind(reason.cloned()));
    }
}

fn datagram_round_trip(address: &str, payload: &[u8]) {
    init_test_logging();
    let mut event_loop = EventLoop::with_defaults().unwrap();
    let (initiator_log, responder_log) = (EventLog::default(), EventLog::default());
    let last_peer = Rc::new(Cell::new(None));
    let timed_out = Rc::new(Cell::new(false));

    let initiator_addr = event_loop
        .run(|reactor| {
            arm_guard(reactor, &timed_out);
            let responder = reactor
                .open_datagram_socket(
                    address,
                    0,
                    Responder {
                        log: responder_log.clone(),
                        last_peer: last_peer.clone(),
                    },
                )
                .unwrap();
            let port = reactor.local_addr(responder).unwrap().port();
            let initiator = reactor
                .open_datagram_socket(address, 0, StopOnData { log: initiator_log.clone() })
                .unwrap();
            reactor
                .send_datagram(initiator, payload, address, port)
                .unwrap();
            assert_eq!(reactor.outbound_len(initiator), payload.len());
            reactor.local_addr(initiator).unwrap()
        })
        .unwrap();

    assert!(!timed_out.get(), "datagram did not come back in time");
    assert_eq!(responder_log.events(), [Event::Data(payload.to_vec())]);
    assert_eq!(
        initiator_log.events(),
        [Event::Data(payload.to_vec()), Event::Unbind(None)]
    );
    assert_eq!(last_peer.get(), Some(initiator_addr));
}

#[test]
fn test_ipv6_datagram_round_trip() {
    if !ipv6_available() {
        eprintln!("skipping: no IPv6 loopback");
        return;
    }
    datagram_round_trip("::1", b"Hello IPv6 UDP!");
}

#[test]
fn test_ipv4_datagram_round_trip() {
    datagram_round_trip("127.0.0.1", b"Hello IPv4 UDP!");
}

#[test]
fn test_invalid_destination_fails_synchronously() {
    init_test_logging();
    let mut event_loop = EventLoop::with_defaults().unwrap();
    let log = EventLog::default();

    event_loop
        .run(|reactor| {
            let id = reactor
                .open_datagram_socket("127.0.0.1", 0, Recorder::new(&log))
                .unwrap();
            assert!(matches!(
                reactor.send_datagram(id, b"x", "1:A", 5555),
                Err(ConnectionError::InvalidAddress(_))
            ));
            assert!(matches!(
                reactor.send_datagram(id, b"x", "999.0.0.1", 5555),
                Err(ConnectionError::InvalidAddress(_))
            ));
            assert!(matches!(
                reactor.send_datagram(id, b"x", "ipv6.google.com", 5555),
                Err(ConnectionError::Unresolvable(_))
            ));
            assert!(matches!(
                reactor.send_data(id, b"no peer yet"),
                Err(ConnectionError::Unsupported { .. })
            ));
            assert_eq!(reactor.outbound_len(id), 0);
            assert_eq!(reactor.phase(id), Phase::Connected);

            let server = reactor.start_server("127.0.0.1", 0, || Echo).unwrap();
            assert!(matches!(
                reactor.send_datagram(server.id(), b"x", "127.0.0.1", 5555),
                Err(ConnectionError::Unsupported { .. })
            ));
            reactor.stop();
        })
        .unwrap();

    assert_eq!(log.events(), [Event::Unbind(None)]);
}

#[test]
fn test_hostname_datagram_socket_is_rejected() {
    let mut event_loop = EventLoop::with_defaults().unwrap();
    event_loop
        .run(|reactor| {
            let result = reactor.open_datagram_socket("localhost", 0, Recorder::new(&EventLog::default()));
            assert!(matches!(result, Err(ConnectionError::Unresolvable(_))));
            assert_eq!(reactor.connection_count(), 0);
        })
        .unwrap();
}

/// Reports async errors, checks the transient flag, then proves the socket still
/// works by sending a datagram to itself.
struct FlagWatcher {
    log: EventLog,
    flag_during_hook: Rc<Cell<Option<bool>>>,
    flag_later: Rc<Cell<Option<bool>>>,
}

impl Handler for FlagWatcher {
    fn receive_data(&mut self, ctx: &mut Context<'_>, data: &[u8]) {
        self.log.push(Event::Data(data.to_vec()));
        ctx.stop();
    }

    fn receive_senderror(&mut self, ctx: &mut Context<'_>, error: &AsyncSocketError) {
        self.log.push(Event::SendError(error.clone()));
        self.flag_during_hook.set(Some(ctx.is_error()));

        let id = ctx.id();
        let port = ctx.local_addr().map(|addr| addr.port()).unwrap();
        let flag_later = self.flag_later.clone();
        ctx.add_timer(Duration::from_millis(10), move |reactor| {
            flag_later.set(Some(reactor.is_error(id)));
            reactor
                .send_datagram(id, b"still alive", "127.0.0.1", port)
                .unwrap();
        });
    }

    fn unbind(&mut self, _ctx: &mut Context<'_>, reason: Option<&UnbindReason>) {
        self.log.push(Event::Unbind(reason.cloned()));
    }
}

#[test]
fn test_report_policy_delivers_error_and_keeps_socket() {
    init_test_logging();
    let mut event_loop = EventLoop::with_defaults().unwrap();
    let log = EventLog::default();
    let during = Rc::new(Cell::new(None));
    let later = Rc::new(Cell::new(None));
    let timed_out = Rc::new(Cell::new(false));

    event_loop
        .run(|reactor| {
            arm_guard(reactor, &timed_out);
            let id = reactor
                .open_datagram_socket(
                    "127.0.0.1",
                    0,
                    FlagWatcher {
                        log: log.clone(),
                        flag_during_hook: during.clone(),
                        flag_later: later.clone(),
                    },
                )
                .unwrap();
            reactor
                .set_send_error_handling(id, ErrorHandlingPolicy::Report)
                .unwrap();
            assert!(!reactor.is_error(id));
            // An IPv4 socket cannot reach an IPv6 destination.
            reactor.send_datagram(id, b"unreachable", "::1", 5555).unwrap();
        })
        .unwrap();

    assert!(!timed_out.get());
    let errors = log.send_errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].destination(), Some(("::1", "5555")));
    assert!(errors[0].code().is_some());
    assert_eq!(during.get(), Some(true));
    assert_eq!(later.get(), Some(false));
    assert_eq!(
        log.events()[1..],
        [Event::Data(b"still alive".to_vec()), Event::Unbind(None)]
    );
}

#[test]
fn test_drop_policy_unbinds_with_send_failure() {
    init_test_logging();
    let mut event_loop = EventLoop::with_defaults().unwrap();
    let log = EventLog::default();
    let timed_out = Rc::new(Cell::new(false));

    event_loop
        .run(|reactor| {
            arm_guard(reactor, &timed_out);
            let id = reactor
                .open_datagram_socket("127.0.0.1", 0, Recorder::stopping(&log))
                .unwrap();
            assert_eq!(reactor.send_error_handling(id), Some(ErrorHandlingPolicy::Drop));
            reactor.send_datagram(id, b"unreachable", "::1", 5555).unwrap();
        })
        .unwrap();

    assert!(!timed_out.get());
    assert!(log.send_errors().is_empty());
    let unbinds = log.unbinds();
    assert_eq!(unbinds.len(), 1);
    match &unbinds[0] {
        Some(UnbindReason::SendFailed(error)) => {
            assert_eq!(error.destination(), Some(("::1", "5555")));
        }
        other => panic!("unexpected unbind reason {other:?}"),
    }
}

#[test]
fn test_ignore_policy_discards_errors() {
    init_test_logging();
    let config = ReactorConfig::builder()
        .send_error_handling(ErrorHandlingPolicy::Ignore)
        .build();
    let mut event_loop = EventLoop::new(config).unwrap();
    let log = EventLog::default();
    let flagged = Rc::new(Cell::new(false));
    let timed_out = Rc::new(Cell::new(false));

    event_loop
        .run(|reactor| {
            arm_guard(reactor, &timed_out);
            let id = reactor
                .open_datagram_socket("127.0.0.1", 0, StopOnData { log: log.clone() })
                .unwrap();
            let port = reactor.local_addr(id).unwrap().port();
            reactor.send_datagram(id, b"unreachable", "::1", 5555).unwrap();
            let seen = flagged.clone();
            reactor.add_timer(Duration::from_millis(20), move |reactor| {
                seen.set(reactor.is_error(id));
                reactor
                    .send_datagram(id, b"after ignore", "127.0.0.1", port)
                    .unwrap();
            });
        })
        .unwrap();

    assert!(!timed_out.get());
    assert!(!flagged.get());
    assert_eq!(
        log.events(),
        [Event::Data(b"after ignore".to_vec()), Event::Unbind(None)]
    );
}

/// Switches from reporting to dropping after the first error.
struct Escalate {
    log: EventLog,
}

impl Handler for Escalate {
    fn receive_senderror(&mut self, ctx: &mut Context<'_>, error: &AsyncSocketError) {
        self.log.push(Event::SendError(error.clone()));
        ctx.set_send_error_handling(ErrorHandlingPolicy::Drop).unwrap();
        ctx.send_datagram(b"again", "::1", 6666).unwrap();
    }

    fn unbind(&mut self, ctx: &mut Context<'_>, reason: Option<&UnbindReason>) {
        self.log.push(Event::Unbind(reason.cloned()));
        ctx.stop();
    }
}

#[test]
fn test_policy_change_applies_to_next_error() {
    init_test_logging();
    let config = ReactorConfig::builder()
        .send_error_handling(ErrorHandlingPolicy::Report)
        .build();
    let mut event_loop = EventLoop::new(config).unwrap();
    let log = EventLog::default();
    let timed_out = Rc::new(Cell::new(false));

    event_loop
        .run(|reactor| {
            arm_guard(reactor, &timed_out);
            let id = reactor
                .open_datagram_socket("127.0.0.1", 0, Escalate { log: log.clone() })
                .unwrap();
            reactor.send_datagram(id, b"first", "::1", 5555).unwrap();
        })
        .unwrap();

    assert!(!timed_out.get());
    let events = log.events();
    assert_eq!(events.len(), 2);
    assert!(matches!(&events[0], Event::SendError(e) if e.destination() == Some(("::1", "5555"))));
    assert!(matches!(
        &events[1],
        Event::Unbind(Some(UnbindReason::SendFailed(e))) if e.destination() == Some(("::1", "6666"))
    ));
}

#[test]
fn test_unroutable_destination_never_tears_down_reporting_socket() {
    init_test_logging();
    let mut event_loop = EventLoop::with_defaults().unwrap();
    let log = EventLog::default();

    event_loop
        .run(|reactor| {
            let id = reactor
                .open_datagram_socket("127.0.0.1", 0, Recorder::new(&log))
                .unwrap();
            reactor
                .set_send_error_handling(id, ErrorHandlingPolicy::Report)
                .unwrap();
            reactor.send_datagram(id, b"void", "241.4.5.6", 5555).unwrap();
            reactor.add_timer(Duration::from_millis(200), |reactor| reactor.stop());
        })
        .unwrap();

    // Whether the OS rejects the send depends on the host's routes.
    for error in log.send_errors() {
        assert_eq!(error.destination(), Some(("241.4.5.6", "5555")));
    }
    assert_eq!(log.unbinds(), [None]);
}

/// Stops the reactor on the first reported send error.
#[cfg(target_os = "linux")]
struct StopOnSendError {
    log: EventLog,
    flagged: Rc<Cell<bool>>,
}

#[cfg(target_os = "linux")]
impl Handler for StopOnSendError {
    fn receive_senderror(&mut self, ctx: &mut Context<'_>, error: &AsyncSocketError) {
        self.log.push(Event::SendError(error.clone()));
        self.flagged.set(ctx.is_error());
        ctx.stop();
    }

    fn unbind(&mut self, _ctx: &mut Context<'_>, reason: Option<&UnbindReason>) {
        self.log.push(Event::Unbind(reason.cloned()));
    }
}

#[cfg(target_os = "linux")]
#[test]
fn test_port_unreachable_arrives_later_and_is_reported() {
    init_test_logging();
    let mut event_loop = EventLoop::with_defaults().unwrap();
    let log = EventLog::default();
    let flagged = Rc::new(Cell::new(false));
    let timed_out = Rc::new(Cell::new(false));
    let closed_port = {
        let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.local_addr().unwrap().port()
    };

    event_loop
        .run(|reactor| {
            arm_guard(reactor, &timed_out);
            let id = reactor
                .open_datagram_socket(
                    "127.0.0.1",
                    0,
                    StopOnSendError {
                        log: log.clone(),
                        flagged: flagged.clone(),
                    },
                )
                .unwrap();
            reactor
                .set_send_error_handling(id, ErrorHandlingPolicy::Report)
                .unwrap();
            reactor
                .send_datagram(id, b"nobody home", "127.0.0.1", closed_port)
                .unwrap();
        })
        .unwrap();

    assert!(!timed_out.get(), "no send error was reported");
    let port = closed_port.to_string();
    let errors = log.send_errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].destination(), Some(("127.0.0.1", port.as_str())));
    assert_eq!(errors[0].kind(), std::io::ErrorKind::ConnectionRefused);
    assert!(flagged.get());
    assert_eq!(log.unbinds(), [None]);
}

#[cfg(target_os = "linux")]
#[test]
fn test_port_unreachable_under_drop_policy_unbinds() {
    init_test_logging();
    let mut event_loop = EventLoop::with_defaults().unwrap();
    let log = EventLog::default();
    let timed_out = Rc::new(Cell::new(false));
    let closed_port = {
        let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.local_addr().unwrap().port()
    };

    event_loop
        .run(|reactor| {
            arm_guard(reactor, &timed_out);
            let id = reactor
                .open_datagram_socket("127.0.0.1", 0, Recorder::stopping(&log))
                .unwrap();
            reactor
                .send_datagram(id, b"nobody home", "127.0.0.1", closed_port)
                .unwrap();
        })
        .unwrap();

    assert!(!timed_out.get());
    assert!(log.send_errors().is_empty());
    match log.unbinds().as_slice() {
        [Some(UnbindReason::SendFailed(error))] => {
            let port = closed_port.to_string();
            assert_eq!(error.destination(), Some(("127.0.0.1", port.as_str())));
        }
        other => panic!("unexpected unbinds {other:?}"),
    }
}

use std::{
    net::TcpListener,
    sync::{Arc, Mutex},
    thread,
    time::{Duration, Instant},
};

use hawser::{
    ConnectionHandle, ConnectionMeta, Error, TcpClient, TcpClientNotify,
    assemble::{DataReadResult, PacketAssemble},
};

struct Discard;

impl PacketAssemble for Discard {
    fn data_received(&mut self, _connection: &ConnectionHandle, _data: &[u8]) -> DataReadResult {
        DataReadResult::Success
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum LifecycleEvent {
    Up,
    Down,
    Dropped,
}

#[derive(Default)]
struct EventLog(Mutex<Vec<LifecycleEvent>>);

impl EventLog {
    fn events(&self) -> Vec<LifecycleEvent> {
        self.0.lock().unwrap().clone()
    }

    fn count(&self, event: LifecycleEvent) -> usize {
        self.events().iter().filter(|e| **e == event).count()
    }
}

impl TcpClientNotify for EventLog {
    fn connection_connected(&self, _remote_addr: &str, _remote_port: u16) {
        self.0.lock().unwrap().push(LifecycleEvent::Up);
    }

    fn connection_disconnected(&self, _remote_addr: &str, _remote_port: u16, _error: &Error) {
        self.0.lock().unwrap().push(LifecycleEvent::Down);
    }

    fn connection_dropped(&self, _remote_addr: &str, _remote_port: u16) {
        self.0.lock().unwrap().push(LifecycleEvent::Dropped);
    }
}

fn wait_for(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    false
}

/// A loopback port with nothing listening on it.
fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("failed to bind probe listener");
    listener.local_addr().expect("failed to fetch probe addr").port()
}

fn client_with(events: &Arc<EventLog>) -> TcpClient {
    TcpClient::new()
        .set_assemble_creator(Arc::new(|| Box::new(Discard)))
        .set_notify(events.clone())
}

/// `max_retry_cnt = 3` against a dead port: one disconnect notification per
/// scheduled retry, then a single drop, and no fourth attempt.
#[test]
fn retry_budget_yields_three_attempts_then_drop() {
    let port = closed_port();
    let events = Arc::new(EventLog::default());
    let client = client_with(&events);

    client.connect_with_meta(
        "127.0.0.1",
        port,
        ConnectionMeta {
            retry_when_connection_error: true,
            retry_forever: false,
            max_retry_cnt: 3,
            retry_interval_s: 0,
            assemble_creator: None,
        },
    );

    assert!(wait_for(Duration::from_secs(10), || events.count(LifecycleEvent::Dropped) == 1));
    assert_eq!(events.count(LifecycleEvent::Down), 3);
    assert_eq!(events.count(LifecycleEvent::Up), 0);

    // The budget is spent; nothing further may fire.
    thread::sleep(Duration::from_millis(300));
    assert_eq!(events.events().len(), 4);

    client.stop();
}

#[test]
fn no_meta_drops_on_first_failure() {
    let port = closed_port();
    let events = Arc::new(EventLog::default());
    let client = client_with(&events);

    client.connect("127.0.0.1", port);

    assert!(wait_for(Duration::from_secs(5), || events.count(LifecycleEvent::Dropped) == 1));
    assert_eq!(events.count(LifecycleEvent::Down), 0);

    thread::sleep(Duration::from_millis(300));
    assert_eq!(events.events().len(), 1);

    client.stop();
}

#[test]
fn retry_disabled_drops_on_first_failure() {
    let port = closed_port();
    let events = Arc::new(EventLog::default());
    let client = client_with(&events);

    client.connect_with_meta(
        "127.0.0.1",
        port,
        ConnectionMeta { retry_when_connection_error: false, ..ConnectionMeta::default() },
    );

    assert!(wait_for(Duration::from_secs(5), || events.count(LifecycleEvent::Dropped) == 1));
    assert_eq!(events.count(LifecycleEvent::Down), 0);
    client.stop();
}

/// A successful connect resets the retry counter: after failing once, coming
/// up, and going down again, the full budget is available to the new outage.
#[test]
fn retry_counter_resets_after_success() {
    let port = closed_port();
    let events = Arc::new(EventLog::default());
    let client = client_with(&events);

    client.connect_with_meta(
        "127.0.0.1",
        port,
        ConnectionMeta {
            retry_when_connection_error: true,
            retry_forever: false,
            max_retry_cnt: 3,
            retry_interval_s: 1,
            assemble_creator: None,
        },
    );

    // Burn one retry while nothing is listening.
    assert!(wait_for(Duration::from_secs(5), || events.count(LifecycleEvent::Down) >= 1));

    // Come up before the budget is gone.
    let listener = TcpListener::bind(("127.0.0.1", port)).expect("failed to rebind test port");
    let accepted = Arc::new(Mutex::new(Vec::new()));
    let sink = accepted.clone();
    let acceptor = thread::spawn(move || {
        if let Ok((stream, _)) = listener.accept() {
            sink.lock().unwrap().push(stream);
        }
    });
    assert!(wait_for(Duration::from_secs(10), || events.count(LifecycleEvent::Up) == 1));
    acceptor.join().expect("acceptor thread panicked");

    // Take the server away again; the outage gets a fresh budget of three.
    accepted.lock().unwrap().clear();
    assert!(wait_for(Duration::from_secs(15), || events.count(LifecycleEvent::Dropped) == 1));

    let after_up: Vec<_> = {
        let events = events.events();
        let up_at = events.iter().position(|e| *e == LifecycleEvent::Up).unwrap();
        events[up_at + 1..].to_vec()
    };
    assert_eq!(
        after_up.iter().filter(|e| **e == LifecycleEvent::Down).count(),
        3,
        "a fresh outage should get the full retry budget"
    );
    assert_eq!(events.count(LifecycleEvent::Dropped), 1);

    client.stop();
}

/// `disconnect` reports `CallDisconnect` synchronously and keeps the meta
/// entry; `forget` is the explicit way to retire a target.
#[test]
fn user_disconnect_notifies_call_disconnect() {
    let errors = Arc::new(Mutex::new(Vec::new()));

    struct ErrorLog(Arc<Mutex<Vec<Error>>>);
    impl TcpClientNotify for ErrorLog {
        fn connection_disconnected(&self, _remote_addr: &str, _remote_port: u16, error: &Error) {
            self.0.lock().unwrap().push(error.clone());
        }
    }

    let client = TcpClient::new()
        .set_assemble_creator(Arc::new(|| Box::new(Discard)))
        .set_notify(Arc::new(ErrorLog(errors.clone())));

    client.disconnect("127.0.0.1", 9);
    assert!(matches!(errors.lock().unwrap().as_slice(), [Error::CallDisconnect]));

    client.forget("127.0.0.1", 9);
    client.stop();
}

#![allow(clippy::unwrap_used)] // Integration tests use unwrap for brevity

//! Integration tests for the relay session.
//!
//! Every test runs a real session over loopback sockets: a "front" listener
//! produces the accepted client socket, a "back" listener plays the remote
//! endpoint.

use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::time::timeout;

use ferry_relay::{
    BUFFER_SIZE, BoxedStream, Fault, HookResult, Session, SessionObserver, SessionState, Side,
    passthrough,
};

const WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
enum Event {
    Connect,
    Outbound(Vec<u8>),
    Inbound(Vec<u8>),
    Fault {
        setup: bool,
        closed: Option<Side>,
        message: String,
    },
}

#[derive(Default)]
struct TestObserver {
    events: Mutex<Vec<Event>>,
    reject_outbound: bool,
    fail_stream: Option<Side>,
    /// Wrap the remote leg in a large write buffer, which flushes on shutdown.
    buffer_remote: bool,
    /// Hold `get_stream` until this is notified.
    gate: Option<Arc<Notify>>,
    /// Notified when a gated `get_stream` is entered.
    entered: Notify,
}

impl TestObserver {
    fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    fn faults(&self) -> Vec<Event> {
        self.events()
            .into_iter()
            .filter(|e| matches!(e, Event::Fault { .. }))
            .collect()
    }

    fn connects(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, Event::Connect))
            .count()
    }

    fn outbound_chunks(&self) -> Vec<Vec<u8>> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Outbound(bytes) => Some(bytes),
                _ => None,
            })
            .collect()
    }
}

impl SessionObserver for TestObserver {
    fn get_stream(&self, socket: TcpStream, side: Side) -> BoxFuture<'_, io::Result<BoxedStream>> {
        if self.fail_stream == Some(side) {
            let refused: io::Result<BoxedStream> = Err(io::Error::other("stream refused"));
            return Box::pin(async move { refused });
        }
        if self.buffer_remote && side == Side::Remote {
            let buffered: BoxedStream = Box::new(BufWriter::with_capacity(1 << 20, socket));
            return Box::pin(futures::future::ready(Ok(buffered)));
        }
        if let Some(gate) = &self.gate {
            let gate = Arc::clone(gate);
            return Box::pin(async move {
                self.entered.notify_one();
                gate.notified().await;
                Ok::<BoxedStream, io::Error>(Box::new(socket))
            });
        }
        passthrough(socket)
    }

    fn on_connect(&self, _session: &Session) {
        self.events.lock().unwrap().push(Event::Connect);
    }

    fn on_forward_outbound(&self, _session: &Session, data: &[u8]) -> HookResult {
        if self.reject_outbound {
            return Err("outbound traffic blocked".into());
        }
        self.events
            .lock()
            .unwrap()
            .push(Event::Outbound(data.to_vec()));
        Ok(())
    }

    fn on_forward_inbound(&self, _session: &Session, data: &[u8]) -> HookResult {
        self.events
            .lock()
            .unwrap()
            .push(Event::Inbound(data.to_vec()));
        Ok(())
    }

    fn on_fault(&self, _session: &Session, fault: Fault) {
        let closed = match &fault {
            Fault::Closed { side } => Some(*side),
            _ => None,
        };
        self.events.lock().unwrap().push(Event::Fault {
            setup: fault.is_setup(),
            closed,
            message: fault.to_string(),
        });
    }
}

/// A connected pair: the test drives `peer`, the session gets `accepted`.
async fn socket_pair() -> (TcpStream, TcpStream) {
    let front = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = front.local_addr().unwrap();
    let (peer, accepted) = tokio::join!(TcpStream::connect(addr), front.accept());
    (peer.unwrap(), accepted.unwrap().0)
}

struct Harness {
    session: Arc<Session>,
    observer: Arc<TestObserver>,
    client: TcpStream,
    remote: TcpStream,
}

async fn active_session(observer: TestObserver) -> Harness {
    let observer = Arc::new(observer);
    let (client, accepted) = socket_pair().await;
    let back = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = back.local_addr().unwrap().port();

    let session = Session::new(observer.clone(), accepted);
    let ((), accepted_remote) = tokio::join!(session.start("127.0.0.1", port), back.accept());

    assert_eq!(session.state(), SessionState::Active);
    Harness {
        session,
        observer,
        client,
        remote: accepted_remote.unwrap().0,
    }
}

async fn read_exact_len(stream: &mut TcpStream, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    timeout(WAIT, stream.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    buf
}

/// Read until EOF or reset; either way the socket is gone.
async fn assert_closed(stream: &mut TcpStream) {
    let mut buf = [0u8; 64];
    let result = timeout(WAIT, stream.read(&mut buf)).await.unwrap();
    match result {
        Ok(0) | Err(_) => {}
        Ok(n) => panic!("expected closed socket, read {n} bytes"),
    }
}

async fn wait_closed(session: &Session) {
    timeout(WAIT, session.closed()).await.unwrap();
}

// =========================================================================
// Relaying
// =========================================================================

#[tokio::test]
async fn relays_bytes_in_both_directions() {
    let mut h = active_session(TestObserver::default()).await;

    h.client.write_all(b"hello remote").await.unwrap();
    assert_eq!(read_exact_len(&mut h.remote, 12).await, b"hello remote");

    h.remote.write_all(b"hello client").await.unwrap();
    assert_eq!(read_exact_len(&mut h.client, 12).await, b"hello client");

    assert_eq!(h.observer.connects(), 1);
    assert_eq!(h.session.bytes_outbound(), 12);
    assert_eq!(h.session.bytes_inbound(), 12);
    assert!(h.session.remote_addr().is_some());
}

#[tokio::test]
async fn get_request_is_observed_then_forwarded() {
    let mut h = active_session(TestObserver::default()).await;

    h.client.write_all(b"GET /\r\n\r\n").await.unwrap();
    let received = read_exact_len(&mut h.remote, 9).await;

    assert_eq!(received, b"GET /\r\n\r\n");
    assert_eq!(h.observer.outbound_chunks(), vec![b"GET /\r\n\r\n".to_vec()]);
    assert_eq!(h.observer.events().first(), Some(&Event::Connect));
}

#[tokio::test]
async fn large_transfer_is_forwarded_without_loss() {
    let mut h = active_session(TestObserver::default()).await;
    let payload: Vec<u8> = (0..BUFFER_SIZE * 3 + 17).map(|i| (i % 251) as u8).collect();

    let mut client = h.client;
    let to_send = payload.clone();
    let writer = tokio::spawn(async move {
        client.write_all(&to_send).await.unwrap();
        client
    });
    let received = read_exact_len(&mut h.remote, payload.len()).await;
    h.client = writer.await.unwrap();

    assert_eq!(received, payload);
    let chunks = h.observer.outbound_chunks();
    assert!(chunks.iter().all(|c| !c.is_empty() && c.len() <= BUFFER_SIZE));
    assert_eq!(chunks.concat(), payload);
    assert_eq!(h.session.bytes_outbound(), payload.len() as u64);
}

#[tokio::test]
async fn full_buffer_read_is_forwarded_whole() {
    let mut h = active_session(TestObserver::default()).await;
    let payload = vec![0xA5u8; BUFFER_SIZE];

    h.remote.write_all(&payload).await.unwrap();
    let received = read_exact_len(&mut h.client, BUFFER_SIZE).await;

    assert_eq!(received.len(), BUFFER_SIZE);
    assert_eq!(received, payload);
    assert_eq!(h.session.bytes_inbound(), BUFFER_SIZE as u64);
}

// =========================================================================
// Teardown
// =========================================================================

#[tokio::test]
async fn remote_close_closes_client_and_faults_once() {
    let mut h = active_session(TestObserver::default()).await;

    drop(h.remote);
    assert_closed(&mut h.client).await;
    wait_closed(&h.session).await;

    assert_eq!(h.session.state(), SessionState::Stopped);
    let faults = h.observer.faults();
    assert_eq!(faults.len(), 1, "faults: {faults:?}");
    assert!(matches!(
        &faults[0],
        Event::Fault { setup: false, closed: Some(Side::Remote), message } if message == "remote socket closed"
    ));
}

#[tokio::test]
async fn client_close_closes_remote_and_faults_once() {
    let mut h = active_session(TestObserver::default()).await;

    drop(h.client);
    assert_closed(&mut h.remote).await;
    wait_closed(&h.session).await;

    let faults = h.observer.faults();
    assert_eq!(faults.len(), 1, "faults: {faults:?}");
    assert!(matches!(
        &faults[0],
        Event::Fault { closed: Some(Side::Client), .. }
    ));
}

#[tokio::test]
async fn stop_twice_closes_both_sockets() {
    let mut h = active_session(TestObserver::default()).await;

    h.session.stop();
    h.session.stop();

    assert_closed(&mut h.client).await;
    assert_closed(&mut h.remote).await;
    wait_closed(&h.session).await;
    h.session.stop();

    assert_eq!(h.session.state(), SessionState::Stopped);
    let faults = h.observer.faults();
    assert_eq!(faults.len(), 1, "faults: {faults:?}");
    assert!(matches!(
        &faults[0],
        Event::Fault { setup: false, closed: None, message } if message == "session stopped"
    ));
}

#[tokio::test]
async fn concurrent_stops_report_one_fault() {
    let mut h = active_session(TestObserver::default()).await;

    let stoppers: Vec<_> = (0..2)
        .map(|_| {
            let session = Arc::clone(&h.session);
            tokio::spawn(async move { session.stop() })
        })
        .collect();
    for stopper in stoppers {
        stopper.await.unwrap();
    }

    assert_closed(&mut h.client).await;
    assert_closed(&mut h.remote).await;
    wait_closed(&h.session).await;
    assert_eq!(h.observer.faults().len(), 1);
}

#[tokio::test]
async fn both_peers_closing_together_fault_once() {
    let Harness {
        session,
        observer,
        client,
        remote,
    } = active_session(TestObserver::default()).await;

    drop(client);
    drop(remote);
    wait_closed(&session).await;

    let faults = observer.faults();
    assert_eq!(faults.len(), 1, "faults: {faults:?}");
    assert!(matches!(&faults[0], Event::Fault { setup: false, .. }));
    assert_eq!(session.state(), SessionState::Stopped);
}

#[tokio::test]
async fn stop_does_not_wait_for_a_stalled_remote() {
    let Harness {
        session,
        observer,
        client,
        remote,
    } = active_session(TestObserver {
        buffer_remote: true,
        ..TestObserver::default()
    })
    .await;

    // The remote never reads, so the buffered remote leg ends up holding
    // bytes it can only flush once the peer drains its socket.
    let (_client_read, mut client_write) = client.into_split();
    let flood = tokio::spawn(async move {
        let chunk = vec![0x5Au8; BUFFER_SIZE];
        while client_write.write_all(&chunk).await.is_ok() {}
    });
    timeout(WAIT, async {
        while session.bytes_outbound() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    session.stop();
    wait_closed(&session).await;
    flood.abort();

    assert_eq!(session.state(), SessionState::Stopped);
    let faults = observer.faults();
    assert_eq!(faults.len(), 1, "faults: {faults:?}");
    drop(remote);
}

#[tokio::test]
async fn stop_while_connecting_spawns_nothing() {
    let gate = Arc::new(Notify::new());
    let observer = Arc::new(TestObserver {
        gate: Some(Arc::clone(&gate)),
        ..TestObserver::default()
    });
    let (mut client, accepted) = socket_pair().await;
    let back = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = back.local_addr().unwrap().port();

    let session = Session::new(observer.clone(), accepted);
    let starting = {
        let session = Arc::clone(&session);
        tokio::spawn(async move { session.start("127.0.0.1", port).await })
    };
    let (mut remote, _) = timeout(WAIT, back.accept()).await.unwrap().unwrap();
    timeout(WAIT, observer.entered.notified()).await.unwrap();
    assert_eq!(session.state(), SessionState::Connecting);

    session.stop();
    timeout(WAIT, starting).await.unwrap().unwrap();
    wait_closed(&session).await;

    assert_eq!(session.state(), SessionState::Stopped);
    assert_eq!(observer.connects(), 0);
    assert!(observer.faults().is_empty());
    assert_closed(&mut client).await;
    assert_closed(&mut remote).await;
}

#[tokio::test]
async fn start_on_active_session_is_ignored() {
    let mut h = active_session(TestObserver::default()).await;

    h.session.start("127.0.0.1", 1).await;

    assert_eq!(h.session.state(), SessionState::Active);
    assert_eq!(h.observer.connects(), 1);
    h.client.write_all(b"ping").await.unwrap();
    assert_eq!(read_exact_len(&mut h.remote, 4).await, b"ping");
}

// =========================================================================
// Faults
// =========================================================================

#[tokio::test]
async fn failed_dial_reports_setup_fault() {
    let observer = Arc::new(TestObserver::default());
    let (mut client, accepted) = socket_pair().await;

    // Grab a free port and release it so nothing listens there.
    let port = {
        let spare = TcpListener::bind("127.0.0.1:0").await.unwrap();
        spare.local_addr().unwrap().port()
    };

    let session = Session::new(observer.clone(), accepted);
    timeout(WAIT, session.start("127.0.0.1", port)).await.unwrap();

    assert_eq!(session.state(), SessionState::Stopped);
    assert_eq!(observer.connects(), 0);
    assert!(observer.outbound_chunks().is_empty());
    let faults = observer.faults();
    assert_eq!(faults.len(), 1);
    assert!(matches!(&faults[0], Event::Fault { setup: true, .. }));

    assert_closed(&mut client).await;
    wait_closed(&session).await;
}

#[tokio::test]
async fn stream_failure_reports_setup_fault() {
    let observer = Arc::new(TestObserver {
        fail_stream: Some(Side::Remote),
        ..TestObserver::default()
    });
    let (mut client, accepted) = socket_pair().await;
    let back = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = back.local_addr().unwrap().port();

    let session = Session::new(observer.clone(), accepted);
    let ((), remote) = tokio::join!(session.start("127.0.0.1", port), back.accept());
    let (mut remote, _) = remote.unwrap();

    assert_eq!(observer.connects(), 0);
    let faults = observer.faults();
    assert_eq!(faults.len(), 1);
    assert!(matches!(
        &faults[0],
        Event::Fault { setup: true, message, .. } if message.contains("remote stream")
    ));

    assert_closed(&mut client).await;
    assert_closed(&mut remote).await;
}

#[tokio::test]
async fn rejected_forward_stops_the_session() {
    let mut h = active_session(TestObserver {
        reject_outbound: true,
        ..TestObserver::default()
    })
    .await;

    h.client.write_all(b"forbidden").await.unwrap();

    assert_closed(&mut h.remote).await;
    assert_closed(&mut h.client).await;
    wait_closed(&h.session).await;

    assert_eq!(h.session.bytes_outbound(), 0);
    let faults = h.observer.faults();
    assert_eq!(faults.len(), 1);
    assert!(matches!(
        &faults[0],
        Event::Fault { message, .. } if message.contains("outbound traffic blocked")
    ));
}

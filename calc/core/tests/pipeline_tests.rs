//! End-to-end scenarios: a real server on a loopback socket driven by the
//! framed client, exercising the full request pipeline.

use calccore::config::ServerConfig;
use calccore::ops;
use calccore::server::{ComputeServer, Stopper};
use conduit::{ClientEvent, TcpClient};
use crossbeam_channel::Receiver;
use photon::codec;
use photon::login::LoginData;
use photon::logging::{o, Discard, Logger};
use photon::request::{EquationType, ErrorCode, Point, Request, RequestKind};
use photon::settings::ConnectionSettings;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const EVENT_WAIT: Duration = Duration::from_secs(10);

fn test_log() -> Logger {
    Logger::root(Discard, o!())
}

struct TestServer {
    stopper: Stopper,
    thread: Option<JoinHandle<()>>,
    addr: SocketAddr,
    probe: Arc<AtomicUsize>,
}

impl TestServer {
    fn start(config: ServerConfig) -> TestServer {
        let mut server = ComputeServer::new(&config, test_log());
        server
            .open(&ConnectionSettings::listen("127.0.0.1".parse().unwrap(), 0))
            .unwrap();
        let addr = server.local_addr().unwrap();
        let stopper = server.stopper();
        let probe = server.worker_probe();
        let thread = thread::spawn(move || server.run());
        TestServer {
            stopper,
            thread: Some(thread),
            addr,
            probe,
        }
    }

    fn start_default() -> TestServer {
        TestServer::start(ServerConfig::default())
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.stopper.stop();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

struct TestClient {
    client: TcpClient,
    events: Receiver<ClientEvent>,
}

impl TestClient {
    fn connect(addr: SocketAddr) -> TestClient {
        TestClient::connect_as(addr, "Chuck", "Norris")
    }

    fn connect_as(addr: SocketAddr, username: &str, password: &str) -> TestClient {
        let (mut client, events) = TcpClient::new(test_log());
        client.set_login_data(LoginData::new(username, password));
        client
            .open(&ConnectionSettings::connect(addr.ip(), addr.port()))
            .unwrap();

        let deadline = Instant::now() + EVENT_WAIT;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match events.recv_timeout(remaining) {
                Ok(ClientEvent::Connected) => break,
                Ok(_) => continue,
                Err(_) => panic!("client failed to connect"),
            }
        }
        TestClient { client, events }
    }

    fn submit(&self, request: &Request) {
        self.client.send(&codec::encode(request)).unwrap();
    }

    /// Next decoded frame from the server, skipping connection events.
    fn next_request(&self) -> (Request, Vec<u8>) {
        let deadline = Instant::now() + EVENT_WAIT;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.events.recv_timeout(remaining) {
                Ok(ClientEvent::Message { payload }) => {
                    let request = codec::decode(&payload).expect("server sent undecodable frame");
                    return (request, payload);
                }
                Ok(_) => continue,
                Err(_) => panic!("timed out waiting for a server frame"),
            }
        }
    }

    /// Skips progress frames and returns the first non-progress frame.
    fn next_terminal(&self) -> (Request, Vec<u8>) {
        loop {
            let (request, payload) = self.next_request();
            match request.kind() {
                RequestKind::ProgressRange | RequestKind::ProgressValue => continue,
                _ => return (request, payload),
            }
        }
    }

    /// Collects every frame up to and including the terminal one.
    fn collect_until_terminal(&self) -> Vec<Request> {
        let mut frames = Vec::new();
        loop {
            let (request, _) = self.next_request();
            let done = !matches!(
                request.kind(),
                RequestKind::ProgressRange | RequestKind::ProgressValue
            );
            frames.push(request);
            if done {
                return frames;
            }
        }
    }
}

fn sort_request(numbers: Vec<i32>) -> Request {
    Request::SortArray { numbers }
}

fn primes_request(x_from: i32, x_to: i32) -> Request {
    Request::FindPrimes {
        x_from,
        x_to,
        primes: Vec::new(),
    }
}

fn assert_progress_shape(frames: &[Request]) {
    // First frame announces the range, then values climb monotonically from
    // zero to the chunk count.
    let maximum = match frames.first() {
        Some(Request::ProgressRange { minimum: 0, maximum }) => *maximum,
        other => panic!("expected leading ProgressRange, got {:?}", other),
    };

    let mut last = -1;
    let mut values = 0;
    for frame in &frames[1..frames.len() - 1] {
        match frame {
            Request::ProgressValue { value } => {
                assert!(*value >= last, "progress must be monotone");
                last = *value;
                values += 1;
            }
            other => panic!("unexpected frame inside progress stream: {:?}", other),
        }
    }
    assert!(values > 0, "at least one ProgressValue expected");
    assert_eq!(last, maximum, "progress must end at the chunk count");
}

#[test]
fn test_sort_scenario() {
    let server = TestServer::start_default();
    let client = TestClient::connect(server.addr);

    client.submit(&sort_request(vec![5, 3, 9, 3, 1]));
    let frames = client.collect_until_terminal();

    assert_progress_shape(&frames);
    match frames.last().unwrap() {
        Request::SortArray { numbers } => assert_eq!(numbers, &vec![1, 3, 3, 5, 9]),
        other => panic!("expected SortArray result, got {:?}", other),
    }
}

#[test]
fn test_sort_large_input_is_a_permutation() {
    let server = TestServer::start_default();
    let client = TestClient::connect(server.addr);

    let mut input: Vec<i32> = (0..100_000).map(|n| (n * 2_654_435_761u64 as i64) as i32).collect();
    input.truncate(100_000);
    let mut expected = input.clone();
    expected.sort_unstable();

    client.submit(&sort_request(input));
    match client.next_terminal().0 {
        Request::SortArray { numbers } => assert_eq!(numbers, expected),
        other => panic!("expected SortArray result, got {:?}", other),
    }
}

#[test]
fn test_primes_scenario() {
    let server = TestServer::start_default();
    let client = TestClient::connect(server.addr);

    client.submit(&primes_request(1, 20));
    let frames = client.collect_until_terminal();

    assert_progress_shape(&frames);
    match frames.last().unwrap() {
        Request::FindPrimes { x_from: 1, x_to: 20, primes } => {
            assert_eq!(primes, &vec![2, 3, 5, 7, 11, 13, 17, 19])
        }
        other => panic!("expected FindPrimes result, got {:?}", other),
    }
}

#[test]
fn test_calc_linear_scenario() {
    let server = TestServer::start_default();
    let client = TestClient::connect(server.addr);

    client.submit(&Request::CalcFunction {
        equation: EquationType::Linear,
        x_from: 0,
        x_to: 4,
        x_step: 2,
        a: 2,
        b: 3,
        c: 0,
        points: Vec::new(),
    });

    match client.next_terminal().0 {
        Request::CalcFunction { points, .. } => assert_eq!(
            points,
            vec![Point::new(0, 3), Point::new(2, 7), Point::new(4, 11)]
        ),
        other => panic!("expected CalcFunction result, got {:?}", other),
    }
}

#[test]
fn test_calc_quadratic_scenario() {
    let server = TestServer::start_default();
    let client = TestClient::connect(server.addr);

    client.submit(&Request::CalcFunction {
        equation: EquationType::Quadratic,
        x_from: -2,
        x_to: 2,
        x_step: 1,
        a: 1,
        b: 0,
        c: 0,
        points: Vec::new(),
    });

    match client.next_terminal().0 {
        Request::CalcFunction { points, .. } => assert_eq!(
            points,
            vec![
                Point::new(-2, 4),
                Point::new(-1, 1),
                Point::new(0, 0),
                Point::new(1, 1),
                Point::new(2, 4),
            ]
        ),
        other => panic!("expected CalcFunction result, got {:?}", other),
    }
}

#[test]
fn test_cache_hit_skips_worker_pool() {
    let server = TestServer::start_default();
    let client = TestClient::connect(server.addr);
    let request = sort_request(vec![5, 3, 9, 3, 1]);

    client.submit(&request);
    let (first, first_payload) = client.next_terminal();
    assert_eq!(first.kind(), RequestKind::SortArray);

    let executed_after_first = server.probe.load(Ordering::SeqCst);
    assert!(executed_after_first > 0);

    // Byte-identical resubmission: answered from the cache, bit-exact, with
    // no worker involvement and no progress stream.
    client.submit(&request);
    let (second, second_payload) = client.next_request();
    assert_eq!(second.kind(), RequestKind::SortArray);
    assert_eq!(first_payload, second_payload);
    assert_eq!(server.probe.load(Ordering::SeqCst), executed_after_first);
}

#[test]
fn test_cache_hit_while_task_is_running() {
    let server = TestServer::start_default();
    let client = TestClient::connect(server.addr);
    let sort = sort_request(vec![5, 3, 9, 3, 1]);

    client.submit(&sort);
    let (first, first_payload) = client.next_terminal();
    assert_eq!(first.kind(), RequestKind::SortArray);

    // Start a long task, then resubmit the byte-identical sort while it is
    // still running.
    client.submit(&primes_request(1, 3_000_000));
    loop {
        let (request, _) = client.next_request();
        if let Request::ProgressValue { .. } = request {
            break;
        }
    }
    client.submit(&sort);

    // The cached reply is served mid-task (no AlreadyRunningTask, no second
    // progress stream) and the primes task still finishes normally with its
    // own single terminal frame.
    let mut cached_replies = 0;
    let primes = loop {
        let (request, payload) = client.next_request();
        match request {
            Request::SortArray { .. } => {
                assert_eq!(payload, first_payload);
                cached_replies += 1;
            }
            Request::FindPrimes { x_from: 1, x_to: 3_000_000, primes } => break primes,
            Request::ProgressRange { .. } | Request::ProgressValue { .. } => {}
            other => panic!("unexpected frame: {:?}", other),
        }
    };
    assert_eq!(cached_replies, 1);
    assert_eq!(primes, ops::find_primes(1, 3_000_000));
}

#[test]
fn test_cancel_scenario() {
    let server = TestServer::start_default();
    let client = TestClient::connect(server.addr);

    client.submit(&primes_request(1, 10_000_000));

    // At least one progress value before we cancel.
    loop {
        let (request, _) = client.next_request();
        if let Request::ProgressValue { .. } = request {
            break;
        }
    }
    thread::sleep(Duration::from_millis(50));
    client.submit(&Request::CancelTask);

    // Exactly one terminal frame, and it is the cancel acknowledgement.
    let (terminal, _) = client.next_terminal();
    assert_eq!(terminal, Request::CancelTask);

    // The owner slot is free again.
    client.submit(&primes_request(1, 20));
    match client.next_terminal().0 {
        Request::FindPrimes { primes, .. } => {
            assert_eq!(primes, vec![2, 3, 5, 7, 11, 13, 17, 19])
        }
        other => panic!("expected FindPrimes result, got {:?}", other),
    }
}

#[test]
fn test_second_submission_rejected_while_running() {
    let server = TestServer::start_default();
    let client = TestClient::connect(server.addr);

    client.submit(&primes_request(1, 10_000_000));
    client.submit(&sort_request(vec![3, 1, 2]));

    // The sort is refused while the primes task runs.
    let (terminal, _) = client.next_terminal();
    match terminal {
        Request::Invalid { code, .. } => assert_eq!(code, ErrorCode::AlreadyRunningTask),
        other => panic!("expected AlreadyRunningTask, got {:?}", other),
    }

    client.submit(&Request::CancelTask);
    let (terminal, _) = client.next_terminal();
    assert_eq!(terminal, Request::CancelTask);

    // Slot free: the same sort is accepted now.
    client.submit(&sort_request(vec![3, 1, 2]));
    match client.next_terminal().0 {
        Request::SortArray { numbers } => assert_eq!(numbers, vec![1, 2, 3]),
        other => panic!("expected SortArray result, got {:?}", other),
    }
}

#[test]
fn test_empty_sort_completes_as_noop() {
    let server = TestServer::start_default();
    let client = TestClient::connect(server.addr);

    client.submit(&sort_request(Vec::new()));
    let frames = client.collect_until_terminal();

    match frames.first() {
        Some(Request::ProgressRange { minimum: 0, maximum: 0 }) => {}
        other => panic!("expected ProgressRange(0, 0), got {:?}", other),
    }
    match frames.last().unwrap() {
        Request::SortArray { numbers } => assert!(numbers.is_empty()),
        other => panic!("expected empty SortArray result, got {:?}", other),
    }
}

#[test]
fn test_inverted_primes_range_completes_as_noop() {
    let server = TestServer::start_default();
    let client = TestClient::connect(server.addr);

    client.submit(&primes_request(20, 10));
    match client.next_terminal().0 {
        Request::FindPrimes { primes, .. } => assert!(primes.is_empty()),
        other => panic!("expected FindPrimes result, got {:?}", other),
    }
}

#[test]
fn test_nonpositive_step_completes_with_empty_points() {
    let server = TestServer::start_default();
    let client = TestClient::connect(server.addr);

    client.submit(&Request::CalcFunction {
        equation: EquationType::Linear,
        x_from: 0,
        x_to: 10,
        x_step: 0,
        a: 1,
        b: 1,
        c: 0,
        points: Vec::new(),
    });
    match client.next_terminal().0 {
        Request::CalcFunction { points, .. } => assert!(points.is_empty()),
        other => panic!("expected CalcFunction result, got {:?}", other),
    }
}

#[test]
fn test_corrupted_frame_taxonomy() {
    let server = TestServer::start_default();
    let client = TestClient::connect(server.addr);

    // Truncated SortArray: count announces more elements than present.
    let mut payload = codec::encode(&sort_request(vec![1, 2, 3]));
    payload.truncate(payload.len() - 4);
    client.client.send(&payload).unwrap();
    match client.next_terminal().0 {
        Request::Invalid { code, .. } => assert_eq!(code, ErrorCode::CorruptedData),
        other => panic!("expected CorruptedData, got {:?}", other),
    }

    // Unknown discriminator.
    let bogus = 42u32;
    let mut payload = Vec::new();
    use byteorder::WriteBytesExt;
    payload.write_u32::<codec::NetOrder>(bogus).unwrap();
    client.client.send(&payload).unwrap();
    match client.next_terminal().0 {
        Request::Invalid { code, .. } => assert_eq!(code, ErrorCode::InvalidRequestType),
        other => panic!("expected InvalidRequestType, got {:?}", other),
    }

    // Progress frames are server-to-client only.
    client.submit(&Request::ProgressValue { value: 1 });
    match client.next_terminal().0 {
        Request::Invalid { code, .. } => assert_eq!(code, ErrorCode::InvalidRequestType),
        other => panic!("expected InvalidRequestType, got {:?}", other),
    }
}

#[test]
fn test_cancel_without_task_is_acknowledged() {
    let server = TestServer::start_default();
    let client = TestClient::connect(server.addr);

    client.submit(&Request::CancelTask);
    let (terminal, _) = client.next_terminal();
    assert_eq!(terminal, Request::CancelTask);
}

#[test]
fn test_owner_disconnect_frees_the_slot() {
    let server = TestServer::start_default();

    {
        let client = TestClient::connect(server.addr);
        client.submit(&primes_request(1, 10_000_000));
        // Wait until the task actually started before vanishing.
        loop {
            let (request, _) = client.next_request();
            if let Request::ProgressValue { .. } = request {
                break;
            }
        }
    } // client drops, socket closes

    // Same username can come back and compute again.
    let client = TestClient::connect(server.addr);
    client.submit(&primes_request(1, 20));
    match client.next_terminal().0 {
        Request::FindPrimes { primes, .. } => {
            assert_eq!(primes, vec![2, 3, 5, 7, 11, 13, 17, 19])
        }
        other => panic!("expected FindPrimes result, got {:?}", other),
    }
}

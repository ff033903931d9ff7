//! End-to-end tests for the request server over real sockets.
//!
//! These tests exercise the server through its public API the way a deployed
//! front end would: binding real TCP and unix sockets, connecting as a
//! client, and speaking the native binary protocol, the restricted HTTP
//! subset, or the console protocol. Collaborators (dispatcher, analytics
//! sink, expression evaluator) are recording doubles, so every test can
//! assert both the wire behavior and what crossed the dispatch seam.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UnixStream};
use uuid::Uuid;

use appgate_core::protocol::{encode_pairs, read_array, write_scalar, DEFAULT_MAX_SCALAR_SIZE};
use appgate_core::HeaderMap;
use appgate_server::analytics::{AnalyticsLog, AnalyticsSink};
use appgate_server::config::{Endpoint, ServerOptions};
use appgate_server::console::ExpressionEvaluator;
use appgate_server::dispatch::{Connection, DispatchError, RequestContext, RequestDispatcher};
use appgate_server::server::{RequestServer, ServerStream, SocketName};

// ── Test doubles ──────────────────────────────────────────────────────────────

#[derive(Default)]
struct RecordingDispatcher {
    requests: Mutex<Vec<(HeaderMap, bool)>>,
    contexts: Mutex<Vec<RequestContext>>,
    fail_with: Option<(String, String)>,
    reraise_consulted: AtomicBool,
}

#[async_trait]
impl RequestDispatcher for RecordingDispatcher {
    async fn process_request(
        &self,
        context: RequestContext,
        headers: HeaderMap,
        _connection: &mut dyn Connection,
        full_response: bool,
    ) -> Result<(), DispatchError> {
        self.requests.lock().unwrap().push((headers, full_response));
        self.contexts.lock().unwrap().push(context);
        match &self.fail_with {
            Some((class, message)) => Err(DispatchError::new(class, message)),
            None => Ok(()),
        }
    }

    fn should_reraise_error(&self, _error: &DispatchError) -> bool {
        self.reraise_consulted.store(true, Ordering::SeqCst);
        false
    }
}

#[derive(Default)]
struct RecordingSink {
    exceptions: Mutex<Vec<(String, String, String, String)>>,
}

#[async_trait]
impl AnalyticsSink for RecordingSink {
    async fn open_log(&self, transaction_id: &str, group_name: &str) -> AnalyticsLog {
        AnalyticsLog::new(transaction_id, group_name)
    }

    async fn log_exception(
        &self,
        transaction_id: &str,
        class_name: &str,
        message: &str,
        backtrace: &str,
    ) {
        self.exceptions.lock().unwrap().push((
            transaction_id.to_string(),
            class_name.to_string(),
            message.to_string(),
            backtrace.to_string(),
        ));
    }
}

/// Evaluates every expression to `=> 7`, like a very confident interpreter.
struct StubEvaluator;

#[async_trait]
impl ExpressionEvaluator for StubEvaluator {
    async fn evaluate(&self, _expression: &str) -> String {
        "=> 7".to_string()
    }
}

// ── Harness ───────────────────────────────────────────────────────────────────

struct TestServer {
    server: RequestServer,
    dispatcher: Arc<RecordingDispatcher>,
    sink: Arc<RecordingSink>,
    socket_dir: std::path::PathBuf,
}

fn test_options() -> ServerOptions {
    let mut options = ServerOptions::default();
    options.app_group_name = "foobar".to_string();
    options.socket_dir = std::env::temp_dir()
        .join(format!("appgate_test_{}", Uuid::new_v4()))
        .join("backends");
    options
}

async fn build_server(options: ServerOptions, dispatcher: RecordingDispatcher) -> TestServer {
    let dispatcher = Arc::new(dispatcher);
    let sink = Arc::new(RecordingSink::default());
    let socket_dir = options.socket_dir.clone();
    let server = RequestServer::new(
        options,
        Arc::clone(&dispatcher) as Arc<dyn RequestDispatcher>,
        Some(Arc::clone(&sink) as Arc<dyn AnalyticsSink>),
        Arc::new(StubEvaluator),
    )
    .await
    .expect("server must bind");
    TestServer {
        server,
        dispatcher,
        sink,
        socket_dir,
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(root) = self.socket_dir.parent() {
            let _ = std::fs::remove_dir_all(root);
        }
    }
}

async fn connect(server: &RequestServer, name: SocketName) -> ServerStream {
    match server.socket_address(name) {
        Endpoint::Unix(path) => ServerStream::Unix(
            UnixStream::connect(path).await.expect("unix connect"),
        ),
        Endpoint::Tcp(addr) => ServerStream::Tcp(
            TcpStream::connect(addr).await.expect("tcp connect"),
        ),
    }
}

async fn send_binary_request(stream: &mut ServerStream, env: &[(&str, &str)]) {
    let payload = encode_pairs(env.iter().copied());
    write_scalar(stream, &payload).await.expect("send request");
}

async fn read_response(stream: &mut ServerStream) -> Vec<u8> {
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await.expect("read response");
    buf
}

/// Like [`read_response`], but tolerates a connection reset: a server that
/// hangs up with unread client data still in flight may RST instead of
/// closing cleanly. Returns whatever arrived before the close.
async fn read_until_closed(stream: &mut ServerStream) -> Vec<u8> {
    let mut buf = Vec::new();
    let _ = stream.read_to_end(&mut buf).await;
    buf
}

/// Polls `cond` until it holds, giving up after five seconds.
async fn eventually<F: Fn() -> bool>(what: &str, cond: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

// ── Lifecycle ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn exits_if_the_owner_pipe_is_closed() {
    let mut ts = build_server(test_options(), RecordingDispatcher::default()).await;
    let (writer, reader) = tokio::io::duplex(8);
    ts.server.attach_owner_pipe(reader);
    ts.server.start_main_loop();
    assert!(ts.server.main_loop_running());

    drop(writer);

    eventually("main loop to stop", || !ts.server.main_loop_running()).await;
    assert_eq!(ts.server.processed_requests(), 0);
}

#[tokio::test]
async fn creates_socket_files_in_an_owner_only_directory() {
    let ts = build_server(test_options(), RecordingDispatcher::default()).await;

    for name in [SocketName::Main, SocketName::Irb, SocketName::AsyncIrb] {
        match ts.server.socket_address(name) {
            Endpoint::Unix(path) => assert!(path.exists(), "{name} socket file missing"),
            Endpoint::Tcp(_) => panic!("{name} should default to a unix socket"),
        }
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&ts.socket_dir)
            .expect("socket dir metadata")
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o700, "socket directory must be owner-only");
    }
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn exits_if_memory_usage_exceeds_the_memory_limit() {
    let mut options = test_options();
    options.memory_limit = 1;
    let mut ts = build_server(options, RecordingDispatcher::default()).await;
    ts.server.start_main_loop();

    let mut client = connect(&ts.server, SocketName::Main).await;
    send_binary_request(&mut client, &[("REQUEST_METHOD", "PING")]).await;
    assert_eq!(read_response(&mut client).await, b"pong");

    eventually("main loop to stop", || !ts.server.main_loop_running()).await;
    assert_eq!(ts.server.processed_requests(), 1);
}

// ── Native protocol ───────────────────────────────────────────────────────────

#[tokio::test]
async fn accepts_pings_on_the_main_socket() {
    let mut ts = build_server(test_options(), RecordingDispatcher::default()).await;
    ts.server.start_main_loop();

    let mut client = connect(&ts.server, SocketName::Main).await;
    send_binary_request(&mut client, &[("REQUEST_METHOD", "PING")]).await;

    assert_eq!(read_response(&mut client).await, b"pong");
    assert!(
        ts.dispatcher.requests.lock().unwrap().is_empty(),
        "PING must not reach the request handler"
    );
}

#[tokio::test]
async fn main_socket_works_over_tcp_when_configured() {
    let mut options = test_options();
    options.sockets.main = Some(Endpoint::Tcp("127.0.0.1:0".to_string()));
    let mut ts = build_server(options, RecordingDispatcher::default()).await;
    ts.server.start_main_loop();

    assert!(matches!(
        ts.server.socket_address(SocketName::Main),
        Endpoint::Tcp(_)
    ));
    let mut client = connect(&ts.server, SocketName::Main).await;
    send_binary_request(&mut client, &[("REQUEST_METHOD", "PING")]).await;
    assert_eq!(read_response(&mut client).await, b"pong");
}

#[tokio::test]
async fn main_socket_rejects_headers_that_are_too_large() {
    let mut options = test_options();
    options.max_header_size = 4096;
    let mut ts = build_server(options, RecordingDispatcher::default()).await;
    ts.server.start_main_loop();

    let mut client = connect(&ts.server, SocketName::Main).await;
    let mut huge = b"REQUEST_METHOD\0/".to_vec();
    huge.extend(std::iter::repeat(b'x').take(4096 * 2));
    huge.push(0);
    // The server hangs up on seeing the length prefix; depending on timing
    // the write either completes into the socket buffer or fails with a
    // broken pipe. Both are acceptable; what matters is the silent close.
    let _ = write_scalar(&mut client, &huge).await;

    assert!(read_until_closed(&mut client).await.is_empty());
    assert!(ts.dispatcher.requests.lock().unwrap().is_empty());
}

#[tokio::test]
async fn main_socket_rejects_unauthenticated_connections_if_a_connect_password_is_supplied() {
    let mut options = test_options();
    options.connect_password = Some("1234".to_string());
    let mut ts = build_server(options, RecordingDispatcher::default()).await;
    ts.server.start_main_loop();

    // Without the password: zero response bytes.
    let mut client = connect(&ts.server, SocketName::Main).await;
    send_binary_request(&mut client, &[("REQUEST_METHOD", "PING")]).await;
    assert_eq!(read_response(&mut client).await, b"");

    // With the password: normal response.
    let mut client = connect(&ts.server, SocketName::Main).await;
    send_binary_request(
        &mut client,
        &[
            ("REQUEST_METHOD", "PING"),
            ("PASSENGER_CONNECT_PASSWORD", "1234"),
        ],
    )
    .await;
    assert_eq!(read_response(&mut client).await, b"pong");
}

// ── Analytics ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn makes_the_analytics_log_available_through_the_request_context() {
    let mut ts = build_server(test_options(), RecordingDispatcher::default()).await;
    ts.server.start_main_loop();

    let mut client = connect(&ts.server, SocketName::Main).await;
    send_binary_request(
        &mut client,
        &[
            ("REQUEST_METHOD", "GET"),
            ("PASSENGER_TXN_ID", "1234-abcd"),
            ("PASSENGER_GROUP_NAME", "foobar"),
        ],
    )
    .await;
    read_response(&mut client).await;

    let contexts = ts.dispatcher.contexts.lock().unwrap();
    assert_eq!(contexts.len(), 1);
    assert_eq!(contexts[0].transaction_id.as_deref(), Some("1234-abcd"));
    let log = contexts[0].analytics.as_ref().expect("analytics handle");
    assert_eq!(log.transaction_id(), "1234-abcd");
    assert_eq!(log.group_name(), "foobar");
    // The transaction id also stays visible to the handler via the headers.
    let requests = ts.dispatcher.requests.lock().unwrap();
    assert_eq!(requests[0].0.get("PASSENGER_TXN_ID"), Some("1234-abcd"));
}

#[tokio::test]
async fn logs_uncaught_exceptions_for_requests_that_have_a_transaction_id() {
    let dispatcher = RecordingDispatcher {
        fail_with: Some(("RuntimeError".to_string(), "something went wrong".to_string())),
        ..RecordingDispatcher::default()
    };
    let mut ts = build_server(test_options(), dispatcher).await;
    ts.server.start_main_loop();

    let mut client = connect(&ts.server, SocketName::Main).await;
    send_binary_request(
        &mut client,
        &[("REQUEST_METHOD", "GET"), ("PASSENGER_TXN_ID", "1234-abcd")],
    )
    .await;
    read_response(&mut client).await;

    let exceptions = ts.sink.exceptions.lock().unwrap();
    assert_eq!(exceptions.len(), 1);
    let (txn, class, message, backtrace) = &exceptions[0];
    assert_eq!(txn, "1234-abcd");
    assert_eq!(class, "RuntimeError");
    assert_eq!(message, "something went wrong");
    assert!(!backtrace.is_empty(), "backtrace must not be empty");
    assert!(
        ts.dispatcher.reraise_consulted.load(Ordering::SeqCst),
        "the reraise hook must be consulted"
    );
}

// ── HTTP protocol ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn accepts_pings_on_the_http_socket() {
    let mut ts = build_server(test_options(), RecordingDispatcher::default()).await;
    ts.server.start_main_loop();

    let mut client = connect(&ts.server, SocketName::Http).await;
    client
        .write_all(b"PING / HTTP/1.1\r\nHost: foo.com\r\n\r\n")
        .await
        .expect("send");

    assert_eq!(read_response(&mut client).await, b"pong");
}

#[tokio::test]
async fn http_socket_rejects_headers_that_are_too_large() {
    let mut options = test_options();
    options.max_header_size = 4096;
    let mut ts = build_server(options, RecordingDispatcher::default()).await;
    ts.server.start_main_loop();

    let mut client = connect(&ts.server, SocketName::Http).await;
    let _ = client.write_all(b"GET /").await;
    let _ = client.write_all(&vec![b'x'; 4096 * 2]).await;
    let _ = client.write_all(b" HTTP/1.1\r\n").await;

    assert!(read_until_closed(&mut client).await.is_empty());
    assert!(ts.dispatcher.requests.lock().unwrap().is_empty());
}

#[tokio::test]
async fn http_socket_rejects_unauthenticated_connections_if_a_connect_password_is_supplied() {
    let mut options = test_options();
    options.connect_password = Some("1234".to_string());
    let mut ts = build_server(options, RecordingDispatcher::default()).await;
    ts.server.start_main_loop();

    let mut client = connect(&ts.server, SocketName::Http).await;
    client
        .write_all(b"PING / HTTP/1.1\r\n\r\n")
        .await
        .expect("send");
    assert_eq!(read_response(&mut client).await, b"");

    let mut client = connect(&ts.server, SocketName::Http).await;
    client
        .write_all(b"PING / HTTP/1.1\r\nX-Passenger-Connect-Password: 1234\r\n\r\n")
        .await
        .expect("send");
    assert_eq!(read_response(&mut client).await, b"pong");
}

fn assert_parsed_post(headers: &HeaderMap, query: &str) {
    assert_eq!(headers.get("REQUEST_METHOD"), Some("POST"));
    assert_eq!(headers.get("SERVER_PROTOCOL"), Some("HTTP/1.1"));
    assert_eq!(headers.get("HTTP_HOST"), Some("foo.com"));
    assert_eq!(headers.get("HTTP_X_FOO_BAR"), Some("baz"));
    assert_eq!(headers.get("PATH_INFO"), Some("/foo/bar"));
    assert_eq!(headers.get("SCRIPT_NAME"), Some(""));
    assert_eq!(headers.get("QUERY_STRING"), Some(query));
    assert_eq!(headers.get("HTTP_CONTENT_LENGTH"), None);
    assert_eq!(headers.get("HTTP_CONTENT_TYPE"), None);
    assert_eq!(headers.get("CONTENT_LENGTH"), Some("10"));
    assert_eq!(headers.get("CONTENT_TYPE"), Some("text/plain"));
}

#[tokio::test]
async fn correctly_parses_http_requests_without_query_string() {
    let mut ts = build_server(test_options(), RecordingDispatcher::default()).await;
    ts.server.start_main_loop();

    let mut client = connect(&ts.server, SocketName::Http).await;
    client
        .write_all(
            b"POST /foo/bar HTTP/1.1\r\n\
              Host: foo.com\r\n\
              X-Foo-Bar: baz\r\n\
              Content-Length: 10\r\n\
              Content-Type: text/plain\r\n\
              \r\n",
        )
        .await
        .expect("send");
    read_response(&mut client).await;

    let requests = ts.dispatcher.requests.lock().unwrap();
    assert_eq!(requests.len(), 1);
    let (headers, full_response) = &requests[0];
    assert_parsed_post(headers, "");
    assert_eq!(headers.get("REQUEST_URI"), Some("/foo/bar"));
    assert!(full_response);
}

#[tokio::test]
async fn correctly_parses_http_requests_with_query_string() {
    let mut ts = build_server(test_options(), RecordingDispatcher::default()).await;
    ts.server.start_main_loop();

    let mut client = connect(&ts.server, SocketName::Http).await;
    client
        .write_all(
            b"POST /foo/bar?hello=world&a=b+c HTTP/1.1\r\n\
              Host: foo.com\r\n\
              X-Foo-Bar: baz\r\n\
              Content-Length: 10\r\n\
              Content-Type: text/plain\r\n\
              \r\n",
        )
        .await
        .expect("send");
    read_response(&mut client).await;

    let requests = ts.dispatcher.requests.lock().unwrap();
    let (headers, _) = &requests[0];
    assert_parsed_post(headers, "hello=world&a=b+c");
    assert_eq!(headers.get("REQUEST_URI"), Some("/foo/bar?hello=world&a=b+c"));
}

#[tokio::test]
async fn correctly_parses_http_requests_that_come_in_arbitrary_chunks() {
    let mut ts = build_server(test_options(), RecordingDispatcher::default()).await;
    ts.server.start_main_loop();

    let mut client = connect(&ts.server, SocketName::Http).await;
    let chunks: [&[u8]; 9] = [
        b"POST /fo",
        b"o/bar?hello=world&a=b+c HT",
        b"TP/1.1\r",
        b"\nHost: foo.com",
        b"\r\n",
        b"X-Foo-Bar: baz\r\n",
        b"Content-Len",
        b"gth: 10\r\nContent-Type: text/pla",
        b"in\r\n\r",
    ];
    for chunk in chunks {
        client.write_all(chunk).await.expect("send chunk");
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    client
        .write_all(b"\nPlus-Some: garbage data that should be ignored.")
        .await
        .expect("send tail");
    read_response(&mut client).await;

    let requests = ts.dispatcher.requests.lock().unwrap();
    assert_eq!(requests.len(), 1);
    let (headers, _) = &requests[0];
    assert_parsed_post(headers, "hello=world&a=b+c");
    assert_eq!(
        headers.get("HTTP_PLUS_SOME"),
        None,
        "bytes after the blank line are body, not headers"
    );
}

// ── Debug console ─────────────────────────────────────────────────────────────

async fn exercise_console(name: SocketName) {
    let mut options = test_options();
    options.connect_password = Some("1234".to_string());
    let mut ts = build_server(options, RecordingDispatcher::default()).await;
    ts.server.start_main_loop();

    let mut client = connect(&ts.server, name).await;
    write_scalar(&mut client, b"1234").await.expect("handshake");
    let reply = read_array(&mut client, DEFAULT_MAX_SCALAR_SIZE)
        .await
        .expect("read")
        .expect("handshake reply");
    assert_eq!(reply, vec!["ok".to_string()]);

    write_scalar(&mut client, b"1 + 2 * 3").await.expect("submit");
    let reply = read_array(&mut client, DEFAULT_MAX_SCALAR_SIZE)
        .await
        .expect("read")
        .expect("evaluation reply");
    assert_eq!(reply.len(), 2);
    assert_eq!(reply[0], "end");
    assert_eq!(BASE64.decode(&reply[1]).expect("base64"), b"=> 7");
}

#[tokio::test]
async fn the_irb_socket_works() {
    exercise_console(SocketName::Irb).await;
}

#[tokio::test]
async fn the_async_irb_socket_works() {
    exercise_console(SocketName::AsyncIrb).await;
}

#[tokio::test]
async fn console_rejects_a_wrong_password_silently() {
    let mut options = test_options();
    options.connect_password = Some("1234".to_string());
    let mut ts = build_server(options, RecordingDispatcher::default()).await;
    ts.server.start_main_loop();

    let mut client = connect(&ts.server, SocketName::Irb).await;
    write_scalar(&mut client, b"wrong").await.expect("handshake");

    assert!(read_response(&mut client).await.is_empty());
}

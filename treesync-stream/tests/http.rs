//! HTTP connector tests against a loopback server.

use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use treesync_stream::framing::encode_line;
use treesync_stream::transport::Attachment;
use treesync_stream::{
    HttpConnector, SendOptions, SendOutcome, Session, SessionConfig, SessionError, TransportError,
};

/// What the server saw for one request.
#[derive(Debug)]
struct Recorded {
    head: String,
    body: Vec<u8>,
}

impl Recorded {
    fn header(&self, name: &str) -> Option<String> {
        let prefix = format!("{}:", name.to_ascii_lowercase());
        self.head.lines().find_map(|line| {
            line.to_ascii_lowercase()
                .starts_with(&prefix)
                .then(|| line[prefix.len()..].trim().to_string())
        })
    }

    fn json(&self) -> Value {
        serde_json::from_slice(&self.body).unwrap()
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

async fn read_request(socket: &mut TcpStream) -> Recorded {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let head_end = loop {
        if let Some(end) = find(&buf, b"\r\n\r\n") {
            break end;
        }
        let n = socket.read(&mut chunk).await.unwrap();
        assert!(n > 0, "client closed before sending headers");
        buf.extend_from_slice(&chunk[..n]);
    };
    let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
    let body_start = head_end + 4;
    let length: usize = head
        .lines()
        .find_map(|l| {
            l.to_ascii_lowercase()
                .strip_prefix("content-length:")
                .map(|v| v.trim().parse().unwrap())
        })
        .unwrap_or(0);
    while buf.len() < body_start + length {
        let n = socket.read(&mut chunk).await.unwrap();
        assert!(n > 0, "client closed mid-body");
        buf.extend_from_slice(&chunk[..n]);
    }
    Recorded {
        head,
        body: buf[body_start..body_start + length].to_vec(),
    }
}

/// Serve one canned response per accepted connection, then close it.
async fn serve(responses: Vec<String>) -> (String, mpsc::UnboundedReceiver<Recorded>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        for response in responses {
            let (mut socket, _) = listener.accept().await.unwrap();
            let request = read_request(&mut socket).await;
            let _ = tx.send(request);
            socket.write_all(response.as_bytes()).await.unwrap();
            let _ = socket.shutdown().await;
        }
    });
    (format!("http://{addr}/api/stream"), rx)
}

fn ok(body: &str) -> String {
    format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    )
}

/// Chunked response cut off before its terminating chunk.
fn truncated(body: &str) -> String {
    format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n{:x}\r\n{body}\r\n",
        body.len()
    )
}

fn status(code: u16, reason: &str) -> String {
    format!("HTTP/1.1 {code} {reason}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
}

fn lines(payloads: &[Value], done: bool) -> String {
    let mut out: String = payloads.iter().map(encode_line).collect();
    if done {
        out.push_str("data: [DONE]\n");
    }
    out
}

fn session_for(url: &str) -> Session {
    let config = SessionConfig::for_testing(url);
    let connector = HttpConnector::new(&config.stream).unwrap();
    Session::new(config, std::sync::Arc::new(connector))
}

#[tokio::test]
async fn test_http_stream_end_to_end() {
    let body = lines(
        &[
            json!({"op": "set", "path": "/root", "value": "hello"}),
            json!({"op": "add", "path": "/elements/hello", "value": {"type": "Text", "props": {"text": "hi"}}}),
            json!({"op": "message", "content": "Said hi."}),
        ],
        true,
    );
    let second = lines(&[json!({"op": "set", "path": "/elements/hello/props/text", "value": "hey"})], true);
    let (url, mut requests) = serve(vec![ok(&body), ok(&second)]).await;
    let mut session = session_for(&url);

    let first = timeout(Duration::from_secs(10), session.send("say hi", SendOptions::default()))
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(first, SendOutcome::Completed { .. }));
    assert_eq!(session.tree().get("hello").unwrap().props["text"], "hi");

    let request = requests.recv().await.unwrap();
    assert!(request.head.starts_with("POST /api/stream"));
    assert!(request.header("x-idempotency-key").is_some());
    assert!(request.header("x-resume-after-sequence").is_none());
    assert!(request.header("content-type").unwrap().starts_with("application/json"));
    let json = request.json();
    assert_eq!(json["prompt"], "say hi");
    assert_eq!(json["turnId"], first.turn_id());

    session.send("louder", SendOptions::default()).await.unwrap();
    assert_eq!(session.tree().get("hello").unwrap().props["text"], "hey");
    let request = requests.recv().await.unwrap();
    let json = request.json();
    assert_eq!(json["messages"][0], json!({"role": "user", "content": "say hi"}));
    assert_eq!(json["messages"][1], json!({"role": "assistant", "content": "Said hi."}));
    assert_eq!(json["currentTree"]["root"], "hello");
}

#[tokio::test]
async fn test_http_reconnect_sends_resume_header() {
    let first = lines(
        &[
            json!({"op": "add", "path": "/elements/list", "value": {"type": "List"}, "sequence": 1}),
            json!({"op": "add", "path": "/elements/list/children/-", "value": "a", "sequence": 2}),
        ],
        false,
    );
    let second = lines(
        &[
            json!({"op": "add", "path": "/elements/list/children/-", "value": "a", "sequence": 2}),
            json!({"op": "add", "path": "/elements/list/children/-", "value": "b", "sequence": 3}),
        ],
        true,
    );
    let (url, mut requests) = serve(vec![truncated(&first), ok(&second)]).await;
    let mut session = session_for(&url);

    let outcome = timeout(Duration::from_secs(10), session.send("list", SendOptions::default()))
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(outcome, SendOutcome::Completed { .. }));
    assert_eq!(session.tree().get("list").unwrap().children, vec!["a", "b"]);

    let initial = requests.recv().await.unwrap();
    let retry = requests.recv().await.unwrap();
    assert_eq!(initial.header("x-resume-after-sequence"), None);
    assert_eq!(retry.header("x-resume-after-sequence").as_deref(), Some("2"));
    assert_eq!(
        retry.header("x-idempotency-key"),
        initial.header("x-idempotency-key")
    );
}

#[tokio::test]
async fn test_http_server_error_is_retried() {
    let body = lines(&[json!({"op": "set", "path": "/root", "value": "x"})], true);
    let (url, mut requests) = serve(vec![status(503, "Service Unavailable"), ok(&body)]).await;
    let mut session = session_for(&url);

    session.send("x", SendOptions::default()).await.unwrap();
    assert_eq!(session.tree().root(), "x");
    assert!(requests.recv().await.is_some());
    assert!(requests.recv().await.is_some());
}

#[tokio::test]
async fn test_http_client_error_is_not_retried() {
    let (url, mut requests) = serve(vec![status(401, "Unauthorized")]).await;
    let mut session = session_for(&url);

    let err = session.send("x", SendOptions::default()).await.unwrap_err();
    assert!(matches!(
        err,
        SessionError::Transport(TransportError::Status { status: 401, .. })
    ));
    assert!(requests.recv().await.is_some());
    assert!(requests.try_recv().is_err());
}

#[tokio::test]
async fn test_http_attachments_use_multipart() {
    let body = lines(&[json!({"op": "set", "path": "/root", "value": "doc"})], true);
    let (url, mut requests) = serve(vec![ok(&body)]).await;
    let mut session = session_for(&url);

    let options = SendOptions {
        attachments: vec![Attachment::new("notes.txt", "text/plain", b"remember the milk".to_vec())],
        ..SendOptions::default()
    };
    session.send("summarize", options).await.unwrap();

    let request = requests.recv().await.unwrap();
    assert!(request
        .header("content-type")
        .unwrap()
        .starts_with("multipart/form-data; boundary="));
    let body = String::from_utf8_lossy(&request.body);
    assert!(body.contains("name=\"payload\""));
    assert!(body.contains("\"prompt\":\"summarize\""));
    assert!(body.contains("name=\"files\"; filename=\"notes.txt\""));
    assert!(body.contains("remember the milk"));
}

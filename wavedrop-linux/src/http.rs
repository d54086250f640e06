//! Relay HTTP service: accept connections on localhost/LAN, parse requests with httparse, route to the store.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use wavedrop_core::{MemoryRelayStore, RelayStore};

/// Largest request (head plus body) accepted.
const MAX_REQUEST: usize = 1 << 20;

const PURGE_INTERVAL: Duration = Duration::from_secs(30);

pub type SharedStore = Arc<Mutex<MemoryRelayStore>>;

/// Bind and serve until the listener fails. Expired records are purged in the background.
pub async fn run_relay(bind: SocketAddr, store: SharedStore, ttl: Duration) -> std::io::Result<()> {
    let listener = TcpListener::bind(bind).await?;
    info!(addr = %listener.local_addr()?, "relay listening");
    let purge_store = store.clone();
    tokio::spawn(async move { purge_loop(purge_store, ttl).await });
    serve(listener, store).await
}

pub async fn serve(listener: TcpListener, store: SharedStore) -> std::io::Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let store = store.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_client(stream, store).await {
                debug!(%peer, error = %e, "relay connection ended with error");
            }
        });
    }
}

async fn purge_loop(store: SharedStore, ttl: Duration) {
    loop {
        tokio::time::sleep(PURGE_INTERVAL).await;
        store.lock().await.purge_older_than(ttl, SystemTime::now());
    }
}

/// HTTP status and JSON body.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub status: u16,
    pub body: Value,
}

impl Response {
    fn ok(body: Value) -> Self {
        Self { status: 200, body }
    }

    fn error(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            body: json!({ "error": message.into() }),
        }
    }

    fn to_bytes(&self) -> Vec<u8> {
        let body = self.body.to_string();
        let head = format!(
            "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nAccess-Control-Allow-Origin: *\r\nConnection: close\r\n\r\n",
            self.status,
            reason(self.status),
            body.len()
        );
        let mut out = head.into_bytes();
        out.extend_from_slice(body.as_bytes());
        out
    }
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        413 => "Payload Too Large",
        _ => "Internal Server Error",
    }
}

/// Request line and the headers we care about.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Head {
    method: String,
    target: String,
    header_len: usize,
    content_length: usize,
}

impl Head {
    /// Head plus declared body. Saturates so a hostile Content-Length cannot wrap.
    fn request_len(&self) -> usize {
        self.header_len.saturating_add(self.content_length)
    }
}

/// Parse the request head. `Ok(None)` means more bytes are needed.
fn parse_head(buf: &[u8]) -> Result<Option<Head>, String> {
    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut req = httparse::Request::new(&mut headers);
    let header_len = match req.parse(buf).map_err(|e| e.to_string())? {
        httparse::Status::Complete(n) => n,
        httparse::Status::Partial => return Ok(None),
    };
    let method = req.method.ok_or("missing method")?.to_string();
    let target = req.path.ok_or("missing path")?.to_string();
    let mut content_length = 0;
    for h in req.headers.iter() {
        if h.name.eq_ignore_ascii_case("Content-Length") {
            content_length = std::str::from_utf8(h.value)
                .ok()
                .and_then(|v| v.trim().parse::<usize>().ok())
                .ok_or("invalid Content-Length")?;
        }
    }
    Ok(Some(Head {
        method,
        target,
        header_len,
        content_length,
    }))
}

async fn handle_client(mut client: TcpStream, store: SharedStore) -> std::io::Result<()> {
    let mut buf = Vec::with_capacity(4096);
    let mut chunk = vec![0u8; 8192];
    let response = loop {
        let n = client.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
        match parse_head(&buf) {
            Err(e) => break Response::error(400, e),
            Ok(Some(head)) if head.request_len() > MAX_REQUEST => {
                break Response::error(413, "Request too large");
            }
            Ok(Some(head)) if buf.len() >= head.request_len() => {
                let body = &buf[head.header_len..head.request_len()];
                let mut store = store.lock().await;
                let response = route(&head.method, &head.target, body, &mut *store);
                debug!(method = %head.method, target = %head.target, status = response.status, "relay request");
                break response;
            }
            Ok(_) if buf.len() > MAX_REQUEST => break Response::error(413, "Request too large"),
            Ok(_) => continue,
        }
    };
    client.write_all(&response.to_bytes()).await?;
    client.flush().await?;
    Ok(())
}

/// Dispatch one request against the store.
pub fn route<S: RelayStore + ?Sized>(method: &str, target: &str, body: &[u8], store: &mut S) -> Response {
    let (path, query) = target.split_once('?').unwrap_or((target, ""));
    match (method, path) {
        ("POST", "/api/save-offer") => {
            let fields = match json_body(body) {
                Ok(v) => v,
                Err(r) => return r,
            };
            let Some(offer) = non_empty_str(&fields, "offer") else {
                return Response::error(400, "Missing offer");
            };
            let id = store.put_offer(offer.to_string());
            info!(%id, "offer stored");
            Response::ok(json!({ "offerId": id }))
        }
        ("GET", "/api/get-offer") => {
            let Some(id) = query_param(query, "id") else {
                return Response::error(400, "Missing id");
            };
            match store.get_offer(id) {
                Ok(record) => Response::ok(json!({ "offer": record.token })),
                Err(_) => Response::error(404, "Not found"),
            }
        }
        ("POST", "/api/save-answer") => {
            let fields = match json_body(body) {
                Ok(v) => v,
                Err(r) => return r,
            };
            let (Some(id), Some(answer)) =
                (non_empty_str(&fields, "id"), non_empty_str(&fields, "answer"))
            else {
                return Response::error(400, "Missing fields");
            };
            match store.put_answer(id, answer.to_string()) {
                Ok(()) => {
                    info!(%id, "answer stored");
                    Response::ok(json!({ "ok": true }))
                }
                Err(e) => {
                    warn!(%id, error = %e, "answer rejected");
                    Response::error(500, e.to_string())
                }
            }
        }
        ("GET", "/api/get-answer") => {
            let Some(id) = query_param(query, "id") else {
                return Response::error(400, "Missing id");
            };
            match store.get_answer(id) {
                Ok(record) => Response::ok(json!({ "answer": record.token })),
                Err(_) => Response::error(404, "Not found"),
            }
        }
        (_, "/api/save-offer" | "/api/get-offer" | "/api/save-answer" | "/api/get-answer") => {
            Response::error(405, "Method not allowed")
        }
        _ => Response::error(404, "Not found"),
    }
}

fn json_body(body: &[u8]) -> Result<Value, Response> {
    match serde_json::from_slice::<Value>(body) {
        Ok(v @ Value::Object(_)) => Ok(v),
        Ok(_) => Err(Response::error(400, "Expected a JSON object")),
        Err(_) => Err(Response::error(400, "Invalid JSON")),
    }
}

fn non_empty_str<'a>(fields: &'a Value, name: &str) -> Option<&'a str> {
    fields
        .get(name)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}

/// Value of `name` in a query string. Empty values count as missing.
fn query_param<'a>(query: &'a str, name: &str) -> Option<&'a str> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(k, _)| *k == name)
        .map(|(_, v)| v)
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn post(store: &mut MemoryRelayStore, path: &str, body: Value) -> Response {
        route("POST", path, body.to_string().as_bytes(), store)
    }

    #[test]
    fn offer_answer_flow() {
        let mut store = MemoryRelayStore::new();
        let saved = post(&mut store, "/api/save-offer", json!({ "offer": "tok-o" }));
        assert_eq!(saved.status, 200);
        let id = saved.body["offerId"].as_str().unwrap().to_string();

        let got = route("GET", &format!("/api/get-offer?id={}", id), b"", &mut store);
        assert_eq!(got, Response::ok(json!({ "offer": "tok-o" })));

        let ans = post(
            &mut store,
            "/api/save-answer",
            json!({ "id": id, "answer": "tok-a" }),
        );
        assert_eq!(ans, Response::ok(json!({ "ok": true })));
        let got = route("GET", &format!("/api/get-answer?id={}", id), b"", &mut store);
        assert_eq!(got.body["answer"], "tok-a");
    }

    #[test]
    fn missing_inputs_are_400() {
        let mut store = MemoryRelayStore::new();
        assert_eq!(
            route("GET", "/api/get-offer", b"", &mut store),
            Response::error(400, "Missing id")
        );
        assert_eq!(route("GET", "/api/get-offer?id=", b"", &mut store).status, 400);
        assert_eq!(
            post(&mut store, "/api/save-answer", json!({ "id": "x" })),
            Response::error(400, "Missing fields")
        );
        assert_eq!(post(&mut store, "/api/save-offer", json!({})).status, 400);
        assert_eq!(
            route("POST", "/api/save-offer", b"{not json", &mut store),
            Response::error(400, "Invalid JSON")
        );
    }

    #[test]
    fn unknown_id_is_404() {
        let mut store = MemoryRelayStore::new();
        assert_eq!(
            route("GET", "/api/get-offer?id=nope", b"", &mut store),
            Response::error(404, "Not found")
        );
        assert_eq!(route("GET", "/api/get-answer?x=1&id=nope", b"", &mut store).status, 404);
    }

    #[test]
    fn duplicate_answer_is_500() {
        let mut store = MemoryRelayStore::new();
        let body = json!({ "id": "k", "answer": "a" });
        assert_eq!(post(&mut store, "/api/save-answer", body.clone()).status, 200);
        let dup = post(&mut store, "/api/save-answer", body);
        assert_eq!(dup.status, 500);
        assert!(dup.body["error"].as_str().unwrap().contains("already stored"));
    }

    #[test]
    fn routing_fallbacks() {
        let mut store = MemoryRelayStore::new();
        assert_eq!(route("GET", "/", b"", &mut store).status, 404);
        assert_eq!(route("DELETE", "/api/get-offer?id=1", b"", &mut store).status, 405);
    }

    #[test]
    fn head_parsing() {
        assert_eq!(parse_head(b"POST /api/save-offer HTTP/1.1\r\nHost: x\r\n"), Ok(None));
        let raw = b"POST /api/save-offer HTTP/1.1\r\nHost: x\r\nContent-Length: 15\r\n\r\n{\"offer\":\"abc\"}";
        let head = parse_head(raw).unwrap().unwrap();
        assert_eq!(head.method, "POST");
        assert_eq!(head.target, "/api/save-offer");
        assert_eq!(head.content_length, 15);
        assert_eq!(head.header_len + head.content_length, raw.len());
        assert!(parse_head(b"GET / HTTP/1.1\r\nContent-Length: lots\r\n\r\n").is_err());
    }

    #[test]
    fn huge_content_length_saturates() {
        let raw = b"POST /api/save-offer HTTP/1.1\r\nContent-Length: 18446744073709551615\r\n\r\n";
        let head = parse_head(raw).unwrap().unwrap();
        assert_eq!(head.content_length, usize::MAX);
        assert_eq!(head.request_len(), usize::MAX);
        assert!(head.request_len() > MAX_REQUEST);
    }

    #[tokio::test]
    async fn huge_content_length_gets_413() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let store: SharedStore = Arc::new(Mutex::new(MemoryRelayStore::new()));
        tokio::spawn(serve(listener, store.clone()));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(
                b"POST /api/save-offer HTTP/1.1\r\nHost: localhost\r\nContent-Length: 18446744073709551615\r\n\r\n",
            )
            .await
            .unwrap();
        let mut reply = String::new();
        stream.read_to_string(&mut reply).await.unwrap();
        assert!(reply.starts_with("HTTP/1.1 413 "), "{}", reply);
        assert!(reply.contains("\"error\""));
        assert!(store.lock().await.is_empty());
    }

    #[test]
    fn response_serialization() {
        let bytes = Response::error(404, "Not found").to_bytes();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(text.ends_with("\r\n\r\n{\"error\":\"Not found\"}"));
    }

    #[tokio::test]
    async fn serves_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let store: SharedStore = Arc::new(Mutex::new(MemoryRelayStore::new()));
        tokio::spawn(serve(listener, store.clone()));

        let body = r#"{"offer":"tok"}"#;
        let request = format!(
            "POST /api/save-offer HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
        );
        let mut stream = TcpStream::connect(addr).await.unwrap();
        // Split the write so the server has to wait for the body.
        let (head, tail) = request.as_bytes().split_at(40);
        stream.write_all(head).await.unwrap();
        stream.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        stream.write_all(tail).await.unwrap();
        let mut reply = String::new();
        stream.read_to_string(&mut reply).await.unwrap();
        assert!(reply.starts_with("HTTP/1.1 200 OK"), "{}", reply);
        assert!(reply.contains("offerId"));
        assert_eq!(store.lock().await.len(), 1);
    }
}

//! Shared helpers: a stub origin server and a raw HTTP/1.1 client

#![allow(dead_code)]

use slinger_wire::{MitmProxy, StorageKind, WireOptions};
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// Origin server answering every request with `200` and the request path
pub struct StubServer {
  pub addr: SocketAddr,
  hits: Arc<AtomicUsize>,
  seen: Arc<Mutex<Vec<String>>>,
}

impl StubServer {
  pub fn start() -> StubServer {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let (thread_hits, thread_seen) = (hits.clone(), seen.clone());
    thread::spawn(move || {
      for stream in listener.incoming() {
        let Ok(stream) = stream else { break };
        let hits = thread_hits.clone();
        let seen = thread_seen.clone();
        thread::spawn(move || serve(stream, hits, seen));
      }
    });
    StubServer { addr, hits, seen }
  }

  /// Number of requests that reached the origin
  pub fn hits(&self) -> usize {
    self.hits.load(Ordering::SeqCst)
  }

  /// Request lines received, e.g. `GET /html HTTP/1.1`
  pub fn seen(&self) -> Vec<String> {
    self.seen.lock().unwrap().clone()
  }

  pub fn url(&self, path: &str) -> String {
    format!("http://{}{}", self.addr, path)
  }
}

fn serve(stream: TcpStream, hits: Arc<AtomicUsize>, seen: Arc<Mutex<Vec<String>>>) {
  let mut reader = BufReader::new(stream);
  loop {
    let mut request_line = String::new();
    if reader.read_line(&mut request_line).unwrap_or(0) == 0 {
      return;
    }
    let mut content_length = 0usize;
    loop {
      let mut line = String::new();
      if reader.read_line(&mut line).unwrap_or(0) == 0 {
        return;
      }
      if line == "\r\n" {
        break;
      }
      if let Some((name, value)) = line.split_once(':') {
        if name.eq_ignore_ascii_case("content-length") {
          content_length = value.trim().parse().unwrap_or(0);
        }
      }
    }
    let mut body = vec![0u8; content_length];
    if reader.read_exact(&mut body).is_err() {
      return;
    }
    hits.fetch_add(1, Ordering::SeqCst);
    let request_line = request_line.trim_end().to_string();
    let path = request_line.split(' ').nth(1).unwrap_or("/").to_string();
    seen.lock().unwrap().push(request_line);

    let payload = format!("<html>{}</html>", path);
    let response = format!(
      "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: {}\r\n\r\n{}",
      payload.len(),
      payload
    );
    if reader.get_mut().write_all(response.as_bytes()).is_err() {
      return;
    }
  }
}

/// Raw response as received by the client
pub struct RawResponse {
  pub status: u16,
  pub head: String,
  pub body: String,
}

/// Send `method url` through the proxy and read the whole response
pub fn send(proxy: SocketAddr, method: &str, url: &str, body: &str) -> RawResponse {
  let mut stream = TcpStream::connect(proxy).unwrap();
  stream.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
  let authority = url
    .split("://")
    .nth(1)
    .and_then(|rest| rest.split('/').next())
    .unwrap_or_default();
  let request = format!(
    "{} {} HTTP/1.1\r\nHost: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
    method,
    url,
    authority,
    body.len(),
    body
  );
  stream.write_all(request.as_bytes()).unwrap();
  let mut raw = String::new();
  stream.read_to_string(&mut raw).unwrap();
  let (head, body) = raw.split_once("\r\n\r\n").unwrap_or((raw.as_str(), ""));
  let status = head
    .split(' ')
    .nth(1)
    .and_then(|s| s.parse().ok())
    .unwrap_or(0);
  RawResponse {
    status,
    head: head.to_string(),
    body: body.to_string(),
  }
}

pub fn get(proxy: SocketAddr, url: &str) -> RawResponse {
  send(proxy, "GET", url, "")
}

/// Memory backed options rooted in `dir`
pub fn options(dir: &tempfile::TempDir) -> WireOptions {
  WireOptions {
    request_storage: StorageKind::Memory,
    storage_base_dir: Some(dir.path().to_path_buf()),
    ..WireOptions::default()
  }
}

/// A started proxy that ignores proxy settings in the environment
pub fn start(options: WireOptions) -> MitmProxy {
  let proxy = MitmProxy::with_env(options, |_| None).unwrap();
  proxy.start().unwrap();
  proxy
}

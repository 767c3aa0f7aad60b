//! In-process mock servers for the ASCII device protocols.

#![allow(dead_code)]

use parking_lot::Mutex;
use rust_ieb::hardware::{DeviceIdentity, MotorLink, MotorTimeouts};
use rust_ieb::protocol::DeviceClass;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// Scripted reply to one request.
#[derive(Clone, Debug)]
pub enum Scripted {
    /// Send these bytes.
    Reply(Vec<u8>),
    /// Send these bytes after a delay.
    Delayed(Duration, Vec<u8>),
    /// Never answer.
    Silent,
    /// Close the connection without answering.
    Hangup,
}

#[derive(Debug)]
struct ControllerState {
    bits: [u8; 8],
    open_pair: [u8; 2],
    received: Vec<String>,
    scripted: HashMap<String, VecDeque<Scripted>>,
}

/// Motor controller speaking `STX ENQ <code> CR`.
///
/// Open/close/home update the position pair; `IS` reports the current bits.
pub struct MockController {
    addr: SocketAddr,
    state: Arc<Mutex<ControllerState>>,
    task: JoinHandle<()>,
}

impl MockController {
    /// Starts a controller for `class` with the given initial status bits.
    pub async fn start(class: DeviceClass, bits: &str) -> Self {
        let open_pair = match class {
            DeviceClass::HartmannLeft => *b"01",
            _ => *b"10",
        };
        let mut initial = [b'0'; 8];
        initial.copy_from_slice(bits.as_bytes());

        let state = Arc::new(Mutex::new(ControllerState {
            bits: initial,
            open_pair,
            received: Vec::new(),
            scripted: HashMap::new(),
        }));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shared = state.clone();
        let task = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let state = shared.clone();
                tokio::spawn(async move {
                    let mut reader = BufReader::new(stream);
                    let mut request = Vec::new();
                    if reader.read_until(b'\r', &mut request).await.unwrap_or(0) == 0 {
                        return;
                    }
                    let reply = respond(&state, &request);
                    let mut stream = reader.into_inner();
                    match reply {
                        Scripted::Reply(bytes) => {
                            let _ = stream.write_all(&bytes).await;
                        }
                        Scripted::Delayed(delay, bytes) => {
                            tokio::time::sleep(delay).await;
                            let _ = stream.write_all(&bytes).await;
                        }
                        Scripted::Silent => {
                            tokio::time::sleep(Duration::from_secs(30)).await;
                        }
                        Scripted::Hangup => return,
                    }
                    let _ = stream.flush().await;
                    // Hold the socket until the client closes it.
                    let mut sink = Vec::new();
                    let _ = tokio::time::timeout(
                        Duration::from_secs(5),
                        tokio::io::AsyncReadExt::read_to_end(&mut stream, &mut sink),
                    )
                    .await;
                });
            }
        });

        Self { addr, state, task }
    }

    /// `host:port` of the controller.
    pub fn endpoint(&self) -> String {
        self.addr.to_string()
    }

    /// Command codes received so far, in order.
    pub fn received(&self) -> Vec<String> {
        self.state.lock().received.clone()
    }

    /// How many times `code` was received.
    pub fn count(&self, code: &str) -> usize {
        self.state.lock().received.iter().filter(|c| *c == code).count()
    }

    /// Current status bits.
    pub fn bits(&self) -> String {
        String::from_utf8_lossy(&self.state.lock().bits).into_owned()
    }

    /// Queues a one-shot scripted reply for the next `code` request.
    pub fn script(&self, code: &str, reply: Scripted) {
        self.state
            .lock()
            .scripted
            .entry(code.to_string())
            .or_default()
            .push_back(reply);
    }

    /// A link to this controller with short test deadlines.
    pub fn link(&self, unit: &str, class: DeviceClass) -> MotorLink {
        MotorLink::new(DeviceIdentity::new(unit, class, self.endpoint()), test_timeouts())
    }
}

impl Drop for MockController {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn respond(state: &Mutex<ControllerState>, request: &[u8]) -> Scripted {
    let mut state = state.lock();

    let body = request
        .strip_prefix(b"\x00\x07")
        .and_then(|r| r.strip_suffix(b"\r"))
        .unwrap_or(request);
    let code = String::from_utf8_lossy(body).into_owned();
    state.received.push(code.clone());

    if let Some(reply) = state.scripted.get_mut(&code).and_then(VecDeque::pop_front) {
        return reply;
    }

    let open = state.open_pair;
    let closed = [open[1], open[0]];
    match code.as_str() {
        "IS" => {
            let mut reply = b"\x00\x07IS=".to_vec();
            reply.extend_from_slice(&state.bits);
            reply.push(b'\r');
            return Scripted::Reply(reply);
        }
        "QX3" => state.bits[..2].copy_from_slice(&open),
        "QX4" | "QX2" => state.bits[..2].copy_from_slice(&closed),
        _ => {}
    }
    Scripted::Reply(b"\x00\x07%DONE\r".to_vec())
}

/// Deadlines short enough for tests.
pub fn test_timeouts() -> MotorTimeouts {
    MotorTimeouts {
        connect: Duration::from_millis(500),
        command: Duration::from_millis(200),
        transit: Duration::from_millis(400),
    }
}

/// Line-oriented ASCII device: each request up to `terminator` is answered by
/// the handler.
pub struct MockLineServer {
    addr: SocketAddr,
    requests: Arc<Mutex<Vec<String>>>,
    task: JoinHandle<()>,
}

impl MockLineServer {
    /// Starts a server; `handler` gets the request index and text.
    pub async fn start<F>(terminator: u8, handler: F) -> Self
    where
        F: Fn(usize, &str) -> Scripted + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let handler = Arc::new(handler);

        let shared = requests.clone();
        let task = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let requests = shared.clone();
                let handler = handler.clone();
                tokio::spawn(async move {
                    let mut reader = BufReader::new(stream);
                    let mut request = Vec::new();
                    if reader.read_until(terminator, &mut request).await.unwrap_or(0) == 0 {
                        return;
                    }
                    let text = String::from_utf8_lossy(&request).into_owned();
                    let reply = {
                        let mut requests = requests.lock();
                        requests.push(text.clone());
                        handler(requests.len() - 1, &text)
                    };
                    let mut stream = reader.into_inner();
                    match reply {
                        Scripted::Reply(bytes) => {
                            let _ = stream.write_all(&bytes).await;
                        }
                        Scripted::Delayed(delay, bytes) => {
                            tokio::time::sleep(delay).await;
                            let _ = stream.write_all(&bytes).await;
                        }
                        Scripted::Silent => {
                            tokio::time::sleep(Duration::from_secs(30)).await;
                        }
                        Scripted::Hangup => return,
                    }
                    let _ = stream.flush().await;
                    let mut sink = Vec::new();
                    let _ = tokio::time::timeout(
                        Duration::from_secs(5),
                        tokio::io::AsyncReadExt::read_to_end(&mut stream, &mut sink),
                    )
                    .await;
                });
            }
        });

        Self {
            addr,
            requests,
            task,
        }
    }

    /// `host:port` of the server.
    pub fn endpoint(&self) -> String {
        self.addr.to_string()
    }

    /// Requests received so far.
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().clone()
    }
}

impl Drop for MockLineServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// An endpoint nothing listens on.
pub async fn refused_endpoint() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr.to_string()
}

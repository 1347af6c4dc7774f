//! Shared helpers for exercising the fetch and verification pipelines
//! against in-process collaborators.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        Mutex,
    },
};

use tokio::{
    io::{
        AsyncReadExt,
        AsyncWriteExt,
    },
    net::TcpListener,
};

/// Minimal HTTP server standing in for a content gateway. Routes are
/// registered per path; each registered response is served once, with the
/// last one repeating.
#[derive(Clone)]
pub struct MockGateway {
    pub base_url: String,
    state: Arc<Mutex<GatewayState>>,
}

#[derive(Default)]
struct GatewayState {
    routes: HashMap<String, Vec<(u16, Vec<u8>)>>,
    requests: HashMap<String, usize>,
}

impl MockGateway {
    pub async fn spawn() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(Mutex::new(GatewayState::default()));

        let server_state = Arc::clone(&state);
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let state = Arc::clone(&server_state);
                tokio::spawn(handle_connection(stream, state));
            }
        });

        Self {
            base_url: format!("http://{addr}/"),
            state,
        }
    }

    /// Registers a response for a path (no leading slash).
    pub fn route(&self, path: &str, status: u16, body: impl Into<Vec<u8>>) {
        self.state
            .lock()
            .unwrap()
            .routes
            .entry(format!("/{path}"))
            .or_default()
            .push((status, body.into()));
    }

    /// Number of requests served for a path (no leading slash).
    pub fn requests(&self, path: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .requests
            .get(&format!("/{path}"))
            .copied()
            .unwrap_or(0)
    }
}

async fn handle_connection(mut stream: tokio::net::TcpStream, state: Arc<Mutex<GatewayState>>) {
    let mut buffer = Vec::new();
    loop {
        // Accumulate until the end of the request head; gateway requests
        // are bodyless GETs.
        let head_end = loop {
            if let Some(pos) = find_head_end(&buffer) {
                break pos;
            }
            let mut chunk = [0u8; 1024];
            match stream.read(&mut chunk).await {
                Ok(0) | Err(_) => return,
                Ok(n) => buffer.extend_from_slice(&chunk[..n]),
            }
        };

        let head = String::from_utf8_lossy(&buffer[..head_end]).into_owned();
        buffer.drain(..head_end + 4);

        let path = head
            .lines()
            .next()
            .and_then(|line| line.split_whitespace().nth(1))
            .unwrap_or("/")
            .to_owned();

        let (status, body) = {
            let mut state = state.lock().unwrap();
            *state.requests.entry(path.clone()).or_default() += 1;
            match state.routes.get_mut(&path) {
                Some(responses) if responses.len() > 1 => responses.remove(0),
                Some(responses) => responses[0].clone(),
                None => (404, b"not found".to_vec()),
            }
        };

        let reason = match status {
            200 => "OK",
            404 => "Not Found",
            _ => "Error",
        };
        let response = format!(
            "HTTP/1.1 {status} {reason}\r\ncontent-length: {}\r\n\r\n",
            body.len()
        );
        if stream.write_all(response.as_bytes()).await.is_err() {
            return;
        }
        if stream.write_all(&body).await.is_err() {
            return;
        }
    }
}

fn find_head_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(4).position(|window| window == b"\r\n\r\n")
}

/// Encodes a CBOR auxdata segment (map of text keys to byte strings followed
/// by the two-byte big-endian length) as the Solidity compiler appends it to
/// runtime bytecode.
pub fn encode_auxdata(entries: Vec<(&str, Vec<u8>)>) -> Vec<u8> {
    use ciborium::value::Value;

    let map = Value::Map(
        entries
            .into_iter()
            .map(|(key, value)| (Value::Text(key.to_owned()), Value::Bytes(value)))
            .collect(),
    );
    let mut cbor = Vec::new();
    ciborium::into_writer(&map, &mut cbor).unwrap();
    let len = cbor.len() as u16;
    cbor.extend_from_slice(&len.to_be_bytes());
    cbor
}

/// Runtime bytecode with the given body and auxdata entries appended.
pub fn code_with_auxdata(body: &[u8], entries: Vec<(&str, Vec<u8>)>) -> Vec<u8> {
    let mut code = body.to_vec();
    code.extend_from_slice(&encode_auxdata(entries));
    code
}

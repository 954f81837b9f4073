use std::{
    collections::HashMap,
    convert::Infallible,
    future::Future,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, RwLock,
    },
};

use anyhow::{Context, Result};
use hyper::service::{make_service_fn, service_fn};
use hyper::{body, Body, Method, Request, Response, Server, StatusCode};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Deterministic EVM-like chain served over JSON-RPC.
#[derive(Clone)]
pub struct MockChain {
    best: Arc<AtomicU64>,
    finalized: Arc<AtomicU64>,
    failing: Arc<AtomicBool>,
    block_requests: Arc<AtomicUsize>,
}

impl MockChain {
    pub fn new(finalized: u64, best: u64) -> Self {
        Self {
            best: Arc::new(AtomicU64::new(best)),
            finalized: Arc::new(AtomicU64::new(finalized)),
            failing: Arc::new(AtomicBool::new(false)),
            block_requests: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn set_heights(&self, finalized: u64, best: u64) {
        self.best.store(best, Ordering::SeqCst);
        self.finalized.store(finalized, Ordering::SeqCst);
    }

    /// Answers every call with a server error while set.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn genesis_hash(&self) -> String {
        block_hash(0)
    }

    /// Number of `eth_getBlockByNumber` calls for explicit heights, genesis included.
    pub fn block_requests(&self) -> usize {
        self.block_requests.load(Ordering::SeqCst)
    }

    fn block(&self, height: u64) -> Value {
        if height > self.best.load(Ordering::SeqCst) {
            return Value::Null;
        }
        let parent_hash = height
            .checked_sub(1)
            .map(block_hash)
            .unwrap_or_else(|| block_hash(u64::MAX));
        json!({
            "number": format!("{height:#x}"),
            "hash": block_hash(height),
            "parentHash": parent_hash,
            "timestamp": format!("{:#x}", 1_700_000_000 + height * 2),
            "transactions": [],
        })
    }

    fn handle_call(&self, call: Value) -> Value {
        let id = call.get("id").cloned().unwrap_or(Value::Null);
        let method = call
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let params = call
            .get("params")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        if self.failing.load(Ordering::SeqCst) {
            return error(id, -32000, "node unavailable");
        }

        match method.as_str() {
            "eth_blockNumber" => success(
                id,
                Value::String(format!("{:#x}", self.best.load(Ordering::SeqCst))),
            ),
            "eth_getBlockByNumber" => {
                match params.first().and_then(Value::as_str) {
                    Some("finalized") => {
                        success(id, self.block(self.finalized.load(Ordering::SeqCst)))
                    }
                    Some("latest") => success(id, self.block(self.best.load(Ordering::SeqCst))),
                    Some(raw) => match parse_quantity(raw) {
                        Some(height) => {
                            self.block_requests.fetch_add(1, Ordering::SeqCst);
                            success(id, self.block(height))
                        }
                        None => error(id, -32602, format!("invalid block tag {raw}")),
                    },
                    None => error(id, -32602, "missing block tag"),
                }
            }
            _ => error(id, -32601, format!("unknown method {method}")),
        }
    }
}

fn block_hash(height: u64) -> String {
    format!("0x{:064x}", height ^ 0x5eed_0000_0000)
}

fn parse_quantity(raw: &str) -> Option<u64> {
    let digits = raw.strip_prefix("0x")?;
    u64::from_str_radix(digits, 16).ok()
}

/// Dictionary answering log queries from per-address height lists.
#[derive(Clone)]
pub struct MockDictionary {
    inner: Arc<RwLock<MockDictionaryInner>>,
    queries: Arc<AtomicUsize>,
}

struct MockDictionaryInner {
    genesis_hash: String,
    last_processed_height: u64,
    logs_by_address: HashMap<String, Vec<u64>>,
}

impl MockDictionary {
    pub fn new(genesis_hash: impl Into<String>, last_processed_height: u64) -> Self {
        Self {
            inner: Arc::new(RwLock::new(MockDictionaryInner {
                genesis_hash: genesis_hash.into(),
                last_processed_height,
                logs_by_address: HashMap::new(),
            })),
            queries: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_logs(self, address: &str, heights: Vec<u64>) -> Self {
        self.inner
            .write()
            .expect("mock dictionary poisoned")
            .logs_by_address
            .insert(address.to_ascii_lowercase(), heights);
        self
    }

    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    fn answer(&self, request: Value) -> Value {
        self.queries.fetch_add(1, Ordering::SeqCst);
        let query = request
            .get("query")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let start = number_after(&query, "greaterThanOrEqualTo: \"").unwrap_or(0);
        let end = number_after(&query, "lessThan: \"").unwrap_or(u64::MAX);
        let first = number_after(&query, "first: ").unwrap_or(u64::MAX) as usize;

        let inner = self.inner.read().expect("mock dictionary poisoned");
        let mut heights: Vec<u64> = inner
            .logs_by_address
            .iter()
            .filter(|(address, _)| query.contains(address.as_str()))
            .flat_map(|(_, heights)| heights.iter().copied())
            .filter(|height| (start..end).contains(height))
            .collect();
        heights.sort_unstable();
        heights.dedup();
        heights.truncate(first);

        let nodes: Vec<Value> = heights
            .into_iter()
            .map(|height| json!({ "blockHeight": height.to_string() }))
            .collect();

        json!({
            "data": {
                "_metadata": {
                    "lastProcessedHeight": inner.last_processed_height,
                    "genesisHash": inner.genesis_hash,
                },
                "logs": { "nodes": nodes },
            }
        })
    }
}

fn number_after(haystack: &str, marker: &str) -> Option<u64> {
    let tail = &haystack[haystack.find(marker)? + marker.len()..];
    let digits: String = tail.chars().take_while(char::is_ascii_digit).collect();
    digits.parse().ok()
}

/// Local HTTP server answering POSTed JSON documents.
pub struct MockHttpServer {
    url: String,
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl MockHttpServer {
    /// Serves JSON-RPC calls, single or batched, against `chain`.
    pub async fn start(chain: MockChain) -> Result<Self> {
        Self::serve(move |payload| {
            let chain = chain.clone();
            async move {
                match payload {
                    Value::Array(calls) => Value::Array(
                        calls
                            .into_iter()
                            .map(|call| chain.handle_call(call))
                            .collect(),
                    ),
                    call => chain.handle_call(call),
                }
            }
        })
        .await
    }

    /// Serves GraphQL queries against `dictionary`.
    pub async fn start_dictionary(dictionary: MockDictionary) -> Result<Self> {
        Self::serve(move |payload| {
            let dictionary = dictionary.clone();
            async move { dictionary.answer(payload) }
        })
        .await
    }

    async fn serve<F, Fut>(respond: F) -> Result<Self>
    where
        F: Fn(Value) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = Value> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .context("failed to bind mock listener")?;
        let addr = listener
            .local_addr()
            .context("failed to read mock listener address")?;
        let std_listener = listener
            .into_std()
            .context("failed to convert mock listener")?;
        std_listener
            .set_nonblocking(true)
            .context("failed to set mock listener non-blocking")?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let make_service = make_service_fn(move |_| {
            let respond = respond.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |req| serve_request(respond.clone(), req)))
            }
        });

        let server = Server::from_tcp(std_listener)
            .context("failed to build mock HTTP server")?
            .serve(make_service);
        let graceful = server.with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        });

        let handle = tokio::spawn(async move {
            if let Err(err) = graceful.await {
                eprintln!("mock server stopped: {err}");
            }
        });

        Ok(Self {
            url: format!("http://{}", addr),
            shutdown: Some(shutdown_tx),
            handle: Some(handle),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

async fn serve_request<F, Fut>(respond: F, req: Request<Body>) -> Result<Response<Body>, Infallible>
where
    F: Fn(Value) -> Fut,
    Fut: Future<Output = Value>,
{
    if req.method() != Method::POST {
        let mut response = Response::new(Body::from("Unsupported method"));
        *response.status_mut() = StatusCode::METHOD_NOT_ALLOWED;
        return Ok(response);
    }

    let bytes = match body::to_bytes(req.into_body()).await {
        Ok(bytes) => bytes,
        Err(err) => {
            let mut response = Response::new(Body::from(format!("failed to read body: {err}")));
            *response.status_mut() = StatusCode::BAD_REQUEST;
            return Ok(response);
        }
    };

    let payload: Value = match serde_json::from_slice(&bytes) {
        Ok(value) => value,
        Err(err) => {
            let mut response = Response::new(Body::from(format!("invalid JSON payload: {err}")));
            *response.status_mut() = StatusCode::BAD_REQUEST;
            return Ok(response);
        }
    };

    let response_value = respond(payload).await;
    let mut response = Response::new(Body::from(response_value.to_string()));
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    Ok(response)
}

fn success(id: Value, result: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "result": result,
        "id": id,
    })
}

fn error(id: Value, code: i64, message: impl Into<String>) -> Value {
    json!({
        "jsonrpc": "2.0",
        "error": {
            "code": code,
            "message": message.into(),
        },
        "id": id,
    })
}

#![allow(dead_code)]

use bytes::Bytes;
use courier::{Client, ClientBuilder, CompletionQueue, HttpError, Outcome, RequestBuilder, Task};
use courier::{Transport, TransportFuture};
use http::{Request, Response};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;

pub const BASE_URL: &str = "https://api.example.com/v1/";

/// One scripted transport reply.
pub enum Step {
    Respond {
        status: u16,
        headers: Vec<(&'static str, String)>,
        body: Bytes,
    },
    /// Fails like a dropped connection
    NetworkFailure,
    /// Never resolves
    Hang,
}

impl Step {
    pub fn status(status: u16) -> Self {
        Step::Respond {
            status,
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    pub fn json(status: u16, body: &str) -> Self {
        Step::Respond {
            status,
            headers: vec![("content-type", "application/json".to_owned())],
            body: Bytes::from(body.to_owned()),
        }
    }

    pub fn text(status: u16, body: &str) -> Self {
        Step::Respond {
            status,
            headers: vec![("content-type", "text/plain".to_owned())],
            body: Bytes::from(body.to_owned()),
        }
    }

    pub fn with_header(mut self, name: &'static str, value: &str) -> Self {
        if let Step::Respond { headers, .. } = &mut self {
            headers.push((name, value.to_owned()));
        }
        self
    }

    fn into_future(self) -> TransportFuture {
        match self {
            Step::Respond {
                status,
                headers,
                body,
            } => {
                let mut builder = Response::builder().status(status);
                for (name, value) in headers {
                    builder = builder.header(name, value);
                }
                let response = builder.body(body).map_err(HttpError::from);
                Box::pin(async move { response })
            }
            Step::NetworkFailure => Box::pin(async {
                Err(HttpError::Transport(Box::new(std::io::Error::new(
                    std::io::ErrorKind::ConnectionReset,
                    "connection reset by peer",
                ))))
            }),
            Step::Hang => Box::pin(std::future::pending()),
        }
    }
}

type Responder = Box<dyn Fn(&Request<Bytes>) -> Step + Send + Sync>;

enum Script {
    Queue(Mutex<VecDeque<Step>>),
    Fn(Responder),
}

/// In-memory transport replaying a script and recording every request.
pub struct ScriptedTransport {
    script: Script,
    requests: Mutex<Vec<Request<Bytes>>>,
    calls: AtomicUsize,
}

impl ScriptedTransport {
    pub fn new(steps: impl IntoIterator<Item = Step>) -> Arc<Self> {
        Arc::new(Self {
            script: Script::Queue(Mutex::new(steps.into_iter().collect())),
            requests: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn from_fn<F>(respond: F) -> Arc<Self>
    where
        F: Fn(&Request<Bytes>) -> Step + Send + Sync + 'static,
    {
        Arc::new(Self {
            script: Script::Fn(Box::new(respond)),
            requests: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Header value of the `index`-th recorded request
    pub fn header(&self, index: usize, name: &str) -> Option<String> {
        self.requests
            .lock()
            .get(index)
            .and_then(|r| r.headers().get(name))
            .map(|v| v.to_str().unwrap().to_owned())
    }

    pub fn uri(&self, index: usize) -> String {
        self.requests.lock()[index].uri().to_string()
    }
}

impl Transport for ScriptedTransport {
    fn send(&self, request: Request<Bytes>) -> TransportFuture {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let step = match &self.script {
            Script::Queue(steps) => steps
                .lock()
                .pop_front()
                .unwrap_or_else(|| Step::text(599, "script exhausted")),
            Script::Fn(respond) => respond(&request),
        };
        self.requests.lock().push(request);
        step.into_future()
    }
}

pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter("courier=debug")
        .with_test_writer()
        .try_init()
        .ok();
}

pub fn builder(transport: Arc<ScriptedTransport>) -> ClientBuilder {
    init_tracing();
    Client::builder()
        .transport(transport)
        .base_url(BASE_URL)
        .completion_queue(CompletionQueue::Inline)
}

pub fn client(transport: Arc<ScriptedTransport>) -> Client {
    builder(transport).build().unwrap()
}

/// Create, resume and await a data task.
pub async fn run_task(request: RequestBuilder) -> (Task, Outcome<Bytes>) {
    let (task, rx) = start_task(request);
    task.resume();
    let outcome = wait_outcome(rx).await;
    (task, outcome)
}

/// Create a data task without resuming it.
pub fn start_task(request: RequestBuilder) -> (Task, oneshot::Receiver<Outcome<Bytes>>) {
    let (tx, rx) = oneshot::channel();
    let task = request
        .create_data_task(move |outcome| {
            tx.send(outcome).ok();
        })
        .unwrap();
    (task, rx)
}

pub async fn wait_outcome<T>(rx: oneshot::Receiver<Outcome<T>>) -> Outcome<T> {
    tokio::time::timeout(Duration::from_secs(5), rx)
        .await
        .expect("task did not complete in time")
        .expect("completion dropped")
}

/// Poll `cond` until it holds or a second elapses.
pub async fn eventually(cond: impl Fn() -> bool) {
    for _ in 0..100 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

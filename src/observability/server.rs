use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::mpsc;
use std::thread::JoinHandle;

use anyhow::{Result, anyhow};
use hyper::body::Bytes;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, StatusCode};
use tokio::sync::oneshot;

use super::MetricsCollector;
use crate::queue::JobQueue;

/// Serves `/metrics`, `/metrics.json` and `/jobs.json` while a batch runs.
pub struct MetricsServer {
    shutdown_tx: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
    address: SocketAddr,
}

#[derive(Clone)]
struct ServerState {
    collector: MetricsCollector,
    queue: Arc<JobQueue>,
}

impl MetricsServer {
    pub fn start(listen: SocketAddr, collector: MetricsCollector, queue: Arc<JobQueue>) -> Result<Self> {
        let (tx, rx) = oneshot::channel::<()>();
        let (addr_tx, addr_rx) = mpsc::channel::<Result<SocketAddr, String>>();
        let state = ServerState { collector, queue };

        let thread = std::thread::spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(err) => {
                    let _ = addr_tx.send(Err(format!("failed to build metrics runtime: {err}")));
                    return;
                }
            };

            runtime.block_on(async move {
                let make_svc = make_service_fn(move |_| {
                    let state = state.clone();
                    async move {
                        Ok::<_, hyper::Error>(service_fn(move |req| {
                            let state = state.clone();
                            async move { handle_request(req, state).await }
                        }))
                    }
                });

                let builder = match hyper::Server::try_bind(&listen) {
                    Ok(builder) => builder,
                    Err(err) => {
                        let _ = addr_tx.send(Err(format!("failed to bind {listen}: {err}")));
                        return;
                    }
                };
                let _ = addr_tx.send(Ok(builder.local_addr()));
                let server = builder.serve(make_svc);
                let graceful = server.with_graceful_shutdown(async move {
                    let _ = rx.await;
                });

                if let Err(err) = graceful.await {
                    tracing::error!(error = %err, "Metrics server error");
                }
            });
        });

        let address = addr_rx
            .recv()
            .map_err(|_| anyhow!("metrics server exited before binding"))?
            .map_err(|message| anyhow!(message))?;
        tracing::info!(%address, "Metrics server listening");

        Ok(Self {
            shutdown_tx: Some(tx),
            thread: Some(thread),
            address,
        })
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for MetricsServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn json_response(body: Vec<u8>) -> Response<Body> {
    let mut response = Response::new(Body::from(body));
    if let Ok(value) = "application/json".parse() {
        response.headers_mut().insert(hyper::header::CONTENT_TYPE, value);
    }
    response
}

async fn handle_request(
    req: Request<Body>,
    state: ServerState,
) -> Result<Response<Body>, hyper::Error> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => {
            let body = state.collector.snapshot().to_prometheus();
            Ok(Response::new(Body::from(body)))
        }
        (&Method::GET, "/metrics.json") => {
            let snapshot = state.collector.snapshot();
            let body = serde_json::to_vec(&snapshot).unwrap_or_else(|_| b"{}".to_vec());
            Ok(json_response(body))
        }
        (&Method::GET, "/jobs.json") => {
            let jobs = state.queue.jobs();
            let body = serde_json::to_vec(&jobs).unwrap_or_else(|_| b"[]".to_vec());
            Ok(json_response(body))
        }
        _ => {
            let mut response = Response::new(Body::from(Bytes::from_static(b"Not Found")));
            *response.status_mut() = StatusCode::NOT_FOUND;
            Ok(response)
        }
    }
}

//! Liveness and metrics HTTP surface.
//!
//! Serves `GET /healthz`, `GET /metrics`, and `POST /shutdown` from a
//! dedicated thread over a non-blocking listener. `/healthz` stays green
//! as long as this thread runs; failures elsewhere are visible only via
//! `/metrics` and the log stream.

use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, Result};

use crate::metrics::Metrics;

const MAX_REQUEST_BYTES: usize = 8192;
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(100);
const READ_TIMEOUT: Duration = Duration::from_secs(2);

pub const SERVICE_NAME: &str = "kvs-infer";

#[derive(Debug)]
pub struct HttpHandle {
    pub addr: SocketAddr,
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl HttpHandle {
    pub fn stop(mut self) -> Result<()> {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("http server thread panicked"))?;
        }
        Ok(())
    }
}

/// Bind `addr` and serve on a background thread.
///
/// `shutdown` is the supervisor's flag; `POST /shutdown` trips it, which
/// stops the camera workers but not this server (the supervisor stops the
/// server last so liveness holds through the drain).
pub fn spawn(addr: &str, metrics: Arc<Metrics>, shutdown: Arc<AtomicBool>) -> Result<HttpHandle> {
    let listener = TcpListener::bind(addr)
        .map_err(|e| anyhow!("cannot bind http server to '{}': {}", addr, e))?;
    let local_addr = listener.local_addr()?;
    listener.set_nonblocking(true)?;

    let stop = Arc::new(AtomicBool::new(false));
    let stop_thread = stop.clone();
    let join = std::thread::spawn(move || {
        run_server(listener, metrics, shutdown, stop_thread);
    });

    log::info!("http server listening on {}", local_addr);
    Ok(HttpHandle {
        addr: local_addr,
        stop,
        join: Some(join),
    })
}

fn run_server(
    listener: TcpListener,
    metrics: Arc<Metrics>,
    shutdown: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
) {
    loop {
        if stop.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, _peer)) => {
                if let Err(err) = handle_connection(stream, &metrics, &shutdown) {
                    log::debug!("http connection error: {}", err);
                }
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                std::thread::sleep(ACCEPT_POLL_INTERVAL);
            }
            Err(err) => {
                log::warn!("http accept error: {}", err);
                std::thread::sleep(ACCEPT_POLL_INTERVAL);
            }
        }
    }
    log::info!("http server stopped");
}

fn handle_connection(
    mut stream: TcpStream,
    metrics: &Metrics,
    shutdown: &AtomicBool,
) -> Result<()> {
    stream.set_read_timeout(Some(READ_TIMEOUT))?;
    stream.set_nonblocking(false)?;

    let mut request = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        let n = stream.read(&mut chunk)?;
        if n == 0 {
            break;
        }
        request.extend_from_slice(&chunk[..n]);
        if request.len() >= MAX_REQUEST_BYTES {
            return Err(anyhow!("request too large"));
        }
        if request.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }

    let head = String::from_utf8_lossy(&request);
    let mut request_line = head.lines().next().unwrap_or("").split_whitespace();
    let method = request_line.next().unwrap_or("");
    let path = request_line.next().unwrap_or("");

    match (method, path) {
        ("GET", "/healthz") => {
            let body = serde_json::json!({"status": "ok", "service": SERVICE_NAME}).to_string();
            write_response(&mut stream, 200, "OK", "application/json", &body)
        }
        ("GET", "/metrics") => match metrics.render() {
            Ok(body) => write_response(
                &mut stream,
                200,
                "OK",
                "text/plain; version=0.0.4; charset=utf-8",
                &body,
            ),
            Err(err) => {
                log::error!("metrics render failed: {}", err);
                write_response(&mut stream, 500, "Internal Server Error", "text/plain", "")
            }
        },
        ("POST", "/shutdown") => {
            log::info!("shutdown requested over http");
            shutdown.store(true, Ordering::SeqCst);
            let body = serde_json::json!({"status": "shutting down"}).to_string();
            write_response(&mut stream, 202, "Accepted", "application/json", &body)
        }
        _ => write_response(&mut stream, 404, "Not Found", "text/plain", "not found\n"),
    }
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    reason: &str,
    content_type: &str,
    body: &str,
) -> Result<()> {
    let response = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        reason,
        content_type,
        body.len(),
        body
    );
    stream.write_all(response.as_bytes())?;
    stream.flush()?;
    Ok(())
}

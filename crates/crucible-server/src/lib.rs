#![warn(missing_docs)]

//! # crucible-server
//!
//! Blocking TCP front end for the crucible evaluator.
//!
//! Connection-per-request: the client writes its JSON request and half-closes,
//! the worker reads to EOF, evaluates, writes the response, and closes. No
//! length prefix, no keep-alive. N worker threads each own an SO_REUSEPORT
//! listener on the same port, each with its own evaluation slot, so requests
//! never share engine state across threads and never queue behind a lock.

mod listener;

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::thread;

use crucible_sandbox::{Evaluator, SandboxConfig};
use thiserror::Error;

use crate::listener::bind_reuseport;

/// Server construction and runtime errors.
#[derive(Debug, Error)]
pub enum ServerError {
    /// A listener could not be created or bound.
    #[error("cannot bind listener: {0}")]
    Bind(#[source] std::io::Error),

    /// A worker thread could not be spawned.
    #[error("cannot spawn worker thread: {0}")]
    Spawn(#[source] std::io::Error),

    /// A worker thread returned, which only happens if it panicked.
    #[error("worker thread exited unexpectedly")]
    WorkerExited,
}

/// Settings for one server instance.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Port to listen on; 0 picks an ephemeral port shared by all workers.
    pub port: u16,
    /// Number of worker threads (one listener and one evaluation slot each).
    pub threads: usize,
    /// Limits applied to every evaluation slot.
    pub sandbox: SandboxConfig,
}

/// A bound, not-yet-serving evaluation server.
///
/// Binding is separate from serving so the caller can learn the resolved
/// address (port 0) before the workers start.
pub struct Server {
    listeners: Vec<TcpListener>,
    local_addr: SocketAddr,
    sandbox: SandboxConfig,
}

impl Server {
    /// Bind one listener per worker thread.
    ///
    /// The first bind resolves an ephemeral port; the remaining listeners
    /// reuse the resolved address.
    pub fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        let threads = config.threads.max(1);

        let first = bind_reuseport(SocketAddr::from(([0, 0, 0, 0], config.port)))?;
        let local_addr = first.local_addr().map_err(ServerError::Bind)?;

        let mut listeners = vec![first];
        for _ in 1..threads {
            listeners.push(bind_reuseport(local_addr)?);
        }

        Ok(Self {
            listeners,
            local_addr,
            sandbox: config.sandbox,
        })
    }

    /// The bound address (useful when the configured port was 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serve until the process is stopped.
    ///
    /// Each worker constructs its evaluator on its own thread, as the slot is
    /// thread-bound. A returning worker is an error: the loops are endless.
    pub fn run(self) -> Result<(), ServerError> {
        tracing::info!(
            addr = %self.local_addr,
            workers = self.listeners.len(),
            "crucible listening"
        );

        let mut handles = Vec::with_capacity(self.listeners.len());
        for (index, listener) in self.listeners.into_iter().enumerate() {
            let sandbox = self.sandbox.clone();
            let handle = thread::Builder::new()
                .name(format!("crucible-worker-{index}"))
                .spawn(move || worker_loop(index, listener, sandbox))
                .map_err(ServerError::Spawn)?;
            handles.push(handle);
        }

        for handle in handles {
            let _ = handle.join();
        }
        Err(ServerError::WorkerExited)
    }
}

/// One worker: an evaluation slot serving its listener forever.
fn worker_loop(index: usize, listener: TcpListener, sandbox: SandboxConfig) {
    let mut evaluator = match Evaluator::new(sandbox) {
        Ok(evaluator) => evaluator,
        Err(error) => {
            tracing::error!(worker = index, %error, "cannot construct evaluation slot");
            std::process::abort();
        }
    };
    tracing::debug!(worker = index, "worker ready");

    loop {
        let (stream, peer) = match listener.accept() {
            Ok(accepted) => accepted,
            Err(error) => {
                tracing::warn!(worker = index, %error, "accept failed");
                continue;
            }
        };
        match serve_connection(&mut evaluator, stream) {
            Ok((request_bytes, response_bytes)) => {
                tracing::debug!(
                    worker = index,
                    peer = %peer,
                    request_bytes,
                    response_bytes,
                    "request served"
                );
            }
            Err(error) => {
                tracing::warn!(worker = index, peer = %peer, %error, "connection dropped");
            }
        }
    }
}

/// One connection: read to EOF (the client half-closes), evaluate, reply,
/// close. Returns the request and response sizes for logging.
fn serve_connection(
    evaluator: &mut Evaluator,
    mut stream: TcpStream,
) -> std::io::Result<(usize, usize)> {
    let mut request = Vec::new();
    stream.read_to_end(&mut request)?;

    let response = evaluator.handle_request(&request);

    stream.write_all(response.as_bytes())?;
    Ok((request.len(), response.len()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_resolves_an_ephemeral_port_once() {
        let server = Server::bind(ServerConfig {
            port: 0,
            threads: 3,
            sandbox: SandboxConfig::default(),
        })
        .unwrap();
        assert_ne!(server.local_addr().port(), 0);
        assert_eq!(server.listeners.len(), 3);
        for listener in &server.listeners {
            assert_eq!(
                listener.local_addr().unwrap().port(),
                server.local_addr().port()
            );
        }
    }

    #[test]
    fn zero_threads_still_binds_one_listener() {
        let server = Server::bind(ServerConfig {
            port: 0,
            threads: 0,
            sandbox: SandboxConfig::default(),
        })
        .unwrap();
        assert_eq!(server.listeners.len(), 1);
    }
}

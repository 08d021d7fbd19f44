//! TCP front end for [`LeaderService`]
//!
//! One thread accepts connections and one thread serves each worker. Every
//! request and response is one JSON document per line. When the service
//! stops, open connections are shut down so workers see a disconnect.
//!
//! A connection that cannot be set up is dropped on its own; only a listener
//! that cannot be used at all aborts the run.

use std::collections::HashMap;
use std::io::{self, BufReader};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use distrib_protocol::{read_message_with_limit, write_message, MAX_MESSAGE_SIZE};
use parking_lot::Mutex;
use serde_json::Value;

use super::handle::{FailureCause, ServiceHandle};
use super::service::LeaderService;

/// Accept loop wake-up interval while idle
const ACCEPT_POLL: Duration = Duration::from_millis(50);

/// Open worker connections by id, kept so they can be shut down on stop
type Connections = Arc<Mutex<HashMap<u64, TcpStream>>>;

pub struct RpcServer {
    listener: TcpListener,
    service: Arc<LeaderService>,
    handle: ServiceHandle,
    connections: Connections,
    max_message_size: usize,
}

impl RpcServer {
    pub fn bind<A: ToSocketAddrs>(addr: A, service: Arc<LeaderService>, handle: ServiceHandle) -> io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        Ok(Self::new(listener, service, handle))
    }

    pub fn new(listener: TcpListener, service: Arc<LeaderService>, handle: ServiceHandle) -> Self {
        Self {
            listener,
            service,
            handle,
            connections: Arc::default(),
            max_message_size: MAX_MESSAGE_SIZE,
        }
    }

    /// Reject request lines longer than `limit` bytes
    pub fn with_max_message_size(mut self, limit: usize) -> Self {
        self.max_message_size = limit;
        self
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn spawn(self) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("rpc-accept".to_string())
            .spawn(move || {
                if let Err(e) = self.run() {
                    tracing::error!(error = %e, "RPC server failed");
                }
            })
    }

    /// Accept connections until the service stops.
    ///
    /// A listener error aborts the run with [`FailureCause::InternalError`]
    /// before returning.
    pub fn run(self) -> io::Result<()> {
        let addr = match self.listener.set_nonblocking(true).and_then(|()| self.local_addr()) {
            Ok(addr) => addr,
            Err(e) => {
                tracing::error!(error = %e, "listener unusable, aborting run");
                self.handle.abort(FailureCause::InternalError);
                return Err(e);
            }
        };
        tracing::info!(addr = %addr, "leader listening");

        let mut workers = Vec::new();
        let mut next_id = 0u64;

        while !self.handle.is_stopped() {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    next_id += 1;
                    match self.open_connection(next_id, stream, peer) {
                        Ok(worker) => workers.push(worker),
                        Err(e) => tracing::warn!(peer = %peer, error = %e, "dropping connection"),
                    }
                    reap_finished(&mut workers);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.handle.wait_timeout(ACCEPT_POLL);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    self.handle.wait_timeout(ACCEPT_POLL);
                }
            }
        }

        for (_, stream) in self.connections.lock().drain() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        for worker in workers {
            if worker.join().is_err() {
                tracing::error!("connection thread panicked");
            }
        }
        tracing::debug!("RPC server stopped");
        Ok(())
    }

    fn open_connection(&self, id: u64, stream: TcpStream, peer: SocketAddr) -> io::Result<JoinHandle<()>> {
        stream.set_nonblocking(false)?;
        self.connections.lock().insert(id, stream.try_clone()?);

        tracing::debug!(peer = %peer, "worker connected");
        let service = Arc::clone(&self.service);
        let connections = Arc::clone(&self.connections);
        let limit = self.max_message_size;
        let spawned = thread::Builder::new()
            .name(format!("rpc-{}", peer))
            .spawn(move || {
                serve_connection(stream, &service, peer, limit);
                connections.lock().remove(&id);
            });

        if spawned.is_err() {
            self.connections.lock().remove(&id);
        }
        spawned
    }
}

fn reap_finished(workers: &mut Vec<JoinHandle<()>>) {
    let (finished, running): (Vec<_>, Vec<_>) = workers.drain(..).partition(|w| w.is_finished());
    *workers = running;
    for worker in finished {
        if worker.join().is_err() {
            tracing::error!("connection thread panicked");
        }
    }
}

fn serve_connection(stream: TcpStream, service: &LeaderService, peer: SocketAddr, limit: usize) {
    let mut writer = match stream.try_clone() {
        Ok(writer) => writer,
        Err(e) => {
            tracing::warn!(peer = %peer, error = %e, "failed to clone connection");
            return;
        }
    };
    let mut reader = BufReader::new(stream);

    loop {
        let (response, keep_open) = match read_message_with_limit::<_, Value>(&mut reader, limit) {
            Ok(Some(value)) => (service.handle_value(value), true),
            Ok(None) => break,
            Err(e) if e.is_malformed() => (service.reject_malformed(String::new(), e), false),
            Err(e) => {
                if !e.is_disconnect() {
                    tracing::warn!(peer = %peer, error = %e, "read failed");
                }
                break;
            }
        };

        if let Err(e) = write_message(&mut writer, &response) {
            if !e.is_disconnect() {
                tracing::warn!(peer = %peer, error = %e, "write failed");
            }
            break;
        }
        if !keep_open {
            break;
        }
    }
    tracing::debug!(peer = %peer, "worker disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DistribConfig;
    use crate::leader::policy::DefaultPolicy;
    use crate::leader::queue::LeaseQueue;
    use crate::leader::metrics::RunMetrics;
    use crate::leader::reporter::CollectingReporter;
    use distrib_protocol::{read_message, ErrorCode, Operation, RpcRequest, RpcResponse};
    use std::io::Write;
    use std::time::Instant;

    struct Fixture {
        addr: SocketAddr,
        handle: ServiceHandle,
        server: JoinHandle<()>,
        connections: Connections,
    }

    fn start(tests: &[&str], limit: usize) -> Fixture {
        let config = DistribConfig::default();
        let queue = Arc::new(LeaseQueue::new(tests.iter().map(|t| t.to_string()).collect()));
        let handle = ServiceHandle::new(Arc::clone(&queue));
        let service = LeaderService::new(
            &config,
            queue,
            handle.clone(),
            Arc::new(RunMetrics::new()),
            Box::new(CollectingReporter::new()),
            Box::new(DefaultPolicy::new(&config.retry)),
            1,
        )
        .unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let server = RpcServer::new(listener, Arc::new(service), handle.clone()).with_max_message_size(limit);
        let addr = server.local_addr().unwrap();
        let connections = Arc::clone(&server.connections);
        let server = server.spawn().unwrap();

        Fixture {
            addr,
            handle,
            server,
            connections,
        }
    }

    fn connect(addr: SocketAddr) -> (TcpStream, BufReader<TcpStream>) {
        let stream = TcpStream::connect(addr).unwrap();
        let reader = BufReader::new(stream.try_clone().unwrap());
        (stream, reader)
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn test_invalid_utf8_is_rejected_and_aborts() {
        let f = start(&["a"], MAX_MESSAGE_SIZE);
        let (mut stream, mut reader) = connect(f.addr);

        let mut line = br#"{"protocol_version":1,"op":"profile","request_id":""#.to_vec();
        line.extend_from_slice(&[0xff, 0xfe]);
        line.extend_from_slice(b"\"}\n");
        stream.write_all(&line).unwrap();

        if let Ok(Some(response)) = read_message::<_, RpcResponse>(&mut reader) {
            assert!(!response.ok);
            assert_eq!(response.error.unwrap().code, ErrorCode::InvalidRequest);
        }

        assert!(wait_until(|| f.handle.is_stopped()));
        assert_eq!(f.handle.aborts(), vec![FailureCause::MalformedRequest]);
        f.server.join().unwrap();
    }

    #[test]
    fn test_oversized_line_is_rejected_and_aborts() {
        let f = start(&["a"], 64);
        let (mut stream, mut reader) = connect(f.addr);

        let padding = "x".repeat(256);
        let request = RpcRequest::new(Operation::Profile, "req-1", serde_json::json!({ "pad": padding }));
        write_message(&mut stream, &request).unwrap();

        if let Ok(Some(response)) = read_message::<_, RpcResponse>(&mut reader) {
            assert_eq!(response.error.unwrap().code, ErrorCode::InvalidRequest);
        }

        assert!(wait_until(|| f.handle.is_stopped()));
        assert_eq!(f.handle.aborts(), vec![FailureCause::MalformedRequest]);
        f.server.join().unwrap();
    }

    #[test]
    fn test_closed_connections_are_forgotten() {
        let f = start(&["a"], MAX_MESSAGE_SIZE);

        for _ in 0..3 {
            let (mut stream, mut reader) = connect(f.addr);
            let request = RpcRequest::new(Operation::Profile, "req-1", serde_json::json!({}));
            write_message(&mut stream, &request).unwrap();
            let response: RpcResponse = read_message(&mut reader).unwrap().unwrap();
            assert!(response.ok);
            stream.shutdown(Shutdown::Both).unwrap();
        }

        assert!(wait_until(|| f.connections.lock().is_empty()));
        assert!(!f.handle.is_stopped());

        // Still accepting after earlier workers went away
        let (mut stream, mut reader) = connect(f.addr);
        let request = RpcRequest::new(Operation::Profile, "req-2", serde_json::json!({}));
        write_message(&mut stream, &request).unwrap();
        let response: RpcResponse = read_message(&mut reader).unwrap().unwrap();
        assert_eq!(response.request_id, "req-2");

        f.handle.stop(crate::leader::StopReason::Drained);
        f.server.join().unwrap();
    }

    #[test]
    fn test_stop_disconnects_open_workers() {
        let f = start(&["a"], MAX_MESSAGE_SIZE);
        let (_stream, mut reader) = connect(f.addr);
        assert!(wait_until(|| f.connections.lock().len() == 1));

        f.handle.stop(crate::leader::StopReason::Drained);
        f.server.join().unwrap();

        let next: Option<RpcResponse> = read_message(&mut reader).unwrap_or(None);
        assert!(next.is_none());
    }
}

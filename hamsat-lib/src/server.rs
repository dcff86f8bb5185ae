//! TCP ingestion service.
//!
//! One listener, one bounded worker pool. Every accepted connection is
//! handed to a worker that owns a [`FrameDecoder`] for the connection's
//! lifetime, so no decode state is ever shared between producers. Completed
//! frames go to the payload sink, and frames from relay-flagged spacecraft
//! are also appended to the forwarding queue.

use std::io::Read;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use threadpool::ThreadPool;
use tracing::{debug, error, info, info_span, warn};
use typed_builder::TypedBuilder;

use crate::frame::FrameDecoder;
use crate::queue::ForwardingQueue;
use crate::sink::PayloadSink;
use crate::spacecraft::SpacecraftRegistry;
use crate::Result;

/// Listener and worker-pool tuning.
#[derive(Debug, Clone, TypedBuilder)]
pub struct ServerConfig {
    /// Address to bind, e.g. `0.0.0.0`.
    #[builder(default = String::from("0.0.0.0"))]
    pub bind_addr: String,
    /// Frame ingestion port.
    #[builder(default = 41042)]
    pub port: u16,
    /// Maximum simultaneous connection workers.
    #[builder(default = 100)]
    pub pool_size: usize,
    /// Per-connection socket read timeout, so a stalled producer cannot pin
    /// a worker forever.
    #[builder(default = Duration::from_secs(45))]
    pub read_timeout: Duration,
}

/// Signals the accept loop to stop. The loop notices at its next wakeup, so
/// pair this with closing a connection (or an accept timeout) in tests.
#[derive(Clone)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
}

impl ShutdownHandle {
    pub fn signal(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }
}

/// Accepts producer connections and feeds them to decode workers.
pub struct ConnectionServer {
    listener: TcpListener,
    config: ServerConfig,
    registry: Arc<SpacecraftRegistry>,
    sink: Arc<dyn PayloadSink>,
    queue: Arc<ForwardingQueue>,
    shutdown: Arc<AtomicBool>,
}

/// Connection sequence numbers wrap here. The sequence only disambiguates
/// generated temp identifiers, so it just needs to outrun the number of
/// connections arriving in one second.
const MAX_SEQUENCE: u32 = 1000;

impl ConnectionServer {
    /// Bind the listening socket.
    ///
    /// # Errors
    /// [`crate::Error::Io`] when the socket cannot be bound; callers treat
    /// this as fatal.
    pub fn bind(
        config: ServerConfig,
        registry: Arc<SpacecraftRegistry>,
        sink: Arc<dyn PayloadSink>,
        queue: Arc<ForwardingQueue>,
    ) -> Result<Self> {
        let listener = TcpListener::bind((config.bind_addr.as_str(), config.port))?;
        Ok(ConnectionServer {
            listener,
            config,
            registry,
            sink,
            queue,
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    /// The bound address, useful when the port was 0.
    ///
    /// # Errors
    /// [`crate::Error::Io`] if the socket has gone away.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    #[must_use]
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            flag: self.shutdown.clone(),
        }
    }

    /// Run the accept loop until shutdown is signaled.
    ///
    /// Accept timeouts are logged and the loop continues; any other
    /// accept-time failure is logged with full diagnostics and does not stop
    /// the server. On shutdown the listener closes and in-flight connections
    /// are drained before returning.
    pub fn serve(self) -> Result<()> {
        let pool = ThreadPool::with_name("connection_worker".into(), self.config.pool_size);
        let mut sequence: u32 = 0;

        info!(
            addr = %self.local_addr()?,
            pool_size = self.config.pool_size,
            "listening for telemetry producers"
        );

        while !self.shutdown.load(Ordering::SeqCst) {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    let registry = self.registry.clone();
                    let sink = self.sink.clone();
                    let queue = self.queue.clone();
                    let read_timeout = self.config.read_timeout;
                    let seq = sequence;
                    pool.execute(move || {
                        handle_connection(&stream, peer, seq, read_timeout, &registry, &*sink, &queue);
                    });
                    sequence = (sequence + 1) % MAX_SEQUENCE;
                }
                Err(err)
                    if err.kind() == std::io::ErrorKind::WouldBlock
                        || err.kind() == std::io::ErrorKind::TimedOut =>
                {
                    info!("accept timed out, continuing");
                }
                Err(err) => {
                    error!(%err, "accept failed, continuing");
                }
            }
        }

        info!("shutting down, waiting for in-flight connections");
        drop(self.listener);
        pool.join();
        Ok(())
    }
}

/// Read loop for one producer connection. The decoder and buffer live here,
/// exclusively owned, for the life of the connection.
fn handle_connection(
    stream: &TcpStream,
    peer: SocketAddr,
    sequence: u32,
    read_timeout: Duration,
    registry: &Arc<SpacecraftRegistry>,
    sink: &dyn PayloadSink,
    queue: &Arc<ForwardingQueue>,
) {
    let span = info_span!("conn", seq = sequence, %peer);
    let _guard = span.enter();
    debug!("connection accepted");

    if let Err(err) = stream.set_read_timeout(Some(read_timeout)) {
        warn!(%err, "could not set read timeout, dropping connection");
        return;
    }

    let mut decoder = FrameDecoder::new(registry.clone());
    let mut buf = [0u8; 1024];
    let mut frames: u32 = 0;
    let mut reader = stream;
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                for &b in &buf[..n] {
                    decoder.consume(b);
                    if decoder.frame_done() {
                        if let Some(frame) = decoder.take_frame() {
                            frames += 1;
                            dispatch_frame(&frame, sink, queue);
                        }
                    }
                }
            }
            Err(err)
                if err.kind() == std::io::ErrorKind::WouldBlock
                    || err.kind() == std::io::ErrorKind::TimedOut =>
            {
                warn!("read timed out, closing connection");
                break;
            }
            Err(err) => {
                debug!(%err, "read failed, closing connection");
                break;
            }
        }
    }
    debug!(frames, "connection closed");
}

fn dispatch_frame(
    frame: &crate::frame::CompletedFrame,
    sink: &dyn PayloadSink,
    queue: &Arc<ForwardingQueue>,
) {
    if !frame.save_payloads(sink) {
        warn!(
            id = frame.header.id,
            resets = frame.header.resets,
            uptime = frame.header.uptime,
            "payload store rejected a slot, remaining slots skipped"
        );
    }
    if frame.craft.forwards() {
        if let Err(err) = queue.add(frame.queue_entry()) {
            error!(%err, id = frame.header.id, "could not queue frame for relay");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config = ServerConfig::builder().build();
        assert_eq!(config.port, 41042);
        assert_eq!(config.pool_size, 100);
        assert_eq!(config.bind_addr, "0.0.0.0");
    }

    #[test]
    fn sequence_wraps() {
        let mut seq = MAX_SEQUENCE - 1;
        seq = (seq + 1) % MAX_SEQUENCE;
        assert_eq!(seq, 0);
    }
}

//! Raw-socket capture engine.
//!
//! The engine owns at most one live socket. While a session is active, a
//! dedicated thread runs a serialized receive -> decode -> dispatch cycle:
//! the next receive is issued only after the current datagram has been
//! handed to the sink, so no two datagrams from one engine are ever decoded
//! concurrently.

use std::io;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use thiserror::Error;

use crate::packet::Ipv4Header;
use crate::sink::{PacketRecord, PacketSink};

/// Receive buffer ceiling; one receive completion delivers at most this much.
pub const RECV_BUFFER_SIZE: usize = 4096;

/// Opening, binding, or configuring the capture socket failed.
///
/// Surfaced to the gate; the engine stays idle and the next activation may
/// retry.
#[derive(Debug, Error)]
#[error("raw socket setup failed: {0}")]
pub struct SocketSetupError(#[from] io::Error);

/// One open platform socket usable for capture.
///
/// `recv` blocks for at most a short platform timeout so a cancelled session
/// can wind down; `shutdown` additionally unblocks any pending receive.
pub trait CaptureSocket: Send + Sync + 'static {
    fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;
    fn shutdown(&self) -> io::Result<()>;
}

/// Opens capture sockets.
///
/// Implementations bind to the given local address and enable
/// header-included and receive-all delivery before returning. Generic rather
/// than boxed so each platform's socket type is monomorphized in.
pub trait SocketProvider: Send + 'static {
    type Socket: CaptureSocket;

    fn open(&self, bind_addr: Ipv4Addr) -> io::Result<Self::Socket>;
}

/// The live-socket resource. Exists only between `start` and the matching
/// `stop`; never shared outside the engine.
struct CaptureSession<S> {
    cancel: Arc<AtomicBool>,
    socket: Arc<S>,
    receiver: JoinHandle<()>,
}

pub struct CaptureEngine<P: SocketProvider> {
    provider: P,
    sink: Arc<dyn PacketSink>,
    session: Option<CaptureSession<P::Socket>>,
}

impl<P: SocketProvider> CaptureEngine<P> {
    pub fn new(provider: P, sink: Arc<dyn PacketSink>) -> Self {
        Self {
            provider,
            sink,
            session: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.session.is_some()
    }

    /// Open the raw socket and begin the receive cycle.
    ///
    /// On setup failure the engine stays idle; the caller may retry on a
    /// later activation.
    pub fn start(&mut self, bind_addr: Ipv4Addr) -> Result<(), SocketSetupError> {
        if self.session.is_some() {
            tracing::debug!("capture already active, ignoring start");
            return Ok(());
        }

        let socket = Arc::new(self.provider.open(bind_addr)?);
        let cancel = Arc::new(AtomicBool::new(false));

        let thread_socket = Arc::clone(&socket);
        let thread_cancel = Arc::clone(&cancel);
        let sink = Arc::clone(&self.sink);
        let receiver = std::thread::Builder::new()
            .name("ipwatch-capture".into())
            .spawn(move || receive_loop(thread_socket, thread_cancel, sink))
            .map_err(SocketSetupError::from)?;

        self.session = Some(CaptureSession {
            cancel,
            socket,
            receiver,
        });
        tracing::info!(%bind_addr, "capture started");
        Ok(())
    }

    /// Close the socket and end the receive cycle.
    ///
    /// Safe to call with a receive outstanding: a completion caused by the
    /// close is swallowed, never dispatched to the sink.
    pub fn stop(&mut self) {
        let Some(session) = self.session.take() else {
            tracing::debug!("capture not active, ignoring stop");
            return;
        };

        session.cancel.store(true, Ordering::Release);
        if let Err(e) = session.socket.shutdown() {
            tracing::debug!("socket shutdown: {e}");
        }
        if session.receiver.join().is_err() {
            tracing::error!("capture thread panicked");
        }
        tracing::info!("capture stopped");
    }
}

fn receive_loop<S: CaptureSocket>(
    socket: Arc<S>,
    cancel: Arc<AtomicBool>,
    sink: Arc<dyn PacketSink>,
) {
    let mut buf = [0u8; RECV_BUFFER_SIZE];

    while !cancel.load(Ordering::Acquire) {
        let received = match socket.recv(&mut buf) {
            Ok(n) => n,
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) =>
            {
                continue
            }
            Err(e) => {
                if cancel.load(Ordering::Acquire) {
                    break; // recv unblocked by stop()
                }
                tracing::warn!("receive failed: {e}");
                continue;
            }
        };

        // A completion racing stop() belongs to the closed session.
        if cancel.load(Ordering::Acquire) {
            break;
        }

        let result = match Ipv4Header::decode(&buf[..received]) {
            Ok(header) => sink.on_header(PacketRecord::from_header(&header)),
            Err(err) => sink.on_decode_error(&err),
        };
        if let Err(e) = result {
            // Sink failures never end the cycle; only stop() does.
            tracing::warn!("sink dispatch failed: {e}");
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    const BIND: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);

    #[test]
    fn test_receive_decode_dispatch_cycle() {
        let provider = MockProvider::default();
        let mut version6 = valid_datagram();
        version6[0] = 0x65;
        *provider.queued.lock().unwrap() = vec![valid_datagram(), version6, valid_datagram()];

        let sink = Arc::new(RecordingSink::default());
        let mut engine = CaptureEngine::new(provider.clone(), sink.clone());
        engine.start(BIND).unwrap();
        assert!(engine.is_active());

        // All three datagrams flow through one at a time: two decoded
        // headers, one decode error, in arrival order.
        assert!(wait_for(|| sink.header_count() == 2 && sink.error_count() == 1));
        engine.stop();
        assert!(!engine.is_active());

        let headers = sink.headers.lock().unwrap();
        assert_eq!(headers.len(), 2);
        assert_eq!(headers[0].source, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(headers[0].destination, Ipv4Addr::new(10, 0, 0, 2));
        let errors = sink.errors.lock().unwrap();
        assert_eq!(
            errors[0],
            crate::packet::DecodeError::UnsupportedVersion(6)
        );
    }

    #[test]
    fn test_stop_swallows_cancelled_receive() {
        let provider = MockProvider::default();
        // The receive outstanding at stop() completes with a real datagram,
        // exactly as a cancelled receive completion would.
        *provider.deliver_on_shutdown.lock().unwrap() = Some(valid_datagram());

        let sink = Arc::new(RecordingSink::default());
        let mut engine = CaptureEngine::new(provider.clone(), sink.clone());
        engine.start(BIND).unwrap();

        // Let the receive thread block in recv before stopping.
        std::thread::sleep(std::time::Duration::from_millis(20));
        engine.stop();

        assert_eq!(sink.header_count(), 0);
        assert_eq!(sink.error_count(), 0);
        assert_eq!(provider.shutdowns.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn test_start_while_active_keeps_single_socket() {
        let provider = MockProvider::default();
        let sink = Arc::new(RecordingSink::default());
        let mut engine = CaptureEngine::new(provider.clone(), sink);

        engine.start(BIND).unwrap();
        engine.start(BIND).unwrap();
        assert_eq!(provider.opens.load(std::sync::atomic::Ordering::SeqCst), 1);
        engine.stop();
    }

    #[test]
    fn test_setup_failure_leaves_engine_idle_and_retryable() {
        let provider = MockProvider::default();
        provider
            .fail_next_open
            .store(true, std::sync::atomic::Ordering::SeqCst);

        let sink = Arc::new(RecordingSink::default());
        let mut engine = CaptureEngine::new(provider.clone(), sink);

        assert!(engine.start(BIND).is_err());
        assert!(!engine.is_active());

        // Next activation retries and succeeds.
        engine.start(BIND).unwrap();
        assert!(engine.is_active());
        engine.stop();
    }

    #[test]
    fn test_stop_when_idle_is_a_no_op() {
        let provider = MockProvider::default();
        let sink = Arc::new(RecordingSink::default());
        let mut engine = CaptureEngine::new(provider.clone(), sink);

        engine.stop();
        assert_eq!(provider.shutdowns.load(std::sync::atomic::Ordering::SeqCst), 0);
    }
}

use std::fmt::{Display, Formatter};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::sink::SinkExt;
use log::{debug, error, info, trace, warn};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch, Notify, Semaphore};
use tokio::time::{sleep, timeout};
use tokio_stream::StreamExt;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::core::config::{Endpoint, RequeuePolicy, SessionConfig};
use crate::core::device::DeviceRegistry;
use crate::queue::pending::{
    Outcome, PendingTable, PendingTransaction, Resolution, TransactionId,
};

use super::{Error, Frame, MbapCodec, TransactionManager};

/// Lifecycle of the connection behind a [`TransportSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Reconnection was given up on; the session refuses all work.
    Faulted,
}

impl Display for ConnectionState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Faulted => "faulted",
        };
        f.write_str(name)
    }
}

/// Everything mutated by both submitters and the connection task.
#[derive(Debug)]
pub(crate) struct SessionState {
    pub(crate) closed: bool,
    outbound: Option<mpsc::UnboundedSender<Frame>>,
    pub(crate) pending: PendingTable,
    pub(crate) registry: DeviceRegistry,
}

#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) endpoint: Endpoint,
    pub(crate) config: SessionConfig,
    state: Mutex<SessionState>,
    pub(crate) window: Arc<Semaphore>,
    status: watch::Sender<ConnectionState>,
    cancel: Notify,
}

impl Shared {
    /// Session state is only ever touched synchronously, so the guard never
    /// crosses an await point.
    pub(crate) fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *self.status.borrow()
    }

    fn transition(&self, next: ConnectionState) {
        let previous = self.status.send_replace(next);
        if previous != next {
            debug!("Session {} is now {next} (was {previous})", self.endpoint);
        }
    }

    /// The error a refused submission reports.
    pub(crate) fn refusal(&self) -> Error {
        match self.state() {
            ConnectionState::Faulted => Error::Faulted,
            _ => Error::ConnectionLost,
        }
    }

    /// Registers a transaction and writes it straight away when connected.
    /// While disconnected it waits in the table until the next link comes up.
    pub(crate) fn enqueue(
        &self,
        unit_id: u8,
        function: u8,
        payload: Vec<u8>,
        attempt: u32,
    ) -> Result<(TransactionId, oneshot::Receiver<Outcome>), Error> {
        let mut state = self.lock();
        if state.closed || self.state() == ConnectionState::Faulted {
            return Err(self.refusal());
        }

        let id = state.pending.allocate()?;
        let frame = Frame::new(id, unit_id, function, payload);
        let (mut pending, receiver) = PendingTransaction::new(frame.clone(), attempt);

        if let Some(outbound) = &state.outbound {
            if outbound.send(frame).is_ok() {
                pending.mark_sent();
            }
        }

        trace!(
            "Queued TxnID={id} for unit {unit_id} on {} (attempt {attempt}, sent={})",
            self.endpoint,
            pending.is_sent()
        );
        state.pending.insert(pending);

        Ok((id, receiver))
    }

    /// Drops a transaction nobody waits for any more.
    pub(crate) fn forget(&self, id: TransactionId) -> Option<PendingTransaction> {
        self.lock().pending.remove(id)
    }

    fn dispatch(&self, frame: Frame) {
        let id = frame.transaction_id();
        let unit_id = frame.unit_id();

        match self.lock().pending.resolve(frame) {
            Resolution::Resolved => trace!("Resolved TxnID={id} from unit {unit_id}"),
            Resolution::Mismatched => {
                warn!("Response TxnID={id} does not answer its request (unit {unit_id})")
            }
            Resolution::Unknown => debug!("Dropping response for unknown TxnID={id}"),
        }
    }

    fn connected(&self, outbound: mpsc::UnboundedSender<Frame>) {
        let mut state = self.lock();

        let backlog = state.pending.take_unsent();
        if !backlog.is_empty() {
            debug!("Writing {} queued frame(s) to {}", backlog.len(), self.endpoint);
        }
        for frame in backlog {
            // The receiver lives in the connection task that is calling us.
            let _ = outbound.send(frame);
        }

        state.outbound = Some(outbound);
        self.transition(ConnectionState::Connected);
    }

    fn lost(&self) {
        let mut state = self.lock();
        state.outbound = None;

        match self.config.requeue {
            RequeuePolicy::Fail => {
                let failed = state.pending.fail_all(|| Error::ConnectionLost);
                if failed > 0 {
                    warn!("Failed {failed} pending transaction(s) on {}", self.endpoint);
                }
            }
            RequeuePolicy::Requeue => state.pending.mark_all_unsent(),
        }

        if !state.closed {
            self.transition(ConnectionState::Disconnected);
        }
    }

    fn fault(&self) {
        let mut state = self.lock();
        state.outbound = None;

        self.transition(ConnectionState::Faulted);
        let failed = state.pending.fail_all(|| Error::Faulted);
        self.window.close();

        error!(
            "Giving up on {} after {} failed connection attempts, failed {failed} transaction(s)",
            self.endpoint, self.config.max_reconnect_attempts
        );
    }

    async fn supervise(self: Arc<Self>) {
        let mut failures = 0u32;

        loop {
            if self.lock().closed {
                break;
            }

            self.transition(ConnectionState::Connecting);
            let address = (self.endpoint.host.as_str(), self.endpoint.port);

            let dial = tokio::select! {
                dial = timeout(self.config.connect_timeout, TcpStream::connect(address)) => dial,
                _ = self.cancel.notified() => break,
            };

            match dial {
                Ok(Ok(stream)) => {
                    failures = 0;
                    info!("Connected to {}", self.endpoint);

                    match self.drive(stream).await {
                        Ok(()) => break,
                        Err(err) => {
                            warn!("Connection to {} lost: {err}", self.endpoint);
                            self.lost();
                        }
                    }
                }
                Ok(Err(err)) => {
                    failures += 1;
                    warn!("Connecting to {} failed: {err}", self.endpoint);
                }
                Err(_) => {
                    failures += 1;
                    warn!(
                        "Connecting to {} timed out after {:?}",
                        self.endpoint, self.config.connect_timeout
                    );
                }
            }

            if failures >= self.config.max_reconnect_attempts {
                self.fault();
                break;
            }

            if failures > 0 {
                self.transition(ConnectionState::Disconnected);
            }

            let delay = self.config.reconnect_backoff.delay(failures.max(1));
            debug!("Reconnecting to {} in {delay:?}", self.endpoint);

            tokio::select! {
                _ = sleep(delay) => {}
                _ = self.cancel.notified() => break,
            }
        }

        debug!("Session task for {} ended", self.endpoint);
    }

    /// Pumps frames both ways until the link fails (`Err`) or the session is
    /// closed (`Ok`).
    async fn drive(&self, stream: TcpStream) -> Result<(), Error> {
        stream.set_nodelay(true)?;

        let (read, write) = stream.into_split();
        let mut frames = FramedRead::new(read, MbapCodec);
        let mut sink = FramedWrite::new(write, MbapCodec);

        let (outbound, mut queue) = mpsc::unbounded_channel();
        self.connected(outbound);

        loop {
            tokio::select! {
                frame = frames.next() => match frame {
                    Some(Ok(frame)) => self.dispatch(frame),
                    Some(Err(err)) => return Err(err),
                    None => return Err(Error::ConnectionLost),
                },
                Some(frame) = queue.recv() => {
                    trace!("Writing TxnID={} to {}", frame.transaction_id(), self.endpoint);
                    sink.send(frame).await?;
                }
                _ = self.cancel.notified() => return Ok(()),
            }
        }
    }
}

/// One TCP connection to a `host:port`, shared by every unit id behind it.
///
/// The session connects in the background as soon as it is opened and keeps
/// reconnecting with backoff until it is closed or gives up and turns
/// [`ConnectionState::Faulted`].
#[derive(Debug, Clone)]
pub struct TransportSession {
    shared: Arc<Shared>,
}

impl TransportSession {
    /// Opens a session and starts connecting. Must be called within a tokio
    /// runtime.
    pub fn open(endpoint: Endpoint, config: SessionConfig) -> TransportSession {
        let (status, _) = watch::channel(ConnectionState::Disconnected);

        let shared = Arc::new(Shared {
            window: Arc::new(Semaphore::new(config.effective_window())),
            endpoint,
            config,
            state: Mutex::new(SessionState {
                closed: false,
                outbound: None,
                pending: PendingTable::new(),
                registry: DeviceRegistry::new(),
            }),
            status,
            cancel: Notify::new(),
        });

        tokio::spawn(Arc::clone(&shared).supervise());

        TransportSession { shared }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.shared.endpoint
    }

    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.shared.status.subscribe()
    }

    /// Resolves once the session reaches `state`, or fails with
    /// [`Error::Faulted`] if it faults first.
    pub async fn wait_for(&self, state: ConnectionState) -> Result<(), Error> {
        let mut status = self.subscribe();
        let reached = status
            .wait_for(|current| *current == state || *current == ConnectionState::Faulted)
            .await
            .map_err(|_| Error::ConnectionLost)?;

        if *reached == state {
            Ok(())
        } else {
            Err(Error::Faulted)
        }
    }

    pub fn transactions(&self) -> TransactionManager {
        TransactionManager::new(Arc::clone(&self.shared))
    }

    /// Number of transactions waiting for a response.
    pub fn pending_count(&self) -> usize {
        self.shared.lock().pending.len()
    }

    pub(crate) fn with_registry<R>(&self, f: impl FnOnce(&mut DeviceRegistry) -> R) -> R {
        f(&mut self.shared.lock().registry)
    }

    pub(crate) fn pending_for(&self, unit_id: u8) -> Vec<TransactionId> {
        self.shared.lock().pending.ids_for(unit_id)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    /// Shuts the session down. Pending transactions fail with
    /// [`Error::ConnectionLost`] and later submissions are refused.
    pub fn close(&self) {
        let mut state = self.shared.lock();
        if state.closed {
            return;
        }

        state.closed = true;
        state.outbound = None;
        let failed = state.pending.fail_all(|| Error::ConnectionLost);
        self.shared.window.close();

        if self.shared.state() != ConnectionState::Faulted {
            self.shared.transition(ConnectionState::Disconnected);
        }
        drop(state);

        self.shared.cancel.notify_one();
        info!("Closed session {} ({failed} transaction(s) abandoned)", self.shared.endpoint);
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use log::debug;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;
    use crate::core::config::{Backoff, MAX_WINDOW};

    fn init() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn quick() -> SessionConfig {
        SessionConfig {
            response_timeout: Duration::from_millis(200),
            retry_limit: 0,
            retry_backoff: Backoff::Fixed { delay_ms: 10 },
            connect_timeout: Duration::from_millis(500),
            reconnect_backoff: Backoff::Fixed { delay_ms: 20 },
            max_reconnect_attempts: 3,
            ..SessionConfig::default()
        }
    }

    async fn listener() -> (TcpListener, Endpoint) {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Must bind to a port");
        let addr = listener.local_addr().expect("Must have an address");
        debug!("Listening on {addr}");

        (listener, Endpoint::new("127.0.0.1", addr.port()))
    }

    #[tokio::test]
    async fn connects_and_reports_state() {
        init();
        let (listener, endpoint) = listener().await;

        let session = TransportSession::open(endpoint, quick());
        let (_peer, _) = listener.accept().await.expect("Must accept connection");

        session
            .wait_for(ConnectionState::Connected)
            .await
            .expect("Must connect");
        assert_eq!(session.state(), ConnectionState::Connected);

        session.close();
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn oversized_window_is_clamped() {
        init();
        let (_listener, endpoint) = listener().await;

        let session = TransportSession::open(
            endpoint,
            SessionConfig {
                window: usize::MAX,
                ..quick()
            },
        );
        assert_eq!(session.transactions().available(), MAX_WINDOW);

        session.close();
    }

    #[tokio::test]
    async fn unreachable_endpoint_faults() {
        init();
        let (listener, endpoint) = listener().await;
        // Free the port so every dial is refused.
        drop(listener);

        let session = TransportSession::open(endpoint, quick());
        assert!(matches!(
            session.wait_for(ConnectionState::Connected).await,
            Err(Error::Faulted)
        ));

        let submitted = session
            .transactions()
            .submit(1, 0x03, &[0x00, 0x00, 0x00, 0x01], Duration::from_millis(100))
            .await;
        assert!(matches!(submitted, Err(Error::Faulted)));
    }

    #[tokio::test]
    async fn disconnect_fails_pending_transactions() {
        init();
        let (listener, endpoint) = listener().await;

        let session = TransportSession::open(endpoint, quick());
        let (mut peer, _) = listener.accept().await.expect("Must accept connection");
        session
            .wait_for(ConnectionState::Connected)
            .await
            .expect("Must connect");

        let handle = session
            .transactions()
            .submit(1, 0x03, &[0x00, 0x00, 0x00, 0x01], Duration::from_secs(5))
            .await
            .expect("Must submit");

        let mut request = [0u8; 12];
        peer.read_exact(&mut request).await.expect("Must read request");
        drop(peer);

        let started = tokio::time::Instant::now();
        assert!(matches!(handle.wait().await, Err(Error::ConnectionLost)));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(session.pending_count(), 0);

        session.close();
    }

    #[tokio::test]
    async fn requeued_transactions_survive_a_reconnect() {
        init();
        let (listener, endpoint) = listener().await;

        let config = SessionConfig {
            requeue: RequeuePolicy::Requeue,
            response_timeout: Duration::from_secs(5),
            ..quick()
        };
        let session = TransportSession::open(endpoint, config);

        let (mut peer, _) = listener.accept().await.expect("Must accept connection");
        session
            .wait_for(ConnectionState::Connected)
            .await
            .expect("Must connect");

        let handle = session
            .transactions()
            .submit(9, 0x06, &[0x00, 0x04, 0x00, 0x2A], Duration::from_secs(5))
            .await
            .expect("Must submit");

        let mut request = [0u8; 12];
        peer.read_exact(&mut request).await.expect("Must read request");
        drop(peer);

        // The same frame is written again on the next link and answered there.
        let (mut peer, _) = listener.accept().await.expect("Must accept reconnection");
        let mut replayed = [0u8; 12];
        peer.read_exact(&mut replayed).await.expect("Must read replay");
        assert_eq!(replayed, request);

        peer.write_all(&replayed).await.expect("Must write echo");

        let pdu = handle.wait().await.expect("Must resolve after requeue");
        assert_eq!(pdu.data, vec![0x00, 0x04, 0x00, 0x2A]);

        session.close();
    }

    #[tokio::test]
    async fn close_fails_waiters_and_refuses_new_work() {
        init();
        let (listener, endpoint) = listener().await;

        let session = TransportSession::open(endpoint, quick());
        let (_peer, _) = listener.accept().await.expect("Must accept connection");
        session
            .wait_for(ConnectionState::Connected)
            .await
            .expect("Must connect");

        let handle = session
            .transactions()
            .submit(1, 0x01, &[0x00, 0x00, 0x00, 0x08], Duration::from_secs(5))
            .await
            .expect("Must submit");

        session.close();
        assert!(matches!(handle.wait().await, Err(Error::ConnectionLost)));

        let refused = session
            .transactions()
            .submit(1, 0x01, &[0x00, 0x00, 0x00, 0x08], Duration::from_secs(5))
            .await;
        assert!(matches!(refused, Err(Error::ConnectionLost)));
    }
}

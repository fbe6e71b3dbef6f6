// ABOUTME: Owns one socket end to end: framed reads, a queued/backpressured write path, and the
// ABOUTME: close state machine tying both to the rest of the connection's in-flight work

use crate::config::{ConnectionManagerConfig, SLOW_CONSUMER_THRESHOLD};
use crate::manager::ConnectionManager;
use crate::message::NetworkMessage;
use crate::output_message::OutputMessage;
use crate::protocol::{Protocol, ServicePort};
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, Weak};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, warn};

/// Opaque identity for a [`Connection`], stable for its whole lifetime.
/// Used only as a registry key; callers that need to distinguish connections
/// should hold the `Arc<Connection>` itself.
pub type ConnectionId = u64;

/// Close-intent state, advancing monotonically `None -> Requested -> Closing`.
///
/// `None`: no one has asked to close this connection yet.
/// `Requested`: [`Connection::close`] has been called; a `closeConnection`-
/// equivalent task has been posted to the dispatcher but has not yet run.
/// `Closing`: the dispatcher has started teardown. The protocol has been (or
/// is being) detached and the socket will be shut down as soon as any
/// in-flight writes drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseState {
    None,
    Requested,
    Closing,
}

struct ConnectionState {
    close_state: CloseState,
    protocol: Option<Arc<dyn Protocol>>,
    received_first: bool,
    read_error: bool,
    write_error: bool,
    socket_closed: bool,
    /// Whether the read-loop task is still alive. There is only ever one
    /// outstanding read per connection, so this plays the role of the
    /// specification's `pendingRead` counter (always 0 or 1 in practice).
    read_loop_alive: bool,
    /// True once a release task has been posted, so teardown never posts a
    /// second one no matter how many times `progress_teardown` is called.
    released: bool,
    /// Count of outbound frames currently in flight or waiting in the
    /// channel to the writer task. Matches the spec's combined
    /// in-flight-plus-queued `pendingWrite` tally exactly.
    pending_write: usize,
}

impl ConnectionState {
    fn fresh() -> Self {
        ConnectionState {
            close_state: CloseState::None,
            protocol: None,
            received_first: false,
            read_error: false,
            write_error: false,
            socket_closed: false,
            read_loop_alive: false,
            released: false,
            pending_write: 0,
        }
    }
}

/// What `progress_teardown` should do once it has evaluated the locked state.
/// Kept separate from the lock itself (see `progress_teardown_locked`) so the
/// actual socket/dispatcher work happens after the `MutexGuard` is already
/// out of scope.
struct TeardownStep {
    /// Flip the shared "closing" signal so the writer task performs the
    /// actual graceful shutdown and both I/O tasks stop.
    signal_shutdown: bool,
    /// Post the release task to the dispatcher.
    release: bool,
}

/// Holds the channel halves between construction and `begin`. A connection is
/// either idle (holding these) or running (having moved them into its
/// tasks); this is a single always-consumed-once handoff.
type PendingIo = (
    mpsc::UnboundedReceiver<OutputMessage>,
    watch::Receiver<bool>,
);

/// One TCP connection: a socket, its read/write tasks, an attached
/// [`Protocol`], and the close state machine gluing them together.
///
/// A `Connection` is always held behind `Arc`. There is no explicit reference
/// count: the [`ConnectionManager`]'s registry, the read-loop task, and the
/// write-loop task are each an independent strong owner, and whichever owner
/// drops last runs the real `Drop` teardown. `Arc` gives this for free in
/// place of a manually polled `refCount`.
pub struct Connection {
    id: ConnectionId,
    state: Mutex<ConnectionState>,
    stream: Mutex<Option<TcpStream>>,
    pending_io: Mutex<Option<PendingIo>>,
    peer_ip: Ipv4Addr,
    port: Weak<dyn ServicePort>,
    dispatcher: Arc<dyn crate::dispatcher::Dispatcher>,
    manager: Weak<ConnectionManager>,
    config: ConnectionManagerConfig,
    outbound_tx: mpsc::UnboundedSender<OutputMessage>,
    closing_tx: watch::Sender<bool>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer_ip", &self.peer_ip)
            .finish()
    }
}

impl Connection {
    /// Construct a registered-but-idle connection. Neither the read nor the
    /// write task starts until [`Connection::handle`] or [`Connection::start`]
    /// is called.
    pub(crate) fn new(
        id: ConnectionId,
        stream: TcpStream,
        port: Weak<dyn ServicePort>,
        dispatcher: Arc<dyn crate::dispatcher::Dispatcher>,
        manager: Weak<ConnectionManager>,
        config: ConnectionManagerConfig,
    ) -> Arc<Connection> {
        let peer_ip = peer_ipv4(&stream);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (closing_tx, closing_rx) = watch::channel(false);

        Arc::new(Connection {
            id,
            state: Mutex::new(ConnectionState::fresh()),
            stream: Mutex::new(Some(stream)),
            pending_io: Mutex::new(Some((outbound_rx, closing_rx))),
            peer_ip,
            port,
            dispatcher,
            manager,
            config,
            outbound_tx,
            closing_tx,
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Current remote IPv4 address: cached at accept time (the socket is
    /// gone by the time anyone would ask after a close), or
    /// [`Ipv4Addr::UNSPECIFIED`] if the peer address could not be determined.
    pub fn get_ip(&self) -> Ipv4Addr {
        self.peer_ip
    }

    pub fn close_state(&self) -> CloseState {
        self.state.lock().unwrap().close_state
    }

    /// Install a preselected protocol (used by a service port that always
    /// serves one protocol, e.g. a login gateway), invoke `on_connect`, then
    /// arm the first read. Valid only once, while the connection is still in
    /// `CloseState::None`.
    pub fn handle(self: &Arc<Self>, protocol: Arc<dyn Protocol>) {
        {
            let mut state = self.state.lock().unwrap();
            debug_assert_eq!(state.close_state, CloseState::None);
            protocol.set_connection(Some(Arc::clone(self)));
            state.protocol = Some(Arc::clone(&protocol));
        }
        protocol.on_connect();
        self.begin();
    }

    /// Arm the first read without preinstalling a protocol; the attached
    /// [`ServicePort`] chooses one once the first frame arrives.
    pub fn start(self: &Arc<Self>) {
        self.begin();
    }

    fn begin(self: &Arc<Self>) {
        let stream = self
            .stream
            .lock()
            .unwrap()
            .take()
            .expect("Connection::begin called more than once");
        let (read_half, write_half) = stream.into_split();
        let (outbound_rx, closing_rx) = self
            .pending_io
            .lock()
            .unwrap()
            .take()
            .expect("Connection::begin called more than once");

        self.state.lock().unwrap().read_loop_alive = true;

        let writer_conn = Arc::clone(self);
        let writer_closing_rx = closing_rx.clone();
        tokio::spawn(Connection::run_writer(
            writer_conn,
            write_half,
            outbound_rx,
            writer_closing_rx,
        ));

        let reader_conn = Arc::clone(self);
        let reader_port = self.port.clone();
        tokio::spawn(Connection::run_reader(
            reader_conn,
            read_half,
            closing_rx,
            reader_port,
        ));
    }

    /// Enqueue or transmit one outbound frame. Returns `false` if the
    /// connection is already closing or has a sticky write error; `true`
    /// otherwise. Success only means the frame was accepted, not that it has
    /// reached the wire.
    pub fn send(self: &Arc<Self>, msg: OutputMessage) -> bool {
        if self.closing_or_errored() {
            return false;
        }

        if let Some(protocol) = msg.protocol() {
            protocol.on_send_message(&msg);
        }

        let mut should_kill_slow_consumer = false;
        {
            let mut state = self.state.lock().unwrap();
            if state.close_state == CloseState::Closing || state.write_error {
                return false;
            }
            state.pending_write += 1;
            if state.pending_write > SLOW_CONSUMER_THRESHOLD && self.config.force_close_slow_connection
            {
                should_kill_slow_consumer = true;
            }

            // Enqueueing onto the wire-order channel while still holding the
            // lock keeps "increment pending_write" and "hand the frame to the
            // writer task" atomic with respect to other callers of `send`, so
            // wire order always matches call order. `UnboundedSender::send`
            // never blocks, so this is safe to do under a std::sync::Mutex.
            // An error here means the writer task is already gone (teardown
            // in progress); the frame is simply dropped, matching "success
            // does not imply transmission".
            let _ = self.outbound_tx.send(msg);
        }

        if should_kill_slow_consumer {
            warn!(connection = self.id, "forcing slow connection to disconnect");
            self.close();
        }

        true
    }

    fn closing_or_errored(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.close_state == CloseState::Closing || state.write_error
    }

    /// Request shutdown. Safe to call from any thread, any number of times:
    /// only the first call in `CloseState::None` does anything. Actual
    /// teardown runs asynchronously via the dispatcher.
    pub fn close(self: &Arc<Self>) {
        let should_post = {
            let mut state = self.state.lock().unwrap();
            if state.close_state != CloseState::None {
                false
            } else {
                state.close_state = CloseState::Requested;
                true
            }
        };

        if should_post {
            let conn = Arc::clone(self);
            self.dispatcher.add_task(Box::new(move || {
                conn.close_connection();
            }));
        }
    }

    /// Runs on the dispatcher. Detaches the protocol (posting its
    /// `release_protocol` as a further dispatcher task) and begins
    /// progressing teardown.
    fn close_connection(self: Arc<Self>) {
        let protocol = {
            let mut state = self.state.lock().unwrap();
            if state.close_state != CloseState::Requested {
                error!(
                    connection = self.id,
                    state = ?state.close_state,
                    "close_connection observed an unexpected close state"
                );
                return;
            }
            state.close_state = CloseState::Closing;
            state.protocol.take()
        };

        if let Some(protocol) = protocol {
            protocol.set_connection(None);
            self.dispatcher.add_task(Box::new(move || {
                protocol.release_protocol();
            }));
        }

        self.progress_teardown();
    }

    /// Re-evaluate teardown progress under the connection lock, then act on
    /// the decision after the lock is released. Splitting the decision
    /// (`progress_teardown_locked`) from its effects replaces a "return value
    /// tells the caller whether it still holds the lock" pattern: the
    /// `MutexGuard` here always drops normally at the end of its scope, and
    /// `TeardownStep` names what happens next instead.
    fn progress_teardown(self: &Arc<Self>) {
        let step = {
            let mut state = self.state.lock().unwrap();
            Self::progress_teardown_locked(&mut state)
        };

        if step.signal_shutdown {
            // The writer task observes this and performs the graceful
            // shutdown itself; both I/O tasks then exit, which is this
            // crate's equivalent of every outstanding operation completing
            // with "operation_aborted" and being silently absorbed.
            let _ = self.closing_tx.send(true);
        }

        if step.release {
            let conn = Arc::clone(self);
            self.dispatcher.add_task(Box::new(move || {
                conn.finish_release();
            }));
        }
    }

    fn progress_teardown_locked(state: &mut ConnectionState) -> TeardownStep {
        if state.close_state != CloseState::Closing {
            return TeardownStep {
                signal_shutdown: false,
                release: false,
            };
        }

        let writes_drained = state.pending_write == 0 || state.write_error;
        let mut step = TeardownStep {
            signal_shutdown: false,
            release: false,
        };

        if writes_drained && !state.socket_closed {
            state.socket_closed = true;
            step.signal_shutdown = true;
        }

        if writes_drained && state.socket_closed && !state.read_loop_alive && !state.released {
            state.released = true;
            step.release = true;
        }

        step
    }

    fn finish_release(self: Arc<Self>) {
        if let Some(manager) = self.manager.upgrade() {
            manager.release_connection(self.id);
        }
        debug!(connection = self.id, "connection released");
    }

    async fn run_writer(
        conn: Arc<Connection>,
        mut write_half: OwnedWriteHalf,
        mut outbound_rx: mpsc::UnboundedReceiver<OutputMessage>,
        mut closing_rx: watch::Receiver<bool>,
    ) {
        loop {
            if *closing_rx.borrow() {
                break;
            }

            tokio::select! {
                maybe_msg = outbound_rx.recv() => {
                    match maybe_msg {
                        Some(msg) => conn.write_one(&mut write_half, msg).await,
                        None => break,
                    }
                }
                _ = closing_rx.changed() => {}
            }
        }

        let _ = write_half.shutdown().await;
    }

    async fn write_one(self: &Arc<Self>, write_half: &mut OwnedWriteHalf, msg: OutputMessage) {
        let result = write_half.write_all(msg.as_bytes()).await;

        let had_error = result.is_err();
        {
            let mut state = self.state.lock().unwrap();
            state.pending_write -= 1;
            if had_error {
                state.write_error = true;
            }
        }

        if let Err(err) = result {
            self.log_transport_error("write", &err);
        }

        // Mirrors the original's unconditional "if CLOSING, invoke write()"
        // at the end of onWrite: cheap and a no-op unless teardown is
        // actually in progress.
        self.progress_teardown();
    }

    async fn run_reader(
        conn: Arc<Connection>,
        mut read_half: OwnedReadHalf,
        mut closing_rx: watch::Receiver<bool>,
        port: Weak<dyn ServicePort>,
    ) {
        let mut message = NetworkMessage::new();

        loop {
            if *closing_rx.borrow() {
                break;
            }

            let Some(result) =
                select_read(read_half.read_exact(message.header_slot()), &mut closing_rx).await
            else {
                continue;
            };

            if let Err(err) = result {
                conn.handle_read_completion_error(err);
                break;
            }

            if conn.close_state() == CloseState::Closing {
                break;
            }

            let size = match message.decode_header() {
                Ok(size) => size,
                Err(err) => {
                    warn!(connection = conn.id, %err, "rejecting frame with invalid header");
                    conn.mark_read_error_and_close();
                    break;
                }
            };

            let Some(result) =
                select_read(read_half.read_exact(message.body_slot(size)), &mut closing_rx).await
            else {
                continue;
            };

            if let Err(err) = result {
                conn.handle_read_completion_error(err);
                break;
            }

            if conn.close_state() == CloseState::Closing {
                break;
            }

            let checksum_enabled = message.try_consume_checksum();

            if !conn.dispatch_frame(checksum_enabled, &mut message, &port) {
                break;
            }
        }

        conn.mark_read_loop_ended();
    }

    /// Deliver one decoded frame to the attached protocol, selecting a
    /// protocol via the service port on the very first frame if none was
    /// preinstalled. Returns `false` if the connection should stop reading
    /// (service port refused the connection, or it vanished).
    fn dispatch_frame(
        self: &Arc<Self>,
        checksum_enabled: bool,
        message: &mut NetworkMessage,
        port: &Weak<dyn ServicePort>,
    ) -> bool {
        // Read `received_first`/flip it and snapshot the current protocol in
        // one lock acquisition. `close_connection` (run from any thread via
        // `close()`) clears `state.protocol` under its own lock acquisition;
        // if `is_first` and the protocol snapshot were taken under separate
        // acquisitions, that clear could land in between and this function
        // would wrongly treat a preinstalled-but-just-detached protocol as
        // absent, re-selecting and re-attaching a brand-new one to a
        // connection already on its way into `Closing` (violating invariant
        // 5: a cleared protocol is never re-set).
        let (is_first, existing_protocol) = {
            let mut state = self.state.lock().unwrap();
            let first = !state.received_first;
            state.received_first = true;
            (first, state.protocol.clone())
        };

        let protocol = match existing_protocol {
            Some(protocol) => {
                if is_first {
                    // A protocol was preinstalled via `handle`; its leading
                    // tag byte is opaque and intentionally never validated.
                    message.skip_preinstalled_tag();
                }
                protocol
            }
            None if is_first => {
                let Some(port) = port.upgrade() else {
                    self.close();
                    return false;
                };
                match port.make_protocol(checksum_enabled, message) {
                    Some(protocol) => {
                        protocol.set_connection(Some(Arc::clone(self)));
                        let mut state = self.state.lock().unwrap();
                        if state.close_state == CloseState::Closing {
                            // The connection started closing while the port
                            // was selecting a protocol. Honor invariant 5:
                            // don't re-set a protocol on a connection already
                            // in Closing.
                            drop(state);
                            protocol.set_connection(None);
                            return false;
                        }
                        state.protocol = Some(Arc::clone(&protocol));
                        protocol
                    }
                    None => {
                        self.close();
                        return false;
                    }
                }
            }
            None => {
                error!(connection = self.id, "no protocol attached for a non-first frame");
                self.close();
                return false;
            }
        };

        if is_first {
            protocol.on_recv_first_message(message);
        } else {
            protocol.on_recv_message(message);
        }
        true
    }

    fn mark_read_error_and_close(self: &Arc<Self>) {
        self.state.lock().unwrap().read_error = true;
        self.close();
    }

    fn handle_read_completion_error(self: &Arc<Self>, err: std::io::Error) {
        self.log_transport_error("read", &err);
        self.state.lock().unwrap().read_error = true;
        self.close();
    }

    fn log_transport_error(&self, direction: &str, err: &std::io::Error) {
        use std::io::ErrorKind::*;
        match err.kind() {
            UnexpectedEof | ConnectionReset | ConnectionAborted => {
                debug!(connection = self.id, direction, %err, "peer closed the connection");
            }
            _ => {
                warn!(connection = self.id, direction, %err, "transport error");
            }
        }
    }

    fn mark_read_loop_ended(self: &Arc<Self>) {
        self.state.lock().unwrap().read_loop_alive = false;
        self.progress_teardown();
    }
}

/// Race a read future against the shared shutdown signal. Returns `None` if
/// the signal fired first -- the caller should loop back to the top, where
/// the `*closing_rx.borrow()` check turns that into a clean exit. This is
/// this crate's stand-in for cancelling an in-flight read with
/// `operation_aborted` when the socket is closed out from under it.
async fn select_read<F, T>(
    read_fut: F,
    closing_rx: &mut watch::Receiver<bool>,
) -> Option<std::io::Result<T>>
where
    F: std::future::Future<Output = std::io::Result<T>>,
{
    tokio::select! {
        res = read_fut => Some(res),
        _ = closing_rx.changed() => None,
    }
}

fn peer_ipv4(stream: &TcpStream) -> Ipv4Addr {
    match stream.peer_addr() {
        Ok(addr) => match addr.ip() {
            std::net::IpAddr::V4(v4) => v4,
            std::net::IpAddr::V6(v6) => v6.to_ipv4().unwrap_or(Ipv4Addr::UNSPECIFIED),
        },
        Err(err) => {
            warn!(%err, "failed to read remote address");
            Ipv4Addr::UNSPECIFIED
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(|p| p.into_inner());
        debug_assert!(
            state.socket_closed,
            "connection {} dropped without completing socket teardown",
            self.id
        );
    }
}

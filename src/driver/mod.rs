//! The socket-level IRC connection driver.
//!
//! [`SocketDriver`] owns one TCP connection: it flushes queued outbound
//! messages, frames the inbound byte stream into lines, and supervises the
//! whole lifecycle with a reconnection state machine (exponential backoff,
//! server-list failover, half-open-connection detection).
//!
//! The driver is built for a single-threaded cooperative model: an external
//! scheduler invokes [`SocketDriver::tick`] repeatedly, and every socket
//! operation either returns immediately or waits under a bounded timeout,
//! so one connection's stall cannot starve others driven by the same task.
//! [`SocketDriver::drive`] is the convenience loop over `fire_due` + `tick`.

pub mod backoff;
pub mod framer;
pub mod servers;

use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use futures_util::FutureExt;
use tokio::net::{TcpSocket, TcpStream, lookup_host};
use tokio::time::{Instant, timeout};
use tracing::{debug, error, info, warn};

use crate::config::{Endpoint, SharedConfig};
use crate::dispatch::Dispatch;
use crate::error::DriverError;
use backoff::Backoff;
use framer::LineFramer;
use servers::ServerRotation;

/// Bytes pulled from the socket per read.
const READ_CHUNK: usize = 4096;

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// No live socket; a reconnect may be scheduled.
    Disconnected,
    /// A connect is in progress, awaiting the connectedness check.
    Connecting,
    /// Live socket; the pump moves data.
    Connected,
    /// Marked for shutdown; buffered output still drains.
    Zombie,
    /// Socket closed and resources released.
    Closed,
}

/// Deferred work the driver schedules for itself. At most one callback is
/// outstanding at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerEvent {
    /// Retry the connection, resetting session state.
    Reconnect,
    /// Probe an in-progress connect for writability.
    ConnectednessCheck,
}

#[derive(Debug)]
struct Scheduled {
    deadline: Instant,
    event: TimerEvent,
}

type PendingConnect = Pin<Box<dyn Future<Output = io::Result<TcpStream>> + Send>>;

/// Driver for one IRC server connection.
pub struct SocketDriver<D: Dispatch> {
    dispatch: D,
    config: SharedConfig,
    status: Status,
    conn: Option<TcpStream>,
    /// Connect future retained while the attempt is still in progress.
    pending_connect: Option<PendingConnect>,
    rotation: ServerRotation,
    backoff: Backoff,
    framer: LineFramer,
    outbuffer: BytesMut,
    /// Consecutive would-block errors tolerated so far.
    transients: u32,
    /// The single outstanding reconnect/check callback, if any.
    scheduled: Option<Scheduled>,
}

impl<D: Dispatch> SocketDriver<D> {
    /// Create a driver for the configured network.
    ///
    /// Fails fast when every configured endpoint requires TLS: this driver
    /// only speaks plaintext.
    pub fn new(config: SharedConfig, dispatch: D) -> Result<Self, DriverError> {
        let (backoff, all_tls) = {
            let cfg = config.read();
            let backoff = Backoff::new(cfg.driver.base_wait(), cfg.driver.max_wait());
            let all_tls =
                !cfg.network.servers.is_empty() && cfg.network.servers.iter().all(|s| s.tls);
            (backoff, all_tls)
        };
        if all_tls {
            error!("the socket driver cannot connect to TLS servers; use a TLS-capable driver");
            return Err(DriverError::TlsUnsupported);
        }
        Ok(Self {
            dispatch,
            config,
            status: Status::Disconnected,
            conn: None,
            pending_connect: None,
            rotation: ServerRotation::new(),
            backoff,
            framer: LineFramer::new(),
            outbuffer: BytesMut::new(),
            transients: 0,
            scheduled: None,
        })
    }

    /// Current lifecycle state.
    pub fn status(&self) -> Status {
        self.status
    }

    /// The dispatch layer this driver feeds.
    pub fn dispatch(&self) -> &D {
        &self.dispatch
    }

    /// Mutable access to the dispatch layer.
    pub fn dispatch_mut(&mut self) -> &mut D {
        &mut self.dispatch
    }

    /// The pending callback, if any, with its fire time.
    pub fn scheduled(&self) -> Option<(TimerEvent, Instant)> {
        self.scheduled.as_ref().map(|s| (s.event, s.deadline))
    }

    fn network(&self) -> String {
        self.config.read().network.name.clone()
    }

    /// Connect for the first time, preserving any session state.
    pub async fn connect(&mut self) -> Result<(), DriverError> {
        self.reconnect(false).await
    }

    /// Tear down any live socket and start a fresh connection attempt.
    ///
    /// `reset` clears higher-level session state (nick registration,
    /// channel membership); a reconnect that wants to keep its context
    /// passes `false`.
    pub async fn reconnect(&mut self, reset: bool) -> Result<(), DriverError> {
        if matches!(self.status, Status::Zombie | Status::Closed) {
            debug!(network = %self.network(), "ignoring reconnect on a dying driver");
            return Ok(());
        }
        self.cancel_scheduled();
        self.pending_connect = None;
        if self.status == Status::Connected {
            info!(network = %self.network(), "reconnecting");
            self.conn = None;
        }
        self.status = Status::Disconnected;

        if reset {
            debug!(network = %self.network(), "resetting session state");
            self.dispatch.reset_session();
        } else {
            debug!(network = %self.network(), "not resetting session state");
        }

        // Per-connection buffers die with the old socket. Messages still
        // queued in the dispatch layer are unaffected.
        self.framer = LineFramer::new();
        self.outbuffer.clear();
        self.transients = 0;

        let (servers, network, bind, tuning) = {
            let cfg = self.config.read();
            (
                cfg.network.servers.clone(),
                cfg.network.name.clone(),
                cfg.network.bind_address,
                cfg.driver.clone(),
            )
        };

        let (server, changed) = self.rotation.next(&servers, &network)?;
        if changed {
            self.backoff.reset();
        }
        info!(server = %server, network = %network, "connecting");

        if server.tls {
            self.connect_error(&server, &"endpoint requires TLS, which this driver cannot speak");
            return Ok(());
        }

        let addr = match lookup_host((server.host.as_str(), server.port)).await {
            Ok(mut addrs) => match addrs.next() {
                Some(addr) => addr,
                None => {
                    self.connect_error(&server, &"host resolved to no addresses");
                    return Ok(());
                }
            },
            Err(e) => {
                self.connect_error(&server, &e);
                return Ok(());
            }
        };

        // Socket creation and local binding happen before any network
        // traffic; a failure here retries without a connect attempt.
        let socket = match new_socket_for(addr) {
            Ok(socket) => socket,
            Err(e) => {
                self.connect_error(&server, &e);
                return Ok(());
            }
        };
        if let Some(vhost) = bind {
            if let Err(e) = socket.bind(SocketAddr::new(vhost, 0)) {
                self.connect_error(&server, &e);
                return Ok(());
            }
        }

        // Allow extra time for the connect; connection setup can take
        // longer than steady-state I/O.
        let mut fut: PendingConnect = Box::pin(socket.connect(addr));
        match timeout(tuning.connect_timeout(), &mut fut).await {
            Ok(Ok(stream)) => self.establish(stream),
            Ok(Err(e)) => self.connect_error(&server, &e),
            Err(_) => {
                // Not failed yet, just slow. Keep the attempt alive and
                // probe it for writability later.
                let delay = tuning.probe_delay();
                let when = chrono::Local::now()
                    + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
                debug!(
                    at = %when.format("%H:%M:%S"),
                    "connection in progress, scheduling connectedness check"
                );
                self.pending_connect = Some(fut);
                self.status = Status::Connecting;
                self.schedule(TimerEvent::ConnectednessCheck, delay)?;
            }
        }
        Ok(())
    }

    /// Record a successfully opened socket and narrow the driver back to
    /// steady-state I/O.
    fn establish(&mut self, stream: TcpStream) {
        if let Err(e) = enable_keepalive(&stream) {
            warn!(error = %e, "failed to enable TCP keepalive");
        }
        self.conn = Some(stream);
        self.status = Status::Connected;
        self.transients = 0;
        self.backoff.reset();
        if let Some(server) = self.rotation.current() {
            info!(server = %server, "connected");
        }
    }

    /// Writability probe for a connect that was still in progress.
    async fn check_connectedness(&mut self) -> Result<(), DriverError> {
        debug!(network = %self.network(), "checking whether we are connected");
        match self.pending_connect.take() {
            Some(mut fut) => match (&mut fut).now_or_never() {
                Some(Ok(stream)) => {
                    debug!("socket is writable, it might be connected");
                    self.establish(stream);
                    Ok(())
                }
                Some(Err(e)) => {
                    if let Some(server) = self.rotation.current() {
                        error!(server = %server, error = %e, "connect failed");
                    }
                    self.status = Status::Disconnected;
                    self.reconnect(true).await
                }
                None => {
                    if let Some(server) = self.rotation.current() {
                        error!(server = %server, "connect timed out");
                    }
                    self.status = Status::Disconnected;
                    self.reconnect(true).await
                }
            },
            // The check fired with nothing pending; treat it as a plain
            // retry.
            None => self.reconnect(true).await,
        }
    }

    /// Schedule a reconnect after the current backoff delay.
    ///
    /// Returns [`DriverError::DuplicateSchedule`] if a callback is already
    /// outstanding; the existing timer is left in place.
    pub fn schedule_reconnect(&mut self) -> Result<(), DriverError> {
        let delay = self.backoff.next_delay();
        if !self.dispatch.is_shutting_down() {
            info!(
                network = %self.network(),
                delay_secs = delay.as_secs_f64(),
                "scheduling reconnect"
            );
        }
        self.schedule(TimerEvent::Reconnect, delay)
    }

    /// Arm the single callback slot.
    fn schedule(&mut self, event: TimerEvent, delay: Duration) -> Result<(), DriverError> {
        if self.scheduled.is_some() {
            error!(
                network = %self.network(),
                ?event,
                "scheduling a driver callback while one is already scheduled; \
                 this is a bug, please report it"
            );
            return Err(DriverError::DuplicateSchedule);
        }
        self.scheduled = Some(Scheduled {
            deadline: Instant::now() + delay,
            event,
        });
        Ok(())
    }

    fn cancel_scheduled(&mut self) {
        self.scheduled = None;
    }

    /// Fire the pending callback if its deadline has passed.
    ///
    /// Returns `true` when a callback ran.
    pub async fn fire_due(&mut self) -> Result<bool, DriverError> {
        let now = Instant::now();
        match self.scheduled.take_if(|s| s.deadline <= now) {
            Some(Scheduled {
                event: TimerEvent::Reconnect,
                ..
            }) => {
                self.reconnect(true).await?;
                Ok(true)
            }
            Some(Scheduled {
                event: TimerEvent::ConnectednessCheck,
                ..
            }) => {
                self.check_connectedness().await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// One pump cycle: flush queued output, ingest available input, then
    /// flush once more so replies to this tick's input go out promptly.
    ///
    /// Invoked once per scheduler tick. Without a live socket this sleeps
    /// for the poll interval (or until the pending callback is due) so an
    /// idle driver cannot spin.
    pub async fn tick(&mut self) -> Result<(), DriverError> {
        if !matches!(self.status, Status::Connected | Status::Zombie) {
            self.idle_wait().await;
            return Ok(());
        }

        self.send_if_msgs();
        if matches!(self.status, Status::Connected | Status::Zombie) {
            self.recv_available().await;
        }
        if matches!(self.status, Status::Connected | Status::Zombie)
            && !self.dispatch.is_shutting_down()
        {
            self.send_if_msgs();
        }
        Ok(())
    }

    /// Connect and pump until the connection closes.
    pub async fn drive(&mut self) -> Result<(), DriverError> {
        self.connect().await?;
        while self.status != Status::Closed {
            if self.fire_due().await? {
                continue;
            }
            self.tick().await?;
        }
        Ok(())
    }

    /// Begin a graceful shutdown: refuse new outbound work, cancel any
    /// pending callback, and drain buffered output before closing.
    pub fn die(&mut self) {
        if self.status == Status::Closed {
            return;
        }
        self.cancel_scheduled();
        info!(driver = %self, "driver dying");
        self.status = Status::Zombie;
        if self.conn.is_none() {
            // No socket means no output can drain; finish immediately.
            self.pending_connect = None;
            self.really_die();
        }
    }

    /// Complete the zombie shutdown: close the socket and unregister from
    /// the dispatch layer.
    fn really_die(&mut self) {
        self.conn = None;
        self.pending_connect = None;
        self.status = Status::Closed;
        info!(driver = %self, "driver closed");
        self.dispatch.connection_closed();
    }

    /// Drain queued outbound messages into the buffer and push as much as
    /// the socket will take, retaining the unsent suffix. Completes the
    /// zombie shutdown once the buffer is empty.
    fn send_if_msgs(&mut self) {
        if self.status != Status::Zombie {
            while let Some(msg) = self.dispatch.take_outbound() {
                self.dispatch.encode(&msg, &mut self.outbuffer);
            }
        }
        if !self.outbuffer.is_empty() {
            if let Some(conn) = self.conn.as_ref() {
                match conn.try_write(&self.outbuffer) {
                    Ok(sent) => {
                        self.outbuffer.advance(sent);
                        self.transients = 0;
                    }
                    Err(e) => self.handle_socket_error(e),
                }
            }
        }
        if self.status == Status::Zombie && self.outbuffer.is_empty() {
            self.really_die();
        }
    }

    /// Wait up to one poll interval for readability, then take what is
    /// there. A quiet interval is not an error.
    async fn recv_available(&mut self) {
        let poll = self.config.read().driver.poll();
        let readable = match self.conn.as_ref() {
            Some(conn) => timeout(poll, conn.readable()).await,
            None => return,
        };
        match readable {
            // No data ready this tick.
            Err(_) => return,
            Ok(Err(e)) => {
                self.handle_socket_error(e);
                return;
            }
            Ok(Ok(())) => {}
        }

        let mut chunk = [0u8; READ_CHUNK];
        let read = match self.conn.as_ref() {
            Some(conn) => conn.try_read(&mut chunk),
            None => return,
        };
        match read {
            Ok(0) => {
                // Zero-byte read: the peer closed on us.
                self.handle_socket_error(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed by peer",
                ));
            }
            Ok(n) => {
                self.transients = 0;
                match self.framer.feed(&chunk[..n]) {
                    Ok(lines) => {
                        for line in lines {
                            if let Some(msg) = self.dispatch.parse_line(&line) {
                                self.dispatch.feed_inbound(msg);
                            }
                        }
                    }
                    Err(e) => self.handle_socket_error(e),
                }
            }
            // Readiness was spurious; nothing to read after all.
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => self.handle_socket_error(e),
        }
    }

    /// Sleep out the poll interval, or less if the pending callback comes
    /// due sooner.
    async fn idle_wait(&self) {
        let poll = self.config.read().driver.poll();
        let wait = match &self.scheduled {
            Some(s) => s.deadline.saturating_duration_since(Instant::now()).min(poll),
            None => poll,
        };
        tokio::time::sleep(wait).await;
    }

    /// Classify a socket error: would-block is transient until the ceiling,
    /// anything else tears the connection down and schedules a retry.
    fn handle_socket_error(&mut self, e: io::Error) {
        let limit = self.config.read().driver.transient_error_limit;
        if e.kind() == io::ErrorKind::WouldBlock && self.transients < limit {
            debug!(count = self.transients, "got a would-block, tolerating");
            self.transients += 1;
            return;
        }

        match self.rotation.current() {
            Some(server) => error!(server = %server, error = %e, "disconnect"),
            None => error!(error = %e, "disconnect"),
        }
        if self.status == Status::Zombie {
            // Nothing left can drain through a dead socket.
            self.really_die();
            return;
        }
        self.conn = None;
        self.pending_connect = None;
        self.status = Status::Disconnected;
        if let Err(err) = self.schedule_reconnect() {
            error!(error = %err, "could not schedule a reconnect");
        }
    }

    /// Log a failed connection attempt and schedule the retry.
    fn connect_error(&mut self, server: &Endpoint, e: &dyn fmt::Display) {
        error!(server = %server, error = %e, "connect failed");
        self.status = Status::Disconnected;
        if let Err(err) = self.schedule_reconnect() {
            error!(error = %err, "could not schedule a reconnect");
        }
    }
}

impl<D: Dispatch> fmt::Display for SocketDriver<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SocketDriver({})", self.config.read().network.name)
    }
}

fn new_socket_for(addr: SocketAddr) -> io::Result<TcpSocket> {
    if addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
}

fn enable_keepalive(stream: &TcpStream) -> io::Result<()> {
    use socket2::{SockRef, TcpKeepalive};

    let sock = SockRef::from(stream);
    let keepalive = TcpKeepalive::new()
        .with_time(Duration::from_secs(120))
        .with_interval(Duration::from_secs(30));
    sock.set_tcp_keepalive(&keepalive)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, DriverConfig, NetworkConfig};
    use std::collections::VecDeque;

    #[derive(Default)]
    struct NullDispatch {
        outbound: VecDeque<String>,
        inbound: Vec<String>,
        resets: usize,
        closed: bool,
    }

    impl Dispatch for NullDispatch {
        type Msg = String;

        fn take_outbound(&mut self) -> Option<String> {
            self.outbound.pop_front()
        }

        fn feed_inbound(&mut self, msg: String) {
            self.inbound.push(msg);
        }

        fn parse_line(&mut self, line: &[u8]) -> Option<String> {
            Some(String::from_utf8_lossy(line).into_owned())
        }

        fn encode(&mut self, msg: &String, dst: &mut BytesMut) {
            dst.extend_from_slice(msg.as_bytes());
            dst.extend_from_slice(b"\r\n");
        }

        fn reset_session(&mut self) {
            self.resets += 1;
        }

        fn is_shutting_down(&self) -> bool {
            false
        }

        fn connection_closed(&mut self) {
            self.closed = true;
        }
    }

    fn config(servers: Vec<Endpoint>) -> SharedConfig {
        Config {
            network: NetworkConfig {
                name: "testnet".to_string(),
                servers,
                bind_address: None,
            },
            driver: DriverConfig {
                poll_interval: 0.01,
                base_reconnect_wait: 0.05,
                max_reconnect_wait: 0.4,
                min_connect_timeout: 0.1,
                connect_probe_delay: 0.05,
                transient_error_limit: 3,
            },
        }
        .shared()
    }

    fn plain(host: &str, port: u16) -> Endpoint {
        Endpoint {
            host: host.to_string(),
            port,
            tls: false,
        }
    }

    fn tls(host: &str, port: u16) -> Endpoint {
        Endpoint {
            host: host.to_string(),
            port,
            tls: true,
        }
    }

    fn driver(servers: Vec<Endpoint>) -> SocketDriver<NullDispatch> {
        SocketDriver::new(config(servers), NullDispatch::default()).unwrap()
    }

    #[test]
    fn refuses_all_tls_server_lists() {
        let result = SocketDriver::new(
            config(vec![tls("irc.example.org", 6697)]),
            NullDispatch::default(),
        );
        assert!(matches!(result, Err(DriverError::TlsUnsupported)));
    }

    #[test]
    fn duplicate_schedule_is_reported_not_replaced() {
        let mut driver = driver(vec![plain("127.0.0.1", 1)]);

        driver.schedule_reconnect().unwrap();
        let (event, deadline) = driver.scheduled().unwrap();
        assert_eq!(event, TimerEvent::Reconnect);

        assert!(matches!(
            driver.schedule_reconnect(),
            Err(DriverError::DuplicateSchedule)
        ));
        // The original timer survives untouched.
        assert_eq!(driver.scheduled().unwrap(), (event, deadline));
    }

    #[test]
    fn die_cancels_pending_callback() {
        let mut driver = driver(vec![plain("127.0.0.1", 1)]);

        driver.schedule_reconnect().unwrap();
        driver.die();

        assert!(driver.scheduled().is_none());
        // With no socket there is nothing to drain.
        assert_eq!(driver.status(), Status::Closed);
        assert!(driver.dispatch().closed);
    }

    #[test]
    fn would_block_is_tolerated_up_to_the_limit() {
        let mut driver = driver(vec![plain("127.0.0.1", 1)]);

        for _ in 0..3 {
            driver.handle_socket_error(io::Error::from(io::ErrorKind::WouldBlock));
            assert!(driver.scheduled().is_none());
        }

        // The ceiling makes the next one fatal.
        driver.handle_socket_error(io::Error::from(io::ErrorKind::WouldBlock));
        assert_eq!(driver.scheduled().unwrap().0, TimerEvent::Reconnect);
        assert_eq!(driver.status(), Status::Disconnected);
    }

    #[test]
    fn successful_io_resets_the_transient_counter() {
        let mut driver = driver(vec![plain("127.0.0.1", 1)]);
        driver.transients = 2;

        driver.handle_socket_error(io::Error::from(io::ErrorKind::WouldBlock));
        assert!(driver.scheduled().is_none());
        driver.transients = 0;

        for _ in 0..3 {
            driver.handle_socket_error(io::Error::from(io::ErrorKind::WouldBlock));
        }
        assert!(driver.scheduled().is_none());
    }

    #[test]
    fn fatal_error_disconnects_and_schedules_at_backoff_delay() {
        let mut driver = driver(vec![plain("127.0.0.1", 1)]);
        driver.status = Status::Connected;

        driver.handle_socket_error(io::Error::from(io::ErrorKind::ConnectionReset));

        assert_eq!(driver.status(), Status::Disconnected);
        let (event, deadline) = driver.scheduled().unwrap();
        assert_eq!(event, TimerEvent::Reconnect);
        let remaining = deadline.saturating_duration_since(Instant::now());
        assert!(remaining <= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn connectedness_check_promotes_writable_socket() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut driver = driver(vec![plain("127.0.0.1", addr.port())]);

        // Walk the delay up so the reset is observable.
        driver.backoff.next_delay();
        driver.backoff.next_delay();

        let stream = TcpStream::connect(addr).await.unwrap();
        driver.pending_connect = Some(Box::pin(std::future::ready(Ok(stream))));
        driver.status = Status::Connecting;

        driver.check_connectedness().await.unwrap();

        assert_eq!(driver.status(), Status::Connected);
        assert_eq!(driver.backoff.next_delay(), Duration::from_millis(50));
    }

    #[tokio::test]
    async fn connectedness_check_gives_up_on_a_stalled_connect() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut driver = driver(vec![plain("127.0.0.1", addr.port())]);

        driver.pending_connect = Some(Box::pin(futures_util::future::pending()));
        driver.status = Status::Connecting;

        // The stalled attempt is abandoned; the retry lands on the listener.
        driver.check_connectedness().await.unwrap();

        assert_eq!(driver.status(), Status::Connected);
        assert_eq!(driver.dispatch().resets, 1);
    }

    #[test]
    fn zombie_completes_once_the_buffer_drains() {
        let mut driver = driver(vec![plain("127.0.0.1", 1)]);
        driver.status = Status::Zombie;
        driver.outbuffer.extend_from_slice(b"leftover");

        // A fatal error while draining closes immediately.
        driver.handle_socket_error(io::Error::from(io::ErrorKind::BrokenPipe));
        assert_eq!(driver.status(), Status::Closed);
        assert!(driver.dispatch().closed);
    }
}

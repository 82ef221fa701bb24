//! Device session for one fraction collector.
//!
//! A [`DeviceSession`] owns the link to exactly one device and drives a run
//! through this state machine:
//!
//! ```text
//! idle --setup()--> ready --run()--> running <--pause()/resume()--> paused
//! running/paused --stop()--> stopped
//! running --all fractions dispatched--> done
//! running --command failed--> error
//! ```
//!
//! `stopped`, `done` and `error` are terminal; retrying means building a new
//! session.
//!
//! # Run loop
//!
//! Each iteration takes the link, hands the RUN command for the current
//! position to a task that sends it and verifies the echo, advances the
//! position and then sleeps for the dispatch interval. The echo is awaited
//! by the task, not by the loop, so the interval timer runs while the
//! device answers. Commands still go out strictly one at a time because the
//! next iteration cannot take the link until the previous exchange has
//! released it.
//!
//! In-flight tasks live in a [`JoinSet`] owned by the loop: dropping a
//! `run()`/`resume()` future aborts them.
//!
//! Progress is reported on the [`SessionEvents`] stream returned by
//! [`setup`](DeviceSession::setup). The stream is unbounded so a slow
//! consumer never holds up the loop.
//!
//! # Example
//!
//! ```
//! use colosseum::session::{DeviceSession, SessionEvent, SessionSettings};
//! use std::time::Duration;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> colosseum::error::SessionResult<()> {
//! let session = DeviceSession::dry(SessionSettings::default());
//! session.connect().await?;
//! let mut events = session.setup(3, Duration::ZERO).await?;
//! session.run().await?;
//!
//! assert_eq!(events.recv().await, Some(SessionEvent::Progress { position: 0 }));
//! # Ok(())
//! # }
//! ```

use crate::adapters::LineAdapter;
use crate::error::{SessionError, SessionResult};
use crate::protocol::{self, AngleTable, Command, HANDSHAKE_BANNER};
use chrono::{DateTime, Utc};
use futures::Stream;
use parking_lot::Mutex;
use serde::Serialize;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

/// Bound on every request/response exchange with the device.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(5000);

/// Link state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// No link.
    Disconnected,
    /// `connect()` in progress.
    Connecting,
    /// Handshake completed.
    Connected,
}

/// Run state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    /// Not set up yet.
    Idle,
    /// Set up, waiting for `run()`.
    Ready,
    /// Dispatching fractions.
    Running,
    /// Paused by the caller, resumable.
    Paused,
    /// Stopped by the caller.
    Stopped,
    /// Every fraction dispatched.
    Done,
    /// A command failed.
    Error,
}

impl RunState {
    /// Whether no further transition is possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Stopped | RunState::Done | RunState::Error)
    }
}

/// Protocol parameters for a session.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Bound on connect, disconnect and each command exchange.
    pub timeout: Duration,
    /// Exact line the device prints after the port opens.
    pub handshake: String,
    /// Commands sent and verified by `setup()`.
    pub setup_commands: Vec<Command>,
    /// Rotation angle per position.
    pub angles: AngleTable,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            handshake: HANDSHAKE_BANNER.to_string(),
            setup_commands: protocol::setup_commands(
                protocol::DEFAULT_ACCELERATION,
                protocol::DEFAULT_SPEED,
            ),
            angles: AngleTable::builtin(),
        }
    }
}

/// Notifications from the run loop.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The RUN command for `position` was echoed correctly.
    Progress {
        /// Position that was just collected.
        position: usize,
    },
    /// The RUN command for `position` failed; the session is in `error`.
    Error {
        /// Position whose command failed.
        position: usize,
        /// What went wrong.
        error: SessionError,
    },
    /// Every fraction was dispatched. Sent exactly once.
    Done,
}

/// Stream of [`SessionEvent`]s for one run.
///
/// Ends once the session reaches a terminal state and every event has been
/// delivered.
#[derive(Debug)]
pub struct SessionEvents {
    rx: mpsc::UnboundedReceiver<SessionEvent>,
}

impl SessionEvents {
    /// Wait for the next event.
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        self.rx.recv().await
    }

    /// Take an event if one is queued.
    pub fn try_recv(&mut self) -> Option<SessionEvent> {
        self.rx.try_recv().ok()
    }
}

impl Stream for SessionEvents {
    type Item = SessionEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Read-only view of a session, for display and polling.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    /// Link state.
    pub connection: ConnectionState,
    /// Run state.
    pub run_state: RunState,
    /// Link is up.
    pub connected: bool,
    /// `setup()` has completed.
    pub ready: bool,
    /// Paused or stopped.
    pub paused: bool,
    /// Stopped by the caller.
    pub stopped: bool,
    /// Every fraction dispatched.
    pub done: bool,
    /// A command failed.
    pub error: bool,
    /// Next position to dispatch.
    pub position: usize,
    /// Fractions in this run, once set up.
    pub number_of_fractions: Option<usize>,
    /// Dispatch interval in milliseconds, once set up.
    pub interval_ms: Option<u64>,
    /// When `run()` was called.
    pub start_time: Option<DateTime<Utc>>,
    /// Most recent run loop failure.
    pub last_error: Option<String>,
}

#[derive(Debug)]
struct Status {
    connection: ConnectionState,
    run_state: RunState,
    position: usize,
    number_of_fractions: usize,
    interval: Duration,
    start_time: Option<DateTime<Utc>>,
    last_error: Option<SessionError>,
    loop_active: bool,
}

enum Link {
    /// Echo every command without touching hardware.
    Dry,
    Adapter(Box<dyn LineAdapter>),
}

impl Link {
    async fn open(&mut self, handshake: &str) -> SessionResult<String> {
        match self {
            Link::Dry => Ok(handshake.to_string()),
            Link::Adapter(adapter) => {
                // Replies that arrived after the previous session closed
                while let Some(stale) = adapter.try_next_line() {
                    warn!(adapter = adapter.name(), line = %stale, "Discarding stale device line");
                }
                adapter.connect().await?;
                Ok(adapter.next_line().await?)
            }
        }
    }

    async fn close(&mut self) -> SessionResult<()> {
        match self {
            Link::Dry => Ok(()),
            Link::Adapter(adapter) => Ok(adapter.disconnect().await?),
        }
    }

    async fn exchange(&mut self, command: &str) -> SessionResult<String> {
        match self {
            Link::Dry => Ok(command.to_string()),
            Link::Adapter(adapter) => {
                // Replies to commands that already timed out
                while let Some(stale) = adapter.try_next_line() {
                    warn!(adapter = adapter.name(), line = %stale, "Discarding stale device line");
                }
                adapter.write_line(command).await?;
                debug!(adapter = adapter.name(), %command, "Sent command");
                let response = adapter.next_line().await?;
                debug!(adapter = adapter.name(), %response, "Received response");
                Ok(response)
            }
        }
    }
}

struct Shared {
    link: Arc<AsyncMutex<Link>>,
    status: Mutex<Status>,
    settings: SessionSettings,
    events: Mutex<Option<mpsc::UnboundedSender<SessionEvent>>>,
    /// Held by the run loop for its whole lifetime
    drive_lock: AsyncMutex<()>,
}

impl Shared {
    fn run_state(&self) -> RunState {
        self.status.lock().run_state
    }

    fn emit(&self, event: SessionEvent) {
        if let Some(tx) = self.events.lock().as_ref() {
            let _ = tx.send(event);
        }
    }

    fn fail(&self, position: usize, error: SessionError) {
        {
            let mut status = self.status.lock();
            status.last_error = Some(error.clone());
            if matches!(status.run_state, RunState::Running | RunState::Paused) {
                status.run_state = RunState::Error;
            }
        }
        error!(position, error = %error, "Fraction dispatch failed");
        self.emit(SessionEvent::Error { position, error });
    }

    /// Drop the event sender once nothing can emit any more.
    fn close_events_if_finished(&self) {
        let finished = {
            let status = self.status.lock();
            status.run_state.is_terminal() && !status.loop_active
        };
        if finished {
            self.events.lock().take();
        }
    }

    async fn dispatch(
        self: Arc<Self>,
        mut link: OwnedMutexGuard<Link>,
        position: usize,
        command: String,
    ) {
        let timeout = self.settings.timeout;
        let result = match tokio::time::timeout(timeout, link.exchange(&command)).await {
            Ok(Ok(response)) => protocol::verify_response(&command, &response),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(SessionError::timeout(format!("Command {}", command), timeout)),
        };

        // Report before releasing the link so events stay in dispatch order
        match result {
            Ok(()) => {
                debug!(position, "Fraction collected");
                self.emit(SessionEvent::Progress { position });
            }
            Err(e) => self.fail(position, e),
        }
        drop(link);
    }
}

/// Clears `loop_active` however the loop future ends.
struct LoopGuard(Arc<Shared>);

impl Drop for LoopGuard {
    fn drop(&mut self) {
        self.0.status.lock().loop_active = false;
    }
}

/// Session controller for one fraction collector.
///
/// Cloning yields another handle to the same session, so one task can await
/// [`run`](Self::run) while another calls [`pause`](Self::pause) or
/// [`stop`](Self::stop).
#[derive(Clone)]
pub struct DeviceSession {
    shared: Arc<Shared>,
}

impl DeviceSession {
    /// Session over a real (or mock) adapter.
    pub fn new<A>(adapter: A, settings: SessionSettings) -> Self
    where
        A: LineAdapter + 'static,
    {
        Self::with_link(Link::Adapter(Box::new(adapter)), settings)
    }

    /// Session that never touches a transport: every command is echoed
    /// back immediately and connecting succeeds at once.
    pub fn dry(settings: SessionSettings) -> Self {
        Self::with_link(Link::Dry, settings)
    }

    fn with_link(link: Link, settings: SessionSettings) -> Self {
        Self {
            shared: Arc::new(Shared {
                link: Arc::new(AsyncMutex::new(link)),
                status: Mutex::new(Status {
                    connection: ConnectionState::Disconnected,
                    run_state: RunState::Idle,
                    position: 0,
                    number_of_fractions: 0,
                    interval: Duration::ZERO,
                    start_time: None,
                    last_error: None,
                    loop_active: false,
                }),
                settings,
                events: Mutex::new(None),
                drive_lock: AsyncMutex::new(()),
            }),
        }
    }

    /// Settings this session was built with.
    pub fn settings(&self) -> &SessionSettings {
        &self.shared.settings
    }

    /// Open the link and wait for the handshake banner.
    ///
    /// # Errors
    /// - `InvalidState` if already connecting or connected
    /// - `Timeout` if no line arrives within the session timeout
    /// - `HandshakeFailed` if the first line is not the expected banner
    /// - `Transport` if the adapter cannot open the port
    pub async fn connect(&self) -> SessionResult<String> {
        {
            let mut status = self.shared.status.lock();
            if status.connection != ConnectionState::Disconnected {
                return Err(SessionError::invalid_state("already connecting or connected"));
            }
            status.connection = ConnectionState::Connecting;
        }

        let timeout = self.shared.settings.timeout;
        let handshake = self.shared.settings.handshake.as_str();
        let result = match tokio::time::timeout(timeout, async {
            self.shared.link.lock().await.open(handshake).await
        })
        .await
        {
            Ok(Ok(banner)) if banner == handshake => Ok(banner),
            Ok(Ok(banner)) => Err(SessionError::HandshakeFailed {
                expected: handshake.to_string(),
                received: banner,
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(SessionError::timeout("Connection", timeout)),
        };

        match result {
            Ok(banner) => {
                self.shared.status.lock().connection = ConnectionState::Connected;
                info!(%banner, "Device connected");
                Ok(banner)
            }
            Err(e) => {
                warn!(error = %e, "Connection attempt failed");
                // Release the port; a failure to do so changes nothing for the caller
                let _ = tokio::time::timeout(timeout, async {
                    self.shared.link.lock().await.close().await
                })
                .await;
                self.shared.status.lock().connection = ConnectionState::Disconnected;
                Err(e)
            }
        }
    }

    /// Close the link.
    ///
    /// # Errors
    /// `NotConnected` if not connected, `Timeout` if the adapter hangs.
    pub async fn disconnect(&self) -> SessionResult<()> {
        self.ensure_connected()?;

        let timeout = self.shared.settings.timeout;
        tokio::time::timeout(timeout, async {
            self.shared.link.lock().await.close().await
        })
        .await
        .map_err(|_| SessionError::timeout("Disconnection", timeout))??;

        self.shared.status.lock().connection = ConnectionState::Disconnected;
        info!("Device disconnected");
        Ok(())
    }

    /// Send a command and return the device's reply without checking it.
    ///
    /// # Errors
    /// - `InvalidCommand` if `command` is not a well-formed protocol line
    /// - `NotConnected` before a successful `connect()`
    /// - `Timeout` if no reply arrives within the session timeout
    pub async fn send(&self, command: &str) -> SessionResult<String> {
        let command = Command::parse(command)?.to_string();
        self.ensure_connected()?;

        let timeout = self.shared.settings.timeout;
        tokio::time::timeout(timeout, async {
            self.shared.link.lock().await.exchange(&command).await
        })
        .await
        .map_err(|_| SessionError::timeout(format!("Command {}", command), timeout))?
    }

    /// Send a command and require the reply to echo its name.
    ///
    /// # Errors
    /// As [`send`](Self::send), plus `UnexpectedResponse`.
    pub async fn send_and_verify(&self, command: &str) -> SessionResult<String> {
        let response = self.send(command).await?;
        protocol::verify_response(command, &response)?;
        Ok(response)
    }

    /// Configure the run and send the setup commands.
    ///
    /// Returns the event stream for the run.
    ///
    /// # Errors
    /// - `NotConnected` before a successful `connect()`
    /// - `InvalidState` if the session was already set up
    /// - `Configuration` if `number_of_fractions` is zero or exceeds the
    ///   angle table
    /// - any error from verifying a setup command
    pub async fn setup(
        &self,
        number_of_fractions: usize,
        interval: Duration,
    ) -> SessionResult<SessionEvents> {
        self.ensure_connected()?;
        if self.shared.run_state() != RunState::Idle {
            return Err(SessionError::invalid_state("setup() may only be called once"));
        }
        if number_of_fractions == 0 {
            return Err(SessionError::Configuration(
                "number of fractions must be at least 1".to_string(),
            ));
        }
        let available = self.shared.settings.angles.len();
        if number_of_fractions > available {
            return Err(SessionError::Configuration(format!(
                "{} fractions requested but the angle table only covers {}",
                number_of_fractions, available
            )));
        }

        for command in &self.shared.settings.setup_commands {
            self.send_and_verify(&command.to_string()).await?;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut status = self.shared.status.lock();
            status.number_of_fractions = number_of_fractions;
            status.interval = interval;
            status.run_state = RunState::Ready;
        }
        *self.shared.events.lock() = Some(tx);

        info!(number_of_fractions, interval_ms = millis(interval), "Session ready");
        Ok(SessionEvents { rx })
    }

    /// Start the run from the first tube.
    ///
    /// Resolves when the loop exits: all fractions dispatched, paused,
    /// stopped or failed. Failures inside the loop are reported on the event
    /// stream, not here.
    ///
    /// # Errors
    /// `NotConnected`, or `InvalidState` if the session is not ready or has
    /// already run.
    pub async fn run(&self) -> SessionResult<()> {
        self.ensure_connected()?;
        {
            let mut status = self.shared.status.lock();
            if status.position != 0 {
                return Err(SessionError::invalid_state(format!(
                    "position must be zero, not {}",
                    status.position
                )));
            }
            if status.run_state != RunState::Ready {
                return Err(SessionError::invalid_state(
                    "session is not ready; setup() must be called",
                ));
            }
            status.start_time = Some(Utc::now());
        }
        info!("Run started");
        self.resume().await
    }

    /// Ask the run loop to stop before its next iteration.
    ///
    /// Does not interrupt a command already in flight.
    pub fn pause(&self) {
        let mut status = self.shared.status.lock();
        if status.run_state == RunState::Running {
            status.run_state = RunState::Paused;
            info!(position = status.position, "Pausing run");
        } else {
            debug!(state = ?status.run_state, "pause() ignored");
        }
    }

    /// Continue a paused run from the current position.
    ///
    /// A loop that is still finishing its last interval after `pause()` sees
    /// the session running again and carries on; this call then waits for it
    /// to exit. Only one loop ever dispatches at a time.
    ///
    /// # Errors
    /// `NotConnected`, or `InvalidState` if the run has not started, is
    /// still running, or is stopped, done or failed.
    pub async fn resume(&self) -> SessionResult<()> {
        self.ensure_connected()?;
        {
            let mut status = self.shared.status.lock();
            match status.run_state {
                RunState::Error => {
                    return Err(SessionError::invalid_state("there was an error while running"))
                }
                RunState::Stopped => return Err(SessionError::invalid_state("device was stopped")),
                RunState::Done => return Err(SessionError::invalid_state("run already completed")),
                RunState::Running => {
                    return Err(SessionError::invalid_state("run loop is already active"))
                }
                RunState::Idle => {
                    return Err(SessionError::invalid_state(
                        "session is not ready; setup() must be called",
                    ))
                }
                RunState::Ready | RunState::Paused => {}
            }
            if status.start_time.is_none() {
                return Err(SessionError::invalid_state(
                    "call run() instead of resume() at the start",
                ));
            }
            status.run_state = RunState::Running;
        }
        self.drive().await
    }

    /// Halt the device.
    ///
    /// Marks the session stopped (and therefore paused) at once, then sends
    /// the stop command once any in-flight command has finished. The reply
    /// is returned but not verified.
    pub async fn stop(&self) -> SessionResult<String> {
        {
            let mut status = self.shared.status.lock();
            if matches!(
                status.run_state,
                RunState::Ready | RunState::Running | RunState::Paused
            ) {
                status.run_state = RunState::Stopped;
            }
            info!(position = status.position, "Stopping device");
        }
        let result = self.send(&Command::stop().to_string()).await;
        self.shared.close_events_if_finished();
        result
    }

    async fn drive(&self) -> SessionResult<()> {
        // Waits out a loop that has not finished pausing
        let _exclusive = self.shared.drive_lock.lock().await;
        self.shared.status.lock().loop_active = true;
        let _guard = LoopGuard(self.shared.clone());
        let interval = self.shared.status.lock().interval;
        let mut in_flight = JoinSet::new();

        loop {
            let position = {
                let status = self.shared.status.lock();
                if status.run_state != RunState::Running
                    || status.position >= status.number_of_fractions
                {
                    break;
                }
                status.position
            };

            let Some(angle) = self.shared.settings.angles.get(position) else {
                self.shared.fail(
                    position,
                    SessionError::Configuration(format!("no angle defined for position {}", position)),
                );
                break;
            };

            // Waits for the previous exchange to finish
            let link = self.shared.link.clone().lock_owned().await;
            if self.shared.run_state() != RunState::Running {
                break;
            }

            let command = Command::run(angle).to_string();
            debug!(position, %command, "Dispatching rotation");
            in_flight.spawn(self.shared.clone().dispatch(link, position, command));

            self.shared.status.lock().position += 1;
            tokio::time::sleep(interval).await;

            while let Some(joined) = in_flight.try_join_next() {
                log_join(joined);
            }
        }

        while let Some(joined) = in_flight.join_next().await {
            log_join(joined);
        }

        let finished = {
            let mut status = self.shared.status.lock();
            status.loop_active = false;
            if status.run_state == RunState::Running
                && status.position >= status.number_of_fractions
            {
                status.run_state = RunState::Done;
                true
            } else {
                false
            }
        };
        if finished {
            info!("Run complete");
            self.shared.emit(SessionEvent::Done);
        }
        self.shared.close_events_if_finished();
        Ok(())
    }

    fn ensure_connected(&self) -> SessionResult<()> {
        if self.shared.status.lock().connection == ConnectionState::Connected {
            Ok(())
        } else {
            Err(SessionError::NotConnected)
        }
    }

    /// Current observable state.
    pub fn snapshot(&self) -> SessionSnapshot {
        let status = self.shared.status.lock();
        let set_up = status.run_state != RunState::Idle;
        SessionSnapshot {
            connection: status.connection,
            run_state: status.run_state,
            connected: status.connection == ConnectionState::Connected,
            ready: set_up,
            paused: matches!(status.run_state, RunState::Paused | RunState::Stopped),
            stopped: status.run_state == RunState::Stopped,
            done: status.run_state == RunState::Done,
            error: status.run_state == RunState::Error,
            position: status.position,
            number_of_fractions: set_up.then_some(status.number_of_fractions),
            interval_ms: set_up.then(|| millis(status.interval)),
            start_time: status.start_time,
            last_error: status.last_error.as_ref().map(ToString::to_string),
        }
    }

    /// Next position to dispatch.
    pub fn position(&self) -> usize {
        self.shared.status.lock().position
    }

    /// Current run state.
    pub fn run_state(&self) -> RunState {
        self.shared.run_state()
    }

    /// Whether the handshake has completed and the link is up.
    pub fn is_connected(&self) -> bool {
        self.shared.status.lock().connection == ConnectionState::Connected
    }

    /// Most recent run loop failure.
    pub fn last_error(&self) -> Option<SessionError> {
        self.shared.status.lock().last_error.clone()
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn log_join(joined: Result<(), JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            error!(error = %e, "Dispatch task panicked");
        }
    }
}

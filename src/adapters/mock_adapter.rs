//! Mock line adapter for testing
//!
//! This adapter simulates a fraction collector firmware without hardware.
//! It provides:
//! - The handshake banner on connect (configurable or suppressed)
//! - A responder deciding the reply to each written line (echo by default)
//! - Simulated response latency
//! - Controllable failure injection
//! - Call logging for test verification
//!
//! A [`MockHandle`] stays with the test after the adapter is moved into a
//! session, so behaviour can be changed and calls inspected mid-run.

use super::LineAdapter;
use crate::error::TransportError;
use crate::protocol::HANDSHAKE_BANNER;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

type Responder = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Test-side control over a [`MockAdapter`].
#[derive(Clone)]
pub struct MockHandle {
    connected: Arc<AtomicBool>,
    latency_ms: Arc<Mutex<u64>>,
    should_fail_next: Arc<AtomicBool>,
    call_log: Arc<Mutex<Vec<String>>>,
    banner: Arc<Mutex<Option<String>>>,
    responder: Arc<Mutex<Responder>>,
    inbox: mpsc::UnboundedSender<String>,
}

impl MockHandle {
    /// Inject a failure for the next operation
    pub fn inject_next_failure(&self) {
        self.should_fail_next.store(true, Ordering::SeqCst);
    }

    fn check_failure(&self) -> bool {
        self.should_fail_next.swap(false, Ordering::SeqCst)
    }

    /// Check if currently connected
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Replace the responder while the adapter is in use
    pub fn set_responder<F>(&self, responder: F)
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        *self.responder.lock() = Arc::new(responder);
    }

    /// Set simulated response latency in milliseconds
    pub fn set_latency(&self, ms: u64) {
        *self.latency_ms.lock() = ms;
    }

    /// Queue a line as if the device had sent it unprompted
    pub fn push_line(&self, line: &str) {
        let _ = self.inbox.send(line.to_string());
    }

    /// Get the call log
    pub fn call_log(&self) -> Vec<String> {
        self.call_log.lock().clone()
    }

    /// Lines written to the device, in order
    pub fn written_lines(&self) -> Vec<String> {
        self.call_log
            .lock()
            .iter()
            .filter_map(|call| call.strip_prefix("write: ").map(str::to_string))
            .collect()
    }

    /// Clear the call log
    pub fn clear_log(&self) {
        self.call_log.lock().clear();
    }

    fn log_call(&self, call: String) {
        self.call_log.lock().push(call);
    }

    fn latency(&self) -> Duration {
        Duration::from_millis(*self.latency_ms.lock())
    }
}

/// In-memory fraction collector
///
/// # Example
///
/// ```
/// use colosseum::adapters::{LineAdapter, MockAdapter};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let mut adapter = MockAdapter::new();
/// adapter.connect().await.unwrap();
/// assert_eq!(adapter.next_line().await.unwrap(), "<Arduino is ready>");
///
/// adapter.write_line("<RUN,111,45,45,45>").await.unwrap();
/// assert_eq!(adapter.next_line().await.unwrap(), "<RUN,111,45,45,45>");
/// # }
/// ```
pub struct MockAdapter {
    handle: MockHandle,
    received: mpsc::UnboundedReceiver<String>,
}

impl Default for MockAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl MockAdapter {
    /// Create a mock that sends the standard banner and echoes every line
    pub fn new() -> Self {
        let (inbox, received) = mpsc::unbounded_channel();
        let echo: Responder = Arc::new(|line: &str| Some(line.to_string()));
        Self {
            handle: MockHandle {
                connected: Arc::new(AtomicBool::new(false)),
                latency_ms: Arc::new(Mutex::new(0)),
                should_fail_next: Arc::new(AtomicBool::new(false)),
                call_log: Arc::new(Mutex::new(Vec::new())),
                banner: Arc::new(Mutex::new(Some(HANDSHAKE_BANNER.to_string()))),
                responder: Arc::new(Mutex::new(echo)),
                inbox,
            },
            received,
        }
    }

    /// Send a different banner on connect, or none at all
    pub fn with_banner(self, banner: Option<&str>) -> Self {
        *self.handle.banner.lock() = banner.map(str::to_string);
        self
    }

    /// Set simulated response latency in milliseconds
    pub fn with_latency(self, ms: u64) -> Self {
        self.handle.set_latency(ms);
        self
    }

    /// Decide the reply to each written line; `None` means no reply
    pub fn with_responder<F>(self, responder: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        self.handle.set_responder(responder);
        self
    }

    /// A device that never answers commands
    pub fn silent(self) -> Self {
        self.with_responder(|_| None)
    }

    /// Control handle that outlives moving the adapter into a session
    pub fn handle(&self) -> MockHandle {
        self.handle.clone()
    }

    fn deliver(&self, line: String) {
        let latency = self.handle.latency();
        if latency.is_zero() {
            let _ = self.handle.inbox.send(line);
        } else {
            let inbox = self.handle.inbox.clone();
            tokio::spawn(async move {
                tokio::time::sleep(latency).await;
                let _ = inbox.send(line);
            });
        }
    }
}

#[async_trait]
impl LineAdapter for MockAdapter {
    fn name(&self) -> &str {
        "mock"
    }

    async fn connect(&mut self) -> Result<(), TransportError> {
        self.handle.log_call("connect".to_string());

        if self.handle.check_failure() {
            return Err(TransportError::Open {
                port: "mock".to_string(),
                reason: "Injected failure".to_string(),
            });
        }

        self.handle.connected.store(true, Ordering::SeqCst);
        let banner = self.handle.banner.lock().clone();
        if let Some(banner) = banner {
            self.deliver(banner);
        }
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        self.handle.log_call("disconnect".to_string());

        if self.handle.check_failure() {
            return Err(TransportError::Io("Injected failure".to_string()));
        }

        self.handle.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn write_line(&mut self, line: &str) -> Result<(), TransportError> {
        if !self.handle.is_connected() {
            return Err(TransportError::NotOpen);
        }

        self.handle.log_call(format!("write: {}", line));

        if self.handle.check_failure() {
            return Err(TransportError::Io("Injected failure".to_string()));
        }

        let responder = self.handle.responder.lock().clone();
        if let Some(reply) = (*responder)(line) {
            self.deliver(reply);
        }
        Ok(())
    }

    async fn next_line(&mut self) -> Result<String, TransportError> {
        if !self.handle.is_connected() {
            return Err(TransportError::NotOpen);
        }
        self.received.recv().await.ok_or(TransportError::Closed)
    }

    fn try_next_line(&mut self) -> Option<String> {
        self.received.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_adapter_creation() {
        let adapter = MockAdapter::new();
        assert!(!adapter.handle().is_connected());
        assert_eq!(adapter.name(), "mock");
    }

    #[tokio::test]
    async fn test_mock_adapter_connect_sends_banner() {
        let mut adapter = MockAdapter::new();
        adapter.connect().await.unwrap();
        assert!(adapter.handle().is_connected());
        assert_eq!(adapter.next_line().await.unwrap(), HANDSHAKE_BANNER);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mock_adapter_latency() {
        let mut adapter = MockAdapter::new().with_banner(None).with_latency(10);
        adapter.connect().await.unwrap();
        let start = tokio::time::Instant::now();
        adapter.write_line("<STOP,111,0.0,0.0,0.0>").await.unwrap();
        adapter.next_line().await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(10));
    }

    #[tokio::test]
    async fn test_mock_adapter_disconnect() {
        let mut adapter = MockAdapter::new();
        adapter.connect().await.unwrap();
        adapter.disconnect().await.unwrap();
        assert!(!adapter.handle().is_connected());
    }

    #[tokio::test]
    async fn test_mock_adapter_failure_injection() {
        let mut adapter = MockAdapter::new();
        adapter.handle().inject_next_failure();
        let result = adapter.connect().await;
        assert!(result.is_err());
        // Failure should be consumed
        let result = adapter.connect().await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_mock_adapter_write_when_not_connected() {
        let mut adapter = MockAdapter::new();
        let result = adapter.write_line("<STOP,111,0.0,0.0,0.0>").await;
        assert_eq!(result.unwrap_err(), TransportError::NotOpen);
    }

    #[tokio::test]
    async fn test_mock_adapter_custom_responder() {
        let mut adapter = MockAdapter::new()
            .with_banner(None)
            .with_responder(|line| line.starts_with("<RUN").then(|| "<STOP,111,0,0,0>".to_string()));
        adapter.connect().await.unwrap();

        adapter.write_line("<RUN,111,45,45,45>").await.unwrap();
        assert_eq!(adapter.next_line().await.unwrap(), "<STOP,111,0,0,0>");

        adapter.write_line("<SET_SPEED,111,1.0,1.0,1.0>").await.unwrap();
        assert_eq!(adapter.try_next_line(), None);
    }

    #[tokio::test]
    async fn test_mock_adapter_call_logging() {
        let mut adapter = MockAdapter::new().with_banner(None);
        let handle = adapter.handle();
        adapter.connect().await.unwrap();
        adapter.write_line("CMD").await.unwrap();
        adapter.disconnect().await.unwrap();

        let log = handle.call_log();
        assert_eq!(log.len(), 3);
        assert_eq!(log[0], "connect");
        assert_eq!(log[1], "write: CMD");
        assert_eq!(log[2], "disconnect");
        assert_eq!(handle.written_lines(), vec!["CMD".to_string()]);
    }

    #[test]
    fn test_mock_adapter_clear_log() {
        let adapter = MockAdapter::new();
        adapter.handle().log_call("test".to_string());
        assert_eq!(adapter.handle().call_log().len(), 1);
        adapter.handle().clear_log();
        assert_eq!(adapter.handle().call_log().len(), 0);
    }
}

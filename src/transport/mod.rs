//! Request/response correlation over an unreliable datagram link.
//!
//! Every attempt opens its own channel and carries a fresh correlation id, so a
//! reply that limps in after its attempt was abandoned is simply discarded.

pub mod frame;
pub mod link;

use serde_json::Value;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::config::TransportConfig;
use crate::domain::DeviceError;
use frame::{Reply, Request};
pub use link::{Channel, Link, UdpLink};

/// Timeout and retry tuning. These values are hardware-specific, not protocol constants.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub attempt_timeout: Duration,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempt_timeout: Duration::from_secs(15),
            max_attempts: 5,
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(30),
        }
    }
}

impl From<&TransportConfig> for RetryPolicy {
    fn from(cfg: &TransportConfig) -> Self {
        Self {
            attempt_timeout: Duration::from_millis(cfg.timeout_ms),
            max_attempts: cfg.max_attempts,
            backoff_base: Duration::from_millis(cfg.backoff_base_ms),
            backoff_max: Duration::from_millis(cfg.backoff_max_ms),
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt` (1-based). The first attempt goes out immediately.
    pub fn backoff(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let exp = (attempt - 2).min(16);
        self.backoff_base
            .saturating_mul(1u32 << exp)
            .min(self.backoff_max)
    }
}

enum AttemptError {
    Timeout,
    Rejected { code: i64, message: String },
    Unreachable(String),
    Decode(String),
}

impl AttemptError {
    fn into_device_error(self, method: &str, attempts: u32) -> DeviceError {
        match self {
            AttemptError::Timeout => DeviceError::Timeout {
                method: method.to_string(),
                attempts,
            },
            AttemptError::Rejected { code, message } => DeviceError::Rejected {
                method: method.to_string(),
                attempts,
                code,
                message,
            },
            AttemptError::Unreachable(detail) => DeviceError::Unreachable { detail },
            AttemptError::Decode(detail) => DeviceError::decode(method, detail),
        }
    }
}

/// Transport client shared by the whole fleet.
///
/// Holds no per-device state besides the correlation counter; callers serialize
/// calls to the same device.
pub struct TransportClient {
    link: Arc<dyn Link>,
    policy: RetryPolicy,
    next_id: AtomicU64,
}

impl TransportClient {
    pub fn new(link: Arc<dyn Link>, policy: RetryPolicy) -> Self {
        Self {
            link,
            policy,
            next_id: AtomicU64::new(1),
        }
    }

    fn next_correlation_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Issue `method` to `target` and return the `result` payload.
    pub async fn call(
        &self,
        target: SocketAddr,
        method: &str,
        params: Value,
    ) -> Result<Value, DeviceError> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut last = None;

        for attempt in 1..=max_attempts {
            let delay = self.policy.backoff(attempt);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            let id = self.next_correlation_id();
            let err = match self.attempt(target, id, method, &params).await {
                Ok(result) => {
                    if attempt > 1 {
                        debug!(addr = %target, method, attempt, "call succeeded after retry");
                    }
                    return Ok(result);
                }
                Err(e) => e.into_device_error(method, attempt),
            };
            if !err.is_retryable() {
                warn!(addr = %target, method, attempt, error = %err, "call failed without retry");
                return Err(err);
            }
            warn!(addr = %target, method, attempt, max_attempts, error = %err, "attempt failed");
            last = Some(err);
        }

        error!(addr = %target, method, max_attempts, "call failed after all attempts");
        Err(last.unwrap_or_else(|| DeviceError::Timeout {
            method: method.to_string(),
            attempts: max_attempts,
        }))
    }

    async fn attempt(
        &self,
        target: SocketAddr,
        id: u64,
        method: &str,
        params: &Value,
    ) -> Result<Value, AttemptError> {
        let datagram = Request { id, method, params }.encode();
        let mut channel = self.link.open(target).await.map_err(classify_io)?;

        let issued = Instant::now();
        channel.send(&datagram).await.map_err(classify_io)?;
        debug!(addr = %target, method, id, "request sent");

        let deadline = issued + self.policy.attempt_timeout;
        loop {
            let bytes = match tokio::time::timeout_at(deadline, channel.recv()).await {
                Err(_) => return Err(AttemptError::Timeout),
                Ok(Err(e)) => return Err(classify_io(e)),
                Ok(Ok(bytes)) => bytes,
            };
            let reply = frame::decode(&bytes).map_err(AttemptError::Decode)?;
            if reply.id() != Some(id) {
                debug!(addr = %target, method, expected = id, received = ?reply.id(), "discarding stale reply");
                continue;
            }
            debug!(addr = %target, method, id, elapsed_ms = issued.elapsed().as_millis() as u64, "reply received");
            return match reply {
                Reply::Result { result, .. } => Ok(result),
                Reply::Error { error, .. } => Err(AttemptError::Rejected {
                    code: error.code,
                    message: error.message,
                }),
            };
        }
    }
}

// Socket errors other than "unreachable" are treated as a lost datagram.
fn classify_io(err: std::io::Error) -> AttemptError {
    if link::is_unreachable(&err) {
        AttemptError::Unreachable(err.to_string())
    } else {
        debug!(error = %err, "transient socket error");
        AttemptError::Timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::io;

    #[derive(Clone, Copy)]
    enum Step {
        Answer,
        Reject,
        Silence,
        Refuse,
        Garbage,
        StaleThenAnswer,
    }

    struct ScriptedLink {
        steps: Mutex<VecDeque<Step>>,
        opened: Mutex<u32>,
    }

    impl ScriptedLink {
        fn new(steps: &[Step]) -> Arc<Self> {
            Arc::new(Self {
                steps: Mutex::new(steps.iter().copied().collect()),
                opened: Mutex::new(0),
            })
        }
        fn attempts(&self) -> u32 {
            *self.opened.lock()
        }
    }

    struct ScriptedChannel {
        step: Step,
        inbox: VecDeque<Vec<u8>>,
    }

    #[async_trait]
    impl Link for ScriptedLink {
        async fn open(&self, _target: SocketAddr) -> io::Result<Box<dyn Channel>> {
            *self.opened.lock() += 1;
            let step = self.steps.lock().pop_front().unwrap_or(Step::Silence);
            if let Step::Refuse = step {
                return Err(io::Error::from(io::ErrorKind::ConnectionRefused));
            }
            Ok(Box::new(ScriptedChannel { step, inbox: VecDeque::new() }))
        }
    }

    #[async_trait]
    impl Channel for ScriptedChannel {
        async fn send(&mut self, datagram: &[u8]) -> io::Result<()> {
            let req: Value = serde_json::from_slice(datagram).unwrap();
            let id = req["id"].as_u64().unwrap();
            match self.step {
                Step::Answer => self
                    .inbox
                    .push_back(serde_json::to_vec(&json!({"id": id, "result": {"ok": true}})).unwrap()),
                Step::Reject => self.inbox.push_back(
                    serde_json::to_vec(&json!({"id": id, "error": {"code": -32000, "message": "busy"}}))
                        .unwrap(),
                ),
                Step::Garbage => self.inbox.push_back(b"\x00\x01garbage".to_vec()),
                Step::StaleThenAnswer => {
                    self.inbox.push_back(
                        serde_json::to_vec(&json!({"id": id - 1, "result": {"ok": false}})).unwrap(),
                    );
                    self.inbox
                        .push_back(serde_json::to_vec(&json!({"id": id, "result": {"ok": true}})).unwrap());
                }
                Step::Silence | Step::Refuse => {}
            }
            Ok(())
        }

        async fn recv(&mut self) -> io::Result<Vec<u8>> {
            match self.inbox.pop_front() {
                Some(d) => Ok(d),
                None => std::future::pending().await,
            }
        }
    }

    fn client(link: Arc<ScriptedLink>, max_attempts: u32) -> TransportClient {
        TransportClient::new(
            link,
            RetryPolicy {
                attempt_timeout: Duration::from_secs(15),
                max_attempts,
                backoff_base: Duration::from_secs(1),
                backoff_max: Duration::from_secs(30),
            },
        )
    }

    fn target() -> SocketAddr {
        "192.168.1.50:30000".parse().unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn retries_rejections_until_success() {
        let link = ScriptedLink::new(&[Step::Reject, Step::Silence, Step::Answer]);
        let c = client(link.clone(), 5);
        let started = Instant::now();

        let result = c.call(target(), "ES.GetMode", json!({"id": 0})).await.unwrap();

        assert_eq!(result, json!({"ok": true}));
        assert_eq!(link.attempts(), 3);
        // 1s backoff, 15s timeout, 2s backoff
        assert_eq!(started.elapsed(), Duration::from_secs(18));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_timeouts_report_timeout() {
        let link = ScriptedLink::new(&[]);
        let c = client(link.clone(), 3);
        let err = c.call(target(), "ES.GetMode", json!({})).await.unwrap_err();
        assert_eq!(
            err,
            DeviceError::Timeout { method: "ES.GetMode".into(), attempts: 3 }
        );
        assert_eq!(link.attempts(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_rejections_report_rejected() {
        let link = ScriptedLink::new(&[Step::Reject, Step::Reject]);
        let c = client(link, 2);
        let err = c.call(target(), "ES.SetMode", json!({})).await.unwrap_err();
        assert!(matches!(err, DeviceError::Rejected { attempts: 2, code: -32000, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_fails_without_retry() {
        let link = ScriptedLink::new(&[Step::Refuse, Step::Answer]);
        let c = client(link.clone(), 5);
        let err = c.call(target(), "ES.GetMode", json!({})).await.unwrap_err();
        assert!(matches!(err, DeviceError::Unreachable { .. }));
        assert_eq!(link.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn garbage_is_a_decode_error() {
        let link = ScriptedLink::new(&[Step::Garbage, Step::Answer]);
        let c = client(link.clone(), 5);
        let err = c.call(target(), "Bat.GetStatus", json!({})).await.unwrap_err();
        assert!(matches!(err, DeviceError::Decode { .. }));
        assert_eq!(link.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_replies_are_skipped_within_an_attempt() {
        let link = ScriptedLink::new(&[Step::StaleThenAnswer]);
        let c = client(link.clone(), 1);
        let result = c.call(target(), "ES.GetMode", json!({})).await.unwrap();
        assert_eq!(result, json!({"ok": true}));
    }

    #[test]
    fn backoff_doubles_from_base_and_caps() {
        let p = RetryPolicy {
            attempt_timeout: Duration::from_secs(15),
            max_attempts: 8,
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(5),
        };
        let delays: Vec<u64> = (1..=7).map(|a| p.backoff(a).as_millis() as u64).collect();
        assert_eq!(delays, vec![0, 500, 1000, 2000, 4000, 5000, 5000]);
    }

    proptest::proptest! {
        #[test]
        fn backoff_is_monotonic_and_bounded(base_ms in 1u64..5_000, max_ms in 1u64..120_000, attempt in 1u32..64) {
            let p = RetryPolicy {
                attempt_timeout: Duration::from_secs(1),
                max_attempts: 64,
                backoff_base: Duration::from_millis(base_ms),
                backoff_max: Duration::from_millis(max_ms),
            };
            proptest::prop_assert!(p.backoff(attempt) <= p.backoff(attempt + 1));
            proptest::prop_assert!(p.backoff(attempt) <= Duration::from_millis(max_ms));
        }
    }
}

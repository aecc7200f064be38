//! Outbound message queue with adaptive pacing.
//!
//! Every send in the process goes through this queue. Normal traffic is
//! enqueued and leaves in bursts once per tick; the bulk world transfer uses
//! [`OutboundQueue::send_immediate`], which first drains anything already
//! queued for the same destination so per-destination order is preserved.

use crate::config::NetConfig;
use crate::error::NetError;
use crate::protocol::Message;
use crate::transport::{ConnectionHandle, SendOutcome, Transport};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

#[derive(Debug, Clone)]
struct QueuedMessage {
    destination: ConnectionHandle,
    message: Message,
    enqueued_at: Instant,
}

/// Outcome of one [`OutboundQueue::drain`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Messages the transport accepted.
    pub sent: usize,
    /// Messages dropped after a permanent failure.
    pub failed: usize,
    /// Whether the burst stopped on a rate limit.
    pub rate_limited: bool,
    /// Messages still queued.
    pub remaining: usize,
}

/// Lifetime counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueMetrics {
    /// Messages accepted by the transport.
    pub sent: u64,
    /// Messages dropped after a permanent failure.
    pub failed: u64,
    /// Rate-limit responses seen.
    pub rate_limited: u64,
    /// Messages discarded because their connection died.
    pub purged: u64,
    /// Largest queue depth observed.
    pub peak_depth: usize,
}

/// FIFO of outbound messages with an adaptive inter-burst wait.
#[derive(Debug)]
pub struct OutboundQueue {
    pending: VecDeque<QueuedMessage>,
    min_wait: Duration,
    max_wait: Duration,
    backoff_factor: f64,
    max_per_drain: usize,
    max_immediate_retries: u32,
    current_wait: Duration,
    last_sent: Option<Instant>,
    metrics: QueueMetrics,
}

impl OutboundQueue {
    /// Create an empty queue using the pacing parameters from `config`.
    pub fn new(config: &NetConfig) -> Self {
        Self {
            pending: VecDeque::new(),
            min_wait: config.min_wait(),
            max_wait: config.max_wait(),
            backoff_factor: config.backoff_factor,
            max_per_drain: config.max_messages_per_drain,
            max_immediate_retries: config.max_immediate_retries,
            current_wait: config.min_wait(),
            last_sent: None,
            metrics: QueueMetrics::default(),
        }
    }

    /// Append a message. Never blocks, never fails.
    pub fn enqueue(&mut self, destination: ConnectionHandle, message: Message) {
        trace!(%destination, kind = message.kind().as_str(), "Queued");
        self.pending.push_back(QueuedMessage {
            destination,
            message,
            enqueued_at: Instant::now(),
        });
        self.metrics.peak_depth = self.metrics.peak_depth.max(self.pending.len());
    }

    /// Drain using the wall clock.
    pub fn drain<T: Transport + ?Sized>(&mut self, transport: &mut T) -> DrainReport {
        self.drain_at(Instant::now(), transport)
    }

    /// Send one burst if the adaptive wait has elapsed since the last send.
    ///
    /// Successes shrink the wait toward the floor; a rate limit pushes the
    /// message back to the front, grows the wait and ends the burst;
    /// permanent failures are logged and skipped.
    pub fn drain_at<T: Transport + ?Sized>(&mut self, now: Instant, transport: &mut T) -> DrainReport {
        let mut report = DrainReport::default();
        if !self.gate_open(now) {
            report.remaining = self.pending.len();
            return report;
        }

        let mut processed = 0;
        while processed < self.max_per_drain {
            let Some(queued) = self.pending.pop_front() else {
                break;
            };
            match transport.send(queued.destination, queued.message.as_frame()) {
                SendOutcome::Ok => {
                    let queued_for = now.saturating_duration_since(queued.enqueued_at);
                    trace!(
                        destination = %queued.destination,
                        kind = queued.message.kind().as_str(),
                        ?queued_for,
                        "Sent"
                    );
                    self.on_success();
                    self.last_sent = Some(now);
                    report.sent += 1;
                }
                SendOutcome::RateLimited => {
                    self.pending.push_front(queued);
                    self.on_rate_limited();
                    self.last_sent = Some(now);
                    report.rate_limited = true;
                    debug!("Rate limited, backing off to {:?}", self.current_wait);
                    break;
                }
                SendOutcome::Failed(reason) => {
                    warn!(
                        "Dropping {} for {}: {}",
                        queued.message.kind().as_str(),
                        queued.destination,
                        reason
                    );
                    self.metrics.failed += 1;
                    report.failed += 1;
                }
            }
            processed += 1;
        }

        report.remaining = self.pending.len();
        report
    }

    /// Send `message` now, blocking through rate limits.
    ///
    /// Anything already queued for `destination` goes out first. Retries a
    /// rate-limited send up to the configured count, sleeping the current
    /// wait between attempts.
    pub fn send_immediate<T: Transport + ?Sized>(
        &mut self,
        transport: &mut T,
        destination: ConnectionHandle,
        message: &Message,
    ) -> Result<(), NetError> {
        let earlier = self.take_for(destination);
        if !earlier.is_empty() {
            debug!("Flushing {} queued messages for {} first", earlier.len(), destination);
        }
        for queued in earlier {
            if let Err(err) = self.send_blocking(transport, destination, &queued.message) {
                warn!("Dropping queued {}: {}", queued.message.kind().as_str(), err);
            }
        }
        self.send_blocking(transport, destination, message)
    }

    /// Ask the transport to push buffered data for `destination`.
    pub fn flush<T: Transport + ?Sized>(&mut self, transport: &mut T, destination: ConnectionHandle) {
        transport.flush(destination);
    }

    /// Drop every message queued for a dead connection.
    pub fn purge(&mut self, destination: ConnectionHandle) -> usize {
        let before = self.pending.len();
        self.pending.retain(|queued| queued.destination != destination);
        let purged = before - self.pending.len();
        if purged > 0 {
            debug!("Purged {} messages for {}", purged, destination);
        }
        self.metrics.purged += purged as u64;
        purged
    }

    /// Messages waiting.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether nothing is waiting.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Messages waiting for one destination.
    pub fn depth_for(&self, destination: ConnectionHandle) -> usize {
        self.pending
            .iter()
            .filter(|queued| queued.destination == destination)
            .count()
    }

    /// Current inter-burst wait.
    pub fn current_wait(&self) -> Duration {
        self.current_wait
    }

    /// Lifetime counters.
    pub fn metrics(&self) -> QueueMetrics {
        self.metrics
    }

    fn gate_open(&self, now: Instant) -> bool {
        match self.last_sent {
            Some(last) => now.saturating_duration_since(last) >= self.current_wait,
            None => true,
        }
    }

    fn on_success(&mut self) {
        self.metrics.sent += 1;
        self.current_wait = (self.current_wait / 2).max(self.min_wait);
    }

    fn on_rate_limited(&mut self) {
        self.metrics.rate_limited += 1;
        self.current_wait = self
            .current_wait
            .mul_f64(self.backoff_factor)
            .min(self.max_wait);
    }

    fn take_for(&mut self, destination: ConnectionHandle) -> Vec<QueuedMessage> {
        let mut taken = Vec::new();
        let mut kept = VecDeque::with_capacity(self.pending.len());
        for queued in self.pending.drain(..) {
            if queued.destination == destination {
                taken.push(queued);
            } else {
                kept.push_back(queued);
            }
        }
        self.pending = kept;
        taken
    }

    fn send_blocking<T: Transport + ?Sized>(
        &mut self,
        transport: &mut T,
        destination: ConnectionHandle,
        message: &Message,
    ) -> Result<(), NetError> {
        let mut attempts = 0;
        loop {
            match transport.send(destination, message.as_frame()) {
                SendOutcome::Ok => {
                    self.on_success();
                    self.last_sent = Some(Instant::now());
                    return Ok(());
                }
                SendOutcome::RateLimited => {
                    self.on_rate_limited();
                    if attempts >= self.max_immediate_retries {
                        return Err(NetError::SendFailed {
                            handle: destination,
                            reason: format!("still rate limited after {attempts} retries"),
                        });
                    }
                    attempts += 1;
                    std::thread::sleep(self.current_wait);
                }
                SendOutcome::Failed(reason) => {
                    self.metrics.failed += 1;
                    return Err(NetError::SendFailed {
                        handle: destination,
                        reason,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode;
    use crate::protocol::{Actor, ChatMessage, Payload};
    use crate::transport::TransportEvent;
    use std::collections::VecDeque;
    use tilesync_core::PeerId;

    /// Transport that replays scripted outcomes, then succeeds.
    #[derive(Default)]
    struct ScriptedTransport {
        script: VecDeque<SendOutcome>,
        sent: Vec<(ConnectionHandle, Vec<u8>)>,
        attempts: usize,
    }

    impl ScriptedTransport {
        fn with_script(script: impl IntoIterator<Item = SendOutcome>) -> Self {
            Self {
                script: script.into_iter().collect(),
                ..Self::default()
            }
        }
    }

    impl Transport for ScriptedTransport {
        fn connect(&mut self, _peer: PeerId) -> Result<ConnectionHandle, NetError> {
            Ok(ConnectionHandle(1))
        }

        fn accept(&mut self) -> Option<(ConnectionHandle, PeerId)> {
            None
        }

        fn send(&mut self, handle: ConnectionHandle, frame: &[u8]) -> SendOutcome {
            self.attempts += 1;
            let outcome = self.script.pop_front().unwrap_or(SendOutcome::Ok);
            if outcome == SendOutcome::Ok {
                self.sent.push((handle, frame.to_vec()));
            }
            outcome
        }

        fn poll_receive(&mut self, _max: usize) -> Vec<(ConnectionHandle, Vec<u8>)> {
            Vec::new()
        }

        fn poll_events(&mut self) -> Vec<TransportEvent> {
            Vec::new()
        }

        fn close(&mut self, _handle: ConnectionHandle) {}
    }

    fn chat(text: &str) -> Message {
        encode(&Payload::ChatMessage(ChatMessage {
            author: Actor::NONE,
            text: text.into(),
        }))
        .expect("encode chat")
    }

    fn config() -> NetConfig {
        NetConfig {
            min_wait_ms: 5,
            max_wait_ms: 60,
            backoff_factor: 2.0,
            max_messages_per_drain: 4,
            max_immediate_retries: 3,
            ..NetConfig::for_tests()
        }
    }

    #[test]
    fn test_drain_respects_burst_cap() {
        let mut queue = OutboundQueue::new(&config());
        let mut transport = ScriptedTransport::default();
        for i in 0..6 {
            queue.enqueue(ConnectionHandle(1), chat(&i.to_string()));
        }

        let report = queue.drain_at(Instant::now(), &mut transport);
        assert_eq!(report.sent, 4);
        assert_eq!(report.remaining, 2);
        assert_eq!(queue.metrics().peak_depth, 6);
    }

    #[test]
    fn test_fifo_order_preserved() {
        let mut queue = OutboundQueue::new(&config());
        let mut transport = ScriptedTransport::default();
        let messages: Vec<Message> = (0..3).map(|i| chat(&format!("m{i}"))).collect();
        for message in &messages {
            queue.enqueue(ConnectionHandle(1), message.clone());
        }
        queue.drain_at(Instant::now(), &mut transport);

        let frames: Vec<Vec<u8>> = transport.sent.into_iter().map(|(_, f)| f).collect();
        let expected: Vec<Vec<u8>> = messages.iter().map(|m| m.as_frame().to_vec()).collect();
        assert_eq!(frames, expected);
    }

    #[test]
    fn test_rate_limit_requeues_at_front_and_backs_off() {
        let mut queue = OutboundQueue::new(&config());
        let mut transport = ScriptedTransport::with_script([SendOutcome::RateLimited]);
        let first = chat("first");
        queue.enqueue(ConnectionHandle(1), first.clone());
        queue.enqueue(ConnectionHandle(1), chat("second"));

        let t0 = Instant::now();
        let report = queue.drain_at(t0, &mut transport);
        assert!(report.rate_limited);
        assert_eq!(report.sent, 0);
        assert_eq!(report.remaining, 2);
        assert_eq!(queue.current_wait(), Duration::from_millis(10));

        // Gate is closed until the grown wait elapses.
        let early = queue.drain_at(t0 + Duration::from_millis(9), &mut transport);
        assert_eq!(early.sent, 0);
        assert_eq!(transport.attempts, 1);

        let report = queue.drain_at(t0 + Duration::from_millis(10), &mut transport);
        assert_eq!(report.sent, 2);
        assert_eq!(transport.sent[0].1, first.as_frame());
    }

    #[test]
    fn test_wait_grows_strictly_and_caps() {
        let mut queue = OutboundQueue::new(&config());
        let mut transport = ScriptedTransport::with_script(vec![SendOutcome::RateLimited; 10]);
        queue.enqueue(ConnectionHandle(1), chat("x"));

        let mut now = Instant::now();
        let mut previous = queue.current_wait();
        let mut observed = Vec::new();
        for _ in 0..6 {
            queue.drain_at(now, &mut transport);
            let wait = queue.current_wait();
            observed.push(wait.as_millis() as u64);
            assert!(wait > previous || wait == Duration::from_millis(60));
            previous = wait;
            now += wait;
        }
        assert_eq!(observed, vec![10, 20, 40, 60, 60, 60]);
    }

    #[test]
    fn test_wait_decays_to_floor_after_successes() {
        let mut queue = OutboundQueue::new(&config());
        let mut transport = ScriptedTransport::with_script(vec![SendOutcome::RateLimited; 4]);
        queue.enqueue(ConnectionHandle(1), chat("x"));

        let mut now = Instant::now();
        for _ in 0..4 {
            queue.drain_at(now, &mut transport);
            now += queue.current_wait();
        }
        assert_eq!(queue.current_wait(), Duration::from_millis(60));

        for i in 0..8 {
            queue.enqueue(ConnectionHandle(1), chat(&i.to_string()));
            queue.drain_at(now, &mut transport);
            now += queue.current_wait();
        }
        assert_eq!(queue.current_wait(), Duration::from_millis(5));
    }

    #[test]
    fn test_failed_send_is_dropped_and_burst_continues() {
        let mut queue = OutboundQueue::new(&config());
        let mut transport = ScriptedTransport::with_script([SendOutcome::Failed("gone".into())]);
        queue.enqueue(ConnectionHandle(1), chat("lost"));
        queue.enqueue(ConnectionHandle(1), chat("kept"));

        let report = queue.drain_at(Instant::now(), &mut transport);
        assert_eq!(report.failed, 1);
        assert_eq!(report.sent, 1);
        assert!(queue.is_empty());
        assert_eq!(queue.metrics().failed, 1);
    }

    #[test]
    fn test_purge_only_touches_destination() {
        let mut queue = OutboundQueue::new(&config());
        queue.enqueue(ConnectionHandle(1), chat("a"));
        queue.enqueue(ConnectionHandle(2), chat("b"));
        queue.enqueue(ConnectionHandle(1), chat("c"));

        assert_eq!(queue.purge(ConnectionHandle(1)), 2);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.depth_for(ConnectionHandle(2)), 1);
        assert_eq!(queue.metrics().purged, 2);
    }

    #[test]
    fn test_send_immediate_flushes_earlier_messages_first() {
        let mut queue = OutboundQueue::new(&config());
        let mut transport = ScriptedTransport::default();
        let early = chat("early");
        let other = chat("other");
        queue.enqueue(ConnectionHandle(1), early.clone());
        queue.enqueue(ConnectionHandle(2), other);

        let bulk = chat("bulk");
        queue
            .send_immediate(&mut transport, ConnectionHandle(1), &bulk)
            .expect("send");

        assert_eq!(transport.sent.len(), 2);
        assert_eq!(transport.sent[0].1, early.as_frame());
        assert_eq!(transport.sent[1].1, bulk.as_frame());
        assert_eq!(queue.depth_for(ConnectionHandle(2)), 1);
    }

    #[test]
    fn test_send_immediate_retries_then_gives_up() {
        let mut queue = OutboundQueue::new(&config());
        let mut transport = ScriptedTransport::with_script(vec![SendOutcome::RateLimited; 2]);
        queue
            .send_immediate(&mut transport, ConnectionHandle(1), &chat("ok"))
            .expect("succeeds after two retries");
        assert_eq!(transport.attempts, 3);

        let mut stuck = ScriptedTransport::with_script(vec![SendOutcome::RateLimited; 10]);
        let err = queue
            .send_immediate(&mut stuck, ConnectionHandle(1), &chat("stuck"))
            .unwrap_err();
        assert!(matches!(err, NetError::SendFailed { .. }));
        assert_eq!(stuck.attempts, 4);
    }
}

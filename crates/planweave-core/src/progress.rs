//! Progress bus: per-session bounded queues of typed progress events

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Kind of progress event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressKind {
    /// Free-form status line
    Status,
    /// The plan was generated; carries the step list
    PlanReady,
    /// A step began
    StepStart,
    /// A step finished
    StepDone,
    /// A step failed
    StepError,
    /// Execution began
    TaskStart,
    /// Tools were selected for the request
    ToolSelection,
    /// Tool metadata analysis progress
    MetadataAnalysis,
    /// Plan generation progress
    PlanGeneration,
    /// Plan execution progress
    PlanExecution,
}

/// One progress event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// Event kind
    pub kind: ProgressKind,
    /// Step label, e.g. `step_2` or a phase name
    pub step: String,
    /// Short human-readable status
    pub status: String,
    /// Unix timestamp in seconds
    pub timestamp: f64,
    /// Step id, for step events
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<u32>,
    /// Tool involved
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    /// Step description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Error text, for `step_error`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Structured payload, e.g. the step list of `plan_ready`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ProgressEvent {
    fn new(kind: ProgressKind, step: impl Into<String>, status: impl Into<String>) -> Self {
        Self {
            kind,
            step: step.into(),
            status: status.into(),
            timestamp: Utc::now().timestamp_millis() as f64 / 1000.0,
            step_id: None,
            tool: None,
            description: None,
            error: None,
            data: None,
        }
    }
}

/// Queue message: an event, or the terminal sentinel
type Message = Option<ProgressEvent>;

struct Session {
    tx: mpsc::Sender<Message>,
    rx: Option<mpsc::Receiver<Message>>,
    last_activity: Instant,
    closed: bool,
}

/// Per-session progress queues
///
/// Publishing to an unknown session creates it, so late subscribers see
/// buffered messages. Publishing never blocks: a full queue drops the event
/// with a warning. Each session has a single consumer.
pub struct ProgressBus {
    sessions: Mutex<HashMap<String, Session>>,
    capacity: usize,
}

impl ProgressBus {
    /// Default queue capacity per session
    pub const DEFAULT_CAPACITY: usize = 256;
    /// Default inactivity timeout before a session is reaped
    pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

    /// Create a bus with the given per-session capacity
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    /// Publish an event to a session, creating the session if needed
    pub fn publish(&self, session_id: &str, event: ProgressEvent) {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        let session = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| self.make_session());
        session.last_activity = Instant::now();
        if session.closed {
            debug!(session_id, "Event after close, dropped");
            return;
        }
        if session.tx.try_send(Some(event)).is_err() {
            warn!(session_id, "Progress queue full, event dropped");
        }
    }

    fn make_session(&self) -> Session {
        let (tx, rx) = mpsc::channel(self.capacity);
        Session {
            tx,
            rx: Some(rx),
            last_activity: Instant::now(),
            closed: false,
        }
    }

    /// Take the consumer end of a session's queue
    ///
    /// Creates the session when absent. Returns `None` when the consumer was
    /// already taken: sessions are single-consumer.
    pub fn subscribe(&self, session_id: &str) -> Option<mpsc::Receiver<Message>> {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        let session = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| self.make_session());
        session.last_activity = Instant::now();
        session.rx.take()
    }

    /// Enqueue the terminal sentinel; the subscriber drains, then removes
    pub fn close(&self, session_id: &str) {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(session) = sessions.get_mut(session_id) {
            session.closed = true;
            if session.tx.try_send(None).is_err() {
                warn!(session_id, "Could not enqueue close sentinel");
            }
        }
    }

    /// Drop a session entirely (subscriber finished draining)
    pub fn remove(&self, session_id: &str) {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(session_id);
    }

    /// Remove sessions idle past the timeout; returns how many were reaped
    pub fn reap_inactive(&self, idle_timeout: Duration) -> usize {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        let before = sessions.len();
        sessions.retain(|_, session| session.last_activity.elapsed() < idle_timeout);
        before - sessions.len()
    }

    /// Number of live sessions
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    // ---- typed publish helpers --------------------------------------------

    /// Publish a free-form status line
    pub fn publish_status(&self, session_id: &str, step: &str, status: &str) {
        self.publish(session_id, ProgressEvent::new(ProgressKind::Status, step, status));
    }

    /// Publish `plan_ready` carrying the step list
    pub fn publish_plan_ready(&self, session_id: &str, steps: Value) {
        let count = steps.as_array().map_or(0, Vec::len);
        let mut event = ProgressEvent::new(
            ProgressKind::PlanReady,
            "plan_ready",
            format!("plan generated with {count} steps"),
        );
        event.data = Some(serde_json::json!({ "steps": steps }));
        self.publish(session_id, event);
    }

    /// Publish `task_start`
    pub fn publish_task_start(&self, session_id: &str, flow_id: &str) {
        self.publish(
            session_id,
            ProgressEvent::new(ProgressKind::TaskStart, "task_start", format!("executing {flow_id}")),
        );
    }

    /// Publish `step_start`
    pub fn publish_step_start(&self, session_id: &str, step_id: u32, tool: &str, description: &str) {
        let mut event = ProgressEvent::new(
            ProgressKind::StepStart,
            format!("step_{step_id}"),
            format!("running step {step_id}: {description}"),
        );
        event.step_id = Some(step_id);
        event.tool = Some(tool.to_string());
        event.description = Some(description.to_string());
        self.publish(session_id, event);
    }

    /// Publish `step_done`
    pub fn publish_step_done(&self, session_id: &str, step_id: u32, tool: &str, description: &str) {
        let mut event = ProgressEvent::new(
            ProgressKind::StepDone,
            format!("step_{step_id}"),
            format!("step {step_id} done: {description}"),
        );
        event.step_id = Some(step_id);
        event.tool = Some(tool.to_string());
        event.description = Some(description.to_string());
        self.publish(session_id, event);
    }

    /// Publish `step_error`
    pub fn publish_step_error(&self, session_id: &str, step_id: u32, tool: &str, error: &str) {
        let preview: String = error.chars().take(100).collect();
        let mut event = ProgressEvent::new(
            ProgressKind::StepError,
            format!("step_{step_id}"),
            format!("step {step_id} failed: {preview}"),
        );
        event.step_id = Some(step_id);
        event.tool = Some(tool.to_string());
        event.error = Some(error.to_string());
        self.publish(session_id, event);
    }

    /// Publish `tool_selection`
    pub fn publish_tool_selection(&self, session_id: &str, tools: &[String]) {
        let mut event = ProgressEvent::new(
            ProgressKind::ToolSelection,
            "tool_selection",
            format!("{} tools selected", tools.len()),
        );
        event.data = Some(serde_json::json!({ "tools": tools }));
        self.publish(session_id, event);
    }
}

impl Default for ProgressBus {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_before_subscribe_buffers() {
        let bus = ProgressBus::default();
        bus.publish_status("s1", "init", "starting up");
        bus.publish_step_start("s1", 1, "ocr", "read the page");

        let mut rx = bus.subscribe("s1").unwrap();
        let first = rx.recv().await.unwrap().unwrap();
        assert_eq!(first.kind, ProgressKind::Status);
        let second = rx.recv().await.unwrap().unwrap();
        assert_eq!(second.kind, ProgressKind::StepStart);
        assert_eq!(second.step_id, Some(1));
    }

    #[tokio::test]
    async fn test_events_arrive_in_publish_order() {
        let bus = ProgressBus::default();
        for i in 1..=5 {
            bus.publish_step_start("s1", i, "t", "d");
        }
        let mut rx = bus.subscribe("s1").unwrap();
        for i in 1..=5 {
            let event = rx.recv().await.unwrap().unwrap();
            assert_eq!(event.step_id, Some(i));
        }
    }

    #[tokio::test]
    async fn test_close_sends_sentinel() {
        let bus = ProgressBus::default();
        bus.publish_status("s1", "a", "b");
        bus.close("s1");

        let mut rx = bus.subscribe("s1").unwrap();
        assert!(rx.recv().await.unwrap().is_some());
        assert!(rx.recv().await.unwrap().is_none());

        bus.remove("s1");
        assert_eq!(bus.session_count(), 0);
    }

    #[tokio::test]
    async fn test_publish_after_close_is_dropped() {
        let bus = ProgressBus::default();
        bus.close("s1");
        // Session did not exist, so close was a no-op; create then close
        bus.publish_status("s1", "a", "b");
        bus.close("s1");
        bus.publish_status("s1", "late", "dropped");

        let mut rx = bus.subscribe("s1").unwrap();
        assert!(rx.recv().await.unwrap().is_some());
        assert!(rx.recv().await.unwrap().is_none());
    }

    #[test]
    fn test_single_consumer() {
        let bus = ProgressBus::default();
        assert!(bus.subscribe("s1").is_some());
        assert!(bus.subscribe("s1").is_none());
    }

    #[test]
    fn test_full_queue_drops_without_blocking() {
        let bus = ProgressBus::new(2);
        for _ in 0..10 {
            bus.publish_status("s1", "spam", "x");
        }
        // No deadlock, session still alive with a bounded backlog
        assert_eq!(bus.session_count(), 1);
    }

    #[test]
    fn test_reap_inactive() {
        let bus = ProgressBus::default();
        bus.publish_status("s1", "a", "b");
        assert_eq!(bus.reap_inactive(Duration::from_secs(60)), 0);
        assert_eq!(bus.reap_inactive(Duration::from_nanos(0)), 1);
        assert_eq!(bus.session_count(), 0);
    }

    #[tokio::test]
    async fn test_plan_ready_carries_steps() {
        let bus = ProgressBus::default();
        bus.publish_plan_ready("s1", serde_json::json!([{"step_id": 1}, {"step_id": 2}]));

        let mut rx = bus.subscribe("s1").unwrap();
        let event = rx.recv().await.unwrap().unwrap();
        assert_eq!(event.kind, ProgressKind::PlanReady);
        assert_eq!(event.data.unwrap()["steps"].as_array().unwrap().len(), 2);
    }
}

//! Record tracing events in memory so tests can assert on what was logged.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::field::{Field, Visit};
use tracing::subscriber::DefaultGuard;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

/// One recorded event.
#[derive(Clone, Debug)]
pub struct CapturedEvent {
    /// Level it was emitted at.
    pub level: Level,
    /// The `message` field.
    pub message: String,
    /// Every other field, rendered.
    pub fields: BTreeMap<&'static str, String>,
}

impl CapturedEvent {
    /// Rendered value of `name`.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

/// Handle to the events recorded since [`capture_logs`].
#[derive(Clone, Default)]
pub struct CapturedLogs(Arc<Mutex<Vec<CapturedEvent>>>);

impl CapturedLogs {
    /// Snapshot of everything recorded.
    pub fn events(&self) -> Vec<CapturedEvent> {
        self.0.lock().clone()
    }

    /// Any event, at any level, whose message contains `needle`.
    pub fn has_message(&self, needle: &str) -> bool {
        self.find(|e| e.message.contains(needle)).is_some()
    }

    /// An event at exactly `level` whose message contains `needle`.
    pub fn has_event(&self, level: Level, needle: &str) -> bool {
        self.find(|e| e.level == level && e.message.contains(needle))
            .is_some()
    }

    /// First event matching `pred`.
    pub fn find(&self, pred: impl Fn(&CapturedEvent) -> bool) -> Option<CapturedEvent> {
        self.0.lock().iter().find(|e| pred(e)).cloned()
    }
}

#[derive(Default)]
struct Recorder {
    message: String,
    fields: BTreeMap<&'static str, String>,
}

impl Visit for Recorder {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_owned();
        } else {
            let _ = self.fields.insert(field.name(), value.to_owned());
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            let _ = self.fields.insert(field.name(), format!("{value:?}"));
        }
    }
}

struct CaptureLayer(CapturedLogs);

impl<S: Subscriber> Layer<S> for CaptureLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut recorder = Recorder::default();
        event.record(&mut recorder);
        (self.0).0.lock().push(CapturedEvent {
            level: *event.metadata().level(),
            message: recorder.message,
            fields: recorder.fields,
        });
    }
}

/// Capture every event emitted on this thread until the guard drops.
///
/// Thread-local: use it with the current-thread `#[tokio::test]` runtime
/// so spawned engine tasks are captured too.
pub fn capture_logs() -> (CapturedLogs, DefaultGuard) {
    let logs = CapturedLogs::default();
    let guard = tracing_subscriber::registry()
        .with(CaptureLayer(logs.clone()))
        .set_default();
    (logs, guard)
}

//! Integration tests for telemetry initialization and span helpers.

use std::fmt::Debug;
use std::sync::{Arc, Mutex};

use tracing::field::{Field, Visit};
use tracing::span::{Attributes, Id, Record};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt as _};
use workq::MessageId;

/// Collects every field recorded on spans and events as `(name, debug value)`.
#[derive(Clone, Default)]
struct CapturedFields(Arc<Mutex<Vec<(String, String)>>>);

impl CapturedFields {
    fn contains(&self, name: &str, value: &str) -> bool {
        self.0
            .lock()
            .unwrap()
            .iter()
            .any(|(n, v)| n == name && v == value)
    }
}

struct Collect<'a>(&'a mut Vec<(String, String)>);

impl Visit for Collect<'_> {
    fn record_debug(&mut self, field: &Field, value: &dyn Debug) {
        self.0.push((field.name().to_string(), format!("{value:?}")));
    }
}

impl<S: Subscriber> Layer<S> for CapturedFields {
    fn on_new_span(&self, attrs: &Attributes<'_>, _id: &Id, _ctx: Context<'_, S>) {
        attrs.record(&mut Collect(&mut self.0.lock().unwrap()));
    }

    fn on_record(&self, _id: &Id, values: &Record<'_>, _ctx: Context<'_, S>) {
        values.record(&mut Collect(&mut self.0.lock().unwrap()));
    }

    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        event.record(&mut Collect(&mut self.0.lock().unwrap()));
    }
}

#[test]
fn telemetry_initializes_without_endpoint() {
    // Note: tracing subscriber can only be set once per process.
    // Using try_init() in the implementation avoids panics if another
    // test already initialized a subscriber.
    let config = workq::telemetry::TelemetryConfig {
        endpoint: None,
        service_name: "workq-test".to_string(),
        log_level: "debug".to_string(),
    };
    // This may return Err if a global subscriber was already set by
    // another test in this process; that is acceptable.
    let _guard = workq::telemetry::init_telemetry(config);
}

#[test]
fn claim_span_records_claim_and_transition() {
    let captured = CapturedFields::default();
    let subscriber = tracing_subscriber::registry().with(captured.clone());

    tracing::subscriber::with_default(subscriber, || {
        let span = workq::telemetry::queue::start_claim_span("orders", "reserve");
        workq::telemetry::queue::record_claim(&span, MessageId(7), 3);
        workq::telemetry::queue::record_state_transition(&span, MessageId(7), "ready", "reserved");
    });

    assert!(captured.contains("queue.name", "\"orders\""));
    assert!(captured.contains("queue.operation", "\"reserve\""));
    assert!(captured.contains("message.id", "7"));
    assert!(captured.contains("queue.polls", "3"));
    assert!(captured.contains("id", "7"));
    assert!(captured.contains("from", "\"ready\""));
    assert!(captured.contains("to", "\"reserved\""));
}

#[tokio::test]
async fn reserve_records_the_claimed_message_on_its_span() {
    let captured = CapturedFields::default();
    let subscriber = tracing_subscriber::registry().with(captured.clone());
    let _default = tracing::subscriber::set_default(subscriber);

    let queue = workq::Queue::in_memory("telemetry-span").unwrap();
    let id = queue.submit("traced").await.unwrap().unwrap();
    let message = queue.reserve(Some(std::time::Duration::ZERO)).await.unwrap().unwrap();

    assert_eq!(message.id, id);
    assert!(captured.contains("message.id", &id.0.to_string()));
    assert!(captured.contains("queue.polls", "1"));
}

#[tokio::test]
async fn queue_operations_emit_without_a_meter_provider() {
    // No global provider installed: instruments are no-ops and must not panic.
    let queue = workq::Queue::in_memory("telemetry").unwrap();
    let id = queue.submit("metered").await.unwrap().unwrap();
    queue.reserve(Some(std::time::Duration::ZERO)).await.unwrap();
    assert!(queue.finish(id).await.unwrap());
}

//! End-to-end flows through the in-memory relay: bus -> pipeline -> chats,
//! and chat `start` -> registry -> later fanouts.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use proptest::prelude::*;
use relay_core::dead_letter::Stage;
use relay_core::event_bus::{BusMessage, EventBus};
use relay_core::event_store::StorageError;
use relay_core::registry::ChatId;
use relay_runtime::{
    BusListener, FailurePolicy, FanoutDispatcher, Outcome, Pipeline, PipelineError,
    RegistrationListener, TemplateRenderer,
};
use relay_testing::fixtures::{ana, registration_body};
use relay_testing::properties::arb_user;
use relay_testing::{
    InMemoryDeadLetterQueue, InMemoryEventBus, InMemoryEventStore, InMemorySubscriberRegistry,
    RecordingTransport, ScriptedCommandSource, eventually, init_tracing,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

const WAIT: Duration = Duration::from_secs(2);
const SUBJECT: &str = "customer.registered";

fn shipped_templates() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../templates")
}

struct Relay {
    bus: InMemoryEventBus,
    store: InMemoryEventStore,
    registry: InMemorySubscriberRegistry,
    transport: RecordingTransport,
    dead_letters: InMemoryDeadLetterQueue,
    commands: ScriptedCommandSource,
    shutdown: broadcast::Sender<()>,
}

impl Relay {
    fn new() -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            bus: InMemoryEventBus::new(),
            store: InMemoryEventStore::new(),
            registry: InMemorySubscriberRegistry::new(),
            transport: RecordingTransport::new(),
            dead_letters: InMemoryDeadLetterQueue::new(),
            commands: ScriptedCommandSource::new(),
            shutdown,
        }
    }

    fn renderer(templates: PathBuf) -> Arc<TemplateRenderer> {
        Arc::new(TemplateRenderer::new(templates).expect("renderer"))
    }

    fn pipeline(&self, templates: PathBuf, policy: FailurePolicy) -> Pipeline {
        Pipeline::new(
            Arc::new(self.store.clone()),
            Self::renderer(templates),
            FanoutDispatcher::new(
                Arc::new(self.registry.clone()),
                Arc::new(self.transport.clone()),
            ),
            Arc::new(self.dead_letters.clone()),
        )
        .with_policy(policy)
    }

    fn bus_listener(&self, templates: PathBuf, policy: FailurePolicy) -> BusListener {
        BusListener::new(
            "registrations",
            vec![SUBJECT.to_string()],
            Arc::new(self.bus.clone()),
            Arc::new(self.pipeline(templates, policy)),
            self.shutdown.subscribe(),
        )
        .with_retry_delay(Duration::from_millis(20))
    }

    fn registration_listener(&self) -> RegistrationListener {
        RegistrationListener::new(
            Arc::new(self.commands.clone()),
            Arc::new(self.registry.clone()),
            Arc::new(self.transport.clone()),
            Self::renderer(shipped_templates()),
            self.shutdown.subscribe(),
        )
        .with_retry_delay(Duration::from_millis(20))
    }
}

#[tokio::test]
async fn registration_event_reaches_every_subscriber() {
    init_tracing();
    let relay = Relay::new();
    for chat in [101, 102, 103] {
        relay.registry.add(ChatId(chat));
    }
    let task = relay
        .bus_listener(shipped_templates(), FailurePolicy::Isolate)
        .spawn();

    relay
        .bus
        .publish(SUBJECT, &registration_body(&ana()))
        .await
        .unwrap();

    let transport = relay.transport.clone();
    assert!(eventually(WAIT, || transport.sent().len() == 3).await);
    assert_eq!(relay.store.len(), 1);
    assert_eq!(relay.store.events()[0].payload, ana());

    let text = &relay.transport.sent_to(ChatId(102))[0];
    for value in ["Ana", "Lee", "en", "US"] {
        assert!(text.contains(value), "{value} missing from {text}");
    }

    relay.shutdown.send(()).unwrap();
    assert_eq!(task.await.unwrap(), Ok(()));
}

#[tokio::test]
async fn registration_event_without_subscribers_is_still_stored() {
    let relay = Relay::new();
    let pipeline = relay.pipeline(shipped_templates(), FailurePolicy::Isolate);

    let outcome = pipeline
        .handle(&BusMessage::new(SUBJECT, registration_body(&ana())))
        .await
        .unwrap();

    assert!(matches!(outcome, Outcome::Dispatched { ref report, .. } if report.attempted == 0));
    assert_eq!(relay.store.len(), 1);
    assert_eq!(relay.transport.attempts(), 0);
}

#[tokio::test]
async fn isolated_failures_do_not_block_later_messages() {
    let relay = Relay::new();
    relay.registry.add(ChatId(7));
    let task = relay
        .bus_listener(shipped_templates(), FailurePolicy::Isolate)
        .spawn();

    relay.bus.publish(SUBJECT, b"garbage").await.unwrap();
    relay
        .bus
        .publish(SUBJECT, &registration_body(&ana()))
        .await
        .unwrap();

    let transport = relay.transport.clone();
    assert!(eventually(WAIT, || transport.sent().len() == 1).await);
    assert_eq!(relay.dead_letters.stages(), vec![Stage::Decode]);
    assert_eq!(relay.dead_letters.entries()[0].payload, b"garbage");
    assert_eq!(relay.store.len(), 1);
    let bus = relay.bus.clone();
    assert!(eventually(WAIT, || bus.acknowledged().len() == 2).await);

    relay.shutdown.send(()).unwrap();
    assert_eq!(task.await.unwrap(), Ok(()));
}

#[tokio::test]
async fn halt_policy_stops_the_listener_on_render_failure() {
    let relay = Relay::new();
    relay.registry.add(ChatId(7));
    let empty = tempfile::tempdir().expect("tempdir");
    let task = relay
        .bus_listener(empty.path().to_path_buf(), FailurePolicy::Halt)
        .spawn();

    relay
        .bus
        .publish(SUBJECT, &registration_body(&ana()))
        .await
        .unwrap();

    let result = tokio::time::timeout(WAIT, task)
        .await
        .expect("listener stops")
        .unwrap();
    assert!(matches!(result, Err(PipelineError::Render(_))));
    assert_eq!(relay.store.len(), 1);
    assert_eq!(relay.dead_letters.stages(), vec![Stage::Render]);
    assert_eq!(relay.transport.attempts(), 0);
    assert!(relay.bus.acknowledged().is_empty());
}

#[tokio::test]
async fn halted_messages_are_redelivered_after_restart() {
    let relay = Relay::new();
    relay.registry.add(ChatId(7));
    relay
        .store
        .fail_with(StorageError::Connection("database down".to_string()));
    for _ in 0..2 {
        relay
            .bus
            .publish(SUBJECT, &registration_body(&ana()))
            .await
            .unwrap();
    }

    let first_run = relay
        .bus_listener(shipped_templates(), FailurePolicy::Halt)
        .run();
    let result = tokio::time::timeout(WAIT, first_run)
        .await
        .expect("listener stops");
    assert!(matches!(result, Err(PipelineError::Persist(_))));
    assert!(relay.store.is_empty());
    assert!(relay.bus.acknowledged().is_empty());
    assert_eq!(relay.bus.unacknowledged().len(), 2);

    relay.store.recover();
    let task = relay
        .bus_listener(shipped_templates(), FailurePolicy::Halt)
        .spawn();

    let bus = relay.bus.clone();
    assert!(eventually(WAIT, || bus.acknowledged().len() == 2).await);
    assert_eq!(relay.store.len(), 2);
    assert_eq!(relay.transport.sent_to(ChatId(7)).len(), 2);
    assert!(relay.bus.unacknowledged().is_empty());

    relay.shutdown.send(()).unwrap();
    assert_eq!(task.await.unwrap(), Ok(()));
}

#[tokio::test]
async fn chat_that_starts_the_bot_receives_later_notifications() {
    init_tracing();
    let relay = Relay::new();
    let registrations = relay.registration_listener().spawn();
    let bus = relay
        .bus_listener(shipped_templates(), FailurePolicy::Isolate)
        .spawn();

    relay.commands.send_text(55, "/start");
    relay.commands.send_text(55, "/start");
    let registry = relay.registry.clone();
    let transport = relay.transport.clone();
    assert!(eventually(WAIT, || transport.sent_to(ChatId(55)).len() == 2).await);
    assert_eq!(registry.len(), 1);

    relay
        .bus
        .publish(SUBJECT, &registration_body(&ana()))
        .await
        .unwrap();
    assert!(eventually(WAIT, || transport.sent_to(ChatId(55)).len() == 3).await);

    relay.shutdown.send(()).unwrap();
    registrations.await.unwrap();
    assert_eq!(bus.await.unwrap(), Ok(()));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn stored_payload_equals_published_payload(user in arb_user()) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let relay = Relay::new();
        let pipeline = relay.pipeline(shipped_templates(), FailurePolicy::Isolate);

        let outcome = runtime
            .block_on(pipeline.handle(&BusMessage::new(SUBJECT, registration_body(&user))))
            .unwrap();

        prop_assert!(matches!(outcome, Outcome::Dispatched { .. }), "outcome: {:?}", outcome);
        prop_assert_eq!(relay.store.events()[0].payload.clone(), user);
    }
}

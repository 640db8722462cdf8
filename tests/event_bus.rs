//! Transactional publishing through the in-process channel bus.
//!
//! Run with: cargo test --test event_bus

use std::sync::Arc;
use std::time::Duration;

use ami_gateway::ami::codec::split_blocks;
use ami_gateway::ami::relay::event_descriptor;
use ami_gateway::bus::{
    handler_fn, BusConsumer, BusError, ChannelBus, EventMarshaler, InboundEvent, PublisherTemplate,
};
use ami_gateway::events::catalog::{
    CONFERENCE_PARTICIPANT_JOINED, TENANT_CREATED, USER_CREATED, USER_SERVICE_EDITED,
};
use ami_gateway::events::EventDescriptor;
use ami_gateway::health::StatusProvider;
use serde_json::json;
use tokio::sync::mpsc;

const TENANT: &str = "5e4d3c2b-1a09-4f8e-9d7c-6b5a49382716";

struct Harness {
    bus: ChannelBus,
    template: PublisherTemplate,
}

impl Harness {
    fn new() -> Self {
        let bus = ChannelBus::new();
        let template =
            PublisherTemplate::capture(Arc::new(bus.clone()), EventMarshaler::new("gateway-1"));
        Self { bus, template }
    }

    async fn consumer(&self, patterns: &[&str]) -> (Arc<BusConsumer>, mpsc::Receiver<Arc<InboundEvent>>) {
        let consumer = Arc::new(BusConsumer::new(Duration::from_millis(500)));
        let (tx, rx) = mpsc::channel(32);
        for pattern in patterns {
            let tx = tx.clone();
            consumer
                .register(
                    pattern,
                    handler_fn(move |event| {
                        let tx = tx.clone();
                        async move {
                            let _ = tx.send(event).await;
                            Ok::<(), BusError>(())
                        }
                    }),
                )
                .await;
        }
        self.bus.attach(consumer.clone());
        (consumer, rx)
    }
}

async fn recv(rx: &mut mpsc::Receiver<Arc<InboundEvent>>) -> Arc<InboundEvent> {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("Timed out waiting for event")
        .expect("Channel closed")
}

async fn assert_quiet(rx: &mut mpsc::Receiver<Arc<InboundEvent>>) {
    let extra = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
    assert!(extra.is_err(), "unexpected event delivered");
}

fn user_created(name: &str) -> EventDescriptor {
    EventDescriptor::builder(&USER_CREATED)
        .content(json!({"firstname": name}))
        .tenant_uuid(TENANT)
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_flush_delivers_in_order() {
    let harness = Harness::new();
    let (_, mut rx) = harness.consumer(&["user_created"]).await;

    let mut uow = harness.template.unit_of_work();
    uow.queue_event(user_created("Alice"), None);
    uow.queue_event(user_created("Bob"), None);
    assert_quiet(&mut rx).await;

    assert_eq!(uow.flush().await.unwrap(), 2);

    assert_eq!(recv(&mut rx).await.data["firstname"], "Alice");
    assert_eq!(recv(&mut rx).await.data["firstname"], "Bob");
}

#[tokio::test]
async fn test_rollback_delivers_nothing() {
    let harness = Harness::new();
    let (_, mut rx) = harness.consumer(&["*"]).await;

    let mut uow = harness.template.unit_of_work();
    uow.queue_event(user_created("Alice"), None);
    uow.rollback();
    uow.flush().await.unwrap();

    assert_quiet(&mut rx).await;
}

#[tokio::test]
async fn test_units_of_work_are_independent() {
    let harness = Harness::new();
    let (_, mut rx) = harness.consumer(&["user_created"]).await;

    let mut committed = harness.template.unit_of_work();
    let mut abandoned = harness.template.unit_of_work();
    committed.queue_event(user_created("Alice"), None);
    abandoned.queue_event(user_created("Mallory"), None);
    abandoned.rollback();
    committed.flush().await.unwrap();

    assert_eq!(recv(&mut rx).await.data["firstname"], "Alice");
    assert_quiet(&mut rx).await;
}

#[tokio::test]
async fn test_routing_key_patterns() {
    let harness = Harness::new();
    let (_, mut rx) = harness.consumer(&["rk:config.users.*.services.#"]).await;

    let mut uow = harness.template.unit_of_work();
    uow.queue_event(user_created("Alice"), None);
    uow.queue_event(
        EventDescriptor::builder(&USER_SERVICE_EDITED)
            .content(json!({"service_name": "dnd", "enabled": true}))
            .tenant_uuid(TENANT)
            .user_uuid("u-42")
            .build()
            .unwrap(),
        None,
    );
    uow.flush().await.unwrap();

    let event = recv(&mut rx).await;
    assert_eq!(event.name, "users_services_dnd_updated");
    assert_eq!(event.routing_key, "config.users.u-42.services.dnd.updated");
    assert_eq!(event.headers["user_uuid:u-42"], true);
    assert_quiet(&mut rx).await;
}

#[tokio::test]
async fn test_scope_headers_survive_transport() {
    let harness = Harness::new();
    let (_, mut rx) = harness
        .consumer(&["auth_tenant_added", "conference_participant_joined"])
        .await;

    let mut uow = harness.template.unit_of_work();
    uow.queue_event(
        EventDescriptor::builder(&TENANT_CREATED)
            .content(json!({"uuid": TENANT}))
            .tenant_uuid(TENANT)
            .build()
            .unwrap(),
        None,
    );
    uow.queue_event(
        EventDescriptor::builder(&CONFERENCE_PARTICIPANT_JOINED)
            .content(json!({"conference_id": 9}))
            .tenant_uuid(TENANT)
            .user_uuids(["u-1", "u-2"])
            .build()
            .unwrap(),
        None,
    );
    uow.flush().await.unwrap();

    let tenant = recv(&mut rx).await;
    assert_eq!(tenant.headers["tenant_uuid"], TENANT);
    assert_eq!(tenant.headers["user_uuid:*"], true);
    assert_eq!(tenant.headers["origin_uuid"], "gateway-1");

    let conference = recv(&mut rx).await;
    assert_eq!(conference.headers["user_uuid:u-1"], true);
    assert_eq!(conference.headers["user_uuid:u-2"], true);
    assert_eq!(conference.headers["required_access"], "event.conference_participant_joined");
}

#[tokio::test]
async fn test_failing_handler_does_not_stop_delivery() {
    let harness = Harness::new();
    let consumer = Arc::new(BusConsumer::new(Duration::from_millis(500)));
    consumer
        .register(
            "user_created",
            handler_fn(|_| async { Err(BusError::Handler("rejected".to_string())) }),
        )
        .await;
    let (tx, mut rx) = mpsc::channel(8);
    consumer
        .register(
            "user_created",
            handler_fn(move |event| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(event).await;
                    Ok::<(), BusError>(())
                }
            }),
        )
        .await;
    harness.bus.attach(consumer.clone());

    let mut uow = harness.template.unit_of_work();
    uow.queue_event(user_created("Alice"), None);
    uow.queue_event(user_created("Bob"), None);
    uow.flush().await.unwrap();

    assert_eq!(recv(&mut rx).await.data["firstname"], "Alice");
    assert_eq!(recv(&mut rx).await.data["firstname"], "Bob");
    assert_eq!(consumer.provide_status().1["status"], "ok");
}

#[tokio::test]
async fn test_relayed_ami_events_reach_consumers() {
    let harness = Harness::new();
    let (_, mut rx) = harness.consumer(&["rk:ami.*"]).await;

    let mut uow = harness.template.unit_of_work();
    for block in split_blocks(b"Event: Newchannel\r\nChannel: PJSIP/100-01\r\n\r\nEvent: Hangup\r\nCause: 16\r\n\r\n") {
        uow.queue_event(event_descriptor(&block).unwrap(), None);
    }
    uow.flush().await.unwrap();

    let first = recv(&mut rx).await;
    assert_eq!(first.name, "Newchannel");
    assert_eq!(first.data["Channel"], "PJSIP/100-01");
    let second = recv(&mut rx).await;
    assert_eq!(second.routing_key, "ami.Hangup");
}

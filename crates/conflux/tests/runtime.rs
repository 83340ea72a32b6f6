//! Runtime tests against the in-process broker
//!
//! Each test builds a full `BrokerRuntime`: registry resolution, connect,
//! seek, dispatch, commit and supervised restarts.
//!
//! Run with: cargo test -p conflux --test runtime -- --nocapture

use anyhow::Result;
use conflux::codec::PayloadFormat;
use conflux::config::KafkaSettings;
use conflux::prelude::*;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

const GROUP: &str = "runtime-tests";

fn settings() -> KafkaSettings {
    KafkaSettings::builder()
        .group_id(GROUP)
        .postfix("")
        .startup_delay(Duration::ZERO)
        .poll_max_wait(Duration::from_millis(20))
        .payload_format(PayloadFormat::Json)
        .build()
}

/// Frame a body the way schema-registry producers do: magic byte plus a
/// 4-byte schema id
fn framed(body: &[u8]) -> Vec<u8> {
    let mut out = vec![0, 0, 0, 0, 7];
    out.extend_from_slice(body);
    out
}

/// Captures every envelope a handler receives
#[derive(Clone, Default)]
struct Recorder {
    seen: Arc<Mutex<Vec<Envelope>>>,
}

impl Recorder {
    fn handler(
        &self,
    ) -> impl Fn(Envelope, DispatchContext) -> futures::future::Ready<anyhow::Result<()>> + Send + Sync + 'static
    {
        let seen = Arc::clone(&self.seen);
        move |envelope, _ctx| {
            seen.lock().push(envelope);
            futures::future::ready(Ok(()))
        }
    }

    fn offsets(&self, topic: &str) -> Vec<i64> {
        self.seen
            .lock()
            .iter()
            .filter(|e| e.topic == topic)
            .map(|e| e.offset)
            .collect()
    }

    fn values(&self) -> Vec<Option<serde_json::Value>> {
        self.seen.lock().iter().map(|e| e.value.clone()).collect()
    }

    fn len(&self) -> usize {
        self.seen.lock().len()
    }
}

async fn wait_until(what: &str, condition: impl Fn() -> bool) -> Result<()> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return Ok(());
        }
        sleep(Duration::from_millis(10)).await;
    }
    anyhow::bail!("Timeout waiting for {}", what)
}

#[tokio::test]
async fn test_seek_policies_position_each_topic() -> Result<()> {
    let broker = InMemoryBroker::new();
    for topic in ["replay", "tail", "resume"] {
        broker.publish(topic, 0, None, r#"{"n":0}"#)?;
        broker.publish(topic, 0, None, r#"{"n":1}"#)?;
    }

    let recorder = Recorder::default();
    let mut registry = TopicRegistry::new();
    registry
        .add_fn("replay", recorder.handler(), SeekPolicy::Earliest)
        .add_fn("tail", recorder.handler(), SeekPolicy::Latest)
        .add_fn("resume", recorder.handler(), SeekPolicy::None);
    let registry = registry.resolve(&HashMap::<String, String>::new())?;

    let runtime = BrokerRuntime::builder(settings(), broker.clone())
        .registry(registry)
        .build();
    runtime.connect().await?;

    let snapshot = runtime.offset_snapshot();
    assert_eq!(snapshot.len(), 3);
    assert_eq!(snapshot.get("tail").map(|w| w[0].high), Some(2));

    wait_until("replayed records", || recorder.offsets("replay").len() == 2).await?;

    for topic in ["replay", "tail", "resume"] {
        broker.publish(topic, 0, None, r#"{"n":2}"#)?;
    }
    wait_until("new records", || recorder.len() == 5).await?;

    assert_eq!(recorder.offsets("replay"), vec![0, 1, 2]);
    assert_eq!(recorder.offsets("tail"), vec![2]);
    assert_eq!(recorder.offsets("resume"), vec![2]);

    runtime.disconnect().await;
    Ok(())
}

#[tokio::test]
async fn test_config_token_resolves_topic() -> Result<()> {
    let broker = InMemoryBroker::new();
    let recorder = Recorder::default();

    let config: HashMap<String, String> =
        [("ORDERS_TOPIC".to_string(), "orders.v2".to_string())].into();
    let mut registry = TopicRegistry::new();
    registry.add_fn("#ORDERS_TOPIC", recorder.handler(), SeekPolicy::Earliest);
    let registry = registry.resolve(&config)?;
    assert_eq!(registry.topics().collect::<Vec<_>>(), vec!["orders.v2"]);

    broker.publish("orders.v2", 0, None, r#"{"id":1}"#)?;
    let runtime = BrokerRuntime::builder(settings(), broker.clone())
        .registry(registry)
        .build();
    runtime.connect().await?;

    wait_until("resolved topic record", || recorder.len() == 1).await?;
    assert_eq!(recorder.values(), vec![Some(json!({"id": 1}))]);

    runtime.disconnect().await;
    Ok(())
}

#[tokio::test]
async fn test_unresolvable_token_fails_resolution() {
    let recorder = Recorder::default();
    let mut registry = TopicRegistry::new();
    registry.add_fn("#MISSING_TOPIC", recorder.handler(), SeekPolicy::None);

    let err = registry
        .resolve(&HashMap::<String, String>::new())
        .unwrap_err();
    assert!(matches!(err, Error::Configuration(_)));
    assert!(err.to_string().contains("MISSING_TOPIC"));
}

#[tokio::test]
async fn test_last_registration_wins() -> Result<()> {
    let broker = InMemoryBroker::new();
    let first = Recorder::default();
    let second = Recorder::default();

    let mut registry = TopicRegistry::new();
    registry
        .add_fn("orders", first.handler(), SeekPolicy::Latest)
        .add_fn("orders", second.handler(), SeekPolicy::Earliest);
    let registry = registry.resolve(&HashMap::<String, String>::new())?;
    assert_eq!(registry.len(), 1);

    broker.publish("orders", 0, None, r#"{"id":1}"#)?;
    let runtime = BrokerRuntime::builder(settings(), broker.clone())
        .registry(registry)
        .build();
    runtime.connect().await?;

    // the replacing registration also brings its seek policy
    wait_until("second handler", || second.len() == 1).await?;
    sleep(Duration::from_millis(50)).await;
    assert_eq!(first.len(), 0);

    runtime.disconnect().await;
    Ok(())
}

#[tokio::test]
async fn test_framed_payload_decoding() -> Result<()> {
    let broker = InMemoryBroker::new();
    let recorder = Recorder::default();
    let mut registry = TopicRegistry::new();
    registry.add_fn("events", recorder.handler(), SeekPolicy::Earliest);

    broker.publish(
        "events",
        0,
        Some(framed(br#""k-1""#).as_slice()),
        framed(br#"{"id":1}"#),
    )?;
    broker.publish("events", 0, None, b"abc")?;
    broker.publish("events", 0, None, framed(b"plain text"))?;
    broker.publish("events", 0, None, framed(br#"[1,2]"#))?;

    let settings = KafkaSettings::builder()
        .group_id(GROUP)
        .postfix("")
        .poll_max_wait(Duration::from_millis(20))
        .payload_format(PayloadFormat::FramedJson)
        .build();
    let runtime = BrokerRuntime::builder(settings, broker.clone())
        .registry(registry.resolve(&HashMap::<String, String>::new())?)
        .build();
    runtime.connect().await?;

    wait_until("all records", || recorder.len() == 4).await?;
    assert_eq!(
        recorder.values(),
        vec![Some(json!({"id": 1})), None, None, Some(json!([1, 2]))]
    );
    // key framed as a JSON string does not start a structured payload
    assert_eq!(recorder.seen.lock()[0].key, None);
    assert_eq!(runtime.restart_count(), 0);

    runtime.disconnect().await;
    Ok(())
}

#[tokio::test]
async fn test_malformed_payload_restarts_once() -> Result<()> {
    let broker = InMemoryBroker::new();
    let recorder = Recorder::default();
    let mut registry = TopicRegistry::new();
    registry.add_fn("events", recorder.handler(), SeekPolicy::None);

    let runtime = BrokerRuntime::builder(settings(), broker.clone())
        .registry(registry.resolve(&HashMap::<String, String>::new())?)
        .build();
    runtime.connect().await?;

    broker.publish("events", 0, None, r#"{"broken":"#)?;
    broker.publish("events", 0, None, r#"{"ok":true}"#)?;

    wait_until("record after the malformed one", || recorder.len() == 1).await?;
    wait_until("restart", || runtime.restart_count() == 1).await?;
    assert_eq!(recorder.offsets("events"), vec![1]);
    wait_until("commit past both records", || {
        broker.committed(GROUP, "events", 0) == Some(2)
    })
    .await?;

    runtime.disconnect().await;
    Ok(())
}

#[tokio::test]
async fn test_failing_handler_restarts_without_redelivery() -> Result<()> {
    let broker = InMemoryBroker::new();
    let attempts = Arc::new(Mutex::new(Vec::new()));

    let mut registry = TopicRegistry::new();
    let calls = Arc::clone(&attempts);
    registry.add_fn(
        "payments",
        move |envelope: Envelope, _ctx: DispatchContext| {
            let calls = Arc::clone(&calls);
            async move {
                calls.lock().push(envelope.offset);
                if envelope.value == Some(json!("poison")) {
                    anyhow::bail!("cannot process offset {}", envelope.offset);
                }
                Ok(())
            }
        },
        SeekPolicy::None,
    );

    let runtime = BrokerRuntime::builder(settings(), broker.clone())
        .registry(registry.resolve(&HashMap::<String, String>::new())?)
        .build();
    let mut states = runtime.watch_state();
    runtime.connect().await?;
    assert_eq!(*states.borrow_and_update(), ConnectionState::Connected);

    broker.publish("payments", 0, None, r#""a""#)?;
    broker.publish("payments", 0, None, r#""poison""#)?;
    broker.publish("payments", 0, None, r#""b""#)?;

    wait_until("record after the failure", || attempts.lock().contains(&2)).await?;
    wait_until("second generation", || runtime.generation() == 2).await?;
    sleep(Duration::from_millis(100)).await;

    assert_eq!(*attempts.lock(), vec![0, 1, 2]);
    assert_eq!(runtime.restart_count(), 1);
    assert_eq!(broker.connect_count(), 2);
    assert_eq!(runtime.state(), ConnectionState::Connected);

    runtime.disconnect().await;
    Ok(())
}

#[tokio::test]
async fn test_broker_fault_reconnects_and_resumes() -> Result<()> {
    let broker = InMemoryBroker::new();
    let recorder = Recorder::default();
    let mut registry = TopicRegistry::new();
    registry.add_fn("metrics", recorder.handler(), SeekPolicy::None);

    let runtime = BrokerRuntime::builder(settings(), broker.clone())
        .registry(registry.resolve(&HashMap::<String, String>::new())?)
        .build();
    runtime.connect().await?;

    broker.publish("metrics", 0, None, r#"{"v":1}"#)?;
    wait_until("first record", || recorder.len() == 1).await?;

    broker.inject_fault(FaultKind::Disconnect);
    wait_until("reconnect", || runtime.generation() == 2).await?;
    assert_eq!(runtime.restart_count(), 1);

    broker.publish("metrics", 0, None, r#"{"v":2}"#)?;
    wait_until("record after reconnect", || recorder.len() == 2).await?;
    assert_eq!(recorder.offsets("metrics"), vec![0, 1]);
    assert_eq!(broker.open_sessions(), 3);

    runtime.disconnect().await;
    assert_eq!(broker.open_sessions(), 0);
    Ok(())
}

#[tokio::test]
async fn test_broker_fault_commits_handled_records_first() -> Result<()> {
    let broker = InMemoryBroker::new();
    let recorder = Recorder::default();
    let mut registry = TopicRegistry::new();
    registry.add_fn("metrics", recorder.handler(), SeekPolicy::None);

    let settings = KafkaSettings::builder()
        .group_id(GROUP)
        .postfix("")
        .startup_delay(Duration::ZERO)
        .poll_max_wait(Duration::from_millis(20))
        .payload_format(PayloadFormat::Json)
        .auto_commit_threshold(2)
        .build();
    let runtime = BrokerRuntime::builder(settings, broker.clone())
        .registry(registry.resolve(&HashMap::<String, String>::new())?)
        .build();
    runtime.connect().await?;

    broker.publish("metrics", 0, None, r#"{"v":0}"#)?;
    broker.publish("metrics", 0, None, r#"{"v":1}"#)?;
    wait_until("threshold commit", || broker.committed(GROUP, "metrics", 0) == Some(2)).await?;

    // below the threshold, so still pending when the fault hits
    broker.publish("metrics", 0, None, r#"{"v":2}"#)?;
    wait_until("third record", || recorder.len() == 3).await?;
    assert_eq!(broker.committed(GROUP, "metrics", 0), Some(2));

    broker.inject_fault(FaultKind::Disconnect);
    wait_until("reconnect", || runtime.generation() == 2).await?;
    assert_eq!(broker.committed(GROUP, "metrics", 0), Some(3));

    broker.publish("metrics", 0, None, r#"{"v":3}"#)?;
    wait_until("record after reconnect", || recorder.len() == 4).await?;
    sleep(Duration::from_millis(50)).await;
    assert_eq!(recorder.offsets("metrics"), vec![0, 1, 2, 3]);

    runtime.disconnect().await;
    Ok(())
}

#[tokio::test]
async fn test_send_reaches_only_the_topic_handler() -> Result<()> {
    let broker = InMemoryBroker::with_default_partitions(3);
    let tail = Recorder::default();
    let resume = Recorder::default();

    let mut registry = TopicRegistry::new();
    registry
        .add_fn("A", tail.handler(), SeekPolicy::Latest)
        .add_fn("B", resume.handler(), SeekPolicy::None);
    let runtime = BrokerRuntime::builder(settings(), broker.clone())
        .registry(registry.resolve(&HashMap::<String, String>::new())?)
        .build();
    runtime.connect().await?;

    let sent_a = runtime
        .send("A", OutboundMessage::new(json!({"to": "A"})).with_key("k-a"))
        .await?;
    let sent_b = runtime
        .send("B", OutboundMessage::new(json!({"to": "B"})).with_key("k-b"))
        .await?;
    assert_eq!(sent_a.len(), 1);
    assert_eq!(sent_b.len(), 1);

    wait_until("one record per handler", || tail.len() == 1 && resume.len() == 1).await?;
    sleep(Duration::from_millis(50)).await;

    for (recorder, sent, topic) in [(&tail, &sent_a[0], "A"), (&resume, &sent_b[0], "B")] {
        let seen = recorder.seen.lock();
        assert_eq!(seen.len(), 1, "handler for {} called more than once", topic);
        let envelope = &seen[0];
        assert_eq!(envelope.topic, topic);
        assert_eq!(envelope.partition, sent.partition);
        assert_eq!(envelope.offset, sent.offset);
        assert_eq!(envelope.value, Some(json!({"to": topic})));
    }

    runtime.disconnect().await;
    Ok(())
}

#[tokio::test]
async fn test_start_retries_failed_connects() -> Result<()> {
    let broker = InMemoryBroker::new();
    broker.fail_next_connects(2);

    let runtime = BrokerRuntime::builder(settings(), broker.clone()).build();
    runtime.start().await?;

    wait_until("connected", || runtime.state() == ConnectionState::Connected).await?;
    assert_eq!(runtime.restart_count(), 2);
    assert_eq!(runtime.generation(), 1);
    assert_eq!(broker.connect_count(), 1);

    runtime.disconnect().await;
    Ok(())
}

#[tokio::test]
async fn test_start_rejects_invalid_settings() {
    let mut settings = settings();
    settings.bootstrap_servers.clear();
    let broker = InMemoryBroker::new();
    let runtime = BrokerRuntime::builder(settings, broker.clone()).build();

    let err = runtime.start().await.unwrap_err();
    assert!(err.is_fatal());
    assert_eq!(broker.connect_count(), 0);
}

#[tokio::test]
async fn test_offset_fetch_failure_is_not_fatal() -> Result<()> {
    let broker = InMemoryBroker::new();
    broker.publish("healthy", 0, None, r#"{"n":0}"#)?;
    broker.publish("flaky", 0, None, r#"{"n":0}"#)?;
    broker.fail_offsets_for("flaky");

    let recorder = Recorder::default();
    let mut registry = TopicRegistry::new();
    registry
        .add_fn("healthy", recorder.handler(), SeekPolicy::Earliest)
        .add_fn("flaky", recorder.handler(), SeekPolicy::Earliest);

    let runtime = BrokerRuntime::builder(settings(), broker.clone())
        .registry(registry.resolve(&HashMap::<String, String>::new())?)
        .build();
    runtime.connect().await?;

    let snapshot = runtime.offset_snapshot();
    assert!(snapshot.contains("healthy"));
    assert!(!snapshot.contains("flaky"));

    // unseekable topic starts from the default position
    broker.publish("flaky", 0, None, r#"{"n":1}"#)?;
    wait_until("both topics", || recorder.len() == 2).await?;
    assert_eq!(recorder.offsets("healthy"), vec![0]);
    assert_eq!(recorder.offsets("flaky"), vec![1]);

    runtime.disconnect().await;
    Ok(())
}

#[tokio::test]
async fn test_manual_commit_token() -> Result<()> {
    let broker = InMemoryBroker::new();
    let committed = Arc::new(AtomicUsize::new(0));

    let mut registry = TopicRegistry::new();
    let count = Arc::clone(&committed);
    registry.add_fn(
        "ledger",
        move |_envelope: Envelope, mut ctx: DispatchContext| {
            let count = Arc::clone(&count);
            async move {
                let token = ctx
                    .commit
                    .take()
                    .ok_or_else(|| anyhow::anyhow!("no commit token"))?;
                token.commit().await?;
                count.fetch_add(1, Ordering::SeqCst);
                Ok::<_, anyhow::Error>(())
            }
        },
        SeekPolicy::None,
    );

    let settings = KafkaSettings::builder()
        .group_id(GROUP)
        .postfix("")
        .startup_delay(Duration::ZERO)
        .poll_max_wait(Duration::from_millis(20))
        .payload_format(PayloadFormat::Json)
        .auto_commit(false)
        .build();
    let runtime = BrokerRuntime::builder(settings, broker.clone())
        .registry(registry.resolve(&HashMap::<String, String>::new())?)
        .build();
    runtime.connect().await?;

    broker.publish("ledger", 0, None, r#"{"entry":1}"#)?;
    wait_until("manual commit", || committed.load(Ordering::SeqCst) == 1).await?;
    assert_eq!(broker.committed(GROUP, "ledger", 0), Some(1));
    assert_eq!(runtime.restart_count(), 0);

    runtime.disconnect().await;
    Ok(())
}

#[tokio::test]
async fn test_auto_commit_hands_out_no_token() -> Result<()> {
    let broker = InMemoryBroker::new();
    let tokens = Arc::new(Mutex::new(Vec::new()));

    let mut registry = TopicRegistry::new();
    let seen = Arc::clone(&tokens);
    registry.add_fn(
        "ledger",
        move |_envelope: Envelope, ctx: DispatchContext| {
            seen.lock().push(ctx.commit.is_some());
            futures::future::ready(Ok(()))
        },
        SeekPolicy::None,
    );

    let runtime = BrokerRuntime::builder(settings(), broker.clone())
        .registry(registry.resolve(&HashMap::<String, String>::new())?)
        .build();
    runtime.connect().await?;

    broker.publish("ledger", 0, None, r#"{"entry":1}"#)?;
    broker.publish("ledger", 0, None, r#"{"entry":2}"#)?;
    wait_until("auto commit", || broker.committed(GROUP, "ledger", 0) == Some(2)).await?;
    assert_eq!(*tokens.lock(), vec![false, false]);

    runtime.disconnect().await;
    Ok(())
}

/// Context shared with the forwarding handler
#[derive(Default)]
struct Forwarder {
    runtime: Mutex<Option<BrokerRuntime>>,
}

#[tokio::test]
async fn test_handler_forwards_through_producer() -> Result<()> {
    let broker = InMemoryBroker::new();
    let forwarder = Arc::new(Forwarder::default());

    let mut registry = TopicRegistry::new();
    registry.add(
        "inbound",
        |ctx: Arc<Forwarder>, envelope: Envelope, _dispatch: DispatchContext| async move {
            let runtime = ctx
                .runtime
                .lock()
                .clone()
                .ok_or_else(|| anyhow::anyhow!("runtime not wired"))?;
            let value = envelope.value.unwrap_or_default();
            runtime
                .send("outbound", OutboundMessage::new(value).with_key("fwd"))
                .await?;
            Ok::<_, anyhow::Error>(())
        },
        Arc::clone(&forwarder),
        SeekPolicy::None,
    );

    let runtime = BrokerRuntime::builder(settings(), broker.clone())
        .registry(registry.resolve(&HashMap::<String, String>::new())?)
        .build();
    *forwarder.runtime.lock() = Some(runtime.clone());
    runtime.connect().await?;

    broker.publish("inbound", 0, None, r#"{"order":9}"#)?;
    wait_until("forwarded record", || {
        broker
            .watermarks("outbound")
            .first()
            .is_some_and(|w| w.high == 1)
    })
    .await?;

    runtime.disconnect().await;
    Ok(())
}

#[tokio::test]
async fn test_disconnect_is_idempotent() -> Result<()> {
    let broker = InMemoryBroker::new();
    let runtime = BrokerRuntime::builder(settings(), broker.clone()).build();
    runtime.start().await?;
    wait_until("connected", || runtime.state() == ConnectionState::Connected).await?;

    runtime.disconnect().await;
    runtime.disconnect().await;

    assert_eq!(runtime.state(), ConnectionState::Stopped);
    assert_eq!(broker.open_sessions(), 0);
    let err = runtime
        .send("anything", OutboundMessage::text("late"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Stopped));

    runtime.request_restart(RestartReason::Manual);
    sleep(Duration::from_millis(50)).await;
    assert_eq!(broker.connect_count(), 1);
    Ok(())
}

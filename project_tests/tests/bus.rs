use std::sync::Arc;
use std::time::Duration;

use lib_sensornet::bus::BusEndpoint;
use lib_sensornet::core::{Metric, RetentionBuffer};
use lib_sensornet::ingestors::{MqttSubscription, SubscriptionConfig};
use lib_sensornet::monitors::{Liveness, LivenessProber, ProbeConfig};
use project_tests::{payload, Dashboard, FakeBroker};
use tokio::sync::broadcast;

const TOPIC: &str = "Enviromental Sensors Network";
const WAIT: Duration = Duration::from_secs(5);

async fn wait_for_len(buffer: &RetentionBuffer, len: usize) -> bool {
    tokio::time::timeout(WAIT, async {
        while buffer.len() < len {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .is_ok()
}

fn subscription_config(endpoint: BusEndpoint) -> SubscriptionConfig {
    let mut config = SubscriptionConfig::new(endpoint, TOPIC, "dashboard-test");
    config.reconnect_base = Duration::from_millis(20);
    config.reconnect_max = Duration::from_millis(200);
    config
}

#[tokio::test]
async fn subscription_feeds_buffers_and_ignores_other_topics() {
    let broker = FakeBroker::start().await.unwrap();
    let dashboard = Dashboard::new("A1", 100, 50, 150.0);
    let subscription = MqttSubscription::new(subscription_config(broker.endpoint()));
    let status = subscription.status();
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let task = tokio::spawn(subscription.run(Arc::clone(&dashboard.gateway), shutdown_rx));

    assert!(broker.wait_for_subscribes(1, WAIT).await, "never subscribed");
    assert!(status.is_connected());

    broker.publish(TOPIC, &payload("A1", &[(Metric::TempC, 21.0)]));
    broker.publish("TimeNow", b"{\"ID\":\"clock\"}");
    broker.publish(TOPIC, b"not json at all");
    broker.publish(TOPIC, &payload("B2", &[(Metric::CoPpm, 0.5)]));

    assert!(wait_for_len(&dashboard.log, 2).await);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let log: Vec<String> = dashboard.log.snapshot().iter().map(|r| r.origin_id.clone()).collect();
    assert_eq!(log, vec!["A1", "B2"]);
    assert_eq!(dashboard.graph.len(), 1);
    assert_eq!(dashboard.gateway.stats().received, 3);

    shutdown_tx.send(()).unwrap();
    tokio::time::timeout(WAIT, task).await.unwrap().unwrap();
    assert!(!status.is_connected());
}

#[tokio::test]
async fn subscription_resubscribes_after_the_broker_drops_it() {
    let broker = FakeBroker::start().await.unwrap();
    let dashboard = Dashboard::new("A1", 100, 50, 150.0);
    let subscription = MqttSubscription::new(subscription_config(broker.endpoint()));
    let status = subscription.status();
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let task = tokio::spawn(subscription.run(Arc::clone(&dashboard.gateway), shutdown_rx));

    assert!(broker.wait_for_subscribes(1, WAIT).await);
    broker.disconnect_all();
    assert!(broker.wait_for_subscribes(2, WAIT).await, "no re-subscribe after reconnect");
    assert!(broker.connects() >= 2);

    broker.publish(TOPIC, &payload("A1", &[(Metric::TempC, 19.0)]));
    assert!(wait_for_len(&dashboard.graph, 1).await);

    let state = status.state();
    assert!(state.connects >= 2);
    assert!(state.last_error.is_some());

    shutdown_tx.send(()).unwrap();
    tokio::time::timeout(WAIT, task).await.unwrap().unwrap();
}

#[tokio::test]
async fn prober_follows_the_bus_independently_of_the_subscription() {
    let broker = FakeBroker::start().await.unwrap();
    let prober = LivenessProber::new(ProbeConfig::new(broker.endpoint(), "dashboard-test"));
    assert_eq!(prober.tick().await, Liveness::Up);
    assert_eq!(prober.tick().await, Liveness::Up);
    // Each probe is its own connection, closed afterwards.
    assert_eq!(broker.connects(), 2);
    assert_eq!(broker.subscribes(), 0);

    let closed = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let mut config = ProbeConfig::new(BusEndpoint::new("127.0.0.1", closed), "dashboard-test");
    config.timeout = Duration::from_millis(500);
    let down = LivenessProber::new(config);
    assert_eq!(down.tick().await, Liveness::Down);
    assert_eq!(down.report().consecutive_failures, 1);
}

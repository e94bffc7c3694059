use lib_sensornet::ingestors::{IngestionGateway, MqttSubscription};
use std::sync::Arc;
use tokio::sync::broadcast;

pub async fn run(
    subscription: MqttSubscription,
    gateway: Arc<IngestionGateway>,
    shutdown: broadcast::Receiver<()>,
) {
    subscription.run(Arc::clone(&gateway), shutdown).await;

    let stats = gateway.stats();
    log::info!(
        "Upstream stopped. received={} stored={} decode_failures={} rejections={}",
        stats.received,
        stats.stored,
        stats.decode_failures,
        stats.rejections
    );
}

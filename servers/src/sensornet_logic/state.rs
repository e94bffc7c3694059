use crate::sensornet_logic::config::Settings;
use lib_sensornet::core::{AdmissionPolicy, BufferStats, RetentionBuffer, SnapshotReader};
use lib_sensornet::ingestors::{BufferRoute, GatewayStats, IngestionGateway, SubscriptionState, SubscriptionStatus};
use lib_sensornet::monitors::{LivenessProber, LivenessReport};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;

pub const GRAPH_BUFFER: &str = "graph";
pub const LOG_BUFFER: &str = "log";

/// Everything the HTTP handlers read. Cloning shares the same buffers.
#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<IngestionGateway>,
    pub graph: SnapshotReader,
    pub log: SnapshotReader,
    pub subscription: Arc<SubscriptionStatus>,
    pub prober: Arc<LivenessProber>,
    pub target_id: Arc<str>,
    pub export_file_name: Arc<str>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub target_id: String,
    pub liveness: LivenessReport,
    pub subscription: SubscriptionState,
    pub gateway: GatewayStats,
    pub buffers: Vec<BufferStats>,
}

impl AppState {
    pub fn new(settings: &Settings, subscription: Arc<SubscriptionStatus>) -> Self {
        // Charts: home sensor only, glitches filtered out.
        let graph = Arc::new(RetentionBuffer::new(GRAPH_BUFFER, settings.graph_capacity));
        // Traffic log: every node, raw.
        let log = Arc::new(RetentionBuffer::new(LOG_BUFFER, settings.log_capacity));

        let gateway = Arc::new(IngestionGateway::new(vec![
            BufferRoute::new(
                AdmissionPolicy::PlausibilityScoped {
                    target: Some(settings.target_id.clone()),
                    bounds: settings.plausibility.clone(),
                },
                Arc::clone(&graph),
            ),
            BufferRoute::new(AdmissionPolicy::Unconditional, Arc::clone(&log)),
        ]));

        Self {
            gateway,
            graph: SnapshotReader::new(graph),
            log: SnapshotReader::new(log),
            subscription,
            prober: Arc::new(LivenessProber::new(settings.probe())),
            target_id: Arc::from(settings.target_id.as_str()),
            export_file_name: Arc::from(settings.export_file_name.as_str()),
        }
    }

    pub fn status(&self) -> StatusReport {
        StatusReport {
            target_id: self.target_id.to_string(),
            liveness: self.prober.report(),
            subscription: self.subscription.state(),
            gateway: self.gateway.stats(),
            buffers: vec![self.graph.buffer().stats(), self.log.buffer().stats()],
        }
    }

    /// Change receivers for every buffer, keyed by buffer name.
    pub fn changes(&self) -> Vec<(&'static str, watch::Receiver<u64>)> {
        vec![
            (GRAPH_BUFFER, self.graph.buffer().subscribe_changes()),
            (LOG_BUFFER, self.log.buffer().subscribe_changes()),
        ]
    }
}

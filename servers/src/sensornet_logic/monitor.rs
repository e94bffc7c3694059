use lib_sensornet::monitors::LivenessProber;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};

/// Ticks the prober every `every` until shutdown. A tick still in flight at
/// shutdown is abandoned; its probe connection is dropped with it.
pub async fn run(prober: Arc<LivenessProber>, every: Duration, mut shutdown: broadcast::Receiver<()>) {
    let mut check_interval = interval(every);
    check_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    log::info!("Probing bus {} every {:?}", prober.endpoint(), every);

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                log::info!("Monitor service received shutdown signal.");
                break;
            }
            _ = check_interval.tick() => {
                tokio::select! {
                    _ = shutdown.recv() => {
                        log::info!("Monitor service received shutdown signal.");
                        break;
                    }
                    _ = prober.tick() => {}
                }
            }
        }
    }
}

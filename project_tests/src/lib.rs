//! Shared fixtures for the workspace integration tests: wire payload builders,
//! a ready-made dashboard routing setup and a minimal in-process MQTT broker.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use lib_sensornet::bus::BusEndpoint;
use lib_sensornet::core::{AdmissionPolicy, Bounds, Metric, PlausibilityBounds, RetentionBuffer};
use lib_sensornet::ingestors::{BufferRoute, IngestionGateway};
use serde_json::{Map, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};

/// JSON payload with an `ID` and the given metrics.
pub fn payload(origin: &str, metrics: &[(Metric, f64)]) -> Vec<u8> {
    let mut object = Map::new();
    object.insert("ID".to_string(), Value::from(origin));
    for (metric, value) in metrics {
        object.insert(metric.wire_name().to_string(), Value::from(*value));
    }
    Value::Object(object).to_string().into_bytes()
}

/// The dashboard's two buffers behind one gateway.
pub struct Dashboard {
    pub gateway: Arc<IngestionGateway>,
    pub graph: Arc<RetentionBuffer>,
    pub log: Arc<RetentionBuffer>,
}

impl Dashboard {
    /// Graph buffer keeps `target` with `Temp_C < temp_max`; log keeps everything.
    pub fn new(target: &str, graph_capacity: usize, log_capacity: usize, temp_max: f64) -> Self {
        let graph = Arc::new(RetentionBuffer::new("graph", graph_capacity));
        let log = Arc::new(RetentionBuffer::new("log", log_capacity));
        let gateway = Arc::new(IngestionGateway::new(vec![
            BufferRoute::new(
                AdmissionPolicy::PlausibilityScoped {
                    target: Some(target.to_string()),
                    bounds: PlausibilityBounds::new().with(Metric::TempC, Bounds::below(temp_max)),
                },
                Arc::clone(&graph),
            ),
            BufferRoute::new(AdmissionPolicy::Unconditional, Arc::clone(&log)),
        ]));
        Self { gateway, graph, log }
    }
}

/// # Fake Broker
///
/// Speaks just enough MQTT 3.1.1 for one client library: accepts CONNECT,
/// SUBSCRIBE, PINGREQ and DISCONNECT, and pushes QoS 0 publishes to every
/// subscribed session. Topic filters are ignored.
pub struct FakeBroker {
    port: u16,
    publishes: broadcast::Sender<(String, Vec<u8>)>,
    kick: broadcast::Sender<()>,
    connects: Arc<AtomicUsize>,
    subscribes: Arc<AtomicUsize>,
}

struct RawPacket {
    header: u8,
    body: Vec<u8>,
}

impl FakeBroker {
    /// Binds an ephemeral local port and starts accepting.
    pub async fn start() -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        let (publishes, _) = broadcast::channel(64);
        let (kick, _) = broadcast::channel(4);
        let broker = Self {
            port,
            publishes,
            kick,
            connects: Arc::new(AtomicUsize::new(0)),
            subscribes: Arc::new(AtomicUsize::new(0)),
        };

        let publishes = broker.publishes.clone();
        let kick = broker.kick.clone();
        let connects = Arc::clone(&broker.connects);
        let subscribes = Arc::clone(&broker.subscribes);
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let session = Session {
                    publishes: publishes.subscribe(),
                    kick: kick.subscribe(),
                    connects: Arc::clone(&connects),
                    subscribes: Arc::clone(&subscribes),
                };
                tokio::spawn(session.run(socket));
            }
        });

        Ok(broker)
    }

    /// Where clients should connect.
    pub fn endpoint(&self) -> BusEndpoint {
        BusEndpoint::new("127.0.0.1", self.port)
    }

    /// CONNECT packets answered so far.
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// SUBSCRIBE packets answered so far.
    pub fn subscribes(&self) -> usize {
        self.subscribes.load(Ordering::SeqCst)
    }

    /// Waits until at least `count` SUBSCRIBE packets have been answered.
    pub async fn wait_for_subscribes(&self, count: usize, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, async {
            while self.subscribes() < count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .is_ok()
    }

    /// Sends a QoS 0 publish to every subscribed session.
    pub fn publish(&self, topic: &str, payload: &[u8]) {
        let _ = self.publishes.send((topic.to_string(), payload.to_vec()));
    }

    /// Drops every open session.
    pub fn disconnect_all(&self) {
        let _ = self.kick.send(());
    }
}

struct Session {
    publishes: broadcast::Receiver<(String, Vec<u8>)>,
    kick: broadcast::Receiver<()>,
    connects: Arc<AtomicUsize>,
    subscribes: Arc<AtomicUsize>,
}

impl Session {
    async fn run(mut self, socket: tokio::net::TcpStream) {
        let (reader, mut writer) = socket.into_split();
        let (packet_tx, mut packet_rx) = mpsc::channel::<RawPacket>(16);
        tokio::spawn(read_packets(reader, packet_tx));

        let mut is_subscribed = false;
        loop {
            tokio::select! {
                _ = self.kick.recv() => return,
                packet = packet_rx.recv() => {
                    let Some(packet) = packet else { return };
                    let reply: Option<Vec<u8>> = match packet.header & 0xF0 {
                        0x10 => {
                            self.connects.fetch_add(1, Ordering::SeqCst);
                            Some(vec![0x20, 0x02, 0x00, 0x00])
                        }
                        0x80 if packet.body.len() >= 2 => {
                            is_subscribed = true;
                            self.subscribes.fetch_add(1, Ordering::SeqCst);
                            Some(vec![0x90, 0x03, packet.body[0], packet.body[1], 0x00])
                        }
                        0xC0 => Some(vec![0xD0, 0x00]),
                        0xE0 => return,
                        _ => None,
                    };
                    if let Some(bytes) = reply {
                        if writer.write_all(&bytes).await.is_err() {
                            return;
                        }
                    }
                }
                published = self.publishes.recv() => {
                    let Ok((topic, payload)) = published else { continue };
                    if is_subscribed && writer.write_all(&encode_publish(&topic, &payload)).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

async fn read_packets(mut reader: OwnedReadHalf, packets: mpsc::Sender<RawPacket>) {
    loop {
        let mut header = [0u8; 1];
        if reader.read_exact(&mut header).await.is_err() {
            return;
        }

        let mut remaining = 0usize;
        let mut shift = 0;
        loop {
            let mut byte = [0u8; 1];
            if reader.read_exact(&mut byte).await.is_err() || shift > 21 {
                return;
            }
            remaining |= ((byte[0] & 0x7F) as usize) << shift;
            if byte[0] & 0x80 == 0 {
                break;
            }
            shift += 7;
        }

        let mut body = vec![0u8; remaining];
        if reader.read_exact(&mut body).await.is_err() {
            return;
        }
        if packets.send(RawPacket { header: header[0], body }).await.is_err() {
            return;
        }
    }
}

fn encode_publish(topic: &str, payload: &[u8]) -> Vec<u8> {
    let mut variable = Vec::with_capacity(2 + topic.len() + payload.len());
    variable.extend_from_slice(&(topic.len() as u16).to_be_bytes());
    variable.extend_from_slice(topic.as_bytes());
    variable.extend_from_slice(payload);

    let mut packet = vec![0x30];
    let mut remaining = variable.len();
    loop {
        let mut byte = (remaining % 128) as u8;
        remaining /= 128;
        if remaining > 0 {
            byte |= 0x80;
        }
        packet.push(byte);
        if remaining == 0 {
            break;
        }
    }
    packet.extend_from_slice(&variable);
    packet
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_encoding_uses_a_varint_length() {
        let short = encode_publish("t", b"x");
        assert_eq!(short, vec![0x30, 0x04, 0x00, 0x01, b't', b'x']);

        let long = encode_publish("t", &[0u8; 200]);
        assert_eq!(&long[..3], &[0x30, 0xCB, 0x01]);
    }

    #[test]
    fn payload_builder_emits_wire_names() {
        let bytes = payload("A1", &[(Metric::TempC, 21.5)]);
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["ID"], "A1");
        assert_eq!(value["Temp_C"], 21.5);
    }
}

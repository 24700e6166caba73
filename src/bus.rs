//! Site bus client
//!
//! Topic-filtered pub/sub over the local broker. Frames are
//! length-delimited (u32 big-endian) bincode envelopes. Delivery is
//! best-effort; within a topic, frames from a single publisher arrive
//! in publish order.

use crate::error::{GwctlError, GwctlResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

/// Upper bound on a single frame; anything larger is a protocol error
const MAX_FRAME_LEN: u32 = 1024 * 1024;

/// Reconnect back-off cap
const RECONNECT_MAX: Duration = Duration::from_secs(30);

/// A published message with its topic
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub topic: String,
    pub sender: String,
    pub payload: Vec<u8>,
}

/// Wire frames exchanged with the broker
#[derive(Debug, Clone, Serialize, Deserialize)]
enum Frame {
    /// Register interest in a topic
    Subscribe { topic: String },
    /// A published envelope, in either direction
    Publish(Envelope),
}

/// Write one length-delimited frame
async fn write_frame(stream: &mut OwnedWriteHalf, frame: &Frame) -> GwctlResult<()> {
    let body = bincode::serialize(frame)?;
    if body.len() as u32 > MAX_FRAME_LEN {
        return Err(GwctlError::InvalidParameter("Frame too large".to_string()));
    }
    stream.write_all(&(body.len() as u32).to_be_bytes()).await?;
    stream.write_all(&body).await?;
    Ok(())
}

/// Read one length-delimited frame
async fn read_frame(stream: &mut OwnedReadHalf) -> GwctlResult<Frame> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_LEN {
        return Err(GwctlError::ParseError(format!("Frame length {} exceeds limit", len)));
    }
    let mut body = vec![0u8; len as usize];
    stream.read_exact(&mut body).await?;
    Ok(bincode::deserialize(&body)?)
}

type TopicSinks = Arc<Mutex<HashMap<String, Vec<mpsc::UnboundedSender<Envelope>>>>>;

/// Client handle onto the site bus
///
/// Cheap to clone; all clones share one broker connection.
#[derive(Clone)]
pub struct BusClient {
    sender_name: String,
    outgoing: mpsc::UnboundedSender<Frame>,
    sinks: TopicSinks,
    connected: Arc<RwLock<bool>>,
}

impl BusClient {
    /// Connect to the broker and spawn the IO tasks
    ///
    /// `sender_name` identifies this publisher in every envelope.
    pub async fn connect(addr: &str, sender_name: &str) -> GwctlResult<Self> {
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let client = Self {
            sender_name: sender_name.to_string(),
            outgoing: outgoing_tx,
            sinks: Arc::new(Mutex::new(HashMap::new())),
            connected: Arc::new(RwLock::new(false)),
        };

        let addr = addr.to_string();
        let sinks = client.sinks.clone();
        let connected = client.connected.clone();
        tokio::spawn(async move {
            connection_loop(addr, outgoing_rx, sinks, connected).await;
        });

        Ok(client)
    }

    /// Whether the broker connection is currently up
    pub async fn is_connected(&self) -> bool {
        *self.connected.read().await
    }

    /// Subscribe to a topic; every matching envelope is delivered on the
    /// returned channel
    ///
    /// The registration is pushed to the broker immediately and
    /// replayed on every reconnect.
    pub async fn subscribe(&self, topic: &str) -> mpsc::UnboundedReceiver<Envelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut sinks = self.sinks.lock().await;
        sinks.entry(topic.to_string()).or_default().push(tx);
        let _ = self.outgoing.send(Frame::Subscribe { topic: topic.to_string() });
        rx
    }

    /// Publish a serializable payload on a topic, fire-and-forget
    pub fn publish<T: Serialize>(&self, topic: &str, payload: &T) -> GwctlResult<()> {
        let envelope = Envelope {
            topic: topic.to_string(),
            sender: self.sender_name.clone(),
            payload: bincode::serialize(payload)?,
        };
        self.outgoing
            .send(Frame::Publish(envelope))
            .map_err(|_| GwctlError::ServiceError("Bus connection closed".to_string()))
    }
}

/// Decode an envelope payload into its typed event
pub fn decode_payload<T: DeserializeOwned>(envelope: &Envelope) -> GwctlResult<T> {
    Ok(bincode::deserialize(&envelope.payload)?)
}

/// Outer loop: connect, run, back off, reconnect
async fn connection_loop(
    addr: String,
    mut outgoing_rx: mpsc::UnboundedReceiver<Frame>,
    sinks: TopicSinks,
    connected: Arc<RwLock<bool>>,
) {
    let mut backoff = Duration::from_secs(1);

    loop {
        match TcpStream::connect(&addr).await {
            Ok(stream) => {
                info!("Connected to broker at {}", addr);
                *connected.write().await = true;
                backoff = Duration::from_secs(1);

                if let Err(e) = run_connection(stream, &mut outgoing_rx, &sinks).await {
                    warn!("Broker connection lost: {}", e);
                }
                *connected.write().await = false;
            }
            Err(e) => {
                debug!("Broker connect to {} failed: {}", addr, e);
            }
        }

        sleep(backoff).await;
        backoff = (backoff * 2).min(RECONNECT_MAX);
    }
}

/// Serve one live connection until it drops
///
/// Framed reads live in their own task: read_exact is not safe to
/// cancel mid-frame inside a select loop.
async fn run_connection(
    stream: TcpStream,
    outgoing_rx: &mut mpsc::UnboundedReceiver<Frame>,
    sinks: &TopicSinks,
) -> GwctlResult<()> {
    let (mut read_half, mut write_half) = stream.into_split();

    // Re-register every subscription on the fresh connection
    {
        let sinks = sinks.lock().await;
        for topic in sinks.keys() {
            write_frame(&mut write_half, &Frame::Subscribe { topic: topic.clone() }).await?;
        }
    }

    let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel();
    let reader = tokio::spawn(async move {
        loop {
            match read_frame(&mut read_half).await {
                Ok(frame) => {
                    if inbound_tx.send(frame).is_err() {
                        return;
                    }
                }
                Err(_) => return,
            }
        }
    });

    let result = loop {
        tokio::select! {
            outbound = outgoing_rx.recv() => {
                match outbound {
                    Some(frame) => {
                        if let Err(e) = write_frame(&mut write_half, &frame).await {
                            break Err(e);
                        }
                    }
                    None => {
                        break Err(GwctlError::ServiceError("Bus client dropped".to_string()));
                    }
                }
            }
            inbound = inbound_rx.recv() => {
                match inbound {
                    Some(Frame::Publish(envelope)) => {
                        dispatch(sinks, envelope).await;
                    }
                    Some(Frame::Subscribe { topic }) => {
                        debug!("Ignoring subscribe frame for {} from broker", topic);
                    }
                    None => {
                        break Err(GwctlError::ServiceError("Broker closed the connection".to_string()));
                    }
                }
            }
        }
    };
    reader.abort();
    result
}

/// Fan an inbound envelope out to local subscribers, dropping dead sinks
async fn dispatch(sinks: &TopicSinks, envelope: Envelope) {
    let mut sinks = sinks.lock().await;
    if let Some(subscribers) = sinks.get_mut(&envelope.topic) {
        subscribers.retain(|tx| tx.send(envelope.clone()).is_ok());
    }
}

/// Minimal topic forwarder
///
/// The production broker runs as its own daemon; this in-process
/// implementation backs single-node development and the test suite.
pub struct Broker {
    listener: TcpListener,
}

impl Broker {
    /// Bind the broker listener
    pub async fn bind(addr: &str) -> GwctlResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener })
    }

    /// Address the broker is listening on
    pub fn local_addr(&self) -> GwctlResult<std::net::SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept and forward until the task is dropped
    pub async fn run(self) {
        // conn id -> (topics, sender)
        let peers: Arc<Mutex<HashMap<u64, (Vec<String>, mpsc::UnboundedSender<Envelope>)>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let mut next_id: u64 = 0;

        loop {
            let (stream, peer_addr) = match self.listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("Broker accept failed: {}", e);
                    continue;
                }
            };
            debug!("Broker accepted {}", peer_addr);

            let id = next_id;
            next_id += 1;

            let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();
            peers.lock().await.insert(id, (Vec::new(), tx));

            let peers = peers.clone();
            tokio::spawn(async move {
                let (mut read_half, mut write_half) = stream.into_split();

                // Writer drains the forward queue on its own task so
                // inbound framed reads are never cancelled mid-frame
                let writer = tokio::spawn(async move {
                    while let Some(envelope) = rx.recv().await {
                        if write_frame(&mut write_half, &Frame::Publish(envelope)).await.is_err() {
                            return;
                        }
                    }
                });

                loop {
                    match read_frame(&mut read_half).await {
                        Ok(Frame::Subscribe { topic }) => {
                            let mut peers = peers.lock().await;
                            if let Some((topics, _)) = peers.get_mut(&id) {
                                if !topics.contains(&topic) {
                                    topics.push(topic);
                                }
                            }
                        }
                        Ok(Frame::Publish(envelope)) => {
                            let peers = peers.lock().await;
                            for (peer_id, (topics, tx)) in peers.iter() {
                                if *peer_id != id && topics.contains(&envelope.topic) {
                                    let _ = tx.send(envelope.clone());
                                }
                            }
                        }
                        Err(_) => break,
                    }
                }
                writer.abort();
                peers.lock().await.remove(&id);
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{topics, EventPing};
    use chrono::Utc;

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let broker = Broker::bind("127.0.0.1:0").await.unwrap();
        let addr = broker.local_addr().unwrap().to_string();
        tokio::spawn(broker.run());

        let publisher = BusClient::connect(&addr, "test-pub").await.unwrap();
        let subscriber = BusClient::connect(&addr, "test-sub").await.unwrap();
        let mut rx = subscriber.subscribe(topics::PING).await;

        // Give both clients time to establish and resubscribe
        sleep(Duration::from_millis(200)).await;

        let ping = EventPing { timestamp: Utc::now(), sender: "test-pub".to_string() };
        publisher.publish(topics::PING, &ping).unwrap();

        let envelope = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out")
            .expect("channel closed");
        assert_eq!(envelope.topic, topics::PING);
        assert_eq!(envelope.sender, "test-pub");

        let decoded: EventPing = decode_payload(&envelope).unwrap();
        assert_eq!(decoded.sender, "test-pub");
    }

    #[tokio::test]
    async fn test_topic_filtering() {
        let broker = Broker::bind("127.0.0.1:0").await.unwrap();
        let addr = broker.local_addr().unwrap().to_string();
        tokio::spawn(broker.run());

        let publisher = BusClient::connect(&addr, "pub").await.unwrap();
        let subscriber = BusClient::connect(&addr, "sub").await.unwrap();
        let mut ping_rx = subscriber.subscribe(topics::PING).await;
        let mut error_rx = subscriber.subscribe(topics::ERROR).await;

        sleep(Duration::from_millis(200)).await;

        let ping = EventPing { timestamp: Utc::now(), sender: "pub".to_string() };
        publisher.publish(topics::PING, &ping).unwrap();

        let envelope = tokio::time::timeout(Duration::from_secs(5), ping_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(envelope.topic, topics::PING);

        // Nothing should arrive on the error topic
        let nothing = tokio::time::timeout(Duration::from_millis(200), error_rx.recv()).await;
        assert!(nothing.is_err());
    }
}

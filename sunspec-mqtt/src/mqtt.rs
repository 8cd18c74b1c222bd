use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::{
    mqttbytes::matches as matches_topic, mqttbytes::valid_topic, AsyncClient, Event, EventLoop,
    Incoming, MqttOptions, Publish, QoS, Subscribe, SubscribeFilter,
};
use serde::Serialize;
use tokio::{
    select,
    sync::mpsc::{channel, error::TrySendError, Receiver, Sender},
};
use tracing::{debug, warn};

use crate::{
    paths::Format,
    shutdown::Shutdown,
    sink::{Entry, MemorySink, Sink},
    value::Value,
};

#[derive(Debug)]
pub enum Message {
    Subscribe(Subscribe, Sender<Payload>),
    Publish(Publish),
    Shutdown,
}

#[derive(Clone, Debug)]
pub struct Payload {
    pub topic: String,
    pub bytes: Bytes,
}

pub(crate) fn new(options: MqttOptions, shutdown: Shutdown) -> Connection {
    let (client, event_loop) = AsyncClient::new(options, 32);

    let (tx, rx) = channel(32);
    Connection {
        event_loop,
        router: Router {
            client,
            subscriptions: HashMap::new(),
            tx,
            rx,
            shutdown,
        },
    }
}

/// The MQTT client plus its event loop, which is polled from its own task once running.
pub(crate) struct Connection {
    event_loop: EventLoop,
    router: Router,
}

// Maintain internal subscriptions as well as MQTT subscriptions. Relay all received messages on MQTT subscribed topics
// to internal components who have a matching topic.
//
// Nothing in here awaits the broker: requests are queued with `try_*` and dropped when the client queue is full, and
// relayed messages are dropped for subscribers that are not keeping up.
struct Router {
    subscriptions: HashMap<String, Vec<Sender<Payload>>>,
    tx: Sender<Message>,
    rx: Receiver<Message>,
    client: AsyncClient,
    shutdown: Shutdown,
}

impl Connection {
    pub async fn run(self) -> crate::Result<()> {
        let Connection {
            event_loop,
            mut router,
        } = self;
        let (events_tx, mut events) = channel(32);
        let poller = tokio::spawn(poll(event_loop, events_tx, router.shutdown.clone()));

        let result = loop {
            select! {
                Some(incoming) = events.recv() => router.handle_event(incoming),
                request = router.rx.recv() => {
                    match request {
                        None | Some(Message::Shutdown) => break Ok(()),
                        Some(req) => {
                            if let Err(err) = router.handle_request(req) {
                                break Err(err);
                            }
                        }
                    }
                }
                _ = router.shutdown.recv() => break Ok(()),
            }
        };

        poller.abort();
        result
    }

    /// Create a handle for interacting with the MQTT server such that a pre-provided prefix is transparently added to
    /// all relevant commands which use a topic.
    pub fn prefixed_handle<S: Into<String>>(&self, prefix: S) -> crate::Result<Handle> {
        let prefix = prefix.into();

        if !valid_topic(&prefix) {
            return Err(format!("Prefix {:?} is not a valid topic", prefix).into());
        }

        Ok(Handle {
            prefix,
            tx: self.router.tx.clone(),
        })
    }
}

impl Router {
    fn handle_event(&mut self, incoming: Incoming) {
        match incoming {
            Incoming::Publish(Publish { topic, payload, .. }) => {
                debug!(%topic, ?payload, "publish");
                self.handle_data(topic, payload);
            }
            // Sessions are clean, so every (re)connect starts without subscriptions.
            Incoming::ConnAck(_) => self.resubscribe(),
            _ => {}
        }
    }

    #[tracing::instrument(level = "debug", skip(self), fields(subscriptions = ?self.subscriptions.keys()))]
    fn handle_data(&mut self, topic: String, bytes: Bytes) {
        // Remove subscriptions whose channels are closed, forwarding to the rest.
        self.subscriptions.retain(|filter, channels| {
            if !matches_topic(&topic, filter) {
                return true;
            }
            channels.retain(|channel| {
                let payload = Payload {
                    topic: topic.clone(),
                    bytes: bytes.clone(),
                };
                match channel.try_send(payload) {
                    Ok(()) => true,
                    Err(TrySendError::Full(_)) => {
                        warn!(%topic, "Subscriber is busy, message dropped");
                        true
                    }
                    Err(TrySendError::Closed(_)) => {
                        warn!(?channel, "closed");
                        false
                    }
                }
            });
            !channels.is_empty()
        });
    }

    fn resubscribe(&self) {
        let filters: Vec<_> = self
            .subscriptions
            .keys()
            .map(|filter| SubscribeFilter::new(filter.clone(), QoS::AtLeastOnce))
            .collect();

        if filters.is_empty() {
            return;
        }
        if let Err(error) = self.client.try_subscribe_many(filters) {
            warn!(%error, "MQTT resubscribe dropped");
        }
    }

    fn handle_request(&mut self, request: Message) -> crate::Result<()> {
        match request {
            Message::Publish(Publish {
                topic,
                payload,
                qos,
                retain,
                ..
            }) => {
                let queued = self
                    .client
                    .try_publish(topic.as_str(), qos, retain, payload.to_vec());
                if let Err(error) = queued {
                    warn!(%topic, %error, "MQTT publish dropped");
                }
            }
            Message::Subscribe(Subscribe { filters, .. }, channel) => {
                for filter in &filters {
                    self.subscriptions
                        .entry(filter.path.clone())
                        .or_default()
                        .push(channel.clone());
                }

                // Retried on the next ConnAck if the client queue is full now.
                if let Err(error) = self.client.try_subscribe_many(filters) {
                    warn!(%error, "MQTT subscribe deferred");
                }
            }
            Message::Shutdown => return Err("Shutdown is handled by the caller".into()),
        }
        Ok(())
    }
}

/// Drives the event loop, which also reconnects, and forwards incoming packets to the connection.
async fn poll(mut event_loop: EventLoop, events: Sender<Incoming>, mut shutdown: Shutdown) {
    while !shutdown.is_shutdown() {
        select! {
            event = event_loop.poll() => {
                match event {
                    Ok(Event::Incoming(incoming)) => {
                        if events.send(incoming).await.is_err() {
                            return;
                        }
                    }
                    Ok(Event::Outgoing(_)) => {}
                    Err(error) => {
                        // The event loop reconnects on the next poll.
                        warn!(%error, "MQTT connection error");
                        select! {
                            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                            _ = shutdown.recv() => {}
                        }
                    }
                }
            }
            _ = shutdown.recv() => {}
        }
    }
}

/// Publishes and subscribes beneath a fixed topic prefix.
#[derive(Clone, Debug)]
pub struct Handle {
    prefix: String,
    tx: Sender<Message>,
}

impl Handle {
    pub fn topic(&self, topic: &str) -> String {
        format!("{}/{}", self.prefix, topic.trim_start_matches('/'))
    }

    pub async fn publish<T: AsRef<str>, B: Into<Vec<u8>>>(
        &self,
        topic: T,
        payload: B,
        retain: bool,
    ) -> crate::Result<()> {
        let mut publish = Publish::new(self.topic(topic.as_ref()), QoS::AtLeastOnce, payload);
        publish.retain = retain;
        self.send(Message::Publish(publish)).await
    }

    pub async fn subscribe<T: AsRef<str>>(&self, filter: T) -> crate::Result<Receiver<Payload>> {
        let (tx, rx) = channel(8);
        let filter = SubscribeFilter::new(self.topic(filter.as_ref()), QoS::AtLeastOnce);
        let subscribe = Subscribe::new_many([filter]);
        self.send(Message::Subscribe(subscribe, tx)).await?;
        Ok(rx)
    }

    pub async fn shutdown(&self) -> crate::Result<()> {
        self.send(Message::Shutdown).await
    }

    async fn send(&self, message: Message) -> crate::Result<()> {
        self.tx
            .send(message)
            .await
            .map_err(|_| "MQTT connection closed".into())
    }
}

/// What is published for every path.
#[derive(Serialize)]
pub struct PathPayload<'a> {
    pub value: &'a Value,
    pub text: String,
}

impl<'a> From<&'a Entry> for PathPayload<'a> {
    fn from(entry: &'a Entry) -> Self {
        PathPayload {
            value: &entry.value,
            text: entry.text(),
        }
    }
}

/// Publishes each path as a retained JSON message `{"value": …, "text": …}` under the handle's prefix.
pub struct MqttSink {
    handle: Handle,
    store: MemorySink,
}

impl MqttSink {
    pub fn new(handle: Handle) -> Self {
        Self {
            handle,
            store: MemorySink::new(),
        }
    }

    async fn publish(&self, path: &str) -> crate::Result<()> {
        let payload = match self.store.entry(path) {
            Some(entry) => serde_json::to_vec(&PathPayload::from(entry))?,
            None => return Err(format!("Path {} is not registered", path).into()),
        };
        self.handle.publish(path, payload, true).await
    }
}

#[async_trait]
impl Sink for MqttSink {
    async fn add_path(
        &mut self,
        path: &str,
        initial: Value,
        format: Format,
        writable: bool,
    ) -> crate::Result<()> {
        self.store.insert(path, initial, format, writable);
        self.publish(path).await
    }

    async fn set(&mut self, path: &str, value: Value) -> crate::Result<()> {
        if self.store.update(path, value).is_none() {
            return Err(format!("Path {} is not registered", path).into());
        }
        self.publish(path).await
    }

    fn get(&self, path: &str) -> Option<&Value> {
        self.store.get(path)
    }

    async fn write(&mut self, path: &str, value: Value) -> crate::Result<bool> {
        if self.store.accept(path, value).is_none() {
            return Ok(false);
        }
        self.publish(path).await?;
        Ok(true)
    }
}

#[cfg(test)]
use pretty_assertions::assert_eq;

#[test]
fn handle_topics_are_prefixed() {
    let (tx, _rx) = channel(1);
    let handle = Handle {
        prefix: "venus/pvinverter".to_owned(),
        tx,
    };

    assert_eq!(handle.topic("/Ac/Power"), "venus/pvinverter/Ac/Power");
    assert_eq!(handle.topic("Connected"), "venus/pvinverter/Connected");
}

#[tokio::test]
async fn sink_publishes_retained_json() {
    let (tx, mut rx) = channel(8);
    let mut sink = MqttSink::new(Handle {
        prefix: "pv/20".to_owned(),
        tx,
    });

    sink.add_path("/Ac/Power", Value::Integer(0), Format::Watts, true)
        .await
        .unwrap();
    sink.set("/Ac/Power", Value::Integer(450)).await.unwrap();

    let mut published = vec![];
    while let Ok(Message::Publish(publish)) = rx.try_recv() {
        assert!(publish.retain);
        assert_eq!(publish.topic, "pv/20/Ac/Power");
        published.push(serde_json::from_slice::<serde_json::Value>(&publish.payload).unwrap());
    }

    assert_eq!(
        published,
        vec![
            serde_json::json!({"value": 0, "text": "0W"}),
            serde_json::json!({"value": 450, "text": "450W"}),
        ]
    );
    assert!(sink.set("/Ac/Unknown", Value::Integer(1)).await.is_err());
}

#[tokio::test]
async fn busy_subscribers_do_not_block_the_connection() {
    let (_notify, shutdown) = tokio::sync::broadcast::channel::<()>(1);
    let options = MqttOptions::new("sunspec-mqtt-test", "127.0.0.1", 1883);
    let mut router = new(options, shutdown.into()).router;
    let (tx, mut rx) = channel(1);
    router.subscriptions.insert("pv/20/set/#".to_owned(), vec![tx]);

    for value in ["1", "2", "3"] {
        let bytes = Bytes::from_static(value.as_bytes());
        router.handle_data("pv/20/set/Connected".to_owned(), bytes);
    }

    // the first one is queued, the rest are dropped while the subscriber is busy
    assert_eq!(rx.try_recv().unwrap().bytes, Bytes::from_static(b"1"));
    assert!(rx.try_recv().is_err());
    assert_eq!(router.subscriptions.len(), 1);

    drop(rx);
    router.handle_data("pv/20/set/Connected".to_owned(), Bytes::from_static(b"4"));
    assert!(router.subscriptions.is_empty());
}

#[tokio::test]
async fn publishing_continues_while_broker_is_down() {
    let port = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();

    let (notify, shutdown) = tokio::sync::broadcast::channel::<()>(1);
    let options = MqttOptions::new("sunspec-mqtt-test", "127.0.0.1", port);
    let connection = new(options, shutdown.into());
    let handle = connection.prefixed_handle("pv/20").unwrap();
    let task = tokio::spawn(connection.run());

    // far more than both request queues hold
    for n in 0..200 {
        let publish = handle.publish("Ac/Power", n.to_string(), true);
        tokio::time::timeout(Duration::from_secs(3), publish)
            .await
            .expect("publish blocked while the broker is down")
            .unwrap();
    }

    // and the connection still retries once the broker is back
    let broker = tokio::net::TcpListener::bind(("127.0.0.1", port)).await.unwrap();
    let reconnect = tokio::time::timeout(Duration::from_secs(8), broker.accept()).await;
    assert!(reconnect.is_ok(), "no reconnect attempt");

    handle.shutdown().await.unwrap();
    drop(notify);
    task.await.unwrap().unwrap();
}

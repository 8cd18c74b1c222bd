use rumqttc::{LastWill, MqttOptions, QoS};
use serde::Deserialize;
use std::future::Future;
use tokio::{
    select,
    sync::broadcast,
    sync::mpsc::Receiver,
    time::{Instant, MissedTickBehavior},
};
use tracing::{error, info, warn};

use crate::{
    config::Config,
    cycle::Service,
    mqtt::{self, MqttSink, PathPayload, Payload},
    paths::{self, Format},
    sink::{Entry, Sink},
    sunspec::{DeviceClient, TcpClient},
    value::Value,
};

/// Body of a write to `<service>/set/<path>`.
#[derive(Debug, Deserialize)]
struct WriteRequest {
    value: Value,
}

/// Runs the inverter service until `shutdown` completes or a fatal error occurs.
///
/// Fatal errors (the device cannot be read) are returned; waiting before exit is left to the caller.
pub async fn run<P: AsRef<str>>(
    config: Config,
    prefix: P,
    mut mqtt_options: MqttOptions,
    shutdown: impl Future,
) -> crate::Result<()> {
    let service_topic = format!("{}/pvinverter/{}", prefix.as_ref(), config.inverter.instance);
    info!(service = %service_topic, "Starting up");

    let disconnected = Entry {
        value: Value::Integer(0),
        format: Format::Integer,
        writable: true,
    };
    mqtt_options.set_last_will(LastWill::new(
        format!("{}/Connected", service_topic),
        serde_json::to_vec(&PathPayload::from(&disconnected))?,
        QoS::AtLeastOnce,
        true,
    ));

    let (notify_shutdown, _) = broadcast::channel(1);
    let mqtt_connection = mqtt::new(mqtt_options, notify_shutdown.subscribe().into());
    let handle = mqtt_connection.prefixed_handle(service_topic)?;

    let connection_task = tokio::spawn(mqtt_connection.run());

    let writes = handle.subscribe("set/#").await?;
    let write_prefix = handle.topic("set");

    let paths = paths::default_paths(&config.inverter);
    let mut service = Service::new(config, paths, TcpClient, MqttSink::new(handle.clone()));

    let mut ret = Ok(());

    select! {
        res = serve(&mut service, writes, &write_prefix) => {
            if let Err(err) = res {
                error!(cause = %err, "service error");
                ret = Err(err)
            }
        }

        _ = shutdown => {
            info!("shutting down");
        }
    }

    if handle.shutdown().await.is_err() {
        warn!("MQTT connection already closed");
    }
    drop(notify_shutdown);

    match connection_task.await {
        Ok(Err(err)) => warn!(cause = %err, "MQTT connection error"),
        Err(err) => warn!(cause = %err, "MQTT connection task failed"),
        Ok(Ok(())) => {}
    }

    ret
}

/// Registers the service, then runs one update per tick, the first one a full period after
/// registration. Cycles never overlap: a tick is only taken after the previous update finished.
pub(crate) async fn serve<C: DeviceClient, S: Sink>(
    service: &mut Service<C, S>,
    mut writes: Receiver<Payload>,
    write_prefix: &str,
) -> crate::Result<()> {
    service.register().await?;

    let period = service.config().interval;
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        select! {
            _ = interval.tick() => {
                service.update().await?;
            }
            Some(payload) = writes.recv() => {
                handle_write(service.sink_mut(), write_prefix, payload).await;
            }
        }
    }
}

async fn handle_write<S: Sink>(sink: &mut S, write_prefix: &str, payload: Payload) {
    let Some(path) = payload.topic.strip_prefix(write_prefix) else {
        warn!(topic = %payload.topic, "Write outside of the service");
        return;
    };

    match serde_json::from_slice::<WriteRequest>(&payload.bytes) {
        Ok(WriteRequest { value }) => {
            if let Err(error) = sink.write(path, value).await {
                warn!(path, %error, "Could not apply write");
            }
        }
        Err(error) => warn!(path, %error, "Invalid write payload"),
    }
}

#[cfg(test)]
use pretty_assertions::assert_eq;

#[cfg(test)]
use crate::{cycle::fixtures, sink::MemorySink};

#[tokio::test]
async fn writes_are_accepted_and_stored() {
    let mut sink = MemorySink::new();
    sink.add_path("/Connected", Value::Integer(1), Format::Integer, true)
        .await
        .unwrap();

    let write = |topic: &str, body: &'static str| Payload {
        topic: topic.to_owned(),
        bytes: bytes::Bytes::from_static(body.as_bytes()),
    };

    handle_write(&mut sink, "pv/20/set", write("pv/20/set/Connected", r#"{"value": 0}"#)).await;
    assert_eq!(sink.get("/Connected"), Some(&Value::Integer(0)));

    // garbage is logged and dropped
    handle_write(&mut sink, "pv/20/set", write("pv/20/set/Connected", "nope")).await;
    handle_write(&mut sink, "pv/20/set", write("other/Connected", r#"{"value": 1}"#)).await;
    assert_eq!(sink.get("/Connected"), Some(&Value::Integer(0)));
}

#[tokio::test(start_paused = true)]
async fn first_update_waits_one_period() {
    let config = fixtures::config();
    let paths = paths::default_paths(&config.inverter);
    let client = fixtures::ScriptedClient::new(vec![Ok(fixtures::inverter("4", "0"))]);
    let reads = client.reads();
    let mut service = Service::new(config, paths, client, MemorySink::new());
    let (_tx, writes) = tokio::sync::mpsc::channel(1);

    let served = tokio::time::timeout(
        std::time::Duration::from_millis(1500),
        serve(&mut service, writes, "pv/20/set"),
    )
    .await;

    assert!(served.is_err(), "serve keeps running");
    // registration at start, then a single update one second later
    assert_eq!(reads.load(std::sync::atomic::Ordering::SeqCst), 2);
    assert_eq!(service.sink().get(paths::UPDATE_INDEX), Some(&Value::Integer(1)));
}

#[tokio::test(start_paused = true)]
async fn serve_stops_when_device_is_lost() {
    let config = fixtures::config();
    let paths = paths::default_paths(&config.inverter);
    let client = fixtures::ScriptedClient::new(vec![
        Ok(fixtures::inverter("4", "0")),
        Ok(fixtures::inverter("4", "0")),
        Ok(vec![]),
    ]);
    let mut service = Service::new(config, paths, client, MemorySink::new());
    let (_tx, writes) = tokio::sync::mpsc::channel(1);

    let result = serve(&mut service, writes, "pv/20/set").await;

    assert!(matches!(result, Err(crate::Error::NoDevice)));
    // one good cycle was published before the device went away
    assert_eq!(service.sink().get(paths::UPDATE_INDEX), Some(&Value::Integer(1)));
}

#[tokio::test]
async fn serve_fails_without_device_at_startup() {
    let config = fixtures::config();
    let paths = paths::default_paths(&config.inverter);
    let client = fixtures::ScriptedClient::new(vec![Err(crate::Error::Timeout)]);
    let mut service = Service::new(config, paths, client, MemorySink::new());
    let (_tx, writes) = tokio::sync::mpsc::channel(1);

    let result = serve(&mut service, writes, "pv/20/set").await;

    assert!(matches!(result, Err(crate::Error::NoDevice)));
    assert_eq!(service.sink().get(paths::UPDATE_INDEX), None);
}

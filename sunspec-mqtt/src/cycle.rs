//! The update cycle: resolve every configured path from one acquisition and publish the result.

use rust_decimal::Decimal;
use tracing::{debug, info};

use crate::{
    config::Config,
    metrics::{self, Metrics, MODEL_ID},
    paths::{self, Format, OutputPath, Phase, Source},
    sink::Sink,
    status::{self, UpdateIndex},
    sunspec::DeviceClient,
    value::Value,
    Error,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CycleOutput {
    pub outputs: Vec<(String, Value)>,
    pub index: UpdateIndex,
    pub error_id: String,
}

/// Resolves `paths` against one cycle's metrics.
///
/// Paths whose inputs are missing are left out of `outputs`, so their last published value stays.
pub fn run_cycle(
    paths: &[OutputPath],
    metrics: &Metrics,
    prev: UpdateIndex,
) -> crate::Result<CycleOutput> {
    if !metrics.contains_key(MODEL_ID) {
        return Err(Error::NoDevice);
    }

    let outputs = paths
        .iter()
        .filter_map(|p| {
            let source = p.source.as_ref()?;
            Some((p.path.clone(), resolve(source, metrics)?))
        })
        .collect();

    let state = metrics.get("St").and_then(|m| m.value.as_integer());
    let error_id = status::error_id(state, metrics.get("Evt1").map(|m| &m.value));

    Ok(CycleOutput {
        outputs,
        index: prev.next(),
        error_id,
    })
}

pub fn resolve(source: &Source, metrics: &Metrics) -> Option<Value> {
    let decimal = |key: &str| metrics.get(key).and_then(|m| m.value.as_decimal());

    match source {
        Source::DirectKey(key) => metrics.get(key).map(|m| m.value.clone()),
        Source::PhaseDerivedPower(phase) => {
            let power = phase_power(*phase, decimal)?;
            Some(Value::Number(power))
        }
        Source::PhaseDerivedEnergy => {
            let energy = decimal("kWH")?.checked_div(Decimal::from(3))?;
            Some(Value::Number(energy.round_dp(2)))
        }
        Source::StatusDerived => {
            let state = metrics.get("St")?.value.as_integer()?;
            Some(Value::Integer(status::status_code(state)))
        }
    }
}

fn phase_power(phase: Phase, decimal: impl Fn(&str) -> Option<Decimal>) -> Option<Decimal> {
    let current = decimal(&phase.current_key())?;
    let voltage = decimal(&phase.voltage_key())?;
    Some(current.checked_mul(voltage)?.round_dp(2))
}

/// Everything one inverter service needs across cycles, built once at startup.
pub struct Service<C, S> {
    config: Config,
    paths: Vec<OutputPath>,
    client: C,
    sink: S,
}

impl<C: DeviceClient, S: Sink> Service<C, S> {
    pub fn new(config: Config, paths: Vec<OutputPath>, client: C, sink: S) -> Self {
        Self {
            config,
            paths,
            client,
            sink,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    /// Reads the device once and registers the management paths and the path table.
    ///
    /// Fails with [`Error::NoDevice`] when the first read finds no model.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn register(&mut self) -> crate::Result<()> {
        let metrics = metrics::acquire(&self.client, &self.config.device).await;
        if !metrics.contains_key(MODEL_ID) {
            return Err(Error::NoDevice);
        }

        let text = |key: &str| metrics.get(key).map(|m| m.value.clone());
        let device = &self.config.device;
        let inverter = &self.config.inverter;

        let product_name = inverter
            .product_name
            .clone()
            .map(Value::Text)
            .or_else(|| text("Md"))
            .unwrap_or_else(|| "SunSpec PV inverter".into());

        let management: Vec<(&str, Value, bool)> = vec![
            ("/Mgmt/ProcessName", env!("CARGO_PKG_NAME").into(), false),
            ("/Mgmt/ProcessVersion", env!("CARGO_PKG_VERSION").into(), false),
            (
                "/Mgmt/Connection",
                format!("SunSpec TCP {}:{}", device.host, device.port).into(),
                false,
            ),
            ("/DeviceInstance", i64::from(inverter.instance).into(), false),
            ("/ProductId", 0xFFFF_i64.into(), false),
            ("/ProductName", product_name, false),
            ("/CustomName", inverter.name.as_str().into(), false),
            ("/FirmwareVersion", text("Vr").unwrap_or(Value::Empty), false),
            ("/Connected", 1_i64.into(), true),
            ("/Latency", Value::Empty, false),
            ("/Position", i64::from(inverter.position).into(), false),
            (paths::ERROR_ID, "".into(), false),
        ];

        for (path, value, writable) in management {
            self.sink.add_path(path, value, Format::Text, writable).await?;
        }

        for p in &self.paths {
            self.sink
                .add_path(&p.path, p.initial.clone(), p.format, true)
                .await?;
        }

        info!(
            model = %metrics[MODEL_ID].value,
            label = %metrics[MODEL_ID].label,
            paths = self.paths.len(),
            "Registered inverter"
        );
        Ok(())
    }

    /// One timer tick: acquire, resolve and publish.
    ///
    /// Nothing is written if the device could not be read.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn update(&mut self) -> crate::Result<UpdateIndex> {
        let metrics = metrics::acquire(&self.client, &self.config.device).await;

        let prev = self
            .sink
            .get(paths::UPDATE_INDEX)
            .map(UpdateIndex::from)
            .unwrap_or_default();

        let CycleOutput {
            outputs,
            index,
            error_id,
        } = run_cycle(&self.paths, &metrics, prev)?;

        for (path, value) in outputs {
            debug!(%path, %value, "Set");
            self.sink.set(&path, value).await?;
        }

        debug!(path = paths::ERROR_ID, %error_id, "Set");
        self.sink.set(paths::ERROR_ID, error_id.into()).await?;

        self.sink.set(paths::UPDATE_INDEX, index.into()).await?;

        Ok(index)
    }
}

#[cfg(test)]
use pretty_assertions::assert_eq;

#[cfg(test)]
pub(crate) mod fixtures {
    use async_trait::async_trait;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    };

    use crate::{
        config::{Config, DeviceConfig},
        sunspec::{DeviceClient, Model, Point},
    };

    /// Returns the scripted answers in order, then the last one forever.
    pub struct ScriptedClient {
        answers: Mutex<Vec<crate::Result<Vec<Model>>>>,
        reads: Arc<AtomicUsize>,
    }

    impl ScriptedClient {
        pub fn new(answers: Vec<crate::Result<Vec<Model>>>) -> Self {
            Self {
                answers: Mutex::new(answers),
                reads: Arc::default(),
            }
        }

        /// Counts every `read_models` call, also after the client moved into a service.
        pub fn reads(&self) -> Arc<AtomicUsize> {
            self.reads.clone()
        }
    }

    #[async_trait]
    impl DeviceClient for ScriptedClient {
        async fn read_models(&self, _device: &DeviceConfig) -> crate::Result<Vec<Model>> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            let mut answers = self.answers.lock().unwrap();
            if answers.len() > 1 {
                answers.remove(0)
            } else {
                match answers.first() {
                    Some(Ok(models)) => Ok(models.clone()),
                    _ => Err(crate::Error::NoDevice),
                }
            }
        }
    }

    pub fn point(id: &str, units: Option<&str>, value: &str) -> Point {
        Point {
            id: id.to_owned(),
            label: id.to_owned(),
            units: units.map(str::to_owned),
            value: Some(value.to_owned()),
        }
    }

    pub fn inverter(state: &str, event: &str) -> Vec<Model> {
        vec![
            Model {
                id: 1,
                label: "Common".to_owned(),
                points: vec![
                    point("Md", None, "-3M97-\0\0"),
                    point("Vr", None, "C008\0\0\0\0"),
                ],
            },
            Model {
                id: 103,
                label: "Inverter (Three Phase)".to_owned(),
                points: vec![
                    point("W", Some("W"), "6900"),
                    point("A", Some("A"), "30"),
                    point("AphA", Some("A"), "10"),
                    point("AphB", Some("A"), "10.5"),
                    point("AphC", Some("A"), "9.5"),
                    point("PhVphA", Some("V"), "230"),
                    point("PhVphB", Some("V"), "231.2"),
                    point("PhVphC", Some("V"), "229.8"),
                    point("Hz", Some("Hz"), "50.01"),
                    point("WH", Some("Wh"), "12345678"),
                    point("St", None, state),
                    point("Evt1", None, event),
                ],
            },
        ]
    }

    pub fn config() -> Config {
        r#"
            [device]
            host = "127.0.0.1"
            unit = 2
            timeout = "1s"

            [inverter]
            instance = 20
            name = "Roof"
            max_power = 8500
        "#
        .parse()
        .unwrap()
    }
}

#[cfg(test)]
fn metrics_of(models: &[crate::sunspec::Model]) -> Metrics {
    metrics::collect(models)
}

#[cfg(test)]
fn output<'a>(out: &'a CycleOutput, path: &str) -> Option<&'a Value> {
    out.outputs.iter().find(|(p, _)| p == path).map(|(_, v)| v)
}

#[test]
fn missing_model_id_is_fatal() {
    let paths = paths::default_paths(&fixtures::config().inverter);
    let result = run_cycle(&paths, &Metrics::new(), UpdateIndex(3));
    assert!(matches!(result, Err(Error::NoDevice)));
}

#[test]
fn cycle_resolves_every_source_kind() {
    let paths = paths::default_paths(&fixtures::config().inverter);
    let metrics = metrics_of(&fixtures::inverter("4", "0"));

    let out = run_cycle(&paths, &metrics, UpdateIndex(255)).unwrap();

    assert_eq!(output(&out, "/Ac/Power"), Some(&Value::Number(Decimal::from(6900))));
    assert_eq!(output(&out, "/Ac/L1/Power"), Some(&Value::Number(Decimal::from(2300))));
    // 10.5 * 231.2
    assert_eq!(output(&out, "/Ac/L2/Power"), Some(&Value::Number(Decimal::new(24276, 1))));
    assert_eq!(output(&out, "/Ac/L3/Voltage"), Some(&Value::Number(Decimal::new(2298, 1))));
    // 12345.68 / 3
    assert_eq!(
        output(&out, "/Ac/L2/Energy/Forward"),
        Some(&Value::Number(Decimal::new(411523, 2)))
    );
    assert_eq!(output(&out, paths::STATUS_CODE), Some(&Value::Integer(7)));
    assert_eq!(output(&out, paths::UPDATE_INDEX), None);
    assert_eq!(output(&out, "/Ac/MaxPower"), None);
    assert_eq!(out.index, UpdateIndex(0));
    assert_eq!(out.error_id, "");
}

#[test]
fn fault_state_reports_error_id() {
    let paths = paths::default_paths(&fixtures::config().inverter);
    let metrics = metrics_of(&fixtures::inverter("7", "42"));

    let out = run_cycle(&paths, &metrics, UpdateIndex(0)).unwrap();

    assert_eq!(output(&out, paths::STATUS_CODE), Some(&Value::Integer(10)));
    assert_eq!(out.error_id, "e-00000042");
    assert_eq!(out.index, UpdateIndex(1));
}

#[test]
fn missing_inputs_skip_their_paths() {
    let paths = vec![
        OutputPath::new("/Ac/Power", Format::Watts, Source::DirectKey("W".to_owned())),
        OutputPath::new("/Ac/L1/Power", Format::Watts, Source::PhaseDerivedPower(Phase::A)),
        OutputPath::new("/Ac/L1/Energy/Forward", Format::KilowattHours, Source::PhaseDerivedEnergy),
        OutputPath::new(paths::STATUS_CODE, Format::Integer, Source::StatusDerived),
    ];
    let metrics = metrics_of(&[crate::sunspec::Model {
        id: 103,
        label: "Inverter (Three Phase)".to_owned(),
        points: vec![fixtures::point("AphA", Some("A"), "10")],
    }]);

    let out = run_cycle(&paths, &metrics, UpdateIndex(0)).unwrap();

    assert!(out.outputs.is_empty());
    assert_eq!(out.error_id, "");
}

#[tokio::test]
async fn service_publishes_and_keeps_stale_paths() {
    use crate::sink::MemorySink;

    let config = fixtures::config();
    let paths = paths::default_paths(&config.inverter);
    let mut without_power = fixtures::inverter("4", "0");
    without_power[1].points.retain(|p| p.id != "W");

    let client = fixtures::ScriptedClient::new(vec![
        Ok(fixtures::inverter("4", "0")),
        Ok(fixtures::inverter("4", "0")),
        Ok(without_power),
    ]);
    let mut service = Service::new(config, paths, client, MemorySink::new());

    service.register().await.unwrap();
    let sink = service.sink();
    assert_eq!(sink.get("/ProductName"), Some(&Value::from("-3M97-")));
    assert_eq!(sink.get("/FirmwareVersion"), Some(&Value::from("C008")));
    assert_eq!(sink.get("/CustomName"), Some(&Value::from("Roof")));
    assert_eq!(sink.get("/Ac/MaxPower"), Some(&Value::Integer(8500)));
    assert_eq!(sink.get(paths::UPDATE_INDEX), Some(&Value::Integer(0)));

    assert_eq!(service.update().await.unwrap(), UpdateIndex(1));
    assert_eq!(
        service.sink().get("/Ac/Power"),
        Some(&Value::Number(Decimal::from(6900)))
    );

    assert_eq!(service.update().await.unwrap(), UpdateIndex(2));
    // W was missing this time, the last value stays
    assert_eq!(
        service.sink().get("/Ac/Power"),
        Some(&Value::Number(Decimal::from(6900)))
    );
    assert_eq!(service.sink().get(paths::UPDATE_INDEX), Some(&Value::Integer(2)));
    assert_eq!(service.sink().get(paths::ERROR_ID), Some(&Value::from("")));
}

#[tokio::test]
async fn service_update_without_device_writes_nothing() {
    use crate::sink::MemorySink;

    let config = fixtures::config();
    let paths = paths::default_paths(&config.inverter);
    let client = fixtures::ScriptedClient::new(vec![
        Ok(fixtures::inverter("4", "0")),
        Err(Error::Timeout),
    ]);
    let mut service = Service::new(config, paths, client, MemorySink::new());
    service.register().await.unwrap();

    assert!(matches!(service.update().await, Err(Error::NoDevice)));
    assert_eq!(service.sink().get(paths::UPDATE_INDEX), Some(&Value::Integer(0)));
    assert_eq!(service.sink().get("/Ac/Power"), Some(&Value::Integer(0)));
}

#[tokio::test]
async fn register_without_device_fails() {
    use crate::sink::MemorySink;

    let config = fixtures::config();
    let paths = paths::default_paths(&config.inverter);
    let client = fixtures::ScriptedClient::new(vec![Ok(vec![])]);
    let mut service = Service::new(config, paths, client, MemorySink::new());

    assert!(matches!(service.register().await, Err(Error::NoDevice)));
}

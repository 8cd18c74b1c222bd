use clap::Parser;
use std::path::PathBuf;
use sunspec_mqtt::{
    config::{self, Config},
    server, Result,
};
use tracing::error;
use url::Url;

#[derive(Parser, Debug)]
#[clap(
    name = "sunspec-mqtt",
    version,
    author,
    about = "Publishes a SunSpec PV inverter over MQTT"
)]
struct Cli {
    #[clap(
        env = "MQTT_URL",
        default_value = "mqtt://localhost:1883/sunspec-mqtt",
        value_hint = clap::ValueHint::Url
    )]
    url: Url,

    #[clap(
        short,
        long,
        env = "SUNSPEC_MQTT_CONFIG",
        default_value = "config.toml",
        value_hint = clap::ValueHint::FilePath
    )]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut args = Cli::parse();

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(err) => {
            tracing_subscriber::fmt::init();
            let delay = config::default_restart_delay();
            error!(cause = %err, ?delay, "Exiting after delay");
            tokio::time::sleep(delay).await;
            return Err(err);
        }
    };

    tracing_subscriber::fmt()
        .with_max_level(config.log_level())
        .init();

    let prefix = args
        .url
        .path()
        .trim_start_matches('/')
        .split('/')
        .next()
        .filter(|p| !p.is_empty())
        .unwrap_or(env!("CARGO_PKG_NAME"))
        .to_owned();

    if !args.url.query_pairs().any(|(k, _)| k == "client_id") {
        let client_id = format!("{}-{}", env!("CARGO_PKG_NAME"), config.inverter.instance);
        args.url
            .query_pairs_mut()
            .append_pair("client_id", &client_id)
            .finish();
    }

    let restart_delay = config.restart_delay;
    if let Err(err) = server::run(config, prefix, args.url.try_into()?, tokio::signal::ctrl_c()).await
    {
        error!(cause = %err, delay = ?restart_delay, "Exiting after delay");
        tokio::time::sleep(restart_delay).await;
        return Err(err);
    }

    Ok(())
}

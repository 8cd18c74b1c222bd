use thiserror::Error;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    IOError(#[from] std::io::Error),

    #[error(transparent)]
    MQTTOptionError(#[from] rumqttc::OptionError),

    #[error(transparent)]
    MQTTClientError(#[from] rumqttc::ClientError),

    #[error(transparent)]
    TOMLError(#[from] toml::de::Error),

    #[error(transparent)]
    JSONError(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    /// The device answered without any SunSpec model, or could not be read at all.
    #[error("No compatible inverter found")]
    NoDevice,

    #[error("SunSpec marker not found")]
    NoSunSpec,

    #[error("Modbus request timed out")]
    Timeout,

    #[error("{0}")]
    Other(std::borrow::Cow<'static, str>),
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Self::Other(s.into())
    }
}
impl From<&'static str> for Error {
    fn from(s: &'static str) -> Self {
        Self::Other(s.into())
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::Timeout
    }
}

//! The SunSpec side of the bridge: what a device read returns, and the client that performs it.

use async_trait::async_trait;

use crate::config::DeviceConfig;

pub mod client;
pub mod model;

pub use client::TcpClient;

/// One decoded SunSpec model block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Model {
    pub id: u16,
    pub label: String,
    pub points: Vec<Point>,
}

/// One point of a model. `value` is `None` when the device reports the point as unimplemented.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Point {
    pub id: String,
    pub label: String,
    pub units: Option<String>,
    pub value: Option<String>,
}

/// Anything that can hand back the models of a device in a single session.
///
/// Implementations open and close their own transport within one call. An empty list is a valid
/// answer and means the device exposes nothing usable.
#[async_trait]
pub trait DeviceClient: Send + Sync {
    async fn read_models(&self, device: &DeviceConfig) -> crate::Result<Vec<Model>>;
}

mod shutdown;

pub mod config;
pub mod cycle;
pub mod metrics;
pub mod mqtt;
pub mod paths;
pub mod server;
pub mod sink;
pub mod status;
pub mod sunspec;
pub mod value;

mod error;
pub use error::Error;

pub type Result<T> = std::result::Result<T, Error>;

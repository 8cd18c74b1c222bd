use async_trait::async_trait;
use std::time::Duration;
use tokio::time::timeout;
use tokio_modbus::client::{tcp, Context as ModbusClient};
use tokio_modbus::prelude::*;
use tracing::debug;

use super::{model::ModelDef, DeviceClient, Model};
use crate::{config::DeviceConfig, Error};

/// Base registers probed for the SunSpec marker, in order.
const BASE_ADDRESSES: [u16; 3] = [40000, 0, 50000];

/// "SunS"
const SUNSPEC_MARKER: [u16; 2] = [0x5375, 0x6e53];

const END_MODEL_ID: u16 = 0xFFFF;

// Modbus limits sequential reads to 125 registers
const MAX_READ: u16 = 125;

/// Reads SunSpec models over Modbus TCP, one connection per call.
#[derive(Debug, Default)]
pub struct TcpClient;

#[async_trait]
impl DeviceClient for TcpClient {
    #[tracing::instrument(level = "debug", skip(self))]
    async fn read_models(&self, device: &DeviceConfig) -> crate::Result<Vec<Model>> {
        let mut client = connect(device).await?;
        let result = scan(&mut client, device).await;
        // The TCP stream closes with the context, whatever `scan` returned.
        drop(client);
        result
    }
}

async fn connect(device: &DeviceConfig) -> crate::Result<ModbusClient> {
    let socket_addr = tokio::net::lookup_host((device.host.as_str(), device.port))
        .await?
        .next()
        .ok_or_else(|| Error::from(format!("Could not resolve {}", device.host)))?;

    let client = timeout(
        device.timeout,
        tcp::connect_slave(socket_addr, Slave(device.unit)),
    )
    .await??;
    Ok(client)
}

async fn scan(client: &mut ModbusClient, device: &DeviceConfig) -> crate::Result<Vec<Model>> {
    let base = find_base_address(client, device).await?;

    let mut models = vec![];
    let mut address = offset(base, 2)?;
    loop {
        let header = read(client, device.timeout, address, 2).await?;
        let [id, length] = header[..] else {
            return Err(format!("Short model header at {}", address).into());
        };
        if id == END_MODEL_ID {
            break;
        }

        let body = offset(address, 2)?;
        match ModelDef::find(id) {
            Some(def) => {
                let words = read(client, device.timeout, body, length).await?;
                models.push(def.decode(&words));
            }
            None => {
                debug!(id, length, "Skipping unsupported model");
                models.push(Model {
                    id,
                    label: format!("Model {}", id),
                    points: vec![],
                });
            }
        }

        match body.checked_add(length) {
            Some(next) => address = next,
            None => break,
        }
    }

    Ok(models)
}

async fn find_base_address(client: &mut ModbusClient, device: &DeviceConfig) -> crate::Result<u16> {
    let candidates = match device.base_address {
        Some(base) => vec![base],
        None => BASE_ADDRESSES.to_vec(),
    };

    for base in candidates {
        match read(client, device.timeout, base, 2).await {
            Ok(words) if words[..] == SUNSPEC_MARKER => {
                debug!(base, "Found SunSpec marker");
                return Ok(base);
            }
            Ok(words) => debug!(base, ?words, "No SunSpec marker"),
            Err(error) => debug!(base, %error, "Could not probe base address"),
        }
    }

    Err(Error::NoSunSpec)
}

async fn read(
    client: &mut ModbusClient,
    limit: Duration,
    address: u16,
    count: u16,
) -> crate::Result<Vec<u16>> {
    let mut words = Vec::with_capacity(usize::from(count));
    let mut done = 0;
    while done < count {
        let size = (count - done).min(MAX_READ);
        let start = offset(address, done)?;
        let chunk = timeout(limit, client.read_holding_registers(start, size)).await??;
        words.extend(chunk);
        done += size;
    }
    Ok(words)
}

fn offset(address: u16, by: u16) -> crate::Result<u16> {
    address
        .checked_add(by)
        .ok_or_else(|| format!("Register {} + {} out of range", address, by).into())
}

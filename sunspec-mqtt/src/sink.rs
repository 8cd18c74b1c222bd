use async_trait::async_trait;
use std::collections::HashMap;
use tracing::{debug, warn};

use crate::{paths::Format, value::Value};

/// The bus the service publishes its paths on.
///
/// The sink owns the last published value of every path; nothing else survives between cycles.
#[async_trait]
pub trait Sink: Send {
    async fn add_path(
        &mut self,
        path: &str,
        initial: Value,
        format: Format,
        writable: bool,
    ) -> crate::Result<()>;

    async fn set(&mut self, path: &str, value: Value) -> crate::Result<()>;

    fn get(&self, path: &str) -> Option<&Value>;

    /// A write from outside the service. Always accepted for registered paths.
    async fn write(&mut self, path: &str, value: Value) -> crate::Result<bool>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    pub value: Value,
    pub format: Format,
    pub writable: bool,
}

impl Entry {
    pub fn text(&self) -> String {
        self.format.text(&self.value)
    }
}

/// Keeps path values in memory. Also the local state behind the MQTT sink.
#[derive(Debug, Default)]
pub struct MemorySink {
    entries: HashMap<String, Entry>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entry(&self, path: &str) -> Option<&Entry> {
        self.entries.get(path)
    }

    pub fn insert(&mut self, path: &str, value: Value, format: Format, writable: bool) {
        self.entries.insert(
            path.to_owned(),
            Entry {
                value,
                format,
                writable,
            },
        );
    }

    /// Stores `value` and returns the entry, or `None` if `path` was never added.
    pub fn update(&mut self, path: &str, value: Value) -> Option<&Entry> {
        let entry = self.entries.get_mut(path)?;
        entry.value = value;
        Some(entry)
    }

    /// Accepts an external write to a known path.
    pub fn accept(&mut self, path: &str, value: Value) -> Option<&Entry> {
        let Some(entry) = self.entries.get(path) else {
            warn!(path, %value, "Write to unknown path ignored");
            return None;
        };
        if !entry.writable {
            // Accepted anyway, the bus decides who may write.
            debug!(path, "Write to read-only path");
        }
        debug!(path, %value, "someone else updated");
        self.update(path, value)
    }
}

#[async_trait]
impl Sink for MemorySink {
    async fn add_path(
        &mut self,
        path: &str,
        initial: Value,
        format: Format,
        writable: bool,
    ) -> crate::Result<()> {
        self.insert(path, initial, format, writable);
        Ok(())
    }

    async fn set(&mut self, path: &str, value: Value) -> crate::Result<()> {
        match self.update(path, value) {
            Some(_) => Ok(()),
            None => Err(format!("Path {} is not registered", path).into()),
        }
    }

    fn get(&self, path: &str) -> Option<&Value> {
        self.entries.get(path).map(|e| &e.value)
    }

    async fn write(&mut self, path: &str, value: Value) -> crate::Result<bool> {
        Ok(self.accept(path, value).is_some())
    }
}

#[cfg(test)]
use pretty_assertions::assert_eq;

#[tokio::test]
async fn set_requires_registered_path() {
    let mut sink = MemorySink::new();
    sink.add_path("/Ac/Power", Value::Integer(0), Format::Watts, false)
        .await
        .unwrap();

    sink.set("/Ac/Power", Value::Integer(450)).await.unwrap();
    assert!(sink.set("/Ac/Unknown", Value::Integer(1)).await.is_err());

    assert_eq!(sink.get("/Ac/Power"), Some(&Value::Integer(450)));
    assert_eq!(sink.entry("/Ac/Power").unwrap().text(), "450W");
}

#[tokio::test]
async fn external_writes_are_accepted() {
    let mut sink = MemorySink::new();
    sink.add_path("/Connected", Value::Integer(1), Format::Integer, true)
        .await
        .unwrap();
    sink.add_path("/Ac/Power", Value::Integer(0), Format::Watts, false)
        .await
        .unwrap();

    assert!(sink.write("/Connected", Value::Integer(0)).await.unwrap());
    assert!(sink.write("/Ac/Power", Value::Integer(5)).await.unwrap());
    assert!(!sink.write("/Nope", Value::Integer(5)).await.unwrap());

    assert_eq!(sink.get("/Connected"), Some(&Value::Integer(0)));
    assert_eq!(sink.get("/Ac/Power"), Some(&Value::Integer(5)));
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The common backend-adapter lifecycle (spec.md §4.4) and a kind-tag
//! keyed factory registry (spec.md §9: "a closed sum type ... or a trait
//! object behind a factory keyed by the kind tag").

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use mapping_engine::MappingRule;
use thiserror::Error;

/// Opaque, per-device configuration options, as loaded from the `devices.
/// <name>` YAML map. Adapters are responsible for interpreting their own
/// shape and failing construction if required keys are absent.
pub type DeviceOptions = serde_yaml::Value;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("unknown device kind: {0}")]
    UnknownKind(String),
    #[error("invalid adapter configuration: {0}")]
    Config(String),
    #[error("adapter transport failed to open: {0}")]
    Open(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("i/o timed out")]
    Timeout,
    #[error("operation not supported by this adapter")]
    NotSupported,
}

/// Common lifecycle and byte interface implemented by every backend
/// adapter (spec.md §4.4). One instance is owned exclusively by one link.
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Lightweight preparation; must not perform blocking I/O.
    async fn connect(&self) -> Result<(), AdapterError> {
        Ok(())
    }

    /// Opens the transport and, if [`Adapter::requires_lock`], takes the
    /// adapter's internal mutex. Must either fully succeed or leave no
    /// resources held.
    async fn acquire(&self) -> Result<(), AdapterError>;

    /// Closes the transport and drops the internal mutex. Idempotent.
    async fn release(&self);

    /// Tears down the transport regardless of lock state.
    async fn disconnect(&self) {
        self.release().await;
    }

    async fn write(&self, data: &[u8]) -> Result<usize, AdapterError>;

    /// Reads up to `max_bytes`. May return fewer; empty means "no data
    /// ready" (spec.md §4.4).
    async fn read(&self, max_bytes: usize) -> Result<Vec<u8>, AdapterError>;

    /// Whether I/O on this adapter requires the link to hold the device
    /// lock first (spec.md §3: "an adapter whose `requires_lock` is true
    /// MAY only perform I/O while its link holds the device lock").
    fn requires_lock(&self) -> bool;
}

/// Parses a `write_termination`/`read_termination` setting shared by the
/// SCPI-like adapters: `"CRLF"`/`"CR"`/`"LF"` shorthands (case-insensitive),
/// otherwise the value is unescaped (`\r`, `\n`, `\t`, ...) as literal bytes.
/// `None`/empty means "no terminator".
pub fn parse_termination(value: Option<&str>) -> Option<Vec<u8>> {
    let v = value?;
    if v.is_empty() {
        return None;
    }
    match v.to_uppercase().as_str() {
        "CRLF" => return Some(b"\r\n".to_vec()),
        "CR" => return Some(b"\r".to_vec()),
        "LF" => return Some(b"\n".to_vec()),
        _ => {}
    }
    Some(unescape(v).into_bytes())
}

fn unescape(v: &str) -> String {
    let mut out = String::with_capacity(v.len());
    let mut chars = v.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.peek() {
            Some('n') => {
                out.push('\n');
                chars.next();
            }
            Some('r') => {
                out.push('\r');
                chars.next();
            }
            Some('t') => {
                out.push('\t');
                chars.next();
            }
            Some('0') => {
                out.push('\0');
                chars.next();
            }
            Some('\\') => {
                out.push('\\');
                chars.next();
            }
            _ => out.push('\\'),
        }
    }
    out
}

/// Builds one adapter instance from its device options and the mapping
/// rules configured for that device (empty for kinds that don't consume
/// the command-mapping engine). Mirrors the Python `AdapterFactory`'s
/// per-kind builder functions, but threads `mappings:` through a typed
/// parameter instead of smuggling it inside the settings `**kwargs`
/// (`server.py:AdapterFactory.build`).
pub type AdapterFactory = Arc<dyn Fn(&str, &DeviceOptions, &[MappingRule]) -> Result<Arc<dyn Adapter>, AdapterError> + Send + Sync>;

/// Maps a device `kind` tag to the factory that builds its adapter.
/// Unknown tags fail config load (spec.md §9).
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    factories: HashMap<String, AdapterFactory>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self { factories: HashMap::new() }
    }

    pub fn register(&mut self, kind: impl Into<String>, factory: AdapterFactory) {
        self.factories.insert(kind.into(), factory);
    }

    pub fn build(&self, kind: &str, name: &str, options: &DeviceOptions, mappings: &[MappingRule]) -> Result<Arc<dyn Adapter>, AdapterError> {
        let factory = self
            .factories
            .get(kind)
            .ok_or_else(|| AdapterError::UnknownKind(kind.to_string()))?;
        factory(name, options, mappings)
    }

    pub fn known_kinds(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_termination_shorthands() {
        assert_eq!(parse_termination(Some("CRLF")), Some(b"\r\n".to_vec()));
        assert_eq!(parse_termination(Some("cr")), Some(b"\r".to_vec()));
        assert_eq!(parse_termination(Some("lf")), Some(b"\n".to_vec()));
    }

    #[test]
    fn parse_termination_escapes_and_empty() {
        assert_eq!(parse_termination(Some("\\n")), Some(b"\n".to_vec()));
        assert_eq!(parse_termination(Some("")), None);
        assert_eq!(parse_termination(None), None);
        assert_eq!(parse_termination(Some("END")), Some(b"END".to_vec()));
    }

    struct Stub;

    #[async_trait]
    impl Adapter for Stub {
        async fn acquire(&self) -> Result<(), AdapterError> {
            Ok(())
        }
        async fn release(&self) {}
        async fn write(&self, data: &[u8]) -> Result<usize, AdapterError> {
            Ok(data.len())
        }
        async fn read(&self, _max_bytes: usize) -> Result<Vec<u8>, AdapterError> {
            Ok(Vec::new())
        }
        fn requires_lock(&self) -> bool {
            false
        }
    }

    #[test]
    fn unknown_kind_fails_build() {
        let registry = AdapterRegistry::new();
        let err = registry.build("nonexistent", "bench1", &DeviceOptions::Null, &[]).unwrap_err();
        assert!(matches!(err, AdapterError::UnknownKind(k) if k == "nonexistent"));
    }

    #[tokio::test]
    async fn registered_factory_builds_adapter() {
        let mut registry = AdapterRegistry::new();
        registry.register("stub", Arc::new(|_name, _opts, _mappings| Ok(Arc::new(Stub) as Arc<dyn Adapter>)));
        let adapter = registry.build("stub", "bench1", &DeviceOptions::Null, &[]).unwrap();
        assert_eq!(adapter.write(b"hi").await.unwrap(), 2);
    }
}

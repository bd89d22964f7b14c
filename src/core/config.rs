//! Typed configuration for controllers and the devices attached to them.
//!
//! Raw values are deserialised leniently and then validated as a whole, so a
//! [`ConfigError`] reports every violated field rather than only the first.

use std::collections::{HashMap, HashSet};
use std::fmt::{Display, Formatter};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::modbus::{
    check_range, Address, Error, Quantity, Table, UnitId, MAX_UNIT_ID, MIN_UNIT_ID,
    MODBUS_TCP_DEFAULT_PORT,
};

/// Upper bound on in-flight transactions per session: one per usable
/// transaction id.
pub const MAX_WINDOW: usize = u16::MAX as usize;

fn default_port() -> i64 {
    MODBUS_TCP_DEFAULT_PORT as i64
}

fn default_unit_id() -> i64 {
    1
}

fn default_count() -> i64 {
    1
}

fn default_response_timeout_ms() -> u64 {
    5000
}

fn default_retry_limit() -> u32 {
    3
}

fn default_retry_backoff() -> Backoff {
    Backoff::Fixed { delay_ms: 100 }
}

fn default_window() -> usize {
    8
}

fn default_connect_timeout_ms() -> u64 {
    3000
}

fn default_reconnect_backoff() -> Backoff {
    Backoff::Exponential {
        initial_ms: 500,
        max_ms: 5000,
    }
}

fn default_max_reconnect_attempts() -> u32 {
    5
}

/// Delay schedule between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backoff {
    Fixed { delay_ms: u64 },
    Exponential { initial_ms: u64, max_ms: u64 },
}

impl Backoff {
    /// The delay preceding the given 1-based attempt.
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::Fixed { delay_ms } => Duration::from_millis(delay_ms),
            Backoff::Exponential { initial_ms, max_ms } => {
                let factor = 1u64
                    .checked_shl(attempt.saturating_sub(1))
                    .unwrap_or(u64::MAX);
                Duration::from_millis(initial_ms.saturating_mul(factor).min(max_ms))
            }
        }
    }

    fn check(&self, field: String, violations: &mut Violations) {
        if let Backoff::Exponential { initial_ms, max_ms } = *self {
            if initial_ms == 0 {
                violations.push(field.clone(), "initial_ms must be positive");
            }
            if max_ms < initial_ms {
                violations.push(field, "max_ms must not be below initial_ms");
            }
        }
    }
}

/// What happens to in-flight transactions when the connection drops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequeuePolicy {
    /// Resolve them with [`Error::ConnectionLost`].
    #[default]
    Fail,
    /// Keep them and write them again once reconnected.
    Requeue,
}

/// Tuning of a single transport session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub response_timeout: Duration,
    pub retry_limit: u32,
    pub retry_backoff: Backoff,
    pub window: usize,
    pub connect_timeout: Duration,
    pub reconnect_backoff: Backoff,
    pub max_reconnect_attempts: u32,
    pub requeue: RequeuePolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            response_timeout: Duration::from_millis(default_response_timeout_ms()),
            retry_limit: default_retry_limit(),
            retry_backoff: default_retry_backoff(),
            window: default_window(),
            connect_timeout: Duration::from_millis(default_connect_timeout_ms()),
            reconnect_backoff: default_reconnect_backoff(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            requeue: RequeuePolicy::default(),
        }
    }
}

impl SessionConfig {
    /// `window` bounded to `1..=MAX_WINDOW`.
    pub fn effective_window(&self) -> usize {
        self.window.clamp(1, MAX_WINDOW)
    }
}

/// A `host:port` pair; one transport session exists per endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Endpoint {
        Endpoint {
            host: host.into(),
            port,
        }
    }
}

impl Display for Endpoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub field: String,
    pub message: String,
}

impl Display for Violation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Every violated field of a configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
    pub violations: Vec<Violation>,
}

impl ConfigError {
    pub fn fields(&self) -> Vec<&str> {
        self.violations.iter().map(|v| v.field.as_str()).collect()
    }
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} invalid configuration field(s)", self.violations.len())?;
        for violation in &self.violations {
            write!(f, "\n  {violation}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ConfigError {}

#[derive(Debug, Default)]
struct Violations(Vec<Violation>);

impl Violations {
    fn push(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.0.push(Violation {
            field: field.into(),
            message: message.into(),
        });
    }

    fn finish<T>(self, value: T) -> Result<T, ConfigError> {
        if self.0.is_empty() {
            Ok(value)
        } else {
            Err(ConfigError { violations: self.0 })
        }
    }
}

fn required<'a>(
    value: &'a Option<String>,
    field: String,
    violations: &mut Violations,
) -> Option<&'a str> {
    match value.as_deref().map(str::trim) {
        None => {
            violations.push(field, "is required");
            None
        }
        Some("") => {
            violations.push(field, "must not be empty");
            None
        }
        Some(value) => Some(value),
    }
}

fn in_range<T: TryFrom<i64>>(
    value: i64,
    min: i64,
    max: i64,
    field: String,
    violations: &mut Violations,
) -> Option<T> {
    if value < min || value > max {
        violations.push(field, format!("{value} is outside {min}..={max}"));
        return None;
    }

    T::try_from(value).ok()
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub controllers: Vec<ControllerConfig>,
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ControllerConfig {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,
    #[serde(default = "default_retry_limit")]
    pub retry_limit: u32,
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff: Backoff,
    #[serde(default = "default_window")]
    pub window: usize,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_reconnect_backoff")]
    pub reconnect_backoff: Backoff,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default)]
    pub requeue: RequeuePolicy,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceConfig {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default = "default_port")]
    pub port: i64,
    #[serde(default = "default_unit_id")]
    pub unit_id: i64,
    #[serde(default)]
    pub modbus_id: Option<String>,
    #[serde(default)]
    pub registers: Vec<RegisterConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegisterConfig {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub table: Option<Table>,
    #[serde(default)]
    pub address: Option<i64>,
    #[serde(default = "default_count")]
    pub count: i64,
}

/// A validated controller: its id and the tuning of every session it opens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerSettings {
    pub id: String,
    pub session: SessionConfig,
}

impl ControllerSettings {
    pub fn new(id: impl Into<String>, session: SessionConfig) -> ControllerSettings {
        ControllerSettings {
            id: id.into(),
            session,
        }
    }
}

/// A named block of consecutive items polled together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterBlock {
    pub name: String,
    pub table: Table,
    pub address: Address,
    pub count: Quantity,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSettings {
    pub name: String,
    pub endpoint: Endpoint,
    pub unit_id: UnitId,
    pub controller: String,
    pub registers: Vec<RegisterBlock>,
}

impl DeviceSettings {
    pub fn new(endpoint: Endpoint, unit_id: UnitId) -> DeviceSettings {
        DeviceSettings {
            name: format!("{endpoint}/{unit_id}"),
            endpoint,
            unit_id,
            controller: String::new(),
            registers: vec![],
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> DeviceSettings {
        self.name = name.into();
        self
    }

    pub fn with_block(mut self, block: RegisterBlock) -> DeviceSettings {
        self.registers.push(block);
        self
    }
}

/// A configuration whose every field passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedConfig {
    pub controllers: Vec<ControllerSettings>,
    pub devices: Vec<DeviceSettings>,
}

impl Config {
    pub fn from_json(json: &str) -> Result<Config, Error> {
        Ok(serde_json::from_str(json)?)
    }

    /// Reads and validates a JSON configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<ValidatedConfig, Error> {
        let json = std::fs::read_to_string(path)?;
        Ok(Config::from_json(&json)?.validate()?)
    }

    pub fn validate(&self) -> Result<ValidatedConfig, ConfigError> {
        let mut violations = Violations::default();

        let mut controllers = vec![];
        let mut controller_ids = HashSet::new();
        for (index, controller) in self.controllers.iter().enumerate() {
            let at = format!("controllers[{index}]");
            if let Some(settings) = controller.validate(&at, &mut violations) {
                if !controller_ids.insert(settings.id.clone()) {
                    violations.push(
                        format!("{at}.id"),
                        format!("duplicates controller `{}`", settings.id),
                    );
                }
                controllers.push(settings);
            }
        }

        let mut devices = vec![];
        let mut names = HashSet::new();
        let mut units: HashMap<(String, Endpoint, UnitId), usize> = HashMap::new();
        for (index, device) in self.devices.iter().enumerate() {
            let at = format!("devices[{index}]");
            let Some(settings) = device.validate(&at, &controller_ids, &mut violations) else {
                continue;
            };

            if !names.insert(settings.name.clone()) {
                violations.push(
                    format!("{at}.id"),
                    format!("duplicates device `{}`", settings.name),
                );
            }

            let key = (
                settings.controller.clone(),
                settings.endpoint.clone(),
                settings.unit_id,
            );
            if let Some(other) = units.insert(key, index) {
                violations.push(
                    format!("{at}.unit_id"),
                    format!(
                        "unit {} on {} is already used by devices[{other}]",
                        settings.unit_id, settings.endpoint
                    ),
                );
            }

            devices.push(settings);
        }

        violations.finish(ValidatedConfig {
            controllers,
            devices,
        })
    }
}

impl ControllerConfig {
    fn validate(&self, at: &str, violations: &mut Violations) -> Option<ControllerSettings> {
        let id = required(&self.id, format!("{at}.id"), violations);

        if self.response_timeout_ms == 0 {
            violations.push(format!("{at}.response_timeout_ms"), "must be positive");
        }
        if self.connect_timeout_ms == 0 {
            violations.push(format!("{at}.connect_timeout_ms"), "must be positive");
        }
        if self.window == 0 {
            violations.push(format!("{at}.window"), "must allow at least one transaction");
        } else if self.window > MAX_WINDOW {
            violations.push(
                format!("{at}.window"),
                format!("{} exceeds the {MAX_WINDOW} available transaction ids", self.window),
            );
        }
        if self.max_reconnect_attempts == 0 {
            violations.push(format!("{at}.max_reconnect_attempts"), "must be positive");
        }
        self.retry_backoff
            .check(format!("{at}.retry_backoff"), violations);
        self.reconnect_backoff
            .check(format!("{at}.reconnect_backoff"), violations);

        Some(ControllerSettings {
            id: id?.to_string(),
            session: SessionConfig {
                response_timeout: Duration::from_millis(self.response_timeout_ms),
                retry_limit: self.retry_limit,
                retry_backoff: self.retry_backoff,
                window: self.window,
                connect_timeout: Duration::from_millis(self.connect_timeout_ms),
                reconnect_backoff: self.reconnect_backoff,
                max_reconnect_attempts: self.max_reconnect_attempts,
                requeue: self.requeue,
            },
        })
    }
}

impl DeviceConfig {
    fn validate(
        &self,
        at: &str,
        controllers: &HashSet<String>,
        violations: &mut Violations,
    ) -> Option<DeviceSettings> {
        let host = required(&self.host, format!("{at}.host"), violations);
        if host.is_some_and(|host| host.contains(char::is_whitespace)) {
            violations.push(format!("{at}.host"), "must not contain whitespace");
        }

        let port: Option<u16> = in_range(self.port, 1, 65535, format!("{at}.port"), violations);
        let unit_id: Option<u8> = in_range(
            self.unit_id,
            MIN_UNIT_ID as i64,
            MAX_UNIT_ID as i64,
            format!("{at}.unit_id"),
            violations,
        );

        let controller = required(&self.modbus_id, format!("{at}.modbus_id"), violations);
        if let Some(controller) = controller {
            if !controllers.contains(controller) {
                violations.push(
                    format!("{at}.modbus_id"),
                    format!("references unknown controller `{controller}`"),
                );
            }
        }

        if let Some(id) = &self.id {
            if id.trim().is_empty() {
                violations.push(format!("{at}.id"), "must not be empty");
            }
        }

        let mut registers = vec![];
        let mut block_names = HashSet::new();
        for (index, register) in self.registers.iter().enumerate() {
            let at = format!("{at}.registers[{index}]");
            if let Some(block) = register.validate(&at, violations) {
                if !block_names.insert(block.name.clone()) {
                    violations.push(
                        format!("{at}.name"),
                        format!("duplicates block `{}`", block.name),
                    );
                }
                registers.push(block);
            }
        }

        let endpoint = Endpoint::new(host?.to_string(), port?);
        let unit_id = UnitId::new(unit_id?).ok()?;
        let name = match self.id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => format!("{endpoint}/{unit_id}"),
        };

        Some(DeviceSettings {
            name,
            endpoint,
            unit_id,
            controller: controller?.to_string(),
            registers,
        })
    }
}

impl RegisterConfig {
    fn validate(&self, at: &str, violations: &mut Violations) -> Option<RegisterBlock> {
        let name = required(&self.name, format!("{at}.name"), violations);

        if self.table.is_none() {
            violations.push(format!("{at}.table"), "is required");
        }

        let address: Option<Address> = match self.address {
            Some(address) => in_range(address, 0, 65535, format!("{at}.address"), violations),
            None => {
                violations.push(format!("{at}.address"), "is required");
                None
            }
        };
        let max = self.table.map_or(Table::Coils.max_read(), Table::max_read);
        let count: Option<Quantity> =
            in_range(self.count, 1, max as i64, format!("{at}.count"), violations);

        if let (Some(address), Some(count)) = (address, count) {
            if let Err(violation) = check_range(address, count, max) {
                violations.push(format!("{at}.count"), violation.to_string());
            }
        }

        Some(RegisterBlock {
            name: name?.to_string(),
            table: self.table?,
            address: address?,
            count: count?,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_follow_the_schema() {
        let config = Config::from_json(
            r#"{
                "controllers": [{ "id": "bus" }],
                "devices": [{ "host": "10.0.0.5", "modbus_id": "bus" }]
            }"#,
        )
        .expect("Must parse")
        .validate()
        .expect("Must validate");

        let device = &config.devices[0];
        assert_eq!(device.endpoint, Endpoint::new("10.0.0.5", 502));
        assert_eq!(*device.unit_id, 1);
        assert_eq!(device.name, "10.0.0.5:502/1");
        assert_eq!(config.controllers[0].session, SessionConfig::default());
    }

    #[test]
    fn reports_every_violation_at_once() {
        let config = Config::from_json(
            r#"{
                "controllers": [{ "id": "bus", "window": 0 }],
                "devices": [
                    { "port": 0, "unit_id": 248, "modbus_id": "other" },
                    { "host": "plc", "unit_id": 0, "modbus_id": "bus",
                      "registers": [{ "name": "temps", "table": "input_registers",
                                      "address": 65530, "count": 10 }] }
                ]
            }"#,
        )
        .expect("Must parse");

        let error = config.validate().expect_err("Must reject");
        assert_eq!(
            error.fields(),
            vec![
                "controllers[0].window",
                "devices[0].host",
                "devices[0].port",
                "devices[0].unit_id",
                "devices[0].modbus_id",
                "devices[1].unit_id",
                "devices[1].registers[0].count",
            ]
        );
    }

    #[test]
    fn missing_address_is_reported_with_the_rest() {
        let config = Config::from_json(
            r#"{
                "controllers": [{ "id": "bus" }],
                "devices": [{ "unit_id": 0, "modbus_id": "bus",
                              "registers": [{ "name": "temps", "table": "input_registers" }] }]
            }"#,
        )
        .expect("Must parse without an address");

        let error = config.validate().expect_err("Must reject");
        assert_eq!(
            error.fields(),
            vec![
                "devices[0].host",
                "devices[0].unit_id",
                "devices[0].registers[0].address",
            ]
        );
    }

    #[test]
    fn window_is_bounded_by_transaction_ids() {
        let config = Config::from_json(
            r#"{ "controllers": [
                { "id": "a", "window": 4611686018427387904 },
                { "id": "b", "window": 65535 }
            ] }"#,
        )
        .expect("Must parse");

        let error = config.validate().expect_err("Must reject");
        assert_eq!(error.fields(), vec!["controllers[0].window"]);

        let oversized = SessionConfig {
            window: usize::MAX,
            ..SessionConfig::default()
        };
        assert_eq!(oversized.effective_window(), MAX_WINDOW);
        let empty = SessionConfig {
            window: 0,
            ..SessionConfig::default()
        };
        assert_eq!(empty.effective_window(), 1);
    }

    #[test]
    fn shared_unit_on_one_endpoint_is_rejected() {
        let config = Config::from_json(
            r#"{
                "controllers": [{ "id": "bus" }],
                "devices": [
                    { "id": "a", "host": "plc", "unit_id": 3, "modbus_id": "bus" },
                    { "id": "b", "host": "plc", "unit_id": 3, "modbus_id": "bus" },
                    { "id": "c", "host": "plc", "port": 1502, "unit_id": 3, "modbus_id": "bus" }
                ]
            }"#,
        )
        .expect("Must parse");

        let error = config.validate().expect_err("Must reject");
        assert_eq!(error.fields(), vec!["devices[1].unit_id"]);
    }

    #[test]
    fn backoffs_parse_and_grow() {
        let config = Config::from_json(
            r#"{ "controllers": [{
                "id": "bus",
                "retry_backoff": { "kind": "exponential", "initial_ms": 50, "max_ms": 300 },
                "requeue": "requeue"
            }] }"#,
        )
        .expect("Must parse")
        .validate()
        .expect("Must validate");

        let session = &config.controllers[0].session;
        assert_eq!(session.requeue, RequeuePolicy::Requeue);
        assert_eq!(session.retry_backoff.delay(1), Duration::from_millis(50));
        assert_eq!(session.retry_backoff.delay(3), Duration::from_millis(200));
        assert_eq!(session.retry_backoff.delay(40), Duration::from_millis(300));
    }

    #[test]
    fn unknown_keys_are_refused() {
        assert!(matches!(
            Config::from_json(r#"{ "devices": [{ "hots": "plc" }] }"#),
            Err(Error::Decode(_))
        ));
    }
}

use std::collections::{BTreeMap, HashMap};

use log::{debug, info, warn};

use crate::core::config::{ControllerSettings, DeviceSettings, Endpoint, ValidatedConfig};
use crate::core::device::Device;
use crate::core::modbus::{ConnectionState, Error, TransportSession};

/// Owns one [`TransportSession`] per `host:port` and the devices attached to
/// them.
///
/// Devices are attached explicitly; the first device on an endpoint opens its
/// session and later ones on the same endpoint share it.
///
/// ```no_run
/// # use modbus_tcp_master::prelude::*;
/// # async fn docs() -> Result<(), Error> {
/// let config = Config::load("modbus.json")?;
///
/// for mut controller in ModbusController::from_config(config)? {
///     controller.update_all().await;
///     controller.close();
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct ModbusController {
    settings: ControllerSettings,
    sessions: HashMap<Endpoint, TransportSession>,
    devices: BTreeMap<String, Device>,
}

impl ModbusController {
    pub fn new(settings: ControllerSettings) -> ModbusController {
        debug!("Created controller `{}`: {:?}", settings.id, settings.session);

        ModbusController {
            settings,
            sessions: HashMap::new(),
            devices: BTreeMap::new(),
        }
    }

    /// Builds every configured controller with its devices attached. Must be
    /// called within a tokio runtime.
    pub fn from_config(config: ValidatedConfig) -> Result<Vec<ModbusController>, Error> {
        let mut controllers: Vec<_> = config
            .controllers
            .into_iter()
            .map(ModbusController::new)
            .collect();

        for device in config.devices {
            match controllers
                .iter_mut()
                .find(|controller| controller.id() == device.controller)
            {
                Some(controller) => {
                    controller.add_device(device)?;
                }
                None => warn!(
                    "Device `{}` names unknown controller `{}`",
                    device.name, device.controller
                ),
            }
        }

        Ok(controllers)
    }

    pub fn id(&self) -> &str {
        &self.settings.id
    }

    /// Attaches a device, opening a session for its endpoint if there is none
    /// yet.
    pub fn add_device(&mut self, settings: DeviceSettings) -> Result<&Device, Error> {
        if self.devices.contains_key(&settings.name) {
            return Err(Error::DuplicateDevice(settings.name));
        }

        let session = self
            .sessions
            .entry(settings.endpoint.clone())
            .or_insert_with(|| {
                info!(
                    "Controller `{}` opening session to {}",
                    self.settings.id, settings.endpoint
                );
                TransportSession::open(settings.endpoint.clone(), self.settings.session.clone())
            });

        let device = Device::attach(session, settings)?;
        let name = device.name().to_string();

        Ok(self.devices.entry(name).or_insert(device))
    }

    pub fn device(&self, name: &str) -> Option<&Device> {
        self.devices.get(name)
    }

    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.devices.values()
    }

    pub fn session(&self, endpoint: &Endpoint) -> Option<&TransportSession> {
        self.sessions.get(endpoint)
    }

    /// Endpoints whose sessions have given up reconnecting.
    pub fn faulted(&self) -> Vec<&Endpoint> {
        let mut faulted: Vec<_> = self
            .sessions
            .values()
            .filter(|session| session.state() == ConnectionState::Faulted)
            .map(TransportSession::endpoint)
            .collect();
        faulted.sort();
        faulted
    }

    /// Polls every device once. Failures are logged and returned by device name.
    pub async fn update_all(&self) -> Vec<(String, Error)> {
        let mut failures = vec![];

        for (name, device) in &self.devices {
            if let Err(err) = device.update().await {
                failures.push((name.clone(), err));
            }
        }

        for endpoint in self.faulted() {
            warn!("Controller `{}`: session {endpoint} is faulted", self.settings.id);
        }

        failures
    }

    /// Closes every session; attached devices fail from then on.
    pub fn close(&mut self) {
        for session in self.sessions.values() {
            session.close();
        }
        info!(
            "Controller `{}` closed {} session(s)",
            self.settings.id,
            self.sessions.len()
        );
    }
}

impl Drop for ModbusController {
    fn drop(&mut self) {
        for session in self.sessions.values() {
            session.close();
        }
    }
}

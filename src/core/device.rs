use std::collections::{BTreeMap, HashMap};

use log::{debug, info, warn};

use crate::core::config::{DeviceSettings, Endpoint, RegisterBlock};
use crate::core::modbus::{
    Address, Client, Error, Quantity, RegisterValue, Request, Response, Table, TransportSession,
    UnitId,
};
use crate::queue::pending::TransactionId;

/// Last-known values of one unit, keyed by table and address.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegisterCache {
    values: BTreeMap<(Table, Address), RegisterValue>,
}

impl RegisterCache {
    pub fn get(&self, table: Table, address: Address) -> Option<RegisterValue> {
        self.values.get(&(table, address)).copied()
    }

    /// Values of `count` consecutive items; gaps are `None`.
    pub fn range(&self, table: Table, address: Address, count: Quantity) -> Vec<Option<RegisterValue>> {
        (0..count)
            .map(|offset| self.get(table, address.wrapping_add(offset)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    fn store(&mut self, table: Table, address: Address, values: impl IntoIterator<Item = RegisterValue>) {
        for (offset, value) in values.into_iter().enumerate() {
            self.values
                .insert((table, address.wrapping_add(offset as Address)), value);
        }
    }

    /// Folds a confirmed request/response pair into the cache.
    pub fn record(&mut self, request: &Request, response: &Response) {
        let table = request.table();

        match (request, response) {
            (Request::ReadCoils(addr, _), Response::Coils(states))
            | (Request::ReadDiscreteInputs(addr, _), Response::DiscreteInputs(states)) => {
                self.store(table, *addr, states.iter().copied().map(RegisterValue::Bit))
            }
            (Request::ReadHoldingRegisters(addr, _), Response::HoldingRegisters(values))
            | (Request::ReadInputRegisters(addr, _), Response::InputRegisters(values)) => {
                self.store(table, *addr, values.iter().copied().map(RegisterValue::Word))
            }
            (Request::WriteSingleCoil(addr, state), _) => {
                self.store(table, *addr, [RegisterValue::Bit(*state)])
            }
            (Request::WriteSingleRegister(addr, value), _) => {
                self.store(table, *addr, [RegisterValue::Word(*value)])
            }
            (Request::WriteMultipleCoils(addr, states), _) => {
                self.store(table, *addr, states.iter().copied().map(RegisterValue::Bit))
            }
            (Request::WriteMultipleRegisters(addr, values), _) => {
                self.store(table, *addr, values.iter().copied().map(RegisterValue::Word))
            }
            _ => warn!("Not caching {response:?} as a reply to {request:?}"),
        }
    }
}

/// The unit ids attached to one session and their register caches.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    units: HashMap<UnitId, RegisterCache>,
}

impl DeviceRegistry {
    pub fn new() -> DeviceRegistry {
        DeviceRegistry::default()
    }

    pub fn register(&mut self, unit_id: UnitId) -> Result<(), Error> {
        if self.units.contains_key(&unit_id) {
            return Err(Error::DuplicateUnit(unit_id.get()));
        }

        self.units.insert(unit_id, RegisterCache::default());
        Ok(())
    }

    pub fn unregister(&mut self, unit_id: UnitId) -> Option<RegisterCache> {
        self.units.remove(&unit_id)
    }

    pub fn contains(&self, unit_id: UnitId) -> bool {
        self.units.contains_key(&unit_id)
    }

    pub fn cache(&self, unit_id: UnitId) -> Option<&RegisterCache> {
        self.units.get(&unit_id)
    }

    pub fn record(&mut self, unit_id: UnitId, request: &Request, response: &Response) {
        match self.units.get_mut(&unit_id) {
            Some(cache) => cache.record(request, response),
            None => debug!("Unit {unit_id} is no longer attached, dropping its values"),
        }
    }

    /// Attached unit ids in ascending order.
    pub fn units(&self) -> Vec<UnitId> {
        let mut units: Vec<_> = self.units.keys().copied().collect();
        units.sort_unstable();
        units
    }
}

/// One Modbus unit reached through a shared [`TransportSession`].
///
/// ```no_run
/// # use modbus_tcp_master::prelude::*;
/// # async fn docs() -> Result<(), Error> {
/// let endpoint = Endpoint::new("10.0.0.5", 502);
/// let session = TransportSession::open(endpoint.clone(), SessionConfig::default());
///
/// let meter = Device::attach(&session, DeviceSettings::new(endpoint, UnitId::new(1)?))?;
/// let power = meter.read_holding_registers(0, 2).await?;
/// # Ok(())
/// # }
/// ```
///
/// A `Device` is the sole owner of its unit id on the session, so it is not
/// `Clone`; share it by reference.
#[derive(Debug)]
pub struct Device {
    name: String,
    unit_id: UnitId,
    blocks: Vec<RegisterBlock>,
    session: TransportSession,
}

impl Device {
    /// Registers the unit on `session`. A unit id may only be attached once per
    /// session.
    pub fn attach(session: &TransportSession, settings: DeviceSettings) -> Result<Device, Error> {
        session.with_registry(|registry| registry.register(settings.unit_id))?;

        info!(
            "Attached `{}` as unit {} on {} with {} register block(s)",
            settings.name,
            settings.unit_id,
            session.endpoint(),
            settings.registers.len()
        );

        Ok(Device {
            name: settings.name,
            unit_id: settings.unit_id,
            blocks: settings.registers,
            session: session.clone(),
        })
    }

    /// Releases the unit id; its cached values are discarded.
    pub fn detach(self) {
        self.session
            .with_registry(|registry| registry.unregister(self.unit_id));
        debug!("Detached `{}`", self.name);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn unit_id(&self) -> UnitId {
        self.unit_id
    }

    pub fn endpoint(&self) -> &Endpoint {
        self.session.endpoint()
    }

    pub fn session(&self) -> &TransportSession {
        &self.session
    }

    pub fn blocks(&self) -> &[RegisterBlock] {
        &self.blocks
    }

    /// Ids of this unit's transactions still awaiting a response.
    pub fn pending(&self) -> Vec<TransactionId> {
        self.session.pending_for(self.unit_id.get())
    }

    pub fn cached(&self, table: Table, address: Address) -> Option<RegisterValue> {
        self.session.with_registry(|registry| {
            registry
                .cache(self.unit_id)
                .and_then(|cache| cache.get(table, address))
        })
    }

    /// Cached values of the named block.
    pub fn block(&self, name: &str) -> Option<Vec<Option<RegisterValue>>> {
        let block = self.blocks.iter().find(|block| block.name == name)?;

        self.session.with_registry(|registry| {
            let cache = registry.cache(self.unit_id)?;
            Some(cache.range(block.table, block.address, block.count))
        })
    }

    /// Reads every configured block, refreshing the cache. All blocks are
    /// attempted; the first failure is returned.
    pub async fn update(&self) -> Result<(), Error> {
        let mut failure = None;

        for block in &self.blocks {
            let request = block.table.read_request(block.address, block.count);
            if let Err(err) = self.execute(request).await {
                warn!("Polling `{}` block `{}` failed: {err}", self.name, block.name);
                failure.get_or_insert(err);
            }
        }

        failure.map_or(Ok(()), Err)
    }
}

impl Client for Device {
    async fn execute(&self, request: Request) -> Result<Response, Error> {
        request.validate()?;
        let payload = request.payload()?;

        let handle = self
            .session
            .transactions()
            .submit(
                self.unit_id.get(),
                request.function_code().code(),
                &payload,
                self.session.config().response_timeout,
            )
            .await?;

        let pdu = handle.wait().await?;
        let response = Response::decode(&request, &pdu)?;

        self.session
            .with_registry(|registry| registry.record(self.unit_id, &request, &response));

        Ok(response)
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;
    use crate::core::config::{Backoff, SessionConfig};
    use crate::core::modbus::{AddressViolation, ConnectionState, EmulatedServer, ExceptionCode};

    fn init() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn config() -> SessionConfig {
        SessionConfig {
            response_timeout: Duration::from_millis(200),
            retry_limit: 1,
            retry_backoff: Backoff::Fixed { delay_ms: 10 },
            ..SessionConfig::default()
        }
    }

    async fn setup() -> (EmulatedServer, TransportSession) {
        init();

        let server = EmulatedServer::bind("127.0.0.1:0")
            .await
            .expect("Must bind to a port");
        let session = TransportSession::open(server.endpoint(), config());
        session
            .wait_for(ConnectionState::Connected)
            .await
            .expect("Must connect");

        (server, session)
    }

    fn unit(id: u8) -> UnitId {
        UnitId::new(id).expect("Must be a valid unit id")
    }

    fn settings(session: &TransportSession, id: u8) -> DeviceSettings {
        DeviceSettings::new(session.endpoint().clone(), unit(id))
    }

    #[tokio::test]
    async fn reads_and_writes_every_table() {
        let (server, session) = setup().await;
        server.with_unit(2, |tables| {
            tables.discrete_inputs[4] = true;
            tables.input_registers[10] = 0x0BAD;
        });

        let device = Device::attach(&session, settings(&session, 2)).expect("Must attach");

        device
            .write_multiple_registers(0, &[1, 2, 3])
            .await
            .expect("Must write registers");
        device
            .write_single_register(3, 4)
            .await
            .expect("Must write register");
        assert_eq!(
            device.read_holding_registers(0, 4).await.expect("Must read"),
            vec![1, 2, 3, 4]
        );

        device
            .write_multiple_coils(0, &[true, false, true])
            .await
            .expect("Must write coils");
        device.write_single_coil(1, true).await.expect("Must write coil");
        assert_eq!(
            device.read_coils(0, 3).await.expect("Must read"),
            vec![true, true, true]
        );

        assert_eq!(
            device.read_discrete_inputs(3, 2).await.expect("Must read"),
            vec![false, true]
        );
        assert_eq!(
            device.read_input_registers(10, 1).await.expect("Must read"),
            vec![0x0BAD]
        );

        assert_eq!(server.with_unit(2, |tables| tables.holding_registers[3]), 4);
        assert_eq!(
            device.cached(Table::InputRegisters, 10),
            Some(RegisterValue::Word(0x0BAD))
        );
        assert_eq!(device.cached(Table::Coils, 1), Some(RegisterValue::Bit(true)));

        session.close();
    }

    #[tokio::test]
    async fn units_share_one_session() {
        let (server, session) = setup().await;
        server.with_unit(1, |tables| tables.holding_registers[0] = 100);
        server.with_unit(2, |tables| tables.holding_registers[0] = 200);

        let first = Device::attach(&session, settings(&session, 1)).expect("Must attach");
        let second = Device::attach(&session, settings(&session, 2)).expect("Must attach");

        let (a, b) = tokio::join!(
            first.read_holding_registers(0, 1),
            second.read_holding_registers(0, 1)
        );
        assert_eq!(a.expect("Must read"), vec![100]);
        assert_eq!(b.expect("Must read"), vec![200]);

        assert!(first.pending().is_empty());
        assert!(matches!(
            Device::attach(&session, settings(&session, 1)),
            Err(Error::DuplicateUnit(1))
        ));

        first.detach();
        let again = Device::attach(&session, settings(&session, 1)).expect("Must reattach");
        assert_eq!(again.cached(Table::HoldingRegisters, 0), None);
        assert_eq!(
            again.read_holding_registers(0, 1).await.expect("Must read"),
            vec![100]
        );

        session.close();
    }

    #[tokio::test]
    async fn out_of_range_requests_are_refused_locally() {
        let (server, session) = setup().await;
        let device = Device::attach(&session, settings(&session, 1)).expect("Must attach");

        assert!(matches!(
            device.read_holding_registers(0, 126).await,
            Err(Error::InvalidAddress(AddressViolation::Quantity { quantity: 126, max: 125 }))
        ));
        assert!(matches!(
            device.read_coils(65535, 2).await,
            Err(Error::InvalidAddress(AddressViolation::Range { .. }))
        ));
        assert_eq!(server.requests_seen(), 0);

        // In range for the protocol, but past the end of the emulated tables.
        assert!(matches!(
            device.read_input_registers(100, 1).await,
            Err(Error::Exception(ExceptionCode::IllegalDataAddress))
        ));
        assert_eq!(server.requests_seen(), 1);

        session.close();
    }

    #[tokio::test]
    async fn update_fills_configured_blocks() {
        let (server, session) = setup().await;
        server.with_unit(7, |tables| {
            tables.holding_registers[4] = 0x1111;
            tables.holding_registers[5] = 0x2222;
            tables.coils[0] = true;
        });

        let device = Device::attach(
            &session,
            settings(&session, 7)
                .named("boiler")
                .with_block(RegisterBlock {
                    name: "setpoint".into(),
                    table: Table::HoldingRegisters,
                    address: 4,
                    count: 2,
                })
                .with_block(RegisterBlock {
                    name: "pump".into(),
                    table: Table::Coils,
                    address: 0,
                    count: 1,
                }),
        )
        .expect("Must attach");

        assert_eq!(device.block("setpoint"), Some(vec![None, None]));
        device.update().await.expect("Must update");

        assert_eq!(
            device.block("setpoint"),
            Some(vec![
                Some(RegisterValue::Word(0x1111)),
                Some(RegisterValue::Word(0x2222))
            ])
        );
        assert_eq!(device.block("pump"), Some(vec![Some(RegisterValue::Bit(true))]));
        assert_eq!(device.block("missing"), None);

        session.close();
    }

    #[tokio::test]
    async fn silent_unit_times_out_after_the_retry_limit() {
        let (server, session) = setup().await;
        server.set_silent(true);

        let device = Device::attach(&session, settings(&session, 1)).expect("Must attach");
        assert!(matches!(
            device.read_holding_registers(0, 1).await,
            Err(Error::TransactionTimeout)
        ));

        // One request plus `retry_limit` retransmissions.
        assert_eq!(server.requests_seen(), 2);
        assert!(device.pending().is_empty());

        session.close();
    }

    #[tokio::test]
    async fn dropped_clients_lose_pending_requests() {
        let (server, session) = setup().await;
        server.set_silent(true);

        let device = Device::attach(&session, settings(&session, 1)).expect("Must attach");
        let handle = session
            .transactions()
            .submit(1, 0x03, &[0x00, 0x00, 0x00, 0x01], Duration::from_secs(5))
            .await
            .expect("Must submit");
        assert_eq!(device.pending().len(), 1);

        tokio::time::sleep(Duration::from_millis(50)).await;
        server.disconnect_clients();

        assert!(matches!(handle.wait().await, Err(Error::ConnectionLost)));
        assert!(device.pending().is_empty());

        session.close();
    }

    #[test]
    fn writes_land_in_the_cache() {
        let mut registry = DeviceRegistry::new();
        registry.register(unit(3)).expect("Must register");
        assert!(matches!(registry.register(unit(3)), Err(Error::DuplicateUnit(3))));

        let request = Request::WriteMultipleCoils(10, vec![true, false]);
        registry.record(unit(3), &request, &Response::WriteMultipleCoils(10, 2));

        let cache = registry.cache(unit(3)).expect("Must have a cache");
        assert_eq!(
            cache.range(Table::Coils, 10, 3),
            vec![Some(RegisterValue::Bit(true)), Some(RegisterValue::Bit(false)), None]
        );
        assert_eq!(registry.units(), vec![unit(3)]);
    }
}

use std::collections::HashMap;
use std::io::Cursor;
use std::net::SocketAddr;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use byteorder::{BigEndian, ReadBytesExt};
use futures_util::sink::SinkExt;
use log::{debug, error, trace, warn};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::{watch, Notify};
use tokio_stream::StreamExt;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::core::config::Endpoint;

use super::{
    binary, Address, Error, ExceptionCode, Frame, FunctionCode, MbapCodec, Pdu, Quantity, Value,
    COIL_OFF, COIL_ON, MAX_READ_BITS, MAX_READ_REGISTERS, MAX_WRITE_COILS, MAX_WRITE_REGISTERS,
};

pub const DEFAULT_TABLE_SIZE: usize = 64;

/// The four data tables of one emulated unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataTables {
    pub coils: Vec<bool>,
    pub discrete_inputs: Vec<bool>,
    pub holding_registers: Vec<Value>,
    pub input_registers: Vec<Value>,
}

impl Default for DataTables {
    fn default() -> Self {
        DataTables::with_size(DEFAULT_TABLE_SIZE)
    }
}

fn span(len: usize, addr: Address, quant: Quantity) -> Result<Range<usize>, ExceptionCode> {
    let range = addr as usize..addr as usize + quant as usize;
    if range.end > len {
        return Err(ExceptionCode::IllegalDataAddress);
    }
    Ok(range)
}

fn quantity(quant: Quantity, max: Quantity) -> Result<Quantity, ExceptionCode> {
    if quant < 1 || quant > max {
        return Err(ExceptionCode::IllegalDataValue);
    }
    Ok(quant)
}

impl DataTables {
    pub fn with_size(size: usize) -> DataTables {
        DataTables {
            coils: vec![false; size],
            discrete_inputs: vec![false; size],
            holding_registers: vec![0; size],
            input_registers: vec![0; size],
        }
    }

    /// Answers one request PDU, producing an exception PDU for anything the
    /// tables cannot serve.
    pub fn handle(&mut self, request: &Pdu) -> Pdu {
        let Some(function) = FunctionCode::from_code(request.function) else {
            return Pdu::exception(request.function, ExceptionCode::IllegalFunction);
        };

        match self.apply(function, &request.data) {
            Ok(data) => Pdu::new(request.function, data),
            Err(code) => {
                debug!("Answering {function:?} with {code:?}");
                Pdu::exception(request.function, code)
            }
        }
    }

    fn apply(&mut self, function: FunctionCode, data: &[u8]) -> Result<Vec<u8>, ExceptionCode> {
        let mut rdr = Cursor::new(data);
        let addr = rdr
            .read_u16::<BigEndian>()
            .map_err(|_| ExceptionCode::IllegalDataValue)?;
        let operand = rdr
            .read_u16::<BigEndian>()
            .map_err(|_| ExceptionCode::IllegalDataValue)?;

        match function {
            FunctionCode::ReadCoils => read_bits(&self.coils, addr, operand),
            FunctionCode::ReadDiscreteInputs => read_bits(&self.discrete_inputs, addr, operand),
            FunctionCode::ReadHoldingRegisters => read_words(&self.holding_registers, addr, operand),
            FunctionCode::ReadInputRegisters => read_words(&self.input_registers, addr, operand),
            FunctionCode::WriteSingleCoil => {
                let state = match operand {
                    COIL_ON => true,
                    COIL_OFF => false,
                    _ => return Err(ExceptionCode::IllegalDataValue),
                };
                let range = span(self.coils.len(), addr, 1)?;
                self.coils[range.start] = state;
                Ok(data[..4].to_vec())
            }
            FunctionCode::WriteSingleRegister => {
                let range = span(self.holding_registers.len(), addr, 1)?;
                self.holding_registers[range.start] = operand;
                Ok(data[..4].to_vec())
            }
            FunctionCode::WriteMultipleCoils => {
                let quant = quantity(operand, MAX_WRITE_COILS)?;
                let bytes = counted(&mut rdr, data, (quant as usize + 7) / 8)?;
                let range = span(self.coils.len(), addr, quant)?;
                self.coils[range].copy_from_slice(&binary::unpack_bits(bytes, quant));
                Ok(data[..4].to_vec())
            }
            FunctionCode::WriteMultipleRegisters => {
                let quant = quantity(operand, MAX_WRITE_REGISTERS)?;
                let bytes = counted(&mut rdr, data, quant as usize * 2)?;
                let range = span(self.holding_registers.len(), addr, quant)?;
                let values =
                    binary::unpack_words(bytes).map_err(|_| ExceptionCode::IllegalDataValue)?;
                self.holding_registers[range].copy_from_slice(&values);
                Ok(data[..4].to_vec())
            }
        }
    }
}

/// The byte-counted tail of a multiple write, which must hold exactly `expected`
/// bytes.
fn counted<'a>(
    rdr: &mut Cursor<&[u8]>,
    data: &'a [u8],
    expected: usize,
) -> Result<&'a [u8], ExceptionCode> {
    let count = rdr.read_u8().map_err(|_| ExceptionCode::IllegalDataValue)? as usize;
    let bytes = &data[5..];

    if count != expected || bytes.len() != count {
        return Err(ExceptionCode::IllegalDataValue);
    }
    Ok(bytes)
}

fn read_bits(table: &[bool], addr: Address, quant: Quantity) -> Result<Vec<u8>, ExceptionCode> {
    let quant = quantity(quant, MAX_READ_BITS)?;
    let range = span(table.len(), addr, quant)?;

    let bytes = binary::pack_bits(&table[range]);
    let mut reply = vec![bytes.len() as u8];
    reply.extend(bytes);
    Ok(reply)
}

fn read_words(table: &[Value], addr: Address, quant: Quantity) -> Result<Vec<u8>, ExceptionCode> {
    let quant = quantity(quant, MAX_READ_REGISTERS)?;
    let range = span(table.len(), addr, quant)?;

    let bytes = binary::pack_words(&table[range]);
    let mut reply = vec![bytes.len() as u8];
    reply.extend(bytes);
    Ok(reply)
}

#[derive(Debug)]
struct ServerShared {
    units: Mutex<HashMap<u8, DataTables>>,
    silent: AtomicBool,
    requests: AtomicUsize,
    kick: watch::Sender<u64>,
}

impl ServerShared {
    fn units(&self) -> MutexGuard<'_, HashMap<u8, DataTables>> {
        self.units.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn answer(&self, request: Frame) -> Option<Frame> {
        self.requests.fetch_add(1, Ordering::SeqCst);

        if self.silent.load(Ordering::SeqCst) {
            trace!("Swallowing TxnID={}", request.transaction_id());
            return None;
        }

        let reply = self
            .units()
            .entry(request.unit_id())
            .or_default()
            .handle(&request.pdu);

        Some(Frame::new(
            request.transaction_id(),
            request.unit_id(),
            reply.function,
            reply.data,
        ))
    }
}

/// A Modbus TCP server backed by in-memory tables, one set per unit id.
///
/// Unit tables are created on first use with [`DEFAULT_TABLE_SIZE`] entries each.
///
/// ```no_run
/// # use modbus_tcp_master::prelude::*;
/// # async fn docs() -> Result<(), Error> {
/// let server = EmulatedServer::bind("127.0.0.1:0").await?;
/// server.with_unit(1, |tables| tables.holding_registers[0] = 0x1234);
/// println!("Serving on {}", server.endpoint());
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct EmulatedServer {
    local_addr: SocketAddr,
    shared: Arc<ServerShared>,
    cancel: Arc<Notify>,
}

impl EmulatedServer {
    pub async fn bind(addr: impl ToSocketAddrs) -> Result<EmulatedServer, Error> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;

        let (kick, _) = watch::channel(0);
        let shared = Arc::new(ServerShared {
            units: Mutex::new(HashMap::new()),
            silent: AtomicBool::new(false),
            requests: AtomicUsize::new(0),
            kick,
        });
        let cancel = Arc::new(Notify::new());

        tokio::spawn(EmulatedServer::accept(
            listener,
            Arc::clone(&shared),
            Arc::clone(&cancel),
        ));

        debug!("Emulated server listening on {local_addr}");
        Ok(EmulatedServer {
            local_addr,
            shared,
            cancel,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.local_addr.ip().to_string(), self.local_addr.port())
    }

    pub fn with_unit<R>(&self, unit_id: u8, f: impl FnOnce(&mut DataTables) -> R) -> R {
        f(self.shared.units().entry(unit_id).or_default())
    }

    /// While silent, requests are counted but never answered.
    pub fn set_silent(&self, silent: bool) {
        self.shared.silent.store(silent, Ordering::SeqCst);
    }

    pub fn requests_seen(&self) -> usize {
        self.shared.requests.load(Ordering::SeqCst)
    }

    /// Drops every open client connection. The listener stays up.
    pub fn disconnect_clients(&self) {
        self.shared.kick.send_modify(|generation| *generation += 1);
    }

    pub fn shutdown(&self) {
        self.cancel.notify_one();
        self.disconnect_clients();
    }

    async fn accept(listener: TcpListener, shared: Arc<ServerShared>, cancel: Arc<Notify>) {
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!("Accepted client {peer}");
                        tokio::spawn(EmulatedServer::serve(stream, Arc::clone(&shared)));
                    }
                    Err(err) => error!("Accepting a client failed: {err}"),
                },
                _ = cancel.notified() => break,
            }
        }

        debug!("Emulated server stopped accepting");
    }

    async fn serve(stream: TcpStream, shared: Arc<ServerShared>) {
        let mut kicked = shared.kick.subscribe();
        kicked.borrow_and_update();

        let (read, write) = stream.into_split();
        let mut frames = FramedRead::new(read, MbapCodec);
        let mut sink = FramedWrite::new(write, MbapCodec);

        loop {
            tokio::select! {
                frame = frames.next() => match frame {
                    Some(Ok(request)) => {
                        let Some(reply) = shared.answer(request) else {
                            continue;
                        };
                        if let Err(err) = sink.send(reply).await {
                            warn!("Replying to client failed: {err}");
                            break;
                        }
                    }
                    Some(Err(err)) => {
                        warn!("Client stream failed: {err}");
                        break;
                    }
                    None => break,
                },
                _ = kicked.changed() => {
                    debug!("Disconnecting client");
                    break;
                }
            }
        }
    }
}

impl Drop for EmulatedServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn read(function: u8, addr: Address, quant: Quantity) -> Pdu {
        let [a, b] = addr.to_be_bytes();
        let [c, d] = quant.to_be_bytes();
        Pdu::new(function, vec![a, b, c, d])
    }

    #[test]
    fn reads_pack_bits_and_words() {
        let mut tables = DataTables::default();
        tables.coils[1] = true;
        tables.coils[8] = true;
        tables.input_registers[3] = 0xBEEF;

        assert_eq!(
            tables.handle(&read(0x01, 0, 9)),
            Pdu::new(0x01, vec![0x02, 0b0000_0010, 0b0000_0001])
        );
        assert_eq!(
            tables.handle(&read(0x04, 3, 1)),
            Pdu::new(0x04, vec![0x02, 0xBE, 0xEF])
        );
    }

    #[test]
    fn writes_echo_and_persist() {
        let mut tables = DataTables::default();

        let write = Pdu::new(0x10, vec![0x00, 0x02, 0x00, 0x02, 0x04, 0x00, 0x0A, 0x01, 0x02]);
        assert_eq!(
            tables.handle(&write),
            Pdu::new(0x10, vec![0x00, 0x02, 0x00, 0x02])
        );
        assert_eq!(&tables.holding_registers[2..4], &[0x000A, 0x0102]);

        let coil = Pdu::new(0x05, vec![0x00, 0x07, 0xFF, 0x00]);
        assert_eq!(tables.handle(&coil), coil);
        assert!(tables.coils[7]);
    }

    #[test]
    fn out_of_table_requests_raise_exceptions() {
        let mut tables = DataTables::default();

        assert_eq!(
            tables.handle(&read(0x03, 60, 10)),
            Pdu::exception(0x03, ExceptionCode::IllegalDataAddress)
        );
        assert_eq!(
            tables.handle(&read(0x03, 0, 0)),
            Pdu::exception(0x03, ExceptionCode::IllegalDataValue)
        );
        assert_eq!(
            tables.handle(&Pdu::new(0x2B, vec![0x0E, 0x01, 0x00])),
            Pdu::exception(0x2B, ExceptionCode::IllegalFunction)
        );
        assert_eq!(
            tables.handle(&Pdu::new(0x05, vec![0x00, 0x01, 0x12, 0x34])),
            Pdu::exception(0x05, ExceptionCode::IllegalDataValue)
        );
    }

    #[test]
    fn byte_count_must_match_quantity() {
        let mut tables = DataTables::default();

        let short = Pdu::new(0x0F, vec![0x00, 0x00, 0x00, 0x0A, 0x01, 0xFF]);
        assert_eq!(
            tables.handle(&short),
            Pdu::exception(0x0F, ExceptionCode::IllegalDataValue)
        );
        assert!(tables.coils.iter().all(|coil| !coil));
    }
}

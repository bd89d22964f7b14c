use super::{Address, Error, Quantity, Request, Response, Value};

/// Register-level access to one Modbus unit.
///
/// Implementors only provide [`Client::execute`]; the typed helpers translate
/// each operation into its function code and unpack the matching response.
#[allow(async_fn_in_trait)]
pub trait Client {
    async fn execute(&self, request: Request) -> Result<Response, Error>;

    async fn read_coils(&self, addr: Address, quant: Quantity) -> Result<Vec<bool>, Error> {
        match self.execute(Request::ReadCoils(addr, quant)).await? {
            Response::Coils(states) => Ok(states),
            _ => Err(Error::InvalidResponse),
        }
    }

    async fn read_discrete_inputs(
        &self,
        addr: Address,
        quant: Quantity,
    ) -> Result<Vec<bool>, Error> {
        match self.execute(Request::ReadDiscreteInputs(addr, quant)).await? {
            Response::DiscreteInputs(states) => Ok(states),
            _ => Err(Error::InvalidResponse),
        }
    }

    async fn read_holding_registers(
        &self,
        addr: Address,
        quant: Quantity,
    ) -> Result<Vec<Value>, Error> {
        match self.execute(Request::ReadHoldingRegisters(addr, quant)).await? {
            Response::HoldingRegisters(values) => Ok(values),
            _ => Err(Error::InvalidResponse),
        }
    }

    async fn read_input_registers(
        &self,
        addr: Address,
        quant: Quantity,
    ) -> Result<Vec<Value>, Error> {
        match self.execute(Request::ReadInputRegisters(addr, quant)).await? {
            Response::InputRegisters(values) => Ok(values),
            _ => Err(Error::InvalidResponse),
        }
    }

    async fn write_single_coil(&self, addr: Address, state: bool) -> Result<(), Error> {
        self.execute(Request::WriteSingleCoil(addr, state)).await?;
        Ok(())
    }

    async fn write_single_register(&self, addr: Address, value: Value) -> Result<(), Error> {
        self.execute(Request::WriteSingleRegister(addr, value)).await?;
        Ok(())
    }

    async fn write_multiple_coils(&self, addr: Address, states: &[bool]) -> Result<(), Error> {
        self.execute(Request::WriteMultipleCoils(addr, states.to_vec()))
            .await?;
        Ok(())
    }

    async fn write_multiple_registers(&self, addr: Address, values: &[Value]) -> Result<(), Error> {
        self.execute(Request::WriteMultipleRegisters(addr, values.to_vec()))
            .await?;
        Ok(())
    }
}

//! Named point registry and typed read/write access
//!
//! Devices and their points are created once from configuration and are
//! immutable afterwards. Names resolve eagerly to a [`PointId`] handle, so a
//! misspelled point is a setup-time error rather than a surprise mid-cycle.

use std::collections::{HashMap, HashSet};

use thiserror::Error;

use crate::modbus::bus::{Bus, BusError};
use crate::modbus::frame::{function, Frame};

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("unknown point '{0}'")]
    UnknownPoint(String),

    #[error("slave address {0} out of range (must be 1-247)")]
    InvalidSlave(u8),

    #[error("duplicate point name '{0}'")]
    DuplicateName(String),

    #[error("slave {slave} {kind:?} offset {offset} already mapped")]
    AddressInUse {
        slave: u8,
        kind: PointKind,
        offset: u16,
    },

    #[error("point '{0}' is not a coil")]
    NotACoil(String),

    #[error("point '{0}' is not a holding register")]
    NotARegister(String),

    #[error(transparent)]
    Bus(#[from] BusError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PointKind {
    Coil,
    DiscreteInput,
    HoldingRegister,
}

/// One addressable value on the bus.
#[derive(Clone, Debug)]
pub struct Point {
    pub slave: u8,
    pub kind: PointKind,
    pub offset: u16,
    /// Interpret the register as a signed 16-bit quantity.
    pub signed: bool,
}

/// Handle to a resolved point; cheap to copy, valid for the process lifetime.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PointId(usize);

/// A sampled point value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Value {
    Bool(bool),
    Analog(i32),
}

impl Value {
    pub fn as_analog(self) -> i32 {
        match self {
            Value::Bool(b) => b as i32,
            Value::Analog(v) => v,
        }
    }

    pub fn is_on(self) -> bool {
        match self {
            Value::Bool(b) => b,
            Value::Analog(v) => v != 0,
        }
    }
}

struct PointEntry {
    name: String,
    point: Point,
}

/// The name-to-point mapping, pure data with no bus attached.
///
/// Built up from configuration; validation (address ranges, duplicates)
/// happens here so `check-config` can run it without opening a serial port.
#[derive(Default)]
pub struct PointTable {
    entries: Vec<PointEntry>,
    by_name: HashMap<String, PointId>,
    by_address: HashSet<(u8, PointKind, u16)>,
}

impl PointTable {
    pub fn new() -> Self {
        PointTable::default()
    }

    /// Register a point under `device.point` naming. The qualified name must
    /// be unique, as must the (slave, kind, offset) address.
    pub fn add_point(
        &mut self,
        device: &str,
        name: &str,
        point: Point,
    ) -> Result<PointId, RegistryError> {
        if point.slave == 0 || point.slave > 247 {
            return Err(RegistryError::InvalidSlave(point.slave));
        }

        let qualified = format!("{}.{}", device, name);
        if self.by_name.contains_key(&qualified) {
            return Err(RegistryError::DuplicateName(qualified));
        }
        if !self.by_address.insert((point.slave, point.kind, point.offset)) {
            return Err(RegistryError::AddressInUse {
                slave: point.slave,
                kind: point.kind,
                offset: point.offset,
            });
        }

        let id = PointId(self.entries.len());
        self.by_name.insert(qualified.clone(), id);
        self.entries.push(PointEntry {
            name: qualified,
            point,
        });
        Ok(id)
    }

    /// Resolve a `device.point` name to its handle.
    pub fn resolve(&self, qualified: &str) -> Result<PointId, RegistryError> {
        self.by_name
            .get(qualified)
            .copied()
            .ok_or_else(|| RegistryError::UnknownPoint(qualified.to_string()))
    }

    pub fn point(&self, id: PointId) -> &Point {
        &self.entries[id.0].point
    }

    pub fn name(&self, id: PointId) -> &str {
        &self.entries[id.0].name
    }
}

/// Typed bus access to registered points.
pub struct Registry {
    bus: Bus,
    table: PointTable,
}

impl Registry {
    pub fn new(bus: Bus, table: PointTable) -> Self {
        Registry { bus, table }
    }

    pub fn table(&self) -> &PointTable {
        &self.table
    }

    pub fn point(&self, id: PointId) -> &Point {
        self.table.point(id)
    }

    pub fn name(&self, id: PointId) -> &str {
        self.table.name(id)
    }

    /// Read the current value of a point, one bus transaction.
    pub fn read(&self, id: PointId) -> Result<Value, RegistryError> {
        let point = self.table.point(id);
        match point.kind {
            PointKind::Coil => self.read_bit(point, function::READ_COILS),
            PointKind::DiscreteInput => self.read_bit(point, function::READ_DISCRETE_INPUTS),
            PointKind::HoldingRegister => self.read_register(point),
        }
    }

    /// Drive a coil on or off.
    pub fn write_coil(&self, id: PointId, on: bool) -> Result<(), RegistryError> {
        let point = self.table.point(id);
        if point.kind != PointKind::Coil {
            return Err(RegistryError::NotACoil(self.table.name(id).to_string()));
        }

        let value = if on { 0xff00 } else { 0x0000 };
        let request = Frame::request(point.slave, function::WRITE_SINGLE_COIL, point.offset, value);
        self.bus.transaction(&request)?;
        Ok(())
    }

    /// Write a holding register.
    pub fn write_register(&self, id: PointId, value: u16) -> Result<(), RegistryError> {
        let point = self.table.point(id);
        if point.kind != PointKind::HoldingRegister {
            return Err(RegistryError::NotARegister(self.table.name(id).to_string()));
        }

        let request = Frame::request(
            point.slave,
            function::WRITE_SINGLE_REGISTER,
            point.offset,
            value,
        );
        self.bus.transaction(&request)?;
        Ok(())
    }

    fn read_bit(&self, point: &Point, function_code: u8) -> Result<Value, RegistryError> {
        let request = Frame::request(point.slave, function_code, point.offset, 1);
        let reply = self.bus.transaction(&request)?;
        match reply.payload.as_slice() {
            [_byte_count, bits, ..] => Ok(Value::Bool(bits & 0x01 != 0)),
            _ => Err(self.malformed(point, &reply)),
        }
    }

    fn read_register(&self, point: &Point) -> Result<Value, RegistryError> {
        let request = Frame::request(point.slave, function::READ_HOLDING_REGISTERS, point.offset, 1);
        let reply = self.bus.transaction(&request)?;
        match reply.payload.as_slice() {
            [_byte_count, hi, lo, ..] => {
                let word = u16::from_be_bytes([*hi, *lo]);
                let value = if point.signed {
                    word as i16 as i32
                } else {
                    word as i32
                };
                Ok(Value::Analog(value))
            }
            _ => Err(self.malformed(point, &reply)),
        }
    }

    /// A reply that passed CRC but has a nonsensical payload gets the same
    /// handling as an unreachable slave: callers fall back to stale data.
    fn malformed(&self, point: &Point, reply: &Frame) -> RegistryError {
        log::warn!(
            "Malformed reply from slave {}: {}",
            point.slave,
            hex::encode(&reply.payload)
        );
        RegistryError::Bus(BusError::Unreachable(point.slave))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use super::*;
    use crate::modbus::bus::BusOptions;
    use crate::modbus::serial::{Transport, TransportError};

    #[derive(Clone, Default)]
    struct ReplayTransport {
        sent: Arc<Mutex<Vec<Vec<u8>>>>,
        replies: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    impl ReplayTransport {
        fn push_reply(&self, frame: Frame) {
            self.replies.lock().unwrap().push(frame.encode());
        }
    }

    impl Transport for ReplayTransport {
        fn send(&mut self, raw: &[u8]) -> Result<(), TransportError> {
            self.sent.lock().unwrap().push(raw.to_vec());
            Ok(())
        }

        fn read_frame(&mut self, _timeout: Duration) -> Result<Vec<u8>, TransportError> {
            let mut replies = self.replies.lock().unwrap();
            if replies.is_empty() {
                return Err(TransportError::Timeout);
            }
            Ok(replies.remove(0))
        }
    }

    fn options() -> BusOptions {
        BusOptions {
            response_timeout: Duration::from_millis(10),
            max_retries: 0,
            backoff: (Duration::from_millis(1), Duration::from_millis(2)),
            fatal_io_threshold: 5,
            check_echo: false,
        }
    }

    fn boiler_table() -> (PointTable, PointId, PointId, PointId) {
        let mut table = PointTable::new();
        let toptemp = table
            .add_point(
                "boiler",
                "toptemp",
                Point {
                    slave: 2,
                    kind: PointKind::HoldingRegister,
                    offset: 1,
                    signed: true,
                },
            )
            .unwrap();
        let heatpump = table
            .add_point(
                "boiler",
                "heatpump",
                Point {
                    slave: 2,
                    kind: PointKind::Coil,
                    offset: 0,
                    signed: false,
                },
            )
            .unwrap();
        let flow = table
            .add_point(
                "boiler",
                "flow",
                Point {
                    slave: 2,
                    kind: PointKind::DiscreteInput,
                    offset: 0,
                    signed: false,
                },
            )
            .unwrap();
        (table, toptemp, heatpump, flow)
    }

    #[test]
    fn test_resolution_and_unknown_point() {
        let (table, toptemp, ..) = boiler_table();
        assert_eq!(table.resolve("boiler.toptemp").unwrap(), toptemp);
        assert!(matches!(
            table.resolve("boiler.bottemp"),
            Err(RegistryError::UnknownPoint(name)) if name == "boiler.bottemp"
        ));
    }

    #[test]
    fn test_slave_zero_and_out_of_range_rejected() {
        let mut table = PointTable::new();
        for slave in [0u8, 248] {
            let result = table.add_point(
                "dev",
                "p",
                Point {
                    slave,
                    kind: PointKind::Coil,
                    offset: 0,
                    signed: false,
                },
            );
            assert!(matches!(result, Err(RegistryError::InvalidSlave(s)) if s == slave));
        }
    }

    #[test]
    fn test_duplicate_address_rejected() {
        let mut table = PointTable::new();
        let point = Point {
            slave: 3,
            kind: PointKind::Coil,
            offset: 5,
            signed: false,
        };
        table.add_point("a", "x", point.clone()).unwrap();
        assert!(matches!(
            table.add_point("b", "y", point),
            Err(RegistryError::AddressInUse { slave: 3, .. })
        ));
    }

    #[test]
    fn test_read_signed_register() {
        let (table, toptemp, ..) = boiler_table();
        let transport = ReplayTransport::default();
        // -2 as a signed 16-bit register
        transport.push_reply(Frame::new(
            2,
            function::READ_HOLDING_REGISTERS,
            vec![0x02, 0xff, 0xfe],
        ));
        let registry = Registry::new(Bus::new(Box::new(transport.clone()), options()), table);

        assert_eq!(registry.read(toptemp).unwrap(), Value::Analog(-2));
        let sent = transport.sent.lock().unwrap();
        assert_eq!(
            sent[0],
            Frame::request(2, function::READ_HOLDING_REGISTERS, 1, 1).encode()
        );
    }

    #[test]
    fn test_read_discrete_input() {
        let (table, _, _, flow) = boiler_table();
        let transport = ReplayTransport::default();
        transport.push_reply(Frame::new(2, function::READ_DISCRETE_INPUTS, vec![0x01, 0x01]));
        let registry = Registry::new(Bus::new(Box::new(transport), options()), table);

        assert_eq!(registry.read(flow).unwrap(), Value::Bool(true));
    }

    #[test]
    fn test_write_coil_off_request_bytes() {
        let (table, _, heatpump, _) = boiler_table();
        let transport = ReplayTransport::default();
        transport.push_reply(Frame::new(
            2,
            function::WRITE_SINGLE_COIL,
            vec![0x00, 0x00, 0x00, 0x00],
        ));
        let registry = Registry::new(Bus::new(Box::new(transport.clone()), options()), table);

        registry.write_coil(heatpump, false).unwrap();
        let sent = transport.sent.lock().unwrap();
        assert_eq!(
            sent[0],
            Frame::request(2, function::WRITE_SINGLE_COIL, 0, 0x0000).encode()
        );
    }

    #[test]
    fn test_write_register_request_bytes() {
        let (table, toptemp, ..) = boiler_table();
        let transport = ReplayTransport::default();
        // Write echo: same address and value back.
        transport.push_reply(Frame::new(
            2,
            function::WRITE_SINGLE_REGISTER,
            vec![0x00, 0x01, 0x00, 0x37],
        ));
        let registry = Registry::new(Bus::new(Box::new(transport.clone()), options()), table);

        registry.write_register(toptemp, 0x0037).unwrap();
        let sent = transport.sent.lock().unwrap();
        assert_eq!(
            sent[0],
            Frame::request(2, function::WRITE_SINGLE_REGISTER, 1, 0x0037).encode()
        );
    }

    #[test]
    fn test_write_register_to_coil_rejected() {
        let (table, _, heatpump, _) = boiler_table();
        let registry = Registry::new(
            Bus::new(Box::new(ReplayTransport::default()), options()),
            table,
        );

        assert!(matches!(
            registry.write_register(heatpump, 1),
            Err(RegistryError::NotARegister(name)) if name == "boiler.heatpump"
        ));
    }

    #[test]
    fn test_write_coil_to_input_rejected() {
        let (table, toptemp, ..) = boiler_table();
        let registry = Registry::new(
            Bus::new(Box::new(ReplayTransport::default()), options()),
            table,
        );

        assert!(matches!(
            registry.write_coil(toptemp, false),
            Err(RegistryError::NotACoil(name)) if name == "boiler.toptemp"
        ));
    }
}

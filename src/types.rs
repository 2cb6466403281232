use core::fmt;
use std::sync::Arc;

/// Completion codes used by this crate.
pub mod cc {
    /// Command completed normally.
    pub const OK: u8 = 0x00;
    /// Repository data changed while a multi-round read was in progress.
    pub const DATA_CHANGED: u8 = 0x80;
    /// Invalid or cancelled reservation id.
    pub const INVALID_RESERVATION: u8 = 0xC5;
    /// Invalid command (used by controllers that do not implement reserve).
    pub const INVALID_COMMAND: u8 = 0xC1;
    /// Requested record or data is not present.
    pub const NOT_PRESENT: u8 = 0xCB;
    /// Unspecified error.
    pub const UNSPECIFIED: u8 = 0xFF;
}

/// Address of a command target.
///
/// The local interface cannot route a bus message to its own bus address,
/// so [`SystemInterface`](Address::SystemInterface) exists as a distinct
/// variant rather than a magic target value; the connection rewrites
/// self-addressed bus messages before transmission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Address {
    /// The local management interface itself.
    SystemInterface {
        /// Channel number.
        channel: u8,
        /// Logical unit on the interface.
        lun: u8,
    },
    /// A controller reached over the management bus.
    Bus {
        /// Channel number.
        channel: u8,
        /// Logical unit on the controller.
        lun: u8,
        /// Bus address of the controller.
        target: u8,
    },
    /// A broadcast probe on the management bus.
    BusBroadcast {
        /// Channel number.
        channel: u8,
        /// Logical unit on the controller.
        lun: u8,
        /// Bus address probed.
        target: u8,
    },
}

impl Address {
    /// Shorthand for the default system interface address.
    pub fn system_interface() -> Self {
        Address::SystemInterface { channel: 0, lun: 0 }
    }

    /// Shorthand for a bus controller address on channel 0, LUN 0.
    pub fn bus(target: u8) -> Self {
        Address::Bus {
            channel: 0,
            lun: 0,
            target,
        }
    }

    /// Bus target of this address, if it has one.
    pub fn target(&self) -> Option<u8> {
        match *self {
            Address::SystemInterface { .. } => None,
            Address::Bus { target, .. } | Address::BusBroadcast { target, .. } => Some(target),
        }
    }

    /// Logical unit field.
    pub fn lun(&self) -> u8 {
        match *self {
            Address::SystemInterface { lun, .. }
            | Address::Bus { lun, .. }
            | Address::BusBroadcast { lun, .. } => lun,
        }
    }

    /// Rewrite self-addressed bus messages to the system interface.
    ///
    /// Both translation points (outgoing rewrite here, incoming broadcast
    /// normalization in the receive path) match exhaustively on the
    /// variants.
    pub(crate) fn to_send_addr(self, local_target: u8) -> Address {
        match self {
            Address::SystemInterface { .. } => self,
            Address::Bus {
                channel,
                lun,
                target,
            }
            | Address::BusBroadcast {
                channel,
                lun,
                target,
            } => {
                if target == local_target {
                    Address::SystemInterface { channel, lun }
                } else {
                    self
                }
            }
        }
    }

    /// A reply to a broadcast probe comes from a concrete controller;
    /// report it as a plain bus address.
    pub(crate) fn normalize_reply(self) -> Address {
        match self {
            Address::BusBroadcast {
                channel,
                lun,
                target,
            } => Address::Bus {
                channel,
                lun,
                target,
            },
            other => other,
        }
    }
}

/// A command payload: network function, command number, and data bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Network function of the command.
    pub netfn: u8,
    /// Command number.
    pub cmd: u8,
    /// Request data (bounded, see [`MAX_DATA_LEN`](crate::protocol::MAX_DATA_LEN)).
    pub data: Vec<u8>,
}

impl Message {
    /// Create a message.
    pub fn new(netfn: u8, cmd: u8, data: Vec<u8>) -> Self {
        Self { netfn, cmd, data }
    }
}

/// A raw command response.
#[derive(Clone, PartialEq, Eq)]
pub struct RawResponse {
    /// Completion code.
    pub completion_code: u8,
    /// Payload bytes after the completion code.
    pub data: Vec<u8>,
}

impl fmt::Debug for RawResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawResponse")
            .field(
                "completion_code",
                &format_args!("{:#04x}", self.completion_code),
            )
            .field("data_len", &self.data.len())
            .finish()
    }
}

/// A matched reply delivered to a submitter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Address the reply came from (broadcast replies are normalized to
    /// plain bus addresses).
    pub source: Address,
    /// The response itself.
    pub response: RawResponse,
}

/// Additional device support bits reported by the identify command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceSupport {
    /// Device carries sensors.
    pub sensor_device: bool,
    /// Device hosts a sensor-record repository.
    pub sensor_records: bool,
    /// Device hosts an event log.
    pub event_log: bool,
    /// Device carries FRU inventory data.
    pub fru_inventory: bool,
}

impl DeviceSupport {
    pub(crate) fn from_bits(bits: u8) -> Self {
        Self {
            sensor_device: bits & 0x01 != 0,
            sensor_records: bits & 0x02 != 0,
            event_log: bits & 0x04 != 0,
            fru_inventory: bits & 0x08 != 0,
        }
    }
}

/// Parsed response for the identify (`Get Device ID`) command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceId {
    /// Device ID (controller-defined).
    pub device_id: u8,
    /// Device revision (lower 4 bits are the revision).
    pub device_revision: u8,
    /// Controller provides device sensor records.
    pub provides_device_sdrs: bool,
    /// Firmware major revision.
    pub firmware_major: u8,
    /// Firmware minor revision.
    pub firmware_minor: u8,
    /// Protocol version as BCD (e.g. 0x02 for 2.0).
    pub protocol_version: u8,
    /// Additional device support bits.
    pub support: DeviceSupport,
    /// Manufacturer ID (24-bit, least-significant byte first).
    pub manufacturer_id: u32,
    /// Product ID.
    pub product_id: u16,
}

impl DeviceId {
    /// The identity signature used by discovery to tell "same controller,
    /// still alive" from "something new answered at this address".
    pub fn signature(&self) -> IdentitySignature {
        IdentitySignature {
            device_id: self.device_id,
            device_revision: self.device_revision,
            manufacturer_id: self.manufacturer_id,
            product_id: self.product_id,
        }
    }
}

/// Compact identity of a controller, compared across probe cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdentitySignature {
    /// Device ID.
    pub device_id: u8,
    /// Device revision.
    pub device_revision: u8,
    /// Manufacturer ID.
    pub manufacturer_id: u32,
    /// Product ID.
    pub product_id: u16,
}

/// The two record repositories a controller can host.
///
/// Both are append/erase-only collections of binary records and are
/// synchronized by the exact same engine; the kind only selects command
/// numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RepositoryKind {
    /// Sensor-description records.
    SensorRecords,
    /// Event-log records.
    EventLog,
}

/// Record type code for controller locator records.
pub const RECORD_TYPE_CONTROLLER_LOCATOR: u8 = 0x12;

/// Sentinel id naming the first record in a repository.
pub const FIRST_RECORD_ID: u16 = 0x0000;

/// Sentinel id marking the end of the record chain.
pub const END_OF_RECORDS: u16 = 0xFFFF;

/// One raw repository record: a small typed header plus opaque bytes.
///
/// `data` holds the full record including the 5-byte header, matching what
/// the controller stores; decoding the body is the record decoder's job,
/// not this crate's.
#[derive(Clone, PartialEq, Eq)]
pub struct RawRecord {
    /// Record identifier within its repository.
    pub id: u16,
    /// Record format version.
    pub version: u8,
    /// Record type code.
    pub record_type: u8,
    /// Full record bytes (header included).
    pub data: Vec<u8>,
}

impl RawRecord {
    /// Record bytes after the header.
    pub fn body(&self) -> &[u8] {
        &self.data[crate::protocol::RECORD_HEADER_LEN.min(self.data.len())..]
    }

    /// For controller locator records, the bus target they point at.
    pub fn locator_target(&self) -> Option<u8> {
        if self.record_type != RECORD_TYPE_CONTROLLER_LOCATOR {
            return None;
        }
        self.body().first().copied()
    }
}

impl fmt::Debug for RawRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawRecord")
            .field("id", &format_args!("{:#06x}", self.id))
            .field("record_type", &format_args!("{:#04x}", self.record_type))
            .field("len", &self.data.len())
            .finish()
    }
}

/// Capability flags reported in repository metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RepositoryCaps {
    /// Repository supports reservations.
    pub reserve: bool,
    /// Repository supports record deletion.
    pub delete: bool,
    /// Repository supports partial (offset) record reads.
    pub partial_read: bool,
    /// Repository has overflowed and dropped records.
    pub overflow: bool,
}

impl RepositoryCaps {
    pub(crate) fn from_bits(bits: u8) -> Self {
        Self {
            reserve: bits & 0x02 != 0,
            partial_read: bits & 0x04 != 0,
            delete: bits & 0x08 != 0,
            overflow: bits & 0x80 != 0,
        }
    }
}

/// Repository metadata returned by the info command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepositoryInfo {
    /// Repository format version.
    pub version: u8,
    /// Declared number of entries (an estimate, used as a defensive bound).
    pub entries: u16,
    /// Addition change counter.
    pub addition_counter: u32,
    /// Erase change counter.
    pub erase_counter: u32,
    /// Capability flags.
    pub caps: RepositoryCaps,
}

/// Outbound notifications produced by the domain.
///
/// Consumed from a single append-only queue; mapping them onto a host
/// resource/event model is the consumer's concern.
#[derive(Debug, Clone)]
pub enum Notification {
    /// A controller appeared (or reappeared with a new identity).
    ControllerAdded {
        /// Address of the controller.
        address: Address,
    },
    /// A controller stopped responding and was marked inactive.
    ControllerRemoved {
        /// Address of the controller.
        address: Address,
    },
    /// A repository snapshot was replaced.
    RepositoryChanged {
        /// Address of the controller hosting the repository.
        address: Address,
        /// Which repository changed.
        kind: RepositoryKind,
        /// The new ordered snapshot.
        records: Arc<Vec<RawRecord>>,
        /// Record ids present before and gone now.
        removed: Vec<u16>,
    },
    /// A controller-originated message not correlated to any request.
    Unsolicited {
        /// Address the event came from.
        address: Address,
        /// Raw event payload.
        message: Message,
    },
}

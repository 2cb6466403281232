use crate::error::{Error, Result};
use crate::types::{
    DeviceId, DeviceSupport, Message, RawResponse, RepositoryCaps, RepositoryInfo, RepositoryKind,
};

/// Network function for application commands (identify).
pub const NETFN_APP: u8 = 0x06;

/// Network function for storage commands (repositories).
pub const NETFN_STORAGE: u8 = 0x0A;

/// The reply bit set on response network functions.
pub const NETFN_RESPONSE_BIT: u8 = 0x01;

impl RepositoryKind {
    fn cmd_base(self) -> u8 {
        match self {
            RepositoryKind::SensorRecords => 0x20,
            RepositoryKind::EventLog => 0x40,
        }
    }

    pub(crate) fn info_cmd(self) -> u8 {
        self.cmd_base()
    }

    pub(crate) fn reserve_cmd(self) -> u8 {
        self.cmd_base() + 0x02
    }

    pub(crate) fn read_cmd(self) -> u8 {
        self.cmd_base() + 0x03
    }
}

/// A typed command (single request/response).
pub trait Command {
    /// Parsed output type.
    type Output;

    /// Network function for the request.
    fn netfn(&self) -> u8;

    /// Command number.
    fn cmd(&self) -> u8;

    /// Encode request payload bytes (excluding netfn/cmd framing).
    fn request_data(&self) -> Vec<u8>;

    /// Parse a raw response into the typed output.
    fn parse_response(&self, response: RawResponse) -> Result<Self::Output>;

    /// The request as a wire message.
    fn message(&self) -> Message {
        Message::new(self.netfn(), self.cmd(), self.request_data())
    }
}

fn ok_data(response: &RawResponse) -> Result<&[u8]> {
    if response.completion_code != crate::types::cc::OK {
        return Err(Error::CompletionCode {
            completion_code: response.completion_code,
        });
    }
    Ok(&response.data)
}

/// Identify command (`Get Device ID`, App netfn, cmd 0x01).
///
/// Used both as the liveness probe during discovery and to learn a
/// controller's capability bits.
#[derive(Debug, Clone, Copy)]
pub struct GetDeviceId;

impl Command for GetDeviceId {
    type Output = DeviceId;

    fn netfn(&self) -> u8 {
        NETFN_APP
    }

    fn cmd(&self) -> u8 {
        0x01
    }

    fn request_data(&self) -> Vec<u8> {
        Vec::new()
    }

    fn parse_response(&self, response: RawResponse) -> Result<Self::Output> {
        parse_device_id(ok_data(&response)?)
    }
}

/// Repository metadata query (info command for either repository kind).
#[derive(Debug, Clone, Copy)]
pub struct GetRepositoryInfo {
    /// Which repository to query.
    pub kind: RepositoryKind,
}

impl Command for GetRepositoryInfo {
    type Output = RepositoryInfo;

    fn netfn(&self) -> u8 {
        NETFN_STORAGE
    }

    fn cmd(&self) -> u8 {
        self.kind.info_cmd()
    }

    fn request_data(&self) -> Vec<u8> {
        Vec::new()
    }

    fn parse_response(&self, response: RawResponse) -> Result<Self::Output> {
        parse_repository_info(ok_data(&response)?)
    }
}

/// Acquire a reservation token for consistent multi-round reads.
#[derive(Debug, Clone, Copy)]
pub struct ReserveRepository {
    /// Which repository to reserve.
    pub kind: RepositoryKind,
}

impl Command for ReserveRepository {
    type Output = u16;

    fn netfn(&self) -> u8 {
        NETFN_STORAGE
    }

    fn cmd(&self) -> u8 {
        self.kind.reserve_cmd()
    }

    fn request_data(&self) -> Vec<u8> {
        Vec::new()
    }

    fn parse_response(&self, response: RawResponse) -> Result<Self::Output> {
        let data = ok_data(&response)?;
        if data.len() < 2 {
            return Err(Error::Protocol("reservation response too short"));
        }
        Ok(u16::from_le_bytes([data[0], data[1]]))
    }
}

/// One slice of a record, with the chain pointer to the next record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordSlice {
    /// Identifier of the record following this one (0xFFFF at the end).
    pub next_record_id: u16,
    /// The requested bytes.
    pub data: Vec<u8>,
}

/// Read `count` bytes of a record starting at `offset`.
#[derive(Debug, Clone, Copy)]
pub struct GetRecord {
    /// Which repository to read from.
    pub kind: RepositoryKind,
    /// Reservation token, or 0 when reading without one.
    pub reservation: u16,
    /// Record to read.
    pub record_id: u16,
    /// Byte offset into the record.
    pub offset: u8,
    /// Number of bytes to read.
    pub count: u8,
}

impl Command for GetRecord {
    type Output = RecordSlice;

    fn netfn(&self) -> u8 {
        NETFN_STORAGE
    }

    fn cmd(&self) -> u8 {
        self.kind.read_cmd()
    }

    fn request_data(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(6);
        data.extend_from_slice(&self.reservation.to_le_bytes());
        data.extend_from_slice(&self.record_id.to_le_bytes());
        data.push(self.offset);
        data.push(self.count);
        data
    }

    fn parse_response(&self, response: RawResponse) -> Result<Self::Output> {
        let data = ok_data(&response)?;
        if data.len() < 2 {
            return Err(Error::Protocol("record read response too short"));
        }
        Ok(RecordSlice {
            next_record_id: u16::from_le_bytes([data[0], data[1]]),
            data: data[2..].to_vec(),
        })
    }
}

pub(crate) fn parse_device_id(data: &[u8]) -> Result<DeviceId> {
    // Identify response (after completion code) is 11 bytes.
    if data.len() < 11 {
        return Err(Error::Protocol("identify response too short"));
    }

    Ok(DeviceId {
        device_id: data[0],
        device_revision: data[1] & 0x0F,
        provides_device_sdrs: data[1] & 0x80 != 0,
        firmware_major: data[2] & 0x7F,
        firmware_minor: data[3],
        protocol_version: data[4],
        support: DeviceSupport::from_bits(data[5]),
        manufacturer_id: u32::from(data[6]) | (u32::from(data[7]) << 8) | (u32::from(data[8]) << 16),
        product_id: u16::from_le_bytes([data[9], data[10]]),
    })
}

pub(crate) fn parse_repository_info(data: &[u8]) -> Result<RepositoryInfo> {
    if data.len() < 14 {
        return Err(Error::Protocol("repository info response too short"));
    }

    Ok(RepositoryInfo {
        version: data[0],
        entries: u16::from_le_bytes([data[1], data[2]]),
        // bytes 3..5 are free-space, which we do not track
        addition_counter: u32::from_le_bytes([data[5], data[6], data[7], data[8]]),
        erase_counter: u32::from_le_bytes([data[9], data[10], data[11], data[12]]),
        caps: RepositoryCaps::from_bits(data[13]),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_device_id_reads_support_bits() {
        let data = [
            0x20, 0x81, 0x02, 0x43, 0x02, 0x07, 0xA2, 0x02, 0x00, 0x01, 0x00,
        ];
        let id = parse_device_id(&data).expect("parse");
        assert_eq!(id.device_id, 0x20);
        assert_eq!(id.device_revision, 0x01);
        assert!(id.provides_device_sdrs);
        assert_eq!(id.firmware_major, 0x02);
        assert_eq!(id.firmware_minor, 0x43);
        assert_eq!(id.protocol_version, 0x02);
        assert!(id.support.sensor_device);
        assert!(id.support.sensor_records);
        assert!(id.support.event_log);
        assert!(!id.support.fru_inventory);
        assert_eq!(id.manufacturer_id, 0x0000_02A2);
        assert_eq!(id.product_id, 0x0001);
    }

    #[test]
    fn parse_repository_info_reads_counters_and_caps() {
        let mut data = vec![0x51];
        data.extend_from_slice(&12u16.to_le_bytes());
        data.extend_from_slice(&100u16.to_le_bytes());
        data.extend_from_slice(&0x11223344u32.to_le_bytes());
        data.extend_from_slice(&0x55667788u32.to_le_bytes());
        data.push(0x86);

        let info = parse_repository_info(&data).expect("parse");
        assert_eq!(info.version, 0x51);
        assert_eq!(info.entries, 12);
        assert_eq!(info.addition_counter, 0x11223344);
        assert_eq!(info.erase_counter, 0x55667788);
        assert!(info.caps.reserve);
        assert!(info.caps.partial_read);
        assert!(!info.caps.delete);
        assert!(info.caps.overflow);
    }

    #[test]
    fn repository_kinds_use_disjoint_command_numbers() {
        let sensor = GetRecord {
            kind: RepositoryKind::SensorRecords,
            reservation: 0,
            record_id: 0,
            offset: 0,
            count: 5,
        };
        let log = GetRecord {
            kind: RepositoryKind::EventLog,
            ..sensor
        };
        assert_eq!(sensor.cmd(), 0x23);
        assert_eq!(log.cmd(), 0x43);
        assert_eq!(sensor.request_data(), log.request_data());
    }

    #[test]
    fn get_record_encodes_reservation_and_window() {
        let cmd = GetRecord {
            kind: RepositoryKind::SensorRecords,
            reservation: 0xBEEF,
            record_id: 0x0102,
            offset: 5,
            count: 32,
        };
        assert_eq!(cmd.request_data(), vec![0xEF, 0xBE, 0x02, 0x01, 5, 32]);
    }

    #[test]
    fn completion_code_is_reported() {
        let response = RawResponse {
            completion_code: 0xC1,
            data: vec![],
        };
        let err = GetDeviceId.parse_response(response).expect_err("error");
        assert!(matches!(
            err,
            Error::CompletionCode {
                completion_code: 0xC1
            }
        ));
    }
}

//! SCSI command construction and response decoding
//!
//! CDB builders for the handful of SCSI Block Commands (SBC) the initiator
//! issues, sense data decoding, and device capacity parsing.

use crate::error::{IscsiError, ScsiResult};
use byteorder::{BigEndian, ByteOrder};
use std::fmt;

/// SCSI command opcodes used by the initiator
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScsiOpcode {
    ReadCapacity10 = 0x25,
    Read16 = 0x88,
    Write16 = 0x8A,
    ServiceActionIn16 = 0x9E, // READ CAPACITY 16 uses this
}

/// SERVICE ACTION IN(16) service action for READ CAPACITY(16)
pub const SA_READ_CAPACITY_16: u8 = 0x10;

/// READ CAPACITY(10) reports this when the device needs READ CAPACITY(16)
pub const READ_CAPACITY_10_OVERFLOW: u32 = 0xFFFF_FFFF;

/// Allocation length requested for READ CAPACITY(16) parameter data
pub const READ_CAPACITY_16_LEN: u32 = 32;

/// SCSI status codes
pub mod scsi_status {
    pub const GOOD: u8 = 0x00;
    pub const CHECK_CONDITION: u8 = 0x02;
    pub const CONDITION_MET: u8 = 0x04;
    pub const BUSY: u8 = 0x08;
    pub const RESERVATION_CONFLICT: u8 = 0x18;
    pub const TASK_SET_FULL: u8 = 0x28;
    pub const ACA_ACTIVE: u8 = 0x30;
    pub const TASK_ABORTED: u8 = 0x40;

    pub fn name(status: u8) -> &'static str {
        match status {
            GOOD => "GOOD",
            CHECK_CONDITION => "CHECK CONDITION",
            CONDITION_MET => "CONDITION MET",
            BUSY => "BUSY",
            RESERVATION_CONFLICT => "RESERVATION CONFLICT",
            TASK_SET_FULL => "TASK SET FULL",
            ACA_ACTIVE => "ACA ACTIVE",
            TASK_ABORTED => "TASK ABORTED",
            _ => "UNKNOWN",
        }
    }
}

/// SCSI sense key codes
pub mod sense_key {
    pub const NO_SENSE: u8 = 0x00;
    pub const RECOVERED_ERROR: u8 = 0x01;
    pub const NOT_READY: u8 = 0x02;
    pub const MEDIUM_ERROR: u8 = 0x03;
    pub const HARDWARE_ERROR: u8 = 0x04;
    pub const ILLEGAL_REQUEST: u8 = 0x05;
    pub const UNIT_ATTENTION: u8 = 0x06;
    pub const DATA_PROTECT: u8 = 0x07;
    pub const BLANK_CHECK: u8 = 0x08;
    pub const ABORTED_COMMAND: u8 = 0x0B;
    pub const VOLUME_OVERFLOW: u8 = 0x0D;
    pub const MISCOMPARE: u8 = 0x0E;

    pub fn name(key: u8) -> &'static str {
        match key {
            NO_SENSE => "NO SENSE",
            RECOVERED_ERROR => "RECOVERED ERROR",
            NOT_READY => "NOT READY",
            MEDIUM_ERROR => "MEDIUM ERROR",
            HARDWARE_ERROR => "HARDWARE ERROR",
            ILLEGAL_REQUEST => "ILLEGAL REQUEST",
            UNIT_ATTENTION => "UNIT ATTENTION",
            DATA_PROTECT => "DATA PROTECT",
            BLANK_CHECK => "BLANK CHECK",
            ABORTED_COMMAND => "ABORTED COMMAND",
            VOLUME_OVERFLOW => "VOLUME OVERFLOW",
            MISCOMPARE => "MISCOMPARE",
            _ => "UNKNOWN SENSE KEY",
        }
    }
}

/// Additional Sense Code (ASC) values
pub mod asc {
    pub const NO_ADDITIONAL_SENSE: u8 = 0x00;
    pub const INVALID_COMMAND_OPERATION_CODE: u8 = 0x20;
    pub const LBA_OUT_OF_RANGE: u8 = 0x21;
    pub const INVALID_FIELD_IN_CDB: u8 = 0x24;
    pub const LOGICAL_UNIT_NOT_SUPPORTED: u8 = 0x25;
    pub const WRITE_PROTECTED: u8 = 0x27;
    pub const POWER_ON_RESET: u8 = 0x29;
    pub const MEDIUM_NOT_PRESENT: u8 = 0x3A;
    pub const INTERNAL_TARGET_FAILURE: u8 = 0x44;
}

/// Decoded SCSI sense data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenseData {
    pub sense_key: u8,
    pub asc: u8,  // Additional Sense Code
    pub ascq: u8, // Additional Sense Code Qualifier
}

impl SenseData {
    pub fn new(sense_key: u8, asc: u8, ascq: u8) -> Self {
        SenseData { sense_key, asc, ascq }
    }

    /// Parse fixed (0x70/0x71) or descriptor (0x72/0x73) format sense data
    pub fn parse(data: &[u8]) -> Option<Self> {
        let response_code = *data.first()? & 0x7F;
        match response_code {
            0x70 | 0x71 if data.len() >= 14 => {
                Some(SenseData::new(data[2] & 0x0F, data[12], data[13]))
            }
            0x72 | 0x73 if data.len() >= 4 => {
                Some(SenseData::new(data[1] & 0x0F, data[2], data[3]))
            }
            _ => None,
        }
    }
}

impl fmt::Display for SenseData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (key=0x{:02x}, asc=0x{:02x}, ascq=0x{:02x})",
            sense_key::name(self.sense_key),
            self.sense_key,
            self.asc,
            self.ascq
        )
    }
}

/// Raw outcome of one SCSI command, as returned by the transport
#[derive(Debug, Clone, Default)]
pub struct ScsiTask {
    /// Opcode of the CDB this task answers
    pub opcode: u8,
    pub status: u8,
    pub data_in: Vec<u8>,
    pub sense: Option<SenseData>,
}

impl ScsiTask {
    pub fn is_good(&self) -> bool {
        self.status == scsi_status::GOOD
    }

    /// Turn a non-GOOD status into a `Scsi` error naming the command
    pub fn check(self, what: &str) -> ScsiResult<Self> {
        if self.is_good() {
            return Ok(self);
        }
        Err(IscsiError::Scsi(describe_status(what, self.status, self.sense.as_ref())))
    }
}

/// Render a failed command's status and sense data for error messages
pub fn describe_status(what: &str, status: u8, sense: Option<&SenseData>) -> String {
    match sense {
        Some(sense) => format!(
            "{}: status {} (0x{:02x}), sense {}",
            what,
            scsi_status::name(status),
            status,
            sense
        ),
        None => format!("{}: status {} (0x{:02x})", what, scsi_status::name(status), status),
    }
}

// ============================================================================
// CDB builders
// ============================================================================

/// READ CAPACITY(10)
pub fn build_read_capacity10() -> [u8; 16] {
    let mut cdb = [0u8; 16];
    cdb[0] = ScsiOpcode::ReadCapacity10 as u8;
    cdb
}

/// READ CAPACITY(16), i.e. SERVICE ACTION IN(16) / 0x10
pub fn build_read_capacity16(alloc_len: u32) -> [u8; 16] {
    let mut cdb = [0u8; 16];
    cdb[0] = ScsiOpcode::ServiceActionIn16 as u8;
    cdb[1] = SA_READ_CAPACITY_16;
    BigEndian::write_u32(&mut cdb[10..14], alloc_len);
    cdb
}

/// READ(16): 64-bit LBA, 32-bit transfer length in blocks
pub fn build_read16(lba: u64, blocks: u32) -> [u8; 16] {
    let mut cdb = [0u8; 16];
    cdb[0] = ScsiOpcode::Read16 as u8;
    BigEndian::write_u64(&mut cdb[2..10], lba);
    BigEndian::write_u32(&mut cdb[10..14], blocks);
    cdb
}

/// WRITE(16): 64-bit LBA, 32-bit transfer length in blocks
pub fn build_write16(lba: u64, blocks: u32) -> [u8; 16] {
    let mut cdb = [0u8; 16];
    cdb[0] = ScsiOpcode::Write16 as u8;
    BigEndian::write_u64(&mut cdb[2..10], lba);
    BigEndian::write_u32(&mut cdb[10..14], blocks);
    cdb
}

/// Parse LBA and transfer length from a READ(16)/WRITE(16) CDB
pub fn parse_rw16_cdb(cdb: &[u8]) -> Option<(u64, u32)> {
    if cdb.len() < 16 {
        return None;
    }
    let lba = BigEndian::read_u64(&cdb[2..10]);
    let transfer_length = BigEndian::read_u32(&cdb[10..14]);
    Some((lba, transfer_length))
}

// ============================================================================
// Capacity
// ============================================================================

/// Device geometry: fixed block size and number of addressable blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capacity {
    pub block_size: u32,
    pub block_count: u64,
}

impl Capacity {
    pub fn new(block_size: u32, block_count: u64) -> Self {
        Capacity { block_size, block_count }
    }

    /// Device size in bytes, saturating at `u64::MAX`
    pub fn total_bytes(&self) -> u64 {
        (self.block_size as u64).saturating_mul(self.block_count)
    }

    /// Check that `start_block..start_block + block_count` lies on the device
    pub fn check_range(&self, start_block: u64, block_count: u64) -> ScsiResult<()> {
        match start_block.checked_add(block_count) {
            Some(end) if end <= self.block_count => Ok(()),
            _ => Err(IscsiError::OutOfBounds {
                start_block,
                block_count,
                device_blocks: self.block_count,
            }),
        }
    }

    /// Parse READ CAPACITY(10) parameter data
    ///
    /// Exactly 8 bytes: returned LBA then block length, both big-endian u32.
    /// The returned LBA addresses the last block, so the count is one more.
    /// Returns `Ok(None)` when the device is too large for this form.
    pub fn from_read_capacity10(data: &[u8]) -> ScsiResult<Option<Self>> {
        if data.len() != 8 {
            return Err(IscsiError::Protocol(format!(
                "READ CAPACITY(10) returned {} bytes, expected 8",
                data.len()
            )));
        }
        let last_lba = BigEndian::read_u32(&data[0..4]);
        let block_size = BigEndian::read_u32(&data[4..8]);
        if last_lba == READ_CAPACITY_10_OVERFLOW {
            return Ok(None);
        }
        Self::validated(block_size, last_lba as u64 + 1).map(Some)
    }

    /// Parse READ CAPACITY(16) parameter data (64-bit LBA, 32-bit block length)
    pub fn from_read_capacity16(data: &[u8]) -> ScsiResult<Self> {
        if data.len() < 12 {
            return Err(IscsiError::Protocol(format!(
                "READ CAPACITY(16) returned {} bytes, expected at least 12",
                data.len()
            )));
        }
        let last_lba = BigEndian::read_u64(&data[0..8]);
        let block_size = BigEndian::read_u32(&data[8..12]);
        let block_count = last_lba.checked_add(1).ok_or_else(|| {
            IscsiError::Protocol("READ CAPACITY(16) returned LBA 2^64-1".to_string())
        })?;
        Self::validated(block_size, block_count)
    }

    fn validated(block_size: u32, block_count: u64) -> ScsiResult<Self> {
        if block_size == 0 {
            return Err(IscsiError::Protocol(
                "device reported a block size of 0".to_string(),
            ));
        }
        if (block_size as u64).checked_mul(block_count).is_none() {
            return Err(IscsiError::Protocol(format!(
                "device size of {} blocks of {} bytes overflows u64",
                block_count, block_size
            )));
        }
        Ok(Capacity::new(block_size, block_count))
    }

    /// Encode as READ CAPACITY(10) parameter data
    pub fn to_read_capacity10(&self) -> [u8; 8] {
        let mut data = [0u8; 8];
        let last_lba = self.block_count.saturating_sub(1).min(READ_CAPACITY_10_OVERFLOW as u64);
        BigEndian::write_u32(&mut data[0..4], last_lba as u32);
        BigEndian::write_u32(&mut data[4..8], self.block_size);
        data
    }

    /// Encode as READ CAPACITY(16) parameter data
    pub fn to_read_capacity16(&self) -> [u8; 32] {
        let mut data = [0u8; 32];
        BigEndian::write_u64(&mut data[0..8], self.block_count.saturating_sub(1));
        BigEndian::write_u32(&mut data[8..12], self.block_size);
        data
    }
}

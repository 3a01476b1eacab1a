//! iSCSI PDU (Protocol Data Unit) parsing and serialization
//!
//! This module handles the binary protocol format for iSCSI PDUs
//! based on RFC 3720: https://datatracker.ietf.org/doc/html/rfc3720
//!
//! Only the initiator side is covered: builders for the PDUs an initiator
//! sends and parsers for the PDUs a target answers with.

// Protocol functions require many parameters per RFC 3720
#![allow(clippy::too_many_arguments)]

use crate::error::{IscsiError, ScsiResult};
use byteorder::{BigEndian, ByteOrder, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

/// BHS (Basic Header Segment) size in bytes
pub const BHS_SIZE: usize = 48;

/// Reserved tag value (ITT/TTT) meaning "no task"
pub const RESERVED_TAG: u32 = 0xFFFF_FFFF;

/// iSCSI PDU Opcodes (RFC 3720 Section 10)
pub mod opcode {
    // Initiator opcodes (initiator → target)
    pub const NOP_OUT: u8 = 0x00;
    pub const SCSI_COMMAND: u8 = 0x01;
    pub const LOGIN_REQUEST: u8 = 0x03;
    pub const TEXT_REQUEST: u8 = 0x04;
    pub const SCSI_DATA_OUT: u8 = 0x05;
    pub const LOGOUT_REQUEST: u8 = 0x06;

    // Target opcodes (target → initiator)
    pub const NOP_IN: u8 = 0x20;
    pub const SCSI_RESPONSE: u8 = 0x21;
    pub const LOGIN_RESPONSE: u8 = 0x23;
    pub const TEXT_RESPONSE: u8 = 0x24;
    pub const SCSI_DATA_IN: u8 = 0x25;
    pub const LOGOUT_RESPONSE: u8 = 0x26;
    pub const R2T: u8 = 0x31;
    pub const ASYNC_MESSAGE: u8 = 0x32;
    pub const REJECT: u8 = 0x3F;
}

/// iSCSI PDU flags (commonly used across PDU types)
pub mod flags {
    // Common flags
    pub const FINAL: u8 = 0x80;
    pub const CONTINUE: u8 = 0x40;

    // SCSI command flags
    pub const READ: u8 = 0x40;
    pub const WRITE: u8 = 0x20;
    pub const ATTR_SIMPLE: u8 = 0x01;

    // Data-In flags
    pub const ACK: u8 = 0x40;
    pub const OVERFLOW: u8 = 0x04;
    pub const UNDERFLOW: u8 = 0x02;
    pub const STATUS: u8 = 0x01;

    // Login flags
    pub const TRANSIT: u8 = 0x80;
    pub const CONTINUE_LOGIN: u8 = 0x40;

    // Login stages (CSG/NSG values before shifting into place)
    pub const STAGE_SECURITY_NEG: u8 = 0x00;
    pub const STAGE_LOGIN_OP_NEG: u8 = 0x01;
    pub const STAGE_FULL_FEATURE: u8 = 0x03;
}

/// Login status classes (RFC 3720 Section 10.13.5)
pub mod login_status {
    pub const SUCCESS: u8 = 0x00;
    pub const REDIRECTION: u8 = 0x01;
    pub const INITIATOR_ERROR: u8 = 0x02;
    pub const TARGET_ERROR: u8 = 0x03;
}

/// Logout reason codes
pub mod logout_reason {
    pub const CLOSE_SESSION: u8 = 0;
    pub const CLOSE_CONNECTION: u8 = 1;
}

/// Basic Header Segment (BHS) - 48 bytes
///
/// ```text
/// Byte/     0       |       1       |       2       |       3       |
///     /              |               |               |               |
///    |0 1 2 3 4 5 6 7|0 1 2 3 4 5 6 7|0 1 2 3 4 5 6 7|0 1 2 3 4 5 6 7|
///    +---------------+---------------+---------------+---------------+
///   0|.|I| Opcode    |F|  Opcode-specific fields                     |
///    +---------------+---------------+---------------+---------------+
///   4|TotalAHSLength | DataSegmentLength                             |
///    +---------------+---------------+---------------+---------------+
///   8| LUN or Opcode-specific fields                                 |
///    +                                                               +
///  12|                                                               |
///    +---------------+---------------+---------------+---------------+
///  16| Initiator Task Tag                                            |
///    +---------------+---------------+---------------+---------------+
///  20| Opcode-specific fields (28 bytes)                             |
///    +                                                               +
///  ...
///  44|                                                               |
///    +---------------+---------------+---------------+---------------+
/// ```
#[derive(Debug, Clone)]
pub struct IscsiPdu {
    /// Opcode identifies the PDU type (lower 6 bits of byte 0)
    pub opcode: u8,
    /// Immediate flag (bit 6 of byte 0)
    pub immediate: bool,
    /// Opcode-specific flags (byte 1)
    pub flags: u8,
    /// Opcode-specific bytes 2-3 (response/status, version fields)
    pub hdr: [u8; 2],
    /// Total AHS (Additional Header Segment) length (4-byte units)
    pub ahs_length: u8,
    /// Data segment length (bytes)
    pub data_length: u32,
    /// Logical Unit Number (bytes 8-15)
    pub lun: u64,
    /// Initiator Task Tag (bytes 16-19)
    pub itt: u32,
    /// Opcode-specific fields (bytes 20-47, 28 bytes)
    pub specific: [u8; 28],
    /// Data segment (variable length)
    pub data: Vec<u8>,
}

impl Default for IscsiPdu {
    fn default() -> Self {
        Self::new()
    }
}

impl IscsiPdu {
    /// Create a new empty PDU
    pub fn new() -> Self {
        IscsiPdu {
            opcode: 0,
            immediate: false,
            flags: 0,
            hdr: [0u8; 2],
            ahs_length: 0,
            data_length: 0,
            lun: 0,
            itt: 0,
            specific: [0u8; 28],
            data: Vec::new(),
        }
    }

    /// Total on-wire length of the PDU whose BHS starts `header`, or `None`
    /// if fewer than 48 bytes are available yet.
    pub fn frame_length(header: &[u8]) -> Option<usize> {
        if header.len() < BHS_SIZE {
            return None;
        }
        let ahs_bytes = (header[4] as usize) * 4;
        let data_length = BigEndian::read_u24(&header[5..8]) as usize;
        Some(BHS_SIZE + ahs_bytes + data_length.div_ceil(4) * 4)
    }

    /// Parse a PDU from bytes
    ///
    /// The input buffer must contain at least the 48-byte BHS.
    /// If the PDU has data, the buffer must also contain the data segment.
    pub fn from_bytes(buf: &[u8]) -> ScsiResult<Self> {
        if buf.len() < BHS_SIZE {
            return Err(IscsiError::InvalidPdu(format!(
                "PDU too short: {} bytes, need at least {}",
                buf.len(),
                BHS_SIZE
            )));
        }

        let mut cursor = Cursor::new(buf);

        // Byte 0: Immediate flag (bit 6) and Opcode (bits 0-5)
        let byte0 = cursor.read_u8()?;
        let immediate = (byte0 & 0x40) != 0;
        let opcode = byte0 & 0x3F;

        let flags = cursor.read_u8()?;
        let hdr = [cursor.read_u8()?, cursor.read_u8()?];

        let ahs_length = cursor.read_u8()?;
        let data_length = cursor.read_u24::<BigEndian>()?;
        let lun = cursor.read_u64::<BigEndian>()?;
        let itt = cursor.read_u32::<BigEndian>()?;

        let mut specific = [0u8; 28];
        std::io::Read::read_exact(&mut cursor, &mut specific)?;

        // Calculate total expected length (BHS + AHS + data + padding)
        let ahs_bytes = (ahs_length as usize) * 4;
        let padded_data_len = (data_length as usize).div_ceil(4) * 4;
        let total_len = BHS_SIZE + ahs_bytes + padded_data_len;

        if buf.len() < total_len {
            return Err(IscsiError::InvalidPdu(format!(
                "PDU incomplete: {} bytes, need {} (BHS={}, AHS={}, data={})",
                buf.len(),
                total_len,
                BHS_SIZE,
                ahs_bytes,
                padded_data_len
            )));
        }

        // AHS is skipped; no initiator feature here uses it
        let data_start = BHS_SIZE + ahs_bytes;
        let data = buf[data_start..data_start + data_length as usize].to_vec();

        Ok(IscsiPdu {
            opcode,
            immediate,
            flags,
            hdr,
            ahs_length,
            data_length,
            lun,
            itt,
            specific,
            data,
        })
    }

    /// Serialize PDU to bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let total_len = self.total_length();
        let mut buf = Vec::with_capacity(total_len);

        let byte0 = (if self.immediate { 0x40 } else { 0 }) | (self.opcode & 0x3F);
        buf.push(byte0);
        buf.push(self.flags);
        buf.extend_from_slice(&self.hdr);
        buf.push(self.ahs_length);

        // Writes into a Vec cannot fail
        let _ = buf.write_u24::<BigEndian>(self.data.len() as u32);
        let _ = buf.write_u64::<BigEndian>(self.lun);
        let _ = buf.write_u32::<BigEndian>(self.itt);
        buf.extend_from_slice(&self.specific);

        // AHS bytes would go here; ahs_length is always zero on send
        buf.resize(BHS_SIZE + (self.ahs_length as usize) * 4, 0);

        buf.extend_from_slice(&self.data);
        buf.resize(total_len, 0);
        buf
    }

    /// Get the opcode name for debugging
    pub fn opcode_name(&self) -> &'static str {
        match self.opcode {
            opcode::NOP_OUT => "NOP-Out",
            opcode::SCSI_COMMAND => "SCSI Command",
            opcode::LOGIN_REQUEST => "Login Request",
            opcode::TEXT_REQUEST => "Text Request",
            opcode::SCSI_DATA_OUT => "SCSI Data-Out",
            opcode::LOGOUT_REQUEST => "Logout Request",
            opcode::NOP_IN => "NOP-In",
            opcode::SCSI_RESPONSE => "SCSI Response",
            opcode::LOGIN_RESPONSE => "Login Response",
            opcode::TEXT_RESPONSE => "Text Response",
            opcode::SCSI_DATA_IN => "SCSI Data-In",
            opcode::LOGOUT_RESPONSE => "Logout Response",
            opcode::R2T => "Ready To Transfer",
            opcode::ASYNC_MESSAGE => "Async Message",
            opcode::REJECT => "Reject",
            _ => "Unknown",
        }
    }

    /// Get the total PDU length including headers and padded data
    pub fn total_length(&self) -> usize {
        let ahs_bytes = (self.ahs_length as usize) * 4;
        let padded_data_len = self.data.len().div_ceil(4) * 4;
        BHS_SIZE + ahs_bytes + padded_data_len
    }

    fn expect_opcode(&self, expected: u8) -> ScsiResult<()> {
        if self.opcode != expected {
            return Err(IscsiError::InvalidPdu(format!(
                "Expected opcode 0x{:02x}, got 0x{:02x} ({})",
                expected,
                self.opcode,
                self.opcode_name()
            )));
        }
        Ok(())
    }
}

// ============================================================================
// Login Request/Response
// ============================================================================

impl IscsiPdu {
    /// Create a Login Request PDU
    pub fn login_request(
        isid: [u8; 6],
        tsih: u16,
        itt: u32,
        cid: u16,
        cmd_sn: u32,
        exp_stat_sn: u32,
        csg: u8,
        nsg: u8,
        transit: bool,
        data: Vec<u8>,
    ) -> Self {
        let mut pdu = IscsiPdu::new();
        pdu.opcode = opcode::LOGIN_REQUEST;
        pdu.immediate = true;

        // Flags: Transit | Continue | CSG | NSG
        pdu.flags = (if transit { flags::TRANSIT } else { 0 })
            | ((csg & 0x03) << 2)
            | (nsg & 0x03);

        // Version-max / Version-min are both 0x00
        pdu.hdr = [0, 0];

        // ISID + TSIH in LUN field (bytes 8-15 of BHS)
        let mut lun_bytes = [0u8; 8];
        lun_bytes[0..6].copy_from_slice(&isid);
        lun_bytes[6..8].copy_from_slice(&tsih.to_be_bytes());
        pdu.lun = u64::from_be_bytes(lun_bytes);

        pdu.itt = itt;

        // Bytes 20-21: CID
        pdu.specific[0..2].copy_from_slice(&cid.to_be_bytes());
        // Bytes 24-27: CmdSN
        pdu.specific[4..8].copy_from_slice(&cmd_sn.to_be_bytes());
        // Bytes 28-31: ExpStatSN
        pdu.specific[8..12].copy_from_slice(&exp_stat_sn.to_be_bytes());

        pdu.data_length = data.len() as u32;
        pdu.data = data;
        pdu
    }

    /// Parse Login Response fields
    pub fn parse_login_response(&self) -> ScsiResult<LoginResponse> {
        self.expect_opcode(opcode::LOGIN_RESPONSE)?;

        let lun_bytes = self.lun.to_be_bytes();
        let tsih = BigEndian::read_u16(&lun_bytes[6..8]);

        Ok(LoginResponse {
            itt: self.itt,
            tsih,
            transit: (self.flags & flags::TRANSIT) != 0,
            csg: (self.flags >> 2) & 0x03,
            nsg: self.flags & 0x03,
            stat_sn: BigEndian::read_u32(&self.specific[4..8]),
            exp_cmd_sn: BigEndian::read_u32(&self.specific[8..12]),
            max_cmd_sn: BigEndian::read_u32(&self.specific[12..16]),
            status_class: self.specific[16],
            status_detail: self.specific[17],
            parameters: parse_text_parameters(&self.data)?,
        })
    }
}

/// Parsed Login Response
#[derive(Debug, Clone)]
pub struct LoginResponse {
    pub itt: u32,
    pub tsih: u16,
    pub transit: bool,
    pub csg: u8,
    pub nsg: u8,
    pub stat_sn: u32,
    pub exp_cmd_sn: u32,
    pub max_cmd_sn: u32,
    pub status_class: u8,
    pub status_detail: u8,
    pub parameters: Vec<(String, String)>,
}

// ============================================================================
// SCSI Command / Data / Response
// ============================================================================

impl IscsiPdu {
    /// Create a SCSI Command PDU
    ///
    /// `immediate_data` rides in the data segment; the F bit is always set,
    /// so any remaining write data is only sent in answer to R2Ts.
    pub fn scsi_command(
        lun: u64,
        itt: u32,
        cmd_sn: u32,
        exp_stat_sn: u32,
        expected_data_length: u32,
        cdb: &[u8; 16],
        read: bool,
        write: bool,
        immediate_data: Vec<u8>,
    ) -> Self {
        let mut pdu = IscsiPdu::new();
        pdu.opcode = opcode::SCSI_COMMAND;
        pdu.flags = flags::FINAL | flags::ATTR_SIMPLE;
        if read {
            pdu.flags |= flags::READ;
        }
        if write {
            pdu.flags |= flags::WRITE;
        }
        pdu.lun = lun;
        pdu.itt = itt;

        // Bytes 20-23: Expected Data Transfer Length
        pdu.specific[0..4].copy_from_slice(&expected_data_length.to_be_bytes());
        // Bytes 24-27: CmdSN
        pdu.specific[4..8].copy_from_slice(&cmd_sn.to_be_bytes());
        // Bytes 28-31: ExpStatSN
        pdu.specific[8..12].copy_from_slice(&exp_stat_sn.to_be_bytes());
        // Bytes 32-47: CDB
        pdu.specific[12..28].copy_from_slice(cdb);

        pdu.data_length = immediate_data.len() as u32;
        pdu.data = immediate_data;
        pdu
    }

    /// Create a SCSI Data-Out PDU answering an R2T
    pub fn scsi_data_out(
        lun: u64,
        itt: u32,
        ttt: u32,
        exp_stat_sn: u32,
        data_sn: u32,
        buffer_offset: u32,
        data: Vec<u8>,
        final_flag: bool,
    ) -> Self {
        let mut pdu = IscsiPdu::new();
        pdu.opcode = opcode::SCSI_DATA_OUT;
        pdu.flags = if final_flag { flags::FINAL } else { 0 };
        pdu.lun = lun;
        pdu.itt = itt;

        // Target Transfer Tag
        pdu.specific[0..4].copy_from_slice(&ttt.to_be_bytes());
        // ExpStatSN
        pdu.specific[8..12].copy_from_slice(&exp_stat_sn.to_be_bytes());
        // DataSN
        pdu.specific[16..20].copy_from_slice(&data_sn.to_be_bytes());
        // Buffer Offset
        pdu.specific[20..24].copy_from_slice(&buffer_offset.to_be_bytes());

        pdu.data_length = data.len() as u32;
        pdu.data = data;
        pdu
    }

    /// Parse SCSI Data-In PDU (data from target to initiator)
    pub fn parse_scsi_data_in(&self) -> ScsiResult<ScsiDataIn<'_>> {
        self.expect_opcode(opcode::SCSI_DATA_IN)?;

        let has_status = (self.flags & flags::STATUS) != 0;
        Ok(ScsiDataIn {
            itt: self.itt,
            final_flag: (self.flags & flags::FINAL) != 0,
            status: if has_status { Some(self.hdr[1]) } else { None },
            stat_sn: BigEndian::read_u32(&self.specific[4..8]),
            data_sn: BigEndian::read_u32(&self.specific[16..20]),
            buffer_offset: BigEndian::read_u32(&self.specific[20..24]),
            residual_count: BigEndian::read_u32(&self.specific[24..28]),
            data: &self.data,
        })
    }

    /// Parse SCSI Response PDU
    pub fn parse_scsi_response(&self) -> ScsiResult<ScsiResponsePdu> {
        self.expect_opcode(opcode::SCSI_RESPONSE)?;

        // Data segment is SenseLength (2 bytes) followed by sense data
        let sense = if self.data.len() >= 2 {
            let len = BigEndian::read_u16(&self.data[0..2]) as usize;
            let end = (2 + len).min(self.data.len());
            self.data[2..end].to_vec()
        } else {
            Vec::new()
        };

        Ok(ScsiResponsePdu {
            itt: self.itt,
            response: self.hdr[0],
            status: self.hdr[1],
            stat_sn: BigEndian::read_u32(&self.specific[4..8]),
            residual_count: BigEndian::read_u32(&self.specific[24..28]),
            sense,
        })
    }

    /// Parse R2T (Ready To Transfer) PDU
    pub fn parse_r2t(&self) -> ScsiResult<R2tPdu> {
        self.expect_opcode(opcode::R2T)?;

        Ok(R2tPdu {
            itt: self.itt,
            ttt: BigEndian::read_u32(&self.specific[0..4]),
            r2t_sn: BigEndian::read_u32(&self.specific[16..20]),
            buffer_offset: BigEndian::read_u32(&self.specific[20..24]),
            desired_length: BigEndian::read_u32(&self.specific[24..28]),
        })
    }
}

/// Parsed SCSI Data-In, borrowing the payload from the PDU
#[derive(Debug, Clone)]
pub struct ScsiDataIn<'a> {
    pub itt: u32,
    pub final_flag: bool,
    /// Present when the target collapsed the status into this PDU (S bit)
    pub status: Option<u8>,
    pub stat_sn: u32,
    pub data_sn: u32,
    pub buffer_offset: u32,
    pub residual_count: u32,
    pub data: &'a [u8],
}

/// Parsed SCSI Response
#[derive(Debug, Clone)]
pub struct ScsiResponsePdu {
    pub itt: u32,
    /// iSCSI service response, 0x00 = command completed at target
    pub response: u8,
    pub status: u8,
    pub stat_sn: u32,
    pub residual_count: u32,
    pub sense: Vec<u8>,
}

/// Parsed R2T
#[derive(Debug, Clone)]
pub struct R2tPdu {
    pub itt: u32,
    pub ttt: u32,
    pub r2t_sn: u32,
    pub buffer_offset: u32,
    pub desired_length: u32,
}

// ============================================================================
// NOP-Out/NOP-In
// ============================================================================

impl IscsiPdu {
    /// Create a NOP-Out PDU answering a target ping (NOP-In with a valid TTT)
    pub fn nop_out_reply(lun: u64, ttt: u32, cmd_sn: u32, exp_stat_sn: u32, data: Vec<u8>) -> Self {
        let mut pdu = IscsiPdu::new();
        pdu.opcode = opcode::NOP_OUT;
        pdu.immediate = true;
        pdu.flags = flags::FINAL;
        pdu.lun = lun;
        pdu.itt = RESERVED_TAG;

        pdu.specific[0..4].copy_from_slice(&ttt.to_be_bytes());
        pdu.specific[4..8].copy_from_slice(&cmd_sn.to_be_bytes());
        pdu.specific[8..12].copy_from_slice(&exp_stat_sn.to_be_bytes());

        pdu.data_length = data.len() as u32;
        pdu.data = data;
        pdu
    }

    /// Target Transfer Tag of a NOP-In; `RESERVED_TAG` means no reply wanted
    pub fn nop_in_ttt(&self) -> ScsiResult<u32> {
        self.expect_opcode(opcode::NOP_IN)?;
        Ok(BigEndian::read_u32(&self.specific[0..4]))
    }
}

// ============================================================================
// Logout Request/Response
// ============================================================================

impl IscsiPdu {
    /// Create a Logout Request PDU
    pub fn logout_request(itt: u32, reason: u8, cid: u16, cmd_sn: u32, exp_stat_sn: u32) -> Self {
        let mut pdu = IscsiPdu::new();
        pdu.opcode = opcode::LOGOUT_REQUEST;
        pdu.immediate = true;
        pdu.flags = flags::FINAL | (reason & 0x7F);
        pdu.itt = itt;

        pdu.specific[0..2].copy_from_slice(&cid.to_be_bytes());
        pdu.specific[4..8].copy_from_slice(&cmd_sn.to_be_bytes());
        pdu.specific[8..12].copy_from_slice(&exp_stat_sn.to_be_bytes());
        pdu
    }

    /// Response code of a Logout Response (0 = success)
    pub fn logout_response_code(&self) -> ScsiResult<u8> {
        self.expect_opcode(opcode::LOGOUT_RESPONSE)?;
        Ok(self.hdr[0])
    }
}

// ============================================================================
// Utility functions
// ============================================================================

/// Parse iSCSI text parameters (null-terminated key=value pairs)
pub fn parse_text_parameters(data: &[u8]) -> ScsiResult<Vec<(String, String)>> {
    let mut params = Vec::new();

    for chunk in data.split(|&b| b == 0) {
        if chunk.is_empty() {
            continue;
        }

        let s = String::from_utf8_lossy(chunk);
        if let Some(eq_pos) = s.find('=') {
            let key = s[..eq_pos].to_string();
            let value = s[eq_pos + 1..].to_string();
            params.push((key, value));
        }
    }

    Ok(params)
}

/// Serialize text parameters to null-terminated format
pub fn serialize_text_parameters(params: &[(&str, String)]) -> Vec<u8> {
    let mut data = Vec::new();
    for (key, value) in params {
        data.extend_from_slice(key.as_bytes());
        data.push(b'=');
        data.extend_from_slice(value.as_bytes());
        data.push(0);
    }
    data
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pdu_roundtrip_simple() {
        let mut pdu = IscsiPdu::new();
        pdu.opcode = opcode::NOP_OUT;
        pdu.flags = flags::FINAL;
        pdu.itt = 0x12345678;
        pdu.lun = 0x0001020304050607;

        let bytes = pdu.to_bytes();
        assert_eq!(bytes.len(), BHS_SIZE); // No data, so just BHS

        let parsed = IscsiPdu::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.opcode, opcode::NOP_OUT);
        assert_eq!(parsed.flags, flags::FINAL);
        assert_eq!(parsed.itt, 0x12345678);
        assert_eq!(parsed.lun, 0x0001020304050607);
    }

    #[test]
    fn test_pdu_too_short() {
        let bytes = vec![0u8; 20];
        assert!(IscsiPdu::from_bytes(&bytes).is_err());
        assert_eq!(IscsiPdu::frame_length(&bytes), None);
    }

    #[test]
    fn test_frame_length_counts_padding() {
        let mut pdu = IscsiPdu::new();
        pdu.opcode = opcode::TEXT_REQUEST;
        pdu.data = vec![1, 2, 3]; // 3 bytes, should pad to 4

        let bytes = pdu.to_bytes();
        assert_eq!(bytes.len(), BHS_SIZE + 4);
        assert_eq!(IscsiPdu::frame_length(&bytes), Some(BHS_SIZE + 4));
    }

    #[test]
    fn test_status_bytes_survive_parse() {
        let mut pdu = IscsiPdu::new();
        pdu.opcode = opcode::SCSI_RESPONSE;
        pdu.hdr = [0x00, 0x02]; // completed, CHECK CONDITION
        let mut sense = vec![0x00, 0x12];
        sense.extend_from_slice(&[0x70, 0, 0x05, 0, 0, 0, 0, 10, 0, 0, 0, 0, 0x21, 0, 0, 0, 0, 0]);
        pdu.data = sense;

        let parsed = IscsiPdu::from_bytes(&pdu.to_bytes()).unwrap();
        let resp = parsed.parse_scsi_response().unwrap();
        assert_eq!(resp.response, 0);
        assert_eq!(resp.status, 0x02);
        assert_eq!(resp.sense.len(), 18);
        assert_eq!(resp.sense[12], 0x21);
    }

    #[test]
    fn test_login_request_layout() {
        let isid = [0x80, 0x12, 0x34, 0x56, 0x00, 0x00];
        let data = serialize_text_parameters(&[("InitiatorName", "iqn.test".to_string())]);
        let pdu = IscsiPdu::login_request(
            isid,
            0,    // tsih
            7,    // itt
            0,    // cid
            1,    // cmd_sn
            0,    // exp_stat_sn
            flags::STAGE_SECURITY_NEG,
            flags::STAGE_LOGIN_OP_NEG,
            true,
            data,
        );

        let bytes = pdu.to_bytes();
        assert_eq!(bytes[0], 0x40 | opcode::LOGIN_REQUEST);
        assert_eq!(bytes[1], flags::TRANSIT | 0x01);
        assert_eq!(&bytes[8..14], &isid);
        assert_eq!(BigEndian::read_u32(&bytes[16..20]), 7);
        assert_eq!(BigEndian::read_u32(&bytes[24..28]), 1);
    }

    #[test]
    fn test_scsi_command_layout() {
        let mut cdb = [0u8; 16];
        cdb[0] = 0x88;
        let pdu = IscsiPdu::scsi_command(0, 3, 10, 20, 4096, &cdb, true, false, Vec::new());
        let bytes = pdu.to_bytes();

        assert_eq!(bytes[1], flags::FINAL | flags::READ | flags::ATTR_SIMPLE);
        assert_eq!(BigEndian::read_u32(&bytes[20..24]), 4096);
        assert_eq!(BigEndian::read_u32(&bytes[24..28]), 10);
        assert_eq!(BigEndian::read_u32(&bytes[28..32]), 20);
        assert_eq!(bytes[32], 0x88);
    }

    #[test]
    fn test_parse_data_in_with_status() {
        let mut pdu = IscsiPdu::new();
        pdu.opcode = opcode::SCSI_DATA_IN;
        pdu.flags = flags::FINAL | flags::STATUS;
        pdu.hdr = [0, 0x00];
        pdu.itt = 9;
        pdu.specific[20..24].copy_from_slice(&512u32.to_be_bytes());
        pdu.data = vec![0xAB; 512];

        let parsed = IscsiPdu::from_bytes(&pdu.to_bytes()).unwrap();
        let data_in = parsed.parse_scsi_data_in().unwrap();
        assert_eq!(data_in.itt, 9);
        assert_eq!(data_in.status, Some(0));
        assert_eq!(data_in.buffer_offset, 512);
        assert_eq!(data_in.data.len(), 512);
    }

    #[test]
    fn test_parse_wrong_opcode() {
        let mut pdu = IscsiPdu::new();
        pdu.opcode = opcode::NOP_IN;
        assert!(pdu.parse_r2t().is_err());
        assert!(pdu.parse_login_response().is_err());
    }

    #[test]
    fn test_parse_text_parameters() {
        let data = b"Key1=Value1\0Key2=Value2\0";
        let params = parse_text_parameters(data).unwrap();
        assert_eq!(params.len(), 2);
        assert_eq!(params[0], ("Key1".to_string(), "Value1".to_string()));
        assert_eq!(params[1], ("Key2".to_string(), "Value2".to_string()));
    }

    #[test]
    fn test_opcode_names() {
        let mut pdu = IscsiPdu::new();

        pdu.opcode = opcode::LOGIN_REQUEST;
        assert_eq!(pdu.opcode_name(), "Login Request");

        pdu.opcode = opcode::R2T;
        assert_eq!(pdu.opcode_name(), "Ready To Transfer");

        pdu.opcode = 0x3E;
        assert_eq!(pdu.opcode_name(), "Unknown");
    }
}

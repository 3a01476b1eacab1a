//! iSCSI client transport over TCP
//!
//! `IscsiClient` is the bundled [`Transport`]: it owns the TCP connection to
//! one portal, performs a plain (AuthMethod=None) login, and carries READ(16),
//! WRITE(16) and READ CAPACITY commands in the full feature phase.
//!
//! Two command paths share the connection:
//! - synchronous commands block for one round trip;
//! - asynchronous reads are queued by `submit_read16` and driven forward by
//!   `service` whenever the socket is ready (see [`crate::pump`]).
//!
//! A synchronous command refuses to run while asynchronous reads are
//! outstanding, since both would consume the same response stream.
//!
//! # Example
//!
//! ```no_run
//! use iscsi_initiator::{IscsiClient, TargetUrl, Transport};
//! use std::time::Duration;
//!
//! # fn test() -> Result<(), Box<dyn std::error::Error>> {
//! let target = TargetUrl::parse("iscsi://127.0.0.1:3260/iqn.2025-12.local:storage.disk1/0")?;
//! let mut client = IscsiClient::new("iqn.2025-12.local:initiator", Duration::from_secs(10));
//! client.connect(&target)?;
//! let block = client.read16(0, 1, 512)?;
//! client.logout()?;
//! # Ok(())
//! # }
//! ```

use crate::error::{decode_login_status, IscsiError, ScsiResult};
use crate::pdu::{self, flags, opcode, serialize_text_parameters, IscsiPdu, R2tPdu, RESERVED_TAG};
use crate::scsi::{self, describe_status, scsi_status, ScsiTask, SenseData};
use crate::transport::{Events, TaskCompletion, TaskToken, Transport};
use crate::url::TargetUrl;
use rand::Rng;
use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::net::TcpStream;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

/// Rounds of a single login stage before giving up on the target
const MAX_LOGIN_ROUNDS: usize = 8;

/// Largest PDU accepted from a target (BHS + 16 MiB data segment)
const MAX_PDU_SIZE: usize = pdu::BHS_SIZE + (1 << 24);

/// Data segment length we announce we can receive
const OUR_MAX_RECV_DATA_SEGMENT_LENGTH: u32 = 262144;

const READ_CHUNK: usize = 64 * 1024;

/// Operational parameters in effect after login (RFC 3720 Section 12)
#[derive(Debug, Clone)]
pub struct NegotiatedParams {
    /// Target's MaxRecvDataSegmentLength, bounding every PDU we send
    pub max_send_data_segment_length: u32,
    pub max_burst_length: u32,
    pub first_burst_length: u32,
    pub immediate_data: bool,
    pub initial_r2t: bool,
}

impl Default for NegotiatedParams {
    fn default() -> Self {
        NegotiatedParams {
            max_send_data_segment_length: 8192,
            max_burst_length: 262144,
            first_burst_length: 65536,
            immediate_data: true,
            initial_r2t: true,
        }
    }
}

impl NegotiatedParams {
    fn apply(&mut self, key: &str, value: &str) {
        match key {
            "MaxRecvDataSegmentLength" => {
                if let Ok(v) = value.parse() {
                    self.max_send_data_segment_length = v;
                }
            }
            "MaxBurstLength" => {
                if let Ok(v) = value.parse() {
                    self.max_burst_length = v;
                }
            }
            "FirstBurstLength" => {
                if let Ok(v) = value.parse() {
                    self.first_burst_length = v;
                }
            }
            "ImmediateData" => self.immediate_data = value == "Yes",
            "InitialR2T" => self.initial_r2t = value == "Yes",
            _ => log::debug!("Ignoring login parameter: {}={}", key, value),
        }
    }
}

/// An asynchronous read waiting for its Data-In
struct PendingRead {
    token: TaskToken,
    expected: usize,
    data: Vec<u8>,
}

/// iSCSI client for one target connection
pub struct IscsiClient {
    initiator_name: String,
    io_timeout: Duration,
    stream: Option<TcpStream>,
    target: Option<TargetUrl>,
    lun: u64,
    isid: [u8; 6],
    tsih: u16,
    cmd_sn: u32,
    exp_stat_sn: u32,
    max_cmd_sn: u32,
    next_itt: u32,
    logged_in: bool,
    params: NegotiatedParams,
    inbuf: Vec<u8>,
    outbuf: Vec<u8>,
    pending: HashMap<u32, PendingRead>,
    orphaned: Vec<TaskToken>,
}

impl IscsiClient {
    /// Create an unconnected client for the given initiator name
    pub fn new(initiator_name: &str, io_timeout: Duration) -> Self {
        IscsiClient {
            initiator_name: initiator_name.to_string(),
            io_timeout,
            stream: None,
            target: None,
            lun: 0,
            isid: random_isid(),
            tsih: 0,
            cmd_sn: 1,
            exp_stat_sn: 0,
            max_cmd_sn: 1,
            next_itt: 0,
            logged_in: false,
            params: NegotiatedParams::default(),
            inbuf: Vec::new(),
            outbuf: Vec::new(),
            pending: HashMap::new(),
            orphaned: Vec::new(),
        }
    }

    /// Get the current command sequence number
    pub fn cmd_sn(&self) -> u32 {
        self.cmd_sn
    }

    /// Get the current expected status sequence number
    pub fn exp_stat_sn(&self) -> u32 {
        self.exp_stat_sn
    }

    /// Get the maximum command sequence number from target
    pub fn max_cmd_sn(&self) -> u32 {
        self.max_cmd_sn
    }

    /// Check if client is logged in (in full feature phase)
    pub fn is_logged_in(&self) -> bool {
        self.logged_in
    }

    pub fn params(&self) -> &NegotiatedParams {
        &self.params
    }

    fn alloc_itt(&mut self) -> u32 {
        self.next_itt = self.next_itt.wrapping_add(1);
        if self.next_itt == RESERVED_TAG {
            self.next_itt = 1;
        }
        self.next_itt
    }

    fn open_stream(&mut self, portal: &str) -> ScsiResult<()> {
        self.stream = None;
        self.inbuf.clear();
        self.outbuf.clear();

        let stream = TcpStream::connect(portal)
            .map_err(|e| IscsiError::Connection(format!("TCP connect to {} failed: {}", portal, e)))?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(self.io_timeout))?;
        stream.set_write_timeout(Some(self.io_timeout))?;

        self.stream = Some(stream);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Login
    // ------------------------------------------------------------------------

    fn login(&mut self) -> ScsiResult<()> {
        let target = self
            .target
            .clone()
            .ok_or_else(|| IscsiError::Session("no target to log in to".to_string()))?;

        self.tsih = 0;
        self.params = NegotiatedParams::default();

        let security = [
            ("InitiatorName", self.initiator_name.clone()),
            ("TargetName", target.target_name.clone()),
            ("SessionType", "Normal".to_string()),
            ("AuthMethod", "None".to_string()),
        ];
        self.login_stage(
            &target,
            flags::STAGE_SECURITY_NEG,
            flags::STAGE_LOGIN_OP_NEG,
            serialize_text_parameters(&security),
        )?;

        let operational = [
            ("HeaderDigest", "None".to_string()),
            ("DataDigest", "None".to_string()),
            ("MaxRecvDataSegmentLength", OUR_MAX_RECV_DATA_SEGMENT_LENGTH.to_string()),
            ("MaxBurstLength", "262144".to_string()),
            ("FirstBurstLength", "65536".to_string()),
            ("DefaultTime2Wait", "2".to_string()),
            ("DefaultTime2Retain", "20".to_string()),
            ("MaxOutstandingR2T", "1".to_string()),
            ("MaxConnections", "1".to_string()),
            ("ImmediateData", "Yes".to_string()),
            ("InitialR2T", "Yes".to_string()),
            ("DataPDUInOrder", "Yes".to_string()),
            ("DataSequenceInOrder", "Yes".to_string()),
            ("ErrorRecoveryLevel", "0".to_string()),
        ];
        self.login_stage(
            &target,
            flags::STAGE_LOGIN_OP_NEG,
            flags::STAGE_FULL_FEATURE,
            serialize_text_parameters(&operational),
        )?;

        log::debug!("Login complete, negotiated {:?}", self.params);
        Ok(())
    }

    /// Run one login stage until the target agrees to transit to `nsg`
    fn login_stage(&mut self, target: &TargetUrl, csg: u8, nsg: u8, mut data: Vec<u8>) -> ScsiResult<()> {
        for _ in 0..MAX_LOGIN_ROUNDS {
            let itt = self.alloc_itt();
            let request = IscsiPdu::login_request(
                self.isid,
                self.tsih,
                itt,
                0, // cid
                self.cmd_sn,
                self.exp_stat_sn,
                csg,
                nsg,
                true,
                std::mem::take(&mut data),
            );
            self.send_pdu(&request)?;

            let response = self.recv_pdu()?;
            if response.opcode == opcode::REJECT {
                return Err(IscsiError::Connection(format!(
                    "target rejected login request (reason 0x{:02x})",
                    response.hdr[0]
                )));
            }
            let login = response.parse_login_response()?;

            if login.status_class != pdu::login_status::SUCCESS {
                return Err(IscsiError::Connection(format!(
                    "login to {} failed: {}",
                    target,
                    decode_login_status(login.status_class, login.status_detail)
                )));
            }

            self.tsih = login.tsih;
            self.cmd_sn = login.exp_cmd_sn;
            self.exp_stat_sn = login.stat_sn.wrapping_add(1);
            self.max_cmd_sn = login.max_cmd_sn;
            for (key, value) in &login.parameters {
                self.params.apply(key, value);
            }

            log::debug!("Login: CSG={}, NSG={}, Transit={}", login.csg, login.nsg, login.transit);
            if login.transit && login.nsg == nsg {
                return Ok(());
            }
        }

        Err(IscsiError::Connection(format!(
            "login stage {} did not complete after {} rounds",
            csg, MAX_LOGIN_ROUNDS
        )))
    }

    fn logout_exchange(&mut self) -> ScsiResult<()> {
        let itt = self.alloc_itt();
        let request = IscsiPdu::logout_request(
            itt,
            pdu::logout_reason::CLOSE_SESSION,
            0,
            self.cmd_sn,
            self.exp_stat_sn,
        );
        self.send_pdu(&request)?;

        loop {
            let response = self.recv_pdu()?;
            if response.opcode != opcode::LOGOUT_RESPONSE {
                log::debug!("Skipping {} while logging out", response.opcode_name());
                continue;
            }
            let code = response.logout_response_code()?;
            if code != 0 {
                log::warn!("Logout response code {}", code);
            }
            return Ok(());
        }
    }

    // ------------------------------------------------------------------------
    // PDU transmission
    // ------------------------------------------------------------------------

    fn stream(&mut self) -> ScsiResult<&mut TcpStream> {
        self.stream
            .as_mut()
            .ok_or_else(|| IscsiError::Session("not connected".to_string()))
    }

    /// Send a PDU to the target
    pub fn send_pdu(&mut self, pdu: &IscsiPdu) -> ScsiResult<()> {
        let bytes = pdu.to_bytes();
        self.stream()?.write_all(&bytes).map_err(transport_error)
    }

    /// Receive the next PDU from the target
    pub fn recv_pdu(&mut self) -> ScsiResult<IscsiPdu> {
        loop {
            if let Some(pdu) = self.take_buffered_pdu()? {
                return Ok(pdu);
            }
            let mut buf = [0u8; READ_CHUNK];
            let n = self.stream()?.read(&mut buf).map_err(transport_error)?;
            if n == 0 {
                return Err(IscsiError::Connection("connection closed by target".to_string()));
            }
            self.inbuf.extend_from_slice(&buf[..n]);
        }
    }

    fn take_buffered_pdu(&mut self) -> ScsiResult<Option<IscsiPdu>> {
        let len = match IscsiPdu::frame_length(&self.inbuf) {
            Some(len) => len,
            None => return Ok(None),
        };
        if len > MAX_PDU_SIZE {
            return Err(IscsiError::InvalidPdu(format!("PDU of {} bytes exceeds limit", len)));
        }
        if self.inbuf.len() < len {
            return Ok(None);
        }
        let pdu = IscsiPdu::from_bytes(&self.inbuf[..len])?;
        self.inbuf.drain(..len);
        Ok(Some(pdu))
    }

    /// Handle a PDU that belongs to no command we are waiting on
    fn handle_unsolicited(&mut self, pdu: &IscsiPdu) -> ScsiResult<()> {
        match pdu.opcode {
            opcode::NOP_IN => {
                let ttt = pdu.nop_in_ttt()?;
                if ttt != RESERVED_TAG {
                    let reply = IscsiPdu::nop_out_reply(pdu.lun, ttt, self.cmd_sn, self.exp_stat_sn, pdu.data.clone());
                    self.send_pdu(&reply)?;
                }
                Ok(())
            }
            opcode::ASYNC_MESSAGE => {
                log::warn!("Target sent async message, event 0x{:02x}", pdu.specific[16]);
                Ok(())
            }
            opcode::REJECT => Err(IscsiError::Protocol(format!(
                "target rejected PDU (reason 0x{:02x})",
                pdu.hdr[0]
            ))),
            _ => {
                log::debug!("Skipping {} for task 0x{:08x}", pdu.opcode_name(), pdu.itt);
                Ok(())
            }
        }
    }

    // ------------------------------------------------------------------------
    // Synchronous commands
    // ------------------------------------------------------------------------

    fn ensure_ready(&self) -> ScsiResult<()> {
        if !self.logged_in {
            return Err(IscsiError::Session("Not logged in. Call connect() first.".to_string()));
        }
        if !self.pending.is_empty() || !self.outbuf.is_empty() {
            return Err(IscsiError::Session(
                "asynchronous reads are in flight on this connection".to_string(),
            ));
        }
        Ok(())
    }

    /// Execute one SCSI command and wait for its status
    pub fn execute(&mut self, cdb: &[u8; 16], data_out: Option<&[u8]>, expected_in: u32) -> ScsiResult<ScsiTask> {
        self.ensure_ready()?;

        let itt = self.alloc_itt();
        let (edtl, immediate) = match data_out {
            Some(data) => {
                let n = if self.params.immediate_data {
                    data.len()
                        .min(self.params.first_burst_length as usize)
                        .min(self.params.max_send_data_segment_length as usize)
                } else {
                    0
                };
                (data.len() as u32, data[..n].to_vec())
            }
            None => (expected_in, Vec::new()),
        };

        let command = IscsiPdu::scsi_command(
            self.lun,
            itt,
            self.cmd_sn,
            self.exp_stat_sn,
            edtl,
            cdb,
            data_out.is_none() && expected_in > 0,
            data_out.is_some(),
            immediate,
        );
        self.cmd_sn = self.cmd_sn.wrapping_add(1);
        self.send_pdu(&command)?;

        let mut data_in = Vec::new();
        loop {
            let pdu = self.recv_pdu()?;
            if pdu.itt != itt {
                self.handle_unsolicited(&pdu)?;
                continue;
            }

            match pdu.opcode {
                opcode::SCSI_DATA_IN => {
                    let segment = pdu.parse_scsi_data_in()?;
                    place_segment(&mut data_in, segment.buffer_offset, segment.data, expected_in as usize)?;
                    if let Some(status) = segment.status {
                        self.exp_stat_sn = segment.stat_sn.wrapping_add(1);
                        return Ok(ScsiTask {
                            opcode: cdb[0],
                            status,
                            data_in,
                            sense: None,
                        });
                    }
                }
                opcode::R2T => {
                    let r2t = pdu.parse_r2t()?;
                    let data = data_out.ok_or_else(|| {
                        IscsiError::Protocol("R2T received for a command without data".to_string())
                    })?;
                    self.answer_r2t(itt, &r2t, data)?;
                }
                opcode::SCSI_RESPONSE => {
                    let response = pdu.parse_scsi_response()?;
                    self.exp_stat_sn = response.stat_sn.wrapping_add(1);
                    if response.response != 0 {
                        return Err(IscsiError::Protocol(format!(
                            "target failed command 0x{:02x} with iSCSI response 0x{:02x}",
                            cdb[0], response.response
                        )));
                    }
                    return Ok(ScsiTask {
                        opcode: cdb[0],
                        status: response.status,
                        data_in,
                        sense: SenseData::parse(&response.sense),
                    });
                }
                _ => {
                    return Err(IscsiError::Protocol(format!(
                        "unexpected {} for task 0x{:08x}",
                        pdu.opcode_name(),
                        itt
                    )))
                }
            }
        }
    }

    /// Send the Data-Out sequence an R2T asks for
    fn answer_r2t(&mut self, itt: u32, r2t: &R2tPdu, data: &[u8]) -> ScsiResult<()> {
        let start = r2t.buffer_offset as usize;
        let end = start + r2t.desired_length as usize;
        if end > data.len() {
            return Err(IscsiError::Protocol(format!(
                "R2T asks for bytes {}..{} of a {} byte write",
                start,
                end,
                data.len()
            )));
        }

        let chunk = (self.params.max_send_data_segment_length as usize).max(512);
        let mut offset = start;
        let mut data_sn = 0u32;
        while offset < end {
            let n = chunk.min(end - offset);
            let data_out = IscsiPdu::scsi_data_out(
                self.lun,
                itt,
                r2t.ttt,
                self.exp_stat_sn,
                data_sn,
                offset as u32,
                data[offset..offset + n].to_vec(),
                offset + n == end,
            );
            self.send_pdu(&data_out)?;
            offset += n;
            data_sn += 1;
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Asynchronous reads
    // ------------------------------------------------------------------------

    fn dispatch_async(
        &mut self,
        pdu: IscsiPdu,
        on_complete: &mut dyn FnMut(TaskToken, TaskCompletion<'_>),
    ) -> ScsiResult<()> {
        if !self.pending.contains_key(&pdu.itt) {
            return self.handle_unsolicited(&pdu);
        }

        match pdu.opcode {
            opcode::SCSI_DATA_IN => {
                let segment = pdu.parse_scsi_data_in()?;
                let placed = match self.pending.get_mut(&pdu.itt) {
                    Some(task) => place_segment(&mut task.data, segment.buffer_offset, segment.data, task.expected),
                    None => Ok(()),
                };
                if let Err(e) = placed {
                    if let Some(task) = self.pending.remove(&pdu.itt) {
                        on_complete(task.token, TaskCompletion::Failed(e.to_string()));
                    }
                    return Ok(());
                }
                if let Some(status) = segment.status {
                    self.exp_stat_sn = segment.stat_sn.wrapping_add(1);
                    if let Some(task) = self.pending.remove(&pdu.itt) {
                        complete_read(task, status, None, on_complete);
                    }
                }
            }
            opcode::SCSI_RESPONSE => {
                let response = pdu.parse_scsi_response()?;
                self.exp_stat_sn = response.stat_sn.wrapping_add(1);
                if let Some(task) = self.pending.remove(&pdu.itt) {
                    if response.response != 0 {
                        let msg = format!("target failed READ(16) with iSCSI response 0x{:02x}", response.response);
                        on_complete(task.token, TaskCompletion::Failed(msg));
                    } else {
                        let sense = SenseData::parse(&response.sense);
                        complete_read(task, response.status, sense, on_complete);
                    }
                }
            }
            _ => {
                if let Some(task) = self.pending.remove(&pdu.itt) {
                    let msg = format!("unexpected {} for asynchronous read", pdu.opcode_name());
                    on_complete(task.token, TaskCompletion::Failed(msg));
                }
            }
        }
        Ok(())
    }
}

fn complete_read(
    task: PendingRead,
    status: u8,
    sense: Option<SenseData>,
    on_complete: &mut dyn FnMut(TaskToken, TaskCompletion<'_>),
) {
    if status != scsi_status::GOOD {
        let msg = describe_status("READ(16)", status, sense.as_ref());
        on_complete(task.token, TaskCompletion::Failed(msg));
    } else if task.data.len() != task.expected {
        let msg = format!("short read: {} of {} bytes", task.data.len(), task.expected);
        on_complete(task.token, TaskCompletion::Failed(msg));
    } else {
        on_complete(
            task.token,
            TaskCompletion::Done {
                status,
                data_in: &task.data,
            },
        );
    }
}

/// Copy one Data-In segment into place in the command buffer
fn place_segment(buf: &mut Vec<u8>, offset: u32, data: &[u8], expected: usize) -> ScsiResult<()> {
    let start = offset as usize;
    let end = start + data.len();
    if end > expected {
        return Err(IscsiError::Protocol(format!(
            "Data-In bytes {}..{} overrun the {} byte transfer",
            start, end, expected
        )));
    }
    if buf.len() < end {
        buf.resize(end, 0);
    }
    buf[start..end].copy_from_slice(data);
    Ok(())
}

/// Random-format ISID (RFC 3720 Section 10.12.5, T=10b)
fn random_isid() -> [u8; 6] {
    let mut isid = [0x80, 0, 0, 0, 0, 0];
    rand::thread_rng().fill(&mut isid[1..4]);
    isid
}

/// Socket timeouts are the transient signature; everything else is fatal
fn transport_error(err: std::io::Error) -> IscsiError {
    match err.kind() {
        ErrorKind::WouldBlock | ErrorKind::TimedOut => IscsiError::PollFailed,
        _ => IscsiError::Io(err),
    }
}

fn transfer_length(blocks: u32, block_size: u32) -> ScsiResult<u32> {
    u32::try_from(blocks as u64 * block_size as u64).map_err(|_| {
        IscsiError::Protocol(format!(
            "transfer of {} blocks of {} bytes exceeds the 4 GiB command limit",
            blocks, block_size
        ))
    })
}

impl Transport for IscsiClient {
    fn connect(&mut self, target: &TargetUrl) -> ScsiResult<()> {
        if self.logged_in {
            return Err(IscsiError::Session("already logged in".to_string()));
        }

        self.target = Some(target.clone());
        self.lun = target.lun_field();
        self.open_stream(&target.portal)?;
        self.login()?;
        self.logged_in = true;
        log::info!("Logged in to {}", target);
        Ok(())
    }

    fn reconnect(&mut self) -> ScsiResult<()> {
        let target = self
            .target
            .clone()
            .ok_or_else(|| IscsiError::Session("reconnect before connect".to_string()))?;

        self.logged_in = false;
        self.orphaned.extend(self.pending.drain().map(|(_, task)| task.token));
        self.open_stream(&target.portal)?;
        self.login()?;
        self.logged_in = true;
        log::info!("Reconnected to {}", target);
        Ok(())
    }

    fn is_logged_in(&self) -> bool {
        self.logged_in
    }

    fn logout(&mut self) -> ScsiResult<()> {
        if !self.logged_in {
            // Drops whatever a half-finished login left behind
            self.stream = None;
            return Ok(());
        }

        let result = self.logout_exchange();
        self.stream = None;
        self.logged_in = false;
        self.inbuf.clear();
        self.outbuf.clear();
        self.orphaned.extend(self.pending.drain().map(|(_, task)| task.token));
        result
    }

    fn read_capacity10(&mut self) -> ScsiResult<ScsiTask> {
        self.execute(&scsi::build_read_capacity10(), None, 8)
    }

    fn read_capacity16(&mut self) -> ScsiResult<ScsiTask> {
        self.execute(
            &scsi::build_read_capacity16(scsi::READ_CAPACITY_16_LEN),
            None,
            scsi::READ_CAPACITY_16_LEN,
        )
    }

    fn read16(&mut self, lba: u64, blocks: u32, block_size: u32) -> ScsiResult<Vec<u8>> {
        let len = transfer_length(blocks, block_size)?;
        let task = self.execute(&scsi::build_read16(lba, blocks), None, len)?.check("READ(16)")?;
        if task.data_in.len() != len as usize {
            return Err(IscsiError::Protocol(format!(
                "short read: {} of {} bytes",
                task.data_in.len(),
                len
            )));
        }
        Ok(task.data_in)
    }

    fn write16(&mut self, lba: u64, data: &[u8], block_size: u32) -> ScsiResult<()> {
        if block_size == 0 || data.len() % block_size as usize != 0 {
            return Err(IscsiError::Session(format!(
                "write of {} bytes is not a multiple of block size {}",
                data.len(),
                block_size
            )));
        }
        let blocks = (data.len() / block_size as usize) as u32;
        transfer_length(blocks, block_size)?;
        self.execute(&scsi::build_write16(lba, blocks), Some(data), 0)?
            .check("WRITE(16)")?;
        Ok(())
    }

    fn descriptor(&self) -> RawFd {
        self.stream.as_ref().map(|s| s.as_raw_fd()).unwrap_or(-1)
    }

    fn which_events(&self) -> Events {
        let mut events = Events::NONE;
        if !self.pending.is_empty() {
            events |= Events::READABLE;
        }
        if !self.outbuf.is_empty() || !self.orphaned.is_empty() {
            events |= Events::WRITABLE;
        }
        events
    }

    fn service(
        &mut self,
        ready: Events,
        on_complete: &mut dyn FnMut(TaskToken, TaskCompletion<'_>),
    ) -> ScsiResult<()> {
        for token in self.orphaned.drain(..) {
            on_complete(
                token,
                TaskCompletion::Failed("connection was reset before the read completed".to_string()),
            );
        }

        let stream = match self.stream.as_mut() {
            Some(stream) => stream,
            None if self.pending.is_empty() => return Ok(()),
            None => return Err(IscsiError::Session("not connected".to_string())),
        };

        if ready.is_error() {
            return Err(IscsiError::Connection(format!(
                "connection failed (poll revents 0x{:04x})",
                ready.bits()
            )));
        }

        if ready.contains(Events::WRITABLE) && !self.outbuf.is_empty() {
            match stream.write(&self.outbuf) {
                Ok(n) => {
                    self.outbuf.drain(..n);
                }
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => {}
                Err(e) => return Err(e.into()),
            }
        }

        if ready.contains(Events::READABLE) {
            let mut buf = [0u8; READ_CHUNK];
            match stream.read(&mut buf) {
                Ok(0) => return Err(IscsiError::Connection("connection closed by target".to_string())),
                Ok(n) => self.inbuf.extend_from_slice(&buf[..n]),
                Err(e)
                    if matches!(
                        e.kind(),
                        ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
                    ) => {}
                Err(e) => return Err(e.into()),
            }
        }

        while let Some(pdu) = self.take_buffered_pdu()? {
            self.dispatch_async(pdu, on_complete)?;
        }
        Ok(())
    }

    fn submit_read16(&mut self, token: TaskToken, lba: u64, blocks: u32, block_size: u32) -> ScsiResult<()> {
        if !self.logged_in {
            return Err(IscsiError::Session("Not logged in. Call connect() first.".to_string()));
        }
        let len = transfer_length(blocks, block_size)?;

        let itt = self.alloc_itt();
        let command = IscsiPdu::scsi_command(
            self.lun,
            itt,
            self.cmd_sn,
            self.exp_stat_sn,
            len,
            &scsi::build_read16(lba, blocks),
            true,
            false,
            Vec::new(),
        );
        self.cmd_sn = self.cmd_sn.wrapping_add(1);
        self.outbuf.extend_from_slice(&command.to_bytes());
        self.pending.insert(
            itt,
            PendingRead {
                token,
                expected: len as usize,
                data: Vec::with_capacity(len as usize),
            },
        );
        Ok(())
    }
}

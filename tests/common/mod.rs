//! Scripted iSCSI target on a loopback socket
//!
//! Serves one connection at a time with just enough of RFC 3720 to exercise
//! the client: two-stage login, READ CAPACITY, READ(16) split over several
//! Data-In PDUs, WRITE(16) with immediate data and R2T, NOP-In pings and
//! logout. Everything the initiator sends is recorded for assertions.

#![allow(dead_code)]

use byteorder::{BigEndian, ByteOrder};
use iscsi_initiator::pdu::{self, flags, opcode, parse_text_parameters, serialize_text_parameters, IscsiPdu};
use iscsi_initiator::scsi::{self, asc, scsi_status, sense_key, Capacity, ScsiOpcode};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;

pub const TARGET_NAME: &str = "iqn.2025-12.local:storage.disk1";
pub const INITIATOR_NAME: &str = "iqn.2024-10.libiscsi:go";

const PING_TTT: u32 = 0x1234;
const WRITE_TTT: u32 = 0x77;

#[derive(Debug, Clone)]
pub struct TargetOptions {
    pub block_size: u32,
    pub blocks: u64,
    /// Reject every login with this (class, detail)
    pub login_status: Option<(u8, u8)>,
    pub max_recv_data_segment_length: u32,
    pub immediate_data: bool,
    /// Largest Data-In payload per PDU
    pub data_in_chunk: usize,
    pub ping_before_read: bool,
    /// Never answer READ(16)
    pub stall_reads: bool,
}

impl Default for TargetOptions {
    fn default() -> Self {
        TargetOptions {
            block_size: 512,
            blocks: 64,
            login_status: None,
            max_recv_data_segment_length: 8192,
            immediate_data: true,
            data_in_chunk: 8192,
            ping_before_read: false,
            stall_reads: false,
        }
    }
}

/// What the target saw from the initiator
#[derive(Debug, Clone, PartialEq)]
pub enum Seen {
    Login { csg: u8, params: Vec<(String, String)> },
    Command { opcode: u8, immediate_len: usize },
    DataOut { offset: u32, len: usize, final_flag: bool },
    NopOut { ttt: u32 },
    Logout,
}

pub struct FakeTarget {
    pub portal: String,
    pub disk: Arc<Mutex<Vec<u8>>>,
    pub seen: Arc<Mutex<Vec<Seen>>>,
}

impl FakeTarget {
    pub fn url(&self) -> String {
        format!("iscsi://{}/{}/0", self.portal, TARGET_NAME)
    }

    pub fn seen(&self) -> Vec<Seen> {
        self.seen.lock().unwrap().clone()
    }

    pub fn fill(&self, offset: usize, data: &[u8]) {
        self.disk.lock().unwrap()[offset..offset + data.len()].copy_from_slice(data);
    }
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn spawn(options: TargetOptions) -> FakeTarget {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind loopback");
    let portal = listener.local_addr().unwrap().to_string();
    let disk = Arc::new(Mutex::new(vec![0u8; options.block_size as usize * options.blocks as usize]));
    let seen = Arc::new(Mutex::new(Vec::new()));

    let target = FakeTarget {
        portal,
        disk: Arc::clone(&disk),
        seen: Arc::clone(&seen),
    };

    thread::spawn(move || {
        for stream in listener.incoming() {
            match stream {
                Ok(stream) => serve(stream, &options, &disk, &seen),
                Err(_) => break,
            }
        }
    });

    target
}

fn read_pdu(stream: &mut TcpStream) -> std::io::Result<IscsiPdu> {
    let mut buf = vec![0u8; pdu::BHS_SIZE];
    stream.read_exact(&mut buf)?;
    let len = IscsiPdu::frame_length(&buf).unwrap();
    buf.resize(len, 0);
    stream.read_exact(&mut buf[pdu::BHS_SIZE..])?;
    IscsiPdu::from_bytes(&buf).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))
}

fn send(stream: &mut TcpStream, pdu: &IscsiPdu) -> std::io::Result<()> {
    stream.write_all(&pdu.to_bytes())
}

struct Conn<'a> {
    stream: TcpStream,
    options: &'a TargetOptions,
    disk: &'a Mutex<Vec<u8>>,
    seen: &'a Mutex<Vec<Seen>>,
    stat_sn: u32,
    exp_cmd_sn: u32,
}

fn serve(stream: TcpStream, options: &TargetOptions, disk: &Mutex<Vec<u8>>, seen: &Mutex<Vec<Seen>>) {
    let mut conn = Conn {
        stream,
        options,
        disk,
        seen,
        stat_sn: 100,
        exp_cmd_sn: 0,
    };
    while let Ok(request) = read_pdu(&mut conn.stream) {
        let keep_going = match request.opcode {
            opcode::LOGIN_REQUEST => conn.login(&request),
            opcode::SCSI_COMMAND => conn.command(&request),
            opcode::NOP_OUT => {
                conn.record(Seen::NopOut {
                    ttt: BigEndian::read_u32(&request.specific[0..4]),
                });
                Ok(true)
            }
            opcode::LOGOUT_REQUEST => conn.logout(&request),
            _ => Ok(true),
        };
        if !matches!(keep_going, Ok(true)) {
            break;
        }
    }
}

impl Conn<'_> {
    fn record(&self, event: Seen) {
        self.seen.lock().unwrap().push(event);
    }

    fn next_stat_sn(&mut self) -> u32 {
        let sn = self.stat_sn;
        self.stat_sn += 1;
        sn
    }

    fn stamp(&self, pdu: &mut IscsiPdu, stat_sn: u32) {
        pdu.specific[4..8].copy_from_slice(&stat_sn.to_be_bytes());
        pdu.specific[8..12].copy_from_slice(&self.exp_cmd_sn.to_be_bytes());
        pdu.specific[12..16].copy_from_slice(&(self.exp_cmd_sn + 32).to_be_bytes());
    }

    fn login(&mut self, request: &IscsiPdu) -> std::io::Result<bool> {
        let csg = (request.flags >> 2) & 0x03;
        let nsg = request.flags & 0x03;
        self.record(Seen::Login {
            csg,
            params: parse_text_parameters(&request.data).unwrap(),
        });
        self.exp_cmd_sn = BigEndian::read_u32(&request.specific[4..8]);

        let mut response = IscsiPdu::new();
        response.opcode = opcode::LOGIN_RESPONSE;
        response.itt = request.itt;
        response.lun = (request.lun & !0xFFFF) | 0x0001;
        let stat_sn = self.next_stat_sn();
        self.stamp(&mut response, stat_sn);

        if let Some((class, detail)) = self.options.login_status {
            response.flags = csg << 2;
            response.specific[16] = class;
            response.specific[17] = detail;
            send(&mut self.stream, &response)?;
            return Ok(false);
        }

        response.flags = flags::TRANSIT | (csg << 2) | nsg;
        let params = if csg == flags::STAGE_LOGIN_OP_NEG {
            vec![
                ("HeaderDigest", "None".to_string()),
                ("DataDigest", "None".to_string()),
                (
                    "MaxRecvDataSegmentLength",
                    self.options.max_recv_data_segment_length.to_string(),
                ),
                (
                    "ImmediateData",
                    if self.options.immediate_data { "Yes" } else { "No" }.to_string(),
                ),
                ("InitialR2T", "Yes".to_string()),
                ("FirstBurstLength", "65536".to_string()),
                ("MaxBurstLength", "262144".to_string()),
            ]
        } else {
            vec![("TargetPortalGroupTag", "1".to_string())]
        };
        response.data = serialize_text_parameters(&params);
        send(&mut self.stream, &response)?;
        Ok(true)
    }

    fn logout(&mut self, request: &IscsiPdu) -> std::io::Result<bool> {
        self.record(Seen::Logout);
        let mut response = IscsiPdu::new();
        response.opcode = opcode::LOGOUT_RESPONSE;
        response.flags = flags::FINAL;
        response.itt = request.itt;
        let stat_sn = self.next_stat_sn();
        self.stamp(&mut response, stat_sn);
        send(&mut self.stream, &response)?;
        Ok(false)
    }

    fn command(&mut self, request: &IscsiPdu) -> std::io::Result<bool> {
        let cdb = &request.specific[12..28];
        self.record(Seen::Command {
            opcode: cdb[0],
            immediate_len: request.data.len(),
        });
        self.exp_cmd_sn = BigEndian::read_u32(&request.specific[4..8]) + 1;
        let capacity = Capacity::new(self.options.block_size, self.options.blocks);

        match cdb[0] {
            op if op == ScsiOpcode::ReadCapacity10 as u8 => {
                self.data_in(request, &capacity.to_read_capacity10())?;
            }
            op if op == ScsiOpcode::ServiceActionIn16 as u8 => {
                self.data_in(request, &capacity.to_read_capacity16())?;
            }
            op if op == ScsiOpcode::Read16 as u8 => {
                let (lba, blocks) = scsi::parse_rw16_cdb(cdb).unwrap();
                if self.options.stall_reads {
                    return Ok(true);
                }
                if self.options.ping_before_read {
                    self.ping()?;
                }
                if capacity.check_range(lba, blocks as u64).is_err() {
                    self.lba_out_of_range(request)?;
                    return Ok(true);
                }
                let bs = self.options.block_size as usize;
                let start = lba as usize * bs;
                let data = self.disk.lock().unwrap()[start..start + blocks as usize * bs].to_vec();
                self.data_in(request, &data)?;
            }
            op if op == ScsiOpcode::Write16 as u8 => {
                let (lba, blocks) = scsi::parse_rw16_cdb(cdb).unwrap();
                let bs = self.options.block_size as usize;
                let len = blocks as usize * bs;
                let mut data = request.data.clone();
                if data.len() < len {
                    self.collect_data_out(request, &mut data, len)?;
                }
                let start = lba as usize * bs;
                self.disk.lock().unwrap()[start..start + len].copy_from_slice(&data[..len]);
                self.response(request, scsi_status::GOOD, Vec::new())?;
            }
            _ => self.response(request, scsi_status::CHECK_CONDITION, Vec::new())?,
        }
        Ok(true)
    }

    /// Send `data` as Data-In PDUs, status collapsed into the last one
    fn data_in(&mut self, request: &IscsiPdu, data: &[u8]) -> std::io::Result<()> {
        let chunk = self.options.data_in_chunk.max(1);
        let chunks: Vec<&[u8]> = data.chunks(chunk).collect();
        for (i, part) in chunks.iter().enumerate() {
            let last = i + 1 == chunks.len();
            let mut pdu = IscsiPdu::new();
            pdu.opcode = opcode::SCSI_DATA_IN;
            pdu.itt = request.itt;
            pdu.specific[0..4].copy_from_slice(&pdu::RESERVED_TAG.to_be_bytes());
            pdu.specific[16..20].copy_from_slice(&(i as u32).to_be_bytes());
            pdu.specific[20..24].copy_from_slice(&((i * chunk) as u32).to_be_bytes());
            if last {
                pdu.flags = flags::FINAL | flags::STATUS;
                pdu.hdr[1] = scsi_status::GOOD;
                let stat_sn = self.next_stat_sn();
                self.stamp(&mut pdu, stat_sn);
            }
            pdu.data = part.to_vec();
            send(&mut self.stream, &pdu)?;
        }
        Ok(())
    }

    fn response(&mut self, request: &IscsiPdu, status: u8, sense: Vec<u8>) -> std::io::Result<()> {
        let mut pdu = IscsiPdu::new();
        pdu.opcode = opcode::SCSI_RESPONSE;
        pdu.flags = flags::FINAL;
        pdu.hdr = [0, status];
        pdu.itt = request.itt;
        let stat_sn = self.next_stat_sn();
        self.stamp(&mut pdu, stat_sn);
        if !sense.is_empty() {
            let mut data = (sense.len() as u16).to_be_bytes().to_vec();
            data.extend_from_slice(&sense);
            pdu.data = data;
        }
        send(&mut self.stream, &pdu)
    }

    fn lba_out_of_range(&mut self, request: &IscsiPdu) -> std::io::Result<()> {
        let mut sense = vec![0u8; 18];
        sense[0] = 0x70;
        sense[2] = sense_key::ILLEGAL_REQUEST;
        sense[7] = 10;
        sense[12] = asc::LBA_OUT_OF_RANGE;
        self.response(request, scsi_status::CHECK_CONDITION, sense)
    }

    fn ping(&mut self) -> std::io::Result<()> {
        let mut nop = IscsiPdu::new();
        nop.opcode = opcode::NOP_IN;
        nop.flags = flags::FINAL;
        nop.itt = pdu::RESERVED_TAG;
        nop.specific[0..4].copy_from_slice(&PING_TTT.to_be_bytes());
        nop.specific[4..8].copy_from_slice(&self.stat_sn.to_be_bytes());
        send(&mut self.stream, &nop)?;

        let reply = read_pdu(&mut self.stream)?;
        assert_eq!(reply.opcode, opcode::NOP_OUT, "expected NOP-Out reply to ping");
        self.record(Seen::NopOut {
            ttt: BigEndian::read_u32(&reply.specific[0..4]),
        });
        Ok(())
    }

    fn collect_data_out(&mut self, request: &IscsiPdu, data: &mut Vec<u8>, len: usize) -> std::io::Result<()> {
        let mut r2t = IscsiPdu::new();
        r2t.opcode = opcode::R2T;
        r2t.flags = flags::FINAL;
        r2t.itt = request.itt;
        r2t.specific[0..4].copy_from_slice(&WRITE_TTT.to_be_bytes());
        self.stamp(&mut r2t, self.stat_sn);
        r2t.specific[20..24].copy_from_slice(&(data.len() as u32).to_be_bytes());
        r2t.specific[24..28].copy_from_slice(&((len - data.len()) as u32).to_be_bytes());
        send(&mut self.stream, &r2t)?;

        loop {
            let out = read_pdu(&mut self.stream)?;
            assert_eq!(out.opcode, opcode::SCSI_DATA_OUT, "expected Data-Out");
            assert_eq!(BigEndian::read_u32(&out.specific[0..4]), WRITE_TTT);
            let offset = BigEndian::read_u32(&out.specific[20..24]);
            let final_flag = out.flags & flags::FINAL != 0;
            assert_eq!(offset as usize, data.len(), "Data-Out arrived out of order");
            self.record(Seen::DataOut {
                offset,
                len: out.data.len(),
                final_flag,
            });
            data.extend_from_slice(&out.data);
            if final_flag {
                return Ok(());
            }
        }
    }
}

/// Login stages and parameters the target received, in order
pub fn logins(seen: &[Seen]) -> Vec<(u8, Vec<(String, String)>)> {
    seen.iter()
        .filter_map(|s| match s {
            Seen::Login { csg, params } => Some((*csg, params.clone())),
            _ => None,
        })
        .collect()
}

pub fn param<'a>(params: &'a [(String, String)], key: &str) -> Option<&'a str> {
    params.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
}

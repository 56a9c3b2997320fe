//! P2P message taxonomy and framing
//!
//! Every message travels in a 24-byte frame: 4-byte network magic, 12-byte
//! zero-padded ASCII command, little-endian payload length, and the first
//! four bytes of `hash256(payload)` as checksum.

use crate::codec::*;
use crate::compact::{BlockTransactions, BlockTransactionsRequest, HeaderAndShortIds};
use crate::constants::*;
use crate::error::{HarnessError, Result};
use crate::hash::hash256;
use crate::types::*;
use crate::xversion::XVersionMessage;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// Messages the emulated peer sends and understands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkMessage {
    Version(VersionMessage),
    VerAck,
    XVersion(XVersionMessage),
    XVerAck,
    XUpdate(XVersionMessage),
    Addr(AddrMessage),
    Inv(Vec<InvItem>),
    GetData(Vec<InvItem>),
    NotFound(Vec<InvItem>),
    GetBlocks(GetBlocksMessage),
    GetHeaders(GetHeadersMessage),
    Tx(Transaction),
    Block(Block),
    Headers(Vec<BlockHeader>),
    SendHeaders,
    MemPool,
    GetAddr,
    Ping(u64),
    Pong(u64),
    Reject(RejectMessage),
    SendCmpct(SendCmpctMessage),
    CmpctBlock(HeaderAndShortIds),
    GetBlockTxn(BlockTransactionsRequest),
    BlockTxn(BlockTransactions),
    FeeFilter(u64),
    Alert(AlertMessage),
    /// Command this crate has no payload type for; carried verbatim
    Unknown { command: String, payload: Vec<u8> },
}

/// Network address as carried in `version` (no timestamp)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkAddress {
    pub services: u64,
    pub ip: [u8; 16],
    pub port: u16,
}

impl NetworkAddress {
    pub fn new(addr: SocketAddr, services: u64) -> Self {
        let ip = match addr.ip() {
            IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
            IpAddr::V6(v6) => v6.octets(),
        };
        Self { services, ip, port: addr.port() }
    }

    pub fn localhost(port: u16, services: u64) -> Self {
        Self::new(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port), services)
    }

    pub fn socket_addr(&self) -> SocketAddr {
        let v6 = Ipv6Addr::from(self.ip);
        let ip = match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        };
        SocketAddr::new(ip, self.port)
    }
}

impl Default for NetworkAddress {
    fn default() -> Self {
        Self::localhost(0, 0)
    }
}

impl Encodable for NetworkAddress {
    fn encode_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.services.to_le_bytes());
        out.extend_from_slice(&self.ip);
        out.extend_from_slice(&self.port.to_be_bytes());
    }
}

impl Decodable for NetworkAddress {
    fn decode_from(reader: &mut Reader<'_>) -> Result<Self> {
        Ok(NetworkAddress {
            services: reader.read_u64()?,
            ip: reader.read_array()?,
            port: reader.read_u16_be()?,
        })
    }
}

/// Address with last-seen time, as carried in `addr`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimestampedAddress {
    pub time: u32,
    pub address: NetworkAddress,
}

impl Encodable for TimestampedAddress {
    fn encode_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.time.to_le_bytes());
        self.address.encode_to(out);
    }
}

impl Decodable for TimestampedAddress {
    fn decode_from(reader: &mut Reader<'_>) -> Result<Self> {
        Ok(TimestampedAddress { time: reader.read_u32()?, address: NetworkAddress::decode_from(reader)? })
    }
}

/// Version message for initial handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionMessage {
    pub version: i32,
    pub services: u64,
    pub timestamp: i64,
    pub addr_recv: NetworkAddress,
    pub addr_from: NetworkAddress,
    pub nonce: u64,
    pub user_agent: String,
    pub start_height: i32,
    pub relay: bool,
}

impl Default for VersionMessage {
    fn default() -> Self {
        Self {
            version: MY_VERSION,
            services: NODE_NETWORK | NODE_BITCOIN_CASH,
            timestamp: 0,
            addr_recv: NetworkAddress::default(),
            addr_from: NetworkAddress::default(),
            nonce: 0,
            user_agent: MY_SUBVERSION.to_string(),
            start_height: -1,
            relay: true,
        }
    }
}

impl Encodable for VersionMessage {
    fn encode_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.version.to_le_bytes());
        out.extend_from_slice(&self.services.to_le_bytes());
        out.extend_from_slice(&self.timestamp.to_le_bytes());
        self.addr_recv.encode_to(out);
        self.addr_from.encode_to(out);
        out.extend_from_slice(&self.nonce.to_le_bytes());
        write_var_bytes(out, self.user_agent.as_bytes());
        out.extend_from_slice(&self.start_height.to_le_bytes());
        out.push(self.relay as u8);
    }
}

impl Decodable for VersionMessage {
    fn decode_from(reader: &mut Reader<'_>) -> Result<Self> {
        let version = reader.read_i32()?;
        let services = reader.read_u64()?;
        let timestamp = reader.read_i64()?;
        let addr_recv = NetworkAddress::decode_from(reader)?;
        let addr_from = NetworkAddress::decode_from(reader)?;
        let nonce = reader.read_u64()?;
        let user_agent = reader.read_var_string()?;
        let start_height = reader.read_i32()?;
        // relay flag is optional on the wire
        let relay = if reader.is_empty() { false } else { reader.read_bool()? };
        Ok(VersionMessage {
            version,
            services,
            timestamp,
            addr_recv,
            addr_from,
            nonce,
            user_agent,
            start_height,
            relay,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AddrMessage {
    pub addresses: Vec<TimestampedAddress>,
}

/// `getblocks` payload: protocol version, locator and stop hash
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetBlocksMessage {
    pub version: i32,
    pub locator: Vec<Hash>,
    pub hash_stop: Hash,
}

/// `getheaders` payload, same layout as `getblocks`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetHeadersMessage {
    pub version: i32,
    pub locator: Vec<Hash>,
    pub hash_stop: Hash,
}

impl GetHeadersMessage {
    pub fn new(locator: Vec<Hash>, hash_stop: Hash) -> Self {
        Self { version: MY_VERSION, locator, hash_stop }
    }
}

fn encode_locator(out: &mut Vec<u8>, version: i32, locator: &[Hash], hash_stop: &Hash) {
    out.extend_from_slice(&version.to_le_bytes());
    write_vec(out, locator);
    out.extend_from_slice(hash_stop);
}

fn decode_locator(reader: &mut Reader<'_>) -> Result<(i32, Vec<Hash>, Hash)> {
    let version = reader.read_i32()?;
    let count = reader.read_count(32)?;
    let mut locator = Vec::with_capacity(count);
    for _ in 0..count {
        locator.push(reader.read_hash()?);
    }
    Ok((version, locator, reader.read_hash()?))
}

/// Reject: offending command, code, free-form reason and optional object id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectMessage {
    pub message: String,
    pub code: u8,
    pub reason: String,
    pub data: Option<Hash>,
}

pub const REJECT_MALFORMED: u8 = 0x01;
pub const REJECT_INVALID: u8 = 0x10;
pub const REJECT_OBSOLETE: u8 = 0x11;
pub const REJECT_DUPLICATE: u8 = 0x12;
pub const REJECT_NONSTANDARD: u8 = 0x40;
pub const REJECT_INSUFFICIENTFEE: u8 = 0x42;
pub const REJECT_CHECKPOINT: u8 = 0x43;

impl Encodable for RejectMessage {
    fn encode_to(&self, out: &mut Vec<u8>) {
        write_var_bytes(out, self.message.as_bytes());
        out.push(self.code);
        write_var_bytes(out, self.reason.as_bytes());
        if let Some(hash) = &self.data {
            out.extend_from_slice(hash);
        }
    }
}

impl Decodable for RejectMessage {
    fn decode_from(reader: &mut Reader<'_>) -> Result<Self> {
        let message = reader.read_var_string()?;
        let code = reader.read_u8()?;
        let reason = reader.read_var_string()?;
        let data = if reader.remaining() >= 32 { Some(reader.read_hash()?) } else { None };
        Ok(RejectMessage { message, code, reason, data })
    }
}

/// `sendcmpct`: announce flag and compact block version
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendCmpctMessage {
    pub announce: bool,
    pub version: u64,
}

/// Legacy alert: opaque message and signature
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AlertMessage {
    pub payload: Vec<u8>,
    pub signature: Vec<u8>,
}

// ============================================================================
// Payload codec
// ============================================================================

fn decode_inv(payload: &[u8]) -> Result<Vec<InvItem>> {
    let mut reader = Reader::new(payload);
    let count = reader.read_count(36)?;
    let mut items = Vec::with_capacity(count);
    for _ in 0..count {
        items.push(InvItem::decode_from(&mut reader)?);
    }
    reader.finish()?;
    Ok(items)
}

fn decode_headers(payload: &[u8]) -> Result<Vec<BlockHeader>> {
    let mut reader = Reader::new(payload);
    let count = reader.read_count(81)?;
    let mut headers = Vec::with_capacity(count);
    for _ in 0..count {
        headers.push(BlockHeader::decode_from(&mut reader)?);
        // each header is followed by a transaction count, always zero
        let _txs: Vec<Transaction> = reader.read_vec()?;
    }
    reader.finish()?;
    Ok(headers)
}

fn decode_u64(payload: &[u8]) -> Result<u64> {
    let mut reader = Reader::new(payload);
    let value = reader.read_u64()?;
    reader.finish()?;
    Ok(value)
}

fn expect_empty(command: &str, payload: &[u8]) -> Result<()> {
    if !payload.is_empty() {
        return Err(HarnessError::malformed(format!(
            "{} carries {} unexpected payload bytes",
            command,
            payload.len()
        )));
    }
    Ok(())
}

impl NetworkMessage {
    /// Command tag placed in the frame header
    pub fn command(&self) -> &str {
        match self {
            NetworkMessage::Version(_) => "version",
            NetworkMessage::VerAck => "verack",
            NetworkMessage::XVersion(_) => "xversion",
            NetworkMessage::XVerAck => "xverack",
            NetworkMessage::XUpdate(_) => "xupdate",
            NetworkMessage::Addr(_) => "addr",
            NetworkMessage::Inv(_) => "inv",
            NetworkMessage::GetData(_) => "getdata",
            NetworkMessage::NotFound(_) => "notfound",
            NetworkMessage::GetBlocks(_) => "getblocks",
            NetworkMessage::GetHeaders(_) => "getheaders",
            NetworkMessage::Tx(_) => "tx",
            NetworkMessage::Block(_) => "block",
            NetworkMessage::Headers(_) => "headers",
            NetworkMessage::SendHeaders => "sendheaders",
            NetworkMessage::MemPool => "mempool",
            NetworkMessage::GetAddr => "getaddr",
            NetworkMessage::Ping(_) => "ping",
            NetworkMessage::Pong(_) => "pong",
            NetworkMessage::Reject(_) => "reject",
            NetworkMessage::SendCmpct(_) => "sendcmpct",
            NetworkMessage::CmpctBlock(_) => "cmpctblock",
            NetworkMessage::GetBlockTxn(_) => "getblocktxn",
            NetworkMessage::BlockTxn(_) => "blocktxn",
            NetworkMessage::FeeFilter(_) => "feefilter",
            NetworkMessage::Alert(_) => "alert",
            NetworkMessage::Unknown { command, .. } => command,
        }
    }

    pub fn encode_payload(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            NetworkMessage::Version(v) => v.encode_to(&mut out),
            NetworkMessage::XVersion(x) | NetworkMessage::XUpdate(x) => x.encode_to(&mut out),
            NetworkMessage::Addr(a) => write_vec(&mut out, &a.addresses),
            NetworkMessage::Inv(items)
            | NetworkMessage::GetData(items)
            | NetworkMessage::NotFound(items) => write_vec(&mut out, items),
            NetworkMessage::GetBlocks(m) => encode_locator(&mut out, m.version, &m.locator, &m.hash_stop),
            NetworkMessage::GetHeaders(m) => encode_locator(&mut out, m.version, &m.locator, &m.hash_stop),
            NetworkMessage::Tx(tx) => tx.encode_to(&mut out),
            NetworkMessage::Block(block) => block.encode_to(&mut out),
            NetworkMessage::Headers(headers) => {
                write_compact_size(&mut out, headers.len() as u64);
                for header in headers {
                    header.encode_to(&mut out);
                    write_compact_size(&mut out, 0);
                }
            }
            NetworkMessage::Ping(nonce) | NetworkMessage::Pong(nonce) => {
                out.extend_from_slice(&nonce.to_le_bytes())
            }
            NetworkMessage::FeeFilter(rate) => out.extend_from_slice(&rate.to_le_bytes()),
            NetworkMessage::Reject(r) => r.encode_to(&mut out),
            NetworkMessage::SendCmpct(m) => {
                out.push(m.announce as u8);
                out.extend_from_slice(&m.version.to_le_bytes());
            }
            NetworkMessage::CmpctBlock(c) => c.encode_to(&mut out),
            NetworkMessage::GetBlockTxn(r) => r.encode_to(&mut out),
            NetworkMessage::BlockTxn(b) => b.encode_to(&mut out),
            NetworkMessage::Alert(a) => {
                write_var_bytes(&mut out, &a.payload);
                write_var_bytes(&mut out, &a.signature);
            }
            NetworkMessage::Unknown { payload, .. } => out.extend_from_slice(payload),
            NetworkMessage::VerAck
            | NetworkMessage::XVerAck
            | NetworkMessage::SendHeaders
            | NetworkMessage::MemPool
            | NetworkMessage::GetAddr => {}
        }
        out
    }

    /// Decode `payload` according to `command`; unrecognized commands
    /// become `Unknown`
    pub fn decode_payload(command: &str, payload: &[u8]) -> Result<Self> {
        let msg = match command {
            "version" => NetworkMessage::Version(decode(payload)?),
            "verack" => {
                expect_empty(command, payload)?;
                NetworkMessage::VerAck
            }
            "xversion" => NetworkMessage::XVersion(decode(payload)?),
            "xverack" => {
                expect_empty(command, payload)?;
                NetworkMessage::XVerAck
            }
            "xupdate" => NetworkMessage::XUpdate(decode(payload)?),
            "addr" => {
                let mut reader = Reader::new(payload);
                let count = reader.read_count(30)?;
                let mut addresses = Vec::with_capacity(count);
                for _ in 0..count {
                    addresses.push(TimestampedAddress::decode_from(&mut reader)?);
                }
                reader.finish()?;
                NetworkMessage::Addr(AddrMessage { addresses })
            }
            "inv" => NetworkMessage::Inv(decode_inv(payload)?),
            "getdata" => NetworkMessage::GetData(decode_inv(payload)?),
            "notfound" => NetworkMessage::NotFound(decode_inv(payload)?),
            "getblocks" => {
                let mut reader = Reader::new(payload);
                let (version, locator, hash_stop) = decode_locator(&mut reader)?;
                reader.finish()?;
                NetworkMessage::GetBlocks(GetBlocksMessage { version, locator, hash_stop })
            }
            "getheaders" => {
                let mut reader = Reader::new(payload);
                let (version, locator, hash_stop) = decode_locator(&mut reader)?;
                reader.finish()?;
                NetworkMessage::GetHeaders(GetHeadersMessage { version, locator, hash_stop })
            }
            "tx" => NetworkMessage::Tx(decode(payload)?),
            "block" => NetworkMessage::Block(decode(payload)?),
            "headers" => NetworkMessage::Headers(decode_headers(payload)?),
            "sendheaders" => {
                expect_empty(command, payload)?;
                NetworkMessage::SendHeaders
            }
            "mempool" => {
                expect_empty(command, payload)?;
                NetworkMessage::MemPool
            }
            "getaddr" => {
                expect_empty(command, payload)?;
                NetworkMessage::GetAddr
            }
            "ping" => NetworkMessage::Ping(decode_u64(payload)?),
            "pong" => NetworkMessage::Pong(decode_u64(payload)?),
            "feefilter" => NetworkMessage::FeeFilter(decode_u64(payload)?),
            "reject" => NetworkMessage::Reject(decode(payload)?),
            "sendcmpct" => {
                let mut reader = Reader::new(payload);
                let announce = reader.read_bool()?;
                let version = reader.read_u64()?;
                reader.finish()?;
                NetworkMessage::SendCmpct(SendCmpctMessage { announce, version })
            }
            "cmpctblock" => NetworkMessage::CmpctBlock(decode(payload)?),
            "getblocktxn" => NetworkMessage::GetBlockTxn(decode(payload)?),
            "blocktxn" => NetworkMessage::BlockTxn(decode(payload)?),
            "alert" => {
                let mut reader = Reader::new(payload);
                let alert = AlertMessage {
                    payload: reader.read_var_bytes()?,
                    signature: reader.read_var_bytes()?,
                };
                reader.finish()?;
                NetworkMessage::Alert(alert)
            }
            other => NetworkMessage::Unknown { command: other.to_string(), payload: payload.to_vec() },
        };
        Ok(msg)
    }
}

// ============================================================================
// Framing
// ============================================================================

/// Decoded 24-byte frame header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHeader {
    pub magic: [u8; 4],
    pub command: String,
    pub length: u32,
    pub checksum: [u8; 4],
}

pub fn checksum(payload: &[u8]) -> [u8; 4] {
    let digest = hash256(payload);
    [digest[0], digest[1], digest[2], digest[3]]
}

fn command_field(command: &str) -> Result<[u8; 12]> {
    let bytes = command.as_bytes();
    if bytes.len() > 12 || !bytes.iter().all(|b| b.is_ascii_graphic()) {
        return Err(HarnessError::InvalidArgument(format!("invalid command {:?}", command)));
    }
    let mut field = [0u8; 12];
    field[..bytes.len()].copy_from_slice(bytes);
    Ok(field)
}

fn parse_command_field(field: &[u8; 12]) -> Result<String> {
    let end = field.iter().position(|&b| b == 0).unwrap_or(12);
    if field[end..].iter().any(|&b| b != 0) {
        return Err(HarnessError::malformed("command has bytes after padding"));
    }
    let name = &field[..end];
    if !name.iter().all(|b| b.is_ascii_graphic()) {
        return Err(HarnessError::malformed("command is not printable ASCII"));
    }
    Ok(String::from_utf8_lossy(name).into_owned())
}

impl MessageHeader {
    pub fn decode(bytes: &[u8; MESSAGE_HEADER_SIZE]) -> Result<Self> {
        let mut reader = Reader::new(bytes);
        let magic = reader.read_array()?;
        let command = parse_command_field(&reader.read_array()?)?;
        let length = reader.read_u32()?;
        let checksum = reader.read_array()?;
        Ok(MessageHeader { magic, command, length, checksum })
    }
}

/// Serialize `msg` into a complete frame
pub fn encode_frame(magic: [u8; 4], msg: &NetworkMessage) -> Result<Vec<u8>> {
    let payload = msg.encode_payload();
    let mut frame = Vec::with_capacity(MESSAGE_HEADER_SIZE + payload.len());
    frame.extend_from_slice(&magic);
    frame.extend_from_slice(&command_field(msg.command())?);
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&checksum(&payload));
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Try to take one frame from the front of `buf`
///
/// Returns `Ok(None)` until a full frame is buffered, otherwise the message
/// and the number of bytes consumed. Wrong magic, oversized length and
/// checksum mismatch are `MalformedMessage`.
pub fn decode_frame(magic: [u8; 4], buf: &[u8]) -> Result<Option<(NetworkMessage, usize)>> {
    if buf.len() < MESSAGE_HEADER_SIZE {
        return Ok(None);
    }
    let mut head = [0u8; MESSAGE_HEADER_SIZE];
    head.copy_from_slice(&buf[..MESSAGE_HEADER_SIZE]);
    let header = MessageHeader::decode(&head)?;
    if header.magic != magic {
        return Err(HarnessError::malformed(format!(
            "bad magic {}",
            hex::encode(header.magic)
        )));
    }
    let length = header.length as usize;
    if length > MAX_PROTOCOL_MESSAGE_LENGTH {
        return Err(HarnessError::malformed(format!(
            "{} payload of {} bytes exceeds limit",
            header.command, length
        )));
    }
    if buf.len() < MESSAGE_HEADER_SIZE + length {
        return Ok(None);
    }
    let payload = &buf[MESSAGE_HEADER_SIZE..MESSAGE_HEADER_SIZE + length];
    if checksum(payload) != header.checksum {
        return Err(HarnessError::malformed(format!("{} checksum mismatch", header.command)));
    }
    let msg = NetworkMessage::decode_payload(&header.command, payload)?;
    Ok(Some((msg, MESSAGE_HEADER_SIZE + length)))
}

//! Wire protocol constants and struct definitions.
//!
//! Every request, reply and callback is a single UDP datagram: a fixed
//! 24-byte header followed by an opcode-specific body. All multi-byte
//! integers are big-endian.
#![allow(clippy::upper_case_acronyms)]
#![allow(non_camel_case_types)]
use color_eyre::eyre::{bail, ensure};
use color_eyre::Result;
use std::error::Error;
use std::fmt;
use std::io::{self, prelude::*};

use bitflags::bitflags;
use byteorder::{ReadBytesExt, WriteBytesExt, BE};
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Leading tag of every datagram, b"BANK".
pub const MAGIC: u32 = 0x42414E4B;
/// Current protocol version.
pub const VERSION: u8 = 1;
/// Fixed header size in bytes.
pub const HEADER_LEN: usize = 24;
/// Largest datagram either side will receive.
pub const MAX_DATAGRAM: usize = 65535;
/// Width of the fixed password field.
pub const PASSWORD_LEN: usize = 16;

#[derive(Debug, Clone)]
pub struct ProtocolError(String);

impl ProtocolError {
    pub fn new<S: AsRef<str>>(s: S) -> Self {
        ProtocolError(s.as_ref().to_string())
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "bank protocol error: {}", self.0)?;
        Ok(())
    }
}

impl Error for ProtocolError {}

bitflags! {
    /// Request flag bits, echoed verbatim in the reply. All bits other than
    /// `AT_MOST_ONCE` are reserved and must be zero.
    pub struct MsgFlags: u16 {
        const AT_MOST_ONCE = 1 << 0;
    }
}

/// Kind of a datagram.
#[derive(IntoPrimitive, TryFromPrimitive, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgType {
    Request = 1,
    Reply = 2,
    Callback = 3,
}

/// Operations the server understands, plus the callback pseudo-op.
#[derive(IntoPrimitive, TryFromPrimitive, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u16)]
pub enum OpCode {
    OPEN = 1,
    CLOSE = 2,
    DEPOSIT = 3,
    WITHDRAW = 4,
    MONITOR_REGISTER = 5,
    QUERY_BALANCE = 6,
    TRANSFER = 7,
    CALLBACK_UPDATE = 100,
}

/// Result code carried in every reply.
#[derive(IntoPrimitive, TryFromPrimitive, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u16)]
pub enum Status {
    OK = 0,
    ERR_BAD_REQUEST = 1,
    ERR_AUTH = 2,
    ERR_NOT_FOUND = 3,
    ERR_CURRENCY = 4,
    ERR_INSUFFICIENT_FUNDS = 5,
    ERR_PASSWORD_FORMAT = 6,
}

/// Currency an account is denominated in.
#[derive(IntoPrimitive, TryFromPrimitive, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u16)]
pub enum Currency {
    CNY = 0,
    SGD = 1,
}

/// A single datagram, decoded as far as the header goes.
///
/// `op`, `flags` and `status` stay raw on purpose: a valid header with an
/// unknown opcode or reserved flag bits still gets a typed ERR_BAD_REQUEST
/// reply rather than a silent drop, and the reply must echo the offending
/// fields unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub msg_type: MsgType,
    pub op: u16,
    pub flags: u16,
    pub status: u16,
    pub request_id: u64,
    pub body: Vec<u8>,
}

impl Message {
    /// Build a client request.
    pub fn request(op: OpCode, flags: MsgFlags, request_id: u64, body: Vec<u8>) -> Self {
        Self {
            msg_type: MsgType::Request,
            op: op.into(),
            flags: flags.bits(),
            status: Status::OK.into(),
            request_id,
            body,
        }
    }

    /// Build the reply to `req`, echoing its `op`, `flags` and `request_id`.
    pub fn reply_to(req: &Message, status: Status, body: Vec<u8>) -> Self {
        Self {
            msg_type: MsgType::Reply,
            op: req.op,
            flags: req.flags,
            status: status.into(),
            request_id: req.request_id,
            body,
        }
    }

    /// Build an unsolicited monitor callback. Callbacks carry `request_id = 0`
    /// since they answer no request.
    pub fn callback(body: Vec<u8>) -> Self {
        Self {
            msg_type: MsgType::Callback,
            op: OpCode::CALLBACK_UPDATE.into(),
            flags: 0,
            status: Status::OK.into(),
            request_id: 0,
            body,
        }
    }

    pub fn at_most_once(&self) -> bool {
        self.flags & MsgFlags::AT_MOST_ONCE.bits() != 0
    }

    pub fn is_ok(&self) -> bool {
        self.status == u16::from(Status::OK)
    }

    pub fn put<W: Write>(&self, mut w: W) -> io::Result<()> {
        w.write_u32::<BE>(MAGIC)?;
        w.write_u8(VERSION)?;
        w.write_u8(self.msg_type.into())?;
        w.write_u16::<BE>(self.op)?;
        w.write_u16::<BE>(self.flags)?;
        w.write_u16::<BE>(self.status)?;
        w.write_u64::<BE>(self.request_id)?;
        w.write_u32::<BE>(self.body.len() as u32)?;
        w.write_all(&self.body)?;
        Ok(())
    }

    /// Encode into a fresh datagram buffer.
    pub fn encode(&self) -> Result<Vec<u8>> {
        ensure!(
            self.body.len() <= MAX_DATAGRAM - HEADER_LEN,
            ProtocolError(format!("body of {} bytes does not fit", self.body.len()))
        );
        let mut buf = Vec::with_capacity(HEADER_LEN + self.body.len());
        self.put(&mut buf)?;
        Ok(buf)
    }

    /// Decode a received datagram.
    ///
    /// Fails on a short header, wrong magic, unsupported version, unknown
    /// message type, or a `body_len` that disagrees with the datagram size.
    pub fn decode(datagram: &[u8]) -> Result<Self> {
        ensure!(
            datagram.len() >= HEADER_LEN,
            ProtocolError(format!("datagram of {} bytes is too short", datagram.len()))
        );
        let mut r = datagram;
        let magic = r.read_u32::<BE>()?;
        if magic != MAGIC {
            bail!(ProtocolError(format!("unexpected magic {magic:#010x}")));
        }
        let version = r.read_u8()?;
        if version != VERSION {
            bail!(ProtocolError(format!("unsupported version {version}")));
        }
        let msg_type = r.read_u8()?;
        let msg_type = MsgType::try_from(msg_type)
            .map_err(|_| ProtocolError(format!("unexpected message type {msg_type}")))?;
        let op = r.read_u16::<BE>()?;
        let flags = r.read_u16::<BE>()?;
        let status = r.read_u16::<BE>()?;
        let request_id = r.read_u64::<BE>()?;
        let body_len = r.read_u32::<BE>()? as usize;
        if body_len != r.len() {
            bail!(ProtocolError(format!(
                "body length {body_len} disagrees with {} remaining bytes",
                r.len()
            )));
        }
        Ok(Self {
            msg_type,
            op,
            flags,
            status,
            request_id,
            body: r.to_vec(),
        })
    }
}

/// Write a length-prefixed UTF-8 string (u16 length, max 65535 bytes).
pub fn put_string<W: Write>(mut w: W, s: &str) -> Result<()> {
    ensure!(
        s.len() <= u16::MAX as usize,
        ProtocolError(format!("string of {} bytes is too long", s.len()))
    );
    w.write_u16::<BE>(s.len() as u16)?;
    w.write_all(s.as_bytes())?;
    Ok(())
}

/// Read a length-prefixed UTF-8 string. Fails if the buffer runs out before
/// the announced length.
pub fn get_string<R: Read>(mut r: R) -> Result<String> {
    let len = r.read_u16::<BE>()?;
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf)?;
    String::from_utf8(buf).map_err(|_| ProtocolError::new("string is not UTF-8").into())
}

/// Write a password into the fixed 16-byte field, zero-padded at the end.
pub fn put_password<W: Write>(mut w: W, password: &str) -> Result<()> {
    ensure!(
        password.len() <= PASSWORD_LEN,
        ProtocolError(format!("password of {} bytes is too long", password.len()))
    );
    let mut field = [0u8; PASSWORD_LEN];
    field[..password.len()].copy_from_slice(password.as_bytes());
    w.write_all(&field)?;
    Ok(())
}

/// Read the fixed 16-byte password field, trimming trailing zero padding.
/// An empty result is legal here; rejecting it is the bank's job.
pub fn get_password<R: Read>(mut r: R) -> Result<String> {
    let mut field = [0u8; PASSWORD_LEN];
    r.read_exact(&mut field)?;
    let end = field.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
    String::from_utf8(field[..end].to_vec())
        .map_err(|_| ProtocolError::new("password is not UTF-8").into())
}

fn get_currency<R: Read>(mut r: R) -> Result<Currency> {
    let raw = r.read_u16::<BE>()?;
    Currency::try_from(raw).map_err(|_| ProtocolError(format!("unknown currency {raw}")).into())
}

/// OPEN request body.
#[derive(Debug, Clone, PartialEq)]
pub struct OpenRequest {
    pub name: String,
    pub password: String,
    pub currency: Currency,
    pub initial: f64,
}

impl OpenRequest {
    pub fn get<R: Read>(mut r: R) -> Result<Self> {
        let name = get_string(&mut r)?;
        let password = get_password(&mut r)?;
        let currency = get_currency(&mut r)?;
        let initial = r.read_f64::<BE>()?;
        Ok(Self {
            name,
            password,
            currency,
            initial,
        })
    }

    pub fn put<W: Write>(&self, mut w: W) -> Result<()> {
        put_string(&mut w, &self.name)?;
        put_password(&mut w, &self.password)?;
        w.write_u16::<BE>(self.currency.into())?;
        w.write_f64::<BE>(self.initial)?;
        Ok(())
    }
}

/// OPEN reply body.
#[derive(Debug, Clone, PartialEq)]
pub struct OpenReply {
    pub account_no: i32,
    pub balance: f64,
}

impl OpenReply {
    pub fn get<R: Read>(mut r: R) -> Result<Self> {
        let account_no = r.read_i32::<BE>()?;
        let balance = r.read_f64::<BE>()?;
        Ok(Self {
            account_no,
            balance,
        })
    }

    pub fn put<W: Write>(&self, mut w: W) -> Result<()> {
        w.write_i32::<BE>(self.account_no)?;
        w.write_f64::<BE>(self.balance)?;
        Ok(())
    }
}

/// CLOSE request body.
#[derive(Debug, Clone, PartialEq)]
pub struct CloseRequest {
    pub name: String,
    pub account_no: i32,
    pub password: String,
}

impl CloseRequest {
    pub fn get<R: Read>(mut r: R) -> Result<Self> {
        let name = get_string(&mut r)?;
        let account_no = r.read_i32::<BE>()?;
        let password = get_password(&mut r)?;
        Ok(Self {
            name,
            account_no,
            password,
        })
    }

    pub fn put<W: Write>(&self, mut w: W) -> Result<()> {
        put_string(&mut w, &self.name)?;
        w.write_i32::<BE>(self.account_no)?;
        put_password(&mut w, &self.password)?;
        Ok(())
    }
}

/// Reply body carrying a single informational string (CLOSE and
/// MONITOR_REGISTER).
#[derive(Debug, Clone, PartialEq)]
pub struct InfoReply {
    pub info: String,
}

impl InfoReply {
    pub fn get<R: Read>(mut r: R) -> Result<Self> {
        let info = get_string(&mut r)?;
        Ok(Self { info })
    }

    pub fn put<W: Write>(&self, mut w: W) -> Result<()> {
        put_string(&mut w, &self.info)?;
        Ok(())
    }
}

/// DEPOSIT and WITHDRAW request body.
#[derive(Debug, Clone, PartialEq)]
pub struct AmountRequest {
    pub name: String,
    pub account_no: i32,
    pub password: String,
    pub currency: Currency,
    pub amount: f64,
}

impl AmountRequest {
    pub fn get<R: Read>(mut r: R) -> Result<Self> {
        let name = get_string(&mut r)?;
        let account_no = r.read_i32::<BE>()?;
        let password = get_password(&mut r)?;
        let currency = get_currency(&mut r)?;
        let amount = r.read_f64::<BE>()?;
        Ok(Self {
            name,
            account_no,
            password,
            currency,
            amount,
        })
    }

    pub fn put<W: Write>(&self, mut w: W) -> Result<()> {
        put_string(&mut w, &self.name)?;
        w.write_i32::<BE>(self.account_no)?;
        put_password(&mut w, &self.password)?;
        w.write_u16::<BE>(self.currency.into())?;
        w.write_f64::<BE>(self.amount)?;
        Ok(())
    }
}

/// DEPOSIT and WITHDRAW reply body.
#[derive(Debug, Clone, PartialEq)]
pub struct BalanceReply {
    pub balance: f64,
}

impl BalanceReply {
    pub fn get<R: Read>(mut r: R) -> Result<Self> {
        let balance = r.read_f64::<BE>()?;
        Ok(Self { balance })
    }

    pub fn put<W: Write>(&self, mut w: W) -> Result<()> {
        w.write_f64::<BE>(self.balance)?;
        Ok(())
    }
}

/// QUERY_BALANCE request body.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryRequest {
    pub name: String,
    pub account_no: i32,
    pub password: String,
}

impl QueryRequest {
    pub fn get<R: Read>(mut r: R) -> Result<Self> {
        let name = get_string(&mut r)?;
        let account_no = r.read_i32::<BE>()?;
        let password = get_password(&mut r)?;
        Ok(Self {
            name,
            account_no,
            password,
        })
    }

    pub fn put<W: Write>(&self, mut w: W) -> Result<()> {
        put_string(&mut w, &self.name)?;
        w.write_i32::<BE>(self.account_no)?;
        put_password(&mut w, &self.password)?;
        Ok(())
    }
}

/// QUERY_BALANCE reply body.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryReply {
    pub currency: Currency,
    pub balance: f64,
}

impl QueryReply {
    pub fn get<R: Read>(mut r: R) -> Result<Self> {
        let currency = get_currency(&mut r)?;
        let balance = r.read_f64::<BE>()?;
        Ok(Self { currency, balance })
    }

    pub fn put<W: Write>(&self, mut w: W) -> Result<()> {
        w.write_u16::<BE>(self.currency.into())?;
        w.write_f64::<BE>(self.balance)?;
        Ok(())
    }
}

/// TRANSFER request body.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferRequest {
    pub name: String,
    pub from_account: i32,
    pub password: String,
    pub to_account: i32,
    pub currency: Currency,
    pub amount: f64,
}

impl TransferRequest {
    pub fn get<R: Read>(mut r: R) -> Result<Self> {
        let name = get_string(&mut r)?;
        let from_account = r.read_i32::<BE>()?;
        let password = get_password(&mut r)?;
        let to_account = r.read_i32::<BE>()?;
        let currency = get_currency(&mut r)?;
        let amount = r.read_f64::<BE>()?;
        Ok(Self {
            name,
            from_account,
            password,
            to_account,
            currency,
            amount,
        })
    }

    pub fn put<W: Write>(&self, mut w: W) -> Result<()> {
        put_string(&mut w, &self.name)?;
        w.write_i32::<BE>(self.from_account)?;
        put_password(&mut w, &self.password)?;
        w.write_i32::<BE>(self.to_account)?;
        w.write_u16::<BE>(self.currency.into())?;
        w.write_f64::<BE>(self.amount)?;
        Ok(())
    }
}

/// TRANSFER reply body.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferReply {
    pub from_balance: f64,
    pub to_balance: f64,
}

impl TransferReply {
    pub fn get<R: Read>(mut r: R) -> Result<Self> {
        let from_balance = r.read_f64::<BE>()?;
        let to_balance = r.read_f64::<BE>()?;
        Ok(Self {
            from_balance,
            to_balance,
        })
    }

    pub fn put<W: Write>(&self, mut w: W) -> Result<()> {
        w.write_f64::<BE>(self.from_balance)?;
        w.write_f64::<BE>(self.to_balance)?;
        Ok(())
    }
}

/// MONITOR_REGISTER request body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorRequest {
    pub seconds: u16,
}

impl MonitorRequest {
    pub fn get<R: Read>(mut r: R) -> Result<Self> {
        let seconds = r.read_u16::<BE>()?;
        Ok(Self { seconds })
    }

    pub fn put<W: Write>(&self, mut w: W) -> Result<()> {
        w.write_u16::<BE>(self.seconds)?;
        Ok(())
    }
}

/// CALLBACK_UPDATE body, announcing one account's new state to a monitor.
#[derive(Debug, Clone, PartialEq)]
pub struct Update {
    /// Opcode of the operation that triggered this update.
    pub update_type: OpCode,
    pub account_no: i32,
    pub currency: Currency,
    pub new_balance: f64,
    pub info: String,
}

impl Update {
    pub fn get<R: Read>(mut r: R) -> Result<Self> {
        let raw = r.read_u16::<BE>()?;
        let update_type = OpCode::try_from(raw)
            .map_err(|_| ProtocolError(format!("unknown update type {raw}")))?;
        let account_no = r.read_i32::<BE>()?;
        let currency = get_currency(&mut r)?;
        let new_balance = r.read_f64::<BE>()?;
        let info = get_string(&mut r)?;
        Ok(Self {
            update_type,
            account_no,
            currency,
            new_balance,
            info,
        })
    }

    pub fn put<W: Write>(&self, mut w: W) -> Result<()> {
        w.write_u16::<BE>(self.update_type.into())?;
        w.write_i32::<BE>(self.account_no)?;
        w.write_u16::<BE>(self.currency.into())?;
        w.write_f64::<BE>(self.new_balance)?;
        put_string(&mut w, &self.info)?;
        Ok(())
    }
}

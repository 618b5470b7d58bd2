//! Bank client: the request/reply invoker and the monitor callback receiver.
//!
//! Both share one UDP socket, so every received datagram is filtered by
//! message type and request id — the next datagram on the socket is not
//! necessarily the reply to the request just sent. Late replies from earlier
//! attempts and unsolicited callbacks arrive interleaved.

use color_eyre::eyre::bail;
use color_eyre::Result;

use std::error::Error;
use std::fmt;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::time::{Duration, Instant};

use log::{debug, info};

use crate::proto::{
    AmountRequest, BalanceReply, CloseRequest, Currency, InfoReply, Message, MonitorRequest,
    MsgFlags, MsgType, OpCode, OpenReply, OpenRequest, ProtocolError, QueryReply, QueryRequest,
    Status, TransferReply, TransferRequest, Update, MAX_DATAGRAM,
};

/// How often the monitor receiver wakes up to check whether its window has
/// closed.
const MONITOR_POLL: Duration = Duration::from_secs(1);

/// All send attempts for a request went unanswered.
#[derive(Debug, Clone, Copy)]
pub struct CommunicationError {
    pub attempts: u32,
}

impl fmt::Display for CommunicationError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "no reply from server after {} attempts", self.attempts)
    }
}

impl Error for CommunicationError {}

/// The server answered with a non-OK status. Never retried; surfaced to the
/// caller verbatim.
#[derive(Debug, Clone, Copy)]
pub struct OperationFailed(pub Status);

impl fmt::Display for OperationFailed {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "server rejected the operation: {:?}", self.0)
    }
}

impl Error for OperationFailed {}

/// Which invocation semantic requests are sent under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Semantics {
    AtLeastOnce,
    AtMostOnce,
}

impl Semantics {
    /// "atmost" and "at-most-once" select at-most-once; anything else falls
    /// back to at-least-once.
    pub fn parse(s: &str) -> Self {
        match s {
            "atmost" | "at-most-once" => Semantics::AtMostOnce,
            _ => Semantics::AtLeastOnce,
        }
    }

    fn flags(self) -> MsgFlags {
        match self {
            Semantics::AtMostOnce => MsgFlags::AT_MOST_ONCE,
            Semantics::AtLeastOnce => MsgFlags::empty(),
        }
    }
}

/// Client tunables.
#[derive(Debug, Clone, Copy)]
pub struct ClientConfig {
    pub semantics: Semantics,
    /// How long one attempt waits for a reply.
    pub timeout: Duration,
    /// Total number of send attempts before giving up.
    pub retries: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            semantics: Semantics::AtLeastOnce,
            timeout: Duration::from_millis(1000),
            retries: 3,
        }
    }
}

/// A connection-less handle to one bank server.
#[derive(Debug)]
pub struct Client {
    socket: UdpSocket,
    server: SocketAddr,
    config: ClientConfig,
    salt: u64,
    seq: u64,
}

fn is_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

fn expect_ok(reply: Message) -> Result<Message> {
    if reply.is_ok() {
        return Ok(reply);
    }
    match Status::try_from(reply.status) {
        Ok(status) => bail!(OperationFailed(status)),
        Err(_) => bail!(ProtocolError::new(format!(
            "unknown status {} in reply",
            reply.status
        ))),
    }
}

impl Client {
    /// Bind an ephemeral local socket aimed at `server`.
    pub fn connect(server: SocketAddr, config: ClientConfig) -> Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", 0))?;
        socket.set_read_timeout(Some(config.timeout))?;
        Ok(Self {
            socket,
            server,
            config,
            salt: rand::random(),
            seq: 0,
        })
    }

    /// Fresh non-negative request id: a monotonic counter XOR a per-process
    /// salt, masked to 63 bits. Unlike a bare random draw this cannot repeat
    /// within a dedup window.
    fn next_request_id(&mut self) -> u64 {
        self.seq = self.seq.wrapping_add(1);
        (self.seq ^ self.salt) & (i64::MAX as u64)
    }

    /// Send one request and wait for its reply, retransmitting on timeout.
    ///
    /// Datagrams that fail to decode, are not replies, or answer a different
    /// request id are discarded and the wait continues. A matched reply is
    /// returned even when its status is non-OK.
    pub fn call(&mut self, op: OpCode, body: Vec<u8>) -> Result<Message> {
        let request_id = self.next_request_id();
        let datagram =
            Message::request(op, self.config.semantics.flags(), request_id, body).encode()?;
        let mut buf = vec![0u8; MAX_DATAGRAM];
        for attempt in 1..=self.config.retries {
            self.socket.send_to(&datagram, self.server)?;
            debug!(target: "ubank", "{:?} attempt {attempt} (request id {request_id})", op);
            if let Some(reply) = self.await_reply(request_id, &mut buf)? {
                self.socket.set_read_timeout(Some(self.config.timeout))?;
                return Ok(reply);
            }
            info!(
                target: "ubank",
                "timeout waiting for reply (attempt {attempt}/{})",
                self.config.retries
            );
        }
        self.socket.set_read_timeout(Some(self.config.timeout))?;
        bail!(CommunicationError {
            attempts: self.config.retries
        })
    }

    /// Wait up to one timeout interval for the reply matching `request_id`.
    /// Returns None when the interval lapses with no match.
    fn await_reply(&mut self, request_id: u64, buf: &mut [u8]) -> Result<Option<Message>> {
        let deadline = Instant::now() + self.config.timeout;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            self.socket.set_read_timeout(Some(deadline - now))?;
            let n = match self.socket.recv_from(buf) {
                Ok((n, _)) => n,
                Err(err) if is_timeout(&err) => return Ok(None),
                Err(err) => return Err(err.into()),
            };
            let reply = match Message::decode(&buf[..n]) {
                Ok(msg) => msg,
                Err(err) => {
                    debug!(target: "ubank", "discarding undecodable datagram: {err:#}");
                    continue;
                }
            };
            if reply.msg_type != MsgType::Reply || reply.request_id != request_id {
                debug!(
                    target: "ubank",
                    "discarding {:?} with request id {}",
                    reply.msg_type, reply.request_id
                );
                continue;
            }
            return Ok(Some(reply));
        }
    }

    /// Open an account.
    pub fn open(
        &mut self,
        name: &str,
        password: &str,
        currency: Currency,
        initial: f64,
    ) -> Result<OpenReply> {
        let mut body = vec![];
        OpenRequest {
            name: name.to_string(),
            password: password.to_string(),
            currency,
            initial,
        }
        .put(&mut body)?;
        let reply = expect_ok(self.call(OpCode::OPEN, body)?)?;
        OpenReply::get(&reply.body[..])
    }

    /// Close an account.
    pub fn close(&mut self, name: &str, account_no: i32, password: &str) -> Result<InfoReply> {
        let mut body = vec![];
        CloseRequest {
            name: name.to_string(),
            account_no,
            password: password.to_string(),
        }
        .put(&mut body)?;
        let reply = expect_ok(self.call(OpCode::CLOSE, body)?)?;
        InfoReply::get(&reply.body[..])
    }

    /// Deposit into an account and return the new balance.
    pub fn deposit(
        &mut self,
        name: &str,
        account_no: i32,
        password: &str,
        currency: Currency,
        amount: f64,
    ) -> Result<BalanceReply> {
        let body = Self::amount_body(name, account_no, password, currency, amount)?;
        let reply = expect_ok(self.call(OpCode::DEPOSIT, body)?)?;
        BalanceReply::get(&reply.body[..])
    }

    /// Withdraw from an account and return the new balance.
    pub fn withdraw(
        &mut self,
        name: &str,
        account_no: i32,
        password: &str,
        currency: Currency,
        amount: f64,
    ) -> Result<BalanceReply> {
        let body = Self::amount_body(name, account_no, password, currency, amount)?;
        let reply = expect_ok(self.call(OpCode::WITHDRAW, body)?)?;
        BalanceReply::get(&reply.body[..])
    }

    fn amount_body(
        name: &str,
        account_no: i32,
        password: &str,
        currency: Currency,
        amount: f64,
    ) -> Result<Vec<u8>> {
        let mut body = vec![];
        AmountRequest {
            name: name.to_string(),
            account_no,
            password: password.to_string(),
            currency,
            amount,
        }
        .put(&mut body)?;
        Ok(body)
    }

    /// Query an account's currency and balance.
    pub fn query_balance(
        &mut self,
        name: &str,
        account_no: i32,
        password: &str,
    ) -> Result<QueryReply> {
        let mut body = vec![];
        QueryRequest {
            name: name.to_string(),
            account_no,
            password: password.to_string(),
        }
        .put(&mut body)?;
        let reply = expect_ok(self.call(OpCode::QUERY_BALANCE, body)?)?;
        QueryReply::get(&reply.body[..])
    }

    /// Transfer between two accounts and return both new balances.
    pub fn transfer(
        &mut self,
        name: &str,
        from_account: i32,
        password: &str,
        to_account: i32,
        currency: Currency,
        amount: f64,
    ) -> Result<TransferReply> {
        let mut body = vec![];
        TransferRequest {
            name: name.to_string(),
            from_account,
            password: password.to_string(),
            to_account,
            currency,
            amount,
        }
        .put(&mut body)?;
        let reply = expect_ok(self.call(OpCode::TRANSFER, body)?)?;
        TransferReply::get(&reply.body[..])
    }

    /// Subscribe this client's endpoint to update callbacks for `seconds`
    /// seconds. Follow up with [`Client::watch_updates`] to receive them.
    pub fn register_monitor(&mut self, seconds: u16) -> Result<InfoReply> {
        let mut body = vec![];
        MonitorRequest { seconds }.put(&mut body)?;
        let reply = expect_ok(self.call(OpCode::MONITOR_REGISTER, body)?)?;
        InfoReply::get(&reply.body[..])
    }

    /// Poll the socket for callback datagrams until the monitoring window
    /// closes, delivering each decoded update to `sink`. Everything that is
    /// not a callback is dropped; no requests may be issued meanwhile since
    /// they share this socket. The normal receive timeout is restored on
    /// exit.
    pub fn watch_updates<F: FnMut(Update)>(&mut self, seconds: u16, mut sink: F) -> Result<()> {
        let deadline = Instant::now() + Duration::from_secs(u64::from(seconds));
        self.socket.set_read_timeout(Some(MONITOR_POLL))?;
        let result = self.poll_updates(deadline, &mut sink);
        self.socket.set_read_timeout(Some(self.config.timeout))?;
        result
    }

    fn poll_updates<F: FnMut(Update)>(&mut self, deadline: Instant, sink: &mut F) -> Result<()> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        while Instant::now() < deadline {
            let n = match self.socket.recv_from(&mut buf) {
                Ok((n, _)) => n,
                Err(err) if is_timeout(&err) => continue,
                Err(err) => return Err(err.into()),
            };
            let msg = match Message::decode(&buf[..n]) {
                Ok(msg) => msg,
                Err(_) => continue,
            };
            if msg.msg_type != MsgType::Callback || msg.op != u16::from(OpCode::CALLBACK_UPDATE) {
                continue;
            }
            match Update::get(&msg.body[..]) {
                Ok(update) => sink(update),
                Err(err) => debug!(target: "ubank", "discarding malformed callback: {err:#}"),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn semantics_parsing() {
        assert_eq!(Semantics::parse("atmost"), Semantics::AtMostOnce);
        assert_eq!(Semantics::parse("at-most-once"), Semantics::AtMostOnce);
        assert_eq!(Semantics::parse("atleast"), Semantics::AtLeastOnce);
        assert_eq!(Semantics::parse("anything"), Semantics::AtLeastOnce);
        assert_eq!(Semantics::parse(""), Semantics::AtLeastOnce);
    }

    #[test]
    fn request_ids_are_non_negative_and_distinct() {
        let server = "127.0.0.1:9000".parse().unwrap();
        let mut client = Client::connect(server, ClientConfig::default()).unwrap();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..1000 {
            let id = client.next_request_id();
            assert!(id <= i64::MAX as u64);
            assert!(seen.insert(id), "request id repeated");
        }
    }

    #[test]
    fn expect_ok_surfaces_the_status() {
        let req = Message::request(OpCode::DEPOSIT, MsgFlags::empty(), 1, vec![]);
        let reply = Message::reply_to(&req, Status::ERR_INSUFFICIENT_FUNDS, vec![]);
        let err = expect_ok(reply).unwrap_err();
        let failed = err.downcast_ref::<OperationFailed>().unwrap();
        assert_eq!(failed.0, Status::ERR_INSUFFICIENT_FUNDS);
    }
}

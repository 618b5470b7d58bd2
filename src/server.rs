//! UDP bank server.
//!
//! A single-threaded receive loop: decode one datagram, consult the reply
//! cache for at-most-once retransmits, otherwise run the operation against
//! the bank, then send the reply and fan callbacks out to registered
//! monitors. Simulated request/reply loss is applied here so the two
//! invocation semantics can be compared empirically.

#![deny(missing_docs)]
use color_eyre::Result;

use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use rand::Rng;

use crate::bank::Bank;
use crate::dedup::{DedupCache, DEFAULT_TTL};
use crate::monitor::MonitorRegistry;
use crate::proto::{
    AmountRequest, BalanceReply, CloseRequest, InfoReply, Message, MonitorRequest, MsgFlags,
    MsgType, OpCode, OpenReply, OpenRequest, QueryReply, QueryRequest, Status, TransferReply,
    TransferRequest, Update, MAX_DATAGRAM,
};

/// Tunables for a server instance.
#[derive(Debug, Clone, Copy)]
pub struct ServerConfig {
    /// Probability in [0,1) of dropping an incoming request unprocessed.
    pub loss_req: f64,
    /// Probability in [0,1) of dropping an outgoing reply. Callbacks are
    /// exempt.
    pub loss_rep: f64,
    /// Lifetime of a cached at-most-once reply.
    pub dedup_ttl: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            loss_req: 0.0,
            loss_rep: 0.0,
            dedup_ttl: DEFAULT_TTL,
        }
    }
}

/// The bank server: one UDP socket, the account store, the reply cache and
/// the monitor registry.
#[derive(Debug)]
pub struct Server {
    socket: UdpSocket,
    bank: Bank,
    dedup: DedupCache,
    monitors: MonitorRegistry,
    config: ServerConfig,
}

impl Server {
    /// Bind a UDP socket at `addr` and construct a server around it.
    pub fn bind<A: ToSocketAddrs>(addr: A, config: ServerConfig) -> Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        Ok(Self {
            socket,
            bank: Bank::new(),
            dedup: DedupCache::new(config.dedup_ttl),
            monitors: MonitorRegistry::new(),
            config,
        })
    }

    /// The bound address, useful when binding to port 0.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Receive and process datagrams forever. Never returns except on an
    /// unrecoverable socket error; the process is terminated externally.
    pub fn run(mut self) -> Result<()> {
        let mut rng = rand::thread_rng();
        let mut buf = vec![0u8; MAX_DATAGRAM];
        info!(target: "ubank", "listening on {}", self.socket.local_addr()?);
        loop {
            let (n, peer) = match self.socket.recv_from(&mut buf) {
                Ok(received) => received,
                Err(err) => {
                    warn!(target: "ubank", "receive failed: {err}");
                    continue;
                }
            };
            // sweep once per datagram, against the arrival time; recv_from
            // blocks indefinitely, so an instant taken before it would let
            // entries that lapsed during the wait replay or fan out
            let now = Instant::now();
            self.dedup.sweep(now);
            self.monitors.sweep(now);
            if rng.gen::<f64>() < self.config.loss_req {
                info!(target: "ubank", "DROP request from {peer}");
                continue;
            }
            let req = match Message::decode(&buf[..n]) {
                Ok(msg) => msg,
                Err(err) => {
                    // may not be a protocol peer at all; drop silently
                    warn!(target: "ubank", "bad request from {peer}: {err:#}");
                    continue;
                }
            };
            if req.msg_type != MsgType::Request {
                warn!(target: "ubank", "unexpected {:?} from {peer}", req.msg_type);
                continue;
            }

            let at_most_once = req.at_most_once();
            let dedup_key = DedupCache::key(peer, req.request_id);
            if at_most_once {
                if let Some(cached) = self.dedup.lookup(&dedup_key, now) {
                    if rng.gen::<f64>() < self.config.loss_rep {
                        info!(target: "ubank", "DROP reply to {peer}");
                        continue;
                    }
                    debug!(target: "ubank", "replaying cached reply for {dedup_key}");
                    if let Err(err) = self.socket.send_to(cached, peer) {
                        warn!(target: "ubank", "send to {peer} failed: {err}");
                    }
                    continue;
                }
            }

            let (reply, updates) = self.handle_request(&req, peer, now);
            let reply_bytes = match reply.encode() {
                Ok(bytes) => bytes,
                Err(err) => {
                    warn!(target: "ubank", "encoding reply failed: {err:#}");
                    continue;
                }
            };
            // cache before the loss draw: a dropped reply must still be
            // replayed, not re-executed, when the retransmit arrives
            if at_most_once {
                self.dedup.insert(dedup_key, reply_bytes.clone(), now);
            }
            if rng.gen::<f64>() < self.config.loss_rep {
                info!(target: "ubank", "DROP reply to {peer}");
            } else if let Err(err) = self.socket.send_to(&reply_bytes, peer) {
                warn!(target: "ubank", "send to {peer} failed: {err}");
            }
            for update in &updates {
                if let Err(err) = self.fan_out(update) {
                    warn!(target: "ubank", "callback fan-out failed: {err:#}");
                }
            }
        }
    }

    /// Route a decoded request and build its reply, plus any monitor updates
    /// the operation generated.
    fn handle_request(
        &mut self,
        req: &Message,
        peer: SocketAddr,
        now: Instant,
    ) -> (Message, Vec<Update>) {
        if req.flags & !MsgFlags::all().bits() != 0 {
            warn!(target: "ubank", "reserved flag bits {:#06x} from {peer}", req.flags);
            return (Message::reply_to(req, Status::ERR_BAD_REQUEST, vec![]), vec![]);
        }
        let op = match OpCode::try_from(req.op) {
            Ok(op) => op,
            Err(_) => {
                warn!(target: "ubank", "unknown opcode {} from {peer}", req.op);
                return (Message::reply_to(req, Status::ERR_BAD_REQUEST, vec![]), vec![]);
            }
        };
        info!(target: "ubank", "{:?} from {peer} (request id {})", op, req.request_id);
        match self.execute(op, &req.body, peer, now) {
            Ok((body, updates)) => (Message::reply_to(req, Status::OK, body), updates),
            Err(status) => {
                debug!(target: "ubank", "{:?} failed with {:?}", op, status);
                (Message::reply_to(req, status, vec![]), vec![])
            }
        }
    }

    /// Run one operation. A failure reply carries an empty body, so errors
    /// reduce to a status code.
    fn execute(
        &mut self,
        op: OpCode,
        body: &[u8],
        peer: SocketAddr,
        now: Instant,
    ) -> Result<(Vec<u8>, Vec<Update>), Status> {
        match op {
            OpCode::OPEN => {
                let req = OpenRequest::get(body).map_err(|_| Status::ERR_BAD_REQUEST)?;
                let (account_no, balance) =
                    self.bank
                        .open(&req.name, &req.password, req.currency, req.initial)?;
                let mut out = vec![];
                OpenReply {
                    account_no,
                    balance,
                }
                .put(&mut out)
                .map_err(|_| Status::ERR_BAD_REQUEST)?;
                let update = Update {
                    update_type: OpCode::OPEN,
                    account_no,
                    currency: req.currency,
                    new_balance: balance,
                    info: format!("account {account_no} opened"),
                };
                Ok((out, vec![update]))
            }
            OpCode::CLOSE => {
                let req = CloseRequest::get(body).map_err(|_| Status::ERR_BAD_REQUEST)?;
                let account = self.bank.close(&req.name, req.account_no, &req.password)?;
                let info = format!("account {} closed", account.account_no);
                let mut out = vec![];
                InfoReply { info: info.clone() }
                    .put(&mut out)
                    .map_err(|_| Status::ERR_BAD_REQUEST)?;
                let update = Update {
                    update_type: OpCode::CLOSE,
                    account_no: account.account_no,
                    currency: account.currency,
                    new_balance: account.balance,
                    info,
                };
                Ok((out, vec![update]))
            }
            OpCode::DEPOSIT => {
                let req = AmountRequest::get(body).map_err(|_| Status::ERR_BAD_REQUEST)?;
                let balance = self.bank.deposit(
                    &req.name,
                    req.account_no,
                    &req.password,
                    req.currency,
                    req.amount,
                )?;
                let mut out = vec![];
                BalanceReply { balance }
                    .put(&mut out)
                    .map_err(|_| Status::ERR_BAD_REQUEST)?;
                let update = Update {
                    update_type: OpCode::DEPOSIT,
                    account_no: req.account_no,
                    currency: req.currency,
                    new_balance: balance,
                    info: format!("deposit of {:.2} to account {}", req.amount, req.account_no),
                };
                Ok((out, vec![update]))
            }
            OpCode::WITHDRAW => {
                let req = AmountRequest::get(body).map_err(|_| Status::ERR_BAD_REQUEST)?;
                let balance = self.bank.withdraw(
                    &req.name,
                    req.account_no,
                    &req.password,
                    req.currency,
                    req.amount,
                )?;
                let mut out = vec![];
                BalanceReply { balance }
                    .put(&mut out)
                    .map_err(|_| Status::ERR_BAD_REQUEST)?;
                let update = Update {
                    update_type: OpCode::WITHDRAW,
                    account_no: req.account_no,
                    currency: req.currency,
                    new_balance: balance,
                    info: format!(
                        "withdrawal of {:.2} from account {}",
                        req.amount, req.account_no
                    ),
                };
                Ok((out, vec![update]))
            }
            OpCode::QUERY_BALANCE => {
                let req = QueryRequest::get(body).map_err(|_| Status::ERR_BAD_REQUEST)?;
                let (currency, balance) =
                    self.bank.query(&req.name, req.account_no, &req.password)?;
                let mut out = vec![];
                QueryReply { currency, balance }
                    .put(&mut out)
                    .map_err(|_| Status::ERR_BAD_REQUEST)?;
                Ok((out, vec![]))
            }
            OpCode::TRANSFER => {
                let req = TransferRequest::get(body).map_err(|_| Status::ERR_BAD_REQUEST)?;
                let (from_balance, to_balance) = self.bank.transfer(
                    &req.name,
                    req.from_account,
                    &req.password,
                    req.to_account,
                    req.currency,
                    req.amount,
                )?;
                let mut out = vec![];
                TransferReply {
                    from_balance,
                    to_balance,
                }
                .put(&mut out)
                .map_err(|_| Status::ERR_BAD_REQUEST)?;
                // one callback per affected account, debited side first
                let updates = vec![
                    Update {
                        update_type: OpCode::TRANSFER,
                        account_no: req.from_account,
                        currency: req.currency,
                        new_balance: from_balance,
                        info: format!(
                            "transfer of {:.2} to account {}",
                            req.amount, req.to_account
                        ),
                    },
                    Update {
                        update_type: OpCode::TRANSFER,
                        account_no: req.to_account,
                        currency: req.currency,
                        new_balance: to_balance,
                        info: format!(
                            "transfer of {:.2} from account {}",
                            req.amount, req.from_account
                        ),
                    },
                ];
                Ok((out, updates))
            }
            OpCode::MONITOR_REGISTER => {
                let req = MonitorRequest::get(body).map_err(|_| Status::ERR_BAD_REQUEST)?;
                if req.seconds == 0 {
                    return Err(Status::ERR_BAD_REQUEST);
                }
                self.monitors.register(peer, req.seconds, now);
                info!(
                    target: "ubank",
                    "monitor registered for {peer} ({}s, {} active)",
                    req.seconds,
                    self.monitors.len()
                );
                let mut out = vec![];
                InfoReply {
                    info: format!("monitoring updates for {}s", req.seconds),
                }
                .put(&mut out)
                .map_err(|_| Status::ERR_BAD_REQUEST)?;
                Ok((out, vec![]))
            }
            // callbacks are server-to-client only
            OpCode::CALLBACK_UPDATE => Err(Status::ERR_BAD_REQUEST),
        }
    }

    /// Send one callback datagram per live monitor entry. Best-effort: not
    /// cached, not retried, not subject to the loss simulation.
    fn fan_out(&self, update: &Update) -> Result<()> {
        if self.monitors.is_empty() {
            return Ok(());
        }
        let mut body = vec![];
        update.put(&mut body)?;
        let datagram = Message::callback(body).encode()?;
        for endpoint in self.monitors.endpoints() {
            debug!(
                target: "ubank",
                "callback {:?} for account {} to {endpoint}",
                update.update_type, update.account_no
            );
            if let Err(err) = self.socket.send_to(&datagram, endpoint) {
                warn!(target: "ubank", "callback to {endpoint} failed: {err}");
            }
        }
        Ok(())
    }
}

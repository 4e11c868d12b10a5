//! In-memory authoritative DNS server for tests.
//!
//! Answers `A` queries with loopback, `TXT` queries from the record store, and `NS`/`SOA` queries with
//! obviously invalid placeholder data. Every other type is answered with SERVFAIL.

use super::MockError;
use hickory_proto::{
    op::{
        Message,
        MessageType,
        OpCode,
        Query,
        ResponseCode,
    },
    rr::{
        rdata::{
            A,
            NS,
            SOA,
            TXT,
        },
        Name,
        RData,
        Record,
        RecordType,
    },
    ProtoError,
};
use std::{
    collections::HashMap,
    mem,
    net::{
        Ipv4Addr,
        SocketAddr,
    },
    sync::{
        Arc,
        PoisonError,
        RwLock,
    },
};
use tokio::{
    net::UdpSocket,
    sync::oneshot,
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

const TTL: u32 = 5;
const PLACEHOLDER_NS: &str = "ns.example-acme-webhook.invalid.";
const PLACEHOLDER_MBOX: &str = "hostmaster.example-acme-webhook.invalid.";
/// Longest string a single TXT character-string can hold.
const MAX_TXT_LEN: usize = 255;

#[derive(thiserror::Error, Debug)]
enum AnswerError {
    #[error("unimplemented record type {0}")]
    Unsupported(RecordType),

    #[error("invalid name: {0}")]
    Name(#[from] ProtoError),
}

/// TXT records by fully qualified name. Names are matched exactly as given, including case and trailing dot.
#[derive(Clone, Debug, Default)]
pub struct TxtRecords(Arc<RwLock<HashMap<String, String>>>);

impl TxtRecords {
    /// Adds or replaces the TXT record for `fqdn`.
    pub fn present(&self, fqdn: impl Into<String>, value: impl Into<String>) {
        let fqdn = fqdn.into();
        let value = value.into();
        trace!(%fqdn, %value, "present TXT record");
        self.0
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(fqdn, value);
    }

    /// Removes the TXT record for `fqdn`, if any.
    pub fn cleanup(&self, fqdn: &str) {
        trace!(%fqdn, "cleanup TXT record");
        self.0
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(fqdn);
    }

    pub fn get(&self, fqdn: &str) -> Option<String> {
        self.0
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(fqdn)
            .cloned()
    }

    /// Builds the reply to `req`.
    ///
    /// Only standard queries are answered. If any question cannot be answered the whole reply becomes
    /// SERVFAIL and the remaining questions are skipped.
    pub fn handle_request(&self, req: &Message) -> Message {
        let mut msg = reply_to(req);

        if req.op_code() == OpCode::Query {
            for query in req.queries() {
                if let Err(err) = self.add_answer(query, &mut msg) {
                    error!(name = %query.name(), ty = %query.query_type(), "unable to answer: {err}");
                    // drop answers of earlier questions
                    msg = reply_to(req);
                    msg.set_response_code(ResponseCode::ServFail);
                    break;
                }
            }
        }

        msg
    }

    fn add_answer(&self, query: &Query, msg: &mut Message) -> Result<(), AnswerError> {
        let name = query.name().clone();
        match query.query_type() {
            RecordType::A => {
                msg.add_answer(Record::from_rdata(name, TTL, RData::A(A(Ipv4Addr::LOCALHOST))));
            }

            RecordType::TXT => {
                let Some(value) = self.get(&name.to_string()) else {
                    warn!(%name, "no TXT record");
                    msg.set_response_code(ResponseCode::NXDomain);
                    return Ok(());
                };
                let txt = TXT::new(character_strings(&value));
                msg.add_answer(Record::from_rdata(name, TTL, RData::TXT(txt)));
            }

            RecordType::NS => {
                let ns = Name::from_ascii(PLACEHOLDER_NS)?;
                msg.add_answer(Record::from_rdata(name, TTL, RData::NS(NS(ns))));
            }

            RecordType::SOA => {
                let ns = Name::from_ascii(PLACEHOLDER_NS)?;
                let mbox = Name::from_ascii(PLACEHOLDER_MBOX)?;
                let soa = SOA::new(ns.clone(), mbox, 20, 5, 5, 5, 5);
                msg.add_answer(Record::from_rdata(ns, TTL, RData::SOA(soa)));
            }

            ty => return Err(AnswerError::Unsupported(ty)),
        }
        Ok(())
    }
}

/// Empty reply to `req` carrying its id, opcode, RD flag and questions.
fn reply_to(req: &Message) -> Message {
    let mut msg = Message::new(req.id(), MessageType::Response, req.op_code());
    msg.set_recursion_desired(req.recursion_desired());
    msg.add_queries(req.queries().iter().cloned());
    msg
}

/// Splits `value` into character-strings of at most [`MAX_TXT_LEN`] bytes, never inside a UTF-8 sequence.
fn character_strings(value: &str) -> Vec<String> {
    let mut strings = Vec::new();
    let mut rest = value;
    while rest.len() > MAX_TXT_LEN {
        let mut end = MAX_TXT_LEN;
        while !rest.is_char_boundary(end) {
            end -= 1;
        }
        let (head, tail) = rest.split_at(end);
        strings.push(head.to_string());
        rest = tail;
    }
    strings.push(rest.to_string());
    strings
}

enum State {
    Bound(UdpSocket),
    Running {
        stop: oneshot::Sender<()>,
        shutdown: JoinHandle<()>,
        serve: JoinHandle<()>,
    },
    Closed,
}

/// A test DNS server serving a [`TxtRecords`] store over UDP.
///
/// The socket is bound on creation so the address is known before [`MockDns::run`]. Once closed the server
/// cannot be restarted, create a new one instead.
pub struct MockDns {
    records: TxtRecords,
    addr: SocketAddr,
    state: State,
}

impl MockDns {
    /// Binds to `127.0.0.1` on a free port.
    pub async fn new() -> Result<Self, MockError> {
        Self::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0))).await
    }

    pub async fn bind(addr: SocketAddr) -> Result<Self, MockError> {
        let socket = UdpSocket::bind(addr).await.map_err(MockError::Bind)?;
        let addr = socket.local_addr().map_err(MockError::Bind)?;
        Ok(Self {
            records: TxtRecords::default(),
            addr,
            state: State::Bound(socket),
        })
    }

    /// The address the server is listening on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn records(&self) -> &TxtRecords {
        &self.records
    }

    pub fn present(&self, fqdn: impl Into<String>, value: impl Into<String>) {
        self.records.present(fqdn, value)
    }

    pub fn cleanup(&self, fqdn: &str) {
        self.records.cleanup(fqdn)
    }

    /// Starts serving queries in the background.
    ///
    /// A failure to receive on the bound socket terminates the process: in a test it means the harness
    /// itself is broken.
    pub fn run(&mut self) -> Result<(), MockError> {
        let socket = match mem::replace(&mut self.state, State::Closed) {
            State::Bound(socket) => socket,
            state @ State::Running { .. } => {
                self.state = state;
                return Err(MockError::AlreadyRunning);
            }
            State::Closed => return Err(MockError::AlreadyClosed),
        };

        let (stop, stop_rx) = oneshot::channel();
        let token = CancellationToken::new();
        let addr = self.addr;

        let shutdown = tokio::spawn({
            let token = token.clone();
            async move {
                // a dropped sender stops the server as well
                let _ = stop_rx.await;
                debug!(%addr, "stopping mock DNS server");
                token.cancel();
            }
        });

        let serve = tokio::spawn(serve(socket, self.records.clone(), token));

        info!(%addr, "mock DNS server listening");
        self.state = State::Running { stop, shutdown, serve };
        Ok(())
    }

    /// Signals shutdown and waits for both background tasks. Must only be called once.
    pub async fn close(&mut self) -> Result<(), MockError> {
        match mem::replace(&mut self.state, State::Closed) {
            State::Bound(_) => Ok(()),
            State::Running { stop, shutdown, serve } => {
                let _ = stop.send(());
                for task in [shutdown, serve] {
                    if let Err(err) = task.await {
                        error!("mock DNS task failed: {err}");
                    }
                }
                info!(addr = %self.addr, "mock DNS server stopped");
                Ok(())
            }
            State::Closed => Err(MockError::AlreadyClosed),
        }
    }
}

async fn serve(socket: UdpSocket, records: TxtRecords, token: CancellationToken) {
    let mut buf = vec![0u8; 4096];
    loop {
        let (len, src) = tokio::select! {
            _ = token.cancelled() => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok(received) => received,
                Err(err) => {
                    error!("mock DNS server failed to serve: {err}");
                    std::process::exit(1);
                }
            },
        };

        let req = match Message::from_vec(&buf[..len]) {
            Ok(req) => req,
            Err(err) => {
                warn!(%src, "dropping malformed DNS message: {err}");
                continue;
            }
        };
        trace!(%src, queries = ?req.queries(), "DNS request");

        let reply = match records.handle_request(&req).to_vec() {
            Ok(reply) => reply,
            Err(err) => {
                error!(%src, "unable to encode DNS reply: {err}");
                continue;
            }
        };
        if let Err(err) = socket.send_to(&reply, src).await {
            warn!(%src, "unable to send DNS reply: {err}");
        }
    }
}

//! Per-connection state and lifecycle: read into the query buffer, parse,
//! hand off to the dispatcher, stage replies, enforce output buffer limits.
//! Clients without a socket ("fake" clients, used by scripting contexts)
//! share the same structure with a detached connection variant.

use crate::logging;
use crate::object::Obj;
use crate::protocol::{
    self, DeferredLen, ParseResult, ReplyBuffer, RequestState, Shared,
};
use crate::pubsub;
use crate::reactor::{EventLoop, Fd, Interest};
use crate::server::Server;
use hashbrown::{HashMap, HashSet};
use indexmap::IndexMap;
use std::io::{Read, Write};
use std::os::unix::io::AsRawFd;

pub type ClientId = u64;

/// Memory charged per reply queue node when assessing output limits.
pub const REPLY_NODE_OVERHEAD: usize = 32;

const QUERYBUF_SHRINK_THRESHOLD: usize = 1024 * 1024;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Flags(u32);

impl Flags {
    pub const NONE: Flags = Flags(0);
    pub const REPLICA: Flags = Flags(1);
    pub const MASTER: Flags = Flags(1 << 1);
    pub const MASTER_FORCE_REPLY: Flags = Flags(1 << 2);
    pub const BLOCKED: Flags = Flags(1 << 3);
    pub const UNBLOCKED: Flags = Flags(1 << 4);
    pub const MULTI: Flags = Flags(1 << 5);
    pub const ASKING: Flags = Flags(1 << 6);
    pub const CLOSE_AFTER_REPLY: Flags = Flags(1 << 7);
    pub const CLOSE_ASAP: Flags = Flags(1 << 8);
    pub const UNIX_SOCKET: Flags = Flags(1 << 9);
    pub const SCRIPT: Flags = Flags(1 << 10);

    #[inline]
    pub fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub fn insert(&mut self, other: Flags) {
        self.0 |= other.0;
    }

    #[inline]
    pub fn remove(&mut self, other: Flags) {
        self.0 &= !other.0;
    }

    /// One-letter rendering for the client info line.
    pub fn describe(self) -> String {
        let mut out = String::new();
        if self.contains(Flags::REPLICA) {
            out.push('S');
        }
        if self.contains(Flags::MASTER) {
            out.push('M');
        }
        if self.contains(Flags::MULTI) {
            out.push('x');
        }
        if self.contains(Flags::BLOCKED) {
            out.push('b');
        }
        if self.contains(Flags::UNBLOCKED) {
            out.push('u');
        }
        if self.contains(Flags::CLOSE_AFTER_REPLY) {
            out.push('c');
        }
        if self.contains(Flags::CLOSE_ASAP) {
            out.push('A');
        }
        if self.contains(Flags::UNIX_SOCKET) {
            out.push('U');
        }
        if out.is_empty() {
            out.push('N');
        }
        out
    }
}

/// Connection slot: a real socket or nothing at all for fake clients.
pub enum Conn {
    Socket(mio::net::TcpStream),
    Detached,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ClientClass {
    Normal,
    Replica,
    PubSub,
}

pub struct Client {
    pub id: ClientId,
    pub conn: Conn,
    pub peer: String,
    pub name: Vec<u8>,
    pub flags: Flags,
    pub db: usize,
    pub create_secs: u64,
    pub last_interaction_secs: u64,
    pub querybuf: Vec<u8>,
    pub querybuf_peak: usize,
    pub req: RequestState,
    pub argv: Vec<Obj>,
    pub last_cmd: Option<&'static str>,
    pub reply: ReplyBuffer,
    pub wants_write: bool,
    pub write_installed: bool,
    pub channels: HashSet<Vec<u8>>,
    pub patterns: Vec<Vec<u8>>,
    pub soft_limit_since: Option<u64>,
    pub repl_ack_secs: u64,
    pub repl_online: bool,
}

impl Client {
    pub fn from_socket(id: ClientId, stream: mio::net::TcpStream, now_secs: u64) -> Client {
        let peer = stream
            .peer_addr()
            .map(|a| crate::netio::format_peer(&a))
            .unwrap_or_else(|_| "?:0".to_string());
        Client::build(id, Conn::Socket(stream), peer, now_secs)
    }

    /// A client with no socket. Replies accumulate for the caller to read
    /// back; no events are ever installed.
    pub fn fake(id: ClientId, now_secs: u64) -> Client {
        let mut c = Client::build(id, Conn::Detached, "fake:0".to_string(), now_secs);
        c.flags.insert(Flags::SCRIPT);
        c
    }

    fn build(id: ClientId, conn: Conn, peer: String, now_secs: u64) -> Client {
        Client {
            id,
            conn,
            peer,
            name: Vec::new(),
            flags: Flags::NONE,
            db: 0,
            create_secs: now_secs,
            last_interaction_secs: now_secs,
            querybuf: Vec::new(),
            querybuf_peak: 0,
            req: RequestState::new(),
            argv: Vec::new(),
            last_cmd: None,
            reply: ReplyBuffer::new(),
            wants_write: false,
            write_installed: false,
            channels: HashSet::new(),
            patterns: Vec::new(),
            soft_limit_since: None,
            repl_ack_secs: now_secs,
            repl_online: true,
        }
    }

    #[inline]
    pub fn fd(&self) -> Option<Fd> {
        match &self.conn {
            Conn::Socket(stream) => Some(stream.as_raw_fd()),
            Conn::Detached => None,
        }
    }

    #[inline]
    pub fn is_fake(&self) -> bool {
        matches!(self.conn, Conn::Detached)
    }

    #[inline]
    pub fn subscription_count(&self) -> usize {
        self.channels.len() + self.patterns.len()
    }

    pub fn class(&self) -> ClientClass {
        if self.flags.contains(Flags::REPLICA) || self.flags.contains(Flags::MASTER) {
            ClientClass::Replica
        } else if self.subscription_count() > 0 {
            ClientClass::PubSub
        } else {
            ClientClass::Normal
        }
    }

    /// Decides whether a reply may be staged, arming the write side when
    /// the client can actually be written to. Script clients accumulate
    /// without events; masters swallow replies unless forced; replicas that
    /// are not online yet queue without arming.
    fn prepare_to_write(&mut self) -> bool {
        if self.flags.contains(Flags::SCRIPT) {
            return true;
        }
        if self.flags.contains(Flags::MASTER) && !self.flags.contains(Flags::MASTER_FORCE_REPLY) {
            return false;
        }
        if self.is_fake() {
            return false;
        }
        if !(self.flags.contains(Flags::REPLICA) && !self.repl_online) {
            self.wants_write = true;
        }
        true
    }

    pub fn add_reply_raw(&mut self, bytes: &[u8]) {
        if self.prepare_to_write() {
            self.reply.append(bytes);
        }
    }

    pub fn add_status(&mut self, text: &str) {
        if self.prepare_to_write() {
            self.reply.add_status(text);
        }
    }

    pub fn add_error(&mut self, text: &str) {
        if self.prepare_to_write() {
            self.reply.add_error(text);
        }
    }

    pub fn add_error_full(&mut self, text: &str) {
        if self.prepare_to_write() {
            self.reply.add_error_full(text);
        }
    }

    pub fn add_integer(&mut self, value: i64) {
        if self.prepare_to_write() {
            self.reply.add_integer(value);
        }
    }

    pub fn add_bulk_bytes(&mut self, payload: &[u8]) {
        if self.prepare_to_write() {
            self.reply.add_bulk(payload);
        }
    }

    pub fn add_bulk_obj(&mut self, value: &Obj) {
        if self.prepare_to_write() {
            let reply = &mut self.reply;
            value.string_bytes(|b| reply.add_bulk(b));
        }
    }

    pub fn add_nil(&mut self) {
        self.add_shared(Shared::NilBulk);
    }

    pub fn add_shared(&mut self, reply: Shared) {
        if self.prepare_to_write() {
            self.reply.add_shared(reply);
        }
    }

    pub fn add_multibulk_len(&mut self, count: usize) {
        if self.prepare_to_write() {
            self.reply.add_multibulk_len(count);
        }
    }

    pub fn add_double(&mut self, value: f64) {
        if self.prepare_to_write() {
            self.reply.add_double(value);
        }
    }

    pub fn defer_multibulk_len(&mut self) -> Option<DeferredLen> {
        if self.prepare_to_write() {
            Some(self.reply.defer_multibulk_len())
        } else {
            None
        }
    }

    pub fn set_deferred_multibulk_len(&mut self, handle: Option<DeferredLen>, count: usize) {
        if let Some(handle) = handle {
            self.reply.set_deferred_multibulk_len(handle, count);
        }
    }

    /// Clears per-command state. The ASKING flag is scoped to a single
    /// command unless a MULTI transaction is open.
    pub fn reset(&mut self) {
        self.argv.clear();
        self.req.reset();
        if !self.flags.contains(Flags::MULTI) {
            self.flags.remove(Flags::ASKING);
        }
    }

    /// Replaces the whole command vector, e.g. when a handler rewrites
    /// itself for replication propagation.
    pub fn rewrite_command_vector(&mut self, argv: Vec<Obj>) {
        self.argv = argv;
    }

    /// Replaces a single argument in place.
    pub fn rewrite_command_argument(&mut self, index: usize, value: Obj) {
        if index < self.argv.len() {
            self.argv[index] = value;
        }
    }

    /// Bytes charged against this client's output buffer class limits.
    pub fn output_buffer_memory(&self) -> usize {
        self.reply.queue_bytes() + self.reply.node_count() * REPLY_NODE_OVERHEAD
    }

    /// The CLIENT LIST line for this client.
    pub fn info_line(&self, now_secs: u64, events: Interest) -> String {
        let mut events_str = String::new();
        if events.is_readable() {
            events_str.push('r');
        }
        if events.is_writable() {
            events_str.push('w');
        }

        format!(
            "id={} addr={} fd={} name={} age={} idle={} flags={} db={} sub={} psub={} \
             qbuf={} qbuf-free={} obl={} oll={} omem={} events={} cmd={}",
            self.id,
            self.peer,
            self.fd().unwrap_or(-1),
            String::from_utf8_lossy(&self.name),
            now_secs.saturating_sub(self.create_secs),
            now_secs.saturating_sub(self.last_interaction_secs),
            self.flags.describe(),
            self.db,
            self.channels.len(),
            self.patterns.len(),
            self.querybuf.len(),
            self.querybuf.capacity() - self.querybuf.len(),
            self.reply.fixed_pending(),
            self.reply.node_count(),
            self.output_buffer_memory(),
            events_str,
            self.last_cmd.unwrap_or("NULL"),
        )
    }
}

/// Registry of live clients, insertion ordered. Socket clients are also
/// indexed by fd for event dispatch.
pub struct Clients {
    map: IndexMap<ClientId, Client>,
    by_fd: HashMap<Fd, ClientId>,
    next_id: ClientId,
    pub close_asap: Vec<ClientId>,
}

impl Clients {
    pub fn new() -> Clients {
        Clients {
            map: IndexMap::new(),
            by_fd: HashMap::new(),
            next_id: 1,
            close_asap: Vec::new(),
        }
    }

    #[inline]
    pub fn next_id(&mut self) -> ClientId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn insert(&mut self, client: Client) {
        if let Some(fd) = client.fd() {
            self.by_fd.insert(fd, client.id);
        }
        self.map.insert(client.id, client);
    }

    #[inline]
    pub fn get(&self, id: ClientId) -> Option<&Client> {
        self.map.get(&id)
    }

    #[inline]
    pub fn get_mut(&mut self, id: ClientId) -> Option<&mut Client> {
        self.map.get_mut(&id)
    }

    #[inline]
    pub fn id_by_fd(&self, fd: Fd) -> Option<ClientId> {
        self.by_fd.get(&fd).copied()
    }

    pub fn remove(&mut self, id: ClientId) -> Option<Client> {
        let client = self.map.shift_remove(&id)?;
        if let Some(fd) = client.fd() {
            self.by_fd.remove(&fd);
        }
        Some(client)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn ids(&self) -> Vec<ClientId> {
        self.map.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Client> {
        self.map.values()
    }
}

impl Default for Clients {
    fn default() -> Clients {
        Clients::new()
    }
}

/// Accept loop: pull connections until the listener would block.
pub fn accept_handler(el: &mut EventLoop<Server>, srv: &mut Server, _fd: Fd, _mask: Interest) {
    loop {
        let (stream, addr) = match srv.listener.as_ref().map(|l| l.accept()) {
            Some(Ok(pair)) => pair,
            Some(Err(ref e)) if e.kind() == std::io::ErrorKind::WouldBlock => return,
            Some(Err(ref e)) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Some(Err(e)) => {
                logging::warn!(srv.log, "error accepting connection"; "error" => %e);
                return;
            }
            None => return,
        };

        if srv.clients.len() >= srv.config.server.max_clients {
            let mut stream = stream;
            let _ = stream.write(b"-ERR max number of clients reached\r\n");
            srv.stats.rejected_connections += 1;
            continue;
        }

        let _ = stream.set_nodelay(true);
        if srv.config.server.tcp_keepalive_secs > 0 {
            let _ = stream.set_keepalive(Some(std::time::Duration::from_secs(
                srv.config.server.tcp_keepalive_secs,
            )));
        }

        let fd = stream.as_raw_fd();
        let id = srv.clients.next_id();
        let client = Client::from_socket(id, stream, srv.unix_secs);

        if el.register_file(fd, Interest::READABLE, read_handler).is_err() {
            logging::warn!(srv.log, "no event slot for new connection";
                           "fd" => fd, "peer" => %client.peer);
            srv.stats.rejected_connections += 1;
            continue;
        }

        logging::debug!(srv.log, "client connected";
                        "client_id" => id, "fd" => fd, "peer" => %client.peer, "addr" => %addr);
        srv.clients.insert(client);
        srv.stats.connections_received += 1;
    }
}

/// Readable event: pull bytes into the query buffer and run the parser.
pub fn read_handler(el: &mut EventLoop<Server>, srv: &mut Server, fd: Fd, _mask: Interest) {
    let id = match srv.clients.id_by_fd(fd) {
        Some(id) => id,
        None => return,
    };

    let io_buf_len = srv.config.limits.io_buf_len;
    let query_buf_max = srv.config.limits.query_buf_max;
    let now_secs = srv.unix_secs;

    let outcome = {
        let c = match srv.clients.get_mut(id) {
            Some(c) => c,
            None => return,
        };

        // With a big bulk pending, cap the read at the payload boundary so
        // the argument lands at offset zero and can be donated.
        let mut read_len = io_buf_len;
        if c.req.multibulklen > 0 && c.req.bulklen >= protocol::BIG_ARG as i64 {
            let remaining = (c.req.bulklen as usize + 2).saturating_sub(c.querybuf.len());
            if remaining > 0 && remaining < read_len {
                read_len = remaining;
            }
        }

        let old_len = c.querybuf.len();
        c.querybuf.resize(old_len + read_len, 0);

        let result = match &mut c.conn {
            Conn::Socket(stream) => stream.read(&mut c.querybuf[old_len..]),
            Conn::Detached => return,
        };

        match result {
            Ok(0) => {
                c.querybuf.truncate(old_len);
                ReadOutcome::Eof
            }
            Ok(n) => {
                c.querybuf.truncate(old_len + n);
                c.querybuf_peak = c.querybuf_peak.max(c.querybuf.len());
                c.last_interaction_secs = now_secs;
                if c.querybuf.len() > query_buf_max {
                    ReadOutcome::Overflow
                } else {
                    ReadOutcome::Data
                }
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                c.querybuf.truncate(old_len);
                ReadOutcome::Again
            }
            Err(e) => {
                c.querybuf.truncate(old_len);
                ReadOutcome::Fatal(e)
            }
        }
    };

    match outcome {
        ReadOutcome::Data => process_input(el, srv, id),
        ReadOutcome::Again => (),
        ReadOutcome::Eof => {
            logging::debug!(srv.log, "client closed connection"; "client_id" => id);
            free_client(el, srv, id);
        }
        ReadOutcome::Overflow => {
            logging::warn!(srv.log, "closing client that reached max query buffer length";
                           "client_id" => id);
            free_client(el, srv, id);
        }
        ReadOutcome::Fatal(e) => {
            logging::debug!(srv.log, "error reading from client";
                            "client_id" => id, "error" => %e);
            free_client(el, srv, id);
        }
    }
}

enum ReadOutcome {
    Data,
    Again,
    Eof,
    Overflow,
    Fatal(std::io::Error),
}

/// Parses as many requests as the buffer holds, dispatching each one.
pub fn process_input(el: &mut EventLoop<Server>, srv: &mut Server, id: ClientId) {
    loop {
        let parse_result = {
            let c = match srv.clients.get_mut(id) {
                Some(c) => c,
                None => return,
            };
            if c.querybuf.is_empty()
                || c.flags.contains(Flags::BLOCKED)
                || c.flags.contains(Flags::CLOSE_AFTER_REPLY)
            {
                return;
            }
            protocol::parse(&mut c.req, &mut c.querybuf, &mut c.argv, &srv.config.limits)
        };

        match parse_result {
            ParseResult::Incomplete => return,
            ParseResult::Error(text) => {
                let log = srv.log.clone();
                if let Some(c) = srv.clients.get_mut(id) {
                    logging::info!(log, "protocol error from client";
                                   "client_id" => id, "error" => %text);
                    c.add_error(&text);
                    c.flags.insert(Flags::CLOSE_AFTER_REPLY);
                    c.querybuf.clear();
                }
                return;
            }
            ParseResult::Ready => {
                let empty = {
                    let c = match srv.clients.get_mut(id) {
                        Some(c) => c,
                        None => return,
                    };
                    c.argv.is_empty()
                };

                if empty {
                    // A bare newline; replicas use it as a liveness ack.
                    if let Some(c) = srv.clients.get_mut(id) {
                        if c.flags.contains(Flags::REPLICA) {
                            c.repl_ack_secs = srv.unix_secs;
                        }
                        c.reset();
                    }
                } else {
                    crate::server::dispatch(el, srv, id);
                    if let Some(c) = srv.clients.get_mut(id) {
                        c.reset();
                    } else {
                        return;
                    }
                }
            }
        }
    }
}

/// Writable event: drain the reply buffers into the socket.
pub fn write_handler(el: &mut EventLoop<Server>, srv: &mut Server, fd: Fd, _mask: Interest) {
    let id = match srv.clients.id_by_fd(fd) {
        Some(id) => id,
        None => return,
    };

    let limit = srv.config.limits.max_write_per_event;
    let ignore_limit = srv.config.limits.maxmemory > 0;
    let now_secs = srv.unix_secs;

    let result = {
        let c = match srv.clients.get_mut(id) {
            Some(c) => c,
            None => return,
        };
        let Client { conn, reply, .. } = c;
        match conn {
            Conn::Socket(stream) => reply.flush_to(stream, limit, ignore_limit),
            Conn::Detached => return,
        }
    };

    match result {
        Ok(written) => {
            let mut close = false;
            if let Some(c) = srv.clients.get_mut(id) {
                if written > 0 {
                    c.last_interaction_secs = now_secs;
                }
                if !c.reply.has_pending() {
                    c.wants_write = false;
                    if c.write_installed {
                        el.unregister_file(fd, Interest::WRITABLE);
                        c.write_installed = false;
                    }
                    close = c.flags.contains(Flags::CLOSE_AFTER_REPLY);
                }
            }
            if close {
                free_client(el, srv, id);
            }
        }
        Err(e) => {
            logging::debug!(srv.log, "error writing to client";
                            "client_id" => id, "error" => %e);
            free_client(el, srv, id);
        }
    }
}

/// Arms the write side for every client with staged output. Runs from the
/// pre-sleep hook so replies land before the loop blocks.
pub fn install_write_events(el: &mut EventLoop<Server>, srv: &mut Server) {
    for (_, c) in srv.clients.map.iter_mut() {
        if c.wants_write && !c.write_installed {
            if let Some(fd) = c.fd() {
                if el.register_file(fd, Interest::WRITABLE, write_handler).is_ok() {
                    c.write_installed = true;
                }
            }
        }
    }
}

/// Immediate teardown: events, socket, subscriptions, registry entries.
pub fn free_client(el: &mut EventLoop<Server>, srv: &mut Server, id: ClientId) {
    let client = match srv.clients.remove(id) {
        Some(c) => c,
        None => return,
    };

    if let Some(fd) = client.fd() {
        el.unregister_file(fd, Interest::READABLE | Interest::WRITABLE);
    }

    pubsub::drop_subscriptions(srv, id, &client);
    srv.clients.close_asap.retain(|&pending| pending != id);

    logging::debug!(srv.log, "client freed";
                    "client_id" => id, "peer" => %client.peer);
    // The socket closes when `client` drops here.
}

/// Idempotent deferred close: flags the client and queues it for the next
/// cron pass.
pub fn free_client_async(srv: &mut Server, id: ClientId) {
    if let Some(c) = srv.clients.get_mut(id) {
        if c.flags.contains(Flags::CLOSE_ASAP) {
            return;
        }
        c.flags.insert(Flags::CLOSE_ASAP);
        srv.clients.close_asap.push(id);
    }
}

pub fn free_clients_in_async_queue(el: &mut EventLoop<Server>, srv: &mut Server) {
    let pending = std::mem::replace(&mut srv.clients.close_asap, Vec::new());
    for id in pending {
        free_client(el, srv, id);
    }
}

/// Checks the soft and hard output buffer limits for the client's class,
/// scheduling an async close on overrun. Returns true when the client got
/// scheduled.
pub fn check_output_buffer_limits(srv: &mut Server, id: ClientId) -> bool {
    let now_secs = srv.unix_secs;
    let (used, class) = match srv.clients.get(id) {
        Some(c) => {
            if c.is_fake() {
                return false;
            }
            (c.output_buffer_memory(), c.class())
        }
        None => return false,
    };

    let limit = match class {
        ClientClass::Normal => srv.config.limits.normal,
        ClientClass::Replica => srv.config.limits.replica,
        ClientClass::PubSub => srv.config.limits.pubsub,
    };

    let mut over = false;
    if limit.hard_bytes > 0 && used >= limit.hard_bytes {
        over = true;
    }
    if !over {
        if let Some(c) = srv.clients.get_mut(id) {
            if limit.soft_bytes > 0 && used >= limit.soft_bytes {
                match c.soft_limit_since {
                    None => c.soft_limit_since = Some(now_secs),
                    Some(since) => {
                        if now_secs.saturating_sub(since) >= limit.soft_seconds {
                            over = true;
                        }
                    }
                }
            } else {
                c.soft_limit_since = None;
            }
        }
    }

    if over {
        logging::warn!(srv.log, "client scheduled to be closed asap for overcoming of output buffer limits";
                       "client_id" => id, "used_bytes" => used, "class" => ?class);
        free_client_async(srv, id);
    }
    over
}

/// Periodic client maintenance: idle timeouts and query buffer reclaim.
pub fn clients_cron(el: &mut EventLoop<Server>, srv: &mut Server) {
    let timeout = srv.config.server.client_timeout_secs;
    let now_secs = srv.unix_secs;

    for id in srv.clients.ids() {
        let mut drop_client = false;
        if let Some(c) = srv.clients.get_mut(id) {
            if timeout > 0
                && !c.flags.contains(Flags::REPLICA)
                && !c.flags.contains(Flags::MASTER)
                && !c.flags.contains(Flags::BLOCKED)
                && c.subscription_count() == 0
                && now_secs.saturating_sub(c.last_interaction_secs) > timeout
            {
                drop_client = true;
            } else if c.querybuf.capacity() > QUERYBUF_SHRINK_THRESHOLD
                && c.querybuf.len() < c.querybuf.capacity() / 2
            {
                c.querybuf.shrink_to_fit();
                c.querybuf_peak = 0;
            }
        }
        if drop_client {
            logging::info!(srv.log, "closing idle client"; "client_id" => id);
            free_client(el, srv, id);
        }
    }
}

fn valid_client_name(name: &[u8]) -> bool {
    name.len() <= 64 && name.iter().all(|&b| b > 32 && b < 127)
}

/// CLIENT LIST | KILL addr | GETNAME | SETNAME name
pub fn client_command(el: &mut EventLoop<Server>, srv: &mut Server, id: ClientId) {
    let argv: Vec<Obj> = match srv.clients.get(id) {
        Some(c) => c.argv.clone(),
        None => return,
    };
    let sub = argv[1].string_bytes(|b| b.to_ascii_lowercase());

    match (sub.as_slice(), argv.len()) {
        (b"list", 2) => {
            let now_secs = srv.unix_secs;
            let mut out = String::new();
            for c in srv.clients.iter() {
                let events = c.fd().map(|fd| el.file_mask(fd)).unwrap_or(Interest::NONE);
                out.push_str(&c.info_line(now_secs, events));
                out.push('\n');
            }
            if let Some(c) = srv.clients.get_mut(id) {
                c.add_bulk_bytes(out.as_bytes());
            }
        }
        (b"kill", 3) => {
            let target = argv[2].string_to_vec();
            let target = String::from_utf8_lossy(&target).to_string();
            let victim = srv
                .clients
                .iter()
                .find(|c| c.peer == target)
                .map(|c| c.id);

            match victim {
                Some(victim_id) if victim_id == id => {
                    if let Some(c) = srv.clients.get_mut(id) {
                        c.add_shared(Shared::Ok);
                        c.flags.insert(Flags::CLOSE_AFTER_REPLY);
                    }
                }
                Some(victim_id) => {
                    if let Some(c) = srv.clients.get_mut(id) {
                        c.add_shared(Shared::Ok);
                    }
                    logging::info!(srv.log, "client killed by command";
                                   "victim" => victim_id, "by" => id);
                    free_client(el, srv, victim_id);
                }
                None => {
                    if let Some(c) = srv.clients.get_mut(id) {
                        c.add_error("No such client");
                    }
                }
            }
        }
        (b"setname", 3) => {
            let name = argv[2].string_to_vec();
            if let Some(c) = srv.clients.get_mut(id) {
                if valid_client_name(&name) {
                    c.name = name;
                    c.add_shared(Shared::Ok);
                } else {
                    c.add_error(
                        "Client names cannot contain spaces, newlines or special characters.",
                    );
                }
            }
        }
        (b"getname", 2) => {
            if let Some(c) = srv.clients.get_mut(id) {
                if c.name.is_empty() {
                    c.add_nil();
                } else {
                    let name = c.name.clone();
                    c.add_bulk_bytes(&name);
                }
            }
        }
        _ => {
            if let Some(c) = srv.clients.get_mut(id) {
                c.add_error("Syntax error, try CLIENT (LIST | KILL ip:port | GETNAME | SETNAME connection-name)");
            }
        }
    }
}

//! The server context: client registry, pub/sub state, databases, command
//! table, background workers and cached clocks, threaded explicitly through
//! every component. A single owner constructs it at startup and hands it to
//! the event loop.

use crate::bgjobs::BgPool;
use crate::client::{self, ClientId, Clients, Flags};
use crate::config::Config;
use crate::dump;
use crate::keyspace::{Keyspace, ObjectCodec};
use crate::logging::{self, Logger};
use crate::notify;
use crate::object::{self, Obj, SHARED_REFCOUNT};
use crate::protocol::Shared;
use crate::pubsub::{self, PubSubState};
use crate::reactor::{EventLoop, Interest, TimerNext};
use crate::slowlog::Slowlog;
use crate::util;
use hashbrown::HashMap;
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
use std::time::Instant;

pub type CommandProc = fn(&mut EventLoop<Server>, &mut Server, ClientId);

#[derive(Copy, Clone)]
pub struct Command {
    pub name: &'static str,
    pub arity: i32,
    pub proc: CommandProc,
}

#[derive(Default)]
pub struct Stats {
    pub connections_received: u64,
    pub rejected_connections: u64,
    pub commands_processed: u64,
    pub expired_keys: u64,
}

pub struct Server {
    pub config: Config,
    pub log: Logger,
    pub clients: Clients,
    pub pubsub: PubSubState,
    pub dbs: Vec<Box<dyn Keyspace>>,
    pub commands: HashMap<Vec<u8>, Command>,
    pub bg: BgPool,
    pub slowlog: Slowlog,
    pub codec: Box<dyn ObjectCodec>,
    pub notify_flags: u32,
    pub listener: Option<mio::net::TcpListener>,
    pub unix_secs: u64,
    pub unix_ms: u64,
    pub lru_clock: u32,
    pub cron_loops: u64,
    pub start_secs: u64,
    pub stats: Stats,
}

impl Server {
    pub fn new(
        config: Config,
        log: Logger,
        dbs: Vec<Box<dyn Keyspace>>,
        codec: Box<dyn ObjectCodec>,
    ) -> Server {
        let notify_flags = notify::parse_flags(&config.notify.keyspace_events)
            .expect("Invalid keyspace notification flags in configuration");
        let slowlog = Slowlog::new(config.slowlog.log_slower_than_us, config.slowlog.max_len);
        let bg = BgPool::new(&log);

        let mut srv = Server {
            config,
            log,
            clients: Clients::new(),
            pubsub: PubSubState::new(),
            dbs,
            commands: HashMap::new(),
            bg,
            slowlog,
            codec,
            notify_flags,
            listener: None,
            unix_secs: 0,
            unix_ms: 0,
            lru_clock: 0,
            cron_loops: 0,
            start_secs: util::now_secs(),
            stats: Stats::default(),
        };
        srv.update_clock();
        srv.register_core_commands();
        srv
    }

    /// Shared integer handles are disabled under a memory cap: every object
    /// then needs its own access clock.
    #[inline]
    pub fn share_integers(&self) -> bool {
        self.config.limits.maxmemory == 0
    }

    pub fn update_clock(&mut self) {
        self.unix_ms = util::now_ms();
        self.unix_secs = self.unix_ms / 1000;
        self.lru_clock = object::lru_clock();
    }

    pub fn register_command(&mut self, name: &'static str, arity: i32, proc: CommandProc) {
        self.commands
            .insert(name.as_bytes().to_vec(), Command { name, arity, proc });
    }

    fn register_core_commands(&mut self) {
        self.register_command("quit", 1, quit_command);
        self.register_command("client", -2, client::client_command);
        self.register_command("object", -2, object_command);
        self.register_command("subscribe", -2, pubsub::subscribe_command);
        self.register_command("unsubscribe", -1, pubsub::unsubscribe_command);
        self.register_command("psubscribe", -2, pubsub::psubscribe_command);
        self.register_command("punsubscribe", -1, pubsub::punsubscribe_command);
        self.register_command("publish", 3, pubsub::publish_command);
        self.register_command("pubsub", -2, pubsub::pubsub_command);
        self.register_command("dump", 2, dump::dump_command);
        self.register_command("restore", 4, dump::restore_command);
        self.register_command("migrate", 6, dump::migrate_command);
        self.register_command("slowlog", -2, slowlog_command);
    }

    /// Binds the listener and registers the accept handler on the loop.
    pub fn listen(&mut self, el: &mut EventLoop<Server>) -> std::io::Result<()> {
        let addr: SocketAddr = format!("{}:{}", self.config.server.address, self.config.server.port)
            .parse()
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "bad listen address"))?;
        let listener = mio::net::TcpListener::bind(&addr)?;
        let fd = listener.as_raw_fd();

        el.register_file(fd, Interest::READABLE, client::accept_handler)
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::Other, "no event slot for listener"))?;

        logging::info!(self.log, "listening for connections";
                       "addr" => %listener.local_addr()?,
                       "backend" => el.backend_name());
        self.listener = Some(listener);
        Ok(())
    }

    pub fn local_port(&self) -> Option<u16> {
        self.listener
            .as_ref()
            .and_then(|l| l.local_addr().ok())
            .map(|a| a.port())
    }

    /// Read-path lookup: lazily expires, stamps the access clock.
    pub fn db_lookup(&mut self, db: usize, key: &[u8]) -> Option<Obj> {
        let now_ms = self.unix_ms;
        let clock = self.lru_clock;
        let value = self.dbs.get_mut(db)?.lookup(key, now_ms)?;
        value.touch(clock);
        Some(value)
    }

    /// Introspection lookup that leaves the access clock alone, so OBJECT
    /// IDLETIME does not reset what it measures.
    pub fn db_lookup_notouch(&mut self, db: usize, key: &[u8]) -> Option<Obj> {
        let now_ms = self.unix_ms;
        self.dbs.get_mut(db)?.lookup(key, now_ms)
    }
}

const PUBSUB_ALLOWED: [&str; 5] =
    ["subscribe", "unsubscribe", "psubscribe", "punsubscribe", "quit"];

/// Looks the command up, checks arity and context, executes, then feeds the
/// slow log and the output limit check.
pub fn dispatch(el: &mut EventLoop<Server>, srv: &mut Server, id: ClientId) {
    let (name_key, argc, in_pubsub) = {
        let c = match srv.clients.get(id) {
            Some(c) => c,
            None => return,
        };
        (
            c.argv[0].string_bytes(|b| b.to_ascii_lowercase()),
            c.argv.len(),
            c.subscription_count() > 0,
        )
    };

    let cmd = match srv.commands.get(name_key.as_slice()).copied() {
        Some(cmd) => cmd,
        None => {
            let text = format!(
                "unknown command '{}'",
                String::from_utf8_lossy(&name_key)
            );
            if let Some(c) = srv.clients.get_mut(id) {
                c.add_error(&text);
            }
            return;
        }
    };

    let arity_ok = if cmd.arity >= 0 {
        argc == cmd.arity as usize
    } else {
        argc >= (-cmd.arity) as usize
    };
    if !arity_ok {
        let text = format!("wrong number of arguments for '{}' command", cmd.name);
        if let Some(c) = srv.clients.get_mut(id) {
            c.add_error(&text);
        }
        return;
    }

    if in_pubsub && !PUBSUB_ALLOWED.contains(&cmd.name) {
        if let Some(c) = srv.clients.get_mut(id) {
            c.add_error(
                "only (P)SUBSCRIBE / (P)UNSUBSCRIBE / QUIT allowed in this context",
            );
        }
        return;
    }

    if let Some(c) = srv.clients.get_mut(id) {
        c.last_cmd = Some(cmd.name);
    }

    let start = Instant::now();
    (cmd.proc)(el, srv, id);
    let duration_us = start.elapsed().as_micros() as u64;

    srv.stats.commands_processed += 1;
    let argv: Option<Vec<Obj>> = srv.clients.get(id).map(|c| c.argv.clone());
    if let Some(argv) = argv {
        let now_secs = srv.unix_secs;
        srv.slowlog.maybe_record(&argv, now_secs, duration_us);
    }
    client::check_output_buffer_limits(srv, id);
}

/// The periodic housekeeping timer: clock refresh, client sweeps, deferred
/// frees, expired-key collection.
pub fn server_cron(el: &mut EventLoop<Server>, srv: &mut Server, _id: u64) -> TimerNext {
    srv.update_clock();
    srv.cron_loops += 1;

    if srv.cron_loops % 50 == 0 {
        let keys: usize = srv.dbs.iter().map(|db| db.len()).sum();
        logging::debug!(srv.log, "housekeeping";
                        "clients" => srv.clients.len(),
                        "keys" => keys,
                        "commands" => srv.stats.commands_processed,
                        "expired" => srv.stats.expired_keys);
    }

    client::clients_cron(el, srv);
    client::free_clients_in_async_queue(el, srv);

    let now_ms = srv.unix_ms;
    for dbid in 0..srv.dbs.len() {
        let expired = srv.dbs[dbid].sweep_expired(now_ms, 20);
        for key in expired {
            srv.stats.expired_keys += 1;
            notify::notify_keyspace_event(srv, notify::NOTIFY_EXPIRED, "expired", &key, dbid);
        }
    }

    TimerNext::After(100)
}

/// Pre-sleep hook: refresh clocks and arm write events for every client
/// with staged output.
pub fn before_sleep(el: &mut EventLoop<Server>, srv: &mut Server) {
    srv.update_clock();
    client::install_write_events(el, srv);
}

fn quit_command(_el: &mut EventLoop<Server>, srv: &mut Server, id: ClientId) {
    if let Some(c) = srv.clients.get_mut(id) {
        c.add_shared(Shared::Ok);
        c.flags.insert(Flags::CLOSE_AFTER_REPLY);
    }
}

/// OBJECT REFCOUNT|ENCODING|IDLETIME key
fn object_command(_el: &mut EventLoop<Server>, srv: &mut Server, id: ClientId) {
    let (db, sub, key) = match srv.clients.get(id) {
        Some(c) if c.argv.len() == 3 => (
            c.db,
            c.argv[1].string_bytes(|b| b.to_ascii_lowercase()),
            c.argv[2].string_to_vec(),
        ),
        Some(_) => {
            if let Some(c) = srv.clients.get_mut(id) {
                c.add_error("Syntax error. Try OBJECT (refcount|encoding|idletime)");
            }
            return;
        }
        None => return,
    };

    let value = match srv.db_lookup_notouch(db, &key) {
        Some(value) => value,
        None => {
            if let Some(c) = srv.clients.get_mut(id) {
                c.add_error("no such key");
            }
            return;
        }
    };
    let clock = srv.lru_clock;

    let c = match srv.clients.get_mut(id) {
        Some(c) => c,
        None => return,
    };
    match sub.as_slice() {
        b"refcount" => {
            let count = match value.refcount() {
                SHARED_REFCOUNT => i64::from(i32::max_value()),
                n => n as i64,
            };
            c.add_integer(count);
        }
        b"encoding" => {
            c.add_bulk_bytes(value.encoding().name().as_bytes());
        }
        b"idletime" => {
            c.add_integer(value.idle_time(clock) as i64);
        }
        _ => {
            c.add_error("Syntax error. Try OBJECT (refcount|encoding|idletime)");
        }
    }
}

/// SLOWLOG GET [n] | LEN | RESET
fn slowlog_command(_el: &mut EventLoop<Server>, srv: &mut Server, id: ClientId) {
    let argv: Vec<Obj> = match srv.clients.get(id) {
        Some(c) => c.argv.clone(),
        None => return,
    };
    let sub = argv[1].string_bytes(|b| b.to_ascii_lowercase());

    match (sub.as_slice(), argv.len()) {
        (b"reset", 2) => {
            srv.slowlog.reset();
            if let Some(c) = srv.clients.get_mut(id) {
                c.add_shared(Shared::Ok);
            }
        }
        (b"len", 2) => {
            let len = srv.slowlog.len() as i64;
            if let Some(c) = srv.clients.get_mut(id) {
                c.add_integer(len);
            }
        }
        (b"get", 2) | (b"get", 3) => {
            let limit = match argv.get(2) {
                Some(arg) => match arg.to_i64() {
                    Some(n) if n >= 0 => n as usize,
                    _ => {
                        if let Some(c) = srv.clients.get_mut(id) {
                            c.add_error("value is not an integer or out of range");
                        }
                        return;
                    }
                },
                None => 10,
            };

            let entries: Vec<(u64, u64, u64, Vec<Obj>)> = srv
                .slowlog
                .iter()
                .take(limit)
                .map(|e| (e.id, e.time_secs, e.duration_us, e.argv.clone()))
                .collect();

            if let Some(c) = srv.clients.get_mut(id) {
                c.add_multibulk_len(entries.len());
                for (entry_id, time_secs, duration_us, cmd_argv) in entries {
                    c.add_multibulk_len(4);
                    c.add_integer(entry_id as i64);
                    c.add_integer(time_secs as i64);
                    c.add_integer(duration_us as i64);
                    c.add_multibulk_len(cmd_argv.len());
                    for arg in &cmd_argv {
                        c.add_bulk_obj(arg);
                    }
                }
            }
        }
        _ => {
            if let Some(c) = srv.clients.get_mut(id) {
                c.add_error("Unknown SLOWLOG subcommand or wrong # of args. Try GET, RESET, LEN.");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Client;
    use crate::codec::BincodeCodec;

    fn test_server() -> Server {
        Server::new(
            Config::default(),
            logging::discard(),
            Vec::new(),
            Box::new(BincodeCodec),
        )
    }

    fn fake_client(srv: &mut Server) -> ClientId {
        let id = srv.clients.next_id();
        srv.clients.insert(Client::fake(id, 0));
        id
    }

    fn run(srv: &mut Server, el: &mut EventLoop<Server>, id: ClientId, args: &[&[u8]]) -> Vec<u8> {
        {
            let c = srv.clients.get_mut(id).unwrap();
            c.argv = args.iter().map(|a| Obj::new_string_raw(a.to_vec())).collect();
        }
        dispatch(el, srv, id);
        let mut out = Vec::new();
        if let Some(c) = srv.clients.get_mut(id) {
            c.reset();
            c.reply.flush_to(&mut out, usize::max_value(), false).unwrap();
        }
        out
    }

    #[test]
    fn test_unknown_command() {
        let mut srv = test_server();
        let mut el: EventLoop<Server> = EventLoop::new(64).unwrap();
        let id = fake_client(&mut srv);
        let out = run(&mut srv, &mut el, id, &[b"NOSUCH"]);
        assert!(out.starts_with(b"-ERR unknown command 'nosuch'"));
    }

    #[test]
    fn test_arity_check() {
        let mut srv = test_server();
        let mut el: EventLoop<Server> = EventLoop::new(64).unwrap();
        let id = fake_client(&mut srv);
        let out = run(&mut srv, &mut el, id, &[b"PUBLISH", b"only-channel"]);
        assert!(out.starts_with(b"-ERR wrong number of arguments for 'publish'"));
    }

    #[test]
    fn test_pubsub_context_restriction() {
        let mut srv = test_server();
        let mut el: EventLoop<Server> = EventLoop::new(64).unwrap();
        let id = fake_client(&mut srv);

        let out = run(&mut srv, &mut el, id, &[b"SUBSCRIBE", b"news"]);
        assert!(out.starts_with(b"*3\r\n$9\r\nsubscribe\r\n"));

        let out = run(&mut srv, &mut el, id, &[b"PUBLISH", b"news", b"x"]);
        assert!(out.starts_with(b"-ERR only (P)SUBSCRIBE"));

        let out = run(&mut srv, &mut el, id, &[b"UNSUBSCRIBE"]);
        assert!(out.starts_with(b"*3\r\n$11\r\nunsubscribe\r\n"));
    }

    #[test]
    fn test_quit_flags_close() {
        let mut srv = test_server();
        let mut el: EventLoop<Server> = EventLoop::new(64).unwrap();
        let id = fake_client(&mut srv);
        let out = run(&mut srv, &mut el, id, &[b"QUIT"]);
        assert_eq!(out, b"+OK\r\n");
        assert!(srv
            .clients
            .get(id)
            .unwrap()
            .flags
            .contains(Flags::CLOSE_AFTER_REPLY));
    }

    #[test]
    fn test_slowlog_records_and_reports() {
        let mut srv = test_server();
        srv.slowlog = Slowlog::new(0, 16);
        let mut el: EventLoop<Server> = EventLoop::new(64).unwrap();
        let id = fake_client(&mut srv);

        run(&mut srv, &mut el, id, &[b"PUBLISH", b"a", b"b"]);
        assert!(srv.slowlog.len() >= 1);

        let out = run(&mut srv, &mut el, id, &[b"SLOWLOG", b"LEN"]);
        assert!(out.starts_with(b":"));

        let out = run(&mut srv, &mut el, id, &[b"SLOWLOG", b"RESET"]);
        assert_eq!(out, b"+OK\r\n");
        assert_eq!(srv.slowlog.len(), 1);
    }

    #[test]
    fn test_command_case_insensitive() {
        let mut srv = test_server();
        let mut el: EventLoop<Server> = EventLoop::new(64).unwrap();
        let id = fake_client(&mut srv);
        let out = run(&mut srv, &mut el, id, &[b"QuIt"]);
        assert_eq!(out, b"+OK\r\n");
    }
}

//! Server wiring: an in-memory keyspace per database, the data command set
//! and the event loop bootstrap around the core engine.

pub mod commands;
pub mod store;

use cinder_core::codec::BincodeCodec;
use cinder_core::config::Config;
use cinder_core::keyspace::Keyspace;
use cinder_core::logging::Logger;
use cinder_core::reactor::select::SelectBackend;
use cinder_core::reactor::EventLoop;
use cinder_core::server::{self, Server};
use store::MemoryStore;

/// Builds the event loop and a fully wired server: databases, commands,
/// bound listener, housekeeping timer and the pre-sleep hook.
pub fn bootstrap(config: Config, log: Logger) -> (EventLoop<Server>, Server) {
    let setsize = config.server.event_setsize;
    let mut el: EventLoop<Server> = match config.server.backend.as_str() {
        "select" => {
            let backend = SelectBackend::new(setsize)
                .expect("The select backend rejected the configured setsize");
            EventLoop::with_backend(Box::new(backend), setsize)
        }
        _ => EventLoop::new(setsize).expect("Error creating the event loop"),
    };

    let dbs: Vec<Box<dyn Keyspace>> = (0..config.server.databases)
        .map(|_| Box::new(MemoryStore::new()) as Box<dyn Keyspace>)
        .collect();

    let mut srv = Server::new(config, log, dbs, Box::new(BincodeCodec));
    commands::register_all(&mut srv);

    srv.listen(&mut el).expect("Error binding the listen socket");
    el.set_before_sleep(Some(server::before_sleep));
    el.create_timer(1, server::server_cron, None);

    (el, srv)
}

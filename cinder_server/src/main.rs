use cinder_core::config::Config;
use cinder_core::logging;

fn main() {
    let config = match std::env::args().nth(1) {
        Some(path) => Config::load(path),
        None => Config::default(),
    };
    let log = logging::terminal(&config.server.log_level);

    let (mut el, mut srv) = cinder_server::bootstrap(config, log.clone());
    logging::info!(log, "server started"; "pid" => std::process::id());
    el.run(&mut srv);
}

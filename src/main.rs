/*!
 * Starport server binary
 *
 * Loads the configuration, pre-binds any privileged ports, starts the
 * server, then sleeps until SIGINT/SIGTERM and walks it back down.
 */

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::{Arg, ArgAction, Command};
use tracing::info;

use starport::config::ServerConfig;
use starport::script::NullEngine;
use starport::serve::RequestHandler;
use starport::server::Server;
use starport::{logging, prebind, Conn};

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(_sig: libc::c_int) {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

/// Stand-in dispatcher until a real application registers handlers.
struct NotFoundHandler;

impl RequestHandler for NotFoundHandler {
    fn handle(&self, conn: &mut Conn) -> starport::Result<()> {
        conn.return_error(404, 514)?;
        Ok(())
    }
}

fn main() -> starport::Result<()> {
    let matches = Command::new("starport")
        .version(starport::VERSION)
        .about("Multi-threaded HTTP application server core")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Server configuration file"),
        )
        .arg(
            Arg::new("prebind")
                .short('b')
                .long("prebind")
                .value_name("LIST")
                .help("Comma-separated [addr:]port list to bind before privilege drop"),
        )
        .arg(
            Arg::new("prebind-file")
                .short('B')
                .long("prebind-file")
                .value_name("FILE")
                .help("File with one prebind entry per line"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::SetTrue)
                .help("Debug-level logging"),
        )
        .get_matches();

    let mut config = match matches.get_one::<String>("config") {
        Some(path) => ServerConfig::from_file(path)?,
        None => ServerConfig::default(),
    };
    if matches.get_flag("verbose") {
        config.server.log_level = starport::LogLevel::Debug;
    }
    logging::init_logging(&config)?;

    // privileged ports bind first, while we can still have the privilege
    if let Some(spec) = matches.get_one::<String>("prebind") {
        prebind::prebind(spec);
    }
    if let Some(path) = matches.get_one::<String>("prebind-file") {
        prebind::prebind_file(path)?;
    }

    let mut server = Server::new(
        config,
        Arc::new(NotFoundHandler),
        Arc::new(NullEngine),
        HashMap::new(),
    )?;
    server.prebind();
    server.start()?;

    unsafe {
        libc::signal(libc::SIGINT, on_signal as usize);
        libc::signal(libc::SIGTERM, on_signal as usize);
    }
    info!("running; SIGINT or SIGTERM stops the server");
    while !SHUTDOWN.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(200));
    }

    server.stop();
    Ok(())
}

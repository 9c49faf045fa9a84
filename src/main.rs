//! echoplex: an asynchronous TCP echo server and client.
//!
//! Two modes share one reactor implementation:
//! - `serve` binds a listener and runs the event loop on this thread.
//! - `send` connects to the server, runs the event loop on a spawned I/O
//!   thread, and sends messages from this thread while replies arrive
//!   concurrently.

use echoplex::config::{Command, Config};
use echoplex::{connect, Listener, LogSink, Reactor};
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Pause between client messages, long enough for each reply to be
/// reported before the next send.
const SEND_PACING: Duration = Duration::from_millis(500);

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let (config, command) = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match command {
        Command::Serve => serve(config),
        Command::Send { messages } => send(config, messages),
    }
}

/// Run the echo server until the process is killed.
fn serve(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;

    let mut reactor = Reactor::new()?;
    let listener = Listener::bind(addr, config.recv_buffer, Arc::new(LogSink))?;

    info!(
        addr = %listener.local_addr()?,
        recv_buffer = config.recv_buffer,
        "Listening"
    );

    listener.start(reactor.handle());
    reactor.run()?;
    Ok(())
}

/// Connect to the server and send each message, then shut down cleanly:
/// close the session, stop the reactor, join the I/O thread.
fn send(config: Config, messages: Vec<String>) -> Result<(), Box<dyn std::error::Error>> {
    let mut reactor = Reactor::new()?;
    let handle = reactor.handle().clone();

    let io_thread = thread::spawn(move || reactor.run());

    let client = connect(
        &handle,
        &config.host,
        config.port,
        config.recv_buffer,
        Arc::new(LogSink),
    )?;

    for message in messages {
        info!("Sending: {message}");
        client.send(message);
        thread::sleep(SEND_PACING);
    }

    // Leave time for the last reply before tearing the session down.
    thread::sleep(SEND_PACING);
    client.close();
    handle.stop();

    match io_thread.join() {
        Ok(result) => result?,
        Err(_) => error!("I/O thread panicked"),
    }
    Ok(())
}

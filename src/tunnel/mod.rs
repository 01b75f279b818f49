//! SSH tunnel from the node to the hub. One long-lived session carries
//! three things: a local forward for every port of the NBD pool (so the
//! backup client reaches the hub's block servers on its own loopback), a
//! local forward for the hub API (the completion callback), and one
//! reverse forward handing the node API to the hub.
//!
//! The whole pool is pre-forwarded rather than set up per job: dynamic
//! forwards would need a side channel to the hub's allocator and their
//! teardown proved fragile. The cost is that maximum concurrency is
//! capped at the pool size, which matches the allocator's contract
//! anyway.

use crate::config::TunnelConfig;
use log::{debug, error, info, warn};
use ssh2::Session;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::Path;
use std::time::{Duration, Instant};
use thiserror::Error;

const KEEPALIVE_INTERVAL_SECS: u32 = 15;
const RECONNECT_BACKOFF_MAX: Duration = Duration::from_secs(60);
const PUMP_BUFFER: usize = 32 * 1024;

#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SSH error: {0}")]
    Ssh(#[from] ssh2::Error),

    #[error("authentication failed for user {0}")]
    AuthFailed(String),
}

/// One proxied connection: a local TCP socket spliced onto an SSH
/// channel. Both ends are non-blocking; the event loop pumps them, with
/// a carry buffer per direction so a WouldBlock on the write side never
/// loses data.
struct Pump {
    tcp: TcpStream,
    channel: ssh2::Channel,
    label: String,
    to_channel: Vec<u8>,
    to_tcp: Vec<u8>,
}

impl Pump {
    fn new(tcp: TcpStream, channel: ssh2::Channel, label: String) -> Self {
        Self {
            tcp,
            channel,
            label,
            to_channel: Vec::new(),
            to_tcp: Vec::new(),
        }
    }

    /// Moves bytes both ways once. Returns false when either side has
    /// finished and the pump should be dropped.
    fn service(&mut self) -> bool {
        let mut buf = [0u8; PUMP_BUFFER];

        // TCP -> channel: refill the carry buffer only once it drained.
        if self.to_channel.is_empty() {
            match self.tcp.read(&mut buf) {
                Ok(0) => {
                    debug!("{}: local side closed", self.label);
                    let _ = self.channel.send_eof();
                    return false;
                }
                Ok(n) => self.to_channel.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(_) => return false,
            }
        }
        if !self.to_channel.is_empty() {
            match self.channel.write(&self.to_channel) {
                Ok(n) => {
                    self.to_channel.drain(..n);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(_) => return false,
            }
        }

        // channel -> TCP
        if self.to_tcp.is_empty() {
            match self.channel.read(&mut buf) {
                Ok(0) => {
                    debug!("{}: remote side closed", self.label);
                    return false;
                }
                Ok(n) => self.to_tcp.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(_) => return false,
            }
        }
        if !self.to_tcp.is_empty() {
            match self.tcp.write(&self.to_tcp) {
                Ok(n) => {
                    self.to_tcp.drain(..n);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(_) => return false,
            }
        }

        !self.channel.eof() || !self.to_tcp.is_empty()
    }
}

/// Runs the tunnel forever, reconnecting with capped exponential backoff
/// whenever the session drops. Never returns; meant for a dedicated
/// thread.
pub fn run_forever(config: TunnelConfig, node_api_port: u16) {
    let mut backoff = Duration::from_secs(1);

    loop {
        info!(
            "Connecting tunnel to {}:{} as {}",
            config.hub_ssh_host, config.hub_ssh_port, config.ssh_user
        );

        match run_session(&config, node_api_port) {
            Ok(()) => {
                warn!("Tunnel session ended; reconnecting");
                backoff = Duration::from_secs(1);
            }
            Err(e) => {
                error!("Tunnel session failed: {}; retrying in {:?}", e, backoff);
                std::thread::sleep(backoff);
                backoff = (backoff * 2).min(RECONNECT_BACKOFF_MAX);
            }
        }
    }
}

fn run_session(config: &TunnelConfig, node_api_port: u16) -> Result<(), TunnelError> {
    let tcp = TcpStream::connect((config.hub_ssh_host.as_str(), config.hub_ssh_port))?;
    tcp.set_nodelay(true)?;

    let mut session = Session::new()?;
    session.set_tcp_stream(tcp);
    session.handshake()?;

    session.userauth_pubkey_file(
        &config.ssh_user,
        None,
        Path::new(&config.ssh_key_path),
        None,
    )?;
    if !session.authenticated() {
        return Err(TunnelError::AuthFailed(config.ssh_user.clone()));
    }

    session.set_keepalive(true, KEEPALIVE_INTERVAL_SECS);

    // Local listeners: the full NBD pool plus the hub API port, all bound
    // to the node loopback.
    let mut forward_ports: Vec<u16> =
        (config.forward_port_min..=config.forward_port_max).collect();
    forward_ports.push(config.hub_api_port);

    let mut listeners: Vec<(u16, TcpListener)> = Vec::new();
    for port in forward_ports {
        let listener = TcpListener::bind(("127.0.0.1", port))?;
        listener.set_nonblocking(true)?;
        listeners.push((port, listener));
    }

    // Reverse forward for the node API, while the session still blocks.
    let (mut reverse_listener, bound_port) = session.channel_forward_listen(
        config.reverse_remote_port,
        Some("127.0.0.1"),
        None,
    )?;
    info!(
        "Tunnel up: {} forwards, reverse {} -> node API",
        listeners.len(),
        bound_port
    );

    session.set_blocking(false);

    let mut pumps: Vec<Pump> = Vec::new();
    let mut last_keepalive = Instant::now();

    loop {
        // Keepalives double as liveness probes; a dead transport errors
        // out here and triggers the reconnect path.
        if last_keepalive.elapsed().as_secs() >= KEEPALIVE_INTERVAL_SECS as u64 {
            session.set_blocking(true);
            let result = session.keepalive_send();
            session.set_blocking(false);
            result?;
            last_keepalive = Instant::now();
        }

        // New outbound connections: loopback listener -> hub-side port.
        for (port, listener) in &listeners {
            match listener.accept() {
                Ok((tcp, _)) => {
                    tcp.set_nonblocking(true)?;
                    tcp.set_nodelay(true)?;

                    session.set_blocking(true);
                    let channel =
                        session.channel_direct_tcpip("127.0.0.1", *port, None);
                    session.set_blocking(false);

                    match channel {
                        Ok(channel) => {
                            debug!("Forwarding new connection to hub port {}", port);
                            pumps.push(Pump::new(tcp, channel, format!("forward:{}", port)));
                        }
                        Err(e) => warn!("Could not open channel to hub port {}: {}", port, e),
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e.into()),
            }
        }

        // New inbound connections: hub -> node API.
        match reverse_listener.accept() {
            Ok(channel) => {
                session.set_blocking(false);
                match TcpStream::connect(("127.0.0.1", node_api_port)) {
                    Ok(tcp) => {
                        tcp.set_nonblocking(true)?;
                        debug!("Accepted reverse connection for the node API");
                        pumps.push(Pump::new(tcp, channel, "reverse:node-api".to_string()));
                    }
                    Err(e) => warn!("Node API not reachable locally: {}", e),
                }
            }
            Err(ref e) if is_would_block(e) => {}
            Err(e) => return Err(e.into()),
        }

        pumps.retain_mut(|pump| pump.service());

        std::thread::sleep(Duration::from_millis(5));
    }
}

fn is_would_block(e: &ssh2::Error) -> bool {
    e.code() == ssh2::ErrorCode::Session(-37) // LIBSSH2_ERROR_EAGAIN
}

//! listener.rs
//! Operator (HMI) signal sources.
//!
//! The UDP listener accepts JSON datagrams such as `{"status": "begin"}`. A `data` key is
//! accepted and ignored; any other key is logged. Malformed datagrams count as capture
//! failures and are dropped.

use std::{
    io,
    net::{SocketAddr, UdpSocket},
    time::Duration,
};

use log::{info, warn};
use serde_json::Value;
use socket2::{Domain, Protocol, Socket, Type};

use crate::control::{
    exit::ExitToken,
    state::{ControlSignal, UnknownSignal},
};
use crate::vehicle::{
    channel::{ChannelError, OrderedSender},
    watchdog::Watchdog,
};

const DATAGRAM_MAX: usize = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HmiSource {
    Udp { bind: SocketAddr },
    /// Starts one episode immediately and requests exit when the process shuts down.
    Dummy,
}

#[derive(Debug, thiserror::Error)]
pub enum DatagramError {
    #[error("not json: {0}")]
    NotJson(#[from] serde_json::Error),
    #[error("datagram is not a json object")]
    NotObject,
    #[error("status must be a string, got {0}")]
    StatusType(Value),
    #[error(transparent)]
    Unknown(#[from] UnknownSignal),
}

/// Extracts the control signal, if any, from one datagram.
pub fn parse_datagram(bytes: &[u8]) -> Result<Option<ControlSignal>, DatagramError> {
    let doc: Value = serde_json::from_slice(bytes)?;
    let obj = doc.as_object().ok_or(DatagramError::NotObject)?;
    let mut signal = None;
    for (key, value) in obj {
        match key.as_str() {
            "status" => {
                let s = value.as_str().ok_or_else(|| DatagramError::StatusType(value.clone()))?;
                signal = Some(s.parse()?);
            }
            "data" => info!("[Listener] data message ignored"),
            other => warn!("[Listener] unexpected key {}: {}", other, value),
        }
    }
    Ok(signal)
}

pub fn bind_udp(bind: SocketAddr, poll: Duration) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(bind), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&bind.into())?;
    let socket: UdpSocket = socket.into();
    socket.set_read_timeout(Some(poll))?;
    Ok(socket)
}

/// Hands `signal` on, giving up only on exit or a closed channel.
fn forward(
    tx: &OrderedSender<ControlSignal>,
    mut signal: ControlSignal,
    exit: &ExitToken,
    poll: Duration,
) -> bool {
    loop {
        match tx.put_timeout(signal, poll) {
            Ok(()) => return true,
            Err(rej) if rej.reason == ChannelError::Timeout && !exit.is_set() => signal = rej.item,
            Err(_) => return false,
        }
    }
}

pub fn run_udp_listener(
    socket: UdpSocket,
    tx: OrderedSender<ControlSignal>,
    watchdog: Watchdog,
    exit: ExitToken,
    poll: Duration,
) -> io::Result<()> {
    info!("[Listener] udp on {}", socket.local_addr()?);
    let mut buf = [0u8; DATAGRAM_MAX];
    while !exit.is_set() {
        let (n, peer) = match socket.recv_from(&mut buf) {
            Ok(r) => r,
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                continue;
            }
            Err(e) => return Err(e),
        };
        match parse_datagram(&buf[..n]) {
            Ok(Some(signal)) => {
                info!("[Listener] {:?} from {}", signal, peer);
                if !forward(&tx, signal, &exit, poll) || signal == ControlSignal::Exit {
                    break;
                }
            }
            Ok(None) => {}
            Err(e) => {
                let failures = watchdog.record_capture_failure();
                warn!("[Listener] dropped datagram from {} ({} failures): {}", peer, failures, e);
            }
        }
    }
    info!("[Listener] stopped");
    Ok(())
}

pub fn run_dummy_listener(tx: OrderedSender<ControlSignal>, exit: ExitToken, poll: Duration) {
    info!("[Listener] dummy source, starting episode");
    if !forward(&tx, ControlSignal::Begin, &exit, poll) {
        return;
    }
    while !exit.sleep(poll) {}
    // the control loop may already be gone; best effort
    let _ = tx.put_timeout(ControlSignal::Exit, poll);
    info!("[Listener] dummy source stopped");
}

//! health.rs
//! Plain-HTTP status endpoint: `GET /health` answers with the pipeline status as JSON.
//!
//! The listener is non-blocking and polled, so the server thread notices the exit token
//! within one poll interval. Requests are answered inline; they are tiny.

use std::{
    io::{self, BufRead, BufReader, Write},
    net::{SocketAddr, TcpListener, TcpStream},
    thread::{self, JoinHandle},
    time::Duration,
};

use log::{debug, info, warn};
use socket2::{Domain, SockAddr, Socket, Type};

use crate::control::exit::ExitToken;
use crate::vehicle::interface::PipelineStatus;

pub fn bind_health(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    socket.bind(&SockAddr::from(addr))?;
    socket.listen(16)?;
    let listener: TcpListener = socket.into();
    listener.set_nonblocking(true)?;
    Ok(listener)
}

pub fn spawn_health_server(
    listener: TcpListener,
    status: PipelineStatus,
    exit: ExitToken,
    poll: Duration,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("health".into())
        .spawn(move || serve(listener, status, exit, poll))
}

fn serve(listener: TcpListener, status: PipelineStatus, exit: ExitToken, poll: Duration) {
    if let Ok(addr) = listener.local_addr() {
        info!("[Health] status at http://{}/health", addr);
    }
    while !exit.is_set() {
        match listener.accept() {
            Ok((mut stream, peer)) => {
                if let Err(e) = respond(&mut stream, &status) {
                    debug!("[Health] request from {} failed: {}", peer, e);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                exit.sleep(poll);
            }
            Err(e) => {
                warn!("[Health] accept error: {}", e);
                exit.sleep(poll);
            }
        }
    }
    info!("[Health] stopped");
}

fn respond(stream: &mut TcpStream, status: &PipelineStatus) -> io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(Duration::from_secs(1)))?;
    let mut line = String::new();
    BufReader::new(stream.try_clone()?).read_line(&mut line)?;

    let response = if line.starts_with("GET /health ") {
        let body = serde_json::to_string(&status.snapshot())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        format!(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            body.len(),
            body
        )
    } else {
        "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_string()
    };
    stream.write_all(response.as_bytes())?;
    stream.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::state::{ControlSignal, ControlState};
    use crate::vehicle::watchdog::Watchdog;
    use std::{
        io::Read,
        sync::{Arc, atomic::AtomicU64},
    };

    fn get(addr: SocketAddr, path: &str) -> String {
        let mut s = TcpStream::connect(addr).unwrap();
        write!(s, "GET {path} HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
        let mut out = String::new();
        s.read_to_string(&mut out).unwrap();
        out
    }

    #[test]
    fn test_health_reports_state_and_counters() {
        let state = ControlState::new();
        let watchdog = Watchdog::new();
        let status = PipelineStatus::new(state.clone(), watchdog.clone(), Arc::new(AtomicU64::new(3)));
        let listener = bind_health("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        let exit = ExitToken::new();
        let handle = spawn_health_server(listener, status, exit.clone(), Duration::from_millis(5)).unwrap();

        state.apply(ControlSignal::Begin).unwrap();
        watchdog.record_flash_failure();
        let reply = get(addr, "/health");
        assert!(reply.starts_with("HTTP/1.1 200 OK"));
        let body = reply.split("\r\n\r\n").nth(1).unwrap();
        let doc: serde_json::Value = serde_json::from_str(body).unwrap();
        assert_eq!(doc["state"], "running");
        assert_eq!(doc["flash_failures"], 1);
        assert_eq!(doc["capture_failures"], 0);
        assert_eq!(doc["stale_raw_dropped"], 3);

        assert!(get(addr, "/nope").starts_with("HTTP/1.1 404"));
        exit.trigger();
        handle.join().unwrap();
    }
}

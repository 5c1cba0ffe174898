//! probe.rs
//! Liveness probes run after a recoverable protocol failure.
//!
//! A probe only produces a diagnostic; its outcome never changes the retry decision.

use std::{
    net::{SocketAddr, TcpStream, ToSocketAddrs},
    process::{Command, Stdio},
    time::{Duration, Instant},
};

use log::{info, warn};

pub trait LivenessProbe: Send + Sync {
    /// `true` if the remote end answered.
    fn probe(&self) -> bool;
}

/// One ICMP echo through the system `ping` binary.
pub struct PingProbe {
    host: String,
}

impl PingProbe {
    pub fn new(host: impl Into<String>) -> Self {
        Self { host: host.into() }
    }
}

impl LivenessProbe for PingProbe {
    fn probe(&self) -> bool {
        let status = Command::new("ping")
            .args(["-c", "1", "-W", "1", &self.host])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        match status {
            Ok(s) if s.success() => {
                info!("[Probe] {} is up", self.host);
                true
            }
            Ok(s) => {
                warn!("[Probe] {} is down, ping exited with {}", self.host, s);
                false
            }
            Err(e) => {
                warn!("[Probe] could not run ping for {}: {}", self.host, e);
                false
            }
        }
    }
}

/// TCP connect to the service port; for hosts that drop ICMP.
pub struct TcpProbe {
    target: String,
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(target: impl Into<String>, timeout: Duration) -> Self {
        Self { target: target.into(), timeout }
    }

    fn resolve(&self) -> Option<SocketAddr> {
        self.target.to_socket_addrs().ok()?.next()
    }
}

impl LivenessProbe for TcpProbe {
    fn probe(&self) -> bool {
        let Some(addr) = self.resolve() else {
            warn!("[Probe] cannot resolve {}", self.target);
            return false;
        };
        let start = Instant::now();
        match TcpStream::connect_timeout(&addr, self.timeout) {
            Ok(_) => {
                info!("[Probe] {} answered in {:?}", self.target, start.elapsed());
                true
            }
            Err(e) => {
                warn!("[Probe] {} unreachable: {}", self.target, e);
                false
            }
        }
    }
}

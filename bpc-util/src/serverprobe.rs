//! Liveness probe for the external server process that normally owns per-host coordination.
//!
//! Migration refuses outright while the server is up: a live server may hold in-memory state
//! about a backup that a concurrent migration would invalidate. The coordination protocol
//! itself is out of scope for this crate; this collaborator only needs to answer whether anyone
//! is listening on the server's configured address.

use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

/// Something that can say whether the coordinating server process is currently up.
pub trait ServerProbe {
	fn is_running(&self) -> bool;
}

/// Probes `server_host:server_port` with a short connect attempt.
pub struct ConfigServerProbe {
	host: String,
	port: u16,
	timeout: Duration,
}

impl ConfigServerProbe {
	pub fn new(host: String, port: u16) -> Self {
		Self {
			host,
			port,
			timeout: Duration::from_millis(200),
		}
	}
}

impl ServerProbe for ConfigServerProbe {
	fn is_running(&self) -> bool {
		let Ok(addrs) = (self.host.as_str(), self.port).to_socket_addrs() else {
			return false;
		};
		addrs
			.into_iter()
			.any(|addr| TcpStream::connect_timeout(&addr, self.timeout).is_ok())
	}
}

/// Always reports the server as down. Used for standalone deployments with no coordinating
/// server and in tests.
pub struct NoopServerProbe;

impl ServerProbe for NoopServerProbe {
	fn is_running(&self) -> bool {
		false
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn noop_probe_never_blocks_migration() {
		assert!(!NoopServerProbe.is_running());
	}

	#[test]
	fn unreachable_port_reports_not_running() {
		let probe = ConfigServerProbe::new("127.0.0.1".to_owned(), 1);
		assert!(!probe.is_running());
	}
}

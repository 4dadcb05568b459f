use std::{
    fmt, io,
    net::{SocketAddr, ToSocketAddrs},
};

/// A `(host, port)` pair identifying a TCP peer.
///
/// This is the key for all client registries. Ordering is lexicographic on
/// the host, then numeric on the port.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port }
    }

    /// Blocking name resolution; runs on a resolver thread, never on an
    /// executor. IPv4 candidates are tried first.
    pub(crate) fn resolve(&self) -> io::Result<Vec<SocketAddr>> {
        let addrs: Vec<SocketAddr> = (self.host.as_str(), self.port).to_socket_addrs()?.collect();
        if addrs.is_empty() {
            return Err(io::ErrorKind::AddrNotAvailable.into());
        }
        let (mut candidates, v6): (Vec<_>, Vec<_>) =
            addrs.into_iter().partition(SocketAddr::is_ipv4);
        candidates.extend(v6);
        Ok(candidates)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_is_host_then_port() {
        let mut endpoints = vec![
            Endpoint::new("beta", 1),
            Endpoint::new("alpha", 9000),
            Endpoint::new("alpha", 80),
        ];
        endpoints.sort();
        assert_eq!(endpoints[0], Endpoint::new("alpha", 80));
        assert_eq!(endpoints[1], Endpoint::new("alpha", 9000));
        assert_eq!(endpoints[2], Endpoint::new("beta", 1));
    }

    #[test]
    fn resolves_loopback() {
        let addrs = Endpoint::new("127.0.0.1", 4242).resolve().unwrap();
        assert!(addrs.iter().all(|a| a.port() == 4242));
        assert!(addrs[0].is_ipv4());
    }
}

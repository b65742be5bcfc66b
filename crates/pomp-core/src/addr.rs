//! Address grammar used by both the CLI surface and the context/connection
//! API: `inet:<host>:<port>`, `inet6:<host>:<port>`, `unix:<path>`, and the
//! Linux abstract-namespace form `unix:@<name>`. Grounded on `pomp_addr.c`.

use std::net::{SocketAddr, SocketAddrV4, SocketAddrV6};

use crate::error::{PompError, Result};

/// A parsed `libpomp` address: either an inet/inet6 socket address, or a Unix
/// domain path (possibly abstract-namespace on Linux).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Addr {
    Inet(SocketAddrV4),
    Inet6(SocketAddrV6),
    /// Filesystem-rooted Unix domain socket path.
    Unix(String),
    /// Linux abstract-namespace Unix domain socket name (no leading NUL
    /// stored; the connection layer re-adds it when building a `sockaddr_un`).
    UnixAbstract(String),
}

impl Addr {
    /// True for any `Unix`/`UnixAbstract` address: these are the only kind
    /// allowed to carry file descriptors.
    #[inline]
    pub fn is_unix(&self) -> bool {
        matches!(self, Self::Unix(_) | Self::UnixAbstract(_))
    }

    /// Parses one of the four supported forms.
    pub fn parse(s: &str) -> Result<Self> {
        if let Some(rest) = s.strip_prefix("inet6:") {
            let sockaddr = parse_inet(rest)?;
            return match sockaddr {
                SocketAddr::V6(v6) => Ok(Self::Inet6(v6)),
                SocketAddr::V4(v4) => Ok(Self::Inet6(v4_mapped_v6(v4))),
            };
        }
        if let Some(rest) = s.strip_prefix("inet:") {
            let sockaddr = parse_inet(rest)?;
            return match sockaddr {
                SocketAddr::V4(v4) => Ok(Self::Inet(v4)),
                SocketAddr::V6(_) => {
                    Err(PompError::InvalidArgument("inet: address resolved to IPv6"))
                }
            };
        }
        if let Some(rest) = s.strip_prefix("unix:") {
            return if let Some(name) = rest.strip_prefix('@') {
                Ok(Self::UnixAbstract(name.to_owned()))
            } else {
                Ok(Self::Unix(rest.to_owned()))
            };
        }
        Err(PompError::InvalidArgument("unknown address scheme"))
    }

    /// Produces the canonical string form, the inverse of [`Addr::parse`].
    pub fn format(&self) -> String {
        match self {
            Self::Inet(v4) => format!("inet:{}:{}", v4.ip(), v4.port()),
            Self::Inet6(v6) => format!("inet6:{}:{}", v6.ip(), v6.port()),
            Self::Unix(path) => format!("unix:{path}"),
            Self::UnixAbstract(name) => format!("unix:@{name}"),
        }
    }
}

impl std::fmt::Display for Addr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.format())
    }
}

impl std::str::FromStr for Addr {
    type Err = PompError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

fn v4_mapped_v6(v4: SocketAddrV4) -> SocketAddrV6 {
    SocketAddrV6::new(v4.ip().to_ipv6_mapped(), v4.port(), 0, 0)
}

/// Parses `<host>:<port>` with a numeric host (matching `AI_NUMERICHOST` in
/// the reference implementation: no DNS resolution happens here).
fn parse_inet(s: &str) -> Result<SocketAddr> {
    let sep = s.rfind(':').ok_or(PompError::InvalidArgument("missing port separator"))?;
    let (host, port_str) = (&s[..sep], &s[sep + 1..]);
    let port: u16 =
        port_str.parse().map_err(|_| PompError::InvalidArgument("invalid port number"))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let ip: std::net::IpAddr =
        host.parse().map_err(|_| PompError::InvalidArgument("invalid numeric host"))?;
    Ok(SocketAddr::new(ip, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_inet() {
        let a = Addr::parse("inet:127.0.0.1:4242").unwrap();
        assert_eq!(a.format(), "inet:127.0.0.1:4242");
    }

    #[test]
    fn roundtrips_inet6() {
        let a = Addr::parse("inet6:::1:4242").unwrap();
        assert!(matches!(a, Addr::Inet6(_)));
        assert_eq!(Addr::parse(&a.format()).unwrap(), a);
    }

    #[test]
    fn roundtrips_unix_path() {
        let a = Addr::parse("unix:/tmp/pomp.sock").unwrap();
        assert_eq!(a.format(), "unix:/tmp/pomp.sock");
        assert!(a.is_unix());
    }

    #[test]
    fn roundtrips_unix_abstract() {
        let a = Addr::parse("unix:@my-socket").unwrap();
        assert_eq!(a, Addr::UnixAbstract("my-socket".into()));
        assert_eq!(a.format(), "unix:@my-socket");
    }

    #[test]
    fn rejects_unknown_scheme() {
        assert!(Addr::parse("foo:bar").is_err());
    }

    #[test]
    fn rejects_missing_port() {
        assert!(Addr::parse("inet:127.0.0.1").is_err());
    }
}

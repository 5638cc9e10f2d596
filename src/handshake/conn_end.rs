use std::fmt::{Debug, Display, Formatter};
use std::net::Ipv4Addr;
use std::str::FromStr;

use anyhow::{anyhow, bail};

/// The address at which a process accepts out-of-band ("immediate") messages, rendered on the
///  wire as `TCP:<domain>:<ip>:<port>` or `TCP:<ip>:<port>` when no domain is configured.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct UimAddr {
    pub domain_id: Option<u32>,
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl UimAddr {
    pub fn new(domain_id: Option<u32>, ip: Ipv4Addr, port: u16) -> UimAddr {
        UimAddr { domain_id, ip, port }
    }

    #[cfg(test)]
    pub fn localhost(port: u16) -> UimAddr {
        UimAddr::new(None, Ipv4Addr::LOCALHOST, port)
    }
}

impl Display for UimAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.domain_id {
            Some(domain_id) => write!(f, "TCP:{}:{}:{}", domain_id, self.ip, self.port),
            None => write!(f, "TCP:{}:{}", self.ip, self.port),
        }
    }
}

impl Debug for UimAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}]", self)
    }
}

impl FromStr for UimAddr {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some(rest) = s.strip_prefix("TCP:") else {
            bail!("address {:?} does not start with TCP:", s);
        };

        let parts = rest.split(':').collect::<Vec<_>>();
        let (domain_id, ip, port) = match parts.as_slice() {
            [ip, port] => (None, *ip, *port),
            [domain_id, ip, port] => (Some(domain_id.parse::<u32>()
                .map_err(|e| anyhow!("invalid domain id in address {:?}: {}", s, e))?), *ip, *port),
            _ => bail!("malformed address {:?}", s),
        };

        Ok(UimAddr {
            domain_id,
            ip: ip.parse().map_err(|e| anyhow!("invalid ip in address {:?}: {}", s, e))?,
            port: port.parse().map_err(|e| anyhow!("invalid port in address {:?}: {}", s, e))?,
        })
    }
}


/// One half of a connection as seen on the wire: the random id of the process owning it, the
///  address that process receives handshakes at, and the connection id the process assigned.
///
/// The receiver's half is the key by which the source side finds a connection. Including the
///  process id keeps a restarted process at the same address from being mistaken for its
///  previous incarnation.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ConnEnd {
    pub ct_id: u32,
    pub uim_addr: UimAddr,
    pub conn_id: u32,
}

impl ConnEnd {
    pub fn new(ct_id: u32, uim_addr: UimAddr, conn_id: u32) -> ConnEnd {
        ConnEnd { ct_id, uim_addr, conn_id }
    }
}

impl Display for ConnEnd {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{},{},{}", self.ct_id, self.uim_addr, self.conn_id)
    }
}

impl Debug for ConnEnd {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}]", self)
    }
}

#[cfg(test)]
mod test {
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case::with_domain("TCP:7:10.29.3.41:12000", Some(7), Ipv4Addr::new(10, 29, 3, 41), 12000)]
    #[case::without_domain("TCP:127.0.0.1:14400", None, Ipv4Addr::LOCALHOST, 14400)]
    #[case::max_values("TCP:4294967295:255.255.255.255:65535", Some(u32::MAX), Ipv4Addr::BROADCAST, 65535)]
    fn test_uim_addr_parse(#[case] s: &str, #[case] domain_id: Option<u32>, #[case] ip: Ipv4Addr, #[case] port: u16) {
        let addr = UimAddr::from_str(s).unwrap();
        assert_eq!(addr, UimAddr::new(domain_id, ip, port));
        assert_eq!(addr.to_string(), s);
    }

    #[rstest]
    #[case::no_prefix("10.0.0.1:123")]
    #[case::wrong_prefix("UDP:10.0.0.1:123")]
    #[case::bad_ip("TCP:10.0.0:123")]
    #[case::bad_port("TCP:10.0.0.1:70000")]
    #[case::bad_domain("TCP:x:10.0.0.1:123")]
    #[case::too_many_parts("TCP:1:2:10.0.0.1:123")]
    #[case::empty("")]
    fn test_uim_addr_parse_invalid(#[case] s: &str) {
        assert!(UimAddr::from_str(s).is_err());
    }

    #[test]
    fn test_conn_end_display() {
        let end = ConnEnd::new(12345, UimAddr::new(Some(1), Ipv4Addr::new(10, 0, 0, 2), 14000), 3);
        assert_eq!(end.to_string(), "12345,TCP:1:10.0.0.2:14000,3");
        assert_eq!(format!("{:?}", end), "[12345,TCP:1:10.0.0.2:14000,3]");
    }
}

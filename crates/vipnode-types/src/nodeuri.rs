//! Ethereum node URI (`enode://<id>[@<host>:<port>]`) parsing.

use crate::error::{VipnodeError, VipnodeResult};
use std::fmt;
use std::net::IpAddr;
use url::{Host, Url};

const SCHEME: &str = "enode";

/// A parsed `enode://` URI.
///
/// Accepts a bare ID, a scheme-qualified ID, or an ID with a remote address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeUri {
    url: Url,
}

impl NodeUri {
    /// Parse an `enode://...` string, prefixing the scheme when it is missing.
    pub fn parse(enode: &str) -> VipnodeResult<Self> {
        let raw = if !enode.starts_with("enode://") && !enode.contains("://") {
            format!("{SCHEME}://{enode}")
        } else {
            enode.to_string()
        };

        let url = Url::parse(&raw).map_err(|e| VipnodeError::InvalidNodeUri(e.to_string()))?;
        if url.scheme() != SCHEME {
            return Err(VipnodeError::InvalidNodeUri(format!(
                "invalid enode scheme: {}",
                url.scheme()
            )));
        }
        if url.host_str().map_or(true, str::is_empty) {
            return Err(VipnodeError::InvalidNodeUri(format!("missing node ID: {enode}")));
        }
        Ok(Self { url })
    }

    /// The node's identity. Always present.
    pub fn id(&self) -> &str {
        if self.has_user() {
            // "enode://<id>@<host>"
            self.url.username()
        } else {
            // "enode://<id>"
            self.url.host_str().unwrap_or_default()
        }
    }

    /// `host:port` to dial, or empty when no usable address was given.
    ///
    /// `localhost`, loopback and unspecified addresses are never returned.
    pub fn remote_address(&self) -> String {
        if !self.has_remote() {
            return String::new();
        }
        match self.url.port() {
            Some(port) => format!("{}:{port}", self.url.host_str().unwrap_or_default()),
            None => self.url.host_str().unwrap_or_default().to_string(),
        }
    }

    /// Host part of the remote address, under the same rules as
    /// [`remote_address`](Self::remote_address).
    pub fn remote_host(&self) -> String {
        if !self.has_remote() {
            return String::new();
        }
        match self.url.host() {
            Some(Host::Ipv6(ip)) => ip.to_string(),
            Some(host) => host.to_string(),
            None => String::new(),
        }
    }

    /// Copy of this URI with its address host replaced by `ip`.
    ///
    /// The port is kept; a bare-ID URI gains the default devp2p port.
    pub fn with_remote_host(&self, ip: IpAddr) -> Self {
        let port = self.url.port().unwrap_or(30303);
        let host = match ip {
            IpAddr::V4(v4) => v4.to_string(),
            IpAddr::V6(v6) => format!("[{v6}]"),
        };
        let raw = format!("{SCHEME}://{}@{host}:{port}", self.id());
        match Url::parse(&raw) {
            Ok(url) => Self { url },
            Err(_) => self.clone(),
        }
    }

    fn has_user(&self) -> bool {
        !self.url.username().is_empty()
    }

    fn has_remote(&self) -> bool {
        if !self.has_user() {
            return false;
        }
        // Future node versions may dial DNS names, so only filter the
        // addresses that can never be reached from another machine.
        match self.url.host() {
            Some(Host::Domain(name)) => match name.parse::<IpAddr>() {
                Ok(ip) => is_routable(ip),
                Err(_) => name != "localhost",
            },
            Some(Host::Ipv4(ip)) => is_routable(IpAddr::V4(ip)),
            Some(Host::Ipv6(ip)) => is_routable(IpAddr::V6(ip)),
            None => false,
        }
    }
}

fn is_routable(ip: IpAddr) -> bool {
    !(ip.is_unspecified() || ip.is_loopback())
}

impl fmt::Display for NodeUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.url.as_str())
    }
}

impl std::str::FromStr for NodeUri {
    type Err = VipnodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_forms() {
        let cases = [
            ("abc", "abc", ""),
            ("enode://abc", "abc", ""),
            ("enode://abc@1.2.3.4:30303", "abc", "1.2.3.4:30303"),
            ("enode://abc@1.2.3.4", "abc", "1.2.3.4"),
            ("enode://abc@example.org:30303", "abc", "example.org:30303"),
            ("enode://abc@127.0.0.1:30303", "abc", ""),
            ("enode://abc@0.0.0.0:30303", "abc", ""),
            ("enode://abc@localhost:30303", "abc", ""),
            ("enode://abc@[::1]:30303", "abc", ""),
            ("enode://abc@[::]:30303", "abc", ""),
        ];
        for (input, id, remote) in cases {
            let uri = NodeUri::parse(input).unwrap();
            assert_eq!(uri.id(), id, "id of {input}");
            assert_eq!(uri.remote_address(), remote, "remote of {input}");
        }
    }

    #[test]
    fn test_remote_host() {
        let uri = NodeUri::parse("enode://abc@10.1.2.3:30303").unwrap();
        assert_eq!(uri.remote_host(), "10.1.2.3");
        let local = NodeUri::parse("enode://abc@127.0.0.1:30303").unwrap();
        assert_eq!(local.remote_host(), "");
    }

    #[test]
    fn test_invalid_scheme() {
        let err = NodeUri::parse("http://abc@1.2.3.4").unwrap_err();
        assert!(err.to_string().contains("invalid enode scheme: http"));
    }

    #[test]
    fn test_with_remote_host_keeps_port() {
        let uri = NodeUri::parse("enode://abc@127.0.0.1:30305").unwrap();
        let fixed = uri.with_remote_host("192.168.1.7".parse().unwrap());
        assert_eq!(fixed.id(), "abc");
        assert_eq!(fixed.remote_address(), "192.168.1.7:30305");

        let bare = NodeUri::parse("abc").unwrap();
        let fixed = bare.with_remote_host("10.0.0.2".parse().unwrap());
        assert_eq!(fixed.to_string(), "enode://abc@10.0.0.2:30303");
    }

    #[test]
    fn test_display_is_canonical() {
        let uri: NodeUri = "abc".parse().unwrap();
        assert_eq!(uri.to_string(), "enode://abc");
    }
}

use crate::Labels;
use std::{collections::BTreeMap, fmt, net::IpAddr};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Service {
    /// `<name>.<namespace>.svc.<domain-suffix>`
    pub hostname: String,

    /// The cluster IP. Unset for headless and external-name services.
    pub address: Option<IpAddr>,

    pub ports: Vec<Port>,

    /// Sorted identities that are declared to serve this service.
    pub service_accounts: Vec<String>,

    pub mesh_external: bool,

    pub resolution: Resolution,

    pub attributes: ServiceAttributes,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ServiceAttributes {
    pub registry: String,
    pub name: String,
    pub namespace: String,
    pub uid: String,
    pub labels: Labels,
    pub label_selectors: BTreeMap<String, String>,
    pub external_name: Option<String>,

    /// External addresses by cluster ID.
    pub cluster_external_addresses: BTreeMap<String, Vec<String>>,

    /// Service port to node port mappings by cluster ID.
    pub cluster_external_ports: BTreeMap<String, BTreeMap<u16, u16>>,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Port {
    pub name: String,
    pub port: u16,
    pub protocol: Protocol,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Protocol {
    Grpc,
    GrpcWeb,
    Http,
    Http2,
    Https,
    Mongo,
    Mysql,
    Redis,
    Tcp,
    Tls,
    Udp,
    Unsupported,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Resolution {
    /// Clients pick an endpoint from the resolved set.
    ClientSideLb,
    /// Clients resolve the hostname through DNS.
    DnsLb,
    /// Traffic is forwarded to the original destination (headless services).
    Passthrough,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Gateway {
    pub address: String,
    pub port: u16,
}

// === impl Service ===

impl Service {
    pub fn port_by_number(&self, port: u16) -> Option<&Port> {
        self.ports.iter().find(|p| p.port == port)
    }

    pub fn port_by_name(&self, name: &str) -> Option<&Port> {
        self.ports.iter().find(|p| p.name == name)
    }

    #[inline]
    pub fn is_headless(&self) -> bool {
        self.resolution == Resolution::Passthrough
    }
}

// === impl Protocol ===

impl Protocol {
    /// Parses a protocol name case-insensitively.
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "grpc" => Self::Grpc,
            "grpc-web" => Self::GrpcWeb,
            "http" => Self::Http,
            "http2" => Self::Http2,
            "https" => Self::Https,
            "mongo" => Self::Mongo,
            "mysql" => Self::Mysql,
            "redis" => Self::Redis,
            "tcp" => Self::Tcp,
            "tls" => Self::Tls,
            "udp" => Self::Udp,
            _ => Self::Unsupported,
        }
    }

    /// Infers a protocol from a port name such as `http-web` or `grpc`.
    pub fn from_port_name(name: &str) -> Self {
        let name = name.to_ascii_lowercase();
        if name.starts_with("grpc-web") {
            return Self::GrpcWeb;
        }
        match Self::parse(&name) {
            Self::Unsupported => match name.split_once('-') {
                Some((prefix, _)) => Self::parse(prefix),
                None => Self::Unsupported,
            },
            p => p,
        }
    }

    pub fn is_http(&self) -> bool {
        matches!(
            self,
            Self::Http | Self::Http2 | Self::Grpc | Self::GrpcWeb
        )
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Grpc => "GRPC",
            Self::GrpcWeb => "GRPC-Web",
            Self::Http => "HTTP",
            Self::Http2 => "HTTP2",
            Self::Https => "HTTPS",
            Self::Mongo => "Mongo",
            Self::Mysql => "MySQL",
            Self::Redis => "Redis",
            Self::Tcp => "TCP",
            Self::Tls => "TLS",
            Self::Udp => "UDP",
            Self::Unsupported => "UnsupportedProtocol",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_from_port_name() {
        for (name, expected) in [
            ("http", Protocol::Http),
            ("http-example", Protocol::Http),
            ("HTTP2-web", Protocol::Http2),
            ("tcp-port", Protocol::Tcp),
            ("grpc-web-ui", Protocol::GrpcWeb),
            ("grpc-api", Protocol::Grpc),
            ("mgmt", Protocol::Unsupported),
            ("", Protocol::Unsupported),
        ] {
            assert_eq!(Protocol::from_port_name(name), expected, "{name}");
        }
    }
}

//! Network publication: host endpoints derived from ingress ports.
//!
//! Endpoints are plain records. The orchestrator binds each one at run time
//! through [`ExecutionBackend::bind_socket`](crate::backend::ExecutionBackend::bind_socket),
//! so a published socket has a lifecycle of its own next to its service.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use stevedore_common::constants::INGRESS_MODE;
use stevedore_common::error::{Result, StevedoreError};
use stevedore_common::types::{AddressFamily, TransportProtocol};
use stevedore_compose::model::{PortConfig, ServiceDescriptor};

/// An externally reachable binding for one service port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedEndpoint {
    /// Bind address in `host:port` form; the host is empty for all interfaces.
    pub address: String,
    /// Address family the bind address belongs to.
    pub family: AddressFamily,
    /// Host port.
    pub published: u16,
    /// Port inside the service.
    pub target: u16,
    /// Transport protocol.
    pub protocol: TransportProtocol,
}

impl PublishedEndpoint {
    /// Socket address to listen on.
    ///
    /// An unspecified family listens on every IPv4 interface.
    ///
    /// # Errors
    ///
    /// Returns [`StevedoreError::Backend`] if the host part is not an IP
    /// address.
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        let host = self
            .address
            .rsplit_once(':')
            .map_or("", |(host, _)| host)
            .trim_start_matches('[')
            .trim_end_matches(']');
        if host.is_empty() {
            let any = match self.family {
                AddressFamily::Ipv6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
                AddressFamily::Unspecified | AddressFamily::Ipv4 => {
                    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
                }
            };
            return Ok(SocketAddr::new(any, self.published));
        }
        let ip: IpAddr = host.parse().map_err(|_| StevedoreError::Backend {
            operation: "bind socket",
            message: format!("invalid bind address {}", self.address),
        })?;
        Ok(SocketAddr::new(ip, self.published))
    }
}

impl fmt::Display for PublishedEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}/{}", self.address, self.target, self.protocol)
    }
}

/// Rejects any publication mode other than `ingress`.
///
/// # Errors
///
/// Returns [`StevedoreError::Config`] for unsupported modes.
pub fn check_mode(service: &str, index: usize, port: &PortConfig) -> Result<()> {
    if port.mode == INGRESS_MODE {
        Ok(())
    } else {
        Err(StevedoreError::config(
            service,
            format!("ports[{index}].mode"),
            format!("port mode {} not supported", port.mode),
        ))
    }
}

/// Parses a declared protocol; empty means TCP.
///
/// # Errors
///
/// Returns [`StevedoreError::Config`] for anything but `tcp` or `udp`.
pub fn parse_protocol(service: &str, field: &str, protocol: &str) -> Result<TransportProtocol> {
    protocol
        .parse()
        .map_err(|message: String| StevedoreError::config(service, field, message))
}

/// Parses the published port string as an integer port.
///
/// # Errors
///
/// Returns [`StevedoreError::Config`] if the string is empty, a range, or
/// not a valid port number.
pub fn parse_published(service: &str, index: usize, port: &PortConfig) -> Result<u16> {
    port.published.trim().parse().map_err(|_| {
        StevedoreError::config(
            service,
            format!("ports[{index}].published"),
            format!(
                "published port \"{}\" for target {} is not a valid port number",
                port.published, port.target
            ),
        )
    })
}

fn bind_address(
    service: &str,
    index: usize,
    host_ip: Option<&str>,
    published: u16,
) -> Result<(String, AddressFamily)> {
    let Some(host) = host_ip.filter(|h| !h.is_empty()) else {
        return Ok((format!(":{published}"), AddressFamily::Unspecified));
    };
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => Ok((format!("{ip}:{published}"), AddressFamily::Ipv4)),
        Ok(IpAddr::V6(ip)) => Ok((format!("[{ip}]:{published}"), AddressFamily::Ipv6)),
        Err(_) => Err(StevedoreError::config(
            service,
            format!("ports[{index}].host_ip"),
            format!("host address {host} is not an IP address"),
        )),
    }
}

/// Derives the endpoint a single ingress port publishes.
///
/// # Errors
///
/// Returns [`StevedoreError::Config`] for a non-ingress mode, an invalid
/// published port, an unsupported protocol, or an invalid host address.
pub fn endpoint_for(service: &str, index: usize, port: &PortConfig) -> Result<PublishedEndpoint> {
    check_mode(service, index, port)?;
    let published = parse_published(service, index, port)?;
    let protocol = parse_protocol(service, &format!("ports[{index}].protocol"), &port.protocol)?;
    let (address, family) = bind_address(service, index, port.host_ip.as_deref(), published)?;
    Ok(PublishedEndpoint {
        address,
        family,
        published,
        target: port.target,
        protocol,
    })
}

/// Derives every endpoint `service` publishes, in declaration order.
///
/// # Errors
///
/// Returns the first [`StevedoreError::Config`] raised by [`endpoint_for`].
pub fn published_endpoints(service: &ServiceDescriptor) -> Result<Vec<PublishedEndpoint>> {
    service
        .ports
        .iter()
        .enumerate()
        .map(|(idx, port)| endpoint_for(&service.name, idx, port))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn web(port: PortConfig) -> ServiceDescriptor {
        ServiceDescriptor::new("web").image("app").port(port)
    }

    #[test]
    fn tcp_endpoint_from_empty_protocol() {
        let endpoints = published_endpoints(&web(PortConfig::ingress("8080", 80))).expect("ok");
        assert_eq!(
            endpoints,
            vec![PublishedEndpoint {
                address: ":8080".into(),
                family: AddressFamily::Unspecified,
                published: 8080,
                target: 80,
                protocol: TransportProtocol::Tcp,
            }]
        );
        assert_eq!(endpoints[0].to_string(), ":8080 -> 80/tcp");
    }

    #[test]
    fn udp_endpoint() {
        let endpoints =
            published_endpoints(&web(PortConfig::ingress("5353", 53).protocol("udp"))).expect("ok");
        assert_eq!(endpoints[0].protocol, TransportProtocol::Udp);
    }

    #[test]
    fn sctp_is_a_config_error() {
        let err = published_endpoints(&web(PortConfig::ingress("9000", 9000).protocol("sctp")))
            .unwrap_err();
        assert!(
            matches!(err, StevedoreError::Config { ref field, .. } if field == "ports[0].protocol"),
            "got: {err}"
        );
    }

    #[test]
    fn non_ingress_mode_is_a_config_error() {
        let err = published_endpoints(&web(PortConfig::ingress("8080", 80).mode("egress")))
            .unwrap_err();
        assert!(
            matches!(err, StevedoreError::Config { ref field, .. } if field == "ports[0].mode"),
            "got: {err}"
        );
    }

    #[test]
    fn non_integer_published_port_is_a_config_error() {
        for published in ["", "http", "8000-8001", "70000"] {
            let err = published_endpoints(&web(PortConfig::ingress(published, 80))).unwrap_err();
            assert!(matches!(err, StevedoreError::Config { .. }), "{published}: {err}");
        }
    }

    #[test]
    fn host_ip_selects_family() {
        let mut port = PortConfig::ingress("8080", 80);
        port.host_ip = Some("127.0.0.1".into());
        let v4 = endpoint_for("web", 0, &port).expect("v4");
        assert_eq!(v4.address, "127.0.0.1:8080");
        assert_eq!(v4.family, AddressFamily::Ipv4);
        assert_eq!(v4.socket_addr().expect("addr"), "127.0.0.1:8080".parse().expect("addr"));

        port.host_ip = Some("::1".into());
        let v6 = endpoint_for("web", 0, &port).expect("v6");
        assert_eq!(v6.address, "[::1]:8080");
        assert_eq!(v6.family, AddressFamily::Ipv6);
        assert_eq!(v6.socket_addr().expect("addr"), "[::1]:8080".parse().expect("addr"));

        port.host_ip = Some("localhost".into());
        assert!(endpoint_for("web", 0, &port).is_err());
    }

    #[test]
    fn unspecified_endpoint_listens_everywhere() {
        let endpoint = endpoint_for("web", 0, &PortConfig::ingress("8080", 80)).expect("ok");
        assert_eq!(endpoint.socket_addr().expect("addr"), "0.0.0.0:8080".parse().expect("addr"));
    }
}

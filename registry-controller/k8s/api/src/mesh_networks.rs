//! The mesh network topology document.
//!
//! ```yaml
//! networks:
//!   network1:
//!     endpoints:
//!       - fromCidr: 10.10.1.1/24
//!       - fromRegistry: Kubernetes
//!     gateways:
//!       - registryServiceName: istio-ingressgateway.istio-system.svc.cluster.local
//!         port: 15443
//!       - address: 192.168.1.1
//!         port: 80
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct MeshNetworks {
    /// Networks keyed by name. Iteration is in name order.
    #[serde(default)]
    pub networks: BTreeMap<String, Network>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Network {
    /// Each entry is a single-key map, e.g. `fromRegistry: Kubernetes`.
    #[serde(default, with = "serde_yaml::with::singleton_map_recursive")]
    pub endpoints: Vec<NetworkEndpoints>,

    #[serde(default)]
    pub gateways: Vec<NetworkGateway>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum NetworkEndpoints {
    FromCidr(String),
    FromRegistry(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct NetworkGateway {
    #[serde(flatten)]
    pub target: GatewayTarget,

    pub port: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locality: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum GatewayTarget {
    RegistryServiceName(String),
    Address(String),
}

#[derive(Debug, thiserror::Error)]
pub enum MeshNetworksError {
    #[error("invalid mesh networks document: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("network {network}: gateway port {port} out of range")]
    InvalidGatewayPort { network: String, port: u32 },

    #[error("network {network}: gateway has an empty address")]
    EmptyGateway { network: String },

    #[error("network name must not be empty")]
    EmptyNetworkName,
}

// === impl MeshNetworks ===

impl MeshNetworks {
    /// Parses and validates a YAML (or JSON) document.
    pub fn from_yaml(doc: &str) -> Result<Self, MeshNetworksError> {
        let networks = serde_yaml::from_str::<Self>(doc)?;
        networks.validate()?;
        Ok(networks)
    }

    pub fn validate(&self) -> Result<(), MeshNetworksError> {
        for (name, network) in &self.networks {
            if name.is_empty() {
                return Err(MeshNetworksError::EmptyNetworkName);
            }
            for gw in &network.gateways {
                if gw.port == 0 || gw.port > u16::MAX as u32 {
                    return Err(MeshNetworksError::InvalidGatewayPort {
                        network: name.clone(),
                        port: gw.port,
                    });
                }
                let addr = match &gw.target {
                    GatewayTarget::RegistryServiceName(n) | GatewayTarget::Address(n) => n,
                };
                if addr.is_empty() {
                    return Err(MeshNetworksError::EmptyGateway {
                        network: name.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_endpoints_and_gateways() {
        let networks = MeshNetworks::from_yaml(
            r#"
networks:
  network1:
    endpoints:
      - fromCidr: 10.10.1.1/24
      - fromRegistry: Kubernetes
    gateways:
      - registryServiceName: istio-ingressgateway
        port: 15443
      - address: 192.168.1.1
        port: 80
        locality: region1/zone1
"#,
        )
        .expect("document must parse");

        let network = &networks.networks["network1"];
        assert_eq!(
            network.endpoints,
            vec![
                NetworkEndpoints::FromCidr("10.10.1.1/24".to_string()),
                NetworkEndpoints::FromRegistry("Kubernetes".to_string()),
            ]
        );
        assert_eq!(
            network.gateways[0].target,
            GatewayTarget::RegistryServiceName("istio-ingressgateway".to_string())
        );
        assert_eq!(
            network.gateways[1].target,
            GatewayTarget::Address("192.168.1.1".to_string())
        );
        assert_eq!(network.gateways[1].port, 80);
        assert_eq!(
            network.gateways[1].locality.as_deref(),
            Some("region1/zone1")
        );
    }

    #[test]
    fn parses_json_documents() {
        let networks = MeshNetworks::from_yaml(
            r#"{"networks": {"n": {
                "endpoints": [{"fromRegistry": "cluster2"}],
                "gateways": [{"address": "gw.example.com", "port": 15443}]
            }}}"#,
        )
        .expect("document must parse");
        let network = &networks.networks["n"];
        assert_eq!(
            network.endpoints,
            vec![NetworkEndpoints::FromRegistry("cluster2".to_string())]
        );
        assert_eq!(
            network.gateways[0].target,
            GatewayTarget::Address("gw.example.com".to_string())
        );
    }

    #[test]
    fn rejects_unknown_endpoint_source() {
        let err = MeshNetworks::from_yaml(
            r#"
networks:
  n:
    endpoints:
      - fromNowhere: x
"#,
        )
        .expect_err("unknown source must be rejected");
        assert!(matches!(err, MeshNetworksError::Parse(_)));
    }

    #[test]
    fn rejects_out_of_range_port() {
        let err = MeshNetworks::from_yaml(
            r#"
networks:
  n:
    gateways:
      - address: 1.1.1.1
        port: 70000
"#,
        )
        .expect_err("port must be rejected");
        assert!(matches!(
            err,
            MeshNetworksError::InvalidGatewayPort { port: 70000, .. }
        ));
    }

    #[test]
    fn empty_document() {
        let networks = MeshNetworks::from_yaml("{}").expect("empty document must parse");
        assert!(networks.networks.is_empty());
    }
}

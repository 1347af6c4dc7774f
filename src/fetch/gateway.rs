use crate::primitives::{
    SourceAddress,
    SourceOrigin,
};

/// Swarm gateway serving `bzzr0` and `bzzr1` hashes.
pub const SWARM_GATEWAY: &str = "https://swarm-gateways.net/bzz-raw:/";

/// Maps a content-address origin to a concrete fetch URL.
pub trait Gateway: Send + Sync {
    fn works_with(&self, origin: SourceOrigin) -> bool;
    fn create_url(&self, id: &str) -> String;
}

/// Gateway accepting a fixed set of origins and building URLs by prefixing a
/// base URL onto the hash.
#[derive(Debug, Clone)]
pub struct SimpleGateway {
    origins: Vec<SourceOrigin>,
    base_url: String,
}

impl SimpleGateway {
    pub fn new(origins: Vec<SourceOrigin>, base_url: impl Into<String>) -> Self {
        Self {
            origins,
            base_url: base_url.into(),
        }
    }
}

impl Gateway for SimpleGateway {
    fn works_with(&self, origin: SourceOrigin) -> bool {
        self.origins.contains(&origin)
    }

    fn create_url(&self, id: &str) -> String {
        format!("{}{}", self.base_url, id)
    }
}

/// Ordered set of registered gateways; the first gateway accepting an
/// address's origin resolves it.
pub struct GatewaySet {
    gateways: Vec<Box<dyn Gateway>>,
}

impl GatewaySet {
    /// The standard registration: an IPFS gateway with a configurable base
    /// URL, then the swarm gateway for both bzzr revisions.
    pub fn new(ipfs_url: &str) -> Self {
        Self::with_gateways(vec![
            Box::new(SimpleGateway::new(vec![SourceOrigin::Ipfs], ipfs_url)),
            Box::new(SimpleGateway::new(
                vec![SourceOrigin::Bzzr0, SourceOrigin::Bzzr1],
                SWARM_GATEWAY,
            )),
        ])
    }

    pub fn with_gateways(gateways: Vec<Box<dyn Gateway>>) -> Self {
        Self { gateways }
    }

    pub fn url_for(&self, address: &SourceAddress) -> Option<String> {
        self.gateways
            .iter()
            .find(|gateway| gateway.works_with(address.origin))
            .map(|gateway| gateway.create_url(&address.id))
    }

    pub fn supports(&self, origin: SourceOrigin) -> bool {
        self.gateways.iter().any(|gateway| gateway.works_with(origin))
    }
}

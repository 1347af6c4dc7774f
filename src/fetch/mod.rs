mod fetcher;
pub use fetcher::{
    FetchError,
    FetcherConfig,
    SourceFetcher,
};

mod gateway;
pub use gateway::{
    Gateway,
    GatewaySet,
    SimpleGateway,
    SWARM_GATEWAY,
};

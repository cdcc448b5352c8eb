pub mod config;
pub mod credentials;
pub mod error;
pub mod proxy;

pub use credentials::{CredentialMaterial, CredentialSource};
pub use error::{AcceptError, CredentialError, DirectorError, ForwardError};
pub use proxy::{
    Classification, ClassifiedStream, Classifier, ConnectionInfo, Director, ForwardingEngine,
    HttpUpstream, Listener, ListenerConfig, PeekedStream, ProxyBody, SyntheticAddress,
    TransportConfig, Upstream,
};

pub mod config;
pub mod console;
pub mod coordinator;
pub mod error;
pub mod identity;
pub mod logging;
pub mod peer;
pub mod protocol;
pub mod registry;
pub mod transport;
pub mod wire;

pub use config::Config;
pub use coordinator::{Coordinator, CoreEvent};
pub use error::{ConfigError, DecodeError, DecodeErrorKind, SendError, TransportError};
pub use identity::Identity;
pub use peer::{Direction, Peer, PeerId, TransportInfo, TransportKind};
pub use protocol::{Message, MessageKind};
pub use registry::{PeerRegistry, RegistryEvent};
pub use transport::{Transport, TransportEvent, TransportState, TransportStatus};
pub use wire::{WireFormat, WireFormatKind};

/// Run a coordinator with the console front end until the user quits.
pub async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    config.validate()?;
    let identity = Identity::generate(config.display_name.as_deref());
    tracing::info!(
        "Starting {} as {} ({} format)",
        identity.display_name,
        identity.id,
        config.format
    );

    let coordinator = Coordinator::new(config, identity);
    coordinator.start().await;
    let result = console::run(&coordinator).await;
    coordinator.shutdown().await;
    result?;
    Ok(())
}

use crate::peer::PeerId;

/// Who this process is on the network for the lifetime of the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub id: PeerId,
    pub display_name: String,
}

impl Identity {
    /// A fresh id, named after `display_name` or else the host.
    pub fn generate(display_name: Option<&str>) -> Self {
        let display_name = display_name
            .map(str::to_string)
            .unwrap_or_else(system_hostname);
        Self {
            id: PeerId::generate(),
            display_name,
        }
    }
}

pub fn system_hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "Unknown Device".to_string())
}

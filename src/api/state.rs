use crate::controller::ControllerHandle;

/// Shared state handed to every admin handler.
#[derive(Clone)]
pub struct AppState {
    pub controller: ControllerHandle,
    /// Serve `/metrics`.
    pub exporter_enabled: bool,
}

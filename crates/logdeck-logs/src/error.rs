use logdeck_types::WindowId;
use thiserror::Error;

/// Errors raised while registering or delivering to windows
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("primary window already registered as {0}")]
    PrimaryExists(WindowId),

    #[error("unknown window {0}")]
    UnknownWindow(WindowId),

    #[error("{0} is closed")]
    WindowClosed(WindowId),

    #[error("{0} is not keeping up, delivery queue full")]
    WindowBusy(WindowId),
}

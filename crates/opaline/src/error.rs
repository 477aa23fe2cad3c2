use crate::appearance::wearables::WearableType;
use crate::llsd::LlsdError;
use crate::services::ServiceError;
use circuline::CircuitError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppearanceError {
    #[error("An appearance pipeline is already running for this session")]
    PipelineBusy,
    #[error("Appearance pipeline was cancelled")]
    Cancelled,
    #[error("Replacing the outfit would leave no {0:?} worn")]
    MissingBodyPart(WearableType),
    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("Own avatar never appeared in the object set")]
    AvatarNotPresent,
    #[error("No AgentAppearanceService capability for this region")]
    NoCapability,
    #[error("Bake capability refused the request: {0}")]
    Capability(String),
    #[error("Simulator expects COF version {expected}, ours is {ours}")]
    CofVersionMismatch { expected: i32, ours: i32 },
    #[error("Failed to decode wearable asset: {0}")]
    WearableParse(String),
    #[error("HTTP transport failure: {0}")]
    Http(String),
    #[error(transparent)]
    Llsd(#[from] LlsdError),
    #[error(transparent)]
    Service(#[from] ServiceError),
    #[error(transparent)]
    Circuit(#[from] CircuitError),
}

pub type Result<T> = std::result::Result<T, AppearanceError>;

pub mod audio;
pub mod auth;
pub mod events;
pub mod message;
pub mod session;
pub mod state;

pub use audio::{AudioCaptureState, AudioFrame, Base64EncodedAudioBytes};
pub use auth::CredentialPayload;
pub use events::{ClientFrame, ServerFrame};
pub use message::{ChatMessage, MessageRole};
pub use session::{ChatSession, SessionSummary};
pub use state::{ConnectionState, ReconnectionState, TurnHolder, TurnState, TurnTransition};

//! Shared vocabulary of the unichat federation layer: data model, capability
//! model, error taxonomy, retry policy and configuration.

pub mod capability;
pub mod classify;
pub mod config;
pub mod error;
pub mod handler;
pub mod retry;
pub mod types;

pub use capability::{paths, Capabilities, CapabilityMatrix};
pub use classify::classify;
pub use config::{BackendName, ConfigError, FederationConfig};
pub use error::{
    BackendFailure, ChatError, ErrorCode, ErrorContext, FanOutFailure, Notice, Result, Severity,
};
pub use handler::{ErrorHandler, TracingErrorHandler};
pub use retry::{retry_with, RetryPolicy};
pub use types::{
    Attachment, AttachmentUpload, Channel, ChannelKind, ConnectionState, DeliveryStatus, Message,
    MessageCallback, MessageDraft, MessageType, Metadata, PresenceCallback, PresenceStatus,
    UploadedAttachment, User, DEFAULT_HISTORY_LIMIT,
};

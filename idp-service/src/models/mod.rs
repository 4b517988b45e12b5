pub mod artifact;
pub mod device;
pub mod federation;
pub mod login_attempt;
pub mod mfa_device;
pub mod oauth_client;
pub mod policy;
pub mod session;
pub mod user;

pub use device::{device_fingerprint, Device};
pub use federation::{CasService, SamlConfig};
pub use login_attempt::LoginAttempt;
pub use mfa_device::{MfaDevice, MfaMethod};
pub use oauth_client::{OAuthClient, OAuthToken};
pub use policy::{AccessContext, Condition, ConditionalAccessPolicy, PolicyActions, PolicyError};
pub use session::Session;
pub use user::{User, UserStatus, UserSummary};

//! 认证：出站令牌生命周期（client-credentials）与入站调用方身份

pub mod identity;
pub mod token;

pub use identity::{AuthError, Authenticator, Identity, StaticTokenAuthenticator};
pub use token::{ClientCredentialsExchanger, TokenExchanger, TokenGrant, TokenManager};

//! # lrsr-auth
//!
//! OAuth 2.0 / OpenID Connect broker for lrsr.
//!
//! The broker is an authorization server to downstream clients (the
//! `lrsr-cli` tool and the desktop agent) and a relying party to an upstream
//! identity provider such as Google. Downstream clients never see upstream
//! credentials: they get a code from this broker, exchange it with PKCE, and
//! receive an ES256 token signed by the broker's own key.
//!
//! ## Example
//!
//! ```rust,no_run
//! use lrsr_auth::{BrokerConfig, BrokerServer, MemoryStateStore, MemoryUserStore};
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = BrokerConfig::from_env()?;
//! let broker = BrokerServer::builder()
//!     .config(config)
//!     .state_store(Arc::new(MemoryStateStore::new()))
//!     .user_store(Arc::new(MemoryUserStore::new()))
//!     .build()?;
//!
//! let app = broker.router();
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod broker;
pub mod client;
pub mod config;
pub mod error;
pub mod memory_store;
pub mod pkce;
#[cfg(feature = "axum")]
pub mod server;
pub mod session;
pub mod store;
pub mod token;
pub mod upstream;
pub mod users;

pub use broker::{
    ApprovalRequestView, AuthorizationOrchestrator, AuthorizeParams, CallbackOutcome,
    CallbackParams, TokenRequest, TokenResponse,
};
pub use client::ClientRegistry;
pub use config::{BrokerConfig, SigningKeyConfig, UpstreamConfig};
pub use error::{Error, Result};
pub use memory_store::MemoryStateStore;
pub use pkce::{ChallengeHasher, CodeChallengeMethod, PkceVerifier, Sha256Hasher};
#[cfg(feature = "axum")]
pub use server::{BrokerServer, BrokerServerBuilder};
pub use session::SessionCookie;
pub use store::{
    AuthorizationCode, AuthorizationRequest, EphemeralStateStore, RecordKind, RefreshTokenRecord,
    StateRecord, StateStore,
};
pub use token::{LocalPrincipal, TokenClaims, TokenService};
pub use upstream::{HttpUpstream, UpstreamIdentityBroker, UpstreamProfile, UpstreamTokens};
pub use users::{LocalUser, MemoryUserStore, UserLookup, resolve_or_create};

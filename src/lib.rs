//! OAuth 2.0 token exchange service (RFC 8693).
//!
//! Clients trade a subject token for a derived token with equal or narrower
//! scope. Derived tokens form a forest rooted at externally issued tokens;
//! revoking any token revokes its whole subtree. Policy decides which
//! client may exchange whose tokens and what it may receive, defaulting to
//! deny.

pub mod chain;
pub mod clock;
pub mod coordinator;
pub mod error;
pub mod handler;
pub mod keys;
pub mod parser;
pub mod policy;
pub mod registry;
pub mod revocation;
pub mod signer;
pub mod store;

pub use chain::{ActorChainBuilder, ChainMetadata, DelegationChain};
pub use clock::{Clock, ManualClock, SystemClock};
pub use coordinator::{CoordinatorConfig, ExchangeCoordinator, ExchangePhase};
pub use error::{ChainError, ExchangeError, PolicyError, TokenError};
pub use handler::{TokenExchangeRequest, TokenExchangeResponse};
pub use keys::{KeyConfig, SigningKeys};
pub use parser::{ParsedToken, TokenParser};
pub use registry::{ClientRegistry, RegisteredClient};
pub use revocation::{RevocationPropagator, RevocationSummary};
pub use signer::TokenSigner;
pub use store::{TokenId, TokenKind, TokenRecord, TokenStore};

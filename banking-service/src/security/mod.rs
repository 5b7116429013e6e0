//! Key loading, request signing, secret encryption and OAuth state tokens.

pub mod encryption;
pub mod key_loader;
pub mod link_state;
pub mod signer;

pub use encryption::{AesGcmCipher, SecretCipher};
pub use key_loader::KeyLoader;
pub use link_state::{IssuedLinkState, LinkStateClaims, LinkStateSigner};
pub use signer::{CanonicalRequest, RequestSigner, SignedHeaders};

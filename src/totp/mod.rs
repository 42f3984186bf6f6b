//! Time-based one-time passwords: enrollment, verification and the nonce
//! that carries a half-finished password login to its second factor.

mod nonce;
mod service;

pub use nonce::NONCE_TTL_MINUTES;
pub use service::{Provisioning, SecondFactor, TotpService, check_code, code_at};

//! Passkey ceremonies over `webauthn-rs`.
//!
//! Flow overview:
//! 1) Registration begin: the username must not belong to an account yet.
//!    Options are shaped by the tenant policy and the ceremony state is
//!    stored with an expiry.
//! 2) Registration finish: the state is taken (single use), the attestation
//!    verified and the credential persisted, which creates the account.
//! 3) Authentication begin: the user's passkeys are loaded and a challenge
//!    issued; the state is stored under that challenge.
//! 4) Authentication finish: the challenge the browser signed selects the
//!    state. Counter regressions surface as clone warnings.
//!
//! Ceremony state and credentials never appear in logs.

mod ceremony;
mod policy;

pub use ceremony::{AuthenticationOutcome, CeremonyError, PasskeyService, Registered};
pub use policy::{
    Attachment, Conveyance, PasskeyPolicies, PasskeyPolicy, Requirement, SUPPORTED_ALGORITHMS,
    TenantPasskeys,
};

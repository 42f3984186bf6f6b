//! # Portier (multi-tenant request gatekeeper)
//!
//! `portier` sits in front of a tenant-aware application and decides, for
//! every request, who the caller is and which database role the request runs
//! as.
//!
//! ## Request path
//!
//! 1. The request origin selects the tenant. Unknown origins never fall
//!    through to another tenant.
//! 2. The route table, keyed by method and path template, names the chain:
//!    authenticated, unauthenticated or none, plus the roles that may enter.
//! 3. The session cookie is validated against the tenant and the endpoint.
//!    The identity found is bound to a store connection that assumes the
//!    caller's database role for the rest of the request.
//!
//! ## Credentials
//!
//! Sessions start after a password login (optionally followed by TOTP), a
//! passkey ceremony or an OIDC federated login. Only hashes of session
//! tokens and MFA nonces are stored.
//!
//! ## Store
//!
//! All state lives behind named store functions (`portier.*`) reached through
//! the [`store`] interface, with a `PostgreSQL` implementation for production
//! and an in-memory one for development and tests.

pub mod api;
pub mod cli;
pub mod error;
pub mod gate;
pub mod oidc;
pub mod password;
pub mod policy;
pub mod session;
pub mod store;
pub mod tenant;
pub mod totp;
pub mod webauthn;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};

pub const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_git_commit_hash_format() {
        if GIT_COMMIT_HASH == "unknown" {
            return;
        }
        assert!(
            GIT_COMMIT_HASH.chars().all(|c| c.is_ascii_hexdigit()),
            "GIT_COMMIT_HASH should be a hex string, got: {GIT_COMMIT_HASH}"
        );
        assert!(GIT_COMMIT_HASH.len() >= 7);
    }

    #[test]
    fn test_app_user_agent_format() {
        assert!(APP_USER_AGENT.starts_with(env!("CARGO_PKG_NAME")));
        assert!(APP_USER_AGENT.ends_with(env!("CARGO_PKG_VERSION")));
    }
}

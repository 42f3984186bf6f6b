use anyhow::{Context, Result};
use clap::{Arg, ArgMatches, Command};
use secrecy::SecretString;

pub const ARG_COOKIE_SECRET: &str = "cookie-secret";

/// Cookie secrets shorter than this are refused at boot.
const MIN_COOKIE_SECRET_LEN: usize = 32;

#[derive(Debug)]
pub struct Options {
    pub session_ttl_seconds: i64,
    pub cookie_secret: SecretString,
    pub totp_issuer: String,
    pub passkey_challenge_ttl_seconds: i64,
    pub oidc_discovery_ttl_seconds: u64,
}

impl Options {
    /// # Errors
    /// Returns an error if the cookie secret is missing or too short.
    pub fn parse(matches: &ArgMatches) -> Result<Self> {
        let cookie_secret = matches
            .get_one::<String>(ARG_COOKIE_SECRET)
            .context("missing required argument: --cookie-secret")?;
        if cookie_secret.len() < MIN_COOKIE_SECRET_LEN {
            anyhow::bail!("--{ARG_COOKIE_SECRET} must be at least {MIN_COOKIE_SECRET_LEN} bytes");
        }

        Ok(Self {
            session_ttl_seconds: matches
                .get_one::<i64>("session-ttl-seconds")
                .copied()
                .unwrap_or(86_400),
            cookie_secret: SecretString::from(cookie_secret.clone()),
            totp_issuer: matches
                .get_one::<String>("totp-issuer")
                .cloned()
                .unwrap_or_else(|| env!("CARGO_PKG_NAME").to_string()),
            passkey_challenge_ttl_seconds: matches
                .get_one::<i64>("passkey-challenge-ttl-seconds")
                .copied()
                .unwrap_or(300),
            oidc_discovery_ttl_seconds: matches
                .get_one::<u64>("oidc-discovery-ttl-seconds")
                .copied()
                .unwrap_or(3600),
        })
    }
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new("session-ttl-seconds")
                .long("session-ttl-seconds")
                .help("Session cookie TTL in seconds")
                .env("PORTIER_SESSION_TTL_SECONDS")
                .default_value("86400")
                .value_parser(clap::value_parser!(i64).range(1..)),
        )
        .arg(
            Arg::new(ARG_COOKIE_SECRET)
                .long(ARG_COOKIE_SECRET)
                .help("HMAC key signing the OIDC state and nonce cookies")
                .env("PORTIER_COOKIE_SECRET")
                .hide_env_values(true)
                .required(true),
        )
        .arg(
            Arg::new("totp-issuer")
                .long("totp-issuer")
                .help("Issuer shown by authenticator apps")
                .env("PORTIER_TOTP_ISSUER")
                .default_value("portier"),
        )
        .arg(
            Arg::new("passkey-challenge-ttl-seconds")
                .long("passkey-challenge-ttl-seconds")
                .help("Lifetime of a pending passkey ceremony unless the tenant sets one")
                .env("PORTIER_PASSKEY_CHALLENGE_TTL_SECONDS")
                .default_value("300")
                .value_parser(clap::value_parser!(i64).range(1..)),
        )
        .arg(
            Arg::new("oidc-discovery-ttl-seconds")
                .long("oidc-discovery-ttl-seconds")
                .help("How long provider discovery documents and key sets are cached")
                .env("PORTIER_OIDC_DISCOVERY_TTL_SECONDS")
                .default_value("3600")
                .value_parser(clap::value_parser!(u64)),
        )
}

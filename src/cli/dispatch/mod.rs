//! Map validated CLI arguments to the action the binary runs.

use crate::cli::actions::{Action, server::Args};
use crate::cli::commands::{ARG_DSN, ARG_MAX_CONNECTIONS, ARG_PORT, auth, gate};
use anyhow::{Context, Result};
use secrecy::SecretString;

/// # Errors
/// Returns an error if required arguments are missing or invalid.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let port = matches.get_one::<u16>(ARG_PORT).copied().unwrap_or(8080);
    let dsn = matches
        .get_one::<String>(ARG_DSN)
        .cloned()
        .context("missing required argument: --dsn")?;
    let max_connections = matches
        .get_one::<u32>(ARG_MAX_CONNECTIONS)
        .copied()
        .unwrap_or(10);

    let gate = gate::Options::parse(matches)?;
    let auth = auth::Options::parse(matches)?;

    Ok(Action::Server(Args {
        port,
        dsn: SecretString::from(dsn),
        max_connections,
        default_scheme: gate.default_scheme,
        login_path: gate.login_path,
        anonymous_role: gate.anonymous_role,
        session_ttl_seconds: auth.session_ttl_seconds,
        cookie_secret: auth.cookie_secret,
        totp_issuer: auth.totp_issuer,
        passkey_challenge_ttl_seconds: auth.passkey_challenge_ttl_seconds,
        oidc_discovery_ttl_seconds: auth.oidc_discovery_ttl_seconds,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    const DSN: &str = "postgres://portier@localhost:5432/portier";

    #[test]
    fn builds_server_action_from_env() {
        temp_env::with_vars(
            [
                ("PORTIER_DSN", Some(DSN)),
                ("PORTIER_COOKIE_SECRET", Some("0123456789abcdef0123456789abcdef")),
                ("PORTIER_ANONYMOUS_ROLE", Some("web_anon")),
                ("PORTIER_TOTP_ISSUER", Some("Acme")),
            ],
            || {
                let matches = crate::cli::commands::new().get_matches_from(vec!["portier"]);
                let result = handler(&matches);
                assert!(result.is_ok());
                if let Ok(Action::Server(args)) = result {
                    assert_eq!(args.port, 8080);
                    assert_eq!(args.dsn.expose_secret(), DSN);
                    assert_eq!(args.anonymous_role.as_str(), "web_anon");
                    assert_eq!(args.totp_issuer, "Acme");
                    assert_eq!(args.login_path, "/login");
                    assert_eq!(args.session_ttl_seconds, 86_400);
                }
            },
        );
    }

    #[test]
    fn short_cookie_secret_is_rejected() {
        temp_env::with_vars(
            [
                ("PORTIER_DSN", Some(DSN)),
                ("PORTIER_COOKIE_SECRET", Some("too-short")),
            ],
            || {
                let matches = crate::cli::commands::new().get_matches_from(vec!["portier"]);
                let result = handler(&matches);
                assert!(result.is_err());
                if let Err(err) = result {
                    assert!(err.to_string().contains("--cookie-secret"));
                }
            },
        );
    }

    #[test]
    fn invalid_anonymous_role_is_rejected() {
        temp_env::with_vars(
            [
                ("PORTIER_DSN", Some(DSN)),
                ("PORTIER_COOKIE_SECRET", Some("0123456789abcdef0123456789abcdef")),
                ("PORTIER_ANONYMOUS_ROLE", Some("web anon\"; drop")),
            ],
            || {
                let matches = crate::cli::commands::new().get_matches_from(vec!["portier"]);
                let result = handler(&matches);
                assert!(result.is_err());
                if let Err(err) = result {
                    assert!(err.to_string().contains("--anonymous-role"));
                }
            },
        );
    }
}

use crate::{api, gate::GateConfig, policy::RoleName};
use anyhow::Result;
use secrecy::SecretString;
use tracing::debug;

#[derive(Debug)]
pub struct Args {
    pub port: u16,
    pub dsn: SecretString,
    pub max_connections: u32,
    pub default_scheme: String,
    pub login_path: String,
    pub anonymous_role: RoleName,
    pub session_ttl_seconds: i64,
    pub cookie_secret: SecretString,
    pub totp_issuer: String,
    pub passkey_challenge_ttl_seconds: i64,
    pub oidc_discovery_ttl_seconds: u64,
}

impl Args {
    fn into_settings(self) -> api::Settings {
        let gate = GateConfig::new(self.anonymous_role)
            .with_default_scheme(self.default_scheme)
            .with_login_path(self.login_path);

        api::Settings {
            port: self.port,
            dsn: self.dsn,
            max_connections: self.max_connections,
            gate,
            session_ttl_seconds: self.session_ttl_seconds,
            cookie_secret: self.cookie_secret,
            totp_issuer: self.totp_issuer,
            passkey_challenge_ttl_seconds: self.passkey_challenge_ttl_seconds,
            oidc_discovery_ttl_seconds: self.oidc_discovery_ttl_seconds,
        }
    }
}

/// Execute the server action.
/// # Errors
/// Returns an error if boot fails or the server stops with an error.
pub async fn execute(args: Args) -> Result<()> {
    let settings = args.into_settings();
    debug!("Settings: {:?}", settings);
    api::new(settings).await
}

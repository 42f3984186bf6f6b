use crate::{oidc::OidcDriver, session::SessionManager, totp::TotpService, webauthn::PasskeyService};

/// Ceremony engines shared by the credential handlers.
pub struct AuthState {
    sessions: SessionManager,
    totp: TotpService,
    passkeys: PasskeyService,
    oidc: OidcDriver,
}

impl AuthState {
    #[must_use]
    pub fn new(
        sessions: SessionManager,
        totp: TotpService,
        passkeys: PasskeyService,
        oidc: OidcDriver,
    ) -> Self {
        Self {
            sessions,
            totp,
            passkeys,
            oidc,
        }
    }

    #[must_use]
    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    #[must_use]
    pub fn totp(&self) -> &TotpService {
        &self.totp
    }

    #[must_use]
    pub fn passkeys(&self) -> &PasskeyService {
        &self.passkeys
    }

    #[must_use]
    pub fn oidc(&self) -> &OidcDriver {
        &self.oidc
    }
}

use crate::policy::RoleName;
use anyhow::{Context, Result};
use clap::{Arg, ArgMatches, Command};

pub const ARG_DEFAULT_SCHEME: &str = "default-scheme";
pub const ARG_LOGIN_PATH: &str = "login-path";
pub const ARG_ANONYMOUS_ROLE: &str = "anonymous-role";

#[derive(Debug)]
pub struct Options {
    pub default_scheme: String,
    pub login_path: String,
    pub anonymous_role: RoleName,
}

impl Options {
    /// # Errors
    /// Returns an error if the anonymous role is not a valid role name or the
    /// scheme is neither `http` nor `https`.
    pub fn parse(matches: &ArgMatches) -> Result<Self> {
        let default_scheme = matches
            .get_one::<String>(ARG_DEFAULT_SCHEME)
            .map_or("https", String::as_str)
            .to_lowercase();
        if default_scheme != "https" && default_scheme != "http" {
            anyhow::bail!("invalid --{ARG_DEFAULT_SCHEME}: {default_scheme}");
        }
        let anonymous_role = matches
            .get_one::<String>(ARG_ANONYMOUS_ROLE)
            .context("missing required argument: --anonymous-role")?;

        Ok(Self {
            default_scheme,
            login_path: matches
                .get_one::<String>(ARG_LOGIN_PATH)
                .cloned()
                .unwrap_or_else(|| "/login".to_string()),
            anonymous_role: RoleName::parse(anonymous_role)
                .with_context(|| format!("invalid --{ARG_ANONYMOUS_ROLE}: {anonymous_role}"))?,
        })
    }
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_DEFAULT_SCHEME)
                .long(ARG_DEFAULT_SCHEME)
                .help("Scheme assumed when neither Origin nor X-Forwarded-Proto is sent")
                .env("PORTIER_DEFAULT_SCHEME")
                .default_value("https"),
        )
        .arg(
            Arg::new(ARG_LOGIN_PATH)
                .long(ARG_LOGIN_PATH)
                .help("Where callers without a session are sent")
                .env("PORTIER_LOGIN_PATH")
                .default_value("/login"),
        )
        .arg(
            Arg::new(ARG_ANONYMOUS_ROLE)
                .long(ARG_ANONYMOUS_ROLE)
                .help("Database role assumed for requests without a session")
                .env("PORTIER_ANONYMOUS_ROLE")
                .default_value("portier_anonymous"),
        )
}

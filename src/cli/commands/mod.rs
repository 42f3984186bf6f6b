pub mod auth;
pub mod gate;
pub mod logging;

use clap::{
    Arg, ColorChoice, Command,
    builder::styling::{AnsiColor, Effects, Styles},
};

pub const ARG_PORT: &str = "port";
pub const ARG_DSN: &str = "dsn";
pub const ARG_MAX_CONNECTIONS: &str = "max-connections";

#[must_use]
pub fn new() -> Command {
    let styles = Styles::styled()
        .header(AnsiColor::Yellow.on_default() | Effects::BOLD)
        .usage(AnsiColor::Green.on_default() | Effects::BOLD)
        .literal(AnsiColor::Blue.on_default() | Effects::BOLD)
        .placeholder(AnsiColor::Green.on_default());

    let long_version: &'static str = Box::leak(
        format!("{} - {}", env!("CARGO_PKG_VERSION"), crate::GIT_COMMIT_HASH).into_boxed_str(),
    );

    let command = Command::new("portier")
        .about("Multi-tenant request gatekeeper")
        .version(env!("CARGO_PKG_VERSION"))
        .long_version(long_version)
        .color(ColorChoice::Auto)
        .styles(styles)
        .arg(
            Arg::new(ARG_PORT)
                .short('p')
                .long(ARG_PORT)
                .help("Port to listen on")
                .default_value("8080")
                .env("PORTIER_PORT")
                .value_parser(clap::value_parser!(u16)),
        )
        .arg(
            Arg::new(ARG_DSN)
                .short('d')
                .long(ARG_DSN)
                .help("Database connection string")
                .env("PORTIER_DSN")
                .hide_env_values(true)
                .required(true),
        )
        .arg(
            Arg::new(ARG_MAX_CONNECTIONS)
                .long(ARG_MAX_CONNECTIONS)
                .help("Maximum number of pooled database connections")
                .env("PORTIER_MAX_CONNECTIONS")
                .default_value("10")
                .value_parser(clap::value_parser!(u32).range(1..)),
        );

    let command = gate::with_args(command);
    let command = auth::with_args(command);
    logging::with_args(command)
}

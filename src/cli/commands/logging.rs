use clap::{Arg, ArgAction, Command, builder::ValueParser};

pub const ARG_VERBOSITY: &str = "verbosity";

/// Level names accepted through `PORTIER_LOG_LEVEL`, by verbosity count.
const LEVEL_NAMES: [&str; 5] = ["error", "warn", "info", "debug", "trace"];

/// Accept a count (`0`..`5`) or a level name.
#[must_use]
pub fn validator_log_level() -> ValueParser {
    ValueParser::from(|level: &str| -> Result<u8, String> {
        if let Ok(count) = level.parse::<u8>() {
            return if count <= 5 {
                Ok(count)
            } else {
                Err(format!("verbosity {count} is out of range (0-5)"))
            };
        }
        LEVEL_NAMES
            .iter()
            .position(|name| name.eq_ignore_ascii_case(level.trim()))
            .and_then(|index| u8::try_from(index).ok())
            .ok_or_else(|| format!("unknown log level: {level}"))
    })
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command.arg(
        Arg::new(ARG_VERBOSITY)
            .short('v')
            .long("verbose")
            .help("Increase log verbosity; repeat for more (-vvv is DEBUG)")
            .env("PORTIER_LOG_LEVEL")
            .global(true)
            .action(ArgAction::Count)
            .value_parser(validator_log_level()),
    )
}

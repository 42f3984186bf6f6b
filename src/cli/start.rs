use crate::cli::{actions::Action, commands, dispatch, telemetry};
use anyhow::Result;
use tracing::Level;

/// Levels selected by `-v`, `-vv`, ... Without any flag only the filter
/// defaults apply.
const LEVELS: [Level; 4] = [Level::WARN, Level::INFO, Level::DEBUG, Level::TRACE];

fn level_for(verbosity: u8) -> Option<Level> {
    let index = usize::from(verbosity.checked_sub(1)?);
    Some(LEVELS[index.min(LEVELS.len() - 1)])
}

/// Parse arguments, install the subscriber and return the action to run.
///
/// # Errors
/// Returns an error if telemetry cannot be installed or the arguments do not
/// form a valid configuration.
pub fn start() -> Result<Action> {
    let matches = commands::new().get_matches();
    let verbosity = matches
        .get_one::<u8>(commands::logging::ARG_VERBOSITY)
        .copied()
        .unwrap_or_default();

    telemetry::init(level_for(verbosity))?;
    dispatch::handler(&matches)
}

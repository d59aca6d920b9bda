use clap::{Arg, Command, builder::ValueParser};

pub const ARG_VERBOSITY: &str = "verbosity";

/// Accepts a count (`0`..=`5`) or a level name; names map one below the
/// `-v` count so `info` equals `-vv`.
#[must_use]
pub fn validator_log_level() -> ValueParser {
    ValueParser::from(move |level: &str| -> std::result::Result<u8, String> {
        if let Ok(parsed) = level.parse::<u8>() {
            if parsed <= 5 {
                return Ok(parsed);
            }
        }

        match level.to_lowercase().as_str() {
            "error" => Ok(0),
            "warn" => Ok(1),
            "info" => Ok(2),
            "debug" => Ok(3),
            "trace" => Ok(4),
            _ => Err("invalid log level".to_string()),
        }
    })
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command.arg(
        Arg::new(ARG_VERBOSITY)
            .short('v')
            .long("verbose")
            .help("Verbosity level: ERROR, WARN, INFO, DEBUG, TRACE (default: ERROR)")
            .env("AUTHFLOW_LOG_LEVEL")
            .global(true)
            .action(clap::ArgAction::Count)
            .value_parser(validator_log_level()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_is_a_global_count() {
        let command = with_args(Command::new("authflow"));
        let arg = command
            .get_arguments()
            .find(|arg| arg.get_id() == ARG_VERBOSITY);
        assert!(arg.is_some_and(Arg::is_global_set));

        let matches = with_args(Command::new("authflow")).get_matches_from(vec!["authflow", "-vvv"]);
        assert_eq!(matches.get_one::<u8>(ARG_VERBOSITY).copied(), Some(3));
    }
}

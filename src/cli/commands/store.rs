use clap::{Arg, ArgMatches, Command};
use secrecy::SecretString;
use std::time::Duration;

pub const ARG_DSN: &str = "dsn";
pub const ARG_FLOW_TTL_SECONDS: &str = "flow-ttl-seconds";
pub const ARG_FLOW_MAX_LIFETIME_SECONDS: &str = "flow-max-lifetime-seconds";

#[derive(Debug)]
pub struct Options {
    /// `None` selects the in-memory store.
    pub dsn: Option<SecretString>,
    pub ttl: Duration,
    pub max_lifetime: Duration,
}

impl Options {
    /// Parse store arguments from matches.
    ///
    /// # Errors
    /// Returns an error if the TTL exceeds the maximum lifetime.
    pub fn parse(matches: &ArgMatches) -> anyhow::Result<Self> {
        let dsn = matches
            .get_one::<String>(ARG_DSN)
            .map(|dsn| dsn.trim().to_string())
            .filter(|dsn| !dsn.is_empty())
            .map(SecretString::from);
        let seconds = |id: &str| matches.get_one::<u64>(id).copied().unwrap_or_default();
        let ttl = seconds(ARG_FLOW_TTL_SECONDS);
        let max_lifetime = seconds(ARG_FLOW_MAX_LIFETIME_SECONDS);
        if ttl == 0 || ttl > max_lifetime {
            anyhow::bail!(
                "--{ARG_FLOW_TTL_SECONDS} must be between 1 and --{ARG_FLOW_MAX_LIFETIME_SECONDS}"
            );
        }
        Ok(Self {
            dsn,
            ttl: Duration::from_secs(ttl),
            max_lifetime: Duration::from_secs(max_lifetime),
        })
    }
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_DSN)
                .short('d')
                .long(ARG_DSN)
                .help("Postgres connection string; flows are kept in memory when absent")
                .env("AUTHFLOW_DSN"),
        )
        .arg(
            Arg::new(ARG_FLOW_TTL_SECONDS)
                .long(ARG_FLOW_TTL_SECONDS)
                .help("Idle time after which an untouched flow expires")
                .env("AUTHFLOW_FLOW_TTL_SECONDS")
                .default_value("1200")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new(ARG_FLOW_MAX_LIFETIME_SECONDS)
                .long(ARG_FLOW_MAX_LIFETIME_SECONDS)
                .help("Hard limit on the lifetime of a flow, regardless of activity")
                .env("AUTHFLOW_FLOW_MAX_LIFETIME_SECONDS")
                .default_value("7200")
                .value_parser(clap::value_parser!(u64)),
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    fn parse(args: &[&str]) -> anyhow::Result<Options> {
        let mut argv = vec!["authflow"];
        argv.extend_from_slice(args);
        let matches = with_args(Command::new("authflow")).try_get_matches_from(argv)?;
        Options::parse(&matches)
    }

    #[test]
    fn defaults_to_memory_store() -> anyhow::Result<()> {
        temp_env::with_var("AUTHFLOW_DSN", None::<&str>, || {
            let options = parse(&[])?;
            assert!(options.dsn.is_none());
            assert_eq!(options.ttl, Duration::from_secs(1200));
            assert_eq!(options.max_lifetime, Duration::from_secs(7200));
            Ok(())
        })
    }

    #[test]
    fn dsn_from_env() -> anyhow::Result<()> {
        temp_env::with_var(
            "AUTHFLOW_DSN",
            Some("postgres://authflow@localhost:5432/authflow"),
            || {
                let options = parse(&[])?;
                assert_eq!(
                    options.dsn.as_ref().map(ExposeSecret::expose_secret),
                    Some("postgres://authflow@localhost:5432/authflow")
                );
                Ok(())
            },
        )
    }

    #[test]
    fn ttl_cannot_exceed_lifetime() {
        temp_env::with_var("AUTHFLOW_DSN", None::<&str>, || {
            assert!(parse(&["--flow-ttl-seconds", "600", "--flow-max-lifetime-seconds", "60"]).is_err());
        });
    }
}

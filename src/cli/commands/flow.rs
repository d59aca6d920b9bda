use clap::{Arg, ArgAction, ArgMatches, Command};
use url::Url;

pub const ARG_FLOW_CONFIG: &str = "flow-config";
pub const ARG_BIND_USER_AGENT: &str = "bind-user-agent";
pub const ARG_PUBLIC_ORIGIN: &str = "public-origin";
pub const ARG_PASSWORD_MIN_LENGTH: &str = "password-min-length";
pub const ARG_DEFAULT_REDIRECT_URI: &str = "default-redirect-uri";

#[derive(Debug)]
pub struct Options {
    /// JSON file with flow definitions; the built-in flows when absent.
    pub config_path: Option<String>,
    pub bind_user_agent: bool,
    /// Cookies are marked `Secure` when the origin is served over HTTPS.
    pub cookie_secure: bool,
    pub password_min_length: usize,
    pub default_redirect_uri: String,
}

impl Options {
    /// Parse flow arguments from matches.
    ///
    /// # Errors
    /// Returns an error if the public origin is not a valid URL.
    pub fn parse(matches: &ArgMatches) -> anyhow::Result<Self> {
        let get_non_empty = |id: &str| {
            matches
                .get_one::<String>(id)
                .cloned()
                .filter(|v| !v.trim().is_empty())
        };

        let cookie_secure = match get_non_empty(ARG_PUBLIC_ORIGIN) {
            Some(origin) => {
                let url = Url::parse(&origin).map_err(|err| {
                    anyhow::anyhow!("invalid --{ARG_PUBLIC_ORIGIN} `{origin}`: {err}")
                })?;
                url.scheme() == "https"
            }
            None => false,
        };

        Ok(Self {
            config_path: get_non_empty(ARG_FLOW_CONFIG),
            bind_user_agent: matches.get_flag(ARG_BIND_USER_AGENT),
            cookie_secure,
            password_min_length: matches
                .get_one::<usize>(ARG_PASSWORD_MIN_LENGTH)
                .copied()
                .unwrap_or(1),
            default_redirect_uri: get_non_empty(ARG_DEFAULT_REDIRECT_URI).unwrap_or_default(),
        })
    }
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_FLOW_CONFIG)
                .short('c')
                .long(ARG_FLOW_CONFIG)
                .help("Path to a JSON file with flow definitions")
                .env("AUTHFLOW_FLOW_CONFIG"),
        )
        .arg(
            Arg::new(ARG_BIND_USER_AGENT)
                .long(ARG_BIND_USER_AGENT)
                .help("Only the browser that created a flow may read or advance it")
                .env("AUTHFLOW_BIND_USER_AGENT")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new(ARG_PUBLIC_ORIGIN)
                .long(ARG_PUBLIC_ORIGIN)
                .help("Origin the API is served from, e.g. https://auth.permesi.dev")
                .env("AUTHFLOW_PUBLIC_ORIGIN"),
        )
        .arg(
            Arg::new(ARG_PASSWORD_MIN_LENGTH)
                .long(ARG_PASSWORD_MIN_LENGTH)
                .help("Minimum length of new passwords")
                .env("AUTHFLOW_PASSWORD_MIN_LENGTH")
                .default_value("1")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new(ARG_DEFAULT_REDIRECT_URI)
                .long(ARG_DEFAULT_REDIRECT_URI)
                .help("Redirect reported by finished flows that carry no redirect_uri")
                .env("AUTHFLOW_DEFAULT_REDIRECT_URI"),
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matches(args: &[&str]) -> ArgMatches {
        let mut argv = vec!["authflow"];
        argv.extend_from_slice(args);
        with_args(Command::new("authflow")).get_matches_from(argv)
    }

    #[test]
    fn https_origin_marks_cookies_secure() -> anyhow::Result<()> {
        temp_env::with_vars(
            [
                ("AUTHFLOW_PUBLIC_ORIGIN", Some("https://auth.permesi.dev")),
                ("AUTHFLOW_BIND_USER_AGENT", Some("true")),
            ],
            || {
                let options = Options::parse(&matches(&[]))?;
                assert!(options.cookie_secure);
                assert!(options.bind_user_agent);
                assert!(options.config_path.is_none());
                Ok(())
            },
        )
    }

    #[test]
    fn invalid_origin_is_rejected() {
        temp_env::with_var("AUTHFLOW_PUBLIC_ORIGIN", Some("not a url"), || {
            assert!(Options::parse(&matches(&[])).is_err());
        });
    }

    #[test]
    fn defaults() -> anyhow::Result<()> {
        temp_env::with_vars(
            [
                ("AUTHFLOW_PUBLIC_ORIGIN", None::<&str>),
                ("AUTHFLOW_BIND_USER_AGENT", None),
                ("AUTHFLOW_PASSWORD_MIN_LENGTH", None),
            ],
            || {
                let options = Options::parse(&matches(&[]))?;
                assert!(!options.cookie_secure);
                assert!(!options.bind_user_agent);
                assert_eq!(options.password_min_length, 1);
                Ok(())
            },
        )
    }
}

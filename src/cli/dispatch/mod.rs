//! Map parsed arguments to the action to run.

use crate::cli::actions::{Action, server::Args};
use crate::cli::commands::{self, flow, otp, store};
use anyhow::Result;

/// Map validated CLI matches to a server action.
///
/// # Errors
/// Returns an error if arguments are inconsistent.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let port = matches
        .get_one::<u16>(commands::ARG_PORT)
        .copied()
        .unwrap_or(8080);

    let store_opts = store::Options::parse(matches)?;
    let flow_opts = flow::Options::parse(matches)?;
    let otp_opts = otp::Options::parse(matches)?;

    Ok(Action::Server(Args {
        port,
        dsn: store_opts.dsn,
        flow_ttl: store_opts.ttl,
        flow_max_lifetime: store_opts.max_lifetime,
        flow_config_path: flow_opts.config_path,
        bind_user_agent: flow_opts.bind_user_agent,
        cookie_secure: flow_opts.cookie_secure,
        password_min_length: flow_opts.password_min_length,
        default_redirect_uri: flow_opts.default_redirect_uri,
        otp: otp_opts.config(),
    }))
}

pub mod flow;
pub mod logging;
pub mod otp;
pub mod store;

use clap::{
    Arg, ColorChoice, Command,
    builder::styling::{AnsiColor, Effects, Styles},
};

pub const ARG_PORT: &str = "port";

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

    let command = Command::new("authflow")
        .about("Authentication flows: signup, login and account recovery")
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
                .env("AUTHFLOW_PORT")
                .value_parser(clap::value_parser!(u16)),
        );

    let command = store::with_args(command);
    let command = flow::with_args(command);
    let command = otp::with_args(command);
    logging::with_args(command)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new() {
        let command = new();

        assert_eq!(command.get_name(), "authflow");
        assert_eq!(
            command.get_version().map(ToString::to_string),
            Some(env!("CARGO_PKG_VERSION").to_string())
        );
        command.debug_assert();
    }

    #[test]
    fn port_from_flag() {
        temp_env::with_var("AUTHFLOW_PORT", None::<&str>, || {
            let matches = new().get_matches_from(vec!["authflow", "--port", "9090"]);
            assert_eq!(matches.get_one::<u16>(ARG_PORT).copied(), Some(9090));
        });
    }
}

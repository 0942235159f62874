//! Command-line argument parsing for the broker.

use std::{fmt, net::SocketAddr};

/// The default address of the command interface.
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:4646";

/// Gets a small string with this program's name and version.
pub fn get_version_string() -> String {
    format!(
        concat!(env!("CARGO_PKG_NAME"), " ", env!("CARGO_PKG_VERSION"), " ({} {})"),
        std::env::consts::OS,
        std::env::consts::ARCH
    )
}

pub fn get_help_string() -> &'static str {
    concat!(
        "Usage: thlink-broker [options...]\n",
        "Options:\n",
        "  -s, --listen <host:port>   Address of the TCP command interface (default 0.0.0.0:4646)\n",
        "  -u, --upper <host:port>    Upstream broker to join a federation through\n",
        "  -d, --debug                Enable debug logging\n",
        "  -h, --help                 Display this help menu and exit\n",
        "  -V, --version              Display version information and exit",
    )
}

/// The result of parsing the program's arguments.
#[derive(Debug, PartialEq)]
pub enum ArgumentsRequest {
    Help,
    Version,
    Run(StartupArguments),
}

/// Specifies the information on how the broker should run.
#[derive(Debug, PartialEq)]
pub struct StartupArguments {
    /// Address of the TCP command interface.
    pub listen_addr: SocketAddr,

    /// Optional upstream broker to announce to.
    pub upper_addr: Option<String>,

    /// Whether to log at debug level.
    pub debug: bool,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ArgumentsError {
    UnknownArgument(String),
    MissingValue(String),
    InvalidListenAddress(String),
    InvalidUpperAddress(String),
}

impl fmt::Display for ArgumentsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownArgument(arg) => write!(f, "Unknown argument: {arg}"),
            Self::MissingValue(arg) => write!(f, "Expected a value after {arg}"),
            Self::InvalidListenAddress(value) => write!(f, "Invalid listen address: {value}"),
            Self::InvalidUpperAddress(value) => write!(f, "Invalid upper broker address: {value}"),
        }
    }
}

impl std::error::Error for ArgumentsError {}

/// Checks that an address is `host:port` with a nonzero port. The host part
/// may be a name, so only the shape is validated here.
pub(crate) fn is_valid_host_port(value: &str) -> bool {
    match value.rsplit_once(':') {
        Some((host, port)) => !host.is_empty() && port.parse::<u16>().map(|p| p != 0).unwrap_or(false),
        None => false,
    }
}

pub fn parse_arguments<T: Iterator<Item = String>>(mut args: T) -> Result<ArgumentsRequest, ArgumentsError> {
    let mut listen_addr = None;
    let mut upper_addr = None;
    let mut debug = false;

    // skip the program name
    args.next();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-h" | "--help" => return Ok(ArgumentsRequest::Help),
            "-V" | "--version" => return Ok(ArgumentsRequest::Version),
            "-d" | "--debug" => debug = true,
            "-s" | "--listen" => {
                let value = args.next().ok_or(ArgumentsError::MissingValue(arg))?;
                match value.parse::<SocketAddr>() {
                    Ok(addr) => listen_addr = Some(addr),
                    Err(_) => return Err(ArgumentsError::InvalidListenAddress(value)),
                }
            }
            "-u" | "--upper" => {
                let value = args.next().ok_or(ArgumentsError::MissingValue(arg))?;
                if !is_valid_host_port(&value) {
                    return Err(ArgumentsError::InvalidUpperAddress(value));
                }
                upper_addr = Some(value);
            }
            _ => return Err(ArgumentsError::UnknownArgument(arg)),
        }
    }

    let listen_addr = match listen_addr {
        Some(addr) => addr,
        None => DEFAULT_LISTEN_ADDR.parse().unwrap(),
    };

    Ok(ArgumentsRequest::Run(StartupArguments {
        listen_addr,
        upper_addr,
        debug,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> impl Iterator<Item = String> {
        std::iter::once("thlink-broker".to_string()).chain(list.iter().map(|s| s.to_string())).collect::<Vec<_>>().into_iter()
    }

    #[test]
    fn defaults() {
        let parsed = parse_arguments(args(&[])).unwrap();
        assert_eq!(
            parsed,
            ArgumentsRequest::Run(StartupArguments {
                listen_addr: DEFAULT_LISTEN_ADDR.parse().unwrap(),
                upper_addr: None,
                debug: false,
            })
        );
    }

    #[test]
    fn full_invocation() {
        let parsed = parse_arguments(args(&["-s", "127.0.0.1:5000", "--upper", "broker.example.net:4646", "-d"])).unwrap();
        assert_eq!(
            parsed,
            ArgumentsRequest::Run(StartupArguments {
                listen_addr: "127.0.0.1:5000".parse().unwrap(),
                upper_addr: Some("broker.example.net:4646".to_string()),
                debug: true,
            })
        );
    }

    #[test]
    fn help_and_version_win() {
        assert_eq!(parse_arguments(args(&["--help"])).unwrap(), ArgumentsRequest::Help);
        assert_eq!(parse_arguments(args(&["-s", "bad", "-V"])), Err(ArgumentsError::InvalidListenAddress("bad".to_string())));
        assert_eq!(parse_arguments(args(&["-V"])).unwrap(), ArgumentsRequest::Version);
    }

    #[test]
    fn rejects_malformed_input() {
        assert_eq!(
            parse_arguments(args(&["--listen"])),
            Err(ArgumentsError::MissingValue("--listen".to_string()))
        );
        assert_eq!(
            parse_arguments(args(&["--upper", "no-port"])),
            Err(ArgumentsError::InvalidUpperAddress("no-port".to_string()))
        );
        assert_eq!(
            parse_arguments(args(&["--upper", "host:0"])),
            Err(ArgumentsError::InvalidUpperAddress("host:0".to_string()))
        );
        assert_eq!(
            parse_arguments(args(&["--frobnicate"])),
            Err(ArgumentsError::UnknownArgument("--frobnicate".to_string()))
        );
    }
}

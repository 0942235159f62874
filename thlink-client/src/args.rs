//! Command-line argument parsing for the client.

use std::fmt;

use thlink_proto::command::StreamProtocol;

pub const DEFAULT_LOCAL_PORT: u16 = 10080;
pub const DEFAULT_SERVER: &str = "thlink.inuyasha.love:4646";

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
        "Usage: thlink-client [options...]\n",
        "Options:\n",
        "  -p, --local-port <port>    Local UDP port the exposed service listens on (default 10080)\n",
        "  -s, --server <host:port>   Broker to connect through (default thlink.inuyasha.love:4646)\n",
        "  -t, --tunnel-type <type>   Stream protocol of the tunnel, tcp or quic (default tcp)\n",
        "  -a, --auto-select          Survey the federation and pick the lowest-latency broker\n",
        "  -P, --plugin <n>           Packet plugin to load, 0 for none (default 0)\n",
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

/// Specifies the information on how the client should run.
#[derive(Debug, PartialEq)]
pub struct StartupArguments {
    /// Port of the local service to expose.
    pub local_port: u16,

    /// Broker address, `host:port`.
    pub server: String,

    /// Stream protocol of the tunnel.
    pub stream_protocol: StreamProtocol,

    /// Whether to survey the federation and pick the closest broker.
    pub auto_select: bool,

    /// Plugin number, 0 for none.
    pub plugin: u32,

    /// Whether to log at debug level.
    pub debug: bool,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ArgumentsError {
    UnknownArgument(String),
    MissingValue(String),
    InvalidLocalPort(String),
    InvalidServerAddress(String),
    InvalidTunnelType(String),
    InvalidPlugin(String),
}

impl fmt::Display for ArgumentsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownArgument(arg) => write!(f, "Unknown argument: {arg}"),
            Self::MissingValue(arg) => write!(f, "Expected a value after {arg}"),
            Self::InvalidLocalPort(value) => write!(f, "Invalid local port: {value}"),
            Self::InvalidServerAddress(value) => write!(f, "Invalid server address: {value}"),
            Self::InvalidTunnelType(value) => write!(f, "Invalid tunnel type: {value} (expected tcp or quic)"),
            Self::InvalidPlugin(value) => write!(f, "Invalid plugin number: {value}"),
        }
    }
}

impl std::error::Error for ArgumentsError {}

fn is_valid_host_port(value: &str) -> bool {
    match value.rsplit_once(':') {
        Some((host, port)) => !host.is_empty() && port.parse::<u16>().map(|p| p != 0).unwrap_or(false),
        None => false,
    }
}

pub fn parse_arguments<T: Iterator<Item = String>>(mut args: T) -> Result<ArgumentsRequest, ArgumentsError> {
    let mut local_port = DEFAULT_LOCAL_PORT;
    let mut server = DEFAULT_SERVER.to_string();
    let mut stream_protocol = StreamProtocol::Tcp;
    let mut auto_select = false;
    let mut plugin = 0;
    let mut debug = false;

    // skip the program name
    args.next();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-h" | "--help" => return Ok(ArgumentsRequest::Help),
            "-V" | "--version" => return Ok(ArgumentsRequest::Version),
            "-d" | "--debug" => debug = true,
            "-a" | "--auto-select" => auto_select = true,
            "-p" | "--local-port" => {
                let value = args.next().ok_or(ArgumentsError::MissingValue(arg))?;
                match value.parse::<u16>() {
                    Ok(port) if port != 0 => local_port = port,
                    _ => return Err(ArgumentsError::InvalidLocalPort(value)),
                }
            }
            "-s" | "--server" => {
                let value = args.next().ok_or(ArgumentsError::MissingValue(arg))?;
                if !is_valid_host_port(&value) {
                    return Err(ArgumentsError::InvalidServerAddress(value));
                }
                server = value;
            }
            "-t" | "--tunnel-type" => {
                let value = args.next().ok_or(ArgumentsError::MissingValue(arg))?;
                stream_protocol = match value.to_lowercase().as_str() {
                    "tcp" => StreamProtocol::Tcp,
                    "quic" => StreamProtocol::Quic,
                    _ => return Err(ArgumentsError::InvalidTunnelType(value)),
                };
            }
            "-P" | "--plugin" => {
                let value = args.next().ok_or(ArgumentsError::MissingValue(arg))?;
                match value.parse::<u32>() {
                    Ok(number) => plugin = number,
                    Err(_) => return Err(ArgumentsError::InvalidPlugin(value)),
                }
            }
            _ => return Err(ArgumentsError::UnknownArgument(arg)),
        }
    }

    Ok(ArgumentsRequest::Run(StartupArguments {
        local_port,
        server,
        stream_protocol,
        auto_select,
        plugin,
        debug,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> impl Iterator<Item = String> {
        std::iter::once("thlink-client".to_string()).chain(list.iter().map(|s| s.to_string())).collect::<Vec<_>>().into_iter()
    }

    #[test]
    fn defaults() {
        let parsed = parse_arguments(args(&[])).unwrap();
        assert_eq!(
            parsed,
            ArgumentsRequest::Run(StartupArguments {
                local_port: DEFAULT_LOCAL_PORT,
                server: DEFAULT_SERVER.to_string(),
                stream_protocol: StreamProtocol::Tcp,
                auto_select: false,
                plugin: 0,
                debug: false,
            })
        );
    }

    #[test]
    fn full_invocation() {
        let parsed = parse_arguments(args(&[
            "-p", "17723", "--server", "broker.example.net:4646", "-t", "quic", "--auto-select", "-P", "1", "-d",
        ]))
        .unwrap();
        assert_eq!(
            parsed,
            ArgumentsRequest::Run(StartupArguments {
                local_port: 17723,
                server: "broker.example.net:4646".to_string(),
                stream_protocol: StreamProtocol::Quic,
                auto_select: true,
                plugin: 1,
                debug: true,
            })
        );
    }

    #[test]
    fn tunnel_type_is_case_insensitive() {
        let parsed = parse_arguments(args(&["-t", "QUIC"])).unwrap();
        match parsed {
            ArgumentsRequest::Run(startup) => assert_eq!(startup.stream_protocol, StreamProtocol::Quic),
            other => panic!("unexpected parse result: {other:?}"),
        }
    }

    #[test]
    fn rejects_malformed_input() {
        assert_eq!(
            parse_arguments(args(&["-p", "0"])),
            Err(ArgumentsError::InvalidLocalPort("0".to_string()))
        );
        assert_eq!(
            parse_arguments(args(&["-p", "70000"])),
            Err(ArgumentsError::InvalidLocalPort("70000".to_string()))
        );
        assert_eq!(
            parse_arguments(args(&["-s", "nohost"])),
            Err(ArgumentsError::InvalidServerAddress("nohost".to_string()))
        );
        assert_eq!(
            parse_arguments(args(&["-t", "udp"])),
            Err(ArgumentsError::InvalidTunnelType("udp".to_string()))
        );
        assert_eq!(
            parse_arguments(args(&["--plugin", "x"])),
            Err(ArgumentsError::InvalidPlugin("x".to_string()))
        );
    }
}

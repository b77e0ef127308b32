use std::{net::SocketAddr, path::PathBuf};

use clap::Parser;
use levias_token::DEFAULT_TOKEN_PATH;

pub const DEFAULT_UPSTREAM_URL: &str = "http://levias.default.svc.cluster.local";
/// First docker argument that switches the launcher into proxy-only mode.
pub const DAEMON_SUBCOMMAND: &str = "levias-daemon";

#[derive(Parser, Debug, Clone, PartialEq, Eq)]
#[command(
    name = "levias",
    version,
    about = "Run docker against the levias engine bridge using this pod's credential"
)]
pub struct Cli {
    /// Engine bridge URL requests are forwarded to.
    #[arg(long, env = "LEVIAS_URL", default_value = DEFAULT_UPSTREAM_URL)]
    pub url: String,

    /// File holding the bearer credential; re-read for every request.
    #[arg(long, env = "LEVIAS_TOKEN_PATH", default_value = DEFAULT_TOKEN_PATH)]
    pub token_path: PathBuf,

    #[arg(long, env = "LEVIAS_DOCKER_BIN", default_value = "docker")]
    pub docker_bin: String,

    /// Loopback address for the local engine endpoint.
    #[arg(long, default_value = "127.0.0.1:0")]
    pub listen: SocketAddr,

    /// Serve the local endpoint in the foreground instead of running docker.
    #[arg(long)]
    pub daemon: bool,

    /// Arguments passed to docker unchanged.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub docker_args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    Daemon,
    Docker(Vec<String>),
}

impl Cli {
    #[must_use]
    pub fn mode(&self) -> Mode {
        if self.daemon || self.docker_args.first().map(String::as_str) == Some(DAEMON_SUBCOMMAND) {
            Mode::Daemon
        } else {
            Mode::Docker(self.docker_args.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use clap::Parser;

    use super::{Cli, DEFAULT_UPSTREAM_URL, Mode};

    fn parse(args: &[&str]) -> Result<Cli, clap::Error> {
        Cli::try_parse_from(std::iter::once("levias").chain(args.iter().copied()))
    }

    #[test]
    fn docker_arguments_are_passed_through() -> Result<(), clap::Error> {
        let cli = parse(&["run", "--rm", "-it", "alpine", "echo", "hi"])?;
        assert_eq!(cli.url, DEFAULT_UPSTREAM_URL);
        assert_eq!(cli.docker_bin, "docker");
        assert_eq!(
            cli.mode(),
            Mode::Docker(
                ["run", "--rm", "-it", "alpine", "echo", "hi"]
                    .map(String::from)
                    .to_vec()
            )
        );
        Ok(())
    }

    #[test]
    fn own_flags_come_before_docker_arguments() -> Result<(), clap::Error> {
        let cli = parse(&[
            "--url",
            "http://bridge:8080",
            "--token-path",
            "/tmp/token",
            "ps",
            "-a",
        ])?;
        assert_eq!(cli.url, "http://bridge:8080");
        assert_eq!(cli.token_path, PathBuf::from("/tmp/token"));
        assert_eq!(cli.mode(), Mode::Docker(vec!["ps".to_string(), "-a".to_string()]));
        Ok(())
    }

    #[test]
    fn daemon_mode_by_flag_or_subcommand() -> Result<(), clap::Error> {
        assert_eq!(parse(&["--daemon"])?.mode(), Mode::Daemon);
        assert_eq!(parse(&["levias-daemon"])?.mode(), Mode::Daemon);
        assert_eq!(parse(&[])?.mode(), Mode::Docker(Vec::new()));
        Ok(())
    }
}

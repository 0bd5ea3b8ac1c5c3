use clap::Parser;
use std::path::PathBuf;

/// vterm - run a command on a virtual terminal
///
/// The command runs attached to a pseudo-terminal (a winpty console on
/// Windows). Its output is copied to stdout byte for byte, stdin is
/// forwarded to it, and resizes of the surrounding terminal are relayed.
#[derive(Parser, Debug)]
#[command(
    name = "vterm",
    version,
    about = "Run a command on a virtual terminal",
    long_about = "Run a command attached to a pseudo-terminal and relay its raw output.\n\
                  Escape sequences are passed through untouched. The exit status of the\n\
                  command becomes the exit status of vterm (128 + signal when killed)."
)]
pub struct Cli {
    /// Terminal width in columns (default: current terminal, else 80)
    #[arg(short = 'c', long = "cols", value_name = "cols")]
    pub cols: Option<u16>,

    /// Terminal height in rows (default: current terminal, else 24)
    #[arg(short = 'r', long = "rows", value_name = "rows")]
    pub rows: Option<u16>,

    /// Working directory for the command
    #[arg(short = 'C', long = "cwd", value_name = "dir")]
    pub cwd: Option<PathBuf>,

    /// Extra environment entry, may be repeated
    #[arg(short = 'e', long = "env", value_name = "KEY=VALUE")]
    pub env: Vec<String>,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Command and its arguments to execute
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Cli::parse()
    }

    /// Validate the parsed arguments
    pub fn validate(&self) -> Result<(), vterm::Error> {
        use vterm::Error;

        if self.command.is_empty() {
            return Err(Error::InvalidArguments("No command specified".to_string()));
        }

        if self.cols == Some(0) || self.rows == Some(0) {
            return Err(Error::InvalidSize {
                cols: self.cols.unwrap_or(0),
                rows: self.rows.unwrap_or(0),
            });
        }

        if let Some(entry) = self.env.iter().find(|entry| !valid_env_entry(entry)) {
            return Err(Error::InvalidEnv(entry.clone()));
        }

        if let Some(ref dir) = self.cwd {
            if !dir.is_dir() {
                return Err(Error::InvalidArguments(format!(
                    "Not a directory: {}",
                    dir.display()
                )));
            }
        }

        Ok(())
    }

    /// Default tracing filter for the verbosity level
    pub fn log_level(&self) -> &'static str {
        match self.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    }

    /// Geometry to start with, filling gaps from the current terminal
    pub fn geometry(&self, current: Option<(u16, u16)>) -> (u16, u16) {
        let (cols, rows) = current.unwrap_or((80, 24));
        (self.cols.unwrap_or(cols), self.rows.unwrap_or(rows))
    }
}

fn valid_env_entry(entry: &str) -> bool {
    matches!(entry.split_once('='), Some((key, _)) if !key.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args).unwrap()
    }

    #[test]
    fn test_cli_parsing() {
        let cli = parse(&["vterm", "-c", "120", "-r", "40", "-e", "A=1", "-e", "B=2", "--", "ls", "-l"]);
        assert_eq!(cli.cols, Some(120));
        assert_eq!(cli.rows, Some(40));
        assert_eq!(cli.env, ["A=1", "B=2"]);
        assert_eq!(cli.command, ["ls", "-l"]);
        assert!(cli.validate().is_ok());
    }

    #[test]
    fn test_command_flags_are_not_ours() {
        let cli = parse(&["vterm", "grep", "-v", "-c", "x"]);
        assert_eq!(cli.verbose, 0);
        assert_eq!(cli.cols, None);
        assert_eq!(cli.command, ["grep", "-v", "-c", "x"]);
    }

    #[test]
    fn test_command_is_required() {
        assert!(Cli::try_parse_from(["vterm"]).is_err());
    }

    #[test]
    fn test_validate_rejects_bad_input() {
        let cli = parse(&["vterm", "-c", "0", "true"]);
        assert!(matches!(cli.validate(), Err(vterm::Error::InvalidSize { .. })));

        let cli = parse(&["vterm", "-e", "NOVALUE", "true"]);
        assert!(matches!(cli.validate(), Err(vterm::Error::InvalidEnv(_))));

        let cli = parse(&["vterm", "-e", "=x", "true"]);
        assert!(matches!(cli.validate(), Err(vterm::Error::InvalidEnv(_))));
    }

    #[test]
    fn test_geometry_defaults() {
        let cli = parse(&["vterm", "-r", "10", "true"]);
        assert_eq!(cli.geometry(None), (80, 10));
        assert_eq!(cli.geometry(Some((132, 50))), (132, 10));
    }

    #[test]
    fn test_log_level() {
        assert_eq!(parse(&["vterm", "true"]).log_level(), "warn");
        assert_eq!(parse(&["vterm", "-vv", "true"]).log_level(), "debug");
        assert_eq!(parse(&["vterm", "-vvvv", "true"]).log_level(), "trace");
    }
}

//! Operator command line read from stdin.

use std::path::PathBuf;
use thiserror::Error;

use crate::runtime::Intent;
use crate::telemetry::export::ExportFormat;
use crate::wire::protocol::OperatingMode;

/// Help text printed by `help`
pub const HELP: &str = "\
commands:
  connect [port] [interval]   open the port (auto-detect if omitted), log every <interval> s
  mode auto|heat|fan          select the operating mode
  base [pct]                  confirm base heat for fan-only runs (10-100 %, default from config)
  set <value> [!]             start a run; '!' confirms a setpoint outside the soft range
  dist <value>                send a disturbance value
  pid <kp> <ki> <kd>          send PID gains
  stop                        stop the plant and close the port
  export <path> [csv|jsonl]   write the log after stopping
  status                      show the session
  ports                       list serial ports
  help                        show this text
  quit                        stop and exit";

/// A parsed operator line
#[derive(Debug, Clone, PartialEq)]
pub enum CliCommand {
    /// Needs port resolution before it becomes an intent
    Connect {
        port: Option<String>,
        interval: Option<String>,
    },
    Intent(Intent),
    Status,
    Ports,
    Help,
    Quit,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CliError {
    #[error("unknown command '{0}' (type 'help')")]
    Unknown(String),

    #[error("usage: {0}")]
    Usage(&'static str),

    #[error("{0}")]
    Invalid(String),
}

/// Parse one line; blank lines yield `None`
///
/// # Errors
///
/// `Unknown` for an unrecognized verb, `Usage` for a wrong argument count.
pub fn parse_line(line: &str) -> Result<Option<CliCommand>, CliError> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Ok(None);
    };
    let args: Vec<&str> = words.collect();

    let command = match (verb.to_ascii_lowercase().as_str(), args.as_slice()) {
        ("connect", [..]) if args.len() <= 2 => CliCommand::Connect {
            port: args.first().map(|p| p.to_string()),
            interval: args.get(1).map(|i| i.to_string()),
        },
        ("connect", _) => return Err(CliError::Usage("connect [port] [interval]")),

        ("mode", [mode]) => {
            let mode = mode.parse::<OperatingMode>().map_err(CliError::Invalid)?;
            CliCommand::Intent(Intent::ChangeMode(mode))
        }
        ("mode", _) => return Err(CliError::Usage("mode auto|heat|fan")),

        ("base", []) => CliCommand::Intent(Intent::ConfirmBaseHeat(String::new())),
        ("base", [pct]) => CliCommand::Intent(Intent::ConfirmBaseHeat(pct.to_string())),
        ("base", _) => return Err(CliError::Usage("base [pct]")),

        ("set", [value]) => CliCommand::Intent(Intent::SubmitSetpoint {
            value: value.to_string(),
            confirmed: false,
        }),
        ("set", [value, "!"]) => CliCommand::Intent(Intent::SubmitSetpoint {
            value: value.to_string(),
            confirmed: true,
        }),
        ("set", _) => return Err(CliError::Usage("set <value> [!]")),

        ("dist", [value]) => CliCommand::Intent(Intent::SendDisturbance(value.to_string())),
        ("dist", _) => return Err(CliError::Usage("dist <value>")),

        ("pid", [kp, ki, kd]) => CliCommand::Intent(Intent::SendPid {
            kp: kp.to_string(),
            ki: ki.to_string(),
            kd: kd.to_string(),
        }),
        ("pid", _) => return Err(CliError::Usage("pid <kp> <ki> <kd>")),

        ("stop", []) => CliCommand::Intent(Intent::Stop),

        ("export", [path]) => CliCommand::Intent(Intent::Export {
            path: PathBuf::from(path),
            format: None,
        }),
        ("export", [path, format]) => {
            let format = format.parse::<ExportFormat>().map_err(CliError::Invalid)?;
            CliCommand::Intent(Intent::Export {
                path: PathBuf::from(path),
                format: Some(format),
            })
        }
        ("export", _) => return Err(CliError::Usage("export <path> [csv|jsonl]")),

        ("status", []) => CliCommand::Status,
        ("ports", []) => CliCommand::Ports,
        ("help" | "?", _) => CliCommand::Help,
        ("quit" | "exit", _) => CliCommand::Quit,

        (other, _) => return Err(CliError::Unknown(other.to_string())),
    };

    Ok(Some(command))
}

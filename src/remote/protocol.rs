use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tracing::{info, warn};

use crate::budget::{BlockingStateMachine, ExtensionError};

pub const DISCOVERY_REQUEST: &str = "CST_PARENT_DISCOVERY";
pub const DISCOVERY_RESPONSE: &str = "CST_CHILD_RESPONSE";
pub const COMMAND_PREFIX: &str = "CST_CMD:";
pub const RESPONSE_PREFIX: &str = "CST_RESP:";

/// Largest datagram either side reads
pub const MAX_DATAGRAM: usize = 1024;

pub const MAX_EXTEND_MINUTES: i32 = 1440;

/// What an inbound datagram is, judged by content alone
#[derive(Debug, PartialEq, Eq)]
pub enum Inbound<'a> {
    Discovery,
    /// Encrypted command; the envelope follows the prefix
    Command(&'a str),
    Ignored,
}

impl<'a> Inbound<'a> {
    pub fn classify(message: &'a str) -> Self {
        let message = message.trim();

        if message == DISCOVERY_REQUEST {
            Inbound::Discovery
        } else if let Some(envelope) = message.strip_prefix(COMMAND_PREFIX) {
            Inbound::Command(envelope)
        } else {
            Inbound::Ignored
        }
    }
}

/// Remote command grammar: `VERB[:ARG]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    GetTimeLeft,
    LockDevice,
    ExtendTime(u32),
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CommandError {
    #[error("Invalid EXTEND_TIME format. Use EXTEND_TIME:minutes")]
    InvalidExtendFormat,

    #[error("Invalid minutes value")]
    InvalidMinutesValue,

    #[error("Invalid minutes. Must be 1-{}", MAX_EXTEND_MINUTES)]
    MinutesOutOfRange,

    #[error("Unknown command")]
    Unknown,
}

impl FromStr for Command {
    type Err = CommandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts: Vec<&str> = s.trim().split(':').collect();
        // A trailing empty argument counts as absent
        while parts.len() > 1 && parts.last().is_some_and(|p| p.is_empty()) {
            parts.pop();
        }

        match parts[0] {
            "GET_TIME_LEFT" => Ok(Command::GetTimeLeft),
            "LOCK_DEVICE" => Ok(Command::LockDevice),
            "EXTEND_TIME" => {
                let [_, minutes] = parts.as_slice() else {
                    return Err(CommandError::InvalidExtendFormat);
                };
                let minutes: i32 = minutes
                    .parse()
                    .map_err(|_| CommandError::InvalidMinutesValue)?;
                if !(1..=MAX_EXTEND_MINUTES).contains(&minutes) {
                    return Err(CommandError::MinutesOutOfRange);
                }
                Ok(Command::ExtendTime(minutes.unsigned_abs()))
            }
            _ => Err(CommandError::Unknown),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::GetTimeLeft => f.write_str("GET_TIME_LEFT"),
            Command::LockDevice => f.write_str("LOCK_DEVICE"),
            Command::ExtendTime(minutes) => write!(f, "EXTEND_TIME:{}", minutes),
        }
    }
}

/// Reply to a remote command, rendered as `|`-separated text
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    TimeLeft {
        remaining: i64,
        blocked: bool,
        total: i64,
    },
    DeviceLocked,
    LockFailed,
    TimeExtended(u32),
    Error(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unrecognized response: {0:?}")]
pub struct ResponseParseError(pub String);

impl Response {
    pub fn render(&self) -> String {
        match self {
            Response::TimeLeft {
                remaining,
                blocked,
                total,
            } => format!(
                "TIME_LEFT|{}|{}|{}",
                remaining,
                if *blocked { "BLOCKED" } else { "ACTIVE" },
                total
            ),
            Response::DeviceLocked => "DEVICE_LOCKED|Device is now blocked".to_string(),
            Response::LockFailed => "DEVICE_LOCKED|ERROR|Failed to lock device".to_string(),
            Response::TimeExtended(minutes) => format!("TIME_EXTENDED|{} minutes added", minutes),
            Response::Error(message) => format!("ERROR|{}", message),
        }
    }

    pub fn parse(text: &str) -> Result<Self, ResponseParseError> {
        let invalid = || ResponseParseError(text.to_string());
        let parts: Vec<&str> = text.trim().split('|').collect();

        match parts[..] {
            ["TIME_LEFT", remaining, state, total] => {
                let blocked = match state {
                    "BLOCKED" => true,
                    "ACTIVE" => false,
                    _ => return Err(invalid()),
                };
                Ok(Response::TimeLeft {
                    remaining: remaining.parse().map_err(|_| invalid())?,
                    blocked,
                    total: total.parse().map_err(|_| invalid())?,
                })
            }
            ["TIME_LEFT", "ERROR", message] => Ok(Response::Error(message.to_string())),
            ["DEVICE_LOCKED", "ERROR", ..] => Ok(Response::LockFailed),
            ["DEVICE_LOCKED", ..] => Ok(Response::DeviceLocked),
            ["TIME_EXTENDED", detail] => {
                let minutes = detail
                    .strip_suffix(" minutes added")
                    .and_then(|m| m.parse().ok())
                    .ok_or_else(invalid)?;
                Ok(Response::TimeExtended(minutes))
            }
            ["ERROR", ..] => Ok(Response::Error(parts[1..].join("|"))),
            _ => Err(invalid()),
        }
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Response::TimeLeft {
                remaining,
                blocked,
                total,
            } => write!(
                f,
                "{} of {} minutes left today{}",
                remaining,
                total,
                if *blocked { " (blocked)" } else { "" }
            ),
            Response::DeviceLocked => f.write_str("Device is now blocked"),
            Response::LockFailed => f.write_str("Failed to lock device"),
            Response::TimeExtended(minutes) => write!(f, "{} minutes added", minutes),
            Response::Error(message) => write!(f, "Error: {}", message),
        }
    }
}

/// Executes decrypted remote commands against the shared state machine
#[derive(Clone)]
pub struct CommandProcessor {
    engine: BlockingStateMachine,
}

impl CommandProcessor {
    pub fn new(engine: BlockingStateMachine) -> Self {
        Self { engine }
    }

    /// Map any plaintext to a reply line; never fails
    pub async fn process(&self, plaintext: &str) -> String {
        let response = match plaintext.parse::<Command>() {
            Ok(command) => {
                info!("Remote command: {}", command);
                self.execute(command).await
            }
            Err(e) => {
                warn!("Rejected remote command {:?}: {}", plaintext, e);
                Response::Error(e.to_string())
            }
        };

        response.render()
    }

    pub async fn execute(&self, command: Command) -> Response {
        match command {
            Command::GetTimeLeft => {
                let snapshot = self.engine.refresh().await;
                Response::TimeLeft {
                    remaining: snapshot.remaining(),
                    blocked: snapshot.blocked,
                    total: snapshot.credit.minutes,
                }
            }
            Command::LockDevice => match self.engine.force_lock().await {
                Ok(_) => Response::DeviceLocked,
                Err(e) => {
                    warn!("Remote lock failed: {:#}", e);
                    Response::LockFailed
                }
            },
            Command::ExtendTime(minutes) => match self.engine.direct_extension(minutes).await {
                Ok(_) => Response::TimeExtended(minutes),
                Err(ExtensionError::InProgress) => {
                    Response::Error("Extension already in progress, try again shortly".to_string())
                }
                Err(e) => Response::Error(e.to_string()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::Credit;
    use crate::budget::testing::TestRig;

    #[test]
    fn test_classify() {
        assert_eq!(Inbound::classify("CST_PARENT_DISCOVERY"), Inbound::Discovery);
        assert_eq!(Inbound::classify("CST_PARENT_DISCOVERY\n"), Inbound::Discovery);
        assert_eq!(Inbound::classify("CST_CMD:abc="), Inbound::Command("abc="));
        assert_eq!(Inbound::classify("CST_CHILD_RESPONSE"), Inbound::Ignored);
        assert_eq!(Inbound::classify("CST_PARENT_DISCOVERY_EXTRA"), Inbound::Ignored);
        assert_eq!(Inbound::classify("hello"), Inbound::Ignored);
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!("GET_TIME_LEFT".parse(), Ok(Command::GetTimeLeft));
        assert_eq!("LOCK_DEVICE".parse(), Ok(Command::LockDevice));
        assert_eq!("EXTEND_TIME:30".parse(), Ok(Command::ExtendTime(30)));
        assert_eq!("EXTEND_TIME:1440".parse(), Ok(Command::ExtendTime(1440)));
        assert_eq!("GET_TIME_LEFT:ignored".parse(), Ok(Command::GetTimeLeft));
    }

    #[test]
    fn test_parse_extend_errors() {
        assert_eq!("EXTEND_TIME".parse::<Command>(), Err(CommandError::InvalidExtendFormat));
        assert_eq!("EXTEND_TIME:".parse::<Command>(), Err(CommandError::InvalidExtendFormat));
        assert_eq!("EXTEND_TIME:5:6".parse::<Command>(), Err(CommandError::InvalidExtendFormat));
        assert_eq!("EXTEND_TIME:ten".parse::<Command>(), Err(CommandError::InvalidMinutesValue));
        assert_eq!("EXTEND_TIME:0".parse::<Command>(), Err(CommandError::MinutesOutOfRange));
        assert_eq!("EXTEND_TIME:-5".parse::<Command>(), Err(CommandError::MinutesOutOfRange));
        assert_eq!("EXTEND_TIME:1441".parse::<Command>(), Err(CommandError::MinutesOutOfRange));
        assert_eq!("REBOOT".parse::<Command>(), Err(CommandError::Unknown));
        assert_eq!("".parse::<Command>(), Err(CommandError::Unknown));
    }

    #[test]
    fn test_command_wire_form() {
        assert_eq!(Command::ExtendTime(15).to_string(), "EXTEND_TIME:15");
        assert_eq!(Command::LockDevice.to_string(), "LOCK_DEVICE");
    }

    #[test]
    fn test_render_responses() {
        let time_left = Response::TimeLeft {
            remaining: 5,
            blocked: false,
            total: 20,
        };
        assert_eq!(time_left.render(), "TIME_LEFT|5|ACTIVE|20");
        assert_eq!(Response::parse("TIME_LEFT|5|ACTIVE|20").unwrap(), time_left);

        assert_eq!(Response::TimeExtended(10).render(), "TIME_EXTENDED|10 minutes added");
        assert_eq!(
            Response::parse("TIME_EXTENDED|10 minutes added").unwrap(),
            Response::TimeExtended(10)
        );
        assert_eq!(
            Response::parse("DEVICE_LOCKED|ERROR|Failed to lock device").unwrap(),
            Response::LockFailed
        );
        assert_eq!(
            Response::parse("ERROR|Invalid minutes. Must be 1-1440").unwrap(),
            Response::Error("Invalid minutes. Must be 1-1440".to_string())
        );
        assert!(Response::parse("SOMETHING|else").is_err());
    }

    #[tokio::test]
    async fn test_process_time_left() {
        let rig = TestRig::new(Credit::new(20, 1, 1));
        rig.set_usage_minutes(15);
        let processor = CommandProcessor::new(rig.engine.clone());

        assert_eq!(processor.process("GET_TIME_LEFT").await, "TIME_LEFT|5|ACTIVE|20");

        rig.set_usage_minutes(21);
        assert_eq!(processor.process("GET_TIME_LEFT").await, "TIME_LEFT|0|BLOCKED|20");
    }

    #[tokio::test]
    async fn test_process_lock_device() {
        let rig = TestRig::new(Credit::new(20, 1, 1));
        rig.set_usage_minutes(10);
        let processor = CommandProcessor::new(rig.engine.clone());

        assert_eq!(processor.process("LOCK_DEVICE").await, "DEVICE_LOCKED|Device is now blocked");

        let state = rig.engine.state().await;
        assert!(state.blocked);
        assert_eq!(state.duration, 10);
        assert_eq!(rig.stored_credit(), Some(Credit::new(9, 0, 0)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_process_extend_time() {
        let rig = TestRig::new(Credit::new(20, 1, 1));
        rig.set_usage_minutes(20);
        let processor = CommandProcessor::new(rig.engine.clone());

        assert_eq!(processor.process("EXTEND_TIME:15").await, "TIME_EXTENDED|15 minutes added");
        assert_eq!(rig.stored_credit().unwrap().minutes, 35);

        assert_eq!(
            processor.process("EXTEND_TIME:15").await,
            "ERROR|Extension already in progress, try again shortly"
        );
    }

    #[tokio::test]
    async fn test_process_errors() {
        let rig = TestRig::new(Credit::new(20, 1, 1));
        let processor = CommandProcessor::new(rig.engine.clone());

        assert_eq!(
            processor.process("EXTEND_TIME").await,
            "ERROR|Invalid EXTEND_TIME format. Use EXTEND_TIME:minutes"
        );
        assert_eq!(processor.process("EXTEND_TIME:abc").await, "ERROR|Invalid minutes value");
        assert_eq!(
            processor.process("EXTEND_TIME:2000").await,
            "ERROR|Invalid minutes. Must be 1-1440"
        );
        assert_eq!(processor.process("SELF_DESTRUCT").await, "ERROR|Unknown command");
        assert_eq!(rig.stored_credit(), None);
    }
}

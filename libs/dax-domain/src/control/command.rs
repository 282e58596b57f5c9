//! Command parsing

use serde_json::Value;
use thiserror::Error;

use super::document::ControlDocument;

/// Reasons a control document is not an applicable command
#[derive(Error, Debug, PartialEq)]
pub enum CommandError {
    #[error("no command field")]
    Missing,

    #[error("command field is not a string: {0}")]
    NotAString(Value),

    #[error("unknown command '{0}'")]
    Unknown(String),
}

/// A parsed control command
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Arm {
        mode: Option<String>,
        options_override: Option<Value>,
    },
    Start {
        run_identifier: String,
    },
    Stop,
}

impl Command {
    pub fn parse(doc: &ControlDocument) -> Result<Self, CommandError> {
        let name = match doc.field("command") {
            None | Some(Value::Null) => return Err(CommandError::Missing),
            Some(Value::String(name)) => name.as_str(),
            Some(other) => return Err(CommandError::NotAString(other.clone())),
        };

        match name {
            "arm" => Ok(Self::Arm {
                mode: doc
                    .field("mode")
                    .and_then(Value::as_str)
                    .filter(|mode| !mode.is_empty())
                    .map(str::to_string),
                options_override: doc
                    .field("options_override")
                    .filter(|value| value.is_object())
                    .cloned(),
            }),
            "start" => Ok(Self::Start {
                run_identifier: run_identifier(doc.field("run_identifier")),
            }),
            "stop" => Ok(Self::Stop),
            other => Err(CommandError::Unknown(other.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Arm { .. } => "arm",
            Self::Start { .. } => "start",
            Self::Stop => "stop",
        }
    }
}

/// Run identifier as a string: strings as they are, integers rendered, anything else `"na"`
pub fn run_identifier(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(run)) => run.clone(),
        Some(Value::Number(number)) if number.is_i64() || number.is_u64() => number.to_string(),
        _ => "na".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(body: Value) -> ControlDocument {
        let mut value = json!({"host": ["reader0"]});
        if let (Value::Object(map), Value::Object(extra)) = (&mut value, body) {
            map.extend(extra);
        }
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_parse_arm_with_override() {
        let command = Command::parse(&doc(json!({
            "command": "arm",
            "mode": "background",
            "options_override": {"strax": {"compressor": "none"}}
        })))
        .unwrap();

        assert_eq!(
            command,
            Command::Arm {
                mode: Some("background".to_string()),
                options_override: Some(json!({"strax": {"compressor": "none"}})),
            }
        );
    }

    #[test]
    fn test_arm_without_mode_parses() {
        let command = Command::parse(&doc(json!({"command": "arm", "mode": ""}))).unwrap();
        assert!(matches!(command, Command::Arm { mode: None, .. }));
    }

    #[test]
    fn test_run_identifier_forms() {
        assert_eq!(run_identifier(Some(&json!("run_0042"))), "run_0042");
        assert_eq!(run_identifier(Some(&json!(42))), "42");
        assert_eq!(run_identifier(Some(&json!(4.2))), "na");
        assert_eq!(run_identifier(None), "na");
    }

    #[test]
    fn test_rejects_unknown_and_malformed() {
        assert_eq!(
            Command::parse(&doc(json!({"command": "reboot"}))),
            Err(CommandError::Unknown("reboot".to_string()))
        );
        assert_eq!(Command::parse(&doc(json!({}))), Err(CommandError::Missing));
        assert!(matches!(
            Command::parse(&doc(json!({"command": [1, 2]}))),
            Err(CommandError::NotAString(_))
        ));
    }
}

use std::collections::BTreeMap;

use serde_json::Value;

use super::command_registry::{
    CommandSpec, LAYOUT_COMMAND, NO_ARG_COMMANDS, TEXT_ARG_COMMANDS, TOGGLE_COMMANDS,
};
use crate::plan::LayoutKind;

#[derive(Debug, Clone, PartialEq)]
pub struct Intent {
    pub action: String,
    pub raw: String,
    pub prompt: Option<String>,
    pub command_args: BTreeMap<String, Value>,
}

impl Intent {
    fn new(action: &str, raw: &str) -> Self {
        Self {
            action: action.to_string(),
            raw: raw.to_string(),
            prompt: None,
            command_args: BTreeMap::new(),
        }
    }

    fn with_arg(mut self, key: &str, value: Value) -> Self {
        self.command_args.insert(key.to_string(), value);
        self
    }
}

fn find_action(command: &str, specs: &[CommandSpec]) -> Option<&'static str> {
    specs
        .iter()
        .find(|spec| spec.command == command)
        .map(|spec| spec.action)
}

fn parse_switch(arg: &str) -> Option<bool> {
    match arg.trim().to_ascii_lowercase().as_str() {
        "on" | "true" | "yes" | "1" | "enable" | "enabled" => Some(true),
        "off" | "false" | "no" | "0" | "disable" | "disabled" => Some(false),
        _ => None,
    }
}

fn toggle_intent(command: &str, action: &str, arg: &str, raw: &str) -> Intent {
    let intent = Intent::new(action, raw);
    if command == "nobg" {
        return intent.with_arg("enabled", Value::Bool(false));
    }
    if arg.is_empty() {
        return intent.with_arg("enabled", Value::Null);
    }
    match parse_switch(arg) {
        Some(enabled) => intent.with_arg("enabled", Value::Bool(enabled)),
        None => Intent::new("invalid", raw).with_arg(
            "error",
            Value::String(format!("/{command} expects on or off, got '{arg}'")),
        ),
    }
}

fn layout_intent(arg: &str, raw: &str) -> Intent {
    let intent = Intent::new(LAYOUT_COMMAND.action, raw);
    if arg.is_empty() || arg.eq_ignore_ascii_case("auto") {
        return intent.with_arg("layout", Value::Null);
    }
    match arg.parse::<LayoutKind>() {
        Ok(layout) => intent.with_arg("layout", Value::String(layout.as_str().to_string())),
        Err(message) => Intent::new("invalid", raw).with_arg("error", Value::String(message)),
    }
}

pub fn parse_intent(text: &str) -> Intent {
    let raw_trimmed = text.trim();
    if raw_trimmed.is_empty() {
        return Intent::new("noop", text);
    }

    if let Some(slash_tail) = raw_trimmed.strip_prefix('/') {
        let command_len = slash_tail
            .chars()
            .take_while(|ch| ch.is_ascii_alphanumeric() || *ch == '_')
            .count();
        if command_len > 0 {
            let command = slash_tail[..command_len].to_ascii_lowercase();
            let arg = slash_tail[command_len..].trim();

            if let Some(action) = find_action(&command, TEXT_ARG_COMMANDS) {
                if arg.is_empty() {
                    return Intent::new("invalid", text).with_arg(
                        "error",
                        Value::String(format!("/{command} needs some text")),
                    );
                }
                let mut intent = Intent::new(action, text);
                intent.prompt = Some(arg.to_string());
                return intent;
            }

            if let Some(action) = find_action(&command, TOGGLE_COMMANDS) {
                return toggle_intent(&command, action, arg, text);
            }

            if command == LAYOUT_COMMAND.command {
                return layout_intent(arg, text);
            }

            if let Some(action) = find_action(&command, NO_ARG_COMMANDS) {
                return Intent::new(action, text);
            }

            return Intent::new("unknown", text)
                .with_arg("command", Value::String(command))
                .with_arg("arg", Value::String(arg.to_string()));
        }
    }

    let mut intent = Intent::new("message", text);
    intent.prompt = Some(raw_trimmed.to_string());
    intent
}

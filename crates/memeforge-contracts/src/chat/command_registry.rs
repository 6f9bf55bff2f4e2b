#[derive(Clone, Copy, Debug)]
pub(crate) struct CommandSpec {
    pub command: &'static str,
    pub action: &'static str,
}

/// Commands whose whole remainder is passed through as free text.
pub(crate) const TEXT_ARG_COMMANDS: &[CommandSpec] = &[CommandSpec {
    command: "meme",
    action: "meme",
}];

pub(crate) const TOGGLE_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "bg",
        action: "set_background_removal",
    },
    CommandSpec {
        command: "nobg",
        action: "set_background_removal",
    },
];

pub(crate) const LAYOUT_COMMAND: CommandSpec = CommandSpec {
    command: "layout",
    action: "set_layout",
};

pub(crate) const NO_ARG_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "help",
        action: "help",
    },
    CommandSpec {
        command: "history",
        action: "history",
    },
    CommandSpec {
        command: "clear",
        action: "clear_history",
    },
    CommandSpec {
        command: "quit",
        action: "quit",
    },
    CommandSpec {
        command: "exit",
        action: "quit",
    },
];

pub const CHAT_HELP_COMMANDS: &[&str] = &[
    "/meme <text>",
    "/bg on|off",
    "/layout single|grid|vertical|horizontal|auto",
    "/history",
    "/clear",
    "/help",
    "/quit",
];

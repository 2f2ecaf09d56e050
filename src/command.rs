//! Command interpreter for the line protocol.
//!
//! Every input line maps to exactly one response:
//!
//! ```text
//! (empty)        -> Say something...
//! hello          -> Hi there!
//! bye, /quit...  -> Goodbye! Closing connection...   (closes the session)
//! /time...       -> HH:MM:SS
//! /echo <text>   -> <text>
//! <anything>     -> <anything>
//! ```
//!
//! Keywords match case-insensitively; echoed text keeps its original case.
//! Every response ends with a blank line.

use crate::clock::Clock;

/// Response sent before the server closes a session at the client's request.
pub const GOODBYE: &str = "Goodbye! Closing connection...\n\n";

const MESSAGE_END: &str = "\n\n";

/// Parsed client command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command<'a> {
    /// Blank line.
    Empty,
    Hello,
    /// `bye` or anything starting with `/quit`.
    Quit,
    /// Anything starting with `/time`.
    Time,
    /// `/echo ` followed by text to send back.
    Echo(&'a str),
    /// Unrecognized input, echoed whole.
    Say(&'a str),
}

/// Outcome of running one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    pub response: String,
    /// Close the connection once the response is delivered.
    pub terminate: bool,
}

impl CommandResult {
    fn reply(text: &str) -> Self {
        Self {
            response: format!("{text}{MESSAGE_END}"),
            terminate: false,
        }
    }
}

impl<'a> Command<'a> {
    /// Parse an already-trimmed line. First match wins.
    pub fn parse(line: &'a str) -> Self {
        if line.is_empty() {
            Command::Empty
        } else if line.eq_ignore_ascii_case("hello") {
            Command::Hello
        } else if line.eq_ignore_ascii_case("bye") || has_prefix(line, "/quit") {
            Command::Quit
        } else if has_prefix(line, "/time") {
            Command::Time
        } else if has_prefix(line, "/echo ") {
            Command::Echo(&line["/echo ".len()..])
        } else {
            Command::Say(line)
        }
    }

    pub fn execute(&self, clock: &dyn Clock) -> CommandResult {
        match self {
            Command::Empty => CommandResult::reply("Say something..."),
            Command::Hello => CommandResult::reply("Hi there!"),
            Command::Quit => CommandResult {
                response: GOODBYE.to_string(),
                terminate: true,
            },
            Command::Time => {
                CommandResult::reply(&clock.now().format("%H:%M:%S").to_string())
            }
            Command::Echo(text) | Command::Say(text) => CommandResult::reply(text),
        }
    }
}

/// Trim `line` and run it.
pub fn interpret(line: &str, clock: &dyn Clock) -> CommandResult {
    Command::parse(line.trim()).execute(clock)
}

fn has_prefix(line: &str, prefix: &str) -> bool {
    line.get(..prefix.len())
        .is_some_and(|head| head.eq_ignore_ascii_case(prefix))
}

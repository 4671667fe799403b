//! Command line parser.
//!
//! Recognizes the 4-byte command prefix at the start of the buffered input
//! and splits argument bytes into whitespace/newline delimited tokens.

use std::ops::Range;

/// Length of every command prefix (`"ping"`, `"cat "`, `"sum "`).
pub const CMD_LEN: usize = 4;

/// Maximum number of argument tokens kept; extra tokens are ignored.
pub const MAX_ARGUMENTS: usize = 5;

/// Command keyword recognized from the prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Ping,
    Cat,
    Sum,
}

impl CommandKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::Ping => "ping",
            CommandKind::Cat => "cat",
            CommandKind::Sum => "sum",
        }
    }

    fn from_prefix(prefix: &[u8]) -> Option<Self> {
        match prefix {
            b"ping" => Some(CommandKind::Ping),
            b"cat " => Some(CommandKind::Cat),
            b"sum " => Some(CommandKind::Sum),
            _ => None,
        }
    }
}

/// A recognized command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub kind: CommandKind,
    /// Argument bytes following the prefix, excluding the line terminator.
    pub remainder: Range<usize>,
    /// Bytes of input the command line occupies, terminator included.
    pub consumed: usize,
    /// False when the line terminator has not arrived yet (prefix-only
    /// `ping`); the rest of that line must be skipped when it does.
    pub terminated: bool,
}

/// Parse result.
#[derive(Debug, PartialEq, Eq)]
pub enum ParseResult {
    /// Prefix or line not fully buffered yet; wait for the next read.
    NeedMoreData,
    /// Known command found at the head of the buffer.
    Recognized(Command),
    /// Input cannot start any known command.
    Unrecognized,
}

/// Parse the command at the head of `input`.
///
/// Blank bytes before the prefix are skipped. `ping` is accepted on its
/// prefix alone; `cat` and `sum` need their whole line, and a partial line
/// longer than `max_line` is rejected.
pub fn parse(input: &[u8], max_line: usize) -> ParseResult {
    let start = input
        .iter()
        .position(|&b| !is_delimiter(b))
        .unwrap_or(input.len());
    let buffered = &input[start..];

    if buffered.len() < CMD_LEN {
        return if could_become_command(buffered) {
            ParseResult::NeedMoreData
        } else {
            ParseResult::Unrecognized
        };
    }

    let kind = match CommandKind::from_prefix(&buffered[..CMD_LEN]) {
        Some(kind) => kind,
        None => return ParseResult::Unrecognized,
    };

    let line_end = buffered[CMD_LEN..]
        .iter()
        .position(|&b| b == b'\n')
        .map(|pos| pos + CMD_LEN);

    match (kind, line_end) {
        (_, Some(end)) => ParseResult::Recognized(Command {
            kind,
            remainder: start + CMD_LEN..start + end,
            consumed: start + end + 1,
            terminated: true,
        }),
        (CommandKind::Ping, None) => ParseResult::Recognized(Command {
            kind,
            remainder: start + CMD_LEN..input.len(),
            consumed: input.len(),
            terminated: false,
        }),
        (_, None) if buffered.len() > max_line => ParseResult::Unrecognized,
        (_, None) => ParseResult::NeedMoreData,
    }
}

/// Split argument bytes into at most [`MAX_ARGUMENTS`] tokens.
pub fn tokenize(args: &[u8]) -> Vec<&[u8]> {
    args.split(|&b| is_delimiter(b))
        .filter(|token| !token.is_empty())
        .take(MAX_ARGUMENTS)
        .collect()
}

/// Find the next token at or after `cursor`.
///
/// Returns the token's range and the cursor position just past the token and
/// its delimiter, so repeated calls never revisit a token.
pub fn next_token(input: &[u8], cursor: usize) -> Option<(Range<usize>, usize)> {
    let from = cursor.min(input.len());
    let start = from + input[from..].iter().position(|&b| !is_delimiter(b))?;
    let end = input[start..]
        .iter()
        .position(|&b| is_delimiter(b))
        .map_or(input.len(), |pos| start + pos);

    Some((start..end, (end + 1).min(input.len())))
}

/// Token delimiters: space, newline, carriage return.
pub fn is_delimiter(b: u8) -> bool {
    matches!(b, b' ' | b'\n' | b'\r')
}

fn could_become_command(partial: &[u8]) -> bool {
    [b"ping", b"cat ", b"sum "]
        .iter()
        .any(|prefix| prefix.starts_with(partial))
}

//! Shell output scrubbing
//!
//! Best-effort normalisation of raw shell output into plain text: escape
//! sequences, control bytes and common prompt artifacts are removed. This is
//! not a terminal emulator; cursor movement is dropped, not applied.

use regex::Regex;
use std::sync::LazyLock;

/// Window-title remnant whose ESC was already lost (`]0;title BEL`)
static TITLE_REMNANT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\]0;[^\x07\n]*\x07").expect("valid regex"));

/// Erase-in-line remnant (`[K`)
static ERASE_REMNANT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[K").expect("valid regex"));

/// `user@host:cwd$ ` style prompt
static USER_HOST_PROMPT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\w.-]+@[\w.-]+:[^\n$#]*[$#] ?").expect("valid regex"));

/// Title info left on its own line
static TITLE_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^0;.*\n").expect("valid regex"));

/// Decorated prompt line such as `┌──(user㉿host)-[~/dir]`
static DECORATED_PROMPT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^[^\n(]*\([^\n)]*\)-\[[^\n\]]*\][^\n]*\n?").expect("valid regex")
});

/// Prompt left at the very end of the output
static TRAILING_PROMPT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\s*\z").expect("valid regex"));

static BLANK_RUNS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n\s*\n+").expect("valid regex"));

/// Scrub raw shell output into plain text
pub fn scrub(raw: &[u8]) -> String {
    let stripped = strip_ansi_escapes::strip(raw);
    let text = String::from_utf8_lossy(&stripped);

    let text = TITLE_REMNANT.replace_all(&text, "");
    let text = ERASE_REMNANT.replace_all(&text, "");

    // Keep newline and carriage return, drop every other control character
    let text: String = text
        .chars()
        .filter(|&c| c == '\n' || c == '\r' || !c.is_control())
        .collect();

    let text = USER_HOST_PROMPT.replace_all(&text, "");
    let text = TITLE_LINE.replace_all(&text, "");
    let text = DECORATED_PROMPT.replace_all(&text, "");
    let text = TRAILING_PROMPT.replace_all(&text, "");
    let text = BLANK_RUNS.replace_all(&text, "\n\n");

    text.trim().to_string()
}

/// Drop the terminal's echo of `command` from the first line of `output`
pub fn strip_command_echo(output: &str, command: &str) -> String {
    let command = command.trim();
    if command.is_empty() {
        return output.to_string();
    }

    let (first, rest) = output.split_once('\n').unwrap_or((output, ""));
    if first.trim().ends_with(command) {
        rest.trim().to_string()
    } else {
        output.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strips_color_codes() {
        assert_eq!(scrub(b"\x1b[01;32mgreen\x1b[0m text"), "green text");
    }

    #[test]
    fn test_strips_title_and_bracketed_paste() {
        let raw = b"\x1b]0;user@box: ~\x07\x1b[?2004hfile.txt\r\n\x1b[?2004l";
        assert_eq!(scrub(raw), "file.txt");
    }

    #[test]
    fn test_drops_control_bytes() {
        assert_eq!(scrub(b"a\x07b\x08c\x00d"), "abcd");
    }

    #[test]
    fn test_removes_user_host_prompt() {
        let out = scrub(b"alice@laptop:~/src$ ls\nCargo.toml\n");
        assert_eq!(out, "ls\nCargo.toml");
    }

    #[test]
    fn test_removes_decorated_prompt_line() {
        let out = scrub("┌──(kali㉿kali)-[~/work]\n└─$ whoami\nkali\n".as_bytes());
        assert!(!out.contains("(kali"));
        assert!(out.contains("kali"));
    }

    #[test]
    fn test_removes_trailing_prompt() {
        assert_eq!(scrub(b"hi\r\n$ "), "hi");
    }

    #[test]
    fn test_collapses_blank_lines() {
        assert_eq!(scrub(b"one\n\n\n\ntwo"), "one\n\ntwo");
    }

    #[test]
    fn test_strip_command_echo() {
        assert_eq!(strip_command_echo("echo hi\nhi", "echo hi\n"), "hi");
        assert_eq!(strip_command_echo("$ echo hi\r\nhi", "echo hi"), "hi");
        assert_eq!(strip_command_echo("hi", "echo hi"), "hi");
        assert_eq!(strip_command_echo("echo hi", "echo hi"), "");
    }
}

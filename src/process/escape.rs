//! Shell-string assembly for privileged execution.
//!
//! Every command line that travels through the elevation mechanism is built
//! here; nothing else in the crate concatenates user-controlled paths into a
//! shell string.

/// Quote a string for POSIX `sh`.
///
/// Wraps the value in single quotes; embedded single quotes are closed,
/// backslash-escaped and reopened (`'` becomes `'\''`).
pub fn sh_quote(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('\'');
    for ch in value.chars() {
        if ch == '\'' {
            quoted.push_str("'\\''");
        } else {
            quoted.push(ch);
        }
    }
    quoted.push('\'');
    quoted
}

/// Escape a string for embedding in an AppleScript string literal.
///
/// AppleScript 2.0 string literals understand `\\`, `\"`, `\n` and `\t`;
/// raw newlines inside a literal are not valid.
pub fn applescript_string(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '\\' => escaped.push_str("\\\\"),
            '"' => escaped.push_str("\\\""),
            '\n' => escaped.push_str("\\n"),
            '\r' => escaped.push_str("\\r"),
            '\t' => escaped.push_str("\\t"),
            _ => escaped.push(ch),
        }
    }
    escaped
}

/// Assemble one `sh` command line from a command, its arguments and optional
/// piped input.
///
/// Piped input is delivered through `printf '%s'` so the target command sees
/// exactly the given bytes on stdin, newlines included.
pub fn shell_line(command: &str, args: &[&str], stdin: Option<&str>) -> String {
    let mut line = String::new();
    if let Some(input) = stdin {
        line.push_str("printf '%s' ");
        line.push_str(&sh_quote(input));
        line.push_str(" | ");
    }
    line.push_str(&sh_quote(command));
    for arg in args {
        line.push(' ');
        line.push_str(&sh_quote(arg));
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sh_quote_plain() {
        assert_eq!(sh_quote("diskutil"), "'diskutil'");
        assert_eq!(sh_quote("/dev/disk3"), "'/dev/disk3'");
    }

    #[test]
    fn test_sh_quote_embedded_single_quote() {
        assert_eq!(sh_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn test_sh_quote_preserves_specials() {
        // Double quotes, backslashes, globs and dollars are inert inside
        // single quotes; they must pass through untouched.
        assert_eq!(sh_quote(r#"a"b\c$d*e"#), r#"'a"b\c$d*e'"#);
    }

    #[test]
    fn test_sh_quote_newline() {
        assert_eq!(sh_quote("f 1\nwrite"), "'f 1\nwrite'");
    }

    #[test]
    fn test_applescript_string_quotes_and_backslashes() {
        assert_eq!(applescript_string(r#"say "hi""#), r#"say \"hi\""#);
        assert_eq!(applescript_string(r"C:\path"), r"C:\\path");
    }

    #[test]
    fn test_applescript_string_newlines() {
        assert_eq!(applescript_string("a\nb\tc"), r"a\nb\tc");
    }

    #[test]
    fn test_shell_line_simple() {
        assert_eq!(
            shell_line("diskutil", &["unmountDisk", "/dev/disk3"], None),
            "'diskutil' 'unmountDisk' '/dev/disk3'"
        );
    }

    #[test]
    fn test_shell_line_with_piped_input() {
        let line = shell_line("fdisk", &["-e", "/dev/disk3"], Some("f 1\nwrite\ny\nquit\n"));
        assert_eq!(
            line,
            "printf '%s' 'f 1\nwrite\ny\nquit\n' | 'fdisk' '-e' '/dev/disk3'"
        );
    }

    #[test]
    fn test_shell_line_hostile_path() {
        let line = shell_line("dd", &["if=/tmp/o'clock.img"], None);
        assert_eq!(line, r"'dd' 'if=/tmp/o'\''clock.img'");
    }

    #[test]
    fn test_full_escaping_round_trip_shape() {
        // The privileged path wraps the sh line in an AppleScript literal;
        // a quote-heavy input must survive both layers.
        let line = shell_line("sh", &["-c", r#"echo "a'b""#], Some("x\ny"));
        let script = applescript_string(&line);
        assert!(!script.contains('\n'));
        // sh layer: " -> literal inside single quotes, ' -> '\''
        // AppleScript layer: " -> \" and \ -> \\
        assert!(script.contains(r#"\"a'\\''b\""#));
    }
}

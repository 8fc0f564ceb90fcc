//! ANSI color helpers for CLI output.
//!
//! Coloring is skipped when `NO_COLOR` is set.

fn paint(code: &str, s: &str) -> String {
    if std::env::var_os("NO_COLOR").is_some() {
        return s.to_string();
    }
    format!("\x1b[{}m{}\x1b[0m", code, s)
}

/// Format text in green.
pub fn green(s: &str) -> String {
    paint("32", s)
}

/// Format text in red.
pub fn red(s: &str) -> String {
    paint("31", s)
}

/// Format text in yellow.
pub fn yellow(s: &str) -> String {
    paint("33", s)
}

/// Format text in cyan.
pub fn cyan(s: &str) -> String {
    paint("36", s)
}

/// Format text in bold.
pub fn bold(s: &str) -> String {
    paint("1", s)
}

/// Format text in gray.
pub fn gray(s: &str) -> String {
    paint("90", s)
}

/// Format a status label (right-aligned, green, bold).
pub fn status_label(label: &str) -> String {
    paint("1;32", &format!("{:>12}", label))
}

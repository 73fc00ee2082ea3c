//! Session greeting banner.

use std::fmt::Write;

const BANNER_WIDTH: usize = 79;
const BANNER_CHAR: char = '-';
const BANNER_BORDER: char = '|';
const BANNER_SPACING: usize = 4;

#[derive(Clone, Copy, PartialEq)]
enum Orientation {
    Left,
    Center,
}

/// Render the framed greeting shown once per authenticated session.
pub fn render(user: &str) -> String {
    let mut banner = String::new();
    let end_line = format!(
        ".{}.\n",
        BANNER_CHAR.to_string().repeat(BANNER_WIDTH - 2)
    );
    banner.push_str(&end_line);
    banner.push_str(&format_line(
        &format!("Hello {user}!"),
        BANNER_WIDTH,
        Orientation::Left,
        BANNER_SPACING,
    ));
    banner.push_str(&format_line(
        "Welcome to patchssh!",
        BANNER_WIDTH,
        Orientation::Left,
        BANNER_SPACING,
    ));
    banner.push_str(&format_line("", BANNER_WIDTH, Orientation::Center, 0));
    banner.push_str(&format_line(
        "!This is a test banner!",
        BANNER_WIDTH,
        Orientation::Center,
        BANNER_SPACING,
    ));
    banner.push_str(&end_line);
    banner
}

// Pads the text with spaces up to the given width, between `|` borders.
// Center orientation ignores the spacing.
fn format_line(raw: &str, width: usize, orientation: Orientation, spacing: usize) -> String {
    let mut line = String::new();
    let width = width - 2;
    line.push(BANNER_BORDER);
    if raw.len() > width {
        let _ = write!(line, "{}...", &raw[..width - 3]);
    } else {
        match orientation {
            Orientation::Left => {
                let _ = write!(
                    line,
                    "{}{}{}",
                    " ".repeat(spacing),
                    raw,
                    " ".repeat(width - raw.len() - spacing)
                );
            }
            Orientation::Center => {
                let left = (width - raw.len()) / 2;
                let right = width - raw.len() - left;
                let _ = write!(line, "{}{}{}", " ".repeat(left), raw, " ".repeat(right));
            }
        }
    }
    line.push(BANNER_BORDER);
    line.push('\n');
    line
}

use clap::builder::styling::{AnsiColor, Style, Styles};
use colored::Color;
use once_cell::sync::Lazy;

/// Terminal colors by role. Response statuses pick their color from the
/// status class.
pub struct Palette {
    pub ok: Color,
    pub client_error: Color,
    pub server_error: Color,
    pub note: Color,
    pub heading: Color,
    pub faint: Color,
    pub key: Color,
    pub value: Color,
}

impl Palette {
    pub fn for_status(&self, status: u16) -> Color {
        match status {
            200..=399 => self.ok,
            400..=499 => self.client_error,
            _ => self.server_error,
        }
    }

    /// The same roles expressed as clap help styles.
    pub fn help_styles(&self) -> Styles {
        let ansi = |color: AnsiColor| Style::new().fg_color(Some(color.into()));
        Styles::styled()
            .usage(ansi(AnsiColor::BrightBlue).bold())
            .header(ansi(AnsiColor::Cyan).bold())
            .literal(ansi(AnsiColor::Magenta))
            .placeholder(ansi(AnsiColor::BrightBlack))
            .valid(ansi(AnsiColor::Green))
            .invalid(ansi(AnsiColor::Yellow))
            .error(ansi(AnsiColor::Red).bold())
    }
}

pub static PALETTE: Lazy<Palette> = Lazy::new(|| Palette {
    ok: Color::Green,
    client_error: Color::Yellow,
    server_error: Color::Red,
    note: Color::Blue,
    heading: Color::Cyan,
    faint: Color::BrightBlack,
    key: Color::BrightCyan,
    value: Color::White,
});

pub const GLYPH_OK: &str = "✓";
pub const GLYPH_FAIL: &str = "✗";
pub const GLYPH_WARN: &str = "⚠";
pub const GLYPH_NOTE: &str = "ℹ";
pub const GLYPH_ARROW: &str = "→";
pub const GLYPH_BULLET: &str = "•";

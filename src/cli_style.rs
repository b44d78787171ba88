use clap::builder::styling::{AnsiColor, Color, Style};
use clap::builder::Styles;
use crossterm::style::{Attribute, Color as CtColor, Stylize};
use unicode_width::UnicodeWidthStr;

// ─── Clap styles ─────────────────────────────────────────────────────────────

pub fn get_styles() -> Styles {
    Styles::styled()
        .usage(
            Style::new()
                .bold()
                .underline()
                .fg_color(Some(Color::Ansi(AnsiColor::Blue))),
        )
        .header(
            Style::new()
                .bold()
                .underline()
                .fg_color(Some(Color::Ansi(AnsiColor::Blue))),
        )
        .literal(
            Style::new()
                .bold()
                .fg_color(Some(Color::Ansi(AnsiColor::Green))),
        )
        .invalid(
            Style::new()
                .bold()
                .fg_color(Some(Color::Ansi(AnsiColor::Red))),
        )
        .error(
            Style::new()
                .bold()
                .fg_color(Some(Color::Ansi(AnsiColor::Red))),
        )
        .valid(
            Style::new()
                .bold()
                .fg_color(Some(Color::Ansi(AnsiColor::Green))),
        )
        .placeholder(Style::new().fg_color(Some(Color::Ansi(AnsiColor::BrightBlack))))
}

// ─── Palette ─────────────────────────────────────────────────────────────────

pub mod colors {
    use crossterm::style::Color;

    pub const ACCENT: Color = Color::Rgb {
        r: 94,
        g: 170,
        b: 255,
    };
    pub const OK: Color = Color::Rgb {
        r: 80,
        g: 220,
        b: 120,
    };
    pub const WARN: Color = Color::Rgb {
        r: 255,
        g: 184,
        b: 64,
    };
    pub const FAIL: Color = Color::Rgb {
        r: 255,
        g: 85,
        b: 85,
    };
    pub const MUTED: Color = Color::Rgb {
        r: 128,
        g: 128,
        b: 128,
    };
    pub const TEXT: Color = Color::Rgb {
        r: 235,
        g: 235,
        b: 235,
    };
}

const SECTION_WIDTH: usize = 60;
const MAX_CELL_WIDTH: usize = 48;

// ─── Status lines ────────────────────────────────────────────────────────────

pub fn print_success(message: &str) {
    println!(" {} {}", "✓".with(colors::OK).bold(), message.with(colors::OK));
}

pub fn print_error(message: &str) {
    eprintln!(
        " {} {}",
        "✗".with(colors::FAIL).bold(),
        message.with(colors::FAIL)
    );
}

pub fn print_warning(message: &str) {
    println!(
        " {} {}",
        "⚠".with(colors::WARN).bold(),
        message.with(colors::WARN)
    );
}

pub fn print_info(message: &str) {
    println!(
        " {} {}",
        "ℹ".with(colors::ACCENT).bold(),
        message.with(colors::TEXT)
    );
}

// ─── Sections ────────────────────────────────────────────────────────────────

pub fn print_section_header(title: &str) {
    let title_width = title.width();
    let left = SECTION_WIDTH.saturating_sub(title_width + 2) / 2;
    let right = SECTION_WIDTH.saturating_sub(title_width + 2 + left);

    println!();
    println!(
        "{}{} {} {}{}",
        "╭".with(colors::ACCENT),
        "─".repeat(left).with(colors::ACCENT),
        title.with(colors::ACCENT).bold().attribute(Attribute::Italic),
        "─".repeat(right).with(colors::ACCENT),
        "╮".with(colors::ACCENT)
    );
}

pub fn print_section_footer() {
    println!(
        "{}{}{}",
        "╰".with(colors::ACCENT),
        "─".repeat(SECTION_WIDTH + 2).with(colors::ACCENT),
        "╯".with(colors::ACCENT)
    );
    println!();
}

pub fn print_key_value(key: &str, value: &str) {
    println!(
        "  {} {} {}",
        "●".with(colors::ACCENT),
        format!("{}:", key).with(colors::MUTED),
        value.with(colors::TEXT)
    );
}

/// Key-value line whose value is colored by `good`.
pub fn print_key_flag(key: &str, value: &str, good: bool) {
    let color = if good { colors::OK } else { colors::WARN };
    println!(
        "  {} {} {}",
        "●".with(colors::ACCENT),
        format!("{}:", key).with(colors::MUTED),
        value.with(color).bold()
    );
}

pub fn print_list_item(item: &str, color: CtColor) {
    println!("  {}  {}", "▶".with(color), item.with(color));
}

pub fn print_empty_list(message: &str) {
    println!(
        "  {} {}",
        "○".with(colors::MUTED),
        message.with(colors::MUTED).attribute(Attribute::Italic)
    );
}

// ─── Tables ──────────────────────────────────────────────────────────────────

/// Cells longer than [`MAX_CELL_WIDTH`] are cut with an ellipsis.
pub struct TableBuilder {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
    col_widths: Vec<usize>,
}

impl TableBuilder {
    pub fn new(headers: &[&str]) -> Self {
        TableBuilder {
            col_widths: headers.iter().map(|h| h.width()).collect(),
            headers: headers.iter().map(|h| h.to_string()).collect(),
            rows: Vec::new(),
        }
    }

    pub fn add_row(&mut self, row: Vec<String>) {
        let row: Vec<String> = row.into_iter().map(truncate).collect();
        for (i, cell) in row.iter().enumerate() {
            if let Some(width) = self.col_widths.get_mut(i) {
                *width = (*width).max(cell.width());
            }
        }
        self.rows.push(row);
    }

    fn border(&self, left: &str, join: &str, right: &str) -> String {
        let inner: Vec<String> = self
            .col_widths
            .iter()
            .map(|w| "─".repeat(w + 2))
            .collect();
        format!("{}{}{}", left, inner.join(join), right)
    }

    fn print_row(&self, cells: &[String], header: bool) {
        print!("{}", "│".with(colors::ACCENT));
        for (i, width) in self.col_widths.iter().enumerate() {
            let cell = cells.get(i).map(String::as_str).unwrap_or("");
            let padding = " ".repeat(width.saturating_sub(cell.width()));
            if header {
                print!(" {}{} ", cell.with(colors::ACCENT).bold(), padding);
            } else {
                print!(" {}{} ", cell.with(colors::TEXT), padding);
            }
            print!("{}", "│".with(colors::ACCENT));
        }
        println!();
    }

    pub fn print(&self) {
        println!("{}", self.border("╭", "┬", "╮").with(colors::ACCENT));
        self.print_row(&self.headers, true);
        println!("{}", self.border("├", "┼", "┤").with(colors::ACCENT));
        for row in &self.rows {
            self.print_row(row, false);
        }
        println!("{}", self.border("╰", "┴", "╯").with(colors::ACCENT));
    }
}

fn truncate(cell: String) -> String {
    if cell.width() <= MAX_CELL_WIDTH {
        return cell;
    }
    let mut out = String::new();
    for c in cell.chars() {
        if out.width() + 1 >= MAX_CELL_WIDTH {
            break;
        }
        out.push(c);
    }
    out.push('…');
    out
}

use std::collections::BTreeSet;

use anyhow::Result;
use clap::ValueEnum;
use colored::{Color, Colorize};
use comfy_table::{Attribute, Cell, Color as TableColor, Table};
use nestql::Response;
use serde_json::Value;

use crate::theme::{GLYPH_ARROW, GLYPH_BULLET, GLYPH_FAIL, GLYPH_NOTE, GLYPH_OK, GLYPH_WARN, PALETTE};

/// How response bodies are printed.
#[derive(Clone, Debug, ValueEnum, Default, PartialEq)]
pub enum OutputFormat {
    /// Collections as tables, entities as field/value tables
    #[default]
    Table,
    /// Pretty-printed JSON body
    Json,
    /// JSON body on one line
    Compact,
}

#[derive(Clone, Debug, Default)]
pub struct GlobalOptions {
    pub output_format: OutputFormat,
    pub quiet: bool,
    pub verbose: bool,
    pub no_color: bool,
}

pub struct OutputManager {
    pub options: GlobalOptions,
}

impl OutputManager {
    pub fn new(options: GlobalOptions) -> Self {
        Self { options }
    }

    /// Prints an engine response body in the configured format.
    pub fn display_response(&self, response: &Response) -> Result<()> {
        if !response.allow.is_empty() {
            let allow: Vec<&str> = response.allow.iter().map(|method| method.as_str()).collect();
            self.key_value("Allow", &allow.join(", "));
        }
        if self.options.quiet {
            return Ok(());
        }
        match self.options.output_format {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&response.body)?),
            OutputFormat::Compact => println!("{}", serde_json::to_string(&response.body)?),
            OutputFormat::Table => self.display_table(&response.body),
        }
        Ok(())
    }

    fn display_table(&self, body: &Value) {
        match body {
            Value::Object(object) if object.get("items").is_some_and(Value::is_array) => {
                let items = object.get("items").and_then(Value::as_array).map_or(&[][..], Vec::as_slice);
                println!("{}", self.rows_table(items));
                if let Some(pagination) = object.get("pagination") {
                    self.info(&format!(
                        "page {} of {} ({} available)",
                        pagination["current_page"], pagination["last_page"], pagination["resources_available"]
                    ));
                }
            }
            Value::Object(object) => {
                let mut table = self.create_table();
                self.add_table_header(&mut table, vec!["Field", "Value"]);
                for (key, value) in object {
                    table.add_row(vec![Cell::new(key), Cell::new(cell_text(value))]);
                }
                println!("{table}");
            }
            Value::Array(items) => println!("{}", self.rows_table(items)),
            other => println!("{}", cell_text(other)),
        }
    }

    /// One row per item; columns are the union of the items' keys.
    fn rows_table(&self, items: &[Value]) -> Table {
        let mut table = self.create_table();
        if items.is_empty() {
            table.add_row(vec![Cell::new("No items found")]);
            return table;
        }
        let columns: BTreeSet<&str> = items
            .iter()
            .filter_map(Value::as_object)
            .flat_map(|object| object.keys().map(String::as_str))
            .collect();
        self.add_table_header(&mut table, columns.iter().copied().collect());
        for item in items {
            table.add_row(
                columns
                    .iter()
                    .map(|column| Cell::new(item.get(*column).map(cell_text).unwrap_or_default()))
                    .collect::<Vec<_>>(),
            );
        }
        table
    }

    /// `GET /albums → 200`, colored by status class.
    pub fn status(&self, method: &str, path: &str, status: u16) {
        if self.options.quiet {
            return;
        }
        let code = status.to_string();
        let code = if self.options.no_color {
            code.normal()
        } else {
            code.color(PALETTE.for_status(status)).bold()
        };
        println!("{method} {path} {GLYPH_ARROW} {code}");
    }

    pub fn success(&self, message: &str) {
        self.emit(Level::Success, message);
    }

    pub fn error(&self, message: &str) {
        self.emit(Level::Error, message);
    }

    pub fn warning(&self, message: &str) {
        self.emit(Level::Warning, message);
    }

    pub fn info(&self, message: &str) {
        self.emit(Level::Info, message);
    }

    /// Only shown with `--verbose`.
    pub fn verbose(&self, message: &str) {
        if self.options.verbose {
            self.emit(Level::Trace, message);
        }
    }

    /// One line tagged with the level's glyph. Errors and traces go to stderr
    /// and errors survive `--quiet`.
    fn emit(&self, level: Level, message: &str) {
        if self.options.quiet && level != Level::Error {
            return;
        }
        let (glyph, color) = level.style();
        let line = if self.options.no_color {
            format!("{glyph} {message}")
        } else {
            format!("{} {}", glyph.color(color), message.color(color))
        };
        match level {
            Level::Error | Level::Trace => eprintln!("{line}"),
            _ => println!("{line}"),
        }
    }

    pub fn heading(&self, text: &str) {
        if self.options.quiet {
            return;
        }
        if self.options.no_color {
            println!("\n{text}\n{}", "-".repeat(text.chars().count()));
        } else {
            println!("\n{}", text.color(PALETTE.heading).bold());
        }
    }

    pub fn key_value(&self, key: &str, value: &str) {
        if self.options.quiet {
            return;
        }
        if self.options.no_color {
            println!("{key}: {value}");
        } else {
            println!("{}: {}", key.color(PALETTE.key).bold(), value.color(PALETTE.value));
        }
    }

    pub fn bullet(&self, text: &str) {
        if !self.options.quiet {
            let glyph = if self.options.no_color {
                GLYPH_BULLET.normal()
            } else {
                GLYPH_BULLET.color(PALETTE.faint)
            };
            println!("  {glyph} {text}");
        }
    }

    pub fn create_table(&self) -> Table {
        let mut table = Table::new();
        table.load_preset(if self.options.no_color {
            comfy_table::presets::ASCII_FULL
        } else {
            comfy_table::presets::UTF8_FULL_CONDENSED
        });
        table
    }

    pub fn add_table_header(&self, table: &mut Table, headers: Vec<&str>) {
        let color = !self.options.no_color;
        table.set_header(headers.into_iter().map(|header| {
            let cell = Cell::new(header).add_attribute(Attribute::Bold);
            if color { cell.fg(TableColor::Cyan) } else { cell }
        }));
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Level {
    Success,
    Error,
    Warning,
    Info,
    Trace,
}

impl Level {
    fn style(self) -> (&'static str, Color) {
        let palette = &*PALETTE;
        match self {
            Level::Success => (GLYPH_OK, palette.ok),
            Level::Error => (GLYPH_FAIL, palette.server_error),
            Level::Warning => (GLYPH_WARN, palette.client_error),
            Level::Info => (GLYPH_NOTE, palette.note),
            Level::Trace => (GLYPH_ARROW, palette.faint),
        }
    }
}

/// Scalars print bare; nested values print as compact JSON.
fn cell_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        Value::Array(_) | Value::Object(_) => serde_json::to_string(value).unwrap_or_default(),
        other => other.to_string(),
    }
}

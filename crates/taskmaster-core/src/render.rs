use std::io::{self, IsTerminal, Write};

use anyhow::anyhow;
use unicode_width::UnicodeWidthStr;

use crate::config::Config;
use crate::engine::ReconciliationEngine;
use crate::preference::RootMarker;
use crate::task::{Identity, Task};
use crate::view::Screen;

/// ANSI codes for one theme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Palette {
    title: &'static str,
    /// Row accents, cycled by list position.
    rows: [&'static str; 4],
    done_mark: &'static str,
    open_mark: &'static str,
    completed_text: &'static str,
    notice: &'static str,
}

const LIGHT: Palette = Palette {
    title: "1;35",
    rows: ["35", "34", "36", "33"],
    done_mark: "32",
    open_mark: "90",
    completed_text: "2;9",
    notice: "33",
};

const DARK: Palette = Palette {
    title: "1;95",
    rows: ["95", "94", "96", "93"],
    done_mark: "92",
    open_mark: "37",
    completed_text: "90;9",
    notice: "93",
};

impl Palette {
    fn row_accent(&self, index: usize) -> &'static str {
        self.rows[index % self.rows.len()]
    }
}

#[derive(Debug, Clone)]
pub struct Renderer {
    ansi: bool,
    theme: RootMarker,
}

impl Renderer {
    pub fn new(cfg: &Config, theme: RootMarker) -> anyhow::Result<Self> {
        let color_cfg = cfg.get("color").unwrap_or_else(|| "on".to_string());
        let color = match color_cfg.to_ascii_lowercase().as_str() {
            "on" | "yes" | "true" | "1" => true,
            "off" | "no" | "false" | "0" => false,
            other => return Err(anyhow!("invalid color setting: {other}")),
        };

        Ok(Self {
            ansi: color && io::stdout().is_terminal(),
            theme,
        })
    }

    fn palette(&self) -> Palette {
        if self.theme.is_dark() { DARK } else { LIGHT }
    }

    #[tracing::instrument(skip(self, tasks), fields(count = tasks.len()))]
    pub fn print_task_table(
        &self,
        identity: Option<&Identity>,
        tasks: &[Task],
        stale: Option<&str>,
    ) -> anyhow::Result<()> {
        let out = io::stdout().lock();
        self.write_task_table(out, identity, tasks, stale)
    }

    pub fn write_task_table<W: Write>(
        &self,
        mut out: W,
        identity: Option<&Identity>,
        tasks: &[Task],
        stale: Option<&str>,
    ) -> anyhow::Result<()> {
        let palette = self.palette();
        let title = match identity {
            Some(identity) => format!("TaskMaster · {}", identity.label()),
            None => "TaskMaster".to_string(),
        };
        writeln!(out, "{}", self.paint(&title, palette.title))?;

        if let Some(reason) = stale {
            writeln!(
                out,
                "{}",
                self.paint(&format!("list may be out of date: {reason}"), palette.notice)
            )?;
        }

        if tasks.is_empty() {
            writeln!(out, "no tasks yet")?;
            return Ok(());
        }

        let headers = vec!["#".to_string(), "Done".to_string(), "Task".to_string()];
        let rows = tasks
            .iter()
            .enumerate()
            .map(|(index, task)| {
                let mark = if task.completed {
                    self.paint("[x]", palette.done_mark)
                } else {
                    self.paint("[ ]", palette.open_mark)
                };
                let text = if task.completed {
                    self.paint(&task.text, palette.completed_text)
                } else {
                    task.text.clone()
                };
                vec![
                    self.paint(&(index + 1).to_string(), palette.row_accent(index)),
                    mark,
                    text,
                ]
            })
            .collect();

        write_table(&mut out, headers, rows)?;
        Ok(())
    }

    pub fn print_notice(&self, message: &str) -> anyhow::Result<()> {
        let mut out = io::stdout().lock();
        writeln!(out, "{}", self.paint(message, self.palette().notice))?;
        Ok(())
    }

    fn paint(&self, text: &str, code: &str) -> String {
        if !self.ansi {
            return text.to_string();
        }
        format!("\x1b[{code}m{text}\x1b[0m")
    }
}

/// Renders the task view to stdout.
pub struct TerminalScreen {
    renderer: Renderer,
}

impl TerminalScreen {
    pub fn new(renderer: Renderer) -> Self {
        Self { renderer }
    }
}

impl Screen for TerminalScreen {
    fn redraw(&mut self, engine: &ReconciliationEngine) -> anyhow::Result<()> {
        self.renderer
            .print_task_table(engine.identity(), engine.tasks(), engine.last_error())
    }

    fn notice(&mut self, message: &str) -> anyhow::Result<()> {
        self.renderer.print_notice(message)
    }
}

fn write_table<W: Write>(
    mut writer: W,
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
) -> anyhow::Result<()> {
    let column_count = headers.len();
    let mut widths = vec![0usize; column_count];

    for (idx, header) in headers.iter().enumerate() {
        widths[idx] = widths[idx].max(UnicodeWidthStr::width(header.as_str()));
    }

    for row in &rows {
        for (idx, cell) in row.iter().enumerate() {
            widths[idx] = widths[idx].max(UnicodeWidthStr::width(strip_ansi(cell).as_str()));
        }
    }

    for idx in 0..column_count {
        write!(writer, "{:width$} ", headers[idx], width = widths[idx])?;
    }
    writeln!(writer)?;

    for idx in 0..column_count {
        write!(writer, "{:-<width$} ", "", width = widths[idx])?;
    }
    writeln!(writer)?;

    for row in rows {
        for idx in 0..column_count {
            let cell = &row[idx];
            let visible_width = UnicodeWidthStr::width(strip_ansi(cell).as_str());
            let padding = widths[idx].saturating_sub(visible_width);
            write!(writer, "{}{} ", cell, " ".repeat(padding))?;
        }
        writeln!(writer)?;
    }

    Ok(())
}

fn strip_ansi(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut escaped = false;

    for ch in s.chars() {
        if escaped {
            if ch == 'm' {
                escaped = false;
            }
            continue;
        }

        if ch == '\x1b' {
            escaped = true;
            continue;
        }

        out.push(ch);
    }

    out
}

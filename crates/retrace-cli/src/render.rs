use std::io::IsTerminal;
use std::path::Path;
use std::time::{Duration, Instant};

use anstyle::{AnsiColor, Effects, Style};
use indicatif::{HumanCount, ProgressBar, ProgressStyle};

const EXTRACT_TEMPLATE: &str = "{spinner:.cyan.bold} [{bar:20.cyan/blue}] {pos:>4}/{len:4} {wide_msg}";

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum OutputStyle {
    Plain,
    Rich,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum Status {
    Ok,
    Step,
    Warn,
    Error,
}

impl Status {
    fn badge(self) -> &'static str {
        match self {
            Self::Ok => "[OK]",
            Self::Step => "[..]",
            Self::Warn => "[WARN]",
            Self::Error => "[ERR]",
        }
    }
}

pub(crate) fn resolve_output_style(stdout_is_tty: bool, no_color: bool) -> OutputStyle {
    if stdout_is_tty && !no_color {
        OutputStyle::Rich
    } else {
        OutputStyle::Plain
    }
}

pub(crate) fn current_output_style() -> OutputStyle {
    let no_color = std::env::var_os("NO_COLOR").is_some_and(|value| !value.is_empty());
    resolve_output_style(std::io::stdout().is_terminal(), no_color)
}

pub(crate) fn render_status_line(style: OutputStyle, status: Status, message: &str) -> String {
    match style {
        OutputStyle::Plain => message.to_string(),
        OutputStyle::Rich => format!("{} {message}", status.badge()),
    }
}

pub(crate) fn render_warning_line(style: OutputStyle, message: &str) -> String {
    match style {
        OutputStyle::Plain => format!("warning: {message}"),
        OutputStyle::Rich => render_status_line(style, Status::Warn, message),
    }
}

pub(crate) fn render_error_line(style: OutputStyle, message: &str) -> String {
    match style {
        OutputStyle::Plain => format!("error: {message}"),
        OutputStyle::Rich => render_status_line(style, Status::Error, message),
    }
}

/// Summary printed once extraction finishes; plain output stays silent.
pub(crate) fn render_extraction_summary(
    style: OutputStyle,
    extracted: u64,
    total: u64,
    elapsed: Duration,
) -> Option<String> {
    if style == OutputStyle::Plain {
        return None;
    }
    let label = paint(
        Style::new()
            .fg_color(Some(AnsiColor::BrightCyan.into()))
            .effects(Effects::BOLD),
        "extracted",
    );
    Some(format!(
        "{label} {}/{} files in {}.{:03}s",
        HumanCount(extracted),
        HumanCount(total),
        elapsed.as_secs(),
        elapsed.subsec_millis()
    ))
}

fn paint(style: Style, text: &str) -> String {
    format!("{}{text}{}", style.render(), style.render_reset())
}

#[derive(Copy, Clone, Debug)]
pub(crate) struct Console {
    style: OutputStyle,
}

impl Console {
    pub(crate) fn new(style: OutputStyle) -> Self {
        Self { style }
    }

    pub(crate) fn status(self, status: Status, message: &str) {
        println!("{}", render_status_line(self.style, status, message));
    }

    pub(crate) fn heading(self, title: &str) {
        if self.style == OutputStyle::Rich {
            let heading = Style::new()
                .fg_color(Some(AnsiColor::BrightBlue.into()))
                .effects(Effects::BOLD);
            println!();
            println!("{}", paint(heading, &format!("== {title} ==")));
        }
    }

    pub(crate) fn lines(self, lines: &[String]) {
        for line in lines {
            println!("{line}");
        }
    }

    pub(crate) fn extraction(self, total: u64) -> ExtractionProgress {
        let bar = (self.style == OutputStyle::Rich).then(|| {
            let bar = ProgressBar::new(total.max(1));
            if let Ok(template) = ProgressStyle::with_template(EXTRACT_TEMPLATE) {
                bar.set_style(template.tick_chars(".oO@* ").progress_chars("=>-"));
            }
            bar.enable_steady_tick(Duration::from_millis(80));
            bar
        });
        ExtractionProgress {
            style: self.style,
            bar,
            extracted: 0,
            total,
            started_at: Instant::now(),
        }
    }
}

pub(crate) struct ExtractionProgress {
    style: OutputStyle,
    bar: Option<ProgressBar>,
    extracted: u64,
    total: u64,
    started_at: Instant,
}

impl ExtractionProgress {
    pub(crate) fn advance(&mut self, rel_path: &Path) {
        self.extracted = (self.extracted + 1).min(self.total);
        if let Some(bar) = &self.bar {
            bar.set_position(self.extracted);
            bar.set_message(rel_path.display().to_string());
        }
    }

    pub(crate) fn complete(mut self) {
        if let Some(bar) = self.bar.take() {
            bar.finish_and_clear();
            if let Some(line) = render_extraction_summary(
                self.style,
                self.extracted,
                self.total,
                self.started_at.elapsed(),
            ) {
                println!("{line}");
            }
        }
    }

    pub(crate) fn abandon(mut self) {
        if let Some(bar) = self.bar.take() {
            bar.abandon();
        }
    }
}

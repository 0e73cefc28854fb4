//! Formatting of supervised task output.
//!
//! Each line a task prints is echoed to stdout behind a `[name]` prefix. The
//! prefix can be templated, padded, coloured and timestamped.

use std::time::Instant;

use strip_ansi_escapes::strip;

/// Indicates the source stream of a log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// Prefix settings shared by every task.
#[derive(Debug, Clone, Default)]
pub struct PrefixStyle {
    /// Template such as `[{name}]`; supports `{name}`, `{index}` and `{time}`.
    pub template: Option<String>,
    /// Pad or truncate the prefix to this many bytes.
    pub length: Option<usize>,
    pub colors: bool,
    pub timestamp: bool,
}

/// Prints task output with per-task prefixes.
#[derive(Debug)]
pub struct OutputPrinter {
    style: PrefixStyle,
    names: Vec<String>,
    colors: Vec<Option<String>>,
    start: Instant,
}

impl OutputPrinter {
    /// `tasks` holds `(name, color)` pairs indexed by task id.
    pub fn new(tasks: Vec<(String, Option<String>)>, style: PrefixStyle) -> Self {
        let (names, colors) = tasks.into_iter().unzip();
        Self {
            style,
            names,
            colors,
            start: Instant::now(),
        }
    }

    pub fn print_line(&self, id: usize, line: &str, stream: StreamKind) {
        let output = self.format_line(id, line);
        match stream {
            StreamKind::Stdout => println!("{}", output),
            StreamKind::Stderr => eprintln!("{}", output),
        }
    }

    pub fn format_line(&self, id: usize, line: &str) -> String {
        let name = self.names.get(id).map(String::as_str).unwrap_or("task");
        let cleaned = strip_existing_prefix(name, line);
        let mut prefix = self.format_prefix(name, id, &self.elapsed());
        if self.style.colors {
            let color = self.colors.get(id).and_then(|c| c.as_deref());
            prefix = apply_color(&prefix, color);
        }
        format!("{}{}", prefix, cleaned)
    }

    fn format_prefix(&self, name: &str, index: usize, elapsed: &str) -> String {
        let mut prefix = if let Some(template) = self.style.template.as_deref() {
            let rendered = render_template(template, name, index, elapsed);
            if self.style.timestamp && !template.contains("{time}") {
                format!("{} {}", elapsed, rendered)
            } else {
                rendered
            }
        } else if self.style.timestamp {
            format!("{} [{}]", elapsed, name)
        } else {
            format!("[{}]", name)
        };
        prefix = apply_prefix_length(prefix, self.style.length);
        if !prefix.is_empty() {
            prefix.push(' ');
        }
        prefix
    }

    fn elapsed(&self) -> String {
        let secs = self.start.elapsed().as_secs();
        format!("{:02}:{:02}", secs / 60, secs % 60)
    }
}

/// Removes ANSI escape codes when `strip_ansi` is set. Invalid UTF-8 is replaced.
pub fn sanitize_text(text: &str, strip_ansi: bool) -> String {
    if !strip_ansi {
        return text.to_string();
    }
    let stripped = strip(text.as_bytes());
    String::from_utf8_lossy(&stripped).to_string()
}

fn render_template(template: &str, name: &str, index: usize, time: &str) -> String {
    template
        .replace("{name}", name)
        .replace("{index}", &index.to_string())
        .replace("{time}", time)
}

fn apply_prefix_length(prefix: String, length: Option<usize>) -> String {
    let Some(length) = length else { return prefix };
    let mut out = prefix;
    if out.len() > length {
        let mut cut = length;
        while !out.is_char_boundary(cut) {
            cut -= 1;
        }
        out.truncate(cut);
    } else if out.len() < length {
        out.push_str(&" ".repeat(length - out.len()));
    }
    out
}

pub fn apply_color(prefix: &str, color: Option<&str>) -> String {
    let code = match color.unwrap_or("").to_lowercase().as_str() {
        "black" => "30",
        "red" => "31",
        "green" => "32",
        "yellow" => "33",
        "blue" => "34",
        "magenta" => "35",
        "cyan" => "36",
        "gray" | "grey" => "90",
        _ => "0",
    };
    if code == "0" {
        prefix.to_string()
    } else {
        format!("\u{1b}[{}m{}\u{1b}[0m", code, prefix)
    }
}

// Some tools tag lines with their own name; avoid "[styles] [styles] ...".
fn strip_existing_prefix(name: &str, text: &str) -> String {
    let candidates = [
        format!("[{}] ", name),
        format!("[{}]", name),
        format!("{}: ", name),
        format!("{} - ", name),
    ];
    for candidate in candidates {
        if let Some(rest) = text.strip_prefix(&candidate) {
            return rest.trim_start().to_string();
        }
    }
    text.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn printer(style: PrefixStyle) -> OutputPrinter {
        OutputPrinter::new(
            vec![
                ("backend".to_string(), Some("cyan".to_string())),
                ("styles".to_string(), None),
            ],
            style,
        )
    }

    #[test]
    fn default_prefix_uses_task_name() {
        let printer = printer(PrefixStyle::default());
        assert_eq!(printer.format_line(1, "compiled"), "[styles] compiled");
    }

    #[test]
    fn existing_prefix_is_not_repeated() {
        let printer = printer(PrefixStyle::default());
        assert_eq!(
            printer.format_line(0, "[backend] restarting"),
            "[backend] restarting"
        );
        assert_eq!(
            printer.format_line(1, "styles: compiled"),
            "[styles] compiled"
        );
        assert_eq!(
            printer.format_line(0, "[nodemon] restarting"),
            "[backend] [nodemon] restarting"
        );
    }

    #[test]
    fn template_and_length_are_applied() {
        let printer = printer(PrefixStyle {
            template: Some("{index}:{name}".to_string()),
            length: Some(6),
            ..PrefixStyle::default()
        });
        assert_eq!(printer.format_line(0, "x"), "0:back x");
        assert_eq!(printer.format_line(1, "x"), "1:styl x");
    }

    #[test]
    fn colors_wrap_prefix() {
        let printer = printer(PrefixStyle {
            colors: true,
            ..PrefixStyle::default()
        });
        assert_eq!(
            printer.format_line(0, "up"),
            "\u{1b}[36m[backend] \u{1b}[0mup"
        );
        assert_eq!(printer.format_line(1, "up"), "[styles] up");
    }

    #[test]
    fn sanitize_strips_ansi() {
        assert_eq!(sanitize_text("\u{1b}[31merror\u{1b}[0m", true), "error");
        assert_eq!(sanitize_text("plain", false), "plain");
    }
}

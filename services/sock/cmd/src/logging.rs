use std::fmt;
use std::io::IsTerminal;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::{format::Writer, FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;

const COLOR_RESET: &str = "\x1b[0m";
const COLOR_CYAN: &str = "\x1b[36m";
const COLOR_GREEN: &str = "\x1b[32m";
const COLOR_BRIGHT_YELLOW: &str = "\x1b[93m";
const COLOR_BRIGHT_RED: &str = "\x1b[91m";
const COLOR_BRIGHT_GRAY: &str = "\x1b[90m";

/// Column widths for alignment
const SERVICE_NAME_WIDTH: usize = 16;
const LOG_LEVEL_WIDTH: usize = 9;

/// Formats events as `[timestamp] [service] [level] message key=value...`
pub struct SockLogFormatter {
    service_name: String,
    color_enabled: bool,
}

/// Log with a `component` field, rendered as `sock-<component>` in the service column
#[macro_export]
macro_rules! component_info {
    ($component:expr, $($arg:tt)*) => {
        tracing::info!(component = $component, $($arg)*)
    };
}

#[macro_export]
macro_rules! component_warn {
    ($component:expr, $($arg:tt)*) => {
        tracing::warn!(component = $component, $($arg)*)
    };
}

#[macro_export]
macro_rules! component_error {
    ($component:expr, $($arg:tt)*) => {
        tracing::error!(component = $component, $($arg)*)
    };
}

impl SockLogFormatter {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            color_enabled: colors_supported(),
        }
    }

    fn format_service_name(&self, component: Option<&str>) -> String {
        let name = match component {
            Some(comp) => format!("{}-{}", self.service_name, comp),
            None => self.service_name.clone(),
        };

        if name.chars().count() > SERVICE_NAME_WIDTH {
            let truncated: String = name.chars().take(SERVICE_NAME_WIDTH - 1).collect();
            format!("{}…", truncated)
        } else {
            format!("{:<width$}", name, width = SERVICE_NAME_WIDTH)
        }
    }

    fn format_log_level(&self, level: &Level) -> String {
        let level_str = match *level {
            Level::ERROR => "✗ ERROR",
            Level::WARN => "⚠ WARN",
            Level::INFO => "ℹ INFO",
            Level::DEBUG => "◦ DEBUG",
            Level::TRACE => "◦ TRACE",
        };

        format!("{:<width$}", level_str, width = LOG_LEVEL_WIDTH)
    }

    fn color_for_level(&self, level: &Level) -> &'static str {
        if !self.color_enabled {
            return "";
        }

        match *level {
            Level::ERROR => COLOR_BRIGHT_RED,
            Level::WARN => COLOR_BRIGHT_YELLOW,
            Level::INFO => COLOR_GREEN,
            Level::DEBUG | Level::TRACE => COLOR_BRIGHT_GRAY,
        }
    }
}

impl<S, N> FormatEvent<S, N> for SockLogFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        let level = event.metadata().level();

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        let color = self.color_for_level(level);
        let (reset, cyan) = if self.color_enabled {
            (COLOR_RESET, COLOR_CYAN)
        } else {
            ("", "")
        };

        write!(
            writer,
            "{}[{}] [{}] [{}{}{}] ",
            cyan,
            timestamp,
            self.format_service_name(visitor.component.as_deref()),
            color,
            self.format_log_level(level),
            reset
        )?;
        write!(writer, "{}", visitor.message)?;
        for (name, value) in &visitor.fields {
            write!(writer, " {}={}", name, value)?;
        }
        writeln!(writer, "{}", reset)
    }
}

/// Collects the message, the component and any other structured fields
#[derive(Default)]
struct FieldVisitor {
    message: String,
    component: Option<String>,
    fields: Vec<(&'static str, String)>,
}

impl tracing::field::Visit for FieldVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn fmt::Debug) {
        let rendered = format!("{:?}", value);
        let unquoted = rendered
            .strip_prefix('"')
            .and_then(|s| s.strip_suffix('"'))
            .map(str::to_string)
            .unwrap_or(rendered);
        self.record_str(field, &unquoted);
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        match field.name() {
            "message" => self.message = value.to_string(),
            "component" => self.component = Some(value.to_string()),
            name => self.fields.push((name, value.to_string())),
        }
    }
}

/// Colors only when stderr is a terminal that is not `dumb`
fn colors_supported() -> bool {
    if std::env::var("TERM").unwrap_or_default() == "dumb" {
        return false;
    }
    std::io::stderr().is_terminal()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain(name: &str) -> SockLogFormatter {
        SockLogFormatter {
            service_name: name.to_string(),
            color_enabled: false,
        }
    }

    #[test]
    fn test_service_column_is_padded() {
        let formatter = plain("sock");
        let column = formatter.format_service_name(None);
        assert_eq!(column.len(), SERVICE_NAME_WIDTH);
        assert!(column.starts_with("sock "));
        assert!(formatter
            .format_service_name(Some("cli"))
            .starts_with("sock-cli"));
    }

    #[test]
    fn test_long_service_name_is_truncated() {
        let formatter = plain("sock");
        let column = formatter.format_service_name(Some("a-very-long-component"));
        assert_eq!(column.chars().count(), SERVICE_NAME_WIDTH);
        assert!(column.ends_with('…'));
    }

    #[test]
    fn test_no_colors_when_disabled() {
        let formatter = plain("sock");
        assert_eq!(formatter.color_for_level(&Level::ERROR), "");
        assert!(formatter.format_log_level(&Level::WARN).contains("WARN"));
    }
}

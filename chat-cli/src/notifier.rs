//! Terminal notifications.

use chat_session::{NotificationLevel, Notifier};
use console::style;

/// Prints notifications to stderr, colored by severity.
#[derive(Debug, Default)]
pub struct ConsoleNotifier;

impl ConsoleNotifier {
    /// The line printed for a notification, without styling.
    pub fn format(level: NotificationLevel, message: &str) -> String {
        let label = match level {
            NotificationLevel::Info => "info",
            NotificationLevel::Warning => "warning",
            NotificationLevel::Error => "error",
        };
        format!("{}: {}", label, message)
    }
}

impl Notifier for ConsoleNotifier {
    fn notify(&self, level: NotificationLevel, message: &str) {
        let line = Self::format(level, message);
        let styled = match level {
            NotificationLevel::Info => style(line).dim(),
            NotificationLevel::Warning => style(line).yellow(),
            NotificationLevel::Error => style(line).red().bold(),
        };
        eprintln!("{}", styled);
    }
}

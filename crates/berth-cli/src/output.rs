//! Formatted output helpers for CLI commands.

use std::io::Write;

use berth_core::stream::{ContainerEvent, SessionEvent};

pub const BOLD: &str = "\x1b[1m";
pub const DIM: &str = "\x1b[2m";
pub const GREEN: &str = "\x1b[32m";
pub const RED: &str = "\x1b[31m";
pub const RESET: &str = "\x1b[0m";

/// Human-readable size of a pushed manifest or layer.
#[allow(clippy::cast_precision_loss)]
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["KiB", "MiB", "GiB", "TiB"];
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.1} {}", UNITS[unit])
}

/// Renders one stream event as a terminal line, `None` when it has no text.
pub fn render_event(item: &SessionEvent, multi_source: bool) -> Option<String> {
    let label = if multi_source {
        format!("{DIM}[{}]{RESET} ", item.source)
    } else {
        String::new()
    };
    match &item.event {
        ContainerEvent::Progress { message } if !message.trim().is_empty() => {
            Some(format!("{label}{}", message.trim_end()))
        }
        ContainerEvent::Error { message } => Some(format!("{label}{RED}error:{RESET} {message}")),
        _ => None,
    }
}

/// Writes a line to stdout, ignoring closed pipes.
pub fn line(text: &str) {
    let mut out = std::io::stdout().lock();
    let _ = writeln!(out, "{text}");
}

#[cfg(test)]
mod tests {
    use berth_common::types::ImageId;
    use berth_core::stream::Metadata;

    use super::*;

    fn event(source: &str, event: ContainerEvent) -> SessionEvent {
        SessionEvent {
            source: source.into(),
            event,
        }
    }

    #[test]
    fn sizes_scale_to_the_largest_whole_unit() {
        assert_eq!(format_bytes(528), "528 B");
        assert_eq!(format_bytes(1570), "1.5 KiB");
        assert_eq!(format_bytes(30 * 1024 * 1024), "30.0 MiB");
    }

    #[test]
    fn progress_is_trimmed_and_labelled_for_fan_in() {
        let e = event("ghcr.io/a:1", ContainerEvent::Progress { message: "Pushed\n".into() });
        assert_eq!(render_event(&e, false).as_deref(), Some("Pushed"));
        let labelled = render_event(&e, true).expect("line");
        assert!(labelled.contains("[ghcr.io/a:1]"));
        assert!(labelled.ends_with("Pushed"));
    }

    #[test]
    fn silent_events_render_nothing() {
        let blank = event("build", ContainerEvent::Progress { message: "\n".into() });
        assert!(render_event(&blank, false).is_none());
        let meta = event("build", ContainerEvent::Metadata(Metadata::ImageId(ImageId::new("sha256:1"))));
        assert!(render_event(&meta, false).is_none());
        assert!(render_event(&event("build", ContainerEvent::EndOfSubStream), false).is_none());
    }
}

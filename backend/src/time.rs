use std::time::{SystemTime, UNIX_EPOCH};

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Renders a millisecond duration as "1 hr 2 mins 3 secs".
/// Sub-second durations render as "0 sec".
pub fn humanize_ms(ms: f64) -> String {
    let total_secs = if ms.is_finite() && ms > 0.0 {
        (ms / 1000.0).floor() as u64
    } else {
        0
    };

    let hours = total_secs / 3600;
    let minutes = (total_secs / 60) % 60;
    let seconds = total_secs % 60;

    let mut out = unit(seconds, "sec");
    if minutes > 0 {
        out = format!("{} {out}", unit(minutes, "min"));
    }
    if hours > 0 {
        out = format!("{} {out}", unit(hours, "hr"));
    }
    out
}

fn unit(value: u64, label: &str) -> String {
    if value > 1 {
        format!("{value} {label}s")
    } else {
        format!("{value} {label}")
    }
}

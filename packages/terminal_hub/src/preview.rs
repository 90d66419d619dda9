//! Dev-server URL detection on raw terminal output.

use regex::Regex;
use std::sync::LazyLock;

static ANSI_CSI: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1b\[[0-9;]*[A-Za-z]").expect("valid ANSI pattern"));

static LOCALHOST_URL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"http://localhost:(\d+)").expect("valid URL pattern"));

/// Find the first `http://localhost:<port>` announced in `raw`.
///
/// Colour and cursor escapes are stripped first, since dev servers tend to
/// bold the URL or its port. Numbers that are not a usable TCP port (0, or
/// above 65535) are skipped.
pub fn detect_port(raw: &str) -> Option<u16> {
    let cleaned = ANSI_CSI.replace_all(raw, "");
    LOCALHOST_URL
        .captures_iter(&cleaned)
        .filter_map(|caps| caps[1].parse::<u16>().ok())
        .find(|port| *port != 0)
}

//! Resource discovery behind `find_resources`.
//!
//! A VISA find expression (a glob with `*` and `?`) is dispatched to up to
//! three sub-discoverers — mDNS DNS-SD for LAN instruments, USB
//! enumeration for USBTMC devices, and a serial-port scan. Results are
//! unioned, de-duplicated by exact resource string, filtered against the
//! full expression, and capped.

use tracing::debug;

use crate::resource::starts_with_ci;

mod mdns;
mod serial_ports;
mod usb;

/// Hard limit on descriptors per find list.
pub(crate) const MAX_RESULTS: usize = 128;

/// Case-insensitive glob match supporting `*` (any run) and `?` (any one
/// character).
pub(crate) fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern = pattern.as_bytes();
    let text = text.as_bytes();
    let (mut pi, mut ti) = (0usize, 0usize);
    let mut backtrack: Option<(usize, usize)> = None;

    while ti < text.len() {
        if pi < pattern.len()
            && (pattern[pi] == b'?' || pattern[pi].eq_ignore_ascii_case(&text[ti]))
        {
            pi += 1;
            ti += 1;
        } else if pi < pattern.len() && pattern[pi] == b'*' {
            backtrack = Some((pi, ti));
            pi += 1;
        } else if let Some((star_pi, star_ti)) = backtrack {
            pi = star_pi + 1;
            ti = star_ti + 1;
            backtrack = Some((star_pi, star_ti + 1));
        } else {
            return false;
        }
    }
    while pi < pattern.len() && pattern[pi] == b'*' {
        pi += 1;
    }
    pi == pattern.len()
}

/// Run every sub-discoverer the expression can match and return the
/// filtered, de-duplicated descriptor list (possibly empty).
pub(crate) fn discover(expression: &str) -> Vec<String> {
    let expression = if expression.is_empty() {
        "?*"
    } else {
        expression
    };

    // Wildcards make the expression open-ended, so every family has to be
    // scanned; otherwise the prefix decides.
    let broad = expression.contains('*') || expression.contains('?');
    let want_tcpip = broad || starts_with_ci(expression, "TCPIP");
    let want_usb = broad || starts_with_ci(expression, "USB");
    let want_asrl = broad || starts_with_ci(expression, "ASRL");

    let mut found: Vec<String> = Vec::new();
    if want_tcpip {
        mdns::discover_service("_lxi._tcp.local", false, &mut found);
        mdns::discover_service("_hislip._tcp.local", true, &mut found);
    }
    if want_usb {
        usb::discover(&mut found);
    }
    if want_asrl {
        serial_ports::discover(&mut found);
    }
    debug!(candidates = found.len(), expression, "discovery sweep complete");

    let mut results: Vec<String> = Vec::new();
    for descriptor in found {
        if results.len() >= MAX_RESULTS {
            break;
        }
        if glob_match(expression, &descriptor) && !results.contains(&descriptor) {
            results.push(descriptor);
        }
    }
    results
}

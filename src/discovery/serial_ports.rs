//! Serial-port scan.
//!
//! Linux walks `/dev` for `ttyS*` / `ttyUSB*` / `ttyACM*` character
//! devices and emits the path form (`ASRL/dev/ttyUSB0::INSTR`), plus the
//! numeric alias `ASRL<n+1>::INSTR` for legacy `ttyS<n>` ports. macOS
//! looks for `tty.usbserial*` / `tty.usbmodem*`. Windows asks the serial
//! stack for its `COM<n>` table.

#[cfg(not(windows))]
use tracing::debug;

/// Does a `/dev` entry name look like a serial port?
#[cfg(not(windows))]
fn is_tty_candidate(name: &str) -> bool {
    let Some(suffix) = name.strip_prefix("tty") else {
        return false;
    };
    #[cfg(target_os = "macos")]
    {
        suffix.starts_with(".usbserial") || suffix.starts_with(".usbmodem")
    }
    #[cfg(not(target_os = "macos"))]
    {
        suffix.starts_with('S') || suffix.starts_with("USB") || suffix.starts_with("ACM")
    }
}

/// `ttyS<n>` also answers to the legacy 1-based `ASRL<n+1>` number.
#[cfg(not(windows))]
fn legacy_asrl_number(name: &str) -> Option<u32> {
    name.strip_prefix("ttyS")?
        .parse::<u32>()
        .ok()
        .map(|n| n + 1)
}

#[cfg(not(windows))]
pub(crate) fn discover(results: &mut Vec<String>) {
    use std::os::unix::fs::FileTypeExt;

    let Ok(entries) = std::fs::read_dir("/dev") else {
        return;
    };
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        if !is_tty_candidate(&name) {
            continue;
        }
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        if !file_type.is_char_device() {
            continue;
        }

        debug!(%name, "found serial port");
        results.push(format!("ASRL/dev/{name}::INSTR"));
        if let Some(n) = legacy_asrl_number(&name) {
            results.push(format!("ASRL{n}::INSTR"));
        }
    }
}

#[cfg(windows)]
pub(crate) fn discover(results: &mut Vec<String>) {
    let Ok(ports) = serialport::available_ports() else {
        return;
    };
    for port in ports {
        if let Some(n) = port.port_name.strip_prefix("COM") {
            if n.parse::<u32>().is_ok() {
                results.push(format!("ASRL{n}::INSTR"));
            }
        }
    }
}

#[cfg(all(test, not(windows), not(target_os = "macos")))]
mod unit {
    use super::{is_tty_candidate, legacy_asrl_number};

    #[test]
    fn candidate_names_are_recognized() {
        assert!(is_tty_candidate("ttyS0"));
        assert!(is_tty_candidate("ttyUSB3"));
        assert!(is_tty_candidate("ttyACM1"));
        assert!(!is_tty_candidate("tty"));
        assert!(!is_tty_candidate("tty7"));
        assert!(!is_tty_candidate("random0"));
    }

    #[test]
    fn legacy_numbers_are_one_based() {
        assert_eq!(legacy_asrl_number("ttyS0"), Some(1));
        assert_eq!(legacy_asrl_number("ttyS11"), Some(12));
        assert_eq!(legacy_asrl_number("ttyUSB0"), None);
    }
}

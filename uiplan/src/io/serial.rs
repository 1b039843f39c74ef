//! Raw serial port setup and device discovery.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::io::actuator::ActuatorError;

/// Device node prefixes tried by auto-detection, in order.
pub const DEVICE_PREFIXES: &[&str] = &["cu.usbmodem", "cu.usbserial", "ttyACM", "ttyUSB"];

/// First matching device node under `dev_dir`, by prefix order then name.
pub fn detect_device(dev_dir: &Path) -> Option<PathBuf> {
    let mut names: Vec<String> = fs::read_dir(dev_dir)
        .ok()?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .collect();
    names.sort();
    for prefix in DEVICE_PREFIXES {
        if let Some(name) = names.iter().find(|name| name.starts_with(prefix)) {
            let path = dev_dir.join(name);
            info!(device = %path.display(), "auto-detected actuator device");
            return Some(path);
        }
    }
    debug!(dir = %dev_dir.display(), "no actuator device found");
    None
}

/// Resolve `auto` to a detected device node; any other value is a path.
pub fn resolve_device(spec: &str) -> Result<PathBuf, ActuatorError> {
    if spec != "auto" {
        return Ok(PathBuf::from(spec));
    }
    detect_device(Path::new("/dev")).ok_or_else(|| {
        ActuatorError::DeviceUnavailable(format!(
            "no device matching {} under /dev",
            DEVICE_PREFIXES.join("*, ")
        ))
    })
}

/// Open `path` read/write in raw mode at `baud`. Reads return after at most
/// 100 ms with whatever arrived, possibly nothing.
#[cfg(unix)]
pub fn open_raw(path: &Path, baud: u32) -> Result<(fs::File, fs::File), ActuatorError> {
    use std::os::unix::fs::OpenOptionsExt;

    use nix::fcntl::OFlag;
    use nix::sys::termios::{
        self, BaudRate, ControlFlags, FlushArg, SetArg, SpecialCharacterIndices,
    };

    let rate = match baud {
        9_600 => BaudRate::B9600,
        19_200 => BaudRate::B19200,
        38_400 => BaudRate::B38400,
        57_600 => BaudRate::B57600,
        115_200 => BaudRate::B115200,
        230_400 => BaudRate::B230400,
        other => {
            return Err(ActuatorError::DeviceUnavailable(format!(
                "unsupported baud rate {other}"
            )));
        }
    };

    let unavailable = |what: &str, err: &dyn std::fmt::Display| {
        ActuatorError::DeviceUnavailable(format!("{what} {}: {err}", path.display()))
    };

    let file = fs::OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(OFlag::O_NOCTTY.bits())
        .open(path)
        .map_err(|err| unavailable("open", &err))?;

    let mut attrs = termios::tcgetattr(&file).map_err(|err| unavailable("tcgetattr", &err))?;
    termios::cfmakeraw(&mut attrs);
    termios::cfsetspeed(&mut attrs, rate).map_err(|err| unavailable("cfsetspeed", &err))?;
    attrs.control_flags.insert(ControlFlags::CLOCAL | ControlFlags::CREAD);
    attrs.control_chars[SpecialCharacterIndices::VMIN as usize] = 0;
    attrs.control_chars[SpecialCharacterIndices::VTIME as usize] = 1;
    termios::tcsetattr(&file, SetArg::TCSANOW, &attrs)
        .map_err(|err| unavailable("tcsetattr", &err))?;
    termios::tcflush(&file, FlushArg::TCIOFLUSH).map_err(|err| unavailable("tcflush", &err))?;

    let writer = file.try_clone()?;
    debug!(device = %path.display(), baud, "serial port configured");
    Ok((file, writer))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detect_prefers_usbmodem_over_other_prefixes() {
        let temp = tempfile::tempdir().expect("tempdir");
        for name in ["ttyACM0", "cu.usbserial-10", "cu.usbmodem14101", "null"] {
            fs::write(temp.path().join(name), "").expect("write");
        }
        assert_eq!(
            detect_device(temp.path()),
            Some(temp.path().join("cu.usbmodem14101"))
        );
    }

    #[test]
    fn detect_falls_back_to_linux_names() {
        let temp = tempfile::tempdir().expect("tempdir");
        for name in ["ttyUSB0", "ttyACM1", "ttyACM0"] {
            fs::write(temp.path().join(name), "").expect("write");
        }
        assert_eq!(detect_device(temp.path()), Some(temp.path().join("ttyACM0")));
    }

    #[test]
    fn detect_returns_none_without_devices() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert_eq!(detect_device(temp.path()), None);
        assert!(matches!(
            resolve_device("/dev/cu.usbmodem1").map(|p| p.display().to_string()),
            Ok(path) if path == "/dev/cu.usbmodem1"
        ));
    }
}

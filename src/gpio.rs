//! Output pins driven through the Linux sysfs GPIO interface.
use embedded_hal::digital::{self, ErrorType, OutputPin};
use log::*;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Default mount point of the sysfs GPIO class.
pub const SYSFS_GPIO_ROOT: &str = "/sys/class/gpio";

/// A GPIO line configured as an output.
#[derive(Debug)]
pub struct SysfsPin {
    number: u32,
    value_path: PathBuf,
}

impl SysfsPin {
    /// Exports `number` (if needed) and configures it as a low output.
    pub fn export(number: u32) -> io::Result<Self> {
        Self::export_at(SYSFS_GPIO_ROOT, number)
    }

    /// Like [`SysfsPin::export`] with an alternative sysfs root.
    pub fn export_at(root: impl AsRef<Path>, number: u32) -> io::Result<Self> {
        let root = root.as_ref();
        let pin_dir = root.join(format!("gpio{number}"));
        if !pin_dir.exists() {
            debug!("Exporting GPIO {number}");
            fs::write(root.join("export"), number.to_string())?;
        }
        // Writing "low" sets the direction and drives the line low in one step.
        fs::write(pin_dir.join("direction"), "low")?;
        Ok(Self {
            number,
            value_path: pin_dir.join("value"),
        })
    }

    pub fn number(&self) -> u32 {
        self.number
    }

    pub fn set(&mut self, high: bool) -> io::Result<()> {
        trace!("GPIO {} -> {}", self.number, if high { 1 } else { 0 });
        fs::write(&self.value_path, if high { "1" } else { "0" })
    }
}

/// Failed write to a sysfs value file.
#[derive(Debug, thiserror::Error)]
#[error("GPIO write failed: {0}")]
pub struct GpioError(#[from] pub io::Error);

impl digital::Error for GpioError {
    fn kind(&self) -> digital::ErrorKind {
        digital::ErrorKind::Other
    }
}

impl ErrorType for SysfsPin {
    type Error = GpioError;
}

impl OutputPin for SysfsPin {
    fn set_low(&mut self) -> Result<(), GpioError> {
        Ok(self.set(false)?)
    }

    fn set_high(&mut self) -> Result<(), GpioError> {
        Ok(self.set(true)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn export_and_drive() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir(root.path().join("gpio24")).unwrap();

        let mut pin = SysfsPin::export_at(root.path(), 24).unwrap();
        assert_eq!(pin.number(), 24);
        assert_eq!(
            fs::read_to_string(root.path().join("gpio24/direction")).unwrap(),
            "low"
        );
        // Already exported, the export file is left alone.
        assert!(!root.path().join("export").exists());

        pin.set(true).unwrap();
        assert_eq!(fs::read_to_string(root.path().join("gpio24/value")).unwrap(), "1");
        pin.set(false).unwrap();
        assert_eq!(fs::read_to_string(root.path().join("gpio24/value")).unwrap(), "0");
    }

    #[test]
    fn output_pin_levels() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir(root.path().join("gpio26")).unwrap();
        let value = root.path().join("gpio26/value");

        let mut pin = SysfsPin::export_at(root.path(), 26).unwrap();
        pin.set_high().unwrap();
        assert_eq!(fs::read_to_string(&value).unwrap(), "1");
        pin.set_state(digital::PinState::Low).unwrap();
        assert_eq!(fs::read_to_string(&value).unwrap(), "0");

        fs::remove_dir_all(root.path().join("gpio26")).unwrap();
        let err = pin.set_high().unwrap_err();
        assert_eq!(digital::Error::kind(&err), digital::ErrorKind::Other);
    }

    #[test]
    fn export_missing_pin() {
        let root = tempfile::tempdir().unwrap();
        // The kernel would create gpio7/ after the export write; here it never appears.
        assert!(SysfsPin::export_at(root.path(), 7).is_err());
        assert_eq!(fs::read_to_string(root.path().join("export")).unwrap(), "7");
    }
}

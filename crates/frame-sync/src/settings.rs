//! Persisted global frame-counting switch.
//!
//! Frame counting is opt-in per user, shared by every sender and receiver on
//! the machine. The switch is read once when a [`FrameCounter`] is created
//! and written back by [`FrameCounter::set_frame_count`].
//!
//! [`FrameCounter`]: crate::FrameCounter
//! [`FrameCounter::set_frame_count`]: crate::FrameCounter::set_frame_count

use crate::error::Result;

/// Backing store for the frame-counting switch.
pub trait SettingsStore: Send {
    /// The stored value, or `None` when it was never written or cannot be
    /// read.
    fn frame_count(&self) -> Option<bool>;

    /// Persist a new value.
    fn set_frame_count(&mut self, enabled: bool) -> Result<()>;
}

/// In-process store, for tests and hosts that manage the switch themselves.
#[derive(Debug, Default, Clone)]
pub struct MemorySettings {
    frame_count: Option<bool>,
}

impl MemorySettings {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store with frame counting switched on.
    pub fn enabled() -> Self {
        Self {
            frame_count: Some(true),
        }
    }
}

impl SettingsStore for MemorySettings {
    fn frame_count(&self) -> Option<bool> {
        self.frame_count
    }

    fn set_frame_count(&mut self, enabled: bool) -> Result<()> {
        self.frame_count = Some(enabled);
        Ok(())
    }
}

/// The store shared with other applications on this platform.
pub fn platform_store() -> Box<dyn SettingsStore> {
    #[cfg(target_os = "windows")]
    {
        Box::new(RegistrySettings)
    }
    #[cfg(not(target_os = "windows"))]
    {
        match FileSettings::user_default() {
            Some(store) => Box::new(store),
            None => {
                tracing::warn!("No user config directory, frame counting switch kept in memory");
                Box::new(MemorySettings::new())
            }
        }
    }
}

#[cfg(target_os = "windows")]
pub use registry::RegistrySettings;

#[cfg(target_os = "windows")]
mod registry {
    use std::ffi::c_void;
    use std::io;

    use windows::core::w;
    use windows::Win32::Foundation::ERROR_SUCCESS;
    use windows::Win32::System::Registry::{
        RegGetValueW, RegSetKeyValueW, HKEY_CURRENT_USER, REG_DWORD, RRF_RT_REG_DWORD,
    };

    use super::SettingsStore;
    use crate::error::{Result, SyncError};

    /// `Framecount` DWORD under `HKCU\Software\Leading Edge\Spout`, the value
    /// every Spout application reads.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct RegistrySettings;

    impl SettingsStore for RegistrySettings {
        fn frame_count(&self) -> Option<bool> {
            let mut value: u32 = 0;
            let mut size = std::mem::size_of::<u32>() as u32;
            let status = unsafe {
                RegGetValueW(
                    HKEY_CURRENT_USER,
                    w!("Software\\Leading Edge\\Spout"),
                    w!("Framecount"),
                    RRF_RT_REG_DWORD,
                    None,
                    Some(&mut value as *mut u32 as *mut c_void),
                    Some(&mut size),
                )
            };
            (status == ERROR_SUCCESS).then_some(value == 1)
        }

        fn set_frame_count(&mut self, enabled: bool) -> Result<()> {
            let value = u32::from(enabled);
            let status = unsafe {
                RegSetKeyValueW(
                    HKEY_CURRENT_USER,
                    w!("Software\\Leading Edge\\Spout"),
                    w!("Framecount"),
                    REG_DWORD.0,
                    Some(&value as *const u32 as *const c_void),
                    std::mem::size_of::<u32>() as u32,
                )
            };
            if status != ERROR_SUCCESS {
                return Err(SyncError::Settings(io::Error::from_raw_os_error(
                    status.0 as i32,
                )));
            }
            Ok(())
        }
    }
}

#[cfg(not(target_os = "windows"))]
pub use file::FileSettings;

#[cfg(not(target_os = "windows"))]
mod file {
    use std::env;
    use std::fs;
    use std::io;
    use std::path::{Path, PathBuf};

    use tracing::debug;

    use super::SettingsStore;
    use crate::error::Result;

    const KEY: &str = "framecount";

    /// `framecount=0|1` line in a small `key=value` file.
    #[derive(Debug, Clone)]
    pub struct FileSettings {
        path: PathBuf,
    }

    impl FileSettings {
        pub fn at(path: impl Into<PathBuf>) -> Self {
            Self { path: path.into() }
        }

        /// `$XDG_CONFIG_HOME/frame-sync/settings`, falling back to
        /// `$HOME/.config/frame-sync/settings`.
        pub fn user_default() -> Option<Self> {
            let base = env::var_os("XDG_CONFIG_HOME")
                .filter(|v| !v.is_empty())
                .map(PathBuf::from)
                .or_else(|| {
                    env::var_os("HOME")
                        .filter(|v| !v.is_empty())
                        .map(|home| PathBuf::from(home).join(".config"))
                })?;
            Some(Self::at(base.join("frame-sync").join("settings")))
        }

        pub fn path(&self) -> &Path {
            &self.path
        }

        fn read_lines(&self) -> io::Result<Vec<String>> {
            match fs::read_to_string(&self.path) {
                Ok(text) => Ok(text.lines().map(str::to_owned).collect()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
                Err(e) => Err(e),
            }
        }
    }

    fn parse_line(line: &str) -> Option<(&str, &str)> {
        let (key, value) = line.split_once('=')?;
        Some((key.trim(), value.trim()))
    }

    impl SettingsStore for FileSettings {
        fn frame_count(&self) -> Option<bool> {
            let lines = match self.read_lines() {
                Ok(lines) => lines,
                Err(e) => {
                    debug!("Reading {}: {e}", self.path.display());
                    return None;
                }
            };
            lines
                .iter()
                .filter_map(|line| parse_line(line))
                .find(|(key, _)| *key == KEY)
                .map(|(_, value)| value == "1")
        }

        fn set_frame_count(&mut self, enabled: bool) -> Result<()> {
            let entry = format!("{KEY}={}", u8::from(enabled));
            let mut lines = self.read_lines()?;
            match lines
                .iter_mut()
                .find(|line| parse_line(line).is_some_and(|(key, _)| key == KEY))
            {
                Some(line) => *line = entry,
                None => lines.push(entry),
            }

            if let Some(dir) = self.path.parent() {
                fs::create_dir_all(dir)?;
            }
            let mut text = lines.join("\n");
            text.push('\n');
            fs::write(&self.path, text)?;
            Ok(())
        }
    }
}

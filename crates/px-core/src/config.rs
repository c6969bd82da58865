//! Configuration system for oxidized-psx emulator

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct Config {
    pub general: GeneralConfig,
    pub cpu: CpuConfig,
    pub gpu: GpuConfig,
    pub debug: DebugConfig,
}

/// General emulator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    pub bios_path: PathBuf,
    pub start_paused: bool,
    /// Use PAL timings (50Hz) instead of NTSC (60Hz)
    pub pal: bool,
}

/// CPU emulation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CpuConfig {
    pub execution_mode: CpuExecutionMode,
    /// Direct host-mapped RAM access with fault-driven code invalidation.
    /// Only honoured with the recompiler.
    pub fastmem: bool,
    pub block_linking: bool,
}

/// How guest code is executed
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
pub enum CpuExecutionMode {
    Interpreter,
    #[default]
    CachedInterpreter,
    Recompiler,
}

/// GPU settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GpuConfig {
    pub renderer: GpuRenderer,
    /// Run the backend on its own thread
    pub use_thread: bool,
    pub resolution_scale: u32,
    pub force_progressive_scan: bool,
    /// GPU ticks the command processor may run ahead of the CPU
    pub max_run_ahead: u32,
}

/// GPU renderer type
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
pub enum GpuRenderer {
    #[default]
    Software,
}

/// Debug settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub log_level: LogLevel,
    pub log_to_file: bool,
    pub log_path: PathBuf,
}

/// Logging level
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// Filter directive understood by `tracing_subscriber::EnvFilter`
    pub fn as_filter(self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }
}

// Default implementations

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            bios_path: PathBuf::from("scph1001.bin"),
            start_paused: false,
            pal: false,
        }
    }
}

impl Default for CpuConfig {
    fn default() -> Self {
        Self {
            execution_mode: CpuExecutionMode::default(),
            fastmem: false,
            block_linking: true,
        }
    }
}

impl Default for GpuConfig {
    fn default() -> Self {
        Self {
            renderer: GpuRenderer::default(),
            use_thread: true,
            resolution_scale: 1,
            force_progressive_scan: false,
            max_run_ahead: 128,
        }
    }
}

impl GpuConfig {
    /// Resolution scale clamped to the supported range
    pub fn clamped_resolution_scale(&self) -> u32 {
        self.resolution_scale.clamp(1, 16)
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: LogLevel::default(),
            log_to_file: false,
            log_path: PathBuf::from("oxidized-psx.log"),
        }
    }
}

impl Config {
    /// Load configuration from file, or create default if it doesn't exist
    pub fn load() -> Result<Self, Box<dyn std::error::Error>> {
        let path = Self::config_path();

        if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            Ok(toml::from_str(&content)?)
        } else {
            let config = Self::default();
            config.save()?;
            Ok(config)
        }
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<(), Box<dyn std::error::Error>> {
        let path = Self::config_path();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(&path, content)?;
        Ok(())
    }

    /// Get the path to the configuration file
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("oxidized-psx")
            .join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(!config.general.start_paused);
        assert_eq!(config.cpu.execution_mode, CpuExecutionMode::CachedInterpreter);
        assert!(config.cpu.block_linking);
        assert!(!config.cpu.fastmem);
        assert_eq!(config.gpu.max_run_ahead, 128);
        assert_eq!(config.gpu.renderer, GpuRenderer::Software);
    }

    #[test]
    fn test_config_serialization() {
        let mut config = Config::default();
        config.cpu.execution_mode = CpuExecutionMode::Recompiler;
        config.gpu.use_thread = false;
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.cpu.execution_mode, CpuExecutionMode::Recompiler);
        assert!(!parsed.gpu.use_thread);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let parsed: Config = toml::from_str("[gpu]\nresolution_scale = 40\n").unwrap();
        assert_eq!(parsed.gpu.resolution_scale, 40);
        assert_eq!(parsed.gpu.clamped_resolution_scale(), 16);
        assert!(parsed.cpu.block_linking);
    }

    #[test]
    fn test_log_level_filter() {
        assert_eq!(LogLevel::Warn.as_filter(), "warn");
        assert_eq!(LogLevel::default().as_filter(), "info");
    }
}

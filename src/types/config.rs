use serde::{Deserialize, Serialize};
use std::env;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use crate::prelude::*;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    pub device: DeviceConfig,
    pub skeleton: SkeletonConfig,
}

impl Config {
    pub fn new(device: DeviceConfig, skeleton: SkeletonConfig) -> Self {
        Self { device, skeleton }
    }

    /// Reads the configuration from the `PARSKEL_*` environment variables. If `PARSKEL_CONFIG`
    /// names a JSON file, that file is loaded instead.
    pub fn from_env() -> Self {
        if let Some(path) = env::var_os("PARSKEL_CONFIG") {
            match Self::load(&path) {
                Ok(config) => return config,
                Err(e) => warn!("ignoring configuration file {:?}: {:?}", path, e),
            }
        }

        Self {
            device: DeviceConfig::from_env(),
            skeleton: SkeletonConfig::from_env(),
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .with_context(|| format!("failed to open configuration file {:?}", path))?;

        serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("failed to parse configuration file {:?}", path))
    }

    /// Configuration for `count` emulated host devices.
    pub fn host(count: usize) -> Self {
        Self {
            device: DeviceConfig {
                backend: BackendKind::Host,
                selection: DeviceSelection::First(count),
                ..default()
            },
            skeleton: default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackendKind {
    Host,
    Cuda,
}

impl Default for BackendKind {
    fn default() -> Self {
        BackendKind::Host
    }
}

/// Which of the discovered devices should be used.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceSelection {
    All,
    First(usize),
    Ids(Vec<usize>),
}

impl Default for DeviceSelection {
    fn default() -> Self {
        DeviceSelection::All
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub backend: BackendKind,
    pub selection: DeviceSelection,

    /// Number of devices the host backend emulates when all devices are selected.
    pub host_device_count: usize,

    /// Capacity of each emulated device in bytes. `None` means unlimited.
    pub host_device_memory: Option<usize>,
    pub host_max_work_group_size: usize,
    pub nvcc: PathBuf,
    pub nvcc_options: Vec<String>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Host,
            selection: DeviceSelection::All,
            host_device_count: 1,
            host_device_memory: None,
            host_max_work_group_size: 1024,
            nvcc: PathBuf::from("nvcc"),
            nvcc_options: vec![],
        }
    }
}

impl DeviceConfig {
    pub fn from_env() -> Self {
        let mut out = Self::default();

        if let Ok(backend) = env::var("PARSKEL_BACKEND") {
            out.backend = match backend.trim() {
                "host" | "" => BackendKind::Host,
                "cuda" => BackendKind::Cuda,
                s => {
                    warn!("unknown backend {:?}, reverting to host backend", s);
                    BackendKind::Host
                }
            }
        }

        if let Ok(devices) = env::var("PARSKEL_DEVICES") {
            let devices = devices.trim();

            if devices == "all" || devices.is_empty() {
                out.selection = DeviceSelection::All;
            } else if devices.contains(',') {
                match devices
                    .split(',')
                    .map(|s| s.trim().parse::<usize>())
                    .collect::<Result<Vec<_>, _>>()
                {
                    Ok(ids) => out.selection = DeviceSelection::Ids(ids),
                    Err(e) => warn!("invalid device list {:?}: {}", devices, e),
                }
            } else {
                match devices.parse::<usize>() {
                    Ok(n) if n > 0 => {
                        out.selection = DeviceSelection::First(n);
                        out.host_device_count = n;
                    }
                    _ => warn!("invalid device count {:?}, using all devices", devices),
                }
            }
        }

        if let Ok(memory) = env::var("PARSKEL_DEVICE_MEMORY") {
            match memory.trim().parse::<usize>() {
                Ok(n) => out.host_device_memory = Some(n),
                Err(e) => warn!("invalid device memory {:?}: {}", memory, e),
            }
        }

        if let Ok(nvcc) = env::var("PARSKEL_NVCC") {
            let mut parts = nvcc.split_whitespace();

            if let Some(cmd) = parts.next() {
                out.nvcc = PathBuf::from(cmd);
                out.nvcc_options = parts.map(String::from).collect();
            }
        }

        out
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkeletonConfig {
    pub work_group_size: usize,

    /// Default number of stencil iterations between two halo swaps. `None` lets the stencil
    /// skeleton decide.
    pub iterations_between_swaps: Option<usize>,
}

impl Default for SkeletonConfig {
    fn default() -> Self {
        Self {
            work_group_size: 256,
            iterations_between_swaps: None,
        }
    }
}

impl SkeletonConfig {
    pub fn from_env() -> Self {
        let mut out = Self::default();

        if let Ok(size) = env::var("PARSKEL_WORK_GROUP_SIZE") {
            match size.trim().parse::<usize>() {
                Ok(n) if n > 0 => out.work_group_size = n,
                _ => warn!("invalid work group size {:?}, using {}", size, out.work_group_size),
            }
        }

        if let Ok(iters) = env::var("PARSKEL_ITERATIONS_BETWEEN_SWAPS") {
            match iters.trim().parse::<i64>() {
                Ok(n) if n > 0 => out.iterations_between_swaps = Some(n as usize),
                Ok(-1) => out.iterations_between_swaps = None,
                _ => warn!("invalid iterations between swaps {:?}, using default", iters),
            }
        }

        out
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_host_config() {
        let config = Config::host(3);
        assert_eq!(config.device.backend, BackendKind::Host);
        assert_eq!(config.device.selection, DeviceSelection::First(3));
        assert_eq!(config.skeleton.work_group_size, 256);
        assert_eq!(config.skeleton.iterations_between_swaps, None);
    }

    #[test]
    fn test_serialize() {
        let config = Config::host(2);
        let text = serde_json::to_string(&config).unwrap();
        let parsed: Config = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed.device.selection, DeviceSelection::First(2));
    }

    #[test]
    fn test_load() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        let mut config = Config::host(4);
        config.skeleton.iterations_between_swaps = Some(3);
        write!(file, "{}", serde_json::to_string(&config).unwrap()).unwrap();

        let loaded = Config::load(file.path()).unwrap();
        assert_eq!(loaded.device.selection, DeviceSelection::First(4));
        assert_eq!(loaded.skeleton.iterations_between_swaps, Some(3));
        assert!(Config::load("/nonexistent/parskel.json").is_err());
    }
}

/*!
 * Device discovery for MotorLink.
 *
 * Discovery answers one question: which device paths could a session attach
 * to? The registry only ever uses the first candidate, so providers must
 * return candidates in a stable order.
 */
use std::collections::BTreeSet;
use std::fmt::Debug;
use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, warn};

use motorlink_core::error::Result;

/// Device discovery trait
///
/// This trait defines the interface for device discovery providers.
#[async_trait]
pub trait DeviceDiscovery: Send + Sync + Debug {
    /// Get the discovery provider name
    fn name(&self) -> &'static str;

    /// List candidate device paths, best candidate first
    async fn candidates(&self) -> Result<Vec<String>>;
}

/// A fixed list of candidates
#[derive(Debug, Clone, Default)]
pub struct StaticDiscovery {
    paths: Vec<String>,
}

impl StaticDiscovery {
    /// Create a provider that always returns `paths`
    pub fn new<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            paths: paths.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl DeviceDiscovery for StaticDiscovery {
    fn name(&self) -> &'static str {
        "static"
    }

    async fn candidates(&self) -> Result<Vec<String>> {
        Ok(self.paths.clone())
    }
}

/// Lists serial devices whose file name starts with one of a set of prefixes
#[derive(Debug, Clone)]
pub struct PortDiscovery {
    dev_dir: PathBuf,
    prefixes: Vec<String>,
    include_system_ports: bool,
}

impl PortDiscovery {
    /// Scan `/dev` and the OS serial port list for `prefixes`
    pub fn new<I, S>(prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            dev_dir: PathBuf::from("/dev"),
            prefixes: prefixes.into_iter().map(Into::into).collect(),
            include_system_ports: true,
        }
    }

    /// Scan only `dir`, skipping the OS serial port list
    pub fn in_dir<P, I, S>(dir: P, prefixes: I) -> Self
    where
        P: AsRef<Path>,
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            dev_dir: dir.as_ref().to_path_buf(),
            include_system_ports: false,
            ..Self::new(prefixes)
        }
    }

    fn matches(&self, name: &str) -> bool {
        let basename = name.rsplit('/').next().unwrap_or(name);
        self.prefixes.iter().any(|p| basename.starts_with(p.as_str()))
    }

    fn scan(&self) -> Vec<String> {
        let mut found = BTreeSet::new();

        match fs::read_dir(&self.dev_dir) {
            Ok(entries) => {
                for entry in entries.flatten() {
                    if let Some(name) = entry.file_name().to_str() {
                        if self.matches(name) {
                            found.insert(self.dev_dir.join(name).to_string_lossy().to_string());
                        }
                    }
                }
            }
            Err(e) => warn!("Cannot list {}: {}", self.dev_dir.display(), e),
        }

        #[cfg(feature = "serial")]
        if self.include_system_ports {
            for info in serialport::available_ports().unwrap_or_default() {
                if self.matches(&info.port_name) {
                    found.insert(info.port_name);
                }
            }
        }

        let mut paths: Vec<String> = found.into_iter().collect();
        paths.sort_by_key(|p| self.sort_key(p));
        paths
    }

    /// Order by prefix priority, then numeric suffix, then name
    fn sort_key(&self, path: &str) -> (usize, u64, String) {
        let basename = path.rsplit('/').next().unwrap_or(path);
        for (rank, prefix) in self.prefixes.iter().enumerate() {
            if let Some(rest) = basename.strip_prefix(prefix.as_str()) {
                let num = rest.parse::<u64>().unwrap_or(u64::MAX);
                return (rank, num, basename.to_string());
            }
        }
        (self.prefixes.len(), 0, basename.to_string())
    }
}

#[async_trait]
impl DeviceDiscovery for PortDiscovery {
    fn name(&self) -> &'static str {
        "port"
    }

    async fn candidates(&self) -> Result<Vec<String>> {
        let discovery = self.clone();
        let paths = tokio::task::spawn_blocking(move || discovery.scan())
            .await
            .map_err(|e| motorlink_core::Error::other(format!("discovery task failed: {}", e)))?;
        debug!("Discovered {} candidate device(s): {:?}", paths.len(), paths);
        Ok(paths)
    }
}

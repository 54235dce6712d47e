use crate::generator::profile::SignalConfig;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

fn default_true() -> bool {
    true
}

fn default_channels() -> usize {
    32
}

fn default_integration() -> usize {
    4
}

fn default_phase_bins() -> usize {
    64
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkflowConfig {
    #[serde(default)]
    pub signal: SignalConfig,
    /// Coherently dedisperse at the signal's DM before channelizing.
    #[serde(default = "default_true")]
    pub dedisperse: bool,
    /// Sub-channels produced from every input channel.
    #[serde(default = "default_channels")]
    pub channelize: usize,
    /// Power samples averaged before folding.
    #[serde(default = "default_integration")]
    pub integrate: usize,
    #[serde(default = "default_phase_bins")]
    pub phase_bins: usize,
    /// Overlap-save frame size of the dedispersion filter.
    #[serde(default)]
    pub frame_size: Option<usize>,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            signal: SignalConfig::default(),
            dedisperse: true,
            channelize: default_channels(),
            integrate: default_integration(),
            phase_bins: default_phase_bins(),
            frame_size: None,
        }
    }
}

impl WorkflowConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path_ref = path.as_ref();
        let contents = fs::read_to_string(path_ref)
            .with_context(|| format!("reading workflow config {}", path_ref.display()))?;
        let config: WorkflowConfig = serde_yaml::from_str(&contents)
            .with_context(|| format!("parsing workflow config {}", path_ref.display()))?;
        Ok(config)
    }

    pub fn from_args(dm: f64, channelize: usize, integrate: usize, phase_bins: usize) -> Self {
        Self {
            signal: SignalConfig {
                dm,
                ..SignalConfig::default()
            },
            channelize,
            integrate,
            phase_bins,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn config_from_args_overrides_defaults() {
        let cfg = WorkflowConfig::from_args(2.5, 16, 8, 32);
        assert_eq!(cfg.signal.dm, 2.5);
        assert_eq!(cfg.channelize, 16);
        assert_eq!(cfg.phase_bins, 32);
        assert!(cfg.dedisperse);
        assert_eq!(cfg.signal.channels, SignalConfig::default().channels);
    }

    #[test]
    fn config_load_reads_yaml() {
        let mut temp = NamedTempFile::new().unwrap();
        temp.write_all(b"signal:\n  dm: 1.5\n  seed: 9\ndedisperse: false\nchannelize: 8\n")
            .unwrap();
        let path = temp.into_temp_path();
        let cfg = WorkflowConfig::load(&path).unwrap();
        assert_eq!(cfg.signal.dm, 1.5);
        assert_eq!(cfg.signal.seed, 9);
        assert_eq!(cfg.signal.channels, 2);
        assert!(!cfg.dedisperse);
        assert_eq!(cfg.channelize, 8);
        assert_eq!(cfg.integrate, 4);
        assert_eq!(cfg.frame_size, None);
    }

    #[test]
    fn config_load_reports_the_path() {
        let error = WorkflowConfig::load("/nonexistent/workflow.yaml").unwrap_err();
        assert!(format!("{}", error).contains("/nonexistent/workflow.yaml"));
    }
}

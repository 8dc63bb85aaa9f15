// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of gotel

use std::{path::PathBuf, str::FromStr};

use serde::Deserialize;

use crate::errors::GotelError;

#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    export: Option<ExportConfig>,
    probes: Option<ProbeSettings>,
}

impl Config {
    pub fn export(&self) -> ExportConfig {
        self.export.clone().unwrap_or_default()
    }

    pub fn probes(&self) -> ProbeSettings {
        self.probes.clone().unwrap_or_default()
    }

    /// Applies the SHOW_VERIFIER_LOG knob; it never comes from the file.
    pub fn set_verifier_log(&mut self, enabled: bool) {
        let mut probes = self.probes.take().unwrap_or_default();
        probes.verifier_log = enabled;
        self.probes = Some(probes);
    }
}

impl FromStr for Config {
    type Err = GotelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        toml::from_str(s).map_err(|e| GotelError::Error(format!("unable to parse config: {e}")))
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExportConfig {
    pub endpoint: String,
    pub service_name: String,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:4317".to_string(),
            service_name: "gotel".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProbeSettings {
    /// Directory holding the compiled probe objects.
    pub bytecode_dir: PathBuf,
    /// Capacity of each probe's in-flight request map. Requests beyond
    /// this bound lose their entry record, which is an acceptable drop.
    pub max_inflight: u32,
    /// Pages per cpu for the shared perf ring.
    pub perf_pages: usize,
    /// Set from SHOW_VERIFIER_LOG, not from the config file.
    #[serde(skip)]
    pub verifier_log: bool,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            bytecode_dir: PathBuf::from("/usr/lib/gotel/bytecode"),
            max_inflight: 50,
            perf_pages: 8,
            verifier_log: false,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_config_from_invalid_string() {
        assert!(Config::from_str("i am a teapot").is_err());
    }

    #[test]
    fn test_config_empty_uses_defaults() {
        let config = Config::from_str("").expect("empty config should parse");
        assert_eq!(config.export().endpoint, "http://localhost:4317");
        assert_eq!(config.probes().max_inflight, 50);
    }

    #[test]
    fn test_config_overrides() {
        let input = r#"
        [export]
        endpoint = "http://collector:4317"
        service_name = "checkout"

        [probes]
        bytecode_dir = "/opt/gotel/bytecode"
        max_inflight = 200
        perf_pages = 16
        "#;
        let config = Config::from_str(input).expect("error parsing toml input");
        assert_eq!(config.export().endpoint, "http://collector:4317");
        assert_eq!(config.probes().max_inflight, 200);
        assert_eq!(
            config.probes().bytecode_dir,
            PathBuf::from("/opt/gotel/bytecode")
        );
        assert!(!config.probes().verifier_log);
    }
}

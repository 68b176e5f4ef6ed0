//! Driver configuration.
//!
//! Every knob resolves through the same precedence chain: built-in defaults,
//! then an optional `droverrc.yml` file, then `DROVER_*` environment
//! variables, then whatever the caller sets through driver options or CLI
//! flags.

use std::path::PathBuf;

use serde::Deserialize;
use tracing::warn;

const MIB: u64 = 1024 * 1024;

/// File consulted in the working directory or under `$HOME/.drover/`.
const CONFIG_FILE_NAME: &str = "droverrc.yml";

/// Resolved configuration of a driver run.
#[derive(Clone, Debug)]
pub struct Config {
    /// Input paths: files, directories, or globs.
    pub inputs: Vec<String>,

    /// Maximum bytes of one input split.
    pub split_size: u64,

    /// Maximum combined split bytes handled by one map task.
    pub map_bin_size: u64,

    /// Input bytes one reduce task is provisioned for.
    pub reduce_bin_size: u64,

    /// Cap on concurrently dispatched map tasks.
    pub max_concurrency: usize,

    /// Directory or object-store prefix all of a run's files live under.
    pub working_location: String,

    /// Whether to delete intermediate shards after a successful reduce.
    pub cleanup: bool,

    pub function_name: String,
    pub function_memory: i32,
    pub function_timeout: i32,

    /// When true, the driver deploys and owns the worker's IAM role.
    pub manage_role: bool,

    /// Role to run the worker under when `manage_role` is off.
    pub role_arn: String,

    pub verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            inputs: Vec::new(),
            split_size: 100 * MIB,
            map_bin_size: 512 * MIB,
            reduce_bin_size: 512 * MIB,
            max_concurrency: 500,
            working_location: ".".to_string(),
            cleanup: false,
            function_name: "drover_function".to_string(),
            function_memory: 1500,
            function_timeout: 180,
            manage_role: true,
            role_arn: String::new(),
            verbose: false,
        }
    }
}

/// The optional settings file; every field may be omitted.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ConfigFile {
    split_size: Option<u64>,
    map_bin_size: Option<u64>,
    reduce_bin_size: Option<u64>,
    max_concurrency: Option<usize>,
    working_location: Option<String>,
    cleanup: Option<bool>,
    function_name: Option<String>,
    function_memory: Option<i32>,
    function_timeout: Option<i32>,
    manage_role: Option<bool>,
    role_arn: Option<String>,
    verbose: Option<bool>,
}

impl Config {
    /// Loads configuration from the settings file and environment, on top of
    /// the defaults.
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Some(path) = find_config_file() {
            match std::fs::read_to_string(&path) {
                Ok(contents) => match serde_yaml::from_str::<ConfigFile>(&contents) {
                    Ok(file) => config.apply_file(file),
                    Err(err) => warn!("ignoring malformed {}: {err}", path.display()),
                },
                Err(err) => warn!("could not read {}: {err}", path.display()),
            }
        }

        config.apply_env(std::env::vars());
        config
    }

    fn apply_file(&mut self, file: ConfigFile) {
        macro_rules! take {
            ($field:ident) => {
                if let Some(value) = file.$field {
                    self.$field = value;
                }
            };
        }
        take!(split_size);
        take!(map_bin_size);
        take!(reduce_bin_size);
        take!(max_concurrency);
        take!(working_location);
        take!(cleanup);
        take!(function_name);
        take!(function_memory);
        take!(function_timeout);
        take!(manage_role);
        take!(role_arn);
        take!(verbose);
    }

    fn apply_env(&mut self, vars: impl IntoIterator<Item = (String, String)>) {
        for (key, value) in vars {
            let Some(key) = key.strip_prefix("DROVER_") else {
                continue;
            };
            match key {
                "SPLIT_SIZE" => parse_into(&mut self.split_size, key, &value),
                "MAP_BIN_SIZE" => parse_into(&mut self.map_bin_size, key, &value),
                "REDUCE_BIN_SIZE" => parse_into(&mut self.reduce_bin_size, key, &value),
                "MAX_CONCURRENCY" => parse_into(&mut self.max_concurrency, key, &value),
                "WORKING_LOCATION" => self.working_location = value,
                "CLEANUP" => parse_into(&mut self.cleanup, key, &value),
                "FUNCTION_NAME" => self.function_name = value,
                "FUNCTION_MEMORY" => parse_into(&mut self.function_memory, key, &value),
                "FUNCTION_TIMEOUT" => parse_into(&mut self.function_timeout, key, &value),
                "MANAGE_ROLE" => parse_into(&mut self.manage_role, key, &value),
                "ROLE_ARN" => self.role_arn = value,
                "VERBOSE" => parse_into(&mut self.verbose, key, &value),
                _ => {}
            }
        }
    }

    /// A split may never be larger than the bin it is packed into.
    pub(crate) fn clamp_split_size(&mut self) {
        if self.split_size > self.map_bin_size {
            warn!("configured split size is larger than the map bin size; clamping");
            self.split_size = self.map_bin_size;
        }
    }
}

fn parse_into<T: std::str::FromStr>(field: &mut T, key: &str, raw: &str) {
    match raw.parse() {
        Ok(value) => *field = value,
        Err(_) => warn!("ignoring unparseable DROVER_{key}={raw}"),
    }
}

fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from(CONFIG_FILE_NAME);
    if local.is_file() {
        return Some(local);
    }

    let home = std::env::var_os("HOME")?;
    let in_home = PathBuf::from(home).join(".drover").join(CONFIG_FILE_NAME);
    in_home.is_file().then_some(in_home)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_values() {
        let config = Config::default();
        assert_eq!(config.split_size, 100 * MIB);
        assert_eq!(config.map_bin_size, 512 * MIB);
        assert_eq!(config.reduce_bin_size, 512 * MIB);
        assert_eq!(config.max_concurrency, 500);
        assert_eq!(config.working_location, ".");
        assert!(!config.cleanup);
        assert!(config.manage_role);
    }

    #[test]
    fn file_settings_override_defaults() {
        let file: ConfigFile = serde_yaml::from_str(
            "split_size: 1000\nworking_location: s3://bucket/work\ncleanup: true\n",
        )
        .unwrap();

        let mut config = Config::default();
        config.apply_file(file);

        assert_eq!(config.split_size, 1000);
        assert_eq!(config.working_location, "s3://bucket/work");
        assert!(config.cleanup);
        assert_eq!(config.max_concurrency, 500);
    }

    #[test]
    fn environment_overrides_the_file() {
        let mut config = Config::default();
        config.apply_file(serde_yaml::from_str("split_size: 1000").unwrap());
        config.apply_env([
            ("DROVER_SPLIT_SIZE".to_string(), "2000".to_string()),
            ("DROVER_FUNCTION_NAME".to_string(), "wc".to_string()),
            ("UNRELATED".to_string(), "x".to_string()),
        ]);

        assert_eq!(config.split_size, 2000);
        assert_eq!(config.function_name, "wc");
    }

    #[test]
    fn unparseable_environment_values_are_ignored() {
        let mut config = Config::default();
        config.apply_env([("DROVER_SPLIT_SIZE".to_string(), "lots".to_string())]);
        assert_eq!(config.split_size, 100 * MIB);
    }

    #[test]
    fn split_size_is_clamped_to_the_bin_size() {
        let mut config = Config::default();
        config.split_size = 1000;
        config.map_bin_size = 600;
        config.clamp_split_size();
        assert_eq!(config.split_size, 600);
    }
}

//! Loader settings, read from `mbextender.ini` next to the game executable.

use std::env;
use std::path::{Path, PathBuf};

use config::Config;
use ini::Ini;
use lazy_static::lazy_static;
use tracing::Level;

use crate::host::HostAbi;

pub const CONFIG_FILE: &str = "mbextender.ini";

// Read once, the first time a setting is needed
lazy_static! {
    static ref SETTINGS: Settings = Settings::from_config(&load_config(&config_path()));
}

/// Everything the loader can be told from the outside.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub plugin_dir: PathBuf,
    /// Refuse to attach unless the game signature matches.
    pub verify_game: bool,
    pub log_file: PathBuf,
    pub log_level: Level,
    /// Address of `clientProcess(U32)`; there is no built-in default.
    pub client_process: Option<usize>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            plugin_dir: PathBuf::from(default_plugin_dir()),
            verify_game: true,
            log_file: PathBuf::from("mbextender.log"),
            log_level: Level::INFO,
            client_process: None,
        }
    }
}

impl Settings {
    /// Process-wide settings.
    pub fn get() -> &'static Settings {
        &SETTINGS
    }

    /// Reads settings out of a loaded config, falling back to the default for
    /// anything missing or malformed.
    pub fn from_config(config: &Config) -> Self {
        let defaults = Settings::default();
        Settings {
            plugin_dir: config
                .get_string("loader.plugin_dir")
                .map(PathBuf::from)
                .unwrap_or(defaults.plugin_dir),
            verify_game: config
                .get_bool("loader.verify_game")
                .unwrap_or(defaults.verify_game),
            log_file: config
                .get_string("log.file")
                .map(PathBuf::from)
                .unwrap_or(defaults.log_file),
            log_level: config
                .get_string("log.level")
                .ok()
                .and_then(|level| level.parse().ok())
                .unwrap_or(defaults.log_level),
            client_process: config
                .get_string("host.client_process")
                .ok()
                .and_then(|address| parse_address(&address)),
        }
    }
}

fn default_plugin_dir() -> &'static str {
    HostAbi::current()
        .map(|abi| abi.plugin_dir)
        .unwrap_or("plugins")
}

/// Parses a hex address, with or without a `0x` prefix.
pub fn parse_address(s: &str) -> Option<usize> {
    let s = s.trim();
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    usize::from_str_radix(digits, 16).ok().filter(|&a| a != 0)
}

fn config_path() -> PathBuf {
    env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
        .unwrap_or_default()
        .join(CONFIG_FILE)
}

/// Loads `path`, writing a default file first if there is none. Falls back
/// to an empty config if the file can't be read or written.
pub fn load_config(path: &Path) -> Config {
    get_settings(path)
        .or_else(|_| create_default_config(path))
        .unwrap_or_else(|e| {
            eprintln!("Could not load {}: {}", path.display(), e);
            Config::default()
        })
}

fn get_settings(config_path: &Path) -> color_eyre::Result<Config> {
    if !config_path.exists() {
        return Err(color_eyre::Report::msg(format!(
            "Config file not found at {}",
            config_path.display()
        )));
    }

    let settings = Config::builder()
        .add_source(config::File::from(config_path).format(config::FileFormat::Ini))
        .build()?;
    Ok(settings)
}

fn create_default_config(config_path: &Path) -> color_eyre::Result<Config> {
    let defaults = Settings::default();
    let mut conf_ini = Ini::new();

    conf_ini
        .with_section(Some("loader"))
        .set("plugin_dir", defaults.plugin_dir.to_string_lossy())
        .set("verify_game", defaults.verify_game.to_string());
    conf_ini
        .with_section(Some("log"))
        .set("file", defaults.log_file.to_string_lossy())
        .set("level", "info");
    conf_ini.write_to_file(config_path)?;
    get_settings(config_path)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    #[test]
    fn missing_file_is_created_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);

        let settings = Settings::from_config(&load_config(&path));
        assert_eq!(settings, Settings::default());
        let written = fs::read_to_string(&path).unwrap();
        assert!(written.contains("[loader]"));
        assert!(written.contains("verify_game=true"));
    }

    #[test]
    fn reads_custom_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        fs::write(
            &path,
            "[loader]\nplugin_dir=mods\nverify_game=false\n\
             [log]\nfile=debug.log\nlevel=trace\n\
             [host]\nclient_process=0x00402A1B\n",
        )
        .unwrap();

        let settings = Settings::from_config(&load_config(&path));
        assert_eq!(settings.plugin_dir, PathBuf::from("mods"));
        assert!(!settings.verify_game);
        assert_eq!(settings.log_file, PathBuf::from("debug.log"));
        assert_eq!(settings.log_level, Level::TRACE);
        assert_eq!(settings.client_process, Some(0x402A1B));
    }

    #[test]
    fn malformed_values_fall_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        fs::write(&path, "[log]\nlevel=loud\n[host]\nclient_process=nowhere\n").unwrap();

        let settings = Settings::from_config(&load_config(&path));
        assert_eq!(settings.log_level, Level::INFO);
        assert_eq!(settings.client_process, None);
    }

    #[test]
    fn addresses_parse_with_or_without_prefix() {
        assert_eq!(parse_address("0x4023AB"), Some(0x4023AB));
        assert_eq!(parse_address(" 4023ab "), Some(0x4023AB));
        assert_eq!(parse_address("0"), None);
        assert_eq!(parse_address(""), None);
    }
}

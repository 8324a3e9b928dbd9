use anyhow::{Context, Result};
use base64::Engine;
use base64::engine::general_purpose;
use image::GenericImageView;
use image::imageops::FilterType;
use serde::{Deserialize, Serialize};
use std::fs;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Default favicon shipped with the crate, used when no `server-icon.png` is configured.
const DEFAULT_FAVICON_PNG: &[u8] = include_bytes!("../assets/server-icon.png");

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct Config {
    pub listen_host: String,
    pub listen_port: u16,
    pub server_host: String,
    pub server_port: u16,

    pub start_command: String,
    pub stop_commands: Vec<String>,

    pub rcon_port: Option<u16>,
    pub rcon_password: Option<String>,

    pub expected_startup_time: u32,
    pub idle_shutdown_delay: u64,
    pub bandwidth_window: u64,
    pub debug: bool,

    pub server_version_name: String,
    pub server_protocol: i32,

    pub motd_text: String,
    pub motd_color: String,
    pub motd_bold: bool,

    pub connection_msg_text: String,
    pub connection_msg_color: String,
    pub connection_msg_bold: bool,

    pub server_icon: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            listen_host: "0.0.0.0".to_string(),
            listen_port: 25565,
            server_host: "127.0.0.1".to_string(),
            server_port: 25566,

            start_command: "cd PATH/TO/SERVERFOLDER; screen -dmS minecraftSERVER nice -19 java -jar minecraft_server.jar".to_string(),
            stop_commands: vec!["screen -S minecraftSERVER -X stuff 'stop\\n'".to_string()],

            rcon_port: None,
            rcon_password: None,

            expected_startup_time: 20,
            idle_shutdown_delay: 60,
            bandwidth_window: 3,
            debug: false,

            server_version_name: "mcnap".to_string(),
            server_protocol: 766,

            motd_text: "Napping... Join to start server".to_string(),
            motd_color: "aqua".to_string(),
            motd_bold: true,

            connection_msg_text: "Server start command issued. Please wait...".to_string(),
            connection_msg_color: "light_purple".to_string(),
            connection_msg_bold: true,

            server_icon: None,
        }
    }
}

/// Loads `config/cfg.toml`, creating a default one (and the `config/` directory) if absent,
/// and rewrites the file so newly-added fields and the resolved favicon are persisted.
pub fn get_config() -> Result<Config> {
    get_config_from(Path::new("config"))
}

/// Same as [`get_config`], reading from an explicit config directory instead of the
/// hardcoded `config/` default.
pub fn get_config_from(config_dir: &Path) -> Result<Config> {
    load_from(config_dir)
}

fn load_from(config_dir: &Path) -> Result<Config> {
    if !config_dir.exists() {
        log::info!("No configuration directory found. Creating {:?}.", config_dir);
        fs::create_dir_all(config_dir).context("cannot create config directory")?;
    }
    let config_path = config_dir.join("cfg.toml");

    let mut config = match fs::read_to_string(&config_path) {
        Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
            log::warn!("Config file malformed ({e}), falling back to defaults.");
            Config::default()
        }),
        Err(_) => {
            log::info!(
                "No configuration file found. Creating default configuration file at {:?}.",
                config_path
            );
            Config::default()
        }
    };

    config.server_icon = Some(resolve_favicon_base64(config_dir)?);
    persist(&config_path, &config)?;
    Ok(config)
}

/// Resizes `config/server-icon.png` to 64x64 if present, else falls back to the embedded default.
fn resolve_favicon_base64(config_dir: &Path) -> Result<String> {
    let icon_path = config_dir.join("server-icon.png");
    match resize_image_to_64x64(&icon_path) {
        Ok(resized) => {
            resized
                .save(&icon_path)
                .context("failed to save resized server-icon.png")?;
            let bytes = fs::read(&icon_path).context("failed to read server-icon.png")?;
            Ok(general_purpose::STANDARD.encode(bytes))
        }
        Err(_) => {
            log::info!("No server-icon.png found in {:?}; using default favicon.", config_dir);
            Ok(general_purpose::STANDARD.encode(DEFAULT_FAVICON_PNG))
        }
    }
}

fn resize_image_to_64x64(path: &PathBuf) -> Result<image::DynamicImage> {
    let img = image::open(path)?;
    let (width, height) = img.dimensions();
    if width == 64 && height == 64 {
        return Ok(img);
    }
    Ok(img.resize_exact(64, 64, FilterType::CatmullRom))
}

/// Writes `config` back to `path` atomically: a temp file is renamed over the target so a
/// crash mid-write never leaves a truncated config behind.
fn persist(path: &Path, config: &Config) -> Result<()> {
    let toml_str = toml::to_string_pretty(config).context("cannot serialize config")?;
    let tmp_path = path.with_extension("toml.tmp");
    {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)
            .context("cannot open temp config file for writing")?;
        file.write_all(toml_str.as_bytes())
            .context("cannot write temp config file")?;
    }
    fs::rename(&tmp_path, path).context("cannot replace config file")?;
    Ok(())
}

/// Called by the dispatcher when a live handshake reveals a different server version/protocol
/// than the one currently configured.
pub fn persist_learned_version(config_dir: &Path, config: &Config) -> Result<()> {
    persist(&config_dir.join("cfg.toml"), config)
}

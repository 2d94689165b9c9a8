use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};

use toml::{Table, Value};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::image::ImageSize;

const SECTION: &str = "DEFAULT";

const KEY_API: &str = "API";
const KEY_API_BASE: &str = "API_BASE";
const KEY_MODEL: &str = "MODEL";
const KEY_MAX_TOKENS: &str = "MAX_TOKENS";
const KEY_TEMPERATURE: &str = "TEMPERATURE";
const KEY_WIDTH: &str = "WIDTH";
const KEY_NUMBER: &str = "NUMBER";
const KEY_IMAGE_SIZE: &str = "IMAGE_SIZE";

pub const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-3.5-turbo";
pub const DEFAULT_MAX_TOKENS: u32 = 100;
pub const DEFAULT_TEMPERATURE: f32 = 0.7;
pub const DEFAULT_WIDTH: usize = 80;
pub const DEFAULT_NUMBER: u32 = 1;

/// User settings persisted in `~/.tgpt/config`.
///
/// Values are not range checked; a temperature of 5.0 is forwarded to the API
/// as is and left for the server to reject.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub api_key: String,
    pub api_base: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub image_size: ImageSize,
    pub width: usize,
    pub default_completion_count: u32,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            api_key: String::new(),
            api_base: DEFAULT_API_BASE.to_string(),
            model: DEFAULT_MODEL.to_string(),
            max_tokens: DEFAULT_MAX_TOKENS,
            temperature: DEFAULT_TEMPERATURE,
            image_size: ImageSize::Medium,
            width: DEFAULT_WIDTH,
            default_completion_count: DEFAULT_NUMBER,
        }
    }
}

impl Config {
    /// Reads every recognized key from the `[DEFAULT]` table of `table`,
    /// substituting the default for each key that is missing or unparsable.
    fn from_table(table: &Table) -> Self {
        let section = table
            .get(SECTION)
            .and_then(Value::as_table)
            .unwrap_or(table);
        let defaults = Config::default();

        Config {
            api_key: get_string(section, KEY_API).unwrap_or(defaults.api_key),
            api_base: get_string(section, KEY_API_BASE).unwrap_or(defaults.api_base),
            model: get_string(section, KEY_MODEL).unwrap_or(defaults.model),
            max_tokens: get_integer(section, KEY_MAX_TOKENS).unwrap_or(defaults.max_tokens),
            temperature: get_float(section, KEY_TEMPERATURE).unwrap_or(defaults.temperature),
            image_size: get_string(section, KEY_IMAGE_SIZE)
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.image_size),
            width: get_integer(section, KEY_WIDTH).unwrap_or(defaults.width),
            default_completion_count: get_integer(section, KEY_NUMBER)
                .unwrap_or(defaults.default_completion_count),
        }
    }

    fn to_table(&self) -> Table {
        let mut section = Table::new();
        section.insert(KEY_API.into(), Value::String(self.api_key.clone()));
        section.insert(KEY_API_BASE.into(), Value::String(self.api_base.clone()));
        section.insert(KEY_MODEL.into(), Value::String(self.model.clone()));
        section.insert(KEY_MAX_TOKENS.into(), Value::Integer(self.max_tokens.into()));
        // widen through the shortest decimal so 0.7 is written as 0.7
        let temperature = self
            .temperature
            .to_string()
            .parse()
            .unwrap_or(f64::from(self.temperature));
        section.insert(KEY_TEMPERATURE.into(), Value::Float(temperature));
        section.insert(KEY_WIDTH.into(), Value::Integer(self.width as i64));
        section.insert(
            KEY_NUMBER.into(),
            Value::Integer(self.default_completion_count.into()),
        );
        section.insert(
            KEY_IMAGE_SIZE.into(),
            Value::String(self.image_size.name().to_string()),
        );

        let mut table = Table::new();
        table.insert(SECTION.into(), Value::Table(section));
        table
    }
}

fn get_string(section: &Table, key: &str) -> Option<String> {
    section.get(key).and_then(Value::as_str).map(str::to_string)
}

fn get_integer<T: TryFrom<i64>>(section: &Table, key: &str) -> Option<T> {
    let value = match section.get(key)? {
        Value::Integer(i) => *i,
        Value::String(s) => s.trim().parse().ok()?,
        _ => return None,
    };
    T::try_from(value).ok()
}

fn get_float(section: &Table, key: &str) -> Option<f32> {
    match section.get(key)? {
        Value::Float(f) => Some(*f as f32),
        Value::Integer(i) => Some(*i as f32),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Loads and saves [`Config`] at a fixed path.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        ConfigStore { path: path.into() }
    }

    pub fn default_location() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        Self::new(home.join(".tgpt").join("config"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the config, writing a fresh file when none exists yet. The
    /// operator is asked for an API key on stdin only if `ask_key` is set;
    /// otherwise the new file is written with an empty key.
    pub fn load(&self, ask_key: bool) -> Config {
        if ask_key {
            self.load_or_create(prompt_for_api_key)
        } else {
            self.load_or_create(|| Ok(String::new()))
        }
    }

    /// Loads the config. When the file is absent, `ask_key` supplies the API
    /// key for a new default config which is then written to disk. Read and
    /// parse failures are logged and yield the all-defaults config.
    pub fn load_or_create<F>(&self, ask_key: F) -> Config
    where
        F: FnOnce() -> io::Result<String>,
    {
        if !self.path.exists() {
            let api_key = ask_key().unwrap_or_else(|e| {
                warn!("could not read an API key: {}", e);
                String::new()
            });
            let config = Config {
                api_key: api_key.trim().to_string(),
                ..Config::default()
            };
            match self.save(&config) {
                Ok(()) => eprintln!("Created a new config file at: {}", self.path.display()),
                Err(e) => warn!("{}", e),
            }
            return config;
        }

        match self.read() {
            Ok(config) => config,
            Err(e) => {
                warn!("{}; using default settings", e);
                Config::default()
            }
        }
    }

    fn read(&self) -> Result<Config> {
        let contents = std::fs::read_to_string(&self.path).map_err(|e| {
            Error::Config(format!("unable to read {}: {}", self.path.display(), e))
        })?;
        let table = contents.parse::<Table>().map_err(|e| {
            Error::Config(format!("unable to parse {}: {}", self.path.display(), e))
        })?;
        debug!("loaded config from {}", self.path.display());
        Ok(Config::from_table(&table))
    }

    /// Writes every key of `config`, creating parent directories as needed.
    pub fn save(&self, config: &Config) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::Config(format!("unable to create {}: {}", parent.display(), e))
            })?;
        }
        let text = toml::to_string(&config.to_table())
            .map_err(|e| Error::Config(format!("unable to serialize config: {}", e)))?;
        std::fs::write(&self.path, text).map_err(|e| {
            Error::Config(format!("unable to write {}: {}", self.path.display(), e))
        })
    }
}

fn prompt_for_api_key() -> io::Result<String> {
    print!("No config found. Enter your OpenAI API key: ");
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    Ok(line)
}

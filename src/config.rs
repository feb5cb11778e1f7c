//! The `[preprocessor.d2]` table of `book.toml`.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Deserialize;

/// Default path to the D2 binary
fn default_executable() -> PathBuf {
    PathBuf::from("d2")
}

/// Default cache directory, relative to the book root
fn default_cache_dir() -> PathBuf {
    PathBuf::from(".cache/d2")
}

const fn default_cache() -> bool {
    true
}

fn default_layout() -> String {
    String::from("dagre")
}

/// Sentinel meaning "no dark theme"
pub const NO_DARK_THEME: i64 = -1;

const fn default_dark_theme() -> i64 {
    NO_DARK_THEME
}

const fn default_pad() -> i64 {
    100
}

const fn default_scale() -> f64 {
    -1.0
}

fn default_target() -> String {
    String::from("''")
}

fn default_min_version() -> String {
    String::from("0.6.3")
}

/// How rendering options reach the d2 process
#[derive(Deserialize, PartialEq, Eq, Debug, Clone, Copy, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Invocation {
    /// `--flag=value` command line tokens
    #[default]
    Flags,
    /// `D2_*` environment variables (legacy)
    Env,
}

/// What to do with per-diagram attributes that are not known options
#[derive(Deserialize, PartialEq, Eq, Debug, Clone, Copy, Default)]
#[serde(rename_all = "kebab-case")]
pub enum UnknownOptions {
    /// Fail validation for the diagram
    #[default]
    Reject,
    /// Forward them to d2 as extra `--key=value` flags
    PassThrough,
}

/// Severity of a d2 binary older than `min-version`
#[derive(Deserialize, PartialEq, Eq, Debug, Clone, Copy, Default)]
#[serde(rename_all = "kebab-case")]
pub enum VersionCheck {
    /// Refuse to build
    #[default]
    Error,
    /// Log a warning and build anyway
    Warn,
    /// Skip running `d2 --version` altogether
    Off,
}

/// `[preprocessor.d2]` section of `book.toml`
#[derive(Deserialize, PartialEq, Debug, Clone)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Config {
    /// The path to the d2 binary
    #[serde(default = "default_executable")]
    pub executable: PathBuf,

    /// Whether rendered diagrams are persisted between builds
    #[serde(default = "default_cache")]
    pub cache: bool,

    /// Where the cache lives, relative to the book root unless absolute
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    /// Default layout engine
    #[serde(default = "default_layout")]
    pub layout: String,
    /// Default theme id
    #[serde(default)]
    pub theme: i64,
    /// Theme id of the dark variant, or [`NO_DARK_THEME`]
    #[serde(default = "default_dark_theme")]
    pub dark_theme: i64,
    /// Default to the hand-drawn look
    #[serde(default)]
    pub sketch: bool,
    /// Default padding in pixels
    #[serde(default = "default_pad")]
    pub pad: i64,
    /// Default scale, `-1` to fit
    #[serde(default = "default_scale")]
    pub scale: f64,
    /// Default for rendering tooltips and links as an appendix
    #[serde(default)]
    pub force_appendix: bool,
    /// Default board to render, `''` for the root board
    #[serde(default = "default_target")]
    pub target: String,

    /// How options are handed to d2
    #[serde(default)]
    pub invocation: Invocation,

    /// Policy for per-diagram attributes that are not known options
    #[serde(default)]
    pub unknown_options: UnknownOptions,

    /// Extra flags passed to every d2 invocation
    #[serde(default)]
    pub extra: BTreeMap<String, String>,

    /// Oldest d2 release this preprocessor is known to work with
    #[serde(default = "default_min_version")]
    pub min_version: String,

    /// What an older d2 means for the build
    #[serde(default)]
    pub version_check: VersionCheck,

    /// Ignored, set by mdBook itself for every preprocessor table
    #[serde(default)]
    pub command: Option<String>,
    /// Ignored, read by mdBook
    #[serde(default)]
    pub renderers: Option<Vec<String>>,
    /// Ignored, read by mdBook
    #[serde(default)]
    pub before: Option<Vec<String>>,
    /// Ignored, read by mdBook
    #[serde(default)]
    pub after: Option<Vec<String>>,
    /// Ignored, read by mdBook
    #[serde(default)]
    pub optional: Option<bool>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            executable: default_executable(),
            cache: default_cache(),
            cache_dir: default_cache_dir(),
            layout: default_layout(),
            theme: 0,
            dark_theme: default_dark_theme(),
            sketch: false,
            pad: default_pad(),
            scale: default_scale(),
            force_appendix: false,
            target: default_target(),
            invocation: Invocation::default(),
            unknown_options: UnknownOptions::default(),
            extra: BTreeMap::new(),
            min_version: default_min_version(),
            version_check: VersionCheck::default(),
            command: None,
            renderers: None,
            before: None,
            after: None,
            optional: None,
        }
    }
}

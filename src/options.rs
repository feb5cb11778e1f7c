//! Rendering options: merging the book-wide defaults with per-diagram
//! attributes, validating them, and turning them into d2 arguments.

use std::collections::BTreeMap;
use std::fmt;

use crate::config::{Config, Invocation, UnknownOptions, NO_DARK_THEME};

/// A raw attribute value, as written on a fence line, an `<img>` tag or in `book.toml`
#[derive(Debug, Clone, PartialEq)]
pub enum RawValue {
    /// Quoted or bare text
    Str(String),
    /// A bare flag such as `sketch`, or a TOML boolean
    Bool(bool),
    /// TOML integer
    Int(i64),
    /// TOML float
    Float(f64),
}

impl fmt::Display for RawValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Str(s) => f.write_str(s),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
        }
    }
}

impl From<&str> for RawValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_owned())
    }
}

impl From<String> for RawValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<bool> for RawValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for RawValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for RawValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

/// Per-diagram option overrides, keyed by attribute name
pub type Overrides = BTreeMap<String, RawValue>;

/// The kind of value a field expects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// Whole number, possibly negative
    Integer,
    /// Finite number
    Float,
    /// `true`, `yes`, `on`, `1` or their opposites
    Boolean,
    /// Text without control characters
    String,
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Integer => "integer",
            Self::Float => "float",
            Self::Boolean => "boolean",
            Self::String => "string",
        })
    }
}

/// A single field that failed validation
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FieldError {
    /// The value does not parse as the field's kind
    #[error("invalid value `{value}` for `{field}`: expected {expected}")]
    Invalid {
        /// Attribute name as written
        field: String,
        /// Offending value
        value: String,
        /// What the field accepts
        expected: Kind,
    },
    /// Not a known option and unknown options are rejected
    #[error("unknown option `{field}`")]
    Unknown {
        /// Attribute name as written
        field: String,
    },
    /// A passed-through flag that could smuggle extra arguments
    #[error("unsafe extra flag `{field}={value}`")]
    UnsafeFlag {
        /// Flag name
        field: String,
        /// Flag value
        value: String,
    },
}

impl FieldError {
    /// Name of the offending field
    pub fn field(&self) -> &str {
        match self {
            Self::Invalid { field, .. } | Self::Unknown { field } | Self::UnsafeFlag { field, .. } => {
                field
            }
        }
    }
}

/// Every field error found while resolving one set of options
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("invalid d2 options: {}", join_errors(.errors))]
pub struct ValidationError {
    /// In the order the fields were checked
    pub errors: Vec<FieldError>,
}

fn join_errors(errors: &[FieldError]) -> String {
    let messages: Vec<String> = errors.iter().map(ToString::to_string).collect();
    messages.join("; ")
}

/// Fully resolved options for one d2 invocation
///
/// Built by [`Defaults::resolve`], never mutated afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderOptions {
    /// Layout engine, e.g. `dagre` or `elk`
    pub layout: String,
    /// Theme id
    pub theme: i64,
    /// `None` when no dark theme is configured
    pub dark_theme: Option<i64>,
    /// Hand-drawn look
    pub sketch: bool,
    /// Padding around the diagram, in pixels
    pub pad: i64,
    /// Scale factor, `-1` to fit
    pub scale: f64,
    /// Always render tooltips and links as an appendix
    pub force_appendix: bool,
    /// Board to render, empty for the root board
    pub target: String,
    /// Additional `--key=value` flags, validated only for unsafe characters
    pub extra: BTreeMap<String, String>,
}

/// Arguments and environment for one d2 process
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandLine {
    /// Flags, without the input and output paths
    pub args: Vec<String>,
    /// Variables added to the inherited environment
    pub env: Vec<(String, String)>,
}

impl RenderOptions {
    /// Canonical flag serialization
    ///
    /// The order is fixed so that equal options always produce the same list.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = self.known_args();
        args.extend(self.extra_args());
        args
    }

    fn known_args(&self) -> Vec<String> {
        let mut args = vec![
            format!("--layout={}", self.layout),
            format!("--theme={}", self.theme),
            format!(
                "--dark-theme={}",
                self.dark_theme.unwrap_or(NO_DARK_THEME)
            ),
            format!("--pad={}", self.pad),
            format!("--scale={}", self.scale),
            format!("--target={}", self.target),
        ];
        if self.sketch {
            args.push(String::from("--sketch"));
        }
        if self.force_appendix {
            args.push(String::from("--force-appendix"));
        }
        args
    }

    fn extra_args(&self) -> impl Iterator<Item = String> + '_ {
        self.extra.iter().map(|(k, v)| format!("--{k}={v}"))
    }

    /// Legacy `D2_*` environment serialization of the known options
    pub fn to_env(&self) -> Vec<(String, String)> {
        let flag = |b: bool| String::from(if b { "1" } else { "0" });
        vec![
            (String::from("D2_LAYOUT"), self.layout.clone()),
            (String::from("D2_THEME"), self.theme.to_string()),
            (
                String::from("D2_DARK_THEME"),
                self.dark_theme.unwrap_or(NO_DARK_THEME).to_string(),
            ),
            (String::from("D2_PAD"), self.pad.to_string()),
            (String::from("D2_SCALE"), self.scale.to_string()),
            (String::from("D2_TARGET"), self.target.clone()),
            (String::from("D2_SKETCH"), flag(self.sketch)),
            (String::from("D2_FORCE_APPENDIX"), flag(self.force_appendix)),
        ]
    }

    /// Serializes for the given invocation convention
    ///
    /// Extra flags always travel on the command line.
    pub fn command_line(&self, invocation: Invocation) -> CommandLine {
        match invocation {
            Invocation::Flags => CommandLine {
                args: self.to_args(),
                env: Vec::new(),
            },
            Invocation::Env => CommandLine {
                args: self.extra_args().collect(),
                env: self.to_env(),
            },
        }
    }

    /// These options with the dark theme dropped
    pub fn light_variant(&self) -> Self {
        Self {
            dark_theme: None,
            ..self.clone()
        }
    }

    /// These options rendered with the dark theme as the main theme
    ///
    /// Returns `None` when no dark theme is configured or it matches the
    /// light theme.
    pub fn dark_variant(&self) -> Option<Self> {
        self.dark_theme.filter(|&dark| dark != self.theme).map(|theme| Self {
            theme,
            dark_theme: None,
            ..self.clone()
        })
    }
}

/// Book-wide defaults plus the policies that apply to every diagram
#[derive(Debug, Clone, PartialEq)]
pub struct Defaults {
    options: RenderOptions,
    unknown: UnknownOptions,
    invocation: Invocation,
}

impl Defaults {
    /// Validates the global configuration once, at build start
    pub fn from_config(config: &Config) -> Result<Self, ValidationError> {
        let mut errors = Vec::new();
        for (key, value) in &config.extra {
            if let Err(e) = check_flag(key, value) {
                errors.push(e);
            }
        }
        if config.layout.trim().is_empty() || has_control(&config.layout) {
            errors.push(FieldError::Invalid {
                field: String::from("layout"),
                value: config.layout.clone(),
                expected: Kind::String,
            });
        }
        if !config.scale.is_finite() {
            errors.push(FieldError::Invalid {
                field: String::from("scale"),
                value: config.scale.to_string(),
                expected: Kind::Float,
            });
        }
        if !errors.is_empty() {
            return Err(ValidationError { errors });
        }

        Ok(Self {
            options: RenderOptions {
                layout: config.layout.clone(),
                theme: config.theme,
                dark_theme: dark_theme(config.dark_theme),
                sketch: config.sketch,
                pad: config.pad,
                scale: config.scale,
                force_appendix: config.force_appendix,
                target: unquote(&config.target).to_owned(),
                extra: config.extra.clone(),
            },
            unknown: config.unknown_options,
            invocation: config.invocation,
        })
    }

    /// How every render of this build passes its options to d2
    pub const fn invocation(&self) -> Invocation {
        self.invocation
    }

    /// Merges `overrides` over the defaults, field by field
    ///
    /// All field errors are collected; nothing is silently coerced.
    pub fn resolve(&self, overrides: &Overrides) -> Result<RenderOptions, ValidationError> {
        let mut options = self.options.clone();
        let mut errors = Vec::new();

        for (key, value) in overrides {
            if let Err(e) = self.apply(&mut options, key, value) {
                errors.push(e);
            }
        }

        if errors.is_empty() {
            Ok(options)
        } else {
            Err(ValidationError { errors })
        }
    }

    fn apply(
        &self,
        options: &mut RenderOptions,
        key: &str,
        value: &RawValue,
    ) -> Result<(), FieldError> {
        let name = normalize_key(key);
        match name.as_str() {
            "layout" => options.layout = parse_string(key, value, false)?,
            "theme" => options.theme = parse_int(key, value)?,
            "dark-theme" => options.dark_theme = dark_theme(parse_int(key, value)?),
            "sketch" => options.sketch = parse_bool(key, value)?,
            "pad" => options.pad = parse_int(key, value)?,
            "scale" => options.scale = parse_float(key, value)?,
            "force-appendix" => options.force_appendix = parse_bool(key, value)?,
            "target" => options.target = unquote(&parse_string(key, value, true)?).to_owned(),
            _ => match self.unknown {
                UnknownOptions::Reject => {
                    return Err(FieldError::Unknown {
                        field: key.to_owned(),
                    })
                }
                UnknownOptions::PassThrough => {
                    let value = value.to_string();
                    check_flag(&name, &value)?;
                    options.extra.insert(name.clone(), value);
                }
            },
        }
        Ok(())
    }
}

fn dark_theme(id: i64) -> Option<i64> {
    (id != NO_DARK_THEME).then_some(id)
}

fn normalize_key(key: &str) -> String {
    key.trim().to_ascii_lowercase().replace('_', "-")
}

/// `''` and `""` both mean the empty target (the root board)
fn unquote(s: &str) -> &str {
    let s = s.trim();
    for quote in ['\'', '"'] {
        if let Some(inner) = s.strip_prefix(quote).and_then(|s| s.strip_suffix(quote)) {
            return inner;
        }
    }
    s
}

fn has_control(s: &str) -> bool {
    s.chars().any(char::is_control)
}

fn invalid(field: &str, value: &RawValue, expected: Kind) -> FieldError {
    FieldError::Invalid {
        field: field.to_owned(),
        value: value.to_string(),
        expected,
    }
}

/// Parses the truthy/falsy vocabulary shared by fence and tag attributes
pub fn parse_bool(field: &str, value: &RawValue) -> Result<bool, FieldError> {
    match value {
        RawValue::Bool(b) => Ok(*b),
        RawValue::Str(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(true),
            "false" | "0" | "no" | "off" => Ok(false),
            _ => Err(invalid(field, value, Kind::Boolean)),
        },
        RawValue::Int(_) | RawValue::Float(_) => Err(invalid(field, value, Kind::Boolean)),
    }
}

fn parse_int(field: &str, value: &RawValue) -> Result<i64, FieldError> {
    match value {
        RawValue::Int(i) => Ok(*i),
        RawValue::Str(s) => s
            .trim()
            .parse()
            .map_err(|_| invalid(field, value, Kind::Integer)),
        RawValue::Bool(_) | RawValue::Float(_) => Err(invalid(field, value, Kind::Integer)),
    }
}

fn parse_float(field: &str, value: &RawValue) -> Result<f64, FieldError> {
    let parsed = match value {
        RawValue::Float(x) => Some(*x),
        #[allow(clippy::cast_precision_loss)]
        RawValue::Int(i) => Some(*i as f64),
        RawValue::Str(s) => s.trim().parse::<f64>().ok(),
        RawValue::Bool(_) => None,
    };
    parsed
        .filter(|x| x.is_finite())
        .ok_or_else(|| invalid(field, value, Kind::Float))
}

fn parse_string(field: &str, value: &RawValue, allow_empty: bool) -> Result<String, FieldError> {
    match value {
        RawValue::Str(s) if (allow_empty || !s.trim().is_empty()) && !has_control(s) => {
            Ok(s.trim().to_owned())
        }
        _ => Err(invalid(field, value, Kind::String)),
    }
}

fn check_flag(key: &str, value: &str) -> Result<(), FieldError> {
    let mut chars = key.chars();
    let key_ok = chars.next().is_some_and(|c| c.is_ascii_alphanumeric())
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if key_ok && !has_control(value) {
        Ok(())
    } else {
        Err(FieldError::UnsafeFlag {
            field: key.to_owned(),
            value: value.to_owned(),
        })
    }
}

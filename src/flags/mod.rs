//! Declarative feature flag table.
//!
//! Every toggle a build understands is declared once in [`FLAG_TABLE`]: its
//! type, its default, the environment variables the build script receives and
//! the provisioning step it gates. Raw flags from the spec file or the command
//! line are validated against the table exactly once, producing a complete
//! [`FeatureFlagSet`] that every stage reads but never modifies.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{BuildError, Result};

/// A flag value as written by the user, before validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawFlagValue {
    Bool(bool),
    Text(String),
}

impl fmt::Display for RawFlagValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RawFlagValue::Bool(value) => write!(f, "{value}"),
            RawFlagValue::Text(value) => f.write_str(value),
        }
    }
}

pub type RawFlags = BTreeMap<String, RawFlagValue>;

/// A validated flag value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum FlagValue {
    Bool(bool),
    Choice(String),
}

impl FlagValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FlagValue::Bool(value) => Some(*value),
            FlagValue::Choice(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FlagValue::Bool(_) => None,
            FlagValue::Choice(value) => Some(value),
        }
    }

    fn to_raw(&self) -> RawFlagValue {
        match self {
            FlagValue::Bool(value) => RawFlagValue::Bool(*value),
            FlagValue::Choice(value) => RawFlagValue::Text(value.clone()),
        }
    }
}

impl fmt::Display for FlagValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlagValue::Bool(value) => write!(f, "{value}"),
            FlagValue::Choice(value) => f.write_str(value),
        }
    }
}

/// Package mirror / settings sourcing region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Region {
    Default,
    Restricted,
}

impl Region {
    pub fn as_str(self) -> &'static str {
        match self {
            Region::Default => "default",
            Region::Restricted => "restricted",
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum FlagKind {
    Bool,
    Profile,
    Region,
}

/// How a flag value is spelled in the build script's environment.
#[derive(Debug, Clone, Copy)]
enum EnvEncoding {
    /// `true`/`false` for booleans, the value itself for choices.
    Value,
    /// `on`/`off`.
    OnOff,
    /// `true` when the choice equals the given value.
    Equals(&'static str),
}

#[derive(Debug)]
pub struct FlagDef {
    pub name: &'static str,
    kind: FlagKind,
    default: &'static str,
    script_env: &'static [(&'static str, EnvEncoding)],
    runtime_env: Option<&'static str>,
    /// Optional provisioning step gated by this flag.
    pub step: Option<&'static str>,
}

pub const FLAG_TABLE: &[FlagDef] = &[
    FlagDef {
        name: "profile",
        kind: FlagKind::Profile,
        default: "main",
        script_env: &[
            ("BUILD_PROFILE", EnvEncoding::Value),
            ("MVN_PROFILE", EnvEncoding::Value),
        ],
        runtime_env: Some("APP_PROFILE"),
        step: None,
    },
    FlagDef {
        name: "installFonts",
        kind: FlagKind::Bool,
        default: "false",
        script_env: &[("INSTALL_FONTS", EnvEncoding::Value)],
        runtime_env: None,
        step: Some("fonts"),
    },
    FlagDef {
        name: "installMediaTools",
        kind: FlagKind::Bool,
        default: "false",
        script_env: &[("INSTALL_FFMPEG", EnvEncoding::Value)],
        runtime_env: None,
        step: Some("media-tools"),
    },
    FlagDef {
        name: "installOfficeTools",
        kind: FlagKind::Bool,
        default: "false",
        script_env: &[("INSTALL_LIBREOFFICE", EnvEncoding::Value)],
        runtime_env: None,
        step: Some("office-tools"),
    },
    FlagDef {
        name: "useAltAllocator",
        kind: FlagKind::Bool,
        default: "false",
        script_env: &[("USE_ALT_ALLOCATOR", EnvEncoding::Value)],
        runtime_env: Some("USE_ALT_ALLOCATOR"),
        step: None,
    },
    FlagDef {
        name: "region",
        kind: FlagKind::Region,
        default: "default",
        script_env: &[
            ("BUILD_REGION", EnvEncoding::Value),
            ("IN_CHINA", EnvEncoding::Equals("restricted")),
        ],
        runtime_env: None,
        step: None,
    },
    FlagDef {
        name: "buildDebug",
        kind: FlagKind::Bool,
        default: "false",
        script_env: &[("MVN_DEBUG", EnvEncoding::OnOff)],
        runtime_env: None,
        step: None,
    },
    FlagDef {
        name: "copyConfigFiles",
        kind: FlagKind::Bool,
        default: "false",
        script_env: &[("MVN_COPY_YAML", EnvEncoding::Value)],
        runtime_env: None,
        step: None,
    },
];

/// Spelling-insensitive key: `installFonts`, `install_fonts` and
/// `install-fonts` all map to `installfonts`.
fn canonical_key(name: &str) -> String {
    name.chars()
        .filter(|c| *c != '_' && *c != '-')
        .flat_map(char::to_lowercase)
        .collect()
}

fn lookup(name: &str) -> Option<&'static FlagDef> {
    let key = canonical_key(name.trim());
    FLAG_TABLE.iter().find(|def| canonical_key(def.name) == key)
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub(crate) fn is_safe_name(value: &str) -> bool {
    !value.is_empty()
        && !value.starts_with('.')
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-')
}

/// Validated, complete set of flag values for one build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureFlagSet {
    values: BTreeMap<&'static str, FlagValue>,
}

impl FeatureFlagSet {
    pub fn get(&self, name: &str) -> Option<&FlagValue> {
        let def = lookup(name)?;
        self.values.get(def.name)
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        self.get(name).and_then(FlagValue::as_bool).unwrap_or(false)
    }

    pub fn profile(&self) -> &str {
        self.values
            .get("profile")
            .and_then(FlagValue::as_str)
            .unwrap_or("main")
    }

    pub fn region(&self) -> Region {
        match self.values.get("region").and_then(FlagValue::as_str) {
            Some("restricted") => Region::Restricted,
            _ => Region::Default,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &FlagValue)> {
        self.values.iter().map(|(name, value)| (*name, value))
    }

    /// Canonical raw form; validating it again yields an equal set.
    pub fn raw(&self) -> RawFlags {
        self.values
            .iter()
            .map(|(name, value)| (name.to_string(), value.to_raw()))
            .collect()
    }

    /// Name → value map for manifests.
    pub fn snapshot(&self) -> BTreeMap<String, FlagValue> {
        self.values
            .iter()
            .map(|(name, value)| (name.to_string(), value.clone()))
            .collect()
    }

    /// Environment exported to build scripts, in table order.
    pub fn script_env(&self) -> Vec<(String, String)> {
        let mut env = Vec::new();
        for def in FLAG_TABLE {
            let Some(value) = self.values.get(def.name) else {
                continue;
            };
            for (var, encoding) in def.script_env {
                let rendered = match (encoding, value) {
                    (EnvEncoding::Value, value) => value.to_string(),
                    (EnvEncoding::OnOff, FlagValue::Bool(true)) => "on".to_string(),
                    (EnvEncoding::OnOff, _) => "off".to_string(),
                    (EnvEncoding::Equals(expected), value) => {
                        (value.as_str() == Some(*expected)).to_string()
                    }
                };
                env.push((var.to_string(), rendered));
            }
        }
        env
    }

    /// Environment toggles carried into the runtime image.
    pub fn runtime_env(&self) -> BTreeMap<String, String> {
        FLAG_TABLE
            .iter()
            .filter_map(|def| {
                let var = def.runtime_env?;
                let value = self.values.get(def.name)?;
                Some((var.to_string(), value.to_string()))
            })
            .collect()
    }

    /// Every flag-gated provisioning step as `(step, flag, enabled)`.
    pub fn provisioning_steps(&self) -> Vec<(&'static str, &'static str, bool)> {
        FLAG_TABLE
            .iter()
            .filter_map(|def| {
                let step = def.step?;
                Some((step, def.name, self.is_enabled(def.name)))
            })
            .collect()
    }
}

/// Validation rules that depend on the project, e.g. its declared profiles.
#[derive(Debug, Clone, Default)]
pub struct FlagSchema {
    profiles: Vec<String>,
}

impl FlagSchema {
    /// Restrict `profile` to the given names. An empty list allows any
    /// well-formed profile name.
    pub fn with_profiles(profiles: Vec<String>) -> Result<Self> {
        for profile in &profiles {
            if !is_safe_name(profile) {
                return Err(BuildError::invalid_spec(format!(
                    "profile name '{profile}' must be letters, digits, '.', '_' or '-'"
                )));
            }
        }
        Ok(Self { profiles })
    }

    pub fn validate(&self, raw: &RawFlags) -> Result<FeatureFlagSet> {
        let mut spelled: BTreeMap<&'static str, &str> = BTreeMap::new();
        let mut values = BTreeMap::new();

        for (name, value) in raw {
            let def = lookup(name).ok_or_else(|| BuildError::UnknownFlag { name: name.clone() })?;
            if let Some(previous) = spelled.insert(def.name, name.as_str()) {
                return Err(BuildError::InvalidValue {
                    name: def.name.to_string(),
                    value: value.to_string(),
                    expected: format!("a single value (already given as '{previous}')"),
                });
            }
            values.insert(def.name, self.parse_value(def, value)?);
        }

        for def in FLAG_TABLE {
            if !values.contains_key(def.name) {
                values.insert(def.name, self.default_value(def));
            }
        }

        Ok(FeatureFlagSet { values })
    }

    fn default_value(&self, def: &FlagDef) -> FlagValue {
        match def.kind {
            FlagKind::Bool => FlagValue::Bool(parse_bool(def.default).unwrap_or(false)),
            FlagKind::Profile => {
                let fallback = if self.profiles.is_empty()
                    || self.profiles.iter().any(|p| p == def.default)
                {
                    def.default.to_string()
                } else {
                    self.profiles[0].clone()
                };
                FlagValue::Choice(fallback)
            }
            FlagKind::Region => FlagValue::Choice(def.default.to_string()),
        }
    }

    fn parse_value(&self, def: &FlagDef, value: &RawFlagValue) -> Result<FlagValue> {
        let invalid = |expected: String| BuildError::InvalidValue {
            name: def.name.to_string(),
            value: value.to_string(),
            expected,
        };

        match (def.kind, value) {
            (FlagKind::Bool, RawFlagValue::Bool(b)) => Ok(FlagValue::Bool(*b)),
            (FlagKind::Bool, RawFlagValue::Text(text)) => parse_bool(text)
                .map(FlagValue::Bool)
                .ok_or_else(|| invalid("a boolean (true/false/yes/no/on/off/1/0)".to_string())),
            (FlagKind::Profile, RawFlagValue::Text(text)) => {
                let profile = text.trim();
                if self.profiles.is_empty() {
                    if is_safe_name(profile) {
                        return Ok(FlagValue::Choice(profile.to_string()));
                    }
                    return Err(invalid(
                        "a profile name of letters, digits, '.', '_' or '-'".to_string(),
                    ));
                }
                if self.profiles.iter().any(|p| p == profile) {
                    Ok(FlagValue::Choice(profile.to_string()))
                } else {
                    Err(invalid(format!("one of [{}]", self.profiles.join(", "))))
                }
            }
            (FlagKind::Region, RawFlagValue::Text(text)) => {
                match text.trim().to_ascii_lowercase().as_str() {
                    "default" => Ok(FlagValue::Choice(Region::Default.as_str().to_string())),
                    "restricted" => Ok(FlagValue::Choice(Region::Restricted.as_str().to_string())),
                    _ => Err(invalid("one of [default, restricted]".to_string())),
                }
            }
            (FlagKind::Profile, RawFlagValue::Bool(_)) => {
                Err(invalid("a profile name, not a boolean".to_string()))
            }
            (FlagKind::Region, RawFlagValue::Bool(_)) => {
                Err(invalid("one of [default, restricted]".to_string()))
            }
        }
    }
}

/// Validate raw flags with no project-specific profile restriction.
pub fn validate(raw: &RawFlags) -> Result<FeatureFlagSet> {
    FlagSchema::default().validate(raw)
}

/// Set `name` in `raw`, replacing the flag under any other spelling.
pub fn apply_override(raw: &mut RawFlags, name: &str, value: RawFlagValue) {
    let key = canonical_key(name);
    raw.retain(|existing, _| canonical_key(existing) != key);
    raw.insert(name.to_string(), value);
}

/// Parse a `name=value` command-line override.
pub fn parse_override(arg: &str) -> Result<(String, RawFlagValue)> {
    let (name, value) = arg.split_once('=').ok_or_else(|| {
        BuildError::invalid_spec(format!("flag override '{arg}' must look like name=value"))
    })?;
    let name = name.trim();
    if name.is_empty() {
        return Err(BuildError::invalid_spec(format!(
            "flag override '{arg}' has an empty name"
        )));
    }
    Ok((name.to_string(), RawFlagValue::Text(value.trim().to_string())))
}

//! Variable interpolation for compose values
//!
//! Supports `$$`, `$VAR`, `${VAR}`, `${VAR:-default}`, `${VAR-default}`,
//! `${VAR:?message}` and `${VAR?message}`. The `:` forms also treat an
//! empty value as unset. A default may itself hold one level of braced
//! reference, as in `${VAR:-${OTHER}}`.

use crate::error::{ComposeError, Result};
use regex::Regex;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::LazyLock;

static TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\$(?:(\$)|\{([A-Za-z_][A-Za-z0-9_]*)(?:(:?[-?])((?:\$\{[^{}]*\}|[^}])*))?\}|([A-Za-z_][A-Za-z0-9_]*))",
    )
    .expect("interpolation pattern is valid")
});

/// Variables available for interpolation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Environment {
    vars: BTreeMap<String, String>,
}

impl Environment {
    /// Empty environment
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from explicit pairs
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Process environment layered over the `.env` file in `dir`, if any
    pub fn for_project_dir(dir: &Path) -> Result<Self> {
        let mut env = Self::new();
        let dotenv = dir.join(".env");
        if dotenv.is_file() {
            let content = std::fs::read_to_string(&dotenv)?;
            env.vars = parse_dotenv(&content)?;
            tracing::debug!("Loaded {} variables from {}", env.vars.len(), dotenv.display());
        }
        env.vars.extend(std::env::vars());
        Ok(env)
    }

    /// Look a variable up
    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(|s| s.as_str())
    }
}

/// Parse `.env` style content: `KEY=value` lines, `#` comments, optional
/// `export ` prefix, optional matching quotes around the value
pub fn parse_dotenv(content: &str) -> Result<BTreeMap<String, String>> {
    let mut vars = BTreeMap::new();

    for (idx, raw) in content.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);
        let (key, value) = line.split_once('=').ok_or_else(|| {
            ComposeError::Parse(format!(".env line {}: expected KEY=value", idx + 1))
        })?;

        let key = key.trim();
        if key.is_empty() || key.contains(char::is_whitespace) {
            return Err(ComposeError::Parse(format!(
                ".env line {}: invalid variable name '{}'",
                idx + 1,
                key
            )));
        }

        let value = value.trim();
        let value = match (value.chars().next(), value.chars().last()) {
            (Some(q @ ('"' | '\'')), Some(end)) if value.len() >= 2 && q == end => {
                &value[1..value.len() - 1]
            }
            _ => value,
        };
        vars.insert(key.to_string(), value.to_string());
    }

    Ok(vars)
}

/// What to do when a referenced variable is missing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fallback {
    /// Blank string
    None,
    /// Substitute a default
    Default { value: Template, when_empty: bool },
    /// Fail with a message
    Required { message: String, when_empty: bool },
}

/// A piece of a template
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Text(String),
    Var { name: String, fallback: Fallback },
}

/// A parsed interpolation template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    segments: Vec<Segment>,
}

impl Template {
    /// Parse a template, rejecting stray `$` characters
    pub fn parse(input: &str) -> Result<Self> {
        let mut segments = Vec::new();
        let mut text = String::new();
        let mut last = 0;

        for caps in TOKEN.captures_iter(input) {
            let Some(whole) = caps.get(0) else { continue };
            push_text(&mut text, &input[last..whole.start()], input)?;
            last = whole.end();

            if caps.get(1).is_some() {
                text.push('$');
                continue;
            }

            if !text.is_empty() {
                segments.push(Segment::Text(std::mem::take(&mut text)));
            }

            if let Some(name) = caps.get(5) {
                segments.push(Segment::Var {
                    name: name.as_str().to_string(),
                    fallback: Fallback::None,
                });
                continue;
            }

            let name = caps.get(2).map(|m| m.as_str()).unwrap_or_default();
            let arg = caps.get(4).map(|m| m.as_str()).unwrap_or_default();
            let fallback = match caps.get(3).map(|m| m.as_str()) {
                None => Fallback::None,
                Some(":-") => Fallback::Default {
                    value: Template::parse(arg)?,
                    when_empty: true,
                },
                Some("-") => Fallback::Default {
                    value: Template::parse(arg)?,
                    when_empty: false,
                },
                Some(":?") => Fallback::Required {
                    message: arg.to_string(),
                    when_empty: true,
                },
                Some(_) => Fallback::Required {
                    message: arg.to_string(),
                    when_empty: false,
                },
            };
            segments.push(Segment::Var {
                name: name.to_string(),
                fallback,
            });
        }

        push_text(&mut text, &input[last..], input)?;
        if !text.is_empty() {
            segments.push(Segment::Text(text));
        }

        Ok(Self { segments })
    }

    /// Whether the template has no variable references
    pub fn is_literal(&self) -> bool {
        self.segments.iter().all(|s| matches!(s, Segment::Text(_)))
    }

    /// Substitute variables from `env`
    pub fn render(&self, env: &Environment) -> Result<String> {
        let mut out = String::new();

        for segment in &self.segments {
            match segment {
                Segment::Text(t) => out.push_str(t),
                Segment::Var { name, fallback } => {
                    let value = env.get(name);
                    match fallback {
                        Fallback::None => match value {
                            Some(v) => out.push_str(v),
                            None => {
                                tracing::warn!(
                                    "The {} variable is not set, defaulting to a blank string",
                                    name
                                );
                            }
                        },
                        Fallback::Default { value: default, when_empty } => match value {
                            Some(v) if !(*when_empty && v.is_empty()) => out.push_str(v),
                            _ => out.push_str(&default.render(env)?),
                        },
                        Fallback::Required { message, when_empty } => match value {
                            Some(v) if !(*when_empty && v.is_empty()) => out.push_str(v),
                            _ => {
                                return Err(ComposeError::Parse(format!(
                                    "required variable {} is missing a value: {}",
                                    name, message
                                )));
                            }
                        },
                    }
                }
            }
        }

        Ok(out)
    }
}

fn push_text(buf: &mut String, gap: &str, input: &str) -> Result<()> {
    if gap.contains('$') {
        return Err(ComposeError::Parse(format!(
            "invalid interpolation format in '{}'",
            input
        )));
    }
    buf.push_str(gap);
    Ok(())
}

/// Parse and render in one step
pub fn interpolate(input: &str, env: &Environment) -> Result<String> {
    Template::parse(input)?.render(env)
}

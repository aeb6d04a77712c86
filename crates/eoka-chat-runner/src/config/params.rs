use crate::{Error, Result};
use regex::{Captures, Regex};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::OnceLock;

/// Runtime parameters passed to a config.
#[derive(Debug, Clone, Default)]
pub struct Params {
    values: HashMap<String, String>,
}

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a parameter value.
    pub fn set(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(|s| s.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Parse from CLI args like "key=value".
    pub fn from_args(args: &[String]) -> Result<Self> {
        let mut params = Self::new();
        for arg in args {
            let (key, value) = arg.split_once('=').ok_or_else(|| {
                Error::Config(format!("invalid param '{}', expected key=value", arg))
            })?;
            if key.trim().is_empty() {
                return Err(Error::Config(format!("invalid param '{}', empty key", arg)));
            }
            params.values.insert(key.trim().to_string(), value.to_string());
        }
        Ok(params)
    }
}

/// Parameter definition in config.
#[derive(Debug, Clone, Deserialize)]
pub struct ParamDef {
    #[serde(default)]
    pub required: bool,

    /// Used when the parameter is not passed.
    pub default: Option<String>,

    /// Shown by `--check`.
    pub description: Option<String>,
}

fn placeholder() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_.-]*)\}").ok())
        .as_ref()
}

/// Substitute `${var}` placeholders in a string.
///
/// Passed values win over defaults. A declared optional parameter with no
/// default becomes empty; an undeclared name is left untouched.
pub fn substitute(
    template: &str,
    params: &Params,
    defs: &HashMap<String, ParamDef>,
) -> Result<String> {
    let Some(re) = placeholder() else {
        return Ok(template.to_string());
    };
    let mut missing = None;
    let out = re.replace_all(template, |caps: &Captures| {
        let name = &caps[1];
        if let Some(v) = params.get(name) {
            return v.to_string();
        }
        match defs.get(name) {
            Some(def) => match (&def.default, def.required) {
                (Some(default), _) => default.clone(),
                (None, true) => {
                    missing.get_or_insert_with(|| name.to_string());
                    String::new()
                }
                (None, false) => String::new(),
            },
            None => caps[0].to_string(),
        }
    });
    match missing {
        Some(name) => Err(Error::Config(format!("missing required parameter: {}", name))),
        None => Ok(out.into_owned()),
    }
}

/// Recursively substitute params in a serde_yaml::Value.
pub fn substitute_value(
    value: &mut serde_yaml::Value,
    params: &Params,
    defs: &HashMap<String, ParamDef>,
) -> Result<()> {
    match value {
        serde_yaml::Value::String(s) => {
            *s = substitute(s, params, defs)?;
        }
        serde_yaml::Value::Mapping(map) => {
            for (_, v) in map.iter_mut() {
                substitute_value(v, params, defs)?;
            }
        }
        serde_yaml::Value::Sequence(seq) => {
            for v in seq.iter_mut() {
                substitute_value(v, params, defs)?;
            }
        }
        _ => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn def(required: bool, default: Option<&str>) -> ParamDef {
        ParamDef {
            required,
            default: default.map(String::from),
            description: None,
        }
    }

    #[test]
    fn test_substitute_passed_and_default() {
        let params = Params::new().set("topic", "rust");
        let mut defs = HashMap::new();
        defs.insert("tone".to_string(), def(false, Some("brief")));
        let result = substitute("Explain ${topic}, keep it ${tone}.", &params, &defs).unwrap();
        assert_eq!(result, "Explain rust, keep it brief.");
    }

    #[test]
    fn test_substitute_passed_value_beats_default() {
        let params = Params::new().set("tone", "detailed");
        let mut defs = HashMap::new();
        defs.insert("tone".to_string(), def(false, Some("brief")));
        assert_eq!(substitute("${tone}", &params, &defs).unwrap(), "detailed");
    }

    #[test]
    fn test_substitute_required_missing() {
        let mut defs = HashMap::new();
        defs.insert("topic".to_string(), def(true, None));
        let err = substitute("about ${topic}", &Params::new(), &defs).unwrap_err();
        assert!(err.to_string().contains("topic"));
    }

    #[test]
    fn test_substitute_leaves_unknown_and_literal_text() {
        let defs = HashMap::new();
        let result = substitute("cost is $5, ${unknown} stays", &Params::new(), &defs).unwrap();
        assert_eq!(result, "cost is $5, ${unknown} stays");
    }

    #[test]
    fn test_params_from_args() {
        let args = vec!["topic=rust".to_string(), "query=a=b".to_string()];
        let params = Params::from_args(&args).unwrap();
        assert_eq!(params.get("topic"), Some("rust"));
        assert_eq!(params.get("query"), Some("a=b"));

        assert!(Params::from_args(&["novalue".to_string()]).is_err());
        assert!(Params::from_args(&["=x".to_string()]).is_err());
    }
}

use crate::types::{DataType, DataValue};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ParamType {
    /// Bound by the driver as a statement parameter.
    SqlParameter,
    /// Spliced into the statement text as a literal before execution.
    SqlToken,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Param {
    pub name: String,
    pub value: DataValue,
    pub param_type: ParamType,
}

impl Param {
    pub fn parameter(name: impl Into<String>, value: DataValue) -> Self {
        Self {
            name: name.into(),
            value,
            param_type: ParamType::SqlParameter,
        }
    }

    pub fn token(name: impl Into<String>, value: DataValue) -> Self {
        Self {
            name: name.into(),
            value,
            param_type: ParamType::SqlToken,
        }
    }

    pub fn data_type(&self) -> DataType {
        self.value.data_type()
    }

    fn matches_token(&self, token: &str) -> bool {
        self.param_type == ParamType::SqlToken && self.name.trim_start_matches('@') == token
    }
}

/// Replaces every `@name` in `statement` with the literal of the first token
/// parameter called `name`. Unmatched placeholders are left as written.
pub fn substitute_tokens(statement: &str, params: &[Param]) -> String {
    if !params.iter().any(|p| p.param_type == ParamType::SqlToken) {
        return statement.to_string();
    }
    let mut out = String::with_capacity(statement.len());
    let mut chars = statement.char_indices().peekable();
    while let Some((_, c)) = chars.next() {
        if c != '@' {
            out.push(c);
            continue;
        }
        let mut name = String::new();
        while let Some(&(_, next)) = chars.peek() {
            if next.is_ascii_alphanumeric() || next == '_' {
                name.push(next);
                chars.next();
            } else {
                break;
            }
        }
        match params.iter().find(|p| !name.is_empty() && p.matches_token(&name)) {
            Some(param) => out.push_str(&param.value.to_literal()),
            None => {
                out.push('@');
                out.push_str(&name);
            }
        }
    }
    out
}

/// Parameters left for the driver once tokens have been spliced in.
pub fn bound_parameters(params: &[Param]) -> Vec<Param> {
    params
        .iter()
        .filter(|p| p.param_type == ParamType::SqlParameter)
        .cloned()
        .collect()
}

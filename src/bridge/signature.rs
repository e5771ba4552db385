/*
 * Copyright (c) 2024. Govcraft
 *
 * Licensed under either of
 *   * Apache License, Version 2.0 (the "License");
 *     you may not use this file except in compliance with the License.
 *     You may obtain a copy of the License at http://www.apache.org/licenses/LICENSE-2.0
 *   * MIT license: http://opensource.org/licenses/MIT
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the applicable License for the specific language governing permissions and
 * limitations under that License.
 */

//! Parsing of C-like import signatures.
//!
//! A signature reads `returnType(paramType, …)` over a closed type
//! set. Whitespace is insignificant; `int` is rejected outright with a
//! hint, since the integer type crossing the boundary has to match the
//! script host's 64-bit integers.

use crate::common::error::AgentError;

/// The closed set of types that may cross the native call boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CType {
    /// No value (return position only).
    Void,
    /// `bool`.
    Bool,
    /// `long long`, matching the script host's integer width.
    LongLong,
    /// `double`, matching the script host's number width.
    Double,
    /// `const char*`, a NUL-terminated string.
    ConstCharPtr,
    /// `void*`, an opaque pointer.
    VoidPtr,
    /// A parameter table, passed as an opaque serialised blob with a
    /// stable address.
    Table,
}

impl CType {
    fn parse(token: &str, signature: &str) -> Result<Self, AgentError> {
        let condensed: String = token.chars().filter(|c| !c.is_whitespace()).collect();
        match condensed.as_str() {
            "void" => Ok(CType::Void),
            "bool" => Ok(CType::Bool),
            "longlong" => Ok(CType::LongLong),
            "double" => Ok(CType::Double),
            "constchar*" => Ok(CType::ConstCharPtr),
            "void*" => Ok(CType::VoidPtr),
            "table" => Ok(CType::Table),
            "int" => Err(AgentError::UnsupportedSignature(format!(
                "{signature}: type 'int' is not supported, use 'long long' instead"
            ))),
            _ => Err(AgentError::UnsupportedSignature(format!(
                "{signature}: unknown type '{token}'; supported types are void, bool, long long, double, const char*, void* and table"
            ))),
        }
    }

    fn label(self) -> &'static str {
        match self {
            CType::Void => "void",
            CType::Bool => "bool",
            CType::LongLong => "long long",
            CType::Double => "double",
            CType::ConstCharPtr => "const char*",
            CType::VoidPtr => "void*",
            CType::Table => "table",
        }
    }
}

/// A parsed import signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    /// The return type.
    pub ret: CType,
    /// The parameter types, in call order.
    pub params: Vec<CType>,
}

impl Signature {
    /// Parses `returnType(paramType, …)`.
    pub fn parse(signature: &str) -> Result<Self, AgentError> {
        let open = signature.find('(').ok_or_else(|| {
            AgentError::UnsupportedSignature(format!("{signature}: expected returnType(paramType, ...)"))
        })?;
        let close = signature.rfind(')').filter(|close| *close > open).ok_or_else(|| {
            AgentError::UnsupportedSignature(format!("{signature}: unbalanced parentheses"))
        })?;

        let ret = CType::parse(&signature[..open], signature)?;
        let param_text = &signature[open + 1..close];

        let mut params = Vec::new();
        if !param_text.trim().is_empty() {
            for token in param_text.split(',') {
                let param = CType::parse(token, signature)?;
                if param == CType::Void {
                    if param_text.split(',').count() == 1 {
                        // A lone `void` parameter list means "no arguments".
                        break;
                    }
                    return Err(AgentError::UnsupportedSignature(format!(
                        "{signature}: 'void' is only valid as a return type or an empty parameter list"
                    )));
                }
                params.push(param);
            }
        }

        Ok(Self { ret, params })
    }

    /// The canonical `returnType(paramType, …)` rendering.
    pub fn canonical(&self) -> String {
        let params: Vec<&str> = self.params.iter().map(|param| param.label()).collect();
        format!("{}({})", self.ret.label(), params.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whitespace_is_insignificant() {
        let parsed = Signature::parse("long long ( long long , long long )").unwrap();
        assert_eq!(parsed.ret, CType::LongLong);
        assert_eq!(parsed.params, vec![CType::LongLong, CType::LongLong]);
        assert_eq!(parsed.canonical(), "long long(long long, long long)");
    }

    #[test]
    fn all_supported_types_parse() {
        let parsed = Signature::parse("table(table, void*, const char*, double, bool)").unwrap();
        assert_eq!(parsed.ret, CType::Table);
        assert_eq!(
            parsed.params,
            vec![CType::Table, CType::VoidPtr, CType::ConstCharPtr, CType::Double, CType::Bool]
        );
    }

    #[test]
    fn void_parameter_list_means_no_arguments() {
        let parsed = Signature::parse("double(void)").unwrap();
        assert!(parsed.params.is_empty());
        let parsed = Signature::parse("double()").unwrap();
        assert!(parsed.params.is_empty());
    }

    #[test]
    fn int_is_rejected_with_a_hint() {
        let err = Signature::parse("int(int)").unwrap_err();
        assert!(matches!(err, AgentError::UnsupportedSignature(text) if text.contains("long long")));
    }

    #[test]
    fn unknown_types_are_rejected() {
        assert!(Signature::parse("float(float)").is_err());
        assert!(Signature::parse("long long").is_err());
    }
}

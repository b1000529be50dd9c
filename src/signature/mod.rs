//! Type signature grammar.
//!
//! A signature is a string of complete types drawn from the bus type system:
//!
//! | code | type |
//! |------|------|
//! | `y` `b` `n` `q` `i` `u` `x` `t` `d` | byte, bool, 16/32/64-bit signed and unsigned ints, double |
//! | `s` `o` `g` | string, object path, signature |
//! | `aT` | array of `T` |
//! | `(T...)` | struct of one or more fields |
//! | `a{KV}` | dictionary, `K` must be a basic type |
//! | `v` | variant |
//!
//! Parsing happens once, at registration time; everything downstream works on
//! the parsed [`SigType`] tree.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Maximum length of a signature string.
pub const MAX_SIGNATURE_LEN: usize = 255;
/// Maximum nesting of arrays, and separately of structs/dict entries.
pub const MAX_NESTING: usize = 32;

/// One complete type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SigType {
    Byte,
    Bool,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Double,
    String,
    ObjectPath,
    Signature,
    Variant,
    Array(Box<SigType>),
    Struct(Vec<SigType>),
    Dict(Box<SigType>, Box<SigType>),
}

impl SigType {
    /// Basic types may be dictionary keys.
    pub fn is_basic(&self) -> bool {
        !matches!(
            self,
            SigType::Variant | SigType::Array(_) | SigType::Struct(_) | SigType::Dict(..)
        )
    }

    fn basic_from_code(code: char) -> Option<SigType> {
        Some(match code {
            'y' => SigType::Byte,
            'b' => SigType::Bool,
            'n' => SigType::Int16,
            'q' => SigType::UInt16,
            'i' => SigType::Int32,
            'u' => SigType::UInt32,
            'x' => SigType::Int64,
            't' => SigType::UInt64,
            'd' => SigType::Double,
            's' => SigType::String,
            'o' => SigType::ObjectPath,
            'g' => SigType::Signature,
            'v' => SigType::Variant,
            _ => return None,
        })
    }

    fn write_code(&self, out: &mut String) {
        match self {
            SigType::Byte => out.push('y'),
            SigType::Bool => out.push('b'),
            SigType::Int16 => out.push('n'),
            SigType::UInt16 => out.push('q'),
            SigType::Int32 => out.push('i'),
            SigType::UInt32 => out.push('u'),
            SigType::Int64 => out.push('x'),
            SigType::UInt64 => out.push('t'),
            SigType::Double => out.push('d'),
            SigType::String => out.push('s'),
            SigType::ObjectPath => out.push('o'),
            SigType::Signature => out.push('g'),
            SigType::Variant => out.push('v'),
            SigType::Array(elem) => {
                out.push('a');
                elem.write_code(out);
            }
            SigType::Struct(fields) => {
                out.push('(');
                for field in fields {
                    field.write_code(out);
                }
                out.push(')');
            }
            SigType::Dict(key, value) => {
                out.push_str("a{");
                key.write_code(out);
                value.write_code(out);
                out.push('}');
            }
        }
    }
}

impl fmt::Display for SigType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut code = String::new();
        self.write_code(&mut code);
        f.write_str(&code)
    }
}

/// Why a signature failed to parse.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignatureError {
    #[error("signature longer than {MAX_SIGNATURE_LEN} characters")]
    TooLong,
    #[error("unexpected '{ch}' at offset {pos}")]
    UnexpectedChar { pos: usize, ch: char },
    #[error("signature ends inside a container")]
    UnexpectedEnd,
    #[error("empty struct at offset {0}")]
    EmptyStruct(usize),
    #[error("dictionary entry outside an array at offset {0}")]
    DictOutsideArray(usize),
    #[error("dictionary key at offset {0} is not a basic type")]
    NonBasicKey(usize),
    #[error("dictionary entry at offset {0} must have exactly a key and a value")]
    DictArity(usize),
    #[error("nesting deeper than {MAX_NESTING}")]
    TooDeep,
    #[error("expected exactly one complete type, found {0}")]
    NotSingle(usize),
}

/// A parsed signature: zero or more complete types.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Signature {
    types: Vec<SigType>,
}

impl Signature {
    /// The empty signature (no values).
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn parse(text: &str) -> Result<Self, SignatureError> {
        if text.len() > MAX_SIGNATURE_LEN {
            return Err(SignatureError::TooLong);
        }
        let mut parser = Parser {
            chars: text.char_indices().collect(),
            pos: 0,
            arrays: 0,
            structs: 0,
        };
        let mut types = Vec::new();
        while !parser.at_end() {
            types.push(parser.complete_type()?);
        }
        Ok(Self { types })
    }

    /// Parse a signature that must hold exactly one complete type, as for a
    /// property.
    pub fn parse_single(text: &str) -> Result<SigType, SignatureError> {
        let mut sig = Self::parse(text)?;
        if sig.types.len() != 1 {
            return Err(SignatureError::NotSingle(sig.types.len()));
        }
        Ok(sig.types.remove(0))
    }

    pub fn from_types(types: Vec<SigType>) -> Self {
        Self { types }
    }

    pub fn types(&self) -> &[SigType] {
        &self.types
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// Concatenate signatures, as when an argument list is declared one
    /// argument at a time.
    pub fn concat<'a>(parts: impl IntoIterator<Item = &'a Signature>) -> Signature {
        Signature {
            types: parts
                .into_iter()
                .flat_map(|s| s.types.iter().cloned())
                .collect(),
        }
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for t in &self.types {
            write!(f, "{t}")?;
        }
        Ok(())
    }
}

impl FromStr for Signature {
    type Err = SignatureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Signature::parse(s)
    }
}

impl TryFrom<String> for Signature {
    type Error = SignatureError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Signature::parse(&value)
    }
}

impl From<Signature> for String {
    fn from(sig: Signature) -> String {
        sig.to_string()
    }
}

struct Parser {
    chars: Vec<(usize, char)>,
    pos: usize,
    arrays: usize,
    structs: usize,
}

impl Parser {
    fn at_end(&self) -> bool {
        self.pos >= self.chars.len()
    }

    fn peek(&self) -> Option<(usize, char)> {
        self.chars.get(self.pos).copied()
    }

    fn next(&mut self) -> Result<(usize, char), SignatureError> {
        let c = self.peek().ok_or(SignatureError::UnexpectedEnd)?;
        self.pos += 1;
        Ok(c)
    }

    fn complete_type(&mut self) -> Result<SigType, SignatureError> {
        let (offset, ch) = self.next()?;
        if let Some(basic) = SigType::basic_from_code(ch) {
            return Ok(basic);
        }
        match ch {
            'a' => {
                self.arrays += 1;
                if self.arrays > MAX_NESTING {
                    return Err(SignatureError::TooDeep);
                }
                let result = match self.peek() {
                    Some((dict_offset, '{')) => {
                        self.pos += 1;
                        self.dict_entry(dict_offset)
                    }
                    _ => self.complete_type().map(|t| SigType::Array(Box::new(t))),
                };
                self.arrays -= 1;
                result
            }
            '(' => {
                self.structs += 1;
                if self.structs > MAX_NESTING {
                    return Err(SignatureError::TooDeep);
                }
                let mut fields = Vec::new();
                loop {
                    match self.peek() {
                        None => return Err(SignatureError::UnexpectedEnd),
                        Some((_, ')')) => {
                            self.pos += 1;
                            break;
                        }
                        Some(_) => fields.push(self.complete_type()?),
                    }
                }
                self.structs -= 1;
                if fields.is_empty() {
                    return Err(SignatureError::EmptyStruct(offset));
                }
                Ok(SigType::Struct(fields))
            }
            '{' => Err(SignatureError::DictOutsideArray(offset)),
            _ => Err(SignatureError::UnexpectedChar { pos: offset, ch }),
        }
    }

    fn dict_entry(&mut self, offset: usize) -> Result<SigType, SignatureError> {
        self.structs += 1;
        if self.structs > MAX_NESTING {
            return Err(SignatureError::TooDeep);
        }
        let key = self.complete_type()?;
        if !key.is_basic() {
            return Err(SignatureError::NonBasicKey(offset));
        }
        if matches!(self.peek(), Some((_, '}')) | None) {
            return Err(match self.peek() {
                None => SignatureError::UnexpectedEnd,
                Some(_) => SignatureError::DictArity(offset),
            });
        }
        let value = self.complete_type()?;
        match self.next()? {
            (_, '}') => {}
            _ => return Err(SignatureError::DictArity(offset)),
        }
        self.structs -= 1;
        Ok(SigType::Dict(Box::new(key), Box::new(value)))
    }
}

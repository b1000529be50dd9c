//! Interface descriptors.

use crate::core::error::{RegistrationError, RegistrationResult};
use crate::core::utils::{check_interface_name, check_member_name};
use crate::signature::{SigType, Signature};
use serde_json::Value as Json;
use std::collections::BTreeMap;
use std::fmt;

/// Standard properties interface that carries `Get`/`Set`/`GetAll`.
pub const PROPERTIES_INTERFACE: &str = "org.freedesktop.DBus.Properties";

/// Property access mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Access {
    Read,
    Write,
    ReadWrite,
}

impl Access {
    /// Letters are case-insensitive and may repeat: `"r"`, `"Rw"` and
    /// `"WR"` are all accepted. Any other character is an error.
    pub fn parse(code: &str) -> Option<Self> {
        let (mut read, mut write) = (false, false);
        for c in code.chars() {
            match c {
                'R' | 'r' => read = true,
                'W' | 'w' => write = true,
                _ => return None,
            }
        }
        match (read, write) {
            (true, true) => Some(Access::ReadWrite),
            (true, false) => Some(Access::Read),
            (false, true) => Some(Access::Write),
            (false, false) => None,
        }
    }

    pub fn readable(self) -> bool {
        matches!(self, Access::Read | Access::ReadWrite)
    }

    pub fn writable(self) -> bool {
        matches!(self, Access::Write | Access::ReadWrite)
    }

    pub fn code(self) -> &'static str {
        match self {
            Access::Read => "R",
            Access::Write => "W",
            Access::ReadWrite => "RW",
        }
    }
}

/// Member kind, numbered the way scripts spell `AJ.METHOD`, `AJ.SIGNAL`
/// and `AJ.PROPERTY`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemberKind {
    Method = 0,
    Signal = 1,
    Property = 2,
}

impl fmt::Display for MemberKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MemberKind::Method => "method",
            MemberKind::Signal => "signal",
            MemberKind::Property => "property",
        })
    }
}

/// A declared argument: optional name plus the signature of one or more
/// complete types.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Arg {
    pub name: Option<String>,
    pub signature: Signature,
}

impl Arg {
    pub fn parse(name: Option<&str>, signature: &str) -> RegistrationResult<Self> {
        let parsed =
            Signature::parse(signature).map_err(|e| RegistrationError::InvalidSignature {
                signature: signature.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self {
            name: name.map(str::to_string),
            signature: parsed,
        })
    }
}

/// A member of an interface, tagged by kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Member {
    Method { args: Vec<Arg>, returns: Vec<Arg> },
    Signal { args: Vec<Arg> },
    Property { signature: SigType, access: Access },
}

impl Member {
    pub fn kind(&self) -> MemberKind {
        match self {
            Member::Method { .. } => MemberKind::Method,
            Member::Signal { .. } => MemberKind::Signal,
            Member::Property { .. } => MemberKind::Property,
        }
    }

    /// Flattened input signature for methods and signals. Empty for
    /// properties.
    pub fn in_signature(&self) -> Signature {
        match self {
            Member::Method { args, .. } | Member::Signal { args } => {
                Signature::concat(args.iter().map(|a| &a.signature))
            }
            Member::Property { .. } => Signature::empty(),
        }
    }

    /// Flattened reply signature for methods. Empty otherwise.
    pub fn out_signature(&self) -> Signature {
        match self {
            Member::Method { returns, .. } => {
                Signature::concat(returns.iter().map(|a| &a.signature))
            }
            _ => Signature::empty(),
        }
    }
}

/// A named, immutable set of members.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceDescriptor {
    name: String,
    members: BTreeMap<String, Member>,
}

impl InterfaceDescriptor {
    /// Start building an interface; validation happens in
    /// [`InterfaceBuilder::build`].
    pub fn builder(name: impl Into<String>) -> InterfaceBuilder {
        InterfaceBuilder {
            name: name.into(),
            members: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn member(&self, name: &str) -> Option<&Member> {
        self.members.get(name)
    }

    pub fn members(&self) -> impl Iterator<Item = (&str, &Member)> {
        self.members.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Every property member with its type and access.
    pub fn properties(&self) -> impl Iterator<Item = (&str, &SigType, Access)> {
        self.members.iter().filter_map(|(name, m)| match m {
            Member::Property { signature, access } => Some((name.as_str(), signature, *access)),
            _ => None,
        })
    }

    /// Parse the script-facing descriptor shape:
    ///
    /// ```json
    /// { "my_method": { "type": 0, "args": ["s", {"count": "u"}], "returns": ["s"] },
    ///   "my_signal": { "type": "SIGNAL", "args": ["a{sv}"] },
    ///   "int_val":   { "type": 2, "signature": "i", "access": "RW" } }
    /// ```
    pub fn from_json(name: &str, members: &Json) -> RegistrationResult<Self> {
        let invalid = |reason: String| RegistrationError::InvalidDescriptor {
            name: name.to_string(),
            reason,
        };
        let map = members
            .as_object()
            .ok_or_else(|| invalid("interface definition must be an object".to_string()))?;

        let mut builder = InterfaceDescriptor::builder(name);
        for (member_name, def) in map {
            let kind = match def.get("type") {
                Some(Json::Number(n)) => match n.as_u64() {
                    Some(0) => MemberKind::Method,
                    Some(1) => MemberKind::Signal,
                    Some(2) => MemberKind::Property,
                    _ => return Err(invalid(format!("'{member_name}' has unknown type {n}"))),
                },
                Some(Json::String(s)) => match s.to_ascii_uppercase().as_str() {
                    "METHOD" => MemberKind::Method,
                    "SIGNAL" => MemberKind::Signal,
                    "PROPERTY" => MemberKind::Property,
                    _ => return Err(invalid(format!("'{member_name}' has unknown type '{s}'"))),
                },
                _ => return Err(invalid(format!("'{member_name}' lacks a member type"))),
            };
            match kind {
                MemberKind::Method => {
                    let args = args_from_json(def.get("args"), &invalid)?;
                    let returns = args_from_json(def.get("returns"), &invalid)?;
                    builder.push(member_name, RawMember::Method { args, returns });
                }
                MemberKind::Signal => {
                    let args = args_from_json(def.get("args"), &invalid)?;
                    builder.push(member_name, RawMember::Signal { args });
                }
                MemberKind::Property => {
                    let signature = def
                        .get("signature")
                        .and_then(Json::as_str)
                        .ok_or_else(|| invalid(format!("property '{member_name}' lacks a signature")))?;
                    let access = match def.get("access").and_then(Json::as_str) {
                        None => Access::ReadWrite,
                        Some(code) => Access::parse(code).ok_or_else(|| {
                            invalid(format!("property '{member_name}' has bad access '{code}'"))
                        })?,
                    };
                    builder.push(
                        member_name,
                        RawMember::Property {
                            signature: signature.to_string(),
                            access,
                        },
                    );
                }
            }
        }
        builder.build()
    }
}

type RawArgs = Vec<(Option<String>, String)>;

fn args_from_json(
    value: Option<&Json>,
    invalid: &dyn Fn(String) -> RegistrationError,
) -> RegistrationResult<RawArgs> {
    let Some(value) = value else {
        return Ok(Vec::new());
    };
    let items = value
        .as_array()
        .ok_or_else(|| invalid("args/returns must be a list".to_string()))?;
    items
        .iter()
        .map(|item| match item {
            Json::String(sig) => Ok((None, sig.clone())),
            Json::Object(map) if map.len() == 1 => {
                let (name, sig) = map
                    .iter()
                    .next()
                    .ok_or_else(|| invalid("empty argument entry".to_string()))?;
                let sig = sig
                    .as_str()
                    .ok_or_else(|| invalid(format!("argument '{name}' signature must be a string")))?;
                Ok((Some(name.clone()), sig.to_string()))
            }
            other => Err(invalid(format!("bad argument entry {other}"))),
        })
        .collect()
}

#[derive(Debug)]
enum RawMember {
    Method { args: RawArgs, returns: RawArgs },
    Signal { args: RawArgs },
    Property { signature: String, access: Access },
}

/// Collects members and validates them all at once.
#[derive(Debug)]
pub struct InterfaceBuilder {
    name: String,
    members: Vec<(String, RawMember)>,
}

impl InterfaceBuilder {
    fn push(&mut self, name: &str, member: RawMember) {
        self.members.push((name.to_string(), member));
    }

    /// Add a method with unnamed argument and return signatures.
    pub fn method(mut self, name: &str, args: &[&str], returns: &[&str]) -> Self {
        self.push(
            name,
            RawMember::Method {
                args: unnamed(args),
                returns: unnamed(returns),
            },
        );
        self
    }

    /// Add a method whose arguments carry names, as `("name", "sig")`.
    pub fn method_named(mut self, name: &str, args: &[(&str, &str)], returns: &[(&str, &str)]) -> Self {
        self.push(
            name,
            RawMember::Method {
                args: named(args),
                returns: named(returns),
            },
        );
        self
    }

    pub fn signal(mut self, name: &str, args: &[&str]) -> Self {
        self.push(name, RawMember::Signal { args: unnamed(args) });
        self
    }

    pub fn property(mut self, name: &str, signature: &str, access: Access) -> Self {
        self.push(
            name,
            RawMember::Property {
                signature: signature.to_string(),
                access,
            },
        );
        self
    }

    pub fn build(self) -> RegistrationResult<InterfaceDescriptor> {
        check_interface_name(&self.name).map_err(|reason| RegistrationError::InvalidName {
            name: self.name.clone(),
            reason: reason.to_string(),
        })?;

        let mut members = BTreeMap::new();
        for (member_name, raw) in self.members {
            check_member_name(&member_name).map_err(|reason| RegistrationError::InvalidName {
                name: format!("{}.{}", self.name, member_name),
                reason: reason.to_string(),
            })?;
            let member = match raw {
                RawMember::Method { args, returns } => Member::Method {
                    args: parse_args(args)?,
                    returns: parse_args(returns)?,
                },
                RawMember::Signal { args } => Member::Signal {
                    args: parse_args(args)?,
                },
                RawMember::Property { signature, access } => Member::Property {
                    signature: Signature::parse_single(&signature).map_err(|e| {
                        RegistrationError::InvalidSignature {
                            signature: signature.clone(),
                            reason: e.to_string(),
                        }
                    })?,
                    access,
                },
            };
            if members.insert(member_name.clone(), member).is_some() {
                return Err(RegistrationError::InvalidDescriptor {
                    name: self.name.clone(),
                    reason: format!("member '{member_name}' declared twice"),
                });
            }
        }
        Ok(InterfaceDescriptor {
            name: self.name,
            members,
        })
    }
}

fn unnamed(sigs: &[&str]) -> RawArgs {
    sigs.iter().map(|s| (None, s.to_string())).collect()
}

fn named(sigs: &[(&str, &str)]) -> RawArgs {
    sigs.iter()
        .map(|(n, s)| (Some(n.to_string()), s.to_string()))
        .collect()
}

fn parse_args(raw: RawArgs) -> RegistrationResult<Vec<Arg>> {
    raw.iter()
        .map(|(name, sig)| Arg::parse(name.as_deref(), sig))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_builder_parses_members() {
        let iface = InterfaceDescriptor::builder("org.alljoyn.alljoyn_test")
            .method("my_ping", &["s"], &["s"])
            .signal("my_signal", &[])
            .property("int_val", "i", Access::ReadWrite)
            .build()
            .unwrap();
        assert_eq!(iface.member("my_ping").unwrap().kind(), MemberKind::Method);
        assert_eq!(iface.member("my_ping").unwrap().out_signature().to_string(), "s");
        assert_eq!(iface.member("my_signal").unwrap().kind(), MemberKind::Signal);
        let props: Vec<_> = iface.properties().collect();
        assert_eq!(props, vec![("int_val", &SigType::Int32, Access::ReadWrite)]);
    }

    #[test]
    fn test_invalid_signature_fails_fast() {
        let err = InterfaceDescriptor::builder("org.test.bad")
            .method("m", &["a{vs}"], &[])
            .build()
            .unwrap_err();
        assert!(matches!(err, RegistrationError::InvalidSignature { .. }));

        let err = InterfaceDescriptor::builder("org.test.bad")
            .property("p", "ii", Access::Read)
            .build()
            .unwrap_err();
        assert!(matches!(err, RegistrationError::InvalidSignature { .. }));
    }

    #[test]
    fn test_invalid_names() {
        assert!(matches!(
            InterfaceDescriptor::builder("nodots").build(),
            Err(RegistrationError::InvalidName { .. })
        ));
        assert!(matches!(
            InterfaceDescriptor::builder("org.test.x")
                .signal("bad-name", &[])
                .build(),
            Err(RegistrationError::InvalidName { .. })
        ));
    }

    #[test]
    fn test_from_json_shape() {
        let iface = InterfaceDescriptor::from_json(
            "org.test.lamp",
            &json!({
                "setLevel": {"type": 0, "args": [{"level": "y"}], "returns": ["b"]},
                "changed": {"type": "SIGNAL", "args": ["y"]},
                "level": {"type": 2, "signature": "y", "access": "R"},
                "name": {"type": 2, "signature": "s"}
            }),
        )
        .unwrap();
        match iface.member("setLevel").unwrap() {
            Member::Method { args, returns } => {
                assert_eq!(args[0].name.as_deref(), Some("level"));
                assert_eq!(returns[0].signature.to_string(), "b");
            }
            other => panic!("unexpected member {other:?}"),
        }
        let access: Vec<_> = iface.properties().map(|(n, _, a)| (n, a)).collect();
        assert_eq!(access, vec![("level", Access::Read), ("name", Access::ReadWrite)]);
    }

    #[test]
    fn test_access_letters_in_any_case() {
        assert_eq!(Access::parse("r"), Some(Access::Read));
        assert_eq!(Access::parse("w"), Some(Access::Write));
        assert_eq!(Access::parse("rw"), Some(Access::ReadWrite));
        assert_eq!(Access::parse("Wr"), Some(Access::ReadWrite));
        assert_eq!(Access::parse("RX"), None);
        assert_eq!(Access::parse(""), None);

        let iface = InterfaceDescriptor::from_json(
            "org.test.lamp",
            &json!({"level": {"type": 2, "signature": "y", "access": "r"}}),
        )
        .unwrap();
        let access: Vec<_> = iface.properties().map(|(_, _, a)| a).collect();
        assert_eq!(access, vec![Access::Read]);
    }

    #[test]
    fn test_from_json_rejects_unknown_type() {
        let err = InterfaceDescriptor::from_json("org.test.x", &json!({"m": {"type": 7}}))
            .unwrap_err();
        assert!(matches!(err, RegistrationError::InvalidDescriptor { .. }));
    }

    #[test]
    fn test_shape_equality_ignores_declaration_order() {
        let a = InterfaceDescriptor::builder("org.test.eq")
            .method("a", &[], &[])
            .signal("b", &["s"])
            .build()
            .unwrap();
        let b = InterfaceDescriptor::builder("org.test.eq")
            .signal("b", &["s"])
            .method("a", &[], &[])
            .build()
            .unwrap();
        assert_eq!(a, b);
    }
}

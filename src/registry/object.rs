//! Object descriptors.

use crate::core::error::{RegistrationError, RegistrationResult};
use crate::core::utils::check_object_path;
use serde_json::Value as Json;

bitflags::bitflags! {
    /// Visibility flags on an object path.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ObjectFlags: u8 {
        /// Calls require an authenticated peer.
        const SECURE = 1 << 0;
        /// Never announced or introspected.
        const HIDDEN = 1 << 1;
        /// Every call is rejected.
        const DISABLED = 1 << 2;
        /// Included in the About announcement.
        const ANNOUNCED = 1 << 3;
        /// Describes a remote object; never served locally.
        const PROXY = 1 << 4;
    }
}

impl ObjectFlags {
    /// Parse a script flag name such as `"SECURE"`.
    pub fn parse_name(name: &str) -> Option<Self> {
        <Self as bitflags::Flags>::from_name(&name.to_ascii_uppercase())
    }
}

/// Object path bound to a set of interfaces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectDescriptor {
    path: String,
    interfaces: Vec<String>,
    flags: ObjectFlags,
}

impl ObjectDescriptor {
    pub fn new<I, S>(path: &str, interfaces: I, flags: ObjectFlags) -> RegistrationResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        check_object_path(path).map_err(|reason| RegistrationError::InvalidName {
            name: path.to_string(),
            reason: reason.to_string(),
        })?;
        let mut list: Vec<String> = Vec::new();
        for iface in interfaces {
            let iface = iface.into();
            if !list.contains(&iface) {
                list.push(iface);
            }
        }
        if list.is_empty() {
            return Err(RegistrationError::InvalidDescriptor {
                name: path.to_string(),
                reason: "an object needs at least one interface".to_string(),
            });
        }
        Ok(Self {
            path: path.to_string(),
            interfaces: list,
            flags,
        })
    }

    /// Parse `{ "interfaces": [...], "flags": ["SECURE", ...] }`.
    ///
    /// Script objects are always `ANNOUNCED`; `HIDDEN` keeps them out of the
    /// announcement.
    pub fn from_json(path: &str, def: &Json) -> RegistrationResult<Self> {
        let invalid = |reason: &str| RegistrationError::InvalidDescriptor {
            name: path.to_string(),
            reason: reason.to_string(),
        };
        let interfaces = def
            .get("interfaces")
            .and_then(Json::as_array)
            .ok_or_else(|| invalid("'interfaces' must be a list"))?
            .iter()
            .map(|v| v.as_str().map(str::to_string).ok_or_else(|| invalid("interface names must be strings")))
            .collect::<RegistrationResult<Vec<_>>>()?;

        let mut flags = ObjectFlags::ANNOUNCED;
        match def.get("flags") {
            None | Some(Json::Null) => {}
            Some(Json::Number(n)) => {
                let bits = n
                    .as_u64()
                    .and_then(|b| u8::try_from(b).ok())
                    .ok_or_else(|| invalid("numeric flags out of range"))?;
                flags |= ObjectFlags::from_bits(bits).ok_or_else(|| invalid("unknown flag bits"))?;
            }
            Some(Json::Array(names)) => {
                for name in names {
                    let flag = name
                        .as_str()
                        .and_then(ObjectFlags::parse_name)
                        .ok_or_else(|| invalid("unknown object flag"))?;
                    flags |= flag;
                }
            }
            Some(_) => return Err(invalid("'flags' must be a list of names")),
        }
        Self::new(path, interfaces, flags)
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn interfaces(&self) -> &[String] {
        &self.interfaces
    }

    pub fn implements(&self, iface: &str) -> bool {
        self.interfaces.iter().any(|i| i == iface)
    }

    pub fn flags(&self) -> ObjectFlags {
        self.flags
    }

    /// Locally served objects receive inbound calls.
    pub fn is_served(&self) -> bool {
        !self.flags.contains(ObjectFlags::PROXY)
    }

    pub fn is_announced(&self) -> bool {
        self.flags.contains(ObjectFlags::ANNOUNCED)
            && !self.flags.intersects(ObjectFlags::HIDDEN | ObjectFlags::PROXY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_flags_from_names() {
        assert_eq!(ObjectFlags::parse_name("secure"), Some(ObjectFlags::SECURE));
        assert_eq!(ObjectFlags::parse_name("ANNOUNCED"), Some(ObjectFlags::ANNOUNCED));
        assert_eq!(ObjectFlags::parse_name("LOUD"), None);
    }

    #[test]
    fn test_from_json() {
        let obj = ObjectDescriptor::from_json(
            "/org/alljoyn/alljoyn_test",
            &json!({"interfaces": ["org.alljoyn.alljoyn_test", "org.alljoyn.alljoyn_test"], "flags": ["ANNOUNCED", "SECURE"]}),
        )
        .unwrap();
        assert_eq!(obj.interfaces().len(), 1);
        assert!(obj.flags().contains(ObjectFlags::SECURE | ObjectFlags::ANNOUNCED));
        assert!(obj.is_announced());

        let hidden = ObjectDescriptor::from_json("/quiet", &json!({"interfaces": ["org.test.a"], "flags": ["HIDDEN"]}))
            .unwrap();
        assert!(!hidden.is_announced());
        let plain = ObjectDescriptor::from_json("/plain", &json!({"interfaces": ["org.test.a"]})).unwrap();
        assert!(plain.is_announced());
    }

    #[test]
    fn test_hidden_is_never_announced() {
        let obj = ObjectDescriptor::new(
            "/hidden",
            ["org.test.a"],
            ObjectFlags::ANNOUNCED | ObjectFlags::HIDDEN,
        )
        .unwrap();
        assert!(!obj.is_announced());
        assert!(obj.is_served());
    }

    #[test]
    fn test_rejects_bad_path_and_empty_interfaces() {
        assert!(ObjectDescriptor::new("no/slash", ["org.test.a"], ObjectFlags::empty()).is_err());
        assert!(ObjectDescriptor::new("/ok", Vec::<String>::new(), ObjectFlags::empty()).is_err());
    }
}

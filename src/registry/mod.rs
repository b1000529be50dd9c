//! Descriptor Registry.
//!
//! Holds interface and object descriptors plus About and security
//! definitions. Definitions are accepted while the owning attachment is
//! detached; attaching seals the registry until the next detach.

mod about;
mod interface;
mod object;

pub use about::{AboutDefinition, AboutField, EcdsaCredentials, FieldAccess, SecurityDefinition, SpekeCredentials};
pub use interface::{
    Access, Arg, InterfaceBuilder, InterfaceDescriptor, Member, MemberKind, PROPERTIES_INTERFACE,
};
pub use object::{ObjectDescriptor, ObjectFlags};

use crate::core::error::{LifecyclePhase, RegistrationError, RegistrationResult};
use serde_json::Value as Json;
use std::collections::BTreeMap;
use thiserror::Error;

/// Why an inbound (path, interface, member) triple did not resolve.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("no object at '{0}'")]
    NoSuchObject(String),
    #[error("object '{path}' is disabled")]
    Disabled { path: String },
    #[error("object '{path}' does not implement '{iface}'")]
    NoSuchInterface { path: String, iface: String },
    #[error("interface '{iface}' has no member '{member}'")]
    NoSuchMember { iface: String, member: String },
    #[error("'{iface}.{member}' is not a {expected}")]
    WrongKind {
        iface: String,
        member: String,
        expected: MemberKind,
    },
}

/// A successfully resolved member.
#[derive(Debug, Clone, Copy)]
pub struct Resolved<'a> {
    pub object: &'a ObjectDescriptor,
    pub interface: &'a InterfaceDescriptor,
    pub member: &'a Member,
}

#[derive(Debug, Default)]
pub struct DescriptorRegistry {
    interfaces: BTreeMap<String, InterfaceDescriptor>,
    objects: BTreeMap<String, ObjectDescriptor>,
    about: AboutDefinition,
    security: Option<SecurityDefinition>,
    sealed: bool,
}

impl DescriptorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_open(&self) -> RegistrationResult<()> {
        if self.sealed {
            return Err(RegistrationError::Lifecycle(LifecyclePhase::Attached));
        }
        Ok(())
    }

    /// Register an interface. Identical re-registration is a no-op.
    pub fn define_interface(&mut self, desc: InterfaceDescriptor) -> RegistrationResult<()> {
        self.ensure_open()?;
        match self.interfaces.get(desc.name()) {
            Some(existing) if *existing == desc => {
                tracing::debug!(target: "ajs.registry", interface = desc.name(), "identical re-registration ignored");
                Ok(())
            }
            Some(_) => Err(RegistrationError::DuplicateName(desc.name().to_string())),
            None => {
                tracing::debug!(target: "ajs.registry", interface = desc.name(), "interface defined");
                self.interfaces.insert(desc.name().to_string(), desc);
                Ok(())
            }
        }
    }

    /// Register an object. Every interface it names must already exist.
    pub fn define_object(&mut self, desc: ObjectDescriptor) -> RegistrationResult<()> {
        self.ensure_open()?;
        if let Some(missing) = desc
            .interfaces()
            .iter()
            .find(|i| !self.interfaces.contains_key(i.as_str()))
        {
            return Err(RegistrationError::UnknownInterface {
                path: desc.path().to_string(),
                interface: missing.clone(),
            });
        }
        match self.objects.get(desc.path()) {
            Some(existing) if *existing == desc => Ok(()),
            Some(_) => Err(RegistrationError::DuplicateName(desc.path().to_string())),
            None => {
                tracing::debug!(target: "ajs.registry", path = desc.path(), flags = ?desc.flags(), "object defined");
                self.objects.insert(desc.path().to_string(), desc);
                Ok(())
            }
        }
    }

    pub fn set_about(&mut self, about: AboutDefinition) -> RegistrationResult<()> {
        self.ensure_open()?;
        self.about = about;
        Ok(())
    }

    pub fn set_security(&mut self, security: SecurityDefinition) -> RegistrationResult<()> {
        self.ensure_open()?;
        security.validate()?;
        self.security = Some(security);
        Ok(())
    }

    /// Drop any stored credentials. Allowed in every lifecycle phase.
    pub fn clear_security(&mut self) {
        self.security = None;
    }

    /// Load the script-facing JSON shapes. Interfaces go first so that
    /// objects can reference them regardless of key order.
    pub fn load_json(
        &mut self,
        interfaces: Option<&Json>,
        objects: Option<&Json>,
        about: Option<&Json>,
        security: Option<&Json>,
    ) -> RegistrationResult<()> {
        if let Some(Json::Object(map)) = interfaces {
            for (name, members) in map {
                self.define_interface(InterfaceDescriptor::from_json(name, members)?)?;
            }
        }
        if let Some(Json::Object(map)) = objects {
            for (path, def) in map {
                self.define_object(ObjectDescriptor::from_json(path, def)?)?;
            }
        }
        if let Some(def) = about.filter(|d| !d.is_null()) {
            self.set_about(AboutDefinition::from_json(def)?)?;
        }
        if let Some(def) = security.filter(|d| !d.is_null()) {
            self.set_security(SecurityDefinition::from_json(def)?)?;
        }
        Ok(())
    }

    pub(crate) fn seal(&mut self) {
        self.sealed = true;
    }

    pub(crate) fn unseal(&mut self) {
        self.sealed = false;
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    pub fn interface(&self, name: &str) -> Option<&InterfaceDescriptor> {
        self.interfaces.get(name)
    }

    pub fn interfaces(&self) -> impl Iterator<Item = &InterfaceDescriptor> {
        self.interfaces.values()
    }

    pub fn object(&self, path: &str) -> Option<&ObjectDescriptor> {
        self.objects.get(path)
    }

    pub fn objects(&self) -> impl Iterator<Item = &ObjectDescriptor> {
        self.objects.values()
    }

    pub fn about(&self) -> &AboutDefinition {
        &self.about
    }

    pub fn security(&self) -> Option<&SecurityDefinition> {
        self.security.as_ref()
    }

    /// Objects to include in an announcement, as (path, interfaces).
    pub fn announced_objects(&self) -> Vec<(String, Vec<String>)> {
        self.objects
            .values()
            .filter(|o| o.is_announced())
            .map(|o| (o.path().to_string(), o.interfaces().to_vec()))
            .collect()
    }

    /// Resolve an inbound call against a locally served object.
    pub fn resolve(
        &self,
        path: &str,
        iface: &str,
        member: &str,
        expected: MemberKind,
    ) -> Result<Resolved<'_>, ResolveError> {
        let object = self
            .objects
            .get(path)
            .filter(|o| o.is_served())
            .ok_or_else(|| ResolveError::NoSuchObject(path.to_string()))?;
        if object.flags().contains(ObjectFlags::DISABLED) {
            return Err(ResolveError::Disabled {
                path: path.to_string(),
            });
        }
        if !object.implements(iface) {
            return Err(ResolveError::NoSuchInterface {
                path: path.to_string(),
                iface: iface.to_string(),
            });
        }
        let interface = self
            .interfaces
            .get(iface)
            .ok_or_else(|| ResolveError::NoSuchInterface {
                path: path.to_string(),
                iface: iface.to_string(),
            })?;
        let member_desc = interface
            .member(member)
            .ok_or_else(|| ResolveError::NoSuchMember {
                iface: iface.to_string(),
                member: member.to_string(),
            })?;
        if member_desc.kind() != expected {
            return Err(ResolveError::WrongKind {
                iface: iface.to_string(),
                member: member.to_string(),
                expected,
            });
        }
        Ok(Resolved {
            object,
            interface,
            member: member_desc,
        })
    }

    /// Resolve an inbound property-interface request (`GetAll` has no
    /// member) to the object and interface.
    pub fn resolve_interface(
        &self,
        path: &str,
        iface: &str,
    ) -> Result<(&ObjectDescriptor, &InterfaceDescriptor), ResolveError> {
        let object = self
            .objects
            .get(path)
            .filter(|o| o.is_served())
            .ok_or_else(|| ResolveError::NoSuchObject(path.to_string()))?;
        if object.flags().contains(ObjectFlags::DISABLED) {
            return Err(ResolveError::Disabled {
                path: path.to_string(),
            });
        }
        let interface = self
            .interfaces
            .get(iface)
            .filter(|_| object.implements(iface))
            .ok_or_else(|| ResolveError::NoSuchInterface {
                path: path.to_string(),
                iface: iface.to_string(),
            })?;
        Ok((object, interface))
    }

    /// Find a member by interface name alone, for signals, which may
    /// arrive from any sender object.
    pub fn find_member(&self, iface: &str, member: &str) -> Option<&Member> {
        self.interfaces.get(iface).and_then(|i| i.member(member))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_iface() -> InterfaceDescriptor {
        InterfaceDescriptor::builder("org.alljoyn.alljoyn_test")
            .method("my_ping", &["s"], &["s"])
            .signal("my_signal", &[])
            .property("int_val", "i", Access::ReadWrite)
            .build()
            .unwrap()
    }

    fn registry() -> DescriptorRegistry {
        let mut reg = DescriptorRegistry::new();
        reg.define_interface(test_iface()).unwrap();
        reg.define_object(
            ObjectDescriptor::new(
                "/org/alljoyn/alljoyn_test",
                ["org.alljoyn.alljoyn_test"],
                ObjectFlags::ANNOUNCED,
            )
            .unwrap(),
        )
        .unwrap();
        reg
    }

    #[test]
    fn test_identical_reregistration_is_idempotent() {
        let mut reg = registry();
        assert!(reg.define_interface(test_iface()).is_ok());

        let different = InterfaceDescriptor::builder("org.alljoyn.alljoyn_test")
            .method("my_ping", &["s"], &["u"])
            .build()
            .unwrap();
        assert_eq!(
            reg.define_interface(different),
            Err(RegistrationError::DuplicateName(
                "org.alljoyn.alljoyn_test".to_string()
            ))
        );
    }

    #[test]
    fn test_unknown_interface() {
        let mut reg = registry();
        let err = reg
            .define_object(ObjectDescriptor::new("/x", ["org.test.missing"], ObjectFlags::empty()).unwrap())
            .unwrap_err();
        assert!(matches!(err, RegistrationError::UnknownInterface { .. }));
    }

    #[test]
    fn test_sealed_registry_rejects_definitions() {
        let mut reg = registry();
        reg.seal();
        assert_eq!(
            reg.define_interface(test_iface()),
            Err(RegistrationError::Lifecycle(LifecyclePhase::Attached))
        );
        reg.unseal();
        assert!(reg.define_interface(test_iface()).is_ok());
    }

    #[test]
    fn test_resolution() {
        let reg = registry();
        let resolved = reg
            .resolve("/org/alljoyn/alljoyn_test", "org.alljoyn.alljoyn_test", "my_ping", MemberKind::Method)
            .unwrap();
        assert_eq!(resolved.object.path(), "/org/alljoyn/alljoyn_test");
        assert_eq!(resolved.interface.name(), "org.alljoyn.alljoyn_test");

        assert!(matches!(
            reg.resolve("/org/alljoyn/alljoyn_test", "org.alljoyn.alljoyn_test", "nonexistent", MemberKind::Method),
            Err(ResolveError::NoSuchMember { .. })
        ));
        assert!(matches!(
            reg.resolve("/nope", "org.alljoyn.alljoyn_test", "my_ping", MemberKind::Method),
            Err(ResolveError::NoSuchObject(_))
        ));
        assert!(matches!(
            reg.resolve("/org/alljoyn/alljoyn_test", "org.alljoyn.alljoyn_test", "int_val", MemberKind::Method),
            Err(ResolveError::WrongKind { .. })
        ));
    }

    #[test]
    fn test_disabled_and_proxy_objects_are_not_served() {
        let mut reg = registry();
        reg.define_object(
            ObjectDescriptor::new("/off", ["org.alljoyn.alljoyn_test"], ObjectFlags::DISABLED).unwrap(),
        )
        .unwrap();
        reg.define_object(
            ObjectDescriptor::new("/remote", ["org.alljoyn.alljoyn_test"], ObjectFlags::PROXY).unwrap(),
        )
        .unwrap();
        assert!(matches!(
            reg.resolve("/off", "org.alljoyn.alljoyn_test", "my_ping", MemberKind::Method),
            Err(ResolveError::Disabled { .. })
        ));
        assert!(matches!(
            reg.resolve_interface("/remote", "org.alljoyn.alljoyn_test"),
            Err(ResolveError::NoSuchObject(_))
        ));
        assert_eq!(reg.announced_objects().len(), 1);
    }

    #[test]
    fn test_load_json() {
        let mut reg = DescriptorRegistry::new();
        reg.load_json(
            Some(&serde_json::json!({
                "org.test.lamp": {"on": {"type": 2, "signature": "b", "access": "RW"}}
            })),
            Some(&serde_json::json!({"/lamp": {"interfaces": ["org.test.lamp"]}})),
            Some(&serde_json::json!({"DeviceName": "Lamp"})),
            None,
        )
        .unwrap();
        assert!(reg.object("/lamp").is_some());
        assert!(!reg.about().is_empty());
        assert!(reg.security().is_none());
    }
}

//! About 元数据与安全凭据描述

use crate::core::error::{RegistrationError, RegistrationResult};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::collections::BTreeMap;

/// About 字段的可见性
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FieldAccess {
    /// 只读，可查询但不广播
    ReadOnly,
    /// 随公告广播
    #[default]
    Announce,
    /// 按语言本地化，随公告广播
    Localized,
    /// 从不对外暴露
    Private,
}

impl FieldAccess {
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "READONLY" => Some(Self::ReadOnly),
            "ANNOUNCE" => Some(Self::Announce),
            "LOCALIZED" => Some(Self::Localized),
            "PRIVATE" => Some(Self::Private),
            _ => None,
        }
    }

    pub fn is_announced(self) -> bool {
        matches!(self, Self::Announce | Self::Localized)
    }
}

/// 单个 About 字段
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AboutField {
    pub value: Json,
    pub access: FieldAccess,
}

/// About 描述（设备名、厂商等公告元数据）
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AboutDefinition {
    fields: BTreeMap<String, AboutField>,
}

impl AboutDefinition {
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置字段（默认 ANNOUNCE）
    pub fn with_field(mut self, name: &str, value: impl Into<Json>) -> Self {
        self.set(name, value.into(), FieldAccess::Announce);
        self
    }

    pub fn set(&mut self, name: &str, value: Json, access: FieldAccess) {
        self.fields
            .insert(name.to_string(), AboutField { value, access });
    }

    pub fn get(&self, name: &str) -> Option<&AboutField> {
        self.fields.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// 公告中携带的字段
    pub fn announced_fields(&self) -> BTreeMap<String, Json> {
        self.fields
            .iter()
            .filter(|(_, f)| f.access.is_announced())
            .map(|(k, f)| (k.clone(), f.value.clone()))
            .collect()
    }

    /// 解析脚本形式 `{ Field: value | {value, access} }`
    pub fn from_json(def: &Json) -> RegistrationResult<Self> {
        let map = def
            .as_object()
            .ok_or_else(|| RegistrationError::InvalidDescriptor {
                name: "aboutDefinition".to_string(),
                reason: "must be an object".to_string(),
            })?;
        let mut about = Self::new();
        for (name, entry) in map {
            match entry {
                Json::Object(obj) if obj.contains_key("value") => {
                    let access = match obj.get("access").and_then(Json::as_str) {
                        None => FieldAccess::Announce,
                        Some(code) => FieldAccess::parse(code).ok_or_else(|| {
                            RegistrationError::InvalidDescriptor {
                                name: name.clone(),
                                reason: format!("unknown field access '{code}'"),
                            }
                        })?,
                    };
                    let value = obj.get("value").cloned().unwrap_or(Json::Null);
                    about.set(name, value, access);
                }
                other => about.set(name, other.clone(), FieldAccess::Announce),
            }
        }
        Ok(about)
    }
}

/// ECDSA 凭据
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EcdsaCredentials {
    pub prv_key: String,
    pub cert_chain: String,
}

/// SPEKE 口令
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpekeCredentials {
    pub password: String,
}

/// 安全凭据描述
///
/// 绑定层不实现加密，只校验形状后原样转交给传输层。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ecdhe_ecdsa: Option<EcdsaCredentials>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ecdhe_speke: Option<SpekeCredentials>,
    #[serde(default)]
    pub ecdhe_null: bool,
    #[serde(default, rename = "claimWith", alias = "claim_with")]
    pub claim_with: Vec<String>,
    /// 会话密钥有效期（秒）
    pub expiration: u32,
}

impl SecurityDefinition {
    pub fn from_json(def: &Json) -> RegistrationResult<Self> {
        let parsed: Self =
            serde_json::from_value(def.clone()).map_err(|e| RegistrationError::InvalidDescriptor {
                name: "securityDefinition".to_string(),
                reason: e.to_string(),
            })?;
        parsed.validate()?;
        Ok(parsed)
    }

    pub fn validate(&self) -> RegistrationResult<()> {
        let invalid = |reason: &str| RegistrationError::InvalidDescriptor {
            name: "securityDefinition".to_string(),
            reason: reason.to_string(),
        };
        if self.expiration == 0 {
            return Err(invalid("expiration must be > 0"));
        }
        if let Some(speke) = &self.ecdhe_speke {
            if speke.password.is_empty() {
                return Err(invalid("ecdhe_speke password must not be empty"));
            }
        }
        if let Some(ecdsa) = &self.ecdhe_ecdsa {
            if ecdsa.prv_key.is_empty() || ecdsa.cert_chain.is_empty() {
                return Err(invalid("ecdhe_ecdsa needs prv_key and cert_chain"));
            }
        }
        if !self.ecdhe_null && self.ecdhe_speke.is_none() && self.ecdhe_ecdsa.is_none() {
            return Err(invalid("at least one suite must be enabled"));
        }
        Ok(())
    }

    /// 是否启用了需要认证的加密套件
    pub fn authenticates(&self) -> bool {
        self.ecdhe_speke.is_some() || self.ecdhe_ecdsa.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_about_access_filtering() {
        let about = AboutDefinition::from_json(&json!({
            "DeviceName": "Lamp",
            "Manufacturer": {"value": "ACME", "access": "LOCALIZED"},
            "SerialNumber": {"value": "1234", "access": "PRIVATE"},
            "SupportUrl": {"value": "http://example.com", "access": "READONLY"}
        }))
        .unwrap();
        let announced = about.announced_fields();
        assert_eq!(announced.get("DeviceName"), Some(&json!("Lamp")));
        assert_eq!(announced.get("Manufacturer"), Some(&json!("ACME")));
        assert!(!announced.contains_key("SerialNumber"));
        assert!(!announced.contains_key("SupportUrl"));
        assert_eq!(about.get("SerialNumber").unwrap().access, FieldAccess::Private);
    }

    #[test]
    fn test_about_rejects_unknown_access() {
        assert!(AboutDefinition::from_json(&json!({"X": {"value": 1, "access": "SECRET"}})).is_err());
    }

    #[test]
    fn test_security_definition_shape() {
        let sec = SecurityDefinition::from_json(&json!({
            "ecdhe_speke": {"password": "1234"},
            "claimWith": ["SPEKE"],
            "expiration": 5000
        }))
        .unwrap();
        assert!(sec.authenticates());
        assert_eq!(sec.claim_with, vec!["SPEKE".to_string()]);

        assert!(SecurityDefinition::from_json(&json!({"ecdhe_null": true, "expiration": 0})).is_err());
        assert!(SecurityDefinition::from_json(&json!({"expiration": 10})).is_err());
        assert!(SecurityDefinition::from_json(&json!({
            "ecdhe_speke": {"password": ""}, "expiration": 10
        }))
        .is_err());
    }
}

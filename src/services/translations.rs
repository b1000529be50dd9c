//! 多语言文本表
//!
//! 脚本以 `{lang: {key: text}}` 的形式提供翻译表。查找失败或译文为空时返回
//! 原始键。

use super::store::PropertyStore;
use crate::core::error::{RegistrationError, RegistrationResult};
use serde_json::Value as Json;
use std::collections::BTreeMap;

/// 翻译表
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Translations {
    languages: Vec<String>,
    table: BTreeMap<String, BTreeMap<String, String>>,
}

impl Translations {
    pub fn new() -> Self {
        Self::default()
    }

    /// 添加一种语言的译文；语言顺序即添加顺序
    pub fn add_language<I, K, V>(&mut self, lang: &str, entries: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        if !self.table.contains_key(lang) {
            self.languages.push(lang.to_string());
        }
        let texts = self.table.entry(lang.to_string()).or_default();
        texts.extend(entries.into_iter().map(|(k, v)| (k.into(), v.into())));
    }

    pub fn from_json(def: &Json) -> RegistrationResult<Self> {
        let invalid = |reason: String| RegistrationError::InvalidDescriptor {
            name: "translations".to_string(),
            reason,
        };
        let Json::Object(langs) = def else {
            return Err(invalid("expected an object keyed by language".into()));
        };
        let mut out = Self::new();
        for (lang, texts) in langs {
            let Json::Object(texts) = texts else {
                return Err(invalid(format!("'{lang}' must map keys to strings")));
            };
            let mut entries = Vec::with_capacity(texts.len());
            for (key, text) in texts {
                let text = text
                    .as_str()
                    .ok_or_else(|| invalid(format!("'{lang}.{key}' is not a string")))?;
                entries.push((key.clone(), text.to_string()));
            }
            out.add_language(lang, entries);
        }
        Ok(out)
    }

    pub fn languages(&self) -> &[String] {
        &self.languages
    }

    pub fn is_empty(&self) -> bool {
        self.languages.is_empty()
    }

    /// 按语言名查找；`lang` 为 None 时使用第一种语言
    pub fn translate(&self, key: &str, lang: Option<&str>) -> String {
        let lang = lang.or_else(|| self.languages.first().map(String::as_str));
        lang.and_then(|l| self.table.get(l))
            .and_then(|texts| texts.get(key))
            .filter(|t| !t.is_empty())
            .cloned()
            .unwrap_or_else(|| key.to_string())
    }

    /// 按存储中的 `DefaultLanguage` 查找；该语言未知时退回第一种语言
    pub fn translate_stored(&self, key: &str, store: &PropertyStore) -> String {
        let lang = store
            .load("DefaultLanguage")
            .ok()
            .flatten()
            .and_then(|v| v.as_str().map(str::to_string))
            .filter(|l| self.languages.contains(l));
        self.translate(key, lang.as_deref())
    }

    /// 按语言序号查找
    pub fn translate_index(&self, key: &str, index: usize) -> String {
        match self.languages.get(index) {
            Some(lang) => self.translate(key, Some(lang)),
            None => key.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_translate_with_fallbacks() {
        let t = Translations::from_json(&json!({
            "en": {"on": "On", "off": "Off", "empty": ""},
            "fr": {"on": "Allumé"}
        }))
        .unwrap();
        assert_eq!(t.languages(), &["en".to_string(), "fr".to_string()]);
        assert_eq!(t.translate("on", Some("fr")), "Allumé");
        assert_eq!(t.translate("off", Some("fr")), "off");
        assert_eq!(t.translate("on", None), "On");
        assert_eq!(t.translate("empty", None), "empty");
        assert_eq!(t.translate("unknown", Some("de")), "unknown");
        assert_eq!(t.translate_index("on", 1), "Allumé");
        assert_eq!(t.translate_index("on", 5), "on");
    }

    #[test]
    fn test_rejects_bad_shapes() {
        assert!(Translations::from_json(&json!(["en"])).is_err());
        assert!(Translations::from_json(&json!({"en": {"k": 1}})).is_err());
    }
}

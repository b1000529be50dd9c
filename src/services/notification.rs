//! 通知生产者
//!
//! 通知以无会话信号的形式发出，路径为 `/notificationProducer/<类型>`，接口为
//! `org.alljoyn.Notification`。每种类型只保留最近一次发送的序号，`cancel`
//! 撤回的就是它。

use crate::core::error::RegistrationResult;
use crate::registry::InterfaceDescriptor;
use crate::value::MsgValue;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub const NOTIFICATION_INTERFACE: &str = "org.alljoyn.Notification";
pub const NOTIFICATION_SIGNAL: &str = "notify";
pub const NOTIFICATION_VERSION: u16 = 2;

const NOTIFY_ARGS: [&str; 10] = ["q", "i", "q", "s", "s", "s", "a{ss}", "a{ss}", "a{ss}", "a{ss}"];

/// 通知类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum NotificationType {
    Emergency = 0,
    Warning = 1,
    Info = 2,
}

impl NotificationType {
    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            0 => Some(Self::Emergency),
            1 => Some(Self::Warning),
            2 => Some(Self::Info),
            _ => None,
        }
    }

    pub fn code(self) -> u16 {
        self as u16
    }

    /// 生产者对象路径
    pub fn object_path(self) -> String {
        format!("/notificationProducer/{self}")
    }
}

impl fmt::Display for NotificationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Emergency => "Emergency",
            Self::Warning => "Warning",
            Self::Info => "Info",
        })
    }
}

/// 通知内容
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub kind: NotificationType,
    /// 语言 → 文本
    pub text: BTreeMap<String, String>,
    pub attributes: BTreeMap<String, String>,
    /// 语言 → 音频 URL
    pub audio_urls: BTreeMap<String, String>,
    pub audio_path: Option<String>,
    pub icon_url: Option<String>,
    pub icon_path: Option<String>,
    pub control_panel_path: Option<String>,
}

impl Notification {
    /// 创建通知，`text` 归入语言 `lang`
    pub fn new(kind: NotificationType, text: &str, lang: &str) -> Self {
        let mut texts = BTreeMap::new();
        if !text.is_empty() {
            texts.insert(lang.to_string(), text.to_string());
        }
        Self {
            kind,
            text: texts,
            attributes: BTreeMap::new(),
            audio_urls: BTreeMap::new(),
            audio_path: None,
            icon_url: None,
            icon_path: None,
            control_panel_path: None,
        }
    }

    pub fn with_text(mut self, lang: &str, text: &str) -> Self {
        self.text.insert(lang.to_string(), text.to_string());
        self
    }

    pub fn with_attribute(mut self, key: &str, value: &str) -> Self {
        self.attributes.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_control_panel(mut self, path: &str) -> Self {
        self.control_panel_path = Some(path.to_string());
        self
    }

    fn rich_fields(&self) -> BTreeMap<String, String> {
        [
            ("audioPath", &self.audio_path),
            ("iconUrl", &self.icon_url),
            ("iconPath", &self.icon_path),
            ("controlPanelPath", &self.control_panel_path),
        ]
        .into_iter()
        .filter_map(|(k, v)| v.as_ref().map(|v| (k.to_string(), v.clone())))
        .collect()
    }

    /// 编码为 `notify` 信号参数
    pub fn to_args(&self, id: i32, device_id: &str, device_name: &str, app_name: &str) -> Vec<MsgValue> {
        let dict = |m: &BTreeMap<String, String>| {
            MsgValue::Dict(
                m.iter()
                    .map(|(k, v)| (MsgValue::from(k.as_str()), MsgValue::from(v.as_str())))
                    .collect(),
            )
        };
        vec![
            MsgValue::UInt16(NOTIFICATION_VERSION),
            MsgValue::Int32(id),
            MsgValue::UInt16(self.kind.code()),
            device_id.into(),
            device_name.into(),
            app_name.into(),
            dict(&self.rich_fields()),
            dict(&self.attributes),
            dict(&self.audio_urls),
            dict(&self.text),
        ]
    }

    /// 从 `notify` 信号参数解码，返回 (通知 ID, 通知)
    pub fn from_args(args: &[MsgValue]) -> Option<(i32, Self)> {
        let [_, MsgValue::Int32(id), MsgValue::UInt16(code), _, _, _, rich, attributes, audio, text] = args else {
            return None;
        };
        let map = |v: &MsgValue| -> Option<BTreeMap<String, String>> {
            match v {
                MsgValue::Dict(entries) => entries
                    .iter()
                    .map(|(k, v)| Some((k.as_str()?.to_string(), v.as_str()?.to_string())))
                    .collect(),
                _ => None,
            }
        };
        let rich = map(rich)?;
        Some((
            *id,
            Self {
                kind: NotificationType::from_code(*code)?,
                text: map(text)?,
                attributes: map(attributes)?,
                audio_urls: map(audio)?,
                audio_path: rich.get("audioPath").cloned(),
                icon_url: rich.get("iconUrl").cloned(),
                icon_path: rich.get("iconPath").cloned(),
                control_panel_path: rich.get("controlPanelPath").cloned(),
            },
        ))
    }
}

/// `org.alljoyn.Notification` 接口描述
pub fn interface_descriptor() -> RegistrationResult<InterfaceDescriptor> {
    InterfaceDescriptor::builder(NOTIFICATION_INTERFACE)
        .signal(NOTIFICATION_SIGNAL, &NOTIFY_ARGS)
        .property("Version", "q", crate::registry::Access::Read)
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::Signature;
    use crate::value::check_values;

    #[test]
    fn test_args_match_interface() {
        let notif = Notification::new(NotificationType::Warning, "Door open", "en")
            .with_attribute("room", "hall")
            .with_control_panel("/NotificationActions");
        let args = notif.to_args(7, ":loop.1", "Doorbell", "Front");
        let sig = Signature::parse(&NOTIFY_ARGS.concat()).unwrap();
        assert!(check_values(&args, &sig).is_ok());

        let (id, decoded) = Notification::from_args(&args).unwrap();
        assert_eq!(id, 7);
        assert_eq!(decoded, notif);
    }

    #[test]
    fn test_type_codes_and_paths() {
        assert_eq!(NotificationType::from_code(0), Some(NotificationType::Emergency));
        assert_eq!(NotificationType::from_code(9), None);
        assert_eq!(NotificationType::Info.object_path(), "/notificationProducer/Info");
        assert!(interface_descriptor().is_ok());
    }
}

//! 设备服务
//!
//! - `store` - 持久化键值存储（`store`/`load`）
//! - `translations` - 多语言文本
//! - `notification` - 通知生产者
//! - `control_panel` - 控制面板控件树

pub mod control_panel;
pub mod notification;
pub mod store;
pub mod translations;

pub use control_panel::{ControlPanel, LayoutHint, PropertyHint, Range, Widget, WidgetId, WidgetKind};
pub use notification::{Notification, NotificationType, NOTIFICATION_INTERFACE};
pub use store::{JsonFileStorage, MemoryStorage, PropertyStore, StorageBackend};
pub use translations::Translations;

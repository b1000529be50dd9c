//! 控制面板控件树
//!
//! 控件保存在一个 arena 中，索引 0 是根容器 `/ControlPanel`。新控件的路径为
//! `<父路径>/<类型><序号>`，序号是该控件在 arena 中的位置；直接挂在面板上的
//! 对话框位于 `/NotificationActions`。`load()` 之后树结构冻结，值、颜色和启用
//! 状态仍可修改。

use crate::core::error::ResourceError;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::fmt;

pub const CONTROL_PANEL_ROOT: &str = "/ControlPanel";
pub const NOTIFICATION_ACTIONS_PATH: &str = "/NotificationActions";

pub type WidgetId = usize;

/// 控件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WidgetKind {
    Container,
    Property,
    Action,
    Dialog,
    Label,
}

impl fmt::Display for WidgetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Container => "CONTAINER",
            Self::Property => "PROPERTY",
            Self::Action => "ACTION",
            Self::Dialog => "DIALOG",
            Self::Label => "LABEL",
        })
    }
}

/// 容器布局
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LayoutHint {
    Vertical,
    Horizontal,
}

/// 属性控件的显示提示
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PropertyHint {
    Switch,
    CheckBox,
    Spinner,
    RadioButton,
    Slider,
    TimePicker,
    DatePicker,
    NumberPicker,
    Keypad,
    RotaryKnob,
    TextView,
    NumericView,
    EditText,
}

impl PropertyHint {
    /// 解析脚本常量名，如 `SLIDER`、`RADIO_BUTTON`
    pub fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "SWITCH" => Self::Switch,
            "CHECK_BOX" => Self::CheckBox,
            "SPINNER" => Self::Spinner,
            "RADIO_BUTTON" => Self::RadioButton,
            "SLIDER" => Self::Slider,
            "TIME_PICKER" => Self::TimePicker,
            "DATE_PICKER" => Self::DatePicker,
            "NUMBER_PICKER" => Self::NumberPicker,
            "KEYPAD" => Self::Keypad,
            "ROTARY_KNOB" => Self::RotaryKnob,
            "TEXT_VIEW" => Self::TextView,
            "NUMERIC_VIEW" => Self::NumericView,
            "EDIT_TEXT" => Self::EditText,
            _ => return None,
        })
    }

    fn is_numeric(self) -> bool {
        matches!(
            self,
            Self::Slider | Self::RotaryKnob | Self::NumericView | Self::NumberPicker
        )
    }
}

/// 数值范围
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Range {
    pub min: f64,
    pub max: f64,
    pub increment: f64,
}

impl Range {
    /// 夹取到 `[min, max]` 并对齐到步进
    pub fn apply(&self, value: f64) -> f64 {
        let mut v = value.clamp(self.min, self.max);
        if self.increment > 0.0 {
            v = self.min + ((v - self.min) / self.increment).round() * self.increment;
            v = v.clamp(self.min, self.max);
        }
        v
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PropertyState {
    pub hint: Option<PropertyHint>,
    pub value: Json,
    pub range: Option<Range>,
    pub choices: Vec<String>,
    pub units: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Widget {
    pub kind: WidgetKind,
    pub path: String,
    pub parent: Option<WidgetId>,
    pub children: Vec<WidgetId>,
    pub label: Option<String>,
    pub enabled: bool,
    pub color: Option<u32>,
    pub layout: Option<LayoutHint>,
    pub property: Option<PropertyState>,
    pub message: Option<String>,
    pub buttons: Vec<String>,
}

/// 控制面板
#[derive(Debug, Clone, PartialEq)]
pub struct ControlPanel {
    widgets: Vec<Widget>,
    loaded: bool,
}

impl Default for ControlPanel {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlPanel {
    pub const ROOT: WidgetId = 0;

    pub fn new() -> Self {
        Self {
            widgets: vec![Widget {
                kind: WidgetKind::Container,
                path: CONTROL_PANEL_ROOT.to_string(),
                parent: None,
                children: Vec::new(),
                label: None,
                enabled: true,
                color: None,
                layout: Some(LayoutHint::Vertical),
                property: None,
                message: None,
                buttons: Vec::new(),
            }],
            loaded: false,
        }
    }

    fn ensure_open(&self) -> Result<(), ResourceError> {
        if self.loaded {
            return Err(ResourceError::PanelSealed);
        }
        Ok(())
    }

    fn get_mut(&mut self, id: WidgetId) -> Result<&mut Widget, ResourceError> {
        self.widgets.get_mut(id).ok_or(ResourceError::NoSuchWidget(id))
    }

    fn add(&mut self, parent: WidgetId, kind: WidgetKind, label: Option<&str>) -> Result<WidgetId, ResourceError> {
        self.ensure_open()?;
        let parent_widget = self.widgets.get(parent).ok_or(ResourceError::NoSuchWidget(parent))?;
        let allowed = match kind {
            WidgetKind::Dialog => parent == Self::ROOT || parent_widget.kind == WidgetKind::Action,
            _ => parent_widget.kind == WidgetKind::Container,
        };
        if !allowed {
            return Err(ResourceError::NotAContainer(parent));
        }
        let id = self.widgets.len();
        let path = if kind == WidgetKind::Dialog && parent == Self::ROOT {
            NOTIFICATION_ACTIONS_PATH.to_string()
        } else {
            format!("{}/{kind}{id}", parent_widget.path)
        };
        tracing::debug!(target: "ajs.cps", %path, "widget added");
        self.widgets.push(Widget {
            kind,
            path,
            parent: Some(parent),
            children: Vec::new(),
            label: label.map(str::to_string),
            enabled: true,
            color: None,
            layout: None,
            property: None,
            message: None,
            buttons: Vec::new(),
        });
        self.widgets[parent].children.push(id);
        Ok(id)
    }

    pub fn container_widget(&mut self, parent: WidgetId, layout: LayoutHint) -> Result<WidgetId, ResourceError> {
        let id = self.add(parent, WidgetKind::Container, None)?;
        self.widgets[id].layout = Some(layout);
        Ok(id)
    }

    pub fn label_widget(&mut self, parent: WidgetId, text: &str) -> Result<WidgetId, ResourceError> {
        self.add(parent, WidgetKind::Label, Some(text))
    }

    pub fn property_widget(
        &mut self,
        parent: WidgetId,
        hint: PropertyHint,
        value: Json,
        label: Option<&str>,
    ) -> Result<WidgetId, ResourceError> {
        let id = self.add(parent, WidgetKind::Property, label)?;
        self.widgets[id].property = Some(PropertyState {
            hint: Some(hint),
            value,
            ..PropertyState::default()
        });
        Ok(id)
    }

    pub fn action_widget(&mut self, parent: WidgetId, label: &str) -> Result<WidgetId, ResourceError> {
        self.add(parent, WidgetKind::Action, Some(label))
    }

    /// 对话框只能挂在面板根或动作控件上
    pub fn dialog_widget(
        &mut self,
        parent: WidgetId,
        message: &str,
        label: Option<&str>,
    ) -> Result<WidgetId, ResourceError> {
        let id = self.add(parent, WidgetKind::Dialog, label)?;
        self.widgets[id].message = Some(message.to_string());
        Ok(id)
    }

    fn property_mut(&mut self, id: WidgetId) -> Result<&mut PropertyState, ResourceError> {
        self.get_mut(id)?
            .property
            .as_mut()
            .ok_or_else(|| ResourceError::OutOfRange(format!("widget {id} is not a property widget")))
    }

    pub fn set_range(&mut self, id: WidgetId, min: f64, max: f64, increment: f64) -> Result<(), ResourceError> {
        self.ensure_open()?;
        if !(min <= max) || increment < 0.0 {
            return Err(ResourceError::OutOfRange(format!("range [{min}, {max}] step {increment}")));
        }
        let range = Range { min, max, increment };
        let state = self.property_mut(id)?;
        state.range = Some(range);
        if let Some(v) = state.value.as_f64() {
            state.value = number(range.apply(v));
        }
        Ok(())
    }

    pub fn set_choices(&mut self, id: WidgetId, choices: Vec<String>) -> Result<(), ResourceError> {
        self.ensure_open()?;
        self.property_mut(id)?.choices = choices;
        Ok(())
    }

    pub fn set_units(&mut self, id: WidgetId, units: &str) -> Result<(), ResourceError> {
        self.ensure_open()?;
        self.property_mut(id)?.units = Some(units.to_string());
        Ok(())
    }

    pub fn set_buttons(&mut self, id: WidgetId, buttons: Vec<String>) -> Result<(), ResourceError> {
        self.ensure_open()?;
        let widget = self.get_mut(id)?;
        if widget.kind != WidgetKind::Dialog {
            return Err(ResourceError::OutOfRange(format!("widget {id} is not a dialog")));
        }
        if buttons.len() > 3 {
            return Err(ResourceError::OutOfRange("a dialog has at most 3 buttons".to_string()));
        }
        widget.buttons = buttons;
        Ok(())
    }

    pub fn set_label(&mut self, id: WidgetId, label: &str) -> Result<(), ResourceError> {
        self.get_mut(id)?.label = Some(label.to_string());
        Ok(())
    }

    pub fn set_color(&mut self, id: WidgetId, rgb: u32) -> Result<(), ResourceError> {
        self.get_mut(id)?.color = Some(rgb & 0x00ff_ffff);
        Ok(())
    }

    pub fn set_enabled(&mut self, id: WidgetId, enabled: bool) -> Result<(), ResourceError> {
        self.get_mut(id)?.enabled = enabled;
        Ok(())
    }

    /// 设置属性值；数值型属性按范围夹取并对齐。返回最终保存的值。
    pub fn set_value(&mut self, id: WidgetId, value: Json) -> Result<Json, ResourceError> {
        let state = self.property_mut(id)?;
        let value = match (state.range, value.as_f64()) {
            (Some(range), Some(v)) => number(range.apply(v)),
            _ if state.hint.is_some_and(PropertyHint::is_numeric) && !value.is_number() => {
                return Err(ResourceError::OutOfRange(format!("{value} is not numeric")));
            }
            _ => value,
        };
        state.value = value.clone();
        Ok(value)
    }

    pub fn value(&self, id: WidgetId) -> Option<&Json> {
        self.widgets.get(id)?.property.as_ref().map(|p| &p.value)
    }

    pub fn widget(&self, id: WidgetId) -> Option<&Widget> {
        self.widgets.get(id)
    }

    pub fn find(&self, path: &str) -> Option<WidgetId> {
        self.widgets.iter().position(|w| w.path == path)
    }

    pub fn len(&self) -> usize {
        self.widgets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.widgets.len() <= 1
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    /// 冻结控件树并返回所有对象路径
    pub fn load(&mut self) -> Vec<String> {
        if !self.loaded {
            self.loaded = true;
            tracing::info!(target: "ajs.cps", widgets = self.widgets.len(), "control panel loaded");
        }
        self.paths()
    }

    pub fn paths(&self) -> Vec<String> {
        self.widgets.iter().map(|w| w.path.clone()).collect()
    }
}

fn number(v: f64) -> Json {
    if v.fract() == 0.0 && v.abs() < i64::MAX as f64 {
        Json::from(v as i64)
    } else {
        serde_json::Number::from_f64(v).map_or(Json::Null, Json::Number)
    }
}

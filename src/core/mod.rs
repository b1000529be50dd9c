//! 核心模块
//!
//! - `error` - 错误类型定义
//! - `event_loop` - 协作式事件循环与定时器表
//! - `utils` - 总线命名规则校验

pub mod error;
pub mod event_loop;
pub mod utils;

// 重新导出错误类型
pub use error::{
    AjsError, AjsResult, ContractViolation, LifecyclePhase, RegistrationError, RegistrationResult,
    ResourceError, ScriptError, StoreError, StoreResult, TimerError, TimerResult, TransportError,
    ValueError,
};

pub use event_loop::{EventLoop, TimerId, TimerKind, TimerTable};

//! 统一错误处理模块
//!
//! 提供绑定层范围内的统一错误类型定义
//!
//! ## 错误类型分层
//!
//! - **注册错误** (`RegistrationError`): 脚本加载阶段同步抛出，致命
//! - **契约违规** (`ContractViolation`): 处理器未回复或重复回复，记录日志后隔离
//! - **资源错误** (`ResourceError`): 重复占用外设、失效代理等，同步抛出
//! - **传输错误** (`TransportError`): 源于外部总线引擎，仅通过生命周期回调呈现
//!
//! 处理器拒绝（`Rejection`）不是 API 错误，它是处理器的返回值，
//! 由分发路由转换为协议层错误回复，见 [`crate::dispatch::Rejection`]。

use thiserror::Error;

/// 绑定层顶层错误类型
#[derive(Error, Debug)]
pub enum AjsError {
    #[error("Registration error: {0}")]
    Registration(#[from] RegistrationError),

    #[error("Handler contract violation: {0}")]
    Contract(#[from] ContractViolation),

    #[error("Resource error: {0}")]
    Resource(#[from] ResourceError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Timer error: {0}")]
    Timer(#[from] TimerError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Value error: {0}")]
    Value(#[from] ValueError),

    #[error("Script error: {0}")]
    Script(#[from] ScriptError),

    #[error("Config error: {0}")]
    Config(#[from] crate::config::ConfigError),
}

/// 描述符注册错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistrationError {
    #[error("'{0}' is already registered with a different shape")]
    DuplicateName(String),

    #[error("object '{path}' references unknown interface '{interface}'")]
    UnknownInterface { path: String, interface: String },

    #[error("invalid signature '{signature}': {reason}")]
    InvalidSignature { signature: String, reason: String },

    #[error("invalid name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    #[error("registration is not allowed while {0}")]
    Lifecycle(LifecyclePhase),

    #[error("invalid descriptor for '{name}': {reason}")]
    InvalidDescriptor { name: String, reason: String },
}

/// 生命周期阶段（用于 `RegistrationError::Lifecycle`）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecyclePhase {
    /// 已连接总线
    Attached,
    /// 尚未连接总线
    Detached,
}

impl std::fmt::Display for LifecyclePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Attached => f.write_str("attached to the bus"),
            Self::Detached => f.write_str("detached from the bus"),
        }
    }
}

/// 处理器契约违规
///
/// 方法调用必须且只能通过 `reply`、`error_reply`、`defer` 或返回
/// `Err(Rejection)` 中的一种方式完成一次。
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ContractViolation {
    #[error("'{member}' replied more than once")]
    AlreadyReplied { member: String },

    #[error("'{member}' replied and then rejected")]
    RejectAfterReply { member: String },

    #[error("'{member}' rejected and then replied")]
    ReplyAfterReject { member: String },

    #[error("'{member}' returned without replying")]
    NoReply { member: String },

    #[error("'{member}' replied to a signal")]
    ReplyToSignal { member: String },

    #[error("'{member}' reply does not match the declared shape: {detail}")]
    ReplyShape { member: String, detail: String },

    #[error("'{member}' handler panicked: {message}")]
    HandlerPanicked { member: String, message: String },
}

/// 资源错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResourceError {
    #[error("pin {0} is already bound")]
    ResourceAlreadyBound(u16),

    #[error("pin {0} does not exist on this board")]
    NoSuchPin(u16),

    #[error("no peripheral handle {0}")]
    NoSuchHandle(u32),

    #[error("proxy for peer '{peer}' is no longer valid")]
    ProxyInvalid { peer: String },

    #[error("unknown member '{member}'")]
    UnknownMember { member: String },

    #[error("property '{property}' is not {wanted}")]
    PropertyAccess { property: String, wanted: &'static str },

    #[error("arguments for '{member}' do not match signature: {detail}")]
    ArgumentMismatch { member: String, detail: String },

    #[error("control panel has been loaded and can no longer change")]
    PanelSealed,

    #[error("no such widget {0}")]
    NoSuchWidget(usize),

    #[error("widget {0} cannot hold children")]
    NotAContainer(usize),

    #[error("peripheral parameter out of range: {0}")]
    OutOfRange(String),

    #[error("operation requires an attached bus")]
    NotAttached,

    #[error("deferred reply for '{member}' expired")]
    ReplyExpired { member: String },
}

/// 传输错误（源于外部总线引擎）
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("bus attachment is detached")]
    Detached,

    #[error("peer '{0}' is not reachable")]
    PeerUnreachable(String),

    #[error("transport is closed")]
    Closed,

    #[error("malformed message: {0}")]
    Malformed(String),
}

/// 定时器错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TimerError {
    #[error("{0} must be > 0 ms")]
    InvalidPeriod(&'static str),

    #[error("no such timer {0:#x}")]
    NoSuchTimer(u32),

    #[error("timer {0:#x} has the wrong type for this operation")]
    WrongKind(u32),

    #[error("too many timers (limit {0})")]
    TooManyTimers(usize),
}

/// 持久化存储错误
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("storage io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("storage lock poisoned")]
    Poisoned,
}

/// 值转换错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValueError {
    #[error("expected {expected}, found {found}")]
    TypeMismatch { expected: String, found: String },

    #[error("{value} does not fit into {target}")]
    OutOfRange { value: String, target: &'static str },

    #[error("argument count mismatch: expected {expected}, found {found}")]
    Arity { expected: usize, found: usize },
}

/// 脚本系统错误
#[derive(Error, Debug)]
pub enum ScriptError {
    #[error("Script evaluation failed: {0}")]
    Eval(String),

    #[error("Script definition error: {0}")]
    Definition(String),

    #[error("Script command error: {0}")]
    Command(String),

    #[error("Script IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// 绑定层 Result 类型别名
pub type AjsResult<T> = Result<T, AjsError>;
/// 注册操作 Result 类型别名
pub type RegistrationResult<T> = Result<T, RegistrationError>;
/// 定时器操作 Result 类型别名
pub type TimerResult<T> = Result<T, TimerError>;
/// 存储操作 Result 类型别名
pub type StoreResult<T> = Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registration_error_display() {
        let err = RegistrationError::UnknownInterface {
            path: "/org/test".to_string(),
            interface: "org.test.missing".to_string(),
        };
        assert!(err.to_string().contains("org.test.missing"));

        let err = RegistrationError::Lifecycle(LifecyclePhase::Attached);
        assert_eq!(
            err.to_string(),
            "registration is not allowed while attached to the bus"
        );
    }

    #[test]
    fn test_error_conversion() {
        let timer_err = TimerError::NoSuchTimer(0x0100_0001);
        let err: AjsError = timer_err.into();
        assert!(matches!(err, AjsError::Timer(TimerError::NoSuchTimer(_))));
        assert!(err.to_string().contains("0x1000001"));

        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let store_err: StoreError = io_err.into();
        let err: AjsError = store_err.into();
        assert!(matches!(err, AjsError::Store(StoreError::Io(_))));
    }
}

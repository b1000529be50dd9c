//! 核心工具函数
//!
//! 总线命名规则校验

/// 接口名与成员名的最大长度
pub const MAX_NAME_LEN: usize = 255;

/// 校验对象路径
///
/// 路径必须以 `/` 开头，各段由 `[A-Za-z0-9_]` 组成，除根路径外不能以 `/` 结尾。
///
/// ```rust
/// use alljoyn_js::core::utils::check_object_path;
///
/// assert!(check_object_path("/").is_ok());
/// assert!(check_object_path("/org/alljoyn/test").is_ok());
/// assert!(check_object_path("/trailing/").is_err());
/// ```
pub fn check_object_path(path: &str) -> Result<(), &'static str> {
    if !path.starts_with('/') {
        return Err("must start with '/'");
    }
    if path == "/" {
        return Ok(());
    }
    if path.ends_with('/') {
        return Err("must not end with '/'");
    }
    for segment in path[1..].split('/') {
        if segment.is_empty() {
            return Err("contains an empty segment");
        }
        if !segment.bytes().all(is_name_byte) {
            return Err("segments may only contain [A-Za-z0-9_]");
        }
    }
    Ok(())
}

/// 校验接口名（点分，至少两段，段不能以数字开头）
pub fn check_interface_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err("length must be 1..=255");
    }
    let mut segments = 0;
    for segment in name.split('.') {
        check_element(segment)?;
        segments += 1;
    }
    if segments < 2 {
        return Err("needs at least two dot-separated elements");
    }
    Ok(())
}

/// 校验成员名（方法、信号、属性）
pub fn check_member_name(name: &str) -> Result<(), &'static str> {
    if name.len() > MAX_NAME_LEN {
        return Err("length must be 1..=255");
    }
    check_element(name)
}

fn check_element(element: &str) -> Result<(), &'static str> {
    let bytes = element.as_bytes();
    match bytes.first() {
        None => Err("contains an empty element"),
        Some(b) if b.is_ascii_digit() => Err("elements must not start with a digit"),
        Some(_) if !bytes.iter().copied().all(is_name_byte) => {
            Err("elements may only contain [A-Za-z0-9_]")
        }
        Some(_) => Ok(()),
    }
}

fn is_name_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_paths() {
        assert!(check_object_path("/ControlPanel/Panel/en").is_ok());
        assert!(check_object_path("relative").is_err());
        assert!(check_object_path("//double").is_err());
        assert!(check_object_path("/with-dash").is_err());
    }

    #[test]
    fn test_interface_names() {
        assert!(check_interface_name("org.alljoyn.Notification").is_ok());
        assert!(check_interface_name("single").is_err());
        assert!(check_interface_name("org.9lives").is_err());
        assert!(check_interface_name("org..empty").is_err());
    }

    #[test]
    fn test_member_names() {
        assert!(check_member_name("my_signal").is_ok());
        assert!(check_member_name("").is_err());
        assert!(check_member_name("has.dot").is_err());
    }
}

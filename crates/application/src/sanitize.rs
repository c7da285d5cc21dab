//! 消息内容清洗
//!
//! 在消息进入限流与持久化之前剥离标记和脚本类片段。
//! 清洗后为空或超长的内容直接拒绝，不做截断。

use domain::MAX_CONTENT_LEN;

use crate::error::{ChatError, ChatResult};

/// 清洗消息内容
///
/// 规则：去掉 `<...>` 标签片段（含未闭合的尾部标签）、
/// 过滤 `javascript:` 协议前缀、去掉控制字符、压缩首尾空白。
pub fn sanitize_content(input: &str) -> ChatResult<String> {
    let mut out = String::with_capacity(input.len());
    let mut in_tag = false;

    for c in input.chars() {
        match c {
            '<' => in_tag = true,
            '>' if in_tag => in_tag = false,
            _ if in_tag => {}
            c if c.is_control() && c != '\n' && c != '\t' => {}
            c => out.push(c),
        }
    }

    let out = strip_script_scheme(&out);
    let out = out.trim().to_string();

    if out.is_empty() {
        return Err(ChatError::InvalidContent(
            "message is empty after sanitization".to_string(),
        ));
    }
    if out.chars().count() > MAX_CONTENT_LEN {
        return Err(ChatError::InvalidContent(format!(
            "message exceeds {MAX_CONTENT_LEN} characters"
        )));
    }
    Ok(out)
}

/// 大小写不敏感地移除 `javascript:` 前缀片段
fn strip_script_scheme(input: &str) -> String {
    const SCHEME: &str = "javascript:";
    let scheme: Vec<char> = SCHEME.chars().collect();
    let chars: Vec<char> = input.chars().collect();
    let mut out = String::with_capacity(input.len());
    let mut i = 0;

    while i < chars.len() {
        if i + scheme.len() <= chars.len()
            && chars[i..i + scheme.len()]
                .iter()
                .zip(&scheme)
                .all(|(a, b)| a.eq_ignore_ascii_case(b))
        {
            i += scheme.len();
        } else {
            out.push(chars[i]);
            i += 1;
        }
    }
    out
}

//! 生成输出恢复解析
//!
//! 逐级尝试：严格解析 -> 剥代码围栏 -> 括号平衡扫描 -> 保守修复 -> 报错。
//! 括号扫描对字符串与转义感知，字符串内的大括号不影响配平。
//! 报错携带原始输出，调用方决定兜底方式。

use std::sync::OnceLock;

use regex::Regex;
use thiserror::Error;

use crate::contract::AgentReply;

/// 解析失败，携带原始输出
#[derive(Error, Debug)]
#[error("{message}")]
pub struct ParseError {
    pub message: String,
    /// 原始生成输出，诊断与兜底用
    pub raw: String,
}

/// 解析生成输出为回复契约
pub fn parse_reply(raw: &str) -> Result<AgentReply, ParseError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ParseError {
            message: "empty generation output".into(),
            raw: raw.to_string(),
        });
    }

    // 第 1 级：原文即合法契约 JSON
    if let Ok(reply) = try_parse(trimmed) {
        return Ok(reply);
    }

    // 第 2 级：剥代码围栏后重试
    let candidate = strip_code_fence(trimmed).unwrap_or(trimmed);
    if let Ok(reply) = try_parse(candidate) {
        return Ok(reply);
    }

    // 第 3 级：从首个 { 起做括号平衡扫描，截出完整对象
    let object = extract_balanced_object(candidate);
    if let Some(block) = object {
        if let Ok(reply) = try_parse(block) {
            return Ok(reply);
        }
    }

    // 第 4 级：保守修复（尾逗号、单引号）后重试
    let best = object.unwrap_or(candidate);
    if let Some(repaired) = repair_candidate(best) {
        if let Ok(reply) = try_parse(&repaired) {
            return Ok(reply);
        }
    }

    Err(ParseError {
        message: "no recoverable contract JSON in generation output".into(),
        raw: raw.to_string(),
    })
}

fn try_parse(text: &str) -> Result<AgentReply, serde_json::Error> {
    serde_json::from_str::<AgentReply>(text).map(AgentReply::sanitize)
}

/// 截取代码围栏内容。闭合围栏缺失时取到文末。
fn strip_code_fence(text: &str) -> Option<&str> {
    let start = text.find("```")?;
    let after = &text[start + 3..];
    // 跳过语言标注行（json 等）
    let body_start = after.find('\n').map(|i| i + 1).unwrap_or(0);
    let body = &after[body_start..];
    let inner = match body.find("```") {
        Some(end) => body[..end].trim(),
        None => body.trim(),
    };
    if inner.is_empty() {
        None
    } else {
        Some(inner)
    }
}

/// 从首个 { 起扫描到配平的 }。跟踪字符串与转义状态，
/// 字符串内部的大括号不计入深度。
fn extract_balanced_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if escaped {
            escaped = false;
            continue;
        }
        match b {
            b'\\' if in_string => escaped = true,
            b'"' => in_string = !in_string,
            b'{' if !in_string => depth += 1,
            b'}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

/// 保守修复：去除 } ] 前的尾逗号；候选完全没有双引号时把单引号换成双引号。
/// 没有任何改动时返回 None。
fn repair_candidate(text: &str) -> Option<String> {
    static TRAILING_COMMA: OnceLock<Regex> = OnceLock::new();
    let re = TRAILING_COMMA.get_or_init(|| Regex::new(r",\s*([}\]])").unwrap());

    let mut repaired = re.replace_all(text, "$1").into_owned();
    if !repaired.contains('"') && repaired.contains('\'') {
        repaired = repaired.replace('\'', "\"");
    }
    if repaired == text {
        None
    } else {
        Some(repaired)
    }
}

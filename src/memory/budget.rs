//! 上下文体量估算
//!
//! 上下文装配需要判断历史量是否超出原文窗口的预算，
//! 以及把摘要背景压到预算以内。这里用简单的字符启发式近似 token 数。

/// Token 估算器（简单的字符计数近似）
pub struct TokenEstimator;

impl TokenEstimator {
    /// 估算文本的 token 数量
    /// 使用简单的启发式规则：英文约 4 字符/token，中文约 1.5 字符/token
    pub fn estimate(text: &str) -> usize {
        let mut tokens = 0;
        let mut ascii_chars = 0;
        let mut non_ascii_chars = 0;

        for c in text.chars() {
            if c.is_ascii() {
                ascii_chars += 1;
            } else {
                non_ascii_chars += 1;
            }
        }

        // 英文按 4 字符/token，中文按 1.5 字符/token
        tokens += ascii_chars / 4;
        tokens += (non_ascii_chars as f64 / 1.5).ceil() as usize;

        tokens.max(1)
    }
}

/// 将文本截断到指定 token 数，保留开头部分
pub fn truncate_to_estimate(text: &str, max_tokens: usize) -> String {
    let estimated = TokenEstimator::estimate(text);
    if estimated <= max_tokens {
        return text.to_string();
    }

    // 按比例截断，留 10% 余量
    let ratio = max_tokens as f64 / estimated as f64;
    let target_chars = (text.chars().count() as f64 * ratio * 0.9) as usize;

    let truncated: String = text.chars().take(target_chars).collect();

    format!("{}...\n[内容过长已截断]", truncated.trim_end())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_estimator_english() {
        let text = "Hello, please show my homework results.";
        let tokens = TokenEstimator::estimate(text);
        assert!(tokens > 0);
        assert!(tokens < text.len()); // 应该少于字符数
    }

    #[test]
    fn test_token_estimator_chinese() {
        let text = "家长您好，孩子本周的考勤已经记录。";
        let tokens = TokenEstimator::estimate(text);
        assert!(tokens > 0);
    }

    #[test]
    fn test_token_estimator_never_zero() {
        assert_eq!(TokenEstimator::estimate(""), 1);
        assert_eq!(TokenEstimator::estimate("a"), 1);
    }

    #[test]
    fn test_truncate_short_text_untouched() {
        let text = "短文本";
        assert_eq!(truncate_to_estimate(text, 100), text);
    }

    #[test]
    fn test_truncate_long_text() {
        let text = "成绩记录。".repeat(200);
        let truncated = truncate_to_estimate(&text, 50);
        assert!(truncated.chars().count() < text.chars().count());
        assert!(truncated.ends_with("[内容过长已截断]"));
        assert!(TokenEstimator::estimate(&truncated) <= 60);
    }
}

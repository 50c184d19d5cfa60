//! 订阅模式：glob（`*` 任意长度，`?` 单字符）→ 锚定正则

use regex::Regex;

use super::StateError;

/// 编译后的键模式
#[derive(Debug, Clone)]
pub struct KeyPattern {
    source: String,
    regex: Regex,
}

impl KeyPattern {
    pub fn new(pattern: &str) -> Result<Self, StateError> {
        let mut re = String::with_capacity(pattern.len() * 2 + 6);
        re.push_str("(?s)^");
        let mut buf = [0u8; 4];
        for ch in pattern.chars() {
            match ch {
                '*' => re.push_str(".*"),
                '?' => re.push('.'),
                other => re.push_str(&regex::escape(other.encode_utf8(&mut buf))),
            }
        }
        re.push('$');

        let regex = Regex::new(&re).map_err(|e| StateError::InvalidPattern(format!("{}: {}", pattern, e)))?;
        Ok(Self {
            source: pattern.to_string(),
            regex,
        })
    }

    pub fn matches(&self, key: &str) -> bool {
        self.regex.is_match(key)
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_star_and_question_mark() {
        let p = KeyPattern::new("user:*").unwrap();
        assert!(p.matches("user:42"));
        assert!(p.matches("user:"));
        assert!(!p.matches("order:1"));
        assert!(!p.matches("xuser:1"));

        let p = KeyPattern::new("item.?").unwrap();
        assert!(p.matches("item.a"));
        assert!(!p.matches("item.ab"));
        assert!(!p.matches("itemXa"));
    }

    #[test]
    fn test_regex_metacharacters_are_literal() {
        let p = KeyPattern::new("a+b(c)").unwrap();
        assert!(p.matches("a+b(c)"));
        assert!(!p.matches("aab(c)"));
    }
}

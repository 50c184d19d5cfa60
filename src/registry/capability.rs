//! 能力推断：固定关键词表 → 能力标签
//!
//! 纯函数，与注册表的选择逻辑分离，便于替换与单测。

/// 通配能力：无具体需求时优先
pub const GENERAL: &str = "general";

/// 能力 → 触发关键词（全部小写）
const KEYWORD_TABLE: &[(&str, &[&str])] = &[
    ("research", &["research", "investigate", "find out", "look up", "study"]),
    ("search", &["search", "web", "google", "browse", "crawl"]),
    (
        "analysis",
        &["analyze", "analyse", "analysis", "evaluate", "assess", "compare", "insight"],
    ),
    (
        "summarization",
        &["summarize", "summarise", "summary", "tldr", "digest", "brief"],
    ),
    ("translation", &["translate", "translation", "localize"]),
    (
        "code",
        &["code", "program", "function", "bug", "compile", "refactor", "debug", "rust"],
    ),
    ("messaging", &["send", "notify", "message", "email", "slack", "sms"]),
    ("document", &["document", "docs", "pdf", "report", "markdown"]),
    ("memory", &["remember", "recall", "memory", "history"]),
    ("reasoning", &["reason", "think", "plan", "debate", "decide"]),
    ("data", &["data", "database", "query", "sql", "csv"]),
];

/// 所有已知能力名
pub fn known_capabilities() -> impl Iterator<Item = &'static str> {
    KEYWORD_TABLE.iter().map(|(cap, _)| *cap)
}

/// 统一大小写与空白
pub fn normalize_tag(tag: &str) -> String {
    tag.trim().to_lowercase()
}

/// 规范化并去重，保持首次出现顺序
pub fn normalize_tags<I, S>(tags: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out: Vec<String> = Vec::new();
    for tag in tags {
        let tag = normalize_tag(tag.as_ref());
        if !tag.is_empty() && !out.contains(&tag) {
            out.push(tag);
        }
    }
    out
}

/// 根据自由文本推断能力标签（按表顺序，去重）
///
/// 单词关键词按词首匹配（"research" 不会命中 "search"），含空格的短语按子串匹配。
pub fn infer_capabilities(text: &str) -> Vec<String> {
    let lower = text.to_lowercase();
    let words: Vec<&str> = lower
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();

    let hit = |keyword: &str| {
        if keyword.contains(' ') {
            lower.contains(keyword)
        } else {
            words.iter().any(|w| w.starts_with(keyword))
        }
    };

    KEYWORD_TABLE
        .iter()
        .filter(|(_, keywords)| keywords.iter().any(|k| hit(*k)))
        .map(|(cap, _)| cap.to_string())
        .collect()
}

/// 根据任务类型、内容与声明的工具推断所需能力
///
/// - 任务类型本身是已知能力名时直接采用
/// - 内容按关键词表匹配
/// - 每个声明的工具：先按关键词推断（`web_search` → search），推断不出则以工具名本身作为能力
pub fn infer_task_capabilities(task_type: &str, content: &str, declared_tools: &[String]) -> Vec<String> {
    let mut caps = Vec::new();

    let task_type = normalize_tag(task_type);
    if known_capabilities().any(|c| c == task_type) {
        caps.push(task_type);
    }

    caps.extend(infer_capabilities(content));

    for tool in declared_tools {
        let spaced = tool.replace(['_', '-'], " ");
        let inferred = infer_capabilities(&spaced);
        if inferred.is_empty() {
            caps.push(normalize_tag(tool));
        } else {
            caps.extend(inferred);
        }
    }

    normalize_tags(caps)
}

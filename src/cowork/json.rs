//! 从 LLM 自由文本中提取 JSON 对象
//!
//! LLM 经常在 JSON 前后夹带解释或 Markdown 代码块，这里只做定位，不做解析。

/// 从 `start`（必须是 `{`）开始截取括号配平的对象；忽略字符串内的括号
fn balanced_from(text: &str, start: usize) -> Option<&str> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

/// 第一个括号配平的 `{...}` 子串
pub fn extract_balanced_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    balanced_from(text, start)
}

/// 所有包含字面量键 `"key"` 的对象，按起始位置排列（外层先于内层）
pub fn objects_with_key<'a>(text: &'a str, key: &str) -> impl Iterator<Item = &'a str> + 'a {
    let needle = format!("\"{}\"", key);
    text.match_indices('{')
        .filter_map(move |(idx, _)| balanced_from(text, idx))
        .filter(move |candidate| candidate.contains(&needle))
}

/// 第一个包含字面量键 `"key"` 的对象
pub fn find_object_with_key<'a>(text: &'a str, key: &str) -> Option<&'a str> {
    objects_with_key(text, key).next()
}

/// Markdown 代码块（```json ... ``` 或 ``` ... ```）中的内容；仅当内容像 JSON 对象时返回
pub fn extract_fenced_block(text: &str) -> Option<&str> {
    let fence = text.find("```")?;
    let after = &text[fence + 3..];
    // 跳过语言标记（json / JSON / 空）
    let body_start = after.find('\n').map(|i| i + 1).unwrap_or(0);
    let body = &after[body_start..];
    let end = body.find("```")?;
    let inner = body[..end].trim();
    if inner.starts_with('{') {
        Some(inner)
    } else {
        None
    }
}

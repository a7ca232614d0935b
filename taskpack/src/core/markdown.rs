//! Small Markdown scanning helpers used by the packet parser.

/// A fenced code block: info string (lowercased language) and body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FencedBlock {
    pub lang: String,
    pub body: String,
}

/// True when `line` opens or closes a fenced code block.
pub fn is_fence(line: &str) -> bool {
    line.trim_start().starts_with("```")
}

/// Collect fenced code blocks in document order. An unterminated fence runs to
/// the end of the text.
pub fn fenced_blocks(text: &str) -> Vec<FencedBlock> {
    let mut blocks = Vec::new();
    let mut current: Option<FencedBlock> = None;
    for line in text.lines() {
        if is_fence(line) {
            match current.take() {
                Some(block) => blocks.push(block),
                None => {
                    let lang = line.trim_start().trim_start_matches('`').trim();
                    current = Some(FencedBlock {
                        lang: lang.to_ascii_lowercase(),
                        body: String::new(),
                    });
                }
            }
            continue;
        }
        if let Some(block) = current.as_mut() {
            block.body.push_str(line);
            block.body.push('\n');
        }
    }
    if let Some(block) = current {
        blocks.push(block);
    }
    blocks
}

/// Bullet items (`-` or `*`) outside fenced blocks, trimmed.
pub fn bullet_items(text: &str) -> Vec<String> {
    let mut items = Vec::new();
    let mut in_fence = false;
    for line in text.lines() {
        if is_fence(line) {
            in_fence = !in_fence;
            continue;
        }
        if in_fence {
            continue;
        }
        let trimmed = line.trim_start();
        let item = trimmed
            .strip_prefix("- ")
            .or_else(|| trimmed.strip_prefix("* "));
        if let Some(item) = item {
            let item = item.trim();
            if !item.is_empty() {
                items.push(item.to_string());
            }
        }
    }
    items
}

/// Inline code spans (`like this`) in order of appearance.
pub fn code_spans(text: &str) -> Vec<String> {
    let mut spans = Vec::new();
    let mut rest = text;
    while let Some(start) = rest.find('`') {
        let after = &rest[start + 1..];
        let Some(end) = after.find('`') else {
            break;
        };
        let span = after[..end].trim();
        if !span.is_empty() {
            spans.push(span.to_string());
        }
        rest = &after[end + 1..];
    }
    spans
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collects_blocks_with_language() {
        let blocks = fenced_blocks("text\n```bash\ncargo test\n```\n```\nplain\n```\n");
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].lang, "bash");
        assert_eq!(blocks[0].body, "cargo test\n");
        assert_eq!(blocks[1].lang, "");
    }

    #[test]
    fn bullets_inside_fences_are_ignored() {
        let items = bullet_items("- a\n```\n- b\n```\n* c\n");
        assert_eq!(items, vec!["a", "c"]);
    }

    #[test]
    fn code_spans_skip_unterminated_tick() {
        assert_eq!(code_spans("use `a/b` and `c` then `d"), vec!["a/b", "c"]);
    }
}

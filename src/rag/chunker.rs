//! 文档分块
//!
//! 向量库 upsert 时把文档切成带重叠的块；优先在段落、换行、句号处断开（UTF-8 安全）。

/// 分块策略
#[derive(Debug, Clone)]
pub struct ChunkingConfig {
    /// 目标块大小（字符数）
    pub chunk_size: usize,
    /// 块之间的重叠（字符数）
    pub chunk_overlap: usize,
    /// 分隔符优先级（从高到低）
    pub separators: Vec<String>,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1024,
            chunk_overlap: 200,
            separators: vec![
                "\n\n".to_string(),
                "\n".to_string(),
                "。".to_string(),
                ". ".to_string(),
                "? ".to_string(),
                "! ".to_string(),
                " ".to_string(),
            ],
        }
    }
}

/// 文本块：文本与其在原文中的字节偏移
#[derive(Debug, Clone, PartialEq)]
pub struct TextChunk {
    pub index: usize,
    pub text: String,
    pub offset: usize,
}

#[derive(Debug, Clone, Default)]
pub struct Chunker {
    config: ChunkingConfig,
}

impl Chunker {
    pub fn new(config: ChunkingConfig) -> Self {
        Self { config }
    }

    pub fn chunk(&self, text: &str) -> Vec<TextChunk> {
        let mut chunks = Vec::new();
        let chars: Vec<char> = text.chars().collect();
        let total = chars.len();
        if total == 0 {
            return chunks;
        }

        let chunk_size = self.config.chunk_size.max(1);
        let mut current = 0;

        while current < total {
            let target_end = (current + chunk_size).min(total);
            let mut end = target_end;

            if target_end < total {
                let slice: String = chars[current..target_end].iter().collect();
                for sep in &self.config.separators {
                    if let Some(pos) = slice.rfind(sep.as_str()) {
                        let to_sep = slice[..pos].chars().count() + sep.chars().count();
                        if to_sep > 0 {
                            end = current + to_sep;
                            break;
                        }
                    }
                }
            }

            if end <= current {
                end = (current + 1).min(total);
            }

            let piece: String = chars[current..end].iter().collect();
            let trimmed = piece.trim();
            if !trimmed.is_empty() {
                let offset: usize = chars[..current].iter().map(|c| c.len_utf8()).sum();
                chunks.push(TextChunk {
                    index: chunks.len(),
                    text: trimmed.to_string(),
                    offset,
                });
            }

            if end >= total {
                break;
            }
            let overlap = self.config.chunk_overlap.min(end - current);
            let next = end.saturating_sub(overlap);
            current = if next > current { next } else { end };
        }

        chunks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_text_is_single_chunk() {
        let chunks = Chunker::default().chunk("The cluster is unknown.");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].offset, 0);
    }

    #[test]
    fn test_chunks_break_on_separators_and_advance() {
        let chunker = Chunker::new(ChunkingConfig {
            chunk_size: 40,
            chunk_overlap: 10,
            ..Default::default()
        });
        let text = "Check the klusterlet pod.\n\nThen check the lease on the hub.\n\nFinally restart the addon.";
        let chunks = chunker.chunk(text);
        assert!(chunks.len() >= 3);
        for pair in chunks.windows(2) {
            assert!(pair[1].offset > pair[0].offset);
        }
        assert!(chunks.iter().all(|c| !c.text.is_empty()));
    }

    #[test]
    fn test_empty_text() {
        assert!(Chunker::default().chunk("").is_empty());
    }
}

//! Local-docs retrieval for strict-mode critic context.
//!
//! Deterministic and cheap: paragraph-ish chunking, token-Jaccard scoring,
//! and a small bonus when adapter-declared doc tags appear in the query.
//! No embeddings, no network.

use crate::adapter::DomainDoc;
use crate::learning::types::tokenize;

use std::path::Path;

/// One retrieved chunk with provenance for critic-context auditing.
#[derive(Debug, Clone)]
pub struct RetrievedChunk {
    pub source_id: String,
    pub source_title: String,
    pub text: String,
    pub score: f64,
}

/// Simple local-doc retrieval provider.
#[derive(Debug, Clone)]
pub struct LocalDocsKnowledgeProvider {
    chunk_chars: usize,
}

impl Default for LocalDocsKnowledgeProvider {
    fn default() -> Self {
        Self { chunk_chars: 900 }
    }
}

impl LocalDocsKnowledgeProvider {
    pub fn new(chunk_chars: usize) -> Self {
        Self {
            chunk_chars: chunk_chars.max(250),
        }
    }

    /// Chunk by blank-line blocks so retrieved context preserves local
    /// syntax patterns (examples plus surrounding rules).
    fn read_chunks(&self, path: &Path) -> Vec<String> {
        let Ok(text) = std::fs::read_to_string(path) else {
            return Vec::new();
        };

        let mut chunks: Vec<String> = Vec::new();
        let mut current: Vec<&str> = Vec::new();
        let mut current_len = 0usize;
        for line in text.lines() {
            let stripped = line.trim();
            if stripped.is_empty() {
                if !current.is_empty() {
                    chunks.push(current.join("\n"));
                    current.clear();
                    current_len = 0;
                }
                continue;
            }
            if current_len + stripped.len() > self.chunk_chars && !current.is_empty() {
                chunks.push(current.join("\n"));
                current.clear();
                current_len = 0;
            }
            current.push(stripped);
            current_len += stripped.len() + 1;
        }
        if !current.is_empty() {
            chunks.push(current.join("\n"));
        }
        chunks
    }

    /// Rank chunks by lexical similarity to the query plus a tag bonus.
    pub fn retrieve(
        &self,
        query: &str,
        docs: &[DomainDoc],
        max_chunks: usize,
    ) -> Vec<RetrievedChunk> {
        let query = query.trim();
        if query.is_empty() {
            return Vec::new();
        }
        let query_tokens = tokenize(query);
        let query_lower = query.to_lowercase();

        let mut ranked: Vec<RetrievedChunk> = Vec::new();
        for doc in docs {
            let tag_bonus = (0.05
                * doc
                    .tags
                    .iter()
                    .filter(|tag| query_lower.contains(&tag.to_lowercase()))
                    .count() as f64)
                .min(0.25);
            for chunk in self.read_chunks(&doc.path) {
                let chunk_tokens = tokenize(&chunk);
                let union = query_tokens.union(&chunk_tokens).count();
                if union == 0 {
                    continue;
                }
                let score = query_tokens.intersection(&chunk_tokens).count() as f64 / union as f64
                    + tag_bonus;
                if score <= 0.0 {
                    continue;
                }
                ranked.push(RetrievedChunk {
                    source_id: doc.doc_id.clone(),
                    source_title: doc.title.clone(),
                    text: chunk,
                    score,
                });
            }
        }

        ranked.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        ranked.truncate(max_chunks.max(1));
        ranked
    }
}

/// Render chunks for the critic prompt with explicit source ids so
/// downstream analysis can audit which docs the strict critic relied on.
pub fn format_chunks(chunks: &[RetrievedChunk]) -> String {
    chunks
        .iter()
        .enumerate()
        .map(|(index, chunk)| {
            format!("[{}] {} ({})\n{}", index + 1, chunk.source_title, chunk.source_id, chunk.text)
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(text: &str) -> (DomainDoc, std::path::PathBuf) {
        let path = std::env::temp_dir().join(format!("lorebot_test_doc_{}.md", uuid::Uuid::new_v4()));
        std::fs::write(&path, text).unwrap();
        (
            DomainDoc {
                doc_id: "ref-1".into(),
                title: "reference".into(),
                path: path.clone(),
                tags: vec!["operators".into()],
            },
            path,
        )
    }

    #[test]
    fn test_retrieves_most_relevant_chunk() {
        let (doc, _path) = doc(
            "Filtering uses word operators only: eq, neq, gt, lt.\n\n\
             Aggregation functions are lowercase: sum, count, avg.\n",
        );
        let provider = LocalDocsKnowledgeProvider::default();
        let chunks = provider.retrieve("unknown operator use word operators", &[doc], 1);
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].text.contains("word operators"));
    }

    #[test]
    fn test_empty_query_returns_nothing() {
        let (doc, _path) = doc("anything at all");
        let provider = LocalDocsKnowledgeProvider::default();
        assert!(provider.retrieve("  ", &[doc], 4).is_empty());
    }

    #[test]
    fn test_format_chunks_includes_source_ids() {
        let rendered = format_chunks(&[RetrievedChunk {
            source_id: "ref-1".into(),
            source_title: "reference".into(),
            text: "word operators".into(),
            score: 0.5,
        }]);
        assert!(rendered.contains("[1] reference (ref-1)"));
    }
}

use crate::models::{ConfidenceCategory, SourceChunk};

/// Fixed answer when the evidence is too weak to answer from.
pub const REFUSAL_ANSWER: &str = "I don't have information about that in the knowledge base.";

const CONTEXT_SEPARATOR: &str = "\n\n---\n\n";

fn confidence_hint(category: ConfidenceCategory) -> &'static str {
    match category {
        ConfidenceCategory::Correct => {
            "The retrieved context appears highly relevant. Answer directly from the context."
        }
        ConfidenceCategory::Ambiguous => {
            "WARNING: The retrieved context may only be PARTIALLY relevant to the question.\n\
             - Answer only if the context DIRECTLY and EXPLICITLY addresses the specific question.\n\
             - Do NOT extrapolate from related but different material to construct an answer.\n\
             - Otherwise reply exactly: \"I don't have information about that in the knowledge base.\""
        }
        ConfidenceCategory::Incorrect => {
            "The retrieved context has LOW relevance. Reply exactly \
             \"I don't have information about that in the knowledge base.\" unless you find an exact match."
        }
    }
}

/// Grounded-answer prompt: rules, format, a confidence hint, the context
/// blocks and the question.
pub fn build_prompt(question: &str, sources: &[SourceChunk], category: ConfidenceCategory) -> String {
    let context = sources
        .iter()
        .map(|s| match &s.title {
            Some(title) => format!("[{title}]\n{}", s.text),
            None => s.text.clone(),
        })
        .collect::<Vec<_>>()
        .join(CONTEXT_SEPARATOR);

    format!(
        "You are a helpful assistant answering questions from the provided documentation.\n\n\
         RELEVANCE NOTE: {hint}\n\n\
         RULES:\n\
         1. Use ONLY information stated in the context below.\n\
         2. Do not make up or infer facts that are not in the context.\n\
         3. If the context does not answer the question, reply exactly: \"{REFUSAL_ANSWER}\"\n\n\
         FORMAT:\n\
         - Respond in plain, natural language.\n\
         - For procedures or processes, use numbered steps.\n\n\
         Context:\n{context}\n\n\
         Question: {question}\n\n\
         Answer:",
        hint = confidence_hint(category),
    )
}

/// Prompt event sent in place of a real prompt when the answer is refused.
pub fn refusal_note(top_score: f32) -> String {
    format!("No relevant context found (score: {top_score:.2})")
}

/// Split `text` into word-sized tokens that concatenate back to `text`.
pub fn word_tokens(text: &str) -> impl Iterator<Item = &str> {
    text.split_inclusive(' ')
}

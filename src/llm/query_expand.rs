use crate::error::Result;
use crate::llm::chat::{GenerationRequest, Generator};

/// Upper bound on alternative phrasings requested per question.
pub const MAX_EXPANSIONS: usize = 3;

/// Ask the chat model for alternative phrasings of a question whose first
/// retrieval came back weak.
pub async fn expand_query(generator: &dyn Generator, original_query: &str) -> Result<Vec<String>> {
    let prompt = format!(
        "The question below did not match the knowledge base well. Rewrite it {MAX_EXPANSIONS} \
         different ways: use synonyms, spell out abbreviations, or name the underlying concept \
         more generally. Keep each rewrite a single self-contained question.\n\n\
         Question: \"{original_query}\"\n\n\
         Respond with ONLY a JSON array of strings. No explanation.\n\
         Example: [\"rewrite one\", \"rewrite two\", \"rewrite three\"]"
    );

    let response = generator
        .complete(&GenerationRequest::new(prompt, 0.7, 150))
        .await?;

    Ok(parse_expanded_queries(&response, original_query))
}

fn parse_expanded_queries(content: &str, original_query: &str) -> Vec<String> {
    let parsed = match (content.find('['), content.rfind(']')) {
        (Some(start), Some(end)) if end > start => {
            serde_json::from_str::<Vec<String>>(&content[start..=end]).ok()
        }
        _ => None,
    };

    let candidates = match parsed {
        Some(queries) => queries,
        None => {
            tracing::debug!("Expansion reply is not a JSON array, reading it line by line");
            content.lines().map(clean_line).collect()
        }
    };

    let original = original_query.trim().to_lowercase();
    let mut out: Vec<String> = Vec::new();
    for q in candidates {
        let q = q.trim().to_string();
        if q.chars().count() <= 5 || q.to_lowercase() == original {
            continue;
        }
        if out.iter().any(|existing| existing.eq_ignore_ascii_case(&q)) {
            continue;
        }
        out.push(q);
        if out.len() == MAX_EXPANSIONS {
            break;
        }
    }
    out
}

/// Strip list markers and quotes from a free-text line.
fn clean_line(line: &str) -> String {
    line.trim()
        .trim_start_matches(|c: char| c.is_ascii_digit() || matches!(c, '.' | ')' | '-' | '*'))
        .trim()
        .trim_matches('"')
        .to_string()
}

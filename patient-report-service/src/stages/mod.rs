pub mod evaluate;
pub mod parse;
pub mod synthesize;

pub use evaluate::EvaluateStage;
pub use parse::ParseStage;
pub use synthesize::SynthesizeStage;

/// Pulls the first balanced JSON object out of an LLM reply, tolerating
/// markdown fences and surrounding prose.
pub(crate) fn extract_json_object(response: &str) -> Option<&str> {
    let start = response.find('{')?;
    let bytes = response.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, &b) in bytes[start..].iter().enumerate() {
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
                    return Some(&response[start..=start + offset]);
                }
            }
            _ => {}
        }
    }
    None
}

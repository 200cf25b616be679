//! Prompt - 生成バックエンドに渡す指示文の組み立て
//!
//! 同じ入力からは常に同じ文字列を返します。
//!
//! パラメータ行はスケール名のアルファベット順に並びます。投入側が指定した
//! 順序は保持しません（`Parameters` は `BTreeMap`、ワイヤ上は JSON オブジェクト）。
//! `--param humor=3 --param casualness=8` でも Casualness の行が先に来ます。

use std::collections::BTreeMap;

use crate::domain::{Explanation, Parameters};

const HEADER: &str =
    "You are transforming text to be more human-like based on the following parameters:";
const FOOTER: &str = "Generate the humanized response.";
const MISSING_EXPLANATION: &str = "No explanation available.";

pub fn build_instruction(
    input_text: &str,
    parameters: &Parameters,
    explanations: &BTreeMap<String, Explanation>,
) -> String {
    let mut lines = vec![HEADER.to_string()];

    for (scale, value) in parameters {
        let line = match explanations.get(scale) {
            Some(explanation) if !explanation.examples.is_empty() => format!(
                "- {}: {value}/10 → {} (examples: {})",
                capitalize(scale),
                explanation.description,
                explanation.examples.join("; ")
            ),
            Some(explanation) => format!(
                "- {}: {value}/10 → {}",
                capitalize(scale),
                explanation.description
            ),
            None => format!("- {}: {value}/10 → {MISSING_EXPLANATION}", capitalize(scale)),
        };
        lines.push(line);
    }

    lines.push(String::new());
    lines.push(format!("User input: \"{input_text}\""));
    lines.push(FOOTER.to_string());
    lines.join("\n")
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    }
}

//! 起動時に投入する説明文（version 1）

use relay_core::impls::InMemoryStore;

const SCALES: &[(&str, &str, [&str; 3])] = &[
    (
        "casualness",
        "Controls how formal or relaxed the tone is.",
        [
            "Greetings, I require assistance.",
            "Hey, could you help me out?",
            "Yo, can you gimme a hand?",
        ],
    ),
    (
        "humor",
        "Adjusts the level of wit and fun in the response.",
        [
            "That's incorrect.",
            "Well, that's one way to look at it!",
            "Oh wow, that's like trying to toast bread with a flashlight!",
        ],
    ),
    (
        "conciseness",
        "Controls verbosity (length of responses).",
        [
            "Certainly! Here is a detailed explanation with every possible nuance...",
            "Sure! Here's a summary of the key points...",
            "Yes.",
        ],
    ),
    (
        "punctuation_errors",
        "Introduces mistakes in punctuation placement.",
        [
            "Sure, I can help you with that.",
            "Sure; I can help you with that.",
            "Sure I can, help... you with that!",
        ],
    ),
    (
        "typos",
        "Adds misspellings to simulate human mistakes.",
        [
            "Absolutely! I'd be happy to help.",
            "Absolutly! I'd be happy too help.",
            "Absolutly! Id be hapyy to help!",
        ],
    ),
    (
        "grammatical_imperfections",
        "Introduces grammar mistakes.",
        [
            "She doesn't know where he went.",
            "She don't know where he went.",
            "She no know where he go.",
        ],
    ),
    (
        "redundancy",
        "Inserts unnecessary words or repetitive phrases.",
        [
            "That's a good idea.",
            "That's actually a pretty good idea, I think.",
            "That's, like, actually a really good idea, you know, I think.",
        ],
    ),
];

/// Register every built-in scale; returns how many were added.
pub async fn seed_explanations(store: &InMemoryStore) -> usize {
    for (scale, description, examples) in SCALES {
        store
            .register_explanation(
                scale,
                description,
                examples.iter().map(|e| e.to_string()).collect(),
            )
            .await;
    }
    SCALES.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    use relay_core::domain::VersionSelector;
    use relay_core::ports::ExplanationStore;

    #[tokio::test]
    async fn seeded_scales_resolve_to_version_one() {
        let store = InMemoryStore::new();
        assert_eq!(seed_explanations(&store).await, SCALES.len());

        let casual = store
            .load_explanation("casualness", VersionSelector::Latest)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(casual.version_number, 1);
        assert_eq!(casual.examples.len(), 3);
    }
}

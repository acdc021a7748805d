//! Prompt construction for every generation mode.
//!
//! Builders are pure functions over the already-cleaned, already-bounded
//! context, shared by the sync and streaming paths. Structured modes spell
//! out the exact JSON shape inline; the parser downstream stays tolerant
//! anyway. Every mode mandates the document's language and keeps technical
//! terms untranslated.

use crate::llm::Message;
use crate::schema::{ChatRole, ChatTurn};

/// Only this many most-recent turns are forwarded to the model.
pub const HISTORY_WINDOW: usize = 6;

fn language_policy(language: &str) -> String {
    format!(
        "Write your output in {language}. Keep domain-specific technical terms \
         in their original form, untranslated."
    )
}

fn structured_mode(instructions: &str, shape: &str, language: &str, context: &str) -> Vec<Message> {
    let system = format!(
        "{instructions}\n\n{}\n\nReturn ONLY valid JSON shaped exactly like:\n{shape}",
        language_policy(language)
    );
    vec![Message::system(system), Message::user(context.to_string())]
}

pub fn summary(language: &str, context: &str) -> Vec<Message> {
    let system = format!(
        "You are a study assistant. Write a thorough, well-organized summary of \
         the document the user provides. Cover every major section and keep the \
         structure of the original. Use markdown headings and bullet points.\n\n{}",
        language_policy(language)
    );
    vec![Message::system(system), Message::user(context.to_string())]
}

pub fn flashcards(language: &str, context: &str) -> Vec<Message> {
    structured_mode(
        "You are a study assistant. Create flashcards covering the key facts and \
         concepts in the document the user provides. Each card has a prompt side \
         and an answer side.",
        r#"[{"front": "question or cue", "back": "answer"}]"#,
        language,
        context,
    )
}

pub fn quiz(language: &str, context: &str) -> Vec<Message> {
    structured_mode(
        "You are a study assistant. Write multiple-choice quiz questions testing \
         understanding of the document the user provides. Four options per \
         question, exactly one correct.",
        r#"[{"question": "...", "options": ["A", "B", "C", "D"], "correct_index": 0, "explanation": "why"}]"#,
        language,
        context,
    )
}

pub fn notes(language: &str, context: &str) -> Vec<Message> {
    structured_mode(
        "You are a study assistant. Condense the document the user provides into \
         concise revision notes, one self-contained bullet point per entry.",
        r#"[{"content": "one bullet point"}]"#,
        language,
        context,
    )
}

pub fn glossary(language: &str, context: &str) -> Vec<Message> {
    structured_mode(
        "You are a study assistant. Build a glossary of the technical terms in \
         the document the user provides, with clear one-paragraph definitions.",
        r#"[{"term": "...", "definition": "..."}]"#,
        language,
        context,
    )
}

pub fn exam_predictions(language: &str, context: &str) -> Vec<Message> {
    structured_mode(
        "You are a study assistant. Predict likely exam questions based on the \
         document the user provides, with a short rationale and a likelihood \
         rating (high, medium, low) for each.",
        r#"[{"question": "...", "rationale": "...", "likelihood": "high"}]"#,
        language,
        context,
    )
}

pub fn complex_topics(language: &str, context: &str) -> Vec<Message> {
    structured_mode(
        "You are a study assistant. Identify the most conceptually difficult \
         topics in the document the user provides and explain each one in \
         simple terms, as if to a struggling student.",
        r#"[{"topic": "...", "explanation": "..."}]"#,
        language,
        context,
    )
}

pub fn repair_lesson(language: &str, concept: &str, context: &str) -> Vec<Message> {
    let system = format!(
        "You are a patient tutor. The student keeps making mistakes about \
         \"{concept}\". Using only the document the user provides, write a short \
         targeted lesson that re-teaches this concept: explain it from first \
         principles, point out the common misunderstanding, and finish with two \
         quick self-check questions.\n\n{}",
        language_policy(language)
    );
    vec![Message::system(system), Message::user(context.to_string())]
}

pub fn autocomplete(language: &str, typed: &str, context: &str) -> Vec<Message> {
    let system = format!(
        "You are a note-taking autocomplete engine. Continue the student's \
         sentence naturally and factually, grounded in the document excerpt \
         below. Reply with the continuation only, no preamble.\n\n{}\n\n\
         --- DOCUMENT EXCERPT ---\n{context}\n--- END EXCERPT ---",
        language_policy(language)
    );
    vec![Message::system(system), Message::user(typed.to_string())]
}

/// Assemble the full chat prompt: tutor persona, two context-priming turns,
/// the trimmed history window (oldest first), then the new query.
pub fn chat(language: &str, context: &str, history: &[ChatTurn], query: &str) -> Vec<Message> {
    let persona = format!(
        "You are a friendly tutor helping a student understand their course \
         material. Answer only from the document content you have been given; \
         if the answer is not in it, say so. Explain ideas in your own words \
         rather than quoting verbatim, and end each answer with one short \
         guiding follow-up question.\n\n{}",
        language_policy(language)
    );

    let mut messages = vec![
        Message::system(persona),
        Message::user(format!(
            "Here is the document I am studying:\n\n{context}"
        )),
        Message::assistant(
            "I've read the document carefully. Ask me anything about it and I'll \
             explain it to you.",
        ),
    ];

    let start = history.len().saturating_sub(HISTORY_WINDOW);
    for turn in &history[start..] {
        messages.push(match turn.role {
            ChatRole::User => Message::user(turn.content.clone()),
            ChatRole::Assistant => Message::assistant(turn.content.clone()),
        });
    }

    messages.push(Message::user(query.to_string()));
    messages
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::Role;

    fn turns(n: usize) -> Vec<ChatTurn> {
        (0..n)
            .map(|i| ChatTurn {
                role: if i % 2 == 0 {
                    ChatRole::User
                } else {
                    ChatRole::Assistant
                },
                content: format!("turn {i}"),
            })
            .collect()
    }

    #[test]
    fn chat_windows_history_to_last_six() {
        let messages = chat("English", "the doc", &turns(10), "final question");
        // persona + 2 priming + 6 history + query
        assert_eq!(messages.len(), 10);
        let history: Vec<&str> = messages[3..9].iter().map(|m| m.content.as_str()).collect();
        assert_eq!(
            history,
            ["turn 4", "turn 5", "turn 6", "turn 7", "turn 8", "turn 9"]
        );
        assert_eq!(messages.last().unwrap().content, "final question");
    }

    #[test]
    fn chat_keeps_short_history_in_order() {
        let messages = chat("English", "the doc", &turns(2), "q");
        assert_eq!(messages.len(), 6);
        assert_eq!(messages[3].content, "turn 0");
        assert_eq!(messages[3].role, Role::User);
        assert_eq!(messages[4].content, "turn 1");
        assert_eq!(messages[4].role, Role::Assistant);
    }

    #[test]
    fn chat_primes_with_context() {
        let messages = chat("Spanish", "CONTEXT BODY", &[], "q");
        assert_eq!(messages[0].role, Role::System);
        assert!(messages[0].content.contains("Spanish"));
        assert!(messages[1].content.contains("CONTEXT BODY"));
        assert_eq!(messages[2].role, Role::Assistant);
    }

    #[test]
    fn structured_modes_state_language_and_shape() {
        let messages = flashcards("German", "ctx");
        assert!(messages[0].content.contains("German"));
        assert!(messages[0].content.contains(r#""front""#));
        assert_eq!(messages[1].content, "ctx");
    }
}

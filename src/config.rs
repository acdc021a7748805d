//! Runtime settings loaded from the environment.
//!
//! Everything tunable lives here, including the per-mode context budgets.
//! The budget numbers were calibrated against one provider's context window
//! and cost model, so they are configuration rather than constants.

use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;

/// Character budgets applied to document context before prompting.
#[derive(Debug, Clone, Copy)]
pub struct ContextBudgets {
    /// Summary, chat and complex-topics modes.
    pub chat: usize,
    /// Flashcards, quiz, notes, glossary, predictions, repair lessons.
    pub study: usize,
    /// Autocomplete gets a tiny window for latency.
    pub autocomplete: usize,
}

impl Default for ContextBudgets {
    fn default() -> Self {
        Self {
            chat: 80_000,
            study: 150_000,
            autocomplete: 5_000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub bind_addr: String,
    pub upload_dir: PathBuf,
    pub budgets: ContextBudgets,
}

impl Settings {
    /// Read settings from the environment, falling back to defaults.
    /// `.env` loading (dotenvy) happens in `main` before this is called.
    pub fn from_env() -> Result<Self> {
        let bind_addr =
            env::var("STUDYKIT_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".to_string());
        let upload_dir = env::var("STUDYKIT_UPLOAD_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("uploads"));

        let mut budgets = ContextBudgets::default();
        if let Some(v) = env_usize("STUDYKIT_BUDGET_CHAT")? {
            budgets.chat = v;
        }
        if let Some(v) = env_usize("STUDYKIT_BUDGET_STUDY")? {
            budgets.study = v;
        }
        if let Some(v) = env_usize("STUDYKIT_BUDGET_AUTOCOMPLETE")? {
            budgets.autocomplete = v;
        }

        Ok(Self {
            bind_addr,
            upload_dir,
            budgets,
        })
    }
}

fn env_usize(key: &str) -> Result<Option<usize>> {
    match env::var(key) {
        Ok(raw) => {
            let value = raw
                .parse::<usize>()
                .with_context(|| format!("{key} must be an integer, got {raw:?}"))?;
            Ok(Some(value))
        }
        Err(_) => Ok(None),
    }
}

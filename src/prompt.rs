// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Operator prompts.
//!
//! Business logic never talks to the terminal directly. It asks a
//! [`PromptSource`] instead, so the same code path can run interactively
//! through [`InquirePrompt`], unattended through [`NonInteractive`], or under
//! test through [`ScriptedPrompt`].

use inquire::{Confirm, Password, Text};
use std::{cell::RefCell, collections::VecDeque};

/// Capability to ask the operator for input.
pub trait PromptSource {
    /// Ask for a visible line of text, offering a default.
    ///
    /// # Errors
    ///
    /// - Return [`PromptError`] if input cannot be obtained.
    fn text(&self, message: &str, default: Option<&str>) -> Result<String>;

    /// Ask for a value with terminal echo disabled.
    ///
    /// An empty answer keeps the current value.
    ///
    /// # Errors
    ///
    /// - Return [`PromptError`] if input cannot be obtained.
    fn secret(&self, message: &str, current: Option<&str>) -> Result<String>;

    /// Ask a yes or no question.
    ///
    /// # Errors
    ///
    /// - Return [`PromptError`] if input cannot be obtained.
    fn confirm(&self, message: &str, default: bool) -> Result<bool>;
}

impl<P: PromptSource + ?Sized> PromptSource for &P {
    fn text(&self, message: &str, default: Option<&str>) -> Result<String> {
        (**self).text(message, default)
    }

    fn secret(&self, message: &str, current: Option<&str>) -> Result<String> {
        (**self).secret(message, current)
    }

    fn confirm(&self, message: &str, default: bool) -> Result<bool> {
        (**self).confirm(message, default)
    }
}

/// Terminal prompts through inquire.
#[derive(Debug, Default, Clone, Copy)]
pub struct InquirePrompt;

impl PromptSource for InquirePrompt {
    fn text(&self, message: &str, default: Option<&str>) -> Result<String> {
        let mut prompt = Text::new(message);
        if let Some(default) = default {
            prompt = prompt.with_default(default);
        }
        Ok(prompt.prompt()?)
    }

    fn secret(&self, message: &str, current: Option<&str>) -> Result<String> {
        let help = current.map(|_| "leave empty to keep the current value");
        let mut prompt = Password::new(message).without_confirmation();
        if let Some(help) = help {
            prompt = prompt.with_help_message(help);
        }

        let answer = prompt.prompt()?;
        match (answer.is_empty(), current) {
            (true, Some(current)) => Ok(current.to_string()),
            _ => Ok(answer),
        }
    }

    fn confirm(&self, message: &str, default: bool) -> Result<bool> {
        Ok(Confirm::new(message).with_default(default).prompt()?)
    }
}

/// Prompt source that never asks anything.
///
/// Every question is answered with its default, so values come purely from
/// whatever the caller already supplied.
#[derive(Debug, Default, Clone, Copy)]
pub struct NonInteractive;

impl PromptSource for NonInteractive {
    fn text(&self, _message: &str, default: Option<&str>) -> Result<String> {
        Ok(default.unwrap_or_default().to_string())
    }

    fn secret(&self, _message: &str, current: Option<&str>) -> Result<String> {
        Ok(current.unwrap_or_default().to_string())
    }

    fn confirm(&self, _message: &str, default: bool) -> Result<bool> {
        Ok(default)
    }
}

/// Prompt source answering from a fixed queue.
///
/// Answers are consumed in order regardless of prompt kind. An empty answer
/// falls back to the default or current value, the same way an operator
/// pressing enter would.
#[derive(Debug, Default)]
pub struct ScriptedPrompt {
    answers: RefCell<VecDeque<String>>,
    asked: RefCell<Vec<String>>,
}

impl ScriptedPrompt {
    pub fn new(answers: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            answers: RefCell::new(answers.into_iter().map(Into::into).collect()),
            asked: RefCell::new(Vec::new()),
        }
    }

    /// Messages of every prompt shown so far.
    pub fn asked(&self) -> Vec<String> {
        self.asked.borrow().clone()
    }

    fn next(&self, message: &str) -> Result<String> {
        self.asked.borrow_mut().push(message.to_string());
        self.answers
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| PromptError::Exhausted(message.to_string()))
    }
}

impl PromptSource for ScriptedPrompt {
    fn text(&self, message: &str, default: Option<&str>) -> Result<String> {
        let answer = self.next(message)?;
        match (answer.is_empty(), default) {
            (true, Some(default)) => Ok(default.to_string()),
            _ => Ok(answer),
        }
    }

    fn secret(&self, message: &str, current: Option<&str>) -> Result<String> {
        self.text(message, current)
    }

    fn confirm(&self, message: &str, default: bool) -> Result<bool> {
        let answer = self.next(message)?;
        Ok(match answer.to_ascii_lowercase().as_str() {
            "y" | "yes" => true,
            "n" | "no" => false,
            _ => default,
        })
    }
}

/// Prompt error types.
#[derive(Debug, thiserror::Error)]
pub enum PromptError {
    /// Terminal prompt failed or was cancelled.
    #[error(transparent)]
    Inquire(#[from] inquire::InquireError),

    /// Scripted answers ran out.
    #[error("no scripted answer left for prompt {0:?}")]
    Exhausted(String),
}

/// Friendly result alias :3
pub type Result<T, E = PromptError> = std::result::Result<T, E>;

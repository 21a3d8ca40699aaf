//! Human consent prompts.
//!
//! Prompts block the calling thread until answered; the authorizer runs them
//! on the blocking pool behind its single prompt permit.

use anyhow::{Context, Result};
use std::io::{self, BufRead, Write};
use tracing::info;

use crate::identity::IdentityCertificate;
use crate::request_authorizer::RequestVerdict;

#[derive(Debug, Clone)]
pub struct PromptRequest {
    pub identity: IdentityCertificate,
    pub verdict: RequestVerdict,
    /// What the caller wants to do, e.g. `print to Zebra LP2844`
    pub action: String,
}

impl PromptRequest {
    pub fn message(&self) -> String {
        format!("{} wants to {}", self.identity.common_name(), self.action)
    }

    /// Trust summary shown next to the question
    pub fn trust_line(&self) -> String {
        if self.identity.is_trusted() && self.verdict == RequestVerdict::Trusted {
            "Verified by a trusted certificate".to_string()
        } else if self.identity.is_unknown() {
            "Untrusted website".to_string()
        } else {
            format!("Untrusted website - {}", self.verdict.description())
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PromptAnswer {
    pub approved: bool,
    pub remember: bool,
}

impl PromptAnswer {
    pub const DENY: PromptAnswer = PromptAnswer {
        approved: false,
        remember: false,
    };
}

pub trait ConsentPrompt: Send + Sync {
    fn ask(&self, request: &PromptRequest) -> Result<PromptAnswer>;
}

/// No one to ask: everything not already allow-listed is denied
#[derive(Debug, Default, Clone, Copy)]
pub struct HeadlessPrompt;

impl ConsentPrompt for HeadlessPrompt {
    fn ask(&self, request: &PromptRequest) -> Result<PromptAnswer> {
        info!("Denied {} to {} (headless)", request.identity.common_name(), request.action);
        Ok(PromptAnswer::DENY)
    }
}

/// Asks on the controlling terminal
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalPrompt;

impl ConsentPrompt for TerminalPrompt {
    fn ask(&self, request: &PromptRequest) -> Result<PromptAnswer> {
        let mut stderr = io::stderr().lock();
        writeln!(stderr, "\n{}\n  {}\n  certificate: {}", request.message(), request.trust_line(), request.identity)
            .context("Failed to write prompt")?;
        write!(stderr, "Allow? [y]es / [N]o / [a]lways allow / [b]lock: ").context("Failed to write prompt")?;
        stderr.flush().context("Failed to flush prompt")?;

        let mut line = String::new();
        io::stdin()
            .lock()
            .read_line(&mut line)
            .context("Failed to read prompt answer")?;
        Ok(parse_answer(&line))
    }
}

pub fn parse_answer(line: &str) -> PromptAnswer {
    match line.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" => PromptAnswer {
            approved: true,
            remember: false,
        },
        "a" | "always" => PromptAnswer {
            approved: true,
            remember: true,
        },
        "b" | "block" => PromptAnswer {
            approved: false,
            remember: true,
        },
        _ => PromptAnswer::DENY,
    }
}

//! Oracle prompt builder.
//!
//! The prompt is rendered from an embedded template whose sections carry
//! `<!-- section:KEY required|droppable -->` markers, then fitted to a byte
//! budget by dropping low-value sections and truncating the last one.

use std::sync::LazyLock;

use anyhow::Result;
use minijinja::{Environment, context};
use regex::Regex;
use tracing::debug;

use crate::core::types::{Ecosystem, SecureVersionTarget};

const REFINE_TEMPLATE: &str = include_str!("prompts/refine.md");
const TRUNCATION_MARKER: &str = "\n[truncated]";

static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->").unwrap()
});

/// Everything one refinement prompt is built from. Nothing else leaks in.
#[derive(Debug, Clone)]
pub struct RefinePromptInputs<'a> {
    pub ecosystem: Ecosystem,
    pub manifest_file: &'a str,
    pub target: &'a SecureVersionTarget,
    /// Original, unpatched manifest content.
    pub manifest: &'a str,
    pub attempt: u32,
    pub rules: Vec<String>,
    pub conflicting: Vec<String>,
    /// Rendered diagnostics of the most recent failure.
    pub failure: String,
    /// Rendered diagnostics of earlier failures, oldest first.
    pub history: String,
}

static TEMPLATES: LazyLock<Environment<'static>> = LazyLock::new(|| {
    let mut env = Environment::new();
    env.add_template("refine", REFINE_TEMPLATE)
        .expect("embedded refine template parses");
    env
});

fn render_refine(input: &RefinePromptInputs<'_>) -> Result<String> {
    let history = input.history.trim();
    let text = TEMPLATES.get_template("refine")?.render(context! {
        ecosystem => input.ecosystem.as_str(),
        manifest_file => input.manifest_file,
        target => &input.target,
        manifest => input.manifest.trim_end(),
        attempt => input.attempt,
        rules => &input.rules,
        conflicting => &input.conflicting,
        failure => input.failure.trim(),
        history => (!history.is_empty()).then_some(history),
    })?;
    Ok(text)
}

/// One marked block of the rendered prompt.
#[derive(Debug, Clone)]
struct Block {
    name: String,
    droppable: bool,
    body: String,
}

/// Split rendered text at its markers. Empty droppable blocks disappear.
fn split_blocks(text: &str) -> Vec<Block> {
    let found: Vec<(usize, usize, String, bool)> = SECTION_RE
        .captures_iter(text)
        .filter_map(|caps| {
            let marker = caps.get(0)?;
            Some((
                marker.start(),
                marker.end(),
                caps.get(1)?.as_str().to_string(),
                caps.get(2)?.as_str() == "droppable",
            ))
        })
        .collect();
    let ends: Vec<usize> = found
        .iter()
        .skip(1)
        .map(|(start, ..)| *start)
        .chain(std::iter::once(text.len()))
        .collect();
    found
        .into_iter()
        .zip(ends)
        .map(|((_, body_start, name, droppable), body_end)| Block {
            name,
            droppable,
            body: text[body_start..body_end].trim().to_string(),
        })
        .filter(|block| !(block.droppable && block.body.is_empty()))
        .collect()
}

fn size(blocks: &[Block]) -> usize {
    blocks.iter().map(|b| b.body.len()).sum()
}

/// Earlier attempts go first, then the rule list. If that is not enough the
/// final block (the latest failure) is cut and marked.
fn fit_to_budget(blocks: &mut Vec<Block>, budget: usize) {
    for name in ["history", "rules"] {
        if size(blocks) <= budget {
            return;
        }
        if let Some(pos) = blocks.iter().position(|b| b.droppable && b.name == name) {
            let gone = blocks.remove(pos);
            debug!(block = name, bytes = gone.body.len(), "prompt block dropped");
        }
    }

    let over = size(blocks).saturating_sub(budget);
    if over == 0 {
        return;
    }
    let Some(tail) = blocks.last_mut() else {
        return;
    };
    let keep = tail.body.len().saturating_sub(over);
    let original = tail.body.len();
    match keep.checked_sub(TRUNCATION_MARKER.len()) {
        Some(room) if room > 0 => {
            cut_to(&mut tail.body, room);
            tail.body.push_str(TRUNCATION_MARKER);
        }
        _ => cut_to(&mut tail.body, keep),
    }
    debug!(block = %tail.name, original, kept = tail.body.len(), "prompt block cut");
}

fn cut_to(text: &mut String, max: usize) {
    if let Some(cut) = (0..=max.min(text.len())).rev().find(|&i| text.is_char_boundary(i)) {
        text.truncate(cut);
    }
}

/// Builds refinement prompts within a byte budget.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    budget_bytes: usize,
}

impl PromptBuilder {
    pub fn new(budget_bytes: usize) -> Self {
        Self { budget_bytes }
    }

    pub fn build_refinement(&self, input: &RefinePromptInputs<'_>) -> Result<String> {
        let mut blocks = split_blocks(&render_refine(input)?);
        fit_to_budget(&mut blocks, self.budget_bytes);
        Ok(blocks
            .iter()
            .map(|b| b.body.as_str())
            .collect::<Vec<_>>()
            .join("\n\n"))
    }
}

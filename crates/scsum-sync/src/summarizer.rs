//! Keyword-rule summarizer driven by `rules/summarizer.yaml`.

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use scsum_core::{Domain, IssueType, Summarizer, Ticket, TicketAnalysis};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
struct RulesFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default = "default_word_budget")]
    summary_words: usize,
    #[serde(default = "default_word_budget")]
    solution_words: usize,
    #[serde(default)]
    domains: Vec<LabelRule>,
    #[serde(default)]
    issue_types: Vec<LabelRule>,
}

fn default_word_budget() -> usize {
    40
}

#[derive(Debug, Clone, Deserialize)]
struct LabelRule {
    label: String,
    contains_any: Vec<String>,
}

#[derive(Debug, Clone)]
struct Rule<L> {
    label: L,
    needles: Vec<String>,
}

impl<L: Copy> Rule<L> {
    fn matches(&self, haystack: &str) -> bool {
        self.needles.iter().any(|needle| haystack.contains(needle.as_str()))
    }
}

fn compile<L>(
    rules: Vec<LabelRule>,
    section: &str,
    parse: impl Fn(&str) -> Option<L>,
) -> Result<Vec<Rule<L>>> {
    rules
        .into_iter()
        .map(|rule| {
            let label = parse(&rule.label)
                .ok_or_else(|| anyhow!("unknown {section} label `{}`", rule.label))?;
            Ok(Rule {
                label,
                needles: rule
                    .contains_any
                    .iter()
                    .map(|needle| needle.to_lowercase())
                    .filter(|needle| !needle.is_empty())
                    .collect(),
            })
        })
        .collect()
}

/// Classifies tickets by keyword and extracts short summaries without any
/// external service.
#[derive(Debug, Clone)]
pub struct RuleSummarizer {
    domains: Vec<Rule<Domain>>,
    issue_types: Vec<Rule<IssueType>>,
    summary_words: usize,
    solution_words: usize,
}

impl RuleSummarizer {
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let file: RulesFile = serde_yaml::from_str(raw).context("parsing summarizer rules")?;
        Ok(Self {
            domains: compile(file.domains, "domain", Domain::from_label)?,
            issue_types: compile(file.issue_types, "issue type", IssueType::from_label)?,
            summary_words: file.summary_words,
            solution_words: file.solution_words,
        })
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&raw).with_context(|| format!("loading {}", path.display()))
    }

    pub fn classify(&self, ticket: &Ticket) -> (Domain, IssueType) {
        let haystack = classification_text(ticket);
        let domain = self
            .domains
            .iter()
            .find(|rule| rule.matches(&haystack))
            .map_or(Domain::Other, |rule| rule.label);
        let issue_type = self
            .issue_types
            .iter()
            .find(|rule| rule.matches(&haystack))
            .map_or(IssueType::Other, |rule| rule.label);
        (domain, issue_type)
    }

    pub fn summarize(&self, ticket: &Ticket) -> String {
        let source = first_sentence(&ticket.description);
        let source = if source.is_empty() { ticket.name.as_str() } else { source };
        cap_words(source, self.summary_words)
    }

    pub fn solution(&self, ticket: &Ticket) -> String {
        ticket
            .comments
            .last()
            .map(|comment| cap_words(&comment.text, self.solution_words))
            .unwrap_or_default()
    }
}

#[async_trait]
impl Summarizer for RuleSummarizer {
    async fn analyze(&self, ticket: &Ticket) -> Result<TicketAnalysis> {
        let (domain, issue_type) = self.classify(ticket);
        Ok(TicketAnalysis {
            domain,
            issue_type,
            summary: self.summarize(ticket),
            solution: self.solution(ticket),
        })
    }
}

/// Lowercased description, authors and comment bodies; timestamps stay out
/// so numeric needles only match what people wrote.
fn classification_text(ticket: &Ticket) -> String {
    let mut text = ticket.description.to_lowercase();
    for comment in &ticket.comments {
        text.push('\n');
        text.push_str(&comment.author.to_lowercase());
        text.push(' ');
        text.push_str(&comment.text.to_lowercase());
    }
    text
}

fn first_sentence(text: &str) -> &str {
    let text = text.trim();
    let end = text
        .char_indices()
        .find(|&(i, c)| {
            matches!(c, '.' | '!' | '?' | '\n')
                && text[i + c.len_utf8()..]
                    .chars()
                    .next()
                    .map_or(true, char::is_whitespace)
        })
        .map_or(text.len(), |(i, c)| if c == '\n' { i } else { i + c.len_utf8() });
    text[..end].trim()
}

fn cap_words(text: &str, budget: usize) -> String {
    let words: Vec<&str> = text.split_whitespace().collect();
    if words.len() <= budget {
        return words.join(" ");
    }
    format!("{}…", words[..budget].join(" "))
}

//! Vote extraction and plurality decision.

use std::collections::HashMap;

use regex::Regex;

use mosaic_core::ExtractionRule;

use super::types::{BranchResult, ExecutorError, VoteCount};

/// Compiled form of an [`ExtractionRule`].
#[derive(Debug, Clone)]
pub enum Extractor {
    Exact,
    Trimmed,
    Normalized,
    FirstLine,
    Regex { re: Regex, group: usize },
}

impl Extractor {
    pub fn new(rule: &ExtractionRule) -> Result<Self, ExecutorError> {
        Ok(match rule {
            ExtractionRule::Exact => Self::Exact,
            ExtractionRule::Trimmed => Self::Trimmed,
            ExtractionRule::Normalized => Self::Normalized,
            ExtractionRule::FirstLine => Self::FirstLine,
            ExtractionRule::Regex { pattern, group } => Self::Regex {
                re: Regex::new(pattern)
                    .map_err(|e| ExecutorError::InvalidExtraction(e.to_string()))?,
                group: *group,
            },
        })
    }

    /// The comparable answer in `output`. Empty answers and regex misses
    /// cast no vote.
    pub fn extract(&self, output: &str) -> Option<String> {
        let value = match self {
            Self::Exact => output.to_string(),
            Self::Trimmed => output.trim().to_string(),
            Self::Normalized => normalize(output),
            Self::FirstLine => normalize(output.lines().find(|l| !l.trim().is_empty())?),
            Self::Regex { re, group } => normalize(re.captures(output)?.get(*group)?.as_str()),
        };
        (!value.is_empty()).then_some(value)
    }
}

fn normalize(s: &str) -> String {
    s.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Outcome of a vote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub winner: String,
    /// Raw output of the earliest-finishing branch that voted for the winner.
    pub output: String,
    pub tally: Vec<VoteCount>,
}

struct Entry<'a> {
    count: usize,
    earliest: usize,
    output: &'a str,
}

/// Plurality over successful branches. Equal counts go to the value whose
/// first supporter completed earliest.
pub fn decide(extractor: &Extractor, branches: &[BranchResult]) -> Option<Decision> {
    let mut entries: HashMap<String, Entry<'_>> = HashMap::new();
    for branch in branches.iter().filter(|b| b.succeeded()) {
        let Some(output) = branch.output.as_deref() else {
            continue;
        };
        let Some(value) = extractor.extract(output) else {
            continue;
        };
        let order = branch.completion_order.unwrap_or(usize::MAX);
        let entry = entries.entry(value).or_insert(Entry {
            count: 0,
            earliest: order,
            output,
        });
        entry.count += 1;
        if order < entry.earliest {
            entry.earliest = order;
            entry.output = output;
        }
    }

    let mut ranked: Vec<(String, Entry<'_>)> = entries.into_iter().collect();
    ranked.sort_by(|(_, a), (_, b)| b.count.cmp(&a.count).then(a.earliest.cmp(&b.earliest)));

    let (winner, top) = ranked.first()?;
    Some(Decision {
        winner: winner.clone(),
        output: top.output.to_string(),
        tally: ranked
            .iter()
            .map(|(value, e)| VoteCount {
                value: value.clone(),
                count: e.count,
            })
            .collect(),
    })
}

//! Regular-expression [`Parser`], served as `parser:regex`

use dashmap::DashMap;
use regex::Regex;
use ski_engine::host::ParserError;
use ski_engine::{Parser, RunContext};
use std::sync::Arc;

/// Selectors are regular expressions.
///
/// String lookups yield capture group 1 when the pattern has one and the
/// whole match otherwise; element lookups always yield the whole match.
/// Nothing matching yields an empty string or an empty list.
#[derive(Default)]
pub struct RegexParser {
    compiled: DashMap<String, Arc<Regex>>,
}

impl RegexParser {
    /// Create a parser with an empty pattern cache
    pub fn new() -> Self {
        Self::default()
    }

    fn regex(&self, selector: &str) -> Result<Arc<Regex>, ParserError> {
        if let Some(regex) = self.compiled.get(selector) {
            return Ok(regex.clone());
        }
        let regex = Regex::new(selector).map(Arc::new).map_err(|err| {
            ParserError::InvalidSelector {
                selector: selector.to_string(),
                message: err.to_string(),
            }
        })?;
        self.compiled.insert(selector.to_string(), regex.clone());
        Ok(regex)
    }
}

fn group_text(captures: &regex::Captures<'_>) -> String {
    captures
        .get(1)
        .or_else(|| captures.get(0))
        .map(|m| m.as_str().to_string())
        .unwrap_or_default()
}

impl Parser for RegexParser {
    fn get_string(
        &self,
        _ctx: &RunContext,
        content: &str,
        selector: &str,
    ) -> Result<String, ParserError> {
        let regex = self.regex(selector)?;
        Ok(regex
            .captures(content)
            .map(|captures| group_text(&captures))
            .unwrap_or_default())
    }

    fn get_strings(
        &self,
        _ctx: &RunContext,
        content: &str,
        selector: &str,
    ) -> Result<Vec<String>, ParserError> {
        let regex = self.regex(selector)?;
        Ok(regex
            .captures_iter(content)
            .map(|captures| group_text(&captures))
            .collect())
    }

    fn get_element(
        &self,
        _ctx: &RunContext,
        content: &str,
        selector: &str,
    ) -> Result<String, ParserError> {
        let regex = self.regex(selector)?;
        Ok(regex
            .find(content)
            .map(|m| m.as_str().to_string())
            .unwrap_or_default())
    }

    fn get_elements(
        &self,
        _ctx: &RunContext,
        content: &str,
        selector: &str,
    ) -> Result<Vec<String>, ParserError> {
        let regex = self.regex(selector)?;
        Ok(regex
            .find_iter(content)
            .map(|m| m.as_str().to_string())
            .collect())
    }
}

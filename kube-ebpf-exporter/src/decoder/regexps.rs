use anyhow::{bail, Context, Result};
use regex::Regex;

use crate::config::RegexpRule;

/// Ordered pattern rules; the first matching rule decides the value.
#[derive(Debug, Clone)]
pub struct Regexps {
    rules: Vec<(Regex, Option<String>)>,
}

impl Regexps {
    pub fn compile(rules: &[RegexpRule]) -> Result<Self> {
        if rules.is_empty() {
            bail!("regexps decoder needs at least one pattern");
        }
        let rules = rules
            .iter()
            .map(|rule| {
                let (pattern, replacement) = match rule {
                    RegexpRule::Pattern(pattern) => (pattern, None),
                    RegexpRule::Replace {
                        pattern,
                        replacement,
                    } => (pattern, Some(replacement.clone())),
                };
                let regex = Regex::new(pattern)
                    .with_context(|| format!("compiling regexp {pattern:?}"))?;
                Ok((regex, replacement))
            })
            .collect::<Result<_>>()?;
        Ok(Self { rules })
    }

    /// The rewritten value, or None when no rule matches.
    pub fn decode(&self, input: &[u8]) -> Option<String> {
        let input = String::from_utf8_lossy(input);
        self.rules
            .iter()
            .find(|(regex, _)| regex.is_match(&input))
            .map(|(regex, replacement)| match replacement {
                Some(replacement) => regex.replace(&input, replacement.as_str()).into_owned(),
                None => input.to_string(),
            })
    }
}

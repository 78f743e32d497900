//! Named capability bundles.
//!
//! A bot pairs a system prompt with the tool set and budgets its commands
//! may use. The catalog is static; projects pick models and budgets.

use std::collections::HashMap;

use crate::domain::BotName;

/// Tools every bot may read with.
const READ_TOOLS: &[&str] = &["Read", "Grep", "Glob"];
/// Tools that mutate the workspace.
const WRITE_TOOLS: &[&str] = &["Edit", "Write", "NotebookEdit", "Bash"];

/// The planning pre-pass runs read-only, cheap, and without continuations.
pub const DECOMPOSE_COMMAND: &str = "decompose";

/// Prompt wrapper for the planning pre-pass.
#[must_use]
pub fn planning_prompt(original: &str) -> String {
    format!(
        "Plan the following request as independent subtasks. Do not make any \
         changes. Reply with a fenced ```json:subtasks``` block containing a \
         JSON array of objects with string fields \"title\", \"prompt\" and \
         \"command\".\n\nRequest:\n{original}"
    )
}

/// A named capability bundle.
#[derive(Debug, Clone)]
pub struct Bot {
    pub name: BotName,
    pub system_prompt: String,
    pub allowed_tools: Vec<String>,
    pub max_continuations: u32,
    /// Prompt length at which a `feature` request goes through the
    /// decomposition pre-pass; `None` disables decomposition.
    pub decompose_prompt_threshold: Option<usize>,
}

impl Bot {
    /// Whether a submit should run the decomposition pre-pass first.
    #[must_use]
    pub fn wants_decomposition(&self, command: &str, prompt: &str) -> bool {
        match self.decompose_prompt_threshold {
            Some(threshold) => command == "feature" && prompt.chars().count() >= threshold,
            None => false,
        }
    }
}

/// Static bot catalog.
pub struct BotCatalog {
    bots: HashMap<BotName, Bot>,
}

impl Default for BotCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}

impl BotCatalog {
    /// The built-in bots: `coder`, `ops`, `netsuite`.
    #[must_use]
    pub fn builtin() -> Self {
        let mut bots = HashMap::new();

        let coder = Bot {
            name: BotName::try_new("coder".to_string()).unwrap(),
            system_prompt: "You are a careful senior engineer working inside the \
                            project checkout. Make the smallest change that solves \
                            the request, run the relevant tests, and report what \
                            you changed."
                .to_string(),
            allowed_tools: all_tools(),
            max_continuations: 3,
            decompose_prompt_threshold: Some(200),
        };
        bots.insert(coder.name.clone(), coder);

        let ops = Bot {
            name: BotName::try_new("ops".to_string()).unwrap(),
            system_prompt: "You operate this project's build and test pipeline. \
                            Run the requested step, capture its output, and report \
                            pass or fail with the relevant log excerpt."
                .to_string(),
            allowed_tools: all_tools(),
            max_continuations: 1,
            decompose_prompt_threshold: None,
        };
        bots.insert(ops.name.clone(), ops);

        let netsuite = Bot {
            name: BotName::try_new("netsuite".to_string()).unwrap(),
            system_prompt: "You work on this project's NetSuite customizations. \
                            Follow the existing SuiteScript conventions in the \
                            checkout."
                .to_string(),
            allowed_tools: all_tools(),
            max_continuations: 3,
            decompose_prompt_threshold: Some(200),
        };
        bots.insert(netsuite.name.clone(), netsuite);

        Self { bots }
    }

    /// Looks up a bot by name.
    #[must_use]
    pub fn get(&self, name: &BotName) -> Option<&Bot> {
        self.bots.get(name)
    }

    /// All bot names, for usage lines.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.bots.keys().map(|n| n.as_str().to_string()).collect();
        names.sort();
        names
    }
}

fn all_tools() -> Vec<String> {
    READ_TOOLS
        .iter()
        .chain(WRITE_TOOLS.iter())
        .map(ToString::to_string)
        .collect()
}

/// Read-only tool set for the planning pre-pass.
#[must_use]
pub fn read_only_tools() -> Vec<String> {
    READ_TOOLS.iter().map(ToString::to_string).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coder_decomposes_long_feature_requests_only() {
        let catalog = BotCatalog::builtin();
        let coder = catalog.get(&BotName::try_new("coder".to_string()).unwrap()).unwrap();

        let long = "x".repeat(200);
        assert!(coder.wants_decomposition("feature", &long));
        assert!(!coder.wants_decomposition("feature", "short ask"));
        assert!(!coder.wants_decomposition("build", &long));

        let ops = catalog.get(&BotName::try_new("ops".to_string()).unwrap()).unwrap();
        assert!(!ops.wants_decomposition("feature", &long));
    }
}

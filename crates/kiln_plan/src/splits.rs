//! Split rules: classifying artifact files into named domains.
//!
//! Globs are absolute paths after variable expansion. `**` crosses
//! directories, `*` and `?` do not.

use crate::dag::ResolvedElement;
use crate::project::ProjectConfig;
use crate::variables::{VariableError, Variables};
use indexmap::IndexMap;
use kiln_core::FileTree;
use regex::Regex;

/// Key in an element's public data holding domain overrides
pub const PUBLIC_SPLIT_RULES: &str = "split-rules";

/// Split rule errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SplitError {
    /// A domain name nobody defines
    #[error("unknown split domain '{0}'")]
    UnknownDomain(String),

    /// A glob that does not compile
    #[error("invalid split glob '{glob}': {reason}")]
    InvalidGlob {
        /// The glob
        glob: String,
        /// Compiler message
        reason: String,
    },

    /// Variable expansion failed
    #[error(transparent)]
    Variable(#[from] VariableError),

    /// Element public data has the wrong shape
    #[error("public 'split-rules' must map domains to lists of globs")]
    InvalidPublicRules,
}

/// Compiled split domains for one element
#[derive(Debug, Clone, Default)]
pub struct SplitRules {
    domains: IndexMap<String, Vec<Regex>>,
}

impl SplitRules {
    /// Compile domain globs, expanding variables first
    ///
    /// # Errors
    ///
    /// Returns error if a glob references an undefined variable or does not compile
    pub fn compile(rules: &IndexMap<String, Vec<String>>, vars: &Variables) -> Result<Self, SplitError> {
        let mut domains = IndexMap::with_capacity(rules.len());
        for (domain, globs) in rules {
            let compiled = globs
                .iter()
                .map(|glob| glob_to_regex(&vars.subst(glob)?))
                .collect::<Result<Vec<_>, SplitError>>()?;
            domains.insert(domain.clone(), compiled);
        }
        Ok(Self { domains })
    }

    /// Project rules with the element's public overrides on top
    ///
    /// # Errors
    ///
    /// Returns error if any rule is malformed
    pub fn for_element(project: &ProjectConfig, element: &ResolvedElement) -> Result<Self, SplitError> {
        let mut rules = project.effective_split_rules();
        if let Some(public) = element.public().get(PUBLIC_SPLIT_RULES) {
            let overrides = public.as_object().ok_or(SplitError::InvalidPublicRules)?;
            for (domain, globs) in overrides {
                let globs = globs
                    .as_array()
                    .and_then(|items| {
                        items
                            .iter()
                            .map(|g| g.as_str().map(str::to_string))
                            .collect::<Option<Vec<_>>>()
                    })
                    .ok_or(SplitError::InvalidPublicRules)?;
                rules.insert(domain.clone(), globs);
            }
        }
        Self::compile(&rules, element.variables())
    }

    /// Domain names in declaration order
    pub fn domains(&self) -> impl Iterator<Item = &str> {
        self.domains.keys().map(String::as_str)
    }

    /// Domains a relative artifact path belongs to
    #[must_use]
    pub fn domains_of(&self, path: &str) -> Vec<&str> {
        let absolute = format!("/{}", path.trim_start_matches('/'));
        self.domains
            .iter()
            .filter(|(_, globs)| globs.iter().any(|re| re.is_match(&absolute)))
            .map(|(d, _)| d.as_str())
            .collect()
    }

    /// Filter an artifact tree by domain
    ///
    /// A file is kept if it is in an included domain (or `include` is empty)
    /// and in no excluded domain. Files in no domain are kept only when
    /// `orphans` is set.
    ///
    /// # Errors
    ///
    /// Returns error if a named domain is not defined
    pub fn select(
        &self,
        tree: &FileTree,
        include: &[String],
        exclude: &[String],
        orphans: bool,
    ) -> Result<FileTree, SplitError> {
        for name in include.iter().chain(exclude) {
            if !self.domains.contains_key(name) {
                return Err(SplitError::UnknownDomain(name.clone()));
            }
        }

        Ok(tree.filtered(|path| {
            let domains = self.domains_of(path);
            if domains.is_empty() {
                return orphans;
            }
            if domains.iter().any(|d| exclude.iter().any(|e| e == d)) {
                return false;
            }
            include.is_empty() || domains.iter().any(|d| include.iter().any(|i| i == d))
        }))
    }
}

fn glob_to_regex(glob: &str) -> Result<Regex, SplitError> {
    let glob_abs: Vec<char> = format!("/{}", glob.trim_start_matches('/')).chars().collect();
    let mut pattern = String::from("^");
    let mut i = 0;
    while i < glob_abs.len() {
        let c = glob_abs[i];
        i += 1;
        match c {
            '*' if glob_abs.get(i) == Some(&'*') => {
                i += 1;
                pattern.push_str(".*");
            }
            '*' => pattern.push_str("[^/]*"),
            '?' => pattern.push_str("[^/]"),
            '[' => match bracket_class(&glob_abs[i..]) {
                Some((class, used)) => {
                    pattern.push_str(&class);
                    i += used;
                }
                None => pattern.push_str(r"\["),
            },
            other => pattern.push_str(&regex::escape(&other.to_string())),
        }
    }
    pattern.push('$');
    Regex::new(&pattern).map_err(|e| SplitError::InvalidGlob {
        glob: glob.to_string(),
        reason: e.to_string(),
    })
}

/// Translate the body of a `[...]` class, `rest` starting after the `[`
///
/// Returns the regex class and the number of glob characters consumed, or
/// `None` when the class is never closed.
fn bracket_class(rest: &[char]) -> Option<(String, usize)> {
    let mut j = 0;
    let negated = rest.first() == Some(&'!');
    if negated {
        j += 1;
    }
    let body_start = j;
    if rest.get(j) == Some(&']') {
        j += 1;
    }
    while j < rest.len() && rest[j] != ']' {
        j += 1;
    }
    if j >= rest.len() {
        return None;
    }

    let mut class = String::from(if negated { "[^" } else { "[" });
    for (n, &c) in rest[body_start..j].iter().enumerate() {
        match c {
            '\\' | '[' | ']' | '&' | '~' => {
                class.push('\\');
                class.push(c);
            }
            '^' if n == 0 => class.push_str(r"\^"),
            other => class.push(other),
        }
    }
    class.push(']');
    Some((class, j + 1))
}

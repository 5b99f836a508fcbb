//! Immutable metadata for modules and test cases.

use serde::{Deserialize, Serialize};

/// Identifies a module (a category of test cases).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleDescriptor {
    /// Category label shown in reports.
    pub name: String,
    /// Cases come from a generator at discovery time instead of a static list.
    pub is_dynamic: bool,
}

impl ModuleDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_dynamic: false,
        }
    }

    pub fn dynamic(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_dynamic: true,
        }
    }
}

/// Identifies one test case.
///
/// `code` and `title` may be templates with positional placeholders
/// (`{0}`, `{1}`, ...) filled from `type_args` when the case is resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseDescriptor {
    pub code: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub type_args: Vec<String>,
}

impl CaseDescriptor {
    pub fn new(code: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            title: title.into(),
            type_args: Vec::new(),
        }
    }

    /// Template instantiated over concrete type names.
    pub fn generic<I, S>(code: impl Into<String>, title: impl Into<String>, type_args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            code: code.into(),
            title: title.into(),
            type_args: type_args.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_generic(&self) -> bool {
        !self.type_args.is_empty()
    }

    /// Code with type arguments substituted.
    pub fn resolved_code(&self) -> String {
        substitute(&self.code, &self.type_args)
    }

    /// Title with type arguments substituted.
    pub fn resolved_title(&self) -> String {
        substitute(&self.title, &self.type_args)
    }

    /// Concrete descriptor with no remaining type arguments.
    pub fn resolve(&self) -> CaseDescriptor {
        CaseDescriptor::new(self.resolved_code(), self.resolved_title())
    }
}

/// Replace `{n}` with `args[n]`. Placeholders without an argument and
/// unbalanced braces are left as written.
fn substitute(template: &str, args: &[String]) -> String {
    if args.is_empty() {
        return template.to_string();
    }
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let replaced = after.find('}').and_then(|end| {
            let index: usize = after[..end].parse().ok()?;
            let arg = args.get(index)?;
            Some((arg, end))
        });
        match replaced {
            Some((arg, end)) => {
                out.push_str(arg);
                rest = &after[end + 1..];
            }
            None => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

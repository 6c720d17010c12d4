use super::Filter;
use crate::jvm::{ClassAccessFlags, MethodAccessFlags};

/// Filter on wildcard patterns of Java names
///
/// Patterns support `*` (any run of characters, dots included) and `?` (one character). Every
/// required interface or annotation pattern must match at least one of the type's (or behavior's)
/// names.
#[derive(Debug, Clone)]
pub struct PatternFilter {
    class_pattern: String,
    method_pattern: String,
    parameter_patterns: Option<Vec<String>>,
    interface_patterns: Vec<String>,
    class_annotation_patterns: Vec<String>,
    method_annotation_patterns: Vec<String>,
    include_subtypes: bool,
    include_root_loaded: bool,
}

impl PatternFilter {
    pub fn new(class_pattern: impl Into<String>, method_pattern: impl Into<String>) -> Self {
        PatternFilter {
            class_pattern: class_pattern.into(),
            method_pattern: method_pattern.into(),
            parameter_patterns: None,
            interface_patterns: vec![],
            class_annotation_patterns: vec![],
            method_annotation_patterns: vec![],
            include_subtypes: false,
            include_root_loaded: false,
        }
    }

    /// Only behaviors with exactly these parameter types
    pub fn with_parameters<S: AsRef<str>>(mut self, patterns: &[S]) -> Self {
        self.parameter_patterns = Some(
            patterns
                .iter()
                .map(|pattern| String::from(pattern.as_ref()))
                .collect(),
        );
        self
    }

    pub fn with_interface(mut self, pattern: impl Into<String>) -> Self {
        self.interface_patterns.push(pattern.into());
        self
    }

    pub fn with_class_annotation(mut self, pattern: impl Into<String>) -> Self {
        self.class_annotation_patterns.push(pattern.into());
        self
    }

    pub fn with_method_annotation(mut self, pattern: impl Into<String>) -> Self {
        self.method_annotation_patterns.push(pattern.into());
        self
    }

    pub fn with_subtypes(mut self, include_subtypes: bool) -> Self {
        self.include_subtypes = include_subtypes;
        self
    }

    pub fn with_root_loaded(mut self, include_root_loaded: bool) -> Self {
        self.include_root_loaded = include_root_loaded;
        self
    }
}

fn all_present(patterns: &[String], names: &[String]) -> bool {
    patterns
        .iter()
        .all(|pattern| names.iter().any(|name| wildcard_match(pattern, name)))
}

impl Filter for PatternFilter {
    fn matches_type(
        &self,
        _access: ClassAccessFlags,
        name: &str,
        _super_name: Option<&str>,
        interface_names: &[String],
        annotation_names: &[String],
    ) -> bool {
        wildcard_match(&self.class_pattern, name)
            && all_present(&self.interface_patterns, interface_names)
            && all_present(&self.class_annotation_patterns, annotation_names)
    }

    fn matches_behavior(
        &self,
        _access: MethodAccessFlags,
        name: &str,
        parameter_type_names: &[String],
        _exception_type_names: &[String],
        annotation_names: &[String],
    ) -> bool {
        if !wildcard_match(&self.method_pattern, name) {
            return false;
        }
        if let Some(patterns) = &self.parameter_patterns {
            if patterns.len() != parameter_type_names.len()
                || !patterns
                    .iter()
                    .zip(parameter_type_names)
                    .all(|(pattern, name)| wildcard_match(pattern, name))
            {
                return false;
            }
        }
        all_present(&self.method_annotation_patterns, annotation_names)
    }

    fn include_subtypes(&self) -> bool {
        self.include_subtypes
    }

    fn include_root_loaded(&self) -> bool {
        self.include_root_loaded
    }

    fn identity(&self) -> Option<String> {
        if self.include_subtypes || self.class_pattern.contains(&['*', '?'][..]) {
            None
        } else {
            Some(self.class_pattern.clone())
        }
    }
}

/// Match text against a pattern with `*` and `?` wildcards
pub fn wildcard_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    let (mut p, mut t) = (0, 0);

    // Position of the last `*` and the text position it is currently standing in for
    let mut backtrack: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            backtrack = Some((p, t));
            p += 1;
        } else if let Some((star, consumed)) = backtrack {
            p = star + 1;
            t = consumed + 1;
            backtrack = Some((star, consumed + 1));
        } else {
            return false;
        }
    }
    pattern[p..].iter().all(|c| *c == '*')
}

#[cfg(test)]
mod test {
    use super::*;

    fn names(names: &[&str]) -> Vec<String> {
        names.iter().map(|name| String::from(*name)).collect()
    }

    #[test]
    fn wildcards() {
        assert!(wildcard_match("*", ""));
        assert!(wildcard_match("com.example.*", "com.example.Calc"));
        assert!(wildcard_match("*.Calc", "com.example.Calc"));
        assert!(wildcard_match("com.*.Ca?c", "com.example.Calc"));
        assert!(wildcard_match("a*b*c", "aXXbYYbc"));
        assert!(!wildcard_match("com.example.Calc", "com.example.Calculator"));
        assert!(!wildcard_match("?", ""));
        assert!(!wildcard_match("a*b", "acd"));
    }

    #[test]
    fn behavior_parameters() {
        let filter = PatternFilter::new("*", "sum").with_parameters(&["int", "int"]);
        let access = MethodAccessFlags::PUBLIC;
        assert!(filter.matches_behavior(access, "sum", &names(&["int", "int"]), &[], &[]));
        assert!(!filter.matches_behavior(access, "sum", &names(&["int"]), &[], &[]));
        assert!(!filter.matches_behavior(access, "add", &names(&["int", "int"]), &[], &[]));
    }

    #[test]
    fn required_interfaces_and_annotations() {
        let filter = PatternFilter::new("com.example.*", "*")
            .with_interface("java.lang.Runnable")
            .with_class_annotation("*.Traced");
        let access = ClassAccessFlags::PUBLIC;
        let interfaces = names(&["java.lang.Runnable"]);
        let annotations = names(&["com.example.Traced"]);
        assert!(filter.matches_type(access, "com.example.Job", None, &interfaces, &annotations));
        assert!(!filter.matches_type(access, "com.example.Job", None, &[], &annotations));
        assert!(!filter.matches_type(access, "com.example.Job", None, &interfaces, &[]));
    }

    #[test]
    fn identity_only_for_exact_names() {
        assert_eq!(
            PatternFilter::new("com.example.Calc", "*").identity(),
            Some(String::from("com.example.Calc"))
        );
        assert_eq!(PatternFilter::new("com.example.*", "*").identity(), None);
        assert_eq!(
            PatternFilter::new("com.example.Calc", "*")
                .with_subtypes(true)
                .identity(),
            None
        );
    }
}

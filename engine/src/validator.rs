//! Validator module for submitted source code
//!
//! A lexical containment check run before anything is allocated: the language
//! must be supported, the source must fit the policy's size limit, and it must
//! not contain any banned construct for its language.
//!
//! This is not a semantic guarantee. Obfuscation that builds a banned call at
//! runtime (string concatenation, reflection) is out of its reach; the
//! language preamble and the sandbox are the layers that catch those.

use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::languages::{LanguageConfig, LanguageTable};
use crate::policy::{PolicyTable, SecurityPolicy};

/// Reason a submission was rejected
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Unsupported language: {0}")]
    UnsupportedLanguage(String),

    #[error("Source is {size} bytes, limit is {max} bytes")]
    SourceTooLarge { size: usize, max: usize },

    #[error("Banned construct found: {0}")]
    BannedConstruct(String),
}

/// Language and policy a submission was validated against
#[derive(Debug, Clone, Copy)]
pub struct Validated<'a> {
    pub language: &'a LanguageConfig,
    pub policy: &'a SecurityPolicy,
}

#[derive(Debug, Clone)]
pub struct CodeValidator {
    languages: Arc<LanguageTable>,
    policies: Arc<PolicyTable>,
}

impl CodeValidator {
    pub fn new(languages: Arc<LanguageTable>, policies: Arc<PolicyTable>) -> Self {
        Self {
            languages,
            policies,
        }
    }

    /// Check, in order: language supported, size within limit, no banned construct
    pub fn validate(&self, code: &str, language: &str) -> Result<Validated<'_>, ValidationError> {
        let config = self
            .languages
            .resolve(language)
            .ok_or_else(|| ValidationError::UnsupportedLanguage(language.to_string()))?;
        let policy = self
            .policies
            .get(config.language)
            .ok_or_else(|| ValidationError::UnsupportedLanguage(language.to_string()))?;

        if code.len() > policy.max_source_bytes {
            return Err(ValidationError::SourceTooLarge {
                size: code.len(),
                max: policy.max_source_bytes,
            });
        }

        if let Some(token) = find_banned_construct(code, &policy.banned_constructs) {
            debug!("Rejected {} submission containing {:?}", config.language, token);
            return Err(ValidationError::BannedConstruct(token.to_string()));
        }

        Ok(Validated {
            language: config,
            policy,
        })
    }
}

fn is_ident(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$'
}

/// Collapse whitespace: dropped next to punctuation, kept as one space
/// between two identifier characters. `eval (x)` and `eval(x)` normalize
/// the same; `new  Function` stays two words.
fn normalize(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut pending_space = false;

    for ch in text.chars() {
        if ch.is_whitespace() {
            pending_space = true;
            continue;
        }
        if pending_space {
            if out.chars().next_back().is_some_and(is_ident) && is_ident(ch) {
                out.push(' ');
            }
            pending_space = false;
        }
        out.push(ch);
    }

    out
}

/// Returns the first banned construct present in `code`
fn find_banned_construct<'p>(code: &str, banned: &'p [String]) -> Option<&'p str> {
    let haystack = normalize(code);

    banned.iter().map(String::as_str).find(|construct| {
        let needle = normalize(construct);
        if needle.is_empty() {
            return false;
        }
        let anchored = needle.chars().next().is_some_and(is_ident);

        haystack.match_indices(needle.as_str()).any(|(idx, _)| {
            // identifier-led patterns only match at an identifier boundary
            !anchored || !haystack[..idx].chars().next_back().is_some_and(is_ident)
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator() -> CodeValidator {
        CodeValidator::new(
            Arc::new(LanguageTable::embedded().unwrap()),
            Arc::new(PolicyTable::embedded().unwrap()),
        )
    }

    macro_rules! sample {
        ($name:literal) => {
            include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/../test-codes/", $name))
        };
    }

    #[test]
    fn test_accepts_clean_submissions() {
        let v = validator();
        assert!(v.validate("console.log('Hello, World!');", "javascript").is_ok());
        assert!(v.validate("a, b = map(int, input().split())\nprint(a + b)", "python").is_ok());
        assert!(v
            .validate(
                "#include <iostream>\nint main() { int a, b; std::cin >> a >> b; std::cout << a + b; }",
                "cpp"
            )
            .is_ok());
        assert!(v
            .validate(
                "public class Main { public static void main(String[] a) { System.out.println(1); } }",
                "java"
            )
            .is_ok());
    }

    #[test]
    fn test_rejects_unsupported_language() {
        let err = validator().validate("PROGRAM-ID. HELLO.", "cobol").unwrap_err();
        assert_eq!(err, ValidationError::UnsupportedLanguage("cobol".into()));
    }

    #[test]
    fn test_rejects_oversized_source() {
        let code = "x = 1\n".repeat(20_000);
        let err = validator().validate(&code, "python").unwrap_err();
        assert!(matches!(err, ValidationError::SourceTooLarge { max: 65536, .. }));
    }

    #[test]
    fn test_size_checked_before_banned_constructs() {
        let code = format!("eval('1')\n{}", "#".repeat(70_000));
        let err = validator().validate(&code, "python").unwrap_err();
        assert!(matches!(err, ValidationError::SourceTooLarge { .. }));
    }

    #[test]
    fn test_rejects_eval_and_names_token() {
        let err = validator().validate("print(eval('1+1'))", "python").unwrap_err();
        assert_eq!(err, ValidationError::BannedConstruct("eval(".into()));
        assert!(err.to_string().contains("eval("));
    }

    #[test]
    fn test_whitespace_does_not_evade() {
        let v = validator();
        assert!(v.validate("x = eval  (\"1\")", "python").is_err());
        assert!(v.validate("const f = new\n  Function ('return 1');", "javascript").is_err());
        assert!(v.validate("let y = 2\neval('y')", "javascript").is_err());
    }

    #[test]
    fn test_identifier_boundary_avoids_false_positive() {
        let v = validator();
        assert!(v.validate("def retrieval(x):\n    return x\nprint(retrieval(1))", "python").is_ok());
        assert!(v.validate("function medieval(x) { return x; }\nmedieval(1);", "javascript").is_ok());
    }

    #[test]
    fn test_rejects_interpreter_introspection() {
        let v = validator();
        let cases = [
            ("import sys\nm = sys.modules['os']", "sys.modules"),
            ("import sys\nf = sys._getframe(0)", "_getframe"),
            ("cells = print.__closure__", "__closure__"),
        ];
        for (code, token) in cases {
            let err = v.validate(code, "python").unwrap_err();
            assert_eq!(err, ValidationError::BannedConstruct(token.into()), "{}", code);
        }
        assert!(v.validate("import sys\ndata = sys.stdin.read()", "python").is_ok());
    }

    #[test]
    fn test_adversarial_samples_rejected() {
        let v = validator();
        let cases = [
            (sample!("01_python_eval.py"), "python"),
            (sample!("02_python_subprocess.py"), "python"),
            (sample!("03_js_child_process.js"), "javascript"),
            (sample!("04_js_function_constructor.js"), "javascript"),
            (sample!("05_cpp_system.cpp"), "cpp"),
            (sample!("06_cpp_socket.cpp"), "cpp"),
            (sample!("07_java_runtime_exec.java"), "java"),
        ];
        for (code, language) in cases {
            assert!(
                matches!(v.validate(code, language), Err(ValidationError::BannedConstruct(_))),
                "{} sample was accepted:\n{}",
                language,
                code
            );
        }
    }

    #[test]
    fn test_runaway_samples_pass_validation() {
        let v = validator();
        assert!(v.validate(sample!("08_js_infinite_loop.js"), "javascript").is_ok());
        assert!(v.validate(sample!("09_js_output_flood.js"), "javascript").is_ok());
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("eval (  x )"), "eval(x)");
        assert_eq!(normalize("new   Function\n("), "new Function(");
        assert_eq!(normalize("a\n\tb"), "a b");
    }
}

//! Prompt construction for review and validation calls.
use std::fmt::Write as _;

use super::finding::Finding;
use super::ReviewUnit;
use crate::context::Evidence;
use crate::llm::Prompt;

/// What the model is told to pay attention to for one language.
struct LanguageProfile {
    names: &'static [&'static str],
    display: &'static str,
    semantics: &'static str,
    categories: &'static [&'static str],
    frameworks: &'static [&'static str],
}

const PROFILES: &[LanguageProfile] = &[
    LanguageProfile {
        names: &["python"],
        display: "Python",
        semantics: "dynamic typing, eval/exec, pickle and dynamic imports",
        categories: &[
            "Command Injection (os.system, subprocess with shell=True)",
            "SQL Injection (string concatenation or f-strings in queries, raw ORM queries)",
            "Code Injection (eval/exec, template injection)",
            "Deserialization (pickle, yaml.load, marshal)",
            "Path Traversal",
            "SSRF",
            "XXE",
            "Cryptographic Issues and Insecure Randomness",
            "Authentication/Authorization",
            "Mass Assignment",
        ],
        frameworks: &["Django", "Flask", "FastAPI", "SQLAlchemy", "Jinja2", "Requests"],
    },
    LanguageProfile {
        names: &["javascript", "typescript"],
        display: "JavaScript/TypeScript",
        semantics: "prototype chains, implicit coercion and the event loop",
        categories: &[
            "Cross-Site Scripting (XSS)",
            "Command Injection (child_process)",
            "SQL/NoSQL Injection",
            "Prototype Pollution",
            "Path Traversal",
            "SSRF",
            "ReDoS",
            "Insecure Deserialization",
            "Hardcoded Secrets",
            "CORS Misconfiguration",
        ],
        frameworks: &["Express", "Next.js", "React", "Nest.js", "Fastify", "Koa"],
    },
    LanguageProfile {
        names: &["go"],
        display: "Go",
        semantics: "goroutines, shared memory between them and the unsafe package",
        categories: &[
            "Command Injection (os/exec)",
            "SQL Injection (fmt.Sprintf in queries)",
            "Path Traversal",
            "SSRF",
            "Race Conditions",
            "Unsafe Operations",
            "Cryptographic Issues",
            "Authentication/Authorization",
            "Denial of Service",
            "Goroutine Leaks",
        ],
        frameworks: &["net/http", "Gin", "Echo", "Fiber", "GORM", "sqlx"],
    },
    LanguageProfile {
        names: &["rust"],
        display: "Rust",
        semantics: "unsafe blocks, FFI boundaries and integer overflow in release builds",
        categories: &[
            "Unsafe Code Blocks",
            "FFI Issues",
            "Integer Overflow/Underflow",
            "Command Injection (std::process::Command)",
            "SQL Injection (format! in queries)",
            "Path Traversal",
            "Deserialization Issues",
            "Denial of Service (panics, unbounded allocation)",
            "Cryptographic Issues",
        ],
        frameworks: &["Actix", "Axum", "Rocket", "Tokio", "sqlx", "diesel", "serde"],
    },
    LanguageProfile {
        names: &["java"],
        display: "Java",
        semantics: "reflection, serialization and container-managed security",
        categories: &[
            "SQL Injection (Statement with concatenation, JPQL/HQL)",
            "XXE",
            "Deserialization Vulnerabilities",
            "Command Injection (Runtime.exec, ProcessBuilder)",
            "Path Traversal",
            "SSRF",
            "LDAP Injection",
            "Reflection and Code Injection",
            "XSS and CSRF",
            "Cryptographic Issues",
        ],
        frameworks: &["Spring Boot", "Spring Security", "Jakarta EE", "Hibernate", "Struts"],
    },
    LanguageProfile {
        names: &["php"],
        display: "PHP",
        semantics: "type juggling, superglobals and include semantics",
        categories: &[
            "SQL Injection",
            "XSS",
            "Command Injection (system, exec, backticks)",
            "Remote Code Execution (eval, include with user input)",
            "Path Traversal and File Inclusion",
            "Type Juggling",
            "File Upload Vulnerabilities",
            "Insecure Deserialization (unserialize)",
            "SSRF",
        ],
        frameworks: &["Laravel", "Symfony", "WordPress", "Drupal", "CodeIgniter"],
    },
    LanguageProfile {
        names: &["c", "cpp"],
        display: "C/C++",
        semantics: "manual memory management, pointer arithmetic and undefined behaviour",
        categories: &[
            "Buffer Overflow/Underflow",
            "Use-After-Free and Double Free",
            "Integer Overflow/Underflow",
            "Format String Vulnerabilities",
            "Command Injection (system, popen)",
            "Path Traversal",
            "Race Conditions (TOCTOU)",
            "Null Pointer Dereference",
            "Cryptographic Issues",
        ],
        frameworks: &["libc", "STL", "Boost", "OpenSSL", "Qt", "libcurl"],
    },
    LanguageProfile {
        names: &["ruby"],
        display: "Ruby",
        semantics: "metaprogramming, send/eval and implicit conversions",
        categories: &[
            "Command Injection (system, backticks, Open3)",
            "SQL Injection (string interpolation in where clauses)",
            "Mass Assignment",
            "YAML Deserialization",
            "Code Injection (eval, send, constantize)",
            "Path Traversal",
            "ReDoS",
            "Authentication and Authorization Issues",
            "CSRF",
        ],
        frameworks: &["Rails", "Sinatra", "ActiveRecord", "Devise"],
    },
    LanguageProfile {
        names: &["dart"],
        display: "Dart/Flutter",
        semantics: "platform channels, isolates and client-side storage",
        categories: &[
            "Insecure Data Storage",
            "Insecure Communication",
            "SQL Injection",
            "Path Traversal",
            "Command Injection (Process.run)",
            "Insecure Authentication",
            "Insecure Deep Links",
            "Insecure Platform Channels",
            "Information Disclosure",
        ],
        frameworks: &["Flutter", "shelf", "sqflite", "shared_preferences", "dio"],
    },
];

const GENERIC_CATEGORIES: &[&str] = &[
    "Injection (command, SQL, code, template)",
    "Path Traversal",
    "SSRF",
    "Insecure Deserialization",
    "Cryptographic Issues and Hardcoded Secrets",
    "Authentication/Authorization",
    "Memory Safety",
];

const OUTPUT_FORMAT: &str = r#"Output Format (JSON):
{
  "reviews": [
    {
      "issue": "Brief, clear description of the security issue",
      "reasoning": "Why this is a vulnerability, how it can be exploited and what the impact is. Trace the data flow, including through related code.",
      "mitigation": "Specific, actionable remediation advice",
      "severity": "critical|high|medium|low|info",
      "confidence": 0.9,
      "code_snippet": "The vulnerable code, copied verbatim from CODE",
      "line_start": 42,
      "line_end": 45,
      "cwe_id": "CWE-89",
      "tags": ["injection"]
    }
  ]
}

Use the line numbers shown in CODE for line_start and line_end.
If no security issues are found, return: {"reviews": []}
Respond with JSON only."#;

fn profile(language: &str) -> Option<&'static LanguageProfile> {
    PROFILES.iter().find(|p| p.names.contains(&language))
}

/// System prompt for reviewing code written in `language`.
pub fn system_prompt(language: &str) -> String {
    let profile = profile(language);
    let display = profile.map_or("source", |p| p.display);

    let mut out = format!(
        "You are an expert security analyst specializing in {display} code security.\n\n\
         Analyze the code for security vulnerabilities by reasoning about how it behaves, \
         not by matching patterns.\n"
    );
    if let Some(p) = profile {
        let _ = writeln!(out, "Pay particular attention to {}.", p.semantics);
    }
    out.push_str(
        "\nConsider:\n\
         - How untrusted input flows through the code, including into RELATED CODE from other files\n\
         - Whether sanitization or validation is present and whether it can be bypassed\n\
         - Whether the issue is actually exploitable\n\n\
         Vulnerability categories to consider:\n",
    );
    let categories = profile.map_or(GENERIC_CATEGORIES, |p| p.categories);
    for (i, category) in categories.iter().enumerate() {
        let _ = writeln!(out, "{}. {category}", i + 1);
    }
    if let Some(p) = profile {
        let _ = writeln!(out, "\nCommon frameworks: {}", p.frameworks.join(", "));
    }
    out.push('\n');
    out.push_str(OUTPUT_FORMAT);
    out
}

/// Code with absolute file line numbers, `{:4} | line`.
pub fn number_lines(code: &str, first_line: usize) -> String {
    code.lines()
        .enumerate()
        .map(|(i, line)| format!("{:4} | {line}", first_line + i))
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn review_prompt(unit: &ReviewUnit, evidence: &Evidence) -> Prompt {
    let mut user = format!(
        "FILE: {}\nLANGUAGE: {}\nANALYSIS TYPE: review\n\nCODE (with line numbers):\n{}\n",
        unit.path,
        unit.language,
        number_lines(&unit.text, unit.start_line)
    );
    if !evidence.is_empty() {
        user.push_str("\nRELATED CODE (from semantic search):\n");
        user.push_str(&evidence.render());
    }
    Prompt::new(system_prompt(&unit.language), user)
}

const VALIDATION_SYSTEM: &str = r#"You review a reported security finding and decide whether it is a true vulnerability or a false positive.

Consider:
1. Is there validation or sanitization that prevents exploitation?
2. Is the code path reachable with attacker-controlled input?
3. Are other security controls in place?
4. Is the severity accurate?

Respond with JSON only:
{
  "verdict": "confirmed" | "rejected",
  "severity": "critical|high|medium|low|info (optional, only if it should change)",
  "confidence": 0.9,
  "reasoning": "Why this is or is not a real vulnerability"
}"#;

pub fn validation_prompt(finding: &Finding, unit: &ReviewUnit) -> Prompt {
    let reported = serde_json::json!({
        "issue": finding.issue,
        "severity": finding.severity,
        "confidence": finding.confidence.score,
        "reasoning": finding.reasoning,
        "code_snippet": finding.code_snippet,
        "line_start": finding.line_start,
        "line_end": finding.line_end,
    });
    let user = format!(
        "FILE: {}\nLANGUAGE: {}\n\nCODE (with line numbers):\n{}\n\nREPORTED FINDING:\n{reported:#}\n",
        unit.path,
        unit.language,
        number_lines(&unit.text, unit.start_line)
    );
    Prompt::new(VALIDATION_SYSTEM, user)
}

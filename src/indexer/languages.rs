use tree_sitter::Language;

/// Language tag for a file extension (without the dot, lowercase).
pub fn language_for_extension(ext: &str) -> Option<&'static str> {
    let lang = match ext {
        "c" | "h" => "c",
        "cpp" | "cc" | "cxx" | "hpp" | "hh" => "cpp",
        "py" => "python",
        "rs" => "rust",
        "go" => "go",
        "php" => "php",
        "java" => "java",
        "dart" => "dart",
        "js" | "jsx" | "mjs" | "cjs" => "javascript",
        "ts" | "tsx" => "typescript",
        "rb" | "rake" => "ruby",
        _ => return None,
    };
    Some(lang)
}

/// Grammar and top-level declaration query for languages with structural
/// parsing support.
pub struct LanguageConfig {
    pub name: &'static str,
    pub language: Language,
    pub query: &'static str,
}

impl LanguageConfig {
    pub fn get_all() -> Vec<LanguageConfig> {
        vec![
            go_config(),
            python_config(),
            typescript_config(),
            javascript_config(),
            rust_config(),
        ]
    }

    pub fn get_by_name(name: &str) -> Option<LanguageConfig> {
        Self::get_all().into_iter().find(|c| c.name == name)
    }
}

fn go_config() -> LanguageConfig {
    LanguageConfig {
        name: "go",
        language: tree_sitter_go::LANGUAGE.into(),
        query: r#"
(function_declaration
  name: (identifier) @name) @function

(method_declaration
  name: (field_identifier) @name) @method

(type_declaration
  (type_spec
    name: (type_identifier) @name
    type: (struct_type))) @struct

(type_declaration
  (type_spec
    name: (type_identifier) @name
    type: (interface_type))) @interface
"#,
    }
}

fn python_config() -> LanguageConfig {
    LanguageConfig {
        name: "python",
        language: tree_sitter_python::LANGUAGE.into(),
        query: r#"
(function_definition
  name: (identifier) @name) @function

(class_definition
  name: (identifier) @name) @class
"#,
    }
}

fn typescript_config() -> LanguageConfig {
    LanguageConfig {
        name: "typescript",
        language: tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into(),
        query: r#"
(function_declaration
  name: (identifier) @name) @function

(lexical_declaration
  (variable_declarator
    name: (identifier) @name
    value: (arrow_function))) @function

(class_declaration
  name: (type_identifier) @name) @class

(interface_declaration
  name: (type_identifier) @name) @interface

(method_definition
  name: (property_identifier) @name) @method
"#,
    }
}

fn javascript_config() -> LanguageConfig {
    LanguageConfig {
        name: "javascript",
        language: tree_sitter_javascript::LANGUAGE.into(),
        query: r#"
(function_declaration
  name: (identifier) @name) @function

(lexical_declaration
  (variable_declarator
    name: (identifier) @name
    value: (arrow_function))) @function

(class_declaration
  name: (identifier) @name) @class

(method_definition
  name: (property_identifier) @name) @method
"#,
    }
}

fn rust_config() -> LanguageConfig {
    LanguageConfig {
        name: "rust",
        language: tree_sitter_rust::LANGUAGE.into(),
        query: r#"
(function_item
  name: (identifier) @name) @function

(impl_item
  type: (type_identifier) @name) @struct

(struct_item
  name: (type_identifier) @name) @struct

(enum_item
  name: (type_identifier) @name) @struct

(trait_item
  name: (type_identifier) @name) @interface

(mod_item
  name: (identifier) @name) @function
"#,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extension_table() {
        assert_eq!(language_for_extension("py"), Some("python"));
        assert_eq!(language_for_extension("tsx"), Some("typescript"));
        assert_eq!(language_for_extension("hh"), Some("cpp"));
        assert_eq!(language_for_extension("rake"), Some("ruby"));
        assert_eq!(language_for_extension("md"), None);
    }

    #[test]
    fn test_queries_compile() {
        for config in LanguageConfig::get_all() {
            tree_sitter::Query::new(&config.language, config.query)
                .unwrap_or_else(|e| panic!("{}: {e}", config.name));
        }
        assert!(LanguageConfig::get_by_name("php").is_none());
    }
}

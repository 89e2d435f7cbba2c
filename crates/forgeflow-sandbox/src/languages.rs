/// A language the execution service can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LanguageSpec {
    /// Identifier sent to the service.
    pub id: &'static str,
    /// Fence tags and common spellings that map to this language.
    pub aliases: &'static [&'static str],
    /// File name submitted with the source.
    pub file_name: &'static str,
}

pub const LANGUAGES: &[LanguageSpec] = &[
    LanguageSpec {
        id: "python",
        aliases: &["python", "py", "python3"],
        file_name: "main.py",
    },
    LanguageSpec {
        id: "javascript",
        aliases: &["javascript", "js", "node", "mjs"],
        file_name: "main.js",
    },
    LanguageSpec {
        id: "typescript",
        aliases: &["typescript", "ts"],
        file_name: "main.ts",
    },
    LanguageSpec {
        id: "rust",
        aliases: &["rust", "rs"],
        file_name: "main.rs",
    },
    LanguageSpec {
        id: "go",
        aliases: &["go", "golang"],
        file_name: "main.go",
    },
    LanguageSpec {
        id: "java",
        aliases: &["java"],
        file_name: "Main.java",
    },
    LanguageSpec {
        id: "c",
        aliases: &["c"],
        file_name: "main.c",
    },
    LanguageSpec {
        id: "c++",
        aliases: &["c++", "cpp", "cxx"],
        file_name: "main.cpp",
    },
    LanguageSpec {
        id: "bash",
        aliases: &["bash", "sh", "shell", "zsh"],
        file_name: "main.sh",
    },
    LanguageSpec {
        id: "ruby",
        aliases: &["ruby", "rb"],
        file_name: "main.rb",
    },
];

/// Map a fence tag or language name to the service's identifier.
pub fn normalize_language(tag: &str) -> Option<&'static str> {
    let tag = tag.trim().to_ascii_lowercase();
    LANGUAGES
        .iter()
        .find(|l| l.aliases.contains(&tag.as_str()))
        .map(|l| l.id)
}

/// File name the service expects for `language` (any alias accepted).
pub fn file_name_for(language: &str) -> Option<&'static str> {
    let id = normalize_language(language)?;
    LANGUAGES.iter().find(|l| l.id == id).map(|l| l.file_name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_aliases() {
        assert_eq!(normalize_language("py"), Some("python"));
        assert_eq!(normalize_language("TS"), Some("typescript"));
        assert_eq!(normalize_language("cpp"), Some("c++"));
        assert_eq!(normalize_language("sh"), Some("bash"));
        assert_eq!(normalize_language("json"), None);
        assert_eq!(normalize_language(""), None);
    }

    #[test]
    fn test_file_names() {
        assert_eq!(file_name_for("java"), Some("Main.java"));
        assert_eq!(file_name_for("rs"), Some("main.rs"));
        assert_eq!(file_name_for("yaml"), None);
    }

    #[test]
    fn test_ids_are_their_own_alias() {
        for lang in LANGUAGES {
            assert_eq!(normalize_language(lang.id), Some(lang.id));
        }
    }
}

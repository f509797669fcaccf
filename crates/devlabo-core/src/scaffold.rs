//! Starter files for modules that have no `index.html` after the initial pull.

use crate::shared::Module;
use std::path::Path;

fn page(title: &str, body: &str) -> String {
    format!(
        "<!DOCTYPE html>\n<html lang=\"en\">\n<head>\n    <meta charset=\"UTF-8\">\n    \
         <meta name=\"viewport\" content=\"width=device-width, initial-scale=1.0\">\n    \
         <title>{title}</title>\n</head>\n<body>\n{body}\n</body>\n</html>\n"
    )
}

/// Module-relative paths and contents seeded into an empty module.
pub fn scaffold_files(module: Module) -> Vec<(&'static str, String)> {
    match module {
        Module::Prototype => vec![(
            "index.html",
            page(
                "DevLabo Prototype",
                "    <h1>Hello World</h1>\n    <p>Edit this file to start building your prototype.</p>",
            ),
        )],
        Module::Frontend => vec![
            (
                "index.html",
                page(
                    "DevLabo Frontend",
                    "    <div id=\"app\"></div>\n    <script type=\"module\" src=\"src/main.js\"></script>",
                ),
            ),
            (
                "src/main.js",
                "// Frontend entry point\ndocument.getElementById('app').innerHTML = '<h1>Frontend Ready</h1>';\n"
                    .to_string(),
            ),
        ],
        Module::Dbml => vec![(
            "index.html",
            page(
                "DBML Schema",
                "    <h1>Database Schema</h1>\n    <p>The schema view appears here once a .dbml file is generated.</p>",
            ),
        )],
        Module::Tests => vec![(
            "index.html",
            page(
                "Test Runner",
                "    <h1>Test Runner</h1>\n    <p>Generated test cases are listed here.</p>",
            ),
        )],
    }
}

/// Scaffold entries to write for `module`: none when the module already has an
/// `index.html`, otherwise every starter file that does not exist yet.
pub fn missing_scaffold(module_root: &Path, module: Module) -> Vec<(&'static str, String)> {
    if module_root.join("index.html").exists() {
        return Vec::new();
    }
    scaffold_files(module)
        .into_iter()
        .filter(|(rel, _)| !module_root.join(rel).exists())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_module_gets_an_index() {
        for module in Module::ALL {
            let files = scaffold_files(module);
            assert!(files.iter().any(|(p, c)| *p == "index.html" && c.starts_with("<!DOCTYPE html>")));
        }
        assert_eq!(scaffold_files(Module::Frontend).len(), 2);
    }

    #[test]
    fn existing_index_suppresses_scaffold() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(missing_scaffold(dir.path(), Module::Frontend).len(), 2);

        std::fs::write(dir.path().join("index.html"), "<p>pulled</p>").unwrap();
        assert!(missing_scaffold(dir.path(), Module::Frontend).is_empty());
    }
}

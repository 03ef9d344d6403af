// Front end for the C subset accepted by the in-process compiler. Source text is first run
// through the lexer, which also applies object-like macros, conditional compilation and the
// defines passed in CompileOptions. The parser then builds a fully typed translation unit in
// the caller's arena. Errors from either phase come back as located diagnostics; warnings
// from both phases are merged in source order of the phases.

//! C subset front end.

pub mod ast;
pub mod lexer;
pub mod parser;
pub mod types;

use bumpalo::Bump;

use crate::core::diagnostic::Diagnostic;
use ast::TranslationUnit;

/// Preprocess and parse `source`, returning the unit and its warnings.
pub fn parse_source<'a>(
    arena: &'a Bump,
    source: &str,
    defines: &[(String, String)],
) -> Result<(TranslationUnit<'a>, Vec<Diagnostic>), Vec<Diagnostic>> {
    let preprocessed = lexer::tokenize(source, defines)?;
    log::trace!("{} tokens after preprocessing", preprocessed.tokens.len());
    let (unit, parse_warnings) = parser::parse(arena, preprocessed.tokens)?;
    let mut warnings = preprocessed.warnings;
    warnings.extend(parse_warnings);
    Ok((unit, warnings))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defines_reach_parser() {
        let arena = Bump::new();
        let defines = vec![("DLL_IMPORT_DATA".to_string(), "extern".to_string())];
        let (unit, warnings) = parse_source(
            &arena,
            "DLL_IMPORT_DATA const char hello[];\nint f(void) { return hello[0]; }",
            &defines,
        )
        .unwrap();
        assert!(warnings.is_empty());
        assert!(!unit.symbol("hello").unwrap().defined);
    }

    #[test]
    fn test_preprocessor_warning_is_kept() {
        let arena = Bump::new();
        let (_, warnings) =
            parse_source(&arena, "#include <stdio.h>\nint x;", &[]).unwrap();
        assert_eq!(warnings.len(), 1);
    }
}
